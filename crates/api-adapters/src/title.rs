//! Page titles for new posts, fetched over HTTP and remembered in an LRU.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use domains::TitleExtractor;
use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

pub const DEFAULT_CACHE_SIZE: usize = 1000;

static TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

/// Largest page prefix scanned for a title.
const MAX_BODY: usize = 512 * 1024;

pub struct HttpTitleExtractor {
    http: reqwest::Client,
    known: Mutex<LruCache<String, String>>,
}

impl HttpTitleExtractor {
    pub fn new(timeout: Duration, cache_size: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let cap = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self { http, known: Mutex::new(LruCache::new(cap)) })
    }

    fn remembered(&self, url: &str) -> Option<String> {
        self.known.lock().ok()?.get(url).cloned()
    }

    fn remember(&self, url: &str, title: &str) {
        if let Ok(mut known) = self.known.lock() {
            known.put(url.to_string(), title.to_string());
        }
    }
}

/// Text of the first `<title>` element, entities decoded and whitespace collapsed.
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE.captures(html)?.get(1)?.as_str();
    let decoded = html_escape::decode_html_entities(raw);
    let title = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

#[async_trait]
impl TitleExtractor for HttpTitleExtractor {
    async fn get(&self, url: &str) -> anyhow::Result<String> {
        if let Some(title) = self.remembered(url) {
            return Ok(title);
        }
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let body = resp.bytes().await?;
        let html = String::from_utf8_lossy(&body[..body.len().min(MAX_BODY)]);
        let title = extract_title(&html).ok_or_else(|| anyhow::anyhow!("no title in {url}"))?;
        debug!(url, title, "page title extracted");
        self.remember(url, &title);
        Ok(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_titles() {
        assert_eq!(extract_title("<html><head><TITLE lang=en>\n Rust &amp; you\n</TITLE>").as_deref(), Some("Rust & you"));
        assert_eq!(extract_title("<title>  </title>"), None);
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn titles_are_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><title>First post</title></html>"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let extractor = HttpTitleExtractor::new(Duration::from_secs(5), 10).unwrap();
        let url = format!("{}/post", server.uri());
        assert_eq!(extractor.get(&url).await.unwrap(), "First post");
        assert_eq!(extractor.get(&url).await.unwrap(), "First post");
        assert!(extractor.get(&format!("{}/empty", server.uri())).await.is_err());
    }
}
