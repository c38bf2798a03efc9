//! Generic webhook destination. The body is a minijinja template rendered against the
//! comment.

use std::time::Duration;

use async_trait::async_trait;
use domains::{Destination, NotifyRequest, VerificationRequest};
use minijinja::{Environment, Value};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::debug;

pub const DEFAULT_TEMPLATE: &str = r#"{"text": {{ text | tojson }}}"#;

pub struct WebhookDestination {
    http: reqwest::Client,
    url: String,
    template: String,
    env: Environment<'static>,
}

/// Parses `Name:Value` pairs.
fn header_map(headers: &[String]) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for h in headers {
        let Some((name, value)) = h.split_once(':') else {
            anyhow::bail!("invalid webhook header {h:?}, expected Name:Value");
        };
        map.insert(HeaderName::from_bytes(name.trim().as_bytes())?, HeaderValue::from_str(value.trim())?);
    }
    Ok(map)
}

impl WebhookDestination {
    /// Fails on an unparsable template or header.
    pub fn new(url: impl Into<String>, template: Option<String>, headers: &[String], timeout: Duration) -> anyhow::Result<Self> {
        let template = template.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        let env = Environment::new();
        env.template_from_str(&template)?;
        let http = reqwest::Client::builder().timeout(timeout).default_headers(header_map(headers)?).build()?;
        Ok(Self { http, url: url.into(), template, env })
    }

    pub fn render(&self, request: &NotifyRequest) -> anyhow::Result<String> {
        Ok(self.env.render_str(&self.template, Value::from_serialize(&request.comment))?)
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    async fn send(&self, request: &NotifyRequest) -> anyhow::Result<()> {
        let body = self.render(request)?;
        let resp = self.http.post(&self.url).body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook {} returned {status}: {text}", self.url);
        }
        debug!(url = %self.url, id = %request.comment.id, "webhook notification sent");
        Ok(())
    }

    async fn send_verification(&self, _request: &VerificationRequest) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        format!("webhook: {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{Comment, Locator, User};
    use wiremock::matchers::{body_string, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(text: &str) -> NotifyRequest {
        NotifyRequest {
            comment: Comment {
                id: "c1".into(),
                text: text.into(),
                user: User { name: "Bob".into(), ..Default::default() },
                locator: Locator::new("site", "https://example.com/p"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn default_template_escapes_json() {
        let dest = WebhookDestination::new("http://localhost", None, &[], Duration::from_secs(1)).unwrap();
        let body = dest.render(&request("say \"hi\"\n")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["text"], "say \"hi\"\n");
    }

    #[test]
    fn custom_template_and_validation() {
        let dest = WebhookDestination::new(
            "http://localhost",
            Some("{{ user.name }} on {{ locator.url }}".into()),
            &[],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(dest.render(&request("x")).unwrap(), "Bob on https://example.com/p");

        assert!(WebhookDestination::new("http://localhost", Some("{{ broken".into()), &[], Duration::from_secs(1)).is_err());
        assert!(WebhookDestination::new("http://localhost", None, &["no-colon".into()], Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn posts_rendered_body_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "secret"))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"{"text": "hello"}"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dest = WebhookDestination::new(server.uri(), None, &["X-Api-Key: secret".into()], Duration::from_secs(5)).unwrap();
        dest.send(&request("hello")).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        let dest = WebhookDestination::new(server.uri(), None, &[], Duration::from_secs(5)).unwrap();
        assert!(dest.send(&request("hello")).await.is_err());
    }
}
