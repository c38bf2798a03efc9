//! # Image proxy
//!
//! Rewrites insecure `<img src="http://...">` references in rendered comments to
//! `<remark_url>/api/v1/img?src=<base64url>` and serves those images from here.
//! Hosts resolving to private networks are refused, on every redirect hop and at
//! connect time through the client's resolver.

use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::{Attempt, Policy};
use services::CommentConverter;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::ApiError;
use crate::handlers::Params;
use crate::state::AppState;

pub const IMAGE_ROUTE: &str = "/api/v1/img";
pub const DEFAULT_RETRIES: usize = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_REDIRECTS: usize = 5;

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<img\b[^>]*?\bsrc=")(http://[^"]+)(")"#).expect("valid regex"));

/// True for addresses the proxy must never fetch from.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_link_local()
        // shared address space, 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
        // benchmarking, 198.18.0.0/15
        || (a == 198 && (b == 18 || b == 19))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();
    (s[0] & 0xfe00) == 0xfc00 || (s[0] & 0xffc0) == 0xfe80 || (s[0] == 0x2001 && s[1] == 0x0db8)
}

#[derive(Debug, Error)]
#[error("{0} resolves to a private address")]
pub struct PrivateAddress(pub String);

/// Resolves names for the proxy client and refuses private answers, so the
/// connection goes to the addresses that were checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicResolver;

impl Resolve for PublicResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_public(name.as_str().to_string()))
    }
}

async fn resolve_public(host: String) -> Result<Addrs, Box<dyn StdError + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
    if addrs.is_empty() || addrs.iter().any(|a| is_private(a.ip())) {
        return Err(Box::new(PrivateAddress(host)));
    }
    Ok(Box::new(addrs.into_iter()))
}

/// Follows at most [`MAX_REDIRECTS`] hops, never to a private address literal.
/// Names are left to [`PublicResolver`].
fn redirect_policy() -> Policy {
    Policy::custom(|attempt: Attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let target = attempt.url().clone();
        let refused = !matches!(target.scheme(), "http" | "https")
            || match target.host() {
                Some(Host::Ipv4(ip)) => is_private(IpAddr::V4(ip)),
                Some(Host::Ipv6(ip)) => is_private(IpAddr::V6(ip)),
                Some(Host::Domain(_)) => false,
                None => true,
            };
        if refused {
            attempt.error(format!("redirect to {target} refused"))
        } else {
            attempt.follow()
        }
    })
}

/// True when the request was stopped by the address checks.
fn is_refusal(err: &reqwest::Error) -> bool {
    if err.is_redirect() {
        return true;
    }
    let mut source = err.source();
    while let Some(e) = source {
        if e.downcast_ref::<PrivateAddress>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

pub struct ImageProxy {
    http: reqwest::Client,
    remark_url: String,
    retries: usize,
    retry_delay: Duration,
}

impl ImageProxy {
    pub fn new(remark_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy())
            .dns_resolver(std::sync::Arc::new(PublicResolver))
            .build()?;
        Ok(Self {
            http,
            remark_url: remark_url.into().trim_end_matches('/').to_string(),
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    pub fn with_retries(mut self, retries: usize, delay: Duration) -> Self {
        self.retries = retries.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn proxied_url(&self, src: &str) -> String {
        format!("{}{IMAGE_ROUTE}?src={}", self.remark_url, URL_SAFE_NO_PAD.encode(src))
    }

    /// Original URL of an encoded `src` parameter.
    pub fn decode_src(encoded: &str) -> Result<String, ApiError> {
        let raw = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).map_err(ApiError::decode)?;
        String::from_utf8(raw).map_err(ApiError::decode)
    }

    pub fn etag(src: &str) -> String {
        format!("\"{}\"", hex::encode(Sha1::digest(src.as_bytes())))
    }

    async fn check_host(url: &Url) -> Result<(), ApiError> {
        let host = url.host_str().ok_or_else(|| ApiError::BadRequest(format!("no host in {url}")))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| ApiError::BadRequest(format!("can't resolve {host}, {e}")))?
                .map(|a| a.ip())
                .collect(),
        };
        if addrs.is_empty() || addrs.iter().copied().any(is_private) {
            return Err(ApiError::BadRequest(format!("{host} resolves to a private address")));
        }
        Ok(())
    }

    /// Fetches `src`, retrying transport failures and server errors.
    pub async fn fetch(&self, src: &str) -> Result<(HeaderMap, Bytes), ApiError> {
        let url = Url::parse(src).map_err(ApiError::decode)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ApiError::BadRequest(format!("unsupported scheme {}", url.scheme())));
        }
        Self::check_host(&url).await?;

        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.http.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let mut headers = HeaderMap::new();
                    if let Some(ct) = resp.headers().get(CONTENT_TYPE) {
                        headers.insert(CONTENT_TYPE, ct.clone());
                    }
                    let data = resp.bytes().await.map_err(|e| ApiError::Internal(e.into()))?;
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
                    debug!(src, size = data.len(), "image proxied");
                    return Ok((headers, data));
                }
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(ApiError::NotFound(format!("image {src}")));
                }
                Ok(resp) => last_error = format!("status {}", resp.status()),
                Err(e) if is_refusal(&e) => {
                    warn!("image {src} refused, {e:#}");
                    return Err(ApiError::BadRequest(format!("image {src} points to a private address")));
                }
                Err(e) => last_error = e.to_string(),
            }
            debug!(src, attempt, "image fetch failed, {last_error}");
        }
        warn!("can't fetch image {src} after {} attempts, {last_error}", self.retries);
        Err(ApiError::Internal(anyhow::anyhow!("can't fetch image {src}, {last_error}")))
    }
}

impl CommentConverter for ImageProxy {
    fn convert(&self, text: &str) -> String {
        IMG_SRC
            .replace_all(text, |caps: &Captures| format!("{}{}{}", &caps[1], self.proxied_url(&caps[2]), &caps[3]))
            .into_owned()
    }
}

/// `GET /api/v1/img?src=<base64url>`
pub async fn serve(State(state): State<AppState>, params: Params, headers: HeaderMap) -> Result<Response, ApiError> {
    let Some(proxy) = &state.images else {
        return Err(ApiError::NotFound("image proxy".into()));
    };
    let src = ImageProxy::decode_src(params.require("src")?)?;
    let etag = ImageProxy::etag(&src);
    if headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let (mut out, data) = proxy.fetch(&src).await?;
    if let Ok(v) = HeaderValue::from_str(&etag) {
        out.insert(ETAG, v);
    }
    Ok((out, data).into_response())
}
