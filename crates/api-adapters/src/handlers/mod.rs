//! Handlers of `/api/v1`, grouped by the middleware they run behind.

pub mod admin;
pub mod feeds;
pub mod media;
pub mod private;
pub mod public;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;

use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use domains::{Comment, Locator, Sort, User};
use serde::de::DeserializeOwned;
use services::{DataService, Node, Tree};

use crate::error::ApiError;

/// Query string of a request. Empty values count as absent.
#[derive(Debug, Clone, Default)]
pub struct Params(HashMap<String, String>);

impl<S: Send + Sync> FromRequestParts<S> for Params {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Params::parse(parts.uri.query().unwrap_or_default()))
    }
}

impl Params {
    pub fn parse(query: &str) -> Self {
        Params(url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn require(&self, name: &str) -> Result<&str, ApiError> {
        self.get(name).ok_or_else(|| ApiError::BadRequest(format!("missing {name}")))
    }

    pub fn site(&self) -> Result<&str, ApiError> {
        self.require("site")
    }

    pub fn locator(&self) -> Result<Locator, ApiError> {
        Ok(Locator::new(self.site()?, self.require("url")?))
    }

    /// `1` and `true` are set, anything else is not.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some("1" | "true"))
    }

    pub fn number<T: FromStr>(&self, name: &str, default: T) -> Result<T, ApiError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ApiError::BadRequest(format!("bad {name} {v:?}"))),
        }
    }

    pub fn sort(&self) -> Result<Sort, ApiError> {
        self.0.get("sort").map_or(Ok(Sort::default()), |s| Sort::from_str(s).map_err(ApiError::BadRequest))
    }

    /// `since` as unix milliseconds.
    pub fn since(&self) -> Result<Option<DateTime<Utc>>, ApiError> {
        let Some(ms) = self.get("since") else { return Ok(None) };
        let ms: i64 = ms.parse().map_err(|_| ApiError::BadRequest(format!("bad since {ms:?}")))?;
        Utc.timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("since {ms} out of range")))
    }
}

/// Address of the caller as reported by a trusted proxy, or the peer address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<ClientIp>().cloned().unwrap_or_default())
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let real = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next());
    real.or(forwarded).map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

pub async fn client_ip(mut request: Request, next: Next) -> Response {
    let ip = forwarded_ip(request.headers()).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    });
    request.extensions_mut().insert(ClientIp(ip.unwrap_or_default()));
    next.run(request).await
}

pub(crate) fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(ApiError::decode)
}

/// Applies [`DataService::prepare_for_viewer`] to every node of a tree.
pub(crate) async fn prepare_tree(data: &DataService, tree: &mut Tree, viewer: Option<&User>) {
    fn collect(nodes: &[Node], out: &mut Vec<Comment>) {
        for node in nodes {
            out.push(node.comment.clone());
            collect(&node.replies, out);
        }
    }
    fn restore(nodes: &mut [Node], shaped: &mut impl Iterator<Item = Comment>) {
        for node in nodes {
            if let Some(c) = shaped.next() {
                node.comment = c;
            }
            restore(&mut node.replies, shaped);
        }
    }

    let mut flat = Vec::with_capacity(tree.len());
    collect(&tree.nodes, &mut flat);
    data.prepare_for_viewer(&mut flat, viewer).await;
    restore(&mut tree.nodes, &mut flat.into_iter());
}
