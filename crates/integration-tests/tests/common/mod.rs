//! Shared harness: an in-memory server driven through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use api_adapters::{router, AppState};
use auth_adapters::{AuthContext, AuthService, Claims, SiteKeys, TokenParams, TokenService};
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use domains::{Comment, Engine, Locator, User};
use serde_json::Value;
use services::{DataService, DataServiceConfig};
use storage_adapters::{CacheLimits, LoadingCache, MemoryEngine, StaticAdminStore};
use tower::ServiceExt;

pub const SITE: &str = "s";
pub const URL: &str = "u";
pub const DEV_PASSWD: &str = "password";

pub struct TestApp {
    pub router: Router,
    pub engine: Arc<MemoryEngine>,
    pub data: Arc<DataService>,
    pub cache: Arc<LoadingCache>,
    pub tokens: Arc<TokenService>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(DataServiceConfig::default())
    }

    pub fn with_config(config: DataServiceConfig) -> Self {
        let engine = Arc::new(MemoryEngine::new([SITE]));
        let admins = Arc::new(StaticAdminStore::new(HashMap::new(), Vec::new(), "admin@example.com"));
        let cache = Arc::new(LoadingCache::new(CacheLimits::default()));
        let data = Arc::new(DataService::new(engine.clone(), admins, config).with_flusher(cache.clone()));

        let keys = Arc::new(SiteKeys::new("integration-secret", vec![SITE.to_string()]));
        let tokens = Arc::new(TokenService::new(keys, TokenParams::default()));
        let auth = Arc::new(AuthService::new(AuthContext::new(tokens.clone(), data.clone(), "http://localhost:8080")));
        let state = AppState::new(data.clone(), cache.clone(), auth).with_dev_passwd(DEV_PASSWD);
        Self { router: router(state), engine, data, cache, tokens }
    }

    /// Sends a request, signed in as the `dev` admin when `dev` is set.
    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>, dev: bool) -> (StatusCode, Value) {
        let auth = dev.then(|| {
            let creds = base64::engine::general_purpose::STANDARD.encode(format!("dev:{DEV_PASSWD}"));
            (header::AUTHORIZATION.as_str(), format!("Basic {creds}"))
        });
        self.request(method, uri, body, auth).await
    }

    /// Sends a request with a session token of a regular user.
    pub async fn send_as(&self, user_id: &str, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let claims = Claims {
            audience: SITE.to_string(),
            id: format!("session-{user_id}"),
            expires_at: (Utc::now() + chrono::Duration::minutes(5)).timestamp(),
            user: Some(User { id: user_id.to_string(), name: user_id.to_string(), ..Default::default() }),
            ..Default::default()
        };
        let token = self.tokens.token(&claims).unwrap();
        self.request(method, uri, body, Some(("X-JWT", token))).await
    }

    /// Sends a request carrying `token` in `X-JWT`.
    pub async fn request_with_jwt(&self, token: &str, method: Method, uri: &str) -> (StatusCode, Value) {
        self.request(method, uri, None, Some(("X-JWT", token.to_string()))).await
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        auth: Option<(&str, String)>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri).header("x-real-ip", "192.0.2.10");
        if let Some((name, value)) = auth {
            req = req.header(name, value);
        }
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = self.router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Stores a comment as is, bypassing validation and timestamps.
    pub async fn seed(&self, comment: Comment) -> String {
        self.engine.create(&comment).await.unwrap()
    }
}

pub fn comment(id: &str, user: &str, timestamp: DateTime<Utc>) -> Comment {
    Comment {
        id: id.to_string(),
        orig: format!("comment {id}"),
        text: format!("<p>comment {id}</p>\n"),
        locator: Locator::new(SITE, URL),
        user: User { id: user.to_string(), name: user.to_string(), ..Default::default() },
        timestamp,
        ..Default::default()
    }
}

pub fn find_uri() -> String {
    format!("/api/v1/find?site={SITE}&url={URL}")
}
