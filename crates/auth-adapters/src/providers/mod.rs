//! Identity providers. Every provider runs the same two-step dance: `login` stores the
//! handshake in a short-lived token cookie and sends the browser away, `callback` checks
//! the handshake, builds a [`User`] and starts the session through [`AuthContext`].

pub mod apple;
pub mod oauth1;
pub mod oauth2;
pub mod telegram;
pub mod verify;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use domains::User;
use services::DataService;
use tracing::info;

use crate::avatar::AvatarProxy;
use crate::error::AuthError;
use crate::token::{Claims, Flags, TokenService};

pub const DEFAULT_HANDSHAKE_TTL_MINUTES: i64 = 30;

/// Query (and form body) parameters plus headers of a login or callback request.
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl LoginRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn require(&self, name: &str) -> Result<&str, AuthError> {
        self.param(name).ok_or_else(|| AuthError::BadRequest(format!("missing {name}")))
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn login(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError>;
    async fn callback(&self, ctx: &AuthContext, req: LoginRequest) -> Result<Response, AuthError>;
}

/// Shared collaborators of all providers.
pub struct AuthContext {
    pub tokens: Arc<TokenService>,
    pub data: Arc<DataService>,
    pub avatars: Option<Arc<AvatarProxy>>,
    /// Public base URL, used for callback URLs.
    pub public_url: String,
    pub handshake_ttl: Duration,
}

pub fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn redirect(location: &str) -> Result<Response, AuthError> {
    let value = HeaderValue::from_str(location).map_err(|e| AuthError::BadRequest(e.to_string()))?;
    let mut resp = StatusCode::FOUND.into_response();
    resp.headers_mut().insert(LOCATION, value);
    Ok(resp)
}

impl AuthContext {
    pub fn new(tokens: Arc<TokenService>, data: Arc<DataService>, public_url: impl Into<String>) -> Self {
        Self {
            tokens,
            data,
            avatars: None,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            handshake_ttl: Duration::minutes(DEFAULT_HANDSHAKE_TTL_MINUTES),
        }
    }

    pub fn with_avatars(mut self, avatars: Arc<AvatarProxy>) -> Self {
        self.avatars = Some(avatars);
        self
    }

    pub fn callback_url(&self, provider: &str) -> String {
        format!("{}/auth/{provider}/callback", self.public_url)
    }

    /// Handshake claims for a login request: site, return URL and session mode.
    pub fn handshake(&self, req: &LoginRequest) -> Result<Claims, AuthError> {
        let site = req.require("site")?.to_string();
        Ok(Claims {
            audience: site,
            id: random_id(),
            expires_at: (Utc::now() + self.handshake_ttl).timestamp(),
            from: req.param("from").unwrap_or_default().to_string(),
            session_only: req.param("session") == Some("1"),
            flags: Flags { login: true, ..Default::default() },
            ..Default::default()
        })
    }

    /// Redirects to the provider with the handshake stored in the token cookie.
    pub fn redirect_with_handshake(&self, location: &str, handshake: Claims) -> Result<Response, AuthError> {
        let mut resp = redirect(location)?;
        self.tokens.set(resp.headers_mut(), handshake)?;
        Ok(resp)
    }

    /// The handshake of a callback request; stale or non-handshake tokens are rejected.
    pub fn read_handshake(&self, req: &LoginRequest) -> Result<Claims, AuthError> {
        let (claims, _) = self.tokens.get(&req.headers)?;
        if !claims.flags.login {
            return Err(AuthError::Handshake("not a login token".into()));
        }
        if self.tokens.is_expired(&claims) {
            return Err(AuthError::Handshake("login took too long".into()));
        }
        Ok(claims)
    }

    /// Finishes a login: current flags, local avatar, session cookies, then the redirect
    /// back to `from` or the user as JSON.
    pub async fn finish_login(&self, mut user: User, handshake: &Claims, provider: &str) -> Result<Response, AuthError> {
        let site = handshake.audience.clone();
        user.site_id = site.clone();
        user.admin = self.data.is_admin(&site, &user.id).await;
        user.verified = self.data.is_verified(&site, &user.id).await;
        if self.data.is_blocked(&site, &user.id).await {
            return Err(AuthError::Blocked(user.id));
        }
        if let Some(avatars) = &self.avatars {
            user = avatars.localize(user).await;
        }

        let claims = Claims {
            audience: site.clone(),
            id: random_id(),
            user: Some(user.clone()),
            session_only: handshake.session_only,
            ..Default::default()
        };
        let mut resp = if handshake.from.is_empty() { Json(&user).into_response() } else { redirect(&handshake.from)? };
        self.tokens.set(resp.headers_mut(), claims)?;
        info!(user = %user.id, site, provider, "user logged in");
        Ok(resp)
    }

    pub fn logout(&self) -> Response {
        let mut resp = StatusCode::OK.into_response();
        self.tokens.reset(resp.headers_mut());
        resp
    }
}
