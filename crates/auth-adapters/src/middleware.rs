//! # Auth middleware
//!
//! `auth` rejects anonymous requests, `trace` lets them through, `admin_only` must run
//! after one of them. An expired session is refreshed against the current admin,
//! verified and blocked state before the request continues.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use domains::User;
use services::DataService;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::token::{Claims, TokenService};

pub const DEV_USER_ID: &str = "dev";

/// The authenticated user, injected into request extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser(pub User);

/// The authenticated user, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct MaybeUser(pub Option<User>);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthUser>().cloned().ok_or(AuthError::NoToken)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(parts.extensions.get::<AuthUser>().map(|u| u.0.clone())))
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub tokens: Arc<TokenService>,
    pub data: Arc<DataService>,
    /// Enables `dev:<password>` basic auth; development only.
    pub dev_passwd: Option<String>,
}

fn dev_user() -> User {
    User {
        id: DEV_USER_ID.to_string(),
        name: "developer one".to_string(),
        admin: true,
        ..Default::default()
    }
}

fn is_dev_login(headers: &HeaderMap, dev_passwd: Option<&str>) -> bool {
    let Some(passwd) = dev_passwd.filter(|p| !p.is_empty()) else {
        return false;
    };
    let Some(encoded) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    decoded == format!("dev:{passwd}").as_bytes()
}

pub async fn auth(State(state): State<AuthState>, request: Request, next: Next) -> Response {
    authenticate(&state, true, request, next).await
}

pub async fn trace(State(state): State<AuthState>, request: Request, next: Next) -> Response {
    authenticate(&state, false, request, next).await
}

pub async fn admin_only(request: Request, next: Next) -> Response {
    match request.extensions().get::<AuthUser>() {
        Some(AuthUser(user)) if user.admin => next.run(request).await,
        Some(_) => AuthError::AdminOnly.into_response(),
        None => AuthError::NoToken.into_response(),
    }
}

/// Outcome of reading the request credentials.
enum Identity {
    Anonymous,
    /// Credentials were present but bad; cookies must be cleared.
    Rejected(AuthError),
    User { user: User, refreshed: Option<Claims> },
}

async fn identify(state: &AuthState, headers: &HeaderMap) -> Identity {
    if is_dev_login(headers, state.dev_passwd.as_deref()) {
        return Identity::User { user: dev_user(), refreshed: None };
    }
    let claims = match state.tokens.get(headers) {
        Ok((claims, _)) => claims,
        Err(AuthError::NoToken) => return Identity::Anonymous,
        Err(e) => return Identity::Rejected(e),
    };
    let Some(mut user) = claims.user.clone() else {
        return Identity::Anonymous;
    };
    if !claims.flags.is_empty() {
        return Identity::Rejected(AuthError::Malformed("one-shot token used as a session".into()));
    }
    // blocked users are known, so they get 403 UserBlocked rather than 401
    if user.blocked {
        return Identity::Rejected(AuthError::Blocked(user.id));
    }
    if !state.tokens.is_expired(&claims) {
        return Identity::User { user, refreshed: None };
    }

    let site = claims.audience.clone();
    user.admin = state.data.is_admin(&site, &user.id).await;
    user.verified = state.data.is_verified(&site, &user.id).await;
    user.blocked = state.data.is_blocked(&site, &user.id).await;
    if user.blocked {
        return Identity::Rejected(AuthError::Blocked(user.id));
    }
    let refreshed = Claims {
        user: Some(user.clone()),
        expires_at: (Utc::now() + state.tokens.params().token_duration).timestamp(),
        ..claims
    };
    debug!(user = %user.id, site, "session refreshed");
    Identity::User { user, refreshed: Some(refreshed) }
}

async fn authenticate(state: &AuthState, require: bool, mut request: Request, next: Next) -> Response {
    let identity = identify(state, request.headers()).await;
    match identity {
        Identity::User { user, refreshed } => {
            let mut cookies = HeaderMap::new();
            if let Some(claims) = refreshed {
                if let Err(e) = state.tokens.set(&mut cookies, claims) {
                    warn!("can't refresh token for {}, {e}", user.id);
                    let mut resp = e.into_response();
                    state.tokens.reset(resp.headers_mut());
                    return resp;
                }
            }
            request.extensions_mut().insert(AuthUser(user));
            let mut resp = next.run(request).await;
            resp.headers_mut().extend(cookies);
            resp
        }
        Identity::Anonymous if require => AuthError::NoToken.into_response(),
        Identity::Anonymous => next.run(request).await,
        Identity::Rejected(e) => {
            debug!("credentials rejected, {e}");
            let mut resp = if require { e.into_response() } else { next.run(request).await };
            state.tokens.reset(resp.headers_mut());
            resp
        }
    }
}
