use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domains::{ErrorBody, ErrorCode};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token not found")]
    NoToken,

    #[error("can't verify token: {0}")]
    BadToken(#[from] jsonwebtoken::errors::Error),

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("site {0:?} is not allowed")]
    UnknownSite(String),

    #[error("xsrf header doesn't match the token")]
    XsrfMismatch,

    #[error("token expired")]
    Expired,

    #[error("user {0} is blocked")]
    Blocked(String),

    #[error("admin access required")]
    AdminOnly,

    #[error("invalid login handshake: {0}")]
    Handshake(String),

    #[error("unknown auth provider {0:?}")]
    UnknownProvider(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status(&self) -> (StatusCode, ErrorCode) {
        match self {
            AuthError::NoToken
            | AuthError::BadToken(_)
            | AuthError::Malformed(_)
            | AuthError::XsrfMismatch
            | AuthError::Expired
            | AuthError::Handshake(_) => (StatusCode::UNAUTHORIZED, ErrorCode::NoAccess),
            AuthError::UnknownSite(_) => (StatusCode::UNAUTHORIZED, ErrorCode::SiteNotFound),
            AuthError::Blocked(_) => (StatusCode::FORBIDDEN, ErrorCode::UserBlocked),
            AuthError::AdminOnly => (StatusCode::FORBIDDEN, ErrorCode::NoAccess),
            AuthError::UnknownProvider(_) | AuthError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorCode::Decode),
            AuthError::Http(_) | AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            warn!("auth failure, {self}");
        }
        let details = match status {
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::FORBIDDEN => "forbidden",
            _ => code.name(),
        };
        (status, Json(ErrorBody::new(code, details, &self))).into_response()
    }
}
