//! # ApiError
//!
//! Every handler failure ends up here and leaves as `{"code", "details", "error"}`.

use std::sync::Arc;

use auth_adapters::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domains::{AppError, ErrorBody, ErrorCode};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A failed load shared by every caller waiting on the same cache key.
    #[error("{0}")]
    Cached(#[from] Arc<AppError>),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("too many active streams")]
    TooManyStreams,

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        ApiError::App(AppError::Decode(err.to_string()))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::App(e) => e.code(),
            ApiError::Cached(e) => e.code(),
            ApiError::Auth(e) => e.status().1,
            ApiError::BadRequest(_) => ErrorCode::Decode,
            ApiError::NotFound(_) => ErrorCode::AssetNotFound,
            ApiError::TooManyStreams => ErrorCode::ActionRejected,
            ApiError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(e) => e.status().0,
            ApiError::TooManyStreams => StatusCode::TOO_MANY_REQUESTS,
            _ => status_for(self.code()),
        }
    }
}

/// HTTP status of a domain error kind.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::NoAccess | ErrorCode::UserBlocked | ErrorCode::ReadOnly => StatusCode::FORBIDDEN,
        ErrorCode::CommentNotFound | ErrorCode::SiteNotFound | ErrorCode::PostNotFound | ErrorCode::AssetNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::Decode
        | ErrorCode::CommentValidation
        | ErrorCode::CommentEditExpired
        | ErrorCode::CommentEditChanged
        | ErrorCode::CommentRejected
        | ErrorCode::VoteRejected
        | ErrorCode::VoteSelf
        | ErrorCode::VoteDbl
        | ErrorCode::VoteMax
        | ErrorCode::VoteMinScore
        | ErrorCode::ActionRejected => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Auth(e) = self {
            return e.into_response();
        }
        let (status, code) = (self.status(), self.code());
        if status.is_server_error() {
            error!("request failed, {self}");
        } else {
            debug!("request rejected, {self}");
        }
        let details = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            _ => code.name().to_string(),
        };
        (status, Json(ErrorBody::new(code, details, &self))).into_response()
    }
}
