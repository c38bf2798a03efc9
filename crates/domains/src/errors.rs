//! # AppError
//!
//! Centralized error handling for the comment engine.
//! Every variant maps to one stable [`ErrorCode`] that clients see in the `code` field.

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Stable numeric error kinds exposed to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    InternalError = 0,
    Decode = 1,
    NoAccess = 2,
    UserBlocked = 3,
    ReadOnly = 4,
    CommentNotFound = 5,
    CommentValidation = 6,
    CommentEditExpired = 7,
    CommentEditChanged = 8,
    CommentRejected = 9,
    VoteRejected = 10,
    VoteSelf = 11,
    VoteDbl = 12,
    VoteMax = 13,
    VoteMinScore = 14,
    SiteNotFound = 15,
    PostNotFound = 16,
    AssetNotFound = 17,
    ActionRejected = 18,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Machine-readable name used in the `error` field.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "internal error",
            ErrorCode::Decode => "failed to decode request",
            ErrorCode::NoAccess => "no access",
            ErrorCode::UserBlocked => "user blocked",
            ErrorCode::ReadOnly => "read-only",
            ErrorCode::CommentNotFound => "comment not found",
            ErrorCode::CommentValidation => "comment validation failed",
            ErrorCode::CommentEditExpired => "comment edit expired",
            ErrorCode::CommentEditChanged => "comment changed",
            ErrorCode::CommentRejected => "comment rejected",
            ErrorCode::VoteRejected => "vote rejected",
            ErrorCode::VoteSelf => "vote for own comment",
            ErrorCode::VoteDbl => "double vote",
            ErrorCode::VoteMax => "too many votes",
            ErrorCode::VoteMinScore => "minimal score reached",
            ErrorCode::SiteNotFound => "site not found",
            ErrorCode::PostNotFound => "post not found",
            ErrorCode::AssetNotFound => "asset not found",
            ErrorCode::ActionRejected => "action rejected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

/// The primary error type for all service operations.
#[derive(Error, Debug)]
pub enum AppError {
    /// Infrastructure failure (storage down, remote call failed)
    #[error("internal service error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("can't decode request: {0}")]
    Decode(String),

    #[error("no access: {0}")]
    NoAccess(String),

    #[error("user {0} is blocked")]
    UserBlocked(String),

    #[error("post {0} is read-only")]
    ReadOnly(String),

    #[error("comment {0} not found")]
    CommentNotFound(String),

    /// Malformed or oversized comment
    #[error("invalid comment: {0}")]
    Validation(String),

    #[error("too late to edit comment {0}")]
    EditExpired(String),

    #[error("comment {0} has replies and can't be changed")]
    EditChanged(String),

    /// Restricted words and similar content policies
    #[error("comment rejected: {0}")]
    Rejected(String),

    #[error("vote rejected: {0}")]
    VoteRejected(String),

    #[error("can't vote for own comment")]
    VoteSelf,

    #[error("already voted for comment {0}")]
    VoteDouble(String),

    #[error("maximum number of votes ({0}) reached")]
    VoteMax(usize),

    #[error("minimal score {0} reached")]
    VoteMinScore(i64),

    #[error("site {0} not found")]
    SiteNotFound(String),

    #[error("post {0} not found")]
    PostNotFound(String),

    #[error("asset {0} not found")]
    AssetNotFound(String),

    #[error("action rejected: {0}")]
    ActionRejected(String),
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Internal(_) => ErrorCode::InternalError,
            AppError::Decode(_) => ErrorCode::Decode,
            AppError::NoAccess(_) => ErrorCode::NoAccess,
            AppError::UserBlocked(_) => ErrorCode::UserBlocked,
            AppError::ReadOnly(_) => ErrorCode::ReadOnly,
            AppError::CommentNotFound(_) => ErrorCode::CommentNotFound,
            AppError::Validation(_) => ErrorCode::CommentValidation,
            AppError::EditExpired(_) => ErrorCode::CommentEditExpired,
            AppError::EditChanged(_) => ErrorCode::CommentEditChanged,
            AppError::Rejected(_) => ErrorCode::CommentRejected,
            AppError::VoteRejected(_) => ErrorCode::VoteRejected,
            AppError::VoteSelf => ErrorCode::VoteSelf,
            AppError::VoteDouble(_) => ErrorCode::VoteDbl,
            AppError::VoteMax(_) => ErrorCode::VoteMax,
            AppError::VoteMinScore(_) => ErrorCode::VoteMinScore,
            AppError::SiteNotFound(_) => ErrorCode::SiteNotFound,
            AppError::PostNotFound(_) => ErrorCode::PostNotFound,
            AppError::AssetNotFound(_) => ErrorCode::AssetNotFound,
            AppError::ActionRejected(_) => ErrorCode::ActionRejected,
        }
    }
}

/// Errors a storage engine reports that the service layer knows how to classify.
/// Engines wrap these in `anyhow::Error`; anything else is treated as internal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("comment {id} not found in {locator}")]
    NotFound { locator: String, id: String },

    #[error("parent comment {0} not found")]
    ParentNotFound(String),

    #[error("site {0} not found")]
    SiteNotFound(String),
}

impl AppError {
    /// Maps an engine failure to the service error space.
    pub fn from_engine(err: anyhow::Error) -> AppError {
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::NotFound { id, .. }) => AppError::CommentNotFound(id.clone()),
            Some(EngineError::ParentNotFound(id)) => {
                AppError::Validation(format!("parent comment {id} not found"))
            }
            Some(EngineError::SiteNotFound(site)) => AppError::SiteNotFound(site.clone()),
            None => AppError::Internal(err),
        }
    }
}

/// JSON error payload `{"code", "details", "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    /// User-facing summary.
    pub details: String,
    /// Underlying cause, for logs and developers.
    pub error: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, details: impl Into<String>, error: impl fmt::Display) -> Self {
        Self { code, details: details.into(), error: error.to_string() }
    }
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        ErrorBody::new(err.code(), err.code().name(), err)
    }
}

/// A specialized Result type for service logic.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_are_classified() {
        let err = anyhow::Error::new(EngineError::NotFound { locator: "s:u".into(), id: "42".into() });
        assert_eq!(AppError::from_engine(err).code(), ErrorCode::CommentNotFound);

        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(AppError::from_engine(err).code(), ErrorCode::InternalError);
    }

    #[test]
    fn error_body_shape() {
        let body = ErrorBody::from(&AppError::VoteDouble("c1".into()));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"code": 12, "details": "double vote", "error": "already voted for comment c1"})
        );
    }

    #[test]
    fn codes_serialize_as_numbers() {
        assert_eq!(serde_json::to_string(&ErrorCode::VoteDbl).unwrap(), "12");
    }
}
