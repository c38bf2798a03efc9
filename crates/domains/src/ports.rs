//! # Core Traits (Ports)
//!
//! Adapters implement these traits; services only ever see the trait objects.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::FlushRequest;
use crate::models::{BlockedUser, Comment, DeleteMode, Locator, PostInfo, UserDetail};
use crate::search::{SearchPage, SearchQuery};

/// Data persistence contract for comments, post meta-data and user flags.
///
/// Engines signal classifiable failures with [`crate::EngineError`] wrapped in the
/// returned `anyhow::Error`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Engine: Send + Sync {
    // Comment Operations
    async fn create(&self, comment: &Comment) -> anyhow::Result<String>;
    async fn get(&self, locator: &Locator, id: &str) -> anyhow::Result<Comment>;
    /// Every comment of a post, deleted ones included, in insertion order.
    async fn find(&self, locator: &Locator, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Comment>>;
    /// Newest first, across all posts of the site. `limit == 0` returns everything.
    async fn last(&self, site_id: &str, limit: usize, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Comment>>;
    /// Newest first, comments written by `user_id`. `limit == 0` returns everything.
    async fn user(&self, site_id: &str, user_id: &str, limit: usize, skip: usize) -> anyhow::Result<Vec<Comment>>;
    async fn user_count(&self, site_id: &str, user_id: &str) -> anyhow::Result<usize>;
    /// Replaces a stored comment with `comment`, matched by locator and id.
    async fn edit_comment(&self, comment: &Comment) -> anyhow::Result<()>;
    async fn delete(&self, locator: &Locator, id: &str, mode: DeleteMode) -> anyhow::Result<()>;
    async fn delete_user(&self, site_id: &str, user_id: &str, mode: DeleteMode) -> anyhow::Result<()>;

    // User details
    async fn user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail) -> anyhow::Result<String>;
    async fn set_user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail, value: &str) -> anyhow::Result<()>;
    async fn delete_user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail) -> anyhow::Result<()>;

    // Post Operations
    async fn info(&self, locator: &Locator) -> anyhow::Result<PostInfo>;
    async fn counts(&self, site_id: &str, urls: &[String]) -> anyhow::Result<Vec<PostInfo>>;
    async fn list(&self, site_id: &str, limit: usize, skip: usize) -> anyhow::Result<Vec<PostInfo>>;
    async fn set_read_only(&self, locator: &Locator, status: bool) -> anyhow::Result<()>;
    async fn is_read_only(&self, locator: &Locator) -> anyhow::Result<bool>;
    async fn set_pin(&self, locator: &Locator, id: &str, status: bool) -> anyhow::Result<()>;
    async fn set_title(&self, locator: &Locator, title: &str) -> anyhow::Result<()>;

    // Moderation
    /// `ttl == None` blocks permanently.
    async fn set_block(&self, site_id: &str, user_id: &str, status: bool, ttl: Option<Duration>) -> anyhow::Result<()>;
    async fn is_blocked(&self, site_id: &str, user_id: &str) -> anyhow::Result<bool>;
    async fn blocked_users(&self, site_id: &str) -> anyhow::Result<Vec<BlockedUser>>;
    async fn set_verified(&self, site_id: &str, user_id: &str, status: bool) -> anyhow::Result<()>;
    async fn is_verified(&self, site_id: &str, user_id: &str) -> anyhow::Result<bool>;
}

/// Source of per-site administrators.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn admins(&self, site_id: &str) -> anyhow::Result<Vec<String>>;
    async fn email(&self, site_id: &str) -> anyhow::Result<String>;
}

/// Scope-based invalidation of rendered responses. Data service writes call this.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait CacheFlusher: Send + Sync {
    fn flush(&self, request: FlushRequest);
}

/// Everything a destination needs to announce a new comment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub comment: Comment,
    /// Resolved parent; default when the comment is top-level or resolution failed.
    pub parent: Comment,
    pub emails: Vec<String>,
    pub telegrams: Vec<String>,
}

/// Contact-address confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub site_id: String,
    pub user: String,
    pub email: String,
    pub telegram: String,
    pub token: String,
}

/// A notification sink (email, Telegram, Slack, webhook).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Destination: Send + Sync {
    async fn send(&self, request: &NotifyRequest) -> anyhow::Result<()>;
    async fn send_verification(&self, request: &VerificationRequest) -> anyhow::Result<()>;
    /// Short identifier used in logs.
    fn name(&self) -> String;
}

impl fmt::Debug for dyn Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self.name())
    }
}

/// Delivers verification tokens for the interactive login flow.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VerificationSender: Send + Sync {
    async fn send_verification(&self, request: VerificationRequest) -> anyhow::Result<()>;
}

/// Content-addressed avatar persistence.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AvatarStore: Send + Sync {
    /// Stores (resized) image data for `user_id`, returning the avatar name.
    async fn put(&self, user_id: &str, data: Bytes) -> anyhow::Result<String>;
    async fn get(&self, avatar: &str) -> anyhow::Result<Bytes>;
    /// Fingerprint that changes when the stored content changes.
    async fn id(&self, avatar: &str) -> anyhow::Result<String>;
    async fn remove(&self, avatar: &str) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<String>>;
}

/// Resolves a page's `<title>`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TitleExtractor: Send + Sync {
    async fn get(&self, url: &str) -> anyhow::Result<String>;
}

/// A consumer of raw Telegram `getUpdates` batches.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait UpdateReceiver: Send + Sync {
    async fn process_update(&self, raw: &str) -> anyhow::Result<()>;
    fn name(&self) -> String;
}

/// A full-text index over the comments of one or more sites.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Adds or replaces the document for `comment`.
    async fn index(&self, comment: &Comment) -> anyhow::Result<()>;
    async fn delete(&self, site_id: &str, id: &str) -> anyhow::Result<()>;
    async fn search(&self, query: &SearchQuery) -> anyhow::Result<SearchPage>;
}
