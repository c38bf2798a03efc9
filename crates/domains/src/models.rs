//! # Domain Models
//!
//! These structs represent the core entities of the comment engine.
//! Comments are scoped to a [`Locator`] and carry a snapshot of their author.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel identity used for hard-deleted comments.
pub const DELETED_USER_ID: &str = "deleted";

/// Identity of a discussion thread: a page URL on a site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    #[serde(rename = "site", default)]
    pub site_id: String,
    #[serde(default)]
    pub url: String,
}

impl Locator {
    pub fn new(site_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self { site_id: site_id.into(), url: url.into() }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site_id, self.url)
    }
}

/// A commenter. `admin` is derived from the configured admin list and is only
/// persisted as part of a comment's creation snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub picture: String,
    /// Hashed client address; never the raw IP.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(rename = "block", default)]
    pub blocked: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub site_id: String,
}

impl User {
    /// The placeholder identity that replaces the author of a hard-deleted comment.
    pub fn deleted() -> Self {
        Self {
            name: DELETED_USER_ID.to_string(),
            id: DELETED_USER_ID.to_string(),
            ..Default::default()
        }
    }
}

/// Present on a comment iff it was edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub summary: String,
}

/// Anti-abuse record of a vote cast from a (hashed) address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotedIp {
    pub up: bool,
    pub timestamp: DateTime<Utc>,
}

/// The fundamental unit of conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub id: String,
    /// Parent comment id; empty for top-level comments.
    #[serde(rename = "pid", default)]
    pub parent_id: String,
    /// Rendered and sanitized HTML.
    #[serde(default)]
    pub text: String,
    /// Source text as submitted (markdown).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub orig: String,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub locator: Locator,
    #[serde(default)]
    pub score: i64,
    /// user id -> direction (true = up)
    #[serde(default)]
    pub votes: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub voted_ips: HashMap<String, VotedIp>,
    /// The requesting user's own vote, filled in per view.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vote: i32,
    #[serde(default)]
    pub controversy: f64,
    #[serde(rename = "time", default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<Edit>,
    #[serde(default)]
    pub pin: bool,
    #[serde(rename = "delete", default)]
    pub deleted: bool,
    #[serde(rename = "title", default, skip_serializing_if = "String::is_empty")]
    pub post_title: String,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl Comment {
    /// Strips content according to `mode`. Identity fields and the timestamp are kept
    /// so that the thread structure survives.
    pub fn set_deleted(&mut self, mode: DeleteMode) {
        self.text.clear();
        self.orig.clear();
        self.score = 0;
        self.controversy = 0.0;
        self.votes.clear();
        self.voted_ips.clear();
        self.edit = None;
        self.pin = false;
        self.deleted = true;
        if mode == DeleteMode::Hard {
            self.user = User::deleted();
        }
    }

    pub fn is_hard_deleted(&self) -> bool {
        self.deleted && self.user.id == DELETED_USER_ID
    }

    /// Signed sum over `votes`.
    pub fn votes_score(&self) -> i64 {
        self.votes.values().map(|up| if *up { 1 } else { -1 }).sum()
    }

    /// Recomputes `controversy` from the current votes.
    pub fn update_controversy(&mut self) {
        let ups = self.votes.values().filter(|up| **up).count();
        let downs = self.votes.len() - ups;
        self.controversy = controversy(ups, downs);
    }
}

/// `(ups + downs) ^ balance` where balance is the ratio of the smaller side to the larger.
/// Zero unless both sides have voted.
pub fn controversy(ups: usize, downs: usize) -> f64 {
    if ups == 0 || downs == 0 {
        return 0.0;
    }
    let magnitude = (ups + downs) as f64;
    let balance = if ups > downs {
        downs as f64 / ups as f64
    } else {
        ups as f64 / downs as f64
    };
    magnitude.powf(balance)
}

/// Soft deletion keeps the author, hard deletion replaces it with a sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    #[default]
    Soft,
    Hard,
}

impl FromStr for DeleteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "soft" => Ok(DeleteMode::Soft),
            "hard" => Ok(DeleteMode::Hard),
            other => Err(format!("unknown delete mode {other:?}")),
        }
    }
}

/// Aggregate state of a single post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub count: usize,
    #[serde(rename = "read_only", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(rename = "first_time", default, skip_serializing_if = "Option::is_none")]
    pub first_ts: Option<DateTime<Utc>>,
    #[serde(rename = "last_time", default, skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<DateTime<Utc>>,
}

impl PostInfo {
    /// A post is read-only when explicitly marked, or when it is older than `read_only_age`.
    pub fn apply_read_only_age(&mut self, read_only_age: chrono::Duration, now: DateTime<Utc>) {
        if read_only_age > chrono::Duration::zero() {
            if let Some(first) = self.first_ts {
                if first + read_only_age < now {
                    self.read_only = true;
                }
            }
        }
    }
}

/// A user barred from commenting. `until == None` means permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedUser {
    pub id: String,
    pub name: String,
    #[serde(rename = "time")]
    pub until: Option<DateTime<Utc>>,
}

/// Per-user contact details kept by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserDetail {
    Email,
    Telegram,
    /// Only meaningful for deletion: drops every detail of the user.
    All,
}

impl FromStr for UserDetail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(UserDetail::Email),
            "telegram" => Ok(UserDetail::Telegram),
            "all" | "" => Ok(UserDetail::All),
            other => Err(format!("unknown user detail {other:?}")),
        }
    }
}

/// Field a comment list is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Time,
    Active,
    Score,
    Controversy,
}

/// Parsed sort expression such as `-score` or `+time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub descending: bool,
}

impl Default for Sort {
    fn default() -> Self {
        Sort { field: SortField::Time, descending: false }
    }
}

impl FromStr for Sort {
    type Err = String;

    /// Leading `+` is ascending, leading `-` descending. A bare key takes the field's
    /// natural order: ascending for time, descending for everything else.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (explicit, key) = match s.trim().chars().next() {
            Some('+') => (Some(false), &s.trim()[1..]),
            Some('-') => (Some(true), &s.trim()[1..]),
            // '+' arrives as a space when not url-encoded
            _ if s.starts_with(' ') => (Some(false), s.trim()),
            _ => (None, s.trim()),
        };
        let field = match key {
            "" | "time" => SortField::Time,
            "active" => SortField::Active,
            "score" => SortField::Score,
            "controversy" => SortField::Controversy,
            other => return Err(format!("unknown sort key {other:?}")),
        };
        let descending = explicit.unwrap_or(field != SortField::Time);
        Ok(Sort { field, descending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_delete_keeps_author() {
        let mut c = Comment {
            id: "c1".into(),
            parent_id: "p1".into(),
            text: "<p>hi</p>".into(),
            orig: "hi".into(),
            user: User { id: "u1".into(), name: "user one".into(), ..Default::default() },
            score: 2,
            pin: true,
            ..Default::default()
        };
        c.votes.insert("u2".into(), true);
        c.votes.insert("u3".into(), true);

        c.set_deleted(DeleteMode::Soft);
        assert!(c.deleted);
        assert_eq!(c.id, "c1");
        assert_eq!(c.parent_id, "p1");
        assert_eq!(c.user.id, "u1");
        assert!(c.text.is_empty() && c.orig.is_empty());
        assert_eq!(c.score, 0);
        assert!(c.votes.is_empty());
        assert!(!c.pin);
        assert!(!c.is_hard_deleted());

        c.set_deleted(DeleteMode::Hard);
        assert_eq!(c.user, User::deleted());
        assert!(c.is_hard_deleted());
    }

    #[test]
    fn sort_parsing() {
        assert_eq!("time".parse::<Sort>().unwrap(), Sort { field: SortField::Time, descending: false });
        assert_eq!("-time".parse::<Sort>().unwrap(), Sort { field: SortField::Time, descending: true });
        assert_eq!("score".parse::<Sort>().unwrap(), Sort { field: SortField::Score, descending: true });
        assert_eq!("+score".parse::<Sort>().unwrap(), Sort { field: SortField::Score, descending: false });
        assert_eq!(" active".parse::<Sort>().unwrap(), Sort { field: SortField::Active, descending: false });
        assert!("bogus".parse::<Sort>().is_err());
    }

    #[test]
    fn controversy_needs_both_sides() {
        assert_eq!(controversy(5, 0), 0.0);
        assert_eq!(controversy(0, 3), 0.0);
        assert!((controversy(2, 2) - 4.0).abs() < f64::EPSILON);
        assert!(controversy(3, 1) > 1.0);
    }

    #[test]
    fn read_only_by_age() {
        let now = Utc::now();
        let mut info = PostInfo { first_ts: Some(now - chrono::Duration::days(10)), ..Default::default() };
        info.apply_read_only_age(chrono::Duration::days(30), now);
        assert!(!info.read_only);
        info.apply_read_only_age(chrono::Duration::days(5), now);
        assert!(info.read_only);
    }
}
