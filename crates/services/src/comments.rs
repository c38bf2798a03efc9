//! # Data service
//!
//! Business rules layered on top of the storage [`Engine`]: validation, formatting,
//! edit windows, vote accounting, read-only enforcement and cache invalidation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use domains::{
    AdminStore, AppError, BlockedUser, CacheFlusher, Comment, DeleteMode, Edit, Engine, FlushRequest,
    Locator, PostInfo, Result, Sort, TitleExtractor, User, UserDetail, VotedIp, LAST_COMMENTS_SCOPE,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::formatter::{sanitize_comment, CommentFormatter};
use crate::restricted::RestrictedWords;
use crate::search::SearchService;
use crate::tree::{sort_comments, Tree};

/// How many recent comments are scanned when looking for replies to a user.
const MAX_REPLIES_SCAN: usize = 1000;

#[derive(Debug, Clone)]
pub struct DataServiceConfig {
    pub edit_duration: Duration,
    pub max_comment_size: usize,
    /// Zero disables the cap.
    pub max_votes: usize,
    /// Votes may not push a score below zero.
    pub positive_score: bool,
    pub min_score: Option<i64>,
    pub restricted_words: Vec<String>,
    pub read_only_age: Duration,
    /// Same hashed address can't vote twice on a comment within this window. Zero disables.
    pub vote_ip_window: Duration,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            edit_duration: Duration::minutes(5),
            max_comment_size: 2048,
            max_votes: 0,
            positive_score: false,
            min_score: None,
            restricted_words: Vec::new(),
            read_only_age: Duration::zero(),
            vote_ip_window: Duration::zero(),
        }
    }
}

/// Author edit of an existing comment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditRequest {
    pub orig: String,
    pub summary: String,
    /// Take the self-delete branch instead of editing.
    pub delete: bool,
    /// Admins edit regardless of window and replies.
    pub admin: bool,
}

pub struct DataService {
    engine: Arc<dyn Engine>,
    admin_store: Arc<dyn AdminStore>,
    formatter: CommentFormatter,
    restricted: RestrictedWords,
    flusher: Option<Arc<dyn CacheFlusher>>,
    title_extractor: Option<Arc<dyn TitleExtractor>>,
    search: Option<Arc<SearchService>>,
    /// Per-comment locks serializing read-modify-write of a stored comment.
    comment_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    config: DataServiceConfig,
}

/// Held for the duration of a comment update; the map entry goes away with the last holder.
struct CommentLock {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CommentLock {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.key, |_, l| Arc::strong_count(l) == 1);
    }
}

impl DataService {
    pub fn new(engine: Arc<dyn Engine>, admin_store: Arc<dyn AdminStore>, config: DataServiceConfig) -> Self {
        Self {
            engine,
            admin_store,
            formatter: CommentFormatter::default(),
            restricted: RestrictedWords::new(&config.restricted_words),
            flusher: None,
            title_extractor: None,
            search: None,
            comment_locks: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn with_formatter(mut self, formatter: CommentFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_flusher(mut self, flusher: Arc<dyn CacheFlusher>) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn with_title_extractor(mut self, extractor: Arc<dyn TitleExtractor>) -> Self {
        self.title_extractor = Some(extractor);
        self
    }

    pub fn with_search(mut self, search: Arc<SearchService>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn config(&self) -> &DataServiceConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    // ── Comments ──────────────────────────────────────────────────────────

    /// Validates, renders and persists a new comment. Server-owned fields are reset.
    pub async fn create(&self, mut comment: Comment) -> Result<Comment> {
        if comment.user.id.is_empty() {
            return Err(AppError::Validation("missing user id".into()));
        }
        if comment.locator.site_id.is_empty() || comment.locator.url.is_empty() {
            return Err(AppError::Validation("missing locator".into()));
        }

        comment.id = uuid::Uuid::new_v4().to_string();
        comment.timestamp = Utc::now();
        comment.score = 0;
        comment.votes.clear();
        comment.voted_ips.clear();
        comment.vote = 0;
        comment.controversy = 0.0;
        comment.edit = None;
        comment.pin = false;
        comment.deleted = false;
        comment.user.blocked = false;
        comment.user.site_id = comment.locator.site_id.clone();
        comment.user.admin = self.is_admin(&comment.locator.site_id, &comment.user.id).await;
        comment.user.verified = self.is_verified(&comment.locator.site_id, &comment.user.id).await;

        if comment.orig.is_empty() && !comment.text.is_empty() {
            comment.orig = std::mem::take(&mut comment.text);
        }
        self.validate_text(&comment.orig)?;

        if self.is_blocked(&comment.locator.site_id, &comment.user.id).await {
            return Err(AppError::UserBlocked(comment.user.id.clone()));
        }
        if self.is_read_only(&comment.locator).await {
            return Err(AppError::ReadOnly(comment.locator.url.clone()));
        }
        if !comment.parent_id.is_empty() {
            let parent = self
                .engine
                .get(&comment.locator, &comment.parent_id)
                .await
                .map_err(|_| AppError::Validation(format!("parent comment {} not found", comment.parent_id)))?;
            if parent.deleted {
                return Err(AppError::Validation(format!("parent comment {} is deleted", comment.parent_id)));
            }
        }

        self.formatter.format(&mut comment);
        sanitize_comment(&mut comment);
        if comment.post_title.is_empty() {
            comment.post_title = self.lookup_title(&comment.locator).await;
        }

        let id = self.engine.create(&comment).await.map_err(AppError::from_engine)?;
        comment.id = id;
        debug!(id = %comment.id, locator = %comment.locator, "comment created");

        self.flush(
            &comment.locator.site_id,
            [
                comment.locator.site_id.as_str(),
                comment.locator.url.as_str(),
                LAST_COMMENTS_SCOPE,
                comment.user.id.as_str(),
            ],
        );
        self.index(&comment).await;
        Ok(comment)
    }

    pub async fn get(&self, locator: &Locator, id: &str) -> Result<Comment> {
        self.engine.get(locator, id).await.map_err(AppError::from_engine)
    }

    /// Edits (or self-deletes) a comment owned by `user_id`.
    pub async fn edit_comment(&self, locator: &Locator, id: &str, user_id: &str, req: EditRequest) -> Result<Comment> {
        let _lock = self.lock_comment(locator, id).await;
        let mut comment = self.get(locator, id).await?;
        if comment.deleted {
            return Err(AppError::CommentNotFound(id.to_string()));
        }
        if !req.admin && comment.user.id != user_id {
            return Err(AppError::NoAccess(format!("comment {id} belongs to another user")));
        }
        if !req.admin {
            if Utc::now() - comment.timestamp > self.config.edit_duration {
                return Err(AppError::EditExpired(id.to_string()));
            }
            if self.has_replies(&comment).await? {
                return Err(AppError::EditChanged(id.to_string()));
            }
        }

        if req.delete {
            self.engine.delete(locator, id, DeleteMode::Soft).await.map_err(AppError::from_engine)?;
            comment.set_deleted(DeleteMode::Soft);
            self.flush(
                &locator.site_id,
                [locator.site_id.as_str(), locator.url.as_str(), LAST_COMMENTS_SCOPE, comment.user.id.as_str()],
            );
            self.unindex(&locator.site_id, id).await;
            return Ok(comment);
        }

        self.validate_text(&req.orig)?;
        comment.orig = req.orig;
        self.formatter.format(&mut comment);
        sanitize_comment(&mut comment);
        comment.edit = Some(Edit { timestamp: Utc::now(), summary: req.summary });

        self.engine.edit_comment(&comment).await.map_err(AppError::from_engine)?;
        self.flush(
            &locator.site_id,
            [locator.site_id.as_str(), locator.url.as_str(), LAST_COMMENTS_SCOPE, comment.user.id.as_str()],
        );
        self.index(&comment).await;
        Ok(comment)
    }

    /// Casts or cancels a vote. Serialized per comment.
    pub async fn vote(&self, locator: &Locator, id: &str, user_id: &str, ip_hash: &str, up: bool) -> Result<Comment> {
        let _lock = self.lock_comment(locator, id).await;
        self.vote_locked(locator, id, user_id, ip_hash, up).await
    }

    /// Waits for exclusive access to one stored comment.
    async fn lock_comment(&self, locator: &Locator, id: &str) -> CommentLock {
        let key = format!("{locator}::{id}");
        let lock = self.comment_locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        CommentLock { locks: self.comment_locks.clone(), key, guard: Some(guard) }
    }

    /// Locks several comments in key order.
    async fn lock_comments(&self, comments: &[Comment]) -> Vec<CommentLock> {
        let mut targets: Vec<(&Locator, &str)> = comments.iter().map(|c| (&c.locator, c.id.as_str())).collect();
        targets.sort_by_key(|(l, id)| format!("{l}::{id}"));
        targets.dedup();
        let mut locks = Vec::with_capacity(targets.len());
        for (locator, id) in targets {
            locks.push(self.lock_comment(locator, id).await);
        }
        locks
    }

    async fn vote_locked(&self, locator: &Locator, id: &str, user_id: &str, ip_hash: &str, up: bool) -> Result<Comment> {
        let mut comment = self.get(locator, id).await?;
        if comment.deleted {
            return Err(AppError::VoteRejected(format!("comment {id} is deleted")));
        }
        if comment.user.id == user_id {
            return Err(AppError::VoteSelf);
        }

        match comment.votes.get(user_id).copied() {
            Some(prev) if prev == up => return Err(AppError::VoteDouble(id.to_string())),
            Some(_) => {
                // opposite vote cancels the previous one
                comment.votes.remove(user_id);
                if !ip_hash.is_empty() {
                    comment.voted_ips.remove(ip_hash);
                }
            }
            None => {
                if self.config.max_votes > 0 && comment.votes.len() >= self.config.max_votes {
                    return Err(AppError::VoteMax(self.config.max_votes));
                }
                if !ip_hash.is_empty() && self.config.vote_ip_window > Duration::zero() {
                    if let Some(prev) = comment.voted_ips.get(ip_hash) {
                        if Utc::now() - prev.timestamp < self.config.vote_ip_window {
                            return Err(AppError::VoteRejected("the same address already voted".into()));
                        }
                    }
                }
                if !up {
                    let next = comment.votes_score() - 1;
                    if let Some(min) = self.config.min_score {
                        if next < min {
                            return Err(AppError::VoteMinScore(min));
                        }
                    }
                    if self.config.positive_score && next < 0 {
                        return Err(AppError::VoteMinScore(0));
                    }
                }
                comment.votes.insert(user_id.to_string(), up);
                if !ip_hash.is_empty() {
                    comment.voted_ips.insert(ip_hash.to_string(), VotedIp { up, timestamp: Utc::now() });
                }
            }
        }

        comment.score = comment.votes_score();
        comment.update_controversy();
        self.engine.edit_comment(&comment).await.map_err(AppError::from_engine)?;

        self.flush(&locator.site_id, [locator.url.as_str(), comment.user.id.as_str()]);
        comment.vote = match comment.votes.get(user_id) {
            Some(true) => 1,
            Some(false) => -1,
            None => 0,
        };
        Ok(comment)
    }

    pub async fn delete(&self, locator: &Locator, id: &str, mode: DeleteMode) -> Result<()> {
        let _lock = self.lock_comment(locator, id).await;
        self.engine.delete(locator, id, mode).await.map_err(AppError::from_engine)?;
        self.flush(&locator.site_id, [locator.site_id.as_str(), locator.url.as_str(), LAST_COMMENTS_SCOPE]);
        self.unindex(&locator.site_id, id).await;
        Ok(())
    }

    /// Deletes every comment of a user; a hard delete also drops the user's details.
    pub async fn delete_user(&self, site_id: &str, user_id: &str, mode: DeleteMode) -> Result<()> {
        let comments = self.engine.user(site_id, user_id, 0, 0).await.map_err(AppError::from_engine)?;
        let _locks = self.lock_comments(&comments).await;
        self.engine.delete_user(site_id, user_id, mode).await.map_err(AppError::from_engine)?;
        if mode == DeleteMode::Hard {
            self.engine
                .delete_user_detail(site_id, user_id, UserDetail::All)
                .await
                .map_err(AppError::from_engine)?;
        }
        self.flush(site_id, [site_id, user_id, LAST_COMMENTS_SCOPE]);
        for c in &comments {
            self.unindex(site_id, &c.id).await;
        }
        debug!(site = site_id, user = user_id, count = comments.len(), ?mode, "user comments deleted");
        Ok(())
    }

    /// Flat list of a post's comments, hard-deleted ones excluded.
    pub async fn find(&self, locator: &Locator, sort: Sort) -> Result<Vec<Comment>> {
        let mut comments: Vec<Comment> = self
            .engine
            .find(locator, None)
            .await
            .map_err(AppError::from_engine)?
            .into_iter()
            .filter(|c| !c.is_hard_deleted())
            .collect();
        sort_comments(&mut comments, sort);
        Ok(comments)
    }

    /// Comments of a post changed since `since`, flat.
    pub async fn find_since(&self, locator: &Locator, since: DateTime<Utc>) -> Result<Vec<Comment>> {
        let comments = self.engine.find(locator, Some(since)).await.map_err(AppError::from_engine)?;
        Ok(comments.into_iter().filter(|c| !c.is_hard_deleted()).collect())
    }

    /// Threaded view of a post.
    pub async fn tree(&self, locator: &Locator, sort: Sort) -> Result<Tree> {
        let comments = self.engine.find(locator, None).await.map_err(AppError::from_engine)?;
        let mut tree = Tree::new(comments, sort, self.config.read_only_age);
        if tree.info.url.is_empty() {
            tree.info.url = locator.url.clone();
        }
        if !tree.info.read_only {
            tree.info.read_only = self.engine.is_read_only(locator).await.map_err(AppError::from_engine)?;
        }
        Ok(tree)
    }

    /// Newest comments of the site. Deleted comments are never listed; comments of
    /// blocked authors are hidden from non-admin viewers.
    pub async fn last(&self, site_id: &str, limit: usize, since: Option<DateTime<Utc>>, admin: bool) -> Result<Vec<Comment>> {
        let comments = self.engine.last(site_id, limit, since).await.map_err(AppError::from_engine)?;
        let mut blocked: HashMap<String, bool> = HashMap::new();
        let mut res = Vec::with_capacity(comments.len());
        for c in comments {
            if c.deleted {
                continue;
            }
            if !admin {
                let is_blocked = match blocked.get(&c.user.id) {
                    Some(b) => *b,
                    None => {
                        let b = self.is_blocked(site_id, &c.user.id).await;
                        blocked.insert(c.user.id.clone(), b);
                        b
                    }
                };
                if is_blocked {
                    continue;
                }
            }
            res.push(c);
        }
        Ok(res)
    }

    /// Comments written by `user_id`, newest first.
    pub async fn user(&self, site_id: &str, user_id: &str, limit: usize, skip: usize) -> Result<Vec<Comment>> {
        let comments = self.engine.user(site_id, user_id, limit, skip).await.map_err(AppError::from_engine)?;
        Ok(comments.into_iter().filter(|c| !c.is_hard_deleted()).collect())
    }

    pub async fn user_count(&self, site_id: &str, user_id: &str) -> Result<usize> {
        self.engine.user_count(site_id, user_id).await.map_err(AppError::from_engine)
    }

    /// Recent replies to comments written by `user_id`, newest first.
    pub async fn replies(&self, site_id: &str, user_id: &str, limit: usize, since: Option<DateTime<Utc>>) -> Result<Vec<Comment>> {
        let recent = self.engine.last(site_id, MAX_REPLIES_SCAN, since).await.map_err(AppError::from_engine)?;
        let mut authors: HashMap<String, String> = HashMap::new();
        let mut res = Vec::new();
        for c in recent {
            if res.len() >= limit {
                break;
            }
            if c.deleted || c.parent_id.is_empty() || c.user.id == user_id {
                continue;
            }
            let author = match authors.get(&c.parent_id) {
                Some(a) => a.clone(),
                None => {
                    let a = match self.engine.get(&c.locator, &c.parent_id).await {
                        Ok(parent) => parent.user.id,
                        Err(e) => {
                            debug!("can't load parent {} of {}, {e}", c.parent_id, c.id);
                            String::new()
                        }
                    };
                    authors.insert(c.parent_id.clone(), a.clone());
                    a
                }
            };
            if author == user_id {
                res.push(c);
            }
        }
        Ok(res)
    }

    /// Renders a comment source without storing anything.
    pub fn preview(&self, orig: &str) -> Result<String> {
        self.validate_text(orig)?;
        Ok(self.formatter.format_text(orig))
    }

    // ── Posts ─────────────────────────────────────────────────────────────

    /// Post info with the read-only flag resolved from both the explicit mark and age.
    pub async fn info(&self, locator: &Locator) -> Result<PostInfo> {
        let mut info = self.engine.info(locator).await.map_err(AppError::from_engine)?;
        info.apply_read_only_age(self.config.read_only_age, Utc::now());
        Ok(info)
    }

    pub async fn counts(&self, site_id: &str, urls: &[String]) -> Result<Vec<PostInfo>> {
        self.engine.counts(site_id, urls).await.map_err(AppError::from_engine)
    }

    pub async fn list(&self, site_id: &str, limit: usize, skip: usize) -> Result<Vec<PostInfo>> {
        let mut posts = self.engine.list(site_id, limit, skip).await.map_err(AppError::from_engine)?;
        let now = Utc::now();
        for p in &mut posts {
            p.apply_read_only_age(self.config.read_only_age, now);
        }
        Ok(posts)
    }

    pub async fn set_read_only(&self, locator: &Locator, status: bool) -> Result<()> {
        if !status {
            let mut info = self.engine.info(locator).await.map_err(AppError::from_engine)?;
            info.read_only = false;
            info.apply_read_only_age(self.config.read_only_age, Utc::now());
            if info.read_only {
                return Err(AppError::ActionRejected(format!("post {} is read-only by age", locator.url)));
            }
        }
        self.engine.set_read_only(locator, status).await.map_err(AppError::from_engine)?;
        self.flush(&locator.site_id, [locator.url.as_str(), locator.site_id.as_str()]);
        Ok(())
    }

    /// Explicit mark or age; storage failures count as writable.
    pub async fn is_read_only(&self, locator: &Locator) -> bool {
        if self.config.read_only_age > Duration::zero() {
            if let Ok(info) = self.info(locator).await {
                if info.read_only {
                    return true;
                }
            }
        }
        self.engine.is_read_only(locator).await.unwrap_or_else(|e| {
            warn!("can't check read-only status of {locator}, {e}");
            false
        })
    }

    pub async fn set_pin(&self, locator: &Locator, id: &str, status: bool) -> Result<()> {
        let _lock = self.lock_comment(locator, id).await;
        self.engine.set_pin(locator, id, status).await.map_err(AppError::from_engine)?;
        self.flush(&locator.site_id, [locator.url.as_str(), locator.site_id.as_str()]);
        Ok(())
    }

    /// Re-extracts the post title and stores it on every comment of the post.
    pub async fn set_title(&self, locator: &Locator) -> Result<String> {
        let Some(extractor) = &self.title_extractor else {
            return Err(AppError::ActionRejected("title extraction is not enabled".into()));
        };
        let title = extractor.get(&locator.url).await.map_err(AppError::Internal)?;
        let comments = self.engine.find(locator, None).await.map_err(AppError::from_engine)?;
        let _locks = self.lock_comments(&comments).await;
        self.engine.set_title(locator, &title).await.map_err(AppError::from_engine)?;
        self.flush(&locator.site_id, [locator.url.as_str(), locator.site_id.as_str()]);
        Ok(title)
    }

    // ── Users ─────────────────────────────────────────────────────────────

    /// Blocks or unblocks a user. A permanent block soft-deletes all of the user's comments.
    pub async fn set_block(&self, site_id: &str, user_id: &str, status: bool, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.filter(|t| *t > Duration::zero());
        self.engine.set_block(site_id, user_id, status, ttl).await.map_err(AppError::from_engine)?;
        self.flush(site_id, [site_id, user_id]);
        if status && ttl.is_none() {
            self.delete_user(site_id, user_id, DeleteMode::Soft).await?;
        }
        Ok(())
    }

    /// Storage failures count as not blocked.
    pub async fn is_blocked(&self, site_id: &str, user_id: &str) -> bool {
        self.engine.is_blocked(site_id, user_id).await.unwrap_or_else(|e| {
            warn!("can't check block status of {user_id}, {e}");
            false
        })
    }

    pub async fn blocked_users(&self, site_id: &str) -> Result<Vec<BlockedUser>> {
        self.engine.blocked_users(site_id).await.map_err(AppError::from_engine)
    }

    pub async fn set_verified(&self, site_id: &str, user_id: &str, status: bool) -> Result<()> {
        self.engine.set_verified(site_id, user_id, status).await.map_err(AppError::from_engine)?;
        self.flush(site_id, [site_id, user_id]);
        Ok(())
    }

    pub async fn is_verified(&self, site_id: &str, user_id: &str) -> bool {
        self.engine.is_verified(site_id, user_id).await.unwrap_or_else(|e| {
            warn!("can't check verification status of {user_id}, {e}");
            false
        })
    }

    pub async fn user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail) -> Result<String> {
        self.engine.user_detail(site_id, user_id, detail).await.map_err(AppError::from_engine)
    }

    pub async fn set_user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail, value: &str) -> Result<()> {
        self.engine
            .set_user_detail(site_id, user_id, detail, value)
            .await
            .map_err(AppError::from_engine)
    }

    pub async fn delete_user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail) -> Result<()> {
        self.engine
            .delete_user_detail(site_id, user_id, detail)
            .await
            .map_err(AppError::from_engine)
    }

    pub async fn is_admin(&self, site_id: &str, user_id: &str) -> bool {
        match self.admin_store.admins(site_id).await {
            Ok(admins) => admins.iter().any(|a| a == user_id),
            Err(e) => {
                warn!("can't load admins for {site_id}, {e}");
                false
            }
        }
    }

    pub async fn admins(&self, site_id: &str) -> Result<Vec<String>> {
        self.admin_store.admins(site_id).await.map_err(AppError::Internal)
    }

    pub async fn admin_email(&self, site_id: &str) -> Result<String> {
        self.admin_store.email(site_id).await.map_err(AppError::Internal)
    }

    // ── Views ─────────────────────────────────────────────────────────────

    /// Shapes comments for one viewer: strips vote details for non-admins, surfaces the
    /// viewer's own vote and overlays current blocked/verified flags. Stored rows are untouched.
    pub async fn prepare_for_viewer(&self, comments: &mut [Comment], viewer: Option<&User>) {
        let admin = viewer.is_some_and(|u| u.admin);
        let mut flags: HashMap<(String, String), (bool, bool)> = HashMap::new();
        for c in comments.iter_mut() {
            let key = (c.locator.site_id.clone(), c.user.id.clone());
            let (blocked, verified) = match flags.get(&key) {
                Some(f) => *f,
                None => {
                    let f = (
                        self.is_blocked(&key.0, &key.1).await,
                        self.is_verified(&key.0, &key.1).await,
                    );
                    flags.insert(key, f);
                    f
                }
            };
            c.user.blocked = blocked;
            c.user.verified = verified;
            c.vote = match viewer.and_then(|u| c.votes.get(&u.id)) {
                Some(true) => 1,
                Some(false) => -1,
                None => 0,
            };
            if !admin {
                c.votes.clear();
                c.voted_ips.clear();
                c.user.ip.clear();
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn validate_text(&self, orig: &str) -> Result<()> {
        if orig.trim().is_empty() {
            return Err(AppError::Validation("empty comment text".into()));
        }
        let size = orig.chars().count();
        if self.config.max_comment_size > 0 && size > self.config.max_comment_size {
            return Err(AppError::Validation(format!(
                "comment text exceeded max allowed size {} ({size})",
                self.config.max_comment_size
            )));
        }
        if self.restricted.check(orig) {
            return Err(AppError::Rejected("comment contains restricted words".into()));
        }
        Ok(())
    }

    async fn has_replies(&self, comment: &Comment) -> Result<bool> {
        let comments = self.engine.find(&comment.locator, None).await.map_err(AppError::from_engine)?;
        Ok(comments.iter().any(|c| c.parent_id == comment.id && !c.deleted))
    }

    async fn lookup_title(&self, locator: &Locator) -> String {
        let Some(extractor) = &self.title_extractor else {
            return String::new();
        };
        match extractor.get(&locator.url).await {
            Ok(title) => title,
            Err(e) => {
                debug!("can't get title for {}, {e}", locator.url);
                String::new()
            }
        }
    }

    fn flush<'a, I>(&self, site_id: &str, scopes: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        if let Some(flusher) = &self.flusher {
            let scopes: HashSet<&str> = scopes.into_iter().collect();
            flusher.flush(FlushRequest::new(site_id, scopes));
        }
    }

    async fn index(&self, comment: &Comment) {
        if let Some(search) = &self.search {
            search.index(comment).await;
        }
    }

    async fn unindex(&self, site_id: &str, id: &str) {
        if let Some(search) = &self.search {
            search.delete(site_id, id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{MockAdminStore, MockCacheFlusher, MockEngine};
    use std::sync::Mutex as StdMutex;

    fn stored(id: &str, author: &str, minutes_ago: i64) -> Comment {
        Comment {
            id: id.into(),
            text: "<p>hi</p>\n".into(),
            orig: "hi".into(),
            user: User { id: author.into(), name: author.into(), ..Default::default() },
            locator: Locator::new("site", "url"),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            ..Default::default()
        }
    }

    fn admins() -> Arc<MockAdminStore> {
        let mut admins = MockAdminStore::new();
        admins.expect_admins().returning(|_| Ok(vec!["admin".to_string()]));
        admins.expect_email().returning(|_| Ok("admin@example.com".to_string()));
        Arc::new(admins)
    }

    /// Engine double that keeps a single comment in memory so votes can be replayed.
    fn voting_engine(initial: Comment) -> MockEngine {
        let state = Arc::new(StdMutex::new(initial));
        let mut engine = MockEngine::new();
        let read = state.clone();
        engine.expect_get().returning(move |_, _| Ok(read.lock().unwrap().clone()));
        let write = state;
        engine.expect_edit_comment().returning(move |c| {
            *write.lock().unwrap() = c.clone();
            Ok(())
        });
        engine
    }

    fn service(engine: MockEngine, config: DataServiceConfig) -> DataService {
        DataService::new(Arc::new(engine), admins(), config)
    }

    #[tokio::test]
    async fn create_formats_and_resets_fields() {
        let mut engine = MockEngine::new();
        engine.expect_is_blocked().returning(|_, _| Ok(false));
        engine.expect_is_verified().returning(|_, _| Ok(false));
        engine.expect_is_read_only().returning(|_| Ok(false));
        engine.expect_create().times(1).returning(|c| Ok(c.id.clone()));

        let mut flusher = MockCacheFlusher::new();
        flusher
            .expect_flush()
            .withf(|r| r.site_id == "site" && r.scopes.len() == 4 && r.scopes.contains(&"last".to_string()))
            .times(1)
            .return_const(());

        let svc = service(engine, DataServiceConfig::default()).with_flusher(Arc::new(flusher));
        let mut input = stored("client-id", "admin", 0);
        input.text = String::new();
        input.orig = "**bold**".into();
        input.score = 100;
        input.pin = true;

        let c = svc.create(input).await.unwrap();
        assert_ne!(c.id, "client-id");
        assert_eq!(c.text, "<p><strong>bold</strong></p>\n");
        assert_eq!(c.orig, "**bold**");
        assert_eq!(c.score, 0);
        assert!(!c.pin);
        assert!(c.user.admin);
    }

    #[tokio::test]
    async fn create_rejects_invalid_comments() {
        let mut engine = MockEngine::new();
        engine.expect_is_blocked().returning(|_, u| Ok(u == "blocked"));
        engine.expect_is_verified().returning(|_, _| Ok(false));
        engine.expect_is_read_only().returning(|l| Ok(l.url == "ro"));
        engine.expect_create().never();
        let svc = service(
            engine,
            DataServiceConfig { max_comment_size: 10, restricted_words: vec!["bad".into()], ..Default::default() },
        );

        let mut c = stored("", "u1", 0);
        c.orig = "this text is too long".into();
        assert_eq!(svc.create(c).await.unwrap_err().code(), domains::ErrorCode::CommentValidation);

        let mut c = stored("", "u1", 0);
        c.orig = "bad word".into();
        assert_eq!(svc.create(c).await.unwrap_err().code(), domains::ErrorCode::CommentRejected);

        let c = stored("", "blocked", 0);
        assert_eq!(svc.create(c).await.unwrap_err().code(), domains::ErrorCode::UserBlocked);

        let mut c = stored("", "u1", 0);
        c.locator.url = "ro".into();
        assert_eq!(svc.create(c).await.unwrap_err().code(), domains::ErrorCode::ReadOnly);

        let mut c = stored("", "", 0);
        c.user.id.clear();
        assert_eq!(svc.create(c).await.unwrap_err().code(), domains::ErrorCode::CommentValidation);
    }

    #[tokio::test]
    async fn edit_window_is_enforced() {
        let mut engine = MockEngine::new();
        engine.expect_get().returning(|_, _| Ok(stored("c1", "u1", 60)));
        engine.expect_edit_comment().never();
        let svc = service(engine, DataServiceConfig { edit_duration: Duration::minutes(5), ..Default::default() });

        let req = EditRequest { orig: "x".into(), ..Default::default() };
        let err = svc.edit_comment(&Locator::new("site", "url"), "c1", "u1", req).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::CommentEditExpired);
    }

    #[tokio::test]
    async fn edit_is_refused_once_replied() {
        let mut engine = MockEngine::new();
        engine.expect_get().returning(|_, _| Ok(stored("c1", "u1", 1)));
        engine.expect_find().returning(|_, _| {
            let mut reply = stored("c2", "u2", 0);
            reply.parent_id = "c1".into();
            Ok(vec![stored("c1", "u1", 1), reply])
        });
        let svc = service(engine, DataServiceConfig::default());

        let req = EditRequest { orig: "x".into(), ..Default::default() };
        let err = svc.edit_comment(&Locator::new("site", "url"), "c1", "u1", req.clone()).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::CommentEditChanged);

        let err = svc.edit_comment(&Locator::new("site", "url"), "c1", "u2", req).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::NoAccess);
    }

    #[tokio::test]
    async fn edit_renders_and_marks_edit() {
        let mut engine = MockEngine::new();
        engine.expect_get().returning(|_, _| Ok(stored("c1", "u1", 1)));
        engine.expect_find().returning(|_, _| Ok(vec![stored("c1", "u1", 1)]));
        engine.expect_edit_comment().times(1).returning(|_| Ok(()));
        let svc = service(engine, DataServiceConfig::default());

        let req = EditRequest { orig: "*new*".into(), summary: "typo".into(), ..Default::default() };
        let c = svc.edit_comment(&Locator::new("site", "url"), "c1", "u1", req).await.unwrap();
        assert_eq!(c.text, "<p><em>new</em></p>\n");
        assert_eq!(c.edit.unwrap().summary, "typo");
    }

    #[tokio::test]
    async fn vote_up_then_down_restores_score() {
        let svc = service(voting_engine(stored("c1", "author", 1)), DataServiceConfig::default());
        let loc = Locator::new("site", "url");

        let c = svc.vote(&loc, "c1", "voter", "", true).await.unwrap();
        assert_eq!(c.score, 1);
        assert_eq!(c.vote, 1);

        let err = svc.vote(&loc, "c1", "voter", "", true).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::VoteDbl);

        let c = svc.vote(&loc, "c1", "voter", "", false).await.unwrap();
        assert_eq!(c.score, 0);
        assert!(c.votes.is_empty());
        assert_eq!(c.vote, 0);
    }

    #[tokio::test]
    async fn vote_rules() {
        let svc = service(
            voting_engine(stored("c1", "author", 1)),
            DataServiceConfig {
                max_votes: 2,
                min_score: Some(-1),
                vote_ip_window: Duration::minutes(5),
                ..Default::default()
            },
        );
        let loc = Locator::new("site", "url");

        assert_eq!(svc.vote(&loc, "c1", "author", "", true).await.unwrap_err().code(), domains::ErrorCode::VoteSelf);

        svc.vote(&loc, "c1", "v1", "ip1", false).await.unwrap();
        let err = svc.vote(&loc, "c1", "v2", "ip1", true).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::VoteRejected);

        let err = svc.vote(&loc, "c1", "v2", "ip2", false).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::VoteMinScore);

        svc.vote(&loc, "c1", "v2", "ip2", true).await.unwrap();
        let err = svc.vote(&loc, "c1", "v3", "ip3", true).await.unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::VoteMax);
    }

    #[tokio::test]
    async fn concurrent_votes_keep_score_consistent() {
        let svc = Arc::new(service(voting_engine(stored("c1", "author", 1)), DataServiceConfig::default()));
        let loc = Locator::new("site", "url");
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let svc = svc.clone();
                let loc = loc.clone();
                tokio::spawn(async move { svc.vote(&loc, "c1", &format!("v{i}"), "", true).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let c = svc.get(&loc, "c1").await.unwrap();
        assert_eq!(c.score, 20);
        assert_eq!(c.votes.len(), 20);
        assert!(svc.comment_locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_during_vote_is_not_reverted() {
        let state = Arc::new(StdMutex::new(stored("c1", "author", 1)));
        let mut engine = MockEngine::new();
        let read = state.clone();
        engine.expect_get().returning(move |_, _| {
            let c = read.lock().unwrap().clone();
            // keeps the vote between its read and its write
            std::thread::sleep(std::time::Duration::from_millis(150));
            Ok(c)
        });
        let write = state.clone();
        engine.expect_edit_comment().returning(move |c| {
            *write.lock().unwrap() = c.clone();
            Ok(())
        });
        let del = state.clone();
        engine.expect_delete().returning(move |_, _, mode| {
            del.lock().unwrap().set_deleted(mode);
            Ok(())
        });
        let svc = Arc::new(service(engine, DataServiceConfig::default()));
        let loc = Locator::new("site", "url");

        let voting = {
            let (svc, loc) = (svc.clone(), loc.clone());
            tokio::spawn(async move { svc.vote(&loc, "c1", "voter", "", true).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        svc.delete(&loc, "c1", DeleteMode::Soft).await.unwrap();
        voting.await.unwrap().unwrap();

        let c = state.lock().unwrap().clone();
        assert!(c.deleted);
        assert!(c.text.is_empty());
        assert_eq!(c.score, 0);
        assert!(svc.comment_locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pin_during_vote_is_kept() {
        let state = Arc::new(StdMutex::new(stored("c1", "author", 1)));
        let mut engine = MockEngine::new();
        let read = state.clone();
        engine.expect_get().returning(move |_, _| {
            let c = read.lock().unwrap().clone();
            std::thread::sleep(std::time::Duration::from_millis(150));
            Ok(c)
        });
        let write = state.clone();
        engine.expect_edit_comment().returning(move |c| {
            *write.lock().unwrap() = c.clone();
            Ok(())
        });
        let pin = state.clone();
        engine.expect_set_pin().returning(move |_, _, status| {
            pin.lock().unwrap().pin = status;
            Ok(())
        });
        let svc = Arc::new(service(engine, DataServiceConfig::default()));
        let loc = Locator::new("site", "url");

        let voting = {
            let (svc, loc) = (svc.clone(), loc.clone());
            tokio::spawn(async move { svc.vote(&loc, "c1", "voter", "", true).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        svc.set_pin(&loc, "c1", true).await.unwrap();
        voting.await.unwrap().unwrap();

        let c = state.lock().unwrap().clone();
        assert!(c.pin);
        assert_eq!(c.score, 1);
    }

    #[tokio::test]
    async fn last_hides_deleted_and_blocked() {
        let mut engine = MockEngine::new();
        engine.expect_last().returning(|_, _, _| {
            let mut deleted = stored("c2", "u1", 2);
            deleted.deleted = true;
            Ok(vec![stored("c1", "u1", 1), deleted, stored("c3", "bad", 3)])
        });
        engine.expect_is_blocked().returning(|_, u| Ok(u == "bad"));
        let svc = service(engine, DataServiceConfig::default());

        let ids: Vec<String> = svc.last("site", 10, None, false).await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c1"]);
        let ids: Vec<String> = svc.last("site", 10, None, true).await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn permanent_block_cascades_soft_delete() {
        let mut engine = MockEngine::new();
        engine.expect_set_block().withf(|_, _, status, ttl| *status && ttl.is_none()).times(1).returning(|_, _, _, _| Ok(()));
        engine.expect_user().returning(|_, _, _, _| Ok(vec![stored("c1", "u1", 1)]));
        engine
            .expect_delete_user()
            .withf(|_, u, mode| u == "u1" && *mode == DeleteMode::Soft)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let svc = service(engine, DataServiceConfig::default());
        svc.set_block("site", "u1", true, None).await.unwrap();

        let mut engine = MockEngine::new();
        engine.expect_set_block().times(1).returning(|_, _, _, _| Ok(()));
        engine.expect_delete_user().never();
        let svc = service(engine, DataServiceConfig::default());
        svc.set_block("site", "u1", true, Some(Duration::hours(1))).await.unwrap();
    }

    #[tokio::test]
    async fn replies_are_matched_by_parent_author() {
        let mut engine = MockEngine::new();
        engine.expect_last().returning(|_, _, _| {
            let mut r1 = stored("r1", "u2", 1);
            r1.parent_id = "p1".into();
            let mut r2 = stored("r2", "u3", 2);
            r2.parent_id = "p2".into();
            Ok(vec![r1, r2, stored("p1", "u1", 5)])
        });
        engine.expect_get().returning(|_, id| Ok(stored(id, if id == "p1" { "u1" } else { "u9" }, 10)));
        let svc = service(engine, DataServiceConfig::default());

        let replies = svc.replies("site", "u1", 10, None).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "r1");
    }

    #[tokio::test]
    async fn viewer_shaping() {
        let mut engine = MockEngine::new();
        engine.expect_is_blocked().returning(|_, _| Ok(false));
        engine.expect_is_verified().returning(|_, u| Ok(u == "author"));
        let svc = service(engine, DataServiceConfig::default());

        let mut c = stored("c1", "author", 1);
        c.user.ip = "hashed".into();
        c.votes.insert("viewer".into(), false);
        let mut comments = vec![c];

        let viewer = User { id: "viewer".into(), ..Default::default() };
        svc.prepare_for_viewer(&mut comments, Some(&viewer)).await;
        assert_eq!(comments[0].vote, -1);
        assert!(comments[0].votes.is_empty());
        assert!(comments[0].user.ip.is_empty());
        assert!(comments[0].user.verified);
    }
}
