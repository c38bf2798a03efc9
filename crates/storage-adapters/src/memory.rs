//! # In-memory engine
//!
//! Reference [`Engine`] keeping everything in process memory. Comments of a post are
//! kept in insertion order; per-user counters are maintained on create and delete.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use domains::{BlockedUser, Comment, DeleteMode, Engine, EngineError, Locator, PostInfo, UserDetail};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct MemoryEngine {
    /// Empty means any site is accepted.
    allowed_sites: HashSet<String>,
    sites: RwLock<HashMap<String, SiteData>>,
}

#[derive(Default)]
struct SiteData {
    posts: HashMap<String, PostData>,
    blocks: HashMap<String, BlockedUser>,
    verified: HashSet<String>,
    details: HashMap<String, HashMap<UserDetail, String>>,
    user_counts: HashMap<String, usize>,
}

#[derive(Default)]
struct PostData {
    comments: Vec<Comment>,
    read_only: bool,
}

impl PostData {
    fn comment_mut(&mut self, locator: &Locator, id: &str) -> anyhow::Result<&mut Comment> {
        self.comments
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found(locator, id))
    }

    fn info(&self, url: &str) -> PostInfo {
        let live = self.comments.iter().filter(|c| !c.is_hard_deleted());
        let mut info = PostInfo { url: url.to_string(), read_only: self.read_only, ..Default::default() };
        for c in live {
            info.count += 1;
            info.first_ts = Some(info.first_ts.map_or(c.timestamp, |f| f.min(c.timestamp)));
            info.last_ts = Some(info.last_ts.map_or(c.timestamp, |l| l.max(c.timestamp)));
        }
        info
    }
}

fn not_found(locator: &Locator, id: &str) -> anyhow::Error {
    EngineError::NotFound { locator: locator.to_string(), id: id.to_string() }.into()
}

fn changed_since(c: &Comment, since: Option<DateTime<Utc>>) -> bool {
    match since {
        None => true,
        Some(ts) => c.timestamp > ts || c.edit.as_ref().is_some_and(|e| e.timestamp > ts),
    }
}

fn page<T>(items: Vec<T>, limit: usize, skip: usize) -> Vec<T> {
    let iter = items.into_iter().skip(skip);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

impl MemoryEngine {
    pub fn new<I, S>(sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed_sites: sites.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    fn check_site(&self, site_id: &str) -> anyhow::Result<()> {
        if site_id.is_empty() || (!self.allowed_sites.is_empty() && !self.allowed_sites.contains(site_id)) {
            return Err(EngineError::SiteNotFound(site_id.to_string()).into());
        }
        Ok(())
    }

    fn apply_delete(site: &mut SiteData, comment: &mut Comment, mode: DeleteMode) {
        if !comment.deleted {
            if let Some(n) = site.user_counts.get_mut(&comment.user.id) {
                *n = n.saturating_sub(1);
            }
        }
        comment.set_deleted(mode);
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn create(&self, comment: &Comment) -> anyhow::Result<String> {
        self.check_site(&comment.locator.site_id)?;
        let mut sites = self.sites.write().await;
        let site = sites.entry(comment.locator.site_id.clone()).or_default();
        let post = site.posts.entry(comment.locator.url.clone()).or_default();

        if post.comments.iter().any(|c| c.id == comment.id) {
            anyhow::bail!("comment {} already exists in {}", comment.id, comment.locator);
        }
        if !comment.parent_id.is_empty() && !post.comments.iter().any(|c| c.id == comment.parent_id) {
            return Err(EngineError::ParentNotFound(comment.parent_id.clone()).into());
        }
        post.comments.push(comment.clone());
        *site.user_counts.entry(comment.user.id.clone()).or_default() += 1;
        Ok(comment.id.clone())
    }

    async fn get(&self, locator: &Locator, id: &str) -> anyhow::Result<Comment> {
        self.check_site(&locator.site_id)?;
        let sites = self.sites.read().await;
        sites
            .get(&locator.site_id)
            .and_then(|s| s.posts.get(&locator.url))
            .and_then(|p| p.comments.iter().find(|c| c.id == id))
            .cloned()
            .ok_or_else(|| not_found(locator, id))
    }

    async fn find(&self, locator: &Locator, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Comment>> {
        self.check_site(&locator.site_id)?;
        let sites = self.sites.read().await;
        let Some(post) = sites.get(&locator.site_id).and_then(|s| s.posts.get(&locator.url)) else {
            return Ok(Vec::new());
        };
        Ok(post.comments.iter().filter(|c| changed_since(c, since)).cloned().collect())
    }

    async fn last(&self, site_id: &str, limit: usize, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<Comment>> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        let Some(site) = sites.get(site_id) else {
            return Ok(Vec::new());
        };
        let mut comments: Vec<Comment> = site
            .posts
            .values()
            .flat_map(|p| p.comments.iter())
            .filter(|c| since.map_or(true, |ts| c.timestamp > ts))
            .cloned()
            .collect();
        comments.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(page(comments, limit, 0))
    }

    async fn user(&self, site_id: &str, user_id: &str, limit: usize, skip: usize) -> anyhow::Result<Vec<Comment>> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        let Some(site) = sites.get(site_id) else {
            return Ok(Vec::new());
        };
        let mut comments: Vec<Comment> = site
            .posts
            .values()
            .flat_map(|p| p.comments.iter())
            .filter(|c| c.user.id == user_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(page(comments, limit, skip))
    }

    async fn user_count(&self, site_id: &str, user_id: &str) -> anyhow::Result<usize> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        Ok(sites
            .get(site_id)
            .and_then(|s| s.user_counts.get(user_id))
            .copied()
            .unwrap_or_default())
    }

    async fn edit_comment(&self, comment: &Comment) -> anyhow::Result<()> {
        self.check_site(&comment.locator.site_id)?;
        let mut sites = self.sites.write().await;
        let stored = sites
            .get_mut(&comment.locator.site_id)
            .and_then(|s| s.posts.get_mut(&comment.locator.url))
            .ok_or_else(|| not_found(&comment.locator, &comment.id))?
            .comment_mut(&comment.locator, &comment.id)?;
        *stored = comment.clone();
        Ok(())
    }

    async fn delete(&self, locator: &Locator, id: &str, mode: DeleteMode) -> anyhow::Result<()> {
        self.check_site(&locator.site_id)?;
        let mut sites = self.sites.write().await;
        let site = sites.get_mut(&locator.site_id).ok_or_else(|| not_found(locator, id))?;
        let mut post = site.posts.remove(&locator.url).ok_or_else(|| not_found(locator, id))?;
        let result = post.comment_mut(locator, id).map(|c| Self::apply_delete(site, c, mode));
        site.posts.insert(locator.url.clone(), post);
        result
    }

    async fn delete_user(&self, site_id: &str, user_id: &str, mode: DeleteMode) -> anyhow::Result<()> {
        self.check_site(site_id)?;
        let mut sites = self.sites.write().await;
        let Some(site) = sites.get_mut(site_id) else {
            return Ok(());
        };
        let mut posts = std::mem::take(&mut site.posts);
        let mut count = 0;
        for post in posts.values_mut() {
            for c in post.comments.iter_mut().filter(|c| c.user.id == user_id) {
                Self::apply_delete(site, c, mode);
                count += 1;
            }
        }
        site.posts = posts;
        debug!(site = site_id, user = user_id, count, "deleted user comments");
        Ok(())
    }

    async fn user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail) -> anyhow::Result<String> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        Ok(sites
            .get(site_id)
            .and_then(|s| s.details.get(user_id))
            .and_then(|d| d.get(&detail))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail, value: &str) -> anyhow::Result<()> {
        self.check_site(site_id)?;
        if detail == UserDetail::All {
            anyhow::bail!("can't set all user details at once");
        }
        let mut sites = self.sites.write().await;
        let details = sites.entry(site_id.to_string()).or_default().details.entry(user_id.to_string()).or_default();
        if value.is_empty() {
            details.remove(&detail);
        } else {
            details.insert(detail, value.to_string());
        }
        Ok(())
    }

    async fn delete_user_detail(&self, site_id: &str, user_id: &str, detail: UserDetail) -> anyhow::Result<()> {
        self.check_site(site_id)?;
        let mut sites = self.sites.write().await;
        if let Some(site) = sites.get_mut(site_id) {
            match detail {
                UserDetail::All => {
                    site.details.remove(user_id);
                }
                one => {
                    if let Some(d) = site.details.get_mut(user_id) {
                        d.remove(&one);
                    }
                }
            }
        }
        Ok(())
    }

    async fn info(&self, locator: &Locator) -> anyhow::Result<PostInfo> {
        self.check_site(&locator.site_id)?;
        let sites = self.sites.read().await;
        Ok(sites
            .get(&locator.site_id)
            .and_then(|s| s.posts.get(&locator.url))
            .map(|p| p.info(&locator.url))
            .unwrap_or_else(|| PostInfo { url: locator.url.clone(), ..Default::default() }))
    }

    async fn counts(&self, site_id: &str, urls: &[String]) -> anyhow::Result<Vec<PostInfo>> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        let site = sites.get(site_id);
        Ok(urls
            .iter()
            .map(|url| {
                let count = site.and_then(|s| s.posts.get(url)).map_or(0, |p| p.info(url).count);
                PostInfo { url: url.clone(), count, ..Default::default() }
            })
            .collect())
    }

    async fn list(&self, site_id: &str, limit: usize, skip: usize) -> anyhow::Result<Vec<PostInfo>> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        let Some(site) = sites.get(site_id) else {
            return Ok(Vec::new());
        };
        let mut posts: Vec<PostInfo> = site
            .posts
            .iter()
            .map(|(url, p)| p.info(url))
            .filter(|info| info.count > 0)
            .collect();
        posts.sort_by(|a, b| b.last_ts.cmp(&a.last_ts));
        Ok(page(posts, limit, skip))
    }

    async fn set_read_only(&self, locator: &Locator, status: bool) -> anyhow::Result<()> {
        self.check_site(&locator.site_id)?;
        let mut sites = self.sites.write().await;
        sites
            .entry(locator.site_id.clone())
            .or_default()
            .posts
            .entry(locator.url.clone())
            .or_default()
            .read_only = status;
        Ok(())
    }

    async fn is_read_only(&self, locator: &Locator) -> anyhow::Result<bool> {
        self.check_site(&locator.site_id)?;
        let sites = self.sites.read().await;
        Ok(sites
            .get(&locator.site_id)
            .and_then(|s| s.posts.get(&locator.url))
            .is_some_and(|p| p.read_only))
    }

    async fn set_pin(&self, locator: &Locator, id: &str, status: bool) -> anyhow::Result<()> {
        self.check_site(&locator.site_id)?;
        let mut sites = self.sites.write().await;
        let post = sites
            .get_mut(&locator.site_id)
            .and_then(|s| s.posts.get_mut(&locator.url))
            .ok_or_else(|| not_found(locator, id))?;
        post.comment_mut(locator, id)?.pin = status;
        Ok(())
    }

    async fn set_title(&self, locator: &Locator, title: &str) -> anyhow::Result<()> {
        self.check_site(&locator.site_id)?;
        let mut sites = self.sites.write().await;
        if let Some(post) = sites.get_mut(&locator.site_id).and_then(|s| s.posts.get_mut(&locator.url)) {
            for c in &mut post.comments {
                c.post_title = title.to_string();
            }
        }
        Ok(())
    }

    async fn set_block(&self, site_id: &str, user_id: &str, status: bool, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.check_site(site_id)?;
        let mut sites = self.sites.write().await;
        let site = sites.entry(site_id.to_string()).or_default();
        if !status {
            site.blocks.remove(user_id);
            return Ok(());
        }
        let name = site
            .posts
            .values()
            .flat_map(|p| p.comments.iter())
            .filter(|c| c.user.id == user_id)
            .max_by_key(|c| c.timestamp)
            .map(|c| c.user.name.clone())
            .unwrap_or_default();
        let until = ttl.map(|t| Utc::now() + t);
        site.blocks.insert(user_id.to_string(), BlockedUser { id: user_id.to_string(), name, until });
        Ok(())
    }

    async fn is_blocked(&self, site_id: &str, user_id: &str) -> anyhow::Result<bool> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        let now = Utc::now();
        Ok(sites
            .get(site_id)
            .and_then(|s| s.blocks.get(user_id))
            .is_some_and(|b| b.until.map_or(true, |until| until > now)))
    }

    async fn blocked_users(&self, site_id: &str) -> anyhow::Result<Vec<BlockedUser>> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        let now = Utc::now();
        let mut blocked: Vec<BlockedUser> = sites
            .get(site_id)
            .map(|s| {
                s.blocks
                    .values()
                    .filter(|b| b.until.map_or(true, |until| until > now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        blocked.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(blocked)
    }

    async fn set_verified(&self, site_id: &str, user_id: &str, status: bool) -> anyhow::Result<()> {
        self.check_site(site_id)?;
        let mut sites = self.sites.write().await;
        let verified = &mut sites.entry(site_id.to_string()).or_default().verified;
        if status {
            verified.insert(user_id.to_string());
        } else {
            verified.remove(user_id);
        }
        Ok(())
    }

    async fn is_verified(&self, site_id: &str, user_id: &str) -> anyhow::Result<bool> {
        self.check_site(site_id)?;
        let sites = self.sites.read().await;
        Ok(sites.get(site_id).is_some_and(|s| s.verified.contains(user_id)))
    }
}
