//! Copies provider avatars into the local [`AvatarStore`] so pages never hot-link
//! identity providers.

use std::sync::Arc;
use std::time::Duration;

use domains::{AvatarStore, User};
use tracing::{debug, warn};

pub struct AvatarProxy {
    store: Arc<dyn AvatarStore>,
    /// Public prefix the stored avatars are served under, e.g. `https://host/api/v1/avatar`.
    route_url: String,
    http: reqwest::Client,
}

impl AvatarProxy {
    pub fn new(store: Arc<dyn AvatarStore>, route_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { store, route_url: route_url.into().trim_end_matches('/').to_string(), http })
    }

    pub fn store(&self) -> Arc<dyn AvatarStore> {
        self.store.clone()
    }

    /// Fetches `user.picture` and returns the local URL of the stored copy.
    pub async fn put(&self, user: &User) -> anyhow::Result<String> {
        if user.picture.is_empty() {
            anyhow::bail!("user {} has no picture", user.id);
        }
        let resp = self.http.get(&user.picture).send().await?.error_for_status()?;
        let data = resp.bytes().await?;
        let avatar = self.store.put(&user.id, data).await?;
        debug!(user = %user.id, avatar, "avatar stored");
        Ok(format!("{}/{avatar}", self.route_url))
    }

    /// The user with a local picture URL, or unchanged when the copy fails.
    pub async fn localize(&self, mut user: User) -> User {
        match self.put(&user).await {
            Ok(url) => user.picture = url,
            Err(e) => warn!("can't store avatar of {}, {e:#}", user.id),
        }
        user
    }
}
