//! Admin list taken from configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use domains::AdminStore;

#[derive(Debug, Clone, Default)]
pub struct StaticAdminStore {
    admins: HashMap<String, Vec<String>>,
    /// Admins listed under this key apply to every site.
    shared: Vec<String>,
    email: String,
}

impl StaticAdminStore {
    pub fn new(admins: HashMap<String, Vec<String>>, shared: Vec<String>, email: impl Into<String>) -> Self {
        Self { admins, shared, email: email.into() }
    }
}

#[async_trait]
impl AdminStore for StaticAdminStore {
    async fn admins(&self, site_id: &str) -> anyhow::Result<Vec<String>> {
        let mut res = self.shared.clone();
        if let Some(site_admins) = self.admins.get(site_id) {
            res.extend(site_admins.iter().filter(|a| !self.shared.contains(a)).cloned());
        }
        Ok(res)
    }

    async fn email(&self, _site_id: &str) -> anyhow::Result<String> {
        Ok(self.email.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_shared_and_site_admins() {
        let store = StaticAdminStore::new(
            HashMap::from([("s1".to_string(), vec!["a".to_string(), "b".to_string()])]),
            vec!["a".to_string()],
            "admin@example.com",
        );
        assert_eq!(store.admins("s1").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.admins("s2").await.unwrap(), vec!["a"]);
        assert_eq!(store.email("s1").await.unwrap(), "admin@example.com");
    }
}
