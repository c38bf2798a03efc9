//! # Search service
//!
//! Routes documents of the enabled sites to a pluggable [`SearchEngine`] and resolves
//! hits back into comments. Indexing failures are logged, never surfaced to writers.

use std::collections::HashSet;
use std::sync::Arc;

use domains::{AppError, Comment, Engine, Result, SearchEngine, SearchQuery, MAX_SEARCH_LIMIT};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub total: usize,
    pub comments: Vec<Comment>,
}

pub struct SearchService {
    index: Arc<dyn SearchEngine>,
    store: Arc<dyn Engine>,
    sites: HashSet<String>,
}

impl SearchService {
    pub fn new<I, S>(index: Arc<dyn SearchEngine>, store: Arc<dyn Engine>, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { index, store, sites: sites.into_iter().map(Into::into).collect() }
    }

    pub fn enabled_for(&self, site_id: &str) -> bool {
        self.sites.contains(site_id)
    }

    pub async fn index(&self, comment: &Comment) {
        if !self.enabled_for(&comment.locator.site_id) || comment.deleted {
            return;
        }
        if let Err(e) = self.index.index(comment).await {
            warn!("can't index comment {}, {e}", comment.id);
        }
    }

    pub async fn delete(&self, site_id: &str, id: &str) {
        if !self.enabled_for(site_id) {
            return;
        }
        if let Err(e) = self.index.delete(site_id, id).await {
            warn!("can't remove comment {id} from index, {e}");
        }
    }

    /// Fills the index for a site from storage, e.g. after a restart.
    pub async fn reindex(&self, site_id: &str) -> Result<usize> {
        if !self.enabled_for(site_id) {
            return Err(AppError::SiteNotFound(site_id.to_string()));
        }
        let comments = self.store.last(site_id, 0, None).await.map_err(AppError::from_engine)?;
        let mut count = 0;
        for c in comments.iter().filter(|c| !c.deleted) {
            self.index.index(c).await.map_err(AppError::Internal)?;
            count += 1;
        }
        debug!(site = site_id, count, "search index rebuilt");
        Ok(count)
    }

    pub async fn search(&self, mut query: SearchQuery) -> Result<SearchResults> {
        if !self.enabled_for(&query.site_id) {
            return Err(AppError::SiteNotFound(query.site_id));
        }
        if query.query.trim().is_empty() {
            return Err(AppError::Decode("empty search query".into()));
        }
        if query.limit == 0 || query.limit > MAX_SEARCH_LIMIT {
            query.limit = MAX_SEARCH_LIMIT;
        }
        let page = self.index.search(&query).await.map_err(AppError::Internal)?;
        let mut comments = Vec::with_capacity(page.hits.len());
        for hit in page.hits {
            match self.store.get(&hit.locator, &hit.id).await {
                Ok(c) if !c.deleted => comments.push(c),
                Ok(_) => {}
                Err(e) => debug!("search hit {} is gone, {e}", hit.id),
            }
        }
        Ok(SearchResults { total: page.total, comments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domains::{Locator, MockEngine, MockSearchEngine, SearchHit, SearchPage};

    #[tokio::test]
    async fn only_enabled_sites_are_indexed() {
        let mut index = MockSearchEngine::new();
        index.expect_index().withf(|c| c.locator.site_id == "on").times(1).returning(|_| Ok(()));
        let svc = SearchService::new(Arc::new(index), Arc::new(MockEngine::new()), ["on"]);

        let mut c = Comment { id: "1".into(), locator: Locator::new("on", "u"), ..Default::default() };
        svc.index(&c).await;
        c.locator.site_id = "off".into();
        svc.index(&c).await;
    }

    #[tokio::test]
    async fn hits_resolve_to_comments() {
        let mut index = MockSearchEngine::new();
        index.expect_search().returning(|q| {
            assert_eq!(q.limit, MAX_SEARCH_LIMIT);
            Ok(SearchPage {
                total: 2,
                hits: ["1", "2"]
                    .iter()
                    .map(|id| SearchHit {
                        id: id.to_string(),
                        locator: Locator::new("s", "u"),
                        timestamp: Utc::now(),
                        relevance: 1.0,
                    })
                    .collect(),
            })
        });
        let mut store = MockEngine::new();
        store.expect_get().returning(|_, id| {
            if id == "1" {
                Ok(Comment { id: id.into(), ..Default::default() })
            } else {
                Err(anyhow::anyhow!("gone"))
            }
        });
        let svc = SearchService::new(Arc::new(index), Arc::new(store), ["s"]);

        let res = svc
            .search(SearchQuery { site_id: "s".into(), query: "hello".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(res.total, 2);
        assert_eq!(res.comments.len(), 1);

        let err = svc
            .search(SearchQuery { site_id: "other".into(), query: "hello".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), domains::ErrorCode::SiteNotFound);
    }
}
