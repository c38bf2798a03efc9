//! # Inverted index
//!
//! Per-site token → document postings. A document matches when it contains every query
//! token; relevance is the share of the document's tokens that matched.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{Comment, Locator, SearchEngine, SearchHit, SearchPage, SearchQuery, SearchSort};
use tokio::sync::RwLock;

struct Document {
    locator: Locator,
    timestamp: DateTime<Utc>,
    tokens: Vec<String>,
}

#[derive(Default)]
struct SiteIndex {
    docs: HashMap<String, Document>,
    postings: HashMap<String, HashSet<String>>,
}

impl SiteIndex {
    fn remove(&mut self, id: &str) {
        let Some(doc) = self.docs.remove(id) else { return };
        for token in doc.tokens {
            if let Some(ids) = self.postings.get_mut(&token) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryIndex {
    sites: RwLock<HashMap<String, SiteIndex>>,
}

/// Lower-cased alphanumeric words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SearchEngine for MemoryIndex {
    async fn index(&self, comment: &Comment) -> anyhow::Result<()> {
        let mut tokens = tokenize(&comment.orig);
        tokens.extend(tokenize(&comment.user.name));
        let mut sites = self.sites.write().await;
        let site = sites.entry(comment.locator.site_id.clone()).or_default();
        site.remove(&comment.id);
        for token in &tokens {
            site.postings.entry(token.clone()).or_default().insert(comment.id.clone());
        }
        site.docs.insert(
            comment.id.clone(),
            Document { locator: comment.locator.clone(), timestamp: comment.timestamp, tokens },
        );
        Ok(())
    }

    async fn delete(&self, site_id: &str, id: &str) -> anyhow::Result<()> {
        if let Some(site) = self.sites.write().await.get_mut(site_id) {
            site.remove(id);
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> anyhow::Result<SearchPage> {
        let terms: HashSet<String> = tokenize(&query.query).into_iter().collect();
        let sites = self.sites.read().await;
        let Some(site) = sites.get(&query.site_id) else {
            return Ok(SearchPage::default());
        };
        if terms.is_empty() {
            return Ok(SearchPage::default());
        }

        let mut matched: Option<HashSet<&String>> = None;
        for term in &terms {
            let ids: HashSet<&String> = site.postings.get(term).map(|s| s.iter().collect()).unwrap_or_default();
            matched = Some(match matched {
                None => ids,
                Some(prev) => prev.intersection(&ids).copied().collect(),
            });
        }

        let mut hits: Vec<SearchHit> = matched
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| {
                let doc = site.docs.get(id)?;
                let hits = doc.tokens.iter().filter(|t| terms.contains(*t)).count();
                Some(SearchHit {
                    id: id.clone(),
                    locator: doc.locator.clone(),
                    timestamp: doc.timestamp,
                    relevance: hits as f64 / doc.tokens.len().max(1) as f64,
                })
            })
            .collect();

        match query.sort {
            SearchSort::Relevance => hits.sort_by(|a, b| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.timestamp.cmp(&a.timestamp))
            }),
            SearchSort::TimeAsc => hits.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
            SearchSort::TimeDesc => hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        }

        let total = hits.len();
        let hits = hits.into_iter().skip(query.skip).take(query.limit.max(1)).collect();
        Ok(SearchPage { total, hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::User;

    fn comment(id: &str, orig: &str, secs: i64) -> Comment {
        Comment {
            id: id.into(),
            orig: orig.into(),
            user: User { name: "Someone".into(), ..Default::default() },
            locator: Locator::new("site", "url"),
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            ..Default::default()
        }
    }

    fn query(q: &str, sort: SearchSort) -> SearchQuery {
        SearchQuery { site_id: "site".into(), query: q.into(), sort, skip: 0, limit: 10 }
    }

    #[tokio::test]
    async fn all_terms_must_match() {
        let index = MemoryIndex::new();
        index.index(&comment("1", "Rust is great", 1)).await.unwrap();
        index.index(&comment("2", "rust and go", 2)).await.unwrap();
        index.index(&comment("3", "nothing here", 3)).await.unwrap();

        let page = index.search(&query("RUST", SearchSort::TimeDesc)).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.hits[0].id, "2");

        let page = index.search(&query("rust great", SearchSort::Relevance)).await.unwrap();
        assert_eq!(page.hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["1"]);

        let page = index.search(&query("someone", SearchSort::TimeAsc)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits[0].id, "1");
    }

    #[tokio::test]
    async fn reindex_and_delete() {
        let index = MemoryIndex::new();
        index.index(&comment("1", "old words", 1)).await.unwrap();
        index.index(&comment("1", "new words", 1)).await.unwrap();
        assert_eq!(index.search(&query("old", SearchSort::Relevance)).await.unwrap().total, 0);
        assert_eq!(index.search(&query("new", SearchSort::Relevance)).await.unwrap().total, 1);

        index.delete("site", "1").await.unwrap();
        assert_eq!(index.search(&query("words", SearchSort::Relevance)).await.unwrap().total, 0);
    }
}
