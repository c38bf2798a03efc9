//! # Search queries
//!
//! Value types shared between the search service and index engines.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Locator;

/// Upper bound on a single result page.
pub const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchSort {
    #[default]
    Relevance,
    TimeAsc,
    TimeDesc,
}

impl FromStr for SearchSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "score" | "-score" => Ok(SearchSort::Relevance),
            "time" | "+time" => Ok(SearchSort::TimeAsc),
            "-time" => Ok(SearchSort::TimeDesc),
            other => Err(format!("unknown search sort {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub site_id: String,
    pub query: String,
    pub sort: SearchSort,
    pub skip: usize,
    pub limit: usize,
}

/// One matching document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub locator: Locator,
    pub timestamp: DateTime<Utc>,
    pub relevance: f64,
}

/// A page of hits plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_keys() {
        assert_eq!("".parse::<SearchSort>().unwrap(), SearchSort::Relevance);
        assert_eq!("+time".parse::<SearchSort>().unwrap(), SearchSort::TimeAsc);
        assert_eq!("-time".parse::<SearchSort>().unwrap(), SearchSort::TimeDesc);
        assert!("-active".parse::<SearchSort>().is_err());
    }
}
