//! # Cache keys
//!
//! A cache entry is identified by an id (usually the request URL) within a site and
//! tagged with scopes for bulk invalidation. The merged wire form is
//! `scope1$$scope2@@<id>@@<site>`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const SCOPE_SEPARATOR: &str = "$$";
const PART_SEPARATOR: &str = "@@";

/// Prefix applied to key ids for admin callers so admin-only fields never leak.
pub const ADMIN_KEY_PREFIX: &str = "admin!!";

/// Scope shared by every "last comments" listing of a site.
pub const LAST_COMMENTS_SCOPE: &str = "last";

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed cache key {0:?}")]
pub struct KeyParseError(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKey {
    pub site_id: String,
    pub id: String,
    pub scopes: Vec<String>,
}

impl CacheKey {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self { site_id: site_id.into(), ..Default::default() }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Marks the key as holding an admin rendering.
    pub fn admin(mut self, admin: bool) -> Self {
        if admin && !self.id.starts_with(ADMIN_KEY_PREFIX) {
            self.id = format!("{ADMIN_KEY_PREFIX}{}", self.id);
        }
        self
    }

    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Canonical string form.
    pub fn merge(&self) -> String {
        format!(
            "{}{PART_SEPARATOR}{}{PART_SEPARATOR}{}",
            self.scopes.join(SCOPE_SEPARATOR),
            self.id,
            self.site_id
        )
    }

    pub fn has_any_scope(&self, scopes: &[String]) -> bool {
        self.scopes.iter().any(|s| scopes.contains(s))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.merge())
    }
}

impl FromStr for CacheKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(PART_SEPARATOR).collect();
        if parts.len() != 3 {
            return Err(KeyParseError(s.to_string()));
        }
        let scopes = if parts[0].is_empty() {
            Vec::new()
        } else {
            parts[0].split(SCOPE_SEPARATOR).map(str::to_string).collect()
        };
        Ok(CacheKey { scopes, id: parts[1].to_string(), site_id: parts[2].to_string() })
    }
}

/// Invalidation request. Empty `scopes` drops everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushRequest {
    pub site_id: String,
    pub scopes: Vec<String>,
}

impl FlushRequest {
    pub fn new<I, S>(site_id: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            site_id: site_id.into(),
            scopes: scopes.into_iter().map(Into::into).filter(|s: &String| !s.is_empty()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_parse() {
        let key = CacheKey::new("site").id("/find?url=u").scopes(["s1", "s2"]);
        assert_eq!(key.merge(), "s1$$s2@@/find?url=u@@site");
        assert_eq!(key.merge().parse::<CacheKey>().unwrap(), key);

        let bare = CacheKey::new("site").id("k1");
        assert_eq!(bare.merge(), "@@k1@@site");
        assert_eq!(bare.merge().parse::<CacheKey>().unwrap(), bare);

        assert!("no-separators".parse::<CacheKey>().is_err());
        assert!("a@@b@@c@@d".parse::<CacheKey>().is_err());
    }

    #[test]
    fn admin_prefix_is_applied_once() {
        let key = CacheKey::new("site").id("/last/10").admin(true).admin(true);
        assert_eq!(key.id, "admin!!/last/10");
        let key = CacheKey::new("site").id("/last/10").admin(false);
        assert_eq!(key.id, "/last/10");
    }
}
