//! Restricted-words matching. `*` in a configured word matches any run of word characters,
//! so `spam*` also catches `spammer`.

use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone, Default)]
pub struct RestrictedWords {
    matcher: Option<Regex>,
}

impl RestrictedWords {
    pub fn new<S: AsRef<str>>(words: &[S]) -> Self {
        let patterns: Vec<String> = words
            .iter()
            .map(|w| w.as_ref().trim())
            .filter(|w| !w.is_empty())
            .map(|w| regex::escape(w).replace(r"\*", r"\w*"))
            .collect();
        if patterns.is_empty() {
            return Self::default();
        }
        let matcher = RegexBuilder::new(&format!(r"\b(?:{})\b", patterns.join("|")))
            .case_insensitive(true)
            .build()
            .map_err(|e| tracing::warn!("can't compile restricted words, {e}"))
            .ok();
        Self { matcher }
    }

    /// True when `text` contains any restricted word.
    pub fn check(&self, text: &str) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_whole_words_ignoring_case() {
        let words = RestrictedWords::new(&["bad", "spam*"]);
        assert!(words.check("this is BAD"));
        assert!(words.check("a spammer was here"));
        assert!(!words.check("badge and bandwidth"));
        assert!(!RestrictedWords::new::<&str>(&[]).check("bad"));
        assert!(!RestrictedWords::new(&["  "]).check("anything"));
    }
}
