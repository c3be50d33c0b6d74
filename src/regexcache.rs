//! Compile-once regex cache.
//!
//! Modules tend to run the same expression on every invocation, so
//! compiled regexes are cached per instance keyed by (pattern,
//! case-insensitivity).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};

/// Per-instance cache of compiled expressions.
#[derive(Debug, Default)]
pub struct RegexCache {
    map: Mutex<HashMap<(String, bool), Arc<Regex>>>,
}

impl RegexCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or compile `pattern`.
    pub fn compile(&self, pattern: &str, icase: bool) -> Result<Arc<Regex>, regex::Error> {
        let key = (pattern.to_string(), icase);
        if let Some(found) = self.map.lock().get(&key) {
            return Ok(Arc::clone(found));
        }

        let compiled = Arc::new(
            RegexBuilder::new(pattern)
                .case_insensitive(icase)
                .build()?,
        );
        self.map.lock().insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Number of cached expressions.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_reuses_compilation() {
        let cache = RegexCache::new();
        let a = cache.compile(r"\d+", false).unwrap();
        let b = cache.compile(r"\d+", false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_case_flag_is_part_of_key() {
        let cache = RegexCache::new();
        let sensitive = cache.compile("abc", false).unwrap();
        let insensitive = cache.compile("abc", true).unwrap();
        assert!(!Arc::ptr_eq(&sensitive, &insensitive));
        assert!(insensitive.is_match("ABC"));
        assert!(!sensitive.is_match("ABC"));
    }

    #[test]
    fn test_invalid_pattern_errors() {
        let cache = RegexCache::new();
        assert!(cache.compile("(unclosed", false).is_err());
        assert!(cache.is_empty());
    }
}
