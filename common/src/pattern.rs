use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref COMPILED: Mutex<HashMap<String, Regex>> = Mutex::new(HashMap::new());
}

/// A database/table filter: a single glob or a list of alternative globs.
/// `*` matches any run of characters, `?` a single character.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PatternList {
    Single(String),
    Many(Vec<String>),
}

impl Default for PatternList {
    fn default() -> Self {
        PatternList::Single(String::new())
    }
}

impl PatternList {
    pub fn is_empty(&self) -> bool {
        match self {
            PatternList::Single(p) => p.is_empty(),
            PatternList::Many(ps) => ps.iter().all(|p| p.is_empty()),
        }
    }

    fn patterns(&self) -> Vec<&str> {
        match self {
            PatternList::Single(p) => vec![p.as_str()],
            PatternList::Many(ps) => ps.iter().map(|p| p.as_str()).collect(),
        }
    }

    /// Include semantics: an empty pattern list (or `*`) matches everything.
    pub fn matches(&self, name: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        self.patterns()
            .iter()
            .any(|p| *p == "*" || glob_matches(p, name))
    }

    /// Exclude semantics: an empty pattern list matches nothing.
    pub fn matches_for_exclude(&self, name: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        self.patterns()
            .iter()
            .any(|p| !p.is_empty() && (*p == "*" || glob_matches(p, name)))
    }
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    let mut cache = match COMPILED.lock() {
        Ok(cache) => cache,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !cache.contains_key(pattern) {
        let re = glob_to_regex(pattern);
        cache.insert(pattern.to_string(), re);
    }
    cache[pattern].is_match(name)
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    // the expression is built from escaped literals, it always compiles
    Regex::new(&expr).unwrap_or_else(|_| Regex::new("^$").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_include_matches_all() {
        let patterns = PatternList::default();
        assert!(patterns.matches("anything"));
        assert!(!patterns.matches_for_exclude("anything"));
    }

    #[test]
    fn test_single_glob() {
        let patterns = PatternList::Single("test_db_*".to_string());
        assert!(patterns.matches("test_db_1"));
        assert!(patterns.matches("test_db_"));
        assert!(!patterns.matches("other_db"));
        assert!(!patterns.matches("prefix_test_db_1"));
    }

    #[test]
    fn test_question_mark() {
        let patterns = PatternList::Single("db_?".to_string());
        assert!(patterns.matches("db_1"));
        assert!(!patterns.matches("db_12"));
    }

    #[test]
    fn test_alternatives() {
        let patterns =
            PatternList::Many(vec!["customers".to_string(), "orders_*".to_string()]);
        assert!(patterns.matches("customers"));
        assert!(patterns.matches("orders_2024"));
        assert!(!patterns.matches("payments"));
    }

    #[test]
    fn test_special_characters_are_literal() {
        let patterns = PatternList::Single("a.b".to_string());
        assert!(patterns.matches("a.b"));
        assert!(!patterns.matches("axb"));
    }
}
