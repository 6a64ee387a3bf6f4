//! Match patterns route the sub-host part of a request to a microservice.
//!
//! A pattern is a dot-separated label sequence such as `api`, `*.app` or `@`.
//! A `*` label matches one or more characters; every other label matches
//! literally (case-insensitive). Patterns are kept in a [`MatchTable`] sorted
//! by [`compare`], so a linear scan returns the most specific match.

use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::fmt;

/// Label that matches one or more characters
pub const WILDCARD: &str = "*";

/// Query used when the request addresses the project root
pub const ROOT_QUERY: &str = "@";

/// A compiled match pattern
#[derive(Debug, Clone)]
pub struct MatchPattern {
    pattern: String,
    regex: Regex,
}

impl MatchPattern {
    /// Compile a pattern into an anchored whole-string matcher
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() || pattern.split('.').any(str::is_empty) {
            return Err(Error::config(format!("Invalid match pattern: '{}'", pattern)));
        }

        let source = pattern
            .split('.')
            .map(|label| {
                if label == WILDCARD {
                    ".+".to_string()
                } else {
                    regex::escape(label)
                }
            })
            .collect::<Vec<_>>()
            .join(r"\.");

        let regex = RegexBuilder::new(&format!("^{}$", source))
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::config(format!("Invalid match pattern '{}': {}", pattern, e)))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, query: &str) -> bool {
        self.regex.is_match(query)
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:({})", self.pattern, self.regex.as_str())
    }
}

/// Order two patterns by match priority. `Less` means `a` is more specific
/// and must be tried before `b`.
///
/// Deeper patterns win. Between patterns of equal depth, the first label
/// (leftmost, most significant) where exactly one of them is a wildcard
/// decides: the literal label wins.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a_labels: Vec<&str> = a.split('.').collect();
    let b_labels: Vec<&str> = b.split('.').collect();

    let by_depth = b_labels.len().cmp(&a_labels.len());
    if by_depth != Ordering::Equal {
        return by_depth;
    }

    for (a_label, b_label) in a_labels.iter().zip(&b_labels) {
        let a_wild = *a_label == WILDCARD;
        let b_wild = *b_label == WILDCARD;
        if a_wild != b_wild {
            return if a_wild { Ordering::Greater } else { Ordering::Less };
        }
    }

    Ordering::Equal
}

/// Patterns and the ids they route to, always sorted by priority
#[derive(Debug, Default)]
pub struct MatchTable {
    entries: Vec<(MatchPattern, String)>,
}

impl MatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the position that keeps the table sorted. Among patterns of
    /// equal priority, earlier insertions stay first.
    pub fn insert(&mut self, pattern: MatchPattern, id: &str) {
        let index = self
            .entries
            .partition_point(|(existing, _)| compare(existing.as_str(), pattern.as_str()) != Ordering::Greater);
        self.entries.insert(index, (pattern, id.to_string()));
    }

    /// Id owning the first (most specific) pattern that matches `query`
    pub fn find(&self, query: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.is_match(query))
            .map(|(_, id)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, id)| id.as_str())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &MatchPattern> {
        self.entries.iter().map(|(pattern, _)| pattern)
    }

    /// Table rendered for debug logs
    pub fn describe(&self) -> String {
        self.patterns().map(|p| p.to_string()).collect::<Vec<_>>().join(" ")
    }
}
