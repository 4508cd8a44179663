//! Wildcard name patterns (`*` and `?`) used by the hide stage and the
//! attribute pass.

use glob::{MatchOptions, Pattern};

use crate::error::PackError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A single wildcard pattern.
///
/// Only `*` and `?` are special; every other character, brackets included,
/// matches literally. Matching is case-insensitive and is attempted against
/// both the full container path and its basename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    raw: String,
    compiled: Pattern,
}

impl WildcardPattern {
    pub fn new(raw: &str) -> Result<Self, PackError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PackError::unsupported("empty wildcard pattern"));
        }

        let mut escaped = String::with_capacity(raw.len());
        let mut literal = String::new();
        for c in raw.chars() {
            if c == '*' || c == '?' {
                escaped.push_str(&Pattern::escape(&literal));
                literal.clear();
                escaped.push(c);
            } else {
                literal.push(c);
            }
        }
        escaped.push_str(&Pattern::escape(&literal));

        let compiled = Pattern::new(&escaped)
            .map_err(|e| PackError::unsupported(format!("invalid pattern '{raw}': {e}")))?;

        Ok(Self {
            raw: raw.to_string(),
            compiled,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a `/` separated container path.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.compiled.matches_with(path, MATCH_OPTIONS)
            || self.compiled.matches_with(basename, MATCH_OPTIONS)
    }
}

/// Parse a comma-separated pattern list such as `icon?.*,evil.exe`.
pub fn parse_pattern_list(raw: &str) -> Result<Vec<WildcardPattern>, PackError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(WildcardPattern::new)
        .collect()
}

/// True if any pattern in the list matches `path`.
pub fn any_match(patterns: &[WildcardPattern], path: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(path))
}
