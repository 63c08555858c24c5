//! Wildcard file name patterns
//!
//! `*` matches any run of characters and `?` matches exactly one; everything
//! else is literal. The whole name must match. Game paths are case-insensitive,
//! so matching ignores case.

use regex::Regex;

use crate::Result;

/// A compiled `*`/`?` wildcard pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: String,
    regex: Regex,
}

impl PathPattern {
    /// Compile `pattern`
    pub fn new(pattern: &str) -> Result<Self> {
        let body = regex::escape(pattern)
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        let regex = Regex::new(&format!("(?is)^{body}$"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Pattern as written
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether `name` matches the whole pattern
    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}
