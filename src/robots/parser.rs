//! Robots.txt parser implementation
//!
//! This module wraps the robotstxt crate behind a small policy type.

use robotstxt::DefaultMatcher;

/// Parsed robots.txt data
///
/// Matching is done on demand against the raw content; an empty or
/// unreadable file allows everything.
#[derive(Debug, Clone)]
pub struct ParsedRobots {
    /// Raw robots.txt content (empty string means allow all)
    content: String,
    /// Set when robots.txt could not be fetched
    allow_all: bool,
}

impl ParsedRobots {
    /// Creates a new ParsedRobots from raw robots.txt content
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
            allow_all: false,
        }
    }

    /// Creates a permissive ParsedRobots that allows everything
    ///
    /// This is used when robots.txt is missing or cannot be fetched.
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
            allow_all: true,
        }
    }

    /// Returns true if this policy was produced by a failed or missing fetch
    pub fn is_allow_all(&self) -> bool {
        self.allow_all
    }

    /// Checks if a URL is allowed for the given robots product token
    ///
    /// # Arguments
    ///
    /// * `url` - The absolute URL to check
    /// * `agent_token` - The crawler name, e.g. "Market-Ingest"
    pub fn is_allowed(&self, url: &str, agent_token: &str) -> bool {
        if self.allow_all || self.content.trim().is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, agent_token, url)
    }
}
