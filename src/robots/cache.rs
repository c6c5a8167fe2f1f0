//! Robots.txt caching implementation

use crate::robots::ParsedRobots;
use chrono::{DateTime, Duration, Utc};

/// Cached robots.txt data for one origin
#[derive(Debug, Clone)]
pub struct CachedRobots {
    /// The parsed robots.txt content
    pub content: ParsedRobots,

    /// When the robots.txt was fetched
    pub fetched_at: DateTime<Utc>,

    /// How long the entry stays valid
    pub ttl: Duration,
}

impl CachedRobots {
    /// Creates a new entry stamped with the current time
    pub fn new(content: ParsedRobots, ttl: Duration) -> Self {
        Self {
            content,
            fetched_at: Utc::now(),
            ttl,
        }
    }

    /// Checks if the entry is older than its TTL at `now`
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > self.ttl
    }

    /// Checks if the entry is older than its TTL
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}
