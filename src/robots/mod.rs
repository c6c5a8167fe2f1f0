//! Robots.txt handling module
//!
//! Fetches, parses and caches the target site's crawl policy. A robots.txt
//! that is missing, unreachable or answers with a non-2xx status is treated
//! as allow-all.

mod cache;
mod parser;

pub use cache::CachedRobots;
pub use parser::ParsedRobots;

use reqwest::Client;
use url::Url;

/// Returns the robots.txt URL for the origin of `url`
pub fn robots_url(url: &Url) -> Option<Url> {
    url.host_str()?;
    url.join("/robots.txt").ok()
}

/// Returns the cache key for the origin of `url` (scheme, host and port)
pub fn origin_key(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Fetches and parses robots.txt from `robots_url`
///
/// Never fails: any network or HTTP error yields an allow-all policy.
/// Callers are responsible for pacing this request.
///
/// # Arguments
///
/// * `client` - The shared HTTP client
/// * `robots_url` - Absolute URL of the robots.txt file
pub async fn fetch_robots(client: &Client, robots_url: &Url) -> ParsedRobots {
    let response = match client.get(robots_url.as_str()).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Failed to fetch {}: {}; allowing all", robots_url, e);
            return ParsedRobots::allow_all();
        }
    };

    let status = response.status();
    if !status.is_success() {
        tracing::info!("{} returned HTTP {}; allowing all", robots_url, status.as_u16());
        return ParsedRobots::allow_all();
    }

    match response.text().await {
        Ok(body) => {
            tracing::debug!("Fetched {} ({} bytes)", robots_url, body.len());
            ParsedRobots::from_content(&body)
        }
        Err(e) => {
            tracing::warn!("Failed to read {}: {}; allowing all", robots_url, e);
            ParsedRobots::allow_all()
        }
    }
}
