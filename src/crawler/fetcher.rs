//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests to the target marketplace:
//! - Building the HTTP client with the crawler's user agent and cookie
//! - Robots.txt compliance before any network call
//! - Pacing every attempt through the shared rate limiter
//! - Retry with exponential backoff for transient failures
//! - Error classification

use crate::config::{AppConfig, FetchConfig, UserAgentConfig};
use crate::crawler::RateLimiter;
use crate::robots::{fetch_robots, origin_key, robots_url, CachedRobots, ParsedRobots};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

/// Longest wait honoured from a Retry-After header or computed backoff
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Page-level fetch failures
///
/// None of these abort a run; the crawler logs them and moves on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Disallowed by robots.txt: {url}")]
    PolicyDenied { url: String },

    #[error("Gave up on {url} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// A successfully fetched page
#[derive(Debug, Clone)]
pub struct RawPage {
    /// Final URL after redirects
    pub url: Url,
    /// HTTP status code
    pub status: u16,
    /// Page body content
    pub body: String,
}

/// How a single failed attempt should be handled
#[derive(Debug)]
enum AttemptFailure {
    /// Worth retrying, optionally after a server-requested delay
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help
    Permanent(FetchError),
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `user_agent` - The user agent configuration
/// * `fetch` - Timeouts for each request
/// * `cookie` - Optional Cookie header sent with every request
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(FetchError)` - Failed to build client
pub fn build_http_client(
    user_agent: &UserAgentConfig,
    fetch: &FetchConfig,
    cookie: Option<&str>,
) -> Result<Client, FetchError> {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| FetchError::Client(format!("invalid cookie header: {}", e)))?;
        headers.insert(COOKIE, value);
    }

    Client::builder()
        .user_agent(user_agent.header_value())
        .default_headers(headers)
        .timeout(fetch.timeout())
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
        .map_err(|e| FetchError::Client(e.to_string()))
}

/// Fetches pages from the target site under robots policy and rate limiting
pub struct FetchClient {
    client: Client,
    limiter: RateLimiter,
    /// Robots product token (the crawler name)
    agent_token: String,
    max_attempts: u32,
    retry_backoff: Duration,
    robots_ttl: chrono::Duration,
    robots: Mutex<HashMap<String, CachedRobots>>,
}

impl FetchClient {
    /// Creates a fetch client from the application config
    ///
    /// `limiter` should share its clock with every other client in the
    /// process so the pacing holds across runs.
    pub fn new(config: &AppConfig, limiter: RateLimiter) -> Result<Self, FetchError> {
        let client = build_http_client(
            &config.user_agent,
            &config.fetch,
            config.target.cookie.as_deref(),
        )?;

        Ok(Self {
            client,
            limiter,
            agent_token: config.user_agent.crawler_name.clone(),
            max_attempts: config.fetch.max_attempts.max(1),
            retry_backoff: config.fetch.retry_backoff(),
            robots_ttl: chrono::Duration::minutes(config.fetch.robots_ttl_min as i64),
            robots: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches a URL with robots compliance and retry logic
    ///
    /// # Retry Logic
    ///
    /// | Condition | Action |
    /// |-----------|--------|
    /// | Disallowed by robots.txt | Immediate `PolicyDenied`, no request sent |
    /// | HTTP 5xx, 429 | Retry with backoff, honouring Retry-After |
    /// | Timeout, connect error, reset | Retry with backoff |
    /// | Other HTTP 4xx | Immediate `Status` |
    ///
    /// Each attempt waits for the rate limiter first. Exhausting
    /// `max_attempts` yields `RetriesExhausted`.
    pub async fn fetch(&self, url: &Url) -> Result<RawPage, FetchError> {
        let policy = self.robots_for(url).await;
        if !policy.is_allowed(url.as_str(), &self.agent_token) {
            tracing::info!("URL {} disallowed by robots.txt", url);
            return Err(FetchError::PolicyDenied {
                url: url.to_string(),
            });
        }

        let mut attempt = 1;
        loop {
            self.limiter.acquire().await;
            tracing::debug!("GET {} (attempt {}/{})", url, attempt, self.max_attempts);

            match self.attempt(url).await {
                Ok(page) => return Ok(page),
                Err(AttemptFailure::Permanent(e)) => return Err(e),
                Err(AttemptFailure::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt >= self.max_attempts {
                        return Err(FetchError::RetriesExhausted {
                            url: url.to_string(),
                            attempts: attempt,
                            reason,
                        });
                    }

                    let delay = backoff_delay(self.retry_backoff, attempt, retry_after);
                    tracing::warn!(
                        "Transient failure on {} (attempt {}): {}; retrying in {:?}",
                        url,
                        attempt,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, url: &Url) -> Result<RawPage, AttemptFailure> {
        let response = match self.client.get(url.as_str()).send().await {
            Ok(response) => response,
            Err(e) => return Err(classify_send_error(url, e)),
        };

        let status = response.status();
        if is_transient_status(status) {
            return Err(AttemptFailure::Transient {
                reason: format!("HTTP {}", status.as_u16()),
                retry_after: parse_retry_after(response.headers()),
            });
        }

        if !status.is_success() {
            return Err(AttemptFailure::Permanent(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }));
        }

        let final_url = response.url().clone();
        match response.text().await {
            Ok(body) => Ok(RawPage {
                url: final_url,
                status: status.as_u16(),
                body,
            }),
            // A body cut off mid-stream is a reset in disguise
            Err(e) => Err(AttemptFailure::Transient {
                reason: format!("failed to read body: {}", e),
                retry_after: None,
            }),
        }
    }

    /// Returns the robots policy for the origin of `url`, fetching it when
    /// absent or stale
    async fn robots_for(&self, url: &Url) -> ParsedRobots {
        let key = origin_key(url);
        let mut cache = self.robots.lock().await;

        if let Some(entry) = cache.get(&key) {
            if !entry.is_stale() {
                return entry.content.clone();
            }
        }

        let Some(robots_url) = robots_url(url) else {
            return ParsedRobots::allow_all();
        };

        // robots.txt counts against the target site's tolerance like any other request
        self.limiter.acquire().await;
        let policy = fetch_robots(&self.client, &robots_url).await;
        if policy.is_allow_all() {
            tracing::debug!("Caching allow-all robots policy for {}", robots_url);
        }
        cache.insert(key, CachedRobots::new(policy.clone(), self.robots_ttl));
        policy
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_send_error(url: &Url, e: reqwest::Error) -> AttemptFailure {
    if e.is_builder() || e.is_redirect() {
        return AttemptFailure::Permanent(FetchError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        });
    }

    let reason = if e.is_timeout() {
        "request timeout".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };

    AttemptFailure::Transient {
        reason,
        retry_after: None,
    }
}

/// Reads a Retry-After header given in seconds
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_BACKOFF))
}

/// Exponential backoff (`base * 2^(attempt-1)`), lengthened by Retry-After
fn backoff_delay(base: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let exponential = base.checked_mul(factor).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);

    match retry_after {
        Some(wait) => exponential.max(wait),
        None => exponential,
    }
}
