use crate::config::types::{
    AppConfig, FetchConfig, ReaperConfig, ScraperSettings, StorageConfig, TargetConfig,
    UserAgentConfig,
};
use crate::ConfigError;
use url::Url;

/// One week, in minutes
pub const MAX_INTERVAL_MIN: u32 = 7 * 24 * 60;

/// Upper bound for page limits and per-run product caps
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Upper bound for the spacing between outbound requests
pub const MAX_REQUEST_INTERVAL_MS: u64 = 60_000;

/// Lower bound for the spacing between outbound requests
pub const MIN_REQUEST_INTERVAL_MS: u64 = 100;

/// Validates the entire configuration
pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    validate_user_agent_config(&config.user_agent)?;
    validate_target_config(&config.target)?;
    validate_fetch_config(&config.fetch)?;
    validate_storage_config(&config.storage)?;
    validate_reaper_config(&config.reaper)?;
    validate_settings(&config.schedule)?;
    Ok(())
}

/// Validates scraper settings against their hard bounds
///
/// Called on file load, on every read of the persisted row and before every
/// write of it.
pub fn validate_settings(settings: &ScraperSettings) -> Result<(), ConfigError> {
    check_interval("new_scan_interval_min", settings.new_scan_interval_min)?;
    check_interval("backfill_interval_min", settings.backfill_interval_min)?;
    check_page_limit("new_scan_page_limit", settings.new_scan_page_limit)?;
    check_page_limit("backfill_pages_per_run", settings.backfill_pages_per_run)?;
    check_page_limit("backfill_max_products", settings.backfill_max_products)?;

    if settings.request_interval_ms < MIN_REQUEST_INTERVAL_MS
        || settings.request_interval_ms > MAX_REQUEST_INTERVAL_MS
    {
        return Err(ConfigError::Validation(format!(
            "request_interval_ms must be between {} and {}, got {}",
            MIN_REQUEST_INTERVAL_MS, MAX_REQUEST_INTERVAL_MS, settings.request_interval_ms
        )));
    }

    Ok(())
}

fn check_interval(name: &str, value: u32) -> Result<(), ConfigError> {
    if value < 1 || value > MAX_INTERVAL_MIN {
        return Err(ConfigError::Validation(format!(
            "{} must be between 1 and {} minutes (1 week), got {}",
            name, MAX_INTERVAL_MIN, value
        )));
    }
    Ok(())
}

fn check_page_limit(name: &str, value: u32) -> Result<(), ConfigError> {
    if value < 1 || value > MAX_PAGE_LIMIT {
        return Err(ConfigError::Validation(format!(
            "{} must be between 1 and {}, got {}",
            name, MAX_PAGE_LIMIT, value
        )));
    }
    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_target_config(config: &TargetConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.listing_url).map_err(|e| {
        ConfigError::InvalidUrl(format!(
            "Invalid listing_url '{}': {}",
            config.listing_url, e
        ))
    })?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::Validation(format!(
            "listing_url '{}' must use http or https",
            config.listing_url
        )));
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl(format!(
            "listing_url '{}' has no host",
            config.listing_url
        )));
    }

    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.timeout_secs < 1 || config.timeout_secs > 120 {
        return Err(ConfigError::Validation(format!(
            "timeout_secs must be between 1 and 120, got {}",
            config.timeout_secs
        )));
    }

    if config.max_attempts < 1 || config.max_attempts > 10 {
        return Err(ConfigError::Validation(format!(
            "max_attempts must be between 1 and 10, got {}",
            config.max_attempts
        )));
    }

    if config.retry_backoff_ms > MAX_REQUEST_INTERVAL_MS {
        return Err(ConfigError::Validation(format!(
            "retry_backoff_ms must be <= {}, got {}",
            MAX_REQUEST_INTERVAL_MS, config.retry_backoff_ms
        )));
    }

    if config.robots_ttl_min < 1 {
        return Err(ConfigError::Validation(
            "robots_ttl_min must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_reaper_config(config: &ReaperConfig) -> Result<(), ConfigError> {
    if config.stale_after_min < 1 || config.stale_after_min > u64::from(MAX_INTERVAL_MIN) {
        return Err(ConfigError::Validation(format!(
            "stale_after_min must be between 1 and {}, got {}",
            MAX_INTERVAL_MIN, config.stale_after_min
        )));
    }
    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
