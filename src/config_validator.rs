use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

use crate::error::ConfigError;

static BACKEND_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+$").expect("backend id pattern is valid")
});

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ConfigError> {
        if url.is_empty() {
            return Err(ConfigError::Invalid("Redis URL cannot be empty".to_string()));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::Invalid(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a logical backend identifier
    pub fn validate_backend_id(id: &str) -> Result<(), ConfigError> {
        if !BACKEND_ID.is_match(id) {
            return Err(ConfigError::Invalid(format!(
                "Backend id '{}' may only contain letters, digits, '.', '-' and '_'",
                id
            )));
        }

        Ok(())
    }

    /// Validates an upstream base URL: absolute http(s), no query or fragment
    pub fn validate_upstream_url(url: &str) -> Result<Url, ConfigError> {
        let parsed = Url::parse(url)
            .map_err(|e| ConfigError::Invalid(format!("Invalid upstream URL '{}': {}", url, e)))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "Upstream URL '{}' must use http or https",
                url
            )));
        }

        if parsed.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "Upstream URL '{}' has no host",
                url
            )));
        }

        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ConfigError::Invalid(format!(
                "Upstream URL '{}' cannot carry a query or fragment",
                url
            )));
        }

        Ok(parsed)
    }

    /// Validates token bucket parameters
    pub fn validate_rate_limit(capacity: u32, refill_rate: f64) -> Result<(), ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Invalid(
                "Rate limit capacity must be greater than 0".to_string(),
            ));
        }

        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(ConfigError::Invalid(
                "Refill rate must be a finite, non-negative number".to_string(),
            ));
        }

        Ok(())
    }
}
