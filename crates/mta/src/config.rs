//! Client configuration.
//!
//! Settings can be built in code, deserialized from any serde source, or
//! read from the environment:
//!
//! - `MTA_DEPLOY_URL`: base URL of the deploy service (required)
//! - `MTA_USER_AGENT`: user agent sent with every request
//! - `MTA_POLL_INTERVAL_MS`: delay between state polls
//! - `MTA_REQUEST_TIMEOUT_SECS`: per-request HTTP timeout

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::MtaError;

/// Default timeout for API requests.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Polling interval when waiting for operations and upload jobs.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

const ENV_DEPLOY_URL: &str = "MTA_DEPLOY_URL";
const ENV_USER_AGENT: &str = "MTA_USER_AGENT";
const ENV_POLL_INTERVAL_MS: &str = "MTA_POLL_INTERVAL_MS";
const ENV_REQUEST_TIMEOUT_SECS: &str = "MTA_REQUEST_TIMEOUT_SECS";

/// Configuration for [`MtaClient`](crate::MtaClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the deploy service, e.g. `https://deploy-service.cf.example.com`.
    pub base_url: String,
    /// User agent added to every request.
    pub user_agent: String,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// Fixed delay between state polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Headers added to every request (e.g. `Authorization`).
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user_agent: format!("mta/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            default_headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given deploy service URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Read configuration from environment variables.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse or the result is invalid.
    pub fn from_env() -> Result<Self, MtaError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if a numeric value does not parse or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MtaError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_DEPLOY_URL) {
            config.base_url = url;
        }
        if let Some(agent) = lookup(ENV_USER_AGENT) {
            config.user_agent = agent;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout_secs = parse_number(ENV_REQUEST_TIMEOUT_SECS, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Check that the configuration can be used to build a client.
    ///
    /// # Errors
    /// Returns error if the base URL is missing or unparsable, or the poll
    /// interval is zero.
    pub fn validate(&self) -> Result<(), MtaError> {
        self.parsed_base_url()?;
        if self.poll_interval_ms == 0 {
            return Err(MtaError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The base URL, parsed.
    ///
    /// # Errors
    /// Returns error if the base URL is missing or unparsable.
    pub fn parsed_base_url(&self) -> Result<Url, MtaError> {
        parse_base_url(&self.base_url)
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay between state polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Parse a deploy service URL, rejecting blank input.
///
/// # Errors
/// Returns error if the URL is blank or unparsable.
pub fn parse_base_url(raw: &str) -> Result<Url, MtaError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(MtaError::Config(format!(
            "deploy service URL is not set ({ENV_DEPLOY_URL})"
        )));
    }
    Ok(Url::parse(raw)?)
}

fn parse_number(key: &str, value: &str) -> Result<u64, MtaError> {
    value
        .trim()
        .parse()
        .map_err(|_| MtaError::Config(format!("{key} must be a number, got '{value}'")))
}
