//! Relay configuration loaded from environment variables.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default outbound wait timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default maximum run time of the host process.
pub const DEFAULT_HOST_MAX_DURATION: Duration = Duration::from_secs(60);
/// Default margin kept between session deadline and host maximum.
pub const DEFAULT_CLEANUP_MARGIN: Duration = Duration::from_secs(5);

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("Cleanup margin {margin:?} must be smaller than host maximum {host_max:?}")]
    InvalidDuration { host_max: Duration, margin: Duration },
    #[error("Request timeout must be greater than zero")]
    ZeroRequestTimeout,
}

/// Redis connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConnectionConfig {
    /// Connection timeout in seconds.
    pub connection_timeout_secs: u64,
    /// Response/command timeout in seconds.
    pub response_timeout_secs: u64,
    /// Reconnection retries after a dropped connection.
    pub reconnection_retries: usize,
    /// Exponential backoff base for retry delays.
    pub retry_exponent_base: u64,
    /// Maximum retry delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Retries for the initial connection at startup.
    pub initial_connection_retries: u32,
    /// Initial retry delay in milliseconds (doubles each attempt).
    pub initial_retry_delay_ms: u64,
}

impl Default for RedisConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 5,
            response_timeout_secs: 3,
            reconnection_retries: 3,
            retry_exponent_base: 2,
            max_retry_delay_ms: 2_000,
            initial_connection_retries: 3,
            initial_retry_delay_ms: 500,
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// How long an outbound relay waits for its response.
    pub request_timeout: Duration,
    /// Maximum run time of the hosting process.
    pub host_max_duration: Duration,
    /// Time reserved for cleanup before the host limit.
    pub cleanup_margin: Duration,
    /// Redis URL; the in-memory broker is used when unset.
    pub redis_url: Option<String>,
    /// Redis connection tuning.
    pub redis_connection: RedisConnectionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            host_max_duration: DEFAULT_HOST_MAX_DURATION,
            cleanup_margin: DEFAULT_CLEANUP_MARGIN,
            redis_url: None,
            redis_connection: RedisConnectionConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed, or if the
    /// resulting session duration would be zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    /// See [`RelayConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            bind_addr: parse(&lookup, "RELAY_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            request_timeout: parse(&lookup, "RELAY_REQUEST_TIMEOUT_MS")?
                .map_or(defaults.request_timeout, Duration::from_millis),
            host_max_duration: parse(&lookup, "RELAY_HOST_MAX_DURATION_SECS")?
                .map_or(defaults.host_max_duration, Duration::from_secs),
            cleanup_margin: parse(&lookup, "RELAY_CLEANUP_MARGIN_SECS")?
                .map_or(defaults.cleanup_margin, Duration::from_secs),
            redis_url: lookup("RELAY_REDIS_URL").filter(|url| !url.trim().is_empty()),
            redis_connection: defaults.redis_connection,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that sessions get a non-zero lifetime and relays a non-zero wait.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidDuration`] if the margin eats the whole
    /// host limit, or [`ConfigError::ZeroRequestTimeout`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        if self.cleanup_margin >= self.host_max_duration {
            return Err(ConfigError::InvalidDuration {
                host_max: self.host_max_duration,
                margin: self.cleanup_margin,
            });
        }
        Ok(())
    }

    /// Maximum lifetime of one session.
    #[must_use]
    pub fn max_session_duration(&self) -> Duration {
        self.host_max_duration.saturating_sub(self.cleanup_margin)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                value,
            })
        })
        .transpose()
}
