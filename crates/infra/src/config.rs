//! Configuration loading and representation.
//!
//! Everything is read from the process environment. Unset variables fall back to
//! defaults; set-but-invalid values are rejected.

use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_DB_MAX_CONNECTIONS: &str = "UNITLEDGER_DB_MAX_CONNECTIONS";
pub const ENV_STORE_TIMEOUT_MS: &str = "UNITLEDGER_STORE_TIMEOUT_MS";
pub const ENV_ALLOC_MAX_ATTEMPTS: &str = "UNITLEDGER_ALLOC_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "UNITLEDGER_RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "UNITLEDGER_RETRY_MAX_DELAY_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Storage connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Postgres connection string. `None` means "use the in-memory store".
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Upper bound for a single transaction attempt (begin → commit).
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`StoreConfig::from_env`], reading from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty()),
            max_connections: parse_or(&lookup, ENV_DB_MAX_CONNECTIONS, defaults.max_connections)?,
            operation_timeout: parse_millis_or(
                &lookup,
                ENV_STORE_TIMEOUT_MS,
                defaults.operation_timeout,
            )?,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_DATABASE_URL))
    }
}

/// Settings shared by the allocator and the lock manager.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            operation_timeout: StoreConfig::default().operation_timeout,
        }
    }
}

impl AllocatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_attempts: u32 = parse_or(&lookup, ENV_ALLOC_MAX_ATTEMPTS, defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: ENV_ALLOC_MAX_ATTEMPTS,
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let base_delay = parse_millis_or(&lookup, ENV_RETRY_BASE_DELAY_MS, defaults.retry.base_delay)?;
        let max_delay = parse_millis_or(&lookup, ENV_RETRY_MAX_DELAY_MS, defaults.retry.max_delay)?;
        if max_delay < base_delay {
            return Err(ConfigError::Invalid {
                var: ENV_RETRY_MAX_DELAY_MS,
                value: max_delay.as_millis().to_string(),
                reason: format!("must be >= {ENV_RETRY_BASE_DELAY_MS}"),
            });
        }

        Ok(Self {
            retry: RetryPolicy::exponential(max_attempts, base_delay, max_delay),
            operation_timeout: parse_millis_or(
                &lookup,
                ENV_STORE_TIMEOUT_MS,
                defaults.operation_timeout,
            )?,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, var, default_ms).map(Duration::from_millis)
}
