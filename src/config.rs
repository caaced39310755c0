//! Isolation configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`).
//!
//! | Variable                        | Default          |
//! |---------------------------------|------------------|
//! | `DATABASE_URL`                  | `sqlite::memory:` |
//! | `DATABASE_MAX_CONNECTIONS`      | `5`              |
//! | `DATABASE_ACQUIRE_TIMEOUT_SECS` | `5`              |
//! | `ISOLATION_ROLLBACK`            | `always`         |
//! | `ISOLATION_AUTO_SAVEPOINT`      | `true`           |
//! | `ISOLATION_SAVEPOINT_PREFIX`    | `tx_sp`          |
//! | `ISOLATION_LENDING`             | `false`          |

use std::time::Duration;

use crate::domain::{RollbackPolicy, TransactionOptions};
use crate::error::ConfigError;
use crate::pool::PoolConfig;

/// Top-level isolation configuration.
///
/// Loaded once per test binary via [`IsolationConfig::from_env`].
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Database connection string.
    pub database_url: String,

    /// Number of sessions in the pool.
    pub database_max_connections: usize,

    /// Timeout in seconds for checking out a session.
    pub database_acquire_timeout_secs: u64,

    /// Close policy applied to each test.
    pub rollback: RollbackPolicy,

    /// Whether nested requests inside a test frame become savepoints.
    pub auto_savepoint: bool,

    /// Prefix for generated savepoint names.
    pub savepoint_prefix: String,

    /// Whether tests lend their connection to other tasks. Forces a
    /// single-session pool.
    pub lending: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            database_max_connections: 5,
            database_acquire_timeout_secs: 5,
            rollback: RollbackPolicy::Always,
            auto_savepoint: true,
            savepoint_prefix: "tx_sp".to_string(),
            lending: false,
        }
    }
}

impl IsolationConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set, and for numeric
    /// variables that do not parse. Calls `dotenvy::dotenv().ok()` to
    /// optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `ISOLATION_ROLLBACK` is set
    /// to something other than `always`, `on_error` or `never`, or if
    /// `ISOLATION_SAVEPOINT_PREFIX` is not a plain SQL identifier.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`IsolationConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);
        let database_max_connections = parse_var(
            &lookup,
            "DATABASE_MAX_CONNECTIONS",
            defaults.database_max_connections,
        );
        let database_acquire_timeout_secs = parse_var(
            &lookup,
            "DATABASE_ACQUIRE_TIMEOUT_SECS",
            defaults.database_acquire_timeout_secs,
        );

        let rollback = match lookup("ISOLATION_ROLLBACK") {
            Some(raw) => raw.parse::<RollbackPolicy>().map_err(|value| ConfigError::InvalidValue {
                key: "ISOLATION_ROLLBACK",
                value,
            })?,
            None => defaults.rollback,
        };
        let auto_savepoint =
            parse_bool(&lookup, "ISOLATION_AUTO_SAVEPOINT", defaults.auto_savepoint);

        let savepoint_prefix =
            lookup("ISOLATION_SAVEPOINT_PREFIX").unwrap_or(defaults.savepoint_prefix);
        if !is_identifier(&savepoint_prefix) {
            return Err(ConfigError::InvalidValue {
                key: "ISOLATION_SAVEPOINT_PREFIX",
                value: savepoint_prefix,
            });
        }

        let lending = parse_bool(&lookup, "ISOLATION_LENDING", defaults.lending);

        Ok(Self {
            database_url,
            database_max_connections,
            database_acquire_timeout_secs,
            rollback,
            auto_savepoint,
            savepoint_prefix,
            lending,
        })
    }

    /// Pool settings. Lending forces exactly one session.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        let max_connections = if self.lending {
            1
        } else {
            self.database_max_connections
        };
        PoolConfig {
            max_connections,
            acquire_timeout: Duration::from_secs(self.database_acquire_timeout_secs),
        }
    }

    /// Options for the per-test transaction.
    #[must_use]
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            rollback: self.rollback,
            savepoint: true,
            auto_savepoint: self.auto_savepoint,
        }
    }
}

/// Parses a variable as `T`, returning `default` on missing or invalid
/// values.
fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses a variable as a boolean. Accepts `"true"`, `"1"`, `"false"`,
/// `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}

/// `true` for a plain SQL identifier, safe to splice into `SAVEPOINT`.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
