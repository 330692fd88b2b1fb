//! Engine configuration loaded from the environment.
//!
//! Connection pooling, lock-retry and schema-mode settings are validated at
//! construction so the rest of the engine never sees an out-of-range value.

use std::path::PathBuf;
use std::time::Duration;

use nutype::nutype;
use thiserror::Error;

use crate::message::ServerId;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that failed validation.
    #[error("invalid configuration: {name} - {reason}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Connection pool size.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Default, TryFrom, Into
    ),
    default = 10
)]
pub struct PoolSize(u32);

impl PoolSize {
    /// Gets the value for the pool builder.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Maximum retries for database lock/deadlock errors.
#[nutype(
    validate(less_or_equal = 20),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Default, TryFrom, Into
    ),
    default = 3
)]
pub struct DeadlockRetries(u32);

impl DeadlockRetries {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// How the engine treats an existing schema at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineMode {
    /// Require an existing compatible schema and reuse it.
    Takeover,
    /// Require a fresh store and bootstrap it.
    Standalone,
    /// Reuse an existing schema when present, bootstrap otherwise.
    #[default]
    Auto,
}

impl EngineMode {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "takeover" => Ok(Self::Takeover),
            "standalone" => Ok(Self::Standalone),
            "auto" => Ok(Self::Auto),
            other => Err(ConfigError::InvalidValue {
                name: "ENGINE_MODE".to_string(),
                reason: format!("expected takeover|standalone|auto, got '{other}'"),
            }),
        }
    }
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the embedded store.
    pub db_path: PathBuf,
    /// Connection pool size.
    pub pool_size: PoolSize,
    /// Pool acquire timeout; exhaustion past this raises a retryable error.
    pub acquire_timeout: Duration,
    /// Lock/deadlock retry budget for `with_retry`.
    pub deadlock_retries: DeadlockRetries,
    /// Stable per-host identifier partitioning unfinished work.
    pub server_id: ServerId,
    /// Schema takeover behavior.
    pub mode: EngineMode,
}

impl EngineConfig {
    /// Loads configuration from the environment
    /// (`DB_PATH`, `DB_POOL_SIZE`, `DB_ACQUIRE_TIMEOUT`,
    /// `DB_DEADLOCK_RETRIES`, `SERVER_ID`, `ENGINE_MODE`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable is present but
    /// out of range or unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("interchange.db"));

        let pool_size = match std::env::var("DB_POOL_SIZE") {
            Ok(raw) => {
                let parsed: u32 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "DB_POOL_SIZE".to_string(),
                    reason: format!("not an integer: '{raw}'"),
                })?;
                PoolSize::try_new(parsed).map_err(|e| ConfigError::InvalidValue {
                    name: "DB_POOL_SIZE".to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(_) => PoolSize::default(),
        };

        let acquire_timeout = match std::env::var("DB_ACQUIRE_TIMEOUT") {
            Ok(raw) => {
                let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "DB_ACQUIRE_TIMEOUT".to_string(),
                    reason: format!("not a millisecond count: '{raw}'"),
                })?;
                Duration::from_millis(millis)
            }
            Err(_) => Duration::from_secs(30),
        };

        let deadlock_retries = match std::env::var("DB_DEADLOCK_RETRIES") {
            Ok(raw) => {
                let parsed: u32 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "DB_DEADLOCK_RETRIES".to_string(),
                    reason: format!("not an integer: '{raw}'"),
                })?;
                DeadlockRetries::try_new(parsed).map_err(|e| ConfigError::InvalidValue {
                    name: "DB_DEADLOCK_RETRIES".to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(_) => DeadlockRetries::default(),
        };

        let server_id = std::env::var("SERVER_ID").unwrap_or_else(|_| "default-server".to_string());
        let server_id = ServerId::try_new(server_id).map_err(|e| ConfigError::InvalidValue {
            name: "SERVER_ID".to_string(),
            reason: e.to_string(),
        })?;

        let mode = match std::env::var("ENGINE_MODE") {
            Ok(raw) => EngineMode::parse(&raw)?,
            Err(_) => EngineMode::default(),
        };

        Ok(Self {
            db_path,
            pool_size,
            acquire_timeout,
            deadlock_retries,
            server_id,
            mode,
        })
    }

    /// A configuration for tests: tiny pool, standalone bootstrap.
    #[must_use]
    pub fn for_testing(db_path: PathBuf, server_id: ServerId) -> Self {
        Self {
            db_path,
            pool_size: PoolSize::try_new(2).expect("pool size 2 is in range 1-100"),
            acquire_timeout: Duration::from_secs(5),
            deadlock_retries: DeadlockRetries::default(),
            server_id,
            mode: EngineMode::Standalone,
        }
    }
}
