//! Ledger configuration.
//!
//! ```rust,no_run
//! use entitlement_ledger::config::ConfigLoader;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().env().load().await?;
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod loader;
pub mod memory;
pub mod provider;

pub use env::EnvConfigProvider;
pub use loader::ConfigLoader;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::balance::DeductionOrder;
use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// When false, every mutation commits straight to the store.
    pub enabled: bool,
    pub key_prefix: String,
    /// Lifetime of clean cache entries; `None` keeps them until invalidated.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "ledger:balance:".to_string(),
            ttl: Some(Duration::from_secs(3600)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Resets in flight at once within a sweep pass.
    pub concurrency: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
            concurrency: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetConfig {
    /// Sync-reset-invalidate rounds on the lazy path, and commit attempts
    /// when the cache is disabled.
    pub conflict_retries: u32,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self { conflict_retries: 5 }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LedgerConfig {
    pub deduction_order: DeductionOrder,
    pub cache: CacheConfig,
    pub sweep: SweepConfig,
    pub retry: RetryPolicy,
    pub reset: ResetConfig,
    pub database_url: Option<SecretString>,
    pub redis_url: Option<SecretString>,
}

impl LedgerConfig {
    /// Collects every problem rather than stopping at the first.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |key: &str, message: &str| {
            errors.push(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };

        if self.cache.key_prefix.is_empty() {
            invalid("cache.key_prefix", "must not be empty");
        }
        if self.sweep.interval.is_zero() {
            invalid("sweep.interval_ms", "must be positive");
        }
        if self.sweep.batch_size == 0 {
            invalid("sweep.batch_size", "must be at least 1");
        }
        if self.sweep.concurrency == 0 {
            invalid("sweep.concurrency", "must be at least 1");
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            invalid("retry.initial_backoff_ms", "must not exceed retry.max_backoff_ms");
        }
        if self.reset.conflict_retries == 0 {
            invalid("reset.conflict_retries", "must be at least 1");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }
}
