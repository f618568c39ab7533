//! Environment variable configuration provider.
//!
//! Read-only: environment variables are treated as immutable at runtime.

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

pub const DEFAULT_PREFIX: &str = "LEDGER_";

/// Maps `sweep.batch_size` to `LEDGER_SWEEP_BATCH_SIZE`.
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: String,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    /// Underscores are ambiguous on the way back; only the first one becomes
    /// a section separator.
    fn key_from_env(&self, env_name: &str) -> Option<String> {
        let rest = env_name.strip_prefix(&self.prefix)?.to_lowercase();
        Some(match rest.split_once('_') {
            Some((section, field)) => format!("{}.{}", section, field),
            None => rest,
        })
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let env_prefix = self.env_key(prefix);
        let mut keys: Vec<String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(&env_prefix))
            .filter_map(|(k, _)| self.key_from_env(&k))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
