//! Layered configuration loading.
//!
//! Providers are consulted in insertion order; the first one holding a key
//! wins.

use std::time::Duration;

use secrecy::SecretString;
use serde::de::DeserializeOwned;

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigResult, EnvConfigProvider, LedgerConfig, MemoryConfigProvider};

#[derive(Default)]
pub struct ConfigLoader {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// `LEDGER_`-prefixed environment variables.
    pub fn env(self) -> Self {
        self.provider(Box::new(EnvConfigProvider::new()))
    }

    pub fn memory(self, provider: MemoryConfigProvider) -> Self {
        self.provider(Box::new(provider))
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> ConfigResult<Option<T>> {
        for provider in &self.providers {
            if let Some(value) = provider.get::<T>(key).await? {
                tracing::debug!(key = key, provider = provider.name(), "Config value loaded");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn set<T: DeserializeOwned + Send>(&self, key: &str, slot: &mut T) -> ConfigResult<()> {
        if let Some(value) = self.get(key).await? {
            *slot = value;
        }
        Ok(())
    }

    async fn set_millis(&self, key: &str, slot: &mut Duration) -> ConfigResult<()> {
        if let Some(ms) = self.get::<u64>(key).await? {
            *slot = Duration::from_millis(ms);
        }
        Ok(())
    }

    async fn secret(&self, key: &str) -> ConfigResult<Option<SecretString>> {
        Ok(self.get::<String>(key).await?.map(SecretString::from))
    }

    /// Starts from defaults, applies every known key, then validates.
    pub async fn load(&self) -> ConfigResult<LedgerConfig> {
        let mut config = LedgerConfig::default();

        self.set("deduction_order", &mut config.deduction_order).await?;

        self.set("cache.enabled", &mut config.cache.enabled).await?;
        self.set("cache.key_prefix", &mut config.cache.key_prefix).await?;
        if let Some(ms) = self.get::<u64>("cache.ttl_ms").await? {
            config.cache.ttl = (ms > 0).then(|| Duration::from_millis(ms));
        }

        self.set_millis("sweep.interval_ms", &mut config.sweep.interval).await?;
        self.set("sweep.batch_size", &mut config.sweep.batch_size).await?;
        self.set("sweep.concurrency", &mut config.sweep.concurrency).await?;

        self.set("retry.max_retries", &mut config.retry.max_retries).await?;
        self.set_millis("retry.initial_backoff_ms", &mut config.retry.initial_backoff)
            .await?;
        self.set_millis("retry.max_backoff_ms", &mut config.retry.max_backoff)
            .await?;

        self.set("reset.conflict_retries", &mut config.reset.conflict_retries)
            .await?;

        if let Some(url) = self.secret("database_url").await? {
            config.database_url = Some(url);
        }
        if let Some(url) = self.secret("redis_url").await? {
            config.redis_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }
}
