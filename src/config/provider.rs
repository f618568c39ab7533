//! Configuration provider trait

use serde::de::DeserializeOwned;

use super::{ConfigError, ConfigResult};

/// Read-only source of raw configuration values keyed by dotted paths
/// such as `sweep.batch_size`.
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>>;
}

/// Extension methods for typed configuration access
pub trait ConfigProviderExt: ConfigProvider {
    /// Decodes a value as JSON, falling back to treating the raw text as a
    /// JSON string so bare words like `reverse_attach_order` parse.
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            let Some(raw) = self.get_raw(key).await? else {
                return Ok(None);
            };
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => serde_json::from_value(serde_json::Value::String(raw))
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: e.to_string(),
                    }),
            }
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}
