//! Redis cache backend.
//!
//! Each balance lives under one key as JSON, next to a fill-epoch counter.
//! Mutations run as optimistic WATCH / MULTI / EXEC transactions on both
//! keys, so every writer on a pair either commits against the state it read
//! or retries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use super::{BalanceCache, CacheError, CacheResult, CachedBalance, Mutation, MutationOutcome};
use crate::balance::{BalanceKey, Breakdown};
use crate::retry::{RetryPolicy, with_retry};
use crate::types::EntryId;

trait BackendResultExt<T> {
    fn cache_err(self) -> CacheResult<T>;
    fn cache_err_ctx(self, context: &str) -> CacheResult<T>;
}

impl<T, E: std::fmt::Display> BackendResultExt<T> for Result<T, E> {
    fn cache_err(self) -> CacheResult<T> {
        self.map_err(|e| CacheError::Backend {
            message: e.to_string(),
        })
    }

    fn cache_err_ctx(self, context: &str) -> CacheResult<T> {
        self.map_err(|e| CacheError::Backend {
            message: format!("{}: {}", context, e),
        })
    }
}

#[derive(Clone, Debug)]
pub struct RedisCacheConfig {
    pub key_prefix: String,
    /// Expiry for clean keys. Keys holding unsynced writes never expire.
    pub ttl: Option<Duration>,
    pub connection_timeout: Duration,
    pub retry: RetryPolicy,
    /// Optimistic transaction attempts before giving up on a hot key.
    pub max_watch_attempts: u32,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ledger:balance:".to_string(),
            ttl: Some(Duration::from_secs(3600)),
            connection_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_watch_attempts: 32,
        }
    }
}

impl RedisCacheConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> CacheResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(CacheError::Backend {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }
}

enum Step<T> {
    Keep(T),
    Write(CachedBalance, T),
    Remove(T),
}

pub struct RedisCache {
    client: Arc<redis::Client>,
    config: RedisCacheConfig,
}

impl RedisCache {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisCacheConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisCacheConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    fn balance_key(&self, key: &BalanceKey) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix, key.customer_id, key.feature_id
        )
    }

    fn epoch_key(&self, key: &BalanceKey) -> String {
        format!(
            "{}epoch:{}:{}",
            self.config.key_prefix, key.customer_id, key.feature_id
        )
    }

    fn dirty_set_key(&self) -> String {
        format!("{}dirty", self.config.key_prefix)
    }

    fn is_retryable(error: &CacheError) -> bool {
        match error {
            CacheError::Backend { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
                    || message.contains("CLUSTERDOWN")
            }
            _ => false,
        }
    }

    /// Opens a dedicated connection so WATCH state is never shared.
    async fn get_connection(&self) -> CacheResult<redis::aio::MultiplexedConnection> {
        with_retry(&self.config.retry, Self::is_retryable, || async {
            tokio::time::timeout(
                self.config.connection_timeout,
                self.client.get_multiplexed_async_connection(),
            )
            .await
            .cache_err_ctx("connection timeout")?
            .cache_err()
        })
        .await
    }

    async fn read(&self, key: &BalanceKey) -> CacheResult<Option<CachedBalance>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(self.balance_key(key)).await.cache_err()?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn transact<T, F>(&self, key: &BalanceKey, mut step: F) -> crate::Result<T>
    where
        F: FnMut(Option<CachedBalance>, u64) -> crate::Result<Step<T>> + Send,
        T: Send,
    {
        let redis_key = self.balance_key(key);
        let epoch_key = self.epoch_key(key);
        let dirty_set = self.dirty_set_key();
        let member = serde_json::to_string(key).map_err(CacheError::from)?;

        for attempt in 1..=self.config.max_watch_attempts {
            let mut conn = self.get_connection().await?;
            redis::cmd("WATCH")
                .arg(&redis_key)
                .arg(&epoch_key)
                .query_async::<()>(&mut conn)
                .await
                .cache_err()?;
            let (raw, epoch): (Option<String>, Option<u64>) = redis::pipe()
                .get(&redis_key)
                .get(&epoch_key)
                .query_async(&mut conn)
                .await
                .cache_err()?;
            let current = raw
                .map(|raw| serde_json::from_str::<CachedBalance>(&raw))
                .transpose()
                .map_err(CacheError::from)?;

            let mut pipe = redis::pipe();
            pipe.atomic();
            let value = match step(current, epoch.unwrap_or(0))? {
                Step::Keep(value) => return Ok(value),
                Step::Write(cached, value) => {
                    let data = serde_json::to_string(&cached).map_err(CacheError::from)?;
                    match self.config.ttl.filter(|_| cached.is_clean()) {
                        Some(ttl) => pipe
                            .cmd("SET")
                            .arg(&redis_key)
                            .arg(data)
                            .arg("PX")
                            .arg(ttl.as_millis() as u64)
                            .ignore(),
                        None => pipe.cmd("SET").arg(&redis_key).arg(data).ignore(),
                    };
                    let membership = if cached.dirty.is_empty() { "SREM" } else { "SADD" };
                    pipe.cmd(membership).arg(&dirty_set).arg(&member).ignore();
                    value
                }
                Step::Remove(value) => {
                    pipe.cmd("DEL").arg(&redis_key).ignore();
                    pipe.cmd("SREM").arg(&dirty_set).arg(&member).ignore();
                    value
                }
            };

            let committed: Option<()> = pipe.query_async(&mut conn).await.cache_err()?;
            if committed.is_some() {
                return Ok(value);
            }
            tracing::debug!(key = %key, attempt = attempt, "Cached balance changed during transaction; retrying");
        }

        Err(CacheError::Contention {
            key: key.to_string(),
            attempts: self.config.max_watch_attempts,
        }
        .into())
    }

    /// Maps a transaction error back into the cache error space.
    fn narrow<T>(result: crate::Result<T>) -> CacheResult<T> {
        result.map_err(|e| match e {
            crate::Error::Cache(cache) => cache,
            other => CacheError::Backend {
                message: other.to_string(),
            },
        })
    }
}

#[async_trait]
impl BalanceCache for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &BalanceKey) -> CacheResult<Option<CachedBalance>> {
        self.read(key).await
    }

    async fn fill_epoch(&self, key: &BalanceKey) -> CacheResult<u64> {
        let mut conn = self.get_connection().await?;
        let epoch: Option<u64> = conn.get(self.epoch_key(key)).await.cache_err()?;
        Ok(epoch.unwrap_or(0))
    }

    async fn bump_epoch(&self, key: &BalanceKey) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let _: u64 = conn.incr(self.epoch_key(key), 1u64).await.cache_err()?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        breakdown: Breakdown,
        epoch: u64,
    ) -> CacheResult<Option<CachedBalance>> {
        let key = breakdown.key.clone();
        Self::narrow(
            self.transact(&key, |current, observed| {
                Ok(match current {
                    Some(existing) => Step::Keep(Some(existing)),
                    None if observed != epoch => Step::Keep(None),
                    None => {
                        let fresh = CachedBalance::new(breakdown.clone());
                        Step::Write(fresh.clone(), Some(fresh))
                    }
                })
            })
            .await,
        )
    }

    async fn mutate(
        &self,
        key: &BalanceKey,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> crate::Result<Option<MutationOutcome>> {
        self.transact(key, |current, _| {
            let Some(mut cached) = current.filter(|c| !c.breakdown.is_due(now)) else {
                return Ok(Step::Keep(None));
            };
            let deduction = cached.apply(mutation)?;
            let outcome = MutationOutcome {
                breakdown: cached.breakdown.clone(),
                deduction,
            };
            Ok(Step::Write(cached, Some(outcome)))
        })
        .await
    }

    async fn take_dirty(
        &self,
        key: &BalanceKey,
    ) -> CacheResult<Option<(Breakdown, BTreeSet<EntryId>)>> {
        Self::narrow(
            self.transact(key, |current, _| {
                let Some(mut cached) = current else {
                    return Ok(Step::Keep(None));
                };
                let Some(drained) = cached.drain_dirty() else {
                    return Ok(Step::Keep(None));
                };
                let snapshot = cached.breakdown.clone();
                Ok(Step::Write(cached, Some((snapshot, drained))))
            })
            .await,
        )
    }

    async fn complete_sync(
        &self,
        key: &BalanceKey,
        ids: &BTreeSet<EntryId>,
        succeeded: bool,
    ) -> CacheResult<()> {
        Self::narrow(
            self.transact(key, |current, _| {
                let Some(mut cached) = current else {
                    return Ok(Step::Keep(()));
                };
                cached.complete_sync(ids, succeeded);
                Ok(Step::Write(cached, ()))
            })
            .await,
        )
    }

    async fn dirty_keys(&self) -> CacheResult<Vec<BalanceKey>> {
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = conn.smembers(self.dirty_set_key()).await.cache_err()?;
        let mut keys = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<BalanceKey>(&member) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(member = %member, error = %e, "Skipping malformed dirty-set member");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn invalidate_if_clean(&self, key: &BalanceKey) -> CacheResult<bool> {
        Self::narrow(
            self.transact(key, |current, _| {
                Ok(match current {
                    None => Step::Keep(true),
                    Some(cached) if cached.is_clean() => Step::Remove(true),
                    Some(_) => Step::Keep(false),
                })
            })
            .await,
        )
    }
}
