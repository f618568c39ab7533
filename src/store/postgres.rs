//! PostgreSQL ledger store.
//!
//! Enable with the `postgres` feature flag.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use super::{
    EntryCommit, LedgerStore, ResetCommit, StorageResultExt, StoreError, StoreResult,
    SyncOutcome, SyncTarget,
};
use crate::balance::BalanceKey;
use crate::sync::reconcile;
use crate::types::{
    Balances, EntityId, EntryId, EntryStatus, Feature, FeatureId, Grant, GrantId, LedgerEntry,
    ProductInstanceId, RolloverRecord,
};

const ENTRY_COLUMNS: &str = "id, customer_id, feature_id, product_instance_id, subscription_ref, \
     grant_id, status, granted_balance, purchased_balance, usage, adjustment, unlimited, \
     overage_allowed, quantity, next_reset_at, entity_balances, version, created_at";

/// Table names used by [`PostgresStore`].
#[derive(Clone, Debug)]
pub struct PostgresTables {
    pub features: String,
    pub grants: String,
    pub entries: String,
    pub rollovers: String,
}

impl PostgresTables {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            features: format!("{prefix}features"),
            grants: format!("{prefix}grants"),
            entries: format!("{prefix}entries"),
            rollovers: format!("{prefix}rollover_records"),
        }
    }
}

impl Default for PostgresTables {
    fn default() -> Self {
        Self::with_prefix("ledger_")
    }
}

pub struct PostgresStore {
    pool: Arc<PgPool>,
    tables: PostgresTables,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            tables: PostgresTables::default(),
        }
    }

    pub fn with_tables(mut self, tables: PostgresTables) -> Self {
        self.tables = tables;
        self
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let t = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(255) PRIMARY KEY,
                    data JSONB NOT NULL
                )",
                t.features
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    feature_id VARCHAR(255) NOT NULL,
                    data JSONB NOT NULL
                )",
                t.grants
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    customer_id VARCHAR(255) NOT NULL,
                    feature_id VARCHAR(255) NOT NULL,
                    product_instance_id VARCHAR(255),
                    subscription_ref VARCHAR(255),
                    grant_id UUID NOT NULL REFERENCES {}(id),
                    status VARCHAR(16) NOT NULL,
                    granted_balance NUMERIC NOT NULL,
                    purchased_balance NUMERIC NOT NULL,
                    usage NUMERIC NOT NULL,
                    adjustment NUMERIC NOT NULL,
                    unlimited BOOLEAN NOT NULL,
                    overage_allowed BOOLEAN NOT NULL,
                    quantity NUMERIC NOT NULL,
                    next_reset_at TIMESTAMPTZ,
                    entity_balances JSONB,
                    version BIGINT NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL
                )",
                t.entries, t.grants
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_key ON {0} (customer_id, feature_id)",
                t.entries
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_due ON {0} (next_reset_at, id) \
                 WHERE next_reset_at IS NOT NULL",
                t.entries
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_instance ON {0} (product_instance_id)",
                t.entries
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    ledger_entry_id UUID NOT NULL REFERENCES {}(id) ON DELETE CASCADE,
                    entity_id VARCHAR(255),
                    amount NUMERIC NOT NULL,
                    expires_after_period_count INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )",
                t.rollovers, t.entries
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_entry ON {0} (ledger_entry_id)",
                t.rollovers
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&*self.pool).await?;
        }
        Ok(())
    }

    fn entry_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
        let status: String = row.try_get("status").storage_err()?;
        let entity_balances: Option<serde_json::Value> =
            row.try_get("entity_balances").storage_err()?;
        let entity_balances = entity_balances
            .map(serde_json::from_value)
            .transpose()?;

        Ok(LedgerEntry {
            id: EntryId::from(row.try_get::<uuid::Uuid, _>("id").storage_err()?),
            customer_id: row.try_get::<String, _>("customer_id").storage_err()?.into(),
            feature_id: row.try_get::<String, _>("feature_id").storage_err()?.into(),
            product_instance_id: row
                .try_get::<Option<String>, _>("product_instance_id")
                .storage_err()?
                .map(ProductInstanceId::from),
            subscription_ref: row
                .try_get::<Option<String>, _>("subscription_ref")
                .storage_err()?
                .map(Into::into),
            grant_id: GrantId::from(row.try_get::<uuid::Uuid, _>("grant_id").storage_err()?),
            status: EntryStatus::parse(&status).ok_or_else(|| StoreError::Storage {
                message: format!("unknown entry status '{}'", status),
            })?,
            balances: Balances {
                granted_balance: row.try_get("granted_balance").storage_err()?,
                purchased_balance: row.try_get("purchased_balance").storage_err()?,
                usage: row.try_get("usage").storage_err()?,
                adjustment: row.try_get("adjustment").storage_err()?,
            },
            unlimited: row.try_get("unlimited").storage_err()?,
            overage_allowed: row.try_get("overage_allowed").storage_err()?,
            quantity: row.try_get("quantity").storage_err()?,
            next_reset_at: row.try_get("next_reset_at").storage_err()?,
            entity_balances,
            version: row.try_get("version").storage_err()?,
            created_at: row.try_get("created_at").storage_err()?,
        })
    }

    async fn lock_entry(
        &self,
        conn: &mut PgConnection,
        id: &EntryId,
    ) -> StoreResult<Option<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            ENTRY_COLUMNS, self.tables.entries
        );
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .storage_err_ctx("lock entry")?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    /// Writes the mutable columns of `entry` with `version` as the new version.
    /// The guard clause is appended by the caller.
    fn update_sql(&self, guard: &str) -> String {
        format!(
            "UPDATE {} SET status = $2, granted_balance = $3, purchased_balance = $4, \
             usage = $5, adjustment = $6, unlimited = $7, overage_allowed = $8, \
             quantity = $9, next_reset_at = $10, entity_balances = $11, version = $12 \
             WHERE id = $1 {}",
            self.tables.entries, guard
        )
    }

    async fn write_entry(
        &self,
        conn: &mut PgConnection,
        entry: &LedgerEntry,
        version: i64,
        guard: (&str, Option<GuardValue>),
    ) -> StoreResult<u64> {
        let entity_balances = entry
            .entity_balances
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let sql = self.update_sql(guard.0);
        let mut query = sqlx::query(&sql)
            .bind(entry.id.as_uuid())
            .bind(entry.status.as_str())
            .bind(entry.balances.granted_balance)
            .bind(entry.balances.purchased_balance)
            .bind(entry.balances.usage)
            .bind(entry.balances.adjustment)
            .bind(entry.unlimited)
            .bind(entry.overage_allowed)
            .bind(entry.quantity)
            .bind(entry.next_reset_at)
            .bind(entity_balances)
            .bind(version);
        query = match guard.1 {
            Some(GuardValue::Version(v)) => query.bind(v),
            Some(GuardValue::ResetAt(at)) => query.bind(at),
            None => query,
        };
        let result = query
            .execute(&mut *conn)
            .await
            .storage_err_ctx("write entry")?;
        Ok(result.rows_affected())
    }
}

enum GuardValue {
    Version(i64),
    ResetAt(DateTime<Utc>),
}

#[async_trait]
impl LedgerStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn put_feature(&self, feature: &Feature) -> StoreResult<()> {
        let data = serde_json::to_value(feature)?;
        let query = format!(
            "INSERT INTO {} (id, data) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET data = $2",
            self.tables.features
        );
        sqlx::query(&query)
            .bind(feature.id.as_str())
            .bind(&data)
            .execute(&*self.pool)
            .await
            .storage_err()?;
        Ok(())
    }

    async fn feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>> {
        let query = format!("SELECT data FROM {} WHERE id = $1", self.tables.features);
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").storage_err()?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn put_grant(&self, grant: &Grant) -> StoreResult<()> {
        let data = serde_json::to_value(grant)?;
        let query = format!(
            "INSERT INTO {} (id, feature_id, data) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET data = $3",
            self.tables.grants
        );
        sqlx::query(&query)
            .bind(grant.id.as_uuid())
            .bind(grant.feature_id.as_str())
            .bind(&data)
            .execute(&*self.pool)
            .await
            .storage_err()?;
        Ok(())
    }

    async fn grant(&self, id: &GrantId) -> StoreResult<Option<Grant>> {
        let query = format!("SELECT data FROM {} WHERE id = $1", self.tables.grants);
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").storage_err()?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn insert_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let entity_balances = entry
            .entity_balances
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let query = format!(
            "INSERT INTO {} ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            self.tables.entries, ENTRY_COLUMNS
        );
        sqlx::query(&query)
            .bind(entry.id.as_uuid())
            .bind(entry.customer_id.as_str())
            .bind(entry.feature_id.as_str())
            .bind(entry.product_instance_id.as_ref().map(|p| p.as_str()))
            .bind(entry.subscription_ref.as_ref().map(|s| s.as_str()))
            .bind(entry.grant_id.as_uuid())
            .bind(entry.status.as_str())
            .bind(entry.balances.granted_balance)
            .bind(entry.balances.purchased_balance)
            .bind(entry.balances.usage)
            .bind(entry.balances.adjustment)
            .bind(entry.unlimited)
            .bind(entry.overage_allowed)
            .bind(entry.quantity)
            .bind(entry.next_reset_at)
            .bind(entity_balances)
            .bind(entry.version)
            .bind(entry.created_at)
            .execute(&*self.pool)
            .await
            .storage_err_ctx("insert entry")?;
        Ok(())
    }

    async fn entry(&self, id: &EntryId) -> StoreResult<Option<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            ENTRY_COLUMNS, self.tables.entries
        );
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn entries_for(&self, key: &BalanceKey) -> StoreResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM {} WHERE customer_id = $1 AND feature_id = $2 AND status <> 'expired'",
            ENTRY_COLUMNS, self.tables.entries
        );
        let rows = sqlx::query(&query)
            .bind(key.customer_id.as_str())
            .bind(key.feature_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn entries_for_instance(
        &self,
        id: &ProductInstanceId,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM {} WHERE product_instance_id = $1",
            ENTRY_COLUMNS, self.tables.entries
        );
        let rows = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn rollovers(&self, entry_id: &EntryId) -> StoreResult<Vec<RolloverRecord>> {
        let query = format!(
            "SELECT id, entity_id, amount, expires_after_period_count, created_at \
             FROM {} WHERE ledger_entry_id = $1 ORDER BY created_at, id",
            self.tables.rollovers
        );
        let rows = sqlx::query(&query)
            .bind(entry_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;

        rows.iter()
            .map(|row| {
                let periods: i32 = row.try_get("expires_after_period_count").storage_err()?;
                Ok(RolloverRecord {
                    id: row.try_get::<uuid::Uuid, _>("id").storage_err()?.into(),
                    entry_id: *entry_id,
                    entity_id: row
                        .try_get::<Option<String>, _>("entity_id")
                        .storage_err()?
                        .map(EntityId::from),
                    amount: row.try_get::<Decimal, _>("amount").storage_err()?,
                    expires_after_period_count: periods.max(0) as u32,
                    created_at: row.try_get("created_at").storage_err()?,
                })
            })
            .collect()
    }

    async fn due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<(DateTime<Utc>, EntryId)>,
        limit: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let rows = match after {
            Some((at, id)) => {
                let query = format!(
                    "SELECT {} FROM {} WHERE next_reset_at <= $1 AND status <> 'expired' \
                     AND (next_reset_at, id) > ($2, $3) ORDER BY next_reset_at, id LIMIT $4",
                    ENTRY_COLUMNS, self.tables.entries
                );
                sqlx::query(&query)
                    .bind(now)
                    .bind(at)
                    .bind(id.as_uuid())
                    .bind(limit as i64)
                    .fetch_all(&*self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT {} FROM {} WHERE next_reset_at <= $1 AND status <> 'expired' \
                     ORDER BY next_reset_at, id LIMIT $2",
                    ENTRY_COLUMNS, self.tables.entries
                );
                sqlx::query(&query)
                    .bind(now)
                    .bind(limit as i64)
                    .fetch_all(&*self.pool)
                    .await
            }
        }
        .storage_err_ctx("due entries")?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn apply_reset(&self, commit: &ResetCommit) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.storage_err()?;

        let Some(current) = self.lock_entry(&mut tx, &commit.entry.id).await? else {
            return Err(StoreError::not_found("entry", commit.entry.id));
        };

        let updated = self
            .write_entry(
                &mut tx,
                &commit.entry,
                current.version + 1,
                (
                    "AND next_reset_at = $13",
                    Some(GuardValue::ResetAt(commit.expected_next_reset_at)),
                ),
            )
            .await?;
        if updated == 0 {
            tx.rollback().await.storage_err()?;
            return Ok(false);
        }

        let delete = format!("DELETE FROM {} WHERE ledger_entry_id = $1", self.tables.rollovers);
        sqlx::query(&delete)
            .bind(commit.entry.id.as_uuid())
            .execute(&mut *tx)
            .await
            .storage_err_ctx("clear rollovers")?;

        let insert = format!(
            "INSERT INTO {} (id, ledger_entry_id, entity_id, amount, expires_after_period_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.tables.rollovers
        );
        for record in &commit.rollovers {
            sqlx::query(&insert)
                .bind(record.id.as_uuid())
                .bind(record.entry_id.as_uuid())
                .bind(record.entity_id.as_ref().map(|e| e.as_str()))
                .bind(record.amount)
                .bind(record.expires_after_period_count as i32)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await
                .storage_err_ctx("insert rollover")?;
        }

        tx.commit().await.storage_err()?;
        Ok(true)
    }

    async fn commit_entries(&self, commits: &[EntryCommit]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.storage_err()?;
        for commit in commits {
            let updated = self
                .write_entry(
                    &mut tx,
                    &commit.entry,
                    commit.expected_version + 1,
                    (
                        "AND version = $13",
                        Some(GuardValue::Version(commit.expected_version)),
                    ),
                )
                .await?;
            if updated == 0 {
                tx.rollback().await.storage_err()?;
                return Err(StoreError::Conflict {
                    id: commit.entry.id.to_string(),
                });
            }
        }
        tx.commit().await.storage_err()?;
        Ok(())
    }

    async fn add_purchase(
        &self,
        entry_id: &EntryId,
        entity_id: Option<&EntityId>,
        quantity: Decimal,
    ) -> StoreResult<LedgerEntry> {
        let mut tx = self.pool.begin().await.storage_err()?;
        let mut entry = self
            .lock_entry(&mut tx, entry_id)
            .await?
            .ok_or_else(|| StoreError::not_found("entry", entry_id))?;

        let slot = entry.slot_mut(entity_id).ok_or_else(|| {
            StoreError::not_found(
                "entity",
                entity_id.map(|e| e.to_string()).unwrap_or_default(),
            )
        })?;
        slot.purchased_balance += quantity;
        entry.refresh_totals();
        entry.version += 1;

        self.write_entry(&mut tx, &entry, entry.version, ("", None))
            .await?;
        tx.commit().await.storage_err()?;
        Ok(entry)
    }

    async fn sync_entries(&self, targets: &[SyncTarget]) -> StoreResult<SyncOutcome> {
        // Lock rows in id order so concurrent syncs cannot deadlock.
        let mut ordered: Vec<&SyncTarget> = targets.iter().collect();
        ordered.sort_by_key(|t| t.entry_id);

        let mut tx = self.pool.begin().await.storage_err()?;
        let mut outcome = SyncOutcome::default();
        for target in ordered {
            let Some(durable) = self.lock_entry(&mut tx, &target.entry_id).await? else {
                outcome.missing.push(target.entry_id);
                continue;
            };
            match reconcile(&durable, target) {
                Some(updated) => {
                    if updated != durable {
                        self.write_entry(&mut tx, &updated, durable.version + 1, ("", None))
                            .await?;
                    }
                    outcome.written.push(target.entry_id);
                }
                None => outcome.stale.push(target.entry_id),
            }
        }
        tx.commit().await.storage_err()?;
        Ok(outcome)
    }

    async fn expire_instance(&self, id: &ProductInstanceId) -> StoreResult<Vec<LedgerEntry>> {
        let query = format!(
            "UPDATE {} SET status = 'expired', version = version + 1 \
             WHERE product_instance_id = $1 AND status <> 'expired' RETURNING {}",
            self.tables.entries, ENTRY_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_all(&*self.pool)
            .await
            .storage_err_ctx("expire instance")?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}
