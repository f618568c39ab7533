//! Scheduled reset sweep.
//!
//! Every pass is a fresh query over `next_reset_at <= now`; the paging cursor
//! lives only for the duration of one pass, so any number of sweepers can run
//! side by side. The per-entry reset CAS is their only coordination.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{Instrument, Span};

use super::manager::{ResetManager, ResetOutcome};
use crate::Result;
use crate::balance::BalanceKey;
use crate::cache::BalanceCache;
use crate::config::SweepConfig;
use crate::observability::sweep_span;
use crate::store::LedgerStore;
use crate::sync::SyncEngine;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub synced_keys: usize,
    pub sync_failures: usize,
    pub scanned: usize,
    pub reset: usize,
    pub terminal: usize,
    pub lost_races: usize,
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &Result<ResetOutcome>) {
        match outcome {
            Ok(ResetOutcome::Applied { .. }) => self.reset += 1,
            Ok(ResetOutcome::Terminal(_)) => self.terminal += 1,
            Ok(ResetOutcome::LostRace(_)) => self.lost_races += 1,
            Ok(ResetOutcome::NotDue(_)) => {}
            Err(_) => self.failed += 1,
        }
    }
}

pub struct Sweeper {
    store: Arc<dyn LedgerStore>,
    resets: Arc<ResetManager>,
    cache: Option<(Arc<dyn BalanceCache>, Arc<SyncEngine>)>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn LedgerStore>, resets: Arc<ResetManager>, config: SweepConfig) -> Self {
        Self {
            store,
            resets,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn BalanceCache>, sync: Arc<SyncEngine>) -> Self {
        self.cache = Some((cache, sync));
        self
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let span = sweep_span();
        self.sweep(now, &span).instrument(span.clone()).await
    }

    async fn sweep(&self, now: DateTime<Utc>, span: &Span) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        if let Some((_, sync)) = &self.cache {
            let (synced, failed) = sync.sync_all().await?;
            report.synced_keys = synced;
            report.sync_failures = failed;
        }

        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.concurrency.max(1);
        let mut cursor = None;
        let mut touched = BTreeSet::new();

        loop {
            let batch = self.store.due_for_reset(now, cursor, batch_size).await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.next_reset_at.map(|at| (at, last.id));
            report.scanned += batch.len();
            let exhausted = batch.len() < batch_size;

            let outcomes: Vec<_> = futures::stream::iter(batch)
                .map(|entry| async move {
                    let outcome = self.resets.reset_entry(&entry.id, now).await;
                    (entry, outcome)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for (entry, outcome) in outcomes {
                if let Err(e) = &outcome {
                    tracing::warn!(entry_id = %entry.id, error = %e, "Sweep reset failed");
                }
                if matches!(outcome, Ok(ref o) if o.committed()) {
                    touched.insert(BalanceKey::new(entry.customer_id, entry.feature_id));
                }
                report.record(&outcome);
            }

            if exhausted || cursor.is_none() {
                break;
            }
        }

        if let Some((cache, _)) = &self.cache {
            for key in &touched {
                if let Err(e) = cache.invalidate_if_clean(key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to invalidate swept key");
                }
            }
        }

        span.record("scanned", report.scanned);
        tracing::info!(
            scanned = report.scanned,
            reset = report.reset,
            terminal = report.terminal,
            lost_races = report.lost_races,
            failed = report.failed,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        tracing::error!(error = %e, "Sweep pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}
