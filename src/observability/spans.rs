//! Structured span definitions for tracing.

use std::time::Instant;

use tracing::{Level, Span, field, span};

use crate::balance::BalanceKey;
use crate::types::EntryId;

pub fn track_span(key: &BalanceKey) -> OperationSpan {
    OperationSpan::new(span!(
        Level::INFO,
        "ledger.track",
        customer_id = %key.customer_id,
        feature_id = %key.feature_id,
        delta = field::Empty,
        duration_ms = field::Empty,
    ))
}

pub fn check_span(key: &BalanceKey) -> Span {
    span!(
        Level::DEBUG,
        "ledger.check",
        customer_id = %key.customer_id,
        feature_id = %key.feature_id,
    )
}

pub fn update_span(key: &BalanceKey) -> Span {
    span!(
        Level::INFO,
        "ledger.update",
        customer_id = %key.customer_id,
        feature_id = %key.feature_id,
    )
}

pub fn reset_span(entry_id: &EntryId) -> Span {
    span!(
        Level::INFO,
        "reset.apply",
        entry_id = %entry_id,
        periods = field::Empty,
    )
}

pub fn sync_span(key: &BalanceKey) -> Span {
    span!(
        Level::INFO,
        "sync.key",
        customer_id = %key.customer_id,
        feature_id = %key.feature_id,
        entries = field::Empty,
    )
}

pub fn sweep_span() -> Span {
    span!(Level::INFO, "sweep.run", scanned = field::Empty)
}

/// Span that records its own duration on [`OperationSpan::finish`].
pub struct OperationSpan {
    span: Span,
    start: Instant,
}

impl OperationSpan {
    fn new(span: Span) -> Self {
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn record(&self, name: &str, value: impl std::fmt::Display) {
        self.span.record(name, field::display(value));
    }

    /// Returns the elapsed milliseconds.
    pub fn finish(self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("duration_ms", elapsed);
        elapsed
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
