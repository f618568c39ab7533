//! Observability: structured spans and ledger metrics.

mod metrics;
mod spans;

pub use metrics::{Counter, Histogram, LedgerMetrics, MetricsSnapshot};
pub use spans::{
    OperationSpan, check_span, reset_span, sweep_span, sync_span, track_span, update_span,
};

/// Installs a global `fmt` subscriber filtered by `filter` (`RUST_LOG` syntax).
///
/// Returns `false` when a global subscriber was already set.
#[cfg(feature = "subscriber")]
pub fn init_tracing(filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
