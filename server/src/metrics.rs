//! Prometheus metrics for the replicated write path.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Writes entering the replication path, by outcome
    /// (replicated / forwarded / rejected).
    pub static ref WRITE_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("write_requests", "writes entering the replication path"),
        &["outcome"]
    )
    .unwrap();

    /// Committed log entries applied to the store.
    pub static ref APPLIED_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("applied_entries", "committed entries applied"),
        &["kind"]
    )
    .unwrap();

    /// Wall time of snapshot saves.
    pub static ref SNAPSHOT_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("snapshot_save_seconds", "snapshot save wall time"),
        &["result"]
    )
    .unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(WRITE_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_HISTOGRAM_VEC.clone()));
}
