//! Metrics collection for the coordination node.
//!
//! This module provides functionality for collecting and exposing service
//! metrics using Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, IntCounter, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for proposals submitted through the node, by outcome
    pub static ref PROPOSALS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("proposals_total", "proposals submitted by outcome"),
        &["outcome"]
    )
    .unwrap();

    /// Committed entries applied to the memory store
    pub static ref ENTRIES_APPLIED: IntCounter =
        IntCounter::new("entries_applied_total", "committed entries applied").unwrap();

    /// Snapshots written to disk
    pub static ref SNAPSHOTS_SAVED: IntCounter =
        IntCounter::new("snapshots_saved_total", "snapshots written to disk").unwrap();

    /// Whether this node currently believes it is the leader
    pub static ref IS_LEADER: IntGauge =
        IntGauge::new("is_leader", "1 while this node is the raft leader").unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSALS_TOTAL.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ENTRIES_APPLIED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOTS_SAVED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(IS_LEADER.clone()));
}
