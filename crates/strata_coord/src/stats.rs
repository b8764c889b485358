//! Counters exported by the coordination cores.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of [`CoordStats`].
#[derive(Default, Debug, Clone, Copy)]
pub struct CoordStatsSnapshot {
    pub epoch_store_internal_inconsistency_errors: u64,
    pub health_monitor_num_loops: u64,
    pub health_monitor_stall_indicator: u64,
    pub health_monitor_overload_indicator: u64,
    pub health_monitor_state_indicator: u64,
}

/// Shared counter sink. All counters are cumulative and lock-free; the
/// embedder scrapes them with [`CoordStats::snapshot`].
#[derive(Default, Debug)]
pub struct CoordStats {
    /// Completions that hit a coordination-service runtime inconsistency.
    pub epoch_store_internal_inconsistency_errors: AtomicU64,
    /// Health-monitor loop wakeups.
    pub health_monitor_num_loops: AtomicU64,
    /// Ticks on which the node-level stall predicate held.
    pub health_monitor_stall_indicator: AtomicU64,
    /// Ticks on which the node-level overload predicate held.
    pub health_monitor_overload_indicator: AtomicU64,
    /// Ticks on which the node was healthy.
    pub health_monitor_state_indicator: AtomicU64,
}

impl CoordStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CoordStatsSnapshot {
        CoordStatsSnapshot {
            epoch_store_internal_inconsistency_errors: self
                .epoch_store_internal_inconsistency_errors
                .load(Ordering::Relaxed),
            health_monitor_num_loops: self.health_monitor_num_loops.load(Ordering::Relaxed),
            health_monitor_stall_indicator: self
                .health_monitor_stall_indicator
                .load(Ordering::Relaxed),
            health_monitor_overload_indicator: self
                .health_monitor_overload_indicator
                .load(Ordering::Relaxed),
            health_monitor_state_indicator: self
                .health_monitor_state_indicator
                .load(Ordering::Relaxed),
        }
    }
}
