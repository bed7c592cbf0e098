//! Tracing hooks and statistics counters.
//!
//! Every state transition in the engine invokes an optional tracer, and a
//! set of counters is kept regardless. Counters touched by several threads
//! are atomic; the snapshot is serializable so embedders can export it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::kind::PropertyKey;
use crate::property::PropertyState;

/// Observer for the store's state transitions.
///
/// All methods default to no-ops; implement the ones of interest. Tracers
/// are invoked from worker threads and must be thread-safe and cheap.
pub trait StoreTracer: Send + Sync {
    /// A task was placed on the compute deque. `task_kind` is one of
    /// `initial`, `triggered-lazy`, `on-update`, `on-final`,
    /// `immediate-on-update`; `entity` is the entity the task concerns.
    fn task_scheduled(&self, _task_kind: &'static str, _entity: EntityId) {}

    /// The updates worker finished handling a result of the given variant.
    fn update_handled(&self, _variant: &'static str) {}

    /// A bound pair was published to the table.
    fn property_published(&self, _state: &PropertyState) {}

    /// A depender's continuation was rescheduled because a dependee changed.
    fn depender_notified(
        &self,
        _depender: (EntityId, PropertyKey),
        _dependee: (EntityId, PropertyKey),
    ) {
    }

    /// A closed strongly-connected component was resolved.
    fn cycle_resolved(&self, _members: &[(EntityId, PropertyKey)]) {}

    /// A fallback value was injected for a pair nobody computes.
    fn fallback_used(&self, _entity: EntityId, _key: PropertyKey) {}

    /// The open-jobs count reached zero; `round` counts the quiescence
    /// points of the current phase, starting at 1.
    fn quiescence_reached(&self, _round: usize) {}
}

/// A tracer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl StoreTracer for NoopTracer {}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Atomic counters for the store's externally observable activity.
#[derive(Debug, Default)]
pub struct StoreStatistics {
    tasks_scheduled: AtomicU64,
    fast_track_hits: AtomicU64,
    redundant_idempotent: AtomicU64,
    useless_partial: AtomicU64,
    fallbacks_used: AtomicU64,
    scheduled_lazy: AtomicU64,
    quiescence_count: AtomicU64,
    resolved_sccs: AtomicU64,
    dependers_notified: AtomicU64,
}

impl StoreStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_task_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fast_track_hit(&self) {
        self.fast_track_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_redundant_idempotent(&self) {
        self.redundant_idempotent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_useless_partial(&self) {
        self.useless_partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fallback_used(&self) {
        self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_scheduled_lazy(&self) {
        self.scheduled_lazy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_quiescence(&self) {
        self.quiescence_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_resolved_scc(&self) {
        self.resolved_sccs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_depender_notified(&self) {
        self.dependers_notified.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            fast_track_hits: self.fast_track_hits.load(Ordering::Relaxed),
            redundant_idempotent: self.redundant_idempotent.load(Ordering::Relaxed),
            useless_partial: self.useless_partial.load(Ordering::Relaxed),
            fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
            scheduled_lazy: self.scheduled_lazy.load(Ordering::Relaxed),
            quiescence_count: self.quiescence_count.load(Ordering::Relaxed),
            resolved_sccs: self.resolved_sccs.load(Ordering::Relaxed),
            dependers_notified: self.dependers_notified.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the statistics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub tasks_scheduled: u64,
    pub fast_track_hits: u64,
    pub redundant_idempotent: u64,
    pub useless_partial: u64,
    pub fallbacks_used: u64,
    pub scheduled_lazy: u64,
    pub quiescence_count: u64,
    pub resolved_sccs: u64,
    pub dependers_notified: u64,
}

impl std::fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "property store statistics")?;
        writeln!(f, "  tasks scheduled:       {}", self.tasks_scheduled)?;
        writeln!(f, "  fast-track hits:       {}", self.fast_track_hits)?;
        writeln!(f, "  redundant idempotent:  {}", self.redundant_idempotent)?;
        writeln!(f, "  useless partial:       {}", self.useless_partial)?;
        writeln!(f, "  fallbacks used:        {}", self.fallbacks_used)?;
        writeln!(f, "  scheduled lazy:        {}", self.scheduled_lazy)?;
        writeln!(f, "  quiescence points:     {}", self.quiescence_count)?;
        writeln!(f, "  resolved SCCs:         {}", self.resolved_sccs)?;
        writeln!(f, "  dependers notified:    {}", self.dependers_notified)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StoreStatistics::new();
        stats.count_task_scheduled();
        stats.count_task_scheduled();
        stats.count_fallback_used();
        stats.count_quiescence();

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_scheduled, 2);
        assert_eq!(snap.fallbacks_used, 1);
        assert_eq!(snap.quiescence_count, 1);
        assert_eq!(snap.resolved_sccs, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = StoreStatistics::new();
        stats.count_fast_track_hit();
        let snap = stats.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: StatisticsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }

    #[test]
    fn display_lists_every_counter() {
        let snap = StoreStatistics::new().snapshot();
        let text = snap.to_string();
        assert!(text.contains("tasks scheduled"));
        assert!(text.contains("resolved SCCs"));
    }
}
