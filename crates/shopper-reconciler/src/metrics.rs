use std::sync::RwLock;

use serde::Serialize;

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub reconciliations_run: u64,
    pub orphans_found: u64,
    pub orphans_destroyed: u64,
    pub ghosts_found: u64,
    pub ghosts_fixed: u64,
    pub errors: u64,
}

/// Reconciler counters, readable from outside for observability.
///
/// A read-write lock separates the hot snapshot reads (status endpoint) from
/// the rare per-tick writes.
#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    inner: RwLock<MetricsSnapshot>,
}

impl ReconcilerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.inner.write().expect("metrics lock poisoned").reconciliations_run += 1;
    }

    pub fn record_orphan_found(&self) {
        self.inner.write().expect("metrics lock poisoned").orphans_found += 1;
    }

    pub fn record_orphan_destroyed(&self) {
        self.inner.write().expect("metrics lock poisoned").orphans_destroyed += 1;
    }

    pub fn record_ghost_found(&self) {
        self.inner.write().expect("metrics lock poisoned").ghosts_found += 1;
    }

    pub fn record_ghost_fixed(&self) {
        self.inner.write().expect("metrics lock poisoned").ghosts_fixed += 1;
    }

    pub fn record_error(&self) {
        self.inner.write().expect("metrics lock poisoned").errors += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.read().expect("metrics lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ReconcilerMetrics::new();
        metrics.record_tick();
        metrics.record_orphan_found();
        metrics.record_orphan_found();
        metrics.record_orphan_destroyed();

        let snap = metrics.snapshot();
        assert_eq!(snap.reconciliations_run, 1);
        assert_eq!(snap.orphans_found, 2);
        assert_eq!(snap.orphans_destroyed, 1);
        assert!(snap.orphans_destroyed <= snap.orphans_found);
    }
}
