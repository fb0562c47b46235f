//! Worker pool model.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use siphon_id::WorkerId;

use crate::error::{ensure_magnitude, SnapshotError};

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    id: WorkerId,
    total: f64,
    committed: f64,
    cores: u32,
}

impl WorkerSnapshot {
    /// Builds a snapshot, enforcing `committed <= total`.
    ///
    /// `cores` is clamped to at least one.
    pub fn new(id: WorkerId, total: f64, committed: f64, cores: u32) -> Result<Self, SnapshotError> {
        let total = ensure_magnitude("total", total)?;
        let committed = ensure_magnitude("committed", committed)?;
        if committed > total {
            return Err(SnapshotError::CommittedExceedsTotal { committed, total });
        }
        Ok(Self {
            id,
            total,
            committed,
            cores: cores.max(1),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn committed(&self) -> f64 {
        self.committed
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// `total - committed`.
    pub fn free(&self) -> f64 {
        self.total - self.committed
    }

    /// How many units costing `cost` fit in the free capacity.
    pub fn units(&self, cost: f64) -> u64 {
        units_in(self.free(), cost)
    }
}

/// `floor(capacity / cost)`, zero for a non-positive cost or capacity.
pub(crate) fn units_in(capacity: f64, cost: f64) -> u64 {
    if cost > 0.0 && capacity > 0.0 {
        // Tolerate float dust like 3.4999999 / 1.75.
        ((capacity / cost) + 1e-9).floor() as u64
    } else {
        0
    }
}

/// The set of workers visible this cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPool {
    workers: Vec<WorkerSnapshot>,
}

impl WorkerPool {
    pub fn new(workers: Vec<WorkerSnapshot>) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> &[WorkerSnapshot] {
        &self.workers
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn total_capacity(&self) -> f64 {
        self.workers.iter().map(WorkerSnapshot::total).sum()
    }

    pub fn total_free(&self) -> f64 {
        self.workers.iter().map(WorkerSnapshot::free).sum()
    }

    /// Committed share of total capacity, in percent.
    pub fn utilization_pct(&self) -> f64 {
        let total = self.total_capacity();
        if total > 0.0 {
            (total - self.total_free()) / total * 100.0
        } else {
            0.0
        }
    }

    /// Fewest cores on any single worker.
    ///
    /// Planners size replenish and counter-pressure for this bonus, since the
    /// allocator may place units on any worker.
    pub fn min_cores(&self) -> u32 {
        self.workers.iter().map(WorkerSnapshot::cores).min().unwrap_or(1)
    }

    /// Workers ordered by free capacity, largest first, ties by id.
    pub fn sorted_by_free(&self) -> Vec<&WorkerSnapshot> {
        let mut sorted: Vec<&WorkerSnapshot> = self.workers.iter().collect();
        sorted.sort_by(|a, b| {
            b.free()
                .partial_cmp(&a.free())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, total: f64, committed: f64) -> WorkerSnapshot {
        WorkerSnapshot::new(WorkerId::parse(name).unwrap(), total, committed, 1).unwrap()
    }

    #[test]
    fn test_free_and_units() {
        let w = worker("home", 64.0, 10.0);
        assert_eq!(w.free(), 54.0);
        assert_eq!(w.units(1.75), 30);
        assert_eq!(w.units(0.0), 0);
    }

    #[test]
    fn test_units_tolerates_float_dust() {
        assert_eq!(units_in(3.5, 1.75), 2);
        assert_eq!(units_in(1.75 * 3.0, 1.75), 3);
    }

    #[test]
    fn test_rejects_overcommitted() {
        let err = WorkerSnapshot::new(WorkerId::parse("a").unwrap(), 8.0, 9.0, 1).unwrap_err();
        assert!(matches!(err, SnapshotError::CommittedExceedsTotal { .. }));
    }

    #[test]
    fn test_cores_clamped() {
        let w = WorkerSnapshot::new(WorkerId::parse("a").unwrap(), 8.0, 0.0, 0).unwrap();
        assert_eq!(w.cores(), 1);
    }

    #[test]
    fn test_pool_aggregates() {
        let pool = WorkerPool::new(vec![worker("a", 32.0, 8.0), worker("b", 16.0, 0.0)]);
        assert_eq!(pool.total_capacity(), 48.0);
        assert_eq!(pool.total_free(), 40.0);
        assert!((pool.utilization_pct() - 16.666_666).abs() < 1e-3);
    }

    #[test]
    fn test_empty_pool_utilization() {
        assert_eq!(WorkerPool::default().utilization_pct(), 0.0);
        assert_eq!(WorkerPool::default().min_cores(), 1);
    }

    #[test]
    fn test_min_cores_is_weakest_worker() {
        let pool = WorkerPool::new(vec![
            WorkerSnapshot::new(WorkerId::parse("home").unwrap(), 64.0, 0.0, 8).unwrap(),
            WorkerSnapshot::new(WorkerId::parse("pserv-0").unwrap(), 16.0, 0.0, 1).unwrap(),
        ]);
        assert_eq!(pool.min_cores(), 1);
    }

    #[test]
    fn test_sorted_by_free_breaks_ties_by_id() {
        let pool = WorkerPool::new(vec![
            worker("c", 16.0, 0.0),
            worker("a", 8.0, 0.0),
            worker("b", 16.0, 0.0),
        ]);
        let order: Vec<&str> = pool.sorted_by_free().iter().map(|w| w.id().as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
