//! Resource allocator.
//!
//! Packs a batch onto the worker pool. Two passes:
//!
//! 1. Total check: if the ideal batch costs more than the pool's total free
//!    capacity, nothing is dispatched. A partial farming batch would extract
//!    without the matching replenish/counter-pressure and leave the target
//!    worse off than skipping the cycle.
//! 2. Greedy packing over workers ordered by free capacity (most first, ties
//!    by id). On each worker counter-pressure is placed before replenish, and
//!    replenish before extract.
//!
//! Under [`AllocationPolicy::AllOrNothing`] a fragmented pool that still
//! leaves a shortfall after packing is also rejected.

use serde::{Deserialize, Serialize};
use siphon_id::WorkerId;
use tracing::debug;

use crate::error::SchedulerError;
use crate::ops::{OperationKind, UnitCosts, UnitCounts};
use crate::planner::{Batch, Strategy};
use crate::worker::{units_in, WorkerPool};

/// Capacity comparisons tolerate this much float dust.
const CAPACITY_EPSILON: f64 = 1e-9;

/// What to do when the batch does not fit completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Dispatch the whole batch or nothing.
    AllOrNothing,
    /// After the total check, dispatch whatever fits.
    BestEffort,
}

impl AllocationPolicy {
    /// Farming batches are all-or-nothing; preparation makes progress with
    /// whatever fits.
    pub fn for_strategy(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Farming => AllocationPolicy::AllOrNothing,
            Strategy::Preparation => AllocationPolicy::BestEffort,
        }
    }
}

/// Units of one operation placed on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub worker: WorkerId,
    pub kind: OperationKind,
    pub units: u64,
}

/// Result of packing one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub assignments: Vec<Assignment>,
    pub dispatched: UnitCounts,
    pub shortfall: UnitCounts,
    pub capacity_used: f64,
    /// Set when the batch was rejected outright.
    #[serde(skip)]
    pub error: Option<SchedulerError>,
}

impl Allocation {
    fn rejected(ideal: UnitCounts, error: SchedulerError) -> Self {
        Self {
            assignments: Vec::new(),
            dispatched: UnitCounts::ZERO,
            shortfall: ideal,
            capacity_used: 0.0,
            error: Some(error),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
    }

    pub fn has_shortfall(&self) -> bool {
        !self.shortfall.is_empty()
    }

    /// Capacity placed on `worker`.
    pub fn used_on(&self, worker: &WorkerId, costs: &UnitCosts) -> f64 {
        self.assignments
            .iter()
            .filter(|a| &a.worker == worker)
            .map(|a| a.units as f64 * costs.get(a.kind))
            .sum()
    }
}

/// Pack `batch` onto `pool`.
pub fn allocate(batch: &Batch, pool: &WorkerPool, costs: &UnitCosts, policy: AllocationPolicy) -> Allocation {
    let ideal = batch.counts;
    if ideal.is_empty() {
        return Allocation::default();
    }

    let required = ideal.cost(costs);
    let available = pool.total_free();
    if required > available + CAPACITY_EPSILON {
        debug!(
            target_id = %batch.target,
            required,
            available,
            "Batch exceeds free capacity, skipping"
        );
        return Allocation::rejected(ideal, SchedulerError::InsufficientCapacity { required, available });
    }

    let mut remaining = ideal;
    let mut assignments = Vec::new();
    let mut capacity_used = 0.0;

    for worker in pool.sorted_by_free() {
        if remaining.is_empty() {
            break;
        }
        let mut free = worker.free();
        for kind in OperationKind::ALL {
            let wanted = remaining.get(kind);
            if wanted == 0 {
                continue;
            }
            let cost = costs.get(kind);
            let units = units_in(free, cost).min(wanted);
            if units == 0 {
                continue;
            }
            let used = units as f64 * cost;
            free -= used;
            capacity_used += used;
            *remaining.get_mut(kind) -= units;
            assignments.push(Assignment {
                worker: worker.id().clone(),
                kind,
                units,
            });
        }
    }

    if !remaining.is_empty() && policy == AllocationPolicy::AllOrNothing {
        debug!(
            target_id = %batch.target,
            shortfall = %remaining,
            "Batch does not pack onto fragmented pool, skipping"
        );
        return Allocation::rejected(ideal, SchedulerError::InsufficientCapacity { required, available });
    }

    Allocation {
        assignments,
        dispatched: ideal.saturating_sub(&remaining),
        shortfall: remaining,
        capacity_used,
        error: None,
    }
}
