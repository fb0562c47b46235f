//! Per-cycle diagnostics.
//!
//! Every cycle ends with exactly one [`CycleReport`], dispatched or not.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use siphon_batch::{Millis, Strategy, UnitCounts};
use siphon_convergence::ConvergenceStatus;
use siphon_id::{CycleId, LoopId, TargetId};
use tracing::{info, warn};

/// Why a cycle dispatched nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Planner asked for zero units.
    EmptyBatch,
    /// The pool could not hold the batch.
    InsufficientCapacity,
    /// Another loop claimed this target in the same tick.
    CoordinationLost,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyBatch => "empty_batch",
            SkipReason::InsufficientCapacity => "insufficient_capacity",
            SkipReason::CoordinationLost => "coordination_lost",
        }
    }
}

/// Outcome of one control-loop cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub loop_id: LoopId,
    pub target: TargetId,
    pub at: Millis,
    pub value_ratio: f64,
    pub pressure_delta: f64,
    pub strategy: Strategy,
    pub ideal: UnitCounts,
    pub dispatched: UnitCounts,
    pub shortfall: UnitCounts,
    pub utilization_pct: f64,
    /// Planner fallbacks recovered this cycle.
    pub fallbacks: usize,
    pub convergence: ConvergenceStatus,
    /// Jobs reaped since the previous cycle, by outcome.
    pub jobs_fired: u32,
    pub jobs_aborted: u32,
    pub next_wait_ms: Millis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,
}

impl CycleReport {
    pub fn dispatched_anything(&self) -> bool {
        !self.dispatched.is_empty()
    }
}

/// Receives cycle reports.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, report: &CycleReport);
}

/// Logs each report as structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, report: &CycleReport) {
        match report.skip {
            None => info!(
                cycle_id = %report.cycle_id,
                loop_id = %report.loop_id,
                target_id = %report.target,
                strategy = %report.strategy,
                value_ratio = report.value_ratio,
                pressure_delta = report.pressure_delta,
                ideal = %report.ideal,
                dispatched = %report.dispatched,
                shortfall = %report.shortfall,
                utilization_pct = report.utilization_pct,
                convergence = ?report.convergence,
                jobs_fired = report.jobs_fired,
                jobs_aborted = report.jobs_aborted,
                next_wait_ms = report.next_wait_ms,
                "Cycle dispatched"
            ),
            Some(skip) => warn!(
                cycle_id = %report.cycle_id,
                loop_id = %report.loop_id,
                target_id = %report.target,
                strategy = %report.strategy,
                skip = skip.as_str(),
                ideal = %report.ideal,
                shortfall = %report.shortfall,
                utilization_pct = report.utilization_pct,
                next_wait_ms = report.next_wait_ms,
                "Cycle skipped"
            ),
        }
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<CycleReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<CycleReport> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, report: &CycleReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}
