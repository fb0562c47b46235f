//! Batch scheduling core.
//!
//! Everything here is pure and synchronous. A control loop feeds in
//! snapshots and gets back plans:
//!
//! - **Planner**: how many units of extract, replenish and counter-pressure a
//!   target needs this cycle.
//! - **Timing**: when each operation must finish so their effects land in
//!   order (counter-pressure, then replenish, then extract).
//! - **Allocator**: which worker runs how many units of what.
//!
//! # Invariants
//!
//! - All times are milliseconds on a shared clock, rounded up to the raster
//! - A planned count is never NaN, infinite or negative
//! - No worker is assigned more than its free capacity
//! - A job never fires after its target finish time

pub mod allocator;
pub mod analyzer;
pub mod error;
pub mod ops;
pub mod planner;
pub mod raster;
pub mod selection;
pub mod target;
pub mod timing;
pub mod worker;

/// Milliseconds on the shared clock.
pub type Millis = u64;

pub use allocator::{allocate, Allocation, AllocationPolicy, Assignment};
pub use analyzer::{Analyzer, GameModel};
pub use error::{SchedulerError, SchedulerResult, SnapshotError};
pub use ops::{OperationKind, UnitCosts, UnitCounts};
pub use planner::{plan, plan_farming, plan_preparation, Batch, PlanFallback, PlannerConfig, Strategy, StrategyLatch};
pub use raster::Raster;
pub use selection::rank_targets;
pub use target::{OperationDurations, TargetSnapshot, Thresholds};
pub use timing::{AbortReason, AttemptState, FinishTimes, JobAttempt, TimingPlan};
pub use worker::{WorkerPool, WorkerSnapshot};
