//! Per-target control loop.
//!
//! One loop steers one target. Each cycle:
//!
//! 1. Reap jobs that finished since the last cycle
//! 2. Snapshot the target and the worker pool, net of capacity held for
//!    other loops' waiting jobs
//! 3. Select a strategy (through the latch) and plan the batch
//! 4. Schedule finish times and pack the batch onto the pool
//! 5. Hold the packed capacity, then claim the target's coordination cell
//! 6. Spawn one timed job per assignment
//! 7. Report, then sleep until the batch has landed
//!
//! A failing cycle is logged and the loop carries on; only shutdown or
//! `max_cycles` ends it.

use std::sync::Arc;
use std::time::Duration;

use siphon_batch::{
    allocate, plan, AllocationPolicy, Analyzer, Batch, FinishTimes, Millis, OperationKind, PlannerConfig, Strategy,
    StrategyLatch, TargetSnapshot, TimingPlan, UnitCounts, WorkerPool,
};
use siphon_convergence::{distance, ConvergenceStatus, ConvergenceTracker, ShortfallTracker};
use siphon_id::{CycleId, LoopId, RunIdGenerator, TargetId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{ControllerConfig, LoopConfig};
use crate::coordination::CoordinationStore;
use crate::diagnostics::{CycleReport, DiagnosticsSink, SkipReason};
use crate::error::ControllerResult;
use crate::executor::{Executor, ReapStats};
use crate::job::{JobContext, JobSpec};
use crate::launcher::{DispatchRecord, Launcher};
use crate::reservation::{Reservation, ReservationLedger};
use crate::source::StateSource;

/// Collaborators shared by every loop of a controller.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn StateSource>,
    pub launcher: Arc<dyn Launcher>,
    pub clock: Arc<dyn Clock>,
    pub analyzer: Arc<dyn Analyzer>,
    pub sink: Arc<dyn DiagnosticsSink>,
    pub coordination: Arc<CoordinationStore>,
    pub reservations: Arc<ReservationLedger>,
    pub run_ids: Arc<RunIdGenerator>,
}

/// Totals over a loop's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub dispatched: u64,
    pub skipped: u64,
    pub jobs: ReapStats,
}

/// Control loop for one target.
pub struct ControlLoop {
    id: LoopId,
    target: TargetId,
    planner: PlannerConfig,
    timing: TimingPlan,
    config: LoopConfig,
    services: Services,
    latch: StrategyLatch,
    last_strategy: Option<Strategy>,
    convergence: ConvergenceTracker,
    shortfalls: ShortfallTracker,
    executor: Executor,
    started_at: Millis,
    summary: LoopSummary,
}

impl ControlLoop {
    /// Create a loop for `target`. Jobs poll once per raster tick.
    pub fn new(target: TargetId, config: &ControllerConfig, services: Services) -> ControllerResult<Self> {
        config.planner.validate()?;
        let timing = config.timing.plan()?;
        let convergence = config.control_loop.convergence_tracker()?;

        let ctx = JobContext {
            timing: timing.clone(),
            poll_interval: Duration::from_millis(timing.raster().tick()),
            clock: Arc::clone(&services.clock),
            source: Arc::clone(&services.source),
            launcher: Arc::clone(&services.launcher),
        };
        let executor = Executor::new(Arc::new(ctx), CancellationToken::new());
        let started_at = services.clock.now_ms();

        Ok(Self {
            id: LoopId::new(),
            target,
            planner: config.planner.clone(),
            timing,
            config: config.control_loop.clone(),
            services,
            latch: StrategyLatch::default(),
            last_strategy: None,
            convergence,
            shortfalls: config.control_loop.shortfall_tracker(),
            executor,
            started_at,
            summary: LoopSummary::default(),
        })
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    pub fn summary(&self) -> LoopSummary {
        self.summary
    }

    /// Earliest instant any job of this loop may fire.
    pub fn min_start(&self) -> Millis {
        self.started_at + self.timing.period()
    }

    /// Run one cycle and report it.
    #[instrument(skip(self), fields(loop_id = %self.id, target_id = %self.target))]
    pub async fn run_cycle(&mut self) -> ControllerResult<CycleReport> {
        let (reaped, _) = self.executor.reap();
        self.summary.jobs.merge(reaped);

        let now = self.services.clock.now_ms();
        let held = self.services.reservations.view();
        let target = self.services.source.target(&self.target).await?;
        let workers = self.services.source.workers().await?;
        let pool = self.services.reservations.available(&workers, &held)?;

        let batch = plan(
            &target,
            Some(&pool),
            self.services.analyzer.as_ref(),
            &self.planner,
            &mut self.latch,
        );
        let durations = target.durations().rastered(self.timing.raster());
        let finish = self.timing.schedule(now, &durations, self.min_start());
        let batch = batch.with_finish(finish);
        let convergence = self.observe(&target, batch.strategy);

        let mut report = CycleReport {
            cycle_id: CycleId::new(),
            loop_id: self.id,
            target: self.target.clone(),
            at: now,
            value_ratio: target.value_ratio(),
            pressure_delta: target.pressure_delta(),
            strategy: batch.strategy,
            ideal: batch.counts,
            dispatched: UnitCounts::ZERO,
            shortfall: batch.counts,
            utilization_pct: pool.utilization_pct(),
            fallbacks: batch.fallbacks.len(),
            convergence,
            jobs_fired: reaped.fired,
            jobs_aborted: reaped.aborted,
            next_wait_ms: duration_ms(self.config.min_sleep),
            skip: None,
        };

        let allocation = allocate(
            &batch,
            &pool,
            &self.planner.costs,
            AllocationPolicy::for_strategy(batch.strategy),
        );
        if allocation.is_empty() {
            let skip = if batch.counts.is_empty() {
                SkipReason::EmptyBatch
            } else {
                self.note_shortfall(&batch, &pool);
                SkipReason::InsufficientCapacity
            };
            report.skip = Some(skip);
            return Ok(self.finish(report));
        }

        let cycle_id = report.cycle_id;
        let records: Vec<DispatchRecord> = allocation
            .assignments
            .iter()
            .map(|assignment| DispatchRecord {
                run_id: self.services.run_ids.next_id(),
                cycle_id,
                kind: assignment.kind,
                target: self.target.clone(),
                worker: assignment.worker.clone(),
                units: assignment.units,
                finish: Some(finish.get(assignment.kind)),
            })
            .collect();
        let claims = records
            .iter()
            .map(|record| Reservation {
                run_id: record.run_id,
                worker: record.worker.clone(),
                amount: record.units as f64 * self.planner.costs.get(record.kind),
            })
            .collect();
        let Some(holds) = self.services.reservations.try_reserve(&workers, &held, claims) else {
            debug!("Capacity held by another loop since the snapshot, skipping");
            self.note_shortfall(&batch, &pool);
            report.skip = Some(SkipReason::InsufficientCapacity);
            return Ok(self.finish(report));
        };

        let latest = latest_finish(&finish, &allocation.dispatched);
        let tick = self.timing.raster().ticks(now);
        let cell = self.services.coordination.cell(&self.target).await;
        if !cell.try_claim(tick) {
            debug!(tick, "Target already claimed this tick, skipping");
            report.skip = Some(SkipReason::CoordinationLost);
            report.next_wait_ms = self.wait_for(latest, now);
            return Ok(self.finish(report));
        }

        for (record, hold) in records.into_iter().zip(holds) {
            let planned = durations.get(record.kind);
            self.executor.spawn(JobSpec::new(record, self.min_start(), planned).holding(hold));
        }

        if allocation.has_shortfall() {
            self.note_shortfall(&batch, &pool);
        } else {
            self.shortfalls.clear();
        }

        report.dispatched = allocation.dispatched;
        report.shortfall = allocation.shortfall;
        report.next_wait_ms = self.wait_for(latest, now);
        Ok(self.finish(report))
    }

    /// Run cycles until shutdown or `max_cycles`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopSummary {
        info!(
            loop_id = %self.id,
            target_id = %self.target,
            period_ms = self.timing.period(),
            max_cycles = ?self.config.max_cycles,
            "Starting control loop"
        );

        let mut stopped = false;
        loop {
            let wait = match self.run_cycle().await {
                Ok(report) => Duration::from_millis(report.next_wait_ms),
                Err(e) => {
                    self.summary.cycles += 1;
                    self.summary.failed_cycles += 1;
                    error!(
                        loop_id = %self.id,
                        target_id = %self.target,
                        error = %e,
                        reason = e.reason_code(),
                        "Control cycle failed"
                    );
                    self.config.min_sleep
                }
            };

            if self.config.max_cycles.is_some_and(|max| self.summary.cycles >= max) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopped = true;
                        break;
                    }
                }
            }
        }

        let (stats, _) = if stopped {
            info!(loop_id = %self.id, in_flight = self.executor.in_flight(), "Control loop shutting down");
            self.executor.shutdown().await
        } else {
            self.executor.drain().await
        };
        self.summary.jobs.merge(stats);

        info!(
            loop_id = %self.id,
            target_id = %self.target,
            cycles = self.summary.cycles,
            dispatched = self.summary.dispatched,
            skipped = self.summary.skipped,
            jobs_fired = self.summary.jobs.fired,
            jobs_aborted = self.summary.jobs.aborted,
            "Control loop stopped"
        );
        self.summary
    }

    /// Track convergence. History restarts whenever the strategy switches.
    fn observe(&mut self, target: &TargetSnapshot, strategy: Strategy) -> ConvergenceStatus {
        if self.last_strategy.is_some_and(|last| last != strategy) {
            debug!(%strategy, "Strategy switched, restarting convergence tracking");
            self.convergence.reset();
        }
        self.last_strategy = Some(strategy);

        let d = distance(target.value_ratio(), target.pressure_delta(), self.config.pressure_weight);
        let status = self.convergence.observe(d);
        if let Err(e) = self.convergence.ensure_progress() {
            warn!(
                target_id = %self.target,
                stalled_cycles = self.convergence.stalled_cycles(),
                error = %e,
                "Target is not converging"
            );
        }
        status
    }

    fn note_shortfall(&mut self, batch: &Batch, pool: &WorkerPool) {
        let now = tokio::time::Instant::now().into_std();
        if self.shortfalls.record(now) {
            warn!(
                target_id = %self.target,
                shortfalls = self.shortfalls.count(),
                required = batch.capacity_cost(&self.planner.costs),
                available = pool.total_free(),
                "Worker pool repeatedly too small for batch"
            );
        }
    }

    /// Sleep until `latest` has landed, never less than `min_sleep`.
    fn wait_for(&self, latest: Millis, now: Millis) -> Millis {
        let until_landed = latest.saturating_sub(now) + duration_ms(self.config.safety_margin);
        until_landed.max(duration_ms(self.config.min_sleep))
    }

    fn finish(&mut self, report: CycleReport) -> CycleReport {
        self.summary.cycles += 1;
        if report.skip.is_some() {
            self.summary.skipped += 1;
        } else {
            self.summary.dispatched += 1;
        }
        self.services.sink.record(&report);
        report
    }
}

fn duration_ms(d: Duration) -> Millis {
    d.as_millis() as Millis
}

/// Finish time of the slowest operation that was actually dispatched.
fn latest_finish(finish: &FinishTimes, dispatched: &UnitCounts) -> Millis {
    OperationKind::ALL
        .into_iter()
        .filter(|kind| dispatched.get(*kind) > 0)
        .map(|kind| finish.get(kind))
        .max()
        .unwrap_or_else(|| finish.latest())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::diagnostics::MemorySink;
    use crate::launcher::MockLauncher;
    use crate::sim::{SimTarget, SimWorld};
    use siphon_batch::{GameModel, Strategy, UnitCosts};
    use siphon_id::WorkerId;

    struct Fixture {
        sim: Arc<SimWorld>,
        launcher: Arc<MockLauncher>,
        sink: Arc<MemorySink>,
        services: Services,
    }

    fn fixture(value: f64, pressure: f64, capacity: f64) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::starting_at(0));
        let sim = Arc::new(SimWorld::new(GameModel::default(), UnitCosts::default(), Arc::clone(&clock)));
        sim.add_target(
            TargetId::parse("phantasy").unwrap(),
            SimTarget {
                value,
                max_value: 1_000_000.0,
                pressure,
                pressure_floor: 1.0,
            },
        );
        sim.add_worker(WorkerId::parse("home").unwrap(), capacity, 1);

        let launcher = Arc::new(MockLauncher::new());
        let sink = Arc::new(MemorySink::new());
        let services = Services {
            source: sim.clone(),
            launcher: launcher.clone(),
            clock,
            analyzer: Arc::new(GameModel::default()),
            sink: sink.clone(),
            coordination: Arc::new(CoordinationStore::new()),
            reservations: Arc::new(ReservationLedger::new()),
            run_ids: Arc::new(RunIdGenerator::new()),
        };
        Fixture {
            sim,
            launcher,
            sink,
            services,
        }
    }

    fn control_loop(f: &Fixture) -> ControlLoop {
        ControlLoop::new(
            TargetId::parse("phantasy").unwrap(),
            &ControllerConfig::default(),
            f.services.clone(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_farming_cycle_dispatches_full_batch() {
        let f = fixture(1_000_000.0, 1.0, 10_000.0);
        let mut cl = control_loop(&f);

        let report = cl.run_cycle().await.unwrap();
        assert_eq!(report.strategy, Strategy::Farming);
        assert!(report.skip.is_none());
        assert_eq!(report.dispatched, report.ideal);
        assert!(report.shortfall.is_empty());
        assert!(report.next_wait_ms >= 1_200);
        assert_eq!(cl.in_flight(), 3);
        assert_eq!(f.sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preparation_cycle_never_extracts() {
        let f = fixture(500_000.0, 21.0, 10_000.0);
        let mut cl = control_loop(&f);

        let report = cl.run_cycle().await.unwrap();
        assert_eq!(report.strategy, Strategy::Preparation);
        assert_eq!(report.ideal.extract, 0);
        assert!(report.dispatched.replenish > 0);
        assert!(report.dispatched.counter > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_shortfall_skips_without_launching() {
        let f = fixture(1_000_000.0, 1.0, 1.0);
        let mut cl = control_loop(&f);

        let report = cl.run_cycle().await.unwrap();
        assert_eq!(report.skip, Some(SkipReason::InsufficientCapacity));
        assert!(report.dispatched.is_empty());
        assert_eq!(report.shortfall, report.ideal);
        assert_eq!(report.next_wait_ms, 200);
        assert_eq!(cl.in_flight(), 0);
        assert_eq!(f.launcher.calls(), 0);

        let state = f.sim.target_state(&TargetId::parse("phantasy").unwrap()).unwrap();
        assert_eq!(state.value, 1_000_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_fails_cycle() {
        let f = fixture(1_000_000.0, 1.0, 10_000.0);
        let mut cl = ControlLoop::new(
            TargetId::parse("ghost").unwrap(),
            &ControllerConfig::default(),
            f.services.clone(),
        )
        .unwrap();

        let err = cl.run_cycle().await.unwrap_err();
        assert_eq!(err.reason_code(), "target_not_found");
        assert!(f.sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_fire_no_earlier_than_first_period() {
        let f = fixture(1_000_000.0, 1.0, 10_000.0);
        let mut cl = control_loop(&f);
        let min_start = cl.min_start();
        cl.run_cycle().await.unwrap();
        let (stats, outcomes) = cl.executor.drain().await;

        assert_eq!(stats.fired, 3);
        for outcome in &outcomes {
            if let crate::job::JobOutcome::Fired { at, .. } = outcome {
                assert!(*at >= min_start);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_max_cycles() {
        let f = fixture(1_000_000.0, 1.0, 10_000.0);
        let mut config = ControllerConfig::default();
        config.control_loop.max_cycles = Some(2);
        let cl = ControlLoop::new(TargetId::parse("phantasy").unwrap(), &config, f.services.clone()).unwrap();
        let (_tx, rx) = watch::channel(false);

        let summary = cl.run(rx).await;
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.failed_cycles, 0);
        assert_eq!(f.sink.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waiting_jobs() {
        let f = fixture(1_000_000.0, 1.0, 10_000.0);
        let cl = control_loop(&f);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(cl.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.jobs.cancelled, 3);
        assert_eq!(f.launcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preparation_waits_for_replenish_not_extract_slot() {
        let f = fixture(500_000.0, 21.0, 10_000.0);
        let mut cl = control_loop(&f);
        let snapshot = f.sim.target(&TargetId::parse("phantasy").unwrap()).await.unwrap();
        let durations = snapshot.durations().rastered(cl.timing.raster());
        let finish = cl.timing.schedule(0, &durations, cl.min_start());

        let report = cl.run_cycle().await.unwrap();
        assert_eq!(report.strategy, Strategy::Preparation);
        assert!(report.skip.is_none());
        assert_eq!(report.next_wait_ms, finish.get(OperationKind::Replenish) + 400);
        assert!(report.next_wait_ms < finish.latest() + 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategy_switch_restarts_convergence() {
        let f = fixture(950_000.0, 1.0, 10_000.0);
        let mut cl = control_loop(&f);

        let first = cl.run_cycle().await.unwrap();
        assert_eq!(first.strategy, Strategy::Farming);
        assert_eq!(first.convergence, ConvergenceStatus::Unknown);

        let second = cl.run_cycle().await.unwrap();
        assert_eq!(second.strategy, Strategy::Farming);
        assert_eq!(second.convergence, ConvergenceStatus::Converging);
        assert_eq!(cl.convergence.stalled_cycles(), 1);

        f.sim.add_target(
            TargetId::parse("phantasy").unwrap(),
            SimTarget {
                value: 500_000.0,
                max_value: 1_000_000.0,
                pressure: 1.0,
                pressure_floor: 1.0,
            },
        );
        let third = cl.run_cycle().await.unwrap();
        assert_eq!(third.strategy, Strategy::Preparation);
        assert_eq!(third.convergence, ConvergenceStatus::Unknown);
        assert_eq!(cl.convergence.stalled_cycles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_holds_capacity_until_jobs_fire() {
        let f = fixture(1_000_000.0, 1.0, 10_000.0);
        let mut cl = control_loop(&f);
        let home = WorkerId::parse("home").unwrap();

        let report = cl.run_cycle().await.unwrap();
        let cost = report.dispatched.cost(&UnitCosts::default());
        assert!((f.services.reservations.outstanding(&home) - cost).abs() < 1e-9);

        let (stats, _) = cl.executor.drain().await;
        assert_eq!(stats.fired, 3);
        assert!(f.services.reservations.is_empty());
    }
}
