//! Job executor.
//!
//! Owns the in-flight job tasks of one control loop. Jobs are reaped at the
//! start of every cycle; on shutdown they are cancelled and drained.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::job::{run_job, JobContext, JobOutcome, JobSpec};

/// Counts of reaped jobs by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub fired: u32,
    pub aborted: u32,
    pub launch_failed: u32,
    pub cancelled: u32,
}

impl ReapStats {
    fn count(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Fired { .. } => self.fired += 1,
            JobOutcome::Aborted { .. } => self.aborted += 1,
            JobOutcome::LaunchFailed { .. } => self.launch_failed += 1,
            JobOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.fired + self.aborted + self.launch_failed + self.cancelled
    }

    pub fn merge(&mut self, other: ReapStats) {
        self.fired += other.fired;
        self.aborted += other.aborted;
        self.launch_failed += other.launch_failed;
        self.cancelled += other.cancelled;
    }
}

/// Spawns and tracks job tasks.
pub struct Executor {
    ctx: Arc<JobContext>,
    jobs: JoinSet<JobOutcome>,
    cancel: CancellationToken,
}

impl Executor {
    /// Jobs are cancelled when `cancel` (or its parent) is cancelled.
    pub fn new(ctx: Arc<JobContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            jobs: JoinSet::new(),
            cancel,
        }
    }

    pub fn spawn(&mut self, spec: JobSpec) {
        debug!(
            run_id = %spec.record.run_id,
            kind = %spec.record.kind,
            worker_id = %spec.record.worker,
            units = spec.record.units,
            finish = ?spec.record.finish,
            "Spawning job"
        );
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.child_token();
        self.jobs.spawn(run_job(ctx, spec, cancel));
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Collect finished jobs without waiting.
    pub fn reap(&mut self) -> (ReapStats, Vec<JobOutcome>) {
        let mut stats = ReapStats::default();
        let mut outcomes = Vec::new();
        while let Some(result) = self.jobs.try_join_next() {
            self.collect(result, &mut stats, &mut outcomes);
        }
        (stats, outcomes)
    }

    /// Wait for every in-flight job to finish on its own.
    pub async fn drain(&mut self) -> (ReapStats, Vec<JobOutcome>) {
        let mut stats = ReapStats::default();
        let mut outcomes = Vec::new();
        while let Some(result) = self.jobs.join_next().await {
            self.collect(result, &mut stats, &mut outcomes);
        }
        (stats, outcomes)
    }

    /// Cancel every in-flight job and wait for them to exit.
    pub async fn shutdown(&mut self) -> (ReapStats, Vec<JobOutcome>) {
        self.cancel.cancel();
        self.drain().await
    }

    fn collect(
        &self,
        result: Result<JobOutcome, tokio::task::JoinError>,
        stats: &mut ReapStats,
        outcomes: &mut Vec<JobOutcome>,
    ) {
        match result {
            Ok(outcome) => {
                stats.count(&outcome);
                outcomes.push(outcome);
            }
            Err(e) => error!(error = %e, "Job task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::error::ControllerResult;
    use crate::launcher::{DispatchRecord, MockLauncher};
    use crate::source::StateSource;
    use async_trait::async_trait;
    use siphon_batch::{OperationDurations, OperationKind, TargetSnapshot, TimingPlan, WorkerPool};
    use siphon_id::{CycleId, RunId, TargetId, WorkerId};
    use std::time::Duration;

    struct Steady;

    #[async_trait]
    impl StateSource for Steady {
        async fn targets(&self) -> ControllerResult<Vec<TargetId>> {
            Ok(vec![])
        }

        async fn target(&self, id: &TargetId) -> ControllerResult<TargetSnapshot> {
            Ok(TargetSnapshot::new(
                id.clone(),
                1.0,
                1.0,
                1.0,
                1.0,
                OperationDurations::new(2_000, 6_400, 8_000),
            )?)
        }

        async fn workers(&self) -> ControllerResult<WorkerPool> {
            Ok(WorkerPool::default())
        }
    }

    fn executor(launcher: Arc<MockLauncher>) -> Executor {
        let ctx = JobContext {
            timing: TimingPlan::default(),
            poll_interval: Duration::from_millis(200),
            clock: Arc::new(MonotonicClock::starting_at(0)),
            source: Arc::new(Steady),
            launcher,
        };
        Executor::new(Arc::new(ctx), CancellationToken::new())
    }

    fn spec(run: u64, kind: OperationKind, finish: u64) -> JobSpec {
        let record = DispatchRecord {
            run_id: RunId::new(run),
            cycle_id: CycleId::new(),
            kind,
            target: TargetId::parse("max-hardware").unwrap(),
            worker: WorkerId::parse("home").unwrap(),
            units: 1,
            finish: Some(finish),
        };
        JobSpec::new(record, 0, 0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_runs_batch_in_landing_order() {
        let launcher = Arc::new(MockLauncher::new());
        let mut exec = executor(Arc::clone(&launcher));
        // Period 1_200: counter at 8_400, replenish 8_800, extract 9_200.
        exec.spawn(spec(1, OperationKind::Extract, 9_200));
        exec.spawn(spec(2, OperationKind::Replenish, 8_800));
        exec.spawn(spec(3, OperationKind::CounterPressure, 8_400));
        assert_eq!(exec.in_flight(), 3);

        let (stats, outcomes) = exec.drain().await;
        assert_eq!(stats.fired, 3);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(exec.in_flight(), 0);

        // Fire order is by start time: counter (400), replenish (2_400), extract (7_200).
        let order: Vec<u64> = launcher.launched().await.iter().map(|r| r.run_id.value()).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_is_non_blocking() {
        let launcher = Arc::new(MockLauncher::new());
        let mut exec = executor(launcher);
        exec.spawn(spec(1, OperationKind::Extract, 60_800));

        let (stats, _) = exec.reap();
        assert_eq!(stats.total(), 0);
        assert_eq!(exec.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight() {
        let launcher = Arc::new(MockLauncher::new());
        let mut exec = executor(Arc::clone(&launcher));
        exec.spawn(spec(1, OperationKind::Extract, 60_800));
        exec.spawn(spec(2, OperationKind::Replenish, 60_400));

        let (stats, _) = exec.shutdown().await;
        assert_eq!(stats.cancelled, 2);
        assert_eq!(launcher.calls(), 0);
    }

    #[test]
    fn test_stats_merge() {
        let mut a = ReapStats {
            fired: 1,
            ..ReapStats::default()
        };
        a.merge(ReapStats {
            aborted: 2,
            cancelled: 1,
            ..ReapStats::default()
        });
        assert_eq!(a.total(), 4);
    }
}
