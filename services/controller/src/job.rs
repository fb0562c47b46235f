//! Timed jobs.
//!
//! A dispatched job is a task that waits for the instant its operation, if
//! started now, would finish exactly on its target finish time. It then
//! launches once and exits. The wait is driven by a [`JobAttempt`]:
//!
//! - The task sleeps until one poll interval before the expected fire instant
//! - From there it polls every interval, re-reading the operation duration
//! - It fires, aborts (`TimeMiss`, `WrongType`) or is cancelled; never late
//!
//! Durations drift while the task waits (pressure changes as other jobs
//! land), which is why the fire instant is re-derived on every poll instead
//! of computed once.
//!
//! A job may carry a capacity [`Hold`]. It is released as soon as the job
//! stops waiting, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use siphon_batch::{AbortReason, AttemptState, JobAttempt, Millis, OperationKind, TimingPlan};
use siphon_id::RunId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::launcher::{DispatchRecord, LaunchError, LaunchHandle, Launcher};
use crate::reservation::Hold;
use crate::source::StateSource;

/// Everything a job task needs, shared by all jobs of a loop.
pub struct JobContext {
    pub timing: TimingPlan,
    pub poll_interval: Duration,
    pub clock: Arc<dyn Clock>,
    pub source: Arc<dyn StateSource>,
    pub launcher: Arc<dyn Launcher>,
}

/// A job ready to be spawned.
#[derive(Debug)]
pub struct JobSpec {
    pub record: DispatchRecord,
    pub attempt: JobAttempt,
    /// Duration seen at planning time; used when the source cannot answer.
    pub planned_duration: Millis,
    /// Capacity held for this job until it fires.
    pub hold: Option<Hold>,
}

impl JobSpec {
    /// A job timed to `record.finish`.
    pub fn new(record: DispatchRecord, min_start: Millis, planned_duration: Millis) -> Self {
        let attempt = JobAttempt::for_kind(record.kind, record.finish, min_start);
        Self {
            record,
            attempt,
            planned_duration,
            hold: None,
        }
    }

    /// Attach the capacity hold taken when the job was packed.
    pub fn holding(mut self, hold: Hold) -> Self {
        self.hold = Some(hold);
        self
    }
}

/// How a job ended.
#[derive(Debug)]
pub enum JobOutcome {
    Fired {
        record: DispatchRecord,
        handle: LaunchHandle,
        at: Millis,
    },
    Aborted {
        record: DispatchRecord,
        reason: AbortReason,
    },
    LaunchFailed {
        record: DispatchRecord,
        error: LaunchError,
    },
    Cancelled {
        record: DispatchRecord,
    },
}

impl JobOutcome {
    pub fn run_id(&self) -> RunId {
        self.record().run_id
    }

    pub fn record(&self) -> &DispatchRecord {
        match self {
            JobOutcome::Fired { record, .. }
            | JobOutcome::Aborted { record, .. }
            | JobOutcome::LaunchFailed { record, .. }
            | JobOutcome::Cancelled { record } => record,
        }
    }

    pub fn is_fired(&self) -> bool {
        matches!(self, JobOutcome::Fired { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, JobOutcome::Aborted { .. })
    }
}

/// Run one job to completion.
pub async fn run_job(ctx: Arc<JobContext>, spec: JobSpec, cancel: CancellationToken) -> JobOutcome {
    let JobSpec {
        record,
        mut attempt,
        planned_duration,
        hold: _hold,
    } = spec;
    let mut duration = planned_duration;

    loop {
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled { record };
        }

        if let Some(kind) = attempt.kind() {
            duration = current_duration(&ctx, &record, kind).await.unwrap_or(duration);
        }
        let now = ctx.clock.now_ms();

        match attempt.poll(&ctx.timing, now, duration).clone() {
            AttemptState::Waiting => {}
            AttemptState::Fired { at, finish } => {
                debug!(
                    run_id = %record.run_id,
                    kind = %record.kind,
                    at,
                    finish,
                    "Job firing"
                );
                return match ctx.launcher.launch(&record).await {
                    Ok(handle) => JobOutcome::Fired { record, handle, at },
                    Err(error) => {
                        warn!(
                            run_id = %record.run_id,
                            worker_id = %record.worker,
                            error = %error,
                            reason = error.reason_code(),
                            "Job launch failed"
                        );
                        JobOutcome::LaunchFailed { record, error }
                    }
                };
            }
            AttemptState::Aborted(reason) => {
                info!(
                    run_id = %record.run_id,
                    kind = %record.kind,
                    target_id = %record.target,
                    reason = ?reason,
                    "Job aborted"
                );
                return JobOutcome::Aborted { record, reason };
            }
        }

        let wait = next_wait(&ctx, attempt.target_finish(), duration, now);
        tokio::select! {
            _ = cancel.cancelled() => {
                return JobOutcome::Cancelled { record };
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn current_duration(ctx: &JobContext, record: &DispatchRecord, kind: OperationKind) -> Option<Millis> {
    match ctx.source.target(&record.target).await {
        Ok(target) => Some(ctx.timing.raster().raster(target.durations().get(kind))),
        Err(e) => {
            debug!(
                run_id = %record.run_id,
                error = %e,
                "Duration refresh failed, keeping last value"
            );
            None
        }
    }
}

/// Sleep straight to one poll before the expected fire instant, else poll.
fn next_wait(ctx: &JobContext, target_finish: Option<Millis>, duration: Millis, now: Millis) -> Duration {
    let poll_ms = ctx.poll_interval.as_millis() as Millis;
    let lead = target_finish.map_or(0, |finish| finish.saturating_sub(duration).saturating_sub(now));
    if lead > 2 * poll_ms {
        Duration::from_millis(lead - poll_ms)
    } else {
        ctx.poll_interval
    }
}
