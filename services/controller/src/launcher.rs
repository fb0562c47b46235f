//! Job launch interface and mock implementation.
//!
//! The launcher is the boundary to the remote execution environment:
//! - Starting a number of units of one operation on one worker
//! - Nothing else; the controller never stops or inspects a launched job
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siphon_batch::{Millis, OperationKind};
use siphon_id::{CycleId, RunId, TargetId, WorkerId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One job handed to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub run_id: RunId,
    pub cycle_id: CycleId,
    pub kind: OperationKind,
    pub target: TargetId,
    pub worker: WorkerId,
    pub units: u64,
    /// Absolute finish time the job was timed against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish: Option<Millis>,
}

/// Handle to a launched job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchHandle {
    pub run_id: RunId,
    pub worker: WorkerId,
    /// Units actually started; zero for a no-op launch.
    pub units: u64,
}

impl LaunchHandle {
    /// Handle for a record that started nothing.
    pub fn noop(record: &DispatchRecord) -> Self {
        Self {
            run_id: record.run_id,
            worker: record.worker.clone(),
            units: 0,
        }
    }
}

/// Launch failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LaunchError {
    /// Worker unknown or unreachable.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(WorkerId),

    /// Worker no longer has room for the job.
    #[error("worker {worker} has {free:.2} free, job needs {required:.2}")]
    InsufficientCapacity {
        worker: WorkerId,
        required: f64,
        free: f64,
    },

    /// Launch refused for another reason.
    #[error("launch rejected: {0}")]
    Rejected(String),
}

impl LaunchError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LaunchError::WorkerUnavailable(_) => "worker_unavailable",
            LaunchError::InsufficientCapacity { .. } => "worker_capacity",
            LaunchError::Rejected(_) => "launch_rejected",
        }
    }
}

/// Job launch interface.
///
/// A record with zero units must be a no-op that still returns a handle.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, record: &DispatchRecord) -> Result<LaunchHandle, LaunchError>;
}

/// Mock launcher for testing and development.
pub struct MockLauncher {
    /// Count of launches, including no-ops.
    calls: AtomicU64,

    /// Records that started at least one unit.
    launched: Mutex<Vec<DispatchRecord>>,

    /// Whether launches should "fail".
    fail_launches: bool,
}

impl MockLauncher {
    /// Create a new mock launcher.
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            launched: Mutex::new(Vec::new()),
            fail_launches: false,
        }
    }

    /// Create a mock launcher that rejects every launch.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Records launched so far, in launch order.
    pub async fn launched(&self) -> Vec<DispatchRecord> {
        self.launched.lock().await.clone()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, record: &DispatchRecord) -> Result<LaunchHandle, LaunchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if record.units == 0 {
            debug!(run_id = %record.run_id, "[MOCK] Zero-unit launch, nothing to do");
            return Ok(LaunchHandle::noop(record));
        }
        if self.fail_launches {
            return Err(LaunchError::Rejected("mock launcher configured to fail".to_string()));
        }

        info!(
            run_id = %record.run_id,
            kind = %record.kind,
            target_id = %record.target,
            worker_id = %record.worker,
            units = record.units,
            "[MOCK] Launching job"
        );
        self.launched.lock().await.push(record.clone());

        Ok(LaunchHandle {
            run_id: record.run_id,
            worker: record.worker.clone(),
            units: record.units,
        })
    }
}
