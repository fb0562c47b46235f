//! Read-only snapshot source.

use async_trait::async_trait;
use siphon_batch::{TargetSnapshot, WorkerPool};
use siphon_id::TargetId;

use crate::error::ControllerResult;

/// Where cycle snapshots come from.
///
/// Every call returns fresh values; nothing is cached between cycles.
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Candidate targets known right now.
    async fn targets(&self) -> ControllerResult<Vec<TargetId>>;

    /// Current state of one target.
    async fn target(&self, id: &TargetId) -> ControllerResult<TargetSnapshot>;

    /// Current state of every worker.
    async fn workers(&self) -> ControllerResult<WorkerPool>;
}
