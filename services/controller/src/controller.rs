//! Multi-target controller.
//!
//! Ranks the discovered targets, picks the best `max_targets`, and runs one
//! [`ControlLoop`] per pick. All loops share the coordination store, the
//! reservation ledger and the run ID generator.

use siphon_batch::{rank_targets, TargetSnapshot};
use siphon_id::TargetId;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::control_loop::{ControlLoop, LoopSummary, Services};
use crate::error::{ControllerError, ControllerResult};

/// Runs control loops for the best targets.
pub struct Controller {
    config: ControllerConfig,
    services: Services,
}

impl Controller {
    pub fn new(config: ControllerConfig, services: Services) -> ControllerResult<Self> {
        config.validate()?;
        Ok(Self { config, services })
    }

    /// The targets worth farming, best first.
    pub async fn select_targets(&self) -> ControllerResult<Vec<TargetId>> {
        let ids = self.services.source.targets().await?;

        let mut snapshots: Vec<TargetSnapshot> = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.services.source.target(id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(target_id = %id, error = %e, "Skipping unreadable target"),
            }
        }

        let ranked = rank_targets(&snapshots, self.services.analyzer.as_ref());
        Ok(ranked
            .into_iter()
            .take(self.config.max_targets)
            .map(|t| t.id().clone())
            .collect())
    }

    /// Run until shutdown, or until every loop reaches `max_cycles`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> ControllerResult<Vec<(TargetId, LoopSummary)>> {
        let targets = self.select_targets().await?;
        if targets.is_empty() {
            return Err(ControllerError::SourceUnavailable("no farmable targets".to_string()));
        }
        info!(
            targets = ?targets.iter().map(TargetId::as_str).collect::<Vec<_>>(),
            "Starting control loops"
        );

        let mut loops = JoinSet::new();
        for target in targets {
            let control_loop = ControlLoop::new(target.clone(), &self.config, self.services.clone())?;
            let shutdown = shutdown.clone();
            loops.spawn(async move { (target, control_loop.run(shutdown).await) });
        }

        let mut summaries = Vec::new();
        while let Some(result) = loops.join_next().await {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(error = %e, "Control loop task panicked"),
            }
        }
        summaries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(summaries)
    }
}
