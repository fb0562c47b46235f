//! siphon controller binary.
//!
//! Runs the controller against the in-memory simulated world. A deployment
//! against a real environment swaps the [`SimWorld`] for its own
//! `StateSource` and `Launcher`.

use std::sync::Arc;

use anyhow::Result;
use siphon_batch::GameModel;
use siphon_controller::{
    Clock, Controller, ControllerConfig, CoordinationStore, MonotonicClock, ReservationLedger, Services, SimTarget,
    SimWorld, TracingSink,
};
use siphon_id::{RunIdGenerator, TargetId, WorkerId};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        max_targets = config.max_targets,
        slot_ms = config.timing.slot_ms,
        slots = config.timing.slots,
        tick_ms = config.timing.tick_ms,
        max_cycles = ?config.control_loop.max_cycles,
        "Starting siphon controller"
    );

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
    let model = GameModel::default();
    let sim = Arc::new(SimWorld::new(model, config.planner.costs, Arc::clone(&clock)));
    seed_world(&sim)?;

    let services = Services {
        source: sim.clone(),
        launcher: sim.clone(),
        clock,
        analyzer: Arc::new(model),
        sink: Arc::new(TracingSink),
        coordination: Arc::new(CoordinationStore::new()),
        reservations: Arc::new(ReservationLedger::new()),
        run_ids: Arc::new(RunIdGenerator::new()),
    };
    let controller = Controller::new(config, services)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(async move { controller.run(shutdown_rx).await });

    let result = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await?
        }
    };

    match result {
        Ok(summaries) => {
            for (target, summary) in summaries {
                info!(
                    target_id = %target,
                    cycles = summary.cycles,
                    dispatched = summary.dispatched,
                    skipped = summary.skipped,
                    jobs_fired = summary.jobs.fired,
                    extracted = sim.extracted(&target),
                    "Target summary"
                );
            }
        }
        Err(e) => error!(error = %e, reason = e.reason_code(), "Controller failed"),
    }

    info!("siphon controller stopped");
    Ok(())
}

/// A small world to farm: a few targets and a home worker.
fn seed_world(sim: &SimWorld) -> Result<()> {
    for (name, max_value, pressure, floor) in [
        ("n00dles", 70_000.0, 1.0, 1.0),
        ("joesguns", 2_500_000.0, 15.0, 5.0),
        ("phantasy", 24_000_000.0, 20.0, 8.0),
    ] {
        sim.add_target(
            TargetId::parse(name)?,
            SimTarget {
                value: max_value * 0.4,
                max_value,
                pressure,
                pressure_floor: floor,
            },
        );
    }
    sim.add_worker(WorkerId::parse("home")?, 2_048.0, 4);
    sim.add_worker(WorkerId::parse("pserv-0")?, 1_024.0, 1);
    Ok(())
}
