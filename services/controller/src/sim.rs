//! In-memory simulated world.
//!
//! Stands in for the remote environment in development and tests. It is both
//! the [`StateSource`] and the [`Launcher`]:
//!
//! - A launch commits worker capacity and schedules the operation's effect at
//!   `now + duration`, with the duration taken from the target's pressure at
//!   launch time
//! - Every read first lands all effects whose finish time has passed, in
//!   finish order, and releases their capacity
//!
//! Effects are applied with the same [`GameModel`] the planner uses.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siphon_batch::analyzer::PRESSURE_CEILING;
use siphon_batch::{
    Analyzer, GameModel, Millis, OperationKind, TargetSnapshot, UnitCosts, WorkerPool, WorkerSnapshot,
};
use siphon_id::{RunId, TargetId, WorkerId};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{ControllerError, ControllerResult};
use crate::launcher::{DispatchRecord, LaunchError, LaunchHandle, Launcher};
use crate::source::StateSource;

/// Capacity comparisons tolerate this much float dust.
const CAPACITY_EPSILON: f64 = 1e-9;

/// One simulated target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimTarget {
    pub value: f64,
    pub max_value: f64,
    pub pressure: f64,
    pub pressure_floor: f64,
}

#[derive(Debug, Clone)]
struct SimWorker {
    total: f64,
    committed: f64,
    cores: u32,
}

#[derive(Debug, Clone)]
struct Pending {
    finish_at: Millis,
    run_id: RunId,
    kind: OperationKind,
    target: TargetId,
    worker: WorkerId,
    units: u64,
    cost: f64,
    cores: u32,
}

/// An effect that has landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landed {
    pub at: Millis,
    pub run_id: RunId,
    pub kind: OperationKind,
    pub target: TargetId,
    pub units: u64,
    /// Value removed, for extract.
    pub taken: f64,
}

#[derive(Debug, Default)]
struct World {
    targets: BTreeMap<TargetId, SimTarget>,
    workers: BTreeMap<WorkerId, SimWorker>,
    pending: Vec<Pending>,
    landed: Vec<Landed>,
}

/// Simulated remote environment.
pub struct SimWorld {
    model: GameModel,
    costs: UnitCosts,
    clock: Arc<dyn Clock>,
    world: Mutex<World>,
}

impl SimWorld {
    pub fn new(model: GameModel, costs: UnitCosts, clock: Arc<dyn Clock>) -> Self {
        Self {
            model,
            costs,
            clock,
            world: Mutex::new(World::default()),
        }
    }

    /// Add or replace a target.
    pub fn add_target(&self, id: TargetId, target: SimTarget) {
        self.world().targets.insert(id, target);
    }

    /// Add or replace an idle worker.
    pub fn add_worker(&self, id: WorkerId, total: f64, cores: u32) {
        self.world().workers.insert(
            id,
            SimWorker {
                total,
                committed: 0.0,
                cores: cores.max(1),
            },
        );
    }

    /// Current state of a target, after landing due effects.
    pub fn target_state(&self, id: &TargetId) -> Option<SimTarget> {
        self.settled().targets.get(id).cloned()
    }

    /// Every landed effect so far, in landing order.
    pub fn landed(&self) -> Vec<Landed> {
        self.settled().landed.clone()
    }

    /// Total value extracted from `id`.
    pub fn extracted(&self, id: &TargetId) -> f64 {
        self.settled()
            .landed
            .iter()
            .filter(|l| &l.target == id)
            .map(|l| l.taken)
            .sum()
    }

    pub fn pending(&self) -> usize {
        self.settled().pending.len()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock and land everything due by now.
    fn settled(&self) -> MutexGuard<'_, World> {
        let now = self.clock.now_ms();
        let mut world = self.world();
        self.land_due(&mut world, now);
        world
    }

    fn land_due(&self, world: &mut World, now: Millis) {
        if world.pending.iter().all(|p| p.finish_at > now) {
            return;
        }
        let (mut due, rest): (Vec<Pending>, Vec<Pending>) =
            std::mem::take(&mut world.pending).into_iter().partition(|p| p.finish_at <= now);
        world.pending = rest;
        due.sort_by_key(|p| (p.finish_at, p.kind.slot(), p.run_id));

        for effect in due {
            if let Some(worker) = world.workers.get_mut(&effect.worker) {
                worker.committed = (worker.committed - effect.units as f64 * effect.cost).max(0.0);
            }
            let Some(target) = world.targets.get_mut(&effect.target) else {
                continue;
            };
            let mut taken = 0.0;
            match effect.kind {
                OperationKind::Extract => {
                    let (left, removed) = self.model.apply_extract(target.value, target.pressure, effect.units);
                    target.value = left;
                    taken = removed;
                    target.pressure =
                        (target.pressure + Analyzer::extract_pressure(&self.model, effect.units)).min(PRESSURE_CEILING);
                }
                OperationKind::Replenish => {
                    target.value = self.model.apply_replenish(
                        target.value,
                        target.max_value,
                        target.pressure,
                        effect.units,
                        effect.cores,
                    );
                    target.pressure = (target.pressure
                        + Analyzer::replenish_pressure(&self.model, effect.units, effect.cores))
                    .min(PRESSURE_CEILING);
                }
                OperationKind::CounterPressure => {
                    target.pressure =
                        self.model
                            .apply_counter(target.pressure, target.pressure_floor, effect.units, effect.cores);
                }
            }
            trace!(
                run_id = %effect.run_id,
                kind = %effect.kind,
                target_id = %effect.target,
                at = effect.finish_at,
                value = target.value,
                pressure = target.pressure,
                "[SIM] Effect landed"
            );
            world.landed.push(Landed {
                at: effect.finish_at,
                run_id: effect.run_id,
                kind: effect.kind,
                target: effect.target,
                units: effect.units,
                taken,
            });
        }
    }

    fn snapshot(&self, id: &TargetId, target: &SimTarget) -> ControllerResult<TargetSnapshot> {
        let durations = self.model.durations_at(target.pressure - target.pressure_floor);
        Ok(TargetSnapshot::new(
            id.clone(),
            target.value,
            target.max_value,
            target.pressure,
            target.pressure_floor,
            durations,
        )?)
    }
}

#[async_trait]
impl StateSource for SimWorld {
    async fn targets(&self) -> ControllerResult<Vec<TargetId>> {
        Ok(self.settled().targets.keys().cloned().collect())
    }

    async fn target(&self, id: &TargetId) -> ControllerResult<TargetSnapshot> {
        let world = self.settled();
        let target = world
            .targets
            .get(id)
            .ok_or_else(|| ControllerError::TargetNotFound(id.clone()))?;
        self.snapshot(id, target)
    }

    async fn workers(&self) -> ControllerResult<WorkerPool> {
        let world = self.settled();
        let workers = world
            .workers
            .iter()
            .map(|(id, w)| WorkerSnapshot::new(id.clone(), w.total, w.committed.min(w.total), w.cores))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WorkerPool::new(workers))
    }
}

#[async_trait]
impl Launcher for SimWorld {
    async fn launch(&self, record: &DispatchRecord) -> Result<LaunchHandle, LaunchError> {
        if record.units == 0 {
            return Ok(LaunchHandle::noop(record));
        }

        let now = self.clock.now_ms();
        let mut world = self.world();
        self.land_due(&mut world, now);

        let duration = {
            let target = world
                .targets
                .get(&record.target)
                .ok_or_else(|| LaunchError::Rejected(format!("unknown target {}", record.target)))?;
            self.model
                .durations_at(target.pressure - target.pressure_floor)
                .get(record.kind)
        };

        let cost = self.costs.get(record.kind);
        let worker = world
            .workers
            .get_mut(&record.worker)
            .ok_or_else(|| LaunchError::WorkerUnavailable(record.worker.clone()))?;
        let required = record.units as f64 * cost;
        let free = worker.total - worker.committed;
        if required > free + CAPACITY_EPSILON {
            return Err(LaunchError::InsufficientCapacity {
                worker: record.worker.clone(),
                required,
                free,
            });
        }
        worker.committed += required;
        let cores = worker.cores;

        debug!(
            run_id = %record.run_id,
            kind = %record.kind,
            target_id = %record.target,
            worker_id = %record.worker,
            units = record.units,
            finish_at = now + duration,
            "[SIM] Job started"
        );
        world.pending.push(Pending {
            finish_at: now + duration,
            run_id: record.run_id,
            kind: record.kind,
            target: record.target.clone(),
            worker: record.worker.clone(),
            units: record.units,
            cost,
            cores,
        });

        Ok(LaunchHandle {
            run_id: record.run_id,
            worker: record.worker.clone(),
            units: record.units,
        })
    }
}
