//! Timing scheduler.
//!
//! A period `P = k * T` is split into slots of width `T`. Every operation kind
//! owns one slot offset and must *finish* on it:
//!
//! ```text
//! offset:  0                 T                 2T                (3T)
//!          counter-pressure  replenish         extract           control cycle
//! ```
//!
//! Pressure is cleared first, value restored next, value taken last; each step
//! assumes the previous one has already landed. Ordering between the three
//! jobs of a batch is not enforced by any barrier, only by each job firing at
//! the instant its predicted finish hits its own offset.
//!
//! A job never fires late. If its predicted finish has moved past its target
//! finish (plus the jitter slack), it aborts with `TimeMiss` and the next
//! control-loop cycle replans from scratch.

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::ops::OperationKind;
use crate::raster::Raster;
use crate::target::OperationDurations;
use crate::Millis;

/// Default slot width `T`.
pub const DEFAULT_SLOT_MS: Millis = 400;

/// Default number of slots per period.
pub const DEFAULT_SLOTS: u64 = 3;

/// Period layout and tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingPlan {
    raster: Raster,
    slot: Millis,
    slots: u64,
    slack: Millis,
}

impl TimingPlan {
    /// Builds a plan.
    ///
    /// `slot` must be a non-zero multiple of the tick, `slots` is 3 (or 4 when
    /// a slot is reserved for the control cycle), and `slack` must stay below
    /// `slot` so a late job can never bleed into its neighbour's slot.
    pub fn new(raster: Raster, slot: Millis, slots: u64, slack: Millis) -> Result<Self, SchedulerError> {
        if slot == 0 || !raster.is_aligned(slot) {
            return Err(SchedulerError::InvalidConfig(format!(
                "slot width {slot}ms must be a non-zero multiple of the {}ms tick",
                raster.tick()
            )));
        }
        if !(3..=4).contains(&slots) {
            return Err(SchedulerError::InvalidConfig(format!(
                "period must have 3 or 4 slots, got {slots}"
            )));
        }
        if slack >= slot {
            return Err(SchedulerError::InvalidConfig(format!(
                "slack {slack}ms must be smaller than the {slot}ms slot"
            )));
        }
        Ok(Self {
            raster,
            slot,
            slots,
            slack,
        })
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn slot(&self) -> Millis {
        self.slot
    }

    pub fn slack(&self) -> Millis {
        self.slack
    }

    /// `P = slots * T`.
    pub fn period(&self) -> Millis {
        self.slot * self.slots
    }

    /// Finish offset of `kind` within the period.
    pub fn offset(&self, kind: OperationKind) -> Millis {
        kind.slot() * self.slot
    }

    /// Offset reserved for the control cycle, if the period has four slots.
    pub fn control_offset(&self) -> Option<Millis> {
        (self.slots == 4).then_some(3 * self.slot)
    }

    /// `raster(now + duration)`.
    pub fn predicted_finish(&self, now: Millis, duration: Millis) -> Millis {
        self.raster.raster(now.saturating_add(duration))
    }

    /// How far past `kind`'s offset `finish` lies, modulo the period.
    pub fn phase_error(&self, finish: Millis, kind: OperationKind) -> Millis {
        let period = self.period();
        (finish % period + period - self.offset(kind)) % period
    }

    /// On the offset, or at most `slack` after it.
    pub fn is_aligned(&self, finish: Millis, kind: OperationKind) -> bool {
        self.phase_error(finish, kind) <= self.slack
    }

    /// First instant at or after `t` congruent to `offset` modulo the period.
    pub fn next_at_offset(&self, t: Millis, offset: Millis) -> Millis {
        let period = self.period();
        let base = t - t % period + offset % period;
        if base >= t {
            base
        } else {
            base + period
        }
    }

    /// Finish times for a batch planned at `now`.
    ///
    /// Counter-pressure lands on the earliest period boundary such that every
    /// job can still start no earlier than `max(now, min_start)`. Replenish and
    /// extract follow at `+T` and `+2T`.
    pub fn schedule(&self, now: Millis, durations: &OperationDurations, min_start: Millis) -> FinishTimes {
        let start = now.max(min_start);
        let earliest = OperationKind::ALL
            .iter()
            .map(|&k| (start + durations.get(k)).saturating_sub(self.offset(k)))
            .max()
            .unwrap_or(start);
        let counter = self.next_at_offset(self.raster.raster(earliest), 0);
        FinishTimes {
            counter,
            replenish: counter + self.slot,
            extract: counter + 2 * self.slot,
        }
    }
}

impl Default for TimingPlan {
    fn default() -> Self {
        Self {
            raster: Raster::default(),
            slot: DEFAULT_SLOT_MS,
            slots: DEFAULT_SLOTS,
            slack: Raster::default().tick(),
        }
    }
}

/// Absolute finish time for each operation of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishTimes {
    pub counter: Millis,
    pub replenish: Millis,
    pub extract: Millis,
}

impl FinishTimes {
    pub fn get(&self, kind: OperationKind) -> Millis {
        match kind {
            OperationKind::CounterPressure => self.counter,
            OperationKind::Replenish => self.replenish,
            OperationKind::Extract => self.extract,
        }
    }

    pub fn latest(&self) -> Millis {
        self.counter.max(self.replenish).max(self.extract)
    }
}

/// Why an attempt ended without firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    TimeMiss { finish: Millis, target: Millis },
    WrongType { kind: String },
}

impl From<&AbortReason> for SchedulerError {
    fn from(reason: &AbortReason) -> Self {
        match reason {
            AbortReason::TimeMiss { finish, target } => SchedulerError::TimeMiss {
                finish: *finish,
                target: *target,
            },
            AbortReason::WrongType { kind } => SchedulerError::WrongType(kind.clone()),
        }
    }
}

/// Lifecycle of one job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptState {
    Waiting,
    Fired { at: Millis, finish: Millis },
    Aborted(AbortReason),
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptState::Waiting)
    }
}

/// `Waiting -> Fired | Aborted(TimeMiss) | Aborted(WrongType)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAttempt {
    kind: Option<OperationKind>,
    target_finish: Option<Millis>,
    min_start: Millis,
    state: AttemptState,
}

impl JobAttempt {
    /// Starts an attempt from a raw kind name; unknown names abort at once.
    pub fn new(kind: &str, target_finish: Option<Millis>, min_start: Millis) -> Self {
        match kind.parse::<OperationKind>() {
            Ok(kind) => Self::for_kind(kind, target_finish, min_start),
            Err(_) => Self {
                kind: None,
                target_finish,
                min_start,
                state: AttemptState::Aborted(AbortReason::WrongType {
                    kind: kind.to_string(),
                }),
            },
        }
    }

    pub fn for_kind(kind: OperationKind, target_finish: Option<Millis>, min_start: Millis) -> Self {
        Self {
            kind: Some(kind),
            target_finish,
            min_start,
            state: AttemptState::Waiting,
        }
    }

    pub fn kind(&self) -> Option<OperationKind> {
        self.kind
    }

    pub fn target_finish(&self) -> Option<Millis> {
        self.target_finish
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    /// Re-evaluate at `now` given the operation's current `duration`.
    pub fn poll(&mut self, plan: &TimingPlan, now: Millis, duration: Millis) -> &AttemptState {
        let Some(kind) = self.kind else {
            return &self.state;
        };
        if self.state.is_terminal() {
            return &self.state;
        }

        let finish = plan.predicted_finish(now, duration);
        if let Some(target) = self.target_finish {
            if finish > target.saturating_add(plan.slack()) {
                self.state = AttemptState::Aborted(AbortReason::TimeMiss { finish, target });
                return &self.state;
            }
        }
        if now < self.min_start {
            return &self.state;
        }

        let reached_target = self.target_finish.map_or(true, |target| finish >= target);
        if reached_target && plan.is_aligned(finish, kind) {
            self.state = AttemptState::Fired { at: now, finish };
        }
        &self.state
    }
}
