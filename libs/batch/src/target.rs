//! Target state model.

use serde::{Deserialize, Serialize};
use siphon_id::TargetId;

use crate::error::{ensure_magnitude, SnapshotError};
use crate::ops::OperationKind;
use crate::raster::Raster;
use crate::Millis;

/// Default value-ratio threshold for the farming-ready predicate.
pub const DEFAULT_MIN_VALUE_RATIO: f64 = 0.9;

/// Default pressure-delta threshold for the farming-ready predicate.
pub const DEFAULT_MAX_PRESSURE_DELTA: f64 = 5.0;

/// Time each operation takes to complete at the target's current conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDurations {
    pub extract: Millis,
    pub replenish: Millis,
    pub counter: Millis,
}

impl OperationDurations {
    pub fn new(extract: Millis, replenish: Millis, counter: Millis) -> Self {
        Self {
            extract,
            replenish,
            counter,
        }
    }

    pub fn get(&self, kind: OperationKind) -> Millis {
        match kind {
            OperationKind::Extract => self.extract,
            OperationKind::Replenish => self.replenish,
            OperationKind::CounterPressure => self.counter,
        }
    }

    pub fn longest(&self) -> Millis {
        self.extract.max(self.replenish).max(self.counter)
    }

    /// Each duration rounded up onto the raster.
    pub fn rastered(&self, raster: &Raster) -> Self {
        Self {
            extract: raster.raster(self.extract),
            replenish: raster.raster(self.replenish),
            counter: raster.raster(self.counter),
        }
    }
}

/// Thresholds for the farming-ready predicate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Value ratio must be strictly above this.
    pub min_value_ratio: f64,
    /// Pressure delta must be strictly below this.
    pub max_pressure_delta: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_value_ratio: DEFAULT_MIN_VALUE_RATIO,
            max_pressure_delta: DEFAULT_MAX_PRESSURE_DELTA,
        }
    }
}

/// Point-in-time view of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    id: TargetId,
    value: f64,
    max_value: f64,
    pressure: f64,
    pressure_floor: f64,
    durations: OperationDurations,
}

impl TargetSnapshot {
    /// Builds a snapshot, enforcing `floor <= pressure` and `0 <= value <= max`.
    pub fn new(
        id: TargetId,
        value: f64,
        max_value: f64,
        pressure: f64,
        pressure_floor: f64,
        durations: OperationDurations,
    ) -> Result<Self, SnapshotError> {
        let value = ensure_magnitude("value", value)?;
        let max_value = ensure_magnitude("max_value", max_value)?;
        let pressure = ensure_magnitude("pressure", pressure)?;
        let pressure_floor = ensure_magnitude("pressure_floor", pressure_floor)?;

        if value > max_value {
            return Err(SnapshotError::ValueOutOfRange {
                value,
                max: max_value,
            });
        }
        if pressure < pressure_floor {
            return Err(SnapshotError::PressureBelowFloor {
                pressure,
                floor: pressure_floor,
            });
        }

        Ok(Self {
            id,
            value,
            max_value,
            pressure,
            pressure_floor,
            durations,
        })
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn pressure_floor(&self) -> f64 {
        self.pressure_floor
    }

    pub fn durations(&self) -> &OperationDurations {
        &self.durations
    }

    /// `pressure - floor`; never negative.
    pub fn pressure_delta(&self) -> f64 {
        self.pressure - self.pressure_floor
    }

    /// `value / max`; zero for a target with no capacity for value.
    pub fn value_ratio(&self) -> f64 {
        if self.max_value > 0.0 {
            self.value / self.max_value
        } else {
            0.0
        }
    }

    /// Both conditions must hold: value high enough AND pressure low enough.
    pub fn is_farming_ready(&self, thresholds: &Thresholds) -> bool {
        self.value_ratio() > thresholds.min_value_ratio
            && self.pressure_delta() < thresholds.max_pressure_delta
    }

    /// Fully restored, within `epsilon` on both axes.
    pub fn is_prepared(&self, epsilon: f64) -> bool {
        self.value_ratio() >= 1.0 - epsilon && self.pressure_delta() <= epsilon
    }
}
