//! Analyzer functions consumed by the planner.
//!
//! The planner does not know how a target responds to operations; it asks an
//! [`Analyzer`]. Results are taken at face value only after the planner's own
//! guards (see `planner.rs`), so an implementation may legitimately return
//! zero, NaN or infinities for degenerate inputs.
//!
//! [`GameModel`] is the reference model: pressure-scaled yield, logarithmic
//! growth, and a per-core bonus on replenish and counter-pressure.

use serde::{Deserialize, Serialize};

use crate::target::{OperationDurations, TargetSnapshot};
use crate::Millis;

/// Response of a target to each operation.
pub trait Analyzer: Send + Sync {
    /// Fraction of current value one extract unit removes.
    fn extract_yield_per_unit(&self, target: &TargetSnapshot) -> f64;

    /// Replenish units (fractional) needed to multiply value by `factor`.
    fn replenish_units(&self, target: &TargetSnapshot, factor: f64, cores: u32) -> f64;

    /// Pressure added by `units` extract units.
    fn extract_pressure(&self, units: u64) -> f64;

    /// Pressure added by `units` replenish units.
    fn replenish_pressure(&self, units: u64, cores: u32) -> f64;

    /// Pressure removed by one counter-pressure unit.
    fn reduction_per_unit(&self, cores: u32) -> f64;
}

/// Pressure at which a target stops yielding or growing.
pub const PRESSURE_CEILING: f64 = 100.0;

/// Reference target model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameModel {
    /// Yield per extract unit at zero pressure.
    pub base_yield: f64,
    /// Per-unit multiplicative growth at zero pressure.
    pub growth_rate: f64,
    /// Pressure per extract unit.
    pub extract_pressure: f64,
    /// Pressure per replenish unit.
    pub replenish_pressure: f64,
    /// Pressure removed per counter-pressure unit on one core.
    pub reduction: f64,
    /// Extra effectiveness per additional core.
    pub core_bonus: f64,
    /// Extract duration at zero pressure.
    pub base_extract_ms: Millis,
    /// Replenish duration as a multiple of extract duration.
    pub replenish_ratio: f64,
    /// Counter-pressure duration as a multiple of extract duration.
    pub counter_ratio: f64,
    /// Fractional slowdown per point of pressure.
    pub slowdown_per_pressure: f64,
}

impl Default for GameModel {
    fn default() -> Self {
        Self {
            base_yield: 0.002,
            growth_rate: 0.0035,
            extract_pressure: 0.002,
            replenish_pressure: 0.004,
            reduction: 0.05,
            core_bonus: 1.0 / 16.0,
            base_extract_ms: 2_000,
            replenish_ratio: 3.2,
            counter_ratio: 4.0,
            slowdown_per_pressure: 0.02,
        }
    }
}

impl GameModel {
    fn core_multiplier(&self, cores: u32) -> f64 {
        1.0 + f64::from(cores.max(1) - 1) * self.core_bonus
    }

    /// Share of full effectiveness left at `pressure`.
    fn pressure_scale(pressure: f64) -> f64 {
        ((PRESSURE_CEILING - pressure.min(PRESSURE_CEILING)) / PRESSURE_CEILING).max(0.0)
    }

    fn per_unit_growth(&self, pressure: f64, cores: u32) -> f64 {
        (1.0 + self.growth_rate * Self::pressure_scale(pressure)).ln() * self.core_multiplier(cores)
    }

    /// Durations at the given pressure, before rastering.
    pub fn durations_at(&self, pressure: f64) -> OperationDurations {
        let extract = self.base_extract_ms as f64 * (1.0 + pressure * self.slowdown_per_pressure);
        OperationDurations::new(
            extract.round() as Millis,
            (extract * self.replenish_ratio).round() as Millis,
            (extract * self.counter_ratio).round() as Millis,
        )
    }

    /// Value left after `units` extract units land. Returns `(value, taken)`.
    pub fn apply_extract(&self, value: f64, pressure: f64, units: u64) -> (f64, f64) {
        let share = (self.base_yield * Self::pressure_scale(pressure) * units as f64).min(1.0);
        let taken = value * share;
        (value - taken, taken)
    }

    /// Value after `units` replenish units land, capped at `max_value`.
    pub fn apply_replenish(&self, value: f64, max_value: f64, pressure: f64, units: u64, cores: u32) -> f64 {
        let grown = value.max(1.0) * (self.per_unit_growth(pressure, cores) * units as f64).exp();
        grown.min(max_value)
    }

    /// Pressure after `units` counter-pressure units land, floored.
    pub fn apply_counter(&self, pressure: f64, floor: f64, units: u64, cores: u32) -> f64 {
        (pressure - self.reduction_per_unit(cores) * units as f64).max(floor)
    }
}

impl Analyzer for GameModel {
    fn extract_yield_per_unit(&self, target: &TargetSnapshot) -> f64 {
        self.base_yield * Self::pressure_scale(target.pressure())
    }

    fn replenish_units(&self, target: &TargetSnapshot, factor: f64, cores: u32) -> f64 {
        if factor <= 1.0 {
            return 0.0;
        }
        factor.ln() / self.per_unit_growth(target.pressure(), cores)
    }

    fn extract_pressure(&self, units: u64) -> f64 {
        units as f64 * self.extract_pressure
    }

    fn replenish_pressure(&self, units: u64, _cores: u32) -> f64 {
        units as f64 * self.replenish_pressure
    }

    fn reduction_per_unit(&self, cores: u32) -> f64 {
        self.reduction * self.core_multiplier(cores)
    }
}
