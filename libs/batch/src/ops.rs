//! Operation kinds and per-kind counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Default capacity cost of one extract unit.
pub const DEFAULT_EXTRACT_COST: f64 = 1.70;
/// Default capacity cost of one replenish unit.
pub const DEFAULT_REPLENISH_COST: f64 = 1.75;
/// Default capacity cost of one counter-pressure unit.
pub const DEFAULT_COUNTER_COST: f64 = 1.75;

/// The three remote operations a batch is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Reduces pressure without touching value.
    CounterPressure,
    /// Restores value, raising pressure.
    Replenish,
    /// Removes value, raising pressure.
    Extract,
}

impl OperationKind {
    /// All kinds in landing order, which is also allocation priority.
    pub const ALL: [OperationKind; 3] = [
        OperationKind::CounterPressure,
        OperationKind::Replenish,
        OperationKind::Extract,
    ];

    /// Slot index within a period: counter-pressure 0, replenish 1, extract 2.
    pub fn slot(self) -> u64 {
        match self {
            OperationKind::CounterPressure => 0,
            OperationKind::Replenish => 1,
            OperationKind::Extract => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CounterPressure => "counter-pressure",
            OperationKind::Replenish => "replenish",
            OperationKind::Extract => "extract",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter-pressure" => Ok(OperationKind::CounterPressure),
            "replenish" => Ok(OperationKind::Replenish),
            "extract" => Ok(OperationKind::Extract),
            other => Err(SchedulerError::WrongType(other.to_string())),
        }
    }
}

/// Concurrency-unit counts, one per operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub extract: u64,
    pub replenish: u64,
    pub counter: u64,
}

impl UnitCounts {
    pub const ZERO: UnitCounts = UnitCounts {
        extract: 0,
        replenish: 0,
        counter: 0,
    };

    pub fn new(extract: u64, replenish: u64, counter: u64) -> Self {
        Self {
            extract,
            replenish,
            counter,
        }
    }

    pub fn get(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::Extract => self.extract,
            OperationKind::Replenish => self.replenish,
            OperationKind::CounterPressure => self.counter,
        }
    }

    pub fn get_mut(&mut self, kind: OperationKind) -> &mut u64 {
        match kind {
            OperationKind::Extract => &mut self.extract,
            OperationKind::Replenish => &mut self.replenish,
            OperationKind::CounterPressure => &mut self.counter,
        }
    }

    /// Sum of the three counts, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.extract.saturating_add(self.replenish).saturating_add(self.counter)
    }

    pub fn is_empty(&self) -> bool {
        self.extract == 0 && self.replenish == 0 && self.counter == 0
    }

    /// Capacity needed to run every unit.
    pub fn cost(&self, costs: &UnitCosts) -> f64 {
        OperationKind::ALL
            .iter()
            .map(|&k| self.get(k) as f64 * costs.get(k))
            .sum()
    }

    /// Per-kind `self - other`, floored at zero.
    pub fn saturating_sub(&self, other: &UnitCounts) -> UnitCounts {
        UnitCounts {
            extract: self.extract.saturating_sub(other.extract),
            replenish: self.replenish.saturating_sub(other.replenish),
            counter: self.counter.saturating_sub(other.counter),
        }
    }
}

impl fmt::Display for UnitCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "counter={} replenish={} extract={}",
            self.counter, self.replenish, self.extract
        )
    }
}

/// Capacity consumed by one unit of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitCosts {
    pub extract: f64,
    pub replenish: f64,
    pub counter: f64,
}

impl UnitCosts {
    pub fn get(&self, kind: OperationKind) -> f64 {
        match kind {
            OperationKind::Extract => self.extract,
            OperationKind::Replenish => self.replenish,
            OperationKind::CounterPressure => self.counter,
        }
    }

    /// Costs must be finite and strictly positive.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for kind in OperationKind::ALL {
            let c = self.get(kind);
            if !(c.is_finite() && c > 0.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "unit cost for {kind} must be positive, got {c}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for UnitCosts {
    fn default() -> Self {
        Self {
            extract: DEFAULT_EXTRACT_COST,
            replenish: DEFAULT_REPLENISH_COST,
            counter: DEFAULT_COUNTER_COST,
        }
    }
}
