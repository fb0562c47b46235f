//! Batch planner.
//!
//! Two pure strategies turn a target snapshot (and optionally the worker pool)
//! into ideal unit counts:
//!
//! - **Farming**: the target is near optimal. Extract a fixed fraction of its
//!   value, replenish exactly that fraction, and counter the pressure both add.
//!   Replenish and counter-pressure are inflated by safety margins; the
//!   analyzer functions are nonlinear and under-provisioning leaves the target
//!   oscillating instead of converging.
//! - **Preparation**: the target is far from optimal. Grow value to its
//!   maximum and clear all excess pressure, no extraction, no margins.
//!
//! Degenerate analyzer output never propagates. Each guard substitutes a safe
//! count and records a [`PlanFallback`] on the batch.

use serde::{Deserialize, Serialize};
use siphon_id::TargetId;
use tracing::{debug, warn};

use crate::analyzer::Analyzer;
use crate::error::SchedulerError;
use crate::ops::{UnitCosts, UnitCounts};
use crate::target::{TargetSnapshot, Thresholds};
use crate::timing::FinishTimes;
use crate::worker::{units_in, WorkerPool};

/// Share of current value a farming batch extracts.
pub const DEFAULT_EXTRACT_FRACTION: f64 = 0.5;

/// Safety multiplier on farming replenish units.
pub const DEFAULT_REPLENISH_MARGIN: f64 = 1.2;

/// Safety multiplier on farming counter-pressure units.
pub const DEFAULT_COUNTER_MARGIN: f64 = 1.3;

/// Tolerance for "fully prepared" when releasing the preparation latch.
pub const DEFAULT_PREPARED_EPSILON: f64 = 1e-3;

/// Float dust below this is treated as zero units.
const UNIT_EPSILON: f64 = 1e-9;

/// Largest unit estimate taken at face value; anything above is degenerate.
pub const MAX_PLAN_UNITS: f64 = 1e12;

/// Planner tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub extract_fraction: f64,
    pub replenish_margin: f64,
    pub counter_margin: f64,
    pub thresholds: Thresholds,
    pub prepared_epsilon: f64,
    pub costs: UnitCosts,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            extract_fraction: DEFAULT_EXTRACT_FRACTION,
            replenish_margin: DEFAULT_REPLENISH_MARGIN,
            counter_margin: DEFAULT_COUNTER_MARGIN,
            thresholds: Thresholds::default(),
            prepared_epsilon: DEFAULT_PREPARED_EPSILON,
            costs: UnitCosts::default(),
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(self.extract_fraction > 0.0 && self.extract_fraction < 1.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "extract fraction must be in (0, 1), got {}",
                self.extract_fraction
            )));
        }
        for (name, margin) in [
            ("replenish", self.replenish_margin),
            ("counter-pressure", self.counter_margin),
        ] {
            if !(margin.is_finite() && margin >= 1.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} margin must be >= 1.0, got {margin}"
                )));
            }
        }
        if !(self.thresholds.min_value_ratio.is_finite() && self.thresholds.max_pressure_delta.is_finite()) {
            return Err(SchedulerError::InvalidConfig(
                "farming thresholds must be finite".to_string(),
            ));
        }
        if !(self.prepared_epsilon.is_finite() && self.prepared_epsilon >= 0.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "prepared epsilon must be non-negative, got {}",
                self.prepared_epsilon
            )));
        }
        self.costs.validate()
    }
}

/// Which planner ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Farming,
    Preparation,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Farming => f.write_str("farming"),
            Strategy::Preparation => f.write_str("preparation"),
        }
    }
}

/// A recovered `UndefinedYield` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanFallback {
    /// Yield per unit unusable; extraction dropped to zero.
    ExtractYield { yield_per_unit: f64 },
    /// Growth estimate unusable; replenish (and extraction) dropped to zero.
    ReplenishGrowth { factor: f64 },
    /// Reduction per unit unusable; counter-pressure dropped to zero.
    CounterReduction { reduction_per_unit: f64 },
    /// Target holds no value; growth computed from a value of one.
    EmptyTarget,
}

impl PlanFallback {
    fn to_error(&self) -> SchedulerError {
        SchedulerError::UndefinedYield(match self {
            PlanFallback::ExtractYield { yield_per_unit } => {
                format!("extract yield per unit {yield_per_unit}")
            }
            PlanFallback::ReplenishGrowth { factor } => format!("growth for factor {factor}"),
            PlanFallback::CounterReduction { reduction_per_unit } => {
                format!("reduction per unit {reduction_per_unit}")
            }
            PlanFallback::EmptyTarget => "target has no value".to_string(),
        })
    }
}

/// One planning cycle's ideal counts for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub target: TargetId,
    pub strategy: Strategy,
    pub counts: UnitCounts,
    pub finish: Option<FinishTimes>,
    pub fallbacks: Vec<PlanFallback>,
}

impl Batch {
    pub fn total_units(&self) -> u64 {
        self.counts.total()
    }

    pub fn capacity_cost(&self, costs: &UnitCosts) -> f64 {
        self.counts.cost(costs)
    }

    #[must_use]
    pub fn with_finish(mut self, finish: FinishTimes) -> Self {
        self.finish = Some(finish);
        self
    }
}

/// Persisted "this target is being prepared" flag.
///
/// Once a target drops into preparation it stays there until fully restored,
/// rather than flapping back to farming the moment it crosses the
/// farming-ready thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyLatch {
    preparing: bool,
}

impl StrategyLatch {
    pub fn is_preparing(&self) -> bool {
        self.preparing
    }

    pub fn select(&mut self, target: &TargetSnapshot, config: &PlannerConfig) -> Strategy {
        if self.preparing {
            if target.is_prepared(config.prepared_epsilon) {
                self.preparing = false;
                return Strategy::Farming;
            }
            return Strategy::Preparation;
        }
        if target.is_farming_ready(&config.thresholds) {
            Strategy::Farming
        } else {
            self.preparing = true;
            Strategy::Preparation
        }
    }
}

/// Select a strategy through the latch and run it.
pub fn plan(
    target: &TargetSnapshot,
    pool: Option<&WorkerPool>,
    analyzer: &dyn Analyzer,
    config: &PlannerConfig,
    latch: &mut StrategyLatch,
) -> Batch {
    match latch.select(target, config) {
        Strategy::Farming => plan_farming(target, pool, analyzer, config),
        Strategy::Preparation => plan_preparation(target, pool, analyzer, config),
    }
}

/// Farming strategy.
pub fn plan_farming(
    target: &TargetSnapshot,
    pool: Option<&WorkerPool>,
    analyzer: &dyn Analyzer,
    config: &PlannerConfig,
) -> Batch {
    let cores = pool.map_or(1, WorkerPool::min_cores);
    let mut fallbacks = Vec::new();

    let y = analyzer.extract_yield_per_unit(target);
    let mut extract = if y.is_finite() && y > 0.0 && config.extract_fraction / y <= MAX_PLAN_UNITS {
        ((config.extract_fraction / y).floor() as u64).max(1)
    } else {
        0
    };
    if extract == 0 || extract as f64 * y >= 1.0 {
        fallbacks.push(PlanFallback::ExtractYield { yield_per_unit: y });
        extract = 0;
    }

    let factor = if extract > 0 {
        1.0 / (1.0 - extract as f64 * y)
    } else {
        1.0
    };

    let raw_replenish = analyzer.replenish_units(target, factor, cores) * config.replenish_margin;
    let replenish = match guard_units(raw_replenish) {
        Some(units) => units,
        None => {
            fallbacks.push(PlanFallback::ReplenishGrowth { factor });
            extract = 0;
            0
        }
    };

    let pressure = analyzer.extract_pressure(extract) + analyzer.replenish_pressure(replenish, cores);
    let counter = counter_units(
        pressure,
        analyzer.reduction_per_unit(cores),
        config.counter_margin,
        &mut fallbacks,
    );

    finish_batch(target, Strategy::Farming, UnitCounts::new(extract, replenish, counter), fallbacks)
}

/// Preparation strategy.
///
/// With a pool, the counts are clamped to its total free capacity:
/// counter-pressure first, replenish gets whatever is left.
pub fn plan_preparation(
    target: &TargetSnapshot,
    pool: Option<&WorkerPool>,
    analyzer: &dyn Analyzer,
    config: &PlannerConfig,
) -> Batch {
    let cores = pool.map_or(1, WorkerPool::min_cores);
    let mut fallbacks = Vec::new();

    let current = if target.value() > 0.0 {
        target.value()
    } else {
        fallbacks.push(PlanFallback::EmptyTarget);
        1.0
    };
    let factor = target.max_value() / current;

    let mut replenish = match guard_units(analyzer.replenish_units(target, factor, cores)) {
        Some(units) => units,
        None => {
            fallbacks.push(PlanFallback::ReplenishGrowth { factor });
            0
        }
    };

    let pressure = target.pressure_delta() + analyzer.replenish_pressure(replenish, cores);
    let mut counter = counter_units(pressure, analyzer.reduction_per_unit(cores), 1.0, &mut fallbacks);

    if let Some(pool) = pool {
        let ceiling = pool.total_free();
        let costs = &config.costs;
        counter = counter.min(units_in(ceiling, costs.counter));
        let remaining = ceiling - counter as f64 * costs.counter;
        replenish = replenish.min(units_in(remaining, costs.replenish));
    }

    finish_batch(target, Strategy::Preparation, UnitCounts::new(0, replenish, counter), fallbacks)
}

fn counter_units(
    pressure: f64,
    reduction: f64,
    margin: f64,
    fallbacks: &mut Vec<PlanFallback>,
) -> u64 {
    if pressure <= UNIT_EPSILON {
        return 0;
    }
    let units = (reduction.is_finite() && reduction > 0.0)
        .then(|| guard_units(pressure / reduction * margin))
        .flatten();
    units.unwrap_or_else(|| {
        fallbacks.push(PlanFallback::CounterReduction {
            reduction_per_unit: reduction,
        });
        0
    })
}

fn finish_batch(
    target: &TargetSnapshot,
    strategy: Strategy,
    counts: UnitCounts,
    fallbacks: Vec<PlanFallback>,
) -> Batch {
    for fallback in &fallbacks {
        warn!(
            target_id = %target.id(),
            %strategy,
            error = %fallback.to_error(),
            "Planner substituted a fallback"
        );
    }
    debug!(
        target_id = %target.id(),
        %strategy,
        value_ratio = target.value_ratio(),
        pressure_delta = target.pressure_delta(),
        extract = counts.extract,
        replenish = counts.replenish,
        counter = counts.counter,
        "Planned batch"
    );
    Batch {
        target: target.id().clone(),
        strategy,
        counts,
        finish: None,
        fallbacks,
    }
}

/// Round up estimates that are finite, non-negative and at most
/// [`MAX_PLAN_UNITS`]; reject the rest.
fn guard_units(raw: f64) -> Option<u64> {
    (0.0..=MAX_PLAN_UNITS).contains(&raw).then(|| ceil_units(raw))
}

/// Round up, ignoring float dust on either side of an integer.
fn ceil_units(raw: f64) -> u64 {
    if raw <= UNIT_EPSILON {
        0
    } else {
        (raw - UNIT_EPSILON).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{allocate, AllocationPolicy};
    use crate::analyzer::GameModel;
    use crate::target::OperationDurations;
    use crate::worker::WorkerSnapshot;
    use siphon_id::WorkerId;

    fn target(value: f64, max: f64, pressure: f64, floor: f64) -> TargetSnapshot {
        TargetSnapshot::new(
            TargetId::parse("sigma-cosmetics").unwrap(),
            value,
            max,
            pressure,
            floor,
            OperationDurations::new(2_000, 6_400, 8_000),
        )
        .unwrap()
    }

    fn pool(free: f64) -> WorkerPool {
        WorkerPool::new(vec![
            WorkerSnapshot::new(WorkerId::parse("home").unwrap(), free, 0.0, 1).unwrap(),
        ])
    }

    /// Analyzer returning fixed, possibly degenerate, numbers.
    struct Fixed {
        y: f64,
        growth: f64,
        reduction: f64,
    }

    impl Analyzer for Fixed {
        fn extract_yield_per_unit(&self, _: &TargetSnapshot) -> f64 {
            self.y
        }
        fn replenish_units(&self, _: &TargetSnapshot, factor: f64, _: u32) -> f64 {
            if factor <= 1.0 {
                0.0
            } else {
                self.growth
            }
        }
        fn extract_pressure(&self, units: u64) -> f64 {
            units as f64 * 0.002
        }
        fn replenish_pressure(&self, units: u64, _: u32) -> f64 {
            units as f64 * 0.004
        }
        fn reduction_per_unit(&self, _: u32) -> f64 {
            self.reduction
        }
    }

    #[test]
    fn test_config_defaults_validate() {
        let config = PlannerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.replenish_margin, 1.2);
        assert_eq!(config.counter_margin, 1.3);
    }

    #[test]
    fn test_config_rejects_sub_unit_margin() {
        let config = PlannerConfig {
            counter_margin: 0.9,
            ..PlannerConfig::default()
        };
        assert!(config.validate().is_err());
        let config = PlannerConfig {
            extract_fraction: 1.0,
            ..PlannerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_farming_formula() {
        let analyzer = Fixed {
            y: 0.01,
            growth: 40.0,
            reduction: 0.05,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.strategy, Strategy::Farming);
        assert_eq!(batch.counts.extract, 50);
        assert_eq!(batch.counts.replenish, 48);
        // (50 * 0.002 + 48 * 0.004) / 0.05 * 1.3 = 7.592
        assert_eq!(batch.counts.counter, 8);
        assert!(batch.fallbacks.is_empty());
    }

    #[test]
    fn test_farming_zero_yield_falls_back() {
        let analyzer = Fixed {
            y: 0.0,
            growth: 40.0,
            reduction: 0.05,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts, UnitCounts::ZERO);
        assert_eq!(batch.fallbacks, vec![PlanFallback::ExtractYield { yield_per_unit: 0.0 }]);
    }

    #[test]
    fn test_farming_whole_value_per_unit_falls_back() {
        let analyzer = Fixed {
            y: 1.5,
            growth: 40.0,
            reduction: 0.05,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts.extract, 0);
        assert_eq!(batch.counts.replenish, 0);
    }

    #[test]
    fn test_farming_nan_growth_drops_extraction() {
        let analyzer = Fixed {
            y: 0.01,
            growth: f64::NAN,
            reduction: 0.05,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts, UnitCounts::ZERO);
        assert!(matches!(batch.fallbacks[0], PlanFallback::ReplenishGrowth { .. }));
    }

    #[test]
    fn test_zero_reduction_falls_back() {
        let analyzer = Fixed {
            y: 0.01,
            growth: 40.0,
            reduction: 0.0,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts.counter, 0);
        assert!(batch
            .fallbacks
            .iter()
            .any(|f| matches!(f, PlanFallback::CounterReduction { .. })));
    }

    #[test]
    fn test_preparation_steady_state_is_empty() {
        let batch = plan_preparation(
            &target(100.0, 100.0, 3.0, 3.0),
            None,
            &GameModel::default(),
            &PlannerConfig::default(),
        );
        assert_eq!(batch.counts, UnitCounts::ZERO);
        assert!(batch.fallbacks.is_empty());
    }

    #[test]
    fn test_preparation_clears_existing_pressure() {
        let batch = plan_preparation(
            &target(100.0, 100.0, 6.0, 1.0),
            None,
            &GameModel::default(),
            &PlannerConfig::default(),
        );
        assert_eq!(batch.counts.replenish, 0);
        assert_eq!(batch.counts.counter, 100);
    }

    #[test]
    fn test_preparation_empty_target_grows_from_one() {
        let batch = plan_preparation(
            &target(0.0, 1_000.0, 1.0, 1.0),
            None,
            &GameModel::default(),
            &PlannerConfig::default(),
        );
        assert!(batch.counts.replenish > 0);
        assert_eq!(batch.fallbacks, vec![PlanFallback::EmptyTarget]);
    }

    #[test]
    fn test_preparation_clamps_counter_first() {
        let config = PlannerConfig {
            costs: UnitCosts {
                extract: 1.0,
                replenish: 1.0,
                counter: 1.0,
            },
            ..PlannerConfig::default()
        };
        // Clearing 10 pressure plus the growth pressure needs far more than 150 units.
        let batch = plan_preparation(
            &target(10.0, 1_000.0, 11.0, 1.0),
            Some(&pool(150.0)),
            &GameModel::default(),
            &config,
        );
        assert_eq!(batch.counts.counter, 150);
        assert_eq!(batch.counts.replenish, 0);

        // Counter fits; replenish gets the rest.
        let batch = plan_preparation(
            &target(10.0, 1_000.0, 2.0, 1.0),
            Some(&pool(150.0)),
            &GameModel::default(),
            &config,
        );
        assert!(batch.counts.counter >= 20);
        assert_eq!(batch.counts.counter + batch.counts.replenish, 150);
    }

    #[test]
    fn test_latch_holds_preparation_until_prepared() {
        let config = PlannerConfig::default();
        let mut latch = StrategyLatch::default();

        assert_eq!(latch.select(&target(50.0, 100.0, 21.0, 1.0), &config), Strategy::Preparation);
        assert!(latch.is_preparing());

        // Farming-ready but not fully prepared: stay in preparation.
        assert_eq!(latch.select(&target(95.0, 100.0, 2.0, 1.0), &config), Strategy::Preparation);

        assert_eq!(latch.select(&target(100.0, 100.0, 1.0, 1.0), &config), Strategy::Farming);
        assert!(!latch.is_preparing());

        // Farming tolerates drift within the thresholds.
        assert_eq!(latch.select(&target(95.0, 100.0, 2.0, 1.0), &config), Strategy::Farming);
    }

    #[test]
    fn test_batch_cost() {
        let batch = plan_farming(
            &target(100.0, 100.0, 1.0, 1.0),
            None,
            &Fixed {
                y: 0.01,
                growth: 40.0,
                reduction: 0.05,
            },
            &PlannerConfig::default(),
        );
        let costs = UnitCosts::default();
        let expected = 50.0 * 1.70 + 48.0 * 1.75 + 8.0 * 1.75;
        assert!((batch.capacity_cost(&costs) - expected).abs() < 1e-9);
        assert_eq!(batch.total_units(), 106);
    }

    #[test]
    fn test_vanishing_reduction_falls_back_instead_of_overflowing() {
        let analyzer = Fixed {
            y: 0.01,
            growth: 40.0,
            reduction: 1e-300,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts.counter, 0);
        assert_eq!(
            batch.fallbacks,
            vec![PlanFallback::CounterReduction { reduction_per_unit: 1e-300 }]
        );

        let allocation = allocate(&batch, &pool(1_000.0), &UnitCosts::default(), AllocationPolicy::AllOrNothing);
        assert_eq!(allocation.dispatched, batch.counts);
    }

    #[test]
    fn test_huge_estimates_fall_back() {
        let analyzer = Fixed {
            y: 1e-300,
            growth: 1e40,
            reduction: 0.05,
        };
        let batch = plan_farming(&target(100.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts, UnitCounts::ZERO);
        assert!(matches!(batch.fallbacks[0], PlanFallback::ExtractYield { .. }));

        let batch = plan_preparation(&target(10.0, 100.0, 1.0, 1.0), None, &analyzer, &PlannerConfig::default());
        assert_eq!(batch.counts.replenish, 0);
        assert!(matches!(batch.fallbacks[0], PlanFallback::ReplenishGrowth { .. }));
    }

    #[test]
    fn test_mixed_core_pool_sizes_for_weakest_worker() {
        let mixed = WorkerPool::new(vec![
            WorkerSnapshot::new(WorkerId::parse("home").unwrap(), 4_096.0, 0.0, 8).unwrap(),
            WorkerSnapshot::new(WorkerId::parse("pserv-0").unwrap(), 4_096.0, 0.0, 1).unwrap(),
        ]);
        let strong = WorkerPool::new(vec![
            WorkerSnapshot::new(WorkerId::parse("home").unwrap(), 8_192.0, 0.0, 8).unwrap(),
        ]);
        let model = GameModel::default();
        let config = PlannerConfig::default();
        let snapshot = target(1_000_000.0, 1_000_000.0, 1.0, 1.0);

        let on_mixed = plan_farming(&snapshot, Some(&mixed), &model, &config);
        let single_core = plan_farming(&snapshot, None, &model, &config);
        let on_strong = plan_farming(&snapshot, Some(&strong), &model, &config);

        assert_eq!(on_mixed.counts, single_core.counts);
        assert!(on_strong.counts.replenish < on_mixed.counts.replenish);
        assert!(on_strong.counts.counter <= on_mixed.counts.counter);

        let grow = target(500_000.0, 1_000_000.0, 1.0, 1.0);
        let prep_mixed = plan_preparation(&grow, Some(&mixed), &model, &config);
        let prep_single = plan_preparation(&grow, None, &model, &config);
        assert_eq!(prep_mixed.counts, prep_single.counts);
    }
}
