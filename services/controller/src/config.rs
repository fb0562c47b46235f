//! Configuration for the controller.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use siphon_batch::raster::DEFAULT_TICK_MS;
use siphon_batch::timing::{DEFAULT_SLOTS, DEFAULT_SLOT_MS};
use siphon_batch::{Millis, PlannerConfig, Raster, TimingPlan};
use siphon_convergence::{
    ConvergenceTracker, ShortfallTracker, DEFAULT_CONVERGENCE_TOLERANCE, DEFAULT_MAX_SHORTFALLS,
    DEFAULT_MAX_STALLED_CYCLES, DEFAULT_MIN_SLEEP, DEFAULT_PRESSURE_WEIGHT, DEFAULT_SAFETY_MARGIN,
    DEFAULT_SHORTFALL_WINDOW,
};

use crate::error::{ControllerError, ControllerResult};

/// Clock raster and period layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Raster tick width.
    pub tick_ms: Millis,

    /// Slot width `T`.
    pub slot_ms: Millis,

    /// Slots per period (3, or 4 to reserve one for the control cycle).
    pub slots: u64,

    /// Jitter tolerance in ticks.
    pub slack_ticks: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            slot_ms: DEFAULT_SLOT_MS,
            slots: DEFAULT_SLOTS,
            slack_ticks: 1,
        }
    }
}

impl TimingConfig {
    /// Build the validated timing plan.
    pub fn plan(&self) -> ControllerResult<TimingPlan> {
        let raster = Raster::new(self.tick_ms)?;
        let slack = self.slack_ticks.saturating_mul(self.tick_ms);
        Ok(TimingPlan::new(raster, self.slot_ms, self.slots, slack)?)
    }
}

/// Control loop pacing and tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    /// Floor on the sleep between cycles.
    pub min_sleep: Duration,

    /// Added after the slowest operation's finish before the next cycle.
    pub safety_margin: Duration,

    /// Stop after this many cycles. Unbounded when `None`.
    pub max_cycles: Option<u64>,

    /// Distance at or below which a target counts as converged.
    pub convergence_tolerance: f64,

    /// Cycles without progress before a target is reported as stalled.
    pub max_stalled_cycles: u32,

    /// Weight of pressure delta in the convergence distance.
    pub pressure_weight: f64,

    /// Capacity shortfalls tolerated per window.
    pub max_shortfalls: u32,

    /// Shortfall window.
    pub shortfall_window: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_sleep: DEFAULT_MIN_SLEEP,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            max_cycles: None,
            convergence_tolerance: DEFAULT_CONVERGENCE_TOLERANCE,
            max_stalled_cycles: DEFAULT_MAX_STALLED_CYCLES,
            pressure_weight: DEFAULT_PRESSURE_WEIGHT,
            max_shortfalls: DEFAULT_MAX_SHORTFALLS,
            shortfall_window: DEFAULT_SHORTFALL_WINDOW,
        }
    }
}

impl LoopConfig {
    pub fn convergence_tracker(&self) -> ControllerResult<ConvergenceTracker> {
        ConvergenceTracker::new(self.convergence_tolerance, self.max_stalled_cycles)
            .map_err(|e| ControllerError::Config(e.to_string()))
    }

    pub fn shortfall_tracker(&self) -> ShortfallTracker {
        ShortfallTracker::new(self.max_shortfalls, self.shortfall_window)
    }
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub planner: PlannerConfig,
    pub timing: TimingConfig,
    pub control_loop: LoopConfig,

    /// Targets farmed at once, best ranked first.
    pub max_targets: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            timing: TimingConfig::default(),
            control_loop: LoopConfig::default(),
            max_targets: 1,
            log_level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let mut planner = defaults.planner;
        planner.extract_fraction = env_or("SIPHON_EXTRACT_FRACTION", planner.extract_fraction)?;
        planner.replenish_margin = env_or("SIPHON_REPLENISH_MARGIN", planner.replenish_margin)?;
        planner.counter_margin = env_or("SIPHON_COUNTER_MARGIN", planner.counter_margin)?;
        planner.thresholds.min_value_ratio =
            env_or("SIPHON_MIN_VALUE_RATIO", planner.thresholds.min_value_ratio)?;
        planner.thresholds.max_pressure_delta =
            env_or("SIPHON_MAX_PRESSURE_DELTA", planner.thresholds.max_pressure_delta)?;
        planner.costs.extract = env_or("SIPHON_EXTRACT_COST", planner.costs.extract)?;
        planner.costs.replenish = env_or("SIPHON_REPLENISH_COST", planner.costs.replenish)?;
        planner.costs.counter = env_or("SIPHON_COUNTER_COST", planner.costs.counter)?;

        let timing = TimingConfig {
            tick_ms: env_or("SIPHON_TICK_MS", defaults.timing.tick_ms)?,
            slot_ms: env_or("SIPHON_SLOT_MS", defaults.timing.slot_ms)?,
            slots: env_or("SIPHON_SLOTS", defaults.timing.slots)?,
            slack_ticks: env_or("SIPHON_SLACK_TICKS", defaults.timing.slack_ticks)?,
        };

        let loop_defaults = defaults.control_loop;
        let control_loop = LoopConfig {
            min_sleep: Duration::from_millis(env_or(
                "SIPHON_MIN_SLEEP_MS",
                loop_defaults.min_sleep.as_millis() as u64,
            )?),
            safety_margin: Duration::from_millis(env_or(
                "SIPHON_SAFETY_MARGIN_MS",
                loop_defaults.safety_margin.as_millis() as u64,
            )?),
            max_cycles: std::env::var("SIPHON_MAX_CYCLES")
                .ok()
                .map(|s| s.parse::<u64>())
                .transpose()
                .context("SIPHON_MAX_CYCLES must be an integer")?,
            max_stalled_cycles: env_or("SIPHON_MAX_STALLED_CYCLES", loop_defaults.max_stalled_cycles)?,
            max_shortfalls: env_or("SIPHON_MAX_SHORTFALLS", loop_defaults.max_shortfalls)?,
            ..loop_defaults
        };

        let max_targets = env_or("SIPHON_MAX_TARGETS", defaults.max_targets)?;
        let log_level = std::env::var("SIPHON_LOG_LEVEL").unwrap_or(defaults.log_level);

        let config = Self {
            planner,
            timing,
            control_loop,
            max_targets,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> ControllerResult<()> {
        self.planner.validate()?;
        self.timing.plan()?;
        self.control_loop.convergence_tracker()?;
        if self.max_targets == 0 {
            return Err(ControllerError::Config("max_targets must be at least 1".to_string()));
        }
        if self.control_loop.min_sleep.is_zero() {
            return Err(ControllerError::Config("min_sleep must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Parse `name` if set, else `default`.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}
