//! Clock raster.
//!
//! Every duration and timestamp the scheduler reasons about is rounded up to
//! the next multiple of a fixed tick width, the polling granularity shared by
//! the control loop and its jobs. Working on the raster makes "does this
//! operation land in slot X" an exact integer comparison.
//!
//! The duration oracle behind the snapshots can itself jitter by one tick
//! between two calls, so a raster-aligned prediction may still be one tick off.
//! Callers compare against deadlines with a fixed slack (see
//! [`crate::timing::TimingPlan::slack`]) instead of demanding equality.

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::Millis;

/// Default tick width.
pub const DEFAULT_TICK_MS: Millis = 200;

/// Rounds times onto a fixed tick grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raster {
    tick: Millis,
}

impl Raster {
    /// Creates a raster with the given tick width. Zero is rejected.
    pub fn new(tick: Millis) -> Result<Self, SchedulerError> {
        if tick == 0 {
            return Err(SchedulerError::InvalidConfig(
                "raster tick width must be non-zero".to_string(),
            ));
        }
        Ok(Self { tick })
    }

    pub fn tick(&self) -> Millis {
        self.tick
    }

    /// `ceil(t / tick) * tick`.
    pub fn raster(&self, t: Millis) -> Millis {
        t.div_ceil(self.tick).saturating_mul(self.tick)
    }

    /// `floor(t / tick) * tick`.
    pub fn floor(&self, t: Millis) -> Millis {
        (t / self.tick) * self.tick
    }

    pub fn is_aligned(&self, t: Millis) -> bool {
        t % self.tick == 0
    }

    /// Whole ticks in `t`, rounded down.
    pub fn ticks(&self, t: Millis) -> u64 {
        t / self.tick
    }
}

impl Default for Raster {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_zero_tick_rejected() {
        assert!(Raster::new(0).is_err());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 200)]
    #[case(199, 200)]
    #[case(200, 200)]
    #[case(201, 400)]
    #[case(1_000, 1_000)]
    fn test_raster_rounds_up(#[case] input: Millis, #[case] expected: Millis) {
        let r = Raster::new(200).unwrap();
        assert_eq!(r.raster(input), expected);
    }

    #[test]
    fn test_floor_and_ticks() {
        let r = Raster::new(50).unwrap();
        assert_eq!(r.floor(149), 100);
        assert_eq!(r.ticks(149), 2);
        assert!(r.is_aligned(150));
        assert!(!r.is_aligned(151));
    }

    #[test]
    fn test_raster_saturates_near_max() {
        let r = Raster::new(200).unwrap();
        assert!(r.raster(u64::MAX - 1) >= r.floor(u64::MAX - 1));
    }

    proptest! {
        #[test]
        fn prop_raster_bounds(t in 0u64..1u64 << 48, tick in 1u64..10_000) {
            let r = Raster::new(tick).unwrap();
            let out = r.raster(t);
            prop_assert!(out >= t);
            prop_assert!(out - t < tick);
            prop_assert!(r.is_aligned(out));
        }

        #[test]
        fn prop_raster_idempotent(t in 0u64..1u64 << 48, tick in 1u64..10_000) {
            let r = Raster::new(tick).unwrap();
            prop_assert_eq!(r.raster(r.raster(t)), r.raster(t));
        }
    }
}
