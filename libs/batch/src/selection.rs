//! Target ranking.

use std::cmp::Ordering;

use crate::analyzer::Analyzer;
use crate::target::TargetSnapshot;

/// Expected value extracted per millisecond of extract time at full value.
pub fn extraction_rate(target: &TargetSnapshot, analyzer: &dyn Analyzer) -> f64 {
    let y = analyzer.extract_yield_per_unit(target);
    if !y.is_finite() || y <= 0.0 {
        return 0.0;
    }
    target.max_value() * y / target.durations().extract.max(1) as f64
}

/// Order candidate targets best first.
///
/// Targets without any value to take are dropped. Ties break by id so two
/// controllers looking at the same snapshot pick the same targets.
pub fn rank_targets<'a>(targets: &'a [TargetSnapshot], analyzer: &dyn Analyzer) -> Vec<&'a TargetSnapshot> {
    let mut scored: Vec<(f64, &TargetSnapshot)> = targets
        .iter()
        .filter(|t| t.max_value() > 0.0)
        .map(|t| (extraction_rate(t, analyzer), t))
        .collect();
    scored.sort_by(|(a, ta), (b, tb)| {
        b.partial_cmp(a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| ta.id().cmp(tb.id()))
    });
    scored.into_iter().map(|(_, t)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::GameModel;
    use crate::target::OperationDurations;
    use siphon_id::TargetId;

    fn target(name: &str, max: f64, extract_ms: u64) -> TargetSnapshot {
        TargetSnapshot::new(
            TargetId::parse(name).unwrap(),
            max,
            max,
            1.0,
            1.0,
            OperationDurations::new(extract_ms, extract_ms * 3, extract_ms * 4),
        )
        .unwrap()
    }

    #[test]
    fn test_ranks_by_rate() {
        let targets = vec![
            target("slow", 10_000.0, 10_000),
            target("rich", 10_000.0, 1_000),
            target("poor", 100.0, 1_000),
        ];
        let ranked: Vec<&str> = rank_targets(&targets, &GameModel::default())
            .iter()
            .map(|t| t.id().as_str())
            .collect();
        assert_eq!(ranked, vec!["rich", "slow", "poor"]);
    }

    #[test]
    fn test_skips_empty_targets_and_breaks_ties_by_id() {
        let targets = vec![
            target("b", 500.0, 1_000),
            target("empty", 0.0, 1_000),
            target("a", 500.0, 1_000),
        ];
        let ranked: Vec<&str> = rank_targets(&targets, &GameModel::default())
            .iter()
            .map(|t| t.id().as_str())
            .collect();
        assert_eq!(ranked, vec!["a", "b"]);
    }

    #[test]
    fn test_zero_duration_does_not_divide_by_zero() {
        let t = target("instant", 100.0, 0);
        assert!(extraction_rate(&t, &GameModel::default()).is_finite());
    }
}
