//! Typed ID definitions.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{define_id, define_name};

// =============================================================================
// Hosts
// =============================================================================

define_name!(TargetId);
define_name!(WorkerId);

// =============================================================================
// Control Loop
// =============================================================================

define_id!(CycleId, "cyc");
define_id!(LoopId, "loop");

// =============================================================================
// Dispatched Runs
// =============================================================================

/// Run ID is a monotonic integer, not ULID-based.
///
/// Two jobs of the same kind against the same target are otherwise
/// indistinguishable to the remote side, so every dispatched job carries a
/// fresh run ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u64);

impl RunId {
    /// Prefix used by the string form, e.g. `run-42`.
    pub const PREFIX: &'static str = "run-";

    /// Creates a RunId from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Parses the `run-{n}` form.
    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        let Some(raw) = s.strip_prefix(Self::PREFIX) else {
            return Err(crate::IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: s.to_string(),
            });
        };
        match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(crate::IdError::InvalidRun(s.to_string())),
            Ok(n) => Ok(Self(n)),
        }
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<RunId> for u64 {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl serde::Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

/// Hands out strictly increasing run IDs.
///
/// Share one generator (behind an `Arc`) between every control loop of a
/// process so run IDs never collide across targets.
#[derive(Debug)]
pub struct RunIdGenerator {
    next: AtomicU64,
}

impl RunIdGenerator {
    /// Creates a generator whose first ID is `run-1`.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a generator whose first ID is `first` (clamped to at least 1).
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// Returns the next run ID.
    pub fn next_id(&self) -> RunId {
        RunId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RunIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_host_names_parse() {
        let target: TargetId = "n00dles".parse().unwrap();
        assert_eq!(target.as_str(), "n00dles");
        assert_eq!(target.to_string(), "n00dles");

        let worker = WorkerId::parse("pserv-3").unwrap();
        assert_eq!(worker.as_ref(), "pserv-3");
    }

    #[test]
    fn test_host_name_rejects_garbage() {
        assert_eq!(TargetId::parse(""), Err(IdError::Empty));
        assert!(matches!(
            TargetId::parse("two words"),
            Err(IdError::InvalidName { .. })
        ));
        assert!(matches!(
            WorkerId::parse(&"x".repeat(254)),
            Err(IdError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_cycle_id_prefix() {
        let id = CycleId::new();
        let s = id.to_string();
        assert!(s.starts_with("cyc_"));
        assert_eq!(CycleId::parse(&s).unwrap(), id);

        let err = CycleId::parse(&LoopId::new().to_string()).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_cycle_id_missing_separator() {
        assert_eq!(
            CycleId::parse("cyc01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
    }

    #[test]
    fn test_run_id_generator_is_monotonic() {
        let generator = RunIdGenerator::new();
        let a = generator.next_id();
        let b = generator.next_id();
        let c = generator.next_id();
        assert_eq!(a, RunId::new(1));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_run_id_generator_never_hands_out_zero() {
        let generator = RunIdGenerator::starting_at(0);
        assert_eq!(generator.next_id().value(), 1);
    }

    #[test]
    fn test_run_id_parse() {
        assert_eq!(RunId::parse("run-42").unwrap(), RunId::new(42));
        assert!(RunId::parse("run-0").is_err());
        assert!(RunId::parse("42").unwrap_err().is_prefix_error());
        assert!(RunId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_serde_forms() {
        let target = TargetId::parse("joesguns").unwrap();
        assert_eq!(serde_json::to_string(&target).unwrap(), "\"joesguns\"");
        assert_eq!(serde_json::to_string(&RunId::new(7)).unwrap(), "7");

        let back: TargetId = serde_json::from_str("\"joesguns\"").unwrap();
        assert_eq!(back, target);
        assert!(serde_json::from_str::<TargetId>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_run_id_display_roundtrip(n in 1u64..u64::MAX) {
            let id = RunId::new(n);
            prop_assert_eq!(RunId::parse(&id.to_string()).unwrap(), id);
        }

        #[test]
        fn prop_host_names_without_whitespace_parse(name in "[a-z0-9.-]{1,64}") {
            let parsed = WorkerId::parse(&name).unwrap();
            prop_assert_eq!(parsed.as_str(), name.as_str());
        }
    }
}
