//! # siphon-id
//!
//! Identifier types shared by the batch planner and the controller.
//!
//! ## ID Families
//!
//! - **Host names** (`TargetId`, `WorkerId`): opaque labels handed to us by the
//!   discovery feed. They are validated but never generated here.
//! - **Prefixed ULIDs** (`CycleId`, `LoopId`): `{prefix}_{ulid}`, generated
//!   locally, sortable by creation time.
//! - **Run IDs** (`RunId`): a process-wide monotonic counter that
//!   disambiguates concurrently running jobs of the same kind against the
//!   same target.
//!
//! Examples:
//! - `n00dles`, `home`, `pserv-3`
//! - `cyc_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `run-42`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
