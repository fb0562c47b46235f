//! siphon controller
//!
//! Async runtime around the `siphon-batch` scheduling core. It keeps targets
//! near their optimal state by running one control loop per target.
//!
//! ## Architecture
//!
//! - **Controller**: ranks targets and runs one control loop for each pick
//! - **Control loop**: snapshot, plan, schedule, allocate, claim, dispatch
//! - **Executor**: owns the timed job tasks of one loop
//! - **Jobs**: wait for their fire instant, then launch exactly once
//! - **Reservations**: capacity held for waiting jobs across all loops
//! - **Boundaries**: [`StateSource`] for snapshots, [`Launcher`] for remote
//!   operations, [`DiagnosticsSink`] for per-cycle reports
//! - **Sim**: in-memory world implementing both boundaries (dev and tests)

pub mod clock;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod coordination;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod job;
pub mod launcher;
pub mod reservation;
pub mod sim;
pub mod source;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{ControllerConfig, LoopConfig, TimingConfig};
pub use control_loop::{ControlLoop, LoopSummary, Services};
pub use controller::Controller;
pub use coordination::{CoordinationCell, CoordinationStore};
pub use diagnostics::{CycleReport, DiagnosticsSink, MemorySink, SkipReason, TracingSink};
pub use error::{ControllerError, ControllerResult};
pub use executor::{Executor, ReapStats};
pub use job::{run_job, JobContext, JobOutcome, JobSpec};
pub use launcher::{DispatchRecord, LaunchError, LaunchHandle, Launcher, MockLauncher};
pub use reservation::{Hold, LedgerView, Reservation, ReservationLedger};
pub use sim::{Landed, SimTarget, SimWorld};
pub use source::StateSource;
