//! Health checker: progressive-timeout pings with an aggregate verdict.
//!
//! - **schedule**: the retry policy as a pure state machine
//! - **checker**: runs the schedule against [`PingTarget`](gantry_types::PingTarget)s
//! - **summary**: counts, verdict, exit code and the printed report
//! - **target**: in-process targets over registered backends

pub mod checker;
pub mod schedule;
pub mod summary;
pub mod target;

pub use checker::{BackendHealth, HealthChecker, HealthOutcome, PingResult};
pub use schedule::{PlannedAttempt, RetryPhase, RetrySchedule, RetryState};
pub use summary::{suggested_causes, HealthCounts, HealthReport, Verdict};
pub use target::BackendPing;
