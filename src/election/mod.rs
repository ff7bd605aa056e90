//! Leader Election & Job Coordination
//!
//! One active coordinator per service name. The leader runs the scheduled
//! maintenance (cleanup cycle, idempotency GC, saga recovery, job-timeout
//! sweep); every other instance only observes.

pub mod jobs;
pub mod leader;

pub use jobs::{LeaderJobCoordinator, ScheduledJob};
pub use leader::{ElectionListener, LeaderElection, LeaderInfo, LeadershipHandle};
