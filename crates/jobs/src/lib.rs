//! `forgegen-jobs`: background job execution for the generation engine.
//!
//! Jobs are scheduled on a fixed worker pool ([`Scheduler`]). A job may carry a
//! [`Rule`]; two jobs with conflicting rules never run at the same time. Jobs
//! belong to families so callers can find, cancel or wait for groups of them,
//! and value-producing work is consumed through a [`JobFuture`] whose result is
//! computed lazily and memoized.

pub mod cancel;
pub mod config;
pub mod context;
pub mod deadlock;
pub mod error;
pub mod future;
pub mod job;
pub mod rule;
pub mod scheduler;

mod sync;

pub use cancel::CancellationToken;
pub use config::{ConfigError, SchedulerConfig};
pub use context::JobContext;
pub use deadlock::{DeadlockDetector, DeadlockSnapshot};
pub use error::{JobError, JobResult, OperationCanceled, SchedulerError};
pub use future::JobFuture;
pub use job::{Job, JobBody, JobHandle, JobOutcome, JobState, Progress, TypedJob};
pub use rule::{Rule, rules_conflict};
pub use scheduler::{Scheduler, SchedulerStats};

pub use forgegen_core::{FamilyToken, JobId, JobTreeId};
