//! Error model for scheduling, waiting and result retrieval.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type returned by waits and future accessors.
pub type JobResult<T> = Result<T, JobError>;

/// Signal a job body returns to stop voluntarily.
///
/// The scheduler maps a body error whose chain contains this type to
/// [`JobState::Canceled`](crate::JobState::Canceled) instead of `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct OperationCanceled;

/// Why a wait or a result retrieval did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The job was canceled before it ran, or its body stopped voluntarily.
    #[error("job `{job}` was canceled")]
    Canceled { job: String },

    /// The body (or the result supplier) failed. `cause` is the original error.
    #[error("job `{job}` completed exceptionally: {cause:#}")]
    Failed {
        job: String,
        cause: Arc<anyhow::Error>,
    },

    /// A bounded wait elapsed. The job is unaffected.
    #[error("timed out after {after:?} waiting for `{target}`")]
    TimedOut { target: String, after: Duration },

    /// The wait was refused up front because it can never be satisfied.
    #[error("waiting for `{target}` from job `{waiting}` would deadlock: {reason}")]
    Deadlock {
        waiting: String,
        target: String,
        reason: String,
    },

    /// The caller's cancellation token fired while waiting. The job is unaffected.
    #[error("wait for `{target}` abandoned by the caller")]
    WaitAbandoned { target: String },
}

impl JobError {
    pub fn canceled(job: impl Into<String>) -> Self {
        Self::Canceled { job: job.into() }
    }

    pub fn failed(job: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Failed {
            job: job.into(),
            cause: Arc::new(cause),
        }
    }

    pub(crate) fn failed_shared(job: impl Into<String>, cause: Arc<anyhow::Error>) -> Self {
        Self::Failed {
            job: job.into(),
            cause,
        }
    }

    pub fn timed_out(target: impl Into<String>, after: Duration) -> Self {
        Self::TimedOut {
            target: target.into(),
            after,
        }
    }

    pub fn deadlock(
        waiting: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Deadlock {
            waiting: waiting.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn wait_abandoned(target: impl Into<String>) -> Self {
        Self::WaitAbandoned {
            target: target.into(),
        }
    }

    /// The original error behind a `Failed`.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            JobError::Failed { cause, .. } => Some(&**cause),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, JobError::Canceled { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobError::Failed { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, JobError::TimedOut { .. })
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, JobError::Deadlock { .. })
    }
}

/// Scheduler construction failure.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("template `{0}` missing")]
    struct TemplateMissing(String);

    #[test]
    fn failed_keeps_original_cause_for_downcasting() {
        let err = JobError::failed("generate", anyhow::Error::new(TemplateMissing("entity".into())));
        let cause = err.cause().unwrap();
        assert_eq!(
            cause.downcast_ref::<TemplateMissing>().map(|t| t.0.as_str()),
            Some("entity")
        );
        assert!(err.to_string().contains("template `entity` missing"));
    }

    #[test]
    fn clones_share_the_same_cause() {
        let err = JobError::failed("generate", anyhow::anyhow!("boom"));
        let copy = err.clone();
        match (&err, &copy) {
            (JobError::Failed { cause: a, .. }, JobError::Failed { cause: b, .. }) => {
                assert!(Arc::ptr_eq(a, b))
            }
            _ => panic!("expected failures"),
        }
    }

    #[test]
    fn kind_predicates() {
        assert!(JobError::canceled("a").is_canceled());
        assert!(JobError::timed_out("a", Duration::from_millis(5)).is_timed_out());
        assert!(JobError::deadlock("a", "b", "rule").is_deadlock());
        assert!(!JobError::wait_abandoned("a").is_failed());
    }
}
