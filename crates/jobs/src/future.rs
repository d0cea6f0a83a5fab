//! Futures over scheduled jobs with lazily computed, memoized results.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::{JobError, JobResult};
use crate::job::{JobHandle, JobOutcome, JobState};
use crate::scheduler::Scheduler;
use crate::sync::lock;

pub(crate) type Supplier<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>;

/// Handle to the eventual result of a job.
///
/// The supplier runs on the first successful `result()`/`get*()` call after the
/// job succeeded, at most once across all clones and threads; later calls
/// return the memoized value. Nothing is computed for futures nobody asks.
pub struct JobFuture<T> {
    inner: Arc<FutureInner<T>>,
}

struct FutureInner<T> {
    job: JobHandle,
    scheduler: Scheduler,
    supplier: Mutex<Option<Supplier<T>>>,
    value: OnceLock<JobResult<T>>,
    cancel_requested: AtomicBool,
}

impl<T> Clone for JobFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> JobFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(job: JobHandle, scheduler: Scheduler, supplier: Supplier<T>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                job,
                scheduler,
                supplier: Mutex::new(Some(supplier)),
                value: OnceLock::new(),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn job(&self) -> &JobHandle {
        &self.inner.job
    }

    /// Block until the job is terminal and return its value.
    pub fn result(&self) -> JobResult<T> {
        self.get_with(None, None)
    }

    pub fn get(&self) -> JobResult<T> {
        self.get_with(None, None)
    }

    /// Like [`get`](Self::get), but gives up with `TimedOut` after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> JobResult<T> {
        self.get_with(Some(timeout), None)
    }

    /// Wait with an optional bound and an optional caller token.
    ///
    /// A fired `token` ends the wait with `WaitAbandoned`; neither that nor a
    /// timeout affects the job.
    pub fn get_with(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> JobResult<T> {
        if let Some(memo) = self.inner.value.get() {
            return memo.clone();
        }
        if self.is_cancel_requested() {
            return Err(JobError::canceled(self.inner.job.name()));
        }
        let outcome = self.inner.scheduler.join(&self.inner.job, timeout, token)?;
        self.resolve(outcome)
    }

    fn resolve(&self, outcome: JobOutcome) -> JobResult<T> {
        if self.is_cancel_requested() {
            return Err(JobError::canceled(self.inner.job.name()));
        }
        match outcome {
            JobOutcome::Succeeded => self.inner.value.get_or_init(|| self.compute()).clone(),
            JobOutcome::Failed(cause) => {
                Err(JobError::failed_shared(self.inner.job.name(), cause))
            }
            JobOutcome::Canceled => Err(JobError::canceled(self.inner.job.name())),
        }
    }

    fn compute(&self) -> JobResult<T> {
        let name = self.inner.job.name();
        let supplier = lock(&self.inner.supplier).take();
        debug!(job_id = %self.inner.job.id(), job = %name, "computing job result");
        match supplier {
            Some(supplier) => supplier().map_err(|cause| JobError::failed(name, cause)),
            None => Err(JobError::failed(
                name,
                anyhow!("result supplier did not complete"),
            )),
        }
    }

    /// Run `callback` once the job is terminal, whatever the outcome.
    ///
    /// Runs immediately on the calling thread if the job is already terminal.
    pub fn then_run(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.job.on_done(callback);
    }

    /// Request cancellation.
    ///
    /// A waiting job is canceled outright. A running job has its token canceled
    /// only when `may_interrupt_if_running` is set; either way this future
    /// reports cancellation from now on. Returns false if the job was already
    /// terminal.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        let job = &self.inner.job;
        let mut state = JobState::Waiting;
        let marked = job.shared().while_active(|current| {
            state = current;
            self.inner.cancel_requested.store(true, Ordering::SeqCst);
        });
        if !marked {
            return false;
        }
        if state == JobState::Running && !may_interrupt_if_running {
            debug!(job_id = %job.id(), job = %job.name(), "future canceled; letting running job finish");
        } else {
            self.inner.scheduler.cancel(job);
        }
        true
    }

    fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    /// Terminal, or canceled through this future.
    pub fn is_done(&self) -> bool {
        self.is_cancel_requested() || self.inner.job.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancel_requested() || self.inner.job.state() == JobState::Canceled
    }

    /// Canceled, failed, or the supplier failed.
    pub fn is_completed_exceptionally(&self) -> bool {
        self.exception().is_some()
    }

    /// The captured error, if any. Never blocks and never runs the supplier.
    pub fn exception(&self) -> Option<JobError> {
        if self.is_cancel_requested() {
            return Some(JobError::canceled(self.inner.job.name()));
        }
        match self.inner.job.outcome()? {
            JobOutcome::Succeeded => match self.inner.value.get() {
                Some(Err(err)) => Some(err.clone()),
                _ => None,
            },
            other => other.into_result(self.inner.job.name()).err(),
        }
    }
}

impl<T> fmt::Debug for JobFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture")
            .field("job", &self.inner.job)
            .field("computed", &self.inner.value.get().is_some())
            .field(
                "cancel_requested",
                &self.inner.cancel_requested.load(Ordering::SeqCst),
            )
            .finish()
    }
}
