//! The context a job body runs with: cancellation, progress and job-tree identity.

use std::sync::Arc;

use tracing::{debug, trace};

use forgegen_core::{JobId, JobTreeId};

use crate::cancel::CancellationToken;
use crate::error::OperationCanceled;
use crate::job::{Job, JobHandle, JobShared};
use crate::scheduler::Scheduler;

/// Passed to every job body.
///
/// Bodies poll [`is_canceled`](Self::is_canceled) or `check_canceled()?` at safe
/// points. Code that needs job-tree scoping (e.g. working copies) takes the
/// context explicitly.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: JobHandle,
    scheduler: Option<Scheduler>,
}

impl JobContext {
    pub(crate) fn new(job: JobHandle, scheduler: Option<Scheduler>) -> Self {
        Self { job, scheduler }
    }

    /// A context for work running directly on the calling thread.
    ///
    /// It starts its own job tree and cancellation token and has no scheduler.
    pub fn detached(name: impl Into<String>) -> Self {
        let (spec, _) = Job::new(name, |_| Ok(())).into_parts();
        let job = JobHandle::from_shared(Arc::new(JobShared::detached(spec)));
        Self {
            job,
            scheduler: None,
        }
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn tree_id(&self) -> JobTreeId {
        self.job.tree_id()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.job.shared().token
    }

    pub fn is_canceled(&self) -> bool {
        self.token().is_canceled()
    }

    pub fn check_canceled(&self) -> Result<(), OperationCanceled> {
        self.token().check()
    }

    /// The scheduler running this job; `None` for detached contexts.
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    /// Start a (new) main task; resets worked units.
    pub fn begin_task(&self, task: impl Into<String>, total: Option<u64>) {
        let task = task.into();
        debug!(job_id = %self.job_id(), job = %self.name(), task = %task, total = ?total, "task started");
        self.job.shared().update_progress(|progress| {
            progress.task = Some(task);
            progress.subtask = None;
            progress.total = total;
            progress.worked = 0;
        });
    }

    pub fn subtask(&self, subtask: impl Into<String>) {
        let subtask = subtask.into();
        trace!(job_id = %self.job_id(), subtask = %subtask, "subtask");
        self.job
            .shared()
            .update_progress(|progress| progress.subtask = Some(subtask));
    }

    pub fn worked(&self, units: u64) {
        self.job
            .shared()
            .update_progress(|progress| progress.worked = progress.worked.saturating_add(units));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    #[test]
    fn detached_context_is_running_with_its_own_tree() {
        let a = JobContext::detached("a");
        let b = JobContext::detached("b");
        assert_eq!(a.job().state(), JobState::Running);
        assert_ne!(a.tree_id(), b.tree_id());
        assert!(a.scheduler().is_none());
    }

    #[test]
    fn cancel_is_visible_through_check() {
        let ctx = JobContext::detached("cancel");
        assert!(ctx.check_canceled().is_ok());
        assert!(ctx.job().cancel());
        assert!(ctx.is_canceled());
        assert_eq!(ctx.check_canceled(), Err(OperationCanceled));
    }

    #[test]
    fn progress_is_observable_from_the_handle() {
        let ctx = JobContext::detached("progress");
        ctx.begin_task("generate", Some(10));
        ctx.subtask("entities");
        ctx.worked(3);
        ctx.worked(2);

        let progress = ctx.job().progress();
        assert_eq!(progress.task.as_deref(), Some("generate"));
        assert_eq!(progress.subtask.as_deref(), Some("entities"));
        assert_eq!(progress.worked, 5);
        assert_eq!(progress.fraction(), Some(0.5));

        ctx.begin_task("format", None);
        assert_eq!(ctx.job().progress().worked, 0);
        assert_eq!(ctx.job().progress().subtask, None);
    }
}
