//! Binding a working copy manager to the lifetime of a job tree's root body.

use tracing::debug;

use forgegen_jobs::{Job, JobContext};

use crate::manager::WorkingCopyManager;

/// Closes the manager when the root body exits, however it exits.
struct CloseOnExit<'a>(&'a WorkingCopyManager);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Run `body` with a manager bound to `ctx`'s job tree.
///
/// The manager is open for the duration of `body` and closed on every exit
/// path (success, error, cancellation, panic); unreconciled edits are
/// discarded. Child jobs of the tree may use clones of the manager while the
/// body runs.
pub fn run_with_working_copy_manager<R, F>(ctx: &JobContext, body: F) -> anyhow::Result<R>
where
    F: FnOnce(&WorkingCopyManager) -> anyhow::Result<R>,
{
    let manager = WorkingCopyManager::new(ctx.tree_id());
    manager.open();
    debug!(manager = %manager.id(), job = %ctx.name(), "running with working copy manager");
    let _close = CloseOnExit(&manager);
    body(&manager)
}

/// A job whose body runs inside [`run_with_working_copy_manager`].
pub fn managed_job<F>(name: impl Into<String>, body: F) -> Job
where
    F: FnOnce(&JobContext, &WorkingCopyManager) -> anyhow::Result<()> + Send + 'static,
{
    Job::new(name, move |ctx| {
        run_with_working_copy_manager(ctx, |manager| body(ctx, manager))
    })
}
