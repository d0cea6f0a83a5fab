//! Job scheduler: worker pool, rule-based mutual exclusion and blocking waits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use forgegen_core::{FamilyToken, JobId, JobTreeId};

use crate::cancel::CancellationToken;
use crate::config::SchedulerConfig;
use crate::context::JobContext;
use crate::deadlock::DeadlockDetector;
use crate::error::{JobError, JobResult, OperationCanceled, SchedulerError};
use crate::future::JobFuture;
use crate::job::{Job, JobBody, JobHandle, JobOutcome, JobShared, JobState, Listener, TypedJob};
use crate::rule::rules_conflict;
use crate::sync::{deadline_after, lock, wait_timeout};

thread_local! {
    static CURRENT_JOB: RefCell<Option<JobHandle>> = const { RefCell::new(None) };
}

/// Marks the job running on this worker thread for the duration of its body.
struct CurrentJobGuard {
    previous: Option<JobHandle>,
}

impl CurrentJobGuard {
    fn enter(job: JobHandle) -> Self {
        let previous = CURRENT_JOB.with(|current| current.replace(Some(job)));
        Self { previous }
    }
}

impl Drop for CurrentJobGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_JOB.with(|current| *current.borrow_mut() = previous);
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    /// Jobs refused at schedule time (invalid rule/family or shut down)
    pub rejected: u64,
    pub waiting: usize,
    pub running: usize,
    pub uptime_secs: u64,
}

struct QueuedJob {
    handle: JobHandle,
    body: JobBody,
    /// `None` for a delay too large to represent: never due.
    not_before: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    /// In schedule order
    waiting: Vec<QueuedJob>,
    running: HashMap<JobId, JobHandle>,
    shutdown: bool,
    stats: SchedulerStats,
}

impl QueueState {
    /// First due job whose rule does not conflict with a running job's rule.
    fn next_runnable(&self, now: Instant) -> Option<usize> {
        self.waiting.iter().position(|queued| {
            queued.not_before.is_some_and(|due| due <= now)
                && !self
                    .running
                    .values()
                    .any(|running| rules_conflict(queued.handle.rule(), running.rule()))
        })
    }

    /// Earliest start time of a job that is not yet due.
    fn next_due(&self, now: Instant) -> Option<Instant> {
        self.waiting
            .iter()
            .filter_map(|queued| queued.not_before)
            .filter(|due| *due > now)
            .min()
    }

    fn active(&self) -> impl Iterator<Item = &JobHandle> {
        self.waiting
            .iter()
            .map(|queued| &queued.handle)
            .chain(self.running.values())
    }

    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded => self.stats.succeeded += 1,
            JobOutcome::Failed(_) => self.stats.failed += 1,
            JobOutcome::Canceled => self.stats.canceled += 1,
        }
    }
}

pub(crate) struct SchedulerShared {
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    /// Signaled when a job is queued or a rule is released
    work_ready: Condvar,
    /// Signaled whenever a job becomes terminal
    job_finished: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    started: Instant,
}

/// Runs jobs on a fixed pool of worker threads.
///
/// Cloning is cheap; all clones drive the same pool. Workers run until
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Spawn the worker pool.
    pub fn start(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let shared = Arc::new(SchedulerShared {
            config,
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            job_finished: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            started: Instant::now(),
        });
        let scheduler = Self { shared };

        let name = scheduler.shared.config.name.clone();
        for index in 0..scheduler.shared.config.workers {
            let worker_shared = Arc::clone(&scheduler.shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(worker_shared, index));
            match spawned {
                Ok(handle) => lock(&scheduler.shared.workers).push(handle),
                Err(err) => {
                    error!(scheduler = %name, worker = index, error = %err, "failed to spawn worker");
                    scheduler.shutdown();
                    return Err(SchedulerError::Spawn(err));
                }
            }
        }

        info!(
            scheduler = %name,
            workers = scheduler.shared.config.workers,
            "job scheduler started"
        );
        Ok(scheduler)
    }

    pub(crate) fn from_shared(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// The job whose body is running on the calling thread.
    pub fn current_job() -> Option<JobHandle> {
        CURRENT_JOB.with(|current| current.borrow().clone())
    }

    /// The current job, if it belongs to this scheduler.
    fn current_job_here(&self) -> Option<JobHandle> {
        Self::current_job().filter(|job| {
            std::ptr::eq(job.shared().scheduler.as_ptr(), Arc::as_ptr(&self.shared))
        })
    }

    /// Queue a job. Never blocks and never fails; an invalid job comes back
    /// already terminal.
    pub fn schedule(&self, job: Job) -> JobHandle {
        self.enqueue(job, Duration::ZERO, None)
    }

    /// Queue a job that no worker starts before `delay` elapses.
    pub fn schedule_after(&self, job: Job, delay: Duration) -> JobHandle {
        self.enqueue(job, delay, None)
    }

    /// Queue a job inside `parent`'s job tree. Canceling the parent cancels it.
    pub fn schedule_child(&self, parent: &JobContext, job: Job) -> JobHandle {
        self.enqueue(job, Duration::ZERO, Some(parent))
    }

    /// Queue a job and pair it with a lazily evaluated result supplier.
    pub fn schedule_with_future<T, F>(&self, job: Job, supplier: F) -> JobFuture<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let handle = self.schedule(job);
        JobFuture::new(handle, self.clone(), Box::new(supplier))
    }

    /// Queue a value-producing job.
    pub fn submit<T>(&self, job: TypedJob<T>) -> JobFuture<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (job, slot) = job.into_parts();
        let name = job.name().to_string();
        self.schedule_with_future(job, move || {
            lock(&slot)
                .take()
                .ok_or_else(|| anyhow!("job `{name}` produced no value"))
        })
    }

    /// Queue a value-producing job inside `parent`'s job tree.
    pub fn submit_child<T>(&self, parent: &JobContext, job: TypedJob<T>) -> JobFuture<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (job, slot) = job.into_parts();
        let name = job.name().to_string();
        let handle = self.enqueue(job, Duration::ZERO, Some(parent));
        JobFuture::new(
            handle,
            self.clone(),
            Box::new(move || {
                lock(&slot)
                    .take()
                    .ok_or_else(|| anyhow!("job `{name}` produced no value"))
            }),
        )
    }

    fn enqueue(&self, job: Job, delay: Duration, parent: Option<&JobContext>) -> JobHandle {
        let (spec, body) = job.into_parts();

        if let Err(err) = spec.validate() {
            warn!(job_id = %spec.id, job = %spec.name, error = %err, "rejecting invalid job");
            lock(&self.shared.state).stats.rejected += 1;
            let outcome = JobOutcome::Failed(Arc::new(anyhow::Error::new(err)));
            return JobHandle::from_shared(Arc::new(JobShared::rejected(spec, outcome)));
        }

        let (tree, token, parent_id) = match parent {
            Some(ctx) => (ctx.tree_id(), ctx.token().child_token(), Some(ctx.job_id())),
            None => (JobTreeId::new(), CancellationToken::new(), None),
        };

        let mut state = lock(&self.shared.state);
        if state.shutdown {
            state.stats.rejected += 1;
            drop(state);
            debug!(job_id = %spec.id, job = %spec.name, "scheduler shut down; job canceled");
            return JobHandle::from_shared(Arc::new(JobShared::rejected(
                spec,
                JobOutcome::Canceled,
            )));
        }

        let handle = JobHandle::from_shared(Arc::new(JobShared::new(
            spec,
            tree,
            parent_id,
            token,
            Arc::downgrade(&self.shared),
        )));
        state.waiting.push(QueuedJob {
            handle: handle.clone(),
            body,
            not_before: deadline_after(delay),
        });
        state.stats.scheduled += 1;
        drop(state);
        self.shared.work_ready.notify_all();

        debug!(
            job_id = %handle.id(),
            job = %handle.name(),
            rule = ?handle.rule(),
            delay_ms = delay.as_millis() as u64,
            "job scheduled"
        );
        handle
    }

    /// Cancel a job.
    ///
    /// A waiting job becomes `Canceled` immediately and its listeners run on the
    /// calling thread. A running job only has its token canceled; the body
    /// decides when to stop. Returns false if the job was already terminal.
    pub fn cancel(&self, job: &JobHandle) -> bool {
        let (removed, listeners) = {
            let mut state = lock(&self.shared.state);
            match job.state() {
                JobState::Waiting => {
                    let removed = state
                        .waiting
                        .iter()
                        .position(|queued| queued.handle == *job)
                        .map(|index| state.waiting.remove(index));
                    job.shared().token.cancel();
                    let listeners = job.shared().complete(JobOutcome::Canceled);
                    state.stats.canceled += 1;
                    self.shared.work_ready.notify_all();
                    self.shared.job_finished.notify_all();
                    (removed, listeners)
                }
                JobState::Running => {
                    job.shared().token.cancel();
                    debug!(job_id = %job.id(), job = %job.name(), "cancellation requested");
                    return true;
                }
                _ => return false,
            }
        };
        // The body may own values with arbitrary drop logic; drop it unlocked.
        drop(removed);
        debug!(job_id = %job.id(), job = %job.name(), "job canceled before start");
        run_listeners(listeners.unwrap_or_default());
        true
    }

    /// Cancel every waiting or running job in a family. Returns how many were hit.
    pub fn cancel_family(&self, family: &FamilyToken) -> usize {
        self.find(family)
            .iter()
            .filter(|job| self.cancel(job))
            .count()
    }

    /// Waiting and running jobs belonging to `family`.
    pub fn find(&self, family: &FamilyToken) -> Vec<JobHandle> {
        lock(&self.shared.state)
            .active()
            .filter(|job| job.belongs_to(family))
            .cloned()
            .collect()
    }

    /// Block until `job` is terminal, `timeout` elapses or `token` is canceled.
    ///
    /// Timing out or abandoning the wait leaves the job untouched. Fails
    /// immediately with [`JobError::Deadlock`] when the wait can never finish.
    pub fn join(
        &self,
        job: &JobHandle,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> JobResult<JobOutcome> {
        if let Some(outcome) = job.outcome() {
            return Ok(outcome);
        }
        DeadlockDetector::check_join(self.current_job_here().as_ref(), job)?;
        job.shared()
            .wait_terminal(timeout, token, self.shared.config.poll_interval())
    }

    /// Block until no job of `family` is waiting or running.
    ///
    /// Called from inside a job, the calling job is not waited for.
    pub fn wait_for_family(&self, family: &FamilyToken) -> JobResult<()> {
        self.wait_for_family_with(family, None, None)
    }

    pub fn wait_for_family_with(
        &self,
        family: &FamilyToken,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> JobResult<()> {
        let current = self.current_job_here();
        let deadline = timeout.and_then(deadline_after);
        let poll = self.shared.config.poll_interval();

        let mut state = lock(&self.shared.state);
        loop {
            let members: Vec<JobHandle> = state
                .active()
                .filter(|job| job.belongs_to(family))
                .filter(|job| current.as_ref() != Some(*job))
                .cloned()
                .collect();
            if members.is_empty() {
                return Ok(());
            }
            DeadlockDetector::check_family(current.as_ref(), &members)?;
            if token.is_some_and(CancellationToken::is_canceled) {
                return Err(JobError::wait_abandoned(family.to_string()));
            }
            let mut slice = poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(JobError::timed_out(
                        family.to_string(),
                        timeout.unwrap_or_default(),
                    ));
                }
                slice = slice.min(deadline - now);
            }
            state = wait_timeout(&self.shared.job_finished, state, slice);
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = lock(&self.shared.state);
        SchedulerStats {
            waiting: state.waiting.len(),
            running: state.running.len(),
            uptime_secs: self.shared.started.elapsed().as_secs(),
            ..state.stats.clone()
        }
    }

    /// Stop accepting jobs, cancel waiting ones, flag running ones and wait for
    /// the workers to exit. Jobs scheduled afterwards come back `Canceled`.
    pub fn shutdown(&self) {
        let (drained, listeners) = {
            let mut state = lock(&self.shared.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;

            let drained: Vec<QueuedJob> = state.waiting.drain(..).collect();
            let mut listeners = Vec::new();
            for queued in &drained {
                queued.handle.shared().token.cancel();
                if let Some(pending) = queued.handle.shared().complete(JobOutcome::Canceled) {
                    listeners.extend(pending);
                }
                state.stats.canceled += 1;
            }
            for running in state.running.values() {
                running.shared().token.cancel();
            }
            self.shared.work_ready.notify_all();
            self.shared.job_finished.notify_all();
            (drained, listeners)
        };
        drop(drained);
        run_listeners(listeners);

        let workers = std::mem::take(&mut *lock(&self.shared.workers));
        let me = thread::current().id();
        for worker in workers {
            // A job body may shut its own scheduler down.
            if worker.thread().id() == me {
                continue;
            }
            if worker.join().is_err() {
                error!(scheduler = %self.shared.config.name, "worker thread panicked");
            }
        }
        info!(scheduler = %self.shared.config.name, "job scheduler stopped");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.config.name)
            .field("workers", &self.shared.config.workers)
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: Arc<SchedulerShared>, index: usize) {
    debug!(scheduler = %shared.config.name, worker = index, "worker started");
    while let Some(queued) = next_job(&shared) {
        run_job(&shared, queued);
    }
    debug!(scheduler = %shared.config.name, worker = index, "worker stopped");
}

/// Claim the next runnable job, sleeping while none is due. `None` on shutdown.
fn next_job(shared: &SchedulerShared) -> Option<QueuedJob> {
    let poll = shared.config.poll_interval();
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            return None;
        }
        let now = Instant::now();
        if let Some(index) = state.next_runnable(now) {
            let queued = state.waiting.remove(index);
            if queued.handle.shared().mark_running() {
                state
                    .running
                    .insert(queued.handle.id(), queued.handle.clone());
                state.stats.started += 1;
                return Some(queued);
            }
            continue;
        }
        let sleep = state
            .next_due(now)
            .map_or(poll, |due| (due - now).min(poll));
        state = wait_timeout(&shared.work_ready, state, sleep);
    }
}

fn run_job(shared: &Arc<SchedulerShared>, queued: QueuedJob) {
    let QueuedJob { handle, body, .. } = queued;
    let ctx = JobContext::new(handle.clone(), Some(Scheduler::from_shared(Arc::clone(shared))));
    debug!(job_id = %handle.id(), job = %handle.name(), "job started");

    let outcome = {
        let _current = CurrentJobGuard::enter(handle.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(err)) if is_cancellation(&err) => JobOutcome::Canceled,
            Ok(Err(err)) => JobOutcome::Failed(Arc::new(err)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(job_id = %handle.id(), job = %handle.name(), panic = %message, "job panicked");
                JobOutcome::Failed(Arc::new(anyhow!("job panicked: {message}")))
            }
        }
    };
    drop(ctx);

    match &outcome {
        JobOutcome::Succeeded => debug!(job_id = %handle.id(), job = %handle.name(), "job succeeded"),
        JobOutcome::Canceled => debug!(job_id = %handle.id(), job = %handle.name(), "job canceled"),
        JobOutcome::Failed(err) => {
            let error = format!("{err:#}");
            warn!(job_id = %handle.id(), job = %handle.name(), error = %error, "job failed")
        }
    }

    let listeners = {
        let mut state = lock(&shared.state);
        state.running.remove(&handle.id());
        state.record(&outcome);
        let listeners = handle.shared().complete(outcome);
        shared.work_ready.notify_all();
        shared.job_finished.notify_all();
        listeners
    };
    run_listeners(listeners.unwrap_or_default());
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<OperationCanceled>())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_listeners(listeners: Vec<Listener>) {
    for listener in listeners {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(listener)) {
            error!(panic = %panic_message(payload.as_ref()), "completion listener panicked");
        }
    }
}
