//! Jobs: named units of work and the handles that track them once scheduled.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgegen_core::{CoreResult, FamilyToken, JobId, JobTreeId};

use crate::cancel::CancellationToken;
use crate::context::JobContext;
use crate::error::{JobError, JobResult};
use crate::rule::Rule;
use crate::scheduler::{Scheduler, SchedulerShared};
use crate::sync::{deadline_after, lock, wait_timeout};

/// Body of a job. Runs once on a worker thread.
pub type JobBody = Box<dyn FnOnce(&JobContext) -> anyhow::Result<()> + Send + 'static>;

pub(crate) type Listener = Box<dyn FnOnce() + Send + 'static>;

/// Job lifecycle state.
///
/// Transitions: `Waiting -> Running -> {Succeeded, Failed, Canceled}` and
/// `Waiting -> Canceled`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued; not started (possibly delayed or blocked by a rule)
    Waiting,
    /// Body is executing on a worker
    Running,
    /// Canceled before start, or body stopped voluntarily
    Canceled,
    /// Body returned `Ok`
    Succeeded,
    /// Body returned an error or panicked
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Canceled | JobState::Succeeded | JobState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Canceled => "canceled",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded,
    Failed(Arc<anyhow::Error>),
    Canceled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Canceled => JobState::Canceled,
        }
    }

    /// The outcome as seen by a consumer asking for the job's result.
    pub fn into_result(self, job: &str) -> JobResult<()> {
        match self {
            JobOutcome::Succeeded => Ok(()),
            JobOutcome::Failed(cause) => Err(JobError::failed_shared(job, cause)),
            JobOutcome::Canceled => Err(JobError::canceled(job)),
        }
    }
}

/// Progress reported by a running body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub task: Option<String>,
    pub subtask: Option<String>,
    /// Total units of work, if known
    pub total: Option<u64>,
    pub worked: u64,
}

impl Progress {
    /// Completed fraction in [0, 1], if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.worked as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Everything about a job except its body.
#[derive(Debug, Clone)]
pub(crate) struct JobSpec {
    pub(crate) id: JobId,
    pub(crate) name: String,
    pub(crate) rule: Option<Rule>,
    pub(crate) families: Vec<FamilyToken>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) origin: Arc<Backtrace>,
}

impl JobSpec {
    pub(crate) fn validate(&self) -> CoreResult<()> {
        for family in &self.families {
            family.validate_membership()?;
        }
        if let Some(rule) = &self.rule {
            rule.validate()?;
        }
        Ok(())
    }
}

/// A named unit of work, built before scheduling.
///
/// ```ignore
/// let job = Job::new("generate-model", |ctx| {
///     ctx.check_canceled()?;
///     Ok(())
/// })
/// .with_rule(Rule::resource("/demo/src-gen"))
/// .in_family("codegen");
/// ```
pub struct Job {
    spec: JobSpec,
    body: JobBody,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&JobContext) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            spec: JobSpec {
                id: JobId::new(),
                name: name.into(),
                rule: None,
                families: Vec::new(),
                created_at: Utc::now(),
                origin: Arc::new(Backtrace::capture()),
            },
            body: Box::new(body),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.spec.rule = Some(rule);
        self
    }

    /// Add a family membership. A job may belong to several families.
    pub fn in_family(mut self, family: impl Into<FamilyToken>) -> Self {
        let family = family.into();
        if !self.spec.families.contains(&family) {
            self.spec.families.push(family);
        }
        self
    }

    pub fn id(&self) -> JobId {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn rule(&self) -> Option<&Rule> {
        self.spec.rule.as_ref()
    }

    pub fn families(&self) -> &[FamilyToken] {
        &self.spec.families
    }

    pub fn belongs_to(&self, query: &FamilyToken) -> bool {
        self.spec.families.iter().any(|family| query.matches(family))
    }

    pub(crate) fn into_parts(self) -> (JobSpec, JobBody) {
        (self.spec, self.body)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.spec.id)
            .field("name", &self.spec.name)
            .field("rule", &self.spec.rule)
            .field("families", &self.spec.families)
            .finish_non_exhaustive()
    }
}

/// A job whose body produces a value, collected by the [`JobFuture`](crate::JobFuture)
/// returned from [`Scheduler::submit`].
pub struct TypedJob<T> {
    job: Job,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> TypedJob<T> {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&JobContext) -> anyhow::Result<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let output = Arc::clone(&slot);
        let job = Job::new(name, move |ctx| {
            let value = body(ctx)?;
            *lock(&output) = Some(value);
            Ok(())
        });
        Self { job, slot }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.job = self.job.with_rule(rule);
        self
    }

    pub fn in_family(mut self, family: impl Into<FamilyToken>) -> Self {
        self.job = self.job.in_family(family);
        self
    }

    pub fn id(&self) -> JobId {
        self.job.id()
    }

    pub(crate) fn into_parts(self) -> (Job, Arc<Mutex<Option<T>>>) {
        (self.job, self.slot)
    }
}

struct JobStatus {
    state: JobState,
    outcome: Option<JobOutcome>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    listeners: Vec<Listener>,
}

/// Shared state behind a [`JobHandle`].
pub(crate) struct JobShared {
    pub(crate) spec: JobSpec,
    pub(crate) tree: JobTreeId,
    pub(crate) parent: Option<JobId>,
    pub(crate) token: CancellationToken,
    pub(crate) scheduler: Weak<SchedulerShared>,
    status: Mutex<JobStatus>,
    changed: Condvar,
    progress: Mutex<Progress>,
}

impl JobShared {
    pub(crate) fn new(
        spec: JobSpec,
        tree: JobTreeId,
        parent: Option<JobId>,
        token: CancellationToken,
        scheduler: Weak<SchedulerShared>,
    ) -> Self {
        Self::with_state(spec, tree, parent, token, scheduler, JobState::Waiting, None)
    }

    /// A job that never entered the queue.
    pub(crate) fn rejected(spec: JobSpec, outcome: JobOutcome) -> Self {
        let state = outcome.state();
        let shared = Self::with_state(
            spec,
            JobTreeId::new(),
            None,
            CancellationToken::new(),
            Weak::new(),
            state,
            Some(outcome),
        );
        lock(&shared.status).finished_at = Some(Utc::now());
        shared
    }

    /// A job that is already running on the calling thread.
    pub(crate) fn detached(spec: JobSpec) -> Self {
        let shared = Self::with_state(
            spec,
            JobTreeId::new(),
            None,
            CancellationToken::new(),
            Weak::new(),
            JobState::Running,
            None,
        );
        lock(&shared.status).started_at = Some(Utc::now());
        shared
    }

    fn with_state(
        spec: JobSpec,
        tree: JobTreeId,
        parent: Option<JobId>,
        token: CancellationToken,
        scheduler: Weak<SchedulerShared>,
        state: JobState,
        outcome: Option<JobOutcome>,
    ) -> Self {
        Self {
            spec,
            tree,
            parent,
            token,
            scheduler,
            status: Mutex::new(JobStatus {
                state,
                outcome,
                started_at: None,
                finished_at: None,
                listeners: Vec::new(),
            }),
            changed: Condvar::new(),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub(crate) fn state(&self) -> JobState {
        lock(&self.status).state
    }

    /// `Waiting -> Running`; false if the job is not waiting.
    pub(crate) fn mark_running(&self) -> bool {
        let mut status = lock(&self.status);
        if status.state != JobState::Waiting {
            return false;
        }
        status.state = JobState::Running;
        status.started_at = Some(Utc::now());
        self.changed.notify_all();
        true
    }

    /// Move to a terminal state and hand back the listeners to run.
    ///
    /// `None` if the job was already terminal.
    pub(crate) fn complete(&self, outcome: JobOutcome) -> Option<Vec<Listener>> {
        let mut status = lock(&self.status);
        if status.state.is_terminal() {
            return None;
        }
        debug_assert!(
            status.state == JobState::Running || matches!(outcome, JobOutcome::Canceled),
            "a waiting job can only be canceled"
        );
        status.state = outcome.state();
        status.outcome = Some(outcome);
        status.finished_at = Some(Utc::now());
        let listeners = std::mem::take(&mut status.listeners);
        self.changed.notify_all();
        Some(listeners)
    }

    /// Run `action` with the current state while the job cannot change state.
    ///
    /// Returns false without running it if the job is already terminal.
    pub(crate) fn while_active(&self, action: impl FnOnce(JobState)) -> bool {
        let status = lock(&self.status);
        if status.state.is_terminal() {
            return false;
        }
        action(status.state);
        true
    }

    /// Queue a listener; returns it back if the job is already terminal.
    pub(crate) fn on_done(&self, listener: Listener) -> Option<Listener> {
        let mut status = lock(&self.status);
        if status.state.is_terminal() {
            return Some(listener);
        }
        status.listeners.push(listener);
        None
    }

    /// Block until terminal, the timeout elapses, or `token` is canceled.
    pub(crate) fn wait_terminal(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
        poll: Duration,
    ) -> JobResult<JobOutcome> {
        let deadline = timeout.and_then(deadline_after);
        let mut status = lock(&self.status);
        loop {
            if let Some(outcome) = &status.outcome {
                return Ok(outcome.clone());
            }
            if token.is_some_and(CancellationToken::is_canceled) {
                return Err(JobError::wait_abandoned(&self.spec.name));
            }
            let mut slice = poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(JobError::timed_out(
                        &self.spec.name,
                        timeout.unwrap_or_default(),
                    ));
                }
                slice = slice.min(deadline - now);
            }
            status = wait_timeout(&self.changed, status, slice);
        }
    }

    pub(crate) fn update_progress(&self, update: impl FnOnce(&mut Progress)) {
        update(&mut lock(&self.progress));
    }
}

/// Handle to a scheduled job. Cheap to clone; all clones observe the same job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub(crate) fn from_shared(shared: Arc<JobShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &JobShared {
        &self.shared
    }

    pub fn id(&self) -> JobId {
        self.shared.spec.id
    }

    pub fn name(&self) -> &str {
        &self.shared.spec.name
    }

    pub fn rule(&self) -> Option<&Rule> {
        self.shared.spec.rule.as_ref()
    }

    pub fn families(&self) -> &[FamilyToken] {
        &self.shared.spec.families
    }

    pub fn belongs_to(&self, query: &FamilyToken) -> bool {
        self.shared
            .spec
            .families
            .iter()
            .any(|family| query.matches(family))
    }

    pub fn tree_id(&self) -> JobTreeId {
        self.shared.tree
    }

    pub fn parent_id(&self) -> Option<JobId> {
        self.shared.parent
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// True once the job is terminal.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// True once cancellation was requested, whether or not the body noticed.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.token.is_canceled()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        lock(&self.shared.status).outcome.clone()
    }

    /// The captured error of a failed or canceled job. Never blocks.
    pub fn error(&self) -> Option<JobError> {
        self.outcome()
            .and_then(|outcome| outcome.into_result(self.name()).err())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.spec.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.status).started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.status).finished_at
    }

    pub fn progress(&self) -> Progress {
        lock(&self.shared.progress).clone()
    }

    /// Where the job was created. Populated when `RUST_BACKTRACE` is set.
    pub fn origin(&self) -> &Backtrace {
        &self.shared.spec.origin
    }

    fn scheduler(&self) -> Option<Scheduler> {
        self.shared.scheduler.upgrade().map(Scheduler::from_shared)
    }

    /// Cancel this job. See [`Scheduler::cancel`].
    pub fn cancel(&self) -> bool {
        match self.scheduler() {
            Some(scheduler) => scheduler.cancel(self),
            None => {
                if self.is_done() {
                    return false;
                }
                self.shared.token.cancel();
                true
            }
        }
    }

    /// Block until terminal or until `timeout` elapses. See [`Scheduler::join`].
    pub fn join(&self, timeout: Option<Duration>) -> JobResult<JobOutcome> {
        match self.scheduler() {
            Some(scheduler) => scheduler.join(self, timeout, None),
            None => self.shared.wait_terminal(
                timeout,
                None,
                crate::config::SchedulerConfig::default().poll_interval(),
            ),
        }
    }

    /// Run `callback` once the job is terminal.
    ///
    /// Runs immediately on the calling thread if the job is already terminal;
    /// otherwise on the thread that completes the job, in registration order.
    pub fn on_done(&self, callback: impl FnOnce() + Send + 'static) {
        if let Some(callback) = self.shared.on_done(Box::new(callback)) {
            callback();
        }
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("rule", &self.rule())
            .finish()
    }
}
