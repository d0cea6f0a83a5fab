//! Registry of working copies owned by one job tree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use forgegen_core::{JobId, JobTreeId, ManagerId};
use forgegen_jobs::JobContext;

use crate::error::{WorkingCopyError, WorkingCopyResult};
use crate::lock;
use crate::resource::{ResourceId, WorkingCopy};

/// Manager lifecycle: `Uninitialized -> Open -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    Open,
    Closed,
}

struct Registration {
    copy: Arc<dyn WorkingCopy>,
    owner: JobId,
    registered_at: DateTime<Utc>,
}

struct Registry {
    phase: ManagerState,
    registrations: BTreeMap<ResourceId, Registration>,
}

struct ManagerInner {
    id: ManagerId,
    tree: JobTreeId,
    /// Serializes commits and close. Taken before `registry`.
    commit_lock: Mutex<()>,
    registry: Mutex<Registry>,
    checkpoints: AtomicU64,
}

/// Working copies registered by the jobs of one job tree.
///
/// Every mutating call takes the caller's [`JobContext`] and fails with
/// `ManagerClosed` after close, `ForeignJobTree` from another tree and
/// `Canceled` once the caller's job is canceled, checked in that order.
/// Cloning shares the registry, so sibling jobs of the tree may checkpoint
/// concurrently.
#[derive(Clone)]
pub struct WorkingCopyManager {
    inner: Arc<ManagerInner>,
}

impl WorkingCopyManager {
    pub(crate) fn new(tree: JobTreeId) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                id: ManagerId::new(),
                tree,
                commit_lock: Mutex::new(()),
                registry: Mutex::new(Registry {
                    phase: ManagerState::Uninitialized,
                    registrations: BTreeMap::new(),
                }),
                checkpoints: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn open(&self) {
        let mut registry = lock(&self.inner.registry);
        if registry.phase == ManagerState::Uninitialized {
            registry.phase = ManagerState::Open;
            debug!(manager = %self.inner.id, tree = %self.inner.tree, "working copy manager opened");
        }
    }

    /// Discard every unreconciled edit and refuse further changes.
    pub(crate) fn close(&self) {
        let _commits = lock(&self.inner.commit_lock);
        let drained = {
            let mut registry = lock(&self.inner.registry);
            if registry.phase == ManagerState::Closed {
                return;
            }
            registry.phase = ManagerState::Closed;
            std::mem::take(&mut registry.registrations)
        };
        let mut discarded = 0usize;
        for registration in drained.values() {
            if registration.copy.is_dirty() {
                registration.copy.discard();
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!(
                manager = %self.inner.id,
                discarded,
                "closing working copy manager with unsaved edits"
            );
        }
        info!(
            manager = %self.inner.id,
            tree = %self.inner.tree,
            checkpoints = self.checkpoints(),
            "working copy manager closed"
        );
    }

    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    pub fn tree_id(&self) -> JobTreeId {
        self.inner.tree
    }

    pub fn state(&self) -> ManagerState {
        lock(&self.inner.registry).phase
    }

    pub fn is_open(&self) -> bool {
        self.state() == ManagerState::Open
    }

    /// Number of registered working copies.
    pub fn size(&self) -> usize {
        lock(&self.inner.registry).registrations.len()
    }

    /// Completed checkpoints since the manager opened.
    pub fn checkpoints(&self) -> u64 {
        self.inner.checkpoints.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, resource: &ResourceId) -> bool {
        lock(&self.inner.registry)
            .registrations
            .contains_key(resource)
    }

    /// Registered resources in identity order.
    pub fn resources(&self) -> Vec<ResourceId> {
        lock(&self.inner.registry)
            .registrations
            .keys()
            .cloned()
            .collect()
    }

    /// The job that registered `resource` and when.
    pub fn owner_of(&self, resource: &ResourceId) -> Option<(JobId, DateTime<Utc>)> {
        lock(&self.inner.registry)
            .registrations
            .get(resource)
            .map(|registration| (registration.owner, registration.registered_at))
    }

    /// Lock the registry after checking it accepts changes from `ctx`.
    fn guarded(&self, ctx: &JobContext) -> WorkingCopyResult<MutexGuard<'_, Registry>> {
        let registry = lock(&self.inner.registry);
        if registry.phase != ManagerState::Open {
            return Err(WorkingCopyError::ManagerClosed {
                manager: self.inner.id,
            });
        }
        if ctx.tree_id() != self.inner.tree {
            return Err(WorkingCopyError::ForeignJobTree {
                manager: self.inner.id,
                owner: self.inner.tree,
                caller: ctx.tree_id(),
            });
        }
        ctx.check_canceled()?;
        Ok(registry)
    }

    /// Register a working copy. Returns false if its resource was already
    /// registered; the earlier registration is kept.
    pub fn register<C>(&self, copy: C, ctx: &JobContext) -> WorkingCopyResult<bool>
    where
        C: WorkingCopy + 'static,
    {
        let mut registry = self.guarded(ctx)?;
        let resource = copy.resource().clone();
        if registry.registrations.contains_key(&resource) {
            return Ok(false);
        }
        debug!(manager = %self.inner.id, resource = %resource, job = %ctx.name(), "working copy registered");
        registry.registrations.insert(
            resource,
            Registration {
                copy: Arc::new(copy),
                owner: ctx.job_id(),
                registered_at: Utc::now(),
            },
        );
        Ok(true)
    }

    /// Commit every dirty working copy. Returns whether anything was written.
    ///
    /// Stops at the first failing commit; copies committed before it stay
    /// committed.
    pub fn checkpoint(&self, ctx: &JobContext) -> WorkingCopyResult<bool> {
        let _commits = lock(&self.inner.commit_lock);
        let dirty: Vec<Arc<dyn WorkingCopy>> = self
            .guarded(ctx)?
            .registrations
            .values()
            .filter(|registration| registration.copy.is_dirty())
            .map(|registration| Arc::clone(&registration.copy))
            .collect();

        for copy in &dirty {
            ctx.check_canceled()?;
            commit(copy.as_ref())?;
        }
        let number = self.inner.checkpoints.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            manager = %self.inner.id,
            checkpoint = number,
            committed = dirty.len(),
            "checkpoint complete"
        );
        Ok(!dirty.is_empty())
    }

    /// Commit the pending edits of one registration. Returns whether anything
    /// was written.
    pub fn reconcile(&self, resource: &ResourceId, ctx: &JobContext) -> WorkingCopyResult<bool> {
        let _commits = lock(&self.inner.commit_lock);
        let copy = self
            .guarded(ctx)?
            .registrations
            .get(resource)
            .map(|registration| Arc::clone(&registration.copy))
            .ok_or_else(|| WorkingCopyError::NotRegistered {
                manager: self.inner.id,
                resource: resource.clone(),
            })?;
        if !copy.is_dirty() {
            return Ok(false);
        }
        commit(copy.as_ref())?;
        Ok(true)
    }

    /// Commit (`save`) or discard every registration, then forget them all.
    ///
    /// With `save`, a failed commit is discarded too and the first failure is
    /// returned after the registry is cleared. Returns how many were released.
    pub fn unregister_all(&self, save: bool, ctx: &JobContext) -> WorkingCopyResult<usize> {
        let _commits = lock(&self.inner.commit_lock);
        let drained = std::mem::take(&mut self.guarded(ctx)?.registrations);

        let mut first_failure = None;
        for registration in drained.values() {
            if !save {
                registration.copy.discard();
                continue;
            }
            if let Err(err) = commit(registration.copy.as_ref()) {
                registration.copy.discard();
                first_failure.get_or_insert(err);
            }
        }
        debug!(manager = %self.inner.id, released = drained.len(), save, "working copies unregistered");
        match first_failure {
            Some(err) => Err(err),
            None => Ok(drained.len()),
        }
    }
}

fn commit(copy: &dyn WorkingCopy) -> WorkingCopyResult<()> {
    copy.commit().map_err(|cause| {
        let error = format!("{cause:#}");
        warn!(resource = %copy.resource(), error = %error, "working copy commit failed");
        WorkingCopyError::commit(copy.resource().clone(), cause)
    })
}

impl fmt::Debug for WorkingCopyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingCopyManager")
            .field("id", &self.inner.id)
            .field("tree", &self.inner.tree)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}
