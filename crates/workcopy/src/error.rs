//! Working copy failures.

use thiserror::Error;

use forgegen_core::{JobTreeId, ManagerId};
use forgegen_jobs::OperationCanceled;

use crate::resource::ResourceId;

pub type WorkingCopyResult<T> = Result<T, WorkingCopyError>;

#[derive(Debug, Error)]
pub enum WorkingCopyError {
    /// The owning job tree finished; the manager accepts no more changes.
    #[error("working copy manager {manager} is closed")]
    ManagerClosed { manager: ManagerId },

    #[error("`{resource}` is not registered with working copy manager {manager}")]
    NotRegistered {
        manager: ManagerId,
        resource: ResourceId,
    },

    /// The caller runs in a different job tree than the one owning the manager.
    #[error("working copy manager {manager} belongs to job tree {owner}, caller runs in {caller}")]
    ForeignJobTree {
        manager: ManagerId,
        owner: JobTreeId,
        caller: JobTreeId,
    },

    #[error("working copy operation canceled")]
    Canceled(#[from] OperationCanceled),

    #[error("failed to commit `{resource}`: {cause:#}")]
    Commit {
        resource: ResourceId,
        cause: anyhow::Error,
    },
}

impl WorkingCopyError {
    pub fn commit(resource: ResourceId, cause: anyhow::Error) -> Self {
        Self::Commit { resource, cause }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, WorkingCopyError::ManagerClosed { .. })
    }
}
