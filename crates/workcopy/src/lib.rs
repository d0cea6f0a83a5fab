//! `forgegen-workcopy`: in-flight editable artifacts scoped to a job tree.
//!
//! Generation jobs edit files through [`WorkingCopy`] buffers registered with a
//! [`WorkingCopyManager`]. The manager lives exactly as long as the job tree's
//! root body ([`run_with_working_copy_manager`] / [`managed_job`]); edits are
//! committed by checkpoints or reconciliation and discarded when the tree ends
//! without saving them.

pub mod error;
pub mod manager;
pub mod resource;
pub mod scope;

pub use error::{WorkingCopyError, WorkingCopyResult};
pub use manager::{ManagerState, WorkingCopyManager};
pub use resource::{BufferedFile, ResourceId, WorkingCopy};
pub use scope::{managed_job, run_with_working_copy_manager};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, ignoring poison left by a panicked job body.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
