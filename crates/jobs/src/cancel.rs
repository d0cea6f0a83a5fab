//! Cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::OperationCanceled;
use crate::sync::lock;

/// Thread-safe cancel flag shared between a job and whoever may cancel it.
///
/// Canceling a token cancels every token derived from it with
/// [`child_token`](Self::child_token). Canceling a child never affects its parent.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    canceled: AtomicBool,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is canceled whenever this one is.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        {
            let mut children = lock(&self.inner.children);
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // Covers a cancel that drained the children list just before our push.
        if self.is_canceled() {
            child.cancel();
        }
        child
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = std::mem::take(&mut *lock(&self.inner.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            CancellationToken { inner: child }.cancel();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// `Err(OperationCanceled)` once canceled; meant for `?` at safe points.
    pub fn check(&self) -> Result<(), OperationCanceled> {
        if self.is_canceled() {
            Err(OperationCanceled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_children_not_parents() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let grandchild = child.child_token();

        child.cancel();
        assert!(!parent.is_canceled());
        assert!(grandchild.is_canceled());

        let sibling = parent.child_token();
        parent.cancel();
        assert!(sibling.is_canceled());
    }

    #[test]
    fn child_of_canceled_token_starts_canceled() {
        let parent = CancellationToken::new();
        parent.cancel();
        assert!(parent.child_token().is_canceled());
    }

    #[test]
    fn check_reports_operation_canceled() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert_eq!(token.check(), Err(OperationCanceled));
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_canceled());
    }
}
