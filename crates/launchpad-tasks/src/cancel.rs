//! Cooperative cancellation tokens
//!
//! A [`CancelToken`] is a one-way flag: once set it stays set. Setting it
//! runs every registered interrupt action once and then cancels attached
//! child tokens depth-first, which is how cancellation of a composed task
//! reaches the tasks it owns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

use crate::lock;

type InterruptAction = Box<dyn FnOnce() + Send>;

/// One-way cancellation flag with interrupt actions and child fan-out
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    token: CancellationToken,
    actions: Mutex<Vec<InterruptAction>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        Inner::cancel(&self.inner);
    }

    /// Register an interrupt action.
    ///
    /// Runs at most once, on the thread that calls [`cancel`](Self::cancel),
    /// or immediately if the token is already cancelled.
    pub fn on_cancel(&self, action: impl FnOnce() + Send + 'static) {
        let mut actions = lock(&self.inner.actions);
        if self.is_cancelled() {
            drop(actions);
            action();
        } else {
            actions.push(Box::new(action));
        }
    }

    /// Make `child` follow this token: cancelling `self` cancels `child`.
    ///
    /// Attaching to an already cancelled token cancels the child at once.
    pub fn attach_child(&self, child: &CancelToken) {
        if Arc::ptr_eq(&self.inner, &child.inner) {
            return;
        }
        let mut children = lock(&self.inner.children);
        if self.is_cancelled() {
            drop(children);
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
    }

    /// Create a new token attached as a child of this one
    pub fn child_token(&self) -> CancelToken {
        let child = CancelToken::new();
        self.attach_child(&child);
        child
    }
}

impl Inner {
    fn cancel(this: &Arc<Inner>) {
        if this.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        this.token.cancel();

        let actions = std::mem::take(&mut *lock(&this.actions));
        for action in actions {
            action();
        }

        let children = std::mem::take(&mut *lock(&this.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            Inner::cancel(&child);
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_is_one_way_and_idempotent() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_action_registered_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        token.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_propagates_depth_first() {
        let root = CancelToken::new();
        let middle = root.child_token();
        let leaf = middle.child_token();
        let sibling = CancelToken::new();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, token) in [("root", &root), ("middle", &middle), ("leaf", &leaf)] {
            let order = order.clone();
            token.on_cancel(move || order.lock().unwrap().push(name));
        }

        root.cancel();
        assert!(middle.is_cancelled());
        assert!(leaf.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert_eq!(*order.lock().unwrap(), vec!["root", "middle", "leaf"]);
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_attach_to_cancelled_parent() {
        let parent = CancelToken::new();
        parent.cancel();
        let child = CancelToken::new();
        parent.attach_child(&child);
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        handle.await.unwrap();
    }
}
