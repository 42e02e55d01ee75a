//! Ambient cancellation + metadata context threaded through the pipeline.
//!
//! spec.md §9 calls out the source's use of thread-local-like scoped maps
//! attached to cancellation tokens, and asks for an explicit replacement:
//! a `Context` value carrying (a) a cancellation signal and (b) typed
//! key-value metadata, where linked child contexts inherit parent metadata
//! but cancel independently. This is that value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util_shim::CancellationToken;

/// Admission class used by `GlobalOperationLimiter` (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Queue,
    HealthCheck,
    Streaming,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Queue => "queue",
            OperationKind::HealthCheck => "health_check",
            OperationKind::Streaming => "streaming",
        }
    }
}

/// Metadata carried alongside a `Context`'s cancellation signal.
///
/// Cloning a `Context` for a child operation copies the metadata snapshot
/// (so a child sees its parent's `preferred_provider`, say) but creates an
/// independent cancellation child token, matching spec.md §5's "cancelling
/// a child MUST NOT cancel peers".
#[derive(Debug, Default, Clone)]
struct Metadata {
    kind: Option<OperationKind>,
    preferred_provider: Option<usize>,
    fields: HashMap<&'static str, String>,
}

/// Ambient context threaded through pool acquisition, provider selection
/// and segment fetch calls.
#[derive(Clone)]
pub struct Context {
    token: CancellationToken,
    meta: Arc<RwLock<Metadata>>,
}

impl Context {
    /// A fresh root context with no cancellation parent.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
            meta: Arc::new(RwLock::new(Metadata::default())),
        }
    }

    /// A child whose cancellation is independent of `self`: cancelling the
    /// child never cancels `self`, but cancelling `self` cancels the child
    /// (a normal tree), matching the straggler monitor's need to cancel one
    /// in-flight attempt without disturbing its siblings.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            meta: Arc::new(RwLock::new(self.meta.read().unwrap().clone())),
        }
    }

    pub fn with_kind(self, kind: OperationKind) -> Self {
        self.meta.write().unwrap().kind = Some(kind);
        self
    }

    pub fn kind(&self) -> Option<OperationKind> {
        self.meta.read().unwrap().kind
    }

    pub fn set_preferred_provider(&self, index: usize) {
        self.meta.write().unwrap().preferred_provider = Some(index);
    }

    pub fn preferred_provider(&self) -> Option<usize> {
        self.meta.read().unwrap().preferred_provider
    }

    pub fn set_field(&self, key: &'static str, value: impl Into<String>) {
        self.meta.write().unwrap().fields.insert(key, value.into());
    }

    pub fn field(&self, key: &'static str) -> Option<String> {
        self.meta.read().unwrap().fields.get(key).cloned()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// A value that accepts a list of cancel-hooks and runs all of them on
/// close, swallowing per-hook panics/errors, generalizing the source's
/// composition of multiple disposable scopes (spec.md §9).
#[derive(Default)]
pub struct DisposableScope {
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl DisposableScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_close(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Runs every registered hook exactly once, in registration order,
    /// catching panics so one misbehaving hook cannot skip the rest.
    pub fn close(mut self) {
        for hook in self.hooks.drain(..) {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
        }
    }
}

impl Drop for DisposableScope {
    fn drop(&mut self) {
        for hook in self.hooks.drain(..) {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
        }
    }
}

/// Minimal cancellation-token shim so the crate does not need a dependency
/// solely for a child-token tree; `tokio::sync::Notify` + an atomic flag
/// gives the same "cancel tree" semantics `tokio_util::sync::CancellationToken`
/// provides, without adding `tokio-util` back as a dependency (it was
/// dropped — see DESIGN.md — once the teacher's pipelined-codec use of it
/// no longer applied).
mod tokio_util_shim {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Clone)]
    pub struct CancellationToken {
        inner: Arc<Inner>,
    }

    struct Inner {
        cancelled: AtomicBool,
        notify: Notify,
        parent: Option<Arc<Inner>>,
    }

    impl CancellationToken {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Inner {
                    cancelled: AtomicBool::new(false),
                    notify: Notify::new(),
                    parent: None,
                }),
            }
        }

        pub fn child_token(&self) -> Self {
            Self {
                inner: Arc::new(Inner {
                    cancelled: AtomicBool::new(false),
                    notify: Notify::new(),
                    parent: Some(self.inner.clone()),
                }),
            }
        }

        pub fn cancel(&self) {
            if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
                self.inner.notify.notify_waiters();
            }
        }

        pub fn is_cancelled(&self) -> bool {
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            match &self.inner.parent {
                Some(parent) => Self::parent_cancelled(parent),
                None => false,
            }
        }

        fn parent_cancelled(inner: &Arc<Inner>) -> bool {
            if inner.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            match &inner.parent {
                Some(parent) => Self::parent_cancelled(parent),
                None => false,
            }
        }

        pub async fn cancelled(&self) {
            loop {
                if self.is_cancelled() {
                    return;
                }
                let notified = self.inner.notify.notified();
                if self.is_cancelled() {
                    return;
                }
                notified.await;
            }
        }
    }

    impl Default for CancellationToken {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_metadata_snapshot() {
        let root = Context::root().with_kind(OperationKind::Streaming);
        root.set_preferred_provider(2);
        let child = root.child();
        assert_eq!(child.kind(), Some(OperationKind::Streaming));
        assert_eq!(child.preferred_provider(), Some(2));
    }

    #[test]
    fn cancelling_child_does_not_cancel_parent() {
        let root = Context::root();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let root = Context::root();
        let child = root.child();
        root.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let ctx = Context::root();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        ctx.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn disposable_scope_runs_all_hooks() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut scope = DisposableScope::new();
        for _ in 0..3 {
            let count = count.clone();
            scope.on_close(move || {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        scope.close();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn disposable_scope_swallows_hook_panics() {
        let ran_second = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut scope = DisposableScope::new();
        scope.on_close(|| panic!("boom"));
        let flag = ran_second.clone();
        scope.on_close(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
        scope.close();
        assert!(ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }
}
