//! Cancellation-aware execution contexts.
//!
//! Every fiber (root or spawned) carries a [`Context`], a node in a tree
//! rooted at the one installed by [`crate::runtime::start`]. A context may
//! introduce its own cancel source ([`with_cancel`]) or mark itself as
//! background ([`with_background`]) so it stops counting toward the
//! scheduler's keepalive. Cancelling a source cancels every descendant
//! context transitively: contexts that don't introduce their own source
//! just share the parent's `Rc<CancelSource>` by reference, so they observe
//! the cancellation the instant a sibling calls `cancel`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::SharedError;
use crate::runtime::queue::{IntrusiveQueue, Key};

/// A node in the cancellation/keepalive tree.
///
/// Cheap to clone: it's a reference-counted handle, matching every other
/// shared-state type in this crate.
#[derive(Clone)]
pub struct Context(Rc<Inner>);

struct Inner {
    #[allow(dead_code)] // kept for completeness / future ancestor walks
    parent: Option<Context>,
    background: bool,
    cancel: Option<Rc<CancelSource>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("background", &self.0.background)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

type Hook = Box<dyn FnOnce(&SharedError)>;

struct CancelSource {
    error: RefCell<Option<SharedError>>,
    hooks: RefCell<IntrusiveQueue<Hook>>,
    children: RefCell<Vec<Weak<CancelSource>>>,
}

impl CancelSource {
    fn new() -> Rc<Self> {
        Rc::new(CancelSource {
            error: RefCell::new(None),
            hooks: RefCell::new(IntrusiveQueue::new()),
            children: RefCell::new(Vec::new()),
        })
    }

    fn cancel(self: &Rc<Self>, error: SharedError) {
        if self.error.borrow().is_some() {
            return; // already cancelled, hooks already fired
        }
        *self.error.borrow_mut() = Some(error.clone());

        for hook in self.hooks.borrow_mut().drain() {
            hook(&error);
        }

        for child in self.children.borrow_mut().drain(..) {
            if let Some(child) = child.upgrade() {
                child.cancel(error.clone());
            }
        }
    }
}

/// A handle to a registered cancellation hook, returned by [`register`].
///
/// Drop this (or call [`detach`](Self::detach)) once the operation it
/// guards has settled by some other means, so the hook doesn't fire late
/// against already-released state.
#[must_use]
pub struct CancelHookHandle {
    source: Rc<CancelSource>,
    key: Key,
}

impl CancelHookHandle {
    /// Removes the hook without running it.
    pub fn detach(self) {
        let _ = self.source.hooks.borrow_mut().detach(self.key);
    }
}

/// The capability to cancel a [`Context`] created via [`with_cancel`].
pub struct CancelHandle(Rc<CancelSource>);

impl CancelHandle {
    /// Cancels the context (and, transitively, every descendant context
    /// that shares or extends its cancel source) with `error`.
    ///
    /// A no-op if already cancelled — the first caller's error wins.
    pub fn cancel(&self, error: SharedError) {
        self.0.cancel(error);
    }
}

impl Context {
    /// The context installed for the root fiber of a fresh runtime: not
    /// cancellable, not background.
    pub(crate) fn root() -> Self {
        Context(Rc::new(Inner {
            parent: None,
            background: false,
            cancel: None,
        }))
    }

    /// Whether a task running in this context should count toward the
    /// scheduler's keepalive.
    pub fn is_background(&self) -> bool {
        self.0.background
    }

    /// Whether this context (or an ancestor it shares a cancel source
    /// with) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_error().is_some()
    }

    /// The error a cancellation was raised with, if any.
    pub fn cancel_error(&self) -> Option<SharedError> {
        self.0.cancel.as_ref()?.error.borrow().clone()
    }

    /// Enqueues `hook` on the nearest ancestor (including `self`) that has
    /// its own cancel source. Returns `None` if no ancestor in the chain
    /// was ever created with [`with_cancel`] — there's nothing to cancel,
    /// so the hook can never fire and isn't retained.
    ///
    /// If that source is already cancelled, `hook` runs synchronously and
    /// immediately, and `None` is returned (nothing left to detach).
    pub fn register(&self, hook: impl FnOnce(&SharedError) + 'static) -> Option<CancelHookHandle> {
        let source = self.0.cancel.clone()?;

        if let Some(error) = source.error.borrow().clone() {
            hook(&error);
            return None;
        }

        let key = source.hooks.borrow_mut().enqueue(Box::new(hook));
        Some(CancelHookHandle { source, key })
    }
}

/// Creates a child context with its own cancel source, plus the handle
/// needed to cancel it. Cancelling `parent` (or any ancestor) still
/// cancels this child.
pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
    let source = CancelSource::new();

    if let Some(parent_source) = &parent.0.cancel {
        parent_source
            .children
            .borrow_mut()
            .push(Rc::downgrade(&source));

        // parent may already be cancelled by the time we link in
        if let Some(error) = parent_source.error.borrow().clone() {
            source.cancel(error);
        }
    }

    let child = Context(Rc::new(Inner {
        parent: Some(parent.clone()),
        background: parent.0.background,
        cancel: Some(Rc::clone(&source)),
    }));

    (child, CancelHandle(source))
}

/// Creates a child context marked background: tasks running in it don't
/// keep [`crate::runtime::start`] running by themselves. Shares the
/// parent's cancel source directly (no new one is introduced).
pub fn with_background(parent: &Context) -> Context {
    Context(Rc::new(Inner {
        parent: Some(parent.clone()),
        background: true,
        cancel: parent.0.cancel.clone(),
    }))
}

/// Returns the context bound to the currently running task.
pub fn current() -> Context {
    crate::runtime::current_context()
}

/// Installs `ctx` as current for the duration of `f`, restoring the
/// previous context on return — including on unwind, via a scope guard.
pub fn run<T>(ctx: &Context, f: impl FnOnce() -> T) -> T {
    struct Restore(Option<Context>);
    impl Drop for Restore {
        fn drop(&mut self) {
            crate::runtime::set_current_context(self.0.take().unwrap());
        }
    }

    let previous = crate::runtime::set_current_context(ctx.clone());
    let _restore = Restore(Some(previous));
    f()
}

/// Enqueues a cancellation hook on the current task's context. See
/// [`Context::register`].
pub fn register(hook: impl FnOnce(&SharedError) + 'static) -> Option<CancelHookHandle> {
    current().register(hook)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_not_cancelled_or_background() {
        let root = Context::root();
        assert!(!root.is_cancelled());
        assert!(!root.is_background());
    }

    #[test]
    fn with_background_inherits_cancel_source() {
        let root = Context::root();
        let (cancellable, cancel) = with_cancel(&root);
        let background = with_background(&cancellable);

        assert!(background.is_background());
        assert!(!background.is_cancelled());

        cancel.cancel(SharedError::new(std::io::Error::other("stop")));
        assert!(background.is_cancelled());
    }

    #[test]
    fn cancel_propagates_to_grandchildren() {
        let root = Context::root();
        let (child, cancel) = with_cancel(&root);
        let (grandchild, _inner_cancel) = with_cancel(&child);

        cancel.cancel(SharedError::new(std::io::Error::other("stop")));

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn second_cancel_keeps_first_error() {
        let root = Context::root();
        let (_child, cancel) = with_cancel(&root);

        cancel.cancel(SharedError::new(std::io::Error::other("first")));
        cancel.cancel(SharedError::new(std::io::Error::other("second")));

        let error = _child.cancel_error().unwrap();
        assert_eq!(error.to_string(), "first");
    }

    #[test]
    fn register_on_uncancellable_context_is_noop() {
        let root = Context::root();
        let fired = Rc::new(RefCell::new(false));

        let handle = {
            let fired = fired.clone();
            root.register(move |_| *fired.borrow_mut() = true)
        };

        assert!(handle.is_none());
        assert!(!*fired.borrow());
    }

    #[test]
    fn register_after_cancel_fires_immediately() {
        let root = Context::root();
        let (child, cancel) = with_cancel(&root);
        cancel.cancel(SharedError::new(std::io::Error::other("stop")));

        let fired = Rc::new(RefCell::new(false));
        let handle = {
            let fired = fired.clone();
            child.register(move |_| *fired.borrow_mut() = true)
        };

        assert!(handle.is_none());
        assert!(*fired.borrow());
    }

    #[test]
    fn hooks_fire_in_enqueue_order() {
        let root = Context::root();
        let (child, cancel) = with_cancel(&root);
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            child.register(move |_| order.borrow_mut().push(i)).unwrap();
        }

        cancel.cancel(SharedError::new(std::io::Error::other("stop")));
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn detached_hook_never_fires() {
        let root = Context::root();
        let (child, cancel) = with_cancel(&root);
        let fired = Rc::new(RefCell::new(false));

        let handle = {
            let fired = fired.clone();
            child.register(move |_| *fired.borrow_mut() = true).unwrap()
        };
        handle.detach();

        cancel.cancel(SharedError::new(std::io::Error::other("stop")));
        assert!(!*fired.borrow());
    }
}
