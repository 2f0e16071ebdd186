//! Settle-once values (`Deferred`/`Awaitable`), the promise-like primitive
//! every suspending operation in this crate is built on.
//!
//! A [`Deferred<T>`] is the write side: something produces a value (or
//! gives up and fails it) exactly once. An [`Awaitable<T>`] is a cheap,
//! cloneable read side any number of fibers can [`wait`](Awaitable::wait)
//! on. Settlement is broadcast: every waiter registered at settlement time
//! observes the same result.

use std::cell::RefCell;
use std::rc::Rc;

use crate::context;
use crate::error::{DeferredDisposedError, SchedulerDisposedError, SharedError};
use crate::runtime::{self, queue::IntrusiveQueue};

struct Shared<T: 'static> {
    settlement: RefCell<Option<Result<T, SharedError>>>,
    watchers: RefCell<IntrusiveQueue<Box<dyn FnOnce(&Result<T, SharedError>)>>>,
}

impl<T: Clone + 'static> Shared<T> {
    fn new() -> Rc<Self> {
        Rc::new(Shared {
            settlement: RefCell::new(None),
            watchers: RefCell::new(IntrusiveQueue::new()),
        })
    }

    /// First call wins; later calls (including the implicit one from
    /// [`Deferred`]'s `Drop`) are no-ops.
    fn settle(&self, result: Result<T, SharedError>) {
        if self.settlement.borrow().is_some() {
            return;
        }
        *self.settlement.borrow_mut() = Some(result.clone());

        for watcher in self.watchers.borrow_mut().drain() {
            watcher(&result);
        }
    }

    /// Runs `watcher` once this settles — immediately, if it already has.
    fn on_settle(
        self: &Rc<Self>,
        watcher: impl FnOnce(&Result<T, SharedError>) + 'static,
    ) -> Option<crate::runtime::queue::Key> {
        if let Some(result) = &*self.settlement.borrow() {
            watcher(result);
            return None;
        }
        Some(self.watchers.borrow_mut().enqueue(Box::new(watcher)))
    }
}

/// The write side of a settle-once value.
///
/// Dropping a `Deferred` that hasn't been resolved or failed yet fails it
/// with [`DeferredDisposedError`] — the producer gave up, and every waiter
/// deserves to know rather than hang forever.
pub struct Deferred<T: Clone> {
    shared: Rc<Shared<T>>,
}

impl<T: Clone> Deferred<T> {
    /// Creates a Pending deferred and registers it with the running
    /// scheduler's shutdown hook list (spec.md 3 Scheduler data model:
    /// "shutdown: ... channels, deferreds, sockets register here"), so a
    /// still-pending deferred is failed with the dispose error (or
    /// [`SchedulerDisposedError`] if dispose carried none) rather than
    /// leaving its waiters parked forever.
    pub fn new() -> Self {
        let shared = Shared::new();

        let hook_shared = shared.clone();
        runtime::register_shutdown_hook(move |error| {
            hook_shared.settle(Err(error.unwrap_or_else(|| SharedError::new(SchedulerDisposedError))));
        });

        Deferred { shared }
    }

    /// Settles with a value. No-op if already settled.
    pub fn resolve(&self, value: T) {
        self.shared.settle(Ok(value));
    }

    /// Settles with an error. No-op if already settled.
    ///
    /// Note this never flattens: resolving with a value that happens to
    /// itself be awaitable does not chain into it, unlike some promise
    /// implementations. Compose explicitly with [`transform`] instead.
    pub fn fail(&self, error: SharedError) {
        self.shared.settle(Err(error));
    }

    /// A cloneable read handle to this deferred's eventual settlement.
    pub fn awaitable(&self) -> Awaitable<T> {
        Awaitable { shared: self.shared.clone() }
    }

    pub fn is_settled(&self) -> bool {
        self.shared.settlement.borrow().is_some()
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Drop for Deferred<T> {
    fn drop(&mut self) {
        self.shared.settle(Err(SharedError::new(DeferredDisposedError)));
    }
}

/// A cheap, cloneable read handle to a [`Deferred`]'s eventual settlement.
pub struct Awaitable<T: Clone> {
    shared: Rc<Shared<T>>,
}

impl<T: Clone> Clone for Awaitable<T> {
    fn clone(&self) -> Self {
        Awaitable { shared: self.shared.clone() }
    }
}

impl<T: Clone> Awaitable<T> {
    pub fn is_settled(&self) -> bool {
        self.shared.settlement.borrow().is_some()
    }

    /// The settled value, once resolved. Blocks (cancellation-aware) if
    /// still pending; returns `None` if it settled with an error instead.
    pub fn value(&self) -> Option<T> {
        self.wait().ok()
    }

    /// The settled error, once failed. Blocks (cancellation-aware) if
    /// still pending; returns `None` if it settled with a value instead.
    pub fn error(&self) -> Option<SharedError> {
        self.wait().err()
    }

    /// Suspends the running fiber until this settles, or the current
    /// context is cancelled — whichever happens first.
    ///
    /// Cancellation here is immediate: it does not wait for whatever
    /// produces the settlement to notice. Operations that need to ask
    /// their underlying work to actually stop (a socket read, a queued
    /// channel send) use [`await_op`] instead.
    pub fn wait(&self) -> Result<T, SharedError> {
        loop {
            if let Some(result) = &*self.shared.settlement.borrow() {
                return result.clone();
            }
            if let Some(error) = context::current().cancel_error() {
                return Err(error);
            }

            let watch_key = RefCell::new(None);
            let cancel_handle = RefCell::new(None);

            runtime::park(|waker| {
                *watch_key.borrow_mut() = self.shared.on_settle(move |_| waker.schedule());
                *cancel_handle.borrow_mut() = context::register(move |_| waker.schedule());
            });

            if self.shared.settlement.borrow().is_none() {
                if let Some(key) = watch_key.into_inner() {
                    self.shared.watchers.borrow_mut().detach(key);
                }
            }
            if let Some(handle) = cancel_handle.into_inner() {
                handle.detach();
            }
        }
    }
}

/// A settle handle passed to [`combine`]'s and [`transform`]'s callbacks.
///
/// Unlike [`Deferred`], dropping one doesn't fail anything — several of
/// these typically outlive the callback that received them (captured in
/// other pending completions' closures) and only one of them "winning" is
/// expected, not a sign anything was abandoned.
pub struct Resolver<T: Clone>(Rc<Shared<T>>);

impl<T: Clone> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Resolver(self.0.clone())
    }
}

impl<T: Clone> Resolver<T> {
    /// Settles the combined/transformed awaitable with a value. No-op if
    /// already settled (by an earlier call, from this or any other
    /// completion).
    pub fn resolve(&self, value: T) {
        self.0.settle(Ok(value));
    }

    /// Settles the combined/transformed awaitable with an error. No-op if
    /// already settled.
    pub fn fail(&self, error: SharedError) {
        self.0.settle(Err(error));
    }
}

/// Waits for every awaitable in `awaitables` to settle, invoking `f` once
/// per completion *in completion order* with `(resolver, is_last, key,
/// result)` — `key` is the element's position in `awaitables`, `is_last`
/// is true on the call that observes the final outstanding completion.
///
/// The returned awaitable settles only when `f` calls `resolver.resolve`
/// or `resolver.fail`; `f` is free to call neither (e.g. wait for a later
/// completion) or to settle early and ignore the rest. A panic inside `f`
/// propagates as-is (same as any other callback run from `notify`).
///
/// Panics if `awaitables` is empty — nothing would ever settle it.
pub fn combine<T, U>(
    awaitables: &[Awaitable<T>],
    f: impl FnMut(&Resolver<U>, bool, usize, Result<T, SharedError>) + 'static,
) -> Awaitable<U>
where
    T: Clone + 'static,
    U: Clone + 'static,
{
    assert!(!awaitables.is_empty(), "combine requires at least one awaitable");

    let shared = Shared::new();
    let resolver = Resolver(shared.clone());
    let remaining = Rc::new(std::cell::Cell::new(awaitables.len()));
    let f = Rc::new(RefCell::new(f));

    for (key, input) in awaitables.iter().enumerate() {
        let resolver = resolver.clone();
        let remaining = remaining.clone();
        let f = f.clone();
        let _ = input.shared.on_settle(move |result| {
            remaining.set(remaining.get() - 1);
            let is_last = remaining.get() == 0;
            (f.borrow_mut())(&resolver, is_last, key, result.clone());
        });
    }

    Awaitable { shared }
}

/// Maps an awaitable's eventual settlement through `f`, returning a new
/// awaitable immediately (this does not block).
pub fn transform<T, U>(
    input: &Awaitable<T>,
    f: impl FnOnce(Result<T, SharedError>) -> Result<U, SharedError> + 'static,
) -> Awaitable<U>
where
    T: Clone + 'static,
    U: Clone + 'static,
{
    let shared = Shared::new();
    let resolver = Resolver(shared.clone());

    let _ = input.shared.on_settle(move |result| match f(result.clone()) {
        Ok(value) => resolver.resolve(value),
        Err(error) => resolver.fail(error),
    });

    Awaitable { shared }
}

/// Suspends until `awaitable` settles, same as [`Awaitable::wait`], except
/// cancellation doesn't short-circuit: instead `on_cancel` is invoked once
/// (to ask whatever produces the settlement to unwind) and this keeps
/// waiting for the *real* settlement, which by convention will then carry
/// a cancellation-flavoured error.
///
/// Sockets and channels use this rather than `Awaitable::wait` directly: a
/// syscall in flight or a queued send can't just be abandoned, it has to
/// be told to stop.
pub fn await_op<T: Clone>(awaitable: &Awaitable<T>, on_cancel: impl FnOnce() + 'static) -> Result<T, SharedError> {
    if let Some(result) = &*awaitable.shared.settlement.borrow() {
        return result.clone();
    }

    let cancel_handle = context::register(move |_| on_cancel());

    let result = loop {
        if let Some(result) = &*awaitable.shared.settlement.borrow() {
            break result.clone();
        }

        let watch_key = RefCell::new(None);
        runtime::park(|waker| {
            *watch_key.borrow_mut() = awaitable.shared.on_settle(move |_| waker.schedule());
        });

        if awaitable.shared.settlement.borrow().is_none() {
            if let Some(key) = watch_key.into_inner() {
                awaitable.shared.watchers.borrow_mut().detach(key);
            }
        }
    };

    if let Some(handle) = cancel_handle {
        handle.detach();
    }

    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn resolve_then_wait_returns_value() {
        runtime::start(|| {
            let deferred = Deferred::new();
            deferred.resolve(123);

            assert_eq!(deferred.awaitable().wait(), Ok(123));
        })
        .unwrap();
    }

    #[test]
    fn fail_then_wait_returns_error() {
        runtime::start(|| {
            let deferred: Deferred<i32> = Deferred::new();
            let error = SharedError::new(std::io::Error::other("boom"));
            deferred.fail(error.clone());

            assert_eq!(deferred.awaitable().wait(), Err(error));
        })
        .unwrap();
    }

    #[test]
    fn wait_blocks_until_settled_from_another_fiber() {
        runtime::start(|| {
            let deferred = Deferred::new();
            let awaitable = deferred.awaitable();

            let handle = runtime::spawn(move || awaitable.wait());

            runtime::yield_now();
            deferred.resolve(42);

            assert_eq!(handle.join().unwrap(), Ok(42));
        })
        .unwrap();
    }

    #[test]
    fn second_settlement_is_ignored() {
        runtime::start(|| {
            let deferred = Deferred::new();
            deferred.resolve(1);
            deferred.resolve(2);

            assert_eq!(deferred.awaitable().wait(), Ok(1));
        })
        .unwrap();
    }

    #[test]
    fn dropping_unsettled_deferred_fails_awaitable() {
        runtime::start(|| {
            let awaitable = {
                let deferred: Deferred<i32> = Deferred::new();
                deferred.awaitable()
            };

            let error = awaitable.wait().unwrap_err();
            assert!(error.to_string().contains("disposed"));
        })
        .unwrap();
    }

    #[test]
    fn combine_invokes_fn_per_completion_in_order_and_settles_on_last() {
        runtime::start(|| {
            let values: Vec<Awaitable<i32>> = vec![
                { let d = Deferred::new(); d.resolve(1); d.awaitable() },
                { let d: Deferred<i32> = Deferred::new(); d.fail(SharedError::new(std::io::Error::other("boom"))); d.awaitable() },
                { let d = Deferred::new(); d.resolve(3); d.awaitable() },
            ];

            let calls = Rc::new(RefCell::new(Vec::new()));
            let calls2 = calls.clone();
            let sum = Rc::new(std::cell::Cell::new(0));

            let combined: Awaitable<i32> = combine(&values, move |resolver, is_last, key, result| {
                calls2.borrow_mut().push(key);
                if let Ok(value) = result {
                    sum.set(sum.get() + value);
                }
                if is_last {
                    resolver.resolve(sum.get());
                }
            });

            assert_eq!(combined.wait(), Ok(4));
            assert_eq!(*calls.borrow(), vec![0, 1, 2]);
        })
        .unwrap();
    }

    #[test]
    fn combine_settles_as_soon_as_fn_resolves_ignoring_later_completions() {
        runtime::start(|| {
            let first: Deferred<i32> = Deferred::new();
            let second: Deferred<i32> = Deferred::new();

            let combined: Awaitable<i32> = combine(&[first.awaitable(), second.awaitable()], |resolver, _last, _key, result| {
                if let Ok(value) = result {
                    resolver.resolve(value);
                }
            });
            second.resolve(2);

            assert_eq!(combined.wait(), Ok(2));

            // the still-pending first awaitable settling afterwards must not
            // change the already-settled combined result.
            first.resolve(1);
            assert_eq!(combined.wait(), Ok(2));
        })
        .unwrap();
    }

    #[test]
    fn transform_maps_settled_value() {
        runtime::start(|| {
            let deferred = Deferred::new();
            let mapped = transform(&deferred.awaitable(), |result| result.map(|n: i32| n * 2));

            deferred.resolve(21);

            assert_eq!(mapped.wait(), Ok(42));
        })
        .unwrap();
    }

    #[test]
    fn wait_returns_immediately_if_already_cancelled() {
        runtime::start(|| {
            let (ctx, cancel) = context::with_cancel(&context::current());
            cancel.cancel(SharedError::new(std::io::Error::other("stop")));

            let deferred: Deferred<i32> = Deferred::new();
            let result = context::run(&ctx, || deferred.awaitable().wait());

            assert!(result.is_err());
        })
        .unwrap();
    }

    #[test]
    fn dispose_fails_every_task_suspended_on_a_never_resolved_deferred() {
        runtime::start(|| {
            let never_resolved: Deferred<i32> = Deferred::new();
            let first = never_resolved.awaitable();
            let second = never_resolved.awaitable();

            let handle_a = runtime::spawn(move || first.wait());
            let handle_b = runtime::spawn(move || second.wait());

            runtime::yield_now();
            let error = SharedError::new(std::io::Error::other("shutdown"));
            runtime::dispose(Some(error.clone()));

            assert_eq!(handle_a.join().unwrap(), Err(error.clone()));
            assert_eq!(handle_b.join().unwrap(), Err(error));
        })
        .unwrap();
    }

    #[test]
    fn await_op_invokes_on_cancel_and_waits_for_real_settlement() {
        runtime::start(|| {
            let deferred: Deferred<()> = Deferred::new();
            let awaitable = deferred.awaitable();
            let (ctx, cancel) = context::with_cancel(&context::current());

            let handle = runtime::spawn(move || {
                context::run(&ctx, || {
                    await_op(&awaitable, move || {
                        // simulate the operation unwinding in response to the
                        // cancel request, settling only once asked to.
                    })
                })
            });

            runtime::yield_now();
            cancel.cancel(SharedError::new(std::io::Error::other("stop")));

            // the spawned fiber observed the cancel request, but stays
            // parked waiting for the real settlement until we provide one.
            let _ = crate::time::sleep(Duration::from_millis(1));
            deferred.fail(SharedError::new(std::io::Error::other("unwound")));

            assert!(handle.join().unwrap().is_err());
        })
        .unwrap();
    }
}
