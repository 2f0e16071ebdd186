//! CSP-style channels: a bounded FIFO of values with waiters on both the
//! send and receive side, plus a non-deterministic [`select`] over several
//! channels at once.
//!
//! A [`Channel`] is a single cloneable handle — unlike `std::sync::mpsc` or
//! the teacher's own `sync::channel`, this crate doesn't split sending and
//! receiving into two handle types, since the spec's `close` can be called
//! from either side and needs to affect both queues identically. `capacity
//! == 0` is a rendezvous channel: every [`Channel::send`] suspends until a
//! matching receive, there is no buffer slot at all.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::context;
use crate::error::{Cancellable, ChannelClosedError, SharedError};
use crate::runtime::{
    self,
    queue::{IntrusiveQueue, Key},
};

thread_local! {
    /// Seeded once per process (actually: once per thread, which is the
    /// same thing for this crate's single-threaded-per-runtime model) from
    /// OS randomness, then reused for every `select` call — spec.md 6
    /// "must be seeded per-process", not per-call.
    static SELECT_RNG: RefCell<SmallRng> =
        RefCell::new(SmallRng::from_rng(rand::thread_rng()).expect("failed to seed select RNG"));
}

type RecvCallback<T> = Box<dyn FnOnce(Result<T, ChannelClosedError>)>;

struct SendWaiter<T> {
    value: RefCell<Option<T>>,
    notify: RefCell<Option<Box<dyn FnOnce(Result<(), ChannelClosedError>)>>>,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    senders: IntrusiveQueue<Rc<SendWaiter<T>>>,
    receivers: IntrusiveQueue<RecvCallback<T>>,
    closed: bool,
    error: Option<SharedError>,
}

/// The outcome of a non-blocking fetch attempt (spec.md 4.G `fetch_noblock`).
pub(crate) enum Fetch<T> {
    Value(T),
    Closed(Option<SharedError>),
    NotReady,
}

/// A CSP channel: `send` and `recv`/[`iter`](Channel::iter) suspend the
/// calling fiber when the channel isn't immediately ready, same as every
/// other suspension point in this crate.
///
/// Cheap to clone: it's a reference-counted handle over shared state, same
/// idiom as [`crate::awaitable::Awaitable`].
pub struct Channel<T>(Rc<RefCell<Inner<T>>>);

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(self.0.clone())
    }
}

impl<T: 'static> Channel<T> {
    /// Creates a channel with room for `capacity` buffered values. `0` means
    /// unbuffered: every send blocks until a receiver is waiting.
    pub fn new(capacity: usize) -> Self {
        let state = Rc::new(RefCell::new(Inner {
            capacity,
            buffer: VecDeque::new(),
            senders: IntrusiveQueue::new(),
            receivers: IntrusiveQueue::new(),
            closed: false,
            error: None,
        }));

        let channel = Channel(state);
        let shutdown_state = channel.0.clone();
        channel.register_shutdown(shutdown_state);
        channel
    }

    fn register_shutdown(&self, state: Rc<RefCell<Inner<T>>>) {
        runtime::register_shutdown_hook(move |error| {
            let mut inner = state.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.error = error.clone();

            for callback in inner.receivers.drain().collect::<Vec<_>>() {
                callback(Err(ChannelClosedError { cause: error.clone() }));
            }
            for waiter in inner.senders.drain().collect::<Vec<_>>() {
                waiter.value.borrow_mut().take();
                if let Some(notify) = waiter.notify.borrow_mut().take() {
                    notify(Err(ChannelClosedError { cause: error.clone() }));
                }
            }
        });
    }

    /// Number of values currently buffered. Always `0 <= len() <= capacity`.
    pub fn len(&self) -> usize {
        self.0.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    /// spec.md 4.G "fetch_noblock": never suspends.
    pub(crate) fn fetch_noblock(&self) -> Fetch<T> {
        let mut inner = self.0.borrow_mut();

        if let Some(value) = inner.buffer.pop_front() {
            if let Some(waiter) = inner.senders.dequeue() {
                let moved = waiter.value.borrow_mut().take().expect("sender waiter missing its value");
                inner.buffer.push_back(moved);
                drop(inner);
                if let Some(notify) = waiter.notify.borrow_mut().take() {
                    notify(Ok(()));
                }
            }
            return Fetch::Value(value);
        }

        if let Some(waiter) = inner.senders.dequeue() {
            let value = waiter.value.borrow_mut().take().expect("sender waiter missing its value");
            drop(inner);
            if let Some(notify) = waiter.notify.borrow_mut().take() {
                notify(Ok(()));
            }
            return Fetch::Value(value);
        }

        if inner.closed {
            return Fetch::Closed(inner.error.clone());
        }

        Fetch::NotReady
    }

    /// Sends `value`. Suspends if the channel is full and nobody is
    /// currently waiting to receive; cancellation-aware while suspended.
    ///
    /// Fails immediately if the channel is already closed — a send that
    /// raced a concurrent close always loses, there is no partial success.
    pub fn send(&self, value: T) -> Result<(), Cancellable<ChannelClosedError>> {
        {
            let mut inner = self.0.borrow_mut();
            if inner.closed {
                return Err(Cancellable::Original(ChannelClosedError { cause: inner.error.clone() }));
            }
            if let Some(callback) = inner.receivers.dequeue() {
                drop(inner);
                callback(Ok(value));
                return Ok(());
            }
            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(value);
                return Ok(());
            }
        }

        if let Some(error) = context::current().cancel_error() {
            return Err(Cancellable::Cancelled(error));
        }

        enum Outcome {
            Delivered(Result<(), ChannelClosedError>),
            Cancelled(SharedError),
        }

        let slot: Rc<RefCell<Option<Outcome>>> = Rc::new(RefCell::new(None));
        let key_cell: Rc<RefCell<Option<Key>>> = Rc::new(RefCell::new(None));
        let cancel_handle_cell: Rc<RefCell<Option<context::CancelHookHandle>>> = Rc::new(RefCell::new(None));
        let state = self.0.clone();
        let mut value = Some(value);

        runtime::park(|waker| {
            let slot2 = slot.clone();
            let notify: Box<dyn FnOnce(Result<(), ChannelClosedError>)> = Box::new(move |result| {
                if slot2.borrow().is_some() {
                    return;
                }
                *slot2.borrow_mut() = Some(Outcome::Delivered(result));
                waker.schedule();
            });

            let waiter = Rc::new(SendWaiter {
                value: RefCell::new(value.take()),
                notify: RefCell::new(Some(notify)),
            });
            let key = state.borrow_mut().senders.enqueue(waiter);
            *key_cell.borrow_mut() = Some(key);

            let slot3 = slot.clone();
            let key_cell2 = key_cell.clone();
            let state2 = state.clone();
            let handle = context::register(move |error| {
                if slot3.borrow().is_some() {
                    return;
                }
                if let Some(key) = key_cell2.borrow_mut().take() {
                    let _ = state2.borrow_mut().senders.detach(key); // drops the unsent value
                }
                *slot3.borrow_mut() = Some(Outcome::Cancelled(error.clone()));
                waker.schedule();
            });
            *cancel_handle_cell.borrow_mut() = handle;
        });

        if let Some(handle) = cancel_handle_cell.borrow_mut().take() {
            handle.detach();
        }

        match slot.borrow_mut().take().expect("parked sender woken without an outcome") {
            Outcome::Delivered(Ok(())) => Ok(()),
            Outcome::Delivered(Err(error)) => Err(Cancellable::Original(error)),
            Outcome::Cancelled(error) => Err(Cancellable::Cancelled(error)),
        }
    }

    /// Receives the next value, suspending until one is available, the
    /// channel closes, or the current context is cancelled.
    pub fn recv(&self) -> Result<T, Cancellable<ChannelClosedError>> {
        match self.fetch_noblock() {
            Fetch::Value(value) => return Ok(value),
            Fetch::Closed(cause) => return Err(Cancellable::Original(ChannelClosedError { cause })),
            Fetch::NotReady => {}
        }

        if let Some(error) = context::current().cancel_error() {
            return Err(Cancellable::Cancelled(error));
        }

        enum Outcome<T> {
            Delivered(Result<T, ChannelClosedError>),
            Cancelled(SharedError),
        }

        let slot: Rc<RefCell<Option<Outcome<T>>>> = Rc::new(RefCell::new(None));
        let key_cell: Rc<RefCell<Option<Key>>> = Rc::new(RefCell::new(None));
        let cancel_handle_cell: Rc<RefCell<Option<context::CancelHookHandle>>> = Rc::new(RefCell::new(None));
        let state = self.0.clone();

        runtime::park(|waker| {
            let slot2 = slot.clone();
            let callback: RecvCallback<T> = Box::new(move |result| {
                if slot2.borrow().is_some() {
                    return;
                }
                *slot2.borrow_mut() = Some(Outcome::Delivered(result));
                waker.schedule();
            });
            let key = state.borrow_mut().receivers.enqueue(callback);
            *key_cell.borrow_mut() = Some(key);

            let slot3 = slot.clone();
            let key_cell2 = key_cell.clone();
            let state2 = state.clone();
            let handle = context::register(move |error| {
                if slot3.borrow().is_some() {
                    return;
                }
                if let Some(key) = key_cell2.borrow_mut().take() {
                    let _ = state2.borrow_mut().receivers.detach(key);
                }
                *slot3.borrow_mut() = Some(Outcome::Cancelled(error.clone()));
                waker.schedule();
            });
            *cancel_handle_cell.borrow_mut() = handle;
        });

        if let Some(handle) = cancel_handle_cell.borrow_mut().take() {
            handle.detach();
        }

        match slot.borrow_mut().take().expect("parked receiver woken without an outcome") {
            Outcome::Delivered(Ok(value)) => Ok(value),
            Outcome::Delivered(Err(error)) => Err(Cancellable::Original(error)),
            Outcome::Cancelled(error) => Err(Cancellable::Cancelled(error)),
        }
    }

    /// Closes the channel. Idempotent: only the first call's `error` (or
    /// lack of one) sticks.
    ///
    /// Drains `receivers` first (resolved with no value if `error` is
    /// `None`, otherwise failed), then `senders` (always failed — a value
    /// that was never going to be delivered is simply dropped).
    pub fn close(&self, error: Option<SharedError>) {
        let mut inner = self.0.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.error = error.clone();

        for callback in inner.receivers.drain().collect::<Vec<_>>() {
            callback(Err(ChannelClosedError { cause: error.clone() }));
        }
        for waiter in inner.senders.drain().collect::<Vec<_>>() {
            waiter.value.borrow_mut().take();
            if let Some(notify) = waiter.notify.borrow_mut().take() {
                notify(Err(ChannelClosedError { cause: error.clone() }));
            }
        }
    }

    /// A [`ChannelIterator`]-equivalent view: repeated calls to `next()`
    /// receive successive values, ending (`None`) when the channel closes
    /// cleanly.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            channel: self.clone(),
            pos: -1,
            entry: None,
        }
    }
}

/// A cursor over a [`Channel`]'s values (spec.md 3 "Channel Iterator").
///
/// `pos` starts at `-1` (nothing fetched yet) and advances by one on every
/// successful [`Iterator::next`]; `entry` holds the most recently fetched
/// value, mirroring spec.md's field-by-field description so that `key()`
/// and `current()` match the reference's semantics exactly.
pub struct Iter<T> {
    channel: Channel<T>,
    pos: i64,
    entry: Option<T>,
}

impl<T: 'static> Iter<T> {
    /// Resets the cursor so the next `next()` call re-fetches from whatever
    /// is currently available, without affecting the channel itself.
    pub fn rewind(&mut self) {
        self.pos = -1;
        self.entry = None;
    }

    /// The position of [`Self::current`]'s value, or `-1` before the first
    /// successful fetch.
    pub fn key(&self) -> i64 {
        self.pos
    }

    /// The most recently fetched value, if the iterator hasn't ended.
    pub fn current(&self) -> Option<&T> {
        self.entry.as_ref()
    }

    /// `false` once the channel has closed cleanly and every buffered value
    /// has been drained. Still `true` if the channel closed *with* an error
    /// and that error hasn't been observed yet — the next `next()` call
    /// raises it.
    pub fn valid(&self) -> bool {
        self.entry.is_some() || !self.fetched_past_end()
    }

    fn fetched_past_end(&self) -> bool {
        self.pos >= 0 && self.entry.is_none()
    }

    /// `true` if the owning channel can never produce another value: it's
    /// closed and has nothing buffered or in flight from a sender.
    pub(crate) fn is_exhausted(&self) -> bool {
        let inner = self.channel.0.borrow();
        inner.closed && inner.buffer.is_empty() && inner.senders.is_empty()
    }

    pub(crate) fn channel(&self) -> &Channel<T> {
        &self.channel
    }
}

impl<T: Clone + 'static> Iterator for Iter<T> {
    /// `Ok` for a received value; `Err` once the channel closes with an
    /// error (the spec's `ChannelClosedException`, re-thrown at the call
    /// site that first observes it) or the current context is cancelled;
    /// `None` once it closes cleanly.
    type Item = Result<T, Cancellable<ChannelClosedError>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.channel.recv() {
            Ok(value) => {
                self.pos += 1;
                self.entry = Some(value.clone());
                Some(Ok(value))
            }
            Err(Cancellable::Original(ChannelClosedError { cause: None })) => {
                self.entry = None;
                None
            }
            Err(other) => {
                self.entry = None;
                Some(Err(other))
            }
        }
    }
}

fn shuffle<T>(entries: &mut [T]) {
    SELECT_RNG.with(|rng| entries.shuffle(&mut *rng.borrow_mut()));
}

/// Non-deterministic multi-channel receive (spec.md 4.G "Select").
///
/// `Ok(Some((key, value)))` once some entry produces a value — chosen
/// uniformly at random among entries that were *already* ready when
/// `select` was called (a Fisher-Yates shuffle before the scan), or
/// whichever entry the event loop wakes first if `select` had to block.
/// `Ok(None)` if `block` is `false` and nothing was ready, or once every
/// entry has closed (kept from the reference per spec.md's Open Questions:
/// an all-closed `select` returns `(None, None)` rather than raising).
/// `Err` if the calling context is cancelled while blocked.
///
/// Panics if `entries` is empty (spec.md Boundary: "Select with empty
/// input: raises").
pub fn select<K, T>(mut entries: Vec<(K, &mut Iter<T>)>, block: bool) -> Result<Option<(K, T)>, SharedError>
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    assert!(!entries.is_empty(), "select requires at least one channel");

    loop {
        shuffle(&mut entries);

        let mut closed = 0;
        for (key, iter) in entries.iter_mut() {
            match iter.channel.fetch_noblock() {
                Fetch::Value(value) => {
                    iter.pos += 1;
                    iter.entry = Some(value.clone());
                    return Ok(Some((key.clone(), value)));
                }
                Fetch::Closed(_) => closed += 1,
                Fetch::NotReady => {}
            }
        }

        if closed == entries.len() || !block {
            return Ok(None);
        }

        match park_on_first_ready(&mut entries)? {
            Some(result) => return Ok(Some(result)),
            // every still-open entry closed while we were parked; rescan
            // from the top, which will now count them all as closed.
            None => continue,
        }
    }
}

/// The blocking half of [`select`]: registers a sub-op on every still-open
/// entry's `receivers` queue, parks until one completes (or the context is
/// cancelled), then unconditionally cleans up every sub-op — spec.md 4.G
/// step 7, "the single hardest correctness requirement".
fn park_on_first_ready<K, T>(entries: &mut [(K, &mut Iter<T>)]) -> Result<Option<(K, T)>, SharedError>
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    enum Outcome<K, T> {
        Resolved(K, T),
        Exhausted,
        Cancelled(SharedError),
    }

    let resolved: Rc<RefCell<Option<Outcome<K, T>>>> = Rc::new(RefCell::new(None));
    let pending = Rc::new(Cell::new(0usize));
    let sub_ops: Rc<RefCell<Vec<(Channel<T>, Key)>>> = Rc::new(RefCell::new(Vec::new()));
    let cancel_handle_cell: Rc<RefCell<Option<context::CancelHookHandle>>> = Rc::new(RefCell::new(None));

    runtime::park(|waker| {
        for (key, iter) in entries.iter() {
            if iter.is_exhausted() {
                continue;
            }
            pending.set(pending.get() + 1);

            let resolved2 = resolved.clone();
            let pending2 = pending.clone();
            let key2 = key.clone();
            let callback: RecvCallback<T> = Box::new(move |result| {
                pending2.set(pending2.get() - 1);
                if resolved2.borrow().is_some() {
                    return;
                }
                match result {
                    Ok(value) => {
                        *resolved2.borrow_mut() = Some(Outcome::Resolved(key2, value));
                        waker.schedule();
                    }
                    Err(_) if pending2.get() == 0 => {
                        *resolved2.borrow_mut() = Some(Outcome::Exhausted);
                        waker.schedule();
                    }
                    Err(_) => {}
                }
            });

            let sub_key = iter.channel.0.borrow_mut().receivers.enqueue(callback);
            sub_ops.borrow_mut().push((iter.channel.clone(), sub_key));
        }

        let resolved3 = resolved.clone();
        let handle = context::register(move |error| {
            if resolved3.borrow().is_some() {
                return;
            }
            *resolved3.borrow_mut() = Some(Outcome::Cancelled(error.clone()));
            waker.schedule();
        });
        *cancel_handle_cell.borrow_mut() = handle;
    });

    for (channel, key) in sub_ops.borrow_mut().drain(..) {
        let _ = channel.0.borrow_mut().receivers.detach(key);
    }
    if let Some(handle) = cancel_handle_cell.borrow_mut().take() {
        handle.detach();
    }

    match resolved.borrow_mut().take().expect("parked select woken without an outcome") {
        Outcome::Resolved(key, value) => Ok(Some((key, value))),
        Outcome::Exhausted => Ok(None),
        Outcome::Cancelled(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_send_then_recv_is_fifo() {
        runtime::start(|| {
            let channel = Channel::new(2);
            channel.send(1).unwrap();
            channel.send(2).unwrap();

            assert_eq!(channel.recv().unwrap(), 1);
            assert_eq!(channel.recv().unwrap(), 2);
        })
        .unwrap();
    }

    #[test]
    fn unbuffered_send_suspends_until_matching_recv() {
        runtime::start(|| {
            let channel = Channel::new(0);
            let sender = channel.clone();

            let handle = runtime::spawn(move || sender.send(42).unwrap());

            assert_eq!(channel.recv().unwrap(), 42);
            handle.join().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn producer_consumer_suspends_exactly_twice() {
        runtime::start(|| {
            let channel = Channel::new(2);
            let sender = channel.clone();

            let handle = runtime::spawn(move || {
                for value in 1..=4 {
                    sender.send(value).unwrap();
                }
            });

            runtime::yield_now();

            let mut received = Vec::new();
            for _ in 0..4 {
                received.push(channel.recv().unwrap());
            }

            assert_eq!(received, vec![1, 2, 3, 4]);
            handle.join().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn close_fails_pending_send_with_cause() {
        runtime::start(|| {
            let channel: Channel<i32> = Channel::new(0);
            let sender = channel.clone();

            let handle = runtime::spawn(move || sender.send(1));

            runtime::yield_now();
            channel.close(Some(SharedError::new(std::io::Error::other("boom"))));

            let error = handle.join().unwrap().unwrap_err();
            match error {
                Cancellable::Original(ChannelClosedError { cause: Some(cause) }) => {
                    assert_eq!(cause.to_string(), "boom");
                }
                other => panic!("unexpected error: {other}"),
            }
        })
        .unwrap();
    }

    #[test]
    fn close_without_error_ends_receivers_cleanly() {
        runtime::start(|| {
            let channel: Channel<i32> = Channel::new(1);
            channel.close(None);

            let error = channel.recv().unwrap_err();
            assert_eq!(error, Cancellable::Original(ChannelClosedError { cause: None }));
        })
        .unwrap();
    }

    #[test]
    fn send_after_close_fails_immediately() {
        runtime::start(|| {
            let channel: Channel<i32> = Channel::new(1);
            channel.close(None);

            assert!(channel.send(1).is_err());
        })
        .unwrap();
    }

    #[test]
    fn iterator_ends_on_clean_close() {
        runtime::start(|| {
            let channel = Channel::new(2);
            channel.send(1).unwrap();
            channel.send(2).unwrap();
            channel.close(None);

            let values: Vec<_> = channel.iter().map(|result| result.unwrap()).collect();
            assert_eq!(values, vec![1, 2]);
        })
        .unwrap();
    }

    #[test]
    fn cancelling_context_fails_pending_recv() {
        runtime::start(|| {
            let channel: Channel<i32> = Channel::new(0);
            let (ctx, cancel) = context::with_cancel(&context::current());

            let handle = runtime::spawn(move || context::run(&ctx, || channel.recv()));

            runtime::yield_now();
            cancel.cancel(SharedError::new(std::io::Error::other("stop")));

            let error = handle.join().unwrap().unwrap_err();
            assert!(matches!(error, Cancellable::Cancelled(_)));
        })
        .unwrap();
    }

    #[test]
    fn select_returns_ready_value_from_original_keys() {
        runtime::start(|| {
            let x: Channel<i32> = Channel::new(1);
            let y: Channel<i32> = Channel::new(1);
            y.send(99).unwrap();

            let mut x_iter = x.iter();
            let mut y_iter = y.iter();
            let entries = vec![("x", &mut x_iter), ("y", &mut y_iter)];

            let (key, value) = select(entries, true).unwrap().unwrap();
            assert_eq!(key, "y");
            assert_eq!(value, 99);
        })
        .unwrap();
    }

    #[test]
    fn select_nonblocking_miss_returns_none() {
        runtime::start(|| {
            let x: Channel<i32> = Channel::new(1);
            let mut x_iter = x.iter();
            let entries = vec![("x", &mut x_iter)];

            assert_eq!(select(entries, false).unwrap(), None);
        })
        .unwrap();
    }

    #[test]
    fn select_picks_uniformly_among_ready_channels() {
        // spec.md 8 scenario 2: three pre-populated channels, refilled
        // between calls, selected 3000 times; each key should come up at
        // least 800 times if the Fisher-Yates shuffle is actually uniform.
        runtime::start(|| {
            let x: Channel<i32> = Channel::new(1);
            let y: Channel<i32> = Channel::new(1);
            let z: Channel<i32> = Channel::new(1);

            let mut counts = std::collections::HashMap::new();
            for _ in 0..3000 {
                x.send(1).unwrap();
                y.send(1).unwrap();
                z.send(1).unwrap();

                let mut x_iter = x.iter();
                let mut y_iter = y.iter();
                let mut z_iter = z.iter();
                let entries = vec![("a", &mut x_iter), ("b", &mut y_iter), ("c", &mut z_iter)];

                let (key, _) = select(entries, true).unwrap().unwrap();
                *counts.entry(key).or_insert(0) += 1;

                // drain whichever two channels weren't picked, so the next
                // iteration starts from the same all-empty state.
                let _ = x.fetch_noblock();
                let _ = y.fetch_noblock();
                let _ = z.fetch_noblock();
            }

            for key in ["a", "b", "c"] {
                let count = *counts.get(key).unwrap_or(&0);
                assert!(count >= 800, "key {key:?} only observed {count} times");
            }
        })
        .unwrap();
    }

    #[test]
    fn select_all_closed_returns_none_even_blocking() {
        runtime::start(|| {
            let x: Channel<i32> = Channel::new(1);
            x.close(None);
            let mut x_iter = x.iter();
            let entries = vec![("x", &mut x_iter)];

            assert_eq!(select(entries, true).unwrap(), None);
        })
        .unwrap();
    }

    #[test]
    fn select_blocks_until_a_send_arrives() {
        runtime::start(|| {
            let x: Channel<i32> = Channel::new(1);
            let sender = x.clone();

            let handle = runtime::spawn(move || sender.send(7).unwrap());

            let mut x_iter = x.iter();
            let entries = vec![("x", &mut x_iter)];
            let (key, value) = select(entries, true).unwrap().unwrap();

            assert_eq!(key, "x");
            assert_eq!(value, 7);
            handle.join().unwrap();
        })
        .unwrap();
    }
}
