//! Crate-wide error taxonomy.
//!
//! Every error that can cross a suspension point (an `await_op`, a channel
//! operation, a socket read/write) is represented here so that it can be
//! cloned cheaply into every waiter a settlement drains. The runtime itself
//! never needs `Send`/`Sync` errors since nothing crosses a thread boundary.

use std::fmt;
use std::rc::Rc;

/// A cheaply-clonable, type-erased error.
///
/// Used wherever the spec's "dynamically typed ... error payload" crosses
/// an operation boundary and may be observed by more than one waiter (a
/// `Deferred`'s settlement is broadcast to every awaiter, a channel close
/// reaches every queued sender and receiver). Wrapping in `Rc` avoids
/// requiring every error type in the crate to implement `Clone`.
#[derive(Clone)]
pub struct SharedError(Rc<dyn std::error::Error>);

impl SharedError {
    pub fn new(error: impl std::error::Error + 'static) -> Self {
        SharedError(Rc::new(error))
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl PartialEq for SharedError {
    /// Two [`SharedError`]s are equal iff they're the same allocation.
    /// This crate never compares errors by message, only by identity, since
    /// cloning preserves identity and that's all dispose/close/cancel need.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A `T` that may have been preempted by a context cancellation instead of
/// completing with its own error type `E`.
///
/// This is the crate's equivalent of spec.md's `CancelledError`: rather than
/// a single flat error enum, cancellation is layered on top of every
/// operation's own error type so call sites that don't care about
/// cancellation can still `?` through a plain `Result<T, E>` once they've
/// matched out the `Cancelled` case.
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellable<E> {
    Original(E),
    Cancelled(SharedError),
}

impl<E> Cancellable<E> {
    pub fn map<F, U>(self, f: F) -> Cancellable<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Cancellable::Original(e) => Cancellable::Original(f(e)),
            Cancellable::Cancelled(cause) => Cancellable::Cancelled(cause),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Cancellable::Cancelled(_))
    }
}

impl<E: fmt::Display> fmt::Display for Cancellable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cancellable::Original(e) => fmt::Display::fmt(e, f),
            Cancellable::Cancelled(cause) => write!(f, "cancelled: {cause}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Cancellable<E> {}

/// Raised by [`crate::channel::Channel::send`] after close, and by a
/// receive when the close carried an error.
#[derive(thiserror::Error, Debug, Clone)]
#[error("channel closed")]
pub struct ChannelClosedError {
    #[source]
    pub cause: Option<SharedError>,
}

/// Raised when a second read is attempted while one is already in flight on
/// the same socket.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("a read is already pending on this socket")]
pub struct PendingReadError;

/// Raised when a second write is attempted while one is already in flight
/// on the same socket.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("a write is already pending on this socket")]
pub struct PendingWriteError;

/// Bind/accept/connect/TLS-verification failures.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(SharedError),

    #[error("TLS handshake failed: {0}")]
    Tls(SharedError),

    #[error("certificate verification failed: {0}")]
    Verification(String),
}

/// Reading/writing a socket after it (or its peer) closed.
#[derive(thiserror::Error, Debug, Clone)]
#[error("stream closed")]
pub struct StreamClosedError {
    #[source]
    pub cause: Option<SharedError>,
}

/// An `Awaitable`'s backing `Deferred` (or every handle to it) was dropped
/// while still pending.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("awaitable disposed before resolved")]
pub struct DeferredDisposedError;

/// The fallback error attached to every operation still pending when
/// [`crate::runtime::dispose`] runs with no error of its own
/// (spec.md 4.D: "resolved with `None` if no error was supplied" for
/// channels, and spec.md 8 property 5's "a 'disposed' error if `e` was
/// None" for every other pending operation).
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("scheduler disposed")]
pub struct SchedulerDisposedError;

/// [`crate::net::tcp::Socket::read`]'s failure modes, layered the same way
/// [`ChannelClosedError`] is: a pending-op guard (synchronous misuse) or a
/// closed stream (observed after the fact, possibly with a cause).
#[derive(thiserror::Error, Debug, Clone)]
pub enum ReadError {
    #[error(transparent)]
    Pending(#[from] PendingReadError),
    #[error(transparent)]
    Closed(#[from] StreamClosedError),
}

/// [`crate::net::tcp::Socket::write`]'s failure modes; see [`ReadError`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum WriteError {
    #[error(transparent)]
    Pending(#[from] PendingWriteError),
    #[error(transparent)]
    Closed(#[from] StreamClosedError),
}

pub(crate) fn io_error(error: std::io::Error) -> SharedError {
    SharedError::new(error)
}
