#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

#[cfg(feature = "macros")]
pub use skein_macros::main as start;

pub mod awaitable;
pub mod channel;
pub mod context;
pub mod error;
pub mod fs;
pub mod net;
pub mod process;
pub mod runtime;
pub mod time;

/// The runtime/fiber-level result of a suspending operation: either the
/// operation's own outcome, or a flag that it was preempted by the legacy
/// fiber-tree cancellation ([`runtime::cancel`]).
///
/// This is distinct from [`error::Cancellable`], which carries the actual
/// cancellation *error* and backs the spec's context-based cancellation
/// for awaitables, channels and sockets. `Error<E>` stays underneath it as
/// the vocabulary for the scheduler's own primitives: `io_uring` syscalls
/// and [`runtime::JoinHandle::join`].
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error<E> {
    #[error("original error")]
    Original(#[from] E),

    #[error("cancelled")]
    Cancelled,
}

impl<E> Error<E> {
    #[inline]
    pub fn map<F: FnOnce(E) -> U, U>(self, f: F) -> Error<U> {
        match self {
            Error::Original(e) => Error::Original(f(e)),
            Error::Cancelled => Error::Cancelled,
        }
    }

    #[inline]
    pub fn and_then<F: FnOnce(E) -> Error<U>, U>(self, f: F) -> Error<U> {
        match self {
            Error::Original(e) => f(e),
            Error::Cancelled => Error::Cancelled,
        }
    }
}

impl Error<std::io::Error> {
    pub fn from_io_error(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(libc::ECANCELED) => Error::Cancelled,
            _ => Error::Original(error),
        }
    }
}

impl From<Error<std::io::Error>> for std::io::Error {
    fn from(error: Error<std::io::Error>) -> Self {
        match error {
            Error::Original(e) => e,
            Error::Cancelled => std::io::Error::from_raw_os_error(libc::ECANCELED),
        }
    }
}

/// Result of an `io_uring` syscall issued through [`runtime::syscall`].
pub type IoResult<T> = Result<T, Error<std::io::Error>>;

/// Result of a scheduler primitive with no error of its own, only
/// cancellation.
pub type CancellableResult<T> = Result<T, Error<()>>;
