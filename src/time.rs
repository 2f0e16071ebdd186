//! Sleeping and timeouts.

use std::time::Duration;

use crate::{context, error::SharedError, runtime};

/// Suspends the running task for at least `duration`.
///
/// Cancellable: if the task's context is cancelled while sleeping, returns
/// early with [`crate::Error::Cancelled`].
pub fn sleep(duration: Duration) -> crate::CancellableResult<()> {
    let timespec = io_uring::types::Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos());
    let sqe = io_uring::opcode::Timeout::new(&timespec).build();

    match runtime::syscall(sqe) {
        Ok(_) => Ok(()),
        Err(crate::Error::Cancelled) => Err(crate::Error::Cancelled),
        Err(crate::Error::Original(io_error)) if io_error.raw_os_error() == Some(libc::ETIME) => Ok(()),
        Err(crate::Error::Original(io_error)) => {
            unreachable!("unexpected error from timeout syscall: {io_error}")
        }
    }
}

/// Raised on the context passed to `f` (and observable via
/// [`context::Context::cancel_error`]) when [`with_timeout`] elapses before
/// `f` returns.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("operation timed out")]
pub struct TimedOutError;

/// Runs `f` with its own cancellable context, cancelling it (with
/// [`TimedOutError`]) if it hasn't returned within `duration`.
///
/// Returns `None` if the timeout won the race, `Some(f()'s output)`
/// otherwise. `f` still runs to completion in the timed-out case — it's
/// `f`'s responsibility to observe its context's cancellation (e.g. by
/// calling other cancellation-aware operations) and return promptly.
///
/// This is the composition spec.md describes: a `with_cancel` context plus
/// a timer, rather than a dedicated timeout primitive in the scheduler.
pub fn with_timeout<T>(duration: Duration, f: impl FnOnce() -> T) -> Option<T> {
    let (ctx, cancel) = context::with_cancel(&context::current());

    let timer = runtime::spawn(move || {
        if sleep(duration).is_ok() {
            cancel.cancel(SharedError::new(TimedOutError));
        }
    });

    let result = context::run(&ctx, f);

    timer.cancel();
    let _ = timer.join();

    if ctx.is_cancelled() {
        None
    } else {
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn sleeps_for_at_least_duration() {
        runtime::start(|| {
            let before = Instant::now();
            sleep(Duration::from_millis(5)).unwrap();
            assert!(before.elapsed() >= Duration::from_millis(5));
        })
        .unwrap();
    }

    #[test]
    fn with_timeout_returns_output_if_fast_enough() {
        runtime::start(|| {
            let result = with_timeout(Duration::from_millis(50), || 123);
            assert_eq!(result, Some(123));
        })
        .unwrap();
    }

    #[test]
    fn with_timeout_returns_none_if_too_slow() {
        runtime::start(|| {
            let result = with_timeout(Duration::from_millis(5), || {
                let _ = sleep(Duration::from_millis(50));
            });
            assert_eq!(result, None);
        })
        .unwrap();
    }
}
