//! Deadlines for calls into external collaborators.
//!
//! `tokio::time::timeout` drops the inner future when the deadline passes,
//! so a timed-out operation is never polled again: it is aborted at its next
//! suspension point rather than left running in the background. Work the
//! collaborator spawned onto other tasks is outside the guard's reach.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

use crate::error::TimeoutError;

/// Why a guarded collaborator call produced no value.
#[derive(Debug)]
pub(crate) enum GuardError<E> {
    Timeout(TimeoutError),
    Panicked(String),
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(t)  => write!(f, "{t}"),
            Self::Panicked(m) => write!(f, "panicked: {m}"),
            Self::Failed(e)   => write!(f, "{e}"),
        }
    }
}

/// Settles with `fut`'s output, or fails with a [`TimeoutError`] naming
/// `operation` once `after` has elapsed.
pub async fn with_timeout<F>(fut: F, after: Duration, operation: &str) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(after, fut).await.map_err(|_| TimeoutError {
        operation: operation.to_owned(),
        after,
    })
}

/// Runs a fallible collaborator call under a deadline, containing panics.
///
/// `call` is invoked on the first poll, inside the panic boundary, so a
/// collaborator that panics before handing back its future is contained
/// like one that panics while running. Every failure mode (error, panic,
/// timeout) is folded into [`GuardError`] so callers can log it and
/// substitute their fallback in one place.
pub(crate) async fn guarded<C, F, T, E>(call: C, after: Duration, operation: &str) -> Result<T, GuardError<E>>
where
    C: FnOnce() -> F,
    F: Future<Output = Result<T, E>>,
{
    let fut = async move { call().await };
    match with_timeout(AssertUnwindSafe(fut).catch_unwind(), after, operation).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e)))    => Err(GuardError::Failed(e)),
        Ok(Err(panic))    => Err(GuardError::Panicked(panic_message(panic.as_ref()))),
        Err(timeout)      => Err(GuardError::Timeout(timeout)),
    }
}

/// Runs an infallible collaborator call with panic containment and no deadline.
pub(crate) async fn contained<C, F>(call: C) -> Result<F::Output, String>
where
    C: FnOnce() -> F,
    F: Future,
{
    AssertUnwindSafe(async move { call().await })
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_before_deadline() {
        let out = with_timeout(async { 7 }, Duration::from_millis(10), "noop").await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_operation_times_out_with_name() {
        let err = with_timeout(std::future::pending::<()>(), Duration::from_millis(250), "Context creation")
            .await
            .unwrap_err();
        assert_eq!(err.operation, "Context creation");
        assert_eq!(err.to_string(), "Context creation timed out after 250ms");
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_future_is_dropped() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let slow = async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_secs(60)).await;
        };

        assert!(with_timeout(slow, Duration::from_millis(5), "slow").await.is_err());
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn guarded_reports_each_failure_mode() {
        let ok: Result<u8, GuardError<&str>> = guarded(|| async { Ok(1) }, Duration::from_secs(1), "op").await;
        assert_eq!(ok.unwrap(), 1);

        let failed = guarded(|| async { Err::<u8, _>("down") }, Duration::from_secs(1), "op").await;
        assert!(matches!(failed, Err(GuardError::Failed("down"))));

        let panicked = guarded(
            || async { if true { panic!("boom") } else { Ok::<u8, &str>(0) } },
            Duration::from_secs(1),
            "op",
        )
        .await;
        assert!(matches!(panicked, Err(GuardError::Panicked(ref m)) if m == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_times_out() {
        let out = guarded(
            std::future::pending::<Result<(), &str>>,
            Duration::from_millis(100),
            "Plugin proxy setup: audit",
        )
        .await;
        assert!(matches!(out, Err(GuardError::Timeout(ref t)) if t.operation == "Plugin proxy setup: audit"));
    }

    #[tokio::test]
    async fn panic_before_the_future_exists_is_contained() {
        let thrown = guarded(
            || -> std::future::Ready<Result<u8, &str>> { panic!("thrown on call") },
            Duration::from_secs(1),
            "op",
        )
        .await;
        assert!(matches!(thrown, Err(GuardError::Panicked(ref m)) if m == "thrown on call"));

        let contained_out = contained(|| -> std::future::Ready<u8> { panic!("listing failed") }).await;
        assert_eq!(contained_out, Err("listing failed".to_owned()));
    }
}
