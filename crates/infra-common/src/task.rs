//! Panic-guarded task execution.
//!
//! Timer callbacks and dispatch tasks run through [`run_guarded`] so that a
//! panic inside one of them is logged and swallowed instead of aborting the
//! owning transaction or connection scheduler.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::error;

/// Drive `fut` to completion, converting a panic into `None`.
pub async fn run_guarded<F>(name: &str, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Some(output),
        Err(panic) => {
            error!(task = name, "task panicked: {}", panic_message(panic.as_ref()));
            None
        }
    }
}

/// Spawn `fut` on the runtime behind a panic guard.
pub fn spawn_guarded<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        run_guarded(name, fut).await;
    })
}

/// Spawn `fut` on `tracker` behind a panic guard.
pub fn spawn_tracked<F>(tracker: &TaskTracker, name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracker.spawn(async move {
        run_guarded(name, fut).await;
    })
}

/// Best effort extraction of a panic payload message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_guarded_returns_output() {
        assert_eq!(run_guarded("ok", async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_run_guarded_swallows_panic() {
        let out: Option<()> = run_guarded("boom", async { panic!("timer exploded") }).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_spawn_tracked_survives_panic() {
        let tracker = TaskTracker::new();
        spawn_tracked(&tracker, "boom", async { panic!("dispatch exploded") });
        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
    }
}
