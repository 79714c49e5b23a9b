//! Background task execution
//!
//! Long operations such as a flash run or a repeating scenario execute on
//! their own task so callers stay responsive. Cancellation is cooperative:
//! the operation receives a shared flag and checks it between steps, so an
//! in-flight bus wait always completes (or times out) before the
//! cancellation takes effect.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};

/// Shared cancellation flag checked between steps of a long operation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to an operation submitted via [`submit`].
pub struct TaskHandle<T> {
    cancel: CancelFlag,
    handle: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Request cooperative cancellation. The operation stops at its next
    /// checkpoint, which bounds the latency to one service timeout.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the operation's cancellation flag, for callers that
    /// need to trigger cancellation after the handle has been consumed.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the operation to finish and return its result.
    pub async fn join(self) -> Result<T, JoinError> {
        self.handle.await
    }
}

/// Run an operation on a background task, handing it a cancellation flag.
pub fn submit<F, Fut, T>(operation: F) -> TaskHandle<T>
where
    F: FnOnce(CancelFlag) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancelFlag::new();
    let handle = tokio::spawn(operation(cancel.clone()));
    TaskHandle { cancel, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submitted_operation_completes() {
        let handle = submit(|_cancel| async { 7 * 6 });
        assert_eq!(handle.join().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_cancel_stops_operation_at_checkpoint() {
        let handle = submit(|cancel| async move {
            let mut steps = 0u32;
            for _ in 0..1000 {
                if cancel.is_cancelled() {
                    break;
                }
                steps += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            steps
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();

        let steps = handle.join().await.unwrap();
        assert!(steps < 1000, "operation ran to completion despite cancel");
    }

    #[tokio::test]
    async fn test_flag_starts_clear() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }
}
