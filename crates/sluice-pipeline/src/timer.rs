//! Periodic progress reporting.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Invokes a callback at a fixed interval until dropped.
///
/// Used by the batching stages to report read progress; it has no effect on
/// correctness.
pub struct ProgressTicker {
    task: JoinHandle<()>,
}

impl ProgressTicker {
    pub fn spawn<F>(interval: Duration, tick: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);

            // The first tick of an interval fires immediately.
            timer.tick().await;

            loop {
                timer.tick().await;
                tick();
            }
        });

        Self { task }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
