//! One-shot delayed callbacks.
//!
//! Scripts are triggered through the [`Scheduler`] contract. Each scheduled
//! callback carries a [`CancellationToken`]; cancelling it before the delay
//! elapses means the callback never fires.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

/// Shared cancellation flag for one scheduled occurrence.
pub use tokio_util::sync::CancellationToken;

/// Callback run when a scheduled occurrence fires.
pub type ScheduledCallback = Box<dyn FnOnce(CancellationToken) + Send + 'static>;

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to create scheduler runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Handle to a scheduled occurrence.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    label: String,
    token: CancellationToken,
}

impl ScheduleHandle {
    pub fn new(label: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            label: label.into(),
            token,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Prevent the occurrence from firing if it has not fired yet.
    pub fn cancel(&self) {
        debug!(label = %self.label, "Cancelling scheduled callback");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Accepts delayed, cancellable one-shot callbacks.
///
/// Callbacks must return promptly; long-running work belongs on its own thread.
pub trait Scheduler: Send + Sync {
    fn schedule_one_time(
        &self,
        callback: ScheduledCallback,
        label: &str,
        delay: Duration,
        user_message: Option<&str>,
    ) -> ScheduleHandle;
}

enum RuntimeHandle {
    Owned(Runtime),
    Borrowed(Handle),
}

/// [`Scheduler`] backed by a tokio runtime.
pub struct TokioScheduler {
    runtime: RuntimeHandle,
}

impl TokioScheduler {
    /// Create a scheduler with its own single-worker runtime.
    pub fn new() -> Result<Self, SchedulerError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sensus-scheduler")
            .enable_time()
            .build()?;

        Ok(Self {
            runtime: RuntimeHandle::Owned(runtime),
        })
    }

    /// Schedule onto an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            runtime: RuntimeHandle::Borrowed(handle),
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            RuntimeHandle::Owned(runtime) => {
                runtime.spawn(future);
            }
            RuntimeHandle::Borrowed(handle) => {
                handle.spawn(future);
            }
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_one_time(
        &self,
        callback: ScheduledCallback,
        label: &str,
        delay: Duration,
        user_message: Option<&str>,
    ) -> ScheduleHandle {
        let token = CancellationToken::new();
        let handle = ScheduleHandle::new(label, token.clone());
        let label = label.to_string();
        let user_message = user_message.map(str::to_string);

        debug!(label = %label, delay_ms = delay.as_millis() as u64, "Scheduling one-time callback");

        self.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(label = %label, "Scheduled callback cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    if token.is_cancelled() {
                        return;
                    }
                    if let Some(message) = user_message {
                        info!(label = %label, "{message}");
                    }
                    callback(token.clone());
                }
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_callback_fires_after_delay() {
        let scheduler = TokioScheduler::new().unwrap();
        let (tx, rx) = bounded(1);

        scheduler.schedule_one_time(
            Box::new(move |token: CancellationToken| {
                let _ = tx.send(token.is_cancelled());
            }),
            "fire",
            Duration::from_millis(10),
            None,
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }

    #[test]
    fn test_cancelled_callback_never_fires() {
        let scheduler = TokioScheduler::new().unwrap();
        let (tx, rx) = bounded::<()>(1);

        let handle = scheduler.schedule_one_time(
            Box::new(move |_token: CancellationToken| {
                let _ = tx.send(());
            }),
            "cancel",
            Duration::from_millis(200),
            Some("Your input is requested."),
        );
        handle.cancel();

        assert!(handle.is_cancelled());
        assert_eq!(handle.label(), "cancel");
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_schedules_onto_existing_runtime() {
        let runtime = Builder::new_current_thread().enable_time().build().unwrap();
        let scheduler = TokioScheduler::from_handle(runtime.handle().clone());
        let (tx, rx) = bounded(1);

        scheduler.schedule_one_time(
            Box::new(move |_token: CancellationToken| {
                let _ = tx.send(());
            }),
            "borrowed",
            Duration::from_millis(5),
            None,
        );

        // A current-thread runtime only makes progress while it is driven.
        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(50)).await });
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
