//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Provides a thread-safe, async-aware cancellation token that can be:
//! - Cloned and shared across tasks
//! - Polled between units of work (chunk reads)
//! - Awaited in select! patterns to abandon a wait

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        loop {
            let notified = self.internal.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent cancel()
            // between the check and the await is not lost.
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_state() {
        let sos = SignalOfStop::new();
        let clone = sos.clone();
        assert!(!clone.cancelled());
        sos.cancel();
        assert!(clone.cancelled());
        clone.wait().await;
    }

    #[tokio::test]
    async fn wait_wakes_on_cancel() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { sos.wait().await })
        };
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
