//! Cancellation shared by a signing request, its prompts, and tracker pollers

use ledgerkey_core::{Error, Result};
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

/// One-way cancellation flag; clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Token in the live state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `cancel` has been called on any clone
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel and wake everything waiting in [`CancelToken::cancelled`]
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once cancelled
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Drive `work` unless cancelled first, which yields `UserCancelled`
    pub async fn run<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        if self.is_cancelled() {
            return Err(Error::UserCancelled);
        }
        tokio::select! {
            result = work => result,
            _ = self.cancelled() => Err(Error::UserCancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_stops_pending_work() {
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<()> = token.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::UserCancelled)));
    }

    #[tokio::test]
    async fn test_run_after_cancel_never_starts() {
        let token = CancelToken::new();
        token.cancel();
        let result = token.run(async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::UserCancelled)));
    }

    #[tokio::test]
    async fn test_run_passes_results_through() {
        let token = CancelToken::new();
        assert_eq!(token.run(async { Ok(7) }).await.unwrap(), 7);
        let failed: Result<()> = token.run(async { Err(Error::Network("down".into())) }).await;
        assert!(matches!(failed, Err(Error::Network(_))));
    }
}
