//! Cooperative cancellation.
//!
//! A watch-channel pair: [`CancelSource`] flips the flag, [`CancelToken`]
//! observes it. Tokens are cheap to clone and are threaded through every
//! blocking wait (dequeue, lock acquire) and into job contexts, so a
//! runner can be stopped at any of its wait points instead of only
//! between items.

use tokio::sync::watch;

/// The cancelling side. Dropping the source without calling
/// [`CancelSource::cancel`] leaves its tokens uncancelled forever.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.tx.send(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never be cancelled, for callers that have no
    /// cancellation story.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the
    /// source is dropped uncancelled, which makes it safe to park on in
    /// `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });

        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn dropped_source_never_cancels() {
        let source = CancelSource::new();
        let token = source.token();
        drop(source);

        assert!(!token.is_cancelled());
        let wait = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(wait.is_err(), "cancelled() must keep pending");
    }

    #[tokio::test]
    async fn never_token_is_inert() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
