//! Cooperative cancellation signal shared between a run's owner and its worker.

use tokio_util::sync::CancellationToken as SignalToken;

/// A once-set, many-read cancellation flag.
///
/// The worker polls [`is_signaled`](Self::is_signaled) between pipeline stages;
/// the scheduler side can await [`signaled`](Self::signaled). Signalling never
/// interrupts the worker thread itself.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: SignalToken,
}

impl CancellationToken {
    /// Create a new, unsignaled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Calling this more than once has no further effect.
    pub fn signal(&self) {
        self.inner.cancel();
    }

    /// Non-blocking read of the flag, safe from any thread.
    pub fn is_signaled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once the token has been signaled.
    pub async fn signaled(&self) {
        self.inner.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_starts_unsignaled() {
        let token = CancellationToken::new();
        assert!(!token.is_signaled());
    }

    #[test]
    fn test_signal_is_idempotent() {
        let token = CancellationToken::new();
        token.signal();
        token.signal();
        assert!(token.is_signaled());
    }

    #[test]
    fn test_clone_shares_flag_across_threads() {
        let token = CancellationToken::new();
        let worker_view = token.clone();

        let handle = std::thread::spawn(move || {
            while !worker_view.is_signaled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            true
        });

        token.signal();
        assert!(handle.join().expect("worker thread panicked"));
    }

    #[tokio::test]
    async fn test_signaled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.signaled().await });

        token.signal();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("signaled() did not resolve")
            .expect("task panicked");
    }
}
