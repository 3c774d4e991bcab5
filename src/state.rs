//! Server lifecycle latches.
//!
//! `ServerState` is the single coordination point for shutdown: background
//! loops subscribe to it, the signal handler and fatal-error paths raise it,
//! and the binary's exit code is derived from the error latch. Both latches
//! are monotonic: once raised they stay raised.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

pub struct ServerState {
    shutdown: watch::Sender<bool>,
    error: Mutex<Option<String>>,
}

impl ServerState {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            error: Mutex::new(None),
        }
    }

    /// Request a graceful shutdown. Idempotent; the reason is logged once.
    pub fn signal_shutdown(&self, reason: &str) {
        if !self.shutdown.send_replace(true) {
            info!(reason, "Shutdown signalled");
        }
    }

    /// Record a fatal error and raise the shutdown latch.
    ///
    /// Only the first message is kept; later errors are logged but do not
    /// overwrite it.
    pub fn signal_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(error = %message, "Fatal server error");
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(message);
            }
        }
        self.shutdown.send_replace(true);
    }

    pub fn should_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Receiver for `select!`-style interruptible waits in worker loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Block until shutdown is signalled or the timeout elapses.
    ///
    /// Returns true when the latch was raised, false on timeout. Waiting is
    /// event-based; no polling happens underneath.
    pub async fn wait_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.shutdown.subscribe();
        let raised = rx.wait_for(|v| *v);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, raised).await.is_ok(),
            None => {
                let _ = raised.await;
                true
            }
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_clean() {
        let state = ServerState::new();
        assert!(!state.should_shutdown());
        assert!(!state.has_error());
        assert_eq!(state.error_message(), None);
    }

    #[tokio::test]
    async fn shutdown_is_monotonic_and_idempotent() {
        let state = ServerState::new();
        state.signal_shutdown("test");
        state.signal_shutdown("again");
        assert!(state.should_shutdown());
        assert!(!state.has_error());
    }

    #[tokio::test]
    async fn error_implies_shutdown_and_first_message_wins() {
        let state = ServerState::new();
        state.signal_error("first failure");
        state.signal_error("second failure");
        assert!(state.should_shutdown());
        assert!(state.has_error());
        assert_eq!(state.error_message().as_deref(), Some("first failure"));
    }

    #[tokio::test]
    async fn wait_returns_false_on_timeout() {
        let state = ServerState::new();
        assert!(
            !state
                .wait_for_shutdown(Some(Duration::from_millis(20)))
                .await
        );
    }

    #[tokio::test]
    async fn wait_wakes_on_signal() {
        let state = std::sync::Arc::new(ServerState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_shutdown(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.signal_shutdown("wake");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_raised() {
        let state = ServerState::new();
        state.signal_shutdown("pre-raised");
        assert!(state.wait_for_shutdown(None).await);
    }
}
