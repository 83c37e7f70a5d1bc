//! Cooperative cancellation.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::SyncError;

/// Cloneable flag that tells a push or pull to stop.
///
/// Cancellation is observed before each chunk transfer, while waiting on
/// I/O, and before the manifest commit. A cancelled run never commits its
/// manifest, so it can always be retried from the start.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Return [`SyncError::Cancelled`] if cancellation has been signalled.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token, so this only
        // returns once the flag is set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
