//! Run cancellation signal.

use tokio::sync::watch;

/// Run-scoped cancellation flag.
///
/// Clones share the same flag. Once triggered it stays triggered; every
/// waiter on [`RunCancellation::cancelled`] wakes up.
#[derive(Debug, Clone)]
pub struct RunCancellation {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl RunCancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Cancel the run.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the run is cancelled. Returns immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so wait_for only ends on `true`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for RunCancellation {
    fn default() -> Self {
        Self::new()
    }
}
