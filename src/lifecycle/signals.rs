//! OS signal handling.
//!
//! # Responsibilities
//! - Translate Ctrl-C into run cancellation
//! - A second Ctrl-C exits the process immediately

use crate::lifecycle::cancellation::RunCancellation;

/// Spawn a task that cancels `cancel` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(cancel: RunCancellation) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::warn!("Interrupt received, cancelling run (press Ctrl-C again to abort)");
        cancel.trigger();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Second interrupt, aborting");
            std::process::exit(130);
        }
    })
}
