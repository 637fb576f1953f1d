//! Batch progress events.

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::geocode::{FailureReason, ResolutionSource};

/// Progress of one batch run, for a front end's progress display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        run_id: Uuid,
        total: usize,
        distinct: usize,
    },
    Resolved {
        index: usize,
        source: ResolutionSource,
    },
    Unresolved {
        index: usize,
        reason: FailureReason,
    },
    Finished {
        run_id: Uuid,
        resolved: usize,
        unresolved: usize,
        cancelled: bool,
    },
}

/// Optional event sink. Sending never blocks and never fails the run.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<BatchEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops every event.
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching any more.
            let _ = tx.send(event);
        }
    }
}
