//! Per-binding serialized work queue.
//!
//! One dedicated worker thread drains an unbounded channel, executing
//! submitted routines strictly one at a time in submission order. This is
//! the sole serialization mechanism for binding state mutation: no lock is
//! held while a routine runs, so routines are free to block (e.g. waiting on
//! a provider detach notification) without risking deadlock against
//! registry-level locks.

use std::thread::{self, ThreadId};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::error::BindError;

/// A scheduled action plus the submitting thread's identity, kept as a
/// locality hint for observability. Scheduling does not depend on it.
struct WorkItem {
    submitted_from: ThreadId,
    routine: Box<dyn FnOnce() + Send>,
}

/// Single-consumer serialized queue. Dropping the queue disconnects the
/// channel; the worker drains whatever is still pending and exits.
pub(crate) struct WorkQueue {
    tx: Sender<WorkItem>,
    label: String,
}

impl WorkQueue {
    /// Spawn the worker thread. Thread spawn failure surfaces as
    /// [`BindError::ResourceExhausted`].
    pub(crate) fn start(label: String) -> Result<Self, BindError> {
        let (tx, rx) = channel::unbounded();
        let worker_label = label.clone();
        thread::Builder::new()
            .name(format!("ifbind-wq-{label}"))
            .spawn(move || worker_loop(&worker_label, rx))
            .map_err(|e| BindError::ResourceExhausted(format!("work queue thread: {e}")))?;
        Ok(Self { tx, label })
    }

    /// Submit a routine for serialized execution. Items never jump the
    /// queue; submission order is execution order.
    pub(crate) fn submit(&self, routine: Box<dyn FnOnce() + Send>) {
        let item = WorkItem {
            submitted_from: thread::current().id(),
            routine,
        };
        if self.tx.send(item).is_err() {
            // Unreachable while the queue owner is alive: the worker only
            // stops after every sender is gone.
            debug!(
                event.name = "work_queue.submit_after_shutdown",
                queue.label = %self.label,
                "work item dropped, queue already shut down"
            );
        }
    }
}

fn worker_loop(label: &str, rx: Receiver<WorkItem>) {
    trace!(
        event.name = "work_queue.worker_started",
        queue.label = %label,
        "work queue worker running"
    );

    while let Ok(item) = rx.recv() {
        trace!(
            event.name = "work_queue.item_executing",
            queue.label = %label,
            submitted_from = ?item.submitted_from,
            "executing work item"
        );
        (item.routine)();
    }

    trace!(
        event.name = "work_queue.worker_stopped",
        queue.label = %label,
        "work queue channel disconnected, worker exiting"
    );
}
