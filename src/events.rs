//! # Event Emitter
//!
//! Turns job state transitions into outbound control messages. The emitter only
//! enqueues messages on an unbounded channel; the control channel's writer task
//! owns stdout and writes them in order, so emitting never blocks the queue loop.

use crate::job::JobRecord;
use crate::protocol::{JobErrorPayload, JobResultPayload, OutboundMessage, Transcript};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl EventEmitter {
    /// Create an emitter together with the receiving end the writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Snapshot of `job` after a status or progress transition.
    pub fn job_update(&self, job: &JobRecord) {
        debug!(
            job_id = %job.id,
            status = %job.status,
            progress = job.progress,
            "job_update"
        );
        self.send(OutboundMessage::JobUpdate(job.clone()));
    }

    pub fn job_result(&self, job_id: &str, transcript: Transcript) {
        self.send(OutboundMessage::JobResult(JobResultPayload {
            job_id: job_id.to_string(),
            transcript,
        }));
    }

    pub fn job_error(&self, job_id: &str, error: impl Into<String>) {
        self.send(OutboundMessage::JobError(JobErrorPayload {
            job_id: job_id.to_string(),
            error: error.into(),
        }));
    }

    fn send(&self, message: OutboundMessage) {
        // Only fails once the writer is gone, i.e. the host closed our stdout.
        if self.tx.send(message).is_err() {
            warn!("Control channel writer closed, dropping outbound message");
        }
    }
}
