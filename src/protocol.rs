//! # Control Protocol
//!
//! Message shapes exchanged with the host over the worker's standard streams.
//! Every message is a single JSON object on its own line with a `type`
//! discriminator and a `payload` body.
//!
//! ## Inbound (host → worker):
//! - `enqueue` `{id, sessionId, audioPath, model}`
//! - `cancel` `{jobId}`
//! - `status` `{jobId}`
//!
//! ## Outbound (worker → host):
//! - `job_update`: full job record snapshot, on every status/progress transition
//! - `job_result` `{jobId, transcript}`: once per completed job, right before its final update
//! - `job_error` `{jobId, error}`: rejected requests and unknown-job queries

use crate::error::AppResult;
use crate::job::JobRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Messages the host may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    Enqueue(EnqueueRequest),
    Cancel(JobRef),
    Status(JobRef),
}

/// Payload of an `enqueue` command.
///
/// `model` is kept as a raw string here: an unknown model is a validation error
/// reported back to the host, not a malformed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub id: String,
    pub session_id: String,
    pub audio_path: PathBuf,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: String,
}

/// Messages the worker emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    JobUpdate(JobRecord),
    JobResult(JobResultPayload),
    JobError(JobErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultPayload {
    pub job_id: String,
    pub transcript: Transcript,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorPayload {
    pub job_id: String,
    pub error: String,
}

/// Transcript as delivered to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub language: String,
    pub full_text: String,
    pub segments: Vec<TranscriptSegment>,
}

/// One timed span of recognized speech, in seconds from the start of the audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Decode one inbound line.
///
/// Blank lines yield `Ok(None)`. Anything that is not a recognized message
/// (bad JSON, missing or unknown `type`, missing payload fields) is a protocol error.
pub fn parse_line(line: &str) -> AppResult<Option<InboundMessage>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let message = serde_json::from_str(line)?;
    Ok(Some(message))
}

/// Encode one outbound message as a newline-terminated JSON line.
pub fn encode_line(message: &OutboundMessage) -> AppResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
