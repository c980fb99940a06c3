//! # Job Record
//!
//! In-memory descriptor of one transcription request and its lifecycle state.
//! Records live only as long as the job: they are dropped as soon as a terminal
//! state has been reported, the worker keeps no history.
//!
//! ## Job Lifecycle:
//! 1. **Queued**: accepted, waiting for the running slot (progress 0.0)
//! 2. **Running**: pipeline started (0.1), audio normalized (0.3)
//! 3. **Completed**: transcript produced (1.0)
//! 4. **Failed**: a stage failed, `error` holds the reason
//! 5. **Cancelled**: cancelled by the host, either before or during execution
//!
//! Completed, failed and cancelled are terminal: no transition leaves them.
//!
//! ## Key Rust Concepts Used:
//! - **enum + match**: every transition method matches on the current status, so an
//!   illegal transition is an `Err` instead of a silently corrupted record
//! - **#[serde(rename_all)]**: the same types are the wire format, no DTO layer
//! - **FromStr**: `"fast".parse::<ModelVariant>()` validates untrusted input

use crate::error::{AppResult, OrchestratorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Progress checkpoint when a job is accepted.
pub const PROGRESS_QUEUED: f64 = 0.0;
/// Progress checkpoint when the pipeline starts.
pub const PROGRESS_STARTED: f64 = 0.1;
/// Progress checkpoint once normalized audio is available.
pub const PROGRESS_NORMALIZED: f64 = 0.3;
/// Progress checkpoint for a completed job.
pub const PROGRESS_DONE: f64 = 1.0;

/// Status of a job as reported to the host.
///
/// ## Rust Concepts:
/// - **Copy**: a one-byte enum is cheaper to copy than to borrow
/// - **#[serde(rename_all = "lowercase")]**: `Running` goes on the wire as `"running"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Wire name, also used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// `true` for states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognition configuration requested for a job.
///
/// The desktop host historically sends `ptbr-fast` / `ptbr-accurate`; both spellings
/// are accepted, the short form is what we report back.
///
/// ## Variants:
/// - `Fast`: general multilingual model, quicker on CPU
/// - `Accurate`: Portuguese fine-tuned model, slower but better on pt-BR speech
///
/// Which directory each variant loads from is decided by `TranscriberConfig::model_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "fast", alias = "ptbr-fast")]
    Fast,
    #[serde(rename = "accurate", alias = "ptbr-accurate")]
    Accurate,
}

impl ModelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Fast => "fast",
            ModelVariant::Accurate => "accurate",
        }
    }
}

/// Parses the `model` field of an enqueue request.
///
/// ## Error Handling:
/// Unknown names are `OrchestratorError::Validation`, which the queue turns
/// into a `job_error` reply instead of creating a record.
impl FromStr for ModelVariant {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s {
            "fast" | "ptbr-fast" => Ok(ModelVariant::Fast),
            "accurate" | "ptbr-accurate" => Ok(ModelVariant::Accurate),
            other => Err(OrchestratorError::Validation(format!(
                "unknown model '{}', expected 'fast' or 'accurate'",
                other
            ))),
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot-able state of one job. Serialized verbatim as the `job_update` payload.
///
/// ## Fields:
/// - `id` / `session_id`: chosen by the host, echoed back untouched
/// - `audio_path`: the host's recording; the worker deletes it once the job ends
/// - `progress`: one of the `PROGRESS_*` checkpoints, never decreasing
/// - `error`: only present on failed jobs
///
/// ## Ownership:
/// The queue owns the record. Every `job_update` carries a clone taken at
/// emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub session_id: String,
    pub audio_path: PathBuf,
    pub model: ModelVariant,
    pub status: JobStatus,
    pub progress: f64,                // 0.0 to 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,    // RFC 3339 on the wire
    pub updated_at: DateTime<Utc>,    // Bumped by every transition
}

impl JobRecord {
    /// Create a freshly queued record.
    pub fn new(id: String, session_id: String, audio_path: PathBuf, model: ModelVariant) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            audio_path,
            model,
            status: JobStatus::Queued,
            progress: PROGRESS_QUEUED,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued → Running
    ///
    /// ## Returns:
    /// - `Ok(())`: status is now running at the started checkpoint
    /// - `Err(String)`: the record was not queued, nothing changed
    pub fn start(&mut self) -> Result<(), String> {
        match self.status {
            JobStatus::Queued => {
                self.transition(JobStatus::Running);
                self.advance_progress(PROGRESS_STARTED);
                Ok(())
            }
            other => Err(format!("Cannot start job from status: {}", other)),
        }
    }

    /// Running → Running, normalized checkpoint.
    pub fn mark_normalized(&mut self) -> Result<(), String> {
        match self.status {
            JobStatus::Running => {
                self.advance_progress(PROGRESS_NORMALIZED);
                self.touch();
                Ok(())
            }
            other => Err(format!("Cannot mark normalized from status: {}", other)),
        }
    }

    /// Running → Completed
    pub fn complete(&mut self) -> Result<(), String> {
        match self.status {
            JobStatus::Running => {
                self.transition(JobStatus::Completed);
                self.advance_progress(PROGRESS_DONE);
                Ok(())
            }
            other => Err(format!("Cannot complete job from status: {}", other)),
        }
    }

    /// Running → Failed
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), String> {
        match self.status {
            JobStatus::Running => {
                self.transition(JobStatus::Failed);
                self.error = Some(error.into());
                Ok(())
            }
            other => Err(format!("Cannot fail job from status: {}", other)),
        }
    }

    /// Queued/Running → Cancelled
    pub fn cancel(&mut self) -> Result<(), String> {
        match self.status {
            JobStatus::Queued | JobStatus::Running => {
                self.transition(JobStatus::Cancelled);
                Ok(())
            }
            other => Err(format!("Cannot cancel job from status: {}", other)),
        }
    }

    fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.touch();
    }

    // Progress never moves backwards.
    fn advance_progress(&mut self, checkpoint: f64) {
        self.progress = self.progress.max(checkpoint).clamp(0.0, 1.0);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
