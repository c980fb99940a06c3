//! # Job Pipeline
//!
//! The two-stage recipe applied to one job:
//!
//! 1. **Normalize**: `ffmpeg` converts the caller's audio into a mono 16 kHz wav
//! 2. **Recognize**: the recognition script turns the wav into a transcript file
//! 3. **Cleanup**: temporary files and the caller's audio are deleted, on every path
//!
//! Stages run as short-lived tasks that only report back how they ended; every
//! change to the job record happens in [`RunningJob`], driven by the queue loop.
//! The engine writes its result to a file we name, never to stdout, so its
//! progress chatter cannot be confused with the transcript.

use crate::config::{AppConfig, TranscriberConfig};
use crate::error::{AppResult, OrchestratorError};
use crate::events::EventEmitter;
use crate::job::{JobRecord, ModelVariant};
use crate::process::{ExitOutcome, StageCommand, SubprocessRunner};
use crate::protocol::{Transcript, TranscriptSegment};
use crate::queue::OrchestratorEvent;
use serde::Deserialize;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Target sample rate for normalized audio.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Recognize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Recognize => "recognize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage ended, as seen from the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Normalized,
    Recognized(Transcript),
    Failed(String),
    /// The process was killed on request; the job is already cancelled.
    Interrupted,
}

/// Stage completion notice posted back to the queue loop.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub job_id: String,
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// What the queue loop should do after a stage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue(Stage),
    Finished,
}

/// Result file layout written by the recognition script.
#[derive(Debug, Deserialize)]
struct EngineOutput {
    language: String,
    full_text: String,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

impl From<EngineOutput> for Transcript {
    fn from(output: EngineOutput) -> Self {
        Transcript {
            language: output.language,
            full_text: output.full_text,
            segments: output.segments,
        }
    }
}

/// Files owned by one job. Cleanup consumes the workspace, so it cannot run twice.
#[derive(Debug)]
pub struct JobWorkspace {
    audio_path: PathBuf,
    normalized_path: PathBuf,
    transcript_path: PathBuf,
}

impl JobWorkspace {
    pub fn new(scratch_dir: &Path, audio_path: PathBuf) -> Self {
        let token = Uuid::new_v4();
        Self {
            audio_path,
            normalized_path: scratch_dir.join(format!("ethos-{}.wav", token)),
            transcript_path: scratch_dir.join(format!("ethos-transcript-{}.json", token)),
        }
    }

    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    pub fn normalized_path(&self) -> &Path {
        &self.normalized_path
    }

    pub fn transcript_path(&self) -> &Path {
        &self.transcript_path
    }

    /// Delete every file the job touched. Failures are logged and swallowed.
    pub async fn cleanup(self) {
        for path in [&self.normalized_path, &self.transcript_path, &self.audio_path] {
            remove_quietly(path).await;
        }
    }
}

/// Delete `path`, ignoring a file that is already gone.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Could not remove file"),
    }
}

/// Stage runner configuration shared by every job.
#[derive(Debug, Clone)]
pub struct Pipeline {
    transcriber: TranscriberConfig,
    stage_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            transcriber: config.transcriber.clone(),
            stage_timeout: config.queue.stage_timeout(),
        }
    }

    pub fn workspace_for(&self, record: &JobRecord) -> JobWorkspace {
        JobWorkspace::new(&self.transcriber.scratch_dir(), record.audio_path.clone())
    }

    /// `ffmpeg -y -i <input> -ac 1 -ar 16000 -vn <output>`
    pub fn normalize_command(&self, input: &Path, output: &Path) -> StageCommand {
        StageCommand::new("ffmpeg", &self.transcriber.ffmpeg_path)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(TARGET_SAMPLE_RATE.to_string())
            .arg("-vn")
            .arg(output)
    }

    /// `<python> <script> --audio <wav> --model <model dir> --output <json>`
    pub fn recognize_command(&self, audio: &Path, model: ModelVariant, output: &Path) -> StageCommand {
        StageCommand::new("faster-whisper", &self.transcriber.python_path)
            .arg(&self.transcriber.script_path)
            .arg("--audio")
            .arg(audio)
            .arg("--model")
            .arg(self.transcriber.model_path(model))
            .arg("--output")
            .arg(output)
    }

    /// Run `stage` for the job described by `running` on a background task.
    ///
    /// The task posts exactly one [`StageReport`] when the stage ends.
    pub fn spawn_stage(
        self: &Arc<Self>,
        stage: Stage,
        running: &RunningJob,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
    ) {
        let command = match stage {
            Stage::Normalize => self.normalize_command(
                running.workspace.audio_path(),
                running.workspace.normalized_path(),
            ),
            Stage::Recognize => self.recognize_command(
                running.workspace.normalized_path(),
                running.record.model,
                running.workspace.transcript_path(),
            ),
        };
        let transcript_path = running.workspace.transcript_path().to_path_buf();
        let job_id = running.record.id.clone();
        let cancel = running.cancel.clone();
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            let outcome = pipeline
                .run_stage(stage, &command, &transcript_path, &cancel)
                .await;
            let report = StageReport { job_id, stage, outcome };
            if events.send(OrchestratorEvent::StageFinished(report)).is_err() {
                warn!(stage = %stage, "Queue loop is gone, stage report dropped");
            }
        });
    }

    async fn run_stage(
        &self,
        stage: Stage,
        command: &StageCommand,
        transcript_path: &Path,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let mut runner = match SubprocessRunner::start(command) {
            Ok(runner) => runner,
            Err(e) => return StageOutcome::Failed(e.to_string()),
        };

        let exit = match runner.run_to_exit(cancel, self.stage_timeout).await {
            Ok(exit) => exit,
            Err(e) => {
                return StageOutcome::Failed(format!("{} could not be awaited: {}", command.label, e))
            }
        };

        match exit {
            exit if exit.success() => match stage {
                Stage::Normalize => StageOutcome::Normalized,
                Stage::Recognize => match read_transcript(transcript_path).await {
                    Ok(transcript) => StageOutcome::Recognized(transcript),
                    Err(e) => StageOutcome::Failed(e.to_string()),
                },
            },
            ExitOutcome::Exited(Some(code)) => {
                StageOutcome::Failed(format!("{} failed with code {}", command.label, code))
            }
            ExitOutcome::Exited(None) => {
                StageOutcome::Failed(format!("{} was terminated by a signal", command.label))
            }
            ExitOutcome::TimedOut => StageOutcome::Failed(format!(
                "{} timed out after {}s",
                command.label,
                self.stage_timeout.map(|d| d.as_secs()).unwrap_or_default()
            )),
            ExitOutcome::Killed => StageOutcome::Interrupted,
        }
    }
}

async fn read_transcript(path: &Path) -> AppResult<Transcript> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        OrchestratorError::stage(format!("could not read transcript {}: {}", path.display(), e))
    })?;
    let output: EngineOutput = serde_json::from_str(&raw)
        .map_err(|e| OrchestratorError::stage(format!("invalid transcript output: {}", e)))?;
    Ok(output.into())
}

/// The job currently holding the running slot.
pub struct RunningJob {
    pub record: JobRecord,
    stage: Stage,
    workspace: JobWorkspace,
    cancel: CancellationToken,
}

impl RunningJob {
    /// Move a queued record into the running state and emit the start update.
    pub fn begin(mut record: JobRecord, pipeline: &Pipeline, emitter: &EventEmitter) -> AppResult<Self> {
        record.start().map_err(OrchestratorError::Internal)?;
        info!(job_id = %record.id, model = %record.model, "Job started");
        emitter.job_update(&record);

        let workspace = pipeline.workspace_for(&record);
        Ok(Self {
            record,
            stage: Stage::Normalize,
            workspace,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Whether `report` belongs to the stage this job is waiting on.
    pub fn expects(&self, report: &StageReport) -> bool {
        report.job_id == self.record.id && report.stage == self.stage
    }

    /// Apply a stage outcome to the record and emit the matching events.
    pub fn on_stage_finished(&mut self, outcome: StageOutcome, emitter: &EventEmitter) -> Step {
        // Cancelled while the stage was running: nothing left to report.
        if self.record.is_terminal() {
            return Step::Finished;
        }

        match (self.stage, outcome) {
            (Stage::Normalize, StageOutcome::Normalized) => {
                if let Err(e) = self.record.mark_normalized() {
                    warn!(job_id = %self.record.id, error = %e, "Unexpected transition");
                }
                emitter.job_update(&self.record);
                self.stage = Stage::Recognize;
                Step::Continue(Stage::Recognize)
            }
            (Stage::Recognize, StageOutcome::Recognized(transcript)) => {
                if let Err(e) = self.record.complete() {
                    warn!(job_id = %self.record.id, error = %e, "Unexpected transition");
                }
                info!(
                    job_id = %self.record.id,
                    language = %transcript.language,
                    segments = transcript.segments.len(),
                    "Job completed"
                );
                emitter.job_result(&self.record.id, transcript);
                emitter.job_update(&self.record);
                Step::Finished
            }
            (stage, StageOutcome::Failed(error)) => {
                warn!(job_id = %self.record.id, stage = %stage, error = %error, "Job failed");
                self.fail(error, emitter);
                Step::Finished
            }
            (stage, StageOutcome::Interrupted) => {
                self.fail(format!("{} stage was interrupted", stage), emitter);
                Step::Finished
            }
            (stage, outcome) => {
                self.fail(format!("unexpected {:?} from {} stage", outcome, stage), emitter);
                Step::Finished
            }
        }
    }

    /// Mark the job cancelled, report it, and ask the running stage to stop.
    ///
    /// The record is reported as cancelled right away; the stage still posts its
    /// report once the process is gone, and only then is the slot released.
    pub fn cancel(&mut self, emitter: &EventEmitter) -> Result<(), String> {
        self.record.cancel()?;
        info!(job_id = %self.record.id, stage = %self.stage, "Cancelling running job");
        emitter.job_update(&self.record);
        self.cancel.cancel();
        Ok(())
    }

    /// Delete the job's files and hand back the final record.
    pub async fn cleanup(self) -> JobRecord {
        self.workspace.cleanup().await;
        self.record
    }

    fn fail(&mut self, error: String, emitter: &EventEmitter) {
        if let Err(e) = self.record.fail(error) {
            warn!(job_id = %self.record.id, error = %e, "Unexpected transition");
        }
        emitter.job_update(&self.record);
    }
}
