//! # Configuration Management
//!
//! Loads worker configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables with the `APP__` prefix (`APP__QUEUE__STAGE_TIMEOUT_SECS=600`)
//! - The host application's legacy variables `ETHOS_FFMPEG_PATH`, `ETHOS_PYTHON_PATH`
//!   and `ETHOS_MODELS_PATH`, which win over everything else
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the `config` crate deserializes the merged sources straight into these structs
//! - **Layered builder**: each `add_source` call overrides the keys of the ones before it
//! - **AppResult<T>**: loading and validation failures become `OrchestratorError::Config`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Legacy `ETHOS_*` variables
//! 2. `APP__*` environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values

use crate::error::{AppResult, OrchestratorError};
use crate::job::ModelVariant;
use serde::{Deserialize, Serialize};  // config.toml and APP__ variables land here
use std::env;                         // For the legacy ETHOS_* overrides
use std::path::PathBuf;
use std::time::Duration;

/// Top-level worker configuration.
///
/// ## Rust Concepts:
/// - **#[derive(Serialize)]**: lets `AppConfig::default()` seed the builder as its lowest layer
/// - **#[derive(Deserialize)]**: turns the merged layers back into typed fields
///
/// ## Why separate config structs:
/// Engine locations, scheduling, and logging change for different reasons and
/// are overridden by different people (packager, host app, operator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub transcriber: TranscriberConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Where the two external engines and their inputs live.
///
/// ## Fields:
/// - `ffmpeg_path`: normalizer executable (resolved through `PATH` when bare)
/// - `python_path`: interpreter used to run the recognition script
/// - `script_path`: recognition script, invoked as `--audio --model --output`
/// - `models_root`: directory holding one sub-directory per model variant
/// - `fast_model_dir` / `accurate_model_dir`: sub-directory names under `models_root`
/// - `temp_dir`: scratch directory for normalized audio and transcripts (empty = OS temp dir)
///
/// ## Common values:
/// - `python_path = "/opt/ethos/venv/bin/python"`: the bundled virtualenv of the desktop app
/// - `temp_dir = ""`: use `/tmp` (or the platform equivalent)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriberConfig {
    pub ffmpeg_path: String,
    pub python_path: String,
    pub script_path: String,
    pub models_root: String,
    pub fast_model_dir: String,
    pub accurate_model_dir: String,
    pub temp_dir: String,
}

/// Scheduling behaviour.
///
/// ## Fields:
/// - `notify_pending_cancel`: emit a `cancelled` job_update when a job that never
///   started is cancelled
/// - `stage_timeout_secs`: kill a stage that runs longer than this (0 disables)
///
/// ## Tuning guidelines:
/// - Recognition of long recordings on CPU can take many minutes, so a timeout
///   should be generous or left off
/// - Hosts that drop pending jobs from their own list on cancel can turn
///   `notify_pending_cancel` off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub notify_pending_cancel: bool,
    pub stage_timeout_secs: u64,  // u64 so that 0 can mean "no limit"
}

/// Log output settings. Logs always go to stderr, stdout belongs to the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, `RUST_LOG` overrides it
    pub filter: String,
    /// Emit JSON log lines on stderr instead of the human-readable format
    pub json: bool,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The desktop host starts the worker with nothing but the `ETHOS_*` variables,
/// so the defaults must describe a working install on their own.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transcriber: TranscriberConfig {
                ffmpeg_path: "ffmpeg".to_string(),                       // Found through PATH
                python_path: "python".to_string(),                       // Found through PATH
                script_path: "scripts/whisper_transcribe.py".to_string(),
                models_root: "models".to_string(),                       // Relative to the working dir
                fast_model_dir: "large-v3-ct2".to_string(),
                accurate_model_dir: "distil-whisper-large-v3-ptbr-ct2".to_string(),
                temp_dir: String::new(),                                 // OS temp dir
            },
            queue: QueueConfig {
                notify_pending_cancel: true,  // Hosts persist every job_update
                stage_timeout_secs: 0,        // No limit
            },
            logging: LoggingConfig {
                filter: "ethos_transcriber=info".to_string(),
                json: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__TRANSCRIBER__PYTHON_PATH=/opt/venv/bin/python`
    /// - `APP__QUEUE__NOTIFY_PENDING_CANCEL=false`
    /// - `ETHOS_MODELS_PATH=/srv/models`: legacy override kept for the desktop host
    ///
    /// ## Error Handling:
    /// Every `?` below converts `config::ConfigError` into `OrchestratorError::Config`.
    pub fn load() -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),  // "false" / "600" become bool / u64
            );

        if let Ok(ffmpeg) = env::var("ETHOS_FFMPEG_PATH") {
            settings = settings.set_override("transcriber.ffmpeg_path", ffmpeg)?;
        }

        if let Ok(python) = env::var("ETHOS_PYTHON_PATH") {
            settings = settings.set_override("transcriber.python_path", python)?;
        }

        if let Ok(models) = env::var("ETHOS_MODELS_PATH") {
            settings = settings.set_override("transcriber.models_root", models)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the worker cannot run with.
    ///
    /// Paths are not checked for existence here: a missing engine is reported
    /// per job as a stage failure, so the host still gets a useful message.
    pub fn validate(&self) -> AppResult<()> {
        let t = &self.transcriber;

        if t.ffmpeg_path.trim().is_empty() {
            return Err(invalid("Normalizer executable (ffmpeg_path) cannot be empty"));
        }

        if t.python_path.trim().is_empty() {
            return Err(invalid("Recognizer interpreter (python_path) cannot be empty"));
        }

        if t.script_path.trim().is_empty() {
            return Err(invalid("Recognition script path cannot be empty"));
        }

        if t.fast_model_dir == t.accurate_model_dir {
            return Err(invalid("Fast and accurate models must point at different directories"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> OrchestratorError {
    OrchestratorError::Config(message.to_string())
}

impl TranscriberConfig {
    /// Directory holding the recognition configuration for `model`.
    pub fn model_path(&self, model: ModelVariant) -> PathBuf {
        let dir = match model {
            ModelVariant::Fast => &self.fast_model_dir,
            ModelVariant::Accurate => &self.accurate_model_dir,
        };
        PathBuf::from(&self.models_root).join(dir)
    }

    /// Scratch directory for per-job temporary files.
    pub fn scratch_dir(&self) -> PathBuf {
        if self.temp_dir.trim().is_empty() {
            env::temp_dir()
        } else {
            PathBuf::from(&self.temp_dir)
        }
    }
}

impl QueueConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        match self.stage_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
