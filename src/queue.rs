//! # Queue Manager
//!
//! Owns every piece of mutable job state: the FIFO of pending records and the
//! single running slot. All of it is touched from one loop consuming one channel
//! of [`OrchestratorEvent`]s, so the queue needs no locks.
//!
//! ## Event sources:
//! - **Inbound**: a control message decoded by the channel reader
//! - **StageFinished**: a pipeline stage task reporting how its process ended
//! - **InputClosed** / **Shutdown**: the host went away or asked us to stop
//!
//! ## Scheduling:
//! At most one job runs at a time. [`Orchestrator::schedule`] is the only place a
//! pipeline starts; it runs after every enqueue and after every job releases the
//! slot, so the queue drains without any trigger from the host.
//!
//! ## Key Rust Concepts Used:
//! - **Actor loop**: `run(mut self)` takes ownership, so nothing outside the loop
//!   can reach the queue state
//! - **mpsc::UnboundedSender**: cloned into the stdin reader, the signal handler and
//!   every stage task; they only ever send events
//! - **mem::replace**: moves the finished `RunningJob` out of the slot so its
//!   consuming `cleanup(self)` can run
//! - **VecDeque**: O(1) `push_back` / `pop_front` for FIFO order, `remove(i)` for cancels

use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::events::EventEmitter;
use crate::job::{JobRecord, JobStatus, ModelVariant};
use crate::pipeline::{remove_quietly, Pipeline, RunningJob, Stage, StageReport, Step};
use crate::protocol::{EnqueueRequest, InboundMessage};
use crate::state::WorkerMetrics;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the queue loop reacts to.
#[derive(Debug)]
pub enum OrchestratorEvent {
    Inbound(InboundMessage),
    /// An inbound line could not be decoded (counted, otherwise ignored).
    Malformed,
    StageFinished(StageReport),
    /// The host closed our stdin: finish queued work, then exit.
    InputClosed,
    /// Stop now: cancel everything, then exit.
    Shutdown,
}

/// The running slot.
///
/// A cancelled job stays `Running` until its killed process has been reaped
/// and cleanup has finished; only then is the slot `Idle` again.
enum Slot {
    Idle,
    Running(RunningJob),
}

/// The queue manager.
///
/// ## Fields:
/// - `pending`: queued records, oldest first
/// - `slot`: the one job allowed to run
/// - `pipeline`: shared with stage tasks, which outlive a single `handle` call
/// - `input_closed` / `shutting_down`: once either is set the loop exits as soon as
///   no work is left
///
/// ## Usage Example:
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(&config, emitter);
/// channel::spawn_reader(tokio::io::stdin(), orchestrator.sender());
/// let metrics = orchestrator.run().await;
/// ```
pub struct Orchestrator {
    pending: VecDeque<JobRecord>,
    slot: Slot,
    pipeline: Arc<Pipeline>,
    emitter: EventEmitter,
    notify_pending_cancel: bool,
    events_tx: mpsc::UnboundedSender<OrchestratorEvent>,  // Cloned by sender()
    events_rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    input_closed: bool,
    shutting_down: bool,
    metrics: WorkerMetrics,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, emitter: EventEmitter) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            pending: VecDeque::new(),
            slot: Slot::Idle,
            pipeline: Arc::new(Pipeline::new(config)),
            emitter,
            notify_pending_cancel: config.queue.notify_pending_cancel,
            events_tx,
            events_rx,
            input_closed: false,
            shutting_down: false,
            metrics: WorkerMetrics::default(),
        }
    }

    /// Handle for feeding events into the loop.
    pub fn sender(&self) -> mpsc::UnboundedSender<OrchestratorEvent> {
        self.events_tx.clone()
    }

    /// Process events until the input is closed (or shutdown requested) and no
    /// work is left. Returns the final counters.
    pub async fn run(mut self) -> WorkerMetrics {
        info!("Queue loop started");
        while let Some(event) = self.events_rx.recv().await {
            self.handle(event).await;
            if self.is_drained() {
                break;
            }
        }
        info!(
            enqueued = self.metrics.enqueued,
            completed = self.metrics.completed,
            failed = self.metrics.failed,
            cancelled = self.metrics.cancelled,
            rejected = self.metrics.rejected,
            malformed_lines = self.metrics.malformed_lines,
            uptime_seconds = self.metrics.uptime_seconds(),
            "Queue loop finished"
        );
        self.metrics
    }

    async fn handle(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::Inbound(InboundMessage::Enqueue(request)) => self.enqueue(request),
            OrchestratorEvent::Inbound(InboundMessage::Cancel(job)) => self.cancel(&job.job_id).await,
            OrchestratorEvent::Inbound(InboundMessage::Status(job)) => self.status(&job.job_id),
            OrchestratorEvent::Malformed => self.metrics.malformed_lines += 1,
            OrchestratorEvent::StageFinished(report) => self.on_stage_finished(report).await,
            OrchestratorEvent::InputClosed => {
                info!(pending = self.pending.len(), "Input closed, draining queue");
                self.input_closed = true;
            }
            OrchestratorEvent::Shutdown => self.shutdown().await,
        }
    }

    fn is_drained(&self) -> bool {
        (self.input_closed || self.shutting_down)
            && self.pending.is_empty()
            && matches!(self.slot, Slot::Idle)
    }

    /// Validate and queue a new job.
    ///
    /// ## Process:
    /// 1. Refuse new work while shutting down
    /// 2. Parse the model name, unknown names are answered with `job_error`
    /// 3. Create the queued record, report it, append it to the queue
    /// 4. Try to start it right away
    ///
    /// The audio file is left alone on rejection: ownership only passes to the
    /// worker once a record exists.
    pub fn enqueue(&mut self, request: EnqueueRequest) {
        if self.shutting_down {
            warn!(job_id = %request.id, "Rejecting job, worker is shutting down");
            self.metrics.rejected += 1;
            self.emitter.job_error(&request.id, "worker is shutting down");
            return;
        }

        let model = match request.model.parse::<ModelVariant>() {
            Ok(model) => model,
            Err(e) => {
                warn!(job_id = %request.id, error = %e, "Rejecting job");
                self.metrics.rejected += 1;
                let message = match e {
                    OrchestratorError::Validation(msg) => msg,
                    other => other.to_string(),
                };
                self.emitter.job_error(&request.id, message);
                return;
            }
        };

        let record = JobRecord::new(request.id, request.session_id, request.audio_path, model);
        info!(job_id = %record.id, session_id = %record.session_id, model = %model, "Job queued");
        self.emitter.job_update(&record);
        self.pending.push_back(record);
        self.metrics.enqueued += 1;

        self.schedule();
    }

    /// Cancel a pending or running job. Unknown ids are ignored.
    ///
    /// ## Behaviour:
    /// - **Running**: the record turns `cancelled` and is reported at once; the
    ///   process is killed and the slot is freed when its stage task reports back
    /// - **Pending**: removed from the queue, reported if `notify_pending_cancel`
    ///   is set, and its audio file deleted
    /// - **Finished or unknown**: nothing is emitted
    pub async fn cancel(&mut self, job_id: &str) {
        if let Slot::Running(running) = &mut self.slot {
            if running.id() == job_id {
                match running.cancel(&self.emitter) {
                    Ok(()) => self.metrics.cancelled += 1,
                    Err(e) => debug!(job_id, error = %e, "Cancel ignored"),
                }
                return;
            }
        }

        if let Some(index) = self.pending.iter().position(|job| job.id == job_id) {
            if let Some(mut record) = self.pending.remove(index) {
                if let Err(e) = record.cancel() {
                    warn!(job_id, error = %e, "Unexpected transition");
                }
                info!(job_id, "Cancelled pending job");
                if self.notify_pending_cancel {
                    self.emitter.job_update(&record);
                }
                // The caller handed the file over at enqueue; it goes with the job.
                remove_quietly(&record.audio_path).await;
                self.metrics.cancelled += 1;
            }
            return;
        }

        debug!(job_id, "Cancel for unknown job ignored");
    }

    /// Report the current snapshot of a live job.
    pub fn status(&self, job_id: &str) {
        if let Slot::Running(running) = &self.slot {
            if running.id() == job_id {
                self.emitter.job_update(&running.record);
                return;
            }
        }
        match self.pending.iter().find(|job| job.id == job_id) {
            Some(record) => self.emitter.job_update(record),
            None => self.emitter.job_error(job_id, "job not found"),
        }
    }

    /// Promote the head of the queue into the running slot if it is free.
    fn schedule(&mut self) {
        if !matches!(self.slot, Slot::Idle) {
            return;
        }
        let Some(record) = self.pending.pop_front() else {
            return;
        };

        match RunningJob::begin(record, &self.pipeline, &self.emitter) {
            Ok(running) => {
                self.pipeline
                    .spawn_stage(Stage::Normalize, &running, self.events_tx.clone());
                self.slot = Slot::Running(running);
            }
            Err(e) => {
                // Only queued records are ever pending, so this is a bug, not a job failure.
                warn!(error = %e, "Could not start job");
                self.schedule();
            }
        }
    }

    /// Advance the running job after one of its stages reported back.
    ///
    /// Reports that do not match the job and stage in the slot are stale and dropped.
    async fn on_stage_finished(&mut self, report: StageReport) {
        let step = match &mut self.slot {
            Slot::Running(running) if running.expects(&report) => {
                debug!(job_id = %report.job_id, stage = %report.stage, "Stage finished");
                running.on_stage_finished(report.outcome, &self.emitter)
            }
            _ => {
                warn!(job_id = %report.job_id, stage = %report.stage, "Stale stage report ignored");
                return;
            }
        };

        match step {
            Step::Continue(stage) => {
                if let Slot::Running(running) = &self.slot {
                    self.pipeline.spawn_stage(stage, running, self.events_tx.clone());
                }
            }
            Step::Finished => {
                if let Slot::Running(running) = mem::replace(&mut self.slot, Slot::Idle) {
                    let record = running.cleanup().await;
                    match record.status {
                        JobStatus::Completed => self.metrics.completed += 1,
                        JobStatus::Failed => self.metrics.failed += 1,
                        // Counted when the cancel was accepted.
                        _ => {}
                    }
                    info!(job_id = %record.id, status = %record.status, "Job released the slot");
                }
                self.schedule();
            }
        }
    }

    /// Cancel all work; the loop exits once the running stage has been reaped.
    async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(pending = self.pending.len(), "Shutdown requested");
        self.shutting_down = true;

        let pending: Vec<String> = self.pending.iter().map(|job| job.id.clone()).collect();
        for job_id in pending {
            self.cancel(&job_id).await;
        }
        let running = match &self.slot {
            Slot::Running(running) => Some(running.id().to_string()),
            Slot::Idle => None,
        };
        if let Some(job_id) = running {
            self.cancel(&job_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JobRef, OutboundMessage};
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    /// Fake normalizer: `-y -i IN -ac 1 -ar 16000 -vn OUT`. Inputs named `*slow*`
    /// hang, inputs named `*broken*` fail, everything else is copied through.
    const NORMALIZER: &str = r#"#!/bin/sh
case "$3" in
  *slow*) exec sleep 30 ;;
  *broken*) echo "invalid data found when processing input" >&2; exit 1 ;;
esac
sleep 0.1
cp "$3" "$9"
"#;

    /// Fake recognizer run as `sh recognizer.sh --audio WAV --model DIR --output JSON`.
    /// Audio mentioning `drowsy` hangs, audio mentioning `garbled` yields a bad result.
    const RECOGNIZER: &str = r#"
echo "loading $4" >&2
echo "$2" >> "__LOG__"
if grep -q drowsy "$2"; then
  exec sleep 30
fi
if grep -q garbled "$2"; then
  echo "not json" > "$6"
  exit 0
fi
cat > "$6" <<'JSON'
{"language":"pt","full_text":"bom dia","segments":[{"start":0.0,"end":1.2,"text":"bom dia"}]}
JSON
"#;

    struct Harness {
        dir: TempDir,
        tx: mpsc::UnboundedSender<OrchestratorEvent>,
        out: mpsc::UnboundedReceiver<OutboundMessage>,
        worker: JoinHandle<WorkerMetrics>,
    }

    impl Harness {
        fn start() -> Self {
            Self::start_with(|_| {})
        }

        fn start_with(tweak: impl FnOnce(&mut AppConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let scratch = dir.path().join("scratch");
            std::fs::create_dir(&scratch).unwrap();

            let normalizer = dir.path().join("ffmpeg");
            std::fs::write(&normalizer, NORMALIZER).unwrap();
            std::fs::set_permissions(&normalizer, std::fs::Permissions::from_mode(0o755)).unwrap();

            let log = dir.path().join("recognizer.log");
            let recognizer = dir.path().join("recognizer.sh");
            std::fs::write(&recognizer, RECOGNIZER.replace("__LOG__", &log.to_string_lossy())).unwrap();

            let mut config = AppConfig::default();
            config.transcriber.ffmpeg_path = normalizer.to_string_lossy().into_owned();
            config.transcriber.python_path = "sh".to_string();
            config.transcriber.script_path = recognizer.to_string_lossy().into_owned();
            config.transcriber.models_root = dir.path().join("models").to_string_lossy().into_owned();
            config.transcriber.temp_dir = scratch.to_string_lossy().into_owned();
            tweak(&mut config);

            let (emitter, out) = EventEmitter::channel();
            let orchestrator = Orchestrator::new(&config, emitter);
            let tx = orchestrator.sender();
            let worker = tokio::spawn(orchestrator.run());

            Self { dir, tx, out, worker }
        }

        fn audio(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            // The fake engines key their behaviour off the content.
            std::fs::write(&path, name).unwrap();
            path
        }

        fn enqueue(&self, id: &str, audio: &Path, model: &str) {
            self.send(InboundMessage::Enqueue(EnqueueRequest {
                id: id.to_string(),
                session_id: format!("session-{id}"),
                audio_path: audio.to_path_buf(),
                model: model.to_string(),
            }));
        }

        fn cancel(&self, id: &str) {
            self.send(InboundMessage::Cancel(JobRef { job_id: id.to_string() }));
        }

        fn send(&self, message: InboundMessage) {
            self.tx.send(OrchestratorEvent::Inbound(message)).unwrap();
        }

        async fn next(&mut self) -> OutboundMessage {
            tokio::time::timeout(Duration::from_secs(10), self.out.recv())
                .await
                .expect("timed out waiting for an outbound message")
                .expect("emitter closed")
        }

        /// Collect messages until every id in `ids` has reached a terminal status.
        async fn until_terminal(&mut self, ids: &[&str]) -> Vec<OutboundMessage> {
            let mut open: HashSet<String> = ids.iter().map(|id| id.to_string()).collect();
            let mut seen = Vec::new();
            while !open.is_empty() {
                let message = self.next().await;
                if let OutboundMessage::JobUpdate(record) = &message {
                    if record.is_terminal() {
                        open.remove(&record.id);
                    }
                }
                seen.push(message);
            }
            seen
        }

        fn recognizer_calls(&self) -> usize {
            std::fs::read_to_string(self.dir.path().join("recognizer.log"))
                .map(|log| log.lines().count())
                .unwrap_or(0)
        }

        fn scratch_is_empty(&self) -> bool {
            std::fs::read_dir(self.dir.path().join("scratch")).unwrap().next().is_none()
        }

        async fn finish(self) -> WorkerMetrics {
            // The loop may already be gone after a shutdown.
            let _ = self.tx.send(OrchestratorEvent::InputClosed);
            tokio::time::timeout(Duration::from_secs(10), self.worker)
                .await
                .expect("queue loop did not exit")
                .unwrap()
        }
    }

    fn updates_for<'a>(messages: &'a [OutboundMessage], id: &str) -> Vec<&'a JobRecord> {
        messages
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::JobUpdate(r) if r.id == id => Some(r),
                _ => None,
            })
            .collect()
    }

    async fn wait_until_gone(path: &Path) {
        for _ in 0..100 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} still exists", path.display());
    }

    #[tokio::test]
    async fn test_successful_job_event_sequence() {
        let mut h = Harness::start();
        let audio = h.audio("a.webm");
        h.enqueue("a", &audio, "fast");

        let messages = h.until_terminal(&["a"]).await;
        let kinds: Vec<String> = messages
            .iter()
            .map(|m| match m {
                OutboundMessage::JobUpdate(r) => format!("{}:{}", r.status, r.progress),
                OutboundMessage::JobResult(_) => "result".to_string(),
                OutboundMessage::JobError(e) => format!("error:{}", e.error),
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["queued:0", "running:0.1", "running:0.3", "result", "completed:1"]
        );

        match &messages[3] {
            OutboundMessage::JobResult(result) => {
                assert_eq!(result.job_id, "a");
                assert_eq!(result.transcript.language, "pt");
                assert_eq!(result.transcript.full_text, "bom dia");
                assert_eq!(result.transcript.segments.len(), 1);
            }
            other => panic!("expected job_result, got {other:?}"),
        }

        let updates = updates_for(&messages, "a");
        assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert!(updates.iter().all(|r| r.session_id == "session-a"));

        assert!(!audio.exists());
        assert!(h.scratch_is_empty());

        let metrics = h.finish().await;
        assert_eq!(metrics.enqueued, 1);
        assert_eq!(metrics.completed, 1);
    }

    #[tokio::test]
    async fn test_normalizer_failure_skips_recognition() {
        let mut h = Harness::start();
        let audio = h.audio("broken.webm");
        h.enqueue("b", &audio, "accurate");

        let messages = h.until_terminal(&["b"]).await;
        let last = updates_for(&messages, "b").pop().unwrap().clone();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("ffmpeg failed with code 1"));
        assert!(!messages.iter().any(|m| matches!(m, OutboundMessage::JobResult(_))));

        assert_eq!(h.recognizer_calls(), 0);
        assert!(!audio.exists());
        assert!(h.scratch_is_empty());

        let metrics = h.finish().await;
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn test_unparsable_transcript_fails_job() {
        let mut h = Harness::start();
        let audio = h.audio("garbled.webm");
        h.enqueue("g", &audio, "fast");

        let messages = h.until_terminal(&["g"]).await;
        let last = updates_for(&messages, "g").pop().unwrap().clone();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.error.unwrap().starts_with("invalid transcript output"));
        assert_eq!(h.recognizer_calls(), 1);
        assert!(!audio.exists());
        assert!(h.scratch_is_empty());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_fifo_with_single_running_job() {
        let mut h = Harness::start();
        let ids = ["first", "second", "third"];
        for (i, id) in ids.iter().enumerate() {
            let audio = h.audio(&format!("{id}.webm"));
            let model = if i % 2 == 0 { "fast" } else { "accurate" };
            h.enqueue(id, &audio, model);
        }

        let messages = h.until_terminal(&ids).await;

        let mut running: HashSet<String> = HashSet::new();
        let mut start_order = Vec::new();
        for message in &messages {
            if let OutboundMessage::JobUpdate(record) = message {
                match record.status {
                    JobStatus::Running => {
                        if running.insert(record.id.clone()) {
                            start_order.push(record.id.clone());
                        }
                    }
                    status if status.is_terminal() => {
                        running.remove(&record.id);
                    }
                    _ => {}
                }
                assert!(running.len() <= 1, "two jobs running at once");
            }
        }
        assert_eq!(start_order, ids);

        let metrics = h.finish().await;
        assert_eq!(metrics.completed, 3);
    }

    #[tokio::test]
    async fn test_second_job_waits_for_first() {
        let mut h = Harness::start();
        let slow = h.audio("slow-a.webm");
        let quick = h.audio("b.webm");
        h.enqueue("a", &slow, "fast");
        h.enqueue("b", &quick, "accurate");

        // a starts, b is only queued
        let mut seen = Vec::new();
        while !seen.iter().any(|m: &OutboundMessage| {
            matches!(m, OutboundMessage::JobUpdate(r) if r.id == "b" && r.status == JobStatus::Queued)
        }) || !seen.iter().any(|m: &OutboundMessage| {
            matches!(m, OutboundMessage::JobUpdate(r) if r.id == "a" && r.status == JobStatus::Running)
        }) {
            seen.push(h.next().await);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.out.try_recv().is_err(), "b must not start while a is running");

        // Ending a lets b start on its own.
        h.cancel("a");
        let messages = h.until_terminal(&["a", "b"]).await;
        let b_updates = updates_for(&messages, "b");
        assert_eq!(b_updates.last().unwrap().status, JobStatus::Completed);

        let a_cancelled = messages
            .iter()
            .position(|m| matches!(m, OutboundMessage::JobUpdate(r) if r.id == "a" && r.status == JobStatus::Cancelled))
            .unwrap();
        let b_running = messages
            .iter()
            .position(|m| matches!(m, OutboundMessage::JobUpdate(r) if r.id == "b" && r.status == JobStatus::Running))
            .unwrap();
        assert!(a_cancelled < b_running);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_cancel_running_job_cleans_up() {
        let mut h = Harness::start();
        let audio = h.audio("slow.webm");
        h.enqueue("r", &audio, "fast");

        loop {
            if let OutboundMessage::JobUpdate(record) = h.next().await {
                if record.status == JobStatus::Running {
                    break;
                }
            }
        }
        h.cancel("r");

        match h.next().await {
            OutboundMessage::JobUpdate(record) => {
                assert_eq!(record.id, "r");
                assert_eq!(record.status, JobStatus::Cancelled);
                assert!(record.error.is_none());
            }
            other => panic!("expected cancelled update, got {other:?}"),
        }

        wait_until_gone(&audio).await;
        assert_eq!(h.recognizer_calls(), 0);

        // A second cancel is harmless and emits nothing.
        h.cancel("r");
        let metrics = h.finish().await;
        assert_eq!(metrics.cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_recognition_removes_temp_files() {
        let mut h = Harness::start();
        let audio = h.audio("drowsy.webm");
        h.enqueue("d", &audio, "accurate");

        loop {
            if let OutboundMessage::JobUpdate(record) = h.next().await {
                if record.status == JobStatus::Running && record.progress >= 0.3 {
                    break;
                }
            }
        }
        for _ in 0..100 {
            if h.recognizer_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(h.recognizer_calls(), 1);
        // The normalized audio is sitting in scratch while recognition runs
        assert!(!h.scratch_is_empty());

        h.cancel("d");
        match h.next().await {
            OutboundMessage::JobUpdate(record) => {
                assert_eq!(record.id, "d");
                assert_eq!(record.status, JobStatus::Cancelled);
                assert!(record.error.is_none());
            }
            other => panic!("expected cancelled update, got {other:?}"),
        }

        wait_until_gone(&audio).await;
        for _ in 0..100 {
            if h.scratch_is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(h.scratch_is_empty());

        // Nothing else is reported for the killed job
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.out.try_recv().is_err());

        let metrics = h.finish().await;
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.completed + metrics.failed, 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_never_runs() {
        let mut h = Harness::start();
        let first = h.audio("slow-first.webm");
        let pending = h.audio("c.webm");
        h.enqueue("first", &first, "fast");
        h.enqueue("c", &pending, "fast");
        h.cancel("c");
        h.cancel("first");

        let messages = h.until_terminal(&["first", "c"]).await;
        let statuses: Vec<JobStatus> = updates_for(&messages, "c").iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![JobStatus::Queued, JobStatus::Cancelled]);
        assert!(!pending.exists());

        wait_until_gone(&first).await;
        let metrics = h.finish().await;
        assert_eq!(metrics.cancelled, 2);
        assert_eq!(metrics.completed, 0);
    }

    #[tokio::test]
    async fn test_silent_pending_cancel() {
        let mut h = Harness::start_with(|config| config.queue.notify_pending_cancel = false);
        let first = h.audio("slow-first.webm");
        let pending = h.audio("c.webm");
        h.enqueue("first", &first, "fast");
        h.enqueue("c", &pending, "fast");
        h.cancel("c");
        h.cancel("first");

        let messages = h.until_terminal(&["first"]).await;
        let statuses: Vec<JobStatus> = updates_for(&messages, "c").iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![JobStatus::Queued]);
        assert!(!pending.exists());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let mut h = Harness::start();
        let audio = h.audio("a.webm");
        h.enqueue("x", &audio, "turbo");

        match h.next().await {
            OutboundMessage::JobError(error) => {
                assert_eq!(error.job_id, "x");
                assert!(error.error.contains("turbo"));
            }
            other => panic!("expected job_error, got {other:?}"),
        }

        let metrics = h.finish().await;
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.enqueued, 0);
        // Rejected before the worker took ownership of the file
        assert!(audio.exists());
    }

    #[tokio::test]
    async fn test_status_queries() {
        let mut h = Harness::start();
        let slow = h.audio("slow.webm");
        let queued = h.audio("q.webm");
        h.enqueue("s", &slow, "fast");
        h.enqueue("q", &queued, "accurate");

        h.send(InboundMessage::Status(JobRef { job_id: "nope".to_string() }));
        h.send(InboundMessage::Status(JobRef { job_id: "q".to_string() }));

        let mut not_found = false;
        let mut q_snapshots = 0;
        while !(not_found && q_snapshots == 2) {
            match h.next().await {
                OutboundMessage::JobError(error) => {
                    assert_eq!(error.job_id, "nope");
                    assert_eq!(error.error, "job not found");
                    not_found = true;
                }
                OutboundMessage::JobUpdate(record) if record.id == "q" => {
                    assert_eq!(record.status, JobStatus::Queued);
                    q_snapshots += 1;
                }
                _ => {}
            }
        }

        h.tx.send(OrchestratorEvent::Shutdown).unwrap();
        let messages = h.until_terminal(&["s", "q"]).await;
        assert!(updates_for(&messages, "s")
            .iter()
            .any(|r| r.status == JobStatus::Cancelled));
        h.finish().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything_and_exits() {
        let mut h = Harness::start();
        let running = h.audio("slow.webm");
        let pending = h.audio("p.webm");
        h.enqueue("run", &running, "fast");
        h.enqueue("pend", &pending, "fast");
        h.tx.send(OrchestratorEvent::Shutdown).unwrap();

        let messages = h.until_terminal(&["run", "pend"]).await;
        assert_eq!(updates_for(&messages, "pend").last().unwrap().status, JobStatus::Cancelled);
        assert_eq!(updates_for(&messages, "run").last().unwrap().status, JobStatus::Cancelled);

        let metrics = tokio::time::timeout(Duration::from_secs(10), h.worker)
            .await
            .expect("queue loop did not exit after shutdown")
            .unwrap();
        assert_eq!(metrics.cancelled, 2);
        assert!(!running.exists());
        assert!(!pending.exists());
    }
}
