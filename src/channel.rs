//! # Control Channel
//!
//! Byte-stream side of the control protocol. The reader turns stdin lines into
//! queue events, the writer turns emitted messages into stdout lines.
//!
//! ## Framing:
//! - One JSON object per line, `\n` terminated
//! - Undecodable lines (bad JSON or not UTF-8) are logged and dropped, they never reach the queue
//! - Each outbound message is written and flushed on its own, in emission order

use crate::events::EventEmitter;
use crate::protocol::{self, OutboundMessage};
use crate::queue::OrchestratorEvent;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Longest inbound line echoed back into the log when it fails to parse.
const MAX_LOGGED_LINE: usize = 256;

/// Read control messages from `input` and forward them to the queue loop.
///
/// Lines are split on raw bytes, so a line that is not valid UTF-8 is just
/// another malformed message. Only EOF or a read failure ends the reader, and
/// both send [`OrchestratorEvent::InputClosed`].
pub fn spawn_reader<R>(input: R, events: mpsc::UnboundedSender<OrchestratorEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = SplitStream::new(BufReader::new(input).split(b'\n'));

        while let Some(line) = lines.next().await {
            let bytes = match line {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "Failed to read control channel");
                    break;
                }
            };

            let Some(event) = decode_event(&bytes) else {
                continue;
            };

            if events.send(event).is_err() {
                debug!("Queue loop is gone, stopping reader");
                return;
            }
        }

        info!("Control channel closed by host");
        let _ = events.send(OrchestratorEvent::InputClosed);
    })
}

/// Turn one raw line into a queue event. Blank lines yield `None`.
fn decode_event(bytes: &[u8]) -> Option<OrchestratorEvent> {
    let line = match std::str::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => {
            let lossy = String::from_utf8_lossy(bytes);
            warn!(error = %e, line = %truncate(&lossy), "Invalid message, not UTF-8");
            return Some(OrchestratorEvent::Malformed);
        }
    };

    match protocol::parse_line(line) {
        Ok(Some(message)) => {
            debug!(?message, "Inbound message");
            Some(OrchestratorEvent::Inbound(message))
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, line = %truncate(line), "Invalid message");
            Some(OrchestratorEvent::Malformed)
        }
    }
}

/// Write every message from `messages` to `output` as a JSON line.
///
/// Ends when all [`EventEmitter`]s are dropped or the output breaks.
pub fn spawn_writer<W>(mut output: W, mut messages: mpsc::UnboundedReceiver<OutboundMessage>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let line = match protocol::encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to encode outbound message");
                    continue;
                }
            };
            if let Err(e) = write_line(&mut output, &line).await {
                error!(error = %e, "Failed to write control channel, host is gone");
                break;
            }
        }
    })
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> std::io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}

/// Convenience for wiring an emitter straight to a writer task.
pub fn spawn_emitter<W>(output: W) -> (EventEmitter, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (emitter, rx) = EventEmitter::channel();
    (emitter, spawn_writer(output, rx))
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(MAX_LOGGED_LINE) {
        Some((index, _)) => &line[..index],
        None => line,
    }
}
