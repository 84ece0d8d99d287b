//! Background protocol reader.
//!
//! [`ProtocolReader`] drains a single text stream line by line on a
//! dedicated task, translating recognized tokens into state changes and
//! completion events until explicitly closed. It does not open or own
//! the underlying transport.
//!
//! Handshake progress is published through watch channels so callers can
//! both poll (`is_running` / `is_connected`) and await
//! (`wait_running` / `wait_connected`) without busy loops; shutdown is a
//! [`CancellationToken`] the read loop selects against, so `close()`
//! takes effect promptly even with no input pending.

use std::collections::HashMap;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use solverbench_core::{Backend, CompletionEvent};

use crate::lines::{parse_line, ServerLine, STATUS_SUBMITTED};

/// The reader task exited before the awaited handshake line arrived,
/// so the flag can never become true.
#[derive(Debug, thiserror::Error)]
#[error("protocol reader stopped before the expected handshake line")]
pub struct ReaderStopped;

/// Handle to a background line-reader over one solver stream.
pub struct ProtocolReader {
    label: String,
    cancel: CancellationToken,
    running_rx: watch::Receiver<bool>,
    connected_rx: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl ProtocolReader {
    /// Start a reader over `stream` on a dedicated task.
    ///
    /// `label` tags every log line so the socket and launcher readers can
    /// be told apart. Completion events are sent on `completions`; a
    /// dropped receiver discards them, which is exactly what the
    /// launcher-side reader wants.
    pub fn spawn<R>(
        stream: R,
        label: impl Into<String>,
        completions: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let label = label.into();
        let cancel = CancellationToken::new();
        let (running_tx, running_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);

        let handle = tokio::spawn(read_loop(
            BufReader::new(stream),
            label.clone(),
            cancel.clone(),
            running_tx,
            connected_tx,
            completions,
        ));

        Self {
            label,
            cancel,
            running_rx,
            connected_rx,
            handle,
        }
    }

    /// Request the read loop to stop. Idempotent; observed at the loop's
    /// next select point.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the server has reported it is listening for connections.
    /// Reverts to false when the server announces it is stopping.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Whether the per-connection handshake has completed. Never reverts.
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Wait until the server reports it is listening.
    ///
    /// There is no timeout here; an unresponsive server blocks the caller
    /// until the stream ends, at which point [`ReaderStopped`] surfaces
    /// the fact that the flag can no longer change.
    pub async fn wait_running(&self) -> Result<(), ReaderStopped> {
        let mut rx = self.running_rx.clone();
        rx.wait_for(|running| *running)
            .await
            .map(|_| ())
            .map_err(|_| ReaderStopped)
    }

    /// Wait until the handshake completes. Same blocking contract as
    /// [`wait_running`](Self::wait_running).
    pub async fn wait_connected(&self) -> Result<(), ReaderStopped> {
        let mut rx = self.connected_rx.clone();
        rx.wait_for(|connected| *connected)
            .await
            .map(|_| ())
            .map_err(|_| ReaderStopped)
    }

    /// Close the reader and wait for its task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(reader = %self.label, error = %e, "Protocol reader task did not exit cleanly");
        }
    }
}

/// Drain the stream until cancelled or the stream ends.
async fn read_loop<R>(
    reader: BufReader<R>,
    label: String,
    cancel: CancellationToken,
    running_tx: watch::Sender<bool>,
    connected_tx: watch::Sender<bool>,
    completions: mpsc::UnboundedSender<CompletionEvent>,
) where
    R: AsyncRead + Unpin,
{
    // One timer per in-flight model, owned by this task alone; all
    // mutation serializes through the loop.
    let mut timers: HashMap<String, Instant> = HashMap::new();
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(reader = %label, "Protocol reader closed");
                break;
            }
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    handle_line(&line, &label, &mut timers, &running_tx, &connected_tx, &completions);
                }
                Ok(None) => {
                    // End of stream. Expected after close(); otherwise the
                    // peer went away underneath us.
                    if cancel.is_cancelled() {
                        tracing::debug!(reader = %label, "Stream closed");
                    } else {
                        tracing::info!(reader = %label, "Server stream ended");
                    }
                    break;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        tracing::debug!(reader = %label, error = %e, "Read error after close");
                    } else {
                        tracing::error!(reader = %label, error = %e, "Protocol stream read error");
                    }
                    break;
                }
            }
        }
    }
}

/// Apply one inbound line to the reader state.
fn handle_line(
    line: &str,
    label: &str,
    timers: &mut HashMap<String, Instant>,
    running_tx: &watch::Sender<bool>,
    connected_tx: &watch::Sender<bool>,
    completions: &mpsc::UnboundedSender<CompletionEvent>,
) {
    match parse_line(line) {
        ServerLine::ModelStatus { model, status } => {
            update_model_status(model, &status, label, timers, completions);
        }
        ServerLine::Listening => {
            tracing::info!(reader = %label, "Server listening");
            running_tx.send_replace(true);
        }
        ServerLine::Ready => {
            tracing::info!(reader = %label, "Server handshake complete");
            connected_tx.send_replace(true);
        }
        ServerLine::Stopping => {
            tracing::info!(reader = %label, "Server stopping");
            running_tx.send_replace(false);
        }
        ServerLine::Malformed => {
            tracing::warn!(reader = %label, raw_line = %line, "Unparseable model status line");
        }
        ServerLine::Other => {
            tracing::trace!(reader = %label, raw_line = %line, "Ignoring server chatter");
        }
    }
}

/// Start or stop the timer for one model and emit the completion event
/// on a terminal status.
fn update_model_status(
    model: String,
    status: &str,
    label: &str,
    timers: &mut HashMap<String, Instant>,
    completions: &mpsc::UnboundedSender<CompletionEvent>,
) {
    if status == STATUS_SUBMITTED {
        // A new submission for the same model restarts timing.
        if timers.insert(model.clone(), Instant::now()).is_some() {
            tracing::debug!(reader = %label, model = %model, "Restarting timer for resubmitted model");
        }
        tracing::debug!(reader = %label, model = %model, "Model submitted");
        return;
    }

    match timers.remove(&model) {
        Some(started) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(reader = %label, model = %model, status, elapsed_ms, "Model finished");
            // The receiver may be gone (launcher-side reader); that is
            // not an error.
            let _ = completions.send(CompletionEvent {
                model,
                backend: Backend::Persistent,
                elapsed_ms,
            });
        }
        None => {
            // Protocol inconsistency: a terminal status for a model never
            // marked SUBMITTED. Surfaced, not fabricated into a zero
            // timing, and the reader keeps serving other models.
            tracing::error!(
                reader = %label,
                model = %model,
                status,
                "Terminal status for a model that was never submitted",
            );
        }
    }
}
