//! Per-job evaluation.
//!
//! [`Evaluation`] runs one (model, backend) job end to end and reports
//! exactly one [`CompletionEvent`] to its listeners, regardless of
//! backend or outcome. The batch backend spawns the solver process and
//! waits for it; the persistent backend registers a waiter with the
//! [`SolverConnection`], submits a solve command, and waits for the
//! routed event.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use solverbench_core::{Backend, BatchExitStatus, CompletionEvent, ModelJob};

use crate::connection::SolverConnection;

/// One evaluation of one model on one backend.
pub struct Evaluation {
    job: ModelJob,
    /// Program name for the batch backend invocation.
    batch_program: String,
    /// Connection handle, required by the persistent backend.
    connection: Option<Arc<SolverConnection>>,
    /// Completion listeners, notified in registration order.
    listeners: Vec<mpsc::UnboundedSender<CompletionEvent>>,
}

impl Evaluation {
    pub fn new(job: ModelJob, batch_program: impl Into<String>) -> Self {
        Self {
            job,
            batch_program: batch_program.into(),
            connection: None,
            listeners: Vec::new(),
        }
    }

    /// Attach the persistent-backend connection this evaluation submits
    /// through.
    pub fn with_connection(mut self, connection: Arc<SolverConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Subscribe a listener to this evaluation's completion event.
    pub fn add_listener(&mut self, listener: mpsc::UnboundedSender<CompletionEvent>) {
        self.listeners.push(listener);
    }

    /// Run the job to completion and broadcast the completion event.
    ///
    /// Every path -- including launch failures and a lost connection --
    /// ends in exactly one event so pending-job bookkeeping always
    /// drains.
    pub async fn run(self) {
        let event = match self.job.backend {
            Backend::Batch => self.run_batch().await,
            Backend::Persistent => self.run_persistent().await,
        };
        for listener in &self.listeners {
            let _ = listener.send(event.clone());
        }
    }

    /// Spawn `<program> <model> -f`, drain both output streams, classify
    /// the exit code, and measure process start to process exit.
    async fn run_batch(&self) -> CompletionEvent {
        let model = self.job.model_name();
        tracing::info!(
            program = %self.batch_program,
            model = %model,
            "Launching batch solver",
        );

        let mut cmd = Command::new(&self.batch_program);
        cmd.arg(&self.job.path)
            .arg("-f")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    program = %self.batch_program,
                    model = %model,
                    error = %e,
                    "Failed to launch batch solver",
                );
                return CompletionEvent {
                    model,
                    backend: Backend::Batch,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        // Both streams are drained concurrently so the solver can never
        // block on a full pipe.
        let stdout_task = tokio::spawn(drain_lines(child.stdout.take(), false));
        let stderr_task = tokio::spawn(drain_lines(child.stderr.take(), true));

        let status = child.wait().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        match status {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                let classified = BatchExitStatus::classify(code);
                if !classified.is_success() {
                    // A non-success code still yields a valid timing
                    // record; the outcome is only warned about.
                    tracing::warn!(
                        program = %self.batch_program,
                        model = %model,
                        code,
                        "Batch solver exited with {classified}",
                    );
                }
            }
            Err(e) => {
                tracing::error!(model = %model, error = %e, "Failed to wait for batch solver exit");
            }
        }

        CompletionEvent {
            model,
            backend: Backend::Batch,
            elapsed_ms,
        }
    }

    /// Register as the waiter for this model, submit, and wait for the
    /// routed completion event. The server measures the evaluation time;
    /// failure paths fall back to locally measured elapsed time so the
    /// event contract still holds.
    async fn run_persistent(&self) -> CompletionEvent {
        let model = self.job.model_name();
        let start = Instant::now();

        let fallback = |elapsed_ms| CompletionEvent {
            model: model.clone(),
            backend: Backend::Persistent,
            elapsed_ms,
        };

        let connection = match &self.connection {
            Some(connection) => connection,
            None => {
                tracing::error!(model = %model, "No solver connection attached to a persistent evaluation");
                return fallback(0);
            }
        };

        let waiter = connection.register_waiter(&model).await;

        if let Err(e) = connection.submit(&self.job.path, None).await {
            tracing::error!(model = %model, error = %e, "Failed to submit model to solver server");
            return fallback(start.elapsed().as_millis() as u64);
        }

        match waiter.await {
            Ok(event) => event,
            Err(_) => {
                tracing::error!(model = %model, "Solver connection closed before completion");
                fallback(start.elapsed().as_millis() as u64)
            }
        }
    }
}

/// Read a child stream to EOF, optionally surfacing each line in the log.
async fn drain_lines<R>(stream: Option<R>, show: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if show {
            tracing::debug!(line = %line, "Batch solver output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    /// Write a shell script that stands in for the batch solver; the
    /// "model" path is the script itself and the program is `sh`.
    fn script_model(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create script");
        writeln!(file, "{body}").expect("write script");
        path
    }

    #[tokio::test]
    async fn batch_success_emits_one_timed_event() {
        let dir = std::env::temp_dir().join("solverbench-eval-ok");
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let model = script_model(&dir, "ok.xml", "exit 0");

        let mut eval = Evaluation::new(ModelJob::new(&model, Backend::Batch), "sh");
        let (tx, mut rx) = mpsc::unbounded_channel();
        eval.add_listener(tx);
        eval.run().await;

        let event = rx.try_recv().expect("one event");
        assert_eq!(event.model, "ok.xml");
        assert_eq!(event.backend, Backend::Batch);
        assert!(rx.try_recv().is_err(), "exactly one event");
    }

    #[tokio::test]
    async fn batch_nonzero_exit_still_emits_timing() {
        let dir = std::env::temp_dir().join("solverbench-eval-warn");
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let model = script_model(&dir, "warn.xml", "sleep 0.1\nexit 1");

        let mut eval = Evaluation::new(ModelJob::new(&model, Backend::Batch), "sh");
        let (tx, mut rx) = mpsc::unbounded_channel();
        eval.add_listener(tx);
        eval.run().await;

        let event = rx.try_recv().expect("event despite exit 1");
        assert!(event.elapsed_ms >= 100, "elapsed_ms = {}", event.elapsed_ms);
    }

    #[tokio::test]
    async fn batch_spawn_failure_still_emits_an_event() {
        let mut eval = Evaluation::new(
            ModelJob::new("/nonexistent/model.xml", Backend::Batch),
            "definitely-not-a-real-solver-binary",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        eval.add_listener(tx);
        eval.run().await;

        let event = rx.try_recv().expect("event despite spawn failure");
        assert_eq!(event.model, "model.xml");
    }

    #[tokio::test]
    async fn all_listeners_receive_the_event() {
        let dir = std::env::temp_dir().join("solverbench-eval-multi");
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let model = script_model(&dir, "multi.xml", "exit 0");

        let mut eval = Evaluation::new(ModelJob::new(&model, Backend::Batch), "sh");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        eval.add_listener(tx1);
        eval.add_listener(tx2);
        eval.run().await;

        assert_eq!(rx1.try_recv().expect("listener 1").model, "multi.xml");
        assert_eq!(rx2.try_recv().expect("listener 2").model, "multi.xml");
    }

    #[tokio::test]
    async fn persistent_without_connection_reports_and_emits() {
        let mut eval = Evaluation::new(ModelJob::new("/tmp/m.xml", Backend::Persistent), "lqns");
        let (tx, mut rx) = mpsc::unbounded_channel();
        eval.add_listener(tx);

        tokio::time::timeout(Duration::from_secs(1), eval.run())
            .await
            .expect("must not hang");
        let event = rx.try_recv().expect("event still emitted");
        assert_eq!(event.backend, Backend::Persistent);
    }
}
