//! Bounded-concurrency job dispatcher.
//!
//! [`JobDispatcher`] accepts a stream of (model, backend) jobs and runs
//! each as an [`Evaluation`] on a bounded worker pool. The pool has no
//! queue: a submission either takes a free worker slot or blocks the
//! submitting task until one frees up, so subprocess launches can never
//! pile up unboundedly. Sequential mode pins the pool to one slot and
//! runs every evaluation inline, in submission order.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

use solverbench_core::{Backend, CompletionEvent, ModelJob};
use solverbench_solver::{Evaluation, SolverConnection};

use crate::report::BenchmarkReport;

/// Worker-pool sizing and execution mode.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of evaluations in flight at once.
    pub max_workers: usize,
    /// When false, every evaluation runs inline on the submitting task.
    pub parallel: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 200,
            parallel: true,
        }
    }
}

/// Errors surfaced to submitters.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher has shut down and accepts no new work.
    #[error("dispatcher is shut down")]
    ShutDown,
}

/// Pending evaluations per backend.
#[derive(Debug, Default)]
struct PendingCounts {
    batch: usize,
    persistent: usize,
}

impl PendingCounts {
    fn get(&self, backend: Backend) -> usize {
        match backend {
            Backend::Batch => self.batch,
            Backend::Persistent => self.persistent,
        }
    }

    fn slot(&mut self, backend: Backend) -> &mut usize {
        match backend {
            Backend::Batch => &mut self.batch,
            Backend::Persistent => &mut self.persistent,
        }
    }
}

/// Runs evaluations across both backends with bounded concurrency and
/// accumulates the results table.
pub struct JobDispatcher {
    config: DispatcherConfig,
    batch_program: String,
    connection: Arc<SolverConnection>,
    workers: Arc<Semaphore>,
    pending: Arc<std::sync::Mutex<PendingCounts>>,
    results: Arc<std::sync::Mutex<BenchmarkReport>>,
    completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    recorder: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl JobDispatcher {
    /// Create a dispatcher over an established solver connection.
    pub fn new(
        config: DispatcherConfig,
        batch_program: impl Into<String>,
        connection: Arc<SolverConnection>,
    ) -> Self {
        // Sequential mode pins the pool to a single slot; a zero-sized
        // pool could never run anything, so one slot is the floor.
        let slots = if config.parallel {
            config.max_workers.max(1)
        } else {
            1
        };
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let pending: Arc<std::sync::Mutex<PendingCounts>> = Arc::default();
        let results: Arc<std::sync::Mutex<BenchmarkReport>> = Arc::default();
        let recorder = tokio::spawn(record_completions(
            completion_rx,
            Arc::clone(&pending),
            Arc::clone(&results),
        ));

        tracing::info!(
            max_workers = slots,
            parallel = config.parallel,
            "Job dispatcher started",
        );

        Self {
            config,
            batch_program: batch_program.into(),
            connection,
            workers: Arc::new(Semaphore::new(slots)),
            pending,
            results,
            completion_tx,
            recorder: Mutex::new(Some(recorder)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Submit one model for evaluation on one backend.
    ///
    /// Increments the backend's pending count, then waits for a worker
    /// slot -- once the pool is saturated this call blocks until an
    /// evaluation finishes. In sequential mode the evaluation runs to
    /// completion before this returns.
    pub async fn submit(
        &self,
        path: impl Into<PathBuf>,
        backend: Backend,
    ) -> Result<(), DispatchError> {
        let job = ModelJob::new(path, backend);
        let model = job.model_name();

        let mut eval = Evaluation::new(job, self.batch_program.clone());
        if backend == Backend::Persistent {
            eval = eval.with_connection(Arc::clone(&self.connection));
        }
        eval.add_listener(self.completion_tx.clone());

        lock_sync(&self.pending, |pending| *pending.slot(backend) += 1);
        tracing::debug!(model = %model, backend = %backend, "Evaluation submitted");

        // Zero-buffer handoff: block here until a worker slot is free.
        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // The pool was closed while we waited; the job will never
                // run, so take its pending count back.
                lock_sync(&self.pending, |pending| {
                    *pending.slot(backend) = pending.slot(backend).saturating_sub(1)
                });
                return Err(DispatchError::ShutDown);
            }
        };

        if self.config.parallel {
            self.tasks.lock().await.spawn(async move {
                eval.run().await;
                drop(permit);
            });
        } else {
            eval.run().await;
            drop(permit);
        }
        Ok(())
    }

    /// Number of submitted-but-uncompleted evaluations for a backend.
    pub fn pending_count(&self, backend: Backend) -> usize {
        lock_sync(&self.pending, |pending| pending.get(backend))
    }

    /// Whether every submitted evaluation for a backend has completed.
    pub fn is_drained(&self, backend: Backend) -> bool {
        self.pending_count(backend) == 0
    }

    /// Shut down: stop the persistent connection, refuse new work, and
    /// let in-flight evaluations run to completion.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job dispatcher");
        self.connection.shutdown().await;
        self.workers.close();

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        drop(tasks);

        tracing::info!("Job dispatcher shut down complete");
    }

    /// Snapshot of the results table.
    pub fn report(&self) -> BenchmarkReport {
        lock_sync(&self.results, |results| results.clone())
    }
}

/// Record every completion event into the results table and release its
/// pending count. Runs until the dispatcher (and every evaluation
/// holding a listener clone) has dropped its sender.
async fn record_completions(
    mut completions: mpsc::UnboundedReceiver<CompletionEvent>,
    pending: Arc<std::sync::Mutex<PendingCounts>>,
    results: Arc<std::sync::Mutex<BenchmarkReport>>,
) {
    while let Some(event) = completions.recv().await {
        tracing::info!(
            model = %event.model,
            backend = %event.backend,
            elapsed_ms = event.elapsed_ms,
            "Evaluation completed",
        );

        lock_sync(&results, |results| {
            results
                .models
                .entry(event.model.clone())
                .or_default()
                .record(event.backend, event.elapsed_ms);
        });

        lock_sync(&pending, |pending| {
            let slot = pending.slot(event.backend);
            if *slot == 0 {
                // One event per submission means this cannot happen; a
                // zero counter stays at zero rather than wrapping.
                tracing::error!(
                    model = %event.model,
                    backend = %event.backend,
                    "Completion event observed with no pending evaluation",
                );
            } else {
                *slot -= 1;
            }
        });
    }
}

/// Run a closure under a std mutex, recovering the guard if a panicking
/// worker poisoned it.
fn lock_sync<T, R>(mutex: &std::sync::Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        // The recorder ends on its own once every sender is gone; abort
        // covers the case where shutdown() was never called.
        if let Some(recorder) = self.recorder.get_mut().take() {
            recorder.abort();
        }
    }
}
