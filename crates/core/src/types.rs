//! Job and completion types shared by every crate in the workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Which solver family evaluates a model.
///
/// Threaded explicitly through signatures and configuration; there is no
/// process-wide "current solver" constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Short-lived solver process spawned once per model.
    Batch,
    /// Long-running solver server reached over the line protocol.
    Persistent,
}

impl Backend {
    /// Lowercase label used in log fields and report columns.
    pub fn label(self) -> &'static str {
        match self {
            Backend::Batch => "batch",
            Backend::Persistent => "persistent",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One unit of work: evaluate a single model file on one backend.
#[derive(Debug, Clone)]
pub struct ModelJob {
    /// Path to the model file handed to the solver.
    pub path: PathBuf,
    /// Which backend runs the evaluation.
    pub backend: Backend,
}

impl ModelJob {
    pub fn new(path: impl Into<PathBuf>, backend: Backend) -> Self {
        Self {
            path: path.into(),
            backend,
        }
    }

    /// Base file name of the model, the key used for completion routing
    /// and the results table.
    pub fn model_name(&self) -> String {
        model_base_name(&self.path)
    }
}

/// Emitted exactly once when a model evaluation finishes on a backend.
///
/// Handed off by value between tasks and never mutated after
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    /// Model base file name (not the full path).
    pub model: String,
    /// Backend that produced the timing.
    pub backend: Backend,
    /// Wall-clock evaluation time in milliseconds.
    pub elapsed_ms: u64,
}

/// Recover the canonical model file name from a name the server reports.
///
/// The persistent server reports models under the name of the result file
/// it writes (`model_res.xml` for `model.xml`); the suffix is stripped so
/// both backends key their events identically.
pub fn canonical_model_name(reported: &str) -> String {
    reported.replace("_res.xml", ".xml")
}

/// Base file name of a model path, lossily decoded.
///
/// An empty string is only possible for pathological paths like `..`;
/// callers treat the name as opaque so nothing downstream breaks.
pub fn model_base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
