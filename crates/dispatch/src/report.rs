//! Per-model timing report.
//!
//! One record per model with one optional elapsed time per backend, so a
//! model evaluated on only one backend shows up with the other column
//! empty instead of silently missing from a second table.

use std::collections::BTreeMap;

use serde::Serialize;

use solverbench_core::Backend;

/// Timings recorded for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelTimings {
    /// Batch solver wall-clock milliseconds, when evaluated there.
    pub batch_ms: Option<u64>,
    /// Persistent solver wall-clock milliseconds, when evaluated there.
    pub persistent_ms: Option<u64>,
}

impl ModelTimings {
    /// Record the timing for one backend, overwriting a previous run of
    /// the same model on that backend.
    pub fn record(&mut self, backend: Backend, elapsed_ms: u64) {
        match backend {
            Backend::Batch => self.batch_ms = Some(elapsed_ms),
            Backend::Persistent => self.persistent_ms = Some(elapsed_ms),
        }
    }
}

/// The full results table, keyed by model base name.
///
/// Built incrementally by the dispatcher as completion events arrive and
/// read once at the end of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkReport {
    pub models: BTreeMap<String, ModelTimings>,
}

impl BenchmarkReport {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Render the table as CSV-style lines, header first. Missing
    /// timings render as empty cells.
    pub fn csv_lines(&self) -> Vec<String> {
        let mut lines = vec!["model,batch_ms,persistent_ms".to_string()];
        for (model, timings) in &self.models {
            lines.push(format!(
                "{model},{},{}",
                timings.batch_ms.map(|ms| ms.to_string()).unwrap_or_default(),
                timings
                    .persistent_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_default(),
            ));
        }
        lines
    }

    /// Write the table to the log, one line per model.
    pub fn log_summary(&self) {
        for line in self.csv_lines() {
            tracing::info!(target: "solverbench::report", "{line}");
        }
    }

    /// Render the table as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self)
    }
}
