//! Batch solver exit-code classification.
//!
//! The batch solver documents its exit codes as: 0 on success, 1 if the
//! model failed to meet the convergence criteria, 2 if the input was
//! invalid, -1 for fatal errors. Any other value is the bitwise OR of the
//! underlying condition bits (4 for a bad command-line argument, 8 for
//! file read/write problems) and is reported as unrecognized.

use std::fmt;

/// Classified outcome of a batch solver run.
///
/// Every `i32` maps to exactly one variant; a non-success variant still
/// yields a valid timing record, only with a logged warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchExitStatus {
    /// Exit code 0.
    Success,
    /// Exit code 1 -- results were produced but are most likely inaccurate.
    NoConvergence,
    /// Exit code 2.
    InvalidInput,
    /// Exit code -1.
    Fatal,
    /// Any other exit code, carried verbatim.
    Unrecognized(i32),
}

impl BatchExitStatus {
    /// Map a raw process exit code onto its classification.
    pub fn classify(code: i32) -> Self {
        match code {
            0 => BatchExitStatus::Success,
            1 => BatchExitStatus::NoConvergence,
            2 => BatchExitStatus::InvalidInput,
            -1 => BatchExitStatus::Fatal,
            other => BatchExitStatus::Unrecognized(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == BatchExitStatus::Success
    }
}

impl fmt::Display for BatchExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchExitStatus::Success => write!(f, "success"),
            BatchExitStatus::NoConvergence => write!(
                f,
                "the model failed to converge; results are most likely inaccurate"
            ),
            BatchExitStatus::InvalidInput => write!(f, "invalid input"),
            BatchExitStatus::Fatal => write!(f, "fatal error"),
            BatchExitStatus::Unrecognized(code) => write!(
                f,
                "unrecognized exit value {code} (bitwise OR of: 1 no convergence, \
                 2 invalid input, 4 bad argument, 8 file read/write problem)"
            ),
        }
    }
}
