//! Shared leaf types for the solver benchmark orchestrator.
//!
//! This crate has no internal dependencies and holds the vocabulary the
//! other crates communicate with:
//!
//! - [`Backend`] -- which solver family a job targets.
//! - [`ModelJob`] -- one (model file, backend) unit of work.
//! - [`CompletionEvent`] -- the single completion record every evaluation
//!   produces, regardless of backend.
//! - [`BatchExitStatus`] -- classification of batch solver exit codes.

pub mod exit;
pub mod types;

pub use exit::BatchExitStatus;
pub use types::{canonical_model_name, model_base_name, Backend, CompletionEvent, ModelJob};
