//! Bounded-concurrency job dispatch and result reporting.
//!
//! [`JobDispatcher`] feeds evaluations to a bounded worker pool with
//! zero-buffer handoff backpressure, tracks per-backend pending counts,
//! and accumulates the per-model [`report::BenchmarkReport`].

pub mod dispatcher;
pub mod report;

pub use dispatcher::{DispatchError, DispatcherConfig, JobDispatcher};
pub use report::{BenchmarkReport, ModelTimings};
