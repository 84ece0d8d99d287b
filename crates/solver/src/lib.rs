//! Solver backend integration.
//!
//! Provides typed protocol-line parsing, the background protocol reader,
//! connection management for the persistent solver server (with the
//! remote -> localhost -> local-launch fallback chain), local server
//! launching, and the per-job evaluation that unifies both backends
//! under one completion-event contract.

pub mod connection;
pub mod evaluator;
pub mod launch;
pub mod lines;
pub mod reader;

pub use connection::{ConnectConfig, ConnectError, ConnectionState, SolverConnection, SubmitError};
pub use evaluator::Evaluation;
pub use launch::ServerLaunchSpec;
pub use reader::ProtocolReader;
