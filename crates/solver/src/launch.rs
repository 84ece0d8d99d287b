//! Local solver-server launching.
//!
//! When no server is reachable, [`launch_server`] spawns one from a
//! configured invocation string and working directory, attaches a
//! [`ProtocolReader`] to its stdout to watch for the "listening" line,
//! and relays stderr into the log stream.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;

use crate::reader::ProtocolReader;

/// How to start a local instance of the solver server.
#[derive(Debug, Clone)]
pub struct ServerLaunchSpec {
    /// Full invocation, split on whitespace into program + arguments.
    pub command: String,
    /// Working directory for the server process.
    pub directory: Option<PathBuf>,
}

/// Errors from spawning a local server instance.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// No launch invocation was configured.
    #[error("no local launch command configured")]
    NotConfigured,

    /// The configured invocation string is empty.
    #[error("local launch command is empty")]
    EmptyCommand,

    /// The spawn itself failed.
    #[error("failed to launch local solver server: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A locally launched server process with its attached output reader.
///
/// The reader only drives the `running` flag; model status lines on the
/// launcher stream carry no registered consumer, mirroring the fact that
/// evaluation events are owned by the socket connection.
pub struct LaunchedServer {
    pub child: Child,
    pub reader: ProtocolReader,
}

/// Spawn the server described by `spec`.
///
/// stdout is piped into a [`ProtocolReader`] labelled `launcher`; stderr
/// is drained line by line into the log so the process can never block
/// on a full pipe. The caller is expected to await the reader's
/// `running` flag before connecting.
pub fn launch_server(spec: &ServerLaunchSpec) -> Result<LaunchedServer, LaunchError> {
    let mut parts = spec.command.split_whitespace();
    let program = parts.next().ok_or(LaunchError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.directory {
        cmd.current_dir(dir);
    }

    tracing::info!(command = %spec.command, directory = ?spec.directory, "Launching local solver server");

    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LaunchError::Spawn(std::io::Error::other("child stdout not captured")))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_stderr(stderr));
    }

    // The receiver is dropped on purpose: completions from this stream
    // are discarded.
    let (discard_tx, _discard_rx) = mpsc::unbounded_channel();
    let reader = ProtocolReader::spawn(stdout, "launcher", discard_tx);

    Ok(LaunchedServer { child, reader })
}

/// Forward server stderr lines into the log stream until EOF.
async fn relay_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::warn!(reader = "launcher", line = %line, "Server stderr"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(reader = "launcher", error = %e, "Server stderr closed");
                break;
            }
        }
    }
}
