//! Persistent solver-server connection management.
//!
//! [`SolverConnection`] owns exactly one live channel to the persistent
//! backend. [`connect`](SolverConnection::connect) walks a bounded
//! fallback chain -- configured host, then localhost, then a locally
//! launched server instance -- and only the final stage's failure is
//! fatal. Once connected, [`submit`](SolverConnection::submit) sends
//! solve commands and a routing task forwards every completion event
//! from the socket's [`ProtocolReader`] to the single waiter registered
//! for that model.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use solverbench_core::CompletionEvent;

use crate::launch::{launch_server, LaunchError, ServerLaunchSpec};
use crate::reader::ProtocolReader;

/// Default solver server port.
pub const DEFAULT_PORT: u16 = 5463;

/// Connection parameters for the persistent backend.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Host to try first.
    pub host: String,
    /// Server port, shared by every fallback stage.
    pub port: u16,
    /// How to launch a local instance when nothing is reachable.
    pub launch: Option<ServerLaunchSpec>,
    /// Optional bound on the handshake and launch waits. `None` waits
    /// indefinitely, which is the server's documented contract.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            launch: None,
            handshake_timeout: None,
        }
    }
}

/// Lifecycle of the channel to the persistent backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// Terminal failure of the fallback chain.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The target host could not be resolved and no further stage applies.
    #[error("solver server at {host}:{port} is unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    /// Spawning the local server instance failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The local instance started but never reported it was listening.
    #[error("local solver server did not report listening: {0}")]
    LaunchHandshake(String),

    /// The post-launch reconnect to localhost failed.
    #[error("could not connect to the locally launched solver server: {0}")]
    LocalRetry(String),
}

/// Failure to send a command over the connection.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("not connected to the solver server")]
    NotConnected,

    #[error("failed to send command: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-stage failure inside the fallback chain.
#[derive(Debug, thiserror::Error)]
enum AttachError {
    #[error("host not resolvable: {0}")]
    Unresolvable(String),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

type WaiterMap = HashMap<String, oneshot::Sender<CompletionEvent>>;

/// Owner of the single live channel to the persistent solver server.
pub struct SolverConnection {
    config: ConnectConfig,
    state: Mutex<ConnectionState>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    socket_reader: Mutex<Option<ProtocolReader>>,
    process_reader: Mutex<Option<ProtocolReader>>,
    child: Mutex<Option<Child>>,
    /// Whether this process spawned the server and must terminate it.
    locally_owned: AtomicBool,
    completion_tx: Mutex<Option<mpsc::UnboundedSender<CompletionEvent>>>,
    waiters: Arc<Mutex<WaiterMap>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl SolverConnection {
    /// Create an unconnected handle and start its completion router.
    pub fn new(config: ConnectConfig) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let waiters: Arc<Mutex<WaiterMap>> = Arc::default();
        let router = tokio::spawn(route_completions(completion_rx, Arc::clone(&waiters)));

        Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            writer: Mutex::new(None),
            socket_reader: Mutex::new(None),
            process_reader: Mutex::new(None),
            child: Mutex::new(None),
            locally_owned: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(completion_tx)),
            waiters,
            router: Mutex::new(Some(router)),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Whether this process launched the server it is connected to.
    pub fn is_locally_owned(&self) -> bool {
        self.locally_owned.load(Ordering::SeqCst)
    }

    /// Establish the channel, recovering from unreachability.
    ///
    /// Stages, in order: the configured host; localhost when the host is
    /// unresolvable; a locally launched instance followed by one retry
    /// against localhost. The chain is bounded in stages but each
    /// handshake wait is unbounded unless
    /// [`ConnectConfig::handshake_timeout`] is set.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        *self.state.lock().await = ConnectionState::Connecting;
        let result = self.connect_chain().await;
        *self.state.lock().await = match result {
            Ok(()) => ConnectionState::Ready,
            Err(_) => ConnectionState::Disconnected,
        };
        result
    }

    async fn connect_chain(&self) -> Result<(), ConnectError> {
        let port = self.config.port;
        let mut host = self.config.host.clone();

        let mut last = match self.attach(&host, port).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        // An unknown host falls back to localhost before anything else.
        if matches!(last, AttachError::Unresolvable(_)) {
            if host == "localhost" {
                return Err(ConnectError::Unreachable {
                    host,
                    port,
                    reason: last.to_string(),
                });
            }
            tracing::info!(
                host = %host,
                error = %last,
                "Unknown solver host, switching to localhost and retrying",
            );
            self.close_partial().await;
            host = "localhost".to_string();
            last = match self.attach(&host, port).await {
                Ok(()) => return Ok(()),
                Err(e @ AttachError::Unresolvable(_)) => {
                    return Err(ConnectError::Unreachable {
                        host,
                        port,
                        reason: e.to_string(),
                    })
                }
                Err(e) => e,
            };
        }

        // Nothing listening: launch a local instance and retry once.
        tracing::warn!(
            host = %host,
            port,
            error = %last,
            "Could not connect to solver server, launching a local instance",
        );
        self.close_partial().await;
        self.launch_local().await?;
        self.attach("localhost", port).await.map_err(|e| {
            tracing::error!(error = %e, "Could not connect to the locally launched solver server");
            ConnectError::LocalRetry(e.to_string())
        })
    }

    /// Connect to one host:port and wait for the protocol handshake.
    ///
    /// Every resolved address is tried in turn (localhost commonly
    /// resolves to both ::1 and 127.0.0.1); the last connect error wins.
    async fn attach(&self, host: &str, port: u16) -> Result<(), AttachError> {
        let addrs: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| AttachError::Unresolvable(e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(AttachError::Unresolvable(format!("no addresses for {host}")));
        }

        let mut stream = None;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(AttachError::Connect(e)),
            (None, None) => {
                return Err(AttachError::Unresolvable(format!("no addresses for {host}")))
            }
        };
        let (read_half, write_half) = stream.into_split();

        let completions = self
            .completion_tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| AttachError::Handshake("connection is shut down".to_string()))?;

        *self.writer.lock().await = Some(BufWriter::new(write_half));
        let reader = ProtocolReader::spawn(read_half, "socket", completions);

        match self.bounded_wait(reader.wait_connected(), "handshake").await {
            Ok(()) => {
                *self.socket_reader.lock().await = Some(reader);
                tracing::info!(host, port, "Connected to solver server");
                Ok(())
            }
            Err(reason) => {
                reader.shutdown().await;
                *self.writer.lock().await = None;
                Err(AttachError::Handshake(reason))
            }
        }
    }

    /// Spawn the configured local server and wait for its listening line.
    async fn launch_local(&self) -> Result<(), ConnectError> {
        let spec: &ServerLaunchSpec = self
            .config
            .launch
            .as_ref()
            .ok_or(ConnectError::Launch(LaunchError::NotConfigured))?;

        let mut launched = launch_server(spec)?;

        match self.bounded_wait(launched.reader.wait_running(), "launch").await {
            Ok(()) => {}
            Err(reason) => {
                launched.reader.shutdown().await;
                if let Err(e) = launched.child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill unresponsive server process");
                }
                return Err(ConnectError::LaunchHandshake(reason));
            }
        }

        *self.process_reader.lock().await = Some(launched.reader);
        *self.child.lock().await = Some(launched.child);
        self.locally_owned.store(true, Ordering::SeqCst);
        tracing::info!("Local solver server is up");
        Ok(())
    }

    /// Await a handshake flag, bounded only when configured.
    async fn bounded_wait(
        &self,
        wait: impl std::future::Future<Output = Result<(), crate::reader::ReaderStopped>>,
        what: &str,
    ) -> Result<(), String> {
        match self.config.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("{what} not completed within {limit:?}")),
            },
            None => wait.await.map_err(|e| e.to_string()),
        }
    }

    /// Close socket-side resources between fallback stages so each stage
    /// starts clean.
    async fn close_partial(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(error = %e, "Failed to close server writer");
            }
        }
        if let Some(reader) = self.socket_reader.lock().await.take() {
            reader.shutdown().await;
        }
    }

    /// Send `SOLVE <model> [<result>]` and flush immediately.
    ///
    /// Does not wait for completion; that arrives later through the
    /// waiter registered for the model.
    pub async fn submit(
        &self,
        model_path: &Path,
        result_path: Option<&Path>,
    ) -> Result<(), SubmitError> {
        let mut command = format!("SOLVE {}", absolute_display(model_path));
        if let Some(result) = result_path {
            command.push(' ');
            command.push_str(&absolute_display(result));
        }
        tracing::debug!(command = %command, "Submitting solve command");
        self.send_line(&command).await
    }

    /// Register the single waiter for a model's completion event.
    ///
    /// A later registration for the same model replaces the earlier one;
    /// the stale waiter's receiver resolves with an error.
    pub async fn register_waiter(&self, model: &str) -> oneshot::Receiver<CompletionEvent> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        if waiters.insert(model.to_string(), tx).is_some() {
            tracing::warn!(model, "Replacing a stale completion waiter");
        }
        tracing::debug!(model, "Registered completion waiter");
        rx
    }

    /// Shut the connection down.
    ///
    /// A locally owned server is asked to QUIT and waited for; then every
    /// owned resource gets a close attempt, with individual failures
    /// logged rather than aborting the teardown.
    pub async fn shutdown(&self) {
        if self.locally_owned.load(Ordering::SeqCst) {
            tracing::info!("Stopping locally launched solver server");
            if let Err(e) = self.send_line("QUIT").await {
                tracing::warn!(error = %e, "Failed to send QUIT to local server");
            }
            if let Some(mut child) = self.child.lock().await.take() {
                match child.wait().await {
                    Ok(status) => tracing::info!(%status, "Local solver server exited"),
                    Err(e) => tracing::warn!(error = %e, "Failed to wait for local server exit"),
                }
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!(error = %e, "Failed to close server writer");
            }
        }
        if let Some(reader) = self.socket_reader.lock().await.take() {
            reader.shutdown().await;
        }
        if let Some(reader) = self.process_reader.lock().await.take() {
            reader.shutdown().await;
        }

        // Dropping the sender lets the router drain its queue and exit.
        self.completion_tx.lock().await.take();
        if let Some(router) = self.router.lock().await.take() {
            if let Err(e) = router.await {
                tracing::warn!(error = %e, "Completion router did not exit cleanly");
            }
        }

        *self.state.lock().await = ConnectionState::Disconnected;
    }

    async fn send_line(&self, line: &str) -> Result<(), SubmitError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SubmitError::NotConnected)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Forward each completion event to the one waiter registered for its
/// model. Runs until every sender clone is dropped.
async fn route_completions(
    mut completions: mpsc::UnboundedReceiver<CompletionEvent>,
    waiters: Arc<Mutex<WaiterMap>>,
) {
    while let Some(event) = completions.recv().await {
        let waiter = waiters.lock().await.remove(&event.model);
        match waiter {
            Some(tx) => {
                let model = event.model.clone();
                if tx.send(event).is_err() {
                    tracing::warn!(model = %model, "Completion waiter dropped before delivery");
                }
            }
            None => {
                // Routing error: every completion must have exactly one
                // registered consumer.
                tracing::error!(model = %event.model, "Completion event with no registered waiter");
            }
        }
    }
}

fn absolute_display(path: &Path) -> String {
    match std::path::absolute(path) {
        Ok(abs) => abs.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solverbench_core::Backend;

    #[tokio::test]
    async fn waiter_receives_routed_event() {
        let conn = SolverConnection::new(ConnectConfig::default());
        let rx = conn.register_waiter("m.xml").await;

        let tx = conn.completion_tx.lock().await.clone().expect("sender alive");
        tx.send(CompletionEvent {
            model: "m.xml".to_string(),
            backend: Backend::Persistent,
            elapsed_ms: 7,
        })
        .expect("router alive");

        let event = rx.await.expect("event routed");
        assert_eq!(event.model, "m.xml");
        assert_eq!(event.elapsed_ms, 7);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn replaced_waiter_resolves_with_error() {
        let conn = SolverConnection::new(ConnectConfig::default());
        let stale = conn.register_waiter("m.xml").await;
        let fresh = conn.register_waiter("m.xml").await;

        let tx = conn.completion_tx.lock().await.clone().expect("sender alive");
        tx.send(CompletionEvent {
            model: "m.xml".to_string(),
            backend: Backend::Persistent,
            elapsed_ms: 1,
        })
        .expect("router alive");

        assert!(stale.await.is_err(), "stale waiter must not receive");
        assert!(fresh.await.is_ok(), "fresh waiter receives");
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn submit_without_connection_is_an_error() {
        let conn = SolverConnection::new(ConnectConfig::default());
        let result = conn.submit(Path::new("/tmp/m.xml"), None).await;
        assert!(matches!(result, Err(SubmitError::NotConnected)));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn refused_connection_without_launch_is_fatal() {
        // Default host is localhost; an unused port with no launch spec
        // must walk to the launch stage and fail there.
        let conn = SolverConnection::new(ConnectConfig {
            port: 1, // virtually never listening
            ..ConnectConfig::default()
        });
        let result = conn.connect().await;
        assert!(matches!(result, Err(ConnectError::Launch(LaunchError::NotConfigured))));
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        conn.shutdown().await;
    }
}
