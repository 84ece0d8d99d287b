//! Benchmark configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use solverbench_solver::{ConnectConfig, ServerLaunchSpec};

/// Run configuration with defaults suitable for a local setup.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Persistent solver server host (default: `localhost`).
    pub host: String,
    /// Persistent solver server port (default: `5463`).
    pub port: u16,
    /// Invocation used to launch a local server instance, if configured.
    pub launch_cmd: Option<String>,
    /// Working directory for the launched server.
    pub launch_dir: Option<PathBuf>,
    /// Optional bound on handshake/launch waits; unset waits forever.
    pub connect_timeout: Option<Duration>,
    /// Batch solver program (default: `lqns`).
    pub batch_solver: String,
    /// Directory scanned for model files (default: `models`).
    pub model_dir: PathBuf,
    /// Run evaluations in parallel (default: `true`).
    pub parallel: bool,
    /// Maximum concurrent evaluations (default: `200`).
    pub max_workers: usize,
    /// Optional path for a JSON dump of the results table.
    pub results_json: Option<PathBuf>,
}

impl BenchConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default     |
    /// |-------------------------------|-------------|
    /// | `SOLVER_HOST`                 | `localhost` |
    /// | `SOLVER_PORT`                 | `5463`      |
    /// | `SOLVER_LAUNCH_CMD`           | unset       |
    /// | `SOLVER_LAUNCH_DIR`           | unset       |
    /// | `SOLVER_CONNECT_TIMEOUT_SECS` | unset       |
    /// | `BATCH_SOLVER`                | `lqns`      |
    /// | `MODEL_DIR`                   | `models`    |
    /// | `PARALLEL`                    | `true`      |
    /// | `MAX_WORKERS`                 | `200`       |
    /// | `RESULTS_JSON`                | unset       |
    pub fn from_env() -> Self {
        let host = std::env::var("SOLVER_HOST").unwrap_or_else(|_| "localhost".into());

        let port: u16 = std::env::var("SOLVER_PORT")
            .unwrap_or_else(|_| "5463".into())
            .parse()
            .expect("SOLVER_PORT must be a valid u16");

        let launch_cmd = std::env::var("SOLVER_LAUNCH_CMD").ok().filter(|v| !v.is_empty());
        let launch_dir = std::env::var("SOLVER_LAUNCH_DIR").ok().map(PathBuf::from);

        let connect_timeout = std::env::var("SOLVER_CONNECT_TIMEOUT_SECS")
            .ok()
            .map(|v| {
                Duration::from_secs(
                    v.parse()
                        .expect("SOLVER_CONNECT_TIMEOUT_SECS must be a valid u64"),
                )
            });

        let batch_solver = std::env::var("BATCH_SOLVER").unwrap_or_else(|_| "lqns".into());

        let model_dir = PathBuf::from(std::env::var("MODEL_DIR").unwrap_or_else(|_| "models".into()));

        let parallel: bool = std::env::var("PARALLEL")
            .unwrap_or_else(|_| "true".into())
            .parse()
            .expect("PARALLEL must be true or false");

        let max_workers: usize = std::env::var("MAX_WORKERS")
            .unwrap_or_else(|_| "200".into())
            .parse()
            .expect("MAX_WORKERS must be a valid usize");

        let results_json = std::env::var("RESULTS_JSON").ok().map(PathBuf::from);

        Self {
            host,
            port,
            launch_cmd,
            launch_dir,
            connect_timeout,
            batch_solver,
            model_dir,
            parallel,
            max_workers,
            results_json,
        }
    }

    /// Connection parameters for the persistent backend.
    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig {
            host: self.host.clone(),
            port: self.port,
            launch: self.launch_cmd.as_ref().map(|command| ServerLaunchSpec {
                command: command.clone(),
                directory: self.launch_dir.clone(),
            }),
            handshake_timeout: self.connect_timeout,
        }
    }
}
