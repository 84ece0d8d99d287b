//! Integration tests for the job dispatcher.
//!
//! The batch solver is stood in for by `sh` running small scripts, so
//! the "model" files are the scripts themselves; the persistent backend
//! is a loopback TCP listener speaking the line protocol.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use solverbench_core::{model_base_name, Backend};
use solverbench_dispatch::{DispatcherConfig, JobDispatcher};
use solverbench_solver::{ConnectConfig, SolverConnection};

fn script_model(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("create script");
    writeln!(file, "{body}").expect("write script");
    path
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("solverbench-dispatch-{tag}"));
    std::fs::create_dir_all(&dir).expect("tmp dir");
    dir
}

/// Poll until the backend drains or the deadline passes.
async fn wait_for_drain(dispatcher: &JobDispatcher, backend: Backend) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !dispatcher.is_drained(backend) {
        assert!(Instant::now() < deadline, "backend never drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn detached_dispatcher(config: DispatcherConfig) -> JobDispatcher {
    // An unconnected connection handle: fine for batch-only runs.
    let connection = Arc::new(SolverConnection::new(ConnectConfig::default()));
    JobDispatcher::new(config, "sh", connection)
}

#[tokio::test]
async fn pending_count_drops_once_per_completion() {
    let dir = temp_dir("counts");
    let model = script_model(&dir, "quick.xml", "exit 0");

    let dispatcher = detached_dispatcher(DispatcherConfig::default());
    for _ in 0..5 {
        dispatcher
            .submit(&model, Backend::Batch)
            .await
            .expect("submit");
    }

    wait_for_drain(&dispatcher, Backend::Batch).await;
    assert_eq!(dispatcher.pending_count(Backend::Batch), 0);
    assert_eq!(dispatcher.pending_count(Backend::Persistent), 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn saturated_pool_blocks_further_submissions() {
    let dir = temp_dir("cap");
    let model = script_model(&dir, "slow.xml", "sleep 0.25");

    let dispatcher = detached_dispatcher(DispatcherConfig {
        max_workers: 2,
        parallel: true,
    });

    // Five quarter-second jobs through two slots need at least three
    // waves; anything faster means the cap leaked.
    let start = Instant::now();
    for _ in 0..5 {
        dispatcher
            .submit(&model, Backend::Batch)
            .await
            .expect("submit");
    }
    wait_for_drain(&dispatcher, Backend::Batch).await;
    assert!(
        start.elapsed() >= Duration::from_millis(700),
        "elapsed {:?} is too fast for 5 jobs on 2 workers",
        start.elapsed(),
    );

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn sequential_mode_runs_in_submission_order() {
    let dir = temp_dir("seq");
    let log = dir.join("order.log");
    let _ = std::fs::remove_file(&log);

    let dispatcher = detached_dispatcher(DispatcherConfig {
        max_workers: 200,
        parallel: false,
    });

    for name in ["one.xml", "two.xml", "three.xml"] {
        let model = script_model(&dir, name, &format!("echo {name} >> {}", log.display()));
        dispatcher
            .submit(&model, Backend::Batch)
            .await
            .expect("submit");
    }

    wait_for_drain(&dispatcher, Backend::Batch).await;
    let order = std::fs::read_to_string(&log).expect("order log");
    let ran: Vec<&str> = order.lines().collect();
    assert_eq!(ran, ["one.xml", "two.xml", "three.xml"]);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn failing_model_is_recorded_not_fatal() {
    let dir = temp_dir("warn");
    let bad = script_model(&dir, "bad.xml", "exit 1");
    let good = script_model(&dir, "good.xml", "exit 0");

    let dispatcher = detached_dispatcher(DispatcherConfig::default());
    dispatcher.submit(&bad, Backend::Batch).await.expect("submit");
    dispatcher.submit(&good, Backend::Batch).await.expect("submit");

    wait_for_drain(&dispatcher, Backend::Batch).await;
    let report = dispatcher.report();
    assert!(report.models["bad.xml"].batch_ms.is_some());
    assert!(report.models["good.xml"].batch_ms.is_some());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn submissions_after_shutdown_are_refused() {
    let dir = temp_dir("closed");
    let model = script_model(&dir, "late.xml", "exit 0");

    let dispatcher = detached_dispatcher(DispatcherConfig::default());
    dispatcher.shutdown().await;

    let result = dispatcher.submit(&model, Backend::Batch).await;
    assert!(result.is_err());
    assert_eq!(dispatcher.pending_count(Backend::Batch), 0);
}

#[tokio::test]
async fn both_backends_land_in_one_report_row() {
    // Fake persistent server: READY on connect, SUBMITTED/DONE per SOLVE.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                write_half.write_all(b"LINE READY\n").await.expect("greet");
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(path) = line.strip_prefix("SOLVE ") {
                        let base = model_base_name(Path::new(path.trim()));
                        let reported = base.replace(".xml", "_res.xml");
                        let reply = format!(
                            "MODEL {reported} QUEUED SUBMITTED\nMODEL {reported} QUEUED DONE\n"
                        );
                        write_half.write_all(reply.as_bytes()).await.expect("reply");
                    }
                }
            });
        }
    });

    let dir = temp_dir("both");
    let model = script_model(&dir, "shared.xml", "exit 0");

    let connection = Arc::new(SolverConnection::new(ConnectConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..ConnectConfig::default()
    }));
    connection.connect().await.expect("connect");

    let dispatcher = JobDispatcher::new(DispatcherConfig::default(), "sh", connection);
    dispatcher
        .submit(&model, Backend::Batch)
        .await
        .expect("batch submit");
    dispatcher
        .submit(&model, Backend::Persistent)
        .await
        .expect("persistent submit");

    wait_for_drain(&dispatcher, Backend::Batch).await;
    wait_for_drain(&dispatcher, Backend::Persistent).await;

    let report = dispatcher.report();
    let timings = report.models["shared.xml"];
    assert!(timings.batch_ms.is_some());
    assert!(timings.persistent_ms.is_some());

    dispatcher.shutdown().await;
}
