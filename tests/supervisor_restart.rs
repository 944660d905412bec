//! Supervisor lifecycle against the real stub interpreter: handshake,
//! crash recovery with pending-request rejection, and explicit shutdown.
//! Real time throughout; a paused clock would race the request timeouts
//! against genuine subprocess I/O.

mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use pike_lsp::rpc::RpcError;
use pike_lsp::supervisor::{Phase, SpawnConfig, Supervisor};

fn stub_config() -> SpawnConfig {
    SpawnConfig {
        program: common::stub_path(),
        args: vec![],
        env: vec![],
    }
}

#[tokio::test]
async fn handshake_caches_the_interpreter_version() {
    let supervisor = Supervisor::start(stub_config());
    assert!(supervisor.wait_until_running(Duration::from_secs(10)).await);

    let version = supervisor.pike_version().expect("version cached");
    assert!(version.display.contains("stub"));
    assert_eq!(version.version, "9.0");

    let report = supervisor.health_report();
    assert!(report.contains("bridge connected: true"));
    assert!(report.contains("pike version: Pike v9.0 (pike-lsp stub)"));

    supervisor.stop();
}

#[tokio::test]
async fn crash_rejects_pending_and_restarts() {
    let supervisor = Supervisor::start(stub_config());
    assert!(supervisor.wait_until_running(Duration::from_secs(10)).await);

    // A request the child will never answer: debug_exit kills it.
    let started = Instant::now();
    let doomed = supervisor
        .request(
            "debug_exit",
            json!({"code": 7}),
            Duration::from_secs(30),
            None,
        )
        .await;
    assert!(
        matches!(doomed, Err(RpcError::Transport(_))),
        "expected transport error, got {doomed:?}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "transport failure must surface promptly, took {:?}",
        started.elapsed()
    );

    // The supervisor restarts with backoff; a fresh request succeeds.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if supervisor.wait_until_running(Duration::from_secs(2)).await {
            break;
        }
        assert!(Instant::now() < deadline, "child did not restart in time");
    }
    let reply = supervisor
        .request("get_version", json!({}), Duration::from_secs(10), None)
        .await
        .expect("post-restart request succeeds");
    assert_eq!(reply.result["version"], "9.0");

    // The crash left a trace in the recent-errors ring.
    let report = supervisor.health_report();
    assert!(report.contains("restarts: 1"), "report: {report}");
    assert!(
        report.to_lowercase().contains("error"),
        "stderr error line expected in report: {report}"
    );

    supervisor.stop();
}

#[tokio::test]
async fn analyze_survives_a_mid_session_crash() {
    let supervisor = Supervisor::start(stub_config());
    assert!(supervisor.wait_until_running(Duration::from_secs(10)).await);

    let code = "int main() {\n  return 0;\n}\n";
    let reply = supervisor
        .request(
            "analyze",
            json!({"code": code, "filename": "a.pike", "include": ["diagnostics"]}),
            Duration::from_secs(10),
            None,
        )
        .await
        .expect("first analyze succeeds");
    assert!(reply.result["result"]["diagnostics"].as_array().unwrap().is_empty());

    let _ = supervisor
        .request("debug_exit", json!({}), Duration::from_secs(5), None)
        .await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !supervisor.wait_until_running(Duration::from_secs(2)).await {
        assert!(Instant::now() < deadline, "child did not restart in time");
    }

    // Re-issuing the same analyze works against the fresh child.
    let reply = supervisor
        .request(
            "analyze",
            json!({"code": code, "filename": "a.pike", "include": ["diagnostics"]}),
            Duration::from_secs(10),
            None,
        )
        .await
        .expect("post-restart analyze succeeds");
    assert!(reply.result["result"]["diagnostics"].as_array().unwrap().is_empty());

    supervisor.stop();
}

#[tokio::test]
async fn stop_is_terminal() {
    let supervisor = Supervisor::start(stub_config());
    assert!(supervisor.wait_until_running(Duration::from_secs(10)).await);

    supervisor.stop();
    // Give the run loop a moment to settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(supervisor.phase(), Phase::ShutDown);

    let result = supervisor
        .request("get_version", json!({}), Duration::from_secs(1), None)
        .await;
    assert!(matches!(result, Err(RpcError::Transport(_))));
}

#[tokio::test]
async fn failed_version_handshake_still_reaches_running() {
    // An interpreter that is alive but cannot answer get_version must still
    // serve; only the cached version degrades to "Unknown".
    let supervisor = Supervisor::start(SpawnConfig {
        program: common::stub_path(),
        args: vec![],
        env: vec![("PIKE_LSP_STUB_FAIL_VERSION".to_string(), "1".to_string())],
    });
    assert!(supervisor.wait_until_running(Duration::from_secs(10)).await);

    let version = supervisor.pike_version().expect("version cached");
    assert_eq!(version.display, "Unknown");

    let report = supervisor.health_report();
    assert!(report.contains("bridge connected: true"), "report: {report}");
    assert!(report.contains("pike version: Unknown"), "report: {report}");

    // The child still answers other methods.
    let reply = supervisor
        .request(
            "analyze",
            json!({"code": "int x;\n", "filename": "a.pike", "include": ["diagnostics"]}),
            Duration::from_secs(10),
            None,
        )
        .await
        .expect("analyze succeeds despite the failed handshake");
    assert!(
        reply.result["result"]["diagnostics"]
            .as_array()
            .unwrap()
            .is_empty()
    );

    supervisor.stop();
}

#[tokio::test]
async fn missing_program_keeps_retrying_without_running() {
    let supervisor = Supervisor::start(SpawnConfig {
        program: "/nonexistent/pike-binary".to_string(),
        args: vec![],
        env: vec![],
    });
    assert!(!supervisor.wait_until_running(Duration::from_secs(1)).await);
    let report = supervisor.health_report();
    assert!(report.contains("bridge connected: false"));
    supervisor.stop();
}
