//! The `pike.lsp.showDiagnostics` command returns a plain-text health
//! report covering the bridge, the interpreter, and the caches.

mod common;

use common::lsp_client::{TestClient, file_uri};

#[tokio::test]
async fn health_report_covers_bridge_and_caches() {
    let mut client = TestClient::new();
    client.initialize().await;

    // Give the report something to count.
    let uri = file_uri("/w/health.pike");
    client.did_open(&uri, 1, "int main() {\n  return 0;\n}\n").await;
    client
        .recv_notification("textDocument/publishDiagnostics")
        .await;

    let report = client.execute_command("pike.lsp.showDiagnostics").await;
    let report = report.as_str().expect("health report is text");

    assert!(report.contains("pike-lsp"), "report: {report}");
    assert!(report.contains("bridge connected: true"), "report: {report}");
    assert!(report.contains("pike pid: "), "report: {report}");
    assert!(
        report.contains("pike version: Pike v9.0 (pike-lsp stub)"),
        "report: {report}"
    );
    assert!(report.contains("uptime: "), "report: {report}");
    assert!(report.contains("compilation cache: "), "report: {report}");
    assert!(report.contains("stdlib index: "), "report: {report}");

    client.shutdown().await;
}

#[tokio::test]
async fn unknown_commands_return_null() {
    let mut client = TestClient::new();
    client.initialize().await;

    let result = client.execute_command("pike.lsp.noSuchCommand").await;
    assert!(result.is_null());

    client.shutdown().await;
}
