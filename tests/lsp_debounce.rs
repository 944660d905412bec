//! Debounce coalescing: a burst of rapid edits yields exactly one analysis,
//! against the final version. Real time; the server talks to a real child
//! process.

mod common;

use std::time::Duration;

use common::lsp_client::{TestClient, file_uri};

#[tokio::test]
async fn rapid_edits_publish_once_at_the_final_version() {
    let mut client = TestClient::new();
    client.initialize().await;

    let uri = file_uri("/w/debounce.pike");
    client.did_open(&uri, 1, "int v = 1;\n").await;

    // The open itself validates once.
    let first = client
        .recv_notification("textDocument/publishDiagnostics")
        .await;
    assert_eq!(first["params"]["version"], 1);

    // Burst: versions 2..=61, ~10ms apart, well inside the 250ms debounce.
    for version in 2..=61i32 {
        client
            .did_change(&uri, version, &format!("int v = {version};\n"))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The first publish after the burst is for the final version: every
    // intermediate task self-cancelled, so nothing older can precede it.
    let notification = client
        .recv_notification("textDocument/publishDiagnostics")
        .await;
    assert_eq!(
        notification["params"]["version"], 61,
        "expected one publish at the latest version, got {notification}"
    );

    client.shutdown().await;
}

#[tokio::test]
async fn close_during_debounce_discards_the_pending_validation() {
    let mut client = TestClient::new();
    client.initialize().await;

    let uri = file_uri("/w/fleeting.pike");
    client.did_open(&uri, 1, "int x;\n").await;
    // Close before the 250ms debounce fires.
    client.did_close(&uri).await;

    // The close clears diagnostics; the debounce task finds the document
    // gone and publishes nothing further for it.
    let notification = client
        .recv_notification("textDocument/publishDiagnostics")
        .await;
    assert_eq!(
        notification["params"]["diagnostics"].as_array().unwrap().len(),
        0
    );

    // Server still responsive afterwards.
    client.shutdown().await;
}
