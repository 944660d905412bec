//! Workspace symbol search across the index built at startup, plus
//! incremental re-indexing when documents are validated.

mod common;

use common::lsp_client::{TestClient, file_uri};

const MY_FUNCTION: &str = "int myFunction() {\n  return 1;\n}\n";

/// Wait for the startup index build to announce completion.
async fn await_index_built(client: &mut TestClient) {
    loop {
        let msg = client.recv_notification("window/logMessage").await;
        let text = msg["params"]["message"].as_str().unwrap_or_default();
        if text.contains("indexed") {
            return;
        }
    }
}

#[tokio::test]
async fn same_symbol_across_files_yields_one_result_each() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("a.pike"), MY_FUNCTION).unwrap();
    std::fs::write(root.join("b.pike"), MY_FUNCTION).unwrap();

    let mut client = TestClient::new();
    client
        .initialize_with_root(Some(&root.display().to_string()))
        .await;
    await_index_built(&mut client).await;

    let results = client.workspace_symbols("myFun").await;
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2, "results: {results:?}");
    for result in results {
        assert_eq!(result["name"], "myFunction");
        assert_eq!(result["kind"], 6); // SymbolKind::METHOD
    }
    let uris: Vec<&str> = results
        .iter()
        .map(|r| r["location"]["uri"].as_str().unwrap())
        .collect();
    assert!(uris.iter().any(|u| u.ends_with("a.pike")));
    assert!(uris.iter().any(|u| u.ends_with("b.pike")));

    // A third file re-indexes through the validator once opened.
    let c_uri = file_uri(&root.join("c.pike").display().to_string());
    client.did_open(&c_uri, 1, MY_FUNCTION).await;
    client
        .recv_notification("textDocument/publishDiagnostics")
        .await;

    let results = client.workspace_symbols("myFun").await;
    assert_eq!(results.as_array().unwrap().len(), 3);

    client.shutdown().await;
}

#[tokio::test]
async fn query_is_case_insensitive_substring() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(
        root.join("server.pike"),
        "class RequestHandler {\n  void handleRequest() {\n  }\n}\n",
    )
    .unwrap();

    let mut client = TestClient::new();
    client
        .initialize_with_root(Some(&root.display().to_string()))
        .await;
    await_index_built(&mut client).await;

    let results = client.workspace_symbols("request").await;
    let names: Vec<&str> = results
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"RequestHandler"), "names: {names:?}");
    assert!(names.contains(&"handleRequest"), "names: {names:?}");

    // Members carry their container.
    let member = results
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["name"] == "handleRequest")
        .unwrap();
    assert_eq!(member["containerName"], "RequestHandler");

    client.shutdown().await;
}
