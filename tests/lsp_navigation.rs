//! Hover, definition, references, and rename through the document cache and
//! the stdlib index.

mod common;

use common::lsp_client::{TestClient, file_uri};

const CODE: &str = "\
int shared_total;

string format_entry(string name, int count) {
  return name;
}

void run() {
  format_entry(\"x\", shared_total);
}
";

async fn open_and_settle(client: &mut TestClient, uri: &str, text: &str) {
    client.did_open(uri, 1, text).await;
    client
        .recv_notification("textDocument/publishDiagnostics")
        .await;
}

#[tokio::test]
async fn hover_shows_the_local_signature() {
    let mut client = TestClient::new();
    client.initialize().await;
    let uri = file_uri("/w/nav.pike");
    open_and_settle(&mut client, &uri, CODE).await;

    // Hover on the call site of format_entry (line 7, inside the name).
    let hover = client.hover(&uri, 7, 4).await;
    let value = hover["contents"]["value"].as_str().unwrap();
    assert!(value.contains("format_entry"), "hover: {value}");
    assert!(value.contains("string"), "hover: {value}");
    assert!(value.contains("name, count"), "hover: {value}");

    client.shutdown().await;
}

#[tokio::test]
async fn definition_jumps_to_the_local_declaration() {
    let mut client = TestClient::new();
    client.initialize().await;
    let uri = file_uri("/w/nav.pike");
    open_and_settle(&mut client, &uri, CODE).await;

    let location = client.definition(&uri, 7, 4).await;
    assert_eq!(location["uri"].as_str().unwrap(), uri);
    assert_eq!(location["range"]["start"]["line"], 2);
    assert_eq!(location["range"]["start"]["character"], 7);
    assert_eq!(location["range"]["end"]["character"], 19);

    client.shutdown().await;
}

#[tokio::test]
async fn definition_resolves_stdlib_modules_to_file_and_line() {
    let mut client = TestClient::new();
    client.initialize().await;
    let uri = file_uri("/w/stdlib.pike");
    let code = "void setup() {\n  Stdio.File log_file;\n}\n";
    open_and_settle(&mut client, &uri, code).await;

    // Cursor on `File` in `Stdio.File`: resolves the dotted module path
    // through the stdlib index, landing on the `file:line` the interpreter
    // reported (1-based 42 → 0-based 41).
    let location = client.definition(&uri, 1, 9).await;
    let target = location["uri"].as_str().unwrap();
    assert!(target.contains("Stdio.pmod"), "target: {target}");
    assert_eq!(location["range"]["start"]["line"], 41);

    client.shutdown().await;
}

#[tokio::test]
async fn references_cover_declaration_and_uses() {
    let mut client = TestClient::new();
    client.initialize().await;
    let uri = file_uri("/w/nav.pike");
    open_and_settle(&mut client, &uri, CODE).await;

    // shared_total: declared on line 0, used on line 7.
    let references = client.references(&uri, 0, 5).await;
    let lines: Vec<u64> = references
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["range"]["start"]["line"].as_u64().unwrap())
        .collect();
    assert!(lines.contains(&0), "lines: {lines:?}");
    assert!(lines.contains(&7), "lines: {lines:?}");

    client.shutdown().await;
}

#[tokio::test]
async fn rename_rewrites_every_occurrence() {
    let mut client = TestClient::new();
    client.initialize().await;
    let uri = file_uri("/w/nav.pike");
    open_and_settle(&mut client, &uri, CODE).await;

    let edit = client
        .request(
            "textDocument/rename",
            serde_json::json!({
                "textDocument": { "uri": uri },
                "position": { "line": 0, "character": 5 },
                "newName": "grand_total"
            }),
        )
        .await;

    let edits = edit["changes"][&uri].as_array().unwrap();
    assert_eq!(edits.len(), 2, "edits: {edits:?}");
    assert!(edits.iter().all(|e| e["newText"] == "grand_total"));

    client.shutdown().await;
}

#[tokio::test]
async fn hover_on_whitespace_is_null() {
    let mut client = TestClient::new();
    client.initialize().await;
    let uri = file_uri("/w/nav.pike");
    open_and_settle(&mut client, &uri, CODE).await;

    let hover = client.hover(&uri, 1, 0).await;
    assert!(hover.is_null());

    client.shutdown().await;
}
