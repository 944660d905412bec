#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tower_lsp_server::{LspService, Server};

use pike_lsp::lsp::Backend;

/// How long to wait for any single message before declaring the test hung.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// In-process LSP test client backed by `tokio::io::duplex`.
///
/// The server runs in a background task on the same runtime and spawns the
/// stub interpreter as its child, so tests use real time (a paused clock
/// would race request timeouts against real subprocess I/O).
pub struct TestClient {
    write: tokio::io::DuplexStream,
    read: BufReader<tokio::io::DuplexStream>,
    _server: tokio::task::JoinHandle<()>,
    next_id: AtomicI64,
}

impl TestClient {
    pub fn new() -> Self {
        let (client_write, server_read) = tokio::io::duplex(65536);
        let (server_write, client_read) = tokio::io::duplex(65536);

        let (service, socket) = LspService::new(Backend::new);
        let server_handle = tokio::spawn(async move {
            Server::new(server_read, server_write, socket)
                .serve(service)
                .await;
        });

        Self {
            write: client_write,
            read: BufReader::new(client_read),
            _server: server_handle,
            next_id: AtomicI64::new(1),
        }
    }

    /// Send a raw JSON-RPC message (request or notification) with LSP framing.
    pub async fn send(&mut self, msg: serde_json::Value) {
        let json = serde_json::to_string(&msg).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", json.len());
        self.write.write_all(header.as_bytes()).await.unwrap();
        self.write.write_all(json.as_bytes()).await.unwrap();
        self.write.flush().await.unwrap();
    }

    /// Receive the next LSP-framed JSON-RPC message.
    pub async fn recv(&mut self) -> serde_json::Value {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a server message")
    }

    async fn recv_inner(&mut self) -> serde_json::Value {
        let mut content_length: usize = 0;
        loop {
            let mut line = String::new();
            self.read.read_line(&mut line).await.unwrap();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(len_str) = line.strip_prefix("Content-Length: ") {
                content_length = len_str.trim().parse().unwrap();
            }
        }
        let mut body = vec![0u8; content_length];
        self.read.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Receive messages, discarding everything except the first message with
    /// the given `method` field.
    pub async fn recv_notification(&mut self, method: &str) -> serde_json::Value {
        loop {
            let msg = self.recv().await;
            if msg["method"].as_str() == Some(method) {
                return msg;
            }
        }
    }

    /// Send `initialize` (wiring the stub interpreter through
    /// initializationOptions) and `initialized`; return the capabilities.
    pub async fn initialize(&mut self) -> serde_json::Value {
        self.initialize_with_root(None).await
    }

    /// Like `initialize` but with a workspace folder.
    pub async fn initialize_with_root(&mut self, root: Option<&str>) -> serde_json::Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let workspace_folders = root.map(|path| {
            serde_json::json!([{ "uri": format!("file://{path}"), "name": "workspace" }])
        });
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "capabilities": {},
                "processId": null,
                "rootUri": null,
                "workspaceFolders": workspace_folders,
                "initializationOptions": {
                    "pike": { "pikePath": super::stub_path() }
                }
            }
        }))
        .await;

        let response = loop {
            let msg = self.recv().await;
            if msg.get("id").is_some() && msg.get("method").is_none() {
                break msg;
            }
        };

        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "initialized",
            "params": {}
        }))
        .await;

        response["result"].clone()
    }

    pub async fn did_open(&mut self, uri: &str, version: i32, text: &str) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": {
                    "uri": uri,
                    "languageId": "pike",
                    "version": version,
                    "text": text
                }
            }
        }))
        .await;
    }

    /// Send `textDocument/didChange` as one full-content change.
    pub async fn did_change(&mut self, uri: &str, version: i32, text: &str) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didChange",
            "params": {
                "textDocument": { "uri": uri, "version": version },
                "contentChanges": [{"text": text}]
            }
        }))
        .await;
    }

    pub async fn did_close(&mut self, uri: &str) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didClose",
            "params": { "textDocument": {"uri": uri} }
        }))
        .await;
    }

    /// Issue a request and return its `result`, skipping unrelated traffic.
    pub async fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))
        .await;

        let response = loop {
            let msg = self.recv().await;
            if msg.get("id") == Some(&serde_json::json!(id)) && msg.get("method").is_none() {
                break msg;
            }
        };
        response["result"].clone()
    }

    pub async fn hover(&mut self, uri: &str, line: u32, character: u32) -> serde_json::Value {
        self.request(
            "textDocument/hover",
            serde_json::json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character }
            }),
        )
        .await
    }

    pub async fn definition(&mut self, uri: &str, line: u32, character: u32) -> serde_json::Value {
        self.request(
            "textDocument/definition",
            serde_json::json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character }
            }),
        )
        .await
    }

    pub async fn references(&mut self, uri: &str, line: u32, character: u32) -> serde_json::Value {
        self.request(
            "textDocument/references",
            serde_json::json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character },
                "context": { "includeDeclaration": true }
            }),
        )
        .await
    }

    pub async fn workspace_symbols(&mut self, query: &str) -> serde_json::Value {
        self.request("workspace/symbol", serde_json::json!({ "query": query }))
            .await
    }

    pub async fn document_symbols(&mut self, uri: &str) -> serde_json::Value {
        self.request(
            "textDocument/documentSymbol",
            serde_json::json!({ "textDocument": { "uri": uri } }),
        )
        .await
    }

    pub async fn execute_command(&mut self, command: &str) -> serde_json::Value {
        self.request(
            "workspace/executeCommand",
            serde_json::json!({ "command": command, "arguments": [] }),
        )
        .await
    }

    pub async fn shutdown(&mut self) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "shutdown",
            "params": null
        }))
        .await;
        let _ = self.recv().await;
    }
}

/// Convenience: build a `file://` URI from an absolute path string.
pub fn file_uri(path: &str) -> String {
    format!("file://{path}")
}
