use std::path::PathBuf;
use std::sync::Arc;

use tower_lsp_server::Client;
use tower_lsp_server::ls_types::*;

use crate::analysis::{AnalysisKind, PikeDiagnostic, PikeSeverity, PikeSymbol};
use crate::compile_cache::{CompiledEntry, VersionKey};
use crate::documents::{self, DocumentState, NegotiatedEncoding};
use crate::rpc::RpcError;
use crate::services::Services;

/// Fire-and-forget task: debounce, analyze, fan results out, publish
/// diagnostics.
///
/// Captures `spawn_version` at spawn time so that, after the debounce
/// sleep, the task can detect whether a newer edit arrived and
/// self-cancel. N rapid edits therefore produce exactly one analysis,
/// against the latest version.
pub fn spawn_validation(services: &Arc<Services>, client: &Client, uri: Uri) {
    let spawn_version = {
        let state = services.state();
        match state.documents.version(&uri) {
            Some(version) => version,
            None => return,
        }
    };

    let services = Arc::clone(services);
    let client = client.clone();
    tokio::spawn(async move {
        validate_and_publish(services, client, uri, spawn_version).await;
    });
}

/// Debounced validation task. Sleeps the configured delay, snapshots
/// content+version atomically, runs one unified analyze, then populates the
/// caches and publishes diagnostics if the version is still current.
async fn validate_and_publish(
    services: Arc<Services>,
    client: Client,
    uri: Uri,
    spawn_version: i32,
) {
    // 1. Debounce: wait for typing to settle.
    tokio::time::sleep(services.settings().diagnostic_delay()).await;

    // 2. Snapshot content + version together in ONE lock acquisition AFTER
    //    the sleep. Capturing content at didChange time can produce stale
    //    content that passes the version guard.
    let snapshot = {
        let state = services.state();
        state.documents.snapshot(&uri)
    };
    let Some((current_version, text)) = snapshot else {
        return; // Document was closed during the debounce window.
    };

    // 3. If the current version doesn't match the spawn-time version, a
    //    newer edit arrived while we were sleeping; another task handles
    //    that version.
    if current_version != spawn_version {
        return;
    }
    let version = current_version;

    let file_path = uri.to_file_path().map(|p| p.into_owned());
    let filename = file_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| uri.as_str().to_string());

    // 4. One subprocess round-trip for everything the caches need.
    let cache_key = VersionKey::Lsp(version).to_string();
    let outcome = services
        .analyzer
        .analyze(
            &text,
            &filename,
            &[
                AnalysisKind::Parse,
                AnalysisKind::Introspect,
                AnalysisKind::Diagnostics,
            ],
            Some(&cache_key),
        )
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(RpcError::Transport(reason)) => {
            // Child crashed mid-validation: clear stale diagnostics; the
            // next schedule retries once the supervisor has restarted.
            tracing::warn!(uri = %uri.as_str(), reason, "validation lost to pike crash");
            client.publish_diagnostics(uri, vec![], Some(version)).await;
            return;
        }
        Err(e) => {
            tracing::warn!(uri = %uri.as_str(), error = %e, "validation failed");
            return;
        }
    };

    if let Some(perf) = &outcome.perf {
        tracing::debug!(
            uri = %uri.as_str(),
            pike_total_ms = perf.pike_total_ms,
            "analysis timing"
        );
    }

    for (kind, failure) in [
        ("parse", outcome.parse.failure()),
        ("introspect", outcome.introspect.failure()),
        ("diagnostics", outcome.diagnostics.failure()),
    ] {
        if let Some(failure) = failure {
            tracing::debug!(
                uri = %uri.as_str(),
                kind,
                failure_kind = %failure.kind,
                "{}",
                failure.message
            );
        }
    }

    // Symbols prefer the parse kind; a failed parse can still be covered by
    // introspection of the compiled program.
    let symbols: Vec<PikeSymbol> = outcome
        .parse
        .ok()
        .map(|p| p.symbols.clone())
        .or_else(|| outcome.introspect.ok().map(|i| i.symbols.clone()))
        .unwrap_or_default();

    let diagnostics: Vec<PikeDiagnostic> = outcome
        .diagnostics
        .ok()
        .cloned()
        .or_else(|| outcome.parse.ok().map(|p| p.diagnostics.clone()))
        .unwrap_or_default();

    let introspect = outcome.introspect.ok();
    let dependencies = introspect.map(|i| i.document_dependencies());
    let inherits = introspect.map(|i| i.inherits.clone()).unwrap_or_default();

    let doc_state = DocumentState::new(
        version,
        &text,
        symbols,
        diagnostics,
        dependencies,
        inherits,
    );

    // 5. Post-analysis version guard + fan-out under a single lock: either
    //    every cache sees the new state or none does.
    let max_problems = services.settings().max_number_of_problems;
    let encoding = services.encoding();
    let published: Option<Vec<Diagnostic>> = {
        let mut state = services.state();
        if state.documents.version(&uri) != Some(version) {
            None
        } else if !state.documents.store_state(uri.clone(), doc_state) {
            None
        } else if let Some(stored) = state.documents.state(&uri) {
            state.symbols.index_document(uri.clone(), &stored.symbols);

            if let (Some(path), Some(introspect)) = (&file_path, introspect) {
                let deps: Vec<PathBuf> =
                    introspect.dependencies.iter().map(PathBuf::from).collect();
                state.compile_cache.insert(
                    path.clone(),
                    VersionKey::Lsp(version),
                    CompiledEntry {
                        program_handle: introspect.program_handle.clone(),
                        diagnostics: stored.diagnostics.clone(),
                    },
                    &deps,
                );
            }

            Some(
                stored
                    .diagnostics
                    .iter()
                    .take(max_problems)
                    .map(|d| pike_diagnostic_to_lsp(d, &text, encoding))
                    .collect(),
            )
        } else {
            None
        }
    };

    // 6. Publish outside the lock.
    if let Some(diagnostics) = published {
        client
            .publish_diagnostics(uri, diagnostics, Some(version))
            .await;
    }
}

/// Convert a child diagnostic (1-based) to an LSP diagnostic.
///
/// The range covers the identifier at the reported position when one is
/// there, otherwise it collapses to a point.
pub fn pike_diagnostic_to_lsp(
    diag: &PikeDiagnostic,
    text: &str,
    encoding: NegotiatedEncoding,
) -> Diagnostic {
    let line_idx = diag.line.saturating_sub(1);
    let line = text.lines().nth(line_idx as usize).unwrap_or("");
    let byte_col = diag.column.saturating_sub(1) as usize;
    let start = Position::new(line_idx, documents::byte_col_to_lsp(line, byte_col, encoding));

    let is_word = |b: u8| b == b'_' || b.is_ascii_alphanumeric();
    let bytes = line.as_bytes();
    let mut end_byte = byte_col.min(bytes.len());
    while end_byte < bytes.len() && is_word(bytes[end_byte]) {
        end_byte += 1;
    }
    let end = if end_byte > byte_col {
        Position::new(line_idx, documents::byte_col_to_lsp(line, end_byte, encoding))
    } else {
        start
    };

    let severity = match diag.severity {
        PikeSeverity::Error => DiagnosticSeverity::ERROR,
        PikeSeverity::Warning => DiagnosticSeverity::WARNING,
        PikeSeverity::Information => DiagnosticSeverity::INFORMATION,
        PikeSeverity::Hint => DiagnosticSeverity::HINT,
    };

    Diagnostic {
        range: Range::new(start, end),
        severity: Some(severity),
        source: Some("pike".to_string()),
        message: diag.message.clone(),
        ..Default::default()
    }
}
