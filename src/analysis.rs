use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::{PerfInfo, RpcError};
use crate::supervisor::{DEFAULT_REQUEST_TIMEOUT, Supervisor};

/// The analysis kinds a single `analyze` round-trip can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Parse,
    Introspect,
    Diagnostics,
    Tokenize,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Introspect => "introspect",
            Self::Diagnostics => "diagnostics",
            Self::Tokenize => "tokenize",
        }
    }
}

/// Pike symbol kinds, as the child reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PikeSymbolKind {
    Class,
    Method,
    Variable,
    Constant,
    Enum,
    EnumConstant,
    Typedef,
    Inherit,
    Import,
    Include,
    Module,
}

/// 1-based source position, exactly as Pike reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SymbolPosition {
    pub line: u32,
    pub column: u32,
}

/// A symbol parsed out of a Pike source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PikeSymbol {
    pub name: String,
    pub kind: PikeSymbolKind,
    #[serde(default)]
    pub position: SymbolPosition,
    #[serde(default)]
    pub children: Vec<PikeSymbol>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classname: Option<String>,
    #[serde(rename = "argNames", default)]
    pub arg_names: Vec<String>,
}

/// Diagnostic severity as the child reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PikeSeverity {
    #[default]
    Error,
    Warning,
    Information,
    Hint,
}

/// A diagnostic from the child, 1-based positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PikeDiagnostic {
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    pub message: String,
    #[serde(default)]
    pub severity: PikeSeverity,
}

/// Why one analysis kind failed while others may have succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeFailure {
    pub message: String,
    pub kind: String,
}

/// Result of the `parse` kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParseOutput {
    #[serde(default)]
    pub symbols: Vec<PikeSymbol>,
    /// Parse-level diagnostics (distinct from the `diagnostics` kind, which
    /// is the full compile check).
    #[serde(default)]
    pub diagnostics: Vec<PikeDiagnostic>,
}

/// Dependencies a compiled program pulled in, as reported by the child.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DocumentDependencies {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
}

/// Result of the `introspect` kind (requires a successful compile).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntrospectOutput {
    #[serde(default)]
    pub symbols: Vec<PikeSymbol>,
    #[serde(default)]
    pub inherits: Vec<String>,
    /// Absolute paths of files the compile depended on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Include specs as written in the source (`#include "x.h"` → `x.h`).
    #[serde(default)]
    pub includes: Vec<String>,
    /// Imported module paths as written in the source.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Opaque handle to the compiled program held child-side.
    #[serde(default)]
    pub program_handle: Option<Value>,
}

impl IntrospectOutput {
    pub fn document_dependencies(&self) -> DocumentDependencies {
        DocumentDependencies {
            includes: self.includes.clone(),
            imports: self.imports.clone(),
        }
    }
}

/// One token from the `tokenize` kind.
#[derive(Debug, Clone, Deserialize)]
pub struct PikeToken {
    pub text: String,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

/// Outcome for one requested analysis kind.
#[derive(Debug, Clone)]
pub enum KindOutcome<T> {
    NotRequested,
    Ok(T),
    Failed(AnalyzeFailure),
}

impl<T> KindOutcome<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            Self::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&AnalyzeFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Decoded result of one unified `analyze` round-trip.
///
/// For every requested kind exactly one of result / failure is populated;
/// a child response violating that is normalized into a failure so callers
/// never see a kind in limbo.
#[derive(Debug)]
pub struct AnalyzeOutcome {
    pub parse: KindOutcome<ParseOutput>,
    pub introspect: KindOutcome<IntrospectOutput>,
    pub diagnostics: KindOutcome<Vec<PikeDiagnostic>>,
    pub tokenize: KindOutcome<Vec<PikeToken>>,
    pub perf: Option<PerfInfo>,
}

impl AnalyzeOutcome {
    fn decode(
        include: &[AnalysisKind],
        mut result: Value,
        perf: Option<PerfInfo>,
    ) -> Self {
        let mut results = result
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null);
        let failures: HashMap<String, AnalyzeFailure> = result
            .get_mut("failures")
            .map(Value::take)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        fn take<T: serde::de::DeserializeOwned>(
            include: &[AnalysisKind],
            kind: AnalysisKind,
            results: &mut Value,
            failures: &HashMap<String, AnalyzeFailure>,
        ) -> KindOutcome<T> {
            if !include.contains(&kind) {
                return KindOutcome::NotRequested;
            }
            if let Some(failure) = failures.get(kind.as_str()) {
                return KindOutcome::Failed(failure.clone());
            }
            match results.get_mut(kind.as_str()).map(Value::take) {
                Some(value) if !value.is_null() => match serde_json::from_value(value) {
                    Ok(decoded) => KindOutcome::Ok(decoded),
                    Err(e) => KindOutcome::Failed(AnalyzeFailure {
                        message: format!("undecodable {} payload: {e}", kind.as_str()),
                        kind: "Protocol".into(),
                    }),
                },
                // Neither result nor failure for a requested kind.
                _ => KindOutcome::Failed(AnalyzeFailure {
                    message: format!("{} missing from analyze response", kind.as_str()),
                    kind: "Protocol".into(),
                }),
            }
        }

        Self {
            parse: take(include, AnalysisKind::Parse, &mut results, &failures),
            introspect: take(include, AnalysisKind::Introspect, &mut results, &failures),
            diagnostics: take(include, AnalysisKind::Diagnostics, &mut results, &failures),
            tokenize: take(include, AnalysisKind::Tokenize, &mut results, &failures),
            perf,
        }
    }
}

/// Structured completion context around a cursor position.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionContext {
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub is_module_path: bool,
}

/// One identifier occurrence from `find_occurrences`.
#[derive(Debug, Clone, Deserialize)]
pub struct Occurrence {
    pub name: String,
    pub line: u32,
    pub column: u32,
}

/// A stdlib module resolution. `file_path` may be of the form `file:line`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StdlibResolution {
    #[serde(default)]
    pub symbols: Vec<PikeSymbol>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

/// An import/inherit/include directive extracted from source.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportSpec {
    pub name: String,
    pub kind: String,
    pub line: u32,
    #[serde(default)]
    pub path: Option<String>,
}

/// A symbol tagged with its inheritance depth (`get_waterfall_symbols`).
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSymbol {
    pub depth: u32,
    #[serde(flatten)]
    pub symbol: PikeSymbol,
}

/// Child-side cache statistics.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RemoteCacheStats {
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub evictions: u64,
}

/// Typed operations over the Pike child. Thin, stateless; all state lives
/// in the supervisor and the caches above.
#[derive(Clone)]
pub struct Analyzer {
    supervisor: Arc<Supervisor>,
    timeout: Duration,
}

impl Analyzer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// One round-trip producing any subset of parse/introspect/diagnostics/
    /// tokenize, with per-kind failures. Never fails as a whole for a
    /// kind-level problem; `Err` here means the request itself could not
    /// complete (transport, timeout, protocol).
    pub async fn analyze(
        &self,
        code: &str,
        filename: &str,
        include: &[AnalysisKind],
        cache_key: Option<&str>,
    ) -> Result<AnalyzeOutcome, RpcError> {
        let params = serde_json::json!({
            "code": code,
            "filename": filename,
            "include": include,
            "cache_key": cache_key,
        });
        let dedup = cache_key.map(|key| format!("analyze:{filename}:{key}"));
        let reply = self
            .supervisor
            .request("analyze", params, self.timeout, dedup.as_deref())
            .await?;
        Ok(AnalyzeOutcome::decode(include, reply.result, reply.perf))
    }

    /// Resolve a standard-library module. Absence is a value, not an error.
    pub async fn resolve_stdlib(
        &self,
        module_path: &str,
    ) -> Result<Option<StdlibResolution>, RpcError> {
        let params = serde_json::json!({"module": module_path});
        let dedup = format!("resolve_stdlib:{module_path}");
        let reply = self
            .supervisor
            .request("resolve_stdlib", params, self.timeout, Some(&dedup))
            .await?;
        if reply.result.is_null() {
            return Ok(None);
        }
        decode(reply.result).map(Some)
    }

    /// Ask the interpreter to locate an include relative to its own search
    /// path. `None` when not found.
    pub async fn resolve_include(
        &self,
        spec: &str,
        current_file: &str,
    ) -> Result<Option<String>, RpcError> {
        let params = serde_json::json!({"include": spec, "current_file": current_file});
        let reply = self
            .supervisor
            .request("resolve_include", params, self.timeout, None)
            .await?;
        Ok(reply
            .result
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    pub async fn get_completion_context(
        &self,
        code: &str,
        line: u32,
        column: u32,
    ) -> Result<CompletionContext, RpcError> {
        let params = serde_json::json!({
            "code": code,
            "position": {"line": line, "column": column},
        });
        let reply = self
            .supervisor
            .request("get_completion_context", params, self.timeout, None)
            .await?;
        decode(reply.result)
    }

    /// Positions of every identifier in `text`. Authoritative (the child's
    /// tokenizer skips strings and comments); rename goes through this.
    pub async fn find_occurrences(&self, text: &str) -> Result<Vec<Occurrence>, RpcError> {
        let params = serde_json::json!({"text": text});
        let reply = self
            .supervisor
            .request("find_occurrences", params, self.timeout, None)
            .await?;
        decode_seq(reply.result, "occurrences")
    }

    pub async fn get_inherited(&self, classname: &str) -> Result<Vec<PikeSymbol>, RpcError> {
        let params = serde_json::json!({"class": classname});
        let reply = self
            .supervisor
            .request("get_inherited", params, self.timeout, None)
            .await?;
        decode_seq(reply.result, "symbols")
    }

    pub async fn extract_imports(
        &self,
        code: &str,
        filename: &str,
    ) -> Result<Vec<ImportSpec>, RpcError> {
        let params = serde_json::json!({"code": code, "filename": filename});
        let reply = self
            .supervisor
            .request("extract_imports", params, self.timeout, None)
            .await?;
        decode_seq(reply.result, "imports")
    }

    pub async fn resolve_import(
        &self,
        name: &str,
        filename: &str,
    ) -> Result<Option<String>, RpcError> {
        let params = serde_json::json!({"name": name, "filename": filename});
        let reply = self
            .supervisor
            .request("resolve_import", params, self.timeout, None)
            .await?;
        Ok(reply
            .result
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    pub async fn check_circular(&self, code: &str, filename: &str) -> Result<bool, RpcError> {
        let params = serde_json::json!({"code": code, "filename": filename});
        let reply = self
            .supervisor
            .request("check_circular", params, self.timeout, None)
            .await?;
        Ok(reply
            .result
            .get("circular")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn get_waterfall_symbols(
        &self,
        code: &str,
        filename: &str,
    ) -> Result<Vec<DepthSymbol>, RpcError> {
        let params = serde_json::json!({"code": code, "filename": filename});
        let reply = self
            .supervisor
            .request("get_waterfall_symbols", params, self.timeout, None)
            .await?;
        decode_seq(reply.result, "symbols")
    }

    pub async fn get_cache_stats(&self) -> Result<RemoteCacheStats, RpcError> {
        let reply = self
            .supervisor
            .request("get_cache_stats", serde_json::json!({}), self.timeout, None)
            .await?;
        decode(reply.result)
    }

    /// Invalidate the child-side cache for `path` (or everything when
    /// `None`).
    pub async fn invalidate_cache(
        &self,
        path: Option<&str>,
        transitive: bool,
    ) -> Result<(), RpcError> {
        let params = serde_json::json!({"path": path, "transitive": transitive});
        self.supervisor
            .request("invalidate_cache", params, self.timeout, None)
            .await?;
        Ok(())
    }

    /// Parse many files in one round-trip (the workspace index build calls
    /// this in chunks). Files that fail to parse come back with empty
    /// symbol lists.
    pub async fn batch_parse(
        &self,
        files: &[(String, String)],
    ) -> Result<Vec<(String, ParseOutput)>, RpcError> {
        let params = serde_json::json!({
            "files": files
                .iter()
                .map(|(name, code)| serde_json::json!({"filename": name, "code": code}))
                .collect::<Vec<_>>(),
        });
        let reply = self
            .supervisor
            .request("batch_parse", params, self.timeout, None)
            .await?;

        #[derive(Deserialize)]
        struct BatchEntry {
            filename: String,
            #[serde(flatten)]
            output: ParseOutput,
        }
        let entries: Vec<BatchEntry> = decode_seq(reply.result, "files")?;
        Ok(entries
            .into_iter()
            .map(|e| (e.filename, e.output))
            .collect())
    }

    /// Deprecated single-purpose wrapper kept for external callers; invokes
    /// the unified `analyze` and unwraps the parse kind.
    pub async fn parse(&self, code: &str, filename: &str) -> Result<ParseOutput, RpcError> {
        tracing::warn!("parse is deprecated; use analyze with include=[parse]");
        let outcome = self
            .analyze(code, filename, &[AnalysisKind::Parse], None)
            .await?;
        unwrap_kind(outcome.parse)
    }

    /// Deprecated wrapper over `analyze include=[introspect]`.
    pub async fn introspect(
        &self,
        code: &str,
        filename: &str,
    ) -> Result<IntrospectOutput, RpcError> {
        tracing::warn!("introspect is deprecated; use analyze with include=[introspect]");
        let outcome = self
            .analyze(code, filename, &[AnalysisKind::Introspect], None)
            .await?;
        unwrap_kind(outcome.introspect)
    }

    /// Deprecated wrapper over `analyze include=[diagnostics]`.
    pub async fn analyze_uninitialized(
        &self,
        code: &str,
        filename: &str,
    ) -> Result<Vec<PikeDiagnostic>, RpcError> {
        tracing::warn!(
            "analyze_uninitialized is deprecated; use analyze with include=[diagnostics]"
        );
        let outcome = self
            .analyze(code, filename, &[AnalysisKind::Diagnostics], None)
            .await?;
        unwrap_kind(outcome.diagnostics)
    }
}

fn unwrap_kind<T>(outcome: KindOutcome<T>) -> Result<T, RpcError> {
    match outcome {
        KindOutcome::Ok(value) => Ok(value),
        KindOutcome::Failed(failure) => Err(RpcError::Remote {
            code: -32000,
            message: format!("{}: {}", failure.kind, failure.message),
        }),
        KindOutcome::NotRequested => Err(RpcError::Protocol("kind not requested".into())),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::Protocol(e.to_string()))
}

/// Decode either a bare array or an object wrapping the array under `field`.
fn decode_seq<T: serde::de::DeserializeOwned>(
    mut value: Value,
    field: &str,
) -> Result<Vec<T>, RpcError> {
    let seq = if value.is_array() {
        value
    } else {
        value.get_mut(field).map(Value::take).unwrap_or(Value::Null)
    };
    if seq.is_null() {
        return Ok(Vec::new());
    }
    decode(seq)
}
