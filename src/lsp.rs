use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tower_lsp_server::jsonrpc::Result;
use tower_lsp_server::ls_types::request::{
    GotoDeclarationParams, GotoDeclarationResponse, GotoImplementationParams,
    GotoImplementationResponse, GotoTypeDefinitionParams, GotoTypeDefinitionResponse,
};
use tower_lsp_server::ls_types::*;
use tower_lsp_server::{Client, LanguageServer, LspService, Server};

use crate::analysis::{AnalysisKind, PikeSymbol, PikeSymbolKind, SymbolPosition};
use crate::config::Settings;
use crate::documents::{
    self, DocumentState, NegotiatedEncoding, identifier_range_at, module_path_at_position,
    word_at_position,
};
use crate::services::Services;
use crate::stdlib::StdlibModuleInfo;
use crate::supervisor::{SpawnConfig, Supervisor};
use crate::validator;
use crate::workspace::{self, MAX_RESULTS};

/// Command id for the plain-text health report.
const HEALTH_COMMAND: &str = "pike.lsp.showDiagnostics";

/// How long `initialize` waits for the interpreter before answering anyway
/// (the supervisor keeps retrying in the background).
const INITIAL_START_WAIT: Duration = Duration::from_secs(10);

/// Files parsed per batch request during the workspace index build.
const INDEX_CHUNK: usize = 32;

const PIKE_KEYWORDS: &[&str] = &[
    "array", "break", "case", "catch", "class", "constant", "continue", "do", "else", "enum",
    "float", "for", "foreach", "function", "gauge", "if", "import", "inherit", "int", "lambda",
    "mapping", "mixed", "multiset", "object", "private", "program", "protected", "public",
    "return", "sscanf", "static", "string", "switch", "typedef", "void", "while",
];

/// Launch-time overrides from the CLI, applied on top of
/// `initializationOptions`.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub pike_path: Option<String>,
    pub pike_args: Vec<String>,
}

/// LSP server backend.
///
/// All caches and the supervisor handle live in the [`Services`] bundle,
/// assembled during `initialize` once the supervisor is started. Handlers
/// never propagate errors upward; failures degrade to null/empty responses.
pub struct Backend {
    client: Client,
    launch: LaunchOptions,
    services: RwLock<Option<Arc<Services>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish()
    }
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self::with_launch(client, LaunchOptions::default())
    }

    pub fn with_launch(client: Client, launch: LaunchOptions) -> Self {
        Self {
            client,
            launch,
            services: RwLock::new(None),
        }
    }

    fn services(&self) -> Option<Arc<Services>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Snapshot of (version, text, analysis state) for a URI.
    fn document(
        &self,
        services: &Services,
        uri: &Uri,
    ) -> Option<(i32, String, Option<Arc<DocumentState>>)> {
        let state = services.state();
        let (version, text) = state.documents.snapshot(uri)?;
        let doc_state = state.documents.state(uri);
        Some((version, text, doc_state))
    }
}

impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        // Negotiate positionEncoding: prefer UTF-8 if the client advertises it.
        let encoding = params
            .capabilities
            .general
            .as_ref()
            .and_then(|g| g.position_encodings.as_ref())
            .and_then(|encs| {
                encs.iter()
                    .find(|e| e.as_str() == PositionEncodingKind::UTF8.as_str())
            })
            .map(|_| NegotiatedEncoding::Utf8)
            .unwrap_or(NegotiatedEncoding::Utf16);

        let mut settings = Settings::from_lsp_value(params.initialization_options.as_ref());
        if let Some(pike_path) = &self.launch.pike_path {
            settings.pike_path = pike_path.clone();
        }

        let workspace_root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .and_then(|folder| folder.uri.to_file_path())
            .map(|p| p.into_owned());

        let supervisor = Supervisor::start(SpawnConfig {
            program: settings.pike_path.clone(),
            args: self.launch.pike_args.clone(),
            env: settings
                .child_env()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
        if !supervisor.wait_until_running(INITIAL_START_WAIT).await {
            // Keep serving; the supervisor retries with backoff and the
            // health command explains what is wrong.
            self.client
                .log_message(
                    MessageType::WARNING,
                    format!(
                        "pike-lsp: interpreter '{}' has not started yet; \
                         diagnostics will appear once it does",
                        settings.pike_path
                    ),
                )
                .await;
        }

        let services = Services::new(supervisor, settings, workspace_root, encoding);
        *self.services.write().unwrap_or_else(|e| e.into_inner()) = Some(services);

        let position_encoding = match encoding {
            NegotiatedEncoding::Utf8 => PositionEncodingKind::UTF8,
            NegotiatedEncoding::Utf16 => PositionEncodingKind::UTF16,
        };

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "pike-lsp".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: server_capabilities(position_encoding),
            offset_encoding: None,
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        // Watch Pike sources so the compilation cache follows on-disk edits.
        let registration = Registration {
            id: "pike-source-watch".to_string(),
            method: "workspace/didChangeWatchedFiles".to_string(),
            register_options: Some(
                serde_json::to_value(DidChangeWatchedFilesRegistrationOptions {
                    watchers: vec![FileSystemWatcher {
                        glob_pattern: GlobPattern::String("**/*.{pike,pmod,h}".to_string()),
                        kind: Some(WatchKind::Create | WatchKind::Change | WatchKind::Delete),
                    }],
                })
                .unwrap(),
            ),
        };
        if let Err(e) = self.client.register_capability(vec![registration]).await {
            self.client
                .log_message(
                    MessageType::WARNING,
                    format!(
                        "pike-lsp: failed to register file watcher ({e}); \
                         on-disk changes won't invalidate the cache"
                    ),
                )
                .await;
        }

        if let Some(services) = self.services() {
            if let Some(root) = services.workspace_root.clone() {
                let client = self.client.clone();
                tokio::spawn(async move {
                    build_workspace_index(services, client, root).await;
                });
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(services) = self.services() {
            services.supervisor.stop();
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(services) = self.services() else {
            return;
        };
        let uri = params.text_document.uri;
        if uri.to_file_path().is_none() {
            self.client
                .log_message(
                    MessageType::INFO,
                    format!("pike-lsp: skipping non-file URI: {}", uri.as_str()),
                )
                .await;
            return;
        }

        {
            let mut state = services.state();
            state.documents.open(
                uri.clone(),
                params.text_document.version,
                params.text_document.text,
            );
        }
        validator::spawn_validation(&services, &self.client, uri);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(services) = self.services() else {
            return;
        };
        let uri = params.text_document.uri;
        let encoding = services.encoding();
        {
            let mut state = services.state();
            state.documents.change(
                &uri,
                params.text_document.version,
                params.content_changes,
                encoding,
            );
        }
        validator::spawn_validation(&services, &self.client, uri);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Some(services) = self.services() else {
            return;
        };
        let uri = params.text_document.uri;
        {
            let mut state = services.state();
            state.documents.close(&uri);
        }
        // Clear diagnostics; the symbol index keeps the on-disk view.
        self.client.publish_diagnostics(uri, vec![], None).await;
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        let Some(services) = self.services() else {
            return;
        };
        let old = services.settings();
        let new = Settings::from_lsp_value(Some(&params.settings));
        let pike_path_changed = new.pike_path != old.pike_path;
        services.update_settings(new);

        if pike_path_changed {
            self.client
                .log_message(
                    MessageType::WARNING,
                    "pike-lsp: pike.pikePath changed; restart the language server to apply it",
                )
                .await;
        }

        for uri in services.state().documents.open_uris() {
            validator::spawn_validation(&services, &self.client, uri);
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        let Some(services) = self.services() else {
            return;
        };

        let changed: Vec<PathBuf> = params
            .changes
            .iter()
            .filter_map(|c| c.uri.to_file_path().map(|p| p.into_owned()))
            .collect();
        if changed.is_empty() {
            return;
        }

        {
            let mut state = services.state();
            for path in &changed {
                state.compile_cache.invalidate(path, true);
                state.includes.invalidate(path);
            }
        }
        for path in &changed {
            let path = path.display().to_string();
            if let Err(e) = services.analyzer.invalidate_cache(Some(&path), true).await {
                tracing::debug!(error = %e, "child-side invalidation failed");
            }
        }

        // Re-validate open documents so diagnostics reflect the new state of
        // their dependencies.
        for uri in services.state().documents.open_uris() {
            validator::spawn_validation(&services, &self.client, uri);
        }
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let encoding = services.encoding();

        let Some((_, text, doc_state)) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, range)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };

        // Local symbols first.
        if let Some(doc_state) = &doc_state
            && let Some(symbol) = doc_state.find_symbol(&word)
        {
            return Ok(Some(Hover {
                contents: HoverContents::Markup(MarkupContent {
                    kind: MarkupKind::Markdown,
                    value: symbol_hover_markdown(symbol),
                }),
                range: Some(range),
            }));
        }

        // Then the standard library, using the full dotted path.
        if let Some((module_path, _)) = module_path_at_position(&text, position, encoding)
            && let Some(info) = resolve_stdlib_module(&services, &module_path).await
        {
            return Ok(Some(Hover {
                contents: HoverContents::Markup(MarkupContent {
                    kind: MarkupKind::Markdown,
                    value: stdlib_hover_markdown(&info),
                }),
                range: Some(range),
            }));
        }

        Ok(None)
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        Ok(self
            .definition_of(&services, &uri, position)
            .await
            .map(GotoDefinitionResponse::Scalar))
    }

    async fn goto_declaration(
        &self,
        params: GotoDeclarationParams,
    ) -> Result<Option<GotoDeclarationResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        Ok(self
            .definition_of(&services, &uri, position)
            .await
            .map(GotoDeclarationResponse::Scalar))
    }

    async fn goto_type_definition(
        &self,
        params: GotoTypeDefinitionParams,
    ) -> Result<Option<GotoTypeDefinitionResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let encoding = services.encoding();

        // The type of the symbol under the cursor, then its definition.
        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, _)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };
        let Some(type_name) = doc_state
            .find_symbol(&word)
            .and_then(|s| s.type_name.clone())
        else {
            return Ok(None);
        };

        if let Some(type_symbol) = doc_state.find_symbol(&type_name) {
            let range = identifier_range_at(&text, type_symbol.position, &type_name, encoding);
            return Ok(Some(GotoTypeDefinitionResponse::Scalar(Location::new(
                uri, range,
            ))));
        }
        Ok(self
            .stdlib_location(&services, &type_name)
            .await
            .map(GotoTypeDefinitionResponse::Scalar))
    }

    async fn goto_implementation(
        &self,
        params: GotoImplementationParams,
    ) -> Result<Option<GotoImplementationResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        Ok(self
            .definition_of(&services, &uri, position)
            .await
            .map(GotoImplementationResponse::Scalar))
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let encoding = services.encoding();

        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, _)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };

        let mut locations: Vec<Location> = doc_state
            .positions_of(&word)
            .iter()
            .map(|p| Location::new(uri.clone(), identifier_range_at(&text, *p, &word, encoding)))
            .collect();

        // Declarations in other files, via the workspace index.
        let state = services.state();
        for (other_uri, flat) in state.symbols.search(&word, MAX_RESULTS) {
            if other_uri == uri || flat.name != word {
                continue;
            }
            locations.push(Location::new(other_uri, point_range(flat.position)));
        }

        Ok(Some(locations))
    }

    async fn document_highlight(
        &self,
        params: DocumentHighlightParams,
    ) -> Result<Option<Vec<DocumentHighlight>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let encoding = services.encoding();

        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, _)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };

        Ok(Some(
            doc_state
                .positions_of(&word)
                .iter()
                .map(|p| DocumentHighlight {
                    range: identifier_range_at(&text, *p, &word, encoding),
                    kind: Some(DocumentHighlightKind::TEXT),
                })
                .collect(),
        ))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let encoding = services.encoding();
        let Some((_, text, Some(doc_state))) =
            self.document(&services, &params.text_document.uri)
        else {
            return Ok(None);
        };
        let nested = doc_state
            .symbols
            .iter()
            .map(|s| to_document_symbol(s, &text, encoding))
            .collect();
        Ok(Some(DocumentSymbolResponse::Nested(nested)))
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<WorkspaceSymbolResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let state = services.state();
        let hits = state.symbols.search(&params.query, MAX_RESULTS);
        #[allow(deprecated)]
        let results: Vec<SymbolInformation> = hits
            .into_iter()
            .map(|(uri, flat)| SymbolInformation {
                name: flat.name.clone(),
                kind: to_lsp_symbol_kind(flat.kind),
                tags: None,
                deprecated: None,
                location: Location::new(uri, point_range(flat.position)),
                container_name: flat.container,
            })
            .collect();
        Ok(Some(results.into()))
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let encoding = services.encoding();

        let Some((_, text, doc_state)) = self.document(&services, &uri) else {
            return Ok(None);
        };

        // Ask the child what sits before the cursor (base, operator, member).
        let line = position.line + 1;
        let column = lsp_character_to_column(&text, position, encoding);
        let context = match services
            .analyzer
            .get_completion_context(&text, line, column)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                tracing::debug!(error = %e, "completion context unavailable");
                Default::default()
            }
        };

        let mut items: Vec<CompletionItem> = Vec::new();

        if let Some(base) = context.base.as_deref() {
            // Member access: stdlib module members, then local class members.
            if let Some(info) = resolve_stdlib_module(&services, base).await {
                items.extend(info.symbols.values().map(|s| {
                    stdlib_completion_item(base, s)
                }));
            } else if let Some(doc_state) = &doc_state
                && let Some(class_symbol) = doc_state.find_symbol(base)
            {
                items.extend(class_symbol.children.iter().map(symbol_completion_item));
            }
        } else {
            if let Some(doc_state) = &doc_state {
                let mut flat = Vec::new();
                flatten_symbols(&doc_state.symbols, &mut flat);
                items.extend(flat.into_iter().map(symbol_completion_item));
                items.extend(include_completion_items(&services, &uri, doc_state).await);
            }
            items.extend(PIKE_KEYWORDS.iter().map(|kw| CompletionItem {
                label: (*kw).to_string(),
                kind: Some(CompletionItemKind::KEYWORD),
                ..Default::default()
            }));
        }

        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn completion_resolve(&self, mut item: CompletionItem) -> Result<CompletionItem> {
        let Some(services) = self.services() else {
            return Ok(item);
        };
        // Lazily attach documentation for stdlib members tagged at creation.
        if let Some(data) = item.data.clone()
            && let Some(module) = data.get("module").and_then(Value::as_str)
            && let Some(name) = data.get("name").and_then(Value::as_str)
            && let Some(info) = resolve_stdlib_module(&services, module).await
            && let Some(symbol) = info.symbols.get(name)
        {
            item.documentation = Some(Documentation::MarkupContent(MarkupContent {
                kind: MarkupKind::Markdown,
                value: symbol_hover_markdown(symbol),
            }));
        }
        Ok(item)
    }

    async fn signature_help(&self, params: SignatureHelpParams) -> Result<Option<SignatureHelp>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let encoding = services.encoding();

        let Some((_, text, doc_state)) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((callee, active_parameter)) = enclosing_call(&text, position, encoding) else {
            return Ok(None);
        };

        let symbol = doc_state
            .as_ref()
            .and_then(|s| s.find_symbol(&callee).cloned());
        let symbol = match symbol {
            Some(symbol) => symbol,
            None => match resolve_stdlib_module(&services, &callee).await {
                Some(info) => match info.symbols.get(&callee) {
                    Some(s) => s.clone(),
                    None => return Ok(None),
                },
                None => return Ok(None),
            },
        };

        let label = format!("{}({})", symbol.name, symbol.arg_names.join(", "));
        let parameters: Vec<ParameterInformation> = symbol
            .arg_names
            .iter()
            .map(|arg| ParameterInformation {
                label: ParameterLabel::Simple(arg.clone()),
                documentation: None,
            })
            .collect();

        Ok(Some(SignatureHelp {
            signatures: vec![SignatureInformation {
                label,
                documentation: symbol.type_name.map(|t| {
                    Documentation::String(format!("returns {t}"))
                }),
                parameters: Some(parameters),
                active_parameter: Some(active_parameter),
            }],
            active_signature: Some(0),
            active_parameter: Some(active_parameter),
        }))
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let encoding = services.encoding();
        let Some((_, text, _)) = self.document(&services, &params.text_document.uri) else {
            return Ok(None);
        };
        Ok(word_at_position(&text, params.position, encoding)
            .map(|(_, range)| PrepareRenameResponse::Range(range)))
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let encoding = services.encoding();
        let new_name = params.new_name;

        if !is_valid_identifier(&new_name) {
            return Ok(None);
        }

        let Some((_, text, doc_state)) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, _)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };

        // The child's tokenizer is authoritative (it skips strings and
        // comments); the eager position index is the fallback.
        let positions: Vec<SymbolPosition> = match services.analyzer.find_occurrences(&text).await {
            Ok(occurrences) => occurrences
                .into_iter()
                .filter(|o| o.name == word)
                .map(|o| SymbolPosition {
                    line: o.line,
                    column: o.column,
                })
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "find_occurrences failed; using position index");
                doc_state
                    .as_ref()
                    .map(|s| s.positions_of(&word).to_vec())
                    .unwrap_or_default()
            }
        };
        if positions.is_empty() {
            return Ok(None);
        }

        let edits: Vec<TextEdit> = positions
            .iter()
            .map(|p| TextEdit {
                range: identifier_range_at(&text, *p, &word, encoding),
                new_text: new_name.clone(),
            })
            .collect();

        let mut changes = HashMap::new();
        changes.insert(uri, edits);
        Ok(Some(WorkspaceEdit {
            changes: Some(changes),
            ..Default::default()
        }))
    }

    async fn folding_range(&self, params: FoldingRangeParams) -> Result<Option<Vec<FoldingRange>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let Some((_, text, _)) = self.document(&services, &params.text_document.uri) else {
            return Ok(None);
        };
        let ranges = brace_fold_ranges(&text)
            .into_iter()
            .map(|(start_line, end_line)| FoldingRange {
                start_line,
                start_character: None,
                end_line,
                end_character: None,
                kind: Some(FoldingRangeKind::Region),
                collapsed_text: None,
            })
            .collect();
        Ok(Some(ranges))
    }

    async fn selection_range(
        &self,
        params: SelectionRangeParams,
    ) -> Result<Option<Vec<SelectionRange>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let encoding = services.encoding();
        let Some((_, text, _)) = self.document(&services, &params.text_document.uri) else {
            return Ok(None);
        };

        let last_line = text.lines().count().saturating_sub(1) as u32;
        let ranges = params
            .positions
            .into_iter()
            .map(|position| {
                let document_range = Range::new(Position::new(0, 0), Position::new(last_line + 1, 0));
                let line_len = text
                    .lines()
                    .nth(position.line as usize)
                    .map(|l| documents::byte_col_to_lsp(l, l.len(), encoding))
                    .unwrap_or(0);
                let line_range = Range::new(
                    Position::new(position.line, 0),
                    Position::new(position.line, line_len),
                );

                let document = SelectionRange {
                    range: document_range,
                    parent: None,
                };
                let line = SelectionRange {
                    range: line_range,
                    parent: Some(Box::new(document)),
                };
                match word_at_position(&text, position, encoding) {
                    Some((_, range)) => SelectionRange {
                        range,
                        parent: Some(Box::new(line)),
                    },
                    None => line,
                }
            })
            .collect();
        Ok(Some(ranges))
    }

    async fn inlay_hint(&self, params: InlayHintParams) -> Result<Option<Vec<InlayHint>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let encoding = services.encoding();
        let Some((_, text, Some(doc_state))) =
            self.document(&services, &params.text_document.uri)
        else {
            return Ok(None);
        };

        let mut flat = Vec::new();
        flatten_symbols(&doc_state.symbols, &mut flat);
        let hints = flat
            .iter()
            .filter(|s| s.kind == PikeSymbolKind::Method && !s.arg_names.is_empty())
            .filter_map(|s| {
                let range = identifier_range_at(&text, s.position, &s.name, encoding);
                if range.start == range.end {
                    return None;
                }
                Some(InlayHint {
                    position: range.end,
                    label: InlayHintLabel::String(format!(
                        "({})",
                        s.arg_names.join(", ")
                    )),
                    kind: Some(InlayHintKind::PARAMETER),
                    text_edits: None,
                    tooltip: None,
                    padding_left: Some(true),
                    padding_right: None,
                    data: None,
                })
            })
            .collect();
        Ok(Some(hints))
    }

    async fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> Result<Option<SemanticTokensResult>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let encoding = services.encoding();
        let Some((_, text, Some(doc_state))) =
            self.document(&services, &params.text_document.uri)
        else {
            return Ok(None);
        };

        let mut spans: Vec<(u32, u32, u32, u32)> = Vec::new();
        let mut flat = Vec::new();
        flatten_symbols(&doc_state.symbols, &mut flat);
        for symbol in &flat {
            let Some(token_type) = semantic_token_type(symbol.kind) else {
                continue;
            };
            for position in doc_state.positions_of(&symbol.name) {
                let range = identifier_range_at(&text, *position, &symbol.name, encoding);
                if range.start == range.end {
                    continue;
                }
                spans.push((
                    range.start.line,
                    range.start.character,
                    range.end.character - range.start.character,
                    token_type,
                ));
            }
        }
        spans.sort_unstable();
        spans.dedup_by_key(|(line, char, _, _)| (*line, *char));

        let mut data: Vec<SemanticToken> = Vec::with_capacity(spans.len());
        let (mut prev_line, mut prev_start) = (0u32, 0u32);
        for (line, start, length, token_type) in spans {
            let delta_line = line - prev_line;
            let delta_start = if delta_line == 0 {
                start - prev_start
            } else {
                start
            };
            data.push(SemanticToken {
                delta_line,
                delta_start,
                length,
                token_type,
                token_modifiers_bitset: 0,
            });
            prev_line = line;
            prev_start = start;
        }

        Ok(Some(SemanticTokensResult::Tokens(SemanticTokens {
            result_id: None,
            data,
        })))
    }

    async fn code_action(&self, params: CodeActionParams) -> Result<Option<CodeActionResponse>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document.uri;
        let Some((_, text, _)) = self.document(&services, &uri) else {
            return Ok(None);
        };

        let mut actions: Vec<CodeActionOrCommand> = Vec::new();

        if let Some(edit) = organize_imports_edit(&text) {
            let mut changes = HashMap::new();
            changes.insert(uri.clone(), vec![edit]);
            actions.push(CodeActionOrCommand::CodeAction(CodeAction {
                title: "Organize imports".to_string(),
                kind: Some(CodeActionKind::SOURCE_ORGANIZE_IMPORTS),
                edit: Some(WorkspaceEdit {
                    changes: Some(changes),
                    ..Default::default()
                }),
                ..Default::default()
            }));
        }

        // Quickfix: drop the line an "unused import" diagnostic points at.
        for diagnostic in &params.context.diagnostics {
            if !diagnostic.message.to_lowercase().contains("unused import") {
                continue;
            }
            let line = diagnostic.range.start.line;
            let delete = TextEdit {
                range: Range::new(Position::new(line, 0), Position::new(line + 1, 0)),
                new_text: String::new(),
            };
            let mut changes = HashMap::new();
            changes.insert(uri.clone(), vec![delete]);
            actions.push(CodeActionOrCommand::CodeAction(CodeAction {
                title: "Remove unused import".to_string(),
                kind: Some(CodeActionKind::QUICKFIX),
                diagnostics: Some(vec![diagnostic.clone()]),
                edit: Some(WorkspaceEdit {
                    changes: Some(changes),
                    ..Default::default()
                }),
                is_preferred: Some(true),
                ..Default::default()
            }));
        }

        Ok(Some(actions))
    }

    async fn formatting(&self, params: DocumentFormattingParams) -> Result<Option<Vec<TextEdit>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let Some((_, text, _)) = self.document(&services, &params.text_document.uri) else {
            return Ok(None);
        };
        Ok(Some(whitespace_edits(&text, None)))
    }

    async fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let Some((_, text, _)) = self.document(&services, &params.text_document.uri) else {
            return Ok(None);
        };
        Ok(Some(whitespace_edits(&text, Some(params.range))))
    }

    async fn document_link(
        &self,
        params: DocumentLinkParams,
    ) -> Result<Option<Vec<DocumentLink>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document.uri;
        let Some((_, text, _)) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let current_file = uri
            .to_file_path()
            .map(|p| p.into_owned())
            .unwrap_or_default();

        let links = {
            let state = services.state();
            include_specs(&text)
                .into_iter()
                .map(|(spec, range)| {
                    let target = state
                        .includes
                        .resolve_path(&spec, &current_file)
                        .and_then(|p| Uri::from_file_path(&p));
                    // Unresolved links carry their spec for lazy resolution
                    // through the interpreter.
                    let data = if target.is_none() {
                        Some(serde_json::json!({
                            "spec": spec,
                            "file": current_file.display().to_string(),
                        }))
                    } else {
                        None
                    };
                    DocumentLink {
                        range,
                        target,
                        tooltip: None,
                        data,
                    }
                })
                .collect()
        };
        Ok(Some(links))
    }

    async fn document_link_resolve(&self, mut link: DocumentLink) -> Result<DocumentLink> {
        let Some(services) = self.services() else {
            return Ok(link);
        };
        if link.target.is_some() {
            return Ok(link);
        }
        if let Some(data) = link.data.clone()
            && let Some(spec) = data.get("spec").and_then(Value::as_str)
            && let Some(file) = data.get("file").and_then(Value::as_str)
            && let Ok(Some(path)) = services.analyzer.resolve_include(spec, file).await
        {
            link.target = Uri::from_file_path(Path::new(&path));
        }
        Ok(link)
    }

    async fn code_lens(&self, params: CodeLensParams) -> Result<Option<Vec<CodeLens>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let encoding = services.encoding();
        let Some((_, text, Some(doc_state))) =
            self.document(&services, &params.text_document.uri)
        else {
            return Ok(None);
        };

        let lenses = doc_state
            .symbols
            .iter()
            .filter(|s| matches!(s.kind, PikeSymbolKind::Class | PikeSymbolKind::Method))
            .map(|s| {
                // Occurrences minus the declaration itself.
                let count = doc_state.positions_of(&s.name).len().saturating_sub(1);
                CodeLens {
                    range: identifier_range_at(&text, s.position, &s.name, encoding),
                    command: None,
                    data: Some(serde_json::json!({"references": count})),
                }
            })
            .collect();
        Ok(Some(lenses))
    }

    async fn code_lens_resolve(&self, mut lens: CodeLens) -> Result<CodeLens> {
        let count = lens
            .data
            .as_ref()
            .and_then(|d| d.get("references"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        lens.command = Some(Command {
            title: if count == 1 {
                "1 reference".to_string()
            } else {
                format!("{count} references")
            },
            command: String::new(),
            arguments: None,
        });
        Ok(lens)
    }

    async fn prepare_call_hierarchy(
        &self,
        params: CallHierarchyPrepareParams,
    ) -> Result<Option<Vec<CallHierarchyItem>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let encoding = services.encoding();

        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, _)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };
        let Some(symbol) = doc_state.find_symbol(&word) else {
            return Ok(None);
        };
        if symbol.kind != PikeSymbolKind::Method {
            return Ok(None);
        }

        let range = identifier_range_at(&text, symbol.position, &symbol.name, encoding);
        Ok(Some(vec![CallHierarchyItem {
            name: symbol.name.clone(),
            kind: SymbolKind::METHOD,
            tags: None,
            detail: symbol.type_name.clone(),
            uri,
            range,
            selection_range: range,
            data: None,
        }]))
    }

    async fn incoming_calls(
        &self,
        params: CallHierarchyIncomingCallsParams,
    ) -> Result<Option<Vec<CallHierarchyIncomingCall>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.item.uri.clone();
        let encoding = services.encoding();
        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };

        let callee = &params.item.name;
        let mut calls: Vec<CallHierarchyIncomingCall> = Vec::new();
        for position in doc_state.positions_of(callee) {
            let Some(caller) = enclosing_function(&doc_state.symbols, position.line) else {
                continue;
            };
            if caller.name == *callee {
                continue; // the declaration itself
            }
            let caller_range =
                identifier_range_at(&text, caller.position, &caller.name, encoding);
            calls.push(CallHierarchyIncomingCall {
                from: CallHierarchyItem {
                    name: caller.name.clone(),
                    kind: SymbolKind::METHOD,
                    tags: None,
                    detail: caller.type_name.clone(),
                    uri: uri.clone(),
                    range: caller_range,
                    selection_range: caller_range,
                    data: None,
                },
                from_ranges: vec![identifier_range_at(&text, *position, callee, encoding)],
            });
        }
        Ok(Some(calls))
    }

    async fn outgoing_calls(
        &self,
        params: CallHierarchyOutgoingCallsParams,
    ) -> Result<Option<Vec<CallHierarchyOutgoingCall>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.item.uri.clone();
        let encoding = services.encoding();
        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };

        // Identifiers inside this function's extent that name another
        // known function.
        let start_line = params.item.range.start.line + 1;
        let end_line = function_end_line(&doc_state.symbols, start_line)
            .unwrap_or(text.lines().count() as u32 + 1);

        let mut flat = Vec::new();
        flatten_symbols(&doc_state.symbols, &mut flat);
        let mut calls: Vec<CallHierarchyOutgoingCall> = Vec::new();
        for target in flat
            .iter()
            .filter(|s| s.kind == PikeSymbolKind::Method && s.name != params.item.name)
        {
            let ranges: Vec<Range> = doc_state
                .positions_of(&target.name)
                .iter()
                .filter(|p| p.line > start_line && p.line < end_line)
                .map(|p| identifier_range_at(&text, *p, &target.name, encoding))
                .collect();
            if ranges.is_empty() {
                continue;
            }
            let target_range =
                identifier_range_at(&text, target.position, &target.name, encoding);
            calls.push(CallHierarchyOutgoingCall {
                to: CallHierarchyItem {
                    name: target.name.clone(),
                    kind: SymbolKind::METHOD,
                    tags: None,
                    detail: target.type_name.clone(),
                    uri: uri.clone(),
                    range: target_range,
                    selection_range: target_range,
                    data: None,
                },
                from_ranges: ranges,
            });
        }
        Ok(Some(calls))
    }

    async fn prepare_type_hierarchy(
        &self,
        params: TypeHierarchyPrepareParams,
    ) -> Result<Option<Vec<TypeHierarchyItem>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let encoding = services.encoding();

        let Some((_, text, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };
        let Some((word, _)) = word_at_position(&text, position, encoding) else {
            return Ok(None);
        };
        let Some(symbol) = doc_state.find_symbol(&word) else {
            return Ok(None);
        };
        if symbol.kind != PikeSymbolKind::Class {
            return Ok(None);
        }

        let range = identifier_range_at(&text, symbol.position, &symbol.name, encoding);
        Ok(Some(vec![TypeHierarchyItem {
            name: symbol.name.clone(),
            kind: SymbolKind::CLASS,
            tags: None,
            detail: None,
            uri,
            range,
            selection_range: range,
            data: None,
        }]))
    }

    async fn supertypes(
        &self,
        params: TypeHierarchySupertypesParams,
    ) -> Result<Option<Vec<TypeHierarchyItem>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let uri = params.item.uri.clone();
        let Some((_, _, Some(doc_state))) = self.document(&services, &uri) else {
            return Ok(None);
        };

        let mut items: Vec<TypeHierarchyItem> = Vec::new();
        for parent in &doc_state.inherits {
            let location = self.stdlib_location(&services, parent).await;
            let (target_uri, range) = match location {
                Some(location) => (location.uri, location.range),
                None => (uri.clone(), point_range(SymbolPosition { line: 1, column: 1 })),
            };
            items.push(TypeHierarchyItem {
                name: parent.clone(),
                kind: SymbolKind::CLASS,
                tags: None,
                detail: None,
                uri: target_uri,
                range,
                selection_range: range,
                data: None,
            });
        }
        Ok(Some(items))
    }

    async fn subtypes(
        &self,
        params: TypeHierarchySubtypesParams,
    ) -> Result<Option<Vec<TypeHierarchyItem>>> {
        let Some(services) = self.services() else {
            return Ok(None);
        };
        let target = params.item.name.clone();

        // Open documents whose inherits mention the target class.
        let state = services.state();
        let mut items: Vec<TypeHierarchyItem> = Vec::new();
        for uri in state.documents.open_uris() {
            let Some(doc_state) = state.documents.state(&uri) else {
                continue;
            };
            if !doc_state.inherits.iter().any(|i| i == &target) {
                continue;
            }
            for symbol in doc_state
                .symbols
                .iter()
                .filter(|s| s.kind == PikeSymbolKind::Class)
            {
                let range = point_range(symbol.position);
                items.push(TypeHierarchyItem {
                    name: symbol.name.clone(),
                    kind: SymbolKind::CLASS,
                    tags: None,
                    detail: None,
                    uri: uri.clone(),
                    range,
                    selection_range: range,
                    data: None,
                });
            }
        }
        Ok(Some(items))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        if params.command != HEALTH_COMMAND {
            return Ok(None);
        }
        let Some(services) = self.services() else {
            return Ok(Some(Value::String(
                "pike-lsp: not initialized yet".to_string(),
            )));
        };

        let mut report = services.supervisor.health_report();
        {
            let state = services.state();
            let cache = state.compile_cache.stats();
            report.push_str(&format!(
                "compilation cache: {} entries, {} hits, {} misses, {} evictions\n",
                cache.size, cache.hits, cache.misses, cache.evictions
            ));
            let stdlib = state.stdlib.stats();
            report.push_str(&format!(
                "stdlib index: {} modules (~{} KiB), {} negative\n",
                stdlib.entries,
                stdlib.estimated_bytes / 1024,
                stdlib.negative_entries
            ));
            report.push_str(&format!(
                "workspace index: {} documents\n",
                state.symbols.document_count()
            ));
        }
        Ok(Some(Value::String(report)))
    }
}

impl Backend {
    /// Definition lookup shared by definition/declaration/implementation.
    async fn definition_of(
        &self,
        services: &Arc<Services>,
        uri: &Uri,
        position: Position,
    ) -> Option<Location> {
        let encoding = services.encoding();
        let (_, text, doc_state) = self.document(services, uri)?;

        // An include directive on this line resolves to its file.
        if let Some((spec, range)) = include_specs(&text)
            .into_iter()
            .find(|(_, r)| r.start.line == position.line)
            && position.character >= range.start.character
            && position.character <= range.end.character
        {
            let current_file = uri.to_file_path().map(|p| p.into_owned())?;
            let resolved = {
                let state = services.state();
                state.includes.resolve_path(&spec, &current_file)
            };
            let resolved = match resolved {
                Some(path) => Some(path),
                None => services
                    .analyzer
                    .resolve_include(&spec, &current_file.display().to_string())
                    .await
                    .ok()
                    .flatten()
                    .map(PathBuf::from),
            };
            if let Some(path) = resolved
                && let Some(target) = Uri::from_file_path(&path)
            {
                return Some(Location::new(
                    target,
                    Range::new(Position::new(0, 0), Position::new(0, 0)),
                ));
            }
        }

        let (word, _) = word_at_position(&text, position, encoding)?;

        // A declaration in this document.
        if let Some(doc_state) = &doc_state
            && let Some(symbol) = doc_state.find_symbol(&word)
        {
            let range = identifier_range_at(&text, symbol.position, &symbol.name, encoding);
            return Some(Location::new(uri.clone(), range));
        }

        // A declaration elsewhere in the workspace.
        {
            let state = services.state();
            let exact: Vec<(Uri, workspace::FlatSymbol)> = state
                .symbols
                .search(&word, MAX_RESULTS)
                .into_iter()
                .filter(|(_, flat)| flat.name == word)
                .collect();
            if let Some((other_uri, flat)) = exact.into_iter().next() {
                return Some(Location::new(other_uri, point_range(flat.position)));
            }
        }

        // A stdlib module (`Stdio.File` resolves through the dotted path).
        let (module_path, _) = module_path_at_position(&text, position, encoding)?;
        self.stdlib_location(services, &module_path).await
    }

    /// Location of a stdlib module's source, from the `file:line` the
    /// interpreter reports.
    async fn stdlib_location(&self, services: &Arc<Services>, module_path: &str) -> Option<Location> {
        let info = resolve_stdlib_module(services, module_path).await?;
        let file = info.file_path.clone()?;
        let uri = Uri::from_file_path(&file)?;
        let line = info.line.unwrap_or(0);
        Some(Location::new(
            uri,
            Range::new(Position::new(line, 0), Position::new(line, 0)),
        ))
    }
}

/// Resolve a stdlib module through the index: cached entry, negative-cache
/// short-circuit, or an interpreter round-trip.
async fn resolve_stdlib_module(
    services: &Arc<Services>,
    module_path: &str,
) -> Option<Arc<StdlibModuleInfo>> {
    {
        let mut state = services.state();
        if state.stdlib.is_negative(module_path) {
            return None;
        }
        if let Some(info) = state.stdlib.cached(module_path) {
            return Some(info);
        }
    }
    match services.analyzer.resolve_stdlib(module_path).await {
        Ok(Some(resolution)) => Some(services.state().stdlib.insert(module_path, resolution)),
        Ok(None) => {
            services.state().stdlib.insert_negative(module_path);
            None
        }
        Err(e) => {
            tracing::debug!(module_path, error = %e, "stdlib resolution failed");
            None
        }
    }
}

/// Completions contributed by the document's `#include`s: each resolved
/// include's symbol set, pre-parsed and cached with a short TTL.
async fn include_completion_items(
    services: &Arc<Services>,
    uri: &Uri,
    doc_state: &DocumentState,
) -> Vec<CompletionItem> {
    let Some(deps) = &doc_state.dependencies else {
        return Vec::new();
    };
    let Some(current_file) = uri.to_file_path().map(|p| p.into_owned()) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for spec in &deps.includes {
        let resolved = {
            let state = services.state();
            state.includes.resolve_path(spec, &current_file)
        };
        let Some(path) = resolved else { continue };

        let cached = {
            let state = services.state();
            state.includes.cached_symbols(&path)
        };
        if let Some(symbols) = cached {
            items.extend(symbols.iter().map(symbol_completion_item));
            continue;
        }

        let Ok(code) = std::fs::read_to_string(&path) else {
            continue;
        };
        let filename = path.display().to_string();
        match services
            .analyzer
            .analyze(&code, &filename, &[AnalysisKind::Parse], None)
            .await
        {
            Ok(outcome) => {
                let symbols = outcome
                    .parse
                    .ok()
                    .map(|p| p.symbols.clone())
                    .unwrap_or_default();
                items.extend(symbols.iter().map(symbol_completion_item));
                services.state().includes.store_symbols(path, symbols);
            }
            Err(e) => {
                tracing::debug!(include = %filename, error = %e, "include pre-parse failed");
            }
        }
    }
    items
}

/// Walk the workspace and feed the symbol index in chunked batch requests.
async fn build_workspace_index(services: Arc<Services>, client: Client, root: PathBuf) {
    let (files, warnings) = workspace::discover_pike_files(&root);
    for warning in warnings {
        client
            .log_message(MessageType::WARNING, format!("pike-lsp: {warning}"))
            .await;
    }
    if files.is_empty() {
        return;
    }

    let mut indexed = 0usize;
    for chunk in files.chunks(INDEX_CHUNK) {
        let mut batch: Vec<(String, String)> = Vec::with_capacity(chunk.len());
        for path in chunk {
            match std::fs::read_to_string(path) {
                Ok(code) => batch.push((path.display().to_string(), code)),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable file")
                }
            }
        }
        match services.analyzer.batch_parse(&batch).await {
            Ok(results) => {
                let mut state = services.state();
                for (filename, output) in results {
                    let Some(uri) = Uri::from_file_path(Path::new(&filename)) else {
                        continue;
                    };
                    state.symbols.index_document(uri, &output.symbols);
                    indexed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "workspace index batch failed");
                return;
            }
        }
        // Chunking keeps individual requests small; yield between them.
        tokio::task::yield_now().await;
    }

    client
        .log_message(
            MessageType::INFO,
            format!("pike-lsp: indexed {indexed} workspace files"),
        )
        .await;
}

fn server_capabilities(position_encoding: PositionEncodingKind) -> ServerCapabilities {
    ServerCapabilities {
        position_encoding: Some(position_encoding),
        text_document_sync: Some(TextDocumentSyncCapability::Options(
            TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                ..Default::default()
            },
        )),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        completion_provider: Some(CompletionOptions {
            resolve_provider: Some(true),
            trigger_characters: Some(vec![
                ".".to_string(),
                ":".to_string(),
                ">".to_string(),
                "-".to_string(),
            ]),
            ..Default::default()
        }),
        signature_help_provider: Some(SignatureHelpOptions {
            trigger_characters: Some(vec!["(".to_string(), ",".to_string()]),
            retrigger_characters: None,
            work_done_progress_options: Default::default(),
        }),
        definition_provider: Some(OneOf::Left(true)),
        declaration_provider: Some(DeclarationCapability::Simple(true)),
        type_definition_provider: Some(TypeDefinitionProviderCapability::Simple(true)),
        implementation_provider: Some(ImplementationProviderCapability::Simple(true)),
        references_provider: Some(OneOf::Left(true)),
        document_highlight_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        workspace_symbol_provider: Some(OneOf::Left(true)),
        code_action_provider: Some(CodeActionProviderCapability::Options(CodeActionOptions {
            code_action_kinds: Some(vec![
                CodeActionKind::QUICKFIX,
                CodeActionKind::SOURCE_ORGANIZE_IMPORTS,
            ]),
            resolve_provider: Some(false),
            work_done_progress_options: Default::default(),
        })),
        code_lens_provider: Some(CodeLensOptions {
            resolve_provider: Some(true),
        }),
        document_link_provider: Some(DocumentLinkOptions {
            resolve_provider: Some(true),
            work_done_progress_options: Default::default(),
        }),
        document_formatting_provider: Some(OneOf::Left(true)),
        document_range_formatting_provider: Some(OneOf::Left(true)),
        rename_provider: Some(OneOf::Right(RenameOptions {
            prepare_provider: Some(true),
            work_done_progress_options: Default::default(),
        })),
        folding_range_provider: Some(FoldingRangeProviderCapability::Simple(true)),
        selection_range_provider: Some(SelectionRangeProviderCapability::Simple(true)),
        inlay_hint_provider: Some(OneOf::Left(true)),
        semantic_tokens_provider: Some(
            SemanticTokensServerCapabilities::SemanticTokensOptions(SemanticTokensOptions {
                legend: SemanticTokensLegend {
                    token_types: vec![
                        SemanticTokenType::NAMESPACE,
                        SemanticTokenType::CLASS,
                        SemanticTokenType::FUNCTION,
                        SemanticTokenType::VARIABLE,
                        SemanticTokenType::ENUM_MEMBER,
                        SemanticTokenType::TYPE,
                        SemanticTokenType::MACRO,
                    ],
                    token_modifiers: vec![],
                },
                full: Some(SemanticTokensFullOptions::Bool(true)),
                range: Some(false),
                work_done_progress_options: Default::default(),
            }),
        ),
        call_hierarchy_provider: Some(CallHierarchyServerCapability::Simple(true)),
        execute_command_provider: Some(ExecuteCommandOptions {
            commands: vec![HEALTH_COMMAND.to_string()],
            work_done_progress_options: Default::default(),
        }),
        ..Default::default()
    }
}

fn to_lsp_symbol_kind(kind: PikeSymbolKind) -> SymbolKind {
    match kind {
        PikeSymbolKind::Class => SymbolKind::CLASS,
        PikeSymbolKind::Method => SymbolKind::METHOD,
        PikeSymbolKind::Variable => SymbolKind::VARIABLE,
        PikeSymbolKind::Constant => SymbolKind::CONSTANT,
        PikeSymbolKind::Enum => SymbolKind::ENUM,
        PikeSymbolKind::EnumConstant => SymbolKind::ENUM_MEMBER,
        PikeSymbolKind::Typedef => SymbolKind::STRUCT,
        PikeSymbolKind::Inherit => SymbolKind::INTERFACE,
        PikeSymbolKind::Import => SymbolKind::MODULE,
        PikeSymbolKind::Include => SymbolKind::FILE,
        PikeSymbolKind::Module => SymbolKind::MODULE,
    }
}

/// Semantic-token legend index for a symbol kind; identifiers without a
/// sensible token class are skipped.
fn semantic_token_type(kind: PikeSymbolKind) -> Option<u32> {
    match kind {
        PikeSymbolKind::Module | PikeSymbolKind::Import => Some(0), // namespace
        PikeSymbolKind::Class | PikeSymbolKind::Inherit => Some(1), // class
        PikeSymbolKind::Method => Some(2),                          // function
        PikeSymbolKind::Variable => Some(3),                        // variable
        PikeSymbolKind::EnumConstant => Some(4),                    // enumMember
        PikeSymbolKind::Enum | PikeSymbolKind::Typedef => Some(5),  // type
        PikeSymbolKind::Constant => Some(6),                        // macro
        PikeSymbolKind::Include => None,
    }
}

#[allow(deprecated)]
fn to_document_symbol(symbol: &PikeSymbol, text: &str, encoding: NegotiatedEncoding) -> DocumentSymbol {
    let range = identifier_range_at(text, symbol.position, &symbol.name, encoding);
    DocumentSymbol {
        name: symbol.name.clone(),
        detail: symbol.type_name.clone(),
        kind: to_lsp_symbol_kind(symbol.kind),
        tags: None,
        deprecated: None,
        range,
        selection_range: range,
        children: if symbol.children.is_empty() {
            None
        } else {
            Some(
                symbol
                    .children
                    .iter()
                    .map(|c| to_document_symbol(c, text, encoding))
                    .collect(),
            )
        },
    }
}

fn flatten_symbols<'a>(symbols: &'a [PikeSymbol], out: &mut Vec<&'a PikeSymbol>) {
    for symbol in symbols {
        out.push(symbol);
        flatten_symbols(&symbol.children, out);
    }
}

fn point_range(position: SymbolPosition) -> Range {
    let p = Position::new(
        position.line.saturating_sub(1),
        position.column.saturating_sub(1),
    );
    Range::new(p, p)
}

fn symbol_completion_item(symbol: &PikeSymbol) -> CompletionItem {
    let kind = match symbol.kind {
        PikeSymbolKind::Class => CompletionItemKind::CLASS,
        PikeSymbolKind::Method => CompletionItemKind::METHOD,
        PikeSymbolKind::Variable => CompletionItemKind::VARIABLE,
        PikeSymbolKind::Constant => CompletionItemKind::CONSTANT,
        PikeSymbolKind::Enum | PikeSymbolKind::EnumConstant => CompletionItemKind::ENUM_MEMBER,
        PikeSymbolKind::Typedef => CompletionItemKind::STRUCT,
        PikeSymbolKind::Module | PikeSymbolKind::Import => CompletionItemKind::MODULE,
        PikeSymbolKind::Inherit | PikeSymbolKind::Include => CompletionItemKind::REFERENCE,
    };
    CompletionItem {
        label: symbol.name.clone(),
        kind: Some(kind),
        detail: symbol.type_name.clone(),
        ..Default::default()
    }
}

fn stdlib_completion_item(module: &str, symbol: &PikeSymbol) -> CompletionItem {
    let mut item = symbol_completion_item(symbol);
    item.data = Some(serde_json::json!({"module": module, "name": symbol.name}));
    item
}

fn symbol_hover_markdown(symbol: &PikeSymbol) -> String {
    let mut signature = String::new();
    if !symbol.modifiers.is_empty() {
        signature.push_str(&symbol.modifiers.join(" "));
        signature.push(' ');
    }
    if let Some(type_name) = &symbol.type_name {
        signature.push_str(type_name);
        signature.push(' ');
    }
    signature.push_str(&symbol.name);
    if symbol.kind == PikeSymbolKind::Method {
        signature.push_str(&format!("({})", symbol.arg_names.join(", ")));
    }

    let mut value = format!("```pike\n{signature}\n```");
    if let Some(classname) = &symbol.classname {
        value.push_str(&format!("\n\nMember of `{classname}`"));
    }
    value
}

fn stdlib_hover_markdown(info: &StdlibModuleInfo) -> String {
    let mut value = format!("```pike\nmodule {}\n```", info.module_path);
    if !info.inherits.is_empty() {
        value.push_str(&format!("\n\nInherits: {}", info.inherits.join(", ")));
    }
    if let Some(file) = &info.file_path {
        value.push_str(&format!("\n\nDefined in `{}`", file.display()));
    }
    value
}

/// Convert an LSP character offset back to a 1-based byte column for the
/// child protocol.
fn lsp_character_to_column(text: &str, position: Position, encoding: NegotiatedEncoding) -> u32 {
    let line = text.lines().nth(position.line as usize).unwrap_or("");
    let byte = documents::offset_of_position(line, Position::new(0, position.character), encoding);
    byte as u32 + 1
}

/// Identifier immediately before the innermost unclosed `(`, plus the
/// 0-based index of the argument the cursor is in.
fn enclosing_call(
    text: &str,
    position: Position,
    encoding: NegotiatedEncoding,
) -> Option<(String, u32)> {
    let line = text.lines().nth(position.line as usize)?;
    let cursor = documents::offset_of_position(line, Position::new(0, position.character), encoding);
    let bytes = &line.as_bytes()[..cursor.min(line.len())];

    // Innermost unclosed paren before the cursor.
    let mut open_parens: Vec<usize> = Vec::new();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'(' => open_parens.push(i),
            b')' => {
                open_parens.pop();
            }
            _ => {}
        }
    }
    let open_at = *open_parens.last()?;

    let mut commas = 0u32;
    let mut inner = 0i32;
    for b in &bytes[open_at + 1..] {
        match b {
            b'(' => inner += 1,
            b')' => inner -= 1,
            b',' if inner == 0 => commas += 1,
            _ => {}
        }
    }

    let mut end = open_at;
    while end > 0 && bytes[end - 1] == b' ' {
        end -= 1;
    }
    let mut start = end;
    while start > 0 && (bytes[start - 1] == b'_' || bytes[start - 1].is_ascii_alphanumeric()) {
        start -= 1;
    }
    if start == end {
        return None;
    }
    Some((line[start..end].to_string(), commas))
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Brace-matched folding ranges, string- and comment-aware just enough not
/// to fold inside literals.
fn brace_fold_ranges(text: &str) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut stack: Vec<u32> = Vec::new();
    let mut in_string = false;
    let mut in_block_comment = false;

    for (line_idx, line) in text.lines().enumerate() {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if in_block_comment {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    in_block_comment = false;
                    i += 1;
                }
            } else if in_string {
                if b == b'\\' {
                    i += 1;
                } else if b == b'"' {
                    in_string = false;
                }
            } else {
                match b {
                    b'"' => in_string = true,
                    b'/' if bytes.get(i + 1) == Some(&b'/') => break,
                    b'/' if bytes.get(i + 1) == Some(&b'*') => {
                        in_block_comment = true;
                        i += 1;
                    }
                    b'{' => stack.push(line_idx as u32),
                    b'}' => {
                        if let Some(start) = stack.pop()
                            && (line_idx as u32) > start
                        {
                            ranges.push((start, line_idx as u32 - 1));
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        // Strings don't span lines in this scanner.
        in_string = false;
    }
    ranges.sort_unstable();
    ranges
}

/// `#include "spec"` occurrences with the range of the quoted spec.
fn include_specs(text: &str) -> Vec<(String, Range)> {
    let mut out = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("#include") {
            continue;
        }
        let Some(open) = line.find('"') else { continue };
        let Some(close_rel) = line[open + 1..].find('"') else {
            continue;
        };
        let spec = &line[open + 1..open + 1 + close_rel];
        out.push((
            spec.to_string(),
            Range::new(
                Position::new(line_idx as u32, open as u32 + 1),
                Position::new(line_idx as u32, (open + 1 + close_rel) as u32),
            ),
        ));
    }
    out
}

/// Sort the document's contiguous `import` block, if sorting changes it.
fn organize_imports_edit(text: &str) -> Option<TextEdit> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim_start().starts_with("import "))?;
    let mut end = start;
    while end < lines.len() && lines[end].trim_start().starts_with("import ") {
        end += 1;
    }

    let mut sorted: Vec<&str> = lines[start..end].to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted == lines[start..end] {
        return None;
    }

    let mut new_text = sorted.join("\n");
    new_text.push('\n');
    Some(TextEdit {
        range: Range::new(
            Position::new(start as u32, 0),
            Position::new(end as u32, 0),
        ),
        new_text,
    })
}

/// Trailing-whitespace and final-newline normalization. Whole document, or
/// only lines intersecting `range`.
fn whitespace_edits(text: &str, range: Option<Range>) -> Vec<TextEdit> {
    let mut edits = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        if let Some(range) = range
            && ((line_idx as u32) < range.start.line || (line_idx as u32) > range.end.line)
        {
            continue;
        }
        let trimmed_len = line.trim_end().len();
        if trimmed_len < line.len() {
            edits.push(TextEdit {
                range: Range::new(
                    Position::new(line_idx as u32, trimmed_len as u32),
                    Position::new(line_idx as u32, line.len() as u32),
                ),
                new_text: String::new(),
            });
        }
    }
    if range.is_none() && !text.is_empty() && !text.ends_with('\n') {
        let last_line = text.lines().count().saturating_sub(1) as u32;
        let last_len = text.lines().last().map(str::len).unwrap_or(0) as u32;
        edits.push(TextEdit {
            range: Range::new(
                Position::new(last_line, last_len),
                Position::new(last_line, last_len),
            ),
            new_text: "\n".to_string(),
        });
    }
    edits
}

/// The function whose declaration most closely precedes `line` (1-based).
fn enclosing_function(symbols: &[PikeSymbol], line: u32) -> Option<&PikeSymbol> {
    let mut flat = Vec::new();
    flatten_symbols(symbols, &mut flat);
    flat.into_iter()
        .filter(|s| s.kind == PikeSymbolKind::Method && s.position.line <= line)
        .max_by_key(|s| s.position.line)
}

/// First method declaration line after `line`, bounding a function's extent.
fn function_end_line(symbols: &[PikeSymbol], line: u32) -> Option<u32> {
    let mut flat = Vec::new();
    flatten_symbols(symbols, &mut flat);
    flat.into_iter()
        .filter(|s| s.kind == PikeSymbolKind::Method && s.position.line > line)
        .map(|s| s.position.line)
        .min()
}

/// Start the LSP server over stdio.
pub async fn run_server(launch: LaunchOptions) {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) =
        LspService::new(move |client| Backend::with_launch(client, launch.clone()));
    Server::new(stdin, stdout, socket).serve(service).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enclosing_call_tracks_argument_index() {
        let line = "  write(format_entry(name, 2), count";
        let text = line.to_string();
        let (callee, arg) = enclosing_call(
            &text,
            Position::new(0, line.len() as u32),
            NegotiatedEncoding::Utf8,
        )
        .unwrap();
        assert_eq!(callee, "write");
        assert_eq!(arg, 1);
    }

    #[test]
    fn enclosing_call_ignores_closed_calls() {
        let text = "  write(x);".to_string();
        assert!(enclosing_call(&text, Position::new(0, 11), NegotiatedEncoding::Utf8).is_none());
    }

    #[test]
    fn include_specs_capture_the_quoted_range() {
        let text = "#include \"defs.h\"\nint x;\n#include \"lib/more.h\"\n";
        let specs = include_specs(text);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].0, "defs.h");
        assert_eq!(specs[0].1.start, Position::new(0, 10));
        assert_eq!(specs[0].1.end, Position::new(0, 16));
        assert_eq!(specs[1].0, "lib/more.h");
    }

    #[test]
    fn brace_folding_skips_strings_and_comments() {
        let text = "class A {\n  void f() {\n    write(\"{\");\n    // {\n  }\n}\n";
        let ranges = brace_fold_ranges(text);
        assert_eq!(ranges, vec![(0, 4), (1, 3)]);
    }

    #[test]
    fn organize_imports_sorts_the_block() {
        let text = "import Stdio;\nimport Array;\n\nint main() { return 0; }\n";
        let edit = organize_imports_edit(text).unwrap();
        assert_eq!(edit.new_text, "import Array;\nimport Stdio;\n");
        assert_eq!(edit.range.start.line, 0);
        assert_eq!(edit.range.end.line, 2);

        let sorted = "import Array;\nimport Stdio;\n";
        assert!(organize_imports_edit(sorted).is_none());
    }

    #[test]
    fn whitespace_edits_trim_and_terminate() {
        let text = "int x;   \nint y;";
        let edits = whitespace_edits(text, None);
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].range.start, Position::new(0, 6));
        assert_eq!(edits[1].new_text, "\n");
    }

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("new_name"));
        assert!(is_valid_identifier("_private"));
        assert!(!is_valid_identifier("9lives"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier(""));
    }
}
