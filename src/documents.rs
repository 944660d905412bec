use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tower_lsp_server::ls_types::{Position, Range, TextDocumentContentChangeEvent, Uri};

use crate::analysis::{DocumentDependencies, PikeDiagnostic, PikeSymbol, SymbolPosition};

/// Negotiated position encoding for LSP positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedEncoding {
    Utf8,
    Utf16,
}

/// An open document's text as the editor sees it.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub version: i32,
    pub text: String,
}

/// Analysis state for one URI, replaced atomically after each successful
/// validation.
#[derive(Debug)]
pub struct DocumentState {
    pub version: i32,
    pub symbols: Vec<PikeSymbol>,
    pub diagnostics: Vec<PikeDiagnostic>,
    /// name → every position it appears at (declarations and uses),
    /// 1-based, built from parsed symbols plus a lexical identifier sweep.
    pub symbol_positions: HashMap<String, Vec<SymbolPosition>>,
    pub dependencies: Option<DocumentDependencies>,
    pub inherits: Vec<String>,
    pub content_hash: String,
}

impl DocumentState {
    pub fn new(
        version: i32,
        text: &str,
        symbols: Vec<PikeSymbol>,
        diagnostics: Vec<PikeDiagnostic>,
        dependencies: Option<DocumentDependencies>,
        inherits: Vec<String>,
    ) -> Self {
        let mut symbol_positions: HashMap<String, Vec<SymbolPosition>> = HashMap::new();
        collect_symbol_positions(&symbols, &mut symbol_positions);
        for (name, line, column) in identifier_sweep(text) {
            let positions = symbol_positions.entry(name).or_default();
            let position = SymbolPosition { line, column };
            if !positions.contains(&position) {
                positions.push(position);
            }
        }
        Self {
            version,
            symbols,
            diagnostics,
            symbol_positions,
            dependencies,
            inherits,
            content_hash: content_hash(text),
        }
    }

    /// All positions of `name`, 1-based.
    pub fn positions_of(&self, name: &str) -> &[SymbolPosition] {
        self.symbol_positions
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Depth-first lookup of a declared symbol by name.
    pub fn find_symbol(&self, name: &str) -> Option<&PikeSymbol> {
        find_in(&self.symbols, name)
    }
}

fn find_in<'a>(symbols: &'a [PikeSymbol], name: &str) -> Option<&'a PikeSymbol> {
    for symbol in symbols {
        if symbol.name == name {
            return Some(symbol);
        }
        if let Some(found) = find_in(&symbol.children, name) {
            return Some(found);
        }
    }
    None
}

fn collect_symbol_positions(
    symbols: &[PikeSymbol],
    out: &mut HashMap<String, Vec<SymbolPosition>>,
) {
    for symbol in symbols {
        out.entry(symbol.name.clone())
            .or_default()
            .push(symbol.position);
        collect_symbol_positions(&symbol.children, out);
    }
}

/// SHA-256 hex digest of the document text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lexical sweep over the text yielding `(identifier, line, column)`,
/// 1-based. Purely lexical: the child owns real Pike analysis, this only
/// feeds the O(1) position index.
pub fn identifier_sweep(text: &str) -> Vec<(String, u32, u32)> {
    let mut out = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'_' || b.is_ascii_alphabetic() {
                let start = i;
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                out.push((
                    line[start..i].to_string(),
                    line_idx as u32 + 1,
                    start as u32 + 1,
                ));
            } else {
                i += 1;
            }
        }
    }
    out
}

/// Per-URI document text and analysis state.
///
/// Text mutations come from the LSP sync handlers; analysis states come
/// only from the debounced validator. An analysis state is replaced
/// atomically, and never by a result older than what is already stored.
#[derive(Default)]
pub struct DocumentStore {
    open: HashMap<Uri, OpenDocument>,
    states: HashMap<Uri, Arc<DocumentState>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, uri: Uri, version: i32, text: String) {
        self.open.insert(uri, OpenDocument { version, text });
    }

    /// Apply `textDocument/didChange` content changes (incremental or full).
    pub fn change(
        &mut self,
        uri: &Uri,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
        encoding: NegotiatedEncoding,
    ) {
        let Some(doc) = self.open.get_mut(uri) else {
            return;
        };
        for change in changes {
            match change.range {
                Some(range) => apply_incremental(&mut doc.text, range, &change.text, encoding),
                None => doc.text = change.text,
            }
        }
        doc.version = version;
    }

    pub fn close(&mut self, uri: &Uri) {
        self.open.remove(uri);
        self.states.remove(uri);
    }

    pub fn snapshot(&self, uri: &Uri) -> Option<(i32, String)> {
        self.open.get(uri).map(|d| (d.version, d.text.clone()))
    }

    pub fn version(&self, uri: &Uri) -> Option<i32> {
        self.open.get(uri).map(|d| d.version)
    }

    pub fn open_uris(&self) -> Vec<Uri> {
        self.open.keys().cloned().collect()
    }

    pub fn is_open(&self, uri: &Uri) -> bool {
        self.open.contains_key(uri)
    }

    /// Install a new analysis state. Rejected (returning false) when a newer
    /// state is already present; overlapping analyses resolve by version.
    pub fn store_state(&mut self, uri: Uri, state: DocumentState) -> bool {
        if let Some(existing) = self.states.get(&uri)
            && existing.version > state.version
        {
            return false;
        }
        self.states.insert(uri, Arc::new(state));
        true
    }

    pub fn state(&self, uri: &Uri) -> Option<Arc<DocumentState>> {
        self.states.get(uri).cloned()
    }
}

/// Byte offset of an LSP position within `text`, honoring the negotiated
/// encoding. Clamps past-end positions to the end of the line/text.
pub fn offset_of_position(text: &str, position: Position, encoding: NegotiatedEncoding) -> usize {
    let mut offset = 0;
    for (line_idx, line) in text.split_inclusive('\n').enumerate() {
        if line_idx as u32 == position.line {
            let content = line.strip_suffix('\n').unwrap_or(line);
            let column = match encoding {
                NegotiatedEncoding::Utf8 => (position.character as usize).min(content.len()),
                NegotiatedEncoding::Utf16 => {
                    let mut units = 0usize;
                    let mut byte = content.len();
                    for (i, c) in content.char_indices() {
                        if units >= position.character as usize {
                            byte = i;
                            break;
                        }
                        units += c.len_utf16();
                    }
                    byte
                }
            };
            return offset + column;
        }
        offset += line.len();
    }
    text.len()
}

fn apply_incremental(
    text: &mut String,
    range: Range,
    replacement: &str,
    encoding: NegotiatedEncoding,
) {
    let start = offset_of_position(text, range.start, encoding);
    let end = offset_of_position(text, range.end, encoding).max(start);
    text.replace_range(start..end, replacement);
}

/// Convert a byte column offset to an LSP character offset using the
/// negotiated encoding.
pub fn byte_col_to_lsp(line: &str, byte_col: usize, encoding: NegotiatedEncoding) -> u32 {
    let safe_col = byte_col.min(line.len());
    match encoding {
        NegotiatedEncoding::Utf8 => safe_col as u32,
        NegotiatedEncoding::Utf16 => line[..safe_col].encode_utf16().count() as u32,
    }
}

/// Convert a 1-based Pike position to a 0-based LSP position.
pub fn to_lsp_position(
    text: &str,
    position: SymbolPosition,
    encoding: NegotiatedEncoding,
) -> Position {
    let line_idx = position.line.saturating_sub(1);
    let line = text.lines().nth(line_idx as usize).unwrap_or("");
    let byte_col = position.column.saturating_sub(1) as usize;
    Position::new(line_idx, byte_col_to_lsp(line, byte_col, encoding))
}

/// The LSP range of the identifier starting at a 1-based Pike position;
/// collapses to a point when no identifier starts there.
pub fn identifier_range_at(
    text: &str,
    position: SymbolPosition,
    name: &str,
    encoding: NegotiatedEncoding,
) -> Range {
    let start = to_lsp_position(text, position, encoding);
    let line = text.lines().nth(start.line as usize).unwrap_or("");
    let byte_col = position.column.saturating_sub(1) as usize;
    let matches_name = line
        .get(byte_col..)
        .is_some_and(|rest| rest.starts_with(name));
    let end = if matches_name {
        Position::new(
            start.line,
            byte_col_to_lsp(line, byte_col + name.len(), encoding),
        )
    } else {
        start
    };
    Range::new(start, end)
}

/// The identifier under an LSP position, with its range on that line.
pub fn word_at_position(
    text: &str,
    position: Position,
    encoding: NegotiatedEncoding,
) -> Option<(String, Range)> {
    let line = text.lines().nth(position.line as usize)?;
    let byte_col = offset_of_position(line, Position::new(0, position.character), encoding);
    let bytes = line.as_bytes();

    let is_word = |b: u8| b == b'_' || b.is_ascii_alphanumeric();
    if byte_col >= bytes.len() || !is_word(bytes[byte_col]) {
        return None;
    }
    let mut start = byte_col;
    while start > 0 && is_word(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = byte_col;
    while end < bytes.len() && is_word(bytes[end]) {
        end += 1;
    }
    // Identifiers never start with a digit.
    if bytes[start].is_ascii_digit() {
        return None;
    }

    let to_char = |byte: usize| match encoding {
        NegotiatedEncoding::Utf8 => byte as u32,
        NegotiatedEncoding::Utf16 => line[..byte].encode_utf16().count() as u32,
    };
    let range = Range::new(
        Position::new(position.line, to_char(start)),
        Position::new(position.line, to_char(end)),
    );
    Some((line[start..end].to_string(), range))
}

/// The dotted module path ending at the word under the cursor, e.g.
/// `Stdio.File` when hovering `File` in `Stdio.File()`. Falls back to the
/// bare word.
pub fn module_path_at_position(
    text: &str,
    position: Position,
    encoding: NegotiatedEncoding,
) -> Option<(String, Range)> {
    let (word, range) = word_at_position(text, position, encoding)?;
    let line = text.lines().nth(position.line as usize)?;
    let word_start = offset_of_position(line, Position::new(0, range.start.character), encoding);

    let bytes = line.as_bytes();
    let mut start = word_start;
    while start >= 2
        && bytes[start - 1] == b'.'
        && (bytes[start - 2] == b'_' || bytes[start - 2].is_ascii_alphanumeric())
    {
        start -= 2;
        while start > 0 && (bytes[start - 1] == b'_' || bytes[start - 1].is_ascii_alphanumeric()) {
            start -= 1;
        }
    }
    if start == word_start {
        return Some((word, range));
    }
    let mut end = word_start;
    while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric()) {
        end += 1;
    }
    Some((line[start..end].to_string(), range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PikeSymbolKind;
    use std::str::FromStr;

    fn uri() -> Uri {
        Uri::from_str("file:///w/test.pike").unwrap()
    }

    fn symbol(name: &str, line: u32, column: u32) -> PikeSymbol {
        PikeSymbol {
            name: name.into(),
            kind: PikeSymbolKind::Method,
            position: SymbolPosition { line, column },
            children: Vec::new(),
            type_name: None,
            modifiers: Vec::new(),
            classname: None,
            arg_names: Vec::new(),
        }
    }

    #[test]
    fn full_change_replaces_text() {
        let mut store = DocumentStore::new();
        store.open(uri(), 1, "int a;".into());
        store.change(
            &uri(),
            2,
            vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: "int b;".into(),
            }],
            NegotiatedEncoding::Utf16,
        );
        assert_eq!(store.snapshot(&uri()), Some((2, "int b;".into())));
    }

    #[test]
    fn incremental_change_applies_range() {
        let mut store = DocumentStore::new();
        store.open(uri(), 1, "int alpha;\nint beta;\n".into());
        // Replace "beta" on line 1.
        store.change(
            &uri(),
            2,
            vec![TextDocumentContentChangeEvent {
                range: Some(Range::new(Position::new(1, 4), Position::new(1, 8))),
                range_length: None,
                text: "gamma".into(),
            }],
            NegotiatedEncoding::Utf16,
        );
        assert_eq!(
            store.snapshot(&uri()).unwrap().1,
            "int alpha;\nint gamma;\n"
        );
    }

    #[test]
    fn stale_state_is_rejected() {
        let mut store = DocumentStore::new();
        store.open(uri(), 5, "int x;".into());

        let newer = DocumentState::new(5, "int x;", vec![], vec![], None, vec![]);
        assert!(store.store_state(uri(), newer));

        // A slower analysis of an older version must not clobber it.
        let stale = DocumentState::new(3, "int y;", vec![], vec![], None, vec![]);
        assert!(!store.store_state(uri(), stale));
        assert_eq!(store.state(&uri()).unwrap().version, 5);
    }

    #[test]
    fn position_index_merges_symbols_and_sweep() {
        let text = "void helper() {\n}\nvoid run() {\n  helper();\n}\n";
        let state = DocumentState::new(
            1,
            text,
            vec![symbol("helper", 1, 6), symbol("run", 3, 6)],
            vec![],
            None,
            vec![],
        );
        let positions = state.positions_of("helper");
        // Declaration (from symbols) plus the call site (from the sweep).
        assert!(positions.contains(&SymbolPosition { line: 1, column: 6 }));
        assert!(positions.contains(&SymbolPosition { line: 4, column: 3 }));
    }

    #[test]
    fn content_hash_tracks_text() {
        let a = DocumentState::new(1, "int x;", vec![], vec![], None, vec![]);
        let b = DocumentState::new(1, "int x;", vec![], vec![], None, vec![]);
        let c = DocumentState::new(1, "int y;", vec![], vec![], None, vec![]);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn word_at_position_finds_identifier() {
        let text = "mapping config = ([]);\n";
        let (word, range) =
            word_at_position(text, Position::new(0, 9), NegotiatedEncoding::Utf16).unwrap();
        assert_eq!(word, "config");
        assert_eq!(range.start.character, 8);
        assert_eq!(range.end.character, 14);

        assert!(word_at_position(text, Position::new(0, 21), NegotiatedEncoding::Utf16).is_none());
    }

    #[test]
    fn module_path_extends_across_dots() {
        let text = "Stdio.File f = Stdio.File();\n";
        let (path, _) =
            module_path_at_position(text, Position::new(0, 7), NegotiatedEncoding::Utf16).unwrap();
        assert_eq!(path, "Stdio.File");
    }

    #[test]
    fn sweep_is_one_based() {
        let occurrences = identifier_sweep("int x;\n  foo();");
        assert!(occurrences.contains(&("int".to_string(), 1, 1)));
        assert!(occurrences.contains(&("x".to_string(), 1, 5)));
        assert!(occurrences.contains(&("foo".to_string(), 2, 3)));
    }
}
