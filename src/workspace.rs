use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tower_lsp_server::ls_types::Uri;

use crate::analysis::{PikeSymbol, PikeSymbolKind, SymbolPosition};

/// Cap on results returned by a workspace symbol query.
pub const MAX_RESULTS: usize = 256;

/// Directories never worth walking for Pike sources.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "build", "dist", "out", "target"];

/// A symbol flattened out of its document, container recorded.
#[derive(Debug, Clone)]
pub struct FlatSymbol {
    pub name: String,
    pub kind: PikeSymbolKind,
    pub container: Option<String>,
    pub position: SymbolPosition,
}

/// Cross-file symbol lookup.
///
/// Nested map (lowercased name → uri → entries) so re-indexing a document
/// removes its prior entries in O(names-in-document), and a name query only
/// touches files containing that name.
#[derive(Default)]
pub struct WorkspaceSymbolIndex {
    by_name: HashMap<String, HashMap<Uri, Vec<FlatSymbol>>>,
    names_by_uri: HashMap<Uri, Vec<String>>,
}

impl WorkspaceSymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a document's contribution with freshly parsed symbols,
    /// class members included.
    pub fn index_document(&mut self, uri: Uri, symbols: &[PikeSymbol]) {
        self.remove_document(&uri);

        let mut flat: Vec<FlatSymbol> = Vec::new();
        flatten(symbols, None, &mut flat);

        let mut names: Vec<String> = Vec::new();
        for symbol in flat {
            let key = symbol.name.to_lowercase();
            if !names.contains(&key) {
                names.push(key.clone());
            }
            self.by_name
                .entry(key)
                .or_default()
                .entry(uri.clone())
                .or_default()
                .push(symbol);
        }
        if !names.is_empty() {
            self.names_by_uri.insert(uri, names);
        }
    }

    pub fn remove_document(&mut self, uri: &Uri) {
        let Some(names) = self.names_by_uri.remove(uri) else {
            return;
        };
        for name in names {
            if let Some(per_uri) = self.by_name.get_mut(&name) {
                per_uri.remove(uri);
                if per_uri.is_empty() {
                    self.by_name.remove(&name);
                }
            }
        }
    }

    /// Case-insensitive prefix-or-substring search, prefix matches first,
    /// capped at `limit`.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(Uri, FlatSymbol)> {
        let needle = query.to_lowercase();
        let mut prefix_hits: Vec<(Uri, FlatSymbol)> = Vec::new();
        let mut substring_hits: Vec<(Uri, FlatSymbol)> = Vec::new();

        let mut names: Vec<&String> = self
            .by_name
            .keys()
            .filter(|name| needle.is_empty() || name.contains(&needle))
            .collect();
        names.sort();

        for name in names {
            let bucket = if name.starts_with(&needle) {
                &mut prefix_hits
            } else {
                &mut substring_hits
            };
            for (uri, entries) in &self.by_name[name] {
                for entry in entries {
                    bucket.push((uri.clone(), entry.clone()));
                }
            }
        }

        prefix_hits.extend(substring_hits);
        prefix_hits.truncate(limit);
        prefix_hits
    }

    pub fn document_count(&self) -> usize {
        self.names_by_uri.len()
    }
}

fn flatten(symbols: &[PikeSymbol], container: Option<&str>, out: &mut Vec<FlatSymbol>) {
    for symbol in symbols {
        out.push(FlatSymbol {
            name: symbol.name.clone(),
            kind: symbol.kind,
            container: container.map(str::to_owned),
            position: symbol.position,
        });
        flatten(&symbol.children, Some(&symbol.name), out);
    }
}

fn pike_source_globs() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["**/*.pike", "**/*.pmod"] {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Walk the workspace for Pike sources, gitignore-aware, skipping vendored
/// and build directories. Returns the files plus any walk warnings.
pub fn discover_pike_files(root: &Path) -> (Vec<PathBuf>, Vec<String>) {
    let mut files = Vec::new();
    let mut warnings = Vec::new();
    let globs = pike_source_globs();

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !SKIP_DIRS.contains(&name.as_ref())
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warnings.push(format!("error walking workspace: {e}"));
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if globs.is_match(relative) {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    (files, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn uri(s: &str) -> Uri {
        Uri::from_str(s).unwrap()
    }

    fn class_with_member(class: &str, member: &str) -> PikeSymbol {
        PikeSymbol {
            name: class.into(),
            kind: PikeSymbolKind::Class,
            position: SymbolPosition { line: 1, column: 1 },
            children: vec![PikeSymbol {
                name: member.into(),
                kind: PikeSymbolKind::Method,
                position: SymbolPosition { line: 2, column: 3 },
                children: Vec::new(),
                type_name: None,
                modifiers: Vec::new(),
                classname: Some(class.into()),
                arg_names: Vec::new(),
            }],
            type_name: None,
            modifiers: Vec::new(),
            classname: None,
            arg_names: Vec::new(),
        }
    }

    #[test]
    fn search_is_case_insensitive_and_covers_members() {
        let mut index = WorkspaceSymbolIndex::new();
        index.index_document(
            uri("file:///w/conn.pike"),
            &[class_with_member("Connection", "sendRequest")],
        );

        let hits = index.search("sendreq", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.name, "sendRequest");
        assert_eq!(hits[0].1.container.as_deref(), Some("Connection"));
    }

    #[test]
    fn same_name_across_files_yields_one_hit_per_file() {
        let mut index = WorkspaceSymbolIndex::new();
        index.index_document(
            uri("file:///w/a.pike"),
            &[class_with_member("A", "myFunction")],
        );
        index.index_document(
            uri("file:///w/b.pike"),
            &[class_with_member("B", "myFunction")],
        );

        let hits = index.search("myFun", 10);
        assert_eq!(hits.len(), 2);

        index.index_document(
            uri("file:///w/c.pike"),
            &[class_with_member("C", "myFunction")],
        );
        assert_eq!(index.search("myFun", 10).len(), 3);
    }

    #[test]
    fn reindex_replaces_prior_entries() {
        let mut index = WorkspaceSymbolIndex::new();
        let u = uri("file:///w/a.pike");
        index.index_document(u.clone(), &[class_with_member("Old", "gone")]);
        index.index_document(u.clone(), &[class_with_member("New", "here")]);

        assert!(index.search("gone", 10).is_empty());
        assert_eq!(index.search("here", 10).len(), 1);
    }

    #[test]
    fn prefix_matches_rank_before_substring_matches() {
        let mut index = WorkspaceSymbolIndex::new();
        index.index_document(
            uri("file:///w/a.pike"),
            &[
                class_with_member("Parser", "parse_file"),
                class_with_member("Reparser", "do_parse"),
            ],
        );
        let hits = index.search("par", 10);
        assert!(!hits.is_empty());
        assert!(hits[0].1.name.to_lowercase().starts_with("par"));
    }

    #[test]
    fn result_cap_is_enforced() {
        let mut index = WorkspaceSymbolIndex::new();
        for i in 0..20 {
            index.index_document(
                uri(&format!("file:///w/f{i}.pike")),
                &[class_with_member(&format!("Thing{i}"), "run")],
            );
        }
        assert_eq!(index.search("thing", 5).len(), 5);
    }

    #[test]
    fn discovery_finds_pike_sources_and_skips_vendored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("main.pike"), "int main() { return 0; }\n").unwrap();
        std::fs::create_dir_all(root.join("lib")).unwrap();
        std::fs::write(root.join("lib/utils.pmod"), "void helper() {}\n").unwrap();
        std::fs::create_dir_all(root.join("node_modules/junk")).unwrap();
        std::fs::write(root.join("node_modules/junk/x.pike"), "").unwrap();
        std::fs::write(root.join("README.md"), "# docs\n").unwrap();

        let (files, warnings) = discover_pike_files(root);
        assert!(warnings.is_empty());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["lib/utils.pmod", "main.pike"]);
    }
}
