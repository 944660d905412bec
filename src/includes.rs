use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analysis::PikeSymbol;

/// How long a resolved include's pre-parsed symbols stay fresh.
const SYMBOL_TTL: Duration = Duration::from_secs(30);

struct CachedSymbols {
    symbols: Arc<Vec<PikeSymbol>>,
    resolved_at: Instant,
}

/// Locates `#include`d files and caches their parsed symbol sets.
///
/// Filesystem probing happens here in search order: the current file's
/// directory, then each configured include directory. When neither hits,
/// the caller falls back to the interpreter's own resolution through the
/// analysis facade.
pub struct IncludeResolver {
    include_dirs: Vec<PathBuf>,
    cache: HashMap<PathBuf, CachedSymbols>,
    ttl: Duration,
}

impl IncludeResolver {
    pub fn new(include_dirs: Vec<PathBuf>) -> Self {
        Self {
            include_dirs,
            cache: HashMap::new(),
            ttl: SYMBOL_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(include_dirs: Vec<PathBuf>, ttl: Duration) -> Self {
        Self {
            include_dirs,
            cache: HashMap::new(),
            ttl,
        }
    }

    /// Settings changes swap the search path; cached symbols survive (they
    /// are keyed by resolved absolute path).
    pub fn set_include_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.include_dirs = dirs;
    }

    /// Probe the filesystem for `spec` relative to `current_file`, then the
    /// include path. `None` means the interpreter should be asked.
    pub fn resolve_path(&self, spec: &str, current_file: &Path) -> Option<PathBuf> {
        if let Some(dir) = current_file.parent() {
            let candidate = dir.join(spec);
            if candidate.is_file() {
                return Some(normalize(&candidate));
            }
        }
        for dir in &self.include_dirs {
            let candidate = dir.join(spec);
            if candidate.is_file() {
                return Some(normalize(&candidate));
            }
        }
        None
    }

    /// Fresh pre-parsed symbols for a resolved include, if any.
    pub fn cached_symbols(&self, path: &Path) -> Option<Arc<Vec<PikeSymbol>>> {
        self.cache
            .get(path)
            .filter(|cached| cached.resolved_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.symbols))
    }

    pub fn store_symbols(&mut self, path: PathBuf, symbols: Vec<PikeSymbol>) {
        self.cache.insert(
            path,
            CachedSymbols {
                symbols: Arc::new(symbols),
                resolved_at: Instant::now(),
            },
        );
    }

    /// Drop a stale entry (e.g. the file changed on disk).
    pub fn invalidate(&mut self, path: &Path) {
        self.cache.remove(path);
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{PikeSymbolKind, SymbolPosition};

    fn sym(name: &str) -> PikeSymbol {
        PikeSymbol {
            name: name.into(),
            kind: PikeSymbolKind::Constant,
            position: SymbolPosition { line: 1, column: 1 },
            children: Vec::new(),
            type_name: None,
            modifiers: Vec::new(),
            classname: None,
            arg_names: Vec::new(),
        }
    }

    #[test]
    fn relative_include_wins_over_include_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("shared")).unwrap();
        std::fs::write(root.join("src/defs.h"), "// local\n").unwrap();
        std::fs::write(root.join("shared/defs.h"), "// shared\n").unwrap();

        let resolver = IncludeResolver::new(vec![root.join("shared")]);
        let resolved = resolver
            .resolve_path("defs.h", &root.join("src/main.pike"))
            .unwrap();
        assert!(resolved.ends_with("src/defs.h"));
    }

    #[test]
    fn include_path_is_probed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("first")).unwrap();
        std::fs::create_dir_all(root.join("second")).unwrap();
        std::fs::write(root.join("second/only.h"), "").unwrap();

        let resolver = IncludeResolver::new(vec![root.join("first"), root.join("second")]);
        let resolved = resolver
            .resolve_path("only.h", &root.join("elsewhere/main.pike"))
            .unwrap();
        assert!(resolved.ends_with("second/only.h"));

        assert!(
            resolver
                .resolve_path("missing.h", &root.join("elsewhere/main.pike"))
                .is_none()
        );
    }

    #[test]
    fn symbol_cache_respects_ttl() {
        let mut resolver = IncludeResolver::with_ttl(vec![], Duration::from_secs(3600));
        let path = PathBuf::from("/w/defs.h");
        resolver.store_symbols(path.clone(), vec![sym("MAX_CLIENTS")]);
        assert_eq!(resolver.cached_symbols(&path).unwrap().len(), 1);

        let mut expired = IncludeResolver::with_ttl(vec![], Duration::ZERO);
        expired.store_symbols(path.clone(), vec![sym("MAX_CLIENTS")]);
        assert!(expired.cached_symbols(&path).is_none());
    }

    #[test]
    fn invalidate_drops_entry() {
        let mut resolver = IncludeResolver::new(vec![]);
        let path = PathBuf::from("/w/defs.h");
        resolver.store_symbols(path.clone(), vec![sym("A")]);
        resolver.invalidate(&path);
        assert!(resolver.cached_symbols(&path).is_none());
    }
}
