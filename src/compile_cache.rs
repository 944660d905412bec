use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::analysis::PikeDiagnostic;

/// Default bound on cached paths.
pub const DEFAULT_CAPACITY: usize = 500;

/// Identifies the content revision a compilation was built from.
///
/// The two key spaces are tagged so an editor-provided version can never
/// collide with a filesystem-derived one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionKey {
    /// Editor document version.
    Lsp(i32),
    /// Filesystem stat, for files not open in the editor.
    Fs { mtime_ms: u64, size: u64 },
}

impl VersionKey {
    /// Derive a filesystem key from a file's current metadata.
    pub fn for_file(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime_ms = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self::Fs {
            mtime_ms,
            size: meta.len(),
        })
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lsp(version) => write!(f, "LSP:{version}"),
            Self::Fs { mtime_ms, size } => write!(f, "FS:{mtime_ms}:{size}"),
        }
    }
}

/// A cached compilation for one (path, version) slot.
#[derive(Debug, Clone)]
pub struct CompiledEntry {
    /// Opaque handle to the program held on the interpreter side.
    pub program_handle: Option<Value>,
    pub diagnostics: Vec<PikeDiagnostic>,
}

struct PathSlot {
    /// Insertion-ordered so superseded versions are pruned first.
    versions: Vec<(VersionKey, CompiledEntry)>,
    last_access: u64,
}

/// Cache statistics for the health surface and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Compilation cache with dependency-driven invalidation.
///
/// Two-level keying: path, then version key. A bidirectional dependency
/// graph over project-local paths drives transitive invalidation; stdlib
/// paths are filtered out at insert time. Bounded by path count with LRU
/// eviction.
pub struct CompilationCache {
    slots: HashMap<PathBuf, PathSlot>,
    deps: HashMap<PathBuf, HashSet<PathBuf>>,
    dependents: HashMap<PathBuf, HashSet<PathBuf>>,
    project_root: Option<PathBuf>,
    capacity: usize,
    access_clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CompilationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            deps: HashMap::new(),
            dependents: HashMap::new(),
            project_root: None,
            capacity,
            access_clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Only paths under the project root participate in the dependency
    /// graph; before a root is known every path is considered local.
    pub fn set_project_root(&mut self, root: PathBuf) {
        self.project_root = Some(root);
    }

    fn is_project_local(&self, path: &Path) -> bool {
        match &self.project_root {
            Some(root) => path.starts_with(root),
            None => true,
        }
    }

    /// Store a successful compilation. Compile failures must NOT be stored;
    /// the caller returns their diagnostics without caching.
    pub fn insert(
        &mut self,
        path: PathBuf,
        key: VersionKey,
        entry: CompiledEntry,
        dependencies: &[PathBuf],
    ) {
        self.access_clock += 1;
        let clock = self.access_clock;
        let slot = self.slots.entry(path.clone()).or_insert_with(|| PathSlot {
            versions: Vec::new(),
            last_access: clock,
        });
        slot.last_access = clock;
        slot.versions.retain(|(k, _)| *k != key);
        slot.versions.push((key, entry));
        // A transition window keeps at most two revisions; older ones are
        // superseded and pruned immediately.
        while slot.versions.len() > 2 {
            slot.versions.remove(0);
        }

        let local: Vec<PathBuf> = dependencies
            .iter()
            .filter(|d| self.is_project_local(d))
            .cloned()
            .collect();
        self.set_dependencies(&path, local);

        while self.slots.len() > self.capacity {
            self.evict_lru();
        }
    }

    pub fn lookup(&mut self, path: &Path, key: &VersionKey) -> Option<CompiledEntry> {
        self.access_clock += 1;
        let clock = self.access_clock;
        match self.slots.get_mut(path) {
            Some(slot) => {
                slot.last_access = clock;
                match slot.versions.iter().find(|(k, _)| k == key) {
                    Some((_, entry)) => {
                        self.hits += 1;
                        Some(entry.clone())
                    }
                    None => {
                        self.misses += 1;
                        None
                    }
                }
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Dependencies recorded for a path (graph-authoritative).
    pub fn dependencies(&self, path: &Path) -> Vec<PathBuf> {
        self.deps
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, path: &Path) -> Vec<PathBuf> {
        self.dependents
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Invalidate a path's entries; with `transitive`, also every direct and
    /// indirect dependent (BFS over the dependents map, cycle-safe).
    /// Returns the number of paths whose entries were removed.
    pub fn invalidate(&mut self, path: &Path, transitive: bool) -> usize {
        let victims: Vec<PathBuf> = if transitive {
            let mut visited: HashSet<PathBuf> = HashSet::new();
            let mut queue: VecDeque<PathBuf> = VecDeque::new();
            visited.insert(path.to_path_buf());
            queue.push_back(path.to_path_buf());
            while let Some(current) = queue.pop_front() {
                if let Some(dependents) = self.dependents.get(&current) {
                    for dependent in dependents {
                        if visited.insert(dependent.clone()) {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            visited.into_iter().collect()
        } else {
            vec![path.to_path_buf()]
        };

        let mut removed = 0;
        for victim in victims {
            if self.remove_path(&victim) {
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.slots.values().map(|s| s.versions.len()).sum(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Replace the outgoing edges of `path`, keeping both maps in sync.
    fn set_dependencies(&mut self, path: &Path, new_deps: Vec<PathBuf>) {
        if let Some(old) = self.deps.remove(path) {
            for dep in old {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(path);
                    if set.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
        if new_deps.is_empty() {
            return;
        }
        for dep in &new_deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(path.to_path_buf());
        }
        self.deps.insert(path.to_path_buf(), new_deps.into_iter().collect());
    }

    /// Drop a path's entries and detach it from the graph in both
    /// directions.
    fn remove_path(&mut self, path: &Path) -> bool {
        let existed = self.slots.remove(path).is_some();

        self.set_dependencies(path, Vec::new());
        if let Some(dependents) = self.dependents.remove(path) {
            for dependent in dependents {
                if let Some(set) = self.deps.get_mut(&dependent) {
                    set.remove(path);
                    if set.is_empty() {
                        self.deps.remove(&dependent);
                    }
                }
            }
        }
        existed
    }

    fn evict_lru(&mut self) {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(path, _)| path.clone());
        if let Some(path) = victim {
            self.remove_path(&path);
            self.evictions += 1;
        }
    }

    #[cfg(test)]
    fn graph_is_bidirectional(&self) -> bool {
        let forward_ok = self.deps.iter().all(|(path, deps)| {
            deps.iter().all(|dep| {
                self.dependents
                    .get(dep)
                    .is_some_and(|set| set.contains(path))
            })
        });
        let backward_ok = self.dependents.iter().all(|(path, dependents)| {
            dependents.iter().all(|dependent| {
                self.deps
                    .get(dependent)
                    .is_some_and(|set| set.contains(path))
            })
        });
        forward_ok && backward_ok
    }
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CompiledEntry {
        CompiledEntry {
            program_handle: None,
            diagnostics: Vec::new(),
        }
    }

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn version_keys_are_tagged() {
        assert_eq!(VersionKey::Lsp(42).to_string(), "LSP:42");
        assert_eq!(
            VersionKey::Fs {
                mtime_ms: 1_700_000_000_000,
                size: 342
            }
            .to_string(),
            "FS:1700000000000:342"
        );
        // The key spaces cannot collide.
        assert_ne!(
            VersionKey::Lsp(1),
            VersionKey::Fs {
                mtime_ms: 1,
                size: 1
            }
        );
    }

    #[test]
    fn lookup_hits_and_misses() {
        let mut cache = CompilationCache::new(10);
        cache.insert(p("/w/a.pike"), VersionKey::Lsp(1), entry(), &[]);

        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(1)).is_some());
        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(2)).is_none());
        assert!(cache.lookup(&p("/w/other.pike"), &VersionKey::Lsp(1)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn dependency_graph_is_bidirectional() {
        let mut cache = CompilationCache::new(10);
        cache.insert(
            p("/w/main.pike"),
            VersionKey::Lsp(1),
            entry(),
            &[p("/w/lib/utils.pike"), p("/w/lib/net.pike")],
        );
        assert!(cache.graph_is_bidirectional());
        assert!(
            cache
                .dependents(&p("/w/lib/utils.pike"))
                .contains(&p("/w/main.pike"))
        );

        // Replacing the dep list drops the stale edge both ways.
        cache.insert(
            p("/w/main.pike"),
            VersionKey::Lsp(2),
            entry(),
            &[p("/w/lib/utils.pike")],
        );
        assert!(cache.graph_is_bidirectional());
        assert!(cache.dependents(&p("/w/lib/net.pike")).is_empty());
    }

    #[test]
    fn stdlib_paths_are_filtered_from_the_graph() {
        let mut cache = CompilationCache::new(10);
        cache.set_project_root(p("/w"));
        cache.insert(
            p("/w/main.pike"),
            VersionKey::Lsp(1),
            entry(),
            &[p("/w/lib/utils.pike"), p("/usr/lib/pike/modules/Stdio.pmod")],
        );
        assert_eq!(cache.dependencies(&p("/w/main.pike")), vec![p("/w/lib/utils.pike")]);
        assert!(
            cache
                .dependents(&p("/usr/lib/pike/modules/Stdio.pmod"))
                .is_empty()
        );
    }

    #[test]
    fn transitive_invalidation_covers_dependents() {
        let mut cache = CompilationCache::new(10);
        cache.insert(
            p("/w/main.pike"),
            VersionKey::Lsp(3),
            entry(),
            &[p("/w/lib/utils.pike")],
        );
        cache.insert(p("/w/lib/utils.pike"), VersionKey::Lsp(1), entry(), &[]);
        assert_eq!(cache.len(), 2);

        let removed = cache.invalidate(&p("/w/lib/utils.pike"), true);
        assert_eq!(removed, 2);
        assert!(cache.is_empty());
        assert!(cache.lookup(&p("/w/main.pike"), &VersionKey::Lsp(3)).is_none());
        assert!(cache.graph_is_bidirectional());
    }

    #[test]
    fn transitive_invalidation_without_dependents_is_local() {
        let mut cache = CompilationCache::new(10);
        cache.insert(p("/w/a.pike"), VersionKey::Lsp(1), entry(), &[]);
        cache.insert(p("/w/b.pike"), VersionKey::Lsp(1), entry(), &[]);

        let removed = cache.invalidate(&p("/w/a.pike"), true);
        assert_eq!(removed, 1);
        assert!(cache.lookup(&p("/w/b.pike"), &VersionKey::Lsp(1)).is_some());
    }

    #[test]
    fn transitive_invalidation_survives_cycles() {
        let mut cache = CompilationCache::new(10);
        cache.insert(p("/w/a.pike"), VersionKey::Lsp(1), entry(), &[p("/w/b.pike")]);
        cache.insert(p("/w/b.pike"), VersionKey::Lsp(1), entry(), &[p("/w/a.pike")]);

        let removed = cache.invalidate(&p("/w/a.pike"), true);
        assert_eq!(removed, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn direct_invalidation_leaves_dependents_cached() {
        let mut cache = CompilationCache::new(10);
        cache.insert(
            p("/w/main.pike"),
            VersionKey::Lsp(1),
            entry(),
            &[p("/w/lib/utils.pike")],
        );
        cache.insert(p("/w/lib/utils.pike"), VersionKey::Lsp(1), entry(), &[]);

        cache.invalidate(&p("/w/lib/utils.pike"), false);
        assert!(cache.lookup(&p("/w/main.pike"), &VersionKey::Lsp(1)).is_some());
        assert!(cache.graph_is_bidirectional());
    }

    #[test]
    fn lru_eviction_preserves_graph_invariant() {
        let mut cache = CompilationCache::new(2);
        cache.insert(p("/w/a.pike"), VersionKey::Lsp(1), entry(), &[]);
        cache.insert(p("/w/b.pike"), VersionKey::Lsp(1), entry(), &[p("/w/a.pike")]);
        // Touch /w/a so /w/b is the LRU path.
        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(1)).is_some());
        cache.insert(p("/w/c.pike"), VersionKey::Lsp(1), entry(), &[]);

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&p("/w/b.pike"), &VersionKey::Lsp(1)).is_none());
        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(1)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.graph_is_bidirectional());
    }

    #[test]
    fn superseded_versions_are_pruned() {
        let mut cache = CompilationCache::new(10);
        for version in 1..=4 {
            cache.insert(p("/w/a.pike"), VersionKey::Lsp(version), entry(), &[]);
        }
        // Transition window: the two newest revisions coexist.
        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(4)).is_some());
        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(3)).is_some());
        assert!(cache.lookup(&p("/w/a.pike"), &VersionKey::Lsp(1)).is_none());
    }
}
