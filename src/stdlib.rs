use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use crate::analysis::{PikeSymbol, StdlibResolution};

/// Default bounds: entry count AND estimated bytes, whichever trips first.
pub const DEFAULT_MAX_ENTRIES: usize = 50;
pub const DEFAULT_MAX_BYTES: usize = 20 * 1024 * 1024;
/// Negative results are cheap but still capped.
const NEGATIVE_CAP: usize = 512;

/// A resolved standard-library module.
#[derive(Debug)]
pub struct StdlibModuleInfo {
    pub module_path: String,
    pub symbols: HashMap<String, PikeSymbol>,
    pub file_path: Option<PathBuf>,
    /// 0-based line for LSP navigation (the interpreter reports 1-based).
    pub line: Option<u32>,
    pub inherits: Vec<String>,
    pub size_estimate: usize,
}

struct CachedModule {
    info: Arc<StdlibModuleInfo>,
    last_accessed: u64,
    access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdlibStats {
    pub entries: usize,
    pub estimated_bytes: usize,
    pub negative_entries: usize,
}

/// Lazy cache of standard-library modules.
///
/// Positive entries are LRU-evicted under a dual bound (entry count and
/// estimated bytes). Modules known not to resolve go into a FIFO-capped
/// negative cache so repeated lookups don't keep hitting the interpreter.
pub struct StdlibIndex {
    entries: HashMap<String, CachedModule>,
    total_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    negative: HashSet<String>,
    negative_order: VecDeque<String>,
    clock: u64,
}

impl StdlibIndex {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            total_bytes: 0,
            max_entries,
            max_bytes,
            negative: HashSet::new(),
            negative_order: VecDeque::new(),
            clock: 0,
        }
    }

    /// A cached module, if present. Touches the LRU state.
    pub fn cached(&mut self, module_path: &str) -> Option<Arc<StdlibModuleInfo>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(module_path).map(|cached| {
            cached.last_accessed = clock;
            cached.access_count += 1;
            Arc::clone(&cached.info)
        })
    }

    pub fn is_negative(&self, module_path: &str) -> bool {
        self.negative.contains(module_path)
    }

    /// Install a resolution from the interpreter, evicting as needed to stay
    /// within both bounds. A module hitting the negative cache earlier is
    /// rehabilitated.
    pub fn insert(
        &mut self,
        module_path: &str,
        resolution: StdlibResolution,
    ) -> Arc<StdlibModuleInfo> {
        if self.negative.remove(module_path) {
            self.negative_order.retain(|m| m != module_path);
        }

        let info = Arc::new(build_info(module_path, resolution));
        self.clock += 1;
        if let Some(old) = self.entries.remove(module_path) {
            self.total_bytes = self.total_bytes.saturating_sub(old.info.size_estimate);
        }
        self.total_bytes += info.size_estimate;
        self.entries.insert(
            module_path.to_string(),
            CachedModule {
                info: Arc::clone(&info),
                last_accessed: self.clock,
                access_count: 1,
            },
        );

        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            if !self.evict_lru(module_path) {
                break;
            }
        }
        info
    }

    /// Record a module as unresolvable. FIFO-evicts the oldest negative
    /// entry at the cap.
    pub fn insert_negative(&mut self, module_path: &str) {
        if !self.negative.insert(module_path.to_string()) {
            return;
        }
        self.negative_order.push_back(module_path.to_string());
        while self.negative_order.len() > NEGATIVE_CAP {
            if let Some(oldest) = self.negative_order.pop_front() {
                self.negative.remove(&oldest);
            }
        }
    }

    pub fn stats(&self) -> StdlibStats {
        StdlibStats {
            entries: self.entries.len(),
            estimated_bytes: self.total_bytes,
            negative_entries: self.negative.len(),
        }
    }

    /// Evict the least-recently-used entry, sparing `keep` (the entry just
    /// inserted). Returns false when nothing evictable remains.
    fn evict_lru(&mut self, keep: &str) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(path, _)| path.as_str() != keep)
            .min_by_key(|(_, cached)| cached.last_accessed)
            .map(|(path, _)| path.clone());
        match victim {
            Some(path) => {
                if let Some(old) = self.entries.remove(&path) {
                    self.total_bytes = self.total_bytes.saturating_sub(old.info.size_estimate);
                }
                true
            }
            None => false,
        }
    }
}

impl Default for StdlibIndex {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }
}

fn build_info(module_path: &str, resolution: StdlibResolution) -> StdlibModuleInfo {
    let (file_path, line) = match resolution.file_path.as_deref() {
        Some(raw) => parse_file_line(raw),
        None => (None, None),
    };
    let symbols: HashMap<String, PikeSymbol> = resolution
        .symbols
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    let size_estimate = estimate_size(module_path, &symbols);
    StdlibModuleInfo {
        module_path: module_path.to_string(),
        symbols,
        file_path,
        line,
        inherits: resolution.inherits,
        size_estimate,
    }
}

/// The interpreter reports source locations as `path` or `path:line`
/// (1-based). Exposes the 0-based line LSP wants.
fn parse_file_line(raw: &str) -> (Option<PathBuf>, Option<u32>) {
    if let Some((path, line)) = raw.rsplit_once(':')
        && !path.is_empty()
        && let Ok(line) = line.parse::<u32>()
    {
        return (Some(PathBuf::from(path)), Some(line.saturating_sub(1)));
    }
    (Some(PathBuf::from(raw)), None)
}

fn estimate_size(module_path: &str, symbols: &HashMap<String, PikeSymbol>) -> usize {
    let mut size = 64 + module_path.len();
    for (name, symbol) in symbols {
        size += 48 + name.len();
        size += symbol.type_name.as_deref().map_or(0, str::len);
        size += symbol.arg_names.iter().map(String::len).sum::<usize>();
    }
    size
}
