use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::analysis::Analyzer;
use crate::compile_cache::CompilationCache;
use crate::config::Settings;
use crate::documents::{DocumentStore, NegotiatedEncoding};
use crate::includes::IncludeResolver;
use crate::stdlib::StdlibIndex;
use crate::supervisor::Supervisor;
use crate::workspace::WorkspaceSymbolIndex;

/// Handler-visible mutable state, guarded by one mutex.
///
/// Every cache and index lives here; the lock is only ever held between
/// suspension points, never across an await. Multi-structure updates (the
/// validator's fan-out) happen under a single acquisition so entries are
/// replaced atomically.
pub struct WorkspaceState {
    pub documents: DocumentStore,
    pub compile_cache: CompilationCache,
    pub stdlib: StdlibIndex,
    pub symbols: WorkspaceSymbolIndex,
    pub includes: IncludeResolver,
}

/// Everything a handler needs, assembled once the supervisor is running.
///
/// Handlers receive this as a value and never see a half-built bundle;
/// there are no nullable service fields to guard against.
pub struct Services {
    pub analyzer: Analyzer,
    pub supervisor: Arc<Supervisor>,
    pub workspace_root: Option<PathBuf>,
    settings: Mutex<Settings>,
    state: Mutex<WorkspaceState>,
    encoding: RwLock<NegotiatedEncoding>,
}

impl Services {
    pub fn new(
        supervisor: Arc<Supervisor>,
        settings: Settings,
        workspace_root: Option<PathBuf>,
        encoding: NegotiatedEncoding,
    ) -> Arc<Self> {
        let mut compile_cache = CompilationCache::default();
        if let Some(root) = &workspace_root {
            compile_cache.set_project_root(root.clone());
        }
        let includes = IncludeResolver::new(settings.include_dirs());
        let analyzer = Analyzer::new(Arc::clone(&supervisor));
        Arc::new(Self {
            analyzer,
            supervisor,
            workspace_root,
            settings: Mutex::new(settings),
            state: Mutex::new(WorkspaceState {
                documents: DocumentStore::new(),
                compile_cache,
                stdlib: StdlibIndex::default(),
                symbols: WorkspaceSymbolIndex::new(),
                includes,
            }),
            encoding: RwLock::new(encoding),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, WorkspaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply a configuration change; the include search path follows along.
    pub fn update_settings(&self, settings: Settings) {
        let include_dirs = settings.include_dirs();
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings;
        self.state().includes.set_include_dirs(include_dirs);
    }

    pub fn encoding(&self) -> NegotiatedEncoding {
        *self.encoding.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_encoding(&self, encoding: NegotiatedEncoding) {
        *self.encoding.write().unwrap_or_else(|e| e.into_inner()) = encoding;
    }
}
