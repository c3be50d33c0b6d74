//! Loadable command modules.
//!
//! A module is a shared object exporting a fixed capability set:
//!
//! - `module_name: &'static str` - required
//! - `module_match: &'static str` - required command token; empty means the
//!   module runs ambiently (every message, or on an interval)
//! - `module_enter` - required entrypoint, invoked per job
//! - `module_close` - optional teardown
//! - `module_interval: u64` - optional period in seconds
//!
//! Loading never maps a shared object executable before its dynamic symbol
//! table passes the [`whitelist`] check. Built-in modules take the same
//! shape without a library handle; the execution engine treats both alike.

pub mod api;
pub mod arena;
pub mod whitelist;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libloading::Library;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::error::PluginError;
use crate::instance::InstanceCore;
use crate::rng::ModuleRng;
use crate::store::Store;

use self::api::ModuleCtx;

/// Stable identity of one load; a reload yields a fresh id.
pub type ModuleId = u64;

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-job entrypoint: `(ctx, channel, user, message)`.
pub type EnterFn = fn(&ModuleCtx, &str, &str, &str);

/// Optional teardown entrypoint.
pub type CloseFn = fn(&InstanceCore);

enum ModuleHandle {
    Builtin,
    // Kept alive for as long as any job may still hold the entrypoints.
    Dylib(#[allow(dead_code)] Library),
}

/// One loaded module.
pub struct Module {
    id: ModuleId,
    path: PathBuf,
    name: String,
    matches: String,
    interval: Option<Duration>,
    last_interval: Mutex<Option<Instant>>,
    /// This module's private PRNG.
    pub rng: ModuleRng,
    enter: EnterFn,
    close: Option<CloseFn>,
    _handle: ModuleHandle,
}

impl Module {
    /// Construct a statically linked module.
    pub fn builtin(
        name: &str,
        matches: &str,
        interval: Option<Duration>,
        enter: EnterFn,
        close: Option<CloseFn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            path: PathBuf::new(),
            name: name.to_string(),
            matches: matches.to_string(),
            interval,
            last_interval: Mutex::new(None),
            rng: ModuleRng::new(),
            enter,
            close,
            _handle: ModuleHandle::Builtin,
        })
    }

    fn from_library(path: PathBuf, library: Library) -> Result<Arc<Self>, PluginError> {
        let missing = |symbol| PluginError::MissingSymbol {
            symbol,
            path: path.clone(),
        };

        // Entrypoints stay valid while `library` is held by the module.
        let (name, matches, enter, close, interval) = unsafe {
            let name: String = (*library
                .get::<&'static str>(b"module_name\0")
                .map_err(|_| missing("module_name"))?)
            .to_string();
            let matches: String = (*library
                .get::<&'static str>(b"module_match\0")
                .map_err(|_| missing("module_match"))?)
            .to_string();
            let enter: EnterFn = *library
                .get::<EnterFn>(b"module_enter\0")
                .map_err(|_| missing("module_enter"))?;
            let close: Option<CloseFn> = library
                .get::<CloseFn>(b"module_close\0")
                .ok()
                .map(|sym| *sym);
            let interval: Option<Duration> = library
                .get::<u64>(b"module_interval\0")
                .ok()
                .map(|sym| Duration::from_secs(*sym));
            (name, matches, enter, close, interval)
        };

        Ok(Arc::new(Self {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            path,
            name,
            matches,
            interval,
            last_interval: Mutex::new(None),
            rng: ModuleRng::new(),
            enter,
            close,
            _handle: ModuleHandle::Dylib(library),
        }))
    }

    /// The load identity.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Exported name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exported command-match token; empty for ambient modules.
    pub fn matches(&self) -> &str {
        &self.matches
    }

    /// File this module came from; empty for built-ins.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Interval period, when the module is interval-driven.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Whether the module runs without a command token.
    pub fn is_ambient(&self) -> bool {
        self.matches.is_empty()
    }

    /// Whether the interval has elapsed; stamps the clock when it has.
    pub fn interval_due(&self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        let mut last = self.last_interval.lock();
        match *last {
            Some(t) if now.duration_since(t) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Invoke the entrypoint. Only the execution engine calls this, from a
    /// worker thread.
    pub(crate) fn run(&self, ctx: &ModuleCtx, channel: &str, user: &str, message: &str) {
        (self.enter)(ctx, channel, user, message);
    }

    fn run_close(&self, core: &InstanceCore) {
        if let Some(close) = self.close {
            close(core);
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("matches", &self.matches)
            .field("interval", &self.interval)
            .finish()
    }
}

/// The per-instance module set.
pub struct ModuleManager {
    modules_dir: PathBuf,
    modules: RwLock<Vec<Arc<Module>>>,
    unloaded: Mutex<HashSet<ModuleId>>,
}

impl ModuleManager {
    /// Manager over a modules directory.
    pub fn new(modules_dir: PathBuf) -> Self {
        Self {
            modules_dir,
            modules: RwLock::new(Vec::new()),
            unloaded: Mutex::new(HashSet::new()),
        }
    }

    /// Load `<modules_dir>/<name>.so` after the whitelist check.
    pub fn load(&self, name: &str, store: &Store) -> Result<Arc<Module>, PluginError> {
        if name.contains("//") || name.contains("./") {
            return Err(PluginError::BadName(name.to_string()));
        }

        let path = self.modules_dir.join(format!("{name}.so"));
        if self
            .modules
            .read()
            .iter()
            .any(|m| m.path() == path.as_path())
        {
            return Err(PluginError::AlreadyLoaded(name.to_string()));
        }

        let bytes = std::fs::read(&path).map_err(|e| PluginError::Inspect {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        whitelist::check_object(&path, &bytes, store)?;

        let library = unsafe { Library::new(&path) }.map_err(|e| PluginError::Open {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let module = Module::from_library(path, library)?;

        info!(module = module.name(), file = %module.path().display(), "module loaded");
        self.modules.write().push(Arc::clone(&module));
        Ok(module)
    }

    /// Register a built-in module under the same bookkeeping.
    pub fn insert_builtin(&self, module: Arc<Module>) -> Result<(), PluginError> {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == module.name()) {
            return Err(PluginError::AlreadyLoaded(module.name().to_string()));
        }
        modules.push(module);
        Ok(())
    }

    /// Unload by name; in-flight jobs holding the old load are dropped.
    pub fn unload(&self, name: &str, core: &InstanceCore) -> Result<(), PluginError> {
        let module = {
            let mut modules = self.modules.write();
            let idx = modules
                .iter()
                .position(|m| m.name() == name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            modules.remove(idx)
        };

        module.run_close(core);
        self.unloaded.lock().insert(module.id());
        info!(module = name, "module unloaded");
        Ok(())
    }

    /// Find the module serving a command token.
    pub fn by_command(&self, token: &str) -> Option<Arc<Module>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.matches() == token && !m.is_ambient())
            .cloned()
    }

    /// Find a module by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Names of every loaded module, sorted.
    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Modules with no command token (always- and interval-style).
    pub fn ambient_modules(&self) -> Vec<Arc<Module>> {
        self.modules
            .read()
            .iter()
            .filter(|m| m.is_ambient())
            .cloned()
            .collect()
    }

    /// Shortest interval across ambient interval modules.
    pub fn min_interval(&self) -> Option<Duration> {
        self.modules
            .read()
            .iter()
            .filter(|m| m.is_ambient())
            .filter_map(|m| m.interval())
            .min()
    }

    /// Whether `id` refers to an unloaded module.
    pub fn is_unloaded(&self, id: ModuleId) -> bool {
        self.unloaded.lock().contains(&id)
    }

    /// Forget the unloaded set once no stale jobs can remain.
    pub fn clear_unloaded(&self) {
        self.unloaded.lock().clear();
    }

    /// Run every close entrypoint, for shutdown.
    pub fn close_all(&self, core: &InstanceCore) {
        // Snapshot first so close entrypoints can call back into the
        // manager without holding the module list.
        let modules: Vec<Arc<Module>> = self.modules.read().iter().cloned().collect();
        for module in modules {
            module.run_close(core);
        }
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules_dir", &self.modules_dir)
            .field("loaded", &self.loaded_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &ModuleCtx, _: &str, _: &str, _: &str) {}

    fn manager() -> ModuleManager {
        ModuleManager::new(PathBuf::from("modules"))
    }

    #[test]
    fn test_builtin_registration_and_lookup() {
        let mgr = manager();
        mgr.insert_builtin(Module::builtin("family", "family", None, noop, None))
            .unwrap();
        mgr.insert_builtin(Module::builtin("ticker", "", Some(Duration::from_secs(30)), noop, None))
            .unwrap();

        assert!(mgr.by_command("family").is_some());
        assert!(mgr.by_command("ticker").is_none());
        assert!(mgr.by_name("ticker").is_some());
        assert_eq!(mgr.loaded_names(), vec!["family", "ticker"]);
        assert_eq!(mgr.ambient_modules().len(), 1);
        assert_eq!(mgr.min_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_duplicate_builtin_rejected() {
        let mgr = manager();
        mgr.insert_builtin(Module::builtin("a", "a", None, noop, None))
            .unwrap();
        let err = mgr
            .insert_builtin(Module::builtin("a", "a", None, noop, None))
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyLoaded(_)));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let mgr = manager();
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            mgr.load("../evil", &store),
            Err(PluginError::BadName(_))
        ));
        assert!(matches!(
            mgr.load("a//b", &store),
            Err(PluginError::BadName(_))
        ));
    }

    #[test]
    fn test_missing_file_is_inspect_error() {
        let mgr = manager();
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            mgr.load("does-not-exist", &store),
            Err(PluginError::Inspect { .. })
        ));
    }

    #[test]
    fn test_interval_due_stamps_clock() {
        let module = Module::builtin("t", "", Some(Duration::from_secs(60)), noop, None);
        let start = Instant::now();
        assert!(module.interval_due(start));
        assert!(!module.interval_due(start + Duration::from_secs(30)));
        assert!(module.interval_due(start + Duration::from_secs(61)));
    }

    #[test]
    fn test_fresh_ids() {
        let a = Module::builtin("a", "a", None, noop, None);
        let b = Module::builtin("b", "b", None, noop, None);
        assert_ne!(a.id(), b.id());
    }
}
