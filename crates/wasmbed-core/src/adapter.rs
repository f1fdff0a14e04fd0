//! Module graph adapter: the bundler-facing side of wasmbed.
//!
//! Resolves import specifiers to virtual module ids and loads them by driving
//! fingerprint -> cache -> build -> embed. Each entry point owns at most one
//! current [`VirtualModuleNode`]; a rebuild supersedes the node and flags the
//! previous one invalidated. Changes reported through [`handle_change`]
//! only mark entries stale; the rebuild happens on the next load.
//!
//! [`handle_change`]: ModuleGraphAdapter::handle_change

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, Instrument};
use wasmbed_toolchain::{
    fingerprint_package, BuildArtifact, BuildObserver, BuildOutcome, BuildRequest, CargoToolchain,
    Digest, Toolchain, ToolchainInvoker,
};

use crate::cache::fs::FsArtifactStore;
use crate::cache::{ArtifactCache, CacheLimits};
use crate::config::PluginConfig;
use crate::diagnostics::{
    translate_build_error, translate_error, translate_warnings, DiagnosticsChannel,
};
use crate::embed::{
    runtime_module_source, EmbeddedModule, EmittedAsset, Embedder, RUNTIME_ID, RUNTIME_SPECIFIER,
};
use crate::error::{Result, WasmbedError};
use crate::metrics::METRICS;
use crate::obs;

/// Prefix of entry point module ids.
pub const ENTRY_ID_PREFIX: &str = "\0wasmbed:entry:";

/// Prefix of specifiers naming a configured entry point.
pub const ENTRY_SPECIFIER_PREFIX: &str = "wasm:";

pub fn entry_id(name: &str) -> String {
    format!("{ENTRY_ID_PREFIX}{name}")
}

/// The host's watch subsystem.
pub trait WatchHost: Send + Sync {
    /// Start watching `root` recursively. Called once per root.
    fn watch_root(&self, root: &Path);
}

/// For one-shot builds with nothing to watch.
#[derive(Debug, Default)]
pub struct NoopWatchHost;

impl WatchHost for NoopWatchHost {
    fn watch_root(&self, _root: &Path) {}
}

/// The rendered form of one entry point at one fingerprint. Never mutated
/// after creation apart from the invalidation flag.
#[derive(Debug)]
pub struct VirtualModuleNode {
    pub id: String,
    pub entry: String,
    pub generation: u64,
    pub embedded: EmbeddedModule,
    artifact: Arc<BuildArtifact>,
    invalidated: AtomicBool,
}

impl VirtualModuleNode {
    pub fn artifact(&self) -> &Arc<BuildArtifact> {
        &self.artifact
    }

    pub fn fingerprint(&self) -> Digest {
        self.artifact.fingerprint()
    }

    /// True once a change superseded this node; dependents must re-resolve.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    pub fn record(&self) -> ModuleRecord {
        ModuleRecord {
            id: self.id.clone(),
            code: self.embedded.code.clone(),
            asset: self.embedded.asset.clone(),
            generation: self.generation,
            fingerprint: Some(self.fingerprint().to_hex()),
        }
    }
}

/// What `load` hands back to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: String,
    pub code: String,
    pub asset: Option<EmittedAsset>,
    pub generation: u64,
    pub fingerprint: Option<String>,
}

struct EntryState {
    root: PathBuf,
    /// Package root plus local path dependencies, as of the last scan.
    roots: Vec<PathBuf>,
    node: Option<Arc<VirtualModuleNode>>,
    stale: bool,
    generation: u64,
    /// Bumped by every change under `roots`, built or not.
    epoch: u64,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl EntryState {
    fn new(root: PathBuf) -> Self {
        let canonical = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            roots: vec![canonical],
            node: None,
            stale: false,
            generation: 0,
            epoch: 0,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn touches(&self, path: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| path.starts_with(root) || root.starts_with(path))
    }
}

/// Runs inside the detached build task: stores the artifact and forwards
/// diagnostics exactly once per build, whether or not anyone still waits.
struct BuildSink {
    entry: String,
    cache: Arc<ArtifactCache>,
    diagnostics: Arc<DiagnosticsChannel>,
}

impl BuildObserver for BuildSink {
    fn on_started(&self, request: &BuildRequest) {
        METRICS.inc_builds_started();
        obs::emit_build_started(request.build_id, &self.entry, &request.fingerprint);
    }

    fn on_finished(&self, request: &BuildRequest, outcome: &BuildOutcome, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(artifact) => {
                self.cache.store(request.fingerprint, Arc::clone(artifact));
                self.diagnostics
                    .emit_all(translate_warnings(&self.entry, artifact));
                obs::emit_build_finished(
                    request.build_id,
                    &self.entry,
                    duration_ms,
                    Some(artifact.size()),
                    true,
                );
            }
            Err(err) => {
                METRICS.inc_builds_failed();
                self.diagnostics
                    .emit_all(translate_build_error(&self.entry, err));
                obs::emit_build_finished(request.build_id, &self.entry, duration_ms, None, false);
            }
        }
    }
}

pub struct ModuleGraphAdapter {
    config: PluginConfig,
    cache: Arc<ArtifactCache>,
    invoker: ToolchainInvoker,
    embedder: Embedder,
    diagnostics: Arc<DiagnosticsChannel>,
    watch: Arc<dyn WatchHost>,
    compiler_version: tokio::sync::OnceCell<String>,
    entries: Mutex<BTreeMap<String, EntryState>>,
    watched: Mutex<HashSet<PathBuf>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ModuleGraphAdapter {
    pub fn new(
        config: PluginConfig,
        cache: Arc<ArtifactCache>,
        toolchain: Arc<dyn Toolchain>,
        watch: Arc<dyn WatchHost>,
    ) -> Self {
        let entries = config
            .entries
            .iter()
            .map(|(name, root)| (name.clone(), EntryState::new(root.clone())))
            .collect();
        let embedder = Embedder::new(config.out_dir.clone(), config.assets_dir.clone())
            .with_inline_limit(config.inline_limit_bytes);

        Self {
            invoker: ToolchainInvoker::new(toolchain, config.timeout()),
            embedder,
            cache,
            diagnostics: Arc::new(DiagnosticsChannel::new()),
            watch,
            compiler_version: tokio::sync::OnceCell::new(),
            entries: Mutex::new(entries),
            watched: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Adapter using cargo and, when enabled, the on-disk artifact store.
    pub fn from_config(config: PluginConfig, watch: Arc<dyn WatchHost>) -> Result<Self> {
        let cache = open_cache(&config)?;
        let toolchain = Arc::new(CargoToolchain::new(
            config.toolchain.cargo.clone(),
            config.toolchain.rustc.clone(),
        ));
        Ok(Self::new(config, Arc::new(cache), toolchain, watch))
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsChannel> {
        &self.diagnostics
    }

    pub fn entry_names(&self) -> Vec<String> {
        locked(&self.entries).keys().cloned().collect()
    }

    /// Current node of an entry, stale or not.
    pub fn node(&self, name: &str) -> Option<Arc<VirtualModuleNode>> {
        locked(&self.entries).get(name).and_then(|e| e.node.clone())
    }

    pub fn is_stale(&self, name: &str) -> bool {
        locked(&self.entries).get(name).is_some_and(|e| e.stale)
    }

    /// Map an import specifier to a module id. `Ok(None)` means the
    /// specifier is not ours.
    ///
    /// Accepts `wasmbed:runtime`, `wasm:<entry>`, or a path to a
    /// `Cargo.toml` (relative to the importer's directory), which registers
    /// the package as an entry named after its directory.
    pub fn resolve(&self, specifier: &str, importer: Option<&Path>) -> Result<Option<String>> {
        if specifier == RUNTIME_SPECIFIER || specifier == RUNTIME_ID {
            return Ok(Some(RUNTIME_ID.to_string()));
        }
        if specifier.starts_with(ENTRY_ID_PREFIX) {
            return Ok(Some(specifier.to_string()));
        }
        if let Some(name) = specifier.strip_prefix(ENTRY_SPECIFIER_PREFIX) {
            if !locked(&self.entries).contains_key(name) {
                return Err(WasmbedError::UnknownEntry(name.to_string()));
            }
            return Ok(Some(entry_id(name)));
        }
        if Path::new(specifier).file_name().is_some_and(|n| n == "Cargo.toml") {
            return self.register_manifest(specifier, importer).map(Some);
        }
        Ok(None)
    }

    fn register_manifest(&self, specifier: &str, importer: Option<&Path>) -> Result<String> {
        let manifest = Path::new(specifier);
        let manifest = if manifest.is_absolute() {
            manifest.to_path_buf()
        } else {
            let base = match importer.and_then(Path::parent) {
                Some(dir) => dir.to_path_buf(),
                None => std::env::current_dir()
                    .map_err(|e| WasmbedError::Task(format!("no working directory: {e}")))?,
            };
            base.join(manifest)
        };
        let root = manifest.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let root = std::fs::canonicalize(&root).map_err(|source| {
            WasmbedError::Fingerprint(wasmbed_toolchain::FingerprintError::UnreadableRoot {
                path: root.clone(),
                source,
            })
        })?;

        let name: String = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".to_string())
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        let mut entries = locked(&self.entries);
        if let Some(existing) = entries.get(&name) {
            let existing_root =
                std::fs::canonicalize(&existing.root).unwrap_or_else(|_| existing.root.clone());
            if existing_root != root {
                return Err(WasmbedError::EntryConflict {
                    name,
                    existing: existing.root.clone(),
                });
            }
        } else {
            debug!(entry = %name, root = %root.display(), "Registered entry from manifest import");
            entries.insert(name.clone(), EntryState::new(root));
        }
        Ok(entry_id(&name))
    }

    /// Load a module id previously returned by [`resolve`](Self::resolve).
    pub async fn load(&self, id: &str) -> Result<ModuleRecord> {
        if id == RUNTIME_ID {
            return Ok(ModuleRecord {
                id: RUNTIME_ID.to_string(),
                code: runtime_module_source().to_string(),
                asset: None,
                generation: 0,
                fingerprint: None,
            });
        }
        let name = id
            .strip_prefix(ENTRY_ID_PREFIX)
            .ok_or_else(|| WasmbedError::UnknownModule(id.to_string()))?;
        Ok(self.resolve_entry(name).await?.record())
    }

    /// Current node for `name`, building and embedding if it is missing or
    /// stale. Concurrent calls for one entry are serialized.
    pub async fn resolve_entry(&self, name: &str) -> Result<Arc<VirtualModuleNode>> {
        let (root, lock) = {
            let entries = locked(&self.entries);
            let state = entries
                .get(name)
                .ok_or_else(|| WasmbedError::UnknownEntry(name.to_string()))?;
            (state.root.clone(), Arc::clone(&state.lock))
        };
        let _serialized = lock.lock().await;

        if let Some(node) = self.fresh_node(name) {
            return Ok(node);
        }
        // A change landing after this point leaves the result stale.
        let epoch = self.epoch(name);

        let version = match self.compiler_version().await {
            Ok(version) => version,
            Err(err) => return Err(self.fail(name, err)),
        };
        let params = self.config.build_params(&version);
        let target_dir = self.config.target_dir_for(&root);

        let scanned =
            tokio::task::spawn_blocking(move || fingerprint_package(&root, &params).map(|r| (r, params)))
                .await
                .map_err(|e| WasmbedError::Task(e.to_string()));
        let ((identity, fingerprint), params) = match scanned {
            Ok(Ok(scanned)) => scanned,
            Ok(Err(err)) => return Err(self.fail(name, err.into())),
            Err(err) => return Err(self.fail(name, err)),
        };
        let roots = identity.watched_roots();
        self.track_roots(name, &roots);
        self.watch_roots(&roots);

        let span = obs::build_span(name, &fingerprint);
        async {
            let artifact = match self.cache.lookup(&fingerprint) {
                Some(artifact) => artifact,
                None => {
                    let request = BuildRequest::new(
                        Arc::new(identity),
                        params,
                        fingerprint,
                        target_dir,
                    );
                    let sink = Arc::new(BuildSink {
                        entry: name.to_string(),
                        cache: Arc::clone(&self.cache),
                        diagnostics: Arc::clone(&self.diagnostics),
                    });
                    let joined = self.invoker.build(request, sink).await;
                    if !joined.leader {
                        METRICS.inc_coalesced();
                    }
                    match joined.outcome {
                        Ok(artifact) => artifact,
                        Err(err) => {
                            // The build task reported to the leader's entry only.
                            if !joined.leader {
                                self.diagnostics.emit_all(translate_build_error(name, &err));
                            }
                            let err = WasmbedError::Build(err);
                            obs::emit_entry_failed(name, &err);
                            return Err(err);
                        }
                    }
                }
            };

            let embedded = match self.embedder.embed(&artifact, name, self.config.mode).await {
                Ok(embedded) => embedded,
                Err(err) => return Err(self.fail(name, err.into())),
            };

            Ok(self.install_node(name, artifact, embedded, epoch))
        }
        .instrument(span)
        .await
    }

    fn fresh_node(&self, name: &str) -> Option<Arc<VirtualModuleNode>> {
        let entries = locked(&self.entries);
        let state = entries.get(name)?;
        match &state.node {
            Some(node) if !state.stale => Some(Arc::clone(node)),
            _ => None,
        }
    }

    fn epoch(&self, name: &str) -> u64 {
        locked(&self.entries).get(name).map_or(0, |e| e.epoch)
    }

    fn track_roots(&self, name: &str, roots: &[PathBuf]) {
        if let Some(state) = locked(&self.entries).get_mut(name) {
            state.roots = roots.to_vec();
        }
    }

    /// Install a freshly embedded node. If a change arrived since `epoch`
    /// was read, the node is installed already stale.
    fn install_node(
        &self,
        name: &str,
        artifact: Arc<BuildArtifact>,
        embedded: EmbeddedModule,
        epoch: u64,
    ) -> Arc<VirtualModuleNode> {
        let mut entries = locked(&self.entries);
        let state = entries
            .entry(name.to_string())
            .or_insert_with(|| EntryState::new(artifact.metadata().package_root.clone()));
        state.generation += 1;
        let node = Arc::new(VirtualModuleNode {
            id: entry_id(name),
            entry: name.to_string(),
            generation: state.generation,
            embedded,
            artifact,
            invalidated: AtomicBool::new(false),
        });
        if let Some(previous) = state.node.replace(Arc::clone(&node)) {
            previous.invalidate();
        }
        state.stale = state.epoch != epoch;
        if state.stale {
            node.invalidate();
            debug!(
                entry = %name,
                generation = node.generation,
                "Sources changed during build, node is stale"
            );
        } else {
            debug!(entry = %name, generation = node.generation, "Installed module node");
        }
        node
    }

    async fn compiler_version(&self) -> Result<String> {
        let toolchain = self.invoker.toolchain();
        let version = self
            .compiler_version
            .get_or_try_init(|| async { toolchain.version().await })
            .await?;
        Ok(version.clone())
    }

    fn fail(&self, name: &str, err: WasmbedError) -> WasmbedError {
        self.diagnostics.emit_all(translate_error(name, &err));
        obs::emit_entry_failed(name, &err);
        err
    }

    fn watch_roots(&self, roots: &[PathBuf]) {
        let mut watched = locked(&self.watched);
        for root in roots {
            if watched.insert(root.clone()) {
                self.watch.watch_root(root);
            }
        }
    }

    /// React to a change on disk: drop affected cache entries and mark the
    /// entries built from them stale. Entries with a build in flight are
    /// marked too, so the build's result is installed stale. Returns the
    /// module ids the host should re-resolve.
    pub fn handle_change(&self, path: &Path) -> Vec<String> {
        let path = normalize_changed_path(path);
        let removed = self.cache.invalidate(&path);

        let mut affected = Vec::new();
        {
            let mut entries = locked(&self.entries);
            for (name, state) in entries.iter_mut() {
                let built_from = state.node.as_ref().is_some_and(|node| {
                    node.artifact.depends_on(&path) || removed.contains(&node.fingerprint())
                });
                if !built_from && !state.touches(&path) {
                    continue;
                }
                state.epoch += 1;
                if let Some(node) = &state.node {
                    state.stale = true;
                    node.invalidate();
                }
                affected.push(entry_id(name));
            }
        }

        obs::emit_watch_invalidated(&path, removed.len(), affected.len());
        affected
    }

    /// Resolve every entry concurrently.
    pub async fn build_all(&self) -> Vec<(String, Result<Arc<VirtualModuleNode>>)> {
        let names = self.entry_names();
        self.build_entries(&names).await
    }

    /// Resolve `names` concurrently. One failure never stops the others.
    pub async fn build_entries(
        &self,
        names: &[String],
    ) -> Vec<(String, Result<Arc<VirtualModuleNode>>)> {
        join_all(names.iter().map(|name| async move {
            let result = self.resolve_entry(name).await;
            (name.clone(), result)
        }))
        .await
    }
}

/// Artifact cache for `config`: bounded memory tier plus the on-disk store
/// when persistence is enabled.
pub fn open_cache(config: &PluginConfig) -> Result<ArtifactCache> {
    let cache = ArtifactCache::new(CacheLimits {
        max_entries: config.cache.max_entries,
        max_bytes: config.cache.max_bytes,
    });
    if !config.cache.persistent {
        return Ok(cache);
    }
    let store = FsArtifactStore::new(config.store_dir())?;
    Ok(cache.with_store(Arc::new(store)))
}

/// Canonical form of a changed path. Deleted files no longer canonicalize,
/// so fall back to their parent.
fn normalize_changed_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(file)) => std::fs::canonicalize(parent)
            .map(|p| p.join(file))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedMode;
    use wasmbed_toolchain::fakes::ScriptedToolchain;

    fn adapter_for(root: &Path, out: &Path) -> (ModuleGraphAdapter, Arc<ScriptedToolchain>) {
        adapter_with(root, out, ScriptedToolchain::new())
    }

    fn adapter_with(
        root: &Path,
        out: &Path,
        toolchain: ScriptedToolchain,
    ) -> (ModuleGraphAdapter, Arc<ScriptedToolchain>) {
        let mut config = PluginConfig::default();
        config.entries.insert("add".to_string(), root.to_path_buf());
        config.out_dir = out.to_path_buf();
        config.mode = EmbedMode::Inline;
        config.cache.persistent = false;
        config.cache.dir = out.join(".cache");

        let toolchain = Arc::new(toolchain);
        let cache = Arc::new(ArtifactCache::new(CacheLimits::default()));
        let adapter = ModuleGraphAdapter::new(
            config,
            cache,
            toolchain.clone(),
            Arc::new(NoopWatchHost),
        );
        (adapter, toolchain)
    }

    fn write_package(root: &Path, lib: &str) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(
            root.join("Cargo.toml"),
            "[package]\nname = \"add\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::write(root.join("src/lib.rs"), lib).unwrap();
    }

    #[test]
    fn test_resolve_specifiers() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _) = adapter_for(&dir.path().join("add"), dir.path());

        assert_eq!(
            adapter.resolve("wasm:add", None).unwrap().as_deref(),
            Some("\0wasmbed:entry:add")
        );
        assert_eq!(
            adapter.resolve(RUNTIME_SPECIFIER, None).unwrap().as_deref(),
            Some(RUNTIME_ID)
        );
        assert!(adapter.resolve("./main.js", None).unwrap().is_none());
        assert!(matches!(
            adapter.resolve("wasm:missing", None),
            Err(WasmbedError::UnknownEntry(_))
        ));
    }

    #[test]
    fn test_resolve_manifest_path_registers_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, _) = adapter_for(&dir.path().join("add"), dir.path());
        write_package(&dir.path().join("pkg").join("sub"), "pub fn sub() {}");

        let importer = dir.path().join("pkg").join("main.js");
        let id = adapter
            .resolve("./sub/Cargo.toml", Some(&importer))
            .unwrap()
            .expect("resolved");
        assert_eq!(id, entry_id("sub"));
        assert!(adapter.entry_names().contains(&"sub".to_string()));
    }

    #[tokio::test]
    async fn test_load_runtime_module() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, toolchain) = adapter_for(&dir.path().join("add"), dir.path());
        let record = adapter.load(RUNTIME_ID).await.unwrap();
        assert!(record.code.contains("export function decode"));
        assert_eq!(toolchain.invocations(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_entry_returns_same_node() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        write_package(&root, "pub fn add() {}");
        let (adapter, toolchain) = adapter_for(&root, dir.path());

        let first = adapter.resolve_entry("add").await.unwrap();
        let second = adapter.resolve_entry("add").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(toolchain.invocations(), 1);
    }

    #[tokio::test]
    async fn test_change_marks_stale_and_rebuilds_on_next_load() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        write_package(&root, "pub fn add() {}");
        let (adapter, toolchain) = adapter_for(&root, dir.path());

        let first = adapter.resolve_entry("add").await.unwrap();
        write_package(&root, "pub fn add() { }");
        let affected = adapter.handle_change(&root.join("src/lib.rs"));

        assert_eq!(affected, vec![entry_id("add")]);
        assert!(first.is_invalidated());
        assert!(adapter.is_stale("add"));
        // Pull model: nothing rebuilt yet.
        assert_eq!(toolchain.invocations(), 1);

        let second = adapter.resolve_entry("add").await.unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
        assert_eq!(second.generation, first.generation + 1);
        assert!(!second.is_invalidated());
        assert_eq!(toolchain.invocations(), 2);
    }

    #[tokio::test]
    async fn test_change_during_build_leaves_result_stale() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        write_package(&root, "pub fn add() {}");
        let (adapter, toolchain) = adapter_with(
            &root,
            dir.path(),
            ScriptedToolchain::new().with_delay(Duration::from_millis(200)),
        );

        let edit = async {
            while toolchain.invocations() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            write_package(&root, "pub fn add() -> i32 { 1 }");
            adapter.handle_change(&root.join("src/lib.rs"))
        };
        let (built, affected) = tokio::join!(adapter.resolve_entry("add"), edit);
        let built = built.unwrap();

        assert_eq!(affected, vec![entry_id("add")]);
        assert!(adapter.is_stale("add"));
        assert!(built.is_invalidated());

        let current = adapter.resolve_entry("add").await.unwrap();
        assert!(!Arc::ptr_eq(&built, &current));
        assert_ne!(built.fingerprint(), current.fingerprint());
        assert!(!adapter.is_stale("add"));
        assert_eq!(toolchain.invocations(), 2);
    }

    #[tokio::test]
    async fn test_change_before_first_load_is_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        write_package(&root, "pub fn add() {}");
        let (adapter, toolchain) = adapter_for(&root, dir.path());

        // Nothing built yet: the id is still reported and nothing is stale.
        let affected = adapter.handle_change(&root.join("src/lib.rs"));
        assert_eq!(affected, vec![entry_id("add")]);
        assert!(!adapter.is_stale("add"));

        let node = adapter.resolve_entry("add").await.unwrap();
        assert!(!node.is_invalidated());
        assert!(!adapter.is_stale("add"));
        assert_eq!(toolchain.invocations(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_change_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        write_package(&root, "pub fn add() {}");
        let (adapter, _) = adapter_for(&root, dir.path());

        adapter.resolve_entry("add").await.unwrap();
        let other = dir.path().join("elsewhere.txt");
        std::fs::write(&other, "x").unwrap();
        assert!(adapter.handle_change(&other).is_empty());
        assert!(!adapter.is_stale("add"));
    }

    #[tokio::test]
    async fn test_fingerprint_error_reaches_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("empty");
        std::fs::create_dir_all(&root).unwrap();
        let (adapter, toolchain) = adapter_for(&root, dir.path());

        let err = adapter.resolve_entry("add").await.unwrap_err();
        assert!(matches!(err, WasmbedError::Fingerprint(_)));
        assert!(adapter.diagnostics().has_errors("add"));
        assert_eq!(toolchain.invocations(), 0);
        assert!(adapter.cache().is_empty());
    }
}
