//! Filesystem watching for `wasmbed watch` and `wasmbed serve --watch`.
//!
//! ```text
//! filesystem events (notify)
//!   -> drop ignored paths (target, node_modules, .git, output and cache dirs, *.wasm)
//!   -> debounce per path
//!   -> ModuleGraphAdapter::handle_change
//!   -> invalidated module ids to the consumer
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wasmbed_core::{ModuleGraphAdapter, WatchHost};
use wasmbed_toolchain::fingerprint::IGNORED_DIRS;

/// Edits within this window collapse into one change.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

pub type RawEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// [`WatchHost`] backed by a `notify` watcher. Roots are added as the adapter
/// discovers them; raw events go to the receiver returned by [`new`](Self::new).
pub struct WatchBridge {
    watcher: Mutex<RecommendedWatcher>,
}

impl WatchBridge {
    pub fn new() -> Result<(Arc<Self>, RawEvents)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("failed to start filesystem watcher")?;

        Ok((
            Arc::new(Self {
                watcher: Mutex::new(watcher),
            }),
            raw_rx,
        ))
    }
}

impl WatchHost for WatchBridge {
    fn watch_root(&self, root: &Path) {
        let mut watcher = match self.watcher.lock() {
            Ok(watcher) => watcher,
            Err(poisoned) => poisoned.into_inner(),
        };
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => info!(path = %root.display(), "Watching package"),
            Err(e) => warn!(path = %root.display(), error = %e, "Failed to watch package"),
        }
    }
}

/// Paths whose changes never affect a build.
pub fn is_ignored(path: &Path, ignored_roots: &[PathBuf]) -> bool {
    if ignored_roots.iter().any(|root| path.starts_with(root)) {
        return true;
    }
    if path.extension().is_some_and(|ext| ext == "wasm") {
        return true;
    }
    path.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name)),
        _ => false,
    })
}

/// Debounce raw events, feed them to the adapter and forward the module ids
/// each change invalidated. Returns when either channel closes.
pub async fn pump_changes(
    adapter: Arc<ModuleGraphAdapter>,
    mut raw_rx: RawEvents,
    debounce: Duration,
    ignored_roots: Vec<PathBuf>,
    invalidated_tx: mpsc::Sender<Vec<String>>,
) {
    let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().copied().min();

        tokio::select! {
            biased;

            () = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = tokio::time::Instant::now();
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();

                let mut ids = BTreeSet::new();
                for path in ready {
                    pending.remove(&path);
                    ids.extend(adapter.handle_change(&path));
                }
                if !ids.is_empty()
                    && invalidated_tx.send(ids.into_iter().collect()).await.is_err()
                {
                    debug!("Invalidation receiver dropped, stopping watcher");
                    return;
                }
            }

            event = raw_rx.recv() => {
                match event {
                    Some(Ok(event)) => queue_event(&event, &ignored_roots, &mut pending, debounce),
                    Some(Err(e)) => warn!(error = %e, "Filesystem watcher error"),
                    None => {
                        debug!("Filesystem watcher channel closed, stopping");
                        return;
                    }
                }
            }
        }
    }
}

fn queue_event(
    event: &Event,
    ignored_roots: &[PathBuf],
    pending: &mut HashMap<PathBuf, tokio::time::Instant>,
    debounce: Duration,
) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
        _ => return,
    }
    for path in &event.paths {
        if is_ignored(path, ignored_roots) {
            continue;
        }
        debug!(path = %path.display(), kind = ?event.kind, "File change detected");
        pending.insert(path.clone(), tokio::time::Instant::now() + debounce);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, ModifyKind};
    use wasmbed_core::{ArtifactCache, CacheLimits, EmbedMode, NoopWatchHost, PluginConfig};
    use wasmbed_toolchain::fakes::ScriptedToolchain;

    #[test]
    fn test_ignored_paths() {
        let roots = vec![PathBuf::from("/w/dist"), PathBuf::from("/w/.wasmbed")];
        assert!(is_ignored(Path::new("/w/add/target/debug/x.d"), &roots));
        assert!(is_ignored(Path::new("/w/add/node_modules/a.js"), &roots));
        assert!(is_ignored(Path::new("/w/dist/assets/add.wasm"), &roots));
        assert!(is_ignored(Path::new("/w/.wasmbed/store/objects/ab/cd.json"), &roots));
        assert!(is_ignored(Path::new("/w/add/pkg/add_bg.wasm"), &roots));
        assert!(!is_ignored(Path::new("/w/add/src/lib.rs"), &roots));
        assert!(!is_ignored(Path::new("/w/add/Cargo.toml"), &roots));
    }

    #[tokio::test]
    async fn test_pump_forwards_invalidated_ids() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("add");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]\nname = \"add\"\nversion = \"0.1.0\"\n")
            .unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn add() {}").unwrap();

        let mut config = PluginConfig::default();
        config.entries.insert("add".to_string(), root.clone());
        config.out_dir = dir.path().join("dist");
        config.cache.persistent = false;
        config.mode = EmbedMode::Inline;
        let adapter = Arc::new(ModuleGraphAdapter::new(
            config,
            Arc::new(ArtifactCache::new(CacheLimits::default())),
            Arc::new(ScriptedToolchain::new()),
            Arc::new(NoopWatchHost),
        ));
        adapter.resolve_entry("add").await.unwrap();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (ids_tx, mut ids_rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump_changes(
            Arc::clone(&adapter),
            raw_rx,
            Duration::from_millis(10),
            Vec::new(),
            ids_tx,
        ));

        let lib = root.join("src/lib.rs");
        // Access events are not changes.
        raw_tx
            .send(Ok(Event::new(EventKind::Access(AccessKind::Any)).add_path(lib.clone())))
            .unwrap();
        raw_tx
            .send(Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(lib.clone())))
            .unwrap();
        raw_tx
            .send(Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(lib)))
            .unwrap();

        let ids = tokio::time::timeout(Duration::from_secs(5), ids_rx.recv())
            .await
            .expect("pump fired")
            .expect("channel open");
        assert_eq!(ids, vec![wasmbed_core::entry_id("add")]);
        assert!(adapter.is_stale("add"));

        drop(raw_tx);
        pump.await.unwrap();
    }
}
