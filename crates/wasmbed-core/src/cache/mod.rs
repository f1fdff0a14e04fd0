//! In-memory artifact cache keyed by build fingerprint.
//!
//! Least-recently-used eviction once the configured entry or byte bound is
//! exceeded. An artifact still referenced outside the cache (by a live module
//! node, or a caller holding the `Arc`) is pinned and never evicted; the cache
//! may run over its bound until those references are dropped.
//!
//! An optional [`ArtifactStore`] backs the memory tier: misses fall through to
//! it, stores write through, and eviction or invalidation removes entries
//! from both.

pub mod fs;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use wasmbed_toolchain::{ArtifactMetadata, BuildArtifact, Digest};

use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache entry {fingerprint}: {reason}")]
    Corrupt { fingerprint: Digest, reason: String },

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache metadata error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Persistent tier behind the memory cache.
pub trait ArtifactStore: Send + Sync {
    fn load(&self, fingerprint: &Digest) -> Result<Option<BuildArtifact>>;

    /// Write `artifact`. Overwrites an existing entry for the same fingerprint.
    fn save(&self, artifact: &BuildArtifact) -> Result<()>;

    fn remove(&self, fingerprint: &Digest) -> Result<()>;

    /// Metadata of every stored artifact.
    fn list(&self) -> Result<Vec<ArtifactMetadata>>;

    /// Remove everything; returns the number of artifacts removed.
    fn clear(&self) -> Result<usize>;
}

/// Eviction bounds. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: Option<usize>,
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

struct Slot {
    artifact: Arc<BuildArtifact>,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<Digest, Slot>,
    clock: u64,
    bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, fingerprint: Digest, artifact: Arc<BuildArtifact>) {
        let last_used = self.tick();
        self.bytes += artifact.size();
        if let Some(old) = self.slots.insert(fingerprint, Slot { artifact, last_used }) {
            self.bytes -= old.artifact.size();
        }
    }

    fn remove(&mut self, fingerprint: &Digest) -> Option<Arc<BuildArtifact>> {
        let slot = self.slots.remove(fingerprint)?;
        self.bytes -= slot.artifact.size();
        Some(slot.artifact)
    }

    fn over(&self, limits: &CacheLimits) -> bool {
        limits.max_entries.is_some_and(|max| self.slots.len() > max)
            || limits.max_bytes.is_some_and(|max| self.bytes > max)
    }

    /// Least recently used entry nobody else holds.
    fn eviction_candidate(&self) -> Option<Digest> {
        self.slots
            .iter()
            .filter(|(_, slot)| Arc::strong_count(&slot.artifact) == 1)
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(fp, _)| *fp)
    }
}

pub struct ArtifactCache {
    state: Mutex<CacheState>,
    limits: CacheLimits,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl ArtifactCache {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            limits,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Return the artifact for `fingerprint`, consulting the persistent
    /// store on a memory miss.
    pub fn lookup(&self, fingerprint: &Digest) -> Option<Arc<BuildArtifact>> {
        {
            let mut state = self.state();
            let now = state.tick();
            if let Some(slot) = state.slots.get_mut(fingerprint) {
                slot.last_used = now;
                let artifact = Arc::clone(&slot.artifact);
                state.hits += 1;
                drop(state);
                METRICS.inc_cache_hits();
                obs::emit_cache_hit(fingerprint, false);
                return Some(artifact);
            }
        }

        let loaded = self.store.as_ref().and_then(|store| match store.load(fingerprint) {
            Ok(found) => found,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(16), error = %e, "Dropping unreadable cache entry");
                if let Err(e) = store.remove(fingerprint) {
                    debug!(error = %e, "Failed to remove unreadable cache entry");
                }
                None
            }
        });

        match loaded {
            Some(artifact) if artifact.fingerprint() == *fingerprint => {
                let artifact = Arc::new(artifact);
                {
                    let mut state = self.state();
                    state.hits += 1;
                    state.insert(*fingerprint, Arc::clone(&artifact));
                }
                METRICS.inc_cache_hits();
                obs::emit_cache_hit(fingerprint, true);
                self.evict_over_limit();
                Some(artifact)
            }
            _ => {
                self.state().misses += 1;
                METRICS.inc_cache_misses();
                None
            }
        }
    }

    /// Insert an artifact, writing through to the persistent store, then
    /// evict down to the configured bounds. Returns evicted fingerprints.
    pub fn store(&self, fingerprint: Digest, artifact: Arc<BuildArtifact>) -> Vec<Digest> {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&artifact) {
                warn!(fingerprint = %fingerprint.short(16), error = %e, "Failed to persist artifact");
            }
        }
        self.state().insert(fingerprint, artifact);
        debug!(fingerprint = %fingerprint.short(16), "Cached artifact");
        self.evict_over_limit()
    }

    fn evict_over_limit(&self) -> Vec<Digest> {
        let mut evicted = Vec::new();
        {
            let mut state = self.state();
            while state.over(&self.limits) {
                let Some(victim) = state.eviction_candidate() else {
                    debug!(
                        entries = state.slots.len(),
                        bytes = state.bytes,
                        "Cache over bound but every entry is pinned"
                    );
                    break;
                };
                if let Some(artifact) = state.remove(&victim) {
                    state.evictions += 1;
                    evicted.push((victim, artifact.size()));
                }
            }
        }

        for (fingerprint, size) in &evicted {
            METRICS.inc_evictions();
            obs::emit_cache_evicted(fingerprint, *size);
            self.remove_from_store(fingerprint);
        }
        evicted.into_iter().map(|(fp, _)| fp).collect()
    }

    /// Drop every artifact built from a root containing `changed` (or
    /// contained by it, for directory events). Returns the removed
    /// fingerprints.
    pub fn invalidate(&self, changed: &Path) -> Vec<Digest> {
        let mut removed: Vec<Digest> = {
            let mut state = self.state();
            let stale: Vec<Digest> = state
                .slots
                .iter()
                .filter(|(_, slot)| slot.artifact.depends_on(changed))
                .map(|(fp, _)| *fp)
                .collect();
            for fp in &stale {
                state.remove(fp);
            }
            state.invalidations += stale.len() as u64;
            stale
        };

        if let Some(store) = &self.store {
            match store.list() {
                Ok(entries) => {
                    for meta in entries {
                        let affected = meta
                            .watched_roots
                            .iter()
                            .any(|root| changed.starts_with(root) || root.starts_with(changed));
                        if affected && !removed.contains(&meta.fingerprint) {
                            removed.push(meta.fingerprint);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list persistent cache"),
            }
            for fp in &removed {
                self.remove_from_store(fp);
            }
        }

        if !removed.is_empty() {
            METRICS.inc_invalidations(removed.len() as u64);
            debug!(path = %changed.display(), count = removed.len(), "Invalidated artifacts");
        }
        removed
    }

    pub fn remove(&self, fingerprint: &Digest) -> Option<Arc<BuildArtifact>> {
        let removed = self.state().remove(fingerprint);
        self.remove_from_store(fingerprint);
        removed
    }

    /// Empty the memory tier and the persistent store.
    pub fn clear(&self) -> Result<usize> {
        let mut count = {
            let mut state = self.state();
            let count = state.slots.len();
            state.slots.clear();
            state.bytes = 0;
            count
        };
        if let Some(store) = &self.store {
            count = count.max(store.clear()?);
        }
        Ok(count)
    }

    pub fn contains(&self, fingerprint: &Digest) -> bool {
        self.state().slots.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.slots.len(),
            bytes: state.bytes,
            pinned: state
                .slots
                .values()
                .filter(|slot| Arc::strong_count(&slot.artifact) > 1)
                .count(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            invalidations: state.invalidations,
        }
    }

    fn remove_from_store(&self, fingerprint: &Digest) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(fingerprint) {
                warn!(fingerprint = %fingerprint.short(16), error = %e, "Failed to remove persisted artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{artifact, artifact_at};

    fn bounded(max_entries: usize) -> ArtifactCache {
        ArtifactCache::new(CacheLimits {
            max_entries: Some(max_entries),
            max_bytes: None,
        })
    }

    fn put(cache: &ArtifactCache, seed: &[u8]) -> Digest {
        let a = artifact("add", seed);
        let fp = a.fingerprint();
        cache.store(fp, Arc::new(a));
        fp
    }

    #[test]
    fn test_lookup_returns_same_reference() {
        let cache = bounded(4);
        let fp = put(&cache, b"a");
        let first = cache.lookup(&fp).unwrap();
        let second = cache.lookup(&fp).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_miss_is_counted() {
        let cache = bounded(4);
        assert!(cache.lookup(&Digest::compute(b"nope")).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = bounded(2);
        let a = put(&cache, b"a");
        let b = put(&cache, b"b");
        // Touch a so b becomes least recently used.
        drop(cache.lookup(&a));
        let c = put(&cache, b"c");

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_pinned_artifacts_are_not_evicted() {
        let cache = bounded(1);
        let a = put(&cache, b"a");
        let pinned = cache.lookup(&a).unwrap();

        let b = put(&cache, b"b");
        // a is pinned, b is the only candidate.
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        drop(pinned);
    }

    #[test]
    fn test_all_pinned_overflows_bound() {
        let cache = bounded(1);
        let first = Arc::new(artifact("add", b"a"));
        let second = Arc::new(artifact("add", b"b"));
        cache.store(first.fingerprint(), Arc::clone(&first));
        let evicted = cache.store(second.fingerprint(), Arc::clone(&second));

        assert!(evicted.is_empty());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().pinned, 2);

        drop(first);
        let evicted = cache.store(second.fingerprint(), Arc::clone(&second));
        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_byte_bound() {
        let a = artifact("add", b"a");
        let cache = ArtifactCache::new(CacheLimits {
            max_entries: None,
            max_bytes: Some(a.size() + 1),
        });
        cache.store(a.fingerprint(), Arc::new(a));
        put(&cache, b"b");
        assert_eq!(cache.len(), 1);
        assert!(cache.stats().bytes <= cache.limits().max_bytes.unwrap());
    }

    #[test]
    fn test_invalidate_by_changed_path() {
        let cache = bounded(8);
        let add = artifact_at("/w/add", b"a");
        let sub = artifact_at("/w/sub", b"b");
        let (add_fp, sub_fp) = (add.fingerprint(), sub.fingerprint());
        cache.store(add_fp, Arc::new(add));
        cache.store(sub_fp, Arc::new(sub));

        let removed = cache.invalidate(Path::new("/w/add/src/lib.rs"));
        assert_eq!(removed, vec![add_fp]);
        assert!(!cache.contains(&add_fp));
        assert!(cache.contains(&sub_fp));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_ignores_unrelated_paths() {
        let cache = bounded(8);
        let fp = put(&cache, b"a");
        assert!(cache.invalidate(Path::new("/elsewhere/file.rs")).is_empty());
        assert!(cache.contains(&fp));
    }

    #[test]
    fn test_store_fallthrough() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(fs::FsArtifactStore::new(dir.path()).unwrap());

        let fp = {
            let cache = bounded(4).with_store(Arc::clone(&store));
            put(&cache, b"persisted")
        };

        let fresh = bounded(4).with_store(store);
        let loaded = fresh.lookup(&fp).expect("loaded from store");
        assert_eq!(loaded.fingerprint(), fp);
        assert!(fresh.contains(&fp));
    }

    #[test]
    fn test_clear() {
        let cache = bounded(4);
        put(&cache, b"a");
        put(&cache, b"b");
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().bytes, 0);
    }
}
