//! Single-flight execution keyed by fingerprint.
//!
//! The first caller for a key spawns the work on the runtime; every caller
//! that arrives while it is running awaits the same shared result. Work is
//! detached from its callers: if all of them are cancelled the task still
//! runs to completion. The key is released when the task finishes, so a
//! later call starts fresh work (failures are never memoized here).

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

/// The spawned task panicked or was cancelled by runtime shutdown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("in-flight task aborted: {0}")]
pub struct FlightAborted(pub String);

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, FlightAborted>>>;

/// Outcome of joining a flight.
#[derive(Debug, Clone)]
pub struct Joined<V> {
    pub value: Result<V, FlightAborted>,
    /// True for the caller that started the work.
    pub leader: bool,
}

pub struct SingleFlight<K, V>
where
    V: Clone,
{
    inflight: Arc<Mutex<HashMap<K, SharedResult<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Removes the key when the spawned task ends, including on panic.
struct ReleaseOnDrop<K: Eq + Hash, V: Clone> {
    key: Option<K>,
    inflight: Arc<Mutex<HashMap<K, SharedResult<V>>>>,
}

impl<K: Eq + Hash, V: Clone> Drop for ReleaseOnDrop<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Ok(mut map) = self.inflight.lock() {
                map.remove(&key);
            }
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Join the flight for `key`, starting `work` if none is running.
    ///
    /// `work` is only invoked by the leader. Must be called from within a
    /// tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Joined<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (shared, leader) = {
            let mut map = match self.inflight.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };

            if let Some(existing) = map.get(&key) {
                (existing.clone(), false)
            } else {
                let guard = ReleaseOnDrop {
                    key: Some(key.clone()),
                    inflight: Arc::clone(&self.inflight),
                };
                let fut = work();
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    fut.await
                });
                let shared = handle
                    .map(|joined| joined.map_err(|e| FlightAborted(e.to_string())))
                    .boxed()
                    .shared();
                map.insert(key, shared.clone());
                (shared, true)
            }
        };

        Joined {
            value: shared.await,
            leader,
        }
    }
}
