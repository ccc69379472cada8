//! Content-addressed cache of built environments.
//!
//! At most one build runs per key. Concurrent callers for the same key
//! await the same in-flight build and all observe its outcome. Builds run
//! on their own task, so a caller that gives up never aborts the build for
//! the others. Failures are not remembered: the next acquisition retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use vessel_types::{EnvironmentKey, VesselError};

use crate::handle::RuntimeHandle;

type BuildOutcome = Result<Arc<RuntimeHandle>, VesselError>;
type SharedBuild = Shared<BoxFuture<'static, BuildOutcome>>;

enum Entry {
    Ready(Arc<RuntimeHandle>),
    Building { generation: u64, build: SharedBuild },
}

/// Map from environment key to built runtime.
pub struct EnvironmentCache {
    entries: Arc<Mutex<HashMap<EnvironmentKey, Entry>>>,
    next_generation: AtomicU64,
}

impl Default for EnvironmentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvironmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl EnvironmentCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Return the runtime for `key`, building it with `build` if needed.
    ///
    /// `build` is only called when no build for `key` is cached or in
    /// flight. It must be cheap to call; the returned future does the work.
    pub async fn acquire<F, Fut>(&self, key: EnvironmentKey, build: F) -> BuildOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RuntimeHandle, VesselError>> + Send + 'static,
    {
        let pending = {
            let mut entries = self.lock();
            match entries.get(&key) {
                Some(Entry::Ready(handle)) => {
                    tracing::trace!(key = %key.short(), "environment cache hit");
                    return Ok(handle.clone());
                }
                Some(Entry::Building { build, .. }) => {
                    tracing::debug!(key = %key.short(), "joining in-flight build");
                    build.clone()
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(key = %key.short(), generation, "starting build");
                    let shared = self.spawn_build(key, generation, build());
                    entries.insert(
                        key,
                        Entry::Building {
                            generation,
                            build: shared.clone(),
                        },
                    );
                    shared
                }
            }
        };
        pending.await
    }

    fn spawn_build<Fut>(&self, key: EnvironmentKey, generation: u64, build: Fut) -> SharedBuild
    where
        Fut: Future<Output = Result<RuntimeHandle, VesselError>> + Send + 'static,
    {
        let entries = self.entries.clone();
        let task = tokio::spawn(async move {
            let outcome = build.await.map(Arc::new);
            let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
            // Leave the slot alone if it was evicted or replaced meanwhile.
            let ours = matches!(
                entries.get(&key),
                Some(Entry::Building { generation: g, .. }) if *g == generation
            );
            if ours {
                match &outcome {
                    Ok(handle) => {
                        entries.insert(key, Entry::Ready(handle.clone()));
                    }
                    Err(err) => {
                        tracing::debug!(key = %key.short(), "build failed: {}", err);
                        entries.remove(&key);
                    }
                }
            }
            outcome
        });
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(VesselError::InvariantViolation(format!(
                    "environment build task failed: {e}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EnvironmentKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cached runtime for `key`, if it is fully built.
    pub fn get(&self, key: &EnvironmentKey) -> Option<Arc<RuntimeHandle>> {
        match self.lock().get(key) {
            Some(Entry::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// True if `key` is built or being built.
    pub fn contains(&self, key: &EnvironmentKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Forget `key`. An in-flight build keeps running but is not recorded.
    pub fn evict(&self, key: &EnvironmentKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
