//! Warm bridges keyed by composed environment key.
//!
//! The pool keeps up to `capacity` slots in least-recently-used order. A
//! lease holds its slot's lock, so a bridge serves one session at a time.
//! Requesting a key that is not pooled evicts the coldest slot once the
//! pool is full; an evicted bridge still in use is retired when its lease
//! is released.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use vessel_types::{EnvironmentKey, VesselError};

/// What the pool needs from a bridge.
pub trait PooledBridge: Send + 'static {
    /// True if the bridge can serve another run.
    fn is_alive(&mut self) -> bool;

    /// Tear the bridge down. Called for dead, discarded and evicted bridges.
    fn retire(self);
}

type Cell<B> = Arc<AsyncMutex<Option<B>>>;

struct Slot<B> {
    key: EnvironmentKey,
    id: u64,
    cell: Cell<B>,
}

struct PoolState<B> {
    /// Most recently used first.
    slots: Vec<Slot<B>>,
    next_id: u64,
}

impl<B> PoolState<B> {
    fn is_current(&self, id: u64) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }
}

pub struct BridgePool<B: PooledBridge> {
    state: Arc<Mutex<PoolState<B>>>,
    capacity: usize,
}

impl<B: PooledBridge> std::fmt::Debug for BridgePool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgePool")
            .field("capacity", &self.capacity)
            .field("slots", &self.len())
            .finish()
    }
}

impl<B: PooledBridge> BridgePool<B> {
    /// A pool with `capacity` warm slots (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                slots: Vec::new(),
                next_id: 1,
            })),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<B>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `key` most recently used, creating its slot if needed.
    fn touch(&self, key: EnvironmentKey) -> (u64, Cell<B>) {
        let mut state = self.lock();
        if let Some(pos) = state.slots.iter().position(|slot| slot.key == key) {
            let slot = state.slots.remove(pos);
            let found = (slot.id, slot.cell.clone());
            state.slots.insert(0, slot);
            return found;
        }
        let id = state.next_id;
        state.next_id += 1;
        let cell: Cell<B> = Arc::new(AsyncMutex::new(None));
        state.slots.insert(
            0,
            Slot {
                key,
                id,
                cell: cell.clone(),
            },
        );
        while state.slots.len() > self.capacity {
            if let Some(evicted) = state.slots.pop() {
                tracing::debug!(key = %evicted.key.short(), "evicting warm bridge");
                retire_idle(evicted.cell);
            }
        }
        (id, cell)
    }

    /// Lease the bridge for `key`, starting one with `start` if the slot is
    /// empty or its bridge has died.
    pub async fn lease<F, Fut>(&self, key: EnvironmentKey, start: F) -> Result<BridgeLease<B>, VesselError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B, VesselError>>,
    {
        loop {
            let (slot_id, cell) = self.touch(key);
            let mut guard = cell.lock_owned().await;
            if !self.lock().is_current(slot_id) {
                // Evicted while we waited for the previous holder.
                if let Some(bridge) = guard.take() {
                    bridge.retire();
                }
                continue;
            }

            let mut reused = false;
            if let Some(bridge) = guard.as_mut() {
                if bridge.is_alive() {
                    reused = true;
                } else {
                    tracing::warn!(key = %key.short(), "discarding dead bridge");
                    if let Some(dead) = guard.take() {
                        dead.retire();
                    }
                }
            }
            if !reused {
                *guard = Some(start().await?);
            }
            return Ok(BridgeLease {
                guard,
                key,
                slot_id,
                state: self.state.clone(),
                reused,
                discard: false,
            });
        }
    }

    /// Number of slots, occupied or not.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `key` currently has a slot.
    pub fn contains(&self, key: &EnvironmentKey) -> bool {
        self.lock().slots.iter().any(|slot| &slot.key == key)
    }

    /// Drop every slot. Leased bridges are retired on release.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut self.lock().slots);
        for slot in slots {
            retire_idle(slot.cell);
        }
    }
}

/// Retire the bridge in `cell` now if nobody holds it.
fn retire_idle<B: PooledBridge>(cell: Cell<B>) {
    if let Ok(mut guard) = cell.try_lock() {
        if let Some(bridge) = guard.take() {
            bridge.retire();
        }
    }
}

/// Exclusive use of one pooled bridge. Dropping it returns the bridge.
pub struct BridgeLease<B: PooledBridge> {
    guard: OwnedMutexGuard<Option<B>>,
    key: EnvironmentKey,
    slot_id: u64,
    state: Arc<Mutex<PoolState<B>>>,
    reused: bool,
    discard: bool,
}

impl<B: PooledBridge> BridgeLease<B> {
    pub fn key(&self) -> EnvironmentKey {
        self.key
    }

    /// True if the bridge was already warm when leased.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn bridge(&mut self) -> Result<&mut B, VesselError> {
        self.guard
            .as_mut()
            .ok_or_else(|| VesselError::InvariantViolation("lease holds no bridge".to_string()))
    }

    /// Retire the bridge on release instead of keeping it warm.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<B: PooledBridge> Drop for BridgeLease<B> {
    fn drop(&mut self) {
        let evicted = !self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_current(self.slot_id);
        let dead = match self.guard.as_mut() {
            Some(bridge) => !bridge.is_alive(),
            None => false,
        };
        if self.discard || evicted || dead {
            if let Some(bridge) = self.guard.take() {
                tracing::debug!(
                    key = %self.key.short(),
                    discard = self.discard,
                    evicted,
                    dead,
                    "retiring bridge on release"
                );
                bridge.retire();
            }
        }
    }
}
