//! Harness pool
//!
//! The pool owns every harness its spawners produced and hands them out
//! through `Lease`s:
//! - `checkout` reuses an idle harness of the requested spawner, or spawns a
//!   new one outside the pool lock so concurrent spawns do not serialise
//! - `checkin` returns a harness for reuse; a harness whose node died is
//!   disposed instead
//! - `dispose_all` tears down idle and checked-out harnesses alike and
//!   collects every failure
//!
//! Lock order is pool state first, then an individual harness. Harness
//! locks are never taken by `dispose_all` while the pool lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{DisposalError, HarnessError};
use crate::harness::{Harness, HarnessId, HarnessState};
use crate::spawner::{CancelToken, ChainSpawner};

/// Errors from pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no spawner named '{0}' is registered")]
    UnknownSpawner(String),

    #[error("a spawner named '{0}' is already registered")]
    DuplicateSpawner(String),

    #[error("harness {0} does not belong to this pool")]
    UnknownHarness(HarnessId),

    #[error("harness {0} is not checked out")]
    NotCheckedOut(HarnessId),

    #[error("pool is closed")]
    Closed,

    #[error(transparent)]
    Spawn(#[from] HarnessError),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Exclusive access to one checked-out harness.
///
/// Return it with `HarnessPool::checkin`. A lease that is simply dropped
/// keeps its harness checked out until `dispose_all`.
#[derive(Debug)]
pub struct Lease {
    id: HarnessId,
    spawner: String,
    harness: Arc<Mutex<Harness>>,
}

impl Lease {
    pub fn id(&self) -> &HarnessId {
        &self.id
    }

    pub fn spawner(&self) -> &str {
        &self.spawner
    }

    /// Lock the harness for use
    pub fn lock(&self) -> MutexGuard<'_, Harness> {
        self.harness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the harness locked
    pub fn with<R>(&self, f: impl FnOnce(&mut Harness) -> R) -> R {
        f(&mut self.lock())
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub spawners: usize,
    pub idle: usize,
    pub in_use: usize,
    pub disposed: u64,
    pub closed: bool,
}

struct Slot {
    spawner: String,
    harness: Arc<Mutex<Harness>>,
    in_use: bool,
}

struct PoolState {
    spawners: HashMap<String, Arc<ChainSpawner>>,
    default_spawner: String,
    slots: HashMap<HarnessId, Slot>,
    /// Idle harness ids per spawner, most recently returned last
    idle: HashMap<String, Vec<HarnessId>>,
    disposed: u64,
    closed: bool,
}

/// Move `harness` to `target`; the pool only asks for valid transitions,
/// so a refusal means its bookkeeping and the harness disagree.
fn set_state(harness: &mut Harness, target: HarnessState) {
    if let Err(e) = harness.transition(target) {
        warn!(harness = %harness.id(), error = %e, "unexpected harness state");
    }
}

/// Dispose a harness already unlinked from the pool
fn dispose_slot(id: &HarnessId, slot: Slot) {
    let mut harness = slot.harness.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = harness.dispose() {
        warn!(harness = %id, error = %e, "failed to dispose dead harness");
    }
}

/// Registry of spawners and the harnesses they produced.
pub struct HarnessPool {
    state: Mutex<PoolState>,
}

impl HarnessPool {
    /// Pool with `default_spawner` registered
    pub fn new(default_spawner: Arc<ChainSpawner>) -> Self {
        let name = default_spawner.name().to_string();
        let mut spawners = HashMap::new();
        spawners.insert(name.clone(), default_spawner);
        Self {
            state: Mutex::new(PoolState {
                spawners,
                default_spawner: name,
                slots: HashMap::new(),
                idle: HashMap::new(),
                disposed: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add another recipe. Names must be unique.
    pub fn register_spawner(&self, spawner: Arc<ChainSpawner>) -> PoolResult<()> {
        let mut state = self.lock();
        let name = spawner.name().to_string();
        if state.spawners.contains_key(&name) {
            return Err(PoolError::DuplicateSpawner(name));
        }
        debug!(spawner = %name, "registered spawner");
        state.spawners.insert(name, spawner);
        Ok(())
    }

    pub fn spawner(&self, name: &str) -> Option<Arc<ChainSpawner>> {
        self.lock().spawners.get(name).cloned()
    }

    pub fn default_spawner(&self) -> String {
        self.lock().default_spawner.clone()
    }

    /// Check out a harness of the default spawner
    pub fn checkout_default(&self) -> PoolResult<Lease> {
        let name = self.default_spawner();
        self.checkout(&name)
    }

    /// Check out a harness produced by `spawner`.
    pub fn checkout(&self, spawner: &str) -> PoolResult<Lease> {
        self.checkout_with_cancel(spawner, &CancelToken::new())
    }

    /// As `checkout`; a spawn in progress is abandoned once `cancel` fires.
    pub fn checkout_with_cancel(&self, spawner: &str, cancel: &CancelToken) -> PoolResult<Lease> {
        let mut dead = Vec::new();
        let (reused, recipe) = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let recipe = state
                .spawners
                .get(spawner)
                .cloned()
                .ok_or_else(|| PoolError::UnknownSpawner(spawner.to_string()))?;
            (Self::take_idle(&mut state, spawner, &mut dead), recipe)
        };

        for (id, slot) in dead {
            warn!(harness = %id, "node died while idle, disposing instead of reusing");
            dispose_slot(&id, slot);
        }
        if let Some(lease) = reused {
            debug!(harness = %lease.id, spawner, "reusing idle harness");
            return Ok(lease);
        }

        // Spawn without holding the pool lock
        let mut harness = recipe.spawn_with_cancel(cancel)?;

        let mut state = self.lock();
        if state.closed {
            drop(state);
            if let Err(e) = harness.dispose() {
                warn!(harness = %harness.id(), error = %e, "failed to dispose harness spawned after close");
            }
            return Err(PoolError::Closed);
        }

        set_state(&mut harness, HarnessState::InUse);
        let id = harness.id().clone();
        let harness = Arc::new(Mutex::new(harness));
        state.slots.insert(
            id.clone(),
            Slot {
                spawner: spawner.to_string(),
                harness: Arc::clone(&harness),
                in_use: true,
            },
        );
        Ok(Lease {
            id,
            spawner: spawner.to_string(),
            harness,
        })
    }

    /// Most recently returned idle harness of `spawner` whose node is still
    /// running. Dead ones met on the way are unlinked into `dead`.
    fn take_idle(state: &mut PoolState, spawner: &str, dead: &mut Vec<(HarnessId, Slot)>) -> Option<Lease> {
        while let Some(id) = state.idle.get_mut(spawner).and_then(Vec::pop) {
            let Some(slot) = state.slots.get_mut(&id) else {
                continue;
            };
            let mut harness = slot.harness.lock().unwrap_or_else(PoisonError::into_inner);
            if !harness.node().is_running() {
                drop(harness);
                if let Some(slot) = state.slots.remove(&id) {
                    state.disposed += 1;
                    dead.push((id, slot));
                }
                continue;
            }
            set_state(&mut harness, HarnessState::InUse);
            drop(harness);
            slot.in_use = true;
            return Some(Lease {
                id,
                spawner: spawner.to_string(),
                harness: Arc::clone(&slot.harness),
            });
        }
        None
    }

    /// Return a harness for reuse by later checkouts of the same spawner.
    pub fn checkin(&self, lease: Lease) -> PoolResult<()> {
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(&lease.id)
            .ok_or_else(|| PoolError::UnknownHarness(lease.id.clone()))?;
        if !slot.in_use {
            return Err(PoolError::NotCheckedOut(lease.id.clone()));
        }

        let mut harness = slot.harness.lock().unwrap_or_else(PoisonError::into_inner);
        if !harness.node().is_running() {
            drop(harness);
            let slot = state.slots.remove(&lease.id);
            state.disposed += 1;
            drop(state);
            warn!(harness = %lease.id, "node died while checked out, disposing instead of reusing");
            if let Some(slot) = slot {
                dispose_slot(&lease.id, slot);
            }
            return Ok(());
        }
        set_state(&mut harness, HarnessState::Idle);
        drop(harness);

        slot.in_use = false;
        let spawner = slot.spawner.clone();
        state.idle.entry(spawner).or_default().push(lease.id.clone());
        debug!(harness = %lease.id, "harness checked in");
        Ok(())
    }

    /// Dispose every harness, idle or checked out.
    ///
    /// Keeps going past failures and reports all of them. The pool stays
    /// usable afterwards; calling this again with nothing left is a no-op.
    pub fn dispose_all(&self) -> Result<(), DisposalError> {
        let slots: Vec<(HarnessId, Slot)> = {
            let mut state = self.lock();
            state.idle.clear();
            let drained: Vec<_> = state.slots.drain().collect();
            state.disposed += drained.len() as u64;
            drained
        };
        if slots.is_empty() {
            return Ok(());
        }

        let count = slots.len();
        let mut errors = DisposalError::new();
        for (id, slot) in slots {
            let mut harness = slot.harness.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.in_use {
                debug!(harness = %id, "disposing harness that is still checked out");
            }
            if let Err(e) = harness.dispose() {
                errors.extend(e);
            }
        }

        if errors.is_empty() {
            info!(harnesses = count, "disposed all harnesses");
        } else {
            warn!(harnesses = count, failures = errors.len(), "disposed all harnesses with failures");
        }
        errors.into_result()
    }

    /// Refuse further checkouts, then dispose everything.
    ///
    /// A spawn already in flight is disposed when it completes.
    pub fn close(&self) -> Result<(), DisposalError> {
        self.lock().closed = true;
        self.dispose_all()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let in_use = state.slots.values().filter(|s| s.in_use).count();
        PoolStats {
            spawners: state.spawners.len(),
            idle: state.slots.len() - in_use,
            in_use,
            disposed: state.disposed,
            closed: state.closed,
        }
    }
}
