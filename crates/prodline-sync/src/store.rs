//! Canonical state cell.
//!
//! The store is the only writer of [`SimulationState`]. Every mutation runs
//! under one lock, produces a complete new state, bumps the revision, and is
//! announced to each subscriber in registration order. Announcements are not
//! coalesced: a replace with an equal value is still a change.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prodline_model::SimulationState;
use tokio::sync::mpsc;

/// A published state, tagged with a monotonically increasing revision.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub revision: u64,
    pub state: Arc<SimulationState>,
}

struct StoreInner {
    state: Arc<SimulationState>,
    revision: u64,
    subscribers: Vec<mpsc::UnboundedSender<StateChange>>,
}

impl StoreInner {
    fn commit(&mut self, next: SimulationState) -> StateChange {
        self.state = Arc::new(next);
        self.revision += 1;
        let change = StateChange {
            revision: self.revision,
            state: Arc::clone(&self.state),
        };
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        change
    }
}

/// Shared handle to the canonical state. Clones refer to the same cell.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(SimulationState::default())
    }
}

impl StateStore {
    pub fn new(initial: SimulationState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                state: Arc::new(initial),
                revision: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    // The cell holds plain data, so a panic inside a mutator leaves the
    // previous state intact and the lock can be reclaimed.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current canonical state.
    pub fn current(&self) -> Arc<SimulationState> {
        Arc::clone(&self.lock().state)
    }

    /// Number of mutations applied so far.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Overwrite the canonical state.
    pub fn replace(&self, state: SimulationState) -> StateChange {
        self.lock().commit(state)
    }

    /// Apply a transformation to a copy of the current state and publish the
    /// result. No other mutation can interleave with `f`.
    ///
    /// If `f` panics the canonical state is left unchanged.
    pub fn patch<R>(&self, f: impl FnOnce(&mut SimulationState) -> R) -> R {
        let mut inner = self.lock();
        let mut next = SimulationState::clone(&inner.state);
        let out = f(&mut next);
        inner.commit(next);
        out
    }

    /// Like [`patch`](Self::patch), but publishes only when `f` returns
    /// `Some`. Returning `None` discards the copy and leaves the revision as is.
    pub fn try_patch<R>(&self, f: impl FnOnce(&mut SimulationState) -> Option<R>) -> Option<R> {
        let mut inner = self.lock();
        let mut next = SimulationState::clone(&inner.state);
        let out = f(&mut next)?;
        inner.commit(next);
        Some(out)
    }

    /// Register for change notifications.
    ///
    /// Receivers that are dropped are pruned on the next mutation.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    pub fn is_running(&self) -> bool {
        self.lock().state.is_running
    }

    pub fn total_products(&self) -> u64 {
        self.lock().state.total_products()
    }
}
