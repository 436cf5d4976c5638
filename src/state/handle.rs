//! Injectable handle around the global state.
//!
//! Components receive a cloned `StateHandle` instead of reaching for a
//! module-level singleton, so tests can run several isolated instances
//! side by side.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::state::types::{GlobalAppState, TradingSnapshot};

#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<GlobalAppState>>,
}

impl StateHandle {
    pub fn new(state: GlobalAppState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Run a closure against the current state.
    pub async fn read<R>(&self, f: impl FnOnce(&GlobalAppState) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    /// Read-modify-replace. The closure sees the whole state and returns
    /// whatever the caller needs out of the critical section.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut GlobalAppState) -> R) -> R {
        let mut guard = self.inner.write().await;
        f(&mut guard)
    }

    /// The reduced serializable view published on the bus.
    pub async fn snapshot(&self) -> TradingSnapshot {
        let guard = self.inner.read().await;
        TradingSnapshot::of(&guard)
    }
}
