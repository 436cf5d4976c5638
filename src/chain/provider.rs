//! Redundant provider pool with block-height based failover.
//!
//! Each endpoint reports new block headers through `on_new_block`. The pool
//! only tracks heights and decides *whether* to fail over; the side effects
//! of a switch (stack reinit, subscription and ticker restarts) belong to
//! the app layer, which receives the decision as plain data.

use std::sync::RwLock;
use std::time::Duration;

/// Connection state of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderHealth {
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect campaign exhausted; excluded from failover comparisons
    /// until an inbound connect resets it.
    Unavailable,
}

/// A failover the caller must enact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failover {
    pub from: usize,
    pub to: usize,
    pub current_height: u64,
    pub candidate_height: u64,
}

#[derive(Debug)]
struct PoolInner {
    current: usize,
    blocks: Vec<u64>,
    health: Vec<ProviderHealth>,
}

/// Tracks per-endpoint block heights and the currently selected provider.
#[derive(Debug)]
pub struct ProviderPool {
    endpoints: Vec<String>,
    max_block_drift: u64,
    inner: RwLock<PoolInner>,
}

impl ProviderPool {
    pub fn new(endpoints: Vec<String>, max_block_drift: u64) -> Self {
        let n = endpoints.len();
        Self {
            endpoints,
            max_block_drift,
            inner: RwLock::new(PoolInner {
                current: 0,
                blocks: vec![0; n],
                health: vec![ProviderHealth::Connected; n],
            }),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn url(&self, index: usize) -> Option<&str> {
        self.endpoints.get(index).map(String::as_str)
    }

    pub fn current_index(&self) -> usize {
        self.inner.read().expect("pool lock").current
    }

    pub fn block_height(&self, index: usize) -> u64 {
        let inner = self.inner.read().expect("pool lock");
        inner.blocks.get(index).copied().unwrap_or(0)
    }

    pub fn health(&self, index: usize) -> ProviderHealth {
        let inner = self.inner.read().expect("pool lock");
        inner
            .health
            .get(index)
            .copied()
            .unwrap_or(ProviderHealth::Unavailable)
    }

    /// Select a provider. Returns false when `index` is already current
    /// (switching to the same index is a no-op) or out of range.
    pub fn select(&self, index: usize) -> bool {
        let mut inner = self.inner.write().expect("pool lock");
        if index >= self.endpoints.len() || inner.current == index {
            return false;
        }
        inner.current = index;
        true
    }

    /// Record a block header from endpoint `index`. Returns the failover
    /// the caller should perform, if the header proves the current
    /// provider is lagging by more than `max_block_drift`.
    pub fn on_new_block(&self, index: usize, height: u64) -> Option<Failover> {
        let mut inner = self.inner.write().expect("pool lock");
        if index >= inner.blocks.len() {
            return None;
        }
        if height > inner.blocks[index] {
            inner.blocks[index] = height;
        }
        inner.health[index] = ProviderHealth::Connected;

        let current = inner.current;
        if index == current {
            return None;
        }
        if !matches!(inner.health[index], ProviderHealth::Connected) {
            return None;
        }
        let current_height = inner.blocks[current];
        if inner.blocks[index] > current_height + self.max_block_drift {
            return Some(Failover {
                from: current,
                to: index,
                current_height,
                candidate_height: inner.blocks[index],
            });
        }
        None
    }

    pub fn mark_reconnecting(&self, index: usize, attempt: u32) {
        let mut inner = self.inner.write().expect("pool lock");
        if let Some(h) = inner.health.get_mut(index) {
            *h = ProviderHealth::Reconnecting { attempt };
        }
    }

    pub fn mark_unavailable(&self, index: usize) {
        let mut inner = self.inner.write().expect("pool lock");
        if let Some(h) = inner.health.get_mut(index) {
            *h = ProviderHealth::Unavailable;
        }
    }

    /// An inbound connect resets the endpoint's campaign state.
    pub fn mark_connected(&self, index: usize) {
        let mut inner = self.inner.write().expect("pool lock");
        if let Some(h) = inner.health.get_mut(index) {
            *h = ProviderHealth::Connected;
        }
    }
}

/// Exponential backoff policy for one endpoint's reconnection campaigns.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    /// Delay cap as an exponent of two, in seconds
    pub max_exponent: u32,
    pub max_attempts: u32,
    /// Pause between independent campaigns for the same endpoint
    pub campaign_cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_exponent: 10,
            max_attempts: 7,
            campaign_cooldown: Duration::from_secs(65),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based): 1s, 2s, 4s, ...,
    /// capped at 2^max_exponent seconds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.max_exponent);
        let secs = self.base.as_secs().saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(1u64 << self.max_exponent))
    }

    /// Same as `delay` with up to 25% additive jitter, so parallel
    /// campaigns against the same node do not synchronize.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.delay(attempt);
        let jitter_ms = base.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, drift: u64) -> ProviderPool {
        let endpoints = (0..n).map(|i| format!("wss://rpc{i}.example")).collect();
        ProviderPool::new(endpoints, drift)
    }

    #[test]
    fn test_failover_on_drift_exceeded() {
        let pool = pool(2, 2);
        assert!(pool.on_new_block(0, 100).is_none());
        let failover = pool.on_new_block(1, 103).expect("should fail over");
        assert_eq!(failover.from, 0);
        assert_eq!(failover.to, 1);
        assert_eq!(failover.current_height, 100);
        assert_eq!(failover.candidate_height, 103);
    }

    #[test]
    fn test_no_failover_within_drift() {
        let pool = pool(2, 2);
        assert!(pool.on_new_block(0, 100).is_none());
        assert!(pool.on_new_block(1, 101).is_none());
        assert!(pool.on_new_block(1, 102).is_none());
    }

    #[test]
    fn test_current_provider_never_triggers_failover() {
        let pool = pool(2, 2);
        assert!(pool.on_new_block(0, 100).is_none());
        assert!(pool.on_new_block(0, 10_000).is_none());
    }

    #[test]
    fn test_select_same_index_is_noop() {
        let pool = pool(2, 2);
        assert!(!pool.select(0));
        assert!(pool.select(1));
        assert_eq!(pool.current_index(), 1);
        assert!(!pool.select(1));
    }

    #[test]
    fn test_unavailable_provider_readmitted_by_fresh_header() {
        let pool = pool(2, 2);
        pool.on_new_block(0, 100);
        pool.mark_unavailable(1);
        assert_eq!(pool.health(1), ProviderHealth::Unavailable);
        // An unavailable endpoint produces no headers, so it never enters
        // the comparison; a fresh header acts as the inbound connect that
        // re-admits it.
        let failover = pool.on_new_block(1, 200);
        assert!(failover.is_some());
        assert_eq!(pool.health(1), ProviderHealth::Connected);
    }

    #[test]
    fn test_heights_are_monotonic() {
        let pool = pool(1, 2);
        pool.on_new_block(0, 100);
        pool.on_new_block(0, 90);
        assert_eq!(pool.block_height(0), 100);
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
        assert_eq!(policy.delay(10), Duration::from_secs(1024));
        assert_eq!(policy.delay(30), Duration::from_secs(1024));
    }

    #[test]
    fn test_backoff_exhaustion() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(6));
        assert!(policy.exhausted(7));
    }
}
