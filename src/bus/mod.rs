//! Distribution bus: the pub/sub layer between the synchronizer and every
//! downstream consumer.
//!
//! Channels have Redis-like semantics: `set` stores the latest value for
//! key-addressed reads, `publish` fans out to live subscribers. The
//! synchronizer does both for snapshot channels so a late consumer can
//! catch up from the keyed store and then follow the stream. Delivery is
//! at-least-once; consumers are idempotent (dedupe by URI or by
//! re-verification against chain).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Channel names shared with out-of-process consumers.
pub mod channel {
    /// Full trading snapshot, set + publish
    pub const TRADING_VARIABLES: &str = "trading-variables";
    /// Latest merged price map, set + publish
    pub const CURRENT_PRICES: &str = "current-prices";
    /// Raw oracle proof bytes, publish-only; wakes the trigger engines
    pub const PRICE_PROOF: &str = "price-proof";
    /// Newly persisted trade records, publish-only
    pub const NEW_TRADES: &str = "new-trades";
    /// Raw known-open-trades map, set-only; scanned by the liquidation keeper
    pub const OPENED_TRADES: &str = "opened-trades";
    /// Decoded chain events passed through for notification consumers
    pub const TRADING_EVENTS: &str = "trading-events";
}

const SUBSCRIBER_CAPACITY: usize = 256;

#[async_trait]
pub trait DistributionBus: Send + Sync {
    /// Store the latest value under `channel` for keyed reads.
    async fn set(&self, channel: &str, value: Value) -> Result<()>;

    /// Read the latest stored value, if any.
    async fn get(&self, channel: &str) -> Result<Option<Value>>;

    /// Fan a value out to current subscribers. Does not store.
    async fn publish(&self, channel: &str, value: Value) -> Result<()>;

    /// Follow a channel's published values from now on.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value>;
}

/// Serialize and `set` in one step.
pub async fn set_typed<T: Serialize + Sync>(
    bus: &dyn DistributionBus,
    channel: &str,
    value: &T,
) -> Result<()> {
    bus.set(channel, serde_json::to_value(value)?).await
}

/// Serialize and `publish` in one step.
pub async fn publish_typed<T: Serialize + Sync>(
    bus: &dyn DistributionBus,
    channel: &str,
    value: &T,
) -> Result<()> {
    bus.publish(channel, serde_json::to_value(value)?).await
}

/// Serialize once, `set` then `publish` (snapshot channels).
pub async fn set_and_publish<T: Serialize + Sync>(
    bus: &dyn DistributionBus,
    channel: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_value(value)?;
    bus.set(channel, json.clone()).await?;
    bus.publish(channel, json).await
}

/// Read and deserialize the latest stored value.
pub async fn get_typed<T: DeserializeOwned>(
    bus: &dyn DistributionBus,
    channel: &str,
) -> Result<Option<T>> {
    match bus.get(channel).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// In-process bus implementation: a concurrent keyed store plus one
/// broadcast topic per channel.
#[derive(Default)]
pub struct InMemoryBus {
    store: DashMap<String, Value>,
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, channel: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl DistributionBus for InMemoryBus {
    async fn set(&self, channel: &str, value: Value) -> Result<()> {
        self.store.insert(channel.to_string(), value);
        Ok(())
    }

    async fn get(&self, channel: &str) -> Result<Option<Value>> {
        Ok(self.store.get(channel).map(|entry| entry.value().clone()))
    }

    async fn publish(&self, channel: &str, value: Value) -> Result<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.topic(channel).send(value);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.topic(channel).subscribe()
    }
}
