pub mod app;
pub mod bus;
pub mod chain;
pub mod config;
pub mod error;
pub mod price;
pub mod state;
pub mod sync;
pub mod tasks;
pub mod trigger;

pub use app::{run, RunMode};
pub use bus::{DistributionBus, InMemoryBus};
pub use chain::{
    ChainEvent, EventSource, ExchangeRpc, Failover, ProviderPool, ReconnectPolicy, TriggerKind,
};
pub use config::AppConfig;
pub use error::{PerpdError, Result};
pub use price::{FeedSpec, PriceEntry, PriceIngestion, PriceMap};
pub use state::{GlobalAppState, KnownPosition, StateHandle, TradeKey, TradingSnapshot};
pub use sync::{BulkReconciler, EventSynchronizer, TradeRecord, TradeStore};
pub use trigger::{TriggerEngine, TriggerMode};
