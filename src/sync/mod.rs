//! State synchronization: the event-driven lifecycle machine, the bulk
//! reconciler, and the persisted trade records.

pub mod events;
pub mod reconciler;
pub mod records;

pub use events::EventSynchronizer;
pub use reconciler::BulkReconciler;
pub use records::{record_uri, MemoryTradeStore, PgTradeStore, TradeRecord, TradeStore};
