//! The mirrored trading state and its injectable handle.

pub mod handle;
pub mod types;

pub use handle::StateHandle;
pub use types::{
    CollateralStack, GlobalAppState, KnownPosition, MarketTrade, OiWindows, PairMeta,
    PendingLimit, TradeKey, TradingSnapshot,
};
