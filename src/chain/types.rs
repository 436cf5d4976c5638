//! Decoded on-chain types.
//!
//! Everything the contracts expose is decoded once at the RPC boundary into
//! the closed types below; the synchronizer matches on `ChainEvent`
//! exhaustively, so adding an event kind is a compile-time checklist.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::price::feed::FeedSpec;

/// On-chain prices carry 10 decimals.
pub const PRICE_SCALE: u128 = 10_000_000_000;

/// `position_size * percent_profit` is scaled down by 1e12: the 1e10
/// percent-profit precision combined with the 1e2 percent factor.
pub const PNL_DIVISOR: i128 = 1_000_000_000_000;

/// Resting order sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitOrderKind {
    Limit,
    StopLimit,
}

/// Which on-chain trigger a keeper submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Open,
    TakeProfit,
    StopLoss,
    Liquidation,
}

impl TriggerKind {
    fn code(self) -> u8 {
        match self {
            TriggerKind::Open => 0,
            TriggerKind::TakeProfit => 1,
            TriggerKind::StopLoss => 2,
            TriggerKind::Liquidation => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TriggerKind::Open),
            1 => Some(TriggerKind::TakeProfit),
            2 => Some(TriggerKind::StopLoss),
            3 => Some(TriggerKind::Liquidation),
            _ => None,
        }
    }
}

/// Identity of a trigger target, packed into the single word the
/// `triggerOrder` contract method takes.
///
/// Bit layout, low to high: [0,8) trigger kind, [8,168) trader,
/// [168,200) pair index, [200,232) position index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerParams {
    pub kind: TriggerKind,
    pub trader: Address,
    pub pair_index: u32,
    pub position_index: u32,
}

impl TriggerParams {
    pub fn packed(&self) -> U256 {
        let mut packed = U256::from(self.kind.code());
        packed |= U256::from_big_endian(self.trader.as_bytes()) << 8;
        packed |= U256::from(self.pair_index) << 168;
        packed |= U256::from(self.position_index) << 200;
        packed
    }

    pub fn unpack(word: U256) -> Option<Self> {
        let kind = TriggerKind::from_code((word & U256::from(0xffu8)).as_u32() as u8)?;
        let mut trader_bytes = [0u8; 32];
        ((word >> 8) & (U256::MAX >> 96)).to_big_endian(&mut trader_bytes);
        let trader = Address::from_slice(&trader_bytes[12..]);
        let pair_index = ((word >> 168) & U256::from(u32::MAX)).as_u32();
        let position_index = ((word >> 200) & U256::from(u32::MAX)).as_u32();
        Some(Self {
            kind,
            trader,
            pair_index,
            position_index,
        })
    }
}

/// Pair metadata as read from the pairs storage contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairInfo {
    pub from: String,
    pub to: String,
    /// Static spread, 1e10 precision
    pub spread_p: u128,
    pub group_index: u32,
    pub feed: FeedSpec,
}

/// One-percent depths used for price impact, 1e10 USD precision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairDepth {
    pub above_usd: u128,
    pub below_usd: u128,
}

/// Per-pair open interest, collateral precision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairOpenInterest {
    pub long: u128,
    pub short: u128,
    pub max: u128,
}

/// Borrowing-fee accumulator state for one pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowingPair {
    pub acc_fee_long: u128,
    pub acc_fee_short: u128,
    pub fee_per_block: u128,
    pub acc_last_updated_block: u64,
}

/// Borrowing-fee accumulator state for one pair group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowingGroup {
    pub acc_fee_long: u128,
    pub acc_fee_short: u128,
    pub fee_per_block: u128,
    pub acc_last_updated_block: u64,
}

/// Rolling open-interest window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OiWindowSettings {
    /// Number of live windows kept per pair
    pub windows_count: u64,
    pub window_duration_secs: u64,
}

impl Default for OiWindowSettings {
    fn default() -> Self {
        Self {
            windows_count: 3,
            window_duration_secs: 1_200,
        }
    }
}

impl OiWindowSettings {
    /// Window id for a unix timestamp
    pub fn window_id(&self, unix_secs: u64) -> u64 {
        unix_secs / self.window_duration_secs.max(1)
    }
}

/// Open-interest bucket for one rolling window, 1e18 USD precision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OiWindow {
    pub long_usd: u128,
    pub short_usd: u128,
}

/// Fee accumulator snapshot taken when a trade opens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialAccFees {
    pub borrowing_pair: u128,
    pub borrowing_group: u128,
    pub block: u64,
}

/// Collateral token facts derived at stack init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralInfo {
    pub decimals: u8,
    /// 10^decimals, cached because every size conversion needs it
    pub precision: u128,
}

impl CollateralInfo {
    pub fn new(decimals: u8) -> Self {
        Self {
            decimals,
            precision: 10u128.pow(decimals as u32),
        }
    }
}

/// An open market trade as stored on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    pub trader: Address,
    pub pair_index: u32,
    pub position_index: u32,
    pub buy: bool,
    pub leverage: u32,
    /// 1e10 precision
    pub open_price: u128,
    pub tp: u128,
    /// Zero encodes "no stop"
    pub sl: u128,
    /// Collateral precision
    pub position_size: u128,
}

/// Companion trade-info record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTradeInfo {
    pub open_interest: u128,
    pub tp_last_updated_block: u64,
    pub sl_last_updated_block: u64,
    pub being_market_closed: bool,
}

/// A resting limit order as stored on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLimitOrder {
    pub trader: Address,
    pub pair_index: u32,
    pub position_index: u32,
    pub buy: bool,
    pub leverage: u32,
    pub kind: LimitOrderKind,
    /// Trigger band, 1e10 precision
    pub min_price: u128,
    pub max_price: u128,
    pub tp: u128,
    pub sl: u128,
    pub position_size: u128,
    pub placed_block: u64,
}

/// Events emitted by the exchange contracts, decoded at the RPC boundary.
///
/// Every variant carries the collateral index of the stack that emitted it;
/// payloads keep the fields the synchronizer needs and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    OpenLimitPlaced {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    },
    OpenLimitUpdated {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    },
    OpenLimitCanceled {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    },
    TpUpdated {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
        new_tp: u128,
    },
    SlUpdated {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
        new_sl: u128,
    },
    SlCanceled {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    },
    MarketExecuted {
        collateral: u8,
        trade: RawTrade,
        open: bool,
        /// Execution price, 1e10 precision
        price: u128,
        /// Signed, 1e10 precision on top of a 1e2 percent factor
        percent_profit: i128,
        position_size: u128,
        block: u64,
        tx: H256,
    },
    LimitExecuted {
        collateral: u8,
        order_kind: TriggerKind,
        trade: RawTrade,
        limit_index: u32,
        price: u128,
        percent_profit: i128,
        position_size: u128,
        block: u64,
        tx: H256,
    },
    MarketCloseCanceled {
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    },
    OpenInterestUpdated {
        collateral: u8,
        pair_index: u32,
        long: u128,
        short: u128,
    },
    OiWindowOiAdded {
        collateral: u8,
        pair_index: u32,
        window_id: u64,
        buy: bool,
        usd: u128,
    },
    OiWindowsTransferred {
        collateral: u8,
        pair_indices: Vec<u32>,
    },
    PairMaxLeverageUpdated {
        collateral: u8,
        pair_index: u32,
        max_leverage: u32,
    },
    BorrowingPairAccFeesUpdated {
        collateral: u8,
        pair_index: u32,
        acc_fee_long: u128,
        acc_fee_short: u128,
        block: u64,
    },
    BorrowingGroupAccFeesUpdated {
        collateral: u8,
        group_index: u32,
        acc_fee_long: u128,
        acc_fee_short: u128,
        block: u64,
    },
}

impl ChainEvent {
    /// Collateral stack the event belongs to
    pub fn collateral(&self) -> u8 {
        match *self {
            ChainEvent::OpenLimitPlaced { collateral, .. }
            | ChainEvent::OpenLimitUpdated { collateral, .. }
            | ChainEvent::OpenLimitCanceled { collateral, .. }
            | ChainEvent::TpUpdated { collateral, .. }
            | ChainEvent::SlUpdated { collateral, .. }
            | ChainEvent::SlCanceled { collateral, .. }
            | ChainEvent::MarketExecuted { collateral, .. }
            | ChainEvent::LimitExecuted { collateral, .. }
            | ChainEvent::MarketCloseCanceled { collateral, .. }
            | ChainEvent::OpenInterestUpdated { collateral, .. }
            | ChainEvent::OiWindowOiAdded { collateral, .. }
            | ChainEvent::OiWindowsTransferred { collateral, .. }
            | ChainEvent::PairMaxLeverageUpdated { collateral, .. }
            | ChainEvent::BorrowingPairAccFeesUpdated { collateral, .. }
            | ChainEvent::BorrowingGroupAccFeesUpdated { collateral, .. } => collateral,
        }
    }

    /// Short tag used in logs and the raw passthrough channel
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::OpenLimitPlaced { .. } => "open_limit_placed",
            ChainEvent::OpenLimitUpdated { .. } => "open_limit_updated",
            ChainEvent::OpenLimitCanceled { .. } => "open_limit_canceled",
            ChainEvent::TpUpdated { .. } => "tp_updated",
            ChainEvent::SlUpdated { .. } => "sl_updated",
            ChainEvent::SlCanceled { .. } => "sl_canceled",
            ChainEvent::MarketExecuted { .. } => "market_executed",
            ChainEvent::LimitExecuted { .. } => "limit_executed",
            ChainEvent::MarketCloseCanceled { .. } => "market_close_canceled",
            ChainEvent::OpenInterestUpdated { .. } => "open_interest_updated",
            ChainEvent::OiWindowOiAdded { .. } => "oi_window_oi_added",
            ChainEvent::OiWindowsTransferred { .. } => "oi_windows_transferred",
            ChainEvent::PairMaxLeverageUpdated { .. } => "pair_max_leverage_updated",
            ChainEvent::BorrowingPairAccFeesUpdated { .. } => "borrowing_pair_acc_fees_updated",
            ChainEvent::BorrowingGroupAccFeesUpdated { .. } => "borrowing_group_acc_fees_updated",
        }
    }
}
