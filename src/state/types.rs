//! The in-process mirror of on-chain trading state.
//!
//! `GlobalAppState` is owned by a `StateHandle` and mutated only by the
//! event synchronizer and the bulk reconciler. Everything consumers see
//! goes through `TradingSnapshot`, the serializable view with transient
//! fields (RPC handles) stripped.

use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::rpc::ExchangeRpc;
use crate::chain::types::{
    BorrowingGroup, BorrowingPair, CollateralInfo, InitialAccFees, LimitOrderKind, OiWindow,
    OiWindowSettings, PairDepth, PairOpenInterest, RawLimitOrder, RawTrade, PNL_DIVISOR,
};
use crate::price::feed::FeedSpec;

/// Composite identity of one live entry in `known_open_trades`.
///
/// The `open_limit` flag disambiguates a resting limit order from an
/// executed market position occupying the same trader/pair/index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub collateral: u8,
    pub trader: Address,
    pub pair_index: u32,
    pub position_index: u32,
    pub open_limit: bool,
}

impl TradeKey {
    pub fn new(
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
        open_limit: bool,
    ) -> Self {
        Self {
            collateral,
            trader,
            pair_index,
            position_index,
            open_limit,
        }
    }

    /// The market-position twin of a pending-limit key (and vice versa)
    pub fn with_open_limit(self, open_limit: bool) -> Self {
        Self { open_limit, ..self }
    }
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trade://{}/0x{}/{}/{}?isOpenLimit={}",
            self.collateral,
            hex::encode(self.trader.as_bytes()),
            self.pair_index,
            self.position_index,
            self.open_limit
        )
    }
}

impl FromStr for TradeKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("trade://")
            .ok_or_else(|| format!("not a trade uri: {s}"))?;
        let (path, query) = rest
            .split_once('?')
            .ok_or_else(|| format!("missing query: {s}"))?;
        let mut parts = path.split('/');
        let collateral = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(|| format!("bad collateral: {s}"))?;
        let trader = parts
            .next()
            .and_then(|p| p.parse::<Address>().ok())
            .ok_or_else(|| format!("bad trader: {s}"))?;
        let pair_index = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| format!("bad pair index: {s}"))?;
        let position_index = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| format!("bad position index: {s}"))?;
        let open_limit = query
            .strip_prefix("isOpenLimit=")
            .and_then(|v| v.parse::<bool>().ok())
            .ok_or_else(|| format!("bad isOpenLimit flag: {s}"))?;
        Ok(Self {
            collateral,
            trader,
            pair_index,
            position_index,
            open_limit,
        })
    }
}

impl Serialize for TradeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TradeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Realized result recorded when a position closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedPnl {
    /// Collateral precision, signed
    pub pnl: i128,
    /// 1e10 precision on top of a 1e2 percent factor, signed
    pub percent_profit: i128,
}

/// `position_size * percent_profit / 1e12`, exact integer arithmetic.
pub fn realized_pnl(position_size: u128, percent_profit: i128) -> i128 {
    (position_size as i128).saturating_mul(percent_profit) / PNL_DIVISOR
}

/// A resting limit order known to the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingLimit {
    pub buy: bool,
    pub leverage: u32,
    pub position_size: u128,
    pub kind: LimitOrderKind,
    /// Trigger band, 1e10 precision
    pub min_price: u128,
    pub max_price: u128,
    pub tp: u128,
    pub sl: u128,
    pub placed_block: u64,
}

impl From<RawLimitOrder> for PendingLimit {
    fn from(raw: RawLimitOrder) -> Self {
        Self {
            buy: raw.buy,
            leverage: raw.leverage,
            position_size: raw.position_size,
            kind: raw.kind,
            min_price: raw.min_price,
            max_price: raw.max_price,
            tp: raw.tp,
            sl: raw.sl,
            placed_block: raw.placed_block,
        }
    }
}

/// An executed market position known to the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTrade {
    pub buy: bool,
    pub leverage: u32,
    pub position_size: u128,
    /// 1e10 precision
    pub open_price: u128,
    pub tp: u128,
    /// Zero encodes "no stop"
    pub sl: u128,
    /// Fee accumulator snapshot taken at open
    pub initial_acc_fees: InitialAccFees,
    pub collateral_price_at_open: Option<Decimal>,
    /// Set by the closing transition just before removal
    pub realized: Option<ClosedPnl>,
    pub close_price: Option<u128>,
}

impl MarketTrade {
    pub fn from_raw(raw: &RawTrade, initial_acc_fees: InitialAccFees) -> Self {
        Self {
            buy: raw.buy,
            leverage: raw.leverage,
            position_size: raw.position_size,
            open_price: raw.open_price,
            tp: raw.tp,
            sl: raw.sl,
            initial_acc_fees,
            collateral_price_at_open: None,
            realized: None,
            close_price: None,
        }
    }
}

/// Tagged union stored per `TradeKey`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KnownPosition {
    PendingLimitOrder(PendingLimit),
    OpenMarketTrade(MarketTrade),
}

impl KnownPosition {
    pub fn is_pending_limit(&self) -> bool {
        matches!(self, KnownPosition::PendingLimitOrder(_))
    }

    pub fn is_market_trade(&self) -> bool {
        matches!(self, KnownPosition::OpenMarketTrade(_))
    }
}

/// Static pair metadata kept in the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMeta {
    pub index: u32,
    pub from: String,
    pub to: String,
    /// 1e10 precision
    pub spread_p: u128,
    pub group_index: u32,
    pub depth: PairDepth,
    pub max_leverage: u32,
    pub feed: FeedSpec,
}

/// Rolling open-interest windows for one pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OiWindows {
    pub windows: BTreeMap<u64, OiWindow>,
}

impl OiWindows {
    pub fn add_oi(&mut self, window_id: u64, buy: bool, usd: u128) {
        let window = self.windows.entry(window_id).or_default();
        if buy {
            window.long_usd = window.long_usd.saturating_add(usd);
        } else {
            window.short_usd = window.short_usd.saturating_add(usd);
        }
    }

    /// Re-bucket windows that fell out of the live range. Stale windows
    /// (id <= current_id - windows_count) are drained and their totals
    /// added to the oldest still-live window, so the sum over live windows
    /// keeps approximating instantaneous open interest.
    pub fn transfer_stale(&mut self, current_id: u64, windows_count: u64) {
        let oldest_live = current_id.saturating_sub(windows_count.saturating_sub(1));
        if oldest_live == 0 {
            return;
        }
        let stale: Vec<u64> = self
            .windows
            .range(..oldest_live)
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return;
        }
        let mut carried = OiWindow::default();
        for id in stale {
            if let Some(w) = self.windows.remove(&id) {
                carried.long_usd = carried.long_usd.saturating_add(w.long_usd);
                carried.short_usd = carried.short_usd.saturating_add(w.short_usd);
            }
        }
        let target = self.windows.entry(oldest_live).or_default();
        target.long_usd = target.long_usd.saturating_add(carried.long_usd);
        target.short_usd = target.short_usd.saturating_add(carried.short_usd);
    }

    /// Sum over all live windows
    pub fn totals(&self) -> OiWindow {
        let mut total = OiWindow::default();
        for w in self.windows.values() {
            total.long_usd = total.long_usd.saturating_add(w.long_usd);
            total.short_usd = total.short_usd.saturating_add(w.short_usd);
        }
        total
    }
}

/// Per-collateral contract handles and derived accumulators. Replaced
/// wholesale at provider (re)selection and on each reconciliation pass.
#[derive(Clone)]
pub struct CollateralStack {
    pub collateral: u8,
    pub symbol: String,
    pub rpc: Arc<dyn ExchangeRpc>,
    pub info: CollateralInfo,
    pub open_interest: BTreeMap<u32, PairOpenInterest>,
    pub borrowing_pairs: BTreeMap<u32, BorrowingPair>,
    pub borrowing_groups: BTreeMap<u32, BorrowingGroup>,
    pub oi_settings: OiWindowSettings,
    pub last_price_usd: Option<Decimal>,
}

impl fmt::Debug for CollateralStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollateralStack")
            .field("collateral", &self.collateral)
            .field("symbol", &self.symbol)
            .field("info", &self.info)
            .field("pairs_with_oi", &self.open_interest.len())
            .finish_non_exhaustive()
    }
}

impl CollateralStack {
    pub fn new(collateral: u8, symbol: String, rpc: Arc<dyn ExchangeRpc>) -> Self {
        Self {
            collateral,
            symbol,
            rpc,
            info: CollateralInfo::new(18),
            open_interest: BTreeMap::new(),
            borrowing_pairs: BTreeMap::new(),
            borrowing_groups: BTreeMap::new(),
            oi_settings: OiWindowSettings::default(),
            last_price_usd: None,
        }
    }
}

/// Provider status mirrored into snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderView {
    pub endpoints: Vec<String>,
    pub current_index: usize,
    pub last_blocks: Vec<u64>,
}

/// The process-wide mutable mirror. Created empty at startup, read-modify-
/// replaced on every mutation, republished to the bus afterwards. Never
/// persisted directly.
#[derive(Debug, Clone, Default)]
pub struct GlobalAppState {
    pub provider_view: ProviderView,
    pub collaterals: BTreeMap<u8, CollateralStack>,
    pub known_open_trades: HashMap<TradeKey, KnownPosition>,
    pub oi_windows: HashMap<(u8, u32), OiWindows>,
    pub pairs: Vec<PairMeta>,
    pub last_synced_block: u64,
}

impl GlobalAppState {
    /// True if the underlying slot (ignoring the open-limit flag) already
    /// holds a market trade; used by the duplicate-execution guard.
    pub fn has_market_trade(&self, key: &TradeKey) -> bool {
        self.known_open_trades
            .get(&key.with_open_limit(false))
            .map(KnownPosition::is_market_trade)
            .unwrap_or(false)
    }

    pub fn pair(&self, pair_index: u32) -> Option<&PairMeta> {
        self.pairs.iter().find(|p| p.index == pair_index)
    }
}

/// Serializable stack view (the RPC handle is stripped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralSnapshot {
    pub collateral: u8,
    pub symbol: String,
    pub info: CollateralInfo,
    pub open_interest: BTreeMap<u32, PairOpenInterest>,
    pub borrowing_pairs: BTreeMap<u32, BorrowingPair>,
    pub borrowing_groups: BTreeMap<u32, BorrowingGroup>,
    pub oi_settings: OiWindowSettings,
    pub last_price_usd: Option<Decimal>,
}

impl From<&CollateralStack> for CollateralSnapshot {
    fn from(stack: &CollateralStack) -> Self {
        Self {
            collateral: stack.collateral,
            symbol: stack.symbol.clone(),
            info: stack.info,
            open_interest: stack.open_interest.clone(),
            borrowing_pairs: stack.borrowing_pairs.clone(),
            borrowing_groups: stack.borrowing_groups.clone(),
            oi_settings: stack.oi_settings,
            last_price_usd: stack.last_price_usd,
        }
    }
}

/// The reduced "trading variables" view published on the bus. Keys of
/// `known_open_trades` are the canonical trade URIs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingSnapshot {
    pub provider: ProviderView,
    pub last_synced_block: u64,
    pub collaterals: BTreeMap<u8, CollateralSnapshot>,
    pub known_open_trades: BTreeMap<String, KnownPosition>,
    pub oi_windows: BTreeMap<u8, BTreeMap<u32, OiWindows>>,
    pub pairs: Vec<PairMeta>,
}

impl TradingSnapshot {
    pub fn of(state: &GlobalAppState) -> Self {
        let mut oi_windows: BTreeMap<u8, BTreeMap<u32, OiWindows>> = BTreeMap::new();
        for ((collateral, pair_index), windows) in &state.oi_windows {
            oi_windows
                .entry(*collateral)
                .or_default()
                .insert(*pair_index, windows.clone());
        }
        Self {
            provider: state.provider_view.clone(),
            last_synced_block: state.last_synced_block,
            collaterals: state
                .collaterals
                .iter()
                .map(|(idx, stack)| (*idx, CollateralSnapshot::from(stack)))
                .collect(),
            known_open_trades: state
                .known_open_trades
                .iter()
                .map(|(key, pos)| (key.to_string(), pos.clone()))
                .collect(),
            oi_windows,
            pairs: state.pairs.clone(),
        }
    }

    /// Parse the snapshot's trade keys back into their typed form.
    pub fn trade_entries(&self) -> Vec<(TradeKey, &KnownPosition)> {
        self.known_open_trades
            .iter()
            .filter_map(|(uri, pos)| uri.parse::<TradeKey>().ok().map(|key| (key, pos)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trader() -> Address {
        Address::repeat_byte(0x42)
    }

    #[test]
    fn test_trade_key_uri_roundtrip() {
        let key = TradeKey::new(2, trader(), 7, 1, true);
        let uri = key.to_string();
        assert!(uri.starts_with("trade://2/0x4242"));
        assert!(uri.ends_with("/7/1?isOpenLimit=true"));
        let parsed: TradeKey = uri.parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_trade_key_rejects_garbage() {
        assert!("trade://x/0x00/1/2?isOpenLimit=true".parse::<TradeKey>().is_err());
        assert!("order://0/0x00/1/2?isOpenLimit=true".parse::<TradeKey>().is_err());
        assert!("trade://0/nothex/1/2?isOpenLimit=true".parse::<TradeKey>().is_err());
        assert!("trade://0/0x00/1/2".parse::<TradeKey>().is_err());
    }

    #[test]
    fn test_realized_pnl_exact() {
        // 1.0 position at 1e18 with +5% at 1e12 combined scale
        let pnl = realized_pnl(1_000_000_000_000_000_000, 50_000_000_000);
        assert_eq!(pnl, 50_000_000_000_000_000);
    }

    #[test]
    fn test_realized_pnl_negative() {
        let pnl = realized_pnl(2_000_000_000_000_000_000, -25_000_000_000);
        assert_eq!(pnl, -50_000_000_000_000_000);
    }

    #[test]
    fn test_oi_windows_transfer_preserves_totals() {
        let mut windows = OiWindows::default();
        windows.add_oi(97, true, 1_000);
        windows.add_oi(98, false, 2_000);
        windows.add_oi(100, true, 4_000);
        let before = windows.totals();

        windows.transfer_stale(100, 2);
        let after = windows.totals();
        assert_eq!(before, after);
        // Oldest live window for current=100, count=2 is 99; the stale 97
        // and 98 buckets fold into it.
        assert!(windows.windows.contains_key(&99));
        assert!(!windows.windows.contains_key(&97));
        assert!(!windows.windows.contains_key(&98));
        assert_eq!(windows.windows.get(&99).unwrap().long_usd, 1_000);
        assert_eq!(windows.windows.get(&99).unwrap().short_usd, 2_000);
    }

    #[test]
    fn test_oi_windows_transfer_noop_when_fresh() {
        let mut windows = OiWindows::default();
        windows.add_oi(100, true, 500);
        windows.transfer_stale(100, 3);
        assert_eq!(windows.windows.len(), 1);
        assert_eq!(windows.totals().long_usd, 500);
    }

    #[test]
    fn test_has_market_trade_ignores_limit_flag() {
        let mut state = GlobalAppState::default();
        let market_key = TradeKey::new(0, trader(), 1, 0, false);
        state.known_open_trades.insert(
            market_key,
            KnownPosition::OpenMarketTrade(MarketTrade {
                buy: true,
                leverage: 10,
                position_size: 1,
                open_price: 1,
                tp: 0,
                sl: 0,
                initial_acc_fees: InitialAccFees::default(),
                collateral_price_at_open: None,
                realized: None,
                close_price: None,
            }),
        );
        let limit_key = market_key.with_open_limit(true);
        assert!(state.has_market_trade(&limit_key));
        assert!(state.has_market_trade(&market_key));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_trades() {
        let mut state = GlobalAppState::default();
        let key = TradeKey::new(1, trader(), 3, 0, false);
        state.known_open_trades.insert(
            key,
            KnownPosition::OpenMarketTrade(MarketTrade {
                buy: false,
                leverage: 25,
                position_size: 7_000_000,
                open_price: 1_850_0000000000,
                tp: 1_700_0000000000,
                sl: 0,
                initial_acc_fees: InitialAccFees {
                    borrowing_pair: 11,
                    borrowing_group: 22,
                    block: 1_000,
                },
                collateral_price_at_open: None,
                realized: None,
                close_price: None,
            }),
        );

        let snapshot = TradingSnapshot::of(&state);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: TradingSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);

        let entries = back.trade_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, key);
        assert_eq!(entries[0].1, state.known_open_trades.get(&key).unwrap());
    }
}
