//! Concrete contract bindings.
//!
//! Human-readable ABI fragments for exactly the surface `ExchangeRpc`
//! consumes. All decoding to the closed domain types happens here; nothing
//! outside this module touches generated bindings or raw logs.

use async_trait::async_trait;
use ethers::contract::EthLogDecode;
use ethers::core::abi::RawLog;
use ethers::prelude::abigen;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Address, Bytes, Filter, Log, H256, I256, U256};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chain::rpc::{EventSource, ExchangeRpc};
use crate::chain::types::{
    BorrowingGroup, BorrowingPair, ChainEvent, CollateralInfo, InitialAccFees, LimitOrderKind,
    OiWindow, OiWindowSettings, PairDepth, PairInfo, PairOpenInterest, RawLimitOrder, RawTrade,
    RawTradeInfo, TriggerKind, TriggerParams,
};
use crate::config::CollateralConfigEntry;
use crate::error::{PerpdError, Result};
use crate::price::feed::FeedSpec;

abigen!(
    TradingStorage,
    r#"[
        function pairsCount() external view returns (uint256)
        function pairs(uint256 pairIndex) external view returns (string, string, uint256, uint256, uint256, uint256, uint8)
        function pairDepth(uint256 pairIndex) external view returns (uint256, uint256)
        function pairMaxLeverage(uint256 pairIndex) external view returns (uint256)
        function groupsCount() external view returns (uint256)
        function openTrades(address trader, uint256 pairIndex, uint256 index) external view returns (address, uint256, uint256, bool, uint256, uint256, uint256, uint256, uint256)
        function openTradesInfo(address trader, uint256 pairIndex, uint256 index) external view returns (uint256, uint256, uint256, bool)
        function openLimitOrders(address trader, uint256 pairIndex, uint256 index) external view returns (address, uint256, uint256, bool, uint256, uint8, uint256, uint256, uint256, uint256, uint256, uint256)
        function hasOpenLimitOrder(address trader, uint256 pairIndex, uint256 index) external view returns (bool)
        function openInterest(uint256 pairIndex, uint256 index) external view returns (uint256)
        event OpenInterestUpdated(uint256 indexed pairIndex, uint256 oiLong, uint256 oiShort)
        event PairMaxLeverageUpdated(uint256 indexed pairIndex, uint256 maxLeverage)
    ]"#
);

abigen!(
    Trading,
    r#"[
        function triggerOrder(uint256 packed, bytes proof) external
        event OpenLimitPlaced(address indexed trader, uint256 indexed pairIndex, uint256 index)
        event OpenLimitUpdated(address indexed trader, uint256 indexed pairIndex, uint256 index)
        event OpenLimitCanceled(address indexed trader, uint256 indexed pairIndex, uint256 index)
        event TpUpdated(address indexed trader, uint256 indexed pairIndex, uint256 index, uint256 newTp)
        event SlUpdated(address indexed trader, uint256 indexed pairIndex, uint256 index, uint256 newSl)
        event SlCanceled(address indexed trader, uint256 indexed pairIndex, uint256 index)
    ]"#
);

abigen!(
    TradingCallbacks,
    r#"[
        event MarketExecuted(address indexed trader, uint256 indexed pairIndex, uint256 index, bool open, bool buy, uint256 leverage, uint256 openPrice, uint256 tp, uint256 sl, uint256 price, int256 percentProfit, uint256 positionSize)
        event LimitExecuted(address indexed trader, uint256 indexed pairIndex, uint256 index, uint256 limitIndex, uint8 orderType, bool buy, uint256 leverage, uint256 openPrice, uint256 tp, uint256 sl, uint256 price, int256 percentProfit, uint256 positionSize)
        event MarketCloseCanceled(address indexed trader, uint256 indexed pairIndex, uint256 index)
    ]"#
);

abigen!(
    BorrowingFees,
    r#"[
        function getPair(uint256 pairIndex) external view returns (uint256, uint256, uint256, uint256)
        function getGroup(uint256 groupIndex) external view returns (uint256, uint256, uint256, uint256)
        function getInitialAccFees(address trader, uint256 pairIndex, uint256 index) external view returns (uint256, uint256, uint256)
        event PairAccFeesUpdated(uint256 indexed pairIndex, uint256 accFeeLong, uint256 accFeeShort, uint256 currentBlock)
        event GroupAccFeesUpdated(uint256 indexed groupIndex, uint256 accFeeLong, uint256 accFeeShort, uint256 currentBlock)
    ]"#
);

abigen!(
    PriceAggregator,
    r#"[
        function getCollateralPriceUsd() external view returns (uint256)
        function collateralDecimals() external view returns (uint8)
        function oiWindowsSettings() external view returns (uint256, uint256)
        function getOiWindows(uint256 pairIndex, uint256[] windowIds) external view returns (uint256[], uint256[])
        event OiWindowOiAdded(uint256 indexed pairIndex, uint256 windowId, bool long, uint256 oiUsd)
        event OiWindowsTransferred(uint256[] pairIndices)
    ]"#
);

/// Parsed contract addresses of one collateral stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddresses {
    pub storage: Address,
    pub trading: Address,
    pub callbacks: Address,
    pub borrowing_fees: Address,
    pub aggregator: Address,
}

impl ContractAddresses {
    pub fn parse(entry: &CollateralConfigEntry) -> Result<Self> {
        let parse = |label: &str, value: &str| {
            value.parse::<Address>().map_err(|_| {
                PerpdError::MissingConfig(format!(
                    "collateral {}: bad {label} address: {value}",
                    entry.index
                ))
            })
        };
        Ok(Self {
            storage: parse("storage", &entry.storage_address)?,
            trading: parse("trading", &entry.trading_address)?,
            callbacks: parse("callbacks", &entry.callbacks_address)?,
            borrowing_fees: parse("borrowing_fees", &entry.borrowing_fees_address)?,
            aggregator: parse("price_aggregator", &entry.price_aggregator_address)?,
        })
    }

    fn all(&self) -> Vec<Address> {
        vec![
            self.storage,
            self.trading,
            self.callbacks,
            self.borrowing_fees,
            self.aggregator,
        ]
    }
}

// Saturating narrowing; chain values that overflow these widths are out of
// protocol range anyway.
fn to_u128(v: U256) -> u128 {
    if v.bits() > 128 {
        u128::MAX
    } else {
        v.as_u128()
    }
}

fn to_u64(v: U256) -> u64 {
    if v.bits() > 64 {
        u64::MAX
    } else {
        v.as_u64()
    }
}

fn to_u32(v: U256) -> u32 {
    if v.bits() > 32 {
        u32::MAX
    } else {
        v.as_u32()
    }
}

fn to_i128(v: I256) -> i128 {
    v.clamp(I256::from(i128::MIN), I256::from(i128::MAX))
        .as_i128()
}

fn limit_kind(code: u8) -> LimitOrderKind {
    if code == 1 {
        LimitOrderKind::StopLimit
    } else {
        LimitOrderKind::Limit
    }
}

fn trigger_kind(code: u8) -> TriggerKind {
    match code {
        1 => TriggerKind::TakeProfit,
        2 => TriggerKind::StopLoss,
        3 => TriggerKind::Liquidation,
        _ => TriggerKind::Open,
    }
}

fn feed_spec(feed1: U256, feed2: U256, calc: u8) -> FeedSpec {
    match calc {
        1 => FeedSpec::Product {
            a: to_u64(feed1),
            b: to_u64(feed2),
        },
        2 => FeedSpec::Quotient {
            num: to_u64(feed1),
            den: to_u64(feed2),
        },
        _ => FeedSpec::Direct { id: to_u64(feed1) },
    }
}

fn read_err<M: Middleware>(e: ethers::contract::ContractError<M>) -> PerpdError {
    PerpdError::ChainRead(e.to_string())
}

/// One collateral's contract set bound against one middleware (a plain
/// provider in the synchronizer, a signer in the keepers).
pub struct EthersExchange<M> {
    collateral: u8,
    storage: TradingStorage<M>,
    trading: Trading<M>,
    borrowing: BorrowingFees<M>,
    aggregator: PriceAggregator<M>,
}

impl<M: Middleware + 'static> EthersExchange<M> {
    pub fn new(collateral: u8, client: Arc<M>, addresses: ContractAddresses) -> Self {
        Self {
            collateral,
            storage: TradingStorage::new(addresses.storage, client.clone()),
            trading: Trading::new(addresses.trading, client.clone()),
            borrowing: BorrowingFees::new(addresses.borrowing_fees, client.clone()),
            aggregator: PriceAggregator::new(addresses.aggregator, client),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ExchangeRpc for EthersExchange<M> {
    fn collateral(&self) -> u8 {
        self.collateral
    }

    async fn pair_count(&self) -> Result<u32> {
        let count = self.storage.pairs_count().call().await.map_err(read_err)?;
        Ok(to_u32(count))
    }

    async fn pair(&self, pair_index: u32) -> Result<PairInfo> {
        let (from, to, spread_p, group_index, feed1, feed2, feed_calc) = self
            .storage
            .pairs(U256::from(pair_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(PairInfo {
            from,
            to,
            spread_p: to_u128(spread_p),
            group_index: to_u32(group_index),
            feed: feed_spec(feed1, feed2, feed_calc),
        })
    }

    async fn pair_depth(&self, pair_index: u32) -> Result<PairDepth> {
        let (above, below) = self
            .storage
            .pair_depth(U256::from(pair_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(PairDepth {
            above_usd: to_u128(above),
            below_usd: to_u128(below),
        })
    }

    async fn pair_max_leverage(&self, pair_index: u32) -> Result<u32> {
        let max = self
            .storage
            .pair_max_leverage(U256::from(pair_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(to_u32(max))
    }

    async fn open_interest(&self, pair_index: u32) -> Result<PairOpenInterest> {
        let mut values = [0u128; 3];
        for (slot, value) in values.iter_mut().enumerate() {
            let raw = self
                .storage
                .open_interest(U256::from(pair_index), U256::from(slot))
                .call()
                .await
                .map_err(read_err)?;
            *value = to_u128(raw);
        }
        Ok(PairOpenInterest {
            long: values[0],
            short: values[1],
            max: values[2],
        })
    }

    async fn borrowing_pair(&self, pair_index: u32) -> Result<BorrowingPair> {
        let (acc_fee_long, acc_fee_short, fee_per_block, last_block) = self
            .borrowing
            .get_pair(U256::from(pair_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(BorrowingPair {
            acc_fee_long: to_u128(acc_fee_long),
            acc_fee_short: to_u128(acc_fee_short),
            fee_per_block: to_u128(fee_per_block),
            acc_last_updated_block: to_u64(last_block),
        })
    }

    async fn borrowing_group(&self, group_index: u32) -> Result<BorrowingGroup> {
        let (acc_fee_long, acc_fee_short, fee_per_block, last_block) = self
            .borrowing
            .get_group(U256::from(group_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(BorrowingGroup {
            acc_fee_long: to_u128(acc_fee_long),
            acc_fee_short: to_u128(acc_fee_short),
            fee_per_block: to_u128(fee_per_block),
            acc_last_updated_block: to_u64(last_block),
        })
    }

    async fn borrowing_group_count(&self) -> Result<u32> {
        let count = self.storage.groups_count().call().await.map_err(read_err)?;
        Ok(to_u32(count))
    }

    async fn oi_window_settings(&self) -> Result<OiWindowSettings> {
        let (count, duration) = self
            .aggregator
            .oi_windows_settings()
            .call()
            .await
            .map_err(read_err)?;
        Ok(OiWindowSettings {
            windows_count: to_u64(count),
            window_duration_secs: to_u64(duration),
        })
    }

    async fn active_oi_windows(
        &self,
        pair_index: u32,
        from_id: u64,
        to_id: u64,
    ) -> Result<BTreeMap<u64, OiWindow>> {
        let ids: Vec<u64> = (from_id..=to_id).collect();
        let id_words: Vec<U256> = ids.iter().map(|id| U256::from(*id)).collect();
        let (longs, shorts) = self
            .aggregator
            .get_oi_windows(U256::from(pair_index), id_words)
            .call()
            .await
            .map_err(read_err)?;

        let mut windows = BTreeMap::new();
        for (slot, id) in ids.iter().enumerate() {
            let long_usd = longs.get(slot).copied().map(to_u128).unwrap_or_default();
            let short_usd = shorts.get(slot).copied().map(to_u128).unwrap_or_default();
            if long_usd > 0 || short_usd > 0 {
                windows.insert(*id, OiWindow { long_usd, short_usd });
            }
        }
        Ok(windows)
    }

    async fn collateral_info(&self) -> Result<CollateralInfo> {
        let decimals = self
            .aggregator
            .collateral_decimals()
            .call()
            .await
            .map_err(read_err)?;
        Ok(CollateralInfo::new(decimals))
    }

    async fn collateral_price_usd(&self) -> Result<Decimal> {
        // 1e8 aggregator precision
        let raw = self
            .aggregator
            .get_collateral_price_usd()
            .call()
            .await
            .map_err(read_err)?;
        Ok(Decimal::from_i128_with_scale(to_u128(raw) as i128, 8).normalize())
    }

    async fn open_trade(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<Option<RawTrade>> {
        let (trader_out, pair, index, buy, leverage, open_price, tp, sl, position_size) = self
            .storage
            .open_trades(trader, U256::from(pair_index), U256::from(position_index))
            .call()
            .await
            .map_err(read_err)?;
        if leverage.is_zero() {
            return Ok(None);
        }
        Ok(Some(RawTrade {
            trader: trader_out,
            pair_index: to_u32(pair),
            position_index: to_u32(index),
            buy,
            leverage: to_u32(leverage),
            open_price: to_u128(open_price),
            tp: to_u128(tp),
            sl: to_u128(sl),
            position_size: to_u128(position_size),
        }))
    }

    async fn open_trade_info(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<RawTradeInfo> {
        let (open_interest, tp_block, sl_block, being_market_closed) = self
            .storage
            .open_trades_info(trader, U256::from(pair_index), U256::from(position_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(RawTradeInfo {
            open_interest: to_u128(open_interest),
            tp_last_updated_block: to_u64(tp_block),
            sl_last_updated_block: to_u64(sl_block),
            being_market_closed,
        })
    }

    async fn initial_acc_fees(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<InitialAccFees> {
        let (pair_fee, group_fee, block) = self
            .borrowing
            .get_initial_acc_fees(trader, U256::from(pair_index), U256::from(position_index))
            .call()
            .await
            .map_err(read_err)?;
        Ok(InitialAccFees {
            borrowing_pair: to_u128(pair_fee),
            borrowing_group: to_u128(group_fee),
            block: to_u64(block),
        })
    }

    async fn open_limit_order(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<Option<RawLimitOrder>> {
        let (
            trader_out,
            pair,
            index,
            buy,
            leverage,
            kind,
            min_price,
            max_price,
            tp,
            sl,
            position_size,
            placed_block,
        ) = self
            .storage
            .open_limit_orders(trader, U256::from(pair_index), U256::from(position_index))
            .call()
            .await
            .map_err(read_err)?;
        if leverage.is_zero() {
            return Ok(None);
        }
        Ok(Some(RawLimitOrder {
            trader: trader_out,
            pair_index: to_u32(pair),
            position_index: to_u32(index),
            buy,
            leverage: to_u32(leverage),
            kind: limit_kind(kind),
            min_price: to_u128(min_price),
            max_price: to_u128(max_price),
            tp: to_u128(tp),
            sl: to_u128(sl),
            position_size: to_u128(position_size),
            placed_block: to_u64(placed_block),
        }))
    }

    async fn has_open_limit_order(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<bool> {
        self.storage
            .has_open_limit_order(trader, U256::from(pair_index), U256::from(position_index))
            .call()
            .await
            .map_err(read_err)
    }

    async fn has_open_trade(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<bool> {
        Ok(self
            .open_trade(trader, pair_index, position_index)
            .await?
            .is_some())
    }

    async fn trigger_order(&self, params: TriggerParams, proof: Bytes) -> Result<H256> {
        let call = self.trading.trigger_order(params.packed(), proof);
        let pending = call
            .send()
            .await
            .map_err(|e| PerpdError::Submission(e.to_string()))?;
        Ok(*pending)
    }
}

/// Websocket event source for one collateral stack: a single log
/// subscription over the stack's contract addresses, decoded into
/// `ChainEvent` before anything downstream sees it.
pub struct WsEventSource {
    collateral: u8,
    client: Arc<Provider<Ws>>,
    addresses: ContractAddresses,
}

impl WsEventSource {
    pub fn new(collateral: u8, client: Arc<Provider<Ws>>, addresses: ContractAddresses) -> Self {
        Self {
            collateral,
            client,
            addresses,
        }
    }
}

#[async_trait]
impl EventSource for WsEventSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChainEvent>> {
        // Probe connectivity so a dead endpoint fails the call instead of
        // producing a silently empty stream.
        self.client
            .get_block_number()
            .await
            .map_err(|e| PerpdError::Provider(e.to_string()))?;

        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();
        let addresses = self.addresses;
        let collateral = self.collateral;

        tokio::spawn(async move {
            let filter = Filter::new().address(addresses.all());
            let mut stream = match client.subscribe_logs(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(collateral, error = %e, "log subscription failed");
                    return;
                }
            };
            while let Some(log) = stream.next().await {
                match decode_log(collateral, &addresses, log) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => debug!(collateral, "unrecognized log, skipping"),
                }
            }
            debug!(collateral, "log stream ended");
        });

        Ok(rx)
    }
}

/// Decode a raw log by emitting contract. Unknown topics return None.
fn decode_log(collateral: u8, addresses: &ContractAddresses, log: Log) -> Option<ChainEvent> {
    let block = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
    let tx = log.transaction_hash.unwrap_or_default();
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };

    if log.address == addresses.trading {
        let event = TradingEvents::decode_log(&raw).ok()?;
        return Some(match event {
            TradingEvents::OpenLimitPlacedFilter(e) => ChainEvent::OpenLimitPlaced {
                collateral,
                trader: e.trader,
                pair_index: to_u32(e.pair_index),
                position_index: to_u32(e.index),
            },
            TradingEvents::OpenLimitUpdatedFilter(e) => ChainEvent::OpenLimitUpdated {
                collateral,
                trader: e.trader,
                pair_index: to_u32(e.pair_index),
                position_index: to_u32(e.index),
            },
            TradingEvents::OpenLimitCanceledFilter(e) => ChainEvent::OpenLimitCanceled {
                collateral,
                trader: e.trader,
                pair_index: to_u32(e.pair_index),
                position_index: to_u32(e.index),
            },
            TradingEvents::TpUpdatedFilter(e) => ChainEvent::TpUpdated {
                collateral,
                trader: e.trader,
                pair_index: to_u32(e.pair_index),
                position_index: to_u32(e.index),
                new_tp: to_u128(e.new_tp),
            },
            TradingEvents::SlUpdatedFilter(e) => ChainEvent::SlUpdated {
                collateral,
                trader: e.trader,
                pair_index: to_u32(e.pair_index),
                position_index: to_u32(e.index),
                new_sl: to_u128(e.new_sl),
            },
            TradingEvents::SlCanceledFilter(e) => ChainEvent::SlCanceled {
                collateral,
                trader: e.trader,
                pair_index: to_u32(e.pair_index),
                position_index: to_u32(e.index),
            },
        });
    }

    if log.address == addresses.callbacks {
        let event = TradingCallbacksEvents::decode_log(&raw).ok()?;
        return Some(match event {
            TradingCallbacksEvents::MarketExecutedFilter(e) => ChainEvent::MarketExecuted {
                collateral,
                trade: RawTrade {
                    trader: e.trader,
                    pair_index: to_u32(e.pair_index),
                    position_index: to_u32(e.index),
                    buy: e.buy,
                    leverage: to_u32(e.leverage),
                    open_price: to_u128(e.open_price),
                    tp: to_u128(e.tp),
                    sl: to_u128(e.sl),
                    position_size: to_u128(e.position_size),
                },
                open: e.open,
                price: to_u128(e.price),
                percent_profit: to_i128(e.percent_profit),
                position_size: to_u128(e.position_size),
                block,
                tx,
            },
            TradingCallbacksEvents::LimitExecutedFilter(e) => ChainEvent::LimitExecuted {
                collateral,
                order_kind: trigger_kind(e.order_type),
                trade: RawTrade {
                    trader: e.trader,
                    pair_index: to_u32(e.pair_index),
                    position_index: to_u32(e.index),
                    buy: e.buy,
                    leverage: to_u32(e.leverage),
                    open_price: to_u128(e.open_price),
                    tp: to_u128(e.tp),
                    sl: to_u128(e.sl),
                    position_size: to_u128(e.position_size),
                },
                limit_index: to_u32(e.limit_index),
                price: to_u128(e.price),
                percent_profit: to_i128(e.percent_profit),
                position_size: to_u128(e.position_size),
                block,
                tx,
            },
            TradingCallbacksEvents::MarketCloseCanceledFilter(e) => {
                ChainEvent::MarketCloseCanceled {
                    collateral,
                    trader: e.trader,
                    pair_index: to_u32(e.pair_index),
                    position_index: to_u32(e.index),
                }
            }
        });
    }

    if log.address == addresses.storage {
        let event = TradingStorageEvents::decode_log(&raw).ok()?;
        return Some(match event {
            TradingStorageEvents::OpenInterestUpdatedFilter(e) => ChainEvent::OpenInterestUpdated {
                collateral,
                pair_index: to_u32(e.pair_index),
                long: to_u128(e.oi_long),
                short: to_u128(e.oi_short),
            },
            TradingStorageEvents::PairMaxLeverageUpdatedFilter(e) => {
                ChainEvent::PairMaxLeverageUpdated {
                    collateral,
                    pair_index: to_u32(e.pair_index),
                    max_leverage: to_u32(e.max_leverage),
                }
            }
        });
    }

    if log.address == addresses.borrowing_fees {
        let event = BorrowingFeesEvents::decode_log(&raw).ok()?;
        return Some(match event {
            BorrowingFeesEvents::PairAccFeesUpdatedFilter(e) => {
                ChainEvent::BorrowingPairAccFeesUpdated {
                    collateral,
                    pair_index: to_u32(e.pair_index),
                    acc_fee_long: to_u128(e.acc_fee_long),
                    acc_fee_short: to_u128(e.acc_fee_short),
                    block: to_u64(e.current_block),
                }
            }
            BorrowingFeesEvents::GroupAccFeesUpdatedFilter(e) => {
                ChainEvent::BorrowingGroupAccFeesUpdated {
                    collateral,
                    group_index: to_u32(e.group_index),
                    acc_fee_long: to_u128(e.acc_fee_long),
                    acc_fee_short: to_u128(e.acc_fee_short),
                    block: to_u64(e.current_block),
                }
            }
        });
    }

    if log.address == addresses.aggregator {
        let event = PriceAggregatorEvents::decode_log(&raw).ok()?;
        return Some(match event {
            PriceAggregatorEvents::OiWindowOiAddedFilter(e) => ChainEvent::OiWindowOiAdded {
                collateral,
                pair_index: to_u32(e.pair_index),
                window_id: to_u64(e.window_id),
                buy: e.long,
                usd: to_u128(e.oi_usd),
            },
            PriceAggregatorEvents::OiWindowsTransferredFilter(e) => {
                ChainEvent::OiWindowsTransferred {
                    collateral,
                    pair_indices: e.pair_indices.iter().copied().map(to_u32).collect(),
                }
            }
        });
    }

    None
}
