//! End-to-end flow over the public surface: lifecycle events feed the
//! state mirror, the mirror feeds the bus, and the trigger engine consumes
//! bus snapshots to submit exactly once per triggerable position.

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perpd::bus::{self, channel, InMemoryBus};
use perpd::chain::rpc::ExchangeRpc;
use perpd::chain::types::{
    BorrowingGroup, BorrowingPair, ChainEvent, CollateralInfo, InitialAccFees, LimitOrderKind,
    OiWindow, OiWindowSettings, PairDepth, PairInfo, PairOpenInterest, RawLimitOrder, RawTrade,
    RawTradeInfo, TriggerKind, TriggerParams,
};
use perpd::price::feed::{FeedSpec, PriceEntry, PriceMap};
use perpd::price::oracle::ProofEnvelope;
use perpd::state::types::{CollateralStack, GlobalAppState, KnownPosition, TradeKey};
use perpd::state::StateHandle;
use perpd::sync::events::EventSynchronizer;
use perpd::sync::records::MemoryTradeStore;
use perpd::trigger::engine::{TriggerEngine, TriggerMode};

/// Scriptable exchange fake: answers from shared tables and counts
/// trigger submissions.
#[derive(Default)]
struct FakeExchange {
    limit_orders: Mutex<BTreeMap<(Address, u32, u32), RawLimitOrder>>,
    trades: Mutex<BTreeMap<(Address, u32, u32), RawTrade>>,
    submissions: AtomicUsize,
}

impl FakeExchange {
    fn put_limit(&self, order: RawLimitOrder) {
        self.limit_orders.lock().unwrap().insert(
            (order.trader, order.pair_index, order.position_index),
            order,
        );
    }

    fn put_trade(&self, trade: RawTrade) {
        self.trades
            .lock()
            .unwrap()
            .insert((trade.trader, trade.pair_index, trade.position_index), trade);
    }

    fn drop_trade(&self, trader: Address, pair_index: u32, position_index: u32) {
        self.trades
            .lock()
            .unwrap()
            .remove(&(trader, pair_index, position_index));
    }
}

#[async_trait]
impl ExchangeRpc for FakeExchange {
    fn collateral(&self) -> u8 {
        0
    }
    async fn pair_count(&self) -> perpd::Result<u32> {
        Ok(1)
    }
    async fn pair(&self, _: u32) -> perpd::Result<PairInfo> {
        Ok(PairInfo {
            from: "ETH".into(),
            to: "USD".into(),
            spread_p: 0,
            group_index: 0,
            feed: FeedSpec::Direct { id: 1 },
        })
    }
    async fn pair_depth(&self, _: u32) -> perpd::Result<PairDepth> {
        Ok(PairDepth::default())
    }
    async fn pair_max_leverage(&self, _: u32) -> perpd::Result<u32> {
        Ok(150)
    }
    async fn open_interest(&self, _: u32) -> perpd::Result<PairOpenInterest> {
        Ok(PairOpenInterest::default())
    }
    async fn borrowing_pair(&self, _: u32) -> perpd::Result<BorrowingPair> {
        Ok(BorrowingPair::default())
    }
    async fn borrowing_group(&self, _: u32) -> perpd::Result<BorrowingGroup> {
        Ok(BorrowingGroup::default())
    }
    async fn borrowing_group_count(&self) -> perpd::Result<u32> {
        Ok(0)
    }
    async fn oi_window_settings(&self) -> perpd::Result<OiWindowSettings> {
        Ok(OiWindowSettings::default())
    }
    async fn active_oi_windows(
        &self,
        _: u32,
        _: u64,
        _: u64,
    ) -> perpd::Result<BTreeMap<u64, OiWindow>> {
        Ok(BTreeMap::new())
    }
    async fn collateral_info(&self) -> perpd::Result<CollateralInfo> {
        Ok(CollateralInfo::new(6))
    }
    async fn collateral_price_usd(&self) -> perpd::Result<Decimal> {
        Ok(dec!(1))
    }
    async fn open_trade(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> perpd::Result<Option<RawTrade>> {
        Ok(self
            .trades
            .lock()
            .unwrap()
            .get(&(trader, pair_index, position_index))
            .cloned())
    }
    async fn open_trade_info(&self, _: Address, _: u32, _: u32) -> perpd::Result<RawTradeInfo> {
        Ok(RawTradeInfo::default())
    }
    async fn initial_acc_fees(&self, _: Address, _: u32, _: u32) -> perpd::Result<InitialAccFees> {
        Ok(InitialAccFees::default())
    }
    async fn open_limit_order(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> perpd::Result<Option<RawLimitOrder>> {
        Ok(self
            .limit_orders
            .lock()
            .unwrap()
            .get(&(trader, pair_index, position_index))
            .cloned())
    }
    async fn has_open_limit_order(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> perpd::Result<bool> {
        Ok(self
            .limit_orders
            .lock()
            .unwrap()
            .contains_key(&(trader, pair_index, position_index)))
    }
    async fn has_open_trade(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> perpd::Result<bool> {
        Ok(self
            .trades
            .lock()
            .unwrap()
            .contains_key(&(trader, pair_index, position_index)))
    }
    async fn trigger_order(&self, _: TriggerParams, _: Bytes) -> perpd::Result<H256> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(H256::repeat_byte(0xfe))
    }
}

fn trader() -> Address {
    Address::repeat_byte(0x21)
}

fn limit_order() -> RawLimitOrder {
    RawLimitOrder {
        trader: trader(),
        pair_index: 0,
        position_index: 0,
        buy: true,
        leverage: 10,
        kind: LimitOrderKind::Limit,
        min_price: 1800_0000000000,
        max_price: 1800_0000000000,
        tp: 1980_0000000000,
        sl: 0,
        position_size: 250_000000,
        placed_block: 50,
    }
}

fn executed_trade() -> RawTrade {
    RawTrade {
        trader: trader(),
        pair_index: 0,
        position_index: 0,
        buy: true,
        leverage: 10,
        open_price: 1800_0000000000,
        tp: 1980_0000000000,
        sl: 0,
        position_size: 250_000000,
    }
}

struct Harness {
    rpc: Arc<FakeExchange>,
    state: StateHandle,
    bus: Arc<InMemoryBus>,
    store: Arc<MemoryTradeStore>,
    sync: EventSynchronizer,
}

async fn harness() -> Harness {
    let rpc = Arc::new(FakeExchange::default());
    let state = StateHandle::new(GlobalAppState::default());
    state
        .mutate(|s| {
            let mut stack = CollateralStack::new(0, "USDC".into(), rpc.clone());
            stack.info = CollateralInfo::new(6);
            s.collaterals.insert(0, stack);
        })
        .await;
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(MemoryTradeStore::new());
    let sync = EventSynchronizer::new(
        state.clone(),
        bus.clone(),
        store.clone(),
        Duration::from_millis(0),
    );
    Harness {
        rpc,
        state,
        bus,
        store,
        sync,
    }
}

async fn seed_price(bus: &InMemoryBus, price: Decimal) {
    let mut prices = PriceMap::new();
    prices.insert(
        0,
        PriceEntry {
            pair_index: 0,
            pair_id: 1,
            price,
            decimal: 8,
            timestamp: 0,
        },
    );
    bus::set_typed(bus, channel::CURRENT_PRICES, &prices)
        .await
        .unwrap();
}

fn envelope() -> ProofEnvelope {
    ProofEnvelope {
        ids: vec![1],
        proof: Bytes::from(vec![0x99]),
        timestamp: 0,
    }
}

#[tokio::test]
async fn full_lifecycle_is_mirrored_and_published() {
    let h = harness().await;
    h.rpc.put_limit(limit_order());

    // Limit placed -> pending entry lands in the mirror and on the bus.
    h.sync
        .apply(ChainEvent::OpenLimitPlaced {
            collateral: 0,
            trader: trader(),
            pair_index: 0,
            position_index: 0,
        })
        .await
        .unwrap();

    let snapshot: perpd::TradingSnapshot =
        bus::get_typed(h.bus.as_ref(), channel::TRADING_VARIABLES)
            .await
            .unwrap()
            .expect("snapshot published");
    let entries = snapshot.trade_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, TradeKey::new(0, trader(), 0, 0, true));

    // Limit executes into a market position.
    h.rpc.put_trade(executed_trade());
    h.sync
        .apply(ChainEvent::LimitExecuted {
            collateral: 0,
            order_kind: TriggerKind::Open,
            trade: executed_trade(),
            limit_index: 0,
            price: 1800_0000000000,
            percent_profit: 0,
            position_size: 250_000000,
            block: 60,
            tx: H256::repeat_byte(1),
        })
        .await
        .unwrap();

    let market_key = TradeKey::new(0, trader(), 0, 0, false);
    h.state
        .read(|s| {
            assert_eq!(s.known_open_trades.len(), 1);
            assert!(matches!(
                s.known_open_trades.get(&market_key),
                Some(KnownPosition::OpenMarketTrade(_))
            ));
        })
        .await;
    assert_eq!(h.store.len(), 1);

    // Close with +10%: 25 USDC on a 250 USDC position.
    h.sync
        .apply(ChainEvent::MarketExecuted {
            collateral: 0,
            trade: executed_trade(),
            open: false,
            price: 1980_0000000000,
            percent_profit: 100_000_000_000,
            position_size: 250_000000,
            block: 70,
            tx: H256::repeat_byte(2),
        })
        .await
        .unwrap();

    h.state
        .read(|s| assert!(s.known_open_trades.is_empty()))
        .await;
    assert_eq!(h.store.len(), 2);

    // Bus round-trip reflects the empty mirror.
    let snapshot: perpd::TradingSnapshot =
        bus::get_typed(h.bus.as_ref(), channel::TRADING_VARIABLES)
            .await
            .unwrap()
            .unwrap();
    assert!(snapshot.known_open_trades.is_empty());
}

#[tokio::test]
async fn overlapping_proofs_submit_once() {
    let h = harness().await;

    // An open trade sits in the mirror with TP at 1980.
    h.rpc.put_trade(executed_trade());
    h.sync
        .apply(ChainEvent::MarketExecuted {
            collateral: 0,
            trade: executed_trade(),
            open: true,
            price: 1800_0000000000,
            percent_profit: 0,
            position_size: 250_000000,
            block: 60,
            tx: H256::repeat_byte(3),
        })
        .await
        .unwrap();

    seed_price(&h.bus, dec!(1980.05)).await;

    let mut rpcs: BTreeMap<u8, Arc<dyn ExchangeRpc>> = BTreeMap::new();
    rpcs.insert(0, h.rpc.clone());
    let mut trigger_config = perpd::config::TriggerConfig::default();
    trigger_config.delay_between_sends_ms = 0;
    trigger_config.delay_after_failure_ms = 0;
    let engine = TriggerEngine::new(
        TriggerMode::Orders,
        h.bus.clone(),
        rpcs,
        trigger_config,
    );

    // First proof: position exists on chain, one submission goes out. The
    // submission closes the position on chain before the second proof.
    assert!(engine.on_proof(envelope()).await);
    assert_eq!(h.rpc.submissions.load(Ordering::SeqCst), 1);
    h.rpc.drop_trade(trader(), 0, 0);

    // Second proof: the mirror still lists the trade, but the chain
    // re-check reports it gone, so nothing is submitted.
    assert!(engine.on_proof(envelope()).await);
    assert_eq!(h.rpc.submissions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn liquidation_keeper_scans_opened_trades() {
    let h = harness().await;

    // 10x long from 1800 -> liquidation at 1638.
    h.rpc.put_trade(executed_trade());
    h.sync
        .apply(ChainEvent::MarketExecuted {
            collateral: 0,
            trade: executed_trade(),
            open: true,
            price: 1800_0000000000,
            percent_profit: 0,
            position_size: 250_000000,
            block: 60,
            tx: H256::repeat_byte(4),
        })
        .await
        .unwrap();
    seed_price(&h.bus, dec!(1637.99)).await;

    let mut rpcs: BTreeMap<u8, Arc<dyn ExchangeRpc>> = BTreeMap::new();
    rpcs.insert(0, h.rpc.clone());
    let mut trigger_config = perpd::config::TriggerConfig::default();
    trigger_config.delay_between_sends_ms = 0;
    let engine = TriggerEngine::new(
        TriggerMode::Liquidations,
        h.bus.clone(),
        rpcs,
        trigger_config,
    );

    assert!(engine.on_proof(envelope()).await);
    assert_eq!(h.rpc.submissions.load(Ordering::SeqCst), 1);

    // Above the liquidation price nothing fires.
    seed_price(&h.bus, dec!(1700)).await;
    assert!(engine.on_proof(envelope()).await);
    assert_eq!(h.rpc.submissions.load(Ordering::SeqCst), 1);
}
