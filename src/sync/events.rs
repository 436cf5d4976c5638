//! Event synchronizer: applies confirmed contract events to the state
//! mirror through the trade-lifecycle state machine.
//!
//! Lifecycle per key: Absent -> PendingLimitOrder -> (canceled -> Absent |
//! executed -> OpenMarketTrade); OpenMarketTrade -> (modified in place |
//! closed -> Absent).
//!
//! Events wait out a confirmation delay, then a single applier task
//! processes them one at a time. Two events for the same key can no longer
//! interleave their awaited sub-calls; the bulk reconciler remains the
//! second line of defense against anything missed.

use chrono::Utc;
use ethers::types::Address;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{self, channel, DistributionBus};
use crate::chain::types::{ChainEvent, RawTrade, TriggerKind};
use crate::error::{PerpdError, Result};
use crate::state::handle::StateHandle;
use crate::state::types::{
    realized_pnl, ClosedPnl, KnownPosition, MarketTrade, PendingLimit, TradeKey,
};
use crate::sync::records::{record_uri, TradeRecord, TradeStore};

/// Queue depth between the confirmation-delay stage and the applier
const APPLIER_QUEUE: usize = 1024;

pub struct EventSynchronizer {
    state: StateHandle,
    bus: Arc<dyn DistributionBus>,
    store: Arc<dyn TradeStore>,
    confirmation_delay: Duration,
}

/// Facts about one collateral stack captured before any mutation
struct StackView {
    rpc: Arc<dyn crate::chain::rpc::ExchangeRpc>,
    symbol: String,
    decimals: u8,
    last_price_usd: Option<Decimal>,
}

impl EventSynchronizer {
    pub fn new(
        state: StateHandle,
        bus: Arc<dyn DistributionBus>,
        store: Arc<dyn TradeStore>,
        confirmation_delay: Duration,
    ) -> Self {
        Self {
            state,
            bus,
            store,
            confirmation_delay,
        }
    }

    /// Consume a decoded event stream until it ends or shutdown fires.
    ///
    /// Each inbound event is republished raw on `trading-events`, parked
    /// for the confirmation delay, then handed to the sequential applier.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (confirmed_tx, mut confirmed_rx) = mpsc::channel::<ChainEvent>(APPLIER_QUEUE);

        let intake = {
            let sync = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe_event = events.recv() => {
                            let Some(event) = maybe_event else { break };
                            if let Err(e) = bus::publish_typed(
                                sync.bus.as_ref(),
                                channel::TRADING_EVENTS,
                                &event,
                            )
                            .await
                            {
                                warn!(error = %e, "failed to pass event through");
                            }
                            let tx = confirmed_tx.clone();
                            let delay = sync.confirmation_delay;
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send(event).await;
                            });
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        loop {
            tokio::select! {
                maybe_event = confirmed_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    let name = event.name();
                    if let Err(e) = self.apply(event).await {
                        warn!(event = name, error = %e, "event left state unchanged");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        intake.abort();
    }

    /// Apply one confirmed event. Errors leave the mirror untouched for
    /// that event; processing continues with the next one.
    pub async fn apply(&self, event: ChainEvent) -> Result<()> {
        match event {
            ChainEvent::OpenLimitPlaced {
                collateral,
                trader,
                pair_index,
                position_index,
            }
            | ChainEvent::OpenLimitUpdated {
                collateral,
                trader,
                pair_index,
                position_index,
            } => {
                self.upsert_pending_limit(collateral, trader, pair_index, position_index)
                    .await
            }
            ChainEvent::OpenLimitCanceled {
                collateral,
                trader,
                pair_index,
                position_index,
            } => {
                self.remove_pending_limit(collateral, trader, pair_index, position_index)
                    .await
            }
            ChainEvent::TpUpdated {
                collateral,
                trader,
                pair_index,
                position_index,
                ..
            }
            | ChainEvent::SlUpdated {
                collateral,
                trader,
                pair_index,
                position_index,
                ..
            }
            | ChainEvent::SlCanceled {
                collateral,
                trader,
                pair_index,
                position_index,
            } => {
                self.refresh_market_trade(collateral, trader, pair_index, position_index, false)
                    .await
            }
            ChainEvent::MarketCloseCanceled {
                collateral,
                trader,
                pair_index,
                position_index,
            } => {
                self.refresh_market_trade(collateral, trader, pair_index, position_index, true)
                    .await
            }
            ChainEvent::MarketExecuted {
                collateral,
                trade,
                open,
                price,
                percent_profit,
                position_size,
                block,
                tx,
            } => {
                if open {
                    self.open_market_trade(collateral, &trade, None, block, tx).await
                } else {
                    self.close_market_trade(
                        collateral,
                        &trade,
                        "market-close",
                        price,
                        percent_profit,
                        position_size,
                        block,
                        tx,
                    )
                    .await
                }
            }
            ChainEvent::LimitExecuted {
                collateral,
                order_kind,
                trade,
                limit_index,
                price,
                percent_profit,
                position_size,
                block,
                tx,
            } => match order_kind {
                TriggerKind::Open => {
                    self.open_market_trade(collateral, &trade, Some(limit_index), block, tx)
                        .await
                }
                TriggerKind::TakeProfit => {
                    self.close_market_trade(
                        collateral,
                        &trade,
                        "tp-close",
                        price,
                        percent_profit,
                        position_size,
                        block,
                        tx,
                    )
                    .await
                }
                TriggerKind::StopLoss => {
                    self.close_market_trade(
                        collateral,
                        &trade,
                        "sl-close",
                        price,
                        percent_profit,
                        position_size,
                        block,
                        tx,
                    )
                    .await
                }
                TriggerKind::Liquidation => {
                    self.close_market_trade(
                        collateral,
                        &trade,
                        "liq-close",
                        price,
                        percent_profit,
                        position_size,
                        block,
                        tx,
                    )
                    .await
                }
            },
            ChainEvent::OpenInterestUpdated {
                collateral,
                pair_index,
                long,
                short,
            } => {
                let changed = self
                    .state
                    .mutate(|s| {
                        let Some(stack) = s.collaterals.get_mut(&collateral) else {
                            return false;
                        };
                        let oi = stack.open_interest.entry(pair_index).or_default();
                        oi.long = long;
                        oi.short = short;
                        true
                    })
                    .await;
                if changed {
                    self.republish().await?;
                }
                Ok(())
            }
            ChainEvent::OiWindowOiAdded {
                collateral,
                pair_index,
                window_id,
                buy,
                usd,
            } => {
                self.state
                    .mutate(|s| {
                        s.oi_windows
                            .entry((collateral, pair_index))
                            .or_default()
                            .add_oi(window_id, buy, usd);
                    })
                    .await;
                self.republish().await
            }
            ChainEvent::OiWindowsTransferred {
                collateral,
                pair_indices,
            } => {
                let now = Utc::now().timestamp().max(0) as u64;
                self.state
                    .mutate(|s| {
                        let Some(stack) = s.collaterals.get(&collateral) else {
                            return;
                        };
                        let settings = stack.oi_settings;
                        let current_id = settings.window_id(now);
                        for pair_index in pair_indices {
                            if let Some(windows) = s.oi_windows.get_mut(&(collateral, pair_index))
                            {
                                windows.transfer_stale(current_id, settings.windows_count);
                            }
                        }
                    })
                    .await;
                self.republish().await
            }
            ChainEvent::PairMaxLeverageUpdated {
                pair_index,
                max_leverage,
                ..
            } => {
                self.state
                    .mutate(|s| {
                        if let Some(pair) = s.pairs.iter_mut().find(|p| p.index == pair_index) {
                            pair.max_leverage = max_leverage;
                        }
                    })
                    .await;
                self.republish().await
            }
            ChainEvent::BorrowingPairAccFeesUpdated {
                collateral,
                pair_index,
                acc_fee_long,
                acc_fee_short,
                block,
            } => {
                self.state
                    .mutate(|s| {
                        if let Some(stack) = s.collaterals.get_mut(&collateral) {
                            let pair = stack.borrowing_pairs.entry(pair_index).or_default();
                            pair.acc_fee_long = acc_fee_long;
                            pair.acc_fee_short = acc_fee_short;
                            pair.acc_last_updated_block = block;
                        }
                    })
                    .await;
                self.republish().await
            }
            ChainEvent::BorrowingGroupAccFeesUpdated {
                collateral,
                group_index,
                acc_fee_long,
                acc_fee_short,
                block,
            } => {
                self.state
                    .mutate(|s| {
                        if let Some(stack) = s.collaterals.get_mut(&collateral) {
                            let group = stack.borrowing_groups.entry(group_index).or_default();
                            group.acc_fee_long = acc_fee_long;
                            group.acc_fee_short = acc_fee_short;
                            group.acc_last_updated_block = block;
                        }
                    })
                    .await;
                self.republish().await
            }
        }
    }

    async fn stack_view(&self, collateral: u8) -> Result<StackView> {
        self.state
            .read(|s| {
                s.collaterals.get(&collateral).map(|stack| StackView {
                    rpc: stack.rpc.clone(),
                    symbol: stack.symbol.clone(),
                    decimals: stack.info.decimals,
                    last_price_usd: stack.last_price_usd,
                })
            })
            .await
            .ok_or(PerpdError::UnknownCollateral(collateral))
    }

    async fn pair_name(&self, pair_index: u32) -> String {
        self.state
            .read(|s| s.pair(pair_index).map(|p| format!("{}/{}", p.from, p.to)))
            .await
            .unwrap_or_else(|| format!("pair-{pair_index}"))
    }

    /// OpenLimitPlaced / OpenLimitUpdated: re-read the order from chain and
    /// upsert the pending entry. A replay with identical payload is a pure
    /// overwrite.
    async fn upsert_pending_limit(
        &self,
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<()> {
        let view = self.stack_view(collateral).await?;
        let key = TradeKey::new(collateral, trader, pair_index, position_index, true);

        let Some(raw) = view
            .rpc
            .open_limit_order(trader, pair_index, position_index)
            .await?
        else {
            info!(key = %key, "limit order already gone on chain, skipping upsert");
            return Ok(());
        };

        self.state
            .mutate(|s| {
                s.known_open_trades
                    .insert(key, KnownPosition::PendingLimitOrder(PendingLimit::from(raw)));
            })
            .await;
        debug!(key = %key, "pending limit upserted");
        self.republish().await
    }

    /// OpenLimitCanceled: drop the entry; duplicate cancels are tolerated.
    async fn remove_pending_limit(
        &self,
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<()> {
        let key = TradeKey::new(collateral, trader, pair_index, position_index, true);
        let removed = self
            .state
            .mutate(|s| s.known_open_trades.remove(&key).is_some())
            .await;
        if !removed {
            info!(key = %key, "cancel for unknown limit order, already removed");
            return Ok(());
        }
        debug!(key = %key, "pending limit removed");
        self.republish().await
    }

    /// TpUpdated / SlUpdated / SlCanceled re-read the full trade state and
    /// overwrite the open entry in place. MarketCloseCanceled does the same
    /// but removes the entry when the chain says leverage dropped to zero.
    async fn refresh_market_trade(
        &self,
        collateral: u8,
        trader: Address,
        pair_index: u32,
        position_index: u32,
        remove_if_gone: bool,
    ) -> Result<()> {
        let view = self.stack_view(collateral).await?;
        let key = TradeKey::new(collateral, trader, pair_index, position_index, false);

        let on_chain = view.rpc.open_trade(trader, pair_index, position_index).await?;
        match on_chain {
            Some(raw) => {
                // Re-read the companion records too; only the fee snapshot
                // feeds the mirror but a revert in any read must leave the
                // entry untouched.
                let _info = view
                    .rpc
                    .open_trade_info(trader, pair_index, position_index)
                    .await?;
                let fees = view
                    .rpc
                    .initial_acc_fees(trader, pair_index, position_index)
                    .await?;

                let updated = self
                    .state
                    .mutate(|s| match s.known_open_trades.get_mut(&key) {
                        Some(KnownPosition::OpenMarketTrade(existing)) => {
                            let price_at_open = existing.collateral_price_at_open;
                            *existing = MarketTrade::from_raw(&raw, fees);
                            existing.collateral_price_at_open = price_at_open;
                            true
                        }
                        _ => false,
                    })
                    .await;
                if updated {
                    debug!(key = %key, "market trade refreshed");
                    self.republish().await?;
                } else {
                    info!(key = %key, "refresh for unknown trade, ignoring");
                }
            }
            None => {
                if remove_if_gone {
                    let removed = self
                        .state
                        .mutate(|s| s.known_open_trades.remove(&key).is_some())
                        .await;
                    if removed {
                        info!(key = %key, "trade gone on chain after close cancel, removed");
                        self.republish().await?;
                    }
                } else {
                    info!(key = %key, "refresh target missing on chain, ignoring");
                }
            }
        }
        Ok(())
    }

    /// MarketExecuted(open) / LimitExecuted(Open): remove the matching
    /// pending entry (limit path), then insert the market trade unless the
    /// key already holds one.
    async fn open_market_trade(
        &self,
        collateral: u8,
        trade: &RawTrade,
        executed_limit_index: Option<u32>,
        block: u64,
        tx: ethers::types::H256,
    ) -> Result<()> {
        let view = self.stack_view(collateral).await?;
        let key = TradeKey::new(
            collateral,
            trade.trader,
            trade.pair_index,
            trade.position_index,
            false,
        );

        let fees = view
            .rpc
            .initial_acc_fees(trade.trader, trade.pair_index, trade.position_index)
            .await
            .unwrap_or_default();

        let mut position = MarketTrade::from_raw(trade, fees);
        position.collateral_price_at_open = view.last_price_usd;

        // Pending removal and market insert happen inside one mutate call,
        // so no reader ever observes both entries for the slot.
        let inserted = self
            .state
            .mutate(|s| {
                if let Some(limit_index) = executed_limit_index {
                    let pending_key = TradeKey::new(
                        collateral,
                        trade.trader,
                        trade.pair_index,
                        limit_index,
                        true,
                    );
                    s.known_open_trades.remove(&pending_key);
                }
                if s.has_market_trade(&key) {
                    return false;
                }
                s.known_open_trades
                    .insert(key, KnownPosition::OpenMarketTrade(position));
                true
            })
            .await;

        if !inserted {
            info!(key = %key, "duplicate open event, trade already known");
            return Ok(());
        }

        let now = Utc::now();
        let record = TradeRecord {
            timestamp: now,
            pair_index: trade.pair_index,
            pair: self.pair_name(trade.pair_index).await,
            trader: format!("0x{}", hex::encode(trade.trader.as_bytes())),
            action: if executed_limit_index.is_some() {
                "limit-open".into()
            } else {
                "market-open".into()
            },
            open_price: scaled_price(trade.open_price),
            close_price: None,
            collateral_price_usd: view.last_price_usd,
            buy: trade.buy as u8,
            size: scaled_size(trade.position_size, view.decimals),
            leverage: trade.leverage,
            pnl: Decimal::ZERO,
            block,
            tx: format!("{tx:#x}"),
            uri: record_uri(&key, now, true),
            collateral: view.symbol.clone(),
        };
        self.persist_and_announce(&record).await?;

        info!(key = %key, action = %record.action, "trade opened");
        self.republish().await
    }

    /// MarketExecuted(close) / LimitExecuted(tp|sl|liq): realize PnL,
    /// persist the close record, drop the entry. Unknown keys are logged
    /// and ignored (duplicate or out-of-order close).
    #[allow(clippy::too_many_arguments)]
    async fn close_market_trade(
        &self,
        collateral: u8,
        trade: &RawTrade,
        action: &str,
        price: u128,
        percent_profit: i128,
        position_size: u128,
        block: u64,
        tx: ethers::types::H256,
    ) -> Result<()> {
        let view = self.stack_view(collateral).await?;
        let key = TradeKey::new(
            collateral,
            trade.trader,
            trade.pair_index,
            trade.position_index,
            false,
        );

        let pnl = realized_pnl(position_size, percent_profit);
        let closed = self
            .state
            .mutate(|s| match s.known_open_trades.remove(&key) {
                Some(KnownPosition::OpenMarketTrade(mut existing)) => {
                    existing.realized = Some(ClosedPnl {
                        pnl,
                        percent_profit,
                    });
                    existing.close_price = Some(price);
                    Some(existing)
                }
                Some(other) => {
                    // A pending entry under a market key is a mirror bug;
                    // put it back rather than drop it on a close replay.
                    s.known_open_trades.insert(key, other);
                    None
                }
                None => None,
            })
            .await;

        let Some(closed) = closed else {
            info!(key = %key, action, "close event for unknown trade, ignoring");
            return Ok(());
        };

        let now = Utc::now();
        let record = TradeRecord {
            timestamp: now,
            pair_index: trade.pair_index,
            pair: self.pair_name(trade.pair_index).await,
            trader: format!("0x{}", hex::encode(trade.trader.as_bytes())),
            action: action.into(),
            open_price: scaled_price(closed.open_price),
            close_price: Some(scaled_price(price)),
            collateral_price_usd: view.last_price_usd,
            buy: closed.buy as u8,
            size: scaled_size(position_size, view.decimals),
            leverage: closed.leverage,
            pnl: scaled_size_signed(pnl, view.decimals),
            block,
            tx: format!("{tx:#x}"),
            uri: record_uri(&key, now, false),
            collateral: view.symbol.clone(),
        };
        self.persist_and_announce(&record).await?;

        info!(key = %key, action, pnl = %record.pnl, "trade closed");
        self.republish().await
    }

    async fn persist_and_announce(&self, record: &TradeRecord) -> Result<()> {
        self.store.upsert(record).await?;
        bus::publish_typed(self.bus.as_ref(), channel::NEW_TRADES, record).await
    }

    /// Publish the reduced snapshot after a successful mutation: the full
    /// trading variables (set+publish) and the raw open-trades map
    /// (set-only, scanned by the liquidation keeper).
    async fn republish(&self) -> Result<()> {
        let snapshot = self.state.snapshot().await;
        bus::set_typed(
            self.bus.as_ref(),
            channel::OPENED_TRADES,
            &snapshot.known_open_trades,
        )
        .await?;
        bus::set_and_publish(self.bus.as_ref(), channel::TRADING_VARIABLES, &snapshot).await
    }
}

/// 1e10-scaled on-chain price to display decimal
fn scaled_price(price: u128) -> Decimal {
    Decimal::from_i128_with_scale(price as i128, 10).normalize()
}

/// Collateral-precision size to display decimal
fn scaled_size(size: u128, decimals: u8) -> Decimal {
    Decimal::from_i128_with_scale(size as i128, decimals as u32).normalize()
}

fn scaled_size_signed(value: i128, decimals: u8) -> Decimal {
    Decimal::from_i128_with_scale(value, decimals as u32).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::chain::rpc::MockExchangeRpc;
    use crate::chain::types::{InitialAccFees, LimitOrderKind, RawLimitOrder, RawTradeInfo};
    use crate::state::types::{CollateralStack, GlobalAppState};
    use crate::sync::records::MemoryTradeStore;
    use ethers::types::H256;

    fn trader() -> Address {
        Address::repeat_byte(0x11)
    }

    fn raw_limit_order() -> RawLimitOrder {
        RawLimitOrder {
            trader: trader(),
            pair_index: 1,
            position_index: 0,
            buy: true,
            leverage: 20,
            kind: LimitOrderKind::Limit,
            min_price: 1790_0000000000,
            max_price: 1800_0000000000,
            tp: 1900_0000000000,
            sl: 0,
            position_size: 500_000000,
            placed_block: 100,
        }
    }

    fn raw_trade() -> RawTrade {
        RawTrade {
            trader: trader(),
            pair_index: 1,
            position_index: 0,
            buy: true,
            leverage: 20,
            open_price: 1800_0000000000,
            tp: 1900_0000000000,
            sl: 0,
            position_size: 500_000000,
        }
    }

    struct Fixture {
        sync: EventSynchronizer,
        state: StateHandle,
        store: Arc<MemoryTradeStore>,
    }

    async fn fixture(rpc: MockExchangeRpc) -> Fixture {
        let state = StateHandle::new(GlobalAppState::default());
        state
            .mutate(|s| {
                let mut stack = CollateralStack::new(0, "USDC".into(), Arc::new(rpc));
                stack.info = crate::chain::types::CollateralInfo::new(6);
                s.collaterals.insert(0, stack);
            })
            .await;
        let store = Arc::new(MemoryTradeStore::new());
        let sync = EventSynchronizer::new(
            state.clone(),
            Arc::new(InMemoryBus::new()),
            store.clone(),
            Duration::from_millis(0),
        );
        Fixture { sync, state, store }
    }

    fn limit_placed() -> ChainEvent {
        ChainEvent::OpenLimitPlaced {
            collateral: 0,
            trader: trader(),
            pair_index: 1,
            position_index: 0,
        }
    }

    #[tokio::test]
    async fn test_limit_placed_upserts_pending_entry() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_open_limit_order()
            .returning(|_, _, _| Ok(Some(raw_limit_order())));
        let f = fixture(rpc).await;

        f.sync.apply(limit_placed()).await.unwrap();
        // Replay with identical payload is a pure overwrite.
        f.sync.apply(limit_placed()).await.unwrap();

        let key = TradeKey::new(0, trader(), 1, 0, true);
        let entry = f
            .state
            .read(|s| s.known_open_trades.get(&key).cloned())
            .await
            .unwrap();
        assert!(entry.is_pending_limit());
        assert_eq!(f.state.read(|s| s.known_open_trades.len()).await, 1);
    }

    #[tokio::test]
    async fn test_limit_placed_skips_when_gone_on_chain() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_open_limit_order().returning(|_, _, _| Ok(None));
        let f = fixture(rpc).await;

        f.sync.apply(limit_placed()).await.unwrap();
        assert_eq!(f.state.read(|s| s.known_open_trades.len()).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_cancel_tolerated() {
        let f = fixture(MockExchangeRpc::new()).await;
        let cancel = ChainEvent::OpenLimitCanceled {
            collateral: 0,
            trader: trader(),
            pair_index: 1,
            position_index: 0,
        };
        assert!(f.sync.apply(cancel.clone()).await.is_ok());
        assert!(f.sync.apply(cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_limit_executed_open_swaps_pending_for_market() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_open_limit_order()
            .returning(|_, _, _| Ok(Some(raw_limit_order())));
        rpc.expect_initial_acc_fees()
            .returning(|_, _, _| Ok(InitialAccFees::default()));
        let f = fixture(rpc).await;

        f.sync.apply(limit_placed()).await.unwrap();
        f.sync
            .apply(ChainEvent::LimitExecuted {
                collateral: 0,
                order_kind: TriggerKind::Open,
                trade: raw_trade(),
                limit_index: 0,
                price: 1800_0000000000,
                percent_profit: 0,
                position_size: 500_000000,
                block: 120,
                tx: H256::repeat_byte(1),
            })
            .await
            .unwrap();

        let (pending, market) = f
            .state
            .read(|s| {
                let pending = s
                    .known_open_trades
                    .contains_key(&TradeKey::new(0, trader(), 1, 0, true));
                let market = s
                    .known_open_trades
                    .get(&TradeKey::new(0, trader(), 1, 0, false))
                    .cloned();
                (pending, market)
            })
            .await;
        // Never both entries for the same underlying slot.
        assert!(!pending);
        assert!(market.unwrap().is_market_trade());
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_open_event_is_noop() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_initial_acc_fees()
            .returning(|_, _, _| Ok(InitialAccFees::default()));
        let f = fixture(rpc).await;

        let open = ChainEvent::MarketExecuted {
            collateral: 0,
            trade: raw_trade(),
            open: true,
            price: 1800_0000000000,
            percent_profit: 0,
            position_size: 500_000000,
            block: 120,
            tx: H256::repeat_byte(2),
        };
        f.sync.apply(open.clone()).await.unwrap();
        let before = f
            .state
            .read(|s| s.known_open_trades.clone())
            .await;
        let records_before = f.store.len();

        f.sync.apply(open).await.unwrap();
        let after = f.state.read(|s| s.known_open_trades.clone()).await;
        assert_eq!(before, after);
        assert_eq!(f.store.len(), records_before);
    }

    #[tokio::test]
    async fn test_close_realizes_pnl_and_removes_entry() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_initial_acc_fees()
            .returning(|_, _, _| Ok(InitialAccFees::default()));
        let f = fixture(rpc).await;

        f.sync
            .apply(ChainEvent::MarketExecuted {
                collateral: 0,
                trade: raw_trade(),
                open: true,
                price: 1800_0000000000,
                percent_profit: 0,
                position_size: 500_000000,
                block: 120,
                tx: H256::repeat_byte(3),
            })
            .await
            .unwrap();

        // +5%: percent_profit = 5 * 1e10 * 1e... at the combined 1e12 scale
        f.sync
            .apply(ChainEvent::MarketExecuted {
                collateral: 0,
                trade: raw_trade(),
                open: false,
                price: 1890_0000000000,
                percent_profit: 50_000_000_000,
                position_size: 500_000000,
                block: 130,
                tx: H256::repeat_byte(4),
            })
            .await
            .unwrap();

        assert_eq!(f.state.read(|s| s.known_open_trades.len()).await, 0);
        assert_eq!(f.store.len(), 2);

        let close = f
            .store
            .get(&record_uri(
                &TradeKey::new(0, trader(), 1, 0, false),
                Utc::now(),
                false,
            ))
            .expect("close record");
        // 500 USDC (1e6) * 5% = 25 USDC
        assert_eq!(close.pnl, rust_decimal_macros::dec!(25));
        assert_eq!(close.close_price, Some(rust_decimal_macros::dec!(1890)));
        assert_eq!(close.action, "market-close");
    }

    #[tokio::test]
    async fn test_close_for_unknown_trade_ignored() {
        let f = fixture(MockExchangeRpc::new()).await;
        let result = f
            .sync
            .apply(ChainEvent::MarketExecuted {
                collateral: 0,
                trade: raw_trade(),
                open: false,
                price: 1890_0000000000,
                percent_profit: 50_000_000_000,
                position_size: 500_000000,
                block: 130,
                tx: H256::repeat_byte(5),
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(f.store.len(), 0);
    }

    #[tokio::test]
    async fn test_market_close_canceled_refreshes_when_still_open() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_initial_acc_fees()
            .returning(|_, _, _| Ok(InitialAccFees::default()));
        let mut refreshed = raw_trade();
        refreshed.tp = 2000_0000000000;
        rpc.expect_open_trade()
            .returning(move |_, _, _| Ok(Some(refreshed.clone())));
        rpc.expect_open_trade_info()
            .returning(|_, _, _| Ok(RawTradeInfo::default()));
        let f = fixture(rpc).await;

        f.sync
            .apply(ChainEvent::MarketExecuted {
                collateral: 0,
                trade: raw_trade(),
                open: true,
                price: 1800_0000000000,
                percent_profit: 0,
                position_size: 500_000000,
                block: 120,
                tx: H256::repeat_byte(6),
            })
            .await
            .unwrap();

        f.sync
            .apply(ChainEvent::MarketCloseCanceled {
                collateral: 0,
                trader: trader(),
                pair_index: 1,
                position_index: 0,
            })
            .await
            .unwrap();

        let key = TradeKey::new(0, trader(), 1, 0, false);
        let entry = f
            .state
            .read(|s| s.known_open_trades.get(&key).cloned())
            .await
            .unwrap();
        match entry {
            KnownPosition::OpenMarketTrade(trade) => {
                assert_eq!(trade.tp, 2000_0000000000)
            }
            _ => panic!("expected market trade"),
        }
    }

    #[tokio::test]
    async fn test_market_close_canceled_removes_when_gone() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_initial_acc_fees()
            .returning(|_, _, _| Ok(InitialAccFees::default()));
        rpc.expect_open_trade().returning(|_, _, _| Ok(None));
        let f = fixture(rpc).await;

        f.sync
            .apply(ChainEvent::MarketExecuted {
                collateral: 0,
                trade: raw_trade(),
                open: true,
                price: 1800_0000000000,
                percent_profit: 0,
                position_size: 500_000000,
                block: 120,
                tx: H256::repeat_byte(7),
            })
            .await
            .unwrap();

        f.sync
            .apply(ChainEvent::MarketCloseCanceled {
                collateral: 0,
                trader: trader(),
                pair_index: 1,
                position_index: 0,
            })
            .await
            .unwrap();

        assert_eq!(f.state.read(|s| s.known_open_trades.len()).await, 0);
        // Reconciliation-path removal: no close record is written.
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_event_error_leaves_state_unchanged() {
        let mut rpc = MockExchangeRpc::new();
        rpc.expect_open_limit_order()
            .returning(|_, _, _| Err(PerpdError::ChainRead("execution reverted".into())));
        let f = fixture(rpc).await;

        let result = f.sync.apply(limit_placed()).await;
        assert!(result.is_err());
        assert_eq!(f.state.read(|s| s.known_open_trades.len()).await, 0);
    }
}
