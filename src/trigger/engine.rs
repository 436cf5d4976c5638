//! Trigger engine: turns price proofs into on-chain trigger transactions.
//!
//! Runs in two flavors: the orders keeper (limit fills and TP/SL) and the
//! liquidations keeper. Both consume the same bus snapshots, evaluate the
//! predicates over the latest price map, re-verify each candidate against
//! chain right before submission, and send sequentially under a single
//! in-process pass lock. A proof arriving while a pass is active is
//! dropped, not queued; the next proof re-evaluates everything anyway.

use ethers::types::Bytes;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{self, channel, DistributionBus};
use crate::chain::rpc::ExchangeRpc;
use crate::chain::types::{TriggerKind, TriggerParams};
use crate::config::TriggerConfig;
use crate::error::Result;
use crate::price::feed::PriceMap;
use crate::price::oracle::ProofEnvelope;
use crate::state::types::{KnownPosition, TradeKey};
use crate::trigger::predicate;

/// Which trigger families this engine instance evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Limit fills plus take-profit / stop-loss
    Orders,
    Liquidations,
}

/// One submission candidate, built per matching cycle and consumed once.
#[derive(Debug, Clone)]
pub struct TriggerOrder {
    pub collateral: u8,
    pub kind: TriggerKind,
    pub key: TradeKey,
    pub proof: Bytes,
}

pub struct TriggerEngine {
    mode: TriggerMode,
    bus: Arc<dyn DistributionBus>,
    rpcs: BTreeMap<u8, Arc<dyn ExchangeRpc>>,
    config: TriggerConfig,
    pass_active: AtomicBool,
}

impl TriggerEngine {
    pub fn new(
        mode: TriggerMode,
        bus: Arc<dyn DistributionBus>,
        rpcs: BTreeMap<u8, Arc<dyn ExchangeRpc>>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            mode,
            bus,
            rpcs,
            config,
            pass_active: AtomicBool::new(false),
        }
    }

    /// Follow `price-proof` events until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut proofs = self.bus.subscribe(channel::PRICE_PROOF);
        loop {
            tokio::select! {
                msg = proofs.recv() => match msg {
                    Ok(value) => match serde_json::from_value::<ProofEnvelope>(value) {
                        Ok(envelope) => {
                            self.on_proof(envelope).await;
                        }
                        Err(e) => warn!(error = %e, "undecodable proof event"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "proof stream lagged, continuing from newest");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Handle one proof event. Returns false when the event was dropped
    /// because a matching pass is already running.
    pub async fn on_proof(&self, envelope: ProofEnvelope) -> bool {
        if self.pass_active.swap(true, Ordering::SeqCst) {
            info!(mode = ?self.mode, "matching pass already active, dropping proof event");
            return false;
        }
        let result = self.matching_pass(envelope).await;
        self.pass_active.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            warn!(mode = ?self.mode, error = %e, "matching pass failed");
        }
        true
    }

    async fn matching_pass(&self, envelope: ProofEnvelope) -> Result<()> {
        let Some(positions) = bus::get_typed::<BTreeMap<String, KnownPosition>>(
            self.bus.as_ref(),
            channel::OPENED_TRADES,
        )
        .await?
        else {
            debug!("no opened-trades snapshot yet");
            return Ok(());
        };
        let Some(prices) =
            bus::get_typed::<PriceMap>(self.bus.as_ref(), channel::CURRENT_PRICES).await?
        else {
            debug!("no price snapshot yet");
            return Ok(());
        };

        let candidates = self.evaluate(&positions, &prices, &envelope.proof);
        if candidates.is_empty() {
            return Ok(());
        }
        info!(
            mode = ?self.mode,
            candidates = candidates.len(),
            "triggerable positions found"
        );
        self.submit_all(candidates).await;
        Ok(())
    }

    /// Pure evaluation over the snapshots; no chain access.
    fn evaluate(
        &self,
        positions: &BTreeMap<String, KnownPosition>,
        prices: &PriceMap,
        proof: &Bytes,
    ) -> Vec<TriggerOrder> {
        let mut candidates = Vec::new();
        for (uri, position) in positions {
            let Ok(key) = uri.parse::<TradeKey>() else {
                warn!(uri = %uri, "unparseable trade key in snapshot");
                continue;
            };
            let Some(entry) = prices.get(&key.pair_index) else {
                continue;
            };
            let current = entry.price;

            match (self.mode, position) {
                (TriggerMode::Orders, KnownPosition::PendingLimitOrder(order)) => {
                    // The order's trigger is maxPrice for buys, minPrice for
                    // sells; they coincide when the order pins one price.
                    let trigger = if order.buy {
                        chain_price(order.max_price)
                    } else {
                        chain_price(order.min_price)
                    };
                    if predicate::open_order_triggerable(order.kind, order.buy, current, trigger) {
                        candidates.push(TriggerOrder {
                            collateral: key.collateral,
                            kind: TriggerKind::Open,
                            key,
                            proof: proof.clone(),
                        });
                    }
                }
                (TriggerMode::Orders, KnownPosition::OpenMarketTrade(trade)) => {
                    if predicate::take_profit_triggerable(
                        trade.buy,
                        current,
                        chain_price(trade.tp),
                    ) {
                        candidates.push(TriggerOrder {
                            collateral: key.collateral,
                            kind: TriggerKind::TakeProfit,
                            key,
                            proof: proof.clone(),
                        });
                    } else if predicate::stop_loss_triggerable(
                        trade.buy,
                        current,
                        chain_price(trade.sl),
                    ) {
                        candidates.push(TriggerOrder {
                            collateral: key.collateral,
                            kind: TriggerKind::StopLoss,
                            key,
                            proof: proof.clone(),
                        });
                    }
                }
                (TriggerMode::Liquidations, KnownPosition::OpenMarketTrade(trade)) => {
                    let liquidation = predicate::liquidation_price(
                        chain_price(trade.open_price),
                        trade.buy,
                        trade.leverage,
                    );
                    if predicate::liquidation_triggerable(trade.buy, current, liquidation) {
                        candidates.push(TriggerOrder {
                            collateral: key.collateral,
                            kind: TriggerKind::Liquidation,
                            key,
                            proof: proof.clone(),
                        });
                    }
                }
                (TriggerMode::Liquidations, KnownPosition::PendingLimitOrder(_)) => {}
            }
        }
        candidates
    }

    /// Sequential submission with pacing; one failure skips that order
    /// only, the rest of the queue still attempts.
    async fn submit_all(&self, candidates: Vec<TriggerOrder>) {
        for order in candidates {
            match self.submit_one(&order).await {
                Ok(true) => {
                    tokio::time::sleep(self.config.delay_between_sends()).await;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        key = %order.key,
                        kind = ?order.kind,
                        error = %e,
                        "trigger submission failed"
                    );
                    tokio::time::sleep(self.config.delay_after_failure()).await;
                }
            }
        }
    }

    /// Re-verify the position still exists on chain, then submit. The
    /// re-check is the dedupe guard against racing a stale mirror across
    /// overlapping proof events.
    async fn submit_one(&self, order: &TriggerOrder) -> Result<bool> {
        let Some(rpc) = self.rpcs.get(&order.collateral) else {
            warn!(collateral = order.collateral, "no RPC handle for collateral");
            return Ok(false);
        };

        let still_there = match order.kind {
            TriggerKind::Open => {
                rpc.has_open_limit_order(
                    order.key.trader,
                    order.key.pair_index,
                    order.key.position_index,
                )
                .await?
            }
            _ => {
                rpc.has_open_trade(
                    order.key.trader,
                    order.key.pair_index,
                    order.key.position_index,
                )
                .await?
            }
        };
        if !still_there {
            info!(key = %order.key, kind = ?order.kind, "already gone on chain, skipping");
            return Ok(false);
        }

        let params = TriggerParams {
            kind: order.kind,
            trader: order.key.trader,
            pair_index: order.key.pair_index,
            position_index: order.key.position_index,
        };
        let tx = rpc.trigger_order(params, order.proof.clone()).await?;
        info!(key = %order.key, kind = ?order.kind, tx = %format!("{tx:#x}"), "trigger submitted");
        Ok(true)
    }
}

/// 1e10-scaled chain price to a comparable decimal
fn chain_price(price: u128) -> Decimal {
    Decimal::from_i128_with_scale(price as i128, 10).normalize()
}
