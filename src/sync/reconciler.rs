//! Bulk reconciliation: periodically re-read the full on-chain state and
//! replace the mirror's per-collateral slices wholesale.
//!
//! This is the primary defense against missed or reordered events: a pass
//! must converge the mirror to what an exhaustive event replay would have
//! produced. Concurrent calls for the same collateral collapse into the
//! running pass instead of duplicating the fetch burst.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::bus::{self, channel, DistributionBus};
use crate::error::{PerpdError, Result};
use crate::state::handle::StateHandle;
use crate::state::types::{OiWindows, PairMeta};

enum PassRole {
    Leader(watch::Sender<bool>),
    Joiner(watch::Receiver<bool>),
}

pub struct BulkReconciler {
    state: StateHandle,
    bus: Arc<dyn DistributionBus>,
    in_flight: Mutex<HashMap<u8, watch::Receiver<bool>>>,
}

impl BulkReconciler {
    pub fn new(state: StateHandle, bus: Arc<dyn DistributionBus>) -> Self {
        Self {
            state,
            bus,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile one collateral. Idempotent; a call that overlaps an
    /// in-flight pass for the same collateral awaits that pass instead of
    /// starting another.
    pub async fn reconcile(&self, collateral: u8) -> Result<()> {
        let role = {
            let mut guard = self.in_flight.lock().await;
            match guard.get(&collateral) {
                Some(rx) => PassRole::Joiner(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    guard.insert(collateral, rx);
                    PassRole::Leader(tx)
                }
            }
        };

        match role {
            PassRole::Joiner(mut rx) => {
                debug!(collateral, "joining in-flight reconciliation pass");
                let _ = rx.changed().await;
                Ok(())
            }
            PassRole::Leader(tx) => {
                let result = self.run_pass(collateral).await;
                self.in_flight.lock().await.remove(&collateral);
                let _ = tx.send(true);
                result.map_err(|e| PerpdError::Reconciliation {
                    collateral,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Reconcile every known collateral; failures are isolated per
    /// collateral and retried once after `retry_delay`.
    pub async fn reconcile_all(&self, retry_delay: Duration) {
        let collaterals: Vec<u8> = self
            .state
            .read(|s| s.collaterals.keys().copied().collect())
            .await;
        for collateral in collaterals {
            if let Err(e) = self.reconcile(collateral).await {
                warn!(collateral, error = %e, "reconciliation failed, retrying once");
                tokio::time::sleep(retry_delay).await;
                if let Err(e) = self.reconcile(collateral).await {
                    warn!(collateral, error = %e, "reconciliation retry failed");
                }
            }
        }
    }

    /// Run on the configured interval until shutdown. The interval timer
    /// itself is never canceled by a failed pass.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        retry_delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile_all(retry_delay).await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One full pass: every sub-fetch completes before any write lands, so
    /// the collateral's slices are replaced atomically.
    async fn run_pass(&self, collateral: u8) -> Result<()> {
        let rpc = self
            .state
            .read(|s| s.collaterals.get(&collateral).map(|stack| stack.rpc.clone()))
            .await
            .ok_or(PerpdError::UnknownCollateral(collateral))?;

        let pair_count = rpc.pair_count().await?;
        let info = rpc.collateral_info().await?;
        let oi_settings = rpc.oi_window_settings().await?;
        let price_usd = rpc.collateral_price_usd().await?;

        let mut pairs = Vec::with_capacity(pair_count as usize);
        let mut open_interest = BTreeMap::new();
        let mut borrowing_pairs = BTreeMap::new();
        for pair_index in 0..pair_count {
            let pair = rpc.pair(pair_index).await?;
            let depth = rpc.pair_depth(pair_index).await?;
            let max_leverage = rpc.pair_max_leverage(pair_index).await?;
            pairs.push(PairMeta {
                index: pair_index,
                from: pair.from,
                to: pair.to,
                spread_p: pair.spread_p,
                group_index: pair.group_index,
                depth,
                max_leverage,
                feed: pair.feed,
            });
            open_interest.insert(pair_index, rpc.open_interest(pair_index).await?);
            borrowing_pairs.insert(pair_index, rpc.borrowing_pair(pair_index).await?);
        }

        let group_count = rpc.borrowing_group_count().await?;
        let mut borrowing_groups = BTreeMap::new();
        for group_index in 0..group_count {
            borrowing_groups.insert(group_index, rpc.borrowing_group(group_index).await?);
        }

        let now = Utc::now().timestamp().max(0) as u64;
        let current_id = oi_settings.window_id(now);
        let from_id = current_id.saturating_sub(oi_settings.windows_count.saturating_sub(1));
        let mut oi_windows: HashMap<u32, OiWindows> = HashMap::new();
        for pair_index in 0..pair_count {
            let windows = rpc
                .active_oi_windows(pair_index, from_id, current_id)
                .await?;
            oi_windows.insert(pair_index, OiWindows { windows });
        }

        self.state
            .mutate(|s| {
                if let Some(stack) = s.collaterals.get_mut(&collateral) {
                    stack.info = info;
                    stack.oi_settings = oi_settings;
                    stack.last_price_usd = Some(price_usd);
                    stack.open_interest = open_interest;
                    stack.borrowing_pairs = borrowing_pairs;
                    stack.borrowing_groups = borrowing_groups;
                }
                s.pairs = pairs;
                s.oi_windows.retain(|(c, _), _| *c != collateral);
                for (pair_index, windows) in oi_windows {
                    s.oi_windows.insert((collateral, pair_index), windows);
                }
            })
            .await;

        let snapshot = self.state.snapshot().await;
        bus::set_typed(
            self.bus.as_ref(),
            channel::OPENED_TRADES,
            &snapshot.known_open_trades,
        )
        .await?;
        bus::set_and_publish(self.bus.as_ref(), channel::TRADING_VARIABLES, &snapshot).await?;

        info!(
            collateral,
            pairs = pair_count,
            groups = group_count,
            "reconciliation pass complete"
        );
        Ok(())
    }
}
