//! Per-endpoint block listeners.
//!
//! Every provider in the pool gets one task that subscribes to new block
//! headers over websocket and feeds heights into the pool. Failover
//! decisions surface on a channel for the app layer to enact. Connection
//! drops start a reconnection campaign under the pool's backoff policy;
//! exhausted campaigns mark the endpoint unavailable until a later
//! campaign's successful connect re-admits it.

use ethers::providers::{Middleware, Provider, Ws};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::chain::provider::{Failover, ProviderPool, ReconnectPolicy};
use crate::error::{PerpdError, Result};
use crate::tasks::{spawn_named, TaskHandle};

pub struct BlockListener {
    pool: Arc<ProviderPool>,
    policy: ReconnectPolicy,
    failover_tx: mpsc::Sender<Failover>,
}

impl BlockListener {
    pub fn new(
        pool: Arc<ProviderPool>,
        policy: ReconnectPolicy,
        failover_tx: mpsc::Sender<Failover>,
    ) -> Self {
        Self {
            pool,
            policy,
            failover_tx,
        }
    }

    /// One listener task per configured endpoint.
    pub fn spawn_all(&self, shutdown: watch::Receiver<bool>) -> Vec<TaskHandle> {
        self.pool
            .endpoints()
            .iter()
            .enumerate()
            .map(|(index, url)| {
                let pool = self.pool.clone();
                let policy = self.policy;
                let failover_tx = self.failover_tx.clone();
                let url = url.clone();
                let shutdown = shutdown.clone();
                spawn_named("block-listener", async move {
                    run_endpoint(pool, policy, index, url, failover_tx, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_endpoint(
    pool: Arc<ProviderPool>,
    policy: ReconnectPolicy,
    index: usize,
    url: String,
    failover_tx: mpsc::Sender<Failover>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut attempt: u32 = 0;
        // One reconnection campaign: connect, stream until drop, retry with
        // backoff. 404-class errors abort early (the endpoint is wrong).
        loop {
            if *shutdown.borrow() {
                return;
            }
            match stream_blocks(&pool, index, &url, &failover_tx, &mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    warn!(provider = index, "block stream ended, starting new campaign");
                    break;
                }
                Err(e) => {
                    if e.is_non_retryable() {
                        warn!(provider = index, error = %e, "non-retryable, aborting campaign");
                        pool.mark_unavailable(index);
                        break;
                    }
                    attempt += 1;
                    if policy.exhausted(attempt) {
                        warn!(
                            provider = index,
                            attempts = attempt,
                            "reconnect attempts exhausted, marking unavailable"
                        );
                        pool.mark_unavailable(index);
                        break;
                    }
                    pool.mark_reconnecting(index, attempt);
                    let delay = policy.delay_with_jitter(attempt - 1);
                    warn!(
                        provider = index,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
        // Cooldown between independent campaigns for the same endpoint.
        tokio::select! {
            _ = tokio::time::sleep(policy.campaign_cooldown) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn stream_blocks(
    pool: &ProviderPool,
    index: usize,
    url: &str,
    failover_tx: &mpsc::Sender<Failover>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let provider = Provider::<Ws>::connect(url)
        .await
        .map_err(|e| PerpdError::Provider(e.to_string()))?;
    pool.mark_connected(index);
    info!(provider = index, "connected, subscribing to block headers");

    let mut stream = provider
        .subscribe_blocks()
        .await
        .map_err(|e| PerpdError::SubscriptionDropped(e.to_string()))?;

    loop {
        tokio::select! {
            maybe_block = stream.next() => {
                let Some(block) = maybe_block else {
                    return Ok(());
                };
                let Some(number) = block.number else { continue };
                if let Some(failover) = pool.on_new_block(index, number.as_u64()) {
                    info!(
                        from = failover.from,
                        to = failover.to,
                        current_height = failover.current_height,
                        candidate_height = failover.candidate_height,
                        "provider drift exceeded, requesting failover"
                    );
                    let _ = failover_tx.send(failover).await;
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
