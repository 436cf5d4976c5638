//! Process wiring for the three run modes.
//!
//! Every mode runs the same synchronization core (provider pool, block
//! listeners, collateral stacks, bulk reconciler, event synchronizer,
//! price ingestion) against its own state handle and bus; keeper modes
//! additionally run a trigger engine fed by the bus. Failover tears down
//! the provider-bound tasks, rebuilds the stacks against the new endpoint,
//! and restarts the timers; the pool itself only decides.

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{DistributionBus, InMemoryBus};
use crate::chain::contracts::{ContractAddresses, EthersExchange, WsEventSource};
use crate::chain::listener::BlockListener;
use crate::chain::provider::{ProviderPool, ReconnectPolicy};
use crate::chain::rpc::{EventSource, ExchangeRpc};
use crate::chain::types::ChainEvent;
use crate::config::AppConfig;
use crate::error::{PerpdError, Result};
use crate::price::ingestion::PriceIngestion;
use crate::price::oracle::{HttpOracleClient, OracleClient};
use crate::state::handle::StateHandle;
use crate::state::types::{CollateralStack, GlobalAppState, ProviderView};
use crate::sync::events::EventSynchronizer;
use crate::sync::reconciler::BulkReconciler;
use crate::sync::records::{PgTradeStore, TradeStore};
use crate::tasks::{spawn_interval, spawn_named, ShutdownController, TaskHandle};
use crate::trigger::engine::{TriggerEngine, TriggerMode};

/// Which process this instance is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sync,
    OrdersKeeper,
    LiquidationsKeeper,
}

impl RunMode {
    fn trigger_mode(self) -> Option<TriggerMode> {
        match self {
            RunMode::Sync => None,
            RunMode::OrdersKeeper => Some(TriggerMode::Orders),
            RunMode::LiquidationsKeeper => Some(TriggerMode::Liquidations),
        }
    }
}

struct Components {
    config: AppConfig,
    mode: RunMode,
    bus: Arc<dyn DistributionBus>,
    state: StateHandle,
    pool: Arc<ProviderPool>,
    store: Arc<dyn TradeStore>,
    oracle: Arc<dyn OracleClient>,
    shutdown: ShutdownController,
}

/// Run one process until ctrl-c.
pub async fn run(config: AppConfig, mode: RunMode) -> Result<()> {
    config.validate()?;
    if mode.trigger_mode().is_some() && config.chain.keeper_key.is_none() {
        return Err(PerpdError::MissingConfig(
            "chain.keeper_key is required for keeper modes".into(),
        ));
    }

    let shutdown = ShutdownController::new();
    let state = StateHandle::new(GlobalAppState {
        provider_view: ProviderView {
            endpoints: config.chain.rpc_urls.clone(),
            current_index: 0,
            last_blocks: vec![0; config.chain.rpc_urls.len()],
        },
        ..Default::default()
    });
    let pool = Arc::new(ProviderPool::new(
        config.chain.rpc_urls.clone(),
        config.chain.max_block_drift,
    ));

    let (failover_tx, mut failover_rx) = mpsc::channel(16);
    let listener = BlockListener::new(pool.clone(), ReconnectPolicy::default(), failover_tx);
    let listeners = listener.spawn_all(shutdown.subscribe());

    let store: Arc<dyn TradeStore> = Arc::new(
        PgTradeStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    let oracle: Arc<dyn OracleClient> = Arc::new(HttpOracleClient::new(
        config.oracle.endpoint.clone(),
        Duration::from_millis(config.oracle.timeout_ms),
    )?);
    let bus: Arc<dyn DistributionBus> = Arc::new(InMemoryBus::new());

    let components = Components {
        config,
        mode,
        bus,
        state,
        pool: pool.clone(),
        store,
        oracle,
        shutdown: shutdown.clone(),
    };

    let mut active = activate_provider(&components, pool.current_index()).await?;
    info!(mode = ?mode, provider = pool.current_index(), "process started");

    loop {
        tokio::select! {
            maybe_failover = failover_rx.recv() => {
                let Some(failover) = maybe_failover else { break };
                // Same-index switches are a no-op by the pool's guard.
                if !pool.select(failover.to) {
                    continue;
                }
                warn!(
                    from = failover.from,
                    to = failover.to,
                    "failing over: restarting provider-bound components"
                );
                for task in active.drain(..) {
                    task.abort();
                }
                match activate_provider(&components, failover.to).await {
                    Ok(tasks) => active = tasks,
                    Err(e) => {
                        error!(error = %e, "failed to activate provider after failover");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                shutdown.trigger();
                break;
            }
        }
    }

    for task in active.drain(..) {
        task.abort();
    }
    for task in listeners {
        task.abort();
    }
    Ok(())
}

/// Build the collateral stacks against one provider endpoint and start
/// every provider-bound task. Returns the handles so failover can tear
/// them down.
async fn activate_provider(components: &Components, index: usize) -> Result<Vec<TaskHandle>> {
    let url = components
        .pool
        .url(index)
        .ok_or_else(|| PerpdError::Provider(format!("no endpoint at index {index}")))?;
    let provider = Arc::new(
        Provider::<Ws>::connect(url)
            .await
            .map_err(|e| PerpdError::Provider(e.to_string()))?,
    );

    let mut tasks = Vec::new();
    let mut rpcs: BTreeMap<u8, Arc<dyn ExchangeRpc>> = BTreeMap::new();
    let mut stacks: BTreeMap<u8, CollateralStack> = BTreeMap::new();
    let (event_tx, event_rx) = mpsc::channel::<ChainEvent>(1024);

    for entry in &components.config.collaterals {
        let addresses = ContractAddresses::parse(entry)?;
        let rpc = build_rpc(components, entry.index, provider.clone(), addresses).await?;
        rpcs.insert(entry.index, rpc.clone());
        stacks.insert(
            entry.index,
            CollateralStack::new(entry.index, entry.symbol.clone(), rpc),
        );

        // One merged event pipe: per-collateral sources forward into the
        // single applier so mutations stay serialized.
        let source = WsEventSource::new(entry.index, provider.clone(), addresses);
        let mut source_rx = source.subscribe().await?;
        let forward_tx = event_tx.clone();
        tasks.push(spawn_named("event-forwarder", async move {
            while let Some(event) = source_rx.recv().await {
                if forward_tx.send(event).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(event_tx);

    // Swap the new active configuration in atomically; open trades survive
    // the switch, the reconciler refreshes the rest.
    components
        .state
        .mutate(|s| {
            s.collaterals = stacks;
            s.provider_view.current_index = index;
        })
        .await;

    let synchronizer = Arc::new(EventSynchronizer::new(
        components.state.clone(),
        components.bus.clone(),
        components.store.clone(),
        Duration::from_millis(components.config.chain.confirmation_delay_ms),
    ));
    let sync_shutdown = components.shutdown.subscribe();
    tasks.push(spawn_named("event-synchronizer", async move {
        synchronizer.run(event_rx, sync_shutdown).await;
    }));

    // The first interval tick fires immediately, which doubles as the
    // bootstrap reconciliation after (re)selection.
    let reconciler = Arc::new(BulkReconciler::new(
        components.state.clone(),
        components.bus.clone(),
    ));
    let reconcile_interval = components.config.sync.reconcile_interval();
    let reconcile_retry = components.config.sync.reconcile_retry();
    let reconciler_shutdown = components.shutdown.subscribe();
    tasks.push(spawn_named("bulk-reconciler", async move {
        reconciler
            .run(reconcile_interval, reconcile_retry, reconciler_shutdown)
            .await;
    }));

    let ingestion = Arc::new(PriceIngestion::new(
        components.oracle.clone(),
        components.bus.clone(),
        components.state.clone(),
    ));
    tasks.push(spawn_interval(
        "price-ingestion",
        Duration::from_millis(components.config.oracle.poll_interval_ms),
        components.shutdown.subscribe(),
        move || {
            let ingestion = ingestion.clone();
            async move {
                if let Err(e) = ingestion.fetch_and_publish().await {
                    warn!(error = %e, "price poll failed");
                }
            }
        },
    ));

    // Mirror per-provider block heights into the state view so snapshots
    // carry the block tracking consumers expect.
    let view_pool = components.pool.clone();
    let view_state = components.state.clone();
    tasks.push(spawn_interval(
        "provider-view",
        Duration::from_secs(5),
        components.shutdown.subscribe(),
        move || {
            let pool = view_pool.clone();
            let state = view_state.clone();
            async move {
                let heights: Vec<u64> = (0..pool.endpoints().len())
                    .map(|i| pool.block_height(i))
                    .collect();
                let current = pool.current_index();
                state
                    .mutate(|s| {
                        s.last_synced_block = heights.get(current).copied().unwrap_or_default();
                        s.provider_view.last_blocks = heights;
                        s.provider_view.current_index = current;
                    })
                    .await;
            }
        },
    ));

    if let Some(trigger_mode) = components.mode.trigger_mode() {
        let engine = Arc::new(TriggerEngine::new(
            trigger_mode,
            components.bus.clone(),
            rpcs,
            components.config.trigger.clone(),
        ));
        let engine_shutdown = components.shutdown.subscribe();
        tasks.push(spawn_named("trigger-engine", async move {
            engine.run(engine_shutdown).await;
        }));
    }

    Ok(tasks)
}

/// Keepers sign trigger transactions, so their contract handles wrap a
/// signer middleware; the synchronizer reads only.
async fn build_rpc(
    components: &Components,
    collateral: u8,
    provider: Arc<Provider<Ws>>,
    addresses: ContractAddresses,
) -> Result<Arc<dyn ExchangeRpc>> {
    match &components.config.chain.keeper_key {
        Some(key) if components.mode.trigger_mode().is_some() => {
            let wallet: LocalWallet = key
                .parse()
                .map_err(|_| PerpdError::MissingConfig("chain.keeper_key is not a valid key".into()))?;
            let chain_id = provider
                .get_chainid()
                .await
                .map_err(|e| PerpdError::Provider(e.to_string()))?;
            let wallet = wallet.with_chain_id(chain_id.as_u64());
            let client = Arc::new(SignerMiddleware::new(provider.as_ref().clone(), wallet));
            Ok(Arc::new(EthersExchange::new(collateral, client, addresses)))
        }
        _ => Ok(Arc::new(EthersExchange::new(
            collateral,
            provider,
            addresses,
        ))),
    }
}
