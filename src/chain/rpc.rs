//! The on-chain RPC surface the synchronizer and keepers consume.
//!
//! One `ExchangeRpc` handle bundles the contract set of a single collateral
//! stack (storage, trading, callbacks, borrowing fees, aggregator) against
//! one provider. The concrete implementation lives in `chain::contracts`;
//! tests run against `mockall` mocks of these traits.

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::chain::types::{
    BorrowingGroup, BorrowingPair, ChainEvent, CollateralInfo, InitialAccFees, OiWindow,
    OiWindowSettings, PairDepth, PairInfo, PairOpenInterest, RawLimitOrder, RawTrade,
    RawTradeInfo, TriggerParams,
};
use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeRpc: Send + Sync {
    /// Collateral index this handle serves
    fn collateral(&self) -> u8;

    // Pair metadata
    async fn pair_count(&self) -> Result<u32>;
    async fn pair(&self, pair_index: u32) -> Result<PairInfo>;
    async fn pair_depth(&self, pair_index: u32) -> Result<PairDepth>;
    async fn pair_max_leverage(&self, pair_index: u32) -> Result<u32>;

    // Open interest and borrowing fees
    async fn open_interest(&self, pair_index: u32) -> Result<PairOpenInterest>;
    async fn borrowing_pair(&self, pair_index: u32) -> Result<BorrowingPair>;
    async fn borrowing_group(&self, group_index: u32) -> Result<BorrowingGroup>;
    async fn borrowing_group_count(&self) -> Result<u32>;

    // Rolling OI windows
    async fn oi_window_settings(&self) -> Result<OiWindowSettings>;
    async fn active_oi_windows(
        &self,
        pair_index: u32,
        from_id: u64,
        to_id: u64,
    ) -> Result<BTreeMap<u64, OiWindow>>;

    // Collateral facts
    async fn collateral_info(&self) -> Result<CollateralInfo>;
    async fn collateral_price_usd(&self) -> Result<Decimal>;

    // Trade and limit-order storage reads
    async fn open_trade(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<Option<RawTrade>>;
    async fn open_trade_info(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<RawTradeInfo>;
    async fn initial_acc_fees(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<InitialAccFees>;
    async fn open_limit_order(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<Option<RawLimitOrder>>;

    // Existence guards used by keepers right before submission
    async fn has_open_limit_order(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<bool>;
    async fn has_open_trade(
        &self,
        trader: Address,
        pair_index: u32,
        position_index: u32,
    ) -> Result<bool>;

    /// Submit a trigger transaction. Returns the transaction hash.
    async fn trigger_order(&self, params: TriggerParams, proof: Bytes) -> Result<H256>;
}

/// Push-based event feed for one collateral stack.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open the contract event subscriptions and return the decoded stream.
    /// The receiver ends when the underlying subscription drops; callers
    /// re-subscribe through the provider failover path.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChainEvent>>;
}
