//! Price ingestion: poll the oracle, merge multi-leg pairs, republish.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::{self, channel, DistributionBus};
use crate::error::Result;
use crate::price::feed::{resolve_feed, FeedSpec, PriceEntry, PriceMap, ScaledPrice};
use crate::price::oracle::{OracleClient, ProofEnvelope};
use crate::state::handle::StateHandle;

/// Polls the oracle on a short interval and keeps the `current-prices`
/// snapshot and `price-proof` stream fed.
pub struct PriceIngestion {
    oracle: Arc<dyn OracleClient>,
    bus: Arc<dyn DistributionBus>,
    state: StateHandle,
}

impl PriceIngestion {
    pub fn new(
        oracle: Arc<dyn OracleClient>,
        bus: Arc<dyn DistributionBus>,
        state: StateHandle,
    ) -> Self {
        Self { oracle, bus, state }
    }

    /// One ingestion cycle: fetch a proof for every distinct base id the
    /// configured pairs need, resolve direct and derived prices, then
    /// set+publish the merged map and republish the raw proof.
    pub async fn fetch_and_publish(&self) -> Result<()> {
        let pairs: Vec<(u32, FeedSpec)> = self
            .state
            .read(|s| s.pairs.iter().map(|p| (p.index, p.feed)).collect())
            .await;
        if pairs.is_empty() {
            debug!("no pairs configured yet, skipping price poll");
            return Ok(());
        }

        let ids: Vec<u64> = pairs
            .iter()
            .flat_map(|(_, feed)| feed.ids())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let proof = self.oracle.fetch_proof(&ids).await?;

        let mut base: HashMap<u64, ScaledPrice> = HashMap::with_capacity(proof.prices.len());
        let mut round_ts: HashMap<u64, i64> = HashMap::with_capacity(proof.prices.len());
        for p in &proof.prices {
            base.insert(p.id, ScaledPrice::new(p.price, p.decimal));
            round_ts.insert(p.id, p.timestamp);
        }

        let mut merged = PriceMap::with_capacity(pairs.len());
        for (pair_index, feed) in &pairs {
            let Some(resolved) = resolve_feed(feed, &base) else {
                warn!(pair = pair_index, "missing oracle leg, keeping previous price");
                continue;
            };
            let lead_id = feed.ids()[0];
            merged.insert(
                *pair_index,
                PriceEntry {
                    pair_index: *pair_index,
                    pair_id: lead_id,
                    price: resolved.to_decimal(),
                    decimal: resolved.decimal,
                    timestamp: round_ts.get(&lead_id).copied().unwrap_or_default(),
                },
            );
        }

        bus::set_and_publish(self.bus.as_ref(), channel::CURRENT_PRICES, &merged).await?;

        let envelope = ProofEnvelope {
            timestamp: proof
                .prices
                .iter()
                .map(|p| p.timestamp)
                .min()
                .unwrap_or_default(),
            ids,
            proof: proof.proof,
        };
        bus::publish_typed(self.bus.as_ref(), channel::PRICE_PROOF, &envelope).await?;

        debug!(pairs = merged.len(), "published price round");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::chain::types::PairDepth;
    use crate::price::oracle::{MockOracleClient, OracleProof, OraclePrice};
    use crate::state::types::PairMeta;
    use ethers::types::Bytes;
    use rust_decimal_macros::dec;

    fn pair_meta(index: u32, feed: FeedSpec) -> PairMeta {
        PairMeta {
            index,
            from: "ETH".into(),
            to: "USD".into(),
            spread_p: 0,
            group_index: 0,
            depth: PairDepth::default(),
            max_leverage: 150,
            feed,
        }
    }

    #[tokio::test]
    async fn test_fetch_and_publish_direct_and_derived() {
        let state = StateHandle::default();
        state
            .mutate(|s| {
                s.pairs = vec![
                    pair_meta(0, FeedSpec::Direct { id: 1 }),
                    pair_meta(1, FeedSpec::Quotient { num: 1, den: 2 }),
                ];
            })
            .await;

        let mut oracle = MockOracleClient::new();
        oracle.expect_fetch_proof().returning(|ids| {
            assert_eq!(ids, &[1u64, 2][..]);
            Ok(OracleProof {
                prices: vec![
                    OraclePrice {
                        id: 1,
                        price: 3000_00000000,
                        decimal: 8,
                        timestamp: 100,
                    },
                    OraclePrice {
                        id: 2,
                        price: 150_000000,
                        decimal: 6,
                        timestamp: 100,
                    },
                ],
                proof: Bytes::from(vec![0x01, 0x02]),
            })
        });

        let bus = Arc::new(InMemoryBus::new());
        let mut proof_rx = bus.subscribe(channel::PRICE_PROOF);
        let mut price_rx = bus.subscribe(channel::CURRENT_PRICES);

        let ingestion = PriceIngestion::new(Arc::new(oracle), bus.clone(), state);
        ingestion.fetch_and_publish().await.unwrap();

        let published: PriceMap = serde_json::from_value(price_rx.recv().await.unwrap()).unwrap();
        assert_eq!(published.get(&0).unwrap().price, dec!(3000.00000000));
        // 3000 (d8) / 150 (d6) keeps the numerator scale
        assert_eq!(published.get(&1).unwrap().price, dec!(20.00000000));

        let stored: Option<PriceMap> =
            bus::get_typed(bus.as_ref(), channel::CURRENT_PRICES).await.unwrap();
        assert_eq!(stored.unwrap().len(), 2);

        let envelope: ProofEnvelope =
            serde_json::from_value(proof_rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.ids, vec![1, 2]);
        assert_eq!(envelope.proof, Bytes::from(vec![0x01, 0x02]));
    }

    #[tokio::test]
    async fn test_missing_leg_is_skipped_not_fatal() {
        let state = StateHandle::default();
        state
            .mutate(|s| {
                s.pairs = vec![
                    pair_meta(0, FeedSpec::Direct { id: 1 }),
                    pair_meta(1, FeedSpec::Product { a: 1, b: 9 }),
                ];
            })
            .await;

        let mut oracle = MockOracleClient::new();
        oracle.expect_fetch_proof().returning(|_| {
            Ok(OracleProof {
                prices: vec![OraclePrice {
                    id: 1,
                    price: 100,
                    decimal: 2,
                    timestamp: 1,
                }],
                proof: Bytes::new(),
            })
        });

        let bus = Arc::new(InMemoryBus::new());
        let ingestion = PriceIngestion::new(Arc::new(oracle), bus.clone(), state);
        ingestion.fetch_and_publish().await.unwrap();

        let stored: PriceMap = bus::get_typed(bus.as_ref(), channel::CURRENT_PRICES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored.contains_key(&0));
    }

    #[tokio::test]
    async fn test_no_pairs_no_oracle_call() {
        let oracle = MockOracleClient::new();
        let bus = Arc::new(InMemoryBus::new());
        let ingestion = PriceIngestion::new(Arc::new(oracle), bus, StateHandle::default());
        // MockOracleClient with no expectations would panic if called.
        ingestion.fetch_and_publish().await.unwrap();
    }
}
