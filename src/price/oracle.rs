//! Oracle proof client.
//!
//! The oracle answers a batch of numeric pair ids with per-id prices and an
//! opaque signed proof blob that doubles as a transaction argument for
//! trigger submissions. The blob is never inspected here.

use async_trait::async_trait;
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PerpdError, Result};

/// One base feed price from a proof response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OraclePrice {
    pub id: u64,
    /// Integer price at `decimal` scale
    pub price: u128,
    pub decimal: u32,
    /// Oracle round timestamp, unix seconds
    pub timestamp: i64,
}

/// A proof response: prices plus the signed blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleProof {
    pub prices: Vec<OraclePrice>,
    pub proof: Bytes,
}

/// What gets republished on the `price-proof` channel so keepers can reuse
/// the round without re-querying the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofEnvelope {
    pub ids: Vec<u64>,
    pub proof: Bytes,
    /// Oldest round timestamp across the batch
    pub timestamp: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OracleClient: Send + Sync {
    /// Request a proof covering the given base pair ids.
    async fn fetch_proof(&self, ids: &[u64]) -> Result<OracleProof>;
}

/// HTTP oracle client
pub struct HttpOracleClient {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct WirePrice {
    id: u64,
    price: String,
    decimal: u32,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct WireProofResponse {
    prices: Vec<WirePrice>,
    proof: String,
}

impl HttpOracleClient {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl OracleClient for HttpOracleClient {
    async fn fetch_proof(&self, ids: &[u64]) -> Result<OracleProof> {
        let url = format!("{}/v1/proof", self.endpoint.trim_end_matches('/'));
        let query: Vec<(&str, String)> = ids.iter().map(|id| ("ids", id.to_string())).collect();

        let response = self.http.get(&url).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(PerpdError::Oracle(format!(
                "proof endpoint returned {}",
                response.status()
            )));
        }
        let wire: WireProofResponse = response.json().await?;

        let mut prices = Vec::with_capacity(wire.prices.len());
        for p in wire.prices {
            let price = p
                .price
                .parse::<u128>()
                .map_err(|_| PerpdError::Oracle(format!("bad price for id {}: {}", p.id, p.price)))?;
            prices.push(OraclePrice {
                id: p.id,
                price,
                decimal: p.decimal,
                timestamp: p.timestamp,
            });
        }

        let raw = wire.proof.trim_start_matches("0x");
        let proof = hex::decode(raw)
            .map(Bytes::from)
            .map_err(|e| PerpdError::Oracle(format!("bad proof hex: {e}")))?;

        Ok(OracleProof { prices, proof })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_envelope_serde() {
        let envelope = ProofEnvelope {
            ids: vec![1, 2],
            proof: Bytes::from(vec![0xde, 0xad]),
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("0xdead"));
        let back: ProofEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
