//! Append-only trade records.
//!
//! Every open/close transition writes one record keyed by a composite URI,
//! so replaying the same chain event overwrites instead of duplicating.
//! The read side consumes these records; this side only upserts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use crate::error::Result;
use crate::state::types::TradeKey;

/// Persisted trade record, shape shared with the read-side API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub pair_index: u32,
    /// Display pair, e.g. "ETH/USD"
    pub pair: String,
    /// 0x-hex trader address
    pub trader: String,
    /// Lifecycle transition that produced the record
    pub action: String,
    pub open_price: Decimal,
    pub close_price: Option<Decimal>,
    pub collateral_price_usd: Option<Decimal>,
    /// 0 = sell, 1 = buy
    pub buy: u8,
    /// Position size in collateral units
    pub size: Decimal,
    pub leverage: u32,
    pub pnl: Decimal,
    pub block: u64,
    pub tx: String,
    /// Upsert key
    pub uri: String,
    /// Collateral symbol
    pub collateral: String,
}

/// Composite record key: the trade URI plus the UTC date and which side of
/// the lifecycle produced it.
pub fn record_uri(key: &TradeKey, timestamp: DateTime<Utc>, opened: bool) -> String {
    format!(
        "{}&date={}&opened={}",
        key,
        timestamp.format("%Y-%m-%d"),
        opened
    )
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert or overwrite the record with the same `uri`.
    async fn upsert(&self, record: &TradeRecord) -> Result<()>;
}

/// PostgreSQL-backed store
pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn upsert(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_records (
                uri, timestamp, pair_index, pair, trader, action,
                open_price, close_price, collateral_price_usd, buy,
                size, leverage, pnl, block, tx, collateral
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (uri) DO UPDATE SET
                timestamp = EXCLUDED.timestamp,
                action = EXCLUDED.action,
                close_price = EXCLUDED.close_price,
                collateral_price_usd = EXCLUDED.collateral_price_usd,
                pnl = EXCLUDED.pnl,
                block = EXCLUDED.block,
                tx = EXCLUDED.tx
            "#,
        )
        .bind(&record.uri)
        .bind(record.timestamp)
        .bind(record.pair_index as i64)
        .bind(&record.pair)
        .bind(&record.trader)
        .bind(&record.action)
        .bind(record.open_price)
        .bind(record.close_price)
        .bind(record.collateral_price_usd)
        .bind(record.buy as i16)
        .bind(record.size)
        .bind(record.leverage as i64)
        .bind(record.pnl)
        .bind(record.block as i64)
        .bind(&record.tx)
        .bind(&record.collateral)
        .execute(&self.pool)
        .await?;

        debug!(uri = %record.uri, action = %record.action, "upserted trade record");
        Ok(())
    }
}

/// In-memory store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryTradeStore {
    records: std::sync::Mutex<std::collections::HashMap<String, TradeRecord>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("record lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, uri: &str) -> Option<TradeRecord> {
        self.records.lock().expect("record lock").get(uri).cloned()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn upsert(&self, record: &TradeRecord) -> Result<()> {
        self.records
            .lock()
            .expect("record lock")
            .insert(record.uri.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;
    use rust_decimal_macros::dec;

    #[test]
    fn test_record_uri_distinguishes_open_and_close() {
        let key = TradeKey::new(0, Address::repeat_byte(1), 2, 0, false);
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let open_uri = record_uri(&key, ts, true);
        let close_uri = record_uri(&key, ts, false);
        assert_ne!(open_uri, close_uri);
        assert!(open_uri.contains("date=2024-05-01"));
        assert!(open_uri.ends_with("opened=true"));
    }

    #[tokio::test]
    async fn test_memory_store_upserts_by_uri() {
        let store = MemoryTradeStore::new();
        let mut record = TradeRecord {
            timestamp: Utc::now(),
            pair_index: 0,
            pair: "ETH/USD".into(),
            trader: "0x42".into(),
            action: "market-open".into(),
            open_price: dec!(1850),
            close_price: None,
            collateral_price_usd: None,
            buy: 1,
            size: dec!(100),
            leverage: 10,
            pnl: dec!(0),
            block: 1,
            tx: "0xabc".into(),
            uri: "trade://0/0x42/0/0?isOpenLimit=false&date=2024-05-01&opened=true".into(),
            collateral: "USDC".into(),
        };
        store.upsert(&record).await.unwrap();
        record.pnl = dec!(5);
        store.upsert(&record).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&record.uri).unwrap().pnl, dec!(5));
    }
}
