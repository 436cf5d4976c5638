//! Price feed shapes and derived-pair arithmetic.
//!
//! Oracle feeds arrive as integer prices at a per-feed decimal scale. Pairs
//! are either a direct feed or a ratio of two legs; merging stays in integer
//! space so repeated polls cannot accumulate float drift.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a trading pair's price is derived from base oracle feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedSpec {
    /// Pass-through of a single oracle feed
    Direct { id: u64 },
    /// Product of two legs, e.g. ETH/BTC * BTC/USD
    Product { a: u64, b: u64 },
    /// Quotient of two legs, e.g. ETH/USD over JPY/USD
    Quotient { num: u64, den: u64 },
}

impl FeedSpec {
    /// Base oracle ids this feed needs
    pub fn ids(&self) -> Vec<u64> {
        match *self {
            FeedSpec::Direct { id } => vec![id],
            FeedSpec::Product { a, b } => vec![a, b],
            FeedSpec::Quotient { num, den } => vec![num, den],
        }
    }
}

/// Integer price at a decimal scale, as returned by the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledPrice {
    pub price: u128,
    pub decimal: u32,
}

impl ScaledPrice {
    pub fn new(price: u128, decimal: u32) -> Self {
        Self { price, decimal }
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.price as i128, self.decimal)
    }
}

/// Multiply two legs. The result keeps the smaller of the two scales:
/// `p = (p_a * p_b) / 10^max(da, db)`.
pub fn merge_product(a: ScaledPrice, b: ScaledPrice) -> Option<ScaledPrice> {
    let product = a.price.checked_mul(b.price)?;
    let divisor = 10u128.checked_pow(a.decimal.max(b.decimal))?;
    Some(ScaledPrice {
        price: product / divisor,
        decimal: a.decimal.min(b.decimal),
    })
}

/// Divide numerator leg by denominator leg. The result keeps the
/// numerator's scale: `p = (p_num * 10^d_den) / p_den`.
pub fn merge_quotient(num: ScaledPrice, den: ScaledPrice) -> Option<ScaledPrice> {
    if den.price == 0 {
        return None;
    }
    let scaled = num.price.checked_mul(10u128.checked_pow(den.decimal)?)?;
    Some(ScaledPrice {
        price: scaled / den.price,
        decimal: num.decimal,
    })
}

/// Resolve a pair's price from the fetched base feeds.
pub fn resolve_feed(spec: &FeedSpec, base: &HashMap<u64, ScaledPrice>) -> Option<ScaledPrice> {
    match *spec {
        FeedSpec::Direct { id } => base.get(&id).copied(),
        FeedSpec::Product { a, b } => merge_product(*base.get(&a)?, *base.get(&b)?),
        FeedSpec::Quotient { num, den } => merge_quotient(*base.get(&num)?, *base.get(&den)?),
    }
}

/// One published price for a trading pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub pair_index: u32,
    /// Base oracle id for direct pairs, the numerator leg for derived ones
    pub pair_id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub decimal: u32,
    /// Oracle-reported unix timestamp, seconds
    pub timestamp: i64,
}

/// Pair index -> latest published price
pub type PriceMap = HashMap<u32, PriceEntry>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_product_keeps_smaller_scale() {
        // 2000.00000000 (d=8) * 50000.00000000 (d=8)
        let a = ScaledPrice::new(2000_00000000, 8);
        let b = ScaledPrice::new(50000_00000000, 8);
        let merged = merge_product(a, b).unwrap();
        assert_eq!(merged.decimal, 8);
        assert_eq!(merged.price, (2000_00000000u128 * 50000_00000000u128) / 100_000_000);
        assert_eq!(merged.to_decimal(), dec!(100000000.00000000));
    }

    #[test]
    fn test_product_mixed_scales() {
        // 2.5 at d=6 times 4 at d=8 -> 10 at d=6
        let a = ScaledPrice::new(2_500000, 6);
        let b = ScaledPrice::new(4_00000000, 8);
        let merged = merge_product(a, b).unwrap();
        assert_eq!(merged.decimal, 6);
        assert_eq!(merged.price, 10_000000);
    }

    #[test]
    fn test_quotient_keeps_numerator_scale() {
        // 3000 (d=8) / 150 (d=6) -> 20 at d=8
        let num = ScaledPrice::new(3000_00000000, 8);
        let den = ScaledPrice::new(150_000000, 6);
        let merged = merge_quotient(num, den).unwrap();
        assert_eq!(merged.decimal, 8);
        assert_eq!(merged.price, 20_00000000);
    }

    #[test]
    fn test_quotient_zero_denominator() {
        let num = ScaledPrice::new(1_00000000, 8);
        let den = ScaledPrice::new(0, 8);
        assert!(merge_quotient(num, den).is_none());
    }

    #[test]
    fn test_resolve_feed_missing_leg() {
        let mut base = HashMap::new();
        base.insert(1u64, ScaledPrice::new(100, 2));
        assert!(resolve_feed(&FeedSpec::Product { a: 1, b: 2 }, &base).is_none());
        assert!(resolve_feed(&FeedSpec::Direct { id: 1 }, &base).is_some());
    }

    #[test]
    fn test_price_entry_string_serde() {
        let entry = PriceEntry {
            pair_index: 0,
            pair_id: 1,
            price: dec!(1234.5678),
            decimal: 4,
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"1234.5678\""));
        let back: PriceEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
