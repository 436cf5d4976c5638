//! Trigger predicates.
//!
//! All comparisons run on `Decimal` prices with a one-basis-point band
//! anchored on the trigger price (`s = trigger / 10000`), so a given order
//! has a fixed band regardless of where the market currently prints.
//! Liquidation is band-less: exact-or-past only.

use rust_decimal::Decimal;

use crate::chain::types::LimitOrderKind;

const BAND_DIVISOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// One-basis-point band around a trigger price
pub fn slippage_band(trigger: Decimal) -> Decimal {
    trigger / BAND_DIVISOR
}

/// A resting open order is triggerable when the market prints inside the
/// band on the trigger's far side. Plain limits fill on the market coming
/// toward the order, stop-limits on the market going through it.
pub fn open_order_triggerable(
    kind: LimitOrderKind,
    buy: bool,
    current: Decimal,
    trigger: Decimal,
) -> bool {
    let s = slippage_band(trigger);
    match (kind, buy) {
        (LimitOrderKind::Limit, true) => current <= trigger && current >= trigger - s,
        (LimitOrderKind::Limit, false) => current >= trigger && current <= trigger + s,
        (LimitOrderKind::StopLimit, true) => current >= trigger && current <= trigger + s,
        (LimitOrderKind::StopLimit, false) => current <= trigger && current >= trigger - s,
    }
}

/// Take-profit fires when the market reaches the target from the profitable
/// side, within the band.
pub fn take_profit_triggerable(buy: bool, current: Decimal, tp: Decimal) -> bool {
    if tp <= Decimal::ZERO {
        return false;
    }
    let s = slippage_band(tp);
    if buy {
        current >= tp && current <= tp + s
    } else {
        current <= tp && current >= tp - s
    }
}

/// Stop-loss mirrors take-profit on the losing side. An `sl` of exactly
/// zero encodes "no stop".
pub fn stop_loss_triggerable(buy: bool, current: Decimal, sl: Decimal) -> bool {
    if sl <= Decimal::ZERO {
        return false;
    }
    let s = slippage_band(sl);
    if buy {
        current <= sl && current >= sl - s
    } else {
        current >= sl && current <= sl + s
    }
}

/// Liquidation must be exact-or-past; no tolerance band.
pub fn liquidation_triggerable(buy: bool, current: Decimal, liquidation: Decimal) -> bool {
    if buy {
        current <= liquidation
    } else {
        current >= liquidation
    }
}

/// Liquidation price from the open price and leverage: the position is
/// closed when the move against it consumes 90% of the margin.
pub fn liquidation_price(open_price: Decimal, buy: bool, leverage: u32) -> Decimal {
    if leverage == 0 {
        return Decimal::ZERO;
    }
    let distance = open_price * Decimal::new(9, 1) / Decimal::from(leverage);
    if buy {
        open_price - distance
    } else {
        open_price + distance
    }
}
