//! Tick-aligned rounding, SL/TP derivation, and the two submission-time clamps
//! every stop price passes through before it reaches the gateway.
//!
//! Everything here is free functions over `Decimal`, never a binary float —
//! the exchange rejects over-precise values and truncation must be
//! reproducible bit-for-bit.

use rust_decimal::Decimal;

use crate::types::Side;

/// Truncate `value` toward zero to `precision` fractional digits.
pub fn round_down(value: Decimal, precision: u32) -> Decimal {
    value.trunc_with_scale(precision)
}

/// Format `value` truncated to `precision` digits, as the exchange expects it on the wire.
pub fn fmt_decimal(value: Decimal, precision: u32) -> String {
    round_down(value, precision).to_string()
}

/// Minimum price increment at `precision` fractional digits.
pub fn tick_size(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}

/// Clamp a proposed SL so it cannot trigger the instant it is submitted.
///
/// A LONG SL must sit at least `min_ticks_away` ticks below the current
/// price; a SHORT SL at least that many above it.
pub fn clamp_sl_not_instant(
    side: Side,
    sl: Decimal,
    current: Decimal,
    quote_precision: u32,
    min_ticks_away: u32,
) -> Decimal {
    let ticks = tick_size(quote_precision) * Decimal::from(min_ticks_away.max(1));
    match side {
        Side::Long => {
            let max_sl = current - ticks;
            if sl >= max_sl {
                round_down(max_sl, quote_precision)
            } else {
                sl
            }
        }
        Side::Short => {
            let min_sl = current + ticks;
            if sl <= min_sl {
                round_down(min_sl, quote_precision)
            } else {
                sl
            }
        }
    }
}

/// Derive a stop-loss from `entry` at `sl_pct`, enforcing it sits on the
/// losing side of entry by at least one tick.
pub fn compute_sl_from_entry(entry: Decimal, quote_precision: u32, side: Side, sl_pct: Decimal) -> Decimal {
    let t = tick_size(quote_precision);
    match side {
        Side::Long => {
            let mut sl = round_down(entry * (Decimal::ONE - sl_pct), quote_precision);
            if sl >= entry {
                sl = round_down(entry - t, quote_precision);
            }
            sl
        }
        Side::Short => {
            let mut sl = round_down(entry * (Decimal::ONE + sl_pct), quote_precision);
            if sl <= entry {
                sl = round_down(entry + t, quote_precision);
            }
            sl
        }
    }
}

/// Derive a take-profit from `entry` at `target_pct`, enforcing it sits on
/// the winning side of entry by at least one tick.
pub fn compute_tp_from_entry(entry: Decimal, quote_precision: u32, side: Side, target_pct: Decimal) -> Decimal {
    let t = tick_size(quote_precision);
    match side {
        Side::Long => {
            let mut tp = round_down(entry * (Decimal::ONE + target_pct), quote_precision);
            if tp <= entry {
                tp = round_down(entry + t, quote_precision);
            }
            tp
        }
        Side::Short => {
            let mut tp = round_down(entry * (Decimal::ONE - target_pct), quote_precision);
            if tp >= entry {
                tp = round_down(entry - t, quote_precision);
            }
            tp
        }
    }
}

/// Enforce the monotone-tightening invariant: a LONG's SL may only move up,
/// a SHORT's only down. Returns `None` when the proposed value would loosen
/// the stop — callers must drop the operation (no exchange call) in that case.
pub fn enforce_monotone_tightening(side: Side, proposed: Decimal, last_applied: Decimal) -> Option<Decimal> {
    if last_applied.is_zero() {
        return Some(proposed);
    }
    match side {
        Side::Long if proposed > last_applied => Some(proposed),
        Side::Short if proposed < last_applied => Some(proposed),
        _ => None,
    }
}

/// Compute the quantity to allocate to each enabled TP level plus the
/// leftover runner, applying min-volume folding into the last tranche.
///
/// Returns `(tranches, runner)` where `tranches[i]` lines up with `close_fracs[i]`.
pub fn tp_tranches(
    total_qty: Decimal,
    close_fracs: &[Decimal],
    base_precision: u32,
    min_trade_volume: Decimal,
) -> (Vec<Decimal>, Decimal) {
    let mut tranches: Vec<Decimal> = close_fracs
        .iter()
        .map(|frac| round_down(total_qty * frac, base_precision))
        .collect();

    let allocated: Decimal = tranches.iter().sum();
    let mut runner = round_down(total_qty - allocated, base_precision);

    if runner > Decimal::ZERO && runner < min_trade_volume {
        if let Some(last) = tranches.last_mut() {
            *last = round_down(*last + runner, base_precision);
        }
        runner = Decimal::ZERO;
    }

    (tranches, runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_down_truncates_toward_zero() {
        assert_eq!(round_down(dec!(100.567), 2), dec!(100.56));
        assert_eq!(round_down(dec!(100.569), 0), dec!(100));
    }

    #[test]
    fn tick_size_matches_precision() {
        assert_eq!(tick_size(2), dec!(0.01));
        assert_eq!(tick_size(0), dec!(1));
    }

    #[test]
    fn sl_long_snaps_below_entry_when_pct_is_zero() {
        let entry = dec!(100.00);
        let sl = compute_sl_from_entry(entry, 2, Side::Long, dec!(0));
        assert_eq!(sl, dec!(99.99));
    }

    #[test]
    fn sl_short_snaps_above_entry_when_pct_is_zero() {
        let entry = dec!(100.00);
        let sl = compute_sl_from_entry(entry, 2, Side::Short, dec!(0));
        assert_eq!(sl, dec!(100.01));
    }

    #[test]
    fn scenario_1_sl_and_tp_values() {
        let entry = dec!(100.00);
        let sl = compute_sl_from_entry(entry, 2, Side::Long, dec!(0.01));
        assert_eq!(sl, dec!(99.00));
        let tp1 = compute_tp_from_entry(entry, 2, Side::Long, dec!(0.01));
        assert_eq!(tp1, dec!(101.00));
        let tp2 = compute_tp_from_entry(entry, 2, Side::Long, dec!(0.02));
        assert_eq!(tp2, dec!(102.00));
    }

    #[test]
    fn anti_instant_fill_clamps_long_sl_too_close_to_market() {
        let current = dec!(100.00);
        let sl = clamp_sl_not_instant(Side::Long, dec!(99.995), current, 2, 2);
        assert_eq!(sl, dec!(99.98));
    }

    #[test]
    fn anti_instant_fill_leaves_safe_sl_untouched() {
        let current = dec!(100.00);
        let sl = clamp_sl_not_instant(Side::Long, dec!(99.00), current, 2, 2);
        assert_eq!(sl, dec!(99.00));
    }

    #[test]
    fn monotone_tightening_rejects_loosening_long_sl() {
        assert_eq!(enforce_monotone_tightening(Side::Long, dec!(99.00), dec!(99.50)), None);
        assert_eq!(
            enforce_monotone_tightening(Side::Long, dec!(99.60), dec!(99.50)),
            Some(dec!(99.60))
        );
    }

    #[test]
    fn monotone_tightening_rejects_loosening_short_sl() {
        assert_eq!(enforce_monotone_tightening(Side::Short, dec!(101.00), dec!(100.50)), None);
        assert_eq!(
            enforce_monotone_tightening(Side::Short, dec!(100.40), dec!(100.50)),
            Some(dec!(100.40))
        );
    }

    #[test]
    fn scenario_1_tp_ladder_sizing() {
        let total = dec!(0.500);
        let fracs = [dec!(0.3), dec!(0.3)];
        let (tranches, runner) = tp_tranches(total, &fracs, 3, dec!(0.001));
        assert_eq!(tranches, vec![dec!(0.150), dec!(0.150)]);
        assert_eq!(runner, dec!(0.200));
    }

    #[test]
    fn tp_ladder_folds_runner_below_min_volume_into_last_tranche() {
        let total = dec!(1.000);
        let fracs = [dec!(0.5), dec!(0.499)];
        let (tranches, runner) = tp_tranches(total, &fracs, 3, dec!(0.01));
        assert_eq!(runner, Decimal::ZERO);
        let sum: Decimal = tranches.iter().sum();
        assert_eq!(sum, total);
    }
}
