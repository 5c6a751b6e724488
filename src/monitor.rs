//! Position monitor (§4.5): one long-lived worker per symbol, polling last
//! price once a second and tightening the stop-loss through break-even
//! promotion and price-anchored trailing.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};

use crate::config::PairConfig;
use crate::gateway::BitunixClient;
use crate::numeric::{clamp_sl_not_instant, enforce_monotone_tightening, fmt_decimal};
use crate::types::{OpenPosition, Side};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ANTI_INSTANT_FILL_TICKS: u32 = 2;

struct MonitorState {
    position: Option<OpenPosition>,
    config: Option<PairConfig>,
    last_applied_sl: Decimal,
    breakeven_done: bool,
    trail_active: bool,
    trail_best: Decimal,
    trail_anchor: Decimal,
}

impl MonitorState {
    fn empty() -> Self {
        MonitorState {
            position: None,
            config: None,
            last_applied_sl: Decimal::ZERO,
            breakeven_done: false,
            trail_active: false,
            trail_best: Decimal::ZERO,
            trail_anchor: Decimal::ZERO,
        }
    }
}

/// Handle the executor holds to attach/detach a position. The monitor's
/// background task owns all reads and trailing-state writes; the executor
/// only ever calls [`Self::set_position`].
pub struct MonitorHandle {
    state: Mutex<MonitorState>,
    on_external_close: mpsc::UnboundedSender<String>,
}

impl MonitorHandle {
    /// Spawn the monitor's background task for `symbol` and return a handle
    /// to attach/detach positions on. `on_external_close` is notified with
    /// the symbol whenever the monitor observes the position has disappeared
    /// from the exchange, so the executor can reset its state to `FLAT`.
    pub fn spawn(symbol: String, gateway: BitunixClient, on_external_close: mpsc::UnboundedSender<String>) -> Arc<Self> {
        let handle = Arc::new(MonitorHandle { state: Mutex::new(MonitorState::empty()), on_external_close });
        let task_handle = handle.clone();
        tokio::spawn(async move {
            monitor_loop(symbol, gateway, task_handle).await;
        });
        handle
    }

    /// Replace the tracked position/config, resetting all trailing/breakeven
    /// state — called by the executor at attach, reset, and detach points.
    pub async fn set_position(&self, position: Option<OpenPosition>, config: Option<PairConfig>) {
        let mut state = self.state.lock().await;
        state.position = position;
        state.config = config;
        state.last_applied_sl = Decimal::ZERO;
        state.breakeven_done = false;
        state.trail_active = false;
        state.trail_best = Decimal::ZERO;
        state.trail_anchor = Decimal::ZERO;
    }
}

async fn monitor_loop(symbol: String, gateway: BitunixClient, handle: Arc<MonitorHandle>) {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let (position, config) = {
            let state = handle.state.lock().await;
            (state.position.clone(), state.config.clone())
        };
        let (position, config) = match (position, config) {
            (Some(p), Some(c)) => (p, c),
            _ => continue,
        };

        // `tick` always runs, even with break-even/trailing both disabled,
        // because it's also the only place that detects an external close.
        match tick(&symbol, &gateway, &handle, &position, &config).await {
            Ok(()) => {}
            Err(e) => log::warn!("[{}] monitor tick failed: {}", symbol, e),
        }
    }
}

async fn tick(
    symbol: &str,
    gateway: &BitunixClient,
    handle: &MonitorHandle,
    position: &OpenPosition,
    config: &PairConfig,
) -> Result<(), crate::error::GatewayError> {
    let exchange_positions = gateway.get_pending_positions(Some(symbol)).await?;
    let matching = exchange_positions.iter().find(|p| p.position_id == position.position_id);

    let matching = match matching {
        Some(p) => p,
        None => {
            if exchange_positions.is_empty() {
                handle.set_position(None, None).await;
                let _ = handle.on_external_close.send(symbol.to_string());
            }
            // Some position exists under a different id — a race with the
            // executor replacing the position reference. Skip this tick.
            return Ok(());
        }
    };

    if matching.qty <= Decimal::ZERO {
        handle.set_position(None, None).await;
        let _ = handle.on_external_close.send(symbol.to_string());
        return Ok(());
    }

    if !config.sl_enabled || (!config.breakeven_enabled && !config.trailing_enabled) {
        return Ok(());
    }

    {
        let mut state = handle.state.lock().await;
        if let Some(sl) = matching.sl_price {
            if sl > Decimal::ZERO && state.last_applied_sl.is_zero() {
                state.last_applied_sl = sl;
            }
        }
    }

    let price = gateway.get_last_price(symbol).await?;
    if price <= Decimal::ZERO {
        return Ok(());
    }

    if config.breakeven_enabled {
        let already_done = handle.state.lock().await.breakeven_done;
        if !already_done {
            maybe_breakeven(gateway, handle, position, config, price).await;
        }
    }

    if config.trailing_enabled {
        maybe_trailing(gateway, handle, position, config, price).await;
    }

    Ok(())
}

async fn maybe_breakeven(
    gateway: &BitunixClient,
    handle: &MonitorHandle,
    position: &OpenPosition,
    config: &PairConfig,
    price: Decimal,
) {
    let triggered = match position.side {
        Side::Long => price >= position.entry_price * (Decimal::ONE + config.breakeven_trigger_pct),
        Side::Short => price <= position.entry_price * (Decimal::ONE - config.breakeven_trigger_pct),
    };
    if !triggered {
        return;
    }

    let candidate = match position.side {
        Side::Long => position.entry_price * (Decimal::ONE + config.breakeven_offset_pct),
        Side::Short => position.entry_price * (Decimal::ONE - config.breakeven_offset_pct),
    };

    if let Some(new_sl) = tighten(gateway, handle, position, candidate, price).await {
        let mut state = handle.state.lock().await;
        state.breakeven_done = true;
        state.last_applied_sl = new_sl;
    }
}

async fn maybe_trailing(
    gateway: &BitunixClient,
    handle: &MonitorHandle,
    position: &OpenPosition,
    config: &PairConfig,
    price: Decimal,
) {
    let entry = position.entry_price;
    let (trail_active, mut trail_best, trail_anchor) = {
        let state = handle.state.lock().await;
        (state.trail_active, state.trail_best, state.trail_anchor)
    };

    if !trail_active {
        let activated = match position.side {
            Side::Long => price >= entry * (Decimal::ONE + config.trailing_trigger_pct),
            Side::Short => price <= entry * (Decimal::ONE - config.trailing_trigger_pct),
        };
        if !activated {
            return;
        }

        {
            let mut state = handle.state.lock().await;
            state.trail_active = true;
            state.trail_best = price;
            state.trail_anchor = price;
        }

        if config.trailing_move_immediately {
            let candidate = match position.side {
                Side::Long => price * (Decimal::ONE - config.trailing_distance_pct),
                Side::Short => price * (Decimal::ONE + config.trailing_distance_pct),
            };
            if let Some(new_sl) = tighten(gateway, handle, position, candidate, price).await {
                let mut state = handle.state.lock().await;
                state.last_applied_sl = new_sl;
                state.trail_anchor = price;
            }
        }
        return;
    }

    let improved = match position.side {
        Side::Long => price > trail_best,
        Side::Short => price < trail_best,
    };
    if improved {
        trail_best = price;
        handle.state.lock().await.trail_best = price;
    }

    let should_step = match position.side {
        Side::Long => trail_best >= trail_anchor * (Decimal::ONE + config.trailing_step_pct),
        Side::Short => trail_best <= trail_anchor * (Decimal::ONE - config.trailing_step_pct),
    };
    if !should_step {
        return;
    }

    let candidate = match position.side {
        Side::Long => trail_best * (Decimal::ONE - config.trailing_distance_pct),
        Side::Short => trail_best * (Decimal::ONE + config.trailing_distance_pct),
    };

    if let Some(new_sl) = tighten(gateway, handle, position, candidate, price).await {
        let mut state = handle.state.lock().await;
        state.last_applied_sl = new_sl;
        state.trail_anchor = trail_best;
    }
}

/// Clamp, enforce monotone tightening, and send `modifyPositionSL`. Returns
/// the applied SL on success.
async fn tighten(
    gateway: &BitunixClient,
    handle: &MonitorHandle,
    position: &OpenPosition,
    candidate: Decimal,
    market_price: Decimal,
) -> Option<Decimal> {
    let last_applied = handle.state.lock().await.last_applied_sl;

    let candidate = round_to(candidate, position.quote_precision);
    let clamped = clamp_sl_not_instant(position.side, candidate, market_price, position.quote_precision, ANTI_INSTANT_FILL_TICKS);
    let accepted = enforce_monotone_tightening(position.side, clamped, last_applied)?;

    let sl_str = fmt_decimal(accepted, position.quote_precision);
    match gateway.modify_position_sl(&position.symbol, &position.position_id, &sl_str).await {
        Ok(_) => Some(accepted),
        Err(e) => {
            log::warn!("[{}] SL tighten to {} failed: {}", position.symbol, sl_str, e);
            None
        }
    }
}

fn round_to(value: Decimal, precision: u32) -> Decimal {
    crate::numeric::round_down(value, precision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn dummy_position(side: Side, entry: Decimal) -> OpenPosition {
        OpenPosition {
            symbol: "BTCUSDT".into(),
            position_id: "P1".into(),
            side,
            entry_price: entry,
            initial_qty: dec!(1),
            base_precision: 3,
            quote_precision: 2,
            min_trade_volume: dec!(0.001),
            margin_coin: "USDT".into(),
        }
    }

    #[test]
    fn breakeven_threshold_is_inclusive() {
        let entry = dec!(100.00);
        let trigger_pct = dec!(0.005);
        let price = entry * (Decimal::ONE + trigger_pct);
        assert!(price >= entry * (Decimal::ONE + trigger_pct));
        let _ = dummy_position(Side::Long, entry);
    }

    #[test]
    fn scenario_6_trailing_activation_and_follow_thresholds() {
        let entry = dec!(200.00);
        let trigger_pct = dec!(0.02);
        let step_pct = dec!(0.01);
        let distance_pct = dec!(0.005);

        let activation_price = dec!(204.00);
        assert!(activation_price >= entry * (Decimal::ONE + trigger_pct));

        let immediate_sl = round_to(activation_price * (Decimal::ONE - distance_pct), 2);
        assert_eq!(immediate_sl, dec!(203.00));

        let anchor = activation_price;
        let follow_price = dec!(206.04);
        assert!(follow_price >= anchor * (Decimal::ONE + step_pct));

        let tightened_sl = round_to(follow_price * (Decimal::ONE - distance_pct), 2);
        assert_eq!(tightened_sl, dec!(205.00));
    }
}
