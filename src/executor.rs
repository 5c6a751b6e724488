//! Trade executor (§4.4): the per-symbol state machine that turns an
//! [`EnqueuedSignal`] into exchange calls. One [`Executor`] is shared across
//! every symbol's scheduler worker; per-symbol state lives behind a single
//! mutex keyed by symbol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};

use crate::config::{OrderSizeType, PairConfig, SameSidePolicy};
use crate::error::ExecutorError;
use crate::gateway::BitunixClient;
use crate::monitor::MonitorHandle;
use crate::numeric::{clamp_sl_not_instant, compute_sl_from_entry, compute_tp_from_entry, fmt_decimal, round_down, tp_tranches};
use crate::types::{EnqueuedSignal, OpenPosition, OrderStatus, PositionState, Side, SignalKind};

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(1500);
const FILL_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const POSITION_POLL_INTERVAL: Duration = Duration::from_millis(1500);
const POSITION_POLL_TIMEOUT: Duration = Duration::from_secs(45);
const PROVISIONAL_SL_CAPTURE_TRIES: u32 = 5;
const PROVISIONAL_SL_CAPTURE_INTERVAL: Duration = Duration::from_millis(800);
const ANTI_INSTANT_FILL_TICKS: u32 = 2;

pub struct Executor {
    gateway: BitunixClient,
    config: HashMap<String, PairConfig>,
    states: Arc<Mutex<HashMap<String, PositionState>>>,
    monitors: Mutex<HashMap<String, Arc<MonitorHandle>>>,
    external_close_tx: mpsc::UnboundedSender<String>,
}

impl Executor {
    pub fn new(gateway: BitunixClient, config: HashMap<String, PairConfig>) -> Self {
        let states: Arc<Mutex<HashMap<String, PositionState>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(reconcile_external_closes(states.clone(), rx));

        Executor {
            gateway,
            config,
            states,
            monitors: Mutex::new(HashMap::new()),
            external_close_tx: tx,
        }
    }

    /// Dispatch a single queued signal (§4.4's table) to completion. Always
    /// returns — never panics and never propagates past the worker loop that
    /// calls it (§7's scheduler-worker error boundary).
    pub async fn process_signal(&self, signal: EnqueuedSignal) -> Result<(), ExecutorError> {
        let symbol = signal.symbol.clone();
        let config = self.config.get(&symbol).cloned().ok_or(ExecutorError::NoConfig)?;
        if !config.is_enabled {
            return Err(ExecutorError::SymbolDisabled);
        }

        let current_side = {
            let states = self.states.lock().await;
            states.get(&symbol).and_then(|s| s.side())
        };

        match (signal.kind, current_side) {
            (SignalKind::Long, None) => self.open(&symbol, &config, Side::Long).await,
            (SignalKind::Short, None) => self.open(&symbol, &config, Side::Short).await,

            (SignalKind::Long, Some(Side::Long)) => self.same_side(&symbol, &config, Side::Long).await,
            (SignalKind::Short, Some(Side::Short)) => self.same_side(&symbol, &config, Side::Short).await,

            (SignalKind::Long, Some(Side::Short)) => self.flip(&symbol, &config, Side::Long).await,
            (SignalKind::Short, Some(Side::Long)) => self.flip(&symbol, &config, Side::Short).await,

            (SignalKind::BuyTp, Some(Side::Long)) => self.manual_tp_close(&symbol, Side::Long).await,
            (SignalKind::SellTp, Some(Side::Short)) => self.manual_tp_close(&symbol, Side::Short).await,

            (SignalKind::BuyTp, _) | (SignalKind::SellTp, _) => {
                log::debug!("[{}] {:?} dropped: no matching open position", symbol, signal.kind);
                Ok(())
            }
        }
    }

    /// Whether `symbol` has a loaded pair configuration — used by the
    /// webhook layer to normalize an incoming symbol (e.g. strip/add the
    /// `.P` perpetual suffix) against the set this executor actually serves.
    pub fn is_known_symbol(&self, symbol: &str) -> bool {
        self.config.contains_key(symbol)
    }

    // ── Open sequence (§4.4) ─────────────────────────────────────────────

    async fn open(&self, symbol: &str, config: &PairConfig, side: Side) -> Result<(), ExecutorError> {
        self.gateway.set_margin_mode(symbol, &config.margin_coin, config.margin_mode_wire()).await;
        self.gateway.set_leverage(symbol, &config.margin_coin, config.leverage).await;

        let symbol_info = self.gateway.get_symbol_info(symbol).await?;
        let last_price = self.gateway.get_last_price(symbol).await?;

        let qty = self.compute_qty(config, symbol_info.base_precision, symbol_info.min_trade_volume, last_price).await?;
        let qty_str = fmt_decimal(qty, symbol_info.base_precision);

        let sl_provisional = if config.sl_enabled {
            let sl = compute_sl_from_entry(last_price, symbol_info.quote_precision, side, config.sl_pct);
            Some(clamp_sl_not_instant(side, sl, last_price, symbol_info.quote_precision, ANTI_INSTANT_FILL_TICKS))
        } else {
            None
        };

        let open_ts_ms = now_ms();
        let order_id = match sl_provisional {
            Some(sl) => {
                let sl_str = fmt_decimal(sl, symbol_info.quote_precision);
                self.gateway.open_market_with_provisional_sl(symbol, &qty_str, side, &sl_str).await?
            }
            None => self.gateway.open_market(symbol, &qty_str, side).await?,
        };

        let fill = self.wait_order_filled(&order_id).await?;
        let fill_price = fill.avg_price
            .or_else(|| fill.deal_money.filter(|_| fill.trade_qty > Decimal::ZERO).map(|m| m / fill.trade_qty))
            .unwrap_or(last_price);

        let mut captured_sl_ids = Vec::new();
        if let Some(sl) = sl_provisional {
            let sl_str = fmt_decimal(sl, symbol_info.quote_precision);
            captured_sl_ids = self
                .gateway
                .capture_provisional_sl_ids(symbol, &sl_str, open_ts_ms, PROVISIONAL_SL_CAPTURE_TRIES, PROVISIONAL_SL_CAPTURE_INTERVAL)
                .await;
        }

        let exchange_position = self.wait_position(symbol, side, fill.trade_qty).await?;
        let entry_price = if exchange_position.entry_price > Decimal::ZERO { exchange_position.entry_price } else { fill_price };

        let market_price = self.gateway.get_last_price(symbol).await.unwrap_or(last_price);
        let sl_final = if config.sl_enabled {
            let sl = compute_sl_from_entry(entry_price, symbol_info.quote_precision, side, config.sl_pct);
            Some(clamp_sl_not_instant(side, sl, market_price, symbol_info.quote_precision, ANTI_INSTANT_FILL_TICKS))
        } else {
            None
        };

        let mut position_sl_id = None;
        if let Some(sl) = sl_final {
            let sl_str = fmt_decimal(sl, symbol_info.quote_precision);
            match self.gateway.ensure_position_sl(symbol, &exchange_position.position_id, &sl_str).await {
                Ok(id) => position_sl_id = Some(id),
                Err(e) => log::warn!("[{}] ensure_position_sl failed: {}", symbol, e),
            }
        }

        let open_position = OpenPosition {
            symbol: symbol.to_string(),
            position_id: exchange_position.position_id.clone(),
            side,
            entry_price,
            initial_qty: exchange_position.qty,
            base_precision: symbol_info.base_precision,
            quote_precision: symbol_info.quote_precision,
            min_trade_volume: symbol_info.min_trade_volume,
            margin_coin: config.margin_coin.clone(),
        };

        if config.tp_enabled {
            self.place_tp_ladder(&open_position, config, entry_price).await;
        }

        for id in &captured_sl_ids {
            if Some(id.as_str()) == position_sl_id.as_deref() {
                continue;
            }
            if let Err(e) = self.gateway.cancel_conditional(symbol, id).await {
                log::warn!("[{}] failed to cancel stale provisional SL {}: {}", symbol, id, e);
            }
        }

        self.attach_monitor(symbol, open_position.clone(), config.clone()).await;

        let mut states = self.states.lock().await;
        states.insert(
            symbol.to_string(),
            match side {
                Side::Long => PositionState::LongOpen(open_position),
                Side::Short => PositionState::ShortOpen(open_position),
            },
        );
        Ok(())
    }

    async fn compute_qty(
        &self,
        config: &PairConfig,
        base_precision: u32,
        min_trade_volume: Decimal,
        last_price: Decimal,
    ) -> Result<Decimal, ExecutorError> {
        let raw = match config.order_size_type {
            OrderSizeType::MarginUsdt => (config.order_size_value * Decimal::from(config.leverage)) / last_price,
            OrderSizeType::NotionalUsdt => config.order_size_value / last_price,
            OrderSizeType::PctBalance => {
                let available = self.gateway.get_account_available(&config.margin_coin).await?;
                (available * config.order_size_value * Decimal::from(config.leverage)) / last_price
            }
        };
        let mut qty = round_down(raw, base_precision);
        if qty < min_trade_volume {
            qty = round_down(min_trade_volume, base_precision);
        }
        if qty <= Decimal::ZERO {
            return Err(ExecutorError::InvalidQty(format!("computed qty {} is non-positive", qty)));
        }
        Ok(qty)
    }

    async fn wait_order_filled(&self, order_id: &str) -> Result<crate::types::OrderDetail, ExecutorError> {
        let deadline = std::time::Instant::now() + FILL_POLL_TIMEOUT;
        loop {
            let detail = self.gateway.get_order_detail(order_id).await?;
            match detail.status {
                OrderStatus::Filled | OrderStatus::PartFilled if detail.trade_qty > Decimal::ZERO => return Ok(detail),
                OrderStatus::Canceled => return Err(ExecutorError::OpenTimedOut("order canceled before fill")),
                _ => {}
            }
            if std::time::Instant::now() >= deadline {
                return Err(ExecutorError::OpenTimedOut("order fill poll"));
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
    }

    async fn wait_position(&self, symbol: &str, side: Side, filled_qty: Decimal) -> Result<crate::types::ExchangePosition, ExecutorError> {
        let deadline = std::time::Instant::now() + POSITION_POLL_TIMEOUT;
        loop {
            let positions = self.gateway.get_pending_positions(Some(symbol)).await?;
            let best = positions
                .into_iter()
                .filter(|p| p.side == side)
                .min_by_key(|p| (p.qty - filled_qty).abs());
            if let Some(p) = best {
                return Ok(p);
            }
            if std::time::Instant::now() >= deadline {
                return Err(ExecutorError::PositionNotFound);
            }
            tokio::time::sleep(POSITION_POLL_INTERVAL).await;
        }
    }

    async fn place_tp_ladder(&self, position: &OpenPosition, config: &PairConfig, entry_price: Decimal) {
        let levels = config.enabled_tp_levels();
        if levels.is_empty() {
            return;
        }
        let fracs: Vec<Decimal> = levels.iter().map(|l| l.close_frac).collect();
        let (tranches, _runner) = tp_tranches(position.initial_qty, &fracs, position.base_precision, position.min_trade_volume);

        for (level, tranche) in levels.iter().zip(tranches.iter()) {
            if *tranche <= Decimal::ZERO {
                continue;
            }
            let tp_price = compute_tp_from_entry(entry_price, position.quote_precision, position.side, level.target_pct);
            let tp_str = fmt_decimal(tp_price, position.quote_precision);
            let qty_str = fmt_decimal(*tranche, position.base_precision);
            if let Err(e) = self.gateway.place_tp_partial(&position.symbol, &position.position_id, &tp_str, &qty_str).await {
                log::warn!("[{}] TP level {} placement failed: {}", position.symbol, level.level, e);
            }
        }
    }

    // ── Same-side (§4.4: IGNORE / RESET_ORDERS) ──────────────────────────

    async fn same_side(&self, symbol: &str, config: &PairConfig, side: Side) -> Result<(), ExecutorError> {
        match config.same_side_policy {
            SameSidePolicy::Ignore => {
                log::debug!("[{}] same-side signal ignored per configuration", symbol);
                Ok(())
            }
            SameSidePolicy::ResetOrders => self.reset_orders(symbol, config, side).await,
        }
    }

    async fn reset_orders(&self, symbol: &str, config: &PairConfig, side: Side) -> Result<(), ExecutorError> {
        let position = {
            let states = self.states.lock().await;
            states.get(symbol).and_then(|s| s.position()).cloned()
        }
        .ok_or(ExecutorError::PositionNotFound)?;

        let conditionals = self.gateway.get_pending_conditionals(Some(symbol), 100).await?;
        for c in conditionals.iter().filter(|c| c.tp_price.is_some()) {
            if let Err(e) = self.gateway.cancel_conditional(symbol, &c.id).await {
                log::warn!("[{}] reset: failed to cancel TP conditional {}: {}", symbol, c.id, e);
            }
        }

        let exchange_positions = self.gateway.get_pending_positions(Some(symbol)).await?;
        let current = exchange_positions
            .into_iter()
            .find(|p| p.position_id == position.position_id)
            .ok_or(ExecutorError::PositionNotFound)?;

        let market_price = self.gateway.get_last_price(symbol).await.unwrap_or(current.entry_price);
        if config.sl_enabled {
            let sl = compute_sl_from_entry(current.entry_price, position.quote_precision, side, config.sl_pct);
            let sl = clamp_sl_not_instant(side, sl, market_price, position.quote_precision, ANTI_INSTANT_FILL_TICKS);
            let sl_str = fmt_decimal(sl, position.quote_precision);
            if let Err(e) = self.gateway.ensure_position_sl(symbol, &position.position_id, &sl_str).await {
                log::warn!("[{}] reset: ensure_position_sl failed: {}", symbol, e);
            }
        }

        let refreshed = OpenPosition { entry_price: current.entry_price, initial_qty: current.qty, ..position };
        if config.tp_enabled {
            self.place_tp_ladder(&refreshed, config, current.entry_price).await;
        }

        self.attach_monitor(symbol, refreshed.clone(), config.clone()).await;

        let mut states = self.states.lock().await;
        states.insert(
            symbol.to_string(),
            match side {
                Side::Long => PositionState::LongOpen(refreshed),
                Side::Short => PositionState::ShortOpen(refreshed),
            },
        );
        Ok(())
    }

    // ── Flip (§4.4) ───────────────────────────────────────────────────────

    async fn flip(&self, symbol: &str, config: &PairConfig, new_side: Side) -> Result<(), ExecutorError> {
        let position = {
            let states = self.states.lock().await;
            states.get(symbol).and_then(|s| s.position()).cloned()
        }
        .ok_or(ExecutorError::PositionNotFound)?;

        let closing_side = position.side;
        let qty_str = fmt_decimal(position.initial_qty, position.base_precision);
        self.detach_monitor(symbol).await;
        self.gateway.close_market(symbol, &qty_str, closing_side, &position.position_id).await?;

        {
            let mut states = self.states.lock().await;
            states.insert(symbol.to_string(), PositionState::Flat);
        }

        self.open(symbol, config, new_side).await
    }

    // ── Manual TP close (§4.4) ────────────────────────────────────────────

    async fn manual_tp_close(&self, symbol: &str, side: Side) -> Result<(), ExecutorError> {
        let position = {
            let states = self.states.lock().await;
            states.get(symbol).and_then(|s| s.position()).cloned()
        }
        .ok_or(ExecutorError::PositionNotFound)?;

        let conditionals = self.gateway.get_pending_conditionals(Some(symbol), 100).await?;
        for c in conditionals.iter().filter(|c| c.tp_price.is_some()) {
            if let Err(e) = self.gateway.cancel_conditional(symbol, &c.id).await {
                log::warn!("[{}] manual TP close: failed to cancel TP conditional {}: {}", symbol, c.id, e);
            }
        }

        let qty_str = fmt_decimal(position.initial_qty, position.base_precision);
        self.gateway.close_market(symbol, &qty_str, side, &position.position_id).await?;
        self.detach_monitor(symbol).await;

        let mut states = self.states.lock().await;
        states.insert(symbol.to_string(), PositionState::Flat);
        Ok(())
    }

    // ── Monitor attach/detach ─────────────────────────────────────────────

    async fn attach_monitor(&self, symbol: &str, position: OpenPosition, config: PairConfig) {
        let mut monitors = self.monitors.lock().await;
        let tx = self.external_close_tx.clone();
        let handle = monitors
            .entry(symbol.to_string())
            .or_insert_with(|| MonitorHandle::spawn(symbol.to_string(), self.gateway.clone(), tx))
            .clone();
        handle.set_position(Some(position), Some(config)).await;
    }

    async fn detach_monitor(&self, symbol: &str) {
        let monitors = self.monitors.lock().await;
        if let Some(handle) = monitors.get(symbol) {
            handle.set_position(None, None).await;
        }
    }
}

/// Drains monitor-reported external closes and transitions the affected
/// symbol back to `FLAT`, so the next incoming signal for it runs the Open
/// sequence instead of `same_side`/`flip`/manual-close against a position
/// that no longer exists on the exchange.
async fn reconcile_external_closes(states: Arc<Mutex<HashMap<String, PositionState>>>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(symbol) = rx.recv().await {
        let mut states = states.lock().await;
        if !matches!(states.get(&symbol), Some(PositionState::Flat) | None) {
            log::info!("[{}] monitor observed external close — resetting to FLAT", symbol);
            states.insert(symbol, PositionState::Flat);
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_config() -> PairConfig {
        PairConfig {
            is_enabled: true,
            margin_mode: crate::config::MarginMode::Isolation,
            leverage: 10,
            margin_coin: "USDT".into(),
            order_size_type: OrderSizeType::MarginUsdt,
            order_size_value: dec!(5),
            sl_enabled: true,
            sl_pct: dec!(0.01),
            tp_enabled: true,
            tp_levels: vec![
                crate::config::TpLevel { level: 1, target_pct: dec!(0.01), close_frac: dec!(0.3), is_enabled: true },
                crate::config::TpLevel { level: 2, target_pct: dec!(0.02), close_frac: dec!(0.3), is_enabled: true },
            ],
            breakeven_enabled: false,
            breakeven_trigger_pct: Decimal::ZERO,
            breakeven_offset_pct: Decimal::ZERO,
            trailing_enabled: false,
            trailing_trigger_pct: Decimal::ZERO,
            trailing_step_pct: Decimal::ZERO,
            trailing_distance_pct: Decimal::ZERO,
            trailing_move_immediately: false,
            same_side_policy: SameSidePolicy::Ignore,
        }
    }

    #[tokio::test]
    async fn process_signal_without_config_is_no_config_error() {
        let gateway = BitunixClient::new("key".into(), "secret".into());
        let executor = Executor::new(gateway, HashMap::new());
        let signal = EnqueuedSignal { symbol: "BTCUSDT".into(), kind: SignalKind::Long, received_ts_ms: 0 };
        let result = executor.process_signal(signal).await;
        assert!(matches!(result, Err(ExecutorError::NoConfig)));
    }

    #[tokio::test]
    async fn process_signal_for_disabled_symbol_is_symbol_disabled_error() {
        let gateway = BitunixClient::new("key".into(), "secret".into());
        let mut config = make_config();
        config.is_enabled = false;
        let mut map = HashMap::new();
        map.insert("BTCUSDT".to_string(), config);
        let executor = Executor::new(gateway, map);
        let signal = EnqueuedSignal { symbol: "BTCUSDT".into(), kind: SignalKind::Long, received_ts_ms: 0 };
        let result = executor.process_signal(signal).await;
        assert!(matches!(result, Err(ExecutorError::SymbolDisabled)));
    }

    #[tokio::test]
    async fn buy_tp_with_no_open_position_is_dropped_not_errored() {
        let gateway = BitunixClient::new("key".into(), "secret".into());
        let mut map = HashMap::new();
        map.insert("BTCUSDT".to_string(), make_config());
        let executor = Executor::new(gateway, map);
        let signal = EnqueuedSignal { symbol: "BTCUSDT".into(), kind: SignalKind::BuyTp, received_ts_ms: 0 };
        let result = executor.process_signal(signal).await;
        assert!(result.is_ok());
    }
}
