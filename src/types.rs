//! Shared runtime data model: signals, positions, and exchange-reported
//! records that flow between the scheduler, executor, gateway, and monitor.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A directional or close signal recognized by the executor's dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Long,
    Short,
    BuyTp,
    SellTp,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Long => "LONG",
            SignalKind::Short => "SHORT",
            SignalKind::BuyTp => "BUY_TP",
            SignalKind::SellTp => "SELL_TP",
        }
    }
}

/// Position side. Distinct from [`SignalKind`]: `BUY_TP`/`SELL_TP` never
/// open a position, so they have no `Side` counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The wire-level order side for OPEN *and* CLOSE — CLOSE reuses the
    /// OPEN side rather than inverting it (§6).
    pub fn wire_side(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }
}

/// A signal that has been accepted onto a symbol's FIFO queue. Immutable
/// once constructed.
#[derive(Clone, Debug)]
pub struct EnqueuedSignal {
    pub symbol: String,
    pub kind: SignalKind,
    pub received_ts_ms: i64,
}

/// Precisions and minimum order size reported by the exchange for a symbol.
#[derive(Clone, Copy, Debug)]
pub struct SymbolInfo {
    pub base_precision: u32,
    pub quote_precision: u32,
    pub min_trade_volume: Decimal,
}

/// A live position as tracked by the executor. Replaced wholesale on every
/// state transition rather than mutated field-by-field.
#[derive(Clone, Debug)]
pub struct OpenPosition {
    pub symbol: String,
    pub position_id: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub initial_qty: Decimal,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub min_trade_volume: Decimal,
    pub margin_coin: String,
}

/// A conditional (SL or TP) order as reported by `getPendingConditionals`.
#[derive(Clone, Debug)]
pub struct PendingConditional {
    pub id: String,
    pub symbol: String,
    pub sl_price: Option<Decimal>,
    pub tp_price: Option<Decimal>,
    pub qty: Decimal,
    pub ctime_ms: i64,
}

/// A position snapshot as reported by `getPendingPositions`.
#[derive(Clone, Debug)]
pub struct ExchangePosition {
    pub position_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub sl_price: Option<Decimal>,
}

/// Order status values relevant to the fill-poll in the Open sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartFilled,
    Filled,
    Canceled,
    Other,
}

/// The subset of `getOrderDetail` the executor consumes.
#[derive(Clone, Debug)]
pub struct OrderDetail {
    pub status: OrderStatus,
    pub trade_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub deal_money: Option<Decimal>,
}

/// Abstract per-symbol executor state (§4.4). `Flat` carries no position;
/// the open states carry the live [`OpenPosition`].
#[derive(Clone, Debug)]
pub enum PositionState {
    Flat,
    LongOpen(OpenPosition),
    ShortOpen(OpenPosition),
}

impl PositionState {
    pub fn side(&self) -> Option<Side> {
        match self {
            PositionState::Flat => None,
            PositionState::LongOpen(_) => Some(Side::Long),
            PositionState::ShortOpen(_) => Some(Side::Short),
        }
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        match self {
            PositionState::Flat => None,
            PositionState::LongOpen(p) | PositionState::ShortOpen(p) => Some(p),
        }
    }
}

pub type PairConfigMap = HashMap<String, crate::config::PairConfig>;
