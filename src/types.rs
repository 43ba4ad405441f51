// Common types used across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper-case exchange symbol, e.g. `BTCUSDT`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the best bid/ask stream for this instrument
    pub fn book_ticker_stream(&self) -> String {
        format!("{}@bookTicker", self.0.to_lowercase())
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(symbol: &str) -> Self {
        Instrument::new(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    None,
    Long,
    Short,
}

impl Side {
    pub fn from_amount(amount: f64) -> Self {
        if amount > 0.0 {
            Side::Long
        } else if amount < 0.0 {
            Side::Short
        } else {
            Side::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::None => "NONE",
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Order side that reduces a position held on this side
    pub fn closing_order_side(&self) -> Option<OrderSide> {
        match self {
            Side::Long => Some(OrderSide::Sell),
            Side::Short => Some(OrderSide::Buy),
            Side::None => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open exposure on one instrument.
///
/// Quantity is signed: positive for long, negative for short, zero when flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    instrument: Instrument,
    side: Side,
    quantity: f64,
    entry_price: f64,
}

impl Position {
    pub fn from_amount(instrument: Instrument, amount: f64, entry_price: f64) -> Self {
        let side = Side::from_amount(amount);
        Self {
            instrument,
            side,
            quantity: if side == Side::None { 0.0 } else { amount },
            entry_price: if side == Side::None { 0.0 } else { entry_price },
        }
    }

    pub fn flat(instrument: Instrument) -> Self {
        Self::from_amount(instrument, 0.0, 0.0)
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn is_flat(&self) -> bool {
        self.side == Side::None
    }

    /// Flat, or holding less than `epsilon` units
    pub fn is_flat_within(&self, epsilon: f64) -> bool {
        self.is_flat() || self.quantity.abs() < epsilon
    }

    /// Fractional return against entry at `price`, signed by side
    pub fn unrealized_return(&self, price: f64) -> Option<f64> {
        if self.entry_price <= 0.0 || price <= 0.0 {
            return None;
        }
        match self.side {
            Side::Long => Some((price - self.entry_price) / self.entry_price),
            Side::Short => Some((self.entry_price - price) / self.entry_price),
            Side::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Hedge-mode position leg this order reduces
    pub fn reduced_position_side(&self) -> &'static str {
        match self {
            OrderSide::Sell => "LONG",
            OrderSide::Buy => "SHORT",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Stream,
    Rest,
}

/// Latest mid price for an instrument and where it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSample {
    pub instrument: Instrument,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source: PriceSource,
}

impl PriceSample {
    pub fn new(instrument: Instrument, price: f64, timestamp: DateTime<Utc>, source: PriceSource) -> Self {
        Self { instrument, price, timestamp, source }
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }
}

/// Quantity filters the exchange enforces on market orders
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub step_size: f64,
    pub min_qty: f64,
    pub quantity_precision: u32,
    #[serde(default)]
    pub price_precision: u32,
}

impl InstrumentRules {
    pub fn normalize(&self, quantity: f64) -> f64 {
        normalize_quantity(quantity, self.step_size, self.min_qty)
    }

    /// Quantity as sent on the wire: fixed precision, trailing zeros removed
    pub fn format_quantity(&self, quantity: f64) -> String {
        format_decimal(quantity, self.quantity_precision)
    }
}

/// Round `quantity` down to a multiple of `step`, never below `min_qty`.
///
/// A non-positive step leaves the quantity untouched apart from the minimum.
pub fn normalize_quantity(quantity: f64, step: f64, min_qty: f64) -> f64 {
    let quantity = quantity.abs();
    let stepped = if step > 0.0 {
        let steps = (quantity / step + 1e-9).floor();
        round_to(steps * step, step_decimals(step))
    } else {
        quantity
    };
    stepped.max(min_qty)
}

/// Decimal places in the shortest representation of `step`
pub fn step_decimals(step: f64) -> u32 {
    let text = format!("{}", step);
    text.split_once('.')
        .map(|(_, frac)| frac.trim_end_matches('0').len().min(16) as u32)
        .unwrap_or(0)
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

pub fn format_decimal(value: f64, precision: u32) -> String {
    let text = format!("{:.*}", precision as usize, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

/// Acknowledgement for a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: String,
    pub status: String,
    pub executed_qty: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Real,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "PAPER",
            TradingMode::Real => "REAL",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
