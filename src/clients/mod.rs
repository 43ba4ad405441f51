// Exchange clients

pub mod binance_rest;
pub mod binance_ws;

pub use binance_rest::BinanceRestClient;
pub use binance_ws::{parse_book_ticker, stream_url};

use crate::error::ExchangeResult;
use crate::types::{Instrument, InstrumentRules, OrderResult, OrderSide, Position};
use async_trait::async_trait;
use std::collections::HashMap;

/// Exchange operations the engine depends on.
///
/// Implemented by [`BinanceRestClient`]; tests substitute an in-memory exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Current positions for the given instruments. Instruments without
    /// exposure may be omitted from the map.
    async fn query_positions(&self, instruments: &[Instrument]) -> ExchangeResult<HashMap<Instrument, Position>>;

    async fn instrument_rules(&self, instrument: &Instrument) -> ExchangeResult<InstrumentRules>;

    /// Drop cached rules so the next lookup hits the exchange
    fn invalidate_rules(&self, _instrument: &Instrument) {}

    async fn place_reduce_only_market_order(
        &self,
        instrument: &Instrument,
        quantity: f64,
        side: OrderSide,
    ) -> ExchangeResult<OrderResult>;

    /// Mid of the best bid and ask, fetched synchronously
    async fn fetch_mid_price(&self, instrument: &Instrument) -> ExchangeResult<f64>;
}
