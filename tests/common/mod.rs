// Common test utilities and helpers
#![allow(dead_code)]

use async_trait::async_trait;
use futures_exec_engine::clients::ExchangeApi;
use futures_exec_engine::config::{EngineConfig, ExecutionConfig};
use futures_exec_engine::core::events::{event_channel, EngineEvent, EventLevel, EventSink, EventStream};
use futures_exec_engine::core::execution::{executor_for, ExecutionCoordinator};
use futures_exec_engine::core::ledger::PositionLedger;
use futures_exec_engine::core::risk::{ExitThresholds, RiskEvaluator};
use futures_exec_engine::error::{ExchangeError, ExchangeResult};
use futures_exec_engine::types::{Instrument, InstrumentRules, OrderResult, OrderSide, Position, TradingMode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An order the fake exchange accepted
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub instrument: Instrument,
    pub quantity: f64,
    pub side: OrderSide,
}

#[derive(Default)]
struct FakeState {
    positions: HashMap<Instrument, (f64, f64)>,
    rules: HashMap<Instrument, InstrumentRules>,
    max_fill: Option<f64>,
    order_errors: VecDeque<ExchangeError>,
    orders: Vec<PlacedOrder>,
    mid_prices: HashMap<Instrument, f64>,
    price_fetches: HashMap<Instrument, usize>,
    position_queries: usize,
    fail_positions: bool,
    rules_invalidations: usize,
}

/// In-memory exchange. Orders reduce the stored position immediately,
/// optionally capped per order to simulate partial fills.
#[derive(Default)]
pub struct FakeExchange {
    state: Mutex<FakeState>,
    order_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_position(&self, symbol: &str, amount: f64, entry: f64) {
        self.state().positions.insert(Instrument::new(symbol), (amount, entry));
    }

    pub fn position_amount(&self, symbol: &str) -> f64 {
        self.state().positions.get(&Instrument::new(symbol)).map_or(0.0, |(amount, _)| *amount)
    }

    pub fn set_rules(&self, symbol: &str, step_size: f64, min_qty: f64, quantity_precision: u32) {
        self.state().rules.insert(
            Instrument::new(symbol),
            InstrumentRules {
                step_size,
                min_qty,
                quantity_precision,
                price_precision: 2,
            },
        );
    }

    pub fn set_max_fill(&self, max_fill: f64) {
        self.state().max_fill = Some(max_fill);
    }

    pub fn push_order_error(&self, error: ExchangeError) {
        self.state().order_errors.push_back(error);
    }

    pub fn set_mid_price(&self, symbol: &str, price: f64) {
        self.state().mid_prices.insert(Instrument::new(symbol), price);
    }

    pub fn set_fail_positions(&self, fail: bool) {
        self.state().fail_positions = fail;
    }

    pub fn set_order_delay(&self, delay: Duration) {
        *self.order_delay.lock().unwrap() = delay;
    }

    pub fn orders(&self) -> Vec<PlacedOrder> {
        self.state().orders.clone()
    }

    pub fn price_fetches(&self, symbol: &str) -> usize {
        self.state().price_fetches.get(&Instrument::new(symbol)).copied().unwrap_or(0)
    }

    pub fn position_queries(&self) -> usize {
        self.state().position_queries
    }

    pub fn rules_invalidations(&self) -> usize {
        self.state().rules_invalidations
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn query_positions(&self, instruments: &[Instrument]) -> ExchangeResult<HashMap<Instrument, Position>> {
        let mut state = self.state();
        state.position_queries += 1;
        if state.fail_positions {
            return Err(ExchangeError::Network("connection reset".to_string()));
        }
        Ok(instruments
            .iter()
            .filter_map(|instrument| {
                state
                    .positions
                    .get(instrument)
                    .map(|(amount, entry)| (instrument.clone(), Position::from_amount(instrument.clone(), *amount, *entry)))
            })
            .collect())
    }

    async fn instrument_rules(&self, instrument: &Instrument) -> ExchangeResult<InstrumentRules> {
        Ok(self.state().rules.get(instrument).copied().unwrap_or(InstrumentRules {
            step_size: 0.001,
            min_qty: 0.001,
            quantity_precision: 3,
            price_precision: 2,
        }))
    }

    fn invalidate_rules(&self, _instrument: &Instrument) {
        self.state().rules_invalidations += 1;
    }

    async fn place_reduce_only_market_order(
        &self,
        instrument: &Instrument,
        quantity: f64,
        side: OrderSide,
    ) -> ExchangeResult<OrderResult> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.order_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state();
        if let Some(error) = state.order_errors.pop_front() {
            return Err(error);
        }
        state.orders.push(PlacedOrder {
            instrument: instrument.clone(),
            quantity,
            side,
        });
        let fill = state.max_fill.map_or(quantity, |cap| quantity.min(cap));
        let order_number = state.orders.len();
        if let Some((amount, _)) = state.positions.get_mut(instrument) {
            let reduced = (amount.abs() - fill).max(0.0);
            *amount = reduced.copysign(*amount);
            if reduced < 1e-12 {
                *amount = 0.0;
            }
        }
        Ok(OrderResult {
            order_id: order_number.to_string(),
            client_order_id: format!("CLOSE-{}", order_number),
            status: "FILLED".to_string(),
            executed_qty: fill,
        })
    }

    async fn fetch_mid_price(&self, instrument: &Instrument) -> ExchangeResult<f64> {
        let mut state = self.state();
        *state.price_fetches.entry(instrument.clone()).or_insert(0) += 1;
        state
            .mid_prices
            .get(instrument)
            .copied()
            .ok_or_else(|| ExchangeError::Network(format!("no price for {}", instrument)))
    }
}

pub fn instruments(symbols: &[&str]) -> Vec<Instrument> {
    symbols.iter().map(Instrument::new).collect()
}

/// Execution settings that keep tests fast
pub fn fast_execution_config() -> ExecutionConfig {
    ExecutionConfig {
        cooldown_ms: 1_200,
        max_attempts: 3,
        settle_ms: 0,
        retry_backoff_ms: 5,
        ..ExecutionConfig::default()
    }
}

pub fn create_test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.execution = fast_execution_config();
    config.engine.tick_ms = 10;
    config
}

/// Ledger, evaluator and coordinator wired over the fake exchange
pub struct Harness {
    pub exchange: Arc<FakeExchange>,
    pub ledger: Arc<PositionLedger>,
    pub evaluator: Arc<RiskEvaluator>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub events: EventSink,
    pub event_stream: EventStream,
}

impl Harness {
    pub async fn new(
        exchange: Arc<FakeExchange>,
        symbols: &[&str],
        mode: TradingMode,
        config: &ExecutionConfig,
        thresholds: ExitThresholds,
    ) -> Self {
        let (events, event_stream) = event_channel();
        let api: Arc<dyn ExchangeApi> = exchange.clone();
        let ledger = Arc::new(PositionLedger::new(api.clone(), instruments(symbols), events.clone()));
        ledger.refresh().await;
        let evaluator = Arc::new(RiskEvaluator::new(thresholds));
        let executor = executor_for(mode, api, config, events.clone());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            ledger.clone(),
            executor,
            evaluator.clone(),
            config.cooldown(),
            events.clone(),
        ));
        Self {
            exchange,
            ledger,
            evaluator,
            coordinator,
            events,
            event_stream,
        }
    }

    pub async fn live(exchange: Arc<FakeExchange>, symbols: &[&str]) -> Self {
        Self::new(exchange, symbols, TradingMode::Real, &fast_execution_config(), ExitThresholds::default()).await
    }

    pub async fn paper(exchange: Arc<FakeExchange>, symbols: &[&str]) -> Self {
        Self::new(exchange, symbols, TradingMode::Paper, &fast_execution_config(), ExitThresholds::default()).await
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.event_stream.drain()
    }
}

pub fn events_at(events: &[EngineEvent], level: EventLevel) -> Vec<&EngineEvent> {
    events.iter().filter(|e| e.level == level).collect()
}
