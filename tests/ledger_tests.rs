// Integration tests for the position ledger

mod common;

use common::{events_at, instruments, FakeExchange};
use futures_exec_engine::clients::ExchangeApi;
use futures_exec_engine::core::events::{event_channel, EventLevel};
use futures_exec_engine::core::ledger::PositionLedger;
use futures_exec_engine::types::{Instrument, Side};
use std::sync::Arc;

#[tokio::test]
async fn test_refresh_reads_tracked_positions() {
    let exchange = FakeExchange::new();
    exchange.set_position("BTCUSDT", 0.5, 60_000.0);
    exchange.set_position("ETHUSDT", -2.0, 3_000.0);
    let (events, _stream) = event_channel();
    let api: Arc<dyn ExchangeApi> = exchange.clone();
    let ledger = PositionLedger::new(api, instruments(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]), events);

    assert!(ledger.last_refresh().is_none());
    assert!(ledger.refresh().await);
    assert!(ledger.last_refresh().is_some());

    let open = ledger.open_positions();
    assert_eq!(open.len(), 2);
    assert_eq!(open[0].instrument().as_str(), "BTCUSDT");
    assert_eq!(open[1].side(), Side::Short);

    let sol = ledger.position(&Instrument::new("SOLUSDT"));
    assert!(sol.is_flat());
    assert_eq!(sol.quantity(), 0.0);
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_view() {
    let exchange = FakeExchange::new();
    exchange.set_position("BTCUSDT", 0.5, 60_000.0);
    let (events, mut stream) = event_channel();
    let api: Arc<dyn ExchangeApi> = exchange.clone();
    let ledger = PositionLedger::new(api, instruments(&["BTCUSDT"]), events);
    ledger.refresh().await;
    let before = ledger.snapshot();

    exchange.set_fail_positions(true);
    exchange.set_position("BTCUSDT", 0.0, 0.0);
    assert!(!ledger.refresh().await);

    assert!((ledger.position(&Instrument::new("BTCUSDT")).quantity() - 0.5).abs() < 1e-12);
    assert_eq!(*before, *ledger.snapshot());
    let drained = stream.drain();
    assert_eq!(events_at(&drained, EventLevel::Error).len(), 1);
}

#[tokio::test]
async fn test_snapshot_is_stable_across_refresh() {
    let exchange = FakeExchange::new();
    exchange.set_position("BTCUSDT", 1.0, 100.0);
    let (events, _stream) = event_channel();
    let api: Arc<dyn ExchangeApi> = exchange.clone();
    let ledger = PositionLedger::new(api, instruments(&["BTCUSDT"]), events);
    ledger.refresh().await;

    let held = ledger.snapshot();
    exchange.set_position("BTCUSDT", 0.0, 0.0);
    ledger.refresh().await;

    assert!(!held[&Instrument::new("BTCUSDT")].is_flat());
    assert!(ledger.position(&Instrument::new("BTCUSDT")).is_flat());
}
