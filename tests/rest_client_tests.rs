// Integration tests for the REST client against a mock HTTP server

use futures_exec_engine::clients::{BinanceRestClient, ExchangeApi};
use futures_exec_engine::config::{Credentials, ExchangeConfig};
use futures_exec_engine::core::events::{event_channel, EventLevel};
use futures_exec_engine::error::ExchangeError;
use futures_exec_engine::startup::select_trading_mode;
use futures_exec_engine::types::{Instrument, OrderSide, Side, TradingMode};
use mockito::{Matcher, Server};
use std::time::Duration;

fn client_for(server: &Server, credentials: Option<Credentials>) -> BinanceRestClient {
    let config = ExchangeConfig {
        rest_url: server.url(),
        ..ExchangeConfig::default()
    };
    BinanceRestClient::new(&config, credentials, Duration::from_secs(60)).expect("Failed to build client")
}

fn test_credentials() -> Option<Credentials> {
    Some(Credentials::new("test-key", "test-secret"))
}

const EXCHANGE_INFO: &str = r#"{
    "symbols": [
        {
            "symbol": "BTCUSDT",
            "quantityPrecision": 3,
            "filters": [
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.010", "minQty": "0.010"}
            ]
        },
        {
            "symbol": "DOGEUSDT",
            "quantityPrecision": 0,
            "filters": [
                {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1"},
                {"filterType": "MARKET_LOT_SIZE", "stepSize": "0", "minQty": "0"}
            ]
        }
    ]
}"#;

#[tokio::test]
async fn test_query_positions_skips_flat_and_untracked_rows() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/fapi/v2/positionRisk")
        .match_query(Matcher::AllOf(vec![
            Matcher::Regex("timestamp=\\d+".to_string()),
            Matcher::Regex("recvWindow=5000".to_string()),
            Matcher::Regex("signature=[0-9a-f]{64}".to_string()),
        ]))
        .match_header("X-MBX-APIKEY", "test-key")
        .with_status(200)
        .with_body(
            r#"[
                {"symbol": "BTCUSDT", "positionAmt": "0.250", "entryPrice": "60000.0"},
                {"symbol": "ETHUSDT", "positionAmt": "-1.5", "entryPrice": "3000.5"},
                {"symbol": "SOLUSDT", "positionAmt": "0.000", "entryPrice": "0.0"},
                {"symbol": "XRPUSDT", "positionAmt": "100", "entryPrice": "0.5"}
            ]"#,
        )
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let tracked = vec![Instrument::new("BTCUSDT"), Instrument::new("ETHUSDT"), Instrument::new("SOLUSDT")];
    let positions = client.query_positions(&tracked).await.expect("Query should succeed");

    mock.assert_async().await;
    assert_eq!(positions.len(), 2);

    let btc = &positions[&Instrument::new("BTCUSDT")];
    assert_eq!(btc.side(), Side::Long);
    assert!((btc.quantity() - 0.25).abs() < 1e-12);
    assert!((btc.entry_price() - 60_000.0).abs() < 1e-9);

    let eth = &positions[&Instrument::new("ETHUSDT")];
    assert_eq!(eth.side(), Side::Short);
    assert!((eth.quantity() + 1.5).abs() < 1e-12);

    assert!(!positions.contains_key(&Instrument::new("SOLUSDT")));
    assert!(!positions.contains_key(&Instrument::new("XRPUSDT")));
}

#[tokio::test]
async fn test_signed_request_without_credentials_is_auth_error() {
    let server = Server::new_async().await;
    let client = client_for(&server, None);

    let result = client.query_positions(&[Instrument::new("BTCUSDT")]).await;
    assert!(matches!(result, Err(ExchangeError::Auth(_))));
}

#[tokio::test]
async fn test_instrument_rules_prefer_market_lot_size_and_cache() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .with_status(200)
        .with_body(EXCHANGE_INFO)
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, None);

    let btc = client.instrument_rules(&Instrument::new("BTCUSDT")).await.expect("BTC rules");
    assert!((btc.step_size - 0.01).abs() < 1e-12);
    assert!((btc.min_qty - 0.01).abs() < 1e-12);
    assert_eq!(btc.quantity_precision, 3);

    // Zero market step falls back to LOT_SIZE; served from the cache
    let doge = client.instrument_rules(&Instrument::new("DOGEUSDT")).await.expect("DOGE rules");
    assert!((doge.step_size - 1.0).abs() < 1e-12);
    assert_eq!(doge.quantity_precision, 0);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_instrument_rules_unknown_symbol_is_rejected() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .with_status(200)
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;

    let client = client_for(&server, None);
    let result = client.instrument_rules(&Instrument::new("NOPEUSDT")).await;
    assert!(matches!(result, Err(ExchangeError::Rejected { .. })));
}

#[tokio::test]
async fn test_order_is_reduce_only_market_with_formatted_quantity() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .with_status(200)
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;
    let order = server
        .mock("POST", "/fapi/v1/order")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".to_string(), "BTCUSDT".to_string()),
            Matcher::UrlEncoded("side".to_string(), "SELL".to_string()),
            Matcher::UrlEncoded("type".to_string(), "MARKET".to_string()),
            Matcher::UrlEncoded("quantity".to_string(), "0.25".to_string()),
            Matcher::UrlEncoded("reduceOnly".to_string(), "true".to_string()),
            Matcher::UrlEncoded("newOrderRespType".to_string(), "RESULT".to_string()),
            Matcher::Regex("newClientOrderId=CLOSE-\\d+".to_string()),
            Matcher::Regex("signature=[0-9a-f]{64}$".to_string()),
        ]))
        .match_header("X-MBX-APIKEY", "test-key")
        .with_status(200)
        .with_body(r#"{"orderId": 42, "clientOrderId": "CLOSE-7", "status": "FILLED", "executedQty": "0.250"}"#)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let result = client
        .place_reduce_only_market_order(&Instrument::new("BTCUSDT"), 0.25, OrderSide::Sell)
        .await
        .expect("Order should be accepted");

    order.assert_async().await;
    assert_eq!(result.order_id, "42");
    assert_eq!(result.client_order_id, "CLOSE-7");
    assert_eq!(result.status, "FILLED");
    assert!((result.executed_qty - 0.25).abs() < 1e-12);
}

#[tokio::test]
async fn test_hedge_mode_orders_name_the_position_side() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/positionSide/dual")
        .match_query(Matcher::Regex("signature=".to_string()))
        .with_status(200)
        .with_body(r#"{"dualSidePosition": true}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .with_status(200)
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;
    let order = server
        .mock("POST", "/fapi/v1/order")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("side".to_string(), "BUY".to_string()),
            Matcher::UrlEncoded("positionSide".to_string(), "SHORT".to_string()),
        ]))
        .with_status(200)
        .with_body(r#"{"orderId": 9, "status": "FILLED", "executedQty": "2"}"#)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    assert!(client.detect_position_mode().await.expect("Position mode"));
    assert!(client.is_hedge_mode());

    let result = client
        .place_reduce_only_market_order(&Instrument::new("DOGEUSDT"), 2.0, OrderSide::Buy)
        .await
        .expect("Hedge order should be accepted");

    order.assert_async().await;
    assert!(result.client_order_id.starts_with("CLOSE-"));
}

#[tokio::test]
async fn test_non_positive_quantity_rejected_locally() {
    let server = Server::new_async().await;
    let client = client_for(&server, test_credentials());

    let result = client
        .place_reduce_only_market_order(&Instrument::new("BTCUSDT"), 0.0, OrderSide::Sell)
        .await;
    assert!(matches!(result, Err(ExchangeError::Rejected { .. })));
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/ticker/bookTicker")
        .match_query(Matcher::UrlEncoded("symbol".to_string(), "BTCUSDT".to_string()))
        .with_status(429)
        .with_header("Retry-After", "3")
        .with_body(r#"{"code": -1003, "msg": "Too many requests"}"#)
        .create_async()
        .await;

    let client = client_for(&server, None);
    let err = client
        .fetch_mid_price(&Instrument::new("BTCUSDT"))
        .await
        .expect_err("Should be rate limited");

    assert_eq!(err, ExchangeError::RateLimited { retry_after_ms: Some(3_000) });
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn test_bad_api_key_is_auth_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v2/positionRisk")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"code": -2014, "msg": "API-key format invalid."}"#)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let err = client
        .query_positions(&[Instrument::new("BTCUSDT")])
        .await
        .expect_err("Should fail");

    assert!(matches!(err, ExchangeError::Auth(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_order_rejection_is_not_retryable() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .with_status(200)
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;
    server
        .mock("POST", "/fapi/v1/order")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"code": -2022, "msg": "ReduceOnly Order is rejected."}"#)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let err = client
        .place_reduce_only_market_order(&Instrument::new("BTCUSDT"), 1.0, OrderSide::Sell)
        .await
        .expect_err("Should be rejected");

    assert_eq!(
        err,
        ExchangeError::Rejected {
            code: -2022,
            message: "ReduceOnly Order is rejected.".to_string()
        }
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_fetch_mid_price_averages_book() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/ticker/bookTicker")
        .match_query(Matcher::UrlEncoded("symbol".to_string(), "ETHUSDT".to_string()))
        .with_status(200)
        .with_body(r#"{"symbol": "ETHUSDT", "bidPrice": "3000.10", "bidQty": "5", "askPrice": "3000.30", "askQty": "2"}"#)
        .create_async()
        .await;

    let client = client_for(&server, None);
    let mid = client.fetch_mid_price(&Instrument::new("ETHUSDT")).await.expect("Mid price");
    assert!((mid - 3000.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/ticker/bookTicker")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("<html>maintenance</html>")
        .create_async()
        .await;

    let client = client_for(&server, None);
    let err = client
        .fetch_mid_price(&Instrument::new("ETHUSDT"))
        .await
        .expect_err("Should not decode");
    assert!(matches!(err, ExchangeError::Decode(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_sync_time_records_offset() {
    let mut server = Server::new_async().await;
    let server_time = chrono::Utc::now().timestamp_millis() + 60_000;
    server
        .mock("GET", "/fapi/v1/time")
        .with_status(200)
        .with_body(format!(r#"{{"serverTime": {}}}"#, server_time))
        .create_async()
        .await;

    let client = client_for(&server, None);
    let offset = client.sync_time().await.expect("Time sync");

    assert!((offset - 60_000).abs() < 5_000, "offset was {}", offset);
    assert_eq!(client.time_offset_ms(), offset);
}

#[tokio::test]
async fn test_real_mode_without_credentials_downgrades_to_paper() {
    let server = Server::new_async().await;
    let client = client_for(&server, None);
    let (events, mut stream) = event_channel();

    let mode = select_trading_mode(TradingMode::Real, &client, &events).await;

    assert_eq!(mode, TradingMode::Paper);
    assert!(stream.drain().iter().any(|e| e.level == EventLevel::Warn));
}

#[tokio::test]
async fn test_rejected_credentials_downgrade_to_paper() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/positionSide/dual")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(r#"{"code": -2015, "msg": "Invalid API-key, IP, or permissions for action."}"#)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let (events, _stream) = event_channel();

    assert_eq!(select_trading_mode(TradingMode::Real, &client, &events).await, TradingMode::Paper);
}

#[tokio::test]
async fn test_accepted_credentials_keep_real_mode() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/positionSide/dual")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"dualSidePosition": false}"#)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let (events, _stream) = event_channel();

    assert_eq!(select_trading_mode(TradingMode::Real, &client, &events).await, TradingMode::Real);
    assert!(!client.is_hedge_mode());
    assert_eq!(select_trading_mode(TradingMode::Paper, &client, &events).await, TradingMode::Paper);
}

#[tokio::test]
async fn test_hedge_legs_keep_the_larger_exposure() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v2/positionRisk")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            r#"[
                {"symbol": "BTCUSDT", "positionAmt": "0.1", "entryPrice": "60000", "positionSide": "LONG"},
                {"symbol": "BTCUSDT", "positionAmt": "-0.4", "entryPrice": "61000", "positionSide": "SHORT"}
            ]"#,
        )
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let positions = client
        .query_positions(&[Instrument::new("BTCUSDT")])
        .await
        .expect("Query should succeed");

    let btc = &positions[&Instrument::new("BTCUSDT")];
    assert_eq!(btc.side(), Side::Short);
    assert!((btc.quantity() + 0.4).abs() < 1e-12);
}

#[tokio::test]
async fn test_timestamp_rejection_resyncs_clock() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v2/positionRisk")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"code": -1021, "msg": "Timestamp for this request is outside of the recvWindow."}"#)
        .create_async()
        .await;
    let server_time = chrono::Utc::now().timestamp_millis() + 60_000;
    let time = server
        .mock("GET", "/fapi/v1/time")
        .with_status(200)
        .with_body(format!(r#"{{"serverTime": {}}}"#, server_time))
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    assert_eq!(client.time_offset_ms(), 0);
    let result = client.query_positions(&[Instrument::new("BTCUSDT")]).await;

    assert!(matches!(result, Err(ExchangeError::Rejected { code: -1021, .. })));
    time.assert_async().await;
    assert!((client.time_offset_ms() - 60_000).abs() < 5_000, "offset was {}", client.time_offset_ms());
}

#[tokio::test]
async fn test_client_order_ids_increase_across_orders() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .with_status(200)
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;
    // No clientOrderId in the ack, so the id the client sent is reported back
    let orders = server
        .mock("POST", "/fapi/v1/order")
        .match_query(Matcher::Regex("newClientOrderId=CLOSE-\\d+".to_string()))
        .with_status(200)
        .with_body(r#"{"orderId": 1, "status": "FILLED", "executedQty": "0.010"}"#)
        .expect(3)
        .create_async()
        .await;

    let client = client_for(&server, test_credentials());
    let mut sequence = Vec::new();
    for _ in 0..3 {
        let result = client
            .place_reduce_only_market_order(&Instrument::new("BTCUSDT"), 0.01, OrderSide::Sell)
            .await
            .expect("Order should be accepted");
        let n: u64 = result
            .client_order_id
            .strip_prefix("CLOSE-")
            .and_then(|n| n.parse().ok())
            .expect("CLOSE-<n> id");
        sequence.push(n);
    }

    orders.assert_async().await;
    assert!(sequence.windows(2).all(|pair| pair[1] > pair[0]), "ids were {:?}", sequence);
}
