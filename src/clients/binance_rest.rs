// REST client for the USD-M futures API

use super::ExchangeApi;
use crate::config::{Credentials, ExchangeConfig};
use crate::error::{
    ExchangeError, ExchangeResult, CODE_INVALID_API_KEY, CODE_INVALID_SIGNATURE, CODE_LOCAL_REJECT,
    CODE_REJECTED_API_KEY,
};
use crate::types::{step_decimals, Instrument, InstrumentRules, OrderResult, OrderSide, Position};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";

#[derive(Debug, Clone, Copy)]
struct CachedRules {
    rules: InstrumentRules,
    fetched_at: Instant,
}

/// Signed REST access to positions, instrument rules, orders and prices.
///
/// Keeps the server clock offset, the position mode and the rules cache
/// behind interior mutability so one instance can be shared across tasks.
pub struct BinanceRestClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    price_timeout: Duration,
    time_offset_ms: AtomicI64,
    order_seq: AtomicU64,
    hedge_mode: AtomicBool,
    rules_cache: Mutex<HashMap<Instrument, CachedRules>>,
    rules_ttl: Duration,
}

impl BinanceRestClient {
    pub fn new(config: &ExchangeConfig, credentials: Option<Credentials>, rules_ttl: Duration) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms: config.recv_window_ms,
            price_timeout: Duration::from_millis(config.price_timeout_ms),
            time_offset_ms: AtomicI64::new(0),
            order_seq: AtomicU64::new(Utc::now().timestamp_millis().max(0) as u64),
            hedge_mode: AtomicBool::new(false),
            rules_cache: Mutex::new(HashMap::new()),
            rules_ttl,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Whether the account holds separate long and short legs per instrument
    pub fn is_hedge_mode(&self) -> bool {
        self.hedge_mode.load(Ordering::Relaxed)
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms()
    }

    pub fn next_client_order_id(&self) -> String {
        format!("CLOSE-{}", self.order_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn rules_cache(&self) -> MutexGuard<'_, HashMap<Instrument, CachedRules>> {
        self.rules_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Measure the offset between the server clock and ours, midpoint-corrected
    pub async fn sync_time(&self) -> ExchangeResult<i64> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ServerTime {
            server_time: i64,
        }

        let sent = Utc::now().timestamp_millis();
        let time: ServerTime = self.public_get("/fapi/v1/time", &[], None).await?;
        let received = Utc::now().timestamp_millis();

        let offset = time.server_time - (sent + received) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!("🕐 Server clock offset {} ms", offset);
        Ok(offset)
    }

    /// Ask the exchange whether hedge mode is on and remember the answer
    pub async fn detect_position_mode(&self) -> ExchangeResult<bool> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DualSide {
            dual_side_position: bool,
        }

        let mode: DualSide = self
            .signed_request(Method::GET, "/fapi/v1/positionSide/dual", Vec::new())
            .await?;
        self.hedge_mode.store(mode.dual_side_position, Ordering::Relaxed);
        info!(
            "⚙️  Position mode: {}",
            if mode.dual_side_position { "hedge" } else { "one-way" }
        );
        Ok(mode.dual_side_position)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).query(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        decode_response(response).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> ExchangeResult<T> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("no API credentials configured".to_string()))?;

        params.push(("timestamp", self.timestamp_ms().to_string()));
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        let query = encode_query(&params)?;
        let signature = sign_payload(&credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header(API_KEY_HEADER, &credentials.api_key)
            .send()
            .await?;
        let result = decode_response(response).await;

        if let Err(err) = &result {
            if err.needs_time_resync() {
                warn!("🕐 Request timestamp rejected, resyncing server clock");
                if let Err(e) = self.sync_time().await {
                    warn!("Clock resync failed: {}", e);
                }
            }
        }
        result
    }

    fn cached_rules(&self, instrument: &Instrument) -> Option<InstrumentRules> {
        let cache = self.rules_cache();
        cache
            .get(instrument)
            .filter(|cached| cached.fetched_at.elapsed() < self.rules_ttl)
            .map(|cached| cached.rules)
    }
}

#[async_trait]
impl ExchangeApi for BinanceRestClient {
    async fn query_positions(&self, instruments: &[Instrument]) -> ExchangeResult<HashMap<Instrument, Position>> {
        let rows: Vec<PositionRisk> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        let tracked: HashSet<&Instrument> = instruments.iter().collect();

        let mut positions: HashMap<Instrument, Position> = HashMap::new();
        for row in rows {
            let instrument = Instrument::new(&row.symbol);
            if !tracked.is_empty() && !tracked.contains(&instrument) {
                continue;
            }
            let amount = parse_decimal(&row.position_amt, "positionAmt")?;
            if amount == 0.0 {
                continue;
            }
            let entry = parse_decimal(&row.entry_price, "entryPrice")?;
            if let Some(existing) = positions.get(&instrument) {
                warn!("⚠️  {} has both hedge legs open, tracking the larger", instrument);
                if existing.quantity().abs() >= amount.abs() {
                    continue;
                }
            }
            positions.insert(instrument.clone(), Position::from_amount(instrument, amount, entry));
        }
        Ok(positions)
    }

    async fn instrument_rules(&self, instrument: &Instrument) -> ExchangeResult<InstrumentRules> {
        if let Some(rules) = self.cached_rules(instrument) {
            return Ok(rules);
        }

        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[], None).await?;
        let fetched_at = Instant::now();
        let mut found = None;
        {
            // One exchangeInfo call covers every listed symbol
            let mut cache = self.rules_cache();
            for symbol in &info.symbols {
                let Some(rules) = symbol.rules() else { continue };
                let listed = Instrument::new(&symbol.symbol);
                if &listed == instrument {
                    found = Some(rules);
                }
                cache.insert(listed, CachedRules { rules, fetched_at });
            }
        }
        debug!("📐 Cached quantity rules for {} symbols", info.symbols.len());

        found.ok_or_else(|| ExchangeError::Rejected {
            code: CODE_LOCAL_REJECT,
            message: format!("no quantity rules listed for {}", instrument),
        })
    }

    fn invalidate_rules(&self, instrument: &Instrument) {
        self.rules_cache().remove(instrument);
    }

    async fn place_reduce_only_market_order(
        &self,
        instrument: &Instrument,
        quantity: f64,
        side: OrderSide,
    ) -> ExchangeResult<OrderResult> {
        if !(quantity > 0.0) {
            return Err(ExchangeError::Rejected {
                code: CODE_LOCAL_REJECT,
                message: format!("refusing order with quantity {}", quantity),
            });
        }

        let rules = self.instrument_rules(instrument).await?;
        let client_order_id = self.next_client_order_id();
        let mut params = vec![
            ("symbol", instrument.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", rules.format_quantity(quantity)),
            ("newClientOrderId", client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        // Hedge mode rejects reduceOnly; the leg is named instead
        if self.is_hedge_mode() {
            params.push(("positionSide", side.reduced_position_side().to_string()));
        } else {
            params.push(("reduceOnly", "true".to_string()));
        }

        let ack: OrderAck = self.signed_request(Method::POST, "/fapi/v1/order", params).await?;
        let executed_qty = ack.executed_qty.parse::<f64>().unwrap_or(0.0);
        info!(
            "📤 {} {} {} reduce-only: order {} {} (filled {})",
            side, rules.format_quantity(quantity), instrument, ack.order_id, ack.status, executed_qty
        );

        Ok(OrderResult {
            order_id: ack.order_id.to_string(),
            client_order_id: if ack.client_order_id.is_empty() { client_order_id } else { ack.client_order_id },
            status: ack.status,
            executed_qty,
        })
    }

    async fn fetch_mid_price(&self, instrument: &Instrument) -> ExchangeResult<f64> {
        let ticker: BookTickerRest = self
            .public_get(
                "/fapi/v1/ticker/bookTicker",
                &[("symbol", instrument.to_string())],
                Some(self.price_timeout),
            )
            .await?;
        let bid = parse_decimal(&ticker.bid_price, "bidPrice")?;
        let ask = parse_decimal(&ticker.ask_price, "askPrice")?;
        if bid <= 0.0 || ask <= 0.0 {
            return Err(ExchangeError::Decode(format!("empty book for {}", instrument)));
        }
        Ok((bid + ask) / 2.0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    quantity_precision: Option<u32>,
    #[serde(default)]
    price_precision: Option<u32>,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
}

impl SymbolInfo {
    /// Market-order lot filter when usable, otherwise the generic lot filter
    fn rules(&self) -> Option<InstrumentRules> {
        let lot = |kind: &str| {
            let filter = self.filters.iter().find(|f| f.filter_type == kind)?;
            let step = filter.step_size.as_deref()?.parse::<f64>().ok()?;
            let min_qty = filter.min_qty.as_deref()?.parse::<f64>().ok()?;
            Some((step, min_qty))
        };
        let (step_size, min_qty) = lot("MARKET_LOT_SIZE")
            .filter(|(step, _)| *step > 0.0)
            .or_else(|| lot("LOT_SIZE"))?;

        Some(InstrumentRules {
            step_size,
            min_qty,
            quantity_precision: self.quantity_precision.unwrap_or_else(|| step_decimals(step_size)),
            price_precision: self.price_precision.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: i64,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    executed_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTickerRest {
    bid_price: String,
    ask_price: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
    let status = response.status();
    let retry_after_ms = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1_000));
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Decode(format!("{} in {}", e, excerpt(&body))));
    }

    let api_error: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = if api_error.msg.is_empty() { excerpt(&body) } else { api_error.msg };
    Err(classify_failure(status.as_u16(), retry_after_ms, api_error.code, message))
}

/// Map an HTTP failure onto the error taxonomy
pub fn classify_failure(status: u16, retry_after_ms: Option<u64>, code: i64, message: String) -> ExchangeError {
    match status {
        429 | 418 => ExchangeError::RateLimited { retry_after_ms },
        401 | 403 => ExchangeError::Auth(message),
        _ if matches!(code, CODE_INVALID_API_KEY | CODE_REJECTED_API_KEY | CODE_INVALID_SIGNATURE) => {
            ExchangeError::Auth(format!("{} ({})", message, code))
        }
        400..=499 => ExchangeError::Rejected { code, message },
        _ => ExchangeError::Network(format!("HTTP {}: {}", status, message)),
    }
}

/// Hex HMAC-SHA256 of `payload`
pub fn sign_payload(secret: &str, payload: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("unusable API secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Form-encode signed parameters in the order given; the signature covers this exact string
fn encode_query(params: &[(&str, String)]) -> ExchangeResult<String> {
    serde_urlencoded::to_string(params)
        .map_err(|e| ExchangeError::Rejected {
            code: CODE_LOCAL_REJECT,
            message: format!("unencodable request parameters: {}", e),
        })
}

fn parse_decimal(value: &str, field: &str) -> ExchangeResult<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("{} is not a number: {:?}", field, value)))
}

fn excerpt(body: &str) -> String {
    body.chars().take(200).collect()
}
