// WebSocket client for the futures best bid/ask streams

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::Instrument;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// Combined-stream URL subscribing to `bookTicker` for every instrument given
pub fn stream_url(ws_base: &str, instruments: &[Instrument]) -> String {
    let streams: Vec<String> = instruments.iter().map(Instrument::book_ticker_stream).collect();
    format!("{}/stream?streams={}", ws_base.trim_end_matches('/'), streams.join("/"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub best_bid: String,
    #[serde(rename = "a")]
    pub best_ask: String,
}

impl BookTicker {
    /// Mid price, or `None` when either side of the book is empty
    pub fn mid(&self) -> Option<f64> {
        let bid = self.best_bid.parse::<f64>().ok()?;
        let ask = self.best_ask.parse::<f64>().ok()?;
        if bid > 0.0 && ask > 0.0 {
            Some((bid + ask) / 2.0)
        } else {
            None
        }
    }
}

/// Parse one combined-stream frame.
///
/// Frames without a `data` payload (subscription acks and the like) yield `Ok(None)`,
/// as do quotes with an empty side.
pub fn parse_book_ticker(text: &str) -> ExchangeResult<Option<(Instrument, f64)>> {
    let frame: Value = serde_json::from_str(text)?;
    let Some(data) = frame.get("data") else {
        return Ok(None);
    };
    let ticker = BookTicker::deserialize(data)?;
    Ok(ticker.mid().map(|mid| (Instrument::new(&ticker.symbol), mid)))
}

/// What the shard should do with one frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Quote(Instrument, f64),
    /// Frame that failed to parse; the connection stays up
    Malformed(String),
    Closed,
    Other,
}

/// Time limits that keep a dead connection from hanging its shard
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamLiveness {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

/// One connected shard of the combined stream
pub struct BookTickerStream {
    socket: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    liveness: StreamLiveness,
    last_frame: Instant,
    ping_sent: Option<Instant>,
}

impl BookTickerStream {
    pub async fn connect(url: &str, liveness: StreamLiveness) -> ExchangeResult<Self> {
        let (socket, _) = timeout(liveness.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ExchangeError::Network(format!("connect timed out after {:?}", liveness.connect_timeout)))??;
        debug!("✅ Connected to {}", url);
        Ok(Self {
            socket,
            liveness,
            last_frame: Instant::now(),
            ping_sent: None,
        })
    }

    /// Next meaningful frame. `Ok(None)` means the server ended the stream.
    /// Pings are answered here; a silent connection is pinged once and then
    /// reported as an error.
    pub async fn next_event(&mut self) -> ExchangeResult<Option<StreamEvent>> {
        let frame = loop {
            let deadline = match self.ping_sent {
                Some(sent) => sent + self.liveness.pong_timeout,
                None => self.last_frame + self.liveness.ping_interval,
            };
            match timeout_at(deadline, self.socket.next()).await {
                Ok(frame) => break frame,
                Err(_) if self.ping_sent.is_some() => {
                    return Err(ExchangeError::Network(format!(
                        "no frames for {:?}",
                        self.last_frame.elapsed()
                    )));
                }
                Err(_) => {
                    self.socket.send(Message::Ping(Vec::new())).await?;
                    self.ping_sent = Some(Instant::now());
                }
            }
        };
        self.last_frame = Instant::now();
        self.ping_sent = None;

        let Some(frame) = frame else {
            return Ok(None);
        };
        match frame? {
            Message::Text(text) => match parse_book_ticker(&text) {
                Ok(Some((instrument, mid))) => Ok(Some(StreamEvent::Quote(instrument, mid))),
                Ok(None) => Ok(Some(StreamEvent::Other)),
                Err(e) => Ok(Some(StreamEvent::Malformed(e.to_string()))),
            },
            Message::Ping(payload) => {
                self.socket.send(Message::Pong(payload)).await?;
                Ok(Some(StreamEvent::Other))
            }
            Message::Close(frame) => {
                debug!("Stream closed by server: {:?}", frame);
                Ok(Some(StreamEvent::Closed))
            }
            _ => Ok(Some(StreamEvent::Other)),
        }
    }
}
