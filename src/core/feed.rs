// Price feed: sharded WebSocket streams with a REST fallback for stale prices

use crate::clients::binance_ws::{stream_url, BookTickerStream, StreamEvent, StreamLiveness};
use crate::clients::ExchangeApi;
use crate::config::FeedConfig;
use crate::core::events::EventSink;
use crate::core::price_book::PriceBook;
use crate::core::retry::{Backoff, ExponentialBackoff};
use crate::error::ExchangeResult;
use crate::types::{Instrument, PriceSample, PriceSource};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Split the universe into connection-sized groups, preserving order
pub fn partition_shards(instruments: &[Instrument], shard_size: usize) -> Vec<Vec<Instrument>> {
    instruments.chunks(shard_size.max(1)).map(<[Instrument]>::to_vec).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRefresh {
    pub refreshed: usize,
    pub failed: usize,
}

pub struct FeedManager {
    api: Arc<dyn ExchangeApi>,
    prices: PriceBook,
    instruments: Vec<Instrument>,
    shards: Vec<Vec<Instrument>>,
    ws_base: String,
    heartbeat: Duration,
    reconnect: ExponentialBackoff,
    liveness: StreamLiveness,
    events: EventSink,
}

impl FeedManager {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        instruments: Vec<Instrument>,
        config: &FeedConfig,
        ws_base: &str,
        prices: PriceBook,
        events: EventSink,
    ) -> Self {
        let shards = partition_shards(&instruments, config.shard_size);
        Self {
            api,
            prices,
            instruments,
            shards,
            ws_base: ws_base.to_string(),
            heartbeat: Duration::from_millis(config.heartbeat_ms),
            reconnect: ExponentialBackoff {
                base: Duration::from_millis(config.reconnect_backoff_ms),
                max: Duration::from_millis(config.reconnect_backoff_max_ms),
                multiplier: 2.0,
                jitter: config.reconnect_jitter,
            },
            liveness: config.liveness(),
            events,
        }
    }

    pub fn prices(&self) -> &PriceBook {
        &self.prices
    }

    pub fn shards(&self) -> &[Vec<Instrument>] {
        &self.shards
    }

    /// Start one supervised stream task per shard. Tasks exit when `shutdown` flips to true.
    pub fn spawn_shards(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.shards
            .iter()
            .enumerate()
            .map(|(index, instruments)| {
                let shard = Shard {
                    index,
                    url: stream_url(&self.ws_base, instruments),
                    size: instruments.len(),
                    prices: self.prices.clone(),
                    events: self.events.clone(),
                    reconnect: self.reconnect,
                    liveness: self.liveness,
                };
                tokio::spawn(shard.run(shutdown.clone()))
            })
            .collect()
    }

    /// Fetch a REST price for every instrument whose sample is missing or
    /// older than the heartbeat. Failures are left for the next tick.
    pub async fn refresh_stale(&self, now: DateTime<Utc>) -> StaleRefresh {
        let stale = self.prices.stale(&self.instruments, now, self.heartbeat);
        if stale.is_empty() {
            return StaleRefresh::default();
        }

        let fetches = stale.iter().map(|instrument| self.api.fetch_mid_price(instrument));
        let results = join_all(fetches).await;

        let mut summary = StaleRefresh::default();
        for (instrument, result) in stale.into_iter().zip(results) {
            match result {
                Ok(price) if price > 0.0 => {
                    self.prices
                        .publish(PriceSample::new(instrument, price, Utc::now(), PriceSource::Rest));
                    summary.refreshed += 1;
                }
                Ok(price) => {
                    debug!("Ignoring non-positive fallback price {} for {}", price, instrument);
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!("⚠️  Fallback price for {} failed: {}", instrument, e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

struct Shard {
    index: usize,
    url: String,
    size: usize,
    prices: PriceBook,
    events: EventSink,
    reconnect: ExponentialBackoff,
    liveness: StreamLiveness,
}

impl Shard {
    /// Connect, stream until the connection ends, back off, repeat
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.stream_once() => outcome,
                _ = shutdown.changed() => break,
            };
            match outcome {
                Ok(delivered) => {
                    self.events.warn(format!("WS shard {} closed, reconnecting", self.index));
                    if delivered > 0 {
                        failures = 0;
                    }
                }
                Err(e) => self.events.error(format!("WS shard {} error: {}", self.index, e)),
            }

            failures = failures.saturating_add(1);
            tokio::select! {
                _ = sleep(self.reconnect.delay(failures)) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("WS shard {} stopped", self.index);
    }

    /// One connection lifetime. Returns the number of quotes delivered.
    async fn stream_once(&self) -> ExchangeResult<u64> {
        let mut stream = BookTickerStream::connect(&self.url, self.liveness).await?;
        self.events.info(format!("WS shard {} up ({} instruments)", self.index, self.size));

        let mut delivered = 0u64;
        while let Some(event) = stream.next_event().await? {
            match event {
                StreamEvent::Quote(instrument, mid) => {
                    self.prices
                        .publish(PriceSample::new(instrument, mid, Utc::now(), PriceSource::Stream));
                    delivered += 1;
                }
                StreamEvent::Malformed(reason) => {
                    self.events.error(format!("WS shard {} bad message: {}", self.index, reason));
                }
                StreamEvent::Closed => break,
                StreamEvent::Other => {}
            }
        }
        Ok(delivered)
    }
}
