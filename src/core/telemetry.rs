// Read-only engine snapshots and the sinks that publish them

use crate::core::events::EngineEvent;
use crate::types::{Instrument, PriceSource, Side, TradingMode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentView {
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub price: Option<f64>,
    pub price_source: Option<PriceSource>,
    pub price_age_ms: Option<i64>,
    pub unrealized_return: Option<f64>,
    pub trailing_peak: Option<f64>,
    pub cooling_down: bool,
}

impl InstrumentView {
    pub fn has_position(&self) -> bool {
        self.side != Side::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub generated_at: DateTime<Utc>,
    pub mode: TradingMode,
    pub shard_count: usize,
    pub ledger_refreshed_at: Option<DateTime<Utc>>,
    pub instruments: Vec<InstrumentView>,
    pub recent_events: Vec<EngineEvent>,
}

impl EngineSnapshot {
    /// Rows for a display of `limit` lines: open positions first, then the
    /// most recently priced instruments.
    pub fn display_rows(&self, limit: usize) -> Vec<&InstrumentView> {
        let mut rows: Vec<&InstrumentView> = self.instruments.iter().collect();
        rows.sort_by(|a, b| {
            b.has_position()
                .cmp(&a.has_position())
                .then_with(|| a.price_age_ms.unwrap_or(i64::MAX).cmp(&b.price_age_ms.unwrap_or(i64::MAX)))
                .then_with(|| a.instrument.cmp(&b.instrument))
        });
        rows.truncate(limit);
        rows
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &InstrumentView> {
        self.instruments.iter().filter(|view| view.has_position())
    }
}

pub trait TelemetrySink: Send {
    fn publish(&mut self, snapshot: &EngineSnapshot);
}

/// Latest snapshot behind a shared handle, for an embedding display
#[derive(Debug, Clone, Default)]
pub struct SharedSnapshot {
    latest: Arc<RwLock<Option<Arc<EngineSnapshot>>>>,
}

impl SharedSnapshot {
    pub fn latest(&self) -> Option<Arc<EngineSnapshot>> {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl TelemetrySink for SharedSnapshot {
    fn publish(&mut self, snapshot: &EngineSnapshot) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot.clone()));
    }
}

/// Periodic one-line summary through tracing, with per-row detail at debug level
pub struct LogSummarySink {
    interval: Duration,
    rows: usize,
    last: Option<Instant>,
}

impl LogSummarySink {
    pub fn new(interval: Duration, rows: usize) -> Self {
        Self { interval, rows, last: None }
    }
}

impl TelemetrySink for LogSummarySink {
    fn publish(&mut self, snapshot: &EngineSnapshot) {
        if self.last.map_or(false, |at| at.elapsed() < self.interval) {
            return;
        }
        self.last = Some(Instant::now());

        let priced = snapshot.instruments.iter().filter(|v| v.price.is_some()).count();
        info!(
            "📊 [{}] {} instruments ({} priced) | {} open | {} shards",
            snapshot.mode,
            snapshot.instruments.len(),
            priced,
            snapshot.open_positions().count(),
            snapshot.shard_count
        );
        for row in snapshot.display_rows(self.rows) {
            debug!(
                "   {:<14} {:<5} qty={:<12} entry={:<12} px={} age={}ms ret={}",
                row.instrument.as_str(),
                row.side.as_str(),
                row.quantity,
                row.entry_price,
                row.price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                row.price_age_ms.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
                row.unrealized_return
                    .map(|r| format!("{:+.2}%", r * 100.0))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
}

/// Writes the snapshot as JSON, replacing the file atomically.
///
/// Serialisation happens on the caller; the file write runs on the blocking pool
/// when a runtime is available.
pub struct JsonFileSink {
    path: PathBuf,
    interval: Duration,
    last: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last: None,
            pending: None,
        }
    }

    /// Wait for the write in flight, if any
    pub async fn flush(&mut self) {
        if let Some(handle) = self.pending.take() {
            if let Err(e) = handle.await {
                warn!("Snapshot writer task failed: {}", e);
            }
        }
    }
}

fn write_atomically(path: &Path, json: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

impl TelemetrySink for JsonFileSink {
    fn publish(&mut self, snapshot: &EngineSnapshot) {
        if self.last.map_or(false, |at| at.elapsed() < self.interval) {
            return;
        }
        // One write in flight at a time
        if self.pending.as_ref().map_or(false, |handle| !handle.is_finished()) {
            debug!("Previous snapshot write still running, skipping");
            return;
        }
        self.last = Some(Instant::now());

        let json = match serde_json::to_vec_pretty(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialise snapshot: {}", e);
                return;
            }
        };
        let path = self.path.clone();
        let write = move || {
            if let Err(e) = write_atomically(&path, &json) {
                warn!("Failed to write snapshot to {}: {}", path.display(), e);
            }
        };
        match Handle::try_current() {
            Ok(runtime) => self.pending = Some(runtime.spawn_blocking(write)),
            Err(_) => write(),
        }
    }
}
