// Operator-facing event log
//
// Every event goes to tracing and to an unbounded channel the engine drains
// into its recent-events buffer. Producers never block.

use crate::types::Instrument;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    /// A position was closed
    Close,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
            EventLevel::Close => "CLOSE",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    pub level: EventLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}

/// Structured fields attached to execution events
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub instrument: &'a Instrument,
    pub qty: f64,
    pub reason: &'a str,
    pub order_id: Option<&'a str>,
}

impl EventSink {
    pub fn emit(&self, level: EventLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            EventLevel::Info => info!("{}", message),
            EventLevel::Warn => warn!("⚠️  {}", message),
            EventLevel::Error => error!("❌ {}", message),
            EventLevel::Close => info!("✅ {}", message),
        }
        self.push(level, message);
    }

    /// Like `emit`, with instrument, quantity, reason and order id as tracing fields
    pub fn emit_execution(&self, level: EventLevel, context: &ExecutionContext<'_>, message: impl Into<String>) {
        let message = message.into();
        let instrument = context.instrument;
        let qty = context.qty;
        let reason = context.reason;
        let order_id = context.order_id.unwrap_or("-");
        match level {
            EventLevel::Info => info!(instrument = %instrument, qty, reason, order_id, "{}", message),
            EventLevel::Warn => warn!(instrument = %instrument, qty, reason, order_id, "⚠️  {}", message),
            EventLevel::Error => error!(instrument = %instrument, qty, reason, order_id, "❌ {}", message),
            EventLevel::Close => info!(instrument = %instrument, qty, reason, order_id, "✅ {}", message),
        }
        self.push(level, message);
    }

    fn push(&self, level: EventLevel, message: String) {
        // Nobody listening once the engine has shut down
        let _ = self.tx.send(EngineEvent { level, message, at: Utc::now() });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(EventLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(EventLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(EventLevel::Error, message);
    }

    pub fn close(&self, message: impl Into<String>) {
        self.emit(EventLevel::Close, message);
    }
}

impl EventStream {
    /// Everything queued so far, oldest first
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
