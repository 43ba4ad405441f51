// Engine modules

pub mod commands;
pub mod engine;
pub mod events;
pub mod execution;
pub mod feed;
pub mod ledger;
pub mod price_book;
pub mod retry;
pub mod risk;
pub mod telemetry;

// Re-export commonly used types
pub use commands::{Command, CommandError};
pub use engine::{Engine, EngineExit, EngineParts, TickOutcome};
pub use events::{event_channel, EngineEvent, EventLevel, EventSink, EventStream};
pub use execution::{
    CloseOutcome, CloseReason, CloseReport, ExecutionCoordinator, LiveExecutor, OrderExecutor, PaperExecutor,
};
pub use feed::FeedManager;
pub use ledger::PositionLedger;
pub use price_book::PriceBook;
pub use retry::{RetryError, RetryPolicy};
pub use risk::{ExitDecision, ExitReason, ExitThresholds, RiskEvaluator};
pub use telemetry::{EngineSnapshot, SharedSnapshot, TelemetrySink};
