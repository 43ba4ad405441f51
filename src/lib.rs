// Futures Execution Engine Library
//
// Watches open futures positions against streamed prices and closes them with
// reduce-only market orders on stop-loss, take-profit, trailing stop or operator command

pub mod clients;
pub mod config;
pub mod core;
pub mod error;
pub mod startup;
pub mod types;
pub mod universe;

// Re-export core engine types
pub use self::core::{
    CloseOutcome, CloseReason, Command, Engine, EngineExit, ExecutionCoordinator, ExitReason, ExitThresholds,
    PositionLedger, PriceBook, RiskEvaluator,
};

// Re-export error types
pub use error::{ExchangeError, ExchangeResult};

// Re-export client types
pub use clients::{BinanceRestClient, ExchangeApi};

// Re-export configuration
pub use config::{ConfigError, Credentials, EngineConfig};

// Re-export domain types
pub use types::{Instrument, InstrumentRules, OrderResult, OrderSide, Position, PriceSample, Side, TradingMode};

pub use universe::{resolve_instruments, UniverseError};
