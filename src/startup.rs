// Wiring: builds every component from config and runs the engine to completion

use crate::clients::{BinanceRestClient, ExchangeApi};
use crate::config::{Credentials, EngineConfig};
use crate::core::commands::spawn_command_reader;
use crate::core::engine::{Engine, EngineExit, EngineParts};
use crate::core::events::{event_channel, EventSink};
use crate::core::execution::{executor_for, ExecutionCoordinator};
use crate::core::feed::FeedManager;
use crate::core::ledger::PositionLedger;
use crate::core::price_book::PriceBook;
use crate::core::risk::RiskEvaluator;
use crate::core::telemetry::{JsonFileSink, LogSummarySink, SharedSnapshot};
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{Instrument, TradingMode};
use crate::universe::UniverseError;
use futures_util::future::join_all;
use std::future::Future;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info, warn};

const SHARD_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Process exit code when no trackable instrument could be resolved
pub const EXIT_NO_INSTRUMENTS: u8 = 2;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Universe(#[from] UniverseError),

    #[error("exchange client setup failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("failed to start command reader: {0}")]
    Io(#[from] io::Error),
}

impl StartupError {
    /// Only an empty universe fails the process; other startup errors are logged and exit cleanly
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Universe(_) => EXIT_NO_INSTRUMENTS,
            StartupError::Exchange(_) | StartupError::Io(_) => 0,
        }
    }
}

/// Mode the engine will actually run in.
///
/// Real mode needs credentials the exchange accepts; anything else degrades to
/// paper. A mode check that fails for non-auth reasons keeps real mode.
pub async fn select_trading_mode(
    requested: TradingMode,
    client: &BinanceRestClient,
    events: &EventSink,
) -> TradingMode {
    if requested == TradingMode::Paper {
        return TradingMode::Paper;
    }
    if !client.has_credentials() {
        events.warn("real mode requested without API credentials, running in PAPER mode");
        return TradingMode::Paper;
    }
    match client.detect_position_mode().await {
        Ok(_) => TradingMode::Real,
        Err(ExchangeError::Auth(reason)) => {
            events.warn(format!("API credentials rejected ({}), running in PAPER mode", reason));
            TradingMode::Paper
        }
        Err(e) => {
            events.warn(format!("position mode check failed ({}), assuming one-way", e));
            TradingMode::Real
        }
    }
}

pub fn build_client(config: &EngineConfig) -> ExchangeResult<BinanceRestClient> {
    BinanceRestClient::new(
        &config.exchange,
        Credentials::resolve(&config.exchange),
        config.execution.rules_ttl(),
    )
}

/// Start feeds, the command reader and the engine loop; return once the
/// engine stops. Feed tasks are signalled and given a short grace period.
pub async fn run<S>(
    config: EngineConfig,
    instruments: Vec<Instrument>,
    requested: TradingMode,
    snapshot: SharedSnapshot,
    shutdown: S,
) -> Result<EngineExit, StartupError>
where
    S: Future<Output = ()>,
{
    let (events, event_stream) = event_channel();

    let client = Arc::new(build_client(&config)?);
    if let Err(e) = client.sync_time().await {
        events.warn(format!("server time sync failed: {}", e));
    }
    let mode = select_trading_mode(requested, &client, &events).await;
    let api: Arc<dyn ExchangeApi> = client;

    let ledger = Arc::new(PositionLedger::new(Arc::clone(&api), instruments.clone(), events.clone()));
    ledger.refresh().await;

    let evaluator = Arc::new(RiskEvaluator::new(config.risk.thresholds()));
    let executor = executor_for(mode, Arc::clone(&api), &config.execution, events.clone());
    let coordinator = Arc::new(ExecutionCoordinator::new(
        Arc::clone(&ledger),
        executor,
        Arc::clone(&evaluator),
        config.execution.cooldown(),
        events.clone(),
    ));

    let feed = FeedManager::new(
        Arc::clone(&api),
        instruments.clone(),
        &config.feed,
        &config.exchange.ws_url,
        PriceBook::new(),
        events.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shard_tasks = feed.spawn_shards(shutdown_rx);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    spawn_command_reader(BufReader::new(io::stdin()), command_tx, events.clone())?;

    let thresholds = evaluator.thresholds();
    info!(
        "🚀 Engine starting: mode={} instruments={} shards={} sl={:?} tp={:?} trailing={:?}",
        mode,
        instruments.len(),
        shard_tasks.len(),
        thresholds.stop_loss,
        thresholds.take_profit,
        thresholds.trailing
    );
    if thresholds.is_empty() {
        events.info("no exit thresholds set; only operator commands will close positions");
    }
    events.info("commands: close <SYMBOL> | closeall | panic | quit");

    let mut engine = Engine::new(
        EngineParts {
            feed,
            ledger,
            evaluator,
            coordinator,
            commands: command_rx,
            events: events.clone(),
            event_stream,
        },
        &config.engine,
        &config.telemetry,
    );
    engine.add_sink(Box::new(snapshot));
    engine.add_sink(Box::new(LogSummarySink::new(
        Duration::from_secs(config.telemetry.summary_interval_secs),
        config.telemetry.ui_rows,
    )));
    if let Some(path) = &config.telemetry.snapshot_path {
        engine.add_sink(Box::new(JsonFileSink::new(
            path,
            Duration::from_millis(config.telemetry.snapshot_interval_ms),
        )));
    }

    let exit = engine.run(shutdown).await;

    let _ = shutdown_tx.send(true);
    if timeout(SHARD_SHUTDOWN_GRACE, join_all(shard_tasks)).await.is_err() {
        warn!("Feed shards did not stop within {:?}", SHARD_SHUTDOWN_GRACE);
    }
    info!("👋 Engine stopped ({:?})", exit);
    Ok(exit)
}
