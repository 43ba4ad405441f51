// Futures execution engine: watches positions and closes them on exit rules or operator command

use clap::Parser;
use futures_exec_engine::config::{EngineConfig, MIN_UI_ROWS};
use futures_exec_engine::core::telemetry::SharedSnapshot;
use futures_exec_engine::startup::{self, StartupError};
use futures_exec_engine::types::TradingMode;
use futures_exec_engine::universe::resolve_instruments;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "exec-engine")]
#[command(about = "Futures position execution engine")]
struct Cli {
    /// SQLite price store used to discover instruments
    #[arg(long)]
    db: Option<PathBuf>,

    /// Instrument list file, one symbol per line (overrides discovery)
    #[arg(long)]
    symbols_file: Option<PathBuf>,

    /// Trading mode
    #[arg(long, value_enum, default_value_t = TradingMode::Paper)]
    mode: TradingMode,

    /// Stop-loss as a fraction of entry (0.02 = 2%)
    #[arg(long)]
    sl_pct: Option<f64>,

    /// Take-profit as a fraction of entry
    #[arg(long)]
    tp_pct: Option<f64>,

    /// Trailing retracement from the peak as a fraction
    #[arg(long)]
    trailing_pct: Option<f64>,

    /// Rows shown in the position summary
    #[arg(long)]
    ui_rows: Option<usize>,

    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Some(sl) = self.sl_pct {
            config.risk.stop_loss_pct = sl.max(0.0);
        }
        if let Some(tp) = self.tp_pct {
            config.risk.take_profit_pct = tp.max(0.0);
        }
        if let Some(trailing) = self.trailing_pct {
            config.risk.trailing_pct = trailing.max(0.0);
        }
        if let Some(rows) = self.ui_rows {
            config.telemetry.ui_rows = rows.max(MIN_UI_ROWS);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match EngineConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            warn!("⚠️  {}; continuing with defaults", e);
            EngineConfig::default()
        }
    };
    cli.apply_overrides(&mut config);

    let instruments = match resolve_instruments(cli.symbols_file.as_deref(), cli.db.as_deref()) {
        Ok(instruments) => instruments,
        Err(e) => {
            let e = StartupError::from(e);
            error!("❌ {}", e);
            return ExitCode::from(e.exit_code());
        }
    };
    info!("📊 Tracking {} instruments", instruments.len());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match startup::run(config, instruments, cli.mode, SharedSnapshot::default(), shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
