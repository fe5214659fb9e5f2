//! Momentum Perp Trader
//!
//! Trades one Hyperliquid perpetual on EMA crossover momentum, with every
//! order passed through a risk gate and a rate-limited executor.

mod api;
mod engine;
mod error;
mod metrics;
mod models;
mod trading;

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{HyperliquidClient, MarketDataSource, PaperConfig, PaperExchange, RateLimiter};
use crate::engine::{ControlEvent, TradingEngine};
use crate::metrics::JsonLinesSink;
use crate::trading::order_utils::spread_metrics;
use crate::trading::{OrderStyle, TradingConfig};

/// Momentum trader CLI.
#[derive(Parser)]
#[command(name = "momentum-perp")]
#[command(about = "Momentum trading engine for a single Hyperliquid perpetual", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "HL_LOG_LEVEL")]
    log_level: String,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides applied on top of the default configuration.
#[derive(Args)]
struct Settings {
    /// Instrument symbol
    #[arg(short, long, global = true, env = "HL_ASSET")]
    asset: Option<String>,

    /// Use mainnet market data instead of testnet
    #[arg(long, global = true, env = "HL_MAINNET")]
    mainnet: bool,

    /// Maximum absolute position in base units
    #[arg(long, global = true, env = "HL_MAX_POSITION")]
    max_position: Option<Decimal>,

    /// Largest single order in base units
    #[arg(long, global = true, env = "HL_BASE_POSITION")]
    base_position: Option<Decimal>,

    #[arg(long, global = true, env = "HL_LEVERAGE")]
    leverage: Option<u32>,

    /// Minimum spread as a fraction of mid
    #[arg(long, global = true, env = "HL_MIN_SPREAD")]
    min_spread: Option<Decimal>,

    /// Daily realized loss limit in USD
    #[arg(long, global = true, env = "HL_MAX_DAILY_LOSS")]
    max_daily_loss: Option<Decimal>,

    /// Seconds between cycles
    #[arg(long, global = true, env = "HL_CYCLE_INTERVAL")]
    interval: Option<u64>,

    /// Rate limiter bucket size in weight units
    #[arg(long, global = true, env = "HL_RATE_CAPACITY")]
    rate_capacity: Option<f64>,

    /// Rate limiter refill in weight units per second
    #[arg(long, global = true, env = "HL_RATE_REFILL")]
    rate_refill: Option<f64>,

    /// Rest post-only limit orders at the touch instead of crossing
    #[arg(long, global = true, env = "HL_POST_ONLY")]
    post_only: bool,

    /// Rest good-til-cancelled limit orders at the touch
    #[arg(long, global = true, env = "HL_LIMIT_ORDERS", conflicts_with = "post_only")]
    limit_orders: bool,
}

impl Settings {
    fn apply(&self, mut config: TradingConfig) -> TradingConfig {
        if let Some(asset) = &self.asset {
            config.asset = asset.to_uppercase();
        }
        if self.mainnet {
            config.testnet = false;
        }
        if let Some(v) = self.max_position {
            config.risk.max_position = v;
        }
        if let Some(v) = self.base_position {
            config.base_position = v;
        }
        if let Some(v) = self.leverage {
            config.leverage = v;
        }
        if let Some(v) = self.min_spread {
            config.risk.min_spread = v;
        }
        if let Some(v) = self.max_daily_loss {
            config.risk.max_daily_loss = v;
        }
        if let Some(secs) = self.interval {
            config.engine.cycle_interval_ms = secs * 1_000;
        }
        if let Some(v) = self.rate_capacity {
            config.rate_limit.capacity = v;
        }
        if let Some(v) = self.rate_refill {
            config.rate_limit.refill_per_sec = v;
        }
        if self.post_only {
            config.execution.order_style = OrderStyle::PostOnly;
        } else if self.limit_orders {
            config.execution.order_style = OrderStyle::Limit;
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against live market data with a paper account
    Run {
        /// Paper account equity in USD
        #[arg(short, long, default_value = "10000")]
        equity: Decimal,

        /// Append cycle records as JSON lines to this file
        #[arg(long, env = "HL_RECORDS")]
        records: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config,

    /// Fetch and print one market snapshot
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.settings.apply(TradingConfig::default());
    config.validate().context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit, shutdown.clone()));
    let market = Arc::new(HyperliquidClient::new(
        config.testnet,
        limiter.clone(),
        config.rate_limit.info_weight,
        config.engine.market_data_max_age(),
    )?);

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Snapshot => {
            let state = market.current_state(&config.asset).await?;

            println!("\n=== {} ({}) ===", state.instrument, market.info_url());
            println!("Best Bid:     ${}", state.best_bid);
            println!("Best Ask:     ${}", state.best_ask);
            println!("Mid:          ${}", state.mid_price);
            let spread = spread_metrics(&state);
            println!("Spread:       {:.4}% ({:.2} bps)", spread.spread_pct * Decimal::ONE_HUNDRED, spread.spread_bps);
            println!("Volume (1m):  {}", state.recent_volume);
            println!("Age:          {}ms", state.age(Utc::now()).num_milliseconds());
            println!("Tradeable:    {}", state.is_tradeable());
        }

        Commands::Run { equity, records } => {
            let paper = PaperConfig {
                initial_equity: equity,
                leverage: config.leverage,
            };
            let exchange = Arc::new(PaperExchange::new(paper, market.clone(), &config.asset));

            let (control_tx, control_rx) = mpsc::channel(16);
            spawn_day_boundary(control_tx.clone(), shutdown.clone());
            #[cfg(unix)]
            spawn_cancel_all_signal(control_tx)?;

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                signal_token.cancel();
            });

            println!("\n=== Momentum Perp Trader ===");
            println!("Instrument:    {}", config.asset);
            println!("Network:       {}", if config.testnet { "testnet" } else { "mainnet" });
            println!("Max Position:  {}", config.risk.max_position);
            println!("Order Size:    {}", config.base_position);
            println!("Cycle:         {}s", config.engine.cycle_interval_ms / 1_000);
            println!("Paper Equity:  ${}", equity);
            println!("\nPress Ctrl+C to stop\n");

            let mut engine = TradingEngine::new(config, market, exchange, limiter.clone(), shutdown)?
                .with_control(control_rx);
            if let Some(path) = records {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("cannot open record file {}", path.display()))?;
                info!(path = %path.display(), "Writing cycle records");
                engine = engine.with_sink(Box::new(JsonLinesSink::new(BufWriter::new(file))));
            }

            let summary = engine.run().await?;
            println!("\n{}", summary);

            let status = limiter.status();
            println!("=== Rate Limiter ===");
            println!("Granted Weight:  {}", status.granted_weight);
            println!("Available:       {:.1} / {}", status.available_tokens, status.capacity);
            println!("429 Responses:   {}", status.violations);
            if let Some(cooldown) = status.cooldown_remaining {
                println!("Cooldown:        {:?}", cooldown);
            }
        }
    }

    Ok(())
}

/// Send `CancelAll` whenever the process receives SIGUSR1.
#[cfg(unix)]
fn spawn_cancel_all_signal(tx: mpsc::Sender<ControlEvent>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1()).context("cannot install SIGUSR1 handler")?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("SIGUSR1 received, requesting cancel-all");
            if tx.send(ControlEvent::CancelAll).await.is_err() {
                return;
            }
        }
    });
    Ok(())
}

/// Send a `DayBoundary` event at every UTC midnight.
fn spawn_day_boundary(tx: mpsc::Sender<ControlEvent>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = now
                .date_naive()
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc());
            let Some(next) = next else {
                warn!("Could not compute next trading day, day boundary task exiting");
                return;
            };
            let wait = (next - now)
                .max(ChronoDuration::zero())
                .to_std()
                .unwrap_or_default();

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            if tx.send(ControlEvent::DayBoundary(next.date_naive())).await.is_err() {
                return;
            }
        }
    });
}
