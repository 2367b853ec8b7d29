//! Intraday VWAP Breakout Bot
//!
//! Freezes trigger levels from the opening-range VWAP, enters the first
//! breakout on the watchlist, and manages one position at a time with a
//! fixed stop-loss and a risk/reward target over Kite Connect.

mod api;
mod bot;
mod control;
mod db;
mod error;
mod models;
mod trading;

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{NaiveTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::KiteClient;
use crate::bot::{local_instant, watchlist_snapshot, Bot, BotConfig};
use crate::control::{BotStatus, ControlRequest, StatusView};
use crate::db::Database;
use crate::models::Side;
use crate::trading::{PositionSizer, TradingConfig};

/// Intraday breakout bot CLI.
#[derive(Parser)]
#[command(name = "breakout")]
#[command(about = "Trade intraday VWAP breakouts on NSE through Kite Connect", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./breakout.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON trading configuration (defaults apply to missing fields)
    #[arg(short, long, env = "BREAKOUT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Simulate fills locally instead of sending orders to Kite
        #[arg(long)]
        paper: bool,

        /// Simulated slippage percentage per paper fill (0-100)
        #[arg(long, default_value = "0.05")]
        slippage: f64,
    },

    /// Show bot status, current position and today's P&L
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show quotes and trigger levels for the watchlist
    Watchlist {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recent completed trades
    Trades {
        /// Number of trades to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show the latest known state of a submitted order
    Order {
        /// Broker order ID
        order_id: String,
    },

    /// Ask the running bot to close a position at market
    Exit {
        /// Symbol of the live position
        symbol: String,
    },

    /// Ask the running bot to open a discretionary position
    Trade {
        /// Watchlist symbol
        symbol: String,

        /// LONG or SHORT (BUY/SELL accepted)
        side: String,
    },

    /// Ask the running bot to stop
    Stop,

    /// Show current configuration
    Config,
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

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run { paper, slippage } => {
            info!(paper = paper, "Starting breakout bot");

            let bot_config = BotConfig {
                trading: config.clone(),
                paper,
                paper_slippage: Decimal::try_from(slippage / 100.0)?,
                database_url: cli.database.clone(),
            };

            let mut bot = Bot::new(bot_config).await?;
            bot.initialize(Utc::now()).await?;

            println!("\n=== Intraday Breakout Bot ===");
            println!("Capital:    ₹{}", bot.engine().capital());
            println!("Watchlist:  {}", symbols(&config));
            println!("Mode:       {}", if paper { "PAPER (simulated fills)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Status { json } => {
            let db = Database::new(&cli.database).await?;
            let bot_state = match db.get_bot_state().await {
                Ok(state) => state,
                Err(_) => {
                    println!("No bot session found. Run 'breakout run' to start the bot.");
                    return Ok(());
                }
            };

            let now = Utc::now();
            let session = &config.session;
            let today = session.local(now).date_naive();
            let trades = match local_instant(session, today, NaiveTime::MIN) {
                Some(midnight) => db.trades_since(midnight).await?,
                None => Vec::new(),
            };
            let view = StatusView {
                status: BotStatus::parse(&bot_state.status).unwrap_or(BotStatus::Idle),
                current_position: db.open_position().await?,
                trades_today: trades.len() as u32,
                realized_pnl_today: trades.iter().map(|t| t.pnl).sum(),
                updated_at: now,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }

            let orders = db.order_stats().await?;

            println!("\n=== Bot Status ===");
            println!("Status:           {}", view.status);
            println!("Running:          {}", if bot_state.is_running { "Yes" } else { "No" });
            println!("Mode:             {}", if bot_state.paper { "Paper" } else { "Live" });
            println!("Started:          {}", bot_state.started_at);
            println!(
                "Last Cycle:       {}",
                bot_state.last_cycle_at.unwrap_or_else(|| "Never".to_string())
            );

            println!("\n=== Today ===");
            println!("Trades:           {}", view.trades_today);
            println!("Realized P&L:     ₹{:.2}", view.realized_pnl_today);
            println!(
                "Orders:           {} (Filled: {}, Rejected: {}, Pending: {})",
                orders.total, orders.filled, orders.rejected, orders.pending
            );

            match &view.current_position {
                Some(pos) => {
                    println!("\n=== Position ===");
                    println!("  {} {} x{} ({})", pos.side, pos.symbol, pos.quantity, pos.status.as_str());
                    println!("  Entry:     ₹{:.2}", pos.entry_price);
                    println!("  Stop-loss: ₹{:.2}", pos.stop_loss_price);
                    println!("  Target:    ₹{:.2}", pos.target_price);
                    println!(
                        "  Protected: {}",
                        if pos.is_protected() { "Yes" } else { "NO - stop-loss order missing" }
                    );
                }
                None => println!("\nNo open position."),
            }
        }

        Commands::Watchlist { json } => {
            let kite = KiteClient::from_env(config.session.offset(), config.request_timeout_secs)?;
            let entries = watchlist_snapshot(&kite, &config, Utc::now()).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            println!(
                "\n{:<12} {:>10} {:>10} {:>10} {:>10} {:>10}",
                "SYMBOL", "LTP", "HIGH", "LOW", "BUY >", "SELL <"
            );
            println!("{}", "-".repeat(67));
            for entry in entries {
                let (buy, sell) = entry
                    .levels
                    .map(|l| (format!("{:.2}", l.buy_trigger), format!("{:.2}", l.sell_trigger)))
                    .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
                println!(
                    "{:<12} {:>10.2} {:>10.2} {:>10.2} {:>10} {:>10}",
                    entry.symbol, entry.last_price, entry.ohlc.high, entry.ohlc.low, buy, sell
                );
            }
        }

        Commands::Trades { limit } => {
            let db = Database::new(&cli.database).await?;
            let trades = db.recent_trades(limit).await?;

            if trades.is_empty() {
                println!("No completed trades yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<12} {:<6} {:>6} {:>10} {:>10} {:>10} {:<16}",
                "CLOSED", "SYMBOL", "SIDE", "QTY", "ENTRY", "EXIT", "P&L", "REASON"
            );
            println!("{}", "-".repeat(98));
            for t in trades {
                println!(
                    "{:<20} {:<12} {:<6} {:>6} {:>10.2} {:>10.2} {:>10.2} {:<16}",
                    config.session.local(t.closed_at).format("%Y-%m-%d %H:%M"),
                    t.symbol,
                    t.side,
                    t.quantity,
                    t.entry_price,
                    t.exit_price,
                    t.pnl,
                    t.exit_reason
                );
            }
        }

        Commands::Order { order_id } => {
            let db = Database::new(&cli.database).await?;
            let Some(order) = db.get_order(&order_id).await? else {
                bail!("order {} not found", order_id);
            };

            println!("\n=== Order {} ===", order.order_id);
            println!("Kind:        {}", order.kind);
            println!(
                "Instrument:  {}:{} ({} {})",
                order.exchange, order.symbol, order.transaction_type, order.side
            );
            println!("Quantity:    {} @ ₹{}", order.quantity, order.price);
            println!("Status:      {}", order.status);
            if let Some(filled) = order.filled_quantity {
                println!(
                    "Filled:      {} @ ₹{}",
                    filled,
                    order.average_price.as_deref().unwrap_or("-")
                );
            }
            if let Some(message) = &order.message {
                println!("Message:     {}", message);
            }
            println!("Correlation: {}", order.correlation_id);
            println!("Updated:     {}", order.updated_at);
        }

        Commands::Exit { symbol } => {
            let symbol = symbol.to_uppercase();
            if config.watch(&symbol).is_none() {
                bail!("{} is not on the watchlist", symbol);
            }
            let db = Database::new(&cli.database).await?;
            let id = db.enqueue_control(&ControlRequest::ManualExit { symbol: symbol.clone() }).await?;
            println!("Exit requested for {} (request #{})", symbol, id);
        }

        Commands::Trade { symbol, side } => {
            let symbol = symbol.to_uppercase();
            if config.watch(&symbol).is_none() {
                bail!("{} is not on the watchlist", symbol);
            }
            let Some(side) = Side::parse(&side) else {
                bail!("side must be LONG or SHORT, got {}", side);
            };
            let db = Database::new(&cli.database).await?;
            let id = db
                .enqueue_control(&ControlRequest::ManualTrade { symbol: symbol.clone(), side })
                .await?;
            println!("{} {} requested (request #{})", side, symbol, id);
        }

        Commands::Stop => {
            let db = Database::new(&cli.database).await?;
            let id = db.enqueue_control(&ControlRequest::Stop).await?;
            println!("Stop requested (request #{}). Open positions keep their stop-loss.", id);
        }

        Commands::Config => {
            let sizer = PositionSizer::new(&config);
            let session = &config.session;

            println!("\n=== Trading Configuration ===\n");
            println!("Capital:");
            println!("  Capital:              ₹{}", config.capital);
            println!("  Use Broker Margin:    {}", config.use_broker_margin);
            println!("  Margin Utilization:   {}%", config.margin_utilization * Decimal::ONE_HUNDRED);
            println!("  Leverage:             {}x", config.leverage);
            println!("  Leverage In Sizing:   {}", config.use_leverage_in_sizing);
            println!("  Buying Power:         ₹{}", config.buying_power());

            println!("\nLevels & Exits:");
            println!("  Buffer:               {:?}", config.buffer);
            println!("  Risk Unit:            ₹{}", config.position_risk_unit);
            println!("  Stop Multiplier:      {}", config.stop_multiplier);
            println!("  Target:               {}", config.target);
            println!("  Limit Orders:         {} (buffer ₹{})", config.use_limit_orders, config.limit_order_buffer);

            println!("\nSession (UTC{:+}min):", session.utc_offset_minutes);
            println!("  Opening Range:        {} - {}", session.range_start, session.range_end);
            println!(
                "  Entry Cutoff:         {}",
                session.entry_cutoff.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string())
            );
            println!("  Square-off:           {}", session.square_off);
            println!("  Market Close:         {}", session.market_close);

            println!("\nLimits:");
            println!("  Max Trades/Day:       {}", limit_str(config.max_trades_per_day));
            println!("  Max Trades/Symbol:    {}", limit_str(config.max_trades_per_symbol));
            println!(
                "  Daily Loss Limit:     {}",
                config
                    .daily_loss_limit_pct
                    .map(|p| format!("{}%", p * Decimal::ONE_HUNDRED))
                    .unwrap_or_else(|| "none".to_string())
            );
            println!("  Max Failed Cycles:    {}", config.max_consecutive_failures);

            println!("\nPolling:");
            println!("  Trigger Poll:         {}s", config.trigger_poll_secs);
            println!("  Exit Poll:            {}s", config.exit_poll_secs);
            println!("  Entry Order Timeout:  {}s", config.entry_order_timeout_secs);

            println!("\nWatchlist ({}):", config.watchlist.len());
            println!("  {}", symbols(&config));

            let example = sizer.size(config.capital, Decimal::ONE_HUNDRED);
            println!(
                "\nExample: a ₹100 entry sizes to {} shares (margin ₹{})",
                example.quantity().unwrap_or(0),
                sizer.margin_required(example.quantity().unwrap_or(0), Decimal::ONE_HUNDRED)
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<TradingConfig> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            TradingConfig::load(path)?
        }
        None => {
            let config = TradingConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn symbols(config: &TradingConfig) -> String {
    config
        .watchlist
        .iter()
        .map(|w| w.instrument_key())
        .collect::<Vec<_>>()
        .join(", ")
}

fn limit_str(limit: Option<u32>) -> String {
    limit.map(|l| l.to_string()).unwrap_or_else(|| "unlimited".to_string())
}
