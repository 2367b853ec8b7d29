//! Bot runner: main orchestration loop around the breakout engine.
//!
//! Handles:
//! - Session rollover and restoring state after a restart
//! - Freezing trigger levels once the opening range completes
//! - Polling quotes at trigger or exit-monitoring cadence
//! - Feeding dashboard control requests into the engine
//! - Persisting status for the dashboard

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{KiteClient, MarketDataSource, OrderGateway, PaperGateway};
use crate::control::WatchlistEntry;
use crate::db::{Database, OrderStats};
use crate::error::DataFetchError;
use crate::models::{Position, Quote, SymbolWatch};
use crate::trading::{
    vwap, BreakoutEngine, CycleReport, OpeningRange, SessionConfig, TradingConfig, TradingLevels,
};

/// Broker interval used for opening-range and session candles.
const CANDLE_INTERVAL: &str = "minute";

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Trading configuration
    pub trading: TradingConfig,

    /// Simulate fills locally instead of sending orders to the broker
    pub paper: bool,

    /// Fraction of price lost per paper market fill
    pub paper_slippage: Decimal,

    /// Database URL
    pub database_url: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            paper: true,
            paper_slippage: dec!(0.0005),
            database_url: "sqlite:./breakout.db?mode=rwc".to_string(),
        }
    }
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    db: Database,
    market: Arc<dyn MarketDataSource>,
    gateway: Arc<dyn OrderGateway>,
    /// Set in paper mode so quotes can trigger simulated resting stops.
    paper: Option<Arc<PaperGateway>>,
    engine: BreakoutEngine,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Create a new bot instance backed by Kite.
    pub async fn new(config: BotConfig) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let session = &config.trading.session;
        let kite = Arc::new(
            KiteClient::from_env(session.offset(), config.trading.request_timeout_secs)
                .context("Kite client not configured")?,
        );

        let (gateway, paper): (Arc<dyn OrderGateway>, _) = if config.paper {
            let paper = Arc::new(PaperGateway::new(config.paper_slippage));
            info!(slippage = %config.paper_slippage, "Paper trading: orders are simulated");
            (paper.clone() as Arc<dyn OrderGateway>, Some(paper))
        } else {
            info!("Live trading: orders go to Kite");
            (kite.clone() as Arc<dyn OrderGateway>, None)
        };

        Self::with_parts(config, db, kite, gateway, paper)
    }

    /// Assemble a bot from already-built collaborators.
    pub fn with_parts(
        config: BotConfig,
        db: Database,
        market: Arc<dyn MarketDataSource>,
        gateway: Arc<dyn OrderGateway>,
        paper: Option<Arc<PaperGateway>>,
    ) -> Result<Self> {
        let engine = BreakoutEngine::new(config.trading.clone())?;

        Ok(Self {
            config,
            db,
            market,
            gateway,
            paper,
            engine,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &BreakoutEngine {
        &self.engine
    }

    /// Initialize bot state from database or fresh start.
    pub async fn initialize(&mut self, now: DateTime<Utc>) -> Result<()> {
        info!("Initializing bot...");

        self.db.init_bot_state(self.config.paper).await?;

        // Requests are for a running loop; anything queued before this run is stale.
        for request in self.db.take_controls().await? {
            warn!(kind = request.kind(), "Discarding control request queued while the bot was stopped");
        }
        self.start_session(now).await?;

        if let Some(position) = self.db.open_position().await? {
            info!(
                symbol = %position.symbol,
                status = position.status.as_str(),
                "Resuming with a live position from the previous run"
            );
            self.engine.restore_position(position)?;
        }

        self.engine.start();
        info!(
            capital = %self.engine.capital(),
            symbols = self.config.trading.watchlist.len(),
            trades_today = self.engine.trades_today(),
            "Bot initialized"
        );

        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            paper = self.config.paper,
            trigger_poll = self.config.trading.trigger_poll_secs,
            exit_poll = self.config.trading.exit_poll_secs,
            "Starting bot run loop"
        );

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut fast = self.engine.needs_fast_poll();
        let mut ticker = interval_at(Instant::now(), self.cadence(fast));

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "Error in bot tick");
            }

            let now_fast = self.engine.needs_fast_poll();
            if now_fast != fast {
                fast = now_fast;
                let period = self.cadence(fast);
                debug!(secs = period.as_secs(), "Switching poll cadence");
                ticker = interval_at(Instant::now() + period, period);
            }
        }

        // Graceful shutdown
        self.shutdown().await?;

        Ok(())
    }

    fn cadence(&self, fast: bool) -> Duration {
        let secs = if fast {
            self.config.trading.exit_poll_secs
        } else {
            self.config.trading.trigger_poll_secs
        };
        Duration::from_secs(secs)
    }

    /// Single iteration of the main loop.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let session = self.config.trading.session.clone();

        // 1. New day: reset and rebuild today's counters
        if self.engine.session() != Some(session.local(now).date_naive()) {
            self.start_session(now).await?;
        }

        // 2. Dashboard requests
        for request in self.db.take_controls().await? {
            info!(kind = request.kind(), "Control request received");
            self.engine.enqueue(request);
        }

        // 3. Market data
        let quotes = if session.is_market_hours(now) {
            if session.range_complete(now) {
                self.freeze_pending_levels(now).await;
            }
            let quotes = self.fetch_quotes().await;
            if !self.engine.needs_fast_poll() {
                self.refresh_live_levels(now, &quotes).await;
            }
            quotes
        } else {
            debug!("Outside market hours");
            Vec::new()
        };

        if let Some(paper) = &self.paper {
            for quote in &quotes {
                paper.mark(&quote.symbol, quote.last_price).await;
            }
        }

        // 4. Decide
        let report = self
            .engine
            .run_cycle(now, &quotes, self.gateway.as_ref(), &self.db)
            .await;
        self.log_report(&report);

        if report.stopped {
            info!("Stop requested, shutting down");
            self.shutdown.store(true, Ordering::SeqCst);
        }

        // 5. Persist status
        self.db.update_bot_state(self.engine.status(), now).await?;

        Ok(report)
    }

    /// Reset the engine for the local date of `now` and restore today's trades.
    async fn start_session(&mut self, now: DateTime<Utc>) -> Result<()> {
        let session = &self.config.trading.session;
        let today = session.local(now).date_naive();

        if !self.engine.reset_session(today) {
            return Ok(());
        }

        if let Some(midnight) = local_instant(session, today, NaiveTime::MIN) {
            let trades = self.db.trades_since(midnight).await?;
            if !trades.is_empty() {
                info!(count = trades.len(), "Restored today's trades");
            }
            self.engine.restore_day(&trades);
        }

        if self.config.trading.use_broker_margin {
            match self.market.available_margin().await {
                Ok(margin) => {
                    info!(margin = %margin, "Sizing from broker margin");
                    self.engine.set_capital(margin);
                }
                Err(e) => warn!(error = %e, "Broker margin unavailable, keeping configured capital"),
            }
        }

        Ok(())
    }

    /// Freeze levels for every symbol still waiting on its opening range.
    async fn freeze_pending_levels(&mut self, now: DateTime<Utc>) {
        let session = self.config.trading.session.clone();
        let today = session.local(now).date_naive();
        let (Some(from), Some(to)) = (
            local_instant(&session, today, session.range_start),
            local_instant(&session, today, session.range_end),
        ) else {
            return;
        };

        let pending: Vec<SymbolWatch> = self
            .config
            .trading
            .watchlist
            .iter()
            .filter(|w| self.engine.needs_levels(&w.symbol))
            .cloned()
            .collect();

        for watch in pending {
            match self.market.candles(&watch, from, to, CANDLE_INTERVAL).await {
                Ok(candles) => {
                    let window: Vec<_> = candles.into_iter().filter(|c| c.timestamp < to).collect();
                    match OpeningRange::from_candles(&window) {
                        Some(range) => {
                            debug!(
                                symbol = %watch.symbol,
                                vwap = %range.vwap,
                                range_pct = %range.range_pct().round_dp(2),
                                "Opening range complete"
                            );
                            if let Err(e) = self.engine.freeze_opening_range(&watch.symbol, &range, now) {
                                warn!(symbol = %watch.symbol, error = %e, "Failed to freeze levels");
                            }
                        }
                        None => self
                            .engine
                            .note_data_failure(&watch.symbol, &DataFetchError::Missing(watch.symbol.clone())),
                    }
                }
                Err(e) => self.engine.note_data_failure(&watch.symbol, &e),
            }
        }
    }

    /// Fetch quotes for the whole watchlist concurrently.
    async fn fetch_quotes(&mut self) -> Vec<Quote> {
        let watchlist = self.config.trading.watchlist.clone();
        let market = self.market.clone();
        let results = join_all(watchlist.iter().map(|w| market.quote(w))).await;

        let mut quotes = Vec::with_capacity(results.len());
        for (watch, result) in watchlist.iter().zip(results) {
            match result {
                Ok(quote) => quotes.push(quote),
                Err(e) => self.engine.note_data_failure(&watch.symbol, &e),
            }
        }
        quotes
    }

    /// Recompute display levels from the session VWAP so far.
    async fn refresh_live_levels(&mut self, now: DateTime<Utc>, quotes: &[Quote]) {
        let session = self.config.trading.session.clone();
        let Some(from) = local_instant(&session, session.local(now).date_naive(), session.range_start)
        else {
            return;
        };

        for quote in quotes {
            let Some(watch) = self.config.trading.watch(&quote.symbol).cloned() else {
                continue;
            };
            match self.market.candles(&watch, from, now, CANDLE_INTERVAL).await {
                Ok(candles) => {
                    if let Some(reference) = vwap(&candles) {
                        self.engine.update_live_levels(&quote.symbol, reference);
                    }
                }
                Err(e) => debug!(symbol = %quote.symbol, error = %e, "Live levels not refreshed"),
            }
        }
    }

    fn log_report(&self, report: &CycleReport) {
        if report.is_quiet() {
            debug!(status = %self.engine.status(), "Cycle complete");
            return;
        }
        for symbol in &report.entries {
            info!(symbol = %symbol, "Entry submitted");
        }
        for symbol in &report.skipped {
            info!(symbol = %symbol, "Breakout skipped: quantity rounds to zero");
        }
        for reason in &report.rejected {
            warn!(reason = %reason, "Rejected this cycle");
        }
        for trade in &report.closed {
            info!(
                symbol = %trade.symbol,
                side = %trade.side,
                pnl = %trade.pnl.round_dp(2),
                reason = %trade.exit_reason,
                "Trade closed"
            );
        }
        if report.failures > 0 {
            warn!(failures = report.failures, "Broker or data calls failed this cycle");
        }
    }

    /// Graceful shutdown.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down bot...");

        self.engine.stop(self.gateway.as_ref(), &self.db).await;
        if let Some(paper) = &self.paper {
            info!(open_orders = paper.open_orders().await, "Paper book at shutdown");
        }
        if let Some(position) = self.engine.position() {
            warn!(
                symbol = %position.symbol,
                status = position.status.as_str(),
                protected = position.is_protected(),
                "Leaving live position in place"
            );
        }

        // Final state save
        self.db.update_bot_state(self.engine.status(), Utc::now()).await?;
        self.db.mark_bot_stopped().await?;

        info!("Bot shutdown complete");
        Ok(())
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> BotStats {
        let orders = self.db.order_stats().await.unwrap_or_default();
        let position = self.engine.position().cloned();
        let unrealized_pnl = position
            .as_ref()
            .and_then(|p| self.engine.last_price(&p.symbol).map(|price| p.unrealized_pnl(price)));

        BotStats {
            status: self.engine.status().to_string(),
            capital: self.engine.capital(),
            trades_today: self.engine.trades_today(),
            realized_pnl: self.engine.realized_pnl(),
            position,
            unrealized_pnl,
            orders,
            is_running: !self.shutdown.load(Ordering::SeqCst),
            paper: self.config.paper,
        }
    }
}

/// Current quotes and levels for every watched symbol.
///
/// Levels come from the opening range once it is complete, otherwise from
/// the session VWAP so far. Symbols whose data cannot be fetched are left out.
pub async fn watchlist_snapshot(
    market: &dyn MarketDataSource,
    config: &TradingConfig,
    now: DateTime<Utc>,
) -> Vec<WatchlistEntry> {
    let session = &config.session;
    let today = session.local(now).date_naive();
    let from = local_instant(session, today, session.range_start);
    let to = if session.range_complete(now) {
        local_instant(session, today, session.range_end)
    } else {
        Some(now)
    };

    let mut entries = Vec::with_capacity(config.watchlist.len());
    for watch in &config.watchlist {
        let quote = match market.quote(watch).await {
            Ok(q) => q,
            Err(e) => {
                warn!(symbol = %watch.symbol, error = %e, "Quote unavailable");
                continue;
            }
        };

        let levels = match (from, to) {
            (Some(from), Some(to)) if session.is_market_hours(now) => market
                .candles(watch, from, to, CANDLE_INTERVAL)
                .await
                .ok()
                .and_then(|candles| vwap(&candles))
                .map(|reference| TradingLevels::compute(reference, config.buffer)),
            _ => None,
        };

        entries.push(WatchlistEntry {
            symbol: watch.symbol.clone(),
            exchange: watch.exchange.clone(),
            last_price: quote.last_price,
            ohlc: quote.ohlc,
            levels,
        });
    }
    entries
}

/// `date` at exchange-local `time`, in UTC.
pub fn local_instant(session: &SessionConfig, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    session
        .offset()
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|t| t.with_timezone(&Utc))
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub status: String,
    pub capital: Decimal,
    pub trades_today: u32,
    pub realized_pnl: Decimal,
    pub position: Option<Position>,
    pub unrealized_pnl: Option<Decimal>,
    pub orders: OrderStats,
    pub is_running: bool,
    pub paper: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Status:          {}", self.status)?;
        writeln!(f, "Capital:         ₹{:.2}", self.capital)?;
        writeln!(f, "Trades Today:    {}", self.trades_today)?;
        writeln!(f, "Realized P&L:    ₹{:.2}", self.realized_pnl)?;
        match &self.position {
            Some(p) => writeln!(
                f,
                "Position:        {} {} x{} @ ₹{:.2} (SL ₹{:.2}, TGT ₹{:.2}) {}",
                p.side,
                p.symbol,
                p.quantity,
                p.entry_price,
                p.stop_loss_price,
                p.target_price,
                p.status.as_str()
            )?,
            None => writeln!(f, "Position:        none")?,
        }
        if let Some(pnl) = self.unrealized_pnl {
            writeln!(f, "Unrealized P&L:  ₹{:.2}", pnl)?;
        }
        writeln!(
            f,
            "Orders:          {} (Filled: {}, Rejected: {}, Pending: {})",
            self.orders.total, self.orders.filled, self.orders.rejected, self.orders.pending
        )?;
        writeln!(
            f,
            "Running:         {} {}",
            if self.is_running { "Running" } else { "Stopped" },
            if self.paper { "(Paper)" } else { "" }
        )?;
        Ok(())
    }
}
