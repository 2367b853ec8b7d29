//! Breakout decision engine.
//!
//! A single position slot is shared by every watched symbol. Each call to
//! [`BreakoutEngine::run_cycle`] is one evaluation cycle and runs to
//! completion before the next one starts:
//!
//! 1. queued control requests are applied,
//! 2. the in-flight order (entry or exit) is resolved against the gateway,
//! 3. the open position is managed (broker stop fills, stop-loss coverage,
//!    square-off, target/stop checks),
//! 4. with an empty slot, the watchlist is scanned in configured order and the
//!    first eligible breakout is entered.
//!
//! A failed broker call never produces a partial transition: the engine keeps
//! its prior state and the next cycle tries again.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::TradingConfig;
use super::levels::{LevelBook, OpeningRange, TradingLevels};
use super::position_sizer::{PositionSizer, Sizing};
use super::strategy::{check_exit, ExitReason, ExitRules};
use crate::api::OrderGateway;
use crate::control::{BotStatus, ControlRequest};
use crate::db::TradeJournal;
use crate::error::{ConfigError, DataFetchError, EngineError, GatewayError};
use crate::models::{
    OrderIntent, OrderState, OrderTicket, OrderUpdate, Position, PositionStatus, Quote, Side,
    SymbolWatch, TradeRecord,
};

/// Per-symbol lifecycle within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolPhase {
    /// No levels yet.
    Idle,
    /// Levels frozen, waiting for a breakout.
    Watching,
    EntryPlaced,
    Open,
    Exiting,
    /// Traded this session. Watches again once price is back inside the band.
    Closed,
}

/// What happened during one evaluation cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Gateway order IDs submitted this cycle.
    pub submitted: Vec<String>,
    /// Symbols with an entry order submitted.
    pub entries: Vec<String>,
    /// Breakouts skipped because the quantity rounded to zero.
    pub skipped: Vec<String>,
    /// Orders or requests declined this cycle.
    pub rejected: Vec<String>,
    pub closed: Vec<TradeRecord>,
    /// Failed broker or data calls.
    pub failures: u32,
    /// A stop request was applied.
    pub stopped: bool,
}

impl CycleReport {
    pub fn is_quiet(&self) -> bool {
        self.submitted.is_empty()
            && self.skipped.is_empty()
            && self.rejected.is_empty()
            && self.closed.is_empty()
            && self.failures == 0
    }
}

/// The breakout decision engine.
pub struct BreakoutEngine {
    config: TradingConfig,
    sizer: PositionSizer,
    rules: ExitRules,
    levels: LevelBook,
    phases: HashMap<String, SymbolPhase>,
    /// Symbols that must see price back inside their band before trading again.
    disarmed: HashSet<String>,
    /// Symbols sitting out the session because their opening range was out of band.
    range_skipped: HashSet<String>,
    slot: Option<Position>,
    controls: VecDeque<ControlRequest>,
    last_prices: HashMap<String, Decimal>,
    capital: Decimal,
    session: Option<NaiveDate>,
    /// Date of a rollover refused while a position was live.
    deferred_session: Option<NaiveDate>,
    trades_today: u32,
    trades_by_symbol: HashMap<String, u32>,
    realized_pnl: Decimal,
    consecutive_failures: u32,
    pending_failures: u32,
    running: bool,
}

impl BreakoutEngine {
    pub fn new(config: TradingConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let phases = config
            .watchlist
            .iter()
            .map(|w| (w.symbol.clone(), SymbolPhase::Idle))
            .collect();

        Ok(Self {
            sizer: PositionSizer::new(&config),
            rules: ExitRules::from_config(&config),
            levels: LevelBook::new(),
            phases,
            disarmed: HashSet::new(),
            range_skipped: HashSet::new(),
            slot: None,
            controls: VecDeque::new(),
            last_prices: HashMap::new(),
            capital: config.capital,
            session: None,
            deferred_session: None,
            trades_today: 0,
            trades_by_symbol: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            consecutive_failures: 0,
            pending_failures: 0,
            running: false,
            config,
        })
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn position(&self) -> Option<&Position> {
        self.slot.as_ref()
    }

    pub fn phase(&self, symbol: &str) -> Option<SymbolPhase> {
        self.phases.get(symbol).copied()
    }

    pub fn frozen_levels(&self, symbol: &str) -> Option<&TradingLevels> {
        self.levels.frozen(symbol)
    }

    pub fn live_levels(&self, symbol: &str) -> Option<&TradingLevels> {
        self.levels.live(symbol)
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_prices.get(symbol).copied()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn session(&self) -> Option<NaiveDate> {
        self.session
    }

    pub fn capital(&self) -> Decimal {
        self.capital
    }

    pub fn trades_today(&self) -> u32 {
        self.trades_today
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    /// Whether exit monitoring cadence applies (a position or order is live).
    pub fn needs_fast_poll(&self) -> bool {
        self.slot.is_some()
    }

    pub fn status(&self) -> BotStatus {
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return BotStatus::Error;
        }
        match self.slot.as_ref().map(|p| p.status) {
            Some(PositionStatus::Open) | Some(PositionStatus::Exiting) => BotStatus::Open,
            Some(_) => BotStatus::Watching,
            None if self.phases.values().any(|p| *p != SymbolPhase::Idle) => BotStatus::Watching,
            None => BotStatus::Idle,
        }
    }

    // ==================== Session Setup ====================

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Use the broker's available margin as sizing capital.
    pub fn set_capital(&mut self, capital: Decimal) {
        if capital > Decimal::ZERO {
            self.capital = capital;
        }
    }

    /// Freeze the session's trigger levels for `symbol` (IDLE -> WATCHING).
    ///
    /// Returns `Ok(false)` when levels were already frozen this session.
    pub fn freeze_levels(
        &mut self,
        symbol: &str,
        reference_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if !self.phases.contains_key(symbol) {
            return Err(EngineError::UnknownSymbol(symbol.to_string()));
        }

        let levels = TradingLevels::compute(reference_price, self.config.buffer);
        let frozen = self.levels.freeze(symbol, levels, now);
        self.levels.update_live(symbol, levels);

        if frozen {
            info!(
                symbol = %symbol,
                reference = %reference_price,
                buy_trigger = %levels.buy_trigger,
                sell_trigger = %levels.sell_trigger,
                "Trigger levels frozen"
            );
            if self.phase(symbol) == Some(SymbolPhase::Idle) {
                self.set_phase(symbol, SymbolPhase::Watching);
            }
        }
        Ok(frozen)
    }

    /// Whether `symbol` still waits on its opening range this session.
    pub fn needs_levels(&self, symbol: &str) -> bool {
        !self.levels.is_frozen(symbol) && !self.range_skipped.contains(symbol)
    }

    /// Freeze levels from a completed opening range, unless the range is
    /// outside the configured band. An out-of-band symbol stays IDLE for the
    /// rest of the session.
    pub fn freeze_opening_range(
        &mut self,
        symbol: &str,
        range: &OpeningRange,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if !self.phases.contains_key(symbol) {
            return Err(EngineError::UnknownSymbol(symbol.to_string()));
        }

        let range_pct = range.range_pct();
        if !self.config.range_in_band(range_pct) {
            if self.range_skipped.insert(symbol.to_string()) {
                info!(
                    symbol = %symbol,
                    range_pct = %range_pct.round_dp(2),
                    "Opening range outside band, skipping symbol for the session"
                );
            }
            return Ok(false);
        }
        self.freeze_levels(symbol, range.vwap, now)
    }

    /// Recompute display-only levels. Never affects trading decisions.
    pub fn update_live_levels(&mut self, symbol: &str, reference_price: Decimal) -> TradingLevels {
        let levels = TradingLevels::compute(reference_price, self.config.buffer);
        self.levels.update_live(symbol, levels);
        levels
    }

    /// Start a new session. Refused while a position or order is live.
    pub fn reset_session(&mut self, date: NaiveDate) -> bool {
        if let Some(position) = &self.slot {
            if self.deferred_session != Some(date) {
                warn!(
                    symbol = %position.symbol,
                    status = position.status.as_str(),
                    date = %date,
                    "Session rollover deferred until the live position closes"
                );
                self.deferred_session = Some(date);
            }
            return false;
        }

        self.deferred_session = None;
        self.range_skipped.clear();
        self.levels.clear();
        for phase in self.phases.values_mut() {
            *phase = SymbolPhase::Idle;
        }
        self.disarmed.clear();
        self.trades_today = 0;
        self.trades_by_symbol.clear();
        self.realized_pnl = Decimal::ZERO;
        self.session = Some(date);

        info!(date = %date, "New trading session");
        true
    }

    /// Rebuild today's counters from persisted trades after a restart.
    pub fn restore_day(&mut self, trades: &[TradeRecord]) {
        self.trades_today = trades.len() as u32;
        self.trades_by_symbol.clear();
        for trade in trades {
            *self.trades_by_symbol.entry(trade.symbol.clone()).or_insert(0) += 1;
        }
        self.realized_pnl = trades.iter().map(|t| t.pnl).sum();
    }

    /// Adopt a position persisted by a previous run.
    pub fn restore_position(&mut self, position: Position) -> Result<(), EngineError> {
        if let Some(existing) = &self.slot {
            return Err(EngineError::SlotOccupied(existing.symbol.clone()));
        }
        if !self.phases.contains_key(&position.symbol) {
            return Err(EngineError::UnknownSymbol(position.symbol.clone()));
        }

        let phase = match position.status {
            PositionStatus::PendingEntry => SymbolPhase::EntryPlaced,
            PositionStatus::Open => SymbolPhase::Open,
            PositionStatus::Exiting => SymbolPhase::Exiting,
            PositionStatus::Closed => return Ok(()),
        };
        info!(
            symbol = %position.symbol,
            side = %position.side,
            quantity = position.quantity,
            "Restored live position"
        );
        // Entries count at fill; a position filled on an earlier day does not.
        let opened_today =
            Some(self.config.session.local(position.opened_at).date_naive()) == self.session;
        if phase != SymbolPhase::EntryPlaced && opened_today {
            self.count_trade(&position.symbol);
        }
        self.set_phase(&position.symbol, phase);
        self.slot = Some(position);
        Ok(())
    }

    fn count_trade(&mut self, symbol: &str) {
        self.trades_today += 1;
        *self.trades_by_symbol.entry(symbol.to_string()).or_insert(0) += 1;
    }

    /// Queue a request for the start of the next cycle.
    pub fn enqueue(&mut self, request: ControlRequest) {
        debug!(kind = request.kind(), "Control request queued");
        self.controls.push_back(request);
    }

    /// Count a market data failure against the next cycle.
    pub fn note_data_failure(&mut self, symbol: &str, err: &DataFetchError) {
        warn!(symbol = %symbol, error = %err, "Market data unavailable this cycle");
        self.pending_failures += 1;
    }

    // ==================== Evaluation Cycle ====================

    /// Run one evaluation cycle over the quotes observed since the last one.
    ///
    /// Quotes for the same symbol, in order, form that symbol's price path.
    pub async fn run_cycle(
        &mut self,
        now: DateTime<Utc>,
        quotes: &[Quote],
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
    ) -> CycleReport {
        let mut report = CycleReport {
            failures: std::mem::take(&mut self.pending_failures),
            ..Default::default()
        };
        let paths = self.observe(quotes);

        self.apply_controls(now, gateway, journal, &mut report).await;
        if !report.stopped {
            self.resolve_in_flight(now, gateway, journal, &mut report).await;
            self.manage_position(now, &paths, gateway, journal, &mut report).await;
            self.scan_for_entry(now, &paths, gateway, journal, &mut report).await;
        }

        self.finish_cycle(&report);
        report
    }

    /// Stop trading: cancel an unfilled entry, leave any open position and its
    /// stop-loss in place.
    pub async fn stop(&mut self, gateway: &dyn OrderGateway, journal: &dyn TradeJournal) {
        self.running = false;

        let pending = match &self.slot {
            Some(p) if p.status == PositionStatus::PendingEntry => p.entry_order_id.clone(),
            _ => None,
        };

        if let Some(order_id) = pending {
            let mut report = CycleReport::default();
            self.cancel_entry(&order_id, Utc::now(), gateway, journal, &mut report)
                .await;
        }

        if let Some(position) = &self.slot {
            info!(
                symbol = %position.symbol,
                status = position.status.as_str(),
                protected = position.is_protected(),
                "Stopped with live position left in place"
            );
        } else {
            info!("Engine stopped");
        }
    }

    fn observe(&mut self, quotes: &[Quote]) -> HashMap<String, Vec<Decimal>> {
        let mut paths: HashMap<String, Vec<Decimal>> = HashMap::new();
        for quote in quotes {
            if quote.last_price <= Decimal::ZERO {
                continue;
            }
            paths
                .entry(quote.symbol.clone())
                .or_default()
                .push(quote.last_price);
            self.last_prices.insert(quote.symbol.clone(), quote.last_price);
        }
        paths
    }

    async fn apply_controls(
        &mut self,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        while let Some(request) = self.controls.pop_front() {
            info!(kind = request.kind(), "Applying control request");
            let result = match &request {
                ControlRequest::Stop => {
                    self.stop(gateway, journal).await;
                    report.stopped = true;
                    break;
                }
                ControlRequest::ManualExit { symbol } => {
                    self.manual_exit(symbol, now, gateway, journal, report).await
                }
                ControlRequest::ManualTrade { symbol, side } => {
                    self.manual_trade(symbol, *side, now, gateway, journal, report)
                        .await
                }
            };

            if let Err(e) = result {
                warn!(kind = request.kind(), error = %e, "Control request not applied");
                report.rejected.push(format!("{}: {}", request.kind(), e));
            }
        }
    }

    async fn manual_exit(
        &mut self,
        symbol: &str,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let status = match &self.slot {
            Some(p) if p.symbol == symbol => p.status,
            _ => return Err(EngineError::NoPosition(symbol.to_string())),
        };

        match status {
            PositionStatus::Open => {
                let price = self
                    .last_price(symbol)
                    .ok_or_else(|| EngineError::NoPrice(symbol.to_string()))?;
                self.begin_exit(ExitReason::Manual, price, now, gateway, journal, report)
                    .await
            }
            PositionStatus::Exiting => {
                debug!(symbol = %symbol, "Exit already in flight");
                Ok(())
            }
            _ => Err(EngineError::NoPosition(symbol.to_string())),
        }
    }

    async fn manual_trade(
        &mut self,
        symbol: &str,
        side: Side,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let watch = self
            .config
            .watch(symbol)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;
        if let Some(existing) = &self.slot {
            return Err(EngineError::SlotOccupied(existing.symbol.clone()));
        }
        let price = self
            .last_price(symbol)
            .ok_or_else(|| EngineError::NoPrice(symbol.to_string()))?;

        self.open_entry(&watch, side, price, true, now, gateway, journal, report)
            .await?;
        Ok(())
    }

    // ==================== In-flight Orders ====================

    async fn resolve_in_flight(
        &mut self,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        let (status, order_id) = match &self.slot {
            Some(p) if p.status == PositionStatus::PendingEntry => {
                (p.status, p.entry_order_id.clone())
            }
            Some(p) if p.status == PositionStatus::Exiting => (p.status, p.exit_order_id.clone()),
            _ => return,
        };
        let Some(order_id) = order_id else {
            return;
        };

        let update = match gateway.order_status(&order_id).await {
            Ok(update) => update,
            Err(e) => {
                report.failures += 1;
                warn!(order_id = %order_id, error = %e, "Failed to fetch order status");
                return;
            }
        };
        if update.state.is_terminal() {
            self.journal_update(journal, &update).await;
        }

        if status == PositionStatus::PendingEntry {
            self.on_entry_update(&order_id, update.state, now, gateway, journal, report)
                .await;
        } else {
            self.on_exit_update(update.state, now, journal, report).await;
        }
    }

    async fn on_entry_update(
        &mut self,
        order_id: &str,
        state: OrderState,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        if state == OrderState::Pending {
            let expired = self.slot.as_ref().is_some_and(|p| {
                (now - p.opened_at).num_seconds() >= self.config.entry_order_timeout_secs as i64
            });
            if expired {
                info!(order_id = %order_id, "Entry order timed out");
                self.cancel_entry(order_id, now, gateway, journal, report)
                    .await;
                return;
            }
        }
        self.settle_entry(order_id, state, false, now, gateway, journal, report)
            .await;
    }

    /// Cancel the working entry order and settle the slot from the broker's
    /// answer afterwards. Shares filled before the cancel become the position.
    async fn cancel_entry(
        &mut self,
        order_id: &str,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        if let Err(e) = gateway.cancel(order_id).await {
            report.failures += 1;
            warn!(order_id = %order_id, error = %e, "Failed to cancel entry order");
            return;
        }

        match gateway.order_status(order_id).await {
            Ok(update) => {
                if update.state.is_terminal() {
                    self.journal_update(journal, &update).await;
                }
                self.settle_entry(order_id, update.state, true, now, gateway, journal, report)
                    .await;
            }
            Err(e) => {
                report.failures += 1;
                warn!(
                    order_id = %order_id,
                    error = %e,
                    "Cancelled entry not confirmed, settling next cycle"
                );
            }
        }
    }

    /// Apply the state of the entry order. `cancelled_here` marks a cancel
    /// the engine asked for, which does not disarm the symbol.
    #[allow(clippy::too_many_arguments)]
    async fn settle_entry(
        &mut self,
        order_id: &str,
        state: OrderState,
        cancelled_here: bool,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        match state {
            OrderState::Pending => debug!(order_id = %order_id, "Entry order pending"),
            OrderState::Filled {
                average_price,
                filled_quantity,
            } => {
                self.open_from_fill(average_price, filled_quantity, now, gateway, journal, report)
                    .await;
            }
            OrderState::Cancelled {
                average_price,
                filled_quantity,
            } if filled_quantity > 0 => {
                warn!(
                    order_id = %order_id,
                    filled_quantity,
                    "Entry cancelled after a partial fill, keeping filled shares"
                );
                self.open_from_fill(average_price, filled_quantity, now, gateway, journal, report)
                    .await;
            }
            OrderState::Cancelled { .. } if cancelled_here => {
                self.drop_pending_entry(journal).await;
            }
            OrderState::Rejected { .. } | OrderState::Cancelled { .. } => {
                let reason = match &state {
                    OrderState::Rejected { reason } => reason.clone(),
                    _ => "cancelled".to_string(),
                };
                let Some(mut position) = self.slot.take() else {
                    return;
                };
                warn!(
                    symbol = %position.symbol,
                    reason = %reason,
                    "Entry order rejected, back to watching"
                );
                report.rejected.push(format!("{}: {}", position.symbol, reason));
                self.disarmed.insert(position.symbol.clone());
                self.set_phase(&position.symbol, SymbolPhase::Watching);

                position.status = PositionStatus::Closed;
                self.journal_position(journal, &position).await;
            }
        }
    }

    /// Turn the pending entry into an open position of `filled_quantity`
    /// shares and protect it.
    async fn open_from_fill(
        &mut self,
        average_price: Decimal,
        filled_quantity: u64,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        let Some(position) = self.slot.as_mut() else {
            return;
        };
        let fill = if average_price > Decimal::ZERO {
            average_price
        } else {
            position.entry_price
        };
        let quantity = if filled_quantity > 0 {
            filled_quantity
        } else {
            position.quantity
        };
        let (stop, target) = self.rules.protective_levels(position.side, fill, quantity);

        position.entry_price = fill;
        position.quantity = quantity;
        position.stop_loss_price = stop;
        position.target_price = target;
        position.status = PositionStatus::Open;
        position.opened_at = now;

        info!(
            symbol = %position.symbol,
            side = %position.side,
            quantity = quantity,
            fill = %fill,
            stop_loss = %stop,
            target = %target,
            risk_per_share = %position.risk_per_share(),
            notional = %position.notional(),
            "Entry filled, position open"
        );

        let symbol = position.symbol.clone();
        self.count_trade(&symbol);
        self.set_phase(&symbol, SymbolPhase::Open);
        self.journal_slot(journal).await;

        self.place_stop_loss(gateway, journal, report).await;
    }

    async fn on_exit_update(
        &mut self,
        state: OrderState,
        now: DateTime<Utc>,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        match state {
            OrderState::Pending => debug!("Exit order pending"),
            OrderState::Filled { average_price, .. } => {
                let Some(position) = self.slot.take() else {
                    return;
                };
                let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
                let exit_price = if average_price > Decimal::ZERO {
                    average_price
                } else {
                    self.last_price(&position.symbol)
                        .unwrap_or(position.entry_price)
                };
                self.close_position(position, exit_price, reason, now, journal, report)
                    .await;
            }
            OrderState::Rejected { .. } | OrderState::Cancelled { .. } => {
                let Some(position) = self.slot.as_mut() else {
                    return;
                };
                warn!(
                    symbol = %position.symbol,
                    state = state.as_str(),
                    "Exit order not filled, position remains open"
                );
                report
                    .rejected
                    .push(format!("{}: exit {}", position.symbol, state.as_str()));
                position.status = PositionStatus::Open;
                position.exit_order_id = None;
                position.exit_reason = None;

                let symbol = position.symbol.clone();
                self.set_phase(&symbol, SymbolPhase::Open);
                self.journal_slot(journal).await;
            }
        }
    }

    async fn drop_pending_entry(&mut self, journal: &dyn TradeJournal) {
        let Some(mut position) = self.slot.take() else {
            return;
        };
        info!(symbol = %position.symbol, "Unfilled entry cancelled, back to watching");
        self.set_phase(&position.symbol, SymbolPhase::Watching);
        position.status = PositionStatus::Closed;
        self.journal_position(journal, &position).await;
    }

    // ==================== Position Management ====================

    async fn manage_position(
        &mut self,
        now: DateTime<Utc>,
        paths: &HashMap<String, Vec<Decimal>>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        let (symbol, sl_order_id, entry_price) = match &self.slot {
            Some(p) if p.status == PositionStatus::Open => {
                (p.symbol.clone(), p.sl_order_id.clone(), p.entry_price)
            }
            _ => return,
        };

        if let Some(sl_id) = sl_order_id {
            match gateway.order_status(&sl_id).await {
                Ok(update) => match update.state {
                    OrderState::Filled { average_price, .. } => {
                        self.journal_update(journal, &update).await;
                        if let Some(position) = self.slot.take() {
                            let price = if average_price > Decimal::ZERO {
                                average_price
                            } else {
                                position.stop_loss_price
                            };
                            info!(symbol = %symbol, price = %price, "Stop-loss filled at broker");
                            self.close_position(
                                position,
                                price,
                                ExitReason::BrokerStopLoss,
                                now,
                                journal,
                                report,
                            )
                            .await;
                        }
                        return;
                    }
                    OrderState::Rejected { .. } | OrderState::Cancelled { .. } => {
                        self.journal_update(journal, &update).await;
                        warn!(
                            symbol = %symbol,
                            order_id = %sl_id,
                            state = update.state.as_str(),
                            "Stop-loss order no longer live"
                        );
                        if let Some(position) = self.slot.as_mut() {
                            position.sl_order_id = None;
                        }
                    }
                    OrderState::Pending => {}
                },
                Err(e) => {
                    report.failures += 1;
                    warn!(symbol = %symbol, error = %e, "Failed to check stop-loss order");
                }
            }
        }

        self.place_stop_loss(gateway, journal, report).await;

        if self.config.session.is_square_off(now) {
            let price = self.last_price(&symbol).unwrap_or(entry_price);
            info!(symbol = %symbol, price = %price, "Square-off time, closing position");
            if let Err(e) = self
                .begin_exit(ExitReason::SessionEnd, price, now, gateway, journal, report)
                .await
            {
                debug!(error = %e, "Square-off deferred");
            }
            return;
        }

        let Some(path) = paths.get(&symbol) else {
            return;
        };
        let Some(trigger) = self.slot.as_ref().and_then(|p| check_exit(p, path)) else {
            return;
        };

        info!(
            symbol = %symbol,
            reason = %trigger.reason,
            level = %trigger.reference_price,
            "Exit condition reached"
        );
        if let Err(e) = self
            .begin_exit(trigger.reason, trigger.reference_price, now, gateway, journal, report)
            .await
        {
            debug!(error = %e, "Exit deferred");
        }
    }

    /// Submit the protective stop if the open position has none.
    async fn place_stop_loss(
        &mut self,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        let intent = match &self.slot {
            Some(p) if p.status == PositionStatus::Open && !p.is_protected() => {
                OrderIntent::StopLoss {
                    ticket: ticket_for(p, p.stop_loss_price),
                    at_market: false,
                }
            }
            _ => return,
        };

        match gateway.submit(&intent).await {
            Ok(order_id) => {
                report.submitted.push(order_id.clone());
                self.journal_order(journal, &order_id, &intent).await;
                if let Some(position) = self.slot.as_mut() {
                    info!(
                        symbol = %position.symbol,
                        trigger = %position.stop_loss_price,
                        order_id = %order_id,
                        "Stop-loss placed"
                    );
                    position.sl_order_id = Some(order_id);
                }
                self.journal_slot(journal).await;
            }
            Err(e) => {
                if !e.is_rejection() {
                    report.failures += 1;
                }
                error!(
                    symbol = %intent.ticket().symbol,
                    error = %e,
                    "Stop-loss placement failed, position UNPROTECTED, retrying next cycle"
                );
            }
        }
    }

    /// Cancel the resting stop and close at market (OPEN -> EXITING).
    async fn begin_exit(
        &mut self,
        reason: ExitReason,
        price: Decimal,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let (symbol, sl_order_id) = match &self.slot {
            Some(p) if p.status == PositionStatus::Open => (p.symbol.clone(), p.sl_order_id.clone()),
            Some(p) => return Err(EngineError::NoPosition(p.symbol.clone())),
            None => return Err(EngineError::NoPosition(String::new())),
        };

        if let Some(sl_id) = sl_order_id {
            if let Err(e) = gateway.cancel(&sl_id).await {
                report.failures += 1;
                warn!(
                    symbol = %symbol,
                    order_id = %sl_id,
                    error = %e,
                    "Could not cancel stop-loss before exit, retrying next cycle"
                );
                return Err(e.into());
            }
            self.journal_update(
                journal,
                &OrderUpdate {
                    order_id: sl_id,
                    state: OrderState::cancelled(),
                },
            )
            .await;
            if let Some(position) = self.slot.as_mut() {
                position.sl_order_id = None;
            }
        }

        let intent = match &self.slot {
            Some(p) => exit_intent(p, reason, price),
            None => return Err(EngineError::NoPosition(symbol)),
        };

        match gateway.submit(&intent).await {
            Ok(order_id) => {
                info!(
                    symbol = %symbol,
                    reason = %reason,
                    price = %price,
                    order_id = %order_id,
                    "Exit order submitted"
                );
                report.submitted.push(order_id.clone());
                self.journal_order(journal, &order_id, &intent).await;
                if let Some(position) = self.slot.as_mut() {
                    position.status = PositionStatus::Exiting;
                    position.exit_order_id = Some(order_id);
                    position.exit_reason = Some(reason);
                }
                self.set_phase(&symbol, SymbolPhase::Exiting);
                self.journal_slot(journal).await;

                self.resolve_in_flight(now, gateway, journal, report).await;
                Ok(())
            }
            Err(e) => {
                if e.is_rejection() {
                    report.rejected.push(format!("{}: {}", symbol, e));
                } else {
                    report.failures += 1;
                }
                warn!(
                    symbol = %symbol,
                    error = %e,
                    "Exit order failed, position open and unprotected until stop-loss is re-placed"
                );
                Err(e.into())
            }
        }
    }

    async fn close_position(
        &mut self,
        mut position: Position,
        exit_price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        let trade = TradeRecord::close(&position, exit_price, reason, now);
        self.realized_pnl += trade.pnl;

        info!(
            symbol = %trade.symbol,
            side = %trade.side,
            entry = %trade.entry_price,
            exit = %trade.exit_price,
            pnl = %trade.pnl,
            reason = %reason,
            "Position closed"
        );

        position.status = PositionStatus::Closed;
        position.exit_reason = Some(reason);
        self.set_phase(&position.symbol, SymbolPhase::Closed);
        self.disarmed.insert(position.symbol.clone());

        self.journal_position(journal, &position).await;
        if let Err(e) = journal.record_trade(&trade).await {
            warn!(symbol = %trade.symbol, error = %e, "Failed to persist trade");
        }
        report.closed.push(trade);
    }

    // ==================== Entry Scan ====================

    async fn scan_for_entry(
        &mut self,
        now: DateTime<Utc>,
        paths: &HashMap<String, Vec<Decimal>>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) {
        if self.slot.is_some() || !self.running {
            return;
        }
        self.rearm(paths);

        if !self.config.session.entries_open(now) {
            return;
        }
        if let Some(reason) = self.entry_block_reason() {
            debug!(reason = %reason, "New entries blocked");
            return;
        }

        let watchlist = self.config.watchlist.clone();
        for watch in &watchlist {
            let Some((side, price)) = self.breakout(&watch.symbol, paths) else {
                continue;
            };
            if self.symbol_cap_reached(&watch.symbol) {
                debug!(symbol = %watch.symbol, "Per-symbol trade cap reached");
                continue;
            }

            info!(symbol = %watch.symbol, side = %side, price = %price, "Breakout detected");
            match self
                .open_entry(watch, side, price, false, now, gateway, journal, report)
                .await
            {
                Ok(false) => continue,
                _ => break,
            }
        }
    }

    /// Side and price of a breakout through the frozen levels, if any.
    fn breakout(
        &self,
        symbol: &str,
        paths: &HashMap<String, Vec<Decimal>>,
    ) -> Option<(Side, Decimal)> {
        if self.phase(symbol) != Some(SymbolPhase::Watching) || self.disarmed.contains(symbol) {
            return None;
        }
        let levels = self.levels.frozen(symbol)?;
        let price = *paths.get(symbol)?.last()?;

        if price > levels.buy_trigger {
            Some((Side::Long, price))
        } else if price < levels.sell_trigger {
            Some((Side::Short, price))
        } else {
            None
        }
    }

    /// Re-arm symbols whose price is back inside the trigger band.
    fn rearm(&mut self, paths: &HashMap<String, Vec<Decimal>>) {
        let ready: Vec<String> = self
            .disarmed
            .iter()
            .filter(|symbol| {
                match (
                    self.levels.frozen(symbol),
                    paths.get(*symbol).and_then(|p| p.last()),
                ) {
                    (Some(levels), Some(price)) => levels.contains(*price),
                    _ => false,
                }
            })
            .cloned()
            .collect();

        for symbol in ready {
            debug!(symbol = %symbol, "Price back inside band, re-armed");
            self.disarmed.remove(&symbol);
            if self.phase(&symbol) == Some(SymbolPhase::Closed) {
                self.set_phase(&symbol, SymbolPhase::Watching);
            }
        }
    }

    fn entry_block_reason(&self) -> Option<String> {
        if let Some(max) = self.config.max_trades_per_day {
            if self.trades_today >= max {
                return Some(format!("daily trade cap of {} reached", max));
            }
        }
        if let Some(pct) = self.config.daily_loss_limit_pct {
            let limit = self.capital * pct;
            if self.realized_pnl <= -limit {
                return Some(format!(
                    "daily loss limit reached ({} <= -{})",
                    self.realized_pnl, limit
                ));
            }
        }
        None
    }

    fn symbol_cap_reached(&self, symbol: &str) -> bool {
        match self.config.max_trades_per_symbol {
            Some(max) => self.trades_by_symbol.get(symbol).copied().unwrap_or(0) >= max,
            None => false,
        }
    }

    /// Size and submit an entry. `Ok(false)` means the opportunity was skipped.
    #[allow(clippy::too_many_arguments)]
    async fn open_entry(
        &mut self,
        watch: &SymbolWatch,
        side: Side,
        price: Decimal,
        manual: bool,
        now: DateTime<Utc>,
        gateway: &dyn OrderGateway,
        journal: &dyn TradeJournal,
        report: &mut CycleReport,
    ) -> Result<bool, GatewayError> {
        let quantity = match self.sizer.size(self.capital, price) {
            Sizing::Quantity(q) => q,
            Sizing::Skip => {
                info!(
                    symbol = %watch.symbol,
                    price = %price,
                    capital = %self.capital,
                    "Quantity rounds to zero, skipping"
                );
                report.skipped.push(watch.symbol.clone());
                return Ok(false);
            }
        };

        let limit = self.config.use_limit_orders && !manual;
        let order_price = match (limit, self.levels.frozen(&watch.symbol)) {
            (true, Some(levels)) => match side {
                Side::Long => levels.buy_trigger + self.config.limit_order_buffer,
                Side::Short => levels.sell_trigger - self.config.limit_order_buffer,
            },
            _ => price,
        };
        let (stop, target) = self.rules.protective_levels(side, price, quantity);

        let intent = OrderIntent::Entry {
            ticket: OrderTicket {
                correlation_id: new_correlation_id(),
                symbol: watch.symbol.clone(),
                exchange: watch.exchange.clone(),
                side,
                quantity,
                price: order_price,
            },
            limit,
        };

        match gateway.submit(&intent).await {
            Ok(order_id) => {
                info!(
                    symbol = %watch.symbol,
                    side = %side,
                    quantity = quantity,
                    price = %order_price,
                    stop_loss = %stop,
                    target = %target,
                    order_id = %order_id,
                    manual = manual,
                    "Entry order submitted"
                );
                report.submitted.push(order_id.clone());
                report.entries.push(watch.symbol.clone());
                self.journal_order(journal, &order_id, &intent).await;

                self.slot = Some(Position {
                    symbol: watch.symbol.clone(),
                    exchange: watch.exchange.clone(),
                    side,
                    quantity,
                    entry_price: price,
                    stop_loss_price: stop,
                    target_price: target,
                    entry_order_id: Some(order_id),
                    sl_order_id: None,
                    exit_order_id: None,
                    exit_reason: None,
                    status: PositionStatus::PendingEntry,
                    opened_at: now,
                });
                self.set_phase(&watch.symbol, SymbolPhase::EntryPlaced);
                self.journal_slot(journal).await;

                self.resolve_in_flight(now, gateway, journal, report).await;
                Ok(true)
            }
            Err(e) if e.is_rejection() => {
                warn!(symbol = %watch.symbol, error = %e, "Entry rejected by gateway");
                report.rejected.push(format!("{}: {}", watch.symbol, e));
                self.disarmed.insert(watch.symbol.clone());
                Err(e)
            }
            Err(e) => {
                report.failures += 1;
                warn!(symbol = %watch.symbol, error = %e, "Entry submission failed, retrying next cycle");
                Err(e)
            }
        }
    }

    fn finish_cycle(&mut self, report: &CycleReport) {
        if report.failures == 0 {
            if self.consecutive_failures >= self.config.max_consecutive_failures {
                info!("Broker calls succeeding again, clearing error status");
            }
            self.consecutive_failures = 0;
            return;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures == self.config.max_consecutive_failures {
            error!(
                cycles = self.consecutive_failures,
                "Consecutive failed cycles, reporting ERROR"
            );
        }
    }

    fn set_phase(&mut self, symbol: &str, phase: SymbolPhase) {
        if let Some(current) = self.phases.get_mut(symbol) {
            if *current != phase {
                debug!(symbol = %symbol, from = ?*current, to = ?phase, "Phase change");
                *current = phase;
            }
        }
    }

    // ==================== Journal ====================

    async fn journal_order(&self, journal: &dyn TradeJournal, order_id: &str, intent: &OrderIntent) {
        if let Err(e) = journal.record_order(order_id, intent).await {
            warn!(order_id = %order_id, error = %e, "Failed to persist order");
        }
    }

    async fn journal_update(&self, journal: &dyn TradeJournal, update: &OrderUpdate) {
        if let Err(e) = journal.update_order(update).await {
            warn!(order_id = %update.order_id, error = %e, "Failed to persist order status");
        }
    }

    async fn journal_position(&self, journal: &dyn TradeJournal, position: &Position) {
        if let Err(e) = journal.save_position(position).await {
            warn!(symbol = %position.symbol, error = %e, "Failed to persist position");
        }
    }

    async fn journal_slot(&self, journal: &dyn TradeJournal) {
        if let Some(position) = &self.slot {
            self.journal_position(journal, position).await;
        }
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn ticket_for(position: &Position, price: Decimal) -> OrderTicket {
    OrderTicket {
        correlation_id: new_correlation_id(),
        symbol: position.symbol.clone(),
        exchange: position.exchange.clone(),
        side: position.side,
        quantity: position.quantity,
        price,
    }
}

fn exit_intent(position: &Position, reason: ExitReason, price: Decimal) -> OrderIntent {
    let ticket = ticket_for(position, price);
    match reason {
        ExitReason::StopLoss | ExitReason::BrokerStopLoss => OrderIntent::StopLoss {
            ticket,
            at_market: true,
        },
        ExitReason::Target => OrderIntent::Target { ticket },
        ExitReason::Manual | ExitReason::SessionEnd => OrderIntent::ManualExit { ticket },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use crate::trading::BufferMode;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    // ==================== Mocks ====================

    #[derive(Default)]
    struct GatewayState {
        next_id: u32,
        submitted: Vec<(String, OrderIntent)>,
        statuses: HashMap<String, OrderState>,
        cancelled: Vec<String>,
        reject: HashSet<&'static str>,
        fail: HashSet<&'static str>,
        hold_fills: bool,
        /// Shares already traded when the next cancel lands.
        fill_before_cancel: u64,
    }

    /// Fills market and limit orders at the ticket price unless `hold_fills`.
    /// Resting stops stay pending until the test fills them.
    #[derive(Default)]
    struct MockGateway {
        state: Mutex<GatewayState>,
    }

    impl MockGateway {
        fn holding() -> Self {
            let gw = Self::default();
            gw.state.lock().unwrap().hold_fills = true;
            gw
        }

        fn reject(&self, kind: &'static str) {
            self.state.lock().unwrap().reject.insert(kind);
        }

        fn fail(&self, kind: &'static str) {
            self.state.lock().unwrap().fail.insert(kind);
        }

        fn fill_before_cancel(&self, quantity: u64) {
            self.state.lock().unwrap().fill_before_cancel = quantity;
        }

        fn heal(&self) {
            let mut s = self.state.lock().unwrap();
            s.reject.clear();
            s.fail.clear();
        }

        fn set_state(&self, order_id: &str, state: OrderState) {
            self.state
                .lock()
                .unwrap()
                .statuses
                .insert(order_id.to_string(), state);
        }

        fn submitted(&self) -> Vec<(String, OrderIntent)> {
            self.state.lock().unwrap().submitted.clone()
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.submitted().iter().map(|(_, i)| i.kind()).collect()
        }

        fn cancelled(&self) -> Vec<String> {
            self.state.lock().unwrap().cancelled.clone()
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
            let mut s = self.state.lock().unwrap();
            if s.reject.contains(intent.kind()) {
                return Err(GatewayError::Rejected("insufficient margin".to_string()));
            }
            if s.fail.contains(intent.kind()) {
                return Err(GatewayError::Timeout(30));
            }

            s.next_id += 1;
            let order_id = format!("O{}", s.next_id);
            let state = if intent.is_resting_stop() || s.hold_fills {
                OrderState::Pending
            } else {
                OrderState::Filled {
                    average_price: intent.ticket().price,
                    filled_quantity: intent.ticket().quantity,
                }
            };
            s.statuses.insert(order_id.clone(), state);
            s.submitted.push((order_id.clone(), intent.clone()));
            Ok(order_id)
        }

        async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, GatewayError> {
            let s = self.state.lock().unwrap();
            if s.fail.contains("STATUS") {
                return Err(GatewayError::Transport("connection reset".to_string()));
            }
            let state = s
                .statuses
                .get(order_id)
                .cloned()
                .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
            Ok(OrderUpdate {
                order_id: order_id.to_string(),
                state,
            })
        }

        async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
            let mut s = self.state.lock().unwrap();
            if s.fail.contains("CANCEL") {
                return Err(GatewayError::Timeout(30));
            }
            let filled_quantity = std::mem::take(&mut s.fill_before_cancel);
            let average_price = s
                .submitted
                .iter()
                .find(|(id, _)| id == order_id)
                .map(|(_, intent)| intent.ticket().price)
                .unwrap_or_default();
            s.statuses.insert(
                order_id.to_string(),
                OrderState::Cancelled {
                    average_price,
                    filled_quantity,
                },
            );
            s.cancelled.push(order_id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryJournal {
        orders: Mutex<Vec<String>>,
        positions: Mutex<Vec<Position>>,
        trades: Mutex<Vec<TradeRecord>>,
    }

    #[async_trait]
    impl TradeJournal for MemoryJournal {
        async fn record_order(&self, order_id: &str, _intent: &OrderIntent) -> Result<()> {
            self.orders.lock().unwrap().push(order_id.to_string());
            Ok(())
        }

        async fn update_order(&self, _update: &OrderUpdate) -> Result<()> {
            Ok(())
        }

        async fn save_position(&self, position: &Position) -> Result<()> {
            self.positions.lock().unwrap().push(position.clone());
            Ok(())
        }

        async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
            self.trades.lock().unwrap().push(trade.clone());
            Ok(())
        }
    }

    // ==================== Fixtures ====================

    /// Exchange-local (IST) wall clock on a fixed trading day.
    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(19800)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 2, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn config(symbols: &[&str]) -> TradingConfig {
        TradingConfig {
            watchlist: symbols.iter().map(|s| SymbolWatch::new(*s, "NSE")).collect(),
            buffer: BufferMode::Absolute(dec!(0.5)),
            ..Default::default()
        }
    }

    /// Levels frozen at 199 ± 0.5 for every symbol: buy above 199.5, sell below 198.5.
    fn engine_with(config: TradingConfig) -> BreakoutEngine {
        let symbols: Vec<String> = config.watchlist.iter().map(|w| w.symbol.clone()).collect();
        let mut engine = BreakoutEngine::new(config).unwrap();
        engine.start();
        for symbol in &symbols {
            assert!(engine.freeze_levels(symbol, dec!(199), at(9, 30)).unwrap());
        }
        engine
    }

    fn engine(symbols: &[&str]) -> BreakoutEngine {
        engine_with(config(symbols))
    }

    fn quotes(prices: &[(&str, Decimal)]) -> Vec<Quote> {
        prices
            .iter()
            .map(|(s, p)| Quote::new(*s, *p, at(10, 0)))
            .collect()
    }

    async fn open_long(engine: &mut BreakoutEngine, gw: &MockGateway, journal: &MemoryJournal) {
        let report = engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), gw, journal)
            .await;
        assert_eq!(report.entries, vec!["TCS".to_string()]);
        assert_eq!(engine.position().unwrap().status, PositionStatus::Open);
    }

    // ==================== Entries ====================

    #[tokio::test]
    async fn test_breakout_opens_sized_protected_position() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();

        open_long(&mut engine, &gw, &journal).await;

        let position = engine.position().unwrap();
        assert_eq!(position.side, Side::Long);
        // 20000 × 0.5 × 5 / 200
        assert_eq!(position.quantity, 250);
        assert_eq!(position.entry_price, dec!(200));
        assert_eq!(position.stop_loss_price, dec!(198.5));
        assert_eq!(position.target_price, dec!(203));
        assert!(position.is_protected());

        assert_eq!(gw.kinds(), vec!["ENTRY", "STOP_LOSS"]);
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Open));
        assert_eq!(engine.status(), BotStatus::Open);
        assert_eq!(engine.trades_today(), 1);
    }

    #[tokio::test]
    async fn test_short_breakout() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(198))]), &gw, &journal)
            .await;

        let position = engine.position().unwrap();
        assert_eq!(position.side, Side::Short);
        assert!(position.stop_loss_price > position.entry_price);
        assert!(position.target_price < position.entry_price);
        match &gw.submitted()[0].1 {
            OrderIntent::Entry { ticket, limit } => {
                assert_eq!(ticket.side, Side::Short);
                assert!(!limit);
            }
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeated_cycle_submits_once_while_in_flight() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();
        let snapshot = quotes(&[("TCS", dec!(200))]);

        engine.run_cycle(at(10, 0), &snapshot, &gw, &journal).await;
        engine.run_cycle(at(10, 0), &snapshot, &gw, &journal).await;

        assert_eq!(gw.submitted().len(), 1);
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::EntryPlaced));
        assert_eq!(engine.position().unwrap().status, PositionStatus::PendingEntry);
        assert_eq!(engine.status(), BotStatus::Watching);

        // Fill arrives on a later cycle.
        gw.set_state(
            "O1",
            OrderState::Filled {
                average_price: dec!(200.1),
                filled_quantity: 250,
            },
        );
        engine.run_cycle(at(10, 1), &snapshot, &gw, &journal).await;
        let position = engine.position().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.entry_price, dec!(200.1));
        assert_eq!(position.stop_loss_price, dec!(198.6));
    }

    #[tokio::test]
    async fn test_first_hit_wins_single_slot() {
        let mut engine = engine(&["INFY", "TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        let both = quotes(&[("TCS", dec!(200)), ("INFY", dec!(198))]);

        engine.run_cycle(at(10, 0), &both, &gw, &journal).await;
        assert_eq!(engine.position().unwrap().symbol, "INFY");
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Watching));

        engine.run_cycle(at(10, 1), &both, &gw, &journal).await;
        let entries = gw.kinds().iter().filter(|k| **k == "ENTRY").count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_zero_quantity_is_skipped_not_consumed() {
        let mut cfg = config(&["MRF", "TCS"]);
        cfg.capital = dec!(1000);
        let mut engine = BreakoutEngine::new(cfg).unwrap();
        engine.start();
        engine.freeze_levels("MRF", dec!(140000), at(9, 30)).unwrap();
        engine.freeze_levels("TCS", dec!(199), at(9, 30)).unwrap();
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();

        let report = engine
            .run_cycle(
                at(10, 0),
                &quotes(&[("MRF", dec!(141000)), ("TCS", dec!(200))]),
                &gw,
                &journal,
            )
            .await;

        assert_eq!(report.skipped, vec!["MRF".to_string()]);
        assert_eq!(report.entries, vec!["TCS".to_string()]);
        // 1000 × 0.5 × 5 / 200
        assert_eq!(engine.position().unwrap().quantity, 12);
    }

    #[tokio::test]
    async fn test_rejected_entry_needs_rearm() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        gw.reject("ENTRY");

        let report = engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert_eq!(report.rejected.len(), 1);
        assert!(engine.position().is_none());
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Watching));

        gw.heal();
        // Still above the trigger: not a fresh breakout.
        engine
            .run_cycle(at(10, 1), &quotes(&[("TCS", dec!(200.5))]), &gw, &journal)
            .await;
        assert!(gw.submitted().is_empty());

        // Back inside the band, then through it again.
        engine
            .run_cycle(at(10, 2), &quotes(&[("TCS", dec!(199))]), &gw, &journal)
            .await;
        engine
            .run_cycle(at(10, 3), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert_eq!(gw.kinds(), vec!["ENTRY", "STOP_LOSS"]);
    }

    #[tokio::test]
    async fn test_entry_timeout_keeps_state_and_retries() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        gw.fail("ENTRY");

        let report = engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert_eq!(report.failures, 1);
        assert!(engine.position().is_none());
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Watching));

        gw.heal();
        engine
            .run_cycle(at(10, 1), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert!(engine.position().is_some());
    }

    #[tokio::test]
    async fn test_no_entries_outside_window() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(11, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert!(gw.submitted().is_empty());

        let mut stopped = engine_with(config(&["TCS"]));
        stopped.running = false;
        stopped
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert!(gw.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_stale_pending_entry_is_cancelled() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        engine
            .run_cycle(at(10, 5), &quotes(&[("TCS", dec!(199))]), &gw, &journal)
            .await;

        assert_eq!(gw.cancelled(), vec!["O1".to_string()]);
        assert!(engine.position().is_none());
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Watching));
    }

    #[tokio::test]
    async fn test_partial_fill_survives_entry_timeout() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        gw.fill_before_cancel(100);
        engine
            .run_cycle(at(10, 5), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;

        assert_eq!(gw.cancelled(), vec!["O1".to_string()]);
        let position = engine.position().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.quantity, 100);
        assert!(position.is_protected());
        assert_eq!(engine.trades_today(), 1);

        let submitted = gw.submitted();
        assert_eq!(gw.kinds(), vec!["ENTRY", "STOP_LOSS"]);
        assert_eq!(submitted[1].1.ticket().quantity, 100);
    }

    #[tokio::test]
    async fn test_broker_cancel_after_partial_fill_opens_position() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        gw.set_state(
            "O1",
            OrderState::Cancelled {
                average_price: dec!(200.1),
                filled_quantity: 60,
            },
        );
        engine
            .run_cycle(at(10, 1), &quotes(&[("TCS", dec!(200.2))]), &gw, &journal)
            .await;

        let position = engine.position().unwrap();
        assert_eq!(position.quantity, 60);
        assert_eq!(position.entry_price, dec!(200.1));
        assert!(position.is_protected());
        assert_eq!(gw.kinds(), vec!["ENTRY", "STOP_LOSS"]);
    }

    #[tokio::test]
    async fn test_broker_cancel_without_fill_disarms() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        gw.set_state("O1", OrderState::cancelled());
        let report = engine
            .run_cycle(at(10, 1), &quotes(&[("TCS", dec!(200.2))]), &gw, &journal)
            .await;

        assert_eq!(report.rejected.len(), 1);
        assert!(engine.position().is_none());
        assert_eq!(gw.kinds(), vec!["ENTRY"]);
    }

    #[tokio::test]
    async fn test_limit_entry_priced_off_trigger() {
        let mut cfg = config(&["TCS"]);
        cfg.use_limit_orders = true;
        let mut engine = engine_with(cfg);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;

        match &gw.submitted()[0].1 {
            OrderIntent::Entry { ticket, limit } => {
                assert!(*limit);
                assert_eq!(ticket.price, dec!(199.7));
            }
            other => panic!("unexpected intent {:?}", other),
        }
    }

    // ==================== Exits ====================

    #[tokio::test]
    async fn test_stop_wins_when_path_touches_both() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        let path = quotes(&[("TCS", dec!(203.5)), ("TCS", dec!(198))]);
        let report = engine.run_cycle(at(10, 15), &path, &gw, &journal).await;

        assert_eq!(report.closed.len(), 1);
        let trade = &report.closed[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(198.5));
        assert_eq!(trade.pnl, dec!(-375));

        // Resting stop cancelled before the market exit.
        assert_eq!(gw.cancelled(), vec!["O2".to_string()]);
        assert!(matches!(
            gw.submitted()[2].1,
            OrderIntent::StopLoss { at_market: true, .. }
        ));
        assert!(engine.position().is_none());
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Closed));
        assert_eq!(journal.trades.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_target_exit() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        let report = engine
            .run_cycle(at(10, 15), &quotes(&[("TCS", dec!(203.2))]), &gw, &journal)
            .await;

        let trade = &report.closed[0];
        assert_eq!(trade.exit_reason, ExitReason::Target);
        assert_eq!(trade.pnl, dec!(750));
        assert_eq!(engine.realized_pnl(), dec!(750));
        assert_eq!(gw.kinds().last(), Some(&"TARGET"));
    }

    #[tokio::test]
    async fn test_unprotected_position_retries_stop_loss() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        gw.fail("STOP_LOSS");

        let report = engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert_eq!(report.failures, 1);
        let position = engine.position().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(!position.is_protected());

        gw.heal();
        engine
            .run_cycle(at(10, 1), &quotes(&[("TCS", dec!(200.5))]), &gw, &journal)
            .await;
        assert!(engine.position().unwrap().is_protected());
        assert_eq!(gw.kinds(), vec!["ENTRY", "STOP_LOSS"]);
    }

    #[tokio::test]
    async fn test_broker_stop_fill_closes_position() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        gw.set_state(
            "O2",
            OrderState::Filled {
                average_price: dec!(198.4),
                filled_quantity: 250,
            },
        );
        let report = engine
            .run_cycle(at(10, 20), &quotes(&[("TCS", dec!(198.9))]), &gw, &journal)
            .await;

        assert_eq!(report.closed[0].exit_reason, ExitReason::BrokerStopLoss);
        assert_eq!(report.closed[0].exit_price, dec!(198.4));
        assert!(engine.position().is_none());
        // No market exit was sent on top of the broker fill.
        assert_eq!(gw.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_square_off_at_session_end() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        let report = engine
            .run_cycle(at(15, 26), &quotes(&[("TCS", dec!(201))]), &gw, &journal)
            .await;

        assert_eq!(report.closed[0].exit_reason, ExitReason::SessionEnd);
        assert_eq!(report.closed[0].exit_price, dec!(201));
        assert_eq!(gw.kinds().last(), Some(&"MANUAL_EXIT"));
    }

    #[tokio::test]
    async fn test_exit_rejection_keeps_position_open() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;
        gw.reject("TARGET");

        let report = engine
            .run_cycle(at(10, 15), &quotes(&[("TCS", dec!(203.2))]), &gw, &journal)
            .await;

        assert!(report.closed.is_empty());
        assert_eq!(report.rejected.len(), 1);
        let position = engine.position().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(!position.is_protected());

        // Next cycle re-protects first.
        gw.heal();
        engine
            .run_cycle(at(10, 16), &quotes(&[("TCS", dec!(202))]), &gw, &journal)
            .await;
        assert!(engine.position().unwrap().is_protected());
    }

    // ==================== Control ====================

    #[tokio::test]
    async fn test_manual_exit_uses_market_price() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        engine.enqueue(ControlRequest::ManualExit {
            symbol: "TCS".to_string(),
        });
        let report = engine
            .run_cycle(at(10, 30), &quotes(&[("TCS", dec!(201.5))]), &gw, &journal)
            .await;

        assert_eq!(report.closed[0].exit_reason, ExitReason::Manual);
        assert_eq!(report.closed[0].exit_price, dec!(201.5));
        assert_eq!(report.closed[0].pnl, dec!(375));
    }

    #[tokio::test]
    async fn test_manual_exit_without_position_is_reported() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();

        engine.enqueue(ControlRequest::ManualExit {
            symbol: "TCS".to_string(),
        });
        let report = engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(199))]), &gw, &journal)
            .await;
        assert_eq!(report.rejected.len(), 1);
        assert!(gw.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_manual_trade_is_sized_and_protected() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();

        engine.enqueue(ControlRequest::ManualTrade {
            symbol: "TCS".to_string(),
            side: Side::Short,
        });
        engine
            .run_cycle(at(12, 0), &quotes(&[("TCS", dec!(199))]), &gw, &journal)
            .await;

        let position = engine.position().unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.quantity, 251);
        assert_eq!(position.stop_loss_price, dec!(200.5));
        assert_eq!(position.target_price, dec!(196));
        assert!(position.is_protected());

        // Slot is taken: a second manual trade is refused.
        engine.enqueue(ControlRequest::ManualTrade {
            symbol: "TCS".to_string(),
            side: Side::Long,
        });
        let report = engine
            .run_cycle(at(12, 1), &quotes(&[("TCS", dec!(199))]), &gw, &journal)
            .await;
        assert_eq!(report.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_entry_only() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        engine.enqueue(ControlRequest::Stop);
        let report = engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;

        assert!(report.stopped);
        assert!(!engine.is_running());
        assert!(engine.position().is_none());
        assert_eq!(gw.cancelled(), vec!["O1".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_keeps_partially_filled_entry() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::holding();
        let journal = MemoryJournal::default();

        engine
            .run_cycle(at(10, 0), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        gw.fill_before_cancel(40);
        engine.stop(&gw, &journal).await;

        assert!(!engine.is_running());
        let position = engine.position().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.quantity, 40);
        assert!(position.is_protected());
    }

    #[tokio::test]
    async fn test_stop_leaves_open_position() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        engine.stop(&gw, &journal).await;

        let position = engine.position().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.is_protected());
        assert!(gw.cancelled().is_empty());
    }

    // ==================== Session & Risk ====================

    #[tokio::test]
    async fn test_daily_loss_limit_blocks_entries() {
        let mut cfg = config(&["TCS", "INFY"]);
        cfg.daily_loss_limit_pct = Some(dec!(0.01));
        let mut engine = engine_with(cfg);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        engine
            .run_cycle(at(10, 10), &quotes(&[("TCS", dec!(198))]), &gw, &journal)
            .await;
        assert_eq!(engine.realized_pnl(), dec!(-375));

        engine
            .run_cycle(at(10, 11), &quotes(&[("INFY", dec!(200))]), &gw, &journal)
            .await;
        assert!(engine.position().is_none());
    }

    #[tokio::test]
    async fn test_per_symbol_cap() {
        let mut cfg = config(&["TCS"]);
        cfg.max_trades_per_symbol = Some(1);
        let mut engine = engine_with(cfg);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        engine
            .run_cycle(at(10, 10), &quotes(&[("TCS", dec!(203.5))]), &gw, &journal)
            .await;
        engine
            .run_cycle(at(10, 11), &quotes(&[("TCS", dec!(199))]), &gw, &journal)
            .await;
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Watching));
        engine
            .run_cycle(at(10, 12), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert!(engine.position().is_none());
    }

    #[tokio::test]
    async fn test_consecutive_failures_report_error() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        gw.fail("ENTRY");

        for minute in 0..3 {
            engine
                .run_cycle(at(10, minute), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
                .await;
        }
        assert_eq!(engine.status(), BotStatus::Error);

        gw.heal();
        engine
            .run_cycle(at(10, 4), &quotes(&[("TCS", dec!(200))]), &gw, &journal)
            .await;
        assert_eq!(engine.status(), BotStatus::Open);
    }

    #[tokio::test]
    async fn test_reset_session() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        let next_day = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        assert!(!engine.reset_session(next_day));

        engine
            .run_cycle(at(15, 26), &quotes(&[("TCS", dec!(201))]), &gw, &journal)
            .await;
        assert!(engine.reset_session(next_day));
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Idle));
        assert!(engine.frozen_levels("TCS").is_none());
        assert_eq!(engine.trades_today(), 0);
        assert_eq!(engine.status(), BotStatus::Idle);
    }

    #[tokio::test]
    async fn test_rollover_deferred_until_position_closes() {
        let mut engine = engine(&["TCS"]);
        let gw = MockGateway::default();
        let journal = MemoryJournal::default();
        open_long(&mut engine, &gw, &journal).await;

        let next_day = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        assert!(!engine.reset_session(next_day));
        assert!(!engine.reset_session(next_day));
        assert_eq!(engine.deferred_session, Some(next_day));

        engine
            .run_cycle(at(15, 26), &quotes(&[("TCS", dec!(201))]), &gw, &journal)
            .await;
        assert!(engine.reset_session(next_day));
        assert_eq!(engine.session(), Some(next_day));
        assert_eq!(engine.deferred_session, None);
    }

    #[test]
    fn test_restored_open_position_counts_toward_caps() {
        let mut cfg = config(&["TCS", "INFY"]);
        cfg.max_trades_per_symbol = Some(1);
        let mut engine = BreakoutEngine::new(cfg).unwrap();
        assert!(engine.reset_session(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()));

        let closed = TradeRecord {
            symbol: "INFY".to_string(),
            side: Side::Long,
            quantity: 10,
            entry_price: dec!(100),
            exit_price: dec!(101),
            pnl: dec!(10),
            pnl_percent: dec!(1),
            exit_reason: ExitReason::Target,
            opened_at: at(9, 40),
            closed_at: at(9, 50),
        };
        engine.restore_day(&[closed]);

        let position = Position {
            symbol: "TCS".to_string(),
            exchange: "NSE".to_string(),
            side: Side::Long,
            quantity: 250,
            entry_price: dec!(200),
            stop_loss_price: dec!(198.5),
            target_price: dec!(203),
            entry_order_id: Some("O1".to_string()),
            sl_order_id: Some("O2".to_string()),
            exit_order_id: None,
            exit_reason: None,
            status: PositionStatus::Open,
            opened_at: at(10, 0),
        };
        engine.restore_position(position.clone()).unwrap();
        assert_eq!(engine.trades_today(), 2);
        assert!(engine.symbol_cap_reached("TCS"));

        // Carried over from the previous day: not one of today's trades.
        let mut fresh = BreakoutEngine::new(config(&["TCS"])).unwrap();
        assert!(fresh.reset_session(NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()));
        fresh.restore_position(position).unwrap();
        assert_eq!(fresh.trades_today(), 0);
    }

    #[test]
    fn test_opening_range_outside_band_stays_idle() {
        let mut cfg = config(&["TCS", "INFY", "ITC"]);
        cfg.range_min_pct = Some(dec!(0.1));
        cfg.range_max_pct = Some(dec!(2.5));
        let mut engine = BreakoutEngine::new(cfg).unwrap();
        engine.start();

        let range = |low: Decimal, high: Decimal| {
            let candle = Candle {
                timestamp: at(9, 15),
                open: low,
                high,
                low,
                close: high,
                volume: dec!(1000),
            };
            OpeningRange::from_candles(&[candle]).unwrap()
        };

        // About 0.05% of price: too narrow.
        let narrow = range(dec!(200), dec!(200.1));
        assert!(!engine.freeze_opening_range("TCS", &narrow, at(9, 30)).unwrap());
        assert_eq!(engine.phase("TCS"), Some(SymbolPhase::Idle));
        assert!(!engine.needs_levels("TCS"));

        // About 5% of price: too wide.
        let wide = range(dec!(195), dec!(205));
        assert!(!engine.freeze_opening_range("INFY", &wide, at(9, 30)).unwrap());
        assert_eq!(engine.phase("INFY"), Some(SymbolPhase::Idle));
        assert!(engine.frozen_levels("INFY").is_none());

        let normal = range(dec!(199), dec!(201));
        assert!(engine.freeze_opening_range("ITC", &normal, at(9, 30)).unwrap());
        assert_eq!(engine.phase("ITC"), Some(SymbolPhase::Watching));
        assert!(!engine.needs_levels("ITC"));

        assert!(engine.reset_session(NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()));
        assert!(engine.needs_levels("TCS"));
    }

    #[test]
    fn test_frozen_levels_survive_live_updates() {
        let mut engine = engine(&["TCS"]);
        let live = engine.update_live_levels("TCS", dec!(250));
        assert_eq!(live.buy_trigger, dec!(250.5));
        assert_eq!(engine.frozen_levels("TCS").unwrap().buy_trigger, dec!(199.5));
        assert!(!engine.freeze_levels("TCS", dec!(250), at(10, 0)).unwrap());
        assert_eq!(engine.frozen_levels("TCS").unwrap().buy_trigger, dec!(199.5));
        assert!(matches!(
            engine.freeze_levels("NOPE", dec!(1), at(10, 0)),
            Err(EngineError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_invalid_config_never_builds_engine() {
        let mut cfg = config(&["TCS"]);
        cfg.leverage = Decimal::ZERO;
        assert!(matches!(
            BreakoutEngine::new(cfg),
            Err(ConfigError::Leverage(_))
        ));
    }
}
