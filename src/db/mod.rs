//! Database persistence for orders, positions, trade history and control requests.
//!
//! Stores everything the dashboard reads and everything needed to resume
//! after a restart:
//! - Bot run state and last reported status
//! - One row per submitted order with its latest known state
//! - The live position (and closed ones, for audit)
//! - One immutable row per completed round trip
//! - Control requests queued by other processes

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::control::{BotStatus, ControlRequest};
use crate::models::{
    OrderIntent, OrderState, OrderUpdate, Position, PositionStatus, Side, TradeRecord,
};
use crate::trading::ExitReason;

/// Where the engine records what it did.
///
/// Failures here are logged by the engine and never change trading state.
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn record_order(&self, order_id: &str, intent: &OrderIntent) -> Result<()>;

    async fn update_order(&self, update: &OrderUpdate) -> Result<()>;

    /// Insert or update the position keyed by its entry order.
    async fn save_position(&self, position: &Position) -> Result<()>;

    async fn record_trade(&self, trade: &TradeRecord) -> Result<()>;
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Bot state stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotState {
    pub id: i64,
    pub is_running: bool,
    pub status: String,
    pub paper: bool,
    pub last_cycle_at: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

/// Stored order record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub order_id: String,
    pub correlation_id: String,
    pub kind: String,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub transaction_type: String,
    pub quantity: i64,
    pub price: String,
    pub status: String,
    pub average_price: Option<String>,
    pub filled_quantity: Option<i64>,
    pub message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub entry_order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub quantity: i64,
    pub entry_price: String,
    pub stop_loss_price: String,
    pub target_price: String,
    pub sl_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub exit_reason: Option<String>,
    pub status: String,
    pub opened_at: String,
    pub updated_at: String,
}

/// Stored round-trip trade.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: i64,
    pub entry_price: String,
    pub exit_price: String,
    pub pnl: String,
    pub pnl_percent: String,
    pub exit_reason: String,
    pub opened_at: String,
    pub closed_at: String,
}

/// Order counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderStats {
    pub total: i64,
    pub filled: i64,
    pub rejected: i64,
    pub pending: i64,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Bot state table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_running INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'IDLE',
                paper INTEGER NOT NULL DEFAULT 0,
                last_cycle_at TEXT,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Submitted orders
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                side TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                average_price TEXT,
                filled_quantity INTEGER,
                message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Positions, keyed by entry order
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                entry_order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss_price TEXT NOT NULL,
                target_price TEXT NOT NULL,
                sl_order_id TEXT,
                exit_order_id TEXT,
                exit_reason TEXT,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Completed round trips
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                pnl TEXT NOT NULL,
                pnl_percent TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Queued control requests
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS control_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                consumed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_closed ON trades(closed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_control_pending ON control_requests(consumed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Bot State ====================

    /// Initialize or get bot state.
    pub async fn init_bot_state(&self, paper: bool) -> Result<BotState> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, is_running, status, paper, started_at, updated_at)
            VALUES (1, 1, 'IDLE', ?, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                is_running = 1,
                status = 'IDLE',
                paper = excluded.paper,
                started_at = datetime('now'),
                updated_at = datetime('now')
            "#,
        )
        .bind(paper)
        .execute(&self.pool)
        .await?;

        self.get_bot_state().await
    }

    /// Get current bot state.
    pub async fn get_bot_state(&self) -> Result<BotState> {
        sqlx::query_as::<_, BotState>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("Bot state not initialized")
    }

    /// Record the status reported after a cycle.
    pub async fn update_bot_state(&self, status: BotStatus, cycle_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bot_state SET
                status = ?,
                last_cycle_at = ?,
                updated_at = datetime('now')
            WHERE id = 1
            "#,
        )
        .bind(status.as_str())
        .bind(ts(cycle_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark bot as stopped.
    pub async fn mark_bot_stopped(&self) -> Result<()> {
        sqlx::query(
            "UPDATE bot_state SET is_running = 0, updated_at = datetime('now') WHERE id = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Positions ====================

    /// The live position left by the last run, if any.
    pub async fn open_position(&self) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, StoredPosition>(
            r#"
            SELECT * FROM positions
            WHERE status IN ('PENDING_ENTRY', 'OPEN', 'EXITING')
            ORDER BY opened_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch open position")?;

        row.map(StoredPosition::into_position).transpose()
    }

    // ==================== Trades ====================

    /// Trades closed at or after `since`, oldest first.
    pub async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trades WHERE closed_at >= ? ORDER BY closed_at ASC",
        )
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(StoredTrade::into_trade).collect()
    }

    /// Most recent trades, newest first.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trades ORDER BY closed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent trades")?;

        rows.into_iter().map(StoredTrade::into_trade).collect()
    }

    // ==================== Orders ====================

    pub async fn get_order(&self, order_id: &str) -> Result<Option<StoredOrder>> {
        sqlx::query_as::<_, StoredOrder>("SELECT * FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch order")
    }

    /// Get order statistics.
    pub async fn order_stats(&self) -> Result<OrderStats> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;

        let (filled,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM orders WHERE status = 'FILLED'")
                .fetch_one(&self.pool)
                .await?;

        let (rejected,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM orders WHERE status = 'REJECTED'")
                .fetch_one(&self.pool)
                .await?;

        let (pending,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM orders WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;

        Ok(OrderStats {
            total,
            filled,
            rejected,
            pending,
        })
    }

    // ==================== Control Requests ====================

    /// Queue a request for the running bot.
    pub async fn enqueue_control(&self, request: &ControlRequest) -> Result<i64> {
        let payload = serde_json::to_string(request)?;
        let result = sqlx::query("INSERT INTO control_requests (payload) VALUES (?)")
            .bind(payload)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Drain queued requests in arrival order, marking them consumed.
    pub async fn take_controls(&self) -> Result<Vec<ControlRequest>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, payload FROM control_requests WHERE consumed_at IS NULL ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            sqlx::query("UPDATE control_requests SET consumed_at = datetime('now') WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            match serde_json::from_str::<ControlRequest>(&payload) {
                Ok(request) => requests.push(request),
                Err(e) => tracing::warn!(id, error = %e, "Dropping malformed control request"),
            }
        }

        tx.commit().await?;
        Ok(requests)
    }
}

#[async_trait]
impl TradeJournal for Database {
    async fn record_order(&self, order_id: &str, intent: &OrderIntent) -> Result<()> {
        let ticket = intent.ticket();
        let now = ts(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, correlation_id, kind, symbol, exchange, side,
                transaction_type, quantity, price, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)
            ON CONFLICT(order_id) DO NOTHING
            "#,
        )
        .bind(order_id)
        .bind(&ticket.correlation_id)
        .bind(intent.kind())
        .bind(&ticket.symbol)
        .bind(&ticket.exchange)
        .bind(ticket.side.as_str())
        .bind(intent.transaction_type())
        .bind(ticket.quantity as i64)
        .bind(ticket.price.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_order(&self, update: &OrderUpdate) -> Result<()> {
        let (average_price, filled_quantity, message) = match &update.state {
            OrderState::Filled {
                average_price,
                filled_quantity,
            } => (Some(average_price.to_string()), Some(*filled_quantity as i64), None),
            OrderState::Cancelled {
                average_price,
                filled_quantity,
            } if *filled_quantity > 0 => {
                (Some(average_price.to_string()), Some(*filled_quantity as i64), None)
            }
            OrderState::Rejected { reason } => (None, None, Some(reason.clone())),
            OrderState::Pending | OrderState::Cancelled { .. } => (None, None, None),
        };

        sqlx::query(
            r#"
            UPDATE orders SET
                status = ?,
                average_price = COALESCE(?, average_price),
                filled_quantity = COALESCE(?, filled_quantity),
                message = COALESCE(?, message),
                updated_at = ?
            WHERE order_id = ?
            "#,
        )
        .bind(update.state.as_str())
        .bind(average_price)
        .bind(filled_quantity)
        .bind(message)
        .bind(ts(Utc::now()))
        .bind(&update.order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let key = position
            .entry_order_id
            .as_deref()
            .ok_or_else(|| anyhow!("position on {} has no entry order", position.symbol))?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                entry_order_id, symbol, exchange, side, quantity, entry_price,
                stop_loss_price, target_price, sl_order_id, exit_order_id,
                exit_reason, status, opened_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entry_order_id) DO UPDATE SET
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                stop_loss_price = excluded.stop_loss_price,
                target_price = excluded.target_price,
                sl_order_id = excluded.sl_order_id,
                exit_order_id = excluded.exit_order_id,
                exit_reason = excluded.exit_reason,
                status = excluded.status,
                opened_at = excluded.opened_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&position.symbol)
        .bind(&position.exchange)
        .bind(position.side.as_str())
        .bind(position.quantity as i64)
        .bind(position.entry_price.to_string())
        .bind(position.stop_loss_price.to_string())
        .bind(position.target_price.to_string())
        .bind(&position.sl_order_id)
        .bind(&position.exit_order_id)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.status.as_str())
        .bind(ts(position.opened_at))
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                symbol, side, quantity, entry_price, exit_price, pnl,
                pnl_percent, exit_reason, opened_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.quantity as i64)
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.pnl.round_dp(2).to_string())
        .bind(trade.pnl_percent.round_dp(4).to_string())
        .bind(trade.exit_reason.as_str())
        .bind(ts(trade.opened_at))
        .bind(ts(trade.closed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl StoredPosition {
    pub fn into_position(self) -> Result<Position> {
        Ok(Position {
            side: parse_side(&self.side)?,
            quantity: self.quantity as u64,
            entry_price: parse_decimal(&self.entry_price)?,
            stop_loss_price: parse_decimal(&self.stop_loss_price)?,
            target_price: parse_decimal(&self.target_price)?,
            exit_reason: self.exit_reason.as_deref().and_then(ExitReason::parse),
            status: parse_position_status(&self.status)?,
            opened_at: parse_ts(&self.opened_at)?,
            entry_order_id: Some(self.entry_order_id),
            sl_order_id: self.sl_order_id,
            exit_order_id: self.exit_order_id,
            symbol: self.symbol,
            exchange: self.exchange,
        })
    }
}

impl StoredTrade {
    pub fn into_trade(self) -> Result<TradeRecord> {
        Ok(TradeRecord {
            side: parse_side(&self.side)?,
            quantity: self.quantity as u64,
            entry_price: parse_decimal(&self.entry_price)?,
            exit_price: parse_decimal(&self.exit_price)?,
            pnl: parse_decimal(&self.pnl)?,
            pnl_percent: parse_decimal(&self.pnl_percent)?,
            exit_reason: ExitReason::parse(&self.exit_reason)
                .ok_or_else(|| anyhow!("unknown exit reason {}", self.exit_reason))?,
            opened_at: parse_ts(&self.opened_at)?,
            closed_at: parse_ts(&self.closed_at)?,
            symbol: self.symbol,
        })
    }
}

/// Fixed-width UTC timestamps so text comparison orders correctly.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {}", s))?
        .with_timezone(&Utc))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    s.parse::<Decimal>()
        .with_context(|| format!("bad decimal {}", s))
}

fn parse_side(s: &str) -> Result<Side> {
    Side::parse(s).ok_or_else(|| anyhow!("unknown side {}", s))
}

fn parse_position_status(s: &str) -> Result<PositionStatus> {
    match s {
        "PENDING_ENTRY" => Ok(PositionStatus::PendingEntry),
        "OPEN" => Ok(PositionStatus::Open),
        "EXITING" => Ok(PositionStatus::Exiting),
        "CLOSED" => Ok(PositionStatus::Closed),
        other => Err(anyhow!("unknown position status {}", other)),
    }
}

#[cfg(test)]
impl Database {
    /// Single-connection in-memory database; every pooled connection to
    /// `sqlite::memory:` would otherwise get its own empty database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }
}
