//! Dashboard-facing views and control requests.
//!
//! Views are plain serializable snapshots of engine state. Requests are
//! queued (through the database when they come from another process) and
//! applied at the start of the next evaluation cycle.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Ohlc, Position, Side};
use crate::trading::TradingLevels;

/// Coarse engine status as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BotStatus {
    Idle,
    Watching,
    Open,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Idle => "IDLE",
            BotStatus::Watching => "WATCHING",
            BotStatus::Open => "OPEN",
            BotStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(BotStatus::Idle),
            "WATCHING" => Some(BotStatus::Watching),
            "OPEN" => Some(BotStatus::Open),
            "ERROR" => Some(BotStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// `bot/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub status: BotStatus,
    pub current_position: Option<Position>,
    pub trades_today: u32,
    pub realized_pnl_today: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// One row of `market/watchlist`. Levels are live and for display only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub exchange: String,
    pub last_price: Decimal,
    pub ohlc: Ohlc,
    pub levels: Option<TradingLevels>,
}

/// A request from outside the evaluation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Stop the loop. Pending entries are cancelled; open positions stay.
    Stop,
    /// Close the named position at market.
    ManualExit { symbol: String },
    /// Discretionary entry sized and protected like an automated one.
    ManualTrade { symbol: String, side: Side },
}

impl ControlRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::Stop => "STOP",
            ControlRequest::ManualExit { .. } => "MANUAL_EXIT",
            ControlRequest::ManualTrade { .. } => "MANUAL_TRADE",
        }
    }
}
