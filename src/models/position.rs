//! The engine's in-memory position for a single trade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;
use crate::trading::ExitReason;

/// Lifecycle of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Entry order submitted, fill not yet confirmed.
    PendingEntry,
    /// Entry filled; stop-loss and target are live.
    Open,
    /// Exit order submitted, fill not yet confirmed.
    Exiting,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::PendingEntry => "PENDING_ENTRY",
            PositionStatus::Open => "OPEN",
            PositionStatus::Exiting => "EXITING",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// A position owned by the engine for the lifetime of one trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub stop_loss_price: Decimal,
    pub target_price: Decimal,
    pub entry_order_id: Option<String>,
    /// Protective stop-loss order resting at the broker. `None` while open
    /// means the position is unprotected.
    pub sl_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Whether a protective stop-loss order is resting at the broker.
    pub fn is_protected(&self) -> bool {
        self.sl_order_id.is_some()
    }

    /// Distance between entry and stop, per share.
    pub fn risk_per_share(&self) -> Decimal {
        (self.entry_price - self.stop_loss_price).abs()
    }

    /// Mark-to-market P&L at `price`.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * Decimal::from(self.quantity) * self.side.sign()
    }

    /// Notional value at entry.
    pub fn notional(&self) -> Decimal {
        self.entry_price * Decimal::from(self.quantity)
    }
}
