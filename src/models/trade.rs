//! Trade direction and completed round-trip trade records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Position;
use crate::trading::ExitReason;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Broker transaction type that opens a position on this side.
    pub fn entry_action(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }

    /// Broker transaction type that closes a position on this side.
    pub fn exit_action(&self) -> &'static str {
        match self {
            Side::Long => "SELL",
            Side::Short => "BUY",
        }
    }

    /// +1 for long, -1 for short. Multiplies a price move into P&L.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" | "B" => Some(Side::Long),
            "SHORT" | "SELL" | "S" => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Immutable record of a completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Close out a position at `exit_price`.
    pub fn close(
        position: &Position,
        exit_price: Decimal,
        exit_reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let quantity = Decimal::from(position.quantity);
        let pnl = (exit_price - position.entry_price) * quantity * position.side.sign();
        let cost = position.entry_price * quantity;
        let pnl_percent = if cost.is_zero() {
            Decimal::ZERO
        } else {
            pnl / cost * Decimal::ONE_HUNDRED
        };

        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            pnl_percent,
            exit_reason,
            opened_at: position.opened_at,
            closed_at,
        }
    }

    pub fn is_winner(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}
