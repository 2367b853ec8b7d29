//! Broker-agnostic order intents and order updates.
//!
//! The engine only ever speaks in [`OrderIntent`]s; gateways translate them
//! into whatever their broker expects.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Fields shared by every order the engine emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTicket {
    /// Engine-assigned ID linking the order back to the decision that made it.
    pub correlation_id: String,
    pub symbol: String,
    pub exchange: String,
    /// Side of the position this order belongs to (not the transaction side).
    pub side: Side,
    pub quantity: u64,
    /// Reference price: limit/expected fill for entries, trigger for stops.
    pub price: Decimal,
}

/// What the engine wants the gateway to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderIntent {
    /// Open a position. `limit` switches from a market to a limit order.
    Entry { ticket: OrderTicket, limit: bool },
    /// Stop-loss exit. Rests at the broker as SL-M unless `at_market`, which
    /// closes immediately after the stop was breached.
    StopLoss { ticket: OrderTicket, at_market: bool },
    /// Close at market after the target was reached.
    Target { ticket: OrderTicket },
    /// Close at market on request (dashboard, square-off).
    ManualExit { ticket: OrderTicket },
}

impl OrderIntent {
    pub fn ticket(&self) -> &OrderTicket {
        match self {
            OrderIntent::Entry { ticket, .. }
            | OrderIntent::StopLoss { ticket, .. }
            | OrderIntent::Target { ticket }
            | OrderIntent::ManualExit { ticket } => ticket,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrderIntent::Entry { .. } => "ENTRY",
            OrderIntent::StopLoss { .. } => "STOP_LOSS",
            OrderIntent::Target { .. } => "TARGET",
            OrderIntent::ManualExit { .. } => "MANUAL_EXIT",
        }
    }

    /// Broker transaction type: entries follow the position side, everything
    /// else trades against it.
    pub fn transaction_type(&self) -> &'static str {
        match self {
            OrderIntent::Entry { ticket, .. } => ticket.side.entry_action(),
            _ => self.ticket().side.exit_action(),
        }
    }

    /// Whether the order rests at the broker until its trigger is hit.
    pub fn is_resting_stop(&self) -> bool {
        matches!(self, OrderIntent::StopLoss { at_market: false, .. })
    }
}

/// Broker-reported state of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Accepted but not (fully) filled; includes trigger-pending stops.
    Pending,
    Filled {
        average_price: Decimal,
        filled_quantity: u64,
    },
    Rejected {
        reason: String,
    },
    /// Cancelled before completing. `filled_quantity` shares may already
    /// have traded.
    Cancelled {
        average_price: Decimal,
        filled_quantity: u64,
    },
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "PENDING",
            OrderState::Filled { .. } => "FILLED",
            OrderState::Rejected { .. } => "REJECTED",
            OrderState::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Cancelled with nothing filled.
    pub fn cancelled() -> Self {
        OrderState::Cancelled {
            average_price: Decimal::ZERO,
            filled_quantity: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderState::Pending)
    }
}

/// Latest known state of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    #[serde(flatten)]
    pub state: OrderState,
}
