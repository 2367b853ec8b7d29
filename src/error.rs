//! Error taxonomy for the decision engine and its collaborators.
//!
//! The engine never fails a cycle on a broker or data hiccup: these errors are
//! classified so the engine can keep its prior state and retry next cycle.
//! Only configuration errors are fatal, and only at startup.

use thiserror::Error;

/// Market data could not be obtained for this cycle.
#[derive(Debug, Error)]
pub enum DataFetchError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no data for {0}")]
    Missing(String),
}

/// Failure talking to the order gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The broker explicitly declined the order.
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("gateway timed out after {0}s")]
    Timeout(u64),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("unknown order {0}")]
    UnknownOrder(String),
}

impl GatewayError {
    /// Whether the broker declined the request, as opposed to the call failing.
    pub fn is_rejection(&self) -> bool {
        matches!(self, GatewayError::Rejected(_))
    }
}

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("capital must be positive, got {0}")]
    Capital(String),

    #[error("leverage must be positive, got {0}")]
    Leverage(String),

    #[error("margin utilization must be in (0, 1], got {0}")]
    MarginUtilization(String),

    #[error("watchlist is empty")]
    EmptyWatchlist,

    #[error("symbol listed twice: {0}")]
    DuplicateSymbol(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),
}

/// Errors surfaced by engine operations invoked from outside the cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("symbol {0} is not on the watchlist")]
    UnknownSymbol(String),

    #[error("a position is already live on {0}")]
    SlotOccupied(String),

    #[error("no live position on {0}")]
    NoPosition(String),

    #[error("no price observed for {0} yet")]
    NoPrice(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Data(#[from] DataFetchError),
}
