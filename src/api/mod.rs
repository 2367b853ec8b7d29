//! Broker collaborators: market data and order execution.

mod kite_client;
mod paper;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{DataFetchError, GatewayError};
use crate::models::{Candle, OrderIntent, OrderUpdate, Quote, SymbolWatch};

pub use kite_client::{KiteClient, KITE_URL};
pub use paper::PaperGateway;
pub use types::*;

/// Source of quotes, candles and account margin.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn quote(&self, watch: &SymbolWatch) -> Result<Quote, DataFetchError>;

    /// Candles in `[from, to]` at a broker interval such as `"minute"` or `"15minute"`.
    async fn candles(
        &self,
        watch: &SymbolWatch,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
    ) -> Result<Vec<Candle>, DataFetchError>;

    /// Live equity balance available for new positions.
    async fn available_margin(&self) -> Result<Decimal, DataFetchError>;
}

/// Accepts order intents and reports their state.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit an order, returning the gateway-assigned order ID.
    async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, GatewayError>;

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError>;
}
