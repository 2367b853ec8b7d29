//! Data models for market data, positions, orders and trade history.

mod market;
mod order;
mod position;
mod trade;

pub use market::{Candle, Ohlc, Quote, SymbolWatch};
pub use order::{OrderIntent, OrderState, OrderTicket, OrderUpdate};
pub use position::{Position, PositionStatus};
pub use trade::{Side, TradeRecord};
