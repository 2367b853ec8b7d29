//! Market data: watched symbols, candles and quotes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A symbol on the static watchlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolWatch {
    pub symbol: String,
    pub exchange: String,
}

impl SymbolWatch {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    /// Broker instrument key, e.g. `NSE:TATASTEEL`.
    pub fn instrument_key(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }
}

/// Open/high/low/close prices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Typical price, (H + L + C) / 3.
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    /// A bar is usable when its range is positive and ordered.
    pub fn is_valid(&self) -> bool {
        self.low > Decimal::ZERO && self.high >= self.low
    }
}

/// A single market observation for a symbol.
///
/// Several quotes for the same symbol passed to one evaluation cycle form the
/// price path of that step, in the order observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: Decimal,
    #[serde(default)]
    pub ohlc: Ohlc,
    #[serde(default)]
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn new(symbol: impl Into<String>, last_price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            ohlc: Ohlc::default(),
            volume: Decimal::ZERO,
            timestamp,
        }
    }
}
