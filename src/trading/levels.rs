//! VWAP reference price, breakout trigger levels and the per-session level book.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::BufferMode;
use crate::models::{Candle, Ohlc};

/// Volume-weighted average of the typical price.
///
/// Falls back to the last close when the candles carry no volume.
pub fn vwap(candles: &[Candle]) -> Option<Decimal> {
    let last = candles.last()?;

    let (pv, volume) = candles
        .iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(pv, vol), c| {
            (pv + c.typical_price() * c.volume, vol + c.volume)
        });

    if volume.is_zero() {
        return Some(last.close);
    }
    Some(pv / volume)
}

/// Breakout triggers around a reference price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingLevels {
    pub reference_price: Decimal,
    /// Absolute buffer applied on either side of the reference.
    pub buffer: Decimal,
    pub buy_trigger: Decimal,
    pub sell_trigger: Decimal,
}

impl TradingLevels {
    pub fn compute(reference_price: Decimal, mode: BufferMode) -> Self {
        let buffer = match mode {
            BufferMode::Fraction(f) => reference_price * f,
            BufferMode::Absolute(a) => a,
        };
        Self {
            reference_price,
            buffer,
            buy_trigger: reference_price + buffer,
            sell_trigger: reference_price - buffer,
        }
    }

    /// Whether `price` sits inside the band (neither trigger crossed).
    pub fn contains(&self, price: Decimal) -> bool {
        price <= self.buy_trigger && price >= self.sell_trigger
    }
}

/// OHLC and VWAP across the opening window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub ohlc: Ohlc,
    pub vwap: Decimal,
    pub volume: Decimal,
}

impl OpeningRange {
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        let valid: Vec<Candle> = candles.iter().filter(|c| c.is_valid()).cloned().collect();
        let first = valid.first()?;
        let last = valid.last()?;

        let high = valid.iter().map(|c| c.high).max()?;
        let low = valid.iter().map(|c| c.low).min()?;
        let volume = valid.iter().map(|c| c.volume).sum();

        Some(Self {
            ohlc: Ohlc {
                open: first.open,
                high,
                low,
                close: last.close,
            },
            vwap: vwap(&valid)?,
            volume,
        })
    }

    /// Width of the range as a percentage of VWAP.
    pub fn range_pct(&self) -> Decimal {
        if self.vwap.is_zero() {
            return Decimal::ZERO;
        }
        (self.ohlc.high - self.ohlc.low) / self.vwap * Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone)]
struct FrozenLevels {
    levels: TradingLevels,
    frozen_at: DateTime<Utc>,
}

/// Per-symbol levels for one session.
///
/// Frozen levels are what the engine trades against and are set at most once
/// per session. Live levels are recomputed on every refresh and exist for
/// display only.
#[derive(Debug, Default)]
pub struct LevelBook {
    frozen: HashMap<String, FrozenLevels>,
    live: HashMap<String, TradingLevels>,
}

impl LevelBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze levels for `symbol`. Returns false (and keeps the existing
    /// levels) if the symbol was already frozen this session.
    pub fn freeze(&mut self, symbol: &str, levels: TradingLevels, at: DateTime<Utc>) -> bool {
        if let Some(existing) = self.frozen.get(symbol) {
            warn!(
                symbol = %symbol,
                frozen_at = %existing.frozen_at,
                "Levels already frozen for session, ignoring update"
            );
            return false;
        }
        debug!(
            symbol = %symbol,
            buy = %levels.buy_trigger,
            sell = %levels.sell_trigger,
            "Levels frozen"
        );
        self.frozen.insert(
            symbol.to_string(),
            FrozenLevels {
                levels,
                frozen_at: at,
            },
        );
        true
    }

    pub fn frozen(&self, symbol: &str) -> Option<&TradingLevels> {
        self.frozen.get(symbol).map(|f| &f.levels)
    }

    pub fn is_frozen(&self, symbol: &str) -> bool {
        self.frozen.contains_key(symbol)
    }

    pub fn update_live(&mut self, symbol: &str, levels: TradingLevels) {
        self.live.insert(symbol.to_string(), levels);
    }

    pub fn live(&self, symbol: &str) -> Option<&TradingLevels> {
        self.live.get(symbol)
    }

    /// Drop everything at a session boundary.
    pub fn clear(&mut self) {
        self.frozen.clear();
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn test_vwap_weights_by_volume() {
        let candles = vec![
            candle(dec!(102), dec!(98), dec!(100), dec!(100)), // typical 100
            candle(dec!(112), dec!(108), dec!(110), dec!(300)), // typical 110
        ];
        assert_eq!(vwap(&candles), Some(dec!(107.5)));
    }

    #[test]
    fn test_vwap_without_volume_uses_last_close() {
        let candles = vec![
            candle(dec!(102), dec!(98), dec!(100), Decimal::ZERO),
            candle(dec!(106), dec!(101), dec!(105), Decimal::ZERO),
        ];
        assert_eq!(vwap(&candles), Some(dec!(105)));
        assert_eq!(vwap(&[]), None);
    }

    #[test]
    fn test_levels_fraction_and_absolute() {
        let pct = TradingLevels::compute(dec!(200), BufferMode::Fraction(dec!(0.001)));
        assert_eq!(pct.buy_trigger, dec!(200.2));
        assert_eq!(pct.sell_trigger, dec!(199.8));

        let abs = TradingLevels::compute(dec!(200), BufferMode::Absolute(dec!(1.5)));
        assert_eq!(abs.buy_trigger, dec!(201.5));
        assert_eq!(abs.sell_trigger, dec!(198.5));
        assert!(abs.contains(dec!(200)));
        assert!(!abs.contains(dec!(201.6)));
    }

    #[test]
    fn test_opening_range() {
        let candles = vec![
            candle(dec!(102), dec!(98), dec!(100), dec!(100)),
            candle(dec!(112), dec!(108), dec!(110), dec!(300)),
        ];
        let range = OpeningRange::from_candles(&candles).unwrap();
        assert_eq!(range.ohlc.high, dec!(112));
        assert_eq!(range.ohlc.low, dec!(98));
        assert_eq!(range.ohlc.close, dec!(110));
        assert_eq!(range.volume, dec!(400));
        assert_eq!(range.vwap, dec!(107.5));
        assert!(OpeningRange::from_candles(&[]).is_none());
    }

    #[test]
    fn test_frozen_levels_ignore_later_updates() {
        let mut book = LevelBook::new();
        let first = TradingLevels::compute(dec!(100), BufferMode::Absolute(dec!(1)));
        let second = TradingLevels::compute(dec!(120), BufferMode::Absolute(dec!(1)));

        assert!(book.freeze("TCS", first, Utc::now()));
        assert!(!book.freeze("TCS", second, Utc::now()));
        assert_eq!(book.frozen("TCS"), Some(&first));

        // Live levels move freely without touching the frozen ones.
        book.update_live("TCS", second);
        assert_eq!(book.live("TCS"), Some(&second));
        assert_eq!(book.frozen("TCS"), Some(&first));

        book.clear();
        assert!(!book.is_frozen("TCS"));
    }
}
