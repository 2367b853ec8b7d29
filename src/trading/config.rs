//! Trading configuration.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::SymbolWatch;

/// How far beyond the reference price the triggers sit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BufferMode {
    /// Fraction of the reference price (0.001 = 0.1%).
    Fraction(Decimal),
    /// Absolute price amount.
    Absolute(Decimal),
}

/// How the profit target is derived from the entry. Selected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TargetMode {
    /// Reward = risk × ratio.
    Ratio(Decimal),
    /// Target = entry × (1 ± percent / 100).
    Percent(Decimal),
    /// Fixed rupee profit across the whole quantity.
    Fixed(Decimal),
}

impl std::fmt::Display for TargetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetMode::Ratio(r) => write!(f, "ratio 1:{}", r),
            TargetMode::Percent(p) => write!(f, "{}%", p),
            TargetMode::Fixed(a) => write!(f, "fixed ₹{}", a),
        }
    }
}

/// Exchange session timetable, in exchange-local time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Offset of exchange-local time from UTC, in minutes (IST = 330)
    pub utc_offset_minutes: i32,

    /// Opening window used to freeze the trigger levels
    pub range_start: NaiveTime,
    pub range_end: NaiveTime,

    /// No new automated entries at or after this time
    pub entry_cutoff: Option<NaiveTime>,

    /// Open positions are flattened at this time
    pub square_off: NaiveTime,

    pub market_close: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            range_start: hm(9, 15),
            range_end: hm(9, 30),
            entry_cutoff: Some(hm(10, 45)),
            square_off: hm(15, 25),
            market_close: hm(15, 30),
        }
    }
}

impl SessionConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset())
    }

    /// Whether the opening window has closed, so levels can be frozen.
    pub fn range_complete(&self, now: DateTime<Utc>) -> bool {
        let t = self.local(now).time();
        t >= self.range_end && t < self.market_close
    }

    /// Whether automated entries are allowed at `now`.
    pub fn entries_open(&self, now: DateTime<Utc>) -> bool {
        let t = self.local(now).time();
        let before_cutoff = self.entry_cutoff.map_or(true, |cutoff| t < cutoff);
        t >= self.range_end && t < self.square_off && before_cutoff
    }

    pub fn is_square_off(&self, now: DateTime<Utc>) -> bool {
        self.local(now).time() >= self.square_off
    }

    pub fn is_market_hours(&self, now: DateTime<Utc>) -> bool {
        let t = self.local(now).time();
        t >= self.range_start && t < self.market_close
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// Configuration for sizing, levels, exits and the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Trading capital in INR
    pub capital: Decimal,

    /// Use the broker's live balance instead of `capital` when available
    pub use_broker_margin: bool,

    /// Share of capital committed as margin per trade (0.0 to 1.0)
    pub margin_utilization: Decimal,

    /// Intraday (MIS) leverage multiplier
    pub leverage: Decimal,

    /// Scale capital by leverage when sizing
    pub use_leverage_in_sizing: bool,

    /// Trigger buffer around the reference price
    pub buffer: BufferMode,

    /// Per-share risk unit for the stop distance
    pub position_risk_unit: Decimal,

    /// Stop distance = risk unit × multiplier
    pub stop_multiplier: Decimal,

    /// Profit target derivation
    pub target: TargetMode,

    /// Enter with a limit order at trigger ± limit_order_buffer
    pub use_limit_orders: bool,
    pub limit_order_buffer: Decimal,

    /// Skip symbols whose opening range, as % of VWAP, is narrower than this
    pub range_min_pct: Option<Decimal>,

    /// Skip symbols whose opening range, as % of VWAP, is wider than this
    pub range_max_pct: Option<Decimal>,

    /// Symbols to monitor, in priority order
    pub watchlist: Vec<SymbolWatch>,

    pub session: SessionConfig,

    /// Cadence of breakout detection (seconds)
    pub trigger_poll_secs: u64,

    /// Cadence of exit monitoring while a position is live (seconds)
    pub exit_poll_secs: u64,

    /// Per-call timeout for broker requests (seconds)
    pub request_timeout_secs: u64,

    /// Unfilled entry orders older than this are cancelled (seconds)
    pub entry_order_timeout_secs: u64,

    /// Maximum entries per day across all symbols (None = unlimited)
    pub max_trades_per_day: Option<u32>,

    /// Maximum entries per symbol per day (None = unlimited)
    pub max_trades_per_symbol: Option<u32>,

    /// Realized loss (fraction of capital) that blocks new entries for the day
    pub daily_loss_limit_pct: Option<Decimal>,

    /// Consecutive failed broker calls before reporting ERROR
    pub max_consecutive_failures: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            capital: dec!(20000),
            use_broker_margin: false,
            margin_utilization: dec!(0.5),        // 50% of capital per trade
            leverage: dec!(5),                     // MIS 5x
            use_leverage_in_sizing: true,
            buffer: BufferMode::Fraction(dec!(0.001)),
            position_risk_unit: dec!(1),
            stop_multiplier: dec!(1.5),
            target: TargetMode::Ratio(dec!(2.0)),  // 1:2 risk/reward
            use_limit_orders: false,
            limit_order_buffer: dec!(0.20),
            range_min_pct: None,
            range_max_pct: None,
            watchlist: default_watchlist(),
            session: SessionConfig::default(),
            trigger_poll_secs: 60,
            exit_poll_secs: 15,
            request_timeout_secs: 30,
            entry_order_timeout_secs: 90,
            max_trades_per_day: None,
            max_trades_per_symbol: None,
            daily_loss_limit_pct: Some(dec!(0.02)),
            max_consecutive_failures: 3,
        }
    }
}

fn default_watchlist() -> Vec<SymbolWatch> {
    [
        "TATASTEEL",
        "GOKEX",
        "SILVERBEES",
        "MOTHERSON",
        "ETERNAL",
        "ITBEES",
        "TCS",
        "BAJAJFINSV",
    ]
    .iter()
    .map(|s| SymbolWatch::new(*s, "NSE"))
    .collect()
}

impl TradingConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot trade with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capital <= Decimal::ZERO {
            return Err(ConfigError::Capital(self.capital.to_string()));
        }
        if self.leverage <= Decimal::ZERO {
            return Err(ConfigError::Leverage(self.leverage.to_string()));
        }
        if self.margin_utilization <= Decimal::ZERO || self.margin_utilization > Decimal::ONE {
            return Err(ConfigError::MarginUtilization(
                self.margin_utilization.to_string(),
            ));
        }
        if self.watchlist.is_empty() {
            return Err(ConfigError::EmptyWatchlist);
        }

        let mut seen = HashSet::new();
        for watch in &self.watchlist {
            if watch.symbol.trim().is_empty() || watch.exchange.trim().is_empty() {
                return Err(invalid("watchlist", "symbol and exchange are required"));
            }
            if !seen.insert(watch.symbol.as_str()) {
                return Err(ConfigError::DuplicateSymbol(watch.symbol.clone()));
            }
        }

        match self.buffer {
            BufferMode::Fraction(f) if f < Decimal::ZERO || f >= Decimal::ONE => {
                return Err(invalid("buffer", "fraction must be in [0, 1)"));
            }
            BufferMode::Absolute(a) if a < Decimal::ZERO => {
                return Err(invalid("buffer", "amount must not be negative"));
            }
            _ => {}
        }

        if self.position_risk_unit <= Decimal::ZERO {
            return Err(invalid("position_risk_unit", "must be positive"));
        }
        if self.stop_multiplier <= Decimal::ZERO {
            return Err(invalid("stop_multiplier", "must be positive"));
        }

        let target_value = match self.target {
            TargetMode::Ratio(v) | TargetMode::Percent(v) | TargetMode::Fixed(v) => v,
        };
        if target_value <= Decimal::ZERO {
            return Err(invalid("target", "must be positive"));
        }

        let s = &self.session;
        if !(s.range_start < s.range_end && s.range_end < s.square_off && s.square_off <= s.market_close) {
            return Err(invalid("session", "expected range_start < range_end < square_off <= market_close"));
        }
        if matches!(s.entry_cutoff, Some(cutoff) if cutoff <= s.range_end) {
            return Err(invalid("session.entry_cutoff", "must be after range_end"));
        }
        if matches!(self.daily_loss_limit_pct, Some(pct) if pct <= Decimal::ZERO || pct > Decimal::ONE) {
            return Err(invalid("daily_loss_limit_pct", "must be in (0, 1]"));
        }
        if matches!(self.range_min_pct, Some(pct) if pct < Decimal::ZERO) {
            return Err(invalid("range_min_pct", "must not be negative"));
        }
        if let (Some(min), Some(max)) = (self.range_min_pct, self.range_max_pct) {
            if min > max {
                return Err(invalid("range_max_pct", "must not be below range_min_pct"));
            }
        }
        if self.trigger_poll_secs == 0 || self.exit_poll_secs == 0 {
            return Err(invalid("poll interval", "must be at least one second"));
        }

        Ok(())
    }

    /// Whether an opening range of `range_pct` (% of VWAP) is worth trading.
    pub fn range_in_band(&self, range_pct: Decimal) -> bool {
        !matches!(self.range_min_pct, Some(min) if range_pct < min)
            && !matches!(self.range_max_pct, Some(max) if range_pct > max)
    }

    /// Capital actually deployed per trade before dividing by price.
    pub fn buying_power(&self) -> Decimal {
        let leverage = if self.use_leverage_in_sizing {
            self.leverage
        } else {
            Decimal::ONE
        };
        self.capital * self.margin_utilization * leverage
    }

    pub fn watch(&self, symbol: &str) -> Option<&SymbolWatch> {
        self.watchlist.iter().find(|w| w.symbol == symbol)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
