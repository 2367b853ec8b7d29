//! Exit rules: stop-loss and target derivation, and exit detection.
//!
//! Stops sit a fixed risk distance from the fill. Targets are derived from
//! that distance (ratio), from the entry (percent) or from a fixed rupee
//! profit spread over the quantity. When a single evaluation step touches
//! both levels the stop wins.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::{TargetMode, TradingConfig};
use crate::models::{Position, Side};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    Target,
    Manual,
    SessionEnd,
    /// The protective stop order filled at the broker.
    BrokerStopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::Target => "TARGET",
            ExitReason::Manual => "MANUAL",
            ExitReason::SessionEnd => "SESSION_END",
            ExitReason::BrokerStopLoss => "BROKER_STOP_LOSS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "TARGET" => Some(ExitReason::Target),
            "MANUAL" => Some(ExitReason::Manual),
            "SESSION_END" => Some(ExitReason::SessionEnd),
            "BROKER_STOP_LOSS" => Some(ExitReason::BrokerStopLoss),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// An exit condition reached during one evaluation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    /// Level that was reached (the stop or target price itself).
    pub reference_price: Decimal,
}

/// Stop-loss price on the loss side of `entry`.
pub fn stop_loss_price(side: Side, entry: Decimal, risk_unit: Decimal, multiplier: Decimal) -> Decimal {
    entry - side.sign() * risk_unit * multiplier
}

/// Target price on the profit side of `entry`.
pub fn target_price(
    mode: TargetMode,
    side: Side,
    entry: Decimal,
    stop: Decimal,
    quantity: u64,
) -> Decimal {
    let distance = match mode {
        TargetMode::Ratio(ratio) => (entry - stop).abs() * ratio,
        TargetMode::Percent(pct) => entry * pct / Decimal::ONE_HUNDRED,
        TargetMode::Fixed(amount) => {
            if quantity == 0 {
                Decimal::ZERO
            } else {
                amount / Decimal::from(quantity)
            }
        }
    };
    entry + side.sign() * distance
}

/// Check the price path of one evaluation step against a position's levels.
///
/// Any touch of the stop anywhere in the path wins over the target.
pub fn check_exit(position: &Position, path: &[Decimal]) -> Option<ExitTrigger> {
    let (stop_hit, target_hit) = match position.side {
        Side::Long => (
            path.iter().any(|p| *p <= position.stop_loss_price),
            path.iter().any(|p| *p >= position.target_price),
        ),
        Side::Short => (
            path.iter().any(|p| *p >= position.stop_loss_price),
            path.iter().any(|p| *p <= position.target_price),
        ),
    };

    if stop_hit {
        Some(ExitTrigger {
            reason: ExitReason::StopLoss,
            reference_price: position.stop_loss_price,
        })
    } else if target_hit {
        Some(ExitTrigger {
            reason: ExitReason::Target,
            reference_price: position.target_price,
        })
    } else {
        None
    }
}

/// Stop and target derivation bound to one session's configuration.
#[derive(Debug, Clone)]
pub struct ExitRules {
    risk_unit: Decimal,
    stop_multiplier: Decimal,
    target: TargetMode,
}

impl ExitRules {
    pub fn from_config(config: &TradingConfig) -> Self {
        Self {
            risk_unit: config.position_risk_unit,
            stop_multiplier: config.stop_multiplier,
            target: config.target,
        }
    }

    /// (stop_loss_price, target_price) for a fill.
    pub fn protective_levels(&self, side: Side, entry: Decimal, quantity: u64) -> (Decimal, Decimal) {
        let stop = stop_loss_price(side, entry, self.risk_unit, self.stop_multiplier);
        let target = target_price(self.target, side, entry, stop, quantity);
        (stop, target)
    }
}
