//! Trading logic: configuration, sizing, levels, exit rules and the breakout engine.

mod config;
mod engine;
mod levels;
mod position_sizer;
mod strategy;

pub use config::{BufferMode, SessionConfig, TargetMode, TradingConfig};
pub use engine::{BreakoutEngine, CycleReport, SymbolPhase};
pub use levels::{vwap, LevelBook, OpeningRange, TradingLevels};
pub use position_sizer::{PositionSizer, Sizing};
pub use strategy::{check_exit, stop_loss_price, target_price, ExitReason, ExitRules, ExitTrigger};
