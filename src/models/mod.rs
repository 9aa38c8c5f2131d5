//! Data models for user records, position levels and closed trades.

mod position;
mod trade;
mod user;

pub use position::{ExchangePosition, PositionLevel};
pub use trade::{CloseKind, ClosedTrade, TradeSide};
pub use user::{CyclePhase, ExchangeKind, StrategyParams, Transition, UserRecord};
