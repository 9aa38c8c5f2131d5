//! Trading logic: martingale math, strategy configuration and the per-user
//! cycle state machine.

pub mod calculator;
mod config;
mod engine;
mod events;

pub use config::{ConfigError, StrategyConfig};
pub use engine::{PassAction, PassReport, TradingEngine, TradingStatus, TransitionError};
pub use events::TradeEvent;
