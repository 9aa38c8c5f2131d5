//! Structured events emitted by the trading engine.
//!
//! The engine never formats user-facing text; the notification layer renders
//! these payloads.

use rust_decimal::Decimal;
use serde::Serialize;

/// Something a user should hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    CycleStarted {
        price: Decimal,
        amount: Decimal,
        margin: Decimal,
    },
    MartingaleAdded {
        /// 1-based level number (2 = first add)
        level: usize,
        price: Decimal,
        amount: Decimal,
        margin: Decimal,
    },
    CycleCompleted {
        profit_pct: Decimal,
        profit_usd: Decimal,
        amount: Decimal,
        cycle: u32,
    },
    BalanceUpdated {
        old_balance: Decimal,
        new_balance: Decimal,
        old_base: Decimal,
        new_base: Decimal,
    },
    EmergencyClosed {
        amount: Decimal,
        price: Decimal,
        profit_usd: Decimal,
    },
    SafeStopCompleted,
}

impl TradeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TradeEvent::CycleStarted { .. } => "cycle_started",
            TradeEvent::MartingaleAdded { .. } => "martingale_added",
            TradeEvent::CycleCompleted { .. } => "cycle_completed",
            TradeEvent::BalanceUpdated { .. } => "balance_updated",
            TradeEvent::EmergencyClosed { .. } => "emergency_closed",
            TradeEvent::SafeStopCompleted => "safe_stop_completed",
        }
    }
}
