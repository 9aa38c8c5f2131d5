//! Position models: the levels filled within a cycle and the exchange's view
//! of the open position.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// One martingale fill within the active cycle. Never modified after it is
/// appended to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLevel {
    /// Fill price
    pub price: Decimal,

    /// Margin committed for this level in USDT
    pub margin: Decimal,

    /// Contracts bought at this level
    pub contracts: Decimal,

    /// Index into the martingale sequence (0 = cycle opener)
    pub level_index: usize,

    /// When the order was confirmed
    pub opened_at: DateTime<Utc>,
}

impl PositionLevel {
    pub fn new(price: Decimal, margin: Decimal, contracts: Decimal, level_index: usize) -> Self {
        Self {
            price,
            margin,
            contracts,
            level_index,
            opened_at: Utc::now(),
        }
    }

    /// Notional value of the fill (price x contracts).
    pub fn notional(&self) -> Decimal {
        self.price * self.contracts
    }
}

/// Open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Absolute contract count
    pub size: Decimal,

    pub side: TradeSide,

    /// Exchange-reported average entry
    pub entry_price: Decimal,

    pub mark_price: Decimal,

    pub unrealized_pnl: Decimal,
}

impl ExchangePosition {
    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO
    }
}
