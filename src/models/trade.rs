//! Trade direction and the closing-trade history kept on each user record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ExchangeKind;

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Side of the order that reduces a position held on this side.
    pub fn opposite(&self) -> TradeSide {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseKind {
    /// Take-profit close of the whole position
    TakeProfit,
    /// Forced flatten requested by the user or the operator
    Emergency,
}

impl CloseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseKind::TakeProfit => "close_all_tp",
            CloseKind::Emergency => "emergency_close",
        }
    }
}

/// Historical record appended when a position is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// Owner of the record
    pub user_id: i64,

    pub kind: CloseKind,

    pub timestamp: DateTime<Utc>,

    /// Fill price of the reduce-only sell
    pub price: Decimal,

    /// Contracts closed (exchange-reported size)
    pub amount: Decimal,

    /// Sum of the margins of all levels in the cycle
    pub margin_used: Decimal,

    /// Realized profit in USDT
    pub profit_usd: Decimal,

    /// Price move from the weighted entry, in percent
    pub profit_pct: Decimal,

    /// 1-based number of the cycle this close ended
    pub cycle_number: u32,

    /// Balance after the close, when it could be read
    #[serde(default)]
    pub balance_after: Option<Decimal>,

    pub exchange: Option<ExchangeKind>,

    pub symbol: String,
}
