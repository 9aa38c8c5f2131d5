//! Per-user trading record: identity, strategy parameters, the active cycle
//! and its accounting.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ClosedTrade, PositionLevel};
use crate::trading::calculator;

/// Supported derivatives exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Bybit,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::Bybit => "bybit",
        }
    }

    /// Quantity precision (decimal places) accepted for the traded contract.
    pub fn amount_precision(&self) -> u32 {
        match self {
            ExchangeKind::Binance => 6,
            ExchangeKind::Bybit => 4,
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(ExchangeKind::Binance),
            "bybit" => Ok(ExchangeKind::Bybit),
            other => anyhow::bail!("Unsupported exchange: {}", other),
        }
    }
}

/// Strategy knobs applied to one user's cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Futures leverage (1..=100)
    pub leverage: u32,

    /// Take-profit threshold on price, in percent
    pub take_profit_pct: Decimal,

    /// Fraction of balance used as the level-0 margin
    pub balance_fraction: Decimal,

    /// Price drop from the reference that adds a level, in percent
    pub price_drop_trigger_pct: Decimal,

    /// Geometric ratio between consecutive level margins
    pub multiplier: Decimal,

    /// Number of levels in the martingale sequence
    pub max_levels: usize,
}

/// Transition currently being executed against the exchange.
///
/// Lives only in memory; a record loaded from storage never carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opening,
    Adding,
    Closing,
}

/// Macro-state of a user's cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Opening,
    Active,
    Closing,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Opening => "opening",
            CyclePhase::Active => "active",
            CyclePhase::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Everything the bot knows about one authorized user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub first_name: Option<String>,

    /// Exchange chosen during setup
    #[serde(default)]
    pub exchange: Option<ExchangeKind>,

    /// Unified symbol, e.g. `HYPE/USDT:USDT`
    pub symbol: String,

    pub params: StrategyParams,

    // Derived strategy state
    pub base_amount: Decimal,
    pub martingale_sequence: Vec<Decimal>,

    // Position state
    pub is_active: bool,
    pub current_step: usize,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub position_levels: Vec<PositionLevel>,
    #[serde(default)]
    pub martingale_trigger_prices: Vec<Decimal>,

    // Control
    pub setup_complete: bool,
    pub trading_enabled: bool,
    pub safe_stop_requested: bool,
    #[serde(skip)]
    pub in_flight: Option<Transition>,

    // Accounting
    pub cycle_count: u32,
    pub total_trades: u32,
    pub total_profit: Decimal,
    #[serde(default)]
    pub closed_trades: Vec<ClosedTrade>,
    pub starting_balance: Decimal,
    pub current_balance: Decimal,

    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub last_balance_update: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Create a fresh record with a strategy sized from a placeholder balance.
    ///
    /// `current_balance` starts at zero so the first processing pass always
    /// resizes the strategy from the real exchange balance.
    pub fn new(user_id: i64, symbol: &str, params: StrategyParams, placeholder_balance: Decimal) -> Self {
        let base_amount = calculator::base_amount(placeholder_balance, params.balance_fraction);
        let martingale_sequence =
            calculator::martingale_sequence(base_amount, params.multiplier, params.max_levels);
        let now = Utc::now();

        Self {
            user_id,
            username: None,
            first_name: None,
            exchange: None,
            symbol: symbol.to_string(),
            params,
            base_amount,
            martingale_sequence,
            is_active: false,
            current_step: 0,
            entry_price: None,
            position_levels: Vec::new(),
            martingale_trigger_prices: Vec::new(),
            setup_complete: false,
            trading_enabled: false,
            safe_stop_requested: false,
            in_flight: None,
            cycle_count: 0,
            total_trades: 0,
            total_profit: Decimal::ZERO,
            closed_trades: Vec::new(),
            starting_balance: Decimal::ZERO,
            current_balance: Decimal::ZERO,
            created_at: now,
            last_active: now,
            last_balance_update: None,
        }
    }

    /// Whether an order for this user is currently in flight.
    pub fn trade_in_progress(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn phase(&self) -> CyclePhase {
        match (self.in_flight, self.is_active) {
            (Some(Transition::Opening), _) => CyclePhase::Opening,
            (Some(Transition::Closing), _) => CyclePhase::Closing,
            (_, true) => CyclePhase::Active,
            (_, false) => CyclePhase::Idle,
        }
    }

    pub fn weighted_entry(&self) -> Option<Decimal> {
        calculator::weighted_average_entry(&self.position_levels)
    }

    pub fn total_margin(&self) -> Decimal {
        self.position_levels.iter().map(|l| l.margin).sum()
    }

    pub fn total_contracts(&self) -> Decimal {
        self.position_levels.iter().map(|l| l.contracts).sum()
    }

    /// Price the next martingale drop is measured from: the cycle entry while
    /// on level 0, otherwise the price of the most recent add.
    pub fn reference_price(&self) -> Option<Decimal> {
        if self.current_step == 0 {
            self.entry_price
        } else {
            self.martingale_trigger_prices.last().copied().or(self.entry_price)
        }
    }

    /// Margin of the next level, if the sequence has one left.
    pub fn next_level_margin(&self) -> Option<Decimal> {
        self.martingale_sequence.get(self.current_step + 1).copied()
    }

    pub fn at_last_level(&self) -> bool {
        self.current_step + 1 >= self.martingale_sequence.len()
    }

    /// Reset every active-cycle field back to its idle default.
    pub fn reset_cycle(&mut self) {
        self.is_active = false;
        self.current_step = 0;
        self.entry_price = None;
        self.position_levels.clear();
        self.martingale_trigger_prices.clear();
    }

    /// Replace the strategy sizing, keeping the levels already used in an
    /// active cycle.
    pub fn apply_sizing(&mut self, new_base: Decimal) {
        self.base_amount = new_base;
        self.martingale_sequence = if self.is_active {
            calculator::rebase_sequence(
                &self.martingale_sequence,
                self.current_step + 1,
                new_base,
                self.params.multiplier,
                self.params.max_levels,
            )
        } else {
            calculator::martingale_sequence(new_base, self.params.multiplier, self.params.max_levels)
        };
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_active
    }

    pub fn display_name(&self) -> String {
        self.username
            .as_ref()
            .map(|u| format!("@{}", u))
            .or_else(|| self.first_name.clone())
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_params() -> StrategyParams {
        StrategyParams {
            leverage: 25,
            take_profit_pct: dec!(0.56),
            balance_fraction: dec!(0.002),
            price_drop_trigger_pct: dec!(1.1),
            multiplier: dec!(1.35),
            max_levels: 11,
        }
    }

    #[test]
    fn test_new_record_defaults() {
        let record = UserRecord::new(42, "HYPE/USDT:USDT", make_params(), dec!(100));
        assert_eq!(record.base_amount, dec!(0.2));
        assert_eq!(record.martingale_sequence.len(), 11);
        assert_eq!(record.martingale_sequence[1], dec!(0.27));
        assert_eq!(record.current_balance, Decimal::ZERO);
        assert_eq!(record.phase(), CyclePhase::Idle);
        assert!(!record.trade_in_progress());
        assert!(!record.trading_enabled);
    }

    #[test]
    fn test_reference_price() {
        let mut record = UserRecord::new(1, "HYPE/USDT:USDT", make_params(), dec!(100));
        assert_eq!(record.reference_price(), None);

        record.is_active = true;
        record.entry_price = Some(dec!(100));
        assert_eq!(record.reference_price(), Some(dec!(100)));

        record.current_step = 1;
        record.martingale_trigger_prices.push(dec!(98.8));
        assert_eq!(record.reference_price(), Some(dec!(98.8)));
    }

    #[test]
    fn test_in_flight_is_not_persisted() {
        let mut record = UserRecord::new(7, "HYPE/USDT:USDT", make_params(), dec!(100));
        record.in_flight = Some(Transition::Opening);
        assert_eq!(record.phase(), CyclePhase::Opening);

        let json = serde_json::to_string(&record).unwrap();
        let restored: UserRecord = serde_json::from_str(&json).unwrap();
        assert!(restored.in_flight.is_none());
        assert_eq!(restored.martingale_sequence, record.martingale_sequence);
    }

    #[test]
    fn test_apply_sizing_keeps_used_levels() {
        let mut record = UserRecord::new(3, "HYPE/USDT:USDT", make_params(), dec!(100));
        record.is_active = true;
        record.current_step = 2;
        let used: Vec<Decimal> = record.martingale_sequence[..3].to_vec();

        record.apply_sizing(dec!(0.1));
        assert_eq!(&record.martingale_sequence[..3], used.as_slice());
        assert_eq!(record.martingale_sequence.len(), 11);
        assert!(record.martingale_sequence.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_exchange_kind_parse() {
        assert_eq!("Binance".parse::<ExchangeKind>().unwrap(), ExchangeKind::Binance);
        assert_eq!(" bybit ".parse::<ExchangeKind>().unwrap(), ExchangeKind::Bybit);
        assert!("kraken".parse::<ExchangeKind>().is_err());
        assert_eq!(ExchangeKind::Bybit.amount_precision(), 4);
    }
}
