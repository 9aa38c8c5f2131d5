//! Strategy configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::StrategyParams;

/// A configuration value outside its accepted range.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("leverage must be between 1 and 100 (got {0})")]
    Leverage(u32),

    #[error("martingale levels must be between 3 and 20 (got {0})")]
    Levels(usize),

    #[error("balance fraction must be in (0, 0.1] (got {0})")]
    BalanceFraction(Decimal),

    #[error("martingale multiplier must be greater than 1 (got {0})")]
    Multiplier(Decimal),

    #[error("{name} must be positive (got {value})")]
    NotPositive { name: &'static str, value: Decimal },

    #[error("symbol must not be empty")]
    EmptySymbol,
}

/// Configuration for the martingale strategy, shared by every user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Futures leverage applied to every cycle
    pub leverage: u32,

    /// Take-profit threshold on price (percent)
    pub take_profit_pct: Decimal,

    /// Fraction of balance used as the level-0 margin
    pub balance_fraction: Decimal,

    /// Drop from the reference price that triggers a new level (percent)
    pub price_drop_trigger_pct: Decimal,

    /// Margin ratio between consecutive levels
    pub multiplier: Decimal,

    /// Length of the martingale sequence
    pub max_levels: usize,

    /// Smallest balance a new cycle may be opened with (USDT)
    pub min_balance: Decimal,

    /// Balance move that triggers a strategy resize (fraction, 0.01 = 1%)
    pub rebalance_threshold: Decimal,

    /// Balance assumed for a freshly authorized user
    pub placeholder_balance: Decimal,

    /// Unified symbol traded by every user
    pub symbol: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            leverage: 25,
            take_profit_pct: dec!(0.56),          // 0.56% on price, 14% on margin at 25x
            balance_fraction: dec!(0.002),        // 0.2% of balance per base level
            price_drop_trigger_pct: dec!(1.1),    // Add a level every 1.1% drop
            multiplier: dec!(1.35),
            max_levels: 11,
            min_balance: dec!(0.50),
            rebalance_threshold: dec!(0.01),      // Resize on a 1% balance move
            placeholder_balance: dec!(100),
            symbol: "HYPE/USDT:USDT".to_string(),
        }
    }
}

impl StrategyConfig {
    /// Check every bound once, before any user is processed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.leverage) {
            return Err(ConfigError::Leverage(self.leverage));
        }
        if !(3..=20).contains(&self.max_levels) {
            return Err(ConfigError::Levels(self.max_levels));
        }
        if self.balance_fraction <= Decimal::ZERO || self.balance_fraction > dec!(0.1) {
            return Err(ConfigError::BalanceFraction(self.balance_fraction));
        }
        if self.multiplier <= Decimal::ONE {
            return Err(ConfigError::Multiplier(self.multiplier));
        }

        let positive = [
            ("take_profit_pct", self.take_profit_pct),
            ("price_drop_trigger_pct", self.price_drop_trigger_pct),
            ("min_balance", self.min_balance),
            ("rebalance_threshold", self.rebalance_threshold),
            ("placeholder_balance", self.placeholder_balance),
        ];
        for (name, value) in positive {
            if value <= Decimal::ZERO {
                return Err(ConfigError::NotPositive { name, value });
            }
        }

        if self.symbol.trim().is_empty() {
            return Err(ConfigError::EmptySymbol);
        }

        Ok(())
    }

    /// Per-user strategy parameters derived from this configuration.
    pub fn params(&self) -> StrategyParams {
        StrategyParams {
            leverage: self.leverage,
            take_profit_pct: self.take_profit_pct,
            balance_fraction: self.balance_fraction,
            price_drop_trigger_pct: self.price_drop_trigger_pct,
            multiplier: self.multiplier,
            max_levels: self.max_levels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bounds() {
        let config = StrategyConfig { leverage: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::Leverage(0)));

        let config = StrategyConfig { leverage: 101, ..Default::default() };
        assert!(config.validate().is_err());

        let config = StrategyConfig { max_levels: 2, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::Levels(2)));

        let config = StrategyConfig { balance_fraction: dec!(0.1), ..Default::default() };
        assert!(config.validate().is_ok());

        let config = StrategyConfig { balance_fraction: dec!(0.11), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::BalanceFraction(_))));

        let config = StrategyConfig { multiplier: Decimal::ONE, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Multiplier(_))));

        let config = StrategyConfig { min_balance: Decimal::ZERO, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { name: "min_balance", .. })
        ));
    }

    #[test]
    fn test_params_mirror_config() {
        let config = StrategyConfig::default();
        let params = config.params();
        assert_eq!(params.leverage, 25);
        assert_eq!(params.max_levels, 11);
        assert_eq!(params.multiplier, dec!(1.35));
    }
}
