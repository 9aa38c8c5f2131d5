//! Pricing and sizing math for the martingale strategy.
//!
//! Everything here is pure: no I/O, no configuration lookups. Degenerate
//! input yields `None` (or a typed validation error) rather than a panic.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::models::PositionLevel;

const MARGIN_DP: u32 = 4;
const CONTRACTS_DP: u32 = 6;

/// Why a trade was refused before reaching the exchange.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeValidationError {
    #[error("invalid balance: {0}")]
    InvalidBalance(Decimal),

    #[error("invalid margin amount: {0}")]
    InvalidMargin(Decimal),

    #[error("insufficient balance for margin: need {margin}, have {balance}")]
    InsufficientMargin { margin: Decimal, balance: Decimal },

    #[error("invalid leverage: {0}")]
    InvalidLeverage(u32),

    #[error("invalid price: {0}")]
    InvalidPrice(Decimal),
}

fn round(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Margin amounts for each level: term `i` is `base * multiplier^i`, rounded
/// to 4 places.
pub fn martingale_sequence(base_amount: Decimal, multiplier: Decimal, levels: usize) -> Vec<Decimal> {
    let mut factor = Decimal::ONE;
    let mut sequence = Vec::with_capacity(levels);

    for _ in 0..levels {
        sequence.push(round(base_amount * factor, MARGIN_DP));
        factor *= multiplier;
    }

    sequence
}

/// Recompute a sequence from a new base while keeping the first `used` terms.
///
/// The tail is regenerated from `new_base`. If that tail would not continue
/// strictly above the last used level, it instead grows geometrically from
/// that level. The result always has `levels` terms.
pub fn rebase_sequence(
    current: &[Decimal],
    used: usize,
    new_base: Decimal,
    multiplier: Decimal,
    levels: usize,
) -> Vec<Decimal> {
    let used = used.min(current.len()).min(levels);
    if used == 0 {
        return martingale_sequence(new_base, multiplier, levels);
    }

    let mut sequence = current[..used].to_vec();
    let fresh = martingale_sequence(new_base, multiplier, levels);
    let last_used = sequence[used - 1];

    if fresh.get(used).map_or(true, |next| *next > last_used) {
        sequence.extend_from_slice(&fresh[used..]);
    } else {
        let mut factor = multiplier;
        for _ in used..levels {
            sequence.push(round(last_used * factor, MARGIN_DP));
            factor *= multiplier;
        }
    }

    sequence
}

/// Level-0 margin: `balance * fraction`, rounded to 4 places.
pub fn base_amount(balance: Decimal, fraction: Decimal) -> Decimal {
    round(balance * fraction, MARGIN_DP)
}

/// Contracts bought with `margin` at `leverage`, rounded to 6 places.
/// `None` when the price is not positive.
pub fn position_size(margin: Decimal, leverage: u32, price: Decimal) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    Some(round(margin * Decimal::from(leverage) / price, CONTRACTS_DP))
}

/// Contract-weighted mean entry across all levels.
pub fn weighted_average_entry(levels: &[PositionLevel]) -> Option<Decimal> {
    let contracts: Decimal = levels.iter().map(|l| l.contracts).sum();
    if levels.is_empty() || contracts <= Decimal::ZERO {
        return None;
    }

    let notional: Decimal = levels.iter().map(PositionLevel::notional).sum();
    Some(notional / contracts)
}

/// Percent move from `entry` to `current`.
pub fn profit_percentage(current: Decimal, entry: Decimal) -> Option<Decimal> {
    if entry <= Decimal::ZERO {
        return None;
    }
    Some((current - entry) / entry * dec!(100))
}

/// Return on margin in percent.
pub fn margin_return(profit_pct: Decimal, leverage: u32) -> Decimal {
    profit_pct * Decimal::from(leverage)
}

/// Realized USD profit for a close: total margin times the margin return.
pub fn realized_profit(total_margin: Decimal, profit_pct: Decimal, leverage: u32) -> Decimal {
    total_margin * margin_return(profit_pct, leverage) / dec!(100)
}

/// True once price sits at least `threshold` percent above the average entry.
pub fn should_take_profit(current: Decimal, avg_entry: Decimal, threshold: Decimal) -> bool {
    profit_percentage(current, avg_entry).is_some_and(|pct| pct >= threshold)
}

/// True once price has fallen past `drop_trigger` percent below `reference`.
///
/// The comparison is strict: a drop of exactly the trigger does not add a level.
pub fn should_add_level(current: Decimal, reference: Decimal, drop_trigger: Decimal) -> bool {
    if reference <= Decimal::ZERO {
        return false;
    }
    (reference - current) / reference * dec!(100) > drop_trigger
}

/// Reject trades that cannot be placed, with the specific reason.
pub fn validate_trade_parameters(
    balance: Decimal,
    margin: Decimal,
    leverage: u32,
    price: Decimal,
) -> Result<(), TradeValidationError> {
    if balance <= Decimal::ZERO {
        return Err(TradeValidationError::InvalidBalance(balance));
    }
    if margin <= Decimal::ZERO {
        return Err(TradeValidationError::InvalidMargin(margin));
    }
    if margin > balance {
        return Err(TradeValidationError::InsufficientMargin { margin, balance });
    }
    if !(1..=100).contains(&leverage) {
        return Err(TradeValidationError::InvalidLeverage(leverage));
    }
    if price <= Decimal::ZERO {
        return Err(TradeValidationError::InvalidPrice(price));
    }
    Ok(())
}

/// Margin needed to fill every level of the sequence.
pub fn total_risk(sequence: &[Decimal]) -> Decimal {
    sequence.iter().copied().sum()
}

/// How many times the balance covers the full sequence. `None` for zero risk.
pub fn safety_ratio(balance: Decimal, total_risk: Decimal) -> Option<Decimal> {
    if total_risk <= Decimal::ZERO {
        return None;
    }
    Some(balance / total_risk)
}

/// Balance growth since the first recorded balance, in percent.
pub fn roi(current_balance: Decimal, starting_balance: Decimal) -> Decimal {
    if starting_balance <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (current_balance - starting_balance) / starting_balance * dec!(100)
}

/// Whether a balance moved enough from the last recorded one to resize the
/// strategy. The denominator is floored at 1 so a zero starting point always
/// counts as a move.
pub fn balance_moved(last: Decimal, current: Decimal, threshold: Decimal) -> bool {
    let denominator = last.max(Decimal::ONE);
    (current - last).abs() / denominator >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: Decimal, contracts: Decimal) -> PositionLevel {
        PositionLevel::new(price, dec!(1), contracts, 0)
    }

    #[test]
    fn test_base_amount() {
        assert_eq!(base_amount(dec!(100), dec!(0.002)), dec!(0.2));
        assert_eq!(base_amount(dec!(123.45678), dec!(0.002)), dec!(0.2469));
        assert_eq!(base_amount(dec!(1000), dec!(0.1)), dec!(100));
    }

    #[test]
    fn test_martingale_sequence() {
        let seq = martingale_sequence(dec!(0.2), dec!(1.35), 11);
        assert_eq!(seq.len(), 11);
        assert_eq!(seq[0], dec!(0.2));
        assert_eq!(seq[1], dec!(0.27));
        assert_eq!(seq[2], dec!(0.3645));
        // 0.2 * 1.35^3 = 0.492075
        assert_eq!(seq[3], dec!(0.4921));
        assert!(seq.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sequence_terms_use_unrounded_powers() {
        let base = dec!(1.2345);
        let seq = martingale_sequence(base, dec!(1.35), 5);
        let mut factor = Decimal::ONE;
        for term in &seq {
            assert_eq!(*term, round(base * factor, 4));
            factor *= dec!(1.35);
        }
    }

    #[test]
    fn test_rebase_keeps_used_levels() {
        let current = martingale_sequence(dec!(0.2), dec!(1.35), 11);

        // Balance dropped: the fresh tail would restart below the last used level.
        let rebased = rebase_sequence(&current, 3, dec!(0.1), dec!(1.35), 11);
        assert_eq!(rebased.len(), 11);
        assert_eq!(&rebased[..3], &current[..3]);
        assert_eq!(rebased[3], round(current[2] * dec!(1.35), 4));
        assert!(rebased.windows(2).all(|w| w[0] < w[1]));

        // Balance grew: the fresh tail already sits above the used levels.
        let rebased = rebase_sequence(&current, 2, dec!(0.4), dec!(1.35), 11);
        let fresh = martingale_sequence(dec!(0.4), dec!(1.35), 11);
        assert_eq!(&rebased[..2], &current[..2]);
        assert_eq!(&rebased[2..], &fresh[2..]);
    }

    #[test]
    fn test_rebase_without_used_levels() {
        let current = martingale_sequence(dec!(0.2), dec!(1.35), 5);
        let rebased = rebase_sequence(&current, 0, dec!(0.3), dec!(1.35), 5);
        assert_eq!(rebased, martingale_sequence(dec!(0.3), dec!(1.35), 5));
    }

    #[test]
    fn test_position_size() {
        assert_eq!(position_size(dec!(0.2), 25, dec!(100)), Some(dec!(0.05)));
        // 0.27 * 25 / 98.8 = 0.0683198...
        assert_eq!(position_size(dec!(0.27), 25, dec!(98.8)), Some(dec!(0.068320)));
        assert_eq!(position_size(dec!(0.2), 25, Decimal::ZERO), None);
        assert_eq!(position_size(dec!(0.2), 25, dec!(-1)), None);
    }

    #[test]
    fn test_weighted_average_entry() {
        assert_eq!(weighted_average_entry(&[]), None);
        let levels = [level(dec!(100), dec!(1)), level(dec!(90), dec!(1))];
        assert_eq!(weighted_average_entry(&levels), Some(dec!(95)));

        let levels = [level(dec!(100), dec!(1)), level(dec!(90), dec!(3))];
        assert_eq!(weighted_average_entry(&levels), Some(dec!(92.5)));

        let empty_contracts = [level(dec!(100), Decimal::ZERO)];
        assert_eq!(weighted_average_entry(&empty_contracts), None);
    }

    #[test]
    fn test_profit_math() {
        assert_eq!(profit_percentage(dec!(101), dec!(100)), Some(dec!(1)));
        assert_eq!(profit_percentage(dec!(101), Decimal::ZERO), None);
        assert_eq!(margin_return(dec!(0.56), 25), dec!(14));
        assert_eq!(realized_profit(dec!(0.2), dec!(0.56), 25), dec!(0.028));
    }

    #[test]
    fn test_take_profit_boundary() {
        assert!(should_take_profit(dec!(100.56), dec!(100), dec!(0.56)));
        assert!(!should_take_profit(dec!(100.55), dec!(100), dec!(0.56)));
        assert!(!should_take_profit(dec!(100.56), Decimal::ZERO, dec!(0.56)));
    }

    #[test]
    fn test_add_level_boundary() {
        assert!(should_add_level(dec!(98.89), dec!(100), dec!(1.1)));
        assert!(!should_add_level(dec!(98.9), dec!(100), dec!(1.1)));
        assert!(should_add_level(dec!(98.8), dec!(100), dec!(1.1)));
        assert!(!should_add_level(dec!(101), dec!(100), dec!(1.1)));
        assert!(!should_add_level(dec!(50), Decimal::ZERO, dec!(1.1)));
    }

    #[test]
    fn test_validate_trade_parameters() {
        assert!(validate_trade_parameters(dec!(100), dec!(0.2), 25, dec!(40)).is_ok());
        assert_eq!(
            validate_trade_parameters(Decimal::ZERO, dec!(0.2), 25, dec!(40)),
            Err(TradeValidationError::InvalidBalance(Decimal::ZERO))
        );
        assert_eq!(
            validate_trade_parameters(dec!(100), Decimal::ZERO, 25, dec!(40)),
            Err(TradeValidationError::InvalidMargin(Decimal::ZERO))
        );
        assert!(matches!(
            validate_trade_parameters(dec!(0.1), dec!(0.2), 25, dec!(40)),
            Err(TradeValidationError::InsufficientMargin { .. })
        ));
        assert_eq!(
            validate_trade_parameters(dec!(100), dec!(0.2), 101, dec!(40)),
            Err(TradeValidationError::InvalidLeverage(101))
        );
        assert_eq!(
            validate_trade_parameters(dec!(100), dec!(0.2), 25, Decimal::ZERO),
            Err(TradeValidationError::InvalidPrice(Decimal::ZERO))
        );
    }

    #[test]
    fn test_risk_metrics() {
        let seq = [dec!(0.2), dec!(0.27), dec!(0.3645)];
        assert_eq!(total_risk(&seq), dec!(0.8345));
        assert_eq!(safety_ratio(dec!(8.345), dec!(0.8345)), Some(dec!(10)));
        assert_eq!(safety_ratio(dec!(10), Decimal::ZERO), None);
        assert_eq!(roi(dec!(110), dec!(100)), dec!(10));
        assert_eq!(roi(dec!(110), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_balance_moved() {
        assert!(balance_moved(Decimal::ZERO, dec!(100), dec!(0.01)));
        assert!(balance_moved(dec!(100), dec!(101), dec!(0.01)));
        assert!(!balance_moved(dec!(100), dec!(100.5), dec!(0.01)));
        assert!(balance_moved(dec!(100), dec!(98), dec!(0.01)));
    }
}
