//! Per-user martingale state machine.
//!
//! A cycle moves `Idle -> Opening -> Active -> Closing -> Idle`. Each
//! processing pass refreshes the balance-driven sizing, then either opens a
//! cycle, adds a level, takes profit or holds.
//!
//! State is only committed after the exchange confirms an order, and the
//! commit happens without any await in between, so a failed or cancelled
//! transition never leaves a half-updated record behind.

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{round_amount, GatewayAdapter};
use crate::models::{
    CloseKind, ClosedTrade, CyclePhase, ExchangePosition, PositionLevel, TradeSide, Transition,
    UserRecord,
};

use super::calculator::{self, TradeValidationError};
use super::events::TradeEvent;
use super::StrategyConfig;

/// Why a transition was refused or aborted. The record is left as it was.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransitionError {
    #[error(transparent)]
    Validation(#[from] TradeValidationError),

    #[error("insufficient balance ${balance:.2} (minimum ${minimum:.2})")]
    InsufficientBalance { balance: Decimal, minimum: Decimal },

    #[error("setup is not complete")]
    SetupIncomplete,

    #[error("symbol {0} is not tradable")]
    InvalidSymbol(String),

    #[error("price unavailable")]
    PriceUnavailable,

    #[error("exchange position unavailable")]
    PositionUnavailable,

    #[error("could not size the order")]
    SizingFailed,

    #[error("leverage could not be set")]
    LeverageRejected,

    #[error("order was not confirmed by the exchange")]
    OrderRejected,

    #[error("no position to close")]
    NoPositionToClose,

    #[error("exchange holds a {0} position, expected a long")]
    UnexpectedPositionSide(TradeSide),

    #[error("all martingale levels are in use")]
    MaxLevelsReached,

    #[error("a cycle is already active")]
    AlreadyActive,

    #[error("no active cycle")]
    NotActive,

    #[error("{0:?} already in progress")]
    AlreadyInFlight(Transition),
}

/// What a processing pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum PassAction {
    /// Nothing evaluated (setup incomplete, trading disabled, safe stop)
    Skipped(&'static str),
    /// Position monitored, no trigger hit
    Held,
    Opened,
    LevelAdded,
    Closed,
}

/// Outcome of one processing pass for one user.
#[derive(Debug)]
pub struct PassReport {
    pub action: Result<PassAction, TransitionError>,
    pub events: Vec<TradeEvent>,
}

impl PassReport {
    fn skipped(reason: &'static str) -> Self {
        Self {
            action: Ok(PassAction::Skipped(reason)),
            events: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.action.is_ok()
    }

    /// Whether the record may have changed and should be persisted.
    pub fn should_persist(&self) -> bool {
        !self.events.is_empty()
            || matches!(
                self.action,
                Ok(PassAction::Opened | PassAction::LevelAdded | PassAction::Closed)
            )
    }
}

/// Point-in-time view of a user's trading state.
#[derive(Debug, Clone)]
pub struct TradingStatus {
    pub phase: CyclePhase,
    pub balance: Decimal,
    pub price: Option<Decimal>,
    pub exchange_position: Option<ExchangePosition>,
    pub weighted_entry: Option<Decimal>,
    pub profit_pct: Option<Decimal>,
    pub margin_return: Option<Decimal>,
    pub current_step: usize,
    pub max_steps: usize,
    pub trading_enabled: bool,
    pub safe_stop_requested: bool,
    pub base_amount: Decimal,
    pub total_risk: Decimal,
    pub safety_ratio: Option<Decimal>,
    pub roi: Decimal,
    pub cycle_count: u32,
    pub total_trades: u32,
    pub total_profit: Decimal,
}

/// Drives every user's cycle. Holds no per-user state.
#[derive(Debug, Clone)]
pub struct TradingEngine {
    config: StrategyConfig,
}

impl TradingEngine {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Run one processing pass for a user.
    pub async fn process_user(&self, record: &mut UserRecord, gateway: &GatewayAdapter) -> PassReport {
        // 1. Gate
        if !record.setup_complete {
            return PassReport::skipped("setup incomplete");
        }
        if !record.trading_enabled {
            return PassReport::skipped("trading disabled");
        }
        if record.safe_stop_requested && !record.is_active {
            return PassReport::skipped("safe stop");
        }

        if let Some(stale) = record.in_flight.take() {
            warn!(
                user_id = record.user_id,
                transition = ?stale,
                "Clearing interrupted transition; exchange state is authoritative on close"
            );
        }

        let mut events = Vec::new();

        // 2. Keep sizing in line with the balance
        if let Some(event) = self.refresh_balance(record, gateway).await {
            events.push(event);
        }

        // 3. Idle: open a new cycle
        if !record.is_active {
            let action = match self.start_new_cycle(record, gateway).await {
                Ok(event) => {
                    events.push(event);
                    Ok(PassAction::Opened)
                }
                Err(e) => Err(e),
            };
            return PassReport { action, events };
        }

        // 4. Active: take profit, add a level, or hold
        let action = self.monitor_position(record, gateway, &mut events).await;
        PassReport { action, events }
    }

    async fn monitor_position(
        &self,
        record: &mut UserRecord,
        gateway: &GatewayAdapter,
        events: &mut Vec<TradeEvent>,
    ) -> Result<PassAction, TransitionError> {
        let price = gateway
            .get_price(&record.symbol)
            .await
            .ok_or(TransitionError::PriceUnavailable)?;

        if let Some(avg_entry) = record.weighted_entry() {
            if calculator::should_take_profit(price, avg_entry, record.params.take_profit_pct) {
                info!(
                    user_id = record.user_id,
                    price = %price,
                    avg_entry = %avg_entry,
                    "Take profit triggered"
                );
                let safe_stop = record.safe_stop_requested;
                events.push(self.close_position(record, gateway).await?);
                if safe_stop {
                    events.push(TradeEvent::SafeStopCompleted);
                }
                return Ok(PassAction::Closed);
            }
        }

        let Some(reference) = record.reference_price() else {
            return Ok(PassAction::Held);
        };
        if !calculator::should_add_level(price, reference, record.params.price_drop_trigger_pct) {
            return Ok(PassAction::Held);
        }
        if record.at_last_level() {
            debug!(
                user_id = record.user_id,
                step = record.current_step,
                "Drop trigger hit but every level is in use"
            );
            return Ok(PassAction::Held);
        }

        info!(
            user_id = record.user_id,
            price = %price,
            reference = %reference,
            next_level = record.current_step + 2,
            "Adding martingale level"
        );
        events.push(self.add_martingale_level(record, gateway).await?);
        Ok(PassAction::LevelAdded)
    }

    /// Refresh the balance and resize the strategy when it moved enough.
    ///
    /// A zero balance is indistinguishable from a failed read and is ignored.
    pub async fn refresh_balance(&self, record: &mut UserRecord, gateway: &GatewayAdapter) -> Option<TradeEvent> {
        let balance = gateway.get_balance().await;
        if balance <= Decimal::ZERO {
            return None;
        }
        self.apply_balance(record, balance)
    }

    /// Apply a freshly read balance to the record.
    pub fn apply_balance(&self, record: &mut UserRecord, balance: Decimal) -> Option<TradeEvent> {
        if !calculator::balance_moved(record.current_balance, balance, self.config.rebalance_threshold) {
            return None;
        }

        let old_balance = record.current_balance;
        let old_base = record.base_amount;
        let new_base = calculator::base_amount(balance, record.params.balance_fraction);

        if record.starting_balance.is_zero() {
            record.starting_balance = balance;
        }
        record.current_balance = balance;
        record.apply_sizing(new_base);
        record.last_balance_update = Some(Utc::now());

        info!(
            user_id = record.user_id,
            old_balance = %old_balance,
            new_balance = %balance,
            new_base = %new_base,
            "Strategy resized to balance"
        );

        Some(TradeEvent::BalanceUpdated {
            old_balance,
            new_balance: balance,
            old_base,
            new_base,
        })
    }

    fn begin(record: &mut UserRecord, transition: Transition) -> Result<(), TransitionError> {
        if let Some(current) = record.in_flight {
            return Err(TransitionError::AlreadyInFlight(current));
        }
        record.in_flight = Some(transition);
        Ok(())
    }

    /// Open a new cycle with a level-0 market buy.
    pub async fn start_new_cycle(
        &self,
        record: &mut UserRecord,
        gateway: &GatewayAdapter,
    ) -> Result<TradeEvent, TransitionError> {
        Self::begin(record, Transition::Opening)?;
        let result = self.open_cycle(record, gateway).await;
        record.in_flight = None;

        if let Err(e) = &result {
            warn!(user_id = record.user_id, error = %e, "Could not start cycle");
        }
        result
    }

    async fn open_cycle(&self, record: &mut UserRecord, gateway: &GatewayAdapter) -> Result<TradeEvent, TransitionError> {
        if record.is_active {
            return Err(TransitionError::AlreadyActive);
        }

        let balance = gateway.get_balance().await;
        if balance < self.config.min_balance {
            return Err(TransitionError::InsufficientBalance {
                balance,
                minimum: self.config.min_balance,
            });
        }

        let price = gateway
            .get_price(&record.symbol)
            .await
            .ok_or(TransitionError::PriceUnavailable)?;
        let margin = record
            .martingale_sequence
            .first()
            .copied()
            .unwrap_or(record.base_amount);
        let leverage = record.params.leverage;

        calculator::validate_trade_parameters(balance, margin, leverage, price)?;
        let contracts = calculator::position_size(margin, leverage, price)
            .map(|c| round_amount(gateway.kind(), c))
            .filter(|c| *c > Decimal::ZERO)
            .ok_or(TransitionError::SizingFailed)?;

        if !gateway.set_leverage(&record.symbol, leverage).await {
            return Err(TransitionError::LeverageRejected);
        }

        gateway
            .place_market_order(&record.symbol, TradeSide::Buy, contracts, false)
            .await
            .ok_or(TransitionError::OrderRejected)?;

        // Confirmed: commit
        record.is_active = true;
        record.current_step = 0;
        record.entry_price = Some(price);
        record.position_levels = vec![PositionLevel::new(price, margin, contracts, 0)];
        record.martingale_trigger_prices.clear();
        record.total_trades += 1;

        info!(
            user_id = record.user_id,
            price = %price,
            contracts = %contracts,
            margin = %margin,
            cycle = record.cycle_count + 1,
            "Cycle started"
        );

        Ok(TradeEvent::CycleStarted {
            price,
            amount: contracts,
            margin,
        })
    }

    /// Buy the next martingale level.
    pub async fn add_martingale_level(
        &self,
        record: &mut UserRecord,
        gateway: &GatewayAdapter,
    ) -> Result<TradeEvent, TransitionError> {
        Self::begin(record, Transition::Adding)?;
        let result = self.add_level(record, gateway).await;
        record.in_flight = None;

        if let Err(e) = &result {
            warn!(
                user_id = record.user_id,
                step = record.current_step,
                error = %e,
                "Could not add martingale level"
            );
        }
        result
    }

    async fn add_level(&self, record: &mut UserRecord, gateway: &GatewayAdapter) -> Result<TradeEvent, TransitionError> {
        if !record.is_active {
            return Err(TransitionError::NotActive);
        }
        let margin = record
            .next_level_margin()
            .ok_or(TransitionError::MaxLevelsReached)?;
        let next_step = record.current_step + 1;

        let price = gateway
            .get_price(&record.symbol)
            .await
            .ok_or(TransitionError::PriceUnavailable)?;
        let balance = gateway.get_balance().await;
        let leverage = record.params.leverage;

        calculator::validate_trade_parameters(balance, margin, leverage, price)?;
        let contracts = calculator::position_size(margin, leverage, price)
            .map(|c| round_amount(gateway.kind(), c))
            .filter(|c| *c > Decimal::ZERO)
            .ok_or(TransitionError::SizingFailed)?;

        gateway
            .place_market_order(&record.symbol, TradeSide::Buy, contracts, false)
            .await
            .ok_or(TransitionError::OrderRejected)?;

        // Confirmed: commit
        record
            .position_levels
            .push(PositionLevel::new(price, margin, contracts, next_step));
        record.martingale_trigger_prices.push(price);
        record.current_step = next_step;
        record.total_trades += 1;

        info!(
            user_id = record.user_id,
            level = next_step + 1,
            price = %price,
            contracts = %contracts,
            margin = %margin,
            "Martingale level added"
        );

        Ok(TradeEvent::MartingaleAdded {
            level: next_step + 1,
            price,
            amount: contracts,
            margin,
        })
    }

    /// Take profit: sell the exchange-reported position and end the cycle.
    pub async fn close_position(
        &self,
        record: &mut UserRecord,
        gateway: &GatewayAdapter,
    ) -> Result<TradeEvent, TransitionError> {
        Self::begin(record, Transition::Closing)?;
        let result = self.close(record, gateway).await;
        record.in_flight = None;

        if let Err(e) = &result {
            warn!(user_id = record.user_id, error = %e, "Could not close position");
        }
        result
    }

    async fn close(&self, record: &mut UserRecord, gateway: &GatewayAdapter) -> Result<TradeEvent, TransitionError> {
        if !record.is_active {
            return Err(TransitionError::NotActive);
        }

        let position = gateway
            .fetch_position(&record.symbol)
            .await
            .map_err(|_| TransitionError::PositionUnavailable)?;
        let Some(position) = position else {
            warn!(
                user_id = record.user_id,
                local_contracts = %record.total_contracts(),
                "Exchange reports no open position"
            );
            return Err(TransitionError::NoPositionToClose);
        };
        if position.side != TradeSide::Buy {
            warn!(
                user_id = record.user_id,
                side = %position.side,
                size = %position.size,
                "Exchange position does not match the cycle"
            );
            return Err(TransitionError::UnexpectedPositionSide(position.side));
        }
        let size = position.size;

        let price = gateway
            .get_price(&record.symbol)
            .await
            .ok_or(TransitionError::PriceUnavailable)?;

        gateway
            .place_market_order(&record.symbol, TradeSide::Sell, size, true)
            .await
            .ok_or(TransitionError::OrderRejected)?;

        // Confirmed: commit
        let (profit_pct, profit_usd) = Self::realized(record, price);
        record.cycle_count += 1;
        record.total_profit += profit_usd;
        let trade = Self::closing_record(record, CloseKind::TakeProfit, price, size, profit_pct, profit_usd);
        record.closed_trades.push(trade);
        record.reset_cycle();

        if record.safe_stop_requested {
            record.safe_stop_requested = false;
            record.trading_enabled = false;
            info!(user_id = record.user_id, "Safe stop completed after take profit");
        }

        info!(
            user_id = record.user_id,
            cycle = record.cycle_count,
            profit_pct = %profit_pct.round_dp(4),
            profit_usd = %profit_usd.round_dp(4),
            "Cycle completed"
        );

        self.stamp_balance_after(record, gateway).await;

        Ok(TradeEvent::CycleCompleted {
            profit_pct,
            profit_usd,
            amount: size,
            cycle: record.cycle_count,
        })
    }

    /// Flatten any open position and disable trading.
    ///
    /// Succeeds with `None` when there was nothing to close.
    pub async fn emergency_close(
        &self,
        record: &mut UserRecord,
        gateway: &GatewayAdapter,
    ) -> Result<Option<TradeEvent>, TransitionError> {
        record.trading_enabled = false;
        record.safe_stop_requested = false;

        // Callers hold the session lock, so a marker here was left by a
        // cancelled pass.
        if let Some(stale) = record.in_flight.take() {
            warn!(user_id = record.user_id, transition = ?stale, "Overriding interrupted transition");
        }
        Self::begin(record, Transition::Closing)?;
        let result = self.flatten(record, gateway).await;
        record.in_flight = None;

        match &result {
            Ok(Some(_)) => warn!(user_id = record.user_id, "Emergency close completed"),
            Ok(None) => info!(user_id = record.user_id, "Emergency stop with no open position"),
            Err(e) => warn!(user_id = record.user_id, error = %e, "Emergency close failed"),
        }
        result
    }

    async fn flatten(&self, record: &mut UserRecord, gateway: &GatewayAdapter) -> Result<Option<TradeEvent>, TransitionError> {
        let position = gateway
            .fetch_position(&record.symbol)
            .await
            .map_err(|_| TransitionError::PositionUnavailable)?;

        let Some(position) = position else {
            record.reset_cycle();
            return Ok(None);
        };
        let size = position.size;

        let price = gateway.get_price(&record.symbol).await.unwrap_or(Decimal::ZERO);

        gateway
            .place_market_order(&record.symbol, position.side.opposite(), size, true)
            .await
            .ok_or(TransitionError::OrderRejected)?;

        // Confirmed: commit. Only a long belongs to the cycle.
        let (profit_pct, profit_usd) = if price > Decimal::ZERO && position.side == TradeSide::Buy {
            Self::realized(record, price)
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };
        record.total_profit += profit_usd;
        let trade = Self::closing_record(record, CloseKind::Emergency, price, size, profit_pct, profit_usd);
        record.closed_trades.push(trade);
        record.reset_cycle();

        self.stamp_balance_after(record, gateway).await;

        Ok(Some(TradeEvent::EmergencyClosed {
            amount: size,
            price,
            profit_usd,
        }))
    }

    /// Profit percent on price and realized USD profit at `price`.
    fn realized(record: &UserRecord, price: Decimal) -> (Decimal, Decimal) {
        let total_margin = record.total_margin();
        let profit_pct = record
            .weighted_entry()
            .and_then(|avg| calculator::profit_percentage(price, avg))
            .unwrap_or(Decimal::ZERO);
        let profit_usd = calculator::realized_profit(total_margin, profit_pct, record.params.leverage);
        (profit_pct, profit_usd)
    }

    fn closing_record(
        record: &UserRecord,
        kind: CloseKind,
        price: Decimal,
        amount: Decimal,
        profit_pct: Decimal,
        profit_usd: Decimal,
    ) -> ClosedTrade {
        ClosedTrade {
            user_id: record.user_id,
            kind,
            timestamp: Utc::now(),
            price,
            amount,
            margin_used: record.total_margin(),
            profit_usd,
            profit_pct,
            cycle_number: match kind {
                CloseKind::TakeProfit => record.cycle_count,
                CloseKind::Emergency => record.cycle_count + 1,
            },
            balance_after: None,
            exchange: record.exchange,
            symbol: record.symbol.clone(),
        }
    }

    /// Best-effort post-close balance on the latest closing record.
    async fn stamp_balance_after(&self, record: &mut UserRecord, gateway: &GatewayAdapter) {
        let balance = gateway.get_balance().await;
        if balance > Decimal::ZERO {
            if let Some(trade) = record.closed_trades.last_mut() {
                trade.balance_after = Some(balance);
            }
        }
    }

    /// Check a user can start trading, returning the current balance.
    pub async fn readiness(&self, record: &UserRecord, gateway: &GatewayAdapter) -> Result<Decimal, TransitionError> {
        if !record.setup_complete || record.exchange.is_none() {
            return Err(TransitionError::SetupIncomplete);
        }

        let balance = gateway.get_balance().await;
        if balance < self.config.min_balance {
            return Err(TransitionError::InsufficientBalance {
                balance,
                minimum: self.config.min_balance,
            });
        }

        if !gateway.validate_symbol(&record.symbol).await {
            return Err(TransitionError::InvalidSymbol(record.symbol.clone()));
        }

        Ok(balance)
    }

    /// Snapshot of a user's state with live balance, price and position.
    pub async fn trading_status(&self, record: &UserRecord, gateway: &GatewayAdapter) -> TradingStatus {
        let balance = gateway.get_balance().await;
        let price = gateway.get_price(&record.symbol).await;
        let exchange_position = gateway.get_open_position(&record.symbol).await;
        Self::status_from(record, balance, price, exchange_position)
    }

    /// Snapshot from already-known values (no exchange access).
    pub fn status_from(
        record: &UserRecord,
        balance: Decimal,
        price: Option<Decimal>,
        exchange_position: Option<ExchangePosition>,
    ) -> TradingStatus {
        let weighted_entry = record.weighted_entry();
        let profit_pct = match (price, weighted_entry) {
            (Some(p), Some(avg)) => calculator::profit_percentage(p, avg),
            _ => None,
        };
        let total_risk = calculator::total_risk(&record.martingale_sequence);

        TradingStatus {
            phase: record.phase(),
            balance,
            price,
            exchange_position,
            weighted_entry,
            profit_pct,
            margin_return: profit_pct.map(|pct| calculator::margin_return(pct, record.params.leverage)),
            current_step: record.current_step,
            max_steps: record.martingale_sequence.len(),
            trading_enabled: record.trading_enabled,
            safe_stop_requested: record.safe_stop_requested,
            base_amount: record.base_amount,
            total_risk,
            safety_ratio: calculator::safety_ratio(balance, total_risk),
            roi: calculator::roi(balance, record.starting_balance),
            cycle_count: record.cycle_count,
            total_trades: record.total_trades,
            total_profit: record.total_profit,
        }
    }
}
