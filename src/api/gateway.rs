//! Failure-absorbing wrapper the trading engine uses to reach an exchange.
//!
//! Every call is bounded by a timeout. Idempotent reads are retried with
//! exponential backoff on transient errors; order placement is attempted
//! exactly once. Failures are logged and returned as zero / `None` / `false`
//! so the engine can simply retry on its next pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::models::{ExchangeKind, ExchangePosition, TradeSide};

use super::{native_symbol, round_amount, ExchangeGateway, GatewayError, MarketOrder, OrderAck};

/// Timeout and retry policy for gateway calls.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Upper bound for a single exchange call
    pub call_timeout: Duration,

    /// First retry delay for transient read failures
    pub retry_initial_interval: Duration,

    /// Total time budget for retrying one read
    pub retry_max_elapsed: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            retry_initial_interval: Duration::from_millis(250),
            retry_max_elapsed: Duration::from_secs(5),
        }
    }
}

/// Exchange handle as seen by the trading engine.
#[derive(Clone)]
pub struct GatewayAdapter {
    inner: Arc<dyn ExchangeGateway>,
    settings: GatewaySettings,
}

impl GatewayAdapter {
    pub fn new(inner: Arc<dyn ExchangeGateway>, settings: GatewaySettings) -> Self {
        Self { inner, settings }
    }

    pub fn kind(&self) -> ExchangeKind {
        self.inner.kind()
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T, GatewayError>>) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.settings.call_timeout)),
        }
    }

    /// Run an idempotent read, retrying transient failures.
    async fn read<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.settings.retry_initial_interval)
            .with_max_elapsed_time(Some(self.settings.retry_max_elapsed))
            .build();

        backoff::future::retry(policy, || {
            let attempt = f();
            async move {
                self.timed(attempt).await.map_err(|e| {
                    if e.is_transient() {
                        warn!(exchange = %self.kind(), op, error = %e, "Transient gateway error, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    /// Free USDT balance, or zero when it cannot be read.
    pub async fn get_balance(&self) -> Decimal {
        match self.read("get_balance", || self.inner.get_balance()).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(exchange = %self.kind(), error = %e, "Failed to fetch balance");
                Decimal::ZERO
            }
        }
    }

    /// Last price for a unified or native symbol.
    pub async fn get_price(&self, symbol: &str) -> Option<Decimal> {
        let native = native_symbol(symbol);
        match self.read("get_price", || self.inner.get_price(&native)).await {
            Ok(price) if price > Decimal::ZERO => Some(price),
            Ok(price) => {
                warn!(exchange = %self.kind(), symbol = %native, price = %price, "Ignoring non-positive price");
                None
            }
            Err(e) => {
                warn!(exchange = %self.kind(), symbol = %native, error = %e, "Failed to fetch price");
                None
            }
        }
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> bool {
        let native = native_symbol(symbol);
        match self.read("set_leverage", || self.inner.set_leverage(&native, leverage)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(exchange = %self.kind(), symbol = %native, leverage, error = %e, "Failed to set leverage");
                false
            }
        }
    }

    /// Submit a market order. The amount is rounded down to exchange
    /// precision first; a non-positive rounded amount is rejected locally.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        amount: Decimal,
        reduce_only: bool,
    ) -> Option<OrderAck> {
        let native = native_symbol(symbol);
        let rounded = round_amount(self.kind(), amount);
        if rounded <= Decimal::ZERO {
            warn!(
                exchange = %self.kind(),
                symbol = %native,
                amount = %amount,
                "Order amount rounds to zero, not submitting"
            );
            return None;
        }

        let order = MarketOrder {
            symbol: native.clone(),
            side,
            amount: rounded,
            reduce_only,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
        };

        match self.timed(self.inner.place_market_order(&order)).await {
            Ok(ack) => {
                info!(
                    exchange = %self.kind(),
                    symbol = %native,
                    side = %side,
                    amount = %rounded,
                    reduce_only,
                    order_id = %ack.order_id,
                    "Market order placed"
                );
                Some(ack)
            }
            Err(e) => {
                warn!(
                    exchange = %self.kind(),
                    symbol = %native,
                    side = %side,
                    amount = %rounded,
                    error = %e,
                    "Market order failed"
                );
                None
            }
        }
    }

    /// Open position, `None` when flat or unreadable.
    pub async fn get_open_position(&self, symbol: &str) -> Option<ExchangePosition> {
        self.fetch_position(symbol).await.ok().flatten()
    }

    /// Open position with read failures kept: `Ok(None)` is flat, `Err`
    /// means the exchange could not be read. Lets callers tell "nothing to
    /// close" apart from "don't know".
    pub async fn fetch_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, GatewayError> {
        let native = native_symbol(symbol);
        let position = self
            .read("get_open_position", || self.inner.get_open_position(&native))
            .await
            .map_err(|e| {
                warn!(exchange = %self.kind(), symbol = %native, error = %e, "Failed to fetch position");
                e
            })?;
        Ok(position.filter(|p| p.is_open()))
    }

    pub async fn validate_symbol(&self, symbol: &str) -> bool {
        let native = native_symbol(symbol);
        match self.read("validate_symbol", || self.inner.validate_symbol(&native)).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(exchange = %self.kind(), symbol = %native, error = %e, "Failed to validate symbol");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory exchange used by engine and registry tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug)]
    pub struct MockState {
        pub balance: Decimal,
        pub price: Option<Decimal>,
        /// Signed contracts: positive long, negative short
        pub position: Decimal,
        pub orders: Vec<MarketOrder>,
        pub leverage_calls: u32,
        pub reject_orders: bool,
        /// Transient failures injected before reads succeed again
        pub failing_reads: u32,
        pub hang_orders: bool,
    }

    pub struct MockGateway {
        kind: ExchangeKind,
        pub state: Mutex<MockState>,
    }

    impl MockGateway {
        pub fn new(balance: Decimal, price: Decimal) -> Arc<Self> {
            Arc::new(Self {
                kind: ExchangeKind::Binance,
                state: Mutex::new(MockState {
                    balance,
                    price: Some(price),
                    position: Decimal::ZERO,
                    orders: Vec::new(),
                    leverage_calls: 0,
                    reject_orders: false,
                    failing_reads: 0,
                    hang_orders: false,
                }),
            })
        }

        pub fn set_price(&self, price: Decimal) {
            self.state.lock().unwrap().price = Some(price);
        }

        pub fn set_balance(&self, balance: Decimal) {
            self.state.lock().unwrap().balance = balance;
        }

        pub fn set_position(&self, position: Decimal) {
            self.state.lock().unwrap().position = position;
        }

        pub fn position(&self) -> Decimal {
            self.state.lock().unwrap().position
        }

        pub fn orders(&self) -> Vec<MarketOrder> {
            self.state.lock().unwrap().orders.clone()
        }

        pub fn reject_orders(&self, reject: bool) {
            self.state.lock().unwrap().reject_orders = reject;
        }

        fn take_read_failure(&self) -> Result<(), GatewayError> {
            let mut state = self.state.lock().unwrap();
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(GatewayError::Timeout(Duration::from_millis(1)));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ExchangeGateway for MockGateway {
        fn kind(&self) -> ExchangeKind {
            self.kind
        }

        async fn get_balance(&self) -> Result<Decimal, GatewayError> {
            self.take_read_failure()?;
            Ok(self.state.lock().unwrap().balance)
        }

        async fn get_price(&self, _symbol: &str) -> Result<Decimal, GatewayError> {
            self.take_read_failure()?;
            self.state
                .lock()
                .unwrap()
                .price
                .ok_or_else(|| GatewayError::Parse("no price".to_string()))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), GatewayError> {
            self.state.lock().unwrap().leverage_calls += 1;
            Ok(())
        }

        async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck, GatewayError> {
            let hang = self.state.lock().unwrap().hang_orders;
            if hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            let mut state = self.state.lock().unwrap();
            if state.reject_orders {
                return Err(GatewayError::Api {
                    exchange: self.kind,
                    code: -2019,
                    message: "Margin is insufficient".to_string(),
                });
            }

            let delta = match order.side {
                TradeSide::Buy => order.amount,
                TradeSide::Sell => -order.amount,
            };
            let next = state.position + delta;
            state.position = if !order.reduce_only {
                next
            } else if state.position > Decimal::ZERO {
                next.max(Decimal::ZERO).min(state.position)
            } else {
                next.min(Decimal::ZERO).max(state.position)
            };
            state.orders.push(order.clone());

            Ok(OrderAck {
                order_id: state.orders.len().to_string(),
                client_order_id: order.client_order_id.clone(),
            })
        }

        async fn get_open_position(&self, _symbol: &str) -> Result<Option<ExchangePosition>, GatewayError> {
            self.take_read_failure()?;
            let state = self.state.lock().unwrap();
            if state.position.is_zero() {
                return Ok(None);
            }
            Ok(Some(ExchangePosition {
                size: state.position.abs(),
                side: if state.position > Decimal::ZERO { TradeSide::Buy } else { TradeSide::Sell },
                entry_price: Decimal::ZERO,
                mark_price: state.price.unwrap_or_default(),
                unrealized_pnl: Decimal::ZERO,
            }))
        }

        async fn validate_symbol(&self, symbol: &str) -> Result<bool, GatewayError> {
            Ok(symbol == "HYPEUSDT")
        }
    }

    /// Adapter over a mock with short timeouts and retry budget.
    pub fn adapter(mock: &Arc<MockGateway>) -> GatewayAdapter {
        let inner: Arc<dyn ExchangeGateway> = mock.clone();
        GatewayAdapter::new(
            inner,
            GatewaySettings {
                call_timeout: Duration::from_millis(200),
                retry_initial_interval: Duration::from_millis(5),
                retry_max_elapsed: Duration::from_millis(200),
            },
        )
    }
}
