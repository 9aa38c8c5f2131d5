//! Exchange API clients for Binance USDT-M futures and Bybit linear perpetuals.
//!
//! Both clients implement [`ExchangeGateway`]; the trading engine only ever
//! talks to them through a [`GatewayAdapter`], which bounds every call with a
//! timeout, retries idempotent reads and turns failures into "no result".

mod binance;
mod bybit;
mod gateway;
mod signing;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ExchangeKind, ExchangePosition, TradeSide};

pub use binance::BinanceClient;
pub use bybit::BybitClient;
pub use gateway::{GatewayAdapter, GatewaySettings};

#[cfg(test)]
pub(crate) use gateway::mock;

/// Default HTTP timeout for exchange requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Receive window for signed requests (milliseconds).
pub const RECV_WINDOW_MS: u64 = 5000;

/// Errors returned by the raw exchange clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{exchange} API error {code}: {message}")]
    Api {
        exchange: ExchangeKind,
        code: i64,
        message: String,
    },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::Timeout(_) => true,
            // Rate limits and server-side hiccups
            GatewayError::Api { code, .. } => matches!(*code, -1003 | -1001 | 10006 | 10016 | 429 | 500..=599),
            _ => false,
        }
    }
}

/// API key pair for one user's exchange account.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// A market order ready for submission.
#[derive(Debug, Clone)]
pub struct MarketOrder {
    /// Native exchange symbol (e.g. `HYPEUSDT`)
    pub symbol: String,
    pub side: TradeSide,
    /// Contract amount, already rounded to exchange precision
    pub amount: Decimal,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// Exchange acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
}

/// Raw exchange operations needed by the trading engine.
///
/// Implementations return errors freely; [`GatewayAdapter`] decides how to
/// retry and how to degrade.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Free USDT balance available for margin.
    async fn get_balance(&self) -> Result<Decimal, GatewayError>;

    /// Last traded price for a native symbol.
    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError>;

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck, GatewayError>;

    /// Open position for a native symbol, `None` when flat.
    async fn get_open_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, GatewayError>;

    /// Whether the symbol exists and is currently trading.
    async fn validate_symbol(&self, symbol: &str) -> Result<bool, GatewayError>;
}

/// Build an authenticated client for the chosen exchange.
pub fn connect(
    kind: ExchangeKind,
    credentials: &ApiCredentials,
    sandbox: bool,
) -> Result<Arc<dyn ExchangeGateway>> {
    let gateway: Arc<dyn ExchangeGateway> = match kind {
        ExchangeKind::Binance => Arc::new(BinanceClient::new(credentials, sandbox)?),
        ExchangeKind::Bybit => Arc::new(BybitClient::new(credentials, sandbox)?),
    };
    Ok(gateway)
}

/// Convert a unified symbol (`HYPE/USDT:USDT`) into the native id (`HYPEUSDT`).
/// Native ids pass through unchanged.
pub fn native_symbol(symbol: &str) -> String {
    let pair = symbol.split(':').next().unwrap_or(symbol);
    pair.replace('/', "").to_uppercase()
}

/// Round an order amount down to the exchange's quantity precision.
pub fn round_amount(kind: ExchangeKind, amount: Decimal) -> Decimal {
    amount
        .round_dp_with_strategy(kind.amount_precision(), RoundingStrategy::ToZero)
        .normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_native_symbol() {
        assert_eq!(native_symbol("HYPE/USDT:USDT"), "HYPEUSDT");
        assert_eq!(native_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(native_symbol("HYPEUSDT"), "HYPEUSDT");
    }

    #[test]
    fn test_round_amount_truncates() {
        assert_eq!(round_amount(ExchangeKind::Binance, dec!(0.0683198)), dec!(0.068319));
        assert_eq!(round_amount(ExchangeKind::Bybit, dec!(0.0683198)), dec!(0.0683));
        assert_eq!(round_amount(ExchangeKind::Bybit, dec!(0.00009)), Decimal::ZERO);
    }

    #[test]
    fn test_transient_classification() {
        let rate_limited = GatewayError::Api {
            exchange: ExchangeKind::Binance,
            code: -1003,
            message: "Too many requests".to_string(),
        };
        assert!(rate_limited.is_transient());

        let rejected = GatewayError::Api {
            exchange: ExchangeKind::Binance,
            code: -2019,
            message: "Margin is insufficient".to_string(),
        };
        assert!(!rejected.is_transient());
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!GatewayError::Parse("bad".into()).is_transient());
    }

    #[test]
    fn test_credentials_debug_is_masked() {
        let creds = ApiCredentials {
            api_key: "abcdefghijklmnop".to_string(),
            api_secret: "supersecret".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("abcd...mnop"));
        assert!(!rendered.contains("supersecret"));
    }
}
