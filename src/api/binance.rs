//! Binance USDT-M futures REST client (`/fapi`).
//!
//! Signed endpoints take the query string plus `timestamp` and `recvWindow`,
//! signed with HMAC-SHA256 and passed as `signature`. The API key travels in
//! the `X-MBX-APIKEY` header.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::models::{ExchangeKind, ExchangePosition, TradeSide};

use super::signing::{sign_hex, timestamp_ms};
use super::types::*;
use super::{
    ApiCredentials, ExchangeGateway, GatewayError, MarketOrder, OrderAck, DEFAULT_TIMEOUT,
    RECV_WINDOW_MS,
};

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Authenticated Binance futures client for one user.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_secret: String,
}

impl BinanceClient {
    pub fn new(credentials: &ApiCredentials, sandbox: bool) -> anyhow::Result<Self> {
        let base_url = if sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(credentials, base_url.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(credentials: &ApiCredentials, base_url: String) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-APIKEY", HeaderValue::from_str(&credentials.api_key)?);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(DEFAULT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_secret: credentials.api_secret.clone(),
        })
    }

    /// Build the signed query string for a private request.
    fn signed_query(&self, params: &[(&str, String)]) -> Result<String, GatewayError> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("timestamp={}", timestamp_ms()));
        query.push(format!("recvWindow={}", RECV_WINDOW_MS));
        let query = query.join("&");

        let signature = sign_hex(&self.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, path: &str, query: &str) -> Result<T, GatewayError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!(method = %method, path = %path, "Binance request");

        let response = self.http.request(method, &url).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<BinanceErrorResponse>(&text) {
                Ok(err) => GatewayError::Api {
                    exchange: ExchangeKind::Binance,
                    code: err.code,
                    message: err.msg,
                },
                Err(_) => GatewayError::Api {
                    exchange: ExchangeKind::Binance,
                    code: i64::from(status.as_u16()),
                    message: text,
                },
            });
        }

        serde_json::from_str(&text).map_err(|e| GatewayError::Parse(format!("{}: {}", e, text)))
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let query = self.signed_query(params)?;
        self.send(method, path, &query).await
    }
}

#[async_trait]
impl ExchangeGateway for BinanceClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn get_balance(&self) -> Result<Decimal, GatewayError> {
        let balances: Vec<BinanceBalance> = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;

        Ok(balances
            .into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available_balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let query = format!("symbol={}", symbol);
        let ticker: BinanceTickerPrice = self.send(Method::GET, "/fapi/v1/ticker/price", &query).await?;
        Ok(ticker.price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/leverage", &params).await?;
        Ok(())
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck, GatewayError> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", order.amount.to_string()),
            ("newClientOrderId", order.client_order_id.clone()),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: BinanceOrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        debug!(order_id = response.order_id, status = %response.status, "Binance order accepted");

        Ok(OrderAck {
            order_id: response.order_id.to_string(),
            client_order_id: response.client_order_id,
        })
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, GatewayError> {
        let params = [("symbol", symbol.to_string())];
        let rows: Vec<BinancePositionRisk> = self.signed(Method::GET, "/fapi/v2/positionRisk", &params).await?;

        Ok(rows
            .into_iter()
            .find(|r| r.symbol == symbol && !r.position_amt.is_zero())
            .map(|r| ExchangePosition {
                size: r.position_amt.abs(),
                side: if r.position_amt > Decimal::ZERO { TradeSide::Buy } else { TradeSide::Sell },
                entry_price: r.entry_price,
                mark_price: r.mark_price,
                unrealized_pnl: r.un_realized_profit,
            }))
    }

    async fn validate_symbol(&self, symbol: &str) -> Result<bool, GatewayError> {
        let info: BinanceExchangeInfo = self.send(Method::GET, "/fapi/v1/exchangeInfo", "").await?;
        Ok(info
            .symbols
            .iter()
            .any(|s| s.symbol == symbol && s.status == "TRADING"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BinanceClient {
        let creds = ApiCredentials {
            api_key: "test-key".to_string(),
            api_secret: "test-secret".to_string(),
        };
        BinanceClient::with_base_url(&creds, "http://localhost:0".to_string()).unwrap()
    }

    #[test]
    fn test_signed_query_layout() {
        let query = client()
            .signed_query(&[("symbol", "HYPEUSDT".to_string()), ("leverage", "25".to_string())])
            .unwrap();

        assert!(query.starts_with("symbol=HYPEUSDT&leverage=25&timestamp="));
        assert!(query.contains(&format!("&recvWindow={}", RECV_WINDOW_MS)));

        let (payload, signature) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(signature, sign_hex("test-secret", payload).unwrap());
    }

    #[test]
    fn test_kind() {
        assert_eq!(client().kind(), ExchangeKind::Binance);
    }
}
