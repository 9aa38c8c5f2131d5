//! Bybit v5 REST client for USDT linear perpetuals.
//!
//! Private requests are signed over `timestamp + api_key + recv_window +
//! payload`, where the payload is the query string for GET and the JSON body
//! for POST. Every response is wrapped in a `{retCode, retMsg, result}`
//! envelope; a non-zero `retCode` is an error even on HTTP 200.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use crate::models::{ExchangeKind, ExchangePosition, TradeSide};

use super::signing::{sign_hex, timestamp_ms};
use super::types::*;
use super::{
    ApiCredentials, ExchangeGateway, GatewayError, MarketOrder, OrderAck, DEFAULT_TIMEOUT,
    RECV_WINDOW_MS,
};

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Account types probed, in order, when reading the balance.
const ACCOUNT_TYPES: [&str; 2] = ["UNIFIED", "CONTRACT"];

/// "leverage not modified": the requested leverage is already set.
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Authenticated Bybit client for one user.
pub struct BybitClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    pub fn new(credentials: &ApiCredentials, sandbox: bool) -> anyhow::Result<Self> {
        let base_url = if sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(credentials, base_url.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(credentials: &ApiCredentials, base_url: String) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url,
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        })
    }

    /// Signature over the canonical pre-sign string.
    fn sign(&self, timestamp: i64, payload: &str) -> Result<String, GatewayError> {
        let presign = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW_MS, payload);
        sign_hex(&self.api_secret, &presign)
    }

    fn authenticate(&self, request: RequestBuilder, payload: &str) -> Result<RequestBuilder, GatewayError> {
        let timestamp = timestamp_ms();
        let signature = self.sign(timestamp, payload)?;

        Ok(request
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
            .header("X-BAPI-SIGN", signature))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &str, private: bool) -> Result<T, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        debug!(path = %path, "Bybit GET");

        let mut request = self.http.get(&url);
        if private {
            request = self.authenticate(request, query)?;
        }
        Self::unwrap_envelope(request.send().await?).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let body = body.to_string();
        debug!(path = %path, "Bybit POST");

        let request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body.clone());
        let request = self.authenticate(request, &body)?;
        Self::unwrap_envelope(request.send().await?).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                exchange: ExchangeKind::Bybit,
                code: i64::from(status.as_u16()),
                message: text,
            });
        }

        let envelope: BybitEnvelope<T> =
            serde_json::from_str(&text).map_err(|e| GatewayError::Parse(format!("{}: {}", e, text)))?;

        if envelope.ret_code != 0 {
            return Err(GatewayError::Api {
                exchange: ExchangeKind::Bybit,
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        envelope
            .result
            .ok_or_else(|| GatewayError::Parse("missing result".to_string()))
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bybit
    }

    async fn get_balance(&self) -> Result<Decimal, GatewayError> {
        let mut last_error = None;

        for account_type in ACCOUNT_TYPES {
            let query = format!("accountType={}&coin=USDT", account_type);
            match self
                .get::<BybitList<BybitWalletAccount>>("/v5/account/wallet-balance", &query, true)
                .await
            {
                Ok(result) => {
                    let usdt = result
                        .list
                        .iter()
                        .flat_map(|account| account.coin.iter())
                        .find(|coin| coin.coin == "USDT");
                    if let Some(coin) = usdt {
                        return Ok(coin.free());
                    }
                }
                Err(e) => {
                    debug!(account_type, error = %e, "Bybit balance probe failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result: BybitList<BybitTicker> = self.get("/v5/market/tickers", &query, false).await?;

        result
            .list
            .into_iter()
            .find(|t| t.symbol == symbol)
            .and_then(|t| t.last_price)
            .ok_or_else(|| GatewayError::Parse(format!("no ticker for {}", symbol)))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });

        match self.post::<serde_json::Value>("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Api { code: LEVERAGE_NOT_MODIFIED, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck, GatewayError> {
        let side = match order.side {
            TradeSide::Buy => "Buy",
            TradeSide::Sell => "Sell",
        };
        let body = json!({
            "category": "linear",
            "symbol": order.symbol,
            "side": side,
            "orderType": "Market",
            "qty": order.amount.to_string(),
            "reduceOnly": order.reduce_only,
            "orderLinkId": order.client_order_id,
        });

        let result: BybitOrderResult = self.post("/v5/order/create", &body).await?;
        Ok(OrderAck {
            order_id: result.order_id,
            client_order_id: result.order_link_id,
        })
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, GatewayError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result: BybitList<BybitPosition> = self.get("/v5/position/list", &query, true).await?;

        let position = result
            .list
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .find(|p| p.size.is_some_and(|s| s > Decimal::ZERO));

        let Some(p) = position else {
            return Ok(None);
        };

        let side = match p.side.as_str() {
            "Buy" => TradeSide::Buy,
            "Sell" => TradeSide::Sell,
            other => {
                warn!(side = %other, symbol = %symbol, "Unexpected Bybit position side");
                TradeSide::Buy
            }
        };

        Ok(Some(ExchangePosition {
            size: p.size.unwrap_or(Decimal::ZERO),
            side,
            entry_price: p.avg_price.unwrap_or(Decimal::ZERO),
            mark_price: p.mark_price.unwrap_or(Decimal::ZERO),
            unrealized_pnl: p.unrealised_pnl.unwrap_or(Decimal::ZERO),
        }))
    }

    async fn validate_symbol(&self, symbol: &str) -> Result<bool, GatewayError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result: BybitList<BybitInstrument> =
            self.get("/v5/market/instruments-info", &query, false).await?;

        Ok(result
            .list
            .iter()
            .any(|i| i.symbol == symbol && i.status == "Trading"))
    }
}
