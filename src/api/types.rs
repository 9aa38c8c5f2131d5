//! API response types for the Binance futures and Bybit v5 REST APIs.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

/// Bybit sends empty strings for absent numeric fields; treat those as `None`.
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    match raw {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Decimal::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(serde_json::Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected decimal, got {}",
            other
        ))),
    }
}

// ==================== Binance ====================

/// Error body returned by Binance on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceErrorResponse {
    pub code: i64,
    pub msg: String,
}

/// One asset from `GET /fapi/v2/balance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceBalance {
    pub asset: String,
    pub balance: Decimal,
    pub available_balance: Decimal,
}

/// `GET /fapi/v1/ticker/price`.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceTickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

/// `POST /fapi/v1/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOrderResponse {
    pub order_id: i64,
    pub client_order_id: String,
    pub status: String,
    #[serde(default)]
    pub orig_qty: Option<Decimal>,
}

/// One row of `GET /fapi/v2/positionRisk`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinancePositionRisk {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub un_realized_profit: Decimal,
}

/// `GET /fapi/v1/exchangeInfo` (only the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceExchangeInfo {
    pub symbols: Vec<BinanceSymbol>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceSymbol {
    pub symbol: String,
    pub status: String,
}

// ==================== Bybit ====================

/// Common v5 response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitEnvelope<T> {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Option<T>,
}

/// Generic `{ "list": [...] }` result.
#[derive(Debug, Clone, Deserialize)]
pub struct BybitList<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

/// Account from `GET /v5/account/wallet-balance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitWalletAccount {
    pub account_type: String,
    #[serde(default)]
    pub coin: Vec<BybitWalletCoin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitWalletCoin {
    pub coin: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub wallet_balance: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub available_to_withdraw: Option<Decimal>,
}

impl BybitWalletCoin {
    /// Free balance, falling back to the wallet balance when the account type
    /// does not report a withdrawable amount.
    pub fn free(&self) -> Decimal {
        self.available_to_withdraw
            .or(self.wallet_balance)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Ticker from `GET /v5/market/tickers`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitTicker {
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub last_price: Option<Decimal>,
}

/// `POST /v5/order/create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrderResult {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

/// Position from `GET /v5/position/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// `Buy`, `Sell` or empty when flat
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub mark_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub unrealised_pnl: Option<Decimal>,
}

/// Instrument from `GET /v5/market/instruments-info`.
#[derive(Debug, Clone, Deserialize)]
pub struct BybitInstrument {
    pub symbol: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bybit_wallet_parses_empty_strings() {
        let json = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [{
                    "accountType": "UNIFIED",
                    "coin": [
                        {"coin": "USDT", "walletBalance": "152.3", "availableToWithdraw": ""}
                    ]
                }]
            }
        }"#;

        let parsed: BybitEnvelope<BybitList<BybitWalletAccount>> =
            serde_json::from_str(json).unwrap();
        assert_eq!(parsed.ret_code, 0);
        let account = &parsed.result.unwrap().list[0];
        assert_eq!(account.account_type, "UNIFIED");
        assert_eq!(account.coin[0].available_to_withdraw, None);
        assert_eq!(account.coin[0].free(), dec!(152.3));
    }

    #[test]
    fn test_bybit_flat_position() {
        let json = r#"{"symbol": "HYPEUSDT", "side": "", "size": "0", "avgPrice": "", "markPrice": "40.1", "unrealisedPnl": ""}"#;
        let pos: BybitPosition = serde_json::from_str(json).unwrap();
        assert_eq!(pos.size, Some(Decimal::ZERO));
        assert_eq!(pos.avg_price, None);
        assert_eq!(pos.mark_price, Some(dec!(40.1)));
    }

    #[test]
    fn test_binance_position_risk() {
        let json = r#"[{
            "symbol": "HYPEUSDT",
            "positionAmt": "0.118",
            "entryPrice": "39.57",
            "markPrice": "39.80",
            "unRealizedProfit": "0.0271",
            "leverage": "25"
        }]"#;
        let rows: Vec<BinancePositionRisk> = serde_json::from_str(json).unwrap();
        assert_eq!(rows[0].position_amt, dec!(0.118));
        assert_eq!(rows[0].un_realized_profit, dec!(0.0271));
    }
}
