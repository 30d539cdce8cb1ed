// =============================================================================
// ExchangeClient — HMAC-SHA256 signed REST calls to Binance USDM futures
// =============================================================================
//
// Targets the USDM futures REST surface (`/fapi/v1`, `/fapi/v2`) rather
// than spot (`/api/v3`): `positionRisk` and `fundingRate` have no spot
// equivalent, and order placement carries `positionSide`/leverage concerns
// spot trading doesn't. Errors are classified into `EngineError` variants
// by status code so the caller (execution engine, reconciliation) can apply
// the right policy without re-inspecting the HTTP status itself.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::types::{OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

/// Binance USDM futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl ExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet {
            "https://testnet.binancefuture.com".to_string()
        } else {
            "https://fapi.binance.com".to_string()
        };

        debug!(base_url = %base_url, "ExchangeClient initialised");

        Self {
            secret,
            base_url,
            client,
        }
    }

    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Classify a non-2xx response into the right `EngineError` variant.
    fn classify_error(status: StatusCode, body: &Value) -> EngineError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            EngineError::AuthFailure(format!("{status}: {body}"))
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 418
            || status.is_server_error()
        {
            EngineError::ExchangeTransient(format!("{status}: {body}"))
        } else {
            EngineError::ExchangeRejection(format!("{status}: {body}"))
        }
    }

    async fn get(&self, path: &str, signed: bool, params: &str) -> Result<Value, EngineError> {
        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("GET {path}: {e}")))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("GET {path} decode: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        Ok(body)
    }

    /// GET /fapi/v2/account (signed).
    #[instrument(skip(self), name = "exchange::get_account")]
    pub async fn get_account(&self) -> Result<Value, EngineError> {
        self.get("/fapi/v2/account", true, "").await
    }

    /// GET /fapi/v2/positionRisk (signed) — current exchange-side positions.
    #[instrument(skip(self), name = "exchange::get_position_risk")]
    pub async fn get_position_risk(&self, symbol: Option<&str>) -> Result<Vec<Value>, EngineError> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self.get("/fapi/v2/positionRisk", true, &params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "exchange::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Value>, EngineError> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self.get("/fapi/v1/openOrders", true, &params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// POST /fapi/v1/order (signed) — submit a new order.
    #[instrument(skip(self, price, client_order_id), name = "exchange::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
        client_order_id: &str,
    ) -> Result<Value, EngineError> {
        let mut params = format!(
            "symbol={symbol}&side={}&type={}&quantity={quantity}&newClientOrderId={client_order_id}",
            side.as_wire(),
            order_type,
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(sp) = stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }

        debug!(symbol, side = %side, order_type = %order_type, quantity, client_order_id, "placing order");

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("POST /fapi/v1/order: {e}")))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("order response decode: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        Ok(body)
    }

    /// DELETE /fapi/v1/order (signed) — cancel by client order id.
    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<Value, EngineError> {
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("DELETE /fapi/v1/order: {e}")))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("cancel response decode: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        Ok(body)
    }

    /// GET /fapi/v1/klines (public).
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Value>, EngineError> {
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self.get("/fapi/v1/klines", false, &params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// GET /fapi/v1/exchangeInfo filtered by symbol — trading filters.
    #[instrument(skip(self), name = "exchange::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<Value, EngineError> {
        let body = self.get("/fapi/v1/exchangeInfo", false, "").await?;
        body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)).cloned())
            .ok_or_else(|| EngineError::ExchangeRejection(format!("symbol {symbol} not found in exchangeInfo")))
    }

    /// GET /fapi/v1/fundingRate (public) — latest funding rate history.
    #[instrument(skip(self), name = "exchange::get_funding_rate")]
    pub async fn get_funding_rate(&self, symbol: &str, limit: u32) -> Result<Vec<Value>, EngineError> {
        let params = format!("symbol={symbol}&limit={limit}");
        let body = self.get("/fapi/v1/fundingRate", false, &params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// POST /fapi/v1/listenKey — mint a new user-data stream key. Unlike
    /// every other private endpoint this one is authenticated by the
    /// `X-MBX-APIKEY` header alone; it takes no signature.
    #[instrument(skip(self), name = "exchange::create_listen_key")]
    pub async fn create_listen_key(&self) -> Result<String, EngineError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("POST listenKey: {e}")))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("listenKey decode: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        body["listenKey"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| EngineError::ExchangeRejection(format!("listenKey response missing key: {body}")))
    }

    /// PUT /fapi/v1/listenKey — extend the current key's validity by 60
    /// minutes. The exchange expires an un-pinged key after 60 minutes, so
    /// the caller pings this on an interval comfortably under that (the
    /// specification requires one no longer than every 30 minutes).
    #[instrument(skip(self), name = "exchange::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self) -> Result<(), EngineError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("PUT listenKey: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(Self::classify_error(status, &body));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_secret_and_query() {
        let client = ExchangeClient::new("key", "secret", true);
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "hex-encoded sha256 digest is 64 chars");
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let client = ExchangeClient::new("key", "supersecret", false);
        let debug_str = format!("{client:?}");
        assert!(!debug_str.contains("supersecret"));
        assert!(debug_str.contains("fapi.binance.com"));
    }

    #[test]
    fn testnet_flag_selects_base_url() {
        let client = ExchangeClient::new("key", "secret", true);
        assert!(format!("{client:?}").contains("testnet"));
    }
}
