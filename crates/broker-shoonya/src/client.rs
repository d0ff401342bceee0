//! Typed Shoonya (Noren) REST client.
//!
//! Noren speaks a bespoke form protocol: every call POSTs a body of
//! `jData=<json>` plus `&jKey=<session token>` once logged in, and answers
//! either an object carrying `stat: "Ok" | "Not_Ok"` or a bare JSON array
//! for book-style endpoints.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use signal_trade_core::{BrokerError, BrokerResult};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Shoonya production API base URL.
pub const SHOONYA_API_URL: &str = "https://api.shoonya.com/NorenWClientTP";

/// Configuration for the Noren client.
#[derive(Debug, Clone)]
pub struct NorenClientConfig {
    /// Base URL for the API.
    pub base_url: String,

    /// Requests per minute limit.
    pub requests_per_minute: NonZeroU32,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for NorenClientConfig {
    fn default() -> Self {
        Self {
            base_url: SHOONYA_API_URL.to_string(),
            requests_per_minute: nonzero!(120u32),
            timeout_secs: 10,
        }
    }
}

impl NorenClientConfig {
    /// Sets the base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// SHA-256 hex digest, used for both the password and the app key.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Wire types
// =============================================================================

/// Login response.
#[derive(Debug, Clone, Deserialize)]
pub struct NorenSession {
    #[serde(default)]
    pub susertoken: String,
    #[serde(default)]
    pub uname: String,
}

/// One order-book row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenOrder {
    #[serde(default)]
    pub norenordno: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tsym: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub fillshares: String,
    #[serde(default)]
    pub avgprc: String,
    #[serde(default)]
    pub rejreason: String,
}

/// One position row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenPosition {
    #[serde(default)]
    pub tsym: String,
    #[serde(default)]
    pub exch: String,
    #[serde(default)]
    pub netqty: String,
    #[serde(default)]
    pub netavgprc: String,
    #[serde(default)]
    pub lp: String,
    #[serde(default)]
    pub rpnl: String,
    #[serde(default)]
    pub prd: String,
}

/// One holdings row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenHolding {
    #[serde(default)]
    pub exch_tsym: Vec<RawNorenHoldingSymbol>,
    #[serde(default)]
    pub holdqty: String,
    #[serde(default)]
    pub upldprc: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenHoldingSymbol {
    #[serde(default)]
    pub exch: String,
    #[serde(default)]
    pub tsym: String,
}

/// Limits (funds) response.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenLimits {
    #[serde(default)]
    pub cash: String,
    #[serde(default)]
    pub marginused: String,
}

/// Quote response; only the last price is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenQuote {
    #[serde(default)]
    pub lp: String,
}

/// One scrip search hit.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNorenScrip {
    #[serde(default)]
    pub exch: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub tsym: String,
    #[serde(default)]
    pub cname: String,
    #[serde(default)]
    pub instname: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    values: Vec<RawNorenScrip>,
}

#[derive(Debug, Deserialize)]
struct PlacedOrder {
    #[serde(default)]
    norenordno: String,
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// =============================================================================
// Client
// =============================================================================

/// Noren REST client. The session token (`jKey`) is supplied per call by
/// the broker that owns session state.
pub struct NorenClient {
    config: NorenClientConfig,
    http: Client,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl std::fmt::Debug for NorenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorenClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl NorenClient {
    /// Creates a new client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: NorenClientConfig) -> BrokerResult<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BrokerError::Network(format!("failed to build HTTP client: {e}")))?;
        let quota = Quota::per_minute(config.requests_per_minute);
        Ok(Self {
            config,
            http,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    async fn post_raw(
        &self,
        endpoint: &str,
        jdata: &serde_json::Value,
        jkey: Option<&str>,
    ) -> BrokerResult<serde_json::Value> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/{endpoint}", self.config.base_url);
        let mut body = format!("jData={jdata}");
        if let Some(jkey) = jkey {
            body.push_str("&jKey=");
            body.push_str(jkey);
        }
        tracing::debug!("POST {}", url);

        let response = self.http.post(&url).body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::api(status.as_u16(), text));
        }

        let value: serde_json::Value = response.json().await?;
        Ok(value)
    }

    /// Calls an endpoint that answers a single `{stat: ...}` object.
    async fn post_object<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        jdata: &serde_json::Value,
        jkey: Option<&str>,
    ) -> BrokerResult<T> {
        let value = self.post_raw(endpoint, jdata, jkey).await?;
        let stat = value.get("stat").and_then(|s| s.as_str()).unwrap_or("");
        if stat != "Ok" {
            let emsg = value
                .get("emsg")
                .and_then(|m| m.as_str())
                .unwrap_or("request failed")
                .to_string();
            return Err(BrokerError::api(200, emsg));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Calls a book-style endpoint that answers either a bare array or a
    /// `Not_Ok` object (which Noren also uses for "no data").
    async fn post_list<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        jdata: &serde_json::Value,
        jkey: &str,
    ) -> BrokerResult<Vec<T>> {
        let value = self.post_raw(endpoint, jdata, Some(jkey)).await?;
        match value {
            serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
            other => {
                let emsg = other
                    .get("emsg")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                // "no data" is an empty book, not an error.
                if emsg.to_ascii_lowercase().contains("no data") {
                    return Ok(Vec::new());
                }
                Err(BrokerError::api(200, emsg.to_string()))
            }
        }
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Logs in. `password_hash` is the SHA-256 of the trading password and
    /// `app_key` the SHA-256 of `uid|api_key`.
    pub async fn login(
        &self,
        uid: &str,
        password_hash: &str,
        factor2: &str,
        vendor_code: &str,
        app_key: &str,
        imei: &str,
    ) -> BrokerResult<NorenSession> {
        let jdata = serde_json::json!({
            "source": "API",
            "apkversion": "1.0.0",
            "uid": uid,
            "pwd": password_hash,
            "factor2": factor2,
            "vc": vendor_code,
            "appkey": app_key,
            "imei": imei,
        });
        self.post_object("QuickAuth", &jdata, None)
            .await
            .map_err(|e| match e {
                BrokerError::Api { message, .. } => {
                    BrokerError::Authentication(format!("Login failed: {message}"))
                }
                other => other,
            })
    }

    /// Terminates the session.
    pub async fn logout(&self, uid: &str, jkey: &str) -> BrokerResult<()> {
        let jdata = serde_json::json!({ "uid": uid });
        let _: serde_json::Value = self.post_object("Logout", &jdata, Some(jkey)).await?;
        Ok(())
    }

    /// Places an order, returning the Noren order number.
    pub async fn place_order(
        &self,
        uid: &str,
        jkey: &str,
        jdata: &serde_json::Value,
    ) -> BrokerResult<String> {
        let mut payload = jdata.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("uid".to_string(), uid.into());
            map.insert("actid".to_string(), uid.into());
        }
        let placed: PlacedOrder = self.post_object("PlaceOrder", &payload, Some(jkey)).await?;
        if placed.norenordno.is_empty() {
            return Err(BrokerError::OrderPlacementFailed(
                "order response missing order number".to_string(),
            ));
        }
        Ok(placed.norenordno)
    }

    /// Cancels an order.
    pub async fn cancel_order(&self, uid: &str, jkey: &str, order_id: &str) -> BrokerResult<()> {
        let jdata = serde_json::json!({ "uid": uid, "norenordno": order_id });
        let _: serde_json::Value = self.post_object("CancelOrder", &jdata, Some(jkey)).await?;
        Ok(())
    }

    /// Modifies an order with the provided fields.
    pub async fn modify_order(
        &self,
        uid: &str,
        jkey: &str,
        jdata: &serde_json::Value,
    ) -> BrokerResult<()> {
        let mut payload = jdata.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("uid".to_string(), uid.into());
        }
        let _: serde_json::Value = self.post_object("ModifyOrder", &payload, Some(jkey)).await?;
        Ok(())
    }

    /// Fetches today's order book.
    pub async fn order_book(&self, uid: &str, jkey: &str) -> BrokerResult<Vec<RawNorenOrder>> {
        let jdata = serde_json::json!({ "uid": uid });
        self.post_list("OrderBook", &jdata, jkey).await
    }

    /// Fetches the history of one order; the last entry is the latest.
    pub async fn single_order_history(
        &self,
        uid: &str,
        jkey: &str,
        order_id: &str,
    ) -> BrokerResult<Vec<RawNorenOrder>> {
        let jdata = serde_json::json!({ "uid": uid, "norenordno": order_id });
        self.post_list("SingleOrdHist", &jdata, jkey).await
    }

    /// Fetches the position book.
    pub async fn positions(&self, uid: &str, jkey: &str) -> BrokerResult<Vec<RawNorenPosition>> {
        let jdata = serde_json::json!({ "uid": uid, "actid": uid });
        self.post_list("PositionBook", &jdata, jkey).await
    }

    /// Fetches holdings.
    pub async fn holdings(&self, uid: &str, jkey: &str) -> BrokerResult<Vec<RawNorenHolding>> {
        let jdata = serde_json::json!({ "uid": uid, "actid": uid, "prd": "C" });
        self.post_list("Holdings", &jdata, jkey).await
    }

    /// Fetches account limits (funds).
    pub async fn limits(&self, uid: &str, jkey: &str) -> BrokerResult<RawNorenLimits> {
        let jdata = serde_json::json!({ "uid": uid, "actid": uid });
        self.post_object("Limits", &jdata, Some(jkey)).await
    }

    /// Fetches a quote. Noren keys quotes by token; the service passes the
    /// trading symbol through, which the vendor accepts for equities.
    pub async fn quote(
        &self,
        uid: &str,
        jkey: &str,
        exchange: &str,
        token: &str,
    ) -> BrokerResult<RawNorenQuote> {
        let jdata = serde_json::json!({ "uid": uid, "exch": exchange, "token": token });
        self.post_object("GetQuotes", &jdata, Some(jkey)).await
    }

    /// Searches scrips on one exchange.
    pub async fn search_scrip(
        &self,
        uid: &str,
        jkey: &str,
        exchange: &str,
        text: &str,
    ) -> BrokerResult<Vec<RawNorenScrip>> {
        let jdata = serde_json::json!({ "uid": uid, "exch": exchange, "stext": text });
        let response: SearchResponse = self.post_object("SearchScrip", &jdata, Some(jkey)).await?;
        Ok(response.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> NorenClient {
        NorenClient::new(NorenClientConfig::default().with_base_url(server.uri())).unwrap()
    }

    #[test]
    fn sha256_hex_is_stable_lowercase_hex() {
        let digest = sha256_hex("password");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha256_hex("password"));
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn login_returns_session_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/QuickAuth"))
            .and(body_string_contains("jData="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stat": "Ok",
                "susertoken": "tok-1",
                "uname": "Test User"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = client
            .login("FA0001", "hash", "123456", "FA0001_U", "appkey", "abc1234")
            .await
            .unwrap();
        assert_eq!(session.susertoken, "tok-1");
    }

    #[tokio::test]
    async fn not_ok_login_maps_to_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/QuickAuth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stat": "Not_Ok",
                "emsg": "Invalid Input : Wrong Password"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .login("FA0001", "bad", "123456", "FA0001_U", "appkey", "abc1234")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authentication(_)));
        assert!(err.to_string().contains("Wrong Password"));
    }

    #[tokio::test]
    async fn order_book_parses_bare_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/OrderBook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"norenordno": "1", "status": "COMPLETE", "tsym": "RELIANCE-EQ",
                 "qty": "10", "fillshares": "10", "avgprc": "2885.50"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let orders = client.order_book("FA0001", "tok").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].avgprc, "2885.50");
    }

    #[tokio::test]
    async fn no_data_response_is_an_empty_book() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/OrderBook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stat": "Not_Ok",
                "emsg": "Error Occurred : 5 \"no data\""
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let orders = client.order_book("FA0001", "tok").await.unwrap();
        assert!(orders.is_empty());
    }
}
