//! Typed Angel One SmartAPI REST client with rate limiting.
//!
//! Wraps the vendor endpoints the backend needs: session login/logout,
//! profile, order placement and management, order book, positions,
//! holdings, funds, and LTP. Every response arrives in the vendor envelope
//! `{status, message, errorcode, data}`.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use signal_trade_core::{BrokerError, BrokerResult};
use std::num::NonZeroU32;
use std::sync::Arc;

// =============================================================================
// Constants
// =============================================================================

/// Angel One production API base URL.
pub const ANGELONE_API_URL: &str = "https://apiconnect.angelbroking.com";

const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
const LOGOUT_PATH: &str = "/rest/secure/angelbroking/user/v1/logout";
const PROFILE_PATH: &str = "/rest/secure/angelbroking/user/v1/getProfile";
const PLACE_ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1/placeOrder";
const MODIFY_ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1/modifyOrder";
const CANCEL_ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1/cancelOrder";
const ORDER_BOOK_PATH: &str = "/rest/secure/angelbroking/order/v1/getOrderBook";
const POSITIONS_PATH: &str = "/rest/secure/angelbroking/order/v1/getPosition";
const HOLDINGS_PATH: &str = "/rest/secure/angelbroking/portfolio/v1/getHolding";
const FUNDS_PATH: &str = "/rest/secure/angelbroking/user/v1/getRMS";
const LTP_PATH: &str = "/rest/secure/angelbroking/order/v1/getLtpData";
const GTT_CREATE_PATH: &str = "/rest/secure/angelbroking/gtt/v1/createRule";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Angel One client.
#[derive(Debug, Clone)]
pub struct AngelOneClientConfig {
    /// Base URL for the API.
    pub base_url: String,

    /// Requests per minute limit.
    pub requests_per_minute: NonZeroU32,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AngelOneClientConfig {
    fn default() -> Self {
        Self {
            base_url: ANGELONE_API_URL.to_string(),
            requests_per_minute: nonzero!(120u32),
            timeout_secs: 10,
        }
    }
}

impl AngelOneClientConfig {
    /// Sets the base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Vendor response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errorcode: String,
    data: Option<T>,
}

/// Session tokens returned by a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionTokens {
    #[serde(rename = "jwtToken")]
    pub jwt_token: String,
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: String,
    #[serde(rename = "feedToken", default)]
    pub feed_token: String,
}

/// Profile payload; only used to validate a session is alive.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    #[serde(rename = "clientcode", default)]
    pub client_code: String,
    #[serde(default)]
    pub name: String,
}

/// Order parameters in vendor vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct RawOrderParams {
    pub variety: String,
    pub tradingsymbol: String,
    pub symboltoken: String,
    pub transactiontype: String,
    pub exchange: String,
    pub ordertype: String,
    pub producttype: String,
    pub duration: String,
    pub quantity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggerprice: Option<String>,
    /// Bracket (ROBO) square-off points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squareoff: Option<String>,
    /// Bracket (ROBO) stop-loss points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stoploss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailingstoploss: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlacedOrder {
    #[serde(default)]
    orderid: String,
}

/// One order-book row as the vendor serializes it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrder {
    #[serde(default)]
    pub orderid: String,
    #[serde(default)]
    pub orderstatus: String,
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub quantity: String,
    #[serde(default)]
    pub filledshares: String,
    /// The vendor serializes prices as strings ("2885.50").
    #[serde(default)]
    pub averageprice: String,
    /// Rejection reason when `orderstatus` is `rejected`.
    #[serde(default)]
    pub text: String,
}

/// One position row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPosition {
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub netqty: String,
    #[serde(default)]
    pub avgnetprice: String,
    #[serde(default)]
    pub ltp: String,
    #[serde(default)]
    pub pnl: String,
    #[serde(default)]
    pub producttype: String,
}

/// One holding row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawHolding {
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub averageprice: String,
    #[serde(default)]
    pub ltp: String,
}

/// RMS (funds) payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFunds {
    #[serde(default)]
    pub availablecash: String,
    #[serde(default)]
    pub utiliseddebits: String,
    #[serde(default)]
    pub net: String,
}

#[derive(Debug, Deserialize)]
struct LtpData {
    ltp: f64,
}

#[derive(Debug, Deserialize)]
struct GttRule {
    #[serde(default)]
    id: String,
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// =============================================================================
// Client
// =============================================================================

/// Angel One SmartAPI REST client.
///
/// Session-free by design: the jwt for each call is supplied by the broker
/// that owns the session state.
pub struct AngelOneClient {
    config: AngelOneClientConfig,
    http: Client,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl std::fmt::Debug for AngelOneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AngelOneClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl AngelOneClient {
    /// Creates a new client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: AngelOneClientConfig) -> BrokerResult<Self> {
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

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        api_key: &str,
        jwt: Option<&str>,
        body: &B,
    ) -> BrokerResult<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.config.base_url, path);
        tracing::debug!("POST {}", url);

        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", "127.0.0.1")
            .header("X-ClientPublicIP", "127.0.0.1")
            .header("X-MACAddress", "00:00:00:00:00:00")
            .header("X-PrivateKey", api_key)
            .json(body);
        if let Some(jwt) = jwt {
            request = request.header("Authorization", format!("Bearer {jwt}"));
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        api_key: &str,
        jwt: &str,
    ) -> BrokerResult<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.config.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", "127.0.0.1")
            .header("X-ClientPublicIP", "127.0.0.1")
            .header("X-MACAddress", "00:00:00:00:00:00")
            .header("X-PrivateKey", api_key)
            .header("Authorization", format!("Bearer {jwt}"))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Unwraps the vendor envelope, mapping `status: false` into an error
    /// with the vendor message verbatim.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> BrokerResult<T> {
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(BrokerError::RateLimited {
                retry_after_secs: 60,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::api(status.as_u16(), text));
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.status {
            let message = if envelope.message.is_empty() {
                format!("vendor error {}", envelope.errorcode)
            } else {
                envelope.message
            };
            return Err(BrokerError::api(200, message));
        }
        envelope
            .data
            .ok_or_else(|| BrokerError::Serialization("response missing data".to_string()))
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Logs in with password + TOTP, returning the session tokens.
    ///
    /// # Errors
    /// Returns an error on transport failure or vendor rejection.
    pub async fn login(
        &self,
        api_key: &str,
        client_code: &str,
        password: &str,
        totp: &str,
    ) -> BrokerResult<SessionTokens> {
        let body = serde_json::json!({
            "clientcode": client_code,
            "password": password,
            "totp": totp,
        });
        self.post(LOGIN_PATH, api_key, None, &body)
            .await
            .map_err(|e| match e {
                BrokerError::Api { message, .. } => BrokerError::Authentication(message),
                other => other,
            })
    }

    /// Terminates the vendor session.
    pub async fn logout(&self, api_key: &str, jwt: &str, client_code: &str) -> BrokerResult<()> {
        let body = serde_json::json!({ "clientcode": client_code });
        let _: serde_json::Value = self.post(LOGOUT_PATH, api_key, Some(jwt), &body).await?;
        Ok(())
    }

    /// Fetches the profile; used to validate restored sessions.
    pub async fn profile(&self, api_key: &str, jwt: &str) -> BrokerResult<Profile> {
        self.get(PROFILE_PATH, api_key, jwt).await
    }

    /// Places an order, returning the vendor order id.
    pub async fn place_order(
        &self,
        api_key: &str,
        jwt: &str,
        params: &RawOrderParams,
    ) -> BrokerResult<String> {
        let placed: PlacedOrder = self.post(PLACE_ORDER_PATH, api_key, Some(jwt), params).await?;
        if placed.orderid.is_empty() {
            return Err(BrokerError::OrderPlacementFailed(
                "order response missing order id".to_string(),
            ));
        }
        Ok(placed.orderid)
    }

    /// Modifies an open order.
    pub async fn modify_order(
        &self,
        api_key: &str,
        jwt: &str,
        body: &serde_json::Value,
    ) -> BrokerResult<()> {
        let _: serde_json::Value = self.post(MODIFY_ORDER_PATH, api_key, Some(jwt), body).await?;
        Ok(())
    }

    /// Cancels an open order.
    pub async fn cancel_order(
        &self,
        api_key: &str,
        jwt: &str,
        order_id: &str,
        variety: &str,
    ) -> BrokerResult<()> {
        let body = serde_json::json!({ "variety": variety, "orderid": order_id });
        let _: serde_json::Value = self.post(CANCEL_ORDER_PATH, api_key, Some(jwt), &body).await?;
        Ok(())
    }

    /// Fetches today's order book.
    pub async fn order_book(&self, api_key: &str, jwt: &str) -> BrokerResult<Vec<RawOrder>> {
        // The vendor returns `data: null` for an empty book.
        let orders: Option<Vec<RawOrder>> = match self.get(ORDER_BOOK_PATH, api_key, jwt).await {
            Ok(orders) => Some(orders),
            Err(BrokerError::Serialization(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(orders.unwrap_or_default())
    }

    /// Fetches open positions.
    pub async fn positions(&self, api_key: &str, jwt: &str) -> BrokerResult<Vec<RawPosition>> {
        let positions: Option<Vec<RawPosition>> = match self.get(POSITIONS_PATH, api_key, jwt).await
        {
            Ok(p) => Some(p),
            Err(BrokerError::Serialization(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(positions.unwrap_or_default())
    }

    /// Fetches holdings.
    pub async fn holdings(&self, api_key: &str, jwt: &str) -> BrokerResult<Vec<RawHolding>> {
        let holdings: Option<Vec<RawHolding>> = match self.get(HOLDINGS_PATH, api_key, jwt).await {
            Ok(h) => Some(h),
            Err(BrokerError::Serialization(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(holdings.unwrap_or_default())
    }

    /// Fetches RMS limits (funds and margins).
    pub async fn funds(&self, api_key: &str, jwt: &str) -> BrokerResult<RawFunds> {
        self.get(FUNDS_PATH, api_key, jwt).await
    }

    /// Fetches the last traded price for a token.
    pub async fn ltp(
        &self,
        api_key: &str,
        jwt: &str,
        exchange: &str,
        symbol: &str,
        token: &str,
    ) -> BrokerResult<Decimal> {
        let body = serde_json::json!({
            "exchange": exchange,
            "tradingsymbol": symbol,
            "symboltoken": token,
        });
        let data: LtpData = self.post(LTP_PATH, api_key, Some(jwt), &body).await?;
        Decimal::try_from(data.ltp)
            .map_err(|e| BrokerError::Serialization(format!("bad ltp value: {e}")))
    }

    /// Creates a GTT rule, returning the rule id.
    pub async fn create_gtt_rule(
        &self,
        api_key: &str,
        jwt: &str,
        body: &serde_json::Value,
    ) -> BrokerResult<String> {
        let rule: GttRule = self.post(GTT_CREATE_PATH, api_key, Some(jwt), body).await?;
        Ok(rule.id)
    }
}
