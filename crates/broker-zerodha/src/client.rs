//! Typed Zerodha Kite Connect v3 REST client.
//!
//! Kite authenticates with `Authorization: token api_key:access_token` and
//! wraps every JSON response in `{status, data}` (or `{status: "error",
//! message, error_type}`). The instrument dump is CSV.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signal_trade_core::{BrokerError, BrokerResult};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Kite Connect production API base URL.
pub const KITE_API_URL: &str = "https://api.kite.trade";

/// Browser login entry point; the user authorizes there and comes back
/// with a request token.
pub const KITE_LOGIN_URL: &str = "https://kite.zerodha.com/connect/login?v=3&api_key=";

const KITE_VERSION: &str = "3";

/// Configuration for the Kite client.
#[derive(Debug, Clone)]
pub struct KiteClientConfig {
    /// Base URL for the API.
    pub base_url: String,

    /// Requests per minute limit.
    pub requests_per_minute: NonZeroU32,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for KiteClientConfig {
    fn default() -> Self {
        Self {
            base_url: KITE_API_URL.to_string(),
            requests_per_minute: nonzero!(180u32),
            timeout_secs: 10,
        }
    }
}

impl KiteClientConfig {
    /// Sets the base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Computes the session checksum: SHA-256 over
/// `api_key + request_token + api_secret`, hex-encoded.
#[must_use]
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_type: String,
    data: Option<T>,
}

/// Session payload from `/session/token`.
#[derive(Debug, Clone, Deserialize)]
pub struct KiteSession {
    pub access_token: String,
    #[serde(default)]
    pub user_id: String,
}

/// One order row from `/orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKiteOrder {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub filled_quantity: u32,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// One net position row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKitePosition {
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub product: String,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    #[serde(default)]
    net: Vec<RawKitePosition>,
}

/// One holding row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKiteHolding {
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub last_price: f64,
}

#[derive(Debug, Deserialize)]
struct MarginsData {
    equity: Option<MarginSegment>,
}

#[derive(Debug, Deserialize)]
struct MarginSegment {
    available: Option<MarginAvailable>,
    utilised: Option<MarginUtilised>,
}

#[derive(Debug, Deserialize)]
struct MarginAvailable {
    #[serde(default)]
    cash: f64,
    #[serde(default)]
    live_balance: f64,
}

#[derive(Debug, Deserialize)]
struct MarginUtilised {
    #[serde(default)]
    debits: f64,
}

/// Funds view assembled from `/user/margins`.
#[derive(Debug, Clone)]
pub struct KiteFunds {
    pub available_cash: Decimal,
    pub used_margin: Decimal,
    pub available_margin: Decimal,
}

#[derive(Debug, Deserialize)]
struct LtpEntry {
    #[serde(default)]
    last_price: f64,
}

#[derive(Debug, Deserialize)]
struct OrderIdData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct TriggerIdData {
    trigger_id: serde_json::Value,
}

/// One row of the instrument CSV dump.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKiteInstrument {
    #[serde(default)]
    pub instrument_token: String,
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instrument_type: String,
    #[serde(default)]
    pub exchange: String,
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// =============================================================================
// Client
// =============================================================================

/// Kite Connect REST client. Session-free; the access token is supplied
/// per call by the broker that owns session state.
pub struct KiteClient {
    config: KiteClientConfig,
    http: Client,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl std::fmt::Debug for KiteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl KiteClient {
    /// Creates a new client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: KiteClientConfig) -> BrokerResult<Self> {
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

    fn auth_header(api_key: &str, access_token: &str) -> String {
        format!("token {api_key}:{access_token}")
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> BrokerResult<T> {
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(BrokerError::RateLimited {
                retry_after_secs: 60,
            });
        }

        let body = response.text().await?;
        let envelope: Envelope<T> = serde_json::from_str(&body)?;
        if envelope.status != "success" {
            if envelope.error_type == "TokenException" {
                return Err(BrokerError::Authentication(envelope.message));
            }
            return Err(BrokerError::api(status.as_u16(), envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| BrokerError::Serialization("response missing data".to_string()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        api_key: &str,
        access_token: &str,
    ) -> BrokerResult<T> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}", self.config.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", Self::auth_header(api_key, access_token))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn post_form<T: DeserializeOwned, F: Serialize>(
        &self,
        path: &str,
        auth: Option<(&str, &str)>,
        form: &F,
    ) -> BrokerResult<T> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}", self.config.base_url, path);
        tracing::debug!("POST {}", url);

        let mut request = self
            .http
            .post(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .form(form);
        if let Some((api_key, access_token)) = auth {
            request = request.header("Authorization", Self::auth_header(api_key, access_token));
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Exchanges a request token for an access token.
    pub async fn create_session(
        &self,
        api_key: &str,
        request_token: &str,
        api_secret: &str,
    ) -> BrokerResult<KiteSession> {
        let checksum = session_checksum(api_key, request_token, api_secret);
        let form = [
            ("api_key", api_key),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ];
        self.post_form("/session/token", None, &form)
            .await
            .map_err(|e| match e {
                BrokerError::Api { message, .. } => BrokerError::Authentication(message),
                other => other,
            })
    }

    /// Fetches the profile; used to validate restored access tokens.
    pub async fn profile(
        &self,
        api_key: &str,
        access_token: &str,
    ) -> BrokerResult<serde_json::Value> {
        self.get("/user/profile", api_key, access_token).await
    }

    /// Invalidates the access token.
    pub async fn invalidate_session(
        &self,
        api_key: &str,
        access_token: &str,
    ) -> BrokerResult<()> {
        self.rate_limiter.until_ready().await;
        let url = format!(
            "{}/session/token?api_key={api_key}&access_token={access_token}",
            self.config.base_url
        );
        let response = self
            .http
            .delete(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .send()
            .await?;
        let _: serde_json::Value = Self::handle_response(response).await?;
        Ok(())
    }

    /// Places a regular order, returning the order id.
    pub async fn place_order(
        &self,
        api_key: &str,
        access_token: &str,
        form: &[(&str, String)],
    ) -> BrokerResult<String> {
        let data: OrderIdData = self
            .post_form("/orders/regular", Some((api_key, access_token)), &form)
            .await?;
        Ok(data.order_id)
    }

    /// Modifies a regular order.
    pub async fn modify_order(
        &self,
        api_key: &str,
        access_token: &str,
        order_id: &str,
        form: &[(&str, String)],
    ) -> BrokerResult<()> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}/orders/regular/{order_id}", self.config.base_url);
        let response = self
            .http
            .put(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", Self::auth_header(api_key, access_token))
            .form(&form)
            .send()
            .await?;
        let _: OrderIdData = Self::handle_response(response).await?;
        Ok(())
    }

    /// Cancels a regular order.
    pub async fn cancel_order(
        &self,
        api_key: &str,
        access_token: &str,
        order_id: &str,
    ) -> BrokerResult<()> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}/orders/regular/{order_id}", self.config.base_url);
        let response = self
            .http
            .delete(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", Self::auth_header(api_key, access_token))
            .send()
            .await?;
        let _: OrderIdData = Self::handle_response(response).await?;
        Ok(())
    }

    /// Fetches today's orders.
    pub async fn orders(
        &self,
        api_key: &str,
        access_token: &str,
    ) -> BrokerResult<Vec<RawKiteOrder>> {
        self.get("/orders", api_key, access_token).await
    }

    /// Fetches net positions.
    pub async fn positions(
        &self,
        api_key: &str,
        access_token: &str,
    ) -> BrokerResult<Vec<RawKitePosition>> {
        let data: PositionsData = self.get("/portfolio/positions", api_key, access_token).await?;
        Ok(data.net)
    }

    /// Fetches holdings.
    pub async fn holdings(
        &self,
        api_key: &str,
        access_token: &str,
    ) -> BrokerResult<Vec<RawKiteHolding>> {
        self.get("/portfolio/holdings", api_key, access_token).await
    }

    /// Fetches funds from the equity margin segment.
    pub async fn margins(&self, api_key: &str, access_token: &str) -> BrokerResult<KiteFunds> {
        let data: MarginsData = self.get("/user/margins", api_key, access_token).await?;
        let equity = data.equity.unwrap_or(MarginSegment {
            available: None,
            utilised: None,
        });
        let available = equity.available.unwrap_or(MarginAvailable {
            cash: 0.0,
            live_balance: 0.0,
        });
        let utilised = equity.utilised.unwrap_or(MarginUtilised { debits: 0.0 });
        Ok(KiteFunds {
            available_cash: Decimal::try_from(available.cash).unwrap_or_default(),
            used_margin: Decimal::try_from(utilised.debits).unwrap_or_default(),
            available_margin: Decimal::try_from(available.live_balance).unwrap_or_default(),
        })
    }

    /// Fetches the last traded price for `EXCHANGE:SYMBOL`.
    pub async fn ltp(
        &self,
        api_key: &str,
        access_token: &str,
        instrument: &str,
    ) -> BrokerResult<Decimal> {
        let path = format!("/quote/ltp?i={instrument}");
        let data: HashMap<String, LtpEntry> = self.get(&path, api_key, access_token).await?;
        let entry = data
            .get(instrument)
            .ok_or_else(|| BrokerError::Serialization(format!("no quote for {instrument}")))?;
        Decimal::try_from(entry.last_price)
            .map_err(|e| BrokerError::Serialization(format!("bad ltp value: {e}")))
    }

    /// Registers a single-trigger GTT, returning the trigger id.
    pub async fn place_gtt(
        &self,
        api_key: &str,
        access_token: &str,
        condition: &serde_json::Value,
        orders: &serde_json::Value,
    ) -> BrokerResult<String> {
        let form = [
            ("type", "single".to_string()),
            ("condition", condition.to_string()),
            ("orders", orders.to_string()),
        ];
        let data: TriggerIdData = self
            .post_form("/gtt/triggers", Some((api_key, access_token)), &form)
            .await?;
        Ok(data.trigger_id.to_string())
    }

    /// Downloads the instrument CSV dump for one exchange and parses it.
    pub async fn instruments(
        &self,
        api_key: &str,
        access_token: &str,
        exchange: &str,
    ) -> BrokerResult<Vec<RawKiteInstrument>> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}/instruments/{exchange}", self.config.base_url);
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", Self::auth_header(api_key, access_token))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::api(status.as_u16(), text));
        }

        let body = response.text().await?;
        let mut reader = csv::Reader::from_reader(body.as_bytes());
        let mut instruments = Vec::new();
        for record in reader.deserialize::<RawKiteInstrument>() {
            match record {
                Ok(inst) => instruments.push(inst),
                Err(e) => tracing::debug!(error = %e, "skipping malformed instrument row"),
            }
        }
        Ok(instruments)
    }
}
