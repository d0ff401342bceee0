//! Angel One implementation of the [`Broker`] contract.
//!
//! Symbol tokens come from the shared instrument index rather than a
//! vendor search endpoint. Session tokens can be persisted through the
//! credential store and silently restored at wiring time; a restored
//! session is validated with a live profile call before it is trusted.

use crate::client::{AngelOneClient, AngelOneClientConfig, RawOrder, RawOrderParams};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use signal_trade_core::{
    totp, BracketSpec, Broker, BrokerCredentials, BrokerError, BrokerId, BrokerOrderState,
    BrokerResult, CredentialCodec, CredentialStore, Exchange, Funds, GttAck, GttSpec, Holding,
    LoginOutcome, OrderAck, OrderSnapshot, OrderSpec, OrderType, OrderUpdate, Position,
    ProductType, SymbolMatch,
};
use signal_trade_instruments::InstrumentIndex;
use std::str::FromStr;
use std::sync::Arc;

/// Vendor session lifetime used when persisting tokens.
const SESSION_HOURS: i64 = 24;

#[derive(Clone)]
struct Session {
    client_id: String,
    api_key: String,
    jwt: String,
}

/// Angel One backend.
pub struct AngelOneBroker {
    client: AngelOneClient,
    index: Arc<InstrumentIndex>,
    session: RwLock<Option<Session>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    codec: Option<Arc<dyn CredentialCodec>>,
}

impl AngelOneBroker {
    /// Creates a backend over the given instrument index.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: AngelOneClientConfig, index: Arc<InstrumentIndex>) -> BrokerResult<Self> {
        Ok(Self {
            client: AngelOneClient::new(config)?,
            index,
            session: RwLock::new(None),
            credential_store: None,
            codec: None,
        })
    }

    /// Enables session persistence through the credential store.
    #[must_use]
    pub fn with_persistence(
        mut self,
        store: Arc<dyn CredentialStore>,
        codec: Arc<dyn CredentialCodec>,
    ) -> Self {
        self.credential_store = Some(store);
        self.codec = Some(codec);
        self
    }

    fn session(&self) -> BrokerResult<Session> {
        self.session.read().clone().ok_or(BrokerError::NotLoggedIn)
    }

    /// Attempts to restore a persisted session, validating it with a live
    /// profile call before trusting it. Returns whether a session is live
    /// afterwards. A decryption failure deactivates the stored config.
    pub async fn try_restore_session(&self) -> BrokerResult<bool> {
        let (Some(store), Some(codec)) = (&self.credential_store, &self.codec) else {
            return Ok(false);
        };

        let saved = match store.saved_session(BrokerId::AngelOne).await {
            Ok(Some(saved)) => saved,
            Ok(None) => {
                tracing::debug!("no saved Angel One session");
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read saved session");
                return Ok(false);
            }
        };

        let jwt = match codec.decrypt(saved.token.expose_secret()) {
            Ok(jwt) => jwt,
            Err(BrokerError::DecryptionFailed) => {
                tracing::warn!("saved session token failed to decrypt, deactivating config");
                if let Err(e) = store.deactivate(BrokerId::AngelOne).await {
                    tracing::warn!(error = %e, "failed to deactivate broker config");
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match self.client.profile(&saved.api_key, &jwt).await {
            Ok(profile) => {
                tracing::info!(client_id = %saved.client_id, name = %profile.name, "restored Angel One session");
                *self.session.write() = Some(Session {
                    client_id: saved.client_id,
                    api_key: saved.api_key,
                    jwt,
                });
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "saved session is invalid, re-login required");
                // Deactivate so subsequent calls fail fast instead of
                // re-validating a dead session on every start.
                if let Err(e) = store.deactivate(BrokerId::AngelOne).await {
                    tracing::warn!(error = %e, "failed to deactivate broker config");
                }
                Ok(false)
            }
        }
    }

    fn map_status(status: &str) -> BrokerOrderState {
        match status.to_ascii_lowercase().as_str() {
            "complete" => BrokerOrderState::Executed,
            "rejected" => BrokerOrderState::Rejected,
            "cancelled" => BrokerOrderState::Cancelled,
            "open" | "pending" | "trigger pending" | "after market order req received" => {
                BrokerOrderState::Open
            }
            _ => BrokerOrderState::Pending,
        }
    }

    fn snapshot_from(raw: RawOrder) -> OrderSnapshot {
        let state = Self::map_status(&raw.orderstatus);
        let rejection_reason = if state == BrokerOrderState::Rejected && !raw.text.is_empty() {
            Some(raw.text.clone())
        } else {
            None
        };
        OrderSnapshot {
            order_id: raw.orderid,
            broker_status: raw.orderstatus.to_ascii_lowercase(),
            state,
            symbol: raw.tradingsymbol,
            quantity: raw.quantity.trim().parse().unwrap_or(0),
            filled_quantity: raw.filledshares.trim().parse().unwrap_or(0),
            average_price: parse_price(&raw.averageprice),
            rejection_reason,
        }
    }

    /// Resolves the vendor's numeric token for a symbol, falling back to a
    /// one-hit search, then to "0" as the original service did.
    async fn symbol_token(&self, symbol: &str, exchange: &Exchange) -> String {
        if let Some(token) = self.index.get_token(symbol, exchange).await {
            return token;
        }
        let hits = self.index.search(symbol, Some(exchange), 1).await;
        if let Some(hit) = hits.into_iter().next() {
            return hit.token;
        }
        tracing::warn!(symbol, exchange = %exchange, "no token found for symbol");
        "0".to_string()
    }

    fn order_type_code(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOPLOSS_LIMIT",
            OrderType::StopLossMarket => "STOPLOSS_MARKET",
        }
    }

    fn product_code(product: ProductType) -> &'static str {
        match product {
            ProductType::Intraday => "INTRADAY",
            ProductType::Delivery => "DELIVERY",
            ProductType::Margin => "MARGIN",
        }
    }

    async fn persist_session(&self, client_id: &str, jwt: &str) {
        let (Some(store), Some(codec)) = (&self.credential_store, &self.codec) else {
            return;
        };
        let ciphertext = match codec.encrypt(jwt) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encrypt session token");
                return;
            }
        };
        let expires_at = Utc::now() + Duration::hours(SESSION_HOURS);
        if let Err(e) = store
            .store_session(
                BrokerId::AngelOne,
                client_id,
                &SecretString::from(ciphertext),
                expires_at,
            )
            .await
        {
            tracing::warn!(error = %e, "failed to persist session token");
        }
    }
}

fn parse_price(raw: &str) -> Option<Decimal> {
    let value = Decimal::from_str(raw.trim()).ok()?;
    if value.is_zero() {
        None
    } else {
        Some(value)
    }
}

#[async_trait]
impl Broker for AngelOneBroker {
    fn id(&self) -> BrokerId {
        BrokerId::AngelOne
    }

    fn is_logged_in(&self) -> bool {
        self.session.read().is_some()
    }

    fn client_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.client_id.clone())
    }

    async fn login(&self, credentials: &BrokerCredentials) -> BrokerResult<LoginOutcome> {
        let password = credentials
            .password
            .as_ref()
            .ok_or_else(|| BrokerError::Authentication("password required".to_string()))?;

        let totp_code = match &credentials.totp_secret {
            Some(secret) if totp::looks_like_secret(secret.expose_secret()) => {
                totp::totp_now(secret.expose_secret())
                    .map_err(|e| BrokerError::Authentication(e.to_string()))?
            }
            Some(code) => code.expose_secret().to_string(),
            None => String::new(),
        };

        let tokens = self
            .client
            .login(
                &credentials.api_key,
                &credentials.client_id,
                password.expose_secret(),
                &totp_code,
            )
            .await?;

        *self.session.write() = Some(Session {
            client_id: credentials.client_id.clone(),
            api_key: credentials.api_key.clone(),
            jwt: tokens.jwt_token.clone(),
        });
        self.persist_session(&credentials.client_id, &tokens.jwt_token)
            .await;

        tracing::info!(client_id = %credentials.client_id, "logged in to Angel One");
        Ok(LoginOutcome::LoggedIn {
            message: "Logged in successfully".to_string(),
        })
    }

    async fn logout(&self) -> BrokerResult<()> {
        let session = self.session.write().take();
        if let Some(session) = session {
            if let Err(e) = self
                .client
                .logout(&session.api_key, &session.jwt, &session.client_id)
                .await
            {
                tracing::warn!(error = %e, "vendor logout failed, session cleared locally");
            }
        }
        Ok(())
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        let session = self.session()?;
        let token = self.symbol_token(&spec.symbol, &spec.exchange).await;

        let price = spec
            .price
            .filter(|_| matches!(spec.order_type, OrderType::Limit | OrderType::StopLoss));
        let trigger = spec.trigger_price.filter(|_| {
            matches!(
                spec.order_type,
                OrderType::StopLoss | OrderType::StopLossMarket
            )
        });

        let params = RawOrderParams {
            variety: "NORMAL".to_string(),
            tradingsymbol: spec.symbol.clone(),
            symboltoken: token,
            transactiontype: spec.side.as_str().to_string(),
            exchange: spec.exchange.to_string(),
            ordertype: Self::order_type_code(spec.order_type).to_string(),
            producttype: Self::product_code(spec.product_type).to_string(),
            duration: "DAY".to_string(),
            quantity: spec.quantity.to_string(),
            price: price.map(|p| p.to_string()),
            triggerprice: trigger.map(|p| p.to_string()),
            squareoff: None,
            stoploss: None,
            trailingstoploss: None,
        };

        tracing::info!(symbol = %spec.symbol, side = %spec.side, qty = spec.quantity, "placing order");
        let order_id = self
            .client
            .place_order(&session.api_key, &session.jwt, &params)
            .await?;
        Ok(OrderAck {
            order_id,
            message: "Order placed successfully".to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let session = self.session()?;
        self.client
            .cancel_order(&session.api_key, &session.jwt, order_id, "NORMAL")
            .await
    }

    async fn modify_order(&self, order_id: &str, update: &OrderUpdate) -> BrokerResult<()> {
        let session = self.session()?;
        let mut map = serde_json::Map::new();
        map.insert("variety".to_string(), "NORMAL".into());
        map.insert("orderid".to_string(), order_id.into());
        map.insert("duration".to_string(), "DAY".into());
        if let Some(quantity) = update.quantity {
            map.insert("quantity".to_string(), quantity.to_string().into());
        }
        if let Some(price) = update.price {
            map.insert("price".to_string(), price.to_string().into());
        }
        if let Some(trigger) = update.trigger_price {
            map.insert("triggerprice".to_string(), trigger.to_string().into());
        }
        if let Some(order_type) = update.order_type {
            map.insert(
                "ordertype".to_string(),
                Self::order_type_code(order_type).into(),
            );
        }
        self.client
            .modify_order(&session.api_key, &session.jwt, &serde_json::Value::Object(map))
            .await
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        let session = self.session()?;
        let orders = self
            .client
            .order_book(&session.api_key, &session.jwt)
            .await?;
        orders
            .into_iter()
            .find(|o| o.orderid == order_id)
            .map(Self::snapshot_from)
            .ok_or_else(|| BrokerError::order_not_found(order_id))
    }

    async fn all_order_statuses(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let session = self.session()?;
        let orders = self
            .client
            .order_book(&session.api_key, &session.jwt)
            .await?;
        Ok(orders.into_iter().map(Self::snapshot_from).collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let session = self.session()?;
        let raw = self
            .client
            .positions(&session.api_key, &session.jwt)
            .await?;
        Ok(raw
            .into_iter()
            .map(|p| Position {
                symbol: p.tradingsymbol,
                exchange: Exchange::parse(&p.exchange),
                quantity: p.netqty.trim().parse().unwrap_or(0),
                average_price: parse_price(&p.avgnetprice),
                last_price: parse_price(&p.ltp),
                pnl: Decimal::from_str(p.pnl.trim()).ok(),
                product_type: Some(p.producttype),
            })
            .collect())
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        let session = self.session()?;
        let raw = self.client.holdings(&session.api_key, &session.jwt).await?;
        Ok(raw
            .into_iter()
            .map(|h| Holding {
                symbol: h.tradingsymbol,
                exchange: Exchange::parse(&h.exchange),
                quantity: h.quantity,
                average_price: parse_price(&h.averageprice),
                last_price: parse_price(&h.ltp),
            })
            .collect())
    }

    async fn order_book(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        self.all_order_statuses().await
    }

    async fn funds(&self) -> BrokerResult<Funds> {
        let session = self.session()?;
        let raw = self.client.funds(&session.api_key, &session.jwt).await?;
        Ok(Funds {
            available_cash: Decimal::from_str(raw.availablecash.trim()).unwrap_or_default(),
            used_margin: Decimal::from_str(raw.utiliseddebits.trim()).unwrap_or_default(),
            available_margin: Decimal::from_str(raw.net.trim()).unwrap_or_default(),
        })
    }

    async fn ltp(&self, symbol: &str, exchange: &Exchange) -> BrokerResult<Decimal> {
        let session = self.session()?;
        let token = self.symbol_token(symbol, exchange).await;
        self.client
            .ltp(
                &session.api_key,
                &session.jwt,
                exchange.as_str(),
                symbol,
                &token,
            )
            .await
    }

    async fn search_symbols(
        &self,
        query: &str,
        exchange: Option<&Exchange>,
    ) -> BrokerResult<Vec<SymbolMatch>> {
        let hits = self.index.search(query, exchange, 20).await;
        Ok(hits
            .into_iter()
            .map(|inst| SymbolMatch {
                symbol: inst.symbol,
                name: inst.name,
                token: inst.token,
                exchange: inst.exchange,
                instrument_type: inst.instrument_type,
            })
            .collect())
    }

    async fn refresh_instruments(&self) -> BrokerResult<bool> {
        self.index
            .load(true)
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn place_bracket_order(&self, spec: &BracketSpec) -> BrokerResult<OrderAck> {
        let session = self.session()?;
        let token = self.symbol_token(&spec.symbol, &spec.exchange).await;

        // ROBO variety wants square-off and stop-loss as point offsets from
        // the entry price.
        let squareoff = (spec.target_price - spec.entry_price).abs();
        let stoploss = (spec.entry_price - spec.stop_loss).abs();

        let params = RawOrderParams {
            variety: "ROBO".to_string(),
            tradingsymbol: spec.symbol.clone(),
            symboltoken: token,
            transactiontype: spec.side.as_str().to_string(),
            exchange: spec.exchange.to_string(),
            ordertype: "LIMIT".to_string(),
            producttype: Self::product_code(spec.product_type).to_string(),
            duration: "DAY".to_string(),
            quantity: spec.quantity.to_string(),
            price: Some(spec.entry_price.to_string()),
            triggerprice: None,
            squareoff: Some(squareoff.to_string()),
            stoploss: Some(stoploss.to_string()),
            trailingstoploss: spec.trailing_sl.map(|t| t.to_string()),
        };

        tracing::info!(symbol = %spec.symbol, "placing bracket order");
        let order_id = self
            .client
            .place_order(&session.api_key, &session.jwt, &params)
            .await?;
        Ok(OrderAck {
            order_id,
            message: "Bracket order placed successfully".to_string(),
        })
    }

    async fn place_gtt_order(&self, spec: &GttSpec) -> BrokerResult<GttAck> {
        let session = self.session()?;
        let token = self.symbol_token(&spec.symbol, &spec.exchange).await;
        let body = serde_json::json!({
            "tradingsymbol": spec.symbol,
            "symboltoken": token,
            "exchange": spec.exchange.to_string(),
            "transactiontype": spec.side.as_str(),
            "producttype": "DELIVERY",
            "triggerprice": spec.trigger_price.to_string(),
            "price": spec.price.to_string(),
            "qty": spec.quantity.to_string(),
        });
        let rule_id = self
            .client
            .create_gtt_rule(&session.api_key, &session.jwt, &body)
            .await?;
        Ok(GttAck {
            trigger_id: rule_id,
            message: "GTT rule created successfully".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_trade_core::Side;
    use signal_trade_instruments::Instrument;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_index() -> Arc<InstrumentIndex> {
        Arc::new(InstrumentIndex::from_instruments(vec![Instrument {
            symbol: "RELIANCE-EQ".to_string(),
            name: "RELIANCE INDUSTRIES LTD".to_string(),
            exchange: Exchange::Nse,
            token: "2885".to_string(),
            instrument_type: "EQ".to_string(),
        }]))
    }

    fn broker_for(server: &MockServer) -> AngelOneBroker {
        AngelOneBroker::new(
            AngelOneClientConfig::default().with_base_url(server.uri()),
            test_index(),
        )
        .unwrap()
    }

    fn force_session(broker: &AngelOneBroker) {
        *broker.session.write() = Some(Session {
            client_id: "A100".to_string(),
            api_key: "key".to_string(),
            jwt: "jwt".to_string(),
        });
    }

    // ==================== Status Mapping ====================

    #[test]
    fn vendor_statuses_map_to_internal_states() {
        assert_eq!(
            AngelOneBroker::map_status("complete"),
            BrokerOrderState::Executed
        );
        assert_eq!(
            AngelOneBroker::map_status("Rejected"),
            BrokerOrderState::Rejected
        );
        assert_eq!(
            AngelOneBroker::map_status("cancelled"),
            BrokerOrderState::Cancelled
        );
        for open in ["open", "pending", "trigger pending", "after market order req received"] {
            assert_eq!(AngelOneBroker::map_status(open), BrokerOrderState::Open);
        }
        assert_eq!(
            AngelOneBroker::map_status("modify pending"),
            BrokerOrderState::Pending
        );
    }

    // ==================== Fail Fast ====================

    #[tokio::test]
    async fn operations_fail_fast_when_logged_out() {
        let server = MockServer::start().await;
        let broker = broker_for(&server);

        assert!(!broker.is_logged_in());
        let spec = OrderSpec::market("RELIANCE-EQ", Exchange::Nse, Side::Buy, 1);
        assert!(matches!(
            broker.place_order(&spec).await,
            Err(BrokerError::NotLoggedIn)
        ));
        assert!(matches!(
            broker.funds().await,
            Err(BrokerError::NotLoggedIn)
        ));
        assert!(matches!(
            broker.ltp("RELIANCE-EQ", &Exchange::Nse).await,
            Err(BrokerError::NotLoggedIn)
        ));
        // No requests should have reached the vendor.
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    // ==================== Orders ====================

    #[tokio::test]
    async fn place_order_uses_index_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/secure/angelbroking/order/v1/placeOrder"))
            .and(body_partial_json(serde_json::json!({
                "tradingsymbol": "RELIANCE-EQ",
                "symboltoken": "2885",
                "transactiontype": "BUY",
                "ordertype": "MARKET"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": {"orderid": "1001"}
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        let ack = broker
            .place_order(&OrderSpec::market("RELIANCE-EQ", Exchange::Nse, Side::Buy, 10))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "1001");
    }

    #[tokio::test]
    async fn order_status_maps_rejection_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/secure/angelbroking/order/v1/getOrderBook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": [{
                    "orderid": "1001",
                    "orderstatus": "rejected",
                    "tradingsymbol": "RELIANCE-EQ",
                    "quantity": "10",
                    "filledshares": "0",
                    "averageprice": "0",
                    "text": "RMS:margin shortfall"
                }]
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        let snapshot = broker.order_status("1001").await.unwrap();
        assert_eq!(snapshot.state, BrokerOrderState::Rejected);
        assert_eq!(snapshot.rejection_reason.as_deref(), Some("RMS:margin shortfall"));
        assert!(snapshot.average_price.is_none());
    }

    #[tokio::test]
    async fn order_status_missing_order_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/secure/angelbroking/order/v1/getOrderBook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "", "data": []
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        assert!(matches!(
            broker.order_status("missing").await,
            Err(BrokerError::OrderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn bracket_order_sends_robo_offsets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/secure/angelbroking/order/v1/placeOrder"))
            .and(body_partial_json(serde_json::json!({
                "variety": "ROBO",
                "price": "100",
                "squareoff": "10",
                "stoploss": "5"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": {"orderid": "2002"}
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        let spec = BracketSpec {
            symbol: "RELIANCE-EQ".to_string(),
            exchange: Exchange::Nse,
            side: Side::Buy,
            quantity: 1,
            entry_price: Decimal::from(100),
            target_price: Decimal::from(110),
            stop_loss: Decimal::from(95),
            product_type: ProductType::Intraday,
            trailing_sl: None,
        };
        let ack = broker.place_bracket_order(&spec).await.unwrap();
        assert_eq!(ack.order_id, "2002");
    }

    // ==================== Session Restore ====================

    #[tokio::test]
    async fn restore_validates_with_profile_call() {
        use signal_trade_core::{InMemoryCredentialStore, PassthroughCodec, SavedSession};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/secure/angelbroking/user/v1/getProfile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": {"clientcode": "A100", "name": "Test User"}
            })))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryCredentialStore::new());
        store.put_session(
            BrokerId::AngelOne,
            SavedSession {
                client_id: "A100".to_string(),
                api_key: "key".to_string(),
                token: SecretString::from("jwt-restored"),
                expires_at: Utc::now() + Duration::hours(1),
            },
        );

        let broker = broker_for(&server)
            .with_persistence(store, Arc::new(PassthroughCodec));
        assert!(broker.try_restore_session().await.unwrap());
        assert!(broker.is_logged_in());
        assert_eq!(broker.client_id().as_deref(), Some("A100"));
    }

    #[tokio::test]
    async fn restore_rejects_invalid_session() {
        use signal_trade_core::{InMemoryCredentialStore, PassthroughCodec, SavedSession};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/secure/angelbroking/user/v1/getProfile"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryCredentialStore::new());
        store.put_session(
            BrokerId::AngelOne,
            SavedSession {
                client_id: "A100".to_string(),
                api_key: "key".to_string(),
                token: SecretString::from("stale-jwt"),
                expires_at: Utc::now() + Duration::hours(1),
            },
        );

        let broker = broker_for(&server)
            .with_persistence(store.clone(), Arc::new(PassthroughCodec));
        assert!(!broker.try_restore_session().await.unwrap());
        assert!(!broker.is_logged_in());
        assert!(store.is_deactivated(BrokerId::AngelOne));
    }

    #[tokio::test]
    async fn decryption_failure_deactivates_stored_config() {
        use signal_trade_core::{InMemoryCredentialStore, PassthroughCodec, SavedSession};

        let server = MockServer::start().await;
        let store = Arc::new(InMemoryCredentialStore::new());
        store.put_session(
            BrokerId::AngelOne,
            SavedSession {
                client_id: "A100".to_string(),
                api_key: "key".to_string(),
                // PassthroughCodec treats empty ciphertext as undecryptable.
                token: SecretString::from(""),
                expires_at: Utc::now() + Duration::hours(1),
            },
        );

        let broker = broker_for(&server)
            .with_persistence(store.clone(), Arc::new(PassthroughCodec));
        assert!(!broker.try_restore_session().await.unwrap());
        assert!(store.is_deactivated(BrokerId::AngelOne));
    }
}
