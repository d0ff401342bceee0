//! Shoonya implementation of the [`Broker`] contract.
//!
//! Login hashes the trading password with SHA-256 and supplies a TOTP as
//! the second factor, generated locally when the stored credential is a
//! base32 secret. Bracket orders use the vendor's native book-profit /
//! book-loss product; GTT is not offered and reports
//! `UnsupportedOperation`.

use crate::client::{sha256_hex, NorenClient, NorenClientConfig, RawNorenOrder};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use signal_trade_core::{
    totp, BracketSpec, Broker, BrokerCredentials, BrokerError, BrokerId, BrokerOrderState,
    BrokerResult, Exchange, Funds, GttAck, GttSpec, Holding, LoginOutcome, OrderAck,
    OrderSnapshot, OrderSpec, OrderType, OrderUpdate, Position, ProductType, SymbolMatch,
};
use std::str::FromStr;

const DEFAULT_IMEI: &str = "abc1234";

#[derive(Clone)]
struct Session {
    client_id: String,
    token: String,
}

/// Shoonya backend.
pub struct ShoonyaBroker {
    client: NorenClient,
    session: RwLock<Option<Session>>,
}

impl ShoonyaBroker {
    /// Creates a backend.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: NorenClientConfig) -> BrokerResult<Self> {
        Ok(Self {
            client: NorenClient::new(config)?,
            session: RwLock::new(None),
        })
    }

    fn session(&self) -> BrokerResult<Session> {
        self.session.read().clone().ok_or(BrokerError::NotLoggedIn)
    }

    fn map_status(status: &str) -> BrokerOrderState {
        match status.to_ascii_lowercase().as_str() {
            "complete" | "fill" => BrokerOrderState::Executed,
            "rejected" => BrokerOrderState::Rejected,
            "cancelled" | "cancel" => BrokerOrderState::Cancelled,
            "open" | "pending" | "trigger_pending" => BrokerOrderState::Open,
            _ => BrokerOrderState::Pending,
        }
    }

    fn snapshot_from(raw: RawNorenOrder) -> OrderSnapshot {
        let state = Self::map_status(&raw.status);
        let rejection_reason = if state == BrokerOrderState::Rejected && !raw.rejreason.is_empty() {
            Some(raw.rejreason.clone())
        } else {
            None
        };
        OrderSnapshot {
            order_id: raw.norenordno,
            broker_status: raw.status.to_ascii_lowercase(),
            state,
            symbol: raw.tsym,
            quantity: raw.qty.trim().parse().unwrap_or(0),
            filled_quantity: raw.fillshares.trim().parse().unwrap_or(0),
            average_price: Decimal::from_str(raw.avgprc.trim())
                .ok()
                .filter(|p| !p.is_zero()),
            rejection_reason,
        }
    }

    /// Noren wants series-qualified equity symbols; bare names get the
    /// `-EQ` series appended.
    fn qualify_symbol(symbol: &str) -> String {
        if symbol.contains('-') {
            symbol.to_string()
        } else {
            format!("{symbol}-EQ")
        }
    }

    fn price_type_code(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
            OrderType::StopLoss => "SL-LMT",
            OrderType::StopLossMarket => "SL-MKT",
        }
    }

    fn product_code(product: ProductType) -> &'static str {
        match product {
            ProductType::Intraday => "I",
            ProductType::Delivery => "C",
            ProductType::Margin => "M",
        }
    }
}

#[async_trait]
impl Broker for ShoonyaBroker {
    fn id(&self) -> BrokerId {
        BrokerId::Shoonya
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

        let factor2 = match &credentials.totp_secret {
            Some(secret) if totp::looks_like_secret(secret.expose_secret()) => {
                totp::totp_now(secret.expose_secret())
                    .map_err(|e| BrokerError::Authentication(e.to_string()))?
            }
            Some(code) => code.expose_secret().to_string(),
            None => String::new(),
        };

        let password_hash = sha256_hex(password.expose_secret());
        let app_key = sha256_hex(&format!(
            "{}|{}",
            credentials.client_id, credentials.api_key
        ));

        let session = self
            .client
            .login(
                &credentials.client_id,
                &password_hash,
                &factor2,
                &credentials.api_key,
                &app_key,
                DEFAULT_IMEI,
            )
            .await?;

        tracing::info!(client_id = %credentials.client_id, "logged in to Shoonya");
        *self.session.write() = Some(Session {
            client_id: credentials.client_id.clone(),
            token: session.susertoken,
        });
        Ok(LoginOutcome::LoggedIn {
            message: "Successfully logged in to Shoonya".to_string(),
        })
    }

    async fn logout(&self) -> BrokerResult<()> {
        let session = self.session.write().take();
        if let Some(session) = session {
            if let Err(e) = self.client.logout(&session.client_id, &session.token).await {
                tracing::warn!(error = %e, "vendor logout failed, session cleared locally");
            }
        }
        Ok(())
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        let session = self.session()?;
        let tsym = Self::qualify_symbol(&spec.symbol);

        let mut jdata = serde_json::json!({
            "exch": spec.exchange.to_string(),
            "tsym": tsym,
            "qty": spec.quantity.to_string(),
            "dscqty": "0",
            "prd": Self::product_code(spec.product_type),
            "trantype": if spec.side == signal_trade_core::Side::Buy { "B" } else { "S" },
            "prctyp": Self::price_type_code(spec.order_type),
            "prc": spec.price.map_or_else(|| "0".to_string(), |p| p.to_string()),
            "ret": "DAY",
            "remarks": "API Order",
        });
        if let (Some(map), Some(trigger)) = (jdata.as_object_mut(), spec.trigger_price) {
            map.insert("trgprc".to_string(), trigger.to_string().into());
        }

        tracing::info!(symbol = %tsym, side = %spec.side, qty = spec.quantity, "placing order");
        let order_id = self
            .client
            .place_order(&session.client_id, &session.token, &jdata)
            .await?;
        Ok(OrderAck {
            order_id: order_id.clone(),
            message: format!("Order placed successfully: {order_id}"),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let session = self.session()?;
        self.client
            .cancel_order(&session.client_id, &session.token, order_id)
            .await
    }

    async fn modify_order(&self, order_id: &str, update: &OrderUpdate) -> BrokerResult<()> {
        let session = self.session()?;
        let mut map = serde_json::Map::new();
        map.insert("norenordno".to_string(), order_id.into());
        if let Some(quantity) = update.quantity {
            map.insert("qty".to_string(), quantity.to_string().into());
        }
        if let Some(price) = update.price {
            map.insert("prc".to_string(), price.to_string().into());
        }
        if let Some(trigger) = update.trigger_price {
            map.insert("trgprc".to_string(), trigger.to_string().into());
        }
        if let Some(order_type) = update.order_type {
            map.insert(
                "prctyp".to_string(),
                Self::price_type_code(order_type).into(),
            );
        }
        self.client
            .modify_order(
                &session.client_id,
                &session.token,
                &serde_json::Value::Object(map),
            )
            .await
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        let session = self.session()?;
        let history = self
            .client
            .single_order_history(&session.client_id, &session.token, order_id)
            .await?;
        history
            .into_iter()
            .last()
            .map(Self::snapshot_from)
            .ok_or_else(|| BrokerError::order_not_found(order_id))
    }

    async fn all_order_statuses(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let session = self.session()?;
        let orders = self
            .client
            .order_book(&session.client_id, &session.token)
            .await?;
        Ok(orders.into_iter().map(Self::snapshot_from).collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let session = self.session()?;
        let raw = self
            .client
            .positions(&session.client_id, &session.token)
            .await?;
        Ok(raw
            .into_iter()
            .map(|p| Position {
                symbol: p.tsym,
                exchange: Exchange::parse(&p.exch),
                quantity: p.netqty.trim().parse().unwrap_or(0),
                average_price: Decimal::from_str(p.netavgprc.trim()).ok(),
                last_price: Decimal::from_str(p.lp.trim()).ok(),
                pnl: Decimal::from_str(p.rpnl.trim()).ok(),
                product_type: Some(p.prd),
            })
            .collect())
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        let session = self.session()?;
        let raw = self
            .client
            .holdings(&session.client_id, &session.token)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|h| {
                let listing = h.exch_tsym.first()?;
                Some(Holding {
                    symbol: listing.tsym.clone(),
                    exchange: Exchange::parse(&listing.exch),
                    quantity: h.holdqty.trim().parse().unwrap_or(0),
                    average_price: Decimal::from_str(h.upldprc.trim()).ok(),
                    last_price: None,
                })
            })
            .collect())
    }

    async fn order_book(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        self.all_order_statuses().await
    }

    async fn funds(&self) -> BrokerResult<Funds> {
        let session = self.session()?;
        let limits = self
            .client
            .limits(&session.client_id, &session.token)
            .await?;
        let cash = Decimal::from_str(limits.cash.trim()).unwrap_or_default();
        let used = Decimal::from_str(limits.marginused.trim()).unwrap_or_default();
        Ok(Funds {
            available_cash: cash,
            used_margin: used,
            available_margin: cash - used,
        })
    }

    async fn ltp(&self, symbol: &str, exchange: &Exchange) -> BrokerResult<Decimal> {
        let session = self.session()?;
        let tsym = Self::qualify_symbol(symbol);
        let quote = self
            .client
            .quote(&session.client_id, &session.token, exchange.as_str(), &tsym)
            .await?;
        Decimal::from_str(quote.lp.trim())
            .map_err(|e| BrokerError::Serialization(format!("bad ltp value: {e}")))
    }

    async fn search_symbols(
        &self,
        query: &str,
        exchange: Option<&Exchange>,
    ) -> BrokerResult<Vec<SymbolMatch>> {
        let session = self.session()?;
        // Noren requires an exchange for search.
        let exchange_code = exchange.map_or("NSE", Exchange::as_str);
        let hits = self
            .client
            .search_scrip(&session.client_id, &session.token, exchange_code, query)
            .await?;
        Ok(hits
            .into_iter()
            .take(20)
            .map(|s| SymbolMatch {
                symbol: s.tsym,
                name: s.cname,
                token: s.token,
                exchange: Exchange::parse(&s.exch),
                instrument_type: if s.instname.is_empty() {
                    "EQ".to_string()
                } else {
                    s.instname
                },
            })
            .collect())
    }

    async fn refresh_instruments(&self) -> BrokerResult<bool> {
        // Noren resolves instruments on demand through SearchScrip; there
        // is no master dataset to refresh.
        Ok(true)
    }

    async fn place_bracket_order(&self, spec: &BracketSpec) -> BrokerResult<OrderAck> {
        let session = self.session()?;
        let tsym = Self::qualify_symbol(&spec.symbol);

        let mut jdata = serde_json::json!({
            "exch": spec.exchange.to_string(),
            "tsym": tsym,
            "qty": spec.quantity.to_string(),
            "dscqty": "0",
            "prd": "B",
            "trantype": if spec.side == signal_trade_core::Side::Buy { "B" } else { "S" },
            "prctyp": "LMT",
            "prc": spec.entry_price.to_string(),
            "ret": "DAY",
            "blprc": spec.stop_loss.to_string(),
            "bpprc": spec.target_price.to_string(),
        });
        if let (Some(map), Some(trail)) = (jdata.as_object_mut(), spec.trailing_sl) {
            map.insert("trailprc".to_string(), trail.to_string().into());
        }

        tracing::info!(symbol = %tsym, "placing bracket order");
        let order_id = self
            .client
            .place_order(&session.client_id, &session.token, &jdata)
            .await?;
        Ok(OrderAck {
            order_id,
            message: "Bracket order placed successfully".to_string(),
        })
    }

    async fn place_gtt_order(&self, _spec: &GttSpec) -> BrokerResult<GttAck> {
        Err(BrokerError::unsupported(
            BrokerId::Shoonya.as_str(),
            "GTT orders (use bracket orders instead)",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use signal_trade_core::Side;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker_for(server: &MockServer) -> ShoonyaBroker {
        ShoonyaBroker::new(NorenClientConfig::default().with_base_url(server.uri())).unwrap()
    }

    fn force_session(broker: &ShoonyaBroker) {
        *broker.session.write() = Some(Session {
            client_id: "FA0001".to_string(),
            token: "tok".to_string(),
        });
    }

    // ==================== Status Mapping ====================

    #[test]
    fn vendor_statuses_map_to_internal_states() {
        assert_eq!(ShoonyaBroker::map_status("COMPLETE"), BrokerOrderState::Executed);
        assert_eq!(ShoonyaBroker::map_status("fill"), BrokerOrderState::Executed);
        assert_eq!(ShoonyaBroker::map_status("REJECTED"), BrokerOrderState::Rejected);
        assert_eq!(ShoonyaBroker::map_status("CANCELED"), BrokerOrderState::Pending);
        assert_eq!(ShoonyaBroker::map_status("cancel"), BrokerOrderState::Cancelled);
        assert_eq!(ShoonyaBroker::map_status("trigger_pending"), BrokerOrderState::Open);
        assert_eq!(ShoonyaBroker::map_status("unknown"), BrokerOrderState::Pending);
    }

    #[test]
    fn bare_symbols_get_the_eq_series() {
        assert_eq!(ShoonyaBroker::qualify_symbol("RELIANCE"), "RELIANCE-EQ");
        assert_eq!(ShoonyaBroker::qualify_symbol("RELIANCE-EQ"), "RELIANCE-EQ");
        assert_eq!(ShoonyaBroker::qualify_symbol("M&M-EQ"), "M&M-EQ");
    }

    // ==================== Login ====================

    #[tokio::test]
    async fn login_hashes_password_and_stores_token() {
        let server = MockServer::start().await;
        let expected_hash = sha256_hex("trading-password");
        Mock::given(method("POST"))
            .and(path("/QuickAuth"))
            .and(body_string_contains(&expected_hash))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stat": "Ok", "susertoken": "tok-9", "uname": "Test"
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let creds = BrokerCredentials {
            broker: BrokerId::Shoonya,
            api_key: "FA0001_U".to_string(),
            client_id: "FA0001".to_string(),
            password: Some(SecretString::from("trading-password")),
            totp_secret: Some(SecretString::from("123456")),
            api_secret: None,
            session_token: None,
        };
        let outcome = broker.login(&creds).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::LoggedIn { .. }));
        assert!(broker.is_logged_in());
        assert_eq!(broker.client_id().as_deref(), Some("FA0001"));
    }

    // ==================== Capabilities ====================

    #[tokio::test]
    async fn gtt_is_explicitly_unsupported() {
        let server = MockServer::start().await;
        let broker = broker_for(&server);
        force_session(&broker);
        let spec = GttSpec {
            symbol: "RELIANCE".to_string(),
            exchange: Exchange::Nse,
            side: Side::Buy,
            quantity: 1,
            trigger_price: Decimal::from(100),
            price: Decimal::from(101),
            order_type: OrderType::Limit,
        };
        let err = broker.place_gtt_order(&spec).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnsupportedOperation { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operations_fail_fast_when_logged_out() {
        let server = MockServer::start().await;
        let broker = broker_for(&server);
        assert!(matches!(
            broker.positions().await,
            Err(BrokerError::NotLoggedIn)
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    // ==================== Orders ====================

    #[tokio::test]
    async fn place_order_qualifies_symbol_and_returns_order_number() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/PlaceOrder"))
            .and(body_string_contains("RELIANCE-EQ"))
            .and(body_string_contains("\"trantype\":\"B\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stat": "Ok", "norenordno": "24080800001"
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        let ack = broker
            .place_order(&OrderSpec::market("RELIANCE", Exchange::Nse, Side::Buy, 1))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "24080800001");
    }

    #[tokio::test]
    async fn bracket_order_carries_book_profit_and_loss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/PlaceOrder"))
            .and(body_string_contains("\"prd\":\"B\""))
            .and(body_string_contains("\"bpprc\":\"110\""))
            .and(body_string_contains("\"blprc\":\"95\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stat": "Ok", "norenordno": "24080800002"
            })))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        let spec = BracketSpec {
            symbol: "RELIANCE".to_string(),
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
        assert_eq!(ack.order_id, "24080800002");
    }

    #[tokio::test]
    async fn order_status_takes_latest_history_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/SingleOrdHist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"norenordno": "1", "status": "PENDING", "tsym": "RELIANCE-EQ",
                 "qty": "1", "fillshares": "0", "avgprc": "0"},
                {"norenordno": "1", "status": "COMPLETE", "tsym": "RELIANCE-EQ",
                 "qty": "1", "fillshares": "1", "avgprc": "2885.50"}
            ])))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        force_session(&broker);
        let snapshot = broker.order_status("1").await.unwrap();
        assert_eq!(snapshot.state, BrokerOrderState::Executed);
        assert_eq!(snapshot.filled_quantity, 1);
    }
}
