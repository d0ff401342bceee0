//! Zerodha implementation of the [`Broker`] contract.
//!
//! Kite's login is browser-based: with no password the backend hands back
//! the login URL, with a request token plus API secret it exchanges them
//! for an access token, and with a bare access token it restores the
//! session after validating it with a profile call.
//!
//! Zerodha discontinued bracket orders; that capability reports
//! `UnsupportedOperation` instead of silently degrading. GTT is supported.

use crate::client::{KiteClient, KiteClientConfig, RawKiteOrder, KITE_LOGIN_URL};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use signal_trade_core::{
    BracketSpec, Broker, BrokerCredentials, BrokerError, BrokerId, BrokerOrderState, BrokerResult,
    Exchange, Funds, GttAck, GttSpec, Holding, LoginOutcome, OrderAck, OrderSnapshot, OrderSpec,
    OrderType, OrderUpdate, Position, ProductType, SymbolMatch,
};

#[derive(Clone)]
struct Session {
    client_id: String,
    api_key: String,
    access_token: String,
}

/// Zerodha backend.
pub struct ZerodhaBroker {
    client: KiteClient,
    session: RwLock<Option<Session>>,
}

impl ZerodhaBroker {
    /// Creates a backend.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: KiteClientConfig) -> BrokerResult<Self> {
        Ok(Self {
            client: KiteClient::new(config)?,
            session: RwLock::new(None),
        })
    }

    fn session(&self) -> BrokerResult<Session> {
        self.session.read().clone().ok_or(BrokerError::NotLoggedIn)
    }

    fn map_status(status: &str) -> BrokerOrderState {
        match status.to_ascii_lowercase().as_str() {
            "complete" => BrokerOrderState::Executed,
            "rejected" => BrokerOrderState::Rejected,
            "cancelled" => BrokerOrderState::Cancelled,
            "open" | "pending" | "trigger pending" => BrokerOrderState::Open,
            _ => BrokerOrderState::Pending,
        }
    }

    fn snapshot_from(raw: RawKiteOrder) -> OrderSnapshot {
        let state = Self::map_status(&raw.status);
        let rejection_reason = if state == BrokerOrderState::Rejected {
            raw.status_message.clone().filter(|m| !m.is_empty())
        } else {
            None
        };
        OrderSnapshot {
            order_id: raw.order_id,
            broker_status: raw.status.to_ascii_lowercase(),
            state,
            symbol: raw.tradingsymbol,
            quantity: raw.quantity,
            filled_quantity: raw.filled_quantity,
            average_price: Decimal::try_from(raw.average_price)
                .ok()
                .filter(|p| !p.is_zero()),
            rejection_reason,
        }
    }

    fn order_type_code(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "SL",
            OrderType::StopLossMarket => "SL-M",
        }
    }

    fn product_code(product: ProductType) -> &'static str {
        match product {
            ProductType::Intraday => "MIS",
            ProductType::Delivery => "CNC",
            ProductType::Margin => "NRML",
        }
    }
}

#[async_trait]
impl Broker for ZerodhaBroker {
    fn id(&self) -> BrokerId {
        BrokerId::Zerodha
    }

    fn is_logged_in(&self) -> bool {
        self.session.read().is_some()
    }

    fn client_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.client_id.clone())
    }

    async fn login(&self, credentials: &BrokerCredentials) -> BrokerResult<LoginOutcome> {
        let Some(password) = &credentials.password else {
            // No token yet: the user completes the browser flow first.
            return Ok(LoginOutcome::Pending {
                login_url: format!("{KITE_LOGIN_URL}{}", credentials.api_key),
            });
        };

        if let Some(api_secret) = &credentials.api_secret {
            // OAuth exchange: password carries the request token.
            let session = self
                .client
                .create_session(
                    &credentials.api_key,
                    password.expose_secret(),
                    api_secret.expose_secret(),
                )
                .await?;
            let client_id = if session.user_id.is_empty() {
                credentials.client_id.clone()
            } else {
                session.user_id.clone()
            };
            tracing::info!(client_id = %client_id, "logged in to Zerodha");
            *self.session.write() = Some(Session {
                client_id,
                api_key: credentials.api_key.clone(),
                access_token: session.access_token,
            });
            return Ok(LoginOutcome::LoggedIn {
                message: "Successfully logged in to Zerodha".to_string(),
            });
        }

        // Restoration: password carries a previously issued access token,
        // which must be validated with a live call before it is trusted.
        let access_token = password.expose_secret().to_string();
        match self.client.profile(&credentials.api_key, &access_token).await {
            Ok(_) => {
                tracing::info!(client_id = %credentials.client_id, "restored Zerodha session");
                *self.session.write() = Some(Session {
                    client_id: credentials.client_id.clone(),
                    api_key: credentials.api_key.clone(),
                    access_token,
                });
                Ok(LoginOutcome::LoggedIn {
                    message: "Session restored successfully".to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "saved Zerodha access token is invalid");
                Err(BrokerError::Authentication(format!(
                    "Saved session invalid: {e}"
                )))
            }
        }
    }

    async fn logout(&self) -> BrokerResult<()> {
        let session = self.session.write().take();
        if let Some(session) = session {
            if let Err(e) = self
                .client
                .invalidate_session(&session.api_key, &session.access_token)
                .await
            {
                tracing::warn!(error = %e, "vendor logout failed, session cleared locally");
            }
        }
        Ok(())
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        let session = self.session()?;

        let mut form: Vec<(&str, String)> = vec![
            ("tradingsymbol", spec.symbol.clone()),
            ("exchange", spec.exchange.to_string()),
            ("transaction_type", spec.side.as_str().to_string()),
            ("order_type", Self::order_type_code(spec.order_type).to_string()),
            ("quantity", spec.quantity.to_string()),
            ("product", Self::product_code(spec.product_type).to_string()),
            ("validity", "DAY".to_string()),
        ];
        if let Some(price) = spec.price {
            form.push(("price", price.to_string()));
        }
        if let Some(trigger) = spec.trigger_price {
            form.push(("trigger_price", trigger.to_string()));
        }

        tracing::info!(symbol = %spec.symbol, side = %spec.side, qty = spec.quantity, "placing order");
        let order_id = self
            .client
            .place_order(&session.api_key, &session.access_token, &form)
            .await?;
        Ok(OrderAck {
            order_id: order_id.clone(),
            message: format!("Order placed successfully: {order_id}"),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let session = self.session()?;
        self.client
            .cancel_order(&session.api_key, &session.access_token, order_id)
            .await
    }

    async fn modify_order(&self, order_id: &str, update: &OrderUpdate) -> BrokerResult<()> {
        let session = self.session()?;
        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(quantity) = update.quantity {
            form.push(("quantity", quantity.to_string()));
        }
        if let Some(price) = update.price {
            form.push(("price", price.to_string()));
        }
        if let Some(trigger) = update.trigger_price {
            form.push(("trigger_price", trigger.to_string()));
        }
        if let Some(order_type) = update.order_type {
            form.push(("order_type", Self::order_type_code(order_type).to_string()));
        }
        self.client
            .modify_order(&session.api_key, &session.access_token, order_id, &form)
            .await
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        let session = self.session()?;
        let orders = self
            .client
            .orders(&session.api_key, &session.access_token)
            .await?;
        orders
            .into_iter()
            .find(|o| o.order_id == order_id)
            .map(Self::snapshot_from)
            .ok_or_else(|| BrokerError::order_not_found(order_id))
    }

    async fn all_order_statuses(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let session = self.session()?;
        let orders = self
            .client
            .orders(&session.api_key, &session.access_token)
            .await?;
        Ok(orders.into_iter().map(Self::snapshot_from).collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let session = self.session()?;
        let raw = self
            .client
            .positions(&session.api_key, &session.access_token)
            .await?;
        Ok(raw
            .into_iter()
            .map(|p| Position {
                symbol: p.tradingsymbol,
                exchange: Exchange::parse(&p.exchange),
                quantity: p.quantity,
                average_price: Decimal::try_from(p.average_price).ok(),
                last_price: Decimal::try_from(p.last_price).ok(),
                pnl: Decimal::try_from(p.pnl).ok(),
                product_type: Some(p.product),
            })
            .collect())
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        let session = self.session()?;
        let raw = self
            .client
            .holdings(&session.api_key, &session.access_token)
            .await?;
        Ok(raw
            .into_iter()
            .map(|h| Holding {
                symbol: h.tradingsymbol,
                exchange: Exchange::parse(&h.exchange),
                quantity: h.quantity,
                average_price: Decimal::try_from(h.average_price).ok(),
                last_price: Decimal::try_from(h.last_price).ok(),
            })
            .collect())
    }

    async fn order_book(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        self.all_order_statuses().await
    }

    async fn funds(&self) -> BrokerResult<Funds> {
        let session = self.session()?;
        let funds = self
            .client
            .margins(&session.api_key, &session.access_token)
            .await?;
        Ok(Funds {
            available_cash: funds.available_cash,
            used_margin: funds.used_margin,
            available_margin: funds.available_margin,
        })
    }

    async fn ltp(&self, symbol: &str, exchange: &Exchange) -> BrokerResult<Decimal> {
        let session = self.session()?;
        let instrument = format!("{exchange}:{symbol}");
        self.client
            .ltp(&session.api_key, &session.access_token, &instrument)
            .await
    }

    async fn search_symbols(
        &self,
        query: &str,
        exchange: Option<&Exchange>,
    ) -> BrokerResult<Vec<SymbolMatch>> {
        let session = self.session()?;
        let exchange_code = exchange.map_or("NSE", Exchange::as_str);
        let instruments = self
            .client
            .instruments(&session.api_key, &session.access_token, exchange_code)
            .await?;

        let query_upper = query.to_ascii_uppercase();
        Ok(instruments
            .into_iter()
            .filter(|inst| inst.tradingsymbol.to_ascii_uppercase().contains(&query_upper))
            .take(20)
            .map(|inst| SymbolMatch {
                symbol: inst.tradingsymbol,
                name: inst.name,
                token: inst.instrument_token,
                exchange: Exchange::parse(&inst.exchange),
                instrument_type: inst.instrument_type,
            })
            .collect())
    }

    async fn refresh_instruments(&self) -> BrokerResult<bool> {
        // Kite serves the instrument dump on demand; verify it is reachable.
        let session = self.session()?;
        let instruments = self
            .client
            .instruments(&session.api_key, &session.access_token, "NSE")
            .await?;
        Ok(!instruments.is_empty())
    }

    async fn place_bracket_order(&self, _spec: &BracketSpec) -> BrokerResult<OrderAck> {
        // Discontinued by the vendor; GTT is the supported alternative.
        Err(BrokerError::unsupported(
            BrokerId::Zerodha.as_str(),
            "bracket orders (discontinued; use GTT orders instead)",
        ))
    }

    async fn place_gtt_order(&self, spec: &GttSpec) -> BrokerResult<GttAck> {
        let session = self.session()?;

        // Best-effort last price for the trigger condition; the trigger
        // price stands in when the quote is unavailable.
        let last_price = self
            .ltp(&spec.symbol, &spec.exchange)
            .await
            .unwrap_or(spec.trigger_price);

        let condition = serde_json::json!({
            "exchange": spec.exchange.to_string(),
            "tradingsymbol": spec.symbol,
            "trigger_values": [spec.trigger_price],
            "last_price": last_price,
        });
        let orders = serde_json::json!([{
            "exchange": spec.exchange.to_string(),
            "tradingsymbol": spec.symbol,
            "transaction_type": spec.side.as_str(),
            "quantity": spec.quantity,
            "order_type": Self::order_type_code(spec.order_type),
            "product": "CNC",
            "price": spec.price,
        }]);

        let trigger_id = self
            .client
            .place_gtt(&session.api_key, &session.access_token, &condition, &orders)
            .await?;
        Ok(GttAck {
            trigger_id,
            message: "GTT order created successfully".to_string(),
        })
    }
}
