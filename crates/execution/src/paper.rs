//! Paper-trading broker: the [`Broker`] contract with simulated fills.
//!
//! Makes zero network calls. Orders fill immediately at the seeded quote
//! (or the order's own price), buys are checked against a virtual balance,
//! and order ids carry a `PAPER-` prefix so they can never be confused
//! with live ones. P&L bookkeeping lives outside this crate.

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use signal_trade_core::{
    BracketSpec, Broker, BrokerCredentials, BrokerError, BrokerId, BrokerOrderState, BrokerResult,
    Exchange, Funds, GttAck, GttSpec, Holding, LoginOutcome, OrderAck, OrderSnapshot, OrderSpec,
    OrderUpdate, Position, Side, SymbolMatch,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Default virtual starting balance.
const DEFAULT_BALANCE: u64 = 100_000;

/// Simulated broker backend.
pub struct PaperBroker {
    prices: RwLock<HashMap<String, Decimal>>,
    orders: RwLock<HashMap<String, OrderSnapshot>>,
    balance: RwLock<Decimal>,
    next_order: AtomicU64,
    logged_in: AtomicBool,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    /// Creates a paper broker with the default virtual balance.
    #[must_use]
    pub fn new() -> Self {
        Self::with_balance(Decimal::from(DEFAULT_BALANCE))
    }

    /// Creates a paper broker with a specific virtual balance.
    #[must_use]
    pub fn with_balance(balance: Decimal) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            balance: RwLock::new(balance),
            next_order: AtomicU64::new(1),
            logged_in: AtomicBool::new(true),
        }
    }

    fn quote_key(symbol: &str, exchange: &Exchange) -> String {
        format!("{exchange}:{symbol}")
    }

    /// Seeds a quote the simulator will fill and verify against.
    pub fn set_price(&self, symbol: &str, exchange: &Exchange, price: Decimal) {
        self.prices
            .write()
            .insert(Self::quote_key(symbol, exchange), price);
    }

    fn fill_price(&self, spec_price: Option<Decimal>, symbol: &str, exchange: &Exchange) -> Option<Decimal> {
        spec_price.or_else(|| {
            self.prices
                .read()
                .get(&Self::quote_key(symbol, exchange))
                .copied()
        })
    }

    fn next_order_id(&self) -> String {
        format!("PAPER-{}", self.next_order.fetch_add(1, Ordering::SeqCst))
    }

    fn record_fill(
        &self,
        symbol: &str,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> BrokerResult<OrderAck> {
        let cost = price * Decimal::from(quantity);
        {
            let mut balance = self.balance.write();
            match side {
                Side::Buy => {
                    if cost > *balance {
                        return Err(BrokerError::rejected(format!(
                            "Insufficient balance. Required: {cost:.2}, Available: {:.2}",
                            *balance
                        )));
                    }
                    *balance -= cost;
                }
                Side::Sell => *balance += cost,
            }
        }

        let order_id = self.next_order_id();
        let snapshot = OrderSnapshot {
            order_id: order_id.clone(),
            broker_status: "complete".to_string(),
            state: BrokerOrderState::Executed,
            symbol: symbol.to_string(),
            quantity,
            filled_quantity: quantity,
            average_price: Some(price),
            rejection_reason: None,
        };
        self.orders.write().insert(order_id.clone(), snapshot);

        tracing::info!(order_id = %order_id, symbol, qty = quantity, price = %price, "paper fill");
        Ok(OrderAck {
            order_id,
            message: "Paper order executed".to_string(),
        })
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn id(&self) -> BrokerId {
        BrokerId::Paper
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    fn client_id(&self) -> Option<String> {
        Some("PAPER".to_string())
    }

    async fn login(&self, _credentials: &BrokerCredentials) -> BrokerResult<LoginOutcome> {
        self.logged_in.store(true, Ordering::Release);
        Ok(LoginOutcome::LoggedIn {
            message: "Paper trading session ready".to_string(),
        })
    }

    async fn logout(&self) -> BrokerResult<()> {
        self.logged_in.store(false, Ordering::Release);
        Ok(())
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        let price = self
            .fill_price(spec.price, &spec.symbol, &spec.exchange)
            .ok_or_else(|| {
                BrokerError::OrderPlacementFailed(
                    "could not determine entry price for paper trade".to_string(),
                )
            })?;
        self.record_fill(&spec.symbol, spec.side, spec.quantity, price)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        // Paper fills are immediate; nothing is ever open to cancel.
        if self.orders.read().contains_key(order_id) {
            Err(BrokerError::rejected("paper orders fill immediately"))
        } else {
            Err(BrokerError::order_not_found(order_id))
        }
    }

    async fn modify_order(&self, order_id: &str, _update: &OrderUpdate) -> BrokerResult<()> {
        Err(BrokerError::order_not_found(order_id))
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        self.orders
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::order_not_found(order_id))
    }

    async fn all_order_statuses(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let mut orders: Vec<OrderSnapshot> = self.orders.read().values().cloned().collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(orders)
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        Ok(Vec::new())
    }

    async fn order_book(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        self.all_order_statuses().await
    }

    async fn funds(&self) -> BrokerResult<Funds> {
        let balance = *self.balance.read();
        Ok(Funds {
            available_cash: balance,
            used_margin: Decimal::ZERO,
            available_margin: balance,
        })
    }

    async fn ltp(&self, symbol: &str, exchange: &Exchange) -> BrokerResult<Decimal> {
        self.prices
            .read()
            .get(&Self::quote_key(symbol, exchange))
            .copied()
            .ok_or_else(|| BrokerError::instrument_not_found(symbol, exchange.as_str()))
    }

    async fn search_symbols(
        &self,
        query: &str,
        exchange: Option<&Exchange>,
    ) -> BrokerResult<Vec<SymbolMatch>> {
        let query_upper = query.to_ascii_uppercase();
        Ok(self
            .prices
            .read()
            .keys()
            .filter_map(|key| {
                let (exch, symbol) = key.split_once(':')?;
                let parsed = Exchange::parse(exch);
                if let Some(filter) = exchange {
                    if parsed != *filter {
                        return None;
                    }
                }
                if !symbol.to_ascii_uppercase().contains(&query_upper) {
                    return None;
                }
                Some(SymbolMatch {
                    symbol: symbol.to_string(),
                    name: symbol.to_string(),
                    token: "0".to_string(),
                    exchange: parsed,
                    instrument_type: "EQ".to_string(),
                })
            })
            .collect())
    }

    async fn refresh_instruments(&self) -> BrokerResult<bool> {
        Ok(true)
    }

    async fn place_bracket_order(&self, spec: &BracketSpec) -> BrokerResult<OrderAck> {
        self.record_fill(&spec.symbol, spec.side, spec.quantity, spec.entry_price)
    }

    async fn place_gtt_order(&self, _spec: &GttSpec) -> BrokerResult<GttAck> {
        Ok(GttAck {
            trigger_id: self.next_order_id(),
            message: "Paper GTT registered".to_string(),
        })
    }
}
