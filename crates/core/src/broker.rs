//! The broker capability contract and the closed set of backend identities.

use crate::error::BrokerResult;
use crate::stores::BrokerCredentials;
use crate::types::{
    BracketSpec, Exchange, Funds, GttAck, GttSpec, Holding, LoginOutcome, OrderAck, OrderSnapshot,
    OrderSpec, OrderUpdate, Position, SymbolMatch,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier for a broker backend.
///
/// A closed enum rather than free-form strings: dispatch goes through the
/// registry's factory map, never through runtime capability probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerId {
    AngelOne,
    Zerodha,
    Shoonya,
    Paper,
}

impl BrokerId {
    /// Stable identifier used in settings and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AngelOne => "angel_one",
            Self::Zerodha => "zerodha",
            Self::Shoonya => "shoonya",
            Self::Paper => "paper",
        }
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "angel_one" | "angelone" => Ok(Self::AngelOne),
            "zerodha" => Ok(Self::Zerodha),
            "shoonya" => Ok(Self::Shoonya),
            "paper" => Ok(Self::Paper),
            other => Err(format!("unknown broker id: {other}")),
        }
    }
}

/// Uniform capability contract over heterogeneous brokerage backends.
///
/// Every method other than `login` must fail fast with
/// [`crate::BrokerError::NotLoggedIn`] when no session is live, without
/// attempting a network call. Vendor status vocabularies are normalized to
/// [`crate::types::BrokerOrderState`] before crossing this boundary.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Identity of this backend.
    fn id(&self) -> BrokerId;

    /// Whether a live session exists.
    fn is_logged_in(&self) -> bool;

    /// Client id of the live session, if any.
    fn client_id(&self) -> Option<String>;

    /// Authenticates with the vendor using an opaque credential bundle.
    async fn login(&self, credentials: &BrokerCredentials) -> BrokerResult<LoginOutcome>;

    /// Tears down the session. Vendor-side logout failures are logged, not
    /// surfaced; the local session is always cleared.
    async fn logout(&self) -> BrokerResult<()>;

    /// Places a regular order.
    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck>;

    /// Cancels an open order.
    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    /// Modifies an open order; unset fields keep their current values.
    async fn modify_order(&self, order_id: &str, update: &OrderUpdate) -> BrokerResult<()>;

    /// Fetches one order's current state.
    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot>;

    /// Fetches every order in today's book, normalized.
    async fn all_order_statuses(&self) -> BrokerResult<Vec<OrderSnapshot>>;

    /// Current open positions.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Long-term holdings.
    async fn holdings(&self) -> BrokerResult<Vec<Holding>>;

    /// Raw order book for today.
    async fn order_book(&self) -> BrokerResult<Vec<OrderSnapshot>>;

    /// Account funds and margins.
    async fn funds(&self) -> BrokerResult<Funds>;

    /// Last traded price for a symbol.
    async fn ltp(&self, symbol: &str, exchange: &Exchange) -> BrokerResult<Decimal>;

    /// Searches tradeable symbols.
    async fn search_symbols(
        &self,
        query: &str,
        exchange: Option<&Exchange>,
    ) -> BrokerResult<Vec<SymbolMatch>>;

    /// Refreshes instrument master data. Returns false when a refresh was
    /// already in flight.
    async fn refresh_instruments(&self) -> BrokerResult<bool>;

    /// Places a bracket order. Backends without the capability return
    /// [`crate::BrokerError::UnsupportedOperation`], never a plain order.
    async fn place_bracket_order(&self, spec: &BracketSpec) -> BrokerResult<OrderAck>;

    /// Places a GTT order. Backends without the capability return
    /// [`crate::BrokerError::UnsupportedOperation`].
    async fn place_gtt_order(&self, spec: &GttSpec) -> BrokerResult<GttAck>;
}
