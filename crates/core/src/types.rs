//! Domain types shared across the workspace.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchange segment an instrument trades on.
///
/// The instrument-master feed is vendor-defined and may carry segments
/// beyond the ones the resolver routes to; those parse into `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// National Stock Exchange (equities).
    Nse,
    /// Bombay Stock Exchange (equities).
    Bse,
    /// NSE derivatives segment.
    Nfo,
    /// BSE derivatives segment (SENSEX/BANKEX options).
    Bfo,
    /// Commodities.
    Mcx,
    /// Any other vendor-reported segment.
    Other(String),
}

impl Exchange {
    /// Parses a vendor segment string; unknown segments become `Other`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "NSE" => Self::Nse,
            "BSE" => Self::Bse,
            "NFO" => Self::Nfo,
            "BFO" => Self::Bfo,
            "MCX" => Self::Mcx,
            other => Self::Other(other.to_string()),
        }
    }

    /// Canonical uppercase segment code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Nse => "NSE",
            Self::Bse => "BSE",
            Self::Nfo => "NFO",
            Self::Bfo => "BFO",
            Self::Mcx => "MCX",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for Exchange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Exchange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Canonical uppercase form used in signals and vendor payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Parses `BUY`/`SELL` (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossMarket,
}

impl OrderType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "SL",
            Self::StopLossMarket => "SL-M",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product type an order is booked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    Intraday,
    Delivery,
    Margin,
}

impl ProductType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intraday => "INTRADAY",
            Self::Delivery => "DELIVERY",
            Self::Margin => "MARGIN",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrument classification produced by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Option,
    Future,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equity => "EQUITY",
            Self::Option => "OPTION",
            Self::Future => "FUTURE",
        };
        f.write_str(s)
    }
}

/// A regular order request handed to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    pub product_type: ProductType,
    /// Limit price for LIMIT/SL orders.
    pub price: Option<Decimal>,
    /// Trigger price for SL/SL-M orders.
    pub trigger_price: Option<Decimal>,
}

impl OrderSpec {
    /// Creates a market order with intraday product type.
    #[must_use]
    pub fn market(symbol: impl Into<String>, exchange: Exchange, side: Side, quantity: u32) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            side,
            quantity,
            order_type: OrderType::Market,
            product_type: ProductType::Intraday,
            price: None,
            trigger_price: None,
        }
    }

    /// Creates a limit order with intraday product type.
    #[must_use]
    pub fn limit(
        symbol: impl Into<String>,
        exchange: Exchange,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            side,
            quantity,
            order_type: OrderType::Limit,
            product_type: ProductType::Intraday,
            price: Some(price),
            trigger_price: None,
        }
    }
}

/// Partial update for an open order; unset fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub quantity: Option<u32>,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub order_type: Option<OrderType>,
}

/// Bracket order: entry plus linked target and stop-loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketSpec {
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub quantity: u32,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_loss: Decimal,
    pub product_type: ProductType,
    /// Optional trailing stop-loss points.
    pub trailing_sl: Option<Decimal>,
}

/// Good-Till-Triggered conditional order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GttSpec {
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub quantity: u32,
    pub trigger_price: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
}

/// Successful order acknowledgement from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub message: String,
}

/// Successful GTT registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GttAck {
    pub trigger_id: String,
    pub message: String,
}

/// The common order-state vocabulary every backend maps into.
///
/// `Pending` is the catch-all for vendor statuses the mapping does not
/// recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderState {
    Executed,
    Rejected,
    Cancelled,
    Open,
    Pending,
}

impl fmt::Display for BrokerOrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executed => "EXECUTED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Open => "OPEN",
            Self::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

/// A broker-side view of one order, normalized across vendors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    /// Vendor status string, verbatim.
    pub broker_status: String,
    /// Normalized state.
    pub state: BrokerOrderState,
    pub symbol: String,
    pub quantity: u32,
    pub filled_quantity: u32,
    pub average_price: Option<Decimal>,
    /// Vendor rejection reason, only set when `state` is `Rejected`.
    pub rejection_reason: Option<String>,
}

/// Open position reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub average_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub product_type: Option<String>,
}

/// Long-term holding reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub average_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
}

/// Account funds and margin information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funds {
    pub available_cash: Decimal,
    pub used_margin: Decimal,
    pub available_margin: Decimal,
}

/// Symbol search hit from a backend or the instrument index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMatch {
    pub symbol: String,
    pub name: String,
    pub token: String,
    pub exchange: Exchange,
    pub instrument_type: String,
}

/// Outcome of a login attempt that did not error.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Session established.
    LoggedIn { message: String },
    /// Vendor requires a browser step; complete it and call login again
    /// with the resulting request token.
    Pending { login_url: String },
}

/// Structured signal produced by the external extraction step.
///
/// The core never parses raw message text; it only consumes this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Option<String>,
    pub action: Option<Side>,
    pub entry_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub quantity: Option<u32>,
    pub exchange: Option<Exchange>,
    pub product_type: Option<ProductType>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}
