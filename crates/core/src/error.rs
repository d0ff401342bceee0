//! Error taxonomy shared by every broker backend and the orchestration layer.
//!
//! Backends translate vendor failures into these variants so callers never
//! match on vendor-specific strings. Transient variants expose retry hints.

use thiserror::Error;

/// Errors surfaced by broker backends, the registry, and the orchestrator.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Operation attempted on a backend that has no live session.
    #[error("not logged in")]
    NotLoggedIn,

    /// Registry request for a broker identifier that was never registered.
    #[error("unknown broker: {id}")]
    UnknownBroker {
        /// The identifier that failed to resolve.
        id: String,
    },

    /// The instrument could not be found on any searched exchange.
    #[error("instrument not found: {symbol} on {exchange}")]
    InstrumentNotFound {
        /// Symbol as requested.
        symbol: String,
        /// Exchange that was searched.
        exchange: String,
    },

    /// The vendor accepted the request but declined the order.
    #[error("order rejected: {reason}")]
    OrderRejected {
        /// Vendor rejection reason, captured verbatim.
        reason: String,
    },

    /// Transport or validation failure before the vendor accepted the order.
    #[error("order placement failed: {0}")]
    OrderPlacementFailed(String),

    /// The order id is unknown to the vendor's order book.
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The order id that was not found.
        order_id: String,
    },

    /// Stored credentials could not be decrypted; re-entry required.
    #[error("credential decryption failed")]
    DecryptionFailed,

    /// The vendor lacks this capability (e.g. bracket orders on Zerodha).
    #[error("operation not supported by {broker}: {operation}")]
    UnsupportedOperation {
        /// Backend that lacks the capability.
        broker: String,
        /// The capability that was requested.
        operation: String,
    },

    /// Vendor rate limit hit.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Outbound call exceeded its deadline.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Vendor API returned a non-success status.
    #[error("API error: {status_code} - {message}")]
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Body or vendor error message.
        message: String,
    },

    /// Vendor login flow failed.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Daily auto-trade ceiling reached.
    #[error("daily trade limit ({limit}) reached")]
    DailyLimitReached {
        /// Configured maximum trades per day.
        limit: u32,
    },

    /// Signal price diverges too far from the live price.
    #[error("price deviation ({deviation_percent:.1}%) exceeds tolerance ({tolerance_percent}%)")]
    PriceDeviationExceeded {
        /// Observed deviation in percent.
        deviation_percent: f64,
        /// Configured tolerance in percent.
        tolerance_percent: f64,
    },

    /// Payload could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Creates an API error from status code and message.
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status_code,
            message: message.into(),
        }
    }

    /// Creates an unknown-broker error.
    pub fn unknown_broker(id: impl Into<String>) -> Self {
        Self::UnknownBroker { id: id.into() }
    }

    /// Creates an order-rejected error with the vendor's verbatim reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::OrderRejected {
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(broker: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            broker: broker.into(),
            operation: operation.into(),
        }
    }

    /// Creates an instrument-not-found error.
    pub fn instrument_not_found(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self::InstrumentNotFound {
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    /// Creates an order-not-found error.
    pub fn order_not_found(order_id: impl Into<String>) -> Self {
        Self::OrderNotFound {
            order_id: order_id.into(),
        }
    }

    /// Returns true if the failure is safe to retry later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Api { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    /// Suggested retry delay in seconds, if the error is transient.
    #[must_use]
    pub fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::Network(_) | Self::Timeout(_) => Some(1),
            Self::Api { status_code, .. } if *status_code >= 500 => Some(2),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Network(format!("connection failed: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
