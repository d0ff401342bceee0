//! Trade record and lifecycle state machine.

use crate::types::{Exchange, OrderType, ProductType, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a trade.
///
/// Transitions only move forward along
/// `PENDING -> SUBMITTED -> OPEN -> {EXECUTED|REJECTED|CANCELLED}`,
/// except that any non-terminal status may move to `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Submitted,
    Open,
    Executed,
    Rejected,
    Cancelled,
    Failed,
}

impl TradeStatus {
    /// Returns true when no further transitions are allowed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Rejected | Self::Cancelled | Self::Failed
        )
    }

    /// Position along the forward ordering; terminal statuses share the top
    /// rank so monotonicity checks compare cleanly.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Open => 2,
            Self::Executed | Self::Rejected | Self::Cancelled | Self::Failed => 3,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            // Any non-terminal status may fail on irrecoverable error.
            return true;
        }
        match self {
            Self::Pending => matches!(next, Self::Submitted),
            Self::Submitted => matches!(
                next,
                Self::Open | Self::Executed | Self::Rejected | Self::Cancelled
            ),
            Self::Open => matches!(next, Self::Executed | Self::Rejected | Self::Cancelled),
            _ => false,
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Open => "OPEN",
            Self::Executed => "EXECUTED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Fields for a trade being created; the store assigns identity and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub symbol: String,
    pub action: Side,
    pub quantity: u32,
    pub entry_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub order_type: OrderType,
    pub exchange: Exchange,
    pub product_type: ProductType,
    pub notes: Option<String>,
}

/// One order lifecycle, from signal acceptance through fill or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub symbol: String,
    pub action: Side,
    pub quantity: u32,
    pub entry_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub order_type: OrderType,
    pub exchange: Exchange,
    pub product_type: ProductType,

    pub order_id: Option<String>,
    pub status: TradeStatus,
    pub broker_status: Option<String>,
    pub broker_rejection_reason: Option<String>,
    pub average_price: Option<Decimal>,
    pub filled_quantity: Option<u32>,
    pub execution_price: Option<Decimal>,
    pub execution_time: Option<DateTime<Utc>>,
    pub last_status_check: Option<DateTime<Utc>>,

    pub notes: Option<String>,
    pub error_message: Option<String>,
    pub order_variety: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// Applies a status transition if the state machine allows it.
    ///
    /// Returns `true` when the status changed. Illegal transitions are
    /// refused (and logged) rather than panicking so a late broker update
    /// can never drag a terminal trade backwards.
    pub fn transition(&mut self, next: TradeStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            if self.status != next {
                tracing::warn!(
                    trade_id = self.id,
                    from = %self.status,
                    to = %next,
                    "refusing illegal trade status transition"
                );
            }
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Appends a note, separated from any existing notes.
    pub fn push_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(note);
            }
            None => self.notes = Some(note.to_string()),
        }
    }
}

/// Lifecycle events emitted on the notification channel.
///
/// Consumers (websocket fan-out, alerting) live outside this workspace;
/// payloads mirror the trade fields they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TradeEvent {
    Created {
        trade_id: i64,
        symbol: String,
        action: Side,
        quantity: u32,
    },
    StatusChanged {
        trade_id: i64,
        order_id: Option<String>,
        old_status: TradeStatus,
        new_status: TradeStatus,
        broker_status: Option<String>,
        rejection_reason: Option<String>,
    },
    SyncCompleted {
        checked: usize,
        updated: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade(status: TradeStatus) -> Trade {
        Trade {
            id: 1,
            symbol: "RELIANCE-EQ".to_string(),
            action: Side::Buy,
            quantity: 10,
            entry_price: None,
            target_price: None,
            stop_loss: None,
            order_type: OrderType::Market,
            exchange: Exchange::Nse,
            product_type: ProductType::Intraday,
            order_id: None,
            status,
            broker_status: None,
            broker_rejection_reason: None,
            average_price: None,
            filled_quantity: None,
            execution_price: None,
            execution_time: None,
            last_status_check: None,
            notes: None,
            error_message: None,
            order_variety: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(TradeStatus::Pending.can_transition_to(TradeStatus::Submitted));
        assert!(TradeStatus::Submitted.can_transition_to(TradeStatus::Open));
        assert!(TradeStatus::Submitted.can_transition_to(TradeStatus::Executed));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Executed));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Rejected));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Cancelled));
    }

    #[test]
    fn backward_transitions_are_refused() {
        assert!(!TradeStatus::Open.can_transition_to(TradeStatus::Submitted));
        assert!(!TradeStatus::Submitted.can_transition_to(TradeStatus::Pending));
        assert!(!TradeStatus::Executed.can_transition_to(TradeStatus::Open));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        assert!(TradeStatus::Pending.can_transition_to(TradeStatus::Failed));
        assert!(TradeStatus::Submitted.can_transition_to(TradeStatus::Failed));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Failed));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [
            TradeStatus::Executed,
            TradeStatus::Rejected,
            TradeStatus::Cancelled,
            TradeStatus::Failed,
        ] {
            for next in [
                TradeStatus::Pending,
                TradeStatus::Submitted,
                TradeStatus::Open,
                TradeStatus::Executed,
                TradeStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn rank_is_monotone_along_the_happy_path() {
        assert!(TradeStatus::Pending.rank() < TradeStatus::Submitted.rank());
        assert!(TradeStatus::Submitted.rank() < TradeStatus::Open.rank());
        assert!(TradeStatus::Open.rank() < TradeStatus::Executed.rank());
    }

    #[test]
    fn transition_applies_and_refuses() {
        let mut trade = sample_trade(TradeStatus::Pending);
        let now = Utc::now();
        assert!(trade.transition(TradeStatus::Submitted, now));
        assert_eq!(trade.status, TradeStatus::Submitted);
        assert!(!trade.transition(TradeStatus::Pending, now));
        assert_eq!(trade.status, TradeStatus::Submitted);
    }

    #[test]
    fn push_note_concatenates() {
        let mut trade = sample_trade(TradeStatus::Pending);
        trade.push_note("resolved RELIANCE -> RELIANCE-EQ");
        trade.push_note("placement failed: insufficient margin");
        let notes = trade.notes.unwrap();
        assert!(notes.contains("resolved"));
        assert!(notes.contains("; placement failed"));
    }
}
