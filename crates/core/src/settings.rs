//! Application settings consumed by the auto-trade gate and orchestrator.
//!
//! Persistence of these settings is owned by an external store; the core
//! only defines the shape and defaults.

use crate::broker::BrokerId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Runtime policy knobs for automatic execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Master switch for automatic execution.
    pub auto_trade_enabled: bool,
    /// When set, signals queue for human approval instead of executing.
    pub require_manual_approval: bool,
    /// Quantity used when a signal does not state one.
    pub default_quantity: u32,
    /// Ceiling on trades created per calendar day.
    pub max_trades_per_day: u32,
    /// Route executions to the paper broker instead of a live backend.
    pub paper_trading_enabled: bool,
    /// Active backend; `None` falls back to the registry default.
    pub active_broker: Option<BrokerId>,
    /// Maximum percent deviation between signal price and live price.
    pub price_tolerance_percent: Decimal,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            auto_trade_enabled: false,
            require_manual_approval: true,
            default_quantity: 1,
            max_trades_per_day: 10,
            paper_trading_enabled: true,
            active_broker: None,
            price_tolerance_percent: Decimal::new(2, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_fail_closed() {
        let settings = AppSettings::default();
        assert!(!settings.auto_trade_enabled);
        assert!(settings.require_manual_approval);
        assert_eq!(settings.max_trades_per_day, 10);
        assert_eq!(settings.price_tolerance_percent, dec!(2));
    }
}
