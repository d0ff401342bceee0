//! Auto-trade decision gate.
//!
//! A pure policy check over (signal, settings, broker state) that fails
//! closed: any missing precondition refuses execution with a reason, and
//! only a fully verified signal comes back approved with its order
//! parameters decided.

use crate::registry::BrokerRegistry;
use anyhow::Result;
use chrono::{NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use signal_trade_core::{
    Broker, BrokerError, BrokerId, Exchange, OrderType, SettingsStore, Side, Signal, TradeStore,
};
use std::sync::Arc;

/// Above this deviation from the live price, the approved order pins a
/// LIMIT at the signal price instead of going to market.
const LIMIT_ORDER_DEVIATION_PERCENT: f64 = 0.5;

/// Order parameters decided by an approving gate.
#[derive(Debug, Clone)]
pub struct ApprovedOrder {
    pub symbol: String,
    pub exchange: Exchange,
    pub action: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    /// Set when `order_type` is `Limit`; pinned to the signal price.
    pub limit_price: Option<Decimal>,
    /// Live price observed during the check.
    pub current_price: Decimal,
}

/// Outcome of the gate.
#[derive(Debug, Clone)]
pub enum GateDecision {
    Approved(ApprovedOrder),
    Refused {
        reason: String,
    },
}

impl GateDecision {
    fn refused(reason: impl Into<String>) -> Self {
        Self::Refused {
            reason: reason.into(),
        }
    }

    /// Whether the signal may execute.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }
}

/// The auto-trade gate.
pub struct AutoTradeGate {
    registry: Arc<BrokerRegistry>,
    trades: Arc<dyn TradeStore>,
    settings: Arc<dyn SettingsStore>,
}

impl AutoTradeGate {
    #[must_use]
    pub fn new(
        registry: Arc<BrokerRegistry>,
        trades: Arc<dyn TradeStore>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            registry,
            trades,
            settings,
        }
    }

    /// Evaluates a signal against settings and live broker state.
    ///
    /// Only storage errors propagate; every policy or market-state
    /// shortfall is a structured refusal.
    pub async fn evaluate(&self, signal: &Signal) -> Result<GateDecision> {
        let settings = self.settings.settings().await?;

        if !settings.auto_trade_enabled {
            tracing::debug!("auto-trade disabled in settings");
            return Ok(GateDecision::refused("Auto-trade is disabled"));
        }
        if settings.require_manual_approval {
            return Ok(GateDecision::refused("Manual approval required"));
        }

        let midnight = Utc::now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        let today = self.trades.count_since(midnight).await?;
        if today >= u64::from(settings.max_trades_per_day) {
            tracing::warn!(today, limit = settings.max_trades_per_day, "daily trade limit reached");
            return Ok(GateDecision::refused(
                BrokerError::DailyLimitReached {
                    limit: settings.max_trades_per_day,
                }
                .to_string(),
            ));
        }

        let broker = if settings.paper_trading_enabled
            && self.registry.is_registered(BrokerId::Paper)
        {
            self.registry.create(BrokerId::Paper, true)?
        } else {
            match self.registry.active_broker(&settings) {
                Ok(broker) => broker,
                Err(_) => return Ok(GateDecision::refused("No active broker configured")),
            }
        };

        if !broker.is_logged_in() && !settings.paper_trading_enabled {
            return Ok(GateDecision::refused("Broker not logged in"));
        }

        let (Some(symbol), Some(action)) = (&signal.symbol, signal.action) else {
            return Ok(GateDecision::refused(
                "Invalid signal - missing symbol or action",
            ));
        };
        let symbol = symbol.trim().to_ascii_uppercase();
        let exchange = signal.exchange.clone().unwrap_or(Exchange::Nse);

        // Verify the instrument exists, trying BSE when NSE has no hit.
        let exchange = match self.verify_instrument(broker.as_ref(), &symbol, &exchange).await {
            Some(exchange) => exchange,
            None => {
                let fallback = if exchange == Exchange::Nse {
                    self.verify_instrument(broker.as_ref(), &symbol, &Exchange::Bse)
                        .await
                } else {
                    None
                };
                match fallback {
                    Some(exchange) => exchange,
                    None => {
                        return Ok(GateDecision::refused(format!(
                            "Instrument {symbol} not found on {exchange}"
                        )))
                    }
                }
            }
        };

        let current_price = match broker.ltp(&symbol, &exchange).await {
            Ok(price) if !price.is_zero() => price,
            Ok(_) | Err(_) => {
                return Ok(GateDecision::refused("Could not fetch current price"))
            }
        };

        // Stale-signal protection: refuse when the stated entry price has
        // drifted beyond tolerance from the live market.
        let deviation_percent = signal.entry_price.map(|entry| {
            ((entry - current_price).abs() / current_price * Decimal::from(100))
                .to_f64()
                .unwrap_or(f64::MAX)
        });
        if let (Some(deviation), Some(entry)) = (deviation_percent, signal.entry_price) {
            let tolerance = settings
                .price_tolerance_percent
                .to_f64()
                .unwrap_or(0.0);
            if deviation > tolerance {
                tracing::warn!(
                    %entry,
                    %current_price,
                    deviation,
                    tolerance,
                    "signal price outside tolerance"
                );
                return Ok(GateDecision::refused(
                    BrokerError::PriceDeviationExceeded {
                        deviation_percent: deviation,
                        tolerance_percent: tolerance,
                    }
                    .to_string(),
                ));
            }
        }

        // Passed. Go to market unless the signal price meaningfully
        // deviates, in which case pin a limit at the stated price.
        let (order_type, limit_price) = match (signal.entry_price, deviation_percent) {
            (Some(entry), Some(deviation)) if deviation > LIMIT_ORDER_DEVIATION_PERCENT => {
                (OrderType::Limit, Some(entry))
            }
            _ => (OrderType::Market, None),
        };

        Ok(GateDecision::Approved(ApprovedOrder {
            symbol,
            exchange,
            action,
            quantity: signal.quantity.unwrap_or(settings.default_quantity),
            order_type,
            limit_price,
            current_price,
        }))
    }

    /// Confirms the instrument is known to the broker on the exchange,
    /// returning the exchange it was found on.
    async fn verify_instrument(
        &self,
        broker: &dyn Broker,
        symbol: &str,
        exchange: &Exchange,
    ) -> Option<Exchange> {
        match broker.search_symbols(symbol, Some(exchange)).await {
            Ok(hits) if !hits.is_empty() => Some(exchange.clone()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(symbol, exchange = %exchange, error = %e, "instrument verification failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperBroker;
    use rust_decimal_macros::dec;
    use signal_trade_core::{
        AppSettings, InMemorySettingsStore, InMemoryTradeStore, NewTrade, ProductType,
    };

    fn signal(symbol: &str, entry: Option<Decimal>) -> Signal {
        Signal {
            symbol: Some(symbol.to_string()),
            action: Some(Side::Buy),
            entry_price: entry,
            target_price: None,
            stop_loss: None,
            quantity: Some(5),
            exchange: Some(Exchange::Nse),
            product_type: Some(ProductType::Intraday),
            confidence: Some(0.9),
            reasoning: None,
        }
    }

    struct Fixture {
        gate: AutoTradeGate,
        paper: Arc<PaperBroker>,
        trades: Arc<InMemoryTradeStore>,
    }

    fn fixture(settings: AppSettings) -> Fixture {
        let registry = Arc::new(BrokerRegistry::new());
        let paper = Arc::new(PaperBroker::new());
        let paper_for_factory = paper.clone();
        registry.register(
            BrokerId::Paper,
            Arc::new(move || Ok(paper_for_factory.clone() as Arc<dyn Broker>)),
        );
        let trades = Arc::new(InMemoryTradeStore::new());
        let settings = Arc::new(InMemorySettingsStore::new(settings));
        let gate = AutoTradeGate::new(registry, trades.clone(), settings);
        Fixture {
            gate,
            paper,
            trades,
        }
    }

    fn permissive_settings() -> AppSettings {
        AppSettings {
            auto_trade_enabled: true,
            require_manual_approval: false,
            paper_trading_enabled: true,
            ..AppSettings::default()
        }
    }

    #[tokio::test]
    async fn disabled_auto_trade_refuses_with_exact_reason() {
        let fx = fixture(AppSettings {
            auto_trade_enabled: false,
            ..permissive_settings()
        });
        // Everything else is valid; the master switch alone must refuse.
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(2885));

        let decision = fx.gate.evaluate(&signal("RELIANCE-EQ", None)).await.unwrap();
        match decision {
            GateDecision::Refused { reason } => assert_eq!(reason, "Auto-trade is disabled"),
            GateDecision::Approved(_) => panic!("must refuse"),
        }
    }

    #[tokio::test]
    async fn manual_approval_refuses() {
        let fx = fixture(AppSettings {
            require_manual_approval: true,
            ..permissive_settings()
        });
        let decision = fx.gate.evaluate(&signal("RELIANCE-EQ", None)).await.unwrap();
        assert!(!decision.is_approved());
    }

    #[tokio::test]
    async fn daily_limit_refuses_once_reached() {
        let fx = fixture(AppSettings {
            max_trades_per_day: 1,
            ..permissive_settings()
        });
        fx.trades
            .insert(NewTrade {
                symbol: "TCS-EQ".to_string(),
                action: Side::Buy,
                quantity: 1,
                entry_price: None,
                target_price: None,
                stop_loss: None,
                order_type: OrderType::Market,
                exchange: Exchange::Nse,
                product_type: ProductType::Intraday,
                notes: None,
            })
            .await
            .unwrap();

        let decision = fx.gate.evaluate(&signal("RELIANCE-EQ", None)).await.unwrap();
        match decision {
            GateDecision::Refused { reason } => {
                assert!(reason.contains("daily trade limit"), "reason: {reason}");
            }
            GateDecision::Approved(_) => panic!("must refuse"),
        }
    }

    #[tokio::test]
    async fn missing_symbol_or_action_refuses() {
        let fx = fixture(permissive_settings());
        let mut bad = signal("RELIANCE-EQ", None);
        bad.symbol = None;
        let decision = fx.gate.evaluate(&bad).await.unwrap();
        assert!(!decision.is_approved());

        let mut bad = signal("RELIANCE-EQ", None);
        bad.action = None;
        let decision = fx.gate.evaluate(&bad).await.unwrap();
        assert!(!decision.is_approved());
    }

    #[tokio::test]
    async fn unknown_instrument_refuses() {
        let fx = fixture(permissive_settings());
        let decision = fx.gate.evaluate(&signal("GHOST", None)).await.unwrap();
        match decision {
            GateDecision::Refused { reason } => {
                assert!(reason.contains("not found"), "reason: {reason}");
            }
            GateDecision::Approved(_) => panic!("must refuse"),
        }
    }

    #[tokio::test]
    async fn bse_is_tried_when_nse_misses() {
        let fx = fixture(permissive_settings());
        fx.paper.set_price("RELIANCE", &Exchange::Bse, dec!(2885));

        let decision = fx.gate.evaluate(&signal("RELIANCE", None)).await.unwrap();
        match decision {
            GateDecision::Approved(order) => assert_eq!(order.exchange, Exchange::Bse),
            GateDecision::Refused { reason } => panic!("refused: {reason}"),
        }
    }

    #[tokio::test]
    async fn price_deviation_beyond_tolerance_refuses() {
        let fx = fixture(AppSettings {
            price_tolerance_percent: dec!(1),
            ..permissive_settings()
        });
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(100));

        // Signal entry 2% above live with 1% tolerance.
        let decision = fx
            .gate
            .evaluate(&signal("RELIANCE-EQ", Some(dec!(102))))
            .await
            .unwrap();
        match decision {
            GateDecision::Refused { reason } => {
                assert!(reason.contains("price deviation"), "reason: {reason}");
            }
            GateDecision::Approved(_) => panic!("must refuse"),
        }
    }

    #[tokio::test]
    async fn same_deviation_passes_with_wider_tolerance() {
        let fx = fixture(AppSettings {
            price_tolerance_percent: dec!(5),
            ..permissive_settings()
        });
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(100));

        let decision = fx
            .gate
            .evaluate(&signal("RELIANCE-EQ", Some(dec!(102))))
            .await
            .unwrap();
        assert!(decision.is_approved());
    }

    #[tokio::test]
    async fn deviating_price_pins_a_limit_order() {
        let fx = fixture(AppSettings {
            price_tolerance_percent: dec!(5),
            ..permissive_settings()
        });
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(100));

        let decision = fx
            .gate
            .evaluate(&signal("RELIANCE-EQ", Some(dec!(102))))
            .await
            .unwrap();
        match decision {
            GateDecision::Approved(order) => {
                assert_eq!(order.order_type, OrderType::Limit);
                assert_eq!(order.limit_price, Some(dec!(102)));
                assert_eq!(order.current_price, dec!(100));
            }
            GateDecision::Refused { reason } => panic!("refused: {reason}"),
        }
    }

    #[tokio::test]
    async fn matching_price_goes_to_market() {
        let fx = fixture(permissive_settings());
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(100));

        let decision = fx
            .gate
            .evaluate(&signal("RELIANCE-EQ", Some(dec!(100))))
            .await
            .unwrap();
        match decision {
            GateDecision::Approved(order) => {
                assert_eq!(order.order_type, OrderType::Market);
                assert!(order.limit_price.is_none());
                assert_eq!(order.quantity, 5);
            }
            GateDecision::Refused { reason } => panic!("refused: {reason}"),
        }
    }

    #[tokio::test]
    async fn logged_out_broker_without_paper_mode_refuses() {
        let fx = fixture(AppSettings {
            paper_trading_enabled: false,
            active_broker: Some(BrokerId::Paper),
            ..permissive_settings()
        });
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(100));
        fx.paper.logout().await.unwrap();

        let decision = fx.gate.evaluate(&signal("RELIANCE-EQ", None)).await.unwrap();
        match decision {
            GateDecision::Refused { reason } => assert_eq!(reason, "Broker not logged in"),
            GateDecision::Approved(_) => panic!("must refuse"),
        }
    }

    #[tokio::test]
    async fn no_registered_broker_refuses() {
        let registry = Arc::new(BrokerRegistry::new());
        let trades = Arc::new(InMemoryTradeStore::new());
        let settings = Arc::new(InMemorySettingsStore::new(AppSettings {
            paper_trading_enabled: false,
            ..permissive_settings()
        }));
        let gate = AutoTradeGate::new(registry, trades, settings);

        let decision = gate.evaluate(&signal("RELIANCE-EQ", None)).await.unwrap();
        match decision {
            GateDecision::Refused { reason } => {
                assert_eq!(reason, "No active broker configured");
            }
            GateDecision::Approved(_) => panic!("must refuse"),
        }
    }
}
