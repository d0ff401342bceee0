//! Trade lifecycle orchestration.
//!
//! Drives a trade from creation through symbol resolution, order
//! placement, the immediate post-submission status check, and periodic
//! reconciliation against the broker's order book. Status transitions go
//! through [`Trade::transition`], so a late broker update can never move a
//! trade backwards.

use crate::registry::BrokerRegistry;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use signal_trade_core::{
    Broker, BrokerError, BrokerId, BrokerOrderState, Exchange, NewTrade, OrderSnapshot, OrderSpec,
    BracketSpec, SettingsStore, Trade, TradeEvent, TradeStatus, TradeStore,
};
use signal_trade_instruments::SymbolResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay between order submission and the first status check, giving
    /// the vendor time to process.
    pub post_submit_delay: Duration,

    /// Interval of the background reconciliation sweep.
    pub reconcile_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            post_submit_delay: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    /// Trades examined.
    pub checked: usize,
    /// Trades whose status changed.
    pub updated: usize,
}

/// The trade lifecycle orchestrator.
pub struct TradeOrchestrator {
    registry: Arc<BrokerRegistry>,
    resolver: Arc<SymbolResolver>,
    trades: Arc<dyn TradeStore>,
    settings: Arc<dyn SettingsStore>,
    events: broadcast::Sender<TradeEvent>,
    config: OrchestratorConfig,
}

impl TradeOrchestrator {
    /// Creates an orchestrator. Collaborators are injected explicitly;
    /// nothing here is global state.
    #[must_use]
    pub fn new(
        registry: Arc<BrokerRegistry>,
        resolver: Arc<SymbolResolver>,
        trades: Arc<dyn TradeStore>,
        settings: Arc<dyn SettingsStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            resolver,
            trades,
            settings,
            events,
            config,
        }
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TradeEvent) {
        // Nobody listening is fine; events are best-effort notifications.
        let _ = self.events.send(event);
    }

    /// Creates a trade in `PENDING` status.
    pub async fn create_trade(&self, new_trade: NewTrade) -> Result<Trade> {
        let trade = self.trades.insert(new_trade).await?;
        self.emit(TradeEvent::Created {
            trade_id: trade.id,
            symbol: trade.symbol.clone(),
            action: trade.action,
            quantity: trade.quantity,
        });
        Ok(trade)
    }

    /// Picks the execution backend: the paper broker when paper trading is
    /// enabled and registered, the active live backend otherwise.
    async fn select_broker(&self) -> Result<Arc<dyn Broker>> {
        let settings = self.settings.settings().await?;
        if settings.paper_trading_enabled && self.registry.is_registered(BrokerId::Paper) {
            return Ok(self.registry.create(BrokerId::Paper, true)?);
        }
        Ok(self.registry.active_broker(&settings)?)
    }

    /// Executes a pending trade end to end.
    ///
    /// Resolution failures are non-fatal: the trade proceeds with the
    /// best-effort symbol and the warning is recorded in its notes. If
    /// placement then also fails, the trade moves to `FAILED` carrying
    /// both messages.
    pub async fn execute(&self, trade_id: i64) -> Result<Trade> {
        let mut trade = self
            .trades
            .get(trade_id)
            .await?
            .with_context(|| format!("trade {trade_id} not found"))?;

        let broker = self.select_broker().await?;
        if !broker.is_logged_in() {
            return self
                .fail_trade(trade, "Broker not logged in".to_string())
                .await;
        }

        self.resolve_into(&mut trade).await;
        self.trades.update(&trade).await?;

        let spec = OrderSpec {
            symbol: trade.symbol.clone(),
            exchange: trade.exchange.clone(),
            side: trade.action,
            quantity: trade.quantity,
            order_type: trade.order_type,
            product_type: trade.product_type,
            price: trade.entry_price,
            trigger_price: None,
        };

        match broker.place_order(&spec).await {
            Ok(ack) => {
                self.mark_submitted(&mut trade, ack.order_id).await?;
                self.immediate_status_check(&mut trade, broker.as_ref())
                    .await?;
                Ok(trade)
            }
            Err(e) => {
                let message = vendor_message(&e);
                trade.push_note(&format!("placement failed: {message}"));
                self.fail_trade(trade, message).await
            }
        }
    }

    /// Executes a trade as a bracket order. All three of entry, target and
    /// stop-loss must be present.
    pub async fn execute_bracket(&self, trade_id: i64) -> Result<Trade> {
        let mut trade = self
            .trades
            .get(trade_id)
            .await?
            .with_context(|| format!("trade {trade_id} not found"))?;

        let (Some(entry), Some(target), Some(stop)) =
            (trade.entry_price, trade.target_price, trade.stop_loss)
        else {
            bail!("bracket order requires entry, target and stop-loss prices");
        };

        let broker = self.select_broker().await?;
        if !broker.is_logged_in() {
            return self
                .fail_trade(trade, "Broker not logged in".to_string())
                .await;
        }

        self.resolve_into(&mut trade).await;
        trade.order_variety = Some("BRACKET".to_string());
        self.trades.update(&trade).await?;

        let spec = BracketSpec {
            symbol: trade.symbol.clone(),
            exchange: trade.exchange.clone(),
            side: trade.action,
            quantity: trade.quantity,
            entry_price: entry,
            target_price: target,
            stop_loss: stop,
            product_type: trade.product_type,
            trailing_sl: None,
        };

        match broker.place_bracket_order(&spec).await {
            Ok(ack) => {
                self.mark_submitted(&mut trade, ack.order_id).await?;
                self.immediate_status_check(&mut trade, broker.as_ref())
                    .await?;
                Ok(trade)
            }
            Err(e) => {
                let message = vendor_message(&e);
                trade.push_note(&format!("bracket placement failed: {message}"));
                self.fail_trade(trade, message).await
            }
        }
    }

    /// Resolves the trade's symbol in place, recording what changed (or
    /// what could not be confirmed) in the trade notes.
    async fn resolve_into(&self, trade: &mut Trade) {
        let resolution = self.resolver.resolve(&trade.symbol, &trade.exchange).await;

        if resolution.success {
            if resolution.resolved_symbol != trade.symbol {
                trade.push_note(&format!(
                    "Symbol resolved: {} -> {}",
                    trade.symbol, resolution.resolved_symbol
                ));
                trade.symbol = resolution.resolved_symbol.clone();
            }
            if resolution.exchange != trade.exchange {
                trade.push_note(&format!(
                    "exchange: {} -> {}",
                    trade.exchange, resolution.exchange
                ));
                trade.exchange = resolution.exchange.clone();
            }
            if resolution.token.is_none() {
                trade.push_note(&resolution.message);
            }
        } else {
            tracing::warn!(trade_id = trade.id, message = %resolution.message, "symbol resolution failed");
            trade.push_note(&resolution.message);
        }
    }

    async fn mark_submitted(&self, trade: &mut Trade, order_id: String) -> Result<()> {
        let old_status = trade.status;
        trade.order_id = Some(order_id);
        trade.transition(TradeStatus::Submitted, Utc::now());
        self.trades.update(trade).await?;
        self.emit(TradeEvent::StatusChanged {
            trade_id: trade.id,
            order_id: trade.order_id.clone(),
            old_status,
            new_status: trade.status,
            broker_status: trade.broker_status.clone(),
            rejection_reason: None,
        });
        Ok(())
    }

    /// The immediate post-submission check. A failed check leaves the
    /// trade `SUBMITTED` for the reconciliation sweep to pick up later.
    async fn immediate_status_check(&self, trade: &mut Trade, broker: &dyn Broker) -> Result<()> {
        tokio::time::sleep(self.config.post_submit_delay).await;

        let Some(order_id) = trade.order_id.clone() else {
            return Ok(());
        };
        match broker.order_status(&order_id).await {
            Ok(snapshot) => {
                let old_status = trade.status;
                if self.apply_snapshot(trade, &snapshot) {
                    self.emit(TradeEvent::StatusChanged {
                        trade_id: trade.id,
                        order_id: trade.order_id.clone(),
                        old_status,
                        new_status: trade.status,
                        broker_status: trade.broker_status.clone(),
                        rejection_reason: trade.broker_rejection_reason.clone(),
                    });
                }
                self.trades.update(trade).await?;
            }
            Err(e) => {
                tracing::warn!(trade_id = trade.id, error = %e, "post-submission status check failed");
            }
        }
        Ok(())
    }

    /// Applies a broker snapshot to a trade. Returns whether the lifecycle
    /// status changed.
    fn apply_snapshot(&self, trade: &mut Trade, snapshot: &OrderSnapshot) -> bool {
        let now = Utc::now();
        trade.broker_status = Some(snapshot.broker_status.clone());
        trade.filled_quantity = Some(snapshot.filled_quantity);
        trade.average_price = snapshot.average_price;
        trade.last_status_check = Some(now);

        let next = match snapshot.state {
            BrokerOrderState::Executed => TradeStatus::Executed,
            BrokerOrderState::Rejected => TradeStatus::Rejected,
            BrokerOrderState::Cancelled => TradeStatus::Cancelled,
            BrokerOrderState::Open => TradeStatus::Open,
            // Vendor still processing; lifecycle status stands.
            BrokerOrderState::Pending => return false,
        };

        let changed = trade.transition(next, now);
        if changed {
            match next {
                TradeStatus::Executed => {
                    trade.execution_price = snapshot.average_price.or(trade.entry_price);
                    trade.execution_time = Some(now);
                }
                TradeStatus::Rejected => {
                    trade.broker_rejection_reason = snapshot.rejection_reason.clone();
                    trade.error_message = snapshot.rejection_reason.clone();
                }
                _ => {}
            }
        }
        changed
    }

    async fn fail_trade(&self, mut trade: Trade, message: String) -> Result<Trade> {
        let old_status = trade.status;
        trade.transition(TradeStatus::Failed, Utc::now());
        trade.error_message = Some(message.clone());
        self.trades.update(&trade).await?;
        tracing::error!(trade_id = trade.id, message = %message, "trade failed");
        self.emit(TradeEvent::StatusChanged {
            trade_id: trade.id,
            order_id: trade.order_id.clone(),
            old_status,
            new_status: trade.status,
            broker_status: trade.broker_status.clone(),
            rejection_reason: None,
        });
        Ok(trade)
    }

    /// Reconciliation sweep: one batched order-book fetch, then a
    /// per-trade update pass.
    ///
    /// Trades whose order id is absent from the book are left untouched
    /// (the gap may be a transient vendor API issue, not a lost order).
    /// A failure updating one trade never aborts the sweep for the rest,
    /// and each trade's update is committed individually.
    pub async fn sync_order_statuses(&self) -> Result<SyncSummary> {
        let trades = self.trades.reconcilable().await?;
        if trades.is_empty() {
            return Ok(SyncSummary {
                checked: 0,
                updated: 0,
            });
        }

        let broker = self.select_broker().await?;
        if !broker.is_logged_in() {
            bail!("broker not logged in");
        }

        let book = broker.all_order_statuses().await?;
        let by_order_id: HashMap<&str, &OrderSnapshot> = book
            .iter()
            .map(|snapshot| (snapshot.order_id.as_str(), snapshot))
            .collect();

        let checked = trades.len();
        let mut updated = 0;

        for mut trade in trades {
            let Some(order_id) = trade.order_id.clone() else {
                continue;
            };
            let Some(snapshot) = by_order_id.get(order_id.as_str()) else {
                tracing::debug!(trade_id = trade.id, order_id = %order_id, "order absent from broker book, leaving unchanged");
                continue;
            };

            let old_status = trade.status;
            let changed = self.apply_snapshot(&mut trade, snapshot);
            match self.trades.update(&trade).await {
                Ok(()) => {
                    if changed {
                        updated += 1;
                        tracing::info!(
                            trade_id = trade.id,
                            from = %old_status,
                            to = %trade.status,
                            "trade status reconciled"
                        );
                        self.emit(TradeEvent::StatusChanged {
                            trade_id: trade.id,
                            order_id: trade.order_id.clone(),
                            old_status,
                            new_status: trade.status,
                            broker_status: trade.broker_status.clone(),
                            rejection_reason: trade.broker_rejection_reason.clone(),
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(trade_id = trade.id, error = %e, "failed to persist reconciled trade, continuing sweep");
                }
            }
        }

        self.emit(TradeEvent::SyncCompleted { checked, updated });
        Ok(SyncSummary { checked, updated })
    }
}

/// Extracts the vendor-facing message from an error, without the variant
/// prefix, so trade records carry the reason verbatim.
fn vendor_message(error: &BrokerError) -> String {
    match error {
        BrokerError::Api { message, .. } => message.clone(),
        BrokerError::OrderRejected { reason } => reason.clone(),
        BrokerError::OrderPlacementFailed(message) => message.clone(),
        BrokerError::Authentication(message) => message.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Background reconciliation task
// =============================================================================

/// Handle for the background reconciliation task.
pub struct ReconciliationHandle {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ReconciliationHandle {
    /// Signals shutdown and waits for the task to finish its current
    /// per-trade commit. No sweep is left half-persisted: commits happen
    /// one trade at a time inside the sweep itself.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "reconciliation task join failed");
        }
    }
}

/// Spawns the periodic reconciliation sweep as an independent task.
#[must_use]
pub fn spawn_reconciliation(orchestrator: Arc<TradeOrchestrator>) -> ReconciliationHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = orchestrator.config.reconcile_interval;

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match orchestrator.sync_order_statuses().await {
                        Ok(summary) if summary.checked > 0 => {
                            tracing::debug!(checked = summary.checked, updated = summary.updated, "reconciliation sweep done");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "reconciliation sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("reconciliation task shutting down");
                    break;
                }
            }
        }
    });

    ReconciliationHandle {
        shutdown: shutdown_tx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperBroker;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use signal_trade_core::{
        AppSettings, BrokerCredentials, BrokerResult, Funds, GttAck, GttSpec, Holding,
        InMemorySettingsStore, InMemoryTradeStore, LoginOutcome, OrderAck, OrderType,
        OrderUpdate, Position, ProductType, Side, SymbolMatch,
    };
    use signal_trade_instruments::InstrumentIndex;

    fn new_trade(symbol: &str, entry: Option<Decimal>) -> NewTrade {
        NewTrade {
            symbol: symbol.to_string(),
            action: Side::Buy,
            quantity: 10,
            entry_price: entry,
            target_price: None,
            stop_loss: None,
            order_type: OrderType::Market,
            exchange: Exchange::Nse,
            product_type: ProductType::Intraday,
            notes: None,
        }
    }

    struct Fixture {
        orchestrator: Arc<TradeOrchestrator>,
        trades: Arc<InMemoryTradeStore>,
        paper: Arc<PaperBroker>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(BrokerRegistry::new());
        let paper = Arc::new(PaperBroker::new());
        let paper_for_factory = paper.clone();
        registry.register(
            BrokerId::Paper,
            Arc::new(move || Ok(paper_for_factory.clone() as Arc<dyn Broker>)),
        );

        let trades = Arc::new(InMemoryTradeStore::new());
        let settings = Arc::new(InMemorySettingsStore::new(AppSettings {
            paper_trading_enabled: true,
            ..AppSettings::default()
        }));
        let resolver = Arc::new(SymbolResolver::new(Arc::new(
            InstrumentIndex::from_instruments(vec![]),
        )));
        let orchestrator = Arc::new(TradeOrchestrator::new(
            registry,
            resolver,
            trades.clone(),
            settings,
            OrchestratorConfig {
                post_submit_delay: Duration::from_millis(0),
                reconcile_interval: Duration::from_millis(20),
            },
        ));
        Fixture {
            orchestrator,
            trades,
            paper,
        }
    }

    /// Broker stub whose placement result is scripted per test.
    struct RejectingBroker {
        message: String,
    }

    #[async_trait]
    impl Broker for RejectingBroker {
        fn id(&self) -> BrokerId {
            BrokerId::AngelOne
        }
        fn is_logged_in(&self) -> bool {
            true
        }
        fn client_id(&self) -> Option<String> {
            Some("STUB".to_string())
        }
        async fn login(&self, _c: &BrokerCredentials) -> BrokerResult<LoginOutcome> {
            Ok(LoginOutcome::LoggedIn {
                message: String::new(),
            })
        }
        async fn logout(&self) -> BrokerResult<()> {
            Ok(())
        }
        async fn place_order(&self, _spec: &OrderSpec) -> BrokerResult<OrderAck> {
            Err(BrokerError::api(200, self.message.clone()))
        }
        async fn cancel_order(&self, _id: &str) -> BrokerResult<()> {
            Ok(())
        }
        async fn modify_order(&self, _id: &str, _u: &OrderUpdate) -> BrokerResult<()> {
            Ok(())
        }
        async fn order_status(&self, id: &str) -> BrokerResult<OrderSnapshot> {
            Err(BrokerError::order_not_found(id))
        }
        async fn all_order_statuses(&self) -> BrokerResult<Vec<OrderSnapshot>> {
            Ok(Vec::new())
        }
        async fn positions(&self) -> BrokerResult<Vec<Position>> {
            Ok(Vec::new())
        }
        async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
            Ok(Vec::new())
        }
        async fn order_book(&self) -> BrokerResult<Vec<OrderSnapshot>> {
            Ok(Vec::new())
        }
        async fn funds(&self) -> BrokerResult<Funds> {
            Ok(Funds {
                available_cash: Decimal::ZERO,
                used_margin: Decimal::ZERO,
                available_margin: Decimal::ZERO,
            })
        }
        async fn ltp(&self, _s: &str, _e: &Exchange) -> BrokerResult<Decimal> {
            Ok(Decimal::ZERO)
        }
        async fn search_symbols(
            &self,
            _q: &str,
            _e: Option<&Exchange>,
        ) -> BrokerResult<Vec<SymbolMatch>> {
            Ok(Vec::new())
        }
        async fn refresh_instruments(&self) -> BrokerResult<bool> {
            Ok(true)
        }
        async fn place_bracket_order(&self, _spec: &BracketSpec) -> BrokerResult<OrderAck> {
            Err(BrokerError::unsupported("stub", "bracket orders"))
        }
        async fn place_gtt_order(&self, _spec: &GttSpec) -> BrokerResult<GttAck> {
            Err(BrokerError::unsupported("stub", "GTT orders"))
        }
    }

    fn fixture_with_live(broker: Arc<dyn Broker>) -> Fixture {
        let registry = Arc::new(BrokerRegistry::new());
        let broker_for_factory = broker.clone();
        registry.register(
            BrokerId::AngelOne,
            Arc::new(move || Ok(broker_for_factory.clone())),
        );

        let trades = Arc::new(InMemoryTradeStore::new());
        let settings = Arc::new(InMemorySettingsStore::new(AppSettings {
            paper_trading_enabled: false,
            ..AppSettings::default()
        }));
        let resolver = Arc::new(SymbolResolver::new(Arc::new(
            InstrumentIndex::from_instruments(vec![]),
        )));
        let orchestrator = Arc::new(TradeOrchestrator::new(
            registry,
            resolver,
            trades.clone(),
            settings,
            OrchestratorConfig {
                post_submit_delay: Duration::from_millis(0),
                reconcile_interval: Duration::from_millis(20),
            },
        ));
        Fixture {
            orchestrator,
            trades,
            paper: Arc::new(PaperBroker::new()),
        }
    }

    // ==================== Execution ====================

    #[tokio::test]
    async fn paper_execution_runs_to_executed() {
        let fx = fixture();
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(2885.50));

        let trade = fx
            .orchestrator
            .create_trade(new_trade("RELIANCE-EQ", None))
            .await
            .unwrap();
        let done = fx.orchestrator.execute(trade.id).await.unwrap();

        assert_eq!(done.status, TradeStatus::Executed);
        assert!(done.order_id.as_deref().unwrap().starts_with("PAPER-"));
        assert_eq!(done.execution_price, Some(dec!(2885.50)));
        assert!(done.execution_time.is_some());
        assert!(done.last_status_check.is_some());
    }

    #[tokio::test]
    async fn placement_failure_moves_trade_to_failed_with_vendor_message() {
        let fx = fixture_with_live(Arc::new(RejectingBroker {
            message: "insufficient margin".to_string(),
        }));

        let trade = fx
            .orchestrator
            .create_trade(new_trade("RELIANCE-EQ", Some(dec!(2885))))
            .await
            .unwrap();
        let done = fx.orchestrator.execute(trade.id).await.unwrap();

        assert_eq!(done.status, TradeStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("insufficient margin"));
    }

    #[tokio::test]
    async fn failed_trade_notes_carry_resolution_warning_and_placement_error() {
        let fx = fixture_with_live(Arc::new(RejectingBroker {
            message: "insufficient margin".to_string(),
        }));

        // Empty index: the option resolves to an unvalidated construction.
        let trade = fx
            .orchestrator
            .create_trade(new_trade("NIFTY 25000 CE", Some(dec!(120))))
            .await
            .unwrap();
        let done = fx.orchestrator.execute(trade.id).await.unwrap();

        assert_eq!(done.status, TradeStatus::Failed);
        let notes = done.notes.unwrap();
        assert!(notes.contains("unvalidated"), "notes: {notes}");
        assert!(notes.contains("insufficient margin"), "notes: {notes}");
    }

    #[tokio::test]
    async fn logged_out_broker_fails_the_trade_before_any_call() {
        let fx = fixture();
        // Log the paper broker out to simulate a dead session.
        fx.paper.logout().await.unwrap();

        let trade = fx
            .orchestrator
            .create_trade(new_trade("RELIANCE-EQ", Some(dec!(2885))))
            .await
            .unwrap();
        let done = fx.orchestrator.execute(trade.id).await.unwrap();

        assert_eq!(done.status, TradeStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("Broker not logged in"));
    }

    #[tokio::test]
    async fn bracket_requires_all_three_prices() {
        let fx = fixture();
        let trade = fx
            .orchestrator
            .create_trade(new_trade("RELIANCE-EQ", Some(dec!(100))))
            .await
            .unwrap();
        let err = fx.orchestrator.execute_bracket(trade.id).await.unwrap_err();
        assert!(err.to_string().contains("bracket order requires"));
    }

    #[tokio::test]
    async fn unsupported_bracket_fails_the_trade_explicitly() {
        let fx = fixture_with_live(Arc::new(RejectingBroker {
            message: "unused".to_string(),
        }));
        let mut new = new_trade("RELIANCE-EQ", Some(dec!(100)));
        new.target_price = Some(dec!(110));
        new.stop_loss = Some(dec!(95));
        let trade = fx.orchestrator.create_trade(new).await.unwrap();
        let done = fx.orchestrator.execute_bracket(trade.id).await.unwrap();

        assert_eq!(done.status, TradeStatus::Failed);
        assert!(done
            .error_message
            .as_deref()
            .unwrap()
            .contains("not supported"));
        assert_eq!(done.order_variety.as_deref(), Some("BRACKET"));
    }

    // ==================== Reconciliation ====================

    #[tokio::test]
    async fn sweep_updates_trades_found_in_the_book() {
        let fx = fixture();
        fx.paper.set_price("TCS-EQ", &Exchange::Nse, dec!(100));

        // A fill the local store does not know the outcome of yet.
        let ack = fx
            .paper
            .place_order(&OrderSpec::market("TCS-EQ", Exchange::Nse, Side::Buy, 1))
            .await
            .unwrap();

        let mut trade = fx
            .orchestrator
            .create_trade(new_trade("TCS-EQ", None))
            .await
            .unwrap();
        trade.order_id = Some(ack.order_id);
        trade.transition(TradeStatus::Submitted, Utc::now());
        fx.trades.update(&trade).await.unwrap();

        let summary = fx.orchestrator.sync_order_statuses().await.unwrap();
        assert_eq!(summary, SyncSummary { checked: 1, updated: 1 });

        let synced = fx.trades.get(trade.id).await.unwrap().unwrap();
        assert_eq!(synced.status, TradeStatus::Executed);
        assert_eq!(synced.broker_status.as_deref(), Some("complete"));
    }

    #[tokio::test]
    async fn sweep_leaves_absent_orders_untouched() {
        let fx = fixture();

        let mut trade = fx
            .orchestrator
            .create_trade(new_trade("TCS-EQ", None))
            .await
            .unwrap();
        trade.order_id = Some("PAPER-999".to_string());
        trade.transition(TradeStatus::Submitted, Utc::now());
        fx.trades.update(&trade).await.unwrap();

        let summary = fx.orchestrator.sync_order_statuses().await.unwrap();
        assert_eq!(summary, SyncSummary { checked: 1, updated: 0 });

        let unchanged = fx.trades.get(trade.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TradeStatus::Submitted);
    }

    #[tokio::test]
    async fn sweep_never_drags_a_terminal_trade_backwards() {
        let fx = fixture();
        fx.paper.set_price("TCS-EQ", &Exchange::Nse, dec!(100));
        let ack = fx
            .paper
            .place_order(&OrderSpec::market("TCS-EQ", Exchange::Nse, Side::Buy, 1))
            .await
            .unwrap();

        let mut trade = fx
            .orchestrator
            .create_trade(new_trade("TCS-EQ", None))
            .await
            .unwrap();
        trade.order_id = Some(ack.order_id);
        trade.transition(TradeStatus::Submitted, Utc::now());
        trade.transition(TradeStatus::Executed, Utc::now());
        fx.trades.update(&trade).await.unwrap();

        // The book reports "complete" again; the trade is already there.
        let summary = fx.orchestrator.sync_order_statuses().await.unwrap();
        assert_eq!(summary.updated, 0);
    }

    #[tokio::test]
    async fn empty_working_set_skips_broker_calls() {
        let fx = fixture();
        fx.paper.logout().await.unwrap();
        // No reconcilable trades: the sweep must not even need a login.
        let summary = fx.orchestrator.sync_order_statuses().await.unwrap();
        assert_eq!(summary, SyncSummary { checked: 0, updated: 0 });
    }

    #[tokio::test]
    async fn background_task_runs_and_shuts_down_cleanly() {
        let fx = fixture();
        fx.paper.set_price("TCS-EQ", &Exchange::Nse, dec!(100));
        let ack = fx
            .paper
            .place_order(&OrderSpec::market("TCS-EQ", Exchange::Nse, Side::Buy, 1))
            .await
            .unwrap();
        let mut trade = fx
            .orchestrator
            .create_trade(new_trade("TCS-EQ", None))
            .await
            .unwrap();
        trade.order_id = Some(ack.order_id);
        trade.transition(TradeStatus::Submitted, Utc::now());
        fx.trades.update(&trade).await.unwrap();

        let handle = spawn_reconciliation(fx.orchestrator.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let synced = fx.trades.get(trade.id).await.unwrap().unwrap();
        assert_eq!(synced.status, TradeStatus::Executed);
    }

    // ==================== Events ====================

    #[tokio::test]
    async fn lifecycle_events_are_broadcast() {
        let fx = fixture();
        fx.paper.set_price("RELIANCE-EQ", &Exchange::Nse, dec!(2885.50));
        let mut events = fx.orchestrator.subscribe();

        let trade = fx
            .orchestrator
            .create_trade(new_trade("RELIANCE-EQ", None))
            .await
            .unwrap();
        fx.orchestrator.execute(trade.id).await.unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, TradeEvent::Created { .. }));
        let second = events.recv().await.unwrap();
        match second {
            TradeEvent::StatusChanged { new_status, .. } => {
                assert_eq!(new_status, TradeStatus::Submitted);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
