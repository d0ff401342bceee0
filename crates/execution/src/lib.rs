pub mod gate;
pub mod orchestrator;
pub mod paper;
pub mod registry;

pub use gate::{ApprovedOrder, AutoTradeGate, GateDecision};
pub use orchestrator::{
    spawn_reconciliation, OrchestratorConfig, ReconciliationHandle, SyncSummary, TradeOrchestrator,
};
pub use paper::PaperBroker;
pub use registry::{BrokerFactory, BrokerRegistry};
