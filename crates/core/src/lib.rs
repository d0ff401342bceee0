pub mod broker;
pub mod error;
pub mod settings;
pub mod stores;
pub mod totp;
pub mod trade;
pub mod types;

pub use broker::{Broker, BrokerId};
pub use error::{BrokerError, BrokerResult};
pub use settings::AppSettings;
pub use stores::{
    BrokerCredentials, CredentialCodec, CredentialStore, InMemoryCredentialStore,
    InMemorySettingsStore, InMemoryTradeStore, PassthroughCodec, SavedSession, SettingsStore,
    TradeStore,
};
pub use trade::{NewTrade, Trade, TradeEvent, TradeStatus};
pub use types::{
    BracketSpec, BrokerOrderState, Exchange, Funds, GttAck, GttSpec, Holding, InstrumentKind,
    LoginOutcome, OrderAck, OrderSnapshot, OrderSpec, OrderType, OrderUpdate, Position,
    ProductType, Side, Signal, SymbolMatch,
};
