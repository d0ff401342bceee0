pub mod broker;
pub mod client;

pub use broker::ZerodhaBroker;
pub use client::{session_checksum, KiteClient, KiteClientConfig, KITE_API_URL, KITE_LOGIN_URL};
