pub mod broker;
pub mod client;

pub use broker::ShoonyaBroker;
pub use client::{sha256_hex, NorenClient, NorenClientConfig, SHOONYA_API_URL};
