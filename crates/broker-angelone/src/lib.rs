pub mod broker;
pub mod client;

pub use broker::AngelOneBroker;
pub use client::{AngelOneClient, AngelOneClientConfig, ANGELONE_API_URL};
