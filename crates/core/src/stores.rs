//! Collaborator boundaries: persistence, credentials, secret codec.
//!
//! The actual database and encryption implementations live outside this
//! workspace; the core talks to them through these traits. In-memory
//! implementations are provided for tests and the paper-trading path.

use crate::broker::BrokerId;
use crate::error::{BrokerError, BrokerResult};
use crate::settings::AppSettings;
use crate::trade::{NewTrade, Trade, TradeStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Opaque credential bundle for one backend, fetched by the external store
/// and handed to [`crate::Broker::login`]. Secret fields are never logged.
#[derive(Clone)]
pub struct BrokerCredentials {
    pub broker: BrokerId,
    pub api_key: String,
    pub client_id: String,
    /// Password, or for OAuth-style vendors the request token.
    pub password: Option<SecretString>,
    /// TOTP secret (base32) or a pre-generated one-time code.
    pub totp_secret: Option<SecretString>,
    /// API secret for vendors that exchange a request token.
    pub api_secret: Option<SecretString>,
    /// Previously persisted session token, for silent restoration.
    pub session_token: Option<SecretString>,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// A persisted session eligible for silent restoration.
#[derive(Clone)]
pub struct SavedSession {
    pub client_id: String,
    pub api_key: String,
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Credential persistence boundary.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetches the credential bundle for a backend, if configured.
    async fn credentials(&self, broker: BrokerId) -> Result<Option<BrokerCredentials>>;

    /// Persists a session token after a successful login.
    async fn store_session(
        &self,
        broker: BrokerId,
        client_id: &str,
        token: &SecretString,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns an unexpired saved session, if one exists.
    async fn saved_session(&self, broker: BrokerId) -> Result<Option<SavedSession>>;

    /// Deactivates a stored config so subsequent calls fail fast instead of
    /// retrying bad credentials.
    async fn deactivate(&self, broker: BrokerId) -> Result<()>;
}

/// Secret codec boundary. Decryption failure means "credentials invalid,
/// require re-entry", never a fatal process error.
pub trait CredentialCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> BrokerResult<String>;
    fn decrypt(&self, ciphertext: &str) -> BrokerResult<String>;
}

/// Identity codec for tests and paper mode.
#[derive(Debug, Default)]
pub struct PassthroughCodec;

impl CredentialCodec for PassthroughCodec {
    fn encrypt(&self, plaintext: &str) -> BrokerResult<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> BrokerResult<String> {
        if ciphertext.is_empty() {
            return Err(BrokerError::DecryptionFailed);
        }
        Ok(ciphertext.to_string())
    }
}

/// Trade persistence boundary. Row-level atomicity of status updates is an
/// external guarantee; the orchestrator commits one trade at a time.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Inserts a new trade in `PENDING` status and returns it with identity.
    async fn insert(&self, new_trade: NewTrade) -> Result<Trade>;

    /// Fetches a trade by id.
    async fn get(&self, id: i64) -> Result<Option<Trade>>;

    /// Writes back a mutated trade.
    async fn update(&self, trade: &Trade) -> Result<()>;

    /// Trades with a broker order id that are not yet terminal, i.e. the
    /// reconciliation working set.
    async fn reconcilable(&self) -> Result<Vec<Trade>>;

    /// Number of trades created since the given instant.
    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64>;
}

/// Settings persistence boundary.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn settings(&self) -> Result<AppSettings>;
    async fn update(&self, settings: AppSettings) -> Result<()>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

/// In-memory trade store for tests and the paper path.
pub struct InMemoryTradeStore {
    trades: Mutex<HashMap<i64, Trade>>,
    next_id: AtomicI64,
}

impl InMemoryTradeStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            trades: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryTradeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn insert(&self, new_trade: NewTrade) -> Result<Trade> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let trade = Trade {
            id,
            symbol: new_trade.symbol,
            action: new_trade.action,
            quantity: new_trade.quantity,
            entry_price: new_trade.entry_price,
            target_price: new_trade.target_price,
            stop_loss: new_trade.stop_loss,
            order_type: new_trade.order_type,
            exchange: new_trade.exchange,
            product_type: new_trade.product_type,
            order_id: None,
            status: TradeStatus::Pending,
            broker_status: None,
            broker_rejection_reason: None,
            average_price: None,
            filled_quantity: None,
            execution_price: None,
            execution_time: None,
            last_status_check: None,
            notes: new_trade.notes,
            error_message: None,
            order_variety: None,
            created_at: now,
            updated_at: now,
        };
        self.trades.lock().insert(id, trade.clone());
        Ok(trade)
    }

    async fn get(&self, id: i64) -> Result<Option<Trade>> {
        Ok(self.trades.lock().get(&id).cloned())
    }

    async fn update(&self, trade: &Trade) -> Result<()> {
        self.trades.lock().insert(trade.id, trade.clone());
        Ok(())
    }

    async fn reconcilable(&self) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .lock()
            .values()
            .filter(|t| t.order_id.is_some() && !t.status.is_terminal())
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.id);
        Ok(trades)
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .trades
            .lock()
            .values()
            .filter(|t| t.created_at >= since)
            .count() as u64)
    }
}

/// In-memory credential store for tests and single-process wiring.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: Mutex<HashMap<BrokerId, BrokerCredentials>>,
    sessions: Mutex<HashMap<BrokerId, SavedSession>>,
    deactivated: Mutex<HashMap<BrokerId, bool>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a credential bundle.
    pub fn put_credentials(&self, creds: BrokerCredentials) {
        self.credentials.lock().insert(creds.broker, creds);
    }

    /// Seeds a saved session (e.g. a previously persisted token).
    pub fn put_session(&self, broker: BrokerId, session: SavedSession) {
        self.sessions.lock().insert(broker, session);
    }

    /// Whether a backend's config has been deactivated.
    #[must_use]
    pub fn is_deactivated(&self, broker: BrokerId) -> bool {
        self.deactivated.lock().get(&broker).copied().unwrap_or(false)
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn credentials(&self, broker: BrokerId) -> Result<Option<BrokerCredentials>> {
        Ok(self.credentials.lock().get(&broker).cloned())
    }

    async fn store_session(
        &self,
        broker: BrokerId,
        client_id: &str,
        token: &SecretString,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let api_key = self
            .credentials
            .lock()
            .get(&broker)
            .map(|c| c.api_key.clone())
            .unwrap_or_default();
        self.sessions.lock().insert(
            broker,
            SavedSession {
                client_id: client_id.to_string(),
                api_key,
                token: token.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn saved_session(&self, broker: BrokerId) -> Result<Option<SavedSession>> {
        let session = self.sessions.lock().get(&broker).cloned();
        Ok(session.filter(|s| s.expires_at > Utc::now()))
    }

    async fn deactivate(&self, broker: BrokerId) -> Result<()> {
        self.deactivated.lock().insert(broker, true);
        self.sessions.lock().remove(&broker);
        Ok(())
    }
}

/// In-memory settings store for tests and the paper path.
pub struct InMemorySettingsStore {
    settings: Mutex<AppSettings>,
}

impl InMemorySettingsStore {
    #[must_use]
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl Default for InMemorySettingsStore {
    fn default() -> Self {
        Self::new(AppSettings::default())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn settings(&self) -> Result<AppSettings> {
        Ok(self.settings.lock().clone())
    }

    async fn update(&self, settings: AppSettings) -> Result<()> {
        *self.settings.lock() = settings;
        Ok(())
    }
}
