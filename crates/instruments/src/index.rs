//! In-memory instrument index built from the instrument-master feed.
//!
//! The index keeps two lookup structures over the same data: an exact-match
//! map keyed by `EXCHANGE:SYMBOL` and `EXCHANGE:NAME`, and the full list for
//! substring search. Both are rebuilt wholesale on refresh and swapped in
//! atomically; readers always see a complete snapshot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use signal_trade_core::Exchange;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Default instrument-master feed (Angel One scrip master).
pub const INSTRUMENT_FEED_URL: &str =
    "https://margincalculator.angelbroking.com/OpenAPI_File/files/OpenAPIScripMaster.json";

/// Default freshness window for the disk cache.
pub const CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// One tradeable instrument from the master feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub name: String,
    pub exchange: Exchange,
    pub token: String,
    pub instrument_type: String,
}

/// Errors from loading the instrument master.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("feed fetch failed: {0}")]
    Fetch(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("feed parse failed: {0}")]
    Parse(String),

    #[error("cache I/O failed: {0}")]
    Io(String),
}

impl From<reqwest::Error> for IndexError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Fetch(err.to_string())
        }
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Configuration for the instrument index.
#[derive(Debug, Clone)]
pub struct InstrumentIndexConfig {
    /// Feed URL for the full instrument master.
    pub feed_url: String,

    /// Disk cache location.
    pub cache_path: PathBuf,

    /// Cache freshness window in seconds.
    pub cache_ttl_secs: u64,

    /// Feed request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for InstrumentIndexConfig {
    fn default() -> Self {
        Self {
            feed_url: INSTRUMENT_FEED_URL.to_string(),
            cache_path: PathBuf::from("data/scripmaster.json"),
            cache_ttl_secs: CACHE_TTL_SECS,
            timeout_secs: 60,
        }
    }
}

impl InstrumentIndexConfig {
    /// Sets the feed URL (useful for testing).
    #[must_use]
    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = url.into();
        self
    }

    /// Sets the cache path.
    #[must_use]
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }
}

/// Raw record as the vendor feed serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawScrip {
    #[serde(default)]
    token: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    exch_seg: String,
    #[serde(default)]
    instrumenttype: String,
}

impl From<RawScrip> for Instrument {
    fn from(raw: RawScrip) -> Self {
        Self {
            symbol: raw.symbol,
            name: raw.name,
            exchange: Exchange::parse(&raw.exch_seg),
            token: raw.token,
            instrument_type: raw.instrumenttype,
        }
    }
}

/// One complete, immutable build of both lookup structures.
#[derive(Debug, Default)]
struct IndexSnapshot {
    /// `EXCHANGE:SYMBOL` and `EXCHANGE:NAME` -> position in `all`.
    by_key: HashMap<String, usize>,
    all: Vec<Instrument>,
}

impl IndexSnapshot {
    fn build(instruments: Vec<Instrument>) -> Self {
        let mut by_key = HashMap::with_capacity(instruments.len() * 2);
        for (i, inst) in instruments.iter().enumerate() {
            let symbol_key = format!("{}:{}", inst.exchange, inst.symbol.to_ascii_uppercase());
            by_key.insert(symbol_key, i);
            if !inst.name.is_empty() {
                let name_key = format!("{}:{}", inst.exchange, inst.name.to_ascii_uppercase());
                by_key.entry(name_key).or_insert(i);
            }
        }
        Self {
            by_key,
            all: instruments,
        }
    }

    fn lookup(&self, exchange: &Exchange, symbol: &str) -> Option<&Instrument> {
        let key = format!("{}:{}", exchange, symbol.to_ascii_uppercase());
        self.by_key.get(&key).map(|&i| &self.all[i])
    }
}

/// Resets the load-in-progress flag even when a load errors out.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The instrument index.
///
/// Readers keep working against the previous snapshot while a refresh is
/// building the next one. A concurrent duplicate load is refused with
/// `Ok(false)` rather than blocked: a duplicate download is wasteful but a
/// torn index would be worse.
pub struct InstrumentIndex {
    config: InstrumentIndexConfig,
    http: reqwest::Client,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    loaded: AtomicBool,
    loading: AtomicBool,
}

impl std::fmt::Debug for InstrumentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentIndex")
            .field("feed_url", &self.config.feed_url)
            .field("loaded", &self.loaded.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl InstrumentIndex {
    /// Creates an empty index that will load lazily.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: InstrumentIndexConfig) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IndexError::Fetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            loaded: AtomicBool::new(false),
            loading: AtomicBool::new(false),
        })
    }

    /// Builds a pre-loaded index directly from instruments, skipping feed
    /// and cache entirely. Used by tests and embedded fixtures.
    #[must_use]
    pub fn from_instruments(instruments: Vec<Instrument>) -> Self {
        let snapshot = IndexSnapshot::build(instruments);
        Self {
            config: InstrumentIndexConfig::default(),
            http: reqwest::Client::new(),
            snapshot: RwLock::new(Arc::new(snapshot)),
            loaded: AtomicBool::new(true),
            loading: AtomicBool::new(false),
        }
    }

    /// Whether a snapshot has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Number of instruments in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().all.len()
    }

    /// Whether the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads the instrument master.
    ///
    /// Returns `Ok(true)` when the index is loaded after the call, and
    /// `Ok(false)` when a concurrent load was already in flight (the caller
    /// sees the previous snapshot, not an error).
    ///
    /// # Errors
    /// Returns an error when both the cache and the feed are unusable.
    pub async fn load(&self, force_refresh: bool) -> Result<bool, IndexError> {
        if self.loaded.load(Ordering::Acquire) && !force_refresh {
            return Ok(true);
        }

        if self
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("instrument load already in progress, not refreshing");
            return Ok(false);
        }
        let _guard = LoadingGuard(&self.loading);

        let raw = match self.read_cache(force_refresh).await {
            Some(raw) => {
                tracing::info!(count = raw.len(), "loaded instruments from cache");
                raw
            }
            None => {
                let raw = self.fetch_feed().await?;
                tracing::info!(count = raw.len(), "downloaded instrument master");
                self.write_cache(&raw).await;
                raw
            }
        };

        let instruments: Vec<Instrument> = raw.into_iter().map(Instrument::from).collect();
        let next = Arc::new(IndexSnapshot::build(instruments));
        *self.snapshot.write() = next;
        self.loaded.store(true, Ordering::Release);
        Ok(true)
    }

    async fn read_cache(&self, force_refresh: bool) -> Option<Vec<RawScrip>> {
        if force_refresh {
            return None;
        }
        let path = &self.config.cache_path;
        let meta = tokio::fs::metadata(path).await.ok()?;
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())?;
        if age.as_secs() >= self.config.cache_ttl_secs {
            tracing::debug!(path = %path.display(), "instrument cache is stale");
            return None;
        }
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse instrument cache, refetching");
                None
            }
        }
    }

    async fn write_cache(&self, raw: &[RawScrip]) {
        let path = &self.config.cache_path;
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, "failed to create instrument cache directory");
                return;
            }
        }
        match serde_json::to_vec(raw) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(path, bytes).await {
                    tracing::warn!(error = %e, "failed to write instrument cache");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize instrument cache"),
        }
    }

    async fn fetch_feed(&self) -> Result<Vec<RawScrip>, IndexError> {
        let response = self.http.get(&self.config.feed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Fetch(format!(
                "feed returned HTTP {}",
                status.as_u16()
            )));
        }
        let raw: Vec<RawScrip> = response.json().await?;
        Ok(raw)
    }

    /// Triggers a load when nothing has been loaded yet. Failures are
    /// logged and swallowed so lookups degrade to the (empty) snapshot.
    async fn ensure_loaded(&self) {
        if self.loaded.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.load(false).await {
            tracing::warn!(error = %e, "instrument load failed, lookups will miss");
        }
    }

    /// Looks up an instrument token.
    ///
    /// Order: exact `EXCHANGE:SYMBOL`; for NSE, `SYMBOL-EQ`; then a linear
    /// scan matching the display name case-insensitively.
    pub async fn get_token(&self, symbol: &str, exchange: &Exchange) -> Option<String> {
        self.ensure_loaded().await;
        let snapshot = self.snapshot.read().clone();

        // Feed rows occasionally carry empty tokens; those are misses.
        let usable = |inst: &Instrument| {
            if inst.token.is_empty() {
                None
            } else {
                Some(inst.token.clone())
            }
        };

        if let Some(token) = snapshot.lookup(exchange, symbol).and_then(usable) {
            return Some(token);
        }

        if *exchange == Exchange::Nse {
            let suffixed = format!("{symbol}-EQ");
            if let Some(token) = snapshot.lookup(exchange, &suffixed).and_then(usable) {
                return Some(token);
            }
        }

        snapshot
            .all
            .iter()
            .find(|inst| inst.exchange == *exchange && inst.name.eq_ignore_ascii_case(symbol))
            .and_then(usable)
    }

    /// Fetches the full instrument record behind a token lookup.
    pub async fn get_instrument(&self, symbol: &str, exchange: &Exchange) -> Option<Instrument> {
        self.ensure_loaded().await;
        self.snapshot.read().lookup(exchange, symbol).cloned()
    }

    /// Case-insensitive substring search over symbol and display name,
    /// deduplicated by `(token, exchange)`, capped at `limit` results.
    pub async fn search(
        &self,
        query: &str,
        exchange: Option<&Exchange>,
        limit: usize,
    ) -> Vec<Instrument> {
        self.ensure_loaded().await;
        let snapshot = self.snapshot.read().clone();
        let query_upper = query.to_ascii_uppercase();

        let mut seen: HashSet<(String, Exchange)> = HashSet::new();
        let mut results = Vec::new();

        for inst in &snapshot.all {
            if results.len() >= limit {
                break;
            }
            if let Some(ex) = exchange {
                if inst.exchange != *ex {
                    continue;
                }
            }
            let matches = inst.symbol.to_ascii_uppercase().contains(&query_upper)
                || inst.name.to_ascii_uppercase().contains(&query_upper);
            if !matches {
                continue;
            }
            if seen.insert((inst.token.clone(), inst.exchange.clone())) {
                results.push(inst.clone());
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn inst(symbol: &str, name: &str, exchange: Exchange, token: &str) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            name: name.to_string(),
            exchange,
            token: token.to_string(),
            instrument_type: "EQ".to_string(),
        }
    }

    fn sample_index() -> InstrumentIndex {
        InstrumentIndex::from_instruments(vec![
            inst("RELIANCE-EQ", "RELIANCE INDUSTRIES LTD", Exchange::Nse, "2885"),
            inst("TCS-EQ", "TATA CONSULTANCY SERVICES", Exchange::Nse, "11536"),
            inst("RELIANCE", "RELIANCE INDUSTRIES LTD", Exchange::Bse, "500325"),
            inst(
                "NIFTY07AUG2525000CE",
                "NIFTY",
                Exchange::Nfo,
                "43834",
            ),
            inst(
                "NIFTY14AUG2525000CE",
                "NIFTY",
                Exchange::Nfo,
                "43921",
            ),
        ])
    }

    #[tokio::test]
    async fn exact_symbol_lookup_wins() {
        let index = sample_index();
        let token = index.get_token("RELIANCE-EQ", &Exchange::Nse).await;
        assert_eq!(token.as_deref(), Some("2885"));
    }

    #[tokio::test]
    async fn nse_lookup_retries_with_eq_suffix() {
        let index = sample_index();
        let token = index.get_token("RELIANCE", &Exchange::Nse).await;
        assert_eq!(token.as_deref(), Some("2885"));
    }

    #[tokio::test]
    async fn bse_lookup_does_not_append_suffix() {
        let index = sample_index();
        let token = index.get_token("RELIANCE", &Exchange::Bse).await;
        assert_eq!(token.as_deref(), Some("500325"));
    }

    #[tokio::test]
    async fn name_scan_is_the_last_resort() {
        let index = sample_index();
        let token = index
            .get_token("tata consultancy services", &Exchange::Nse)
            .await;
        assert_eq!(token.as_deref(), Some("11536"));
    }

    #[tokio::test]
    async fn missing_symbol_returns_none() {
        let index = sample_index();
        assert!(index.get_token("NOPE", &Exchange::Nse).await.is_none());
    }

    #[tokio::test]
    async fn search_matches_symbol_and_name_substrings() {
        let index = sample_index();
        let hits = index.search("reliance", None, 10).await;
        assert_eq!(hits.len(), 2);
        let hits = index.search("reliance", Some(&Exchange::Nse), 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].token, "2885");
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let index = sample_index();
        let hits = index.search("NIFTY", Some(&Exchange::Nfo), 1).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn search_dedupes_by_token_and_exchange() {
        let index = InstrumentIndex::from_instruments(vec![
            inst("SBIN-EQ", "STATE BANK OF INDIA", Exchange::Nse, "3045"),
            inst("SBIN-EQ", "STATE BANK OF INDIA", Exchange::Nse, "3045"),
        ]);
        let hits = index.search("SBIN", None, 10).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn every_searchable_instrument_has_an_exact_key() {
        let index = sample_index();
        for hit in index.search("", None, usize::MAX).await {
            let direct = index.get_instrument(&hit.symbol, &hit.exchange).await;
            assert_eq!(direct.as_ref(), Some(&hit), "missing exact key for {}", hit.symbol);
        }
    }

    #[tokio::test]
    async fn load_fetches_feed_and_populates_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scrips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"token": "2885", "symbol": "RELIANCE-EQ", "name": "RELIANCE INDUSTRIES LTD", "exch_seg": "NSE", "instrumenttype": ""},
                {"token": "11536", "symbol": "TCS-EQ", "name": "TATA CONSULTANCY SERVICES", "exch_seg": "NSE", "instrumenttype": ""}
            ])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = InstrumentIndexConfig::default()
            .with_feed_url(format!("{}/scrips", server.uri()))
            .with_cache_path(dir.path().join("scripmaster.json"));
        let index = InstrumentIndex::new(config).unwrap();

        assert!(index.load(false).await.unwrap());
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.get_token("RELIANCE-EQ", &Exchange::Nse).await.as_deref(),
            Some("2885")
        );
    }

    #[tokio::test]
    async fn load_writes_cache_and_second_index_reads_it() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scrips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"token": "3045", "symbol": "SBIN-EQ", "name": "STATE BANK OF INDIA", "exch_seg": "NSE", "instrumenttype": ""}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("scripmaster.json");

        let config = InstrumentIndexConfig::default()
            .with_feed_url(format!("{}/scrips", server.uri()))
            .with_cache_path(cache.clone());
        let first = InstrumentIndex::new(config.clone()).unwrap();
        assert!(first.load(false).await.unwrap());

        // Fresh index, same cache path: served from disk, no second fetch.
        let second = InstrumentIndex::new(config).unwrap();
        assert!(second.load(false).await.unwrap());
        assert_eq!(
            second.get_token("SBIN-EQ", &Exchange::Nse).await.as_deref(),
            Some("3045")
        );
    }

    #[tokio::test]
    async fn concurrent_load_is_refused_not_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scrips"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([]))
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = InstrumentIndexConfig::default()
            .with_feed_url(format!("{}/scrips", server.uri()))
            .with_cache_path(dir.path().join("scripmaster.json"));
        let index = Arc::new(InstrumentIndex::new(config).unwrap());

        let a = index.clone();
        let winner = tokio::spawn(async move { a.load(true).await.unwrap() });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let loser = index.load(true).await.unwrap();

        assert!(!loser, "second load should be refused while one is in flight");
        assert!(winner.await.unwrap());
    }

    #[tokio::test]
    async fn idempotent_load_yields_identical_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scrips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"token": "2885", "symbol": "RELIANCE-EQ", "name": "RELIANCE INDUSTRIES LTD", "exch_seg": "NSE", "instrumenttype": ""},
                {"token": "3045", "symbol": "SBIN-EQ", "name": "STATE BANK OF INDIA", "exch_seg": "NSE", "instrumenttype": ""}
            ])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = InstrumentIndexConfig::default()
            .with_feed_url(format!("{}/scrips", server.uri()))
            .with_cache_path(dir.path().join("scripmaster.json"));
        let index = InstrumentIndex::new(config).unwrap();

        assert!(index.load(true).await.unwrap());
        let before: Vec<Option<String>> = vec![
            index.get_token("RELIANCE-EQ", &Exchange::Nse).await,
            index.get_token("SBIN-EQ", &Exchange::Nse).await,
        ];
        assert!(index.load(true).await.unwrap());
        let after: Vec<Option<String>> = vec![
            index.get_token("RELIANCE-EQ", &Exchange::Nse).await,
            index.get_token("SBIN-EQ", &Exchange::Nse).await,
        ];
        assert_eq!(before, after);
    }
}
