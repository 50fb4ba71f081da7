//! Two-tier session storage plus the debounced writer in front of it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use layerfit_contracts::events::now_utc_iso;
use layerfit_contracts::session::SessionState;
use layerfit_contracts::store::{state_key, LocalCache};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{to_blob, SessionCodec, StoredSession};
use crate::provider::non_empty_env;

pub const DEFAULT_REMOTE_TABLE: &str = "sessions";

/// Durable key/value tier keyed by session.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;
    async fn upsert(&self, session_key: &str, blob: &str) -> Result<()>;
    async fn get(&self, session_key: &str) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserts received so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, session_key: &str, blob: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        entries.insert(session_key.to_string(), blob.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, session_key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(entries.get(session_key).cloned())
    }
}

/// One JSON file per session under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        let safe: String = session_key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    fn name(&self) -> &str {
        "directory"
    }

    async fn upsert(&self, session_key: &str, blob: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.path_for(session_key);
        tokio::fs::write(&path, blob)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, session_key: &str) -> Result<Option<String>> {
        let path = self.path_for(session_key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(anyhow::Error::new(err).context(format!("failed to read {}", path.display())))
            }
        }
    }
}

/// PostgREST-compatible table store: rows of `session_id`, `state_data`
/// and `updated_at`, upserted on `session_id`.
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    table: String,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            api_key,
            table: DEFAULT_REMOTE_TABLE.to_string(),
        }
    }

    /// Reads `LAYERFIT_REMOTE_URL` and `LAYERFIT_REMOTE_KEY`.
    pub fn from_env() -> Option<Self> {
        let base_url = non_empty_env("LAYERFIT_REMOTE_URL")?;
        Some(Self::new(base_url, non_empty_env("LAYERFIT_REMOTE_KEY")))
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => builder
                .header("apikey", key)
                .header(AUTHORIZATION, format!("Bearer {key}")),
            None => builder,
        }
    }

    fn row_state(row: &Value) -> Option<String> {
        match row.get("state_data")? {
            Value::Null => None,
            Value::String(raw) => Some(raw.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    fn name(&self) -> &str {
        "rest"
    }

    async fn upsert(&self, session_key: &str, blob: &str) -> Result<()> {
        let state_data: Value =
            serde_json::from_str(blob).unwrap_or_else(|_| Value::String(blob.to_string()));
        let body = json!([{
            "session_id": session_key,
            "state_data": state_data,
            "updated_at": now_utc_iso(),
        }]);
        let response = self
            .authorized(self.http.post(self.endpoint()))
            .query(&[("on_conflict", "session_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("session upsert failed ({})", self.endpoint()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("session upsert failed ({}): {}", status.as_u16(), text.trim());
        }
        Ok(())
    }

    async fn get(&self, session_key: &str) -> Result<Option<String>> {
        let response = self
            .authorized(self.http.get(self.endpoint()))
            .query(&[
                ("session_id", format!("eq.{session_key}")),
                ("select", "state_data".to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("session lookup failed ({})", self.endpoint()))?;
        let status = response.status();
        if !status.is_success() {
            bail!("session lookup failed ({})", status.as_u16());
        }
        let rows: Value = response
            .json()
            .await
            .context("session lookup returned invalid JSON")?;
        Ok(rows
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Self::row_state))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    Written,
    Skipped(String),
    Failed(String),
}

impl TierOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TierOutcome::Failed(_))
    }
}

/// What happened to one write on each tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub bytes: usize,
    pub cache: TierOutcome,
    pub remote: TierOutcome,
}

impl PersistReport {
    fn unchanged() -> Self {
        Self {
            bytes: 0,
            cache: TierOutcome::Skipped("unchanged".to_string()),
            remote: TierOutcome::Skipped("unchanged".to_string()),
        }
    }

    pub fn written_any(&self) -> bool {
        self.cache == TierOutcome::Written || self.remote == TierOutcome::Written
    }

    pub fn has_failure(&self) -> bool {
        self.cache.is_failed() || self.remote.is_failed()
    }
}

pub struct PersistenceGateway {
    cache: Arc<dyn LocalCache>,
    remote: Option<Arc<dyn RemoteStore>>,
    session_key: String,
    cache_ceiling: usize,
}

impl PersistenceGateway {
    pub fn new(
        cache: Arc<dyn LocalCache>,
        remote: Option<Arc<dyn RemoteStore>>,
        session_key: impl Into<String>,
        cache_ceiling: usize,
    ) -> Self {
        Self {
            cache,
            remote,
            session_key: session_key.into(),
            cache_ceiling,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Writes both tiers independently. Never fails; the report says what
    /// each tier did.
    pub async fn write(&self, blob: &str) -> PersistReport {
        let key = state_key(&self.session_key);
        let cache = if blob.len() > self.cache_ceiling {
            self.evict_stale(&key);
            TierOutcome::Skipped(format!(
                "{} bytes exceeds the {} byte cache ceiling",
                blob.len(),
                self.cache_ceiling
            ))
        } else {
            match self.cache.set(&key, blob) {
                Ok(()) => TierOutcome::Written,
                Err(err) => {
                    self.evict_stale(&key);
                    TierOutcome::Failed(err.to_string())
                }
            }
        };

        let remote = match self.remote.as_ref() {
            None => TierOutcome::Skipped("no durable store configured".to_string()),
            Some(store) => match store.upsert(&self.session_key, blob).await {
                Ok(()) => TierOutcome::Written,
                Err(err) => TierOutcome::Failed(format!("{err:#}")),
            },
        };

        let report = PersistReport {
            bytes: blob.len(),
            cache,
            remote,
        };
        if report.has_failure() {
            tracing::warn!(cache = ?report.cache, remote = ?report.remote, "session persist incomplete");
        } else {
            tracing::debug!(bytes = report.bytes, "session persisted");
        }
        report
    }

    /// A cache entry that missed the latest write must not shadow the
    /// durable copy on read.
    fn evict_stale(&self, key: &str) {
        if let Err(err) = self.cache.remove(key) {
            tracing::warn!(error = %err, "stale cache entry not removed");
        }
    }

    /// Cache first; an absent or unreadable entry falls through to the
    /// durable store. `Ok(None)` means nothing was saved.
    pub async fn read(&self) -> Result<Option<StoredSession>> {
        if let Some(raw) = self.cache.get(&state_key(&self.session_key)) {
            match StoredSession::from_json(&raw) {
                Ok(stored) => return Ok(Some(stored)),
                Err(err) => tracing::warn!(error = %err, "cached session unreadable; trying durable store"),
            }
        }
        let Some(store) = self.remote.as_ref() else {
            return Ok(None);
        };
        let Some(raw) = store
            .get(&self.session_key)
            .await
            .with_context(|| format!("{} store read failed", store.name()))?
        else {
            return Ok(None);
        };
        match StoredSession::from_json(&raw) {
            Ok(stored) => Ok(Some(stored)),
            Err(err) => {
                tracing::warn!(error = %err, "durable session unreadable");
                Ok(None)
            }
        }
    }
}

enum PersistCommand {
    Save(Box<SessionState>),
    Flush(oneshot::Sender<Option<PersistReport>>),
}

/// Debounced single writer. Each save replaces the pending snapshot and
/// restarts the quiet period; the write happens once the period passes
/// without another save.
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
    worker: JoinHandle<()>,
}

impl Persister {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(codec: SessionCodec, gateway: Arc<PersistenceGateway>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PersistWorker {
            codec,
            gateway,
            last_digest: None,
        };
        let worker = tokio::spawn(worker.run(rx, delay));
        Self { tx, worker }
    }

    pub fn save(&self, state: &SessionState) {
        if self
            .tx
            .send(PersistCommand::Save(Box::new(state.clone())))
            .is_err()
        {
            tracing::warn!("persist worker stopped; snapshot dropped");
        }
    }

    /// Writes any pending snapshot now and waits for it. `None` when
    /// nothing was pending.
    pub async fn flush(&self) -> Option<PersistReport> {
        let (reply, response) = oneshot::channel();
        self.tx.send(PersistCommand::Flush(reply)).ok()?;
        response.await.ok().flatten()
    }

    /// Stops the worker after writing the last pending snapshot.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            tracing::warn!(error = %err, "persist worker ended abnormally");
        }
    }
}

struct PersistWorker {
    codec: SessionCodec,
    gateway: Arc<PersistenceGateway>,
    last_digest: Option<String>,
}

impl PersistWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PersistCommand>, delay: Duration) {
        let mut pending: Option<Box<SessionState>> = None;
        loop {
            let command = if pending.is_some() {
                match tokio::time::timeout(delay, rx.recv()).await {
                    Ok(command) => command,
                    Err(_) => {
                        if let Some(state) = pending.take() {
                            self.write(&state).await;
                        }
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            match command {
                Some(PersistCommand::Save(state)) => pending = Some(state),
                Some(PersistCommand::Flush(reply)) => {
                    let report = match pending.take() {
                        Some(state) => Some(self.write(&state).await),
                        None => None,
                    };
                    let _ = reply.send(report);
                }
                None => {
                    if let Some(state) = pending.take() {
                        self.write(&state).await;
                    }
                    break;
                }
            }
        }
    }

    async fn write(&mut self, state: &SessionState) -> PersistReport {
        let stored = self.codec.encode(state).await;
        let digest = match stored.to_json() {
            Ok(json) => hex::encode(Sha256::digest(json.as_bytes())),
            Err(err) => return failed_report(err.to_string()),
        };
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            tracing::debug!("session unchanged since last write");
            return PersistReport::unchanged();
        }
        let blob = match to_blob(stored) {
            Ok(blob) => blob,
            Err(err) => return failed_report(err.to_string()),
        };
        let report = self.gateway.write(&blob).await;
        // A partial failure leaves the tiers out of step; nothing is skipped
        // until a write lands everywhere.
        self.last_digest = if report.has_failure() {
            None
        } else {
            Some(digest)
        };
        report
    }
}

fn failed_report(reason: String) -> PersistReport {
    tracing::warn!(%reason, "session could not be serialized");
    PersistReport {
        bytes: 0,
        cache: TierOutcome::Failed(reason.clone()),
        remote: TierOutcome::Failed(reason),
    }
}

#[cfg(test)]
mod tests {
    use layerfit_contracts::image::HandleStore;
    use layerfit_contracts::store::{CacheError, MemoryCache};

    use super::*;
    use crate::codec::CompressionBounds;
    use crate::testing::MapFetcher;

    struct BrokenStore;

    #[async_trait]
    impl RemoteStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }

        async fn upsert(&self, _session_key: &str, _blob: &str) -> Result<()> {
            bail!("connection refused")
        }

        async fn get(&self, _session_key: &str) -> Result<Option<String>> {
            bail!("connection refused")
        }
    }

    struct BrokenCache;

    impl LocalCache for BrokenCache {
        fn set(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
            Err(CacheError::QuotaExceeded {
                needed: 1,
                quota: 0,
            })
        }

        fn get(&self, _key: &str) -> Option<String> {
            None
        }

        fn remove(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }
    }

    /// Memory cache whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyCache {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl LocalCache for FlakyCache {
        fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Io("disk full".to_string()));
            }
            self.inner.set(key, value)
        }

        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn remove(&self, key: &str) -> Result<(), CacheError> {
            self.inner.remove(key)
        }
    }

    fn blob(prompt: &str) -> String {
        StoredSession {
            prompt: prompt.to_string(),
            ..StoredSession::default()
        }
        .to_json()
        .unwrap_or_default()
    }

    fn codec() -> SessionCodec {
        SessionCodec::new(
            HandleStore::new(),
            Arc::new(MapFetcher::default()),
            CompressionBounds::default(),
        )
    }

    fn state(prompt: &str) -> SessionState {
        SessionState {
            prompt: prompt.to_string(),
            ..SessionState::default()
        }
    }

    #[tokio::test]
    async fn oversized_blob_skips_cache_but_reaches_remote() -> anyhow::Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(cache.clone(), Some(store.clone()), "s1", 64);

        let small = gateway.write(r#"{"prompt":"a"}"#).await;
        assert_eq!(small.cache, TierOutcome::Written);

        let large = blob(&"x".repeat(200));
        let report = gateway.write(&large).await;
        assert!(matches!(report.cache, TierOutcome::Skipped(_)));
        assert_eq!(report.remote, TierOutcome::Written);
        assert!(cache.get(&state_key("s1")).is_none());

        let read = gateway.read().await?;
        assert_eq!(read.map(|stored| stored.prompt.len()), Some(200));
        Ok(())
    }

    #[tokio::test]
    async fn read_prefers_cache_then_falls_back() -> anyhow::Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let gateway =
            PersistenceGateway::new(cache.clone(), Some(store.clone()), "s1", 1024 * 1024);

        assert!(gateway.read().await?.is_none());

        store.upsert("s1", &blob("remote")).await?;
        cache.set(&state_key("s1"), &blob("cached"))?;
        assert_eq!(gateway.read().await?.map(|s| s.prompt), Some("cached".to_string()));

        cache.set(&state_key("s1"), "{truncated")?;
        assert_eq!(gateway.read().await?.map(|s| s.prompt), Some("remote".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn one_failing_tier_does_not_block_the_other() -> anyhow::Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let gateway =
            PersistenceGateway::new(cache.clone(), Some(Arc::new(BrokenStore)), "s1", 1024);
        let report = gateway.write(&blob("a")).await;
        assert_eq!(report.cache, TierOutcome::Written);
        assert!(report.remote.is_failed());

        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(Arc::new(BrokenCache), Some(store.clone()), "s1", 1024);
        let report = gateway.write(&blob("b")).await;
        assert!(report.cache.is_failed());
        assert_eq!(report.remote, TierOutcome::Written);
        assert_eq!(store.writes(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cache_quota_failure_does_not_leave_older_state_readable() -> anyhow::Result<()> {
        let cache = Arc::new(MemoryCache::with_quota(600));
        let store = Arc::new(MemoryStore::new());
        let gateway =
            PersistenceGateway::new(cache.clone(), Some(store.clone()), "s1", 1024 * 1024);

        let first = gateway.write(&blob("old")).await;
        assert_eq!(first.cache, TierOutcome::Written);

        let report = gateway.write(&blob(&"n".repeat(500))).await;
        assert!(matches!(report.cache, TierOutcome::Failed(_)));
        assert_eq!(report.remote, TierOutcome::Written);
        assert!(cache.get(&state_key("s1")).is_none());

        let read = gateway.read().await?;
        assert_eq!(read.map(|stored| stored.prompt.len()), Some(500));
        Ok(())
    }

    #[tokio::test]
    async fn both_tiers_failing_is_reported_not_raised() {
        let gateway =
            PersistenceGateway::new(Arc::new(BrokenCache), Some(Arc::new(BrokenStore)), "s1", 1024);
        let report = gateway.write(&blob("a")).await;
        assert!(!report.written_any());
        assert!(report.has_failure());
    }

    #[tokio::test]
    async fn directory_store_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DirectoryStore::new(temp.path().join("sessions"));
        assert_eq!(store.get("session_abc").await?, None);
        store.upsert("session_abc", "{}").await?;
        store.upsert("session_abc", r#"{"prompt":"x"}"#).await?;
        assert_eq!(
            store.get("session_abc").await?.as_deref(),
            Some(r#"{"prompt":"x"}"#)
        );
        assert!(temp.path().join("sessions").join("session_abc.json").exists());
        Ok(())
    }

    #[test]
    fn rest_rows_accept_object_or_string_state() {
        assert_eq!(
            RestStore::row_state(&json!({ "state_data": { "prompt": "a" } })).as_deref(),
            Some(r#"{"prompt":"a"}"#)
        );
        assert_eq!(
            RestStore::row_state(&json!({ "state_data": "{}" })).as_deref(),
            Some("{}")
        );
        assert_eq!(RestStore::row_state(&json!({ "state_data": null })), None);
    }

    #[test]
    fn rest_endpoint_targets_table() {
        let store = RestStore::new("https://db.example.com/", None).with_table("fitting_states");
        assert_eq!(store.endpoint(), "https://db.example.com/rest/v1/fitting_states");
    }

    #[tokio::test(start_paused = true)]
    async fn saves_coalesce_into_one_trailing_write() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(PersistenceGateway::new(
            Arc::new(MemoryCache::new()),
            Some(store.clone()),
            "s1",
            1024 * 1024,
        ));
        let persister = Persister::spawn(codec(), gateway.clone(), Duration::from_secs(1));

        persister.save(&state("a"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        persister.save(&state("b"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        persister.save(&state("c"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.writes(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.writes(), 1);
        assert_eq!(gateway.read().await?.map(|s| s.prompt), Some("c".to_string()));

        persister.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn flush_writes_pending_snapshot_and_skips_identical() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(PersistenceGateway::new(
            Arc::new(MemoryCache::new()),
            Some(store.clone()),
            "s1",
            1024 * 1024,
        ));
        let persister = Persister::spawn(codec(), gateway, Duration::from_secs(60));

        assert_eq!(persister.flush().await, None);

        persister.save(&state("a"));
        let report = persister.flush().await;
        assert_eq!(report.map(|r| r.remote), Some(TierOutcome::Written));

        persister.save(&state("a"));
        let report = persister.flush().await;
        assert_eq!(report, Some(PersistReport::unchanged()));
        assert_eq!(store.writes(), 1);

        persister.shutdown().await;
    }

    #[tokio::test]
    async fn returning_to_earlier_state_after_a_failed_tier_is_written() -> anyhow::Result<()> {
        let cache = Arc::new(FlakyCache::default());
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(PersistenceGateway::new(
            cache.clone(),
            Some(store.clone()),
            "s1",
            1024 * 1024,
        ));
        let persister = Persister::spawn(codec(), gateway.clone(), Duration::from_secs(60));

        persister.save(&state("a"));
        assert_eq!(persister.flush().await.map(|r| r.cache), Some(TierOutcome::Written));

        cache.set_failing(true);
        persister.save(&state("b"));
        let report = persister.flush().await;
        assert!(report.is_some_and(|r| r.cache.is_failed()));

        cache.set_failing(false);
        persister.save(&state("a"));
        let report = persister.flush().await;
        assert_eq!(
            report.map(|r| (r.cache, r.remote)),
            Some((TierOutcome::Written, TierOutcome::Written))
        );
        assert_eq!(store.writes(), 3);
        assert_eq!(gateway.read().await?.map(|s| s.prompt), Some("a".to_string()));

        persister.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_writes_last_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(PersistenceGateway::new(
            Arc::new(MemoryCache::new()),
            Some(store.clone()),
            "s1",
            1024 * 1024,
        ));
        let persister = Persister::spawn(codec(), gateway, Duration::from_secs(60));
        persister.save(&state("last"));
        persister.shutdown().await;
        assert_eq!(store.writes(), 1);
    }
}
