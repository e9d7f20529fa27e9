//! Remote manifest pipeline: signed-manifest fetching, verification,
//! content-addressed artifact caching, and a cancellable refresh loop backed
//! by retry-with-backoff and a circuit breaker.
//!
//! Grounded on the teacher's `infra::cache::ImageBlobStore` (a thin typed
//! wrapper over `cacache`, content-addressed by key rather than source URL)
//! and its image-service retry loop, generalized here into the shared
//! `resilience::RetryPolicy`/`CircuitBreaker` primitives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use oneiric_model::{
    Candidate, DigestOutcome, ManifestEntry, OneiricError, RemoteManifest, RemoteStatus,
    RemoteSyncError, RemoteSyncErrorReason, RemoteSyncResult,
};

use crate::environment::Environment;
use crate::observability::{events, noop_metrics, SharedMetrics};
use crate::registry::Registry;
use crate::resilience::{CircuitBreaker, CircuitBreakerPolicy, RetryPolicy};
use crate::safety;

/// OS platform values a manifest entry's `os_platform` list is allowed to
/// name. An entry naming anything outside this set is a schema error and is
/// skipped rather than registered.
const ALLOWED_OS_PLATFORMS: &[&str] = &["linux", "macos", "windows", "any"];

pub mod artifact_store {
    //! A thin typed wrapper over `cacache`, keyed by content digest so cache
    //! reuse is independent of which source URL an artifact was fetched
    //! from. Mirrors the teacher's `ImageBlobStore` shape.

    use std::path::{Path, PathBuf};

    use cacache::Integrity;
    use oneiric_model::{OneiricError, RemoteSyncError, RemoteSyncErrorReason};

    /// Root directory `cacache` manages internally (index + content blobs),
    /// nested under the configured cache directory.
    #[derive(Clone, Debug)]
    pub struct ArtifactStore {
        root: PathBuf,
    }

    impl ArtifactStore {
        pub fn new(cache_dir: &Path) -> Self {
            Self { root: cache_dir.join("artifacts") }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        /// Write `bytes` under the content-digest key `sha256:<hex>`.
        pub async fn write(&self, digest_hex: &str, bytes: &[u8]) -> Result<Integrity, OneiricError> {
            cacache::write(&self.root, key_for(digest_hex), bytes)
                .await
                .map_err(|e| {
                    OneiricError::RemoteSync(RemoteSyncError::new(
                        RemoteSyncErrorReason::Network,
                        format!("artifact cache write failed: {e}"),
                    ))
                })
        }

        pub async fn read(&self, digest_hex: &str) -> Result<Vec<u8>, OneiricError> {
            cacache::read(&self.root, key_for(digest_hex)).await.map_err(|e| {
                OneiricError::RemoteSync(RemoteSyncError::new(
                    RemoteSyncErrorReason::Network,
                    format!("artifact cache read failed: {e}"),
                ))
            })
        }

        pub async fn contains(&self, digest_hex: &str) -> bool {
            cacache::metadata(&self.root, key_for(digest_hex)).await.ok().flatten().is_some()
        }
    }

    fn key_for(digest_hex: &str) -> String {
        format!("sha256:{digest_hex}")
    }
}

/// Tunables for one [`RemoteLoader`], mirroring `Settings.remote.*` in the
/// spec's external-interfaces section.
#[derive(Debug, Clone)]
pub struct RemoteLoaderConfig {
    pub http_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub breaker_policy: CircuitBreakerPolicy,
    pub require_signature: bool,
}

impl Default for RemoteLoaderConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::default(),
            breaker_policy: CircuitBreakerPolicy::default(),
            require_signature: false,
        }
    }
}

/// Fetches, verifies and registers candidates from a signed remote manifest.
/// Owns the circuit breaker so state (consecutive failures, open/half-open)
/// survives across refresh-loop iterations.
pub struct RemoteLoader {
    env: Environment,
    registry: Arc<Registry>,
    http: reqwest::Client,
    cache_dir: PathBuf,
    artifacts: artifact_store::ArtifactStore,
    config: RemoteLoaderConfig,
    breaker: CircuitBreaker,
    metrics: SharedMetrics,
    last_status: Mutex<Option<RemoteStatus>>,
}

impl RemoteLoader {
    pub fn new(env: Environment, registry: Arc<Registry>, cache_dir: PathBuf, config: RemoteLoaderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .expect("reqwest client configuration is always valid");
        Self {
            env,
            registry,
            http,
            artifacts: artifact_store::ArtifactStore::new(&cache_dir),
            cache_dir,
            breaker: CircuitBreaker::new(config.breaker_policy.clone()),
            config,
            metrics: noop_metrics(),
            last_status: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn last_status(&self) -> Option<RemoteStatus> {
        self.last_status.lock().clone()
    }

    /// Fetch, verify and register every entry in the manifest at `url`.
    pub async fn sync_remote_manifest(&self, url: &str) -> Result<RemoteSyncResult, OneiricError> {
        let started = Instant::now();
        let outcome = self.sync_inner(url).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut status = RemoteStatus {
            url: url.to_string(),
            last_attempt_at: Some(Utc::now()),
            last_error: None,
            duration_ms,
            per_domain_counts: BTreeMap::new(),
        };

        let outcome = match outcome {
            Ok(mut result) => {
                result.duration_ms = duration_ms;
                status.per_domain_counts = result.per_domain_counts.clone();
                events::remote_sync_succeeded(&result.source, result.registered, duration_ms, &self.metrics);
                Ok(result)
            }
            Err(err) => {
                status.last_error = Some(err.to_string());
                events::remote_sync_failed(url, &err.to_string(), &self.metrics);
                Err(err)
            }
        };
        *self.last_status.lock() = Some(status.clone());
        if let Err(err) = write_remote_status(&self.cache_dir.join("remote_status.json"), &status) {
            tracing::warn!(error = %err, "failed to persist remote_status.json");
        }
        outcome
    }

    async fn sync_inner(&self, url: &str) -> Result<RemoteSyncResult, OneiricError> {
        if !self.breaker.allow() {
            return Err(OneiricError::RemoteSync(RemoteSyncError::new(
                RemoteSyncErrorReason::Network,
                "circuit breaker open, short-circuiting remote fetch",
            )));
        }

        let bytes = match self.fetch_with_retry(url).await {
            Ok(bytes) => {
                self.breaker.record_success();
                bytes
            }
            Err(err) => {
                self.breaker.record_failure();
                if self.breaker.is_open() {
                    events::circuit_breaker_opened(url);
                }
                return Err(OneiricError::RemoteSync(err));
            }
        };

        let manifest = parse_manifest(&bytes)?;
        safety::verify_manifest(&manifest, &self.env.trusted_keys, self.config.require_signature)
            .map_err(OneiricError::RemoteSync)?;

        let mut per_domain_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut digest_outcomes = Vec::new();
        let mut registered = 0u64;
        let mut skipped_invalid = 0u64;

        for entry in &manifest.entries {
            if let Err(reason) = validate_entry_schema(entry) {
                tracing::warn!(domain = %entry.domain, key = %entry.key, reason, "skipping invalid manifest entry");
                skipped_invalid += 1;
                continue;
            }

            let digest_outcome = match self.verify_and_cache_artifact(entry).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(domain = %entry.domain, key = %entry.key, error = %err, "skipping entry with invalid artifact");
                    skipped_invalid += 1;
                    continue;
                }
            };
            digest_outcomes.push(digest_outcome);

            let candidate = entry_to_candidate(entry, &manifest.source)?;
            self.registry.register(candidate);
            registered += 1;
            *per_domain_counts.entry(entry.domain.clone()).or_insert(0) += 1;
        }

        Ok(RemoteSyncResult {
            source: manifest.source,
            registered,
            per_domain_counts,
            skipped_invalid,
            duration_ms: 0, // filled in by the caller, which times the whole sync
            digest_outcomes,
        })
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>, RemoteSyncError> {
        let client = &self.http;
        self.config
            .retry_policy
            .run(
                || fetch_bytes(client, url),
                |err: &RemoteSyncError| err.reason == RemoteSyncErrorReason::Network,
            )
            .await
    }

    async fn verify_and_cache_artifact(&self, entry: &ManifestEntry) -> Result<DigestOutcome, OneiricError> {
        let Some(uri) = entry.uri.as_deref() else {
            return Ok(DigestOutcome::NotApplicable);
        };
        safety::validate_artifact_uri(&self.cache_dir, uri)?;

        let bytes = fetch_bytes(&self.http, uri).await.map_err(OneiricError::RemoteSync)?;
        let computed = hex::encode(Sha256::digest(&bytes));

        let outcome = match entry.sha256.as_deref() {
            Some(expected) if expected.eq_ignore_ascii_case(&computed) => DigestOutcome::Matched,
            Some(_) => {
                return Err(OneiricError::RemoteSync(RemoteSyncError::new(
                    RemoteSyncErrorReason::Digest,
                    format!("digest mismatch for artifact at {uri}"),
                )))
            }
            None => DigestOutcome::NotApplicable,
        };

        self.artifacts.write(&computed, &bytes).await?;
        Ok(outcome)
    }
}

/// Persist the last remote sync telemetry to `remote_status.json` under
/// `cache_dir`, via the same temp-file-then-rename pattern the lifecycle and
/// health-snapshot persistence use.
fn write_remote_status(path: &std::path::Path, status: &RemoteStatus) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(status).map_err(std::io::Error::other)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, RemoteSyncError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| RemoteSyncError::new(RemoteSyncErrorReason::Network, e.to_string()))?;
    if !response.status().is_success() {
        return Err(RemoteSyncError::new(
            RemoteSyncErrorReason::Network,
            format!("unexpected status {}", response.status()),
        ));
    }
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| RemoteSyncError::new(RemoteSyncErrorReason::Network, e.to_string()))
}

/// Parse a manifest document as JSON, falling back to YAML. Both are
/// accepted per the spec's wire-format section.
fn parse_manifest(bytes: &[u8]) -> Result<RemoteManifest, OneiricError> {
    if let Ok(manifest) = serde_json::from_slice::<RemoteManifest>(bytes) {
        return Ok(manifest);
    }
    serde_yaml::from_slice::<RemoteManifest>(bytes)
        .map_err(|e| OneiricError::RemoteSync(RemoteSyncError::new(RemoteSyncErrorReason::Parse, e.to_string())))
}

/// Per-entry schema checks beyond what `serde` already enforces on required
/// string fields: well-formed digest, non-empty version, recognized OS
/// platform values.
fn validate_entry_schema(entry: &ManifestEntry) -> Result<(), &'static str> {
    if entry.domain.trim().is_empty() || entry.key.trim().is_empty() || entry.provider.trim().is_empty() || entry.factory.trim().is_empty()
    {
        return Err("missing required field");
    }
    if !entry.has_well_formed_digest() {
        return Err("malformed sha256 digest");
    }
    if let Some(version) = &entry.version {
        if version.trim().is_empty() {
            return Err("empty version string");
        }
    }
    if entry
        .metadata
        .os_platform
        .iter()
        .any(|os| !ALLOWED_OS_PLATFORMS.contains(&os.as_str()))
    {
        return Err("unsupported os_platform value");
    }
    Ok(())
}

fn entry_to_candidate(entry: &ManifestEntry, source: &str) -> Result<Candidate, OneiricError> {
    let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    let manifest_metadata_value = serde_json::to_value(&entry.metadata)
        .map_err(|e| OneiricError::RemoteSync(RemoteSyncError::new(RemoteSyncErrorReason::Schema, e.to_string())))?;
    metadata.insert("manifest_metadata".to_string(), manifest_metadata_value);
    if let Some(uri) = &entry.uri {
        metadata.insert("uri".to_string(), serde_json::Value::String(uri.clone()));
    }
    if let Some(sha256) = &entry.sha256 {
        metadata.insert("sha256".to_string(), serde_json::Value::String(sha256.clone()));
    }
    metadata.insert("manifest_source".to_string(), serde_json::Value::String(source.to_string()));

    Ok(Candidate {
        domain: entry.domain.clone(),
        key: entry.key.clone(),
        provider: entry.provider.clone(),
        factory: entry.factory.clone(),
        stack_level: entry.stack_level.unwrap_or(0),
        priority: entry.priority.unwrap_or(0),
        sequence: 0,
        source: "remote".to_string(),
        version: entry.version.clone(),
        metadata,
    })
}

/// Observer notified after every refresh-loop iteration, success or
/// failure. The runtime orchestrator implements this to update its health
/// snapshot; tests can implement it to assert on iteration outcomes.
#[async_trait]
pub trait RefreshObserver: Send + Sync {
    async fn on_iteration(&self, result: &Result<RemoteSyncResult, OneiricError>);
}

struct RunningTask {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

/// Background task that repeats `sync_remote_manifest` on `refresh_interval`,
/// skipping a tick if the previous sync is still in flight, never crashing
/// the loop on a sync failure, and honoring cancellation on `stop`.
pub struct RefreshLoop {
    loader: Arc<RemoteLoader>,
    url: String,
    interval: Duration,
    observer: Arc<dyn RefreshObserver>,
    busy: Arc<std::sync::atomic::AtomicBool>,
    running: Mutex<Option<RunningTask>>,
}

impl RefreshLoop {
    pub fn new(loader: Arc<RemoteLoader>, url: impl Into<String>, interval: Duration, observer: Arc<dyn RefreshObserver>) -> Self {
        Self {
            loader,
            url: url.into(),
            interval,
            observer,
            busy: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            anyhow::bail!("refresh loop already running");
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => this.run_once().await,
                }
            }
        });
        *running = Some(RunningTask { handle, cancel });
        Ok(())
    }

    pub async fn stop(&self) {
        let task = self.running.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    /// One refresh cycle: skipped entirely if the previous call is still
    /// running (used directly by tests, and by the polling task above).
    pub async fn run_once(&self) {
        if self.busy.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let result = self.loader.sync_remote_manifest(&self.url).await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, url = %self.url, "remote refresh iteration failed, loop continues");
        }
        self.observer.on_iteration(&result).await;
        self.busy.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spawns a minimal raw-HTTP server on localhost that serves `body` for
    /// the first `fail_count` requests with a 500 status, then 200s with the
    /// signed manifest body. Returns the bound address.
    async fn spawn_manifest_server(body: Arc<str>, fail_count: Arc<AtomicU32>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let body = Arc::clone(&body);
                let fail_count = Arc::clone(&fail_count);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let remaining = fail_count.load(Ordering::SeqCst);
                    let response = if remaining > 0 {
                        fail_count.fetch_sub(1, Ordering::SeqCst);
                        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    } else {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn unsigned_manifest_json() -> String {
        serde_json::json!({
            "source": "test-source",
            "entries": [
                {
                    "domain": "adapter",
                    "key": "cache",
                    "provider": "redis",
                    "factory": "factories.redis",
                    "stack_level": 10
                },
                {
                    "domain": "service",
                    "key": "status",
                    "provider": "v2",
                    "factory": "factories.status"
                }
            ],
            "signature_algorithm": "ed25519"
        })
        .to_string()
    }

    #[tokio::test]
    async fn sync_registers_every_entry_and_reports_per_domain_counts() {
        let addr = spawn_manifest_server(Arc::from(unsigned_manifest_json()), Arc::new(AtomicU32::new(0))).await;
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let loader = RemoteLoader::new(env, Arc::clone(&registry), dir.path().to_path_buf(), RemoteLoaderConfig::default());

        let result = loader.sync_remote_manifest(&format!("http://{addr}/manifest.json")).await.unwrap();
        assert_eq!(result.registered, 2);
        assert_eq!(result.per_domain_counts.get("adapter"), Some(&1));
        assert_eq!(result.per_domain_counts.get("service"), Some(&1));
        assert_eq!(registry.resolve("adapter", "cache", None).unwrap().provider, "redis");

        let status_path = dir.path().join("remote_status.json");
        assert!(status_path.exists());
        let persisted: RemoteStatus = serde_json::from_slice(&std::fs::read(&status_path).unwrap()).unwrap();
        assert_eq!(persisted.per_domain_counts.get("adapter"), Some(&1));
        assert!(persisted.last_error.is_none());
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let fail_count = Arc::new(AtomicU32::new(2));
        let addr = spawn_manifest_server(Arc::from(unsigned_manifest_json()), Arc::clone(&fail_count)).await;
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let mut config = RemoteLoaderConfig::default();
        config.retry_policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let loader = RemoteLoader::new(env, registry, dir.path().to_path_buf(), config);

        let result = loader.sync_remote_manifest(&format!("http://{addr}/manifest.json")).await.unwrap();
        assert_eq!(result.registered, 2);
        assert_eq!(fail_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sustained_failures_open_the_breaker_and_short_circuit() {
        let addr = spawn_manifest_server(Arc::from(unsigned_manifest_json()), Arc::new(AtomicU32::new(1_000_000))).await;
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let mut config = RemoteLoaderConfig::default();
        config.retry_policy = RetryPolicy { attempts: 1, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1), jitter: false };
        config.breaker_policy = CircuitBreakerPolicy { failure_threshold: 2, reset_timeout: Duration::from_secs(60) };
        let loader = Arc::new(RemoteLoader::new(env, registry, dir.path().to_path_buf(), config));

        let url = format!("http://{addr}/manifest.json");
        assert!(loader.sync_remote_manifest(&url).await.is_err());
        assert!(loader.sync_remote_manifest(&url).await.is_err());
        assert!(loader.breaker.is_open());

        // A third call should short-circuit without hitting the network;
        // the error message reflects that rather than a fresh network error.
        let err = loader.sync_remote_manifest(&url).await.unwrap_err();
        assert!(err.to_string().contains("circuit breaker"));
    }

    #[test]
    fn entry_missing_required_field_is_rejected() {
        let mut entry = sample_entry();
        entry.provider.clear();
        assert!(validate_entry_schema(&entry).is_err());
    }

    #[test]
    fn entry_with_malformed_digest_is_rejected() {
        let mut entry = sample_entry();
        entry.sha256 = Some("not-hex".to_string());
        assert!(validate_entry_schema(&entry).is_err());
    }

    #[test]
    fn entry_with_unsupported_os_platform_is_rejected() {
        let mut entry = sample_entry();
        entry.metadata.os_platform = vec!["amiga".to_string()];
        assert!(validate_entry_schema(&entry).is_err());
    }

    fn sample_entry() -> ManifestEntry {
        ManifestEntry {
            domain: "adapter".into(),
            key: "cache".into(),
            provider: "redis".into(),
            factory: "factories.redis".into(),
            uri: None,
            sha256: None,
            stack_level: Some(10),
            priority: None,
            version: None,
            metadata: Default::default(),
        }
    }
}
