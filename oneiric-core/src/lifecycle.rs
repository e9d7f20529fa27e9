//! Health-checked hot-swap lifecycle management with rollback.
//!
//! Grounded on the teacher's atomic persistence pattern (serialize, write to
//! a sibling temp file, rename into place) and its scan orchestration's
//! shielded-completion idiom for long-running operations that must not be
//! left half finished by caller cancellation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use oneiric_model::{
    Candidate, LifecycleError, LifecycleErrorReason, LifecycleState, LifecycleStatus, OneiricError,
};
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::environment::Environment;
use crate::factory::{ActivationContext, Cleanup, Factory, FactoryRegistry, HealthCheck, Instance};
use crate::observability::{events, noop_metrics, SharedMetrics};
use crate::registry::Registry;
use crate::safety;

/// Timeout budget for each operation class the lifecycle manager performs.
#[derive(Debug, Clone)]
pub struct LifecycleTimeouts {
    pub activation_timeout: Duration,
    pub health_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub hook_timeout: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
pub trait PreSwapHook: Send + Sync {
    async fn call(&self, domain: &str, key: &str, candidate: &Candidate) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PostSwapHook: Send + Sync {
    async fn call(&self, domain: &str, key: &str, candidate: &Candidate) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn call(&self, domain: &str, key: &str) -> anyhow::Result<()>;
}

struct ActiveBinding {
    provider: String,
    instance: Instance,
    health: Option<Arc<dyn HealthCheck>>,
    cleanup: Option<Arc<dyn Cleanup>>,
}

/// Activates, health-checks, hot-swaps and rolls back provider instances for
/// every (domain, key) pair across all domain bridges in the process.
pub struct LifecycleManager {
    env: Environment,
    registry: Arc<Registry>,
    factories: Arc<FactoryRegistry>,
    timeouts: LifecycleTimeouts,
    status_path: Option<PathBuf>,
    active: DashMap<(String, String), ActiveBinding>,
    status: DashMap<(String, String), LifecycleStatus>,
    pre_hooks: RwLock<Vec<Arc<dyn PreSwapHook>>>,
    post_hooks: RwLock<Vec<Arc<dyn PostSwapHook>>>,
    cleanup_hooks: RwLock<Vec<Arc<dyn CleanupHook>>>,
    metrics: SharedMetrics,
}

impl LifecycleManager {
    pub fn new(
        env: Environment,
        registry: Arc<Registry>,
        factories: Arc<FactoryRegistry>,
        timeouts: LifecycleTimeouts,
        status_path: Option<PathBuf>,
    ) -> Self {
        let status = match status_path.as_deref() {
            Some(path) => load_status_table(path),
            None => DashMap::new(),
        };
        Self {
            env,
            registry,
            factories,
            timeouts,
            status_path,
            active: DashMap::new(),
            status,
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
            cleanup_hooks: RwLock::new(Vec::new()),
            metrics: noop_metrics(),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn add_pre_swap_hook(&self, hook: Arc<dyn PreSwapHook>) {
        self.pre_hooks.write().push(hook);
    }

    pub fn add_post_swap_hook(&self, hook: Arc<dyn PostSwapHook>) {
        self.post_hooks.write().push(hook);
    }

    pub fn add_cleanup_hook(&self, hook: Arc<dyn CleanupHook>) {
        self.cleanup_hooks.write().push(hook);
    }

    pub fn get_instance(&self, domain: &str, key: &str) -> Option<Instance> {
        self.active
            .get(&(domain.to_string(), key.to_string()))
            .map(|b| Arc::clone(&b.instance))
    }

    pub fn get_status(&self, domain: &str, key: &str) -> Option<LifecycleStatus> {
        self.status.get(&(domain.to_string(), key.to_string())).map(|s| s.clone())
    }

    /// Every tracked (domain, key) status, for health-snapshot reporting.
    pub fn all_statuses(&self) -> Vec<LifecycleStatus> {
        self.status.iter().map(|e| e.value().clone()).collect()
    }

    /// Run the active instance's health check, if any. `None` means no
    /// active instance is bound; `Some(true)` covers both a passing check
    /// and the absence of a health capability.
    pub async fn probe_health(&self, domain: &str, key: &str) -> Option<bool> {
        let binding = self.active.get(&(domain.to_string(), key.to_string()))?;
        let health = binding.health.clone();
        drop(binding);
        match health {
            None => Some(true),
            Some(check) => {
                let timeout = self.timeouts.health_timeout;
                match tokio::time::timeout(timeout, check.check_health()).await {
                    Ok(healthy) => Some(healthy),
                    Err(_) => Some(false),
                }
            }
        }
    }

    /// `swap` is `activate` with explicit hot-swap semantics: same
    /// algorithm, the name exists for callers that want to make the intent
    /// of "replace the current instance" explicit at call sites.
    pub async fn swap(
        &self,
        domain: &str,
        key: &str,
        provider: Option<&str>,
        force: bool,
    ) -> Result<Instance, OneiricError> {
        self.activate(domain, key, provider, force).await
    }

    pub async fn activate(
        &self,
        domain: &str,
        key: &str,
        override_provider: Option<&str>,
        force: bool,
    ) -> Result<Instance, OneiricError> {
        let identity = (domain.to_string(), key.to_string());

        let candidate = self
            .registry
            .resolve(domain, key, override_provider)
            .ok_or_else(|| OneiricError::CandidateNotFound {
                domain: domain.to_string(),
                key: key.to_string(),
            })?;

        safety::check_factory_allowed(&self.env.factory_allowlist, &candidate.factory)?;

        self.set_state(&identity, LifecycleState::Activating, None, None);

        if let Err(err) = self.run_pre_hooks(domain, key, &candidate).await {
            return self.fail(&identity, &candidate.provider, LifecycleErrorReason::HookError, err.to_string());
        }

        let factory = match self.factories.get(&candidate.factory) {
            Some(factory) => factory,
            None => {
                return self.fail(
                    &identity,
                    &candidate.provider,
                    LifecycleErrorReason::FactoryError,
                    format!("no factory registered for {}", candidate.factory),
                )
            }
        };

        let started = Instant::now();
        let activated = match self.shielded_activate(factory, &candidate).await {
            Ok(activated) => activated,
            Err(err) => return self.fail(&identity, &candidate.provider, LifecycleErrorReason::FactoryError, err.to_string()),
        };

        if !force {
            if let Some(health) = &activated.health {
                let healthy = tokio::time::timeout(self.timeouts.health_timeout, health.check_health())
                    .await
                    .unwrap_or(false);
                if !healthy {
                    return self.fail(
                        &identity,
                        &candidate.provider,
                        LifecycleErrorReason::HealthFailed,
                        "new instance failed health check".to_string(),
                    );
                }
            }
        }

        let previous = self.active.insert(
            identity.clone(),
            ActiveBinding {
                provider: candidate.provider.clone(),
                instance: activated.instance.clone(),
                health: activated.health.clone(),
                cleanup: activated.cleanup.clone(),
            },
        );

        // Post-hooks run before the swap is committed: a hook that errors
        // aborts the swap and rolls the active binding back to whatever was
        // there before, same as a pre-hook or failed health check would.
        if let Err(err) = self.run_post_hooks(domain, key, &candidate).await {
            match previous {
                Some(previous) => {
                    self.active.insert(identity.clone(), previous);
                }
                None => {
                    self.active.remove(&identity);
                }
            }
            if let Some(cleanup) = activated.cleanup {
                let _ = tokio::time::timeout(self.timeouts.cleanup_timeout, cleanup.cleanup()).await;
            }
            return self.fail(&identity, &candidate.provider, LifecycleErrorReason::HookError, err.to_string());
        }

        if let Some(previous) = previous {
            if let Some(cleanup) = previous.cleanup {
                let _ = tokio::time::timeout(self.timeouts.cleanup_timeout, cleanup.cleanup()).await;
            }
        }
        for hook in self.cleanup_hooks.read().iter().cloned().collect::<Vec<_>>() {
            let _ = tokio::time::timeout(self.timeouts.hook_timeout, hook.call(domain, key)).await;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.set_state(
            &identity,
            LifecycleState::Ready,
            Some(candidate.provider.clone()),
            Some(duration_ms),
        );
        events::swap_succeeded(domain, key, &candidate.provider, duration_ms, &self.metrics);

        Ok(activated.instance)
    }

    async fn shielded_activate(
        &self,
        factory: Arc<dyn Factory>,
        candidate: &Candidate,
    ) -> anyhow::Result<crate::factory::ActivatedInstance> {
        let candidate = candidate.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let ctx = ActivationContext { candidate: &candidate };
            let result = factory.create(&ctx).await;
            let _ = tx.send(result);
        });
        match tokio::time::timeout(self.timeouts.activation_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow::anyhow!("activation task was dropped before completing")),
            Err(_) => Err(anyhow::anyhow!("activation timed out")),
        }
    }

    async fn run_pre_hooks(&self, domain: &str, key: &str, candidate: &Candidate) -> anyhow::Result<()> {
        for hook in self.pre_hooks.read().iter().cloned().collect::<Vec<_>>() {
            tokio::time::timeout(self.timeouts.hook_timeout, hook.call(domain, key, candidate))
                .await
                .map_err(|_| anyhow::anyhow!("pre-swap hook timed out"))??;
        }
        Ok(())
    }

    async fn run_post_hooks(&self, domain: &str, key: &str, candidate: &Candidate) -> anyhow::Result<()> {
        for hook in self.post_hooks.read().iter().cloned().collect::<Vec<_>>() {
            tokio::time::timeout(self.timeouts.hook_timeout, hook.call(domain, key, candidate))
                .await
                .map_err(|_| anyhow::anyhow!("post-swap hook timed out"))??;
        }
        Ok(())
    }

    fn fail<T>(
        &self,
        identity: &(String, String),
        provider: &str,
        reason: LifecycleErrorReason,
        message: String,
    ) -> Result<T, OneiricError> {
        let mut entry = self
            .status
            .entry(identity.clone())
            .or_insert_with(|| LifecycleStatus::new(identity.0.clone(), identity.1.clone()));
        entry.state = LifecycleState::Failed;
        entry.last_failure_at = Some(Utc::now());
        entry.last_error = Some(message.clone());
        drop(entry);
        self.persist();
        events::swap_failed(&identity.0, &identity.1, provider, &message, &self.metrics);
        Err(OneiricError::Lifecycle(LifecycleError::new(reason, format!("Swap failed: {message}"))))
    }

    fn set_state(
        &self,
        identity: &(String, String),
        state: LifecycleState,
        new_provider: Option<String>,
        duration_ms: Option<u64>,
    ) {
        let mut entry = self
            .status
            .entry(identity.clone())
            .or_insert_with(|| LifecycleStatus::new(identity.0.clone(), identity.1.clone()));
        if let Some(provider) = new_provider {
            if entry.current_provider.as_deref() != Some(provider.as_str()) {
                entry.previous_provider = entry.current_provider.take();
            }
            entry.current_provider = Some(provider);
        }
        entry.state = state;
        if state == LifecycleState::Ready {
            entry.last_success_at = Some(Utc::now());
            entry.last_error = None;
        }
        if let Some(duration_ms) = duration_ms {
            entry.push_duration_sample(duration_ms);
        }
        drop(entry);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = self.status_path.as_deref() else { return };
        let records: Vec<LifecycleStatus> = self.status.iter().map(|e| e.value().clone()).collect();
        if let Err(err) = write_status_table(path, &records) {
            tracing::warn!(error = %err, path = %path.display(), "failed to persist lifecycle status");
        }
    }
}

fn write_status_table(path: &Path, records: &[LifecycleStatus]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(records).map_err(std::io::Error::other)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn load_status_table(path: &Path) -> DashMap<(String, String), LifecycleStatus> {
    let map = DashMap::new();
    let Ok(bytes) = std::fs::read(path) else {
        return map;
    };
    match serde_json::from_slice::<Vec<LifecycleStatus>>(&bytes) {
        Ok(records) => {
            for record in records {
                map.insert((record.domain.clone(), record.key.clone()), record);
            }
        }
        Err(err) => {
            crate::observability::events::lifecycle_status_load_failed(&err.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ActivatedInstance;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFactory {
        calls: Arc<AtomicU32>,
        healthy: bool,
        cleaned_up: Arc<AtomicU32>,
    }

    struct Health(bool);
    #[async_trait]
    impl HealthCheck for Health {
        async fn check_health(&self) -> bool {
            self.0
        }
    }

    struct CleanupCounter(Arc<AtomicU32>);
    #[async_trait]
    impl Cleanup for CleanupCounter {
        async fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Factory for CountingFactory {
        async fn create(&self, _ctx: &ActivationContext<'_>) -> anyhow::Result<ActivatedInstance> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ActivatedInstance::new(Arc::new(n))
                .with_health(Arc::new(Health(self.healthy)))
                .with_cleanup(Arc::new(CleanupCounter(Arc::clone(&self.cleaned_up)))))
        }
    }

    fn candidate(domain: &str, key: &str, provider: &str, factory: &str) -> Candidate {
        Candidate {
            domain: domain.into(),
            key: key.into(),
            provider: provider.into(),
            factory: factory.into(),
            stack_level: 0,
            priority: 0,
            sequence: 0,
            source: "local".into(),
            version: None,
            metadata: Default::default(),
        }
    }

    fn manager() -> (LifecycleManager, Arc<Registry>, Arc<FactoryRegistry>) {
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        let manager = LifecycleManager::new(
            env,
            Arc::clone(&registry),
            Arc::clone(&factories),
            LifecycleTimeouts::default(),
            None,
        );
        (manager, registry, factories)
    }

    #[tokio::test]
    async fn hot_swap_produces_distinct_instances_and_cleans_up_previous() {
        let (manager, registry, factories) = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let cleaned = Arc::new(AtomicU32::new(0));
        factories.register(
            "factories.v1",
            Arc::new(CountingFactory { calls: Arc::clone(&calls), healthy: true, cleaned_up: Arc::clone(&cleaned) }),
        );
        registry.register(candidate("service", "status", "v1", "factories.v1"));

        manager.activate("service", "status", None, false).await.unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);

        registry.register(candidate("service", "status", "v2", "factories.v1"));
        manager.activate("service", "status", Some("v2"), false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        let status = manager.get_status("service", "status").unwrap();
        assert_eq!(status.current_provider.as_deref(), Some("v2"));
        assert_eq!(status.previous_provider.as_deref(), Some("v1"));
        assert_eq!(status.state, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn health_failure_rolls_back_and_reports_failed() {
        let (manager, registry, factories) = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let cleaned = Arc::new(AtomicU32::new(0));
        factories.register(
            "factories.bad",
            Arc::new(CountingFactory { calls: Arc::clone(&calls), healthy: false, cleaned_up: Arc::clone(&cleaned) }),
        );
        registry.register(candidate("adapter", "cache", "bad", "factories.bad"));

        let result = manager.activate("adapter", "cache", None, false).await;
        assert!(result.is_err());
        assert!(manager.get_instance("adapter", "cache").is_none());
        let status = manager.get_status("adapter", "cache").unwrap();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_candidate_fails_fast() {
        let (manager, _registry, _factories) = manager();
        let err = manager.activate("adapter", "missing", None, false).await.unwrap_err();
        assert!(matches!(err, OneiricError::CandidateNotFound { .. }));
    }

    #[tokio::test]
    async fn factory_allowlist_blocks_unlisted_reference() {
        let env = Environment::new(
            Default::default(),
            Default::default(),
            crate::environment::FactoryAllowlist::compile(["allowed.*"]),
        );
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        let manager = LifecycleManager::new(env, Arc::clone(&registry), Arc::clone(&factories), LifecycleTimeouts::default(), None);
        registry.register(candidate("adapter", "cache", "evil", "forbidden.factory"));
        let err = manager.activate("adapter", "cache", None, false).await.unwrap_err();
        assert!(matches!(err, OneiricError::FactoryForbidden(_)));
    }

    #[tokio::test]
    async fn status_persists_and_reloads_across_managers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle_status.json");
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        let calls = Arc::new(AtomicU32::new(0));
        let cleaned = Arc::new(AtomicU32::new(0));
        factories.register("factories.v1", Arc::new(CountingFactory { calls, healthy: true, cleaned_up: cleaned }));
        registry.register(candidate("service", "status", "v1", "factories.v1"));

        let manager = LifecycleManager::new(env.clone(), Arc::clone(&registry), Arc::clone(&factories), LifecycleTimeouts::default(), Some(path.clone()));
        manager.activate("service", "status", None, false).await.unwrap();

        let reloaded = LifecycleManager::new(env, registry, factories, LifecycleTimeouts::default(), Some(path));
        let status = reloaded.get_status("service", "status").unwrap();
        assert_eq!(status.current_provider.as_deref(), Some("v1"));
    }

    #[test]
    fn missing_status_file_loads_as_empty() {
        let map = load_status_table(Path::new("/nonexistent/oneiric/lifecycle_status.json"));
        assert!(map.is_empty());
    }

    struct FailingPostHook;
    #[async_trait]
    impl PostSwapHook for FailingPostHook {
        async fn call(&self, _domain: &str, _key: &str, _candidate: &Candidate) -> anyhow::Result<()> {
            anyhow::bail!("post-swap hook always fails")
        }
    }

    #[tokio::test]
    async fn failing_post_hook_aborts_swap_and_restores_previous_instance() {
        let (manager, registry, factories) = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let cleaned = Arc::new(AtomicU32::new(0));
        factories.register(
            "factories.v1",
            Arc::new(CountingFactory { calls: Arc::clone(&calls), healthy: true, cleaned_up: Arc::clone(&cleaned) }),
        );
        registry.register(candidate("service", "status", "v1", "factories.v1"));
        let first = manager.activate("service", "status", None, false).await.unwrap();

        manager.add_post_swap_hook(Arc::new(FailingPostHook));
        registry.register(candidate("service", "status", "v2", "factories.v1"));
        let err = manager.activate("service", "status", Some("v2"), false).await.unwrap_err();
        assert!(matches!(err, OneiricError::Lifecycle(_)));

        // v1 is still the active, reachable instance; the v2 attempt's
        // instance was cleaned up rather than left dangling.
        let restored = manager.get_instance("service", "status").unwrap();
        assert!(Arc::ptr_eq(&first, &restored));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        let status = manager.get_status("service", "status").unwrap();
        assert_eq!(status.state, LifecycleState::Failed);
    }
}
