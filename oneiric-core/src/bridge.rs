//! Domain bridges: the per-domain facade over the shared resolver and
//! lifecycle manager.
//!
//! One generic [`DomainBridge`] is specialized into the five domains the
//! runtime composes. Bridges share the same `Registry`, `LifecycleManager`
//! and `ActivityStore` instances; only the domain label and the
//! per-provider settings-factory registry differ between them.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use oneiric_model::{Candidate, DomainActivity, ExplainTrace, ManifestMetadata, OneiricError};

use crate::activity::ActivityStore;
use crate::factory::Instance;
use crate::lifecycle::LifecycleManager;
use crate::observability::events;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DomainLabel {
    Adapter,
    Service,
    Task,
    Event,
    Workflow,
}

impl DomainLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adapter => "adapter",
            Self::Service => "service",
            Self::Task => "task",
            Self::Event => "event",
            Self::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for DomainLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialized, typed settings object for one provider, injected into the
/// domain handle at activation time.
pub type Settings = Arc<dyn Any + Send + Sync>;

/// Builds a provider's typed settings object from layered configuration.
/// Registered per (domain, key) against a bridge; absence means the
/// provider takes no settings.
#[async_trait]
pub trait SettingsFactory: Send + Sync {
    async fn materialize(&self, candidate: &Candidate) -> anyhow::Result<Settings>;
}

/// Returned by [`DomainBridge::use_key`]: everything a caller needs to start
/// using the selected provider.
pub struct DomainHandle {
    pub domain: String,
    pub key: String,
    pub provider: String,
    pub instance: Instance,
    pub settings: Option<Settings>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Ties one domain to the shared resolver and lifecycle manager, injecting
/// per-provider settings and exposing pause/drain control scoped to its
/// domain.
pub struct DomainBridge {
    label: DomainLabel,
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    activity: Arc<ActivityStore>,
    settings_factories: DashMap<String, Arc<dyn SettingsFactory>>,
}

impl DomainBridge {
    pub fn new(
        label: DomainLabel,
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleManager>,
        activity: Arc<ActivityStore>,
    ) -> Self {
        Self {
            label,
            registry,
            lifecycle,
            activity,
            settings_factories: DashMap::new(),
        }
    }

    pub fn adapter(registry: Arc<Registry>, lifecycle: Arc<LifecycleManager>, activity: Arc<ActivityStore>) -> Self {
        Self::new(DomainLabel::Adapter, registry, lifecycle, activity)
    }

    pub fn service(registry: Arc<Registry>, lifecycle: Arc<LifecycleManager>, activity: Arc<ActivityStore>) -> Self {
        Self::new(DomainLabel::Service, registry, lifecycle, activity)
    }

    pub fn task(registry: Arc<Registry>, lifecycle: Arc<LifecycleManager>, activity: Arc<ActivityStore>) -> Self {
        Self::new(DomainLabel::Task, registry, lifecycle, activity)
    }

    pub fn event(registry: Arc<Registry>, lifecycle: Arc<LifecycleManager>, activity: Arc<ActivityStore>) -> Self {
        Self::new(DomainLabel::Event, registry, lifecycle, activity)
    }

    pub fn workflow(registry: Arc<Registry>, lifecycle: Arc<LifecycleManager>, activity: Arc<ActivityStore>) -> Self {
        Self::new(DomainLabel::Workflow, registry, lifecycle, activity)
    }

    pub fn label(&self) -> DomainLabel {
        self.label
    }

    pub fn register_settings_factory(&self, key: impl Into<String>, factory: Arc<dyn SettingsFactory>) {
        self.settings_factories.insert(key.into(), factory);
    }

    /// Activate (or reuse) the selected provider for `key`.
    ///
    /// `force_reload=true` mandates a fresh swap even when the resolved
    /// provider has not changed; otherwise an already-ready instance for the
    /// same provider is reused without invoking the factory again.
    pub async fn use_key(
        &self,
        key: &str,
        provider_override: Option<&str>,
        force_reload: bool,
    ) -> Result<DomainHandle, OneiricError> {
        let domain = self.label.as_str();
        let candidate = self
            .registry
            .resolve(domain, key, provider_override)
            .ok_or_else(|| OneiricError::CandidateNotFound {
                domain: domain.to_string(),
                key: key.to_string(),
            })?;

        let already_ready = self
            .lifecycle
            .get_status(domain, key)
            .map(|s| s.current_provider.as_deref() == Some(candidate.provider.as_str()))
            .unwrap_or(false);

        let instance = if already_ready && !force_reload {
            self.lifecycle
                .get_instance(domain, key)
                .ok_or_else(|| OneiricError::CandidateNotFound {
                    domain: domain.to_string(),
                    key: key.to_string(),
                })?
        } else {
            events::swap_started(domain, key, &candidate.provider);
            self.lifecycle.activate(domain, key, Some(candidate.provider.as_str()), false).await?
        };

        let settings = match self.settings_factories.get(key) {
            Some(factory) => factory.materialize(&candidate).await.ok(),
            None => None,
        };

        Ok(DomainHandle {
            domain: domain.to_string(),
            key: key.to_string(),
            provider: candidate.provider.clone(),
            instance,
            settings,
            metadata: candidate.metadata.clone(),
        })
    }

    pub fn list_active(&self) -> Vec<Candidate> {
        self.registry.list_active(Some(self.label.as_str()))
    }

    pub fn list_shadowed(&self) -> Vec<Candidate> {
        self.registry.list_shadowed(Some(self.label.as_str()))
    }

    pub fn explain(&self, key: &str) -> ExplainTrace {
        self.registry.explain(self.label.as_str(), key)
    }

    pub async fn set_paused(&self, key: &str, note: Option<&str>) -> Result<(), OneiricError> {
        self.activity.set(self.label.as_str(), key, true, false, note).await
    }

    pub async fn set_draining(&self, key: &str, note: Option<&str>) -> Result<(), OneiricError> {
        self.activity.set(self.label.as_str(), key, false, true, note).await
    }

    pub async fn clear_activity(&self, key: &str) -> Result<(), OneiricError> {
        self.activity.set(self.label.as_str(), key, false, false, None).await
    }

    pub async fn activity_snapshot(&self) -> Result<Vec<DomainActivity>, OneiricError> {
        let all = self.activity.snapshot_all().await?;
        Ok(all.into_iter().filter(|a| a.domain == self.label.as_str()).collect())
    }

    /// Typed manifest metadata for `key`'s active candidate, if it carries
    /// the well-known `manifest_metadata` entry the remote loader stores
    /// (event_topics, event_filters, workflow DAG, ...).
    pub fn manifest_metadata(&self, key: &str) -> Option<ManifestMetadata> {
        let candidate = self.registry.resolve(self.label.as_str(), key, None)?;
        let raw = candidate.metadata.get("manifest_metadata")?;
        serde_json::from_value(raw.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::factory::{ActivatedInstance, ActivationContext, Factory, FactoryRegistry};
    use crate::lifecycle::LifecycleTimeouts;

    struct Echo;
    #[async_trait]
    impl Factory for Echo {
        async fn create(&self, _ctx: &ActivationContext<'_>) -> anyhow::Result<ActivatedInstance> {
            Ok(ActivatedInstance::new(Arc::new(())))
        }
    }

    fn candidate(domain: &str, key: &str, provider: &str) -> Candidate {
        Candidate {
            domain: domain.into(),
            key: key.into(),
            provider: provider.into(),
            factory: "factories.echo".into(),
            stack_level: 0,
            priority: 0,
            sequence: 0,
            source: "local".into(),
            version: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn use_key_reuses_ready_instance_unless_forced() {
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        factories.register("factories.echo", Arc::new(Echo));
        let lifecycle = Arc::new(LifecycleManager::new(env, Arc::clone(&registry), factories, LifecycleTimeouts::default(), None));
        let activity = Arc::new(ActivityStore::open_in_memory().await.unwrap());
        let bridge = DomainBridge::service(registry.clone(), lifecycle, activity);

        registry.register(candidate("service", "status", "v1"));
        let first = bridge.use_key("status", None, false).await.unwrap();
        let second = bridge.use_key("status", None, false).await.unwrap();
        assert!(Arc::ptr_eq(&first.instance, &second.instance));

        let third = bridge.use_key("status", None, true).await.unwrap();
        assert!(!Arc::ptr_eq(&first.instance, &third.instance));
    }

    #[tokio::test]
    async fn pause_reports_in_activity_snapshot() {
        let env = Environment::permissive();
        let registry = Arc::new(Registry::new(env.clone()));
        let factories = Arc::new(FactoryRegistry::new());
        let lifecycle = Arc::new(LifecycleManager::new(env, Arc::clone(&registry), factories, LifecycleTimeouts::default(), None));
        let activity = Arc::new(ActivityStore::open_in_memory().await.unwrap());
        let bridge = DomainBridge::service(registry, lifecycle, activity);
        bridge.set_paused("status", Some("deploy window")).await.unwrap();
        let snapshot = bridge.activity_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].paused);
        assert_eq!(snapshot[0].note.as_deref(), Some("deploy window"));
    }
}
