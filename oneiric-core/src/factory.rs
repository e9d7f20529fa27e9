//! Factory dispatch table and the explicit capability interfaces an
//! activated instance exposes.
//!
//! Dynamic factory references in manifests are dotted strings; rather than
//! resolving them via dynamic symbol lookup, factories are registered ahead
//! of time into a name-keyed dispatch table and looked up by that name. An
//! activated instance declares health/cleanup support by attaching the
//! corresponding trait object explicitly instead of being probed via
//! reflection.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use oneiric_model::Candidate;

/// A live instance, type-erased. Domain bridges downcast this back to their
/// concrete provider type via `Any`.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Optional health-check capability an instance may provide.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_health(&self) -> bool;
}

/// Optional cleanup capability an instance may provide, run when the
/// lifecycle manager retires it in favor of a freshly activated instance.
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self);
}

/// What a factory produces: the instance itself plus whichever optional
/// capabilities it declares.
pub struct ActivatedInstance {
    pub instance: Instance,
    pub health: Option<Arc<dyn HealthCheck>>,
    pub cleanup: Option<Arc<dyn Cleanup>>,
}

impl ActivatedInstance {
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            health: None,
            cleanup: None,
        }
    }

    pub fn with_health(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn Cleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

/// Context passed to a factory's `create` call.
pub struct ActivationContext<'a> {
    pub candidate: &'a Candidate,
}

/// A registered implementation constructor. One `Factory` is registered per
/// dotted factory reference named in candidate metadata.
#[async_trait]
pub trait Factory: Send + Sync {
    async fn create(&self, ctx: &ActivationContext<'_>) -> anyhow::Result<ActivatedInstance>;
}

/// Name-keyed dispatch table of registered factories, consulted by the
/// lifecycle manager after the factory allowlist check passes.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, Arc<dyn Factory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory_ref: impl Into<String>, factory: Arc<dyn Factory>) {
        self.factories.insert(factory_ref.into(), factory);
    }

    pub fn get(&self, factory_ref: &str) -> Option<Arc<dyn Factory>> {
        self.factories.get(factory_ref).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(String);

    #[async_trait]
    impl Factory for Echo {
        async fn create(&self, _ctx: &ActivationContext<'_>) -> anyhow::Result<ActivatedInstance> {
            Ok(ActivatedInstance::new(Arc::new(self.0.clone())))
        }
    }

    #[tokio::test]
    async fn registered_factory_is_dispatched_by_name() {
        let registry = FactoryRegistry::new();
        registry.register("factories.echo", Arc::new(Echo("hi".to_string())));
        assert!(registry.get("factories.echo").is_some());
        assert!(registry.get("factories.missing").is_none());
    }
}
