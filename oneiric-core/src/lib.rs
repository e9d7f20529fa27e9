//! Candidate registry, lifecycle manager, remote manifest pipeline and
//! runtime orchestrator for pluggable components.
//!
//! See the module docs on [`registry`], [`lifecycle`], [`remote`] and
//! [`orchestrator`] for the four subsystems this crate composes.

pub mod activity;
pub mod bridge;
pub mod environment;
pub mod factory;
pub mod lifecycle;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod safety;
pub mod watcher;

#[cfg(feature = "remote")]
pub mod remote;

pub use oneiric_model as model;

pub mod prelude {
    //! Curated re-export surface for embedding applications.
    pub use crate::activity::ActivityStore;
    pub use crate::bridge::{DomainBridge, DomainHandle, DomainLabel};
    pub use crate::environment::Environment;
    pub use crate::factory::{Factory, FactoryRegistry, Instance};
    pub use crate::lifecycle::LifecycleManager;
    pub use crate::orchestrator::RuntimeOrchestrator;
    pub use crate::registry::Registry;
    pub use oneiric_model::prelude::*;
}
