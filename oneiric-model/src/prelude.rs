//! Curated re-export surface for downstream consumers. Prefer importing from
//! here over individual submodules when wiring up a domain bridge.

pub use super::activity::{ActivityCounts, DomainActivity};
pub use super::candidate::{Candidate, ExplainEntry, ExplainTrace, FactoryRef, LossTier};
pub use super::error::{
    ConfigError, LifecycleError, LifecycleErrorReason, OneiricError, PathTraversalError,
    RemoteSyncError, RemoteSyncErrorReason, Result,
};
pub use super::health::{RuntimeHealthSnapshot, SwapLatencyHistogram};
pub use super::lifecycle::{LifecycleState, LifecycleStatus, MAX_DURATION_SAMPLES};
pub use super::manifest::{
    EventFanoutPolicy, EventFilter, ManifestEntry, ManifestMetadata, RemoteManifest,
    RetryPolicySpec, WorkflowDag, WorkflowNode,
};
pub use super::remote_status::RemoteStatus;
pub use super::sync_result::{DigestOutcome, RemoteSyncResult};
