//! The runtime health snapshot the orchestrator persists to `runtime_health.json`.

use std::collections::BTreeMap;

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activity::ActivityCounts;

/// p50/p95/p99 swap-latency histogram for one (domain, key) pair, derived
/// from `LifecycleStatus::recent_durations_ms`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SwapLatencyHistogram {
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub sample_count: usize,
}

/// Snapshot of orchestrator state, written after start, after each refresh
/// iteration, after each swap that updates durations, and on stop.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RuntimeHealthSnapshot {
    pub watchers_running: bool,
    pub remote_enabled: bool,
    #[cfg(feature = "chrono")]
    pub last_remote_sync_at: Option<DateTime<Utc>>,
    pub last_remote_error: Option<String>,
    pub orchestrator_pid: u32,
    pub last_remote_registered_count: u64,
    pub per_domain_registration_counts: BTreeMap<String, u64>,
    pub activity: ActivityCounts,
    pub lifecycle_swap_latency: BTreeMap<String, SwapLatencyHistogram>,
    #[cfg(feature = "chrono")]
    pub updated_at: Option<DateTime<Utc>>,
}
