//! Last remote sync telemetry, persisted as `remote_status.json` under
//! `cache_dir` after every refresh-loop iteration (success or failure).

use std::collections::BTreeMap;

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Point-in-time record of the most recent remote manifest sync attempt.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteStatus {
    pub url: String,
    #[cfg(feature = "chrono")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub duration_ms: u64,
    pub per_domain_counts: BTreeMap<String, u64>,
}
