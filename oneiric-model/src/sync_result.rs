//! Outcome of one `sync_remote_manifest` call.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-entry digest-check outcome, used for telemetry and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DigestOutcome {
    NotApplicable,
    Matched,
    Mismatched,
}

/// Summary returned by `sync_remote_manifest`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteSyncResult {
    pub source: String,
    pub registered: u64,
    pub per_domain_counts: BTreeMap<String, u64>,
    pub skipped_invalid: u64,
    pub duration_ms: u64,
    pub digest_outcomes: Vec<DigestOutcome>,
}
