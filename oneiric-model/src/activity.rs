//! Per-(domain, key) operator-controlled activity state.

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pause/drain flags and operator note for a (domain, key) pair, read by
/// selection watchers before triggering a swap.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DomainActivity {
    pub domain: String,
    pub key: String,
    pub paused: bool,
    pub draining: bool,
    pub note: Option<String>,
    #[cfg(feature = "chrono")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DomainActivity {
    pub fn new(domain: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            key: key.into(),
            paused: false,
            draining: false,
            note: None,
            #[cfg(feature = "chrono")]
            updated_at: None,
        }
    }

    /// Whether a watcher should accept new work against this pair.
    pub fn accepts_work(&self) -> bool {
        !self.paused && !self.draining
    }
}

/// Aggregate counts returned by the activity store's `global_counts` query.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivityCounts {
    pub paused: u64,
    pub draining: u64,
    pub noted: u64,
    pub total: u64,
}
