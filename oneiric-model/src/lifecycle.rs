//! Persisted lifecycle status, one record per (domain, key).

use std::collections::VecDeque;

#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Current activation state of a (domain, key) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LifecycleState {
    Inactive,
    Activating,
    Ready,
    Failed,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Inactive
    }
}

/// Bound on the number of recent swap-duration samples kept for p50/p95/p99
/// reporting. Older samples are evicted FIFO.
pub const MAX_DURATION_SAMPLES: usize = 128;

/// Per-(domain, key) lifecycle record, persisted as a JSON list after every
/// state transition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LifecycleStatus {
    pub domain: String,
    pub key: String,
    pub state: LifecycleState,
    pub current_provider: Option<String>,
    pub previous_provider: Option<String>,
    #[cfg(feature = "chrono")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[cfg(feature = "chrono")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub recent_durations_ms: VecDeque<u64>,
}

impl LifecycleStatus {
    pub fn new(domain: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            key: key.into(),
            state: LifecycleState::Inactive,
            current_provider: None,
            previous_provider: None,
            #[cfg(feature = "chrono")]
            last_success_at: None,
            #[cfg(feature = "chrono")]
            last_failure_at: None,
            last_error: None,
            recent_durations_ms: VecDeque::new(),
        }
    }

    /// Push a new swap-duration sample, evicting the oldest once the ring
    /// buffer bound is exceeded.
    pub fn push_duration_sample(&mut self, millis: u64) {
        if self.recent_durations_ms.len() >= MAX_DURATION_SAMPLES {
            self.recent_durations_ms.pop_front();
        }
        self.recent_durations_ms.push_back(millis);
    }

    /// Percentile over the recent-duration ring buffer (nearest-rank method).
    /// Returns `None` when no samples have been recorded yet.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.recent_durations_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.recent_durations_ms.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[idx])
    }
}
