//! Remote manifest wire format: `RemoteManifest` and its `ManifestEntry`
//! list, including the v2 metadata groups named in the spec (capabilities,
//! retry policy, event routing, workflow DAG, ...).

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Top-level signed-or-unsigned manifest document.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub struct RemoteManifest {
    pub source: String,
    pub entries: Vec<ManifestEntry>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub signature: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_signature_algorithm")
    )]
    pub signature_algorithm: String,
}

#[cfg(feature = "serde")]
fn default_signature_algorithm() -> String {
    "ed25519".to_string()
}

/// Retry policy carried in manifest entry metadata.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub struct RetryPolicySpec {
    pub attempts: u32,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde::option", default))]
    pub base_delay: Option<std::time::Duration>,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde::option", default))]
    pub max_delay: Option<std::time::Duration>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub jitter: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub retriable_status_codes: Vec<u16>,
}

/// Fanout policy for event-domain candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EventFanoutPolicy {
    Broadcast,
    Exclusive,
}

/// A single event-routing filter, matched against an incoming event's
/// attribute map by the event domain bridge.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum EventFilter {
    Path { path: String },
    Equals { path: String, value: serde_json::Value },
    AnyOf { path: String, values: Vec<serde_json::Value> },
    Exists { path: String },
}

/// One node of a workflow DAG carried by workflow-domain candidates. The
/// core only stores this; an external executor interprets it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkflowNode {
    pub id: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub depends_on: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub task: Option<String>,
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkflowDag {
    #[cfg_attr(feature = "serde", serde(default))]
    pub nodes: Vec<WorkflowNode>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub retry_policy: Option<RetryPolicySpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scheduler: Option<String>,
}

/// Typed metadata groups carried by a manifest entry. Every field is
/// optional: the registry stores whatever a producer supplied, and the
/// domain bridges interpret only the fields relevant to their domain.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub struct ManifestMetadata {
    #[cfg_attr(feature = "serde", serde(default))]
    pub capabilities: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub owner: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub requires_secrets: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub settings_model: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub side_effect_free: Option<bool>,
    #[cfg_attr(feature = "serde", serde(default, with = "humantime_serde::option"))]
    pub timeout: Option<std::time::Duration>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub retry_policy: Option<RetryPolicySpec>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub requires: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub conflicts_with: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub python_version: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub os_platform: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub license: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub documentation_url: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub event_topics: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub event_filters: Vec<EventFilter>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub event_priority: Option<i64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub event_fanout_policy: Option<EventFanoutPolicy>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub workflow: Option<WorkflowDag>,
    /// Anything the typed groups above did not account for, kept verbatim so
    /// `explain`/audit can surface the full manifest fields.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One candidate registration as carried in a remote manifest.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub struct ManifestEntry {
    pub domain: String,
    pub key: String,
    pub provider: String,
    pub factory: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub uri: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sha256: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub stack_level: Option<i64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: Option<i64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub version: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: ManifestMetadata,
}

impl ManifestEntry {
    /// `true` when `sha256` is present and looks like a 64-char hex digest.
    pub fn has_well_formed_digest(&self) -> bool {
        match &self.sha256 {
            Some(d) => d.len() == 64 && d.bytes().all(|b| b.is_ascii_hexdigit()),
            None => true,
        }
    }
}
