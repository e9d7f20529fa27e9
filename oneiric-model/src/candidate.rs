//! The [`Candidate`] identity and the explain-trace types the resolver
//! produces when asked to justify a selection.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Opaque factory reference. The lifecycle manager resolves this string
/// against a registered dispatch table (see `oneiric_core::factory`) rather
/// than performing any dynamic symbol lookup.
pub type FactoryRef = String;

/// A registered implementation for a (domain, key) pair, distinguished by
/// provider. Candidates are immutable after registration; replacing one
/// means registering a new candidate with the same identity and a fresh
/// sequence number.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Candidate {
    pub domain: String,
    pub key: String,
    pub provider: String,
    pub factory: FactoryRef,
    pub stack_level: i64,
    pub priority: i64,
    pub sequence: u64,
    pub source: String,
    pub version: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Candidate {
    /// The (domain, key, provider) identity triple used as the registry's
    /// lookup key component alongside the sequence number.
    pub fn identity(&self) -> (String, String, String) {
        (self.domain.clone(), self.key.clone(), self.provider.clone())
    }
}

/// The tier on which a losing candidate in an [`ExplainTrace`] was beaten,
/// or `None` for the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LossTier {
    /// Beaten by an explicit configured override naming a different provider.
    Override,
    /// Beaten by a higher inferred stack-order priority.
    InferredPriority,
    /// Beaten by a higher `stack_level`.
    StackLevel,
    /// Beaten by a larger registration sequence number.
    RegistrationOrder,
}

impl std::fmt::Display for LossTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Override => "override",
            Self::InferredPriority => "inferred_priority",
            Self::StackLevel => "stack_level",
            Self::RegistrationOrder => "registration_order",
        };
        f.write_str(s)
    }
}

/// One contender in an [`ExplainTrace`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExplainEntry {
    pub candidate: Candidate,
    pub selected: bool,
    pub lost_on: Option<LossTier>,
}

/// Ordered list of every contender for a (domain, key) query, winner first.
pub type ExplainTrace = Vec<ExplainEntry>;
