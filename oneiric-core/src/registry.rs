//! Candidate registry and precedence resolver.
//!
//! A single reentrant lock guards the candidate map and the sequence
//! counter. `register` calls internally score contenders while already
//! holding the lock (to compute logging-worthy state), so the lock must be
//! reentrant rather than a plain mutex.

use std::cell::RefCell;
use std::collections::BTreeMap;

use oneiric_model::{Candidate, ExplainEntry, ExplainTrace, LossTier};
use parking_lot::ReentrantMutex;

use crate::environment::{Environment, StackOrder};

type Identity = (String, String, String);

struct Inner {
    candidates: BTreeMap<Identity, Candidate>,
    next_sequence: u64,
}

impl Inner {
    fn contenders(&self, domain: &str, key: &str) -> Vec<&Candidate> {
        self.candidates
            .values()
            .filter(|c| c.domain == domain && c.key == key)
            .collect()
    }
}

/// Rank key used for natural (non-override) precedence ordering: tiers 2
/// through 4 of the precedence comparison. Larger is better; `None` in the
/// first slot means the candidate's source is not named in the stack order,
/// so it falls through to `stack_level`/`sequence` against another such
/// candidate.
fn rank_key(candidate: &Candidate, stack_order: &StackOrder) -> (Option<i64>, i64, u64) {
    (
        stack_order.priority_for(&candidate.source),
        candidate.stack_level,
        candidate.sequence,
    )
}

fn loss_tier(winner: &Candidate, other: &Candidate, stack_order: &StackOrder) -> LossTier {
    let w = rank_key(winner, stack_order);
    let o = rank_key(other, stack_order);
    if w.0 != o.0 {
        LossTier::InferredPriority
    } else if w.1 != o.1 {
        LossTier::StackLevel
    } else {
        LossTier::RegistrationOrder
    }
}

/// Thread-safe candidate store and precedence resolver shared by every
/// domain bridge in a process.
pub struct Registry {
    env: Environment,
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl Registry {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                candidates: BTreeMap::new(),
                next_sequence: 1,
            })),
        }
    }

    /// Register a candidate, assigning it the next globally-unique sequence
    /// number. Re-registering the same (domain, key, provider) replaces the
    /// earlier entry but keeps the fresh sequence number, per the registry's
    /// edge-case rule.
    pub fn register(&self, mut candidate: Candidate) -> Candidate {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        candidate.sequence = sequence;
        inner.candidates.insert(candidate.identity(), candidate.clone());
        tracing::debug!(
            domain = %candidate.domain,
            key = %candidate.key,
            provider = %candidate.provider,
            sequence,
            "candidate registered"
        );
        candidate
    }

    /// Resolve the active candidate for (domain, key), or the candidate
    /// matching `override_provider` if one is supplied and registered.
    pub fn resolve(&self, domain: &str, key: &str, override_provider: Option<&str>) -> Option<Candidate> {
        let winner = self
            .explain_with_override(domain, key, override_provider)
            .into_iter()
            .find(|e| e.selected)
            .map(|e| e.candidate);
        tracing::debug!(domain, key, provider = winner.as_ref().map(|c| c.provider.as_str()), "candidate resolved");
        winner
    }

    /// Ordered trace of every contender for (domain, key), winner first,
    /// under natural precedence (tiers 2 through 4; no override applied).
    pub fn explain(&self, domain: &str, key: &str) -> ExplainTrace {
        let trace = self.explain_with_override(domain, key, None);
        tracing::debug!(domain, key, contenders = trace.len(), "candidate explain trace built");
        trace
    }

    fn explain_with_override(
        &self,
        domain: &str,
        key: &str,
        override_provider: Option<&str>,
    ) -> ExplainTrace {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let mut contenders: Vec<Candidate> = inner
            .contenders(domain, key)
            .into_iter()
            .cloned()
            .collect();
        drop(inner);
        drop(guard);

        if contenders.is_empty() {
            return Vec::new();
        }

        let stack_order = &self.env.stack_order;

        if let Some(provider) = override_provider {
            if let Some(pos) = contenders.iter().position(|c| c.provider == provider) {
                let winner = contenders.remove(pos);
                let mut trace = vec![ExplainEntry {
                    candidate: winner.clone(),
                    selected: true,
                    lost_on: None,
                }];
                for other in contenders {
                    trace.push(ExplainEntry {
                        candidate: other,
                        selected: false,
                        lost_on: Some(LossTier::Override),
                    });
                }
                return trace;
            }
            // Override names a provider that is not registered: fall
            // through to natural precedence rather than returning nothing,
            // so `resolve` with an unknown override still reports a usable
            // trace for diagnostics.
        }

        contenders.sort_by(|a, b| rank_key(b, stack_order).cmp(&rank_key(a, stack_order)));
        let winner = contenders[0].clone();
        let mut trace = vec![ExplainEntry {
            candidate: winner.clone(),
            selected: true,
            lost_on: None,
        }];
        for other in contenders.into_iter().skip(1) {
            let tier = loss_tier(&winner, &other, stack_order);
            trace.push(ExplainEntry {
                candidate: other,
                selected: false,
                lost_on: Some(tier),
            });
        }
        trace
    }

    /// Every currently-active candidate, optionally filtered to one domain.
    pub fn list_active(&self, domain: Option<&str>) -> Vec<Candidate> {
        let keys = self.domain_keys(domain);
        keys.into_iter()
            .filter_map(|(d, k)| self.resolve(&d, &k, None))
            .collect()
    }

    /// Every shadowed (registered but not active) candidate, optionally
    /// filtered to one domain.
    pub fn list_shadowed(&self, domain: Option<&str>) -> Vec<Candidate> {
        let keys = self.domain_keys(domain);
        keys.into_iter()
            .flat_map(|(d, k)| {
                let trace = self.explain(&d, &k);
                trace.into_iter().filter(|e| !e.selected).map(|e| e.candidate)
            })
            .collect()
    }

    fn domain_keys(&self, domain: Option<&str>) -> Vec<(String, String)> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let mut seen = std::collections::BTreeSet::new();
        for candidate in inner.candidates.values() {
            if domain.map(|d| d == candidate.domain).unwrap_or(true) {
                seen.insert((candidate.domain.clone(), candidate.key.clone()));
            }
        }
        seen.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn candidate(domain: &str, key: &str, provider: &str, stack_level: i64, source: &str) -> Candidate {
        Candidate {
            domain: domain.to_string(),
            key: key.to_string(),
            provider: provider.to_string(),
            factory: format!("factories.{provider}"),
            stack_level,
            priority: 0,
            sequence: 0,
            source: source.to_string(),
            version: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn stack_level_breaks_ties_and_memory_is_shadowed() {
        let registry = Registry::new(Environment::permissive());
        registry.register(candidate("adapter", "cache", "memory", 0, "local"));
        registry.register(candidate("adapter", "cache", "redis", 10, "local"));

        let resolved = registry.resolve("adapter", "cache", None).unwrap();
        assert_eq!(resolved.provider, "redis");

        let trace = registry.explain("adapter", "cache");
        assert_eq!(trace[0].candidate.provider, "redis");
        assert!(trace[0].selected);
        assert_eq!(trace[1].candidate.provider, "memory");
        assert_eq!(trace[1].lost_on, Some(LossTier::StackLevel));

        let shadowed = registry.list_shadowed(Some("adapter"));
        assert_eq!(shadowed.len(), 1);
        assert_eq!(shadowed[0].provider, "memory");
    }

    #[test]
    fn registration_order_breaks_remaining_ties() {
        let registry = Registry::new(Environment::permissive());
        registry.register(candidate("service", "status", "v1", 0, "local"));
        registry.register(candidate("service", "status", "v2", 0, "local"));
        let trace = registry.explain("service", "status");
        assert_eq!(trace[0].candidate.provider, "v2");
        assert_eq!(trace[1].lost_on, Some(LossTier::RegistrationOrder));
    }

    #[test]
    fn explicit_override_wins_unconditionally() {
        let registry = Registry::new(Environment::permissive());
        registry.register(candidate("service", "status", "v1", 0, "local"));
        registry.register(candidate("service", "status", "v2", 99, "local"));
        let resolved = registry.resolve("service", "status", Some("v1")).unwrap();
        assert_eq!(resolved.provider, "v1");
    }

    #[test]
    fn resolving_unknown_pair_returns_none() {
        let registry = Registry::new(Environment::permissive());
        assert!(registry.resolve("adapter", "nope", None).is_none());
    }

    #[test]
    fn reregistering_same_identity_keeps_latest_sequence() {
        let registry = Registry::new(Environment::permissive());
        let first = registry.register(candidate("adapter", "cache", "memory", 0, "local"));
        let second = registry.register(candidate("adapter", "cache", "memory", 0, "local"));
        assert!(second.sequence > first.sequence);
        assert_eq!(registry.explain("adapter", "cache").len(), 1);
    }

    #[test]
    fn concurrent_registration_assigns_dense_unique_sequences() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(Registry::new(Environment::permissive()));
        let mut handles = Vec::new();
        for t in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    registry.register(candidate(
                        "adapter",
                        "cache",
                        &format!("p{t}-{i}"),
                        0,
                        "local",
                    ));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut sequences: Vec<u64> = registry
            .list_shadowed(None)
            .into_iter()
            .chain(registry.list_active(None))
            .map(|c| c.sequence)
            .collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 1600);
    }
}
