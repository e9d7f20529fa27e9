//! Process-wide configuration passed explicitly to component constructors.
//!
//! The spec's design notes call out that "global mutable state (process-wide
//! stack-order config, trusted keys, factory allowlist) should be
//! represented as an explicit `Environment` value passed to component
//! constructors rather than global singletons" — this module is that value.
//! Nothing here is a `static`/`OnceLock`; every component that needs one of
//! these facts takes an `Environment` (or a clone of one of its fields) at
//! construction time.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use crate::safety::TrustedKeySet;

/// `(source_label, priority)` pairs from `stack_order`, consulted at
/// precedence tier 2 (inferred priority).
#[derive(Debug, Clone, Default)]
pub struct StackOrder {
    priorities: BTreeMap<String, i64>,
}

impl StackOrder {
    pub fn new(entries: impl IntoIterator<Item = (String, i64)>) -> Self {
        Self {
            priorities: entries.into_iter().collect(),
        }
    }

    /// Inferred priority for a candidate's source label, if the stack order
    /// names it. Tier 2 applies only when this returns `Some`.
    pub fn priority_for(&self, source: &str) -> Option<i64> {
        self.priorities.get(source).copied()
    }

    /// Parse `ONEIRIC_STACK_ORDER`: either `name:priority` pairs, or a plain
    /// comma-separated ordering (`name,name,...`) where earlier entries get
    /// higher synthetic priority.
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let has_explicit_priority = parts.iter().any(|p| p.contains(':'));
        let mut priorities = BTreeMap::new();
        if has_explicit_priority {
            for part in parts {
                if let Some((name, priority)) = part.split_once(':') {
                    if let Ok(priority) = priority.trim().parse::<i64>() {
                        priorities.insert(name.trim().to_string(), priority);
                    }
                }
            }
        } else {
            let total = parts.len() as i64;
            for (idx, name) in parts.into_iter().enumerate() {
                priorities.insert(name.to_string(), total - idx as i64);
            }
        }
        Self { priorities }
    }
}

/// Compiled allowlist of factory-reference patterns. A factory reference not
/// matching any pattern is rejected at activation time with
/// `OneiricError::FactoryForbidden`; this is a startup-time concern only, no
/// code executes before the check.
#[derive(Debug, Clone, Default)]
pub struct FactoryAllowlist {
    patterns: Vec<Regex>,
}

impl FactoryAllowlist {
    /// Compile a set of glob-like patterns (`*` matches any run of
    /// identifier characters, mirroring the dotted-path globs in the spec's
    /// examples such as `"mypkg.adapters.*"`) into anchored regexes.
    pub fn compile(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let compiled = patterns
            .into_iter()
            .filter_map(|pattern| {
                let pattern = pattern.as_ref();
                let escaped = regex::escape(pattern).replace(r"\*", ".*");
                Regex::new(&format!("^{escaped}$")).ok()
            })
            .collect();
        Self { patterns: compiled }
    }

    pub fn allows(&self, factory_ref: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(factory_ref))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The explicit, passed-around environment every component constructor
/// takes instead of reaching for global state.
#[derive(Clone)]
pub struct Environment {
    pub stack_order: Arc<StackOrder>,
    pub trusted_keys: Arc<TrustedKeySet>,
    pub factory_allowlist: Arc<FactoryAllowlist>,
}

impl Environment {
    pub fn new(
        stack_order: StackOrder,
        trusted_keys: TrustedKeySet,
        factory_allowlist: FactoryAllowlist,
    ) -> Self {
        Self {
            stack_order: Arc::new(stack_order),
            trusted_keys: Arc::new(trusted_keys),
            factory_allowlist: Arc::new(factory_allowlist),
        }
    }

    /// An environment with no stack order, no trusted keys and an allowlist
    /// that permits everything — useful for tests that do not exercise
    /// remote manifests or the factory allowlist.
    pub fn permissive() -> Self {
        Self {
            stack_order: Arc::new(StackOrder::default()),
            trusted_keys: Arc::new(TrustedKeySet::default()),
            factory_allowlist: Arc::new(FactoryAllowlist::compile(["*"])),
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("stack_order", &self.stack_order.priorities)
            .field("trusted_key_count", &self.trusted_keys.len())
            .field("factory_allowlist_empty", &self.factory_allowlist.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_order_parses_explicit_priorities() {
        let order = StackOrder::parse("plugin:10, local:5,remote:1");
        assert_eq!(order.priority_for("plugin"), Some(10));
        assert_eq!(order.priority_for("local"), Some(5));
        assert_eq!(order.priority_for("remote"), Some(1));
        assert_eq!(order.priority_for("unknown"), None);
    }

    #[test]
    fn stack_order_parses_plain_ordering() {
        let order = StackOrder::parse("plugin,local,remote");
        assert!(order.priority_for("plugin") > order.priority_for("local"));
        assert!(order.priority_for("local") > order.priority_for("remote"));
    }

    #[test]
    fn factory_allowlist_matches_glob_suffix() {
        let allow = FactoryAllowlist::compile(["mypkg.adapters.*"]);
        assert!(allow.allows("mypkg.adapters.redis"));
        assert!(!allow.allows("otherpkg.adapters.redis"));
    }
}
