//! Trigger registry scoped to one graph instance.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Serialize, Serializer};

use rapport_types::{RapportError, Result};

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh graph scope id.
pub(crate) fn next_scope() -> u64 {
    NEXT_SCOPE.fetch_add(1, Ordering::Relaxed)
}

/// A named trigger. Two triggers are equal only if they share a name and were
/// created by the same graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trigger {
    scope: u64,
    name: Arc<str>,
}

impl Trigger {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> u64 {
        self.scope
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for Trigger {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

/// The triggers declared by one graph.
#[derive(Debug, Clone)]
pub struct TriggerSet {
    scope: u64,
    by_name: BTreeMap<String, Trigger>,
}

impl TriggerSet {
    pub(crate) fn new(scope: u64, names: impl IntoIterator<Item = String>) -> Self {
        let by_name = names
            .into_iter()
            .map(|name| {
                let trigger = Trigger {
                    scope,
                    name: Arc::from(name.as_str()),
                };
                (name, trigger)
            })
            .collect();
        Self { scope, by_name }
    }

    /// Look up a trigger by name.
    pub fn get(&self, name: &str) -> Result<Trigger> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RapportError::UnknownTrigger {
                name: name.to_string(),
            })
    }

    /// Whether `trigger` was issued by this set.
    pub fn contains(&self, trigger: &Trigger) -> bool {
        trigger.scope == self.scope && self.by_name.contains_key(trigger.name())
    }

    /// Reject triggers minted by a different graph.
    pub fn check(&self, trigger: &Trigger) -> Result<()> {
        if self.contains(trigger) {
            Ok(())
        } else {
            Err(RapportError::UnknownTrigger {
                name: trigger.name().to_string(),
            })
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
