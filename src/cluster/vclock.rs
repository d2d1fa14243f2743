//! Vector clocks and read-side reconciliation
//!
//! One clock tracks causality for two different things here: the version
//! of a stored value and the version of the membership state itself. Both
//! rely on the same partial order, so both live in this module.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from actor id to a monotonic counter. Counters only ever grow;
/// merging takes the elementwise max.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Same actors, same counters.
    Equal,
    /// `self` happened-before `other`.
    Less,
    /// `self` happened-after `other`.
    Greater,
    /// Neither dominates.
    Concurrent,
}

impl VectorClock {
    /// Empty clock, dominated by every non-empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock with a single entry `{actor: 1}`.
    pub fn create(actor: &str) -> Self {
        let mut counters = BTreeMap::new();
        counters.insert(actor.to_string(), 1);
        Self { counters }
    }

    /// Copy of this clock with `actor`'s counter bumped by one, creating the
    /// entry if absent.
    pub fn increment(&self, actor: &str) -> Self {
        let mut next = self.clone();
        let counter = next.counters.entry(actor.to_string()).or_insert(0);
        // counters must never wrap; a regressed counter is unrecoverable
        *counter = counter
            .checked_add(1)
            .unwrap_or_else(|| panic!("vector clock counter overflow for actor {}", actor));
        next
    }

    /// Counter for one actor, zero if absent.
    pub fn counter(&self, actor: &str) -> u64 {
        self.counters.get(actor).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Causal comparison by the usual partial order: absent entries count
    /// as zero.
    pub fn compare(&self, other: &Self) -> Causality {
        let mut less = false;
        let mut greater = false;

        for (actor, &left) in &self.counters {
            let right = other.counter(actor);
            if left < right {
                less = true;
            } else if left > right {
                greater = true;
            }
        }
        for (actor, &right) in &other.counters {
            if self.counter(actor) < right {
                less = true;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Less,
            (false, true) => Causality::Greater,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Elementwise max over the union of actors.
    pub fn merge(&self, other: &Self) -> Self {
        let mut counters = self.counters.clone();
        for (actor, &count) in &other.counters {
            let entry = counters.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        Self { counters }
    }
}

/// A stored value plus the clock that versions it. Storage keeps these
/// opaque; only the mediator looks at the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub clock: VectorClock,
    pub value: Vec<u8>,
}

/// Outcome of read reconciliation: either one causally dominant value, or
/// the mutually concurrent siblings the caller must preserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Single(VersionedValue),
    Siblings(Vec<VersionedValue>),
}

impl Resolution {
    /// All values in the resolution, dominant-or-first first.
    pub fn into_values(self) -> Vec<VersionedValue> {
        match self {
            Resolution::Single(v) => vec![v],
            Resolution::Siblings(vs) => vs,
        }
    }
}

/// Reconcile two candidate values: the dominant one wins, equal clocks pick
/// `a`, concurrent clocks keep both.
pub fn resolve(a: VersionedValue, b: VersionedValue) -> Resolution {
    match a.clock.compare(&b.clock) {
        Causality::Equal | Causality::Greater => Resolution::Single(a),
        Causality::Less => Resolution::Single(b),
        Causality::Concurrent => Resolution::Siblings(vec![a, b]),
    }
}

/// Fold [`resolve`] across a reply set, starting from the first (preferred
/// replica) reply. Dominated values drop out; concurrent survivors are
/// returned together.
///
/// # Panics
/// Panics when `values` is empty; callers check quorum first.
pub fn reconcile(values: Vec<VersionedValue>) -> Resolution {
    assert!(!values.is_empty(), "reconcile requires at least one value");

    let mut frontier: Vec<VersionedValue> = Vec::new();
    for candidate in values {
        let mut dominated = false;
        frontier.retain(|kept| match kept.clock.compare(&candidate.clock) {
            Causality::Less => false,
            Causality::Equal | Causality::Greater => {
                dominated = true;
                true
            }
            Causality::Concurrent => true,
        });
        if !dominated {
            frontier.push(candidate);
        }
    }

    if frontier.len() == 1 {
        Resolution::Single(frontier.into_iter().next().unwrap())
    } else {
        Resolution::Siblings(frontier)
    }
}
