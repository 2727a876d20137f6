use crate::arena::{NodeId, TokenId};
use chrono::{DateTime, Utc};
use lattice_facts::{FactId, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// A rule instance ready to fire, keyed by `(rule, matched fact tuple)`.
#[derive(Clone, Debug)]
pub struct Activation {
    /// Qualified rule name.
    pub rule: String,
    pub production: NodeId,
    pub token: TokenId,
    /// Fact ids in LHS pattern order.
    pub matched_facts: Vec<FactId>,
    /// Variable bindings materialized from the token.
    pub bindings: BTreeMap<String, Value>,
    pub salience: i64,
    /// Assertion recency: the highest fact id in the tuple.
    pub recency: u64,
    /// Rule registration order, the final tiebreak.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// Conflict resolution: a strict total order over activations. The
/// greatest activation fires first.
pub trait ConflictStrategy: Send + Sync {
    fn compare(&self, a: &Activation, b: &Activation) -> Ordering;
}

/// Default strategy: salience descending, then assertion recency
/// descending, then rule registration order.
pub struct SalienceRecency;

impl ConflictStrategy for SalienceRecency {
    fn compare(&self, a: &Activation, b: &Activation) -> Ordering {
        a.salience
            .cmp(&b.salience)
            .then(a.recency.cmp(&b.recency))
            .then(b.seq.cmp(&a.seq))
    }
}

/// The conflict set. Dedup is structural on `(rule, ordered fact tuple)`;
/// the dedup entry lives as long as the owning production token, so a fired
/// activation is not re-derived while its match stands.
#[derive(Default)]
pub struct Agenda {
    items: Vec<Activation>,
    dedup: HashMap<(String, Vec<FactId>), TokenId>,
    by_token: HashMap<TokenId, (String, Vec<FactId>)>,
}

impl Agenda {
    pub(crate) fn new() -> Self {
        Agenda::default()
    }

    pub fn items(&self) -> &[Activation] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn try_insert(&mut self, activation: Activation) -> bool {
        let key = (activation.rule.clone(), activation.matched_facts.clone());
        if self.dedup.contains_key(&key) {
            return false;
        }
        self.dedup.insert(key.clone(), activation.token);
        self.by_token.insert(activation.token, key);
        self.items.push(activation);
        true
    }

    /// Remove whatever the death of `token` invalidates. Returns the dedup
    /// key if the token owned one.
    pub(crate) fn remove_token(&mut self, token: TokenId) -> Option<(String, Vec<FactId>)> {
        let key = self.by_token.remove(&token)?;
        self.dedup.remove(&key);
        self.items.retain(|a| a.token != token);
        Some(key)
    }

    /// Remove and return the next activation per the strategy. The dedup
    /// entry stays until the owning token dies (refraction).
    pub(crate) fn pop(&mut self, strategy: &dyn ConflictStrategy) -> Option<Activation> {
        if self.items.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..self.items.len() {
            if strategy.compare(&self.items[i], &self.items[best]) == Ordering::Greater {
                best = i;
            }
        }
        Some(self.items.remove(best))
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.dedup.clear();
        self.by_token.clear();
    }
}
