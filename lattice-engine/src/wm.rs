use lattice_facts::{Fact, FactId};
use std::collections::{BTreeMap, HashMap};

/// What happens when a structurally identical fact is asserted twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Re-assertion returns the existing fact id (the default).
    Coalesce,
    /// Every assertion gets a fresh id.
    Allow,
}

/// The authoritative fact store. Assigns monotonically increasing ids;
/// signalling into the network is the engine's job and happens FIFO from a
/// single writer.
#[derive(Debug)]
pub struct WorkingMemory {
    facts: BTreeMap<FactId, Fact>,
    index: HashMap<Fact, FactId>,
    policy: DuplicatePolicy,
    next: u64,
}

impl WorkingMemory {
    pub fn new(policy: DuplicatePolicy) -> Self {
        WorkingMemory {
            facts: BTreeMap::new(),
            index: HashMap::new(),
            policy,
            next: 1,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Store a fact. Returns the id and whether it is a fresh entry (false
    /// means a coalesced duplicate).
    pub fn insert(&mut self, fact: Fact) -> (FactId, bool) {
        if self.policy == DuplicatePolicy::Coalesce {
            if let Some(existing) = self.index.get(&fact) {
                return (*existing, false);
            }
        }
        let id = FactId(self.next);
        self.next += 1;
        if self.policy == DuplicatePolicy::Coalesce {
            self.index.insert(fact.clone(), id);
        }
        self.facts.insert(id, fact);
        (id, true)
    }

    pub fn remove(&mut self, id: FactId) -> Option<Fact> {
        let fact = self.facts.remove(&id)?;
        if self.policy == DuplicatePolicy::Coalesce {
            self.index.remove(&fact);
        }
        Some(fact)
    }

    pub fn get(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(&id)
    }

    pub fn contains(&self, id: FactId) -> bool {
        self.facts.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactId, &Fact)> {
        self.facts.iter().map(|(id, fact)| (*id, fact))
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Discard every fact and restart the id counter at 1.
    pub fn reset(&mut self) {
        self.facts.clear();
        self.index.clear();
        self.next = 1;
    }
}
