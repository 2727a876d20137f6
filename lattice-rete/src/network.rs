use crate::agenda::{Activation, Agenda, ConflictStrategy};
use crate::alpha::{AlphaMemory, AlphaNode, AlphaShapeRoot, AlphaTest, ShapeKey};
use crate::arena::{AlphaMemId, AlphaNodeId, NodeId, Slab, TokenId};
use crate::error::ReteError;
use crate::node::{
    BetaArg, BetaPredicate, FieldRef, JoinTest, Node, NodeKind, ProductionInfo, ProductionSpec,
};
use crate::token::{Token, Wme};
use chrono::Utc;
use lattice_facts::{Fact, FactId, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Synchronous observer of network mutations, for tracing. Observers are
/// notified in registration order and must not mutate the network from
/// within a callback.
pub trait NetworkObserver {
    fn wme_added(&self, _fact: FactId) {}
    fn wme_removed(&self, _fact: FactId) {}
    fn node_removed(&self, _node: NodeId) {}
    fn activation_added(&self, _activation: &Activation) {}
    fn activation_removed(&self, _rule: &str, _facts: &[FactId]) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tag {
    Memory,
    Join,
    Negative,
    Ncc,
    Partner,
    Test,
    Production,
}

#[derive(Clone, Copy, Debug)]
enum BuiltItem {
    Node(NodeId),
    Memory(AlphaMemId),
}

/// Diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub nodes: usize,
    pub tokens: usize,
    pub wmes: usize,
    pub alpha_memories: usize,
    pub activations: usize,
}

/// The discrimination network of one engine session.
pub struct ReteNetwork {
    nodes: Slab<Node>,
    tokens: Slab<Token>,
    wmes: HashMap<FactId, Wme>,
    alpha_nodes: Slab<AlphaNode>,
    alpha_mems: Slab<AlphaMemory>,
    alpha_roots: HashMap<ShapeKey, AlphaShapeRoot>,
    dummy_node: NodeId,
    dummy_token: TokenId,
    agenda: Agenda,
    observers: Vec<Box<dyn NetworkObserver>>,
    build_log: Vec<BuiltItem>,
    building: bool,
}

impl ReteNetwork {
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let mut tokens = Slab::new();
        let dummy_node = NodeId(nodes.insert(Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::BetaMemory { tokens: Vec::new() },
        }));
        let dummy_token = TokenId(tokens.insert(Token {
            parent: None,
            wme: None,
            node: dummy_node,
            children: Vec::new(),
            ncc_results: Vec::new(),
            ncc_owner: None,
            neg_matches: 0,
        }));
        if let NodeKind::BetaMemory { tokens: items } = &mut nodes.get_mut(dummy_node.0).kind {
            items.push(dummy_token);
        }
        ReteNetwork {
            nodes,
            tokens,
            wmes: HashMap::new(),
            alpha_nodes: Slab::new(),
            alpha_mems: Slab::new(),
            alpha_roots: HashMap::new(),
            dummy_node,
            dummy_token,
            agenda: Agenda::new(),
            observers: Vec::new(),
            build_log: Vec::new(),
            building: false,
        }
    }

    pub fn dummy_node(&self) -> NodeId {
        self.dummy_node
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub fn pop_activation(&mut self, strategy: &dyn ConflictStrategy) -> Option<Activation> {
        self.agenda.pop(strategy)
    }

    pub fn add_observer(&mut self, observer: Box<dyn NetworkObserver>) {
        self.observers.push(observer);
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            nodes: self.nodes.len(),
            tokens: self.tokens.len(),
            wmes: self.wmes.len(),
            alpha_memories: self.alpha_mems.len(),
            activations: self.agenda.len(),
        }
    }

    // ── Handle access ────────────────────────────────────────────────────

    fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id.0)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id.0)
    }

    fn token(&self, id: TokenId) -> &Token {
        self.tokens.get(id.0)
    }

    fn token_mut(&mut self, id: TokenId) -> &mut Token {
        self.tokens.get_mut(id.0)
    }

    fn tag(&self, id: NodeId) -> Tag {
        match &self.node(id).kind {
            NodeKind::BetaMemory { .. } => Tag::Memory,
            NodeKind::Join { .. } => Tag::Join,
            NodeKind::Negative { .. } => Tag::Negative,
            NodeKind::Ncc { .. } => Tag::Ncc,
            NodeKind::NccPartner { .. } => Tag::Partner,
            NodeKind::Test { .. } => Tag::Test,
            NodeKind::Production(_) => Tag::Production,
        }
    }

    fn node_tokens_mut(&mut self, id: NodeId) -> &mut Vec<TokenId> {
        match &mut self.node_mut(id).kind {
            NodeKind::BetaMemory { tokens }
            | NodeKind::Negative { tokens, .. }
            | NodeKind::Ncc { tokens, .. }
            | NodeKind::NccPartner { tokens, .. }
            | NodeKind::Test { tokens, .. } => tokens,
            NodeKind::Production(info) => &mut info.tokens,
            NodeKind::Join { .. } => unreachable!("join nodes store no tokens"),
        }
    }

    /// Tokens a downstream join may iterate: gated tokens of negative and
    /// NCC nodes are invisible.
    fn visible_tokens(&self, id: NodeId) -> Vec<TokenId> {
        match &self.node(id).kind {
            NodeKind::BetaMemory { tokens } | NodeKind::Test { tokens, .. } => tokens.clone(),
            NodeKind::Negative { tokens, .. } => tokens
                .iter()
                .copied()
                .filter(|t| self.token(*t).neg_matches == 0)
                .collect(),
            NodeKind::Ncc { tokens, .. } => tokens
                .iter()
                .copied()
                .filter(|t| self.token(*t).ncc_results.is_empty())
                .collect(),
            _ => unreachable!("node has no token store"),
        }
    }

    // ── Alpha network ────────────────────────────────────────────────────

    /// Find or build the alpha memory for a filter chain, sharing every
    /// coinciding prefix. A fresh memory is backfilled from the WMEs
    /// already in the network.
    pub fn build_or_share_alpha_memory(
        &mut self,
        shape: ShapeKey,
        tests: &[AlphaTest],
    ) -> Result<AlphaMemId, ReteError> {
        self.alpha_roots.entry(shape.clone()).or_default();

        let mut parent: Option<AlphaNodeId> = None;
        for test in tests {
            let children = match parent {
                None => self.alpha_roots[&shape].children.clone(),
                Some(p) => self.alpha_nodes.get(p.0).children.clone(),
            };
            let found = children
                .into_iter()
                .find(|c| self.alpha_nodes.get(c.0).test == *test);
            let next = match found {
                Some(existing) => existing,
                None => {
                    let id = AlphaNodeId(self.alpha_nodes.insert(AlphaNode {
                        test: test.clone(),
                        parent,
                        shape: shape.clone(),
                        children: Vec::new(),
                        memory: None,
                    }));
                    match parent {
                        None => self
                            .alpha_roots
                            .get_mut(&shape)
                            .expect("root created above")
                            .children
                            .push(id),
                        Some(p) => self.alpha_nodes.get_mut(p.0).children.push(id),
                    }
                    id
                }
            };
            parent = Some(next);
        }

        let existing = match parent {
            None => self.alpha_roots[&shape].memory,
            Some(p) => self.alpha_nodes.get(p.0).memory,
        };
        if let Some(mem) = existing {
            trace!(?mem, "shared alpha memory");
            return Ok(mem);
        }

        let mem = AlphaMemId(self.alpha_mems.insert(AlphaMemory {
            wmes: Vec::new(),
            successors: Vec::new(),
            node: parent,
            shape: shape.clone(),
        }));
        match parent {
            None => {
                self.alpha_roots
                    .get_mut(&shape)
                    .expect("root created above")
                    .memory = Some(mem)
            }
            Some(p) => self.alpha_nodes.get_mut(p.0).memory = Some(mem),
        }
        if self.building {
            self.build_log.push(BuiltItem::Memory(mem));
        }
        debug!(?mem, ?shape, "built alpha memory");

        // Backfill from existing working memory, in assertion order.
        let mut ids: Vec<FactId> = self.wmes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let fact = self.wmes[&id].fact.clone();
            if ShapeKey::of(&fact) != shape {
                continue;
            }
            let mut passes = true;
            for test in tests {
                let admitted = match fact.field(test.field) {
                    Some(value) => test.test.matches(value)?,
                    None => false,
                };
                if !admitted {
                    passes = false;
                    break;
                }
            }
            if passes {
                self.alpha_mems.get_mut(mem.0).wmes.push(id);
                self.wmes
                    .get_mut(&id)
                    .expect("wme present")
                    .alpha_mems
                    .push(mem);
            }
        }
        Ok(mem)
    }

    fn collect_alpha_matches(
        &self,
        node: AlphaNodeId,
        fact: &Fact,
        out: &mut Vec<AlphaMemId>,
    ) -> Result<(), ReteError> {
        let n = self.alpha_nodes.get(node.0);
        let admitted = match fact.field(n.test.field) {
            Some(value) => n.test.test.matches(value)?,
            None => false,
        };
        if !admitted {
            return Ok(());
        }
        if let Some(mem) = n.memory {
            out.push(mem);
        }
        for child in &n.children {
            self.collect_alpha_matches(*child, fact, out)?;
        }
        Ok(())
    }

    // ── Working-memory entry points ──────────────────────────────────────

    /// Signal a fresh fact into the network. Returns once the network has
    /// quiesced.
    pub fn add_wme(&mut self, id: FactId, fact: &Fact) -> Result<(), ReteError> {
        assert!(
            !self.wmes.contains_key(&id),
            "fact signalled into the network twice"
        );
        debug!(%id, fact = %fact, "wme add");
        self.wmes.insert(
            id,
            Wme {
                fact: fact.clone(),
                alpha_mems: Vec::new(),
                tokens: Vec::new(),
            },
        );

        let shape = ShapeKey::of(fact);
        let mut matched = Vec::new();
        if let Some(root) = self.alpha_roots.get(&shape) {
            if let Some(mem) = root.memory {
                matched.push(mem);
            }
            for child in root.children.clone() {
                self.collect_alpha_matches(child, fact, &mut matched)?;
            }
        }

        for mem in matched {
            trace!(?mem, %id, "alpha memory admits wme");
            self.alpha_mems.get_mut(mem.0).wmes.push(id);
            self.wmes
                .get_mut(&id)
                .expect("wme inserted above")
                .alpha_mems
                .push(mem);
            for succ in self.alpha_mems.get(mem.0).successors.clone() {
                self.right_activate(succ, id, None)?;
            }
        }

        for obs in &self.observers {
            obs.wme_added(id);
        }
        Ok(())
    }

    /// Withdraw a fact. Walks the topology in reverse: alpha memberships
    /// first, then the dependent token subtrees, then the negative-node
    /// counters the disappearance unblocks.
    pub fn remove_wme(&mut self, id: FactId) -> Result<(), ReteError> {
        let wme = self.wmes.get(&id).expect("removing unknown wme");
        let fact = wme.fact.clone();
        let mems = wme.alpha_mems.clone();
        debug!(%id, "wme remove");

        let mut negatives = Vec::new();
        for mem in &mems {
            self.alpha_mems.get_mut(mem.0).wmes.retain(|w| *w != id);
            for succ in self.alpha_mems.get(mem.0).successors.clone() {
                if self.tag(succ) == Tag::Negative {
                    negatives.push(succ);
                }
            }
        }

        loop {
            let Some(&tok) = self.wmes.get(&id).and_then(|w| w.tokens.first()) else {
                break;
            };
            self.delete_token_and_descendants(tok)?;
        }

        for node in negatives {
            let tokens = match &self.node(node).kind {
                NodeKind::Negative { tokens, .. } => tokens.clone(),
                _ => unreachable!(),
            };
            let tests = self.negative_tests(node);
            for tok in tokens {
                if self.pair_tests_pass(&tests, tok, id, Some(&fact))? {
                    let t = self.token_mut(tok);
                    debug_assert!(t.neg_matches > 0, "negative counter underflow");
                    t.neg_matches -= 1;
                    if t.neg_matches == 0 {
                        for child in self.node(node).children.clone() {
                            self.left_activate(child, tok, None)?;
                        }
                    }
                }
            }
        }

        self.wmes.remove(&id);
        for obs in &self.observers {
            obs.wme_removed(id);
        }
        Ok(())
    }

    /// Discard all facts, tokens, memories and activations while keeping
    /// the compiled nodes, then re-seed the dummy token so that
    /// empty-prefix chains (negated-first rules, unconditional rules)
    /// re-derive their matches.
    pub fn reset_memories(&mut self) -> Result<(), ReteError> {
        self.agenda.clear();
        self.tokens.clear();
        self.wmes.clear();
        for mem in self.alpha_mems.iter_mut() {
            mem.wmes.clear();
        }
        for node in self.nodes.iter_mut() {
            match &mut node.kind {
                NodeKind::BetaMemory { tokens }
                | NodeKind::Negative { tokens, .. }
                | NodeKind::Ncc { tokens, .. }
                | NodeKind::Test { tokens, .. } => tokens.clear(),
                NodeKind::NccPartner { tokens, buffer, .. } => {
                    tokens.clear();
                    buffer.clear();
                }
                NodeKind::Production(info) => info.tokens.clear(),
                NodeKind::Join { .. } => {}
            }
        }

        let dummy_token = TokenId(self.tokens.insert(Token {
            parent: None,
            wme: None,
            node: self.dummy_node,
            children: Vec::new(),
            ncc_results: Vec::new(),
            ncc_owner: None,
            neg_matches: 0,
        }));
        self.dummy_token = dummy_token;
        self.node_tokens_mut(self.dummy_node).push(dummy_token);
        for child in self.node(self.dummy_node).children.clone() {
            self.left_activate(child, self.dummy_token, None)?;
        }
        Ok(())
    }

    // ── Binding resolution and tests ─────────────────────────────────────

    /// Resolve a binding address against the virtual token `(t, w)`:
    /// level 0 is `w`, level k walks k-1 parents up from `t` and reads that
    /// token's WME.
    fn resolve_field(
        &self,
        t: TokenId,
        w: Option<FactId>,
        levels_up: usize,
        field: &FieldRef,
    ) -> Value {
        let fact_id = if levels_up == 0 {
            w
        } else {
            let mut tok = t;
            for _ in 1..levels_up {
                tok = self
                    .token(tok)
                    .parent
                    .expect("binding address walks past the root");
            }
            self.token(tok).wme
        };
        let fact_id = fact_id.expect("binding address resolves to an empty level");
        match field {
            FieldRef::Fact => Value::Integer(fact_id.0 as i64),
            FieldRef::Pos(index) => self
                .wmes
                .get(&fact_id)
                .expect("dangling wme reference")
                .fact
                .field(*index)
                .expect("field index outside pattern range")
                .clone(),
        }
    }

    fn eval_beta_predicate(
        &self,
        predicate: &BetaPredicate,
        t: TokenId,
        w: Option<FactId>,
    ) -> Result<bool, ReteError> {
        let args: Vec<Value> = predicate
            .args
            .iter()
            .map(|arg| match arg {
                BetaArg::Const(value) => value.clone(),
                BetaArg::Binding(addr) => self.resolve_field(t, w, addr.levels_up, &addr.field),
            })
            .collect();
        (predicate.handler)(&args)
            .map(|value| value.is_truthy())
            .map_err(|message| ReteError::Predicate {
                name: predicate.name.clone(),
                message,
            })
    }

    /// Evaluate join tests against the virtual token `(t, w)`.
    ///
    /// `removed` carries the fact body when `w` is mid-retraction and no
    /// longer guaranteed to resolve through the registry.
    fn pair_tests_pass(
        &self,
        tests: &[JoinTest],
        t: TokenId,
        w: FactId,
        removed: Option<&Fact>,
    ) -> Result<bool, ReteError> {
        let own_fact = match removed {
            Some(fact) => fact,
            None => &self.wmes.get(&w).expect("dangling wme reference").fact,
        };
        for test in tests {
            let pass = match test {
                JoinTest::Compare {
                    own_field,
                    levels_up,
                    other_field,
                    op,
                } => {
                    let own = own_fact
                        .field(*own_field)
                        .expect("field index outside pattern range");
                    if *levels_up == 0 {
                        let other = own_fact
                            .field(*other_field)
                            .expect("field index outside pattern range");
                        op.apply(own, other)
                    } else {
                        let other =
                            self.resolve_field(t, Some(w), *levels_up, &FieldRef::Pos(*other_field));
                        op.apply(own, &other)
                    }
                }
                JoinTest::Predicate(predicate) => {
                    self.eval_beta_predicate(predicate, t, Some(w))?
                }
            };
            if !pass {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn join_tests(&self, node: NodeId) -> Vec<JoinTest> {
        match &self.node(node).kind {
            NodeKind::Join { tests, .. } => tests.clone(),
            _ => unreachable!("not a join node"),
        }
    }

    fn negative_tests(&self, node: NodeId) -> Vec<JoinTest> {
        match &self.node(node).kind {
            NodeKind::Negative { tests, .. } => tests.clone(),
            _ => unreachable!("not a negative node"),
        }
    }

    // ── Token bookkeeping ────────────────────────────────────────────────

    fn make_token(&mut self, node: NodeId, parent: TokenId, wme: Option<FactId>) -> TokenId {
        let id = TokenId(self.tokens.insert(Token {
            parent: Some(parent),
            wme,
            node,
            children: Vec::new(),
            ncc_results: Vec::new(),
            ncc_owner: None,
            neg_matches: 0,
        }));
        self.token_mut(parent).children.push(id);
        if let Some(w) = wme {
            self.wmes
                .get_mut(&w)
                .expect("token built over a dead wme")
                .tokens
                .push(id);
        }
        trace!(token = ?id, ?node, "token created");
        id
    }

    fn delete_token_and_descendants(&mut self, tok: TokenId) -> Result<(), ReteError> {
        while let Some(&child) = self.token(tok).children.first() {
            self.delete_token_and_descendants(child)?;
        }

        let node = self.token(tok).node;
        let tag = self.tag(node);
        self.node_tokens_mut(node).retain(|t| *t != tok);

        match tag {
            Tag::Production => {
                if let Some((rule, facts)) = self.agenda.remove_token(tok) {
                    debug!(%rule, "activation removed");
                    for obs in &self.observers {
                        obs.activation_removed(&rule, &facts);
                    }
                }
            }
            Tag::Ncc => {
                // Unlink the results first so their deletion does not try
                // to re-activate this dying owner.
                let results = std::mem::take(&mut self.token_mut(tok).ncc_results);
                for r in &results {
                    self.token_mut(*r).ncc_owner = None;
                }
                for r in results {
                    self.delete_token_and_descendants(r)?;
                }
            }
            Tag::Partner => match self.token(tok).ncc_owner {
                Some(owner) => {
                    self.token_mut(owner).ncc_results.retain(|r| *r != tok);
                    if self.token(owner).ncc_results.is_empty() {
                        let owner_node = self.token(owner).node;
                        for child in self.node(owner_node).children.clone() {
                            self.left_activate(child, owner, None)?;
                        }
                    }
                }
                None => {
                    if let NodeKind::NccPartner { buffer, .. } = &mut self.node_mut(node).kind {
                        buffer.retain(|r| *r != tok);
                    }
                }
            },
            _ => {}
        }

        let parent = self.token(tok).parent;
        if let Some(p) = parent {
            self.token_mut(p).children.retain(|c| *c != tok);
        }
        if let Some(w) = self.token(tok).wme {
            if let Some(wme) = self.wmes.get_mut(&w) {
                wme.tokens.retain(|c| *c != tok);
            }
        }
        self.tokens.remove(tok.0);
        trace!(token = ?tok, "token deleted");
        Ok(())
    }

    // ── Activation ───────────────────────────────────────────────────────

    /// Left activation: `t` arrives from the left parent, with `w` carried
    /// when the parent is a join passing a matched pair.
    fn left_activate(
        &mut self,
        node: NodeId,
        t: TokenId,
        w: Option<FactId>,
    ) -> Result<(), ReteError> {
        match self.tag(node) {
            Tag::Memory => {
                let tok = self.make_token(node, t, w);
                self.node_tokens_mut(node).push(tok);
                for child in self.node(node).children.clone() {
                    self.left_activate(child, tok, None)?;
                }
            }
            Tag::Join => {
                let alpha = match &self.node(node).kind {
                    NodeKind::Join { alpha, .. } => *alpha,
                    _ => unreachable!(),
                };
                let tests = self.join_tests(node);
                for w_cand in self.alpha_mems.get(alpha.0).wmes.clone() {
                    if self.pair_tests_pass(&tests, t, w_cand, None)? {
                        for child in self.node(node).children.clone() {
                            self.left_activate(child, t, Some(w_cand))?;
                        }
                    }
                }
            }
            Tag::Negative => self.left_activate_negative(node, t, w)?,
            Tag::Ncc => self.left_activate_ncc(node, t, w)?,
            Tag::Partner => self.left_activate_partner(node, t, w)?,
            Tag::Test => {
                let predicate = match &self.node(node).kind {
                    NodeKind::Test { predicate, .. } => predicate.clone(),
                    _ => unreachable!(),
                };
                if self.eval_beta_predicate(&predicate, t, w)? {
                    let tok = self.make_token(node, t, w);
                    self.node_tokens_mut(node).push(tok);
                    for child in self.node(node).children.clone() {
                        self.left_activate(child, tok, None)?;
                    }
                }
            }
            Tag::Production => self.activate_production(node, t, w)?,
        }
        Ok(())
    }

    /// Right activation: a WME arrives from an alpha memory. `only` limits
    /// the fan-out to one child while a new node is being backfilled.
    fn right_activate(
        &mut self,
        node: NodeId,
        w: FactId,
        only: Option<NodeId>,
    ) -> Result<(), ReteError> {
        match self.tag(node) {
            Tag::Join => {
                let parent = self.node(node).parent.expect("join without a left parent");
                let tests = self.join_tests(node);
                for t in self.visible_tokens(parent) {
                    if self.pair_tests_pass(&tests, t, w, None)? {
                        let targets = match only {
                            Some(child) => vec![child],
                            None => self.node(node).children.clone(),
                        };
                        for child in targets {
                            self.left_activate(child, t, Some(w))?;
                        }
                    }
                }
            }
            Tag::Negative => {
                // A fresh right match gates tokens whose counter was zero.
                let tests = self.negative_tests(node);
                let tokens = match &self.node(node).kind {
                    NodeKind::Negative { tokens, .. } => tokens.clone(),
                    _ => unreachable!(),
                };
                for tok in tokens {
                    if self.pair_tests_pass(&tests, tok, w, None)? {
                        let t = self.token_mut(tok);
                        t.neg_matches += 1;
                        if t.neg_matches == 1 {
                            while let Some(&child) = self.token(tok).children.first() {
                                self.delete_token_and_descendants(child)?;
                            }
                        }
                    }
                }
            }
            _ => unreachable!("only join and negative nodes have right parents"),
        }
        Ok(())
    }

    fn left_activate_negative(
        &mut self,
        node: NodeId,
        t: TokenId,
        w: Option<FactId>,
    ) -> Result<(), ReteError> {
        let tok = self.make_token(node, t, w);
        self.node_tokens_mut(node).push(tok);

        let alpha = match &self.node(node).kind {
            NodeKind::Negative { alpha, .. } => *alpha,
            _ => unreachable!(),
        };
        let tests = self.negative_tests(node);
        let mut count = 0;
        for w_cand in self.alpha_mems.get(alpha.0).wmes.clone() {
            if self.pair_tests_pass(&tests, tok, w_cand, None)? {
                count += 1;
            }
        }
        self.token_mut(tok).neg_matches = count;

        if count == 0 {
            for child in self.node(node).children.clone() {
                self.left_activate(child, tok, None)?;
            }
        }
        Ok(())
    }

    fn left_activate_ncc(
        &mut self,
        node: NodeId,
        t: TokenId,
        w: Option<FactId>,
    ) -> Result<(), ReteError> {
        let tok = self.make_token(node, t, w);
        self.node_tokens_mut(node).push(tok);

        let (partner, circuit_len) = match &self.node(node).kind {
            NodeKind::Ncc { partner, .. } => match &self.node(*partner).kind {
                NodeKind::NccPartner { circuit_len, .. } => (*partner, *circuit_len),
                _ => unreachable!("ncc partner handle points elsewhere"),
            },
            _ => unreachable!(),
        };

        // Adopt the buffered subconjunction results belonging to this
        // prefix; unrelated results stay buffered.
        let buffered = match &mut self.node_mut(partner).kind {
            NodeKind::NccPartner { buffer, .. } => std::mem::take(buffer),
            _ => unreachable!(),
        };
        let mut keep = Vec::new();
        for r in buffered {
            let key = self.owner_prefix(r, circuit_len);
            if self.ncc_owner_matches(tok, key) {
                self.token_mut(tok).ncc_results.push(r);
                self.token_mut(r).ncc_owner = Some(tok);
            } else {
                keep.push(r);
            }
        }
        if let NodeKind::NccPartner { buffer, .. } = &mut self.node_mut(partner).kind {
            *buffer = keep;
        }

        if self.token(tok).ncc_results.is_empty() {
            for child in self.node(node).children.clone() {
                self.left_activate(child, tok, None)?;
            }
        }
        Ok(())
    }

    fn left_activate_partner(
        &mut self,
        node: NodeId,
        t: TokenId,
        w: Option<FactId>,
    ) -> Result<(), ReteError> {
        let (ncc, circuit_len) = match &self.node(node).kind {
            NodeKind::NccPartner {
                ncc, circuit_len, ..
            } => (*ncc, *circuit_len),
            _ => unreachable!(),
        };

        let result = self.make_token(node, t, w);
        self.node_tokens_mut(node).push(result);

        let owner_key = self.owner_prefix(result, circuit_len);
        let candidates = match &self.node(ncc).kind {
            NodeKind::Ncc { tokens, .. } => tokens.clone(),
            _ => unreachable!(),
        };
        let owner = candidates
            .into_iter()
            .find(|o| self.ncc_owner_matches(*o, owner_key));

        match owner {
            Some(owner) => {
                let was_propagating = self.token(owner).ncc_results.is_empty();
                self.token_mut(owner).ncc_results.push(result);
                self.token_mut(result).ncc_owner = Some(owner);
                if was_propagating {
                    while let Some(&child) = self.token(owner).children.first() {
                        self.delete_token_and_descendants(child)?;
                    }
                }
            }
            None => {
                if let NodeKind::NccPartner { buffer, .. } = &mut self.node_mut(node).kind {
                    buffer.push(result);
                }
            }
        }
        Ok(())
    }

    /// Whether an NCC token is the prefix a walked-up partner key belongs
    /// to. NCC tokens without a WME (their parent is memory-like) compare
    /// on the prefix token alone: the key's WME belongs to the
    /// subconjunction's first pattern, which the prefix does not carry.
    fn ncc_owner_matches(
        &self,
        owner: TokenId,
        key: (Option<TokenId>, Option<FactId>),
    ) -> bool {
        let t = self.token(owner);
        match t.wme {
            Some(_) => (t.parent, t.wme) == key,
            None => t.parent == key.0,
        }
    }

    /// Walk `circuit_len` token levels up from a partner result to recover
    /// the `(parent, wme)` pair of the prefix token it negates.
    fn owner_prefix(
        &self,
        result: TokenId,
        circuit_len: usize,
    ) -> (Option<TokenId>, Option<FactId>) {
        let r = self.token(result);
        let mut t = r.parent;
        let mut w = r.wme;
        for _ in 0..circuit_len {
            let tid = t.expect("ncc circuit longer than the token path");
            let tk = self.token(tid);
            w = tk.wme;
            t = tk.parent;
        }
        (t, w)
    }

    fn activate_production(
        &mut self,
        node: NodeId,
        t: TokenId,
        w: Option<FactId>,
    ) -> Result<(), ReteError> {
        let (rule, salience, seq, bindings) = match &self.node(node).kind {
            NodeKind::Production(info) => (
                info.rule.clone(),
                info.salience,
                info.seq,
                info.bindings.clone(),
            ),
            _ => unreachable!(),
        };

        let resolved: BTreeMap<String, Value> = bindings
            .iter()
            .map(|(name, addr)| {
                (
                    name.clone(),
                    self.resolve_field(t, w, addr.levels_up, &addr.field),
                )
            })
            .collect();

        let tok = self.make_token(node, t, w);
        self.node_tokens_mut(node).push(tok);

        let mut facts = Vec::new();
        let mut cursor = Some(tok);
        while let Some(c) = cursor {
            let token = self.token(c);
            if let Some(wid) = token.wme {
                facts.push(wid);
            }
            cursor = token.parent;
        }
        facts.reverse();

        let activation = Activation {
            rule: rule.clone(),
            production: node,
            token: tok,
            recency: facts.iter().map(|f| f.0).max().unwrap_or(0),
            matched_facts: facts,
            bindings: resolved,
            salience,
            seq,
            timestamp: Utc::now(),
        };
        if self.agenda.try_insert(activation.clone()) {
            debug!(%rule, facts = ?activation.matched_facts, "activation added");
            for obs in &self.observers {
                obs.activation_added(&activation);
            }
        }
        Ok(())
    }

    // ── Structural builders ──────────────────────────────────────────────

    /// Start recording created nodes/memories so a failed rule install can
    /// be rolled back.
    pub fn begin_build(&mut self) {
        self.building = true;
        self.build_log.clear();
    }

    pub fn commit_build(&mut self) {
        self.building = false;
        self.build_log.clear();
    }

    /// Remove everything recorded since `begin_build`, newest first.
    /// Pre-existing (shared) nodes are left exactly as they were.
    pub fn rollback_build(&mut self) {
        self.building = false;
        for item in std::mem::take(&mut self.build_log).into_iter().rev() {
            match item {
                BuiltItem::Node(node) => {
                    if self.nodes.contains(node.0) {
                        self.delete_node(node)
                            .expect("rollback of a detached node cannot propagate");
                    }
                }
                BuiltItem::Memory(mem) => {
                    if self.alpha_mems.contains(mem.0)
                        && self.alpha_mems.get(mem.0).successors.is_empty()
                    {
                        self.remove_alpha_memory(mem);
                    }
                }
            }
        }
    }

    fn log_node(&mut self, node: NodeId) {
        if self.building {
            self.build_log.push(BuiltItem::Node(node));
        }
    }

    fn update_new_node_with_matches_from_above(&mut self, new: NodeId) -> Result<(), ReteError> {
        let Some(parent) = self.node(new).parent else {
            return Ok(());
        };
        match self.tag(parent) {
            Tag::Memory | Tag::Test | Tag::Negative | Tag::Ncc => {
                for tok in self.visible_tokens(parent) {
                    self.left_activate(new, tok, None)?;
                }
            }
            Tag::Join => {
                let alpha = match &self.node(parent).kind {
                    NodeKind::Join { alpha, .. } => *alpha,
                    _ => unreachable!(),
                };
                for w in self.alpha_mems.get(alpha.0).wmes.clone() {
                    self.right_activate(parent, w, Some(new))?;
                }
            }
            Tag::Partner | Tag::Production => {
                unreachable!("terminal nodes take no children")
            }
        }
        Ok(())
    }

    pub fn build_or_share_beta_memory(&mut self, parent: NodeId) -> Result<NodeId, ReteError> {
        let shared = self
            .node(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.tag(*c) == Tag::Memory);
        if let Some(existing) = shared {
            trace!(node = ?existing, "shared beta memory");
            return Ok(existing);
        }

        let node = NodeId(self.nodes.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::BetaMemory { tokens: Vec::new() },
        }));
        self.node_mut(parent).children.push(node);
        self.log_node(node);
        self.update_new_node_with_matches_from_above(node)?;
        debug!(?node, "built beta memory");
        Ok(node)
    }

    pub fn build_or_share_join(
        &mut self,
        parent: NodeId,
        alpha: AlphaMemId,
        tests: Vec<JoinTest>,
    ) -> Result<NodeId, ReteError> {
        let shared = self.node(parent).children.iter().copied().find(|c| {
            matches!(
                &self.node(*c).kind,
                NodeKind::Join { alpha: a, tests: ts } if *a == alpha && *ts == tests
            )
        });
        if let Some(existing) = shared {
            trace!(node = ?existing, "shared join node");
            return Ok(existing);
        }

        let node = NodeId(self.nodes.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Join { alpha, tests },
        }));
        self.node_mut(parent).children.push(node);
        self.alpha_mems.get_mut(alpha.0).successors.push(node);
        self.log_node(node);
        debug!(?node, ?alpha, "built join node");
        Ok(node)
    }

    pub fn build_or_share_negative(
        &mut self,
        parent: NodeId,
        alpha: AlphaMemId,
        tests: Vec<JoinTest>,
    ) -> Result<NodeId, ReteError> {
        let shared = self.node(parent).children.iter().copied().find(|c| {
            matches!(
                &self.node(*c).kind,
                NodeKind::Negative { alpha: a, tests: ts, .. } if *a == alpha && *ts == tests
            )
        });
        if let Some(existing) = shared {
            trace!(node = ?existing, "shared negative node");
            return Ok(existing);
        }

        let node = NodeId(self.nodes.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Negative {
                alpha,
                tests,
                tokens: Vec::new(),
            },
        }));
        self.node_mut(parent).children.push(node);
        self.alpha_mems.get_mut(alpha.0).successors.push(node);
        self.log_node(node);
        self.update_new_node_with_matches_from_above(node)?;
        debug!(?node, ?alpha, "built negative node");
        Ok(node)
    }

    pub fn build_or_share_test(
        &mut self,
        parent: NodeId,
        predicate: BetaPredicate,
    ) -> Result<NodeId, ReteError> {
        let shared = self.node(parent).children.iter().copied().find(|c| {
            matches!(
                &self.node(*c).kind,
                NodeKind::Test { predicate: p, .. } if *p == predicate
            )
        });
        if let Some(existing) = shared {
            trace!(node = ?existing, "shared test node");
            return Ok(existing);
        }

        let node = NodeId(self.nodes.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Test {
                predicate,
                tokens: Vec::new(),
            },
        }));
        self.node_mut(parent).children.push(node);
        self.log_node(node);
        self.update_new_node_with_matches_from_above(node)?;
        debug!(?node, "built test node");
        Ok(node)
    }

    /// Couple an NCC node to the already-built partner circuit.
    ///
    /// The subcircuit hangs off the same `parent` and was registered there
    /// first, so in-order fan-out reaches the partner before the NCC node
    /// and the flush buffer is primed when the prefix token arrives. The
    /// NCC node is backfilled before the partner for the same reason.
    pub fn build_ncc(
        &mut self,
        parent: NodeId,
        subcircuit_bottom: NodeId,
        circuit_len: usize,
    ) -> Result<NodeId, ReteError> {
        let ncc = NodeId(self.nodes.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Ncc {
                partner: NodeId(u32::MAX),
                tokens: Vec::new(),
            },
        }));
        let partner = NodeId(self.nodes.insert(Node {
            parent: Some(subcircuit_bottom),
            children: Vec::new(),
            kind: NodeKind::NccPartner {
                ncc,
                circuit_len,
                tokens: Vec::new(),
                buffer: Vec::new(),
            },
        }));
        if let NodeKind::Ncc { partner: p, .. } = &mut self.node_mut(ncc).kind {
            *p = partner;
        }
        self.node_mut(parent).children.push(ncc);
        self.node_mut(subcircuit_bottom).children.push(partner);
        self.log_node(ncc);
        self.log_node(partner);

        self.update_new_node_with_matches_from_above(ncc)?;
        self.update_new_node_with_matches_from_above(partner)?;
        debug!(?ncc, ?partner, circuit_len, "built ncc pair");
        Ok(ncc)
    }

    pub fn add_production(
        &mut self,
        parent: NodeId,
        spec: ProductionSpec,
    ) -> Result<NodeId, ReteError> {
        let node = NodeId(self.nodes.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Production(ProductionInfo {
                rule: spec.rule,
                salience: spec.salience,
                seq: spec.seq,
                bindings: spec.bindings,
                tokens: Vec::new(),
            }),
        }));
        self.node_mut(parent).children.push(node);
        self.log_node(node);
        self.update_new_node_with_matches_from_above(node)?;
        debug!(?node, "built production node");
        Ok(node)
    }

    // ── Deletion ─────────────────────────────────────────────────────────

    /// Excise a production: delete the terminal node, then every ancestor
    /// left without children. Shared prefixes survive untouched.
    pub fn remove_production(&mut self, production: NodeId) -> Result<(), ReteError> {
        debug_assert_eq!(self.tag(production), Tag::Production);
        self.delete_node_cascade(production)
    }

    fn delete_node_cascade(&mut self, node: NodeId) -> Result<(), ReteError> {
        let parent = self.node(node).parent;
        self.delete_node(node)?;
        if let Some(p) = parent {
            if p != self.dummy_node
                && self.nodes.contains(p.0)
                && self.node(p).children.is_empty()
            {
                self.delete_node_cascade(p)?;
            }
        }
        Ok(())
    }

    fn delete_node(&mut self, node: NodeId) -> Result<(), ReteError> {
        let tag = self.tag(node);

        // An NCC node owns its partner; the partner goes first, which also
        // unwinds the subcircuit chain it terminates.
        if tag == Tag::Ncc {
            let partner = match &self.node(node).kind {
                NodeKind::Ncc { partner, .. } => *partner,
                _ => unreachable!(),
            };
            if self.nodes.contains(partner.0) {
                self.delete_node_cascade(partner)?;
            }
        }

        // Retract every token this node produced.
        if tag != Tag::Join {
            loop {
                let Some(&tok) = self.node_tokens_mut(node).first() else {
                    break;
                };
                self.delete_token_and_descendants(tok)?;
            }
        }

        // Unregister from the right parent; orphaned alpha memories are
        // pruned out of the discrimination tree.
        if let NodeKind::Join { alpha, .. } | NodeKind::Negative { alpha, .. } =
            &self.node(node).kind
        {
            let alpha = *alpha;
            self.alpha_mems
                .get_mut(alpha.0)
                .successors
                .retain(|s| *s != node);
            if self.alpha_mems.get(alpha.0).successors.is_empty() {
                self.remove_alpha_memory(alpha);
            }
        }

        if let Some(parent) = self.node(node).parent {
            self.node_mut(parent).children.retain(|c| *c != node);
        }
        self.nodes.remove(node.0);
        debug!(?node, "node deleted");
        for obs in &self.observers {
            obs.node_removed(node);
        }
        Ok(())
    }

    fn remove_alpha_memory(&mut self, mem: AlphaMemId) {
        let removed = self.alpha_mems.remove(mem.0);
        for w in &removed.wmes {
            if let Some(wme) = self.wmes.get_mut(w) {
                wme.alpha_mems.retain(|m| *m != mem);
            }
        }
        match removed.node {
            None => {
                if let Some(root) = self.alpha_roots.get_mut(&removed.shape) {
                    root.memory = None;
                }
            }
            Some(leaf) => {
                self.alpha_nodes.get_mut(leaf.0).memory = None;
                self.prune_alpha_chain(leaf);
            }
        }
        debug!(?mem, "alpha memory removed");
    }

    fn prune_alpha_chain(&mut self, node: AlphaNodeId) {
        let n = self.alpha_nodes.get(node.0);
        if !n.children.is_empty() || n.memory.is_some() {
            return;
        }
        let parent = n.parent;
        let shape = n.shape.clone();
        self.alpha_nodes.remove(node.0);
        match parent {
            None => {
                if let Some(root) = self.alpha_roots.get_mut(&shape) {
                    root.children.retain(|c| *c != node);
                }
            }
            Some(p) => {
                self.alpha_nodes.get_mut(p.0).children.retain(|c| *c != node);
                self.prune_alpha_chain(p);
            }
        }
    }
}

impl Default for ReteNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpha::FieldTest;
    use crate::node::{BindingAddress, CmpOp};
    use crate::SalienceRecency;

    fn on(a: &str, b: &str) -> Fact {
        Fact::ordered("on", vec![Value::symbol(a), Value::symbol(b)])
    }

    fn ordered_shape() -> ShapeKey {
        ShapeKey::Ordered {
            head: "on".into(),
            arity: 2,
        }
    }

    fn spec(rule: &str) -> ProductionSpec {
        spec_at(rule, 0)
    }

    /// `levels_up` addresses the binding relative to the production's
    /// token: 0 when the terminal hangs off a join (the pair's own WME),
    /// 1 when it hangs off a memory-like node whose tokens carry no WME.
    fn spec_at(rule: &str, levels_up: usize) -> ProductionSpec {
        ProductionSpec {
            rule: rule.into(),
            salience: 0,
            seq: 0,
            bindings: vec![(
                "?x".into(),
                BindingAddress {
                    levels_up,
                    field: FieldRef::Pos(0),
                },
            )],
        }
    }

    /// (on ?x ?y) (on ?y ?z) — the classical two-pattern chain.
    fn build_transitive_rule(net: &mut ReteNetwork) -> NodeId {
        let am = net
            .build_or_share_alpha_memory(ordered_shape(), &[])
            .expect("alpha");
        let join1 = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join1");
        let memory = net.build_or_share_beta_memory(join1).expect("memory");
        let join2 = net
            .build_or_share_join(
                memory,
                am,
                vec![JoinTest::Compare {
                    own_field: 0,
                    levels_up: 1,
                    other_field: 1,
                    op: CmpOp::Eq,
                }],
            )
            .expect("join2");
        net.add_production(join2, spec("chain")).expect("production")
    }

    #[test]
    fn two_pattern_join_matches_shared_variable() {
        let mut net = ReteNetwork::new();
        build_transitive_rule(&mut net);

        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        net.add_wme(FactId(3), &on("x", "y")).expect("wme 3");

        // (a on b) + (b on c) joins; nothing else does... except each fact
        // joined with itself when first and second fields agree — none here.
        let rules: Vec<_> = net.agenda().items().iter().map(|a| &a.rule).collect();
        assert_eq!(net.agenda().len(), 1, "agenda: {rules:?}");
        let act = &net.agenda().items()[0];
        assert_eq!(act.matched_facts, vec![FactId(1), FactId(2)]);
        assert_eq!(act.bindings["?x"], Value::symbol("b"));
    }

    #[test]
    fn wme_insertion_order_does_not_matter() {
        let mut net = ReteNetwork::new();
        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        // Rule compiled after the facts: backfill must find the match.
        build_transitive_rule(&mut net);
        assert_eq!(net.agenda().len(), 1);
    }

    #[test]
    fn retraction_unwinds_tokens_and_activations() {
        let mut net = ReteNetwork::new();
        build_transitive_rule(&mut net);
        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        assert_eq!(net.agenda().len(), 1);

        net.remove_wme(FactId(2)).expect("retract");
        assert!(net.agenda().is_empty());

        net.remove_wme(FactId(1)).expect("retract");
        assert_eq!(net.stats().tokens, 1, "only the dummy token remains");
    }

    #[test]
    fn identical_prefixes_share_nodes() {
        let mut net = ReteNetwork::new();
        let am = net
            .build_or_share_alpha_memory(ordered_shape(), &[])
            .expect("alpha");
        let am_again = net
            .build_or_share_alpha_memory(ordered_shape(), &[])
            .expect("alpha again");
        assert_eq!(am, am_again);

        let join1 = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join");
        let join1_again = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join again");
        assert_eq!(join1, join1_again, "identical joins are identity-equal");

        let different = net
            .build_or_share_join(
                net.dummy_node(),
                am,
                vec![JoinTest::Compare {
                    own_field: 0,
                    levels_up: 0,
                    other_field: 1,
                    op: CmpOp::Ne,
                }],
            )
            .expect("different join");
        assert_ne!(join1, different);
    }

    #[test]
    fn negative_node_gates_on_absence() {
        let mut net = ReteNetwork::new();
        // (on ?x ?y) (not (on ?y ?z))
        let am = net
            .build_or_share_alpha_memory(ordered_shape(), &[])
            .expect("alpha");
        let join1 = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join1");
        let neg = net
            .build_or_share_negative(
                join1,
                am,
                vec![JoinTest::Compare {
                    own_field: 0,
                    levels_up: 1,
                    other_field: 1,
                    op: CmpOp::Eq,
                }],
            )
            .expect("negative");
        net.add_production(neg, spec_at("top", 1)).expect("production");

        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        // (a on b), nothing on from b: the token propagates.
        assert_eq!(net.agenda().len(), 1);

        // (b on c) arrives: the negation now matches, activation retracts.
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        let top_active = net
            .agenda()
            .items()
            .iter()
            .any(|a| a.matched_facts == vec![FactId(1)]);
        assert!(!top_active, "gated token must not stay activated");

        // Retracting (b on c) restores the match.
        net.remove_wme(FactId(2)).expect("retract");
        assert!(net
            .agenda()
            .items()
            .iter()
            .any(|a| a.matched_facts == vec![FactId(1)]));
    }

    #[test]
    fn reset_preserves_nodes_and_reseeds_the_dummy() {
        let mut net = ReteNetwork::new();
        build_transitive_rule(&mut net);
        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        let nodes_before = net.stats().nodes;

        net.reset_memories().expect("reset");
        assert_eq!(net.stats().nodes, nodes_before);
        assert_eq!(net.stats().wmes, 0);
        assert!(net.agenda().is_empty());

        // The network still matches after the reset.
        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        assert_eq!(net.agenda().len(), 1);
    }

    #[test]
    fn remove_production_spares_shared_prefix() {
        let mut net = ReteNetwork::new();
        let p1 = build_transitive_rule(&mut net);
        // A second rule over the same prefix with its own terminal.
        let am = net
            .build_or_share_alpha_memory(ordered_shape(), &[])
            .expect("alpha");
        let join1 = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join1");
        let p2 = net.add_production(join1, spec("single")).expect("p2");

        net.add_wme(FactId(1), &on("a", "b")).expect("wme");
        assert_eq!(net.agenda().len(), 1, "only the single-pattern rule fires");

        net.remove_production(p1).expect("excise");
        // p2 and its chain survive.
        assert!(net.agenda().items().iter().all(|a| a.production == p2));
        net.add_wme(FactId(2), &on("c", "d")).expect("wme 2");
        assert_eq!(net.agenda().len(), 2);
    }

    #[test]
    fn alpha_literals_discriminate() {
        let mut net = ReteNetwork::new();
        let am = net
            .build_or_share_alpha_memory(
                ordered_shape(),
                &[AlphaTest {
                    field: 1,
                    test: FieldTest::Literal(Value::symbol("table")),
                }],
            )
            .expect("alpha");
        let join = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join");
        net.add_production(join, spec("on-table")).expect("production");

        net.add_wme(FactId(1), &on("a", "table")).expect("wme 1");
        net.add_wme(FactId(2), &on("a", "b")).expect("wme 2");
        assert_eq!(net.agenda().len(), 1);
        assert_eq!(net.agenda().items()[0].matched_facts, vec![FactId(1)]);
    }

    #[test]
    fn ncc_pair_gates_on_complete_subconjunction() {
        let mut net = ReteNetwork::new();
        // (on ?x ?y) (not (and (on ?y ?z) (on ?z ?w)))
        let am = net
            .build_or_share_alpha_memory(ordered_shape(), &[])
            .expect("alpha");
        let join1 = net
            .build_or_share_join(net.dummy_node(), am, vec![])
            .expect("join1");

        // Subcircuit first, so the partner precedes the NCC node in the
        // shared parent's fan-out order.
        let sub_m1 = net.build_or_share_beta_memory(join1).expect("m1");
        let sub_join2 = net
            .build_or_share_join(
                sub_m1,
                am,
                vec![JoinTest::Compare {
                    own_field: 0,
                    levels_up: 1,
                    other_field: 1,
                    op: CmpOp::Eq,
                }],
            )
            .expect("sub join2");
        let sub_m2 = net.build_or_share_beta_memory(sub_join2).expect("m2");
        let sub_join3 = net
            .build_or_share_join(
                sub_m2,
                am,
                vec![JoinTest::Compare {
                    own_field: 0,
                    levels_up: 1,
                    other_field: 1,
                    op: CmpOp::Eq,
                }],
            )
            .expect("sub join3");

        let ncc = net.build_ncc(join1, sub_join3, 2).expect("ncc");
        net.add_production(ncc, spec_at("no-two-step", 1))
            .expect("production");

        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        assert!(
            net.agenda()
                .items()
                .iter()
                .any(|a| a.matched_facts == vec![FactId(1)]),
            "no subconjunction yet"
        );

        // One leg of the conjunction: still active.
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");
        assert!(net
            .agenda()
            .items()
            .iter()
            .any(|a| a.matched_facts == vec![FactId(1)]));

        // Conjunction completes: (b on c) + (c on d) kills the activation.
        net.add_wme(FactId(3), &on("c", "d")).expect("wme 3");
        assert!(!net
            .agenda()
            .items()
            .iter()
            .any(|a| a.matched_facts == vec![FactId(1)]));

        // Retracting one leg restores it.
        net.remove_wme(FactId(2)).expect("retract");
        assert!(net
            .agenda()
            .items()
            .iter()
            .any(|a| a.matched_facts == vec![FactId(1)]));
    }

    #[test]
    fn pop_activation_follows_strategy_and_refracts() {
        let mut net = ReteNetwork::new();
        build_transitive_rule(&mut net);
        net.add_wme(FactId(1), &on("a", "b")).expect("wme 1");
        net.add_wme(FactId(2), &on("b", "c")).expect("wme 2");

        let act = net.pop_activation(&SalienceRecency).expect("activation");
        assert_eq!(act.rule, "chain");
        assert!(net.pop_activation(&SalienceRecency).is_none());
    }
}
