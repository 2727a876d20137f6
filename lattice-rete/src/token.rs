use crate::arena::{AlphaMemId, NodeId, TokenId};
use lattice_facts::{Fact, FactId};

/// A path through the beta network: `(parent, wme, producing node)`.
///
/// Tokens form a tree rooted at the dummy top token. The `wme` is absent
/// for the dummy token and for levels contributed by negative, NCC and
/// test nodes, which bind no variables of their own.
#[derive(Debug)]
pub(crate) struct Token {
    pub parent: Option<TokenId>,
    pub wme: Option<FactId>,
    pub node: NodeId,
    pub children: Vec<TokenId>,
    /// For tokens stored at an NCC node: the matching subconjunction
    /// results. The token propagates iff this is empty.
    pub ncc_results: Vec<TokenId>,
    /// For partner results: the NCC token they are attached to.
    pub ncc_owner: Option<TokenId>,
    /// For tokens stored at a negative node: how many right-parent WMEs
    /// currently match. The token propagates iff this is zero.
    pub neg_matches: u32,
}

/// A fact as the network sees it, with non-owning back-references to every
/// alpha memory that admitted it and every token built over it.
#[derive(Debug)]
pub(crate) struct Wme {
    pub fact: Fact,
    pub alpha_mems: Vec<AlphaMemId>,
    pub tokens: Vec<TokenId>,
}
