use crate::arena::{AlphaMemId, NodeId, TokenId};
use lattice_facts::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Predicate handler injected by the compiler. Handlers are side-effect
/// free by contract; a returned error aborts the propagation.
pub type PredicateFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Comparison operator of a join test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// `Eq`/`Ne` compare structurally (a variable bound to `3` does not
    /// match `3.0`); the ordering operators compare numerically and fail on
    /// non-numbers.
    pub fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            _ => match left.numeric_cmp(right) {
                Some(ord) => match self {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                },
                None => false,
            },
        }
    }
}

/// What a binding address points at inside one WME.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldRef {
    /// The fact index itself (a `?f <- (pattern)` binding).
    Fact,
    /// A positional field of the fact.
    Pos(usize),
}

/// The classical Rete binding address: walk `levels_up` token levels from
/// the pattern's own WME (level 0), then read `field`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingAddress {
    pub levels_up: usize,
    pub field: FieldRef,
}

/// Argument of a beta-level predicate call.
#[derive(Clone, Debug, PartialEq)]
pub enum BetaArg {
    Const(Value),
    Binding(BindingAddress),
}

/// A predicate call over `(token, wme)` used in join tests and test nodes.
///
/// Equality (for node sharing) is by name and argument template; the
/// handler itself is opaque.
#[derive(Clone)]
pub struct BetaPredicate {
    pub name: String,
    pub args: Vec<BetaArg>,
    pub handler: PredicateFn,
}

impl PartialEq for BetaPredicate {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.args == other.args
    }
}

impl fmt::Debug for BetaPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BetaPredicate")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// One inter-pattern test at a join or negative node.
#[derive(Clone, Debug, PartialEq)]
pub enum JoinTest {
    Compare {
        /// Field of the candidate WME (level 0).
        own_field: usize,
        /// Token levels up to the earlier pattern's WME.
        levels_up: usize,
        /// Field of that earlier WME.
        other_field: usize,
        op: CmpOp,
    },
    Predicate(BetaPredicate),
}

/// Terminal node description supplied by the compiler.
#[derive(Clone, Debug)]
pub struct ProductionSpec {
    /// Qualified rule name (`MOD::rule`).
    pub rule: String,
    pub salience: i64,
    /// Rule registration order, the final conflict tiebreak.
    pub seq: u64,
    /// Variable name to binding address, used to materialize the bindings
    /// view of an activation.
    pub bindings: Vec<(String, BindingAddress)>,
}

#[derive(Debug)]
pub(crate) struct ProductionInfo {
    pub rule: String,
    pub salience: i64,
    pub seq: u64,
    pub bindings: Vec<(String, BindingAddress)>,
    pub tokens: Vec<TokenId>,
}

/// Beta-network node payloads, dispatched as a tagged variant to keep the
/// hot propagation path branch-predictable.
#[derive(Debug)]
pub(crate) enum NodeKind {
    BetaMemory {
        tokens: Vec<TokenId>,
    },
    Join {
        alpha: AlphaMemId,
        tests: Vec<JoinTest>,
    },
    Negative {
        alpha: AlphaMemId,
        tests: Vec<JoinTest>,
        tokens: Vec<TokenId>,
    },
    Ncc {
        partner: NodeId,
        tokens: Vec<TokenId>,
    },
    NccPartner {
        ncc: NodeId,
        /// Distance in token levels between a partner result and the
        /// prefix it negates; walking this far up recovers the prefix.
        circuit_len: usize,
        tokens: Vec<TokenId>,
        /// Results produced since the last NCC left-activation, awaiting
        /// their owner.
        buffer: Vec<TokenId>,
    },
    Test {
        predicate: BetaPredicate,
        tokens: Vec<TokenId>,
    },
    Production(ProductionInfo),
}

#[derive(Debug)]
pub(crate) struct Node {
    pub parent: Option<NodeId>,
    /// Children in registration order; fan-out follows this order and
    /// completes before an activation returns.
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}
