use lattice_facts::{FactError, FactId};
use lattice_rete::ReteError;
use lattice_scope::ScopeError;
use thiserror::Error;

/// The error taxonomy surfaced by the engine. Every fatal error leaves the
/// engine in the state it was in immediately before the failing operation;
/// the two multi-step operations — scope creation and rule installation —
/// roll their side effects back.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Fact(#[from] FactError),

    #[error(transparent)]
    Rete(#[from] ReteError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("function '{name}': {reason}")]
    FunctionArityOrType { name: String, reason: String },

    #[error("function '{function}' evaluation failed: {message}")]
    Evaluation { function: String, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("no fact with index {0}")]
    UnknownFact(FactId),

    #[error("unknown rule '{0}'")]
    UnknownRule(String),

    #[error("unbound variable '{0}' in expression")]
    UnboundExprVariable(String),

    #[error("global variable '{0}' is not defined")]
    UnknownGlobal(String),

    #[error("expression recursion exceeds the evaluation depth limit")]
    EvaluationDepth,

    #[error("the network cannot be recompiled while a propagation is in flight")]
    ReentrantCompilation,
}

/// Left-hand-side compilation failures. The rule is rejected and the
/// engine, including the partially built network, is rolled back.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {rule}: variable {variable} is referenced but never bound by a positive pattern")]
    UnboundVariable { rule: String, variable: String },

    #[error("rule {rule}: unknown template {template}")]
    UnknownTemplate { rule: String, template: String },

    #[error("rule {rule}: template {template} has no slot '{slot}'")]
    UnknownSlot {
        rule: String,
        template: String,
        slot: String,
    },

    #[error("rule {rule}: a test CE cannot open the left-hand side")]
    TestFirst { rule: String },

    #[error("rule {rule}: unsupported negation form")]
    InvalidNegation { rule: String },

    #[error("rule {rule}: {detail}")]
    UnsupportedConstraint { rule: String, detail: String },

    #[error("rule {rule}: call to '{function}': {reason}")]
    BadCall {
        rule: String,
        function: String,
        reason: String,
    },
}
