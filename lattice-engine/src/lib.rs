//! The lattice engine context: working memory, construct loading, rule
//! compilation and the run loop, tying the scope registry and the Rete
//! network together.
//!
//! The engine is a plain value — no process-wide state. Constructs arrive
//! through the parser seam as [`ast::Construct`] values; facts are asserted
//! and retracted through the working-memory API; activations fire through
//! [`Engine::run`].

pub mod ast;
mod compile;
mod engine;
mod error;
pub mod functions;
mod wm;

pub use engine::{Engine, EngineOptions, EngineStats};
pub use error::{EngineError, RuleError};
pub use wm::{DuplicatePolicy, WorkingMemory};

pub use lattice_facts::{Fact, FactError, FactId, SlotDef, TemplateDef, Value, ValueKind};
pub use lattice_rete::{
    Activation, ConflictStrategy, NetworkObserver, NetworkStats, SalienceRecency,
};
pub use lattice_scope::{
    DefKind, NamePromise, PromiseKind, ScopeError, ScopeExport, ScopeImport, ScopeRegistry,
};
