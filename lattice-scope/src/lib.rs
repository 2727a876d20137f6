//! Module scopes for the lattice rule engine.
//!
//! A scope is a named module's view of templates, functions and globals,
//! mediated by import/export promises (`?ALL` / `?NONE`). The
//! [`ScopeRegistry`] owns every scope, tracks the current one, and delivers
//! late-bound `?ALL` imports through explicit subscription lists.

mod definition;
mod error;
mod promise;
mod registry;
mod scope;

pub use definition::{DefKind, Definition, DefPayload, FunctionDecl, GlobalDecl};
pub use error::ScopeError;
pub use promise::{ExportSet, NamePromise, PromiseKind, ScopeExport, ScopeImport};
pub use registry::ScopeRegistry;
pub use scope::Scope;

/// The module every engine starts with.
pub const MAIN_MODULE: &str = "MAIN";

/// The pseudo-module that owns built-in function definitions.
pub const SYSTEM_MODULE: &str = "?SYSTEM?";
