//! Typed atoms, fact shapes and template definitions for the lattice rule
//! engine.
//!
//! Facts are the atomic unit of working memory: an ordered tuple or a
//! template-shaped record of [`Value`] atoms. They are immutable once
//! asserted; updates are expressed as retract + re-assert.

mod fact;
mod template;
mod value;

pub use fact::{Fact, FactError, FactId};
pub use template::{SlotDef, TemplateDef};
pub use value::{Value, ValueKind};
