use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Monotonically increasing fact identifier assigned by working memory.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FactId(pub u64);

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f-{}", self.0)
    }
}

/// An asserted fact: an ordered tuple or a template-shaped record.
///
/// Template facts carry the qualified template name (`MOD::name`) and their
/// slots in template-declared order, so a field is addressable by position
/// throughout the match network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fact {
    Ordered {
        head: String,
        fields: Vec<Value>,
    },
    Template {
        template: String,
        slots: Vec<(String, Value)>,
    },
}

impl Fact {
    pub fn ordered(head: &str, fields: Vec<Value>) -> Self {
        Fact::Ordered {
            head: head.to_string(),
            fields,
        }
    }

    /// Positional field accessor. For ordered facts index 0 is the first
    /// field after the head; for template facts it is the first slot.
    pub fn field(&self, index: usize) -> Option<&Value> {
        match self {
            Fact::Ordered { fields, .. } => fields.get(index),
            Fact::Template { slots, .. } => slots.get(index).map(|(_, v)| v),
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Fact::Ordered { fields, .. } => fields.len(),
            Fact::Template { slots, .. } => slots.len(),
        }
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        match self {
            Fact::Ordered { .. } => None,
            Fact::Template { slots, .. } => {
                slots.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fact::Ordered { head, fields } => {
                write!(f, "({head}")?;
                for field in fields {
                    write!(f, " {field}")?;
                }
                write!(f, ")")
            }
            Fact::Template { template, slots } => {
                write!(f, "({template}")?;
                for (name, value) in slots {
                    write!(f, " ({name} {value})")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Shape errors raised when a fact does not fit its template.
#[derive(Debug, Error)]
pub enum FactError {
    #[error("template {template} has no slot named '{slot}'")]
    UnknownSlot { template: String, slot: String },

    #[error("slot '{slot}' given twice in assertion of template {template}")]
    DuplicateSlot { template: String, slot: String },

    #[error("slot '{slot}' of template {template} is single-valued but received a multifield")]
    MultifieldInSingleSlot { template: String, slot: String },

    #[error("slot '{slot}' of template {template} rejects {value}: expected {expected}")]
    SlotType {
        template: String,
        slot: String,
        value: String,
        expected: String,
    },
}
