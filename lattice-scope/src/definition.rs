use lattice_facts::{TemplateDef, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three restricted construct kinds a scope manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DefKind {
    Template,
    Function,
    Global,
}

impl DefKind {
    pub const ALL: [DefKind; 3] = [DefKind::Template, DefKind::Function, DefKind::Global];
}

impl fmt::Display for DefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DefKind::Template => "deftemplate",
            DefKind::Function => "deffunction",
            DefKind::Global => "defglobal",
        };
        write!(f, "{name}")
    }
}

/// Declaration of a function as the symbol table sees it.
///
/// The callable handler lives in the engine's function registry; the scope
/// carries what the parser needs to validate references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub module: String,
    pub name: String,
    pub params: Vec<String>,
}

/// Declaration of a global variable with its initializer value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub module: String,
    pub name: String,
    pub initializer: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefPayload {
    Template(TemplateDef),
    Function(FunctionDecl),
    Global(GlobalDecl),
}

/// A named, module-originated definition unit.
///
/// Identity is the whole of (originating module, kind, name, payload): two
/// definitions are "the same" only when every part matches, which is what
/// makes circular `?ALL` re-imports idempotent rather than conflicting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub module: String,
    pub name: String,
    pub payload: DefPayload,
}

impl Definition {
    pub fn template(def: TemplateDef) -> Self {
        Definition {
            module: def.module.clone(),
            name: def.name.clone(),
            payload: DefPayload::Template(def),
        }
    }

    pub fn function(decl: FunctionDecl) -> Self {
        Definition {
            module: decl.module.clone(),
            name: decl.name.clone(),
            payload: DefPayload::Function(decl),
        }
    }

    pub fn global(decl: GlobalDecl) -> Self {
        Definition {
            module: decl.module.clone(),
            name: decl.name.clone(),
            payload: DefPayload::Global(decl),
        }
    }

    pub fn kind(&self) -> DefKind {
        match &self.payload {
            DefPayload::Template(_) => DefKind::Template,
            DefPayload::Function(_) => DefKind::Function,
            DefPayload::Global(_) => DefKind::Global,
        }
    }

    pub fn as_template(&self) -> Option<&TemplateDef> {
        match &self.payload {
            DefPayload::Template(t) => Some(t),
            _ => None,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }
}
