use crate::definition::DefKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("cannot redefine defmodule {0} while it is in use")]
    ModuleRedefined(String),

    #[error("unable to import {what} from defmodule {module}")]
    DefinitionNotFound { module: String, what: String },

    #[error("import/export conflict in defmodule {module} caused by the {kind} {name}")]
    DefinitionConflict {
        module: String,
        kind: DefKind,
        name: String,
    },

    #[error("deftemplate {name} is already defined in defmodule {module}")]
    TemplateRedefined { module: String, name: String },

    #[error("no definition named '{name}' of kind {kind} is visible from defmodule {module}")]
    NotVisible {
        module: String,
        kind: DefKind,
        name: String,
    },
}
