use crate::definition::DefKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The construct-kind part of an import/export promise.
///
/// `AllKinds` is the `?ALL` sentinel in kind position (import every kind);
/// `NoKinds` is `?NONE` (erase everything promised from that module so far).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseKind {
    Template,
    Function,
    Global,
    AllKinds,
    NoKinds,
}

impl PromiseKind {
    pub fn kinds(&self) -> Vec<DefKind> {
        match self {
            PromiseKind::Template => vec![DefKind::Template],
            PromiseKind::Function => vec![DefKind::Function],
            PromiseKind::Global => vec![DefKind::Global],
            PromiseKind::AllKinds => DefKind::ALL.to_vec(),
            PromiseKind::NoKinds => Vec::new(),
        }
    }
}

/// The name part of an import/export promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamePromise {
    /// `?ALL`: every current definition, plus future ones via subscription.
    All,
    /// `?NONE`: nothing of this kind.
    None,
    Named(Vec<String>),
}

/// One import line of a defmodule: from `source`, of kind `kind`, the
/// definitions selected by `names`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeImport {
    pub source: String,
    pub kind: PromiseKind,
    pub names: NamePromise,
}

impl ScopeImport {
    pub fn all(source: &str) -> Self {
        ScopeImport {
            source: source.to_string(),
            kind: PromiseKind::AllKinds,
            names: NamePromise::All,
        }
    }
}

/// One export line of a defmodule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeExport {
    pub kind: PromiseKind,
    pub names: NamePromise,
}

impl ScopeExport {
    pub fn all() -> Self {
        ScopeExport {
            kind: PromiseKind::AllKinds,
            names: NamePromise::All,
        }
    }
}

/// The folded export promise for one kind. The `?ALL`/`?NONE` sentinels are
/// resolved here once, at scope creation; they never enter a name map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportSet {
    All,
    None,
    Named(BTreeSet<String>),
}

impl ExportSet {
    pub fn can_export(&self, name: &str) -> bool {
        match self {
            ExportSet::All => true,
            ExportSet::None => false,
            ExportSet::Named(names) => names.contains(name),
        }
    }
}

/// Fold declared export lines into one `ExportSet` per kind.
///
/// Later lines refine earlier ones: `?NONE` in kind position empties every
/// kind, `?NONE` in name position empties that kind, named lines accumulate.
pub(crate) fn fold_exports(exports: &[ScopeExport]) -> [ExportSet; 3] {
    let mut sets = [ExportSet::None, ExportSet::None, ExportSet::None];

    for export in exports {
        if matches!(export.kind, PromiseKind::NoKinds) {
            sets = [ExportSet::None, ExportSet::None, ExportSet::None];
            continue;
        }
        for kind in export.kind.kinds() {
            let slot = &mut sets[kind as usize];
            match &export.names {
                NamePromise::All => *slot = ExportSet::All,
                NamePromise::None => *slot = ExportSet::None,
                NamePromise::Named(names) => {
                    let set = match slot {
                        ExportSet::Named(set) => set,
                        _ => {
                            *slot = ExportSet::Named(BTreeSet::new());
                            match slot {
                                ExportSet::Named(set) => set,
                                _ => unreachable!(),
                            }
                        }
                    };
                    set.extend(names.iter().cloned());
                }
            }
        }
    }

    sets
}
