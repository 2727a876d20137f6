use crate::definition::{DefKind, Definition};
use crate::error::ScopeError;
use crate::promise::{fold_exports, ExportSet, NamePromise, ScopeExport, ScopeImport};
use std::collections::BTreeMap;
use std::fmt;

/// A named module's view of templates, functions and globals.
///
/// Imported definitions are merged into the same per-kind stores as local
/// ones, so bare-name resolution is a single lookup. The stores only ever
/// grow or atomically replace an entry.
#[derive(Clone, Debug)]
pub struct Scope {
    name: String,
    stores: [BTreeMap<String, Definition>; 3],
    exports: [ExportSet; 3],
    /// Modules holding a `?ALL` promise on this scope, per kind, in
    /// registration order.
    subscribers: [Vec<String>; 3],
    imports: Vec<ScopeImport>,
}

impl Scope {
    pub fn new(name: &str, imports: Vec<ScopeImport>, exports: &[ScopeExport]) -> Self {
        Scope {
            name: name.to_string(),
            stores: Default::default(),
            exports: fold_exports(exports),
            subscribers: Default::default(),
            imports,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn imports(&self) -> &[ScopeImport] {
        &self.imports
    }

    pub fn store(&self, kind: DefKind) -> &BTreeMap<String, Definition> {
        &self.stores[kind as usize]
    }

    pub(crate) fn store_mut(&mut self, kind: DefKind) -> &mut BTreeMap<String, Definition> {
        &mut self.stores[kind as usize]
    }

    pub fn get(&self, kind: DefKind, name: &str) -> Option<&Definition> {
        self.store(kind).get(name)
    }

    pub fn has(&self, kind: DefKind, name: &str) -> bool {
        self.store(kind).contains_key(name)
    }

    /// Whether a definition of this scope is importable by another scope.
    pub fn is_importable(&self, kind: DefKind, name: &str) -> bool {
        self.exports[kind as usize].can_export(name)
    }

    /// The currently defined definitions covered by this scope's export
    /// promise for `kind`, optionally narrowed by a name filter.
    ///
    /// A `Named` filter demands each name to be exported *and* defined;
    /// promised-but-undefined names fail with `DefinitionNotFound`.
    pub fn exports_for(
        &self,
        kind: DefKind,
        filter: &NamePromise,
    ) -> Result<Vec<(String, Definition)>, ScopeError> {
        let export = &self.exports[kind as usize];
        match filter {
            NamePromise::None => Ok(Vec::new()),
            NamePromise::All => Ok(self
                .store(kind)
                .iter()
                .filter(|(name, _)| export.can_export(name))
                .map(|(name, def)| (name.clone(), def.clone()))
                .collect()),
            NamePromise::Named(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    let def = self
                        .get(kind, name)
                        .filter(|_| export.can_export(name))
                        .ok_or_else(|| ScopeError::DefinitionNotFound {
                            module: self.name.clone(),
                            what: format!("{kind} {name}"),
                        })?;
                    out.push((name.clone(), def.clone()));
                }
                Ok(out)
            }
        }
    }

    pub(crate) fn export_sets(&self) -> &[ExportSet; 3] {
        &self.exports
    }

    pub(crate) fn subscribe(&mut self, kind: DefKind, module: &str) {
        let subs = &mut self.subscribers[kind as usize];
        if !subs.iter().any(|m| m == module) {
            subs.push(module.to_string());
        }
    }

    pub(crate) fn unsubscribe_all(&mut self, module: &str) {
        for subs in &mut self.subscribers {
            subs.retain(|m| m != module);
        }
    }

    pub(crate) fn subscribers(&self, kind: DefKind) -> &[String] {
        &self.subscribers[kind as usize]
    }

    pub(crate) fn has_subscriber(&self, module: &str) -> bool {
        self.subscribers.iter().any(|subs| subs.iter().any(|m| m == module))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(defmodule {}", self.name)?;
        for import in &self.imports {
            writeln!(f, "  (import {} {:?} {:?})", import.source, import.kind, import.names)?;
        }
        for kind in DefKind::ALL {
            for def in self.store(kind).values() {
                writeln!(f, "  ; {kind} {}::{}", def.module, def.name)?;
            }
        }
        write!(f, ")")
    }
}
