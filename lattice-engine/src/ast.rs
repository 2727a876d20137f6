//! The construct AST: the seam between the parser and the engine core.
//!
//! The parser (out of scope here) lowers the textual rule language into
//! these values; the engine validates and installs them. Symbol-table
//! queries run the other way through [`crate::ScopeRegistry::resolve`].

use lattice_facts::{SlotDef, Value};
use lattice_scope::{ScopeExport, ScopeImport};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Construct {
    DefModule(DefModule),
    DefTemplate(DefTemplate),
    DefFacts(DefFacts),
    DefRule(DefRule),
    DefFunction(DefFunction),
    DefGlobal(DefGlobal),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefModule {
    pub name: String,
    pub imports: Vec<ScopeImport>,
    pub exports: Vec<ScopeExport>,
}

/// `module: None` means the current module at load time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefTemplate {
    pub module: Option<String>,
    pub name: String,
    pub slots: Vec<SlotDef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefFacts {
    pub module: Option<String>,
    pub name: String,
    pub comment: Option<String>,
    pub facts: Vec<FactSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefRule {
    pub module: Option<String>,
    pub name: String,
    pub comment: Option<String>,
    pub declarations: RuleDeclarations,
    pub lhs: Vec<ConditionalElement>,
    pub rhs: Vec<Action>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleDeclarations {
    pub salience: i64,
    pub auto_focus: bool,
}

impl Default for RuleDeclarations {
    fn default() -> Self {
        RuleDeclarations {
            salience: 0,
            auto_focus: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefFunction {
    pub module: Option<String>,
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefGlobal {
    pub module: Option<String>,
    pub name: String,
    pub initializer: Expr,
}

// ── Conditional elements ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConditionalElement {
    Ordered(OrderedPattern),
    Template(TemplatePattern),
    /// `?f <- (pattern)`: binds the fact index of the matched fact.
    Assigned {
        variable: String,
        pattern: Box<ConditionalElement>,
    },
    And(Vec<ConditionalElement>),
    Or(Vec<ConditionalElement>),
    Not(Box<ConditionalElement>),
    Test(Expr),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderedPattern {
    pub head: String,
    pub fields: Vec<Constraint>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplatePattern {
    pub template: String,
    pub slots: Vec<(String, Constraint)>,
}

/// A single-field constraint. `&`, `|` and `~` connect terms; `:`-tests
/// carry arbitrary predicate expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    Literal(Value),
    /// `?x` — binds on first occurrence, tests equality afterwards. A
    /// multislot variable (`$?x`) binds the whole multifield.
    Variable(String),
    /// `?` — matches anything.
    Wildcard,
    /// `:(expr)` — predicate over the field and already-bound variables.
    Test(Expr),
    Not(Box<Constraint>),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
}

// ── Right-hand side ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FactSpec {
    Ordered {
        head: String,
        fields: Vec<Expr>,
    },
    Template {
        template: String,
        slots: Vec<(String, Expr)>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Assert(FactSpec),
    /// Retract by fact index: `(retract ?f)`.
    Retract(Expr),
    Call(Expr),
}

// ── Expressions ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Global(String),
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Literal(Value::Integer(value))
    }

    pub fn var(name: &str) -> Self {
        Expr::Variable(name.to_string())
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.to_string(),
            args,
        }
    }

    /// Collect variable references in first-occurrence order.
    pub fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) | Expr::Global(_) => {}
            Expr::Variable(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.variables(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Variable(name) => write!(f, "?{name}"),
            Expr::Global(name) => write!(f, "?*{name}*"),
            Expr::Call { name, args } => {
                write!(f, "({name}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl FactSpec {
    pub fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FactSpec::Ordered { fields, .. } => {
                for field in fields {
                    field.variables(out);
                }
            }
            FactSpec::Template { slots, .. } => {
                for (_, expr) in slots {
                    expr.variables(out);
                }
            }
        }
    }
}

impl Action {
    pub fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Action::Assert(spec) => spec.variables(out),
            Action::Retract(expr) | Action::Call(expr) => expr.variables(out),
        }
    }
}
