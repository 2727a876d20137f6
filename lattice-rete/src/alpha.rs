use crate::arena::{AlphaMemId, AlphaNodeId, NodeId};
use crate::error::ReteError;
use crate::node::PredicateFn;
use lattice_facts::{Fact, FactId, Value, ValueKind};
use std::fmt;

/// Discrimination key of a pattern / fact shape. Ordered facts of different
/// arity live under different keys since a pattern without sub-multifield
/// matching pins its arity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShapeKey {
    Ordered { head: String, arity: usize },
    Template { name: String },
}

impl ShapeKey {
    pub fn of(fact: &Fact) -> ShapeKey {
        match fact {
            Fact::Ordered { head, fields } => ShapeKey::Ordered {
                head: head.clone(),
                arity: fields.len(),
            },
            Fact::Template { template, .. } => ShapeKey::Template {
                name: template.clone(),
            },
        }
    }
}

/// Argument of an alpha-level predicate: the field under test or a
/// constant.
#[derive(Clone, Debug, PartialEq)]
pub enum AlphaArg {
    Field,
    Const(Value),
}

/// A deterministic predicate call hoisted into the alpha network. It may
/// reference only the field under test and constants — never inter-pattern
/// variables.
#[derive(Clone)]
pub struct AlphaPredicate {
    pub name: String,
    pub args: Vec<AlphaArg>,
    pub handler: PredicateFn,
}

impl AlphaPredicate {
    fn eval(&self, field: &Value) -> Result<bool, ReteError> {
        let args: Vec<Value> = self
            .args
            .iter()
            .map(|arg| match arg {
                AlphaArg::Field => field.clone(),
                AlphaArg::Const(value) => value.clone(),
            })
            .collect();
        (self.handler)(&args)
            .map(|value| value.is_truthy())
            .map_err(|message| ReteError::Predicate {
                name: self.name.clone(),
                message,
            })
    }
}

impl PartialEq for AlphaPredicate {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.args == other.args
    }
}

impl fmt::Debug for AlphaPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlphaPredicate")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// One intra-pattern constraint on a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldTest {
    Literal(Value),
    NotLiteral(Value),
    Kind(ValueKind),
    Predicate(AlphaPredicate),
    Not(Box<FieldTest>),
    AnyOf(Vec<FieldTest>),
    AllOf(Vec<FieldTest>),
}

impl FieldTest {
    pub(crate) fn matches(&self, value: &Value) -> Result<bool, ReteError> {
        match self {
            FieldTest::Literal(expected) => Ok(expected == value),
            FieldTest::NotLiteral(expected) => Ok(expected != value),
            FieldTest::Kind(kind) => Ok(kind.admits(value)),
            FieldTest::Predicate(predicate) => predicate.eval(value),
            FieldTest::Not(inner) => Ok(!inner.matches(value)?),
            FieldTest::AnyOf(tests) => {
                for test in tests {
                    if test.matches(value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FieldTest::AllOf(tests) => {
                for test in tests {
                    if !test.matches(value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// A field-indexed constraint: one link of a discrimination chain.
#[derive(Clone, Debug, PartialEq)]
pub struct AlphaTest {
    pub field: usize,
    pub test: FieldTest,
}

/// One node of the discrimination tree. Patterns whose constraint prefixes
/// coincide share the prefix chain.
#[derive(Debug)]
pub(crate) struct AlphaNode {
    pub test: AlphaTest,
    pub parent: Option<AlphaNodeId>,
    pub shape: ShapeKey,
    pub children: Vec<AlphaNodeId>,
    pub memory: Option<AlphaMemId>,
}

/// Per-shape root of the discrimination tree. A pattern without constant
/// constraints hangs its memory directly here.
#[derive(Debug, Default)]
pub(crate) struct AlphaShapeRoot {
    pub children: Vec<AlphaNodeId>,
    pub memory: Option<AlphaMemId>,
}

/// Set of WMEs passing one pattern's intra-condition filter chain, plus the
/// beta nodes it right-activates in registration order.
#[derive(Debug)]
pub(crate) struct AlphaMemory {
    pub wmes: Vec<FactId>,
    pub successors: Vec<NodeId>,
    pub node: Option<AlphaNodeId>,
    pub shape: ShapeKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn shape_keys_separate_ordered_arities_and_templates() {
        let a = ShapeKey::of(&Fact::ordered("on", vec![Value::symbol("x")]));
        let b = ShapeKey::of(&Fact::ordered(
            "on",
            vec![Value::symbol("x"), Value::symbol("y")],
        ));
        assert_ne!(a, b);

        let t = ShapeKey::of(&Fact::Template {
            template: "MAIN::t".into(),
            slots: vec![],
        });
        assert_eq!(
            t,
            ShapeKey::Template {
                name: "MAIN::t".into()
            }
        );
    }

    #[test]
    fn connected_field_tests_combine() {
        let test = FieldTest::AllOf(vec![
            FieldTest::Kind(ValueKind::Integer),
            FieldTest::Not(Box::new(FieldTest::Literal(Value::Integer(0)))),
        ]);
        assert!(test.matches(&Value::Integer(3)).unwrap());
        assert!(!test.matches(&Value::Integer(0)).unwrap());
        assert!(!test.matches(&Value::symbol("three")).unwrap());

        let any = FieldTest::AnyOf(vec![
            FieldTest::Literal(Value::symbol("red")),
            FieldTest::Literal(Value::symbol("blue")),
        ]);
        assert!(any.matches(&Value::symbol("blue")).unwrap());
        assert!(!any.matches(&Value::symbol("green")).unwrap());
    }

    #[test]
    fn alpha_predicates_receive_the_field_and_constants() {
        let predicate = AlphaPredicate {
            name: ">".into(),
            args: vec![AlphaArg::Field, AlphaArg::Const(Value::Integer(3))],
            handler: Arc::new(|args| {
                Ok(Value::boolean(
                    args[0].numeric_cmp(&args[1]) == Some(std::cmp::Ordering::Greater),
                ))
            }),
        };
        let test = FieldTest::Predicate(predicate);
        assert!(test.matches(&Value::Integer(5)).unwrap());
        assert!(!test.matches(&Value::Integer(2)).unwrap());
    }
}
