//! The function registry: built-in predicates and interpreted
//! deffunctions, with the argument constraints the network relies on when
//! hoisting deterministic tests into the alpha layer.

use crate::ast::Expr;
use crate::error::EngineError;
use lattice_facts::{Value, ValueKind};
use lattice_scope::SYSTEM_MODULE;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

const MAX_EVAL_DEPTH: usize = 64;

pub type Handler = Arc<dyn Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync>;

/// Argument predicates checked before a handler runs.
#[derive(Clone, Debug)]
pub enum ArgConstraint {
    MinArgs(usize),
    MaxArgs(usize),
    /// `position: None` constrains every argument.
    ArgTypes {
        position: Option<usize>,
        kinds: Vec<ValueKind>,
    },
}

#[derive(Clone)]
pub enum FunctionBody {
    Builtin(Handler),
    /// A deffunction: parameters bound to arguments, body expressions
    /// evaluated in order, last value returned.
    Interpreted { params: Vec<String>, body: Vec<Expr> },
}

/// A callable definition. Builtins register under the `?SYSTEM?` module.
/// The engine knows nothing about a handler's implementation — only its
/// constraints and whether it is deterministic (pure handlers may be
/// hoisted into alpha tests).
#[derive(Clone)]
pub struct FunctionDefinition {
    pub module: String,
    pub name: String,
    pub result: ValueKind,
    pub constraints: Vec<ArgConstraint>,
    pub deterministic: bool,
    pub body: FunctionBody,
}

impl fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("deterministic", &self.deterministic)
            .finish()
    }
}

impl FunctionDefinition {
    pub fn check_args(&self, args: &[Value]) -> Result<(), EngineError> {
        for constraint in &self.constraints {
            match constraint {
                ArgConstraint::MinArgs(min) => {
                    if args.len() < *min {
                        return Err(self.arity_error(format!(
                            "expected at least {min} arguments, got {}",
                            args.len()
                        )));
                    }
                }
                ArgConstraint::MaxArgs(max) => {
                    if args.len() > *max {
                        return Err(self.arity_error(format!(
                            "expected at most {max} arguments, got {}",
                            args.len()
                        )));
                    }
                }
                ArgConstraint::ArgTypes { position, kinds } => match position {
                    Some(index) => {
                        if let Some(value) = args.get(*index) {
                            self.check_kind(value, kinds, *index)?;
                        }
                    }
                    None => {
                        for (index, value) in args.iter().enumerate() {
                            self.check_kind(value, kinds, index)?;
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn check_kind(
        &self,
        value: &Value,
        kinds: &[ValueKind],
        index: usize,
    ) -> Result<(), EngineError> {
        if kinds.iter().any(|k| k.admits(value)) {
            return Ok(());
        }
        let expected = kinds
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(" | ");
        Err(self.arity_error(format!(
            "argument {} is {value}, expected {expected}",
            index + 1
        )))
    }

    fn arity_error(&self, reason: String) -> EngineError {
        EngineError::FunctionArityOrType {
            name: self.name.clone(),
            reason,
        }
    }
}

/// Name-keyed registry of callables. Re-registering a name replaces the
/// definition atomically.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionDefinition>,
}

impl FunctionRegistry {
    /// The built-in `?SYSTEM?` library.
    pub fn system() -> Self {
        let mut registry = FunctionRegistry::default();
        register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, def: FunctionDefinition) {
        self.functions.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

/// Evaluation environment for one expression.
pub struct EvalEnv<'a> {
    pub registry: &'a FunctionRegistry,
    pub globals: &'a BTreeMap<String, Value>,
    pub bindings: &'a BTreeMap<String, Value>,
}

pub fn eval_expr(expr: &Expr, env: &EvalEnv<'_>, depth: usize) -> Result<Value, EngineError> {
    if depth > MAX_EVAL_DEPTH {
        return Err(EngineError::EvaluationDepth);
    }
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => env
            .bindings
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnboundExprVariable(name.clone())),
        Expr::Global(name) => env
            .globals
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownGlobal(name.clone())),
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, env, depth + 1)?);
            }
            call_function(env, name, &values, depth)
        }
    }
}

pub fn call_function(
    env: &EvalEnv<'_>,
    name: &str,
    args: &[Value],
    depth: usize,
) -> Result<Value, EngineError> {
    if depth > MAX_EVAL_DEPTH {
        return Err(EngineError::EvaluationDepth);
    }
    let def = env
        .registry
        .get(name)
        .ok_or_else(|| EngineError::UnknownFunction(name.to_string()))?;
    def.check_args(args)?;
    match &def.body {
        FunctionBody::Builtin(handler) => handler(args),
        FunctionBody::Interpreted { params, body } => {
            let mut frame = BTreeMap::new();
            for (param, value) in params.iter().zip(args) {
                frame.insert(param.clone(), value.clone());
            }
            let inner = EvalEnv {
                registry: env.registry,
                globals: env.globals,
                bindings: &frame,
            };
            let mut last = Value::nil();
            for expr in body {
                last = eval_expr(expr, &inner, depth + 1)?;
            }
            Ok(last)
        }
    }
}

// ── Built-in library ─────────────────────────────────────────────────────

fn builtin(
    name: &str,
    result: ValueKind,
    constraints: Vec<ArgConstraint>,
    handler: Handler,
) -> FunctionDefinition {
    FunctionDefinition {
        module: SYSTEM_MODULE.to_string(),
        name: name.to_string(),
        result,
        constraints,
        deterministic: true,
        body: FunctionBody::Builtin(handler),
    }
}

fn numeric_comparator(
    name: &'static str,
    test: fn(Ordering) -> bool,
) -> FunctionDefinition {
    builtin(
        name,
        ValueKind::Symbol,
        vec![
            ArgConstraint::MinArgs(2),
            ArgConstraint::ArgTypes {
                position: None,
                kinds: vec![ValueKind::Number],
            },
        ],
        Arc::new(move |args| {
            for pair in args.windows(2) {
                let ord = pair[0].numeric_cmp(&pair[1]).ok_or_else(|| {
                    EngineError::Evaluation {
                        function: name.to_string(),
                        message: "arguments are not comparable".into(),
                    }
                })?;
                if !test(ord) {
                    return Ok(Value::boolean(false));
                }
            }
            Ok(Value::boolean(true))
        }),
    )
}

fn type_predicate(name: &str, kind: ValueKind) -> FunctionDefinition {
    builtin(
        name,
        ValueKind::Symbol,
        vec![ArgConstraint::MinArgs(1), ArgConstraint::MaxArgs(1)],
        Arc::new(move |args| Ok(Value::boolean(kind.admits(&args[0])))),
    )
}

fn register_builtins(registry: &mut FunctionRegistry) {
    // `=` compares only numeric values, converting integers to floats when
    // necessary; `eq` compares structurally.
    registry.register(builtin(
        "=",
        ValueKind::Symbol,
        vec![
            ArgConstraint::MinArgs(2),
            ArgConstraint::ArgTypes {
                position: None,
                kinds: vec![ValueKind::Number],
            },
        ],
        Arc::new(|args| {
            let first = &args[0];
            Ok(Value::boolean(
                args[1..].iter().all(|arg| first.numeric_eq(arg)),
            ))
        }),
    ));
    registry.register(builtin(
        "<>",
        ValueKind::Symbol,
        vec![
            ArgConstraint::MinArgs(2),
            ArgConstraint::ArgTypes {
                position: None,
                kinds: vec![ValueKind::Number],
            },
        ],
        Arc::new(|args| {
            let first = &args[0];
            Ok(Value::boolean(
                args[1..].iter().all(|arg| !first.numeric_eq(arg)),
            ))
        }),
    ));
    registry.register(numeric_comparator("<", |ord| ord == Ordering::Less));
    registry.register(numeric_comparator("<=", |ord| ord != Ordering::Greater));
    registry.register(numeric_comparator(">", |ord| ord == Ordering::Greater));
    registry.register(numeric_comparator(">=", |ord| ord != Ordering::Less));

    registry.register(builtin(
        "eq",
        ValueKind::Symbol,
        vec![ArgConstraint::MinArgs(2)],
        Arc::new(|args| {
            let first = &args[0];
            Ok(Value::boolean(args[1..].iter().all(|arg| first == arg)))
        }),
    ));
    registry.register(builtin(
        "neq",
        ValueKind::Symbol,
        vec![ArgConstraint::MinArgs(2)],
        Arc::new(|args| {
            let first = &args[0];
            Ok(Value::boolean(args[1..].iter().all(|arg| first != arg)))
        }),
    ));

    registry.register(arithmetic("+", |a, b| a + b, |a, b| a + b));
    registry.register(arithmetic("-", |a, b| a - b, |a, b| a - b));
    registry.register(arithmetic("*", |a, b| a * b, |a, b| a * b));
    registry.register(builtin(
        "/",
        ValueKind::Float,
        vec![
            ArgConstraint::MinArgs(2),
            ArgConstraint::ArgTypes {
                position: None,
                kinds: vec![ValueKind::Number],
            },
        ],
        Arc::new(|args| {
            let mut acc = args[0].as_number().expect("checked numeric");
            for arg in &args[1..] {
                let divisor = arg.as_number().expect("checked numeric");
                if divisor == 0.0 {
                    return Err(EngineError::Evaluation {
                        function: "/".into(),
                        message: "division by zero".into(),
                    });
                }
                acc /= divisor;
            }
            Ok(Value::Float(acc))
        }),
    ));

    registry.register(type_predicate("numberp", ValueKind::Number));
    registry.register(type_predicate("integerp", ValueKind::Integer));
    registry.register(type_predicate("floatp", ValueKind::Float));
    registry.register(type_predicate("symbolp", ValueKind::Symbol));
    registry.register(type_predicate("stringp", ValueKind::Str));
    registry.register(type_predicate("lexemep", ValueKind::Lexeme));
    registry.register(type_predicate("multifieldp", ValueKind::Multifield));

    registry.register(builtin(
        "not",
        ValueKind::Symbol,
        vec![ArgConstraint::MinArgs(1), ArgConstraint::MaxArgs(1)],
        Arc::new(|args| Ok(Value::boolean(!args[0].is_truthy()))),
    ));
    registry.register(builtin(
        "and",
        ValueKind::Symbol,
        vec![ArgConstraint::MinArgs(1)],
        Arc::new(|args| Ok(Value::boolean(args.iter().all(Value::is_truthy)))),
    ));
    registry.register(builtin(
        "or",
        ValueKind::Symbol,
        vec![ArgConstraint::MinArgs(1)],
        Arc::new(|args| Ok(Value::boolean(args.iter().any(Value::is_truthy)))),
    ));
}

fn arithmetic(
    name: &'static str,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> FunctionDefinition {
    builtin(
        name,
        ValueKind::Number,
        vec![
            ArgConstraint::MinArgs(2),
            ArgConstraint::ArgTypes {
                position: None,
                kinds: vec![ValueKind::Number],
            },
        ],
        Arc::new(move |args| {
            if args.iter().all(|a| matches!(a, Value::Integer(_))) {
                let mut acc = match args[0] {
                    Value::Integer(i) => i,
                    _ => unreachable!(),
                };
                for arg in &args[1..] {
                    if let Value::Integer(i) = arg {
                        acc = int_op(acc, *i);
                    }
                }
                Ok(Value::Integer(acc))
            } else {
                let mut acc = args[0].as_number().expect("checked numeric");
                for arg in &args[1..] {
                    acc = float_op(acc, arg.as_number().expect("checked numeric"));
                }
                Ok(Value::Float(acc))
            }
        }),
    )
}
