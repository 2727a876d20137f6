//! LHS compilation: lowering conditional elements onto the network's
//! structural builders, with binding-address bookkeeping.
//!
//! Variables are resolved positionally: each is bound at the token level
//! that carries its pattern's WME, and every later reference compiles to a
//! `(levels up, field index)` address. Deterministic predicates over a
//! single field hoist into the alpha network; everything else becomes a
//! join test or a test node.

use crate::ast::{ConditionalElement, Constraint, DefRule, Expr};
use crate::error::{EngineError, RuleError};
use crate::functions::{call_function, eval_expr, EvalEnv, FunctionRegistry};
use lattice_facts::Value;
use lattice_rete::{
    AlphaArg, AlphaPredicate, AlphaTest, BetaArg, BetaPredicate, BindingAddress, CmpOp, FieldRef,
    FieldTest, JoinTest, NodeId, PredicateFn, ProductionSpec, ReteNetwork, ShapeKey,
};
use lattice_scope::{DefKind, ScopeRegistry};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Normalized conditional element after And-flattening and Or-expansion.
#[derive(Clone, Debug)]
enum NormCE {
    Pattern(PatternAtom),
    Not(Vec<NormCE>),
    Test(Expr),
}

#[derive(Clone, Debug)]
struct PatternAtom {
    assigned: Option<String>,
    shape: ShapeKey,
    /// Field-indexed constraints in ascending field order.
    fields: Vec<(usize, Constraint)>,
}

/// What the current chain position emits: materialized tokens of a given
/// depth (memory-like nodes), or `(token, wme)` pairs that materialize at
/// the given depth (join nodes).
#[derive(Clone, Copy, Debug)]
enum Emits {
    Tokens(usize),
    Pairs(usize),
}

impl Emits {
    fn materialized_depth(self) -> usize {
        match self {
            Emits::Pairs(depth) => depth,
            Emits::Tokens(depth) => depth + 1,
        }
    }
}

#[derive(Clone, Copy)]
struct Chain {
    cur: NodeId,
    emits: Emits,
}

type VarMap = HashMap<String, (usize, FieldRef)>;

pub(crate) struct RuleCompiler<'a> {
    pub scopes: &'a ScopeRegistry,
    pub registry: Arc<FunctionRegistry>,
    pub globals: Arc<BTreeMap<String, Value>>,
    /// Module the rule lives in; bare template names resolve here.
    pub module: String,
    /// Qualified rule name.
    pub rule: String,
}

impl<'a> RuleCompiler<'a> {
    /// Compile every disjunct of the rule. Installation is transactional:
    /// on failure all nodes built so far are removed again.
    pub fn compile(
        &self,
        network: &mut ReteNetwork,
        rule: &DefRule,
        salience: i64,
        seq: u64,
    ) -> Result<Vec<NodeId>, EngineError> {
        let disjuncts = self.expand_lhs(&rule.lhs)?;
        network.begin_build();
        match self.build_disjuncts(network, &disjuncts, rule, salience, seq) {
            Ok(productions) => {
                network.commit_build();
                Ok(productions)
            }
            Err(err) => {
                network.rollback_build();
                Err(err)
            }
        }
    }

    fn build_disjuncts(
        &self,
        network: &mut ReteNetwork,
        disjuncts: &[Vec<NormCE>],
        rule: &DefRule,
        salience: i64,
        seq: u64,
    ) -> Result<Vec<NodeId>, EngineError> {
        let mut productions = Vec::new();
        for ces in disjuncts {
            let mut chain = Chain {
                cur: network.dummy_node(),
                emits: Emits::Tokens(0),
            };
            let mut vars: VarMap = HashMap::new();
            let mut first = true;
            for ce in ces {
                self.compile_ce(network, &mut chain, &mut vars, ce, first)?;
                first = false;
            }

            let mut used = Vec::new();
            for action in &rule.rhs {
                action.variables(&mut used);
            }
            for name in used {
                if !vars.contains_key(name) {
                    return Err(self.unbound(name));
                }
            }

            let depth = chain.emits.materialized_depth();
            let bindings = vars
                .iter()
                .map(|(name, (level, field))| {
                    (
                        name.clone(),
                        BindingAddress {
                            levels_up: depth - level,
                            field: *field,
                        },
                    )
                })
                .collect();
            let production = network.add_production(
                chain.cur,
                ProductionSpec {
                    rule: self.rule.clone(),
                    salience,
                    seq,
                    bindings,
                },
            )?;
            productions.push(production);
        }
        Ok(productions)
    }

    // ── Normalization ────────────────────────────────────────────────────

    fn expand_lhs(&self, lhs: &[ConditionalElement]) -> Result<Vec<Vec<NormCE>>, EngineError> {
        let mut acc: Vec<Vec<NormCE>> = vec![Vec::new()];
        for ce in lhs {
            acc = self.cross(acc, self.expand(ce)?);
        }
        Ok(acc)
    }

    fn cross(&self, acc: Vec<Vec<NormCE>>, branches: Vec<Vec<NormCE>>) -> Vec<Vec<NormCE>> {
        let mut next = Vec::with_capacity(acc.len() * branches.len());
        for prefix in &acc {
            for branch in &branches {
                let mut seq = prefix.clone();
                seq.extend(branch.iter().cloned());
                next.push(seq);
            }
        }
        next
    }

    fn expand(&self, ce: &ConditionalElement) -> Result<Vec<Vec<NormCE>>, EngineError> {
        match ce {
            ConditionalElement::Ordered(_) | ConditionalElement::Template(_) => {
                Ok(vec![vec![NormCE::Pattern(self.atom(ce, None)?)]])
            }
            ConditionalElement::Assigned { variable, pattern } => Ok(vec![vec![NormCE::Pattern(
                self.atom(pattern, Some(variable.clone()))?,
            )]]),
            ConditionalElement::And(ces) => {
                let mut acc: Vec<Vec<NormCE>> = vec![Vec::new()];
                for ce in ces {
                    acc = self.cross(acc, self.expand(ce)?);
                }
                Ok(acc)
            }
            ConditionalElement::Or(ces) => {
                let mut out = Vec::new();
                for ce in ces {
                    out.extend(self.expand(ce)?);
                }
                Ok(out)
            }
            ConditionalElement::Not(inner) => {
                let mut branches = self.expand(inner)?;
                if branches.len() != 1 {
                    return Err(self.invalid_negation());
                }
                let seq = branches.pop().expect("checked length");
                if seq.is_empty() {
                    return Err(self.invalid_negation());
                }
                if seq.len() == 1 && !matches!(seq[0], NormCE::Pattern(_)) {
                    return Err(self.invalid_negation());
                }
                Ok(vec![vec![NormCE::Not(seq)]])
            }
            ConditionalElement::Test(expr) => Ok(vec![vec![NormCE::Test(expr.clone())]]),
        }
    }

    fn atom(
        &self,
        ce: &ConditionalElement,
        assigned: Option<String>,
    ) -> Result<PatternAtom, EngineError> {
        match ce {
            ConditionalElement::Ordered(pattern) => Ok(PatternAtom {
                assigned,
                shape: ShapeKey::Ordered {
                    head: pattern.head.clone(),
                    arity: pattern.fields.len(),
                },
                fields: pattern.fields.iter().cloned().enumerate().collect(),
            }),
            ConditionalElement::Template(pattern) => {
                let template = self.resolve_template(&pattern.template)?;
                let mut fields = Vec::with_capacity(pattern.slots.len());
                for (slot, constraint) in &pattern.slots {
                    let index =
                        template
                            .slot_index(slot)
                            .ok_or_else(|| RuleError::UnknownSlot {
                                rule: self.rule.clone(),
                                template: template.qualified_name(),
                                slot: slot.clone(),
                            })?;
                    fields.push((index, constraint.clone()));
                }
                fields.sort_by_key(|(index, _)| *index);
                Ok(PatternAtom {
                    assigned,
                    shape: ShapeKey::Template {
                        name: template.qualified_name(),
                    },
                    fields,
                })
            }
            _ => Err(RuleError::UnsupportedConstraint {
                rule: self.rule.clone(),
                detail: "a fact binding requires a simple pattern".into(),
            }
            .into()),
        }
    }

    fn resolve_template(&self, name: &str) -> Result<&lattice_facts::TemplateDef, EngineError> {
        let looked_up = match name.split_once("::") {
            Some((module, bare)) => self.scopes.scope(module)?.get(DefKind::Template, bare),
            None => self.scopes.scope(&self.module)?.get(DefKind::Template, name),
        };
        let def = looked_up.ok_or_else(|| RuleError::UnknownTemplate {
            rule: self.rule.clone(),
            template: name.to_string(),
        })?;
        Ok(def.as_template().expect("template definition payload"))
    }

    // ── Chain construction ───────────────────────────────────────────────

    fn compile_ce(
        &self,
        network: &mut ReteNetwork,
        chain: &mut Chain,
        vars: &mut VarMap,
        ce: &NormCE,
        first: bool,
    ) -> Result<(), EngineError> {
        match ce {
            NormCE::Pattern(atom) => self.compile_positive(network, chain, vars, atom),
            NormCE::Not(seq) => self.compile_not(network, chain, vars, seq),
            NormCE::Test(expr) => {
                if first {
                    return Err(RuleError::TestFirst {
                        rule: self.rule.clone(),
                    }
                    .into());
                }
                self.compile_test(network, chain, vars, expr)
            }
        }
    }

    fn compile_positive(
        &self,
        network: &mut ReteNetwork,
        chain: &mut Chain,
        vars: &mut VarMap,
        atom: &PatternAtom,
    ) -> Result<(), EngineError> {
        if let Emits::Pairs(depth) = chain.emits {
            chain.cur = network.build_or_share_beta_memory(chain.cur)?;
            chain.emits = Emits::Tokens(depth);
        }
        let depth = match chain.emits {
            Emits::Tokens(depth) => depth,
            Emits::Pairs(_) => unreachable!("memory interposed above"),
        };
        let virtual_depth = depth + 1;

        let (alpha_tests, join_tests) = self.analyze_fields(atom, vars, virtual_depth)?;
        let alpha = network.build_or_share_alpha_memory(atom.shape.clone(), &alpha_tests)?;
        chain.cur = network.build_or_share_join(chain.cur, alpha, join_tests)?;
        chain.emits = Emits::Pairs(virtual_depth);

        if let Some(variable) = &atom.assigned {
            if vars.contains_key(variable) {
                return Err(RuleError::UnsupportedConstraint {
                    rule: self.rule.clone(),
                    detail: format!("fact binding reuses variable ?{variable}"),
                }
                .into());
            }
            vars.insert(variable.clone(), (virtual_depth, FieldRef::Fact));
        }
        Ok(())
    }

    fn compile_not(
        &self,
        network: &mut ReteNetwork,
        chain: &mut Chain,
        vars: &mut VarMap,
        seq: &[NormCE],
    ) -> Result<(), EngineError> {
        if seq.len() == 1 {
            let NormCE::Pattern(atom) = &seq[0] else {
                return Err(self.invalid_negation());
            };
            return self.compile_negative(network, chain, vars, atom);
        }

        // Negated conjunction: compile the partner circuit off the shared
        // parent first, then couple the NCC pair to it. Variables bound
        // inside do not escape.
        let virtual_depth = chain.emits.materialized_depth();
        let mut sub_chain = *chain;
        let mut sub_vars = vars.clone();
        for ce in seq {
            self.compile_ce(network, &mut sub_chain, &mut sub_vars, ce, false)?;
        }
        let partner_depth = sub_chain.emits.materialized_depth();
        debug_assert!(partner_depth > virtual_depth);

        chain.cur = network.build_ncc(chain.cur, sub_chain.cur, partner_depth - virtual_depth)?;
        chain.emits = Emits::Tokens(virtual_depth);
        Ok(())
    }

    fn compile_negative(
        &self,
        network: &mut ReteNetwork,
        chain: &mut Chain,
        vars: &VarMap,
        atom: &PatternAtom,
    ) -> Result<(), EngineError> {
        if atom.assigned.is_some() {
            return Err(self.invalid_negation());
        }
        let token_depth = chain.emits.materialized_depth();
        let virtual_depth = token_depth + 1;

        // Bindings made inside a negated pattern stay local to it.
        let mut scratch = vars.clone();
        let (alpha_tests, join_tests) = self.analyze_fields(atom, &mut scratch, virtual_depth)?;
        let alpha = network.build_or_share_alpha_memory(atom.shape.clone(), &alpha_tests)?;
        chain.cur = network.build_or_share_negative(chain.cur, alpha, join_tests)?;
        chain.emits = Emits::Tokens(token_depth);
        Ok(())
    }

    fn compile_test(
        &self,
        network: &mut ReteNetwork,
        chain: &mut Chain,
        vars: &VarMap,
        expr: &Expr,
    ) -> Result<(), EngineError> {
        self.validate_calls(expr)?;
        let virtual_depth = chain.emits.materialized_depth();
        let predicate = self.beta_predicate(expr, vars, virtual_depth)?;
        chain.cur = network.build_or_share_test(chain.cur, predicate)?;
        chain.emits = Emits::Tokens(virtual_depth);
        Ok(())
    }

    // ── Constraint analysis ──────────────────────────────────────────────

    fn analyze_fields(
        &self,
        atom: &PatternAtom,
        vars: &mut VarMap,
        virtual_depth: usize,
    ) -> Result<(Vec<AlphaTest>, Vec<JoinTest>), EngineError> {
        let mut alpha = Vec::new();
        let mut joins = Vec::new();
        for (field, constraint) in &atom.fields {
            self.analyze_constraint(*field, constraint, vars, virtual_depth, &mut alpha, &mut joins)?;
        }
        Ok((alpha, joins))
    }

    fn analyze_constraint(
        &self,
        field: usize,
        constraint: &Constraint,
        vars: &mut VarMap,
        virtual_depth: usize,
        alpha: &mut Vec<AlphaTest>,
        joins: &mut Vec<JoinTest>,
    ) -> Result<(), EngineError> {
        match constraint {
            Constraint::Wildcard => {}
            Constraint::Literal(value) => alpha.push(AlphaTest {
                field,
                test: FieldTest::Literal(value.clone()),
            }),
            Constraint::Variable(name) => match vars.get(name).copied() {
                Some((level, FieldRef::Pos(other_field))) => {
                    joins.push(JoinTest::Compare {
                        own_field: field,
                        levels_up: virtual_depth - level,
                        other_field,
                        op: CmpOp::Eq,
                    });
                }
                Some((_, FieldRef::Fact)) => {
                    return Err(RuleError::UnsupportedConstraint {
                        rule: self.rule.clone(),
                        detail: format!("fact binding ?{name} used as a field value"),
                    }
                    .into());
                }
                None => {
                    vars.insert(name.clone(), (virtual_depth, FieldRef::Pos(field)));
                }
            },
            Constraint::And(terms) => {
                for term in terms {
                    self.analyze_constraint(field, term, vars, virtual_depth, alpha, joins)?;
                }
            }
            Constraint::Not(inner) => match &**inner {
                Constraint::Literal(value) => alpha.push(AlphaTest {
                    field,
                    test: FieldTest::NotLiteral(value.clone()),
                }),
                Constraint::Variable(name) => match vars.get(name).copied() {
                    Some((level, FieldRef::Pos(other_field))) => {
                        joins.push(JoinTest::Compare {
                            own_field: field,
                            levels_up: virtual_depth - level,
                            other_field,
                            op: CmpOp::Ne,
                        });
                    }
                    _ => return Err(self.unbound(name)),
                },
                other => {
                    let test = self.alpha_subtree(other)?;
                    alpha.push(AlphaTest {
                        field,
                        test: FieldTest::Not(Box::new(test)),
                    });
                }
            },
            Constraint::Or(_) => {
                let test = self.alpha_subtree(constraint)?;
                alpha.push(AlphaTest { field, test });
            }
            Constraint::Test(expr) => {
                self.validate_calls(expr)?;
                if let Some(kind) = self.try_type_test(expr, vars, virtual_depth, field) {
                    alpha.push(AlphaTest {
                        field,
                        test: FieldTest::Kind(kind),
                    });
                } else {
                    match self.try_alpha_predicate(expr, vars, virtual_depth, field) {
                        Some(predicate) => alpha.push(AlphaTest {
                            field,
                            test: FieldTest::Predicate(predicate),
                        }),
                        None => joins.push(JoinTest::Predicate(
                            self.beta_predicate(expr, vars, virtual_depth)?,
                        )),
                    }
                }
            }
        }
        Ok(())
    }

    /// Lower a variable-free constraint subtree (under `|` or `~`) to an
    /// alpha field test.
    fn alpha_subtree(&self, constraint: &Constraint) -> Result<FieldTest, EngineError> {
        match constraint {
            Constraint::Literal(value) => Ok(FieldTest::Literal(value.clone())),
            Constraint::Not(inner) => Ok(FieldTest::Not(Box::new(self.alpha_subtree(inner)?))),
            Constraint::And(terms) => Ok(FieldTest::AllOf(
                terms
                    .iter()
                    .map(|t| self.alpha_subtree(t))
                    .collect::<Result<_, _>>()?,
            )),
            Constraint::Or(terms) => Ok(FieldTest::AnyOf(
                terms
                    .iter()
                    .map(|t| self.alpha_subtree(t))
                    .collect::<Result<_, _>>()?,
            )),
            Constraint::Test(expr) => {
                self.validate_calls(expr)?;
                self.try_alpha_predicate(expr, &VarMap::new(), 0, usize::MAX)
                    .map(FieldTest::Predicate)
                    .ok_or_else(|| {
                        RuleError::UnsupportedConstraint {
                            rule: self.rule.clone(),
                            detail: "only deterministic variable-free tests may appear under | or ~"
                                .into(),
                        }
                        .into()
                    })
            }
            Constraint::Variable(_) | Constraint::Wildcard => Err(RuleError::UnsupportedConstraint {
                rule: self.rule.clone(),
                detail: "variables cannot appear under | or ~ connectives".into(),
            }
            .into()),
        }
    }

    /// A built-in type predicate over the field under test lowers to a
    /// plain kind test, the cheapest alpha discrimination.
    fn try_type_test(
        &self,
        expr: &Expr,
        vars: &VarMap,
        virtual_depth: usize,
        field: usize,
    ) -> Option<lattice_facts::ValueKind> {
        use lattice_facts::ValueKind;
        let Expr::Call { name, args } = expr else {
            return None;
        };
        let kind = match name.as_str() {
            "numberp" => ValueKind::Number,
            "integerp" => ValueKind::Integer,
            "floatp" => ValueKind::Float,
            "symbolp" => ValueKind::Symbol,
            "stringp" => ValueKind::Str,
            "lexemep" => ValueKind::Lexeme,
            "multifieldp" => ValueKind::Multifield,
            _ => return None,
        };
        match args.as_slice() {
            [Expr::Variable(var)] => match vars.get(var.as_str()) {
                Some((level, FieldRef::Pos(position)))
                    if *level == virtual_depth && *position == field =>
                {
                    Some(kind)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// A call hoists into the alpha network when the function is
    /// deterministic and every argument is a constant or the field under
    /// test itself.
    fn try_alpha_predicate(
        &self,
        expr: &Expr,
        vars: &VarMap,
        virtual_depth: usize,
        field: usize,
    ) -> Option<AlphaPredicate> {
        let Expr::Call { name, args } = expr else {
            return None;
        };
        let def = self.registry.get(name)?;
        if !def.deterministic {
            return None;
        }
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Expr::Literal(value) => out.push(AlphaArg::Const(value.clone())),
                Expr::Variable(var) => match vars.get(var.as_str()) {
                    Some((level, FieldRef::Pos(position)))
                        if *level == virtual_depth && *position == field =>
                    {
                        out.push(AlphaArg::Field)
                    }
                    _ => return None,
                },
                _ => return None,
            }
        }
        Some(AlphaPredicate {
            name: name.clone(),
            args: out,
            handler: self.call_handler(name.clone()),
        })
    }

    fn beta_predicate(
        &self,
        expr: &Expr,
        vars: &VarMap,
        virtual_depth: usize,
    ) -> Result<BetaPredicate, EngineError> {
        let mut names = Vec::new();
        expr.variables(&mut names);

        let mut args = Vec::with_capacity(names.len());
        let mut ordered = Vec::with_capacity(names.len());
        for name in names {
            let (level, field) = vars.get(name).copied().ok_or_else(|| self.unbound(name))?;
            args.push(BetaArg::Binding(BindingAddress {
                levels_up: virtual_depth - level,
                field,
            }));
            ordered.push(name.to_string());
        }

        Ok(BetaPredicate {
            name: expr.to_string(),
            args,
            handler: self.expr_handler(expr.clone(), ordered),
        })
    }

    /// Handler evaluating a full expression with the resolved binding
    /// values. Captures a snapshot of the function registry and globals at
    /// compile time.
    fn expr_handler(&self, expr: Expr, names: Vec<String>) -> PredicateFn {
        let registry = Arc::clone(&self.registry);
        let globals = Arc::clone(&self.globals);
        Arc::new(move |values: &[Value]| {
            let mut bindings = BTreeMap::new();
            for (name, value) in names.iter().zip(values) {
                bindings.insert(name.clone(), value.clone());
            }
            let env = EvalEnv {
                registry: &registry,
                globals: &globals,
                bindings: &bindings,
            };
            eval_expr(&expr, &env, 0).map_err(|err| err.to_string())
        })
    }

    /// Handler invoking one named function directly over alpha arguments.
    fn call_handler(&self, name: String) -> PredicateFn {
        let registry = Arc::clone(&self.registry);
        let globals = Arc::clone(&self.globals);
        Arc::new(move |args: &[Value]| {
            let bindings = BTreeMap::new();
            let env = EvalEnv {
                registry: &registry,
                globals: &globals,
                bindings: &bindings,
            };
            call_function(&env, &name, args, 0).map_err(|err| err.to_string())
        })
    }

    /// Static checks on every call in an LHS expression: the function must
    /// exist and the statically known argument count must satisfy its
    /// arity constraints.
    fn validate_calls(&self, expr: &Expr) -> Result<(), EngineError> {
        let Expr::Call { name, args } = expr else {
            return Ok(());
        };
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| RuleError::BadCall {
                rule: self.rule.clone(),
                function: name.clone(),
                reason: "unknown function".into(),
            })?;
        for constraint in &def.constraints {
            match constraint {
                crate::functions::ArgConstraint::MinArgs(min) if args.len() < *min => {
                    return Err(RuleError::BadCall {
                        rule: self.rule.clone(),
                        function: name.clone(),
                        reason: format!("expected at least {min} arguments, got {}", args.len()),
                    }
                    .into());
                }
                crate::functions::ArgConstraint::MaxArgs(max) if args.len() > *max => {
                    return Err(RuleError::BadCall {
                        rule: self.rule.clone(),
                        function: name.clone(),
                        reason: format!("expected at most {max} arguments, got {}", args.len()),
                    }
                    .into());
                }
                _ => {}
            }
        }
        for arg in args {
            self.validate_calls(arg)?;
        }
        Ok(())
    }

    fn unbound(&self, variable: &str) -> EngineError {
        RuleError::UnboundVariable {
            rule: self.rule.clone(),
            variable: variable.to_string(),
        }
        .into()
    }

    fn invalid_negation(&self) -> EngineError {
        RuleError::InvalidNegation {
            rule: self.rule.clone(),
        }
        .into()
    }
}
