//! End-to-end scenarios driving the engine through the construct seam, the
//! way a parser front-end would.

use lattice_engine::ast::{
    Action, ConditionalElement, Constraint, Construct, DefFacts, DefFunction, DefModule, DefRule,
    DefTemplate, Expr, FactSpec, OrderedPattern, RuleDeclarations, TemplatePattern,
};
use lattice_engine::{
    DefKind, DuplicatePolicy, Engine, EngineError, EngineOptions, SalienceRecency, ScopeError,
    ScopeExport, ScopeImport, SlotDef, Value,
};

fn template_t() -> Construct {
    Construct::DefTemplate(DefTemplate {
        module: None,
        name: "t".into(),
        slots: vec![SlotDef::single("A"), SlotDef::single("B")],
    })
}

fn tp(slots: Vec<(&str, Constraint)>) -> ConditionalElement {
    ConditionalElement::Template(TemplatePattern {
        template: "t".into(),
        slots: slots
            .into_iter()
            .map(|(name, constraint)| (name.to_string(), constraint))
            .collect(),
    })
}

fn op(head: &str, fields: Vec<Constraint>) -> ConditionalElement {
    ConditionalElement::Ordered(OrderedPattern {
        head: head.into(),
        fields,
    })
}

fn lit(value: i64) -> Constraint {
    Constraint::Literal(Value::Integer(value))
}

fn var(name: &str) -> Constraint {
    Constraint::Variable(name.into())
}

fn rule(name: &str, lhs: Vec<ConditionalElement>, rhs: Vec<Action>) -> Construct {
    Construct::DefRule(DefRule {
        module: None,
        name: name.into(),
        comment: None,
        declarations: RuleDeclarations::default(),
        lhs,
        rhs,
    })
}

fn salient_rule(
    name: &str,
    salience: i64,
    lhs: Vec<ConditionalElement>,
    rhs: Vec<Action>,
) -> Construct {
    Construct::DefRule(DefRule {
        module: None,
        name: name.into(),
        comment: None,
        declarations: RuleDeclarations {
            salience,
            auto_focus: false,
        },
        lhs,
        rhs,
    })
}

fn assert_t(engine: &mut Engine, a: i64, b: Option<i64>) -> lattice_engine::FactId {
    let mut slots = vec![("A".to_string(), Value::Integer(a))];
    if let Some(b) = b {
        slots.push(("B".to_string(), Value::Integer(b)));
    }
    engine.assert_template("t", slots).expect("assert")
}

// ── S1 / S2: basic join and retraction ───────────────────────────────────

#[test]
fn s1_basic_join_activates_exactly_once() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule(
            "r",
            vec![
                tp(vec![("A", var("x")), ("B", lit(1))]),
                tp(vec![("A", var("x")), ("B", lit(2))]),
            ],
            vec![],
        ))
        .expect("rule");

    let f1 = assert_t(&mut engine, 5, Some(1));
    let f2 = assert_t(&mut engine, 5, Some(2));
    let _f3 = assert_t(&mut engine, 6, Some(1));

    assert_eq!(engine.agenda().len(), 1, "exactly one activation");
    let activation = &engine.agenda()[0];
    assert_eq!(activation.matched_facts, vec![f1, f2]);
    assert_eq!(activation.bindings["x"], Value::Integer(5));
}

#[test]
fn s2_retraction_removes_the_pending_activation() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule(
            "r",
            vec![
                tp(vec![("A", var("x")), ("B", lit(1))]),
                tp(vec![("A", var("x")), ("B", lit(2))]),
            ],
            vec![],
        ))
        .expect("rule");

    assert_t(&mut engine, 5, Some(1));
    let f2 = assert_t(&mut engine, 5, Some(2));
    assert_eq!(engine.agenda().len(), 1);

    engine.retract(f2).expect("retract");
    assert!(engine.agenda().is_empty(), "activation gone before firing");
    assert_eq!(engine.run(None).expect("run"), 0);
}

// ── S3: single-pattern negation ──────────────────────────────────────────

#[test]
fn s3_not_activation_tracks_the_blocking_fact() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule(
            "r",
            vec![
                tp(vec![("A", var("x"))]),
                ConditionalElement::Not(Box::new(tp(vec![("A", var("x")), ("B", lit(99))]))),
            ],
            vec![],
        ))
        .expect("rule");

    let f10 = assert_t(&mut engine, 7, None);
    assert_eq!(engine.agenda().len(), 1);
    assert_eq!(engine.agenda()[0].matched_facts, vec![f10]);
    assert_eq!(engine.agenda()[0].bindings["x"], Value::Integer(7));

    // The blocker arrives: the activation is retracted.
    let f11 = assert_t(&mut engine, 7, Some(99));
    assert!(
        !engine
            .agenda()
            .iter()
            .any(|a| a.matched_facts == vec![f10]),
        "blocked match must leave the agenda"
    );

    // The blocker goes: the activation reappears.
    engine.retract(f11).expect("retract");
    assert!(engine
        .agenda()
        .iter()
        .any(|a| a.matched_facts == vec![f10]));
}

// ── S4: negated conjunction ──────────────────────────────────────────────

#[test]
fn s4_ncc_gates_on_the_complete_conjunction() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule(
            "r",
            vec![
                tp(vec![("A", var("x"))]),
                ConditionalElement::Not(Box::new(ConditionalElement::And(vec![
                    tp(vec![("A", var("x")), ("B", lit(1))]),
                    tp(vec![("A", var("x")), ("B", lit(2))]),
                ]))),
            ],
            vec![],
        ))
        .expect("rule");

    let f20 = assert_t(&mut engine, 3, None);
    let has_f20 = |engine: &Engine| {
        engine
            .agenda()
            .iter()
            .any(|a| a.matched_facts == vec![f20])
    };
    assert!(has_f20(&engine), "no conjunction yet");

    let f21 = assert_t(&mut engine, 3, Some(1));
    assert!(has_f20(&engine), "conjunction still incomplete");

    assert_t(&mut engine, 3, Some(2));
    assert!(!has_f20(&engine), "complete conjunction blocks the match");

    engine.retract(f21).expect("retract");
    assert!(has_f20(&engine), "activation restored");
}

// ── S5 / S6: module imports ──────────────────────────────────────────────

#[test]
fn s5_all_import_resolves_definitions_added_later() {
    let mut engine = Engine::new();
    engine
        .load(Construct::DefModule(DefModule {
            name: "A".into(),
            imports: vec![],
            exports: vec![ScopeExport::all()],
        }))
        .expect("module A");
    engine
        .load(Construct::DefModule(DefModule {
            name: "B".into(),
            imports: vec![ScopeImport::all("A")],
            exports: vec![],
        }))
        .expect("module B");

    // Defined in A after B was created.
    engine
        .load(Construct::DefTemplate(DefTemplate {
            module: Some("A".into()),
            name: "late".into(),
            slots: vec![SlotDef::single("s")],
        }))
        .expect("late template");

    engine.switch_module("B").expect("switch");
    let def = engine
        .scopes()
        .resolve(DefKind::Template, "late")
        .expect("late visible in B without re-declaration");
    assert_eq!(def.module, "A");

    // And it is usable from B.
    engine
        .assert_template("late", vec![("s".into(), Value::symbol("ok"))])
        .expect("assert through the import");
}

#[test]
fn s6_conflicting_imports_fail_cleanly() {
    let mut engine = Engine::new();
    for module in ["A", "C"] {
        engine
            .load(Construct::DefModule(DefModule {
                name: module.into(),
                imports: vec![],
                exports: vec![ScopeExport::all()],
            }))
            .expect("module");
        engine
            .load(Construct::DefTemplate(DefTemplate {
                module: Some(module.into()),
                name: "t".into(),
                slots: if module == "A" {
                    vec![SlotDef::single("x")]
                } else {
                    vec![SlotDef::single("x"), SlotDef::single("y")]
                },
            }))
            .expect("template");
    }

    let err = engine.load(Construct::DefModule(DefModule {
        name: "D".into(),
        imports: vec![ScopeImport::all("A"), ScopeImport::all("C")],
        exports: vec![],
    }));
    assert!(matches!(
        err,
        Err(EngineError::Scope(ScopeError::DefinitionConflict { .. }))
    ));

    // A and C are untouched, with no dangling subscriptions.
    for module in ["A", "C"] {
        assert!(engine
            .scopes()
            .scope(module)
            .unwrap()
            .has(DefKind::Template, "t"));
        assert!(!engine.scopes().has_subscriber(module, "D"));
    }
}

// ── Supplemental behavior ────────────────────────────────────────────────

#[test]
fn duplicate_facts_coalesce_by_default() {
    let mut engine = Engine::new();
    let a = engine
        .assert_ordered("ping", vec![Value::Integer(1)])
        .expect("assert");
    let b = engine
        .assert_ordered("ping", vec![Value::Integer(1)])
        .expect("assert");
    assert_eq!(a, b);

    let mut engine = Engine::with_options(EngineOptions {
        duplicates: DuplicatePolicy::Allow,
        strategy: Box::new(SalienceRecency),
    });
    let a = engine
        .assert_ordered("ping", vec![Value::Integer(1)])
        .expect("assert");
    let b = engine
        .assert_ordered("ping", vec![Value::Integer(1)])
        .expect("assert");
    assert_ne!(a, b);
}

#[test]
fn reset_reasserts_deffacts_and_restarts_fact_ids() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(Construct::DefFacts(DefFacts {
            module: None,
            name: "seed".into(),
            comment: None,
            facts: vec![FactSpec::Template {
                template: "t".into(),
                slots: vec![("A".into(), Expr::int(1))],
            }],
        }))
        .expect("deffacts");
    engine
        .load(rule("watch", vec![tp(vec![("A", var("x"))])], vec![]))
        .expect("rule");

    assert_t(&mut engine, 9, None);
    assert_eq!(engine.stats().facts, 1);

    engine.reset().expect("reset");
    assert_eq!(engine.stats().facts, 1, "only the deffacts fact");
    let (id, fact) = engine.facts().next().expect("seeded fact");
    assert_eq!(id, lattice_engine::FactId(1));
    assert_eq!(fact.slot("A"), Some(&Value::Integer(1)));
    assert_eq!(engine.agenda().len(), 1, "the seed re-activates the rule");
}

#[test]
fn salience_orders_firings() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(salient_rule(
            "low",
            0,
            vec![tp(vec![("A", var("x"))])],
            vec![Action::Assert(FactSpec::Ordered {
                head: "fired".into(),
                fields: vec![Expr::Literal(Value::symbol("low"))],
            })],
        ))
        .expect("low");
    engine
        .load(salient_rule(
            "high",
            10,
            vec![tp(vec![("A", var("x"))])],
            vec![Action::Assert(FactSpec::Ordered {
                head: "fired".into(),
                fields: vec![Expr::Literal(Value::symbol("high"))],
            })],
        ))
        .expect("high");

    assert_t(&mut engine, 1, None);
    assert_eq!(engine.run(None).expect("run"), 2);

    let mut markers: Vec<_> = engine
        .facts()
        .filter(|(_, f)| matches!(f, lattice_engine::Fact::Ordered { head, .. } if head == "fired"))
        .collect();
    markers.sort_by_key(|(id, _)| *id);
    assert_eq!(markers.len(), 2);
    assert_eq!(
        markers[0].1.field(0),
        Some(&Value::symbol("high")),
        "higher salience fires first"
    );
}

#[test]
fn rhs_asserts_recurse_through_the_network() {
    // (count ?n) with ?n < 3 asserts (count (+ ?n 1)): data recursion.
    let mut engine = Engine::new();
    engine
        .load(rule(
            "count-up",
            vec![
                op("count", vec![var("n")]),
                ConditionalElement::Test(Expr::call("<", vec![Expr::var("n"), Expr::int(3)])),
            ],
            vec![Action::Assert(FactSpec::Ordered {
                head: "count".into(),
                fields: vec![Expr::call("+", vec![Expr::var("n"), Expr::int(1)])],
            })],
        ))
        .expect("rule");

    engine
        .assert_ordered("count", vec![Value::Integer(0)])
        .expect("seed");
    let fired = engine.run(None).expect("run");
    assert_eq!(fired, 3, "fires for 0, 1 and 2");
    assert_eq!(engine.stats().facts, 4, "count 0 through 3");
    assert!(engine.agenda().is_empty());
}

#[test]
fn rhs_retract_consumes_the_matched_fact() {
    let mut engine = Engine::new();
    engine
        .load(rule(
            "consume",
            vec![ConditionalElement::Assigned {
                variable: "f".into(),
                pattern: Box::new(op("job", vec![var("id")])),
            }],
            vec![Action::Retract(Expr::var("f"))],
        ))
        .expect("rule");

    engine
        .assert_ordered("job", vec![Value::Integer(1)])
        .expect("job 1");
    engine
        .assert_ordered("job", vec![Value::Integer(2)])
        .expect("job 2");
    assert_eq!(engine.run(None).expect("run"), 2);
    assert_eq!(engine.stats().facts, 0, "both jobs consumed");
}

#[test]
fn failed_rule_installation_rolls_the_network_back() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule("good", vec![tp(vec![("A", var("x"))])], vec![]))
        .expect("good rule");
    let nodes_before = engine.stats().network.nodes;

    // A valid LHS builds nodes (sharing the first join with "good")
    // before the unbound RHS variable is detected; the partial build must
    // be rolled back.
    let err = engine.load(rule(
        "bad",
        vec![tp(vec![("A", var("x"))]), tp(vec![("B", var("y"))])],
        vec![Action::Retract(Expr::var("ghost"))],
    ));
    assert!(matches!(err, Err(EngineError::Rule(_))));
    assert_eq!(
        engine.stats().network.nodes,
        nodes_before,
        "partial build removed"
    );
    assert_eq!(engine.stats().rules, 1);

    // The surviving rule still matches.
    assert_t(&mut engine, 1, None);
    assert_eq!(engine.agenda().len(), 1);
}

#[test]
fn unknown_slot_is_a_compile_error() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    let err = engine.load(rule(
        "bad",
        vec![tp(vec![("missing", var("y"))])],
        vec![],
    ));
    assert!(matches!(err, Err(EngineError::Rule(_))));
    assert_eq!(engine.stats().rules, 0);
}

#[test]
fn or_expansion_matches_either_branch_once() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule(
            "either",
            vec![ConditionalElement::Or(vec![
                tp(vec![("B", lit(1))]),
                tp(vec![("B", lit(2))]),
            ])],
            vec![],
        ))
        .expect("rule");

    let f1 = assert_t(&mut engine, 0, Some(1));
    let f2 = assert_t(&mut engine, 0, Some(2));
    assert_t(&mut engine, 0, Some(3));

    let mut matched: Vec<_> = engine
        .agenda()
        .iter()
        .map(|a| a.matched_facts.clone())
        .collect();
    matched.sort();
    assert_eq!(matched, vec![vec![f1], vec![f2]]);
}

#[test]
fn negation_first_rules_match_the_empty_world() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule(
            "vacuous",
            vec![ConditionalElement::Not(Box::new(tp(vec![("A", lit(1))])))],
            vec![],
        ))
        .expect("rule");

    assert_eq!(engine.agenda().len(), 1, "active while no fact matches");

    let f = assert_t(&mut engine, 1, None);
    assert!(engine.agenda().is_empty());

    engine.retract(f).expect("retract");
    assert_eq!(engine.agenda().len(), 1);
}

#[test]
fn undefrule_removes_activations_and_shared_rules_survive() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule("one", vec![tp(vec![("A", var("x"))])], vec![]))
        .expect("one");
    engine
        .load(rule(
            "two",
            vec![tp(vec![("A", var("x"))]), tp(vec![("B", var("y"))])],
            vec![],
        ))
        .expect("two");

    assert_t(&mut engine, 1, Some(1));
    assert!(engine.agenda().len() >= 2);

    engine.undefrule("two").expect("undefrule");
    assert!(engine
        .agenda()
        .iter()
        .all(|a| a.rule == "MAIN::one"));

    assert!(matches!(
        engine.undefrule("two"),
        Err(EngineError::UnknownRule(_))
    ));
}

#[test]
fn deffunction_predicates_gate_test_ces() {
    let mut engine = Engine::new();
    engine
        .load(Construct::DefFunction(DefFunction {
            module: None,
            name: "big-enough".into(),
            params: vec!["n".into()],
            body: vec![Expr::call(">=", vec![Expr::var("n"), Expr::int(10)])],
        }))
        .expect("deffunction");
    engine
        .load(rule(
            "big",
            vec![
                op("reading", vec![var("n")]),
                ConditionalElement::Test(Expr::call("big-enough", vec![Expr::var("n")])),
            ],
            vec![],
        ))
        .expect("rule");

    engine
        .assert_ordered("reading", vec![Value::Integer(5)])
        .expect("small");
    engine
        .assert_ordered("reading", vec![Value::Integer(12)])
        .expect("big");
    assert_eq!(engine.agenda().len(), 1);
    assert_eq!(engine.agenda()[0].bindings["n"], Value::Integer(12));
}

#[test]
fn clear_discards_rules_and_modules() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    engine
        .load(rule("r", vec![tp(vec![("A", var("x"))])], vec![]))
        .expect("rule");
    assert_t(&mut engine, 1, None);

    engine.clear();
    assert_eq!(engine.stats().facts, 0);
    assert_eq!(engine.stats().rules, 0);
    assert_eq!(engine.current_module(), "MAIN");
    assert!(engine
        .scopes()
        .resolve(DefKind::Template, "t")
        .is_err());
}

#[test]
fn identical_prefixes_share_network_nodes() {
    let mut engine = Engine::new();
    engine.load(template_t()).expect("template");
    let lhs = || {
        vec![
            tp(vec![("A", var("x")), ("B", lit(1))]),
            tp(vec![("A", var("x")), ("B", lit(2))]),
        ]
    };
    engine.load(rule("first", lhs(), vec![])).expect("first");
    let nodes_after_first = engine.stats().network.nodes;

    // The second rule shares the whole prefix; only a terminal is added.
    engine.load(rule("second", lhs(), vec![])).expect("second");
    assert_eq!(engine.stats().network.nodes, nodes_after_first + 1);

    // One tuple, two rules, two activations.
    assert_t(&mut engine, 5, Some(1));
    assert_t(&mut engine, 5, Some(2));
    assert_eq!(engine.agenda().len(), 2);
}

#[test]
fn type_predicates_filter_at_the_alpha_level() {
    let mut engine = Engine::new();
    engine
        .load(rule(
            "ints-only",
            vec![op(
                "reading",
                vec![Constraint::And(vec![
                    var("n"),
                    Constraint::Test(Expr::call("integerp", vec![Expr::var("n")])),
                ])],
            )],
            vec![],
        ))
        .expect("rule");

    engine
        .assert_ordered("reading", vec![Value::Integer(3)])
        .expect("integer");
    engine
        .assert_ordered("reading", vec![Value::Float(3.5)])
        .expect("float");
    engine
        .assert_ordered("reading", vec![Value::symbol("n/a")])
        .expect("symbol");
    assert_eq!(engine.agenda().len(), 1);
    assert_eq!(engine.agenda()[0].bindings["n"], Value::Integer(3));
}

#[test]
fn predicate_constraint_violations_abort_the_evaluation() {
    let mut engine = Engine::new();
    engine
        .load(rule(
            "check",
            vec![
                op("reading", vec![var("n")]),
                ConditionalElement::Test(Expr::call(">", vec![Expr::var("n"), Expr::int(3)])),
            ],
            vec![],
        ))
        .expect("rule");

    // `>` constrains its arguments to numbers; a symbol violates it at
    // evaluation time and the propagation aborts with an error.
    let err = engine.assert_ordered("reading", vec![Value::symbol("seven")]);
    assert!(matches!(err, Err(EngineError::Rete(_))));

    // Numeric facts keep working.
    engine
        .assert_ordered("reading", vec![Value::Integer(7)])
        .expect("assert");
    assert_eq!(engine.agenda().len(), 1);
}

#[test]
fn intra_pattern_variable_repetition_compiles_to_a_self_join() {
    // (pair ?x ?x) matches only facts whose two fields agree.
    let mut engine = Engine::new();
    engine
        .load(rule("same", vec![op("pair", vec![var("x"), var("x")])], vec![]))
        .expect("rule");

    engine
        .assert_ordered("pair", vec![Value::Integer(4), Value::Integer(4)])
        .expect("same");
    engine
        .assert_ordered("pair", vec![Value::Integer(4), Value::Integer(5)])
        .expect("different");
    assert_eq!(engine.agenda().len(), 1);
}
