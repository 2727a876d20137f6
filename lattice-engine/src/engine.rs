use crate::ast::{Action, Construct, DefRule, FactSpec};
use crate::compile::RuleCompiler;
use crate::error::EngineError;
use crate::functions::{
    eval_expr, ArgConstraint, EvalEnv, FunctionBody, FunctionDefinition, FunctionRegistry,
};
use crate::wm::{DuplicatePolicy, WorkingMemory};
use lattice_facts::{Fact, FactId, TemplateDef, Value, ValueKind};
use lattice_rete::{
    Activation, ConflictStrategy, NetworkObserver, NetworkStats, NodeId, ReteNetwork,
    SalienceRecency,
};
use lattice_scope::{
    DefKind, Definition, FunctionDecl, GlobalDecl, ScopeRegistry,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Engine construction choices, documented once here rather than scattered
/// through the API.
pub struct EngineOptions {
    /// Whether structurally equal facts coalesce to one fact id.
    pub duplicates: DuplicatePolicy,
    /// Agenda ordering. The default is salience desc, recency desc,
    /// registration order.
    pub strategy: Box<dyn ConflictStrategy>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            duplicates: DuplicatePolicy::Coalesce,
            strategy: Box::new(SalienceRecency),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub facts: usize,
    pub rules: usize,
    pub activations: usize,
    pub fired: u64,
    pub network: NetworkStats,
}

#[derive(Debug)]
struct RuleRecord {
    productions: Vec<NodeId>,
    #[allow(dead_code)]
    salience: i64,
    /// Parsed and recorded; focus-stack semantics are not part of the
    /// core, so this never affects the agenda.
    #[allow(dead_code)]
    auto_focus: bool,
}

#[derive(Clone, Debug)]
struct StoredDeffacts {
    module: String,
    name: String,
    facts: Vec<FactSpec>,
}

enum WmCommand {
    Add(FactId, Fact),
    Remove(FactId),
}

/// One engine session: scope registry, working memory, network, function
/// registry and globals, threaded as a value — no process-wide state.
pub struct Engine {
    scopes: ScopeRegistry,
    network: ReteNetwork,
    functions: FunctionRegistry,
    wm: WorkingMemory,
    globals: BTreeMap<String, Value>,
    deffacts: Vec<StoredDeffacts>,
    rules: BTreeMap<String, RuleRecord>,
    rhs: HashMap<NodeId, Vec<Action>>,
    strategy: Box<dyn ConflictStrategy>,
    policy: DuplicatePolicy,
    pending: VecDeque<WmCommand>,
    busy: bool,
    next_rule_seq: u64,
    fired: u64,
}

impl Engine {
    pub fn new() -> Self {
        Engine::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Engine {
            scopes: ScopeRegistry::new(),
            network: ReteNetwork::new(),
            functions: FunctionRegistry::system(),
            wm: WorkingMemory::new(options.duplicates),
            globals: BTreeMap::new(),
            deffacts: Vec::new(),
            rules: BTreeMap::new(),
            rhs: HashMap::new(),
            strategy: options.strategy,
            policy: options.duplicates,
            pending: VecDeque::new(),
            busy: false,
            next_rule_seq: 0,
            fired: 0,
        }
    }

    // ── Construct loading (the parser seam) ──────────────────────────────

    pub fn load(&mut self, construct: Construct) -> Result<(), EngineError> {
        self.guard_compile()?;
        match construct {
            Construct::DefModule(module) => {
                self.scopes
                    .register_scope(&module.name, module.imports, module.exports)?;
                Ok(())
            }
            Construct::DefTemplate(template) => {
                let module = self.module_or_current(template.module);
                self.scopes.add_definition(Definition::template(TemplateDef::new(
                    &module,
                    &template.name,
                    template.slots,
                )))?;
                Ok(())
            }
            Construct::DefGlobal(global) => {
                let module = self.module_or_current(global.module);
                let bindings = BTreeMap::new();
                let env = EvalEnv {
                    registry: &self.functions,
                    globals: &self.globals,
                    bindings: &bindings,
                };
                let value = eval_expr(&global.initializer, &env, 0)?;
                self.scopes.add_definition(Definition::global(GlobalDecl {
                    module,
                    name: global.name.clone(),
                    initializer: value.clone(),
                }))?;
                self.globals.insert(global.name, value);
                Ok(())
            }
            Construct::DefFunction(function) => {
                let module = self.module_or_current(function.module);
                let mut used = Vec::new();
                for expr in &function.body {
                    expr.variables(&mut used);
                }
                for name in used {
                    if !function.params.iter().any(|p| p == name) {
                        return Err(EngineError::UnboundExprVariable(name.to_string()));
                    }
                }
                self.scopes.add_definition(Definition::function(FunctionDecl {
                    module: module.clone(),
                    name: function.name.clone(),
                    params: function.params.clone(),
                }))?;
                self.functions.register(FunctionDefinition {
                    module,
                    name: function.name,
                    result: ValueKind::Any,
                    constraints: vec![
                        ArgConstraint::MinArgs(function.params.len()),
                        ArgConstraint::MaxArgs(function.params.len()),
                    ],
                    deterministic: true,
                    body: FunctionBody::Interpreted {
                        params: function.params,
                        body: function.body,
                    },
                });
                Ok(())
            }
            Construct::DefFacts(deffacts) => {
                let module = self.module_or_current(deffacts.module);
                let facts = deffacts
                    .facts
                    .iter()
                    .map(|spec| self.qualify_spec(spec, &module))
                    .collect::<Result<Vec<_>, _>>()?;
                let stored = StoredDeffacts {
                    module: module.clone(),
                    name: deffacts.name,
                    facts,
                };
                match self
                    .deffacts
                    .iter()
                    .position(|d| d.module == stored.module && d.name == stored.name)
                {
                    Some(index) => self.deffacts[index] = stored,
                    None => self.deffacts.push(stored),
                }
                Ok(())
            }
            Construct::DefRule(rule) => self.load_rule(rule),
        }
    }

    fn load_rule(&mut self, rule: DefRule) -> Result<(), EngineError> {
        let module = self.module_or_current(rule.module.clone());
        let qualified = format!("{}::{}", module, rule.name);
        debug!(rule = %qualified, "installing rule");

        // Redefinition excises the previous version first.
        if let Some(old) = self.rules.remove(&qualified) {
            for production in old.productions {
                self.rhs.remove(&production);
                self.network.remove_production(production)?;
            }
        }

        let rhs = rule
            .rhs
            .iter()
            .map(|action| self.qualify_action(action, &module))
            .collect::<Result<Vec<_>, _>>()?;

        let compiler = RuleCompiler {
            scopes: &self.scopes,
            registry: Arc::new(self.functions.clone()),
            globals: Arc::new(self.globals.clone()),
            module: module.clone(),
            rule: qualified.clone(),
        };
        let salience = rule.declarations.salience;
        let productions =
            compiler.compile(&mut self.network, &rule, salience, self.next_rule_seq)?;

        for production in &productions {
            self.rhs.insert(*production, rhs.clone());
        }
        self.rules.insert(
            qualified,
            RuleRecord {
                productions,
                salience,
                auto_focus: rule.declarations.auto_focus,
            },
        );
        self.next_rule_seq += 1;
        Ok(())
    }

    /// Excise a rule: remove its terminals and every node no other rule
    /// shares.
    pub fn undefrule(&mut self, name: &str) -> Result<(), EngineError> {
        self.guard_compile()?;
        let qualified = self.qualify_rule_name(name);
        let record = self
            .rules
            .remove(&qualified)
            .ok_or_else(|| EngineError::UnknownRule(qualified.clone()))?;
        for production in record.productions {
            self.rhs.remove(&production);
            self.network.remove_production(production)?;
        }
        Ok(())
    }

    // ── Working memory ───────────────────────────────────────────────────

    /// Assert an ordered fact.
    pub fn assert_ordered(
        &mut self,
        head: &str,
        fields: Vec<Value>,
    ) -> Result<FactId, EngineError> {
        self.assert_fact(Fact::ordered(head, fields))
    }

    /// Assert a template fact; the template resolves in the current scope
    /// (or by `MOD::name`), missing slots fill from defaults.
    pub fn assert_template(
        &mut self,
        template: &str,
        slots: Vec<(String, Value)>,
    ) -> Result<FactId, EngineError> {
        let def = self.scopes.resolve(DefKind::Template, template)?;
        let fact = def
            .as_template()
            .expect("template definition payload")
            .realize(slots)?;
        self.assert_fact(fact)
    }

    /// Assert a pre-shaped fact. Under the coalescing duplicate policy a
    /// structural duplicate returns the existing id without touching the
    /// network.
    pub fn assert_fact(&mut self, fact: Fact) -> Result<FactId, EngineError> {
        let (id, fresh) = self.wm.insert(fact.clone());
        if fresh {
            self.pending.push_back(WmCommand::Add(id, fact));
            self.flush()?;
        }
        Ok(id)
    }

    pub fn retract(&mut self, id: FactId) -> Result<(), EngineError> {
        if self.wm.remove(id).is_none() {
            return Err(EngineError::UnknownFact(id));
        }
        self.pending.push_back(WmCommand::Remove(id));
        self.flush()
    }

    /// Apply queued working-memory commands FIFO. Re-entrant calls queue
    /// and return; the outermost call drains until quiescence.
    fn flush(&mut self) -> Result<(), EngineError> {
        if self.busy {
            return Ok(());
        }
        while let Some(command) = self.pending.pop_front() {
            self.busy = true;
            let outcome = match command {
                WmCommand::Add(id, fact) => self.network.add_wme(id, &fact),
                WmCommand::Remove(id) => self.network.remove_wme(id),
            };
            self.busy = false;
            outcome?;
        }
        Ok(())
    }

    pub fn facts(&self) -> impl Iterator<Item = (FactId, &Fact)> {
        self.wm.iter()
    }

    // ── Firing ───────────────────────────────────────────────────────────

    /// Fire activations until the agenda is exhausted or `limit` is
    /// reached. Returns the number fired. RHS actions run outside the
    /// network; their asserts and retracts apply synchronously in program
    /// order.
    pub fn run(&mut self, limit: Option<usize>) -> Result<usize, EngineError> {
        let mut fired = 0;
        loop {
            if let Some(limit) = limit {
                if fired >= limit {
                    break;
                }
            }
            let Some(activation) = self.network.pop_activation(&*self.strategy) else {
                break;
            };
            debug!(rule = %activation.rule, facts = ?activation.matched_facts, "firing");
            fired += 1;
            self.fired += 1;

            let actions = self
                .rhs
                .get(&activation.production)
                .cloned()
                .unwrap_or_default();
            for action in &actions {
                self.run_action(action, &activation)?;
            }
        }
        Ok(fired)
    }

    fn run_action(&mut self, action: &Action, activation: &Activation) -> Result<(), EngineError> {
        match action {
            Action::Assert(spec) => {
                let fact = self.realize_spec(spec, &activation.bindings)?;
                self.assert_fact(fact)?;
            }
            Action::Retract(expr) => {
                let value = self.eval_with(expr, &activation.bindings)?;
                match value {
                    Value::Integer(index) if index >= 0 => {
                        self.retract(FactId(index as u64))?;
                    }
                    other => {
                        return Err(EngineError::Evaluation {
                            function: "retract".into(),
                            message: format!("expected a fact index, got {other}"),
                        })
                    }
                }
            }
            Action::Call(expr) => {
                self.eval_with(expr, &activation.bindings)?;
            }
        }
        Ok(())
    }

    pub fn agenda(&self) -> &[Activation] {
        self.network.agenda().items()
    }

    // ── Session control ──────────────────────────────────────────────────

    /// Discard facts, tokens and activations; keep every compiled node and
    /// definition; re-assert deffacts in definition order. Fact ids
    /// restart at 1.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.guard_compile()?;
        self.pending.clear();
        self.busy = true;
        let outcome = self.network.reset_memories();
        self.busy = false;
        outcome?;
        self.wm.reset();

        for deffacts in self.deffacts.clone() {
            for spec in &deffacts.facts {
                let fact = self.realize_spec(spec, &BTreeMap::new())?;
                self.assert_fact(fact)?;
            }
        }
        Ok(())
    }

    /// Discard everything: nodes, scopes, rules, globals, functions. The
    /// session restarts with a fresh `MAIN` module and the system function
    /// library.
    pub fn clear(&mut self) {
        self.scopes = ScopeRegistry::new();
        self.network = ReteNetwork::new();
        self.functions = FunctionRegistry::system();
        self.wm = WorkingMemory::new(self.policy);
        self.globals.clear();
        self.deffacts.clear();
        self.rules.clear();
        self.rhs.clear();
        self.pending.clear();
        self.busy = false;
        self.next_rule_seq = 0;
        self.fired = 0;
    }

    pub fn switch_module(&mut self, name: &str) -> Result<(), EngineError> {
        self.scopes.switch_scope(name)?;
        Ok(())
    }

    pub fn current_module(&self) -> &str {
        self.scopes.current_module()
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn add_observer(&mut self, observer: Box<dyn NetworkObserver>) {
        self.network.add_observer(observer);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            facts: self.wm.len(),
            rules: self.rules.len(),
            activations: self.network.agenda().len(),
            fired: self.fired,
            network: self.network.stats(),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn guard_compile(&self) -> Result<(), EngineError> {
        if self.busy {
            return Err(EngineError::ReentrantCompilation);
        }
        Ok(())
    }

    fn module_or_current(&self, module: Option<String>) -> String {
        module.unwrap_or_else(|| self.scopes.current_module().to_string())
    }

    fn qualify_rule_name(&self, name: &str) -> String {
        if name.contains("::") {
            name.to_string()
        } else {
            format!("{}::{}", self.scopes.current_module(), name)
        }
    }

    /// Resolve the template reference of a fact spec once, at load time.
    fn qualify_spec(&self, spec: &FactSpec, module: &str) -> Result<FactSpec, EngineError> {
        match spec {
            FactSpec::Ordered { .. } => Ok(spec.clone()),
            FactSpec::Template { template, slots } => {
                let def = self.lookup_template(template, module)?;
                for (slot, _) in slots {
                    if def.slot_index(slot).is_none() {
                        return Err(lattice_facts::FactError::UnknownSlot {
                            template: def.qualified_name(),
                            slot: slot.clone(),
                        }
                        .into());
                    }
                }
                Ok(FactSpec::Template {
                    template: def.qualified_name(),
                    slots: slots.clone(),
                })
            }
        }
    }

    fn qualify_action(&self, action: &Action, module: &str) -> Result<Action, EngineError> {
        match action {
            Action::Assert(spec) => Ok(Action::Assert(self.qualify_spec(spec, module)?)),
            other => Ok(other.clone()),
        }
    }

    fn lookup_template(&self, name: &str, module: &str) -> Result<&TemplateDef, EngineError> {
        let looked_up = match name.split_once("::") {
            Some((qualifier, bare)) => self.scopes.scope(qualifier)?.get(DefKind::Template, bare),
            None => self.scopes.scope(module)?.get(DefKind::Template, name),
        };
        let def = looked_up.ok_or_else(|| lattice_scope::ScopeError::NotVisible {
            module: module.to_string(),
            kind: DefKind::Template,
            name: name.to_string(),
        })?;
        Ok(def.as_template().expect("template definition payload"))
    }

    fn realize_spec(
        &self,
        spec: &FactSpec,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<Fact, EngineError> {
        let env = EvalEnv {
            registry: &self.functions,
            globals: &self.globals,
            bindings,
        };
        match spec {
            FactSpec::Ordered { head, fields } => {
                let values = fields
                    .iter()
                    .map(|expr| eval_expr(expr, &env, 0))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Fact::ordered(head, values))
            }
            FactSpec::Template { template, slots } => {
                let values = slots
                    .iter()
                    .map(|(slot, expr)| Ok((slot.clone(), eval_expr(expr, &env, 0)?)))
                    .collect::<Result<Vec<_>, EngineError>>()?;
                let def = self.lookup_template(template, self.scopes.current_module())?;
                Ok(def.realize(values)?)
            }
        }
    }

    fn eval_with(
        &self,
        expr: &crate::ast::Expr,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<Value, EngineError> {
        let env = EvalEnv {
            registry: &self.functions,
            globals: &self.globals,
            bindings,
        };
        eval_expr(expr, &env, 0)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
