//! Compiler driver
//!
//! Runs one function through the whole backend:
//!
//! ```text
//! fold -> apply-to-call -> signature -> finalize -> [split -> finalize] -> program points -> codegen
//! ```
//!
//! A [`Compiler`] owns everything shared across functions: the compile
//! units, the shape cache, the structure resolver and the signature table.
//! Individual compilations share nothing else, so independent functions
//! may be compiled from several threads at once. A failure aborts only the
//! function it occurred in.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::ast::*;
use crate::bytecode::MethodCode;
use crate::codegen::{
    ArtifactHandle, CodeGenerator, CodeInstaller, CodegenContext, CompileUnit, CompileUnits,
    FunctionInitializer, GeneratedCode, Splitter, Weigher,
};
use crate::config::CompilerConfig;
use crate::deopt::{ContinuationTable, DeoptContinuation};
use crate::error::{Error, ErrorClass, Result};
use crate::passes::{
    infer_scope_needs, ApplyToCallRewriter, ConstantFolder, Environment, FoldStats, ProgramPointAssigner,
    StaticEnvironment, TypeFinalizer,
};
use crate::shape::{CachedStructureResolver, ShapeCache, StructureResolver};
use crate::signature::{CallSignature, CallSignatureResolver, CallSiteType, EntryPoint, SignatureTable};

/// Runs `compile` at most once per key. Concurrent requests for a key that
/// is being compiled block until the first one finishes; a failed attempt
/// leaves the key open for the next request.
pub struct CompileOnce<K, V> {
    cells: Mutex<FxHashMap<K, Arc<OnceCell<V>>>>,
}

struct OnceCell<V> {
    gate: Mutex<()>,
    value: OnceLock<V>,
}

impl<K, V> Default for CompileOnce<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> CompileOnce<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile<F>(&self, key: &K, compile: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let cell = {
            let mut cells = self.cells.lock();
            Arc::clone(cells.entry(key.clone()).or_insert_with(|| {
                Arc::new(OnceCell {
                    gate: Mutex::new(()),
                    value: OnceLock::new(),
                })
            }))
        };
        if let Some(value) = cell.value.get() {
            return Ok(value.clone());
        }

        let _guard = cell.gate.lock();
        if let Some(value) = cell.value.get() {
            return Ok(value.clone());
        }
        let value = compile()?;
        // only the gate holder sets the cell
        let _ = cell.value.set(value.clone());
        Ok(value)
    }

    /// Completed value for `key`, without compiling
    pub fn get(&self, key: &K) -> Option<V> {
        let cell = self.cells.lock().get(key).cloned()?;
        cell.value.get().cloned()
    }

    /// Number of completed keys
    pub fn len(&self) -> usize {
        self.cells.lock().values().filter(|c| c.value.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key of one compiled specialization
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecializationKey {
    pub function: FunctionId,
    pub call_site: Option<CallSiteType>,
}

/// Result of compiling one function
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub function: FunctionId,
    pub name: String,
    pub signature: CallSignature,
    pub code: GeneratedCode,
    pub fold: FoldStats,
    /// `f.apply(x, arguments)` was rewritten into a direct call
    pub apply_to_call: bool,
    /// Split fragments the body was cut into
    pub fragments: usize,
    /// Weight charged to the entry unit
    pub weight: u64,
    pub program_points: u32,
}

impl CompiledFunction {
    pub fn continuation(&self, pp: ProgramPoint) -> Option<DeoptContinuation> {
        self.code.continuations.get(pp)
    }
}

/// A function the driver gave up on
#[derive(Debug, Clone, PartialEq)]
pub struct CompileFailure {
    pub function: FunctionId,
    pub name: String,
    pub error: Error,
}

/// The compiler driver
pub struct Compiler {
    config: CompilerConfig,
    env: Arc<dyn Environment>,
    units: CompileUnits,
    shapes: ShapeCache,
    structures: Arc<dyn StructureResolver>,
    signatures: RwLock<SignatureTable>,
    specializations: CompileOnce<SpecializationKey, Arc<CompiledFunction>>,
}

impl Compiler {
    /// Compiler with a default environment where apply/call are unmodified
    pub fn new(config: CompilerConfig) -> Self {
        Self::with_environment(config, Arc::new(StaticEnvironment::default()))
    }

    pub fn with_environment(config: CompilerConfig, env: Arc<dyn Environment>) -> Self {
        let units = CompileUnits::new(config.unit_prefix.clone(), config.split_threshold);
        Self {
            config,
            env,
            units,
            shapes: ShapeCache::new(),
            structures: Arc::new(CachedStructureResolver::new()),
            signatures: RwLock::new(SignatureTable::new()),
            specializations: CompileOnce::new(),
        }
    }

    /// Replace the structure-class resolver
    pub fn with_structure_resolver(mut self, resolver: Arc<dyn StructureResolver>) -> Self {
        self.structures = resolver;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn units(&self) -> &CompileUnits {
        &self.units
    }

    pub fn shapes(&self) -> &ShapeCache {
        &self.shapes
    }

    /// Recorded signature of `function`
    pub fn signature(&self, function: FunctionId) -> Result<CallSignature> {
        self.signatures.read().get(function).cloned()
    }

    /// Recorded parameter type; `Ok(None)` means not yet inferred
    pub fn param_type(&self, function: FunctionId, index: usize) -> Result<Option<Type>> {
        self.signatures.read().param_type(function, index)
    }

    pub fn entry_point(&self, function: FunctionId) -> Result<Option<EntryPoint>> {
        Ok(self.signatures.read().entry_point(function)?.cloned())
    }

    /// Snapshot of every recorded signature and entry point
    pub fn signature_table(&self) -> SignatureTable {
        self.signatures.read().clone()
    }

    /// Compile `function` for `call_site`. Concurrent requests for the same
    /// function and call shape share a single compilation.
    pub fn compile_specialization(
        &self,
        function: &FunctionNode,
        call_site: &CallSiteType,
    ) -> Result<Arc<CompiledFunction>> {
        let key = SpecializationKey {
            function: function.id,
            call_site: Some(call_site.clone()),
        };
        self.specializations.get_or_compile(&key, || {
            self.compile_function(function.clone(), Some(call_site))
                .map(Arc::new)
        })
    }

    /// Compile one function. Without a call site the parameters keep their
    /// attributed types and no apply-to-call rewrite is attempted.
    pub fn compile_function(
        &self,
        function: FunctionNode,
        call_site: Option<&CallSiteType>,
    ) -> Result<CompiledFunction> {
        self.lower(function, call_site).map(|(compiled, _)| compiled)
    }

    /// Compile `program` and every function nested in it. A function that
    /// fails is recorded and skipped; its nested functions are not reached.
    pub fn compile_program(&self, program: FunctionNode) -> CompiledProgram {
        let mut functions = Vec::new();
        let mut failures = Vec::new();
        let mut worklist = vec![program];

        while let Some(function) = worklist.pop() {
            let id = function.id;
            let name = function.name.clone();
            match self.lower(function, None) {
                Ok((compiled, tree)) => {
                    let mut nested = Vec::new();
                    collect_functions(&tree.body, &mut nested);
                    // keep source order
                    worklist.extend(nested.into_iter().rev().cloned());
                    functions.push(compiled);
                }
                Err(error) => {
                    warn!(function = %id, %name, class = %error.class(), %error, "function not compiled");
                    failures.push(CompileFailure {
                        function: id,
                        name,
                        error,
                    });
                }
            }
        }

        let mut unit_names: Vec<&str> = functions
            .iter()
            .flat_map(|f| f.code.methods.iter().map(|m| m.unit.as_str()))
            .collect();
        unit_names.sort_unstable();
        unit_names.dedup();
        let units = unit_names
            .into_iter()
            .map(|name| self.units.get(name))
            .collect::<Result<Vec<_>>>();

        let units = match units {
            Ok(units) => units,
            Err(error) => {
                warn!(%error, "compile unit lookup failed");
                Vec::new()
            }
        };
        info!(
            functions = functions.len(),
            failures = failures.len(),
            units = units.len(),
            "program compiled"
        );
        CompiledProgram {
            functions,
            failures,
            units,
            signatures: self.signature_table(),
        }
    }

    /// Run every pass on `function`. Returns the compiled result and the
    /// final tree.
    fn lower(
        &self,
        function: FunctionNode,
        call_site: Option<&CallSiteType>,
    ) -> Result<(CompiledFunction, FunctionNode)> {
        let mut folder = ConstantFolder::new();
        let mut function = folder.fold_function(function);

        let apply_to_call = match call_site {
            Some(call_site) => ApplyToCallRewriter::new(self.env.as_ref()).rewrite(&mut function, call_site)?,
            None => false,
        };

        infer_scope_needs(&mut function);
        let mut signature = CallSignatureResolver::resolve(&function, call_site)?;
        CallSignatureResolver::specialize(&mut function, &signature)?;
        TypeFinalizer::finalize(&mut function)?;

        let threshold = self.config.split_threshold;
        let mut fragments = 0;
        if Weigher::function(&function) >= threshold {
            fragments = Splitter::split(&mut function, &self.units, threshold)?;
            if fragments > 0 {
                // split functions receive their callee and keep every var in scope
                signature = CallSignatureResolver::resolve(&function, call_site)?;
                CallSignatureResolver::specialize(&mut function, &signature)?;
                TypeFinalizer::finalize(&mut function)?;
            }
        }

        let program_points = ProgramPointAssigner::assign(&mut function, self.config.max_program_point)?;
        let weight = Weigher::function(&function);
        let unit = self.units.find_unit(weight);

        let ctx = CodegenContext {
            config: &self.config,
            units: &self.units,
            shapes: &self.shapes,
            structures: self.structures.as_ref(),
        };
        let code = CodeGenerator::generate(ctx, &function, &signature, Arc::clone(&unit))?;
        unit.add_function_initializer(function.id, code.entry.clone())?;

        {
            let mut signatures = self.signatures.write();
            signatures.insert(signature.clone());
            signatures.set_entry_point(EntryPoint {
                function: function.id,
                unit: code.unit.clone(),
                method: code.entry.clone(),
                descriptor: signature.descriptor(),
            })?;
        }

        debug!(
            function = %function.id,
            name = %function.name,
            unit = %code.unit,
            weight,
            fragments,
            program_points,
            apply_to_call,
            "function compiled"
        );
        let compiled = CompiledFunction {
            function: function.id,
            name: function.name.clone(),
            signature,
            code,
            fold: folder.stats(),
            apply_to_call,
            fragments,
            weight,
            program_points,
        };
        Ok((compiled, function))
    }
}

/// Functions of a program and the units they were emitted into
#[derive(Debug)]
pub struct CompiledProgram {
    pub functions: Vec<CompiledFunction>,
    pub failures: Vec<CompileFailure>,
    pub units: Vec<Arc<CompileUnit>>,
    pub signatures: SignatureTable,
}

impl CompiledProgram {
    pub fn function(&self, id: FunctionId) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.function == id)
    }

    /// Methods emitted into `unit`, shared scope helpers last
    pub fn unit_methods(&self, unit: &CompileUnit) -> Result<Vec<MethodCode>> {
        let mut methods: Vec<MethodCode> = self
            .functions
            .iter()
            .flat_map(|f| f.code.methods.iter())
            .filter(|m| m.unit == unit.name())
            .map(|m| m.code.clone())
            .collect();
        for helper in unit.shared_calls() {
            methods.push(helper.generate()?);
        }
        Ok(methods)
    }

    /// Finalize every unit through `installer`, then run its function
    /// initializers once. Returns each unit's handle and initializer set.
    pub fn install(
        &self,
        installer: &dyn CodeInstaller,
    ) -> Result<Vec<(ArtifactHandle, Vec<FunctionInitializer>)>> {
        let mut installed = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let methods = self.unit_methods(unit)?;
            let handle = installer.install(unit, &methods)?;
            unit.set_artifact(handle.clone())?;
            let initializers = unit.initialize_functions_code()?;
            debug!(
                unit = %unit.name(),
                methods = methods.len(),
                initializers = initializers.len(),
                "unit installed"
            );
            installed.push((handle, initializers));
        }
        Ok(installed)
    }

    /// Textual disassembly of every unit, then signatures and
    /// continuations
    pub fn disassemble(&self) -> Result<String> {
        let mut output = String::new();
        for unit in &self.units {
            output.push_str(&format!("; unit {} weight={}\n", unit.name(), unit.weight()));
            for method in self.unit_methods(unit)? {
                output.push_str(&method.disassemble());
                output.push('\n');
            }
        }
        for f in &self.functions {
            output.push_str(&format!(
                "; {} {} {} entry={}\n",
                f.function,
                f.name,
                f.signature.descriptor(),
                f.code.entry
            ));
            for pp in f.code.continuations.program_points() {
                if let Some(c) = f.code.continuations.get(pp) {
                    output.push_str(&format!(
                        ";   {} {} locals={} stack={:?}\n",
                        pp,
                        c.result_type().mnemonic(),
                        c.local_types().iter().map(|t| t.mnemonic()).collect::<String>(),
                        c.stack_slots()
                    ));
                }
            }
        }
        for failure in &self.failures {
            output.push_str(&format!(
                "; failed {} {}: {}\n",
                failure.function, failure.name, failure.error
            ));
        }
        Ok(output)
    }

    pub fn summary(&self) -> ProgramSummary {
        ProgramSummary {
            functions: self.functions.iter().map(FunctionSummary::from).collect(),
            failures: self
                .failures
                .iter()
                .map(|f| FailureSummary {
                    function: f.function,
                    name: f.name.clone(),
                    class: f.error.class(),
                    message: f.error.to_string(),
                })
                .collect(),
            units: self
                .units
                .iter()
                .map(|u| UnitSummary {
                    name: u.name().to_string(),
                    weight: u.weight(),
                    initializers: u.initializers(),
                    shared_calls: u
                        .shared_calls()
                        .iter()
                        .map(|c| c.method().name.to_string())
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Serializable view of a compiled program
#[derive(Debug, Clone, Serialize)]
pub struct ProgramSummary {
    pub functions: Vec<FunctionSummary>,
    pub failures: Vec<FailureSummary>,
    pub units: Vec<UnitSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSummary {
    pub function: FunctionId,
    pub name: String,
    pub unit: String,
    pub entry: String,
    pub descriptor: String,
    pub signature: CallSignature,
    pub methods: Vec<String>,
    pub weight: u64,
    pub fragments: usize,
    pub apply_to_call: bool,
    pub continuations: ContinuationTable,
}

impl From<&CompiledFunction> for FunctionSummary {
    fn from(f: &CompiledFunction) -> Self {
        Self {
            function: f.function,
            name: f.name.clone(),
            unit: f.code.unit.clone(),
            entry: f.code.entry.clone(),
            descriptor: f.signature.descriptor().mnemonic(),
            signature: f.signature.clone(),
            methods: f.code.methods.iter().map(|m| m.code.name.clone()).collect(),
            weight: f.weight,
            fragments: f.fragments,
            apply_to_call: f.apply_to_call,
            continuations: f.code.continuations.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub function: FunctionId,
    pub name: String,
    #[serde(serialize_with = "serialize_class")]
    pub class: ErrorClass,
    pub message: String,
}

fn serialize_class<S: serde::Serializer>(class: &ErrorClass, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(class)
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub name: String,
    pub weight: u64,
    pub initializers: Vec<FunctionInitializer>,
    pub shared_calls: Vec<String>,
}

/// Fold `program` and every function nested in it
pub fn fold_program(program: FunctionNode) -> (FunctionNode, FoldStats) {
    let mut folder = ConstantFolder::new();
    let mut program = folder.fold_function(program);
    let mut stats = folder.stats();
    for_each_function_mut(&mut program.body, &mut |f| {
        let mut nested = ConstantFolder::new();
        let placeholder = FunctionNode::new(f.id, "", &[], FunctionFlags::empty());
        *f = nested.fold_function(std::mem::replace(f, placeholder));
        let s = nested.stats();
        stats.expressions_folded += s.expressions_folded;
        stats.branches_pruned += s.branches_pruned;
    });
    (program, stats)
}

/// Function expressions directly nested in `block`, in source order.
/// Functions nested inside those are not included.
fn collect_functions<'t>(block: &'t Block, out: &mut Vec<&'t FunctionNode>) {
    for stmt in &block.statements {
        collect_in_statement(stmt, out);
    }
}

fn collect_in_statement<'t>(stmt: &'t Statement, out: &mut Vec<&'t FunctionNode>) {
    match stmt {
        Statement::Block(b) => collect_functions(b, out),
        Statement::Var(v) => {
            if let Some(init) = &v.init {
                collect_in_expression(init, out);
            }
        }
        Statement::Expression(e) => collect_in_expression(&e.expression, out),
        Statement::If(node) => {
            collect_in_expression(&node.test, out);
            collect_functions(&node.pass, out);
            if let Some(fail) = &node.fail {
                collect_functions(fail, out);
            }
        }
        Statement::While(node) => {
            collect_in_expression(&node.test, out);
            collect_functions(&node.body, out);
        }
        Statement::For(node) => {
            for e in [&node.init, &node.test, &node.modify].into_iter().flatten() {
                collect_in_expression(e, out);
            }
            collect_functions(&node.body, out);
        }
        Statement::Return(r) => {
            if let Some(e) = &r.expression {
                collect_in_expression(e, out);
            }
        }
        Statement::Throw(t) => collect_in_expression(&t.expression, out),
        Statement::Try(node) => {
            collect_functions(&node.body, out);
            if let Some(catch) = &node.catch {
                collect_functions(&catch.body, out);
            }
        }
        Statement::With(node) => {
            collect_in_expression(&node.expression, out);
            collect_functions(&node.body, out);
        }
        Statement::Split(node) => collect_functions(&node.body, out),
        Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => {}
    }
}

fn collect_in_expression<'t>(expr: &'t Expression, out: &mut Vec<&'t FunctionNode>) {
    match expr {
        Expression::Function(f) => out.push(f),
        Expression::Literal(_) | Expression::Identifier(_) => {}
        Expression::Unary(node) => collect_in_expression(&node.operand, out),
        Expression::Binary(node) => {
            collect_in_expression(&node.lhs, out);
            collect_in_expression(&node.rhs, out);
        }
        Expression::Sequence(node) => node.expressions.iter().for_each(|e| collect_in_expression(e, out)),
        Expression::Assign(node) => {
            collect_in_expression(&node.target, out);
            collect_in_expression(&node.value, out);
        }
        Expression::Ternary(node) => {
            collect_in_expression(&node.test, out);
            collect_in_expression(&node.consequent, out);
            collect_in_expression(&node.alternate, out);
        }
        Expression::Call(node) => {
            collect_in_expression(&node.callee, out);
            node.args.iter().for_each(|e| collect_in_expression(e, out));
        }
        Expression::Member(node) => collect_in_expression(&node.base, out),
        Expression::Index(node) => {
            collect_in_expression(&node.base, out);
            collect_in_expression(&node.index, out);
        }
        Expression::Object(node) => node
            .properties
            .iter()
            .for_each(|p| collect_in_expression(&p.value, out)),
        Expression::Array(node) => node.elements.iter().for_each(|e| collect_in_expression(e, out)),
        Expression::Discard(e) => collect_in_expression(e, out),
        Expression::JoinPredecessor(node) => collect_in_expression(&node.expression, out),
    }
}

/// Apply `visit` to every function expression in `block`, innermost first
fn for_each_function_mut(block: &mut Block, visit: &mut dyn FnMut(&mut FunctionNode)) {
    for stmt in &mut block.statements {
        match stmt {
            Statement::Block(b) => for_each_function_mut(b, visit),
            Statement::Var(v) => {
                if let Some(init) = &mut v.init {
                    visit_expression_mut(init, visit);
                }
            }
            Statement::Expression(e) => visit_expression_mut(&mut e.expression, visit),
            Statement::If(node) => {
                visit_expression_mut(&mut node.test, visit);
                for_each_function_mut(&mut node.pass, visit);
                if let Some(fail) = &mut node.fail {
                    for_each_function_mut(fail, visit);
                }
            }
            Statement::While(node) => {
                visit_expression_mut(&mut node.test, visit);
                for_each_function_mut(&mut node.body, visit);
            }
            Statement::For(node) => {
                for e in [&mut node.init, &mut node.test, &mut node.modify].into_iter().flatten() {
                    visit_expression_mut(e, visit);
                }
                for_each_function_mut(&mut node.body, visit);
            }
            Statement::Return(r) => {
                if let Some(e) = &mut r.expression {
                    visit_expression_mut(e, visit);
                }
            }
            Statement::Throw(t) => visit_expression_mut(&mut t.expression, visit),
            Statement::Try(node) => {
                for_each_function_mut(&mut node.body, visit);
                if let Some(catch) = &mut node.catch {
                    for_each_function_mut(&mut catch.body, visit);
                }
            }
            Statement::With(node) => {
                visit_expression_mut(&mut node.expression, visit);
                for_each_function_mut(&mut node.body, visit);
            }
            Statement::Split(node) => for_each_function_mut(&mut node.body, visit),
            Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => {}
        }
    }
}

fn visit_expression_mut(expr: &mut Expression, visit: &mut dyn FnMut(&mut FunctionNode)) {
    match expr {
        Expression::Function(f) => {
            for_each_function_mut(&mut f.body, visit);
            visit(f);
        }
        Expression::Literal(_) | Expression::Identifier(_) => {}
        Expression::Unary(node) => visit_expression_mut(&mut node.operand, visit),
        Expression::Binary(node) => {
            visit_expression_mut(&mut node.lhs, visit);
            visit_expression_mut(&mut node.rhs, visit);
        }
        Expression::Sequence(node) => node
            .expressions
            .iter_mut()
            .for_each(|e| visit_expression_mut(e, visit)),
        Expression::Assign(node) => {
            visit_expression_mut(&mut node.target, visit);
            visit_expression_mut(&mut node.value, visit);
        }
        Expression::Ternary(node) => {
            visit_expression_mut(&mut node.test, visit);
            visit_expression_mut(&mut node.consequent, visit);
            visit_expression_mut(&mut node.alternate, visit);
        }
        Expression::Call(node) => {
            visit_expression_mut(&mut node.callee, visit);
            node.args.iter_mut().for_each(|e| visit_expression_mut(e, visit));
        }
        Expression::Member(node) => visit_expression_mut(&mut node.base, visit),
        Expression::Index(node) => {
            visit_expression_mut(&mut node.base, visit);
            visit_expression_mut(&mut node.index, visit);
        }
        Expression::Object(node) => node
            .properties
            .iter_mut()
            .for_each(|p| visit_expression_mut(&mut p.value, visit)),
        Expression::Array(node) => node
            .elements
            .iter_mut()
            .for_each(|e| visit_expression_mut(e, visit)),
        Expression::Discard(e) => visit_expression_mut(e, visit),
        Expression::JoinPredecessor(node) => visit_expression_mut(&mut node.expression, visit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::InMemoryInstaller;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn program(statements: impl FnOnce(&mut FunctionNode) -> Vec<Statement>) -> FunctionNode {
        let mut p = FunctionNode::new(FunctionId(0), "", &[], FunctionFlags::IS_PROGRAM);
        p.body.statements = statements(&mut p);
        p
    }

    fn adder(id: u32) -> FunctionNode {
        let mut f = FunctionNode::new(FunctionId(id), "add", &[("a", Type::Int), ("b", Type::Int)], FunctionFlags::empty());
        let sum = build::binary(BinaryOp::Add, build::local(&f, "a"), build::local(&f, "b"));
        f.return_type = Type::Int;
        f.body.statements = vec![build::return_stmt(Some(sum))];
        f
    }

    #[test]
    fn test_compile_once_runs_once_under_contention() {
        let once: CompileOnce<u32, u32> = CompileOnce::new();
        let runs = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let value = once
                        .get_or_compile(&7, || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok(42)
                        })
                        .unwrap();
                    assert_eq!(value, 42);
                });
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(once.get(&7), Some(42));
    }

    #[test]
    fn test_compile_once_retries_after_failure() {
        let once: CompileOnce<u32, u32> = CompileOnce::new();
        let failed = once.get_or_compile(&1, || Err(Error::internal("boom")));
        assert!(failed.is_err());
        assert!(once.is_empty());
        assert_eq!(once.get_or_compile(&1, || Ok(3)).unwrap(), 3);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn test_specialization_is_shared() {
        let compiler = Compiler::new(CompilerConfig::default());
        let f = adder(3);
        let site = CallSiteType::for_arguments(false, &[Type::Int, Type::Int], Type::Int);
        let first = compiler.compile_specialization(&f, &site).unwrap();
        let second = compiler.compile_specialization(&f, &site).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.units().len(), 1);

        let entry = compiler.entry_point(FunctionId(3)).unwrap().unwrap();
        assert_eq!(entry.method, first.code.entry);
        assert_eq!(compiler.param_type(FunctionId(3), 0).unwrap(), Some(Type::Int));
    }

    #[test]
    fn test_unknown_function_is_not_found() {
        let compiler = Compiler::new(CompilerConfig::default());
        let err = compiler.signature(FunctionId(99)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(compiler.entry_point(FunctionId(99)).is_err());
    }

    #[test]
    fn test_program_compiles_nested_functions() {
        let p = program(|p| {
            let inner = build::function_expr(adder(1));
            vec![build::var(p, "add", Type::Object, Some(inner))]
        });
        let compiled = Compiler::new(CompilerConfig::default()).compile_program(p);
        assert!(compiled.failures.is_empty());
        assert_eq!(compiled.functions.len(), 2);
        assert!(compiled.function(FunctionId(1)).is_some());
        assert_eq!(compiled.signatures.len(), 2);
    }

    #[test]
    fn test_failure_is_isolated_to_one_function() {
        let mut heavy = adder(1);
        let many: Expression = (0..10).fold(build::local(&heavy, "a"), |acc, _| {
            build::binary(BinaryOp::Add, acc, build::local(&heavy, "b"))
        });
        heavy.body.statements = vec![build::return_stmt(Some(many))];
        let p = program(|p| {
            vec![
                build::var(p, "heavy", Type::Object, Some(build::function_expr(heavy))),
                build::var(p, "light", Type::Object, Some(build::function_expr(FunctionNode::new(
                    FunctionId(2),
                    "light",
                    &[],
                    FunctionFlags::empty(),
                )))),
            ]
        });
        let compiler = Compiler::new(CompilerConfig::default().with_max_program_point(4));
        let compiled = compiler.compile_program(p);

        assert_eq!(compiled.failures.len(), 1);
        assert_eq!(compiled.failures[0].function, FunctionId(1));
        assert_eq!(compiled.failures[0].error.class(), ErrorClass::ResourceExhaustion);
        assert!(compiled.function(FunctionId(2)).is_some());
        assert!(compiled.function(FunctionId(0)).is_some());
    }

    #[test]
    fn test_install_runs_initializers_once() {
        let compiler = Compiler::new(CompilerConfig::default());
        let compiled = compiler.compile_program(program(|p| {
            vec![build::var(p, "add", Type::Object, Some(build::function_expr(adder(1))))]
        }));
        let installer = InMemoryInstaller::new();
        let installed = compiled.install(&installer).unwrap();
        assert_eq!(installed.len(), 1);
        let (handle, initializers) = &installed[0];
        assert_eq!(initializers.len(), 2);
        assert_eq!(handle.methods.len(), 2);
        assert!(compiled.units[0].is_finalized());
        assert!(compiled.units[0].initialize_functions_code().is_err());
        assert!(compiled.install(&installer).is_err());
    }

    #[test]
    fn test_summary_serializes() {
        let compiled = Compiler::new(CompilerConfig::default()).compile_program(program(|_| {
            vec![build::return_stmt(Some(build::int(1)))]
        }));
        let json = serde_json::to_value(compiled.summary()).unwrap();
        assert_eq!(json["functions"][0]["entry"], ":program$0");
        assert_eq!(json["units"][0]["name"], "Script$0");
    }

    #[test]
    fn test_fold_program_reaches_nested_functions() {
        let mut inner = FunctionNode::new(FunctionId(1), "g", &[], FunctionFlags::empty());
        inner.body.statements = vec![build::return_stmt(Some(build::binary(
            BinaryOp::Mul,
            build::int(6),
            build::int(7),
        )))];
        let p = program(|_| vec![build::expr_stmt(build::function_expr(inner))]);
        let (folded, stats) = fold_program(p);
        assert_eq!(stats.expressions_folded, 1);
        let Statement::Expression(stmt) = &folded.body.statements[0] else {
            panic!("expected expression statement");
        };
        let Expression::Function(g) = &stmt.expression else {
            panic!("expected function");
        };
        let Statement::Return(ret) = &g.body.statements[0] else {
            panic!("expected return");
        };
        assert_eq!(ret.expression.as_ref().and_then(|e| e.as_literal()), Some(&LiteralValue::Int(42)));
    }
}
