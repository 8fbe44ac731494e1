//! Final code emission
//!
//! [`CodeGenerator`] lowers one finalized, program-point-annotated
//! function into [`MethodCode`] through a [`MethodEmitter`]. The pieces:
//!
//! | Module | Role |
//! |--------|------|
//! | [`branch`] | boolean-context expressions as conditional jumps |
//! | [`objects`] | object, array and scope construction |
//! | [`split`] | the splitter pass and split fragment emission |
//! | [`unit`] | compile units, shared scope helpers, installation |
//! | [`weigh`] | code weight estimates |
//!
//! Local variables live in slots; everything else goes through the scope
//! object in the `:scope` slot with dynamic get/set by name. Operations
//! carrying a program point are emitted optimistically: pending stack
//! values are spilled first and a deoptimization continuation is recorded
//! after the operation.

mod branch;
mod objects;
pub mod split;
pub mod unit;
pub mod weigh;

pub use branch::jump_condition;
pub use split::Splitter;
pub use unit::{
    ArtifactHandle, CodeInstaller, CompileUnit, CompileUnits, FunctionInitializer, InMemoryInstaller,
    SharedCallKey, SharedCallKind, SharedScopeCall,
};
pub use weigh::Weigher;

use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

use crate::ast::*;
use crate::bytecode::{helpers, ArithOp, CallSiteFlags, InvokeKind, Label, MethodCode, MethodEmitter};
use crate::config::CompilerConfig;
use crate::deopt::ContinuationTable;
use crate::error::{Error, Result};
use crate::shape::{ShapeCache, StructureResolver};
use crate::signature::CallSignature;

use branch::BranchOptimizer;
use split::Fragment;

/// Shared collaborators of code generation
#[derive(Clone, Copy)]
pub struct CodegenContext<'a> {
    pub config: &'a CompilerConfig,
    pub units: &'a CompileUnits,
    pub shapes: &'a ShapeCache,
    pub structures: &'a dyn StructureResolver,
}

/// A finished method and the unit it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedMethod {
    pub unit: String,
    pub code: MethodCode,
}

/// Everything emitted for one function
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    /// Name of the entry method
    pub entry: String,
    pub unit: String,
    /// Entry method first, then split fragments in emission order
    pub methods: Vec<EmittedMethod>,
    pub continuations: ContinuationTable,
}

/// Break and continue destinations of an enclosing loop
#[derive(Debug, Clone)]
struct JumpTarget {
    name: Option<String>,
    break_label: Label,
    continue_label: Label,
    /// Pushed scope objects at the loop
    depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScopeUse {
    Get,
    Call,
}

/// Emits the methods of one function
pub struct CodeGenerator<'a> {
    ctx: CodegenContext<'a>,
    function: &'a FunctionNode,
    signature: &'a CallSignature,
    method: MethodEmitter,
    unit: Arc<CompileUnit>,
    next_method: u32,
    jump_targets: Vec<JumpTarget>,
    /// Open split fragments, innermost last
    fragments: Vec<Fragment>,
    /// Scope objects pushed by `with` and scope blocks
    scope_depth: u32,
    scope_uses: FxHashMap<(String, ScopeUse), u32>,
    methods: Vec<EmittedMethod>,
    continuations: ContinuationTable,
}

impl<'a> CodeGenerator<'a> {
    /// Emit `function` into `unit` with the entry point of `signature`
    pub fn generate(
        ctx: CodegenContext<'a>,
        function: &'a FunctionNode,
        signature: &'a CallSignature,
        unit: Arc<CompileUnit>,
    ) -> Result<GeneratedCode> {
        let entry = method_name(function);
        let mut method = MethodEmitter::new(0, entry.clone(), signature.descriptor());
        method.reserve_locals(function.slot_count);
        let mut gen = CodeGenerator {
            ctx,
            function,
            signature,
            method,
            unit: Arc::clone(&unit),
            next_method: 1,
            jump_targets: Vec::new(),
            fragments: Vec::new(),
            scope_depth: 0,
            scope_uses: count_scope_uses(&function.body),
            methods: Vec::new(),
            continuations: ContinuationTable::new(),
        };
        gen.prologue()?;
        gen.statements(&function.body.statements)?;
        if gen.method.is_reachable() {
            gen.return_value(None)?;
        }

        let CodeGenerator {
            method,
            mut methods,
            mut continuations,
            ..
        } = gen;
        let (code, own) = method.finish()?;
        continuations.merge(own)?;
        methods.insert(
            0,
            EmittedMethod {
                unit: unit.name().to_string(),
                code,
            },
        );
        debug!(
            function = %function.name,
            methods = methods.len(),
            continuations = continuations.len(),
            "generated code"
        );
        Ok(GeneratedCode {
            entry,
            unit: unit.name().to_string(),
            methods,
            continuations,
        })
    }

    fn symbol(&self, id: SymbolId) -> Result<&'a Symbol> {
        let function: &'a FunctionNode = self.function;
        function.symbols.get(id)
    }

    fn reserved_slot(&self, id: SymbolId) -> Result<Option<u16>> {
        Ok(self.symbol(id)?.slot())
    }

    fn scope_slot(&self) -> Result<u16> {
        self.reserved_slot(self.function.reserved.scope)?
            .ok_or_else(|| Error::internal(format!("{} has no scope slot", self.function.name)))
    }

    fn load_scope(&mut self) -> Result<()> {
        let slot = self.scope_slot()?;
        self.method.load(Type::Object, slot);
        Ok(())
    }

    fn store_scope(&mut self) -> Result<()> {
        let slot = self.scope_slot()?;
        self.method.store(Type::Object, slot)
    }

    /// Emit `n` parent-scope hops on the scope slot
    fn pop_scopes(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            self.load_scope()?;
            self.method.invoke(InvokeKind::Static, helpers::parent_scope())?;
            self.store_scope()?;
        }
        Ok(())
    }

    fn base_flags(&self) -> CallSiteFlags {
        if self.function.is_strict() {
            CallSiteFlags::STRICT
        } else {
            CallSiteFlags::empty()
        }
    }

    fn scope_flags(&self, ident: &IdentNode) -> CallSiteFlags {
        let mut flags = self.base_flags() | CallSiteFlags::SCOPE;
        if ident.is_fast_scope() {
            flags |= CallSiteFlags::FAST_SCOPE;
        }
        flags
    }

    /// The program point of an operation that is emitted optimistically
    fn optimistic(&self, pp: Option<ProgramPoint>, ty: Type) -> Option<ProgramPoint> {
        if self.ctx.config.optimistic_types && ty.normalized() != Type::Object {
            pp
        } else {
            None
        }
    }

    fn begin_optimistic(&mut self, pp: Option<ProgramPoint>) -> Result<()> {
        if pp.is_some() {
            self.method.store_stack()?;
        }
        Ok(())
    }

    fn end_optimistic(&mut self, pp: Option<ProgramPoint>, ty: Type) -> Result<()> {
        match pp {
            Some(pp) => self.method.record_continuation(pp, ty.normalized()),
            None => Ok(()),
        }
    }

    fn next_method_id(&mut self) -> u32 {
        let id = self.next_method;
        self.next_method += 1;
        id
    }

    // Prologue

    fn prologue(&mut self) -> Result<()> {
        let f = self.function;
        let reserved = &f.reserved;

        if let Some(scope) = self.reserved_slot(reserved.scope)? {
            match self.reserved_slot(reserved.callee)? {
                Some(callee) => {
                    self.method.load(Type::Object, callee);
                    self.method.invoke(InvokeKind::Static, helpers::callee_scope())?;
                }
                None => self.method.push(LiteralValue::Null),
            }
            self.method.store(Type::Object, scope)?;
        }

        let varargs = match reserved.varargs {
            Some(id) => self.reserved_slot(id)?,
            None => None,
        };
        let arguments = match (f.uses_arguments(), varargs) {
            (true, Some(varargs)) => {
                match self.reserved_slot(reserved.callee)? {
                    Some(callee) => self.method.load(Type::Object, callee),
                    None => self.method.push(LiteralValue::Null),
                }
                self.method.load(Type::Object, varargs);
                self.method.invoke(InvokeKind::Static, helpers::allocate_arguments())?;
                let temp = self.method.new_temp(Type::Object);
                self.method.store(Type::Object, temp)?;
                Some(temp)
            }
            _ => None,
        };

        if f.body.needs_scope {
            self.create_scope(&f.body, arguments)?;
        }

        let in_arguments_view = |symbol: &Symbol| f.has_arguments_view() && symbol.is_param() && symbol.is_scope();
        for id in f.param_symbols() {
            let symbol = self.symbol(id)?;
            if let (true, Some(slot)) = (symbol.is_scope(), symbol.slot()) {
                if !in_arguments_view(symbol) {
                    self.load_scope()?;
                    self.method.load(symbol.ty(), slot);
                    self.method.dynamic_set(symbol.name(), CallSiteFlags::SCOPE)?;
                }
            }
        }

        if let Some(varargs) = varargs {
            for (index, id) in f.param_symbols().enumerate() {
                let symbol = self.symbol(id)?;
                if in_arguments_view(symbol) || (!symbol.is_scope() && symbol.slot().is_none()) {
                    continue;
                }
                self.method.load(Type::Object, varargs);
                self.method.push(LiteralValue::Int(index as i32));
                self.method.invoke(InvokeKind::Static, helpers::array_get())?;
                self.store_symbol(symbol)?;
            }
        }

        if let (Some(temp), Some(id)) = (arguments, reserved.arguments) {
            let symbol = self.symbol(id)?;
            if symbol.is_scope() || symbol.slot().is_some() {
                self.method.load(Type::Object, temp);
                self.store_symbol(symbol)?;
            }
        }

        if let Some(ret) = self.reserved_slot(reserved.ret)? {
            self.method.push(LiteralValue::Undefined);
            self.method.store(Type::Object, ret)?;
        }

        self.init_locals(&f.body)
    }

    /// Give the block's slot variables their initial value
    fn init_locals(&mut self, block: &Block) -> Result<()> {
        for &id in &block.symbols {
            if Some(id) == self.function.reserved.arguments {
                continue;
            }
            let symbol = self.symbol(id)?;
            if symbol.is_internal() || symbol.is_param() || symbol.is_scope() {
                continue;
            }
            if let Some(slot) = symbol.slot() {
                self.method.push(default_value(symbol.ty()));
                self.method.store(symbol.ty(), slot)?;
            }
        }
        Ok(())
    }

    /// Store the value on top of the stack into `symbol`
    fn store_symbol(&mut self, symbol: &Symbol) -> Result<()> {
        if symbol.is_scope() {
            self.load_scope()?;
            self.method.swap()?;
            self.method.dynamic_set(symbol.name(), self.base_flags() | CallSiteFlags::SCOPE)
        } else if let Some(slot) = symbol.slot() {
            self.method.convert(symbol.ty())?;
            self.method.store(symbol.ty(), slot)
        } else {
            Err(Error::internal(format!("symbol '{}' has no storage", symbol.name())))
        }
    }

    // Statements

    fn statements(&mut self, statements: &[Statement]) -> Result<()> {
        for stmt in statements {
            self.statement(stmt)?;
        }
        Ok(())
    }

    /// Enter a nested block: push its scope object when it has scope
    /// variables, then initialize its slot variables
    fn enter_block(&mut self, block: &Block) -> Result<bool> {
        let has_scope_symbols = block
            .symbols
            .iter()
            .map(|id| self.symbol(*id))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .any(|s| s.is_scope());
        let pushed = block.needs_scope && has_scope_symbols;
        if pushed {
            self.create_scope(block, None)?;
            self.scope_depth += 1;
        }
        self.init_locals(block)?;
        Ok(pushed)
    }

    fn leave_block(&mut self, pushed: bool) -> Result<()> {
        if pushed {
            if self.method.is_reachable() {
                self.pop_scopes(1)?;
            }
            self.scope_depth -= 1;
        }
        Ok(())
    }

    fn block(&mut self, block: &Block) -> Result<()> {
        let pushed = self.enter_block(block)?;
        self.statements(&block.statements)?;
        self.leave_block(pushed)
    }

    fn statement(&mut self, stmt: &Statement) -> Result<()> {
        if !self.method.is_reachable() {
            return Ok(());
        }
        match stmt {
            Statement::Block(b) => self.block(b),
            Statement::Var(v) => self.var(v),
            Statement::Expression(e) => self.discard(&e.expression),
            Statement::If(node) => {
                let else_label = self.method.new_label("else");
                BranchOptimizer::new(self).execute(&node.test, else_label, false)?;
                self.block(&node.pass)?;
                match &node.fail {
                    Some(fail) => {
                        let end = self.method.new_label("endif");
                        if self.method.is_reachable() {
                            self.method.goto(end)?;
                        }
                        self.method.label(else_label)?;
                        self.block(fail)?;
                        self.method.label(end)
                    }
                    None => self.method.label(else_label),
                }
            }
            Statement::While(node) => self.while_loop(node),
            Statement::For(node) => self.for_loop(node),
            Statement::Return(r) => match self.fragments.is_empty() {
                true => self.return_value(r.expression.as_ref()),
                false => self.fragment_return(r.expression.as_ref()),
            },
            Statement::Break(jump) => {
                let target = self.jump_target(jump, false)?;
                self.split_aware_goto(target.break_label, target.depth)
            }
            Statement::Continue(jump) => {
                let target = self.jump_target(jump, true)?;
                self.split_aware_goto(target.continue_label, target.depth)
            }
            Statement::Throw(t) => {
                self.load(&t.expression, Type::Object)?;
                self.method.throw()
            }
            Statement::Try(node) => self.try_catch(node),
            Statement::With(node) => {
                self.load_scope()?;
                self.load(&node.expression, Type::Object)?;
                self.method.invoke(InvokeKind::Static, helpers::with_scope())?;
                self.store_scope()?;
                self.scope_depth += 1;
                self.block(&node.body)?;
                if self.method.is_reachable() {
                    self.pop_scopes(1)?;
                }
                self.scope_depth -= 1;
                Ok(())
            }
            Statement::Split(node) => self.split_fragment(node),
            Statement::Empty(_) => Ok(()),
        }
    }

    fn var(&mut self, node: &VarNode) -> Result<()> {
        let Some(init) = &node.init else {
            return Ok(());
        };
        match node.name.symbol {
            Some(id) => {
                let symbol = self.symbol(id)?;
                if symbol.is_scope() {
                    self.load_scope()?;
                    self.load(init, init.ty())?;
                    self.method.dynamic_set(symbol.name(), self.scope_flags(&node.name))
                } else {
                    self.load(init, symbol.ty())?;
                    self.store_symbol(symbol)
                }
            }
            None => {
                self.load_scope()?;
                self.load(init, init.ty())?;
                self.method.dynamic_set(&node.name.name, self.scope_flags(&node.name))
            }
        }
    }

    fn return_value(&mut self, expression: Option<&Expression>) -> Result<()> {
        let ty = self.signature.return_type();
        match expression {
            Some(e) => self.load(e, ty)?,
            None => {
                self.method.push(LiteralValue::Undefined);
                self.method.convert(ty)?;
            }
        }
        self.method.ret(ty)
    }

    fn while_loop(&mut self, node: &WhileNode) -> Result<()> {
        let break_label = self.method.new_label("break");
        let continue_label = self.method.new_label("continue");
        self.jump_targets.push(JumpTarget {
            name: node.label.clone(),
            break_label,
            continue_label,
            depth: self.scope_depth,
        });
        if node.is_do_while {
            let body = self.method.new_label("do");
            self.method.label(body)?;
            self.block(&node.body)?;
            self.method.label(continue_label)?;
            if self.method.is_reachable() {
                BranchOptimizer::new(self).execute(&node.test, body, true)?;
            }
        } else {
            self.method.label(continue_label)?;
            BranchOptimizer::new(self).execute(&node.test, break_label, false)?;
            self.block(&node.body)?;
            if self.method.is_reachable() {
                self.method.goto(continue_label)?;
            }
        }
        self.jump_targets.pop();
        self.method.label(break_label)
    }

    fn for_loop(&mut self, node: &ForNode) -> Result<()> {
        if let Some(init) = &node.init {
            self.discard(init)?;
        }
        let top = self.method.new_label("for");
        let break_label = self.method.new_label("break");
        let continue_label = self.method.new_label("continue");
        self.method.label(top)?;
        if let Some(test) = &node.test {
            BranchOptimizer::new(self).execute(test, break_label, false)?;
        }
        self.jump_targets.push(JumpTarget {
            name: node.label.clone(),
            break_label,
            continue_label,
            depth: self.scope_depth,
        });
        self.block(&node.body)?;
        self.jump_targets.pop();
        self.method.label(continue_label)?;
        if self.method.is_reachable() {
            if let Some(modify) = &node.modify {
                self.discard(modify)?;
            }
            self.method.goto(top)?;
        }
        self.method.label(break_label)
    }

    fn jump_target(&self, jump: &JumpNode, is_continue: bool) -> Result<JumpTarget> {
        let found = match &jump.label {
            Some(name) => self
                .jump_targets
                .iter()
                .rev()
                .find(|t| t.name.as_deref() == Some(name.as_str())),
            None => self.jump_targets.last(),
        };
        found.cloned().ok_or_else(|| {
            Error::internal(format!(
                "{} without an enclosing loop in {}",
                if is_continue { "continue" } else { "break" },
                self.function.name
            ))
        })
    }

    fn try_catch(&mut self, node: &TryNode) -> Result<()> {
        let saved_scope = match self.reserved_slot(self.function.reserved.scope)? {
            Some(slot) => {
                self.method.load(Type::Object, slot);
                let temp = self.method.new_temp(Type::Object);
                self.method.store(Type::Object, temp)?;
                Some(temp)
            }
            None => None,
        };
        let depth = self.scope_depth;
        let start = self.method.new_label("try");
        let end = self.method.new_label("try_end");
        let handler = self.method.new_label("catch");
        let after = self.method.new_label("after_try");

        self.method.label(start)?;
        self.block(&node.body)?;
        if self.method.is_reachable() {
            self.method.goto(after)?;
        }
        self.method.label(end)?;
        self.method.try_catch(start, end, handler);

        self.method.catch_label(handler)?;
        let exception = node
            .exception_slot
            .ok_or_else(|| Error::internal("try statement without an exception slot"))?;
        self.method.store(Type::Object, exception)?;
        if let Some(temp) = saved_scope {
            self.method.load(Type::Object, temp);
            self.store_scope()?;
        }
        self.scope_depth = depth;

        match &node.catch {
            Some(catch) => {
                let pushed = self.enter_block(&catch.body)?;
                self.method.load(Type::Object, exception);
                match catch.param.symbol {
                    Some(id) => {
                        let symbol = self.symbol(id)?;
                        self.store_symbol(symbol)?;
                    }
                    None => {
                        self.load_scope()?;
                        self.method.swap()?;
                        self.method
                            .dynamic_set(&catch.param.name, self.scope_flags(&catch.param))?;
                    }
                }
                self.statements(&catch.body.statements)?;
                self.leave_block(pushed)?;
            }
            None => {
                self.method.load(Type::Object, exception);
                self.method.throw()?;
            }
        }
        self.method.label(after)
    }

    // Expressions

    /// Evaluate `expr` and leave its value converted to `ty`. An expression
    /// without a result leaves `undefined`.
    fn load(&mut self, expr: &Expression, ty: Type) -> Result<()> {
        self.expression(expr)?;
        if expr.result_type().is_none() {
            self.method.push(LiteralValue::Undefined);
        }
        self.method.convert(ty)
    }

    /// Evaluate `expr` for its side effects
    fn discard(&mut self, expr: &Expression) -> Result<()> {
        self.expression(expr)?;
        if expr.result_type().is_some() {
            self.method.pop()?;
        }
        Ok(())
    }

    /// Emit `expr`, leaving a value exactly when it has a result type
    fn expression(&mut self, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Literal(lit) => {
                self.method.push(lit.value.clone());
                Ok(())
            }
            Expression::Identifier(ident) => self.identifier(ident),
            Expression::Unary(node) => self.unary(expr, node),
            Expression::Binary(node) => self.binary(expr, node),
            Expression::Sequence(seq) => {
                for e in &seq.expressions {
                    self.expression(e)?;
                }
                Ok(())
            }
            Expression::Assign(node) => self.assign(node),
            Expression::Ternary(node) => {
                let ty = node.ty;
                let alternate = self.method.new_label("ternary_else");
                let end = self.method.new_label("ternary_end");
                BranchOptimizer::new(self).execute(&node.test, alternate, false)?;
                self.load(&node.consequent, ty)?;
                self.method.goto(end)?;
                self.method.label(alternate)?;
                self.load(&node.alternate, ty)?;
                self.method.label(end)
            }
            Expression::Call(node) => self.call(node),
            Expression::Member(node) => {
                let pp = self.optimistic(node.program_point, node.ty);
                self.begin_optimistic(pp)?;
                self.load(&node.base, Type::Object)?;
                let flags = self.base_flags() | optimistic_flag(pp);
                self.method.dynamic_get(&node.property, node.ty, flags, pp)?;
                self.end_optimistic(pp, node.ty)
            }
            Expression::Index(node) => {
                let pp = self.optimistic(node.program_point, node.ty);
                self.begin_optimistic(pp)?;
                self.load(&node.base, Type::Object)?;
                self.load(&node.index, node.index.ty())?;
                let flags = self.base_flags() | optimistic_flag(pp);
                self.method.dynamic_get_index(node.ty, flags, pp)?;
                self.end_optimistic(pp, node.ty)
            }
            Expression::Object(node) => self.object_literal(node),
            Expression::Array(node) => self.array_literal(node),
            Expression::Function(f) => {
                match self.reserved_slot(self.function.reserved.scope)? {
                    Some(slot) => self.method.load(Type::Object, slot),
                    None => self.method.push(LiteralValue::Null),
                }
                self.method.new_function(f.id)
            }
            Expression::Discard(inner) => self.discard(inner),
            Expression::JoinPredecessor(join) => {
                self.expression(&join.expression)?;
                self.apply_conversions(&join.conversions)
            }
        }
    }

    /// Retype locals flowing into a join
    fn apply_conversions(&mut self, conversions: &[LocalConversion]) -> Result<()> {
        for conversion in conversions.iter().filter(|c| c.from != c.to) {
            let symbol = self.symbol(conversion.symbol)?;
            if symbol.is_scope() {
                continue;
            }
            if let Some(slot) = symbol.slot() {
                self.method.load(conversion.from, slot);
                self.method.convert(conversion.to)?;
                self.method.store(conversion.to, slot)?;
            }
        }
        Ok(())
    }

    fn identifier(&mut self, ident: &IdentNode) -> Result<()> {
        if let Some(id) = ident.symbol {
            let symbol = self.symbol(id)?;
            if !symbol.is_scope() {
                let slot = symbol.slot().ok_or_else(|| {
                    Error::internal(format!("read of '{}' which has no storage", ident.name))
                })?;
                self.method.load(symbol.ty(), slot);
                return Ok(());
            }
        }
        let pp = self.optimistic(ident.program_point, ident.ty);
        let flags = self.scope_flags(ident);
        if pp.is_none() && self.uses(&ident.name, ScopeUse::Get) > self.ctx.config.shared_scope_get_threshold {
            let helper = self.unit.shared_scope_call(SharedCallKey {
                name: ident.name.clone(),
                kind: SharedCallKind::Get,
                args: Vec::new(),
                ty: ident.ty.normalized(),
                flags,
            })?;
            self.load_scope()?;
            return self.method.invoke(InvokeKind::Static, helper.method().clone());
        }
        self.begin_optimistic(pp)?;
        self.load_scope()?;
        self.method
            .dynamic_get(&ident.name, ident.ty, flags | optimistic_flag(pp), pp)?;
        self.end_optimistic(pp, ident.ty)
    }

    fn uses(&self, name: &str, kind: ScopeUse) -> u32 {
        self.scope_uses
            .get(&(name.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    fn unary(&mut self, expr: &Expression, node: &UnaryNode) -> Result<()> {
        match node.op {
            UnaryOp::Plus => {
                self.load(&node.operand, arithmetic_type(node.ty))?;
                self.method.convert(node.ty)
            }
            UnaryOp::Minus => {
                let ty = arithmetic_type(node.ty);
                let pp = self.optimistic(node.program_point, node.ty);
                self.begin_optimistic(pp)?;
                self.load(&node.operand, ty)?;
                self.method.neg(ty, pp)?;
                self.end_optimistic(pp, ty)?;
                self.method.convert(node.ty)
            }
            UnaryOp::Not => self.materialize_condition(expr),
            UnaryOp::BitNot => {
                self.load(&node.operand, Type::Int)?;
                self.method.push(LiteralValue::Int(-1));
                self.method.arith(ArithOp::Xor, Type::Int, None)?;
                self.method.convert(node.ty)
            }
            UnaryOp::TypeOf => {
                self.load(&node.operand, Type::Object)?;
                self.method.invoke(InvokeKind::Static, helpers::type_of())
            }
            UnaryOp::Void => {
                self.discard(&node.operand)?;
                self.method.push(LiteralValue::Undefined);
                Ok(())
            }
        }
    }

    fn binary(&mut self, expr: &Expression, node: &BinaryNode) -> Result<()> {
        let ty = node.ty.normalized();
        match node.op {
            op if op.is_comparison() => self.materialize_condition(expr),
            BinaryOp::And | BinaryOp::Or => {
                let end = self.method.new_label("logical_end");
                self.load(&node.lhs, ty)?;
                self.method.dup()?;
                self.method.convert(Type::Boolean)?;
                self.method.test(node.op == BinaryOp::Or, end)?;
                self.method.pop()?;
                self.load(&node.rhs, ty)?;
                self.method.label(end)
            }
            BinaryOp::Shr => {
                self.load(&node.lhs, Type::Int)?;
                self.load(&node.rhs, Type::Int)?;
                self.method.invoke(InvokeKind::Static, helpers::shr())?;
                self.method.convert(ty)
            }
            BinaryOp::Add if !ty.is_numeric() => {
                self.load(&node.lhs, Type::Object)?;
                self.load(&node.rhs, Type::Object)?;
                self.method.invoke(InvokeKind::Static, helpers::add())?;
                self.method.convert(ty)
            }
            op if op.is_bitwise() => {
                self.load(&node.lhs, Type::Int)?;
                self.load(&node.rhs, Type::Int)?;
                self.method.arith(arith_op(op)?, Type::Int, None)?;
                self.method.convert(ty)
            }
            op => {
                let operand = arithmetic_type(ty);
                let pp = self.optimistic(node.program_point, ty);
                self.begin_optimistic(pp)?;
                self.load(&node.lhs, operand)?;
                self.load(&node.rhs, operand)?;
                self.method.arith(arith_op(op)?, operand, pp)?;
                self.end_optimistic(pp, operand)?;
                self.method.convert(ty)
            }
        }
    }

    /// Produce a boolean value through jumps
    fn materialize_condition(&mut self, expr: &Expression) -> Result<()> {
        let is_true = self.method.new_label("true");
        let end = self.method.new_label("condition_end");
        BranchOptimizer::new(self).execute(expr, is_true, true)?;
        self.method.push(LiteralValue::Boolean(false));
        self.method.goto(end)?;
        self.method.label(is_true)?;
        self.method.push(LiteralValue::Boolean(true));
        self.method.label(end)?;
        self.method.convert(expr.ty())
    }

    fn assign(&mut self, node: &AssignNode) -> Result<()> {
        match node.target.unwrap_join() {
            Expression::Identifier(ident) => {
                let symbol = match ident.symbol {
                    Some(id) => Some(self.symbol(id)?),
                    None => None,
                };
                match symbol {
                    Some(symbol) if !symbol.is_scope() => {
                        let slot = symbol.slot().ok_or_else(|| {
                            Error::internal(format!("assignment to '{}' which has no storage", ident.name))
                        })?;
                        self.load(&node.value, symbol.ty())?;
                        self.method.dup()?;
                        self.method.store(symbol.ty(), slot)
                    }
                    _ => {
                        self.load(&node.value, node.value.ty())?;
                        self.method.dup()?;
                        self.load_scope()?;
                        self.method.swap()?;
                        self.method.dynamic_set(&ident.name, self.scope_flags(ident))
                    }
                }
            }
            Expression::Member(target) => {
                self.load(&target.base, Type::Object)?;
                let temp = self.evaluate_to_temp(&node.value)?;
                self.method.dynamic_set(&target.property, self.base_flags())?;
                self.method.load(node.value.ty(), temp);
                Ok(())
            }
            Expression::Index(target) => {
                self.load(&target.base, Type::Object)?;
                self.load(&target.index, target.index.ty())?;
                let temp = self.evaluate_to_temp(&node.value)?;
                self.method.dynamic_set_index(self.base_flags())?;
                self.method.load(node.value.ty(), temp);
                Ok(())
            }
            other => Err(Error::internal(format!(
                "invalid assignment target at {:?}",
                other.span()
            ))),
        }
    }

    /// Evaluate `value` into a fresh temporary and leave it loaded
    fn evaluate_to_temp(&mut self, value: &Expression) -> Result<u16> {
        let ty = value.ty();
        self.load(value, ty)?;
        let temp = self.method.new_temp(ty);
        self.method.store(ty, temp)?;
        self.method.load(ty, temp);
        Ok(temp)
    }

    fn call(&mut self, node: &CallNode) -> Result<()> {
        let argc = u16::try_from(node.args.len())
            .map_err(|_| Error::internal(format!("call with {} arguments", node.args.len())))?;
        if node.is_new {
            self.load(&node.callee, Type::Object)?;
            for arg in &node.args {
                self.load(arg, arg.ty())?;
            }
            return self.method.dynamic_new(argc, self.base_flags());
        }

        let pp = self.optimistic(node.program_point, node.ty);
        let mut flags = self.base_flags() | optimistic_flag(pp);

        if node.apply_to_call {
            let Expression::Member(apply) = node.callee.unwrap_join() else {
                return Err(Error::internal("apply-to-call site without an apply member"));
            };
            self.begin_optimistic(pp)?;
            self.load(&apply.base, Type::Object)?;
            let mut args = node.args.iter();
            match args.next() {
                Some(receiver) => self.load(receiver, Type::Object)?,
                None => self.method.push(LiteralValue::Undefined),
            }
            let rest: Vec<&Expression> = args.collect();
            for arg in &rest {
                self.load(arg, arg.ty())?;
            }
            flags |= CallSiteFlags::APPLY_TO_CALL;
            self.method.dynamic_call(rest.len() as u16, node.ty, flags, pp)?;
            return self.end_optimistic(pp, node.ty);
        }

        match node.callee.unwrap_join() {
            Expression::Member(callee) => {
                self.begin_optimistic(pp)?;
                self.load(&callee.base, Type::Object)?;
                self.method.dup()?;
                self.method
                    .dynamic_get(&callee.property, Type::Object, self.base_flags(), None)?;
                self.method.swap()?;
            }
            Expression::Identifier(ident) if self.resolves_to_scope(ident)? => {
                let scope_flags = self.scope_flags(ident);
                if pp.is_none() && self.uses(&ident.name, ScopeUse::Call) > self.ctx.config.shared_scope_call_threshold {
                    let helper = self.unit.shared_scope_call(SharedCallKey {
                        name: ident.name.clone(),
                        kind: SharedCallKind::Call { argc },
                        args: node.args.iter().map(|a| a.ty().normalized()).collect(),
                        ty: node.ty.normalized(),
                        flags: scope_flags,
                    })?;
                    self.load_scope()?;
                    for arg in &node.args {
                        self.load(arg, arg.ty())?;
                    }
                    return self.method.invoke(InvokeKind::Static, helper.method().clone());
                }
                self.begin_optimistic(pp)?;
                self.load_scope()?;
                self.method.dynamic_get(&ident.name, Type::Object, scope_flags, None)?;
                self.method.push(LiteralValue::Undefined);
                flags |= CallSiteFlags::SCOPE;
            }
            callee => {
                self.begin_optimistic(pp)?;
                self.load(callee, Type::Object)?;
                self.method.push(LiteralValue::Undefined);
            }
        }
        for arg in &node.args {
            self.load(arg, arg.ty())?;
        }
        self.method.dynamic_call(argc, node.ty, flags, pp)?;
        self.end_optimistic(pp, node.ty)
    }

    fn resolves_to_scope(&self, ident: &IdentNode) -> Result<bool> {
        Ok(match ident.symbol {
            Some(id) => self.symbol(id)?.is_scope(),
            None => true,
        })
    }
}

/// Entry method name of a function
pub fn method_name(function: &FunctionNode) -> String {
    if function.is_program() {
        format!(":program${}", function.id.0)
    } else if function.name.is_empty() {
        format!(":anonymous${}", function.id.0)
    } else {
        format!("{}${}", function.name, function.id.0)
    }
}

fn optimistic_flag(pp: Option<ProgramPoint>) -> CallSiteFlags {
    if pp.is_some() {
        CallSiteFlags::OPTIMISTIC
    } else {
        CallSiteFlags::empty()
    }
}

/// Operand type of arithmetic producing `ty`
fn arithmetic_type(ty: Type) -> Type {
    if ty.is_numeric() {
        ty
    } else {
        Type::Number
    }
}

fn arith_op(op: BinaryOp) -> Result<ArithOp> {
    Ok(match op {
        BinaryOp::Add => ArithOp::Add,
        BinaryOp::Sub => ArithOp::Sub,
        BinaryOp::Mul => ArithOp::Mul,
        BinaryOp::Div => ArithOp::Div,
        BinaryOp::Mod => ArithOp::Rem,
        BinaryOp::BitAnd => ArithOp::And,
        BinaryOp::BitOr => ArithOp::Or,
        BinaryOp::BitXor => ArithOp::Xor,
        BinaryOp::Shl => ArithOp::Shl,
        BinaryOp::Sar => ArithOp::Sar,
        other => {
            return Err(Error::internal(format!(
                "'{}' is not an arithmetic operator",
                other.as_str()
            )))
        }
    })
}

/// Initial value of a slot variable
fn default_value(ty: Type) -> LiteralValue {
    match ty {
        Type::Boolean => LiteralValue::Boolean(false),
        Type::Int => LiteralValue::Int(0),
        Type::Long => LiteralValue::Long(0),
        Type::Number => LiteralValue::Number(0.0),
        Type::Unknown | Type::Object => LiteralValue::Undefined,
    }
}

/// Count scope-resident reads and calls per name, nested functions
/// excluded
fn count_scope_uses(body: &Block) -> FxHashMap<(String, ScopeUse), u32> {
    fn block(b: &Block, uses: &mut FxHashMap<(String, ScopeUse), u32>) {
        for s in &b.statements {
            statement(s, uses);
        }
    }
    fn statement(s: &Statement, uses: &mut FxHashMap<(String, ScopeUse), u32>) {
        match s {
            Statement::Var(v) => v.init.iter().for_each(|e| expression(e, uses)),
            Statement::Expression(e) => expression(&e.expression, uses),
            Statement::If(i) => expression(&i.test, uses),
            Statement::While(w) => expression(&w.test, uses),
            Statement::For(f) => [&f.init, &f.test, &f.modify]
                .into_iter()
                .flatten()
                .for_each(|e| expression(e, uses)),
            Statement::Return(r) => r.expression.iter().for_each(|e| expression(e, uses)),
            Statement::Throw(t) => expression(&t.expression, uses),
            Statement::With(w) => expression(&w.expression, uses),
            _ => {}
        }
        for child in s.child_blocks() {
            block(child, uses);
        }
    }
    fn expression(e: &Expression, uses: &mut FxHashMap<(String, ScopeUse), u32>) {
        match e {
            Expression::Identifier(ident) if !ident.is_internal() && ident.symbol.is_none() => {
                *uses.entry((ident.name.clone(), ScopeUse::Get)).or_default() += 1;
            }
            Expression::Unary(u) => expression(&u.operand, uses),
            Expression::Binary(b) => {
                expression(&b.lhs, uses);
                expression(&b.rhs, uses);
            }
            Expression::Sequence(s) => s.expressions.iter().for_each(|e| expression(e, uses)),
            Expression::Assign(a) => {
                match &a.target {
                    Expression::Member(m) => expression(&m.base, uses),
                    Expression::Index(i) => {
                        expression(&i.base, uses);
                        expression(&i.index, uses);
                    }
                    _ => {}
                }
                expression(&a.value, uses);
            }
            Expression::Ternary(t) => {
                expression(&t.test, uses);
                expression(&t.consequent, uses);
                expression(&t.alternate, uses);
            }
            Expression::Call(c) => {
                match &c.callee {
                    Expression::Identifier(ident)
                        if !c.is_new && !c.apply_to_call && ident.symbol.is_none() =>
                    {
                        *uses.entry((ident.name.clone(), ScopeUse::Call)).or_default() += 1;
                    }
                    callee => expression(callee, uses),
                }
                c.args.iter().for_each(|a| expression(a, uses));
            }
            Expression::Member(m) => expression(&m.base, uses),
            Expression::Index(i) => {
                expression(&i.base, uses);
                expression(&i.index, uses);
            }
            Expression::Object(o) => o.properties.iter().for_each(|p| expression(&p.value, uses)),
            Expression::Array(a) => a.elements.iter().for_each(|e| expression(e, uses)),
            Expression::Discard(inner) => expression(inner, uses),
            Expression::JoinPredecessor(j) => expression(&j.expression, uses),
            Expression::Literal(_) | Expression::Identifier(_) | Expression::Function(_) => {}
        }
    }

    let mut uses = FxHashMap::default();
    block(body, &mut uses);
    uses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::bytecode::Instruction;
    use crate::passes::{ProgramPointAssigner, TypeFinalizer};
    use crate::shape::CachedStructureResolver;
    use crate::signature::CallSignatureResolver;

    pub(super) struct Fixture {
        pub(super) config: CompilerConfig,
        pub(super) units: CompileUnits,
        shapes: ShapeCache,
        structures: CachedStructureResolver,
    }

    impl Fixture {
        pub(super) fn new(config: CompilerConfig) -> Self {
            let units = CompileUnits::new("Test", config.split_threshold);
            Self {
                config,
                units,
                shapes: ShapeCache::new(),
                structures: CachedStructureResolver::new(),
            }
        }

        pub(super) fn generate(&self, mut f: FunctionNode) -> GeneratedCode {
            crate::passes::infer_scope_needs(&mut f);
            let signature = CallSignatureResolver::resolve(&f, None).unwrap();
            CallSignatureResolver::specialize(&mut f, &signature).unwrap();
            TypeFinalizer::finalize(&mut f).unwrap();
            ProgramPointAssigner::assign(&mut f, self.config.max_program_point).unwrap();
            let ctx = CodegenContext {
                config: &self.config,
                units: &self.units,
                shapes: &self.shapes,
                structures: &self.structures,
            };
            let unit = self.units.find_unit(Weigher::function(&f));
            CodeGenerator::generate(ctx, &f, &signature, unit).unwrap()
        }
    }

    pub(super) fn function(params: &[(&str, Type)]) -> FunctionNode {
        FunctionNode::new(FunctionId(1), "f", params, FunctionFlags::empty())
    }

    #[test]
    fn test_local_arithmetic_is_optimistic() {
        let mut f = function(&[("a", Type::Int), ("b", Type::Int)]);
        let sum = build::binary(BinaryOp::Add, build::local(&f, "a"), build::local(&f, "b"));
        f.return_type = Type::Int;
        f.body.statements = vec![build::return_stmt(Some(sum))];
        let code = Fixture::new(CompilerConfig::default()).generate(f);

        let entry = &code.methods[0].code;
        assert_eq!(entry.descriptor.mnemonic(), "(OII)I");
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Arith { op: ArithOp::Add, program_point: Some(_), .. })));
        assert_eq!(code.continuations.len(), 1);
    }

    #[test]
    fn test_non_optimistic_config_records_nothing() {
        let mut f = function(&[("a", Type::Int)]);
        let neg = build::unary(UnaryOp::Minus, build::local(&f, "a"), Type::Int);
        f.return_type = Type::Int;
        f.body.statements = vec![build::return_stmt(Some(neg))];
        let code = Fixture::new(CompilerConfig::default().with_optimistic_types(false)).generate(f);
        assert!(code.continuations.is_empty());
    }

    #[test]
    fn test_global_read_goes_through_scope() {
        let mut f = function(&[]);
        let read = build::member(build::global("console"), "log", Type::Object);
        f.body.statements = vec![build::expr_stmt(read)];
        let code = Fixture::new(CompilerConfig::default()).generate(f);
        let text = code.methods[0].code.disassemble();
        assert!(text.contains("getCalleeScope"));
        assert!(text.contains("dyn_get console"));
        assert!(text.contains("FAST_SCOPE"));
    }

    #[test]
    fn test_shared_scope_call_after_threshold() {
        let mut f = function(&[]);
        f.body.statements = (0..6)
            .map(|i| build::expr_stmt(build::call(build::global("print"), vec![build::int(i)], Type::Object)))
            .collect();
        let fixture = Fixture::new(CompilerConfig::default().with_shared_scope_thresholds(4, 200));
        let code = fixture.generate(f);
        let unit = fixture.units.get(&code.unit).unwrap();
        let helpers = unit.shared_calls();
        assert_eq!(helpers.len(), 1);
        assert_eq!(code.methods[0].code.invokes(&helpers[0].method().name), 6);
    }

    #[test]
    fn test_loop_with_break_and_continue() {
        let mut f = function(&[("n", Type::Int)]);
        let decl = build::var(&mut f, "i", Type::Int, Some(build::int(0)));
        let test = build::binary(BinaryOp::Lt, build::local(&f, "i"), build::local(&f, "n"));
        let bump = build::assign(
            build::local(&f, "i"),
            build::binary_typed(BinaryOp::Add, build::local(&f, "i"), build::int(1), Type::Int),
        );
        let body = build::block(vec![
            build::expr_stmt(bump),
            build::if_stmt(
                build::binary(BinaryOp::StrictEq, build::local(&f, "i"), build::int(5)),
                build::block(vec![build::break_stmt()]),
                Some(build::block(vec![build::continue_stmt()])),
            ),
        ]);
        f.body.statements = vec![decl, build::while_stmt(test, body)];
        let code = Fixture::new(CompilerConfig::default()).generate(f);
        let entry = &code.methods[0].code;
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::CompareJump { ty: Type::Int, .. })));
        assert!(matches!(entry.instructions.last(), Some(Instruction::Return(_))));
    }

    #[test]
    fn test_try_catch_restores_scope() {
        let mut f = function(&[]);
        let mut catch_body = build::block(vec![build::expr_stmt(build::call(
            build::global("log"),
            vec![],
            Type::Object,
        ))]);
        let e = f.symbols.add(Symbol::new("e", SymbolKind::Variable, Type::Object));
        catch_body.symbols.push(e);
        let mut param = IdentNode::new("e", Type::Object);
        param.symbol = Some(e);
        f.body.statements = vec![Statement::Try(Box::new(TryNode {
            body: build::block(vec![build::throw_stmt(build::string("x"))]),
            catch: Some(CatchNode { param, body: catch_body }),
            exception_slot: None,
            span: Span::default(),
        }))];
        let code = Fixture::new(CompilerConfig::default()).generate(f);
        let entry = &code.methods[0].code;
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::TryCatch { .. })));
        assert!(entry.disassemble().contains("throw"));
    }
}
