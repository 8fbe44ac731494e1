//! Apply-to-call specialization
//!
//! `f.apply(thisArg, arguments)` forwards the caller's own arguments
//! reflectively. When the rest-arguments object never escapes, the call can
//! pass the arguments directly and the function no longer needs the
//! variable-arity convention at all.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::ast::*;
use crate::error::{Error, Result};
use crate::signature::CallSiteType;

const ARGUMENTS: &str = "arguments";

/// Read-only view of the global environment the rewrite depends on
pub trait Environment: Send + Sync {
    /// Built-in `Function.prototype.apply` and `call` are still the originals
    fn is_apply_call_unmodified(&self) -> bool;
}

/// Environment with fixed answers
#[derive(Debug, Clone, Copy)]
pub struct StaticEnvironment {
    pub apply_call_unmodified: bool,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            apply_call_unmodified: true,
        }
    }
}

impl Environment for StaticEnvironment {
    fn is_apply_call_unmodified(&self) -> bool {
        self.apply_call_unmodified
    }
}

/// Rewrites `f.apply(x, arguments)` into a direct call
pub struct ApplyToCallRewriter<'a> {
    env: &'a dyn Environment,
}

impl<'a> ApplyToCallRewriter<'a> {
    pub fn new(env: &'a dyn Environment) -> Self {
        Self { env }
    }

    /// Try the rewrite for `function` invoked through `call_site`. Returns
    /// `Ok(false)` and leaves the tree untouched when a precondition fails.
    pub fn rewrite(&self, function: &mut FunctionNode, call_site: &CallSiteType) -> Result<bool> {
        if function
            .flags
            .contains(FunctionFlags::HAS_APPLY_TO_CALL_SPECIALIZATION)
        {
            return Err(Error::TransformReapplied {
                transform: "apply-to-call",
                function: function.id,
            });
        }
        if !function.uses_arguments() {
            return Ok(false);
        }
        if !self.env.is_apply_call_unmodified() {
            debug!(function = %function.id, "apply-to-call aborted: apply/call overridden");
            return Ok(false);
        }
        if function.has_eval() {
            debug!(function = %function.id, "apply-to-call aborted: function contains eval");
            return Ok(false);
        }
        if function.params.len() > MAX_PARAM_COUNT {
            return Ok(false);
        }

        let mut analysis = EscapeAnalysis::default();
        for param in &function.params {
            analysis.protected.insert(param.name.clone());
        }
        analysis.visit_block(&function.body, false);
        if let Some(reason) = analysis.disqualification() {
            debug!(function = %function.id, reason, "apply-to-call aborted");
            return Ok(false);
        }

        let reserved = call_site.leading_slots();
        let arity = call_site.argument_types().len();
        if arity < function.params.len() {
            debug!(
                function = %function.id,
                arity,
                declared = function.params.len(),
                "apply-to-call aborted: call site passes fewer arguments than declared"
            );
            return Ok(false);
        }

        // Forwarding parameters: the formals, then one per extra argument
        let mut params = function.params.clone();
        for i in function.params.len()..arity {
            let ty = call_site.params[reserved + i].generic();
            let name = format!(":arg{}", i);
            let id = function.symbols.add(Symbol::new(name.clone(), SymbolKind::Parameter, ty));
            let mut ident = IdentNode::new(name, ty);
            ident.symbol = Some(id);
            params.push(ident);
        }

        let mut rewritten = 0;
        rewrite_block(&mut function.body, &params, &mut rewritten);

        // Swap the variadic array and arguments object for the new formals
        let dropped: FxHashSet<SymbolId> = function
            .reserved
            .varargs
            .into_iter()
            .chain(function.reserved.arguments)
            .chain(function.param_symbols())
            .collect();
        let symbols = std::mem::take(&mut function.body.symbols);
        let this = function.reserved.this;
        let mut ordered = Vec::with_capacity(symbols.len() + params.len());
        for id in symbols {
            if dropped.contains(&id) {
                continue;
            }
            ordered.push(id);
            if id == this {
                ordered.extend(params.iter().filter_map(|p| p.symbol));
            }
        }
        function.body.symbols = ordered;
        function.reserved.varargs = None;
        function.reserved.arguments = None;
        function.params = params;
        function.flags.remove(FunctionFlags::USES_ARGUMENTS);
        function
            .flags
            .insert(FunctionFlags::HAS_APPLY_TO_CALL_SPECIALIZATION);

        debug!(function = %function.id, calls = rewritten, arity, "apply-to-call specialized");
        Ok(true)
    }
}

/// Single traversal proving `arguments` only feeds `x.apply(y, arguments)`
#[derive(Default)]
struct EscapeAnalysis {
    escapes: bool,
    applies: usize,
    /// Names whose binding must stay stable: apply receivers and formals
    protected: FxHashSet<String>,
    receivers: FxHashSet<String>,
    assigned: FxHashSet<String>,
}

impl EscapeAnalysis {
    fn disqualification(&self) -> Option<&'static str> {
        if self.escapes {
            Some("arguments escapes")
        } else if self.applies == 0 {
            Some("no apply call forwards arguments")
        } else if self
            .assigned
            .iter()
            .any(|name| self.receivers.contains(name) || self.protected.contains(name))
        {
            Some("apply receiver or parameter reassigned")
        } else {
            None
        }
    }

    fn visit_block(&mut self, block: &Block, nested: bool) {
        for stmt in &block.statements {
            self.visit_statement(stmt, nested);
        }
    }

    fn visit_statement(&mut self, stmt: &Statement, nested: bool) {
        match stmt {
            Statement::Var(var) => {
                if let Some(init) = &var.init {
                    self.assigned.insert(var.name.name.clone());
                    self.visit_expression(init, nested);
                }
            }
            Statement::Expression(e) => self.visit_expression(&e.expression, nested),
            Statement::If(node) => self.visit_expression(&node.test, nested),
            Statement::While(node) => self.visit_expression(&node.test, nested),
            Statement::For(node) => {
                for e in [&node.init, &node.test, &node.modify].into_iter().flatten() {
                    self.visit_expression(e, nested);
                }
            }
            Statement::Return(node) => {
                if let Some(e) = &node.expression {
                    self.visit_expression(e, nested);
                }
            }
            Statement::Throw(node) => self.visit_expression(&node.expression, nested),
            Statement::With(node) => self.visit_expression(&node.expression, nested),
            Statement::Try(node) => {
                if let Some(catch) = &node.catch {
                    self.assigned.insert(catch.param.name.clone());
                }
            }
            _ => {}
        }
        for child in stmt.child_blocks() {
            self.visit_block(child, nested);
        }
    }

    fn visit_expression(&mut self, expr: &Expression, nested: bool) {
        match expr {
            Expression::Identifier(id) => {
                if id.name == ARGUMENTS && !nested {
                    self.escapes = true;
                }
            }
            Expression::Call(call) if !nested && is_apply_of_arguments(call) => {
                self.applies += 1;
                if let Expression::Member(access) = &call.callee {
                    if let Expression::Identifier(receiver) = access.base.unwrap_join() {
                        self.receivers.insert(receiver.name.clone());
                    }
                    self.visit_expression(&access.base, nested);
                }
                self.visit_expression(&call.args[0], nested);
            }
            Expression::Assign(node) => {
                if let Expression::Identifier(target) = node.target.unwrap_join() {
                    self.assigned.insert(target.name.clone());
                }
                self.visit_expression(&node.target, nested);
                self.visit_expression(&node.value, nested);
            }
            // Inner functions have their own arguments but may still
            // reassign our bindings
            Expression::Function(inner) => self.visit_block(&inner.body, true),
            Expression::Literal(_) => {}
            Expression::Unary(node) => self.visit_expression(&node.operand, nested),
            Expression::Binary(node) => {
                self.visit_expression(&node.lhs, nested);
                self.visit_expression(&node.rhs, nested);
            }
            Expression::Sequence(node) => {
                for e in &node.expressions {
                    self.visit_expression(e, nested);
                }
            }
            Expression::Ternary(node) => {
                self.visit_expression(&node.test, nested);
                self.visit_expression(&node.consequent, nested);
                self.visit_expression(&node.alternate, nested);
            }
            Expression::Call(node) => {
                self.visit_expression(&node.callee, nested);
                for arg in &node.args {
                    self.visit_expression(arg, nested);
                }
            }
            Expression::Member(node) => self.visit_expression(&node.base, nested),
            Expression::Index(node) => {
                self.visit_expression(&node.base, nested);
                self.visit_expression(&node.index, nested);
            }
            Expression::Object(node) => {
                for p in &node.properties {
                    self.visit_expression(&p.value, nested);
                }
            }
            Expression::Array(node) => {
                for e in &node.elements {
                    self.visit_expression(e, nested);
                }
            }
            Expression::Discard(inner) => self.visit_expression(inner, nested),
            Expression::JoinPredecessor(node) => self.visit_expression(&node.expression, nested),
        }
    }
}

fn is_apply_of_arguments(call: &CallNode) -> bool {
    if call.is_new || call.args.len() != 2 {
        return false;
    }
    let is_apply = matches!(&call.callee, Expression::Member(access) if access.property == "apply");
    let forwards = matches!(call.args[1].unwrap_join(), Expression::Identifier(id) if id.name == ARGUMENTS);
    is_apply && forwards
}

fn rewrite_block(block: &mut Block, params: &[IdentNode], count: &mut usize) {
    for stmt in &mut block.statements {
        rewrite_statement(stmt, params, count);
    }
}

fn rewrite_statement(stmt: &mut Statement, params: &[IdentNode], count: &mut usize) {
    match stmt {
        Statement::Block(b) => rewrite_block(b, params, count),
        Statement::Var(var) => {
            if let Some(init) = &mut var.init {
                rewrite_expression(init, params, count);
            }
        }
        Statement::Expression(e) => rewrite_expression(&mut e.expression, params, count),
        Statement::If(node) => {
            rewrite_expression(&mut node.test, params, count);
            rewrite_block(&mut node.pass, params, count);
            if let Some(fail) = &mut node.fail {
                rewrite_block(fail, params, count);
            }
        }
        Statement::While(node) => {
            rewrite_expression(&mut node.test, params, count);
            rewrite_block(&mut node.body, params, count);
        }
        Statement::For(node) => {
            for e in [&mut node.init, &mut node.test, &mut node.modify].into_iter().flatten() {
                rewrite_expression(e, params, count);
            }
            rewrite_block(&mut node.body, params, count);
        }
        Statement::Return(node) => {
            if let Some(e) = &mut node.expression {
                rewrite_expression(e, params, count);
            }
        }
        Statement::Throw(node) => rewrite_expression(&mut node.expression, params, count),
        Statement::Try(node) => {
            rewrite_block(&mut node.body, params, count);
            if let Some(catch) = &mut node.catch {
                rewrite_block(&mut catch.body, params, count);
            }
        }
        Statement::With(node) => {
            rewrite_expression(&mut node.expression, params, count);
            rewrite_block(&mut node.body, params, count);
        }
        Statement::Split(node) => rewrite_block(&mut node.body, params, count),
        Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => {}
    }
}

fn rewrite_expression(expr: &mut Expression, params: &[IdentNode], count: &mut usize) {
    match expr {
        Expression::Call(call) if is_apply_of_arguments(call) => {
            let this_arg = std::mem::replace(&mut call.args[0], build::undefined());
            let mut args = Vec::with_capacity(params.len() + 1);
            args.push(this_arg);
            args.extend(params.iter().cloned().map(Expression::Identifier));
            call.args = args;
            call.apply_to_call = true;
            *count += 1;
            if let Expression::Member(access) = &mut call.callee {
                rewrite_expression(&mut access.base, params, count);
            }
            rewrite_expression(&mut call.args[0], params, count);
        }
        Expression::Literal(_) | Expression::Identifier(_) | Expression::Function(_) => {}
        Expression::Unary(node) => rewrite_expression(&mut node.operand, params, count),
        Expression::Binary(node) => {
            rewrite_expression(&mut node.lhs, params, count);
            rewrite_expression(&mut node.rhs, params, count);
        }
        Expression::Sequence(node) => {
            for e in &mut node.expressions {
                rewrite_expression(e, params, count);
            }
        }
        Expression::Assign(node) => {
            rewrite_expression(&mut node.target, params, count);
            rewrite_expression(&mut node.value, params, count);
        }
        Expression::Ternary(node) => {
            rewrite_expression(&mut node.test, params, count);
            rewrite_expression(&mut node.consequent, params, count);
            rewrite_expression(&mut node.alternate, params, count);
        }
        Expression::Call(node) => {
            rewrite_expression(&mut node.callee, params, count);
            for arg in &mut node.args {
                rewrite_expression(arg, params, count);
            }
        }
        Expression::Member(node) => rewrite_expression(&mut node.base, params, count),
        Expression::Index(node) => {
            rewrite_expression(&mut node.base, params, count);
            rewrite_expression(&mut node.index, params, count);
        }
        Expression::Object(node) => {
            for p in &mut node.properties {
                rewrite_expression(&mut p.value, params, count);
            }
        }
        Expression::Array(node) => {
            for e in &mut node.elements {
                rewrite_expression(e, params, count);
            }
        }
        Expression::Discard(inner) => rewrite_expression(inner, params, count),
        Expression::JoinPredecessor(node) => rewrite_expression(&mut node.expression, params, count),
    }
}
