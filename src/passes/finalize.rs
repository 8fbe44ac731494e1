//! Type finalization
//!
//! Makes the storage decision of every symbol final: a local slot, a
//! property of a scope object, or both for parameters that are copied into
//! the scope at entry. Also marks values that are computed only for their
//! side effects and hands out quick slots for caught exceptions.
//!
//! The pass is re-runnable. Splitting a function forces its variables
//! into scope storage, after which the function is finalized again.

use tracing::{debug, trace};

use super::scope::ScopeTracker;
use crate::ast::*;
use crate::error::{Error, Result};

/// Finalizes symbol storage for one function at a time
pub struct TypeFinalizer {
    tracker: ScopeTracker,
    all_vars_in_scope: bool,
    vararg: bool,
    has_arguments_view: bool,
    quick_slots: usize,
}

impl TypeFinalizer {
    /// Finalize `function`. Nested function expressions are only flagged
    /// with their dynamic-scope context; they are finalized on their own.
    pub fn finalize(function: &mut FunctionNode) -> Result<()> {
        infer_scope_needs(function);

        let mut finalizer = TypeFinalizer {
            tracker: ScopeTracker::in_dynamic_context(
                function.flags.contains(FunctionFlags::IN_DYNAMIC_SCOPE),
            ),
            all_vars_in_scope: function.all_vars_in_scope(),
            vararg: function.is_vararg(),
            has_arguments_view: function.has_arguments_view(),
            quick_slots: 0,
        };
        finalizer.reserve(function)?;

        let dynamic = function.has_dynamic_scope();
        if dynamic {
            finalizer.tracker.enter_dynamic_scope();
        }
        let mut body = std::mem::take(&mut function.body);
        let walked = finalizer.block(&mut body, &mut function.symbols, true);
        function.body = body;
        walked?;
        if dynamic {
            finalizer.tracker.leave_dynamic_scope()?;
        }
        if finalizer.tracker.depth() != 0 {
            return Err(Error::frame_mismatch(format!(
                "{} frames still open after finalizing {}",
                finalizer.tracker.depth(),
                function.id
            )));
        }

        function.slot_count = finalizer.tracker.max_slots();
        debug!(
            function = %function.id,
            slots = function.slot_count,
            quick_slots = finalizer.quick_slots,
            scope = function.has_scope_block(),
            "types finalized"
        );
        Ok(())
    }

    /// Settle the compiler-reserved symbols before any slot is numbered
    fn reserve(&self, function: &mut FunctionNode) -> Result<()> {
        let needs_callee = function.needs_callee();
        let needs_scope = function.needs_parent_scope()
            || function.all_vars_in_scope()
            || function.is_split()
            || function.has_dynamic_scope()
            || function.has_scope_block()
            || function
                .symbols
                .iter()
                .any(|(_, s)| !s.is_internal() && s.is_scope());
        let reserved = function.reserved.clone();
        let symbols = &mut function.symbols;

        set_slot_request(symbols.get_mut(reserved.callee)?, needs_callee)?;
        set_slot_request(symbols.get_mut(reserved.scope)?, needs_scope)?;
        set_slot_request(symbols.get_mut(reserved.ret)?, function.flags.contains(FunctionFlags::IS_SPLIT))?;
        symbols.get_mut(reserved.this)?.request_slot()?;
        trace!(function = %function.id, needs_callee, needs_scope, "reserved symbols");
        Ok(())
    }

    fn block(&mut self, block: &mut Block, symbols: &mut SymbolTable, is_function_body: bool) -> Result<()> {
        let user_symbols = block
            .symbols
            .iter()
            .filter_map(|id| symbols.get(*id).ok())
            .filter(|s| matches!(s.kind(), SymbolKind::Variable | SymbolKind::Parameter))
            .count();

        // Bindings introduced under a dynamic scope must be reachable by name
        if self.tracker.in_dynamic_scope() && user_symbols > 0 {
            block.needs_scope = true;
            for &id in &block.symbols {
                let symbol = symbols.get_mut(id)?;
                if matches!(symbol.kind(), SymbolKind::Variable | SymbolKind::Parameter) {
                    symbol.set_scope();
                }
            }
        }
        let has_scope_symbols = block
            .symbols
            .iter()
            .filter_map(|id| symbols.get(*id).ok())
            .any(|s| !s.is_internal() && s.is_scope());
        if has_scope_symbols || (self.all_vars_in_scope && user_symbols > 0) {
            block.needs_scope = true;
        }
        if block.needs_scope {
            self.apply_scope_rules(block, symbols)?;
        }

        self.tracker.push_frame(&block.symbols, symbols, is_function_body)?;
        for stmt in &mut block.statements {
            self.statement(stmt, symbols)?;
        }
        self.tracker.pop_frame()?;
        Ok(())
    }

    /// Storage rules for the symbols of a block backed by a scope object
    fn apply_scope_rules(&self, block: &Block, symbols: &mut SymbolTable) -> Result<()> {
        let mut field = 0;
        let mut parameter = 0;
        for &id in &block.symbols {
            let symbol = symbols.get_mut(id)?;
            match symbol.kind() {
                SymbolKind::Variable => {
                    if self.all_vars_in_scope || symbol.is_scope() {
                        symbol.set_scope();
                        symbol.strip_slot();
                    } else if !symbol.needs_slot() {
                        return Err(Error::internal(format!(
                            "variable '{}' in a scope block has neither a slot nor scope storage",
                            symbol.name()
                        )));
                    }
                }
                SymbolKind::Parameter => {
                    if self.all_vars_in_scope || self.vararg || symbol.is_scope() {
                        symbol.set_scope();
                        if self.vararg {
                            symbol.strip_slot();
                        } else {
                            symbol.request_slot()?;
                        }
                    }
                }
                SymbolKind::Internal | SymbolKind::Temporary => continue,
            }
            if !symbol.is_scope() {
                continue;
            }
            if symbol.is_param() && self.has_arguments_view {
                symbol.set_field_index(parameter);
                parameter += 1;
            } else {
                symbol.set_field_index(field);
                field += 1;
            }
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &mut Statement, symbols: &mut SymbolTable) -> Result<()> {
        match stmt {
            Statement::Block(block) => self.block(block, symbols, false),
            Statement::Var(var) => match &mut var.init {
                Some(init) => self.expression(init, symbols),
                None => Ok(()),
            },
            Statement::Expression(e) => self.expression(&mut e.expression, symbols),
            Statement::If(node) => {
                self.expression(&mut node.test, symbols)?;
                self.block(&mut node.pass, symbols, false)?;
                match &mut node.fail {
                    Some(fail) => self.block(fail, symbols, false),
                    None => Ok(()),
                }
            }
            Statement::While(node) => {
                self.expression(&mut node.test, symbols)?;
                self.block(&mut node.body, symbols, false)
            }
            Statement::For(node) => {
                if let Some(init) = &mut node.init {
                    discard(init);
                    self.expression(init, symbols)?;
                }
                if let Some(test) = &mut node.test {
                    self.expression(test, symbols)?;
                }
                if let Some(modify) = &mut node.modify {
                    discard(modify);
                    self.expression(modify, symbols)?;
                }
                self.block(&mut node.body, symbols, false)
            }
            Statement::Return(node) => match &mut node.expression {
                Some(e) => self.expression(e, symbols),
                None => Ok(()),
            },
            Statement::Throw(node) => self.expression(&mut node.expression, symbols),
            Statement::Try(node) => {
                node.exception_slot = Some(self.tracker.quick_slot(Type::Object)?);
                self.quick_slots += 1;
                self.block(&mut node.body, symbols, false)?;
                match &mut node.catch {
                    Some(catch) => self.block(&mut catch.body, symbols, false),
                    None => Ok(()),
                }
            }
            Statement::With(node) => {
                self.expression(&mut node.expression, symbols)?;
                self.tracker.enter_dynamic_scope();
                let body = self.block(&mut node.body, symbols, false);
                self.tracker.leave_dynamic_scope()?;
                body
            }
            Statement::Split(node) => self.block(&mut node.body, symbols, false),
            Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => Ok(()),
        }
    }

    fn expression(&mut self, expr: &mut Expression, symbols: &mut SymbolTable) -> Result<()> {
        match expr {
            Expression::Literal(_) => Ok(()),
            Expression::Identifier(ident) => self.identifier(ident, symbols),
            Expression::Unary(node) => self.expression(&mut node.operand, symbols),
            Expression::Binary(node) => {
                self.expression(&mut node.lhs, symbols)?;
                self.expression(&mut node.rhs, symbols)
            }
            Expression::Sequence(node) => {
                let last = node.expressions.len().saturating_sub(1);
                for (i, e) in node.expressions.iter_mut().enumerate() {
                    if i < last {
                        discard(e);
                    }
                    self.expression(e, symbols)?;
                }
                Ok(())
            }
            Expression::Assign(node) => {
                self.expression(&mut node.target, symbols)?;
                self.expression(&mut node.value, symbols)
            }
            Expression::Ternary(node) => {
                self.expression(&mut node.test, symbols)?;
                self.expression(&mut node.consequent, symbols)?;
                self.expression(&mut node.alternate, symbols)
            }
            Expression::Call(node) => {
                self.expression(&mut node.callee, symbols)?;
                node.args.iter_mut().try_for_each(|a| self.expression(a, symbols))
            }
            Expression::Member(node) => self.expression(&mut node.base, symbols),
            Expression::Index(node) => {
                self.expression(&mut node.base, symbols)?;
                self.expression(&mut node.index, symbols)
            }
            Expression::Object(node) => node
                .properties
                .iter_mut()
                .try_for_each(|p| self.expression(&mut p.value, symbols)),
            Expression::Array(node) => node
                .elements
                .iter_mut()
                .try_for_each(|e| self.expression(e, symbols)),
            Expression::Function(inner) => {
                inner
                    .flags
                    .set(FunctionFlags::IN_DYNAMIC_SCOPE, self.tracker.in_dynamic_scope());
                Ok(())
            }
            Expression::Discard(inner) => self.expression(inner, symbols),
            Expression::JoinPredecessor(node) => self.expression(&mut node.expression, symbols),
        }
    }

    fn identifier(&self, ident: &mut IdentNode, symbols: &SymbolTable) -> Result<()> {
        if ident.is_internal() {
            return Ok(());
        }
        let scoped = match ident.symbol {
            Some(id) => symbols.get(id)?.is_scope(),
            None => true,
        };
        ident
            .flags
            .set(IdentFlags::FAST_SCOPE, scoped && !self.tracker.in_dynamic_scope());
        Ok(())
    }
}

fn set_slot_request(symbol: &mut Symbol, needed: bool) -> Result<()> {
    if needed {
        symbol.request_slot()
    } else {
        symbol.strip_slot();
        Ok(())
    }
}

/// Mark a value computed only for its side effects
fn discard(expr: &mut Expression) {
    let value = std::mem::replace(expr, build::undefined());
    *expr = value.discarded();
}

/// Set `NEEDS_PARENT_SCOPE` when the body resolves names through the scope
/// chain, creates closures, opens a `with` or contains eval. Returns the
/// flag's new value.
pub fn infer_scope_needs(function: &mut FunctionNode) -> bool {
    fn block(b: &Block) -> bool {
        b.statements.iter().any(statement)
    }
    fn statement(s: &Statement) -> bool {
        let own = match s {
            Statement::Var(v) => v.init.as_ref().is_some_and(expression),
            Statement::Expression(e) => expression(&e.expression),
            Statement::If(n) => expression(&n.test),
            Statement::While(n) => expression(&n.test),
            Statement::For(n) => [&n.init, &n.test, &n.modify]
                .into_iter()
                .flatten()
                .any(expression),
            Statement::Return(n) => n.expression.as_ref().is_some_and(expression),
            Statement::Throw(n) => expression(&n.expression),
            Statement::With(_) => true,
            _ => false,
        };
        own || s.child_blocks().into_iter().any(block)
    }
    fn expression(e: &Expression) -> bool {
        match e {
            Expression::Literal(_) => false,
            Expression::Identifier(id) => id.symbol.is_none() && !id.is_internal(),
            Expression::Function(_) => true,
            Expression::Unary(n) => expression(&n.operand),
            Expression::Binary(n) => expression(&n.lhs) || expression(&n.rhs),
            Expression::Sequence(n) => n.expressions.iter().any(expression),
            Expression::Assign(n) => expression(&n.target) || expression(&n.value),
            Expression::Ternary(n) => {
                expression(&n.test) || expression(&n.consequent) || expression(&n.alternate)
            }
            Expression::Call(n) => expression(&n.callee) || n.args.iter().any(expression),
            Expression::Member(n) => expression(&n.base),
            Expression::Index(n) => expression(&n.base) || expression(&n.index),
            Expression::Object(n) => n.properties.iter().any(|p| expression(&p.value)),
            Expression::Array(n) => n.elements.iter().any(expression),
            Expression::Discard(inner) => expression(inner),
            Expression::JoinPredecessor(n) => expression(&n.expression),
        }
    }

    if function.has_eval() || block(&function.body) {
        function.flags.insert(FunctionFlags::NEEDS_PARENT_SCOPE);
    }
    function.needs_parent_scope()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;

    fn slot(f: &FunctionNode, name: &str) -> Option<u16> {
        f.symbols.get(f.symbols.lookup(name).unwrap()).unwrap().slot()
    }

    fn symbol<'a>(f: &'a FunctionNode, name: &str) -> &'a Symbol {
        f.symbols.get(f.symbols.lookup(name).unwrap()).unwrap()
    }

    #[test]
    fn test_plain_function_strips_callee_and_scope() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[("a", Type::Int)], FunctionFlags::empty());
        let decl = var(&mut f, "x", Type::Number, Some(num(1.5)));
        f.body.statements.push(decl);
        f.body.statements.push(return_stmt(Some(local(&f, "a"))));
        TypeFinalizer::finalize(&mut f).unwrap();

        assert_eq!(slot(&f, ":callee"), None);
        assert_eq!(slot(&f, "this"), Some(0));
        assert_eq!(slot(&f, "a"), Some(1));
        assert_eq!(slot(&f, ":scope"), None);
        assert_eq!(slot(&f, ":return"), None);
        assert_eq!(slot(&f, "x"), Some(2));
        assert_eq!(f.slot_count, 4);
        assert!(!f.needs_parent_scope());
    }

    #[test]
    fn test_global_reference_needs_callee_and_scope() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::empty());
        f.body.statements.push(return_stmt(Some(global("g"))));
        TypeFinalizer::finalize(&mut f).unwrap();
        assert!(f.needs_parent_scope());
        assert_eq!(slot(&f, ":callee"), Some(0));
        assert_eq!(slot(&f, "this"), Some(1));
        assert_eq!(slot(&f, ":scope"), Some(2));
        match &f.body.statements[0] {
            Statement::Return(r) => match r.expression.as_ref().unwrap() {
                Expression::Identifier(id) => assert!(id.is_fast_scope()),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_all_vars_in_scope() {
        let mut f = FunctionNode::new(
            FunctionId(1),
            "f",
            &[("a", Type::Int)],
            FunctionFlags::ALL_VARS_IN_SCOPE,
        );
        let decl = var(&mut f, "x", Type::Int, None);
        f.body.statements.push(decl);
        TypeFinalizer::finalize(&mut f).unwrap();

        assert!(f.body.needs_scope);
        let x = symbol(&f, "x");
        assert!(x.is_scope());
        assert_eq!(x.slot(), None);
        assert_eq!(x.field_index(), Some(1));
        let a = symbol(&f, "a");
        assert!(a.is_scope());
        assert!(a.slot().is_some());
        assert_eq!(a.field_index(), Some(0));
    }

    #[test]
    fn test_vararg_scope_parameters_lose_slots() {
        let mut f = FunctionNode::new(
            FunctionId(1),
            "f",
            &[("a", Type::Object)],
            FunctionFlags::USES_ARGUMENTS | FunctionFlags::ALL_VARS_IN_SCOPE,
        );
        TypeFinalizer::finalize(&mut f).unwrap();
        let a = symbol(&f, "a");
        assert!(a.is_scope());
        assert_eq!(a.slot(), None);
        // located in the arguments view
        assert_eq!(a.field_index(), Some(0));
        assert!(symbol(&f, ":varargs").slot().is_some());
    }

    #[test]
    fn test_scope_block_variable_without_storage_is_an_error() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::empty());
        let id = f.declare(Symbol::new("x", SymbolKind::Variable, Type::Int));
        f.symbols.get_mut(id).unwrap().strip_slot();
        f.body.needs_scope = true;
        let err = TypeFinalizer::finalize(&mut f).unwrap_err();
        assert!(matches!(err, Error::InternalError(_)));
    }

    #[test]
    fn test_sequence_and_for_clauses_are_discarded() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::empty());
        let decl = var(&mut f, "i", Type::Int, None);
        f.body.statements.push(decl);
        let i = local(&f, "i");
        let seq = sequence(vec![assign(i.clone(), int(1)), int(2)]);
        f.body.statements.push(expr_stmt(seq));
        f.body.statements.push(for_stmt(
            Some(assign(i.clone(), int(0))),
            Some(binary(BinaryOp::Lt, i.clone(), int(3))),
            Some(assign(i.clone(), binary(BinaryOp::Add, i, int(1)))),
            block(vec![]),
        ));
        TypeFinalizer::finalize(&mut f).unwrap();

        match &f.body.statements[1] {
            Statement::Expression(e) => match &e.expression {
                Expression::Sequence(s) => {
                    assert!(matches!(s.expressions[0], Expression::Discard(_)));
                    assert!(matches!(s.expressions[1], Expression::Literal(_)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        match &f.body.statements[2] {
            Statement::For(node) => {
                assert!(matches!(node.init, Some(Expression::Discard(_))));
                assert!(matches!(node.modify, Some(Expression::Discard(_))));
                assert!(matches!(node.test, Some(Expression::Binary(_))));
            }
            other => panic!("unexpected {:?}", other),
        }

        // A second run does not wrap twice
        TypeFinalizer::finalize(&mut f).unwrap();
        match &f.body.statements[2] {
            Statement::For(node) => match node.init.as_ref().unwrap() {
                Expression::Discard(inner) => assert!(matches!(**inner, Expression::Assign(_))),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_with_body_is_dynamic() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::empty());
        let inner = FunctionNode::new(FunctionId(2), "g", &[], FunctionFlags::empty());
        let body = block(vec![
            expr_stmt(global("y")),
            expr_stmt(function_expr(inner)),
        ]);
        f.body.statements.push(with_stmt(global("o"), body));
        TypeFinalizer::finalize(&mut f).unwrap();

        let Statement::With(node) = &f.body.statements[0] else {
            panic!("expected with");
        };
        let Expression::Identifier(o) = &node.expression else {
            panic!("expected identifier");
        };
        assert!(o.is_fast_scope());
        let Statement::Expression(y) = &node.body.statements[0] else {
            panic!("expected expression");
        };
        let Expression::Identifier(y) = &y.expression else {
            panic!("expected identifier");
        };
        assert!(!y.is_fast_scope());
        let Statement::Expression(g) = &node.body.statements[1] else {
            panic!("expected expression");
        };
        let Expression::Function(g) = &g.expression else {
            panic!("expected function");
        };
        assert!(g.flags.contains(FunctionFlags::IN_DYNAMIC_SCOPE));
    }

    #[test]
    fn test_try_gets_exception_quick_slot() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::empty());
        let decl = var(&mut f, "x", Type::Object, None);
        f.body.statements.push(decl);
        f.body.statements.push(Statement::Try(Box::new(TryNode {
            body: block(vec![throw_stmt(int(1))]),
            catch: None,
            exception_slot: None,
            span: Span::default(),
        })));
        TypeFinalizer::finalize(&mut f).unwrap();
        let Statement::Try(node) = &f.body.statements[1] else {
            panic!("expected try");
        };
        // this, x, then the quick slot
        assert_eq!(node.exception_slot, Some(2));
        assert_eq!(f.slot_count, 3);
    }

    #[test]
    fn test_eval_function_keeps_variables_in_scope() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[("a", Type::Int)], FunctionFlags::HAS_EVAL);
        let decl = var(&mut f, "x", Type::Int, None);
        f.body.statements.push(decl);
        TypeFinalizer::finalize(&mut f).unwrap();
        assert!(f.body.needs_scope);
        assert!(symbol(&f, "x").is_scope());
        assert_eq!(symbol(&f, "x").slot(), None);
        assert!(symbol(&f, "a").is_scope());
        assert!(symbol(&f, "a").slot().is_some());
    }
}
