//! Method splitting
//!
//! [`Splitter`] partitions the statements of an oversized function into
//! [`SplitNode`] fragments, each compiled as its own method in a compile
//! unit with room for it. A split function keeps every variable in its
//! scope object, so fragments only share the callee, the receiver and the
//! scope.
//!
//! Control that leaves a fragment by `return`, `break` or `continue`
//! records a split state in the scope and returns; the caller reads the
//! state back and dispatches with a table switch. State `0` is a pending
//! return, `k > 0` the `k`-th external jump target of the fragment and
//! `-1` normal completion.

use tracing::debug;

use super::unit::CompileUnits;
use super::weigh::{Weigher, SPLIT_WEIGHT};
use super::{method_name, CodeGenerator, EmittedMethod};
use crate::ast::*;
use crate::bytecode::{helpers, InvokeKind, Label, MethodDescriptor, MethodEmitter, MethodRef};
use crate::error::{Error, Result};

/// Split state of a fragment that completed normally
const STATE_NONE: i32 = -1;
/// Split state of a pending return
const STATE_RETURN: i32 = 0;

/// Partitions heavy blocks into split fragments
pub struct Splitter<'u> {
    units: &'u CompileUnits,
    threshold: u64,
    prefix: String,
    count: usize,
}

impl<'u> Splitter<'u> {
    /// Split every block of `function` whose weight reaches `threshold`.
    /// Returns the number of fragments created.
    pub fn split(function: &mut FunctionNode, units: &'u CompileUnits, threshold: u64) -> Result<usize> {
        let mut splitter = Splitter {
            units,
            threshold,
            prefix: method_name(function),
            count: 0,
        };
        splitter.block(&mut function.body)?;
        if splitter.count > 0 {
            function
                .flags
                .insert(FunctionFlags::IS_SPLIT | FunctionFlags::ALL_VARS_IN_SCOPE);
            function.body.needs_scope = true;
            debug!(
                function = %function.id,
                fragments = splitter.count,
                weight = Weigher::function(function),
                "function split"
            );
        }
        Ok(splitter.count)
    }

    fn block(&mut self, block: &mut Block) -> Result<()> {
        for stmt in &mut block.statements {
            if Weigher::statement(stmt) >= self.threshold {
                for child in child_blocks_mut(stmt) {
                    self.block(child)?;
                }
            }
        }
        if Weigher::block(block) >= self.threshold {
            self.partition(block)?;
        }
        Ok(())
    }

    /// Wrap runs of statements into fragments lighter than the threshold.
    /// Terminal statements stay in the enclosing block.
    fn partition(&mut self, block: &mut Block) -> Result<()> {
        let statements = std::mem::take(&mut block.statements);
        let mut result = Vec::new();
        let mut pending = Vec::new();
        let mut weight = 0;
        for stmt in statements {
            let w = Weigher::statement(&stmt);
            if weight + w >= self.threshold || stmt.is_terminal() {
                self.flush(&mut result, &mut pending, &mut weight);
            }
            if stmt.is_terminal() {
                result.push(stmt);
            } else {
                pending.push(stmt);
                weight += w;
            }
        }
        self.flush(&mut result, &mut pending, &mut weight);
        block.statements = result;
        Ok(())
    }

    fn flush(&mut self, result: &mut Vec<Statement>, pending: &mut Vec<Statement>, weight: &mut u64) {
        if pending.is_empty() {
            return;
        }
        let unit = self.units.find_unit(*weight + SPLIT_WEIGHT);
        let mut body = Block::new(std::mem::take(pending));
        body.needs_scope = true;
        let name = format!("{}$split{}", self.prefix, self.count);
        debug!(fragment = %name, unit = %unit.name(), weight = *weight, "split fragment");
        result.push(Statement::Split(Box::new(SplitNode {
            name,
            unit: unit.name().to_string(),
            weight: *weight,
            body,
            span: Span::default(),
        })));
        self.count += 1;
        *weight = 0;
    }
}

fn child_blocks_mut(stmt: &mut Statement) -> Vec<&mut Block> {
    match stmt {
        Statement::Block(b) => vec![b],
        Statement::If(i) => std::iter::once(&mut i.pass).chain(i.fail.as_mut()).collect(),
        Statement::While(w) => vec![&mut w.body],
        Statement::For(f) => vec![&mut f.body],
        Statement::Try(t) => std::iter::once(&mut t.body)
            .chain(t.catch.as_mut().map(|c| &mut c.body))
            .collect(),
        Statement::With(w) => vec![&mut w.body],
        _ => Vec::new(),
    }
}

/// Emission state of an open fragment method
#[derive(Debug)]
pub(super) struct Fragment {
    /// Labels of the caller this fragment jumps to, with their scope depth;
    /// the index plus one is the split state
    targets: Vec<(Label, u32)>,
    has_return: bool,
    /// Scope depth at the split point
    base_depth: u32,
}

/// Descriptor of every fragment method: callee, receiver, scope
fn fragment_descriptor() -> MethodDescriptor {
    MethodDescriptor::new(vec![Type::Object; 3], Some(Type::Object))
}

impl<'a> CodeGenerator<'a> {
    fn required_slot(&self, id: SymbolId) -> Result<u16> {
        let symbol = self.symbol(id)?;
        symbol.slot().ok_or_else(|| {
            Error::internal(format!(
                "split function {} has no slot for '{}'",
                self.function.name,
                symbol.name()
            ))
        })
    }

    fn set_split_state(&mut self, state: i32) -> Result<()> {
        self.load_scope()?;
        self.method.push(LiteralValue::Int(state));
        self.method.invoke(InvokeKind::Static, helpers::set_split_state())
    }

    /// Pop scopes opened inside the current fragment, so the split state
    /// lands in the scope the caller reads it from
    fn pop_to_fragment_base(&mut self) -> Result<()> {
        let base = self
            .fragments
            .last()
            .map(|f| f.base_depth)
            .ok_or_else(|| Error::internal("not inside a split fragment"))?;
        let depth = self
            .scope_depth
            .checked_sub(base)
            .ok_or_else(|| Error::internal("scope depth below fragment base"))?;
        self.pop_scopes(depth)
    }

    /// Leave the current fragment with `state` and the value of the
    /// return slot
    fn exit_fragment(&mut self, state: i32) -> Result<()> {
        self.pop_to_fragment_base()?;
        self.set_split_state(state)?;
        let ret = self.required_slot(self.function.reserved.ret)?;
        self.method.load(Type::Object, ret);
        self.method.ret(Type::Object)
    }

    /// `return` inside a fragment: park the value in the return slot and
    /// hand it to the caller
    pub(super) fn fragment_return(&mut self, expression: Option<&Expression>) -> Result<()> {
        let ret = self.required_slot(self.function.reserved.ret)?;
        match expression {
            Some(e) => self.load(e, Type::Object)?,
            None => self.method.push(LiteralValue::Undefined),
        }
        self.method.store(Type::Object, ret)?;
        if let Some(fragment) = self.fragments.last_mut() {
            fragment.has_return = true;
        }
        self.exit_fragment(STATE_RETURN)
    }

    /// Jump to `label` at scope depth `depth`. A label of another method is
    /// reached by leaving the fragment with its split state.
    pub(super) fn split_aware_goto(&mut self, label: Label, depth: u32) -> Result<()> {
        if self.method.owns(label) {
            let pops = self
                .scope_depth
                .checked_sub(depth)
                .ok_or_else(|| Error::internal("jump into a deeper scope"))?;
            self.pop_scopes(pops)?;
            return self.method.goto(label);
        }
        let fragment = self
            .fragments
            .last_mut()
            .ok_or_else(|| Error::internal(format!("jump to foreign label {}", label)))?;
        let index = match fragment.targets.iter().position(|(l, _)| *l == label) {
            Some(i) => i,
            None => {
                fragment.targets.push((label, depth));
                fragment.targets.len() - 1
            }
        };
        self.exit_fragment(index as i32 + 1)
    }

    /// Emit the method of `node` and its call site
    pub(super) fn split_fragment(&mut self, node: &SplitNode) -> Result<()> {
        let id = self.next_method_id();
        let mut method = MethodEmitter::new(id, node.name.clone(), fragment_descriptor());
        method.reserve_locals(self.function.slot_count);
        let caller = std::mem::replace(&mut self.method, method);
        self.fragments.push(Fragment {
            targets: Vec::new(),
            has_return: false,
            base_depth: self.scope_depth,
        });
        let depth = self.scope_depth;

        let body = self.fragment_body(node);
        self.scope_depth = depth;
        let fragment = self.fragments.pop();
        let method = std::mem::replace(&mut self.method, caller);
        body?;
        let fragment = fragment.ok_or_else(|| Error::internal("split fragment stack underflow"))?;

        let (code, continuations) = method.finish()?;
        self.continuations.merge(continuations)?;
        debug!(
            fragment = %node.name,
            unit = %node.unit,
            targets = fragment.targets.len(),
            has_return = fragment.has_return,
            "emitted split fragment"
        );
        self.methods.push(EmittedMethod {
            unit: node.unit.clone(),
            code,
        });
        self.call_fragment(node, &fragment)
    }

    fn fragment_body(&mut self, node: &SplitNode) -> Result<()> {
        let reserved = &self.function.reserved;
        let incoming = [reserved.callee, reserved.this, reserved.scope];
        // Destinations never lie below their source, so moving from the
        // last parameter down is safe
        for (source, id) in incoming.into_iter().enumerate().rev() {
            let slot = self.required_slot(id)?;
            if slot != source as u16 {
                self.method.load(Type::Object, source as u16);
                self.method.store(Type::Object, slot)?;
            }
        }
        let ret = self.required_slot(self.function.reserved.ret)?;
        self.method.push(LiteralValue::Undefined);
        self.method.store(Type::Object, ret)?;

        self.block(&node.body)?;
        if self.method.is_reachable() {
            self.set_split_state(STATE_NONE)?;
            self.method.load(Type::Object, ret);
            self.method.ret(Type::Object)?;
        }
        Ok(())
    }

    /// Invoke a fragment and dispatch on the split state it left
    fn call_fragment(&mut self, node: &SplitNode, fragment: &Fragment) -> Result<()> {
        let reserved = &self.function.reserved;
        for id in [reserved.callee, reserved.this, reserved.scope] {
            let slot = self.required_slot(id)?;
            self.method.load(Type::Object, slot);
        }
        self.method.invoke(
            InvokeKind::Static,
            MethodRef::new(node.unit.clone(), node.name.clone(), fragment_descriptor()),
        )?;
        let ret = self.required_slot(self.function.reserved.ret)?;
        self.method.store(Type::Object, ret)?;

        if !fragment.has_return && fragment.targets.is_empty() {
            return Ok(());
        }
        let next = self.method.new_label("split_next");
        let on_return = fragment.has_return.then(|| self.method.new_label("split_return"));
        let cases: Vec<Label> = fragment
            .targets
            .iter()
            .map(|_| self.method.new_label("split_jump"))
            .collect();
        let mut table = vec![on_return.unwrap_or(next)];
        table.extend(cases.iter().copied());

        self.load_scope()?;
        self.method.invoke(InvokeKind::Static, helpers::get_split_state())?;
        self.method.table_switch(STATE_RETURN, table, next)?;

        if let Some(on_return) = on_return {
            self.method.label(on_return)?;
            if self.fragments.is_empty() {
                let ty = self.signature.return_type();
                self.method.load(Type::Object, ret);
                self.method.convert(ty)?;
                self.method.ret(ty)?;
            } else {
                if let Some(outer) = self.fragments.last_mut() {
                    outer.has_return = true;
                }
                self.exit_fragment(STATE_RETURN)?;
            }
        }
        for (case, (target, depth)) in cases.into_iter().zip(fragment.targets.iter().copied()) {
            self.method.label(case)?;
            self.set_split_state(STATE_NONE)?;
            self.split_aware_goto(target, depth)?;
        }
        self.method.label(next)
    }
}
