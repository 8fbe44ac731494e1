//! Method emitter with evaluation-stack type tracking

use std::sync::Arc;

use super::*;
use crate::deopt::{ContinuationTable, DeoptContinuation};
use crate::error::{Error, Result};

/// One evaluation-stack entry. `local` is the slot the value was loaded
/// from, as long as that slot has not been overwritten since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    pub ty: Type,
    pub local: Option<u16>,
}

#[derive(Debug)]
struct LabelState {
    name: String,
    stack: Option<Vec<StackEntry>>,
    defined: bool,
    referenced: bool,
}

/// Records the instructions of one method.
///
/// Every operation checks that the stack holds enough operands. Jumps and
/// label definitions compare the stack against the first snapshot seen for
/// the label, so all predecessors of a join agree on depth and types.
#[derive(Debug)]
pub struct MethodEmitter {
    id: u32,
    name: String,
    descriptor: MethodDescriptor,
    code: Vec<Instruction>,
    stack: Vec<StackEntry>,
    max_stack: u16,
    labels: Vec<LabelState>,
    reachable: bool,
    local_types: Vec<Type>,
    first_temp: u16,
    next_temp: u16,
    continuations: ContinuationTable,
}

impl MethodEmitter {
    /// Start a method whose parameters occupy the first local slots
    pub fn new(id: u32, name: impl Into<String>, descriptor: MethodDescriptor) -> Self {
        let mut local_types = Vec::new();
        for ty in &descriptor.params {
            local_types.push(*ty);
            if ty.slots() == 2 {
                local_types.push(Type::Unknown);
            }
        }
        let params = local_types.len() as u16;
        Self {
            id,
            name: name.into(),
            descriptor,
            code: Vec::new(),
            stack: Vec::new(),
            max_stack: 0,
            labels: Vec::new(),
            reachable: true,
            local_types,
            first_temp: params,
            next_temp: params,
            continuations: ContinuationTable::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn stack(&self) -> &[StackEntry] {
        &self.stack
    }

    pub fn stack_types(&self) -> Vec<Type> {
        self.stack.iter().map(|e| e.ty).collect()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    /// Keep the first `count` slots for named locals; temporaries start
    /// above them
    pub fn reserve_locals(&mut self, count: u16) {
        self.first_temp = self.first_temp.max(count);
        self.next_temp = self.next_temp.max(self.first_temp);
    }

    /// Allocate a fresh temporary slot
    pub fn new_temp(&mut self, ty: Type) -> u16 {
        let slot = self.next_temp;
        self.next_temp += ty.normalized().slots();
        slot
    }

    pub fn local_type(&self, slot: u16) -> Type {
        self.local_types.get(slot as usize).copied().unwrap_or(Type::Unknown)
    }

    fn is_temp_load(&self, entry: &StackEntry) -> bool {
        entry.local.map(|slot| slot >= self.first_temp).unwrap_or(false)
    }

    fn emit(&mut self, instruction: Instruction) {
        tracing::trace!(method = %self.name, %instruction, "emit");
        self.code.push(instruction);
    }

    fn push_entry(&mut self, ty: Type, local: Option<u16>) {
        self.stack.push(StackEntry {
            ty: ty.normalized(),
            local,
        });
        self.max_stack = self.max_stack.max(self.stack.len() as u16);
    }

    fn pop_entry(&mut self, what: &str) -> Result<StackEntry> {
        self.stack.pop().ok_or_else(|| {
            Error::stack_underflow(format!("{} in {} needs an operand", what, self.name))
        })
    }

    fn pop_n(&mut self, n: usize, what: &str) -> Result<Vec<StackEntry>> {
        if self.stack.len() < n {
            return Err(Error::stack_underflow(format!(
                "{} in {} needs {} operands, stack holds {}",
                what,
                self.name,
                n,
                self.stack.len()
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek(&self, what: &str) -> Result<StackEntry> {
        self.stack.last().copied().ok_or_else(|| {
            Error::stack_underflow(format!("{} in {} needs an operand", what, self.name))
        })
    }

    pub fn push(&mut self, value: LiteralValue) {
        self.push_entry(value.ty(), None);
        self.emit(Instruction::Push(value));
    }

    pub fn load(&mut self, ty: Type, slot: u16) {
        let ty = ty.normalized();
        self.push_entry(ty, Some(slot));
        self.emit(Instruction::Load { ty, slot });
    }

    pub fn store(&mut self, ty: Type, slot: u16) -> Result<()> {
        let ty = ty.normalized();
        let entry = self.pop_entry("store")?;
        if !entry.ty.is_equivalent_to(ty) {
            return Err(Error::internal(format!(
                "store of {} into slot {} typed {} in {}",
                entry.ty, slot, ty, self.name
            )));
        }
        let width = ty.slots();
        for e in &mut self.stack {
            if let Some(local) = e.local {
                if local >= slot && local < slot + width {
                    e.local = None;
                }
            }
        }
        let end = (slot + width) as usize;
        if self.local_types.len() < end {
            self.local_types.resize(end, Type::Unknown);
        }
        self.local_types[slot as usize] = ty;
        if width == 2 {
            self.local_types[slot as usize + 1] = Type::Unknown;
        }
        self.emit(Instruction::Store { ty, slot });
        Ok(())
    }

    pub fn pop(&mut self) -> Result<()> {
        self.pop_entry("pop")?;
        self.emit(Instruction::Pop);
        Ok(())
    }

    pub fn dup(&mut self) -> Result<()> {
        let top = self.peek("dup")?;
        self.push_entry(top.ty, top.local);
        self.emit(Instruction::Dup);
        Ok(())
    }

    pub fn swap(&mut self) -> Result<()> {
        let len = self.stack.len();
        if len < 2 {
            return Err(Error::stack_underflow(format!("swap in {}", self.name)));
        }
        self.stack.swap(len - 1, len - 2);
        self.emit(Instruction::Swap);
        Ok(())
    }

    /// Convert the top of the stack; a no-op when it already has the type
    pub fn convert(&mut self, to: Type) -> Result<()> {
        let to = to.normalized();
        let top = self.pop_entry("convert")?;
        if top.ty == to {
            self.stack.push(top);
            return Ok(());
        }
        self.push_entry(to, None);
        self.emit(Instruction::Convert { from: top.ty, to });
        Ok(())
    }

    pub fn arith(&mut self, op: ArithOp, ty: Type, program_point: Option<ProgramPoint>) -> Result<()> {
        self.pop_n(2, op.as_str())?;
        self.push_entry(ty, None);
        self.emit(Instruction::Arith {
            op,
            ty: ty.normalized(),
            program_point,
        });
        Ok(())
    }

    pub fn neg(&mut self, ty: Type, program_point: Option<ProgramPoint>) -> Result<()> {
        self.pop_entry("neg")?;
        self.push_entry(ty, None);
        self.emit(Instruction::Neg {
            ty: ty.normalized(),
            program_point,
        });
        Ok(())
    }

    pub fn invoke(&mut self, kind: InvokeKind, method: MethodRef) -> Result<()> {
        self.pop_n(method.descriptor.params.len(), &method.name)?;
        if let Some(ret) = method.descriptor.returns {
            self.push_entry(ret, None);
        }
        self.emit(Instruction::Invoke { kind, method });
        Ok(())
    }

    pub fn dynamic_get(
        &mut self,
        name: &str,
        ty: Type,
        flags: CallSiteFlags,
        program_point: Option<ProgramPoint>,
    ) -> Result<()> {
        self.pop_entry("dyn_get")?;
        self.push_entry(ty, None);
        self.emit(Instruction::DynamicGet {
            name: name.to_string(),
            ty: ty.normalized(),
            flags,
            program_point,
        });
        Ok(())
    }

    pub fn dynamic_set(&mut self, name: &str, flags: CallSiteFlags) -> Result<()> {
        self.pop_n(2, "dyn_set")?;
        self.emit(Instruction::DynamicSet {
            name: name.to_string(),
            flags,
        });
        Ok(())
    }

    pub fn dynamic_get_index(
        &mut self,
        ty: Type,
        flags: CallSiteFlags,
        program_point: Option<ProgramPoint>,
    ) -> Result<()> {
        self.pop_n(2, "dyn_get_index")?;
        self.push_entry(ty, None);
        self.emit(Instruction::DynamicGetIndex {
            ty: ty.normalized(),
            flags,
            program_point,
        });
        Ok(())
    }

    pub fn dynamic_set_index(&mut self, flags: CallSiteFlags) -> Result<()> {
        self.pop_n(3, "dyn_set_index")?;
        self.emit(Instruction::DynamicSetIndex { flags });
        Ok(())
    }

    /// Pops the function, the receiver and `argc` arguments
    pub fn dynamic_call(
        &mut self,
        argc: u16,
        ty: Type,
        flags: CallSiteFlags,
        program_point: Option<ProgramPoint>,
    ) -> Result<()> {
        self.pop_n(argc as usize + 2, "dyn_call")?;
        self.push_entry(ty, None);
        self.emit(Instruction::DynamicCall {
            argc,
            ty: ty.normalized(),
            flags,
            program_point,
        });
        Ok(())
    }

    /// Pops the constructor and `argc` arguments
    pub fn dynamic_new(&mut self, argc: u16, flags: CallSiteFlags) -> Result<()> {
        self.pop_n(argc as usize + 1, "dyn_new")?;
        self.push_entry(Type::Object, None);
        self.emit(Instruction::DynamicNew { argc, flags });
        Ok(())
    }

    pub fn get_field(&mut self, index: u32, ty: Type) -> Result<()> {
        self.pop_entry("getfield")?;
        self.push_entry(ty, None);
        self.emit(Instruction::GetField {
            index,
            ty: ty.normalized(),
        });
        Ok(())
    }

    pub fn put_field(&mut self, index: u32, ty: Type) -> Result<()> {
        self.pop_n(2, "putfield")?;
        self.emit(Instruction::PutField {
            index,
            ty: ty.normalized(),
        });
        Ok(())
    }

    pub fn new_array(&mut self, length: u32) {
        self.push_entry(Type::Object, None);
        self.emit(Instruction::NewArray { length });
    }

    pub fn array_store(&mut self) -> Result<()> {
        self.pop_n(3, "aastore")?;
        self.emit(Instruction::ArrayStore);
        Ok(())
    }

    pub fn array_load(&mut self) -> Result<()> {
        self.pop_n(2, "aaload")?;
        self.push_entry(Type::Object, None);
        self.emit(Instruction::ArrayLoad);
        Ok(())
    }

    pub fn new_structure(&mut self, class: Arc<StructureClass>, map: Arc<PropertyMap>) -> Result<()> {
        let operands = if map.has_parameters() { 2 } else { 1 };
        self.pop_n(operands, "new structure")?;
        self.push_entry(Type::Object, None);
        self.emit(Instruction::NewStructure { class, map });
        Ok(())
    }

    pub fn new_object(&mut self, map: Arc<PropertyMap>) -> Result<()> {
        self.pop_n(2, "new object")?;
        self.push_entry(Type::Object, None);
        self.emit(Instruction::NewObject { map });
        Ok(())
    }

    pub fn new_function(&mut self, id: FunctionId) -> Result<()> {
        self.pop_entry("new_function")?;
        self.push_entry(Type::Object, None);
        self.emit(Instruction::NewFunction { id });
        Ok(())
    }

    pub fn ret(&mut self, ty: Type) -> Result<()> {
        let ty = ty.normalized();
        let value = self.pop_entry("return")?;
        if !value.ty.is_equivalent_to(ty) {
            return Err(Error::internal(format!(
                "{} returns {} but the stack holds {}",
                self.name, ty, value.ty
            )));
        }
        self.emit(Instruction::Return(ty));
        self.unreachable();
        Ok(())
    }

    pub fn throw(&mut self) -> Result<()> {
        self.pop_entry("throw")?;
        self.emit(Instruction::Throw);
        self.unreachable();
        Ok(())
    }

    fn unreachable(&mut self) {
        self.reachable = false;
        self.stack.clear();
    }

    pub fn new_label(&mut self, name: impl Into<String>) -> Label {
        let index = self.labels.len() as u32;
        self.labels.push(LabelState {
            name: name.into(),
            stack: None,
            defined: false,
            referenced: false,
        });
        Label { method: self.id, index }
    }

    /// Whether `label` was created by this method
    pub fn owns(&self, label: Label) -> bool {
        label.method == self.id
    }

    fn label_state(&mut self, label: Label) -> Result<&mut LabelState> {
        if label.method != self.id {
            return Err(Error::internal(format!(
                "{} cannot jump to a label of method #{}",
                self.name, label.method
            )));
        }
        self.labels
            .get_mut(label.index as usize)
            .ok_or_else(|| Error::internal(format!("unknown label {}", label)))
    }

    /// Record or check the stack a predecessor brings to `label`
    fn join_to(&mut self, label: Label) -> Result<()> {
        let current = self.stack.clone();
        let state = self.label_state(label)?;
        state.referenced = true;
        match &mut state.stack {
            None => state.stack = Some(current),
            Some(expected) => {
                let compatible = expected.len() == current.len()
                    && expected.iter().zip(&current).all(|(e, c)| e.ty.is_equivalent_to(c.ty));
                if !compatible {
                    return Err(Error::JoinTypeMismatch {
                        label: format!("{} ({})", label, state.name),
                        expected: expected.iter().map(|e| e.ty).collect(),
                        found: current.iter().map(|e| e.ty).collect(),
                    });
                }
                for (e, c) in expected.iter_mut().zip(&current) {
                    if e.local != c.local {
                        e.local = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Define `label` at the current position. Code after a label that no
    /// jump targets and that is not reached by fall-through stays
    /// unreachable.
    pub fn label(&mut self, label: Label) -> Result<()> {
        let fall_through = self.reachable;
        if fall_through {
            self.join_to(label)?;
        }
        let state = self.label_state(label)?;
        if state.defined {
            return Err(Error::internal(format!("label {} ({}) defined twice", label, state.name)));
        }
        state.defined = true;
        let referenced = state.referenced;
        let stack = state.stack.clone().unwrap_or_default();
        self.stack = stack;
        self.reachable = fall_through || referenced;
        self.emit(Instruction::Label(label));
        Ok(())
    }

    /// Define an exception handler entry; the stack holds the exception
    pub fn catch_label(&mut self, label: Label) -> Result<()> {
        let state = self.label_state(label)?;
        if state.defined {
            return Err(Error::internal(format!("label {} ({}) defined twice", label, state.name)));
        }
        state.defined = true;
        state.referenced = true;
        self.stack.clear();
        self.push_entry(Type::Object, None);
        self.reachable = true;
        self.emit(Instruction::Label(label));
        Ok(())
    }

    pub fn try_catch(&mut self, start: Label, end: Label, handler: Label) {
        self.emit(Instruction::TryCatch { start, end, handler });
    }

    pub fn goto(&mut self, label: Label) -> Result<()> {
        self.join_to(label)?;
        self.emit(Instruction::Goto(label));
        self.unreachable();
        Ok(())
    }

    /// Pop a boolean and jump to `label` when it equals `jump_if`
    pub fn test(&mut self, jump_if: bool, label: Label) -> Result<()> {
        self.pop_entry("test")?;
        self.join_to(label)?;
        self.emit(Instruction::Test {
            jump_if,
            target: label,
        });
        Ok(())
    }

    /// Pop two operands and jump to `label` when `condition` holds
    pub fn compare_jump(&mut self, condition: Condition, nan: NanOrdering, label: Label) -> Result<()> {
        let operands = self.pop_n(2, "compare")?;
        let ty = operands[0].ty;
        if !ty.is_equivalent_to(operands[1].ty) {
            return Err(Error::internal(format!(
                "compare of {} with {} in {}",
                operands[0].ty, operands[1].ty, self.name
            )));
        }
        self.join_to(label)?;
        self.emit(Instruction::CompareJump {
            condition,
            ty,
            nan,
            target: label,
        });
        Ok(())
    }

    pub fn table_switch(&mut self, low: i32, targets: Vec<Label>, default: Label) -> Result<()> {
        self.pop_entry("tableswitch")?;
        for target in targets.iter().chain(std::iter::once(&default)) {
            self.join_to(*target)?;
        }
        self.emit(Instruction::TableSwitch {
            low,
            targets,
            default,
        });
        self.unreachable();
        Ok(())
    }

    /// Spill every pending stack value that is not a temporary load into a
    /// fresh temporary and reload it, so a continuation can name a slot for
    /// each of them.
    pub fn store_stack(&mut self) -> Result<()> {
        let Some(first) = self.stack.iter().position(|e| !self.is_temp_load(e)) else {
            return Ok(());
        };
        let mut spilled = Vec::with_capacity(self.stack.len() - first);
        for i in (first..self.stack.len()).rev() {
            let entry = self.stack[i];
            if self.is_temp_load(&entry) {
                self.pop()?;
                spilled.push((entry.ty, entry.local.unwrap_or_default()));
            } else {
                let slot = self.new_temp(entry.ty);
                self.store(entry.ty, slot)?;
                spilled.push((entry.ty, slot));
            }
        }
        for (ty, slot) in spilled.into_iter().rev() {
            self.load(ty, slot);
        }
        Ok(())
    }

    /// Record the continuation of the optimistic operation that just pushed
    /// its result
    pub fn record_continuation(&mut self, pp: ProgramPoint, result_type: Type) -> Result<()> {
        let below = self.stack.len().saturating_sub(1);
        let mut slots = Vec::with_capacity(below);
        for entry in &self.stack[..below] {
            match entry.local {
                Some(slot) => slots.push(slot),
                None => {
                    return Err(Error::internal(format!(
                        "pending stack value at {} in {} was not spilled",
                        pp, self.name
                    )))
                }
            }
        }
        let locals = self.next_temp.max(self.local_types.len() as u16) as usize;
        let mut local_types = self.local_types.clone();
        local_types.resize(locals, Type::Unknown);
        tracing::trace!(method = %self.name, %pp, reload = ?slots, "continuation");
        self.continuations
            .insert(pp, DeoptContinuation::new(local_types, slots, result_type))
    }

    /// Finish the method. Every referenced label must be defined and
    /// control must not fall off the end.
    pub fn finish(self) -> Result<(MethodCode, ContinuationTable)> {
        if self.reachable {
            return Err(Error::internal(format!("control falls off the end of {}", self.name)));
        }
        if let Some(state) = self.labels.iter().find(|s| s.referenced && !s.defined) {
            return Err(Error::internal(format!(
                "label {} in {} is never defined",
                state.name, self.name
            )));
        }
        let max_locals = self.next_temp.max(self.local_types.len() as u16);
        Ok((
            MethodCode {
                name: self.name,
                descriptor: self.descriptor,
                instructions: self.code,
                max_locals,
                max_stack: self.max_stack,
            },
            self.continuations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> MethodEmitter {
        MethodEmitter::new(0, "test", MethodDescriptor::new(vec![Type::Object, Type::Int], Some(Type::Int)))
    }

    #[test]
    fn test_parameters_occupy_first_slots() {
        let m = MethodEmitter::new(
            0,
            "m",
            MethodDescriptor::new(vec![Type::Object, Type::Number, Type::Int], None),
        );
        assert_eq!(m.local_type(0), Type::Object);
        assert_eq!(m.local_type(1), Type::Number);
        assert_eq!(m.local_type(3), Type::Int);
    }

    #[test]
    fn test_underflow() {
        let mut m = emitter();
        assert!(matches!(m.pop(), Err(Error::StackUnderflow(_))));
        m.load(Type::Int, 1);
        assert!(m.arith(ArithOp::Add, Type::Int, None).is_err());
    }

    #[test]
    fn test_join_mismatch() {
        let mut m = emitter();
        let join = m.new_label("join");
        m.push(LiteralValue::Int(1));
        m.load(Type::Int, 1);
        m.test(true, join).unwrap();
        m.push(LiteralValue::Number(1.5));
        let err = m.goto(join).unwrap_err();
        assert!(matches!(err, Error::JoinTypeMismatch { .. }));
    }

    #[test]
    fn test_unreachable_label_restores_stack() {
        let mut m = emitter();
        let other = m.new_label("other");
        let end = m.new_label("end");
        m.load(Type::Int, 1);
        m.test(false, other).unwrap();
        m.push(LiteralValue::Int(1));
        m.goto(end).unwrap();
        m.label(other).unwrap();
        assert!(m.stack().is_empty());
        m.push(LiteralValue::Int(2));
        m.label(end).unwrap();
        assert_eq!(m.stack_types(), vec![Type::Int]);
        m.ret(Type::Int).unwrap();
        let (code, _) = m.finish().unwrap();
        assert_eq!(code.max_stack, 1);
    }

    #[test]
    fn test_dead_label_stays_unreachable() {
        let mut m = emitter();
        let dead = m.new_label("dead");
        m.load(Type::Int, 1);
        m.ret(Type::Int).unwrap();
        m.label(dead).unwrap();
        assert!(!m.is_reachable());
        assert!(m.finish().is_ok());
    }

    #[test]
    fn test_store_stack_spills_non_temporaries() {
        let mut m = emitter();
        m.reserve_locals(2);
        m.load(Type::Object, 0);
        m.push(LiteralValue::Int(3));
        m.store_stack().unwrap();
        assert!(m.stack().iter().all(|e| e.local.map(|s| s >= 2).unwrap_or(false)));
        m.load(Type::Int, 1);
        m.push(LiteralValue::Int(1));
        m.arith(ArithOp::Add, Type::Int, Some(ProgramPoint(1))).unwrap();
        m.record_continuation(ProgramPoint(1), Type::Int).unwrap();
        m.pop().unwrap();
        m.pop().unwrap();
        m.pop().unwrap();
        m.push(LiteralValue::Int(0));
        m.ret(Type::Int).unwrap();
        let (_, continuations) = m.finish().unwrap();
        let c = continuations.get(ProgramPoint(1)).unwrap();
        assert_eq!(c.stack_slots(), vec![3, 2]);
        assert_eq!(c.local_types()[2], Type::Int);
        assert_eq!(c.local_types()[3], Type::Object);
    }

    #[test]
    fn test_store_invalidates_stale_loads() {
        let mut m = emitter();
        m.load(Type::Int, 1);
        m.push(LiteralValue::Int(5));
        m.store(Type::Int, 1).unwrap();
        assert_eq!(m.stack()[0].local, None);
    }

    #[test]
    fn test_finish_requires_terminated_method() {
        let m = emitter();
        assert!(m.finish().is_err());
    }

    #[test]
    fn test_foreign_label_rejected() {
        let mut a = emitter();
        let mut b = MethodEmitter::new(1, "other", MethodDescriptor::new(vec![], None));
        let foreign = b.new_label("x");
        assert!(!a.owns(foreign));
        assert!(a.goto(foreign).is_err());
    }
}
