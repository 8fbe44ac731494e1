//! Typed stack-machine instructions and the method emitter
//!
//! Code generation never encodes raw bytes. It records structured
//! [`Instruction`]s through a [`MethodEmitter`], which tracks the type of
//! every evaluation-stack entry, checks control flow joins and produces a
//! finished [`MethodCode`] per method.

mod emitter;
pub mod helpers;

pub use emitter::{MethodEmitter, StackEntry};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::ast::{FunctionId, LiteralValue, ProgramPoint, Type};
use crate::shape::{PropertyMap, StructureClass};

/// Parameter and return types of a method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub params: Vec<Type>,
    /// `None` for methods that return nothing
    pub returns: Option<Type>,
}

impl MethodDescriptor {
    pub fn new(params: Vec<Type>, returns: Option<Type>) -> Self {
        Self { params, returns }
    }

    /// Total local slots the parameters occupy
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(|t| t.slots()).sum()
    }

    /// Compact form such as `(OOI)D`
    pub fn mnemonic(&self) -> String {
        let mut out = String::from("(");
        for param in &self.params {
            out.push_str(param.mnemonic());
        }
        out.push(')');
        out.push_str(self.returns.map(|t| t.mnemonic()).unwrap_or("V"));
        out
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mnemonic())
    }
}

/// A callable method: owner class or compile unit, name and descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub owner: Cow<'static, str>,
    pub name: Cow<'static, str>,
    pub descriptor: MethodDescriptor,
}

impl MethodRef {
    pub fn new(
        owner: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        descriptor: MethodDescriptor,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor,
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// How a method is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvokeKind {
    Static,
    Virtual,
    Constructor,
}

/// A jump target. Labels belong to the method that created them; a jump
/// to another method's label is only possible through split-state dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    pub method: u32,
    pub index: u32,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.index)
    }
}

/// Arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Sar,
}

impl ArithOp {
    fn as_str(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Rem => "rem",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
            ArithOp::Shl => "shl",
            ArithOp::Sar => "sar",
        }
    }
}

/// Condition of a two-operand compare-and-jump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Condition {
    /// The condition that holds exactly when this one does not, for
    /// totally ordered operands
    pub fn inverse(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Le => Condition::Gt,
            Condition::Gt => Condition::Le,
            Condition::Ge => Condition::Lt,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Condition::Eq => "eq",
            Condition::Ne => "ne",
            Condition::Lt => "lt",
            Condition::Le => "le",
            Condition::Gt => "gt",
            Condition::Ge => "ge",
        }
    }
}

/// How a floating point compare treats an unordered (NaN) operand pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NanOrdering {
    /// Unordered compares as less than
    Less,
    /// Unordered compares as greater than
    Greater,
}

impl NanOrdering {
    /// Whether the compare-and-jump jumps for the given operands
    pub fn evaluate(self, condition: Condition, lhs: f64, rhs: f64) -> bool {
        let ord = match lhs.partial_cmp(&rhs) {
            Some(ord) => ord,
            None => match self {
                NanOrdering::Less => std::cmp::Ordering::Less,
                NanOrdering::Greater => std::cmp::Ordering::Greater,
            },
        };
        match condition {
            Condition::Eq => ord.is_eq(),
            Condition::Ne => ord.is_ne(),
            Condition::Lt => ord.is_lt(),
            Condition::Le => ord.is_le(),
            Condition::Gt => ord.is_gt(),
            Condition::Ge => ord.is_ge(),
        }
    }
}

bitflags! {
    /// Flags attached to a dynamic call site
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CallSiteFlags: u16 {
        /// Name is looked up through the scope chain
        const SCOPE = 1 << 0;
        /// Scope lookup that may skip dynamic scope checks
        const FAST_SCOPE = 1 << 1;
        const STRICT = 1 << 2;
        /// Result type is speculative; failure deoptimizes
        const OPTIMISTIC = 1 << 3;
        /// `apply` call rewritten into a direct call
        const APPLY_TO_CALL = 1 << 4;
    }
}

/// One emitted instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Label(Label),
    Push(LiteralValue),
    Load { ty: Type, slot: u16 },
    Store { ty: Type, slot: u16 },
    Pop,
    Dup,
    Swap,
    Convert { from: Type, to: Type },
    Arith { op: ArithOp, ty: Type, program_point: Option<ProgramPoint> },
    Neg { ty: Type, program_point: Option<ProgramPoint> },
    Goto(Label),
    /// Pop a boolean and jump when it equals `jump_if`
    Test { jump_if: bool, target: Label },
    /// Pop two operands of `ty` and jump when `condition` holds
    CompareJump {
        condition: Condition,
        ty: Type,
        nan: NanOrdering,
        target: Label,
    },
    /// Pop an int and jump to `targets[value - low]`, else to `default`
    TableSwitch {
        low: i32,
        targets: Vec<Label>,
        default: Label,
    },
    GetField { index: u32, ty: Type },
    PutField { index: u32, ty: Type },
    NewArray { length: u32 },
    ArrayStore,
    ArrayLoad,
    /// Pop the parent scope (and the arguments object when the shape has
    /// parameter properties) and push a new field-layout object
    NewStructure {
        class: Arc<StructureClass>,
        map: Arc<PropertyMap>,
    },
    /// Pop the spill array and indexed store, push a new spill-layout object
    NewObject { map: Arc<PropertyMap> },
    Invoke { kind: InvokeKind, method: MethodRef },
    DynamicGet {
        name: String,
        ty: Type,
        flags: CallSiteFlags,
        program_point: Option<ProgramPoint>,
    },
    DynamicSet { name: String, flags: CallSiteFlags },
    DynamicGetIndex {
        ty: Type,
        flags: CallSiteFlags,
        program_point: Option<ProgramPoint>,
    },
    DynamicSetIndex { flags: CallSiteFlags },
    DynamicCall {
        argc: u16,
        ty: Type,
        flags: CallSiteFlags,
        program_point: Option<ProgramPoint>,
    },
    DynamicNew { argc: u16, flags: CallSiteFlags },
    /// Pop the enclosing scope and push a closure over function `id`
    NewFunction { id: FunctionId },
    Return(Type),
    Throw,
    /// Exception handler covering `start..end`
    TryCatch { start: Label, end: Label, handler: Label },
}

fn pp_suffix(pp: &Option<ProgramPoint>) -> String {
    pp.map(|pp| format!(" [{}]", pp)).unwrap_or_default()
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            Label(label) => write!(f, "{}:", label),
            Push(value) => write!(f, "push {}", value),
            Load { ty, slot } => write!(f, "load {} {}", ty.mnemonic(), slot),
            Store { ty, slot } => write!(f, "store {} {}", ty.mnemonic(), slot),
            Pop => f.write_str("pop"),
            Dup => f.write_str("dup"),
            Swap => f.write_str("swap"),
            Convert { from, to } => write!(f, "convert {}2{}", from.mnemonic(), to.mnemonic()),
            Arith {
                op,
                ty,
                program_point,
            } => write!(f, "{} {}{}", op.as_str(), ty.mnemonic(), pp_suffix(program_point)),
            Neg { ty, program_point } => write!(f, "neg {}{}", ty.mnemonic(), pp_suffix(program_point)),
            Goto(target) => write!(f, "goto {}", target),
            Test { jump_if, target } => {
                write!(f, "{} {}", if *jump_if { "ifne" } else { "ifeq" }, target)
            }
            CompareJump {
                condition,
                ty,
                nan,
                target,
            } => {
                let nan = match (ty, nan) {
                    (Type::Number, NanOrdering::Less) => "l",
                    (Type::Number, NanOrdering::Greater) => "g",
                    _ => "",
                };
                write!(f, "if_{}cmp{}{} {}", ty.mnemonic(), nan, condition.as_str(), target)
            }
            TableSwitch {
                low,
                targets,
                default,
            } => {
                write!(f, "tableswitch {}", low)?;
                for target in targets {
                    write!(f, " {}", target)?;
                }
                write!(f, " default {}", default)
            }
            GetField { index, ty } => write!(f, "getfield {} {}", index, ty.mnemonic()),
            PutField { index, ty } => write!(f, "putfield {} {}", index, ty.mnemonic()),
            NewArray { length } => write!(f, "newarray {}", length),
            ArrayStore => f.write_str("aastore"),
            ArrayLoad => f.write_str("aaload"),
            NewStructure { class, map } => write!(f, "new {} {}", class.name, map),
            NewObject { map } => write!(f, "new spill {}", map),
            Invoke { kind, method } => {
                let kind = match kind {
                    InvokeKind::Static => "invokestatic",
                    InvokeKind::Virtual => "invokevirtual",
                    InvokeKind::Constructor => "invokespecial",
                };
                write!(f, "{} {}", kind, method)
            }
            DynamicGet {
                name,
                ty,
                flags,
                program_point,
            } => write!(
                f,
                "dyn_get {} {} {:?}{}",
                name,
                ty.mnemonic(),
                flags,
                pp_suffix(program_point)
            ),
            DynamicSet { name, flags } => write!(f, "dyn_set {} {:?}", name, flags),
            DynamicGetIndex {
                ty,
                flags,
                program_point,
            } => write!(f, "dyn_get_index {} {:?}{}", ty.mnemonic(), flags, pp_suffix(program_point)),
            DynamicSetIndex { flags } => write!(f, "dyn_set_index {:?}", flags),
            DynamicCall {
                argc,
                ty,
                flags,
                program_point,
            } => write!(
                f,
                "dyn_call {} {} {:?}{}",
                argc,
                ty.mnemonic(),
                flags,
                pp_suffix(program_point)
            ),
            DynamicNew { argc, flags } => write!(f, "dyn_new {} {:?}", argc, flags),
            NewFunction { id } => write!(f, "new_function {}", id),
            Return(ty) => write!(f, "return {}", ty.mnemonic()),
            Throw => f.write_str("throw"),
            TryCatch {
                start,
                end,
                handler,
            } => write!(f, "try {}..{} catch {}", start, end, handler),
        }
    }
}

/// A finished method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCode {
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub instructions: Vec<Instruction>,
    pub max_locals: u16,
    pub max_stack: u16,
}

impl MethodCode {
    /// Render the method as text, one instruction per line
    pub fn disassemble(&self) -> String {
        let mut output = format!(
            "== {}{} locals={} stack={} ==\n",
            self.name, self.descriptor, self.max_locals, self.max_stack
        );
        for (offset, instruction) in self.instructions.iter().enumerate() {
            match instruction {
                Instruction::Label(_) => output.push_str(&format!("      {}\n", instruction)),
                _ => output.push_str(&format!("{:04}    {}\n", offset, instruction)),
            }
        }
        output
    }

    /// Instructions that invoke `method` by name
    pub fn invokes(&self, name: &str) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Invoke { method, .. } if method.name == name))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_mnemonic() {
        let desc = MethodDescriptor::new(vec![Type::Object, Type::Object, Type::Int], Some(Type::Number));
        assert_eq!(desc.mnemonic(), "(OOI)D");
        assert_eq!(desc.param_slots(), 3);
        assert_eq!(MethodDescriptor::new(vec![], None).mnemonic(), "()V");
    }

    #[test]
    fn test_condition_inverse() {
        for cond in [
            Condition::Eq,
            Condition::Ne,
            Condition::Lt,
            Condition::Le,
            Condition::Gt,
            Condition::Ge,
        ] {
            assert_eq!(cond.inverse().inverse(), cond);
        }
        assert_eq!(Condition::Ge.inverse(), Condition::Lt);
    }

    #[test]
    fn test_nan_ordering() {
        assert!(NanOrdering::Less.evaluate(Condition::Lt, f64::NAN, 1.0));
        assert!(!NanOrdering::Greater.evaluate(Condition::Lt, f64::NAN, 1.0));
        assert!(NanOrdering::Greater.evaluate(Condition::Ne, 1.0, f64::NAN));
        assert!(NanOrdering::Less.evaluate(Condition::Ge, 2.0, 1.0));
    }

    #[test]
    fn test_instruction_display() {
        let label = Label { method: 0, index: 3 };
        assert_eq!(Instruction::Goto(label).to_string(), "goto L3");
        assert_eq!(
            Instruction::Arith {
                op: ArithOp::Add,
                ty: Type::Int,
                program_point: Some(ProgramPoint(4))
            }
            .to_string(),
            "add I [pp4]"
        );
        assert_eq!(Instruction::Push(LiteralValue::String("a".into())).to_string(), "push \"a\"");
    }
}
