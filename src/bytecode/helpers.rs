//! Runtime helper methods invoked by generated code

use super::{MethodDescriptor, MethodRef};
use crate::ast::{BinaryOp, Type};

const RUNTIME: &str = "ScriptRuntime";
const SCOPE: &str = "Scope";

fn helper(owner: &'static str, name: &'static str, params: &[Type], returns: Option<Type>) -> MethodRef {
    MethodRef::new(owner, name, MethodDescriptor::new(params.to_vec(), returns))
}

/// `(scope, state)`: record the pending split dispatch
pub fn set_split_state() -> MethodRef {
    helper(SCOPE, "setSplitState", &[Type::Object, Type::Int], None)
}

/// `(scope) -> state`
pub fn get_split_state() -> MethodRef {
    helper(SCOPE, "getSplitState", &[Type::Object], Some(Type::Int))
}

/// `(callee) -> scope` of the closure being executed
pub fn callee_scope() -> MethodRef {
    helper(RUNTIME, "getCalleeScope", &[Type::Object], Some(Type::Object))
}

/// `(scope) -> parent scope`
pub fn parent_scope() -> MethodRef {
    helper(SCOPE, "getParentScope", &[Type::Object], Some(Type::Object))
}

/// `(scope, object) -> with scope`
pub fn with_scope() -> MethodRef {
    helper(RUNTIME, "openWith", &[Type::Object, Type::Object], Some(Type::Object))
}

/// `(callee, varargs) -> arguments object`
pub fn allocate_arguments() -> MethodRef {
    helper(RUNTIME, "allocateArguments", &[Type::Object, Type::Object], Some(Type::Object))
}

/// `(index/value pairs) -> indexed store`
pub fn allocate_array_data() -> MethodRef {
    helper(RUNTIME, "allocateArrayData", &[Type::Object], Some(Type::Object))
}

/// `(elements) -> array object`
pub fn allocate_array() -> MethodRef {
    helper(RUNTIME, "allocateArray", &[Type::Object], Some(Type::Object))
}

/// `(array, index) -> element`
pub fn array_get() -> MethodRef {
    helper(RUNTIME, "arrayGet", &[Type::Object, Type::Int], Some(Type::Object))
}

/// Generic `+` with string concatenation
pub fn add() -> MethodRef {
    helper(RUNTIME, "ADD", &[Type::Object, Type::Object], Some(Type::Object))
}

pub fn type_of() -> MethodRef {
    helper(RUNTIME, "TYPEOF", &[Type::Object], Some(Type::Object))
}

/// Unsigned shift right; the result may exceed the int32 range
pub fn shr() -> MethodRef {
    helper(RUNTIME, "SHR", &[Type::Int, Type::Int], Some(Type::Number))
}

/// Language-level comparison of two objects, producing a boolean.
/// Returns `None` for operators that are not comparisons.
pub fn compare(op: BinaryOp) -> Option<MethodRef> {
    let name = match op {
        BinaryOp::Eq => "EQ",
        BinaryOp::Ne => "NE",
        BinaryOp::StrictEq => "EQ_STRICT",
        BinaryOp::StrictNe => "NE_STRICT",
        BinaryOp::Lt => "LT",
        BinaryOp::Le => "LE",
        BinaryOp::Gt => "GT",
        BinaryOp::Ge => "GE",
        _ => return None,
    };
    Some(helper(RUNTIME, name, &[Type::Object, Type::Object], Some(Type::Boolean)))
}
