//! The type lattice shared by every pass

use serde::{Deserialize, Serialize};
use std::fmt;

/// Static type of a symbol, expression, or evaluation-stack entry.
///
/// Variants are declared narrowest first, so the derived ordering is the
/// widening order of the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Type {
    /// Not yet inferred
    #[default]
    Unknown,
    Boolean,
    Int,
    Long,
    Number,
    Object,
}

impl Type {
    /// The wider of two types
    pub fn widest(a: Type, b: Type) -> Type {
        a.max(b)
    }

    /// Storage width in local slots
    pub fn slots(self) -> u16 {
        match self {
            Type::Long | Type::Number => 2,
            _ => 1,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Long | Type::Number)
    }

    pub fn is_primitive(self) -> bool {
        matches!(self, Type::Boolean | Type::Int | Type::Long | Type::Number)
    }

    pub fn is_object(self) -> bool {
        self == Type::Object
    }

    /// The type a value of this type has once it is materialized on the
    /// evaluation stack. Unknown values travel as objects.
    pub fn normalized(self) -> Type {
        match self {
            Type::Unknown => Type::Object,
            other => other,
        }
    }

    /// Generalize for use in a linkable signature: reference types collapse
    /// to the generic object type, primitives stay as they are.
    pub fn generic(self) -> Type {
        if self.is_primitive() {
            self
        } else {
            Type::Object
        }
    }

    /// Whether two stack entries may meet at a control flow join
    pub fn is_equivalent_to(self, other: Type) -> bool {
        self.normalized() == other.normalized()
    }

    /// Short mnemonic used in disassembly and descriptors
    pub fn mnemonic(self) -> &'static str {
        match self {
            Type::Unknown => "?",
            Type::Boolean => "Z",
            Type::Int => "I",
            Type::Long => "J",
            Type::Number => "D",
            Type::Object => "O",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Unknown => "unknown",
            Type::Boolean => "boolean",
            Type::Int => "int",
            Type::Long => "long",
            Type::Number => "double",
            Type::Object => "object",
        };
        f.write_str(name)
    }
}
