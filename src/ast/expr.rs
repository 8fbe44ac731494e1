//! Expression node types

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::*;

/// An expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Primitive literal
    Literal(LiteralNode),

    /// Identifier reference
    Identifier(IdentNode),

    /// Unary operator -x, !x, typeof x
    Unary(Box<UnaryNode>),

    /// Binary operator a + b, a < b, a && b
    Binary(Box<BinaryNode>),

    /// Comma operator a, b, c
    Sequence(SequenceNode),

    /// Simple assignment target = value
    Assign(Box<AssignNode>),

    /// Conditional test ? a : b
    Ternary(Box<TernaryNode>),

    /// Call f(args) or construction new F(args)
    Call(Box<CallNode>),

    /// Named property access obj.prop
    Member(Box<AccessNode>),

    /// Computed property access obj[key]
    Index(Box<IndexNode>),

    /// Object literal {a: 1, b: 2}
    Object(ObjectNode),

    /// Array literal [1, 2, 3]
    Array(ArrayNode),

    /// Function expression
    Function(Box<FunctionNode>),

    /// Value computed for its side effects only
    Discard(Box<Expression>),

    /// Operand that flows into a control flow join and needs local
    /// conversions on the way
    JoinPredecessor(Box<JoinPredecessorNode>),
}

impl Expression {
    /// Type of the value left on the evaluation stack, or `None` when the
    /// expression leaves nothing
    pub fn result_type(&self) -> Option<Type> {
        Some(match self {
            Expression::Literal(lit) => lit.value.ty(),
            Expression::Identifier(id) => id.ty,
            Expression::Unary(u) => u.ty,
            Expression::Binary(b) => b.ty,
            Expression::Sequence(seq) => return seq.expressions.last().and_then(|e| e.result_type()),
            Expression::Assign(a) => a.value.ty(),
            Expression::Ternary(t) => t.ty,
            Expression::Call(c) => c.ty,
            Expression::Member(m) => m.ty,
            Expression::Index(i) => i.ty,
            Expression::Object(_) | Expression::Array(_) | Expression::Function(_) => Type::Object,
            Expression::Discard(_) => return None,
            Expression::JoinPredecessor(j) => return j.expression.result_type(),
        })
    }

    /// Attributed type, `Unknown` for expressions without a result
    pub fn ty(&self) -> Type {
        self.result_type().unwrap_or(Type::Unknown)
    }

    /// Get the span of this expression
    pub fn span(&self) -> Span {
        match self {
            Expression::Literal(lit) => lit.span,
            Expression::Identifier(id) => id.span,
            Expression::Unary(u) => u.span,
            Expression::Binary(b) => b.span,
            Expression::Sequence(seq) => seq.span,
            Expression::Assign(a) => a.span,
            Expression::Ternary(t) => t.span,
            Expression::Call(c) => c.span,
            Expression::Member(m) => m.span,
            Expression::Index(i) => i.span,
            Expression::Object(o) => o.span,
            Expression::Array(a) => a.span,
            Expression::Function(f) => f.span,
            Expression::Discard(e) => e.span(),
            Expression::JoinPredecessor(j) => j.expression.span(),
        }
    }

    /// The literal value, if this is a primitive literal
    pub fn as_literal(&self) -> Option<&LiteralValue> {
        match self {
            Expression::Literal(lit) => Some(&lit.value),
            _ => None,
        }
    }

    /// Strip join-predecessor wrappers
    pub fn unwrap_join(&self) -> &Expression {
        match self {
            Expression::JoinPredecessor(j) => j.expression.unwrap_join(),
            other => other,
        }
    }

    /// Wrap in a discard marker unless the expression leaves no value
    pub fn discarded(self) -> Expression {
        if self.result_type().is_none() {
            self
        } else {
            Expression::Discard(Box::new(self))
        }
    }
}

/// A literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralNode {
    pub value: LiteralValue,
    pub span: Span,
}

impl LiteralNode {
    pub fn new(value: LiteralValue, span: Span) -> Self {
        Self { value, span }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct IdentFlags: u8 {
        /// Compiler-generated temporary
        const INTERNAL = 1 << 0;
        /// Scope access outside any dynamic scope
        const FAST_SCOPE = 1 << 1;
        /// Names the callee of a call expression
        const FUNCTION = 1 << 2;
    }
}

/// An identifier reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentNode {
    pub name: String,
    /// Symbol in the current function; `None` for names resolved through
    /// the scope chain
    pub symbol: Option<SymbolId>,
    pub ty: Type,
    #[serde(default)]
    pub flags: IdentFlags,
    #[serde(default)]
    pub program_point: Option<ProgramPoint>,
    #[serde(default)]
    pub span: Span,
}

impl IdentNode {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            symbol: None,
            ty,
            flags: IdentFlags::empty(),
            program_point: None,
            span: Span::default(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(IdentFlags::INTERNAL)
    }

    pub fn is_fast_scope(&self) -> bool {
        self.flags.contains(IdentFlags::FAST_SCOPE)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    BitNot,
    TypeOf,
    Void,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::TypeOf => "typeof",
            UnaryOp::Void => "void",
        }
    }
}

/// A unary expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryNode {
    pub op: UnaryOp,
    pub operand: Expression,
    pub ty: Type,
    #[serde(default)]
    pub program_point: Option<ProgramPoint>,
    #[serde(default)]
    pub span: Span,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Sar,
    Shr,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Arithmetic that may overflow its speculative type
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::Shl
                | BinaryOp::Sar
                | BinaryOp::Shr
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::StrictEq
                | BinaryOp::StrictNe
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Sar => ">>",
            BinaryOp::Shr => ">>>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::StrictEq => "===",
            BinaryOp::StrictNe => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// A binary expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryNode {
    pub op: BinaryOp,
    pub lhs: Expression,
    pub rhs: Expression,
    pub ty: Type,
    #[serde(default)]
    pub program_point: Option<ProgramPoint>,
    #[serde(default)]
    pub span: Span,
}

/// Comma-separated expressions; all but the last are discarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceNode {
    pub expressions: Vec<Expression>,
    #[serde(default)]
    pub span: Span,
}

/// An assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignNode {
    pub target: Expression,
    pub value: Expression,
    #[serde(default)]
    pub span: Span,
}

/// A conditional expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TernaryNode {
    pub test: Expression,
    pub consequent: Expression,
    pub alternate: Expression,
    pub ty: Type,
    #[serde(default)]
    pub span: Span,
}

/// A call or `new` expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
    pub callee: Expression,
    pub args: Vec<Expression>,
    pub ty: Type,
    #[serde(default)]
    pub is_new: bool,
    /// Rewritten from `f.apply(this, arguments)`; invoke `f` directly
    #[serde(default)]
    pub apply_to_call: bool,
    #[serde(default)]
    pub program_point: Option<ProgramPoint>,
    #[serde(default)]
    pub span: Span,
}

/// A named property access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessNode {
    pub base: Expression,
    pub property: String,
    pub ty: Type,
    #[serde(default)]
    pub program_point: Option<ProgramPoint>,
    #[serde(default)]
    pub span: Span,
}

/// A computed property access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexNode {
    pub base: Expression,
    pub index: Expression,
    pub ty: Type,
    #[serde(default)]
    pub program_point: Option<ProgramPoint>,
    #[serde(default)]
    pub span: Span,
}

/// One `key: value` entry of an object literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyNode {
    pub key: String,
    pub value: Expression,
    #[serde(default)]
    pub span: Span,
}

/// An object literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectNode {
    pub properties: Vec<PropertyNode>,
    #[serde(default)]
    pub span: Span,
}

/// An array literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayNode {
    pub elements: Vec<Expression>,
    #[serde(default)]
    pub span: Span,
}

/// Local variable type change required where control flow merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConversion {
    pub symbol: SymbolId,
    pub from: Type,
    pub to: Type,
}

/// An expression whose evaluation ends at a join point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPredecessorNode {
    pub expression: Expression,
    pub conversions: Vec<LocalConversion>,
}

impl JoinPredecessorNode {
    /// Conversions that actually change a type
    pub fn live_conversions(&self) -> impl Iterator<Item = &LocalConversion> {
        self.conversions.iter().filter(|c| c.from != c.to)
    }
}
