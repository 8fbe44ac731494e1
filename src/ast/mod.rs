//! Typed, symbol-resolved syntax tree consumed by the backend
//!
//! The front end hands over one [`FunctionNode`] per script. Every node
//! already carries its attributed [`Type`]; identifiers point into the
//! owning function's [`SymbolTable`]. Passes revise the tree and key every
//! cross-pass table by [`FunctionId`], never by node identity.

pub mod build;
mod expr;
mod literal;
mod stmt;
mod symbol;
mod types;

pub use expr::*;
pub use literal::*;
pub use stmt::*;
pub use symbol::*;
pub use types::Type;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SourceLocation;

/// Declared parameter count above which a function switches to the
/// variable-arity calling convention
pub const MAX_PARAM_COUNT: usize = 250;

/// A span in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    /// Start location
    pub start: SourceLocation,
    /// End location
    pub end: SourceLocation,
}

impl Span {
    /// Create a new span
    pub fn new(start: SourceLocation, end: SourceLocation) -> Self {
        Self { start, end }
    }

    /// Merge two spans into one covering both
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: if self.start.offset < other.start.offset {
                self.start
            } else {
                other.start
            },
            end: if self.end.offset > other.end.offset {
                self.end
            } else {
                other.end
            },
        }
    }
}

/// Stable per-function id that survives tree revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Per-function id of a node that carries an optimistic type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramPoint(pub u32);

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pp{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FunctionFlags: u32 {
        /// Top-level script body
        const IS_PROGRAM = 1 << 0;
        const IS_STRICT = 1 << 1;
        /// Contains a direct eval
        const HAS_EVAL = 1 << 2;
        /// Reads its rest-arguments object
        const USES_ARGUMENTS = 1 << 3;
        /// Refers to itself by name
        const NEEDS_CALLEE = 1 << 4;
        /// Reads bindings of an enclosing scope
        const NEEDS_PARENT_SCOPE = 1 << 5;
        /// Every variable must live in the scope object
        const ALL_VARS_IN_SCOPE = 1 << 6;
        /// Body was partitioned into split fragments
        const IS_SPLIT = 1 << 7;
        /// Apply-to-call rewrite already ran
        const HAS_APPLY_TO_CALL_SPECIALIZATION = 1 << 8;
        /// Declared inside a with block or a non-strict eval function
        const IN_DYNAMIC_SCOPE = 1 << 9;
    }
}

/// A function (or the script body) with its own symbol table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub id: FunctionId,
    pub name: String,
    pub params: Vec<IdentNode>,
    pub body: Block,
    pub symbols: SymbolTable,
    pub reserved: ReservedSymbols,
    pub flags: FunctionFlags,
    pub return_type: Type,
    /// Number of local slots, known after finalization
    #[serde(default)]
    pub slot_count: u16,
    pub span: Span,
}

impl FunctionNode {
    /// Create a function with its reserved symbols laid out in the body
    /// block: callee, this, varargs, parameters, scope, return, arguments.
    pub fn new(id: FunctionId, name: impl Into<String>, params: &[(&str, Type)], flags: FunctionFlags) -> Self {
        let mut symbols = SymbolTable::new();
        let mut order = Vec::new();

        let callee = symbols.add(Symbol::new(":callee", SymbolKind::Internal, Type::Object));
        let this = symbols.add(Symbol::new("this", SymbolKind::Internal, Type::Object));
        order.extend([callee, this]);

        let vararg = flags.contains(FunctionFlags::USES_ARGUMENTS) || params.len() > MAX_PARAM_COUNT;
        let varargs = vararg.then(|| {
            let id = symbols.add(Symbol::new(":varargs", SymbolKind::Internal, Type::Object));
            order.push(id);
            id
        });

        let mut param_nodes = Vec::with_capacity(params.len());
        for (param, ty) in params {
            let id = symbols.add(Symbol::new(*param, SymbolKind::Parameter, *ty));
            order.push(id);
            let mut node = IdentNode::new(*param, *ty);
            node.symbol = Some(id);
            param_nodes.push(node);
        }

        let scope = symbols.add(Symbol::new(":scope", SymbolKind::Internal, Type::Object));
        let ret = symbols.add(Symbol::new(":return", SymbolKind::Internal, Type::Object));
        order.extend([scope, ret]);

        let arguments = flags.contains(FunctionFlags::USES_ARGUMENTS).then(|| {
            let id = symbols.add(Symbol::new("arguments", SymbolKind::Variable, Type::Object));
            order.push(id);
            id
        });

        let mut body = Block::new(Vec::new());
        body.symbols = order;

        Self {
            id,
            name: name.into(),
            params: param_nodes,
            body,
            symbols,
            reserved: ReservedSymbols {
                callee,
                this,
                scope,
                ret,
                varargs,
                arguments,
            },
            flags,
            return_type: Type::Unknown,
            slot_count: 0,
            span: Span::default(),
        }
    }

    /// Declare a function-level symbol in the body block
    pub fn declare(&mut self, symbol: Symbol) -> SymbolId {
        let id = self.symbols.add(symbol);
        self.body.symbols.push(id);
        id
    }

    pub fn is_strict(&self) -> bool {
        self.flags.contains(FunctionFlags::IS_STRICT)
    }

    pub fn is_program(&self) -> bool {
        self.flags.contains(FunctionFlags::IS_PROGRAM)
    }

    pub fn has_eval(&self) -> bool {
        self.flags.contains(FunctionFlags::HAS_EVAL)
    }

    pub fn is_split(&self) -> bool {
        self.flags.contains(FunctionFlags::IS_SPLIT)
    }

    pub fn uses_arguments(&self) -> bool {
        self.flags.contains(FunctionFlags::USES_ARGUMENTS)
    }

    pub fn all_vars_in_scope(&self) -> bool {
        self.flags.contains(FunctionFlags::ALL_VARS_IN_SCOPE)
    }

    pub fn needs_parent_scope(&self) -> bool {
        self.flags.contains(FunctionFlags::NEEDS_PARENT_SCOPE)
    }

    /// Whether the function introduces a dynamic scope boundary of its own
    pub fn has_dynamic_scope(&self) -> bool {
        self.has_eval() && !self.is_strict()
    }

    /// Variable-arity calling convention: a single array of arguments
    pub fn is_vararg(&self) -> bool {
        self.uses_arguments() || self.params.len() > MAX_PARAM_COUNT
    }

    /// Whether the compiled code needs the callee reference
    pub fn needs_callee(&self) -> bool {
        self.flags.intersects(
            FunctionFlags::NEEDS_CALLEE | FunctionFlags::NEEDS_PARENT_SCOPE | FunctionFlags::IS_SPLIT,
        ) || (self.uses_arguments() && !self.is_strict())
    }

    /// Parameters are aliased by the arguments object
    pub fn has_arguments_view(&self) -> bool {
        self.uses_arguments() && !self.is_strict()
    }

    /// Whether any block of this function (nested functions excluded)
    /// needs a backing scope object
    pub fn has_scope_block(&self) -> bool {
        fn visit(block: &Block) -> bool {
            block.needs_scope || block.statements.iter().any(|s| s.child_blocks().into_iter().any(visit))
        }
        visit(&self.body)
    }

    /// Parameter symbols in declaration order
    pub fn param_symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.params.iter().filter_map(|p| p.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_symbol_order() {
        let f = FunctionNode::new(
            FunctionId(1),
            "f",
            &[("a", Type::Int), ("b", Type::Object)],
            FunctionFlags::USES_ARGUMENTS,
        );
        let names: Vec<&str> = f
            .body
            .symbols
            .iter()
            .map(|id| f.symbols.get(*id).unwrap().name())
            .collect();
        assert_eq!(
            names,
            vec![":callee", "this", ":varargs", "a", "b", ":scope", ":return", "arguments"]
        );
        assert!(f.is_vararg());
        assert!(f.needs_callee());
    }

    #[test]
    fn test_plain_function_has_no_varargs() {
        let f = FunctionNode::new(FunctionId(2), "g", &[("x", Type::Int)], FunctionFlags::empty());
        assert!(f.reserved.varargs.is_none());
        assert!(f.reserved.arguments.is_none());
        assert!(!f.needs_callee());
        assert!(!f.has_scope_block());
    }
}
