//! Statement node types

use serde::{Deserialize, Serialize};

use super::*;

/// A statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Block statement { ... }
    Block(Block),

    /// Variable declaration var x = 1
    Var(VarNode),

    /// Expression statement
    Expression(ExpressionStatement),

    /// if statement
    If(Box<IfNode>),

    /// while and do-while loops
    While(Box<WhileNode>),

    /// for loop
    For(Box<ForNode>),

    /// return statement
    Return(ReturnNode),

    /// break statement
    Break(JumpNode),

    /// continue statement
    Continue(JumpNode),

    /// throw statement
    Throw(ThrowNode),

    /// try/catch statement
    Try(Box<TryNode>),

    /// with statement
    With(Box<WithNode>),

    /// Fragment of a split function, compiled as its own method
    Split(Box<SplitNode>),

    /// Empty statement
    Empty(Span),
}

impl Statement {
    /// Get the span of this statement
    pub fn span(&self) -> Span {
        match self {
            Statement::Block(b) => b.span,
            Statement::Var(v) => v.span,
            Statement::Expression(e) => e.span,
            Statement::If(i) => i.span,
            Statement::While(w) => w.span,
            Statement::For(f) => f.span,
            Statement::Return(r) => r.span,
            Statement::Break(j) | Statement::Continue(j) => j.span,
            Statement::Throw(t) => t.span,
            Statement::Try(t) => t.span,
            Statement::With(w) => w.span,
            Statement::Split(s) => s.span,
            Statement::Empty(span) => *span,
        }
    }

    /// Blocks directly nested in this statement
    pub fn child_blocks(&self) -> Vec<&Block> {
        match self {
            Statement::Block(b) => vec![b],
            Statement::If(i) => std::iter::once(&i.pass).chain(i.fail.as_ref()).collect(),
            Statement::While(w) => vec![&w.body],
            Statement::For(f) => vec![&f.body],
            Statement::Try(t) => std::iter::once(&t.body)
                .chain(t.catch.as_ref().map(|c| &c.body))
                .collect(),
            Statement::With(w) => vec![&w.body],
            Statement::Split(s) => vec![&s.body],
            _ => Vec::new(),
        }
    }

    /// Control never falls through to the next statement
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Statement::Return(_) | Statement::Throw(_) | Statement::Break(_) | Statement::Continue(_)
        )
    }
}

/// A block with the symbols it declares
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub statements: Vec<Statement>,
    /// Symbols declared here, in slot order
    #[serde(default)]
    pub symbols: Vec<SymbolId>,
    /// Block materializes its own scope object
    #[serde(default)]
    pub needs_scope: bool,
    #[serde(default)]
    pub span: Span,
}

impl Block {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            statements,
            symbols: Vec::new(),
            needs_scope: false,
            span: Span::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// A variable declaration; hoisted symbols are declared in the function's
/// body block, the node only carries the initializer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarNode {
    pub name: IdentNode,
    pub init: Option<Expression>,
    #[serde(default)]
    pub span: Span,
}

/// An expression statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionStatement {
    pub expression: Expression,
    #[serde(default)]
    pub span: Span,
}

/// An if statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfNode {
    pub test: Expression,
    pub pass: Block,
    pub fail: Option<Block>,
    #[serde(default)]
    pub span: Span,
}

/// A while or do-while loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhileNode {
    pub label: Option<String>,
    pub test: Expression,
    pub body: Block,
    #[serde(default)]
    pub is_do_while: bool,
    #[serde(default)]
    pub span: Span,
}

/// A for loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForNode {
    pub label: Option<String>,
    pub init: Option<Expression>,
    pub test: Option<Expression>,
    pub modify: Option<Expression>,
    pub body: Block,
    #[serde(default)]
    pub span: Span,
}

/// A return statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnNode {
    pub expression: Option<Expression>,
    #[serde(default)]
    pub span: Span,
}

/// A break or continue, optionally labelled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpNode {
    pub label: Option<String>,
    #[serde(default)]
    pub span: Span,
}

/// A throw statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowNode {
    pub expression: Expression,
    #[serde(default)]
    pub span: Span,
}

/// A try/catch statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryNode {
    pub body: Block,
    pub catch: Option<CatchNode>,
    /// Quick slot holding the caught exception, assigned at finalization
    #[serde(default)]
    pub exception_slot: Option<u16>,
    #[serde(default)]
    pub span: Span,
}

/// A catch clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchNode {
    /// Exception binding, declared in `body`
    pub param: IdentNode,
    pub body: Block,
}

/// A with statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithNode {
    pub expression: Expression,
    pub body: Block,
    #[serde(default)]
    pub span: Span,
}

/// A run of statements split out of an oversized function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitNode {
    /// Method name of the fragment
    pub name: String,
    /// Compile unit the fragment is emitted into
    pub unit: String,
    pub weight: u64,
    pub body: Block,
    #[serde(default)]
    pub span: Span,
}
