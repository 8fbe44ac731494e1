//! Helpers for constructing trees programmatically
//!
//! Front ends and tests use these to assemble typed trees without spelling
//! out every node field.

use super::*;

pub fn lit(value: LiteralValue) -> Expression {
    Expression::Literal(LiteralNode::new(value, Span::default()))
}

pub fn int(n: i32) -> Expression {
    lit(LiteralValue::Int(n))
}

pub fn num(n: f64) -> Expression {
    lit(LiteralValue::Number(n))
}

pub fn string(s: &str) -> Expression {
    lit(LiteralValue::String(s.to_string()))
}

pub fn boolean(b: bool) -> Expression {
    lit(LiteralValue::Boolean(b))
}

pub fn undefined() -> Expression {
    lit(LiteralValue::Undefined)
}

/// Identifier resolved through the scope chain
pub fn global(name: &str) -> Expression {
    Expression::Identifier(IdentNode::new(name, Type::Object))
}

/// Identifier bound to a symbol of `function`; falls back to a scope
/// lookup when the name is not declared there
pub fn local(function: &FunctionNode, name: &str) -> Expression {
    Expression::Identifier(local_ident(function, name))
}

pub fn local_ident(function: &FunctionNode, name: &str) -> IdentNode {
    match function.symbols.lookup(name) {
        Some(id) => {
            let ty = function.symbols.get(id).map(|s| s.ty()).unwrap_or(Type::Object);
            let mut node = IdentNode::new(name, ty);
            node.symbol = Some(id);
            if function.symbols.get(id).map(|s| s.is_internal()).unwrap_or(false) {
                node.flags |= IdentFlags::INTERNAL;
            }
            node
        }
        None => IdentNode::new(name, Type::Object),
    }
}

pub fn this(function: &FunctionNode) -> Expression {
    local(function, "this")
}

pub fn unary(op: UnaryOp, operand: Expression, ty: Type) -> Expression {
    Expression::Unary(Box::new(UnaryNode {
        op,
        operand,
        ty,
        program_point: None,
        span: Span::default(),
    }))
}

/// Binary expression with the result type the operator usually attributes
pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Expression {
    let ty = if op.is_comparison() {
        Type::Boolean
    } else if op.is_logical() {
        if lhs.ty() == rhs.ty() {
            lhs.ty()
        } else {
            Type::Object
        }
    } else if op == BinaryOp::Shr {
        Type::Number
    } else if op.is_bitwise() {
        Type::Int
    } else if op == BinaryOp::Div {
        Type::Number
    } else {
        Type::widest(lhs.ty(), rhs.ty()).normalized()
    };
    binary_typed(op, lhs, rhs, ty)
}

pub fn binary_typed(op: BinaryOp, lhs: Expression, rhs: Expression, ty: Type) -> Expression {
    Expression::Binary(Box::new(BinaryNode {
        op,
        lhs,
        rhs,
        ty,
        program_point: None,
        span: Span::default(),
    }))
}

pub fn sequence(expressions: Vec<Expression>) -> Expression {
    Expression::Sequence(SequenceNode {
        expressions,
        span: Span::default(),
    })
}

pub fn assign(target: Expression, value: Expression) -> Expression {
    Expression::Assign(Box::new(AssignNode {
        target,
        value,
        span: Span::default(),
    }))
}

pub fn ternary(test: Expression, consequent: Expression, alternate: Expression, ty: Type) -> Expression {
    Expression::Ternary(Box::new(TernaryNode {
        test,
        consequent,
        alternate,
        ty,
        span: Span::default(),
    }))
}

pub fn call(callee: Expression, args: Vec<Expression>, ty: Type) -> Expression {
    Expression::Call(Box::new(CallNode {
        callee,
        args,
        ty,
        is_new: false,
        apply_to_call: false,
        program_point: None,
        span: Span::default(),
    }))
}

pub fn new(callee: Expression, args: Vec<Expression>) -> Expression {
    let mut expr = call(callee, args, Type::Object);
    if let Expression::Call(c) = &mut expr {
        c.is_new = true;
    }
    expr
}

pub fn member(base: Expression, property: &str, ty: Type) -> Expression {
    Expression::Member(Box::new(AccessNode {
        base,
        property: property.to_string(),
        ty,
        program_point: None,
        span: Span::default(),
    }))
}

pub fn index(base: Expression, index: Expression, ty: Type) -> Expression {
    Expression::Index(Box::new(IndexNode {
        base,
        index,
        ty,
        program_point: None,
        span: Span::default(),
    }))
}

pub fn object(properties: Vec<(&str, Expression)>) -> Expression {
    Expression::Object(ObjectNode {
        properties: properties
            .into_iter()
            .map(|(key, value)| PropertyNode {
                key: key.to_string(),
                value,
                span: Span::default(),
            })
            .collect(),
        span: Span::default(),
    })
}

pub fn array(elements: Vec<Expression>) -> Expression {
    Expression::Array(ArrayNode {
        elements,
        span: Span::default(),
    })
}

pub fn function_expr(function: FunctionNode) -> Expression {
    Expression::Function(Box::new(function))
}

pub fn join(expression: Expression, conversions: Vec<LocalConversion>) -> Expression {
    Expression::JoinPredecessor(Box::new(JoinPredecessorNode {
        expression,
        conversions,
    }))
}

pub fn expr_stmt(expression: Expression) -> Statement {
    Statement::Expression(ExpressionStatement {
        expression,
        span: Span::default(),
    })
}

/// Declare a function-level variable and return its declaration statement
pub fn var(function: &mut FunctionNode, name: &str, ty: Type, init: Option<Expression>) -> Statement {
    let id = function.declare(Symbol::new(name, SymbolKind::Variable, ty));
    let mut ident = IdentNode::new(name, ty);
    ident.symbol = Some(id);
    Statement::Var(VarNode {
        name: ident,
        init,
        span: Span::default(),
    })
}

pub fn block(statements: Vec<Statement>) -> Block {
    Block::new(statements)
}

pub fn if_stmt(test: Expression, pass: Block, fail: Option<Block>) -> Statement {
    Statement::If(Box::new(IfNode {
        test,
        pass,
        fail,
        span: Span::default(),
    }))
}

pub fn while_stmt(test: Expression, body: Block) -> Statement {
    Statement::While(Box::new(WhileNode {
        label: None,
        test,
        body,
        is_do_while: false,
        span: Span::default(),
    }))
}

pub fn for_stmt(
    init: Option<Expression>,
    test: Option<Expression>,
    modify: Option<Expression>,
    body: Block,
) -> Statement {
    Statement::For(Box::new(ForNode {
        label: None,
        init,
        test,
        modify,
        body,
        span: Span::default(),
    }))
}

pub fn return_stmt(expression: Option<Expression>) -> Statement {
    Statement::Return(ReturnNode {
        expression,
        span: Span::default(),
    })
}

pub fn break_stmt() -> Statement {
    Statement::Break(JumpNode {
        label: None,
        span: Span::default(),
    })
}

pub fn continue_stmt() -> Statement {
    Statement::Continue(JumpNode {
        label: None,
        span: Span::default(),
    })
}

pub fn throw_stmt(expression: Expression) -> Statement {
    Statement::Throw(ThrowNode {
        expression,
        span: Span::default(),
    })
}

pub fn with_stmt(expression: Expression, body: Block) -> Statement {
    Statement::With(Box::new(WithNode {
        expression,
        body,
        span: Span::default(),
    }))
}
