//! Estimated code weight of tree fragments

use crate::ast::{BinaryOp, Block, Expression, FunctionNode, Statement};

pub const FUNCTION_WEIGHT: u64 = 40;
pub const AASTORE_WEIGHT: u64 = 2;
pub const ACCESS_WEIGHT: u64 = 4;
pub const ADD_WEIGHT: u64 = 10;
pub const BREAK_WEIGHT: u64 = 1;
pub const CALL_WEIGHT: u64 = 10;
pub const CATCH_WEIGHT: u64 = 10;
pub const COMPARE_WEIGHT: u64 = 6;
pub const CONST_WEIGHT: u64 = 2;
pub const FUNC_EXPR_WEIGHT: u64 = 20;
pub const IF_WEIGHT: u64 = 2;
pub const LITERAL_WEIGHT: u64 = 10;
pub const LOOP_WEIGHT: u64 = 4;
pub const NEW_WEIGHT: u64 = 6;
pub const OBJECT_WEIGHT: u64 = 16;
pub const RETURN_WEIGHT: u64 = 2;
pub const SETPROP_WEIGHT: u64 = 5;
pub const SPLIT_WEIGHT: u64 = 40;
pub const THROW_WEIGHT: u64 = 2;
pub const VAR_WEIGHT: u64 = 40;
pub const WITH_WEIGHT: u64 = 8;

/// Sums per-node weights. A split fragment counts as one call; its body
/// is charged to the fragment's own unit.
pub struct Weigher;

impl Weigher {
    pub fn function(function: &FunctionNode) -> u64 {
        FUNCTION_WEIGHT + Self::block(&function.body)
    }

    pub fn block(block: &Block) -> u64 {
        block.statements.iter().map(Self::statement).sum()
    }

    pub fn statement(stmt: &Statement) -> u64 {
        match stmt {
            Statement::Block(b) => Self::block(b),
            Statement::Var(v) => VAR_WEIGHT + v.init.as_ref().map_or(0, Self::expression),
            Statement::Expression(e) => Self::expression(&e.expression),
            Statement::If(i) => {
                IF_WEIGHT
                    + Self::expression(&i.test)
                    + Self::block(&i.pass)
                    + i.fail.as_ref().map_or(0, Self::block)
            }
            Statement::While(w) => LOOP_WEIGHT + Self::expression(&w.test) + Self::block(&w.body),
            Statement::For(f) => {
                LOOP_WEIGHT
                    + [&f.init, &f.test, &f.modify]
                        .into_iter()
                        .flatten()
                        .map(Self::expression)
                        .sum::<u64>()
                    + Self::block(&f.body)
            }
            Statement::Return(r) => RETURN_WEIGHT + r.expression.as_ref().map_or(0, Self::expression),
            Statement::Break(_) | Statement::Continue(_) => BREAK_WEIGHT,
            Statement::Throw(t) => THROW_WEIGHT + Self::expression(&t.expression),
            Statement::Try(t) => {
                Self::block(&t.body) + t.catch.as_ref().map_or(0, |c| CATCH_WEIGHT + Self::block(&c.body))
            }
            Statement::With(w) => WITH_WEIGHT + Self::expression(&w.expression) + Self::block(&w.body),
            Statement::Split(_) => SPLIT_WEIGHT,
            Statement::Empty(_) => 0,
        }
    }

    pub fn expression(expr: &Expression) -> u64 {
        match expr {
            Expression::Literal(_) => CONST_WEIGHT,
            Expression::Identifier(_) => ACCESS_WEIGHT,
            Expression::Unary(u) => ADD_WEIGHT + Self::expression(&u.operand),
            Expression::Binary(b) => {
                let own = match b.op {
                    op if op.is_comparison() => COMPARE_WEIGHT,
                    BinaryOp::And | BinaryOp::Or => COMPARE_WEIGHT,
                    _ => ADD_WEIGHT,
                };
                own + Self::expression(&b.lhs) + Self::expression(&b.rhs)
            }
            Expression::Sequence(s) => s.expressions.iter().map(Self::expression).sum(),
            Expression::Assign(a) => {
                let store = match a.target {
                    Expression::Member(_) | Expression::Index(_) => SETPROP_WEIGHT,
                    _ => ACCESS_WEIGHT,
                };
                store + Self::target(&a.target) + Self::expression(&a.value)
            }
            Expression::Ternary(t) => {
                IF_WEIGHT
                    + Self::expression(&t.test)
                    + Self::expression(&t.consequent)
                    + Self::expression(&t.alternate)
            }
            Expression::Call(c) => {
                let own = if c.is_new { NEW_WEIGHT } else { CALL_WEIGHT };
                own + Self::expression(&c.callee) + c.args.iter().map(Self::expression).sum::<u64>()
            }
            Expression::Member(m) => ACCESS_WEIGHT + Self::expression(&m.base),
            Expression::Index(i) => ACCESS_WEIGHT + Self::expression(&i.base) + Self::expression(&i.index),
            Expression::Object(o) => {
                OBJECT_WEIGHT
                    + o.properties
                        .iter()
                        .map(|p| match p.value.as_literal() {
                            Some(_) => CONST_WEIGHT,
                            None => SETPROP_WEIGHT + Self::expression(&p.value),
                        })
                        .sum::<u64>()
            }
            Expression::Array(a) => {
                LITERAL_WEIGHT + a.elements.iter().map(|e| AASTORE_WEIGHT + Self::expression(e)).sum::<u64>()
            }
            Expression::Function(_) => FUNC_EXPR_WEIGHT,
            Expression::Discard(e) => Self::expression(e),
            Expression::JoinPredecessor(j) => Self::expression(&j.expression),
        }
    }

    /// Subexpressions of an assignment target that are evaluated
    fn target(target: &Expression) -> u64 {
        match target {
            Expression::Member(m) => Self::expression(&m.base),
            Expression::Index(i) => Self::expression(&i.base) + Self::expression(&i.index),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{build, FunctionFlags, FunctionId, Type};

    #[test]
    fn test_expression_weights() {
        let sum = build::binary(BinaryOp::Add, build::int(1), build::global("x"));
        assert_eq!(Weigher::expression(&sum), ADD_WEIGHT + CONST_WEIGHT + ACCESS_WEIGHT);

        let call = build::call(build::global("f"), vec![build::int(1)], Type::Object);
        assert_eq!(Weigher::expression(&call), CALL_WEIGHT + ACCESS_WEIGHT + CONST_WEIGHT);

        let store = build::assign(build::member(build::global("o"), "p", Type::Object), build::int(1));
        assert_eq!(Weigher::expression(&store), SETPROP_WEIGHT + ACCESS_WEIGHT + CONST_WEIGHT);
    }

    #[test]
    fn test_function_weight_includes_body() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::empty());
        let decl = build::var(&mut f, "x", Type::Int, Some(build::int(1)));
        f.body.statements = vec![decl, build::return_stmt(None)];
        assert_eq!(
            Weigher::function(&f),
            FUNCTION_WEIGHT + VAR_WEIGHT + CONST_WEIGHT + RETURN_WEIGHT
        );
    }
}
