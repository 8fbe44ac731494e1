//! Program point assignment
//!
//! Every node that may carry a speculatively narrow type gets a dense,
//! per-function id in post-order. The code generator records a
//! deoptimization continuation under the same id.

use tracing::trace;

use crate::ast::*;
use crate::error::{Error, Result};

/// Id of the first program point of every function
pub const FIRST_PROGRAM_POINT: u32 = 1;

/// Numbers the optimistic-capable nodes of one function
pub struct ProgramPointAssigner {
    function: FunctionId,
    // wide enough to step past u32::MAX
    next: u64,
    max: u32,
}

impl ProgramPointAssigner {
    /// Assign program points to `function`, failing if more than `max`
    /// ids would be needed. Returns the number of ids handed out.
    pub fn assign(function: &mut FunctionNode, max: u32) -> Result<u32> {
        let mut assigner = ProgramPointAssigner {
            function: function.id,
            next: u64::from(FIRST_PROGRAM_POINT),
            max,
        };
        assigner.block(&mut function.body)?;
        let count = u32::try_from(assigner.next - u64::from(FIRST_PROGRAM_POINT))
            .map_err(|_| Error::internal("program point count exceeds u32"))?;
        trace!(function = %function.id, count, "program points assigned");
        Ok(count)
    }

    fn next_point(&mut self) -> Result<ProgramPoint> {
        let id = match u32::try_from(self.next) {
            Ok(id) if id <= self.max => id,
            _ => {
                return Err(Error::ProgramPointOverflow {
                    function: self.function,
                    limit: self.max,
                })
            }
        };
        self.next += 1;
        Ok(ProgramPoint(id))
    }

    fn block(&mut self, block: &mut Block) -> Result<()> {
        block.statements.iter_mut().try_for_each(|s| self.statement(s))
    }

    fn statement(&mut self, stmt: &mut Statement) -> Result<()> {
        match stmt {
            Statement::Block(b) => self.block(b),
            Statement::Var(var) => self.optional(&mut var.init),
            Statement::Expression(e) => self.expression(&mut e.expression),
            Statement::If(node) => {
                self.expression(&mut node.test)?;
                self.block(&mut node.pass)?;
                match &mut node.fail {
                    Some(fail) => self.block(fail),
                    None => Ok(()),
                }
            }
            Statement::While(node) if node.is_do_while => {
                self.block(&mut node.body)?;
                self.expression(&mut node.test)
            }
            Statement::While(node) => {
                self.expression(&mut node.test)?;
                self.block(&mut node.body)
            }
            Statement::For(node) => {
                self.optional(&mut node.init)?;
                self.optional(&mut node.test)?;
                self.block(&mut node.body)?;
                self.optional(&mut node.modify)
            }
            Statement::Return(node) => self.optional(&mut node.expression),
            Statement::Throw(node) => self.expression(&mut node.expression),
            Statement::Try(node) => {
                self.block(&mut node.body)?;
                match &mut node.catch {
                    Some(catch) => self.block(&mut catch.body),
                    None => Ok(()),
                }
            }
            Statement::With(node) => {
                self.expression(&mut node.expression)?;
                self.block(&mut node.body)
            }
            Statement::Split(node) => self.block(&mut node.body),
            Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => Ok(()),
        }
    }

    fn optional(&mut self, expr: &mut Option<Expression>) -> Result<()> {
        match expr {
            Some(e) => self.expression(e),
            None => Ok(()),
        }
    }

    fn expression(&mut self, expr: &mut Expression) -> Result<()> {
        match expr {
            Expression::Literal(_) | Expression::Function(_) => Ok(()),
            Expression::Identifier(ident) => {
                if !ident.is_internal() {
                    ident.program_point = Some(self.next_point()?);
                }
                Ok(())
            }
            Expression::Unary(node) => {
                self.expression(&mut node.operand)?;
                if matches!(node.op, UnaryOp::Plus | UnaryOp::Minus) {
                    node.program_point = Some(self.next_point()?);
                }
                Ok(())
            }
            Expression::Binary(node) => {
                self.expression(&mut node.lhs)?;
                self.expression(&mut node.rhs)?;
                if node.op.is_arithmetic() {
                    node.program_point = Some(self.next_point()?);
                }
                Ok(())
            }
            Expression::Sequence(node) => node.expressions.iter_mut().try_for_each(|e| self.expression(e)),
            Expression::Assign(node) => {
                self.target(&mut node.target)?;
                self.expression(&mut node.value)
            }
            Expression::Ternary(node) => {
                self.expression(&mut node.test)?;
                self.expression(&mut node.consequent)?;
                self.expression(&mut node.alternate)
            }
            Expression::Call(node) => {
                self.expression(&mut node.callee)?;
                for arg in &mut node.args {
                    self.expression(arg)?;
                }
                if !node.is_new {
                    node.program_point = Some(self.next_point()?);
                }
                Ok(())
            }
            Expression::Member(node) => {
                self.expression(&mut node.base)?;
                node.program_point = Some(self.next_point()?);
                Ok(())
            }
            Expression::Index(node) => {
                self.expression(&mut node.base)?;
                self.expression(&mut node.index)?;
                node.program_point = Some(self.next_point()?);
                Ok(())
            }
            Expression::Object(node) => node
                .properties
                .iter_mut()
                .try_for_each(|p| self.expression(&mut p.value)),
            Expression::Array(node) => node.elements.iter_mut().try_for_each(|e| self.expression(e)),
            Expression::Discard(inner) => self.expression(inner),
            Expression::JoinPredecessor(node) => self.expression(&mut node.expression),
        }
    }

    /// The target of an assignment never carries a program point itself;
    /// the expressions it is computed from still do
    fn target(&mut self, target: &mut Expression) -> Result<()> {
        match target {
            Expression::Identifier(ident) => {
                ident.program_point = None;
                Ok(())
            }
            Expression::Member(node) => {
                node.program_point = None;
                self.expression(&mut node.base)
            }
            Expression::Index(node) => {
                node.program_point = None;
                self.expression(&mut node.base)?;
                self.expression(&mut node.index)
            }
            Expression::JoinPredecessor(node) => self.target(&mut node.expression),
            other => self.expression(other),
        }
    }
}

/// Program points of `function` in visitation order
pub fn program_points(function: &FunctionNode) -> Vec<ProgramPoint> {
    fn block(b: &Block, out: &mut Vec<ProgramPoint>) {
        for s in &b.statements {
            statement(s, out);
        }
    }
    fn statement(s: &Statement, out: &mut Vec<ProgramPoint>) {
        match s {
            Statement::Var(v) => v.init.iter().for_each(|e| expression(e, out)),
            Statement::Expression(e) => expression(&e.expression, out),
            Statement::If(n) => {
                expression(&n.test, out);
                block(&n.pass, out);
                n.fail.iter().for_each(|b| block(b, out));
            }
            Statement::While(n) if n.is_do_while => {
                block(&n.body, out);
                expression(&n.test, out);
            }
            Statement::While(n) => {
                expression(&n.test, out);
                block(&n.body, out);
            }
            Statement::For(n) => {
                n.init.iter().chain(&n.test).for_each(|e| expression(e, out));
                block(&n.body, out);
                n.modify.iter().for_each(|e| expression(e, out));
            }
            Statement::Return(n) => n.expression.iter().for_each(|e| expression(e, out)),
            Statement::Throw(n) => expression(&n.expression, out),
            Statement::With(n) => {
                expression(&n.expression, out);
                block(&n.body, out);
            }
            other => other.child_blocks().into_iter().for_each(|b| block(b, out)),
        }
    }
    fn expression(e: &Expression, out: &mut Vec<ProgramPoint>) {
        let own = match e {
            Expression::Literal(_) | Expression::Function(_) => None,
            Expression::Identifier(id) => id.program_point,
            Expression::Unary(n) => {
                expression(&n.operand, out);
                n.program_point
            }
            Expression::Binary(n) => {
                expression(&n.lhs, out);
                expression(&n.rhs, out);
                n.program_point
            }
            Expression::Sequence(n) => {
                n.expressions.iter().for_each(|e| expression(e, out));
                None
            }
            Expression::Assign(n) => {
                expression(&n.target, out);
                expression(&n.value, out);
                None
            }
            Expression::Ternary(n) => {
                expression(&n.test, out);
                expression(&n.consequent, out);
                expression(&n.alternate, out);
                None
            }
            Expression::Call(n) => {
                expression(&n.callee, out);
                n.args.iter().for_each(|e| expression(e, out));
                n.program_point
            }
            Expression::Member(n) => {
                expression(&n.base, out);
                n.program_point
            }
            Expression::Index(n) => {
                expression(&n.base, out);
                expression(&n.index, out);
                n.program_point
            }
            Expression::Object(n) => {
                n.properties.iter().for_each(|p| expression(&p.value, out));
                None
            }
            Expression::Array(n) => {
                n.elements.iter().for_each(|e| expression(e, out));
                None
            }
            Expression::Discard(inner) => {
                expression(inner, out);
                None
            }
            Expression::JoinPredecessor(n) => {
                expression(&n.expression, out);
                None
            }
        };
        out.extend(own);
    }

    let mut out = Vec::new();
    block(&function.body, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;

    fn function_with(statements: impl FnOnce(&mut FunctionNode) -> Vec<Statement>) -> FunctionNode {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[("a", Type::Int)], FunctionFlags::empty());
        let body = statements(&mut f);
        f.body.statements = body;
        f
    }

    #[test]
    fn test_post_order_numbering() {
        // return a.b + c
        let mut f = function_with(|f| {
            vec![return_stmt(Some(binary(
                BinaryOp::Add,
                member(local(f, "a"), "b", Type::Int),
                global("c"),
            )))]
        });
        let count = ProgramPointAssigner::assign(&mut f, 100).unwrap();
        assert_eq!(count, 4);
        let Statement::Return(ret) = &f.body.statements[0] else {
            panic!("expected return");
        };
        let Some(Expression::Binary(add)) = &ret.expression else {
            panic!("expected binary");
        };
        assert_eq!(add.program_point, Some(ProgramPoint(4)));
        let Expression::Member(access) = &add.lhs else {
            panic!("expected member");
        };
        assert_eq!(access.program_point, Some(ProgramPoint(2)));
        assert_eq!(program_points(&f), (1..=4).map(ProgramPoint).collect::<Vec<_>>());
    }

    #[test]
    fn test_assignment_targets_are_skipped() {
        // x = a + 1; o.p = a
        let mut f = function_with(|f| {
            let decl = var(f, "x", Type::Int, None);
            vec![
                decl,
                expr_stmt(assign(local(f, "x"), binary(BinaryOp::Add, local(f, "a"), int(1)))),
                expr_stmt(assign(member(global("o"), "p", Type::Object), local(f, "a"))),
            ]
        });
        ProgramPointAssigner::assign(&mut f, 100).unwrap();
        let Statement::Expression(first) = &f.body.statements[1] else {
            panic!("expected expression");
        };
        let Expression::Assign(node) = &first.expression else {
            panic!("expected assignment");
        };
        let Expression::Identifier(x) = &node.target else {
            panic!("expected identifier");
        };
        assert_eq!(x.program_point, None);

        let Statement::Expression(second) = &f.body.statements[2] else {
            panic!("expected expression");
        };
        let Expression::Assign(node) = &second.expression else {
            panic!("expected assignment");
        };
        let Expression::Member(target) = &node.target else {
            panic!("expected member");
        };
        assert_eq!(target.program_point, None);
        // a(1) +(2) o(3) a(4)
        assert_eq!(program_points(&f).len(), 4);
    }

    #[test]
    fn test_internal_identifiers_and_nested_functions_are_skipped() {
        let inner = {
            let mut g = FunctionNode::new(FunctionId(2), "g", &[], FunctionFlags::empty());
            g.body.statements.push(return_stmt(Some(global("x"))));
            g
        };
        let mut f = function_with(|f| {
            vec![
                expr_stmt(this(f)),
                expr_stmt(function_expr(inner)),
                expr_stmt(unary(UnaryOp::Not, local(f, "a"), Type::Boolean)),
            ]
        });
        let count = ProgramPointAssigner::assign(&mut f, 100).unwrap();
        assert_eq!(count, 1);
        let Statement::Expression(nested) = &f.body.statements[1] else {
            panic!("expected expression");
        };
        let Expression::Function(g) = &nested.expression else {
            panic!("expected function");
        };
        assert!(program_points(g).is_empty());
    }

    #[test]
    fn test_last_id_of_the_full_range() {
        let mut assigner = ProgramPointAssigner {
            function: FunctionId(1),
            next: u64::from(u32::MAX),
            max: u32::MAX,
        };
        assert_eq!(assigner.next_point().unwrap(), ProgramPoint(u32::MAX));
        let err = assigner.next_point().unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::ResourceExhaustion);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut f = function_with(|f| {
            vec![expr_stmt(binary(
                BinaryOp::Mul,
                local(f, "a"),
                binary(BinaryOp::Sub, local(f, "a"), int(1)),
            ))]
        });
        let err = ProgramPointAssigner::assign(&mut f, 3).unwrap_err();
        assert_eq!(
            err,
            Error::ProgramPointOverflow {
                function: FunctionId(1),
                limit: 3
            }
        );
    }
}
