//! Constant folding over the typed tree
//!
//! Reduces literal-only unary and binary expressions and prunes the dead
//! branch of conditionals whose test is a primitive literal. Folding is an
//! optimization: anything the folder does not understand is left alone.

use tracing::trace;

use crate::ast::*;

/// Statistics from one folding run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    /// Unary and binary expressions replaced by a literal
    pub expressions_folded: usize,
    /// if statements and ternaries reduced to one branch
    pub branches_pruned: usize,
}

/// Constant folder
#[derive(Debug, Default)]
pub struct ConstantFolder {
    stats: FoldStats,
}

impl ConstantFolder {
    /// Create a new folder
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics accumulated so far
    pub fn stats(&self) -> FoldStats {
        self.stats
    }

    /// Fold one function. Nested function expressions are left for their
    /// own compilation.
    pub fn fold_function(&mut self, mut function: FunctionNode) -> FunctionNode {
        let body = std::mem::take(&mut function.body);
        function.body = self.fold_block(body);
        trace!(
            function = %function.id,
            folded = self.stats.expressions_folded,
            pruned = self.stats.branches_pruned,
            "constant folding done"
        );
        function
    }

    fn fold_block(&mut self, mut block: Block) -> Block {
        block.statements = std::mem::take(&mut block.statements)
            .into_iter()
            .map(|s| self.fold_statement(s))
            .collect();
        block
    }

    fn fold_statement(&mut self, stmt: Statement) -> Statement {
        match stmt {
            Statement::Block(block) => Statement::Block(self.fold_block(block)),
            Statement::Var(mut var) => {
                var.init = var.init.map(|e| self.fold_expression(e));
                Statement::Var(var)
            }
            Statement::Expression(mut e) => {
                e.expression = self.fold_expression(e.expression);
                Statement::Expression(e)
            }
            Statement::If(node) => self.fold_if(*node),
            Statement::While(mut node) => {
                node.test = self.fold_expression(node.test);
                node.body = self.fold_block(node.body);
                Statement::While(node)
            }
            Statement::For(mut node) => {
                node.init = node.init.map(|e| self.fold_expression(e));
                node.test = node.test.map(|e| self.fold_expression(e));
                node.modify = node.modify.map(|e| self.fold_expression(e));
                node.body = self.fold_block(node.body);
                Statement::For(node)
            }
            Statement::Return(mut node) => {
                node.expression = node.expression.map(|e| self.fold_expression(e));
                Statement::Return(node)
            }
            Statement::Throw(mut node) => {
                node.expression = self.fold_expression(node.expression);
                Statement::Throw(node)
            }
            Statement::Try(mut node) => {
                node.body = self.fold_block(node.body);
                if let Some(catch) = node.catch.as_mut() {
                    catch.body = self.fold_block(std::mem::take(&mut catch.body));
                }
                Statement::Try(node)
            }
            Statement::With(mut node) => {
                node.expression = self.fold_expression(node.expression);
                node.body = self.fold_block(node.body);
                Statement::With(node)
            }
            Statement::Split(mut node) => {
                node.body = self.fold_block(node.body);
                Statement::Split(node)
            }
            other @ (Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_)) => other,
        }
    }

    fn fold_if(&mut self, mut node: IfNode) -> Statement {
        node.test = self.fold_expression(node.test);
        node.pass = self.fold_block(node.pass);
        node.fail = node.fail.map(|b| self.fold_block(b));

        let taken = match node.test.as_literal() {
            Some(value) => value.to_boolean(),
            None => return Statement::If(Box::new(node)),
        };
        self.stats.branches_pruned += 1;

        let (executed, dropped) = if taken {
            (Some(node.pass), node.fail)
        } else {
            (node.fail, Some(node.pass))
        };

        // Declarations in the dead branch are hoisted and must stay declared
        let mut hoisted = Vec::new();
        if let Some(dropped) = &dropped {
            collect_var_declarations(dropped, &mut hoisted);
        }

        match executed {
            Some(mut block) => {
                block.statements.extend(hoisted);
                Statement::Block(block)
            }
            None if hoisted.is_empty() => Statement::Empty(node.span),
            None => {
                let mut block = Block::new(hoisted);
                block.span = node.span;
                Statement::Block(block)
            }
        }
    }

    fn fold_expression(&mut self, expr: Expression) -> Expression {
        match expr {
            Expression::Unary(mut node) => {
                node.operand = self.fold_expression(node.operand);
                match node.operand.as_literal().and_then(|v| fold_unary(node.op, v)) {
                    Some(value) => {
                        self.stats.expressions_folded += 1;
                        Expression::Literal(LiteralNode::new(value, node.span))
                    }
                    None => Expression::Unary(node),
                }
            }
            Expression::Binary(mut node) => {
                node.lhs = self.fold_expression(node.lhs);
                node.rhs = self.fold_expression(node.rhs);
                let folded = match (node.lhs.as_literal(), node.rhs.as_literal()) {
                    (Some(lhs), Some(rhs)) => fold_binary(node.op, lhs, rhs),
                    _ => None,
                };
                match folded {
                    Some(value) => {
                        self.stats.expressions_folded += 1;
                        Expression::Literal(LiteralNode::new(value, node.span))
                    }
                    None => Expression::Binary(node),
                }
            }
            Expression::Ternary(mut node) => {
                node.test = self.fold_expression(node.test);
                node.consequent = self.fold_expression(node.consequent);
                node.alternate = self.fold_expression(node.alternate);
                match node.test.as_literal().map(LiteralValue::to_boolean) {
                    Some(taken) => {
                        self.stats.branches_pruned += 1;
                        if taken {
                            node.consequent
                        } else {
                            node.alternate
                        }
                    }
                    None => Expression::Ternary(node),
                }
            }
            Expression::Sequence(mut node) => {
                node.expressions = node
                    .expressions
                    .into_iter()
                    .map(|e| self.fold_expression(e))
                    .collect();
                Expression::Sequence(node)
            }
            Expression::Assign(mut node) => {
                node.target = self.fold_expression(node.target);
                node.value = self.fold_expression(node.value);
                Expression::Assign(node)
            }
            Expression::Call(mut node) => {
                node.callee = self.fold_expression(node.callee);
                node.args = node.args.into_iter().map(|e| self.fold_expression(e)).collect();
                Expression::Call(node)
            }
            Expression::Member(mut node) => {
                node.base = self.fold_expression(node.base);
                Expression::Member(node)
            }
            Expression::Index(mut node) => {
                node.base = self.fold_expression(node.base);
                node.index = self.fold_expression(node.index);
                Expression::Index(node)
            }
            Expression::Object(mut node) => {
                for property in &mut node.properties {
                    let value = std::mem::replace(&mut property.value, build::undefined());
                    property.value = self.fold_expression(value);
                }
                Expression::Object(node)
            }
            // Elements are folded, the array itself never is
            Expression::Array(mut node) => {
                node.elements = node
                    .elements
                    .into_iter()
                    .map(|e| self.fold_expression(e))
                    .collect();
                Expression::Array(node)
            }
            Expression::Discard(inner) => Expression::Discard(Box::new(self.fold_expression(*inner))),
            Expression::JoinPredecessor(mut node) => {
                node.expression = self.fold_expression(node.expression);
                Expression::JoinPredecessor(node)
            }
            other @ (Expression::Literal(_) | Expression::Identifier(_) | Expression::Function(_)) => other,
        }
    }
}

fn collect_var_declarations(block: &Block, out: &mut Vec<Statement>) {
    for stmt in &block.statements {
        if let Statement::Var(var) = stmt {
            out.push(Statement::Var(VarNode {
                name: var.name.clone(),
                init: None,
                span: var.span,
            }));
        }
        for child in stmt.child_blocks() {
            collect_var_declarations(child, out);
        }
    }
}

/// Fold a unary operator applied to a literal
pub fn fold_unary(op: UnaryOp, operand: &LiteralValue) -> Option<LiteralValue> {
    let ty = operand.ty();
    let integer = matches!(ty, Type::Int | Type::Boolean);
    Some(match op {
        UnaryOp::Plus => {
            if integer {
                LiteralValue::Int(operand.to_int32())
            } else if ty == Type::Long {
                LiteralValue::Long(operand.to_long())
            } else {
                LiteralValue::Number(operand.to_number())
            }
        }
        // Negating integer zero must produce -0.0, which only a double holds
        UnaryOp::Minus => {
            if integer && operand.to_int32() != 0 {
                match operand.to_int32().checked_neg() {
                    Some(n) => LiteralValue::Int(n),
                    None => LiteralValue::Number(-(operand.to_int32() as f64)),
                }
            } else if ty == Type::Long && operand.to_long() != 0 {
                match operand.to_long().checked_neg() {
                    Some(n) => LiteralValue::Long(n),
                    None => LiteralValue::Number(-(operand.to_long() as f64)),
                }
            } else {
                LiteralValue::Number(-operand.to_number())
            }
        }
        UnaryOp::Not => LiteralValue::Boolean(!operand.to_boolean()),
        UnaryOp::BitNot => LiteralValue::Int(!operand.to_int32()),
        UnaryOp::TypeOf | UnaryOp::Void => return None,
    })
}

/// Fold a binary operator applied to two literals
pub fn fold_binary(op: BinaryOp, lhs: &LiteralValue, rhs: &LiteralValue) -> Option<LiteralValue> {
    let widest = Type::widest(lhs.ty(), rhs.ty());
    let mut is_int = widest == Type::Int;
    let mut is_long = widest == Type::Long;

    let value = match op {
        BinaryOp::Add => {
            let foldable = (lhs.is_string() || lhs.is_numeric() || rhs.is_numeric())
                && (rhs.is_string() || rhs.is_numeric());
            if !foldable {
                return None;
            }
            match lhs.add(rhs) {
                LiteralValue::Number(n) => n,
                concatenated => return Some(concatenated),
            }
        }
        BinaryOp::Sub => lhs.to_number() - rhs.to_number(),
        BinaryOp::Mul => lhs.to_number() * rhs.to_number(),
        BinaryOp::Div => lhs.to_number() / rhs.to_number(),
        BinaryOp::Mod => lhs.to_number() % rhs.to_number(),
        BinaryOp::Shr => {
            let shifted = (lhs.to_int32() as u32) >> (rhs.to_int32() as u32 & 0x1f);
            return Some(match i32::try_from(shifted) {
                Ok(n) => LiteralValue::Int(n),
                Err(_) => LiteralValue::Number(shifted as f64),
            });
        }
        BinaryOp::Sar => {
            return Some(LiteralValue::Int(lhs.to_int32() >> (rhs.to_int32() as u32 & 0x1f)))
        }
        BinaryOp::Shl => {
            return Some(LiteralValue::Int(lhs.to_int32().wrapping_shl(rhs.to_int32() as u32)))
        }
        BinaryOp::BitAnd => return Some(LiteralValue::Int(lhs.to_int32() & rhs.to_int32())),
        BinaryOp::BitOr => return Some(LiteralValue::Int(lhs.to_int32() | rhs.to_int32())),
        BinaryOp::BitXor => return Some(LiteralValue::Int(lhs.to_int32() ^ rhs.to_int32())),
        BinaryOp::Lt => return Some(LiteralValue::Boolean(lhs.less_than(rhs) == Some(true))),
        BinaryOp::Gt => return Some(LiteralValue::Boolean(rhs.less_than(lhs) == Some(true))),
        BinaryOp::Le => return Some(LiteralValue::Boolean(rhs.less_than(lhs) == Some(false))),
        BinaryOp::Ge => return Some(LiteralValue::Boolean(lhs.less_than(rhs) == Some(false))),
        BinaryOp::Eq => return Some(LiteralValue::Boolean(lhs.equals(rhs))),
        BinaryOp::Ne => return Some(LiteralValue::Boolean(!lhs.equals(rhs))),
        BinaryOp::StrictEq => return Some(LiteralValue::Boolean(lhs.strict_equals(rhs))),
        BinaryOp::StrictNe => return Some(LiteralValue::Boolean(!lhs.strict_equals(rhs))),
        BinaryOp::And | BinaryOp::Or => return None,
    };

    is_int &= is_strictly_representable_as_int(value);
    is_long &= is_strictly_representable_as_long(value);

    Some(if is_int {
        LiteralValue::Int(value as i32)
    } else if is_long {
        LiteralValue::Long(value as i64)
    } else {
        LiteralValue::Number(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;

    fn fold_expr(expr: Expression) -> Expression {
        let mut f = FunctionNode::new(FunctionId(0), "test", &[], FunctionFlags::empty());
        f.body.statements.push(expr_stmt(expr));
        let folded = ConstantFolder::new().fold_function(f);
        match folded.body.statements.into_iter().next() {
            Some(Statement::Expression(e)) => e.expression,
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_fold_nested_arithmetic() {
        let expr = binary(BinaryOp::Add, int(2), binary(BinaryOp::Mul, int(3), int(4)));
        assert_eq!(fold_expr(expr).as_literal(), Some(&LiteralValue::Int(14)));
    }

    #[test]
    fn test_negate_integer_zero_is_negative_zero() {
        match fold_expr(unary(UnaryOp::Minus, int(0), Type::Int)).as_literal() {
            Some(LiteralValue::Number(n)) => {
                assert_eq!(*n, 0.0);
                assert!(n.is_sign_negative());
            }
            other => panic!("expected -0.0, got {:?}", other),
        }
    }

    #[test]
    fn test_negate_int_min_widens() {
        assert_eq!(
            fold_unary(UnaryOp::Minus, &LiteralValue::Int(i32::MIN)),
            Some(LiteralValue::Number(2_147_483_648.0))
        );
        assert_eq!(
            fold_unary(UnaryOp::Minus, &LiteralValue::Boolean(true)),
            Some(LiteralValue::Int(-1))
        );
    }

    #[test]
    fn test_unary_plus() {
        assert_eq!(fold_unary(UnaryOp::Plus, &LiteralValue::Boolean(true)), Some(LiteralValue::Int(1)));
        assert_eq!(
            fold_unary(UnaryOp::Plus, &LiteralValue::String("3".into())),
            Some(LiteralValue::Number(3.0))
        );
        assert_eq!(fold_unary(UnaryOp::BitNot, &LiteralValue::Number(5.7)), Some(LiteralValue::Int(-6)));
        assert_eq!(fold_unary(UnaryOp::TypeOf, &LiteralValue::Int(1)), None);
    }

    #[test]
    fn test_division_produces_double() {
        assert_eq!(
            fold_binary(BinaryOp::Div, &LiteralValue::Int(7), &LiteralValue::Int(2)),
            Some(LiteralValue::Number(3.5))
        );
        assert_eq!(
            fold_binary(BinaryOp::Div, &LiteralValue::Int(6), &LiteralValue::Int(2)),
            Some(LiteralValue::Int(3))
        );
    }

    #[test]
    fn test_int_overflow_widens_to_double() {
        assert_eq!(
            fold_binary(BinaryOp::Mul, &LiteralValue::Int(100_000), &LiteralValue::Int(100_000)),
            Some(LiteralValue::Number(1e10))
        );
        assert_eq!(
            fold_binary(BinaryOp::Add, &LiteralValue::Long(1 << 40), &LiteralValue::Int(1)),
            Some(LiteralValue::Long((1 << 40) + 1))
        );
    }

    #[test]
    fn test_string_concatenation() {
        let s = |v: &str| LiteralValue::String(v.to_string());
        assert_eq!(fold_binary(BinaryOp::Add, &s("a"), &LiteralValue::Int(1)), Some(s("a1")));
        assert_eq!(fold_binary(BinaryOp::Add, &LiteralValue::Number(1.5), &s("x")), Some(s("1.5x")));
        assert_eq!(fold_binary(BinaryOp::Add, &s("a"), &LiteralValue::Null), None);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(
            fold_binary(BinaryOp::Shr, &LiteralValue::Int(-1), &LiteralValue::Int(0)),
            Some(LiteralValue::Number(4_294_967_295.0))
        );
        assert_eq!(
            fold_binary(BinaryOp::Shr, &LiteralValue::Int(-16), &LiteralValue::Int(28)),
            Some(LiteralValue::Int(15))
        );
        assert_eq!(
            fold_binary(BinaryOp::Shl, &LiteralValue::Int(1), &LiteralValue::Int(33)),
            Some(LiteralValue::Int(2))
        );
        assert_eq!(
            fold_binary(BinaryOp::Sar, &LiteralValue::Int(-8), &LiteralValue::Int(1)),
            Some(LiteralValue::Int(-4))
        );
    }

    #[test]
    fn test_comparisons_use_language_semantics() {
        let s = |v: &str| LiteralValue::String(v.to_string());
        assert_eq!(
            fold_binary(BinaryOp::Lt, &s("10"), &s("9")),
            Some(LiteralValue::Boolean(true))
        );
        assert_eq!(
            fold_binary(BinaryOp::Lt, &s("10"), &LiteralValue::Int(9)),
            Some(LiteralValue::Boolean(false))
        );
        assert_eq!(
            fold_binary(BinaryOp::Ge, &LiteralValue::Undefined, &LiteralValue::Int(0)),
            Some(LiteralValue::Boolean(false))
        );
        assert_eq!(
            fold_binary(BinaryOp::Eq, &LiteralValue::Null, &LiteralValue::Undefined),
            Some(LiteralValue::Boolean(true))
        );
        assert_eq!(
            fold_binary(BinaryOp::StrictEq, &LiteralValue::Int(1), &s("1")),
            Some(LiteralValue::Boolean(false))
        );
    }

    #[test]
    fn test_if_with_literal_test_keeps_taken_branch() {
        let mut f = FunctionNode::new(FunctionId(0), "test", &[], FunctionFlags::empty());
        let dead_var = var(&mut f, "hoisted", Type::Int, Some(int(1)));
        let mut pass = block(vec![expr_stmt(global("taken"))]);
        pass.span.start.line = 7;
        f.body.statements.push(if_stmt(boolean(true), pass, Some(block(vec![dead_var]))));

        let folded = ConstantFolder::new().fold_function(f);
        match &folded.body.statements[0] {
            Statement::Block(b) => {
                assert_eq!(b.span.start.line, 7);
                assert_eq!(b.statements.len(), 2);
                match &b.statements[1] {
                    Statement::Var(v) => {
                        assert_eq!(v.name.name, "hoisted");
                        assert!(v.init.is_none());
                    }
                    other => panic!("expected hoisted var, got {:?}", other),
                }
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_if_without_taken_branch_becomes_empty() {
        let mut f = FunctionNode::new(FunctionId(0), "test", &[], FunctionFlags::empty());
        f.body
            .statements
            .push(if_stmt(int(0), block(vec![expr_stmt(global("x"))]), None));
        let folded = ConstantFolder::new().fold_function(f);
        assert!(matches!(folded.body.statements[0], Statement::Empty(_)));
    }

    #[test]
    fn test_ternary_folds_to_branch() {
        let expr = ternary(string(""), int(1), global("y"), Type::Object);
        assert!(matches!(fold_expr(expr), Expression::Identifier(ref id) if id.name == "y"));
    }

    #[test]
    fn test_array_literal_never_folded() {
        let expr = binary(BinaryOp::Add, array(vec![int(1)]), int(2));
        assert!(matches!(fold_expr(expr), Expression::Binary(_)));
    }

    #[test]
    fn test_folding_is_idempotent() {
        let mut f = FunctionNode::new(FunctionId(0), "test", &[], FunctionFlags::empty());
        f.body.statements.push(expr_stmt(binary(
            BinaryOp::Sub,
            binary(BinaryOp::Mul, int(6), int(7)),
            global("z"),
        )));
        let once = ConstantFolder::new().fold_function(f);
        let mut folder = ConstantFolder::new();
        let twice = folder.fold_function(once.clone());
        assert_eq!(once, twice);
        assert_eq!(folder.stats(), FoldStats::default());
    }
}
