//! Conditional jumps for boolean-context expressions
//!
//! Tests of `if`, loops and ternaries never materialize a boolean when
//! they can jump directly: `!` flips the jump sense, `&&` and `||`
//! short-circuit into the target, and comparisons of primitive operands
//! become a single compare-and-jump.

use super::CodeGenerator;
use crate::ast::{BinaryNode, BinaryOp, Expression, Type, UnaryOp};
use crate::bytecode::{helpers, Condition, InvokeKind, Label, NanOrdering};
use crate::error::{Error, Result};

pub(super) struct BranchOptimizer<'g, 'a> {
    gen: &'g mut CodeGenerator<'a>,
}

impl<'g, 'a> BranchOptimizer<'g, 'a> {
    pub(super) fn new(gen: &'g mut CodeGenerator<'a>) -> Self {
        Self { gen }
    }

    /// Jump to `label` when `expr` evaluates to `state`, fall through
    /// otherwise
    pub(super) fn execute(&mut self, expr: &Expression, label: Label, state: bool) -> Result<()> {
        match expr {
            Expression::Literal(lit) => {
                if lit.value.to_boolean() == state {
                    self.gen.method.goto(label)?;
                }
                Ok(())
            }
            Expression::Unary(node) if node.op == UnaryOp::Not => self.execute(&node.operand, label, !state),
            Expression::Binary(node) => match node.op {
                BinaryOp::And if state => {
                    let skip = self.gen.method.new_label("and_skip");
                    self.execute(&node.lhs, skip, false)?;
                    self.execute(&node.rhs, label, true)?;
                    self.gen.method.label(skip)
                }
                BinaryOp::And => {
                    self.execute(&node.lhs, label, false)?;
                    self.execute(&node.rhs, label, false)
                }
                BinaryOp::Or if state => {
                    self.execute(&node.lhs, label, true)?;
                    self.execute(&node.rhs, label, true)
                }
                BinaryOp::Or => {
                    let skip = self.gen.method.new_label("or_skip");
                    self.execute(&node.lhs, skip, true)?;
                    self.execute(&node.rhs, label, false)?;
                    self.gen.method.label(skip)
                }
                op if op.is_comparison() => self.compare(node, label, state),
                _ => self.test(expr, label, state),
            },
            Expression::JoinPredecessor(join) if join.live_conversions().next().is_some() => {
                let skip = self.gen.method.new_label("join_skip");
                self.execute(&join.expression, skip, !state)?;
                self.gen.apply_conversions(&join.conversions)?;
                self.gen.method.goto(label)?;
                self.gen.method.label(skip)
            }
            Expression::JoinPredecessor(join) => self.execute(&join.expression, label, state),
            _ => self.test(expr, label, state),
        }
    }

    fn test(&mut self, expr: &Expression, label: Label, state: bool) -> Result<()> {
        self.gen.load(expr, Type::Boolean)?;
        self.gen.method.test(state, label)
    }

    fn compare(&mut self, node: &BinaryNode, label: Label, state: bool) -> Result<()> {
        let lhs = node.lhs.ty().normalized();
        let rhs = node.rhs.ty().normalized();
        let strict = matches!(node.op, BinaryOp::StrictEq | BinaryOp::StrictNe);
        let mismatched = lhs != rhs && !(lhs.is_numeric() && rhs.is_numeric());

        if !lhs.is_primitive() || !rhs.is_primitive() || (strict && mismatched) {
            let helper = helpers::compare(node.op)
                .ok_or_else(|| Error::internal(format!("no compare helper for '{}'", node.op.as_str())))?;
            self.gen.load(&node.lhs, Type::Object)?;
            self.gen.load(&node.rhs, Type::Object)?;
            self.gen.method.invoke(InvokeKind::Static, helper)?;
            return self.gen.method.test(state, label);
        }

        let ty = Type::widest(lhs, rhs);
        let (condition, nan) = jump_condition(node.op, state)
            .ok_or_else(|| Error::internal(format!("'{}' is not a comparison", node.op.as_str())))?;
        self.gen.load(&node.lhs, ty)?;
        self.gen.load(&node.rhs, ty)?;
        self.gen.method.compare_jump(condition, nan, label)
    }
}

/// Compare-and-jump condition that jumps exactly when `op` yields
/// `state`, and the NaN ordering that keeps unordered operands on the
/// correct side
pub fn jump_condition(op: BinaryOp, state: bool) -> Option<(Condition, NanOrdering)> {
    let base = match op {
        BinaryOp::Eq | BinaryOp::StrictEq => Condition::Eq,
        BinaryOp::Ne | BinaryOp::StrictNe => Condition::Ne,
        BinaryOp::Lt => Condition::Lt,
        BinaryOp::Le => Condition::Le,
        BinaryOp::Gt => Condition::Gt,
        BinaryOp::Ge => Condition::Ge,
        _ => return None,
    };
    let nan = match base {
        Condition::Lt | Condition::Le => NanOrdering::Greater,
        _ => NanOrdering::Less,
    };
    let condition = if state { base } else { base.inverse() };
    Some((condition, nan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::bytecode::Instruction;
    use crate::codegen::tests::{function, Fixture};
    use crate::config::CompilerConfig;

    const COMPARISONS: [BinaryOp; 8] = [
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::StrictEq,
        BinaryOp::StrictNe,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
    ];

    fn language_result(op: BinaryOp, lhs: f64, rhs: f64) -> bool {
        match op {
            BinaryOp::Eq | BinaryOp::StrictEq => lhs == rhs,
            BinaryOp::Ne | BinaryOp::StrictNe => lhs != rhs,
            BinaryOp::Lt => lhs < rhs,
            BinaryOp::Le => lhs <= rhs,
            BinaryOp::Gt => lhs > rhs,
            BinaryOp::Ge => lhs >= rhs,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_jump_matches_language_semantics() {
        let pairs = [
            (1.0, 2.0),
            (2.0, 2.0),
            (3.0, 2.0),
            (-0.0, 0.0),
            (f64::NAN, 1.0),
            (1.0, f64::NAN),
            (f64::NAN, f64::NAN),
            (f64::INFINITY, 1.5),
        ];
        for op in COMPARISONS {
            for state in [true, false] {
                let (condition, nan) = jump_condition(op, state).unwrap();
                for (lhs, rhs) in pairs {
                    let jumps = nan.evaluate(condition, lhs, rhs);
                    assert_eq!(
                        jumps,
                        language_result(op, lhs, rhs) == state,
                        "{} {} {} with state {}",
                        lhs,
                        op.as_str(),
                        rhs,
                        state
                    );
                }
            }
        }
    }

    #[test]
    fn test_non_comparison_has_no_condition() {
        assert!(jump_condition(BinaryOp::Add, true).is_none());
        assert!(jump_condition(BinaryOp::And, false).is_none());
    }

    fn if_test(test: impl FnOnce(&FunctionNode) -> Expression, params: &[(&str, Type)]) -> Vec<Instruction> {
        let mut f = function(params);
        let test = test(&f);
        f.body.statements = vec![build::if_stmt(
            test,
            build::block(vec![build::return_stmt(Some(build::int(1)))]),
            None,
        )];
        let code = Fixture::new(CompilerConfig::default()).generate(f);
        code.methods[0].code.instructions.clone()
    }

    #[test]
    fn test_mixed_numeric_compare_widens() {
        let code = if_test(
            |f| build::binary(BinaryOp::Lt, build::local(f, "a"), build::local(f, "b")),
            &[("a", Type::Int), ("b", Type::Number)],
        );
        assert!(code.iter().any(|i| matches!(
            i,
            Instruction::CompareJump {
                ty: Type::Number,
                condition: Condition::Ge,
                nan: NanOrdering::Greater,
                ..
            }
        )));
        assert!(code
            .iter()
            .any(|i| matches!(i, Instruction::Convert { from: Type::Int, to: Type::Number })));
    }

    #[test]
    fn test_object_compare_uses_helper() {
        let code = if_test(
            |f| build::binary(BinaryOp::Eq, build::local(f, "a"), build::int(1)),
            &[("a", Type::Object)],
        );
        assert!(code.iter().any(|i| matches!(
            i,
            Instruction::Invoke { method, .. } if method.name == "EQ"
        )));
        assert!(!code.iter().any(|i| matches!(i, Instruction::CompareJump { .. })));
    }

    #[test]
    fn test_strict_mismatch_uses_helper() {
        let code = if_test(
            |f| build::binary(BinaryOp::StrictEq, build::local(f, "a"), build::int(1)),
            &[("a", Type::Boolean)],
        );
        assert!(code.iter().any(|i| matches!(
            i,
            Instruction::Invoke { method, .. } if method.name == "EQ_STRICT"
        )));
    }

    #[test]
    fn test_negated_conjunction_short_circuits() {
        let code = if_test(
            |f| {
                build::unary(
                    UnaryOp::Not,
                    build::binary(
                        BinaryOp::And,
                        build::binary(BinaryOp::Gt, build::local(f, "a"), build::int(0)),
                        build::binary(BinaryOp::Lt, build::local(f, "a"), build::int(9)),
                    ),
                    Type::Boolean,
                )
            },
            &[("a", Type::Int)],
        );
        let jumps: Vec<Condition> = code
            .iter()
            .filter_map(|i| match i {
                Instruction::CompareJump { condition, .. } => Some(*condition),
                _ => None,
            })
            .collect();
        // if !(a > 0 && a < 9): skip the body when both hold
        assert_eq!(jumps, vec![Condition::Le, Condition::Lt]);
        assert!(!code.iter().any(|i| matches!(i, Instruction::Test { .. })));
    }

    #[test]
    fn test_constant_test_folds_to_goto() {
        let code = if_test(|_| build::boolean(false), &[]);
        assert!(!code.iter().any(|i| matches!(i, Instruction::Test { .. })));
        assert!(code.iter().any(|i| matches!(i, Instruction::Goto(_))));
    }
}
