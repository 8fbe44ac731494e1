//! Integration tests for the tree passes

mod common;
use common::*;
use quench::ast::*;
use quench::passes::*;
use quench::signature::CallSiteType;

fn fold_value(expr: Expression) -> Expression {
    let mut f = function(1, "f", &[]);
    f.body.statements = vec![build::return_stmt(Some(expr))];
    let folded = ConstantFolder::new().fold_function(f);
    first_expression(&folded).clone()
}

mod folding {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_precedence_folds_to_int() {
        let expr = build::binary(
            BinaryOp::Add,
            build::int(2),
            build::binary(BinaryOp::Mul, build::int(3), build::int(4)),
        );
        assert_eq!(fold_value(expr).as_literal(), Some(&LiteralValue::Int(14)));
    }

    #[test]
    fn test_negative_zero_stays_floating() {
        let expr = build::unary(UnaryOp::Minus, build::int(0), Type::Int);
        match fold_value(expr).as_literal() {
            Some(LiteralValue::Number(n)) => assert!(*n == 0.0 && n.is_sign_negative()),
            other => panic!("expected -0.0, got {:?}", other),
        }
    }

    #[test]
    fn test_int_min_negation_widens() {
        let expr = build::unary(UnaryOp::Minus, build::int(i32::MIN), Type::Int);
        assert_eq!(
            fold_value(expr).as_literal(),
            Some(&LiteralValue::Number(2147483648.0))
        );
    }

    #[test]
    fn test_unsigned_shift_picks_narrowest_type() {
        let small = build::binary(BinaryOp::Shr, build::int(16), build::int(2));
        assert_eq!(fold_value(small).as_literal(), Some(&LiteralValue::Int(4)));

        let large = build::binary(BinaryOp::Shr, build::int(-1), build::int(0));
        assert_eq!(
            fold_value(large).as_literal(),
            Some(&LiteralValue::Number(4294967295.0))
        );
    }

    #[test]
    fn test_string_concatenation() {
        let expr = build::binary(BinaryOp::Add, build::string("a"), build::int(1));
        assert_eq!(
            fold_value(expr).as_literal(),
            Some(&LiteralValue::String("a1".to_string()))
        );
    }

    #[test]
    fn test_ternary_uses_truthiness() {
        let expr = build::ternary(build::string(""), build::int(1), build::int(2), Type::Int);
        assert_eq!(fold_value(expr).as_literal(), Some(&LiteralValue::Int(2)));
    }

    #[test]
    fn test_dead_branch_keeps_declarations() {
        let mut f = function(1, "f", &[]);
        let decl = build::var(&mut f, "x", Type::Int, Some(build::int(1)));
        f.body.statements = vec![build::if_stmt(build::boolean(false), build::block(vec![decl]), None)];

        let mut folder = ConstantFolder::new();
        let folded = folder.fold_function(f);
        assert_eq!(folder.stats().branches_pruned, 1);

        let mut vars = Vec::new();
        fn collect<'a>(block: &'a Block, out: &mut Vec<&'a VarNode>) {
            for s in &block.statements {
                match s {
                    Statement::Var(v) => out.push(v),
                    other => other.child_blocks().into_iter().for_each(|b| collect(b, out)),
                }
            }
        }
        collect(&folded.body, &mut vars);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name.name, "x");
        assert!(vars[0].init.is_none());
    }

    #[test]
    fn test_folding_is_idempotent() {
        let mut f = function(1, "f", &[("a", Type::Int)]);
        f.body.statements = vec![
            build::expr_stmt(build::binary(BinaryOp::Sub, build::int(10), build::num(0.5))),
            build::if_stmt(
                build::binary(BinaryOp::Lt, build::int(1), build::int(2)),
                build::block(vec![build::return_stmt(Some(build::local(&f, "a")))]),
                None,
            ),
        ];
        let once = ConstantFolder::new().fold_function(f);
        let mut second = ConstantFolder::new();
        let twice = second.fold_function(once.clone());
        assert_eq!(twice, once);
        assert_eq!(second.stats(), FoldStats::default());
    }
}

mod apply_to_call {
    use super::*;
    use pretty_assertions::assert_eq;

    fn site(args: usize) -> CallSiteType {
        CallSiteType::for_arguments(true, &vec![Type::Int; args], Type::Object)
    }

    #[test]
    fn test_reassigned_receiver_is_not_rewritten() {
        let mut f = forwarding_function();
        f.body
            .statements
            .insert(0, build::expr_stmt(build::assign(build::global("g"), build::int(1))));
        let original = f.clone();
        let env = StaticEnvironment::default();
        assert!(!ApplyToCallRewriter::new(&env).rewrite(&mut f, &site(2)).unwrap());
        assert_eq!(f, original);
    }

    #[test]
    fn test_specialization_through_the_compiler() {
        let compiler = compiler();
        let compiled = compiler
            .compile_specialization(&forwarding_function(), &site(2))
            .unwrap();
        assert!(compiled.apply_to_call);
        assert!(!compiled.signature.is_vararg());
        assert_eq!(compiled.signature.params().len(), 2);
    }

    #[test]
    fn test_plain_compile_keeps_varargs() {
        let compiled = compiler().compile_function(forwarding_function(), None).unwrap();
        assert!(!compiled.apply_to_call);
        assert!(compiled.signature.is_vararg());
    }
}

mod program_points {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ids_increase_in_visitation_order() {
        let mut f = function(1, "f", &[("a", Type::Int), ("b", Type::Int)]);
        let decl = build::var(&mut f, "x", Type::Int, None);
        let store = build::assign(
            build::local(&f, "x"),
            build::binary(BinaryOp::Mul, build::local(&f, "a"), build::global("k")),
        );
        let read = build::member(build::global("o"), "p", Type::Int);
        f.body.statements = vec![decl, build::expr_stmt(store), build::return_stmt(Some(read))];

        TypeFinalizer::finalize(&mut f).unwrap();
        let count = ProgramPointAssigner::assign(&mut f, 1000).unwrap();
        let points = program_points(&f);

        assert_eq!(points.len() as u32, count);
        assert_eq!(points[0], ProgramPoint(FIRST_PROGRAM_POINT));
        assert!(points.windows(2).all(|w| w[0] < w[1]));
        // x is only stored, never read
        let Statement::Expression(e) = &f.body.statements[1] else {
            panic!("expected assignment");
        };
        let Expression::Assign(assign) = &e.expression else {
            panic!("expected assignment");
        };
        assert!(matches!(&assign.target, Expression::Identifier(id) if id.program_point.is_none()));
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let mut f = function(1, "f", &[("a", Type::Int)]);
        let sum = (0..5).fold(build::local(&f, "a"), |acc, _| {
            build::binary(BinaryOp::Add, acc, build::local(&f, "a"))
        });
        f.body.statements = vec![build::return_stmt(Some(sum))];
        let err = ProgramPointAssigner::assign(&mut f, 3).unwrap_err();
        assert_eq!(err.class(), quench::ErrorClass::ResourceExhaustion);
    }
}

mod scope_tracking {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frames_are_contiguous_and_realign_is_idempotent() {
        let mut f = function(1, "f", &[("a", Type::Number)]);
        let inner: Vec<SymbolId> = ["x", "y"]
            .iter()
            .map(|n| f.symbols.add(Symbol::new(*n, SymbolKind::Variable, Type::Int)))
            .collect();

        let mut tracker = ScopeTracker::new();
        let body = f.body.symbols.clone();
        tracker.push_frame(&body, &mut f.symbols, true).unwrap();
        let outer_total = tracker.current().unwrap().total();
        tracker.push_frame(&inner, &mut f.symbols, false).unwrap();

        let slots: Vec<u16> = inner
            .iter()
            .map(|&id| f.symbols.get(id).unwrap().slot().unwrap())
            .collect();
        assert_eq!(slots, vec![outer_total, outer_total + 1]);

        tracker.realign(&mut f.symbols).unwrap();
        let once = f.symbols.clone();
        tracker.realign(&mut f.symbols).unwrap();
        assert_eq!(f.symbols, once);

        tracker.pop_frame().unwrap();
        tracker.pop_frame().unwrap();
        assert!(tracker.pop_frame().is_err());
    }
}
