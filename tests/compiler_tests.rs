//! Integration tests for the compiler driver

mod common;
use common::*;
use quench::ast::*;
use quench::codegen::InMemoryInstaller;
use quench::signature::CallSiteType;
use quench::{Compiler, CompilerConfig, ErrorClass};
use std::sync::Arc;
use std::thread;

/// `var add = function add(a, b) { return a + b }; add(1, 2)`
fn adder_program() -> FunctionNode {
    program(|p| {
        let mut add = function(1, "add", &[("a", Type::Int), ("b", Type::Int)]);
        add.return_type = Type::Int;
        let sum = build::binary(BinaryOp::Add, build::local(&add, "a"), build::local(&add, "b"));
        add.body.statements = vec![build::return_stmt(Some(sum))];
        let decl = build::var(p, "add", Type::Object, Some(build::function_expr(add)));
        let call = build::call(
            build::local(p, "add"),
            vec![build::int(1), build::int(2)],
            Type::Object,
        );
        vec![decl, build::expr_stmt(call)]
    })
}

mod programs {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_json_tree_round_trips_into_the_compiler() {
        let json = serde_json::to_string(&adder_program()).unwrap();
        let decoded: FunctionNode = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, adder_program());

        let compiled = compiler().compile_program(decoded);
        assert!(compiled.failures.is_empty());
        assert_eq!(compiled.functions.len(), 2);
        let text = compiled.disassemble().unwrap();
        assert!(text.contains("; unit Script$0"));
        assert!(text.contains("add$1"));
    }

    #[test]
    fn test_optimistic_add_has_continuation() {
        let compiled = compiler().compile_program(adder_program());
        let add = compiled.function(FunctionId(1)).unwrap();
        assert_eq!(add.code.continuations.len(), 1);

        let pp = add.code.continuations.program_points().next().unwrap();
        let continuation = add.continuation(pp).unwrap();
        assert_eq!(continuation.result_type(), Type::Int);
        let live_ints = continuation
            .local_types()
            .iter()
            .filter(|t| **t == Type::Int)
            .count();
        assert!(live_ints >= 2);
    }

    #[test]
    fn test_non_optimistic_program_has_no_continuations() {
        let compiler = Compiler::new(CompilerConfig::default().with_optimistic_types(false));
        let compiled = compiler.compile_program(adder_program());
        assert!(compiled
            .functions
            .iter()
            .all(|f| f.code.continuations.is_empty()));
    }

    #[test]
    fn test_install_hands_out_initializers_once() {
        let compiled = compiler().compile_program(adder_program());
        let installer = InMemoryInstaller::new();
        let installed = compiled.install(&installer).unwrap();

        let mut initialized: Vec<FunctionId> = installed
            .iter()
            .flat_map(|(_, init)| init.iter().map(|i| i.function))
            .collect();
        initialized.sort();
        assert_eq!(initialized, vec![FunctionId(0), FunctionId(1)]);
        assert_eq!(installer.len(), compiled.units.len());
        for unit in &compiled.units {
            assert!(unit.initializers().is_empty());
            assert!(unit.add_weight(1).is_err());
        }
    }

    #[test]
    fn test_summary_names_failures() {
        let compiler = Compiler::new(CompilerConfig::default().with_max_program_point(1));
        let compiled = compiler.compile_program(adder_program());
        let summary = serde_json::to_value(compiled.summary()).unwrap();
        assert_eq!(summary["failures"][0]["class"], "resource exhaustion");
        assert_eq!(compiled.failures[0].error.class(), ErrorClass::ResourceExhaustion);
    }
}

mod specialization {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_concurrent_requests_share_one_compilation() {
        let compiler = Arc::new(compiler());
        let site = CallSiteType::for_arguments(false, &[Type::Number, Type::Number], Type::Number);
        let f = {
            let mut add = function(5, "add", &[("a", Type::Object), ("b", Type::Object)]);
            let sum = build::binary(BinaryOp::Add, build::local(&add, "a"), build::local(&add, "b"));
            add.body.statements = vec![build::return_stmt(Some(sum))];
            add
        };

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let compiler = Arc::clone(&compiler);
                    let f = f.clone();
                    let site = site.clone();
                    s.spawn(move || compiler.compile_specialization(&f, &site).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
        assert_eq!(compiler.units().units()[0].initializers().len(), 1);
        assert_eq!(
            compiler.param_type(FunctionId(5), 0).unwrap(),
            Some(Type::Number)
        );
    }

    #[test]
    fn test_signature_reuse() {
        let compiled = compiler()
            .compile_specialization(
                &{
                    let mut f = function(2, "id", &[("x", Type::Object)]);
                    f.body.statements = vec![build::return_stmt(Some(build::local(&f, "x")))];
                    f
                },
                &CallSiteType::for_arguments(false, &[Type::Number], Type::Object),
            )
            .unwrap();
        let narrower = CallSiteType::for_arguments(false, &[Type::Int], Type::Object);
        let wider = CallSiteType::for_arguments(false, &[Type::Object], Type::Object);
        assert!(compiled.signature.is_reusable_for(&narrower));
        assert!(!compiled.signature.is_reusable_for(&wider));
    }
}
