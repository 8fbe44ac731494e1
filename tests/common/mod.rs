//! Shared tree builders for integration tests

#![allow(dead_code)]

use quench::ast::*;
use quench::{Compiler, CompilerConfig};

/// Script body with id 0
pub fn program(statements: impl FnOnce(&mut FunctionNode) -> Vec<Statement>) -> FunctionNode {
    let mut p = FunctionNode::new(FunctionId(0), "", &[], FunctionFlags::IS_PROGRAM);
    p.body.statements = statements(&mut p);
    p
}

/// Function with the given id and parameters
pub fn function(id: u32, name: &str, params: &[(&str, Type)]) -> FunctionNode {
    FunctionNode::new(FunctionId(id), name, params, FunctionFlags::empty())
}

/// `print(n);`
pub fn print(n: i32) -> Statement {
    build::expr_stmt(build::call(build::global("print"), vec![build::int(n)], Type::Object))
}

/// `function f() { g.apply(this, arguments) }`
pub fn forwarding_function() -> FunctionNode {
    let mut f = FunctionNode::new(FunctionId(1), "f", &[], FunctionFlags::USES_ARGUMENTS);
    let apply = build::call(
        build::member(build::global("g"), "apply", Type::Object),
        vec![build::this(&f), build::local(&f, "arguments")],
        Type::Object,
    );
    f.body.statements.push(build::expr_stmt(apply));
    f
}

pub fn compiler() -> Compiler {
    Compiler::new(CompilerConfig::default())
}

/// Value of the first statement of `f`, an expression statement or a
/// return
pub fn first_expression(f: &FunctionNode) -> &Expression {
    match &f.body.statements[0] {
        Statement::Expression(e) => &e.expression,
        Statement::Return(r) => r.expression.as_ref().expect("return value"),
        other => panic!("unexpected statement {:?}", other),
    }
}
