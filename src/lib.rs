//! Quench: lowering and code generation backend for an optimistic
//! JavaScript compiler
//!
//! Quench takes a typed, symbol-resolved syntax tree for one script and
//! turns every function into bounded-size compile units of stack-machine
//! methods. Arithmetic, property reads and calls are emitted with narrow
//! speculative types; each speculative operation carries a program point
//! and a deoptimization continuation describing how to resume in a more
//! general version of the function when the speculation fails.
//!
//! # Quick Start
//!
//! ```no_run
//! use quench::ast::{build, BinaryOp, FunctionFlags, FunctionId, FunctionNode, Type};
//! use quench::{Compiler, CompilerConfig};
//!
//! let mut f = FunctionNode::new(FunctionId(1), "add", &[("a", Type::Int), ("b", Type::Int)], FunctionFlags::empty());
//! let sum = build::binary(BinaryOp::Add, build::local(&f, "a"), build::local(&f, "b"));
//! f.body.statements = vec![build::return_stmt(Some(sum))];
//!
//! let compiler = Compiler::new(CompilerConfig::default());
//! let compiled = compiler.compile_function(f, None)?;
//! println!("{}", compiled.code.methods[0].code.disassemble());
//! # Ok::<(), quench::Error>(())
//! ```
//!
//! # Module Overview
//!
//! The pipeline flows: [`ast`] → [`passes`] → [`signature`] → [`codegen`] → compile units
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Tree** | [`ast`] |
//! | **Passes** | [`passes`] (folding, apply-to-call, finalization, program points) |
//! | **Types** | [`signature`], [`deopt`] |
//! | **Emission** | [`bytecode`], [`codegen`], [`shape`] |
//! | **Driver** | [`compiler`], [`config`], [`error`](Error) |
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod deopt;
pub mod passes;
pub mod shape;
pub mod signature;

mod error;

pub use compiler::{CompiledFunction, CompiledProgram, Compiler};
pub use config::CompilerConfig;
pub use error::{Error, ErrorClass, Result, SourceLocation};

/// Quench version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
