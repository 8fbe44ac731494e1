//! Quench CLI
//!
//! Compiles a JSON-encoded program tree and prints the result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quench::ast::FunctionNode;
use quench::compiler::fold_program;
use quench::{Compiler, CompilerConfig, VERSION};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quench")]
#[command(author, version, about = "Lowering and code generation backend for an optimistic JavaScript compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program and print its compile units
    Compile {
        /// JSON-encoded program tree
        program: PathBuf,

        /// Weight at which compile units are full and functions split
        #[arg(long, value_name = "N")]
        split_threshold: Option<u64>,

        /// Emit generic operations only
        #[arg(long)]
        no_optimistic: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Fold constants and print the folded tree as JSON
    Fold {
        /// JSON-encoded program tree
        program: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Compile {
            program,
            split_threshold,
            no_optimistic,
            format,
        } => {
            let mut config = CompilerConfig::from_env();
            if let Some(threshold) = split_threshold {
                config = config.with_split_threshold(threshold);
            }
            if no_optimistic {
                config = config.with_optimistic_types(false);
            }
            compile(&program, config, format)
        }
        Commands::Fold { program } => fold(&program),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_program(path: &Path) -> Result<FunctionNode> {
    let source = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&source).with_context(|| format!("{} is not a program tree", path.display()))
}

fn compile(path: &Path, config: CompilerConfig, format: Format) -> Result<()> {
    let program = read_program(path)?;
    tracing::info!(version = VERSION, split_threshold = config.split_threshold, "compiling {}", path.display());
    let compiled = Compiler::new(config).compile_program(program);

    match format {
        Format::Text => print!("{}", compiled.disassemble()?),
        Format::Json => println!("{}", serde_json::to_string_pretty(&compiled.summary())?),
    }

    if !compiled.failures.is_empty() {
        anyhow::bail!("{} function(s) failed to compile", compiled.failures.len());
    }
    Ok(())
}

fn fold(path: &Path) -> Result<()> {
    let program = read_program(path)?;
    let (folded, stats) = fold_program(program);
    tracing::info!(
        folded = stats.expressions_folded,
        pruned = stats.branches_pruned,
        "constant folding done"
    );
    println!("{}", serde_json::to_string_pretty(&folded)?);
    Ok(())
}
