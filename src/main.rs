// File: src/main.rs
//
// Main entry point for the Flint interpreter. With a script argument the
// file is read and interpreted once; with no arguments an interactive REPL
// starts. Exit codes follow the sysexits convention: 64 bad usage, 65
// compile error, 70 runtime error, 74 unreadable input.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use colored::Colorize;

use flint::errors::{EX_NOINPUT, EX_USAGE};
use flint::repl::Repl;
use flint::vm::Vm;

#[derive(Parser)]
#[command(
    name = "flint",
    about = "Flint: a small bytecode-compiled scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a Flint script; omit to start the REPL
    script: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            let _ = err.print();
            return;
        }
        Err(_) => {
            eprintln!("Usage: flint [script]");
            process::exit(EX_USAGE);
        }
    };

    match cli.script {
        Some(path) => run_file(&path),
        None => run_repl(),
    }
}

fn run_file(path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!(
                "{} could not read '{}': {}",
                "Error:".bright_red(),
                path.display(),
                err
            );
            process::exit(EX_NOINPUT);
        }
    };

    let mut vm = Vm::new();
    if let Err(err) = vm.interpret(&source) {
        process::exit(err.exit_code());
    }
}

fn run_repl() {
    match Repl::new() {
        Ok(mut repl) => {
            if let Err(err) = repl.run() {
                eprintln!("{} {}", "REPL error:".bright_red(), err);
                process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("{} {}", "Failed to start REPL:".bright_red(), err);
            process::exit(1);
        }
    }
}
