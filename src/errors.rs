// File: src/errors.rs
//
// Interpretation outcomes and the conventional sysexits-style codes the CLI
// maps them to. Diagnostics themselves are printed where they happen (the
// compiler writes `[line N] Error ...` lines, the VM writes the message and
// stack trace); this module only carries the outcome back to the host.

use thiserror::Error;

/// Exit code for bad command-line usage.
pub const EX_USAGE: i32 = 64;
/// Exit code when the script file cannot be read.
pub const EX_NOINPUT: i32 = 74;

/// Why `interpret` did not finish normally. Compile errors leave the VM
/// untouched; runtime errors reset the stacks but keep heap and globals, so
/// a REPL can keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error("runtime error")]
    Runtime,
}

impl InterpretError {
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretError::Compile => 65,
            InterpretError::Runtime => 70,
        }
    }
}
