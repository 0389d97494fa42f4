// File: src/repl.rs
//
// Interactive REPL for Flint. One VM lives for the whole session, so
// globals, interned strings, and the heap persist from line to line; errors
// are reported and the loop keeps going. The session ends on EOF or a line
// starting with "exit".

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    /// Runs the read-eval-print loop until EOF or "exit".
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            match self.editor.readline("> ") {
                Ok(line) => {
                    if line.starts_with("exit") {
                        break;
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line.as_str());
                    // Errors were already printed; the session continues.
                    let _ = self.vm.interpret(&line);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }
        Ok(())
    }
}
