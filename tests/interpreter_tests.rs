// Integration tests for the Flint interpreter
//
// These tests run complete Flint programs through the compiler and VM and
// check what they print or how they fail. Tests cover:
// - Arithmetic and operator precedence
// - Variable scoping and shadowing
// - val/var declaration semantics
// - Control flow (if/else, while, for, continue, switch)
// - Functions, closures, and upvalues
// - String interning and concatenation
// - Runtime error outcomes and REPL-style persistence

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use flint::errors::InterpretError;
use flint::vm::Vm;

#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedOutput {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn run_program(source: &str) -> (Result<(), InterpretError>, String) {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    let result = vm.interpret(source);
    (result, output.contents())
}

fn expect_output(source: &str, expected: &str) {
    let (result, output) = run_program(source);
    assert_eq!(result, Ok(()), "program failed: {:?}", result);
    assert_eq!(output, expected);
}

#[test]
fn test_arithmetic_precedence() {
    expect_output("print 1 + 2 * 3;", "7\n");
    expect_output("print (1 + 2) * 3;", "9\n");
    expect_output("print 10 / 4;", "2.5\n");
    expect_output("print -3 + 1;", "-2\n");
    expect_output("print !(1 == 2);", "true\n");
}

#[test]
fn test_comparison_operators() {
    expect_output("print 1 < 3;", "true\n");
    expect_output("print 3 < 3;", "false\n");
    expect_output("print 3 <= 3;", "true\n");
    expect_output("print 4 > 3;", "true\n");
    expect_output("print 3 >= 4;", "false\n");
    expect_output("print 1 != 2;", "true\n");
}

#[test]
fn test_block_shadowing() {
    expect_output("var a = 1; { var a = 2; print a; } print a;", "2\n1\n");
}

#[test]
fn test_closure_returns_captured_argument() {
    expect_output(
        "fun make(x){ fun inner(){ return x; } return inner; } print make(42)();",
        "42\n",
    );
}

#[test]
fn test_val_reassignment_is_a_compile_error() {
    let (result, _) = run_program("val x = 1; x = 2;");
    assert_eq!(result, Err(InterpretError::Compile));
    assert_eq!(InterpretError::Compile.exit_code(), 65);
}

#[test]
fn test_for_loop_prints_each_index() {
    expect_output("for (var i = 0; i < 3; i = i + 1) print i;", "0\n1\n2\n");
}

#[test]
fn test_continue_skips_the_matching_iteration() {
    expect_output(
        "var s = \"\"; \
         for (var i = 0; i < 5; i = i + 1) { if (i == 2) continue; s = s + \"x\"; } \
         print s;",
        "xxxx\n",
    );
}

#[test]
fn test_nested_loops_continue_targets_the_inner_loop() {
    expect_output(
        "var s = \"\"; \
         for (var i = 0; i < 2; i = i + 1) { \
             for (var j = 0; j < 3; j = j + 1) { \
                 if (j == 1) continue; \
                 s = s + \"x\"; \
             } \
             s = s + \"|\"; \
         } \
         print s;",
        "xx|xx|\n",
    );
}

#[test]
fn test_while_loop_with_condition_mutation() {
    expect_output("var n = 3; while (n > 0) { print n; n = n - 1; }", "3\n2\n1\n");
}

#[test]
fn test_if_else_branches() {
    expect_output("if (1 < 2) print \"yes\"; else print \"no\";", "yes\n");
    expect_output("if (1 > 2) print \"yes\"; else print \"no\";", "no\n");
}

#[test]
fn test_logical_operators_short_circuit() {
    // `and`/`or` evaluate to an operand, not a boolean.
    expect_output("print 1 and 2;", "2\n");
    expect_output("print nil and 2;", "nil\n");
    expect_output("print nil or 2;", "2\n");
    expect_output("print 1 or 2;", "1\n");
}

#[test]
fn test_switch_selects_single_case() {
    expect_output(
        "switch (1 + 1) { \
             case 1: print \"one\"; \
             case 2: print \"two\"; \
             case 3: print \"three\"; \
             default: print \"other\"; \
         }",
        "two\n",
    );
}

#[test]
fn test_switch_on_strings() {
    expect_output(
        "val word = \"b\"; \
         switch (word) { \
             case \"a\": print 1; \
             case \"b\": print 2; \
         }",
        "2\n",
    );
}

#[test]
fn test_string_concatenation_and_interning() {
    expect_output("print \"a\" + \"b\";", "ab\n");
    // Interning makes pointer equality hold for equal contents.
    expect_output("print \"a\" + \"b\" == \"ab\";", "true\n");
}

#[test]
fn test_number_printing_matches_shortest_form() {
    expect_output("print 2.5;", "2.5\n");
    expect_output("print 4 / 2;", "2\n");
    expect_output("print 0;", "0\n");
}

#[test]
fn test_functions_print_by_name() {
    expect_output("fun greet() {} print greet;", "<fn greet>\n");
    expect_output("print clock;", "<native fn>\n");
}

#[test]
fn test_recursive_function() {
    expect_output(
        "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);",
        "55\n",
    );
}

#[test]
fn test_runtime_error_outcome_and_exit_code() {
    let (result, _) = run_program("print 1 + nil;");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(InterpretError::Runtime.exit_code(), 70);
}

#[test]
fn test_heap_and_globals_persist_like_a_repl_session() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));

    vm.interpret("var total = 0;").unwrap();
    vm.interpret("fun bump(n) { total = total + n; }").unwrap();
    vm.interpret("bump(3); bump(4);").unwrap();
    assert!(vm.interpret("oops;").is_err());
    vm.interpret("print total;").unwrap();

    assert_eq!(output.contents(), "7\n");
}

#[test]
fn test_closures_over_loop_variable_close_at_scope_exit() {
    expect_output(
        "var f; \
         for (var i = 0; i < 3; i = i + 1) { \
             if (i == 1) { fun cap() { return i; } f = cap; } \
         } \
         print f();",
        "3\n",
    );
}

#[test]
fn test_gc_pressure_during_long_concatenation() {
    expect_output(
        "var acc = \"\"; \
         for (var i = 0; i < 600; i = i + 1) { acc = acc + \"garbage-run \"; } \
         print \"survived\";",
        "survived\n",
    );
}
