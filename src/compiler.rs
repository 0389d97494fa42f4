// File: src/compiler.rs
//
// Single-pass bytecode compiler for Flint: a recursive-descent statement
// parser around a Pratt expression parser. Tokens stream straight from the
// scanner into emitted bytecode; there is no AST. Nested function
// declarations push a fresh compiler state, so the enclosing chain needed
// for upvalue resolution is just the state stack.

use std::env;

use once_cell::sync::Lazy;

use crate::bytecode::{Chunk, OpCode};
use crate::debug;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::{ObjFunction, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// Dump each function's bytecode after it compiles.
static PRINT_CODE: Lazy<bool> = Lazy::new(|| env::var("FLINT_PRINT_CODE").is_ok());

/// Slot operands are single bytes, so a function sees at most 256 locals
/// (slot 0 is reserved for the callee).
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compiles a source string into the top-level script function. Returns
/// `None` when any compile error was reported; the VM is untouched in that
/// case. Objects created along the way stay on the heap's protect stack
/// until the caller roots the result.
pub fn compile(source: &str, vm: &mut Vm) -> Option<ObjRef> {
    let mut parser = Parser::new(source, vm);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    if parser.had_error {
        None
    } else {
        Some(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Parser<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

#[derive(Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// One loop frame so `continue` can find the right jump target and pop the
/// locals the loop body introduced.
struct LoopContext {
    start: usize,
    scope_depth: i32,
}

#[derive(PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// Per-function compiler state. The innermost function under compilation is
/// the last element of the parser's state stack.
struct CompilerState<'src> {
    kind: FunctionKind,
    name: Option<ObjRef>,
    chunk: Chunk,
    arity: u8,
    upvalues: Vec<CompilerUpvalue>,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    loops: Vec<LoopContext>,
}

impl<'src> CompilerState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        CompilerState {
            kind,
            name,
            chunk: Chunk::new(),
            arity: 0,
            upvalues: Vec::new(),
            // Slot 0 holds the called value for the frame's lifetime.
            locals: vec![Local { name: "", depth: 0, is_const: false, is_captured: false }],
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct Parser<'src, 'vm> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    vm: &'vm mut Vm,
    states: Vec<CompilerState<'src>>,
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(source: &'src str, vm: &'vm mut Vm) -> Self {
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            had_error: false,
            panic_mode: false,
            vm,
            states: vec![CompilerState::new(FunctionKind::Script, None)],
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        // Panic mode suppresses cascades until the next synchronization
        // point.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        eprintln!("[line {}] Error{}: {}", token.line, location, message);
    }

    /// Skips forward to a statement boundary after an error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Val
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Case
                | TokenKind::Default => return,
                _ => self.advance(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Emission

    fn state(&self) -> &CompilerState<'src> {
        self.states.last().expect("compiler state stack is never empty")
    }

    fn state_mut(&mut self) -> &mut CompilerState<'src> {
        self.states.last_mut().expect("compiler state stack is never empty")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.state_mut().chunk.write_op(op, line);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        self.emit_ops(OpCode::Nil, OpCode::Return);
    }

    /// Loads a value through the constant pool, switching to the 24-bit form
    /// automatically when the pool outgrows a byte index.
    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        self.state_mut().chunk.write_constant(value, line);
    }

    /// Pool index for operands that must fit in one byte (names, closures).
    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.state_mut().chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    /// Emits a jump with a two-byte placeholder and returns the placeholder
    /// offset for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.state().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 skips over the placeholder itself.
        let jump = self.state().chunk.code.len() - offset - 2;
        if jump > i16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.state_mut().chunk.code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.state().chunk.code.len() - loop_start + 2;
        if offset > i16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Interns a string and pins it on the heap's protect stack: constant
    /// pools are not GC roots until their function object exists.
    fn intern(&mut self, s: &str) -> ObjRef {
        let obj = self.vm.intern(s);
        self.vm.protect(Value::Obj(obj));
        obj
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.intern(name);
        self.make_constant(Value::Obj(obj))
    }

    /// Finishes the innermost function: emits the implicit return, pops its
    /// state, and allocates the function object (kept protected for the
    /// caller). Returns the upvalue list so `function()` can emit the pairs.
    fn end_compiler(&mut self) -> (ObjRef, Vec<CompilerUpvalue>) {
        self.emit_return();
        let state = self.states.pop().expect("compiler state stack is never empty");
        let upvalues = state.upvalues;
        let function = self.vm.alloc_function(ObjFunction {
            arity: state.arity,
            upvalue_count: upvalues.len(),
            chunk: state.chunk,
            name: state.name,
        });
        self.vm.protect(Value::Obj(function));

        if *PRINT_CODE && !self.had_error {
            let fun = function.as_function();
            let name = match fun.name {
                Some(name) => name.as_str().chars.to_string(),
                None => "<script>".to_string(),
            };
            eprint!("{}", debug::disassemble_chunk(&fun.chunk, &name));
        }
        (function, upvalues)
    }

    // ------------------------------------------------------------------
    // Scopes and variables

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Discards the scope's locals in declaration-reverse order, closing any
    /// that a closure captured.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            let captured = match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => local.is_captured,
                _ => break,
            };
            self.emit_op(if captured { OpCode::CloseUpvalue } else { OpCode::Pop });
            self.state_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str, is_const: bool) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local { name, depth: -1, is_const, is_captured: false });
    }

    fn declare_variable(&mut self, is_const: bool) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self.state();
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, is_const);
    }

    fn parse_variable(&mut self, message: &str, is_const: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(is_const);
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8, name: &str, is_const: bool) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        // Global constness lives in a VM-side registry so later REPL lines
        // still see it.
        self.vm.define_global_const(name, is_const);
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Looks `name` up in a state's locals. Errors on reads of a local whose
    /// initializer is still being compiled.
    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<(u8, bool)> {
        let state = &self.states[state_index];
        let found = state
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(i, local)| (i as u8, local.is_const, local.depth == -1));
        let (slot, is_const, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some((slot, is_const))
    }

    /// Walks outward through the enclosing compiler states, threading the
    /// capture through each intermediate function.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        if let Some((local, _)) = self.resolve_local(state_index - 1, name) {
            self.states[state_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, name) {
            return Some(self.add_upvalue(state_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalue = CompilerUpvalue { index, is_local };
        if let Some(existing) =
            self.states[state_index].upvalues.iter().position(|u| *u == upvalue)
        {
            return existing as u8;
        }
        if self.states[state_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let upvalues = &mut self.states[state_index].upvalues;
        upvalues.push(upvalue);
        (upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.states.len() - 1;
        let (get_op, set_op, arg, is_const) = if let Some((slot, is_const)) =
            self.resolve_local(top, name)
        {
            (OpCode::GetLocal, OpCode::SetLocal, slot, is_const)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index, false)
        } else {
            let arg = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, arg, self.vm.global_is_val(name))
        };

        if can_assign && self.matches(TokenKind::Equal) {
            if is_const {
                self.error("Cannot assign to a val variable.");
            }
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("token with a precedence always has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'vm> {
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'vm>>,
            Option<ParseFn<'src, 'vm>>,
            Precedence,
        ) = match kind {
            TokenKind::LeftParen => {
                (Some(Self::grouping), Some(Self::call), Precedence::Call)
            }
            TokenKind::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => {
                (None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::Bang => (Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => {
                (None, Some(Self::binary), Precedence::Equality)
            }
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => (None, Some(Self::binary), Precedence::Comparison),
            TokenKind::Identifier => (Some(Self::variable), None, Precedence::None),
            TokenKind::String => (Some(Self::string), None, Precedence::None),
            TokenKind::Number => (Some(Self::number), None, Precedence::None),
            TokenKind::And => (None, Some(Self::and_), Precedence::And),
            TokenKind::Or => (None, Some(Self::or_), Precedence::Or),
            TokenKind::False | TokenKind::True | TokenKind::Nil => {
                (Some(Self::literal), None, Precedence::None)
            }
            _ => (None, None, Precedence::None),
        };
        ParseRule { prefix, infix, precedence }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        // Trim the surrounding quotes; the language has no escape sequences.
        let obj = self.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    // ------------------------------------------------------------------
    // Declarations and statements

    fn declaration(&mut self) {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Val) {
            self.var_declaration(true);
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        let global = self.parse_variable("Expect variable name.", is_const);
        let name = self.previous.lexeme;

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, name, is_const);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", false);
        let name = self.previous.lexeme;
        // Functions may refer to themselves; the name is usable immediately.
        self.mark_initialized();
        self.function(name);
        self.define_variable(global, name, false);
    }

    fn function(&mut self, name: &str) {
        let name_obj = self.intern(name);
        self.states.push(CompilerState::new(FunctionKind::Function, Some(name_obj)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.", false);
                let param = self.previous.lexeme;
                self.define_variable(constant, param, false);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the frame teardown discards the function's locals.
        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.state().chunk.code.len();
        let scope_depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext { start: loop_start, scope_depth });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        self.state_mut().loops.pop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Val) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state().chunk.code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // Body first, then the increment; the loop op after the
            // increment closes the circle back to the condition.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext { start: loop_start, scope_depth });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.state_mut().loops.pop();
        self.end_scope();
    }

    fn continue_statement(&mut self) {
        if self.state().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");

        let state = self.state();
        let last_loop = state.loops.last().expect("loop stack checked above");
        let loop_start = last_loop.start;
        let loop_depth = last_loop.scope_depth;
        // Locals declared inside the loop body are still on the stack; pop
        // them before jumping back.
        let pops = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop);
        }
        self.emit_loop(loop_start);
    }

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression in switch.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        let mut end_jumps = Vec::new();
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case) {
                end_jumps.push(self.case_statement());
            } else if self.matches(TokenKind::Default) {
                if seen_default {
                    self.error("Can't have more than one default case.");
                }
                seen_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after default.");
                self.statement();
                self.require_case_boundary();
            } else {
                self.error_at_current("Expect 'case' or 'default' in switch statement.");
                while !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                    && !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                {
                    self.advance();
                }
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");
        // No case matched: the switch value is still here.
        self.emit_op(OpCode::Pop);

        for end_jump in end_jumps {
            self.patch_jump(end_jump);
        }
    }

    /// One `case expr: stmt`. Returns the end-jump offset that the switch
    /// patches past its final pop.
    fn case_statement(&mut self) -> usize {
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after expression in case statement.");
        let next_case = self.emit_jump(OpCode::Case);
        self.statement();
        self.require_case_boundary();
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(next_case);
        end_jump
    }

    fn require_case_boundary(&mut self) {
        if !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
        {
            self.error_at_current("Expect block. use '{' and '}' for block statement.");
        }
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjKind;

    fn compile_source(source: &str) -> (Vm, Option<ObjRef>) {
        let mut vm = Vm::new();
        let function = compile(source, &mut vm);
        (vm, function)
    }

    fn script_code(function: ObjRef) -> Vec<u8> {
        function.as_function().chunk.code.clone()
    }

    #[test]
    fn compiles_arithmetic_with_precedence() {
        let (_vm, function) = compile_source("print 1 + 2 * 3;");
        let code = script_code(function.expect("compiles"));
        let expected: Vec<u8> = vec![
            OpCode::Constant.into(),
            0,
            OpCode::Constant.into(),
            1,
            OpCode::Constant.into(),
            2,
            OpCode::Multiply.into(),
            OpCode::Add.into(),
            OpCode::Print.into(),
            OpCode::Nil.into(),
            OpCode::Return.into(),
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn comparison_operators_lower_to_the_consistent_pairs() {
        let (_vm, function) = compile_source("print 1 <= 2;");
        let code = script_code(function.expect("compiles"));
        assert_eq!(
            &code[4..6],
            &[u8::from(OpCode::Greater), u8::from(OpCode::Not)]
        );

        let (_vm, function) = compile_source("print 1 >= 2;");
        let code = script_code(function.expect("compiles"));
        assert_eq!(&code[4..6], &[u8::from(OpCode::Less), u8::from(OpCode::Not)]);
    }

    #[test]
    fn assigning_a_val_local_is_a_compile_error() {
        let (_vm, function) = compile_source("{ val x = 1; x = 2; }");
        assert!(function.is_none());
    }

    #[test]
    fn assigning_a_val_global_is_a_compile_error() {
        let (_vm, function) = compile_source("val x = 1; x = 2;");
        assert!(function.is_none());
    }

    #[test]
    fn vals_can_be_read_freely() {
        let (_vm, function) = compile_source("val x = 1; print x + 1;");
        assert!(function.is_some());
    }

    #[test]
    fn continue_outside_a_loop_is_a_compile_error() {
        let (_vm, function) = compile_source("continue;");
        assert!(function.is_none());
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_fails() {
        let (_vm, function) = compile_source("{ var a = a; }");
        assert!(function.is_none());
    }

    #[test]
    fn redeclaring_in_the_same_scope_fails() {
        let (_vm, function) = compile_source("{ var a = 1; var a = 2; }");
        assert!(function.is_none());
    }

    #[test]
    fn invalid_assignment_target_is_reported() {
        let (_vm, function) = compile_source("1 + 2 = 3;");
        assert!(function.is_none());
    }

    #[test]
    fn top_level_return_is_rejected() {
        let (_vm, function) = compile_source("return 1;");
        assert!(function.is_none());
    }

    #[test]
    fn switch_allows_at_most_one_default() {
        let (_vm, function) =
            compile_source("switch (1) { default: {} default: {} }");
        assert!(function.is_none());
    }

    #[test]
    fn closures_record_their_captured_upvalues() {
        let (_vm, function) = compile_source(
            "fun outer() { var x = 1; fun inner() { print x; } inner(); }",
        );
        let script = function.expect("compiles");
        let outer = script
            .as_function()
            .chunk
            .constants
            .iter()
            .find_map(|v| {
                v.as_obj().filter(|o| matches!(o.kind, ObjKind::Function(_)))
            })
            .expect("outer function constant");
        let inner = outer
            .as_function()
            .chunk
            .constants
            .iter()
            .find_map(|v| {
                v.as_obj().filter(|o| matches!(o.kind, ObjKind::Function(_)))
            })
            .expect("inner function constant");
        assert_eq!(inner.as_function().upvalue_count, 1);
        assert_eq!(outer.as_function().upvalue_count, 0);
    }

    #[test]
    fn jump_if_false_operand_skips_the_then_branch() {
        let (_vm, function) = compile_source("if (false) print 1;");
        let code = script_code(function.expect("compiles"));
        assert_eq!(code[0], u8::from(OpCode::False));
        assert_eq!(code[1], u8::from(OpCode::JumpIfFalse));
        let delta = u16::from_be_bytes([code[2], code[3]]) as usize;
        // Lands on the pop that discards the condition on the else path.
        assert_eq!(code[4 + delta], u8::from(OpCode::Pop));
        // Forward jumps are non-negative and bounded.
        assert!(delta <= i16::MAX as usize);
    }

    #[test]
    fn while_loop_emits_a_positive_backward_delta() {
        let (_vm, function) = compile_source("while (false) {}");
        let code = script_code(function.expect("compiles"));
        let loop_at = code
            .iter()
            .position(|b| *b == u8::from(OpCode::Loop))
            .expect("loop opcode");
        let delta = u16::from_be_bytes([code[loop_at + 1], code[loop_at + 2]]) as usize;
        assert!(delta > 0);
        // The loop lands back on the condition at offset 0.
        assert_eq!(loop_at + 3 - delta, 0);
    }
}
