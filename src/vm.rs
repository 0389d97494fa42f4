// File: src/vm.rs
//
// The Flint virtual machine: a stack machine over the bytecode the compiler
// emits. One `Vm` owns the value stack, the call-frame stack, the globals
// table, the open-upvalue list, and the garbage-collected heap; every
// allocation and collection runs through it so the collector always sees the
// full root set.

use std::env;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use once_cell::sync::Lazy;

use crate::bytecode::{Chunk, OpCode};
use crate::compiler;
use crate::debug;
use crate::errors::InterpretError;
use crate::memory::Heap;
use crate::object::{
    hash_string, NativeFn, ObjClosure, ObjFunction, ObjKind, ObjNative, ObjRef, ObjStr,
    ObjUpvalue,
};
use crate::table::Table;
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Disassemble and dump each instruction as it executes.
static TRACE_EXEC: Lazy<bool> = Lazy::new(|| env::var("FLINT_TRACE_EXEC").is_ok());

/// Execution context for one closure invocation. `slots` is the frame's base
/// in the value stack: slot 0 holds the called value, arguments and locals
/// follow.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues sorted by descending stack slot.
    open_upvalues: Option<ObjRef>,
    pub(crate) heap: Heap,
    /// Which global names were declared with `val`; persists across REPL
    /// lines so reassignment stays a compile error.
    global_vals: AHashMap<String, bool>,
    /// Interned ahead of method syntax, as the heap expects a rooted "init".
    init_string: Option<ObjRef>,
    writer: Box<dyn Write>,
}

macro_rules! binary_op {
    ($vm:expr, $wrap:path, $op:tt) => {{
        if !$vm.peek(0).is_number() || !$vm.peek(1).is_number() {
            return Err($vm.runtime_error("Operands must be numbers."));
        }
        let b = $vm.pop().as_number().expect("operand checked");
        let a = $vm.pop().as_number().expect("operand checked");
        $vm.push($wrap(a $op b)).map_err(|msg| $vm.runtime_error(&msg))?;
    }};
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// A VM that prints to the given sink instead of stdout.
    pub fn with_output(writer: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            heap: Heap::new(),
            global_vals: AHashMap::new(),
            init_string: None,
            writer,
        };
        let init = vm.intern("init");
        vm.init_string = Some(init);
        vm.define_native("clock", 0, native_clock);
        vm
    }

    /// Compiles and runs one source unit. The heap and globals survive both
    /// kinds of failure, so a REPL can keep feeding lines in.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let protect_mark = self.heap.protected_len();
        let Some(function) = compiler::compile(source, self) else {
            self.heap.truncate_protected(protect_mark);
            return Err(InterpretError::Compile);
        };

        // Root the script function before wrapping it; allocating the
        // closure may collect.
        self.push(Value::Obj(function)).map_err(|msg| self.runtime_error(&msg))?;
        let closure =
            self.allocate(ObjKind::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.heap.truncate_protected(protect_mark);
        self.pop();
        self.push(Value::Obj(closure)).map_err(|msg| self.runtime_error(&msg))?;
        self.call(closure, 0).map_err(|msg| self.runtime_error(&msg))?;
        self.run()
    }

    // ------------------------------------------------------------------
    // Allocation and interning

    /// Single choke point for object allocation: collects first when the
    /// heap wants it, so every new object is born into a freshly swept heap.
    pub(crate) fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        if self.heap.wants_gc(&kind) {
            self.collect_garbage();
        }
        self.heap.allocate(kind)
    }

    /// Interns a copy of `s`, returning the canonical string object.
    pub(crate) fn intern(&mut self, s: &str) -> ObjRef {
        let hash = hash_string(s);
        if let Some(existing) = self.heap.strings.find_string(s, hash) {
            return existing;
        }
        let obj = self.allocate(ObjKind::Str(ObjStr { chars: s.into(), hash }));
        self.heap.strings.set(obj, Value::Nil);
        obj
    }

    /// Interning entry point that consumes an owned buffer (concatenation
    /// results); on an intern hit the buffer is simply dropped.
    pub(crate) fn take_string(&mut self, s: String) -> ObjRef {
        let hash = hash_string(&s);
        if let Some(existing) = self.heap.strings.find_string(&s, hash) {
            return existing;
        }
        let obj = self.allocate(ObjKind::Str(ObjStr { chars: s.into_boxed_str(), hash }));
        self.heap.strings.set(obj, Value::Nil);
        obj
    }

    pub(crate) fn alloc_function(&mut self, function: ObjFunction) -> ObjRef {
        self.allocate(ObjKind::Function(function))
    }

    pub(crate) fn protect(&mut self, value: Value) {
        self.heap.protect(value);
    }

    pub(crate) fn define_global_const(&mut self, name: &str, is_const: bool) {
        self.global_vals.insert(name.to_owned(), is_const);
    }

    pub(crate) fn global_is_val(&self, name: &str) -> bool {
        self.global_vals.get(name).copied().unwrap_or(false)
    }

    fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let mark = self.heap.protected_len();
        let name_obj = self.intern(name);
        self.heap.protect(Value::Obj(name_obj));
        let native = self.allocate(ObjKind::Native(ObjNative { arity, function }));
        self.globals.set(name_obj, Value::Obj(native));
        self.heap.truncate_protected(mark);
    }

    // ------------------------------------------------------------------
    // Garbage collection roots

    /// Full collection cycle: mark the VM roots, trace, weak-sweep the
    /// intern set, sweep.
    pub(crate) fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(obj) = upvalue {
            self.heap.mark_object(obj);
            upvalue = obj.as_upvalue().next_open;
        }
        self.heap.mark_table(&self.globals);
        if let Some(init) = self.init_string {
            self.heap.mark_object(init);
        }
        self.heap.mark_protected();

        self.heap.trace_references();
        self.heap.sweep_interned();
        self.heap.sweep();
    }

    // ------------------------------------------------------------------
    // Stack and frame plumbing

    fn push(&mut self, value: Value) -> Result<(), String> {
        if self.stack.len() == STACK_MAX {
            return Err("Stack overflow.".to_owned());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let closure = frame.closure;
        let ip = frame.ip;
        frame.ip += 1;
        closure.as_closure().function.as_function().chunk.code[ip]
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let closure = self.frame().closure;
        closure.as_closure().function.as_function().chunk.constants[index]
    }

    fn read_constant_long(&mut self) -> Value {
        let lo = self.read_byte() as usize;
        let mid = self.read_byte() as usize;
        let hi = self.read_byte() as usize;
        let index = lo | (mid << 8) | (hi << 16);
        let closure = self.frame().closure;
        closure.as_closure().function.as_function().chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_string().expect("constant is an interned name")
    }

    /// Reports a runtime error: the message, then the call stack innermost
    /// first. Resets the stacks so the VM stays usable; heap and globals are
    /// untouched.
    fn runtime_error(&mut self, message: &str) -> InterpretError {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let closure = frame.closure;
            let function = closure.as_closure().function;
            let function = function.as_function();
            let line = function.chunk.line_of(frame.ip.saturating_sub(1));
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, name.as_str().chars),
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        InterpretError::Runtime
    }

    // ------------------------------------------------------------------
    // Calls and upvalues

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), String> {
        if let Value::Obj(obj) = callee {
            match &obj.kind {
                ObjKind::Closure(_) => return self.call(obj, arg_count),
                ObjKind::Native(native) => {
                    if arg_count != native.arity {
                        return Err(format!(
                            "Expected {} arguments but got {}.",
                            native.arity, arg_count
                        ));
                    }
                    let start = self.stack.len() - arg_count as usize;
                    let result = (native.function)(&self.stack[start..])?;
                    // Discard the arguments and the callee itself.
                    self.stack.truncate(start - 1);
                    return self.push(result);
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_owned())
    }

    fn call(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), String> {
        let arity = closure.as_closure().function.as_function().arity;
        if arg_count != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, arg_count));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_owned());
        }
        let slots = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    /// Finds or creates the open upvalue for a stack slot, keeping the list
    /// sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.open_upvalues;
        while let Some(obj) = cursor {
            match obj.as_upvalue().location {
                Some(existing) if existing > slot => {
                    prev = Some(obj);
                    cursor = obj.as_upvalue().next_open;
                }
                _ => break,
            }
        }
        if let Some(obj) = cursor {
            if obj.as_upvalue().location == Some(slot) {
                return obj;
            }
        }

        let created = self.allocate(ObjKind::Upvalue(ObjUpvalue {
            location: Some(slot),
            closed: Value::Nil,
            next_open: cursor,
        }));
        match prev {
            Some(mut prev) => prev.as_upvalue_mut().next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `last`: the stacked value moves
    /// into the upvalue and the location is rebound to it.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(mut obj) = self.open_upvalues {
            let Some(slot) = obj.as_upvalue().location else { break };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            let upvalue = obj.as_upvalue_mut();
            upvalue.closed = value;
            upvalue.location = None;
            self.open_upvalues = upvalue.next_open;
        }
    }

    // ------------------------------------------------------------------
    // Dispatch

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            if *TRACE_EXEC {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = OpCode::try_from(byte)
                .map_err(|_| self.runtime_error(&format!("Unknown opcode {}.", byte)))?;

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant).map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::ConstantLong => {
                    let constant = self.read_constant_long();
                    self.push(constant).map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::Nil => self.push(Value::Nil).map_err(|msg| self.runtime_error(&msg))?,
                OpCode::True => {
                    self.push(Value::Bool(true)).map_err(|msg| self.runtime_error(&msg))?
                }
                OpCode::False => {
                    self.push(Value::Bool(false)).map_err(|msg| self.runtime_error(&msg))?
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value).map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => {
                            self.push(value).map_err(|msg| self.runtime_error(&msg))?
                        }
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", name.as_str().chars);
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        // The key did not exist; undo the insert and report.
                        self.globals.delete(name);
                        let message = format!("Undefined variable '{}'.", name.as_str().chars);
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = closure.as_closure().upvalues[index];
                    let value = match upvalue.as_upvalue().location {
                        Some(slot) => self.stack[slot],
                        None => upvalue.as_upvalue().closed,
                    };
                    self.push(value).map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    let mut upvalue = closure.as_closure().upvalues[index];
                    match upvalue.as_upvalue().location {
                        Some(slot) => self.stack[slot] = value,
                        None => upvalue.as_upvalue_mut().closed = value,
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(&b)))
                        .map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::Greater => binary_op!(self, Value::Bool, >),
                OpCode::Less => binary_op!(self, Value::Bool, <),
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Some(a_obj), Some(b_obj)) = (a.as_string(), b.as_string()) {
                        // Operands stay on the stack while the result is
                        // allocated, so a collection here cannot free them.
                        let combined =
                            format!("{}{}", a_obj.as_str().chars, b_obj.as_str().chars);
                        let result = self.take_string(combined);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result))
                            .map_err(|msg| self.runtime_error(&msg))?;
                    } else if let (Value::Number(a), Value::Number(b)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b))
                            .map_err(|msg| self.runtime_error(&msg))?;
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                OpCode::Subtract => binary_op!(self, Value::Number, -),
                OpCode::Multiply => binary_op!(self, Value::Number, *),
                OpCode::Divide => binary_op!(self, Value::Number, /),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))
                        .map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n)).map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.writer, "{}", value);
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    // Peek: the condition stays for the compiler's pops.
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }
                OpCode::Case => {
                    let offset = self.read_short() as usize;
                    let test = self.peek(0);
                    let switch_value = self.peek(1);
                    if test.equals(&switch_value) {
                        // Enter the case body with both gone; the body's end
                        // jump skips the switch's final pop.
                        self.pop();
                        self.pop();
                    } else {
                        self.pop();
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)
                        .map_err(|msg| self.runtime_error(&msg))?;
                }
                OpCode::Closure => {
                    let function =
                        self.read_constant().as_obj().expect("closure operand is a function");
                    let upvalue_count = function.as_function().upvalue_count;
                    let mut closure = self.allocate(ObjKind::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure)).map_err(|msg| self.runtime_error(&msg))?;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            let enclosing = self.frame().closure;
                            enclosing.as_closure().upvalues[index]
                        };
                        closure.as_closure_mut().upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Discard the script closure and halt.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result).map_err(|msg| self.runtime_error(&msg))?;
                }
            }
        }
    }

    fn trace_instruction(&self) {
        let mut stack_line = String::from("          ");
        for value in &self.stack {
            stack_line.push_str(&format!("[ {} ]", value));
        }
        eprintln!("{}", stack_line);

        let frame = self.frame();
        let ip = frame.ip;
        let closure = frame.closure;
        let function = closure.as_closure().function;
        let chunk: &Chunk = &function.as_function().chunk;
        eprint!("{}", debug::disassemble_instruction(chunk, ip));
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "Clock went backwards.".to_owned())?;
    Ok(Value::Number(now.as_secs_f64()))
}
