// File: src/object.rs
//
// Heap object model. Every object carries a shared header (mark flag and the
// intrusive `next` link the sweeper walks) in front of a tagged payload.
// `ObjRef` is the copyable handle the rest of the VM passes around; objects
// never move once allocated, so handles stay valid for the object's lifetime.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::bytecode::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object. Copyable; compares by pointer identity.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    pub(crate) fn new(ptr: NonNull<Obj>) -> Self {
        ObjRef(ptr)
    }

    pub(crate) fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }
}

impl Deref for ObjRef {
    type Target = Obj;

    fn deref(&self) -> &Obj {
        // Objects are only freed by the sweeper, which never runs while a
        // reachable handle is held.
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for ObjRef {
    fn deref_mut(&mut self) -> &mut Obj {
        unsafe { self.0.as_mut() }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjRef({})", **self)
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", **self)
    }
}

/// Common header plus tagged payload.
pub struct Obj {
    pub marked: bool,
    pub next: Option<ObjRef>,
    pub kind: ObjKind,
}

pub enum ObjKind {
    Str(ObjStr),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// Interned immutable string with its cached FNV-1a hash.
pub struct ObjStr {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: bytecode chunk, arity, and upvalue count. The
/// top-level script is a nameless function of arity 0.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub arity: u8,
    pub function: NativeFn,
}

/// A function bound with its captured upvalues.
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open while the enclosing frame is live (`location`
/// indexes the value stack); closing copies the stacked value into `closed`
/// and clears `location`.
pub struct ObjUpvalue {
    pub location: Option<usize>,
    pub closed: Value,
    pub next_open: Option<ObjRef>,
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

impl Obj {
    pub fn as_str(&self) -> &ObjStr {
        match &self.kind {
            ObjKind::Str(s) => s,
            _ => panic!("object is not a string"),
        }
    }

    pub fn as_function(&self) -> &ObjFunction {
        match &self.kind {
            ObjKind::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn as_closure(&self) -> &ObjClosure {
        match &self.kind {
            ObjKind::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn as_closure_mut(&mut self) -> &mut ObjClosure {
        match &mut self.kind {
            ObjKind::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn as_upvalue(&self) -> &ObjUpvalue {
        match &self.kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self) -> &mut ObjUpvalue {
        match &mut self.kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn as_class(&self) -> &ObjClass {
        match &self.kind {
            ObjKind::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ObjKind::Str(s) => write!(f, "{}", s.chars),
            ObjKind::Function(fun) => write_function_name(f, fun),
            ObjKind::Native(_) => write!(f, "<native fn>"),
            ObjKind::Closure(c) => write_function_name(f, c.function.as_function()),
            ObjKind::Upvalue(_) => write!(f, "upvalue"),
            ObjKind::Class(c) => write!(f, "{}", c.name.as_str().chars),
            ObjKind::Instance(i) => {
                write!(f, "{} instance", i.class.as_class().name.as_str().chars)
            }
            ObjKind::BoundMethod(b) => {
                write_function_name(f, b.method.as_closure().function.as_function())
            }
        }
    }
}

fn write_function_name(f: &mut fmt::Formatter, fun: &ObjFunction) -> fmt::Result {
    match fun.name {
        Some(name) => write!(f, "<fn {}>", name.as_str().chars),
        None => write!(f, "<script>"),
    }
}

/// 32-bit FNV-1a over the string bytes.
pub fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
