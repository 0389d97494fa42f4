// File: src/memory.rs
//
// Heap and garbage collector. Every object allocation routes through the
// heap so byte accounting stays exact; collection is tricolor mark-sweep
// over the intrusive object list, with the string intern set treated as a
// weak table. The gray worklist is an ordinary Vec and never counts toward
// the GC-managed byte total, so collection cannot re-enter itself.

use std::env;

use once_cell::sync::Lazy;

use crate::object::{Obj, ObjKind, ObjRef};
use crate::table::Table;
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Collect on every allocation; shakes out missing-root bugs.
static STRESS_GC: Lazy<bool> = Lazy::new(|| env::var("FLINT_STRESS_GC").is_ok());
static LOG_GC: Lazy<bool> = Lazy::new(|| env::var("FLINT_LOG_GC").is_ok());

pub struct Heap {
    /// Head of the intrusive list of all live objects.
    objects: Option<ObjRef>,
    /// String intern set. Weak: unmarked keys are dropped before each sweep.
    pub strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    gray_stack: Vec<ObjRef>,
    /// Values the compiler has created but not yet made reachable from a VM
    /// root. Marked as roots; released when compilation hands over.
    protected: Vec<Value>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray_stack: Vec::new(),
            protected: Vec::new(),
        }
    }

    /// True when allocating this object should trigger a collection first.
    pub fn wants_gc(&self, kind: &ObjKind) -> bool {
        *STRESS_GC || self.bytes_allocated + object_size(kind) > self.next_gc
    }

    /// Allocates a new object and prepends it to the object list. Callers
    /// decide whether to collect beforehand (the heap has no view of the VM
    /// roots).
    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        let size = object_size(&kind);
        self.bytes_allocated += size;

        let obj = Box::new(Obj { marked: false, next: self.objects, kind });
        let obj = ObjRef::new(std::ptr::NonNull::from(Box::leak(obj)));
        self.objects = Some(obj);

        if *LOG_GC {
            eprintln!("{:p} allocate {} bytes for {}", obj.as_ptr(), size, kind_name(&obj.kind));
        }
        obj
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn protect(&mut self, value: Value) {
        self.protected.push(value);
    }

    pub fn protected_len(&self) -> usize {
        self.protected.len()
    }

    pub fn truncate_protected(&mut self, len: usize) {
        self.protected.truncate(len);
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, mut obj: ObjRef) {
        if obj.marked {
            return;
        }
        if *LOG_GC {
            eprintln!("{:p} mark {}", obj.as_ptr(), obj);
        }
        obj.marked = true;
        self.gray_stack.push(obj);
    }

    /// Marks every key and value of a strong table (globals, methods).
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    pub fn mark_protected(&mut self) {
        for i in 0..self.protected.len() {
            let value = self.protected[i];
            self.mark_value(value);
        }
    }

    /// Drains the gray worklist, blackening each object by marking what it
    /// references.
    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        if *LOG_GC {
            eprintln!("{:p} blacken {}", obj.as_ptr(), obj);
        }
        match &obj.kind {
            // Strings and natives hold no outgoing references.
            ObjKind::Str(_) | ObjKind::Native(_) => {}
            ObjKind::Upvalue(upvalue) => self.mark_value(upvalue.closed),
            ObjKind::Function(fun) => {
                if let Some(name) = fun.name {
                    self.mark_object(name);
                }
                for i in 0..fun.chunk.constants.len() {
                    self.mark_value(fun.chunk.constants[i]);
                }
            }
            ObjKind::Closure(closure) => {
                self.mark_object(closure.function);
                for i in 0..closure.upvalues.len() {
                    self.mark_object(closure.upvalues[i]);
                }
            }
            ObjKind::Class(class) => {
                self.mark_object(class.name);
                let methods = &class.methods;
                self.mark_table(methods);
            }
            ObjKind::Instance(instance) => {
                self.mark_object(instance.class);
                let fields = &instance.fields;
                self.mark_table(fields);
            }
            ObjKind::BoundMethod(bound) => {
                self.mark_value(bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    /// Weak-table pass: forget interned strings that this cycle did not
    /// mark, so the sweep can free them.
    pub fn sweep_interned(&mut self) {
        self.strings.remove_unmarked();
    }

    /// Walks the object list, unlinking and freeing everything left white
    /// and clearing the mark on survivors. Resets the growth threshold.
    pub fn sweep(&mut self) {
        let before = self.bytes_allocated;

        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.objects;
        while let Some(mut obj) = cursor {
            if obj.marked {
                obj.marked = false;
                prev = Some(obj);
                cursor = obj.next;
            } else {
                cursor = obj.next;
                match prev {
                    Some(mut p) => p.next = cursor,
                    None => self.objects = cursor,
                }
                self.free_object(obj);
            }
        }

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        if *LOG_GC {
            eprintln!(
                "   collected {} bytes (from {} to {}) next at {}",
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn free_object(&mut self, obj: ObjRef) {
        let size = object_size(&obj.kind);
        self.bytes_allocated -= size;
        if *LOG_GC {
            eprintln!("{:p} free {} bytes ({})", obj.as_ptr(), size, kind_name(&obj.kind));
        }
        // Hand the allocation back to a Box so the payload drops normally.
        drop(unsafe { Box::from_raw(obj.as_ptr()) });
    }

    /// Frees every remaining object regardless of reachability.
    pub fn free_objects(&mut self) {
        let mut cursor = self.objects.take();
        while let Some(obj) = cursor {
            cursor = obj.next;
            self.free_object(obj);
        }
        self.strings = Table::new();
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.free_objects();
    }
}

/// Deterministic size estimate for an object; computed identically at
/// allocation and free so the byte counter balances to zero.
fn object_size(kind: &ObjKind) -> usize {
    let payload = match kind {
        ObjKind::Str(s) => s.chars.len(),
        ObjKind::Function(f) => {
            f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        // The upvalue array length is pinned by the function's count even
        // while the VM is still filling it in.
        ObjKind::Closure(c) => {
            c.function.as_function().upvalue_count * std::mem::size_of::<ObjRef>()
        }
        ObjKind::Native(_)
        | ObjKind::Upvalue(_)
        | ObjKind::Class(_)
        | ObjKind::Instance(_)
        | ObjKind::BoundMethod(_) => 0,
    };
    std::mem::size_of::<Obj>() + payload
}

fn kind_name(kind: &ObjKind) -> &'static str {
    match kind {
        ObjKind::Str(_) => "string",
        ObjKind::Function(_) => "function",
        ObjKind::Native(_) => "native",
        ObjKind::Closure(_) => "closure",
        ObjKind::Upvalue(_) => "upvalue",
        ObjKind::Class(_) => "class",
        ObjKind::Instance(_) => "instance",
        ObjKind::BoundMethod(_) => "bound method",
    }
}
