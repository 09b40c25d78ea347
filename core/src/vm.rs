//! The virtual machine.
//!
//! A classic stack machine: one contiguous value stack, a bounded array of
//! call frames, a global table, a sorted list of open upvalues and the
//! garbage-collected heap. Dispatch is a single loop matching on the decoded
//! opcode; every operand is read through the active frame's instruction
//! pointer.
//!
//! Runtime errors print the message and a top-down stack trace to the error
//! sink, reset the stack and surface as [`InterpretError::Runtime`]. The VM
//! is safe to reuse afterwards; the REPL relies on that.

use std::io::{self, Write};
use std::time::Instant;

use smallvec::SmallVec;
use thiserror::Error;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::heap::{Heap, NoRoots, Trace};
use crate::natives::NATIVES;
use crate::object::{
    NativeFn, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative,
    ObjRef, ObjUpvalue,
};
use crate::table::Table;
use crate::value::Value;
use crate::UINT8_COUNT;

/// Maximum call depth. Exceeding it is the "Stack overflow." runtime error.
pub const FRAMES_MAX: usize = 256;
/// Value-stack capacity: every frame can address [`UINT8_COUNT`] slots.
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT;

/// Outcome of [`Vm::interpret`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterpretError {
    /// Diagnostics were written to the error sink; no code ran.
    #[error("compile error")]
    Compile,
    /// Execution aborted; the error and stack trace were written to the
    /// error sink.
    #[error("runtime error")]
    Runtime,
}

/// Internal marker: a runtime error was already reported and the stack was
/// reset.
pub(crate) struct RuntimeAbort;

/// One function invocation: the executing closure, its instruction pointer
/// and the stack slot its locals start at. Slot `base` holds the callee (or
/// the receiver, for method calls).
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

/// The VM's GC root set: everything live on the stack, every frame's
/// closure, all globals, all open upvalues and the interned `"init"` name.
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [ObjRef],
    init_string: ObjRef,
}

impl Trace for VmRoots<'_> {
    fn trace(&self, heap: &mut Heap) {
        for &value in self.stack {
            heap.mark_value(value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for (key, value) in self.globals.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        for &upvalue in self.open_upvalues {
            heap.mark_object(upvalue);
        }
        heap.mark_object(self.init_string);
    }
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues sorted strictly descending by the stack slot they point
    /// at; at most one per slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    start: Instant,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    /// A VM writing program output to stdout and diagnostics to stderr.
    pub fn new() -> Vm {
        Vm::with_io(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// A VM with caller-supplied sinks, used by tests and embedders that
    /// capture output.
    pub fn with_io(out: Box<dyn Write>, err: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern("init", &NoRoots);
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(UINT8_COUNT),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            start: Instant::now(),
            out,
            err,
        };
        for &(name, function) in NATIVES {
            vm.define_native(name, function);
        }
        vm
    }

    /// Compiles and runs `source`. Reusable across calls; on success the
    /// value stack is empty again, on runtime error it has been reset.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        // Compile-time allocations can trigger a collection; everything the
        // VM already holds (globals, natives, the init name) must survive it.
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: self.init_string,
        };
        let Some(function) = compiler::compile(source, &mut self.heap, &mut *self.err, &roots)
        else {
            return Err(InterpretError::Compile);
        };

        // The function rides the stack while its closure is allocated.
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        if self.call_closure(closure, 0).is_err() {
            return Err(InterpretError::Runtime);
        }

        match self.run() {
            Ok(()) => {
                debug_assert!(self.stack.is_empty(), "stack not empty after script");
                Ok(())
            }
            Err(RuntimeAbort) => Err(InterpretError::Runtime),
        }
    }

    // === Accessors used by natives ===

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The toString protocol, exposed to natives and embedders.
    pub fn format_value(&self, value: Value) -> String {
        self.heap.format_value(value)
    }

    pub(crate) fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Interns with the full VM root set, so a collection triggered by the
    /// allocation cannot reap anything the VM still sees.
    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        self.heap.intern(
            text,
            &VmRoots {
                stack: &self.stack,
                frames: &self.frames,
                globals: &self.globals,
                open_upvalues: &self.open_upvalues,
                init_string: self.init_string,
            },
        )
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.heap.alloc(
            obj,
            &VmRoots {
                stack: &self.stack,
                frames: &self.frames,
                globals: &self.globals,
                open_upvalues: &self.open_upvalues,
                init_string: self.init_string,
            },
        )
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_ref = self.intern(name);
        // Name and native ride the stack across the allocation.
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(ObjNative { name, function }));
        self.push(Value::Obj(native));
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // === Stack primitives ===

    fn push(&mut self, value: Value) {
        debug_assert!(self.stack.len() < STACK_MAX, "value stack overflow");
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Reports a runtime error: message, then a top-down trace of the call
    /// stack, then resets the VM so it can be reused.
    fn runtime_error(&mut self, message: &str) -> RuntimeAbort {
        let mut report = String::with_capacity(message.len() + 32);
        report.push_str(message);
        report.push('\n');
        for frame in self.frames.iter().rev() {
            let closure = self.heap.as_closure(frame.closure);
            let function = self.heap.as_function(closure.function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            match function.name {
                Some(name) => {
                    report.push_str(&format!("[line {}] in {}()\n", line, self.heap.as_str(name)));
                }
                None => {
                    report.push_str(&format!("[line {}] in script\n", line));
                }
            }
        }
        let _ = self.err.write_all(report.as_bytes());
        self.reset_stack();
        RuntimeAbort
    }

    // === Frame-relative reads ===

    fn chunk_of(&self, closure: ObjRef) -> &Chunk {
        let closure = self.heap.as_closure(closure);
        &self.heap.as_function(closure.function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let byte = {
            let frame = self.frames.last().expect("no active call frame");
            self.chunk_of(frame.closure).code[frame.ip]
        };
        self.frames.last_mut().expect("no active call frame").ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        let frame = self.frames.last().expect("no active call frame");
        self.chunk_of(frame.closure).constants[index]
    }

    fn read_string(&mut self, long: bool) -> ObjRef {
        match self.read_constant(long) {
            Value::Obj(handle) => handle,
            _ => unreachable!("name constant is not a string"),
        }
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeAbort> {
        enum Callee {
            Closure,
            Class,
            Bound(Value, ObjRef),
            Native(NativeFn),
            NotCallable,
        }

        let kind = match callee.as_obj() {
            Some(handle) => match self.heap.get(handle) {
                Obj::Closure(_) => Callee::Closure,
                Obj::Class(_) => Callee::Class,
                Obj::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
                Obj::Native(n) => Callee::Native(n.function),
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match kind {
            Callee::Closure => {
                let handle = callee.as_obj().expect("checked above");
                self.call_closure(handle, argc)
            }
            Callee::Class => {
                let handle = callee.as_obj().expect("checked above");
                self.instantiate(handle, argc)
            }
            Callee::Bound(receiver, method) => {
                // The receiver takes over the callee slot, becoming `this`.
                let slot = self.stack.len() - 1 - argc;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Callee::Native(function) => self.call_native(function, argc),
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes."))
            }
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeAbort> {
        let arity = self
            .heap
            .as_function(self.heap.as_closure(closure).function)
            .arity;
        if argc != arity {
            return Err(self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                arity, argc
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn instantiate(&mut self, class: ObjRef, argc: usize) -> Result<(), RuntimeAbort> {
        // The class still occupies the callee slot, keeping it rooted while
        // the instance is allocated; the instance then takes the slot over.
        let instance = self.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - 1 - argc;
        self.stack[slot] = Value::Obj(instance);

        let hash = self.heap.string_hash(self.init_string);
        let init = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(self.init_string, hash),
            _ => unreachable!("instantiated a non-class"),
        };
        match init {
            Some(Value::Obj(closure)) => self.call_closure(closure, argc),
            Some(_) => unreachable!("init method is not a closure"),
            None if argc != 0 => {
                Err(self.runtime_error(&format!("Expected 0 arguments but got {}.", argc)))
            }
            None => Ok(()),
        }
    }

    fn call_native(&mut self, function: NativeFn, argc: usize) -> Result<(), RuntimeAbort> {
        let start = self.stack.len() - argc;
        // Copy the arguments out; the originals stay on the stack (and thus
        // rooted) until the native returns.
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[start..]);
        match function(self, &args) {
            Ok(result) => {
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Err(error) => Err(self.runtime_error(&error.message)),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeAbort> {
        let receiver = self.peek(argc);
        let Some(instance_ref) = receiver
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)))
        else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        let hash = self.heap.string_hash(name);
        let (class, field) = match self.heap.get(instance_ref) {
            Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
            _ => unreachable!("checked instance above"),
        };

        // A field with the method's name shadows the method table.
        if let Some(field) = field {
            let slot = self.stack.len() - 1 - argc;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        argc: usize,
    ) -> Result<(), RuntimeAbort> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => unreachable!("method lookup on a non-class"),
        };
        match method {
            Some(Value::Obj(closure)) => self.call_closure(closure, argc),
            _ => {
                let text = self.heap.as_str(name).to_string();
                Err(self.runtime_error(&format!("Undefined property '{}'.", text)))
            }
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeAbort> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => unreachable!("method lookup on a non-class"),
        };
        let Some(Value::Obj(method)) = method else {
            let text = self.heap.as_str(name).to_string();
            return Err(self.runtime_error(&format!("Undefined property '{}'.", text)));
        };
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // === Upvalues ===

    /// Finds or creates the open upvalue for `slot`, keeping the list
    /// strictly descending by slot so there is at most one per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match self.heap.get(upvalue) {
                Obj::Upvalue(ObjUpvalue::Open(existing)) => {
                    if *existing == slot {
                        return upvalue;
                    }
                    if *existing < slot {
                        insert_at = i;
                        break;
                    }
                }
                _ => unreachable!("open-upvalue list holds a non-open upvalue"),
            }
        }
        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue pointing at `from` or above, copying the
    /// stack value inline.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.get(upvalue) {
                Obj::Upvalue(ObjUpvalue::Open(slot)) => *slot,
                _ => unreachable!("open-upvalue list holds a non-open upvalue"),
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.get_mut(upvalue) = Obj::Upvalue(ObjUpvalue::Closed(value));
            self.open_upvalues.remove(0);
        }
    }

    // === Binary helpers ===

    fn numeric_operands(&mut self) -> Result<(f64, f64), RuntimeAbort> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        Ok((a, b))
    }

    // === Dispatch ===

    fn run(&mut self) -> Result<(), RuntimeAbort> {
        loop {
            #[cfg(feature = "trace-execution")]
            {
                let frame = self.frames.last().expect("no active call frame");
                tracing::trace!(
                    target: "bramble::vm",
                    ip = frame.ip,
                    op = self.chunk_of(frame.closure).code[frame.ip],
                    depth = self.stack.len(),
                    "step"
                );
            }

            let op = OpCode::try_from(self.read_byte()).expect("invalid opcode in chunk");
            match op {
                OpCode::Constant | OpCode::ConstantLong => {
                    let value = self.read_constant(op == OpCode::ConstantLong);
                    self.push(value);
                }
                OpCode::ByteNum => {
                    let n = self.read_byte();
                    self.push(Value::Number(n as f64));
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else if self.heap.is_string(a) {
                        // Left string: stringify the right operand and
                        // concatenate. Operands stay on the stack across the
                        // allocation.
                        let handle = a.as_obj().expect("string value");
                        let mut text = self.heap.as_str(handle).to_string();
                        text.push_str(&self.heap.format_value(b));
                        let result = self.intern(&text);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    } else {
                        return Err(self.runtime_error(
                            "Operands must be two numbers or two strings.",
                        ));
                    }
                }
                OpCode::Subtract => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a / b));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Invert => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(!(n as i64) as f64));
                }
                OpCode::ShiftLeft => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(
                        (a as i64).wrapping_shl(b as i64 as u32) as f64,
                    ));
                }
                OpCode::ShiftRight => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(
                        (a as i64).wrapping_shr(b as i64 as u32) as f64,
                    ));
                }
                OpCode::BitAnd => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number((a as i64 & b as i64) as f64));
                }
                OpCode::BitOr => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number((a as i64 | b as i64) as f64));
                }
                OpCode::BitXor => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number((a as i64 ^ b as i64) as f64));
                }
                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Gt => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Lt => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a < b));
                }
                OpCode::Gte => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a >= b));
                }
                OpCode::Lte => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a <= b));
                }

                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name = self.read_string(op == OpCode::DefineGlobalLong);
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_string(op == OpCode::GetGlobalLong);
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let text = self.heap.as_str(name).to_string();
                            return Err(self.runtime_error(&format!(
                                "Undefined variable '{}'.",
                                text
                            )));
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_string(op == OpCode::SetGlobalLong);
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment never creates a global.
                        self.globals.delete(name, hash);
                        let text = self.heap.as_str(name).to_string();
                        return Err(
                            self.runtime_error(&format!("Undefined variable '{}'.", text))
                        );
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active call frame").base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active call frame").base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no active call frame").closure;
                    let upvalue = self.heap.as_closure(closure).upvalues[slot];
                    let value = match self.heap.get(upvalue) {
                        Obj::Upvalue(ObjUpvalue::Open(stack_slot)) => self.stack[*stack_slot],
                        Obj::Upvalue(ObjUpvalue::Closed(value)) => *value,
                        _ => unreachable!("closure upvalue is not an upvalue"),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frames.last().expect("no active call frame").closure;
                    let upvalue = self.heap.as_closure(closure).upvalues[slot];
                    let open_slot = match self.heap.get(upvalue) {
                        Obj::Upvalue(ObjUpvalue::Open(stack_slot)) => Some(*stack_slot),
                        Obj::Upvalue(ObjUpvalue::Closed(_)) => None,
                        _ => unreachable!("closure upvalue is not an upvalue"),
                    };
                    match open_slot {
                        Some(stack_slot) => self.stack[stack_slot] = value,
                        None => {
                            *self.heap.get_mut(upvalue) = Obj::Upvalue(ObjUpvalue::Closed(value));
                        }
                    }
                }

                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let name = self.read_string(op == OpCode::GetPropertyLong);
                    let receiver = self.peek(0);
                    let Some(instance_ref) = receiver
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)))
                    else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let hash = self.heap.string_hash(name);
                    let (class, field) = match self.heap.get(instance_ref) {
                        Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
                        _ => unreachable!("checked instance above"),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let name = self.read_string(op == OpCode::SetPropertyLong);
                    let receiver = self.peek(1);
                    let Some(instance_ref) = receiver
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)))
                    else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    match self.heap.get_mut(instance_ref) {
                        Obj::Instance(i) => {
                            i.fields.set(name, hash, value);
                        }
                        _ => unreachable!("checked instance above"),
                    }
                    // The assigned value is the expression's result.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let name = self.read_string(op == OpCode::GetSuperLong);
                    let superclass = self
                        .pop()
                        .as_obj()
                        .expect("superclass is not an object");
                    self.bind_method(superclass, name)?;
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                OpCode::JumpBackwards => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let name = self.read_string(op == OpCode::InvokeLong);
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let name = self.read_string(op == OpCode::SuperInvokeLong);
                    let argc = self.read_byte() as usize;
                    let superclass = self
                        .pop()
                        .as_obj()
                        .expect("superclass is not an object");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure | OpCode::ClosureLong => {
                    let function = match self.read_constant(op == OpCode::ClosureLong) {
                        Value::Obj(handle) => handle,
                        _ => unreachable!("closure constant is not a function"),
                    };
                    let upvalue_count = self.heap.as_function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack immediately: capturing below can collect.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base =
                                self.frames.last().expect("no active call frame").base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing =
                                self.frames.last().expect("no active call frame").closure;
                            self.heap.as_closure(enclosing).upvalues[index]
                        };
                        match self.heap.get_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!("closure changed kind"),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return | OpCode::ReturnNil => {
                    let result = if op == OpCode::Return {
                        self.pop()
                    } else {
                        Value::Nil
                    };
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // The synthetic script closure is all that remains.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Subscript => {
                    let argc = self.read_byte() as usize;
                    if argc != 1 {
                        return Err(self.runtime_error(&format!(
                            "Expected 1 subscript index but got {}.",
                            argc
                        )));
                    }
                    let index_value = self.peek(0);
                    let target = self.peek(1);
                    let Value::Number(raw) = index_value else {
                        return Err(self.runtime_error("Subscript index must be a number."));
                    };
                    let index = raw as i64;
                    let Some(target_ref) = target.as_obj() else {
                        return Err(
                            self.runtime_error("Can only subscript arrays and strings.")
                        );
                    };

                    // The string case defers interning until the heap borrow
                    // ends.
                    enum Fetched {
                        Value(Value),
                        Piece(String),
                    }
                    let fetched: Result<Fetched, &'static str> =
                        match self.heap.get(target_ref) {
                            Obj::Array(a) => {
                                if index < 0 || index as usize >= a.elements.len() {
                                    Err("Subscript index out of range.")
                                } else {
                                    Ok(Fetched::Value(a.elements[index as usize]))
                                }
                            }
                            Obj::Str(s) => {
                                if index < 0 || index as usize >= s.chars.len() {
                                    Err("Subscript index out of range.")
                                } else {
                                    match s.chars.get(index as usize..index as usize + 1) {
                                        Some(piece) => Ok(Fetched::Piece(piece.to_string())),
                                        None => Err("Subscript index out of range."),
                                    }
                                }
                            }
                            _ => Err("Can only subscript arrays and strings."),
                        };
                    let value = match fetched {
                        Ok(Fetched::Value(value)) => value,
                        Ok(Fetched::Piece(piece)) => {
                            // Target and index stay on the stack across the
                            // allocation.
                            Value::Obj(self.intern(&piece))
                        }
                        Err(message) => return Err(self.runtime_error(message)),
                    };
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::SubscriptAssign => {
                    let argc = self.read_byte() as usize;
                    if argc != 1 {
                        return Err(self.runtime_error(&format!(
                            "Expected 1 subscript index but got {}.",
                            argc
                        )));
                    }
                    let value = self.peek(0);
                    let index_value = self.peek(1);
                    let target = self.peek(2);
                    let Value::Number(raw) = index_value else {
                        return Err(self.runtime_error("Subscript index must be a number."));
                    };
                    let index = raw as i64;
                    let Some(target_ref) = target.as_obj() else {
                        return Err(self.runtime_error("Can only subscript-assign arrays."));
                    };
                    let stored: Result<(), &'static str> =
                        match self.heap.get_mut(target_ref) {
                            Obj::Array(a) => {
                                if index < 0 || index as usize >= a.elements.len() {
                                    Err("Subscript index out of range.")
                                } else {
                                    a.elements[index as usize] = value;
                                    Ok(())
                                }
                            }
                            _ => Err("Can only subscript-assign arrays."),
                        };
                    if let Err(message) = stored {
                        return Err(self.runtime_error(message));
                    }
                    self.pop();
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::NewArray => {
                    let argc = self.read_byte() as usize;
                    let start = self.stack.len() - argc;
                    // Elements remain on the stack while the array object is
                    // allocated.
                    let elements = self.stack[start..].to_vec();
                    let array = self.alloc(Obj::Array(ObjArray { elements }));
                    self.stack.truncate(start);
                    self.push(Value::Obj(array));
                }

                OpCode::Class | OpCode::ClassLong => {
                    let name = self.read_string(op == OpCode::ClassLong);
                    let class = self.alloc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Some(super_ref) = superclass
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
                    else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    // Copy-down inheritance: the subclass starts with every
                    // superclass method and overrides by re-definition.
                    let methods = match self.heap.get(super_ref) {
                        Obj::Class(c) => c.methods.clone(),
                        _ => unreachable!("checked class above"),
                    };
                    let sub_ref = self
                        .peek(0)
                        .as_obj()
                        .expect("subclass is not an object");
                    match self.heap.get_mut(sub_ref) {
                        Obj::Class(c) => c.methods.extend_from(&methods),
                        _ => unreachable!("INHERIT on a non-class"),
                    }
                    self.pop();
                }
                OpCode::Method | OpCode::MethodLong => {
                    let name = self.read_string(op == OpCode::MethodLong);
                    let method = self.peek(0);
                    let class = self
                        .peek(1)
                        .as_obj()
                        .expect("method target is not an object");
                    let hash = self.heap.string_hash(name);
                    match self.heap.get_mut(class) {
                        Obj::Class(c) => {
                            c.methods.set(name, hash, method);
                        }
                        _ => unreachable!("METHOD on a non-class"),
                    }
                    self.pop();
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let _ = writeln!(self.out, "{}", text);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> (Result<(), InterpretError>, String, String) {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let mut vm = Vm::with_io(Box::new(out.clone()), Box::new(err.clone()));
        let result = vm.interpret(source);
        let stdout = String::from_utf8(out.0.borrow().clone()).unwrap();
        let stderr = String::from_utf8(err.0.borrow().clone()).unwrap();
        (result, stdout, stderr)
    }

    fn expect_out(source: &str, expected: &str) {
        let (result, stdout, stderr) = run(source);
        assert_eq!(result, Ok(()), "stderr: {stderr}");
        assert_eq!(stdout, expected);
    }

    #[test]
    fn arithmetic() {
        expect_out("print 1 + 2 * 3;", "7\n");
        expect_out("print (1 + 2) * 3;", "9\n");
        expect_out("print 10 / 4;", "2.5\n");
        expect_out("print -3 + 1;", "-2\n");
    }

    #[test]
    fn bitwise_operations() {
        expect_out("print 6 & 3;", "2\n");
        expect_out("print 6 | 3;", "7\n");
        expect_out("print 6 ^ 3;", "5\n");
        expect_out("print 1 << 4;", "16\n");
        expect_out("print 16 >> 2;", "4\n");
        expect_out("print ~0;", "-1\n");
    }

    #[test]
    fn comparison_and_equality() {
        expect_out("print 1 < 2;", "true\n");
        expect_out("print 2 <= 2;", "true\n");
        expect_out("print 1 == 1;", "true\n");
        expect_out("print 1 != 1;", "false\n");
        expect_out("print nil == nil;", "true\n");
        expect_out("print nil == false;", "false\n");
        expect_out("print \"a\" == \"a\";", "true\n");
        expect_out("print \"a\" == \"b\";", "false\n");
    }

    #[test]
    fn short_circuit() {
        expect_out("print true and 2;", "2\n");
        expect_out("print false and 2;", "false\n");
        expect_out("print false or 3;", "3\n");
        expect_out("print 1 or 3;", "1\n");
    }

    #[test]
    fn globals_and_locals() {
        expect_out("var a = 1; a = a + 2; print a;", "3\n");
        expect_out("{ var a = 10; { var a = 20; print a; } print a; }", "20\n10\n");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let (result, _, stderr) = run("print missing;");
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(stderr.contains("Undefined variable 'missing'."), "{stderr}");
        assert!(stderr.contains("in script"), "{stderr}");
    }

    #[test]
    fn string_concatenation() {
        expect_out("print \"foo\" + \"bar\";", "foobar\n");
        expect_out("var s = \"\"; s = s + 1 + 2; print s;", "12\n");
        expect_out("print \"n=\" + 3.5;", "n=3.5\n");
    }

    #[test]
    fn add_type_error_matches_contract() {
        let (result, _, stderr) = run("print 1 + \"x\";");
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(
            stderr.contains("Operands must be two numbers or two strings."),
            "{stderr}"
        );
    }

    #[test]
    fn control_flow() {
        expect_out("if (1 < 2) print \"yes\"; else print \"no\";", "yes\n");
        expect_out("if (1 > 2) print \"yes\"; else print \"no\";", "no\n");
        expect_out(
            "var i = 0; while (i < 3) { print i; i = i + 1; }",
            "0\n1\n2\n",
        );
        expect_out(
            "for (var i = 0; i < 3; i = i + 1) print i;",
            "0\n1\n2\n",
        );
    }

    #[test]
    fn break_and_continue() {
        expect_out(
            "for (var i = 0; i < 10; i = i + 1) { if (i == 3) break; print i; }",
            "0\n1\n2\n",
        );
        expect_out(
            "for (var i = 0; i < 5; i = i + 1) { if (i == 1) continue; if (i == 3) continue; print i; }",
            "0\n2\n4\n",
        );
        // Multiple breaks in one loop body.
        expect_out(
            "var i = 0; while (true) { i = i + 1; if (i == 2) break; if (i > 2) break; } print i;",
            "2\n",
        );
    }

    #[test]
    fn functions_and_returns() {
        expect_out(
            "fun add(a, b) { return a + b; } print add(1, 2);",
            "3\n",
        );
        expect_out("fun noReturn() {} print noReturn();", "nil\n");
        expect_out("fun f() { return; } print f();", "nil\n");
    }

    #[test]
    fn arity_mismatch() {
        let (result, _, stderr) = run("fun f(a) {} f(1, 2);");
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(stderr.contains("Expected 1 arguments but got 2."), "{stderr}");
    }

    #[test]
    fn stack_overflow_reports_and_recovers() {
        let (result, _, stderr) = run("fun loop() { loop(); } loop();");
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(stderr.contains("Stack overflow."), "{stderr}");
        assert!(stderr.contains("in loop()"), "{stderr}");
    }

    #[test]
    fn closures_capture_and_share() {
        expect_out(
            "fun makeAdder(x) { fun add(y) { return x + y; } return add; } \
             var a = makeAdder(3); print a(4); print a(10);",
            "7\n13\n",
        );
        expect_out(
            "fun counter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
             var c = counter(); print c(); print c(); print c();",
            "1\n2\n3\n",
        );
    }

    #[test]
    fn closed_upvalues_observe_later_writes() {
        expect_out(
            "var get; var set; \
             { var shared = 1; \
               fun g() { return shared; } \
               fun s(v) { shared = v; } \
               get = g; set = s; } \
             set(42); print get();",
            "42\n",
        );
    }

    #[test]
    fn classes_fields_and_methods() {
        expect_out(
            "class A {} var a = A(); a.x = 3; print a.x;",
            "3\n",
        );
        expect_out(
            "class Counter { init() { this.n = 0; } bump() { this.n = this.n + 1; return this.n; } } \
             var c = Counter(); c.bump(); print c.bump();",
            "2\n",
        );
    }

    #[test]
    fn inheritance_and_super() {
        expect_out(
            "class A { greet() { print \"hi\"; } } \
             class B < A { greet() { super.greet(); print \"there\"; } } \
             B().greet();",
            "hi\nthere\n",
        );
        // Methods not overridden are copied down.
        expect_out(
            "class A { m() { return 1; } } class B < A {} print B().m();",
            "1\n",
        );
        // Subclass init overrides the inherited one.
        expect_out(
            "class A { init() { this.k = \"a\"; } } \
             class B < A { init() { this.k = \"b\"; } } \
             print B().k;",
            "b\n",
        );
    }

    #[test]
    fn bound_methods_carry_their_receiver() {
        expect_out(
            "class A { init() { this.v = 7; } read() { return this.v; } } \
             var m = A().read; print m();",
            "7\n",
        );
    }

    #[test]
    fn arrays_and_subscripts() {
        expect_out(
            "var a = [10, 20, 30]; a[1] = 99; print a[0] + a[1] + a[2]; print size(a);",
            "139\n3\n",
        );
        expect_out("print [1, 2, 3];", "[1, 2, 3]\n");
        expect_out("print \"hello\"[1];", "e\n");
        let (result, _, stderr) = run("var a = [1]; print a[5];");
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(stderr.contains("Subscript index out of range."), "{stderr}");
    }

    #[test]
    fn natives() {
        expect_out("print toString(42);", "42\n");
        expect_out("print getTypeName(42);", "number\n");
        expect_out("print getTypeName(\"x\");", "string\n");
        expect_out("print getTypeName([1]);", "array\n");
        expect_out("class Tree {} print getTypeName(Tree());", "Tree\n");
        expect_out("print toString(getTypeName(42)) == getTypeName(42);", "true\n");
        expect_out("print size(\"hello\");", "5\n");
        expect_out(
            "class A {} var a = A(); set(a, \"f\", 9); print has(a, \"f\"); print get(a, \"f\");",
            "true\n9\n",
        );
        expect_out("class A {} print has(A(), \"missing\");", "false\n");
        // Non-string keys are a silent false, not an error.
        expect_out("class A {} print has(A(), 42);", "false\n");
        expect_out("print clock() >= 0;", "true\n");
    }

    #[test]
    fn native_errors_become_runtime_errors() {
        let (result, _, stderr) = run("get(1, \"x\");");
        assert_eq!(result, Err(InterpretError::Runtime));
        assert!(
            stderr.contains("get() expects an instance as its first argument."),
            "{stderr}"
        );
    }

    #[test]
    fn vm_survives_errors_between_interpretations() {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let mut vm = Vm::with_io(Box::new(out.clone()), Box::new(err.clone()));
        assert_eq!(vm.interpret("print missing;"), Err(InterpretError::Runtime));
        assert_eq!(vm.interpret("var x = 1; print x;"), Ok(()));
        // Globals persist across interpretations, as in the REPL.
        assert_eq!(vm.interpret("print x + 1;"), Ok(()));
        let stdout = String::from_utf8(out.0.borrow().clone()).unwrap();
        assert_eq!(stdout, "1\n2\n");
    }

    #[test]
    fn scripted_loop_builds_strings() {
        expect_out(
            "var s = \"\"; for (var i = 0; i < 3; i = i + 1) s = s + i; print s;",
            "012\n",
        );
    }
}
