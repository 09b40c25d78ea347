//! Heap object model.
//!
//! Every heap entity lives in a slot of the [`Heap`](crate::heap::Heap) arena
//! and is reached through an [`ObjRef`] handle. Handles are stable indices:
//! slots never move, so a handle stays valid until the collector frees the
//! object it names. Comparing handles compares object identity.

use std::mem;

use crate::chunk::Chunk;
use crate::natives::NativeError;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Handle to a heap slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    #[inline]
    pub(crate) const fn new(index: u32) -> ObjRef {
        ObjRef(index)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// A native function: receives the VM (for heap access and the toString
/// protocol) and a copy of the argument values, which remain rooted on the
/// value stack for the duration of the call. An `Err` aborts interpretation
/// with the carried message.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, NativeError>;

/// A heap object. One variant per entity kind; the mark bit and size
/// accounting live on the heap slot, not here.
pub enum Obj {
    Str(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
    Array(ObjArray),
}

/// An immutable, interned string with its precomputed FNV-1a hash.
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: arity, declared upvalue count, an optional name
/// (absent for the top-level script) and the owned bytecode chunk.
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

impl ObjFunction {
    pub fn new(name: Option<ObjRef>) -> ObjFunction {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }
}

/// A function plus its captured upvalues. `upvalues` reaches the function's
/// declared upvalue count once construction finishes; the GC may observe it
/// shorter while the CLOSURE instruction is still wiring captures.
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open upvalues point at a live value-stack slot;
/// closing copies the slot's value inline.
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method closure paired with the receiver it was read from.
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

pub struct ObjNative {
    pub name: &'static str,
    pub function: NativeFn,
}

pub struct ObjArray {
    pub elements: Vec<Value>,
}

impl Obj {
    /// Rough payload size in bytes, used for the collection trigger. Exact
    /// accounting is not required; the estimate only has to grow with the
    /// real footprint.
    pub fn size_hint(&self) -> usize {
        let payload = match self {
            Obj::Str(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.constants.len() * mem::size_of::<Value>()
                    + f.chunk.lines.len() * mem::size_of::<u32>()
            }
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.capacity() * mem::size_of::<Value>() * 2,
            Obj::Instance(i) => i.fields.capacity() * mem::size_of::<Value>() * 2,
            Obj::Array(a) => a.elements.len() * mem::size_of::<Value>(),
            Obj::Upvalue(_) | Obj::BoundMethod(_) | Obj::Native(_) => 0,
        };
        mem::size_of::<Obj>() + payload
    }
}

/// FNV-1a, the hash every interned string carries.
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_values() {
        // Reference vectors for 32-bit FNV-1a.
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }

    #[test]
    fn equal_contents_hash_alike() {
        assert_eq!(hash_str("init"), hash_str("init"));
        assert_ne!(hash_str("init"), hash_str("tini"));
    }
}
