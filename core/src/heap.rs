//! The garbage-collected heap.
//!
//! All runtime objects live in a slot arena owned by [`Heap`]; an
//! [`ObjRef`] is a stable index into it. Allocation is the only collection
//! point: [`Heap::alloc`] may run a full mark-and-sweep pass *before* the new
//! object exists, so callers keep every half-linked object reachable (in
//! practice: on the VM value stack or in a compiler function in progress)
//! until it is wired into the graph.
//!
//! Collection is tricolor: roots are marked gray and pushed on a worklist,
//! gray objects are blackened by marking their outgoing references, and the
//! sweep frees whatever stayed white. Roots are supplied by the caller via
//! the [`Trace`] trait; the VM and the compiler each know their own root
//! set, the heap does not.
//!
//! The string intern table is weak: unmarked string keys are dropped after
//! marking, before sweep, so the table never holds a freed handle.

use smallvec::SmallVec;

use crate::object::{hash_str, Obj, ObjClosure, ObjFunction, ObjRef, ObjString, ObjUpvalue};
use crate::table::Table;
use crate::value::{format_number, Value};

/// The managed-heap growth factor applied after each collection.
const HEAP_GROW_FACTOR: usize = 2;
/// Floor for the next-collection threshold.
const MIN_HEAP: usize = 1024 * 1024;

/// Supplies GC roots. Implementations mark everything they hold alive via
/// [`Heap::mark_value`] / [`Heap::mark_object`].
pub trait Trace {
    fn trace(&self, heap: &mut Heap);
}

/// An empty root set, for bootstrap allocations that precede any reachable
/// state.
pub struct NoRoots;

impl Trace for NoRoots {
    fn trace(&self, _heap: &mut Heap) {}
}

struct Slot {
    obj: Obj,
    marked: bool,
    size: usize,
}

#[derive(Default)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    gray: Vec<ObjRef>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            next_gc: MIN_HEAP,
            ..Heap::default()
        }
    }

    /// Allocates `obj`, first collecting if the trigger fires (always, under
    /// the `gc-stress` feature). The returned handle is unmarked and owned
    /// by nothing; the caller must make it reachable before the next
    /// allocation.
    pub fn alloc(&mut self, obj: Obj, roots: &dyn Trace) -> ObjRef {
        self.maybe_collect(obj.size_hint(), roots);
        self.alloc_raw(obj)
    }

    /// Runs the collection trigger as if allocating `upcoming` bytes.
    /// Exposed so the compiler can collect *before* moving a finished
    /// function into the heap, while that function's constants are still
    /// rooted through the compiler chain.
    pub fn maybe_collect(&mut self, upcoming: usize, roots: &dyn Trace) {
        let stress = cfg!(feature = "gc-stress");
        if stress || self.bytes_allocated + upcoming > self.next_gc {
            self.collect(roots);
        }
    }

    /// Places `obj` in a slot without running the trigger. Pair with
    /// [`Heap::maybe_collect`]; prefer [`Heap::alloc`] everywhere else.
    pub fn alloc_raw(&mut self, obj: Obj) -> ObjRef {
        let size = obj.size_hint();
        self.bytes_allocated += size;
        let slot = Slot {
            obj,
            marked: false,
            size,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef::new(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef::new((self.slots.len() - 1) as u32)
            }
        };
        #[cfg(feature = "gc-log")]
        tracing::trace!(target: "bramble::gc", handle = handle.index(), bytes = size, "allocate");
        handle
    }

    /// Interns `s`: returns the existing string object with these contents,
    /// or allocates one and registers it in the intern table.
    pub fn intern(&mut self, s: &str, roots: &dyn Trace) -> ObjRef {
        let hash = hash_str(s);
        let slots = &self.slots;
        let existing = self.strings.find_with(hash, |key| {
            matches!(&slots[key.index()], Some(slot) if matches!(&slot.obj, Obj::Str(o) if &*o.chars == s))
        });
        if let Some(handle) = existing {
            return handle;
        }
        // Collection (if any) happens inside alloc, before the new object
        // exists; registering it afterwards allocates nothing on this heap.
        let handle = self.alloc(
            Obj::Str(ObjString {
                chars: s.into(),
                hash,
            }),
            roots,
        );
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    // === Object access ===

    pub fn get(&self, handle: ObjRef) -> &Obj {
        &self.slots[handle.index()]
            .as_ref()
            .expect("dangling object handle")
            .obj
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Obj {
        &mut self.slots[handle.index()]
            .as_mut()
            .expect("dangling object handle")
            .obj
    }

    /// Contents of a string object. Panics if `handle` is not a string; use
    /// only where the bytecode contract guarantees the kind.
    pub fn as_str(&self, handle: ObjRef) -> &str {
        match self.get(handle) {
            Obj::Str(s) => &s.chars,
            _ => panic!("expected string object"),
        }
    }

    pub fn string_hash(&self, handle: ObjRef) -> u32 {
        match self.get(handle) {
            Obj::Str(s) => s.hash,
            _ => panic!("expected string object"),
        }
    }

    pub fn as_function(&self, handle: ObjRef) -> &ObjFunction {
        match self.get(handle) {
            Obj::Function(f) => f,
            _ => panic!("expected function object"),
        }
    }

    pub fn as_closure(&self, handle: ObjRef) -> &ObjClosure {
        match self.get(handle) {
            Obj::Closure(c) => c,
            _ => panic!("expected closure object"),
        }
    }

    pub fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.get(r), Obj::Str(_)))
    }

    /// Bytes currently attributed to live (unswept) objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects, for tests and diagnostics.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // === Collection ===

    /// Full mark-and-sweep over the given roots.
    pub fn collect(&mut self, roots: &dyn Trace) {
        #[cfg(feature = "gc-log")]
        let before = self.bytes_allocated;
        #[cfg(feature = "gc-log")]
        tracing::debug!(target: "bramble::gc", bytes = before, "collection begin");

        roots.trace(self);
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
        self.remove_white_strings();
        self.sweep();
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(MIN_HEAP);

        #[cfg(feature = "gc-log")]
        tracing::debug!(
            target: "bramble::gc",
            freed = before - self.bytes_allocated,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "collection end"
        );
    }

    /// Marks a root or reference gray.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: ObjRef) {
        let slot = self.slots[handle.index()]
            .as_mut()
            .expect("marked dangling object handle");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(handle);
    }

    /// Blackens one gray object: collects its outgoing references, then
    /// marks them. The copy into a scratch buffer keeps the borrow of the
    /// object disjoint from the mark writes.
    fn blacken(&mut self, handle: ObjRef) {
        let mut children: SmallVec<[Value; 16]> = SmallVec::new();
        match self.get(handle) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            // An open upvalue's referent lives on the value stack, which is
            // a root in its own right.
            Obj::Upvalue(ObjUpvalue::Open(_)) => {}
            Obj::Upvalue(ObjUpvalue::Closed(v)) => children.push(*v),
            Obj::Class(c) => {
                children.push(Value::Obj(c.name));
                for (key, value) in c.methods.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            Obj::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (key, value) in i.fields.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
            Obj::Array(a) => children.extend_from_slice(&a.elements),
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// Drops unmarked keys from the intern table so sweep cannot strand it
    /// with dangling handles.
    fn remove_white_strings(&mut self) {
        let slots = &self.slots;
        self.strings
            .retain_keys(|key| matches!(&slots[key.index()], Some(slot) if slot.marked));
    }

    fn sweep(&mut self) {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    self.bytes_allocated -= slot.size;
                    #[cfg(feature = "gc-log")]
                    tracing::trace!(target: "bramble::gc", handle = index, "free");
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
    }

    // === The toString protocol ===

    /// Canonical display form of any value, used by `print`, string
    /// concatenation and the `toString` native.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Int(i) => i.to_string(),
            Value::Obj(handle) => self.format_object(handle),
        }
    }

    fn format_object(&self, handle: ObjRef) -> String {
        match self.get(handle) {
            Obj::Str(s) => s.chars.to_string(),
            Obj::Function(f) => self.format_function(f),
            Obj::Closure(c) => self.format_function(self.as_function(c.function)),
            Obj::BoundMethod(b) => self.format_function(self.as_function(
                self.as_closure(b.method).function,
            )),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.as_str(c.name).to_string(),
            Obj::Instance(i) => {
                let class = match self.get(i.class) {
                    Obj::Class(c) => self.as_str(c.name),
                    _ => panic!("instance of a non-class"),
                };
                format!("{} instance", class)
            }
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Array(a) => {
                let items: Vec<String> =
                    a.elements.iter().map(|&e| self.format_value(e)).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }

    fn format_function(&self, function: &ObjFunction) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.as_str(name)),
            None => "<script>".to_string(),
        }
    }

    /// Kind name of a value, as reported by the `getTypeName` native.
    /// Instances report their class name.
    pub fn type_name(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Number(_) | Value::Int(_) => "number".to_string(),
            Value::Obj(handle) => match self.get(handle) {
                Obj::Str(_) => "string".to_string(),
                Obj::Function(_) | Obj::Closure(_) | Obj::BoundMethod(_) => {
                    "function".to_string()
                }
                Obj::Native(_) => "native function".to_string(),
                Obj::Upvalue(_) => "upvalue".to_string(),
                Obj::Class(_) => "class".to_string(),
                Obj::Instance(i) => match self.get(i.class) {
                    Obj::Class(c) => self.as_str(c.name).to_string(),
                    _ => panic!("instance of a non-class"),
                },
                Obj::Array(_) => "array".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjArray;

    struct PinRoots(Vec<Value>);

    impl Trace for PinRoots {
        fn trace(&self, heap: &mut Heap) {
            for &v in &self.0 {
                heap.mark_value(v);
            }
        }
    }

    #[test]
    fn interning_returns_the_same_handle() {
        let mut heap = Heap::new();
        let a = heap.intern("hello", &NoRoots);
        let pin = PinRoots(vec![Value::Obj(a)]);
        let b = heap.intern("hello", &pin);
        let c = heap.intern("world", &pin);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.as_str(a), "hello");
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept", &NoRoots);
        let pin = PinRoots(vec![Value::Obj(kept)]);
        let _lost = heap.intern("lost", &pin);
        assert_eq!(heap.object_count(), 2);

        heap.collect(&pin);
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.as_str(kept), "kept");
    }

    #[test]
    fn weak_intern_table_forgets_collected_strings() {
        let mut heap = Heap::new();
        let _lost = heap.intern("ghost", &NoRoots);
        heap.collect(&PinRoots(vec![]));
        // Re-interning must allocate a fresh object, not resurrect a freed
        // handle.
        let again = heap.intern("ghost", &NoRoots);
        assert_eq!(heap.as_str(again), "ghost");
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn marking_traverses_arrays() {
        let mut heap = Heap::new();
        let s = heap.intern("element", &NoRoots);
        let array = heap.alloc(
            Obj::Array(ObjArray {
                elements: vec![Value::Obj(s), Value::Number(1.0)],
            }),
            &PinRoots(vec![Value::Obj(s)]),
        );
        heap.collect(&PinRoots(vec![Value::Obj(array)]));
        // Both the array and the string it references survive.
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.as_str(s), "element");
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let a = heap.intern("a", &NoRoots);
        heap.collect(&PinRoots(vec![]));
        let b = heap.intern("b", &NoRoots);
        // The new object reuses the freed slot.
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn byte_accounting_shrinks_on_sweep() {
        let mut heap = Heap::new();
        let _ = heap.intern("some contents that occupy space", &NoRoots);
        let before = heap.bytes_allocated();
        assert!(before > 0);
        heap.collect(&PinRoots(vec![]));
        assert!(heap.bytes_allocated() < before);
    }

    #[test]
    fn format_values() {
        let mut heap = Heap::new();
        assert_eq!(heap.format_value(Value::Nil), "nil");
        assert_eq!(heap.format_value(Value::Bool(true)), "true");
        assert_eq!(heap.format_value(Value::Number(7.0)), "7");
        let s = heap.intern("text", &NoRoots);
        assert_eq!(heap.format_value(Value::Obj(s)), "text");
        let array = heap.alloc(
            Obj::Array(ObjArray {
                elements: vec![Value::Number(1.0), Value::Obj(s)],
            }),
            &PinRoots(vec![Value::Obj(s)]),
        );
        assert_eq!(heap.format_value(Value::Obj(array)), "[1, text]");
    }
}
