//! Built-in native functions.
//!
//! Natives are host functions registered as globals when a VM is
//! constructed. Each receives the VM and a copy of its argument values (the
//! originals stay rooted on the value stack for the duration of the call)
//! and either returns a result value or a [`NativeError`], which the VM
//! reports as a runtime error.

use crate::object::{NativeFn, Obj, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// A failure reported by a native function. The message is printed verbatim
/// by the VM's runtime-error path.
#[derive(Debug)]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> NativeError {
        NativeError {
            message: message.into(),
        }
    }
}

/// Registration table, installed by [`Vm::new`](crate::Vm::new).
pub(crate) const NATIVES: &[(&str, NativeFn)] = &[
    ("clock", clock),
    ("toString", to_string),
    ("getTypeName", get_type_name),
    ("has", has),
    ("get", get),
    ("set", set),
    ("size", size),
];

fn expect_arity(name: &str, args: &[Value], expected: usize) -> Result<(), NativeError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(NativeError::new(format!(
            "{}() takes {} argument{} but got {}.",
            name,
            expected,
            if expected == 1 { "" } else { "s" },
            args.len()
        )))
    }
}

fn as_instance(vm: &Vm, value: Value) -> Option<ObjRef> {
    value
        .as_obj()
        .filter(|&handle| matches!(vm.heap().get(handle), Obj::Instance(_)))
}

fn as_string(vm: &Vm, value: Value) -> Option<ObjRef> {
    value
        .as_obj()
        .filter(|&handle| matches!(vm.heap().get(handle), Obj::Str(_)))
}

/// `clock()`: seconds since the VM was created.
fn clock(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("clock", args, 0)?;
    Ok(Value::Number(vm.elapsed_seconds()))
}

/// `toString(v)`: canonical string form of any value.
fn to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("toString", args, 1)?;
    let text = vm.format_value(args[0]);
    Ok(Value::Obj(vm.intern(&text)))
}

/// `getTypeName(v)`: kind name; instances report their class name.
fn get_type_name(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("getTypeName", args, 1)?;
    let name = vm.heap().type_name(args[0]);
    Ok(Value::Obj(vm.intern(&name)))
}

/// `has(obj, name)`: whether `obj` is an instance with field `name`.
/// A non-instance receiver or a non-string name is a silent `false`, not an
/// error.
fn has(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("has", args, 2)?;
    let Some(instance) = as_instance(vm, args[0]) else {
        return Ok(Value::Bool(false));
    };
    let Some(name) = as_string(vm, args[1]) else {
        return Ok(Value::Bool(false));
    };
    let hash = vm.heap().string_hash(name);
    let found = match vm.heap().get(instance) {
        Obj::Instance(i) => i.fields.get(name, hash).is_some(),
        _ => false,
    };
    Ok(Value::Bool(found))
}

/// `get(obj, name)`: field read; errors on non-instances and unknown
/// fields.
fn get(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("get", args, 2)?;
    let Some(instance) = as_instance(vm, args[0]) else {
        return Err(NativeError::new(
            "get() expects an instance as its first argument.",
        ));
    };
    let Some(name) = as_string(vm, args[1]) else {
        return Err(NativeError::new("get() expects a string property name."));
    };
    let hash = vm.heap().string_hash(name);
    let field = match vm.heap().get(instance) {
        Obj::Instance(i) => i.fields.get(name, hash),
        _ => None,
    };
    field.ok_or_else(|| {
        NativeError::new(format!(
            "Undefined property '{}'.",
            vm.heap().as_str(name)
        ))
    })
}

/// `set(obj, name, value)`: field write; returns the stored value.
fn set(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("set", args, 3)?;
    let Some(instance) = as_instance(vm, args[0]) else {
        return Err(NativeError::new(
            "set() expects an instance as its first argument.",
        ));
    };
    let Some(name) = as_string(vm, args[1]) else {
        return Err(NativeError::new("set() expects a string property name."));
    };
    let hash = vm.heap().string_hash(name);
    match vm.heap_mut().get_mut(instance) {
        Obj::Instance(i) => {
            i.fields.set(name, hash, args[2]);
        }
        _ => unreachable!("checked instance above"),
    }
    Ok(args[2])
}

/// `size(obj)`: length of a string (bytes) or array (elements).
fn size(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arity("size", args, 1)?;
    let length = args.first().and_then(|v| v.as_obj()).and_then(|handle| {
        match vm.heap().get(handle) {
            Obj::Str(s) => Some(s.chars.len()),
            Obj::Array(a) => Some(a.elements.len()),
            _ => None,
        }
    });
    match length {
        Some(n) => Ok(Value::Number(n as f64)),
        None => Err(NativeError::new("size() expects a string or an array.")),
    }
}
