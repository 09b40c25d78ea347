//! Bramble core: a bytecode interpreter for a small dynamically-typed,
//! class-based scripting language.
//!
//! The crate is built from three tightly coupled subsystems:
//!
//! - a single-pass compiler ([`compiler`]) that lexes source text with the
//!   on-demand [`scanner`] and emits bytecode directly into [`chunk`]s;
//!   there is no intermediate AST;
//! - a stack-based virtual machine ([`vm`]) that executes those chunks with
//!   call frames, closures, upvalues and class-based method dispatch;
//! - a garbage-collected [`heap`] that owns every runtime object and interns
//!   every string, collected by a precise tracing mark-and-sweep pass.
//!
//! The only entry point most embedders need is [`Vm::interpret`]:
//!
//! ```
//! use bramble_core::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("print 1 + 2 * 3;").unwrap(); // prints "7"
//! ```

pub mod chunk;
pub mod compiler;
pub mod heap;
pub mod natives;
pub mod object;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

pub use vm::{InterpretError, Vm};

/// Number of distinct values an unsigned byte operand can take. Sizes the
/// local-slot space per function and, together with [`vm::FRAMES_MAX`], the
/// value stack.
pub const UINT8_COUNT: usize = u8::MAX as usize + 1;
