//! Single-pass compiler.
//!
//! A Pratt parser that emits bytecode as it goes: tokens in, chunks out,
//! no AST in between. Each nested function compilation pushes a
//! [`FunctionState`] activation record carrying its locals, upvalues, loop
//! stack and string-constant dedup table; resolving a variable walks that
//! stack outward, capturing upvalues along the way.
//!
//! The compiler allocates (interned strings, finished functions) on the
//! same collected heap the VM uses, so every allocation passes the chain of
//! in-progress functions as GC roots: a half-built chunk's constants are
//! reachable through [`CompilerRoots`] even though no closure refers to
//! them yet.
//!
//! Parse errors set panic mode, which suppresses the cascade until the next
//! statement boundary. Diagnostics go to the caller's sink; if any error was
//! reported the compilation returns `None`.

use std::io::Write;

use smallvec::SmallVec;

use crate::chunk::{Chunk, OpCode};
use crate::heap::{Heap, Trace};
use crate::object::{Obj, ObjFunction, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::Value;
use crate::UINT8_COUNT;

/// Binding strengths, weakest first. `parse_precedence(p)` consumes every
/// infix operator binding at least as tightly as `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Comparison, // < > <= >=
    Shift,      // << >>
    Term,       // + -
    Factor,     // * /
    Unary,      // ! - ~
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'ctx> = fn(&mut Parser<'src, 'ctx>, bool);

struct ParseRule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

/// A declared local: its name, the scope depth it was declared at (-1 while
/// declared-but-uninitialized), and whether any nested function captured it.
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

struct LoopState {
    /// Jump-backwards target; for a `for` loop with an increment this is the
    /// increment, not the top of the condition.
    start: usize,
    /// Scope depth outside the loop body; `break`/`continue` discard locals
    /// deeper than this.
    scope_depth: i32,
    /// Forward jumps emitted by `break`, patched at loop exit.
    break_jumps: Vec<usize>,
}

/// Per-function compilation state. Nested `fun`s push and pop these in
/// stack discipline.
struct FunctionState<'src> {
    function: ObjFunction,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: SmallVec<[CompilerUpvalue; 8]>,
    loops: Vec<LoopState>,
    scope_depth: i32,
    /// Interned string -> constant-pool index, so repeated string and
    /// identifier constants share one pool slot.
    strings: Table,
}

impl<'src> FunctionState<'src> {
    fn new(fn_type: FunctionType, name: Option<ObjRef>) -> FunctionState<'src> {
        // Slot 0 belongs to the callee; methods and initializers expose it
        // as `this`, everything else keeps it unnameable.
        let reserved = Local {
            name: match fn_type {
                FunctionType::Method | FunctionType::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_captured: false,
        };
        FunctionState {
            function: ObjFunction::new(name),
            fn_type,
            locals: vec![reserved],
            upvalues: SmallVec::new(),
            loops: Vec::new(),
            scope_depth: 0,
            strings: Table::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// GC roots while compiling: the caller's ambient roots (the VM's globals
/// and stack survive a collection triggered mid-compile), plus every
/// in-progress function's name, chunk constants and dedup keys.
struct CompilerRoots<'a, 'src> {
    ambient: &'a dyn Trace,
    functions: &'a [FunctionState<'src>],
}

impl Trace for CompilerRoots<'_, '_> {
    fn trace(&self, heap: &mut Heap) {
        self.ambient.trace(heap);
        for state in self.functions {
            if let Some(name) = state.function.name {
                heap.mark_object(name);
            }
            for &constant in &state.function.chunk.constants {
                heap.mark_value(constant);
            }
            for (key, _) in state.strings.iter() {
                heap.mark_object(key);
            }
        }
    }
}

struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'ctx mut Heap,
    err: &'ctx mut dyn Write,
    /// Roots the embedder holds across this compilation (the VM's state).
    ambient: &'ctx dyn Trace,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

/// Compiles `source` into a top-level function object, writing diagnostics
/// to `err`. `ambient` supplies the caller's GC roots, marked in addition to
/// the compiler's own whenever an allocation here triggers a collection.
/// Returns `None` if any error was reported.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    err: &mut dyn Write,
    ambient: &dyn Trace,
) -> Option<ObjRef> {
    let mut parser = Parser::new(source, heap, err, ambient);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    if parser.had_error {
        None
    } else {
        Some(function)
    }
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    fn new(
        source: &'src str,
        heap: &'ctx mut Heap,
        err: &'ctx mut dyn Write,
        ambient: &'ctx dyn Trace,
    ) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Parser {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            heap,
            err,
            ambient,
            functions: vec![FunctionState::new(FunctionType::Script, None)],
            classes: Vec::new(),
        }
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
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

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Peeks one token past `current`. Scanners are cheap to clone, so the
    /// occasional two-token decision (declaration vs. lambda) rescans.
    fn next_is_identifier(&self) -> bool {
        let mut lookahead = self.scanner.clone();
        lookahead.scan_token().kind == TokenKind::Identifier
    }

    // === Diagnostics ===

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let _ = write!(self.err, "[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => {
                let _ = write!(self.err, " at end");
            }
            // The lexeme of an Error token is the message, not source text.
            TokenKind::Error => {}
            _ => {
                let _ = write!(self.err, " at '{}'", token.lexeme);
            }
        }
        let _ = writeln!(self.err, ": {}", message);
        self.had_error = true;
    }

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
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Heap access ===

    fn intern(&mut self, text: &str) -> ObjRef {
        self.heap.intern(
            text,
            &CompilerRoots {
                ambient: self.ambient,
                functions: &self.functions,
            },
        )
    }

    // === Emission ===

    fn state(&self) -> &FunctionState<'src> {
        self.functions.last().expect("compiler state underflow")
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.functions.last_mut().expect("compiler state underflow")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    fn code_len(&self) -> usize {
        self.state().function.chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    /// Emits an index-bearing opcode, choosing the short form whenever the
    /// index fits in a byte and the big-endian long form otherwise.
    fn emit_indexed(&mut self, short: OpCode, long: OpCode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_op(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(long);
            self.emit_byte((index >> 8) as u8);
            self.emit_byte((index & 0xff) as u8);
        }
    }

    /// Adds a constant to the current chunk, deduplicating strings through
    /// the function-local intern-keyed table.
    fn make_constant(&mut self, value: Value) -> usize {
        let index = match value.as_obj() {
            Some(handle) if matches!(self.heap.get(handle), Obj::Str(_)) => {
                let hash = self.heap.string_hash(handle);
                let state = self.state_mut();
                if let Some(Value::Int(existing)) = state.strings.get(handle, hash) {
                    return existing as usize;
                }
                let index = state.function.chunk.add_constant(value);
                if index <= u16::MAX as usize {
                    state.strings.set(handle, hash, Value::Int(index as u32));
                }
                index
            }
            _ => self.current_chunk().add_constant(value),
        };
        if index > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
    }

    fn emit_return(&mut self) {
        if self.state().fn_type == FunctionType::Initializer {
            // An initializer always hands back its receiver.
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
            self.emit_op(OpCode::Return);
        } else {
            self.emit_op(OpCode::ReturnNil);
        }
    }

    /// Emits a forward jump with a placeholder offset; returns the operand
    /// position for [`Parser::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // Offset is relative to the byte after the two-byte operand.
        let jump = self.code_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::JumpBackwards);
        let offset = self.code_len() + 2 - start;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Finishes the innermost function: emits the implicit return, moves the
    /// finished function into the heap and returns its handle plus the
    /// upvalue descriptors the enclosing CLOSURE instruction needs.
    ///
    /// The collection trigger runs *before* the state is popped, so the
    /// finished chunk's constants are still rooted through the compiler
    /// chain when a collection happens.
    fn end_compiler(&mut self) -> (ObjRef, SmallVec<[CompilerUpvalue; 8]>) {
        self.emit_return();
        self.heap.maybe_collect(
            1024,
            &CompilerRoots {
                ambient: self.ambient,
                functions: &self.functions,
            },
        );
        let state = self.functions.pop().expect("compiler state underflow");
        let FunctionState {
            function, upvalues, ..
        } = state;
        let handle = self.heap.alloc_raw(Obj::Function(function));
        (handle, upvalues)
    }

    // === Scopes and variables ===

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }
            let op = if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit_op(op);
            self.state_mut().locals.pop();
        }
    }

    /// Emits pops for locals deeper than `depth` without discarding their
    /// compile-time records; `break` and `continue` leave the current scope
    /// on a jump but the source after them still sees the locals.
    fn discard_locals(&mut self, depth: i32) {
        let mut ops: Vec<OpCode> = Vec::new();
        for local in self.state().locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            ops.push(if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            });
        }
        for op in ops {
            self.emit_op(op);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let handle = self.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    /// Consumes an identifier; in a local scope declares it and returns 0,
    /// at global scope returns the name's constant index.
    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
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

    fn define_variable(&mut self, global: usize) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    fn resolve_local(&mut self, func: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.functions[func].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth == -1));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Resolves `name` as an upvalue of function `func`: first as a local of
    /// the enclosing function (marking it captured), then transitively as an
    /// upvalue of the enclosing function.
    fn resolve_upvalue(&mut self, func: usize, name: &str) -> Option<u8> {
        if func == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(func - 1, name) {
            self.functions[func - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(func, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(func - 1, name) {
            return self.add_upvalue(func, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, func: usize, index: u8, is_local: bool) -> Option<u8> {
        let descriptor = CompilerUpvalue { index, is_local };
        if let Some(existing) = self.functions[func]
            .upvalues
            .iter()
            .position(|up| *up == descriptor)
        {
            return Some(existing as u8);
        }
        if self.functions[func].upvalues.len() == UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        let state = &mut self.functions[func];
        state.upvalues.push(descriptor);
        state.function.upvalue_count += 1;
        Some((state.upvalues.len() - 1) as u8)
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let name = token.lexeme;
        let top = self.functions.len() - 1;

        if let Some(slot) = self.resolve_local(top, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetLocal);
                self.emit_byte(slot);
            } else {
                self.emit_op(OpCode::GetLocal);
                self.emit_byte(slot);
            }
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetUpvalue);
                self.emit_byte(slot);
            } else {
                self.emit_op(OpCode::GetUpvalue);
                self.emit_byte(slot);
            }
        } else {
            let index = self.identifier_constant(name);
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, index);
            } else {
                self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, index);
            }
        }
    }

    fn synthetic(&self, name: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Identifier,
            lexeme: name,
            line: self.previous.line,
        }
    }

    // === Declarations ===

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.check(TokenKind::Fun) && self.next_is_identifier() {
            self.advance();
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.intern(self.previous.lexeme);
        // Functions may refer to themselves; the name is usable before the
        // body finishes compiling.
        self.mark_initialized();
        self.function(FunctionType::Function, Some(name));
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // A scope holding the synthetic `super` local lets methods
            // capture the superclass as an upvalue.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("class state underflow")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self
            .classes
            .last()
            .expect("class state underflow")
            .has_superclass
        {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let fn_type = if self.previous.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        let name = self.intern(self.previous.lexeme);
        self.function(fn_type, Some(name));
        self.emit_indexed(OpCode::Method, OpCode::MethodLong, constant);
    }

    /// Compiles a function body (the part from `(` on) as a nested
    /// compilation, then emits the CLOSURE instruction with its upvalue
    /// descriptors.
    fn function(&mut self, fn_type: FunctionType, name: Option<ObjRef>) {
        self.functions.push(FunctionState::new(fn_type, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.state_mut().function.arity += 1;
                if self.state().function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (handle, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(handle));
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    // === Statements ===

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
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
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.begin_loop(loop_start);

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment runs after the body: jump over it now, run it on
            // the way back around.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn begin_loop(&mut self, start: usize) {
        let scope_depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopState {
            start,
            scope_depth,
            break_jumps: Vec::new(),
        });
    }

    /// Pops the loop record and patches every `break` to land here, after
    /// the loop's own exit sequence, where no condition value remains.
    fn end_loop(&mut self) {
        let finished = self
            .state_mut()
            .loops
            .pop()
            .expect("loop state underflow");
        for jump in finished.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.state().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let depth = self.state().loops.last().map(|l| l.scope_depth).unwrap_or(0);
        self.discard_locals(depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.state_mut()
            .loops
            .last_mut()
            .expect("loop state underflow")
            .break_jumps
            .push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.state().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let (start, depth) = {
            let looped = self.state().loops.last().expect("loop state underflow");
            (looped.start, looped.scope_depth)
        };
        self.discard_locals(depth);
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.state().fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        // Only the loosest precedence may treat a following `=` as
        // assignment; tighter contexts leave it for the error below.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind)
                .infix
                .expect("infix rule missing for operator token");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner produced an unparsable number");
        if value == (value as u8) as f64 {
            self.emit_op(OpCode::ByteNum);
            self.emit_byte(value as u8);
        } else {
            self.emit_constant(Value::Number(value));
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let handle = self.intern(contents);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::Invert),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(get_rule(op).precedence.next());
        let emitted = match op {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Subtract,
            TokenKind::Star => OpCode::Multiply,
            TokenKind::Slash => OpCode::Divide,
            TokenKind::Ampersand => OpCode::BitAnd,
            TokenKind::Pipe => OpCode::BitOr,
            TokenKind::Caret => OpCode::BitXor,
            TokenKind::ShiftLeft => OpCode::ShiftLeft,
            TokenKind::ShiftRight => OpCode::ShiftRight,
            TokenKind::EqualEqual => OpCode::Eq,
            TokenKind::BangEqual => OpCode::Neq,
            TokenKind::Greater => OpCode::Gt,
            TokenKind::GreaterEqual => OpCode::Gte,
            TokenKind::Less => OpCode::Lt,
            TokenKind::LessEqual => OpCode::Lte,
            _ => unreachable!("binary rule on non-binary token"),
        };
        self.emit_op(emitted);
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property access + call.
            let argc = self.argument_list();
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, name);
            self.emit_byte(argc);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, name);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 subscript indices.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after subscript.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SubscriptAssign);
        } else {
            self.emit_op(OpCode::Subscript);
        }
        self.emit_byte(count.min(255) as u8);
    }

    fn array(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 array elements.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit_op(OpCode::NewArray);
        self.emit_byte(count.min(255) as u8);
    }

    fn lambda(&mut self, _can_assign: bool) {
        let name = self.intern("anonymous");
        self.function(FunctionType::Function, Some(name));
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self
            .classes
            .last()
            .expect("class state underflow")
            .has_superclass
        {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        let this_token = self.synthetic("this");
        let super_token = self.synthetic("super");
        self.named_variable(this_token, false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_indexed(OpCode::SuperInvoke, OpCode::SuperInvokeLong, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(super_token, false);
            self.emit_indexed(OpCode::GetSuper, OpCode::GetSuperLong, name);
        }
    }
}

/// The Pratt table: prefix/infix parselets and binding precedence per token
/// kind.
fn get_rule<'src, 'ctx>(kind: TokenKind) -> ParseRule<'src, 'ctx> {
    use TokenKind::*;

    fn rule<'src, 'ctx>(
        prefix: Option<ParseFn<'src, 'ctx>>,
        infix: Option<ParseFn<'src, 'ctx>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'ctx> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        LeftParen => rule(Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        LeftBracket => rule(Some(Parser::array), Some(Parser::subscript), Precedence::Call),
        Dot => rule(None, Some(Parser::dot), Precedence::Call),
        Minus => rule(Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        Plus => rule(None, Some(Parser::binary), Precedence::Term),
        Star | Slash => rule(None, Some(Parser::binary), Precedence::Factor),
        Ampersand => rule(None, Some(Parser::binary), Precedence::BitAnd),
        Pipe => rule(None, Some(Parser::binary), Precedence::BitOr),
        Caret => rule(None, Some(Parser::binary), Precedence::BitXor),
        ShiftLeft | ShiftRight => rule(None, Some(Parser::binary), Precedence::Shift),
        Tilde => rule(Some(Parser::unary), None, Precedence::None),
        Bang => rule(Some(Parser::unary), None, Precedence::None),
        BangEqual | EqualEqual => rule(None, Some(Parser::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            rule(None, Some(Parser::binary), Precedence::Comparison)
        }
        Identifier => rule(Some(Parser::variable), None, Precedence::None),
        Str => rule(Some(Parser::string), None, Precedence::None),
        Number => rule(Some(Parser::number), None, Precedence::None),
        And => rule(None, Some(Parser::and_), Precedence::And),
        Or => rule(None, Some(Parser::or_), Precedence::Or),
        Nil | True | False => rule(Some(Parser::literal), None, Precedence::None),
        Fun => rule(Some(Parser::lambda), None, Precedence::None),
        This => rule(Some(Parser::this_), None, Precedence::None),
        Super => rule(Some(Parser::super_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, NoRoots};
    use pretty_assertions::assert_eq;

    fn compile_source(source: &str) -> (Option<ObjRef>, Heap, String) {
        let mut heap = Heap::new();
        let mut err: Vec<u8> = Vec::new();
        let function = compile(source, &mut heap, &mut err, &NoRoots);
        (function, heap, String::from_utf8(err).unwrap())
    }

    fn code_of(source: &str) -> Vec<u8> {
        let (function, heap, err) = compile_source(source);
        let function = function.unwrap_or_else(|| panic!("compile failed: {err}"));
        heap.as_function(function).chunk.code.clone()
    }

    #[test]
    fn arithmetic_uses_byte_num_for_small_ints() {
        let code = code_of("print 1 + 2 * 3;");
        let expected: Vec<u8> = vec![
            OpCode::ByteNum.into(),
            1,
            OpCode::ByteNum.into(),
            2,
            OpCode::ByteNum.into(),
            3,
            OpCode::Multiply.into(),
            OpCode::Add.into(),
            OpCode::Print.into(),
            OpCode::ReturnNil.into(),
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn large_numbers_use_the_constant_pool() {
        let code = code_of("print 256;");
        let expected: Vec<u8> = vec![
            OpCode::Constant.into(),
            0,
            OpCode::Print.into(),
            OpCode::ReturnNil.into(),
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn string_constants_are_deduplicated() {
        let (function, heap, _) = compile_source("print \"a\"; print \"a\"; print \"b\";");
        let function = heap.as_function(function.unwrap());
        let strings = function
            .chunk
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Obj(_)))
            .count();
        assert_eq!(strings, 2);
    }

    #[test]
    fn invalid_assignment_target() {
        let (function, _, err) = compile_source("1 = 2;");
        assert!(function.is_none());
        assert!(err.contains("Invalid assignment target."), "{err}");
    }

    #[test]
    fn error_reports_line_and_lexeme() {
        let (function, _, err) = compile_source("print 1\nvar;");
        assert!(function.is_none());
        assert!(err.contains("[line 2] Error at 'var'"), "{err}");
    }

    #[test]
    fn panic_mode_suppresses_cascades() {
        // Both statements are bad; only one error per statement surfaces.
        let (_, _, err) = compile_source("var 1; var 2;");
        assert_eq!(err.matches("Error").count(), 2);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let (function, _, err) = compile_source("break;");
        assert!(function.is_none());
        assert!(err.contains("Can't use 'break' outside of a loop."), "{err}");
    }

    #[test]
    fn continue_outside_loop_is_an_error() {
        let (function, _, err) = compile_source("continue;");
        assert!(function.is_none());
        assert!(
            err.contains("Can't use 'continue' outside of a loop."),
            "{err}"
        );
    }

    #[test]
    fn multiple_breaks_in_one_loop_compile() {
        let (function, _, err) =
            compile_source("while (true) { if (1 > 2) break; if (2 > 1) break; break; }");
        assert!(function.is_some(), "{err}");
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        let (function, _, err) = compile_source("return 1;");
        assert!(function.is_none());
        assert!(err.contains("Can't return from top-level code."), "{err}");
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let (function, _, err) = compile_source("class A { init() { return 3; } }");
        assert!(function.is_none());
        assert!(
            err.contains("Can't return a value from an initializer."),
            "{err}"
        );
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let (function, _, err) = compile_source("print this;");
        assert!(function.is_none());
        assert!(err.contains("Can't use 'this' outside of a class."), "{err}");
    }

    #[test]
    fn super_without_superclass_is_an_error() {
        let (function, _, err) = compile_source("class A { m() { super.m(); } }");
        assert!(function.is_none());
        assert!(
            err.contains("Can't use 'super' in a class with no superclass."),
            "{err}"
        );
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        let (function, _, err) = compile_source("class A < A {}");
        assert!(function.is_none());
        assert!(err.contains("A class can't inherit from itself."), "{err}");
    }

    #[test]
    fn local_limit_is_enforced() {
        let mut body = String::new();
        for i in 0..255 {
            body.push_str(&format!("var l{i} = 0;"));
        }
        let source = format!("fun f() {{ {body} }}");
        let (function, _, err) = compile_source(&source);
        assert!(function.is_some(), "255 locals must compile: {err}");

        let source = format!("fun f() {{ {body} var overflow = 0;  }}");
        let (function, _, err) = compile_source(&source);
        assert!(function.is_none());
        assert!(
            err.contains("Too many local variables in function."),
            "{err}"
        );
    }

    #[test]
    fn long_constant_form_after_256_entries() {
        // 300 distinct numeric constants force the long form for the tail.
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("print {};", 1000 + i));
        }
        let code = code_of(&source);
        let long: u8 = OpCode::ConstantLong.into();
        assert!(code.contains(&long));
    }

    #[test]
    fn duplicate_local_in_scope_is_an_error() {
        let (function, _, err) = compile_source("{ var a = 1; var a = 2; }");
        assert!(function.is_none());
        assert!(
            err.contains("Already a variable with this name in this scope."),
            "{err}"
        );
    }

    #[test]
    fn lambda_expression_compiles() {
        let (function, _, err) = compile_source("var f = fun(x) { return x; }; print f(1);");
        assert!(function.is_some(), "{err}");
    }
}
