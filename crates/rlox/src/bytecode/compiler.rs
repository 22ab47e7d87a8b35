//! Single-pass Pratt compiler.
//!
//! Parses source and emits bytecode in one pass, straight into the chunk of
//! the function being compiled. A stack of [`FunctionState`]s represents
//! nested function/method scopes; a parallel stack of [`ClassState`]s tracks
//! nested class declarations. There is no AST.
//!
//! Error handling is panic-mode: the first error in a statement is recorded
//! and further diagnostics are suppressed until `synchronize` skips to a
//! statement boundary, so one mistake yields one diagnostic but independent
//! mistakes all surface in a single compile.

use crate::{
    bytecode::{
        chunk::{Chunk, JumpLabel},
        op::Opcode,
    },
    error::{CompileErrors, Diagnostic},
    heap::{Heap, HeapData, HeapId},
    lexer::{Lexer, Token, TokenKind},
    object::{Function, intern},
    table::Table,
    value::Value,
};

/// Hard limit on locals and upvalues per function (1-byte slot operands).
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: u8 = 255;

/// Compiles `source` to the top-level script function.
///
/// The returned function has arity 0, no upvalues, and no name. Every
/// diagnostic reported during the pass fails the compile, even though
/// parsing continues past synchronization points.
pub(crate) fn compile(source: &str, heap: &mut Heap, strings: &mut Table) -> Result<HeapId, CompileErrors> {
    let mut compiler = Compiler::new(source, heap, strings);
    compiler.advance();
    while !compiler.match_(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();
    if compiler.diagnostics.is_empty() {
        Ok(function)
    } else {
        Err(CompileErrors::new(compiler.diagnostics))
    }
}

/// Expression precedence, lowest to highest.
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
    /// The next-higher level, used to make binary operators left-associative.
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

/// Row of the Pratt dispatch table.
struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

/// Pratt dispatch: what to do with a token in prefix and infix position.
fn rule_for<'src, 'vm>(kind: TokenKind) -> ParseRule<'src, 'vm> {
    use TokenKind::*;

    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash | Star => (None, Some(Compiler::binary), Precedence::Factor),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        Str => (Some(Compiler::string), None, Precedence::None),
        Int | Float => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and), Precedence::And),
        Or => (None, Some(Compiler::or), Precedence::Or),
        False | True | Nil => (Some(Compiler::literal), None, Precedence::None),
        Super => (Some(Compiler::super_), None, Precedence::None),
        This => (Some(Compiler::this), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    /// Set when a nested function closes over this local; scope exit then
    /// emits `CloseUpvalue` instead of `Pop`.
    is_captured: bool,
}

/// Compile-time upvalue descriptor, emitted after the `Closure` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-loop bookkeeping for `break`.
#[derive(Debug)]
struct LoopState {
    /// Scope depth at the loop itself; `break` discards locals deeper than
    /// this before jumping out.
    scope_depth: i32,
    breaks: Vec<JumpLabel>,
}

/// State for one function being compiled. The innermost entry of
/// `Compiler::functions` is the emission target.
#[derive(Debug)]
struct FunctionState<'src> {
    kind: FunctionKind,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    loops: Vec<LoopState>,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot 0 belongs to the callee: the receiver inside methods, unused
        // (and unnameable) otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// Per-class state: only whether a superclass scope is open, which gates
/// `super` expressions.
#[derive(Debug)]
struct ClassState {
    has_superclass: bool,
}

pub(crate) struct Compiler<'src, 'vm> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    heap: &'vm mut Heap,
    strings: &'vm mut Table,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    fn new(source: &'src str, heap: &'vm mut Heap, strings: &'vm mut Table) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: Token::synthetic_eof(),
            previous: Token::synthetic_eof(),
            diagnostics: Vec::new(),
            panic_mode: false,
            heap,
            strings,
            functions: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // ============================================================
    // Token plumbing
    // ============================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_owned();
            self.error_at_current(&message);
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

    fn match_(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ============================================================
    // Diagnostics
    // ============================================================

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
        let location = match token.kind {
            TokenKind::Eof => " at end".to_owned(),
            // Error tokens carry the lexer's message, not a lexeme.
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.diagnostics.push(Diagnostic::new(token.line, format!("Error{location}: {message}")));
    }

    /// Skips tokens until a statement boundary so independent errors can
    /// still be reported.
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
                | TokenKind::Return
                | TokenKind::Break => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ============================================================
    // Emission helpers
    // ============================================================

    fn fun(&self) -> &FunctionState<'src> {
        self.functions.last().expect("function stack empty")
    }

    fn fun_mut(&mut self) -> &mut FunctionState<'src> {
        self.functions.last_mut().expect("function stack empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.fun_mut().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, first: Opcode, second: Opcode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: Opcode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let line = self.previous.line;
        self.chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, label: JumpLabel) {
        if !self.chunk().patch_jump(label) {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if !self.chunk().emit_loop(loop_start, line) {
            self.error("Loop body too large.");
        }
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(Opcode::Constant, index);
    }

    /// An implicit return: initializers return `this` (slot 0), everything
    /// else returns `nil`.
    fn emit_return(&mut self) {
        if self.fun().kind == FunctionKind::Initializer {
            self.emit_op_byte(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = intern(self.heap, self.strings, name);
        self.make_constant(Value::Obj(id))
    }

    /// Finishes the innermost function: emits the implicit return and
    /// allocates the immutable [`Function`] object.
    fn end_function(&mut self) -> (HeapId, Vec<UpvalueRef>) {
        self.emit_return();
        let state = self.functions.pop().expect("function stack empty");
        let name = state.name.map(|name| intern(self.heap, self.strings, &name));
        let function = self.heap.allocate(HeapData::Function(Function {
            arity: state.arity,
            upvalue_count: state.upvalues.len() as u8,
            chunk: state.chunk,
            name,
        }));
        (function, state.upvalues)
    }

    // ============================================================
    // Scope handling
    // ============================================================

    fn begin_scope(&mut self) {
        self.fun_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fun_mut().scope_depth -= 1;
        loop {
            let state = self.fun();
            let Some(local) = state.locals.last() else { break };
            if local.depth <= state.scope_depth {
                break;
            }
            let captured = local.is_captured;
            self.fun_mut().locals.pop();
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.fun().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fun_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.fun().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self.fun();
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
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.fun_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().expect("no local to initialize").depth = depth;
    }

    /// Parses a variable name. Globals go through the constant pool; locals
    /// are declared in place and the returned index is unused.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.fun().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.fun().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(Opcode::DefineGlobal, global);
    }

    /// Searches `functions[func_idx]`'s locals, innermost first.
    fn resolve_local(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (slot, local) in self.functions[func_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth == -1));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Walks outward through enclosing functions, capturing the variable at
    /// every level so the innermost upvalue forwards through the chain.
    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_idx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        let reference = UpvalueRef { index, is_local };
        if let Some(existing) = self.functions[func_idx].upvalues.iter().position(|&up| up == reference) {
            return existing as u8;
        }
        if self.functions[func_idx].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[func_idx].upvalues.push(reference);
        (self.functions[func_idx].upvalues.len() - 1) as u8
    }

    // ============================================================
    // Declarations
    // ============================================================

    fn declaration(&mut self) {
        if self.match_(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();
        self.emit_op_byte(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // The superclass lives in a synthetic `super` local so methods
            // can reach it after the declaration completes.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(Opcode::Inherit);
            self.classes.last_mut().expect("class stack empty").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Opcode::Pop);

        if self.classes.last().expect("class stack empty").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        let name = self.previous.lexeme.to_owned();
        self.function(kind, name);
        self.emit_op_byte(Opcode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized before the body compiles so the function can recurse.
        self.mark_initialized();
        let name = self.previous.lexeme.to_owned();
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    /// Compiles a function body (parameters and block), then emits the
    /// `Closure` instruction with its upvalue descriptors.
    fn function(&mut self, kind: FunctionKind, name: String) {
        self.functions.push(FunctionState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.fun().arity == MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let arity = self.fun().arity.wrapping_add(1);
                self.fun_mut().arity = arity;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the frame unwinds wholesale on return.
        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(Opcode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // ============================================================
    // Statements
    // ============================================================

    fn statement(&mut self) {
        if self.match_(TokenKind::For) {
            self.for_statement();
        } else if self.match_(TokenKind::If) {
            self.if_statement();
        } else if self.match_(TokenKind::Return) {
            self.return_statement();
        } else if self.match_(TokenKind::While) {
            self.while_statement();
        } else if self.match_(TokenKind::Break) {
            self.break_statement();
        } else if self.match_(TokenKind::LeftBrace) {
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

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // The condition is popped on both paths.
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);
        if self.match_(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.fun().chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        let scope_depth = self.fun().scope_depth;
        self.fun_mut().loops.push(LoopState {
            scope_depth,
            breaks: Vec::new(),
        });
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        self.finish_loop();
    }

    /// `for (init; cond; incr) body` runs the increment between iterations
    /// via a jump over it into the body, preserving evaluation order.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.fun().chunk.code.len();
        let mut exit_jump = None;
        if !self.match_(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.fun().chunk.code.len();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.fun().scope_depth;
        self.fun_mut().loops.push(LoopState {
            scope_depth,
            breaks: Vec::new(),
        });
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Opcode::Pop);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// Jumps past the innermost enclosing loop, discarding any locals that
    /// belong to scopes inside it. The compile-time locals stay: code after
    /// the `break` in the same block is unreachable but still compiles
    /// against the full scope.
    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.fun().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let loop_depth = self.fun().loops.last().expect("loop stack empty").scope_depth;
        let mut discard = Vec::new();
        for local in self.fun().locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            discard.push(local.is_captured);
        }
        for captured in discard {
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
        let jump = self.emit_jump(Opcode::Jump);
        self.fun_mut().loops.last_mut().expect("loop stack empty").breaks.push(jump);
    }

    /// Patches every `break` in the innermost loop to land here.
    fn finish_loop(&mut self) {
        let state = self.fun_mut().loops.pop().expect("loop stack empty");
        for label in state.breaks {
            self.patch_jump(label);
        }
    }

    fn return_statement(&mut self) {
        if self.fun().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.fun().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }

    // ============================================================
    // Expressions
    // ============================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: dispatch the prefix rule for the token just
    /// consumed, then fold infix rules while their precedence holds.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        // Assignment binds loosest; a prefix target may consume `=` only
        // when nothing tighter encloses it.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            let infix = rule_for(self.previous.kind).infix.expect("token with precedence lacks infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        // Underscore separators are stripped before conversion; int and
        // float literals both become doubles.
        let text: String = self.previous.lexeme.chars().filter(|&c| c != '_').collect();
        let value: f64 = text.parse().expect("lexer produced an unparsable number");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let id = intern(self.heap, self.strings, text);
        self.emit_constant(Value::Obj(id));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let innermost = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(innermost, name.lexeme) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(innermost, name.lexeme) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (Opcode::GetGlobal, Opcode::SetGlobal, constant)
        };
        if can_assign && self.match_(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);
        let line = self.previous.line;

        self.named_variable(synthetic(TokenKind::This, "this", line), false);
        if self.match_(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(synthetic(TokenKind::Super, "super", line), false);
            self.emit_op_byte(Opcode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(synthetic(TokenKind::Super, "super", line), false);
            self.emit_op_byte(Opcode::GetSuper, name);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            TokenKind::Bang => self.emit_op(Opcode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = rule_for::<'_, '_>(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(Opcode::Equal, Opcode::Not),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Opcode::Less, Opcode::Not),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEqual => self.emit_ops(Opcode::Greater, Opcode::Not),
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    /// Short-circuit `and`: on a falsey left operand, skip the right and
    /// leave the left on the stack.
    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// Short-circuit `or`: on a truthy left operand, skip the right and
    /// leave the left on the stack.
    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(Opcode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(Opcode::SetProperty, name);
        } else if self.match_(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(Opcode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(Opcode::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count = arg_count.wrapping_add(1);
                if !self.match_(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count
    }
}

/// A token the parser invents (`this`/`super` lookups inside `super`
/// expressions).
fn synthetic(kind: TokenKind, lexeme: &'static str, line: u32) -> Token<'static> {
    Token { kind, lexeme, line }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode;

    fn compile_ok(source: &str) -> (Heap, HeapId) {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let function = compile(source, &mut heap, &mut strings).expect("source should compile");
        (heap, function)
    }

    fn opcodes(heap: &Heap, function: HeapId) -> Vec<Opcode> {
        let chunk = &heap.function(function).chunk;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = Opcode::from_repr(chunk.code[offset]).expect("valid opcode");
            out.push(op);
            offset += 1 + operand_len(chunk, op, offset);
        }
        out
    }

    fn operand_len(chunk: &crate::bytecode::chunk::Chunk, op: Opcode, after_op: usize) -> usize {
        match op {
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::Loop => 2,
            Opcode::Invoke | Opcode::SuperInvoke => 2,
            Opcode::Closure => {
                let constant = chunk.code[after_op] as usize;
                let Value::Obj(_) = chunk.constants[constant] else {
                    panic!("closure constant is not an object")
                };
                // 1 constant byte; upvalue pairs are counted by the caller's
                // test expectations, which only use closures without captures.
                1
            }
            Opcode::Constant
            | Opcode::GetLocal
            | Opcode::SetLocal
            | Opcode::GetGlobal
            | Opcode::DefineGlobal
            | Opcode::SetGlobal
            | Opcode::GetUpvalue
            | Opcode::SetUpvalue
            | Opcode::GetProperty
            | Opcode::SetProperty
            | Opcode::GetSuper
            | Opcode::Call
            | Opcode::Class
            | Opcode::Method => 1,
            _ => 0,
        }
    }

    #[test]
    fn expression_statement_pops() {
        let (heap, function) = compile_ok("1 + 2;");
        assert_eq!(opcodes(&heap, function), vec![
            Opcode::Constant,
            Opcode::Constant,
            Opcode::Add,
            Opcode::Pop,
            Opcode::Nil,
            Opcode::Return,
        ]);
    }

    #[test]
    fn if_pops_condition_on_both_paths() {
        let (heap, function) = compile_ok("if (true) 1; else 2;");
        assert_eq!(opcodes(&heap, function), vec![
            Opcode::True,
            Opcode::JumpIfFalse,
            Opcode::Pop,
            Opcode::Constant,
            Opcode::Pop,
            Opcode::Jump,
            Opcode::Pop,
            Opcode::Constant,
            Opcode::Pop,
            Opcode::Nil,
            Opcode::Return,
        ]);
    }

    #[test]
    fn while_loop_shape() {
        let (heap, function) = compile_ok("while (false) { }");
        assert_eq!(opcodes(&heap, function), vec![
            Opcode::False,
            Opcode::JumpIfFalse,
            Opcode::Pop,
            Opcode::Loop,
            Opcode::Pop,
            Opcode::Nil,
            Opcode::Return,
        ]);
    }

    #[test]
    fn locals_are_slots_not_names() {
        let (heap, function) = compile_ok("{ var a = 1; a; }");
        let ops = opcodes(&heap, function);
        assert!(ops.contains(&Opcode::GetLocal));
        assert!(!ops.contains(&Opcode::GetGlobal));
    }

    #[test]
    fn globals_go_through_the_constant_pool() {
        let (heap, function) = compile_ok("var a = 1; a;");
        let ops = opcodes(&heap, function);
        assert!(ops.contains(&Opcode::DefineGlobal));
        assert!(ops.contains(&Opcode::GetGlobal));
    }

    #[test]
    fn method_call_fuses_to_invoke() {
        let (heap, function) = compile_ok("var x; x.run();");
        let ops = opcodes(&heap, function);
        assert!(ops.contains(&Opcode::Invoke));
        assert!(!ops.contains(&Opcode::GetProperty));
    }

    #[test]
    fn property_read_stays_get_property() {
        let (heap, function) = compile_ok("var x; x.field;");
        let ops = opcodes(&heap, function);
        assert!(ops.contains(&Opcode::GetProperty));
        assert!(!ops.contains(&Opcode::Invoke));
    }

    #[test]
    fn too_many_constants_is_reported() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("{i}.5;\n"));
        }
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let err = compile(&source, &mut heap, &mut strings).expect_err("should overflow the pool");
        assert!(
            err.diagnostics()
                .iter()
                .any(|d| d.message().contains("Too many constants in one chunk."))
        );
    }

    #[test]
    fn error_recovery_reports_multiple_statements() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let err = compile("var 1 = 2;\nvar 3 = 4;\n", &mut heap, &mut strings).expect_err("bad declarations");
        assert_eq!(err.diagnostics().len(), 2, "synchronize allows a second diagnostic");
        assert_eq!(err.diagnostics()[0].line(), 1);
        assert_eq!(err.diagnostics()[1].line(), 2);
    }
}
