//! The stack virtual machine.
//!
//! A single dispatch loop reads one opcode at a time from the current call
//! frame and interprets it against the operand stack. The VM owns all
//! mutable state: the heap, the operand and frame stacks, the globals table,
//! the weak string intern table, and the sorted open-upvalue list. Garbage
//! collection runs between instructions, never inside one, so every
//! multi-step allocation sequence is atomic with respect to the collector.
//!
//! Call dispatch, property access, and upvalue capture live in the `call`
//! submodule.

mod call;

use std::time::Instant;

use smallvec::SmallVec;

use crate::{
    bytecode::{compiler::compile, op::Opcode},
    debug::disassemble_chunk,
    error::{CompileErrors, InterpretError, RuntimeError, TraceFrame},
    heap::{Heap, HeapData, HeapId, HeapStats},
    io::{PrintWriter, StdPrint},
    natives::{self, NativeFn},
    object::{Closure, Native, Upvalue, intern},
    table::Table,
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

/// Maximum call depth. Exceeding it is the "Stack overflow." runtime error.
pub(crate) const FRAMES_MAX: usize = 64;

/// Operand stack capacity: every frame may use up to 256 slots.
const STACK_MAX: usize = FRAMES_MAX * 256;

/// One function activation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    /// The closure being executed.
    closure: HeapId,
    /// The closure's function, cached to save a hop per instruction.
    function: HeapId,
    /// Byte offset of the next instruction in the function's chunk.
    ip: usize,
    /// Operand-stack index of slot 0: the callee (or receiver), followed by
    /// the arguments and locals.
    slots: usize,
}

/// Pops two numbers and pushes the wrapped result of `a op b`.
macro_rules! binary_op {
    ($vm:expr, $wrap:path, $op:tt) => {{
        let (Value::Number(b), Value::Number(a)) = ($vm.pop(), $vm.pop()) else {
            return Err($vm.runtime_error("Operands must be numbers."));
        };
        $vm.push($wrap(a $op b));
    }};
}

/// The virtual machine.
///
/// Generic over the print writer and tracer so both compile away to direct
/// calls (or to nothing, for [`NoopTracer`]).
///
/// ```
/// use rlox::{CollectStringPrint, Vm};
///
/// let mut vm = Vm::with_writer(CollectStringPrint::new());
/// vm.interpret("println(1 + 2);").unwrap();
/// assert_eq!(vm.writer().output(), "3\n");
/// ```
pub struct Vm<P: PrintWriter = StdPrint, Tr: VmTracer = NoopTracer> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Global bindings. Strongly rooted.
    globals: Table,
    /// Interned strings. Weak: the GC prunes entries whose keys die.
    strings: Table,
    /// Open upvalues, sorted by stack slot, highest first.
    open_upvalues: Vec<HeapId>,
    /// The interned string `"init"`, kept alive for initializer lookup.
    init_string: HeapId,
    print: P,
    tracer: Tr,
    started: Instant,
}

impl Vm {
    /// A VM printing to stdout with tracing disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(StdPrint, NoopTracer)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PrintWriter> Vm<P, NoopTracer> {
    /// A VM with a custom print writer and tracing disabled.
    pub fn with_writer(print: P) -> Self {
        Self::with_parts(print, NoopTracer)
    }
}

impl<P: PrintWriter, Tr: VmTracer> Vm<P, Tr> {
    /// A VM with a custom print writer and tracer.
    ///
    /// Installs the mandatory natives `clock`, `print`, and `println`.
    pub fn with_parts(print: P, tracer: Tr) -> Self {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let init_string = intern(&mut heap, &mut strings, "init");
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            strings,
            open_upvalues: Vec::new(),
            init_string,
            print,
            tracer,
            started: Instant::now(),
        };
        vm.define_native("clock", natives::clock);
        vm.define_native("print", natives::print);
        vm.define_native("println", natives::println);
        vm
    }

    /// Compiles and runs `source`.
    ///
    /// Globals, interned strings, and defined classes survive across calls,
    /// so a host can feed successive snippets to one VM. On a runtime error
    /// the stacks are reset; the VM remains usable.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap, &mut self.strings).map_err(InterpretError::Compile)?;
        let closure = self.heap.allocate(HeapData::Closure(Closure {
            function,
            upvalues: SmallVec::new(),
        }));
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    /// Installs a global binding to a host-provided native function.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_id = intern(&mut self.heap, &mut self.strings, name);
        let hash = self.heap.string(name_id).hash;
        let native = self.heap.allocate(HeapData::Native(Native { function }));
        self.globals.set(name_id, hash, Value::Obj(native));
    }

    /// When enabled, a collection runs before every instruction. Observable
    /// behavior must not change; only timing does.
    pub fn set_stress_gc(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// Snapshot of the heap, for diagnostics and tests.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Compiles `source` without executing it and returns its disassembly:
    /// the script chunk followed by every nested function's chunk.
    pub fn disassemble(&mut self, source: &str) -> Result<String, CompileErrors> {
        let script = compile(source, &mut self.heap, &mut self.strings)?;
        let mut out = String::new();
        let mut pending = vec![(script, "script".to_owned())];
        while let Some((function, name)) = pending.pop() {
            out.push_str(&disassemble_chunk(&self.heap, &self.heap.function(function).chunk, &name));
            for &constant in &self.heap.function(function).chunk.constants {
                if let Value::Obj(child) = constant
                    && let HeapData::Function(nested) = self.heap.get(child)
                {
                    let child_name = match nested.name {
                        Some(id) => self.heap.string(id).as_str().to_owned(),
                        None => "script".to_owned(),
                    };
                    pending.push((child, child_name));
                }
            }
        }
        Ok(out)
    }

    /// The print writer, e.g. to read collected output.
    pub fn writer(&self) -> &P {
        &self.print
    }

    /// Consumes the VM and returns the print writer.
    pub fn into_writer(self) -> P {
        self.print
    }

    /// The tracer, e.g. to read profiling counters.
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    // ============================================================
    // Dispatch loop
    // ============================================================

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_gc() {
                self.collect_garbage();
            }

            let ip = self.frame().ip;
            let opcode = Opcode::from_repr(self.read_byte()).expect("invalid opcode in bytecode");
            self.tracer.on_instruction(ip, opcode, self.stack.len(), self.frames.len());

            match opcode {
                // ============================================================
                // Stack and constants
                // ============================================================
                Opcode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }

                // ============================================================
                // Variables
                // ============================================================
                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    // Assignment is an expression: the value stays on top.
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!("Undefined variable '{}'.", self.heap.string(name).as_str());
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment does not create globals; undo the insert.
                        self.globals.delete(name, hash);
                        let message = format!("Undefined variable '{}'.", self.heap.string(name).as_str());
                        return Err(self.runtime_error(message));
                    }
                }
                Opcode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[stack_slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let open_slot = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => Some(stack_slot),
                        Upvalue::Closed(_) => None,
                    };
                    match open_slot {
                        Some(stack_slot) => self.stack[stack_slot] = value,
                        None => *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value),
                    }
                }

                // ============================================================
                // Properties and super
                // ============================================================
                Opcode::GetProperty => {
                    let name = self.read_string();
                    self.op_get_property(name)?;
                }
                Opcode::SetProperty => {
                    let name = self.read_string();
                    self.op_set_property(name)?;
                }
                Opcode::GetSuper => {
                    let name = self.read_string();
                    self.op_get_super(name)?;
                }

                // ============================================================
                // Arithmetic and logic
                // ============================================================
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Opcode::Greater => binary_op!(self, Value::Bool, >),
                Opcode::Less => binary_op!(self, Value::Bool, <),
                Opcode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(x + y));
                        }
                        (Value::Obj(left), Value::Obj(right)) if self.is_string(left) && self.is_string(right) => {
                            self.concatenate(left, right);
                        }
                        _ => {
                            return Err(self.runtime_error("Operands to '+' must be two strings or two numbers"));
                        }
                    }
                }
                Opcode::Subtract => binary_op!(self, Value::Number, -),
                Opcode::Multiply => binary_op!(self, Value::Number, *),
                Opcode::Divide => binary_op!(self, Value::Number, /),
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Opcode::Negate => {
                    let Value::Number(value) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-value));
                }

                // ============================================================
                // Control flow
                // ============================================================
                Opcode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                // ============================================================
                // Calls and closures
                // ============================================================
                Opcode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                Opcode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    self.op_invoke(name, arg_count)?;
                }
                Opcode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    let Value::Obj(superclass) = self.pop() else {
                        unreachable!("superclass slot holds a class");
                    };
                    let hash = self.heap.string(name).hash;
                    self.invoke_from_class(superclass, name, hash, arg_count)?;
                }
                Opcode::Closure => {
                    let Value::Obj(function) = self.read_constant() else {
                        unreachable!("closure constant is a function");
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count as usize;
                    let enclosing = self.frame().closure;
                    let slots = self.frame().slots;
                    let mut upvalues: SmallVec<[HeapId; 4]> = SmallVec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(slots + index));
                        } else {
                            upvalues.push(self.heap.closure(enclosing).upvalues[index]);
                        }
                    }
                    let closure = self.heap.allocate(HeapData::Closure(Closure { function, upvalues }));
                    self.push(Value::Obj(closure));
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                // ============================================================
                // Classes
                // ============================================================
                Opcode::Class => {
                    let name = self.read_string();
                    let class = self.heap.allocate(HeapData::Class(crate::object::Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                Opcode::Inherit => {
                    let superclass = self.peek(1);
                    let Value::Obj(super_id) = superclass else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    if !matches!(self.heap.get(super_id), HeapData::Class(_)) {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let Value::Obj(sub_id) = self.peek(0) else {
                        unreachable!("subclass slot holds a class");
                    };
                    // Methods declared after Inherit override the copies.
                    let methods = {
                        let mut copied = Table::new();
                        copied.add_all(&self.heap.class(super_id).methods);
                        copied
                    };
                    self.heap.class_mut(sub_id).methods.add_all(&methods);
                    self.pop();
                }
                Opcode::Method => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let method = self.peek(0);
                    let Value::Obj(class) = self.peek(1) else {
                        unreachable!("method target is a class");
                    };
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }

                // ============================================================
                // Return
                // ============================================================
                Opcode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no frame to return from");
                    self.close_upvalues(frame.slots);
                    self.tracer.on_return(self.frames.len());
                    if self.frames.is_empty() {
                        // The script closure itself.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
            }
        }
    }

    // ============================================================
    // Frame and operand accessors
    // ============================================================

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = self.heap.function(frame.function).chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active frame");
        self.heap.function(frame.function).chunk.constants[index]
    }

    /// Reads a constant known to be an interned string (names).
    #[inline]
    fn read_string(&mut self) -> HeapId {
        let Value::Obj(id) = self.read_constant() else {
            unreachable!("name constant is an interned string");
        };
        id
    }

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn is_string(&self, id: HeapId) -> bool {
        matches!(self.heap.get(id), HeapData::Str(_))
    }

    fn concatenate(&mut self, left: HeapId, right: HeapId) {
        let mut text = String::with_capacity(
            self.heap.string(left).as_str().len() + self.heap.string(right).as_str().len(),
        );
        text.push_str(self.heap.string(left).as_str());
        text.push_str(self.heap.string(right).as_str());
        let id = intern(&mut self.heap, &mut self.strings, &text);
        self.pop();
        self.pop();
        self.push(Value::Obj(id));
    }

    // ============================================================
    // Errors
    // ============================================================

    /// Builds a [`RuntimeError`] with a trace of the live frames (innermost
    /// first) and resets the VM stacks.
    pub(crate) fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // The ip has advanced past the failing instruction; the line map
            // is per byte, so the previous byte carries its line.
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            let name = function.name.map(|id| self.heap.string(id).as_str().to_owned());
            trace.push(TraceFrame::new(line, name));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError::new(message.into(), trace)
    }

    // ============================================================
    // Garbage collection
    // ============================================================

    /// Marks the root set, traces, prunes dead intern entries, and sweeps.
    ///
    /// Roots: every operand-stack value, every frame's closure, the open
    /// upvalues, the globals table (keys and values), and the `"init"`
    /// sentinel. The intern table is deliberately not a root — it holds weak
    /// references and is pruned before the sweep.
    fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        self.globals.mark(&mut self.heap);
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.strings.remove_white(&self.heap);
        let (freed, live) = self.heap.sweep();
        self.tracer.on_gc(freed, live, self.heap.bytes_allocated());
    }
}
