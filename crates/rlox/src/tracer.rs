//! VM execution tracing infrastructure.
//!
//! Provides a trait-based tracing system for the bytecode VM with zero-cost
//! abstraction. When using [`NoopTracer`], all trace methods compile away
//! entirely via monomorphization.
//!
//! The [`VmTracer`] trait defines hook points at key execution events
//! (instruction dispatch, function calls/returns, garbage collection).
//! Concrete implementations collect different kinds of data:
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters |
//!
//! The VM is parameterized as `Vm<P: PrintWriter, Tr: VmTracer>`. Callers
//! choose the tracer at construction time:
//!
//! ```
//! use rlox::{CollectStringPrint, ProfilingTracer, Vm};
//!
//! let mut vm = Vm::with_parts(CollectStringPrint::new(), ProfilingTracer::new());
//! vm.interpret("var x = 1 + 2;").unwrap();
//! assert!(vm.tracer().total_instructions() > 0);
//! ```

use std::collections::HashMap;

use crate::bytecode::op::Opcode;

/// Trait for VM execution tracing.
///
/// All methods have default no-op implementations, so [`NoopTracer`] requires
/// zero lines of code and compiles to zero instructions. Implementations only
/// override the hooks they care about.
pub trait VmTracer {
    /// Called before each opcode dispatch in the main execution loop.
    ///
    /// This is the hottest hook, called for every single bytecode
    /// instruction. Implementations should be as lightweight as possible.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called when a new call frame is pushed.
    ///
    /// `name` is the function name if available (`None` for top-level code).
    #[inline(always)]
    fn on_call(&mut self, _name: Option<&str>, _depth: usize) {}

    /// Called when a call frame is popped.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called after each garbage collection cycle.
    #[inline(always)]
    fn on_gc(&mut self, _freed_objects: usize, _live_objects: usize, _bytes_allocated: usize) {}
}

/// Zero-cost tracer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that writes a human-readable execution log to stderr.
///
/// Intended for debugging the interpreter itself. The per-instruction output
/// is verbose; use on small programs.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl StderrTracer {
    /// Creates a new stderr tracer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        eprintln!("[trace] {ip:04} {opcode:<14} stack={stack_depth} frames={frame_depth}");
    }

    fn on_call(&mut self, name: Option<&str>, depth: usize) {
        eprintln!("[trace] call {} (depth {depth})", name.unwrap_or("script"));
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("[trace] return (depth {depth})");
    }

    fn on_gc(&mut self, freed_objects: usize, live_objects: usize, bytes_allocated: usize) {
        eprintln!("[trace] gc freed={freed_objects} live={live_objects} bytes={bytes_allocated}");
    }
}

/// Tracer that counts executed opcodes, calls, returns, and GC cycles.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    counts: HashMap<Opcode, u64>,
    calls: u64,
    returns: u64,
    gc_cycles: u64,
}

impl ProfilingTracer {
    /// Creates a new profiling tracer with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `opcode` was dispatched.
    #[must_use]
    pub fn instruction_count(&self, opcode: Opcode) -> u64 {
        self.counts.get(&opcode).copied().unwrap_or(0)
    }

    /// Total number of instructions dispatched.
    #[must_use]
    pub fn total_instructions(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Number of call frames pushed.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Number of call frames popped.
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns
    }

    /// Number of garbage collection cycles observed.
    #[must_use]
    pub fn gc_cycles(&self) -> u64 {
        self.gc_cycles
    }

    /// Renders a per-opcode frequency report, most frequent first.
    #[must_use]
    pub fn report(&self) -> String {
        let mut rows: Vec<(Opcode, u64)> = self.counts.iter().map(|(&op, &count)| (op, count)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name().cmp(b.0.name())));
        let mut out = String::new();
        for (opcode, count) in rows {
            out.push_str(&format!("{:<14} {count}\n", opcode.name()));
        }
        out.push_str(&format!(
            "total {} instructions, {} calls, {} gc cycles\n",
            self.total_instructions(),
            self.calls,
            self.gc_cycles
        ));
        out
    }
}

impl VmTracer for ProfilingTracer {
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.counts.entry(opcode).or_insert(0) += 1;
    }

    fn on_call(&mut self, _name: Option<&str>, _depth: usize) {
        self.calls += 1;
    }

    fn on_return(&mut self, _depth: usize) {
        self.returns += 1;
    }

    fn on_gc(&mut self, _freed_objects: usize, _live_objects: usize, _bytes_allocated: usize) {
        self.gc_cycles += 1;
    }
}
