//! A bytecode compiler and stack virtual machine for the Lox language.
//!
//! Source text is lowered in a single pass by a Pratt compiler into bytecode
//! chunks, then executed immediately by a frame-stack interpreter. There is
//! no intermediate IR and no persisted bytecode. The runtime carries a full
//! object model — interned strings, first-class functions and closures with
//! upvalues, classes with single inheritance, bound methods, host natives —
//! on an arena heap governed by a precise tri-color mark-sweep collector.
//!
//! # Quick start
//!
//! ```
//! use rlox::{CollectStringPrint, Vm};
//!
//! let mut vm = Vm::with_writer(CollectStringPrint::new());
//! vm.interpret(
//!     r#"
//!     fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
//!     println(fib(10));
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(vm.writer().output(), "55\n");
//! ```
//!
//! Hosts extend the language with native functions:
//!
//! ```
//! use rlox::{CollectStringPrint, NativeCtx, NativeError, Value, Vm};
//!
//! fn shout(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
//!     let text = args.first().and_then(|&v| ctx.as_str(v).map(str::to_uppercase));
//!     let text = text.ok_or_else(|| NativeError::new("shout() expects a string."))?;
//!     Ok(ctx.string_value(&text))
//! }
//!
//! let mut vm = Vm::with_writer(CollectStringPrint::new());
//! vm.define_native("shout", shout);
//! vm.interpret(r#"println(shout("hi"));"#).unwrap();
//! assert_eq!(vm.writer().output(), "HI\n");
//! ```

mod bytecode;
mod debug;
mod error;
mod heap;
mod io;
mod lexer;
mod natives;
mod object;
mod table;
mod tracer;
mod value;

pub use crate::{
    bytecode::{op::Opcode, vm::Vm},
    error::{CompileErrors, Diagnostic, InterpretError, RuntimeError, TraceFrame},
    heap::{HeapId, HeapStats},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    natives::{NativeCtx, NativeError, NativeFn},
    tracer::{NoopTracer, ProfilingTracer, StderrTracer, VmTracer},
    value::Value,
};
