//! Native functions: host code callable from the language.
//!
//! A native is a plain function pointer invoked synchronously by the VM — no
//! call frame is pushed and no collection can run while one executes, so
//! natives may allocate through the context without rooting intermediate
//! values. The mandatory natives `clock`, `print`, and `println` are
//! installed at VM construction; hosts add their own through
//! [`Vm::define_native`](crate::Vm::define_native).

use std::time::Instant;

use crate::{
    heap::Heap,
    io::PrintWriter,
    object::intern,
    table::Table,
    value::{Value, value_to_string},
};

/// Signature of a native function.
///
/// Receives the call context and the argument values; returns the call's
/// result or an error that surfaces as a runtime error with a stack trace.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, NativeError>;

/// A failure raised by a native, converted by the VM into a runtime error.
#[derive(Debug)]
pub struct NativeError {
    message: String,
}

impl NativeError {
    /// A native error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn into_message(self) -> String {
        self.message
    }
}

/// What a native may touch while it runs: the heap (to allocate), the intern
/// table (so allocated strings stay deduplicated), and the print writer.
pub struct NativeCtx<'a> {
    heap: &'a mut Heap,
    strings: &'a mut Table,
    out: &'a mut dyn PrintWriter,
    started: Instant,
}

impl<'a> NativeCtx<'a> {
    pub(crate) fn new(
        heap: &'a mut Heap,
        strings: &'a mut Table,
        out: &'a mut dyn PrintWriter,
        started: Instant,
    ) -> Self {
        Self {
            heap,
            strings,
            out,
            started,
        }
    }

    /// Seconds elapsed since the VM was created.
    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Allocates (or reuses) the interned string for `text`.
    pub fn string_value(&mut self, text: &str) -> Value {
        Value::Obj(intern(self.heap, self.strings, text))
    }

    /// Renders a value the way `print` shows it.
    #[must_use]
    pub fn render(&self, value: Value) -> String {
        value_to_string(self.heap, value)
    }

    /// If `value` is a string, its text.
    #[must_use]
    pub fn as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Obj(id) => match self.heap.get(id) {
                crate::heap::HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Writes raw text to the program's output stream.
    pub fn write(&mut self, text: &str) {
        self.out.stdout_write(text);
    }

    /// Writes a single character to the program's output stream.
    pub fn write_char(&mut self, end: char) {
        self.out.stdout_push(end);
    }
}

/// `clock() -> number`: seconds since the VM started. Arguments are ignored.
pub(crate) fn clock(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Number(ctx.elapsed_seconds()))
}

/// `print(...values) -> nil`: writes each value with no separator and no
/// trailing newline.
pub(crate) fn print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    for &value in args {
        let text = ctx.render(value);
        ctx.write(&text);
    }
    Ok(Value::Nil)
}

/// `println(...values) -> nil`: as `print`, then a newline.
pub(crate) fn println(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, NativeError> {
    print(ctx, args)?;
    ctx.write_char('\n');
    Ok(Value::Nil)
}
