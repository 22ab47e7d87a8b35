//! Error values surfaced by [`Vm::interpret`](crate::Vm::interpret).
//!
//! Compile-time problems are collected as ordered [`Diagnostic`]s (panic mode
//! suppresses cascades between synchronization points, so one syntactic
//! mistake produces one diagnostic). Runtime failures carry the message plus
//! a stack trace built from the live call frames, innermost first.

use std::{error::Error, fmt};

/// Result of a failed interpretation.
#[derive(Debug)]
pub enum InterpretError {
    /// The source did not compile. No code was executed.
    Compile(CompileErrors),
    /// The compiled program failed at runtime. The VM stack has been reset.
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => errors.fmt(f),
            Self::Runtime(error) => error.fmt(f),
        }
    }
}

impl Error for InterpretError {}

/// All diagnostics reported during a single compile, in source order.
#[derive(Debug)]
pub struct CompileErrors {
    diagnostics: Vec<Diagnostic>,
}

impl CompileErrors {
    pub(crate) fn new(diagnostics: Vec<Diagnostic>) -> Self {
        debug_assert!(!diagnostics.is_empty(), "compile failure with no diagnostics");
        Self { diagnostics }
    }

    /// The individual diagnostics, in the order they were reported.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, diagnostic) in self.diagnostics.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            diagnostic.fmt(f)?;
        }
        Ok(())
    }
}

impl Error for CompileErrors {}

/// A single compile-time diagnostic.
///
/// The message already names the offending token where one is available,
/// e.g. `Error at 'x': Invalid assignment target.`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    line: u32,
    message: String,
}

impl Diagnostic {
    pub(crate) fn new(line: u32, message: String) -> Self {
        Self { line, message }
    }

    /// Source line the diagnostic refers to (1-based).
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// The diagnostic text, without the line prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)
    }
}

/// A runtime failure with its stack trace.
///
/// Rendered as the message followed by one line per active call frame,
/// innermost frame first:
///
/// ```text
/// Undefined property 'speak'.
/// [line 4] in greet()
/// [line 9] in script
/// ```
#[derive(Debug)]
pub struct RuntimeError {
    message: String,
    trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub(crate) fn new(message: String, trace: Vec<TraceFrame>) -> Self {
        Self { message, trace }
    }

    /// The error message without the trace.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stack trace, innermost frame first.
    #[must_use]
    pub fn trace(&self) -> &[TraceFrame] {
        &self.trace
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl Error for RuntimeError {}

/// One frame of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    line: u32,
    function: Option<String>,
}

impl TraceFrame {
    pub(crate) fn new(line: u32, function: Option<String>) -> Self {
        Self { line, function }
    }

    /// Source line of the instruction the frame was executing.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Function name, or `None` for top-level code.
    #[must_use]
    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}
