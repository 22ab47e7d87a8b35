use std::io::{self, Write as _};

/// Trait for handling output produced by the `print` and `println` natives.
///
/// Implement this trait to capture or redirect program output. The default
/// implementation `StdPrint` writes to stdout.
pub trait PrintWriter {
    /// Called once for each formatted value passed to `print`/`println`.
    ///
    /// This method is responsible for writing only the given value's text, and
    /// must not add separators or a trailing newline. The final terminator
    /// (such as a newline from `println`) is emitted via [`stdout_push`].
    ///
    /// [`stdout_push`]: PrintWriter::stdout_push
    fn stdout_write(&mut self, output: &str);

    /// Adds a single character to stdout.
    ///
    /// Generally called to add the newline terminating `println` output.
    fn stdout_push(&mut self, end: char);
}

/// Default `PrintWriter` that writes to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(output.as_bytes());
        let _ = stdout.flush();
    }

    fn stdout_push(&mut self, end: char) {
        let mut buffer = [0u8; 4];
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(end.encode_utf8(&mut buffer).as_bytes());
        let _ = stdout.flush();
    }
}

/// A `PrintWriter` that collects all output into a string.
///
/// Useful for testing or capturing print output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    /// Creates a new empty `CollectStringPrint`.
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output as a string slice.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: &str) {
        self.0.push_str(output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// `PrintWriter` that ignores all output.
///
/// Useful for suppressing print output during benchmarking.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) {}

    fn stdout_push(&mut self, _end: char) {}
}
