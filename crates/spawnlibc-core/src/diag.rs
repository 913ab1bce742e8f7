//! Diagnostic sink for warnings raised while creating or tearing down threads.
//!
//! Warnings can be raised on a freshly cloned thread that has no usable
//! `std` thread-locals and, in freestanding configurations, no allocator.
//! [`StderrSink`] therefore formats into a fixed stack buffer and writes it
//! with a single `write(2)`. Hosted programs that already run a `log`
//! backend can use [`LogSink`] instead.

use core::fmt::{self, Write as _};

/// Receiver for warnings. Implementations must not allocate or take locks
/// that a thread in the middle of being created might hold.
pub trait DiagnosticSink: Sync {
    fn warn(&self, args: fmt::Arguments<'_>);
}

/// Emit a warning through a sink with `format_args!` syntax.
#[macro_export]
macro_rules! diag_warn {
    ($sink:expr, $($arg:tt)*) => {
        $crate::diag::DiagnosticSink::warn($sink, format_args!($($arg)*))
    };
}

const LINE_CAPACITY: usize = 256;
const PREFIX: &[u8] = b"spawnlibc: ";

/// Fixed-capacity line buffer. Output past the capacity is truncated.
struct LineBuffer {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn push(&mut self, data: &[u8]) {
        // Keep one byte for the trailing newline.
        let room = LINE_CAPACITY - 1 - self.len;
        let n = data.len().min(room);
        self.bytes[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
    }

    fn finish(&mut self) {
        self.bytes[self.len] = b'\n';
        self.len += 1;
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

fn format_line(args: fmt::Arguments<'_>) -> LineBuffer {
    let mut line = LineBuffer::new();
    line.push(PREFIX);
    // LineBuffer never reports an error; truncation is silent.
    let _ = line.write_fmt(args);
    line.finish();
    line
}

/// Writes each warning as one line to file descriptor 2.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn warn(&self, args: fmt::Arguments<'_>) {
        let line = format_line(args);
        write_stderr(line.as_bytes());
    }
}

/// Raw syscall: host libc would store errno through a thread pointer the
/// calling thread may not share with it.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn write_stderr(bytes: &[u8]) {
    let _ = crate::syscall::sys_write(2, bytes);
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
#[allow(unsafe_code)]
fn write_stderr(bytes: &[u8]) {
    // SAFETY: `bytes` is a live buffer of `bytes.len()` bytes.
    let _ = unsafe { libc::write(2, bytes.as_ptr().cast(), bytes.len()) };
}

/// Forwards warnings to the `log` facade at warn level.
///
/// Only suitable when the installed logger is itself safe to call from a
/// thread that has not finished initializing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: "spawnlibc", "{args}");
    }
}

/// Keeps every warning in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: parking_lot::Mutex<Vec<String>>,
}

impl RecordingSink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: parking_lot::const_mutex(Vec::new()),
        }
    }

    /// Snapshot of the recorded warnings, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl DiagnosticSink for RecordingSink {
    fn warn(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().push(args.to_string());
    }
}
