//! Log sinks used by the request pipeline.
//!
//! The pipeline never logs request records through a global; it writes them
//! to the [`LogSink`] it was built with. Production uses [`TracingSink`],
//! tests capture lines with [`MemorySink`].

use std::sync::Mutex;

use tracing::{debug, info, warn};

/// Destination for request log lines.
///
/// Each call receives one preformatted line (which may contain embedded
/// newlines for indented JSON). Implementations must be safe to call from
/// many requests at once.
pub trait LogSink: Send + Sync {
    /// Detail lines; may be silenced entirely.
    fn verbose(&self, line: &str);
    /// Headline lines that stay visible in quiet mode.
    fn info(&self, line: &str);
    /// Deliberate faults and recoverable problems.
    fn warn(&self, line: &str);
}

/// Forwards lines to `tracing` on the `peekserve::request` target.
///
/// Verbose lines go out at DEBUG, so the subscriber's filter decides whether
/// they are shown.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn verbose(&self, line: &str) {
        debug!(target: "peekserve::request", "{}", line);
    }

    fn info(&self, line: &str) {
        info!(target: "peekserve::request", "{}", line);
    }

    fn warn(&self, line: &str) {
        warn!(target: "peekserve::request", "{}", line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkLevel {
    Verbose,
    Info,
    Warn,
}

/// Captures lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(SinkLevel, String)>>,
    quiet: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that drops verbose lines, like a quiet subscriber would.
    pub fn quiet() -> Self {
        Self {
            lines: Mutex::default(),
            quiet: true,
        }
    }

    /// All captured lines with their level, oldest first.
    pub fn entries(&self) -> Vec<(SinkLevel, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Captured lines at a single level.
    pub fn lines_at(&self, level: SinkLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line)
            .collect()
    }

    fn push(&self, level: SinkLevel, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, line.to_string()));
        }
    }
}

impl LogSink for MemorySink {
    fn verbose(&self, line: &str) {
        if !self.quiet {
            self.push(SinkLevel::Verbose, line);
        }
    }

    fn info(&self, line: &str) {
        self.push(SinkLevel::Info, line);
    }

    fn warn(&self, line: &str) {
        self.push(SinkLevel::Warn, line);
    }
}
