use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;
use std::str::FromStr;

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// A root logger that swallows everything. Components take
/// `Into<Option<&Logger>>` and fall back to this when no parent is supplied.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Builds a logger writing to the terminal.
pub fn terminal(level: &str, stdout: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity(level));
    builder.destination(if stdout { Destination::Stdout } else { Destination::Stderr });

    builder.build().expect("Failed to initialize the terminal logger")
}

/// Builds a logger appending to the given file.
pub fn file<P: AsRef<Path>>(level: &str, path: P) -> Logger {
    let mut builder = FileLoggerBuilder::new(path);
    builder.level(severity(level));

    builder.build().expect("Failed to initialize the file logger")
}

#[inline]
fn severity(level: &str) -> Severity {
    Severity::from_str(level).unwrap_or(Severity::Info)
}
