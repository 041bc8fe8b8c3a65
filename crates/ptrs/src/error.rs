//! The error channel: non-local exit with source position and stack trace.
//!
//! Internally every fallible operation returns [`RunResult`]. A raised fault
//! carries its kind, message, and the position it was raised at; the call
//! engine appends `(callee, position)` pairs while unwinding so an uncaught
//! fault can print the full chain. The public [`Exception`] type is the
//! rendered form handed to embedders and the CLI.

use std::fmt::{self, Write};

use strum::{Display, EnumString, IntoStaticStr};

use crate::value::Var;

/// Result type alias for operations that can raise a runtime fault.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// The catchable fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum ErrorKind {
    /// Operator/type mismatch or a bad coercion.
    TypeError,
    /// Mismatched call.
    ArityError,
    /// Assignment to something that is not addressable.
    NotAnLValue,
    /// Indexing or slicing outside `0..size` while safety checks are on.
    OutOfRange,
    /// Struct member protection violation.
    AccessDenied,
    /// Import path or symbol resolution failure.
    ImportError,
    /// The FFI layer could not prepare or perform a native call.
    NativeCallFailure,
    /// Arena exhaustion or call depth overflow.
    StackOverflow,
    /// Raised by the `throw` statement.
    UserError,
    /// An asynchronous signal intercepted during execution.
    Signal,
}

/// A resolved source position: file, line, column, and the text of the line
/// (kept for the caret rendering).
#[derive(Debug, Clone)]
pub(crate) struct RaisePos {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub source_line: String,
}

/// One entry of the dynamic caller chain, recorded while unwinding.
#[derive(Debug, Clone)]
pub(crate) struct TraceFrame {
    pub callee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug)]
pub(crate) struct ExcData {
    pub kind: ErrorKind,
    pub message: String,
    pub pos: Option<RaisePos>,
    pub trace: Vec<TraceFrame>,
}

/// Control-flow tokens that unwind through a for-in overload.
///
/// When a loop body driven by a yielder callback executes `break` or
/// `return`, the token must cross the overload's frames without being caught
/// by any `try` in between, so it travels on the error channel in a variant
/// that the catch machinery ignores.
#[derive(Debug)]
pub(crate) enum LoopUnwind {
    Break,
    Return(Var),
}

#[derive(Debug)]
pub(crate) enum RunError {
    Exc(Box<ExcData>),
    Unwind(LoopUnwind),
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Exc(Box::new(ExcData {
            kind,
            message: message.into(),
            pos: None,
            trace: Vec::new(),
        }))
    }

    /// Attaches a raise position if none was recorded yet.
    pub fn with_pos(mut self, pos: RaisePos) -> Self {
        if let Self::Exc(data) = &mut self
            && data.pos.is_none()
        {
            data.pos = Some(pos);
        }
        self
    }

    /// Appends a caller-chain entry; a no-op for loop unwinds.
    pub fn push_frame(&mut self, frame: TraceFrame) {
        if let Self::Exc(data) = self {
            data.trace.push(frame);
        }
    }
}

/// Computes 1-based line and column for a byte offset, plus the line's text.
pub(crate) fn locate(source: &str, offset: u32) -> (u32, u32, String) {
    let offset = (offset as usize).min(source.len());
    let mut line = 1u32;
    let mut line_start = 0usize;
    for (i, b) in source.bytes().enumerate().take(offset) {
        if b == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    let column = u32::try_from(offset - line_start).unwrap_or(0) + 1;
    let line_text = source[line_start..]
        .split('\n')
        .next()
        .unwrap_or("")
        .to_owned();
    (line, column, line_text)
}

/// A runtime or parse failure, rendered for embedders.
///
/// Displays as the message followed by the offending source line with a
/// caret and the recorded stack trace, mirroring the interpreter's stderr
/// report.
#[derive(Debug)]
pub struct Exception {
    kind: ErrorKind,
    message: String,
    pos: Option<RaisePos>,
    trace: Vec<TraceFrame>,
}

impl Exception {
    pub(crate) fn from_data(data: ExcData) -> Self {
        Self {
            kind: data.kind,
            message: data.message,
            pos: data.pos,
            trace: data.trace,
        }
    }

    pub(crate) fn parse_error(message: String, file: &str, source: &str, offset: u32) -> Self {
        let (line, column, source_line) = locate(source, offset);
        Self {
            kind: ErrorKind::ImportError,
            message,
            pos: Some(RaisePos {
                file: file.to_owned(),
                line,
                column,
                source_line,
            }),
            trace: Vec::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 1-based line of the raise position, if one was recorded.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.pos.as_ref().map(|p| p.line)
    }

    #[must_use]
    pub fn column(&self) -> Option<u32> {
        self.pos.as_ref().map(|p| p.column)
    }

    /// The rendered backtrace, one `at <callee> (<file>:<line>:<column>)`
    /// entry per dynamic caller.
    #[must_use]
    pub fn backtrace(&self) -> String {
        let mut out = String::new();
        for frame in &self.trace {
            let _ = write!(
                out,
                "    at {} ({}:{}:{})\n",
                frame.callee, frame.file, frame.line, frame.column
            );
        }
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(pos) = &self.pos {
            write!(f, "\n\n{}\n", pos.source_line)?;
            for ch in pos
                .source_line
                .chars()
                .take(pos.column.saturating_sub(1) as usize)
            {
                f.write_char(if ch == '\t' { '\t' } else { ' ' })?;
            }
            write!(f, "^\n({}:{}:{})", pos.file, pos.line, pos.column)?;
        }
        for frame in &self.trace {
            write!(
                f,
                "\n    at {} ({}:{}:{})",
                frame.callee, frame.file, frame.line, frame.column
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_finds_line_and_column() {
        let src = "var a = 1;\nvar b = ;\n";
        let offset = u32::try_from(src.find("= ;").unwrap() + 2).unwrap();
        let (line, column, text) = locate(src, offset);
        assert_eq!(line, 2);
        assert_eq!(column, 9);
        assert_eq!(text, "var b = ;");
    }

    #[test]
    fn kind_round_trips_through_strum() {
        assert_eq!(ErrorKind::TypeError.to_string(), "TypeError");
        assert_eq!(
            "StackOverflow".parse::<ErrorKind>().unwrap(),
            ErrorKind::StackOverflow
        );
    }
}
