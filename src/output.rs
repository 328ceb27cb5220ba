//! Console history for the database.
//!
//! `ConsoleBuffer` keeps the last N lines the database printed, plus notes the
//! shell itself adds (launch failures, exit codes). Frontends render or export
//! it; the bridge hands it out as `console_history`.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Where a console line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
    /// Written by dbdeck, not by the database.
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub text: String,
    pub source: LineSource,
}

impl ConsoleLine {
    pub fn new(text: impl Into<String>, source: LineSource) -> Self {
        Self {
            text: text.into(),
            source,
        }
    }
}

/// A fixed-capacity ring buffer of console lines.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    max_lines: usize,
    lines: VecDeque<ConsoleLine>,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line, returning `true` if the oldest line was dropped.
    pub fn push(&mut self, line: ConsoleLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsoleLine> {
        self.lines.iter()
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// Invalid UTF-8 left behind by stripping is replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
