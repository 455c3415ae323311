// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The apply transcript: a single human-readable log assembled incrementally.
//!
//! Sections are separated by blank lines and titled `=== Title ===`; each
//! command contributes a `$ command` line, its merged output, and a
//! `(no output)` placeholder when silent. The transcript is shared between
//! the command stream tasks and the progress callback, so appends go through
//! a small mutex.

use std::sync::Mutex;

/// Incrementally built apply/destroy log.
#[derive(Default)]
pub struct Transcript {
    inner: Mutex<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new titled section.
    pub fn section(&self, title: &str) {
        let mut inner = self.inner.lock().expect("transcript lock poisoned");
        if !inner.is_empty() {
            inner.push_str("\n\n");
        }
        inner.push_str("=== ");
        inner.push_str(title.trim());
        inner.push_str(" ===\n");
    }

    /// Append one trimmed line.
    pub fn line(&self, line: &str) {
        let mut inner = self.inner.lock().expect("transcript lock poisoned");
        inner.push_str(line.trim());
        inner.push('\n');
    }

    /// Append a pre-formatted block, separated from prior content.
    pub fn block(&self, block: &str) {
        let block = block.trim();
        if block.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("transcript lock poisoned");
        if !inner.is_empty() {
            inner.push_str("\n\n");
        }
        inner.push_str(block);
    }

    /// Append a `$ command` line.
    pub fn command(&self, command_line: &str) {
        let mut inner = self.inner.lock().expect("transcript lock poisoned");
        inner.push_str("$ ");
        inner.push_str(command_line);
        inner.push('\n');
    }

    /// Append raw output as-is (streamed subprocess chunks).
    pub fn raw(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("transcript lock poisoned");
        inner.push_str(chunk);
    }

    /// Current trimmed contents.
    pub fn snapshot(&self) -> String {
        self.inner
            .lock()
            .expect("transcript lock poisoned")
            .trim()
            .to_string()
    }
}

/// Render a command line for the transcript, quoting arguments with spaces.
pub fn format_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    for arg in args {
        if arg.contains(' ') || arg.contains('\t') {
            parts.push(format!("{arg:?}"));
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

/// Truncate long command output for structured logs.
pub fn truncate_output(value: &str) -> String {
    const MAX_LEN: usize = 2000;
    let trimmed = value.trim();
    if trimmed.len() <= MAX_LEN {
        return trimmed.to_string();
    }
    let mut end = MAX_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &trimmed[..end])
}
