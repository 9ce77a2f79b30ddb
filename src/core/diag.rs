// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Diagnostics shared by every toolchain phase.
//!
//! A phase returns `Result<T, DiagnosticBundle>`: diagnostics accumulate
//! while the phase runs and the bundle is returned whole on failure, so
//! callers surface every issue from a phase rather than the first one.

use std::fmt;

use serde::Serialize;

/// Where a token, statement or emitted byte came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcePos {
    pub file: String,
    pub line: u32,
    pub column: usize,
    /// Byte span within the line, when known.
    pub span: Option<(usize, usize)>,
}

impl SourcePos {
    pub fn new(file: impl Into<String>, line: u32, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
            span: None,
        }
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some((start, end));
        self
    }

    pub fn builtin() -> Self {
        Self::new("<builtin>", 0, 0)
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

/// Categories of toolchain errors, one per phase that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagKind {
    Lex,
    Preprocess,
    Parse,
    Type,
    Link,
    Expression,
    Symbol,
    Directive,
    Instruction,
    Range,
    Macro,
    Conditional,
    Pack,
    Io,
    Emulator,
    Usage,
}

impl DiagKind {
    fn code(self) -> &'static str {
        match self {
            DiagKind::Lex => "ps001",
            DiagKind::Preprocess => "ps002",
            DiagKind::Parse => "ps003",
            DiagKind::Type => "ps004",
            DiagKind::Link => "ps005",
            DiagKind::Expression => "ps101",
            DiagKind::Symbol => "ps102",
            DiagKind::Directive => "ps103",
            DiagKind::Instruction => "ps104",
            DiagKind::Range => "ps105",
            DiagKind::Macro => "ps106",
            DiagKind::Conditional => "ps107",
            DiagKind::Pack => "ps201",
            DiagKind::Io => "ps301",
            DiagKind::Emulator => "ps401",
            DiagKind::Usage => "ps501",
        }
    }
}

/// A single reported issue with its source position.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagKind,
    pub pos: SourcePos,
    pub message: String,
    pub notes: Vec<String>,
    /// A second position for cross-file issues (extern vs definition).
    pub related: Option<SourcePos>,
}

impl Diagnostic {
    pub fn error(kind: DiagKind, pos: SourcePos, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            pos,
            message: message.into(),
            notes: Vec::new(),
            related: None,
        }
    }

    pub fn warning(kind: DiagKind, pos: SourcePos, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            pos,
            message: message.into(),
            notes: Vec::new(),
            related: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_related(mut self, pos: SourcePos) -> Self {
        self.related = Some(pos);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// One-line rendering: `path:line:col: severity [code] message`.
    pub fn format(&self) -> String {
        let sev = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        let mut out = format!(
            "{}:{}:{}: {sev} [{}] {}",
            self.pos.file,
            self.pos.line,
            self.pos.column,
            self.code(),
            self.message
        );
        if let Some(related) = &self.related {
            out.push_str(&format!("\n  = note: see also {related}"));
        }
        for note in &self.notes {
            out.push_str(&format!("\n  = note: {note}"));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for Diagnostic {}

/// Accumulated diagnostics for one phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticBundle {
    diags: Vec<Diagnostic>,
}

impl DiagnosticBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.diags.push(diag);
    }

    pub fn error(&mut self, kind: DiagKind, pos: SourcePos, message: impl Into<String>) {
        self.push(Diagnostic::error(kind, pos, message));
    }

    pub fn warning(&mut self, kind: DiagKind, pos: SourcePos, message: impl Into<String>) {
        self.push(Diagnostic::warning(kind, pos, message));
    }

    pub fn extend(&mut self, other: DiagnosticBundle) {
        self.diags.extend(other.diags);
    }

    pub fn has_errors(&self) -> bool {
        self.diags.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diags
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diags.len()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diags
    }

    /// Sorted by source position for user-facing output.
    pub fn sorted(mut self) -> Self {
        self.diags.sort_by(|a, b| {
            (&a.pos.file, a.pos.line, a.pos.column).cmp(&(&b.pos.file, b.pos.line, b.pos.column))
        });
        self
    }

    /// Turn accumulated diagnostics into a phase result.
    pub fn into_result<T>(self, value: T) -> Result<T, DiagnosticBundle> {
        if self.has_errors() {
            Err(self)
        } else {
            Ok(value)
        }
    }
}

impl fmt::Display for DiagnosticBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diag) in self.diags.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diag.format())?;
        }
        Ok(())
    }
}

impl std::error::Error for DiagnosticBundle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_format_includes_position_and_code() {
        let diag = Diagnostic::error(
            DiagKind::Symbol,
            SourcePos::new("loop.asm", 12, 9),
            "undefined symbol: SPINNER",
        );
        assert_eq!(
            diag.format(),
            "loop.asm:12:9: error [ps102] undefined symbol: SPINNER"
        );
    }

    #[test]
    fn bundle_sorts_by_position() {
        let mut bundle = DiagnosticBundle::new();
        bundle.error(DiagKind::Parse, SourcePos::new("b.c", 3, 1), "late");
        bundle.error(DiagKind::Parse, SourcePos::new("a.c", 9, 1), "early file");
        bundle.error(DiagKind::Parse, SourcePos::new("b.c", 1, 4), "early line");
        let sorted = bundle.sorted();
        let lines: Vec<u32> = sorted.diagnostics().iter().map(|d| d.pos.line).collect();
        assert_eq!(lines, vec![9, 1, 3]);
        assert_eq!(sorted.diagnostics()[0].pos.file, "a.c");
    }

    #[test]
    fn into_result_passes_warnings_through() {
        let mut bundle = DiagnosticBundle::new();
        bundle.warning(DiagKind::Range, SourcePos::new("x.asm", 1, 1), "pad");
        assert!(bundle.clone().into_result(42).is_ok());
        bundle.error(DiagKind::Range, SourcePos::new("x.asm", 2, 1), "overflow");
        assert!(bundle.into_result(42).is_err());
    }
}
