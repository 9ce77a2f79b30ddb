// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// Terminal rendering helpers shared by the CLI front-ends.

use crate::core::diag::Diagnostic;

/// Highlight the offending column of a source line, optionally in colour.
pub fn highlight_line(line: &str, column: Option<usize>, use_color: bool) -> String {
    match column {
        Some(col) if col > 0 => {
            let idx = col - 1;
            if idx >= line.len() {
                if use_color {
                    return format!("{line}\x1b[31m^\x1b[0m");
                }
                return format!("{line}^");
            }
            let (head, tail) = line.split_at(idx);
            let ch = tail.chars().next().unwrap_or(' ');
            let rest = &tail[ch.len_utf8()..];
            if use_color {
                format!("{head}\x1b[31m{ch}\x1b[0m{rest}")
            } else {
                format!("{head}{ch}{rest}")
            }
        }
        _ => line.to_string(),
    }
}

/// Render a diagnostic with the offending source line underneath, when the
/// caller still has the source text at hand.
pub fn render_with_context(diag: &Diagnostic, lines: Option<&[String]>, use_color: bool) -> String {
    let mut out = diag.format();
    if let Some(lines) = lines {
        let idx = diag.pos.line.saturating_sub(1) as usize;
        if let Some(line) = lines.get(idx) {
            let shown = highlight_line(line, Some(diag.pos.column), use_color);
            out.push_str(&format!("\n{:>5} | {}", diag.pos.line, shown));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diag::{DiagKind, SourcePos};

    #[test]
    fn highlight_keeps_line_without_column() {
        assert_eq!(highlight_line("LDAA #1", None, false), "LDAA #1");
    }

    #[test]
    fn highlight_appends_caret_past_line_end() {
        assert_eq!(highlight_line("NOP", Some(9), false), "NOP^");
    }

    #[test]
    fn render_with_context_shows_source_line() {
        let diag = Diagnostic::error(
            DiagKind::Instruction,
            SourcePos::new("t.asm", 2, 6),
            "bad operand",
        );
        let lines = vec!["NOP".to_string(), " LDAA foo".to_string()];
        let rendered = render_with_context(&diag, Some(&lines), false);
        assert!(rendered.contains("t.asm:2:6"));
        assert!(rendered.contains("    2 |  LDAA foo"));
    }
}
