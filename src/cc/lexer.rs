// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! C tokenizer.
//!
//! Operates on preprocessed lines so every token still carries the
//! position of the original source it came from. Keywords are plain
//! identifiers here; the parser decides what is reserved.

use crate::core::diag::{DiagKind, Diagnostic, SourcePos};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CTok {
    Ident(String),
    IntLit(i32),
    CharLit(u8),
    StrLit(Vec<u8>),
    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Dot,
    Arrow,
    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AmpAmp,
    PipePipe,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    PlusPlus,
    MinusMinus,
    Colon,
    Question,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CToken {
    pub kind: CTok,
    pub pos: SourcePos,
}

pub const KEYWORDS: &[&str] = &[
    "char", "int", "unsigned", "void", "struct", "typedef", "if", "else", "while", "do", "for",
    "switch", "case", "default", "break", "continue", "return", "goto", "sizeof", "extern",
    "external", "asm",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

fn escape_byte(c: char) -> Option<u8> {
    match c {
        'n' => Some(b'\n'),
        't' => Some(b'\t'),
        'r' => Some(b'\r'),
        '0' => Some(0),
        '\'' => Some(b'\''),
        '"' => Some(b'"'),
        '\\' => Some(b'\\'),
        _ => None,
    }
}

/// Tokenize one preprocessed line. Block comments are stripped by the
/// preprocessor; `//` comments are handled here.
pub fn lex_line(line: &str, pos_of: &SourcePos) -> Result<Vec<CToken>, Diagnostic> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    let pos_at = |col: usize| SourcePos::new(&pos_of.file, pos_of.line, col + 1);

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            break;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i + 1;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            let name: String = chars[i..end].iter().collect();
            i = end;
            tokens.push(CToken {
                kind: CTok::Ident(name),
                pos: pos_at(start),
            });
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = i + 1;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            let text: String = chars[i..end].iter().collect();
            let value = crate::core::expr::parse_number(&text).ok_or_else(|| {
                Diagnostic::error(
                    DiagKind::Lex,
                    pos_at(start),
                    format!("invalid integer literal: {text}"),
                )
            })?;
            i = end;
            tokens.push(CToken {
                kind: CTok::IntLit(value),
                pos: pos_at(start),
            });
            continue;
        }

        if c == '\'' {
            let (value, consumed) = lex_char_lit(&chars[i..], pos_at(start))?;
            i += consumed;
            tokens.push(CToken {
                kind: CTok::CharLit(value),
                pos: pos_at(start),
            });
            continue;
        }

        if c == '"' {
            let (bytes, consumed) = lex_str_lit(&chars[i..], pos_at(start))?;
            i += consumed;
            tokens.push(CToken {
                kind: CTok::StrLit(bytes),
                pos: pos_at(start),
            });
            continue;
        }

        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();
        let (kind, consumed) = match (c, next, next2) {
            ('<', Some('<'), Some('=')) => (CTok::ShlAssign, 3),
            ('>', Some('>'), Some('=')) => (CTok::ShrAssign, 3),
            ('<', Some('<'), _) => (CTok::Shl, 2),
            ('>', Some('>'), _) => (CTok::Shr, 2),
            ('<', Some('='), _) => (CTok::Le, 2),
            ('>', Some('='), _) => (CTok::Ge, 2),
            ('=', Some('='), _) => (CTok::EqEq, 2),
            ('!', Some('='), _) => (CTok::Ne, 2),
            ('&', Some('&'), _) => (CTok::AmpAmp, 2),
            ('|', Some('|'), _) => (CTok::PipePipe, 2),
            ('+', Some('+'), _) => (CTok::PlusPlus, 2),
            ('-', Some('-'), _) => (CTok::MinusMinus, 2),
            ('-', Some('>'), _) => (CTok::Arrow, 2),
            ('+', Some('='), _) => (CTok::PlusAssign, 2),
            ('-', Some('='), _) => (CTok::MinusAssign, 2),
            ('*', Some('='), _) => (CTok::StarAssign, 2),
            ('/', Some('='), _) => (CTok::SlashAssign, 2),
            ('%', Some('='), _) => (CTok::PercentAssign, 2),
            ('&', Some('='), _) => (CTok::AmpAssign, 2),
            ('|', Some('='), _) => (CTok::PipeAssign, 2),
            ('^', Some('='), _) => (CTok::CaretAssign, 2),
            ('(', _, _) => (CTok::LParen, 1),
            (')', _, _) => (CTok::RParen, 1),
            ('{', _, _) => (CTok::LBrace, 1),
            ('}', _, _) => (CTok::RBrace, 1),
            ('[', _, _) => (CTok::LBracket, 1),
            (']', _, _) => (CTok::RBracket, 1),
            (';', _, _) => (CTok::Semi, 1),
            (',', _, _) => (CTok::Comma, 1),
            ('.', _, _) => (CTok::Dot, 1),
            ('+', _, _) => (CTok::Plus, 1),
            ('-', _, _) => (CTok::Minus, 1),
            ('*', _, _) => (CTok::Star, 1),
            ('/', _, _) => (CTok::Slash, 1),
            ('%', _, _) => (CTok::Percent, 1),
            ('&', _, _) => (CTok::Amp, 1),
            ('|', _, _) => (CTok::Pipe, 1),
            ('^', _, _) => (CTok::Caret, 1),
            ('~', _, _) => (CTok::Tilde, 1),
            ('!', _, _) => (CTok::Bang, 1),
            ('<', _, _) => (CTok::Lt, 1),
            ('>', _, _) => (CTok::Gt, 1),
            ('=', _, _) => (CTok::Assign, 1),
            (':', _, _) => (CTok::Colon, 1),
            ('?', _, _) => (CTok::Question, 1),
            (other, _, _) => {
                return Err(Diagnostic::error(
                    DiagKind::Lex,
                    pos_at(start),
                    format!("unexpected character: {other:?}"),
                ));
            }
        };
        i += consumed;
        tokens.push(CToken {
            kind,
            pos: pos_at(start),
        });
    }

    Ok(tokens)
}

fn lex_char_lit(chars: &[char], pos: SourcePos) -> Result<(u8, usize), Diagnostic> {
    match chars.get(1) {
        Some('\\') => {
            let esc = chars.get(2).copied().ok_or_else(|| {
                Diagnostic::error(DiagKind::Lex, pos.clone(), "unterminated character literal")
            })?;
            let value = escape_byte(esc).ok_or_else(|| {
                Diagnostic::error(DiagKind::Lex, pos.clone(), format!("unknown escape: \\{esc}"))
            })?;
            if chars.get(3) != Some(&'\'') {
                return Err(Diagnostic::error(
                    DiagKind::Lex,
                    pos,
                    "unterminated character literal",
                ));
            }
            Ok((value, 4))
        }
        Some(&c) if c != '\'' => {
            if chars.get(2) != Some(&'\'') {
                return Err(Diagnostic::error(
                    DiagKind::Lex,
                    pos,
                    "unterminated character literal",
                ));
            }
            Ok((c as u8, 3))
        }
        _ => Err(Diagnostic::error(
            DiagKind::Lex,
            pos,
            "empty character literal",
        )),
    }
}

fn lex_str_lit(chars: &[char], pos: SourcePos) -> Result<(Vec<u8>, usize), Diagnostic> {
    let mut bytes = Vec::new();
    let mut i = 1usize;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((bytes, i + 1)),
            '\\' => {
                let esc = chars.get(i + 1).copied().ok_or_else(|| {
                    Diagnostic::error(DiagKind::Lex, pos.clone(), "unterminated string literal")
                })?;
                let value = escape_byte(esc).ok_or_else(|| {
                    Diagnostic::error(
                        DiagKind::Lex,
                        pos.clone(),
                        format!("unknown escape: \\{esc}"),
                    )
                })?;
                bytes.push(value);
                i += 2;
            }
            c => {
                bytes.push(c as u8);
                i += 1;
            }
        }
    }
    Err(Diagnostic::error(
        DiagKind::Lex,
        pos,
        "unterminated string literal",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(line: &str) -> Vec<CTok> {
        lex_line(line, &SourcePos::new("t.c", 1, 1))
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn declaration_tokens() {
        assert_eq!(
            kinds("int count = 0;"),
            vec![
                CTok::Ident("int".into()),
                CTok::Ident("count".into()),
                CTok::Assign,
                CTok::IntLit(0),
                CTok::Semi,
            ]
        );
    }

    #[test]
    fn compound_operators_are_single_tokens() {
        assert_eq!(
            kinds("a <<= 1; b >>= 2; c != d && e || f"),
            vec![
                CTok::Ident("a".into()),
                CTok::ShlAssign,
                CTok::IntLit(1),
                CTok::Semi,
                CTok::Ident("b".into()),
                CTok::ShrAssign,
                CTok::IntLit(2),
                CTok::Semi,
                CTok::Ident("c".into()),
                CTok::Ne,
                CTok::Ident("d".into()),
                CTok::AmpAmp,
                CTok::Ident("e".into()),
                CTok::PipePipe,
                CTok::Ident("f".into()),
            ]
        );
    }

    #[test]
    fn arrow_vs_minus() {
        assert_eq!(
            kinds("p->x - 1"),
            vec![
                CTok::Ident("p".into()),
                CTok::Arrow,
                CTok::Ident("x".into()),
                CTok::Minus,
                CTok::IntLit(1),
            ]
        );
    }

    #[test]
    fn char_and_string_literals() {
        assert_eq!(kinds("'A'"), vec![CTok::CharLit(b'A')]);
        assert_eq!(kinds("'\\n'"), vec![CTok::CharLit(b'\n')]);
        assert_eq!(
            kinds(r#""hi\0""#),
            vec![CTok::StrLit(vec![b'h', b'i', 0])]
        );
    }

    #[test]
    fn hex_literals() {
        assert_eq!(kinds("0x1F"), vec![CTok::IntLit(0x1F)]);
    }

    #[test]
    fn line_comment_ends_lexing() {
        assert_eq!(kinds("1 // rest is comment"), vec![CTok::IntLit(1)]);
    }
}
