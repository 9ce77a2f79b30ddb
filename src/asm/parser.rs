// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Line parser for HD6303 assembly.
//!
//! Turns one lexed line into an optional label plus an optional body
//! (instruction or directive), with operands parsed into expression
//! trees. Addressing-mode intent is recorded here; the final direct vs
//! extended decision belongs to the two-pass engine.

use crate::asm::lexer::{Token, TokKind};
use crate::asm::opcodes;
use crate::core::diag::{DiagKind, Diagnostic, SourcePos};
use crate::core::expr::{BinaryOp, Expr, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Force {
    None,
    /// `<` prefix: use zero-page addressing.
    Direct,
    /// `>` prefix: use the full 16-bit form.
    Extended,
}

/// Operand as written, before mode resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Inherent,
    Immediate(Expr),
    /// `expr,X`
    Indexed(Expr),
    /// Bare address expression: direct, extended or branch target.
    Addr { expr: Expr, force: Force },
    /// `#mask,addr` (AIM/OIM/EIM/TIM direct form).
    BitOpDirect { mask: Expr, addr: Expr },
    /// `#mask,offset,X` (AIM/OIM/EIM/TIM indexed form).
    BitOpIndexed { mask: Expr, offset: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelDef {
    pub name: String,
    pub is_local: bool,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirArg {
    Expr(Expr),
    Str(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineBody {
    Instr {
        mnemonic: String,
        operand: Operand,
        pos: SourcePos,
    },
    Directive {
        name: String,
        args: Vec<DirArg>,
        pos: SourcePos,
    },
    /// A name that is neither mnemonic nor directive: macro invocation.
    MacroCall {
        name: String,
        args: Vec<String>,
        pos: SourcePos,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedLine {
    pub label: Option<LabelDef>,
    pub body: Option<LineBody>,
}

const DIRECTIVES: &[&str] = &[
    "ORG", "EQU", "SET", "FCB", "DB", "FCC", "FDB", "DW", "RMB", "DS", "FILL", "ALIGN", "INCLUDE",
    "INCBIN", "END", "MACRO", "ENDM", "MODEL",
];

pub fn is_directive(name: &str) -> bool {
    DIRECTIVES.iter().any(|d| d.eq_ignore_ascii_case(name))
}

/// Canonical directive spelling (DB -> FCB, DW -> FDB, DS -> RMB).
pub fn canonical_directive(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "DB" => "FCB".to_string(),
        "DW" => "FDB".to_string(),
        "DS" => "RMB".to_string(),
        _ => upper,
    }
}

pub struct Cursor<'a> {
    tokens: &'a [Token],
    index: usize,
    line_pos: SourcePos,
}

impl<'a> Cursor<'a> {
    pub fn new(tokens: &'a [Token], line_pos: SourcePos) -> Self {
        Self {
            tokens,
            index: 0,
            line_pos,
        }
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.index)
    }

    fn peek_kind(&self) -> Option<&'a TokKind> {
        self.peek().map(|t| &t.kind)
    }

    pub fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.index);
        if tok.is_some() {
            self.index += 1;
        }
        tok
    }

    pub fn at_end(&self) -> bool {
        self.index >= self.tokens.len()
    }

    pub fn pos(&self) -> SourcePos {
        self.peek()
            .map(|t| t.pos.clone())
            .unwrap_or_else(|| self.line_pos.clone())
    }

    fn eat(&mut self, kind: &TokKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn err(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::error(DiagKind::Parse, self.pos(), message)
    }
}

/// Parse a whole line of tokens. An identifier whose token starts in
/// column 1 is a label definition; everything else is body.
pub fn parse_line(tokens: &[Token], line_pos: SourcePos) -> Result<ParsedLine, Diagnostic> {
    let mut parsed = ParsedLine::default();
    if tokens.is_empty() {
        return Ok(parsed);
    }

    let mut cursor = Cursor::new(tokens, line_pos);

    // Label: identifier in column 1, optionally followed by ':'.
    if let Some(tok) = cursor.peek() {
        if let TokKind::Ident(name) = &tok.kind {
            if tok.pos.column == 1 {
                let name = name.clone();
                let pos = tok.pos.clone();
                cursor.next();
                cursor.eat(&TokKind::Colon);

                // `LABEL = expr` is an equate.
                if cursor.eat(&TokKind::Equals) {
                    let expr = parse_expr(&mut cursor)?;
                    expect_line_end(&cursor)?;
                    parsed.body = Some(LineBody::Directive {
                        name: "EQU".to_string(),
                        args: vec![DirArg::Expr(expr)],
                        pos: pos.clone(),
                    });
                    parsed.label = Some(LabelDef {
                        is_local: name.starts_with('.'),
                        name,
                        pos,
                    });
                    return Ok(parsed);
                }

                parsed.label = Some(LabelDef {
                    is_local: name.starts_with('.'),
                    name,
                    pos,
                });
            }
        }
    }

    if cursor.at_end() {
        return Ok(parsed);
    }

    let (name, pos) = match cursor.next() {
        Some(Token {
            kind: TokKind::Ident(name),
            pos,
        }) => (name.clone(), pos.clone()),
        Some(tok) => {
            return Err(Diagnostic::error(
                DiagKind::Parse,
                tok.pos.clone(),
                "expected mnemonic or directive",
            ));
        }
        None => return Ok(parsed),
    };

    if is_directive(&name) {
        let canonical = canonical_directive(&name);
        let args = parse_directive_args(&mut cursor, &canonical)?;
        expect_line_end(&cursor)?;
        parsed.body = Some(LineBody::Directive {
            name: canonical,
            args,
            pos,
        });
        return Ok(parsed);
    }

    if opcodes::is_mnemonic(&name) {
        let operand = parse_operand(&mut cursor, &name)?;
        expect_line_end(&cursor)?;
        parsed.body = Some(LineBody::Instr {
            mnemonic: name.to_ascii_uppercase(),
            operand,
            pos,
        });
        return Ok(parsed);
    }

    // Unknown name in the body position: macro invocation; arguments are
    // comma-separated raw token spellings, substituted textually.
    let args = parse_macro_args(&mut cursor);
    parsed.body = Some(LineBody::MacroCall { name, args, pos });
    Ok(parsed)
}

fn expect_line_end(cursor: &Cursor<'_>) -> Result<(), Diagnostic> {
    if cursor.at_end() {
        Ok(())
    } else {
        Err(cursor.err("trailing tokens after operand"))
    }
}

fn parse_directive_args(cursor: &mut Cursor<'_>, name: &str) -> Result<Vec<DirArg>, Diagnostic> {
    let mut args = Vec::new();
    if cursor.at_end() {
        return Ok(args);
    }
    loop {
        match cursor.peek_kind() {
            Some(TokKind::Str(bytes)) => {
                args.push(DirArg::Str(bytes.clone()));
                cursor.next();
            }
            Some(TokKind::Ident(sym))
                if matches!(name, "INCLUDE" | "INCBIN" | "MODEL" | "END" | "MACRO")
                    && !sym.eq_ignore_ascii_case("HIGH")
                    && !sym.eq_ignore_ascii_case("LOW") =>
            {
                // Bare-word argument forms (file names, model codes,
                // entry symbols): keep the spelling, not a symbol ref.
                args.push(DirArg::Str(sym.clone().into_bytes()));
                cursor.next();
            }
            _ => {
                let expr = parse_expr(cursor)?;
                args.push(DirArg::Expr(expr));
            }
        }
        if !cursor.eat(&TokKind::Comma) {
            break;
        }
    }
    Ok(args)
}

fn parse_macro_args(cursor: &mut Cursor<'_>) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    while let Some(tok) = cursor.next() {
        if tok.kind == TokKind::Comma {
            args.push(current.trim().to_string());
            current = String::new();
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&spell_token(&tok.kind));
    }
    if !current.is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn spell_token(kind: &TokKind) -> String {
    match kind {
        TokKind::Ident(name) => name.clone(),
        TokKind::Number(value) => value.to_string(),
        TokKind::Str(bytes) => format!("\"{}\"", String::from_utf8_lossy(bytes)),
        TokKind::MacroParam(n) => format!("\\{n}"),
        TokKind::Hash => "#".into(),
        TokKind::Comma => ",".into(),
        TokKind::Colon => ":".into(),
        TokKind::LParen => "(".into(),
        TokKind::RParen => ")".into(),
        TokKind::Plus => "+".into(),
        TokKind::Minus => "-".into(),
        TokKind::Star => "*".into(),
        TokKind::Slash => "/".into(),
        TokKind::Percent => "%".into(),
        TokKind::Amp => "&".into(),
        TokKind::Pipe => "|".into(),
        TokKind::Caret => "^".into(),
        TokKind::Tilde => "~".into(),
        TokKind::Bang => "!".into(),
        TokKind::Shl => "<<".into(),
        TokKind::Shr => ">>".into(),
        TokKind::Lt => "<".into(),
        TokKind::Le => "<=".into(),
        TokKind::Gt => ">".into(),
        TokKind::Ge => ">=".into(),
        TokKind::EqEq => "==".into(),
        TokKind::Ne => "!=".into(),
        TokKind::Equals => "=".into(),
        TokKind::Dollar => "$".into(),
    }
}

fn parse_operand(cursor: &mut Cursor<'_>, mnemonic: &str) -> Result<Operand, Diagnostic> {
    if cursor.at_end() {
        return Ok(Operand::Inherent);
    }

    // #mask,addr / #mask,offset,X for the memory-immediate bit ops,
    // plain immediate for everything else.
    if cursor.eat(&TokKind::Hash) {
        let first = parse_expr(cursor)?;
        if opcodes::is_bit_manip(mnemonic) {
            if !cursor.eat(&TokKind::Comma) {
                return Err(cursor.err(format!("{mnemonic} needs `#mask,addr` or `#mask,off,X`")));
            }
            let second = parse_expr(cursor)?;
            if cursor.eat(&TokKind::Comma) {
                expect_index_register(cursor)?;
                return Ok(Operand::BitOpIndexed {
                    mask: first,
                    offset: second,
                });
            }
            return Ok(Operand::BitOpDirect {
                mask: first,
                addr: second,
            });
        }
        return Ok(Operand::Immediate(first));
    }

    // Leading < and > force direct/extended addressing.
    let force = if cursor.eat(&TokKind::Lt) {
        Force::Direct
    } else if cursor.eat(&TokKind::Gt) {
        Force::Extended
    } else {
        Force::None
    };

    let expr = parse_expr(cursor)?;

    if cursor.eat(&TokKind::Comma) {
        expect_index_register(cursor)?;
        if force != Force::None {
            return Err(cursor.err("mode prefix is meaningless for indexed operands"));
        }
        return Ok(Operand::Indexed(expr));
    }

    Ok(Operand::Addr { expr, force })
}

fn expect_index_register(cursor: &mut Cursor<'_>) -> Result<(), Diagnostic> {
    match cursor.next() {
        Some(Token {
            kind: TokKind::Ident(name),
            ..
        }) if name.eq_ignore_ascii_case("X") => Ok(()),
        _ => Err(cursor.err("expected X after comma")),
    }
}

// ============================================================================
// Expressions: precedence climbing, comparisons lowest.
// ============================================================================

pub fn parse_expr(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    parse_comparison(cursor)
}

fn parse_comparison(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_bitor(cursor)?;
    loop {
        let op = match cursor.peek_kind() {
            Some(TokKind::EqEq) => BinaryOp::Eq,
            Some(TokKind::Ne) => BinaryOp::Ne,
            Some(TokKind::Lt) => BinaryOp::Lt,
            Some(TokKind::Le) => BinaryOp::Le,
            Some(TokKind::Gt) => BinaryOp::Gt,
            Some(TokKind::Ge) => BinaryOp::Ge,
            _ => break,
        };
        cursor.next();
        let rhs = parse_bitor(cursor)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_bitor(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_bitxor(cursor)?;
    while cursor.eat(&TokKind::Pipe) {
        let rhs = parse_bitxor(cursor)?;
        lhs = Expr::Binary(BinaryOp::BitOr, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_bitxor(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_bitand(cursor)?;
    while cursor.eat(&TokKind::Caret) {
        let rhs = parse_bitand(cursor)?;
        lhs = Expr::Binary(BinaryOp::BitXor, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_bitand(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_shift(cursor)?;
    while cursor.eat(&TokKind::Amp) {
        let rhs = parse_shift(cursor)?;
        lhs = Expr::Binary(BinaryOp::BitAnd, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_shift(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_additive(cursor)?;
    loop {
        let op = match cursor.peek_kind() {
            Some(TokKind::Shl) => BinaryOp::Shl,
            Some(TokKind::Shr) => BinaryOp::Shr,
            _ => break,
        };
        cursor.next();
        let rhs = parse_additive(cursor)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_additive(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_multiplicative(cursor)?;
    loop {
        let op = match cursor.peek_kind() {
            Some(TokKind::Plus) => BinaryOp::Add,
            Some(TokKind::Minus) => BinaryOp::Sub,
            _ => break,
        };
        cursor.next();
        let rhs = parse_multiplicative(cursor)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_multiplicative(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_unary(cursor)?;
    loop {
        let op = match cursor.peek_kind() {
            Some(TokKind::Star) => BinaryOp::Mul,
            Some(TokKind::Slash) => BinaryOp::Div,
            Some(TokKind::Percent) => BinaryOp::Mod,
            _ => break,
        };
        cursor.next();
        let rhs = parse_unary(cursor)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_unary(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let op = match cursor.peek_kind() {
        Some(TokKind::Plus) => Some(UnaryOp::Plus),
        Some(TokKind::Minus) => Some(UnaryOp::Minus),
        Some(TokKind::Tilde) => Some(UnaryOp::BitNot),
        Some(TokKind::Bang) => Some(UnaryOp::LogicNot),
        // Unary < and > extract the low and high byte.
        Some(TokKind::Lt) => Some(UnaryOp::Low),
        Some(TokKind::Gt) => Some(UnaryOp::High),
        _ => None,
    };
    if let Some(op) = op {
        cursor.next();
        let inner = parse_unary(cursor)?;
        return Ok(Expr::Unary(op, Box::new(inner)));
    }
    parse_primary(cursor)
}

fn parse_primary(cursor: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    match cursor.peek() {
        Some(Token {
            kind: TokKind::Number(value),
            ..
        }) => {
            let value = *value;
            cursor.next();
            Ok(Expr::Number(value))
        }
        Some(Token {
            kind: TokKind::Ident(name),
            ..
        }) => {
            let name = name.clone();
            cursor.next();
            if name.eq_ignore_ascii_case("HIGH") && cursor.eat(&TokKind::LParen) {
                let inner = parse_expr(cursor)?;
                if !cursor.eat(&TokKind::RParen) {
                    return Err(cursor.err("expected ) after HIGH("));
                }
                return Ok(Expr::Unary(UnaryOp::High, Box::new(inner)));
            }
            if name.eq_ignore_ascii_case("LOW") && cursor.eat(&TokKind::LParen) {
                let inner = parse_expr(cursor)?;
                if !cursor.eat(&TokKind::RParen) {
                    return Err(cursor.err("expected ) after LOW("));
                }
                return Ok(Expr::Unary(UnaryOp::Low, Box::new(inner)));
            }
            Ok(Expr::Symbol(name))
        }
        Some(Token {
            kind: TokKind::Dollar | TokKind::Star,
            ..
        }) => {
            cursor.next();
            Ok(Expr::Here)
        }
        Some(Token {
            kind: TokKind::LParen,
            ..
        }) => {
            cursor.next();
            let inner = parse_expr(cursor)?;
            if !cursor.eat(&TokKind::RParen) {
                return Err(cursor.err("expected )"));
            }
            Ok(inner)
        }
        Some(Token {
            kind: TokKind::MacroParam(n),
            pos,
        }) => Err(Diagnostic::error(
            DiagKind::Macro,
            pos.clone(),
            format!("macro parameter \\{n} outside a macro body"),
        )),
        Some(tok) => Err(Diagnostic::error(
            DiagKind::Parse,
            tok.pos.clone(),
            "expected expression",
        )),
        None => Err(cursor.err("expected expression")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::lexer::lex_line;

    fn parse(line: &str) -> ParsedLine {
        let toks = lex_line(line, "t.asm", 1).unwrap();
        parse_line(&toks, SourcePos::new("t.asm", 1, 1)).unwrap()
    }

    #[test]
    fn label_and_instruction() {
        let parsed = parse("start: LDAA #$41");
        let label = parsed.label.unwrap();
        assert_eq!(label.name, "start");
        assert!(!label.is_local);
        match parsed.body.unwrap() {
            LineBody::Instr { mnemonic, operand, .. } => {
                assert_eq!(mnemonic, "LDAA");
                assert_eq!(operand, Operand::Immediate(Expr::Number(0x41)));
            }
            other => panic!("expected instruction, got {other:?}"),
        }
    }

    #[test]
    fn local_label_scoping_flag() {
        let parsed = parse(".loop BRA .loop");
        assert!(parsed.label.unwrap().is_local);
    }

    #[test]
    fn indexed_operand() {
        let parsed = parse(" LDAA 5,X");
        match parsed.body.unwrap() {
            LineBody::Instr { operand, .. } => {
                assert_eq!(operand, Operand::Indexed(Expr::Number(5)));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn force_prefixes() {
        let parsed = parse(" LDAA <$40");
        match parsed.body.unwrap() {
            LineBody::Instr { operand, .. } => match operand {
                Operand::Addr { force, .. } => assert_eq!(force, Force::Direct),
                other => panic!("{other:?}"),
            },
            other => panic!("{other:?}"),
        }
        let parsed = parse(" JMP >$12");
        match parsed.body.unwrap() {
            LineBody::Instr { operand, .. } => match operand {
                Operand::Addr { force, .. } => assert_eq!(force, Force::Extended),
                other => panic!("{other:?}"),
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn bit_manip_operands() {
        let parsed = parse(" AIM #$7F,$20");
        match parsed.body.unwrap() {
            LineBody::Instr { operand, .. } => {
                assert_eq!(
                    operand,
                    Operand::BitOpDirect {
                        mask: Expr::Number(0x7F),
                        addr: Expr::Number(0x20),
                    }
                );
            }
            other => panic!("{other:?}"),
        }
        let parsed = parse(" OIM #1,3,X");
        match parsed.body.unwrap() {
            LineBody::Instr { operand, .. } => {
                assert_eq!(
                    operand,
                    Operand::BitOpIndexed {
                        mask: Expr::Number(1),
                        offset: Expr::Number(3),
                    }
                );
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn equate_shorthand() {
        let parsed = parse("WIDTH = 16");
        assert_eq!(parsed.label.unwrap().name, "WIDTH");
        match parsed.body.unwrap() {
            LineBody::Directive { name, args, .. } => {
                assert_eq!(name, "EQU");
                assert_eq!(args, vec![DirArg::Expr(Expr::Number(16))]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn directive_alias_canonicalization() {
        let parsed = parse(" DB 1,2,3");
        match parsed.body.unwrap() {
            LineBody::Directive { name, args, .. } => {
                assert_eq!(name, "FCB");
                assert_eq!(args.len(), 3);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn expression_precedence() {
        let parsed = parse(" FDB 1+2*3");
        match parsed.body.unwrap() {
            LineBody::Directive { args, .. } => {
                assert_eq!(
                    args[0],
                    DirArg::Expr(Expr::Binary(
                        BinaryOp::Add,
                        Box::new(Expr::Number(1)),
                        Box::new(Expr::Binary(
                            BinaryOp::Mul,
                            Box::new(Expr::Number(2)),
                            Box::new(Expr::Number(3)),
                        )),
                    ))
                );
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn high_low_function_forms() {
        let parsed = parse(" LDAA #HIGH(message)");
        match parsed.body.unwrap() {
            LineBody::Instr { operand, .. } => {
                assert_eq!(
                    operand,
                    Operand::Immediate(Expr::Unary(
                        UnaryOp::High,
                        Box::new(Expr::symbol("message"))
                    ))
                );
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn unknown_name_is_macro_call() {
        let parsed = parse(" BLINK 3, $40");
        match parsed.body.unwrap() {
            LineBody::MacroCall { name, args, .. } => {
                assert_eq!(name, "BLINK");
                assert_eq!(args, vec!["3".to_string(), "64".to_string()]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn trailing_junk_is_an_error() {
        let toks = lex_line(" NOP NOP", "t.asm", 1).unwrap();
        assert!(parse_line(&toks, SourcePos::new("t.asm", 1, 1)).is_err());
    }
}
