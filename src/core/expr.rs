// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Shared expression evaluation.
//!
//! One evaluator serves both the assembler (operand and directive
//! expressions) and the C preprocessor (`#if` conditions). Values are
//! 16-bit signed with wrap-around; HIGH/LOW extract bytes; `*` and `$`
//! stand for the current location counter.

use crate::core::diag::{DiagKind, Diagnostic, SourcePos};

/// Operators usable inside expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogicAnd,
    LogicOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    BitNot,
    LogicNot,
    /// High byte of a 16-bit value (`HIGH(x)` or unary `>`).
    High,
    /// Low byte of a 16-bit value (`LOW(x)` or unary `<`).
    Low,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Number(i32),
    Symbol(String),
    /// The current location counter (`*` or `$` in operand position).
    Here,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn number(value: i32) -> Self {
        Expr::Number(value)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Expr::Symbol(name.into())
    }

    /// Symbols referenced anywhere in the tree, in first-seen order.
    pub fn symbols(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Symbol(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Unary(_, inner) => inner.collect_symbols(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_symbols(out);
                rhs.collect_symbols(out);
            }
            Expr::Number(_) | Expr::Here => {}
        }
    }

    /// Sum of the signs in which internal symbols occur, used by the
    /// relocator to decide whether an operand is address-like. A plain
    /// label reference has balance +1, `end-start` has balance 0.
    pub fn relocation_balance(&self, is_internal: &dyn Fn(&str) -> bool) -> i32 {
        self.balance_signed(1, is_internal)
    }

    fn balance_signed(&self, sign: i32, is_internal: &dyn Fn(&str) -> bool) -> i32 {
        match self {
            Expr::Symbol(name) => {
                if is_internal(name) {
                    sign
                } else {
                    0
                }
            }
            Expr::Unary(UnaryOp::Minus, inner) => inner.balance_signed(-sign, is_internal),
            Expr::Unary(_, inner) => inner.balance_signed(sign, is_internal),
            Expr::Binary(BinaryOp::Add, lhs, rhs) => {
                lhs.balance_signed(sign, is_internal) + rhs.balance_signed(sign, is_internal)
            }
            Expr::Binary(BinaryOp::Sub, lhs, rhs) => {
                lhs.balance_signed(sign, is_internal) + rhs.balance_signed(-sign, is_internal)
            }
            Expr::Binary(_, lhs, rhs) => {
                lhs.balance_signed(sign, is_internal) + rhs.balance_signed(sign, is_internal)
            }
            Expr::Number(_) | Expr::Here => 0,
        }
    }
}

/// Context needed to resolve symbols and the location counter.
pub trait EvalContext {
    fn lookup_symbol(&self, name: &str) -> Option<i32>;

    fn here(&self) -> Option<i32>;
}

/// Context over a closure, for callers without a full symbol table.
pub struct FnEvalContext<F>
where
    F: Fn(&str) -> Option<i32>,
{
    lookup: F,
    here: Option<i32>,
}

impl<F> FnEvalContext<F>
where
    F: Fn(&str) -> Option<i32>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup, here: None }
    }

    pub fn with_here(lookup: F, here: i32) -> Self {
        Self {
            lookup,
            here: Some(here),
        }
    }
}

impl<F> EvalContext for FnEvalContext<F>
where
    F: Fn(&str) -> Option<i32>,
{
    fn lookup_symbol(&self, name: &str) -> Option<i32> {
        (self.lookup)(name)
    }

    fn here(&self) -> Option<i32> {
        self.here
    }
}

fn wrap16(value: i64) -> i32 {
    value as i16 as i32
}

/// Evaluate an expression to a 16-bit value.
pub fn eval_expr(expr: &Expr, ctx: &dyn EvalContext, pos: &SourcePos) -> Result<i32, Diagnostic> {
    match expr {
        Expr::Number(value) => Ok(wrap16(*value as i64)),

        Expr::Symbol(name) => ctx
            .lookup_symbol(name)
            .map(|v| wrap16(v as i64))
            .ok_or_else(|| {
                Diagnostic::error(
                    DiagKind::Symbol,
                    pos.clone(),
                    format!("undefined symbol: {name}"),
                )
            }),

        Expr::Here => ctx.here().ok_or_else(|| {
            Diagnostic::error(
                DiagKind::Expression,
                pos.clone(),
                "location counter not available here",
            )
        }),

        Expr::Unary(op, inner) => {
            let value = eval_expr(inner, ctx, pos)?;
            Ok(apply_unary(*op, value))
        }

        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, ctx, pos)?;
            let r = eval_expr(rhs, ctx, pos)?;
            apply_binary(*op, l, r, pos)
        }
    }
}

pub fn apply_unary(op: UnaryOp, value: i32) -> i32 {
    match op {
        UnaryOp::Plus => value,
        UnaryOp::Minus => wrap16(-(value as i64)),
        UnaryOp::BitNot => wrap16(!(value as i64)),
        UnaryOp::LogicNot => {
            if value == 0 {
                1
            } else {
                0
            }
        }
        UnaryOp::Low => value & 0xFF,
        UnaryOp::High => (value >> 8) & 0xFF,
    }
}

pub fn apply_binary(op: BinaryOp, l: i32, r: i32, pos: &SourcePos) -> Result<i32, Diagnostic> {
    let l64 = l as i64;
    let r64 = r as i64;
    Ok(match op {
        BinaryOp::Add => wrap16(l64.wrapping_add(r64)),
        BinaryOp::Sub => wrap16(l64.wrapping_sub(r64)),
        BinaryOp::Mul => wrap16(l64.wrapping_mul(r64)),
        BinaryOp::Div => {
            if r == 0 {
                return Err(Diagnostic::error(
                    DiagKind::Expression,
                    pos.clone(),
                    "division by zero",
                ));
            }
            wrap16(l64 / r64)
        }
        BinaryOp::Mod => {
            if r == 0 {
                return Err(Diagnostic::error(
                    DiagKind::Expression,
                    pos.clone(),
                    "modulo by zero",
                ));
            }
            wrap16(l64 % r64)
        }
        BinaryOp::BitAnd => wrap16(l64 & r64),
        BinaryOp::BitOr => wrap16(l64 | r64),
        BinaryOp::BitXor => wrap16(l64 ^ r64),
        // Shift counts are masked to 0-15; the value domain is 16 bits.
        BinaryOp::Shl => wrap16(((l as u16 as i64) << (r64 & 0x0F)) as i64),
        BinaryOp::Shr => ((l as u16) >> (r64 & 0x0F)) as i32,
        BinaryOp::Eq => (l == r) as i32,
        BinaryOp::Ne => (l != r) as i32,
        BinaryOp::Lt => (l < r) as i32,
        BinaryOp::Le => (l <= r) as i32,
        BinaryOp::Gt => (l > r) as i32,
        BinaryOp::Ge => (l >= r) as i32,
        BinaryOp::LogicAnd => ((l != 0) && (r != 0)) as i32,
        BinaryOp::LogicOr => ((l != 0) || (r != 0)) as i32,
    })
}

/// Returns true if the value fits a signed or unsigned byte (-128..=255).
pub fn value_fits_byte(value: i32) -> bool {
    (-128..=0xFF).contains(&value)
}

/// Returns true if the value fits a signed or unsigned word (-32768..=65535).
pub fn value_fits_word(value: i32) -> bool {
    (-32768..=0xFFFF).contains(&value)
}

/// Parse a numeric literal in any of the accepted radix notations.
///
/// - Decimal: `42`
/// - Hex: `$2A`, `0x2A`
/// - Binary: `%101010`, `0b101010`
/// - Octal: `@52`, `0o52`
pub fn parse_number(text: &str) -> Option<i32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (is_neg, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    // Underscores are visual separators.
    let cleaned: String = text.chars().filter(|&c| c != '_').collect();
    let text = cleaned.as_str();

    // Prefix notations first so `$BB` never hits a suffix heuristic.
    let value = if let Some(hex) = text.strip_prefix('$') {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = text.strip_prefix('%') {
        i64::from_str_radix(bin, 2).ok()?
    } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else if let Some(oct) = text.strip_prefix('@') {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(oct) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()?
    } else {
        text.parse::<i64>().ok()?
    };

    let value = if is_neg { -value } else { value };
    if !(-32768..=0xFFFF).contains(&value) {
        return None;
    }
    Some(value as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pos() -> SourcePos {
        SourcePos::new("<test>", 1, 1)
    }

    #[test]
    fn parse_number_radixes() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("$2A"), Some(42));
        assert_eq!(parse_number("0x2a"), Some(42));
        assert_eq!(parse_number("%101010"), Some(42));
        assert_eq!(parse_number("0b101010"), Some(42));
        assert_eq!(parse_number("@52"), Some(42));
        assert_eq!(parse_number("0o52"), Some(42));
        assert_eq!(parse_number("-10"), Some(-10));
        assert_eq!(parse_number("1_000"), Some(1000));
    }

    #[test]
    fn parse_number_dollar_hex_with_trailing_b() {
        // $BB must be hex 0xBB, never a binary-suffix reading.
        assert_eq!(parse_number("$BB"), Some(0xBB));
        assert_eq!(parse_number("$0B"), Some(0x0B));
    }

    #[test]
    fn parse_number_rejects_out_of_range() {
        assert_eq!(parse_number("65535"), Some(65535));
        assert_eq!(parse_number("65536"), None);
        assert_eq!(parse_number("-32769"), None);
    }

    #[test]
    fn high_low_extract_bytes() {
        assert_eq!(apply_unary(UnaryOp::High, 0x1234), 0x12);
        assert_eq!(apply_unary(UnaryOp::Low, 0x1234), 0x34);
    }

    #[test]
    fn sixteen_bit_wraparound() {
        let p = pos();
        assert_eq!(apply_binary(BinaryOp::Add, 0x7FFF, 1, &p).unwrap(), -0x8000);
        assert_eq!(apply_binary(BinaryOp::Mul, 0x100, 0x100, &p).unwrap(), 0);
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let p = pos();
        assert!(apply_binary(BinaryOp::Div, 1, 0, &p).is_err());
        assert!(apply_binary(BinaryOp::Mod, 1, 0, &p).is_err());
    }

    #[test]
    fn eval_resolves_symbols_and_here() {
        let expr = Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::Symbol("START".into())),
            Box::new(Expr::Here),
        );
        let ctx = FnEvalContext::with_here(
            |name| if name == "START" { Some(0x100) } else { None },
            0x20,
        );
        assert_eq!(eval_expr(&expr, &ctx, &pos()).unwrap(), 0x120);
    }

    #[test]
    fn undefined_symbol_reports_name() {
        let expr = Expr::symbol("NOWHERE");
        let ctx = FnEvalContext::new(|_| None);
        let err = eval_expr(&expr, &ctx, &pos()).unwrap_err();
        assert!(err.message.contains("NOWHERE"));
    }

    #[test]
    fn relocation_balance_cancels_differences() {
        let internal = |name: &str| name.starts_with('_');
        let diff = Expr::Binary(
            BinaryOp::Sub,
            Box::new(Expr::symbol("_end")),
            Box::new(Expr::symbol("_start")),
        );
        assert_eq!(diff.relocation_balance(&internal), 0);
        let offset = Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::symbol("_table")),
            Box::new(Expr::number(5)),
        );
        assert_eq!(offset.relocation_balance(&internal), 1);
        let external = Expr::symbol("ROMCALL");
        assert_eq!(external.relocation_balance(&internal), 0);
    }

    proptest! {
        #[test]
        fn parse_number_decimal_round_trip(value in -32768i32..=65535) {
            prop_assert_eq!(parse_number(&value.to_string()), Some(value));
        }

        #[test]
        fn parse_number_hex_round_trip(value in 0u16..) {
            let text = format!("${:X}", value);
            prop_assert_eq!(parse_number(&text), Some(value as i32));
        }

        #[test]
        fn add_is_commutative_mod_2_16(a in -32768i32..=32767, b in -32768i32..=32767) {
            let p = pos();
            prop_assert_eq!(
                apply_binary(BinaryOp::Add, a, b, &p).unwrap(),
                apply_binary(BinaryOp::Add, b, a, &p).unwrap()
            );
        }
    }
}
