// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! C preprocessor.
//!
//! Line oriented: block comments are stripped, directives interpreted,
//! macros expanded textually with one-pass hygiene (a macro never
//! re-expands inside its own expansion), conditionals evaluated with the
//! shared expression semantics. Output lines keep the position of the
//! source they came from.
//!
//! Predefined macros describe the target: `__PSION__`, `__SMALLC__`,
//! the model symbol (`__PSION_XP__` and friends), `__PSION_2LINE__` or
//! `__PSION_4LINE__`, `DISP_ROWS`, `DISP_COLS`, plus `__LINE__` and
//! `__FILE__`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::cc::lexer::{self, CTok, CToken};
use crate::core::diag::{DiagKind, Diagnostic, DiagnosticBundle, SourcePos};
use crate::core::expr::{apply_binary, BinaryOp};
use crate::models::Model;

/// Headers the dialect ships built in; including them sets feature
/// flags instead of reading a file.
const SYSTEM_HEADERS: &[&str] = &["psion.h", "stdio.h", "ctype.h", "db.h", "float.h"];

#[derive(Debug, Clone)]
struct MacroDef {
    /// None for object-like macros.
    params: Option<Vec<String>>,
    body: String,
}

#[derive(Debug, Clone)]
pub struct PreLine {
    pub pos: SourcePos,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Features {
    pub stdio: bool,
    pub db: bool,
    pub float: bool,
}

pub struct Preprocessor {
    macros: HashMap<String, MacroDef>,
    include_paths: Vec<PathBuf>,
    diags: DiagnosticBundle,
    features: Features,
    includes_active: HashSet<PathBuf>,
    in_block_comment: bool,
}

struct CondFrame {
    taken: bool,
    active: bool,
    in_else: bool,
    pos: SourcePos,
}

pub fn preprocess(
    source: &str,
    file: &str,
    model: Model,
    include_paths: &[PathBuf],
    defines: &[(String, String)],
) -> Result<(Vec<PreLine>, Features), DiagnosticBundle> {
    let mut pp = Preprocessor {
        macros: HashMap::new(),
        include_paths: include_paths.to_vec(),
        diags: DiagnosticBundle::new(),
        features: Features::default(),
        includes_active: HashSet::new(),
        in_block_comment: false,
    };
    pp.define_object("__PSION__", "1");
    pp.define_object("__SMALLC__", "1");
    pp.define_object(model.cpp_symbol(), "1");
    if model.is_four_line() {
        pp.define_object("__PSION_4LINE__", "1");
    } else {
        pp.define_object("__PSION_2LINE__", "1");
    }
    pp.define_object("DISP_ROWS", &model.display_rows.to_string());
    pp.define_object("DISP_COLS", &model.display_cols.to_string());
    for (name, value) in defines {
        pp.define_object(name, value);
    }

    let mut lines = Vec::new();
    pp.process(source, file, &mut lines);
    if pp.diags.has_errors() {
        return Err(std::mem::take(&mut pp.diags).sorted());
    }
    Ok((lines, pp.features))
}

impl Preprocessor {
    fn define_object(&mut self, name: &str, body: &str) {
        self.macros.insert(
            name.to_string(),
            MacroDef {
                params: None,
                body: body.to_string(),
            },
        );
    }

    fn process(&mut self, source: &str, file: &str, out: &mut Vec<PreLine>) {
        let mut conds: Vec<CondFrame> = Vec::new();

        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = idx as u32 + 1;
            let pos = SourcePos::new(file, line_no, 1);
            let line = self.strip_block_comments(raw_line);
            let trimmed = line.trim_start();

            if let Some(rest) = trimmed.strip_prefix('#') {
                self.directive(rest.trim_start(), &pos, &mut conds, out);
                continue;
            }
            if !conds.iter().all(|f| f.active) {
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
            let expanded = self.expand(&line, &pos, &mut HashSet::new());
            out.push(PreLine {
                pos,
                text: expanded,
            });
        }

        for frame in conds {
            self.diags.error(
                DiagKind::Preprocess,
                frame.pos,
                "unterminated conditional block",
            );
        }
    }

    fn strip_block_comments(&mut self, line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        let mut in_string = false;
        while i < chars.len() {
            if self.in_block_comment {
                if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    self.in_block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            if chars[i] == '"' && !in_string {
                in_string = true;
                out.push('"');
                i += 1;
                continue;
            }
            if in_string {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    out.push(chars[i]);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if chars[i] == '"' {
                    in_string = false;
                }
                out.push(chars[i]);
                i += 1;
                continue;
            }
            if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                self.in_block_comment = true;
                out.push(' ');
                i += 2;
                continue;
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    // ========================================================================
    // Directives
    // ========================================================================

    fn directive(
        &mut self,
        rest: &str,
        pos: &SourcePos,
        conds: &mut Vec<CondFrame>,
        out: &mut Vec<PreLine>,
    ) {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let word = parts.next().unwrap_or("");
        let arg = parts.next().unwrap_or("").trim();
        let outer_active = conds.iter().all(|f| f.active);

        match word {
            "ifdef" | "ifndef" => {
                let defined = self.macros.contains_key(arg.trim());
                let cond = if word == "ifdef" { defined } else { !defined };
                conds.push(CondFrame {
                    taken: outer_active && cond,
                    active: outer_active && cond,
                    in_else: false,
                    pos: pos.clone(),
                });
            }
            "if" => {
                let cond = outer_active && self.eval_condition(arg, pos);
                conds.push(CondFrame {
                    taken: cond,
                    active: cond,
                    in_else: false,
                    pos: pos.clone(),
                });
            }
            "elif" => {
                let valid = matches!(conds.last(), Some(f) if !f.in_else);
                if !valid {
                    self.diags
                        .error(DiagKind::Preprocess, pos.clone(), "#elif without #if");
                    return;
                }
                let parent_active = conds[..conds.len() - 1].iter().all(|f| f.active);
                let taken = conds.last().unwrap().taken;
                let cond = !taken && parent_active && self.eval_condition(arg, pos);
                let frame = conds.last_mut().unwrap();
                frame.active = cond;
                if cond {
                    frame.taken = true;
                }
            }
            "else" => {
                let valid = matches!(conds.last(), Some(f) if !f.in_else);
                if !valid {
                    self.diags
                        .error(DiagKind::Preprocess, pos.clone(), "#else without #if");
                    return;
                }
                let parent_active = conds[..conds.len() - 1].iter().all(|f| f.active);
                let frame = conds.last_mut().unwrap();
                frame.in_else = true;
                frame.active = parent_active && !frame.taken;
                frame.taken = true;
            }
            "endif" => {
                if conds.pop().is_none() {
                    self.diags
                        .error(DiagKind::Preprocess, pos.clone(), "#endif without #if");
                }
            }
            _ if !outer_active => {}
            "define" => self.handle_define(arg, pos),
            "undef" => {
                self.macros.remove(arg.trim());
            }
            "include" => self.handle_include(arg, pos, out),
            "error" => {
                self.diags
                    .error(DiagKind::Preprocess, pos.clone(), format!("#error {arg}"));
            }
            "pragma" => {}
            other => {
                self.diags.error(
                    DiagKind::Preprocess,
                    pos.clone(),
                    format!("unknown preprocessor directive: #{other}"),
                );
            }
        }
    }

    fn handle_define(&mut self, arg: &str, pos: &SourcePos) {
        let chars: Vec<char> = arg.chars().collect();
        let mut i = 0;
        while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
            i += 1;
        }
        if i == 0 {
            self.diags
                .error(DiagKind::Preprocess, pos.clone(), "#define needs a name");
            return;
        }
        let name: String = chars[..i].iter().collect();

        // A parenthesis immediately after the name makes it function-like.
        let (params, body_start) = if chars.get(i) == Some(&'(') {
            let mut params = Vec::new();
            let mut j = i + 1;
            let mut current = String::new();
            loop {
                match chars.get(j) {
                    Some(')') => {
                        if !current.trim().is_empty() {
                            params.push(current.trim().to_string());
                        }
                        j += 1;
                        break;
                    }
                    Some(',') => {
                        params.push(current.trim().to_string());
                        current = String::new();
                        j += 1;
                    }
                    Some(&c) => {
                        current.push(c);
                        j += 1;
                    }
                    None => {
                        self.diags.error(
                            DiagKind::Preprocess,
                            pos.clone(),
                            "unterminated macro parameter list",
                        );
                        return;
                    }
                }
            }
            (Some(params), j)
        } else {
            (None, i)
        };

        let body: String = chars[body_start..].iter().collect::<String>().trim().to_string();

        if let Some(existing) = self.macros.get(&name) {
            if existing.body != body {
                self.diags.error(
                    DiagKind::Preprocess,
                    pos.clone(),
                    format!("macro {name} redefined with a different body"),
                );
                return;
            }
        }
        self.macros.insert(name, MacroDef { params, body });
    }

    fn handle_include(&mut self, arg: &str, pos: &SourcePos, out: &mut Vec<PreLine>) {
        let (name, is_system) = if let Some(inner) = arg
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
        {
            (inner.to_string(), true)
        } else if let Some(inner) = arg.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            (inner.to_string(), false)
        } else {
            self.diags.error(
                DiagKind::Preprocess,
                pos.clone(),
                format!("malformed #include: {arg}"),
            );
            return;
        };

        if is_system || SYSTEM_HEADERS.contains(&name.as_str()) {
            match name.as_str() {
                "stdio.h" => self.features.stdio = true,
                "db.h" => self.features.db = true,
                "float.h" => self.features.float = true,
                _ => {}
            }
            if SYSTEM_HEADERS.contains(&name.as_str()) {
                return; // built in, nothing to read
            }
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(parent) = std::path::Path::new(&pos.file).parent() {
            candidates.push(parent.join(&name));
        }
        for base in &self.include_paths {
            candidates.push(base.join(&name));
        }
        candidates.push(PathBuf::from(&name));

        let Some(path) = candidates.into_iter().find(|p| p.exists()) else {
            self.diags.error(
                DiagKind::Preprocess,
                pos.clone(),
                format!("include file not found: {name}"),
            );
            return;
        };

        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !self.includes_active.insert(canonical.clone()) {
            self.diags.error(
                DiagKind::Preprocess,
                pos.clone(),
                format!("circular include: {name}"),
            );
            return;
        }
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                let file = path.display().to_string();
                self.process(&source, &file, out);
            }
            Err(err) => {
                self.diags.error(
                    DiagKind::Preprocess,
                    pos.clone(),
                    format!("cannot read {}: {err}", path.display()),
                );
            }
        }
        self.includes_active.remove(&canonical);
    }

    // ========================================================================
    // Macro expansion
    // ========================================================================

    fn expand(&mut self, line: &str, pos: &SourcePos, active: &mut HashSet<String>) -> String {
        let chars: Vec<char> = line.chars().collect();
        let mut out = String::with_capacity(line.len());
        let mut i = 0;
        let mut in_string = false;

        while i < chars.len() {
            let c = chars[i];
            if c == '"' {
                in_string = !in_string;
                out.push(c);
                i += 1;
                continue;
            }
            if in_string || !(c.is_ascii_alphabetic() || c == '_') {
                out.push(c);
                i += 1;
                continue;
            }

            let mut end = i + 1;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            let name: String = chars[i..end].iter().collect();

            if name == "__LINE__" {
                out.push_str(&pos.line.to_string());
                i = end;
                continue;
            }
            if name == "__FILE__" {
                out.push_str(&format!("\"{}\"", pos.file));
                i = end;
                continue;
            }

            let def = match self.macros.get(&name) {
                Some(def) if !active.contains(&name) => def.clone(),
                _ => {
                    out.push_str(&name);
                    i = end;
                    continue;
                }
            };

            match def.params {
                None => {
                    active.insert(name.clone());
                    let expanded = self.expand(&def.body, pos, active);
                    active.remove(&name);
                    out.push_str(&expanded);
                    i = end;
                }
                Some(ref params) => {
                    // Function-like needs an argument list; a bare use of
                    // the name passes through untouched.
                    let mut j = end;
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    if chars.get(j) != Some(&'(') {
                        out.push_str(&name);
                        i = end;
                        continue;
                    }
                    let (args, after) = match collect_args(&chars, j) {
                        Some(found) => found,
                        None => {
                            self.diags.error(
                                DiagKind::Preprocess,
                                pos.clone(),
                                format!("unterminated arguments for macro {name}"),
                            );
                            out.push_str(&name);
                            i = end;
                            continue;
                        }
                    };
                    if args.len() != params.len() {
                        self.diags.error(
                            DiagKind::Preprocess,
                            pos.clone(),
                            format!(
                                "macro {name} expects {} arguments, got {}",
                                params.len(),
                                args.len()
                            ),
                        );
                        i = after;
                        continue;
                    }
                    let substituted = substitute_params(&def.body, params, &args);
                    active.insert(name.clone());
                    let expanded = self.expand(&substituted, pos, active);
                    active.remove(&name);
                    out.push_str(&expanded);
                    i = after;
                }
            }
        }
        out
    }

    // ========================================================================
    // #if expressions
    // ========================================================================

    fn eval_condition(&mut self, text: &str, pos: &SourcePos) -> bool {
        // Resolve defined(...) before macro expansion.
        let resolved = self.resolve_defined(text);
        let expanded = self.expand(&resolved, pos, &mut HashSet::new());
        let tokens = match lexer::lex_line(&expanded, pos) {
            Ok(tokens) => tokens,
            Err(diag) => {
                self.diags.push(diag);
                return false;
            }
        };
        let mut parser = CondParser {
            tokens: &tokens,
            index: 0,
            pos,
        };
        match parser.parse_or() {
            Ok(value) => value != 0,
            Err(diag) => {
                self.diags.push(diag);
                false
            }
        }
    }

    fn resolve_defined(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars.len() >= i + 7 && chars[i..].starts_with(&['d', 'e', 'f', 'i', 'n', 'e', 'd'])
            {
                let before_ok = i == 0 || !(chars[i - 1].is_ascii_alphanumeric() || chars[i - 1] == '_');
                let mut j = i + 7;
                if before_ok {
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    let parenthesized = chars.get(j) == Some(&'(');
                    if parenthesized {
                        j += 1;
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                    }
                    let start = j;
                    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                        j += 1;
                    }
                    let name: String = chars[start..j].iter().collect();
                    if parenthesized {
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                        if chars.get(j) == Some(&')') {
                            j += 1;
                        }
                    }
                    if !name.is_empty() {
                        out.push_str(if self.macros.contains_key(&name) { "1" } else { "0" });
                        i = j;
                        continue;
                    }
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }
}

fn collect_args(chars: &[char], open: usize) -> Option<(Vec<String>, usize)> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 1;
    let mut i = open + 1;
    while i < chars.len() {
        match chars[i] {
            '(' => {
                depth += 1;
                current.push('(');
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    if !current.trim().is_empty() || !args.is_empty() {
                        args.push(current.trim().to_string());
                    }
                    return Some((args, i + 1));
                }
                current.push(')');
            }
            ',' if depth == 1 => {
                args.push(current.trim().to_string());
                current = String::new();
            }
            c => current.push(c),
        }
        i += 1;
    }
    None
}

/// Replace parameter names in a macro body at token boundaries.
fn substitute_params(body: &str, params: &[String], args: &[String]) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i + 1;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            let name: String = chars[i..end].iter().collect();
            match params.iter().position(|p| p == &name) {
                Some(idx) => out.push_str(&args[idx]),
                None => out.push_str(&name),
            }
            i = end;
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Minimal C conditional-expression evaluator sharing the arithmetic
/// semantics of the core evaluator.
struct CondParser<'a> {
    tokens: &'a [CToken],
    index: usize,
    pos: &'a SourcePos,
}

impl CondParser<'_> {
    fn err(&self) -> Diagnostic {
        Diagnostic::error(
            DiagKind::Preprocess,
            self.pos.clone(),
            "malformed #if expression",
        )
    }

    fn peek(&self) -> Option<&CTok> {
        self.tokens.get(self.index).map(|t| &t.kind)
    }

    fn eat(&mut self, kind: &CTok) -> bool {
        if self.peek() == Some(kind) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn binary(&mut self, op: BinaryOp, l: i32, r: i32) -> Result<i32, Diagnostic> {
        apply_binary(op, l, r, self.pos)
    }

    fn parse_or(&mut self) -> Result<i32, Diagnostic> {
        let mut lhs = self.parse_and()?;
        while self.eat(&CTok::PipePipe) {
            let rhs = self.parse_and()?;
            lhs = ((lhs != 0) || (rhs != 0)) as i32;
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<i32, Diagnostic> {
        let mut lhs = self.parse_cmp()?;
        while self.eat(&CTok::AmpAmp) {
            let rhs = self.parse_cmp()?;
            lhs = ((lhs != 0) && (rhs != 0)) as i32;
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<i32, Diagnostic> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Some(CTok::EqEq) => BinaryOp::Eq,
                Some(CTok::Ne) => BinaryOp::Ne,
                Some(CTok::Lt) => BinaryOp::Lt,
                Some(CTok::Le) => BinaryOp::Le,
                Some(CTok::Gt) => BinaryOp::Gt,
                Some(CTok::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.index += 1;
            let rhs = self.parse_add()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<i32, Diagnostic> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(CTok::Plus) => BinaryOp::Add,
                Some(CTok::Minus) => BinaryOp::Sub,
                Some(CTok::Pipe) => BinaryOp::BitOr,
                Some(CTok::Caret) => BinaryOp::BitXor,
                Some(CTok::Amp) => BinaryOp::BitAnd,
                Some(CTok::Shl) => BinaryOp::Shl,
                Some(CTok::Shr) => BinaryOp::Shr,
                _ => break,
            };
            self.index += 1;
            let rhs = self.parse_mul()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<i32, Diagnostic> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(CTok::Star) => BinaryOp::Mul,
                Some(CTok::Slash) => BinaryOp::Div,
                Some(CTok::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.index += 1;
            let rhs = self.parse_unary()?;
            lhs = self.binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<i32, Diagnostic> {
        if self.eat(&CTok::Bang) {
            return Ok((self.parse_unary()? == 0) as i32);
        }
        if self.eat(&CTok::Minus) {
            return Ok(-self.parse_unary()?);
        }
        if self.eat(&CTok::Tilde) {
            return Ok(!self.parse_unary()?);
        }
        if self.eat(&CTok::LParen) {
            let inner = self.parse_or()?;
            if !self.eat(&CTok::RParen) {
                return Err(self.err());
            }
            return Ok(inner);
        }
        match self.peek() {
            Some(CTok::IntLit(value)) => {
                let value = *value;
                self.index += 1;
                Ok(value)
            }
            Some(CTok::CharLit(value)) => {
                let value = *value as i32;
                self.index += 1;
                Ok(value)
            }
            // Surviving identifiers are undefined macros: value 0.
            Some(CTok::Ident(_)) => {
                self.index += 1;
                Ok(0)
            }
            _ => Err(self.err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MODEL_LZ, MODEL_XP};

    fn pp(source: &str) -> Vec<String> {
        let (lines, _) = preprocess(source, "t.c", MODEL_XP, &[], &[]).unwrap();
        lines.into_iter().map(|l| l.text.trim().to_string()).collect()
    }

    #[test]
    fn object_macro_expansion() {
        let out = pp("#define WIDTH 16\nint w = WIDTH;\n");
        assert_eq!(out, vec!["int w = 16;"]);
    }

    #[test]
    fn function_macro_expansion() {
        let out = pp("#define MAX(a, b) ((a) > (b) ? (a) : (b))\nint m = MAX(x, 3);\n");
        assert_eq!(out, vec!["int m = ((x) > (3) ? (x) : (3));"]);
    }

    #[test]
    fn self_recursive_macro_expands_once() {
        let out = pp("#define LOOP LOOP + 1\nint x = LOOP;\n");
        assert_eq!(out, vec!["int x = LOOP + 1;"]);
    }

    #[test]
    fn conditional_selects_model_branch() {
        let source = "#ifdef __PSION_4LINE__\nint rows = 4;\n#else\nint rows = 2;\n#endif\n";
        assert_eq!(pp(source), vec!["int rows = 2;"]);
        let (lines, _) = preprocess(source, "t.c", MODEL_LZ, &[], &[]).unwrap();
        assert_eq!(lines[0].text.trim(), "int rows = 4;");
    }

    #[test]
    fn if_with_arithmetic_and_defined() {
        let source = "#if defined(__PSION__) && DISP_COLS > 10\nint ok;\n#endif\n";
        assert_eq!(pp(source), vec!["int ok;"]);
    }

    #[test]
    fn disp_macros_carry_geometry() {
        assert_eq!(pp("int c = DISP_COLS;\n"), vec!["int c = 16;"]);
        let (lines, _) =
            preprocess("int c = DISP_COLS;\n", "t.c", MODEL_LZ, &[], &[]).unwrap();
        assert_eq!(lines[0].text.trim(), "int c = 20;");
    }

    #[test]
    fn block_comments_span_lines() {
        let out = pp("int a; /* comment\nstill comment\n*/ int b;\n");
        assert_eq!(out, vec!["int a;", "int b;"]);
    }

    #[test]
    fn macros_do_not_expand_in_strings() {
        let out = pp("#define X 9\nchar *s = \"X marks\";\n");
        assert_eq!(out, vec!["char *s = \"X marks\";"]);
    }

    #[test]
    fn system_headers_set_feature_flags() {
        let (_, features) =
            preprocess("#include <stdio.h>\n", "t.c", MODEL_XP, &[], &[]).unwrap();
        assert!(features.stdio);
    }

    #[test]
    fn conflicting_redefinition_is_fatal() {
        let err = preprocess("#define N 1\n#define N 2\n", "t.c", MODEL_XP, &[], &[])
            .expect_err("conflicting redefinition");
        assert!(err.to_string().contains("redefined"));
    }

    #[test]
    fn missing_include_is_fatal() {
        let err = preprocess("#include \"nope.h\"\n", "t.c", MODEL_XP, &[], &[])
            .expect_err("missing include");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn unterminated_conditional_is_fatal() {
        let err = preprocess("#ifdef A\nint x;\n", "t.c", MODEL_XP, &[], &[])
            .expect_err("unterminated conditional");
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn line_and_file_specials() {
        let out = pp("int a = __LINE__;\n");
        assert_eq!(out, vec!["int a = 1;"]);
    }
}
