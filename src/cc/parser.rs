// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Recursive-descent parser for the restricted C dialect.
//!
//! Operator precedence follows C. Typedef names are tracked in the
//! parser so typedef'd struct types parse without the `struct` prefix.
//! On a statement-level error the parser skips to the next semicolon and
//! keeps going, so one compile surfaces as many issues as it safely can.

use std::collections::HashMap;

use crate::cc::ast::*;
use crate::cc::lexer::{is_keyword, CTok, CToken};
use crate::cc::preprocessor::PreLine;
use crate::cc::types::{BaseType, CType, StructTable};
use crate::core::diag::{DiagKind, Diagnostic, DiagnosticBundle, SourcePos};

#[derive(Debug)]
pub struct ParseOutput {
    pub program: Program,
    pub structs: StructTable,
}

pub fn parse(lines: &[PreLine]) -> Result<ParseOutput, DiagnosticBundle> {
    let mut tokens = Vec::new();
    let mut diags = DiagnosticBundle::new();
    for line in lines {
        match crate::cc::lexer::lex_line(&line.text, &line.pos) {
            Ok(mut line_tokens) => tokens.append(&mut line_tokens),
            Err(diag) => diags.push(diag),
        }
    }
    if diags.has_errors() {
        return Err(diags.sorted());
    }

    let mut parser = Parser {
        tokens,
        index: 0,
        typedefs: HashMap::new(),
        structs: StructTable::default(),
        diags,
    };
    let program = parser.parse_program();
    if parser.diags.has_errors() {
        return Err(parser.diags.sorted());
    }
    Ok(ParseOutput {
        program,
        structs: parser.structs,
    })
}

struct Parser {
    tokens: Vec<CToken>,
    index: usize,
    typedefs: HashMap<String, CType>,
    structs: StructTable,
    diags: DiagnosticBundle,
}

impl Parser {
    // ========================================================================
    // Token plumbing
    // ========================================================================

    fn peek(&self) -> Option<&CTok> {
        self.tokens.get(self.index).map(|t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> Option<&CTok> {
        self.tokens.get(self.index + offset).map(|t| &t.kind)
    }

    fn pos(&self) -> SourcePos {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|t| t.pos.clone())
            .unwrap_or_else(|| SourcePos::new("<input>", 0, 0))
    }

    fn advance(&mut self) -> Option<CToken> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn eat(&mut self, kind: &CTok) -> bool {
        if self.peek() == Some(kind) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if let Some(CTok::Ident(name)) = self.peek() {
            if name == word {
                self.index += 1;
                return true;
            }
        }
        false
    }

    fn expect(&mut self, kind: &CTok, what: &str) -> Result<(), Diagnostic> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(Diagnostic::error(
                DiagKind::Parse,
                self.pos(),
                format!("expected {what}"),
            ))
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<(String, SourcePos), Diagnostic> {
        match self.advance() {
            Some(CToken {
                kind: CTok::Ident(name),
                pos,
            }) if !is_keyword(&name) => Ok((name, pos)),
            Some(token) => Err(Diagnostic::error(
                DiagKind::Parse,
                token.pos,
                format!("expected {what}"),
            )),
            None => Err(Diagnostic::error(
                DiagKind::Parse,
                self.pos(),
                format!("expected {what}"),
            )),
        }
    }

    /// Skip to just past the next semicolon (or a closing brace) so the
    /// parser can resume at the next declaration.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        while let Some(kind) = self.peek() {
            match kind {
                CTok::Semi if depth == 0 => {
                    self.index += 1;
                    return;
                }
                CTok::LBrace => {
                    depth += 1;
                    self.index += 1;
                }
                CTok::RBrace => {
                    if depth <= 1 {
                        self.index += 1;
                        return;
                    }
                    depth -= 1;
                    self.index += 1;
                }
                _ => {
                    self.index += 1;
                }
            }
        }
    }

    // ========================================================================
    // Types
    // ========================================================================

    fn is_type_start(&self) -> bool {
        match self.peek() {
            Some(CTok::Ident(name)) => {
                matches!(name.as_str(), "char" | "int" | "unsigned" | "void" | "struct")
                    || self.typedefs.contains_key(name)
            }
            _ => false,
        }
    }

    /// Base type specifier, without pointer or array parts.
    fn parse_type_spec(&mut self) -> Result<CType, Diagnostic> {
        let pos = self.pos();
        if self.eat_ident("unsigned") {
            if self.eat_ident("char") {
                return Ok(CType::scalar(BaseType::UChar));
            }
            self.eat_ident("int");
            return Ok(CType::uint_());
        }
        if self.eat_ident("char") {
            return Ok(CType::char_());
        }
        if self.eat_ident("int") {
            return Ok(CType::int_());
        }
        if self.eat_ident("void") {
            return Ok(CType::void_());
        }
        if self.eat_ident("struct") {
            let (tag, _) = self.expect_name("struct tag")?;
            return Ok(CType::scalar(BaseType::Struct(tag)));
        }
        if let Some(CTok::Ident(name)) = self.peek() {
            if let Some(alias) = self.typedefs.get(name).cloned() {
                self.index += 1;
                return Ok(alias);
            }
        }
        Err(Diagnostic::error(DiagKind::Parse, pos, "expected a type"))
    }

    /// Full declarator after the base: pointers, name, array suffix.
    fn parse_declarator(&mut self, base: CType) -> Result<(String, CType, SourcePos), Diagnostic> {
        let mut ty = base;
        while self.eat(&CTok::Star) {
            ty = ty.pointer_to();
        }
        let (name, pos) = self.expect_name("a name")?;
        if self.eat(&CTok::LBracket) {
            if self.eat(&CTok::RBracket) {
                // Unsized array declares a pointer (decay at the seam).
                ty = ty.pointer_to();
            } else {
                let len_expr = self.parse_expr()?;
                let len = const_value(&len_expr).ok_or_else(|| {
                    Diagnostic::error(
                        DiagKind::Parse,
                        pos.clone(),
                        "array size must be a constant expression",
                    )
                })?;
                if len <= 0 || len > 0xFFFF {
                    return Err(Diagnostic::error(
                        DiagKind::Parse,
                        pos.clone(),
                        format!("array size out of range: {len}"),
                    ));
                }
                self.expect(&CTok::RBracket, "]")?;
                ty = ty.array_of(len as u16);
            }
        }
        Ok((name, ty, pos))
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    fn parse_program(&mut self) -> Program {
        let mut declarations = Vec::new();
        while self.peek().is_some() {
            let before = self.index;
            match self.parse_top_level(&mut declarations) {
                Ok(()) => {}
                Err(diag) => {
                    self.diags.push(diag);
                    if self.index == before {
                        self.synchronize();
                    }
                }
            }
        }
        Program { declarations }
    }

    fn parse_top_level(&mut self, out: &mut Vec<Declaration>) -> Result<(), Diagnostic> {
        if self.eat_ident("typedef") {
            return self.parse_typedef();
        }

        // A struct definition at top level: struct TAG { ... };
        if matches!(self.peek(), Some(CTok::Ident(name)) if name == "struct") {
            if let (Some(CTok::Ident(_)), Some(CTok::LBrace)) = (self.peek_at(1), self.peek_at(2)) {
                self.index += 1; // struct
                let (tag, pos) = self.expect_name("struct tag")?;
                let fields = self.parse_struct_body(&tag)?;
                self.expect(&CTok::Semi, "; after struct definition")?;
                out.push(Declaration::Struct(StructDecl { tag, fields, pos }));
                return Ok(());
            }
        }

        if self.eat_ident("external") {
            return self.parse_external(out);
        }

        let is_extern = self.eat_ident("extern");
        let base = self.parse_type_spec()?;
        let (name, ty, pos) = self.parse_declarator(base.clone())?;

        // Function prototype or definition.
        if self.peek() == Some(&CTok::LParen) {
            self.index += 1;
            let params = self.parse_params()?;
            self.expect(&CTok::RParen, ") after parameters")?;
            if self.eat(&CTok::Semi) {
                out.push(Declaration::Function(FunctionDecl {
                    name,
                    return_type: ty,
                    params,
                    body: None,
                    pos,
                }));
                return Ok(());
            }
            let body = self.parse_block()?;
            out.push(Declaration::Function(FunctionDecl {
                name,
                return_type: ty,
                params,
                body: Some(body),
                pos,
            }));
            return Ok(());
        }

        // Variable declaration, possibly a comma list.
        let mut current = (name, ty, pos);
        loop {
            let initializer = if self.eat(&CTok::Assign) {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            let (name, ty, pos) = current.clone();
            out.push(Declaration::Variable(VarDecl {
                name,
                var_type: ty,
                initializer,
                is_extern,
                pos,
            }));
            if self.eat(&CTok::Comma) {
                let (next_name, next_ty, next_pos) = self.parse_declarator(base.clone())?;
                current = (next_name, next_ty, next_pos);
                continue;
            }
            break;
        }
        self.expect(&CTok::Semi, "; after declaration")?;
        Ok(())
    }

    fn parse_typedef(&mut self) -> Result<(), Diagnostic> {
        // typedef struct [TAG] { ... } NAME; or typedef TYPE NAME;
        if self.eat_ident("struct") {
            let tag = if let Some(CTok::Ident(name)) = self.peek() {
                if !is_keyword(name) && self.peek_at(1) == Some(&CTok::LBrace) {
                    let (tag, _) = self.expect_name("struct tag")?;
                    Some(tag)
                } else if self.peek_at(0) != Some(&CTok::LBrace) {
                    let (tag, _) = self.expect_name("struct tag")?;
                    Some(tag)
                } else {
                    None
                }
            } else {
                None
            };
            if self.peek() == Some(&CTok::LBrace) {
                let tag = tag.unwrap_or_else(|| format!("__anon{}", self.index));
                let _fields = self.parse_struct_body(&tag)?;
                let (alias, _) = self.expect_name("typedef name")?;
                self.expect(&CTok::Semi, "; after typedef")?;
                self.typedefs
                    .insert(alias, CType::scalar(BaseType::Struct(tag)));
                return Ok(());
            }
            let tag = tag.expect("tag parsed above");
            let mut ty = CType::scalar(BaseType::Struct(tag));
            while self.eat(&CTok::Star) {
                ty = ty.pointer_to();
            }
            let (alias, _) = self.expect_name("typedef name")?;
            self.expect(&CTok::Semi, "; after typedef")?;
            self.typedefs.insert(alias, ty);
            return Ok(());
        }

        let base = self.parse_type_spec()?;
        let mut ty = base;
        while self.eat(&CTok::Star) {
            ty = ty.pointer_to();
        }
        let (alias, _) = self.expect_name("typedef name")?;
        self.expect(&CTok::Semi, "; after typedef")?;
        self.typedefs.insert(alias, ty);
        Ok(())
    }

    fn parse_struct_body(&mut self, tag: &str) -> Result<Vec<StructField>, Diagnostic> {
        let pos = self.pos();
        self.expect(&CTok::LBrace, "{ to open struct")?;
        let mut fields = Vec::new();
        while self.peek() != Some(&CTok::RBrace) {
            let base = self.parse_type_spec()?;
            loop {
                let (name, ty, field_pos) = self.parse_declarator(base.clone())?;
                fields.push(StructField {
                    name,
                    field_type: ty,
                    pos: field_pos,
                });
                if !self.eat(&CTok::Comma) {
                    break;
                }
            }
            self.expect(&CTok::Semi, "; after field")?;
        }
        self.expect(&CTok::RBrace, "} to close struct")?;

        let layout_fields: Vec<(String, CType)> = fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.clone()))
            .collect();
        self.structs.define(tag, &layout_fields, &pos)?;
        Ok(fields)
    }

    fn parse_external(&mut self, out: &mut Vec<Declaration>) -> Result<(), Diagnostic> {
        let ret = self.parse_type_spec()?;
        let (name, pos) = self.expect_name("external procedure name")?;
        if name.len() > 8 {
            return Err(Diagnostic::error(
                DiagKind::Parse,
                pos,
                format!("external name {name} exceeds 8 characters"),
            ));
        }
        self.expect(&CTok::LParen, "( after external name")?;
        let params = self.parse_params()?;
        self.expect(&CTok::RParen, ") after parameters")?;
        self.expect(&CTok::Semi, "; after external declaration")?;
        if params.len() > 4 {
            return Err(Diagnostic::error(
                DiagKind::Parse,
                self.pos(),
                format!("external {name} takes at most 4 arguments"),
            ));
        }
        out.push(Declaration::External(ExternalDecl {
            name,
            return_type: ret,
            params,
            pos,
        }));
        Ok(())
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, Diagnostic> {
        let mut params = Vec::new();
        if self.peek() == Some(&CTok::RParen) {
            return Ok(params);
        }
        if matches!(self.peek(), Some(CTok::Ident(name)) if name == "void")
            && self.peek_at(1) == Some(&CTok::RParen)
        {
            self.index += 1;
            return Ok(params);
        }
        loop {
            let base = self.parse_type_spec()?;
            let (name, ty, pos) = self.parse_declarator(base)?;
            params.push(Param {
                name,
                // Parameters are 16-bit cells: arrays decay here.
                param_type: ty.decayed(),
                pos,
            });
            if !self.eat(&CTok::Comma) {
                break;
            }
        }
        Ok(params)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_block(&mut self) -> Result<Block, Diagnostic> {
        let pos = self.pos();
        self.expect(&CTok::LBrace, "{")?;
        let mut declarations = Vec::new();
        let mut statements = Vec::new();

        // Declarations come first, C89 style.
        while self.is_type_start() {
            let base = self.parse_type_spec()?;
            loop {
                let (name, ty, decl_pos) = self.parse_declarator(base.clone())?;
                let initializer = if self.eat(&CTok::Assign) {
                    Some(self.parse_assignment()?)
                } else {
                    None
                };
                declarations.push(VarDecl {
                    name,
                    var_type: ty,
                    initializer,
                    is_extern: false,
                    pos: decl_pos,
                });
                if !self.eat(&CTok::Comma) {
                    break;
                }
            }
            self.expect(&CTok::Semi, "; after declaration")?;
        }

        while self.peek() != Some(&CTok::RBrace) {
            if self.peek().is_none() {
                return Err(Diagnostic::error(
                    DiagKind::Parse,
                    self.pos(),
                    "unexpected end of file inside a block",
                ));
            }
            let stmt = self.parse_statement()?;
            statements.push(stmt);
        }
        self.expect(&CTok::RBrace, "}")?;
        Ok(Block {
            declarations,
            statements,
            pos,
        })
    }

    fn parse_statement(&mut self) -> Result<Stmt, Diagnostic> {
        let pos = self.pos();

        if self.eat(&CTok::Semi) {
            return Ok(Stmt::Empty);
        }
        if self.peek() == Some(&CTok::LBrace) {
            return Ok(Stmt::Block(self.parse_block()?));
        }

        if self.eat_ident("if") {
            self.expect(&CTok::LParen, "( after if")?;
            let cond = self.parse_expr()?;
            self.expect(&CTok::RParen, ") after condition")?;
            let then_branch = Box::new(self.parse_statement()?);
            let else_branch = if self.eat_ident("else") {
                Some(Box::new(self.parse_statement()?))
            } else {
                None
            };
            return Ok(Stmt::If {
                cond,
                then_branch,
                else_branch,
                pos,
            });
        }

        if self.eat_ident("while") {
            self.expect(&CTok::LParen, "( after while")?;
            let cond = self.parse_expr()?;
            self.expect(&CTok::RParen, ") after condition")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::While { cond, body, pos });
        }

        if self.eat_ident("do") {
            let body = Box::new(self.parse_statement()?);
            if !self.eat_ident("while") {
                return Err(Diagnostic::error(
                    DiagKind::Parse,
                    self.pos(),
                    "expected while after do body",
                ));
            }
            self.expect(&CTok::LParen, "( after while")?;
            let cond = self.parse_expr()?;
            self.expect(&CTok::RParen, ")")?;
            self.expect(&CTok::Semi, "; after do-while")?;
            return Ok(Stmt::DoWhile { body, cond, pos });
        }

        if self.eat_ident("for") {
            self.expect(&CTok::LParen, "( after for")?;
            let init = if self.peek() == Some(&CTok::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&CTok::Semi, "; after for initializer")?;
            let cond = if self.peek() == Some(&CTok::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&CTok::Semi, "; after for condition")?;
            let step = if self.peek() == Some(&CTok::RParen) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&CTok::RParen, ") after for clauses")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::For {
                init,
                cond,
                step,
                body,
                pos,
            });
        }

        if self.eat_ident("switch") {
            return self.parse_switch(pos);
        }

        if self.eat_ident("return") {
            let value = if self.peek() == Some(&CTok::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&CTok::Semi, "; after return")?;
            return Ok(Stmt::Return { value, pos });
        }

        if self.eat_ident("break") {
            self.expect(&CTok::Semi, "; after break")?;
            return Ok(Stmt::Break(pos));
        }
        if self.eat_ident("continue") {
            self.expect(&CTok::Semi, "; after continue")?;
            return Ok(Stmt::Continue(pos));
        }

        if self.eat_ident("goto") {
            let (label, _) = self.expect_name("label")?;
            self.expect(&CTok::Semi, "; after goto")?;
            return Ok(Stmt::Goto { label, pos });
        }

        if self.eat_ident("asm") {
            self.expect(&CTok::LParen, "( after asm")?;
            let text = match self.advance() {
                Some(CToken {
                    kind: CTok::StrLit(bytes),
                    ..
                }) => String::from_utf8_lossy(&bytes).to_string(),
                _ => {
                    return Err(Diagnostic::error(
                        DiagKind::Parse,
                        self.pos(),
                        "asm() takes a string literal",
                    ));
                }
            };
            self.expect(&CTok::RParen, ") after asm text")?;
            self.expect(&CTok::Semi, "; after asm statement")?;
            return Ok(Stmt::Asm { text, pos });
        }

        // Label: IDENT ':' not followed by anything that makes it an
        // expression.
        if let (Some(CTok::Ident(name)), Some(CTok::Colon)) = (self.peek(), self.peek_at(1)) {
            if !is_keyword(name) {
                let name = name.clone();
                self.index += 2;
                return Ok(Stmt::Label { name, pos });
            }
        }

        let expr = self.parse_expr()?;
        self.expect(&CTok::Semi, "; after expression")?;
        Ok(Stmt::Expr(expr))
    }

    fn parse_switch(&mut self, pos: SourcePos) -> Result<Stmt, Diagnostic> {
        self.expect(&CTok::LParen, "( after switch")?;
        let value = self.parse_expr()?;
        self.expect(&CTok::RParen, ") after switch value")?;
        self.expect(&CTok::LBrace, "{ to open switch")?;

        let mut cases: Vec<SwitchCase> = Vec::new();
        while self.peek() != Some(&CTok::RBrace) {
            let case_pos = self.pos();
            let case_value = if self.eat_ident("case") {
                let value = self.parse_expr()?;
                self.expect(&CTok::Colon, ": after case value")?;
                Some(value)
            } else if self.eat_ident("default") {
                self.expect(&CTok::Colon, ": after default")?;
                None
            } else {
                return Err(Diagnostic::error(
                    DiagKind::Parse,
                    case_pos,
                    "expected case or default inside switch",
                ));
            };

            let mut body = Vec::new();
            loop {
                match self.peek() {
                    Some(CTok::RBrace) => break,
                    Some(CTok::Ident(name)) if name == "case" || name == "default" => break,
                    Some(_) => body.push(self.parse_statement()?),
                    None => {
                        return Err(Diagnostic::error(
                            DiagKind::Parse,
                            self.pos(),
                            "unterminated switch",
                        ));
                    }
                }
            }
            cases.push(SwitchCase {
                value: case_value,
                body,
                pos: case_pos,
            });
        }
        self.expect(&CTok::RBrace, "} to close switch")?;
        Ok(Stmt::Switch { value, cases, pos })
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn parse_expr(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, Diagnostic> {
        let lhs = self.parse_logic_or()?;
        let op = match self.peek() {
            Some(CTok::Assign) => Some(None),
            Some(CTok::PlusAssign) => Some(Some(BinOp::Add)),
            Some(CTok::MinusAssign) => Some(Some(BinOp::Sub)),
            Some(CTok::StarAssign) => Some(Some(BinOp::Mul)),
            Some(CTok::SlashAssign) => Some(Some(BinOp::Div)),
            Some(CTok::PercentAssign) => Some(Some(BinOp::Mod)),
            Some(CTok::AmpAssign) => Some(Some(BinOp::BitAnd)),
            Some(CTok::PipeAssign) => Some(Some(BinOp::BitOr)),
            Some(CTok::CaretAssign) => Some(Some(BinOp::BitXor)),
            Some(CTok::ShlAssign) => Some(Some(BinOp::Shl)),
            Some(CTok::ShrAssign) => Some(Some(BinOp::Shr)),
            _ => None,
        };
        if let Some(op) = op {
            let pos = self.pos();
            self.index += 1;
            let value = self.parse_assignment()?;
            return Ok(Expr::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
                pos,
            });
        }
        Ok(lhs)
    }

    fn parse_logic_or(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_logic_and()?;
        while self.peek() == Some(&CTok::PipePipe) {
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_logic_and()?;
            lhs = Expr::Binary {
                op: BinOp::LogicOr,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_logic_and(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_bitor()?;
        while self.peek() == Some(&CTok::AmpAmp) {
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_bitor()?;
            lhs = Expr::Binary {
                op: BinOp::LogicAnd,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_bitxor()?;
        while self.peek() == Some(&CTok::Pipe) {
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_bitxor()?;
            lhs = Expr::Binary {
                op: BinOp::BitOr,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_bitand()?;
        while self.peek() == Some(&CTok::Caret) {
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_bitand()?;
            lhs = Expr::Binary {
                op: BinOp::BitXor,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == Some(&CTok::Amp) {
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary {
                op: BinOp::BitAnd,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(CTok::EqEq) => BinOp::Eq,
                Some(CTok::Ne) => BinOp::Ne,
                _ => break,
            };
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Some(CTok::Lt) => BinOp::Lt,
                Some(CTok::Le) => BinOp::Le,
                Some(CTok::Gt) => BinOp::Gt,
                Some(CTok::Ge) => BinOp::Ge,
                _ => break,
            };
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_shift()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(CTok::Shl) => BinOp::Shl,
                Some(CTok::Shr) => BinOp::Shr,
                _ => break,
            };
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(CTok::Plus) => BinOp::Add,
                Some(CTok::Minus) => BinOp::Sub,
                _ => break,
            };
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(CTok::Star) => BinOp::Mul,
                Some(CTok::Slash) => BinOp::Div,
                Some(CTok::Percent) => BinOp::Mod,
                _ => break,
            };
            let pos = self.pos();
            self.index += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, Diagnostic> {
        let pos = self.pos();

        // Cast: '(' type ')' unary
        if self.peek() == Some(&CTok::LParen) && self.type_follows(1) {
            self.index += 1;
            let base = self.parse_type_spec()?;
            let mut ty = base;
            while self.eat(&CTok::Star) {
                ty = ty.pointer_to();
            }
            self.expect(&CTok::RParen, ") after cast type")?;
            let value = self.parse_unary()?;
            return Ok(Expr::Cast {
                target: ty,
                value: Box::new(value),
                pos,
            });
        }

        if self.eat_ident("sizeof") {
            if self.peek() == Some(&CTok::LParen) && self.type_follows(1) {
                self.index += 1;
                let base = self.parse_type_spec()?;
                let mut ty = base;
                while self.eat(&CTok::Star) {
                    ty = ty.pointer_to();
                }
                self.expect(&CTok::RParen, ") after sizeof type")?;
                return Ok(Expr::SizeofType { target: ty, pos });
            }
            let value = self.parse_unary()?;
            return Ok(Expr::SizeofExpr {
                value: Box::new(value),
                pos,
            });
        }

        let op = match self.peek() {
            Some(CTok::Plus) => Some(UnOp::Plus),
            Some(CTok::Minus) => Some(UnOp::Minus),
            Some(CTok::Bang) => Some(UnOp::LogicNot),
            Some(CTok::Tilde) => Some(UnOp::BitNot),
            Some(CTok::Amp) => Some(UnOp::AddrOf),
            Some(CTok::Star) => Some(UnOp::Deref),
            Some(CTok::PlusPlus) => Some(UnOp::PreInc),
            Some(CTok::MinusMinus) => Some(UnOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.index += 1;
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                pos,
            });
        }

        self.parse_postfix()
    }

    fn type_follows(&self, offset: usize) -> bool {
        match self.peek_at(offset) {
            Some(CTok::Ident(name)) => {
                matches!(name.as_str(), "char" | "int" | "unsigned" | "void" | "struct")
                    || self.typedefs.contains_key(name)
            }
            _ => false,
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, Diagnostic> {
        let mut expr = self.parse_primary()?;
        loop {
            let pos = self.pos();
            if self.eat(&CTok::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&CTok::RBracket, "] after index")?;
                expr = Expr::Index {
                    array: Box::new(expr),
                    index: Box::new(index),
                    pos,
                };
                continue;
            }
            if self.eat(&CTok::Dot) {
                let (field, _) = self.expect_name("field name")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    field,
                    arrow: false,
                    pos,
                };
                continue;
            }
            if self.eat(&CTok::Arrow) {
                let (field, _) = self.expect_name("field name")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    field,
                    arrow: true,
                    pos,
                };
                continue;
            }
            if self.eat(&CTok::PlusPlus) {
                expr = Expr::Unary {
                    op: UnOp::PostInc,
                    operand: Box::new(expr),
                    pos,
                };
                continue;
            }
            if self.eat(&CTok::MinusMinus) {
                expr = Expr::Unary {
                    op: UnOp::PostDec,
                    operand: Box::new(expr),
                    pos,
                };
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.advance().ok_or_else(|| {
            Diagnostic::error(DiagKind::Parse, self.pos(), "expected an expression")
        })?;
        match token.kind {
            CTok::IntLit(value) => Ok(Expr::Number {
                value,
                pos: token.pos,
            }),
            CTok::CharLit(value) => Ok(Expr::Char {
                value,
                pos: token.pos,
            }),
            CTok::StrLit(bytes) => Ok(Expr::Str {
                bytes,
                pos: token.pos,
            }),
            CTok::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&CTok::RParen, ")")?;
                Ok(inner)
            }
            CTok::Ident(name) if !is_keyword(&name) => {
                if self.eat(&CTok::LParen) {
                    let mut args = Vec::new();
                    if self.peek() != Some(&CTok::RParen) {
                        loop {
                            args.push(self.parse_assignment()?);
                            if !self.eat(&CTok::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&CTok::RParen, ") after arguments")?;
                    return Ok(Expr::Call {
                        name,
                        args,
                        pos: token.pos,
                    });
                }
                Ok(Expr::Ident {
                    name,
                    pos: token.pos,
                })
            }
            other => Err(Diagnostic::error(
                DiagKind::Parse,
                token.pos,
                format!("unexpected token in expression: {other:?}"),
            )),
        }
    }
}

/// Fold an expression that must be a compile-time constant.
pub fn const_value(expr: &Expr) -> Option<i32> {
    match expr {
        Expr::Number { value, .. } => Some(*value),
        Expr::Char { value, .. } => Some(*value as i32),
        Expr::Unary {
            op: UnOp::Minus,
            operand,
            ..
        } => const_value(operand).map(|v| -v),
        Expr::Unary {
            op: UnOp::BitNot,
            operand,
            ..
        } => const_value(operand).map(|v| !v),
        Expr::Binary { op, lhs, rhs, .. } => {
            let l = const_value(lhs)?;
            let r = const_value(rhs)?;
            let core_op = match op {
                BinOp::Add => crate::core::expr::BinaryOp::Add,
                BinOp::Sub => crate::core::expr::BinaryOp::Sub,
                BinOp::Mul => crate::core::expr::BinaryOp::Mul,
                BinOp::Div => crate::core::expr::BinaryOp::Div,
                BinOp::Mod => crate::core::expr::BinaryOp::Mod,
                BinOp::BitAnd => crate::core::expr::BinaryOp::BitAnd,
                BinOp::BitOr => crate::core::expr::BinaryOp::BitOr,
                BinOp::BitXor => crate::core::expr::BinaryOp::BitXor,
                BinOp::Shl => crate::core::expr::BinaryOp::Shl,
                BinOp::Shr => crate::core::expr::BinaryOp::Shr,
                BinOp::Eq => crate::core::expr::BinaryOp::Eq,
                BinOp::Ne => crate::core::expr::BinaryOp::Ne,
                BinOp::Lt => crate::core::expr::BinaryOp::Lt,
                BinOp::Le => crate::core::expr::BinaryOp::Le,
                BinOp::Gt => crate::core::expr::BinaryOp::Gt,
                BinOp::Ge => crate::core::expr::BinaryOp::Ge,
                BinOp::LogicAnd => crate::core::expr::BinaryOp::LogicAnd,
                BinOp::LogicOr => crate::core::expr::BinaryOp::LogicOr,
            };
            crate::core::expr::apply_binary(core_op, l, r, expr.pos()).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::preprocessor::preprocess;
    use crate::models::MODEL_XP;

    fn parse_source(source: &str) -> ParseOutput {
        let (lines, _) = preprocess(source, "t.c", MODEL_XP, &[], &[]).unwrap();
        parse(&lines).unwrap()
    }

    fn parse_err(source: &str) -> DiagnosticBundle {
        let (lines, _) = preprocess(source, "t.c", MODEL_XP, &[], &[]).unwrap();
        parse(&lines).unwrap_err()
    }

    #[test]
    fn parses_function_with_locals() {
        let out = parse_source("void main() { int x; x = 42; }");
        assert_eq!(out.program.declarations.len(), 1);
        match &out.program.declarations[0] {
            Declaration::Function(f) => {
                assert_eq!(f.name, "main");
                let body = f.body.as_ref().unwrap();
                assert_eq!(body.declarations.len(), 1);
                assert_eq!(body.statements.len(), 1);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let out = parse_source("int x = 1 + 2 * 3;");
        match &out.program.declarations[0] {
            Declaration::Variable(v) => {
                assert_eq!(const_value(v.initializer.as_ref().unwrap()), Some(7));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn struct_definition_and_layout() {
        let out = parse_source("struct P { int x; int y; };");
        let layout = out.structs.get("P").unwrap();
        assert_eq!(layout.size, 4);
    }

    #[test]
    fn typedef_struct_without_prefix() {
        let out = parse_source("typedef struct Pt { int x; } Point;\nPoint origin;");
        match &out.program.declarations[0] {
            Declaration::Variable(v) => {
                assert!(v.var_type.is_struct_value());
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn external_declaration_limits() {
        let out = parse_source("external int ADDNUM(int a, int b);");
        match &out.program.declarations[0] {
            Declaration::External(e) => {
                assert_eq!(e.name, "ADDNUM");
                assert_eq!(e.params.len(), 2);
            }
            other => panic!("{other:?}"),
        }
        let err = parse_err("external int MANY(int a, int b, int c, int d, int e);");
        assert!(err.to_string().contains("at most 4"));
    }

    #[test]
    fn switch_cases_and_default() {
        let out = parse_source(
            "void f(int k) { switch (k) { case 1: break; case 2: break; default: break; } }",
        );
        match &out.program.declarations[0] {
            Declaration::Function(f) => {
                let body = f.body.as_ref().unwrap();
                match &body.statements[0] {
                    Stmt::Switch { cases, .. } => {
                        assert_eq!(cases.len(), 3);
                        assert!(cases[2].value.is_none());
                    }
                    other => panic!("{other:?}"),
                }
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn array_parameter_decays() {
        let out = parse_source("int sum(char buf[], int n) { return n; }");
        match &out.program.declarations[0] {
            Declaration::Function(f) => {
                assert!(f.params[0].param_type.is_pointer());
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn cast_and_sizeof() {
        parse_source("void f() { int x; char c; x = sizeof(int); c = (char) x; }");
        parse_source("struct P { int x; int y; };\nint s = sizeof(struct P);");
    }

    #[test]
    fn member_access_forms() {
        parse_source(
            "struct P { int x; };\nvoid f(struct P *p) { int a; a = p->x; }",
        );
    }

    #[test]
    fn error_recovery_reports_multiple() {
        let err = parse_err("int a = ;\nint b = 1;\nint c = * ;\n");
        assert!(err.error_count() >= 2);
    }

    #[test]
    fn oversized_struct_rejected_at_parse() {
        let err = parse_err("struct BIG { char blob[300]; };");
        assert!(err.to_string().contains("255"));
    }
}
