// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Code generation: AST to assembler input text.
//!
//! A stack-machine model: every expression leaves its value in D (A:B),
//! with A cleared for 8-bit results. Binary operators push one operand
//! and combine against `0,X` after TSX. X doubles as the frame pointer;
//! it is refreshed with TSX before every frame-relative access, and all
//! temporary pushes are tracked so frame offsets stay valid mid
//! expression.
//!
//! Frame layout after the prologue (locals allocated with DES, then
//! PSHX/TSX):
//!
//! ```text
//!   0,X  saved X (2)
//!   2,X  locals (local_size bytes)
//!   2+L  return address (2)
//!   4+L  first parameter, 16-bit cells onward
//! ```
//!
//! Arguments are pushed right-to-left and popped by the caller; results
//! return in D. Three optimizations are built in: constant folding,
//! power-of-two multiply/divide strength reduction, and 8-bit operation
//! selection when both operands are char.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::cc::ast::*;
use crate::cc::parser::const_value;
use crate::cc::types::{BaseType, CType, StructTable};
use crate::core::diag::{DiagKind, Diagnostic, DiagnosticBundle, SourcePos};
use crate::models::Model;

/// Builtin functions provided by the emitted runtime library.
/// (name, return type constructor key, parameter count)
const BUILTINS: &[(&str, &str, usize)] = &[
    ("cls", "void", 0),
    ("putchar", "void", 1),
    ("print", "void", 1),
    ("print_int", "void", 1),
    ("print_uint", "void", 1),
    ("print_hex", "void", 1),
    ("at", "void", 2),
    ("getkey", "char", 0),
    ("testkey", "char", 0),
    ("getticks", "uint", 0),
    ("exit", "void", 0),
    ("strlen", "int", 1),
    ("strcpy", "ptr", 2),
    ("strcmp", "int", 2),
    ("memset", "ptr", 3),
    ("memcpy", "ptr", 3),
    ("abs", "int", 1),
    ("min", "int", 2),
    ("max", "int", 2),
    ("rand", "int", 0),
    ("srand", "void", 1),
];

fn builtin_type(key: &str) -> CType {
    match key {
        "void" => CType::void_(),
        "char" => CType::char_(),
        "uint" => CType::uint_(),
        "ptr" => CType::char_().pointer_to(),
        _ => CType::int_(),
    }
}

#[derive(Debug, Clone)]
pub struct CodegenOptions {
    pub model: Model,
    /// False compiles in library mode: no entry point, no runtime, no
    /// global storage emission beyond this unit's own definitions.
    pub emit_runtime: bool,
    /// Distinguishes generated labels across units of one build so the
    /// concatenated assembly never defines a label twice.
    pub unit_tag: String,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            model: crate::models::DEFAULT_MODEL,
            emit_runtime: true,
            unit_tag: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalInfo {
    offset: i32,
    ty: CType,
}

#[derive(Debug, Clone)]
struct GlobalInfo {
    ty: CType,
}

#[derive(Debug, Clone)]
pub struct FnSig {
    pub name: String,
    pub return_type: CType,
    pub params: Vec<CType>,
    pub pos: SourcePos,
    pub defined: bool,
}

#[derive(Debug, Clone)]
struct ExternalInfo {
    return_type: CType,
    param_count: usize,
    /// On-device name with the return-type suffix.
    device_name: String,
}

pub struct Codegen {
    options: CodegenOptions,
    structs: StructTable,
    out: Vec<String>,
    diags: DiagnosticBundle,
    globals: IndexMap<String, GlobalInfo>,
    global_inits: Vec<(String, CType, Option<Expr>)>,
    strings: IndexMap<Vec<u8>, String>,
    functions: HashMap<String, FnSig>,
    externals: IndexMap<String, ExternalInfo>,
    label_counter: u32,
    // Per-function state
    locals: HashMap<String, LocalInfo>,
    current_fn: Option<String>,
    arg_push_depth: i32,
    last_expr_size: u8,
    break_labels: Vec<String>,
    continue_labels: Vec<String>,
}

pub fn generate(
    program: &Program,
    structs: StructTable,
    options: &CodegenOptions,
) -> Result<String, DiagnosticBundle> {
    let mut gen = Codegen {
        options: options.clone(),
        structs,
        out: Vec::new(),
        diags: DiagnosticBundle::new(),
        globals: IndexMap::new(),
        global_inits: Vec::new(),
        strings: IndexMap::new(),
        functions: HashMap::new(),
        externals: IndexMap::new(),
        label_counter: 0,
        locals: HashMap::new(),
        current_fn: None,
        arg_push_depth: 0,
        last_expr_size: 2,
        break_labels: Vec::new(),
        continue_labels: Vec::new(),
    };
    gen.run(program);
    if gen.diags.has_errors() {
        return Err(std::mem::take(&mut gen.diags).sorted());
    }
    Ok(gen.out.join("\n") + "\n")
}

impl Codegen {
    // ========================================================================
    // Emission helpers
    // ========================================================================

    fn emit(&mut self, line: impl Into<String>) {
        self.out.push(line.into());
    }

    fn op(&mut self, mnemonic: &str, operand: &str) {
        if operand.is_empty() {
            self.emit(format!("        {mnemonic}"));
        } else {
            self.emit(format!("        {mnemonic}     {operand}"));
        }
    }

    fn label(&mut self, name: &str) {
        self.emit(format!("{name}:"));
    }

    fn comment(&mut self, text: &str) {
        self.emit(format!("; {text}"));
    }

    fn new_label(&mut self, prefix: &str) -> String {
        self.label_counter += 1;
        format!("_{}{prefix}{}", self.options.unit_tag, self.label_counter)
    }

    fn error(&mut self, pos: &SourcePos, message: impl Into<String>) {
        self.diags
            .push(Diagnostic::error(DiagKind::Type, pos.clone(), message));
    }

    fn string_label(&mut self, bytes: &[u8]) -> String {
        if let Some(label) = self.strings.get(bytes) {
            return label.clone();
        }
        let label = format!("__S{}{}", self.options.unit_tag, self.strings.len());
        self.strings.insert(bytes.to_vec(), label.clone());
        label
    }

    // ========================================================================
    // Top level
    // ========================================================================

    fn run(&mut self, program: &Program) {
        // Collect signatures, externals and globals before generating.
        for decl in &program.declarations {
            match decl {
                Declaration::Function(f) => {
                    let sig = FnSig {
                        name: f.name.clone(),
                        return_type: f.return_type.clone(),
                        params: f.params.iter().map(|p| p.param_type.clone()).collect(),
                        pos: f.pos.clone(),
                        defined: f.body.is_some(),
                    };
                    if let Some(existing) = self.functions.get(&f.name) {
                        let matches = existing.return_type == sig.return_type
                            && existing.params.len() == sig.params.len()
                            && existing
                                .params
                                .iter()
                                .zip(&sig.params)
                                .all(|(a, b)| crate::cc::types::types_match(a, b));
                        if !matches {
                            self.diags.push(
                                Diagnostic::error(
                                    DiagKind::Type,
                                    f.pos.clone(),
                                    format!("{} does not match its earlier declaration", f.name),
                                )
                                .with_related(existing.pos.clone()),
                            );
                        }
                        if existing.defined && sig.defined {
                            self.diags.push(
                                Diagnostic::error(
                                    DiagKind::Type,
                                    f.pos.clone(),
                                    format!("{} is defined twice", f.name),
                                )
                                .with_related(existing.pos.clone()),
                            );
                        }
                        if sig.defined {
                            self.functions.insert(f.name.clone(), sig);
                        }
                    } else {
                        self.functions.insert(f.name.clone(), sig);
                    }
                }
                Declaration::External(e) => {
                    let suffix = if e.return_type.is_char() {
                        "$"
                    } else if e.return_type.is_void() {
                        ""
                    } else {
                        "%"
                    };
                    self.externals.insert(
                        e.name.clone(),
                        ExternalInfo {
                            return_type: e.return_type.clone(),
                            param_count: e.params.len(),
                            device_name: format!("{}{}", e.name.to_ascii_uppercase(), suffix),
                        },
                    );
                }
                Declaration::Variable(v) => {
                    if v.is_extern {
                        self.globals.insert(
                            v.name.clone(),
                            GlobalInfo {
                                ty: v.var_type.clone(),
                            },
                        );
                        continue;
                    }
                    if v.var_type.is_struct_value()
                        && self.structs.get(match &v.var_type.base {
                            BaseType::Struct(tag) => tag,
                            _ => unreachable!(),
                        }).is_none()
                    {
                        self.error(&v.pos, format!("unknown struct type for {}", v.name));
                        continue;
                    }
                    if self.globals.contains_key(&v.name) {
                        self.error(&v.pos, format!("{} is declared twice", v.name));
                        continue;
                    }
                    self.globals.insert(
                        v.name.clone(),
                        GlobalInfo {
                            ty: v.var_type.clone(),
                        },
                    );
                    self.global_inits.push((
                        v.name.clone(),
                        v.var_type.clone(),
                        v.initializer.clone(),
                    ));
                }
                Declaration::Struct(_) => {}
            }
        }

        let mut main_fn = None;
        let mut others = Vec::new();
        for decl in &program.declarations {
            if let Declaration::Function(f) = decl {
                if f.body.is_none() {
                    continue;
                }
                if f.name == "main" {
                    main_fn = Some(f);
                } else {
                    others.push(f);
                }
            }
        }

        self.comment(&format!(
            "generated for model {} ({}x{})",
            self.options.model.short_code(),
            self.options.model.display_rows,
            self.options.model.display_cols
        ));
        self.emit(String::new());

        if self.options.emit_runtime {
            self.comment("entry point, invoked through USR at offset 0");
            self.label("_entry");
            if main_fn.is_none() {
                self.diags.push(Diagnostic::error(
                    DiagKind::Link,
                    SourcePos::new("<unit>", 0, 0),
                    "no main function defined",
                ));
            }
            self.op("BSR", "_main");
            self.op("RTS", "");
            self.emit(String::new());
            if let Some(f) = main_fn {
                self.gen_function(f);
            }
            for f in others {
                self.gen_function(f);
            }
        } else {
            self.comment("library unit: entry point and runtime come from the main unit");
            self.emit(String::new());
            if let Some(f) = main_fn {
                self.error(
                    &f.pos,
                    "library units cannot define main",
                );
            }
            for f in others {
                self.gen_function(f);
            }
        }

        self.gen_external_stubs();
        if self.options.emit_runtime {
            self.gen_runtime();
        }
        self.gen_globals();
        self.gen_strings();
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn gen_function(&mut self, f: &FunctionDecl) {
        let body = f.body.as_ref().expect("definition");

        self.locals.clear();
        self.arg_push_depth = 0;
        self.current_fn = Some(f.name.clone());

        // Lay out locals: siblings reuse the same slots, so the frame is
        // the deepest path through the nested blocks.
        let mut local_size = 0i32;
        self.layout_block_locals(body, 2, &mut local_size);

        for (index, param) in f.params.iter().enumerate() {
            let offset = 4 + local_size + 2 * index as i32;
            self.locals.insert(
                param.name.clone(),
                LocalInfo {
                    offset,
                    ty: param.param_type.clone(),
                },
            );
        }

        self.emit(String::new());
        self.comment(&format!("{} {}()", f.return_type, f.name));
        self.label(&format!("_{}", f.name));

        // One-shot trap setup runs before anything touches the stack.
        if f.name == "main" && !self.externals.is_empty() {
            self.op("JSR", "__ext_init");
        }

        if local_size > 0 {
            for _ in 0..local_size {
                self.op("DES", "");
            }
        }
        self.op("PSHX", "");
        self.op("TSX", "");

        self.gen_local_initializers(body);
        self.gen_block(body);

        self.label(&format!("_{}_exit", f.name));
        self.op("PULX", "");
        if local_size > 0 {
            for _ in 0..local_size {
                self.op("INS", "");
            }
        }
        self.op("RTS", "");

        self.current_fn = None;
    }

    fn layout_block_locals(&mut self, block: &Block, base: i32, max_size: &mut i32) {
        let mut offset = base;
        for decl in &block.declarations {
            let size = decl.var_type.storage_size(&self.structs) as i32;
            let size = if size == 0 { 2 } else { size };
            self.locals.insert(
                decl.name.clone(),
                LocalInfo {
                    offset,
                    ty: decl.var_type.clone(),
                },
            );
            offset += size;
        }
        *max_size = (*max_size).max(offset - 2);
        for stmt in &block.statements {
            self.layout_stmt_locals(stmt, offset, max_size);
        }
    }

    fn layout_stmt_locals(&mut self, stmt: &Stmt, base: i32, max_size: &mut i32) {
        match stmt {
            Stmt::Block(block) => self.layout_block_locals(block, base, max_size),
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.layout_stmt_locals(then_branch, base, max_size);
                if let Some(else_branch) = else_branch {
                    self.layout_stmt_locals(else_branch, base, max_size);
                }
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
                self.layout_stmt_locals(body, base, max_size);
            }
            Stmt::Switch { cases, .. } => {
                for case in cases {
                    for stmt in &case.body {
                        self.layout_stmt_locals(stmt, base, max_size);
                    }
                }
            }
            _ => {}
        }
    }

    fn gen_local_initializers(&mut self, block: &Block) {
        for decl in &block.declarations {
            let Some(init) = &decl.initializer else {
                continue;
            };
            let Some(info) = self.locals.get(&decl.name).cloned() else {
                continue;
            };
            self.gen_expr(init);
            self.op("TSX", "");
            if info.ty.is_char() {
                self.op("STAB", &format!("{},X", info.offset));
            } else {
                self.op("STD", &format!("{},X", info.offset));
            }
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn gen_block(&mut self, block: &Block) {
        for stmt in &block.statements {
            self.gen_stmt(stmt);
        }
    }

    fn gen_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Empty => {}
            Stmt::Expr(expr) => {
                self.gen_expr(expr);
            }
            Stmt::Block(block) => {
                self.gen_local_initializers(block);
                self.gen_block(block);
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let else_label = self.new_label("else");
                let end_label = self.new_label("endif");
                self.gen_expr(cond);
                self.boolean_test();
                self.op("BEQ", &else_label);
                self.gen_stmt(then_branch);
                if else_branch.is_some() {
                    self.op("JMP", &end_label);
                }
                self.label(&else_label);
                if let Some(else_branch) = else_branch {
                    self.gen_stmt(else_branch);
                    self.label(&end_label);
                }
            }
            Stmt::While { cond, body, .. } => {
                let top = self.new_label("while");
                let end = self.new_label("wend");
                self.label(&top);
                self.gen_expr(cond);
                self.boolean_test();
                self.op("BEQ", &end);
                self.break_labels.push(end.clone());
                self.continue_labels.push(top.clone());
                self.gen_stmt(body);
                self.continue_labels.pop();
                self.break_labels.pop();
                self.op("JMP", &top);
                self.label(&end);
            }
            Stmt::DoWhile { body, cond, .. } => {
                let top = self.new_label("do");
                let check = self.new_label("docond");
                let end = self.new_label("doend");
                self.label(&top);
                self.break_labels.push(end.clone());
                self.continue_labels.push(check.clone());
                self.gen_stmt(body);
                self.continue_labels.pop();
                self.break_labels.pop();
                self.label(&check);
                self.gen_expr(cond);
                self.boolean_test();
                self.op("BEQ", &end);
                self.op("JMP", &top);
                self.label(&end);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                let top = self.new_label("for");
                let cont = self.new_label("fstep");
                let end = self.new_label("fend");
                if let Some(init) = init {
                    self.gen_expr(init);
                }
                self.label(&top);
                if let Some(cond) = cond {
                    self.gen_expr(cond);
                    self.boolean_test();
                    self.op("BEQ", &end);
                }
                self.break_labels.push(end.clone());
                self.continue_labels.push(cont.clone());
                self.gen_stmt(body);
                self.continue_labels.pop();
                self.break_labels.pop();
                self.label(&cont);
                if let Some(step) = step {
                    self.gen_expr(step);
                }
                self.op("JMP", &top);
                self.label(&end);
            }
            Stmt::Switch { value, cases, pos } => {
                self.gen_switch(value, cases, pos);
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.gen_expr(value);
                }
                let name = self.current_fn.clone().unwrap_or_default();
                self.op("JMP", &format!("_{name}_exit"));
            }
            Stmt::Break(pos) => match self.break_labels.last().cloned() {
                Some(label) => self.op("JMP", &label),
                None => self.error(pos, "break outside a loop or switch"),
            },
            Stmt::Continue(pos) => match self.continue_labels.last().cloned() {
                Some(label) => self.op("JMP", &label),
                None => self.error(pos, "continue outside a loop"),
            },
            Stmt::Goto { label, .. } => {
                let name = self.current_fn.clone().unwrap_or_default();
                self.op("JMP", &format!("__{name}_{label}"));
            }
            Stmt::Label { name, .. } => {
                let fn_name = self.current_fn.clone().unwrap_or_default();
                self.label(&format!("__{fn_name}_{name}"));
            }
            Stmt::Asm { text, .. } => {
                let substituted = self.substitute_asm_vars(text);
                for line in substituted.lines() {
                    self.emit(format!("        {}", line.trim()));
                }
            }
        }
    }

    /// `$name` inside asm() becomes the frame reference or global label.
    fn substitute_asm_vars(&mut self, text: &str) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '$'
                && i + 1 < chars.len()
                && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_')
            {
                let mut end = i + 1;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[i + 1..end].iter().collect();
                if let Some(info) = self.locals.get(&name) {
                    out.push_str(&format!("{},X", info.offset));
                } else if self.globals.contains_key(&name) {
                    out.push_str(&format!("_{name}"));
                } else {
                    out.push('$');
                    out.push_str(&name);
                }
                i = end;
            } else {
                out.push(chars[i]);
                i += 1;
            }
        }
        out
    }

    fn gen_switch(&mut self, value: &Expr, cases: &[SwitchCase], _pos: &SourcePos) {
        let end = self.new_label("swend");

        self.gen_expr(value);
        self.widen_if_char();
        self.op("PSHB", "");
        self.op("PSHA", "");
        self.arg_push_depth += 2;

        // Dispatch: compare-and-branch per case, dense or sparse alike.
        let mut case_labels = Vec::new();
        let mut default_label = None;
        for case in cases {
            let label = self.new_label("case");
            match &case.value {
                Some(value_expr) => {
                    let Some(case_value) = const_value(value_expr) else {
                        self.error(&case.pos, "case value must be a constant expression");
                        continue;
                    };
                    self.op("TSX", "");
                    self.op("LDD", "0,X");
                    self.op("SUBD", &format!("#{}", case_value as u16));
                    self.op("BEQ", &label);
                }
                None => default_label = Some(label.clone()),
            }
            case_labels.push(label);
        }
        match &default_label {
            Some(label) => self.op("JMP", label),
            None => self.op("JMP", &end),
        }

        self.break_labels.push(end.clone());
        for (case, label) in cases.iter().zip(&case_labels) {
            self.label(label);
            for stmt in &case.body {
                self.gen_stmt(stmt);
            }
            // Fall through to the next case, C semantics.
        }
        self.break_labels.pop();

        self.label(&end);
        self.op("INS", "");
        self.op("INS", "");
        self.arg_push_depth -= 2;
    }

    // ========================================================================
    // Expression types
    // ========================================================================

    fn expr_type(&self, expr: &Expr) -> CType {
        match expr {
            Expr::Number { .. } => CType::int_(),
            Expr::Char { .. } => CType::char_(),
            Expr::Str { .. } => CType::char_().pointer_to(),
            Expr::Ident { name, .. } => {
                if let Some(info) = self.locals.get(name) {
                    return info.ty.clone();
                }
                if let Some(info) = self.globals.get(name) {
                    return info.ty.clone();
                }
                CType::int_()
            }
            Expr::Binary { op, lhs, rhs, .. } => self.binary_result_type(*op, lhs, rhs),
            Expr::Unary { op, operand, .. } => match op {
                UnOp::AddrOf => self.expr_type(operand).pointer_to(),
                UnOp::Deref => self
                    .expr_type(operand)
                    .dereference()
                    .unwrap_or_else(CType::int_),
                UnOp::LogicNot => CType::int_(),
                _ => self.expr_type(operand),
            },
            Expr::Assign { target, .. } => self.expr_type(target),
            Expr::Call { name, .. } => {
                if let Some(sig) = self.functions.get(name) {
                    return sig.return_type.clone();
                }
                if let Some(ext) = self.externals.get(name) {
                    return ext.return_type.clone();
                }
                if let Some((_, key, _)) = BUILTINS.iter().find(|(n, _, _)| *n == name) {
                    return builtin_type(key);
                }
                CType::int_()
            }
            Expr::Index { array, .. } => self
                .expr_type(array)
                .dereference()
                .unwrap_or_else(CType::int_),
            Expr::Member { object, field, .. } => {
                let object_type = self.expr_type(object);
                match &object_type.base {
                    BaseType::Struct(tag) => self
                        .structs
                        .get(tag)
                        .and_then(|s| s.field(field))
                        .map(|f| f.field_type.clone())
                        .unwrap_or_else(CType::int_),
                    _ => CType::int_(),
                }
            }
            Expr::Cast { target, .. } => target.clone(),
            Expr::SizeofType { .. } | Expr::SizeofExpr { .. } => CType::int_(),
        }
    }

    fn binary_result_type(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CType {
        if op.is_comparison() || matches!(op, BinOp::LogicAnd | BinOp::LogicOr) {
            return CType::int_();
        }
        let lt = self.expr_type(lhs);
        let rt = self.expr_type(rhs);

        // Pointer arithmetic keeps the pointer type.
        if (lt.is_pointer() || lt.is_array()) && matches!(op, BinOp::Add | BinOp::Sub) {
            return lt.decayed();
        }
        if (rt.is_pointer() || rt.is_array()) && op == BinOp::Add {
            return rt.decayed();
        }

        let eight_bit_op = matches!(
            op,
            BinOp::Add | BinOp::Sub | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
        );
        if eight_bit_op {
            if lt.is_char() && rt.is_char() {
                return CType::char_();
            }
            // A literal that fits in a byte adapts to the char side.
            if lt.is_char() && byte_literal(rhs) {
                return CType::char_();
            }
            if rt.is_char() && byte_literal(lhs) {
                return CType::char_();
            }
        }
        // Multiplication, division, modulo and shifts widen to 16 bits.
        CType::int_()
    }

    /// The typed-arithmetic rule: an 8-bit operator may not mix char and
    /// int operands unless a cast (or a byte-sized literal) settles it.
    fn check_binary_mix(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, pos: &SourcePos) {
        if op.is_comparison() || matches!(op, BinOp::LogicAnd | BinOp::LogicOr) {
            return;
        }
        let lt = self.expr_type(lhs);
        let rt = self.expr_type(rhs);
        if lt.is_pointer() || lt.is_array() || rt.is_pointer() || rt.is_array() {
            return;
        }
        let eight_bit_op = matches!(
            op,
            BinOp::Add | BinOp::Sub | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
        );
        if eight_bit_op
            && lt.is_char() != rt.is_char()
            && !(lt.is_char() && byte_literal(rhs))
            && !(rt.is_char() && byte_literal(lhs))
        {
            self.error(pos, "mixing char and int operands needs an explicit cast");
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn boolean_test(&mut self) {
        if self.last_expr_size == 1 {
            self.op("TSTB", "");
        } else {
            self.op("SUBD", "#0");
        }
    }

    fn widen_if_char(&mut self) {
        if self.last_expr_size == 1 {
            // 8-bit results already keep A clear.
            self.last_expr_size = 2;
        }
    }

    fn gen_expr(&mut self, expr: &Expr) {
        // Constant folding across arithmetic and bitwise operators.
        if matches!(expr, Expr::Binary { .. } | Expr::Unary { .. }) {
            if let Some(value) = const_value(expr) {
                self.op("LDD", &format!("#{}", value as u16));
                self.last_expr_size = 2;
                return;
            }
        }

        match expr {
            Expr::Number { value, .. } => {
                self.op("LDD", &format!("#{}", *value as u16));
                self.last_expr_size = 2;
            }
            Expr::Char { value, .. } => {
                self.op("LDAB", &format!("#{value}"));
                self.op("CLRA", "");
                self.last_expr_size = 1;
            }
            Expr::Str { bytes, .. } => {
                let label = self.string_label(bytes);
                self.op("LDD", &format!("#{label}"));
                self.last_expr_size = 2;
            }
            Expr::Ident { name, pos } => self.gen_ident(name, pos),
            Expr::Binary { op, lhs, rhs, pos } => self.gen_binary(*op, lhs, rhs, pos),
            Expr::Unary { op, operand, pos } => self.gen_unary(*op, operand, pos),
            Expr::Assign {
                op,
                target,
                value,
                pos,
            } => self.gen_assignment(op, target, value, pos),
            Expr::Call { name, args, pos } => self.gen_call(name, args, pos),
            Expr::Index { array, index, .. } => {
                let element = self.gen_index_address(array, index);
                if element == 1 {
                    self.op("LDAB", "0,X");
                    self.op("CLRA", "");
                    self.last_expr_size = 1;
                } else {
                    self.op("LDD", "0,X");
                    self.last_expr_size = 2;
                }
            }
            Expr::Member {
                object,
                field,
                arrow,
                pos,
            } => self.gen_member(object, field, *arrow, pos, false),
            Expr::Cast { target, value, .. } => {
                self.gen_expr(value);
                if target.is_char() {
                    self.op("CLRA", "");
                    self.last_expr_size = 1;
                } else {
                    self.last_expr_size = 2;
                }
            }
            Expr::SizeofType { target, .. } => {
                let size = target.storage_size(&self.structs);
                self.op("LDD", &format!("#{size}"));
                self.last_expr_size = 2;
            }
            Expr::SizeofExpr { value, .. } => {
                let ty = self.expr_type(value);
                let size = ty.storage_size(&self.structs);
                self.op("LDD", &format!("#{size}"));
                self.last_expr_size = 2;
            }
        }
    }

    fn gen_ident(&mut self, name: &str, pos: &SourcePos) {
        if let Some(info) = self.locals.get(name).cloned() {
            let offset = info.offset + self.arg_push_depth;
            if info.ty.is_array() {
                // Arrays decay to their address.
                self.op("TSX", "");
                self.op("XGDX", "");
                self.op("ADDD", &format!("#{offset}"));
                self.last_expr_size = 2;
            } else {
                self.op("TSX", "");
                if info.ty.is_char() {
                    self.op("LDAB", &format!("{offset},X"));
                    self.op("CLRA", "");
                    self.last_expr_size = 1;
                } else {
                    self.op("LDD", &format!("{offset},X"));
                    self.last_expr_size = 2;
                }
            }
            return;
        }
        if let Some(info) = self.globals.get(name).cloned() {
            if info.ty.is_array() {
                self.op("LDD", &format!("#_{name}"));
                self.last_expr_size = 2;
            } else if info.ty.is_char() {
                self.op("LDAB", &format!("_{name}"));
                self.op("CLRA", "");
                self.last_expr_size = 1;
            } else {
                self.op("LDD", &format!("_{name}"));
                self.last_expr_size = 2;
            }
            return;
        }
        self.error(pos, format!("unknown identifier: {name}"));
    }

    fn gen_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, pos: &SourcePos) {
        self.check_binary_mix(op, lhs, rhs, pos);
        let result_type = self.binary_result_type(op, lhs, rhs);

        if matches!(op, BinOp::LogicAnd | BinOp::LogicOr) {
            self.gen_logical(op, lhs, rhs);
            return;
        }

        // Comparison against a literal skips the stack round-trip.
        if op.is_comparison() {
            if let Some(value) = const_value(rhs) {
                let lt = self.expr_type(lhs);
                self.gen_expr(lhs);
                if lt.is_char() && (0..=255).contains(&value) {
                    self.op("CMPB", &format!("#{value}"));
                } else {
                    self.widen_if_char();
                    self.op("SUBD", &format!("#{}", value as u16));
                }
                self.gen_flag_to_bool(op);
                return;
            }
        }

        // Power-of-two multiply and divide lower to shifts.
        if matches!(op, BinOp::Mul | BinOp::Div) {
            if let Some(value) = const_value(rhs) {
                if value > 0 && (value & (value - 1)) == 0 {
                    let shifts = value.trailing_zeros();
                    if shifts <= 8 {
                        self.gen_expr(lhs);
                        self.widen_if_char();
                        let mnemonic = if op == BinOp::Mul { "ASLD" } else { "LSRD" };
                        for _ in 0..shifts {
                            self.op(mnemonic, "");
                        }
                        self.last_expr_size = 2;
                        return;
                    }
                }
            }
        }

        if result_type.is_char() {
            self.gen_binary_char(op, lhs, rhs);
            return;
        }

        // 16-bit path: right operand pushed, left in D, combined via 0,X.
        self.gen_expr(rhs);
        self.widen_if_char();
        self.op("PSHB", "");
        self.op("PSHA", "");
        self.arg_push_depth += 2;
        self.gen_expr(lhs);
        self.widen_if_char();

        match op {
            BinOp::Add => {
                self.op("TSX", "");
                self.op("ADDD", "0,X");
            }
            BinOp::Sub => {
                self.op("TSX", "");
                self.op("SUBD", "0,X");
            }
            BinOp::Mul => {
                self.op("TSX", "");
                self.op("LDX", "0,X");
                self.op("JSR", "__mul16");
            }
            BinOp::Div => {
                self.op("TSX", "");
                self.op("LDX", "0,X");
                self.op("JSR", "__div16");
            }
            BinOp::Mod => {
                self.op("TSX", "");
                self.op("LDX", "0,X");
                self.op("JSR", "__mod16");
            }
            BinOp::BitAnd => {
                self.op("TSX", "");
                self.op("ANDA", "0,X");
                self.op("ANDB", "1,X");
            }
            BinOp::BitOr => {
                self.op("TSX", "");
                self.op("ORAA", "0,X");
                self.op("ORAB", "1,X");
            }
            BinOp::BitXor => {
                self.op("TSX", "");
                self.op("EORA", "0,X");
                self.op("EORB", "1,X");
            }
            BinOp::Shl => {
                self.op("TSX", "");
                self.op("LDX", "0,X");
                self.op("JSR", "__shl16");
            }
            BinOp::Shr => {
                self.op("TSX", "");
                self.op("LDX", "0,X");
                self.op("JSR", "__shr16");
            }
            op if op.is_comparison() => {
                self.op("TSX", "");
                self.op("SUBD", "0,X");
                self.op("INS", "");
                self.op("INS", "");
                self.arg_push_depth -= 2;
                self.gen_flag_to_bool(op);
                return;
            }
            _ => unreachable!("logical ops handled above"),
        }

        self.op("INS", "");
        self.op("INS", "");
        self.arg_push_depth -= 2;
        self.last_expr_size = 2;
    }

    /// Comparisons leave D holding the left-minus-right flags; lower the
    /// condition to a 0/1 result.
    fn gen_flag_to_bool(&mut self, op: BinOp) {
        let true_label = self.new_label("true");
        let end_label = self.new_label("cmpend");
        let branch = match op {
            BinOp::Eq => "BEQ",
            BinOp::Ne => "BNE",
            BinOp::Lt => "BLT",
            BinOp::Le => "BLE",
            BinOp::Gt => "BGT",
            BinOp::Ge => "BGE",
            _ => unreachable!(),
        };
        self.op(branch, &true_label);
        self.op("LDD", "#0");
        self.op("BRA", &end_label);
        self.label(&true_label);
        self.op("LDD", "#1");
        self.label(&end_label);
        self.last_expr_size = 2;
    }

    /// 8-bit path for homogeneous char operands: one pushed byte, B-based
    /// arithmetic, A cleared afterwards.
    fn gen_binary_char(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        self.gen_expr(rhs);
        self.op("PSHB", "");
        self.arg_push_depth += 1;
        self.gen_expr(lhs);
        self.op("TSX", "");
        let mnemonic = match op {
            BinOp::Add => "ADDB",
            BinOp::Sub => "SUBB",
            BinOp::BitAnd => "ANDB",
            BinOp::BitOr => "ORAB",
            BinOp::BitXor => "EORB",
            _ => unreachable!("only 8-bit ops route here"),
        };
        self.op(mnemonic, "0,X");
        self.op("INS", "");
        self.arg_push_depth -= 1;
        self.op("CLRA", "");
        self.last_expr_size = 1;
    }

    fn gen_logical(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        let shortcut = self.new_label(if op == BinOp::LogicAnd { "land" } else { "lor" });
        let end = self.new_label("lend");
        let branch = if op == BinOp::LogicAnd { "BEQ" } else { "BNE" };

        self.gen_expr(lhs);
        self.boolean_test();
        self.op(branch, &shortcut);
        self.gen_expr(rhs);
        self.boolean_test();
        self.op(branch, &shortcut);
        self.op(
            "LDD",
            if op == BinOp::LogicAnd { "#1" } else { "#0" },
        );
        self.op("BRA", &end);
        self.label(&shortcut);
        self.op(
            "LDD",
            if op == BinOp::LogicAnd { "#0" } else { "#1" },
        );
        self.label(&end);
        self.last_expr_size = 2;
    }

    fn gen_unary(&mut self, op: UnOp, operand: &Expr, pos: &SourcePos) {
        match op {
            UnOp::Plus => self.gen_expr(operand),
            UnOp::Minus => {
                self.gen_expr(operand);
                self.widen_if_char();
                self.op("COMA", "");
                self.op("COMB", "");
                self.op("ADDD", "#1");
                self.last_expr_size = 2;
            }
            UnOp::BitNot => {
                self.gen_expr(operand);
                self.widen_if_char();
                self.op("COMA", "");
                self.op("COMB", "");
                self.last_expr_size = 2;
            }
            UnOp::LogicNot => {
                self.gen_expr(operand);
                let t = self.new_label("nott");
                let end = self.new_label("notend");
                self.boolean_test();
                self.op("BEQ", &t);
                self.op("LDD", "#0");
                self.op("BRA", &end);
                self.label(&t);
                self.op("LDD", "#1");
                self.label(&end);
                self.last_expr_size = 2;
            }
            UnOp::AddrOf => {
                self.gen_address_of(operand, pos);
                self.last_expr_size = 2;
            }
            UnOp::Deref => {
                let pointee = self.expr_type(operand).dereference();
                self.gen_expr(operand);
                self.op("XGDX", "");
                match pointee {
                    Some(t) if t.is_char() => {
                        self.op("LDAB", "0,X");
                        self.op("CLRA", "");
                        self.last_expr_size = 1;
                    }
                    _ => {
                        self.op("LDD", "0,X");
                        self.last_expr_size = 2;
                    }
                }
            }
            UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec => {
                self.gen_incdec(operand, op, pos);
            }
        }
    }

    fn gen_incdec(&mut self, operand: &Expr, op: UnOp, pos: &SourcePos) {
        let Expr::Ident { name, .. } = operand else {
            self.error(pos, "++/-- needs a plain variable");
            return;
        };
        let is_inc = matches!(op, UnOp::PreInc | UnOp::PostInc);
        let is_post = matches!(op, UnOp::PostInc | UnOp::PostDec);
        let name = name.clone();

        if let Some(info) = self.locals.get(&name).cloned() {
            let offset = info.offset + self.arg_push_depth;
            self.op("TSX", "");
            if info.ty.is_char() {
                self.op("LDAB", &format!("{offset},X"));
                self.op("CLRA", "");
                if is_post {
                    self.op("PSHB", "");
                    self.arg_push_depth += 1;
                }
                self.op(if is_inc { "INCB" } else { "DECB" }, "");
                self.op("TSX", "");
                let adjusted = info.offset + self.arg_push_depth;
                self.op("STAB", &format!("{adjusted},X"));
                if is_post {
                    self.op("PULB", "");
                    self.arg_push_depth -= 1;
                    self.op("CLRA", "");
                }
                self.last_expr_size = 1;
            } else {
                self.op("LDD", &format!("{offset},X"));
                if is_post {
                    self.op("PSHB", "");
                    self.op("PSHA", "");
                    self.arg_push_depth += 2;
                }
                self.op(if is_inc { "ADDD" } else { "SUBD" }, "#1");
                self.op("TSX", "");
                let adjusted = info.offset + self.arg_push_depth;
                self.op("STD", &format!("{adjusted},X"));
                if is_post {
                    self.op("PULA", "");
                    self.op("PULB", "");
                    self.arg_push_depth -= 2;
                }
                self.last_expr_size = 2;
            }
            return;
        }

        if let Some(info) = self.globals.get(&name).cloned() {
            if info.ty.is_char() {
                self.op("LDAB", &format!("_{name}"));
                self.op("CLRA", "");
                if is_post {
                    self.op("PSHB", "");
                    self.arg_push_depth += 1;
                }
                self.op(if is_inc { "INCB" } else { "DECB" }, "");
                self.op("STAB", &format!("_{name}"));
                if is_post {
                    self.op("PULB", "");
                    self.arg_push_depth -= 1;
                    self.op("CLRA", "");
                }
                self.last_expr_size = 1;
            } else {
                self.op("LDD", &format!("_{name}"));
                if is_post {
                    self.op("PSHB", "");
                    self.op("PSHA", "");
                    self.arg_push_depth += 2;
                }
                self.op(if is_inc { "ADDD" } else { "SUBD" }, "#1");
                self.op("STD", &format!("_{name}"));
                if is_post {
                    self.op("PULA", "");
                    self.op("PULB", "");
                    self.arg_push_depth -= 2;
                }
                self.last_expr_size = 2;
            }
            return;
        }
        self.error(pos, format!("unknown identifier: {name}"));
    }

    fn gen_address_of(&mut self, operand: &Expr, pos: &SourcePos) {
        match operand {
            Expr::Ident { name, .. } => {
                if let Some(info) = self.locals.get(name).cloned() {
                    let offset = info.offset + self.arg_push_depth;
                    self.op("TSX", "");
                    self.op("XGDX", "");
                    self.op("ADDD", &format!("#{offset}"));
                    return;
                }
                if self.globals.contains_key(name) {
                    self.op("LDD", &format!("#_{name}"));
                    return;
                }
                self.error(pos, format!("unknown identifier: {name}"));
            }
            Expr::Index { array, index, .. } => {
                self.gen_index_address(array, index);
                self.op("XGDX", "");
            }
            Expr::Member {
                object,
                field,
                arrow,
                pos,
            } => {
                self.gen_member(object, field, *arrow, pos, true);
            }
            _ => self.error(pos, "cannot take the address of this expression"),
        }
    }

    /// Leaves the element address in X; returns the element size.
    fn gen_index_address(&mut self, array: &Expr, index: &Expr) -> u32 {
        let array_type = self.expr_type(array);
        let element_size = array_type
            .dereference()
            .map(|t| t.element_size(&self.structs))
            .unwrap_or(2);

        // Base address into X.
        match array {
            Expr::Ident { name, pos } => {
                if let Some(info) = self.locals.get(name).cloned() {
                    if info.ty.is_array() {
                        let offset = info.offset + self.arg_push_depth;
                        self.op("TSX", "");
                        self.op("XGDX", "");
                        self.op("ADDD", &format!("#{offset}"));
                        self.op("XGDX", "");
                    } else {
                        let offset = info.offset + self.arg_push_depth;
                        self.op("TSX", "");
                        self.op("LDX", &format!("{offset},X"));
                    }
                } else if let Some(info) = self.globals.get(name).cloned() {
                    if info.ty.is_array() {
                        self.op("LDX", &format!("#_{name}"));
                    } else {
                        self.op("LDX", &format!("_{name}"));
                    }
                } else {
                    self.error(pos, format!("unknown identifier: {name}"));
                    return element_size;
                }
            }
            other => {
                self.gen_expr(other);
                self.op("XGDX", "");
            }
        }

        self.op("PSHX", "");
        self.arg_push_depth += 2;
        self.gen_expr(index);
        self.widen_if_char();
        if element_size == 2 {
            self.op("ASLD", "");
        } else if element_size > 2 {
            self.op("LDX", &format!("#{element_size}"));
            self.op("JSR", "__mul16");
        }
        self.op("TSX", "");
        self.op("ADDD", "0,X");
        self.op("INS", "");
        self.op("INS", "");
        self.arg_push_depth -= 2;
        self.op("XGDX", "");
        element_size
    }

    fn gen_member(
        &mut self,
        object: &Expr,
        field: &str,
        arrow: bool,
        pos: &SourcePos,
        address_only: bool,
    ) {
        let object_type = self.expr_type(object);
        let tag = match &object_type.base {
            BaseType::Struct(tag) => tag.clone(),
            _ => {
                self.error(pos, "member access on a non-struct value");
                return;
            }
        };
        let Some(layout) = self.structs.get(&tag).and_then(|s| s.field(field)).cloned() else {
            self.error(pos, format!("struct {tag} has no field {field}"));
            return;
        };

        if arrow {
            self.gen_expr(object);
        } else {
            // Need the struct's address.
            match object {
                Expr::Ident { .. } | Expr::Index { .. } | Expr::Member { .. } => {
                    self.gen_address_of(object, pos);
                }
                _ => {
                    self.error(pos, "cannot address this struct expression");
                    return;
                }
            }
        }
        if layout.offset > 0 {
            self.op("ADDD", &format!("#{}", layout.offset));
        }
        if address_only {
            self.last_expr_size = 2;
            return;
        }
        self.op("XGDX", "");
        if layout.field_type.is_struct_value() {
            // Nested struct: yield its address, like array decay.
            self.op("XGDX", "");
            self.last_expr_size = 2;
        } else if layout.field_type.is_char() {
            self.op("LDAB", "0,X");
            self.op("CLRA", "");
            self.last_expr_size = 1;
        } else {
            self.op("LDD", "0,X");
            self.last_expr_size = 2;
        }
    }

    fn gen_assignment(
        &mut self,
        op: &Option<BinOp>,
        target: &Expr,
        value: &Expr,
        pos: &SourcePos,
    ) {
        let value_type = self.expr_type(value);
        if value_type.is_void() {
            self.error(pos, "cannot assign a void value");
        }
        match op {
            None => self.gen_expr(value),
            Some(op) => {
                // Compound form: desugar to target OP value.
                let combined = Expr::Binary {
                    op: *op,
                    lhs: Box::new(target.clone()),
                    rhs: Box::new(value.clone()),
                    pos: pos.clone(),
                };
                self.gen_expr(&combined);
            }
        }
        self.gen_store(target, pos);
    }

    fn gen_store(&mut self, target: &Expr, pos: &SourcePos) {
        match target {
            Expr::Ident { name, .. } => {
                if let Some(info) = self.locals.get(name).cloned() {
                    self.op("TSX", "");
                    let offset = info.offset + self.arg_push_depth;
                    if info.ty.is_char() {
                        self.op("STAB", &format!("{offset},X"));
                        self.last_expr_size = 1;
                    } else {
                        self.op("STD", &format!("{offset},X"));
                        self.last_expr_size = 2;
                    }
                    return;
                }
                if let Some(info) = self.globals.get(name).cloned() {
                    if info.ty.is_char() {
                        self.op("STAB", &format!("_{name}"));
                        self.last_expr_size = 1;
                    } else {
                        self.op("STD", &format!("_{name}"));
                        self.last_expr_size = 2;
                    }
                    return;
                }
                self.error(pos, format!("unknown identifier: {name}"));
            }
            Expr::Index { array, index, .. } => {
                self.op("PSHB", "");
                self.op("PSHA", "");
                self.arg_push_depth += 2;
                let element = self.gen_index_address(array, index);
                self.op("PULA", "");
                self.op("PULB", "");
                self.arg_push_depth -= 2;
                if element == 1 {
                    self.op("STAB", "0,X");
                } else {
                    self.op("STD", "0,X");
                }
            }
            Expr::Unary {
                op: UnOp::Deref,
                operand,
                ..
            } => {
                let pointee = self.expr_type(operand).dereference();
                self.op("PSHB", "");
                self.op("PSHA", "");
                self.arg_push_depth += 2;
                self.gen_expr(operand);
                self.op("XGDX", "");
                self.op("PULA", "");
                self.op("PULB", "");
                self.arg_push_depth -= 2;
                match pointee {
                    Some(t) if t.is_char() => self.op("STAB", "0,X"),
                    _ => self.op("STD", "0,X"),
                }
            }
            Expr::Member {
                object,
                field,
                arrow,
                pos: member_pos,
            } => {
                self.op("PSHB", "");
                self.op("PSHA", "");
                self.arg_push_depth += 2;
                self.gen_member(object, field, *arrow, member_pos, true);
                self.op("XGDX", "");
                self.op("PULA", "");
                self.op("PULB", "");
                self.arg_push_depth -= 2;

                let object_type = self.expr_type(object);
                let is_char_field = match &object_type.base {
                    BaseType::Struct(tag) => self
                        .structs
                        .get(tag)
                        .and_then(|s| s.field(field))
                        .map(|f| f.field_type.is_char())
                        .unwrap_or(false),
                    _ => false,
                };
                if is_char_field {
                    self.op("STAB", "0,X");
                } else {
                    self.op("STD", "0,X");
                }
            }
            _ => self.error(pos, "assignment target is not an lvalue"),
        }
    }

    fn gen_call(&mut self, name: &str, args: &[Expr], pos: &SourcePos) {
        // Argument count checking against whatever signature we have.
        if let Some(sig) = self.functions.get(name) {
            if sig.params.len() != args.len() {
                let expected = sig.params.len();
                self.error(
                    pos,
                    format!("{name} expects {expected} arguments, got {}", args.len()),
                );
            }
        } else if let Some(ext) = self.externals.get(name) {
            if ext.param_count != args.len() {
                let expected = ext.param_count;
                self.error(
                    pos,
                    format!("{name} expects {expected} arguments, got {}", args.len()),
                );
            }
        } else if let Some((_, _, count)) = BUILTINS.iter().find(|(n, _, _)| *n == name) {
            if *count != args.len() {
                self.error(
                    pos,
                    format!("{name} expects {count} arguments, got {}", args.len()),
                );
            }
        } else {
            self.error(pos, format!("call to undeclared function: {name}"));
        }

        let target = if self.externals.contains_key(name) {
            format!("__ext_{name}")
        } else {
            format!("_{name}")
        };

        // Push right-to-left as 16-bit cells; chars ride widened.
        for arg in args.iter().rev() {
            self.gen_expr(arg);
            self.widen_if_char();
            self.op("PSHB", "");
            self.op("PSHA", "");
            self.arg_push_depth += 2;
        }
        self.op("JSR", &target);
        for _ in 0..args.len() * 2 {
            self.op("INS", "");
        }
        self.arg_push_depth -= 2 * args.len() as i32;
        self.last_expr_size = 2;
    }

    // ========================================================================
    // External procedure stubs
    // ========================================================================

    fn gen_external_stubs(&mut self) {
        if self.externals.is_empty() {
            return;
        }
        self.emit(String::new());
        self.comment("external procedure marshalling");
        if self.options.emit_runtime {
            self.label("__ext_init");
            self.op("SWI", "");
            self.op("FCB", "SVC_EXTINIT");
            self.op("RTS", "");
        }
        let externals: Vec<(String, ExternalInfo)> = self
            .externals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, info) in externals {
            self.label(&format!("__ext_{name}"));
            self.op("TSX", "");
            self.op("SWI", "");
            self.op("FCB", "SVC_EXTCALL");
            self.op("FCB", &info.param_count.to_string());
            self.op("FDB", &format!("__extn_{name}"));
            self.op("RTS", "");
            self.label(&format!("__extn_{name}"));
            self.op("FCC", &format!("\"{}\"", info.device_name));
            self.op("FCB", "0");
        }
    }

    // ========================================================================
    // Runtime library
    // ========================================================================

    fn gen_runtime(&mut self) {
        self.emit(String::new());
        self.comment("runtime library");
        self.emit("SVC_CLS     EQU $01".to_string());
        self.emit("SVC_PUTC    EQU $02".to_string());
        self.emit("SVC_PUTS    EQU $03".to_string());
        self.emit("SVC_AT      EQU $04".to_string());
        self.emit("SVC_GETKEY  EQU $05".to_string());
        self.emit("SVC_TESTKEY EQU $06".to_string());
        self.emit("SVC_TICKS   EQU $07".to_string());
        self.emit("SVC_PUTINT  EQU $08".to_string());
        self.emit("SVC_PUTUINT EQU $09".to_string());
        self.emit("SVC_PUTHEX  EQU $0A".to_string());
        self.emit("SVC_EXTINIT EQU $10".to_string());
        self.emit("SVC_EXTCALL EQU $11".to_string());
        self.emit("SVC_EXIT    EQU $7F".to_string());
        self.emit("__scr0      EQU $70".to_string());
        self.emit("__scr1      EQU $72".to_string());
        self.emit("__scr2      EQU $74".to_string());
        self.emit("__scr3      EQU $76".to_string());
        self.emit("__sgnq      EQU $78".to_string());
        self.emit("__sgnr      EQU $79".to_string());
        self.emit("__quot      EQU $7A".to_string());
        self.emit("__rem       EQU $7C".to_string());
        self.emit(String::new());

        for line in RUNTIME_ASM.lines() {
            self.emit(line.to_string());
        }
    }

    // ========================================================================
    // Data sections
    // ========================================================================

    fn gen_globals(&mut self) {
        if self.global_inits.is_empty() {
            return;
        }
        self.emit(String::new());
        self.comment("global variables");
        let inits = std::mem::take(&mut self.global_inits);
        for (name, ty, init) in &inits {
            let size = ty.storage_size(&self.structs);
            match init {
                None => {
                    self.label(&format!("_{name}"));
                    self.op("RMB", &size.to_string());
                }
                Some(Expr::Str { bytes, .. }) if ty.is_pointer() => {
                    let label = self.string_label(bytes);
                    self.label(&format!("_{name}"));
                    self.op("FDB", &label);
                }
                Some(expr) => match const_value(expr) {
                    Some(value) => {
                        self.label(&format!("_{name}"));
                        if ty.is_char() {
                            self.op("FCB", &(value as u8).to_string());
                        } else {
                            self.op("FDB", &(value as u16).to_string());
                        }
                    }
                    None => {
                        let pos = expr.pos().clone();
                        self.error(
                            &pos,
                            format!("initializer for {name} must be a constant"),
                        );
                    }
                },
            }
        }
    }

    fn gen_strings(&mut self) {
        if self.strings.is_empty() {
            return;
        }
        self.emit(String::new());
        self.comment("string literals, deduplicated");
        let strings: Vec<(Vec<u8>, String)> = self
            .strings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (bytes, label) in strings {
            self.label(&label);
            self.emit_string_bytes(&bytes);
            self.op("FCB", "0");
        }
    }

    fn emit_string_bytes(&mut self, bytes: &[u8]) {
        let mut run = String::new();
        for &byte in bytes {
            if (32..127).contains(&byte) && byte != b'"' && byte != b'\\' {
                run.push(byte as char);
            } else {
                if !run.is_empty() {
                    self.op("FCC", &format!("\"{run}\""));
                    run.clear();
                }
                self.op("FCB", &byte.to_string());
            }
        }
        if !run.is_empty() {
            self.op("FCC", &format!("\"{run}\""));
        }
    }

    pub fn signatures(&self) -> &HashMap<String, FnSig> {
        &self.functions
    }
}

fn byte_literal(expr: &Expr) -> bool {
    match const_value(expr) {
        Some(value) => (-128..=255).contains(&value),
        None => false,
    }
}

/// The runtime subroutines appended to every main unit. Arithmetic
/// helpers take the left operand in D and the right in X; string helpers
/// follow the standard frame convention.
const RUNTIME_ASM: &str = r#"__mul16:
        STD     __scr0
        STX     __scr1
        LDD     #0
        STD     __scr2
.loop:
        LDD     __scr0
        BEQ     .done
        LSRD
        STD     __scr0
        BCC     .even
        LDD     __scr2
        ADDD    __scr1
        STD     __scr2
.even:
        LDD     __scr1
        ASLD
        STD     __scr1
        BRA     .loop
.done:
        LDD     __scr2
        RTS

__udiv16:
        STD     __scr0
        STX     __scr1
        LDD     #0
        STD     __rem
        LDAA    #16
        STAA    __scr3
.loop:
        ASL     __scr0+1
        ROL     __scr0
        ROL     __rem+1
        ROL     __rem
        LDD     __rem
        SUBD    __scr1
        BCS     .small
        STD     __rem
        INC     __scr0+1
.small:
        DEC     __scr3
        BNE     .loop
        LDD     __scr0
        RTS

__divmod:
        STX     __scr1
        CLR     __sgnq
        CLR     __sgnr
        TSTA
        BPL     .dpos
        COMA
        COMB
        ADDD    #1
        INC     __sgnq
        INC     __sgnr
.dpos:
        PSHB
        PSHA
        LDD     __scr1
        TSTA
        BPL     .vpos
        COMA
        COMB
        ADDD    #1
        INC     __sgnq
.vpos:
        XGDX
        PULA
        PULB
        JSR     __udiv16
        STD     __quot
        LDAB    __sgnq
        ANDB    #1
        BEQ     .qpos
        LDD     __quot
        COMA
        COMB
        ADDD    #1
        STD     __quot
.qpos:
        LDAB    __sgnr
        ANDB    #1
        BEQ     .rpos
        LDD     __rem
        COMA
        COMB
        ADDD    #1
        STD     __rem
.rpos:
        RTS

__div16:
        JSR     __divmod
        LDD     __quot
        RTS

__mod16:
        JSR     __divmod
        LDD     __rem
        RTS

__shl16:
        CPX     #0
        BEQ     .done
.loop:
        ASLD
        DEX
        BNE     .loop
.done:
        RTS

__shr16:
        CPX     #0
        BEQ     .done
.loop:
        LSRD
        DEX
        BNE     .loop
.done:
        RTS

_cls:
        SWI
        FCB     SVC_CLS
        RTS

_putchar:
        TSX
        LDD     2,X
        SWI
        FCB     SVC_PUTC
        RTS

_print:
        TSX
        LDX     2,X
        SWI
        FCB     SVC_PUTS
        RTS

_print_int:
        TSX
        LDD     2,X
        SWI
        FCB     SVC_PUTINT
        RTS

_print_uint:
        TSX
        LDD     2,X
        SWI
        FCB     SVC_PUTUINT
        RTS

_print_hex:
        TSX
        LDD     2,X
        SWI
        FCB     SVC_PUTHEX
        RTS

_at:
        TSX
        LDAA    3,X
        LDAB    5,X
        SWI
        FCB     SVC_AT
        RTS

_getkey:
        SWI
        FCB     SVC_GETKEY
        RTS

_testkey:
        SWI
        FCB     SVC_TESTKEY
        RTS

_getticks:
        SWI
        FCB     SVC_TICKS
        RTS

_exit:
        SWI
        FCB     SVC_EXIT
        RTS

_strlen:
        TSX
        LDX     2,X
        LDD     #0
.loop:
        TST     0,X
        BEQ     .done
        INX
        ADDD    #1
        BRA     .loop
.done:
        RTS

_strcpy:
        TSX
        LDD     2,X
        STD     __scr0
        LDD     4,X
        STD     __scr1
.loop:
        LDX     __scr1
        LDAB    0,X
        INX
        STX     __scr1
        LDX     __scr0
        STAB    0,X
        INX
        STX     __scr0
        TSTB
        BNE     .loop
        TSX
        LDD     2,X
        RTS

_strcmp:
        TSX
        LDD     2,X
        STD     __scr0
        LDD     4,X
        STD     __scr1
.loop:
        LDX     __scr0
        LDAB    0,X
        INX
        STX     __scr0
        LDX     __scr1
        LDAA    0,X
        INX
        STX     __scr1
        CBA
        BNE     .diff
        TSTB
        BNE     .loop
        LDD     #0
        RTS
.diff:
        PSHA
        CLRA
        TSX
        SUBB    0,X
        SBCA    #0
        INS
        RTS

_memset:
        TSX
        LDD     2,X
        STD     __scr0
        LDD     6,X
        STD     __scr2
.loop:
        LDD     __scr2
        BEQ     .done
        SUBD    #1
        STD     __scr2
        TSX
        LDAB    5,X
        LDX     __scr0
        STAB    0,X
        INX
        STX     __scr0
        BRA     .loop
.done:
        TSX
        LDD     2,X
        RTS

_memcpy:
        TSX
        LDD     2,X
        STD     __scr0
        LDD     4,X
        STD     __scr1
        LDD     6,X
        STD     __scr2
.loop:
        LDD     __scr2
        BEQ     .done
        SUBD    #1
        STD     __scr2
        LDX     __scr1
        LDAB    0,X
        INX
        STX     __scr1
        LDX     __scr0
        STAB    0,X
        INX
        STX     __scr0
        BRA     .loop
.done:
        TSX
        LDD     2,X
        RTS

_abs:
        TSX
        LDD     2,X
        TSTA
        BPL     .done
        COMA
        COMB
        ADDD    #1
.done:
        RTS

_min:
        TSX
        LDD     2,X
        SUBD    4,X
        BLE     .first
        TSX
        LDD     4,X
        RTS
.first:
        TSX
        LDD     2,X
        RTS

_max:
        TSX
        LDD     2,X
        SUBD    4,X
        BGE     .first
        TSX
        LDD     4,X
        RTS
.first:
        TSX
        LDD     2,X
        RTS

_srand:
        TSX
        LDD     2,X
        STD     __seed
        RTS

_rand:
        LDD     __seed
        LDX     #25173
        JSR     __mul16
        ADDD    #13849
        STD     __seed
        LSRD
        RTS

__seed:
        FDB     1"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::parser;
    use crate::cc::preprocessor::preprocess;
    use crate::models::MODEL_XP;

    fn gen(source: &str) -> String {
        let (lines, _) = preprocess(source, "t.c", MODEL_XP, &[], &[]).unwrap();
        let parsed = parser::parse(&lines).unwrap();
        generate(&parsed.program, parsed.structs, &CodegenOptions::default()).unwrap()
    }

    fn gen_err(source: &str) -> DiagnosticBundle {
        let (lines, _) = preprocess(source, "t.c", MODEL_XP, &[], &[]).unwrap();
        let parsed = parser::parse(&lines).unwrap();
        generate(&parsed.program, parsed.structs, &CodegenOptions::default()).unwrap_err()
    }

    fn main_body(asm: &str) -> String {
        let start = asm.find("_main:").unwrap();
        let end = asm.find("_main_exit:").unwrap();
        asm[start..end].to_string()
    }

    /// Whitespace-insensitive "instruction present" check.
    fn has_op(text: &str, needle: &str) -> bool {
        let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        let needle = squash(needle);
        text.lines().any(|line| squash(line).contains(&needle))
    }

    #[test]
    fn prologue_allocates_locals_before_saving_frame() {
        let asm = gen("void main() { int a; char b; a = 1; b = 'x'; }");
        let body = main_body(&asm);
        // Three bytes of locals (int + char), then PSHX/TSX.
        let des_count = body.matches("DES").count();
        assert_eq!(des_count, 3, "{body}");
        let pshx_at = body.find("PSHX").unwrap();
        let des_at = body.find("DES").unwrap();
        assert!(des_at < pshx_at);
    }

    #[test]
    fn arguments_push_right_to_left_and_caller_pops() {
        let asm = gen(
            "int add(int a, int b) { return a + b; }\nvoid main() { add(1, 2); }",
        );
        let body = main_body(&asm);
        // Second argument is loaded first.
        let two_at = body.find("#2").unwrap();
        let one_at = body.find("#1").unwrap();
        assert!(two_at < one_at, "{body}");
        let jsr_at = body.find("_add").unwrap();
        let cleanup = &body[jsr_at..];
        assert_eq!(cleanup.matches("INS").count(), 4);
    }

    #[test]
    fn parameters_sit_past_saved_frame_and_return_address() {
        // No locals: first parameter lands at 4,X.
        let asm = gen("int first(int a, int b) { return a; }\nvoid main() { first(1, 2); }");
        let start = asm.find("_first:").unwrap();
        let end = asm.find("_first_exit:").unwrap();
        let body = &asm[start..end];
        assert!(has_op(body, "LDD 4,X"), "{body}");
    }

    #[test]
    fn char_arithmetic_uses_b_register() {
        let asm = gen("void main() { char a; char b; a = 'x'; b = a + a; }");
        let body = main_body(&asm);
        assert!(body.contains("ADDB"), "{body}");
        assert!(!has_op(&body, "ADDD 0,X"), "{body}");
    }

    #[test]
    fn mixed_char_int_without_cast_is_rejected() {
        let err = gen_err("void main() { char c; int n; c = 'a'; n = 1; c = c + n; }");
        assert!(err.to_string().contains("explicit cast"));
    }

    #[test]
    fn cast_permits_the_mix() {
        let asm = gen("void main() { char c; int n; c = 'a'; n = 1; c = c + (char) n; }");
        assert!(main_body(&asm).contains("ADDB"));
    }

    #[test]
    fn power_of_two_multiply_becomes_shifts() {
        let asm = gen("void main() { int a; int b; a = 3; b = a * 8; }");
        let body = main_body(&asm);
        assert_eq!(body.matches("ASLD").count(), 3, "{body}");
        assert!(!body.contains("__mul16"), "{body}");
        let asm = gen("void main() { int a; int b; a = 64; b = a / 4; }");
        let body = main_body(&asm);
        assert_eq!(body.matches("LSRD").count(), 2, "{body}");
    }

    #[test]
    fn non_power_of_two_calls_the_runtime() {
        let asm = gen("void main() { int a; int b; a = 3; b = a * 5; }");
        assert!(main_body(&asm).contains("__mul16"));
    }

    #[test]
    fn constant_folding_collapses_literal_arithmetic() {
        let asm = gen("void main() { int a; a = 2 + 3 * 4; }");
        let body = main_body(&asm);
        assert!(has_op(&body, "LDD #14"), "{body}");
        assert!(!body.contains("__mul16"), "{body}");
    }

    #[test]
    fn switch_lowers_to_compare_and_branch() {
        let asm = gen(
            "void main() { int k; k = 2; switch (k) { case 1: k = 9; break; case 2: k = 8; break; default: k = 7; } }",
        );
        let body = main_body(&asm);
        assert!(has_op(&body, "SUBD #1"), "{body}");
        assert!(has_op(&body, "SUBD #2"), "{body}");
        assert!(!has_op(&body, "JMP 0,X"), "no jump table: {body}");
    }

    #[test]
    fn string_literals_deduplicate() {
        let asm = gen("void main() { print(\"hi\"); print(\"hi\"); print(\"other\"); }");
        assert_eq!(asm.matches("__S0:").count(), 1);
        assert!(asm.contains("__S1:"));
        assert!(!asm.contains("__S2:"));
    }

    #[test]
    fn globals_emit_storage_and_initializers() {
        let asm = gen("int zeroed;\nint seeded = 7;\nchar letter = 'z';\nvoid main() { zeroed = 1; }");
        assert!(asm.contains("_zeroed:"));
        assert!(has_op(&asm, "RMB 2"));
        assert!(has_op(&asm, "FDB 7"));
        assert!(has_op(&asm, "FCB 122"));
    }

    #[test]
    fn library_mode_omits_entry_and_runtime() {
        let (lines, _) = preprocess("int one() { return 1; }", "lib.c", MODEL_XP, &[], &[]).unwrap();
        let parsed = parser::parse(&lines).unwrap();
        let asm = generate(
            &parsed.program,
            parsed.structs,
            &CodegenOptions {
                model: MODEL_XP,
                emit_runtime: false,
                unit_tag: String::new(),
            },
        )
        .unwrap();
        assert!(!asm.contains("_entry:"));
        assert!(!asm.contains("__mul16:"));
        assert!(asm.contains("_one:"));
    }

    #[test]
    fn undeclared_function_and_bad_arity_are_errors() {
        assert!(gen_err("void main() { mystery(); }")
            .to_string()
            .contains("undeclared"));
        assert!(gen_err("void main() { cls(1); }")
            .to_string()
            .contains("expects 0 arguments"));
    }

    #[test]
    fn external_stub_carries_suffixed_name_and_argc() {
        let asm = gen("external int ADDNUM(int a, int b);\nvoid main() { ADDNUM(1, 2); }");
        assert!(asm.contains("__ext_ADDNUM:"));
        assert!(asm.contains("\"ADDNUM%\""));
        assert!(has_op(&asm, "FCB 2"));
        let asm = gen("external void BEEPER(int t);\nvoid main() { BEEPER(1); }");
        assert!(asm.contains("\"BEEPER\""));
        let asm = gen("external char NAMEGET();\nvoid main() { NAMEGET(); }");
        assert!(asm.contains("\"NAMEGET$\""));
    }

    #[test]
    fn asm_statement_substitutes_frame_vars() {
        let asm = gen("int total;\nvoid main() { int n; n = 2; asm(\"LDD $n\\nSTD $total\"); }");
        let body = main_body(&asm);
        assert!(body.contains("LDD 2,X"), "{body}");
        assert!(body.contains("STD _total"), "{body}");
    }

    #[test]
    fn struct_member_access_computes_offsets() {
        let asm = gen(
            "struct P { int x; int y; };\nstruct P g;\nvoid main() { g.y = 5; }",
        );
        let body = main_body(&asm);
        assert!(has_op(&body, "ADDD #2"), "y at offset 2: {body}");
    }
}
