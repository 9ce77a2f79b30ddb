// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Two-pass HD6303 assembler.
//!
//! The engine runs in three stages:
//!
//! 1. **Collection** flattens the source into an item list: conditional
//!    blocks are resolved, macros expanded, includes read, local labels
//!    qualified with their enclosing global label.
//! 2. **Sizing** assigns addresses and instruction sizes, iterating to a
//!    fixed point. Mode decisions only ever widen (direct to extended,
//!    short branch to relaxed long form), which bounds the iteration by
//!    the number of instructions.
//! 3. **Encoding** emits bytes, records relocation fixups, and fills the
//!    listing and address-to-source map.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::debug;

use crate::asm::lexer::{self, Token};
use crate::asm::opcodes::{self, AddrMode};
use crate::asm::parser::{self, DirArg, Force, LineBody, Operand, ParsedLine};
use crate::core::diag::{DiagKind, Diagnostic, DiagnosticBundle, SourcePos};
use crate::core::expr::{self, Expr, EvalContext};
use crate::core::source_map::SourceMap;
use crate::models::{Model, DEFAULT_MODEL};

const MAX_MACRO_DEPTH: usize = 16;

// ============================================================================
// Symbols
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    CodeLabel,
    DataLabel,
    Equate,
    SetVariable,
    External,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: i32,
    pub kind: SymbolKind,
    pub pos: SourcePos,
}

impl Symbol {
    /// Constants and externals are position-independent; labels move
    /// with the code and participate in relocation.
    pub fn is_relocatable(&self) -> bool {
        matches!(self.kind, SymbolKind::CodeLabel | SymbolKind::DataLabel)
    }

    pub fn is_constant(&self) -> bool {
        !self.is_relocatable()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: IndexMap<String, Symbol>,
}

impl SymbolTable {
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.entries.get(&name.to_ascii_uppercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.entries.values()
    }

    fn insert(&mut self, symbol: Symbol) {
        self.entries.insert(symbol.name.to_ascii_uppercase(), symbol);
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_uppercase())
    }
}

struct TableContext<'a> {
    symbols: &'a SymbolTable,
    here: i32,
}

impl EvalContext for TableContext<'_> {
    fn lookup_symbol(&self, name: &str) -> Option<i32> {
        self.symbols.get(name).map(|s| s.value)
    }

    fn here(&self) -> Option<i32> {
        Some(self.here)
    }
}

// ============================================================================
// Items
// ============================================================================

/// Widened instruction form decided during sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decided {
    Inherent,
    Imm8,
    Imm16,
    Direct,
    Extended,
    Indexed,
    Relative,
    /// Conditional branch out of range: inverted short branch over JMP.
    RelaxedCond,
    /// BRA out of range: plain JMP.
    RelaxedJmp,
    /// BSR out of range: JSR extended.
    RelaxedJsr,
    BitDirect,
    BitIndexed,
}

impl Decided {
    fn size(self) -> u16 {
        match self {
            Decided::Inherent => 1,
            Decided::Imm8 | Decided::Direct | Decided::Indexed | Decided::Relative => 2,
            Decided::Imm16 | Decided::Extended | Decided::RelaxedJmp | Decided::RelaxedJsr => 3,
            Decided::BitDirect | Decided::BitIndexed => 3,
            Decided::RelaxedCond => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InstrItem {
    pub(crate) mnemonic: String,
    pub(crate) operand: Operand,
    pub(crate) pos: SourcePos,
    pub(crate) addr: u16,
    pub(crate) decided: Option<Decided>,
}

#[derive(Debug, Clone)]
pub(crate) enum Item {
    Label {
        name: String,
        kind: SymbolKind,
        pos: SourcePos,
    },
    Instr(InstrItem),
    Org {
        addr: Expr,
        pos: SourcePos,
    },
    Equ {
        name: String,
        value: Expr,
        is_set: bool,
        is_external: bool,
        pos: SourcePos,
    },
    /// FCB/FDB data; each element is one encoded unit.
    Data {
        width: u8,
        values: Vec<Expr>,
        pos: SourcePos,
    },
    /// FCC or string arguments: literal bytes.
    Bytes {
        bytes: Vec<u8>,
        pos: SourcePos,
    },
    Reserve {
        count: Expr,
        fill: Option<Expr>,
        pos: SourcePos,
    },
    Align {
        boundary: Expr,
        pos: SourcePos,
    },
    End {
        entry: Option<String>,
        pos: SourcePos,
    },
}

// ============================================================================
// Options and results
// ============================================================================

#[derive(Debug, Clone)]
pub struct AsmOptions {
    pub model: Model,
    pub relocatable: bool,
    pub optimize: bool,
    pub want_listing: bool,
    pub want_debug: bool,
    pub include_paths: Vec<PathBuf>,
    pub defines: Vec<(String, i32)>,
}

impl Default for AsmOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL,
            relocatable: false,
            optimize: true,
            want_listing: false,
            want_debug: false,
            include_paths: Vec::new(),
            defines: Vec::new(),
        }
    }
}

/// One finished listing row.
#[derive(Debug, Clone)]
pub struct ListingRow {
    pub addr: u16,
    pub bytes: Vec<u8>,
    pub pos: SourcePos,
    pub source: String,
}

/// Result of a successful assembly, before output wrapping.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub code: Vec<u8>,
    pub origin: u16,
    /// Offsets (from code start) of 16-bit cells holding internal
    /// absolute addresses; empty unless assembled relocatable.
    pub fixups: Vec<u16>,
    pub symbols: SymbolTable,
    pub source_map: SourceMap,
    pub listing_rows: Vec<ListingRow>,
    pub entry: Option<String>,
    pub relocatable: bool,
    pub model: Model,
    pub warnings: DiagnosticBundle,
}

// ============================================================================
// Assembler
// ============================================================================

pub struct Assembler {
    options: AsmOptions,
    items: Vec<Item>,
    symbols: SymbolTable,
    diags: DiagnosticBundle,
    /// Constant values known during collection; drives #IF/#IFDEF.
    preview: HashMap<String, i32>,
    includes_seen: HashSet<PathBuf>,
    macros: HashMap<String, MacroDef>,
    current_global: Option<String>,
    source_lines: Vec<(SourcePos, String)>,
    entry: Option<String>,
    model: Model,
}

#[derive(Debug, Clone)]
struct MacroDef {
    name: String,
    body: Vec<String>,
    pos: SourcePos,
}

struct CondFrame {
    /// Some branch of this block has already been taken.
    taken: bool,
    /// The current branch is being assembled.
    active: bool,
    /// An #ELSE has been seen.
    in_else: bool,
    pos: SourcePos,
}

/// Assemble source text into code, fixups and symbols.
pub fn assemble(
    source: &str,
    file: &str,
    options: &AsmOptions,
) -> Result<Assembly, DiagnosticBundle> {
    let mut asm = Assembler::new(options.clone());
    asm.collect(source, file, 0, false);
    if asm.diags.has_errors() {
        return Err(std::mem::take(&mut asm.diags).sorted());
    }
    if options.optimize {
        let removed = crate::asm::optimizer::optimize_items(&mut asm.items);
        if removed > 0 {
            debug!(removed, "peephole optimizer removed instructions");
        }
    }
    asm.size_items()?;
    asm.encode()
}

impl Assembler {
    fn new(options: AsmOptions) -> Self {
        let model = options.model;
        let mut asm = Self {
            options,
            items: Vec::new(),
            symbols: SymbolTable::default(),
            diags: DiagnosticBundle::new(),
            preview: HashMap::new(),
            includes_seen: HashSet::new(),
            macros: HashMap::new(),
            current_global: None,
            source_lines: Vec::new(),
            entry: None,
            model,
        };
        for (name, value) in asm.options.defines.clone() {
            asm.define_external(&name, value);
        }
        asm.define_model_symbols();
        asm
    }

    fn define_external(&mut self, name: &str, value: i32) {
        self.preview.insert(name.to_ascii_uppercase(), value);
        self.symbols.insert(Symbol {
            name: name.to_string(),
            value,
            kind: SymbolKind::External,
            pos: SourcePos::builtin(),
        });
    }

    fn define_model_symbols(&mut self) {
        let model = self.model;
        self.define_external("DISP_ROWS", model.display_rows as i32);
        self.define_external("DISP_COLS", model.display_cols as i32);
        self.define_external(model.cpp_symbol().trim_matches('_'), 1);
    }

    // ========================================================================
    // Stage 1: collection
    // ========================================================================

    fn collect(&mut self, source: &str, file: &str, macro_depth: usize, in_include: bool) {
        let mut conds: Vec<CondFrame> = Vec::new();
        let mut macro_body: Option<MacroDef> = None;

        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = idx as u32 + 1;
            let pos = SourcePos::new(file, line_no, 1);
            if macro_depth == 0 && !in_include {
                self.source_lines.push((pos.clone(), raw_line.to_string()));
            }

            let trimmed = raw_line.trim_start();

            // Conditional directives control line visibility before
            // anything else looks at the line.
            if let Some(rest) = strip_cond_directive(trimmed) {
                self.handle_conditional(rest, &mut conds, &pos);
                continue;
            }
            if !conds.iter().all(|frame| frame.active) {
                continue;
            }

            // Macro recording: swallow everything until ENDM.
            if let Some(def) = &mut macro_body {
                if trimmed.to_ascii_uppercase().starts_with("ENDM") {
                    let def = macro_body.take().unwrap();
                    self.macros.insert(def.name.to_ascii_uppercase(), def);
                } else {
                    def.body.push(raw_line.to_string());
                }
                continue;
            }

            let tokens = match lexer::lex_line(raw_line, file, line_no) {
                Ok(tokens) => tokens,
                Err(diag) => {
                    self.diags.push(diag);
                    continue;
                }
            };
            if tokens.is_empty() {
                continue;
            }

            let parsed = match parser::parse_line(&tokens, pos.clone()) {
                Ok(parsed) => parsed,
                Err(diag) => {
                    self.diags.push(diag);
                    continue;
                }
            };

            if let Some(def) = self.start_macro_def(&parsed) {
                macro_body = Some(def);
                continue;
            }

            if self.collect_parsed(parsed, &tokens, macro_depth, in_include, &pos) {
                break; // END directive
            }
        }

        if let Some(def) = macro_body {
            self.diags.error(
                DiagKind::Macro,
                def.pos,
                format!("macro {} has no ENDM", def.name),
            );
        }
        for frame in conds {
            self.diags.error(
                DiagKind::Conditional,
                frame.pos,
                "unterminated conditional block",
            );
        }
    }

    fn start_macro_def(&mut self, parsed: &ParsedLine) -> Option<MacroDef> {
        let body = parsed.body.as_ref()?;
        let LineBody::Directive { name, args, pos } = body else {
            return None;
        };
        if name != "MACRO" {
            return None;
        }
        let macro_name = if let Some(label) = &parsed.label {
            Some(label.name.clone())
        } else {
            args.first().and_then(|arg| match arg {
                DirArg::Str(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
                DirArg::Expr(Expr::Symbol(name)) => Some(name.clone()),
                _ => None,
            })
        };
        match macro_name {
            Some(name) => Some(MacroDef {
                name,
                body: Vec::new(),
                pos: pos.clone(),
            }),
            None => {
                self.diags
                    .error(DiagKind::Macro, pos.clone(), "MACRO requires a name");
                None
            }
        }
    }

    /// Returns true when collection of this file should stop (END).
    fn collect_parsed(
        &mut self,
        parsed: ParsedLine,
        _tokens: &[Token],
        macro_depth: usize,
        in_include: bool,
        pos: &SourcePos,
    ) -> bool {
        if let Some(label) = &parsed.label {
            // EQU/SET consume their label as the symbol name instead and
            // do not open a new local-label scope.
            let is_equate = matches!(
                &parsed.body,
                Some(LineBody::Directive { name, .. }) if name == "EQU" || name == "SET"
            );
            if !is_equate {
                if let Some(name) = self.qualify_label(&label.name, label.is_local, &label.pos) {
                    let kind = match &parsed.body {
                        Some(LineBody::Directive { name: dir, .. })
                            if matches!(dir.as_str(), "FCB" | "FDB" | "FCC" | "RMB" | "FILL") =>
                        {
                            SymbolKind::DataLabel
                        }
                        _ => SymbolKind::CodeLabel,
                    };
                    self.items.push(Item::Label {
                        name,
                        kind,
                        pos: label.pos.clone(),
                    });
                }
            }
        }

        let Some(body) = parsed.body else {
            return false;
        };

        match body {
            LineBody::Instr {
                mnemonic,
                operand,
                pos,
            } => {
                let operand = self.qualify_operand(operand);
                self.items.push(Item::Instr(InstrItem {
                    mnemonic,
                    operand,
                    pos,
                    addr: 0,
                    decided: None,
                }));
                false
            }
            LineBody::Directive { name, args, pos } => {
                self.collect_directive(&name, args, parsed.label.as_ref(), in_include, &pos)
            }
            LineBody::MacroCall { name, args, pos } => {
                self.expand_macro(&name, &args, macro_depth, in_include, &pos);
                false
            }
        }
    }

    fn qualify_label(&mut self, name: &str, is_local: bool, pos: &SourcePos) -> Option<String> {
        // Symbols are case-insensitive and stored uppercased.
        let name = name.to_ascii_uppercase();
        if is_local {
            match &self.current_global {
                Some(global) => Some(format!("{global}{name}")),
                None => {
                    self.diags.error(
                        DiagKind::Symbol,
                        pos.clone(),
                        format!("local label {name} before any global label"),
                    );
                    None
                }
            }
        } else {
            self.current_global = Some(name.clone());
            Some(name)
        }
    }

    fn qualify_operand(&self, operand: Operand) -> Operand {
        match operand {
            Operand::Immediate(e) => Operand::Immediate(self.qualify_expr(e)),
            Operand::Indexed(e) => Operand::Indexed(self.qualify_expr(e)),
            Operand::Addr { expr, force } => Operand::Addr {
                expr: self.qualify_expr(expr),
                force,
            },
            Operand::BitOpDirect { mask, addr } => Operand::BitOpDirect {
                mask: self.qualify_expr(mask),
                addr: self.qualify_expr(addr),
            },
            Operand::BitOpIndexed { mask, offset } => Operand::BitOpIndexed {
                mask: self.qualify_expr(mask),
                offset: self.qualify_expr(offset),
            },
            Operand::Inherent => Operand::Inherent,
        }
    }

    fn qualify_expr(&self, expr: Expr) -> Expr {
        match expr {
            Expr::Symbol(name) if name.starts_with('.') => match &self.current_global {
                Some(global) => Expr::Symbol(format!("{global}{name}")),
                None => Expr::Symbol(name),
            },
            Expr::Unary(op, inner) => Expr::Unary(op, Box::new(self.qualify_expr(*inner))),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                op,
                Box::new(self.qualify_expr(*lhs)),
                Box::new(self.qualify_expr(*rhs)),
            ),
            other => other,
        }
    }

    fn collect_directive(
        &mut self,
        name: &str,
        args: Vec<DirArg>,
        label: Option<&parser::LabelDef>,
        in_include: bool,
        pos: &SourcePos,
    ) -> bool {
        match name {
            "ORG" => {
                if let Some(DirArg::Expr(expr)) = args.into_iter().next() {
                    self.items.push(Item::Org {
                        addr: expr,
                        pos: pos.clone(),
                    });
                } else {
                    self.diags
                        .error(DiagKind::Directive, pos.clone(), "ORG requires an address");
                }
            }
            "EQU" | "SET" => {
                let Some(label) = label else {
                    self.diags.error(
                        DiagKind::Directive,
                        pos.clone(),
                        format!("{name} requires a label"),
                    );
                    return false;
                };
                let Some(DirArg::Expr(expr)) = args.into_iter().next() else {
                    self.diags.error(
                        DiagKind::Directive,
                        pos.clone(),
                        format!("{name} requires a value"),
                    );
                    return false;
                };
                let expr = self.qualify_expr(expr);
                // Feed the collection-time preview when the value is
                // already computable, so #IF can see it.
                let preview = self.preview.clone();
                let ctx = expr::FnEvalContext::new(move |n: &str| {
                    preview.get(&n.to_ascii_uppercase()).copied()
                });
                if let Ok(value) = expr::eval_expr(&expr, &ctx, pos) {
                    self.preview.insert(label.name.to_ascii_uppercase(), value);
                }
                self.items.push(Item::Equ {
                    name: label.name.to_ascii_uppercase(),
                    value: expr,
                    is_set: name == "SET",
                    is_external: in_include,
                    pos: pos.clone(),
                });
            }
            "FCB" => {
                let mut values = Vec::new();
                for arg in args {
                    match arg {
                        DirArg::Expr(expr) => values.push(self.qualify_expr(expr)),
                        DirArg::Str(bytes) => {
                            // String arguments to FCB emit their bytes.
                            if !values.is_empty() {
                                self.items.push(Item::Data {
                                    width: 1,
                                    values: std::mem::take(&mut values),
                                    pos: pos.clone(),
                                });
                            }
                            self.items.push(Item::Bytes {
                                bytes,
                                pos: pos.clone(),
                            });
                        }
                    }
                }
                if !values.is_empty() {
                    self.items.push(Item::Data {
                        width: 1,
                        values,
                        pos: pos.clone(),
                    });
                }
            }
            "FDB" => {
                let mut values = Vec::new();
                for arg in args {
                    match arg {
                        DirArg::Expr(expr) => values.push(self.qualify_expr(expr)),
                        DirArg::Str(_) => {
                            self.diags.error(
                                DiagKind::Directive,
                                pos.clone(),
                                "FDB takes word expressions, not strings",
                            );
                        }
                    }
                }
                self.items.push(Item::Data {
                    width: 2,
                    values,
                    pos: pos.clone(),
                });
            }
            "FCC" => match args.into_iter().next() {
                Some(DirArg::Str(bytes)) => {
                    self.items.push(Item::Bytes {
                        bytes,
                        pos: pos.clone(),
                    });
                }
                _ => {
                    self.diags
                        .error(DiagKind::Directive, pos.clone(), "FCC requires a string");
                }
            },
            "RMB" => {
                if let Some(DirArg::Expr(expr)) = args.into_iter().next() {
                    self.items.push(Item::Reserve {
                        count: self.qualify_expr(expr),
                        fill: None,
                        pos: pos.clone(),
                    });
                } else {
                    self.diags
                        .error(DiagKind::Directive, pos.clone(), "RMB requires a count");
                }
            }
            "FILL" => {
                let mut it = args.into_iter();
                match (it.next(), it.next()) {
                    (Some(DirArg::Expr(value)), Some(DirArg::Expr(count))) => {
                        self.items.push(Item::Reserve {
                            count: self.qualify_expr(count),
                            fill: Some(self.qualify_expr(value)),
                            pos: pos.clone(),
                        });
                    }
                    _ => {
                        self.diags.error(
                            DiagKind::Directive,
                            pos.clone(),
                            "FILL requires value and count",
                        );
                    }
                }
            }
            "ALIGN" => {
                if let Some(DirArg::Expr(expr)) = args.into_iter().next() {
                    self.items.push(Item::Align {
                        boundary: self.qualify_expr(expr),
                        pos: pos.clone(),
                    });
                } else {
                    self.diags
                        .error(DiagKind::Directive, pos.clone(), "ALIGN requires a boundary");
                }
            }
            "INCLUDE" => {
                if let Some(DirArg::Str(bytes)) = args.into_iter().next() {
                    let filename = String::from_utf8_lossy(&bytes).to_string();
                    self.process_include(&filename, pos);
                } else {
                    self.diags.error(
                        DiagKind::Directive,
                        pos.clone(),
                        "INCLUDE requires a file name",
                    );
                }
            }
            "INCBIN" => {
                if let Some(DirArg::Str(bytes)) = args.into_iter().next() {
                    let filename = String::from_utf8_lossy(&bytes).to_string();
                    match self.resolve_include(&filename, pos) {
                        Some(path) => match std::fs::read(&path) {
                            Ok(bytes) => self.items.push(Item::Bytes {
                                bytes,
                                pos: pos.clone(),
                            }),
                            Err(err) => self.diags.error(
                                DiagKind::Io,
                                pos.clone(),
                                format!("cannot read {}: {err}", path.display()),
                            ),
                        },
                        None => {}
                    }
                } else {
                    self.diags.error(
                        DiagKind::Directive,
                        pos.clone(),
                        "INCBIN requires a file name",
                    );
                }
            }
            "END" => {
                let entry = args.into_iter().next().and_then(|arg| match arg {
                    DirArg::Str(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
                    DirArg::Expr(Expr::Symbol(name)) => Some(name),
                    _ => None,
                });
                self.items.push(Item::End {
                    entry,
                    pos: pos.clone(),
                });
                return true;
            }
            "MODEL" => {
                if let Some(DirArg::Str(bytes)) = args.into_iter().next() {
                    let code = String::from_utf8_lossy(&bytes).to_string();
                    match crate::models::lookup(&code) {
                        Some(model) => {
                            self.model = model;
                            self.define_model_symbols();
                        }
                        None => self.diags.error(
                            DiagKind::Directive,
                            pos.clone(),
                            format!("unknown model: {code}"),
                        ),
                    }
                }
            }
            "ENDM" => {
                self.diags
                    .error(DiagKind::Macro, pos.clone(), "ENDM without MACRO");
            }
            "MACRO" => {
                // Handled by start_macro_def; reaching here means the
                // definition had no usable name.
            }
            other => {
                self.diags.error(
                    DiagKind::Directive,
                    pos.clone(),
                    format!("unknown directive: {other}"),
                );
            }
        }
        false
    }

    fn process_include(&mut self, filename: &str, pos: &SourcePos) {
        let Some(path) = self.resolve_include(filename, pos) else {
            return;
        };
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !self.includes_seen.insert(canonical) {
            self.diags.error(
                DiagKind::Directive,
                pos.clone(),
                format!("circular include: {filename}"),
            );
            return;
        }
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                let file = path.display().to_string();
                self.collect(&source, &file, 0, true);
            }
            Err(err) => {
                self.diags.error(
                    DiagKind::Io,
                    pos.clone(),
                    format!("cannot read {}: {err}", path.display()),
                );
            }
        }
    }

    fn resolve_include(&mut self, filename: &str, pos: &SourcePos) -> Option<PathBuf> {
        let direct = Path::new(filename);
        if direct.exists() {
            return Some(direct.to_path_buf());
        }
        if pos.file != "<input>" {
            if let Some(parent) = Path::new(&pos.file).parent() {
                let candidate = parent.join(filename);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
        for base in &self.options.include_paths {
            let candidate = base.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        self.diags.error(
            DiagKind::Io,
            pos.clone(),
            format!("include file not found: {filename}"),
        );
        None
    }

    fn expand_macro(
        &mut self,
        name: &str,
        args: &[String],
        macro_depth: usize,
        in_include: bool,
        pos: &SourcePos,
    ) {
        let Some(def) = self.macros.get(&name.to_ascii_uppercase()).cloned() else {
            self.diags.error(
                DiagKind::Instruction,
                pos.clone(),
                format!("unknown mnemonic or macro: {name}"),
            );
            return;
        };
        if macro_depth >= MAX_MACRO_DEPTH {
            self.diags.error(
                DiagKind::Macro,
                pos.clone(),
                format!("macro recursion depth exceeded expanding {name}"),
            );
            return;
        }
        let mut expanded = String::new();
        for line in &def.body {
            expanded.push_str(&substitute_params(line, args));
            expanded.push('\n');
        }
        let file = format!("{}:{}<{}>", pos.file, pos.line, def.name);
        self.collect(&expanded, &file, macro_depth + 1, in_include);
    }

    fn handle_conditional(&mut self, rest: &str, conds: &mut Vec<CondFrame>, pos: &SourcePos) {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let word = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().unwrap_or("").trim();
        let outer_active = conds.iter().all(|f| f.active);

        match word.as_str() {
            "IFDEF" | "IFNDEF" => {
                let defined = self.preview.contains_key(&arg.to_ascii_uppercase())
                    || self.symbols.contains(arg);
                let cond = if word == "IFDEF" { defined } else { !defined };
                conds.push(CondFrame {
                    taken: outer_active && cond,
                    active: outer_active && cond,
                    in_else: false,
                    pos: pos.clone(),
                });
            }
            "IF" => {
                let cond = outer_active && self.eval_cond_expr(arg, pos);
                conds.push(CondFrame {
                    taken: cond,
                    active: cond,
                    in_else: false,
                    pos: pos.clone(),
                });
            }
            "ELIF" => {
                let valid = matches!(conds.last(), Some(frame) if !frame.in_else);
                if !valid {
                    self.diags
                        .error(DiagKind::Conditional, pos.clone(), "#ELIF without #IF");
                } else {
                    let parent_active = conds[..conds.len() - 1].iter().all(|f| f.active);
                    let taken = conds.last().unwrap().taken;
                    let cond = !taken && parent_active && self.eval_cond_expr(arg, pos);
                    let frame = conds.last_mut().unwrap();
                    frame.active = cond;
                    if cond {
                        frame.taken = true;
                    }
                }
            }
            "ELSE" => {
                let valid = matches!(conds.last(), Some(frame) if !frame.in_else);
                if !valid {
                    self.diags
                        .error(DiagKind::Conditional, pos.clone(), "#ELSE without #IF");
                } else {
                    let parent_active = conds[..conds.len() - 1].iter().all(|f| f.active);
                    let frame = conds.last_mut().unwrap();
                    frame.in_else = true;
                    frame.active = parent_active && !frame.taken;
                    frame.taken = true;
                }
            }
            "ENDIF" => {
                if conds.pop().is_none() {
                    self.diags
                        .error(DiagKind::Conditional, pos.clone(), "#ENDIF without #IF");
                }
            }
            other => {
                self.diags.error(
                    DiagKind::Conditional,
                    pos.clone(),
                    format!("unknown conditional directive: #{other}"),
                );
            }
        }
    }

    fn eval_cond_expr(&mut self, text: &str, pos: &SourcePos) -> bool {
        let tokens = match lexer::lex_line(&format!(" {text}"), &pos.file, pos.line) {
            Ok(tokens) => tokens,
            Err(diag) => {
                self.diags.push(diag);
                return false;
            }
        };
        let mut cursor = parser::Cursor::new(&tokens, pos.clone());
        let expr = match parser::parse_expr(&mut cursor) {
            Ok(expr) => expr,
            Err(diag) => {
                self.diags.push(diag);
                return false;
            }
        };
        let preview = self.preview.clone();
        let ctx =
            expr::FnEvalContext::new(move |n: &str| preview.get(&n.to_ascii_uppercase()).copied());
        match expr::eval_expr(&expr, &ctx, pos) {
            Ok(value) => value != 0,
            Err(diag) => {
                self.diags.push(diag);
                false
            }
        }
    }

    // ========================================================================
    // Evaluation helpers (borrow self only for the duration of one call)
    // ========================================================================

    fn eval_in(&self, expr: &Expr, here: i32, pos: &SourcePos) -> Result<i32, Diagnostic> {
        let ctx = TableContext {
            symbols: &self.symbols,
            here,
        };
        expr::eval_expr(expr, &ctx, pos)
    }

    /// Relocation balance of internal (label) symbols in the expression.
    fn balance_internal(&self, expr: &Expr) -> i32 {
        expr.relocation_balance(&|name| {
            self.symbols
                .get(name)
                .map(|s| s.is_relocatable())
                .unwrap_or(false)
        })
    }

    // ========================================================================
    // Stage 2: sizing and relaxation
    // ========================================================================

    fn size_items(&mut self) -> Result<(), DiagnosticBundle> {
        // Every round either reaches a fixed point or widens at least
        // one instruction, and each can widen at most twice. At least
        // two rounds run so forward equates see the final label values.
        let mut round = 0usize;
        loop {
            let changed = self.size_round(round == 0);
            round += 1;
            if self.diags.has_errors() {
                return Err(std::mem::take(&mut self.diags).sorted());
            }
            if !changed && round >= 2 {
                break;
            }
            debug!(round, "re-sizing after relaxation round");
        }
        Ok(())
    }

    fn size_round(&mut self, report: bool) -> bool {
        // Rebuild label/equate values with current size decisions;
        // predefines and include constants survive in `symbols`.
        let mut pc: i32 = 0;
        let mut origin_set = false;
        let mut changed = false;

        let mut items = std::mem::take(&mut self.items);
        for item in &mut items {
            match item {
                Item::Label { name, kind, pos } => {
                    if report && self.symbols.contains(name) {
                        let prev = self.symbols.get(name).unwrap().pos.clone();
                        self.diags.push(
                            Diagnostic::error(
                                DiagKind::Symbol,
                                pos.clone(),
                                format!("duplicate label: {name}"),
                            )
                            .with_related(prev),
                        );
                        continue;
                    }
                    self.symbols.insert(Symbol {
                        name: name.clone(),
                        value: pc,
                        kind: *kind,
                        pos: pos.clone(),
                    });
                }
                Item::Equ {
                    name,
                    value,
                    is_set,
                    is_external,
                    pos,
                } => {
                    if report {
                        if let Some(existing) = self.symbols.get(name) {
                            let redefinable = existing.kind == SymbolKind::SetVariable && *is_set;
                            if !redefinable && existing.pos != *pos {
                                self.diags.push(
                                    Diagnostic::error(
                                        DiagKind::Symbol,
                                        pos.clone(),
                                        format!("duplicate symbol: {name}"),
                                    )
                                    .with_related(existing.pos.clone()),
                                );
                                continue;
                            }
                        }
                    }
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc,
                    };
                    match expr::eval_expr(value, &ctx, pos) {
                        Ok(v) => {
                            let kind = if *is_external {
                                SymbolKind::External
                            } else if *is_set {
                                SymbolKind::SetVariable
                            } else {
                                SymbolKind::Equate
                            };
                            self.symbols.insert(Symbol {
                                name: name.clone(),
                                value: v,
                                kind,
                                pos: pos.clone(),
                            });
                        }
                        Err(_) => {
                            // Forward equate: resolved on a later round;
                            // still unresolved values fail in encode.
                        }
                    }
                }
                Item::Org { addr, pos } => {
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc,
                    };
                    match expr::eval_expr(addr, &ctx, pos) {
                        Ok(v) => {
                            pc = v as u16 as i32;
                            if !origin_set {
                                origin_set = true;
                            }
                        }
                        Err(diag) => {
                            if report {
                                self.diags.push(diag);
                            }
                        }
                    }
                }
                Item::Instr(instr) => {
                    instr.addr = pc as u16;
                    let decided = self.decide_mode(instr, report);
                    if instr.decided != Some(decided) {
                        // Only widen, never narrow.
                        let widen = match (instr.decided, decided) {
                            (None, _) => true,
                            (Some(old), new) => new.size() > old.size(),
                        };
                        if widen {
                            instr.decided = Some(decided);
                            changed = true;
                        }
                    }
                    pc += instr.decided.map(|d| d.size()).unwrap_or(3) as i32;
                }
                Item::Data { width, values, .. } => {
                    pc += *width as i32 * values.len() as i32;
                }
                Item::Bytes { bytes, .. } => {
                    pc += bytes.len() as i32;
                }
                Item::Reserve { count, pos, .. } => {
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc,
                    };
                    match expr::eval_expr(count, &ctx, pos) {
                        Ok(v) if v >= 0 => pc += v,
                        Ok(_) => {
                            if report {
                                self.diags.error(
                                    DiagKind::Directive,
                                    pos.clone(),
                                    "reserve count cannot be negative",
                                );
                            }
                        }
                        Err(diag) => {
                            if report {
                                self.diags.push(diag);
                            }
                        }
                    }
                }
                Item::Align { boundary, pos } => {
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc,
                    };
                    match expr::eval_expr(boundary, &ctx, pos) {
                        Ok(b) if b > 0 => {
                            pc = (pc + b - 1) / b * b;
                        }
                        Ok(_) => {
                            if report {
                                self.diags.error(
                                    DiagKind::Directive,
                                    pos.clone(),
                                    "alignment boundary must be positive",
                                );
                            }
                        }
                        Err(diag) => {
                            if report {
                                self.diags.push(diag);
                            }
                        }
                    }
                }
                Item::End { entry, .. } => {
                    if self.entry.is_none() {
                        self.entry = entry.clone();
                    }
                }
            }
        }
        self.items = items;

        // Branch relaxation sweep with the symbol values of this round.
        let relax_changed = self.relax_branches();
        changed || relax_changed
    }

    fn decide_mode(&mut self, instr: &InstrItem, report: bool) -> Decided {
        let mnemonic = instr.mnemonic.as_str();
        match &instr.operand {
            Operand::Inherent => Decided::Inherent,
            Operand::Immediate(_) => {
                if opcodes::uses_word_immediate(mnemonic) {
                    Decided::Imm16
                } else {
                    Decided::Imm8
                }
            }
            Operand::Indexed(_) => Decided::Indexed,
            Operand::BitOpDirect { .. } => Decided::BitDirect,
            Operand::BitOpIndexed { .. } => Decided::BitIndexed,
            Operand::Addr { expr, force } => {
                if opcodes::is_branch(mnemonic) {
                    return instr.decided.unwrap_or(Decided::Relative);
                }
                if let Some(prev) = instr.decided {
                    if matches!(prev, Decided::Extended) {
                        return prev;
                    }
                }
                match force {
                    Force::Direct => Decided::Direct,
                    Force::Extended => Decided::Extended,
                    Force::None => {
                        let has_direct = opcodes::lookup(mnemonic, AddrMode::Direct).is_some();
                        if !has_direct {
                            return Decided::Extended;
                        }
                        // Relocatable code must not reach internal labels
                        // through direct mode; the low byte cannot be
                        // patched at load time.
                        if self.options.relocatable && self.refs_internal(expr) {
                            return Decided::Extended;
                        }
                        let ctx = TableContext {
                            symbols: &self.symbols,
                            here: instr.addr as i32,
                        };
                        match expr::eval_expr(expr, &ctx, &instr.pos) {
                            Ok(v) if (0..=0xFF).contains(&v) => Decided::Direct,
                            Ok(_) => Decided::Extended,
                            Err(_) => {
                                let _ = report;
                                Decided::Extended
                            }
                        }
                    }
                }
            }
        }
    }

    fn refs_internal(&self, expr: &Expr) -> bool {
        expr.symbols().iter().any(|name| {
            self.symbols
                .get(name)
                .map(|s| s.is_relocatable())
                .unwrap_or(true) // unknown symbols are assumed internal
        })
    }

    fn relax_branches(&mut self) -> bool {
        let mut changed = false;
        let mut items = std::mem::take(&mut self.items);
        for item in &mut items {
            let Item::Instr(instr) = item else { continue };
            if instr.decided != Some(Decided::Relative) {
                continue;
            }
            let Operand::Addr { expr, .. } = &instr.operand else {
                continue;
            };
            let ctx = TableContext {
                symbols: &self.symbols,
                here: instr.addr as i32,
            };
            let Ok(target) = expr::eval_expr(expr, &ctx, &instr.pos) else {
                continue; // undefined symbols fail during encode
            };
            let disp = (target as u16 as i32) - (instr.addr as i32 + 2);
            if (-128..=127).contains(&disp) {
                continue;
            }
            let upper = instr.mnemonic.to_ascii_uppercase();
            let relaxed = match upper.as_str() {
                "BRA" => Decided::RelaxedJmp,
                "BSR" => Decided::RelaxedJsr,
                _ => Decided::RelaxedCond,
            };
            debug!(
                mnemonic = %instr.mnemonic,
                addr = instr.addr,
                disp,
                "relaxing out-of-range branch"
            );
            instr.decided = Some(relaxed);
            changed = true;
        }
        self.items = items;
        changed
    }

    // ========================================================================
    // Stage 3: encoding
    // ========================================================================

    fn encode(&mut self) -> Result<Assembly, DiagnosticBundle> {
        let mut code: Vec<u8> = Vec::new();
        let mut fixups: Vec<u16> = Vec::new();
        let mut source_map = SourceMap::new();
        let mut listing_rows = Vec::new();
        let mut origin: Option<u16> = None;
        let mut pc: u16 = 0;

        let items = std::mem::take(&mut self.items);
        for item in &items {
            let code_start = code.len();
            let start_pc = pc;
            let pos = match item {
                Item::Label { .. } | Item::End { .. } => None,
                Item::Instr(i) => Some(i.pos.clone()),
                Item::Org { pos, .. }
                | Item::Equ { pos, .. }
                | Item::Data { pos, .. }
                | Item::Bytes { pos, .. }
                | Item::Reserve { pos, .. }
                | Item::Align { pos, .. } => Some(pos.clone()),
            };

            match item {
                Item::Label { .. } | Item::Equ { .. } | Item::End { .. } => {}
                Item::Org { addr, pos } => {
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc as i32,
                    };
                    match expr::eval_expr(addr, &ctx, pos) {
                        Ok(v) => {
                            pc = v as u16;
                            if origin.is_none() {
                                origin = Some(pc);
                            }
                        }
                        Err(diag) => self.diags.push(diag),
                    }
                }
                Item::Instr(instr) => {
                    self.encode_instr(instr, pc, &mut code, &mut fixups);
                    pc = pc.wrapping_add(instr.decided.map(|d| d.size()).unwrap_or(0));
                }
                Item::Data { width, values, pos } => {
                    for value in values {
                        let ctx = TableContext {
                            symbols: &self.symbols,
                            here: pc as i32,
                        };
                        match expr::eval_expr(value, &ctx, pos) {
                            Ok(v) => {
                                if *width == 1 {
                                    if !expr::value_fits_byte(v) {
                                        self.diags.error(
                                            DiagKind::Range,
                                            pos.clone(),
                                            format!("byte value out of range: {v}"),
                                        );
                                    }
                                    code.push(v as u8);
                                } else {
                                    // Address-bearing words in data take
                                    // part in relocation too.
                                    if self.options.relocatable
                                        && value.relocation_balance(&|n| {
                                            self.symbols
                                                .get(n)
                                                .map(|s| s.is_relocatable())
                                                .unwrap_or(false)
                                        }) != 0
                                    {
                                        fixups.push(code.len() as u16);
                                    }
                                    code.push((v as u16 >> 8) as u8);
                                    code.push(v as u8);
                                }
                                pc = pc.wrapping_add(*width as u16);
                            }
                            Err(diag) => self.diags.push(diag),
                        }
                    }
                }
                Item::Bytes { bytes, .. } => {
                    code.extend_from_slice(bytes);
                    pc = pc.wrapping_add(bytes.len() as u16);
                }
                Item::Reserve { count, fill, pos } => {
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc as i32,
                    };
                    let count_v = match expr::eval_expr(count, &ctx, pos) {
                        Ok(v) if v >= 0 => v,
                        Ok(_) => 0,
                        Err(diag) => {
                            self.diags.push(diag);
                            0
                        }
                    };
                    let fill_v = match fill {
                        Some(expr) => match self.eval_in(expr, pc as i32, pos) {
                            Ok(v) => v as u8,
                            Err(diag) => {
                                self.diags.push(diag);
                                0
                            }
                        },
                        None => 0,
                    };
                    code.extend(std::iter::repeat(fill_v).take(count_v as usize));
                    pc = pc.wrapping_add(count_v as u16);
                }
                Item::Align { boundary, pos } => {
                    let ctx = TableContext {
                        symbols: &self.symbols,
                        here: pc as i32,
                    };
                    match expr::eval_expr(boundary, &ctx, pos) {
                        Ok(b) if b > 0 => {
                            let b = b as u16;
                            while pc % b != 0 {
                                code.push(0);
                                pc = pc.wrapping_add(1);
                            }
                        }
                        Ok(_) => {}
                        Err(diag) => self.diags.push(diag),
                    }
                }
            }

            let emitted = &code[code_start..];
            if let Some(pos) = pos {
                if !emitted.is_empty() {
                    source_map.record(start_pc, emitted.len() as u16, pos.clone());
                    listing_rows.push(ListingRow {
                        addr: start_pc,
                        bytes: emitted.to_vec(),
                        pos: pos.clone(),
                        source: self.source_text_for(&pos),
                    });
                }
            }
        }
        self.items = items;

        if self.diags.has_errors() {
            return Err(std::mem::take(&mut self.diags).sorted());
        }

        let mut warnings = DiagnosticBundle::new();
        warnings.extend(std::mem::take(&mut self.diags));

        Ok(Assembly {
            code,
            origin: origin.unwrap_or(0),
            fixups,
            symbols: std::mem::take(&mut self.symbols),
            source_map,
            listing_rows,
            entry: self.entry.clone(),
            relocatable: self.options.relocatable,
            model: self.model,
            warnings,
        })
    }

    fn source_text_for(&self, pos: &SourcePos) -> String {
        self.source_lines
            .iter()
            .find(|(p, _)| p.file == pos.file && p.line == pos.line)
            .map(|(_, text)| text.clone())
            .unwrap_or_default()
    }

    fn encode_instr(
        &mut self,
        instr: &InstrItem,
        pc: u16,
        code: &mut Vec<u8>,
        fixups: &mut Vec<u16>,
    ) {
        let mnemonic = instr.mnemonic.as_str();
        let pos = &instr.pos;

        let Some(decided) = instr.decided else {
            self.diags.error(
                DiagKind::Instruction,
                pos.clone(),
                format!("internal: undecided mode for {mnemonic}"),
            );
            return;
        };

        macro_rules! entry_or_return {
            ($mode:expr) => {
                match opcodes::lookup(mnemonic, $mode) {
                    Some(entry) => entry,
                    None => {
                        let modes: Vec<String> = opcodes::valid_modes(mnemonic)
                            .iter()
                            .map(|m| m.to_string())
                            .collect();
                        self.diags.push(
                            Diagnostic::error(
                                DiagKind::Instruction,
                                pos.clone(),
                                format!("{mnemonic} does not support {} addressing", $mode),
                            )
                            .with_note(format!("valid modes: {}", modes.join(", "))),
                        );
                        return;
                    }
                }
            };
        }

        match decided {
            Decided::Inherent => {
                let entry = entry_or_return!(AddrMode::Inherent);
                code.push(entry.opcode);
            }
            Decided::Imm8 => {
                if opcodes::is_store(mnemonic) {
                    self.diags.error(
                        DiagKind::Instruction,
                        pos.clone(),
                        format!("{mnemonic} has no immediate form"),
                    );
                    return;
                }
                let entry = entry_or_return!(AddrMode::Immediate);
                let Operand::Immediate(expr) = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        if !expr::value_fits_byte(v) {
                            self.diags.error(
                                DiagKind::Range,
                                pos.clone(),
                                format!("immediate value out of byte range: {v}"),
                            );
                            return;
                        }
                        code.push(entry.opcode);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::Imm16 => {
                let entry = entry_or_return!(AddrMode::Immediate);
                let Operand::Immediate(expr) = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        code.push(entry.opcode);
                        if self.options.relocatable && self.balance_internal(expr) != 0 {
                            fixups.push(code.len() as u16);
                        }
                        code.push((v as u16 >> 8) as u8);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::Direct => {
                let entry = entry_or_return!(AddrMode::Direct);
                let Operand::Addr { expr, force } = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        if self.options.relocatable
                            && *force == Force::Direct
                            && self.balance_internal(expr) != 0
                        {
                            self.diags.push(
                                Diagnostic::error(
                                    DiagKind::Range,
                                    pos.clone(),
                                    "direct-mode reference to an internal label cannot be relocated",
                                )
                                .with_note("remove the < prefix or reference a fixed address"),
                            );
                            return;
                        }
                        if !(0..=0xFF).contains(&v) {
                            self.diags.error(
                                DiagKind::Range,
                                pos.clone(),
                                format!("direct address out of zero page: ${:04X}", v as u16),
                            );
                            return;
                        }
                        code.push(entry.opcode);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::Extended => {
                let entry = entry_or_return!(AddrMode::Extended);
                let Operand::Addr { expr, .. } = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        code.push(entry.opcode);
                        if self.options.relocatable && self.balance_internal(expr) != 0 {
                            fixups.push(code.len() as u16);
                        }
                        code.push((v as u16 >> 8) as u8);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::Indexed => {
                let entry = entry_or_return!(AddrMode::Indexed);
                let Operand::Indexed(expr) = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        if !(-128..=255).contains(&v) {
                            self.diags.error(
                                DiagKind::Range,
                                pos.clone(),
                                format!("indexed offset out of range (-128 to 255): {v}"),
                            );
                            return;
                        }
                        code.push(entry.opcode);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::Relative => {
                let entry = entry_or_return!(AddrMode::Relative);
                let Operand::Addr { expr, .. } = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(target) => {
                        let disp = (target as u16 as i32) - (pc as i32 + 2);
                        if !(-128..=127).contains(&disp) {
                            // Sizing should have relaxed this; reaching
                            // here means the target moved out of range
                            // beyond what relaxation could absorb.
                            self.diags.error(
                                DiagKind::Range,
                                pos.clone(),
                                format!("branch target out of range: {disp} bytes"),
                            );
                            return;
                        }
                        code.push(entry.opcode);
                        code.push(disp as i8 as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::RelaxedJmp | Decided::RelaxedJsr => {
                let jump = if decided == Decided::RelaxedJmp {
                    "JMP"
                } else {
                    "JSR"
                };
                let entry = opcodes::lookup(jump, AddrMode::Extended).expect("JMP/JSR extended");
                let Operand::Addr { expr, .. } = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        code.push(entry.opcode);
                        if self.options.relocatable && self.balance_internal(expr) != 0 {
                            fixups.push(code.len() as u16);
                        }
                        code.push((v as u16 >> 8) as u8);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::RelaxedCond => {
                let inverse = opcodes::inverted_branch(mnemonic)
                    .expect("conditional branch has an inverse");
                let inv_entry =
                    opcodes::lookup(inverse, AddrMode::Relative).expect("inverse branch entry");
                let jmp_entry = opcodes::lookup("JMP", AddrMode::Extended).expect("JMP extended");
                let Operand::Addr { expr, .. } = &instr.operand else {
                    return;
                };
                match self.eval_in(expr, pc as i32, pos) {
                    Ok(v) => {
                        // Inverted branch skips the 3-byte JMP.
                        code.push(inv_entry.opcode);
                        code.push(3);
                        code.push(jmp_entry.opcode);
                        if self.options.relocatable && self.balance_internal(expr) != 0 {
                            fixups.push(code.len() as u16);
                        }
                        code.push((v as u16 >> 8) as u8);
                        code.push(v as u8);
                    }
                    Err(diag) => self.diags.push(diag),
                }
            }
            Decided::BitDirect | Decided::BitIndexed => {
                let mode = if decided == Decided::BitDirect {
                    AddrMode::Direct
                } else {
                    AddrMode::Indexed
                };
                let entry = entry_or_return!(mode);
                let (mask, operand) = match &instr.operand {
                    Operand::BitOpDirect { mask, addr } => (mask, addr),
                    Operand::BitOpIndexed { mask, offset } => (mask, offset),
                    _ => return,
                };
                let mask_v = match self.eval_in(mask, pc as i32, pos) {
                    Ok(v) => v,
                    Err(diag) => {
                        self.diags.push(diag);
                        return;
                    }
                };
                let operand_v = match self.eval_in(operand, pc as i32, pos) {
                    Ok(v) => v,
                    Err(diag) => {
                        self.diags.push(diag);
                        return;
                    }
                };
                if !expr::value_fits_byte(mask_v) {
                    self.diags.error(
                        DiagKind::Range,
                        pos.clone(),
                        format!("bit mask out of byte range: {mask_v}"),
                    );
                    return;
                }
                if !(0..=0xFF).contains(&operand_v) {
                    self.diags.error(
                        DiagKind::Range,
                        pos.clone(),
                        format!("operand out of byte range: {operand_v}"),
                    );
                    return;
                }
                code.push(entry.opcode);
                code.push(mask_v as u8);
                code.push(operand_v as u8);
            }
        }
    }
}

fn strip_cond_directive(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix('#')?;
    let word = rest
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match word.as_str() {
        "IF" | "IFDEF" | "IFNDEF" | "ELIF" | "ELSE" | "ENDIF" => Some(rest),
        _ => None,
    }
}

/// Replace `\1`..`\9` in a macro body line with the call arguments.
fn substitute_params(line: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&d) = chars.peek() {
                if let Some(idx) = d.to_digit(10) {
                    if idx >= 1 {
                        chars.next();
                        if let Some(arg) = args.get(idx as usize - 1) {
                            out.push_str(arg);
                        }
                        continue;
                    }
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(source: &str) -> Assembly {
        assemble(source, "<input>", &AsmOptions::default()).expect("assembly should succeed")
    }

    fn asm_opts(source: &str, options: &AsmOptions) -> Assembly {
        assemble(source, "<input>", options).expect("assembly should succeed")
    }

    fn asm_err(source: &str) -> DiagnosticBundle {
        assemble(source, "<input>", &AsmOptions::default()).expect_err("assembly should fail")
    }

    #[test]
    fn encodes_basic_program() {
        let out = asm("start: LDAA #$41\n STAA $80\n RTS\n");
        assert_eq!(out.code, vec![0x86, 0x41, 0x97, 0x80, 0x39]);
        assert_eq!(out.symbols.get("START").unwrap().value, 0);
    }

    #[test]
    fn org_sets_origin_and_label_values() {
        let out = asm(" ORG $2000\nentry: JMP entry\n");
        assert_eq!(out.origin, 0x2000);
        assert_eq!(out.code, vec![0x7E, 0x20, 0x00]);
    }

    #[test]
    fn direct_vs_extended_selection() {
        let out = asm(" LDAA $40\n LDAA $1234\n");
        assert_eq!(out.code, vec![0x96, 0x40, 0xB6, 0x12, 0x34]);
    }

    #[test]
    fn force_prefixes_override_selection() {
        let out = asm(" LDAA <$40\n LDAA >$40\n");
        assert_eq!(out.code, vec![0x96, 0x40, 0xB6, 0x00, 0x40]);
    }

    #[test]
    fn forward_reference_defaults_to_extended() {
        // later is at $05 which would fit direct, but pass 1 cannot know.
        let out = asm(" LDAA later\n RTS\n RTS\nlater: FCB 7\n");
        assert_eq!(out.code[0], 0xB6);
    }

    #[test]
    fn word_immediate_and_byte_immediate() {
        let out = asm(" LDX #$1234\n LDAB #9\n");
        assert_eq!(out.code, vec![0xCE, 0x12, 0x34, 0xC6, 0x09]);
    }

    #[test]
    fn branch_within_range_encodes_short() {
        let out = asm("top: NOP\n BRA top\n");
        assert_eq!(out.code, vec![0x01, 0x20, 0xFD]);
    }

    #[test]
    fn branch_out_of_range_relaxes_conditional() {
        let mut source = String::from(" BEQ far\n");
        for _ in 0..70 {
            source.push_str(" NOP\n NOP\n");
        }
        source.push_str("far: RTS\n");
        let out = asm(&source);
        // BNE +3 over JMP far
        assert_eq!(out.code[0], 0x26);
        assert_eq!(out.code[1], 3);
        assert_eq!(out.code[2], 0x7E);
        let target = ((out.code[3] as u16) << 8) | out.code[4] as u16;
        assert_eq!(target, 145); // 5 + 140 NOPs
    }

    #[test]
    fn bsr_out_of_range_relaxes_to_jsr() {
        let mut source = String::from(" BSR far\n");
        for _ in 0..70 {
            source.push_str(" NOP\n NOP\n");
        }
        source.push_str("far: RTS\n");
        let out = asm(&source);
        assert_eq!(out.code[0], 0xBD);
    }

    #[test]
    fn branch_at_exact_negative_limit_stays_short() {
        // Displacement of exactly -128 from the following byte.
        let mut source = String::from("top: NOP\n");
        for _ in 0..125 {
            source.push_str(" NOP\n");
        }
        source.push_str(" BRA top\n");
        let out = asm(&source);
        let n = out.code.len();
        assert_eq!(out.code[n - 2..], [0x20, 0x80]);
    }

    #[test]
    fn local_labels_scope_to_global() {
        let out = asm(
            "first: LDAA #1\n.loop: DECA\n BNE .loop\nsecond: LDAA #2\n.loop: DECA\n BNE .loop\n RTS\n",
        );
        assert!(out.symbols.get("FIRST.LOOP").is_some());
        assert!(out.symbols.get("SECOND.LOOP").is_some());
    }

    #[test]
    fn equ_and_set_semantics() {
        let out = asm("WIDTH EQU 16\nCOUNT SET 1\nCOUNT SET COUNT+1\n FCB WIDTH, COUNT\n");
        assert_eq!(out.code, vec![16, 2]);
        let err = asm_err("W EQU 1\nW EQU 2\n");
        assert!(err.to_string().contains("duplicate symbol"));
    }

    #[test]
    fn data_directives() {
        let out = asm(" FCB 1,2,$FF\n FDB $1234\n FCC \"AB\"\n RMB 3\n FILL $AA,2\n");
        assert_eq!(
            out.code,
            vec![1, 2, 0xFF, 0x12, 0x34, b'A', b'B', 0, 0, 0, 0xAA, 0xAA]
        );
    }

    #[test]
    fn align_pads_to_boundary() {
        let out = asm(" FCB 1\n ALIGN 4\n FCB 2\n");
        assert_eq!(out.code, vec![1, 0, 0, 0, 2]);
    }

    #[test]
    fn conditional_assembly() {
        let out = asm("FLAG EQU 1\n#IF FLAG\n FCB 1\n#ELSE\n FCB 2\n#ENDIF\n");
        assert_eq!(out.code, vec![1]);
        let out = asm("#IFDEF NOPE\n FCB 1\n#ELSE\n FCB 2\n#ENDIF\n");
        assert_eq!(out.code, vec![2]);
    }

    #[test]
    fn unterminated_conditional_is_fatal() {
        let err = asm_err("#IFDEF X\n FCB 1\n");
        assert!(err.to_string().contains("unterminated conditional"));
    }

    #[test]
    fn macro_expansion_with_params() {
        let out = asm("EMIT MACRO\n FCB \\1\n FCB \\1+1\n ENDM\n EMIT 5\n EMIT 9\n");
        assert_eq!(out.code, vec![5, 6, 9, 10]);
    }

    #[test]
    fn macro_recursion_is_bounded() {
        let err = asm_err("LOOPY MACRO\n LOOPY\n ENDM\n LOOPY\n");
        assert!(err.to_string().contains("recursion depth"));
    }

    #[test]
    fn undefined_symbol_is_fatal() {
        let err = asm_err(" JMP nowhere\n");
        assert!(err.to_string().contains("undefined symbol"));
    }

    #[test]
    fn duplicate_label_is_fatal() {
        let err = asm_err("a: NOP\na: NOP\n");
        assert!(err.to_string().contains("duplicate label"));
    }

    #[test]
    fn indexed_offset_range() {
        let out = asm(" LDAA 255,X\n");
        assert_eq!(out.code, vec![0xA6, 0xFF]);
        let err = asm_err(" LDAA 256,X\n");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn bit_manip_encoding() {
        let out = asm(" AIM #$7F,$20\n OIM #$01,5,X\n");
        assert_eq!(out.code, vec![0x71, 0x7F, 0x20, 0x62, 0x01, 0x05]);
    }

    #[test]
    fn relocatable_records_fixups() {
        let options = AsmOptions {
            relocatable: true,
            ..AsmOptions::default()
        };
        let out = asm_opts(
            " JSR sub1\n JSR sub2\n RTS\nsub1: RTS\nsub2: RTS\nmsg: FDB sub1\n",
            &options,
        );
        // Two JSR operands plus the FDB word.
        assert_eq!(out.fixups, vec![1, 4, 9]);
    }

    #[test]
    fn relocatable_forces_extended_for_internal_refs() {
        let options = AsmOptions {
            relocatable: true,
            ..AsmOptions::default()
        };
        // sub sits in the zero page but must still be extended.
        let out = asm_opts("sub: RTS\n JSR sub\n", &options);
        assert_eq!(out.code[1], 0xBD);
    }

    #[test]
    fn relocatable_rejects_forced_direct_internal() {
        let options = AsmOptions {
            relocatable: true,
            ..AsmOptions::default()
        };
        let err = assemble("sub: RTS\n JSR <sub\n", "<input>", &options)
            .expect_err("forced direct internal must fail");
        assert!(err.to_string().contains("cannot be relocated"));
    }

    #[test]
    fn external_equates_do_not_enter_fixups() {
        let options = AsmOptions {
            relocatable: true,
            defines: vec![("UT_DISP".to_string(), 0x8FC4)],
            ..AsmOptions::default()
        };
        let out = asm_opts(" JSR UT_DISP\n RTS\n", &options);
        assert!(out.fixups.is_empty());
    }

    #[test]
    fn model_symbols_are_predefined() {
        let out = asm(" FCB DISP_ROWS, DISP_COLS\n");
        assert_eq!(out.code, vec![2, 16]);
    }

    #[test]
    fn final_size_matches_emitted_bytes() {
        let out = asm("s: LDAA #1\n LDX #s\n BNE s\n JSR s\n RTS\n");
        let total: usize = out.listing_rows.iter().map(|r| r.bytes.len()).sum();
        assert_eq!(total, out.code.len());
    }
}
