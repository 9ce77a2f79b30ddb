// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Multi-file compilation and cross-file checking.
//!
//! Exactly one C unit defines `main`; it compiles with the entry point
//! and runtime, every other unit in library mode. The intermediate
//! assembly is concatenated deterministically: library units first, then
//! raw assembly sources, then the main unit. Before any assembly runs,
//! extern declarations are checked against their definitions across
//! units (array-to-pointer decay applies), and mismatches report both
//! positions.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::cc::ast::{Declaration, Program};
use crate::cc::codegen::{self, CodegenOptions};
use crate::cc::parser;
use crate::cc::preprocessor;
use crate::cc::types::{types_match, CType};
use crate::core::diag::{DiagKind, Diagnostic, DiagnosticBundle, SourcePos};
use crate::models::Model;

/// One input to a build: C source or already-written assembly.
#[derive(Debug, Clone)]
pub enum UnitSource {
    C { file: String, text: String },
    Asm { file: String, text: String },
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub model: Model,
    pub include_paths: Vec<PathBuf>,
    pub defines: Vec<(String, String)>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            model: crate::models::DEFAULT_MODEL,
            include_paths: Vec::new(),
            defines: Vec::new(),
        }
    }
}

struct ParsedUnit {
    file: String,
    program: Program,
    structs: crate::cc::types::StructTable,
    has_main: bool,
}

#[derive(Clone)]
struct SeenFn {
    file: String,
    pos: SourcePos,
    return_type: CType,
    params: Vec<CType>,
    defined: bool,
}

#[derive(Clone)]
struct SeenVar {
    pos: SourcePos,
    ty: CType,
    defined: bool,
}

/// Compile one or more sources into a single assembly stream.
pub fn compile_units(
    units: &[UnitSource],
    options: &CompileOptions,
) -> Result<String, DiagnosticBundle> {
    let mut diags = DiagnosticBundle::new();
    let mut parsed: Vec<ParsedUnit> = Vec::new();
    let mut asm_units: Vec<(String, String)> = Vec::new();

    for unit in units {
        match unit {
            UnitSource::Asm { file, text } => {
                asm_units.push((file.clone(), text.clone()));
            }
            UnitSource::C { file, text } => {
                let (lines, _features) = match preprocessor::preprocess(
                    text,
                    file,
                    options.model,
                    &options.include_paths,
                    &options.defines,
                ) {
                    Ok(result) => result,
                    Err(bundle) => {
                        diags.extend(bundle);
                        continue;
                    }
                };
                let output = match parser::parse(&lines) {
                    Ok(output) => output,
                    Err(bundle) => {
                        diags.extend(bundle);
                        continue;
                    }
                };
                let has_main = output.program.declarations.iter().any(|d| {
                    matches!(d, Declaration::Function(f) if f.name == "main" && f.body.is_some())
                });
                parsed.push(ParsedUnit {
                    file: file.clone(),
                    program: output.program,
                    structs: output.structs,
                    has_main,
                });
            }
        }
    }

    if diags.has_errors() {
        return Err(diags.sorted());
    }

    // Exactly one main across the C units.
    let main_units: Vec<&ParsedUnit> = parsed.iter().filter(|u| u.has_main).collect();
    match main_units.len() {
        0 => {
            diags.error(
                DiagKind::Link,
                SourcePos::new("<build>", 0, 0),
                "no source file defines main",
            );
        }
        1 => {}
        _ => {
            for unit in &main_units[1..] {
                let first = main_pos(main_units[0]);
                diags.push(
                    Diagnostic::error(DiagKind::Link, main_pos(unit), "multiple definitions of main")
                        .with_related(first),
                );
            }
        }
    }

    check_cross_file(&parsed, &mut diags);

    if diags.has_errors() {
        return Err(diags.sorted());
    }

    // Deterministic order: library units, assembly sources, main last.
    let mut pieces: Vec<String> = Vec::new();
    let multi = parsed.len() + asm_units.len() > 1;
    if multi {
        // The image executes from offset 0, but the main unit sits at
        // the end of the concatenation; a glue jump bridges the gap.
        pieces.push("        JMP     _entry\n".to_string());
    }

    for (index, unit) in parsed.iter().filter(|u| !u.has_main).enumerate() {
        debug!(file = %unit.file, "compiling library unit");
        let asm = codegen::generate(
            &unit.program,
            unit.structs.clone(),
            &CodegenOptions {
                model: options.model,
                emit_runtime: false,
                unit_tag: format!("u{index}_"),
            },
        )?;
        pieces.push(format!("; ===== {} (library) =====\n{asm}", unit.file));
    }
    for (file, text) in &asm_units {
        pieces.push(format!("; ===== {file} (assembly) =====\n{text}"));
    }
    for unit in parsed.iter().filter(|u| u.has_main) {
        debug!(file = %unit.file, "compiling main unit");
        let asm = codegen::generate(
            &unit.program,
            unit.structs.clone(),
            &CodegenOptions {
                model: options.model,
                emit_runtime: true,
                unit_tag: String::new(),
            },
        )?;
        pieces.push(format!("; ===== {} (main) =====\n{asm}", unit.file));
    }

    Ok(pieces.join("\n"))
}

fn main_pos(unit: &ParsedUnit) -> SourcePos {
    unit.program
        .declarations
        .iter()
        .find_map(|d| match d {
            Declaration::Function(f) if f.name == "main" && f.body.is_some() => {
                Some(f.pos.clone())
            }
            _ => None,
        })
        .unwrap_or_else(|| SourcePos::new(&unit.file, 0, 0))
}

/// Validate extern declarations against definitions across every unit.
fn check_cross_file(units: &[ParsedUnit], diags: &mut DiagnosticBundle) {
    let mut functions: HashMap<String, SeenFn> = HashMap::new();
    let mut variables: HashMap<String, SeenVar> = HashMap::new();

    for unit in units {
        for decl in &unit.program.declarations {
            match decl {
                Declaration::Function(f) => {
                    let params: Vec<CType> =
                        f.params.iter().map(|p| p.param_type.clone()).collect();
                    if let Some(seen) = functions.get(&f.name) {
                        let compatible = types_match(&seen.return_type, &f.return_type)
                            && seen.params.len() == params.len()
                            && seen
                                .params
                                .iter()
                                .zip(&params)
                                .all(|(a, b)| types_match(a, b));
                        if !compatible {
                            diags.push(
                                Diagnostic::error(
                                    DiagKind::Link,
                                    f.pos.clone(),
                                    format!(
                                        "{} declared with a conflicting signature (earlier in {})",
                                        f.name, seen.file
                                    ),
                                )
                                .with_related(seen.pos.clone()),
                            );
                            continue;
                        }
                        if f.body.is_some() && seen.defined {
                            diags.push(
                                Diagnostic::error(
                                    DiagKind::Link,
                                    f.pos.clone(),
                                    format!("{} is defined in more than one unit", f.name),
                                )
                                .with_related(seen.pos.clone()),
                            );
                            continue;
                        }
                    }
                    let replace = functions
                        .get(&f.name)
                        .map(|seen| f.body.is_some() && !seen.defined)
                        .unwrap_or(true);
                    if replace {
                        functions.insert(
                            f.name.clone(),
                            SeenFn {
                                file: unit.file.clone(),
                                pos: f.pos.clone(),
                                return_type: f.return_type.clone(),
                                params,
                                defined: f.body.is_some(),
                            },
                        );
                    }
                }
                Declaration::Variable(v) => {
                    if let Some(seen) = variables.get(&v.name) {
                        if !types_match(&seen.ty, &v.var_type) {
                            diags.push(
                                Diagnostic::error(
                                    DiagKind::Link,
                                    v.pos.clone(),
                                    format!("{} declared with a conflicting type", v.name),
                                )
                                .with_related(seen.pos.clone()),
                            );
                            continue;
                        }
                        if !v.is_extern && seen.defined {
                            diags.push(
                                Diagnostic::error(
                                    DiagKind::Link,
                                    v.pos.clone(),
                                    format!("{} is defined in more than one unit", v.name),
                                )
                                .with_related(seen.pos.clone()),
                            );
                            continue;
                        }
                    }
                    let replace = variables
                        .get(&v.name)
                        .map(|seen| !v.is_extern && !seen.defined)
                        .unwrap_or(true);
                    if replace {
                        variables.insert(
                            v.name.clone(),
                            SeenVar {
                                pos: v.pos.clone(),
                                ty: v.var_type.clone(),
                                defined: !v.is_extern,
                            },
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c_unit(file: &str, text: &str) -> UnitSource {
        UnitSource::C {
            file: file.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn single_unit_compiles_with_entry() {
        let asm = compile_units(
            &[c_unit("main.c", "void main() { int x; x = 1; }")],
            &CompileOptions::default(),
        )
        .unwrap();
        assert!(asm.contains("_entry:"));
        assert!(asm.contains("_main:"));
        assert!(asm.contains("__mul16:"));
    }

    #[test]
    fn library_unit_has_no_runtime_or_entry() {
        let asm = compile_units(
            &[
                c_unit("util.c", "int twice(int n) { return n + n; }"),
                c_unit("main.c", "int twice(int n);\nvoid main() { twice(2); }"),
            ],
            &CompileOptions::default(),
        )
        .unwrap();
        // Library first, glue jump at the very top, main (with runtime) last.
        let lib_at = asm.find("_twice:").unwrap();
        let main_at = asm.find("_main:").unwrap();
        assert!(lib_at < main_at);
        assert!(asm.trim_start().starts_with("JMP"));
        assert_eq!(asm.matches("__mul16:").count(), 1);
    }

    #[test]
    fn missing_main_is_a_link_error() {
        let err = compile_units(
            &[c_unit("util.c", "int one() { return 1; }")],
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no source file defines main"));
    }

    #[test]
    fn multiple_mains_report_both_positions() {
        let err = compile_units(
            &[
                c_unit("a.c", "void main() { }"),
                c_unit("b.c", "void main() { }"),
            ],
            &CompileOptions::default(),
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("multiple definitions of main"));
        assert!(text.contains("a.c"));
        assert!(text.contains("b.c"));
    }

    #[test]
    fn extern_mismatch_reports_both_positions() {
        let err = compile_units(
            &[
                c_unit("util.c", "int value(int n) { return n; }"),
                c_unit(
                    "main.c",
                    "char value(int n);\nvoid main() { value(1); }",
                ),
            ],
            &CompileOptions::default(),
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("conflicting signature"));
        assert!(text.contains("util.c"));
    }

    #[test]
    fn array_decay_makes_signatures_compatible() {
        let asm = compile_units(
            &[
                c_unit("util.c", "int first(char *buf) { return buf[0]; }"),
                c_unit(
                    "main.c",
                    "int first(char buf[]);\nvoid main() { char b[4]; first(b); }",
                ),
            ],
            &CompileOptions::default(),
        );
        assert!(asm.is_ok(), "{asm:?}");
    }

    #[test]
    fn asm_units_sit_between_libraries_and_main() {
        let asm = compile_units(
            &[
                c_unit("main.c", "void helper();\nvoid main() { helper(); }"),
                UnitSource::Asm {
                    file: "helper.asm".to_string(),
                    text: "_helper: RTS\n".to_string(),
                },
            ],
            &CompileOptions::default(),
        )
        .unwrap();
        let asm_at = asm.find("_helper:").unwrap();
        let main_at = asm.find("_main:").unwrap();
        assert!(asm_at < main_at);
    }

    #[test]
    fn conflicting_global_types_fail() {
        let err = compile_units(
            &[
                c_unit("a.c", "int shared;\nvoid main() { shared = 1; }"),
                c_unit("b.c", "extern char shared;\nint get() { return 0; }"),
            ],
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting type"));
    }
}
