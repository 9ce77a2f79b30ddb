// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Build driver: the thin sequencer the command-line front-ends call.
//!
//! Each phase returns its result or a diagnostics bundle; the driver
//! stops at the first phase that produced fatal diagnostics and never
//! rewrites messages on the way through.

use std::path::PathBuf;

use tracing::info_span;

use crate::asm::assembler::{self, AsmOptions, Assembly};
use crate::asm::debuginfo;
use crate::asm::listing;
use crate::asm::output::{self, OutputForm};
use crate::cc::linkcheck::{self, CompileOptions, UnitSource};
use crate::core::diag::{Diagnostic, DiagnosticBundle};
use crate::models::Model;
use crate::opk::builder::PackBuilder;
use crate::opk::reader::{self, DirectoryEntry};
use crate::opk::records::{PackRecord, PackType};

/// Compile one or more C sources (plus optional assembly sources) into
/// assembler input text.
pub fn compile_c(
    units: &[UnitSource],
    model: Model,
    include_paths: &[PathBuf],
    defines: &[(String, String)],
) -> Result<String, DiagnosticBundle> {
    let _span = info_span!("compile_c", units = units.len()).entered();
    linkcheck::compile_units(
        units,
        &CompileOptions {
            model,
            include_paths: include_paths.to_vec(),
            defines: defines.to_vec(),
        },
    )
}

/// Assembler output plus optional sidecar text.
pub struct AssembleResult {
    pub assembly: Assembly,
    pub object: Vec<u8>,
    pub listing: Option<String>,
    pub debug: Option<String>,
}

/// Assemble source text into the requested output form.
pub fn assemble(
    source: &str,
    file: &str,
    options: &AsmOptions,
    form: OutputForm,
) -> Result<AssembleResult, DiagnosticBundle> {
    let _span = info_span!("assemble", file).entered();
    let assembly = assembler::assemble(source, file, options)?;
    let object = output::render(&assembly, form);
    let listing = options
        .want_listing
        .then(|| listing::render_listing(&assembly, file));
    let debug = options.want_debug.then(|| debuginfo::render_sidecar(&assembly));
    Ok(AssembleResult {
        assembly,
        object,
        listing,
        debug,
    })
}

/// Build a pack image from named object-form payloads.
pub fn pack_create(
    records: &[(String, Vec<u8>)],
    size_kb: u32,
    pack_type: PackType,
) -> Result<Vec<u8>, Diagnostic> {
    let mut builder = PackBuilder::new(size_kb, pack_type)?;
    for (name, payload) in records {
        // Object-form payloads carry the OB3 header; raw payloads go in
        // as they are.
        if payload.starts_with(crate::asm::output::OB3_MAGIC) {
            builder.add_object(name, payload)?;
        } else {
            builder.add_procedure(name, payload.clone(), Vec::new())?;
        }
    }
    builder.build()
}

pub fn pack_inspect(pack_bytes: &[u8]) -> Result<Vec<DirectoryEntry>, Diagnostic> {
    Ok(reader::parse_pack(pack_bytes)?.directory())
}

pub fn pack_extract(pack_bytes: &[u8], record_name: &str) -> Result<Vec<u8>, Diagnostic> {
    let image = reader::parse_pack(pack_bytes)?;
    match image.find(record_name) {
        Some(record) => Ok(record.payload()),
        None => Err(Diagnostic::error(
            crate::core::diag::DiagKind::Pack,
            crate::core::diag::SourcePos::new("<pack>", 0, 0),
            format!("no record named {record_name}"),
        )),
    }
}

/// Payload of the first procedure record, skipping the MAIN stub. This
/// is what gets injected into the emulator for a headless run.
pub fn pack_first_procedure(pack_bytes: &[u8]) -> Result<Vec<u8>, Diagnostic> {
    let image = reader::parse_pack(pack_bytes)?;
    image
        .records
        .iter()
        .find_map(|record| match record {
            PackRecord::Procedure { object_code, .. } if !object_code.is_empty() => {
                Some(object_code.clone())
            }
            _ => None,
        })
        .ok_or_else(|| {
            Diagnostic::error(
                crate::core::diag::DiagKind::Pack,
                crate::core::diag::SourcePos::new("<pack>", 0, 0),
                "pack holds no procedure records",
            )
        })
}

/// Whole pipeline: C (and assembly) sources to a pack image.
pub fn build_pack(
    units: &[UnitSource],
    record_name: &str,
    model: Model,
    relocatable: bool,
    size_kb: u32,
    include_paths: &[PathBuf],
) -> Result<Vec<u8>, DiagnosticBundle> {
    let asm_text = compile_c(units, model, include_paths, &[])?;
    let asm_options = AsmOptions {
        model,
        relocatable,
        ..AsmOptions::default()
    };
    let result = assemble(&asm_text, "<generated>", &asm_options, OutputForm::Object)?;
    let pack = pack_create(
        &[(record_name.to_string(), result.object)],
        size_kb,
        PackType::Datapak,
    )
    .map_err(|diag| {
        let mut bundle = DiagnosticBundle::new();
        bundle.push(diag);
        bundle
    })?;
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_MODEL;

    fn c_unit(text: &str) -> UnitSource {
        UnitSource::C {
            file: "main.c".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn c_source_assembles_end_to_end() {
        let asm_text = compile_c(
            &[c_unit("void main() { int x; x = 2 + 3; }")],
            DEFAULT_MODEL,
            &[],
            &[],
        )
        .unwrap();
        let result = assemble(
            &asm_text,
            "<generated>",
            &AsmOptions::default(),
            OutputForm::Raw,
        )
        .unwrap();
        assert!(!result.object.is_empty());
    }

    #[test]
    fn pack_round_trip_through_driver() {
        let pack = build_pack(
            &[c_unit("void main() { }")],
            "HELLO",
            DEFAULT_MODEL,
            false,
            16,
            &[],
        )
        .unwrap();
        let directory = pack_inspect(&pack).unwrap();
        assert!(directory.iter().any(|e| e.name == "HELLO"));
        let payload = pack_extract(&pack, "HELLO").unwrap();
        assert!(!payload.is_empty());
    }

    #[test]
    fn driver_stops_at_first_failing_phase() {
        let err = build_pack(
            &[c_unit("void main() { undeclared(); }")],
            "BAD",
            DEFAULT_MODEL,
            false,
            16,
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("undeclared"));
    }
}
