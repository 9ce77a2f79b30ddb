// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Assembler output forms.
//!
//! One form per invocation: the OB3 object (header plus an OPL procedure
//! wrapper, ready for packing), a raw binary, or the bare procedure
//! wrapper used for on-device OPL wrapping.

use crate::asm::assembler::Assembly;
use crate::asm::reloc;
use crate::core::diag::{DiagKind, Diagnostic, SourcePos};
use crate::models::Model;

/// Mutually exclusive output selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputForm {
    /// OB3 object: magic, lengths, OPL wrapper, machine code.
    Object,
    /// Bytes only, no header, no relocation.
    Raw,
    /// The OPL procedure wrapper without the OB3 header.
    Proc,
}

pub const OB3_MAGIC: &[u8; 3] = b"ORG";
const OB3_FILE_TYPE: u8 = 0x83;

/// QCode STOP: halts OPL; a 2-line machine hitting a 4-line procedure
/// executes this first and exits cleanly.
const QCODE_STOP: u8 = 0x59;
/// QCode SIN: paired with STOP it marks the procedure 4-line native.
const QCODE_SIN: u8 = 0xB2;

/// Bootstrap QCode: compute the embedded machine code address from the
/// RTA system variable and invoke it through USR.
const QCODE_BOOTSTRAP: [u8; 14] = [
    0x22, 0x00, 0xA9, // push $00A9 (RTA)
    0x9C, // PEEKW: procedure base
    0x22, 0x00, 0x0B, // push offset to the machine code
    0x2D, // subtract
    0x22, 0x00, 0x00, // push USR parameter 0
    0x9F, // USR
    0x86, 0x79, // return
];

/// An OB3 object file: wrapped machine code plus optional source text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ob3File {
    pub object_code: Vec<u8>,
    pub source_code: Vec<u8>,
}

impl Ob3File {
    /// Wrap machine code in the OPL procedure structure so the device
    /// can run it: header words, empty tables, the bootstrap QCode and
    /// the code itself. Four-line targets get the STOP+SIN prefix.
    pub fn from_machine_code(machine_code: &[u8], model: Model) -> Self {
        let four_line = model.is_four_line();
        let prefix_len = if four_line { 2 } else { 0 };
        let qcode_len = prefix_len + QCODE_BOOTSTRAP.len() + machine_code.len();

        let mut obj = Vec::with_capacity(13 + qcode_len);
        obj.extend_from_slice(&2u16.to_be_bytes()); // variable space
        obj.extend_from_slice(&(qcode_len as u16).to_be_bytes());
        obj.push(0); // parameter count
        obj.extend_from_slice(&[0; 8]); // empty tables
        if four_line {
            obj.push(QCODE_STOP);
            obj.push(QCODE_SIN);
        }
        obj.extend_from_slice(&QCODE_BOOTSTRAP);
        obj.extend_from_slice(machine_code);

        Self {
            object_code: obj,
            source_code: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let obj_len = self.object_code.len();
        let src_len = self.source_code.len();
        let data_len = 2 + obj_len + 2 + src_len;

        let mut out = Vec::with_capacity(6 + data_len);
        out.extend_from_slice(OB3_MAGIC);
        out.extend_from_slice(&(data_len as u16).to_be_bytes());
        out.push(OB3_FILE_TYPE);
        out.extend_from_slice(&(obj_len as u16).to_be_bytes());
        out.extend_from_slice(&self.object_code);
        out.extend_from_slice(&(src_len as u16).to_be_bytes());
        out.extend_from_slice(&self.source_code);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Diagnostic> {
        let err = |msg: &str| {
            Diagnostic::error(DiagKind::Pack, SourcePos::new("<ob3>", 0, 0), msg.to_string())
        };
        if data.len() < 8 {
            return Err(err("OB3 file too short"));
        }
        if &data[0..3] != OB3_MAGIC {
            return Err(err("bad OB3 magic"));
        }
        if data[5] != OB3_FILE_TYPE {
            return Err(err("OB3 file type is not a procedure"));
        }
        let obj_len = u16::from_be_bytes([data[6], data[7]]) as usize;
        if data.len() < 8 + obj_len {
            return Err(err("OB3 file truncated"));
        }
        let object_code = data[8..8 + obj_len].to_vec();

        let src_offset = 8 + obj_len;
        let mut source_code = Vec::new();
        if data.len() >= src_offset + 2 {
            let src_len =
                u16::from_be_bytes([data[src_offset], data[src_offset + 1]]) as usize;
            if src_len > 0 && data.len() >= src_offset + 2 + src_len {
                source_code = data[src_offset + 2..src_offset + 2 + src_len].to_vec();
            }
        }

        Ok(Self {
            object_code,
            source_code,
        })
    }
}

/// The machine code of an assembly: relocatable assemblies get the stub
/// and fixup table wrapped around them.
pub fn machine_code(assembly: &Assembly) -> Vec<u8> {
    if assembly.relocatable {
        reloc::wrap_relocatable(assembly)
    } else {
        assembly.code.clone()
    }
}

/// Render the assembly in the requested output form.
pub fn render(assembly: &Assembly, form: OutputForm) -> Vec<u8> {
    let code = machine_code(assembly);
    match form {
        OutputForm::Raw => code,
        OutputForm::Proc => Ob3File::from_machine_code(&code, assembly.model).object_code,
        OutputForm::Object => Ob3File::from_machine_code(&code, assembly.model).to_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assembler::{assemble, AsmOptions};
    use crate::models::{MODEL_LZ, MODEL_XP};

    fn asm(source: &str) -> Assembly {
        assemble(source, "<input>", &AsmOptions::default()).unwrap()
    }

    #[test]
    fn raw_form_is_bare_bytes() {
        let out = render(&asm(" LDAA #1\n RTS\n"), OutputForm::Raw);
        assert_eq!(out, vec![0x86, 0x01, 0x39]);
    }

    #[test]
    fn ob3_header_lengths_are_consistent() {
        let out = render(&asm(" RTS\n"), OutputForm::Object);
        assert_eq!(&out[0..3], b"ORG");
        let data_len = u16::from_be_bytes([out[3], out[4]]) as usize;
        // data_len covers obj_len word, object, src_len word, source;
        // the magic, length word and type byte sit outside it.
        assert_eq!(data_len + 6, out.len());
        let parsed = Ob3File::from_bytes(&out).unwrap();
        let obj_len = u16::from_be_bytes([out[6], out[7]]) as usize;
        assert_eq!(parsed.object_code.len(), obj_len);
    }

    #[test]
    fn two_line_wrapper_has_no_stop_sin() {
        let ob3 = Ob3File::from_machine_code(&[0x39], MODEL_XP);
        // QCode starts after 5 header bytes + 8 table bytes.
        assert_eq!(ob3.object_code[13], 0x22);
    }

    #[test]
    fn four_line_wrapper_leads_with_stop_sin() {
        let ob3 = Ob3File::from_machine_code(&[0x39], MODEL_LZ);
        assert_eq!(ob3.object_code[13], QCODE_STOP);
        assert_eq!(ob3.object_code[14], QCODE_SIN);
    }

    #[test]
    fn ob3_round_trip() {
        let ob3 = Ob3File::from_machine_code(&[0x86, 0x41, 0x39], MODEL_XP);
        let parsed = Ob3File::from_bytes(&ob3.to_bytes()).unwrap();
        assert_eq!(parsed, ob3);
    }

    #[test]
    fn qcode_length_counts_prefix_and_code() {
        let code = [0x01, 0x39];
        let ob3 = Ob3File::from_machine_code(&code, MODEL_LZ);
        let qlen = u16::from_be_bytes([ob3.object_code[2], ob3.object_code[3]]) as usize;
        assert_eq!(qlen, 2 + QCODE_BOOTSTRAP.len() + code.len());
    }
}
