// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! HD6303 instruction table.
//!
//! The HD6303 is a Hitachi derivative of the Motorola 6801 with extra
//! bit-manipulation instructions (AIM/OIM/EIM/TIM), the D<->X exchange
//! XGDX and a SLP low-power state. The table maps (mnemonic, mode) to
//! opcode byte, total instruction size and documented cycle count; both
//! the assembler encoder and the emulator's cycle accounting read it.
//!
//! Note the HD6303 has no CPD; D comparisons go through SUBD.

use std::fmt;

/// HD6303 addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrMode {
    /// No operand (NOP, RTS, PSHA).
    Inherent,
    /// Literal operand, 8 or 16 bit depending on the instruction.
    Immediate,
    /// Zero-page address, one operand byte.
    Direct,
    /// Full 16-bit address.
    Extended,
    /// X register plus unsigned 8-bit offset.
    Indexed,
    /// Signed 8-bit displacement from the following instruction.
    Relative,
}

impl fmt::Display for AddrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddrMode::Inherent => "inherent",
            AddrMode::Immediate => "immediate",
            AddrMode::Direct => "direct",
            AddrMode::Extended => "extended",
            AddrMode::Indexed => "indexed",
            AddrMode::Relative => "relative",
        };
        write!(f, "{name}")
    }
}

pub struct InstrEntry {
    pub mnemonic: &'static str,
    pub mode: AddrMode,
    pub opcode: u8,
    pub size: u8,
    pub cycles: u8,
}

const fn e(mnemonic: &'static str, mode: AddrMode, opcode: u8, size: u8, cycles: u8) -> InstrEntry {
    InstrEntry {
        mnemonic,
        mode,
        opcode,
        size,
        cycles,
    }
}

use AddrMode::{Direct, Extended, Immediate, Indexed, Inherent, Relative};

pub static OPCODE_TABLE: &[InstrEntry] = &[
    // Control
    e("TRAP", Inherent, 0x00, 1, 12),
    e("NOP", Inherent, 0x01, 1, 1),
    e("LSRD", Inherent, 0x04, 1, 1),
    e("ASLD", Inherent, 0x05, 1, 1),
    e("LSLD", Inherent, 0x05, 1, 1),
    e("TAP", Inherent, 0x06, 1, 1),
    e("TPA", Inherent, 0x07, 1, 1),
    e("INX", Inherent, 0x08, 1, 1),
    e("DEX", Inherent, 0x09, 1, 1),
    e("CLV", Inherent, 0x0A, 1, 1),
    e("SEV", Inherent, 0x0B, 1, 1),
    e("CLC", Inherent, 0x0C, 1, 1),
    e("SEC", Inherent, 0x0D, 1, 1),
    e("CLI", Inherent, 0x0E, 1, 1),
    e("SEI", Inherent, 0x0F, 1, 1),
    // Register ops
    e("SBA", Inherent, 0x10, 1, 1),
    e("CBA", Inherent, 0x11, 1, 1),
    e("TAB", Inherent, 0x16, 1, 1),
    e("TBA", Inherent, 0x17, 1, 1),
    e("XGDX", Inherent, 0x18, 1, 2),
    e("DAA", Inherent, 0x19, 1, 2),
    e("SLP", Inherent, 0x1A, 1, 4),
    e("ABA", Inherent, 0x1B, 1, 1),
    // Stack
    e("TSX", Inherent, 0x30, 1, 1),
    e("INS", Inherent, 0x31, 1, 1),
    e("PULA", Inherent, 0x32, 1, 3),
    e("PULB", Inherent, 0x33, 1, 3),
    e("DES", Inherent, 0x34, 1, 1),
    e("TXS", Inherent, 0x35, 1, 1),
    e("PSHA", Inherent, 0x36, 1, 4),
    e("PSHB", Inherent, 0x37, 1, 4),
    e("PULX", Inherent, 0x38, 1, 4),
    e("RTS", Inherent, 0x39, 1, 5),
    e("ABX", Inherent, 0x3A, 1, 1),
    e("RTI", Inherent, 0x3B, 1, 10),
    e("PSHX", Inherent, 0x3C, 1, 5),
    e("MUL", Inherent, 0x3D, 1, 7),
    e("WAI", Inherent, 0x3E, 1, 9),
    e("SWI", Inherent, 0x3F, 1, 12),
    // Accumulator A inherent
    e("NEGA", Inherent, 0x40, 1, 1),
    e("COMA", Inherent, 0x43, 1, 1),
    e("LSRA", Inherent, 0x44, 1, 1),
    e("RORA", Inherent, 0x46, 1, 1),
    e("ASRA", Inherent, 0x47, 1, 1),
    e("ASLA", Inherent, 0x48, 1, 1),
    e("LSLA", Inherent, 0x48, 1, 1),
    e("ROLA", Inherent, 0x49, 1, 1),
    e("DECA", Inherent, 0x4A, 1, 1),
    e("INCA", Inherent, 0x4C, 1, 1),
    e("TSTA", Inherent, 0x4D, 1, 1),
    e("CLRA", Inherent, 0x4F, 1, 1),
    // Accumulator B inherent
    e("NEGB", Inherent, 0x50, 1, 1),
    e("COMB", Inherent, 0x53, 1, 1),
    e("LSRB", Inherent, 0x54, 1, 1),
    e("RORB", Inherent, 0x56, 1, 1),
    e("ASRB", Inherent, 0x57, 1, 1),
    e("ASLB", Inherent, 0x58, 1, 1),
    e("LSLB", Inherent, 0x58, 1, 1),
    e("ROLB", Inherent, 0x59, 1, 1),
    e("DECB", Inherent, 0x5A, 1, 1),
    e("INCB", Inherent, 0x5C, 1, 1),
    e("TSTB", Inherent, 0x5D, 1, 1),
    e("CLRB", Inherent, 0x5F, 1, 1),
    // Indexed read-modify-write
    e("NEG", Indexed, 0x60, 2, 6),
    e("COM", Indexed, 0x63, 2, 6),
    e("LSR", Indexed, 0x64, 2, 6),
    e("ROR", Indexed, 0x66, 2, 6),
    e("ASR", Indexed, 0x67, 2, 6),
    e("ASL", Indexed, 0x68, 2, 6),
    e("LSL", Indexed, 0x68, 2, 6),
    e("ROL", Indexed, 0x69, 2, 6),
    e("DEC", Indexed, 0x6A, 2, 6),
    e("INC", Indexed, 0x6C, 2, 6),
    e("TST", Indexed, 0x6D, 2, 4),
    e("JMP", Indexed, 0x6E, 2, 3),
    e("CLR", Indexed, 0x6F, 2, 5),
    // Extended read-modify-write
    e("NEG", Extended, 0x70, 3, 6),
    e("COM", Extended, 0x73, 3, 6),
    e("LSR", Extended, 0x74, 3, 6),
    e("ROR", Extended, 0x76, 3, 6),
    e("ASR", Extended, 0x77, 3, 6),
    e("ASL", Extended, 0x78, 3, 6),
    e("LSL", Extended, 0x78, 3, 6),
    e("ROL", Extended, 0x79, 3, 6),
    e("DEC", Extended, 0x7A, 3, 6),
    e("INC", Extended, 0x7C, 3, 6),
    e("TST", Extended, 0x7D, 3, 4),
    e("JMP", Extended, 0x7E, 3, 3),
    e("CLR", Extended, 0x7F, 3, 5),
    // HD6303 bit manipulation: opcode, mask byte, then offset/address
    e("AIM", Indexed, 0x61, 3, 7),
    e("OIM", Indexed, 0x62, 3, 7),
    e("EIM", Indexed, 0x65, 3, 7),
    e("TIM", Indexed, 0x6B, 3, 5),
    e("AIM", Direct, 0x71, 3, 6),
    e("OIM", Direct, 0x72, 3, 6),
    e("EIM", Direct, 0x75, 3, 6),
    e("TIM", Direct, 0x7B, 3, 4),
    // Accumulator A
    e("SUBA", Immediate, 0x80, 2, 2),
    e("CMPA", Immediate, 0x81, 2, 2),
    e("SBCA", Immediate, 0x82, 2, 2),
    e("ANDA", Immediate, 0x84, 2, 2),
    e("BITA", Immediate, 0x85, 2, 2),
    e("LDAA", Immediate, 0x86, 2, 2),
    e("EORA", Immediate, 0x88, 2, 2),
    e("ADCA", Immediate, 0x89, 2, 2),
    e("ORAA", Immediate, 0x8A, 2, 2),
    e("ADDA", Immediate, 0x8B, 2, 2),
    e("SUBA", Direct, 0x90, 2, 3),
    e("CMPA", Direct, 0x91, 2, 3),
    e("SBCA", Direct, 0x92, 2, 3),
    e("ANDA", Direct, 0x94, 2, 3),
    e("BITA", Direct, 0x95, 2, 3),
    e("LDAA", Direct, 0x96, 2, 3),
    e("STAA", Direct, 0x97, 2, 3),
    e("EORA", Direct, 0x98, 2, 3),
    e("ADCA", Direct, 0x99, 2, 3),
    e("ORAA", Direct, 0x9A, 2, 3),
    e("ADDA", Direct, 0x9B, 2, 3),
    e("SUBA", Indexed, 0xA0, 2, 4),
    e("CMPA", Indexed, 0xA1, 2, 4),
    e("SBCA", Indexed, 0xA2, 2, 4),
    e("ANDA", Indexed, 0xA4, 2, 4),
    e("BITA", Indexed, 0xA5, 2, 4),
    e("LDAA", Indexed, 0xA6, 2, 4),
    e("STAA", Indexed, 0xA7, 2, 4),
    e("EORA", Indexed, 0xA8, 2, 4),
    e("ADCA", Indexed, 0xA9, 2, 4),
    e("ORAA", Indexed, 0xAA, 2, 4),
    e("ADDA", Indexed, 0xAB, 2, 4),
    e("SUBA", Extended, 0xB0, 3, 4),
    e("CMPA", Extended, 0xB1, 3, 4),
    e("SBCA", Extended, 0xB2, 3, 4),
    e("ANDA", Extended, 0xB4, 3, 4),
    e("BITA", Extended, 0xB5, 3, 4),
    e("LDAA", Extended, 0xB6, 3, 4),
    e("STAA", Extended, 0xB7, 3, 4),
    e("EORA", Extended, 0xB8, 3, 4),
    e("ADCA", Extended, 0xB9, 3, 4),
    e("ORAA", Extended, 0xBA, 3, 4),
    e("ADDA", Extended, 0xBB, 3, 4),
    // Accumulator B
    e("SUBB", Immediate, 0xC0, 2, 2),
    e("CMPB", Immediate, 0xC1, 2, 2),
    e("SBCB", Immediate, 0xC2, 2, 2),
    e("ANDB", Immediate, 0xC4, 2, 2),
    e("BITB", Immediate, 0xC5, 2, 2),
    e("LDAB", Immediate, 0xC6, 2, 2),
    e("EORB", Immediate, 0xC8, 2, 2),
    e("ADCB", Immediate, 0xC9, 2, 2),
    e("ORAB", Immediate, 0xCA, 2, 2),
    e("ADDB", Immediate, 0xCB, 2, 2),
    e("SUBB", Direct, 0xD0, 2, 3),
    e("CMPB", Direct, 0xD1, 2, 3),
    e("SBCB", Direct, 0xD2, 2, 3),
    e("ANDB", Direct, 0xD4, 2, 3),
    e("BITB", Direct, 0xD5, 2, 3),
    e("LDAB", Direct, 0xD6, 2, 3),
    e("STAB", Direct, 0xD7, 2, 3),
    e("EORB", Direct, 0xD8, 2, 3),
    e("ADCB", Direct, 0xD9, 2, 3),
    e("ORAB", Direct, 0xDA, 2, 3),
    e("ADDB", Direct, 0xDB, 2, 3),
    e("SUBB", Indexed, 0xE0, 2, 4),
    e("CMPB", Indexed, 0xE1, 2, 4),
    e("SBCB", Indexed, 0xE2, 2, 4),
    e("ANDB", Indexed, 0xE4, 2, 4),
    e("BITB", Indexed, 0xE5, 2, 4),
    e("LDAB", Indexed, 0xE6, 2, 4),
    e("STAB", Indexed, 0xE7, 2, 4),
    e("EORB", Indexed, 0xE8, 2, 4),
    e("ADCB", Indexed, 0xE9, 2, 4),
    e("ORAB", Indexed, 0xEA, 2, 4),
    e("ADDB", Indexed, 0xEB, 2, 4),
    e("SUBB", Extended, 0xF0, 3, 4),
    e("CMPB", Extended, 0xF1, 3, 4),
    e("SBCB", Extended, 0xF2, 3, 4),
    e("ANDB", Extended, 0xF4, 3, 4),
    e("BITB", Extended, 0xF5, 3, 4),
    e("LDAB", Extended, 0xF6, 3, 4),
    e("STAB", Extended, 0xF7, 3, 4),
    e("EORB", Extended, 0xF8, 3, 4),
    e("ADCB", Extended, 0xF9, 3, 4),
    e("ORAB", Extended, 0xFA, 3, 4),
    e("ADDB", Extended, 0xFB, 3, 4),
    // 16-bit D register
    e("SUBD", Immediate, 0x83, 3, 3),
    e("SUBD", Direct, 0x93, 2, 4),
    e("SUBD", Indexed, 0xA3, 2, 5),
    e("SUBD", Extended, 0xB3, 3, 5),
    e("ADDD", Immediate, 0xC3, 3, 3),
    e("ADDD", Direct, 0xD3, 2, 4),
    e("ADDD", Indexed, 0xE3, 2, 5),
    e("ADDD", Extended, 0xF3, 3, 5),
    e("LDD", Immediate, 0xCC, 3, 3),
    e("LDD", Direct, 0xDC, 2, 4),
    e("LDD", Indexed, 0xEC, 2, 5),
    e("LDD", Extended, 0xFC, 3, 5),
    e("STD", Direct, 0xDD, 2, 4),
    e("STD", Indexed, 0xED, 2, 5),
    e("STD", Extended, 0xFD, 3, 5),
    // Index register X
    e("CPX", Immediate, 0x8C, 3, 3),
    e("CPX", Direct, 0x9C, 2, 4),
    e("CPX", Indexed, 0xAC, 2, 5),
    e("CPX", Extended, 0xBC, 3, 5),
    e("LDX", Immediate, 0xCE, 3, 3),
    e("LDX", Direct, 0xDE, 2, 4),
    e("LDX", Indexed, 0xEE, 2, 5),
    e("LDX", Extended, 0xFE, 3, 5),
    e("STX", Direct, 0xDF, 2, 4),
    e("STX", Indexed, 0xEF, 2, 5),
    e("STX", Extended, 0xFF, 3, 5),
    // Stack pointer
    e("LDS", Immediate, 0x8E, 3, 3),
    e("LDS", Direct, 0x9E, 2, 4),
    e("LDS", Indexed, 0xAE, 2, 5),
    e("LDS", Extended, 0xBE, 3, 5),
    e("STS", Direct, 0x9F, 2, 4),
    e("STS", Indexed, 0xAF, 2, 5),
    e("STS", Extended, 0xBF, 3, 5),
    // Branches: signed offset from the byte after the instruction
    e("BRA", Relative, 0x20, 2, 3),
    e("BRN", Relative, 0x21, 2, 3),
    e("BHI", Relative, 0x22, 2, 3),
    e("BLS", Relative, 0x23, 2, 3),
    e("BCC", Relative, 0x24, 2, 3),
    e("BHS", Relative, 0x24, 2, 3),
    e("BCS", Relative, 0x25, 2, 3),
    e("BLO", Relative, 0x25, 2, 3),
    e("BNE", Relative, 0x26, 2, 3),
    e("BEQ", Relative, 0x27, 2, 3),
    e("BVC", Relative, 0x28, 2, 3),
    e("BVS", Relative, 0x29, 2, 3),
    e("BPL", Relative, 0x2A, 2, 3),
    e("BMI", Relative, 0x2B, 2, 3),
    e("BGE", Relative, 0x2C, 2, 3),
    e("BLT", Relative, 0x2D, 2, 3),
    e("BGT", Relative, 0x2E, 2, 3),
    e("BLE", Relative, 0x2F, 2, 3),
    e("BSR", Relative, 0x8D, 2, 5),
    // Subroutine calls
    e("JSR", Direct, 0x9D, 2, 5),
    e("JSR", Indexed, 0xAD, 2, 5),
    e("JSR", Extended, 0xBD, 3, 6),
];

/// Branch mnemonics (relative addressing).
pub const BRANCHES: &[&str] = &[
    "BRA", "BRN", "BHI", "BLS", "BCC", "BHS", "BCS", "BLO", "BNE", "BEQ", "BVC", "BVS", "BPL",
    "BMI", "BGE", "BLT", "BGT", "BLE", "BSR",
];

/// Instructions taking a 16-bit immediate operand.
pub const WORD_IMMEDIATE: &[&str] = &["LDD", "LDX", "LDS", "CPX", "ADDD", "SUBD"];

/// Store instructions, which have no immediate form.
pub const NO_IMMEDIATE: &[&str] = &["STAA", "STAB", "STD", "STX", "STS"];

/// HD6303 memory-immediate bit operations (`OP #mask,addr`).
pub const BIT_MANIP: &[&str] = &["AIM", "OIM", "EIM", "TIM"];

/// Control transfers after which straight-line code is unreachable.
pub const BLOCK_ENDING: &[&str] = &["JMP", "RTS", "RTI", "BRA"];

pub fn lookup(mnemonic: &str, mode: AddrMode) -> Option<&'static InstrEntry> {
    OPCODE_TABLE
        .iter()
        .find(|entry| entry.mode == mode && entry.mnemonic.eq_ignore_ascii_case(mnemonic))
}

pub fn is_mnemonic(name: &str) -> bool {
    OPCODE_TABLE
        .iter()
        .any(|entry| entry.mnemonic.eq_ignore_ascii_case(name))
}

pub fn is_branch(mnemonic: &str) -> bool {
    BRANCHES.iter().any(|m| m.eq_ignore_ascii_case(mnemonic))
}

pub fn uses_word_immediate(mnemonic: &str) -> bool {
    WORD_IMMEDIATE
        .iter()
        .any(|m| m.eq_ignore_ascii_case(mnemonic))
}

pub fn is_store(mnemonic: &str) -> bool {
    NO_IMMEDIATE.iter().any(|m| m.eq_ignore_ascii_case(mnemonic))
}

pub fn is_bit_manip(mnemonic: &str) -> bool {
    BIT_MANIP.iter().any(|m| m.eq_ignore_ascii_case(mnemonic))
}

pub fn valid_modes(mnemonic: &str) -> Vec<AddrMode> {
    OPCODE_TABLE
        .iter()
        .filter(|entry| entry.mnemonic.eq_ignore_ascii_case(mnemonic))
        .map(|entry| entry.mode)
        .collect()
}

/// Invert a conditional branch for relaxation: the inverted short branch
/// skips a JMP to the far target. BSR has no inverse (it relaxes to JSR)
/// and returns None, as does anything that is not a branch.
pub fn inverted_branch(mnemonic: &str) -> Option<&'static str> {
    let inverse = match mnemonic.to_ascii_uppercase().as_str() {
        "BRA" => "BRN",
        "BRN" => "BRA",
        "BHI" => "BLS",
        "BLS" => "BHI",
        "BCC" | "BHS" => "BCS",
        "BCS" | "BLO" => "BCC",
        "BNE" => "BEQ",
        "BEQ" => "BNE",
        "BVC" => "BVS",
        "BVS" => "BVC",
        "BPL" => "BMI",
        "BMI" => "BPL",
        "BGE" => "BLT",
        "BLT" => "BGE",
        "BGT" => "BLE",
        "BLE" => "BGT",
        _ => return None,
    };
    Some(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let entry = lookup("ldaa", AddrMode::Immediate).expect("LDAA imm");
        assert_eq!(entry.opcode, 0x86);
        assert_eq!(entry.size, 2);
    }

    #[test]
    fn word_immediates_are_three_bytes() {
        for mnemonic in WORD_IMMEDIATE {
            let entry = lookup(mnemonic, AddrMode::Immediate).expect("entry");
            assert_eq!(entry.size, 3, "{mnemonic}");
        }
    }

    #[test]
    fn stores_have_no_immediate_entry() {
        for mnemonic in NO_IMMEDIATE {
            assert!(lookup(mnemonic, AddrMode::Immediate).is_none(), "{mnemonic}");
        }
    }

    #[test]
    fn bit_manip_has_mask_plus_operand_size() {
        for mnemonic in BIT_MANIP {
            for mode in [AddrMode::Direct, AddrMode::Indexed] {
                let entry = lookup(mnemonic, mode).expect("entry");
                assert_eq!(entry.size, 3, "{mnemonic} {mode}");
            }
        }
    }

    #[test]
    fn every_branch_has_a_relative_entry() {
        for mnemonic in BRANCHES {
            let entry = lookup(mnemonic, AddrMode::Relative).expect("entry");
            assert_eq!(entry.size, 2, "{mnemonic}");
        }
    }

    #[test]
    fn inversion_is_an_involution() {
        for mnemonic in BRANCHES {
            if *mnemonic == "BSR" {
                assert!(inverted_branch(mnemonic).is_none());
                continue;
            }
            let inv = inverted_branch(mnemonic).expect("inverse");
            let back = inverted_branch(inv).expect("inverse of inverse");
            let entry = lookup(mnemonic, AddrMode::Relative).unwrap();
            let back_entry = lookup(back, AddrMode::Relative).unwrap();
            // Aliases (BHS/BCC, BLO/BCS) share opcodes, so compare encodings.
            assert_eq!(entry.opcode, back_entry.opcode, "{mnemonic}");
        }
    }

    #[test]
    fn tsx_is_single_cycle() {
        assert_eq!(lookup("TSX", AddrMode::Inherent).unwrap().cycles, 1);
    }
}
