// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Boundary behaviour across the toolchain: immediate ranges, branch
//! relaxation thresholds, pack size classes, and the codegen cycle
//! fingerprint that guards against silent regressions.

use psiforge::asm::assembler::{assemble, AsmOptions};
use psiforge::asm::disasm;
use psiforge::asm::opcodes;
use psiforge::cc::linkcheck::UnitSource;
use psiforge::driver;
use psiforge::emu::emulator::{Emulator, DEFAULT_LOAD_ADDR};
use psiforge::models::{DEFAULT_MODEL, MODEL_XP};
use psiforge::opk::builder::PackBuilder;
use psiforge::opk::reader::parse_pack;
use psiforge::opk::records::PackType;

#[test]
fn char_immediates_round_trip_through_execution() {
    // 0, 1, 127, 128, 255, -1, -128 as LDAB immediates, stored out.
    for (value, expected) in [
        (0i32, 0u8),
        (1, 1),
        (127, 127),
        (128, 128),
        (255, 255),
        (-1, 0xFF),
        (-128, 0x80),
    ] {
        let source = format!(" LDAB #{value}\n STAB $90\n RTS\n");
        let asm = assemble(&source, "<t>", &AsmOptions::default()).unwrap();
        let mut emu = Emulator::new(MODEL_XP);
        emu.inject_program(&asm.code, DEFAULT_LOAD_ADDR);
        emu.run(1_000);
        assert_eq!(emu.read_byte(0x90), expected, "value {value}");
    }
}

#[test]
fn char_immediate_zero_sets_z_flag() {
    let asm = assemble(" LDAB #0\n RTS\n", "<t>", &AsmOptions::default()).unwrap();
    let mut emu = Emulator::new(MODEL_XP);
    emu.inject_program(&asm.code, DEFAULT_LOAD_ADDR);
    emu.step().unwrap();
    let flags = emu.registers().flags;
    assert!(flags & 0x04 != 0, "Z set");
    assert!(flags & 0x08 == 0, "N clear");
}

#[test]
fn indexed_offsets_to_255_assemble_256_is_range_error() {
    for offset in [0, 1, 127, 128, 255] {
        let source = format!(" LDAA {offset},X\n");
        let asm = assemble(&source, "<t>", &AsmOptions::default()).unwrap();
        assert_eq!(asm.code, vec![0xA6, offset as u8], "offset {offset}");
    }
    let err = assemble(" LDAA 256,X\n", "<t>", &AsmOptions::default()).unwrap_err();
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn short_branch_at_exact_limits() {
    // The straight-line NOP padding after an unconditional branch is
    // exactly what the dead-code rule strips, so these run unoptimized.
    let no_opt = AsmOptions {
        optimize: false,
        ..AsmOptions::default()
    };

    // Forward displacement 127 from the byte after the branch: short.
    let mut source = String::from(" BRA target\n");
    for _ in 0..127 {
        source.push_str(" NOP\n");
    }
    source.push_str("target: RTS\n");
    let asm = assemble(&source, "<t>", &no_opt).unwrap();
    assert_eq!(&asm.code[..2], &[0x20, 0x7F]);

    // One more NOP pushes it past +127 and relaxes to JMP.
    let mut source = String::from(" BRA target\n");
    for _ in 0..128 {
        source.push_str(" NOP\n");
    }
    source.push_str("target: RTS\n");
    let asm = assemble(&source, "<t>", &no_opt).unwrap();
    assert_eq!(asm.code[0], 0x7E, "BRA relaxed to JMP");

    // Backward displacement of exactly -128 stays short.
    let mut source = String::from("target: NOP\n");
    for _ in 0..125 {
        source.push_str(" NOP\n");
    }
    source.push_str(" BRA target\n");
    let asm = assemble(&source, "<t>", &AsmOptions::default()).unwrap();
    let n = asm.code.len();
    assert_eq!(&asm.code[n - 2..], &[0x20, 0x80]);
}

#[test]
fn relaxation_terminates_on_branch_chains() {
    // Many branches all hovering at the limit; relaxing one pushes the
    // next out of range. The fixed point must still terminate.
    let mut source = String::new();
    for i in 0..20 {
        source.push_str(&format!(" BEQ far{i}\n"));
    }
    for _ in 0..100 {
        source.push_str(" NOP\n");
    }
    for i in 0..20 {
        source.push_str(&format!("far{i}: NOP\n"));
    }
    let asm = assemble(&source, "<t>", &AsmOptions::default()).unwrap();
    // The early branches must have relaxed: BNE +3 over a JMP.
    assert_eq!(asm.code[0], 0x26);
    assert_eq!(asm.code[2], 0x7E);
}

#[test]
fn pack_size_classes_validate_and_load() {
    for size_kb in [8u32, 16, 32, 64, 128] {
        let mut builder = PackBuilder::new(size_kb, PackType::Datapak).unwrap();
        builder
            .add_procedure("PROBE", vec![0x01, 0x39], Vec::new())
            .unwrap();
        let opk = builder.build().unwrap();
        let image = parse_pack(&opk).unwrap();
        assert_eq!(image.header.size_kb, size_kb);

        let mut emu = Emulator::new(MODEL_XP);
        emu.load_pack(&opk, 0).unwrap();
        assert_eq!(
            emu.pack_bytes(0).unwrap().len(),
            size_kb as usize * 1024,
            "{size_kb} KiB"
        );
    }
    assert!(PackBuilder::new(24, PackType::Datapak).is_err());
}

#[test]
fn instruction_sizes_equal_emitted_byte_counts() {
    let source = "\
start: LDAA #1
 LDX #$1234
 STAA <$80
 STD >$2000
 LDAB 9,X
 AIM #$0F,<$20
 BNE start
 JSR >$2000
 RTS
";
    let asm = assemble(source, "<t>", &AsmOptions::default()).unwrap();
    for row in &asm.listing_rows {
        let lines = disasm::disassemble(&row.bytes, row.addr);
        let decoded: usize = lines.iter().map(|l| l.bytes.len()).sum();
        assert_eq!(decoded, row.bytes.len());
    }
}

#[test]
fn cpu_cycle_deltas_match_documented_counts() {
    // Straight-line program; every step's cycle delta must equal the
    // opcode table entry.
    let source = " LDAA #1\n LDX #$2100\n STAA 0,X\n INCA\n STAA >$2101\n NOP\n RTS\n";
    let asm = assemble(source, "<t>", &AsmOptions::default()).unwrap();
    let lines = disasm::disassemble(&asm.code, DEFAULT_LOAD_ADDR);

    let mut emu = Emulator::new(MODEL_XP);
    emu.inject_program(&asm.code, DEFAULT_LOAD_ADDR);
    for line in &lines {
        let before = emu.cycles();
        emu.step().unwrap();
        let delta = (emu.cycles() - before) as u8;
        let mnemonic = line.text.split_whitespace().next().unwrap();
        let entry = opcodes::OPCODE_TABLE
            .iter()
            .find(|e| e.opcode == line.bytes[0])
            .unwrap();
        assert_eq!(delta, entry.cycles, "{mnemonic}");
    }
}

#[test]
fn codegen_prelude_cycle_fingerprint() {
    // The entry sequence of an empty program is BSR, RTS, PSHX, TSX,
    // PULX, RTS; its cycle sum is a fingerprint that catches silent
    // codegen or encoder drift.
    let asm_text = driver::compile_c(
        &[UnitSource::C {
            file: "main.c".to_string(),
            text: "void main() { }".to_string(),
        }],
        DEFAULT_MODEL,
        &[],
        &[],
    )
    .unwrap();
    let asm = assemble(&asm_text, "<g>", &AsmOptions::default()).unwrap();
    let lines = disasm::disassemble(&asm.code, 0);
    let fingerprint: u32 = lines
        .iter()
        .take(6)
        .map(|line| {
            opcodes::OPCODE_TABLE
                .iter()
                .find(|e| e.opcode == line.bytes[0])
                .map(|e| e.cycles as u32)
                .unwrap_or(0)
        })
        .sum();
    assert_eq!(fingerprint, 25);
}

#[test]
fn optimizer_preserves_relocation_targets() {
    // A push/pull pair around a fixed-up JSR: the pair vanishes, the
    // fixup cell still points at the JSR operand.
    let options = AsmOptions {
        relocatable: true,
        ..AsmOptions::default()
    };
    let asm = assemble(
        " PSHA\n PULA\n JSR sub\n RTS\nsub: RTS\n",
        "<t>",
        &options,
    )
    .unwrap();
    assert_eq!(asm.code[0], 0xBD, "pair removed, JSR first");
    assert_eq!(asm.fixups, vec![1]);
    let target = u16::from_be_bytes([asm.code[1], asm.code[2]]);
    assert_eq!(target, 4, "JSR points at sub");
}
