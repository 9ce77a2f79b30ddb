// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! End-to-end scenarios: C or assembly source through the compiler,
//! assembler and pack container into the emulator, observed through the
//! rendered display. These run headless, with the emulator's service
//! layer standing in for the device ROM.

use psiforge::asm::assembler::{assemble, AsmOptions};
use psiforge::asm::output::OutputForm;
use psiforge::asm::reloc;
use psiforge::cc::linkcheck::UnitSource;
use psiforge::driver;
use psiforge::emu::emulator::{Emulator, StopReason, DEFAULT_LOAD_ADDR};
use psiforge::models::{DEFAULT_MODEL, MODEL_XP};

fn c_unit(text: &str) -> UnitSource {
    UnitSource::C {
        file: "main.c".to_string(),
        text: text.to_string(),
    }
}

/// Compile C to raw machine code ready for injection.
fn compile_to_binary(source: &str) -> Vec<u8> {
    let asm_text = driver::compile_c(&[c_unit(source)], DEFAULT_MODEL, &[], &[])
        .expect("C should compile");
    let result = driver::assemble(
        &asm_text,
        "<generated>",
        &AsmOptions::default(),
        OutputForm::Raw,
    )
    .expect("generated assembly should assemble");
    result.object
}

fn run_program(code: &[u8], taps: &[&str], max_cycles: u64) -> Emulator {
    let mut emu = Emulator::new(MODEL_XP);
    emu.inject_program(code, DEFAULT_LOAD_ADDR);
    for tap in taps {
        emu.tap_key(tap, 20_000);
    }
    emu.run(max_cycles);
    emu
}

#[test]
fn hello_renders_on_row_zero_and_returns_after_key() {
    let code = compile_to_binary(
        r#"
void main() {
    cls();
    print("Hello, Psion!");
    getkey();
}
"#,
    );
    // Without a key the program blocks at the trap.
    let mut emu = Emulator::new(MODEL_XP);
    emu.inject_program(&code, DEFAULT_LOAD_ADDR);
    let stalled = emu.run(300_000);
    assert_eq!(stalled.reason, StopReason::CyclesExhausted);
    let rows = emu.display_text();
    assert_eq!(rows[0], "Hello, Psion!   ");
    assert_eq!(rows[1].trim_end(), "");

    // A tapped key releases it and execution returns.
    emu.tap_key("EXE", 10_000);
    let done = emu.run(300_000);
    assert_eq!(done.reason, StopReason::ProgramExit);
}

#[test]
fn counter_tracks_plus_plus_plus_minus() {
    let code = compile_to_binary(
        r#"
int count;

void main() {
    char k;
    count = 0;
    for (;;) {
        at(0, 0);
        print("Count: ");
        print_int(count);
        k = getkey();
        if (k == '+') { count = count + 1; }
        if (k == '-') { count = count - 1; }
        if (k == 'Q') { break; }
    }
}
"#,
    );
    let emu = run_program(&code, &["+", "+", "+", "-", "Q"], 3_000_000);
    assert_eq!(emu.display_text()[0].trim_end(), "Count: 2");
}

#[test]
fn char_arithmetic_selects_eight_bit_add() {
    let source = r#"
void main() {
    char a;
    char b;
    char c;
    a = 'A';
    b = ' ';
    c = a + b;
    putchar(c);
}
"#;
    // The char addition compiles to an 8-bit add with no 16-bit add in
    // the function body.
    let asm_text =
        driver::compile_c(&[c_unit(source)], DEFAULT_MODEL, &[], &[]).expect("compiles");
    let body_start = asm_text.find("_main:").expect("main label");
    let body_end = asm_text.find("_main_exit:").expect("exit label");
    let body = &asm_text[body_start..body_end];
    assert!(body.contains("ADDB"), "expected 8-bit add in:\n{body}");
    assert!(!body.contains("ADDD"), "no 16-bit add allowed in:\n{body}");

    // And 'A' + ' ' renders as lowercase 'a'.
    let code = compile_to_binary(source);
    let emu = run_program(&code, &[], 1_000_000);
    assert_eq!(emu.display_text()[0].chars().next(), Some('a'));
}

#[test]
fn struct_sizeof_prints_four() {
    let code = compile_to_binary(
        r#"
struct P { int x; int y; };

void main() {
    print_int(sizeof(struct P));
}
"#,
    );
    let emu = run_program(&code, &[], 1_000_000);
    assert_eq!(emu.display_text()[0].trim_end(), "4");
}

#[test]
fn self_relocating_object_runs_at_two_bases() {
    let source = r#"
 JSR first
 JSR second
 RTS
first: LDAB #'O'
 SWI
 FCB 2
 RTS
second: LDAB #'K'
 SWI
 FCB 2
 RTS
"#;
    let options = AsmOptions {
        relocatable: true,
        ..AsmOptions::default()
    };
    let assembly = assemble(source, "reloc.asm", &options).expect("assembles");
    // Exactly the two JSR operands need fixing up.
    assert_eq!(assembly.fixups.len(), 2);

    let wrapped = reloc::wrap_relocatable(&assembly);
    let mut outputs = Vec::new();
    for base in [0x2000u16, 0x3400] {
        let mut emu = Emulator::new(MODEL_XP);
        emu.inject_program(&wrapped, base);
        let result = emu.run(2_000_000);
        assert_eq!(result.reason, StopReason::ProgramExit, "base {base:#06X}");
        outputs.push(emu.display_text());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0][0].trim_end(), "OK");
}

#[test]
fn external_procedure_marshals_both_arguments() {
    let source = r#"
external int ADDNUM(int a, int b);

void main() {
    print_int(ADDNUM(10, 32));
}
"#;
    let asm_text =
        driver::compile_c(&[c_unit(source)], DEFAULT_MODEL, &[], &[]).expect("compiles");
    // The one-shot trap setup leads main.
    let body_start = asm_text.find("_main:").expect("main label");
    let after_label = &asm_text[body_start..body_start + 120];
    assert!(
        after_label.contains("__ext_init"),
        "setup call missing:\n{after_label}"
    );

    let result = driver::assemble(
        &asm_text,
        "<generated>",
        &AsmOptions::default(),
        OutputForm::Raw,
    )
    .expect("assembles");
    let mut emu = Emulator::new(MODEL_XP);
    emu.register_external("ADDNUM%", Box::new(|args| args[0] + args[1]));
    emu.inject_program(&result.object, DEFAULT_LOAD_ADDR);
    let run = emu.run(2_000_000);
    assert_eq!(run.reason, StopReason::ProgramExit);
    assert!(emu.display_text()[0].contains("42"));
}

#[test]
fn pack_to_emulator_slot_flow() {
    let pack = driver::build_pack(
        &[c_unit("void main() { print(\"slot0\"); }")],
        "DEMO",
        DEFAULT_MODEL,
        false,
        16,
        &[],
    )
    .expect("builds");

    let mut emu = Emulator::new(MODEL_XP);
    emu.load_pack(&pack, 0).expect("loads");
    // The slot holds the pack data block padded to the declared size.
    let bytes = emu.pack_bytes(0).unwrap();
    assert_eq!(bytes.len(), 16 * 1024);
}
