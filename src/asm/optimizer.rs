// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Peephole optimizer over the assembler's instruction list.
//!
//! Runs between collection and sizing, so every surviving instruction is
//! encoded (and gains its relocation entries) afterwards; nothing here
//! can orphan a fixup or a symbol. Rewrites never cross a label, since
//! any label may be a branch target.
//!
//! Rules that change carry behaviour are permanently excluded: LDAA #0
//! is not CLRA (CLR clears C), ADDA #1 is not INCA and SUBA #1 is not
//! DECA (INC/DEC leave C alone). Later code may be relying on the carry
//! those instructions produce.

use crate::asm::assembler::{Item, InstrItem};
use crate::asm::opcodes;
use crate::asm::parser::Operand;
use crate::core::expr::Expr;

const MAX_PASSES: usize = 10;

/// Apply the safe rule set until a fixed point; returns the number of
/// instructions removed or rewritten.
pub(crate) fn optimize_items(items: &mut Vec<Item>) -> usize {
    let mut total = 0;
    for _ in 0..MAX_PASSES {
        let mut changed = 0;
        changed += compare_zero_pass(items);
        changed += pair_pass(items);
        changed += dead_code_pass(items);
        total += changed;
        if changed == 0 {
            break;
        }
    }
    total
}

fn instr(item: &Item) -> Option<&InstrItem> {
    match item {
        Item::Instr(instr) => Some(instr),
        _ => None,
    }
}

fn is_imm_zero(operand: &Operand) -> bool {
    matches!(operand, Operand::Immediate(Expr::Number(0)))
}

/// CMPA #0 -> TSTA, CMPB #0 -> TSTB. Both set N and Z from the register
/// and clear V; code comparing against zero reads N/Z, never C.
fn compare_zero_pass(items: &mut [Item]) -> usize {
    let mut changed = 0;
    for item in items.iter_mut() {
        let Item::Instr(instr) = item else { continue };
        let replacement = match instr.mnemonic.as_str() {
            "CMPA" if is_imm_zero(&instr.operand) => "TSTA",
            "CMPB" if is_imm_zero(&instr.operand) => "TSTB",
            _ => continue,
        };
        instr.mnemonic = replacement.to_string();
        instr.operand = Operand::Inherent;
        instr.decided = None;
        changed += 1;
    }
    changed
}

fn push_pull_partner(mnemonic: &str) -> Option<&'static str> {
    match mnemonic {
        "PSHA" => Some("PULA"),
        "PSHB" => Some("PULB"),
        "PSHX" => Some("PULX"),
        _ => None,
    }
}

fn is_load(mnemonic: &str) -> bool {
    matches!(mnemonic, "LDAA" | "LDAB" | "LDD" | "LDX" | "LDS")
}

/// Adjacent-pair rules: push/pull identity deletion, dead first load of
/// two loads to the same register, redundant doubled TSX.
fn pair_pass(items: &mut Vec<Item>) -> usize {
    let mut changed = 0;
    let mut out: Vec<Item> = Vec::with_capacity(items.len());
    let mut i = 0;
    while i < items.len() {
        let Some(first) = instr(&items[i]) else {
            out.push(items[i].clone());
            i += 1;
            continue;
        };
        // A label between two instructions ends the window.
        let second = items.get(i + 1).and_then(instr);
        let Some(second) = second else {
            out.push(items[i].clone());
            i += 1;
            continue;
        };

        if let Some(pull) = push_pull_partner(&first.mnemonic) {
            if second.mnemonic == pull {
                changed += 2;
                i += 2;
                continue;
            }
        }

        // Two loads of the same register in a row: the first value is
        // never observed.
        if is_load(&first.mnemonic) && first.mnemonic == second.mnemonic {
            changed += 1;
            i += 1;
            continue;
        }

        if first.mnemonic == "TSX" && second.mnemonic == "TSX" {
            changed += 1;
            i += 1;
            continue;
        }

        out.push(items[i].clone());
        i += 1;
    }
    *items = out;
    changed
}

/// Remove instructions that follow an unconditional transfer, up to the
/// next label. Directives and data survive: they may be addressed from
/// elsewhere.
fn dead_code_pass(items: &mut Vec<Item>) -> usize {
    let mut changed = 0;
    let mut out: Vec<Item> = Vec::with_capacity(items.len());
    let mut unreachable = false;
    for item in items.iter() {
        match item {
            Item::Label { .. } => {
                unreachable = false;
                out.push(item.clone());
            }
            Item::Instr(instr) => {
                if unreachable {
                    changed += 1;
                    continue;
                }
                if opcodes::BLOCK_ENDING.contains(&instr.mnemonic.as_str()) {
                    unreachable = true;
                }
                out.push(item.clone());
            }
            other => out.push(other.clone()),
        }
    }
    *items = out;
    changed
}

#[cfg(test)]
mod tests {
    use crate::asm::assembler::{assemble, AsmOptions};

    fn optimized(source: &str) -> Vec<u8> {
        assemble(source, "<input>", &AsmOptions::default())
            .expect("assembles")
            .code
    }

    fn unoptimized(source: &str) -> Vec<u8> {
        let options = AsmOptions {
            optimize: false,
            ..AsmOptions::default()
        };
        assemble(source, "<input>", &options).expect("assembles").code
    }

    #[test]
    fn compare_zero_becomes_test() {
        assert_eq!(optimized(" CMPA #0\n"), vec![0x4D]);
        assert_eq!(optimized(" CMPB #0\n"), vec![0x5D]);
        // Non-zero comparisons are untouched.
        assert_eq!(optimized(" CMPA #1\n"), vec![0x81, 0x01]);
    }

    #[test]
    fn push_pull_pairs_vanish() {
        assert_eq!(optimized(" PSHA\n PULA\n RTS\n"), vec![0x39]);
        assert_eq!(optimized(" PSHX\n PULX\n RTS\n"), vec![0x39]);
        // Mismatched pairs survive.
        assert_eq!(optimized(" PSHA\n PULB\n"), vec![0x36, 0x33]);
    }

    #[test]
    fn label_blocks_pair_deletion() {
        let code = optimized(" PSHA\nmid: PULA\n RTS\n");
        assert_eq!(code, vec![0x36, 0x32, 0x39]);
    }

    #[test]
    fn dead_store_load_removed() {
        assert_eq!(optimized(" LDAA #1\n LDAA #2\n"), vec![0x86, 0x02]);
        // Different registers both survive.
        assert_eq!(
            optimized(" LDAA #1\n LDAB #2\n"),
            vec![0x86, 0x01, 0xC6, 0x02]
        );
    }

    #[test]
    fn doubled_tsx_keeps_last() {
        assert_eq!(optimized(" TSX\n TSX\n RTS\n"), vec![0x30, 0x39]);
    }

    #[test]
    fn unreachable_code_after_jump_removed() {
        let code = optimized(" BRA out\n NOP\n NOP\nout: RTS\n");
        // Branch straight to the label, dead NOPs gone.
        assert_eq!(code, vec![0x20, 0x00, 0x39]);
    }

    #[test]
    fn data_after_return_survives() {
        let code = optimized(" RTS\n FCB 1,2\nnext: NOP\n");
        assert_eq!(code, vec![0x39, 1, 2, 0x01]);
    }

    #[test]
    fn swi_does_not_end_a_block() {
        // SWI returns after the OS service; following code is live.
        let code = optimized(" SWI\n FCB 5\n NOP\n");
        assert_eq!(code, vec![0x3F, 5, 0x01]);
    }

    #[test]
    fn carry_sensitive_rewrites_are_not_applied() {
        assert_eq!(unoptimized(" LDAA #0\n"), optimized(" LDAA #0\n"));
        assert_eq!(unoptimized(" ADDA #1\n"), optimized(" ADDA #1\n"));
        assert_eq!(unoptimized(" SUBA #1\n"), optimized(" SUBA #1\n"));
    }

    #[test]
    fn optimizer_can_be_disabled() {
        assert_eq!(unoptimized(" PSHA\n PULA\n"), vec![0x36, 0x32]);
    }
}
