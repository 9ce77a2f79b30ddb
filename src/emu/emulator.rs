// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Emulator facade: owns the CPU, bus and peripherals, schedules key
//! taps, and provides the bounded run primitives.
//!
//! Two operating modes:
//! - **ROM mode**: a device ROM image is loaded; reset vectors through
//!   $FFFE and SWI dispatch is the ROM's own business.
//! - **Headless mode** (default): no ROM. The emulator intercepts SWI
//!   and routes the selector byte to the host service layer, so built
//!   programs can drive the display and keyboard without a ROM image.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::core::diag::{DiagKind, Diagnostic, SourcePos};
use crate::emu::bus::{Bus, BusAccess};
use crate::emu::cpu::{Cpu, CpuFault, Registers};
use crate::emu::display::{Display, RenderOptions};
use crate::emu::keyboard::Keyboard;
use crate::emu::memory::Memory;
use crate::emu::services::{key_code, svc, ExternalHandler, ExternalRegistry, EXTCALL_TRAP_LEN};
use crate::models::Model;
use crate::opk::checksum;
use crate::opk::reader;

/// Address of the two-byte exit stub a headless program returns into.
const EXIT_STUB: u16 = 0x0060;
/// Default entry point for injected programs.
pub const DEFAULT_LOAD_ADDR: u16 = 0x2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cycle budget ran out; not an error.
    CyclesExhausted,
    /// The core is stalled on WAI or SLP.
    Idle,
    Breakpoint(u16),
    ProgramExit,
    Fault(CpuFault),
}

#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    pub cycles: u64,
    pub reason: StopReason,
}

struct PendingTap {
    key: String,
    release_at: u64,
}

pub struct Emulator {
    pub model: Model,
    cpu: Cpu,
    bus: Bus,
    externals: ExternalRegistry,
    taps: Vec<PendingTap>,
    key_queue: VecDeque<u8>,
    breakpoints: HashSet<u16>,
    exited: bool,
    /// Host-side cursor for the service layer's text output.
    svc_row: usize,
    svc_col: usize,
}

impl Emulator {
    pub fn new(model: Model) -> Self {
        let memory = Memory::new(model);
        let display = Display::new(model.display_rows as usize);
        let keyboard = Keyboard::new();
        let mut bus = Bus::new(memory, display, keyboard);
        bus.switch_on();
        let mut emu = Self {
            model,
            cpu: Cpu::new(),
            bus,
            externals: ExternalRegistry::new(),
            taps: Vec::new(),
            key_queue: VecDeque::new(),
            breakpoints: HashSet::new(),
            exited: false,
            svc_row: 0,
            svc_col: 0,
        };
        emu.install_exit_stub();
        emu
    }

    fn install_exit_stub(&mut self) {
        self.bus.write(EXIT_STUB, 0x3F); // SWI
        self.bus.write(EXIT_STUB + 1, svc::EXIT);
    }

    fn headless(&self) -> bool {
        !self.bus.memory.has_rom()
    }

    /// Install a device ROM image; ends headless operation.
    pub fn load_rom(&mut self, image: Vec<u8>) {
        self.bus.memory.load_rom(image);
        self.reset();
    }

    /// Load a validated OPK image into a slot (0-2). The slot receives
    /// the pack data block padded to the pack's declared size.
    pub fn load_pack(&mut self, opk_bytes: &[u8], slot: usize) -> Result<(), Diagnostic> {
        if slot > 2 {
            return Err(Diagnostic::error(
                DiagKind::Emulator,
                SourcePos::new("<emulator>", 0, 0),
                format!("pack slot {slot} out of range (0-2)"),
            ));
        }
        let image = reader::parse_pack(opk_bytes)?;
        let declared = checksum::parse_opk_header(opk_bytes).unwrap_or(0);
        let data_block = &opk_bytes[6..6 + declared.min(opk_bytes.len() - 6)];
        let size = image.header.size_kb as usize * 1024;
        let writable = image.header.flags == crate::opk::records::PackType::Rampak as u8;
        self.bus.packs[slot].load_image(data_block, size, writable);
        debug!(slot, bytes = data_block.len(), "pack loaded");
        Ok(())
    }

    /// Slot payload access for host-side inspection.
    pub fn pack_bytes(&self, slot: usize) -> Option<&[u8]> {
        self.bus
            .packs
            .get(slot)
            .filter(|p| p.is_present())
            .map(|p| p.bytes())
    }

    pub fn reset(&mut self) {
        if self.headless() {
            // No vectors to come out of; wait for an injected program.
            self.cpu = Cpu::new();
            self.cpu.regs.sp = self.bus.memory.ram_top().saturating_sub(0x10);
        } else {
            let mut cpu = Cpu::new();
            cpu.reset(&mut self.bus);
            self.cpu = cpu;
        }
        self.exited = false;
        self.svc_row = 0;
        self.svc_col = 0;
        self.bus.switch_on();
        self.install_exit_stub();
    }

    /// Place machine code in RAM and aim the CPU at it. The stack gets a
    /// return address landing on the exit stub, so a final RTS ends the
    /// program cleanly.
    pub fn inject_program(&mut self, code: &[u8], entry: u16) {
        for (i, byte) in code.iter().enumerate() {
            self.bus.write(entry.wrapping_add(i as u16), *byte);
        }
        // Push the exit stub as the return address (SP points at the
        // last pushed byte).
        let sp = self.bus.memory.ram_top().saturating_sub(0x10).wrapping_sub(2);
        self.bus.write(sp, (EXIT_STUB >> 8) as u8);
        self.bus.write(sp.wrapping_add(1), EXIT_STUB as u8);
        self.cpu.regs.sp = sp;
        self.cpu.regs.pc = entry;
        self.exited = false;
    }

    // ========================================================================
    // Execution
    // ========================================================================

    pub fn add_breakpoint(&mut self, addr: u16) {
        self.breakpoints.insert(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u16) {
        self.breakpoints.remove(&addr);
    }

    pub fn cycles(&self) -> u64 {
        self.cpu.cycles
    }

    pub fn registers(&self) -> Registers {
        self.cpu.regs
    }

    pub fn tick_count(&self) -> u32 {
        self.bus.tick_count()
    }

    /// Run for at most `max_cycles`; returns the cycles actually run and
    /// why the loop stopped. Timeouts are a normal return, not an error.
    pub fn run(&mut self, max_cycles: u64) -> RunResult {
        let start = self.cpu.cycles;
        let mut first = true;
        loop {
            let elapsed = self.cpu.cycles - start;
            if elapsed >= max_cycles {
                return RunResult {
                    cycles: elapsed,
                    reason: StopReason::CyclesExhausted,
                };
            }
            if self.exited {
                return RunResult {
                    cycles: elapsed,
                    reason: StopReason::ProgramExit,
                };
            }
            self.release_due_taps();

            let pc = self.cpu.regs.pc;
            if !first && self.breakpoints.contains(&pc) {
                return RunResult {
                    cycles: elapsed,
                    reason: StopReason::Breakpoint(pc),
                };
            }
            first = false;

            if let Err(fault) = self.step_once() {
                return RunResult {
                    cycles: self.cpu.cycles - start,
                    reason: StopReason::Fault(fault),
                };
            }
        }
    }

    /// Single instruction (or service trap) step.
    pub fn step(&mut self) -> Result<(), CpuFault> {
        self.release_due_taps();
        self.step_once()
    }

    /// Run until the core idles on WAI/SLP (or exits), bounded by
    /// `max_cycles`.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> RunResult {
        let start = self.cpu.cycles;
        loop {
            if self.cpu.sleeping {
                return RunResult {
                    cycles: self.cpu.cycles - start,
                    reason: StopReason::Idle,
                };
            }
            let budget = max_cycles.saturating_sub(self.cpu.cycles - start);
            if budget == 0 {
                return RunResult {
                    cycles: self.cpu.cycles - start,
                    reason: StopReason::CyclesExhausted,
                };
            }
            let result = self.run(budget.min(1_000));
            match result.reason {
                StopReason::CyclesExhausted => continue,
                other => {
                    return RunResult {
                        cycles: self.cpu.cycles - start,
                        reason: other,
                    };
                }
            }
        }
    }

    fn step_once(&mut self) -> Result<(), CpuFault> {
        if self.headless() && self.bus.read(self.cpu.regs.pc) == 0x3F {
            self.dispatch_service();
            return Ok(());
        }
        self.cpu.step(&mut self.bus)?;
        Ok(())
    }

    /// Run until the rendered text contains `needle` or the budget runs
    /// out.
    pub fn run_until_text(&mut self, needle: &str, max_cycles: u64) -> bool {
        let start = self.cpu.cycles;
        while self.cpu.cycles - start < max_cycles {
            if self.display_text().join("\n").contains(needle) {
                return true;
            }
            if self.exited {
                return self.display_text().join("\n").contains(needle);
            }
            let result = self.run(2_000);
            match result.reason {
                StopReason::CyclesExhausted => continue,
                StopReason::ProgramExit => {
                    return self.display_text().join("\n").contains(needle)
                }
                _ => return false,
            }
        }
        self.display_text().join("\n").contains(needle)
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Hold a key down for `hold_cycles` CPU cycles, then release it.
    /// Also queues the key's code for the host service layer.
    pub fn tap_key(&mut self, key: &str, hold_cycles: u64) {
        if !Keyboard::is_known_key(key) {
            return;
        }
        self.bus.keyboard.key_down(key);
        self.taps.push(PendingTap {
            key: key.to_string(),
            release_at: self.cpu.cycles + hold_cycles.max(1),
        });
        self.key_queue.push_back(key_code(key));
    }

    pub fn type_text(&mut self, text: &str, hold_cycles: u64) {
        for c in text.chars() {
            self.tap_key(&c.to_string(), hold_cycles);
        }
    }

    pub fn press_key(&mut self, key: &str) {
        self.bus.keyboard.key_down(key);
        self.key_queue.push_back(key_code(key));
    }

    pub fn release_key(&mut self, key: &str) {
        self.bus.keyboard.key_up(key);
    }

    fn release_due_taps(&mut self) {
        let now = self.cpu.cycles;
        let mut released = Vec::new();
        self.taps.retain(|tap| {
            if tap.release_at <= now {
                released.push(tap.key.clone());
                false
            } else {
                true
            }
        });
        for key in released {
            self.bus.keyboard.key_up(&key);
        }
    }

    // ========================================================================
    // Output and memory access
    // ========================================================================

    pub fn display_text(&self) -> Vec<String> {
        self.bus.display.text_rows()
    }

    pub fn display_pixels(&self) -> (usize, usize, Vec<u8>) {
        self.bus.display.pixel_buffer()
    }

    pub fn render_display(&self, options: RenderOptions) -> (usize, usize, Vec<u8>) {
        self.bus.display.render_pixels(options)
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        self.bus.read(addr)
    }

    pub fn read_word(&mut self, addr: u16) -> u16 {
        let hi = self.bus.read(addr);
        let lo = self.bus.read(addr.wrapping_add(1));
        u16::from_be_bytes([hi, lo])
    }

    pub fn write_byte(&mut self, addr: u16, value: u8) {
        self.bus.write(addr, value);
    }

    pub fn write_bytes(&mut self, addr: u16, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.bus.write(addr.wrapping_add(i as u16), *byte);
        }
    }

    pub fn register_external(&mut self, name: &str, handler: ExternalHandler) {
        self.externals.register(name, handler);
    }

    // ========================================================================
    // Headless service dispatch
    // ========================================================================

    fn dispatch_service(&mut self) {
        let pc = self.cpu.regs.pc;
        let selector = self.bus.read(pc.wrapping_add(1));
        let mut advance = 2u16;

        match selector {
            svc::CLS => {
                self.bus.display.command(0x01);
                self.svc_row = 0;
                self.svc_col = 0;
            }
            svc::PUTC => {
                let b = self.cpu.regs.b;
                self.svc_putc(b);
            }
            svc::PUTS => {
                let mut addr = self.cpu.regs.x;
                loop {
                    let byte = self.bus.read(addr);
                    if byte == 0 {
                        break;
                    }
                    self.svc_putc(byte);
                    addr = addr.wrapping_add(1);
                }
            }
            svc::AT => {
                let rows = self.bus.display.rows();
                let cols = self.bus.display.cols();
                self.svc_row = (self.cpu.regs.a as usize).min(rows - 1);
                self.svc_col = (self.cpu.regs.b as usize).min(cols - 1);
            }
            svc::GETKEY => match self.key_queue.pop_front() {
                Some(code) => {
                    self.cpu.regs.a = 0;
                    self.cpu.regs.b = code;
                }
                None => {
                    // Busy-wait at the trap; taps may still be pending.
                    self.cpu.cycles += 12;
                    self.bus.inc_frame(12);
                    return;
                }
            },
            svc::TESTKEY => {
                let code = self.key_queue.pop_front().unwrap_or(0);
                self.cpu.regs.a = 0;
                self.cpu.regs.b = code;
            }
            svc::TICKS => {
                let ticks = self.bus.tick_count() as u16;
                self.cpu.set_d(ticks);
            }
            svc::PUTINT => {
                let value = self.cpu.d() as i16;
                for byte in value.to_string().bytes() {
                    self.svc_putc(byte);
                }
            }
            svc::PUTUINT => {
                let value = self.cpu.d();
                for byte in value.to_string().bytes() {
                    self.svc_putc(byte);
                }
            }
            svc::PUTHEX => {
                let value = self.cpu.d();
                for byte in format!("{value:04X}").bytes() {
                    self.svc_putc(byte);
                }
            }
            svc::EXTINIT => {}
            svc::EXTCALL => {
                let argc = self.bus.read(pc.wrapping_add(2)) as usize;
                let name_addr = {
                    let hi = self.bus.read(pc.wrapping_add(3));
                    let lo = self.bus.read(pc.wrapping_add(4));
                    u16::from_be_bytes([hi, lo])
                };
                let mut name = String::new();
                let mut addr = name_addr;
                loop {
                    let byte = self.bus.read(addr);
                    if byte == 0 || name.len() > 9 {
                        break;
                    }
                    name.push(byte as char);
                    addr = addr.wrapping_add(1);
                }
                let mut args = Vec::with_capacity(argc);
                for i in 0..argc {
                    let base = self.cpu.regs.x.wrapping_add(2 + 2 * i as u16);
                    let hi = self.bus.read(base);
                    let lo = self.bus.read(base.wrapping_add(1));
                    args.push(i16::from_be_bytes([hi, lo]));
                }
                let result = self.externals.call(&name, &args).unwrap_or(0);
                self.cpu.set_d(result as u16);
                advance = EXTCALL_TRAP_LEN;
            }
            svc::EXIT => {
                self.exited = true;
            }
            other => {
                debug!(selector = other, "unknown service selector ignored");
            }
        }

        self.cpu.regs.pc = pc.wrapping_add(advance);
        self.cpu.cycles += 12;
        self.bus.inc_frame(12);
    }

    fn svc_putc(&mut self, byte: u8) {
        let rows = self.bus.display.rows();
        let cols = self.bus.display.cols();
        if byte == b'\n' {
            self.svc_col = 0;
            self.svc_row = (self.svc_row + 1) % rows;
            return;
        }
        let addr = self.bus.display.ddram_addr(self.svc_row, self.svc_col);
        self.bus.display.command(0x06); // entry mode: increment
        self.bus.display.command(0x80 | addr);
        self.bus.display.set_data(byte);
        self.svc_col += 1;
        if self.svc_col >= cols {
            self.svc_col = 0;
            self.svc_row = (self.svc_row + 1) % rows;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::services::svc;
    use crate::models::MODEL_XP;

    fn emu_with(code: &[u8]) -> Emulator {
        let mut emu = Emulator::new(MODEL_XP);
        emu.inject_program(code, DEFAULT_LOAD_ADDR);
        emu
    }

    #[test]
    fn program_exit_through_final_rts() {
        let mut emu = emu_with(&[0x01, 0x39]); // NOP; RTS
        let result = emu.run(1_000);
        assert_eq!(result.reason, StopReason::ProgramExit);
    }

    #[test]
    fn cycle_budget_returns_normally() {
        // BRA self: spins forever.
        let mut emu = emu_with(&[0x20, 0xFE]);
        let result = emu.run(300);
        assert_eq!(result.reason, StopReason::CyclesExhausted);
        assert!(result.cycles >= 300);
    }

    #[test]
    fn service_text_output() {
        // LDX #msg; SWI PUTS; RTS; msg: "Hi",0
        let code = [
            0xCE, 0x20, 0x06, // LDX #$2006
            0x3F, svc::PUTS, // trap
            0x39, // RTS
            b'H', b'i', 0,
        ];
        let mut emu = emu_with(&code);
        let result = emu.run(10_000);
        assert_eq!(result.reason, StopReason::ProgramExit);
        assert_eq!(emu.display_text()[0].trim_end(), "Hi");
    }

    #[test]
    fn service_putint_formats_signed() {
        // LDD #-7 (0xFFF9); SWI PUTINT; RTS
        let code = [0xCC, 0xFF, 0xF9, 0x3F, svc::PUTINT, 0x39];
        let mut emu = emu_with(&code);
        emu.run(10_000);
        assert_eq!(emu.display_text()[0].trim_end(), "-7");
    }

    #[test]
    fn getkey_blocks_until_tap() {
        // SWI GETKEY; STAB $80; RTS
        let code = [0x3F, svc::GETKEY, 0xD7, 0x80, 0x39];
        let mut emu = emu_with(&code);
        let result = emu.run(2_000);
        assert_eq!(result.reason, StopReason::CyclesExhausted);
        emu.tap_key("Q", 500);
        let result = emu.run(50_000);
        assert_eq!(result.reason, StopReason::ProgramExit);
        assert_eq!(emu.read_byte(0x80), b'Q');
    }

    #[test]
    fn tap_releases_after_hold() {
        let mut emu = emu_with(&[0x20, 0xFE]); // spin
        emu.tap_key("A", 100);
        assert!(emu.bus.keyboard.is_key_down("A"));
        emu.run(500);
        assert!(!emu.bus.keyboard.is_key_down("A"));
    }

    #[test]
    fn external_call_marshalling() {
        // Mirrors the compiler's output: caller pushes the arguments
        // right-to-left and JSRs a stub that does TSX then traps.
        let code = [
            0xCC, 0x00, 0x20, 0x37, 0x36, // LDD #32; PSHB; PSHA
            0xCC, 0x00, 0x0A, 0x37, 0x36, // LDD #10; PSHB; PSHA
            0xBD, 0x20, 0x15, // JSR $2015 (stub)
            0x31, 0x31, 0x31, 0x31, // caller pops args
            0xDD, 0x90, // STD $90
            0x39, // RTS
            0x00, // pad so the stub lands at $2015
            // stub:
            0x30, // TSX
            0x3F, svc::EXTCALL, 2, 0x20, 0x1C, // trap, argc, name addr
            0x39, // RTS
            b'A', b'D', b'D', b'N', b'U', b'M', b'%', 0, // name at $201C
        ];
        let mut emu = emu_with(&code);
        emu.register_external("ADDNUM%", Box::new(|args| args[0] + args[1]));
        let result = emu.run(10_000);
        assert_eq!(result.reason, StopReason::ProgramExit);
        assert_eq!(
            u16::from_be_bytes([emu.read_byte(0x90), emu.read_byte(0x91)]),
            42
        );
    }

    #[test]
    fn breakpoint_stops_the_run() {
        let mut emu = emu_with(&[0x01, 0x01, 0x01, 0x39]);
        emu.add_breakpoint(DEFAULT_LOAD_ADDR + 2);
        let result = emu.run(1_000);
        assert_eq!(result.reason, StopReason::Breakpoint(DEFAULT_LOAD_ADDR + 2));
        // Resuming steps over the breakpoint.
        let result = emu.run(1_000);
        assert_eq!(result.reason, StopReason::ProgramExit);
    }

    #[test]
    fn run_until_text_sees_output() {
        let code = [
            0xCE, 0x20, 0x06, 0x3F, svc::PUTS, 0x39, b'O', b'K', 0,
        ];
        let mut emu = emu_with(&code);
        assert!(emu.run_until_text("OK", 100_000));
    }

    #[test]
    fn pack_loads_into_slot() {
        use crate::opk::builder::PackBuilder;
        use crate::opk::records::PackType;

        let mut builder = PackBuilder::new(8, PackType::Datapak).unwrap();
        builder
            .add_procedure("DEMO", vec![0x01, 0x39], Vec::new())
            .unwrap();
        let opk = builder.build().unwrap();

        let mut emu = Emulator::new(MODEL_XP);
        emu.load_pack(&opk, 0).unwrap();
        let bytes = emu.pack_bytes(0).unwrap();
        assert_eq!(bytes.len(), 8 * 1024);
        assert_eq!(bytes[0], PackType::Datapak as u8);
        assert!(emu.load_pack(&opk, 5).is_err());
    }
}
