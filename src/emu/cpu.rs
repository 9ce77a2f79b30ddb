// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! HD6303 interpreter core.
//!
//! Registers, flag logic and cycle counts follow the Hitachi data sheet;
//! cycle values agree with the assembler's opcode table so the two sides
//! of the toolchain can be cross-checked. Interrupts are sampled only at
//! instruction boundaries. TSX transfers SP to X exactly (the older 6800
//! added one; the HD6303 does not).

use crate::emu::bus::BusAccess;

pub const VEC_TRAP: u16 = 0xFFEE;
pub const VEC_SWI: u16 = 0xFFFA;
pub const VEC_OCI: u16 = 0xFFF4;
pub const VEC_NMI: u16 = 0xFFFC;
pub const VEC_RESET: u16 = 0xFFFE;

mod flag {
    pub const C: u8 = 0x01;
    pub const V: u8 = 0x02;
    pub const Z: u8 = 0x04;
    pub const N: u8 = 0x08;
    pub const I: u8 = 0x10;
    pub const H: u8 = 0x20;
    /// The two top bits always read as one.
    pub const RESERVED: u8 = 0xC0;
}

/// Faults that stop the fetch/decode/execute loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFault {
    IllegalOpcode { pc: u16, opcode: u8 },
    /// SP wandered outside any plausible RAM region.
    StackError { sp: u16 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub a: u8,
    pub b: u8,
    pub x: u16,
    pub sp: u16,
    pub pc: u16,
    pub flags: u8,
}

/// The CPU proper. The bus is passed into each step so one emulator owns
/// both without self-reference.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub regs: Registers,
    pub sleeping: bool,
    pub cycles: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers {
                flags: 0xFF,
                ..Registers::default()
            },
            sleeping: false,
            cycles: 0,
        }
    }

    pub fn d(&self) -> u16 {
        ((self.regs.a as u16) << 8) | self.regs.b as u16
    }

    pub fn set_d(&mut self, value: u16) {
        self.regs.a = (value >> 8) as u8;
        self.regs.b = value as u8;
    }

    fn flag(&self, bit: u8) -> bool {
        self.regs.flags & bit != 0
    }

    fn set_flag(&mut self, bit: u8, value: bool) {
        if value {
            self.regs.flags |= bit;
        } else {
            self.regs.flags &= !bit;
        }
    }

    pub fn flag_c(&self) -> bool {
        self.flag(flag::C)
    }

    pub fn flag_v(&self) -> bool {
        self.flag(flag::V)
    }

    pub fn flag_z(&self) -> bool {
        self.flag(flag::Z)
    }

    pub fn flag_n(&self) -> bool {
        self.flag(flag::N)
    }

    pub fn flag_i(&self) -> bool {
        self.flag(flag::I)
    }

    pub fn flag_h(&self) -> bool {
        self.flag(flag::H)
    }

    fn ccr(&self) -> u8 {
        self.regs.flags | flag::RESERVED
    }

    fn set_ccr(&mut self, value: u8) {
        self.regs.flags = value | flag::RESERVED;
    }

    /// Load PC from the reset vector and restore power-on state.
    pub fn reset(&mut self, bus: &mut dyn BusAccess) {
        self.regs.pc = self.read_word(bus, VEC_RESET);
        self.regs.sp = 0;
        self.regs.x = 0;
        self.set_d(0);
        self.regs.flags = 0xFF;
        self.sleeping = false;
    }

    // ========================================================================
    // Memory helpers
    // ========================================================================

    fn read_byte(&self, bus: &mut dyn BusAccess, addr: u16) -> u8 {
        bus.read(addr)
    }

    fn write_byte(&self, bus: &mut dyn BusAccess, addr: u16, value: u8) {
        bus.write(addr, value);
    }

    fn read_word(&self, bus: &mut dyn BusAccess, addr: u16) -> u16 {
        let hi = bus.read(addr);
        let lo = bus.read(addr.wrapping_add(1));
        u16::from_be_bytes([hi, lo])
    }

    fn write_word(&self, bus: &mut dyn BusAccess, addr: u16, value: u16) {
        bus.write(addr, (value >> 8) as u8);
        bus.write(addr.wrapping_add(1), value as u8);
    }

    // SP points at the last pushed byte: pre-decrement push,
    // post-increment pop.

    fn push_byte(&mut self, bus: &mut dyn BusAccess, value: u8) {
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write(self.regs.sp, value);
    }

    fn pop_byte(&mut self, bus: &mut dyn BusAccess) -> u8 {
        let value = bus.read(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        value
    }

    fn push_word(&mut self, bus: &mut dyn BusAccess, value: u16) {
        self.push_byte(bus, value as u8);
        self.push_byte(bus, (value >> 8) as u8);
    }

    fn pop_word(&mut self, bus: &mut dyn BusAccess) -> u16 {
        let hi = self.pop_byte(bus);
        let lo = self.pop_byte(bus);
        u16::from_be_bytes([hi, lo])
    }

    fn fetch_byte(&mut self, bus: &mut dyn BusAccess) -> u8 {
        let value = bus.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, bus: &mut dyn BusAccess) -> u16 {
        let hi = self.fetch_byte(bus);
        let lo = self.fetch_byte(bus);
        u16::from_be_bytes([hi, lo])
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Push the full frame (PC, X, A, B, CCR) and vector. 12 cycles with
    /// the fetch that recognized the interrupt.
    pub fn interrupt(&mut self, bus: &mut dyn BusAccess, vector: u16) -> u8 {
        self.push_word(bus, self.regs.pc);
        self.push_word(bus, self.regs.x);
        self.push_byte(bus, self.regs.a);
        self.push_byte(bus, self.regs.b);
        let ccr = self.ccr();
        self.push_byte(bus, ccr);
        self.set_flag(flag::I, true);
        self.regs.pc = self.read_word(bus, vector);
        12
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    /// Execute one instruction (or service a pending interrupt) and
    /// return the cycles consumed.
    pub fn step(&mut self, bus: &mut dyn BusAccess) -> Result<u8, CpuFault> {
        let mut ticks: u8 = 0;

        if bus.nmi_due() {
            ticks += self.interrupt(bus, VEC_NMI);
            self.sleeping = false;
        }
        if bus.oci_due() && !self.flag_i() {
            ticks += self.interrupt(bus, VEC_OCI);
            self.sleeping = false;
        }

        let sp = self.regs.sp;
        if (sp > 0 && sp < 0x00E0) || (0x0100..0x0400).contains(&sp) || sp > 0x8000 {
            return Err(CpuFault::StackError { sp });
        }

        if self.sleeping || bus.switched_off() {
            // Idle burns one cycle per step so timers keep advancing.
            ticks += 1;
            self.cycles += ticks as u64;
            bus.inc_frame(ticks as u32);
            return Ok(ticks);
        }

        let pc = self.regs.pc;
        let opcode = self.fetch_byte(bus);
        let consumed = self.execute_instruction(bus, opcode).map_err(|fault| {
            // Leave PC at the offending instruction for reporting.
            self.regs.pc = pc;
            fault
        })?;
        ticks += consumed;
        self.cycles += ticks as u64;
        bus.inc_frame(ticks as u32);
        Ok(ticks)
    }

    fn illegal(&self, opcode: u8) -> Result<u8, CpuFault> {
        Err(CpuFault::IllegalOpcode {
            pc: self.regs.pc.wrapping_sub(1),
            opcode,
        })
    }

    fn branch(&mut self, bus: &mut dyn BusAccess, take: bool) -> u8 {
        let disp = self.fetch_byte(bus) as i8;
        if take {
            self.regs.pc = self.regs.pc.wrapping_add(disp as i16 as u16);
        }
        3
    }

    /// Execute a decoded opcode; returns total documented cycles.
    fn execute_instruction(&mut self, bus: &mut dyn BusAccess, opcode: u8) -> Result<u8, CpuFault> {
        match opcode {
            // Control
            0x00 => Ok(self.interrupt(bus, VEC_TRAP)),
            0x01 => Ok(1), // NOP
            0x04 => {
                // LSRD
                let value = self.d();
                let c = value & 1 != 0;
                let result = value >> 1;
                self.set_flag(flag::C, c);
                self.set_flag(flag::V, c);
                self.set_flag(flag::N, false);
                self.set_flag(flag::Z, result == 0);
                self.set_d(result);
                Ok(1)
            }
            0x05 => {
                // ASLD
                let result = self.asl16(self.d());
                self.set_d(result);
                Ok(1)
            }
            0x06 => {
                let a = self.regs.a;
                self.set_ccr(a);
                Ok(1)
            }
            0x07 => {
                self.regs.a = self.ccr();
                Ok(1)
            }
            0x08 => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.set_flag(flag::Z, self.regs.x == 0);
                Ok(1)
            }
            0x09 => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.set_flag(flag::Z, self.regs.x == 0);
                Ok(1)
            }
            0x0A => {
                self.set_flag(flag::V, false);
                Ok(1)
            }
            0x0B => {
                self.set_flag(flag::V, true);
                Ok(1)
            }
            0x0C => {
                self.set_flag(flag::C, false);
                Ok(1)
            }
            0x0D => {
                self.set_flag(flag::C, true);
                Ok(1)
            }
            0x0E => {
                self.set_flag(flag::I, false);
                Ok(1)
            }
            0x0F => {
                self.set_flag(flag::I, true);
                Ok(1)
            }

            // Register transfers
            0x10 => {
                self.regs.a = self.sub8(self.regs.a, self.regs.b);
                Ok(1)
            }
            0x11 => {
                self.sub8(self.regs.a, self.regs.b);
                Ok(1)
            }
            0x16 => {
                self.regs.b = self.ld8(self.regs.a);
                Ok(1)
            }
            0x17 => {
                self.regs.a = self.ld8(self.regs.b);
                Ok(1)
            }
            0x18 => {
                // XGDX
                let tmp = self.regs.x;
                self.regs.x = self.d();
                self.set_d(tmp);
                Ok(2)
            }
            0x19 => {
                self.daa();
                Ok(2)
            }
            0x1A => {
                // SLP
                self.sleeping = true;
                Ok(4)
            }
            0x1B => {
                self.regs.a = self.add8(self.regs.a, self.regs.b);
                Ok(1)
            }

            // Branches
            0x20 => Ok(self.branch(bus, true)),
            0x21 => Ok(self.branch(bus, false)),
            0x22 => {
                let take = !self.flag_c() && !self.flag_z();
                Ok(self.branch(bus, take))
            }
            0x23 => {
                let take = self.flag_c() || self.flag_z();
                Ok(self.branch(bus, take))
            }
            0x24 => {
                let take = !self.flag_c();
                Ok(self.branch(bus, take))
            }
            0x25 => {
                let take = self.flag_c();
                Ok(self.branch(bus, take))
            }
            0x26 => {
                let take = !self.flag_z();
                Ok(self.branch(bus, take))
            }
            0x27 => {
                let take = self.flag_z();
                Ok(self.branch(bus, take))
            }
            0x28 => {
                let take = !self.flag_v();
                Ok(self.branch(bus, take))
            }
            0x29 => {
                let take = self.flag_v();
                Ok(self.branch(bus, take))
            }
            0x2A => {
                let take = !self.flag_n();
                Ok(self.branch(bus, take))
            }
            0x2B => {
                let take = self.flag_n();
                Ok(self.branch(bus, take))
            }
            0x2C => {
                let take = self.flag_n() == self.flag_v();
                Ok(self.branch(bus, take))
            }
            0x2D => {
                let take = self.flag_n() != self.flag_v();
                Ok(self.branch(bus, take))
            }
            0x2E => {
                let take = self.flag_n() == self.flag_v() && !self.flag_z();
                Ok(self.branch(bus, take))
            }
            0x2F => {
                let take = self.flag_n() != self.flag_v() || self.flag_z();
                Ok(self.branch(bus, take))
            }

            // Stack and index
            0x30 => {
                self.regs.x = self.regs.sp;
                Ok(1)
            }
            0x31 => {
                self.regs.sp = self.regs.sp.wrapping_add(1);
                Ok(1)
            }
            0x32 => {
                self.regs.a = self.pop_byte(bus);
                Ok(3)
            }
            0x33 => {
                self.regs.b = self.pop_byte(bus);
                Ok(3)
            }
            0x34 => {
                self.regs.sp = self.regs.sp.wrapping_sub(1);
                Ok(1)
            }
            0x35 => {
                self.regs.sp = self.regs.x;
                Ok(1)
            }
            0x36 => {
                let a = self.regs.a;
                self.push_byte(bus, a);
                Ok(4)
            }
            0x37 => {
                let b = self.regs.b;
                self.push_byte(bus, b);
                Ok(4)
            }
            0x38 => {
                self.regs.x = self.pop_word(bus);
                Ok(4)
            }
            0x39 => {
                self.regs.pc = self.pop_word(bus);
                Ok(5)
            }
            0x3A => {
                self.regs.x = self.regs.x.wrapping_add(self.regs.b as u16);
                Ok(1)
            }
            0x3B => {
                // RTI
                let ccr = self.pop_byte(bus);
                self.set_ccr(ccr);
                self.regs.b = self.pop_byte(bus);
                self.regs.a = self.pop_byte(bus);
                self.regs.x = self.pop_word(bus);
                self.regs.pc = self.pop_word(bus);
                Ok(10)
            }
            0x3C => {
                let x = self.regs.x;
                self.push_word(bus, x);
                Ok(5)
            }
            0x3D => {
                // MUL: D = A * B, C from bit 7 of B for rounding
                let product = self.regs.a as u16 * self.regs.b as u16;
                self.set_flag(flag::C, self.regs.b & 0x80 != 0);
                self.set_d(product);
                Ok(7)
            }
            0x3E => {
                // WAI: stall until an interrupt wakes the core.
                self.sleeping = true;
                Ok(9)
            }
            0x3F => Ok(self.interrupt(bus, VEC_SWI)),

            // Accumulator A inherent
            0x40 => {
                self.regs.a = self.neg8(self.regs.a);
                Ok(1)
            }
            0x43 => {
                self.regs.a = self.com8(self.regs.a);
                Ok(1)
            }
            0x44 => {
                self.regs.a = self.lsr8(self.regs.a);
                Ok(1)
            }
            0x46 => {
                self.regs.a = self.ror8(self.regs.a);
                Ok(1)
            }
            0x47 => {
                self.regs.a = self.asr8(self.regs.a);
                Ok(1)
            }
            0x48 => {
                self.regs.a = self.asl8(self.regs.a);
                Ok(1)
            }
            0x49 => {
                self.regs.a = self.rol8(self.regs.a);
                Ok(1)
            }
            0x4A => {
                self.regs.a = self.dec8(self.regs.a);
                Ok(1)
            }
            0x4C => {
                self.regs.a = self.inc8(self.regs.a);
                Ok(1)
            }
            0x4D => {
                self.tst8(self.regs.a);
                Ok(1)
            }
            0x4F => {
                self.regs.a = self.clr8();
                Ok(1)
            }

            // Accumulator B inherent
            0x50 => {
                self.regs.b = self.neg8(self.regs.b);
                Ok(1)
            }
            0x53 => {
                self.regs.b = self.com8(self.regs.b);
                Ok(1)
            }
            0x54 => {
                self.regs.b = self.lsr8(self.regs.b);
                Ok(1)
            }
            0x56 => {
                self.regs.b = self.ror8(self.regs.b);
                Ok(1)
            }
            0x57 => {
                self.regs.b = self.asr8(self.regs.b);
                Ok(1)
            }
            0x58 => {
                self.regs.b = self.asl8(self.regs.b);
                Ok(1)
            }
            0x59 => {
                self.regs.b = self.rol8(self.regs.b);
                Ok(1)
            }
            0x5A => {
                self.regs.b = self.dec8(self.regs.b);
                Ok(1)
            }
            0x5C => {
                self.regs.b = self.inc8(self.regs.b);
                Ok(1)
            }
            0x5D => {
                self.tst8(self.regs.b);
                Ok(1)
            }
            0x5F => {
                self.regs.b = self.clr8();
                Ok(1)
            }

            // Indexed and extended read-modify-write, plus the HD6303
            // memory-immediate bit operations.
            0x60..=0x7F => self.exec_rmw(bus, opcode),

            // ALU groups
            0x80..=0xFF => self.exec_alu(bus, opcode),

            _ => self.illegal(opcode),
        }
    }

    fn exec_rmw(&mut self, bus: &mut dyn BusAccess, opcode: u8) -> Result<u8, CpuFault> {
        let indexed = opcode < 0x70;
        // The bit operations take the immediate mask before the address.
        let is_bit_op = matches!(opcode & 0x0F, 0x01 | 0x02 | 0x05 | 0x0B);
        let imm = if is_bit_op {
            Some(self.fetch_byte(bus))
        } else {
            None
        };
        let addr = if indexed {
            self.regs.x.wrapping_add(self.fetch_byte(bus) as u16)
        } else if is_bit_op {
            // Direct page for AIM/OIM/EIM/TIM in the 0x70 block.
            self.fetch_byte(bus) as u16
        } else {
            self.fetch_word(bus)
        };

        match opcode & 0x0F {
            0x00 => {
                let value = self.read_byte(bus, addr);
                let result = self.neg8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x01 => {
                let value = self.read_byte(bus, addr);
                let result = self.and8(imm.unwrap_or(0), value);
                self.write_byte(bus, addr, result);
                Ok(if indexed { 7 } else { 6 })
            }
            0x02 => {
                let value = self.read_byte(bus, addr);
                let result = self.or8(imm.unwrap_or(0), value);
                self.write_byte(bus, addr, result);
                Ok(if indexed { 7 } else { 6 })
            }
            0x03 => {
                let value = self.read_byte(bus, addr);
                let result = self.com8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x04 => {
                let value = self.read_byte(bus, addr);
                let result = self.lsr8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x05 => {
                let value = self.read_byte(bus, addr);
                let result = self.eor8(imm.unwrap_or(0), value);
                self.write_byte(bus, addr, result);
                Ok(if indexed { 7 } else { 6 })
            }
            0x06 => {
                let value = self.read_byte(bus, addr);
                let result = self.ror8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x07 => {
                let value = self.read_byte(bus, addr);
                let result = self.asr8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x08 => {
                let value = self.read_byte(bus, addr);
                let result = self.asl8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x09 => {
                let value = self.read_byte(bus, addr);
                let result = self.rol8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x0A => {
                let value = self.read_byte(bus, addr);
                let result = self.dec8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x0B => {
                // TIM: test only, no write-back.
                let value = self.read_byte(bus, addr);
                self.and8(imm.unwrap_or(0), value);
                Ok(if indexed { 5 } else { 4 })
            }
            0x0C => {
                let value = self.read_byte(bus, addr);
                let result = self.inc8(value);
                self.write_byte(bus, addr, result);
                Ok(6)
            }
            0x0D => {
                let value = self.read_byte(bus, addr);
                self.tst8(value);
                Ok(4)
            }
            0x0E => {
                self.regs.pc = addr;
                Ok(3)
            }
            0x0F => {
                let result = self.clr8();
                self.write_byte(bus, addr, result);
                Ok(5)
            }
            _ => unreachable!(),
        }
    }

    /// The four-mode ALU block, accumulator A at 0x80-0xBF and B at
    /// 0xC0-0xFF, with the 16-bit and index-register rows folded in.
    fn exec_alu(&mut self, bus: &mut dyn BusAccess, opcode: u8) -> Result<u8, CpuFault> {
        let acc_b = opcode >= 0xC0;
        let mode = (opcode >> 4) & 0x03; // 0 imm, 1 dir, 2 idx, 3 ext
        let op = opcode & 0x0F;

        // Effective address for non-immediate modes.
        let addr = |cpu: &mut Self, bus: &mut dyn BusAccess| -> u16 {
            match mode {
                1 => cpu.fetch_byte(bus) as u16,
                2 => cpu.regs.x.wrapping_add(cpu.fetch_byte(bus) as u16),
                _ => cpu.fetch_word(bus),
            }
        };
        let operand8 = |cpu: &mut Self, bus: &mut dyn BusAccess| -> u8 {
            if mode == 0 {
                cpu.fetch_byte(bus)
            } else {
                let a = addr(cpu, bus);
                cpu.read_byte(bus, a)
            }
        };
        let operand16 = |cpu: &mut Self, bus: &mut dyn BusAccess| -> u16 {
            if mode == 0 {
                cpu.fetch_word(bus)
            } else {
                let a = addr(cpu, bus);
                cpu.read_word(bus, a)
            }
        };
        let cycles8 = [2u8, 3, 4, 4][mode as usize];
        let cycles16 = [3u8, 4, 5, 5][mode as usize];

        match op {
            0x00 => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.sub8(self.regs.b, m)
                } else {
                    self.sub8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x01 => {
                let m = operand8(self, bus);
                if acc_b {
                    self.sub8(self.regs.b, m);
                } else {
                    self.sub8(self.regs.a, m);
                }
                Ok(cycles8)
            }
            0x02 => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.sbc8(self.regs.b, m)
                } else {
                    self.sbc8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x03 => {
                // SUBD / ADDD
                let m = operand16(self, bus);
                let d = self.d();
                let r = if acc_b { self.add16(d, m) } else { self.sub16(d, m) };
                self.set_d(r);
                Ok(cycles16)
            }
            0x04 => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.and8(self.regs.b, m)
                } else {
                    self.and8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x05 => {
                let m = operand8(self, bus);
                if acc_b {
                    self.and8(self.regs.b, m);
                } else {
                    self.and8(self.regs.a, m);
                }
                Ok(cycles8)
            }
            0x06 => {
                let m = operand8(self, bus);
                let r = self.ld8(m);
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x07 => {
                // STA has no immediate form; 0x87/0xC7 are unassigned.
                if mode == 0 {
                    return self.illegal(opcode);
                }
                let a = addr(self, bus);
                let value = if acc_b { self.regs.b } else { self.regs.a };
                self.ld8(value);
                self.write_byte(bus, a, value);
                Ok([0u8, 3, 4, 4][mode as usize])
            }
            0x08 => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.eor8(self.regs.b, m)
                } else {
                    self.eor8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x09 => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.adc8(self.regs.b, m)
                } else {
                    self.adc8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x0A => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.or8(self.regs.b, m)
                } else {
                    self.or8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x0B => {
                let m = operand8(self, bus);
                let r = if acc_b {
                    self.add8(self.regs.b, m)
                } else {
                    self.add8(self.regs.a, m)
                };
                if acc_b {
                    self.regs.b = r;
                } else {
                    self.regs.a = r;
                }
                Ok(cycles8)
            }
            0x0C => {
                // CPX on the A side, LDD on the B side.
                let m = operand16(self, bus);
                if acc_b {
                    let r = self.ld16(m);
                    self.set_d(r);
                } else {
                    let x = self.regs.x;
                    self.sub16(x, m);
                }
                Ok(cycles16)
            }
            0x0D => {
                if acc_b {
                    // STD; 0xCD is unassigned.
                    if mode == 0 {
                        return self.illegal(opcode);
                    }
                    let a = addr(self, bus);
                    let d = self.d();
                    self.ld16(d);
                    self.write_word(bus, a, d);
                    Ok([0u8, 4, 5, 5][mode as usize])
                } else {
                    // BSR (immediate row) or JSR.
                    match mode {
                        0 => {
                            let disp = self.fetch_byte(bus) as i8;
                            let pc = self.regs.pc;
                            self.push_word(bus, pc);
                            self.regs.pc = pc.wrapping_add(disp as i16 as u16);
                            Ok(5)
                        }
                        _ => {
                            let a = addr(self, bus);
                            let pc = self.regs.pc;
                            self.push_word(bus, pc);
                            self.regs.pc = a;
                            Ok([0u8, 5, 5, 6][mode as usize])
                        }
                    }
                }
            }
            0x0E => {
                // LDS on the A side, LDX on the B side.
                let m = operand16(self, bus);
                let r = self.ld16(m);
                if acc_b {
                    self.regs.x = r;
                } else {
                    self.regs.sp = r;
                }
                Ok(cycles16)
            }
            0x0F => {
                // STS on the A side, STX on the B side; no immediate form.
                if mode == 0 {
                    return self.illegal(opcode);
                }
                let a = addr(self, bus);
                let value = if acc_b { self.regs.x } else { self.regs.sp };
                self.ld16(value);
                self.write_word(bus, a, value);
                Ok([0u8, 4, 5, 5][mode as usize])
            }
            _ => unreachable!(),
        }
    }

    // ========================================================================
    // ALU flag helpers
    // ========================================================================

    fn ld8(&mut self, value: u8) -> u8 {
        self.set_flag(flag::N, value & 0x80 != 0);
        self.set_flag(flag::Z, value == 0);
        self.set_flag(flag::V, false);
        value
    }

    fn ld16(&mut self, value: u16) -> u16 {
        self.set_flag(flag::N, value & 0x8000 != 0);
        self.set_flag(flag::Z, value == 0);
        self.set_flag(flag::V, false);
        value
    }

    fn add8(&mut self, a: u8, b: u8) -> u8 {
        let result = a as u16 + b as u16;
        self.set_flag(flag::H, (a & 0x0F) + (b & 0x0F) >= 0x10);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result & 0xFF == 0);
        self.set_flag(flag::C, result & 0x100 != 0);
        self.set_flag(flag::V, (a ^ !b) & (a ^ result as u8) & 0x80 != 0);
        result as u8
    }

    fn adc8(&mut self, a: u8, b: u8) -> u8 {
        let c = self.flag_c() as u16;
        let result = a as u16 + b as u16 + c;
        self.set_flag(flag::H, (a & 0x0F) as u16 + (b & 0x0F) as u16 + c >= 0x10);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result & 0xFF == 0);
        self.set_flag(flag::C, result & 0x100 != 0);
        self.set_flag(flag::V, (a ^ !b) & (a ^ result as u8) & 0x80 != 0);
        result as u8
    }

    fn sub8(&mut self, a: u8, b: u8) -> u8 {
        let result = (a as i16 - b as i16) as u16;
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result & 0xFF == 0);
        self.set_flag(flag::C, result & 0x100 != 0);
        self.set_flag(flag::V, (a ^ b) & (a ^ result as u8) & 0x80 != 0);
        result as u8
    }

    fn sbc8(&mut self, a: u8, b: u8) -> u8 {
        let b2 = b as i16 + self.flag_c() as i16;
        let result = (a as i16 - b2) as u16;
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result & 0xFF == 0);
        self.set_flag(flag::C, result & 0x100 != 0);
        self.set_flag(flag::V, (a as i16 ^ b2) as u8 & (a ^ result as u8) & 0x80 != 0);
        result as u8
    }

    fn add16(&mut self, a: u16, b: u16) -> u16 {
        let result = a as u32 + b as u32;
        self.set_flag(flag::N, result & 0x8000 != 0);
        self.set_flag(flag::Z, result & 0xFFFF == 0);
        self.set_flag(flag::C, result & 0x1_0000 != 0);
        self.set_flag(
            flag::V,
            (a ^ !b) & (a ^ result as u16) & 0x8000 != 0,
        );
        result as u16
    }

    fn sub16(&mut self, a: u16, b: u16) -> u16 {
        let result = (a as i32 - b as i32) as u32;
        self.set_flag(flag::N, result & 0x8000 != 0);
        self.set_flag(flag::Z, result & 0xFFFF == 0);
        self.set_flag(flag::C, result & 0x1_0000 != 0);
        self.set_flag(
            flag::V,
            (a ^ b) & (a ^ result as u16) & 0x8000 != 0,
        );
        result as u16
    }

    fn neg8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_neg();
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::C, result != 0);
        self.set_flag(flag::V, result == 0x80);
        result
    }

    fn com8(&mut self, value: u8) -> u8 {
        let result = !value;
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::V, false);
        self.set_flag(flag::C, true);
        result
    }

    fn lsr8(&mut self, value: u8) -> u8 {
        let c = value & 1 != 0;
        let result = value >> 1;
        self.set_flag(flag::C, c);
        self.set_flag(flag::V, c);
        self.set_flag(flag::N, false);
        self.set_flag(flag::Z, result == 0);
        result
    }

    fn ror8(&mut self, value: u8) -> u8 {
        let c = value & 1 != 0;
        let n = self.flag_c();
        let mut result = value >> 1;
        if n {
            result |= 0x80;
        }
        self.set_flag(flag::C, c);
        self.set_flag(flag::N, n);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::V, n != c);
        result
    }

    fn asr8(&mut self, value: u8) -> u8 {
        let c = value & 1 != 0;
        let msb = value & 0x80;
        let n = msb != 0;
        let result = (value >> 1) | msb;
        self.set_flag(flag::C, c);
        self.set_flag(flag::N, n);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::V, n != c);
        result
    }

    fn asl8(&mut self, value: u8) -> u8 {
        let c = value & 0x80 != 0;
        let result = value << 1;
        let n = result & 0x80 != 0;
        self.set_flag(flag::N, n);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::C, c);
        self.set_flag(flag::V, n != c);
        result
    }

    fn asl16(&mut self, value: u16) -> u16 {
        let c = value & 0x8000 != 0;
        let result = value << 1;
        let n = result & 0x8000 != 0;
        self.set_flag(flag::N, n);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::C, c);
        self.set_flag(flag::V, n != c);
        result
    }

    fn rol8(&mut self, value: u8) -> u8 {
        let c = value & 0x80 != 0;
        let mut result = value << 1;
        if self.flag_c() {
            result |= 1;
        }
        let n = result & 0x80 != 0;
        self.set_flag(flag::C, c);
        self.set_flag(flag::N, n);
        self.set_flag(flag::Z, result == 0);
        self.set_flag(flag::V, n != c);
        result
    }

    fn dec8(&mut self, value: u8) -> u8 {
        // INC/DEC leave carry untouched.
        self.set_flag(flag::V, value == 0x80);
        let result = value.wrapping_sub(1);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        result
    }

    fn inc8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.set_flag(flag::V, result == 0x80);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        result
    }

    fn tst8(&mut self, value: u8) {
        self.set_flag(flag::V, false);
        self.set_flag(flag::C, false);
        self.set_flag(flag::N, value & 0x80 != 0);
        self.set_flag(flag::Z, value == 0);
    }

    fn clr8(&mut self) -> u8 {
        self.set_flag(flag::V, false);
        self.set_flag(flag::C, false);
        self.set_flag(flag::N, false);
        self.set_flag(flag::Z, true);
        0
    }

    fn and8(&mut self, a: u8, b: u8) -> u8 {
        let result = a & b;
        self.set_flag(flag::V, false);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        result
    }

    fn or8(&mut self, a: u8, b: u8) -> u8 {
        let result = a | b;
        self.set_flag(flag::V, false);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        result
    }

    fn eor8(&mut self, a: u8, b: u8) -> u8 {
        let result = a ^ b;
        self.set_flag(flag::V, false);
        self.set_flag(flag::N, result & 0x80 != 0);
        self.set_flag(flag::Z, result == 0);
        result
    }

    fn daa(&mut self) {
        let mut ans = self.regs.a as u16;
        if self.flag_h() {
            ans += 0x06;
        }
        if ans & 0x0F > 0x09 {
            ans += 0x06;
        }
        if self.flag_c() {
            ans += 0x60;
        }
        if ans > 0x9F {
            ans += 0x60;
        }
        if ans > 0x99 {
            self.set_flag(flag::C, true);
        }
        self.set_flag(flag::N, ans & 0x80 != 0);
        self.set_flag(flag::Z, ans & 0xFF == 0);
        self.set_flag(flag::V, (self.regs.a as u16 ^ ans) & 0x80 != 0);
        self.regs.a = ans as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::bus::BusAccess;

    /// Flat 64 KiB test bus with no peripherals or interrupts.
    struct FlatBus {
        mem: Vec<u8>,
    }

    impl FlatBus {
        fn new() -> Self {
            Self {
                mem: vec![0; 0x10000],
            }
        }

        fn load(&mut self, addr: u16, bytes: &[u8]) {
            let addr = addr as usize;
            self.mem[addr..addr + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl BusAccess for FlatBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, value: u8) {
            self.mem[addr as usize] = value;
        }

        fn nmi_due(&mut self) -> bool {
            false
        }

        fn oci_due(&mut self) -> bool {
            false
        }

        fn inc_frame(&mut self, _ticks: u32) {}

        fn switched_off(&self) -> bool {
            false
        }
    }

    fn run_program(code: &[u8]) -> (Cpu, FlatBus) {
        let mut bus = FlatBus::new();
        bus.load(0x2000, code);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.regs.flags = flag::RESERVED | flag::I;
        let end = 0x2000 + code.len() as u16;
        for _ in 0..10_000 {
            if cpu.regs.pc >= end {
                break;
            }
            cpu.step(&mut bus).expect("no fault");
        }
        (cpu, bus)
    }

    #[test]
    fn lda_sta_round_trip() {
        let (cpu, bus) = {
            let mut bus = FlatBus::new();
            bus.load(0x2000, &[0x86, 0x41, 0x97, 0x80]); // LDAA #$41; STAA $80
            let mut cpu = Cpu::new();
            cpu.regs.pc = 0x2000;
            cpu.regs.sp = 0x7F00;
            cpu.step(&mut bus).unwrap();
            cpu.step(&mut bus).unwrap();
            (cpu, bus)
        };
        assert_eq!(cpu.regs.a, 0x41);
        assert_eq!(bus.mem[0x80], 0x41);
    }

    #[test]
    fn cycle_counts_match_the_opcode_table() {
        use crate::asm::opcodes::{lookup, AddrMode};

        let cases: &[(&str, AddrMode, Vec<u8>)] = &[
            ("NOP", AddrMode::Inherent, vec![0x01]),
            ("LDAA", AddrMode::Immediate, vec![0x86, 0x12]),
            ("LDAA", AddrMode::Direct, vec![0x96, 0x80]),
            ("LDAA", AddrMode::Indexed, vec![0xA6, 0x05]),
            ("LDAA", AddrMode::Extended, vec![0xB6, 0x12, 0x34]),
            ("LDD", AddrMode::Immediate, vec![0xCC, 0x12, 0x34]),
            ("ADDD", AddrMode::Extended, vec![0xF3, 0x12, 0x34]),
            ("MUL", AddrMode::Inherent, vec![0x3D]),
            ("XGDX", AddrMode::Inherent, vec![0x18]),
            ("PSHA", AddrMode::Inherent, vec![0x36]),
            ("PULX", AddrMode::Inherent, vec![0x38]),
            ("JMP", AddrMode::Extended, vec![0x7E, 0x20, 0x10]),
            ("JSR", AddrMode::Extended, vec![0xBD, 0x20, 0x10]),
            ("BRA", AddrMode::Relative, vec![0x20, 0x02]),
            ("AIM", AddrMode::Direct, vec![0x71, 0x0F, 0x80]),
            ("TIM", AddrMode::Indexed, vec![0x6B, 0x0F, 0x05]),
            ("CLR", AddrMode::Extended, vec![0x7F, 0x30, 0x00]),
        ];
        for (mnemonic, mode, code) in cases {
            let mut bus = FlatBus::new();
            bus.load(0x2000, code);
            let mut cpu = Cpu::new();
            cpu.regs.pc = 0x2000;
            cpu.regs.sp = 0x7F00;
            cpu.regs.flags = flag::RESERVED | flag::I;
            let ticks = cpu.step(&mut bus).unwrap();
            let expected = lookup(mnemonic, *mode).unwrap().cycles;
            assert_eq!(ticks, expected, "{mnemonic} {mode}");
        }
    }

    #[test]
    fn tsx_is_exact_sp() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x30]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7EF0;
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.x, 0x7EF0);
    }

    #[test]
    fn inc_dec_preserve_carry() {
        let (cpu, _) = run_program(&[0x0D, 0x4C, 0x4A]); // SEC; INCA; DECA
        assert!(cpu.flag_c());
        let (cpu, _) = run_program(&[0x0C, 0x4C]); // CLC; INCA
        assert!(!cpu.flag_c());
    }

    #[test]
    fn ld_clears_v_and_keeps_c() {
        let (cpu, _) = run_program(&[0x0D, 0x0B, 0x86, 0x00]); // SEC; SEV; LDAA #0
        assert!(cpu.flag_c());
        assert!(!cpu.flag_v());
        assert!(cpu.flag_z());
    }

    #[test]
    fn clr_clears_nvc_and_sets_z() {
        let (cpu, _) = run_program(&[0x0D, 0x4F]); // SEC; CLRA
        assert!(!cpu.flag_c());
        assert!(!cpu.flag_v());
        assert!(!cpu.flag_n());
        assert!(cpu.flag_z());
        assert_eq!(cpu.regs.a, 0);
    }

    #[test]
    fn mul_produces_16_bit_product() {
        let (cpu, _) = run_program(&[0x86, 0x12, 0xC6, 0x34, 0x3D]); // LDAA;LDAB;MUL
        assert_eq!(cpu.d(), 0x12u16 * 0x34);
    }

    #[test]
    fn xgdx_swaps_d_and_x() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x18]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.set_d(0x1234);
        cpu.regs.x = 0x5678;
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.d(), 0x5678);
        assert_eq!(cpu.regs.x, 0x1234);
    }

    #[test]
    fn jsr_rts_round_trip() {
        let mut bus = FlatBus::new();
        // JSR $2010; NOP ... at $2010: RTS
        bus.load(0x2000, &[0xBD, 0x20, 0x10, 0x01]);
        bus.load(0x2010, &[0x39]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.pc, 0x2010);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.pc, 0x2003);
        assert_eq!(cpu.regs.sp, 0x7F00);
    }

    #[test]
    fn swi_pushes_frame_and_vectors() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x3F]);
        bus.load(VEC_SWI, &[0x30, 0x00]); // vector -> $3000
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.regs.a = 0xAA;
        cpu.regs.b = 0xBB;
        cpu.regs.x = 0x1234;
        let ticks = cpu.step(&mut bus).unwrap();
        assert_eq!(ticks, 12);
        assert_eq!(cpu.regs.pc, 0x3000);
        assert!(cpu.flag_i());
        // Frame: PC, X, A, B, CCR pushed in that order; SP points at the
        // last pushed byte.
        assert_eq!(bus.mem[0x7EFF], 0x01); // PC low (after SWI byte)
        assert_eq!(bus.mem[0x7EFE], 0x20); // PC high
        assert_eq!(bus.mem[0x7EFD], 0x34);
        assert_eq!(bus.mem[0x7EFC], 0x12);
        assert_eq!(bus.mem[0x7EFB], 0xAA);
        assert_eq!(bus.mem[0x7EFA], 0xBB);
        assert_eq!(cpu.regs.sp, 0x7EF9);
    }

    #[test]
    fn rti_restores_frame() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x3F]); // SWI
        bus.load(VEC_SWI, &[0x30, 0x00]);
        bus.load(0x3000, &[0x3B]); // RTI
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.regs.a = 0x11;
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.pc, 0x2001);
        assert_eq!(cpu.regs.a, 0x11);
        assert_eq!(cpu.regs.sp, 0x7F00);
    }

    #[test]
    fn aim_oim_eim_tim_semantics() {
        let mut bus = FlatBus::new();
        bus.mem[0x80] = 0b1111_0000;
        // AIM #$3C,$80 ; OIM #$01,$80 ; EIM #$FF,$80 ; TIM #$0F,$80
        bus.load(
            0x2000,
            &[0x71, 0x3C, 0x80, 0x72, 0x01, 0x80, 0x75, 0xFF, 0x80, 0x7B, 0x0F, 0x80],
        );
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.mem[0x80], 0b0011_0000);
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.mem[0x80], 0b0011_0001);
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.mem[0x80], 0b1100_1110);
        // TIM leaves memory alone and only sets flags.
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.mem[0x80], 0b1100_1110);
        assert!(!cpu.flag_z()); // 0x0F & 0xCE = 0x0E
    }

    #[test]
    fn carry_preserved_by_bit_ops() {
        let mut bus = FlatBus::new();
        bus.mem[0x80] = 0x0F;
        bus.load(0x2000, &[0x0D, 0x71, 0xF0, 0x80]); // SEC; AIM #$F0,$80
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert!(cpu.flag_c());
    }

    #[test]
    fn illegal_opcode_reports_pc() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x02]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        let fault = cpu.step(&mut bus).unwrap_err();
        assert_eq!(
            fault,
            CpuFault::IllegalOpcode {
                pc: 0x2000,
                opcode: 0x02
            }
        );
    }

    #[test]
    fn stack_error_detected() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x01]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x0200;
        assert!(matches!(
            cpu.step(&mut bus),
            Err(CpuFault::StackError { sp: 0x0200 })
        ));
    }

    #[test]
    fn cycles_are_monotonic() {
        let mut bus = FlatBus::new();
        bus.load(0x2000, &[0x01, 0x86, 0x05, 0x36, 0x32]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x2000;
        cpu.regs.sp = 0x7F00;
        let mut last = cpu.cycles;
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
            assert!(cpu.cycles > last);
            last = cpu.cycles;
        }
    }

    #[test]
    fn char_add_boundary_values() {
        // ADDA over the signed/unsigned boundary values used by the
        // compiler's 8-bit arithmetic.
        for (a, b, sum, carry) in [
            (0x00u8, 0x00u8, 0x00u8, false),
            (0x01, 0x7F, 0x80, false),
            (0x80, 0x80, 0x00, true),
            (0xFF, 0x01, 0x00, true),
            (0x7F, 0x01, 0x80, false),
        ] {
            let mut bus = FlatBus::new();
            bus.load(0x2000, &[0x8B, b]); // ADDA #b
            let mut cpu = Cpu::new();
            cpu.regs.pc = 0x2000;
            cpu.regs.sp = 0x7F00;
            cpu.regs.a = a;
            cpu.step(&mut bus).unwrap();
            assert_eq!(cpu.regs.a, sum, "{a:#x}+{b:#x}");
            assert_eq!(cpu.flag_c(), carry, "carry {a:#x}+{b:#x}");
            assert_eq!(cpu.flag_z(), sum == 0);
        }
    }

    #[test]
    fn illegal_store_immediate_forms() {
        for opcode in [0x87u8, 0xC7, 0xCD, 0x8F, 0xCF] {
            let mut bus = FlatBus::new();
            bus.load(0x2000, &[opcode]);
            let mut cpu = Cpu::new();
            cpu.regs.pc = 0x2000;
            cpu.regs.sp = 0x7F00;
            assert!(cpu.step(&mut bus).is_err(), "{opcode:#x}");
        }
    }
}
