// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Pack slot hardware.
//!
//! A pack is addressed serially: the OS pulses the control lines on port
//! 6 while the slot's counter tracks the current address, and data moves
//! over port 2. The counter resets on master-reset and advances on each
//! clock toggle; reads deliver the byte under the counter. Rampaks are
//! writable outright, Datapaks only with the 21V programming supply up.

/// Pack control pin assignments as seen by the slot.
pub mod pin {
    /// Serial clock; the address advances on a toggle.
    pub const SCLK: u8 = 0x01;
    /// Master reset; resets the counter while high.
    pub const SMR: u8 = 0x02;
    /// Program pulse, active low.
    pub const SPGM_B: u8 = 0x04;
    /// Output enable, active low; enables reads.
    pub const SOE_B: u8 = 0x08;
    /// Programming-voltage select.
    pub const SVPP: u8 = 0x10;
    /// 21V supply is charged.
    pub const V21V: u8 = 0x20;
    /// Port 2 has input bits (data bus turned around).
    pub const P2DDR: u8 = 0x40;
}

#[derive(Debug, Clone)]
pub struct PackSlot {
    data: Vec<u8>,
    addr: usize,
    prev_pins: u8,
    writable: bool,
}

impl Default for PackSlot {
    fn default() -> Self {
        Self::empty()
    }
}

impl PackSlot {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            addr: 0,
            prev_pins: 0,
            writable: false,
        }
    }

    /// Install a pack data block, padded with erased bytes to the pack's
    /// full size so directory scans run off the end into $FF.
    pub fn load_image(&mut self, data_block: &[u8], size_bytes: usize, writable: bool) {
        let mut data = data_block.to_vec();
        data.resize(size_bytes.max(data_block.len()), 0xFF);
        self.data = data;
        self.addr = 0;
        self.writable = writable;
    }

    pub fn eject(&mut self) {
        self.data.clear();
        self.addr = 0;
    }

    pub fn is_present(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn address(&self) -> usize {
        self.addr
    }

    /// Direct host-side view of the pack bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.addr = 0;
    }

    /// Drive the control lines; returns true when a byte was written.
    pub fn write_control_port(&mut self, pins: u8, databus: u8) -> bool {
        if !self.is_present() {
            self.prev_pins = pins;
            return false;
        }

        if pins & pin::SMR != 0 {
            self.addr = 0;
        } else if (pins ^ self.prev_pins) & pin::SCLK != 0 {
            self.addr = (self.addr + 1) % self.data.len();
        }

        let mut wrote = false;
        // A write needs the bus driving outward, output disabled, and a
        // program pulse; EPROM packs additionally need the 21V rail.
        let programming = pins & pin::SOE_B != 0
            && pins & pin::P2DDR == 0
            && pins & pin::SPGM_B == 0;
        if programming {
            let powered = self.writable || (pins & pin::SVPP != 0 && pins & pin::V21V != 0);
            if powered {
                self.data[self.addr] = databus;
                wrote = true;
            }
        }

        self.prev_pins = pins;
        wrote
    }

    pub fn read_data_bus(&self) -> u8 {
        if !self.is_present() || self.prev_pins & pin::SOE_B != 0 {
            return 0;
        }
        self.data[self.addr]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_slot() -> PackSlot {
        let mut slot = PackSlot::empty();
        slot.load_image(&[0x10, 0x20, 0x30], 8, false);
        slot
    }

    #[test]
    fn image_is_padded_with_erased_bytes() {
        let slot = loaded_slot();
        assert_eq!(slot.size(), 8);
        assert_eq!(slot.bytes()[3], 0xFF);
    }

    #[test]
    fn counter_advances_on_clock_toggle() {
        let mut slot = loaded_slot();
        slot.write_control_port(pin::SMR, 0); // reset
        assert_eq!(slot.address(), 0);
        slot.write_control_port(0, 0);
        assert_eq!(slot.read_data_bus(), 0x10);
        slot.write_control_port(pin::SCLK, 0);
        assert_eq!(slot.read_data_bus(), 0x20);
        slot.write_control_port(0, 0); // toggle back also counts
        assert_eq!(slot.read_data_bus(), 0x30);
    }

    #[test]
    fn output_enable_gates_reads() {
        let mut slot = loaded_slot();
        slot.write_control_port(pin::SOE_B, 0);
        assert_eq!(slot.read_data_bus(), 0);
    }

    #[test]
    fn rampak_writes_without_programming_voltage() {
        let mut slot = PackSlot::empty();
        slot.load_image(&[0x00], 4, true);
        let wrote = slot.write_control_port(pin::SOE_B, 0x5A);
        // SPGM_B is active low: low means pulse.
        assert!(wrote);
        slot.write_control_port(0, 0); // release, advance not relevant
        slot.write_control_port(pin::SMR, 0);
        slot.write_control_port(0, 0);
        assert_eq!(slot.read_data_bus(), 0x5A);
    }

    #[test]
    fn datapak_needs_21v() {
        let mut slot = loaded_slot();
        assert!(!slot.write_control_port(pin::SOE_B, 0xAA));
        assert!(slot.write_control_port(pin::SOE_B | pin::SVPP | pin::V21V, 0xAA));
    }

    #[test]
    fn empty_slot_is_inert() {
        let mut slot = PackSlot::empty();
        assert!(!slot.write_control_port(pin::SCLK, 0x12));
        assert_eq!(slot.read_data_bus(), 0);
    }
}
