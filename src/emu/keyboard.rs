// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Keyboard matrix controller.
//!
//! Keys sit on seven scan lines selected by a counter; port 5 returns
//! the combined, active-low state of the selected lines. ON/CLEAR is
//! wired separately to bit 7 and can wake the machine.

use std::collections::HashMap;

/// (line, mask, shift) per key name. Shift 1 means the symbol needs the
/// Psion shift key held; 0 and 2 do not.
fn key_grid(name: &str) -> Option<(i8, u8, u8)> {
    let entry = match name.to_ascii_uppercase().as_str() {
        "ON" | "CLEAR" | "ESC" | "ESCAPE" => (-1, 0x00, 2),
        "MODE" | "F1" => (0, 0x04, 2),
        "UP" => (0, 0x08, 2),
        "DOWN" => (0, 0x10, 2),
        "LEFT" => (0, 0x20, 2),
        "RIGHT" => (0, 0x40, 2),

        "A" => (1, 0x40, 0),
        "B" => (2, 0x40, 0),
        "C" => (3, 0x40, 0),
        "D" => (6, 0x40, 0),
        "E" => (4, 0x40, 0),
        "F" => (5, 0x40, 0),
        "G" => (1, 0x20, 0),
        "H" => (2, 0x20, 0),
        "I" => (3, 0x20, 0),
        "J" => (6, 0x20, 0),
        "K" => (4, 0x20, 0),
        "L" => (5, 0x20, 0),
        "M" => (1, 0x10, 0),
        "N" => (2, 0x10, 0),
        "O" => (3, 0x10, 0),
        "P" => (6, 0x10, 0),
        "Q" => (4, 0x10, 0),
        "R" => (5, 0x10, 0),
        "S" => (1, 0x08, 0),
        "T" => (2, 0x08, 0),
        "U" => (3, 0x08, 0),
        "V" => (6, 0x08, 0),
        "W" => (4, 0x08, 0),
        "X" => (5, 0x08, 0),
        "Y" => (3, 0x04, 0),
        "Z" => (6, 0x04, 0),

        "SHIFT" => (1, 0x04, 2),
        "DEL" | "DELETE" | "BACKSPACE" => (2, 0x04, 2),
        " " | "SPACE" => (4, 0x04, 2),
        "EXE" | "ENTER" | "RETURN" => (5, 0x04, 2),

        // Shifted symbols share letter positions.
        "<" => (1, 0x40, 1),
        ">" => (2, 0x40, 1),
        "(" => (3, 0x40, 1),
        ")" => (6, 0x40, 1),
        "%" => (4, 0x40, 1),
        "/" => (5, 0x40, 1),
        "=" => (1, 0x20, 1),
        "\"" => (2, 0x20, 1),
        "7" => (3, 0x20, 1),
        "8" => (6, 0x20, 1),
        "9" => (4, 0x20, 1),
        "*" => (5, 0x20, 1),
        "," => (1, 0x10, 1),
        "$" => (2, 0x10, 1),
        "4" => (3, 0x10, 1),
        "5" => (6, 0x10, 1),
        "6" => (4, 0x10, 1),
        "-" => (5, 0x10, 1),
        ";" => (1, 0x08, 1),
        ":" => (2, 0x08, 1),
        "1" => (3, 0x08, 1),
        "2" => (6, 0x08, 1),
        "3" => (4, 0x08, 1),
        "+" => (5, 0x08, 1),
        "0" => (3, 0x04, 1),
        "." => (6, 0x04, 1),
        _ => return None,
    };
    Some(entry)
}

#[derive(Debug, Clone)]
pub struct Keyboard {
    counter: u32,
    disabled: bool,
    key_lines: [u8; 8],
    on_pressed: bool,
    pressed: HashMap<String, (i8, u8)>,
    shift_held: usize,
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            counter: 0,
            disabled: false,
            key_lines: [0xFF; 8],
            on_pressed: false,
            pressed: HashMap::new(),
            shift_held: 0,
        }
    }

    pub fn is_known_key(name: &str) -> bool {
        key_grid(name).is_some()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn reset_counter(&mut self) {
        self.counter = 0;
    }

    pub fn increment_counter(&mut self) {
        self.counter += 1;
    }

    pub fn counter_overflowed(&self) -> bool {
        self.counter & 0x1000 != 0
    }

    pub fn is_on_pressed(&self) -> bool {
        !self.disabled && self.on_pressed
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
        self.key_lines = [0xFF; 8];
        self.on_pressed = false;
        self.shift_held = 0;
    }

    pub fn key_down(&mut self, name: &str) -> bool {
        let Some((line, mask, shift)) = key_grid(name) else {
            return false;
        };
        let key = name.to_ascii_uppercase();
        if self.pressed.contains_key(&key) {
            return true;
        }
        if shift == 1 {
            self.hold_shift();
        }
        if line < 0 {
            self.on_pressed = true;
            self.pressed.insert(key, (line, 0));
            return true;
        }
        self.key_lines[line as usize] &= !mask;
        self.pressed.insert(key, (line, mask));
        true
    }

    pub fn key_up(&mut self, name: &str) {
        let key = name.to_ascii_uppercase();
        let Some((line, mask)) = self.pressed.remove(&key) else {
            return;
        };
        if let Some((_, _, shift)) = key_grid(&key) {
            if shift == 1 {
                self.release_shift();
            }
        }
        if line < 0 {
            self.on_pressed = false;
            return;
        }
        // Only raise the line bit if no other pressed key shares it.
        let still_held = self
            .pressed
            .values()
            .any(|&(l, m)| l == line && m & mask != 0);
        if !still_held {
            self.key_lines[line as usize] |= mask;
        }
    }

    fn hold_shift(&mut self) {
        if self.shift_held == 0 {
            let (line, mask, _) = key_grid("SHIFT").unwrap();
            self.key_lines[line as usize] &= !mask;
        }
        self.shift_held += 1;
    }

    fn release_shift(&mut self) {
        self.shift_held = self.shift_held.saturating_sub(1);
        if self.shift_held == 0 {
            let (line, mask, _) = key_grid("SHIFT").unwrap();
            let someone = self
                .pressed
                .contains_key("SHIFT");
            if !someone {
                self.key_lines[line as usize] |= mask;
            }
        }
    }

    pub fn is_key_down(&self, name: &str) -> bool {
        self.pressed.contains_key(&name.to_ascii_uppercase())
    }

    /// Names of keys currently held, for the host service layer.
    pub fn held_keys(&self) -> Vec<String> {
        self.pressed.keys().cloned().collect()
    }

    /// Port 5: bits 2-6 carry the selected line state (0 = pressed),
    /// bit 1 the counter overflow, bit 7 ON/CLEAR.
    pub fn read_port5(&self) -> u8 {
        let mut result = 0x7C;
        if !self.disabled {
            for line in 0..7 {
                if self.counter & (1 << line) == 0 {
                    result &= self.key_lines[line];
                }
            }
            if self.on_pressed {
                result |= 0x80;
            }
        }
        if self.counter_overflowed() {
            result |= 0x02;
        }
        result
    }

    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn enable(&mut self) {
        self.disabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_down_clears_matrix_bit() {
        let mut kb = Keyboard::new();
        kb.key_down("A");
        // Line 1 selected (counter bit 1 clear selects every line when 0).
        kb.reset_counter();
        let port = kb.read_port5();
        assert_eq!(port & 0x40, 0, "A sits on bit 6 of its line");
        kb.key_up("A");
        assert_eq!(kb.read_port5() & 0x7C, 0x7C);
    }

    #[test]
    fn shifted_symbol_holds_shift_line() {
        let mut kb = Keyboard::new();
        kb.key_down("+");
        // SHIFT is line 1 mask 0x04.
        assert_eq!(kb.key_lines[1] & 0x04, 0);
        kb.key_up("+");
        assert_eq!(kb.key_lines[1] & 0x04, 0x04);
    }

    #[test]
    fn on_clear_reports_bit7() {
        let mut kb = Keyboard::new();
        kb.key_down("ON");
        assert!(kb.is_on_pressed());
        assert_eq!(kb.read_port5() & 0x80, 0x80);
        kb.key_up("ON");
        assert!(!kb.is_on_pressed());
    }

    #[test]
    fn counter_overflow_sets_bit1() {
        let mut kb = Keyboard::new();
        for _ in 0..0x1000 {
            kb.increment_counter();
        }
        assert!(kb.counter_overflowed());
        assert_eq!(kb.read_port5() & 0x02, 0x02);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut kb = Keyboard::new();
        assert!(!kb.key_down("F13"));
        assert!(Keyboard::is_known_key("EXE"));
        assert!(!Keyboard::is_known_key("WINDOWS"));
    }

    #[test]
    fn two_keys_on_one_line_release_independently() {
        let mut kb = Keyboard::new();
        kb.key_down("A"); // line 1, 0x40
        kb.key_down("G"); // line 1, 0x20
        kb.key_up("A");
        assert_eq!(kb.key_lines[1] & 0x20, 0, "G still held");
        assert_eq!(kb.key_lines[1] & 0x40, 0x40, "A released");
    }
}
