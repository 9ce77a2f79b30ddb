// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Host service layer for ROM-less operation.
//!
//! When no ROM image is installed, the emulator dispatches the selector
//! byte that follows each SWI to these services instead of vectoring
//! through $FFFA. With a real ROM loaded the ROM's own vector table is
//! used and this layer stays out of the way. The compiler's runtime
//! library calls these selectors.

use std::collections::HashMap;

/// Service selector values, one byte after the trap instruction.
pub mod svc {
    /// Clear the display and home the cursor.
    pub const CLS: u8 = 0x01;
    /// Write the character in B at the cursor.
    pub const PUTC: u8 = 0x02;
    /// Write the zero-terminated string at X.
    pub const PUTS: u8 = 0x03;
    /// Move the cursor to row A, column B.
    pub const AT: u8 = 0x04;
    /// Block until a key arrives; key code in B, A cleared.
    pub const GETKEY: u8 = 0x05;
    /// Non-blocking key poll; B = code or 0.
    pub const TESTKEY: u8 = 0x06;
    /// Free-running tick counter in D.
    pub const TICKS: u8 = 0x07;
    /// Write D as signed decimal.
    pub const PUTINT: u8 = 0x08;
    /// Write D as unsigned decimal.
    pub const PUTUINT: u8 = 0x09;
    /// Write D as four hex digits.
    pub const PUTHEX: u8 = 0x0A;
    /// Prepare the external-procedure interface. One-shot, idempotent.
    pub const EXTINIT: u8 = 0x10;
    /// Call a named external procedure; layout documented below.
    pub const EXTCALL: u8 = 0x11;
    /// Terminate the program; the emulator's run loop returns.
    pub const EXIT: u8 = 0x7F;
}

/// `EXTCALL` trap layout: `SWI`, selector, argument count, 16-bit
/// address of the zero-terminated procedure name. Arguments are read
/// through X, which the stub points at its own frame before trapping:
/// arg *i* lives at `X + 2 + 2*i`. The result is returned in D.
pub const EXTCALL_TRAP_LEN: u16 = 5;

/// Host implementation of an on-device procedure.
pub type ExternalHandler = Box<dyn FnMut(&[i16]) -> i16>;

/// Named external procedures registered with the emulator. Names carry
/// the on-device return-type suffix (`%` integer, `$` string, none for
/// void).
#[derive(Default)]
pub struct ExternalRegistry {
    handlers: HashMap<String, ExternalHandler>,
}

impl ExternalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: ExternalHandler) {
        self.handlers.insert(name.to_ascii_uppercase(), handler);
    }

    pub fn call(&mut self, name: &str, args: &[i16]) -> Option<i16> {
        self.handlers
            .get_mut(&name.to_ascii_uppercase())
            .map(|handler| handler(args))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_uppercase())
    }
}

/// Key code delivered to programs for a named key.
pub fn key_code(name: &str) -> u8 {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "EXE" | "ENTER" | "RETURN" => 13,
        "DEL" | "DELETE" | "BACKSPACE" => 8,
        "ON" | "CLEAR" | "ESC" | "ESCAPE" => 27,
        "MODE" | "F1" => 14,
        "UP" => 5,
        "DOWN" => 6,
        "LEFT" => 2,
        "RIGHT" => 3,
        "SPACE" => 32,
        _ => upper.bytes().next().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_by_suffixed_name() {
        let mut registry = ExternalRegistry::new();
        registry.register("ADDNUM%", Box::new(|args| args[0] + args[1]));
        assert!(registry.contains("addnum%"));
        assert_eq!(registry.call("ADDNUM%", &[10, 32]), Some(42));
        assert_eq!(registry.call("MISSING%", &[]), None);
    }

    #[test]
    fn key_codes_for_named_keys() {
        assert_eq!(key_code("EXE"), 13);
        assert_eq!(key_code("Q"), b'Q');
        assert_eq!(key_code("+"), b'+');
        assert_eq!(key_code("ON"), 27);
    }
}
