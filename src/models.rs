// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Target model table for the Organiser II family.
//!
//! Four shipping configurations differ in RAM size and display
//! geometry; the compiler, assembler and emulator all select behaviour
//! from this table.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelCode {
    Cm,
    Xp16,
    Xp32,
    Lz,
    Lz64,
}

/// Hardware description of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Model {
    pub code: ModelCode,
    pub name: &'static str,
    pub ram_kb: u32,
    pub display_rows: u8,
    pub display_cols: u8,
    /// Identification byte the ROM exposes at $FFE8.
    pub model_byte: u8,
}

impl Model {
    pub fn is_four_line(&self) -> bool {
        self.display_rows == 4
    }

    /// Preprocessor symbol naming this model (`__PSION_XP__` etc.).
    pub fn cpp_symbol(&self) -> &'static str {
        match self.code {
            ModelCode::Cm => "__PSION_CM__",
            ModelCode::Xp16 | ModelCode::Xp32 => "__PSION_XP__",
            ModelCode::Lz => "__PSION_LZ__",
            ModelCode::Lz64 => "__PSION_LZ64__",
        }
    }

    /// Short code used in CLI flags and `.MODEL` directives.
    pub fn short_code(&self) -> &'static str {
        match self.code {
            ModelCode::Cm => "CM",
            ModelCode::Xp16 => "XP16",
            ModelCode::Xp32 => "XP",
            ModelCode::Lz => "LZ",
            ModelCode::Lz64 => "LZ64",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub const MODEL_CM: Model = Model {
    code: ModelCode::Cm,
    name: "CM (8K)",
    ram_kb: 8,
    display_rows: 2,
    display_cols: 16,
    model_byte: 0x00,
};

pub const MODEL_XP16: Model = Model {
    code: ModelCode::Xp16,
    name: "XP (16K)",
    ram_kb: 16,
    display_rows: 2,
    display_cols: 16,
    model_byte: 0x01,
};

pub const MODEL_XP: Model = Model {
    code: ModelCode::Xp32,
    name: "XP (32K)",
    ram_kb: 32,
    display_rows: 2,
    display_cols: 16,
    model_byte: 0x02,
};

pub const MODEL_LZ: Model = Model {
    code: ModelCode::Lz,
    name: "LZ (32K)",
    ram_kb: 32,
    display_rows: 4,
    display_cols: 20,
    model_byte: 0x0E,
};

pub const MODEL_LZ64: Model = Model {
    code: ModelCode::Lz64,
    name: "LZ64 (64K)",
    ram_kb: 64,
    display_rows: 4,
    display_cols: 20,
    model_byte: 0x0D,
};

pub const ALL_MODELS: &[Model] = &[MODEL_CM, MODEL_XP16, MODEL_XP, MODEL_LZ, MODEL_LZ64];

pub const DEFAULT_MODEL: Model = MODEL_XP;

/// Resolve a model code string from the CLI or a `.MODEL` directive.
///
/// `LA` is the later name of the 32K XP board and maps onto it.
pub fn lookup(code: &str) -> Option<Model> {
    match code.trim().to_ascii_uppercase().as_str() {
        "CM" => Some(MODEL_CM),
        "XP16" => Some(MODEL_XP16),
        "XP" | "XP32" | "LA" => Some(MODEL_XP),
        "LZ" | "LZ32" => Some(MODEL_LZ),
        "LZ64" => Some(MODEL_LZ64),
        "" | "DEFAULT" => Some(DEFAULT_MODEL),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_accepts_aliases() {
        assert_eq!(lookup("xp").unwrap().code, ModelCode::Xp32);
        assert_eq!(lookup("LA").unwrap().code, ModelCode::Xp32);
        assert_eq!(lookup("lz32").unwrap().code, ModelCode::Lz);
        assert!(lookup("QL").is_none());
    }

    #[test]
    fn geometry_matches_family() {
        for model in ALL_MODELS {
            if model.is_four_line() {
                assert_eq!(model.display_cols, 20);
            } else {
                assert_eq!(model.display_cols, 16);
            }
        }
    }
}
