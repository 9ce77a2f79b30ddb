// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Cross-development toolchain for the Psion Organiser II.
//!
//! The pipeline runs C source through the Small-C front end into HD6303
//! assembly, through the two-pass assembler into an OB3 object, into an
//! OPK pack image, and finally into the cycle-accurate emulator:
//!
//! ```text
//! C --> asm text --> object bytes (+ fixups) --> pack record --> pack
//!                                  |                               |
//!                                  +---- raw / proc forms          +--> emulator slot
//! ```

pub mod asm;
pub mod cc;
pub mod core;
pub mod driver;
pub mod emu;
pub mod models;
pub mod opk;
pub mod report;
