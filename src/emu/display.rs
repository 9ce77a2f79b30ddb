// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! LCD controller.
//!
//! HD44780-style character display: 2x16 on the small case, 4x20 on the
//! large one. 128 bytes of character DDRAM, 64 bytes of CGRAM holding
//! eight user-defined glyphs of 8 rows with 5 pixels in the low bits.
//! Commands arrive on the even register, data on the odd one.

use crate::emu::charset::glyph_rows;

pub const DISPLAY_RAM_SIZE: usize = 128;
pub const UDG_RAM_SIZE: usize = 64;

/// Render options for the pixel view.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub scale: usize,
    /// Blank pixels between LCD dots.
    pub pixel_gap: usize,
    /// Blank dot columns between character cells.
    pub char_gap: usize,
    /// Border around the whole panel, in scaled pixels.
    pub bezel: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale: 2,
            pixel_gap: 0,
            char_gap: 1,
            bezel: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Display {
    rows: usize,
    cols: usize,
    ddram: [u8; DISPLAY_RAM_SIZE],
    udg: [u8; UDG_RAM_SIZE],
    cursor_pos: u8,
    scr_ptr: u8,
    udg_ptr: u8,
    cursor_on: bool,
    addr_incr: bool,
    /// Data register writes target DDRAM (true) or CGRAM (false).
    ptr_to_screen: bool,
    is_on: bool,
    contrast: u8,
    screen2mem: Vec<u8>,
}

impl Display {
    pub fn new(rows: usize) -> Self {
        assert!(rows == 2 || rows == 4, "display is 2-line or 4-line");
        let cols = if rows == 4 { 20 } else { 16 };
        let screen2mem = build_screen_map(rows, cols);
        Self {
            rows,
            cols,
            ddram: [b' '; DISPLAY_RAM_SIZE],
            udg: [0; UDG_RAM_SIZE],
            cursor_pos: 0,
            scr_ptr: 0,
            udg_ptr: 0,
            cursor_on: true,
            addr_incr: false,
            ptr_to_screen: true,
            is_on: false,
            contrast: 5,
            screen2mem,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn switch_on(&mut self) {
        self.cursor_pos = 0;
        self.scr_ptr = 0;
        self.udg_ptr = 0;
        self.cursor_on = true;
        self.addr_incr = false;
        self.ptr_to_screen = true;
        self.is_on = true;
        self.ddram = [b' '; DISPLAY_RAM_SIZE];
        self.udg = [0; UDG_RAM_SIZE];
    }

    pub fn switch_off(&mut self) {
        self.is_on = false;
    }

    pub fn increase_contrast(&mut self) {
        self.contrast = (self.contrast + 1).min(10);
    }

    pub fn decrease_contrast(&mut self) {
        self.contrast = self.contrast.saturating_sub(1);
    }

    /// HD44780 command decode; highest set bit selects the command.
    pub fn command(&mut self, data: u8) {
        if data & 0x80 != 0 {
            // Set DDRAM address.
            if self.ptr_to_screen {
                self.cursor_pos = data & 0x7F;
                self.scr_ptr = data & 0x7F;
            }
            self.ptr_to_screen = true;
        } else if data & 0x40 != 0 {
            // Set CGRAM address: following data writes hit glyph RAM.
            self.udg_ptr = data & 0x3F;
            self.ptr_to_screen = false;
        } else if data & 0x20 != 0 {
            // Function set: bus width and line count are fixed here.
        } else if data & 0x10 != 0 {
            // Cursor/display shift.
            if data & 0x08 == 0 {
                if data & 0x04 != 0 {
                    self.cursor_pos = (self.cursor_pos + 1) & 0x7F;
                } else {
                    self.cursor_pos = self.cursor_pos.wrapping_sub(1) & 0x7F;
                }
            }
        } else if data & 0x08 != 0 {
            // Display on/off control.
            self.cursor_on = data & 0x04 != 0;
        } else if data & 0x04 != 0 {
            // Entry mode.
            self.addr_incr = data & 0x02 != 0;
        } else if data & 0x02 != 0 {
            // Return home.
            self.cursor_pos = 0;
        } else if data & 0x01 != 0 {
            // Clear.
            self.ddram = [b' '; DISPLAY_RAM_SIZE];
            self.cursor_pos = 0;
            self.scr_ptr = 0;
        }
    }

    pub fn set_data(&mut self, data: u8) {
        if self.ptr_to_screen {
            self.ddram[(self.scr_ptr & 0x7F) as usize] = data;
            if self.addr_incr {
                self.scr_ptr = self.scr_ptr.wrapping_add(1);
                // The 4-line panel folds address 40 onto the second bank.
                if self.rows == 4 && self.scr_ptr == 40 {
                    self.scr_ptr = 64;
                }
                self.scr_ptr &= 0x7F;
            }
        } else {
            self.udg[(self.udg_ptr & 0x3F) as usize] = data;
            self.udg_ptr = (self.udg_ptr + 1) & 0x3F;
        }
    }

    pub fn get_data(&mut self) -> u8 {
        if self.ptr_to_screen {
            let value = self.ddram[(self.scr_ptr & 0x7F) as usize];
            self.scr_ptr = (self.scr_ptr + 1) & 0x7F;
            value
        } else {
            let value = self.udg[(self.udg_ptr & 0x3F) as usize];
            self.udg_ptr = (self.udg_ptr + 1) & 0x3F;
            value
        }
    }

    // ========================================================================
    // Host-side views
    // ========================================================================

    /// DDRAM address of a screen position, for host-side writers.
    pub fn ddram_addr(&self, row: usize, col: usize) -> u8 {
        self.screen2mem[row * self.cols + col]
    }

    pub fn char_at(&self, row: usize, col: usize) -> u8 {
        let addr = self.ddram_addr(row, col);
        self.ddram[addr as usize]
    }

    /// Rendered text, one string per row; control codes become spaces.
    pub fn text_rows(&self) -> Vec<String> {
        if !self.is_on {
            return vec![String::new(); self.rows];
        }
        (0..self.rows)
            .map(|row| {
                (0..self.cols)
                    .map(|col| {
                        let code = self.char_at(row, col);
                        if (32..127).contains(&code) {
                            code as char
                        } else {
                            ' '
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Glyph bitmap for a character code: codes 0-7 read the UDG RAM.
    fn glyph(&self, code: u8) -> [u8; 8] {
        if code < 8 {
            let base = code as usize * 8;
            let mut rows = [0u8; 8];
            rows.copy_from_slice(&self.udg[base..base + 8]);
            rows
        } else {
            glyph_rows(code)
        }
    }

    /// One byte per pixel (0 or 1), row-major, 5x8 dots per cell.
    pub fn pixel_buffer(&self) -> (usize, usize, Vec<u8>) {
        let width = self.cols * 5;
        let height = self.rows * 8;
        let mut buffer = vec![0u8; width * height];
        if !self.is_on {
            return (width, height, buffer);
        }
        for row in 0..self.rows {
            for col in 0..self.cols {
                let rows = self.glyph(self.char_at(row, col));
                for (dy, bits) in rows.iter().enumerate() {
                    for dx in 0..5 {
                        if bits & (0x10 >> dx) != 0 {
                            let px = col * 5 + dx;
                            let py = row * 8 + dy;
                            buffer[py * width + px] = 1;
                        }
                    }
                }
            }
        }
        (width, height, buffer)
    }

    /// Scaled monochrome rendering with cell gaps and a bezel, one byte
    /// per pixel. Suitable for piping into an image encoder.
    pub fn render_pixels(&self, options: RenderOptions) -> (usize, usize, Vec<u8>) {
        let cell_w = 5 + options.char_gap;
        let dot = options.scale + options.pixel_gap;
        let width = (self.cols * cell_w) * dot + options.bezel * 2;
        let height = (self.rows * 9) * dot + options.bezel * 2;
        let mut out = vec![0u8; width * height];

        for row in 0..self.rows {
            for col in 0..self.cols {
                let rows = self.glyph(self.char_at(row, col));
                for (dy, bits) in rows.iter().enumerate() {
                    for dx in 0..5 {
                        if bits & (0x10 >> dx) == 0 {
                            continue;
                        }
                        let base_x = options.bezel + (col * cell_w + dx) * dot;
                        let base_y = options.bezel + (row * 9 + dy) * dot;
                        for sy in 0..options.scale {
                            for sx in 0..options.scale {
                                let px = base_x + sx;
                                let py = base_y + sy;
                                if px < width && py < height {
                                    out[py * width + px] = 0xFF;
                                }
                            }
                        }
                    }
                }
            }
        }
        (width, height, out)
    }
}

fn build_screen_map(rows: usize, cols: usize) -> Vec<u8> {
    // HD44780 DDRAM banks: line pairs live at 0x00 and 0x40; the 4-line
    // panel interleaves rows 2/3 after the first twenty cells.
    let starts: &[u8] = if rows == 4 {
        &[0x00, 0x40, 0x14, 0x54]
    } else {
        &[0x00, 0x40]
    };
    let mut map = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            map.push(starts[row] + col as u8);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_text(display: &mut Display, text: &str) {
        display.command(0x06); // entry mode: increment
        display.command(0x80); // DDRAM address 0
        for byte in text.bytes() {
            display.set_data(byte);
        }
    }

    #[test]
    fn text_lands_on_row_zero() {
        let mut display = Display::new(2);
        display.switch_on();
        write_text(&mut display, "Hello, Psion!");
        let rows = display.text_rows();
        assert_eq!(rows[0], "Hello, Psion!   ");
        assert_eq!(rows[1], "                ");
    }

    #[test]
    fn second_row_uses_bank_at_64() {
        let mut display = Display::new(2);
        display.switch_on();
        display.command(0x06);
        display.command(0x80 | 64);
        for byte in b"Row two" {
            display.set_data(*byte);
        }
        assert_eq!(display.text_rows()[1].trim_end(), "Row two");
    }

    #[test]
    fn clear_blanks_the_panel() {
        let mut display = Display::new(2);
        display.switch_on();
        write_text(&mut display, "junk");
        display.command(0x01);
        assert_eq!(display.text_rows()[0].trim_end(), "");
    }

    #[test]
    fn four_line_geometry() {
        let mut display = Display::new(4);
        display.switch_on();
        assert_eq!(display.cols(), 20);
        display.command(0x06);
        display.command(0x80 | 0x14);
        display.set_data(b'X');
        assert_eq!(display.char_at(2, 0), b'X');
    }

    #[test]
    fn udg_writes_go_to_glyph_ram() {
        let mut display = Display::new(2);
        display.switch_on();
        display.command(0x40); // CGRAM address 0
        for value in [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F, 0x00] {
            display.set_data(value);
        }
        // Character 0 now renders the box glyph.
        display.command(0x80);
        display.set_data(0);
        let (w, _, pixels) = display.pixel_buffer();
        // Top row of the first cell is all on.
        for dx in 0..5 {
            assert_eq!(pixels[dx], 1, "dot {dx}");
        }
        assert_eq!(pixels[w + 1], 0, "row 1 interior off");
    }

    #[test]
    fn data_writes_return_to_screen_after_address_set() {
        let mut display = Display::new(2);
        display.switch_on();
        display.command(0x40); // CGRAM
        display.set_data(0xAA);
        display.command(0x80); // back to DDRAM
        display.set_data(b'A');
        assert_eq!(display.char_at(0, 0), b'A');
    }

    #[test]
    fn off_display_renders_blank() {
        let display = Display::new(2);
        assert_eq!(display.text_rows(), vec![String::new(), String::new()]);
        let (_, _, pixels) = display.pixel_buffer();
        assert!(pixels.iter().all(|&p| p == 0));
    }

    #[test]
    fn render_respects_scale_and_bezel() {
        let mut display = Display::new(2);
        display.switch_on();
        let options = RenderOptions {
            scale: 3,
            pixel_gap: 1,
            char_gap: 1,
            bezel: 2,
        };
        let (w, h, _) = display.render_pixels(options);
        assert_eq!(w, 16 * 6 * 4 + 4);
        assert_eq!(h, 2 * 9 * 4 + 4);
    }
}
