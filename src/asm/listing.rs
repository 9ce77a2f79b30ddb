// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Listing file generation.

use std::io::Write;

use crate::asm::assembler::{Assembly, SymbolKind};

/// Writer for listing output over any sink.
pub struct ListingWriter<W: Write> {
    out: W,
}

impl<W: Write> ListingWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write(&mut self, assembly: &Assembly, title: &str) -> std::io::Result<()> {
        writeln!(self.out, "{title}")?;
        writeln!(self.out, "ADDR  BYTES                    LINE  SOURCE")?;
        writeln!(self.out, "----  -----------------------  ----  ------")?;

        for row in &assembly.listing_rows {
            // Long data runs wrap at eight bytes per listing line.
            for (i, chunk) in row.bytes.chunks(8).enumerate() {
                let addr = row.addr.wrapping_add((i * 8) as u16);
                if i == 0 {
                    writeln!(
                        self.out,
                        "{:04X}  {:<23}  {:>4}  {}",
                        addr,
                        format_bytes(chunk),
                        row.pos.line,
                        row.source.trim_end()
                    )?;
                } else {
                    writeln!(self.out, "{:04X}  {}", addr, format_bytes(chunk))?;
                }
            }
        }

        writeln!(self.out)?;
        writeln!(self.out, "SYMBOL TABLE")?;
        writeln!(self.out)?;
        let mut symbols: Vec<_> = assembly
            .symbols
            .iter()
            .filter(|s| s.kind != SymbolKind::External)
            .collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        for symbol in symbols {
            writeln!(
                self.out,
                "{:<20} = ${:04X}  {}",
                symbol.name,
                symbol.value as u16,
                kind_name(symbol.kind)
            )?;
        }
        writeln!(self.out)?;
        writeln!(self.out, "Total memory is {} bytes", assembly.code.len())?;
        Ok(())
    }
}

fn kind_name(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::CodeLabel => "code",
        SymbolKind::DataLabel => "data",
        SymbolKind::Equate => "equ",
        SymbolKind::SetVariable => "set",
        SymbolKind::External => "ext",
    }
}

/// Format bytes as spaced hex for listing columns.
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Convenience: render a whole listing to a string.
pub fn render_listing(assembly: &Assembly, title: &str) -> String {
    let mut out = Vec::new();
    ListingWriter::new(&mut out)
        .write(assembly, title)
        .expect("writing to a Vec cannot fail");
    String::from_utf8(out).expect("listing is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assembler::{assemble, AsmOptions};

    #[test]
    fn listing_contains_addresses_bytes_and_source() {
        let assembly = assemble(
            "start: LDAA #$41\n STAA $80\n RTS\n",
            "t.asm",
            &AsmOptions::default(),
        )
        .unwrap();
        let text = render_listing(&assembly, "t.asm");
        assert!(text.contains("0000  86 41"));
        assert!(text.contains("0002  97 80"));
        assert!(text.contains("LDAA #$41"));
        let footer_line = text
            .lines()
            .find(|l| l.starts_with("START"))
            .expect("symbol footer row");
        assert!(footer_line.contains("= $0000"));
        assert!(footer_line.ends_with("code"));
    }

    #[test]
    fn long_data_rows_wrap() {
        let assembly = assemble(
            " FCB 1,2,3,4,5,6,7,8,9,10\n",
            "t.asm",
            &AsmOptions::default(),
        )
        .unwrap();
        let text = render_listing(&assembly, "t.asm");
        assert!(text.contains("0000  01 02 03 04 05 06 07 08"));
        assert!(text.contains("0008  09 0A"));
    }

    #[test]
    fn externals_stay_out_of_the_symbol_footer() {
        let assembly = assemble(" RTS\n", "t.asm", &AsmOptions::default()).unwrap();
        let text = render_listing(&assembly, "t.asm");
        assert!(!text.contains("DISP_ROWS"));
    }
}
