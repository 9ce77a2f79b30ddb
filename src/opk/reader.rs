// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! OPK pack reader and validator.
//!
//! Every check names the field that failed: magic, declared length,
//! header checksum, record structure, duplicate names. Reads accept both
//! historical length conventions and an image padded with `0xFF` up to
//! the pack size.

use serde::Serialize;
use tracing::debug;

use crate::core::diag::{DiagKind, Diagnostic, SourcePos};
use crate::opk::checksum;
use crate::opk::records::{record_type, PackHeader, PackRecord};

/// A parsed and validated pack image.
#[derive(Debug, Clone)]
pub struct PackImage {
    pub header: PackHeader,
    pub records: Vec<PackRecord>,
}

/// Directory entry returned by `pack_inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub record_type: u8,
    pub length: usize,
}

impl PackImage {
    pub fn directory(&self) -> Vec<DirectoryEntry> {
        self.records
            .iter()
            .map(|record| DirectoryEntry {
                name: record.name().trim_end().to_string(),
                record_type: record.type_byte(),
                length: record.payload().len(),
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&PackRecord> {
        let wanted = name.trim_end().to_ascii_uppercase();
        self.records
            .iter()
            .find(|record| record.name().trim_end().to_ascii_uppercase() == wanted)
    }
}

fn pack_error(message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(DiagKind::Pack, SourcePos::new("<pack>", 0, 0), message)
}

/// Parse and validate an OPK file.
pub fn parse_pack(data: &[u8]) -> Result<PackImage, Diagnostic> {
    let declared = checksum::parse_opk_header(data)
        .ok_or_else(|| pack_error("bad OPK magic or truncated header"))?;

    if !checksum::opk_length_consistent(data.len(), declared) && !is_padded_image(data, declared) {
        return Err(pack_error(format!(
            "declared length {declared} does not match file size {}",
            data.len()
        )));
    }

    let pack_data = &data[6..];
    let header = PackHeader::from_bytes(pack_data)?;
    if !checksum::verify_header_checksum(&pack_data[..PackHeader::SIZE]) {
        return Err(pack_error(format!(
            "header checksum mismatch: stored ${:04X}, calculated ${:04X}",
            header.checksum,
            checksum::pack_header_checksum(&pack_data[..8])
        )));
    }

    let records = walk_records(pack_data)?;

    // Names must be unique across the pack.
    for (i, record) in records.iter().enumerate() {
        let name = record.name().trim_end().to_ascii_uppercase();
        if name == "MAIN" {
            continue;
        }
        for other in &records[i + 1..] {
            if other.name().trim_end().to_ascii_uppercase() == name {
                return Err(pack_error(format!("duplicate record name: {name}")));
            }
        }
    }

    debug!(records = records.len(), "parsed pack image");
    Ok(PackImage { header, records })
}

/// A pack may be padded with erased (0xFF) bytes out to its full size.
fn is_padded_image(data: &[u8], declared: usize) -> bool {
    if data.len() < declared + 6 {
        return false;
    }
    data[declared + 6..].iter().all(|&b| b == 0xFF)
}

fn walk_records(pack_data: &[u8]) -> Result<Vec<PackRecord>, Diagnostic> {
    let mut records = Vec::new();
    let mut offset = PackHeader::SIZE;

    while offset + 1 < pack_data.len() {
        let first = pack_data[offset];

        if first == 0xFF {
            if pack_data.get(offset + 1) == Some(&0xFF) {
                break; // end marker
            }
            offset += 1; // error-correction byte
            continue;
        }
        if first == 0 {
            offset += 1;
            continue;
        }

        let rec_type = *pack_data
            .get(offset + 1)
            .ok_or_else(|| pack_error(format!("truncated record at offset {offset}")))?;

        match rec_type {
            record_type::PROCEDURE => {
                let (record, size) = parse_procedure(pack_data, offset)?;
                records.push(record);
                offset += size;
            }
            record_type::DATA_FILE => {
                // [len][0x81][name 8][file id]
                let name_bytes = pack_data
                    .get(offset + 2..offset + 10)
                    .ok_or_else(|| pack_error("truncated data file header"))?;
                let name = String::from_utf8_lossy(name_bytes).trim_end().to_string();
                records.push(PackRecord::DataFile {
                    name,
                    records: Vec::new(),
                });
                offset += 11;
            }
            t if (record_type::DATA_RECORD_FIRST..=0xFE).contains(&t) => {
                let (payload, size) = read_short_or_long(pack_data, offset)?;
                // A data record belongs to the data file before it.
                if let Some(PackRecord::DataFile { records: file, .. }) = records
                    .iter_mut()
                    .rev()
                    .find(|r| matches!(r, PackRecord::DataFile { .. }))
                {
                    file.push(payload[1..].to_vec());
                }
                offset += size;
            }
            _ => {
                // Deleted or unknown record: validated for shape, skipped.
                let (_, size) = read_short_or_long(pack_data, offset)?;
                offset += size;
            }
        }
    }

    Ok(records)
}

/// Read a `[length][type+data]` or `[02][80][length:u16][type+data]`
/// record; returns (type+data bytes, total size consumed).
fn read_short_or_long(pack_data: &[u8], offset: usize) -> Result<(Vec<u8>, usize), Diagnostic> {
    let first = pack_data[offset];
    if first == 0x02 && pack_data.get(offset + 1) == Some(&record_type::LONG) {
        let len = u16::from_be_bytes([
            *pack_data
                .get(offset + 2)
                .ok_or_else(|| pack_error("truncated long record"))?,
            *pack_data
                .get(offset + 3)
                .ok_or_else(|| pack_error("truncated long record"))?,
        ]) as usize;
        let body = pack_data
            .get(offset + 4..offset + 4 + len)
            .ok_or_else(|| pack_error("long record payload exceeds pack data"))?;
        Ok((body.to_vec(), 4 + len))
    } else {
        let len = first as usize;
        let body = pack_data
            .get(offset + 1..offset + 1 + len)
            .ok_or_else(|| pack_error("record payload exceeds pack data"))?;
        Ok((body.to_vec(), 1 + len))
    }
}

fn parse_procedure(pack_data: &[u8], offset: usize) -> Result<(PackRecord, usize), Diagnostic> {
    let start = offset;
    // File header: [len][0x83][name 8][00]
    let name_bytes = pack_data
        .get(offset + 2..offset + 10)
        .ok_or_else(|| pack_error("truncated procedure header"))?;
    let name = String::from_utf8_lossy(name_bytes).trim_end().to_string();
    let mut offset = offset + 11;

    // Data block: [02][80][blocklen]
    let block_marker = pack_data
        .get(offset..offset + 2)
        .ok_or_else(|| pack_error(format!("procedure {name}: missing data block")))?;
    if block_marker[1] != record_type::LONG {
        return Err(pack_error(format!(
            "procedure {name}: expected data block (type $80), got ${:02X}",
            block_marker[1]
        )));
    }
    let block_len = u16::from_be_bytes([
        *pack_data
            .get(offset + 2)
            .ok_or_else(|| pack_error(format!("procedure {name}: truncated block length")))?,
        *pack_data
            .get(offset + 3)
            .ok_or_else(|| pack_error(format!("procedure {name}: truncated block length")))?,
    ]) as usize;
    offset += 4;

    let block = pack_data
        .get(offset..offset + block_len)
        .ok_or_else(|| pack_error(format!("procedure {name}: payload exceeds declared length")))?;

    if block.len() < 4 {
        return Err(pack_error(format!("procedure {name}: data block too short")));
    }
    let obj_len = u16::from_be_bytes([block[0], block[1]]) as usize;
    if 2 + obj_len + 2 > block.len() {
        return Err(pack_error(format!(
            "procedure {name}: object code exceeds block length"
        )));
    }
    let object_code = block[2..2 + obj_len].to_vec();
    let src_len = u16::from_be_bytes([block[2 + obj_len], block[3 + obj_len]]) as usize;
    // Block length is the record's integrity word: it must account for
    // the object and source exactly.
    if 2 + obj_len + 2 + src_len != block.len() {
        return Err(pack_error(format!(
            "procedure {name}: block length {block_len} does not match contents"
        )));
    }
    let source_code = block[4 + obj_len..].to_vec();
    offset += block_len;

    Ok((
        PackRecord::Procedure {
            name,
            object_code,
            source_code,
        },
        offset - start,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opk::builder::PackBuilder;
    use crate::opk::records::PackType;

    fn sample_pack() -> Vec<u8> {
        let mut builder = PackBuilder::new(8, PackType::Datapak).unwrap();
        builder
            .add_procedure("HELLO", vec![0x86, 0x41, 0x39], Vec::new())
            .unwrap();
        builder
            .add_procedure("UTILS", vec![0x01, 0x39], Vec::new())
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn round_trip_preserves_names_and_payloads() {
        let image = parse_pack(&sample_pack()).unwrap();
        let dir = image.directory();
        let names: Vec<&str> = dir.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["MAIN", "HELLO", "UTILS"]);
        assert_eq!(
            image.find("HELLO").unwrap().payload(),
            vec![0x86, 0x41, 0x39]
        );
        assert_eq!(image.find("hello").unwrap().payload().len(), 3);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut opk = sample_pack();
        opk[0] = b'X';
        let err = parse_pack(&opk).unwrap_err();
        assert!(err.message.contains("magic"));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut opk = sample_pack();
        opk.push(0x00); // neither convention nor 0xFF padding
        let err = parse_pack(&opk).unwrap_err();
        assert!(err.message.contains("length"));
    }

    #[test]
    fn accepts_erased_padding() {
        let mut opk = sample_pack();
        let target = 6 + 8 * 1024;
        opk.resize(target, 0xFF);
        assert!(parse_pack(&opk).is_ok());
    }

    #[test]
    fn rejects_header_checksum_damage() {
        let mut opk = sample_pack();
        opk[8] ^= 0x01; // year byte, invalidates the checksum
        let err = parse_pack(&opk).unwrap_err();
        assert!(err.message.contains("checksum"));
    }

    #[test]
    fn rejects_corrupt_block_length() {
        let mut opk = sample_pack();
        // The HELLO record's object length sits after the MAIN stub and
        // record headers; damage the block length word.
        let image = parse_pack(&opk).unwrap();
        assert!(image.find("HELLO").is_some());
        // offset 6 (OPK) + 10 (header) + 11 (MAIN) + 11 (proc header)
        // + 2 (block marker) = 40 -> block length hi byte.
        opk[40] = 0x7F;
        assert!(parse_pack(&opk).is_err());
    }

    #[test]
    fn extract_round_trips_through_rebuild() {
        let image = parse_pack(&sample_pack()).unwrap();
        let mut rebuilt = PackBuilder::new(8, PackType::Datapak).unwrap();
        for record in &image.records {
            if let PackRecord::Procedure {
                name,
                object_code,
                source_code,
            } = record
            {
                if name.trim_end() == "MAIN" {
                    continue;
                }
                rebuilt
                    .add_procedure(name, object_code.clone(), source_code.clone())
                    .unwrap();
            }
        }
        let image2 = parse_pack(&rebuilt.build().unwrap()).unwrap();
        assert_eq!(
            image.find("HELLO").unwrap().payload(),
            image2.find("HELLO").unwrap().payload()
        );
    }
}
