// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! OPK pack image builder.
//!
//! Serializes a pack as `"OPK"` + 24-bit data length + pack header +
//! MAIN stub + records + `FF FF`. The MAIN stub is what the device tools
//! write when no boot block is supplied; without it the OS does not
//! recognize the pack.

use tracing::debug;

use crate::asm::output::Ob3File;
use crate::core::diag::{DiagKind, Diagnostic, SourcePos};
use crate::opk::checksum;
use crate::opk::records::{
    is_valid_pack_size, padded_name, validate_name, PackHeader, PackRecord, PackStamp, PackType,
};

/// The minimal MAIN file header: `[len=9][0x81]["MAIN    "][0x90]`.
const MAIN_STUB: [u8; 11] = [
    9, 0x81, b'M', b'A', b'I', b'N', b' ', b' ', b' ', b' ', 0x90,
];

#[derive(Debug)]
pub struct PackBuilder {
    size_kb: u32,
    pack_type: PackType,
    stamp: PackStamp,
    records: Vec<PackRecord>,
}

impl PackBuilder {
    pub fn new(size_kb: u32, pack_type: PackType) -> Result<Self, Diagnostic> {
        if !is_valid_pack_size(size_kb) {
            return Err(pack_error(format!(
                "invalid pack size {size_kb} KiB (valid: 8, 16, 32, 64, 128)"
            )));
        }
        Ok(Self {
            size_kb,
            pack_type,
            stamp: PackStamp::default(),
            records: Vec::new(),
        })
    }

    pub fn with_stamp(mut self, stamp: PackStamp) -> Self {
        self.stamp = stamp;
        self
    }

    pub fn add_procedure(
        &mut self,
        name: &str,
        object_code: Vec<u8>,
        source_code: Vec<u8>,
    ) -> Result<&mut Self, Diagnostic> {
        let name = name.to_ascii_uppercase();
        if !validate_name(&name) {
            return Err(pack_error(format!(
                "invalid procedure name {name:?}: 1-8 alphanumeric characters starting with a letter"
            )));
        }
        if self
            .records
            .iter()
            .any(|r| padded_name(r.name()) == padded_name(&name))
        {
            return Err(pack_error(format!("duplicate record name: {name}")));
        }
        debug!(name = %name, bytes = object_code.len(), "adding procedure record");
        self.records.push(PackRecord::Procedure {
            name,
            object_code,
            source_code,
        });
        Ok(self)
    }

    /// Add a procedure from assembler object-form bytes.
    pub fn add_object(&mut self, name: &str, ob3_bytes: &[u8]) -> Result<&mut Self, Diagnostic> {
        let ob3 = Ob3File::from_bytes(ob3_bytes)?;
        self.add_procedure(name, ob3.object_code, ob3.source_code)
    }

    pub fn add_data_file(
        &mut self,
        name: &str,
        records: Vec<Vec<u8>>,
    ) -> Result<&mut Self, Diagnostic> {
        let name = name.to_ascii_uppercase();
        if !validate_name(&name) {
            return Err(pack_error(format!("invalid data file name {name:?}")));
        }
        if self
            .records
            .iter()
            .any(|r| padded_name(r.name()) == padded_name(&name))
        {
            return Err(pack_error(format!("duplicate record name: {name}")));
        }
        self.records.push(PackRecord::DataFile { name, records });
        Ok(self)
    }

    pub fn record_names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name()).collect()
    }

    /// Bytes the pack data block will occupy when built.
    pub fn used_bytes(&self) -> usize {
        let records: usize = self.records.iter().map(|r| r.to_bytes().len()).sum();
        PackHeader::SIZE + MAIN_STUB.len() + records + 2
    }

    pub fn free_bytes(&self) -> usize {
        (self.size_kb as usize * 1024).saturating_sub(self.used_bytes())
    }

    /// Serialize the complete OPK file.
    pub fn build(&self) -> Result<Vec<u8>, Diagnostic> {
        let header = PackHeader::new(self.pack_type, self.size_kb, self.stamp);

        let mut data = Vec::with_capacity(self.used_bytes());
        data.extend_from_slice(&header.to_bytes());
        data.extend_from_slice(&MAIN_STUB);
        for record in &self.records {
            data.extend_from_slice(&record.to_bytes());
        }
        data.extend_from_slice(&[0xFF, 0xFF]);

        let max = self.size_kb as usize * 1024;
        if data.len() > max {
            return Err(pack_error(format!(
                "pack data ({} bytes) exceeds pack size ({max} bytes)",
                data.len()
            )));
        }

        let opk_header = checksum::opk_header(data.len())
            .ok_or_else(|| pack_error("pack data exceeds the 24-bit length field"))?;
        let mut out = Vec::with_capacity(6 + data.len());
        out.extend_from_slice(&opk_header);
        out.extend_from_slice(&data);
        debug!(
            used = data.len(),
            free = max - data.len(),
            "built pack image"
        );
        Ok(out)
    }
}

fn pack_error(message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(DiagKind::Pack, SourcePos::new("<pack>", 0, 0), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_places_header_stub_and_marker() {
        let mut builder = PackBuilder::new(8, PackType::Datapak).unwrap();
        builder
            .add_procedure("TEST", vec![0x01, 0x39], Vec::new())
            .unwrap();
        let opk = builder.build().unwrap();

        assert_eq!(&opk[0..3], b"OPK");
        let declared = ((opk[3] as usize) << 16) | ((opk[4] as usize) << 8) | opk[5] as usize;
        assert_eq!(declared + 6, opk.len());
        // Pack header then MAIN stub.
        assert_eq!(opk[6], PackType::Datapak as u8);
        assert_eq!(&opk[16..27], &MAIN_STUB);
        // End marker.
        assert_eq!(&opk[opk.len() - 2..], &[0xFF, 0xFF]);
    }

    #[test]
    fn rejects_invalid_sizes_and_names() {
        assert!(PackBuilder::new(12, PackType::Datapak).is_err());
        let mut builder = PackBuilder::new(8, PackType::Datapak).unwrap();
        assert!(builder.add_procedure("9BAD", vec![1], Vec::new()).is_err());
        assert!(builder
            .add_procedure("WAYTOOLONG", vec![1], Vec::new())
            .is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut builder = PackBuilder::new(8, PackType::Datapak).unwrap();
        builder.add_procedure("TWIN", vec![1], Vec::new()).unwrap();
        let err = builder
            .add_procedure("twin", vec![2], Vec::new())
            .unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn oversize_payload_fails_the_build() {
        let mut builder = PackBuilder::new(8, PackType::Datapak).unwrap();
        builder
            .add_procedure("BIG", vec![0; 9000], Vec::new())
            .unwrap();
        assert!(builder.build().is_err());
    }

    #[test]
    fn used_bytes_matches_serialized_length() {
        let mut builder = PackBuilder::new(16, PackType::Rampak).unwrap();
        builder
            .add_procedure("ONE", vec![0; 100], Vec::new())
            .unwrap();
        builder
            .add_procedure("TWO", vec![0; 300], Vec::new())
            .unwrap();
        let opk = builder.build().unwrap();
        assert_eq!(builder.used_bytes() + 6, opk.len());
    }
}
