//!
//! Utilities for reading and writing the PostgreSQL control file.
//!
//! The PostgreSQL control file is one the first things that the PostgreSQL
//! server reads when it starts up. It indicates whether the server was shut
//! down cleanly, or if it crashed or was restored from online backup so that
//! WAL recovery needs to be performed. It also contains a copy of the latest
//! checkpoint record and its location in the WAL.
//!
//! The control file also contains fields for detecting whether the
//! data directory is compatible with this build. That includes
//! a version number, configuration options that can be set at
//! compilation time like the block size, and the platform's alignment
//! and endianness information.
//!
//! The control file is stored in the data directory, as
//! `global/pg_control`. The data stored in it is designed to be smaller than
//! 512 bytes, on the assumption that it can be updated atomically. The actual
//! file is larger, 8192 bytes, but the rest of it is just filled with zeros.
//!
use crate::pg_constants::{self, PG_CONTROL_FILE_SIZE};
use crate::ControlFileData;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use utils::bin_ser::{DeserializeError, LeSer, SerializeError};

/// Equivalent to sizeof(ControlFileData) in C
pub const SIZEOF_CONTROLDATA: usize = std::mem::size_of::<ControlFileData>();

/// Offset of `pg_control_version`, identical in every layout we know of.
const VERSION_OFFSET: usize = 8;

#[derive(Debug, Error)]
pub enum ControlFileError {
    #[error("control file is too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid CRC in control file: expected {expected:08X}, was {found:08X}")]
    BadCrc { expected: u32, found: u32 },
    #[error("could not decode control file: {0}")]
    Decode(#[from] DeserializeError),
    #[error("could not encode control file: {0}")]
    Encode(#[from] SerializeError),
}

/// Layout generation of a control file, judged by its version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFileVersion {
    Current,
    /// The pre-CRC32C layout, see [`crate::legacy`].
    V0,
    Unknown(u32),
}

/// Peek at the version field without decoding the rest.
pub fn control_file_version(buf: &[u8]) -> Option<ControlFileVersion> {
    let raw = buf.get(VERSION_OFFSET..VERSION_OFFSET + 4)?;
    let version = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Some(match version {
        pg_constants::PG_CONTROL_VERSION => ControlFileVersion::Current,
        pg_constants::PG_CONTROL_VERSION_V0 => ControlFileVersion::V0,
        other => ControlFileVersion::Unknown(other),
    })
}

impl ControlFileData {
    /// Compute the offset of the `crc` field within the `ControlFileData` struct.
    /// Equivalent to offsetof(ControlFileData, crc) in C.
    // Someday this can be const when the right compiler features land.
    pub fn pg_control_crc_offset() -> usize {
        memoffset::offset_of!(ControlFileData, crc)
    }

    ///
    /// Interpret a slice of bytes as a Postgres control file.
    ///
    pub fn decode(buf: &[u8]) -> Result<ControlFileData, ControlFileError> {
        let (controlfile, expected) = Self::decode_unchecked(buf)?;
        if expected != controlfile.crc {
            return Err(ControlFileError::BadCrc {
                expected,
                found: controlfile.crc,
            });
        }
        Ok(controlfile)
    }

    /// Decode without insisting on a valid CRC. Returns the struct and the
    /// CRC its contents should carry; callers compare it to `crc` and decide.
    pub fn decode_unchecked(buf: &[u8]) -> Result<(ControlFileData, u32), ControlFileError> {
        // The control file is padded with zeros, so accept a larger size too,
        // so that the caller can pass the whole file contents.
        if buf.len() < SIZEOF_CONTROLDATA {
            return Err(ControlFileError::TooShort(buf.len()));
        }

        // Compute the expected CRC of the content.
        let offsetof_crc = Self::pg_control_crc_offset();
        let expectedcrc = crc32c::crc32c(&buf[0..offsetof_crc]);

        // Use serde to deserialize the input as a ControlFileData struct.
        let controlfile = ControlFileData::des_prefix(buf)?;
        Ok((controlfile, expectedcrc))
    }

    ///
    /// Convert a struct representing a Postgres control file into raw bytes.
    ///
    /// The CRC is recomputed to match the contents of the fields, and the
    /// result is zero-padded to the full file size.
    pub fn encode(&self) -> Result<Bytes, ControlFileError> {
        // Serialize into a new buffer.
        let b = self.ser()?;

        // Recompute the CRC
        let offsetof_crc = Self::pg_control_crc_offset();
        let newcrc = crc32c::crc32c(&b[0..offsetof_crc]);

        let mut buf = BytesMut::with_capacity(PG_CONTROL_FILE_SIZE);
        buf.extend_from_slice(&b[0..offsetof_crc]);
        buf.extend_from_slice(&newcrc.to_le_bytes());
        // Fill the rest of the control file with zeros.
        buf.resize(PG_CONTROL_FILE_SIZE, 0);

        Ok(buf.freeze())
    }

    /// A version number with zero low half usually means the file was
    /// written on a machine of the opposite byte order.
    pub fn byte_order_suspect(&self) -> bool {
        self.pg_control_version % 65536 == 0 && self.pg_control_version / 65536 != 0
    }

    pub fn lc_collate_str(&self) -> String {
        cstr_field(&self.lc_collate)
    }

    pub fn lc_ctype_str(&self) -> String {
        cstr_field(&self.lc_ctype)
    }

    /// Store `name` as a NUL-terminated locale name; too-long names are cut.
    pub fn set_locale(field: &mut [u8; pg_constants::LOCALE_NAME_BUFLEN], name: &str) {
        field.fill(0);
        let n = name.len().min(pg_constants::LOCALE_NAME_BUFLEN - 1);
        field[..n].copy_from_slice(&name.as_bytes()[..n]);
    }
}

fn cstr_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ControlFileData {
        let mut cf = ControlFileData {
            system_identifier: 7_000_000_000_000_000_001,
            pg_control_version: pg_constants::PG_CONTROL_VERSION,
            catalog_version_no: pg_constants::CATALOG_VERSION_NO,
            state: 1,
            checkPoint: 0x1000028,
            blcksz: 8192,
            xlog_seg_size: 16 * 1024 * 1024,
            floatFormat: pg_constants::FLOATFORMAT_VALUE,
            ..Default::default()
        };
        ControlFileData::set_locale(&mut cf.lc_collate, "C");
        ControlFileData::set_locale(&mut cf.lc_ctype, "en_US.UTF-8");
        cf
    }

    #[test]
    fn encode_then_decode() {
        let cf = sample();
        let bytes = cf.encode().unwrap();
        assert_eq!(bytes.len(), PG_CONTROL_FILE_SIZE);
        let back = ControlFileData::decode(&bytes).unwrap();
        // crc is filled in by encode
        assert_eq!(ControlFileData { crc: 0, ..back }, cf);
        assert_eq!(back.lc_ctype_str(), "en_US.UTF-8");
        assert_eq!(
            control_file_version(&bytes),
            Some(ControlFileVersion::Current)
        );
    }

    #[test]
    fn corrupted_file_fails_crc() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[20] ^= 1;
        assert!(matches!(
            ControlFileData::decode(&bytes),
            Err(ControlFileError::BadCrc { .. })
        ));
        let (_, expected) = ControlFileData::decode_unchecked(&bytes).unwrap();
        assert_ne!(expected, ControlFileData::decode_unchecked(&bytes).unwrap().0.crc);

        let zeros = vec![0u8; PG_CONTROL_FILE_SIZE];
        assert!(ControlFileData::decode(&zeros).is_err());
    }

    #[test]
    fn byte_swapped_version_is_flagged() {
        let cf = ControlFileData {
            pg_control_version: pg_constants::PG_CONTROL_VERSION.swap_bytes(),
            ..sample()
        };
        assert!(cf.byte_order_suspect());
        assert!(!sample().byte_order_suspect());
    }
}
