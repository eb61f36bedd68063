//!
//! On-disk state of a replication slot, `pg_replslot/<name>/state`.
//!
//! The file starts with a constant-size part (magic, checksum, version,
//! length) followed by the persistent slot data. The CRC-32C covers
//! everything from the version field to the end.
//!
use crate::pg_constants::{NAMEDATALEN, SLOT_MAGIC, SLOT_VERSION};
use crate::{Oid, TransactionId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use utils::lsn::Lsn;

/// magic + checksum + version + length
pub const SLOT_CONSTANT_SIZE: usize = 16;
/// Bytes before the checksummed part: magic and checksum.
pub const SLOT_NOT_CHECKSUMMED_SIZE: usize = 8;
/// Size of the persistent data, padded to 8 bytes.
pub const SLOT_DATA_SIZE: usize = 184;
pub const SLOT_ON_DISK_SIZE: usize = SLOT_CONSTANT_SIZE + SLOT_DATA_SIZE;

#[derive(Debug, Error)]
pub enum ReplSlotError {
    #[error("replication slot file is too short ({0} bytes)")]
    TooShort(usize),
    #[error("replication slot file has wrong magic number: {found:#x} instead of {expected:#x}")]
    BadMagic { found: u32, expected: u32 },
    #[error("replication slot file has unsupported version {0}")]
    BadVersion(u32),
    #[error("replication slot file has corrupted length {0}")]
    BadLength(u32),
    #[error("checksum mismatch for replication slot file: is {found}, should be {expected}")]
    BadChecksum { found: u32, expected: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPersistency {
    Persistent,
    Ephemeral,
    Temporary,
    Unknown(u32),
}

impl SlotPersistency {
    pub fn from_u32(v: u32) -> SlotPersistency {
        match v {
            0 => SlotPersistency::Persistent,
            1 => SlotPersistency::Ephemeral,
            2 => SlotPersistency::Temporary,
            other => SlotPersistency::Unknown(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            SlotPersistency::Persistent => 0,
            SlotPersistency::Ephemeral => 1,
            SlotPersistency::Temporary => 2,
            SlotPersistency::Unknown(v) => v,
        }
    }
}

impl std::fmt::Display for SlotPersistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotPersistency::Persistent => write!(f, "persistent"),
            SlotPersistency::Ephemeral => write!(f, "ephemeral"),
            SlotPersistency::Temporary => write!(f, "temporary"),
            SlotPersistency::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlotPersistentData {
    pub name: String,
    /// InvalidOid for physical slots.
    pub database: Oid,
    pub persistency: SlotPersistency,
    pub xmin: TransactionId,
    pub catalog_xmin: TransactionId,
    pub restart_lsn: Lsn,
    pub invalidated_at: Lsn,
    pub confirmed_flush: Lsn,
    pub two_phase_at: Lsn,
    pub two_phase: bool,
    /// Output plugin, empty for physical slots.
    pub plugin: String,
}

impl ReplicationSlotPersistentData {
    pub fn is_logical(&self) -> bool {
        self.database != 0
    }

    pub fn slot_type(&self) -> &'static str {
        if self.is_logical() {
            "logical"
        } else {
            "physical"
        }
    }

    pub fn decode(buf: &[u8]) -> Result<ReplicationSlotPersistentData, ReplSlotError> {
        if buf.len() < SLOT_ON_DISK_SIZE {
            return Err(ReplSlotError::TooShort(buf.len()));
        }
        let mut b = buf;
        let magic = b.get_u32_le();
        if magic != SLOT_MAGIC {
            return Err(ReplSlotError::BadMagic {
                found: magic,
                expected: SLOT_MAGIC,
            });
        }
        let checksum = b.get_u32_le();
        let version = b.get_u32_le();
        if version != SLOT_VERSION {
            return Err(ReplSlotError::BadVersion(version));
        }
        let length = b.get_u32_le();
        if length as usize != SLOT_DATA_SIZE {
            return Err(ReplSlotError::BadLength(length));
        }
        let expected = crc32c::crc32c(&buf[SLOT_NOT_CHECKSUMMED_SIZE..SLOT_ON_DISK_SIZE]);
        if expected != checksum {
            return Err(ReplSlotError::BadChecksum {
                found: checksum,
                expected,
            });
        }

        let name = name_data(&b[..NAMEDATALEN]);
        b.advance(NAMEDATALEN);
        let database = b.get_u32_le();
        let persistency = SlotPersistency::from_u32(b.get_u32_le());
        let xmin = b.get_u32_le();
        let catalog_xmin = b.get_u32_le();
        let restart_lsn = Lsn(b.get_u64_le());
        let invalidated_at = Lsn(b.get_u64_le());
        let confirmed_flush = Lsn(b.get_u64_le());
        let two_phase_at = Lsn(b.get_u64_le());
        let two_phase = b.get_u8() != 0;
        let plugin = name_data(&b[..NAMEDATALEN]);

        Ok(ReplicationSlotPersistentData {
            name,
            database,
            persistency,
            xmin,
            catalog_xmin,
            restart_lsn,
            invalidated_at,
            confirmed_flush,
            two_phase_at,
            two_phase,
            plugin,
        })
    }

    /// Serialize into the full state-file image, checksum included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SLOT_ON_DISK_SIZE);
        buf.put_u32_le(SLOT_MAGIC);
        buf.put_u32_le(0); // checksum, filled in below
        buf.put_u32_le(SLOT_VERSION);
        buf.put_u32_le(SLOT_DATA_SIZE as u32);
        put_name_data(&mut buf, &self.name);
        buf.put_u32_le(self.database);
        buf.put_u32_le(self.persistency.to_u32());
        buf.put_u32_le(self.xmin);
        buf.put_u32_le(self.catalog_xmin);
        buf.put_u64_le(self.restart_lsn.0);
        buf.put_u64_le(self.invalidated_at.0);
        buf.put_u64_le(self.confirmed_flush.0);
        buf.put_u64_le(self.two_phase_at.0);
        buf.put_u8(self.two_phase as u8);
        put_name_data(&mut buf, &self.plugin);
        buf.resize(SLOT_ON_DISK_SIZE, 0);

        let checksum = crc32c::crc32c(&buf[SLOT_NOT_CHECKSUMMED_SIZE..]);
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        buf.freeze()
    }
}

fn name_data(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn put_name_data(buf: &mut BytesMut, name: &str) {
    let mut field = [0u8; NAMEDATALEN];
    let n = name.len().min(NAMEDATALEN - 1);
    field[..n].copy_from_slice(&name.as_bytes()[..n]);
    buf.put_slice(&field);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical() -> ReplicationSlotPersistentData {
        ReplicationSlotPersistentData {
            name: "s1".into(),
            database: 0,
            persistency: SlotPersistency::Persistent,
            xmin: 0,
            catalog_xmin: 0,
            restart_lsn: Lsn(0x0100_0000),
            invalidated_at: Lsn(0),
            confirmed_flush: Lsn(0),
            two_phase_at: Lsn(0),
            two_phase: true,
            plugin: String::new(),
        }
    }

    #[test]
    fn field_offsets() {
        let raw = physical().encode();
        assert_eq!(raw.len(), SLOT_ON_DISK_SIZE);
        // restart_lsn sits at offset 80 of the slot data
        assert_eq!(&raw[16 + 80..16 + 88], &0x0100_0000u64.to_le_bytes());
        assert_eq!(raw[16 + 112], 1);
        assert_eq!(&raw[16..18], b"s1");
    }

    #[test]
    fn decode_encoded_slot() {
        let slot = ReplicationSlotPersistentData {
            database: 5,
            plugin: "pgoutput".into(),
            ..physical()
        };
        let back = ReplicationSlotPersistentData::decode(&slot.encode()).unwrap();
        assert_eq!(back, slot);
        assert_eq!(back.slot_type(), "logical");
        assert_eq!(physical().slot_type(), "physical");
    }

    #[test]
    fn checksum_and_magic_are_checked() {
        let mut raw = physical().encode().to_vec();
        raw[40] ^= 1;
        assert!(matches!(
            ReplicationSlotPersistentData::decode(&raw),
            Err(ReplSlotError::BadChecksum { .. })
        ));
        raw[0] = 0;
        assert!(matches!(
            ReplicationSlotPersistentData::decode(&raw),
            Err(ReplSlotError::BadMagic { .. })
        ));
    }
}
