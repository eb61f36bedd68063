//! WAL records describing key file changes.
//!
//! Every change to a key file is logged before the file is touched, so a
//! standby or a crashed primary can bring its key files to the same state by
//! replaying the records through [`crate::manager::TdeKeyManager::redo`].

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use postgres_ffi::{Oid, RelFileNode};
use utils::lsn::Lsn;

use crate::keymap::{DataSlot, KeyType, RotatedFiles, DATA_SLOT_SIZE};
use crate::principal_key::{SignedPrincipalKeyInfo, SIGNED_KEY_INFO_SIZE};

pub const XLOG_TDE_ADD_RELATION_KEY: u8 = 0x00;
pub const XLOG_TDE_FREE_MAP_ENTRY: u8 = 0x10;
pub const XLOG_TDE_ROTATE_PRINCIPAL_KEY: u8 = 0x20;
pub const XLOG_TDE_ADD_PRINCIPAL_KEY: u8 = 0x30;

/// Where TDE records go. Implemented by the WAL writer, which logs them
/// under the TDE resource manager.
pub trait KeyMapXLog: Send + Sync {
    fn log_tde_record(&self, info: u8, payload: &[u8]) -> anyhow::Result<Lsn>;
}

/// Files a principal key rotation replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotatedKeyFiles {
    RelationMap(RotatedFiles),
    WalKeys(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TdeRecord {
    AddRelationKey {
        locator: RelFileNode,
        key_type: KeyType,
        slot: DataSlot,
    },
    FreeMapEntry {
        locator: RelFileNode,
        key_type: KeyType,
        index: u32,
    },
    RotatePrincipalKey {
        db_oid: Oid,
        files: RotatedKeyFiles,
    },
    AddPrincipalKey {
        db_oid: Oid,
        signed: SignedPrincipalKeyInfo,
    },
}

fn write_locator(buf: &mut Vec<u8>, locator: &RelFileNode) {
    // Vec writes are infallible
    let _ = buf.write_u32::<LittleEndian>(locator.spcnode);
    let _ = buf.write_u32::<LittleEndian>(locator.dbnode);
    let _ = buf.write_u32::<LittleEndian>(locator.relnode);
}

fn read_locator(cur: &mut Cursor<&[u8]>) -> std::io::Result<RelFileNode> {
    Ok(RelFileNode {
        spcnode: cur.read_u32::<LittleEndian>()?,
        dbnode: cur.read_u32::<LittleEndian>()?,
        relnode: cur.read_u32::<LittleEndian>()?,
    })
}

fn read_key_type(cur: &mut Cursor<&[u8]>) -> std::io::Result<KeyType> {
    let flags = cur.read_u32::<LittleEndian>()?;
    KeyType::from_flags(flags).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad key type {flags:#x}"))
    })
}

fn read_blob(cur: &mut Cursor<&[u8]>) -> std::io::Result<Vec<u8>> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let remaining = cur.get_ref().len() - cur.position() as usize;
    if len > remaining {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "blob runs past record end",
        ));
    }
    let mut blob = vec![0u8; len];
    cur.read_exact(&mut blob)?;
    Ok(blob)
}

fn write_blob(buf: &mut Vec<u8>, blob: &[u8]) {
    let _ = buf.write_u32::<LittleEndian>(blob.len() as u32);
    buf.extend_from_slice(blob);
}

impl TdeRecord {
    pub fn info(&self) -> u8 {
        match self {
            TdeRecord::AddRelationKey { .. } => XLOG_TDE_ADD_RELATION_KEY,
            TdeRecord::FreeMapEntry { .. } => XLOG_TDE_FREE_MAP_ENTRY,
            TdeRecord::RotatePrincipalKey { .. } => XLOG_TDE_ROTATE_PRINCIPAL_KEY,
            TdeRecord::AddPrincipalKey { .. } => XLOG_TDE_ADD_PRINCIPAL_KEY,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            TdeRecord::AddRelationKey {
                locator,
                key_type,
                slot,
            } => {
                write_locator(&mut buf, locator);
                let _ = buf.write_u32::<LittleEndian>(*key_type as u32);
                buf.extend_from_slice(&slot.encode());
            }
            TdeRecord::FreeMapEntry {
                locator,
                key_type,
                index,
            } => {
                write_locator(&mut buf, locator);
                let _ = buf.write_u32::<LittleEndian>(*key_type as u32);
                let _ = buf.write_u32::<LittleEndian>(*index);
            }
            TdeRecord::RotatePrincipalKey { db_oid, files } => {
                let _ = buf.write_u32::<LittleEndian>(*db_oid);
                match files {
                    RotatedKeyFiles::RelationMap(RotatedFiles { map, dat }) => {
                        buf.push(0);
                        write_blob(&mut buf, map);
                        write_blob(&mut buf, dat);
                    }
                    RotatedKeyFiles::WalKeys(content) => {
                        buf.push(1);
                        write_blob(&mut buf, content);
                    }
                }
            }
            TdeRecord::AddPrincipalKey { db_oid, signed } => {
                let _ = buf.write_u32::<LittleEndian>(*db_oid);
                buf.extend_from_slice(&signed.encode());
            }
        }
        buf
    }

    pub fn decode(info: u8, payload: &[u8]) -> std::io::Result<TdeRecord> {
        let mut cur = Cursor::new(payload);
        let record = match info & 0xF0 {
            XLOG_TDE_ADD_RELATION_KEY => {
                let locator = read_locator(&mut cur)?;
                let key_type = read_key_type(&mut cur)?;
                let mut slot = [0u8; DATA_SLOT_SIZE];
                cur.read_exact(&mut slot)?;
                TdeRecord::AddRelationKey {
                    locator,
                    key_type,
                    slot: DataSlot::decode(&slot[..])?,
                }
            }
            XLOG_TDE_FREE_MAP_ENTRY => TdeRecord::FreeMapEntry {
                locator: read_locator(&mut cur)?,
                key_type: read_key_type(&mut cur)?,
                index: cur.read_u32::<LittleEndian>()?,
            },
            XLOG_TDE_ROTATE_PRINCIPAL_KEY => {
                let db_oid = cur.read_u32::<LittleEndian>()?;
                let files = match cur.read_u8()? {
                    0 => RotatedKeyFiles::RelationMap(RotatedFiles {
                        map: read_blob(&mut cur)?,
                        dat: read_blob(&mut cur)?,
                    }),
                    1 => RotatedKeyFiles::WalKeys(read_blob(&mut cur)?),
                    other => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("unknown rotated file kind {other}"),
                        ))
                    }
                };
                TdeRecord::RotatePrincipalKey { db_oid, files }
            }
            XLOG_TDE_ADD_PRINCIPAL_KEY => {
                let db_oid = cur.read_u32::<LittleEndian>()?;
                let mut signed = [0u8; SIGNED_KEY_INFO_SIZE];
                cur.read_exact(&mut signed)?;
                TdeRecord::AddPrincipalKey {
                    db_oid,
                    signed: SignedPrincipalKeyInfo::decode(&signed).ok_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, "bad principal key info")
                    })?,
                }
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown TDE record info {other:#04x}"),
                ))
            }
        };
        Ok(record)
    }

    /// One-line description, as printed by WAL dump tools.
    pub fn describe(&self) -> String {
        match self {
            TdeRecord::AddRelationKey {
                locator, key_type, ..
            } => format!(
                "ADD_RELATION_KEY rel {}/{}/{} type {:?}",
                locator.spcnode, locator.dbnode, locator.relnode, key_type
            ),
            TdeRecord::FreeMapEntry {
                locator,
                key_type,
                index,
            } => format!(
                "FREE_MAP_ENTRY rel {}/{}/{} type {:?} entry {}",
                locator.spcnode, locator.dbnode, locator.relnode, key_type, index
            ),
            TdeRecord::RotatePrincipalKey { db_oid, files } => match files {
                RotatedKeyFiles::RelationMap(f) => format!(
                    "ROTATE_PRINCIPAL_KEY db {} map {} bytes dat {} bytes",
                    db_oid,
                    f.map.len(),
                    f.dat.len()
                ),
                RotatedKeyFiles::WalKeys(c) => {
                    format!("ROTATE_PRINCIPAL_KEY db {} wal keys {} bytes", db_oid, c.len())
                }
            },
            TdeRecord::AddPrincipalKey { db_oid, signed } => format!(
                "ADD_PRINCIPAL_KEY db {} key \"{}\" keyring {}",
                db_oid, signed.info.name, signed.info.keyring_id
            ),
        }
    }
}
