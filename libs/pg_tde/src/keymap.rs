//! Per-database relation key files.
//!
//! Each database with encrypted relations owns two files in the key
//! directory:
//!
//! * `<dboid>_map`: header, then fixed-size entries
//!   `{spc_oid, rel_number, flags, key_index}`.
//! * `<dboid>_dat`: the same header, then fixed-size slots holding an
//!   internal key wrapped under the principal key named in the header.
//!
//! Entry `i` of the map always names slot `i` of the data file. A freed
//! entry keeps its slot bytes; the next insertion into that entry rewrites
//! both. The wrapped key is authenticated together with the entry's
//! locator and type, so a slot cannot be silently re-attached to another
//! relation.
//!
//! Callers serialize access; see [`crate::manager::TdeKeyManager`].

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use postgres_ffi::{Oid, RelFileNode};
use tracing::{debug, info};
use utils::crashsafe::{durable_rename, fsync, path_with_suffix_extension};

use crate::encryption::{
    aead_decrypt, aead_encrypt, random_entry_iv, InternalKey, AEAD_TAG_LEN, BASE_IV_LEN,
    ENTRY_IV_LEN, INTERNAL_KEY_LEN,
};
use crate::error::{TdeError, TdeResult};
use crate::principal_key::{PrincipalKey, SignedPrincipalKeyInfo, SIGNED_KEY_INFO_SIZE};

pub const PG_TDE_FILEMAGIC: u32 = 0x0345_4454;
pub const PG_TDE_FILEVERSION: u32 = 1;
pub const KEY_FILE_HEADER_SIZE: usize = 4 + 4 + SIGNED_KEY_INFO_SIZE;
pub const MAP_ENTRY_SIZE: usize = 16;
pub const DATA_SLOT_SIZE: usize = BASE_IV_LEN + INTERNAL_KEY_LEN + ENTRY_IV_LEN + AEAD_TAG_LEN;

pub const MAP_ENTRY_EMPTY: u32 = 0x00;
/// Suffix of the files a rotation builds before they replace the originals.
pub const ROTATION_SUFFIX: &str = "r";

/// What a relation key is used for. The discriminants are the type bits
/// stored in map entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum KeyType {
    HeapBasic = 0x01,
    Smgr = 0x02,
    Global = 0x04,
}

pub const MAP_ENTRY_VALID: u32 =
    KeyType::HeapBasic as u32 | KeyType::Smgr as u32 | KeyType::Global as u32;

impl KeyType {
    pub fn from_flags(flags: u32) -> Option<KeyType> {
        match flags & MAP_ENTRY_VALID {
            0x01 => Some(KeyType::HeapBasic),
            0x02 => Some(KeyType::Smgr),
            0x04 => Some(KeyType::Global),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub spc_oid: Oid,
    pub rel_number: Oid,
    pub flags: u32,
    pub key_index: u32,
}

impl MapEntry {
    pub fn is_valid(&self) -> bool {
        self.flags & MAP_ENTRY_VALID != 0
    }

    pub fn matches(&self, locator: &RelFileNode, key_type: KeyType) -> bool {
        self.is_valid()
            && self.spc_oid == locator.spcnode
            && self.rel_number == locator.relnode
            && self.flags & key_type as u32 != 0
    }

    fn encode(&self) -> [u8; MAP_ENTRY_SIZE] {
        let mut buf = [0u8; MAP_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.spc_oid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.rel_number.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.key_index.to_le_bytes());
        buf
    }

    fn decode(mut buf: &[u8]) -> std::io::Result<MapEntry> {
        Ok(MapEntry {
            spc_oid: buf.read_u32::<LittleEndian>()?,
            rel_number: buf.read_u32::<LittleEndian>()?,
            flags: buf.read_u32::<LittleEndian>()?,
            key_index: buf.read_u32::<LittleEndian>()?,
        })
    }
}

/// An internal key as stored in the data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSlot {
    pub base_iv: [u8; BASE_IV_LEN],
    pub enc_key: [u8; INTERNAL_KEY_LEN],
    pub entry_iv: [u8; ENTRY_IV_LEN],
    pub aead_tag: [u8; AEAD_TAG_LEN],
}

/// Authenticated, non-secret bytes binding a wrapped key to its entry.
fn slot_aad(locator: &RelFileNode, key_type: KeyType, base_iv: &[u8; BASE_IV_LEN]) -> [u8; 12 + BASE_IV_LEN] {
    let mut aad = [0u8; 12 + BASE_IV_LEN];
    aad[0..4].copy_from_slice(&locator.spcnode.to_le_bytes());
    aad[4..8].copy_from_slice(&locator.relnode.to_le_bytes());
    aad[8..12].copy_from_slice(&(key_type as u32).to_le_bytes());
    aad[12..].copy_from_slice(base_iv);
    aad
}

impl DataSlot {
    pub fn wrap(
        principal: &PrincipalKey,
        locator: &RelFileNode,
        key_type: KeyType,
        key: &InternalKey,
    ) -> TdeResult<DataSlot> {
        let entry_iv = random_entry_iv();
        let mut enc_key = key.key;
        let aead_tag = aead_encrypt(
            &principal.key_data,
            &entry_iv,
            &slot_aad(locator, key_type, &key.base_iv),
            &mut enc_key,
        )?;
        Ok(DataSlot {
            base_iv: key.base_iv,
            enc_key,
            entry_iv,
            aead_tag,
        })
    }

    pub fn unwrap_key(
        &self,
        principal: &PrincipalKey,
        locator: &RelFileNode,
        key_type: KeyType,
    ) -> TdeResult<InternalKey> {
        let mut key = InternalKey {
            key: self.enc_key,
            base_iv: self.base_iv,
        };
        aead_decrypt(
            &principal.key_data,
            &self.entry_iv,
            &slot_aad(locator, key_type, &self.base_iv),
            &mut key.key,
            &self.aead_tag,
        )
        .map_err(|_| {
            TdeError::Decrypt(format!(
                "key of relation {}/{} does not authenticate under principal key \"{}\"",
                locator.spcnode, locator.relnode, principal.info.name
            ))
        })?;
        Ok(key)
    }

    pub fn encode(&self) -> [u8; DATA_SLOT_SIZE] {
        let mut buf = [0u8; DATA_SLOT_SIZE];
        let mut off = 0;
        for part in [&self.base_iv[..], &self.enc_key[..], &self.entry_iv[..], &self.aead_tag[..]] {
            buf[off..off + part.len()].copy_from_slice(part);
            off += part.len();
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> std::io::Result<DataSlot> {
        let mut slot = DataSlot {
            base_iv: [0; BASE_IV_LEN],
            enc_key: [0; INTERNAL_KEY_LEN],
            entry_iv: [0; ENTRY_IV_LEN],
            aead_tag: [0; AEAD_TAG_LEN],
        };
        buf.read_exact(&mut slot.base_iv)?;
        buf.read_exact(&mut slot.enc_key)?;
        buf.read_exact(&mut slot.entry_iv)?;
        buf.read_exact(&mut slot.aead_tag)?;
        Ok(slot)
    }
}

pub(crate) fn encode_file_header(signed: &SignedPrincipalKeyInfo, magic: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_FILE_HEADER_SIZE);
    // Vec writes are infallible
    let _ = buf.write_u32::<LittleEndian>(magic);
    let _ = buf.write_u32::<LittleEndian>(PG_TDE_FILEVERSION);
    buf.extend_from_slice(&signed.encode());
    buf
}

pub(crate) fn decode_file_header(
    path: &Path,
    buf: &[u8],
    magic: u32,
) -> TdeResult<SignedPrincipalKeyInfo> {
    let mut cur = Cursor::new(buf);
    let found = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| TdeError::corrupted(path, "file too short"))?;
    if found != magic {
        return Err(TdeError::corrupted(
            path,
            format!("bad magic {found:08X}, expected {magic:08X}"),
        ));
    }
    let version = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| TdeError::corrupted(path, "file too short"))?;
    if version != PG_TDE_FILEVERSION {
        return Err(TdeError::corrupted(
            path,
            format!("unsupported file version {version}"),
        ));
    }
    SignedPrincipalKeyInfo::decode(&buf[8..])
        .ok_or_else(|| TdeError::corrupted(path, "truncated principal key info"))
}

/// Bytes of a rotated map/data pair, as carried by the rotation WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedFiles {
    pub map: Vec<u8>,
    pub dat: Vec<u8>,
}

/// The map/data file pair of one database.
#[derive(Debug, Clone)]
pub struct RelKeyMap {
    db_oid: Oid,
    map_path: PathBuf,
    dat_path: PathBuf,
}

impl RelKeyMap {
    pub fn new(key_dir: &Path, db_oid: Oid) -> RelKeyMap {
        RelKeyMap {
            db_oid,
            map_path: key_dir.join(format!("{db_oid}_map")),
            dat_path: key_dir.join(format!("{db_oid}_dat")),
        }
    }

    pub fn db_oid(&self) -> Oid {
        self.db_oid
    }

    pub fn map_path(&self) -> &Path {
        &self.map_path
    }

    pub fn dat_path(&self) -> &Path {
        &self.dat_path
    }

    pub fn exists(&self) -> bool {
        self.map_path.exists()
    }

    fn open(&self, path: &Path, write: bool) -> TdeResult<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(path)
            .map_err(|e| TdeError::io(path, e))
    }

    /// Write fresh, empty files signed with `principal`.
    pub fn create(&self, principal: &PrincipalKey) -> TdeResult<()> {
        let signed = SignedPrincipalKeyInfo::sign(principal)?;
        let header = encode_file_header(&signed, PG_TDE_FILEMAGIC);
        self.write_files(&header, &header)?;
        info!(db = self.db_oid, "created relation key files");
        Ok(())
    }

    /// Replace both files with the given contents, durably.
    pub fn write_files(&self, map: &[u8], dat: &[u8]) -> TdeResult<()> {
        utils::crashsafe::overwrite_durably(&self.dat_path, dat)
            .map_err(|e| TdeError::io(&self.dat_path, e))?;
        utils::crashsafe::overwrite_durably(&self.map_path, map)
            .map_err(|e| TdeError::io(&self.map_path, e))
    }

    pub fn read_header(&self) -> TdeResult<Option<SignedPrincipalKeyInfo>> {
        let mut buf = vec![0u8; KEY_FILE_HEADER_SIZE];
        let mut file = match File::open(&self.map_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TdeError::io(&self.map_path, e)),
        };
        file.read_exact(&mut buf)
            .map_err(|_| TdeError::corrupted(&self.map_path, "file too short"))?;
        decode_file_header(&self.map_path, &buf, PG_TDE_FILEMAGIC).map(Some)
    }

    /// Fail unless the files are signed with `principal`.
    pub fn verify_principal(&self, principal: &PrincipalKey) -> TdeResult<()> {
        match self.read_header()? {
            Some(signed) if signed.verify(&principal.key_data) => Ok(()),
            Some(signed) => Err(TdeError::PrincipalKeyMismatch {
                name: signed.info.name,
            }),
            None => Err(TdeError::NoPrincipalKey(self.db_oid)),
        }
    }

    /// All entries, valid or not, with their indexes.
    pub fn entries(&self) -> TdeResult<Vec<(u32, MapEntry)>> {
        let content = std::fs::read(&self.map_path).map_err(|e| TdeError::io(&self.map_path, e))?;
        if content.len() < KEY_FILE_HEADER_SIZE {
            return Err(TdeError::corrupted(&self.map_path, "file too short"));
        }
        content[KEY_FILE_HEADER_SIZE..]
            .chunks_exact(MAP_ENTRY_SIZE)
            .enumerate()
            .map(|(idx, chunk)| {
                MapEntry::decode(chunk)
                    .map(|e| (idx as u32, e))
                    .map_err(|_| TdeError::corrupted(&self.map_path, "truncated entry"))
            })
            .collect()
    }

    pub fn find(&self, locator: &RelFileNode, key_type: KeyType) -> TdeResult<Option<(u32, MapEntry)>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(_, e)| e.matches(locator, key_type)))
    }

    pub fn read_slot(&self, key_index: u32) -> TdeResult<DataSlot> {
        let file = self.open(&self.dat_path, false)?;
        let mut buf = [0u8; DATA_SLOT_SIZE];
        file.read_exact_at(&mut buf, slot_offset(key_index))
            .map_err(|e| TdeError::io(&self.dat_path, e))?;
        DataSlot::decode(&buf[..]).map_err(|_| TdeError::corrupted(&self.dat_path, "truncated slot"))
    }

    /// Store a wrapped key for `locator`, reusing its existing entry, or the
    /// first free one, or appending. Returns the entry index.
    pub fn insert(&self, locator: &RelFileNode, key_type: KeyType, slot: &DataSlot) -> TdeResult<u32> {
        let entries = self.entries()?;
        let idx = entries
            .iter()
            .find(|(_, e)| e.matches(locator, key_type))
            .or_else(|| entries.iter().find(|(_, e)| !e.is_valid()))
            .map(|(idx, _)| *idx)
            .unwrap_or(entries.len() as u32);

        let dat = self.open(&self.dat_path, true)?;
        dat.write_all_at(&slot.encode(), slot_offset(idx))
            .map_err(|e| TdeError::io(&self.dat_path, e))?;
        dat.sync_all().map_err(|e| TdeError::io(&self.dat_path, e))?;

        let entry = MapEntry {
            spc_oid: locator.spcnode,
            rel_number: locator.relnode,
            flags: key_type as u32,
            key_index: idx,
        };
        let map = self.open(&self.map_path, true)?;
        map.write_all_at(&entry.encode(), entry_offset(idx))
            .map_err(|e| TdeError::io(&self.map_path, e))?;
        map.sync_all().map_err(|e| TdeError::io(&self.map_path, e))?;

        debug!(db = self.db_oid, rel = locator.relnode, idx, "stored relation key");
        Ok(idx)
    }

    /// Mark entry `idx` empty if it still belongs to `locator`. The data
    /// slot is left alone. Returns whether an entry was freed.
    pub fn free_entry(&self, idx: u32, locator: &RelFileNode, key_type: KeyType) -> TdeResult<bool> {
        let map = self.open(&self.map_path, true)?;
        let mut buf = [0u8; MAP_ENTRY_SIZE];
        match map.read_exact_at(&mut buf, entry_offset(idx)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(TdeError::io(&self.map_path, e)),
        }
        let mut entry = MapEntry::decode(&buf[..])
            .map_err(|_| TdeError::corrupted(&self.map_path, "truncated entry"))?;
        if !entry.matches(locator, key_type) {
            return Ok(false);
        }
        entry.flags = MAP_ENTRY_EMPTY;
        map.write_all_at(&entry.encode(), entry_offset(idx))
            .map_err(|e| TdeError::io(&self.map_path, e))?;
        map.sync_all().map_err(|e| TdeError::io(&self.map_path, e))?;
        debug!(db = self.db_oid, rel = locator.relnode, idx, "freed relation key entry");
        Ok(true)
    }

    fn rotation_paths(&self) -> (PathBuf, PathBuf) {
        (
            path_with_suffix_extension(&self.map_path, ROTATION_SUFFIX),
            path_with_suffix_extension(&self.dat_path, ROTATION_SUFFIX),
        )
    }

    /// Re-wrap every valid key under `new` into `.r` siblings of the
    /// files. Empty entries are dropped, so indexes may change. The new
    /// files are fsynced; [`RelKeyMap::install_rotated`] puts them in place.
    pub fn build_rotated(&self, old: &PrincipalKey, new: &PrincipalKey) -> TdeResult<RotatedFiles> {
        self.verify_principal(old)?;

        let header = encode_file_header(&SignedPrincipalKeyInfo::sign(new)?, PG_TDE_FILEMAGIC);
        let mut map = header.clone();
        let mut dat = header;

        for (idx, entry) in self.entries()? {
            let Some(key_type) = KeyType::from_flags(entry.flags) else {
                continue;
            };
            let locator = RelFileNode {
                spcnode: entry.spc_oid,
                dbnode: self.db_oid,
                relnode: entry.rel_number,
            };
            let key = self.read_slot(idx)?.unwrap_key(old, &locator, key_type)?;
            let new_idx = ((map.len() - KEY_FILE_HEADER_SIZE) / MAP_ENTRY_SIZE) as u32;
            map.extend_from_slice(
                &MapEntry {
                    key_index: new_idx,
                    ..entry
                }
                .encode(),
            );
            dat.extend_from_slice(&DataSlot::wrap(new, &locator, key_type, &key)?.encode());
        }

        let (map_r, dat_r) = self.rotation_paths();
        write_and_sync(&map_r, &map)?;
        write_and_sync(&dat_r, &dat)?;
        Ok(RotatedFiles { map, dat })
    }

    pub fn install_rotated(&self) -> TdeResult<()> {
        let (map_r, dat_r) = self.rotation_paths();
        durable_rename(&dat_r, &self.dat_path, true).map_err(|e| TdeError::io(&self.dat_path, e))?;
        durable_rename(&map_r, &self.map_path, true).map_err(|e| TdeError::io(&self.map_path, e))?;
        info!(db = self.db_oid, "installed rotated relation key files");
        Ok(())
    }

    /// Remove rotation leftovers of an interrupted rotation.
    pub fn discard_rotated(&self) {
        let (map_r, dat_r) = self.rotation_paths();
        let _ = std::fs::remove_file(map_r);
        let _ = std::fs::remove_file(dat_r);
    }
}

fn entry_offset(idx: u32) -> u64 {
    (KEY_FILE_HEADER_SIZE + idx as usize * MAP_ENTRY_SIZE) as u64
}

fn slot_offset(idx: u32) -> u64 {
    (KEY_FILE_HEADER_SIZE + idx as usize * DATA_SLOT_SIZE) as u64
}

pub(crate) fn write_and_sync(path: &Path, content: &[u8]) -> TdeResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| TdeError::io(path, e))?;
    file.write_all(content).map_err(|e| TdeError::io(path, e))?;
    file.sync_all().map_err(|e| TdeError::io(path, e))?;
    if let Some(parent) = path.parent() {
        fsync(parent).map_err(|e| TdeError::io(parent, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::PRINCIPAL_KEY_LEN;
    use crate::principal_key::PrincipalKeyInfo;

    fn principal(name: &str, fill: u8) -> PrincipalKey {
        PrincipalKey {
            info: PrincipalKeyInfo {
                database_id: 5,
                keyring_id: 1,
                creation_time: 0,
                name: name.to_string(),
            },
            key_data: [fill; PRINCIPAL_KEY_LEN],
        }
    }

    fn rel(n: u32) -> RelFileNode {
        RelFileNode {
            spcnode: 1663,
            dbnode: 5,
            relnode: n,
        }
    }

    #[test]
    fn insert_reuses_free_entries() {
        let dir = tempfile::tempdir().unwrap();
        let pk = principal("pk1", 1);
        let km = RelKeyMap::new(dir.path(), 5);
        km.create(&pk).unwrap();

        let keys: Vec<InternalKey> = (0..3).map(|_| InternalKey::generate()).collect();
        for (i, key) in keys.iter().enumerate() {
            let slot = DataSlot::wrap(&pk, &rel(i as u32 + 100), KeyType::HeapBasic, key).unwrap();
            assert_eq!(km.insert(&rel(i as u32 + 100), KeyType::HeapBasic, &slot).unwrap(), i as u32);
        }

        assert!(km.free_entry(1, &rel(101), KeyType::HeapBasic).unwrap());
        // freeing twice, or freeing with the wrong owner, is a no-op
        assert!(!km.free_entry(1, &rel(101), KeyType::HeapBasic).unwrap());
        assert!(!km.free_entry(0, &rel(999), KeyType::HeapBasic).unwrap());
        assert!(km.find(&rel(101), KeyType::HeapBasic).unwrap().is_none());

        let fresh = InternalKey::generate();
        let slot = DataSlot::wrap(&pk, &rel(200), KeyType::Smgr, &fresh).unwrap();
        assert_eq!(km.insert(&rel(200), KeyType::Smgr, &slot).unwrap(), 1);

        let (idx, entry) = km.find(&rel(200), KeyType::Smgr).unwrap().unwrap();
        assert_eq!((idx, entry.key_index), (1, 1));
        let unwrapped = km.read_slot(idx).unwrap().unwrap_key(&pk, &rel(200), KeyType::Smgr).unwrap();
        assert_eq!(unwrapped, fresh);
        // the key type is authenticated
        assert!(km.read_slot(idx).unwrap().unwrap_key(&pk, &rel(200), KeyType::HeapBasic).is_err());
    }

    #[test]
    fn rotation_compacts_and_rewraps() {
        let dir = tempfile::tempdir().unwrap();
        let pk1 = principal("pk1", 1);
        let pk2 = principal("pk2", 2);
        let km = RelKeyMap::new(dir.path(), 5);
        km.create(&pk1).unwrap();

        let a = InternalKey::generate();
        let b = InternalKey::generate();
        km.insert(&rel(1), KeyType::HeapBasic, &DataSlot::wrap(&pk1, &rel(1), KeyType::HeapBasic, &a).unwrap())
            .unwrap();
        km.insert(&rel(2), KeyType::HeapBasic, &DataSlot::wrap(&pk1, &rel(2), KeyType::HeapBasic, &b).unwrap())
            .unwrap();
        km.free_entry(0, &rel(1), KeyType::HeapBasic).unwrap();

        assert!(km.build_rotated(&pk2, &pk1).is_err(), "wrong old key must be refused");

        let rotated = km.build_rotated(&pk1, &pk2).unwrap();
        assert_eq!(rotated.map.len(), KEY_FILE_HEADER_SIZE + MAP_ENTRY_SIZE);
        assert_eq!(rotated.dat.len(), KEY_FILE_HEADER_SIZE + DATA_SLOT_SIZE);
        km.install_rotated().unwrap();

        km.verify_principal(&pk2).unwrap();
        assert!(matches!(
            km.verify_principal(&pk1),
            Err(TdeError::PrincipalKeyMismatch { .. })
        ));
        let (idx, _) = km.find(&rel(2), KeyType::HeapBasic).unwrap().unwrap();
        assert_eq!(idx, 0);
        let key = km.read_slot(idx).unwrap().unwrap_key(&pk2, &rel(2), KeyType::HeapBasic).unwrap();
        assert_eq!(key, b);
    }
}
