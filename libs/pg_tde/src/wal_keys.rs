//! The WAL key file.
//!
//! One file, `wal_keys`, holds every internal key the WAL was ever written
//! with. Entries are appended in start-LSN order. A key is appended with an
//! invalid start when a process starts (or the principal key rotates) and
//! gets its start patched in by the first write that uses it. The key
//! covers WAL from its start up to the start of the next valid entry.
//!
//! Only the key material is encrypted. The entry type is authenticated; the
//! start position and the key type stay writable in place, since both are
//! patched after the entry was written.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use postgres_ffi::TimeLineID;
use tracing::{debug, info, warn};
use utils::crashsafe::{durable_rename, path_with_suffix_extension};
use utils::lsn::Lsn;

use crate::encryption::{
    aead_decrypt, aead_encrypt, random_entry_iv, InternalKey, AEAD_TAG_LEN, BASE_IV_LEN,
    ENTRY_IV_LEN, INTERNAL_KEY_LEN,
};
use crate::error::{TdeError, TdeResult};
use crate::keymap::{decode_file_header, encode_file_header, write_and_sync, KEY_FILE_HEADER_SIZE, ROTATION_SUFFIX};
use crate::principal_key::{PrincipalKey, SignedPrincipalKeyInfo};

pub const PG_TDE_WAL_KEY_FILE_MAGIC: u32 = 0x014B_4557;
pub const WAL_KEY_FILE_NAME: &str = "wal_keys";

const ENTRY_TYPE_OFF: usize = 0;
const KEY_TYPE_OFF: usize = 4;
const START_LSN_OFF: usize = 8;
const START_TLI_OFF: usize = 16;
const BASE_IV_OFF: usize = 24;
const ENC_KEY_OFF: usize = BASE_IV_OFF + BASE_IV_LEN;
const ENTRY_IV_OFF: usize = ENC_KEY_OFF + INTERNAL_KEY_LEN;
const AEAD_TAG_OFF: usize = ENTRY_IV_OFF + ENTRY_IV_LEN;
pub const WAL_KEY_ENTRY_SIZE: usize = AEAD_TAG_OFF + AEAD_TAG_LEN;

/// Bytes of an entry covered by its AEAD tag as additional data.
const AAD_LEN: usize = KEY_TYPE_OFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WalKeyType {
    Unencrypted = 0x08,
    Encrypted = 0x10,
    Invalid = 0x20,
}

impl WalKeyType {
    pub fn from_u32(v: u32) -> Option<WalKeyType> {
        match v {
            0x08 => Some(WalKeyType::Unencrypted),
            0x10 => Some(WalKeyType::Encrypted),
            0x20 => Some(WalKeyType::Invalid),
            _ => None,
        }
    }
}

/// A WAL key with its position, decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalKey {
    pub key_type: WalKeyType,
    pub start_lsn: Lsn,
    pub start_tli: TimeLineID,
    pub key: InternalKey,
}

/// The stretch of WAL `[start, end)` a key applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalKeyRange {
    pub start: Lsn,
    pub end: Lsn,
    pub key_type: WalKeyType,
    pub key: InternalKey,
}

impl WalKeyRange {
    pub fn is_encrypted(&self) -> bool {
        self.key_type == WalKeyType::Encrypted
    }

    pub fn overlaps(&self, start: Lsn, end: Lsn) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Debug, Clone)]
struct RawEntry {
    bytes: [u8; WAL_KEY_ENTRY_SIZE],
}

impl RawEntry {
    fn seal(principal: &PrincipalKey, key: &WalKey) -> TdeResult<RawEntry> {
        let mut bytes = [0u8; WAL_KEY_ENTRY_SIZE];
        LittleEndian::write_u32(&mut bytes[ENTRY_TYPE_OFF..], key.key_type as u32);
        LittleEndian::write_u32(&mut bytes[KEY_TYPE_OFF..], key.key_type as u32);
        LittleEndian::write_u64(&mut bytes[START_LSN_OFF..], key.start_lsn.0);
        LittleEndian::write_u32(&mut bytes[START_TLI_OFF..], key.start_tli);
        bytes[BASE_IV_OFF..ENC_KEY_OFF].copy_from_slice(&key.key.base_iv);

        let entry_iv = random_entry_iv();
        let mut enc_key = key.key.key;
        let tag = aead_encrypt(&principal.key_data, &entry_iv, &bytes[..AAD_LEN], &mut enc_key)?;
        bytes[ENC_KEY_OFF..ENTRY_IV_OFF].copy_from_slice(&enc_key);
        bytes[ENTRY_IV_OFF..AEAD_TAG_OFF].copy_from_slice(&entry_iv);
        bytes[AEAD_TAG_OFF..].copy_from_slice(&tag);
        Ok(RawEntry { bytes })
    }

    fn key_type(&self) -> Option<WalKeyType> {
        WalKeyType::from_u32(LittleEndian::read_u32(&self.bytes[KEY_TYPE_OFF..]))
    }

    fn start_lsn(&self) -> Lsn {
        Lsn(LittleEndian::read_u64(&self.bytes[START_LSN_OFF..]))
    }

    fn start_tli(&self) -> TimeLineID {
        LittleEndian::read_u32(&self.bytes[START_TLI_OFF..])
    }

    fn open(&self, principal: &PrincipalKey) -> TdeResult<InternalKey> {
        let mut key = InternalKey {
            key: [0u8; INTERNAL_KEY_LEN],
            base_iv: [0u8; BASE_IV_LEN],
        };
        key.key.copy_from_slice(&self.bytes[ENC_KEY_OFF..ENTRY_IV_OFF]);
        key.base_iv.copy_from_slice(&self.bytes[BASE_IV_OFF..ENC_KEY_OFF]);
        let mut iv = [0u8; ENTRY_IV_LEN];
        iv.copy_from_slice(&self.bytes[ENTRY_IV_OFF..AEAD_TAG_OFF]);
        let mut tag = [0u8; AEAD_TAG_LEN];
        tag.copy_from_slice(&self.bytes[AEAD_TAG_OFF..]);
        aead_decrypt(&principal.key_data, &iv, &self.bytes[..AAD_LEN], &mut key.key, &tag)
            .map_err(|_| TdeError::Decrypt("WAL key does not authenticate under the server principal key".to_string()))?;
        Ok(key)
    }

    fn decode(&self, principal: &PrincipalKey) -> TdeResult<Option<WalKey>> {
        let Some(key_type) = self.key_type() else {
            return Ok(None);
        };
        Ok(Some(WalKey {
            key_type,
            start_lsn: self.start_lsn(),
            start_tli: self.start_tli(),
            key: self.open(principal)?,
        }))
    }
}

/// Handle on the WAL key file in a key directory.
#[derive(Debug, Clone)]
pub struct WalKeyFile {
    path: PathBuf,
}

impl WalKeyFile {
    pub fn new(key_dir: &Path) -> WalKeyFile {
        WalKeyFile {
            path: key_dir.join(WAL_KEY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open(&self, write: bool) -> TdeResult<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(&self.path)
            .map_err(|e| TdeError::io(&self.path, e))
    }

    pub fn create(&self, principal: &PrincipalKey) -> TdeResult<()> {
        let header = encode_file_header(&SignedPrincipalKeyInfo::sign(principal)?, PG_TDE_WAL_KEY_FILE_MAGIC);
        utils::crashsafe::overwrite_durably(&self.path, &header).map_err(|e| TdeError::io(&self.path, e))?;
        info!("created WAL key file");
        Ok(())
    }

    pub fn read_header(&self) -> TdeResult<Option<SignedPrincipalKeyInfo>> {
        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TdeError::io(&self.path, e)),
        };
        decode_file_header(&self.path, &content, PG_TDE_WAL_KEY_FILE_MAGIC).map(Some)
    }

    pub fn verify_principal(&self, principal: &PrincipalKey) -> TdeResult<()> {
        match self.read_header()? {
            Some(signed) if signed.verify(&principal.key_data) => Ok(()),
            Some(signed) => Err(TdeError::PrincipalKeyMismatch {
                name: signed.info.name,
            }),
            None => Err(TdeError::NoPrincipalKey(principal.info.database_id)),
        }
    }

    fn raw_entries(&self) -> TdeResult<Vec<RawEntry>> {
        let content = std::fs::read(&self.path).map_err(|e| TdeError::io(&self.path, e))?;
        if content.len() < KEY_FILE_HEADER_SIZE {
            return Err(TdeError::corrupted(&self.path, "file too short"));
        }
        let body = &content[KEY_FILE_HEADER_SIZE..];
        if body.len() % WAL_KEY_ENTRY_SIZE != 0 {
            warn!(
                "WAL key file {} has a torn trailing entry, ignoring it",
                self.path.display()
            );
        }
        Ok(body
            .chunks_exact(WAL_KEY_ENTRY_SIZE)
            .map(|chunk| {
                let mut bytes = [0u8; WAL_KEY_ENTRY_SIZE];
                bytes.copy_from_slice(chunk);
                RawEntry { bytes }
            })
            .collect())
    }

    pub fn entry_count(&self) -> TdeResult<usize> {
        Ok(self.raw_entries()?.len())
    }

    /// Every entry, including unfinished and invalidated ones.
    pub fn entries(&self, principal: &PrincipalKey) -> TdeResult<Vec<WalKey>> {
        let mut keys = Vec::new();
        for raw in self.raw_entries()? {
            if let Some(key) = raw.decode(principal)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Append a fresh key of `key_type` with an invalid start, creating the
    /// file if needed.
    pub fn create_key(&self, principal: &PrincipalKey, key_type: WalKeyType) -> TdeResult<WalKey> {
        if !self.exists() {
            self.create(principal)?;
        } else {
            self.verify_principal(principal)?;
        }
        let key = WalKey {
            key_type,
            start_lsn: Lsn::INVALID,
            start_tli: 0,
            key: InternalKey::generate(),
        };
        let entry = RawEntry::seal(principal, &key)?;
        let file = self.open(true)?;
        let len = file.metadata().map_err(|e| TdeError::io(&self.path, e))?.len();
        let count = (len as usize).saturating_sub(KEY_FILE_HEADER_SIZE) / WAL_KEY_ENTRY_SIZE;
        file.write_all_at(&entry.bytes, (KEY_FILE_HEADER_SIZE + count * WAL_KEY_ENTRY_SIZE) as u64)
            .map_err(|e| TdeError::io(&self.path, e))?;
        file.sync_all().map_err(|e| TdeError::io(&self.path, e))?;
        debug!(?key_type, "appended new WAL key");
        Ok(key)
    }

    /// Record where the newest key starts being used. An older key that
    /// claims to start at or after that position can never be reached and
    /// is invalidated.
    pub fn set_last_key_start(&self, lsn: Lsn, tli: TimeLineID) -> TdeResult<()> {
        let file = self.open(true)?;
        let count = self.raw_entries()?.len();
        if count == 0 {
            return Err(TdeError::corrupted(&self.path, "no key to set the start of"));
        }
        let last_off = (KEY_FILE_HEADER_SIZE + (count - 1) * WAL_KEY_ENTRY_SIZE) as u64;
        let mut pos = [0u8; 12];
        LittleEndian::write_u64(&mut pos[0..8], lsn.0);
        LittleEndian::write_u32(&mut pos[8..12], tli);
        file.write_all_at(&pos, last_off + START_LSN_OFF as u64)
            .map_err(|e| TdeError::io(&self.path, e))?;

        if count > 1 {
            let prev_off = last_off - WAL_KEY_ENTRY_SIZE as u64;
            let mut prev = [0u8; WAL_KEY_ENTRY_SIZE];
            file.read_exact_at(&mut prev, prev_off)
                .map_err(|e| TdeError::io(&self.path, e))?;
            let prev_start = Lsn(LittleEndian::read_u64(&prev[START_LSN_OFF..]));
            if prev_start >= lsn {
                let mut invalid = [0u8; 4];
                LittleEndian::write_u32(&mut invalid, WalKeyType::Invalid as u32);
                file.write_all_at(&invalid, prev_off + KEY_TYPE_OFF as u64)
                    .map_err(|e| TdeError::io(&self.path, e))?;
                info!("invalidated WAL key starting at {prev_start}, superseded at {lsn}");
            }
        }
        file.sync_all().map_err(|e| TdeError::io(&self.path, e))?;
        debug!("WAL key now starts at {lsn} on timeline {tli}");
        Ok(())
    }

    /// Usable key ranges, in LSN order. Keys that never got a start and
    /// invalidated keys are skipped; each range ends where the next begins
    /// and the last one is open-ended.
    pub fn fetch_ranges(&self, principal: &PrincipalKey) -> TdeResult<Vec<WalKeyRange>> {
        let mut ranges: Vec<WalKeyRange> = Vec::new();
        for raw in self.raw_entries()? {
            let start = raw.start_lsn();
            let key_type = match raw.key_type() {
                Some(t @ (WalKeyType::Encrypted | WalKeyType::Unencrypted)) => t,
                _ => continue,
            };
            if !start.is_valid() {
                continue;
            }
            let key = raw.open(principal)?;
            if let Some(prev) = ranges.last_mut() {
                prev.end = start;
            }
            ranges.push(WalKeyRange {
                start,
                end: Lsn::MAX,
                key_type,
                key,
            });
        }
        Ok(ranges)
    }

    fn rotation_path(&self) -> PathBuf {
        path_with_suffix_extension(&self.path, ROTATION_SUFFIX)
    }

    /// Re-wrap every entry under `new` into a `.r` sibling and return its
    /// bytes. Positions and key types are carried over unchanged.
    pub fn build_rotated(&self, old: &PrincipalKey, new: &PrincipalKey) -> TdeResult<Vec<u8>> {
        self.verify_principal(old)?;
        let mut content = encode_file_header(&SignedPrincipalKeyInfo::sign(new)?, PG_TDE_WAL_KEY_FILE_MAGIC);
        for raw in self.raw_entries()? {
            let entry_type = LittleEndian::read_u32(&raw.bytes[ENTRY_TYPE_OFF..]);
            let Some(sealed_type) = WalKeyType::from_u32(entry_type) else {
                return Err(TdeError::corrupted(&self.path, format!("unknown WAL key type {entry_type}")));
            };
            let key = WalKey {
                key_type: sealed_type,
                start_lsn: raw.start_lsn(),
                start_tli: raw.start_tli(),
                key: raw.open(old)?,
            };
            let mut sealed = RawEntry::seal(new, &key)?;
            sealed.bytes[KEY_TYPE_OFF..START_LSN_OFF].copy_from_slice(&raw.bytes[KEY_TYPE_OFF..START_LSN_OFF]);
            content.extend_from_slice(&sealed.bytes);
        }
        write_and_sync(&self.rotation_path(), &content)?;
        Ok(content)
    }

    pub fn install_rotated(&self) -> TdeResult<()> {
        durable_rename(self.rotation_path(), &self.path, true).map_err(|e| TdeError::io(&self.path, e))?;
        info!("installed rotated WAL key file");
        Ok(())
    }

    pub fn discard_rotated(&self) {
        let _ = std::fs::remove_file(self.rotation_path());
    }

    /// Replace the whole file, as replayed from a rotation record.
    pub fn write_file(&self, content: &[u8]) -> TdeResult<()> {
        utils::crashsafe::overwrite_durably(&self.path, content).map_err(|e| TdeError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::PRINCIPAL_KEY_LEN;
    use crate::principal_key::PrincipalKeyInfo;

    fn principal(name: &str, fill: u8) -> PrincipalKey {
        PrincipalKey {
            info: PrincipalKeyInfo {
                database_id: 1664,
                keyring_id: 1,
                creation_time: 0,
                name: name.to_string(),
            },
            key_data: [fill; PRINCIPAL_KEY_LEN],
        }
    }

    #[test]
    fn new_keys_become_ranges_once_started() {
        let dir = tempfile::tempdir().unwrap();
        let pk = principal("server", 9);
        let wk = WalKeyFile::new(dir.path());

        let k1 = wk.create_key(&pk, WalKeyType::Encrypted).unwrap();
        assert!(wk.fetch_ranges(&pk).unwrap().is_empty());
        wk.set_last_key_start(Lsn(0x0100_0000), 1).unwrap();

        let k2 = wk.create_key(&pk, WalKeyType::Encrypted).unwrap();
        wk.set_last_key_start(Lsn(0x0100_4000), 1).unwrap();

        // a restart appends a key that is never used
        wk.create_key(&pk, WalKeyType::Encrypted).unwrap();

        let ranges = wk.fetch_ranges(&pk).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].end), (Lsn(0x0100_0000), Lsn(0x0100_4000)));
        assert_eq!((ranges[1].start, ranges[1].end), (Lsn(0x0100_4000), Lsn::MAX));
        assert_eq!(ranges[0].key, k1.key);
        assert_eq!(ranges[1].key, k2.key);
        assert_eq!(wk.entry_count().unwrap(), 3);
    }

    #[test]
    fn overlapping_start_invalidates_previous_key() {
        let dir = tempfile::tempdir().unwrap();
        let pk = principal("server", 9);
        let wk = WalKeyFile::new(dir.path());

        wk.create_key(&pk, WalKeyType::Encrypted).unwrap();
        wk.set_last_key_start(Lsn(0x0200_0000), 1).unwrap();
        // a replica restarting re-reads from the segment start
        let k2 = wk.create_key(&pk, WalKeyType::Encrypted).unwrap();
        wk.set_last_key_start(Lsn(0x0200_0000), 1).unwrap();

        let entries = wk.entries(&pk).unwrap();
        assert_eq!(entries[0].key_type, WalKeyType::Invalid);
        let ranges = wk.fetch_ranges(&pk).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].key, k2.key);
    }

    #[test]
    fn rotation_keeps_positions() {
        let dir = tempfile::tempdir().unwrap();
        let pk1 = principal("pk1", 1);
        let pk2 = principal("pk2", 2);
        let wk = WalKeyFile::new(dir.path());

        wk.create_key(&pk1, WalKeyType::Encrypted).unwrap();
        wk.set_last_key_start(Lsn(0x0100_0000), 1).unwrap();
        wk.create_key(&pk1, WalKeyType::Unencrypted).unwrap();
        wk.set_last_key_start(Lsn(0x0100_0000), 1).unwrap();
        let before = wk.entries(&pk1).unwrap();

        let bytes = wk.build_rotated(&pk1, &pk2).unwrap();
        wk.install_rotated().unwrap();
        assert_eq!(std::fs::read(wk.path()).unwrap(), bytes);

        assert!(wk.verify_principal(&pk1).is_err());
        let after = wk.entries(&pk2).unwrap();
        assert_eq!(before, after);
        assert_eq!(after[0].key_type, WalKeyType::Invalid);
    }
}
