//! Principal keys and where they come from.
//!
//! A principal key never touches the key files in the clear. The files only
//! record which key wraps them ([`PrincipalKeyInfo`]) plus a GCM tag over
//! that record, which lets a reader tell a wrong key from a corrupted file
//! before decrypting anything.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use postgres_ffi::Oid;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroize;

use crate::encryption::{
    aead_decrypt, aead_encrypt, random_entry_iv, AEAD_TAG_LEN, ENTRY_IV_LEN, PRINCIPAL_KEY_LEN,
};
use crate::error::{TdeError, TdeResult};

pub const TDE_KEY_NAME_LEN: usize = 64;
pub const PRINCIPAL_KEY_INFO_SIZE: usize = 4 + 4 + 8 + TDE_KEY_NAME_LEN;
pub const SIGNED_KEY_INFO_SIZE: usize = PRINCIPAL_KEY_INFO_SIZE + ENTRY_IV_LEN + AEAD_TAG_LEN;

/// Non-secret description of a principal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalKeyInfo {
    pub database_id: Oid,
    pub keyring_id: u32,
    /// Seconds since the Unix epoch.
    pub creation_time: i64,
    pub name: String,
}

impl PrincipalKeyInfo {
    pub fn encode(&self) -> [u8; PRINCIPAL_KEY_INFO_SIZE] {
        let mut buf = [0u8; PRINCIPAL_KEY_INFO_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        // writes into a fixed array of the right size cannot fail
        let _ = w.write_u32::<LittleEndian>(self.database_id);
        let _ = w.write_u32::<LittleEndian>(self.keyring_id);
        let _ = w.write_i64::<LittleEndian>(self.creation_time);
        let name = self.name.as_bytes();
        let n = name.len().min(TDE_KEY_NAME_LEN - 1);
        let _ = w.write_all(&name[..n]);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Option<PrincipalKeyInfo> {
        let database_id = buf.read_u32::<LittleEndian>().ok()?;
        let keyring_id = buf.read_u32::<LittleEndian>().ok()?;
        let creation_time = buf.read_i64::<LittleEndian>().ok()?;
        let mut name = [0u8; TDE_KEY_NAME_LEN];
        buf.read_exact(&mut name).ok()?;
        let len = name.iter().position(|b| *b == 0).unwrap_or(TDE_KEY_NAME_LEN);
        Some(PrincipalKeyInfo {
            database_id,
            keyring_id,
            creation_time,
            name: String::from_utf8_lossy(&name[..len]).into_owned(),
        })
    }
}

/// A principal key with its material.
#[derive(Clone)]
pub struct PrincipalKey {
    pub info: PrincipalKeyInfo,
    pub key_data: [u8; PRINCIPAL_KEY_LEN],
}

impl Drop for PrincipalKey {
    fn drop(&mut self) {
        self.key_data.zeroize();
    }
}

impl std::fmt::Debug for PrincipalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalKey")
            .field("info", &self.info)
            .field("key_data", &"[REDACTED]")
            .finish()
    }
}

impl PrincipalKey {
    /// Same key material and name, regardless of which database uses it.
    pub fn same_key(&self, other: &PrincipalKey) -> bool {
        self.key_data == other.key_data && self.info.name == other.info.name
    }
}

/// Key info as stored in key file headers, authenticated with the key it
/// names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPrincipalKeyInfo {
    pub info: PrincipalKeyInfo,
    pub sign_iv: [u8; ENTRY_IV_LEN],
    pub aead_tag: [u8; AEAD_TAG_LEN],
}

impl SignedPrincipalKeyInfo {
    pub fn sign(key: &PrincipalKey) -> TdeResult<SignedPrincipalKeyInfo> {
        let sign_iv = random_entry_iv();
        let aead_tag = aead_encrypt(&key.key_data, &sign_iv, &key.info.encode(), &mut [])?;
        Ok(SignedPrincipalKeyInfo {
            info: key.info.clone(),
            sign_iv,
            aead_tag,
        })
    }

    /// Check that `key_data` is the key this header was signed with.
    pub fn verify(&self, key_data: &[u8; PRINCIPAL_KEY_LEN]) -> bool {
        aead_decrypt(
            key_data,
            &self.sign_iv,
            &self.info.encode(),
            &mut [],
            &self.aead_tag,
        )
        .is_ok()
    }

    pub fn encode(&self) -> [u8; SIGNED_KEY_INFO_SIZE] {
        let mut buf = [0u8; SIGNED_KEY_INFO_SIZE];
        buf[..PRINCIPAL_KEY_INFO_SIZE].copy_from_slice(&self.info.encode());
        buf[PRINCIPAL_KEY_INFO_SIZE..PRINCIPAL_KEY_INFO_SIZE + ENTRY_IV_LEN]
            .copy_from_slice(&self.sign_iv);
        buf[PRINCIPAL_KEY_INFO_SIZE + ENTRY_IV_LEN..].copy_from_slice(&self.aead_tag);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<SignedPrincipalKeyInfo> {
        if buf.len() < SIGNED_KEY_INFO_SIZE {
            return None;
        }
        let info = PrincipalKeyInfo::decode(&buf[..PRINCIPAL_KEY_INFO_SIZE])?;
        let mut sign_iv = [0u8; ENTRY_IV_LEN];
        sign_iv.copy_from_slice(&buf[PRINCIPAL_KEY_INFO_SIZE..PRINCIPAL_KEY_INFO_SIZE + ENTRY_IV_LEN]);
        let mut aead_tag = [0u8; AEAD_TAG_LEN];
        aead_tag.copy_from_slice(
            &buf[PRINCIPAL_KEY_INFO_SIZE + ENTRY_IV_LEN..SIGNED_KEY_INFO_SIZE],
        );
        Some(SignedPrincipalKeyInfo {
            info,
            sign_iv,
            aead_tag,
        })
    }
}

/// An external store of principal keys, addressed by name.
pub trait PrincipalKeyProvider: Send + Sync {
    fn keyring_id(&self) -> u32;

    /// `Ok(None)` if the keyring answered but has no such key.
    fn get_key(&self, name: &str) -> TdeResult<Option<[u8; PRINCIPAL_KEY_LEN]>>;

    /// Generate a fresh key under `name`. Fails if the name is taken.
    fn create_key(&self, name: &str) -> TdeResult<[u8; PRINCIPAL_KEY_LEN]>;
}

/// Look up `name` and package it as the principal key of `database_id`.
pub fn load_principal_key(
    provider: &dyn PrincipalKeyProvider,
    database_id: Oid,
    name: &str,
) -> TdeResult<PrincipalKey> {
    let key_data = provider
        .get_key(name)?
        .ok_or_else(|| TdeError::KeyNotInKeyring {
            name: name.to_string(),
        })?;
    Ok(PrincipalKey {
        info: PrincipalKeyInfo {
            database_id,
            keyring_id: provider.keyring_id(),
            creation_time: postgres_ffi::xlog_utils::current_pg_time(),
            name: name.to_string(),
        },
        key_data,
    })
}

#[derive(Default, Serialize, Deserialize)]
struct KeyringFile {
    /// key name to hex-encoded key material
    keys: BTreeMap<String, String>,
}

/// Keyring kept in a local JSON file.
pub struct FileKeyring {
    id: u32,
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyring {
    pub fn new(id: u32, path: impl Into<PathBuf>) -> FileKeyring {
        FileKeyring {
            id,
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> TdeResult<KeyringFile> {
        match std::fs::read(&self.path) {
            Ok(content) => serde_json::from_slice(&content)
                .map_err(|e| TdeError::Keyring(format!("could not parse {}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyringFile::default()),
            Err(e) => Err(TdeError::io(&self.path, e)),
        }
    }
}

impl PrincipalKeyProvider for FileKeyring {
    fn keyring_id(&self) -> u32 {
        self.id
    }

    fn get_key(&self, name: &str) -> TdeResult<Option<[u8; PRINCIPAL_KEY_LEN]>> {
        let _guard = self.lock.lock();
        let file = self.load()?;
        let Some(encoded) = file.keys.get(name) else {
            return Ok(None);
        };
        let mut key = [0u8; PRINCIPAL_KEY_LEN];
        hex::decode_to_slice(encoded, &mut key)
            .map_err(|e| TdeError::Keyring(format!("key \"{name}\" is malformed: {e}")))?;
        Ok(Some(key))
    }

    fn create_key(&self, name: &str) -> TdeResult<[u8; PRINCIPAL_KEY_LEN]> {
        if name.is_empty() || name.len() >= TDE_KEY_NAME_LEN {
            return Err(TdeError::Keyring(format!(
                "key name must be 1 to {} bytes long",
                TDE_KEY_NAME_LEN - 1
            )));
        }
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        if file.keys.contains_key(name) {
            return Err(TdeError::Keyring(format!("key \"{name}\" already exists")));
        }
        let mut key = [0u8; PRINCIPAL_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        file.keys.insert(name.to_string(), hex::encode(key));

        let content = serde_json::to_vec_pretty(&file)
            .map_err(|e| TdeError::Keyring(format!("could not serialize keyring: {e}")))?;
        utils::crashsafe::overwrite_durably(&self.path, &content)
            .map_err(|e| TdeError::io(&self.path, e))?;
        info!(keyring = self.id, "created principal key \"{name}\"");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_info_roundtrip_and_verify() {
        let key = PrincipalKey {
            info: PrincipalKeyInfo {
                database_id: 5,
                keyring_id: 1,
                creation_time: 1_700_000_000,
                name: "pk1".to_string(),
            },
            key_data: [3u8; PRINCIPAL_KEY_LEN],
        };
        let signed = SignedPrincipalKeyInfo::sign(&key).unwrap();
        let decoded = SignedPrincipalKeyInfo::decode(&signed.encode()).unwrap();
        assert_eq!(decoded, signed);
        assert!(decoded.verify(&key.key_data));
        assert!(!decoded.verify(&[4u8; PRINCIPAL_KEY_LEN]));

        let mut renamed = decoded.clone();
        renamed.info.name = "pk2".to_string();
        assert!(!renamed.verify(&key.key_data));
    }

    #[test]
    fn file_keyring_create_and_get() {
        let dir = camino_tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(1, dir.path().join("keyring.json"));
        assert_eq!(keyring.get_key("pk1").unwrap(), None);

        let created = keyring.create_key("pk1").unwrap();
        assert_eq!(keyring.get_key("pk1").unwrap(), Some(created));
        assert!(keyring.create_key("pk1").is_err());

        // a second handle on the same file sees the key
        let again = FileKeyring::new(1, keyring.path());
        assert_eq!(again.get_key("pk1").unwrap(), Some(created));

        let loaded = load_principal_key(&again, 1664, "pk1").unwrap();
        assert_eq!(loaded.info.database_id, 1664);
        assert_eq!(loaded.key_data, created);
        assert!(matches!(
            load_principal_key(&again, 1664, "nope"),
            Err(TdeError::KeyNotInKeyring { .. })
        ));
    }
}
