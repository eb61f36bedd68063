//! Ciphers used by the key files and the WAL.
//!
//! Internal keys encrypt data with AES-256 in counter mode. They are stored
//! wrapped under a principal key with AES-256-GCM, the non-secret part of
//! each file entry serving as additional authenticated data.
//!
//! IVs are 128-bit big-endian integers: all IV arithmetic happens on `u128`
//! and is converted to bytes with `to_be_bytes` only at the cipher boundary.

use aes::Aes256;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use postgres_ffi::TimeLineID;
use rand::RngCore;
use utils::lsn::Lsn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{TdeError, TdeResult};

pub const INTERNAL_KEY_LEN: usize = 32;
pub const PRINCIPAL_KEY_LEN: usize = 32;
pub const BASE_IV_LEN: usize = 16;
/// Room reserved for a GCM nonce in file entries; only the first
/// [`GCM_NONCE_LEN`] bytes are used.
pub const ENTRY_IV_LEN: usize = 16;
pub const GCM_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Keeps the low word of a base IV below 2^31 so that advancing the counter
/// through a whole segment never carries into the position bits.
const BASE_IV_COUNTER_MASK: u128 = !(1u128 << 31);

/// A symmetric key plus the IV its counter streams start from.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct InternalKey {
    pub key: [u8; INTERNAL_KEY_LEN],
    pub base_iv: [u8; BASE_IV_LEN],
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalKey")
            .field("key", &"[REDACTED]")
            .field("base_iv", &hex::encode(self.base_iv))
            .finish()
    }
}

impl InternalKey {
    pub fn generate() -> InternalKey {
        let mut key = [0u8; INTERNAL_KEY_LEN];
        let mut base_iv = [0u8; BASE_IV_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut base_iv);
        let base_iv = (u128::from_be_bytes(base_iv) & BASE_IV_COUNTER_MASK).to_be_bytes();
        InternalKey { key, base_iv }
    }

    /// Encrypt or decrypt `buf` in place. `offset` is the position of
    /// `buf[0]` in the stream that starts at `iv`, so any sub-range of a
    /// stream can be processed independently.
    pub fn stream_crypt(&self, iv: &[u8; BASE_IV_LEN], offset: u64, buf: &mut [u8]) {
        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(iv),
        );
        cipher.seek(offset);
        cipher.apply_keystream(buf);
    }
}

/// IV of the counter stream covering the WAL segment that starts at
/// `seg_start` on timeline `tli`: `base_iv + (tli << 112 | seg_start << 32)`.
pub fn wal_segment_iv(base_iv: &[u8; BASE_IV_LEN], tli: TimeLineID, seg_start: Lsn) -> [u8; BASE_IV_LEN] {
    let base = u128::from_be_bytes(*base_iv);
    let position = ((tli as u128) << 112) | ((seg_start.0 as u128) << 32);
    base.wrapping_add(position).to_be_bytes()
}

pub fn random_entry_iv() -> [u8; ENTRY_IV_LEN] {
    let mut iv = [0u8; ENTRY_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv[..GCM_NONCE_LEN]);
    iv
}

/// AES-256-GCM encryption in place, returning the detached tag.
pub fn aead_encrypt(
    key: &[u8; PRINCIPAL_KEY_LEN],
    iv: &[u8; ENTRY_IV_LEN],
    aad: &[u8],
    buf: &mut [u8],
) -> TdeResult<[u8; AEAD_TAG_LEN]> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv[..GCM_NONCE_LEN]), aad, buf)
        .map_err(|_| TdeError::Decrypt("AES-GCM encryption failed".to_string()))?;
    let mut out = [0u8; AEAD_TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// AES-256-GCM decryption in place. Fails if the tag does not verify, in
/// which case `buf` holds garbage.
pub fn aead_decrypt(
    key: &[u8; PRINCIPAL_KEY_LEN],
    iv: &[u8; ENTRY_IV_LEN],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; AEAD_TAG_LEN],
) -> TdeResult<()> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv[..GCM_NONCE_LEN]),
            aad,
            buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| TdeError::Decrypt("AEAD tag mismatch".to_string()))
}
