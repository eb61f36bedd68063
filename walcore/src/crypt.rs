//!
//! Segment I/O with optional encryption.
//!
//! Writes are encrypted with the WAL key that is current when the write
//! happens; reads are decrypted range by range with whatever key the WAL
//! key file says covered each byte. The keystream of a segment starts at
//! the IV derived from the key's base IV, the segment's timeline and the
//! segment's start LSN, and a byte at offset `o` of the segment is combined
//! with keystream byte `o`, so any sub-range can be processed on its own.
//!
//! Pages are written out whole, so a page that reads back as all zeros was
//! never written and is passed through untouched; that keeps the end of WAL
//! detectable in encrypted segments.
//!
use std::sync::Arc;

use pg_tde::encryption::wal_segment_iv;
use pg_tde::{InternalKey, TdeError, TdeKeyManager};
use postgres_ffi::{TimeLineID, XLogSegNo, XLOG_BLCKSZ};
use utils::lsn::Lsn;

use crate::error::{WalError, WalResult};
use crate::segment::{SegmentDir, SegmentFile};

/// Encrypt or decrypt, in place, `buf` holding the WAL that starts at `lsn`
/// in a segment of timeline `tli`.
pub fn crypt_wal(key: &InternalKey, tli: TimeLineID, lsn: Lsn, seg_size: usize, buf: &mut [u8]) {
    let iv = wal_segment_iv(&key.base_iv, tli, lsn.segment_lsn(seg_size));
    key.stream_crypt(&iv, lsn.segment_offset(seg_size) as u64, buf);
}

/// Segment reads and writes, through the TDE key manager when there is one.
pub struct WalIo {
    segments: SegmentDir,
    tde: Option<Arc<TdeKeyManager>>,
}

impl WalIo {
    pub fn new(segments: SegmentDir, tde: Option<Arc<TdeKeyManager>>) -> WalIo {
        WalIo { segments, tde }
    }

    pub fn segments(&self) -> &SegmentDir {
        &self.segments
    }

    pub fn seg_size(&self) -> usize {
        self.segments.seg_size()
    }

    pub fn tde(&self) -> Option<&Arc<TdeKeyManager>> {
        self.tde.as_ref()
    }

    /// Write `buf` at `lsn`, which lies in the segment `file` holds.
    pub fn write(&self, file: &SegmentFile, lsn: Lsn, buf: &[u8]) -> WalResult<()> {
        let seg_size = self.seg_size();
        debug_assert_eq!(lsn.segment_number(seg_size), file.segno());
        debug_assert!(lsn.segment_offset(seg_size) + buf.len() <= seg_size);

        let key = match &self.tde {
            Some(tde) => tde.wal_key_for_write(lsn, file.tli()).map_err(key_error)?,
            None => None,
        };
        let off = lsn.segment_offset(seg_size);
        match key {
            Some(key) => {
                let mut encrypted = buf.to_vec();
                crypt_wal(&key, file.tli(), lsn, seg_size, &mut encrypted);
                file.pwrite(off, &encrypted)
            }
            None => file.pwrite(off, buf),
        }
    }

    /// Read `len` plaintext bytes at `lsn` from `file`.
    pub fn read(&self, file: &SegmentFile, lsn: Lsn, len: usize) -> WalResult<Vec<u8>> {
        let seg_size = self.seg_size();
        let mut buf = file.pread(lsn.segment_offset(seg_size), len)?;
        if let Some(tde) = &self.tde {
            decrypt_ranges(tde, file.tli(), lsn, seg_size, &mut buf)?;
        }
        Ok(buf)
    }

    pub fn open_read(&self, tli: TimeLineID, segno: XLogSegNo) -> WalResult<Option<SegmentFile>> {
        self.segments.open_read(tli, segno)
    }
}

fn key_error(e: TdeError) -> WalError {
    match e {
        TdeError::NoPrincipalKey(_)
        | TdeError::KeyNotInKeyring { .. }
        | TdeError::PrincipalKeyMismatch { .. } => WalError::KeyUnavailable(e.to_string()),
        other => WalError::Tde(other),
    }
}

/// Decrypt the parts of `buf` (WAL starting at `lsn`) that fall into
/// encrypted key ranges.
fn decrypt_ranges(
    tde: &TdeKeyManager,
    tli: TimeLineID,
    lsn: Lsn,
    seg_size: usize,
    buf: &mut [u8],
) -> WalResult<()> {
    let end = lsn + buf.len() as u64;
    let ranges = tde.wal_key_ranges(lsn, end).map_err(key_error)?;
    for range in ranges.iter().filter(|r| r.is_encrypted()) {
        let from = range.start.max(lsn);
        let to = range.end.min(end);
        // one page at a time, so that unwritten pages stay zero
        let mut pos = from;
        while pos < to {
            let chunk_end = (pos.page_lsn() + XLOG_BLCKSZ as u64).min(to);
            let chunk = &mut buf[(pos.0 - lsn.0) as usize..(chunk_end.0 - lsn.0) as usize];
            if !page_unwritten(chunk) {
                crypt_wal(&range.key, tli, pos, seg_size, chunk);
            }
            pos = chunk_end;
        }
    }
    Ok(())
}

fn page_unwritten(chunk: &[u8]) -> bool {
    chunk.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_tde::FileKeyring;
    use pg_tde::GLOBAL_DATA_TDE_OID;

    const SEG: usize = 1024 * 1024;

    #[test]
    fn keystream_is_position_independent() {
        let key = InternalKey::generate();
        let plain: Vec<u8> = (0..3 * XLOG_BLCKSZ).map(|i| (i % 251) as u8).collect();
        let start = Lsn(5 * SEG as u64 + XLOG_BLCKSZ as u64);

        let mut whole = plain.clone();
        crypt_wal(&key, 1, start, SEG, &mut whole);
        assert_ne!(whole, plain);

        // the middle part alone encrypts the same
        let mut part = plain[100..5000].to_vec();
        crypt_wal(&key, 1, start + 100, SEG, &mut part);
        assert_eq!(part, whole[100..5000]);

        // another timeline gives another keystream
        let mut other = plain.clone();
        crypt_wal(&key, 2, start, SEG, &mut other);
        assert_ne!(other, whole);

        crypt_wal(&key, 1, start, SEG, &mut whole);
        assert_eq!(whole, plain);
    }

    #[test]
    fn encrypted_write_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = Arc::new(FileKeyring::new(1, dir.path().join("keyring.json")));
        let tde = Arc::new(TdeKeyManager::open(dir.path().join("pg_tde"), keyring).unwrap());
        tde.set_principal_key(GLOBAL_DATA_TDE_OID, "wal").unwrap();
        tde.start_wal_key(true).unwrap();

        let segs = SegmentDir::new(dir.path().join("pg_wal"), SEG, true);
        segs.create_dirs().unwrap();
        let io = WalIo::new(segs, Some(tde));
        let file = io.segments().create(1, 0, false).unwrap();

        let page = vec![0xAAu8; XLOG_BLCKSZ];
        io.write(&file, Lsn(XLOG_BLCKSZ as u64), &page).unwrap();
        let raw = file.pread(XLOG_BLCKSZ, XLOG_BLCKSZ).unwrap();
        assert_ne!(raw, page, "stored in the clear");

        assert_eq!(io.read(&file, Lsn(XLOG_BLCKSZ as u64), XLOG_BLCKSZ).unwrap(), page);
        // pages after it were never written and read back as zeros
        let next = io.read(&file, Lsn(2 * XLOG_BLCKSZ as u64), XLOG_BLCKSZ).unwrap();
        assert!(next.iter().all(|b| *b == 0));
    }
}
