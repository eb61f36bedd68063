//!
//! Read-only support for the "V0" on-disk layout: the control file, page
//! headers and record headers written by servers that protected them with
//! a 64-bit CRC and kept WAL in `pg_xlog` under 16-digit file names.
//!
//! Only what the reset tool needs to rescue an old cluster is here. Nothing
//! in this module ever produces V0 data, and WAL is only scanned for
//! checkpoint records: records carrying backup blocks are stepped over by
//! their declared size without being checked.
//!
use crate::pg_constants;
use crate::{CheckPoint, ControlFileData, FullTransactionId, DBState, XLOG_BLCKSZ};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use utils::lsn::Lsn;

pub const XLOG_PAGE_MAGIC_V0: u16 = 0xD05B;
pub const SIZE_OF_PAGE_HEADER_V0: usize = 16;
pub const SIZE_OF_CONT_RECORD_V0: usize = 8;
pub const SIZE_OF_RECORD_V0: usize = 32;
pub const SIZE_OF_CHECKPOINT_V0: usize = 40;
pub const SIZE_OF_BKP_BLOCK_V0: usize = 16;
pub const XLR_BKP_BLOCK_MASK_V0: u8 = 0x0E;
pub const LOCALE_NAME_BUFLEN_V0: usize = 128;
pub const SIZE_OF_CONTROL_FILE_V0: usize = 72 + SIZE_OF_CHECKPOINT_V0 + 2 * LOCALE_NAME_BUFLEN_V0;
/// Segments were always 16 MiB, and a log file held 255 of them.
pub const XLOG_SEG_SIZE_V0: usize = 16 * 1024 * 1024;
pub const XLOG_SEGS_PER_FILE_V0: u32 = 255;

const CRC64_POLY: u64 = 0x42F0_E1EB_A9EA_3693;

const fn crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & (1 << 63) != 0 {
                (crc << 1) ^ CRC64_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = crc64_table();

/// Incremental 64-bit CRC as V0 servers computed it: start from
/// `u64::MAX`, feed chunks, and finish with [`crc64_finish`].
pub fn crc64_append(mut crc: u64, data: &[u8]) -> u64 {
    for b in data {
        crc = CRC64_TABLE[(((crc >> 56) as u8) ^ b) as usize] ^ (crc << 8);
    }
    crc
}

pub fn crc64_finish(crc: u64) -> u64 {
    crc ^ u64::MAX
}

pub fn crc64(data: &[u8]) -> u64 {
    crc64_finish(crc64_append(u64::MAX, data))
}

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("V0 control file is too short ({0} bytes)")]
    TooShort(usize),
    #[error("V0 control file has version {0}")]
    WrongVersion(u32),
}

/// A V0 WAL position: log file number and byte offset inside it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecPtrV0 {
    pub xlogid: u32,
    pub xrecoff: u32,
}

impl RecPtrV0 {
    fn get<B: Buf>(buf: &mut B) -> RecPtrV0 {
        RecPtrV0 {
            xlogid: buf.get_u32_le(),
            xrecoff: buf.get_u32_le(),
        }
    }

    /// Position of the first byte of segment `seg` of log file `xlogid`.
    pub fn segment_start(xlogid: u32, seg: u32) -> RecPtrV0 {
        RecPtrV0 {
            xlogid,
            xrecoff: seg * XLOG_SEG_SIZE_V0 as u32,
        }
    }

    pub fn segment(&self) -> u32 {
        self.xrecoff / XLOG_SEG_SIZE_V0 as u32
    }

    pub fn add(self, n: u32) -> RecPtrV0 {
        RecPtrV0 {
            xlogid: self.xlogid,
            xrecoff: self.xrecoff + n,
        }
    }

    /// The same position in the flat address space used today.
    pub fn to_lsn(self) -> Lsn {
        Lsn::from_parts(self.xlogid, self.xrecoff)
    }
}

impl std::fmt::Display for RecPtrV0 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.xlogid, self.xrecoff)
    }
}

#[allow(non_snake_case)]
pub fn XLogFileNameV0(xlogid: u32, seg: u32) -> String {
    format!("{:08X}{:08X}", xlogid, seg)
}

/// Parse a 16-digit V0 segment name into (log file, segment).
#[allow(non_snake_case)]
pub fn XLogFromFileNameV0(fname: &str) -> Option<(u32, u32)> {
    if fname.len() != 16 || !fname.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let xlogid = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let seg = u32::from_str_radix(&fname[8..16], 16).ok()?;
    (seg < XLOG_SEGS_PER_FILE_V0).then_some((xlogid, seg))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckPointV0 {
    pub redo: RecPtrV0,
    pub undo: RecPtrV0,
    pub this_startup_id: u32,
    pub next_xid: u32,
    pub next_oid: u32,
    pub time: i64,
}

impl CheckPointV0 {
    pub fn decode(mut buf: &[u8]) -> Option<CheckPointV0> {
        if buf.len() < SIZE_OF_CHECKPOINT_V0 {
            return None;
        }
        let redo = RecPtrV0::get(&mut buf);
        let undo = RecPtrV0::get(&mut buf);
        let this_startup_id = buf.get_u32_le();
        let next_xid = buf.get_u32_le();
        let next_oid = buf.get_u32_le();
        buf.advance(4);
        let time = buf.get_i64_le();
        Some(CheckPointV0 {
            redo,
            undo,
            this_startup_id,
            next_xid,
            next_oid,
            time,
        })
    }

    /// Carry the fields that still exist over to the current layout; the
    /// rest keep the values of `base`.
    pub fn upgrade(&self, base: &CheckPoint) -> CheckPoint {
        CheckPoint {
            redo: self.redo.to_lsn().0,
            nextXid: FullTransactionId::new(0, self.next_xid),
            nextOid: self.next_oid,
            time: self.time,
            ..*base
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileV0 {
    pub crc: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: u32,
    pub time: i64,
    pub log_id: u32,
    pub log_seg: u32,
    pub check_point: RecPtrV0,
    pub prev_check_point: RecPtrV0,
    pub check_point_copy: CheckPointV0,
    pub blcksz: u32,
    pub relseg_size: u32,
    pub name_data_len: u32,
    pub func_max_args: u32,
    pub lc_collate: String,
    pub lc_ctype: String,
}

fn locale_v0(buf: &mut &[u8]) -> String {
    let raw = &buf[..LOCALE_NAME_BUFLEN_V0];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let s = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(LOCALE_NAME_BUFLEN_V0);
    s
}

impl ControlFileV0 {
    /// Decode a V0 control file. The returned flag tells whether the
    /// 64-bit CRC over everything after the CRC field matched.
    pub fn decode(raw: &[u8]) -> Result<(ControlFileV0, bool), LegacyError> {
        if raw.len() < SIZE_OF_CONTROL_FILE_V0 {
            return Err(LegacyError::TooShort(raw.len()));
        }
        let mut buf = raw;
        let crc = buf.get_u64_le();
        let pg_control_version = buf.get_u32_le();
        if pg_control_version != pg_constants::PG_CONTROL_VERSION_V0 {
            return Err(LegacyError::WrongVersion(pg_control_version));
        }
        let catalog_version_no = buf.get_u32_le();
        let state = buf.get_u32_le();
        buf.advance(4);
        let time = buf.get_i64_le();
        let log_id = buf.get_u32_le();
        let log_seg = buf.get_u32_le();
        let check_point = RecPtrV0::get(&mut buf);
        let prev_check_point = RecPtrV0::get(&mut buf);
        let check_point_copy = CheckPointV0::decode(buf).ok_or(LegacyError::TooShort(raw.len()))?;
        buf.advance(SIZE_OF_CHECKPOINT_V0);
        let blcksz = buf.get_u32_le();
        let relseg_size = buf.get_u32_le();
        let name_data_len = buf.get_u32_le();
        let func_max_args = buf.get_u32_le();
        let lc_collate = locale_v0(&mut buf);
        let lc_ctype = locale_v0(&mut buf);

        let crc_ok = crc64(&raw[8..SIZE_OF_CONTROL_FILE_V0]) == crc;
        Ok((
            ControlFileV0 {
                crc,
                pg_control_version,
                catalog_version_no,
                state,
                time,
                log_id,
                log_seg,
                check_point,
                prev_check_point,
                check_point_copy,
                blcksz,
                relseg_size,
                name_data_len,
                func_max_args,
                lc_collate,
                lc_ctype,
            },
            crc_ok,
        ))
    }

    /// Convert to the current layout, starting from `base` (usually guessed
    /// defaults). Fields that have no V0 counterpart keep their `base` value.
    pub fn upgrade(&self, base: &ControlFileData) -> ControlFileData {
        let mut cf = ControlFileData {
            pg_control_version: pg_constants::PG_CONTROL_VERSION,
            state: match DBState::from_u32(self.state) {
                Some(_) => self.state,
                None => DBState::Shutdowned as u32,
            },
            time: self.time,
            checkPoint: self.check_point.to_lsn().0,
            checkPointCopy: self.check_point_copy.upgrade(&base.checkPointCopy),
            relseg_size: self.relseg_size,
            ..*base
        };
        ControlFileData::set_locale(&mut cf.lc_collate, &self.lc_collate);
        ControlFileData::set_locale(&mut cf.lc_ctype, &self.lc_ctype);
        cf
    }
}

/// A checkpoint record found while scanning V0 WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyCheckpoint {
    pub location: RecPtrV0,
    pub shutdown: bool,
    pub checkpoint: CheckPointV0,
}

/// Walks V0 WAL pages in order and collects the checkpoint records.
///
/// Feed pages with [`CheckpointScanner::feed_page`] in address order; the
/// scan stops for good at the first page or record that does not look
/// valid, which is where the old WAL ends.
#[derive(Default)]
pub struct CheckpointScanner {
    /// Bytes of the current record still to come.
    want: usize,
    /// Record being collected, when it is a checkpoint.
    collect: Option<(RecPtrV0, BytesMut)>,
    next_page: Option<RecPtrV0>,
    ended: bool,
    found: Vec<LegacyCheckpoint>,
}

impl CheckpointScanner {
    pub fn new() -> CheckpointScanner {
        Self::default()
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn checkpoints(&self) -> &[LegacyCheckpoint] {
        &self.found
    }

    pub fn into_checkpoints(self) -> Vec<LegacyCheckpoint> {
        self.found
    }

    pub fn feed_page(&mut self, page_ptr: RecPtrV0, page: &[u8]) {
        if self.ended {
            return;
        }
        if page.len() < XLOG_BLCKSZ || !self.page_header_ok(page_ptr, page) {
            self.ended = true;
            return;
        }
        let info = u16::from_le_bytes([page[2], page[3]]);
        let mut off = SIZE_OF_PAGE_HEADER_V0;

        if info & pg_constants::XLP_FIRST_IS_CONTRECORD != 0 {
            let rem_len = u32::from_le_bytes([page[16], page[17], page[18], page[19]]) as usize;
            off += SIZE_OF_CONT_RECORD_V0;
            if self.want == 0 {
                // the tail of a record that began before the scan did
                self.want = rem_len;
            } else if rem_len != self.want {
                self.ended = true;
                return;
            }
        } else if self.want > 0 {
            // continuation missing: the record was torn
            self.ended = true;
            return;
        }

        loop {
            if self.want > 0 {
                let n = self.want.min(XLOG_BLCKSZ - off);
                if let Some((_, buf)) = self.collect.as_mut() {
                    buf.extend_from_slice(&page[off..off + n]);
                }
                off += n;
                self.want -= n;
                if self.want > 0 {
                    break;
                }
                if let Some((start, buf)) = self.collect.take() {
                    self.finish_checkpoint(start, &buf);
                }
                off = (off + 7) & !7;
                continue;
            }
            if XLOG_BLCKSZ - off < SIZE_OF_RECORD_V0 {
                break;
            }
            let hdr = &page[off..off + SIZE_OF_RECORD_V0];
            if hdr.iter().all(|b| *b == 0) {
                self.ended = true;
                break;
            }
            let xl_len = u16::from_le_bytes([hdr[28], hdr[29]]) as usize;
            let xl_info = hdr[30];
            let xl_rmid = hdr[31];
            let nbkp = (xl_info & XLR_BKP_BLOCK_MASK_V0).count_ones() as usize;
            let total = SIZE_OF_RECORD_V0 + xl_len + nbkp * (SIZE_OF_BKP_BLOCK_V0 + XLOG_BLCKSZ);

            let info = xl_info & pg_constants::XLR_RMGR_INFO_MASK;
            let is_checkpoint = xl_rmid == pg_constants::RM_XLOG_ID
                && nbkp == 0
                && (info == pg_constants::XLOG_CHECKPOINT_SHUTDOWN
                    || info == pg_constants::XLOG_CHECKPOINT_ONLINE);
            if is_checkpoint {
                self.collect = Some((page_ptr.add(off as u32), BytesMut::with_capacity(total)));
            }
            self.want = total;
        }
        self.next_page = Some(page_ptr.add(XLOG_BLCKSZ as u32));
    }

    fn page_header_ok(&self, page_ptr: RecPtrV0, page: &[u8]) -> bool {
        let magic = u16::from_le_bytes([page[0], page[1]]);
        let info = u16::from_le_bytes([page[2], page[3]]);
        let addr = RecPtrV0 {
            xlogid: u32::from_le_bytes([page[8], page[9], page[10], page[11]]),
            xrecoff: u32::from_le_bytes([page[12], page[13], page[14], page[15]]),
        };
        // a gap in the page sequence means a segment is missing
        let contiguous = match self.next_page {
            Some(expected) => expected == page_ptr,
            None => true,
        };
        magic == XLOG_PAGE_MAGIC_V0
            && info & !pg_constants::XLP_ALL_FLAGS == 0
            && addr == page_ptr
            && (contiguous || self.want == 0)
    }

    fn finish_checkpoint(&mut self, start: RecPtrV0, rec: &[u8]) {
        let stored = u64::from_le_bytes([
            rec[0], rec[1], rec[2], rec[3], rec[4], rec[5], rec[6], rec[7],
        ]);
        let crc = crc64_append(u64::MAX, &rec[SIZE_OF_RECORD_V0..]);
        let crc = crc64_finish(crc64_append(crc, &rec[8..SIZE_OF_RECORD_V0]));
        if crc != stored {
            self.ended = true;
            return;
        }
        if let Some(checkpoint) = CheckPointV0::decode(&rec[SIZE_OF_RECORD_V0..]) {
            let info = rec[30] & pg_constants::XLR_RMGR_INFO_MASK;
            self.found.push(LegacyCheckpoint {
                location: start,
                shutdown: info == pg_constants::XLOG_CHECKPOINT_SHUTDOWN,
                checkpoint,
            });
        }
    }
}

/// Helpers that lay out V0 data, for tests elsewhere in the workspace.
pub mod test_utils {
    use super::*;
    use bytes::BufMut;

    pub fn encode_checkpoint(cp: &CheckPointV0) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SIZE_OF_CHECKPOINT_V0);
        for p in [cp.redo, cp.undo] {
            buf.put_u32_le(p.xlogid);
            buf.put_u32_le(p.xrecoff);
        }
        buf.put_u32_le(cp.this_startup_id);
        buf.put_u32_le(cp.next_xid);
        buf.put_u32_le(cp.next_oid);
        buf.put_u32_le(0);
        buf.put_i64_le(cp.time);
        buf.to_vec()
    }

    pub fn encode_control_file(cf: &ControlFileV0) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(pg_constants::PG_CONTROL_FILE_SIZE);
        buf.put_u64_le(0);
        buf.put_u32_le(cf.pg_control_version);
        buf.put_u32_le(cf.catalog_version_no);
        buf.put_u32_le(cf.state);
        buf.put_u32_le(0);
        buf.put_i64_le(cf.time);
        buf.put_u32_le(cf.log_id);
        buf.put_u32_le(cf.log_seg);
        for p in [cf.check_point, cf.prev_check_point] {
            buf.put_u32_le(p.xlogid);
            buf.put_u32_le(p.xrecoff);
        }
        buf.put_slice(&encode_checkpoint(&cf.check_point_copy));
        buf.put_u32_le(cf.blcksz);
        buf.put_u32_le(cf.relseg_size);
        buf.put_u32_le(cf.name_data_len);
        buf.put_u32_le(cf.func_max_args);
        for name in [&cf.lc_collate, &cf.lc_ctype] {
            let mut field = [0u8; LOCALE_NAME_BUFLEN_V0];
            let n = name.len().min(LOCALE_NAME_BUFLEN_V0 - 1);
            field[..n].copy_from_slice(&name.as_bytes()[..n]);
            buf.put_slice(&field);
        }
        let crc = crc64(&buf[8..SIZE_OF_CONTROL_FILE_V0]);
        buf[0..8].copy_from_slice(&crc.to_le_bytes());
        buf.resize(pg_constants::PG_CONTROL_FILE_SIZE, 0);
        buf.to_vec()
    }

    /// A V0 segment holding one checkpoint record right after the first
    /// page header.
    pub fn segment_with_checkpoint(
        xlogid: u32,
        seg: u32,
        info: u8,
        cp: &CheckPointV0,
    ) -> Vec<u8> {
        let start = RecPtrV0::segment_start(xlogid, seg);
        let mut buf = vec![0u8; XLOG_SEG_SIZE_V0];
        // only the first page is written, the rest of the segment is zeros
        buf[0..2].copy_from_slice(&XLOG_PAGE_MAGIC_V0.to_le_bytes());
        buf[8..12].copy_from_slice(&start.xlogid.to_le_bytes());
        buf[12..16].copy_from_slice(&start.xrecoff.to_le_bytes());
        let data = encode_checkpoint(cp);
        let mut hdr = BytesMut::with_capacity(SIZE_OF_RECORD_V0);
        hdr.put_u64_le(0); // crc
        hdr.put_u64_le(0); // xl_prev
        hdr.put_u64_le(0); // xl_xact_prev
        hdr.put_u32_le(0); // xl_xid
        hdr.put_u16_le(data.len() as u16);
        hdr.put_u8(info);
        hdr.put_u8(pg_constants::RM_XLOG_ID);
        let crc = crc64_finish(crc64_append(crc64_append(u64::MAX, &data), &hdr[8..]));
        hdr[0..8].copy_from_slice(&crc.to_le_bytes());

        let off = SIZE_OF_PAGE_HEADER_V0;
        buf[off..off + SIZE_OF_RECORD_V0].copy_from_slice(&hdr);
        buf[off + SIZE_OF_RECORD_V0..off + SIZE_OF_RECORD_V0 + data.len()].copy_from_slice(&data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn crc64_check_value() {
        // CRC-64/WE check value
        assert_eq!(crc64(b"123456789"), 0x62EC_59E3_F1A4_F00A);
    }

    #[test]
    fn file_names() {
        assert_eq!(XLogFileNameV0(0, 0x1F), "000000000000001F");
        assert_eq!(XLogFromFileNameV0("000000010000001F"), Some((1, 0x1F)));
        assert_eq!(XLogFromFileNameV0("00000001000000FF"), None);
        assert_eq!(XLogFromFileNameV0("000000010000000000000001"), None);
    }

    fn sample_checkpoint() -> CheckPointV0 {
        CheckPointV0 {
            redo: RecPtrV0 {
                xlogid: 0,
                xrecoff: 0x0200_0010,
            },
            undo: RecPtrV0::default(),
            this_startup_id: 3,
            next_xid: 5000,
            next_oid: 24576,
            time: 1_000_000,
        }
    }

    #[test]
    fn control_file_decode_and_upgrade() {
        let cf = ControlFileV0 {
            crc: 0,
            pg_control_version: pg_constants::PG_CONTROL_VERSION_V0,
            catalog_version_no: 200211021,
            state: DBState::Shutdowned as u32,
            time: 1_000_000,
            log_id: 0,
            log_seg: 2,
            check_point: RecPtrV0 {
                xlogid: 0,
                xrecoff: 0x0200_0010,
            },
            prev_check_point: RecPtrV0::default(),
            check_point_copy: sample_checkpoint(),
            blcksz: 8192,
            relseg_size: 131072,
            name_data_len: 64,
            func_max_args: 32,
            lc_collate: "C".into(),
            lc_ctype: "C".into(),
        };
        let raw = encode_control_file(&cf);
        let (back, crc_ok) = ControlFileV0::decode(&raw).unwrap();
        assert!(crc_ok);
        assert_eq!(back.check_point_copy, cf.check_point_copy);
        assert_eq!(back.lc_collate, "C");

        let upgraded = back.upgrade(&ControlFileData::default());
        assert_eq!(upgraded.pg_control_version, pg_constants::PG_CONTROL_VERSION);
        assert_eq!(upgraded.checkPoint, 0x0200_0010);
        assert_eq!(upgraded.checkPointCopy.nextOid, 24576);
        assert_eq!(upgraded.checkPointCopy.nextXid.xid(), 5000);

        let mut broken = raw.clone();
        broken[40] ^= 0xFF;
        assert!(!ControlFileV0::decode(&broken).unwrap().1);
    }

    #[test]
    fn scanner_finds_checkpoint() {
        let seg = segment_with_checkpoint(0, 2, pg_constants::XLOG_CHECKPOINT_SHUTDOWN, &sample_checkpoint());
        let start = RecPtrV0::segment_start(0, 2);
        let mut scanner = CheckpointScanner::new();
        for (i, page) in seg.chunks(XLOG_BLCKSZ).enumerate() {
            scanner.feed_page(start.add((i * XLOG_BLCKSZ) as u32), page);
            if scanner.ended() {
                break;
            }
        }
        let found = scanner.into_checkpoints();
        assert_eq!(found.len(), 1);
        assert!(found[0].shutdown);
        assert_eq!(found[0].location, start.add(SIZE_OF_PAGE_HEADER_V0 as u32));
        assert_eq!(found[0].checkpoint, sample_checkpoint());
    }

    #[test]
    fn scanner_rejects_bad_crc() {
        let mut seg = segment_with_checkpoint(0, 2, pg_constants::XLOG_CHECKPOINT_ONLINE, &sample_checkpoint());
        seg[SIZE_OF_PAGE_HEADER_V0 + SIZE_OF_RECORD_V0 + 20] ^= 1;
        let mut scanner = CheckpointScanner::new();
        scanner.feed_page(RecPtrV0::segment_start(0, 2), &seg[..XLOG_BLCKSZ]);
        assert!(scanner.checkpoints().is_empty());
        assert!(scanner.ended());
    }
}
