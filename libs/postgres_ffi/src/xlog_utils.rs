//
// This file contains common utilities for dealing with PostgreSQL WAL files and
// LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

use crate::pg_constants;
use crate::{
    CheckPoint, TimeLineID, TimestampTz, XLogLongPageHeaderData, XLogPageHeaderData, XLogRecPtr,
    XLogRecord, XLogSegNo, XLOG_BLCKSZ,
};

use bytes::{Buf, Bytes, BytesMut};
use crc32c::crc32c_append;
use std::time::SystemTime;
use utils::bin_ser::{DeserializeError, LeSer, SerializeError};
use utils::lsn::Lsn;

pub const XLOG_FNAME_LEN: usize = 24;
pub const XLP_REM_LEN_OFFS: usize = 2 + 2 + 4 + 8;
pub const XLOG_RECORD_CRC_OFFS: usize = 4 + 4 + 8 + 1 + 1 + 2;
pub const MAX_SEND_SIZE: usize = XLOG_BLCKSZ * 16;

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = std::mem::size_of::<XLogPageHeaderData>();
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = std::mem::size_of::<XLogLongPageHeaderData>();
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = std::mem::size_of::<XLogRecord>();
#[allow(clippy::identity_op)]
pub const SIZE_OF_XLOG_RECORD_DATA_HEADER_SHORT: usize = 1 * 2;
pub const SIZE_OF_XLOG_RECORD_DATA_HEADER_LONG: usize = 1 + 4;

pub const SIZEOF_CHECKPOINT: usize = std::mem::size_of::<CheckPoint>();

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(
    segno: XLogSegNo,
    offset: u32,
    wal_segsz_bytes: usize,
) -> XLogRecPtr {
    segno * (wal_segsz_bytes as u64) + (offset as u64)
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, logSegNo: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        logSegNo / XLogSegmentsPerXLogId(wal_segsz_bytes),
        logSegNo % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

/// Parse a 24-digit segment file name (a `.partial` suffix is ignored).
/// Returns `None` for anything that is not a segment name.
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> Option<(XLogSegNo, TimeLineID)> {
    let fname = fname.strip_suffix(".partial").unwrap_or(fname);
    if !IsXLogFileName(fname) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u32::from_str_radix(&fname[8..16], 16).ok()? as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16).ok()? as XLogSegNo;
    if seg >= XLogSegmentsPerXLogId(wal_seg_size) {
        return None;
    }
    Some((log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli))
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname
        .strip_suffix(".partial")
        .map(IsXLogFileName)
        .unwrap_or(false)
}

#[allow(non_snake_case)]
pub fn TLHistoryFileName(tli: TimeLineID) -> String {
    format!("{:08X}.history", tli)
}

#[allow(non_snake_case)]
pub fn IsTLHistoryFileName(fname: &str) -> bool {
    fname.len() == 8 + ".history".len()
        && fname.ends_with(".history")
        && fname[0..8].chars().all(|c| c.is_ascii_hexdigit())
}

/// Segment sizes must be a power of two between 1 MiB and 1 GiB.
#[allow(non_snake_case)]
pub fn IsValidWalSegSize(size: usize) -> bool {
    size.is_power_of_two()
        && (pg_constants::MIN_WAL_SEG_SIZE..=pg_constants::MAX_WAL_SEG_SIZE).contains(&size)
}

/// Size of the page header at the page starting at `page_lsn`.
pub fn page_header_size(page_lsn: Lsn, seg_sz: usize) -> usize {
    if page_lsn.segment_offset(seg_sz) == 0 {
        XLOG_SIZE_OF_XLOG_LONG_PHD
    } else {
        XLOG_SIZE_OF_XLOG_SHORT_PHD
    }
}

/// If LSN points to the beginning of the page, then shift it to first record,
/// otherwise align on 8-bytes boundary (required for WAL records)
pub fn normalize_lsn(lsn: Lsn, seg_sz: usize) -> Lsn {
    if lsn.block_offset() == 0 {
        lsn + page_header_size(lsn, seg_sz) as u64
    } else {
        lsn.align()
    }
}

/// Where a record that is offered position `pos` actually begins.
///
/// A record header is never split across pages: when fewer than
/// `XLOG_SIZE_OF_XLOG_RECORD` bytes are left on the page, the record moves
/// to the first usable byte of the next page.
pub fn record_start_position(pos: Lsn, seg_sz: usize) -> Lsn {
    let pos = normalize_lsn(pos, seg_sz);
    if (pos.remaining_in_block() as usize) < XLOG_SIZE_OF_XLOG_RECORD {
        let next_page = pos + pos.remaining_in_block();
        next_page + page_header_size(next_page, seg_sz) as u64
    } else {
        pos
    }
}

/// Position right after `len` bytes of record data laid out from `start`,
/// stepping over the page headers of every page boundary crossed.
pub fn advance_over_page_headers(start: Lsn, mut len: usize, seg_sz: usize) -> Lsn {
    let mut pos = start;
    while len > 0 {
        if pos.block_offset() == 0 {
            pos += page_header_size(pos, seg_sz) as u64;
        }
        let n = std::cmp::min(len, pos.remaining_in_block() as usize);
        pos += n as u64;
        len -= n;
    }
    pos
}

pub fn get_current_timestamp() -> TimestampTz {
    to_pg_timestamp(SystemTime::now())
}

const UNIX_EPOCH_JDATE: u64 = 2440588; /* == date2j(1970, 1, 1) */
const POSTGRES_EPOCH_JDATE: u64 = 2451545; /* == date2j(2000, 1, 1) */
const SECS_PER_DAY: u64 = 86400;
const USECS_PER_SEC: u64 = 1000000;
const PG_EPOCH_OFFSET_SECS: u64 = (POSTGRES_EPOCH_JDATE - UNIX_EPOCH_JDATE) * SECS_PER_DAY;

/// Microseconds since 2000-01-01, the wire representation of timestamptz.
pub fn to_pg_timestamp(time: SystemTime) -> TimestampTz {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => {
            (n.as_secs() as i64 - PG_EPOCH_OFFSET_SECS as i64) * USECS_PER_SEC as i64
                + n.subsec_micros() as i64
        }
        Err(_) => 0,
    }
}

pub fn from_pg_timestamp(time: TimestampTz) -> SystemTime {
    let micros = time + (PG_EPOCH_OFFSET_SECS * USECS_PER_SEC) as i64;
    if micros >= 0 {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_micros(micros as u64)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

/// Seconds since the Unix epoch, as stored in `pg_time_t` fields.
pub fn current_pg_time() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Ways a WAL page header can fail validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageHeaderError {
    #[error("invalid magic number {magic:04X} in WAL page at {lsn}")]
    BadMagic { magic: u16, lsn: Lsn },
    #[error("invalid info bits {info:04X} in WAL page at {lsn}")]
    BadFlags { info: u16, lsn: Lsn },
    #[error("unexpected timeline ID {found} (expected {expected}) in WAL page at {lsn}")]
    WrongTimeline {
        found: TimeLineID,
        expected: TimeLineID,
        lsn: Lsn,
    },
    #[error("unexpected pageaddr {found} in WAL page at {lsn}")]
    WrongAddress { found: Lsn, lsn: Lsn },
    #[error("WAL file is from different database system: identifier is {found}, expected {expected}")]
    WrongSystemId { found: u64, expected: u64 },
    #[error("WAL file has segment size {seg_size} and block size {blcksz}, expected {expected_seg_size} and {expected_blcksz}")]
    WrongGeometry {
        seg_size: u32,
        blcksz: u32,
        expected_seg_size: u32,
        expected_blcksz: u32,
    },
    #[error("could not decode WAL page header at {lsn}")]
    Undecodable { lsn: Lsn },
}

/// Check the short header of the page at `page_lsn`.
///
/// `expected_tli` of `None` skips the timeline check; callers that follow a
/// timeline history check the returned header's TLI themselves.
pub fn validate_page_header(
    page: &[u8],
    page_lsn: Lsn,
    expected_tli: Option<TimeLineID>,
    seg_sz: usize,
) -> Result<XLogPageHeaderData, PageHeaderError> {
    let hdr = XLogPageHeaderData::des_prefix(page)
        .map_err(|_| PageHeaderError::Undecodable { lsn: page_lsn })?;

    if hdr.xlp_magic != pg_constants::XLOG_PAGE_MAGIC {
        return Err(PageHeaderError::BadMagic {
            magic: hdr.xlp_magic,
            lsn: page_lsn,
        });
    }
    let at_seg_start = page_lsn.segment_offset(seg_sz) == 0;
    let has_long = hdr.xlp_info & pg_constants::XLP_LONG_HEADER != 0;
    if hdr.xlp_info & !pg_constants::XLP_ALL_FLAGS != 0 || has_long != at_seg_start {
        return Err(PageHeaderError::BadFlags {
            info: hdr.xlp_info,
            lsn: page_lsn,
        });
    }
    if hdr.xlp_pageaddr != page_lsn.0 {
        return Err(PageHeaderError::WrongAddress {
            found: Lsn(hdr.xlp_pageaddr),
            lsn: page_lsn,
        });
    }
    if let Some(expected) = expected_tli {
        if hdr.xlp_tli != expected {
            return Err(PageHeaderError::WrongTimeline {
                found: hdr.xlp_tli,
                expected,
                lsn: page_lsn,
            });
        }
    }
    Ok(hdr)
}

/// Check the identity fields of a segment's long header.
pub fn validate_long_header(
    page: &[u8],
    system_id: Option<u64>,
    seg_sz: usize,
) -> Result<XLogLongPageHeaderData, PageHeaderError> {
    let hdr = XLogLongPageHeaderData::des_prefix(page).map_err(|_| {
        PageHeaderError::Undecodable {
            lsn: Lsn(0),
        }
    })?;
    if let Some(expected) = system_id {
        if hdr.xlp_sysid != expected {
            return Err(PageHeaderError::WrongSystemId {
                found: hdr.xlp_sysid,
                expected,
            });
        }
    }
    if hdr.xlp_seg_size as usize != seg_sz || hdr.xlp_xlog_blcksz as usize != XLOG_BLCKSZ {
        return Err(PageHeaderError::WrongGeometry {
            seg_size: hdr.xlp_seg_size,
            blcksz: hdr.xlp_xlog_blcksz,
            expected_seg_size: seg_sz as u32,
            expected_blcksz: XLOG_BLCKSZ as u32,
        });
    }
    Ok(hdr)
}

impl XLogRecord {
    pub fn from_slice(buf: &[u8]) -> Result<XLogRecord, DeserializeError> {
        XLogRecord::des_prefix(buf)
    }

    pub fn from_bytes<B: Buf>(buf: &mut B) -> Result<XLogRecord, DeserializeError> {
        XLogRecord::des_from(&mut buf.reader())
    }

    pub fn encode(&self) -> Result<Bytes, SerializeError> {
        Ok(self.ser()?.into())
    }

    // Is this record an XLOG_SWITCH record? They need some special processing,
    pub fn is_xlog_switch_record(&self) -> bool {
        self.xl_info & pg_constants::XLR_RMGR_INFO_MASK == pg_constants::XLOG_SWITCH
            && self.xl_rmid == pg_constants::RM_XLOG_ID
    }

    /// Compute the record CRC: the payload after the header first, then the
    /// header up to the CRC field.
    pub fn compute_crc(&self, payload: &[u8]) -> Result<u32, SerializeError> {
        let hdr = self.encode()?;
        let crc = crc32c_append(0, payload);
        Ok(crc32c_append(crc, &hdr[0..XLOG_RECORD_CRC_OFFS]))
    }
}

/// Verify the CRC of a complete record (header included).
pub fn record_crc_matches(record: &[u8]) -> bool {
    if record.len() < XLOG_SIZE_OF_XLOG_RECORD {
        return false;
    }
    let stored = u32::from_le_bytes([
        record[XLOG_RECORD_CRC_OFFS],
        record[XLOG_RECORD_CRC_OFFS + 1],
        record[XLOG_RECORD_CRC_OFFS + 2],
        record[XLOG_RECORD_CRC_OFFS + 3],
    ]);
    let crc = crc32c_append(0, &record[XLOG_SIZE_OF_XLOG_RECORD..]);
    let crc = crc32c_append(crc, &record[0..XLOG_RECORD_CRC_OFFS]);
    crc == stored
}

impl XLogPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> Result<XLogPageHeaderData, DeserializeError> {
        XLogPageHeaderData::des_from(&mut buf.reader())
    }

    pub fn encode(&self) -> Result<Bytes, SerializeError> {
        self.ser().map(|b| b.into())
    }
}

impl XLogLongPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> Result<XLogLongPageHeaderData, DeserializeError> {
        XLogLongPageHeaderData::des_from(&mut buf.reader())
    }

    pub fn encode(&self) -> Result<Bytes, SerializeError> {
        self.ser().map(|b| b.into())
    }
}

impl CheckPoint {
    pub fn encode(&self) -> Result<Bytes, SerializeError> {
        Ok(self.ser()?.into())
    }

    pub fn decode(buf: &[u8]) -> Result<CheckPoint, DeserializeError> {
        CheckPoint::des_prefix(buf)
    }
}

/// Encode a record that carries only main data (no block references), as
/// written for checkpoints and other XLOG-rmgr records.
pub fn encode_main_data_record(
    rmid: u8,
    info: u8,
    xid: u32,
    prev: Lsn,
    data: &[u8],
) -> Result<Bytes, SerializeError> {
    let mut body = BytesMut::with_capacity(SIZE_OF_XLOG_RECORD_DATA_HEADER_LONG + data.len());
    if !data.is_empty() {
        if data.len() <= u8::MAX as usize {
            body.extend_from_slice(&[pg_constants::XLR_BLOCK_ID_DATA_SHORT, data.len() as u8]);
        } else {
            body.extend_from_slice(&[pg_constants::XLR_BLOCK_ID_DATA_LONG]);
            body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        body.extend_from_slice(data);
    }

    let mut header = XLogRecord {
        xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32,
        xl_xid: xid,
        xl_prev: prev.0,
        xl_info: info,
        xl_rmid: rmid,
        ..Default::default()
    };
    header.xl_crc = header.compute_crc(&body)?;

    let mut rec = BytesMut::with_capacity(header.xl_tot_len as usize);
    rec.extend_from_slice(&header.encode()?);
    rec.extend_from_slice(&body);
    Ok(rec.freeze())
}

//
// Generate new, empty WAL segment, optionally with one record placed right
// after the long page header. The record must fit on the first page.
//
pub fn generate_wal_segment(
    segno: XLogSegNo,
    system_id: u64,
    tli: TimeLineID,
    wal_seg_size: usize,
    first_record: Option<&[u8]>,
) -> Result<Bytes, SerializeError> {
    let mut seg_buf = BytesMut::with_capacity(wal_seg_size);

    let pageaddr = XLogSegNoOffsetToRecPtr(segno, 0, wal_seg_size);
    let hdr = XLogLongPageHeaderData {
        std: XLogPageHeaderData {
            xlp_magic: pg_constants::XLOG_PAGE_MAGIC,
            xlp_info: pg_constants::XLP_LONG_HEADER,
            xlp_tli: tli,
            xlp_pageaddr: pageaddr,
            xlp_rem_len: 0,
            ..Default::default() // Put 0 in padding fields.
        },
        xlp_sysid: system_id,
        xlp_seg_size: wal_seg_size as u32,
        xlp_xlog_blcksz: XLOG_BLCKSZ as u32,
    };

    seg_buf.extend_from_slice(&hdr.encode()?);
    if let Some(record) = first_record {
        if XLOG_SIZE_OF_XLOG_LONG_PHD + record.len() > XLOG_BLCKSZ {
            return Err(SerializeError::BadInput);
        }
        seg_buf.extend_from_slice(record);
    }

    //zero out the rest of the file
    seg_buf.resize(wal_seg_size, 0);
    Ok(seg_buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: usize = 16 * 1024 * 1024;

    #[test]
    fn segment_file_names() {
        assert_eq!(XLogFileName(1, 1, SEG), "000000010000000000000001");
        assert_eq!(XLogFileName(3, 0x1FF, SEG), "0000000300000001000000FF");
        assert_eq!(
            XLogFromFileName("000000030000000100000FF", SEG),
            None,
            "23 characters is not a segment name"
        );
        assert_eq!(
            XLogFromFileName("0000000300000001000000FF", SEG),
            Some((0x1FF, 3))
        );
        assert_eq!(
            XLogFromFileName("0000000300000001000000FF.partial", SEG),
            Some((0x1FF, 3))
        );
        // segment part out of range for 16MB segments
        assert_eq!(XLogFromFileName("000000010000000000000100", SEG), None);
        assert!(IsPartialXLogFileName("000000010000000000000001.partial"));
        assert!(!IsPartialXLogFileName("000000010000000000000001"));
        assert_eq!(TLHistoryFileName(2), "00000002.history");
        assert!(IsTLHistoryFileName("0000000A.history"));
        assert!(!IsTLHistoryFileName("0000000A.historx"));
    }

    #[test]
    fn seg_size_validation() {
        assert!(IsValidWalSegSize(1024 * 1024));
        assert!(IsValidWalSegSize(SEG));
        assert!(IsValidWalSegSize(1024 * 1024 * 1024));
        assert!(!IsValidWalSegSize(512 * 1024));
        assert!(!IsValidWalSegSize(3 * 1024 * 1024));
        assert!(!IsValidWalSegSize(2048 * 1024 * 1024));
    }

    #[test]
    fn record_positions() {
        // start of segment: skip the long header
        assert_eq!(record_start_position(Lsn(0x1000000), SEG), Lsn(0x1000028));
        // start of page: skip the short header
        assert_eq!(record_start_position(Lsn(0x1002000), SEG), Lsn(0x1002018));
        // header would not fit into the 16 bytes left on the page
        assert_eq!(record_start_position(Lsn(0x1001FF0), SEG), Lsn(0x1002018));
        // exactly a header's worth of room is fine
        assert_eq!(record_start_position(Lsn(0x1001FE8), SEG), Lsn(0x1001FE8));

        // 9029 bytes starting at offset 0xA0 of a segment: one page header crossed
        let end = advance_over_page_headers(Lsn(0x10000A0), 9029, SEG);
        assert_eq!(end, Lsn(0x10000A0 + 9029 + 24));
        // a record ending exactly on a page boundary stops there
        let end = advance_over_page_headers(Lsn(0x1001FE8), 24, SEG);
        assert_eq!(end, Lsn(0x1002000));
    }

    #[test]
    fn timestamps() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(946684800);
        assert_eq!(to_pg_timestamp(t), 0);
        assert_eq!(from_pg_timestamp(1_000_000), t + std::time::Duration::from_secs(1));
    }

    #[test]
    fn page_header_validation() {
        let seg = generate_wal_segment(1, 42, 1, SEG, None).unwrap();
        let page = &seg[0..XLOG_BLCKSZ];
        validate_page_header(page, Lsn(0x1000000), Some(1), SEG).unwrap();
        validate_long_header(page, Some(42), SEG).unwrap();

        assert!(matches!(
            validate_page_header(page, Lsn(0x1000000), Some(2), SEG),
            Err(PageHeaderError::WrongTimeline { found: 1, expected: 2, .. })
        ));
        assert!(matches!(
            validate_page_header(page, Lsn(0x2000000), Some(1), SEG),
            Err(PageHeaderError::WrongAddress { .. })
        ));
        assert!(matches!(
            validate_long_header(page, Some(43), SEG),
            Err(PageHeaderError::WrongSystemId { found: 42, expected: 43 })
        ));
        assert!(matches!(
            validate_long_header(page, Some(42), SEG * 2),
            Err(PageHeaderError::WrongGeometry { .. })
        ));

        let mut bad = page.to_vec();
        bad[0] ^= 0xFF;
        assert!(matches!(
            validate_page_header(&bad, Lsn(0x1000000), Some(1), SEG),
            Err(PageHeaderError::BadMagic { .. })
        ));
        let mut bad = page.to_vec();
        bad[2] = 0x10;
        assert!(matches!(
            validate_page_header(&bad, Lsn(0x1000000), Some(1), SEG),
            Err(PageHeaderError::BadFlags { .. })
        ));
    }

    #[test]
    fn main_data_record_crc() {
        let rec = encode_main_data_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_NOOP,
            0,
            Lsn(0x1000028),
            &[7u8; 300],
        )
        .unwrap();
        assert_eq!(rec.len(), XLOG_SIZE_OF_XLOG_RECORD + 5 + 300);
        assert_eq!(rec[XLOG_SIZE_OF_XLOG_RECORD], pg_constants::XLR_BLOCK_ID_DATA_LONG);
        assert!(record_crc_matches(&rec));

        let mut corrupted = rec.to_vec();
        corrupted[100] ^= 1;
        assert!(!record_crc_matches(&corrupted));
    }
}
