//!
//! Reading records back from segment files.
//!
//! An [`XLogReader`] knows where the segments are and which timeline each
//! part of the WAL lives on; a [`WalCursor`] is a position in the stream.
//! The cursor reads one page at a time, feeds it to the stream decoder, and
//! moves to the next segment file when it crosses a boundary.
//!
//! A record that fails validation is reported as corruption at its start,
//! and the cursor stays there: reading again gives the same error.
//!
use postgres_ffi::page::PageBuf;
use postgres_ffi::pg_constants;
use postgres_ffi::waldecoder::{WalDecodeError, WalStreamDecoder};
use postgres_ffi::walrecord::{decode_wal_record, DecodedWALRecord};
use postgres_ffi::xlog_utils::{record_crc_matches, XLOG_SIZE_OF_XLOG_RECORD};
use postgres_ffi::{TimeLineID, XLogRecord, XLogSegNo, XLOG_BLCKSZ};
use tracing::*;
use utils::lsn::Lsn;

use crate::crypt::WalIo;
use crate::error::{WalError, WalResult};
use crate::rmgr::Rmgr;
use crate::segment::SegmentFile;
use crate::timeline::TimelineHistoryEntry;

/// A record read back from the WAL.
#[derive(Debug)]
pub struct Record {
    pub lsn: Lsn,
    /// Where the next record may start.
    pub end_lsn: Lsn,
    pub header: XLogRecord,
    pub decoded: DecodedWALRecord,
}

impl Record {
    pub fn rmgr(&self) -> Option<Rmgr> {
        Rmgr::from_id(self.header.xl_rmid)
    }

    pub fn info(&self) -> u8 {
        self.header.xl_info
    }
}

/// Position of a reader in the WAL.
pub struct WalCursor {
    next_lsn: Lsn,
    prev_record: Option<Lsn>,
    decoder: WalStreamDecoder,
    /// Next byte to feed the decoder.
    read_pos: Lsn,
    file: Option<SegmentFile>,
    page: Option<PageBuf>,
}

impl WalCursor {
    /// Start of the next record to be returned.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Start of the last record returned.
    pub fn prev_record(&self) -> Option<Lsn> {
        self.prev_record
    }

    /// The page most recently read.
    pub fn current_page(&self) -> Option<&PageBuf> {
        self.page.as_ref()
    }
}

/// Where valid WAL ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalEnd {
    /// Position after the last valid record.
    pub end_lsn: Lsn,
    /// Start of the last valid record, if any was read.
    pub last_record: Option<Lsn>,
    pub records: usize,
}

pub struct XLogReader<'a> {
    io: &'a WalIo,
    history: Vec<TimelineHistoryEntry>,
    system_id: Option<u64>,
}

impl<'a> XLogReader<'a> {
    /// Read the WAL of the timelines in `history`, newest last. An empty
    /// history stands for timeline 1 with no ancestors.
    pub fn new(io: &'a WalIo, mut history: Vec<TimelineHistoryEntry>) -> XLogReader<'a> {
        if history.is_empty() {
            history.push(TimelineHistoryEntry {
                tli: 1,
                begin: Lsn::INVALID,
                end: Lsn::INVALID,
            });
        }
        XLogReader {
            io,
            history,
            system_id: None,
        }
    }

    /// Reject segments of another cluster.
    pub fn with_system_id(mut self, system_id: u64) -> Self {
        self.system_id = Some(system_id);
        self
    }

    pub fn open_at(&self, lsn: Lsn) -> WalCursor {
        self.open_after(lsn, None)
    }

    /// Open at `lsn`, checking that the first record links back to `prev`.
    pub fn open_after(&self, lsn: Lsn, prev: Option<Lsn>) -> WalCursor {
        let mut cursor = WalCursor {
            next_lsn: lsn,
            prev_record: prev,
            decoder: WalStreamDecoder::new(lsn, self.io.seg_size()),
            read_pos: lsn,
            file: None,
            page: None,
        };
        self.reset(&mut cursor);
        cursor
    }

    fn reset(&self, cursor: &mut WalCursor) {
        let mut decoder = WalStreamDecoder::new(cursor.next_lsn, self.io.seg_size());
        decoder.set_system_id(self.system_id);
        decoder.set_prev_record(cursor.prev_record);
        cursor.decoder = decoder;
        cursor.read_pos = cursor.next_lsn;
        cursor.page = None;
    }

    /// Next record, or `None` at the end of the WAL.
    pub fn read_record(&self, cursor: &mut WalCursor) -> WalResult<Option<Record>> {
        loop {
            match cursor.decoder.poll_decode() {
                Ok(Some(raw)) => {
                    let mut decoded = DecodedWALRecord::default();
                    if let Err(e) = decode_wal_record(raw.buf.clone(), &mut decoded) {
                        self.reset(cursor);
                        return Err(WalError::corruption(raw.start_lsn, e.to_string()));
                    }
                    let header = match XLogRecord::from_slice(&raw.buf) {
                        Ok(h) => h,
                        Err(e) => {
                            self.reset(cursor);
                            return Err(WalError::corruption(raw.start_lsn, e.to_string()));
                        }
                    };
                    cursor.next_lsn = raw.end_lsn;
                    cursor.prev_record = Some(raw.start_lsn);
                    return Ok(Some(Record {
                        lsn: raw.start_lsn,
                        end_lsn: raw.end_lsn,
                        header,
                        decoded,
                    }));
                }
                Ok(None) => {
                    if !self.feed_next_page(cursor)? {
                        return Ok(None);
                    }
                }
                Err(e) => return self.decode_failed(cursor, e),
            }
        }
    }

    fn decode_failed(&self, cursor: &mut WalCursor, e: WalDecodeError) -> WalResult<Option<Record>> {
        self.reset(cursor);
        if e.is_end_of_wal() {
            debug!("end of WAL at {}", e.lsn);
            return Ok(None);
        }
        Err(WalError::corruption(e.lsn, e.msg))
    }

    /// Feed the decoder the rest of the page at the read position. Returns
    /// false when the segment holding it does not exist.
    fn feed_next_page(&self, cursor: &mut WalCursor) -> WalResult<bool> {
        let seg_size = self.io.seg_size();
        let pos = cursor.read_pos;
        let page_lsn = pos.page_lsn();
        let segno = pos.segment_number(seg_size);

        if cursor.file.as_ref().map(|f| f.segno()) != Some(segno) {
            cursor.file = None;
            match self.open_segment(segno)? {
                Some((file, expected_tli)) => {
                    cursor.decoder.set_expected_timeline(expected_tli);
                    cursor.file = Some(file);
                }
                None => return Ok(false),
            }
        }
        let file = match &cursor.file {
            Some(f) => f,
            None => return Ok(false),
        };

        let bytes = self.io.read(file, page_lsn, XLOG_BLCKSZ)?;
        let page = PageBuf::from_bytes(page_lsn, seg_size, &bytes)
            .ok_or_else(|| WalError::corruption(page_lsn, "short page read"))?;
        cursor.decoder.feed_bytes(&page.as_bytes()[pos.block_offset() as usize..]);
        cursor.page = Some(page);
        cursor.read_pos = page_lsn + XLOG_BLCKSZ as u64;
        Ok(true)
    }

    /// The file of segment `segno` on the newest timeline that covers it,
    /// with the timeline its pages must carry. A segment in which a timeline
    /// begins also holds pages of the parent, so it is not checked.
    fn open_segment(&self, segno: XLogSegNo) -> WalResult<Option<(SegmentFile, Option<TimeLineID>)>> {
        let seg_size = self.io.seg_size() as u64;
        let seg_start = Lsn(segno * seg_size);
        let seg_end = seg_start + seg_size;
        for entry in self.history.iter().rev() {
            let covers = entry.begin < seg_end && (!entry.end.is_valid() || entry.end > seg_start);
            if !covers {
                continue;
            }
            if let Some(file) = self.io.open_read(entry.tli, segno)? {
                let expected = (entry.begin <= seg_start).then_some(entry.tli);
                trace!("reading segment {segno} of timeline {}", entry.tli);
                return Ok(Some((file, expected)));
            }
        }
        Ok(None)
    }

    /// Read from `start` until the WAL ends or a record is invalid.
    pub fn find_end(&self, start: Lsn, prev: Option<Lsn>) -> WalResult<WalEnd> {
        let mut cursor = self.open_after(start, prev);
        let mut end = WalEnd {
            end_lsn: start,
            last_record: prev,
            records: 0,
        };
        loop {
            match self.read_record(&mut cursor) {
                Ok(Some(rec)) => {
                    end.end_lsn = rec.end_lsn;
                    end.last_record = Some(rec.lsn);
                    end.records += 1;
                }
                Ok(None) => break,
                Err(e) if e.is_corruption() => {
                    info!("WAL ends at an invalid record: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(end)
    }
}

/// Check a record read back from somewhere other than a cursor.
pub fn validate_record(rec: &Record) -> WalResult<()> {
    let raw = &rec.decoded.record;
    if raw.len() < XLOG_SIZE_OF_XLOG_RECORD || raw.len() != rec.header.xl_tot_len as usize {
        return Err(WalError::corruption(
            rec.lsn,
            format!("record length {} does not match header {}", raw.len(), rec.header.xl_tot_len),
        ));
    }
    if !record_crc_matches(raw) {
        return Err(WalError::corruption(rec.lsn, "incorrect resource manager data checksum"));
    }
    if rec.header.xl_prev >= rec.lsn.0 {
        return Err(WalError::corruption(
            rec.lsn,
            format!("record with incorrect prev-link {}", Lsn(rec.header.xl_prev)),
        ));
    }
    if Rmgr::from_id(rec.header.xl_rmid).is_none() {
        return Err(WalError::corruption(
            rec.lsn,
            format!("invalid resource manager ID {}", rec.header.xl_rmid),
        ));
    }
    if rec.header.is_xlog_switch_record() && rec.header.xl_tot_len as usize != XLOG_SIZE_OF_XLOG_RECORD {
        return Err(WalError::corruption(rec.lsn, "switch record with data"));
    }
    if rec.header.xl_rmid == pg_constants::RM_XLOG_ID && rec.decoded.blocks.len() > 1 {
        debug!("XLOG record at {} with {} blocks", rec.lsn, rec.decoded.blocks.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::RecordBuilder;
    use crate::segment::SegmentDir;
    use crate::timeline::parse_history;
    use crate::writer::{InsertedRecord, WriterSetup, XLogWriter};
    use std::sync::Arc;

    const SEG: usize = 1024 * 1024;

    fn setup(dir: &std::path::Path, tli: TimeLineID, start: Lsn, prev: Lsn) -> Arc<XLogWriter> {
        let segs = SegmentDir::new(dir.join("pg_wal"), SEG, true);
        segs.create_dirs().unwrap();
        XLogWriter::open(
            WalIo::new(segs, None),
            WriterSetup {
                tli,
                system_id: 99,
                start,
                prev_record: prev,
                redo: start,
                insertion_slots: 2,
                wal_buffers: 8,
                full_page_writes: true,
                archive_mode: false,
                no_sync: true,
                writer_delay: None,
            },
        )
        .unwrap()
    }

    fn insert(w: &XLogWriter, data: &[u8]) -> InsertedRecord {
        let mut b = RecordBuilder::begin(w);
        b.register_data(data);
        b.insert(pg_constants::RM_GENERIC_ID, 0).unwrap()
    }

    #[test]
    fn reads_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let w = setup(dir.path(), 1, Lsn(SEG as u64), Lsn(0));
        let a = insert(&w, b"first");
        let big = vec![0xAAu8; 9000];
        let b = insert(&w, &big);
        let sw = w.switch().unwrap();
        let c = insert(&w, b"after switch");
        w.flush(c.end_lsn).unwrap();

        let reader = XLogReader::new(w.io(), parse_history(1, "").unwrap()).with_system_id(99);
        let mut cur = reader.open_at(a.start_lsn);
        let ra = reader.read_record(&mut cur).unwrap().unwrap();
        assert_eq!(ra.lsn, a.start_lsn);
        assert_eq!(&ra.decoded.main_data()[..], b"first");
        let rb = reader.read_record(&mut cur).unwrap().unwrap();
        assert_eq!(rb.lsn, b.start_lsn);
        assert_eq!(rb.header.xl_prev, a.start_lsn.0);
        assert_eq!(&rb.decoded.main_data()[..], &big[..]);
        validate_record(&rb).unwrap();
        let rs = reader.read_record(&mut cur).unwrap().unwrap();
        assert_eq!(rs.lsn, sw.start_lsn);
        assert_eq!(rs.end_lsn, Lsn(2 * SEG as u64));
        let rc = reader.read_record(&mut cur).unwrap().unwrap();
        assert_eq!(rc.lsn, c.start_lsn);
        assert!(reader.read_record(&mut cur).unwrap().is_none());
        // still at the end
        assert!(reader.read_record(&mut cur).unwrap().is_none());
        assert_eq!(cur.next_lsn(), c.end_lsn);

        let end = reader.find_end(a.start_lsn, None).unwrap();
        assert_eq!(end.end_lsn, c.end_lsn);
        assert_eq!(end.last_record, Some(c.start_lsn));
        assert_eq!(end.records, 4);
    }

    #[test]
    fn empty_history_reads_timeline_one() {
        let dir = tempfile::tempdir().unwrap();
        let w = setup(dir.path(), 1, Lsn(SEG as u64), Lsn(0));
        let a = insert(&w, &[7u8; 200]);
        w.flush(a.end_lsn).unwrap();

        let reader = XLogReader::new(w.io(), Vec::new());
        let mut cur = reader.open_at(a.start_lsn);
        let rec = reader.read_record(&mut cur).unwrap().expect("record on disk");
        assert_eq!(rec.lsn, a.start_lsn);
        assert_eq!(&rec.decoded.main_data()[..], &[7u8; 200][..]);
    }

    #[test]
    fn corrupt_record_stops_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let w = setup(dir.path(), 1, Lsn(SEG as u64), Lsn(0));
        let a = insert(&w, b"aaaa");
        let b = insert(&w, &[0xBB; 100]);
        let c = insert(&w, b"cccc");
        w.flush(c.end_lsn).unwrap();

        let file = w.io().segments().open(1, 1).unwrap();
        let off = b.start_lsn.segment_offset(SEG) + XLOG_SIZE_OF_XLOG_RECORD + 40;
        let mut byte = file.pread(off, 1).unwrap();
        byte[0] ^= 0x04;
        file.pwrite(off, &byte).unwrap();

        let reader = XLogReader::new(w.io(), parse_history(1, "").unwrap());
        let mut cur = reader.open_at(a.start_lsn);
        assert_eq!(reader.read_record(&mut cur).unwrap().unwrap().lsn, a.start_lsn);
        for _ in 0..2 {
            match reader.read_record(&mut cur) {
                Err(WalError::Corruption { lsn, .. }) => assert_eq!(lsn, b.start_lsn),
                other => panic!("expected corruption, got {other:?}"),
            }
            assert_eq!(cur.next_lsn(), b.start_lsn);
        }
        assert_eq!(reader.find_end(a.start_lsn, None).unwrap().end_lsn, a.end_lsn);
    }

    #[test]
    fn wrong_timeline_in_page_header() {
        let dir = tempfile::tempdir().unwrap();
        let w = setup(dir.path(), 1, Lsn(SEG as u64), Lsn(0));
        let a = insert(&w, b"x");
        w.flush(a.end_lsn).unwrap();
        // pretend the segment belongs to timeline 2 although its pages say 1
        let segs = w.io().segments();
        std::fs::copy(segs.segment_path(1, 1), segs.segment_path(2, 1)).unwrap();

        let history = parse_history(2, "1\t0/100000\tno reason\n").unwrap();
        let reader = XLogReader::new(w.io(), history);
        // start at the page header so that it gets checked
        let mut cur = reader.open_at(Lsn(SEG as u64));
        assert!(matches!(
            reader.read_record(&mut cur),
            Err(WalError::Corruption { .. })
        ));
    }

    #[test]
    fn follows_timeline_switch() {
        let dir = tempfile::tempdir().unwrap();
        let w = setup(dir.path(), 1, Lsn(SEG as u64), Lsn(0));
        let a = insert(&w, b"on one");
        w.flush(a.end_lsn).unwrap();
        let switchpoint = a.end_lsn;
        // timeline 2 starts at the switch point, in the same segment
        let segs = w.io().segments().clone();
        std::fs::copy(segs.segment_path(1, 1), segs.segment_path(2, 1)).unwrap();
        w.shutdown().unwrap();
        drop(w);

        let w2 = setup(dir.path(), 2, switchpoint, a.start_lsn);
        let b = insert(&w2, b"on two");
        w2.flush(b.end_lsn).unwrap();

        let history = parse_history(2, &format!("1\t{switchpoint}\tpromoted\n")).unwrap();
        let reader = XLogReader::new(w2.io(), history);
        let mut cur = reader.open_at(a.start_lsn);
        assert_eq!(reader.read_record(&mut cur).unwrap().unwrap().lsn, a.start_lsn);
        let rb = reader.read_record(&mut cur).unwrap().unwrap();
        assert_eq!(rb.lsn, b.start_lsn);
        assert_eq!(&rb.decoded.main_data()[..], b"on two");
    }
}
