//!
//! XLOG insertion and write-out.
//!
//! Inserting a record happens in three steps:
//!
//! 1. Reserve space. Under the reservation lock the record's start is
//!    computed from the current insert position, `xl_prev` is filled in and
//!    the position is advanced past the record. This is the only serialized
//!    part of an insertion.
//! 2. Copy the record into the in-memory page ring. Several inserters copy
//!    at once, each advertising in its insertion slot how far it got.
//! 3. Write and flush. Pages are written out in order by whoever needs WAL
//!    on disk: a committing backend, a backend that needs a ring slot back,
//!    or the background flusher. Before writing up to some position the
//!    writer waits for every inserter that is still copying below it.
//!
//! The ring holds `wal_buffers` pages. A page can only be recycled once it
//! has been written out.
//!
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crc32c::crc32c_append;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use postgres_ffi::page::PageBuf;
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::{
    advance_over_page_headers, record_start_position, XLogFileName, XLOG_RECORD_CRC_OFFS,
    XLOG_SIZE_OF_XLOG_RECORD,
};
use postgres_ffi::{TimeLineID, XLogRecord, XLogSegNo, XLOG_BLCKSZ};
use tracing::*;
use utils::lsn::{AtomicLsn, Lsn};
use utils::signals::Latch;

use crate::crypt::WalIo;
use crate::error::{WalError, WalResult};
use crate::segment::SegmentFile;

const SLOT_IDLE: u64 = u64::MAX;
const INSERT_WAIT: Duration = Duration::from_millis(10);

/// Where a record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedRecord {
    pub start_lsn: Lsn,
    /// Position right after the record, aligned. For a switch record this is
    /// the start of the next segment.
    pub end_lsn: Lsn,
}

/// The full-page-write inputs an assembled record depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpwSnapshot {
    pub redo: Lsn,
    pub do_page_writes: bool,
}

/// What the assembler saw when it decided which pages to back up. If the
/// redo pointer passed `fpw_lsn` in the meantime, or page writes were turned
/// on, the insertion is refused with [`WalError::Conflict`].
#[derive(Debug, Clone, Copy)]
pub struct FpwCheck {
    /// Oldest page LSN that was skipped for a backup image.
    pub fpw_lsn: Lsn,
    pub do_page_writes: bool,
}

/// Parameters of [`XLogWriter::open`].
#[derive(Debug, Clone)]
pub struct WriterSetup {
    pub tli: TimeLineID,
    pub system_id: u64,
    /// Insert position to continue from: the end of the last valid record.
    pub start: Lsn,
    /// Start of the last valid record.
    pub prev_record: Lsn,
    pub redo: Lsn,
    pub insertion_slots: usize,
    pub wal_buffers: usize,
    pub full_page_writes: bool,
    pub archive_mode: bool,
    pub no_sync: bool,
    /// Wakeup interval of the background flusher; `None` starts no flusher.
    pub writer_delay: Option<Duration>,
}

struct ReserveState {
    cur_pos: Lsn,
    prev_record: Lsn,
}

struct FpwState {
    redo: Lsn,
    full_page_writes: bool,
    force_page_writes: bool,
}

impl FpwState {
    fn snapshot(&self) -> FpwSnapshot {
        FpwSnapshot {
            redo: self.redo,
            do_page_writes: self.full_page_writes || self.force_page_writes,
        }
    }
}

struct RingPage {
    page: PageBuf,
    initialized: bool,
}

struct WriteState {
    file: Option<SegmentFile>,
}

pub struct XLogWriter {
    io: WalIo,
    tli: TimeLineID,
    system_id: u64,
    seg_size: usize,
    archive_mode: bool,
    no_sync: bool,

    reserve: Mutex<ReserveState>,
    fpw: RwLock<FpwState>,

    /// Per slot, the position below which its inserter has copied all of its
    /// bytes, or `SLOT_IDLE`.
    inserting_at: Vec<AtomicU64>,
    free_slots: Mutex<Vec<usize>>,
    slot_freed: Condvar,
    insert_mx: Mutex<()>,
    insert_progress: Condvar,

    ring: Vec<Mutex<RingPage>>,
    write: Mutex<WriteState>,
    written: AtomicLsn,
    flushed: AtomicLsn,

    async_xact_lsn: AtomicLsn,
    last_important: AtomicLsn,
    in_recovery: AtomicBool,
    broken: AtomicBool,

    latch: Arc<Latch>,
    shutdown: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl XLogWriter {
    /// Set up insertion at `setup.start`. When that is in the middle of a
    /// page, the page is read back so that it is rewritten intact.
    pub fn open(io: WalIo, setup: WriterSetup) -> WalResult<Arc<XLogWriter>> {
        if setup.insertion_slots == 0 || setup.wal_buffers < 4 {
            return Err(WalError::bad_state("need at least one insertion slot and four WAL buffers"));
        }
        let seg_size = io.seg_size();
        let mut ring: Vec<Mutex<RingPage>> = (0..setup.wal_buffers)
            .map(|_| {
                Mutex::new(RingPage {
                    page: PageBuf::new_zeroed(Lsn(0), seg_size),
                    initialized: false,
                })
            })
            .collect();

        let start = setup.start;
        if start.block_offset() != 0 {
            let page_lsn = start.page_lsn();
            let segno = page_lsn.segment_number(seg_size);
            let file = io.open_read(setup.tli, segno)?.ok_or_else(|| {
                WalError::bad_state(format!(
                    "WAL segment {} holding the insert position {start} is missing",
                    XLogFileName(setup.tli, segno, seg_size)
                ))
            })?;
            let bytes = io.read(&file, page_lsn, XLOG_BLCKSZ)?;
            let mut page = PageBuf::from_bytes(page_lsn, seg_size, &bytes)
                .ok_or_else(|| WalError::bad_state("short WAL page read"))?;
            // nothing valid follows the insert position
            page.as_bytes_mut()[start.block_offset() as usize..].fill(0);
            let idx = (page_lsn.0 / XLOG_BLCKSZ as u64) as usize % ring.len();
            ring[idx] = Mutex::new(RingPage {
                page,
                initialized: true,
            });
        }

        let writer = Arc::new(XLogWriter {
            io,
            tli: setup.tli,
            system_id: setup.system_id,
            seg_size,
            archive_mode: setup.archive_mode,
            no_sync: setup.no_sync,
            reserve: Mutex::new(ReserveState {
                cur_pos: start,
                prev_record: setup.prev_record,
            }),
            fpw: RwLock::new(FpwState {
                redo: setup.redo,
                full_page_writes: setup.full_page_writes,
                force_page_writes: false,
            }),
            inserting_at: (0..setup.insertion_slots).map(|_| AtomicU64::new(SLOT_IDLE)).collect(),
            free_slots: Mutex::new((0..setup.insertion_slots).rev().collect()),
            slot_freed: Condvar::new(),
            insert_mx: Mutex::new(()),
            insert_progress: Condvar::new(),
            ring,
            write: Mutex::new(WriteState { file: None }),
            written: AtomicLsn::new(start.0),
            flushed: AtomicLsn::new(start.0),
            async_xact_lsn: AtomicLsn::new(0),
            last_important: AtomicLsn::new(0),
            in_recovery: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            latch: Arc::new(Latch::new()),
            shutdown: AtomicBool::new(false),
            flusher: Mutex::new(None),
        });

        if let Some(delay) = setup.writer_delay {
            let weak = Arc::downgrade(&writer);
            let latch = Arc::clone(&writer.latch);
            let handle = std::thread::Builder::new()
                .name("wal flusher".into())
                .spawn(move || background_flusher(weak, latch, delay))
                .map_err(|e| WalError::bad_state(format!("could not start WAL flusher: {e}")))?;
            *writer.flusher.lock() = Some(handle);
        }
        info!(
            "WAL insertion starts at {start} on timeline {}, previous record at {}",
            setup.tli, setup.prev_record
        );
        Ok(writer)
    }

    pub fn timeline(&self) -> TimeLineID {
        self.tli
    }

    pub fn system_id(&self) -> u64 {
        self.system_id
    }

    pub fn seg_size(&self) -> usize {
        self.seg_size
    }

    pub fn io(&self) -> &WalIo {
        &self.io
    }

    /// Insert a record. `header` supplies the rmgr, info and xid; its length,
    /// `xl_prev` and CRC are filled in here. `chain` is the record body after
    /// the fixed header.
    pub fn insert(
        &self,
        header: XLogRecord,
        chain: &[&[u8]],
        check: Option<FpwCheck>,
        flags: u8,
    ) -> WalResult<InsertedRecord> {
        if self.broken.load(Ordering::Acquire) {
            return Err(WalError::bad_state("WAL writing failed earlier, no more WAL can be inserted"));
        }
        let body_len: usize = chain.iter().map(|c| c.len()).sum();
        let tot_len = XLOG_SIZE_OF_XLOG_RECORD + body_len;
        if tot_len > pg_constants::MAX_LOG_RECORD_SIZE {
            return Err(WalError::Overflow(tot_len));
        }
        let mut header = XLogRecord {
            xl_tot_len: tot_len as u32,
            xl_crc: 0,
            ..header
        };
        let is_switch = header.is_xlog_switch_record();
        if is_switch && body_len != 0 {
            return Err(WalError::bad_state("switch record must not carry data"));
        }

        let slot = self.acquire_slot();
        let slot = scopeguard::guard(slot, |slot| self.release_slot(slot));

        let (start, end) = {
            let mut rs = self.reserve.lock();
            if self.in_recovery.load(Ordering::Acquire) {
                return Err(WalError::bad_state("cannot insert WAL during recovery"));
            }
            if let Some(check) = check {
                let cur = self.fpw.read().snapshot();
                if cur.do_page_writes
                    && ((check.fpw_lsn.is_valid() && check.fpw_lsn <= cur.redo)
                        || !check.do_page_writes)
                {
                    return Err(WalError::Conflict(cur.redo));
                }
            }
            if is_switch && rs.cur_pos.segment_offset(self.seg_size) == 0 {
                // already at a segment boundary, nothing to switch
                return Ok(InsertedRecord {
                    start_lsn: rs.cur_pos,
                    end_lsn: rs.cur_pos,
                });
            }
            let start = record_start_position(rs.cur_pos, self.seg_size);
            let end = advance_over_page_headers(start, tot_len, self.seg_size);
            rs.cur_pos = if is_switch {
                next_segment_start(end, self.seg_size)
            } else {
                end.align()
            };
            header.xl_prev = rs.prev_record.0;
            rs.prev_record = start;
            self.inserting_at[*slot].store(start.0, Ordering::Release);
            (start, end)
        };
        if flags & pg_constants::XLOG_MARK_UNIMPORTANT == 0 {
            self.last_important.fetch_max(start);
        }

        let mut crc = 0;
        for chunk in chain {
            crc = crc32c_append(crc, chunk);
        }
        let hdr_bytes = header
            .encode()
            .map_err(|e| WalError::bad_state(format!("could not serialize record header: {e}")))?;
        header.xl_crc = crc32c_append(crc, &hdr_bytes[..XLOG_RECORD_CRC_OFFS]);
        let hdr_bytes = header
            .encode()
            .map_err(|e| WalError::bad_state(format!("could not serialize record header: {e}")))?;

        let mut pieces: Vec<&[u8]> = Vec::with_capacity(chain.len() + 1);
        pieces.push(&hdr_bytes);
        pieces.extend(chain.iter().copied().filter(|c| !c.is_empty()));
        self.copy_record(*slot, start, tot_len, &pieces)?;
        drop(slot);

        trace!("inserted record at {start}, {tot_len} bytes, rmgr {}", header.xl_rmid);
        if is_switch {
            let seg_end = next_segment_start(end, self.seg_size);
            self.flush(seg_end)?;
            return Ok(InsertedRecord {
                start_lsn: start,
                end_lsn: seg_end,
            });
        }
        Ok(InsertedRecord {
            start_lsn: start,
            end_lsn: end.align(),
        })
    }

    fn copy_record(&self, slot: usize, start: Lsn, tot_len: usize, pieces: &[&[u8]]) -> WalResult<()> {
        let mut pos = start;
        let mut remaining = tot_len;
        let mut pieces = pieces.iter().map(|p| &p[..]);
        let mut cur: &[u8] = pieces.next().unwrap_or(&[]);

        let mut page = self.lock_page(pos.page_lsn())?;
        while remaining > 0 {
            if pos.block_offset() == 0 {
                drop(page);
                self.advertise(slot, pos);
                page = self.lock_page(pos)?;
                page.page
                    .init_header(self.tli, self.system_id, remaining as u32)
                    .map_err(|e| WalError::bad_state(format!("could not write page header: {e}")))?;
                pos += page.page.header_size() as u64;
            }
            while cur.is_empty() {
                match pieces.next() {
                    Some(next) => cur = next,
                    None => return Err(WalError::bad_state("record body shorter than its length")),
                }
            }
            let n = page.page.put_at(pos, cur);
            cur = &cur[n..];
            pos += n as u64;
            remaining -= n;
        }
        Ok(())
    }

    /// Lock the ring slot of the page at `page_lsn`, recycling it first. A
    /// slot still holding an unwritten older page is written out before it
    /// is reused.
    fn lock_page(&self, page_lsn: Lsn) -> WalResult<MutexGuard<'_, RingPage>> {
        let idx = (page_lsn.0 / XLOG_BLCKSZ as u64) as usize % self.ring.len();
        loop {
            let mut rp = self.ring[idx].lock();
            if rp.initialized && rp.page.page_lsn() == page_lsn {
                return Ok(rp);
            }
            let old_end = rp.page.page_lsn() + XLOG_BLCKSZ as u64;
            if !rp.initialized || self.written.load() >= old_end {
                rp.page.reset(page_lsn);
                rp.page
                    .init_header(self.tli, self.system_id, 0)
                    .map_err(|e| WalError::bad_state(format!("could not write page header: {e}")))?;
                rp.initialized = true;
                return Ok(rp);
            }
            drop(rp);
            debug!("WAL buffer for {page_lsn} still holds unwritten page, writing up to {old_end}");
            self.write_upto(old_end, false)?;
        }
    }

    fn acquire_slot(&self) -> usize {
        let mut free = self.free_slots.lock();
        loop {
            if let Some(slot) = free.pop() {
                return slot;
            }
            self.slot_freed.wait(&mut free);
        }
    }

    fn release_slot(&self, slot: usize) {
        self.inserting_at[slot].store(SLOT_IDLE, Ordering::Release);
        self.free_slots.lock().push(slot);
        self.slot_freed.notify_one();
        self.insert_progress.notify_all();
    }

    fn advertise(&self, slot: usize, pos: Lsn) {
        self.inserting_at[slot].store(pos.0, Ordering::Release);
        self.insert_progress.notify_all();
    }

    /// Position below which every reserved byte has been copied.
    fn insertions_finished(&self) -> Lsn {
        let reserved = self.reserve.lock().cur_pos;
        let oldest = self
            .inserting_at
            .iter()
            .map(|at| at.load(Ordering::Acquire))
            .min()
            .unwrap_or(SLOT_IDLE);
        reserved.min(Lsn(oldest))
    }

    /// Wait until all insertions below `upto` are copied. Returns how far
    /// insertions are finished, which may be beyond `upto`.
    fn wait_insertions(&self, upto: Lsn) -> Lsn {
        loop {
            let finished = self.insertions_finished();
            if finished >= upto.min(self.reserve.lock().cur_pos) {
                return finished;
            }
            let mut guard = self.insert_mx.lock();
            self.insert_progress.wait_for(&mut guard, INSERT_WAIT);
        }
    }

    /// Write out everything below `upto`, and fsync it if `flush`.
    fn write_upto(&self, upto: Lsn, flush: bool) -> WalResult<()> {
        let upto = self.wait_insertions(upto).min(upto);
        let mut ws = self.write.lock();
        let res = self.write_locked(&mut ws, upto, flush);
        if res.is_err() {
            self.broken.store(true, Ordering::Release);
        }
        res
    }

    fn write_locked(&self, ws: &mut WriteState, upto: Lsn, flush: bool) -> WalResult<()> {
        let written = self.written.load();
        if upto > written {
            let mut page_lsn = written.page_lsn();
            while page_lsn < upto {
                let segno = page_lsn.segment_number(self.seg_size);
                let seg_end = Lsn((segno + 1) * self.seg_size as u64);
                let batch_end = seg_end.min(upto);
                let batch_start = page_lsn;
                let mut buf = Vec::with_capacity((batch_end - batch_start) as usize + XLOG_BLCKSZ);
                while page_lsn < batch_end {
                    self.copy_out_page(page_lsn, &mut buf)?;
                    page_lsn += XLOG_BLCKSZ as u64;
                }

                let file = self.segment_for_write(ws, segno)?;
                self.io.write(file, batch_start, &buf)?;
                if page_lsn == seg_end {
                    self.finish_segment(ws)?;
                }
            }
            self.written.store(upto);
        }

        if flush && upto > self.flushed.load() {
            if !self.no_sync {
                if let Some(file) = &ws.file {
                    file.fsync()?;
                }
            }
            self.flushed.fetch_max(upto);
        }
        Ok(())
    }

    fn copy_out_page(&self, page_lsn: Lsn, buf: &mut Vec<u8>) -> WalResult<()> {
        let idx = (page_lsn.0 / XLOG_BLCKSZ as u64) as usize % self.ring.len();
        let rp = self.ring[idx].lock();
        if rp.initialized && rp.page.page_lsn() == page_lsn {
            buf.extend_from_slice(rp.page.as_bytes());
        } else {
            // a page no record reached, such as the tail of a switched segment
            drop(rp);
            let mut page = PageBuf::new_zeroed(page_lsn, self.seg_size);
            page.init_header(self.tli, self.system_id, 0)
                .map_err(|e| WalError::bad_state(format!("could not write page header: {e}")))?;
            buf.extend_from_slice(page.as_bytes());
        }
        Ok(())
    }

    fn segment_for_write<'a>(&self, ws: &'a mut WriteState, segno: XLogSegNo) -> WalResult<&'a SegmentFile> {
        if ws.file.as_ref().map(|f| f.segno()) != Some(segno) {
            if let Some(old) = ws.file.take() {
                if !self.no_sync {
                    old.fsync()?;
                }
            }
            ws.file = Some(self.io.segments().create(self.tli, segno, true)?);
        }
        ws.file
            .as_ref()
            .ok_or_else(|| WalError::bad_state("no open WAL segment"))
    }

    fn finish_segment(&self, ws: &mut WriteState) -> WalResult<()> {
        if let Some(file) = ws.file.take() {
            if !self.no_sync {
                file.fsync()?;
            }
            let name = self.io.segments().segment_name(file.tli(), file.segno());
            debug!("finished WAL segment {name}");
            if self.archive_mode {
                self.io.segments().mark_ready(&name)?;
            }
        }
        Ok(())
    }

    /// Make sure WAL up to `upto` is on disk. Whatever other inserters have
    /// finished by then is flushed along with it.
    pub fn flush(&self, upto: Lsn) -> WalResult<()> {
        if self.flushed.load() >= upto {
            return Ok(());
        }
        let reserved = self.reserve.lock().cur_pos;
        if upto > reserved {
            return Err(WalError::bad_state(format!(
                "cannot flush to {upto}, WAL is only reserved up to {reserved}"
            )));
        }
        let target = self.wait_insertions(upto);
        self.write_upto(target, true)
    }

    /// One round of the background flusher: flush pending asynchronous
    /// commits, or else every completed page. Returns whether anything was
    /// flushed.
    pub fn background_flush(&self) -> WalResult<bool> {
        let finished = self.insertions_finished();
        let target = self.async_xact_lsn.load().min(finished).max(finished.page_lsn());
        if target <= self.flushed.load() {
            return Ok(false);
        }
        self.flush(target)?;
        Ok(true)
    }

    pub fn needs_flush(&self, lsn: Lsn) -> bool {
        lsn > self.flushed.load()
    }

    /// Note the end of an asynchronously committed transaction; the
    /// background flusher makes it durable.
    pub fn set_async_xact_lsn(&self, lsn: Lsn) {
        if self.async_xact_lsn.fetch_max(lsn) < lsn {
            self.latch.set();
        }
    }

    /// Insert a switch record, ending the current segment.
    pub fn switch(&self) -> WalResult<InsertedRecord> {
        let header = XLogRecord {
            xl_rmid: pg_constants::RM_XLOG_ID,
            xl_info: pg_constants::XLOG_SWITCH,
            ..Default::default()
        };
        let rec = self.insert(header, &[], None, 0)?;
        if rec.start_lsn != rec.end_lsn {
            info!("switched WAL segment at {}", rec.start_lsn);
        }
        Ok(rec)
    }

    /// Fix the redo pointer of a starting checkpoint at the next record
    /// position. Records assembled before this may need to be rebuilt with
    /// more full-page images.
    pub fn begin_checkpoint(&self) -> Lsn {
        let rs = self.reserve.lock();
        let redo = record_start_position(rs.cur_pos, self.seg_size);
        self.fpw.write().redo = redo;
        redo
    }

    pub fn fpw_snapshot(&self) -> FpwSnapshot {
        self.fpw.read().snapshot()
    }

    pub fn set_full_page_writes(&self, on: bool) {
        self.fpw.write().full_page_writes = on;
    }

    /// Force full-page writes regardless of the setting, as during a base
    /// backup.
    pub fn set_force_page_writes(&self, on: bool) {
        self.fpw.write().force_page_writes = on;
    }

    /// Next position a record could be reserved at.
    pub fn insert_position(&self) -> Lsn {
        self.reserve.lock().cur_pos
    }

    pub fn prev_record(&self) -> Lsn {
        self.reserve.lock().prev_record
    }

    pub fn written(&self) -> Lsn {
        self.written.load()
    }

    pub fn flushed(&self) -> Lsn {
        self.flushed.load()
    }

    /// Start of the newest record not marked unimportant.
    pub fn last_important(&self) -> Lsn {
        self.last_important.load()
    }

    pub fn set_in_recovery(&self, on: bool) {
        self.in_recovery.store(on, Ordering::Release);
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    /// Flush everything inserted so far and stop the background flusher.
    pub fn shutdown(&self) -> WalResult<()> {
        self.shutdown.store(true, Ordering::Release);
        self.latch.set();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        let end = self.insert_position();
        if !self.broken.load(Ordering::Acquire) && end > self.flushed.load() {
            self.flush(end)?;
        }
        let mut ws = self.write.lock();
        if let Some(file) = ws.file.take() {
            if !self.no_sync {
                file.fsync()?;
            }
        }
        Ok(())
    }
}

fn next_segment_start(lsn: Lsn, seg_size: usize) -> Lsn {
    if lsn.segment_offset(seg_size) == 0 {
        lsn
    } else {
        lsn.segment_lsn(seg_size) + seg_size as u64
    }
}

fn background_flusher(writer: Weak<XLogWriter>, latch: Arc<Latch>, delay: Duration) {
    loop {
        latch.wait_timeout(delay);
        let Some(w) = writer.upgrade() else { break };
        if w.shutdown.load(Ordering::Acquire) {
            break;
        }
        latch.reset();
        if let Err(e) = w.background_flush() {
            error!("background WAL flush failed: {e}");
        }
    }
    debug!("WAL flusher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentDir;
    use postgres_ffi::waldecoder::WalStreamDecoder;
    use postgres_ffi::xlog_utils::XLOG_SIZE_OF_XLOG_LONG_PHD;

    const SEG: usize = 1024 * 1024;

    fn writer(dir: &std::path::Path, start: Lsn) -> Arc<XLogWriter> {
        let segs = SegmentDir::new(dir.join("pg_wal"), SEG, true);
        segs.create_dirs().unwrap();
        XLogWriter::open(
            WalIo::new(segs, None),
            WriterSetup {
                tli: 1,
                system_id: 7,
                start,
                prev_record: Lsn(0),
                redo: Lsn(0),
                insertion_slots: 4,
                wal_buffers: 8,
                full_page_writes: true,
                archive_mode: true,
                no_sync: true,
                writer_delay: None,
            },
        )
        .unwrap()
    }

    fn insert_data(w: &XLogWriter, len: usize) -> InsertedRecord {
        let data = vec![0x5Au8; len];
        let hdr: Vec<u8> = if len <= 255 {
            vec![pg_constants::XLR_BLOCK_ID_DATA_SHORT, len as u8]
        } else {
            let mut h = vec![pg_constants::XLR_BLOCK_ID_DATA_LONG];
            h.extend_from_slice(&(len as u32).to_le_bytes());
            h
        };
        let header = XLogRecord {
            xl_rmid: pg_constants::RM_LOGICALMSG_ID,
            ..Default::default()
        };
        w.insert(header, &[&hdr, &data], None, 0).unwrap()
    }

    fn decode_all(dir: &std::path::Path, start: Lsn, end: Lsn) -> Vec<(Lsn, Lsn)> {
        let segs = SegmentDir::new(dir.join("pg_wal"), SEG, true);
        let mut dec = WalStreamDecoder::new(start, SEG);
        let mut pos = start;
        let mut out = Vec::new();
        while pos < end {
            let segno = pos.segment_number(SEG);
            let file = segs.open_read(1, segno).unwrap().unwrap();
            let seg_end = Lsn((segno + 1) * SEG as u64);
            let upto = seg_end.min(end.page_lsn() + XLOG_BLCKSZ as u64);
            dec.feed_bytes(&file.pread(pos.segment_offset(SEG), (upto - pos) as usize).unwrap());
            pos = upto;
            while let Ok(Some(rec)) = dec.poll_decode() {
                out.push((rec.start_lsn, rec.end_lsn));
            }
        }
        out
    }

    #[test]
    fn records_get_increasing_positions() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), Lsn(SEG as u64));
        let a = insert_data(&w, 10);
        let b = insert_data(&w, 100);
        assert_eq!(a.start_lsn, Lsn(SEG as u64 + XLOG_SIZE_OF_XLOG_LONG_PHD as u64));
        assert!(b.start_lsn >= a.end_lsn);
        assert_eq!(w.prev_record(), b.start_lsn);
        assert_eq!(w.insert_position(), b.end_lsn);
        assert!(b.end_lsn.is_aligned());
    }

    #[test]
    fn flushed_records_decode_back() {
        let dir = tempfile::tempdir().unwrap();
        let start = Lsn(SEG as u64);
        let w = writer(dir.path(), start);
        let mut inserted = Vec::new();
        // enough to wrap the ring several times and cross page boundaries
        for i in 0..200 {
            inserted.push(insert_data(&w, 50 + (i * 37) % 900));
        }
        let big = insert_data(&w, 3 * XLOG_BLCKSZ);
        inserted.push(big);
        w.flush(big.end_lsn).unwrap();
        assert!(w.flushed() >= big.end_lsn);
        assert!(!w.needs_flush(big.end_lsn));

        let decoded = decode_all(dir.path(), start, big.end_lsn);
        let expected: Vec<(Lsn, Lsn)> = inserted.iter().map(|r| (r.start_lsn, r.end_lsn)).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn switch_moves_to_next_segment() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), Lsn(SEG as u64));
        insert_data(&w, 10);
        let sw = w.switch().unwrap();
        assert_eq!(sw.end_lsn, Lsn(2 * SEG as u64));
        // the switch flushed and closed the segment
        assert!(w.flushed() >= sw.end_lsn);
        let segs = w.io().segments();
        assert!(segs.status_path(&segs.segment_name(1, 1), "ready").exists());

        let next = insert_data(&w, 10);
        assert_eq!(next.start_lsn, Lsn(2 * SEG as u64 + XLOG_SIZE_OF_XLOG_LONG_PHD as u64));

        // nothing to switch at a segment boundary
        let dir2 = tempfile::tempdir().unwrap();
        let w2 = writer(dir2.path(), Lsn(3 * SEG as u64));
        let noop = w2.switch().unwrap();
        assert_eq!(noop.start_lsn, noop.end_lsn);
    }

    #[test]
    fn continuation_page_has_contrecord_flag() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), Lsn(SEG as u64));
        let rec = insert_data(&w, XLOG_BLCKSZ);
        w.flush(rec.end_lsn).unwrap();

        let file = w.io().segments().open_read(1, 1).unwrap().unwrap();
        let second = file.pread(XLOG_BLCKSZ, XLOG_BLCKSZ).unwrap();
        let page = PageBuf::from_bytes(Lsn(SEG as u64 + XLOG_BLCKSZ as u64), SEG, &second).unwrap();
        let hdr = page.validate(Some(1)).unwrap();
        assert_ne!(hdr.xlp_info & pg_constants::XLP_FIRST_IS_CONTRECORD, 0);
        assert!(hdr.xlp_rem_len > 0);
    }

    #[test]
    fn stale_fpw_decision_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), Lsn(SEG as u64));
        insert_data(&w, 10);
        let redo = w.begin_checkpoint();
        let header = XLogRecord {
            xl_rmid: pg_constants::RM_HEAP_ID,
            ..Default::default()
        };
        let body = [pg_constants::XLR_BLOCK_ID_DATA_SHORT, 1, 0];
        let stale = FpwCheck {
            fpw_lsn: Lsn(SEG as u64),
            do_page_writes: true,
        };
        match w.insert(header, &[&body], Some(stale), 0) {
            Err(WalError::Conflict(r)) => assert_eq!(r, redo),
            other => panic!("expected conflict, got {other:?}"),
        }
        let fresh = FpwCheck {
            fpw_lsn: redo + 100u64,
            do_page_writes: true,
        };
        assert!(w.insert(header, &[&body], Some(fresh), 0).is_ok());
    }

    #[test]
    fn concurrent_inserters() {
        let dir = tempfile::tempdir().unwrap();
        let start = Lsn(SEG as u64);
        let w = writer(dir.path(), start);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let w = w.clone();
                std::thread::spawn(move || {
                    (0..100).map(|i| insert_data(&w, 20 + t * 50 + i * 3)).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<InsertedRecord> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_by_key(|r| r.start_lsn);
        let end = all.last().unwrap().end_lsn;
        w.flush(end).unwrap();

        let decoded = decode_all(dir.path(), start, end);
        assert_eq!(decoded.len(), all.len());
        assert_eq!(decoded.last().unwrap().1, end);
    }
}
