//!
//! Record assembly.
//!
//! A [`RecordBuilder`] collects the pieces of one record: block references,
//! per-block data and main data. Everything registered is copied into the
//! builder, so callers keep their buffers. On [`RecordBuilder::insert`] the
//! pieces are laid out in the standard record format:
//!
//! ```text
//!   block header [image header] [relfilenode] blkno   (per block, by id)
//!   [origin] [toplevel xid]
//!   main data header
//!   image and data of each block, in block order
//!   main data
//! ```
//!
//! Whether a block gets a full-page image depends on the redo pointer and
//! the full-page-write setting at the time of assembly. If either changes
//! before the record is reserved, the writer refuses it and the record is
//! assembled again.
//!
use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::XLOG_SIZE_OF_XLOG_RECORD;
use postgres_ffi::{
    page_get_lsn, BlockNumber, RelFileNode, RepOriginId, RmgrId, TransactionId, XLogRecord,
    BLCKSZ,
};
use tracing::*;
use utils::lsn::Lsn;

use crate::error::{WalError, WalResult};
use crate::writer::{FpwCheck, FpwSnapshot, InsertedRecord, XLogWriter};

/// A page held by the caller's buffer manager.
#[derive(Debug, Clone)]
pub struct BufferRef<'a> {
    pub rnode: RelFileNode,
    pub forknum: u8,
    pub blkno: BlockNumber,
    pub page: &'a [u8],
    /// The caller changed the page under the record being built.
    pub dirty: bool,
}

struct BlockRef {
    rnode: RelFileNode,
    forknum: u8,
    blkno: BlockNumber,
    page: Option<Bytes>,
    flags: u8,
    data: BytesMut,
}

/// Builds and inserts one record. Obtain one with [`RecordBuilder::begin`].
pub struct RecordBuilder<'w> {
    writer: &'w XLogWriter,
    blocks: BTreeMap<u8, BlockRef>,
    main_data: BytesMut,
    record_flags: u8,
    xid: TransactionId,
    origin: RepOriginId,
    toplevel_xid: Option<TransactionId>,
}

struct Assembled {
    chain: Vec<Bytes>,
    fpw_lsn: Lsn,
    num_fpi: usize,
}

impl<'w> RecordBuilder<'w> {
    pub fn begin(writer: &'w XLogWriter) -> RecordBuilder<'w> {
        RecordBuilder {
            writer,
            blocks: BTreeMap::new(),
            main_data: BytesMut::new(),
            record_flags: 0,
            xid: 0,
            origin: 0,
            toplevel_xid: None,
        }
    }

    /// Transaction the record belongs to.
    pub fn set_xid(&mut self, xid: TransactionId) -> &mut Self {
        self.xid = xid;
        self
    }

    /// Replication origin of the session; logged with `XLOG_INCLUDE_ORIGIN`.
    pub fn set_origin(&mut self, origin: RepOriginId) -> &mut Self {
        self.origin = origin;
        self
    }

    /// Top-level transaction of a subtransaction, for logical decoding.
    pub fn set_toplevel_xid(&mut self, xid: TransactionId) -> &mut Self {
        self.toplevel_xid = Some(xid);
        self
    }

    /// `XLOG_INCLUDE_ORIGIN` and `XLOG_MARK_UNIMPORTANT`.
    pub fn set_record_flags(&mut self, flags: u8) -> &mut Self {
        self.record_flags |= flags;
        self
    }

    pub fn register_buffer(&mut self, block_id: u8, buf: &BufferRef<'_>, flags: u8) -> WalResult<&mut Self> {
        if !buf.dirty && flags & pg_constants::REGBUF_NO_CHANGE == 0 {
            return Err(WalError::bad_state(format!(
                "block {} of relation {} registered without being changed",
                buf.blkno, buf.rnode.relnode
            )));
        }
        self.register_block(block_id, buf.rnode, buf.forknum, buf.blkno, Some(buf.page), flags)
    }

    /// Reference a block that is not in the buffer manager. Without a page
    /// the block can never get an image.
    pub fn register_block(
        &mut self,
        block_id: u8,
        rnode: RelFileNode,
        forknum: u8,
        blkno: BlockNumber,
        page: Option<&[u8]>,
        flags: u8,
    ) -> WalResult<&mut Self> {
        if block_id > pg_constants::XLR_MAX_BLOCK_ID {
            return Err(WalError::bad_state(format!("block id {block_id} out of range")));
        }
        if self.blocks.contains_key(&block_id) {
            return Err(WalError::bad_state(format!("block id {block_id} registered twice")));
        }
        if let Some(page) = page {
            if page.len() != BLCKSZ as usize {
                return Err(WalError::bad_state(format!("page image of {} bytes", page.len())));
            }
        }
        self.blocks.insert(
            block_id,
            BlockRef {
                rnode,
                forknum,
                blkno,
                page: page.map(Bytes::copy_from_slice),
                flags,
                data: BytesMut::new(),
            },
        );
        Ok(self)
    }

    /// Append to the record's main data.
    pub fn register_data(&mut self, data: &[u8]) -> &mut Self {
        self.main_data.extend_from_slice(data);
        self
    }

    /// Append data that belongs to block `block_id`. It is left out when the
    /// block gets an image, unless registered with `REGBUF_KEEP_DATA`.
    pub fn register_buf_data(&mut self, block_id: u8, data: &[u8]) -> WalResult<&mut Self> {
        let block = self
            .blocks
            .get_mut(&block_id)
            .ok_or_else(|| WalError::bad_state(format!("block {block_id} not registered")))?;
        let len = block.data.len() + data.len();
        if len > u16::MAX as usize {
            return Err(WalError::Overflow(len));
        }
        block.data.extend_from_slice(data);
        Ok(self)
    }

    /// Assemble and insert the record.
    pub fn insert(self, rmid: RmgrId, info: u8) -> WalResult<InsertedRecord> {
        let allowed = pg_constants::XLR_RMGR_INFO_MASK
            | pg_constants::XLR_SPECIAL_REL_UPDATE
            | pg_constants::XLR_CHECK_CONSISTENCY;
        if info & !allowed != 0 {
            return Err(WalError::bad_state(format!("invalid xlog info mask {info:#04X}")));
        }
        let is_switch = rmid == pg_constants::RM_XLOG_ID && info == pg_constants::XLOG_SWITCH;
        if self.blocks.is_empty() && self.main_data.is_empty() && !is_switch {
            return Err(WalError::bad_state("no data registered for the record"));
        }

        let header = XLogRecord {
            xl_xid: self.xid,
            xl_info: info,
            xl_rmid: rmid,
            ..Default::default()
        };
        let mut do_page_writes = false;
        loop {
            let mut fpw = self.writer.fpw_snapshot();
            // never back off from images once they were needed
            fpw.do_page_writes |= do_page_writes;
            do_page_writes = fpw.do_page_writes;

            let assembled = self.assemble(fpw)?;
            let check = (!self.blocks.is_empty()).then_some(FpwCheck {
                fpw_lsn: assembled.fpw_lsn,
                do_page_writes,
            });
            let chain: Vec<&[u8]> = assembled.chain.iter().map(|c| &c[..]).collect();
            match self.writer.insert(header, &chain, check, self.record_flags) {
                Err(WalError::Conflict(redo)) => {
                    debug!("redo pointer moved to {redo}, assembling record again");
                    continue;
                }
                Ok(rec) => {
                    if assembled.num_fpi > 0 {
                        trace!("record at {} carries {} page images", rec.start_lsn, assembled.num_fpi);
                    }
                    return Ok(rec);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn assemble(&self, fpw: FpwSnapshot) -> WalResult<Assembled> {
        let mut headers = BytesMut::new();
        let mut chain: Vec<Bytes> = Vec::new();
        let mut fpw_lsn = Lsn::INVALID;
        let mut num_fpi = 0;
        let mut prev_rnode: Option<RelFileNode> = None;
        let mut total = XLOG_SIZE_OF_XLOG_RECORD;

        for (&block_id, block) in &self.blocks {
            let needs_backup = match &block.page {
                None => false,
                Some(_) if block.flags & pg_constants::REGBUF_FORCE_IMAGE != 0 => true,
                Some(_) if block.flags & pg_constants::REGBUF_NO_IMAGE != 0 => false,
                Some(_) if !fpw.do_page_writes => false,
                Some(page) => {
                    let page_lsn = page_get_lsn(page);
                    let needs = page_lsn <= fpw.redo;
                    if !needs && (!fpw_lsn.is_valid() || page_lsn < fpw_lsn) {
                        fpw_lsn = page_lsn;
                    }
                    needs
                }
            };
            let needs_data = !block.data.is_empty()
                && (!needs_backup || block.flags & pg_constants::REGBUF_KEEP_DATA != 0);

            let mut fork_flags = block.forknum;
            if block.flags & pg_constants::REGBUF_WILL_INIT == pg_constants::REGBUF_WILL_INIT {
                fork_flags |= pg_constants::BKPBLOCK_WILL_INIT;
            }
            let same_rel = prev_rnode == Some(block.rnode);
            if same_rel {
                fork_flags |= pg_constants::BKPBLOCK_SAME_REL;
            }
            if needs_backup {
                fork_flags |= pg_constants::BKPBLOCK_HAS_IMAGE;
            }
            if needs_data {
                fork_flags |= pg_constants::BKPBLOCK_HAS_DATA;
            }

            headers.put_u8(block_id);
            headers.put_u8(fork_flags);
            headers.put_u16_le(if needs_data { block.data.len() as u16 } else { 0 });

            if needs_backup {
                let page = block.page.as_ref().ok_or_else(|| WalError::bad_state("image without page"))?;
                let (hole_offset, hole_length) = if block.flags & pg_constants::REGBUF_STANDARD != 0 {
                    page_hole(page)
                } else {
                    (0, 0)
                };
                let mut bimg_info = pg_constants::BKPIMAGE_APPLY;
                if hole_length > 0 {
                    bimg_info |= pg_constants::BKPIMAGE_HAS_HOLE;
                }
                let bimg_len = BLCKSZ as usize - hole_length;
                headers.put_u16_le(bimg_len as u16);
                headers.put_u16_le(hole_offset as u16);
                headers.put_u8(bimg_info);

                chain_push(&mut chain, &mut total, page.slice(..hole_offset))?;
                chain_push(&mut chain, &mut total, page.slice(hole_offset + hole_length..))?;
                num_fpi += 1;
            }
            if !same_rel {
                headers.put_u32_le(block.rnode.spcnode);
                headers.put_u32_le(block.rnode.dbnode);
                headers.put_u32_le(block.rnode.relnode);
            }
            headers.put_u32_le(block.blkno);
            if needs_data {
                chain_push(&mut chain, &mut total, Bytes::copy_from_slice(&block.data))?;
            }
            prev_rnode = Some(block.rnode);
        }

        if self.record_flags & pg_constants::XLOG_INCLUDE_ORIGIN != 0 && self.origin != 0 {
            headers.put_u8(pg_constants::XLR_BLOCK_ID_ORIGIN);
            headers.put_u16_le(self.origin);
        }
        if let Some(xid) = self.toplevel_xid {
            headers.put_u8(pg_constants::XLR_BLOCK_ID_TOPLEVEL_XID);
            headers.put_u32_le(xid);
        }
        if !self.main_data.is_empty() {
            let len = self.main_data.len();
            if len <= u8::MAX as usize {
                headers.put_u8(pg_constants::XLR_BLOCK_ID_DATA_SHORT);
                headers.put_u8(len as u8);
            } else {
                headers.put_u8(pg_constants::XLR_BLOCK_ID_DATA_LONG);
                headers.put_u32_le(len as u32);
            }
            chain_push(&mut chain, &mut total, Bytes::copy_from_slice(&self.main_data))?;
        }

        total += headers.len();
        if total > pg_constants::MAX_LOG_RECORD_SIZE {
            return Err(WalError::Overflow(total));
        }
        chain.insert(0, headers.freeze());
        Ok(Assembled {
            chain,
            fpw_lsn,
            num_fpi,
        })
    }
}

fn chain_push(chain: &mut Vec<Bytes>, total: &mut usize, chunk: Bytes) -> WalResult<()> {
    *total += chunk.len();
    if *total > pg_constants::MAX_LOG_RECORD_SIZE {
        return Err(WalError::Overflow(*total));
    }
    if !chunk.is_empty() {
        chain.push(chunk);
    }
    Ok(())
}

/// The unused space between `pd_lower` and `pd_upper` of a standard page,
/// as `(offset, length)`.
fn page_hole(page: &[u8]) -> (usize, usize) {
    let lower = u16::from_le_bytes([page[12], page[13]]) as usize;
    let upper = u16::from_le_bytes([page[14], page[15]]) as usize;
    if lower >= pg_constants::SIZE_OF_PAGE_HEADER as usize && upper > lower && upper <= BLCKSZ as usize {
        (lower, upper - lower)
    } else {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::WalIo;
    use crate::segment::SegmentDir;
    use crate::writer::WriterSetup;
    use postgres_ffi::page_set_lsn;
    use postgres_ffi::waldecoder::WalStreamDecoder;
    use postgres_ffi::walrecord::{decode_wal_record, DecodedWALRecord};
    use std::sync::Arc;

    const SEG: usize = 1024 * 1024;

    fn writer(dir: &std::path::Path) -> Arc<XLogWriter> {
        let segs = SegmentDir::new(dir.join("pg_wal"), SEG, true);
        segs.create_dirs().unwrap();
        XLogWriter::open(
            WalIo::new(segs, None),
            WriterSetup {
                tli: 1,
                system_id: 1,
                start: Lsn(SEG as u64),
                prev_record: Lsn(0),
                redo: Lsn(SEG as u64),
                insertion_slots: 2,
                wal_buffers: 16,
                full_page_writes: true,
                archive_mode: false,
                no_sync: true,
                writer_delay: None,
            },
        )
        .unwrap()
    }

    fn read_back(w: &XLogWriter, rec: InsertedRecord) -> DecodedWALRecord {
        w.flush(rec.end_lsn).unwrap();
        let file = w.io().segments().open_read(1, 1).unwrap().unwrap();
        let page_start = rec.start_lsn.page_lsn();
        let len = (rec.end_lsn.page_lsn() + BLCKSZ as u64 - page_start) as usize;
        let bytes = file.pread(page_start.segment_offset(SEG), len).unwrap();

        let mut dec = WalStreamDecoder::new(rec.start_lsn, SEG);
        dec.feed_bytes(&bytes[rec.start_lsn.block_offset() as usize..]);
        let raw = dec.poll_decode().unwrap().unwrap();
        let mut decoded = DecodedWALRecord::default();
        decode_wal_record(raw.buf, &mut decoded).unwrap();
        decoded
    }

    fn standard_page(lsn: Lsn) -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ as usize];
        page_set_lsn(&mut page, lsn);
        page[12..14].copy_from_slice(&100u16.to_le_bytes());
        page[14..16].copy_from_slice(&8000u16.to_le_bytes());
        for b in &mut page[24..100] {
            *b = 0x11;
        }
        for b in &mut page[8000..] {
            *b = 0x22;
        }
        page
    }

    const REL: RelFileNode = RelFileNode {
        spcnode: 1663,
        dbnode: 5,
        relnode: 16384,
    };

    #[test]
    fn old_page_gets_image_without_hole() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let page = standard_page(Lsn(0x100));
        let buf = BufferRef {
            rnode: REL,
            forknum: 0,
            blkno: 7,
            page: &page,
            dirty: true,
        };

        let mut b = RecordBuilder::begin(&w);
        b.set_xid(900);
        b.register_buffer(0, &buf, pg_constants::REGBUF_STANDARD).unwrap();
        b.register_buf_data(0, b"tuple").unwrap();
        b.register_data(b"main");
        let rec = b.insert(pg_constants::RM_HEAP_ID, 0x10).unwrap();

        let d = read_back(&w, rec);
        assert_eq!(d.xl_xid, 900);
        assert_eq!(d.blocks.len(), 1);
        let blk = &d.blocks[0];
        assert!(blk.has_image && blk.apply_image);
        assert_eq!((blk.hole_offset, blk.hole_length), (100, 7900));
        assert!(!blk.has_data, "data is dropped when an image is taken");
        assert_eq!(d.restore_block_image(0).unwrap().unwrap(), page);
        assert_eq!(&d.main_data()[..], b"main");
    }

    #[test]
    fn recent_page_logs_data_only() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let page = standard_page(Lsn(SEG as u64 + 0x2000));
        let other = standard_page(Lsn(0x10));
        let recent = BufferRef {
            rnode: REL,
            forknum: 0,
            blkno: 1,
            page: &page,
            dirty: true,
        };
        let old = BufferRef {
            blkno: 2,
            page: &other,
            ..recent.clone()
        };

        let mut b = RecordBuilder::begin(&w);
        b.register_buffer(0, &recent, pg_constants::REGBUF_STANDARD).unwrap();
        b.register_buf_data(0, b"abc").unwrap();
        b.register_buffer(1, &old, pg_constants::REGBUF_STANDARD | pg_constants::REGBUF_KEEP_DATA)
            .unwrap();
        b.register_buf_data(1, b"kept").unwrap();
        let rec = b.insert(pg_constants::RM_HEAP_ID, 0).unwrap();

        let d = read_back(&w, rec);
        assert!(!d.blocks[0].has_image);
        assert_eq!(&d.block_data(0).unwrap()[..], b"abc");
        assert!(d.blocks[1].has_image);
        assert_eq!(&d.block_data(1).unwrap()[..], b"kept");
        assert_ne!(d.blocks[1].flags & pg_constants::BKPBLOCK_SAME_REL, 0);
        assert_eq!(d.blocks[1].rnode, REL);
        assert_eq!(d.blocks[1].blkno, 2);
    }

    #[test]
    fn no_images_without_page_writes() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.set_full_page_writes(false);
        let page = standard_page(Lsn(0x100));
        let mut b = RecordBuilder::begin(&w);
        b.register_block(3, REL, 0, 9, Some(&page), pg_constants::REGBUF_WILL_INIT).unwrap();
        b.register_buf_data(3, b"x").unwrap();
        let rec = b.insert(pg_constants::RM_HEAP_ID, 0).unwrap();
        let d = read_back(&w, rec);
        assert!(!d.blocks[0].has_image);
        assert!(d.blocks[0].will_init);
        assert_eq!(d.blocks[0].block_id, 3);
    }

    #[test]
    fn origin_and_toplevel_xid() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let mut b = RecordBuilder::begin(&w);
        b.set_origin(4)
            .set_toplevel_xid(777)
            .set_record_flags(pg_constants::XLOG_INCLUDE_ORIGIN)
            .register_data(&[1u8; 300]);
        let rec = b.insert(pg_constants::RM_LOGICALMSG_ID, 0).unwrap();
        let d = read_back(&w, rec);
        assert_eq!(d.origin_id, 4);
        assert_eq!(d.toplevel_xid, Some(777));
        assert_eq!(d.main_data().len(), 300);
    }

    #[test]
    fn misuse_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        assert!(matches!(
            RecordBuilder::begin(&w).insert(pg_constants::RM_HEAP_ID, 0),
            Err(WalError::BadState(_))
        ));
        // a switch record carries nothing
        assert!(RecordBuilder::begin(&w)
            .insert(pg_constants::RM_XLOG_ID, pg_constants::XLOG_SWITCH)
            .is_ok());

        let page = standard_page(Lsn(0x100));
        let clean = BufferRef {
            rnode: REL,
            forknum: 0,
            blkno: 1,
            page: &page,
            dirty: false,
        };
        let mut b = RecordBuilder::begin(&w);
        assert!(b.register_buffer(0, &clean, 0).is_err());
        assert!(b.register_buffer(0, &clean, pg_constants::REGBUF_NO_CHANGE).is_ok());
        assert!(b.register_buffer(0, &clean, pg_constants::REGBUF_NO_CHANGE).is_err());
        assert!(b.register_buf_data(5, b"x").is_err());
        assert!(matches!(
            b.register_buf_data(0, &vec![0u8; 70000]),
            Err(WalError::Overflow(70000))
        ));
        b.register_data(b"x");
        assert!(matches!(b.insert(pg_constants::RM_HEAP_ID, 0x03), Ok(_)));
        let mut bad_info = RecordBuilder::begin(&w);
        bad_info.register_data(b"x");
        assert!(matches!(
            bad_info.insert(pg_constants::RM_HEAP_ID, 0x04),
            Err(WalError::BadState(_))
        ));
    }
}
