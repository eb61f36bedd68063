//! This module houses types used in decoding of PG WAL records: the
//! generic block-reference layout shared by every resource manager, and
//! the main-data payloads of the record types this crate knows how to
//! describe.

use crate::pg_constants;
use crate::xlog_utils::XLOG_SIZE_OF_XLOG_RECORD;
use crate::{
    BlockNumber, CheckPoint, Oid, RelFileNode, RepOriginId, TimestampTz, TransactionId,
    XLogRecord, BLCKSZ,
};
use bytes::{Buf, Bytes};
use thiserror::Error;
use utils::bin_ser::DeserializeError;
use utils::lsn::Lsn;

#[derive(Debug, Error)]
pub enum WalRecordError {
    #[error("record is truncated: needed {needed} more bytes while decoding {what}")]
    Truncated { what: &'static str, needed: usize },
    #[error("out-of-order block_id {0}")]
    OutOfOrderBlock(u8),
    #[error("invalid block_id {0}")]
    InvalidBlockId(u8),
    #[error("BKPBLOCK_HAS_DATA set, but no data included (block {0})")]
    MissingBlockData(u8),
    #[error("BKPBLOCK_HAS_DATA not set, but data length is {len} (block {block_id})")]
    UnexpectedBlockData { block_id: u8, len: u16 },
    #[error("inconsistent page image for block {block_id}: hole offset {hole_offset} length {hole_length} image length {bimg_len}")]
    InconsistentImage {
        block_id: u8,
        hole_offset: u16,
        hole_length: u16,
        bimg_len: u16,
    },
    #[error("BKPBLOCK_SAME_REL set but no previous rel (block {0})")]
    SameRelWithoutRel(u8),
    #[error("record length {declared} does not match its contents ({actual})")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("compressed page images are not supported")]
    CompressedImage,
    #[error(transparent)]
    Header(#[from] DeserializeError),
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), WalRecordError> {
    if buf.remaining() < n {
        Err(WalRecordError::Truncated {
            what,
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// DecodedBkpBlock represents per-page data contained in a WAL record.
#[derive(Debug, Default, Clone)]
pub struct DecodedBkpBlock {
    pub block_id: u8,

    /* Identify the block this refers to */
    pub rnode: RelFileNode,
    pub forknum: u8,
    pub blkno: BlockNumber,

    /* copy of the fork_flags field from the XLogRecordBlockHeader */
    pub flags: u8,

    /* Information on full-page image, if any */
    pub has_image: bool,
    /* has image that should be restored */
    pub apply_image: bool,
    /* record doesn't need previous page version to apply */
    pub will_init: bool,
    pub hole_offset: u16,
    pub hole_length: u16,
    /* offsets are relative to the start of the whole record */
    pub bimg_offset: u32,
    pub bimg_len: u16,
    pub bimg_info: u8,

    /* rmgr-specific data associated with this block */
    pub has_data: bool,
    pub data_offset: u32,
    pub data_len: u16,
}

impl DecodedBkpBlock {
    pub fn is_compressed(&self) -> bool {
        self.bimg_info & pg_constants::BKPIMAGE_IS_COMPRESSED != 0
    }
}

#[derive(Debug, Default)]
pub struct DecodedWALRecord {
    pub xl_xid: TransactionId,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub xl_prev: Lsn,
    pub record: Bytes, // raw XLogRecord

    pub blocks: Vec<DecodedBkpBlock>,
    pub main_data_offset: usize,
    pub origin_id: RepOriginId,
    pub toplevel_xid: Option<TransactionId>,
}

impl DecodedWALRecord {
    /// The info bits owned by the record's resource manager.
    pub fn rmgr_info(&self) -> u8 {
        self.xl_info & pg_constants::XLR_RMGR_INFO_MASK
    }

    pub fn main_data(&self) -> Bytes {
        self.record.slice(self.main_data_offset..)
    }

    pub fn block_data(&self, block_id: u8) -> Option<Bytes> {
        let blk = self.blocks.iter().find(|b| b.block_id == block_id)?;
        if !blk.has_data {
            return None;
        }
        let start = blk.data_offset as usize;
        Some(self.record.slice(start..start + blk.data_len as usize))
    }

    /// Rebuild the full page from a block's image, filling the hole with zeros.
    pub fn restore_block_image(&self, block_id: u8) -> Result<Option<Vec<u8>>, WalRecordError> {
        let blk = match self.blocks.iter().find(|b| b.block_id == block_id) {
            Some(blk) if blk.has_image => blk,
            _ => return Ok(None),
        };
        if blk.is_compressed() {
            return Err(WalRecordError::CompressedImage);
        }
        let start = blk.bimg_offset as usize;
        let image = &self.record[start..start + blk.bimg_len as usize];
        let hole_offset = blk.hole_offset as usize;
        let mut page = Vec::with_capacity(BLCKSZ as usize);
        page.extend_from_slice(&image[..hole_offset]);
        page.resize(hole_offset + blk.hole_length as usize, 0);
        page.extend_from_slice(&image[hole_offset..]);
        Ok(Some(page))
    }
}

/// Main routine to decode a WAL record and figure out which blocks are modified
//
// See xlogrecord.h for details
// The overall layout of an XLOG record is:
//		Fixed-size header (XLogRecord struct)
//      XLogRecordBlockHeader struct
//          If BKPBLOCK_HAS_IMAGE, an XLogRecordBlockImageHeader struct follows
//	           If BKPIMAGE_HAS_HOLE and BKPIMAGE_IS_COMPRESSED, an
//	           XLogRecordBlockCompressHeader struct follows.
//          If BKPBLOCK_SAME_REL is not set, a RelFileNode follows
//          BlockNumber follows
//      XLogRecordBlockHeader struct
//      ...
//      XLogRecordDataHeader[Short|Long] struct
//      block data
//      block data
//      ...
//      main data
//
// The caller provides the DecodedWALRecord so that it can be reused across records.
//
pub fn decode_wal_record(
    record: Bytes,
    decoded: &mut DecodedWALRecord,
) -> Result<(), WalRecordError> {
    let mut rnode: Option<RelFileNode> = None;
    let mut origin_id: RepOriginId = 0;
    let mut toplevel_xid = None;

    let mut buf = record.clone();
    need(&buf, XLOG_SIZE_OF_XLOG_RECORD, "record header")?;
    let xlogrec = XLogRecord::from_bytes(&mut buf)?;

    tracing::trace!(
        "decode_wal_record xl_rmid = {} xl_info = {}",
        xlogrec.xl_rmid,
        xlogrec.xl_info
    );

    if xlogrec.xl_tot_len as usize != record.len() {
        return Err(WalRecordError::LengthMismatch {
            declared: xlogrec.xl_tot_len as usize,
            actual: record.len(),
        });
    }

    let mut next_block_id: u16 = 0;
    let mut main_data_len: u32 = 0;
    let mut datatotal: usize = 0;
    decoded.blocks.clear();

    // 1. Decode the headers.
    // XLogRecordBlockHeaders if any,
    // XLogRecordDataHeader[Short|Long]
    while buf.remaining() > datatotal {
        let block_id = buf.get_u8();

        match block_id {
            pg_constants::XLR_BLOCK_ID_DATA_SHORT => {
                need(&buf, 1, "short data header")?;
                main_data_len = buf.get_u8() as u32;
                datatotal += main_data_len as usize;
                // by convention, the main data fragment is always last
                break;
            }

            pg_constants::XLR_BLOCK_ID_DATA_LONG => {
                need(&buf, 4, "long data header")?;
                main_data_len = buf.get_u32_le();
                datatotal += main_data_len as usize;
                break;
            }

            pg_constants::XLR_BLOCK_ID_ORIGIN => {
                need(&buf, 2, "origin")?;
                origin_id = buf.get_u16_le();
            }

            pg_constants::XLR_BLOCK_ID_TOPLEVEL_XID => {
                need(&buf, 4, "toplevel xid")?;
                toplevel_xid = Some(buf.get_u32_le());
            }

            0..=pg_constants::XLR_MAX_BLOCK_ID => {
                if (block_id as u16) < next_block_id {
                    return Err(WalRecordError::OutOfOrderBlock(block_id));
                }
                next_block_id = block_id as u16 + 1;

                need(&buf, pg_constants::SIZE_OF_XLOG_RECORD_BLOCK_HEADER - 1, "block header")?;
                let fork_flags = buf.get_u8();
                let mut blk = DecodedBkpBlock {
                    block_id,
                    forknum: fork_flags & pg_constants::BKPBLOCK_FORK_MASK,
                    flags: fork_flags,
                    has_image: fork_flags & pg_constants::BKPBLOCK_HAS_IMAGE != 0,
                    has_data: fork_flags & pg_constants::BKPBLOCK_HAS_DATA != 0,
                    will_init: fork_flags & pg_constants::BKPBLOCK_WILL_INIT != 0,
                    data_len: buf.get_u16_le(),
                    ..Default::default()
                };

                // cross-check that the HAS_DATA flag is set iff data_length > 0
                if blk.has_data && blk.data_len == 0 {
                    return Err(WalRecordError::MissingBlockData(block_id));
                }
                if !blk.has_data && blk.data_len != 0 {
                    return Err(WalRecordError::UnexpectedBlockData {
                        block_id,
                        len: blk.data_len,
                    });
                }
                datatotal += blk.data_len as usize;

                if blk.has_image {
                    need(&buf, pg_constants::SIZE_OF_XLOG_RECORD_BLOCK_IMAGE_HEADER, "image header")?;
                    blk.bimg_len = buf.get_u16_le();
                    blk.hole_offset = buf.get_u16_le();
                    blk.bimg_info = buf.get_u8();
                    blk.apply_image = blk.bimg_info & pg_constants::BKPIMAGE_APPLY != 0;

                    let has_hole = blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE != 0;
                    if blk.is_compressed() {
                        if has_hole {
                            need(&buf, 2, "compressed image header")?;
                            blk.hole_length = buf.get_u16_le();
                        }
                    } else {
                        blk.hole_length = BLCKSZ.saturating_sub(blk.bimg_len);
                    }
                    datatotal += blk.bimg_len as usize;

                    let inconsistent = if has_hole {
                        blk.hole_offset == 0 || blk.hole_length == 0 || blk.bimg_len >= BLCKSZ
                    } else {
                        blk.hole_offset != 0
                            || blk.hole_length != 0
                            || (!blk.is_compressed() && blk.bimg_len != BLCKSZ)
                    };
                    if inconsistent
                        || blk.hole_offset as u32 + blk.hole_length as u32 > BLCKSZ as u32
                    {
                        return Err(WalRecordError::InconsistentImage {
                            block_id,
                            hole_offset: blk.hole_offset,
                            hole_length: blk.hole_length,
                            bimg_len: blk.bimg_len,
                        });
                    }
                }

                if fork_flags & pg_constants::BKPBLOCK_SAME_REL == 0 {
                    need(&buf, pg_constants::SIZE_OF_REL_FILE_NODE, "relfilenode")?;
                    rnode = Some(RelFileNode {
                        spcnode: buf.get_u32_le(),
                        dbnode: buf.get_u32_le(),
                        relnode: buf.get_u32_le(),
                    });
                }
                blk.rnode = rnode.ok_or(WalRecordError::SameRelWithoutRel(block_id))?;

                need(&buf, 4, "block number")?;
                blk.blkno = buf.get_u32_le();
                tracing::trace!(
                    "this record affects {}/{}/{} blk {}",
                    blk.rnode.spcnode,
                    blk.rnode.dbnode,
                    blk.rnode.relnode,
                    blk.blkno
                );

                decoded.blocks.push(blk);
            }

            _ => return Err(WalRecordError::InvalidBlockId(block_id)),
        }
    }

    if buf.remaining() != datatotal {
        return Err(WalRecordError::LengthMismatch {
            declared: datatotal,
            actual: buf.remaining(),
        });
    }

    // 2. Locate block images and data; they follow the headers in block order.
    let mut ptr = record.len() - buf.remaining();
    for blk in decoded.blocks.iter_mut() {
        if blk.has_image {
            blk.bimg_offset = ptr as u32;
            ptr += blk.bimg_len as usize;
        }
        if blk.has_data {
            blk.data_offset = ptr as u32;
            ptr += blk.data_len as usize;
        }
    }

    decoded.xl_xid = xlogrec.xl_xid;
    decoded.xl_info = xlogrec.xl_info;
    decoded.xl_rmid = xlogrec.xl_rmid;
    decoded.xl_prev = Lsn(xlogrec.xl_prev);
    decoded.main_data_offset = record.len() - main_data_len as usize;
    decoded.record = record;
    decoded.origin_id = origin_id;
    decoded.toplevel_xid = toplevel_xid;

    Ok(())
}

/// Decode the checkpoint carried by an XLOG_CHECKPOINT_* record.
pub fn decode_checkpoint(decoded: &DecodedWALRecord) -> Option<CheckPoint> {
    if decoded.xl_rmid != pg_constants::RM_XLOG_ID {
        return None;
    }
    match decoded.rmgr_info() {
        pg_constants::XLOG_CHECKPOINT_SHUTDOWN | pg_constants::XLOG_CHECKPOINT_ONLINE => {
            CheckPoint::decode(&decoded.main_data()).ok()
        }
        _ => None,
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct XlSmgrCreate {
    pub rnode: RelFileNode,
    pub forknum: u8,
}

impl XlSmgrCreate {
    pub fn decode(buf: &mut Bytes) -> Result<XlSmgrCreate, WalRecordError> {
        need(buf, 16, "smgr create")?;
        Ok(XlSmgrCreate {
            rnode: RelFileNode {
                spcnode: buf.get_u32_le(), /* tablespace */
                dbnode: buf.get_u32_le(),  /* database */
                relnode: buf.get_u32_le(), /* relation */
            },
            forknum: buf.get_u32_le() as u8,
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct XlSmgrTruncate {
    pub blkno: BlockNumber,
    pub rnode: RelFileNode,
    pub flags: u32,
}

impl XlSmgrTruncate {
    pub fn decode(buf: &mut Bytes) -> Result<XlSmgrTruncate, WalRecordError> {
        need(buf, 20, "smgr truncate")?;
        Ok(XlSmgrTruncate {
            blkno: buf.get_u32_le(),
            rnode: RelFileNode {
                spcnode: buf.get_u32_le(),
                dbnode: buf.get_u32_le(),
                relnode: buf.get_u32_le(),
            },
            flags: buf.get_u32_le(),
        })
    }
}

/// The part shared by commit and abort records: xl_xact_commit / xl_xact_abort.
#[derive(Debug)]
pub struct XlXactFinish {
    pub xact_time: TimestampTz,
}

impl XlXactFinish {
    pub fn decode(buf: &mut Bytes) -> Result<XlXactFinish, WalRecordError> {
        need(buf, 8, "xact commit/abort")?;
        Ok(XlXactFinish {
            xact_time: buf.get_i64_le(),
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct XlReploriginSet {
    pub remote_lsn: Lsn,
    pub node_id: RepOriginId,
}

impl XlReploriginSet {
    pub fn decode(buf: &mut Bytes) -> Result<XlReploriginSet, WalRecordError> {
        need(buf, 10, "replorigin set")?;
        Ok(XlReploriginSet {
            remote_lsn: Lsn(buf.get_u64_le()),
            node_id: buf.get_u16_le(),
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct XlReploriginDrop {
    pub node_id: RepOriginId,
}

impl XlReploriginDrop {
    pub fn decode(buf: &mut Bytes) -> Result<XlReploriginDrop, WalRecordError> {
        need(buf, 2, "replorigin drop")?;
        Ok(XlReploriginDrop {
            node_id: buf.get_u16_le(),
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct XlLogicalMessage {
    pub db_id: Oid,
    pub transactional: bool,
    pub prefix_size: usize,
    pub message_size: usize,
}

impl XlLogicalMessage {
    pub fn decode(buf: &mut Bytes) -> Result<XlLogicalMessage, WalRecordError> {
        need(buf, 24, "logical message")?;
        Ok(XlLogicalMessage {
            db_id: buf.get_u32_le(),
            transactional: buf.get_u32_le() != 0, // 4-bytes alignment
            prefix_size: buf.get_u64_le() as usize,
            message_size: buf.get_u64_le() as usize,
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct XlRunningXacts {
    pub xcnt: u32,
    pub subxcnt: u32,
    pub subxid_overflow: bool,
    pub next_xid: TransactionId,
    pub oldest_running_xid: TransactionId,
    pub latest_completed_xid: TransactionId,
    pub xids: Vec<TransactionId>,
}

impl XlRunningXacts {
    pub fn decode(buf: &mut Bytes) -> Result<XlRunningXacts, WalRecordError> {
        need(buf, 24, "running xacts")?;
        let xcnt = buf.get_u32_le();
        let subxcnt = buf.get_u32_le();
        let subxid_overflow = buf.get_u32_le() != 0;
        let next_xid = buf.get_u32_le();
        let oldest_running_xid = buf.get_u32_le();
        let latest_completed_xid = buf.get_u32_le();
        let n = (xcnt as usize).saturating_add(subxcnt as usize);
        need(buf, n.saturating_mul(4), "running xacts xids")?;
        let xids = (0..n).map(|_| buf.get_u32_le()).collect();
        Ok(XlRunningXacts {
            xcnt,
            subxcnt,
            subxid_overflow,
            next_xid,
            oldest_running_xid,
            latest_completed_xid,
            xids,
        })
    }
}
