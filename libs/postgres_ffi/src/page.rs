//!
//! Owned WAL page buffers.
//!
//! A [`PageBuf`] is one `XLOG_BLCKSZ` page together with the segment
//! geometry needed to tell whether it starts with a short or a long header.
//! Code that fills or inspects pages goes through the typed header and
//! payload views instead of computing offsets into a byte slice.
//!
use crate::pg_constants;
use crate::xlog_utils::{
    page_header_size, validate_page_header, PageHeaderError, XLOG_SIZE_OF_XLOG_LONG_PHD,
};
use crate::{TimeLineID, XLogLongPageHeaderData, XLogPageHeaderData, XLOG_BLCKSZ};
use utils::bin_ser::{DeserializeError, LeSer, SerializeError};
use utils::lsn::Lsn;

#[derive(Clone, PartialEq, Eq)]
pub struct PageBuf {
    page_lsn: Lsn,
    seg_size: usize,
    data: Box<[u8; XLOG_BLCKSZ]>,
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuf")
            .field("page_lsn", &self.page_lsn)
            .field("header", &self.header().ok())
            .finish()
    }
}

impl PageBuf {
    /// A zero-filled page starting at `page_lsn`, which must be page aligned.
    pub fn new_zeroed(page_lsn: Lsn, seg_size: usize) -> PageBuf {
        debug_assert_eq!(page_lsn.block_offset(), 0);
        PageBuf {
            page_lsn,
            seg_size,
            data: Box::new([0u8; XLOG_BLCKSZ]),
        }
    }

    /// Wrap bytes read from disk. `None` if `bytes` is not exactly one page.
    pub fn from_bytes(page_lsn: Lsn, seg_size: usize, bytes: &[u8]) -> Option<PageBuf> {
        let data: [u8; XLOG_BLCKSZ] = bytes.try_into().ok()?;
        Some(PageBuf {
            page_lsn,
            seg_size,
            data: Box::new(data),
        })
    }

    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn
    }

    /// First page of a segment; it carries the long header.
    pub fn is_segment_start(&self) -> bool {
        self.page_lsn.segment_offset(self.seg_size) == 0
    }

    pub fn header_size(&self) -> usize {
        page_header_size(self.page_lsn, self.seg_size)
    }

    /// Nothing was ever written to this page.
    pub fn is_unused(&self) -> bool {
        self.data[..self.header_size()].iter().all(|b| *b == 0)
    }

    pub fn header(&self) -> Result<XLogPageHeaderData, DeserializeError> {
        XLogPageHeaderData::des_prefix(&self.data[..])
    }

    pub fn long_header(&self) -> Option<XLogLongPageHeaderData> {
        if !self.is_segment_start() {
            return None;
        }
        XLogLongPageHeaderData::des_prefix(&self.data[..XLOG_SIZE_OF_XLOG_LONG_PHD]).ok()
    }

    pub fn validate(&self, expected_tli: Option<TimeLineID>) -> Result<XLogPageHeaderData, PageHeaderError> {
        validate_page_header(&self.data[..], self.page_lsn, expected_tli, self.seg_size)
    }

    /// Write a fresh header. `rem_len` is the length of the record continued
    /// from the previous page, or 0.
    pub fn init_header(
        &mut self,
        tli: TimeLineID,
        system_id: u64,
        rem_len: u32,
    ) -> Result<(), SerializeError> {
        let mut info = 0;
        if rem_len > 0 {
            info |= pg_constants::XLP_FIRST_IS_CONTRECORD;
        }
        let std = XLogPageHeaderData {
            xlp_magic: pg_constants::XLOG_PAGE_MAGIC,
            xlp_info: info,
            xlp_tli: tli,
            xlp_pageaddr: self.page_lsn.0,
            xlp_rem_len: rem_len,
            ..Default::default()
        };
        if self.is_segment_start() {
            let long = XLogLongPageHeaderData {
                std: XLogPageHeaderData {
                    xlp_info: info | pg_constants::XLP_LONG_HEADER,
                    ..std
                },
                xlp_sysid: system_id,
                xlp_seg_size: self.seg_size as u32,
                xlp_xlog_blcksz: XLOG_BLCKSZ as u32,
            };
            long.ser_into_slice(&mut self.data[..XLOG_SIZE_OF_XLOG_LONG_PHD])
        } else {
            let header_size = self.header_size();
            std.ser_into_slice(&mut self.data[..header_size])
        }
    }

    /// Record area after the header.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_size()..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let hdr = self.header_size();
        &mut self.data[hdr..]
    }

    /// Copy `src` to the byte at `lsn`, which must lie in the payload.
    /// Returns how many bytes fit on this page.
    pub fn put_at(&mut self, lsn: Lsn, src: &[u8]) -> usize {
        let off = lsn.block_offset() as usize;
        debug_assert!(lsn.page_lsn() == self.page_lsn && off >= self.header_size());
        let n = src.len().min(XLOG_BLCKSZ - off);
        self.data[off..off + n].copy_from_slice(&src[..n]);
        n
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Reuse the buffer for another page.
    pub fn reset(&mut self, page_lsn: Lsn) {
        self.page_lsn = page_lsn;
        self.data.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xlog_utils::{validate_long_header, XLOG_SIZE_OF_XLOG_SHORT_PHD};

    const SEG: usize = pg_constants::MIN_WAL_SEG_SIZE;

    #[test]
    fn long_header_on_segment_start() {
        let mut page = PageBuf::new_zeroed(Lsn(SEG as u64), SEG);
        assert!(page.is_unused());
        page.init_header(1, 42, 0).unwrap();
        assert_eq!(page.header_size(), XLOG_SIZE_OF_XLOG_LONG_PHD);
        assert_eq!(page.payload().len(), XLOG_BLCKSZ - XLOG_SIZE_OF_XLOG_LONG_PHD);
        page.validate(Some(1)).unwrap();
        let long = page.long_header().unwrap();
        assert_eq!(long.xlp_sysid, 42);
        validate_long_header(page.as_bytes(), Some(42), SEG).unwrap();
    }

    #[test]
    fn continuation_header() {
        let lsn = Lsn(SEG as u64 + XLOG_BLCKSZ as u64);
        let mut page = PageBuf::new_zeroed(lsn, SEG);
        page.init_header(2, 42, 100).unwrap();
        let hdr = page.validate(Some(2)).unwrap();
        assert_eq!(hdr.xlp_info, pg_constants::XLP_FIRST_IS_CONTRECORD);
        assert_eq!(hdr.xlp_rem_len, 100);
        assert!(page.long_header().is_none());
        assert!(matches!(
            page.validate(Some(3)),
            Err(PageHeaderError::WrongTimeline { .. })
        ));

        let n = page.put_at(lsn + (XLOG_BLCKSZ - 4) as u64, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(n, 4);
        assert_eq!(&page.as_bytes()[XLOG_BLCKSZ - 4..], &[1, 2, 3, 4]);
        assert_eq!(page.payload().len(), XLOG_BLCKSZ - XLOG_SIZE_OF_XLOG_SHORT_PHD);
    }
}
