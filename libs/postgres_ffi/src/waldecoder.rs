//!
//! Basic WAL stream decoding.
//!
//! This understands the WAL page and record format, enough to figure out where the WAL record
//! boundaries are, and to reassemble WAL records that cross page boundaries.
//!
//! The XLOG reader and the walreceiver both feed raw WAL bytes into a [`WalStreamDecoder`];
//! looking inside the records (block references, main data) is done by
//! [`crate::walrecord`].
//!
use super::pg_constants;
use super::xlog_utils::*;
use super::TimeLineID;
use super::XLogPageHeaderData;
use super::XLogRecord;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::*;
use std::cmp::min;
use std::num::NonZeroU32;
use thiserror::Error;
use utils::lsn::Lsn;

pub struct WalStreamDecoder {
    lsn: Lsn,
    seg_size: usize,
    expected_tli: Option<TimeLineID>,
    system_id: Option<u64>,

    /// Start of the previously returned record, checked against `xl_prev`.
    prev_record: Option<Lsn>,
    /// Set until the first page header has been seen; a stream may start in
    /// the middle of a record that began on an earlier page.
    at_stream_start: bool,

    inputbuf: BytesMut,
    state: State,
}

enum State {
    WaitingForRecord,
    ReassemblingRecord {
        start_lsn: Lsn,
        recordbuf: BytesMut,
        contlen: NonZeroU32,
    },
    SkippingEverything {
        skip_until_lsn: Lsn,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalDecodeErrorKind {
    /// Zeroed or never-written space: the valid WAL ends at `lsn`.
    EndOfWal,
    /// Bytes are present but do not form a valid record or page.
    Corruption,
}

#[derive(Error, Debug, Clone)]
#[error("{msg} at {lsn}")]
pub struct WalDecodeError {
    pub kind: WalDecodeErrorKind,
    pub msg: String,
    pub lsn: Lsn,
}

impl WalDecodeError {
    fn end_of_wal(lsn: Lsn) -> Self {
        WalDecodeError {
            kind: WalDecodeErrorKind::EndOfWal,
            msg: "end of WAL".into(),
            lsn,
        }
    }

    fn corruption(msg: impl Into<String>, lsn: Lsn) -> Self {
        WalDecodeError {
            kind: WalDecodeErrorKind::Corruption,
            msg: msg.into(),
            lsn,
        }
    }

    pub fn is_end_of_wal(&self) -> bool {
        self.kind == WalDecodeErrorKind::EndOfWal
    }
}

/// A complete, CRC-checked record as it appeared in the stream.
#[derive(Debug, Clone)]
pub struct WalRecordBytes {
    /// Position of the record header.
    pub start_lsn: Lsn,
    /// Where the following record may start: the 8-byte aligned end, or the
    /// next segment boundary after a switch record.
    pub end_lsn: Lsn,
    pub buf: Bytes,
}

impl WalStreamDecoder {
    pub fn new(lsn: Lsn, seg_size: usize) -> WalStreamDecoder {
        WalStreamDecoder {
            lsn,
            seg_size,
            expected_tli: None,
            system_id: None,
            prev_record: None,
            at_stream_start: true,
            inputbuf: BytesMut::new(),
            state: State::WaitingForRecord,
        }
    }

    /// Require every page header to carry this timeline.
    pub fn set_expected_timeline(&mut self, tli: Option<TimeLineID>) {
        self.expected_tli = tli;
    }

    /// Require every long page header to carry this system identifier.
    pub fn set_system_id(&mut self, system_id: Option<u64>) {
        self.system_id = system_id;
    }

    /// Start of the record preceding the first one this decoder returns.
    pub fn set_prev_record(&mut self, prev: Option<Lsn>) {
        self.prev_record = prev;
    }

    // The latest LSN position fed to the decoder.
    pub fn available(&self) -> Lsn {
        self.lsn + self.inputbuf.remaining() as u64
    }

    pub fn feed_bytes(&mut self, buf: &[u8]) {
        self.inputbuf.extend_from_slice(buf);
    }

    /// Attempt to decode another WAL record from the input that has been fed to the
    /// decoder so far.
    ///
    /// Returns one of the following:
    ///     Ok(Some(record)): the next record together with its start and end positions
    ///     Ok(None): there is not enough data in the input buffer. Feed more by calling the `feed_bytes` function
    ///     Err(WalDecodeError): the WAL ends here, or the input was invalid; see `kind`.
    ///
    /// Errors about a record are reported at the record's start, so a caller can
    /// treat that position as the end of valid WAL.
    pub fn poll_decode(&mut self) -> Result<Option<WalRecordBytes>, WalDecodeError> {
        loop {
            // Page headers are parsed and verified as we go, except while skipping
            // padding, which may cover whole pages after a switch record.
            if !matches!(self.state, State::SkippingEverything { .. })
                && self.lsn.block_offset() == 0
            {
                let hdr_size = page_header_size(self.lsn, self.seg_size);
                if self.inputbuf.remaining() < hdr_size {
                    return Ok(None);
                }
                self.consume_page_header(hdr_size)?;
                continue;
            }

            match &mut self.state {
                State::WaitingForRecord => {
                    // A record header never straddles a page boundary.
                    let pageleft = self.lsn.remaining_in_block() as usize;
                    if pageleft < XLOG_SIZE_OF_XLOG_RECORD {
                        self.state = State::SkippingEverything {
                            skip_until_lsn: self.lsn + pageleft as u64,
                        };
                        continue;
                    }

                    // need to have at least the xl_tot_len field
                    if self.inputbuf.remaining() < 4 {
                        return Ok(None);
                    }

                    // peek xl_tot_len at the beginning of the record.
                    let xl_tot_len = (&self.inputbuf[0..4]).get_u32_le();
                    if xl_tot_len == 0 {
                        return Err(WalDecodeError::end_of_wal(self.lsn));
                    }
                    if (xl_tot_len as usize) < XLOG_SIZE_OF_XLOG_RECORD
                        || xl_tot_len as usize > pg_constants::MAX_LOG_RECORD_SIZE
                    {
                        return Err(WalDecodeError::corruption(
                            format!("invalid record length {}", xl_tot_len),
                            self.lsn,
                        ));
                    }

                    // Fast path for the common case that the whole record fits on the page.
                    let start_lsn = self.lsn;
                    if self.inputbuf.remaining() >= xl_tot_len as usize
                        && xl_tot_len as usize <= pageleft
                    {
                        self.lsn += xl_tot_len as u64;
                        let recordbuf = self.inputbuf.copy_to_bytes(xl_tot_len as usize);
                        return self.complete_record(start_lsn, recordbuf).map(Some);
                    }
                    // Need to assemble the record from pieces; the next iterations copy
                    // the part on this page and the continuations after each page header.
                    match NonZeroU32::new(xl_tot_len) {
                        Some(contlen) => {
                            self.state = State::ReassemblingRecord {
                                start_lsn,
                                recordbuf: BytesMut::with_capacity(xl_tot_len as usize),
                                contlen,
                            }
                        }
                        None => return Err(WalDecodeError::end_of_wal(start_lsn)),
                    }
                }
                State::ReassemblingRecord {
                    start_lsn,
                    recordbuf,
                    contlen,
                } => {
                    // read the rest of the record, or as much as fits on this page.
                    let pageleft = self.lsn.remaining_in_block() as u32;
                    let n = min(contlen.get(), pageleft) as usize;

                    if self.inputbuf.remaining() < n {
                        return Ok(None);
                    }

                    recordbuf.put(self.inputbuf.split_to(n));
                    self.lsn += n as u64;
                    *contlen = match NonZeroU32::new(contlen.get() - n as u32) {
                        Some(x) => x,
                        None => {
                            let start_lsn = *start_lsn;
                            let recordbuf = std::mem::take(recordbuf).freeze();
                            return self.complete_record(start_lsn, recordbuf).map(Some);
                        }
                    }
                }
                State::SkippingEverything { skip_until_lsn } => {
                    let n = skip_until_lsn.0.saturating_sub(self.lsn.0) as usize;
                    if self.inputbuf.remaining() < n {
                        return Ok(None);
                    }
                    self.inputbuf.advance(n);
                    self.lsn += n as u64;
                    self.state = State::WaitingForRecord;
                }
            }
        }
    }

    fn consume_page_header(&mut self, hdr_size: usize) -> Result<(), WalDecodeError> {
        let page_lsn = self.lsn;
        let raw = &self.inputbuf[..hdr_size];

        // A page that was never written ends the WAL, also in the middle of a record.
        if raw.iter().all(|b| *b == 0) {
            return Err(WalDecodeError::end_of_wal(self.record_start_or(page_lsn)));
        }

        let hdr = validate_page_header(raw, page_lsn, self.expected_tli, self.seg_size)
            .map_err(|e| self.header_error(e.to_string()))?;
        if hdr_size == XLOG_SIZE_OF_XLOG_LONG_PHD {
            validate_long_header(raw, self.system_id, self.seg_size)
                .map_err(|e| self.header_error(e.to_string()))?;
        }
        self.check_continuation(&hdr)?;

        self.inputbuf.advance(hdr_size);
        self.lsn += hdr_size as u64;
        self.at_stream_start = false;
        Ok(())
    }

    fn check_continuation(&mut self, hdr: &XLogPageHeaderData) -> Result<(), WalDecodeError> {
        let is_cont = hdr.xlp_info & pg_constants::XLP_FIRST_IS_CONTRECORD != 0;
        match &self.state {
            State::WaitingForRecord => {
                if is_cont && self.at_stream_start {
                    // Skip the tail of a record that began before the stream did.
                    let data_start = self.lsn + page_header_size(self.lsn, self.seg_size) as u64;
                    let tail_end =
                        advance_over_page_headers(data_start, hdr.xlp_rem_len as usize, self.seg_size);
                    debug!(
                        "skipping {} bytes of continuation data at {}",
                        hdr.xlp_rem_len, data_start
                    );
                    self.state = State::SkippingEverything {
                        skip_until_lsn: tail_end.align(),
                    };
                } else if is_cont || hdr.xlp_rem_len != 0 {
                    return Err(self.header_error(format!(
                        "unexpected continuation data (xlp_rem_len={})",
                        hdr.xlp_rem_len
                    )));
                }
            }
            State::ReassemblingRecord { contlen, .. } => {
                if !is_cont {
                    return Err(self.header_error(
                        "XLP_FIRST_IS_CONTRECORD expected, not found".to_string(),
                    ));
                }
                if hdr.xlp_rem_len != contlen.get() {
                    return Err(self.header_error(format!(
                        "xlp_rem_len={}, expected {}",
                        hdr.xlp_rem_len,
                        contlen.get()
                    )));
                }
            }
            State::SkippingEverything { .. } => {}
        }
        Ok(())
    }

    fn record_start_or(&self, lsn: Lsn) -> Lsn {
        match &self.state {
            State::ReassemblingRecord { start_lsn, .. } => *start_lsn,
            _ => lsn,
        }
    }

    fn header_error(&self, msg: String) -> WalDecodeError {
        WalDecodeError::corruption(
            format!("invalid WAL page header: {}", msg),
            self.record_start_or(self.lsn),
        )
    }

    fn complete_record(
        &mut self,
        start_lsn: Lsn,
        recordbuf: Bytes,
    ) -> Result<WalRecordBytes, WalDecodeError> {
        let xlogrec = XLogRecord::from_slice(&recordbuf[0..XLOG_SIZE_OF_XLOG_RECORD])
            .map_err(|e| {
                WalDecodeError::corruption(
                    format!("xlog record deserialization failed {}", e),
                    start_lsn,
                )
            })?;

        if !record_crc_matches(&recordbuf) {
            return Err(WalDecodeError::corruption(
                "incorrect resource manager data checksum in record",
                start_lsn,
            ));
        }
        if let Some(prev) = self.prev_record {
            if xlogrec.xl_prev != prev.0 {
                return Err(WalDecodeError::corruption(
                    format!(
                        "record with incorrect prev-link {} (expected {})",
                        Lsn(xlogrec.xl_prev),
                        prev
                    ),
                    start_lsn,
                ));
            }
        }

        // XLOG_SWITCH records are special. If we see one, we need to skip
        // to the next WAL segment.
        let end_lsn = if xlogrec.is_xlog_switch_record() {
            trace!("saw xlog switch record at {}", start_lsn);
            self.lsn + self.lsn.calc_padding(self.seg_size as u64)
        } else {
            // Pad to an 8-byte boundary
            self.lsn.align()
        };
        self.state = State::SkippingEverything {
            skip_until_lsn: end_lsn,
        };
        self.prev_record = Some(start_lsn);

        Ok(WalRecordBytes {
            start_lsn,
            end_lsn,
            buf: recordbuf,
        })
    }
}
