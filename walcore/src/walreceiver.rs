//!
//! Standby side of streaming replication: take WAL from a primary, write
//! it into local segment files, and tell the primary how far it got.
//!
//! The transport is behind [`WalStreamSource`]; this module only knows the
//! replication messages carried in it. All integers on the wire are
//! big-endian.
//!
//! The loop sleeps on the process's [`SignalLatch`]. A source wakes it when
//! data arrives, and the signal thread wakes it on HUP, TERM and QUIT; the
//! loop picks the signal up at its next safe point.
//!
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use camino::Utf8PathBuf;
use postgres_ffi::xlog_utils::get_current_timestamp;
use postgres_ffi::{FullTransactionId, TimeLineID, TimestampTz, XLogSegNo};
use thiserror::Error;
use tracing::*;
use utils::lsn::{AtomicLsn, Lsn};
use utils::signals::{exit_immediately, Signal, SignalLatch};

use crate::config::WalConfig;
use crate::crypt::WalIo;
use crate::error::{WalError, WalResult};
use crate::segment::SegmentFile;

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
const STATUS_UPDATE_TAG: u8 = b'r';
const HS_FEEDBACK_TAG: u8 = b'h';

/// start, end, send time
const XLOG_DATA_HEADER_LEN: usize = 24;
const KEEPALIVE_LEN: usize = 17;
const STATUS_UPDATE_LEN: usize = 33;
const HS_FEEDBACK_LEN: usize = 24;

/// Exit status used when QUIT aborts the receiver.
pub const QUIT_EXIT_CODE: i32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty replication message")]
    Empty,
    #[error("unexpected replication message type {0:?}")]
    UnknownType(char),
    #[error("invalid {kind} message: {len} bytes")]
    BadLength { kind: &'static str, len: usize },
}

impl From<ProtocolError> for WalError {
    fn from(e: ProtocolError) -> Self {
        WalError::Connection(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogDataBody {
    pub wal_start: Lsn,
    /// Current end of WAL on the primary.
    pub wal_end: Lsn,
    pub send_time: TimestampTz,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveBody {
    pub wal_end: Lsn,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

/// Messages from the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderMessage {
    XLogData(XLogDataBody),
    KeepAlive(KeepAliveBody),
}

fn check_len(kind: &'static str, buf: &Bytes, min: usize, exact: bool) -> Result<(), ProtocolError> {
    if buf.len() < min || (exact && buf.len() != min) {
        return Err(ProtocolError::BadLength { kind, len: buf.len() });
    }
    Ok(())
}

impl SenderMessage {
    /// Parse a message, type byte included.
    pub fn parse(mut buf: Bytes) -> Result<SenderMessage, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::Empty);
        }
        match buf.get_u8() {
            XLOG_DATA_TAG => {
                check_len("WAL data", &buf, XLOG_DATA_HEADER_LEN, false)?;
                let wal_start = Lsn(buf.get_u64());
                let wal_end = Lsn(buf.get_u64());
                let send_time = buf.get_i64();
                Ok(SenderMessage::XLogData(XLogDataBody {
                    wal_start,
                    wal_end,
                    send_time,
                    data: buf,
                }))
            }
            KEEPALIVE_TAG => {
                check_len("keepalive", &buf, KEEPALIVE_LEN, true)?;
                Ok(SenderMessage::KeepAlive(KeepAliveBody {
                    wal_end: Lsn(buf.get_u64()),
                    send_time: buf.get_i64(),
                    reply_requested: buf.get_u8() != 0,
                }))
            }
            other => Err(ProtocolError::UnknownType(other as char)),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            SenderMessage::XLogData(body) => {
                buf.put_u8(XLOG_DATA_TAG);
                buf.put_u64(body.wal_start.0);
                buf.put_u64(body.wal_end.0);
                buf.put_i64(body.send_time);
                buf.put_slice(&body.data);
            }
            SenderMessage::KeepAlive(body) => {
                buf.put_u8(KEEPALIVE_TAG);
                buf.put_u64(body.wal_end.0);
                buf.put_i64(body.send_time);
                buf.put_u8(body.reply_requested as u8);
            }
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub write: Lsn,
    pub flush: Lsn,
    pub apply: Lsn,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

/// Oldest xids the standby still needs. Zero xids withdraw the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotStandbyFeedback {
    pub send_time: TimestampTz,
    pub xmin: u32,
    pub epoch: u32,
    pub catalog_xmin: u32,
    pub catalog_epoch: u32,
}

/// Messages to the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyMessage {
    Status(StatusUpdate),
    Feedback(HotStandbyFeedback),
}

impl StandbyMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + STATUS_UPDATE_LEN);
        match self {
            StandbyMessage::Status(s) => {
                buf.put_u8(STATUS_UPDATE_TAG);
                buf.put_u64(s.write.0);
                buf.put_u64(s.flush.0);
                buf.put_u64(s.apply.0);
                buf.put_i64(s.send_time);
                buf.put_u8(s.reply_requested as u8);
            }
            StandbyMessage::Feedback(f) => {
                buf.put_u8(HS_FEEDBACK_TAG);
                buf.put_i64(f.send_time);
                buf.put_u32(f.xmin);
                buf.put_u32(f.epoch);
                buf.put_u32(f.catalog_xmin);
                buf.put_u32(f.catalog_epoch);
            }
        }
        buf.freeze()
    }

    pub fn parse(mut buf: Bytes) -> Result<StandbyMessage, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::Empty);
        }
        match buf.get_u8() {
            STATUS_UPDATE_TAG => {
                check_len("status update", &buf, STATUS_UPDATE_LEN, true)?;
                Ok(StandbyMessage::Status(StatusUpdate {
                    write: Lsn(buf.get_u64()),
                    flush: Lsn(buf.get_u64()),
                    apply: Lsn(buf.get_u64()),
                    send_time: buf.get_i64(),
                    reply_requested: buf.get_u8() != 0,
                }))
            }
            HS_FEEDBACK_TAG => {
                check_len("hot standby feedback", &buf, HS_FEEDBACK_LEN, true)?;
                Ok(StandbyMessage::Feedback(HotStandbyFeedback {
                    send_time: buf.get_i64(),
                    xmin: buf.get_u32(),
                    epoch: buf.get_u32(),
                    catalog_xmin: buf.get_u32(),
                    catalog_epoch: buf.get_u32(),
                }))
            }
            other => Err(ProtocolError::UnknownType(other as char)),
        }
    }
}

/// What a source has for the receiver right now.
#[derive(Debug)]
pub enum Received {
    Message(Bytes),
    /// Nothing yet; the source sets the latch when that changes.
    Pending,
    /// The primary ended the stream.
    EndOfStream,
}

/// A replication connection to a primary.
pub trait WalStreamSource {
    /// Next message, without blocking.
    fn try_receive(&mut self) -> WalResult<Received>;

    fn send(&mut self, msg: &StandbyMessage) -> WalResult<()>;
}

/// In-process source fed through a channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
    replies: mpsc::Sender<Bytes>,
}

/// The primary's end of a [`ChannelSource`]. Dropping it ends the stream.
pub struct ChannelPeer {
    tx: mpsc::Sender<Bytes>,
    replies: mpsc::Receiver<Bytes>,
    latch: Arc<SignalLatch>,
}

pub fn channel(latch: Arc<SignalLatch>) -> (ChannelPeer, ChannelSource) {
    let (tx, rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    (
        ChannelPeer {
            tx,
            replies: reply_rx,
            latch,
        },
        ChannelSource {
            rx,
            replies: reply_tx,
        },
    )
}

impl ChannelPeer {
    /// Queue `msg` and wake the receiver. False once the receiver is gone.
    pub fn send(&self, msg: &SenderMessage) -> bool {
        let ok = self.tx.send(msg.encode()).is_ok();
        self.latch.latch.set();
        ok
    }

    /// Replies sent so far, oldest first.
    pub fn replies(&self) -> Vec<StandbyMessage> {
        self.replies
            .try_iter()
            .filter_map(|b| StandbyMessage::parse(b).ok())
            .collect()
    }
}

impl Drop for ChannelPeer {
    fn drop(&mut self) {
        self.latch.latch.set();
    }
}

impl WalStreamSource for ChannelSource {
    fn try_receive(&mut self) -> WalResult<Received> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Received::Message(msg)),
            Err(mpsc::TryRecvError::Empty) => Ok(Received::Pending),
            Err(mpsc::TryRecvError::Disconnected) => Ok(Received::EndOfStream),
        }
    }

    fn send(&mut self, msg: &StandbyMessage) -> WalResult<()> {
        self.replies
            .send(msg.encode())
            .map_err(|_| WalError::Connection("primary went away".to_string()))
    }
}

/// The subset of [`WalConfig`] the receiver follows; re-read on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverSettings {
    pub status_interval: Duration,
    pub timeout: Duration,
    pub hot_standby_feedback: bool,
    pub archive_mode: bool,
    pub no_sync: bool,
}

impl From<&WalConfig> for ReceiverSettings {
    fn from(conf: &WalConfig) -> Self {
        ReceiverSettings {
            status_interval: conf.wal_receiver_status_interval,
            timeout: conf.wal_receiver_timeout,
            hot_standby_feedback: conf.hot_standby_feedback,
            archive_mode: conf.archive_mode,
            no_sync: conf.no_sync,
        }
    }
}

/// Why [`WalReceiver::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    /// The primary has no more WAL for this timeline.
    EndOfStream,
    /// TERM: everything received was flushed first.
    Terminated,
}

#[derive(Debug, Clone, Copy)]
struct LastReply {
    at: Instant,
    write: Lsn,
    flush: Lsn,
    apply: Lsn,
}

pub struct WalReceiver {
    io: WalIo,
    tli: TimeLineID,
    settings: ReceiverSettings,
    /// Re-read on HUP.
    config_path: Option<Utf8PathBuf>,
    signals: Arc<SignalLatch>,

    file: Option<SegmentFile>,
    write: Lsn,
    flush: Lsn,
    /// Replay position, advanced by whoever applies the WAL.
    apply: Arc<AtomicLsn>,
    feedback_xmin: Option<FullTransactionId>,

    last_reply: Option<LastReply>,
    last_feedback: Option<Instant>,
    feedback_active: bool,
    last_receive: Instant,
    ping_sent: bool,
}

impl WalReceiver {
    /// Receive WAL of timeline `tli` starting at `start`.
    pub fn new(
        io: WalIo,
        tli: TimeLineID,
        start: Lsn,
        settings: ReceiverSettings,
        signals: Arc<SignalLatch>,
    ) -> WalReceiver {
        WalReceiver {
            io,
            tli,
            settings,
            config_path: None,
            signals,
            file: None,
            write: start,
            flush: start,
            apply: Arc::new(AtomicLsn::new(start.0)),
            feedback_xmin: None,
            last_reply: None,
            last_feedback: None,
            feedback_active: false,
            last_receive: Instant::now(),
            ping_sent: false,
        }
    }

    pub fn with_config_path(mut self, path: Utf8PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn settings(&self) -> ReceiverSettings {
        self.settings
    }

    pub fn written(&self) -> Lsn {
        self.write
    }

    pub fn flushed(&self) -> Lsn {
        self.flush
    }

    /// Handle for the replay side to report its progress.
    pub fn apply_position(&self) -> Arc<AtomicLsn> {
        Arc::clone(&self.apply)
    }

    /// Oldest xmin to report when hot standby feedback is on.
    pub fn set_feedback_xmin(&mut self, xmin: Option<FullTransactionId>) {
        self.feedback_xmin = xmin;
    }

    /// Stream until the primary stops, TERM arrives, or the connection
    /// fails. QUIT leaves the process on the spot.
    pub fn run(&mut self, source: &mut impl WalStreamSource) -> WalResult<ReceiverExit> {
        info!("streaming WAL from {} on timeline {}", self.write, self.tli);
        self.last_receive = Instant::now();
        loop {
            self.signals.latch.reset();
            match self.signals.take_pending() {
                Some(Signal::Quit) => {
                    error!("terminating WAL receiver because of QUIT signal");
                    exit_immediately(QUIT_EXIT_CODE);
                }
                Some(Signal::Terminate) => {
                    self.flush(source, true)?;
                    info!("WAL receiver terminated at {}", self.flush);
                    return Ok(ReceiverExit::Terminated);
                }
                Some(Signal::Reload) => {
                    self.reload();
                    self.send_feedback(source, true)?;
                    // more signals may be pending
                    continue;
                }
                None => {}
            }

            let mut received = false;
            loop {
                match source.try_receive()? {
                    Received::Message(buf) => {
                        self.last_receive = Instant::now();
                        self.ping_sent = false;
                        received = true;
                        self.process_message(source, buf)?;
                    }
                    Received::Pending => break,
                    Received::EndOfStream => {
                        info!("replication terminated by primary, end of WAL at {}", self.write);
                        self.flush(source, false)?;
                        self.close_segment(true)?;
                        return Ok(ReceiverExit::EndOfStream);
                    }
                }
            }
            if received {
                self.send_reply(source, false, false)?;
                self.flush(source, false)?;
            }

            let now = Instant::now();
            let silent = now.duration_since(self.last_receive);
            if !self.settings.timeout.is_zero() {
                if silent >= self.settings.timeout {
                    return Err(WalError::Connection(
                        "terminating WAL receiver due to timeout".to_string(),
                    ));
                }
                if silent >= self.settings.timeout / 2 && !self.ping_sent {
                    self.send_reply(source, true, true)?;
                    self.ping_sent = true;
                }
            }
            self.send_reply(source, false, false)?;
            self.send_feedback(source, false)?;

            self.signals.latch.wait_timeout(self.nap(now));
        }
    }

    /// Time until the next reply, ping, or timeout is due.
    fn nap(&self, now: Instant) -> Duration {
        let mut nap = Duration::from_secs(1);
        if !self.settings.status_interval.is_zero() {
            let since = self.last_reply.map_or(Duration::ZERO, |r| now.duration_since(r.at));
            nap = nap.min(self.settings.status_interval.saturating_sub(since));
        }
        if !self.settings.timeout.is_zero() {
            let silent = now.duration_since(self.last_receive);
            let due = if self.ping_sent {
                self.settings.timeout
            } else {
                self.settings.timeout / 2
            };
            nap = nap.min(due.saturating_sub(silent));
        }
        nap.max(Duration::from_millis(1))
    }

    fn reload(&mut self) {
        let Some(path) = &self.config_path else {
            info!("reload requested, no config file to re-read");
            return;
        };
        match WalConfig::load(path) {
            Ok(conf) => {
                self.settings = ReceiverSettings::from(&conf);
                info!("reloaded {path}: {:?}", self.settings);
            }
            Err(e) => warn!("keeping the current settings: {e:#}"),
        }
    }

    fn process_message(&mut self, source: &mut impl WalStreamSource, buf: Bytes) -> WalResult<()> {
        match SenderMessage::parse(buf)? {
            SenderMessage::XLogData(body) => {
                trace!(
                    "received {} bytes of WAL at {}, primary at {}",
                    body.data.len(),
                    body.wal_start,
                    body.wal_end
                );
                self.write_wal(body.wal_start, &body.data)
            }
            SenderMessage::KeepAlive(body) => {
                trace!(
                    "received keepalive, primary at {}, reply requested: {}",
                    body.wal_end,
                    body.reply_requested
                );
                if body.reply_requested {
                    self.send_reply(source, true, false)?;
                }
                Ok(())
            }
        }
    }

    /// Write `data`, which belongs at `lsn`, segment by segment.
    fn write_wal(&mut self, mut lsn: Lsn, mut data: &[u8]) -> WalResult<()> {
        let seg_size = self.io.seg_size();
        while !data.is_empty() {
            let segno = lsn.segment_number(seg_size);
            if matches!(&self.file, Some(f) if f.segno() != segno) {
                self.close_segment(false)?;
            }
            let file = match self.file.take() {
                Some(f) => f,
                None => self.open_segment(segno)?,
            };
            let n = data.len().min(seg_size - lsn.segment_offset(seg_size));
            let res = self.io.write(&file, lsn, &data[..n]);
            self.file = Some(file);
            res?;
            lsn += n as u64;
            data = &data[n..];
            self.write = lsn;
        }
        // a segment that was just completed gets its status marker now
        if lsn.segment_offset(seg_size) == 0 {
            self.close_segment(false)?;
        }
        Ok(())
    }

    fn open_segment(&self, segno: XLogSegNo) -> WalResult<SegmentFile> {
        let segs = self.io.segments();
        segs.create_dirs()?;
        segs.create(self.tli, segno, true)
    }

    fn sync(&self) -> WalResult<()> {
        match &self.file {
            Some(file) if !self.settings.no_sync => file.fsync(),
            _ => Ok(()),
        }
    }

    /// Sync and let go of the current segment. A segment received from the
    /// primary is archived there, so it is only queued for archiving here
    /// with archive mode on. `partial` skips the status marker for a
    /// segment the stream ended in the middle of.
    fn close_segment(&mut self, partial: bool) -> WalResult<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.sync()?;
        self.flush = self.flush.max(self.write);
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let complete = self.write >= Lsn((file.segno() + 1) * self.io.seg_size() as u64);
        if partial && !complete {
            return Ok(());
        }
        let segs = self.io.segments();
        let name = segs.segment_name(file.tli(), file.segno());
        if self.settings.archive_mode {
            segs.mark_ready(&name)
        } else {
            segs.force_done(&name)
        }
    }

    fn flush(&mut self, source: &mut impl WalStreamSource, dying: bool) -> WalResult<()> {
        if self.flush >= self.write {
            return Ok(());
        }
        self.sync()?;
        self.flush = self.write;
        debug!("flushed received WAL up to {}", self.flush);
        if !dying {
            self.send_reply(source, false, false)?;
            self.send_feedback(source, false)?;
        }
        Ok(())
    }

    /// Report positions. Unless `force`, only when something moved or the
    /// status interval has passed.
    fn send_reply(&mut self, source: &mut impl WalStreamSource, force: bool, request_reply: bool) -> WalResult<()> {
        let interval = self.settings.status_interval;
        if !force && interval.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let apply = self.apply.load();
        if !force {
            if let Some(last) = self.last_reply {
                let unchanged = last.write == self.write && last.flush == self.flush && last.apply == apply;
                if unchanged && now.duration_since(last.at) < interval {
                    return Ok(());
                }
            }
        }
        self.last_reply = Some(LastReply {
            at: now,
            write: self.write,
            flush: self.flush,
            apply,
        });
        trace!("sending write {} flush {} apply {}", self.write, self.flush, apply);
        source.send(&StandbyMessage::Status(StatusUpdate {
            write: self.write,
            flush: self.flush,
            apply,
            send_time: get_current_timestamp(),
            reply_requested: request_reply,
        }))
    }

    /// Tell the primary which xmin to keep. Once feedback is turned off, a
    /// last message with zeros releases what was held.
    fn send_feedback(&mut self, source: &mut impl WalStreamSource, immediate: bool) -> WalResult<()> {
        let enabled = self.settings.hot_standby_feedback && !self.settings.status_interval.is_zero();
        if !enabled && !self.feedback_active {
            return Ok(());
        }
        let now = Instant::now();
        if !immediate {
            if let Some(at) = self.last_feedback {
                if now.duration_since(at) < self.settings.status_interval {
                    return Ok(());
                }
            }
        }
        let (xmin, epoch) = match self.feedback_xmin {
            Some(x) if enabled => (x.xid(), x.epoch()),
            _ => (0, 0),
        };
        self.last_feedback = Some(now);
        self.feedback_active = enabled && xmin != 0;
        debug!("sending hot standby feedback xmin {xmin} epoch {epoch}");
        source.send(&StandbyMessage::Feedback(HotStandbyFeedback {
            send_time: get_current_timestamp(),
            xmin,
            epoch,
            catalog_xmin: 0,
            catalog_epoch: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentDir;
    use std::thread;

    const SEG: usize = 1024 * 1024;

    fn settings() -> ReceiverSettings {
        ReceiverSettings {
            status_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            hot_standby_feedback: false,
            archive_mode: false,
            no_sync: true,
        }
    }

    fn receiver(dir: &std::path::Path, start: Lsn, signals: &Arc<SignalLatch>) -> WalReceiver {
        let io = WalIo::new(SegmentDir::new(dir.join("pg_wal"), SEG, true), None);
        WalReceiver::new(io, 1, start, settings(), Arc::clone(signals))
    }

    fn wal(start: u64, data: Vec<u8>) -> SenderMessage {
        SenderMessage::XLogData(XLogDataBody {
            wal_start: Lsn(start),
            wal_end: Lsn(start + data.len() as u64),
            send_time: 0,
            data: Bytes::from(data),
        })
    }

    #[test]
    fn wire_layout_is_big_endian() {
        let msg = StandbyMessage::Status(StatusUpdate {
            write: Lsn(0x0102),
            flush: Lsn(0x0304),
            apply: Lsn(0),
            send_time: 7,
            reply_requested: true,
        });
        let buf = msg.encode();
        assert_eq!(buf.len(), 1 + STATUS_UPDATE_LEN);
        assert_eq!(buf[0], b'r');
        assert_eq!(&buf[1..9], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&buf[9..17], &[0, 0, 0, 0, 0, 0, 3, 4]);
        assert_eq!(buf[33], 1);
        assert_eq!(StandbyMessage::parse(buf).unwrap(), msg);

        let feedback = StandbyMessage::Feedback(HotStandbyFeedback {
            send_time: -1,
            xmin: 0xAABBCCDD,
            epoch: 1,
            catalog_xmin: 0,
            catalog_epoch: 0,
        });
        let buf = feedback.encode();
        assert_eq!(buf[0], b'h');
        assert_eq!(&buf[1..9], &[0xFF; 8]);
        assert_eq!(&buf[9..13], &[0xAA, 0xBB, 0xCC, 0xDD]);

        let mut raw = BytesMut::new();
        raw.put_u8(b'k');
        raw.put_u64(0x1_0000_0000);
        raw.put_i64(5);
        raw.put_u8(1);
        assert_eq!(
            SenderMessage::parse(raw.freeze()).unwrap(),
            SenderMessage::KeepAlive(KeepAliveBody {
                wal_end: Lsn(0x1_0000_0000),
                send_time: 5,
                reply_requested: true,
            })
        );
    }

    #[test]
    fn malformed_messages() {
        assert_eq!(SenderMessage::parse(Bytes::new()), Err(ProtocolError::Empty));
        assert_eq!(
            SenderMessage::parse(Bytes::from_static(b"x")),
            Err(ProtocolError::UnknownType('x'))
        );
        assert!(matches!(
            SenderMessage::parse(Bytes::from_static(b"w\0\0\0")),
            Err(ProtocolError::BadLength { .. })
        ));
        assert!(matches!(
            SenderMessage::parse(Bytes::from_static(&[b'k'; 20])),
            Err(ProtocolError::BadLength { .. })
        ));
    }

    #[test]
    fn wal_is_written_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalLatch::new();
        let start = SEG as u64 - 1000;
        let mut rcv = receiver(dir.path(), Lsn(start), &signals);
        let (peer, mut source) = channel(Arc::clone(&signals));

        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        assert!(peer.send(&wal(start, data[..1000].to_vec())));
        assert!(peer.send(&wal(start + 1000, data[1000..].to_vec())));
        let replies = thread::scope(|s| {
            let h = s.spawn(|| rcv.run(&mut source));
            thread::sleep(Duration::from_millis(50));
            let replies = peer.replies();
            drop(peer);
            assert_eq!(h.join().unwrap().unwrap(), ReceiverExit::EndOfStream);
            replies
        });

        let end = Lsn(start + 3000);
        assert_eq!(rcv.written(), end);
        assert_eq!(rcv.flushed(), end);
        let segs = SegmentDir::new(dir.path().join("pg_wal"), SEG, true);
        let first = segs.open(1, 0).unwrap().pread(SEG - 1000, 1000).unwrap();
        assert_eq!(first, &data[..1000]);
        let second = segs.open(1, 1).unwrap().pread(0, 2000).unwrap();
        assert_eq!(second, &data[1000..]);
        // the completed segment will not be archived from here, the partial one has no marker
        assert!(segs.status_path(&segs.segment_name(1, 0), "done").exists());
        assert!(!segs.status_path(&segs.segment_name(1, 1), "done").exists());

        assert!(replies.iter().any(|r| matches!(r,
            StandbyMessage::Status(s) if s.flush == end && s.write == end)));
    }

    #[test]
    fn keepalive_asking_for_reply_gets_one() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalLatch::new();
        let mut rcv = receiver(dir.path(), Lsn(SEG as u64), &signals);
        // no periodic replies, only the requested one
        rcv.settings.status_interval = Duration::ZERO;
        let (peer, mut source) = channel(Arc::clone(&signals));

        peer.send(&SenderMessage::KeepAlive(KeepAliveBody {
            wal_end: Lsn(SEG as u64),
            send_time: 0,
            reply_requested: true,
        }));
        let h = thread::spawn(move || rcv.run(&mut source));
        thread::sleep(Duration::from_millis(30));
        let replies = peer.replies();
        drop(peer);
        assert_eq!(h.join().unwrap().unwrap(), ReceiverExit::EndOfStream);
        assert_eq!(replies.len(), 1, "{replies:?}");
        assert!(matches!(replies[0], StandbyMessage::Status(s) if s.write == Lsn(SEG as u64)));
    }

    #[test]
    fn terminate_flushes_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalLatch::new();
        let mut rcv = receiver(dir.path(), Lsn(SEG as u64), &signals);
        let (peer, mut source) = channel(Arc::clone(&signals));
        peer.send(&wal(SEG as u64, vec![7; 100]));

        let h = thread::spawn(move || {
            let exit = rcv.run(&mut source);
            (exit, rcv.flushed())
        });
        thread::sleep(Duration::from_millis(30));
        signals.raise(Signal::Terminate);
        let (exit, flushed) = h.join().unwrap();
        assert_eq!(exit.unwrap(), ReceiverExit::Terminated);
        assert_eq!(flushed, Lsn(SEG as u64 + 100));
        drop(peer);
    }

    #[test]
    fn reload_rereads_settings() {
        let dir = tempfile::tempdir().unwrap();
        let conf_path = Utf8PathBuf::from_path_buf(dir.path().join("wal.toml")).unwrap();
        std::fs::write(
            &conf_path,
            "wal_receiver_status_interval = \"2s\"\nhot_standby_feedback = true\n",
        )
        .unwrap();

        let signals = SignalLatch::new();
        let mut rcv = receiver(dir.path(), Lsn(SEG as u64), &signals).with_config_path(conf_path);
        rcv.set_feedback_xmin(Some(FullTransactionId::new(0, 1234)));
        let (peer, mut source) = channel(Arc::clone(&signals));

        let h = thread::spawn(move || {
            let exit = rcv.run(&mut source);
            (exit, rcv)
        });
        signals.raise(Signal::Reload);
        thread::sleep(Duration::from_millis(30));
        signals.raise(Signal::Terminate);
        let (exit, rcv) = h.join().unwrap();
        assert_eq!(exit.unwrap(), ReceiverExit::Terminated);
        assert_eq!(rcv.settings().status_interval, Duration::from_secs(2));
        assert!(rcv.settings().hot_standby_feedback);
        assert!(peer.replies().iter().any(|r| matches!(r,
            StandbyMessage::Feedback(f) if f.xmin == 1234)));
    }

    #[test]
    fn silent_primary_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalLatch::new();
        let mut rcv = receiver(dir.path(), Lsn(SEG as u64), &signals);
        rcv.settings.timeout = Duration::from_millis(40);
        let (peer, mut source) = channel(Arc::clone(&signals));

        let err = rcv.run(&mut source).unwrap_err();
        assert!(matches!(err, WalError::Connection(_)), "{err}");
        // a ping went out at half the timeout
        assert!(peer
            .replies()
            .iter()
            .any(|r| matches!(r, StandbyMessage::Status(s) if s.reply_requested)));
    }
}
