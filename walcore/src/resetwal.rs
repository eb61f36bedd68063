//!
//! Offline repair of a stopped cluster: rebuild a lost control file from
//! the WAL that is left, and throw the WAL away in favour of one fresh
//! segment holding a shutdown checkpoint.
//!
//! [`read_or_restore`] finds the best available control data: the control
//! file itself, the newest checkpoint record in the WAL, the newest one in
//! an old `pg_xlog` directory, or, failing all that, guessed defaults.
//! [`plan_reset`] works out what a reset would write and [`apply_reset`]
//! writes it.
//!
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use pg_tde::TdeKeyManager;
use postgres_ffi::controlfile_utils::ControlFileVersion;
use postgres_ffi::legacy::{
    CheckpointScanner, LegacyCheckpoint, RecPtrV0, XLogFileNameV0, XLogFromFileNameV0,
    XLOG_SEG_SIZE_V0,
};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::{
    encode_main_data_record, generate_wal_segment, validate_long_header, validate_page_header,
    IsPartialXLogFileName, IsValidWalSegSize, IsXLogFileName, XLogFileName, XLogFromFileName,
    XLogSegmentsPerXLogId, XLOG_SIZE_OF_XLOG_LONG_PHD,
};
use postgres_ffi::{
    CheckPoint, ControlFileData, DBState, FullTransactionId, TimeLineID, XLogLongPageHeaderData,
    XLogSegNo, XLOG_BLCKSZ,
};
use tracing::*;
use utils::lsn::Lsn;
use utils::pid_file::{self, PidFileRead};

use crate::controldata::{format_build_settings, labeled, on_off};
use crate::controlfile::{
    control_file_path, create_control_file, get_controlfile_by_exact_path, guessed_defaults,
};
use crate::crypt::WalIo;
use crate::error::{WalError, WalResult};
use crate::reader::XLogReader;
use crate::segment::SegmentDir;
use crate::timeline::read_history;

/// Lowest multixact id in use.
const FIRST_MULTIXACT_ID: u32 = 1;

/// Lowest WAL file the reset may start at, `-l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinWalLocation {
    pub tli: TimeLineID,
    pub log: u32,
    pub seg: u32,
}

impl MinWalLocation {
    fn segno(&self, seg_size: usize) -> XLogSegNo {
        self.log as u64 * XLogSegmentsPerXLogId(seg_size) + self.seg as u64
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl FromStr for MinWalLocation {
    type Err = String;

    /// `TLI,LOG,SEG` or a 24-digit WAL file name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid WAL location \"{s}\": expected TLI,LOG,SEG or a WAL file name");
        if s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let field = |i: usize| u32::from_str_radix(&s[i * 8..(i + 1) * 8], 16).map_err(|_| bad());
            return Ok(MinWalLocation {
                tli: field(0)?,
                log: field(1)?,
                seg: field(2)?,
            });
        }
        let parts: Vec<u32> = s.split(',').map(|p| parse_u32(p.trim()).ok_or_else(bad)).collect::<Result<_, _>>()?;
        match parts[..] {
            [tli, log, seg] if tli > 0 => Ok(MinWalLocation { tli, log, seg }),
            _ => Err(bad()),
        }
    }
}

/// What a reset should change besides the WAL position.
#[derive(Debug, Clone, Default)]
pub struct ResetOptions {
    /// Proceed even if the values are guessed, the cluster was not shut
    /// down cleanly, or a pid file is present.
    pub force: bool,
    /// Print what would be done and stop.
    pub dry_run: bool,
    pub next_xid: Option<u32>,
    pub xid_epoch: Option<u32>,
    pub oldest_xid: Option<u32>,
    pub next_oid: Option<u32>,
    /// Next multixact id and, optionally, the oldest one still in use.
    pub next_multi: Option<(u32, Option<u32>)>,
    pub next_multi_offset: Option<u32>,
    /// Oldest and newest xid with a commit timestamp.
    pub commit_ts_xids: Option<(u32, u32)>,
    pub min_wal: Option<MinWalLocation>,
    pub wal_seg_size: Option<usize>,
}

impl ResetOptions {
    /// Reject values the server could not live with.
    pub fn validate(&self) -> WalResult<()> {
        let bad = |msg: &str| Err(WalError::bad_state(msg));
        if matches!(self.next_xid, Some(x) if x < pg_constants::FIRST_NORMAL_TRANSACTION_ID) {
            return bad("transaction ID (-x) must be greater than or equal to 3");
        }
        if matches!(self.oldest_xid, Some(x) if x < pg_constants::FIRST_NORMAL_TRANSACTION_ID) {
            return bad("oldest transaction ID (-u) must be greater than or equal to 3");
        }
        if self.xid_epoch == Some(u32::MAX) {
            return bad("transaction ID epoch (-e) must not be -1");
        }
        if self.next_oid == Some(0) {
            return bad("OID (-o) must not be 0");
        }
        if let Some((next, oldest)) = self.next_multi {
            if next == 0 || oldest == Some(0) {
                return bad("multitransaction ID (-m) must not be 0");
            }
        }
        if self.next_multi_offset == Some(u32::MAX) {
            return bad("multitransaction offset (-O) must not be -1");
        }
        if let Some((oldest, newest)) = self.commit_ts_xids {
            let ok = |x: u32| x == 0 || x >= pg_constants::FIRST_NORMAL_TRANSACTION_ID;
            if !ok(oldest) || !ok(newest) {
                return bad("transaction ID (-c) must be either 0 or greater than or equal to 3");
            }
        }
        if let Some(size) = self.wal_seg_size {
            if !IsValidWalSegSize(size) {
                return bad("WAL segment size must be a power of two between 1 MB and 1 GB");
            }
        }
        Ok(())
    }
}

/// Where the control data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSource {
    /// An intact control file.
    File,
    /// A control file in the V0 layout, converted.
    Upgraded,
    /// The newest checkpoint record in `pg_wal`.
    Wal { checkpoint: Lsn, shutdown: bool },
    /// The newest checkpoint record in an old `pg_xlog`.
    LegacyWal { checkpoint: Lsn, shutdown: bool },
    /// Nothing usable was found.
    Guessed,
}

#[derive(Debug, Clone)]
pub struct Restored {
    pub data: ControlFileData,
    /// Some values are defaults rather than read from disk.
    pub guessed: bool,
    pub source: ControlSource,
}

fn wal_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(pg_constants::XLOGDIR)
}

fn legacy_wal_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(pg_constants::XLOGDIR_V0)
}

/// Refuse to touch a data directory that has a server pid file.
pub fn check_not_running(data_dir: &Path) -> WalResult<()> {
    let path = data_dir.join(pg_constants::POSTMASTER_PID_FILE);
    match pid_file::read(&path).map_err(|e| WalError::io(&path, e))? {
        PidFileRead::NotExist => Ok(()),
        PidFileRead::HeldByProcess(pid) => Err(WalError::bad_state(format!(
            "lock file \"{}\" exists and names running process {pid}; is a server running?",
            path.display()
        ))),
        PidFileRead::Stale(_) => Err(WalError::bad_state(format!(
            "lock file \"{}\" exists; if no server is running, delete it and try again",
            path.display()
        ))),
    }
}

/// Names of the files in `dir` accepted by `keep`; nothing if `dir` is missing.
fn list_dir(dir: &Path, keep: impl Fn(&str) -> bool) -> WalResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WalError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| WalError::io(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if keep(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort_unstable();
    Ok(names)
}

fn read_prefix(path: &Path, buf: &mut [u8]) -> io::Result<usize> {
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// A segment whose first page passed validation.
#[derive(Debug, Clone, Copy)]
struct ProbedSegment {
    tli: TimeLineID,
    segno: XLogSegNo,
    system_id: u64,
    seg_size: usize,
}

fn probe_segment(dir: &Path, name: &str) -> Option<ProbedSegment> {
    let mut page = [0u8; XLOG_BLCKSZ];
    let n = read_prefix(&dir.join(name), &mut page).ok()?;
    if n < XLOG_SIZE_OF_XLOG_LONG_PHD {
        return None;
    }
    let hdr = XLogLongPageHeaderData::from_bytes(&mut &page[..]).ok()?;
    let seg_size = hdr.xlp_seg_size as usize;
    if !IsValidWalSegSize(seg_size) {
        return None;
    }
    let (segno, tli) = XLogFromFileName(name, seg_size)?;
    let page_lsn = Lsn(segno * seg_size as u64);
    validate_page_header(&page, page_lsn, Some(tli), seg_size).ok()?;
    validate_long_header(&page, None, seg_size).ok()?;
    Some(ProbedSegment {
        tli,
        segno,
        system_id: hdr.xlp_sysid,
        seg_size,
    })
}

/// The usable segments of the newest timeline, oldest first: those whose
/// long header is valid and agrees with the newest segment on segment size
/// and system identifier.
fn usable_segments(dir: &Path) -> WalResult<Vec<ProbedSegment>> {
    let names = list_dir(dir, IsXLogFileName)?;
    let mut probed: Vec<ProbedSegment> = names
        .iter()
        .filter_map(|name| {
            let p = probe_segment(dir, name);
            if p.is_none() {
                warn!("ignoring WAL file {name} with an invalid first page");
            }
            p
        })
        .collect();
    probed.sort_by_key(|p| (p.tli, p.segno));
    let Some(newest) = probed.last().copied() else {
        return Ok(Vec::new());
    };
    probed.retain(|p| {
        let keep = p.tli == newest.tli && p.seg_size == newest.seg_size && p.system_id == newest.system_id;
        if p.tli == newest.tli && !keep {
            warn!("ignoring segment {} of timeline {}: inconsistent header", p.segno, p.tli);
        }
        keep
    });
    Ok(probed)
}

#[derive(Debug, Clone, Copy)]
struct FoundCheckpoint {
    lsn: Lsn,
    shutdown: bool,
    checkpoint: CheckPoint,
}

/// Newest and previous checkpoint records in the WAL of the newest
/// timeline, with the identity of the segments.
fn scan_wal_checkpoints(
    data_dir: &Path,
    tde: Option<Arc<TdeKeyManager>>,
) -> WalResult<Option<(ProbedSegment, Option<FoundCheckpoint>, Option<FoundCheckpoint>)>> {
    let dir = wal_dir(data_dir);
    let segments = usable_segments(&dir)?;
    let Some(first) = segments.first().copied() else {
        return Ok(None);
    };
    let seg_dir = SegmentDir::new(&dir, first.seg_size, true);
    let history = read_history(&seg_dir, first.tli)?;
    let io = WalIo::new(seg_dir, tde);
    let reader = XLogReader::new(&io, history).with_system_id(first.system_id);

    let mut cursor = reader.open_at(Lsn(first.segno * first.seg_size as u64));
    let mut prev: Option<FoundCheckpoint> = None;
    let mut last: Option<FoundCheckpoint> = None;
    loop {
        let rec = match reader.read_record(&mut cursor) {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) if e.is_corruption() => {
                info!("WAL scan stopped: {e}");
                break;
            }
            Err(e) => return Err(e),
        };
        if rec.header.xl_rmid != pg_constants::RM_XLOG_ID {
            continue;
        }
        let info = rec.info() & pg_constants::XLR_RMGR_INFO_MASK;
        if info != pg_constants::XLOG_CHECKPOINT_SHUTDOWN && info != pg_constants::XLOG_CHECKPOINT_ONLINE {
            continue;
        }
        match CheckPoint::decode(&rec.decoded.main_data()) {
            Ok(checkpoint) => {
                debug!("found checkpoint record at {}", rec.lsn);
                prev = last.take();
                last = Some(FoundCheckpoint {
                    lsn: rec.lsn,
                    shutdown: info == pg_constants::XLOG_CHECKPOINT_SHUTDOWN,
                    checkpoint,
                });
            }
            Err(e) => warn!("undecodable checkpoint record at {}: {e}", rec.lsn),
        }
    }
    Ok(Some((first, prev, last)))
}

/// Checkpoints in an old `pg_xlog`, oldest first. Each file is read page
/// by page and closed before the next is opened; the scan stops at the
/// first page that does not continue the WAL.
fn scan_legacy_checkpoints(data_dir: &Path) -> WalResult<Vec<LegacyCheckpoint>> {
    let dir = legacy_wal_dir(data_dir);
    let mut files: Vec<(u32, u32)> = list_dir(&dir, |n| XLogFromFileNameV0(n).is_some())?
        .iter()
        .filter_map(|n| XLogFromFileNameV0(n))
        .collect();
    files.sort_unstable();

    let mut scanner = CheckpointScanner::new();
    let mut page = vec![0u8; XLOG_BLCKSZ];
    'files: for (xlogid, seg) in files {
        let path = dir.join(XLogFileNameV0(xlogid, seg));
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("could not open {}: {e}", path.display());
                break;
            }
        };
        let start = RecPtrV0::segment_start(xlogid, seg);
        for off in (0..XLOG_SEG_SIZE_V0).step_by(XLOG_BLCKSZ) {
            if file.read_exact(&mut page).is_err() {
                break 'files;
            }
            scanner.feed_page(start.add(off as u32), &page);
            if scanner.ended() {
                break 'files;
            }
        }
    }
    Ok(scanner.into_checkpoints())
}

fn synthesize(base: ControlFileData, checkpoint_lsn: Lsn, checkpoint: CheckPoint, shutdown: bool) -> ControlFileData {
    ControlFileData {
        state: if shutdown {
            DBState::Shutdowned as u32
        } else {
            DBState::InProduction as u32
        },
        time: checkpoint.time,
        checkPoint: checkpoint_lsn.0,
        checkPointCopy: checkpoint,
        ..base
    }
}

/// Control data from the WAL alone.
pub fn restore_from_wal(
    data_dir: &Path,
    default_seg_size: usize,
    tde: Option<Arc<TdeKeyManager>>,
) -> WalResult<Restored> {
    if let Some((seg, _prev, last)) = scan_wal_checkpoints(data_dir, tde)? {
        let mut base = guessed_defaults(seg.seg_size);
        base.system_identifier = seg.system_id;
        if let Some(found) = last {
            info!("recovered control data from checkpoint at {}", found.lsn);
            return Ok(Restored {
                data: synthesize(base, found.lsn, found.checkpoint, found.shutdown),
                guessed: false,
                source: ControlSource::Wal {
                    checkpoint: found.lsn,
                    shutdown: found.shutdown,
                },
            });
        }
        // the segments still tell the identity and timeline of the cluster
        base.checkPointCopy.ThisTimeLineID = seg.tli;
        base.checkPointCopy.PrevTimeLineID = seg.tli;
        return Ok(Restored {
            data: base,
            guessed: true,
            source: ControlSource::Guessed,
        });
    }

    if let Some(found) = scan_legacy_checkpoints(data_dir)?.last() {
        let base = guessed_defaults(XLOG_SEG_SIZE_V0);
        let checkpoint = found.checkpoint.upgrade(&base.checkPointCopy);
        let lsn = found.location.to_lsn();
        info!("recovered control data from V0 checkpoint at {lsn}");
        return Ok(Restored {
            data: synthesize(base, lsn, checkpoint, found.shutdown),
            guessed: false,
            source: ControlSource::LegacyWal {
                checkpoint: lsn,
                shutdown: found.shutdown,
            },
        });
    }

    Ok(Restored {
        data: guessed_defaults(default_seg_size),
        guessed: true,
        source: ControlSource::Guessed,
    })
}

/// The control file if it can be read, otherwise whatever the WAL tells.
pub fn read_or_restore(
    data_dir: &Path,
    default_seg_size: usize,
    tde: Option<Arc<TdeKeyManager>>,
) -> WalResult<Restored> {
    let path = control_file_path(data_dir);
    match get_controlfile_by_exact_path(&path) {
        Ok(read) if read.crc_ok && read.version == ControlFileVersion::Current && !read.byte_order_suspect => {
            return Ok(Restored {
                data: read.data,
                guessed: false,
                source: ControlSource::File,
            });
        }
        Ok(read) if read.crc_ok && read.version == ControlFileVersion::V0 => {
            return Ok(Restored {
                data: read.data,
                guessed: true,
                source: ControlSource::Upgraded,
            });
        }
        Ok(_) => warn!("pg_control exists but is broken or wrong version; ignoring it"),
        Err(WalError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            warn!("pg_control does not exist, recovering control data from the WAL")
        }
        Err(e @ WalError::Io { .. }) => return Err(e),
        Err(e) => warn!("pg_control is unusable ({e}); recovering control data from the WAL"),
    }
    restore_from_wal(data_dir, default_seg_size, tde)
}

/// The values a reset would write, and why.
#[derive(Debug, Clone)]
pub struct ResetPlan {
    /// Control data as found, before any change.
    pub current: ControlFileData,
    pub guessed: bool,
    pub source: ControlSource,
    /// Control data to be written.
    pub new: ControlFileData,
    pub seg_size: usize,
    pub new_segno: XLogSegNo,
    /// Values changed by options, for the report.
    pub changes: Vec<(&'static str, String)>,
}

impl ResetPlan {
    pub fn first_segment_name(&self) -> String {
        XLogFileName(self.new.checkPointCopy.ThisTimeLineID, self.new_segno, self.seg_size)
    }

    /// Listing of the control values found.
    pub fn describe_current(&self) -> String {
        let cf = &self.current;
        let cp = &cf.checkPointCopy;
        let mut out = String::new();
        out.push_str(if self.guessed {
            "Guessed pg_control values:\n\n"
        } else {
            "Current pg_control values:\n\n"
        });
        labeled(&mut out, "pg_control version number", cf.pg_control_version);
        labeled(&mut out, "Catalog version number", cf.catalog_version_no);
        labeled(&mut out, "Database system identifier", cf.system_identifier);
        labeled(&mut out, "Latest checkpoint's TimeLineID", cp.ThisTimeLineID);
        labeled(&mut out, "Latest checkpoint's full_page_writes", on_off(cp.fullPageWrites));
        labeled(
            &mut out,
            "Latest checkpoint's NextXID",
            format!("{}:{}", cp.nextXid.epoch(), cp.nextXid.xid()),
        );
        labeled(&mut out, "Latest checkpoint's NextOID", cp.nextOid);
        labeled(&mut out, "Latest checkpoint's NextMultiXactId", cp.nextMulti);
        labeled(&mut out, "Latest checkpoint's NextMultiOffset", cp.nextMultiOffset);
        labeled(&mut out, "Latest checkpoint's oldestXID", cp.oldestXid);
        labeled(&mut out, "Latest checkpoint's oldestXID's DB", cp.oldestXidDB);
        labeled(&mut out, "Latest checkpoint's oldestActiveXID", cp.oldestActiveXid);
        labeled(&mut out, "Latest checkpoint's oldestMultiXid", cp.oldestMulti);
        labeled(&mut out, "Latest checkpoint's oldestMulti's DB", cp.oldestMultiDB);
        labeled(&mut out, "Latest checkpoint's oldestCommitTsXid", cp.oldestCommitTsXid);
        labeled(&mut out, "Latest checkpoint's newestCommitTsXid", cp.newestCommitTsXid);
        format_build_settings(&mut out, cf);
        out
    }

    /// Listing of what the reset changes.
    pub fn describe_changes(&self) -> String {
        let mut out = String::from("\n\nValues to be changed:\n\n");
        labeled(&mut out, "First log segment after reset", self.first_segment_name());
        for (label, value) in &self.changes {
            labeled(&mut out, label, value);
        }
        out
    }
}

/// Segment number, in `new_seg_size` units, past all WAL the cluster may
/// have used: the checkpoint's redo position and every segment file found
/// in `pg_wal` or `pg_xlog`, whatever its timeline.
fn find_end_of_wal(data_dir: &Path, cf: &ControlFileData, new_seg_size: usize) -> WalResult<XLogSegNo> {
    let old_seg_size = if IsValidWalSegSize(cf.xlog_seg_size as usize) {
        cf.xlog_seg_size as usize
    } else {
        new_seg_size
    };
    // first segment starting at or after the end of a file at `start`
    let next_after = |start: u64, size: u64| (start + size - 1) / new_seg_size as u64 + 1;

    let redo_seg_start = Lsn(cf.checkPointCopy.redo).segment_lsn(old_seg_size).0;
    let mut next = next_after(redo_seg_start, old_seg_size as u64);

    for name in list_dir(&wal_dir(data_dir), |n| IsXLogFileName(n) || IsPartialXLogFileName(n))? {
        if let Some((segno, _tli)) = XLogFromFileName(&name, old_seg_size) {
            next = next.max(next_after(segno * old_seg_size as u64, old_seg_size as u64));
        }
    }
    for name in list_dir(&legacy_wal_dir(data_dir), |n| XLogFromFileNameV0(n).is_some())? {
        if let Some((xlogid, seg)) = XLogFromFileNameV0(&name) {
            let start = RecPtrV0::segment_start(xlogid, seg).to_lsn().0;
            next = next.max(next_after(start, XLOG_SEG_SIZE_V0 as u64));
        }
    }
    Ok(next)
}

/// True when the WAL already is what a reset would leave behind: one
/// segment, starting with the checkpoint the control file points to, and
/// nothing after it.
fn is_freshly_reset(data_dir: &Path, cf: &ControlFileData, seg_size: usize) -> WalResult<Option<XLogSegNo>> {
    if cf.state != DBState::Shutdowned as u32
        || cf.xlog_seg_size as usize != seg_size
        || cf.checkPoint != cf.checkPointCopy.redo
        || Lsn(cf.checkPoint).segment_offset(seg_size) != XLOG_SIZE_OF_XLOG_LONG_PHD
    {
        return Ok(None);
    }
    let dir = wal_dir(data_dir);
    if !list_dir(&legacy_wal_dir(data_dir), |n| XLogFromFileNameV0(n).is_some())?.is_empty() {
        return Ok(None);
    }
    let names = list_dir(&dir, |n| IsXLogFileName(n) || IsPartialXLogFileName(n))?;
    let tli = cf.checkPointCopy.ThisTimeLineID;
    let segno = Lsn(cf.checkPoint).segment_number(seg_size);
    let segs = SegmentDir::new(&dir, seg_size, true);
    if names != [segs.segment_name(tli, segno)] {
        return Ok(None);
    }

    let io = WalIo::new(segs, None);
    let history = crate::timeline::parse_history(tli, "")?;
    let reader = XLogReader::new(&io, history).with_system_id(cf.system_identifier);
    let mut cursor = reader.open_at(Lsn(cf.checkPoint));
    let first = match reader.read_record(&mut cursor) {
        Ok(Some(rec)) => rec,
        _ => return Ok(None),
    };
    let is_checkpoint = first.header.xl_rmid == pg_constants::RM_XLOG_ID
        && first.info() & pg_constants::XLR_RMGR_INFO_MASK == pg_constants::XLOG_CHECKPOINT_SHUTDOWN
        && CheckPoint::decode(&first.decoded.main_data()).ok() == Some(cf.checkPointCopy);
    if !is_checkpoint || !matches!(reader.read_record(&mut cursor), Ok(None)) {
        return Ok(None);
    }
    Ok(Some(segno))
}

fn apply_options(cf: &mut ControlFileData, opts: &ResetOptions, changes: &mut Vec<(&'static str, String)>) {
    let cp = &mut cf.checkPointCopy;
    if let Some(epoch) = opts.xid_epoch {
        cp.nextXid = FullTransactionId::new(epoch, cp.nextXid.xid());
    }
    if let Some(oldest) = opts.oldest_xid {
        cp.oldestXid = oldest;
        cp.oldestXidDB = 0;
    }
    if let Some(xid) = opts.next_xid {
        cp.nextXid = FullTransactionId::new(cp.nextXid.epoch(), xid);
    }
    if let Some((oldest, newest)) = opts.commit_ts_xids {
        if oldest != 0 {
            cp.oldestCommitTsXid = oldest;
        }
        if newest != 0 {
            cp.newestCommitTsXid = newest;
        }
    }
    if let Some(oid) = opts.next_oid {
        cp.nextOid = oid;
    }
    if let Some((next, oldest)) = opts.next_multi {
        cp.nextMulti = next;
        cp.oldestMulti = oldest.unwrap_or(next).max(FIRST_MULTIXACT_ID);
        cp.oldestMultiDB = 0;
    }
    if let Some(off) = opts.next_multi_offset {
        cp.nextMultiOffset = off;
    }
    if let Some(min) = opts.min_wal {
        if min.tli > cp.ThisTimeLineID {
            cp.ThisTimeLineID = min.tli;
            cp.PrevTimeLineID = min.tli;
        }
    }

    if opts.next_multi.is_some() {
        changes.push(("NextMultiXactId", cp.nextMulti.to_string()));
        changes.push(("OldestMultiXid", cp.oldestMulti.to_string()));
        changes.push(("OldestMulti's DB", cp.oldestMultiDB.to_string()));
    }
    if opts.next_multi_offset.is_some() {
        changes.push(("NextMultiOffset", cp.nextMultiOffset.to_string()));
    }
    if opts.next_oid.is_some() {
        changes.push(("NextOID", cp.nextOid.to_string()));
    }
    if opts.next_xid.is_some() {
        changes.push(("NextXID", cp.nextXid.xid().to_string()));
    }
    if opts.oldest_xid.is_some() {
        changes.push(("OldestXID", cp.oldestXid.to_string()));
        changes.push(("OldestXID's DB", cp.oldestXidDB.to_string()));
    }
    if opts.xid_epoch.is_some() {
        changes.push(("NextXID epoch", cp.nextXid.epoch().to_string()));
    }
    if let Some((oldest, newest)) = opts.commit_ts_xids {
        if oldest != 0 {
            changes.push(("oldestCommitTsXid", cp.oldestCommitTsXid.to_string()));
        }
        if newest != 0 {
            changes.push(("newestCommitTsXid", cp.newestCommitTsXid.to_string()));
        }
    }
    if let Some(size) = opts.wal_seg_size {
        changes.push(("Bytes per WAL segment", size.to_string()));
    }
}

/// Work out what a reset of `data_dir` would write, without writing.
pub fn plan_reset(data_dir: &Path, opts: &ResetOptions, tde: Option<Arc<TdeKeyManager>>) -> WalResult<ResetPlan> {
    opts.validate()?;
    let default_seg_size = opts.wal_seg_size.unwrap_or(pg_constants::DEFAULT_WAL_SEG_SIZE);
    let restored = read_or_restore(data_dir, default_seg_size, tde)?;
    let current = restored.data;
    let seg_size = opts.wal_seg_size.unwrap_or_else(|| {
        if IsValidWalSegSize(current.xlog_seg_size as usize) {
            current.xlog_seg_size as usize
        } else {
            default_seg_size
        }
    });

    let mut new = current;
    let mut changes = Vec::new();
    apply_options(&mut new, opts, &mut changes);
    new.xlog_seg_size = seg_size as u32;

    let unchanged = new.checkPointCopy == current.checkPointCopy && new.xlog_seg_size == current.xlog_seg_size;
    let reuse = if unchanged && !restored.guessed {
        is_freshly_reset(data_dir, &current, seg_size)?
    } else {
        None
    };

    let mut new_segno = match reuse {
        Some(segno) => segno,
        None => find_end_of_wal(data_dir, &current, seg_size)?,
    };
    if let Some(min) = opts.min_wal {
        new_segno = new_segno.max(min.segno(seg_size));
    }

    new.checkPointCopy.redo = new_segno * seg_size as u64 + XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
    // a second reset of a freshly reset cluster writes the same bytes
    if reuse != Some(new_segno) {
        let now = postgres_ffi::xlog_utils::current_pg_time();
        new.checkPointCopy.time = now;
        new.time = now;
    }
    new.state = DBState::Shutdowned as u32;
    new.checkPoint = new.checkPointCopy.redo;
    new.minRecoveryPoint = 0;
    new.minRecoveryPointTLI = 0;
    new.backupStartPoint = 0;
    new.backupEndPoint = 0;
    new.backupEndRequired = false;
    // the server puts the real settings back at startup
    new.wal_level = pg_constants::WAL_LEVEL_MINIMAL;
    new.wal_log_hints = false;
    new.track_commit_timestamp = false;
    new.MaxConnections = pg_constants::DEFAULT_MAX_CONNECTIONS;
    new.max_wal_senders = pg_constants::DEFAULT_MAX_WAL_SENDERS;
    new.max_worker_processes = pg_constants::DEFAULT_MAX_WORKER_PROCESSES;
    new.max_prepared_xacts = pg_constants::DEFAULT_MAX_PREPARED_XACTS;
    new.max_locks_per_xact = pg_constants::DEFAULT_MAX_LOCKS_PER_XACT;

    Ok(ResetPlan {
        current,
        guessed: restored.guessed,
        source: restored.source,
        new,
        seg_size,
        new_segno,
        changes,
    })
}

/// Remove every WAL file and archive status marker, in both layouts.
fn remove_existing_wal(data_dir: &Path) -> WalResult<()> {
    let dir = wal_dir(data_dir);
    for name in list_dir(&dir, |n| IsXLogFileName(n) || IsPartialXLogFileName(n))? {
        let path = dir.join(&name);
        fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
    }
    let status_dir = dir.join(pg_constants::ARCHIVE_STATUS_DIR);
    let is_status = |n: &str| {
        n.len() > 24
            && n[..24].bytes().all(|b| b.is_ascii_hexdigit())
            && [".ready", ".done", ".partial.ready", ".partial.done"].contains(&&n[24..])
    };
    for name in list_dir(&status_dir, is_status)? {
        let path = status_dir.join(&name);
        fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
    }
    let legacy = legacy_wal_dir(data_dir);
    for name in list_dir(&legacy, |n| XLogFromFileNameV0(n).is_some())? {
        let path = legacy.join(&name);
        fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
    }
    Ok(())
}

/// Write the segment the new control file points to: a long page header
/// and one shutdown checkpoint record, the rest zeros.
pub(crate) fn write_empty_wal(data_dir: &Path, cf: &ControlFileData, segno: XLogSegNo, seg_size: usize, no_sync: bool) -> WalResult<()> {
    let segs = SegmentDir::new(wal_dir(data_dir), seg_size, no_sync);
    segs.create_dirs()?;
    let encode_err = |e: utils::bin_ser::SerializeError| WalError::bad_state(format!("could not encode checkpoint: {e}"));

    let checkpoint = cf.checkPointCopy.encode().map_err(encode_err)?;
    let record = encode_main_data_record(
        pg_constants::RM_XLOG_ID,
        pg_constants::XLOG_CHECKPOINT_SHUTDOWN,
        0,
        Lsn(0),
        &checkpoint,
    )
    .map_err(encode_err)?;
    let image = generate_wal_segment(
        segno,
        cf.system_identifier,
        cf.checkPointCopy.ThisTimeLineID,
        seg_size,
        Some(&record),
    )
    .map_err(encode_err)?;

    let file = segs.create(cf.checkPointCopy.ThisTimeLineID, segno, false)?;
    file.pwrite(0, &image[..XLOG_BLCKSZ])?;
    if !no_sync {
        file.fsync()?;
    }
    info!("wrote {}", file.path().display());
    Ok(())
}

/// Carry out `plan`. Guessed values, a control file that could not be
/// read, and an unclean shutdown need `force`.
pub fn apply_reset(data_dir: &Path, plan: &ResetPlan, opts: &ResetOptions, no_sync: bool) -> WalResult<()> {
    if plan.guessed && !opts.force {
        return Err(WalError::bad_state(
            "not proceeding because control file values were guessed; if these values seem acceptable, use -f to force reset",
        ));
    }
    if plan.source != ControlSource::File && !opts.force {
        return Err(WalError::bad_state(
            "pg_control is missing or corrupt and was rebuilt from the write-ahead log; use -f to force reset",
        ));
    }
    if plan.current.state != DBState::Shutdowned as u32 && !opts.force {
        return Err(WalError::bad_state(
            "database server was not shut down cleanly; resetting the write-ahead log might cause data to be lost, use -f to force reset",
        ));
    }
    create_control_file(&control_file_path(data_dir), &plan.new, no_sync)?;
    remove_existing_wal(data_dir)?;
    write_empty_wal(data_dir, &plan.new, plan.new_segno, plan.seg_size, no_sync)?;
    info!("write-ahead log reset, next segment {}", plan.first_segment_name());
    Ok(())
}

/// Plan and, unless it is a dry run, apply a reset.
pub fn reset(data_dir: &Path, opts: &ResetOptions, no_sync: bool) -> WalResult<ResetPlan> {
    if !opts.force {
        check_not_running(data_dir)?;
    }
    let plan = plan_reset(data_dir, opts, None)?;
    if !opts.dry_run {
        apply_reset(data_dir, &plan, opts, no_sync)?;
    }
    Ok(plan)
}

/// Rebuild the control file from the WAL and write it, leaving the WAL
/// alone. An intact control file is left as it is.
pub fn restore(data_dir: &Path, opts: &ResetOptions, no_sync: bool) -> WalResult<Restored> {
    opts.validate()?;
    if !opts.force {
        check_not_running(data_dir)?;
    }
    let default_seg_size = opts.wal_seg_size.unwrap_or(pg_constants::DEFAULT_WAL_SEG_SIZE);
    let mut restored = read_or_restore(data_dir, default_seg_size, None)?;
    if restored.source == ControlSource::File {
        info!("control file is intact, nothing to restore");
        return Ok(restored);
    }
    if restored.guessed && !opts.force {
        return Err(WalError::bad_state(
            "not proceeding because control file values were guessed; use -f to write them anyway",
        ));
    }
    let mut changes = Vec::new();
    apply_options(&mut restored.data, opts, &mut changes);
    if !opts.dry_run {
        create_control_file(&control_file_path(data_dir), &restored.data, no_sync)?;
        info!("control file restored from {:?}", restored.source);
    }
    Ok(restored)
}

/// The control values as the reset tool sees them.
pub fn show(data_dir: &Path) -> WalResult<String> {
    let restored = read_or_restore(data_dir, pg_constants::DEFAULT_WAL_SEG_SIZE, None)?;
    let plan = ResetPlan {
        current: restored.data,
        guessed: restored.guessed,
        source: restored.source,
        new: restored.data,
        seg_size: restored.data.xlog_seg_size as usize,
        new_segno: 0,
        changes: Vec::new(),
    };
    Ok(plan.describe_current())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlfile::ControlFileStore;
    use postgres_ffi::legacy::test_utils::segment_with_checkpoint;
    use postgres_ffi::legacy::CheckPointV0;

    const SEG: usize = 1024 * 1024;

    fn opts() -> ResetOptions {
        ResetOptions {
            force: true,
            wal_seg_size: Some(SEG),
            ..Default::default()
        }
    }

    #[test]
    fn wal_location_syntax() {
        assert_eq!(
            "1,0,1".parse::<MinWalLocation>().unwrap(),
            MinWalLocation { tli: 1, log: 0, seg: 1 }
        );
        assert_eq!(
            "00000002000000010000000A".parse::<MinWalLocation>().unwrap(),
            MinWalLocation { tli: 2, log: 1, seg: 10 }
        );
        assert!("1,2".parse::<MinWalLocation>().is_err());
        assert!("0,0,1".parse::<MinWalLocation>().is_err());
        assert_eq!(MinWalLocation { tli: 1, log: 1, seg: 3 }.segno(SEG), 4096 + 3);
    }

    #[test]
    fn option_validation() {
        assert!(ResetOptions { next_xid: Some(2), ..opts() }.validate().is_err());
        assert!(ResetOptions { next_oid: Some(0), ..opts() }.validate().is_err());
        assert!(ResetOptions { next_multi: Some((5, Some(0))), ..opts() }.validate().is_err());
        assert!(ResetOptions { wal_seg_size: Some(3 << 20), ..opts() }.validate().is_err());
        assert!(ResetOptions { next_xid: Some(1000), next_oid: Some(20000), ..opts() }.validate().is_ok());
    }

    #[test]
    fn guessed_values_need_force() {
        let dir = tempfile::tempdir().unwrap();
        let plan = reset(dir.path(), &ResetOptions { force: false, ..opts() }, true);
        assert!(matches!(plan, Err(WalError::BadState(_))));
        assert!(!control_file_path(dir.path()).exists());
    }

    #[test]
    fn pid_file_blocks_without_force() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("postmaster.pid"), format!("{}\n", std::process::id())).unwrap();
        assert!(check_not_running(dir.path()).is_err());
        assert!(reset(dir.path(), &ResetOptions { force: false, ..opts() }, true).is_err());
        // with force the pid file is not even looked at
        reset(dir.path(), &opts(), true).unwrap();
    }

    #[test]
    fn reset_moves_past_existing_wal() {
        let dir = tempfile::tempdir().unwrap();
        reset(dir.path(), &opts(), true).unwrap();
        // some leftovers, on another timeline too
        let segs = SegmentDir::new(wal_dir(dir.path()), SEG, true);
        segs.create(1, 5, false).unwrap();
        segs.create(3, 2, false).unwrap();
        segs.mark_ready(&segs.segment_name(1, 5)).unwrap();

        let o = ResetOptions { next_oid: Some(20000), next_xid: Some(900), ..opts() };
        let plan = reset(dir.path(), &o, true).unwrap();
        assert_eq!(plan.new_segno, 6);
        assert_eq!(segs.scan_dir().unwrap(), vec![(1, 6)]);
        assert!(!segs.status_path(&segs.segment_name(1, 5), "ready").exists());
        assert!(plan.describe_changes().contains("NextOID:"));

        let cf = ControlFileStore::open(dir.path(), true).unwrap().read();
        assert_eq!(cf.checkPointCopy.nextOid, 20000);
        assert_eq!(cf.checkPointCopy.nextXid.xid(), 900);
        assert_eq!(cf.checkPoint, 6 * SEG as u64 + XLOG_SIZE_OF_XLOG_LONG_PHD as u64);
    }

    #[test]
    fn second_reset_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let first = reset(dir.path(), &opts(), true).unwrap();
        let control = fs::read(control_file_path(dir.path())).unwrap();
        let wal_file = wal_dir(dir.path()).join(first.first_segment_name());
        let wal = fs::read(&wal_file).unwrap();

        let second = reset(dir.path(), &ResetOptions { force: false, ..opts() }, true).unwrap();
        assert_eq!(second.source, ControlSource::File);
        assert_eq!(second.new_segno, first.new_segno);
        assert_eq!(fs::read(control_file_path(dir.path())).unwrap(), control);
        assert_eq!(fs::read(&wal_file).unwrap(), wal);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let plan = reset(dir.path(), &ResetOptions { dry_run: true, ..opts() }, true).unwrap();
        assert!(plan.guessed);
        assert!(plan.describe_current().starts_with("Guessed pg_control values:"));
        assert!(!control_file_path(dir.path()).exists());
        assert!(!wal_dir(dir.path()).exists());
    }

    #[test]
    fn minimum_location_and_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let o = ResetOptions {
            min_wal: Some(MinWalLocation { tli: 4, log: 0, seg: 9 }),
            ..opts()
        };
        let plan = reset(dir.path(), &o, true).unwrap();
        assert_eq!(plan.new_segno, 9);
        assert_eq!(plan.first_segment_name(), XLogFileName(4, 9, SEG));
        assert!(wal_dir(dir.path()).join(XLogFileName(4, 9, SEG)).exists());
    }

    #[test]
    fn corrupt_control_file_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        reset(dir.path(), &opts(), true).unwrap();
        let segs = SegmentDir::new(wal_dir(dir.path()), SEG, true);
        let wal_before = segs.scan_dir().unwrap();
        let zeroed = vec![0u8; pg_constants::PG_CONTROL_FILE_SIZE];
        fs::write(control_file_path(dir.path()), &zeroed).unwrap();

        // the WAL holds a shutdown checkpoint, so nothing is guessed
        let res = reset(dir.path(), &ResetOptions { force: false, ..opts() }, true);
        assert!(matches!(res, Err(WalError::BadState(_))));
        assert_eq!(fs::read(control_file_path(dir.path())).unwrap(), zeroed);
        assert_eq!(segs.scan_dir().unwrap(), wal_before);

        let plan = reset(dir.path(), &opts(), true).unwrap();
        assert!(matches!(plan.source, ControlSource::Wal { shutdown: true, .. }));
        assert!(!plan.guessed);
    }

    #[test]
    fn restore_only_keeps_wal() {
        let dir = tempfile::tempdir().unwrap();
        reset(dir.path(), &opts(), true).unwrap();
        let before = ControlFileStore::open(dir.path(), true).unwrap().read();
        fs::write(control_file_path(dir.path()), vec![0u8; pg_constants::PG_CONTROL_FILE_SIZE]).unwrap();

        let restored = restore(dir.path(), &ResetOptions { force: false, ..opts() }, true).unwrap();
        assert_eq!(restored.source, ControlSource::Wal { checkpoint: Lsn(before.checkPoint), shutdown: true });
        let after = ControlFileStore::open(dir.path(), true).unwrap().read();
        assert_eq!(after.system_identifier, before.system_identifier);
        assert_eq!(after.checkPointCopy, before.checkPointCopy);
        assert_eq!(after.state, DBState::Shutdowned as u32);
        let segs = SegmentDir::new(wal_dir(dir.path()), SEG, true);
        assert_eq!(segs.scan_dir().unwrap().len(), 1);
    }

    #[test]
    fn legacy_wal_checkpoint_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let xlog = legacy_wal_dir(dir.path());
        fs::create_dir_all(&xlog).unwrap();
        let cp = CheckPointV0 {
            redo: RecPtrV0 { xlogid: 0, xrecoff: 0x0200_0010 },
            next_xid: 4000,
            next_oid: 30000,
            time: 1_000_000,
            ..Default::default()
        };
        fs::write(
            xlog.join(XLogFileNameV0(0, 2)),
            segment_with_checkpoint(0, 2, pg_constants::XLOG_CHECKPOINT_SHUTDOWN, &cp),
        )
        .unwrap();

        let restored = read_or_restore(dir.path(), SEG, None).unwrap();
        assert!(!restored.guessed);
        assert!(matches!(restored.source, ControlSource::LegacyWal { shutdown: true, .. }));
        assert_eq!(restored.data.checkPointCopy.nextXid.xid(), 4000);
        assert_eq!(restored.data.checkPointCopy.nextOid, 30000);

        // the new WAL starts after the old files, in the new layout
        let plan = reset(dir.path(), &ResetOptions { wal_seg_size: None, ..opts() }, true).unwrap();
        assert_eq!(plan.seg_size, XLOG_SEG_SIZE_V0);
        assert_eq!(plan.new_segno, 3);
        assert!(list_dir(&xlog, |_| true).unwrap().is_empty());
    }
}
