//!
//! Timeline history files.
//!
//! `TTTTTTTT.history` lists the ancestors of timeline `T`, one per line:
//! `<parent tli>\t<switchpoint>\t<reason>`. Blank lines and lines starting
//! with `#` are ignored. The timeline itself is not in the file; it is added
//! in memory as the last entry, open-ended.
//!
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::str::FromStr;

use postgres_ffi::xlog_utils::TLHistoryFileName;
use postgres_ffi::TimeLineID;
use tracing::*;
use utils::crashsafe;
use utils::lsn::Lsn;

use crate::error::{WalError, WalResult};
use crate::segment::SegmentDir;

/// One timeline's span of the WAL. `end` is invalid for the newest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    pub begin: Lsn,
    pub end: Lsn,
}

impl TimelineHistoryEntry {
    pub fn contains(&self, lsn: Lsn) -> bool {
        lsn >= self.begin && (!self.end.is_valid() || lsn < self.end)
    }
}

/// Parse history file `content` of timeline `tli`. Entries are ordered
/// oldest first and end with `tli` itself.
pub fn parse_history(tli: TimeLineID, content: &str) -> WalResult<Vec<TimelineHistoryEntry>> {
    let bad = |msg: String| WalError::corruption(Lsn::INVALID, format!("history file of timeline {tli}: {msg}"));

    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    let mut prev_end = Lsn::INVALID;
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parent = fields
            .next()
            .and_then(|f| f.parse::<TimeLineID>().ok())
            .ok_or_else(|| bad(format!("syntax error in \"{line}\": expected a timeline ID")))?;
        let switchpoint = fields
            .next()
            .and_then(|f| Lsn::from_str(f).ok())
            .ok_or_else(|| bad(format!("syntax error in \"{line}\": expected a switchpoint")))?;

        if let Some(last) = entries.last() {
            if parent <= last.tli {
                return Err(bad("timeline IDs must be in increasing sequence".to_string()));
            }
        }
        if switchpoint <= prev_end {
            return Err(bad("switchpoints must be in increasing sequence".to_string()));
        }
        entries.push(TimelineHistoryEntry {
            tli: parent,
            begin: prev_end,
            end: switchpoint,
        });
        prev_end = switchpoint;
    }

    if let Some(last) = entries.last() {
        if tli <= last.tli {
            return Err(bad("timeline ID must be greater than its parents'".to_string()));
        }
    }
    entries.push(TimelineHistoryEntry {
        tli,
        begin: prev_end,
        end: Lsn::INVALID,
    });
    Ok(entries)
}

/// History of `tli`. Timeline 1, and any timeline without a history file,
/// has no ancestors.
pub fn read_history(segments: &SegmentDir, tli: TimeLineID) -> WalResult<Vec<TimelineHistoryEntry>> {
    if tli == 1 {
        return parse_history(1, "");
    }
    let path = segments.dir().join(TLHistoryFileName(tli));
    match fs::read_to_string(&path) {
        Ok(content) => parse_history(tli, &content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => parse_history(tli, ""),
        Err(e) => Err(WalError::io(&path, e)),
    }
}

pub fn history_exists(segments: &SegmentDir, tli: TimeLineID) -> bool {
    tli == 1 || segments.dir().join(TLHistoryFileName(tli)).exists()
}

/// Newest timeline with a history file, probing upwards from `start_tli`.
pub fn newest_existing(segments: &SegmentDir, start_tli: TimeLineID) -> TimeLineID {
    let mut newest = start_tli;
    let mut probe = start_tli + 1;
    while history_exists(segments, probe) {
        newest = probe;
        probe += 1;
    }
    newest
}

/// Timeline the WAL at `lsn` belongs to.
pub fn tli_of(lsn: Lsn, history: &[TimelineHistoryEntry]) -> Option<TimeLineID> {
    history.iter().find(|e| e.contains(lsn)).map(|e| e.tli)
}

/// Where `tli` ends and which timeline follows it. The newest timeline has
/// not ended: its switchpoint is invalid and it is its own successor.
pub fn switchpoint(tli: TimeLineID, history: &[TimelineHistoryEntry]) -> WalResult<(Lsn, TimeLineID)> {
    let pos = history.iter().position(|e| e.tli == tli).ok_or_else(|| {
        WalError::bad_state(format!("requested timeline {tli} is not in this server's history"))
    })?;
    match history.get(pos + 1) {
        Some(next) => Ok((history[pos].end, next.tli)),
        None => Ok((Lsn::INVALID, tli)),
    }
}

/// Create the history file of `new_tli`, branching off `parent_tli` at
/// `switchpoint`. The parent's history is copied and one line appended.
/// The file is written under a temporary name, synced and hard-linked into
/// place, so an existing history file is never overwritten.
pub fn write_history(
    segments: &SegmentDir,
    new_tli: TimeLineID,
    parent_tli: TimeLineID,
    switchpoint: Lsn,
    reason: &str,
    archive_mode: bool,
) -> WalResult<()> {
    if new_tli <= parent_tli {
        return Err(WalError::bad_state(format!(
            "new timeline {new_tli} is not newer than parent {parent_tli}"
        )));
    }
    let parent_path = segments.dir().join(TLHistoryFileName(parent_tli));
    let mut content = match fs::read_to_string(&parent_path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(WalError::io(&parent_path, e)),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    let _ = writeln!(content, "{parent_tli}\t{switchpoint}\t{reason}");
    // refuse to write something we could not read back
    parse_history(new_tli, &content)?;

    let name = TLHistoryFileName(new_tli);
    let path = segments.dir().join(&name);
    let tmp_path = segments.dir().join(format!("xlogtemp.{}", std::process::id()));
    let res = (|| -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::hard_link(&tmp_path, &path)?;
        fs::remove_file(&tmp_path)?;
        crashsafe::fsync_file_and_parent(&path)
    })();
    if let Err(e) = res {
        let _ = fs::remove_file(&tmp_path);
        return Err(WalError::io(&path, e));
    }
    info!("created history file {name}: timeline {new_tli} branches off {parent_tli} at {switchpoint}");

    if archive_mode {
        segments.mark_ready(&name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_adds_tip_and_checks_order() {
        let h = parse_history(3, "1\t0/3000000\tno recovery target specified\n\n# note\n2\t0/5000158\tbefore 2000-01-01\n").unwrap();
        assert_eq!(
            h,
            vec![
                TimelineHistoryEntry { tli: 1, begin: Lsn(0), end: Lsn(0x300_0000) },
                TimelineHistoryEntry { tli: 2, begin: Lsn(0x300_0000), end: Lsn(0x500_0158) },
                TimelineHistoryEntry { tli: 3, begin: Lsn(0x500_0158), end: Lsn::INVALID },
            ]
        );
        assert_eq!(tli_of(Lsn(0x100), &h), Some(1));
        assert_eq!(tli_of(Lsn(0x300_0000), &h), Some(2));
        assert_eq!(tli_of(Lsn(0x9000_0000), &h), Some(3));
        assert_eq!(switchpoint(1, &h).unwrap(), (Lsn(0x300_0000), 2));
        assert_eq!(switchpoint(3, &h).unwrap(), (Lsn::INVALID, 3));
        assert!(switchpoint(7, &h).is_err());

        assert!(parse_history(3, "2\t0/3000000\t\n1\t0/5000000\t\n").is_err());
        assert!(parse_history(3, "1\t0/5000000\t\n2\t0/3000000\t\n").is_err());
        assert!(parse_history(2, "1\tzzz\n").is_err());
        assert!(parse_history(2, "2\t0/10\tx\n").is_err());
    }

    #[test]
    fn write_then_read_chain() {
        let dir = tempfile::tempdir().unwrap();
        let segs = SegmentDir::new(dir.path().join("pg_wal"), 1 << 20, true);
        segs.create_dirs().unwrap();

        write_history(&segs, 2, 1, Lsn(0x200_0000), "promoted", true).unwrap();
        write_history(&segs, 3, 2, Lsn(0x380_0000), "promoted again", false).unwrap();
        assert!(write_history(&segs, 3, 2, Lsn(0x390_0000), "again", false).is_err());

        let h = read_history(&segs, 3).unwrap();
        assert_eq!(h.iter().map(|e| e.tli).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(h[1].end, Lsn(0x380_0000));
        assert_eq!(newest_existing(&segs, 1), 3);
        assert_eq!(newest_existing(&segs, 3), 3);
        assert!(segs.status_path("00000002.history", "ready").exists());
        assert!(!segs.status_path("00000003.history", "ready").exists());
    }
}
