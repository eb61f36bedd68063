//!
//! Human-readable dump of a control file, as printed by `pg_controldata`.
//!
use std::fmt::{Display, Write};

use chrono::{Local, TimeZone};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::XLogFileName;
use postgres_ffi::{ControlFileData, DBState};
use utils::lsn::Lsn;

/// Column where values start.
const LABEL_WIDTH: usize = 38;

/// Append `label: value`, the value aligned with the others.
pub(crate) fn labeled(out: &mut String, label: &str, value: impl Display) {
    let label = format!("{label}:");
    let _ = writeln!(out, "{label:<width$}{value}", width = LABEL_WIDTH);
}

pub(crate) fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

fn format_time(t: i64) -> String {
    match Local.timestamp_opt(t, 0).single() {
        Some(dt) => dt.format("%a %d %b %Y %H:%M:%S %Z").to_string(),
        None => "???".to_string(),
    }
}

fn wal_level_str(level: i32) -> &'static str {
    match level {
        pg_constants::WAL_LEVEL_MINIMAL => "minimal",
        pg_constants::WAL_LEVEL_REPLICA => "replica",
        pg_constants::WAL_LEVEL_LOGICAL => "logical",
        _ => "unrecognized wal_level",
    }
}

/// Every field, one per line.
pub fn format_control_data(cf: &ControlFileData) -> String {
    let cp = &cf.checkPointCopy;
    let mut out = String::new();

    labeled(&mut out, "pg_control version number", cf.pg_control_version);
    labeled(&mut out, "Catalog version number", cf.catalog_version_no);
    labeled(&mut out, "Database system identifier", cf.system_identifier);
    labeled(&mut out, "Database cluster state", DBState::describe(cf.state));
    labeled(&mut out, "pg_control last modified", format_time(cf.time));
    labeled(&mut out, "Latest checkpoint location", Lsn(cf.checkPoint));
    labeled(&mut out, "Latest checkpoint's REDO location", Lsn(cp.redo));

    // the segment name needs a usable segment size
    let redo_file = if cf.xlog_seg_size > 0 {
        let segno = cp.redo / cf.xlog_seg_size as u64;
        XLogFileName(cp.ThisTimeLineID, segno, cf.xlog_seg_size as usize)
    } else {
        "???".to_string()
    };
    labeled(&mut out, "Latest checkpoint's REDO WAL file", redo_file);
    labeled(&mut out, "Latest checkpoint's TimeLineID", cp.ThisTimeLineID);
    labeled(&mut out, "Latest checkpoint's PrevTimeLineID", cp.PrevTimeLineID);
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
    labeled(&mut out, "Time of latest checkpoint", format_time(cp.time));
    labeled(&mut out, "Fake LSN counter for unlogged rels", Lsn(cf.unloggedLSN));
    labeled(&mut out, "Minimum recovery ending location", Lsn(cf.minRecoveryPoint));
    labeled(&mut out, "Min recovery ending loc's timeline", cf.minRecoveryPointTLI);
    labeled(&mut out, "Backup start location", Lsn(cf.backupStartPoint));
    labeled(&mut out, "Backup end location", Lsn(cf.backupEndPoint));
    labeled(
        &mut out,
        "End-of-backup record required",
        if cf.backupEndRequired { "yes" } else { "no" },
    );
    labeled(&mut out, "wal_level setting", wal_level_str(cf.wal_level));
    labeled(&mut out, "wal_log_hints setting", on_off(cf.wal_log_hints));
    labeled(&mut out, "max_connections setting", cf.MaxConnections);
    labeled(&mut out, "max_worker_processes setting", cf.max_worker_processes);
    labeled(&mut out, "max_wal_senders setting", cf.max_wal_senders);
    labeled(&mut out, "max_prepared_xacts setting", cf.max_prepared_xacts);
    labeled(&mut out, "max_locks_per_xact setting", cf.max_locks_per_xact);
    labeled(&mut out, "track_commit_timestamp setting", on_off(cf.track_commit_timestamp));
    format_build_settings(&mut out, cf);
    labeled(&mut out, "Mock authentication nonce", hex::encode(cf.mock_authentication_nonce));
    labeled(&mut out, "LC_COLLATE", cf.lc_collate_str());
    labeled(&mut out, "LC_CTYPE", cf.lc_ctype_str());
    out
}

/// The compile-time parameters, shared with the reset tool's listing.
pub(crate) fn format_build_settings(out: &mut String, cf: &ControlFileData) {
    labeled(out, "Maximum data alignment", cf.maxAlign);
    labeled(out, "Database block size", cf.blcksz);
    labeled(out, "Blocks per segment of large relation", cf.relseg_size);
    labeled(out, "WAL block size", cf.xlog_blcksz);
    labeled(out, "Bytes per WAL segment", cf.xlog_seg_size);
    labeled(out, "Maximum length of identifiers", cf.nameDataLen);
    labeled(out, "Maximum columns in an index", cf.indexMaxKeys);
    labeled(out, "Maximum size of a TOAST chunk", cf.toast_max_chunk_size);
    labeled(out, "Size of a large-object chunk", cf.loblksize);
    labeled(out, "Date/time type storage", "64-bit integers");
    labeled(
        out,
        "Float8 argument passing",
        if cf.float8ByVal { "by value" } else { "by reference" },
    );
    labeled(out, "Data page checksum version", cf.data_checksum_version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlfile::guessed_defaults;

    fn value_of<'a>(out: &'a str, label: &str) -> Option<&'a str> {
        out.lines()
            .find(|l| l.starts_with(&format!("{label}:")))
            .map(|l| l[LABEL_WIDTH..].trim_end())
    }

    #[test]
    fn values_are_aligned() {
        let mut cf = guessed_defaults(16 * 1024 * 1024);
        cf.checkPoint = 0x0100_0028;
        cf.checkPointCopy.redo = 0x0100_0028;
        cf.checkPointCopy.nextXid = postgres_ffi::FullTransactionId::new(2, 700);
        let out = format_control_data(&cf);

        for line in out.lines() {
            let colon = line.find(':').unwrap();
            assert!(colon < LABEL_WIDTH, "{line}");
        }
        assert_eq!(value_of(&out, "Database cluster state"), Some("shut down"));
        assert_eq!(value_of(&out, "Latest checkpoint location"), Some("0/1000028"));
        assert_eq!(
            value_of(&out, "Latest checkpoint's REDO WAL file"),
            Some("000000010000000000000001")
        );
        assert_eq!(value_of(&out, "Latest checkpoint's NextXID"), Some("2:700"));
        assert_eq!(value_of(&out, "Latest checkpoint's NextOID"), Some("10000"));
        assert_eq!(value_of(&out, "wal_level setting"), Some("minimal"));
        assert_eq!(value_of(&out, "Bytes per WAL segment"), Some("16777216"));
        // the label that fills the whole column is followed directly by its value
        assert_eq!(value_of(&out, "Latest checkpoint's oldestCommitTsXid"), Some("0"));
    }

    #[test]
    fn zero_segment_size_does_not_panic() {
        let mut cf = guessed_defaults(16 * 1024 * 1024);
        cf.xlog_seg_size = 0;
        let out = format_control_data(&cf);
        assert_eq!(value_of(&out, "Latest checkpoint's REDO WAL file"), Some("???"));
    }
}
