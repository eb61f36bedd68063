//!
//! Segment files in the WAL directory.
//!
//! A segment is created under a temporary name, filled with zeros to its
//! full size, fsynced and then durably renamed into place, so a file with a
//! segment name always has the final size. Completed segments can be
//! marked for archival with `.ready` files in `archive_status/`; the
//! archiver renames them to `.done`.
//!
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use postgres_ffi::pg_constants::ARCHIVE_STATUS_DIR;
use postgres_ffi::xlog_utils::{IsXLogFileName, XLogFileName, XLogFromFileName};
use postgres_ffi::{TimeLineID, XLogSegNo, XLOG_BLCKSZ};
use tracing::*;
use utils::crashsafe;

use crate::error::{retry_interrupted, WalError, WalResult};

const ZERO_BLOCK: &[u8] = &[0u8; XLOG_BLCKSZ];

/// An open segment file. The descriptor is closed when this is dropped.
#[derive(Debug)]
pub struct SegmentFile {
    tli: TimeLineID,
    segno: XLogSegNo,
    path: PathBuf,
    file: File,
}

impl SegmentFile {
    pub fn tli(&self) -> TimeLineID {
        self.tli
    }

    pub fn segno(&self) -> XLogSegNo {
        self.segno
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pread(&self, off: usize, len: usize) -> WalResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.pread_into(off, &mut buf)?;
        Ok(buf)
    }

    pub fn pread_into(&self, off: usize, buf: &mut [u8]) -> WalResult<()> {
        retry_interrupted(|| self.file.read_exact_at(buf, off as u64))
            .map_err(|e| WalError::io(&self.path, e))
    }

    pub fn pwrite(&self, off: usize, buf: &[u8]) -> WalResult<()> {
        retry_interrupted(|| self.file.write_all_at(buf, off as u64))
            .map_err(|e| WalError::io(&self.path, e))
    }

    pub fn fsync(&self) -> WalResult<()> {
        retry_interrupted(|| self.file.sync_data()).map_err(|e| WalError::io(&self.path, e))
    }
}

/// Segments of one cluster: a directory and a segment size.
#[derive(Debug, Clone)]
pub struct SegmentDir {
    dir: PathBuf,
    seg_size: usize,
    no_sync: bool,
}

/// What [`SegmentDir::remove_old_segments`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemovedSegments {
    pub recycled: Vec<XLogSegNo>,
    pub removed: Vec<XLogSegNo>,
    /// Old enough, but still waiting for the archiver.
    pub kept_for_archive: Vec<XLogSegNo>,
}

impl SegmentDir {
    pub fn new(dir: impl Into<PathBuf>, seg_size: usize, no_sync: bool) -> SegmentDir {
        SegmentDir {
            dir: dir.into(),
            seg_size,
            no_sync,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn seg_size(&self) -> usize {
        self.seg_size
    }

    /// Create the directory and its `archive_status/` if missing.
    pub fn create_dirs(&self) -> WalResult<()> {
        let status = self.dir.join(ARCHIVE_STATUS_DIR);
        crashsafe::create_dir_all(&status).map_err(|e| WalError::io(&status, e))
    }

    pub fn segment_name(&self, tli: TimeLineID, segno: XLogSegNo) -> String {
        XLogFileName(tli, segno, self.seg_size)
    }

    pub fn segment_path(&self, tli: TimeLineID, segno: XLogSegNo) -> PathBuf {
        self.dir.join(self.segment_name(tli, segno))
    }

    /// Open an existing segment for reading and writing.
    pub fn open(&self, tli: TimeLineID, segno: XLogSegNo) -> WalResult<SegmentFile> {
        let path = self.segment_path(tli, segno);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| WalError::io(&path, e))?;
        Ok(SegmentFile {
            tli,
            segno,
            path,
            file,
        })
    }

    /// Open a segment read-only; `None` if it does not exist.
    pub fn open_read(&self, tli: TimeLineID, segno: XLogSegNo) -> WalResult<Option<SegmentFile>> {
        let path = self.segment_path(tli, segno);
        match File::open(&path) {
            Ok(file) => Ok(Some(SegmentFile {
                tli,
                segno,
                path,
                file,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WalError::io(&path, e)),
        }
    }

    /// Create a segment filled with zeros. With `use_existing`, a segment
    /// that is already there is opened instead; otherwise it is replaced.
    pub fn create(&self, tli: TimeLineID, segno: XLogSegNo, use_existing: bool) -> WalResult<SegmentFile> {
        let path = self.segment_path(tli, segno);
        if use_existing && path.exists() {
            return self.open(tli, segno);
        }

        let tmp_path = self.dir.join(format!("xlogtemp.{}", std::process::id()));
        let res = self.write_zeroed(&tmp_path);
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp_path);
            return Err(WalError::io(&tmp_path, e));
        }
        crashsafe::durable_rename(&tmp_path, &path, !self.no_sync)
            .map_err(|e| WalError::io(&path, e))?;
        debug!("created WAL segment {}", path.display());
        self.open(tli, segno)
    }

    fn write_zeroed(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        for _ in 0..(self.seg_size / XLOG_BLCKSZ) {
            file.write_all(ZERO_BLOCK)?;
        }
        if !self.no_sync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Every complete segment in the directory, ordered by timeline and
    /// segment number. Partial and history files are skipped.
    pub fn scan_dir(&self) -> WalResult<Vec<(TimeLineID, XLogSegNo)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WalError::io(&self.dir, e)),
        };
        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| WalError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !IsXLogFileName(name) {
                continue;
            }
            if let Some((segno, tli)) = XLogFromFileName(name, self.seg_size) {
                segments.push((tli, segno));
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    pub fn unlink(&self, tli: TimeLineID, segno: XLogSegNo) -> WalResult<()> {
        let path = self.segment_path(tli, segno);
        fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
        for suffix in ["ready", "done"] {
            let status = self.status_path(&self.segment_name(tli, segno), suffix);
            match fs::remove_file(&status) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(WalError::io(&status, e)),
            }
        }
        Ok(())
    }

    pub fn rename(&self, old: (TimeLineID, XLogSegNo), new: (TimeLineID, XLogSegNo)) -> WalResult<()> {
        let old_path = self.segment_path(old.0, old.1);
        let new_path = self.segment_path(new.0, new.1);
        crashsafe::durable_rename(&old_path, &new_path, !self.no_sync)
            .map_err(|e| WalError::io(&new_path, e))
    }

    /// Retire segments of `tli` older than `keep_from`. Up to `max_recycle`
    /// of them are renamed to the first free names from `recycle_from`
    /// onwards, the rest are deleted. With `archive_mode`, segments the
    /// archiver has not marked done are left alone.
    pub fn remove_old_segments(
        &self,
        tli: TimeLineID,
        keep_from: XLogSegNo,
        recycle_from: XLogSegNo,
        max_recycle: usize,
        archive_mode: bool,
    ) -> WalResult<RemovedSegments> {
        let mut result = RemovedSegments::default();
        let mut next_free = recycle_from;
        for (seg_tli, segno) in self.scan_dir()? {
            if seg_tli > tli || segno >= keep_from {
                continue;
            }
            let name = self.segment_name(seg_tli, segno);
            if archive_mode && !self.is_archived(&name) {
                result.kept_for_archive.push(segno);
                continue;
            }
            if seg_tli == tli && result.recycled.len() < max_recycle {
                while self.segment_path(tli, next_free).exists() {
                    next_free += 1;
                }
                self.rename((seg_tli, segno), (tli, next_free))?;
                let done = self.status_path(&name, "done");
                let _ = fs::remove_file(done);
                debug!("recycled WAL segment {name} as {}", self.segment_name(tli, next_free));
                result.recycled.push(segno);
                next_free += 1;
            } else {
                self.unlink(seg_tli, segno)?;
                debug!("removed WAL segment {name}");
                result.removed.push(segno);
            }
        }
        Ok(result)
    }

    pub fn status_path(&self, file_name: &str, suffix: &str) -> PathBuf {
        self.dir
            .join(ARCHIVE_STATUS_DIR)
            .join(format!("{file_name}.{suffix}"))
    }

    /// Leave a `.ready` marker for `file_name` (a segment or history file).
    pub fn mark_ready(&self, file_name: &str) -> WalResult<()> {
        let path = self.status_path(file_name, "ready");
        let res = File::create(&path).and_then(|f| {
            if !self.no_sync {
                f.sync_all()?;
            }
            Ok(())
        });
        res.map_err(|e| WalError::io(&path, e))
    }

    /// Called once the archiver has stored `file_name`.
    pub fn mark_done(&self, file_name: &str) -> WalResult<()> {
        let ready = self.status_path(file_name, "ready");
        let done = self.status_path(file_name, "done");
        crashsafe::durable_rename(&ready, &done, !self.no_sync).map_err(|e| WalError::io(&done, e))
    }

    /// Mark `file_name` as not to be archived, whether or not it was
    /// waiting for the archiver.
    pub fn force_done(&self, file_name: &str) -> WalResult<()> {
        if self.status_path(file_name, "ready").exists() {
            return self.mark_done(file_name);
        }
        let path = self.status_path(file_name, "done");
        let res = File::create(&path).and_then(|f| {
            if !self.no_sync {
                f.sync_all()?;
            }
            Ok(())
        });
        res.map_err(|e| WalError::io(&path, e))
    }

    /// True unless the file waits for the archiver.
    pub fn is_archived(&self, file_name: &str) -> bool {
        !self.status_path(file_name, "ready").exists()
            || self.status_path(file_name, "done").exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: usize = 1024 * 1024;

    fn segdir(dir: &Path) -> SegmentDir {
        let segs = SegmentDir::new(dir.join("pg_wal"), SEG, true);
        segs.create_dirs().unwrap();
        segs
    }

    #[test]
    fn create_prefills_and_scan_orders() {
        let dir = tempfile::tempdir().unwrap();
        let segs = segdir(dir.path());
        let h = segs.create(2, 3, false).unwrap();
        segs.create(1, 7, false).unwrap();
        segs.create(1, 2, false).unwrap();
        assert_eq!(fs::metadata(h.path()).unwrap().len(), SEG as u64);
        assert!(h.pread(SEG - 16, 16).unwrap().iter().all(|b| *b == 0));

        h.pwrite(100, b"hello").unwrap();
        let again = segs.create(2, 3, true).unwrap();
        assert_eq!(again.pread(100, 5).unwrap(), b"hello");

        fs::write(dir.path().join("pg_wal/00000002.history"), b"").unwrap();
        assert_eq!(segs.scan_dir().unwrap(), vec![(1, 2), (1, 7), (2, 3)]);
        assert!(segs.open_read(5, 5).unwrap().is_none());
    }

    #[test]
    fn recycle_and_archive_status() {
        let dir = tempfile::tempdir().unwrap();
        let segs = segdir(dir.path());
        for segno in 1..=4 {
            segs.create(1, segno, false).unwrap();
        }
        let name3 = segs.segment_name(1, 3);
        segs.mark_ready(&name3).unwrap();
        assert!(!segs.is_archived(&name3));

        let res = segs.remove_old_segments(1, 4, 5, 1, true).unwrap();
        assert_eq!(res.recycled, vec![1]);
        assert_eq!(res.removed, vec![2]);
        assert_eq!(res.kept_for_archive, vec![3]);
        assert_eq!(segs.scan_dir().unwrap(), vec![(1, 3), (1, 4), (1, 5)]);

        segs.mark_done(&name3).unwrap();
        assert!(segs.is_archived(&name3));
        let res = segs.remove_old_segments(1, 4, 6, 0, true).unwrap();
        assert_eq!(res.removed, vec![3]);
        assert!(!segs.status_path(&name3, "done").exists());
    }
}
