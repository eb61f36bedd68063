//!
//! One cluster's WAL subsystem: its control file, key manager, writer and
//! resource manager table, opened together and shut down together.
//!
//! Opening reads the control file and checks that the latest checkpoint
//! record is in place. A cluster that was shut down cleanly continues
//! writing after the last valid record; any other cluster first replays
//! every record from the checkpoint's redo pointer and then writes an
//! end-of-recovery checkpoint.
//!
use std::sync::{Arc, Weak};

use anyhow::Context;
use parking_lot::RwLock;
use pg_tde::{FileKeyring, KeyMapXLog, KeyType, TdeKeyManager, GLOBAL_DATA_TDE_OID};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::{current_pg_time, XLOG_SIZE_OF_XLOG_LONG_PHD};
use postgres_ffi::{CheckPoint, ControlFileData, DBState, Oid, RelFileNode, TimeLineID};
use tracing::*;
use utils::lsn::Lsn;

use crate::assembler::RecordBuilder;
use crate::config::WalConfig;
use crate::controlfile::{control_file_path, create_control_file, guessed_defaults, ControlFileStore};
use crate::crypt::WalIo;
use crate::error::{WalError, WalResult};
use crate::reader::{WalEnd, XLogReader};
use crate::resetwal::write_empty_wal;
use crate::rmgr::{RedoRecord, Rmgr, RmgrHandler, RmgrTable};
use crate::segment::SegmentDir;
use crate::timeline::{newest_existing, read_history, write_history, TimelineHistoryEntry};
use crate::writer::{WriterSetup, XLogWriter};

/// Keyring id recorded with principal keys from the configured file keyring.
const FILE_KEYRING_ID: u32 = 1;

/// Retired segments renamed for reuse at each checkpoint; older ones are
/// deleted.
const MAX_RECYCLED_SEGMENTS: usize = 2;

/// Segment a new cluster starts writing in.
const FIRST_SEGMENT: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointKind {
    /// Skipped if nothing was logged since the last checkpoint.
    Online,
    Forced,
    EndOfRecovery { prev_tli: TimeLineID },
    Shutdown,
}

/// Routes key file changes into the WAL. Swapped over to the new writer
/// when the timeline changes.
struct TdeXLog {
    writer: RwLock<Weak<XLogWriter>>,
}

impl KeyMapXLog for TdeXLog {
    fn log_tde_record(&self, info: u8, payload: &[u8]) -> anyhow::Result<Lsn> {
        let writer = self
            .writer
            .read()
            .upgrade()
            .context("WAL writer is shut down")?;
        let mut builder = RecordBuilder::begin(&writer);
        builder.register_data(payload);
        let rec = builder.insert(pg_constants::RM_TDE_ID, info)?;
        // the key files are rewritten as soon as this returns
        writer.flush(rec.end_lsn)?;
        Ok(rec.start_lsn)
    }
}

struct TdeRedo(Arc<TdeKeyManager>);

impl RmgrHandler for TdeRedo {
    fn name(&self) -> &str {
        Rmgr::Tde.name()
    }

    fn redo(&self, record: &RedoRecord<'_>) -> WalResult<()> {
        self.0.redo(record.info(), &record.main_data())?;
        Ok(())
    }
}

pub struct WalSubsystem {
    config: WalConfig,
    control: ControlFileStore,
    tde: Option<Arc<TdeKeyManager>>,
    tde_xlog: Option<Arc<TdeXLog>>,
    rmgrs: RmgrTable,
    writer: Arc<XLogWriter>,
    history: Vec<TimelineHistoryEntry>,
}

fn invalid_config(e: anyhow::Error) -> WalError {
    WalError::bad_state(format!("invalid configuration: {e:#}"))
}

fn open_key_manager(config: &WalConfig) -> WalResult<Option<Arc<TdeKeyManager>>> {
    let Some(keyring) = &config.keyring_file else {
        if config.encrypt_wal {
            return Err(WalError::KeyUnavailable(
                "encrypt_wal is on but no keyring_file is configured".to_string(),
            ));
        }
        return Ok(None);
    };
    let keyring = if keyring.is_absolute() {
        keyring.clone()
    } else {
        config.data_dir.join(keyring)
    };
    let provider = Arc::new(FileKeyring::new(FILE_KEYRING_ID, keyring.into_std_path_buf()));
    let manager = TdeKeyManager::open(config.key_dir().into_std_path_buf(), provider)?;
    if config.encrypt_wal && !manager.has_principal_key(GLOBAL_DATA_TDE_OID)? {
        return Err(WalError::KeyUnavailable(
            "encrypt_wal is on but no server principal key is set".to_string(),
        ));
    }
    Ok(Some(Arc::new(manager)))
}

fn wal_io(config: &WalConfig, seg_size: usize, tde: Option<Arc<TdeKeyManager>>) -> WalResult<WalIo> {
    let segments = SegmentDir::new(config.wal_dir().into_std_path_buf(), seg_size, config.no_sync);
    segments.create_dirs()?;
    Ok(WalIo::new(segments, tde))
}

fn writer_setup(config: &WalConfig, cf: &ControlFileData, tli: TimeLineID, end: &WalEnd) -> WriterSetup {
    WriterSetup {
        tli,
        system_id: cf.system_identifier,
        start: end.end_lsn,
        prev_record: end.last_record.unwrap_or(Lsn::INVALID),
        redo: Lsn(cf.checkPointCopy.redo),
        insertion_slots: config.insertion_slots,
        wal_buffers: config.wal_buffers,
        full_page_writes: config.full_page_writes,
        archive_mode: config.archive_mode,
        no_sync: config.no_sync,
        writer_delay: Some(config.wal_writer_delay),
    }
}

fn is_checkpoint(info: u8) -> bool {
    let info = info & pg_constants::XLR_RMGR_INFO_MASK;
    info == pg_constants::XLOG_CHECKPOINT_SHUTDOWN || info == pg_constants::XLOG_CHECKPOINT_ONLINE
}

/// Apply every record from `from` on, until the WAL ends.
fn replay(reader: &XLogReader<'_>, rmgrs: &RmgrTable, from: Lsn) -> WalResult<WalEnd> {
    info!("redo starts at {from}");
    rmgrs.startup_all();
    let mut cursor = reader.open_at(from);
    let mut end = WalEnd {
        end_lsn: from,
        last_record: None,
        records: 0,
    };
    loop {
        let rec = match reader.read_record(&mut cursor) {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) if e.is_corruption() => {
                info!("WAL ends at an invalid record: {e}");
                break;
            }
            Err(e) => return Err(e),
        };
        trace!("redo {} at {}", rmgrs.identify(&rec.decoded), rec.lsn);
        rmgrs.redo(&RedoRecord {
            lsn: rec.lsn,
            end_lsn: rec.end_lsn,
            decoded: &rec.decoded,
        })?;
        end.end_lsn = rec.end_lsn;
        end.last_record = Some(rec.lsn);
        end.records += 1;
    }
    rmgrs.cleanup_all();
    info!("redo done at {}, {} records replayed", end.end_lsn, end.records);
    Ok(end)
}

impl WalSubsystem {
    /// Create a cluster at `config.data_dir`: a control file with a new
    /// system identifier and a first segment holding a shutdown checkpoint.
    /// `principal_key` becomes the server principal key, created in the
    /// configured keyring if it is not there yet.
    pub fn bootstrap(config: &WalConfig, principal_key: Option<&str>) -> WalResult<ControlFileData> {
        config.validate().map_err(invalid_config)?;
        let data_dir = config.data_dir.as_std_path();
        let control_path = control_file_path(data_dir);
        if control_path.exists() {
            return Err(WalError::bad_state(format!(
                "{} already exists, not overwriting an existing cluster",
                control_path.display()
            )));
        }
        utils::crashsafe::create_dir_all(data_dir).map_err(|e| WalError::io(data_dir, e))?;

        let seg_size = config.wal_segment_size;
        let mut cf = guessed_defaults(seg_size);
        let checkpoint = FIRST_SEGMENT * seg_size as u64 + XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
        cf.checkPoint = checkpoint;
        cf.checkPointCopy.redo = checkpoint;
        cf.checkPointCopy.fullPageWrites = config.full_page_writes;
        write_empty_wal(data_dir, &cf, FIRST_SEGMENT, seg_size, config.no_sync)?;
        create_control_file(&control_path, &cf, config.no_sync)?;

        if let Some(name) = principal_key {
            let offline = WalConfig {
                encrypt_wal: false,
                ..config.clone()
            };
            let tde = open_key_manager(&offline)?.ok_or_else(|| {
                WalError::KeyUnavailable("a principal key needs a keyring_file".to_string())
            })?;
            tde.set_principal_key(GLOBAL_DATA_TDE_OID, name)?;
        }
        info!(
            "created cluster {} at {}",
            cf.system_identifier, config.data_dir
        );
        Ok(cf)
    }

    /// Start the subsystem of an existing cluster. `rmgrs` holds the redo
    /// handlers of everything outside the WAL core; it is sealed here.
    pub fn open(config: WalConfig, mut rmgrs: RmgrTable) -> WalResult<WalSubsystem> {
        config.validate().map_err(invalid_config)?;
        let control = ControlFileStore::open(config.data_dir.as_std_path(), config.no_sync)?;
        let cf = control.read();
        let seg_size = cf.xlog_seg_size as usize;
        if seg_size != config.wal_segment_size {
            warn!(
                "cluster uses {seg_size} byte WAL segments, ignoring configured {}",
                config.wal_segment_size
            );
        }

        let tde = open_key_manager(&config)?;
        if let Some(tde) = &tde {
            rmgrs.set_builtin_handler(Rmgr::Tde, Arc::new(TdeRedo(Arc::clone(tde))))?;
        }
        rmgrs.seal();

        let tli = cf.checkPointCopy.ThisTimeLineID;
        let io = wal_io(&config, seg_size, tde.clone())?;
        let history = read_history(io.segments(), tli)?;
        let checkpoint = Lsn(cf.checkPoint);
        let clean = cf.state == DBState::Shutdowned as u32;
        info!(
            "database system was {}, latest checkpoint at {checkpoint} on timeline {tli}",
            DBState::describe(cf.state)
        );

        let end = {
            let reader = XLogReader::new(&io, history.clone()).with_system_id(cf.system_identifier);
            let mut cursor = reader.open_at(checkpoint);
            match reader.read_record(&mut cursor)? {
                Some(rec) if rec.rmgr() == Some(Rmgr::Xlog) && is_checkpoint(rec.info()) => {}
                _ => {
                    return Err(WalError::corruption(
                        checkpoint,
                        "could not locate a valid checkpoint record",
                    ))
                }
            }
            if clean {
                reader.find_end(checkpoint, None)?
            } else {
                control.update(|cf| cf.state = DBState::InCrashRecovery as u32);
                replay(&reader, &rmgrs, Lsn(cf.checkPointCopy.redo))?
            }
        };

        let writer = XLogWriter::open(io, writer_setup(&config, &cf, tli, &end))?;
        let tde_xlog = tde.as_ref().map(|tde| {
            let xlog = Arc::new(TdeXLog {
                writer: RwLock::new(Arc::downgrade(&writer)),
            });
            tde.attach_xlog(xlog.clone());
            xlog
        });
        if let Some(tde) = &tde {
            // a fresh key for every start, so no two copies of the cluster
            // encrypt different WAL with the same key and IV
            tde.start_wal_key(config.encrypt_wal)?;
        }

        let subsystem = WalSubsystem {
            config,
            control,
            tde,
            tde_xlog,
            rmgrs,
            writer,
            history,
        };
        if clean {
            subsystem
                .control
                .update(|cf| cf.state = DBState::InProduction as u32);
        } else {
            subsystem.write_checkpoint(CheckpointKind::EndOfRecovery { prev_tli: tli })?;
        }
        info!("database system is ready, WAL continues at {}", end.end_lsn);
        Ok(subsystem)
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn control_data(&self) -> ControlFileData {
        self.control.read()
    }

    pub fn writer(&self) -> &Arc<XLogWriter> {
        &self.writer
    }

    pub fn tde(&self) -> Option<&Arc<TdeKeyManager>> {
        self.tde.as_ref()
    }

    pub fn rmgrs(&self) -> &RmgrTable {
        &self.rmgrs
    }

    pub fn timeline(&self) -> TimeLineID {
        self.writer.timeline()
    }

    pub fn history(&self) -> &[TimelineHistoryEntry] {
        &self.history
    }

    /// Start assembling a record.
    pub fn record(&self) -> RecordBuilder<'_> {
        RecordBuilder::begin(&self.writer)
    }

    /// Reader over this cluster's flushed WAL.
    pub fn reader(&self) -> XLogReader<'_> {
        XLogReader::new(self.writer.io(), self.history.clone()).with_system_id(self.writer.system_id())
    }

    /// Write an online checkpoint. Unless `force` is set, nothing is written
    /// if no important record was logged since the last one. Returns the
    /// location of the latest checkpoint.
    pub fn checkpoint(&self, force: bool) -> WalResult<Lsn> {
        let kind = if force {
            CheckpointKind::Forced
        } else {
            CheckpointKind::Online
        };
        self.write_checkpoint(kind)
    }

    fn write_checkpoint(&self, kind: CheckpointKind) -> WalResult<Lsn> {
        let writer = &self.writer;
        let prev = self.control.read();
        if kind == CheckpointKind::Online && writer.last_important() <= Lsn(prev.checkPoint) {
            debug!("skipping checkpoint, nothing logged since {}", Lsn(prev.checkPoint));
            return Ok(Lsn(prev.checkPoint));
        }

        let tli = writer.timeline();
        let redo = writer.begin_checkpoint();
        let checkpoint = CheckPoint {
            redo: redo.0,
            ThisTimeLineID: tli,
            PrevTimeLineID: match kind {
                CheckpointKind::EndOfRecovery { prev_tli } => prev_tli,
                _ => tli,
            },
            fullPageWrites: writer.fpw_snapshot().do_page_writes,
            time: current_pg_time(),
            ..prev.checkPointCopy
        };
        let payload = checkpoint
            .encode()
            .map_err(|e| WalError::bad_state(format!("could not encode checkpoint: {e}")))?;
        let (info, state) = match kind {
            CheckpointKind::Shutdown => (pg_constants::XLOG_CHECKPOINT_SHUTDOWN, DBState::Shutdowned),
            _ => (pg_constants::XLOG_CHECKPOINT_ONLINE, DBState::InProduction),
        };
        let mut builder = RecordBuilder::begin(writer);
        builder.register_data(&payload);
        let rec = builder.insert(pg_constants::RM_XLOG_ID, info)?;
        writer.flush(rec.end_lsn)?;

        self.control.update(|cf| {
            cf.checkPoint = rec.start_lsn.0;
            cf.checkPointCopy = checkpoint;
            cf.state = state as u32;
        });
        info!("checkpoint ({kind:?}) at {}, redo at {redo}", rec.start_lsn);

        // WAL before the previous checkpoint's redo pointer is no longer needed
        let seg_size = writer.seg_size();
        let keep_from = Lsn(prev.checkPointCopy.redo).segment_number(seg_size);
        let recycle_from = writer.insert_position().segment_number(seg_size) + 1;
        let retired = writer.io().segments().remove_old_segments(
            tli,
            keep_from,
            recycle_from,
            MAX_RECYCLED_SEGMENTS,
            self.config.archive_mode,
        )?;
        if !retired.recycled.is_empty() || !retired.removed.is_empty() {
            info!(
                "{} WAL segments recycled, {} removed",
                retired.recycled.len(),
                retired.removed.len()
            );
        }
        Ok(rec.start_lsn)
    }

    /// End the current timeline and continue on a new one, as at the end of
    /// archive recovery. The current segment is closed with a switch record
    /// and the new timeline starts with the next segment. Returns the new
    /// timeline id.
    pub fn promote(&mut self, reason: &str) -> WalResult<TimeLineID> {
        let old_tli = self.writer.timeline();
        let switch = self.writer.switch()?;
        let switchpoint = switch.end_lsn;
        let end = WalEnd {
            end_lsn: switchpoint,
            last_record: Some(self.writer.prev_record()),
            records: 0,
        };
        self.writer.shutdown()?;

        let segments = self.writer.io().segments();
        let new_tli = newest_existing(segments, old_tli) + 1;
        write_history(
            segments,
            new_tli,
            old_tli,
            switchpoint,
            reason,
            self.config.archive_mode,
        )?;
        let history = read_history(segments, new_tli)?;

        let cf = self.control.read();
        let io = wal_io(&self.config, self.writer.seg_size(), self.tde.clone())?;
        let writer = XLogWriter::open(io, writer_setup(&self.config, &cf, new_tli, &end))?;
        if let Some(xlog) = &self.tde_xlog {
            *xlog.writer.write() = Arc::downgrade(&writer);
        }
        self.writer = writer;
        self.history = history;
        info!("switched to timeline {new_tli} at {switchpoint}");

        self.write_checkpoint(CheckpointKind::EndOfRecovery { prev_tli: old_tli })?;
        Ok(new_tli)
    }

    /// Make `name` the server principal key. An existing key is rotated, and
    /// new WAL is written under a fresh key wrapped by the new one.
    pub fn set_server_key(&self, name: &str) -> WalResult<()> {
        let tde = self.require_tde()?;
        tde.set_principal_key(GLOBAL_DATA_TDE_OID, name)?;
        Ok(())
    }

    /// Switch WAL encryption on or off from the next write on. WAL already
    /// written keeps its key.
    pub fn set_wal_encryption(&mut self, on: bool) -> WalResult<()> {
        let tde = self.require_tde()?;
        if on && !tde.has_principal_key(GLOBAL_DATA_TDE_OID)? {
            return Err(WalError::KeyUnavailable(
                "cannot encrypt WAL without a server principal key".to_string(),
            ));
        }
        tde.start_wal_key(on)?;
        self.config.encrypt_wal = on;
        Ok(())
    }

    /// Free the key map entries of `db` whose relation is gone. Keys made
    /// by transactions that were cut short by a crash are only reclaimed
    /// here.
    pub fn gc_orphaned_keys(
        &self,
        db: Oid,
        is_live: impl Fn(&RelFileNode, KeyType) -> bool,
    ) -> WalResult<usize> {
        match &self.tde {
            Some(tde) => Ok(tde.gc_orphaned_entries(db, is_live)?),
            None => Ok(0),
        }
    }

    fn require_tde(&self) -> WalResult<&Arc<TdeKeyManager>> {
        self.tde
            .as_ref()
            .ok_or_else(|| WalError::KeyUnavailable("no keyring_file is configured".to_string()))
    }

    /// Write a shutdown checkpoint and stop the writer.
    pub fn shutdown(self) -> WalResult<()> {
        self.write_checkpoint(CheckpointKind::Shutdown)?;
        self.writer.shutdown()?;
        info!("WAL subsystem shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlfile::get_controlfile_by_exact_path;
    use camino::Utf8PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SEG: usize = 1024 * 1024;
    const TEST_RMGR: u8 = pg_constants::RM_MIN_CUSTOM_ID;

    fn test_config(dir: &std::path::Path) -> WalConfig {
        let data_dir = Utf8PathBuf::from_path_buf(dir.join("data")).unwrap();
        WalConfig {
            wal_segment_size: SEG,
            wal_buffers: 16,
            no_sync: true,
            ..WalConfig::for_data_dir(data_dir)
        }
    }

    #[derive(Default)]
    struct Counting {
        redone: AtomicUsize,
    }

    impl RmgrHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn redo(&self, _record: &RedoRecord<'_>) -> WalResult<()> {
            self.redone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn insert(wal: &WalSubsystem, data: &[u8]) -> Lsn {
        let mut b = wal.record();
        b.register_data(data);
        let rec = b.insert(TEST_RMGR, 0).unwrap();
        wal.writer().flush(rec.end_lsn).unwrap();
        rec.start_lsn
    }

    fn table_with(counting: &Arc<Counting>) -> RmgrTable {
        let mut rmgrs = RmgrTable::new();
        rmgrs.register_custom(TEST_RMGR, counting.clone()).unwrap();
        rmgrs
    }

    #[test]
    fn clean_restart_continues_after_shutdown_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cf = WalSubsystem::bootstrap(&config, None).unwrap();
        assert!(WalSubsystem::bootstrap(&config, None).is_err());

        let counting = Arc::new(Counting::default());
        let wal = WalSubsystem::open(config.clone(), table_with(&counting)).unwrap();
        assert_eq!(wal.control_data().state, DBState::InProduction as u32);
        assert!(wal.rmgrs().is_sealed());
        let first = insert(&wal, b"first");
        assert!(first > Lsn(cf.checkPoint));
        wal.shutdown().unwrap();

        let on_disk = get_controlfile_by_exact_path(&config.control_file_path().into_std_path_buf())
            .unwrap()
            .into_verified()
            .unwrap();
        assert_eq!(on_disk.state, DBState::Shutdowned as u32);
        assert_eq!(on_disk.checkPointCopy.redo, on_disk.checkPoint);

        let wal = WalSubsystem::open(config, table_with(&counting)).unwrap();
        assert_eq!(counting.redone.load(Ordering::Relaxed), 0);
        let second = insert(&wal, b"second");
        assert!(second > Lsn(on_disk.checkPoint));

        let reader = wal.reader();
        let mut cursor = reader.open_at(first);
        let rec = reader.read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(&rec.decoded.main_data()[..], b"first");
        wal.shutdown().unwrap();
    }

    #[test]
    fn crash_recovery_replays_since_redo() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        WalSubsystem::bootstrap(&config, None).unwrap();

        let counting = Arc::new(Counting::default());
        let wal = WalSubsystem::open(config.clone(), table_with(&counting)).unwrap();
        for i in 0..3u8 {
            insert(&wal, &[i; 100]);
        }
        // crash: no shutdown checkpoint
        drop(wal);

        let wal = WalSubsystem::open(config.clone(), table_with(&counting)).unwrap();
        assert_eq!(counting.redone.load(Ordering::Relaxed), 3);
        let cf = wal.control_data();
        assert_eq!(cf.state, DBState::InProduction as u32);
        assert_eq!(cf.checkPointCopy.PrevTimeLineID, 1);
        drop(wal);

        // the end-of-recovery checkpoint moved the redo pointer past them
        let wal = WalSubsystem::open(config, table_with(&counting)).unwrap();
        assert_eq!(counting.redone.load(Ordering::Relaxed), 3);
        wal.shutdown().unwrap();
    }

    #[test]
    fn idle_checkpoint_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        WalSubsystem::bootstrap(&config, None).unwrap();
        let wal = WalSubsystem::open(config, RmgrTable::new()).unwrap();

        let before = Lsn(wal.control_data().checkPoint);
        assert_eq!(wal.checkpoint(false).unwrap(), before);
        let forced = wal.checkpoint(true).unwrap();
        assert!(forced > before);

        insert(&wal, b"work");
        let after = wal.checkpoint(false).unwrap();
        assert!(after > forced);
        assert_eq!(Lsn(wal.control_data().checkPoint), after);
        wal.shutdown().unwrap();
    }

    #[test]
    fn encryption_needs_a_principal_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.keyring_file = Some(Utf8PathBuf::from("keyring.json"));
        WalSubsystem::bootstrap(&config, None).unwrap();

        config.encrypt_wal = true;
        let err = WalSubsystem::open(config.clone(), RmgrTable::new()).err().unwrap();
        assert!(matches!(err, WalError::KeyUnavailable(_)), "{err}");

        config.keyring_file = None;
        let err = WalSubsystem::open(config, RmgrTable::new()).err().unwrap();
        assert!(matches!(err, WalError::KeyUnavailable(_)), "{err}");
    }

    fn records_from(wal: &WalSubsystem, start: Lsn) -> Vec<Vec<u8>> {
        let reader = wal.reader();
        let mut cursor = reader.open_at(start);
        let mut seen = Vec::new();
        while let Some(rec) = reader.read_record(&mut cursor).unwrap() {
            if rec.header.xl_rmid == TEST_RMGR {
                seen.push(rec.decoded.main_data().to_vec());
            }
        }
        seen
    }

    #[test]
    fn promotion_starts_a_new_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        WalSubsystem::bootstrap(&config, None).unwrap();

        let mut wal = WalSubsystem::open(config.clone(), RmgrTable::new()).unwrap();
        let before = insert(&wal, b"on timeline 1");
        assert_eq!(wal.promote("end of recovery").unwrap(), 2);
        assert_eq!(wal.timeline(), 2);
        assert_eq!(wal.history().len(), 2);
        let after = insert(&wal, b"on timeline 2");
        assert_eq!(after.segment_number(SEG), before.segment_number(SEG) + 1);

        // the end-of-recovery checkpoint still needs the old timeline's WAL
        let seen = records_from(&wal, before);
        assert_eq!(seen.len(), 2);
        assert_eq!(&seen[0][..], b"on timeline 1");
        assert_eq!(&seen[1][..], b"on timeline 2");
        wal.shutdown().unwrap();

        let wal = WalSubsystem::open(config, RmgrTable::new()).unwrap();
        assert_eq!(wal.timeline(), 2);
        assert_eq!(wal.control_data().checkPointCopy.ThisTimeLineID, 2);
        assert_eq!(wal.history()[0].tli, 1);
        assert_eq!(wal.history()[0].end.segment_number(SEG), after.segment_number(SEG));

        // the shutdown checkpoint moved the horizon past the switch
        let segments = wal.writer().io().segments().scan_dir().unwrap();
        assert!(segments.iter().all(|&(tli, _)| tli == 2), "{segments:?}");
        let seen = records_from(&wal, after);
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0][..], b"on timeline 2");
        wal.shutdown().unwrap();
    }
}
