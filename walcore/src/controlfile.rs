//!
//! Reading and writing `global/pg_control`.
//!
//! The file is always `PG_CONTROL_FILE_SIZE` bytes: the encoded struct,
//! zero padding, and a CRC-32C over the struct up to the CRC field.
//! A reader that sees a bad CRC gets the decoded contents anyway, flagged
//! with `crc_ok = false`, and decides for itself whether to go on.
//!
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use postgres_ffi::controlfile_utils::{control_file_version, ControlFileVersion, SIZEOF_CONTROLDATA};
use postgres_ffi::legacy::{ControlFileV0, XLOG_SEG_SIZE_V0};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::{current_pg_time, XLOG_SIZE_OF_XLOG_LONG_PHD};
use postgres_ffi::{CheckPoint, ControlFileData, DBState, FullTransactionId, BLCKSZ, XLOG_BLCKSZ};
use tracing::*;
use utils::lsn::Lsn;

use crate::error::{retry_interrupted, WalError, WalResult};

const MAX_READ_ATTEMPTS: usize = 10;
const READ_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// First xid handed out by a freshly guessed control file.
pub const GUESSED_NEXT_XID: u32 = 514;
/// Fake LSNs for unlogged relations start here.
const FIRST_NORMAL_UNLOGGED_LSN: u64 = 1000;

/// Contents of a control file as read from disk.
#[derive(Debug, Clone)]
pub struct ControlFileRead {
    pub data: ControlFileData,
    pub crc_ok: bool,
    /// Layout the file was written in. `data` is always in the current one.
    pub version: ControlFileVersion,
    pub byte_order_suspect: bool,
    /// Some fields had no counterpart on disk and hold defaults.
    pub guessed: bool,
}

impl ControlFileRead {
    /// The contents, if they can be trusted as they are.
    pub fn into_verified(self) -> WalResult<ControlFileData> {
        if !self.crc_ok {
            return Err(WalError::corruption(
                Lsn::INVALID,
                "incorrect checksum in control file",
            ));
        }
        Ok(self.data)
    }
}

fn read_raw(path: &Path) -> WalResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| WalError::io(path, e))?;
    let mut buf = Vec::with_capacity(pg_constants::PG_CONTROL_FILE_SIZE);
    retry_interrupted(|| {
        buf.clear();
        file.seek(SeekFrom::Start(0))?;
        (&mut file)
            .take(pg_constants::PG_CONTROL_FILE_SIZE as u64)
            .read_to_end(&mut buf)
    })
    .map_err(|e| WalError::io(path, e))?;
    Ok(buf)
}

/// Read the control file at `path`.
///
/// A file whose CRC does not match is read again, up to a few times, as
/// long as the stored CRC keeps changing: a concurrent writer may be
/// halfway through overwriting it.
pub fn get_controlfile_by_exact_path(path: &Path) -> WalResult<ControlFileRead> {
    let mut last_crc = 0u32;
    let mut attempt = 1;
    loop {
        let buf = read_raw(path)?;
        let version = control_file_version(&buf).ok_or_else(|| {
            WalError::corruption(
                Lsn::INVALID,
                format!("control file {} is too short ({} bytes)", path.display(), buf.len()),
            )
        })?;

        match version {
            ControlFileVersion::Current => {
                if buf.len() < SIZEOF_CONTROLDATA {
                    return Err(WalError::corruption(
                        Lsn::INVALID,
                        format!("control file {} is too short ({} bytes)", path.display(), buf.len()),
                    ));
                }
                let (data, expected) = ControlFileData::decode_unchecked(&buf)?;
                let crc_ok = expected == data.crc;
                if !crc_ok && attempt < MAX_READ_ATTEMPTS && data.crc != last_crc {
                    debug!("control file CRC mismatch, reading it again");
                    last_crc = data.crc;
                    attempt += 1;
                    std::thread::sleep(READ_RETRY_SLEEP);
                    continue;
                }
                let byte_order_suspect = data.byte_order_suspect();
                if byte_order_suspect {
                    warn!(
                        "possible byte ordering mismatch in {}: control version {} looks byte-swapped",
                        path.display(),
                        data.pg_control_version
                    );
                }
                if !crc_ok {
                    warn!("calculated CRC checksum does not match value stored in {}", path.display());
                }
                return Ok(ControlFileRead {
                    data,
                    crc_ok,
                    version,
                    byte_order_suspect,
                    guessed: false,
                });
            }
            ControlFileVersion::V0 => {
                let (old, crc_ok) = ControlFileV0::decode(&buf).map_err(|e| WalError::VersionMismatch {
                    what: "control file",
                    msg: e.to_string(),
                })?;
                info!("upgrading V0 control file {} in memory", path.display());
                let base = guessed_defaults(XLOG_SEG_SIZE_V0);
                return Ok(ControlFileRead {
                    data: old.upgrade(&base),
                    crc_ok,
                    version,
                    byte_order_suspect: false,
                    guessed: true,
                });
            }
            ControlFileVersion::Unknown(v) => {
                // a byte-swapped current version is still worth decoding
                if v.swap_bytes() == pg_constants::PG_CONTROL_VERSION && buf.len() >= SIZEOF_CONTROLDATA {
                    let (data, expected) = ControlFileData::decode_unchecked(&buf)?;
                    warn!(
                        "possible byte ordering mismatch in {}: control version {v}",
                        path.display()
                    );
                    return Ok(ControlFileRead {
                        crc_ok: expected == data.crc,
                        data,
                        version,
                        byte_order_suspect: true,
                        guessed: false,
                    });
                }
                return Err(WalError::VersionMismatch {
                    what: "control file",
                    msg: format!(
                        "{} has version {v}, but this build expects {}; use an upgrade tool",
                        path.display(),
                        pg_constants::PG_CONTROL_VERSION
                    ),
                });
            }
        }
    }
}

pub fn control_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(pg_constants::XLOG_CONTROL_FILE)
}

/// Overwrite the control file at `path` in place and sync it.
///
/// # Panics
///
/// On any I/O error. The previous contents may be partly overwritten by
/// then, and there is no way to continue safely.
pub fn write_control_file(path: &Path, data: &ControlFileData, no_sync: bool) {
    if let Err(e) = try_write_control_file(path, data, no_sync) {
        error!("could not write control file {}: {e:#}", path.display());
        panic!("could not write control file {}: {e:#}", path.display());
    }
}

fn try_write_control_file(path: &Path, data: &ControlFileData, no_sync: bool) -> anyhow::Result<()> {
    let buf = data.encode()?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    retry_interrupted(|| {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)
    })?;
    file.set_len(buf.len() as u64)?;
    if !no_sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Create a control file that does not exist yet, with its directory.
pub fn create_control_file(path: &Path, data: &ControlFileData, no_sync: bool) -> WalResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| WalError::io(dir, e))?;
    }
    write_control_file(path, data, no_sync);
    if !no_sync {
        if let Some(dir) = path.parent() {
            utils::crashsafe::fsync(dir).map_err(|e| WalError::io(dir, e))?;
        }
    }
    Ok(())
}

/// System identifier derived from the current time and process id.
pub fn new_system_identifier() -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_secs() << 32) | ((now.subsec_micros() as u64) << 12) | (std::process::id() as u64 & 0xFFF)
}

fn env_locale(category: &str) -> String {
    ["LC_ALL", category, "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "C".to_string())
}

/// Plausible contents for a cluster whose control file is lost: a shut
/// down cluster with a new system identifier, checkpointed at the start
/// of the WAL.
pub fn guessed_defaults(seg_size: usize) -> ControlFileData {
    let now = current_pg_time();
    let redo = XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
    let mut cf = ControlFileData {
        system_identifier: new_system_identifier(),
        pg_control_version: pg_constants::PG_CONTROL_VERSION,
        catalog_version_no: pg_constants::CATALOG_VERSION_NO,
        state: DBState::Shutdowned as u32,
        time: now,
        checkPoint: redo,
        checkPointCopy: CheckPoint {
            redo,
            ThisTimeLineID: 1,
            PrevTimeLineID: 1,
            fullPageWrites: false,
            nextXid: FullTransactionId::new(0, GUESSED_NEXT_XID),
            nextOid: pg_constants::FIRST_BOOTSTRAP_OBJECT_ID,
            nextMulti: 1,
            nextMultiOffset: 0,
            oldestXid: pg_constants::FIRST_NORMAL_TRANSACTION_ID,
            oldestXidDB: 0,
            oldestMulti: 1,
            oldestMultiDB: 0,
            time: now,
            oldestActiveXid: 0,
            ..Default::default()
        },
        unloggedLSN: FIRST_NORMAL_UNLOGGED_LSN,
        wal_level: pg_constants::WAL_LEVEL_MINIMAL,
        MaxConnections: pg_constants::DEFAULT_MAX_CONNECTIONS,
        max_worker_processes: pg_constants::DEFAULT_MAX_WORKER_PROCESSES,
        max_wal_senders: pg_constants::DEFAULT_MAX_WAL_SENDERS,
        max_prepared_xacts: pg_constants::DEFAULT_MAX_PREPARED_XACTS,
        max_locks_per_xact: pg_constants::DEFAULT_MAX_LOCKS_PER_XACT,
        maxAlign: pg_constants::MAXIMUM_ALIGNOF,
        floatFormat: pg_constants::FLOATFORMAT_VALUE,
        blcksz: BLCKSZ as u32,
        relseg_size: pg_constants::RELSEG_SIZE,
        xlog_blcksz: XLOG_BLCKSZ as u32,
        xlog_seg_size: seg_size as u32,
        nameDataLen: pg_constants::NAMEDATALEN as u32,
        indexMaxKeys: pg_constants::INDEX_MAX_KEYS,
        toast_max_chunk_size: pg_constants::TOAST_MAX_CHUNK_SIZE,
        loblksize: pg_constants::LOBLKSIZE,
        float8ByVal: true,
        ..Default::default()
    };
    ControlFileData::set_locale(&mut cf.lc_collate, &env_locale("LC_COLLATE"));
    ControlFileData::set_locale(&mut cf.lc_ctype, &env_locale("LC_CTYPE"));
    cf
}

/// The control file of a running cluster. Updates go through one lock and
/// are written out before the lock is released.
pub struct ControlFileStore {
    path: PathBuf,
    no_sync: bool,
    data: Mutex<ControlFileData>,
}

impl ControlFileStore {
    /// Load the control file of `data_dir`. Anything but a valid file in
    /// the current layout is refused.
    pub fn open(data_dir: &Path, no_sync: bool) -> WalResult<ControlFileStore> {
        let path = control_file_path(data_dir);
        let read = get_controlfile_by_exact_path(&path)?;
        if read.version != ControlFileVersion::Current || read.byte_order_suspect {
            return Err(WalError::VersionMismatch {
                what: "control file",
                msg: format!(
                    "{} was written by an incompatible server (version {})",
                    path.display(),
                    read.data.pg_control_version
                ),
            });
        }
        let data = read.into_verified()?;
        Ok(ControlFileStore {
            path,
            no_sync,
            data: Mutex::new(data),
        })
    }

    /// Write `data` as the control file of `data_dir`, replacing any file
    /// there, and manage it from now on.
    pub fn create(data_dir: &Path, data: ControlFileData, no_sync: bool) -> WalResult<ControlFileStore> {
        let path = control_file_path(data_dir);
        create_control_file(&path, &data, no_sync)?;
        Ok(ControlFileStore {
            path,
            no_sync,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents.
    pub fn read(&self) -> ControlFileData {
        *self.data.lock()
    }

    /// Apply `f` and write the result out, stamped with the current time.
    pub fn update<R>(&self, f: impl FnOnce(&mut ControlFileData) -> R) -> R {
        let mut data = self.data.lock();
        let res = f(&mut data);
        data.time = current_pg_time();
        write_control_file(&self.path, &data, self.no_sync);
        res
    }

    /// Replace the contents wholesale.
    pub fn write(&self, new: ControlFileData) {
        let mut data = self.data.lock();
        *data = new;
        write_control_file(&self.path, &data, self.no_sync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::legacy::test_utils::encode_control_file;
    use postgres_ffi::legacy::{CheckPointV0, RecPtrV0};

    fn sample() -> ControlFileData {
        let mut cf = guessed_defaults(16 * 1024 * 1024);
        cf.system_identifier = 7_000_000_000_000_000_001;
        cf.checkPoint = 0x0100_0028;
        cf.checkPointCopy.redo = 0x0100_0028;
        cf.checkPointCopy.nextOid = 16384;
        cf
    }

    #[test]
    fn written_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlFileStore::create(dir.path(), sample(), true).unwrap();
        let path = store.path().to_path_buf();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            pg_constants::PG_CONTROL_FILE_SIZE
        );

        let read = get_controlfile_by_exact_path(&path).unwrap();
        assert!(read.crc_ok);
        assert!(!read.guessed);
        assert_eq!(read.version, ControlFileVersion::Current);
        let mut expected = sample();
        expected.crc = read.data.crc;
        assert_eq!(read.data, expected);

        store.update(|cf| cf.state = DBState::InProduction as u32);
        let reopened = ControlFileStore::open(dir.path(), true).unwrap();
        assert_eq!(reopened.read().state, DBState::InProduction as u32);
        assert_eq!(reopened.read().system_identifier, sample().system_identifier);
    }

    #[test]
    fn bad_crc_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file_path(dir.path());
        create_control_file(&path, &sample(), true).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[40] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let read = get_controlfile_by_exact_path(&path).unwrap();
        assert!(!read.crc_ok);
        assert_eq!(read.data.system_identifier, sample().system_identifier);
        assert!(ControlFileStore::open(dir.path(), true).is_err());
    }

    #[test]
    fn zeroed_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, vec![0u8; pg_constants::PG_CONTROL_FILE_SIZE]).unwrap();
        assert!(matches!(
            get_controlfile_by_exact_path(&path),
            Err(WalError::VersionMismatch { .. })
        ));

        std::fs::write(&path, [1u8; 4]).unwrap();
        assert!(get_controlfile_by_exact_path(&path).unwrap_err().is_corruption());
    }

    #[test]
    fn v0_file_is_upgraded_with_guesses() {
        let dir = tempfile::tempdir().unwrap();
        let path = control_file_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let old = ControlFileV0 {
            crc: 0,
            pg_control_version: pg_constants::PG_CONTROL_VERSION_V0,
            catalog_version_no: 200_211_021,
            state: DBState::Shutdowned as u32,
            time: 1_000_000,
            log_id: 0,
            log_seg: 3,
            check_point: RecPtrV0 { xlogid: 0, xrecoff: 0x0300_0010 },
            prev_check_point: RecPtrV0::default(),
            check_point_copy: CheckPointV0 {
                redo: RecPtrV0 { xlogid: 0, xrecoff: 0x0300_0010 },
                next_xid: 9000,
                next_oid: 40000,
                ..Default::default()
            },
            blcksz: 8192,
            relseg_size: 131072,
            name_data_len: 64,
            func_max_args: 32,
            lc_collate: "en_US".into(),
            lc_ctype: "en_US".into(),
        };
        std::fs::write(&path, encode_control_file(&old)).unwrap();

        let read = get_controlfile_by_exact_path(&path).unwrap();
        assert!(read.crc_ok);
        assert!(read.guessed);
        assert_eq!(read.version, ControlFileVersion::V0);
        assert_eq!(read.data.pg_control_version, pg_constants::PG_CONTROL_VERSION);
        assert_eq!(read.data.checkPointCopy.nextXid.xid(), 9000);
        assert_eq!(read.data.checkPointCopy.nextOid, 40000);
        assert_eq!(read.data.lc_collate_str(), "en_US");
        assert_eq!(read.data.xlog_seg_size as usize, XLOG_SEG_SIZE_V0);
    }

    #[test]
    fn guessed_defaults_are_sane() {
        let cf = guessed_defaults(1 << 20);
        assert_eq!(cf.checkPointCopy.nextXid.xid(), 514);
        assert_eq!(cf.checkPointCopy.nextOid, 10000);
        assert_eq!(cf.state, DBState::Shutdowned as u32);
        assert_eq!(cf.xlog_seg_size, 1 << 20);
        assert_ne!(cf.system_identifier, 0);
        assert!(cf.encode().is_ok());
    }
}
