//!
//! Misc constants, copied from PostgreSQL headers.
//!
//! Grouped by the header they come from, so that they are easy to
//! cross-check against the C definitions.
//!

use crate::BLCKSZ;

//
// From pg_tablespace_d.h
//
pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

// From bufpage.h
pub const SIZE_OF_PAGE_HEADER: u16 = 24;
pub const PD_LOWER_OFFSET: usize = 12;
pub const PD_UPPER_OFFSET: usize = 14;

//
// From relpath.h
//
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

//
// Resource manager ids, from rmgrlist.h
//
pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const RM_SMGR_ID: u8 = 2;
pub const RM_CLOG_ID: u8 = 3;
pub const RM_DBASE_ID: u8 = 4;
pub const RM_TBLSPC_ID: u8 = 5;
pub const RM_MULTIXACT_ID: u8 = 6;
pub const RM_RELMAP_ID: u8 = 7;
pub const RM_STANDBY_ID: u8 = 8;
pub const RM_HEAP2_ID: u8 = 9;
pub const RM_HEAP_ID: u8 = 10;
pub const RM_BTREE_ID: u8 = 11;
pub const RM_HASH_ID: u8 = 12;
pub const RM_GIN_ID: u8 = 13;
pub const RM_GIST_ID: u8 = 14;
pub const RM_SEQ_ID: u8 = 15;
pub const RM_SPGIST_ID: u8 = 16;
pub const RM_BRIN_ID: u8 = 17;
pub const RM_COMMIT_TS_ID: u8 = 18;
pub const RM_REPLORIGIN_ID: u8 = 19;
pub const RM_GENERIC_ID: u8 = 20;
pub const RM_LOGICALMSG_ID: u8 = 21;
/// Key-management records of the transparent data encryption layer.
pub const RM_TDE_ID: u8 = 22;
pub const RM_MAX_BUILTIN_ID: u8 = RM_TDE_ID;
pub const RM_MIN_CUSTOM_ID: u8 = 128;
pub const RM_MAX_CUSTOM_ID: u8 = 255;
pub const RM_EXPERIMENTAL_ID: u8 = 128;

//
// from xlogrecord.h
//
pub const XLR_INFO_MASK: u8 = 0x0F;
pub const XLR_RMGR_INFO_MASK: u8 = 0xF0;
pub const XLR_SPECIAL_REL_UPDATE: u8 = 0x01;
pub const XLR_CHECK_CONSISTENCY: u8 = 0x02;

pub const XLR_MAX_BLOCK_ID: u8 = 32;

pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;
pub const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const _BKPBLOCK_FLAG_MASK: u8 = 0xF0;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10; /* block data is an XLogRecordBlockImage */
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40; /* redo will re-init the page */
pub const BKPBLOCK_SAME_REL: u8 = 0x80; /* RelFileNode omitted, same as previous */

/* Information stored in bimg_info */
pub const BKPIMAGE_HAS_HOLE: u8 = 0x01; /* page image has "hole" */
pub const BKPIMAGE_IS_COMPRESSED: u8 = 0x02; /* page image is compressed */
pub const BKPIMAGE_APPLY: u8 = 0x04; /* page image should be restored during replay */

/// Size of the fixed part of XLogRecordBlockHeader
pub const SIZE_OF_XLOG_RECORD_BLOCK_HEADER: usize = 4;
/// Size of XLogRecordBlockImageHeader
pub const SIZE_OF_XLOG_RECORD_BLOCK_IMAGE_HEADER: usize = 5;
/// Size of RelFileNode
pub const SIZE_OF_REL_FILE_NODE: usize = 12;

/// Largest record the assembler accepts, from xloginsert.c
pub const MAX_LOG_RECORD_SIZE: usize = 1020 * 1024 * 1024;

//
// Record-level flags passed to XLogSetRecordFlags, from xlog.h
//
pub const XLOG_INCLUDE_ORIGIN: u8 = 0x01;
pub const XLOG_MARK_UNIMPORTANT: u8 = 0x02;

//
// Buffer registration flags, from xloginsert.h
//
pub const REGBUF_FORCE_IMAGE: u8 = 0x01; /* force a full-page image */
pub const REGBUF_NO_IMAGE: u8 = 0x02; /* don't take a full-page image */
pub const REGBUF_WILL_INIT: u8 = 0x04 | 0x02; /* page will be re-initialized at replay */
pub const REGBUF_STANDARD: u8 = 0x08; /* page follows "standard" page layout */
pub const REGBUF_KEEP_DATA: u8 = 0x10; /* include data even if a full-page image is taken */
pub const REGBUF_NO_CHANGE: u8 = 0x20; /* intentionally register clean buffer */

/* From transam.h */
pub const FIRST_NORMAL_TRANSACTION_ID: u32 = 3;
pub const INVALID_TRANSACTION_ID: u32 = 0;
pub const FIRST_BOOTSTRAP_OBJECT_ID: u32 = 10000;
pub const FIRST_MULTIXACT_ID: u32 = 1;

/* pg_control.h */
pub const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
pub const XLOG_NOOP: u8 = 0x20;
pub const XLOG_NEXTOID: u8 = 0x30;
pub const XLOG_SWITCH: u8 = 0x40;
pub const XLOG_BACKUP_END: u8 = 0x50;
pub const XLOG_PARAMETER_CHANGE: u8 = 0x60;
pub const XLOG_RESTORE_POINT: u8 = 0x70;
pub const XLOG_FPW_CHANGE: u8 = 0x80;
pub const XLOG_END_OF_RECOVERY: u8 = 0x90;
pub const XLOG_FPI_FOR_HINT: u8 = 0xA0;
pub const XLOG_FPI: u8 = 0xB0;

pub const PG_CONTROL_FILE_SIZE: usize = 8192;
pub const PG_CONTROL_VERSION: u32 = 1300;
/// Control file layout written by pre-CRC32C servers, see [`crate::legacy`]
pub const PG_CONTROL_VERSION_V0: u32 = 72;
pub const CATALOG_VERSION_NO: u32 = 202107181;
pub const FLOATFORMAT_VALUE: f64 = 1234567.0;
pub const LOCALE_NAME_BUFLEN: usize = 32;
pub const MOCK_AUTH_NONCE_LEN: usize = 32;

/* xact.h */
pub const XLOG_XACT_COMMIT: u8 = 0x00;
pub const XLOG_XACT_PREPARE: u8 = 0x10;
pub const XLOG_XACT_ABORT: u8 = 0x20;
pub const XLOG_XACT_COMMIT_PREPARED: u8 = 0x30;
pub const XLOG_XACT_ABORT_PREPARED: u8 = 0x40;
pub const XLOG_XACT_ASSIGNMENT: u8 = 0x50;
pub const XLOG_XACT_OPMASK: u8 = 0x70;

/* storage_xlog.h */
pub const XLOG_SMGR_CREATE: u8 = 0x10;
pub const XLOG_SMGR_TRUNCATE: u8 = 0x20;

/* standbydefs.h */
pub const XLOG_STANDBY_LOCK: u8 = 0x00;
pub const XLOG_RUNNING_XACTS: u8 = 0x10;
pub const XLOG_INVALIDATIONS: u8 = 0x20;

/* From message.h */
pub const XLOG_LOGICAL_MESSAGE: u8 = 0x00;

/* From generic_xlog.h */
pub const XLOG_GENERIC: u8 = 0x00;

/* From origin.h */
pub const XLOG_REPLORIGIN_SET: u8 = 0x00;
pub const XLOG_REPLORIGIN_DROP: u8 = 0x10;

/* From sequence.h */
pub const XLOG_SEQ_LOG: u8 = 0x00;

/* xlog_internal.h */
pub const XLOG_PAGE_MAGIC: u16 = 0xD05E;
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;
pub const XLP_BKP_REMOVABLE: u16 = 0x0004;
pub const XLP_ALL_FLAGS: u16 = 0x0007;

pub const MIN_WAL_SEG_SIZE: usize = 1024 * 1024;
pub const MAX_WAL_SEG_SIZE: usize = 1024 * 1024 * 1024;
pub const DEFAULT_WAL_SEG_SIZE: usize = 16 * 1024 * 1024;

/* From replication/slot.c */
pub const SLOT_MAGIC: u32 = 0x1051CA1;
pub const SLOT_VERSION: u32 = 2;
pub const NAMEDATALEN: usize = 64;

// Default values used when guessing a lost control file, from
// pg_resetwal.c GuessControlValues().
pub const DEFAULT_MAX_CONNECTIONS: i32 = 100;
pub const DEFAULT_MAX_WAL_SENDERS: i32 = 10;
pub const DEFAULT_MAX_WORKER_PROCESSES: i32 = 8;
pub const DEFAULT_MAX_PREPARED_XACTS: i32 = 0;
pub const DEFAULT_MAX_LOCKS_PER_XACT: i32 = 64;
pub const RELSEG_SIZE: u32 = 131072;
pub const INDEX_MAX_KEYS: u32 = 32;
pub const TOAST_MAX_CHUNK_SIZE: u32 = 1996;
pub const LOBLKSIZE: u32 = BLCKSZ as u32 / 4;
pub const MAXIMUM_ALIGNOF: u32 = 8;

// wal_level values
pub const WAL_LEVEL_MINIMAL: i32 = 0;
pub const WAL_LEVEL_REPLICA: i32 = 1;
pub const WAL_LEVEL_LOGICAL: i32 = 2;

// Names of the files and directories inside a data directory
pub const XLOGDIR: &str = "pg_wal";
/// Directory used by servers that still called it the "transaction log"
pub const XLOGDIR_V0: &str = "pg_xlog";
pub const XLOG_CONTROL_FILE: &str = "global/pg_control";
pub const ARCHIVE_STATUS_DIR: &str = "archive_status";
pub const POSTMASTER_PID_FILE: &str = "postmaster.pid";
pub const REPLSLOT_DIR: &str = "pg_replslot";
