//!
//! On-disk C structures, declared by hand with explicit padding fields.
//!
//! Every struct is `#[repr(C)]` and spells out the padding the C compiler
//! would insert, so that the little-endian fixint bincode encoding produced
//! by [`utils::bin_ser::LeSer`] is byte-for-byte the C layout and
//! `size_of`/`offset_of!` agree with the serialized form.
//!

use serde::{Deserialize, Serialize};

use crate::{MultiXactId, MultiXactOffset, Oid, TimeLineID, TransactionId, XLogRecPtr};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XLogPageHeaderData {
    pub xlp_magic: u16,
    pub xlp_info: u16,
    pub xlp_tli: TimeLineID,
    pub xlp_pageaddr: XLogRecPtr,
    pub xlp_rem_len: u32,
    pub __padding: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XLogLongPageHeaderData {
    pub std: XLogPageHeaderData,
    pub xlp_sysid: u64,
    pub xlp_seg_size: u32,
    pub xlp_xlog_blcksz: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XLogRecord {
    pub xl_tot_len: u32,
    pub xl_xid: TransactionId,
    pub xl_prev: XLogRecPtr,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub __padding: [u8; 2],
    pub xl_crc: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTransactionId {
    pub value: u64,
}

impl FullTransactionId {
    pub const fn new(epoch: u32, xid: TransactionId) -> Self {
        FullTransactionId {
            value: ((epoch as u64) << 32) | xid as u64,
        }
    }

    pub const fn epoch(&self) -> u32 {
        (self.value >> 32) as u32
    }

    pub const fn xid(&self) -> TransactionId {
        self.value as u32
    }
}

/// Body of a checkpoint record, also kept in the control file.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckPoint {
    pub redo: XLogRecPtr,
    pub ThisTimeLineID: TimeLineID,
    pub PrevTimeLineID: TimeLineID,
    pub fullPageWrites: bool,
    pub __padding0: [u8; 7],
    pub nextXid: FullTransactionId,
    pub nextOid: Oid,
    pub nextMulti: MultiXactId,
    pub nextMultiOffset: MultiXactOffset,
    pub oldestXid: TransactionId,
    pub oldestXidDB: Oid,
    pub oldestMulti: MultiXactId,
    pub oldestMultiDB: Oid,
    pub __padding1: [u8; 4],
    pub time: i64,
    pub oldestCommitTsXid: TransactionId,
    pub newestCommitTsXid: TransactionId,
    pub oldestActiveXid: TransactionId,
    pub __padding2: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: u32,
    pub __padding0: [u8; 4],
    pub time: i64,
    pub checkPoint: XLogRecPtr,
    pub checkPointCopy: CheckPoint,
    pub unloggedLSN: XLogRecPtr,
    pub minRecoveryPoint: XLogRecPtr,
    pub minRecoveryPointTLI: TimeLineID,
    pub __padding1: [u8; 4],
    pub backupStartPoint: XLogRecPtr,
    pub backupEndPoint: XLogRecPtr,
    pub backupEndRequired: bool,
    pub __padding2: [u8; 3],
    pub wal_level: i32,
    pub wal_log_hints: bool,
    pub __padding3: [u8; 3],
    pub MaxConnections: i32,
    pub max_worker_processes: i32,
    pub max_wal_senders: i32,
    pub max_prepared_xacts: i32,
    pub max_locks_per_xact: i32,
    pub track_commit_timestamp: bool,
    pub __padding4: [u8; 3],
    pub maxAlign: u32,
    pub floatFormat: f64,
    pub blcksz: u32,
    pub relseg_size: u32,
    pub xlog_blcksz: u32,
    pub xlog_seg_size: u32,
    pub nameDataLen: u32,
    pub indexMaxKeys: u32,
    pub toast_max_chunk_size: u32,
    pub loblksize: u32,
    pub float8ByVal: bool,
    pub __padding5: [u8; 3],
    pub data_checksum_version: u32,
    pub lc_collate: [u8; 32],
    pub lc_ctype: [u8; 32],
    pub mock_authentication_nonce: [u8; 32],
    pub crc: u32,
    pub __padding6: [u8; 4],
}

/// Cluster state stored in `ControlFileData::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DBState {
    Startup = 0,
    Shutdowned = 1,
    ShutdownedInRecovery = 2,
    Shutdowning = 3,
    InCrashRecovery = 4,
    InArchiveRecovery = 5,
    InProduction = 6,
}

impl DBState {
    pub fn from_u32(v: u32) -> Option<DBState> {
        Some(match v {
            0 => DBState::Startup,
            1 => DBState::Shutdowned,
            2 => DBState::ShutdownedInRecovery,
            3 => DBState::Shutdowning,
            4 => DBState::InCrashRecovery,
            5 => DBState::InArchiveRecovery,
            6 => DBState::InProduction,
            _ => return None,
        })
    }

    /// Wording used by pg_controldata.
    pub fn describe(v: u32) -> &'static str {
        match DBState::from_u32(v) {
            Some(DBState::Startup) => "starting up",
            Some(DBState::Shutdowned) => "shut down",
            Some(DBState::ShutdownedInRecovery) => "shut down in recovery",
            Some(DBState::Shutdowning) => "shutting down",
            Some(DBState::InCrashRecovery) => "in crash recovery",
            Some(DBState::InArchiveRecovery) => "in archive recovery",
            Some(DBState::InProduction) => "in production",
            None => "unrecognized status code",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::bin_ser::LeSer;

    #[test]
    fn serialized_size_matches_c_layout() {
        assert_eq!(
            XLogPageHeaderData::default().ser().unwrap().len(),
            std::mem::size_of::<XLogPageHeaderData>()
        );
        assert_eq!(std::mem::size_of::<XLogPageHeaderData>(), 24);
        assert_eq!(std::mem::size_of::<XLogLongPageHeaderData>(), 40);
        assert_eq!(XLogRecord::default().ser().unwrap().len(), 24);
        assert_eq!(CheckPoint::default().ser().unwrap().len(), 88);
        assert_eq!(std::mem::size_of::<CheckPoint>(), 88);
        assert_eq!(
            ControlFileData::default().ser().unwrap().len(),
            std::mem::size_of::<ControlFileData>()
        );
        assert_eq!(memoffset::offset_of!(ControlFileData, checkPointCopy), 40);
        assert_eq!(memoffset::offset_of!(ControlFileData, floatFormat), 208);
        assert_eq!(memoffset::offset_of!(ControlFileData, crc), 352);
    }

    #[test]
    fn full_transaction_id_parts() {
        let fxid = FullTransactionId::new(7, 514);
        assert_eq!(fxid.epoch(), 7);
        assert_eq!(fxid.xid(), 514);
    }
}
