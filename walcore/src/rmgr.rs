//!
//! Resource managers: who owns a record, and what to do with it.
//!
//! Built-in resource managers have fixed ids; ids from
//! `RM_MIN_CUSTOM_ID` up are handed out to extensions that register a
//! handler before the table is sealed at startup. The top four bits of
//! `xl_info` are the resource manager's own record subtype.
//!
use std::sync::Arc;

use bytes::Bytes;
use pg_tde::TdeRecord;
use postgres_ffi::pg_constants;
use postgres_ffi::relfile_utils::{describe_block_ref, forknumber_to_name};
use postgres_ffi::walrecord::{
    decode_checkpoint, DecodedWALRecord, XlLogicalMessage, XlReploriginDrop, XlReploriginSet,
    XlRunningXacts, XlSmgrCreate, XlSmgrTruncate, XlXactFinish,
};
use postgres_ffi::xlog_utils::from_pg_timestamp;
use postgres_ffi::RmgrId;
use tracing::*;
use utils::lsn::Lsn;

use crate::error::{WalError, WalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rmgr {
    Xlog,
    Xact,
    Smgr,
    Clog,
    Dbase,
    Tblspc,
    MultiXact,
    RelMap,
    Standby,
    Heap2,
    Heap,
    Btree,
    Hash,
    Gin,
    Gist,
    Seq,
    SpGist,
    Brin,
    CommitTs,
    ReplOrigin,
    Generic,
    LogicalMsg,
    Tde,
    /// Registered at startup, id in `RM_MIN_CUSTOM_ID..=RM_MAX_CUSTOM_ID`.
    Custom(RmgrId),
}

impl Rmgr {
    /// `None` for ids that are neither built in nor in the custom range.
    pub fn from_id(id: RmgrId) -> Option<Rmgr> {
        use pg_constants::*;
        Some(match id {
            RM_XLOG_ID => Rmgr::Xlog,
            RM_XACT_ID => Rmgr::Xact,
            RM_SMGR_ID => Rmgr::Smgr,
            RM_CLOG_ID => Rmgr::Clog,
            RM_DBASE_ID => Rmgr::Dbase,
            RM_TBLSPC_ID => Rmgr::Tblspc,
            RM_MULTIXACT_ID => Rmgr::MultiXact,
            RM_RELMAP_ID => Rmgr::RelMap,
            RM_STANDBY_ID => Rmgr::Standby,
            RM_HEAP2_ID => Rmgr::Heap2,
            RM_HEAP_ID => Rmgr::Heap,
            RM_BTREE_ID => Rmgr::Btree,
            RM_HASH_ID => Rmgr::Hash,
            RM_GIN_ID => Rmgr::Gin,
            RM_GIST_ID => Rmgr::Gist,
            RM_SEQ_ID => Rmgr::Seq,
            RM_SPGIST_ID => Rmgr::SpGist,
            RM_BRIN_ID => Rmgr::Brin,
            RM_COMMIT_TS_ID => Rmgr::CommitTs,
            RM_REPLORIGIN_ID => Rmgr::ReplOrigin,
            RM_GENERIC_ID => Rmgr::Generic,
            RM_LOGICALMSG_ID => Rmgr::LogicalMsg,
            RM_TDE_ID => Rmgr::Tde,
            id if id >= RM_MIN_CUSTOM_ID => Rmgr::Custom(id),
            _ => return None,
        })
    }

    pub fn id(self) -> RmgrId {
        use pg_constants::*;
        match self {
            Rmgr::Xlog => RM_XLOG_ID,
            Rmgr::Xact => RM_XACT_ID,
            Rmgr::Smgr => RM_SMGR_ID,
            Rmgr::Clog => RM_CLOG_ID,
            Rmgr::Dbase => RM_DBASE_ID,
            Rmgr::Tblspc => RM_TBLSPC_ID,
            Rmgr::MultiXact => RM_MULTIXACT_ID,
            Rmgr::RelMap => RM_RELMAP_ID,
            Rmgr::Standby => RM_STANDBY_ID,
            Rmgr::Heap2 => RM_HEAP2_ID,
            Rmgr::Heap => RM_HEAP_ID,
            Rmgr::Btree => RM_BTREE_ID,
            Rmgr::Hash => RM_HASH_ID,
            Rmgr::Gin => RM_GIN_ID,
            Rmgr::Gist => RM_GIST_ID,
            Rmgr::Seq => RM_SEQ_ID,
            Rmgr::SpGist => RM_SPGIST_ID,
            Rmgr::Brin => RM_BRIN_ID,
            Rmgr::CommitTs => RM_COMMIT_TS_ID,
            Rmgr::ReplOrigin => RM_REPLORIGIN_ID,
            Rmgr::Generic => RM_GENERIC_ID,
            Rmgr::LogicalMsg => RM_LOGICALMSG_ID,
            Rmgr::Tde => RM_TDE_ID,
            Rmgr::Custom(id) => id,
        }
    }

    /// Name as shown by WAL dump tools. Custom managers are named by their
    /// handler, see [`RmgrTable::name`].
    pub fn name(self) -> &'static str {
        match self {
            Rmgr::Xlog => "XLOG",
            Rmgr::Xact => "Transaction",
            Rmgr::Smgr => "Storage",
            Rmgr::Clog => "CLOG",
            Rmgr::Dbase => "Database",
            Rmgr::Tblspc => "Tablespace",
            Rmgr::MultiXact => "MultiXact",
            Rmgr::RelMap => "RelMap",
            Rmgr::Standby => "Standby",
            Rmgr::Heap2 => "Heap2",
            Rmgr::Heap => "Heap",
            Rmgr::Btree => "Btree",
            Rmgr::Hash => "Hash",
            Rmgr::Gin => "Gin",
            Rmgr::Gist => "Gist",
            Rmgr::Seq => "Sequence",
            Rmgr::SpGist => "SPGist",
            Rmgr::Brin => "BRIN",
            Rmgr::CommitTs => "CommitTs",
            Rmgr::ReplOrigin => "ReplicationOrigin",
            Rmgr::Generic => "Generic",
            Rmgr::LogicalMsg => "LogicalMessage",
            Rmgr::Tde => "pg_tde",
            Rmgr::Custom(_) => "custom",
        }
    }

    pub fn is_custom(self) -> bool {
        matches!(self, Rmgr::Custom(_))
    }

    /// Subtype name of a built-in record, `None` if unknown.
    pub fn identify(self, info: u8) -> Option<&'static str> {
        use pg_constants::*;
        let info = info & XLR_RMGR_INFO_MASK;
        Some(match self {
            Rmgr::Xlog => match info {
                XLOG_CHECKPOINT_SHUTDOWN => "CHECKPOINT_SHUTDOWN",
                XLOG_CHECKPOINT_ONLINE => "CHECKPOINT_ONLINE",
                XLOG_NOOP => "NOOP",
                XLOG_NEXTOID => "NEXTOID",
                XLOG_SWITCH => "SWITCH",
                XLOG_BACKUP_END => "BACKUP_END",
                XLOG_PARAMETER_CHANGE => "PARAMETER_CHANGE",
                XLOG_RESTORE_POINT => "RESTORE_POINT",
                XLOG_FPW_CHANGE => "FPW_CHANGE",
                XLOG_END_OF_RECOVERY => "END_OF_RECOVERY",
                XLOG_FPI_FOR_HINT => "FPI_FOR_HINT",
                XLOG_FPI => "FPI",
                _ => return None,
            },
            Rmgr::Xact => match info & XLOG_XACT_OPMASK {
                XLOG_XACT_COMMIT => "COMMIT",
                XLOG_XACT_PREPARE => "PREPARE",
                XLOG_XACT_ABORT => "ABORT",
                XLOG_XACT_COMMIT_PREPARED => "COMMIT_PREPARED",
                XLOG_XACT_ABORT_PREPARED => "ABORT_PREPARED",
                XLOG_XACT_ASSIGNMENT => "ASSIGNMENT",
                _ => return None,
            },
            Rmgr::Smgr => match info {
                XLOG_SMGR_CREATE => "CREATE",
                XLOG_SMGR_TRUNCATE => "TRUNCATE",
                _ => return None,
            },
            Rmgr::Standby => match info {
                XLOG_STANDBY_LOCK => "LOCK",
                XLOG_RUNNING_XACTS => "RUNNING_XACTS",
                XLOG_INVALIDATIONS => "INVALIDATIONS",
                _ => return None,
            },
            Rmgr::ReplOrigin => match info {
                XLOG_REPLORIGIN_SET => "SET",
                XLOG_REPLORIGIN_DROP => "DROP",
                _ => return None,
            },
            Rmgr::LogicalMsg if info == XLOG_LOGICAL_MESSAGE => "MESSAGE",
            Rmgr::Generic if info == XLOG_GENERIC => "Generic",
            Rmgr::Seq if info == XLOG_SEQ_LOG => "LOG",
            Rmgr::Tde => match info {
                pg_tde::xlog::XLOG_TDE_ADD_RELATION_KEY => "ADD_RELATION_KEY",
                pg_tde::xlog::XLOG_TDE_FREE_MAP_ENTRY => "FREE_MAP_ENTRY",
                pg_tde::xlog::XLOG_TDE_ROTATE_PRINCIPAL_KEY => "ROTATE_PRINCIPAL_KEY",
                pg_tde::xlog::XLOG_TDE_ADD_PRINCIPAL_KEY => "ADD_PRINCIPAL_KEY",
                _ => return None,
            },
            _ => return None,
        })
    }

    /// Main data of a built-in record in words. Records this crate cannot
    /// look into are summarized by their length.
    pub fn describe(self, decoded: &DecodedWALRecord) -> String {
        let info = decoded.rmgr_info();
        let mut data = decoded.main_data();
        let described = match self {
            Rmgr::Xlog => describe_xlog(info, decoded),
            Rmgr::Xact => match info & pg_constants::XLOG_XACT_OPMASK {
                pg_constants::XLOG_XACT_COMMIT | pg_constants::XLOG_XACT_ABORT => {
                    XlXactFinish::decode(&mut data).ok().map(|x| {
                        let time = chrono::DateTime::<chrono::Utc>::from(from_pg_timestamp(x.xact_time));
                        format!("{}", time.format("%Y-%m-%d %H:%M:%S%.6f UTC"))
                    })
                }
                _ => None,
            },
            Rmgr::Smgr => match info {
                pg_constants::XLOG_SMGR_CREATE => XlSmgrCreate::decode(&mut data).ok().map(|x| {
                    let r = x.rnode;
                    match forknumber_to_name(x.forknum) {
                        Some(fork) => format!("{}/{}/{}_{}", r.spcnode, r.dbnode, r.relnode, fork),
                        None => format!("{}/{}/{}", r.spcnode, r.dbnode, r.relnode),
                    }
                }),
                pg_constants::XLOG_SMGR_TRUNCATE => XlSmgrTruncate::decode(&mut data).ok().map(|x| {
                    let r = x.rnode;
                    format!("{}/{}/{} to {} blocks flags {}", r.spcnode, r.dbnode, r.relnode, x.blkno, x.flags)
                }),
                _ => None,
            },
            Rmgr::Standby if info == pg_constants::XLOG_RUNNING_XACTS => {
                XlRunningXacts::decode(&mut data).ok().map(|x| {
                    format!(
                        "nextXid {} latestCompletedXid {} oldestRunningXid {}; {} xacts; {} subxacts{}",
                        x.next_xid,
                        x.latest_completed_xid,
                        x.oldest_running_xid,
                        x.xcnt,
                        x.subxcnt,
                        if x.subxid_overflow { "; subxid overflowed" } else { "" }
                    )
                })
            }
            Rmgr::ReplOrigin => match info {
                pg_constants::XLOG_REPLORIGIN_SET => XlReploriginSet::decode(&mut data)
                    .ok()
                    .map(|x| format!("set {}; lsn {}", x.node_id, x.remote_lsn)),
                pg_constants::XLOG_REPLORIGIN_DROP => XlReploriginDrop::decode(&mut data)
                    .ok()
                    .map(|x| format!("drop {}", x.node_id)),
                _ => None,
            },
            Rmgr::LogicalMsg => XlLogicalMessage::decode(&mut data).ok().map(|x| {
                format!(
                    "{}, prefix size {}: message size {}",
                    if x.transactional { "transactional" } else { "non-transactional" },
                    x.prefix_size,
                    x.message_size
                )
            }),
            Rmgr::Tde => TdeRecord::decode(info, &data).ok().map(|r| r.describe()),
            _ => None,
        };
        let mut out = described.unwrap_or_else(|| format!("{} bytes of main data", decoded.main_data().len()));
        for blk in &decoded.blocks {
            out.push_str(&format!(
                ", blkref #{}: {}{}",
                blk.block_id,
                describe_block_ref(&blk.rnode, blk.forknum, blk.blkno),
                if blk.has_image { " FPW" } else { "" }
            ));
        }
        out
    }
}

fn describe_xlog(info: u8, decoded: &DecodedWALRecord) -> Option<String> {
    match info {
        pg_constants::XLOG_CHECKPOINT_SHUTDOWN | pg_constants::XLOG_CHECKPOINT_ONLINE => {
            let cp = decode_checkpoint(decoded)?;
            Some(format!(
                "redo {}; tli {}; prev tli {}; fpw {}; xid {}:{}; oid {}; multi {}; offset {}; \
                 oldest xid {} in DB {}; oldest multi {} in DB {}; oldest running xid {}; {}",
                Lsn(cp.redo),
                cp.ThisTimeLineID,
                cp.PrevTimeLineID,
                cp.fullPageWrites,
                cp.nextXid.epoch(),
                cp.nextXid.xid(),
                cp.nextOid,
                cp.nextMulti,
                cp.nextMultiOffset,
                cp.oldestXid,
                cp.oldestXidDB,
                cp.oldestMulti,
                cp.oldestMultiDB,
                cp.oldestActiveXid,
                if info == pg_constants::XLOG_CHECKPOINT_SHUTDOWN { "shutdown" } else { "online" }
            ))
        }
        pg_constants::XLOG_NEXTOID => {
            let data = decoded.main_data();
            let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
            Some(u32::from_le_bytes(raw).to_string())
        }
        pg_constants::XLOG_SWITCH | pg_constants::XLOG_NOOP => Some(String::new()),
        _ => None,
    }
}

/// A record handed to [`RmgrHandler::redo`].
pub struct RedoRecord<'a> {
    pub lsn: Lsn,
    pub end_lsn: Lsn,
    pub decoded: &'a DecodedWALRecord,
}

impl RedoRecord<'_> {
    pub fn info(&self) -> u8 {
        self.decoded.rmgr_info()
    }

    pub fn main_data(&self) -> Bytes {
        self.decoded.main_data()
    }
}

/// Callbacks of one resource manager. Only `redo` is required.
pub trait RmgrHandler: Send + Sync {
    /// Used in place of [`Rmgr::name`] for custom resource managers.
    fn name(&self) -> &str;

    fn redo(&self, record: &RedoRecord<'_>) -> WalResult<()>;

    fn startup(&self) {}

    fn cleanup(&self) {}

    /// Whether a restartpoint may be taken with this manager's state as it is.
    fn safe_restartpoint(&self) -> bool {
        true
    }

    fn identify(&self, _info: u8) -> Option<String> {
        None
    }

    fn describe(&self, _decoded: &DecodedWALRecord) -> Option<String> {
        None
    }
}

/// The dispatch table. Filled in at startup, then sealed.
pub struct RmgrTable {
    handlers: Vec<Option<Arc<dyn RmgrHandler>>>,
    sealed: bool,
}

impl Default for RmgrTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RmgrTable {
    pub fn new() -> RmgrTable {
        RmgrTable {
            handlers: vec![None; RmgrId::MAX as usize + 1],
            sealed: false,
        }
    }

    fn check_open(&self, what: &str) -> WalResult<()> {
        if self.sealed {
            return Err(WalError::bad_state(format!(
                "cannot register {what}: resource managers can only be registered at startup"
            )));
        }
        Ok(())
    }

    /// Install the handler of a built-in resource manager. Built-ins
    /// without a handler replay as no-ops.
    pub fn set_builtin_handler(&mut self, rmgr: Rmgr, handler: Arc<dyn RmgrHandler>) -> WalResult<()> {
        self.check_open(rmgr.name())?;
        if rmgr.is_custom() {
            return Err(WalError::bad_state(format!(
                "resource manager id {} is not a built-in",
                rmgr.id()
            )));
        }
        self.handlers[rmgr.id() as usize] = Some(handler);
        Ok(())
    }

    /// Register an extension's resource manager under `id`.
    pub fn register_custom(&mut self, id: RmgrId, handler: Arc<dyn RmgrHandler>) -> WalResult<()> {
        let name = handler.name().to_string();
        self.check_open(&name)?;
        if !(pg_constants::RM_MIN_CUSTOM_ID..=pg_constants::RM_MAX_CUSTOM_ID).contains(&id) {
            return Err(WalError::bad_state(format!(
                "custom resource manager \"{name}\" has invalid id {id}"
            )));
        }
        if name.is_empty() {
            return Err(WalError::bad_state(format!(
                "custom resource manager {id} has an empty name"
            )));
        }
        if let Some(existing) = &self.handlers[id as usize] {
            return Err(WalError::bad_state(format!(
                "failed to register custom resource manager \"{name}\" with id {id}: \
                 already registered by \"{}\"",
                existing.name()
            )));
        }
        let clash = self
            .handlers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i >= pg_constants::RM_MIN_CUSTOM_ID as usize)
            .filter_map(|(_, h)| h.as_ref())
            .any(|h| h.name().eq_ignore_ascii_case(&name));
        if clash {
            return Err(WalError::bad_state(format!(
                "failed to register custom resource manager \"{name}\" with id {id}: \
                 a resource manager with that name exists"
            )));
        }
        info!("registered custom resource manager \"{name}\" with id {id}");
        self.handlers[id as usize] = Some(handler);
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn handler(&self, id: RmgrId) -> Option<&Arc<dyn RmgrHandler>> {
        self.handlers[id as usize].as_ref()
    }

    pub fn name(&self, id: RmgrId) -> Option<String> {
        match Rmgr::from_id(id)? {
            Rmgr::Custom(id) => self.handler(id).map(|h| h.name().to_string()),
            rmgr => Some(rmgr.name().to_string()),
        }
    }

    /// Whether records of `id` can be replayed here.
    pub fn is_known(&self, id: RmgrId) -> bool {
        match Rmgr::from_id(id) {
            Some(Rmgr::Custom(id)) => self.handler(id).is_some(),
            Some(_) => true,
            None => false,
        }
    }

    pub fn redo(&self, record: &RedoRecord<'_>) -> WalResult<()> {
        let id = record.decoded.xl_rmid;
        let rmgr = Rmgr::from_id(id).ok_or_else(|| {
            WalError::corruption(record.lsn, format!("invalid resource manager ID {id}"))
        })?;
        match self.handler(id) {
            Some(handler) => handler.redo(record),
            None if rmgr.is_custom() => Err(WalError::corruption(
                record.lsn,
                format!("resource manager with ID {id} not registered"),
            )),
            None => {
                trace!("no redo handler for {}, skipping record at {}", rmgr.name(), record.lsn);
                Ok(())
            }
        }
    }

    /// "NAME/SUBTYPE" of a record, as WAL dump tools print it.
    pub fn identify(&self, decoded: &DecodedWALRecord) -> String {
        let id = decoded.xl_rmid;
        let name = self.name(id).unwrap_or_else(|| format!("custom{id:03}"));
        let subtype = match (Rmgr::from_id(id), self.handler(id)) {
            (_, Some(h)) if h.identify(decoded.xl_info).is_some() => h.identify(decoded.xl_info),
            (Some(rmgr), _) => rmgr.identify(decoded.xl_info).map(str::to_string),
            (None, _) => None,
        };
        match subtype {
            Some(s) => format!("{name}/{s}"),
            None => format!("{name}/UNKNOWN ({:X})", decoded.rmgr_info()),
        }
    }

    pub fn describe(&self, decoded: &DecodedWALRecord) -> String {
        let id = decoded.xl_rmid;
        if let Some(desc) = self.handler(id).and_then(|h| h.describe(decoded)) {
            return desc;
        }
        match Rmgr::from_id(id) {
            Some(rmgr) => rmgr.describe(decoded),
            None => format!("{} bytes of main data", decoded.main_data().len()),
        }
    }

    pub fn startup_all(&self) {
        for h in self.handlers.iter().flatten() {
            h.startup();
        }
    }

    pub fn cleanup_all(&self) {
        for h in self.handlers.iter().flatten() {
            h.cleanup();
        }
    }

    pub fn safe_restartpoint(&self) -> bool {
        self.handlers.iter().flatten().all(|h| h.safe_restartpoint())
    }
}
