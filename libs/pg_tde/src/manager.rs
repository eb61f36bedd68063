//! The key manager: one per server, owning every key file in the key
//! directory.
//!
//! Mutations of the key files are serialized by the `state` write lock.
//! Lookups that miss the cache take it upgradable-shared and keep it from
//! principal key retrieval until the internal key is decrypted, so a
//! rotation can never re-wrap a key between the two.
//!
//! Lock order is `state`, then `wal`, then `cache`. The WAL write path only
//! ever takes `wal`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use postgres_ffi::{Oid, RelFileNode, TimeLineID};
use tracing::{debug, info, warn};
use utils::lsn::Lsn;

use crate::encryption::InternalKey;
use crate::error::{TdeError, TdeResult};
use crate::key_cache::KeyCache;
use crate::keymap::{
    encode_file_header, DataSlot, KeyType, RelKeyMap, PG_TDE_FILEMAGIC, ROTATION_SUFFIX,
};
use crate::principal_key::{
    PrincipalKey, PrincipalKeyInfo, PrincipalKeyProvider, SignedPrincipalKeyInfo,
};
use crate::wal_keys::{WalKey, WalKeyFile, WalKeyRange, WalKeyType, PG_TDE_WAL_KEY_FILE_MAGIC};
use crate::xlog::{KeyMapXLog, RotatedKeyFiles, TdeRecord};

/// Pseudo-database owning the server principal key, which wraps the WAL keys
/// and the keys of shared relations.
pub const GLOBAL_DATA_TDE_OID: Oid = 1664;

#[derive(Default)]
struct KeyMapState {
    principal_keys: HashMap<Oid, PrincipalKey>,
}

#[derive(Default)]
struct WalKeyState {
    /// Key new WAL is written with; its start is patched on first use.
    current: Option<WalKey>,
    /// Ranges for reading, `None` until loaded.
    ranges: Option<Vec<WalKeyRange>>,
}

/// A key created in the current transaction, freed if it aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingCreate {
    locator: RelFileNode,
    key_type: KeyType,
    index: u32,
}

pub struct TdeKeyManager {
    key_dir: PathBuf,
    provider: Arc<dyn PrincipalKeyProvider>,
    xlog: OnceCell<Arc<dyn KeyMapXLog>>,
    state: RwLock<KeyMapState>,
    wal: Mutex<WalKeyState>,
    cache: Mutex<KeyCache>,
    pending: Mutex<Vec<PendingCreate>>,
}

impl TdeKeyManager {
    /// Open the key directory, creating it if needed. Leftovers of a
    /// rotation that crashed before its WAL record was written are removed;
    /// if the record made it, replay rewrites the files anyway.
    pub fn open(key_dir: impl Into<PathBuf>, provider: Arc<dyn PrincipalKeyProvider>) -> TdeResult<TdeKeyManager> {
        let key_dir = key_dir.into();
        utils::crashsafe::create_dir_all(&key_dir).map_err(|e| TdeError::io(&key_dir, e))?;
        let entries = std::fs::read_dir(&key_dir).map_err(|e| TdeError::io(&key_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| TdeError::io(&key_dir, e))?.path();
            if path.extension().map_or(false, |ext| ext == ROTATION_SUFFIX) {
                warn!("removing leftover of interrupted key rotation {}", path.display());
                std::fs::remove_file(&path).map_err(|e| TdeError::io(&path, e))?;
            }
        }
        Ok(TdeKeyManager {
            key_dir,
            provider,
            xlog: OnceCell::new(),
            state: RwLock::new(KeyMapState::default()),
            wal: Mutex::new(WalKeyState::default()),
            cache: Mutex::new(KeyCache::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Route key file changes into the WAL. Until this is called (offline
    /// tools, early startup) changes are not logged.
    pub fn attach_xlog(&self, xlog: Arc<dyn KeyMapXLog>) {
        if self.xlog.set(xlog).is_err() {
            warn!("key manager already attached to a WAL writer");
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    fn log(&self, record: &TdeRecord) -> TdeResult<Option<Lsn>> {
        match self.xlog.get() {
            Some(xlog) => xlog
                .log_tde_record(record.info(), &record.encode())
                .map(Some)
                .map_err(TdeError::Xlog),
            None => {
                debug!("not logging {}: no WAL attached", record.describe());
                Ok(None)
            }
        }
    }

    fn relmap(&self, db: Oid) -> RelKeyMap {
        RelKeyMap::new(&self.key_dir, db)
    }

    fn wal_key_file(&self) -> WalKeyFile {
        WalKeyFile::new(&self.key_dir)
    }

    fn read_principal_header(&self, db: Oid) -> TdeResult<Option<SignedPrincipalKeyInfo>> {
        if let Some(signed) = self.relmap(db).read_header()? {
            return Ok(Some(signed));
        }
        if db == GLOBAL_DATA_TDE_OID {
            return self.wal_key_file().read_header();
        }
        Ok(None)
    }

    /// Principal key of `db`, fetched from the keyring on first use and
    /// checked against the key file header.
    fn load_principal(&self, state: &mut KeyMapState, db: Oid) -> TdeResult<PrincipalKey> {
        if let Some(pk) = state.principal_keys.get(&db) {
            return Ok(pk.clone());
        }
        let signed = self
            .read_principal_header(db)?
            .ok_or(TdeError::NoPrincipalKey(db))?;
        let key_data = self
            .provider
            .get_key(&signed.info.name)?
            .ok_or_else(|| TdeError::KeyNotInKeyring {
                name: signed.info.name.clone(),
            })?;
        if !signed.verify(&key_data) {
            return Err(TdeError::PrincipalKeyMismatch {
                name: signed.info.name,
            });
        }
        let pk = PrincipalKey {
            info: signed.info,
            key_data,
        };
        debug!(db, "loaded principal key \"{}\"", pk.info.name);
        state.principal_keys.insert(db, pk.clone());
        Ok(pk)
    }

    pub fn has_principal_key(&self, db: Oid) -> TdeResult<bool> {
        Ok(self.read_principal_header(db)?.is_some())
    }

    pub fn principal_key_info(&self, db: Oid) -> TdeResult<Option<PrincipalKeyInfo>> {
        Ok(self.read_principal_header(db)?.map(|s| s.info))
    }

    fn install_principal_header(&self, db: Oid, signed: &SignedPrincipalKeyInfo) -> TdeResult<()> {
        let map = self.relmap(db);
        if !map.exists() {
            let header = encode_file_header(signed, PG_TDE_FILEMAGIC);
            map.write_files(&header, &header)?;
        }
        if db == GLOBAL_DATA_TDE_OID {
            let wk = self.wal_key_file();
            if !wk.exists() {
                wk.write_file(&encode_file_header(signed, PG_TDE_WAL_KEY_FILE_MAGIC))?;
            }
        }
        Ok(())
    }

    /// Make `name` the principal key of `db`, creating it in the keyring if
    /// it does not exist. A database that already has a different principal
    /// key gets its key files rotated.
    pub fn set_principal_key(&self, db: Oid, name: &str) -> TdeResult<()> {
        let mut state = self.state.write();
        let key_data = match self.provider.get_key(name)? {
            Some(k) => k,
            None => self.provider.create_key(name)?,
        };
        let new = PrincipalKey {
            info: PrincipalKeyInfo {
                database_id: db,
                keyring_id: self.provider.keyring_id(),
                creation_time: postgres_ffi::xlog_utils::current_pg_time(),
                name: name.to_string(),
            },
            key_data,
        };

        if self.read_principal_header(db)?.is_none() {
            let signed = SignedPrincipalKeyInfo::sign(&new)?;
            self.log(&TdeRecord::AddPrincipalKey {
                db_oid: db,
                signed: signed.clone(),
            })?;
            self.install_principal_header(db, &signed)?;
            state.principal_keys.insert(db, new);
            info!(db, "principal key set to \"{name}\"");
            return Ok(());
        }

        let old = self.load_principal(&mut state, db)?;
        if old.same_key(&new) {
            return Ok(());
        }
        self.rotate_locked(&mut state, db, &old, &new)
    }

    /// Re-wrap every key of `db` from `old` to `new`.
    pub fn rotate_principal(&self, db: Oid, old: &PrincipalKey, new: &PrincipalKey) -> TdeResult<()> {
        let mut state = self.state.write();
        self.rotate_locked(&mut state, db, old, new)
    }

    fn rotate_locked(
        &self,
        state: &mut KeyMapState,
        db: Oid,
        old: &PrincipalKey,
        new: &PrincipalKey,
    ) -> TdeResult<()> {
        let map = self.relmap(db);
        if map.exists() {
            let files = map.build_rotated(old, new)?;
            let record = TdeRecord::RotatePrincipalKey {
                db_oid: db,
                files: RotatedKeyFiles::RelationMap(files),
            };
            if let Err(e) = self.log(&record) {
                map.discard_rotated();
                return Err(e);
            }
            map.install_rotated()?;
        }

        let wk = self.wal_key_file();
        let rotate_wal = db == GLOBAL_DATA_TDE_OID && wk.exists();
        if rotate_wal {
            let content = wk.build_rotated(old, new)?;
            let record = TdeRecord::RotatePrincipalKey {
                db_oid: db,
                files: RotatedKeyFiles::WalKeys(content),
            };
            if let Err(e) = self.log(&record) {
                wk.discard_rotated();
                return Err(e);
            }
            wk.install_rotated()?;
        }

        state.principal_keys.insert(db, new.clone());
        info!(
            db,
            "rotated principal key from \"{}\" to \"{}\"", old.info.name, new.info.name
        );

        if rotate_wal {
            // new WAL is written under a key wrapped by the new principal key
            let key_type = self.wal.lock().current.as_ref().map(|k| k.key_type);
            if let Some(key_type) = key_type {
                self.start_wal_key_locked(state, key_type)?;
            }
        }
        Ok(())
    }

    /// Generate, store and log a key for a new relation.
    pub fn create_relation_key(&self, locator: &RelFileNode, key_type: KeyType) -> TdeResult<InternalKey> {
        let mut state = self.state.write();
        let principal = self.load_principal(&mut state, locator.dbnode)?;
        let key = InternalKey::generate();
        let slot = DataSlot::wrap(&principal, locator, key_type, &key)?;
        self.log(&TdeRecord::AddRelationKey {
            locator: *locator,
            key_type,
            slot: slot.clone(),
        })?;
        let index = self.relmap(locator.dbnode).insert(locator, key_type, &slot)?;
        self.pending.lock().push(PendingCreate {
            locator: *locator,
            key_type,
            index,
        });
        self.cache.lock().put(*locator, key_type, &key);
        Ok(key)
    }

    /// The key of a relation, or `None` if it is not encrypted.
    pub fn lookup_key(&self, locator: &RelFileNode, key_type: KeyType) -> TdeResult<Option<InternalKey>> {
        if let Some(key) = self.cache.lock().get(locator, key_type) {
            return Ok(Some(key));
        }
        let map = self.relmap(locator.dbnode);

        let mut state = self.state.upgradable_read();
        if !map.exists() {
            return Ok(None);
        }
        let cached = state.principal_keys.get(&locator.dbnode).cloned();
        let principal = match cached {
            Some(pk) => pk,
            None => {
                let mut write = RwLockUpgradableReadGuard::upgrade(state);
                let pk = self.load_principal(&mut write, locator.dbnode)?;
                state = RwLockWriteGuard::downgrade_to_upgradable(write);
                pk
            }
        };
        let Some((index, _)) = map.find(locator, key_type)? else {
            return Ok(None);
        };
        let key = map.read_slot(index)?.unwrap_key(&principal, locator, key_type)?;
        self.cache.lock().put(*locator, key_type, &key);
        drop(state);
        Ok(Some(key))
    }

    /// Drop the key of a relation being removed.
    pub fn delete_key(&self, locator: &RelFileNode, key_type: KeyType) -> TdeResult<()> {
        let _state = self.state.write();
        let map = self.relmap(locator.dbnode);
        if !map.exists() {
            return Ok(());
        }
        if let Some((index, _)) = map.find(locator, key_type)? {
            self.free_locked(&map, locator, key_type, index)?;
        }
        self.cache.lock().remove(locator, key_type);
        Ok(())
    }

    /// Free map entry `offset` if it still belongs to `locator`.
    pub fn free_key(&self, locator: &RelFileNode, key_type: KeyType, offset: u32) -> TdeResult<()> {
        let _state = self.state.write();
        let map = self.relmap(locator.dbnode);
        self.free_locked(&map, locator, key_type, offset)?;
        self.cache.lock().remove(locator, key_type);
        Ok(())
    }

    fn free_locked(&self, map: &RelKeyMap, locator: &RelFileNode, key_type: KeyType, index: u32) -> TdeResult<bool> {
        let owned = map
            .entries()?
            .get(index as usize)
            .map_or(false, |(_, e)| e.matches(locator, key_type));
        if !owned {
            return Ok(false);
        }
        self.log(&TdeRecord::FreeMapEntry {
            locator: *locator,
            key_type,
            index,
        })?;
        map.free_entry(index, locator, key_type)
    }

    /// Give the key of `old` to `new`, as when a relation moves to another
    /// tablespace.
    pub fn move_relation_key(&self, old: &RelFileNode, new: &RelFileNode, key_type: KeyType) -> TdeResult<()> {
        let Some(key) = self.lookup_key(old, key_type)? else {
            return Ok(());
        };
        {
            let mut state = self.state.write();
            let principal = self.load_principal(&mut state, new.dbnode)?;
            let slot = DataSlot::wrap(&principal, new, key_type, &key)?;
            self.log(&TdeRecord::AddRelationKey {
                locator: *new,
                key_type,
                slot: slot.clone(),
            })?;
            self.relmap(new.dbnode).insert(new, key_type, &slot)?;
            self.cache.lock().put(*new, key_type, &key);
        }
        self.delete_key(old, key_type)
    }

    /// Forget keys created since the last call, freeing them on abort.
    pub fn at_xact_end(&self, commit: bool) -> TdeResult<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if commit {
            return Ok(());
        }
        for p in pending {
            self.free_key(&p.locator, p.key_type, p.index)?;
            debug!(rel = p.locator.relnode, "freed key of aborted relation");
        }
        Ok(())
    }

    /// Free entries of `db` whose relation no longer exists. Abort
    /// registration is process-local, so keys created by a transaction that
    /// was interrupted by a crash are only reclaimed here.
    pub fn gc_orphaned_entries(
        &self,
        db: Oid,
        is_live: impl Fn(&RelFileNode, KeyType) -> bool,
    ) -> TdeResult<usize> {
        let _state = self.state.write();
        let map = self.relmap(db);
        if !map.exists() {
            return Ok(0);
        }
        let mut freed = 0;
        for (index, entry) in map.entries()? {
            let Some(key_type) = KeyType::from_flags(entry.flags) else {
                continue;
            };
            let locator = RelFileNode {
                spcnode: entry.spc_oid,
                dbnode: db,
                relnode: entry.rel_number,
            };
            if is_live(&locator, key_type) {
                continue;
            }
            if self.free_locked(&map, &locator, key_type, index)? {
                self.cache.lock().remove(&locator, key_type);
                freed += 1;
            }
        }
        if freed > 0 {
            info!(db, freed, "freed orphaned relation key entries");
        }
        Ok(freed)
    }

    /// Open a new WAL key range. Called at every server start and whenever
    /// encryption is switched on or off.
    pub fn start_wal_key(&self, encrypt: bool) -> TdeResult<()> {
        let key_type = if encrypt {
            WalKeyType::Encrypted
        } else {
            WalKeyType::Unencrypted
        };
        let mut state = self.state.write();
        self.start_wal_key_locked(&mut state, key_type)
    }

    fn start_wal_key_locked(&self, state: &mut KeyMapState, key_type: WalKeyType) -> TdeResult<()> {
        let principal = match self.load_principal(state, GLOBAL_DATA_TDE_OID) {
            Ok(pk) => pk,
            Err(TdeError::NoPrincipalKey(_)) if key_type == WalKeyType::Unencrypted => {
                self.wal.lock().current = None;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let wk = self.wal_key_file();
        let key = wk.create_key(&principal, key_type)?;
        let ranges = wk.fetch_ranges(&principal)?;
        let mut wal = self.wal.lock();
        wal.current = Some(key);
        wal.ranges = Some(ranges);
        info!(?key_type, "started new WAL key");
        Ok(())
    }

    /// Key to encrypt WAL written at `lsn` with, `None` if WAL is written in
    /// the clear. The first call after a new key was started fixes its start
    /// to `lsn`, which must be the page-aligned start of the write.
    pub fn wal_key_for_write(&self, lsn: Lsn, tli: TimeLineID) -> TdeResult<Option<InternalKey>> {
        let mut wal = self.wal.lock();
        let WalKeyState { current, ranges } = &mut *wal;
        let Some(key) = current.as_mut() else {
            return Ok(None);
        };
        if !key.start_lsn.is_valid() {
            self.wal_key_file().set_last_key_start(lsn, tli)?;
            key.start_lsn = lsn;
            key.start_tli = tli;
            if let Some(ranges) = ranges.as_mut() {
                ranges.retain(|r| r.start < lsn);
                if let Some(last) = ranges.last_mut() {
                    last.end = lsn;
                }
                ranges.push(WalKeyRange {
                    start: lsn,
                    end: Lsn::MAX,
                    key_type: key.key_type,
                    key: key.key.clone(),
                });
            }
        }
        Ok((key.key_type == WalKeyType::Encrypted).then(|| key.key.clone()))
    }

    /// Key ranges overlapping `[start, end)`.
    pub fn wal_key_ranges(&self, start: Lsn, end: Lsn) -> TdeResult<Vec<WalKeyRange>> {
        let overlapping = |ranges: &[WalKeyRange]| -> Vec<WalKeyRange> {
            ranges.iter().filter(|r| r.overlaps(start, end)).cloned().collect()
        };
        if let Some(ranges) = &self.wal.lock().ranges {
            return Ok(overlapping(ranges));
        }

        let mut state = self.state.write();
        let wk = self.wal_key_file();
        let ranges = if wk.exists() {
            let principal = self.load_principal(&mut state, GLOBAL_DATA_TDE_OID)?;
            wk.fetch_ranges(&principal)?
        } else {
            Vec::new()
        };
        let result = overlapping(&ranges);
        self.wal.lock().ranges = Some(ranges);
        Ok(result)
    }

    /// Apply a TDE WAL record to the key files.
    pub fn redo(&self, info: u8, payload: &[u8]) -> TdeResult<()> {
        let record = TdeRecord::decode(info, payload).map_err(|e| {
            TdeError::corrupted(&self.key_dir, format!("undecodable key change record: {e}"))
        })?;
        debug!("redo {}", record.describe());
        let mut state = self.state.write();
        match record {
            TdeRecord::AddRelationKey {
                locator,
                key_type,
                slot,
            } => {
                let map = self.relmap(locator.dbnode);
                if !map.exists() {
                    return Err(TdeError::NoPrincipalKey(locator.dbnode));
                }
                map.insert(&locator, key_type, &slot)?;
                self.cache.lock().remove(&locator, key_type);
            }
            TdeRecord::FreeMapEntry {
                locator,
                key_type,
                index,
            } => {
                self.relmap(locator.dbnode).free_entry(index, &locator, key_type)?;
                self.cache.lock().remove(&locator, key_type);
            }
            TdeRecord::RotatePrincipalKey { db_oid, files } => {
                match files {
                    RotatedKeyFiles::RelationMap(files) => {
                        self.relmap(db_oid).write_files(&files.map, &files.dat)?;
                    }
                    RotatedKeyFiles::WalKeys(content) => {
                        self.wal_key_file().write_file(&content)?;
                        self.wal.lock().ranges = None;
                    }
                }
                state.principal_keys.remove(&db_oid);
            }
            TdeRecord::AddPrincipalKey { db_oid, signed } => {
                self.install_principal_header(db_oid, &signed)?;
                state.principal_keys.remove(&db_oid);
                self.wal.lock().ranges = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal_key::FileKeyring;

    #[derive(Default)]
    struct RecordingXLog {
        records: Mutex<Vec<(u8, Vec<u8>)>>,
    }

    impl KeyMapXLog for RecordingXLog {
        fn log_tde_record(&self, info: u8, payload: &[u8]) -> anyhow::Result<Lsn> {
            let mut records = self.records.lock();
            records.push((info, payload.to_vec()));
            Ok(Lsn(records.len() as u64 * 0x100))
        }
    }

    fn rel(db: Oid, n: u32) -> RelFileNode {
        RelFileNode {
            spcnode: 1663,
            dbnode: db,
            relnode: n,
        }
    }

    fn setup(dir: &Path) -> (TdeKeyManager, Arc<RecordingXLog>) {
        let keyring = Arc::new(FileKeyring::new(1, dir.join("keyring.json")));
        let mgr = TdeKeyManager::open(dir.join("pg_tde"), keyring).unwrap();
        let xlog = Arc::new(RecordingXLog::default());
        mgr.attach_xlog(xlog.clone());
        (mgr, xlog)
    }

    #[test]
    fn keys_survive_restart_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = setup(dir.path());
        assert!(matches!(
            mgr.create_relation_key(&rel(5, 1), KeyType::HeapBasic),
            Err(TdeError::NoPrincipalKey(5))
        ));

        mgr.set_principal_key(5, "pk1").unwrap();
        let k1 = mgr.create_relation_key(&rel(5, 1), KeyType::HeapBasic).unwrap();
        let k2 = mgr.create_relation_key(&rel(5, 2), KeyType::Smgr).unwrap();
        mgr.at_xact_end(true).unwrap();

        mgr.set_principal_key(5, "pk2").unwrap();
        mgr.set_principal_key(5, "pk1").unwrap();
        drop(mgr);

        let (mgr, _) = setup(dir.path());
        assert_eq!(mgr.principal_key_info(5).unwrap().unwrap().name, "pk1");
        assert_eq!(mgr.lookup_key(&rel(5, 1), KeyType::HeapBasic).unwrap(), Some(k1));
        assert_eq!(mgr.lookup_key(&rel(5, 2), KeyType::Smgr).unwrap(), Some(k2));
        assert_eq!(mgr.lookup_key(&rel(5, 2), KeyType::HeapBasic).unwrap(), None);
        assert_eq!(mgr.lookup_key(&rel(6, 1), KeyType::HeapBasic).unwrap(), None);
    }

    #[test]
    fn abort_frees_created_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = setup(dir.path());
        mgr.set_principal_key(5, "pk").unwrap();

        mgr.create_relation_key(&rel(5, 10), KeyType::HeapBasic).unwrap();
        mgr.at_xact_end(true).unwrap();
        mgr.create_relation_key(&rel(5, 11), KeyType::HeapBasic).unwrap();
        mgr.at_xact_end(false).unwrap();

        assert!(mgr.lookup_key(&rel(5, 10), KeyType::HeapBasic).unwrap().is_some());
        assert!(mgr.lookup_key(&rel(5, 11), KeyType::HeapBasic).unwrap().is_none());

        // the freed entry is reused
        mgr.create_relation_key(&rel(5, 12), KeyType::HeapBasic).unwrap();
        assert_eq!(mgr.relmap(5).entries().unwrap().len(), 2);
    }

    #[test]
    fn gc_frees_entries_of_dropped_relations() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = setup(dir.path());
        mgr.set_principal_key(5, "pk").unwrap();
        for n in 1..=4 {
            mgr.create_relation_key(&rel(5, n), KeyType::HeapBasic).unwrap();
        }
        mgr.at_xact_end(true).unwrap();

        let freed = mgr.gc_orphaned_entries(5, |l, _| l.relnode % 2 == 0).unwrap();
        assert_eq!(freed, 2);
        assert!(mgr.lookup_key(&rel(5, 1), KeyType::HeapBasic).unwrap().is_none());
        assert!(mgr.lookup_key(&rel(5, 2), KeyType::HeapBasic).unwrap().is_some());
        assert_eq!(mgr.gc_orphaned_entries(5, |l, _| l.relnode % 2 == 0).unwrap(), 0);
    }

    #[test]
    fn move_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = setup(dir.path());
        mgr.set_principal_key(5, "pk").unwrap();
        let key = mgr.create_relation_key(&rel(5, 1), KeyType::Smgr).unwrap();
        let moved = RelFileNode {
            spcnode: 1700,
            ..rel(5, 1)
        };
        mgr.move_relation_key(&rel(5, 1), &moved, KeyType::Smgr).unwrap();
        assert_eq!(mgr.lookup_key(&moved, KeyType::Smgr).unwrap(), Some(key));
        assert_eq!(mgr.lookup_key(&rel(5, 1), KeyType::Smgr).unwrap(), None);

        mgr.delete_key(&moved, KeyType::Smgr).unwrap();
        assert_eq!(mgr.lookup_key(&moved, KeyType::Smgr).unwrap(), None);
    }

    #[test]
    fn standby_replays_key_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, xlog) = setup(dir.path());
        primary.set_principal_key(5, "pk1").unwrap();
        primary.create_relation_key(&rel(5, 1), KeyType::HeapBasic).unwrap();
        let b = primary.create_relation_key(&rel(5, 2), KeyType::HeapBasic).unwrap();
        primary.delete_key(&rel(5, 1), KeyType::HeapBasic).unwrap();
        primary.set_principal_key(5, "pk2").unwrap();

        // same keyring, separate key directory
        let keyring = Arc::new(FileKeyring::new(1, dir.path().join("keyring.json")));
        let standby = TdeKeyManager::open(dir.path().join("standby_tde"), keyring).unwrap();
        for (info, payload) in xlog.records.lock().iter() {
            standby.redo(*info, payload).unwrap();
        }
        assert_eq!(standby.principal_key_info(5).unwrap().unwrap().name, "pk2");
        assert_eq!(standby.lookup_key(&rel(5, 1), KeyType::HeapBasic).unwrap(), None);
        assert_eq!(standby.lookup_key(&rel(5, 2), KeyType::HeapBasic).unwrap(), Some(b));
    }

    #[test]
    fn wal_keys_cover_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = setup(dir.path());
        assert!(matches!(mgr.start_wal_key(true), Err(TdeError::NoPrincipalKey(_))));
        // unencrypted WAL needs no principal key
        mgr.start_wal_key(false).unwrap();
        assert_eq!(mgr.wal_key_for_write(Lsn(0x1000), 1).unwrap(), None);

        mgr.set_principal_key(GLOBAL_DATA_TDE_OID, "server").unwrap();
        mgr.start_wal_key(true).unwrap();
        let k1 = mgr.wal_key_for_write(Lsn(0x0100_0000), 1).unwrap().unwrap();
        assert_eq!(mgr.wal_key_for_write(Lsn(0x0100_2000), 1).unwrap(), Some(k1.clone()));

        mgr.set_principal_key(GLOBAL_DATA_TDE_OID, "server2").unwrap();
        let k2 = mgr.wal_key_for_write(Lsn(0x0100_4000), 1).unwrap().unwrap();
        assert_ne!(k1, k2);

        let ranges = mgr.wal_key_ranges(Lsn(0), Lsn::MAX).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].end), (Lsn(0x0100_0000), Lsn(0x0100_4000)));
        assert_eq!(ranges[1].start, Lsn(0x0100_4000));
        drop(mgr);

        let (mgr, _) = setup(dir.path());
        let reread = mgr.wal_key_ranges(Lsn(0x0100_3000), Lsn(0x0100_5000)).unwrap();
        assert_eq!(reread, ranges);
        assert!(mgr.wal_key_ranges(Lsn(0), Lsn(0x0100_0000)).unwrap().is_empty());
    }
}
