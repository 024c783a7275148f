use heed::types::{SerdeBincode, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{compound_key, CommitStats, ObjectStore, StoreOptions};
use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::object::{object_id, AiiRecord, FsObject, ObjectRecord};

/// LMDB's compiled-in `MDB_MAXKEYSIZE`.
const MAX_KEY_LEN: usize = 511;

/// Longest `host\0fpath` head kept in a shortened key, leaving room for
/// `\0` and the 40-byte hex id.
const LONG_KEY_HEAD: usize = MAX_KEY_LEN - 41;

/// `key` cut to at most `len` bytes on a char boundary.
fn truncate_key(key: &str, len: usize) -> &str {
    if key.len() <= len {
        return key;
    }
    let mut cut = len;
    while !key.is_char_boundary(cut) {
        cut -= 1;
    }
    &key[..cut]
}

/// `host_paths` key of `fpath`. Keys over the LMDB limit keep their head
/// and end in `\0id`; the full fpath is then read back from `objects`.
fn path_key(host: &str, fpath: &str, id: &str) -> String {
    let key = compound_key(host, fpath);
    if key.len() <= MAX_KEY_LEN {
        return key;
    }
    compound_key(truncate_key(&key, LONG_KEY_HEAD), id)
}

/// Failures caused by the staged data itself rather than by the environment.
fn is_record_error(err: &heed::Error) -> bool {
    matches!(
        err,
        heed::Error::Mdb(heed::MdbError::BadValSize) | heed::Error::Encoding(_)
    )
}

/// Mutation waiting for the next commit.
#[derive(Debug, Clone)]
enum Staged {
    Upsert(ObjectRecord),
    Delete(String),
    DeletePrefix(String),
}

/// Key/value backend on LMDB (heed).
///
/// Databases:
/// - `objects`: id -> object record
/// - `host_paths`: `host\0fpath` -> id, ordered for per-host prefix scans
///   (see `path_key` for paths longer than an LMDB key)
/// - `aii`: id -> additional information item
/// - `aii_fields`: `field\0id` -> (), ids that have a given AII field set
pub struct LmdbStore {
    env: Option<Env>,
    objects: Database<Str, SerdeBincode<ObjectRecord>>,
    host_paths: Database<Str, Str>,
    aii: Database<Str, SerdeBincode<AiiRecord>>,
    aii_fields: Database<Str, Unit>,
    host: String,
    stage: Vec<Staged>,
    read_only: bool,
    cancel: CancelToken,
}

impl LmdbStore {
    /// Create or open the store in directory `db_path`.
    pub fn open(
        db_path: &Path,
        host: &str,
        options: &StoreOptions,
        cancel: CancelToken,
    ) -> Result<Self, StoreError> {
        info!("[db] opening LMDB store at {}", db_path.display());

        // LMDB expects a directory, not a file
        std::fs::create_dir_all(db_path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size_mb.max(1) * 1024 * 1024)
                .max_dbs(8)
                .open(db_path)?
        };

        let mut wtxn = env.write_txn()?;
        let objects = env.create_database(&mut wtxn, Some("objects"))?;
        let host_paths = env.create_database(&mut wtxn, Some("host_paths"))?;
        let aii = env.create_database(&mut wtxn, Some("aii"))?;
        let aii_fields = env.create_database(&mut wtxn, Some("aii_fields"))?;
        wtxn.commit()?;

        Ok(Self {
            env: Some(env),
            objects,
            host_paths,
            aii,
            aii_fields,
            host: host.to_string(),
            stage: Vec::new(),
            read_only: false,
            cancel,
        })
    }

    fn env(&self) -> Result<&Env, StoreError> {
        self.env.as_ref().ok_or(StoreError::Stopped)
    }

    /// Number of committed records of this host under `prefix`.
    fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let env = self.env()?;
        let rtxn = env.read_txn()?;
        Ok(self.fpaths_under(&rtxn, prefix)?.len())
    }

    /// Full fpath behind a `host_paths` entry.
    fn entry_fpath(&self, txn: &RoTxn, key: &str, id: &str) -> Result<Option<String>, StoreError> {
        let rest = &key[self.host.len() + 1..];
        if !rest.contains('\0') {
            return Ok(Some(rest.to_string()));
        }
        Ok(self.objects.get(txn, id)?.map(|record| record.fpath))
    }

    /// Committed fpaths of this host that start with `prefix`.
    fn fpaths_under(&self, txn: &RoTxn, prefix: &str) -> Result<Vec<String>, StoreError> {
        let key_prefix = compound_key(&self.host, prefix);
        let scan = truncate_key(&key_prefix, LONG_KEY_HEAD);
        let mut fpaths = Vec::new();
        for item in self.host_paths.prefix_iter(txn, scan)? {
            let (key, id) = item?;
            if let Some(fpath) = self.entry_fpath(txn, key, id)? {
                if fpath.starts_with(prefix) {
                    fpaths.push(fpath);
                }
            }
        }
        Ok(fpaths)
    }

    fn exists(&self, fpath: &str) -> Result<bool, StoreError> {
        let env = self.env()?;
        let rtxn = env.read_txn()?;
        Ok(self
            .objects
            .get(&rtxn, &object_id(&self.host, fpath))?
            .is_some())
    }

    fn apply_upsert(&self, wtxn: &mut RwTxn, record: &ObjectRecord) -> Result<(), StoreError> {
        self.objects.put(wtxn, &record.id, record)?;
        let key = path_key(&self.host, &record.fpath, &record.id);
        self.host_paths.put(wtxn, &key, &record.id)?;
        Ok(())
    }

    /// Removes one object; returns whether it existed.
    fn apply_delete(&self, wtxn: &mut RwTxn, fpath: &str) -> Result<bool, StoreError> {
        let id = object_id(&self.host, fpath);
        let existed = self.objects.delete(wtxn, &id)?;
        self.host_paths
            .delete(wtxn, &path_key(&self.host, fpath, &id))?;

        if let Some(aii) = self.aii.get(wtxn, &id)? {
            if aii.owner == fpath {
                self.delete_aii(wtxn, &id, &aii)?;
            }
        }
        Ok(existed)
    }

    fn apply_delete_prefix(&self, wtxn: &mut RwTxn, prefix: &str) -> Result<usize, StoreError> {
        let fpaths = self.fpaths_under(wtxn, prefix)?;
        let mut deleted = 0;
        for fpath in fpaths {
            if self.apply_delete(wtxn, &fpath)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn delete_aii(&self, wtxn: &mut RwTxn, id: &str, aii: &AiiRecord) -> Result<(), StoreError> {
        self.aii.delete(wtxn, id)?;
        for field in aii.populated_fields() {
            self.aii_fields.delete(wtxn, &compound_key(field, id))?;
        }
        Ok(())
    }

    /// Applies the whole stage in one write transaction.
    fn write_stage(&self) -> Result<CommitStats, StoreError> {
        let env = self.env()?.clone();
        let mut wtxn = env.write_txn()?;
        let mut stats = CommitStats::default();
        for staged in &self.stage {
            match staged {
                Staged::Upsert(record) => {
                    self.apply_upsert(&mut wtxn, record)?;
                    stats.updated += 1;
                }
                Staged::Delete(fpath) => {
                    stats.deleted += self.apply_delete(&mut wtxn, fpath)? as usize;
                }
                Staged::DeletePrefix(prefix) => {
                    stats.deleted += self.apply_delete_prefix(&mut wtxn, prefix)?;
                }
            }
        }
        wtxn.commit()?;
        Ok(stats)
    }

    /// Counts what the stage would do without touching the database.
    fn dry_run(&self) -> Result<CommitStats, StoreError> {
        let mut stats = CommitStats::default();
        for staged in &self.stage {
            match staged {
                Staged::Upsert(_) => stats.updated += 1,
                Staged::Delete(fpath) => stats.deleted += self.exists(fpath)? as usize,
                Staged::DeletePrefix(prefix) => stats.deleted += self.count_prefix(prefix)?,
            }
        }
        Ok(stats)
    }
}

impl ObjectStore for LmdbStore {
    fn host(&self) -> &str {
        &self.host
    }

    fn update_obj(&mut self, obj: &FsObject) -> Result<(), StoreError> {
        self.env()?;
        self.stage
            .push(Staged::Upsert(obj.clone().into_record(&self.host)));
        Ok(())
    }

    fn delete_obj(&mut self, obj: &FsObject) -> Result<(), StoreError> {
        self.env()?;
        self.stage.push(Staged::Delete(obj.fpath.clone()));
        Ok(())
    }

    fn delete_fpath_prefix(&mut self, obj: &FsObject) -> Result<usize, StoreError> {
        let count = self.count_prefix(&obj.fpath)?;
        self.stage.push(Staged::DeletePrefix(obj.fpath.clone()));
        Ok(count)
    }

    fn commit(&mut self) -> Result<CommitStats, StoreError> {
        if self.stage.is_empty() {
            return Ok(CommitStats::default());
        }

        if self.read_only {
            let stats = self.dry_run()?;
            self.stage.clear();
            debug!("[db] read-only commit: {:?}", stats);
            return Ok(stats);
        }

        match self.write_stage() {
            Ok(stats) => {
                self.stage.clear();
                Ok(stats)
            }
            Err(StoreError::Lmdb(e)) if is_record_error(&e) => {
                // Replaying the same stage would fail the same way.
                warn!(
                    "[db] dropping {} staged mutations: {}",
                    self.stage.len(),
                    e
                );
                self.stage.clear();
                Err(StoreError::Lmdb(e))
            }
            // Anything else keeps the stage for the next commit.
            Err(e) => Err(e),
        }
    }

    fn load_host_paths(
        &self,
        matcher: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Vec<String>, StoreError> {
        let snapshot = self.cancel.snapshot();
        let env = self.env()?;
        let rtxn = env.read_txn()?;

        let mut matched = Vec::new();
        for item in self.host_paths.prefix_iter(&rtxn, &compound_key(&self.host, ""))? {
            if snapshot.is_terminated() {
                return Err(StoreError::Terminated);
            }
            let (key, id) = item?;
            let Some(fpath) = self.entry_fpath(&rtxn, key, id)? else {
                continue;
            };
            if matcher(&fpath) {
                matched.push(fpath);
            }
        }
        Ok(matched)
    }

    fn get_obj(&self, id: &str) -> Result<Option<ObjectRecord>, StoreError> {
        let env = self.env()?;
        let rtxn = env.read_txn()?;
        Ok(self.objects.get(&rtxn, id)?)
    }

    fn set_aii(&mut self, id: &str, aii: &AiiRecord) -> Result<(), StoreError> {
        if self.read_only {
            return Ok(());
        }
        let env = self.env()?.clone();
        let mut wtxn = env.write_txn()?;
        if let Some(old) = self.aii.get(&wtxn, id)? {
            self.delete_aii(&mut wtxn, id, &old)?;
        }
        self.aii.put(&mut wtxn, id, aii)?;
        for field in aii.populated_fields() {
            self.aii_fields.put(&mut wtxn, &compound_key(field, id), &())?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn get_aii(&self, id: &str) -> Result<Option<AiiRecord>, StoreError> {
        let env = self.env()?;
        let rtxn = env.read_txn()?;
        Ok(self.aii.get(&rtxn, id)?)
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn stop(&mut self) -> Result<(), StoreError> {
        if !self.stage.is_empty() {
            debug!("[db] dropping {} uncommitted mutations", self.stage.len());
            self.stage.clear();
        }
        if self.env.take().is_some() {
            info!("[db] LMDB store closed");
        }
        Ok(())
    }
}

impl LmdbStore {
    /// Ids whose AII has `field` populated.
    #[cfg(test)]
    pub fn aii_ids_with_field(&self, field: &str) -> Result<Vec<String>, StoreError> {
        let env = self.env()?;
        let rtxn = env.read_txn()?;
        let prefix = compound_key(field, "");
        let mut ids = Vec::new();
        for item in self.aii_fields.prefix_iter(&rtxn, &prefix)? {
            let (key, ()) = item?;
            ids.push(key[prefix.len()..].to_string());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::fields;
    use crate::store::contract;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LmdbStore {
        LmdbStore::open(
            &dir.path().join("db"),
            "testhost",
            &StoreOptions {
                map_size_mb: 16,
                ..Default::default()
            },
            CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_contract() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        contract::run_all(&mut store);
    }

    #[test]
    fn test_aii_field_index() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let id = object_id("testhost", "/r/a");
        store
            .set_aii(
                &id,
                &AiiRecord {
                    tags: vec!["red".into()],
                    descr: "x".into(),
                    owner: "/r/a".into(),
                },
            )
            .unwrap();
        assert_eq!(store.aii_ids_with_field(fields::TAGS).unwrap(), vec![id.clone()]);
        assert_eq!(store.aii_ids_with_field(fields::DESCR).unwrap(), vec![id.clone()]);

        store.update_obj(&FsObject::for_path("/r/a")).unwrap();
        store.commit().unwrap();
        store.delete_obj(&FsObject::for_path("/r/a")).unwrap();
        store.commit().unwrap();
        assert!(store.aii_ids_with_field(fields::TAGS).unwrap().is_empty());
    }

    #[test]
    fn test_paths_longer_than_a_key() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let ascii = format!("/r/deep/{}", "x".repeat(600));
        let wide = format!("/r/deep/{}", "é".repeat(300));
        for p in [ascii.as_str(), wide.as_str(), "/r/short"] {
            store.update_obj(&FsObject::for_path(p)).unwrap();
        }
        assert_eq!(store.commit().unwrap().updated, 3);
        assert!(store
            .get_obj(&object_id("testhost", "/r/short"))
            .unwrap()
            .is_some());

        let mut all = store.load_host_paths(&mut |_: &str| true).unwrap();
        all.sort();
        let mut expected = vec![ascii.clone(), wide.clone(), "/r/short".to_string()];
        expected.sort();
        assert_eq!(all, expected);

        let deep = FsObject::for_path(&ascii[..560]);
        assert_eq!(store.delete_fpath_prefix(&deep).unwrap(), 1);
        assert_eq!(store.commit().unwrap().deleted, 1);

        store.delete_obj(&FsObject::for_path(&wide)).unwrap();
        assert_eq!(store.commit().unwrap().deleted, 1);
        assert_eq!(
            store.load_host_paths(&mut |_: &str| true).unwrap(),
            vec!["/r/short"]
        );
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir);
            store.update_obj(&FsObject::for_path("/r/a")).unwrap();
            store.commit().unwrap();
            store.stop().unwrap();
        }
        let store = open(&dir);
        assert!(store
            .get_obj(&object_id("testhost", "/r/a"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_stopped_store_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        store.stop().unwrap();
        store.stop().unwrap();
        assert!(matches!(
            store.update_obj(&FsObject::for_path("/r/a")),
            Err(StoreError::Stopped)
        ));
    }
}
