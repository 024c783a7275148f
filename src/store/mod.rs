//! Store contract shared by the indexing core and its backends.
//!
//! The core only ever stages upserts and deletions, commits them, and
//! streams back the paths recorded for its own host. Everything else
//! (wire format, full-text analysis, secondary indexes) belongs to the
//! backend behind `ObjectStore`.

mod lmdb_store;
mod tantivy_store;

pub use lmdb_store::LmdbStore;
pub use tantivy_store::TantivyStore;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::object::{AiiRecord, FsObject, ObjectRecord};

/// One mutation produced by a watcher flush or the cleanup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbOperation {
    Update(FsObject),
    Delete(FsObject),
    /// `fpath` ends with the separator; removes every record below it
    DeletePrefix(FsObject),
}

impl DbOperation {
    pub fn fpath(&self) -> &str {
        match self {
            DbOperation::Update(o) | DbOperation::Delete(o) | DbOperation::DeletePrefix(o) => {
                &o.fpath
            }
        }
    }
}

/// Aggregate result of one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub updated: usize,
    pub deleted: usize,
}

impl CommitStats {
    pub fn is_empty(&self) -> bool {
        self.updated == 0 && self.deleted == 0
    }
}

/// Backend-private tuning read from the private configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// LMDB memory map size in MiB
    pub map_size_mb: usize,

    /// tantivy writer heap in MiB
    pub writer_heap_mb: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            map_size_mb: 1024,
            writer_heap_mb: 50,
        }
    }
}

/// Methods the indexing core relies on.
///
/// Mutations are staged and become visible on `commit()`. Implementations
/// are owned by exactly one thread (the DB controller's dispatcher).
pub trait ObjectStore: Send {
    /// Lower-cased host identity that scopes every record this store writes.
    fn host(&self) -> &str;

    /// Stages an upsert keyed by `object_id(host, fpath)`.
    fn update_obj(&mut self, obj: &FsObject) -> Result<(), StoreError>;

    /// Stages deletion of the object (and of its AII if still owned by it).
    fn delete_obj(&mut self, obj: &FsObject) -> Result<(), StoreError>;

    /// Stages deletion of every record of this host whose fpath starts with
    /// `obj.fpath`. Returns the number of committed records that match.
    fn delete_fpath_prefix(&mut self, obj: &FsObject) -> Result<usize, StoreError>;

    /// Applies staged mutations and resets the counters. A commit with an
    /// empty stage is a no-op returning zero counts.
    fn commit(&mut self) -> Result<CommitStats, StoreError>;

    /// Streams every stored fpath for this host through `matcher` and keeps
    /// the ones it accepts. Stops with `StoreError::Terminated` on term-long.
    fn load_host_paths(
        &self,
        matcher: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Vec<String>, StoreError>;

    /// Committed record for `id`, if any.
    fn get_obj(&self, id: &str) -> Result<Option<ObjectRecord>, StoreError>;

    /// Writes an AII immediately (query-side operation).
    fn set_aii(&mut self, id: &str, aii: &AiiRecord) -> Result<(), StoreError>;

    fn get_aii(&self, id: &str) -> Result<Option<AiiRecord>, StoreError>;

    /// In read-only mode commits only count would-be work.
    fn set_read_only(&mut self, read_only: bool);

    /// Counter consulted by long scans.
    fn cancel_token(&self) -> &CancelToken;

    fn term_long(&self) {
        self.cancel_token().term_long();
    }

    /// Releases backend resources. Further mutations fail with `Stopped`.
    fn stop(&mut self) -> Result<(), StoreError>;
}

/// Which backend a `--dbhost` value names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Lmdb(PathBuf),
    Tantivy(PathBuf),
}

impl StoreLocation {
    /// Parses `lmdb://DIR`, `tantivy://DIR`, or a bare directory (LMDB).
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("lmdb", s),
        };
        if rest.is_empty() {
            return Err(StoreError::InvalidLocation(s.to_string()));
        }
        match scheme {
            "lmdb" => Ok(StoreLocation::Lmdb(PathBuf::from(rest))),
            "tantivy" => Ok(StoreLocation::Tantivy(PathBuf::from(rest))),
            _ => Err(StoreError::InvalidLocation(s.to_string())),
        }
    }

    pub fn dir(&self) -> &Path {
        match self {
            StoreLocation::Lmdb(p) | StoreLocation::Tantivy(p) => p,
        }
    }
}

/// Opens the backend at `location`, database `dbid`, for `host`.
pub fn open_store(
    location: &StoreLocation,
    dbid: &str,
    host: &str,
    options: &StoreOptions,
    cancel: CancelToken,
) -> Result<Box<dyn ObjectStore>, StoreError> {
    if dbid.is_empty() || dbid.contains(std::path::MAIN_SEPARATOR) || dbid == ".." {
        return Err(StoreError::InvalidLocation(format!("database id '{}'", dbid)));
    }
    let db_path = location.dir().join(dbid);
    let store: Box<dyn ObjectStore> = match location {
        StoreLocation::Lmdb(_) => Box::new(LmdbStore::open(&db_path, host, options, cancel)?),
        StoreLocation::Tantivy(_) => {
            Box::new(TantivyStore::open(&db_path, host, options, cancel)?)
        }
    };
    Ok(store)
}

/// `a\0b`, the composite key used by ordered secondary indexes.
pub(crate) fn compound_key(a: &str, b: &str) -> String {
    format!("{}\0{}", a, b)
}
