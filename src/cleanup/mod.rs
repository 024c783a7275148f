//! One-shot removal of records whose paths no longer make sense.
//!
//! A record is dropped when its path is outside every configured root
//! (misconfigured) or no longer exists on disk (stale).

use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::MAIN_SEPARATOR;
use std::sync::Arc;
use tracing::{info, warn};

use crate::controller::DbSender;
use crate::error::Result;
use crate::object::FsObject;
use crate::store::DbOperation;

/// What one cleanup pass found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Records examined
    pub scanned: usize,
    /// Records outside every root
    pub misconfigured: usize,
    /// Records whose path is gone
    pub stale: usize,
    /// Records kept because their path could not be checked
    pub unchecked: usize,
}

impl CleanupStats {
    pub fn removed(&self) -> usize {
        self.misconfigured + self.stale
    }
}

/// True when `path` is `root` itself or lies below it.
pub fn under_root(path: &str, root: &str) -> bool {
    if path == root {
        return true;
    }
    if root.ends_with(MAIN_SEPARATOR) {
        return path.starts_with(root);
    }
    path.strip_prefix(root)
        .is_some_and(|rest| rest.starts_with(MAIN_SEPARATOR))
}

/// Decides whether a stored path must be removed, updating `stats`.
fn should_remove(path: &str, roots: &[String], stats: &mut CleanupStats) -> bool {
    stats.scanned += 1;
    if !roots.iter().any(|root| under_root(path, root)) {
        stats.misconfigured += 1;
        return true;
    }
    match fs::symlink_metadata(path) {
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            stats.stale += 1;
            true
        }
        Err(e) => {
            warn!("[cleanup] cannot check {}: {}", path, e);
            stats.unchecked += 1;
            false
        }
    }
}

/// Scans every record of this host and deletes the misconfigured and
/// stale ones in a single batch.
pub async fn run_cleanup(db: &DbSender, roots: &[String]) -> Result<CleanupStats> {
    info!("[cleanup] started for {} roots", roots.len());
    let stats = Arc::new(Mutex::new(CleanupStats::default()));

    let matcher_stats = Arc::clone(&stats);
    let matcher_roots = roots.to_vec();
    let marked = db
        .load_host_paths(Box::new(move |path: &str| {
            should_remove(path, &matcher_roots, &mut matcher_stats.lock())
        }))
        .await?;

    if !marked.is_empty() {
        let ops = marked
            .into_iter()
            .map(|p| DbOperation::Delete(FsObject::for_path(p)))
            .collect();
        db.send_batch(ops).await?;
    }

    let stats = *stats.lock();
    info!(
        "[cleanup] done: scanned={} misconfigured={} stale={} unchecked={}",
        stats.scanned, stats.misconfigured, stats.stale, stats.unchecked
    );
    Ok(stats)
}
