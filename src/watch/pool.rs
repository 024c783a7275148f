//! Watcher pool: one `DirWatcher` per configured root.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::watcher::{DirWatcher, WatchSettings, WatcherHandle};
use crate::cancel::CancelToken;
use crate::controller::DbSender;
use crate::error::{Error, Result};

pub struct WatcherPool {
    roots: Vec<String>,
    settings: WatchSettings,
    db: DbSender,
    cancel: CancelToken,
    registry: Mutex<Vec<WatcherHandle>>,
    starting: AtomicBool,
}

/// Clears the `starting` flag when `start` returns.
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl WatcherPool {
    pub fn new(roots: Vec<String>, settings: WatchSettings, db: DbSender) -> Self {
        Self {
            roots,
            settings,
            db,
            cancel: CancelToken::new(),
            registry: Mutex::new(Vec::new()),
            starting: AtomicBool::new(false),
        }
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Starts a watcher for every root concurrently and returns how many
    /// came up. Roots that fail are logged and left out of the registry.
    pub async fn start(&self, reindex: bool) -> Result<usize> {
        if self.starting.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("watcher pool start"));
        }
        let _guard = StartGuard(&self.starting);
        if !self.registry.lock().is_empty() {
            return Err(Error::AlreadyRunning("watcher pool"));
        }

        let mut starting = JoinSet::new();
        for root in &self.roots {
            let root = root.clone();
            let settings = self.settings;
            let db = self.db.clone();
            let cancel = self.cancel.clone();
            starting.spawn(async move {
                let res = match DirWatcher::new(root.clone(), settings, db, cancel) {
                    Ok(watcher) => watcher.watch(reindex).await,
                    Err(e) => Err(e),
                };
                (root, res)
            });
        }

        let mut started = Vec::with_capacity(self.roots.len());
        while let Some(joined) = starting.join_next().await {
            match joined {
                Ok((_, Ok(handle))) => started.push(handle),
                Ok((root, Err(e))) => error!("[pool] cannot watch {}: {}", root, e),
                Err(e) => error!("[pool] watcher start task failed: {}", e),
            }
        }

        if started.is_empty() {
            return Err(Error::NoDirectories);
        }
        let n = started.len();
        self.registry.lock().extend(started);
        info!("[pool] {} of {} watchers running", n, self.roots.len());
        Ok(n)
    }

    /// Stops every watcher and waits until each has flushed and exited.
    pub async fn stop(&self) {
        let watchers = std::mem::take(&mut *self.registry.lock());
        if watchers.is_empty() {
            return;
        }
        let acks: Vec<_> = watchers.iter().map(|w| w.request_stop()).collect();
        let n = watchers.len();
        for (watcher, ack) in watchers.into_iter().zip(acks) {
            watcher.join(ack).await;
        }
        info!("[pool] stopped {} watchers", n);
    }

    /// Interrupts the initial scans and flushes of every watcher.
    pub fn term_long(&self) {
        self.cancel.term_long();
    }

    /// Number of live watchers. Watchers whose loop exited on their own
    /// (root removed or renamed) are evicted here.
    pub fn n_watchers(&self) -> usize {
        let mut registry = self.registry.lock();
        registry.retain(|w| {
            let alive = !w.is_finished();
            if !alive {
                warn!("[pool] evicting exited watcher for {}", w.root());
            }
            alive
        });
        registry.len()
    }

    /// Armed directories per live watcher, for diagnostics.
    pub async fn armed_dirs(&self) -> Vec<(String, Vec<String>)> {
        let queries: Vec<_> = self
            .registry
            .lock()
            .iter()
            .map(|w| (w.root().to_string(), w.armed_dirs()))
            .collect();

        let mut out = Vec::with_capacity(queries.len());
        for (root, query) in queries {
            if let Some(dirs) = query.await {
                out.push((root, dirs));
            }
        }
        out
    }
}
