//! Agent orchestration: startup, signals, reindex/cleanup tasks and
//! graceful shutdown.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::cleanup::run_cleanup;
use crate::config::AgentConfig;
use crate::controller::DbController;
use crate::error::Result;
use crate::logging::LogSink;
use crate::store::open_store;
use crate::watch::WatcherPool;

/// Background task slot that refuses a second run while one is active.
#[derive(Default)]
struct TaskSlot {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    /// Spawns `task` unless a previous one is still running.
    fn try_spawn<F>(&self, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            task.await;
            running.store(false, Ordering::SeqCst);
        });
        *self.handle.lock() = Some(handle);
        true
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }
}

/// A running indexing agent.
pub struct Agent {
    config: AgentConfig,
    controller: Arc<DbController>,
    pool: Arc<WatcherPool>,
    log: Option<LogSink>,
    reindex: TaskSlot,
    cleanup: TaskSlot,
}

impl Agent {
    /// Opens the store, starts the controller and the watchers, and kicks
    /// off a cleanup pass when configured.
    pub async fn start(config: AgentConfig, log: Option<LogSink>) -> Result<Self> {
        info!(
            "[agent] host={} db={}/{} roots={:?}",
            config.hostname,
            config.location.dir().display(),
            config.dbid,
            config.roots
        );
        let store = open_store(
            &config.location,
            &config.dbid,
            &config.hostname,
            &config.store,
            CancelToken::new(),
        )?;
        let controller = Arc::new(DbController::start(store, config.read_only)?);
        let pool = Arc::new(WatcherPool::new(
            config.roots.clone(),
            config.watch_settings(),
            controller.sender(),
        ));

        if let Err(e) = pool.start(config.reindex).await {
            controller.stop().await;
            return Err(e);
        }

        let agent = Self {
            config,
            controller,
            pool,
            log,
            reindex: TaskSlot::default(),
            cleanup: TaskSlot::default(),
        };
        if agent.config.cleanup {
            agent.request_cleanup();
        }
        Ok(agent)
    }

    pub fn controller(&self) -> &DbController {
        &self.controller
    }

    pub fn pool(&self) -> &WatcherPool {
        &self.pool
    }

    /// Restarts every watcher with reindexing on. Returns false when a
    /// reindex is already running.
    pub fn request_reindex(&self) -> bool {
        let pool = Arc::clone(&self.pool);
        let accepted = self.reindex.try_spawn(async move {
            info!("[agent] reindex started");
            pool.stop().await;
            match pool.start(true).await {
                Ok(n) => info!("[agent] reindex running on {} watchers", n),
                Err(e) => error!("[agent] reindex failed: {}", e),
            }
        });
        if !accepted {
            warn!("[agent] reindex already running");
        }
        accepted
    }

    /// Starts one cleanup pass. Returns false when one is already running.
    pub fn request_cleanup(&self) -> bool {
        let db = self.controller.sender();
        let roots = self.config.roots.clone();
        let accepted = self.cleanup.try_spawn(async move {
            match run_cleanup(&db, &roots).await {
                Ok(stats) => info!("[agent] cleanup removed {} records", stats.removed()),
                Err(e) if e.is_terminated() => info!("[agent] cleanup terminated"),
                Err(e) => error!("[agent] cleanup failed: {}", e),
            }
        });
        if !accepted {
            warn!("[agent] cleanup already running");
        }
        accepted
    }

    pub fn is_reindexing(&self) -> bool {
        self.reindex.is_running()
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleanup.is_running()
    }

    /// Interrupts long scans in the watchers and the controller.
    pub fn term_long(&self) {
        info!("[agent] terminating long operations");
        self.pool.term_long();
        self.controller.term_long();
    }

    pub fn reopen_log(&self) {
        let Some(log) = &self.log else { return };
        let Some(path) = log.path() else { return };
        match log.reopen() {
            Ok(()) => info!("[agent] log file {} reopened", path.display()),
            Err(e) => error!("[agent] cannot reopen log file {}: {}", path.display(), e),
        }
    }

    /// Stops background tasks, the watchers and then the controller.
    pub async fn shutdown(&self) {
        info!("[agent] stopping");
        if let Some(task) = self.reindex.take() {
            if !task.is_finished() {
                self.pool.term_long();
            }
            let _ = task.await;
        }
        if let Some(task) = self.cleanup.take() {
            if !task.is_finished() {
                self.controller.term_long();
            }
            let _ = task.await;
        }
        self.pool.stop().await;
        self.controller.stop().await;
        info!("[agent] stopped");
        if let Some(log) = &self.log {
            log.close();
        }
    }

    /// Serves signals until TERM or INT, then shuts down. A second TERM
    /// or INT during shutdown exits the process immediately.
    pub async fn run(self) -> Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let mut quit = signal(SignalKind::quit())?;

        info!("[agent] running with {} watchers", self.pool.n_watchers());
        loop {
            tokio::select! {
                _ = term.recv() => break,
                _ = int.recv() => break,
                _ = hup.recv() => self.reopen_log(),
                _ = usr1.recv() => {
                    self.request_reindex();
                }
                _ = usr2.recv() => {
                    self.request_cleanup();
                }
                _ = quit.recv() => self.term_long(),
            }
        }

        let shutdown = self.shutdown();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = term.recv() => abort(),
                _ = int.recv() => abort(),
                _ = hup.recv() => self.reopen_log(),
            }
        }
    }
}

fn abort() -> ! {
    error!("[agent] Aborted");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FLUSH_PERIOD;
    use crate::error::Error;
    use crate::object::{object_id, ObjectType};
    use crate::store::{CommitStats, StoreLocation, StoreOptions};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn config(root: &Path, db: &Path) -> AgentConfig {
        AgentConfig {
            roots: vec![root.to_str().unwrap().to_string()],
            location: StoreLocation::Lmdb(db.to_path_buf()),
            dbid: "files".into(),
            hostname: "host1".into(),
            log_file: None,
            reindex: true,
            cleanup: false,
            flush_period: Duration::from_millis(100),
            checksums: false,
            max_checksum_size: 0,
            read_only: false,
            debug: false,
            no_log_timestamps: false,
            store: StoreOptions {
                map_size_mb: 16,
                ..StoreOptions::default()
            },
        }
    }

    fn seed_file(root: &Path) -> String {
        let path = root.join("a.txt");
        fs::write(&path, "abc").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
            .unwrap();
        path.to_str().unwrap().to_string()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reindex_on_start_stores_existing_file() {
        let root = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();
        let fpath = seed_file(root.path());

        let agent = Agent::start(config(root.path(), db.path()), None)
            .await
            .unwrap();
        wait_until(|| agent.controller().totals().commits() >= 1).await;
        assert_eq!(
            agent.controller().totals().stats(),
            CommitStats { updated: 1, deleted: 0 }
        );

        let record = agent
            .controller()
            .sender()
            .get_obj(object_id("host1", &fpath))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.fpath, fpath);
        assert_eq!(record.otype, ObjectType::Regular);
        assert_eq!(record.size, 3);
        assert_eq!(record.mtime, 1_700_000_000);
        agent.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_only_agent_counts_without_writing() {
        let root = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();
        let fpath = seed_file(root.path());
        let cfg = AgentConfig {
            read_only: true,
            ..config(root.path(), db.path())
        };

        let agent = Agent::start(cfg, None).await.unwrap();
        wait_until(|| agent.controller().totals().commits() >= 1).await;
        assert_eq!(
            agent.controller().totals().stats(),
            CommitStats { updated: 1, deleted: 0 }
        );
        let record = agent
            .controller()
            .sender()
            .get_obj(object_id("host1", &fpath))
            .await
            .unwrap();
        assert!(record.is_none());
        agent.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_without_usable_roots_fails() {
        let root = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();
        let cfg = config(&root.path().join("missing"), db.path());

        let err = Agent::start(cfg, None).await.err().unwrap();
        assert!(matches!(err, Error::NoDirectories));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reindex_and_cleanup_are_not_reentrant() {
        let root = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();
        seed_file(root.path());
        let cfg = AgentConfig {
            reindex: false,
            flush_period: DEFAULT_FLUSH_PERIOD,
            ..config(root.path(), db.path())
        };
        let agent = Agent::start(cfg, None).await.unwrap();

        assert!(agent.request_reindex());
        assert!(!agent.request_reindex());
        wait_until(|| !agent.is_reindexing()).await;
        assert_eq!(agent.pool().n_watchers(), 1);

        assert!(agent.request_cleanup());
        assert!(!agent.request_cleanup());
        wait_until(|| !agent.is_cleaning()).await;

        agent.term_long();
        agent.shutdown().await;
        assert_eq!(agent.pool().n_watchers(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cleanup_on_start_removes_stale_records() {
        let root = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();
        let fpath = seed_file(root.path());

        let agent = Agent::start(config(root.path(), db.path()), None)
            .await
            .unwrap();
        wait_until(|| agent.controller().totals().commits() >= 1).await;
        agent.shutdown().await;

        fs::remove_file(&fpath).unwrap();
        let cfg = AgentConfig {
            reindex: false,
            cleanup: true,
            ..config(root.path(), db.path())
        };
        let agent = Agent::start(cfg, None).await.unwrap();
        wait_until(|| !agent.is_cleaning()).await;
        wait_until(|| agent.controller().totals().stats().deleted >= 1).await;
        assert!(agent
            .controller()
            .sender()
            .get_obj(object_id("host1", &fpath))
            .await
            .unwrap()
            .is_none());
        agent.shutdown().await;
    }
}
