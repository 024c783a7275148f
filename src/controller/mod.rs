//! DB controller: the single owner of the store.
//!
//! Watchers and the cleanup job talk to it through a bounded channel of
//! `DbRequest`s. A dedicated thread applies each batch in order and
//! commits once per batch, so the backend never sees concurrent calls.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelSnapshot, CancelToken};
use crate::error::{Error, Result, StoreError};
use crate::object::ObjectRecord;
use crate::store::{CommitStats, DbOperation, ObjectStore};

/// Inbound queue depth. Watchers block on send when the store stalls.
const QUEUE_DEPTH: usize = 16;

/// Predicate run on the controller thread for every stored path.
pub type PathMatcher = Box<dyn FnMut(&str) -> bool + Send>;

/// Work accepted by the dispatcher.
pub enum DbRequest {
    /// Apply in order, then commit.
    Batch(Vec<DbOperation>),
    LoadHostPaths {
        matcher: PathMatcher,
        reply: oneshot::Sender<std::result::Result<Vec<String>, StoreError>>,
    },
    GetObj {
        id: String,
        reply: oneshot::Sender<std::result::Result<Option<ObjectRecord>, StoreError>>,
    },
}

/// Running totals over every commit, readable from any thread.
#[derive(Debug, Default)]
pub struct CommitTotals {
    commits: AtomicUsize,
    updated: AtomicUsize,
    deleted: AtomicUsize,
}

impl CommitTotals {
    fn add(&self, stats: &CommitStats) {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.updated.fetch_add(stats.updated, Ordering::SeqCst);
        self.deleted.fetch_add(stats.deleted, Ordering::SeqCst);
    }

    /// Number of non-empty commits so far.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CommitStats {
        CommitStats {
            updated: self.updated.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
        }
    }
}

/// Cloneable producer side of the controller queue.
#[derive(Clone)]
pub struct DbSender {
    tx: mpsc::Sender<DbRequest>,
}

impl DbSender {
    /// Queues a batch, waiting while the queue is full.
    pub async fn send_batch(&self, ops: Vec<DbOperation>) -> Result<()> {
        self.tx
            .send(DbRequest::Batch(ops))
            .await
            .map_err(|_| Error::ChannelClosed("db controller"))
    }

    /// Runs `matcher` over every stored path of this host on the
    /// controller thread and returns the accepted paths.
    pub async fn load_host_paths(&self, matcher: PathMatcher) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DbRequest::LoadHostPaths { matcher, reply })
            .await
            .map_err(|_| Error::ChannelClosed("db controller"))?;
        let paths = rx
            .await
            .map_err(|_| Error::ChannelClosed("db controller reply"))??;
        Ok(paths)
    }

    pub async fn get_obj(&self, id: impl Into<String>) -> Result<Option<ObjectRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DbRequest::GetObj {
                id: id.into(),
                reply,
            })
            .await
            .map_err(|_| Error::ChannelClosed("db controller"))?;
        let record = rx
            .await
            .map_err(|_| Error::ChannelClosed("db controller reply"))??;
        Ok(record)
    }
}

/// Creates a controller queue without a dispatcher attached.
pub fn channel() -> (DbSender, mpsc::Receiver<DbRequest>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    (DbSender { tx }, rx)
}

/// Handle to the running dispatcher.
pub struct DbController {
    sender: DbSender,
    shutdown: CancellationToken,
    term: CancelToken,
    totals: Arc<CommitTotals>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl DbController {
    /// Takes ownership of `store` and starts the dispatcher thread.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut store: Box<dyn ObjectStore>, read_only: bool) -> Result<Self> {
        store.set_read_only(read_only);
        let term = store.cancel_token().clone();
        let (sender, rx) = channel();
        let (done_tx, done_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let totals = Arc::new(CommitTotals::default());

        let dispatcher = Dispatcher {
            store,
            rx,
            shutdown: shutdown.clone(),
            totals: Arc::clone(&totals),
            done: Some(done_tx),
        };
        let handle = Handle::current();
        thread::Builder::new()
            .name("db-controller".into())
            .spawn(move || dispatcher.run(handle))?;

        if read_only {
            info!("[db] controller started in read-only mode");
        } else {
            info!("[db] controller started");
        }

        Ok(Self {
            sender,
            shutdown,
            term,
            totals,
            done: Mutex::new(Some(done_rx)),
        })
    }

    pub fn sender(&self) -> DbSender {
        self.sender.clone()
    }

    pub fn totals(&self) -> &CommitTotals {
        &self.totals
    }

    /// Interrupts the batch or scan currently running on the dispatcher.
    pub fn term_long(&self) {
        self.term.term_long();
    }

    /// Drains queued requests, stops the store and waits for the thread.
    /// Only the first call does any work.
    pub async fn stop(&self) {
        let done = self.done.lock().take();
        let Some(done) = done else {
            return;
        };
        self.shutdown.cancel();
        if done.await.is_err() {
            warn!("[db] dispatcher exited without acknowledging stop");
        }
        let totals = self.totals.stats();
        info!(
            "[db] controller stopped after {} commits (updated={} deleted={})",
            self.totals.commits(),
            totals.updated,
            totals.deleted
        );
    }
}

struct Dispatcher {
    store: Box<dyn ObjectStore>,
    rx: mpsc::Receiver<DbRequest>,
    shutdown: CancellationToken,
    totals: Arc<CommitTotals>,
    done: Option<oneshot::Sender<()>>,
}

impl Dispatcher {
    fn run(mut self, handle: Handle) {
        debug!("[db] dispatcher running");
        loop {
            let request = handle.block_on(async {
                tokio::select! {
                    biased;
                    request = self.rx.recv() => request,
                    _ = self.shutdown.cancelled() => None,
                }
            });
            match request {
                Some(request) => self.handle(request),
                None => break,
            }
        }

        self.rx.close();
        if let Err(e) = self.store.stop() {
            error!("[db] failed to stop store: {}", e);
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    fn handle(&mut self, request: DbRequest) {
        match request {
            DbRequest::Batch(ops) => {
                let snapshot = self.store.cancel_token().snapshot();
                match apply_batch(self.store.as_mut(), &ops, &snapshot) {
                    Ok(()) => self.commit(),
                    Err(e) if e.is_terminated() => {
                        info!("[db] batch of {} operations terminated", ops.len());
                    }
                    Err(e) => error!("[db] batch failed: {}", e),
                }
            }
            DbRequest::LoadHostPaths { mut matcher, reply } => {
                let result = self.store.load_host_paths(&mut *matcher);
                if let Err(StoreError::Terminated) = &result {
                    info!("[db] host path scan terminated");
                }
                let _ = reply.send(result);
            }
            DbRequest::GetObj { id, reply } => {
                let _ = reply.send(self.store.get_obj(&id));
            }
        }
    }

    fn commit(&mut self) {
        match self.store.commit() {
            Ok(stats) if stats.is_empty() => debug!("[db] commit: nothing to do"),
            Ok(stats) => {
                info!(
                    "[db] commit: updated={} deleted={}",
                    stats.updated, stats.deleted
                );
                self.totals.add(&stats);
            }
            Err(e) => warn!("[db] commit failed, retrying with the next batch: {}", e),
        }
    }
}

/// Stages `ops` in order. Per-operation store failures are logged and
/// skipped; a term-long pulse aborts the rest of the batch.
fn apply_batch(
    store: &mut dyn ObjectStore,
    ops: &[DbOperation],
    snapshot: &CancelSnapshot,
) -> Result<()> {
    for op in ops {
        snapshot.check()?;
        let res = match op {
            DbOperation::Update(obj) => store.update_obj(obj),
            DbOperation::Delete(obj) => store.delete_obj(obj),
            DbOperation::DeletePrefix(obj) => store.delete_fpath_prefix(obj).map(|n| {
                debug!("[db] prefix {} matches {} records", obj.fpath, n);
            }),
        };
        match res {
            Ok(()) => {}
            Err(StoreError::Stopped) => return Err(StoreError::Stopped.into()),
            Err(e) => warn!("[db] {} failed: {}", op.fpath(), e),
        }
    }
    Ok(())
}
