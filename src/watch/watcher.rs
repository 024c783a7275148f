//! Directory watcher: one per indexing root.
//!
//! `notify` delivers OS events through a callback that forwards them into
//! a tokio channel. A single event loop task owns the OS handle, the
//! coalescer and the set of armed directories, and selects over OS
//! events, the flush timer and the control channel.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::coalesce::{Coalescer, EventKind, FsEvent, DEFAULT_PENDING_CAP};
use crate::cancel::{CancelSnapshot, CancelToken};
use crate::controller::DbSender;
use crate::error::{Error, ProbeError, Result};
use crate::object::FsObject;
use crate::probe::{probe, ProbeOptions};
use crate::store::DbOperation;

/// Settings shared by every watcher of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub flush_period: Duration,
    pub probe: ProbeOptions,
    /// Distinct pending paths that trigger a flush before the timer does
    pub pending_cap: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            flush_period: Duration::from_secs(5),
            probe: ProbeOptions::default(),
            pending_cap: DEFAULT_PENDING_CAP,
        }
    }
}

enum Control {
    Stop(oneshot::Sender<()>),
    ArmedDirs(oneshot::Sender<Vec<String>>),
}

/// What an OS event means for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Create,
    Write,
    Remove,
    Rename,
}

/// State touched only by the owning watcher.
struct WatchState {
    os: Option<RecommendedWatcher>,
    dirs: BTreeSet<String>,
    pending: Coalescer,
}

impl WatchState {
    fn arm(&mut self, dir: &str) -> Result<()> {
        if self.dirs.contains(dir) {
            return Ok(());
        }
        if let Some(os) = self.os.as_mut() {
            os.watch(Path::new(dir), RecursiveMode::NonRecursive)?;
        }
        self.dirs.insert(dir.to_string());
        Ok(())
    }

    /// Drops `dir` and every armed directory below it from the set,
    /// optionally releasing their OS watches. Returns false when `dir` was
    /// not armed.
    fn disarm_tree(&mut self, dir: &str, unwatch: bool) -> bool {
        if !self.dirs.contains(dir) {
            return false;
        }
        let prefix = format!("{}{}", dir, MAIN_SEPARATOR);
        let mut gone = vec![dir.to_string()];
        gone.extend(
            self.dirs
                .range(prefix.clone()..)
                .take_while(|d| d.starts_with(&prefix))
                .cloned(),
        );

        for d in gone {
            self.dirs.remove(&d);
            if !unwatch {
                continue;
            }
            if let Some(os) = self.os.as_mut() {
                if let Err(e) = os.unwatch(Path::new(&d)) {
                    debug!("[watcher] unwatch {}: {}", d, e);
                }
            }
        }
        true
    }

    /// Walks `top`, arming every directory. With `reindex` every entry
    /// below `top` is recorded as a Create.
    fn scan(&mut self, top: &str, reindex: bool, snapshot: &CancelSnapshot) -> Result<()> {
        let mut entries = WalkDir::new(top).follow_links(false).into_iter();
        while let Some(entry) = entries.next() {
            snapshot.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(Error::Io(e.into())),
                Err(e) => {
                    warn!("[watcher] scan {}: {}", top, e);
                    continue;
                }
            };
            let is_dir = entry.file_type().is_dir();
            let Some(path) = entry.path().to_str() else {
                warn!("[watcher] skipping non UTF-8 path {}", entry.path().display());
                if is_dir {
                    entries.skip_current_dir();
                }
                continue;
            };

            if reindex && entry.depth() > 0 {
                self.pending.record(path, EventKind::Create);
            }
            if is_dir {
                if let Err(e) = self.arm(path) {
                    if entry.depth() == 0 {
                        return Err(e);
                    }
                    warn!("[watcher] cannot watch {}: {}", path, e);
                    entries.skip_current_dir();
                }
            }
        }
        Ok(())
    }
}

/// A watcher before its event loop runs.
pub struct DirWatcher {
    root: String,
    settings: WatchSettings,
    db: DbSender,
    cancel: CancelToken,
    state: WatchState,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl DirWatcher {
    /// Opens an OS notification handle for `root`, which must be a directory.
    pub fn new(
        root: impl Into<String>,
        settings: WatchSettings,
        db: DbSender,
        cancel: CancelToken,
    ) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(Error::RootNotDirectory(PathBuf::from(root)));
        }

        let (tx, events) = mpsc::unbounded_channel();
        let os = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;

        Ok(Self {
            root,
            settings,
            db,
            cancel,
            state: WatchState {
                os: Some(os),
                dirs: BTreeSet::new(),
                pending: Coalescer::with_cap(settings.pending_cap),
            },
            events,
        })
    }

    /// Arms the tree under the root and starts the event loop.
    ///
    /// A term-long pulse during the initial scan is not an error: the loop
    /// starts anyway with whatever part of the tree was armed.
    pub async fn watch(self, reindex: bool) -> Result<WatcherHandle> {
        let snapshot = self.cancel.snapshot();
        self.watch_with(reindex, snapshot).await
    }

    async fn watch_with(
        mut self,
        reindex: bool,
        snapshot: CancelSnapshot,
    ) -> Result<WatcherHandle> {
        let root = self.root.clone();
        let state = self.state;
        let (state, scanned) = tokio::task::spawn_blocking(move || {
            let mut state = state;
            let res = state.scan(&root, reindex, &snapshot);
            (state, res)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        self.state = state;

        match scanned {
            Ok(()) => info!(
                "[watcher] watching {} ({} directories, {} pending)",
                self.root,
                self.state.dirs.len(),
                self.state.pending.len()
            ),
            Err(e) if e.is_terminated() => info!(
                "[watcher] initial scan of {} terminated with {} directories armed",
                self.root,
                self.state.dirs.len()
            ),
            Err(e) => return Err(e),
        }

        let (control_tx, control) = mpsc::channel(1);
        let root = self.root.clone();
        let event_loop = EventLoop {
            root: self.root,
            settings: self.settings,
            db: self.db,
            cancel: self.cancel,
            state: self.state,
            events: self.events,
            control,
        };
        let task = tokio::spawn(event_loop.run());

        Ok(WatcherHandle {
            root,
            control: control_tx,
            task,
        })
    }
}

/// Owning handle to a running watcher.
pub struct WatcherHandle {
    root: String,
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn root(&self) -> &str {
        &self.root
    }

    /// True once the event loop has exited on its own or been stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the loop to stop without waiting. `None` when it already exited.
    pub fn request_stop(&self) -> Option<oneshot::Receiver<()>> {
        let (ack, rx) = oneshot::channel();
        self.control.try_send(Control::Stop(ack)).ok().map(|_| rx)
    }

    /// Waits for the acknowledgement from `request_stop` and for the task.
    pub async fn join(self, ack: Option<oneshot::Receiver<()>>) {
        if let Some(ack) = ack {
            let _ = ack.await;
        }
        if let Err(e) = self.task.await {
            error!("[watcher] {} task failed: {}", self.root, e);
        }
    }

    pub async fn stop(self) {
        let ack = self.request_stop();
        self.join(ack).await;
    }

    /// Directories currently armed by this watcher, sorted. The returned
    /// future does not borrow the handle.
    pub fn armed_dirs(&self) -> impl Future<Output = Option<Vec<String>>> + Send + 'static {
        let control = self.control.clone();
        async move {
            let (reply, rx) = oneshot::channel();
            control.send(Control::ArmedDirs(reply)).await.ok()?;
            rx.await.ok()
        }
    }
}

struct EventLoop {
    root: String,
    settings: WatchSettings,
    db: DbSender,
    cancel: CancelToken,
    state: WatchState,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    control: mpsc::Receiver<Control>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.settings.flush_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Ok(event)) => {
                        if !self.handle_event(event) {
                            if let Err(e) = self.flush().await {
                                warn!("[watcher] {}: final flush: {}", self.root, e);
                            }
                            break;
                        }
                        if self.state.pending.is_full() {
                            debug!(
                                "[watcher] {}: {} paths pending, flushing early",
                                self.root,
                                self.state.pending.len()
                            );
                            if !self.timed_flush().await {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => warn!("[watcher] {}: {}", self.root, e),
                    None => {
                        error!("[watcher] {}: notification channel closed", self.root);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if !self.timed_flush().await {
                        break;
                    }
                }
                control = self.control.recv() => match control {
                    Some(Control::ArmedDirs(reply)) => {
                        let _ = reply.send(self.state.dirs.iter().cloned().collect());
                    }
                    Some(Control::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }
        }
        self.state.os = None;
        info!("[watcher] {} exited", self.root);
    }

    /// Flush from the running loop. Returns false when the loop must exit.
    async fn timed_flush(&mut self) -> bool {
        match self.flush().await {
            Ok(()) => true,
            Err(e) if e.is_terminated() => {
                info!("[watcher] {}: flush terminated", self.root);
                true
            }
            Err(e) => {
                error!("[watcher] {}: {}", self.root, e);
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        self.state.os = None;
        if !self.state.pending.is_empty() {
            if let Err(e) = self.flush().await {
                warn!("[watcher] {}: final flush: {}", self.root, e);
            }
        }
        info!("[watcher] {} stopped", self.root);
    }

    /// Applies one OS event. Returns false when the watcher must exit.
    fn handle_event(&mut self, event: Event) -> bool {
        for (path, change) in classify(&event) {
            let Some(path) = path.to_str() else {
                warn!("[watcher] ignoring non UTF-8 path {}", path.display());
                continue;
            };
            match change {
                Change::Create => self.on_create(path),
                Change::Write => self.state.pending.record(path, EventKind::Write),
                Change::Remove | Change::Rename => {
                    if path == self.root {
                        error!("[watcher] root {} was removed or renamed", self.root);
                        return false;
                    }
                    self.on_remove(path, change == Change::Rename);
                }
            }
        }
        true
    }

    fn on_create(&mut self, path: &str) {
        self.state.pending.record(path, EventKind::Create);
        let is_dir = fs::symlink_metadata(path)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return;
        }
        let snapshot = self.cancel.snapshot();
        if let Err(e) = self.state.scan(path, true, &snapshot) {
            if e.is_terminated() {
                info!("[watcher] scan of {} terminated", path);
            } else {
                warn!("[watcher] cannot watch new directory {}: {}", path, e);
            }
        }
    }

    fn on_remove(&mut self, path: &str, renamed: bool) {
        self.state.pending.record(path, EventKind::Remove);
        // The OS drops the watch of a removed directory by itself.
        if self.state.disarm_tree(path, renamed) {
            let prefix = format!("{}{}", path, MAIN_SEPARATOR);
            debug!("[watcher] {} left the tree, dropping {}", path, prefix);
            self.state.pending.record(prefix, EventKind::RemovePrefix);
        }
    }

    /// Probes every pending path and sends the resulting batches.
    async fn flush(&mut self) -> Result<()> {
        if self.state.pending.is_empty() {
            debug!("[watcher] {}: nothing to flush", self.root);
            return Ok(());
        }

        let snapshot = self.cancel.snapshot();
        let drained = self.state.pending.drain();
        let total = drained.len();
        let mut ops = Vec::with_capacity(total);
        let mut terminated = false;

        let mut events = drained.into_iter();
        while let Some(event) = events.next() {
            if snapshot.is_terminated() {
                self.state.pending.record(event.path, event.kind);
                for rest in events.by_ref() {
                    self.state.pending.record(rest.path, rest.kind);
                }
                terminated = true;
                break;
            }
            if let Some(op) = self.operation_for(event) {
                ops.push(op);
            }
        }

        let batches = split_batches(ops);
        debug!(
            "[watcher] {}: flushing {} events in {} batches",
            self.root,
            total,
            batches.len()
        );
        for batch in batches {
            self.db.send_batch(batch).await?;
        }

        if terminated {
            return Err(Error::Terminated);
        }
        Ok(())
    }

    fn operation_for(&self, event: FsEvent) -> Option<DbOperation> {
        match event.kind {
            EventKind::Create | EventKind::Write => {
                match probe(Path::new(&event.path), &self.settings.probe) {
                    Ok(Some(obj)) => Some(DbOperation::Update(obj)),
                    Ok(None) => {
                        debug!("[watcher] skipping unsupported entity {}", event.path);
                        None
                    }
                    Err(ProbeError::NotFound(_)) => {
                        Some(DbOperation::Delete(FsObject::for_path(event.path)))
                    }
                    Err(e) => {
                        warn!("[watcher] {}", e);
                        None
                    }
                }
            }
            EventKind::Remove => Some(DbOperation::Delete(FsObject::for_path(event.path))),
            EventKind::RemovePrefix => {
                Some(DbOperation::DeletePrefix(FsObject::for_path(event.path)))
            }
        }
    }
}

/// Maps a `notify` event onto per-path changes. Permission and access
/// events are dropped.
fn classify(event: &Event) -> Vec<(PathBuf, Change)> {
    use notify::EventKind as K;

    let paths = &event.paths;
    let each = |change: Change| -> Vec<(PathBuf, Change)> {
        paths.iter().map(|p| (p.clone(), change)).collect()
    };
    match event.kind {
        K::Create(_) => each(Change::Create),
        K::Remove(_) => each(Change::Remove),
        K::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        K::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => each(Change::Rename),
            RenameMode::To => each(Change::Create),
            RenameMode::Both => {
                let mut out = Vec::with_capacity(2);
                if let Some(from) = paths.first() {
                    out.push((from.clone(), Change::Rename));
                }
                if let Some(to) = paths.get(1) {
                    out.push((to.clone(), Change::Create));
                }
                out
            }
            _ => paths
                .iter()
                .map(|p| {
                    let change = if fs::symlink_metadata(p).is_ok() {
                        Change::Create
                    } else {
                        Change::Rename
                    };
                    (p.clone(), change)
                })
                .collect(),
        },
        K::Modify(_) => each(Change::Write),
        K::Access(_) | K::Any | K::Other => Vec::new(),
    }
}

/// Cuts `ops` so that no Update follows a DeletePrefix covering it within
/// the same batch.
fn split_batches(ops: Vec<DbOperation>) -> Vec<Vec<DbOperation>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut prefixes: Vec<String> = Vec::new();

    for op in ops {
        match &op {
            DbOperation::Update(obj) if prefixes.iter().any(|p| obj.fpath.starts_with(p)) => {
                batches.push(std::mem::take(&mut current));
                prefixes.clear();
            }
            DbOperation::DeletePrefix(obj) => prefixes.push(obj.fpath.clone()),
            _ => {}
        }
        current.push(op);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{self, DbRequest};
    use crate::object::ObjectType;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use pretty_assertions::assert_eq;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    const FLUSH: Duration = Duration::from_millis(100);

    fn settings() -> WatchSettings {
        WatchSettings {
            flush_period: FLUSH,
            ..WatchSettings::default()
        }
    }

    fn root_of(dir: &TempDir) -> String {
        dir.path().to_str().unwrap().to_string()
    }

    fn op_label(op: &DbOperation) -> (String, &'static str) {
        let kind = match op {
            DbOperation::Update(_) => "update",
            DbOperation::Delete(_) => "delete",
            DbOperation::DeletePrefix(_) => "delete-prefix",
        };
        (op.fpath().to_string(), kind)
    }

    /// Collects batch operations until `done` accepts everything seen so far.
    async fn collect_until(
        rx: &mut mpsc::Receiver<DbRequest>,
        done: impl Fn(&[DbOperation]) -> bool,
    ) -> Vec<DbOperation> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done(&seen) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(DbRequest::Batch(ops))) => seen.extend(ops),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        seen
    }

    fn has(ops: &[DbOperation], fpath: &str, kind: &str) -> bool {
        ops.iter()
            .any(|op| op_label(op) == (fpath.to_string(), kind))
    }

    #[test]
    fn test_classify_events() {
        let p = PathBuf::from("/r/a");
        let q = PathBuf::from("/r/b");
        let ev = |kind| Event::new(kind).add_path(p.clone());

        assert_eq!(
            classify(&ev(notify::EventKind::Create(CreateKind::File))),
            vec![(p.clone(), Change::Create)]
        );
        assert_eq!(
            classify(&ev(notify::EventKind::Modify(ModifyKind::Data(DataChange::Any)))),
            vec![(p.clone(), Change::Write)]
        );
        assert_eq!(
            classify(&ev(notify::EventKind::Remove(RemoveKind::Folder))),
            vec![(p.clone(), Change::Remove)]
        );
        assert_eq!(
            classify(&ev(notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)))),
            vec![(p.clone(), Change::Rename)]
        );
        assert!(classify(&ev(notify::EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))))
        .is_empty());

        let both = Event::new(notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(p.clone())
            .add_path(q.clone());
        assert_eq!(
            classify(&both),
            vec![(p, Change::Rename), (q, Change::Create)]
        );
    }

    #[test]
    fn test_split_batches_keeps_updates_after_prefix_apart() {
        let ops = vec![
            DbOperation::Delete(FsObject::for_path("/r/sub")),
            DbOperation::DeletePrefix(FsObject::for_path("/r/sub/")),
            DbOperation::Update(FsObject::for_path("/r/sub")),
            DbOperation::Update(FsObject::for_path("/r/sub/x")),
            DbOperation::Update(FsObject::for_path("/r/sub2")),
        ];
        let batches = split_batches(ops);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1][0].fpath(), "/r/sub/x");
    }

    #[test]
    fn test_disarm_tree_uses_prefix_range() {
        let mut state = WatchState {
            os: None,
            dirs: ["/r", "/r/sub", "/r/sub/deep", "/r/sub2", "/r/sub0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pending: Coalescer::new(),
        };
        assert!(state.disarm_tree("/r/sub", false));
        let left: Vec<_> = state.dirs.iter().map(String::as_str).collect();
        assert_eq!(left, vec!["/r", "/r/sub0", "/r/sub2"]);
        assert!(!state.disarm_tree("/r/missing", false));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reindex_publishes_existing_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "abc").unwrap();
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
            .unwrap();

        let (db, mut rx) = controller::channel();
        let watcher = DirWatcher::new(root_of(&dir), settings(), db, CancelToken::new())
            .unwrap()
            .watch(true)
            .await
            .unwrap();

        let fpath = file.to_str().unwrap().to_string();
        let ops = collect_until(&mut rx, |ops| has(ops, &fpath, "update")).await;
        let obj = ops
            .iter()
            .find_map(|op| match op {
                DbOperation::Update(obj) if obj.fpath == fpath => Some(obj.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(obj.otype, ObjectType::Regular);
        assert_eq!(obj.size, 3);
        assert_eq!(obj.mtime, 1_700_000_000);
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_directory_is_armed_and_backfilled() {
        let dir = TempDir::new().unwrap();
        let root = root_of(&dir);
        let (db, mut rx) = controller::channel();
        let watcher = DirWatcher::new(root.clone(), settings(), db, CancelToken::new())
            .unwrap()
            .watch(false)
            .await
            .unwrap();

        let sub = format!("{}/sub", root);
        let file = format!("{}/sub/b.txt", root);
        fs::create_dir(&sub).unwrap();
        fs::write(&file, "b").unwrap();

        let ops = collect_until(&mut rx, |ops| {
            has(ops, &sub, "update") && has(ops, &file, "update")
        })
        .await;
        assert!(has(&ops, &sub, "update"));
        assert!(has(&ops, &file, "update"));

        let dirs = watcher.armed_dirs().await.unwrap();
        assert!(dirs.contains(&sub));
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_directory_rename_drops_old_subtree() {
        let dir = TempDir::new().unwrap();
        let root = root_of(&dir);
        let sub = format!("{}/sub", root);
        let sub2 = format!("{}/sub2", root);
        fs::create_dir(&sub).unwrap();
        fs::write(format!("{}/b.txt", sub), "b").unwrap();

        let (db, mut rx) = controller::channel();
        let watcher = DirWatcher::new(root.clone(), settings(), db, CancelToken::new())
            .unwrap()
            .watch(false)
            .await
            .unwrap();
        assert!(watcher.armed_dirs().await.unwrap().contains(&sub));

        fs::rename(&sub, &sub2).unwrap();
        let moved = format!("{}/b.txt", sub2);
        let ops = collect_until(&mut rx, |ops| {
            has(ops, &sub, "delete")
                && has(ops, &format!("{}/", sub), "delete-prefix")
                && has(ops, &sub2, "update")
                && has(ops, &moved, "update")
        })
        .await;

        let mut labels: Vec<_> = ops.iter().map(op_label).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(
            labels,
            vec![
                (sub.clone(), "delete"),
                (format!("{}/", sub), "delete-prefix"),
                (sub2.clone(), "update"),
                (moved, "update"),
            ]
        );

        let dirs = watcher.armed_dirs().await.unwrap();
        assert_eq!(dirs, vec![root, sub2]);
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminated_scan_still_runs_event_loop() {
        let dir = TempDir::new().unwrap();
        for i in 0..20 {
            fs::create_dir_all(dir.path().join(format!("d{}/e", i))).unwrap();
        }
        let cancel = CancelToken::new();
        let snapshot = cancel.snapshot();
        cancel.term_long();

        let (db, _rx) = controller::channel();
        let watcher = DirWatcher::new(root_of(&dir), settings(), db, cancel)
            .unwrap()
            .watch_with(true, snapshot)
            .await
            .unwrap();

        assert!(!watcher.is_finished());
        assert!(watcher.armed_dirs().await.unwrap().len() < 41);
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_flushes_pending_events() {
        let dir = TempDir::new().unwrap();
        let (db, mut rx) = controller::channel();
        let slow = WatchSettings {
            flush_period: Duration::from_secs(3600),
            ..settings()
        };
        let watcher = DirWatcher::new(root_of(&dir), slow, db, CancelToken::new())
            .unwrap()
            .watch(false)
            .await
            .unwrap();

        let file = dir.path().join("late.txt");
        fs::write(&file, "x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        watcher.stop().await;

        let fpath = file.to_str().unwrap().to_string();
        let ops = collect_until(&mut rx, |ops| has(ops, &fpath, "update")).await;
        assert!(has(&ops, &fpath, "update"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_coalescer_flushes_before_timer() {
        let dir = TempDir::new().unwrap();
        let (db, mut rx) = controller::channel();
        let capped = WatchSettings {
            flush_period: Duration::from_secs(3600),
            pending_cap: 3,
            ..settings()
        };
        let watcher = DirWatcher::new(root_of(&dir), capped, db, CancelToken::new())
            .unwrap()
            .watch(false)
            .await
            .unwrap();

        let fpaths: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                let file = dir.path().join(name);
                fs::write(&file, "x").unwrap();
                file.to_str().unwrap().to_string()
            })
            .collect();

        let ops = collect_until(&mut rx, |ops| {
            fpaths.iter().all(|p| has(ops, p, "update"))
        })
        .await;
        for p in &fpaths {
            assert!(has(&ops, p, "update"), "{} not flushed", p);
        }
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_flushes_send_nothing() {
        let dir = TempDir::new().unwrap();
        let (db, mut rx) = controller::channel();
        let watcher = DirWatcher::new(root_of(&dir), settings(), db, CancelToken::new())
            .unwrap()
            .watch(false)
            .await
            .unwrap();

        let file = dir.path().join("once.txt");
        fs::write(&file, "x").unwrap();
        let fpath = file.to_str().unwrap().to_string();
        let ops = collect_until(&mut rx, |ops| has(ops, &fpath, "update")).await;
        assert!(has(&ops, &fpath, "update"));

        // Late notifications for the same write may still trail in.
        tokio::time::sleep(FLUSH * 3).await;
        while rx.try_recv().is_ok() {}

        // Several flush periods with no events in between.
        tokio::time::sleep(FLUSH * 4).await;
        assert!(rx.try_recv().is_err());

        watcher.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_root_must_be_a_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "").unwrap();
        let (db, _rx) = controller::channel();

        let err = DirWatcher::new(file.to_str().unwrap(), settings(), db.clone(), CancelToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::RootNotDirectory(_)));

        let missing = dir.path().join("nope");
        let err = DirWatcher::new(missing.to_str().unwrap(), settings(), db, CancelToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Io(_)));
    }
}
