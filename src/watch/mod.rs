//! Filesystem watching: event coalescing, per-root watchers and the pool
//! that runs them.

pub mod coalesce;
pub mod pool;
pub mod watcher;

pub use coalesce::{Coalescer, EventKind, FsEvent};
pub use pool::WatcherPool;
pub use watcher::{DirWatcher, WatchSettings, WatcherHandle};
