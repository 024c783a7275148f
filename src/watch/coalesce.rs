//! Per-watcher event coalescing.
//!
//! Folds every event seen on a path between two flushes into one entry.
//! The map is owned by the watcher's event loop and is never shared.

use std::collections::HashMap;

/// What happened to a path, as far as the store is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Write,
    Remove,
    /// Path ends with the separator; drop every record below it.
    RemovePrefix,
}

/// A coalesced event ready to be flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: String,
    pub kind: EventKind,
}

impl FsEvent {
    pub fn new(path: impl Into<String>, kind: EventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Pending paths a watcher holds before it flushes early.
pub const DEFAULT_PENDING_CAP: usize = 65_536;

/// Path -> last event map with at most one entry per path.
#[derive(Debug)]
pub struct Coalescer {
    events: HashMap<String, EventKind>,
    cap: usize,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::with_cap(DEFAULT_PENDING_CAP)
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `is_full()` turns true once `cap` distinct paths are pending.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            events: HashMap::new(),
            cap: cap.max(1),
        }
    }

    /// Records `kind` for `path`, merging with what is already pending.
    ///
    /// A Remove replaces anything pending. A Create on a path whose removal
    /// is still pending becomes a Write: the path exists again and the
    /// store merges the record.
    pub fn record(&mut self, path: impl Into<String>, kind: EventKind) {
        let path = path.into();
        let merged = match (self.events.get(&path), kind) {
            (Some(EventKind::Remove), EventKind::Create) => EventKind::Write,
            (_, kind) => kind,
        };
        self.events.insert(path, merged);
    }

    /// Takes every pending event, sorted by path, leaving the map empty.
    pub fn drain(&mut self) -> Vec<FsEvent> {
        let mut out: Vec<FsEvent> = self
            .events
            .drain()
            .map(|(path, kind)| FsEvent { path, kind })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    #[cfg(test)]
    pub fn get(&self, path: &str) -> Option<EventKind> {
        self.events.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_last_kind_wins() {
        let mut c = Coalescer::new();
        c.record("/r/a", EventKind::Create);
        c.record("/r/a", EventKind::Write);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("/r/a"), Some(EventKind::Write));
    }

    #[test]
    fn test_remove_replaces_pending_create() {
        let mut c = Coalescer::new();
        c.record("/r/a", EventKind::Create);
        c.record("/r/a", EventKind::Remove);
        assert_eq!(c.get("/r/a"), Some(EventKind::Remove));
    }

    #[test]
    fn test_create_after_remove_is_write() {
        let mut c = Coalescer::new();
        c.record("/r/a", EventKind::Remove);
        c.record("/r/a", EventKind::Create);
        assert_eq!(c.get("/r/a"), Some(EventKind::Write));
    }

    #[test]
    fn test_cap_counts_distinct_paths() {
        let mut c = Coalescer::with_cap(2);
        c.record("/r/a", EventKind::Create);
        c.record("/r/a", EventKind::Write);
        assert!(!c.is_full());
        c.record("/r/b", EventKind::Create);
        assert!(c.is_full());
        c.drain();
        assert!(!c.is_full());
    }

    #[test]
    fn test_drain_is_sorted_and_resets() {
        let mut c = Coalescer::new();
        c.record("/r/sub2/b.txt", EventKind::Create);
        c.record("/r/sub/", EventKind::RemovePrefix);
        c.record("/r/sub2", EventKind::Create);
        c.record("/r/sub", EventKind::Remove);

        let drained = c.drain();
        assert_eq!(
            drained,
            vec![
                FsEvent::new("/r/sub", EventKind::Remove),
                FsEvent::new("/r/sub/", EventKind::RemovePrefix),
                FsEvent::new("/r/sub2", EventKind::Create),
                FsEvent::new("/r/sub2/b.txt", EventKind::Create),
            ]
        );
        assert!(c.is_empty());
        assert!(c.drain().is_empty());
    }
}
