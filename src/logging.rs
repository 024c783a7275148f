//! Process-wide log sink.
//!
//! `tracing-subscriber` writes through a `LogSink`, which is either
//! stderr or an append-mode file. The file can be reopened in place
//! (SIGHUP after log rotation) without reinstalling the subscriber.

use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

enum Target {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Shared handle to the current log destination.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl LogSink {
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stderr)),
        }
    }

    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            target: Arc::new(Mutex::new(Target::File {
                path: path.to_path_buf(),
                file,
            })),
        })
    }

    /// Reopens the log file by path. A no-op when logging to stderr.
    pub fn reopen(&self) -> io::Result<()> {
        let mut target = self.target.lock();
        if let Target::File { path, file } = &mut *target {
            let fresh = open_append(path)?;
            file.flush()?;
            *file = fresh;
        }
        Ok(())
    }

    /// Flushes and falls back to stderr.
    pub fn close(&self) {
        let mut target = self.target.lock();
        if let Target::File { file, .. } = &mut *target {
            let _ = file.flush();
        }
        *target = Target::Stderr;
    }

    pub fn path(&self) -> Option<PathBuf> {
        match &*self.target.lock() {
            Target::File { path, .. } => Some(path.clone()),
            Target::Stderr => None,
        }
    }
}

/// Writer handed out for one log line; holds the sink lock while alive.
pub struct SinkWriter<'a> {
    target: MutexGuard<'a, Target>,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target {
            Target::Stderr => io::stderr().write(buf),
            Target::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target {
            Target::Stderr => io::stderr().flush(),
            Target::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            target: self.target.lock(),
        }
    }
}

/// How the subscriber should be set up.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub debug: bool,
    pub timestamps: bool,
    pub file: Option<PathBuf>,
}

/// Installs the global subscriber. `RUST_LOG` overrides the level chosen
/// by `debug`. Fails when the log file cannot be opened.
pub fn init(opts: &LogOptions) -> io::Result<LogSink> {
    let sink = match &opts.file {
        Some(path) => LogSink::open(path)?,
        None => LogSink::stderr(),
    };

    let default_filter = if opts.debug {
        "fsindex=debug"
    } else {
        "fsindex=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let ansi = opts.file.is_none() && io::stderr().is_terminal();

    let timed = opts.timestamps.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(sink.clone())
            .with_ansi(ansi)
            .with_target(false)
    });
    let untimed = (!opts.timestamps).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(sink.clone())
            .with_ansi(ansi)
            .with_target(false)
            .without_time()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(timed)
        .with(untimed)
        .try_init()
        .map_err(io::Error::other)?;
    Ok(sink)
}
