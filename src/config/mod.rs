//! Agent configuration.
//!
//! Everything comes from the command line except backend tuning, which
//! lives in an optional private JSON file that only its owner may read.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::probe::ProbeOptions;
use crate::store::{StoreLocation, StoreOptions};
use crate::watch::WatchSettings;

/// Default flush period of every watcher
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(5);

/// Fully resolved agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Normalized absolute indexing roots, deduplicated
    pub roots: Vec<String>,

    /// Store backend and its directory
    pub location: StoreLocation,

    /// Database name inside the store location
    pub dbid: String,

    /// Lower-cased host identity
    pub hostname: String,

    pub log_file: Option<PathBuf>,

    /// Republish every existing entry on startup
    pub reindex: bool,

    /// Run one cleanup pass after startup
    pub cleanup: bool,

    pub flush_period: Duration,

    pub checksums: bool,

    /// Largest file to hash in bytes; 0 means no limit
    pub max_checksum_size: u64,

    /// Count would-be store changes without applying them
    pub read_only: bool,

    pub debug: bool,

    /// Omit timestamps from log lines
    pub no_log_timestamps: bool,

    /// Backend tuning from the private configuration file
    pub store: StoreOptions,
}

impl AgentConfig {
    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            flush_period: self.flush_period,
            probe: ProbeOptions::new(self.checksums, self.max_checksum_size),
            ..WatchSettings::default()
        }
    }

    /// Checks the invariants that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.roots.is_empty() {
            return Err(Error::Config("no indexing paths given".into()));
        }
        if self.dbid.trim().is_empty() {
            return Err(Error::Config("empty database id".into()));
        }
        if self.flush_period.is_zero() {
            return Err(Error::Config("flush period must be positive".into()));
        }
        if self.hostname.is_empty() {
            return Err(Error::Config("empty hostname".into()));
        }
        Ok(())
    }
}

/// Parses a byte count with an optional binary `K`, `M`, `G` or `T`
/// suffix (a trailing `B` is accepted, case is ignored).
pub fn parse_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();
    let body = upper.strip_suffix('B').unwrap_or(upper.as_str());

    let (digits, shift) = match body.chars().last() {
        Some('K') => (&body[..body.len() - 1], 10),
        Some('M') => (&body[..body.len() - 1], 20),
        Some('G') => (&body[..body.len() - 1], 30),
        Some('T') => (&body[..body.len() - 1], 40),
        _ => (body, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid size '{}'", trimmed)))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| Error::Config(format!("size '{}' is too large", trimmed)))
}

/// Parses a duration such as `5s`, `250ms` or `1m 30s`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| Error::Config(format!("invalid duration '{}': {}", s, e)))
}

/// Makes every root absolute against `cwd`, resolves `.` and `..`
/// lexically, strips trailing separators and drops duplicates.
pub fn normalize_roots<S: AsRef<str>>(roots: &[S], cwd: &Path) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(roots.len());
    for root in roots {
        let root = root.as_ref().trim();
        if root.is_empty() {
            continue;
        }
        let joined = cwd.join(root);
        let mut clean = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    clean.pop();
                }
                Component::CurDir => {}
                other => clean.push(other.as_os_str()),
            }
        }
        let clean = clean.to_string_lossy().into_owned();
        if !out.contains(&clean) {
            out.push(clean);
        }
    }
    out
}

/// Loads backend tuning from the private configuration file after
/// checking that it belongs to the effective user and grants nothing to
/// group or other.
pub fn load_private_config(path: &Path) -> Result<StoreOptions> {
    let meta = fs::metadata(path)?;
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if meta.uid() != euid {
        return Err(Error::Security(format!(
            "{} is owned by uid {}, expected {}",
            path.display(),
            meta.uid(),
            euid
        )));
    }
    let mode = meta.mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(Error::Security(format!(
            "{} has mode {:o}; group and other must have no access",
            path.display(),
            mode
        )));
    }

    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// The machine's hostname, lower-cased.
pub fn system_hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).to_lowercase())
}
