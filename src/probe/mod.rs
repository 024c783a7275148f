//! Object probe: turns a path into an `FsObject`.

use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::warn;

use crate::error::ProbeError;
use crate::object::{FsObject, ObjectType, CSUM_ERROR, CSUM_TOO_LARGE};

/// Content hashing settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Compute content checksums for regular files
    pub checksums: bool,

    /// Largest file to hash in bytes; 0 hashes everything
    pub max_checksum_size: u64,
}

impl ProbeOptions {
    pub fn new(checksums: bool, max_checksum_size: u64) -> Self {
        Self {
            checksums,
            max_checksum_size,
        }
    }
}

/// Stats `path` without following a final symlink and builds its record.
///
/// Returns `Ok(None)` for entities the index does not track (sockets,
/// fifos, devices). `ProbeError::NotFound` means the path is gone.
pub fn probe(path: &Path, opts: &ProbeOptions) -> Result<Option<FsObject>, ProbeError> {
    let meta = fs::symlink_metadata(path).map_err(|e| ProbeError::from_io(path, e))?;
    let ft = meta.file_type();

    let otype = if ft.is_file() {
        ObjectType::Regular
    } else if ft.is_dir() {
        ObjectType::Directory
    } else if ft.is_symlink() {
        ObjectType::Symlink
    } else {
        return Ok(None);
    };

    let fpath = path.to_string_lossy().into_owned();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fpath.clone());

    let rpath = if otype == ObjectType::Symlink {
        match fs::read_link(path) {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(e) => {
                warn!("[probe] cannot read link {}: {}", path.display(), e);
                String::new()
            }
        }
    } else {
        String::new()
    };

    let size = meta.size() as i64;
    let checksum = if otype == ObjectType::Regular && opts.checksums {
        checksum_for(path, meta.size(), opts.max_checksum_size)
    } else {
        String::new()
    };

    Ok(Some(FsObject {
        name,
        fpath,
        rpath,
        otype,
        size,
        mtime: meta.mtime(),
        checksum,
    }))
}

/// Checksum value for a regular file of `size` bytes under `max_size`.
fn checksum_for(path: &Path, size: u64, max_size: u64) -> String {
    if max_size > 0 && size > max_size {
        return CSUM_TOO_LARGE.to_string();
    }
    match hash_file(path) {
        Ok(digest) => digest,
        Err(e) => {
            warn!("[probe] checksum of {} failed: {}", path.display(), e);
            CSUM_ERROR.to_string()
        }
    }
}

/// Streams the file through SHA-1 and returns the hex digest.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha1::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const ABC_SHA1: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

    #[test]
    fn test_probe_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "abc").unwrap();

        let obj = probe(&path, &ProbeOptions::default()).unwrap().unwrap();
        assert_eq!(obj.name, "a.txt");
        assert_eq!(obj.fpath, path.to_string_lossy());
        assert_eq!(obj.otype, ObjectType::Regular);
        assert_eq!(obj.size, 3);
        assert!(obj.rpath.is_empty());
        assert!(obj.checksum.is_empty());
        assert!(obj.mtime > 0);
    }

    #[test]
    fn test_probe_hashes_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "abc").unwrap();

        let obj = probe(&path, &ProbeOptions::new(true, 0)).unwrap().unwrap();
        assert_eq!(obj.checksum, ABC_SHA1);
    }

    #[test]
    fn test_checksum_size_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "abc").unwrap();

        let exact = probe(&path, &ProbeOptions::new(true, 3)).unwrap().unwrap();
        assert_eq!(exact.checksum, ABC_SHA1);

        let over = probe(&path, &ProbeOptions::new(true, 2)).unwrap().unwrap();
        assert_eq!(over.checksum, CSUM_TOO_LARGE);
    }

    #[test]
    fn test_probe_directory_has_no_checksum() {
        let dir = TempDir::new().unwrap();
        let obj = probe(dir.path(), &ProbeOptions::new(true, 0))
            .unwrap()
            .unwrap();
        assert_eq!(obj.otype, ObjectType::Directory);
        assert!(obj.checksum.is_empty());
    }

    #[test]
    fn test_probe_symlink_records_target() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("link");
        symlink("/nonexistent/target", &link).unwrap();

        let obj = probe(&link, &ProbeOptions::new(true, 0)).unwrap().unwrap();
        assert_eq!(obj.otype, ObjectType::Symlink);
        assert_eq!(obj.rpath, "/nonexistent/target");
        assert!(obj.checksum.is_empty());
    }

    #[test]
    fn test_probe_missing_path() {
        let dir = TempDir::new().unwrap();
        let err = probe(&dir.path().join("nope"), &ProbeOptions::default()).unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
    }

    #[test]
    fn test_probe_skips_fifo() {
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("fifo");
        let c_path = std::ffi::CString::new(fifo.to_string_lossy().as_bytes()).unwrap();
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return;
        }
        assert!(probe(&fifo, &ProbeOptions::default()).unwrap().is_none());
    }

    #[test]
    fn test_unreadable_file_records_error_sentinel() {
        let dir = TempDir::new().unwrap();
        assert_eq!(checksum_for(&dir.path().join("gone"), 3, 0), CSUM_ERROR);
    }
}
