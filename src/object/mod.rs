//! Canonical filesystem object records and their store identity.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;
use std::path::MAIN_SEPARATOR;

/// Checksum recorded when a regular file exceeds the hashing size limit.
pub const CSUM_TOO_LARGE: &str = "too-large";

/// Checksum recorded when reading a file for hashing failed.
pub const CSUM_ERROR: &str = "error";

/// Object record field names shared by every backend.
pub mod fields {
    pub const ID: &str = "id";
    pub const HOST: &str = "host";
    pub const NAME: &str = "name";
    pub const FPATH: &str = "fpath";
    pub const RPATH: &str = "rpath";
    pub const TYPE: &str = "type";
    pub const SIZE: &str = "size";
    pub const MTIME: &str = "mtime";
    pub const CSUM: &str = "csum";
    pub const TAGS: &str = "tags";
    pub const DESCR: &str = "descr";
    pub const OID: &str = "oid";
}

/// Kind of filesystem entity the indexer tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    #[serde(rename = "reg")]
    Regular,
    #[serde(rename = "dir")]
    Directory,
    Symlink,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Regular => "reg",
            ObjectType::Directory => "dir",
            ObjectType::Symlink => "symlink",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reg" => Some(ObjectType::Regular),
            "dir" => Some(ObjectType::Directory),
            "symlink" => Some(ObjectType::Symlink),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filesystem entity as discovered by the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsObject {
    /// Basename
    pub name: String,

    /// Path at which the object was discovered (may traverse symlinks)
    pub fpath: String,

    /// Link target for symlinks, empty otherwise
    pub rpath: String,

    pub otype: ObjectType,

    pub size: i64,

    /// Seconds since the epoch
    pub mtime: i64,

    /// Hex digest, a sentinel, or empty when hashing is disabled
    pub checksum: String,
}

impl FsObject {
    /// Minimal record carrying only a path, used for deletions where the
    /// object no longer exists on disk.
    pub fn for_path(fpath: impl Into<String>) -> Self {
        let fpath = fpath.into();
        Self {
            name: base_name(&fpath).to_string(),
            fpath,
            rpath: String::new(),
            otype: ObjectType::Regular,
            size: 0,
            mtime: 0,
            checksum: String::new(),
        }
    }

    /// Store primary key of this object for the given host.
    pub fn id(&self, host: &str) -> String {
        object_id(host, &self.fpath)
    }

    pub fn into_record(self, host: &str) -> ObjectRecord {
        ObjectRecord {
            id: object_id(host, &self.fpath),
            host: host.to_string(),
            name: self.name,
            fpath: self.fpath,
            rpath: self.rpath,
            otype: self.otype,
            size: self.size,
            mtime: self.mtime,
            csum: self.checksum,
        }
    }
}

/// Record identifier: hex SHA-1 of `"host:fpath"` (always 40 characters).
pub fn object_id(host: &str, fpath: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(fpath.as_bytes());
    hex::encode(hasher.finalize())
}

/// Last path component of a slash-separated path string.
pub fn base_name(fpath: &str) -> &str {
    let trimmed = fpath.trim_end_matches(MAIN_SEPARATOR);
    match trimmed.rfind(MAIN_SEPARATOR) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Tokenizer-friendly variant of a path or phrase: lower-cased, with
/// underscores turned into spaces. The query side applies the same
/// normalization to search phrases.
pub fn normalize_text(s: &str) -> String {
    s.to_lowercase().replace('_', " ")
}

/// Field value as stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int64(i64),
    StrList(Vec<String>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, also accepting integers some backends store as text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int64(v) => Some(*v),
            FieldValue::Str(s) => s.trim().parse().ok(),
            FieldValue::StrList(_) => None,
        }
    }

    #[cfg(test)]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::StrList(v) => Some(v),
            _ => None,
        }
    }
}

/// Object record as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    pub host: String,
    pub name: String,
    pub fpath: String,
    pub rpath: String,
    #[serde(rename = "type")]
    pub otype: ObjectType,
    pub size: i64,
    pub mtime: i64,
    pub csum: String,
}

impl ObjectRecord {
    /// Builds a record from backend fields. Missing string fields become
    /// empty, missing integers zero; `id`, `fpath` and `type` are required.
    pub fn from_fields(fields: &HashMap<String, FieldValue>) -> Option<Self> {
        let text = |name: &str| {
            fields
                .get(name)
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let int = |name: &str| fields.get(name).and_then(FieldValue::as_i64).unwrap_or(0);

        let id = fields.get(fields::ID)?.as_str()?.to_string();
        let fpath = fields.get(fields::FPATH)?.as_str()?.to_string();
        let otype = ObjectType::parse(fields.get(fields::TYPE)?.as_str()?)?;

        Some(Self {
            id,
            host: text(fields::HOST),
            name: text(fields::NAME),
            fpath,
            rpath: text(fields::RPATH),
            otype,
            size: int(fields::SIZE),
            mtime: int(fields::MTIME),
            csum: text(fields::CSUM),
        })
    }

    #[cfg(test)]
    pub fn to_fields(&self) -> HashMap<String, FieldValue> {
        let mut map = HashMap::new();
        map.insert(fields::ID.into(), FieldValue::Str(self.id.clone()));
        map.insert(fields::HOST.into(), FieldValue::Str(self.host.clone()));
        map.insert(fields::NAME.into(), FieldValue::Str(self.name.clone()));
        map.insert(fields::FPATH.into(), FieldValue::Str(self.fpath.clone()));
        map.insert(fields::RPATH.into(), FieldValue::Str(self.rpath.clone()));
        map.insert(fields::TYPE.into(), FieldValue::Str(self.otype.as_str().into()));
        map.insert(fields::SIZE.into(), FieldValue::Int64(self.size));
        map.insert(fields::MTIME.into(), FieldValue::Int64(self.mtime));
        map.insert(fields::CSUM.into(), FieldValue::Str(self.csum.clone()));
        map
    }
}

/// Additional information attached to an object by id.
///
/// `owner` holds the fpath of the object the item was attached to; an
/// object deletion only removes the item while the two still agree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiiRecord {
    pub tags: Vec<String>,
    pub descr: String,
    pub owner: String,
}

impl AiiRecord {
    /// Names of the fields that carry a value, for the per-field index.
    pub fn populated_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.tags.is_empty() {
            out.push(fields::TAGS);
        }
        if !self.descr.is_empty() {
            out.push(fields::DESCR);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_object_id_is_stable_sha1() {
        let id = object_id("host1", "/tmp/r/a.txt");
        assert_eq!(id.len(), 40);
        assert_eq!(id, object_id("host1", "/tmp/r/a.txt"));
        assert_ne!(id, object_id("host2", "/tmp/r/a.txt"));
        assert_ne!(id, object_id("host1", "/tmp/r/b.txt"));
    }

    #[test]
    fn test_object_id_known_digest() {
        assert_eq!(
            object_id("host1", "/tmp/r/a.txt"),
            "d82a046652f983f0a9090a8b51ed53f862c11302"
        );
        assert_eq!(object_id("", ""), "05a79f06cf3f67f726dae68d18a2290f6c9a50c9");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/tmp/r/a.txt"), "a.txt");
        assert_eq!(base_name("/tmp/r/sub/"), "sub");
        assert_eq!(base_name("plain"), "plain");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("/Data/My_Report.PDF"), "/data/my report.pdf");
    }

    #[test]
    fn test_record_field_round_trip() {
        let obj = FsObject {
            name: "a.txt".into(),
            fpath: "/tmp/r/a.txt".into(),
            rpath: String::new(),
            otype: ObjectType::Regular,
            size: 3,
            mtime: 1_700_000_000,
            checksum: String::new(),
        };
        let record = obj.into_record("h");
        let back = ObjectRecord::from_fields(&record.to_fields()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_field_value_accessors() {
        assert_eq!(FieldValue::Str("42".into()).as_i64(), Some(42));
        assert_eq!(FieldValue::Int64(7).as_i64(), Some(7));
        assert_eq!(FieldValue::Int64(7).as_str(), None);
        assert!(FieldValue::StrList(vec!["x".into()]).as_list().is_some());
    }

    #[test]
    fn test_aii_populated_fields() {
        let aii = AiiRecord {
            tags: vec!["t".into()],
            descr: String::new(),
            owner: "/x".into(),
        };
        assert_eq!(aii.populated_fields(), vec![fields::TAGS]);
    }
}
