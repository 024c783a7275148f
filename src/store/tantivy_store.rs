//! Tantivy-based document store
//!
//! Object records are documents keyed by their `id` term. A normalized
//! copy of the path is indexed as full text so the query side can match
//! words inside file names.

use std::collections::HashMap;
use std::path::Path;
use tantivy::{
    collector::{Count, DocSetCollector, TopDocs},
    directory::MmapDirectory,
    query::{BooleanQuery, Occur, Query, RegexQuery, TermQuery},
    schema::{Field, IndexRecordOption, Schema, INDEXED, STORED, STRING, TEXT, Value},
    Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};
use tracing::{debug, info};

use super::{CommitStats, ObjectStore, StoreOptions};
use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::object::{fields, normalize_text, AiiRecord, FieldValue, FsObject, ObjectRecord};

const FPATH_TEXT: &str = "fpath_text";
const AII_OWNER: &str = "owner";

/// Field handles, resolved by name so existing indexes reopen cleanly.
#[derive(Debug, Clone, Copy)]
struct Fields {
    id: Field,
    host: Field,
    name: Field,
    fpath: Field,
    fpath_text: Field,
    rpath: Field,
    otype: Field,
    size: Field,
    mtime: Field,
    csum: Field,
    oid: Field,
    owner: Field,
    tags: Field,
    descr: Field,
}

impl Fields {
    fn schema() -> Schema {
        let mut builder = Schema::builder();
        builder.add_text_field(fields::ID, STRING | STORED);
        builder.add_text_field(fields::HOST, STRING | STORED);
        builder.add_text_field(fields::NAME, TEXT | STORED);
        builder.add_text_field(fields::FPATH, STRING | STORED);
        builder.add_text_field(FPATH_TEXT, TEXT);
        builder.add_text_field(fields::RPATH, STRING | STORED);
        builder.add_text_field(fields::TYPE, STRING | STORED);
        builder.add_i64_field(fields::SIZE, INDEXED | STORED);
        builder.add_i64_field(fields::MTIME, INDEXED | STORED);
        builder.add_text_field(fields::CSUM, STRING | STORED);
        builder.add_text_field(fields::OID, STRING | STORED);
        builder.add_text_field(AII_OWNER, STRING | STORED);
        builder.add_text_field(fields::TAGS, STRING | STORED);
        builder.add_text_field(fields::DESCR, TEXT | STORED);
        builder.build()
    }

    fn resolve(schema: &Schema) -> Result<Self, StoreError> {
        let get = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| StoreError::Codec(format!("index is missing field '{}'", name)))
        };
        Ok(Self {
            id: get(fields::ID)?,
            host: get(fields::HOST)?,
            name: get(fields::NAME)?,
            fpath: get(fields::FPATH)?,
            fpath_text: get(FPATH_TEXT)?,
            rpath: get(fields::RPATH)?,
            otype: get(fields::TYPE)?,
            size: get(fields::SIZE)?,
            mtime: get(fields::MTIME)?,
            csum: get(fields::CSUM)?,
            oid: get(fields::OID)?,
            owner: get(AII_OWNER)?,
            tags: get(fields::TAGS)?,
            descr: get(fields::DESCR)?,
        })
    }
}

/// Document backend using Tantivy
pub struct TantivyStore {
    index: Index,
    reader: IndexReader,
    writer: Option<IndexWriter>,
    fields: Fields,
    host: String,
    heap_bytes: usize,
    pending: CommitStats,
    staged_ops: usize,
    read_only: bool,
    stopped: bool,
    cancel: CancelToken,
}

impl TantivyStore {
    /// Create or open an index in directory `db_path`
    pub fn open(
        db_path: &Path,
        host: &str,
        options: &StoreOptions,
        cancel: CancelToken,
    ) -> Result<Self, StoreError> {
        info!("[db] opening tantivy store at {}", db_path.display());
        std::fs::create_dir_all(db_path)?;

        let index = if db_path.join("meta.json").exists() {
            Index::open_in_dir(db_path)?
        } else {
            let dir = MmapDirectory::open(db_path)?;
            Index::create(dir, Fields::schema(), IndexSettings::default())?
        };
        let fields = Fields::resolve(&index.schema())?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer: None,
            fields,
            host: host.to_string(),
            heap_bytes: options.writer_heap_mb.max(15) * 1024 * 1024,
            pending: CommitStats::default(),
            staged_ops: 0,
            read_only: false,
            stopped: false,
            cancel,
        })
    }

    /// Ensure writer is initialized for indexing
    fn writer(&mut self) -> Result<&mut IndexWriter, StoreError> {
        if self.stopped {
            return Err(StoreError::Stopped);
        }
        if self.writer.is_none() {
            self.writer = Some(self.index.writer_with_num_threads(1, self.heap_bytes)?);
        }
        self.writer.as_mut().ok_or(StoreError::Stopped)
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        if self.stopped {
            Err(StoreError::Stopped)
        } else {
            Ok(())
        }
    }

    fn term_query(&self, field: Field, value: &str) -> TermQuery {
        TermQuery::new(
            Term::from_field_text(field, value),
            IndexRecordOption::Basic,
        )
    }

    /// Host records whose fpath starts with `prefix`.
    fn prefix_query(&self, prefix: &str) -> Result<BooleanQuery, StoreError> {
        // Filenames may contain newlines.
        let pattern = format!("(?s){}.*", escape_regex(prefix));
        let by_path = RegexQuery::from_pattern(&pattern, self.fields.fpath)?;
        let by_host = self.term_query(self.fields.host, &self.host);
        Ok(BooleanQuery::new(vec![
            (Occur::Must, Box::new(by_host) as Box<dyn Query>),
            (Occur::Must, Box::new(by_path) as Box<dyn Query>),
        ]))
    }

    fn count(&self, query: &dyn Query) -> Result<usize, StoreError> {
        Ok(self.reader.searcher().search(query, &Count)?)
    }

    fn first_doc(&self, field: Field, value: &str) -> Result<Option<TantivyDocument>, StoreError> {
        let searcher = self.reader.searcher();
        let query = self.term_query(field, value);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top.first() {
            Some((_, address)) => Ok(Some(searcher.doc(*address)?)),
            None => Ok(None),
        }
    }

    fn object_document(&self, record: &ObjectRecord) -> TantivyDocument {
        let f = &self.fields;
        let mut doc = TantivyDocument::new();
        doc.add_text(f.id, &record.id);
        doc.add_text(f.host, &record.host);
        doc.add_text(f.name, &record.name);
        doc.add_text(f.fpath, &record.fpath);
        doc.add_text(f.fpath_text, normalize_text(&record.fpath));
        doc.add_text(f.rpath, &record.rpath);
        doc.add_text(f.otype, record.otype.as_str());
        doc.add_i64(f.size, record.size);
        doc.add_i64(f.mtime, record.mtime);
        doc.add_text(f.csum, &record.csum);
        doc
    }

    fn record_from_document(&self, doc: &TantivyDocument) -> Option<ObjectRecord> {
        let f = &self.fields;
        let mut map = HashMap::new();
        for (name, field) in [
            (fields::ID, f.id),
            (fields::HOST, f.host),
            (fields::NAME, f.name),
            (fields::FPATH, f.fpath),
            (fields::RPATH, f.rpath),
            (fields::TYPE, f.otype),
            (fields::CSUM, f.csum),
        ] {
            if let Some(v) = doc.get_first(field).and_then(|v| v.as_str()) {
                map.insert(name.to_string(), FieldValue::Str(v.to_string()));
            }
        }
        for (name, field) in [(fields::SIZE, f.size), (fields::MTIME, f.mtime)] {
            if let Some(v) = doc.get_first(field).and_then(|v| v.as_i64()) {
                map.insert(name.to_string(), FieldValue::Int64(v));
            }
        }
        ObjectRecord::from_fields(&map)
    }

    fn aii_from_document(&self, doc: &TantivyDocument) -> AiiRecord {
        let f = &self.fields;
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        AiiRecord {
            tags: doc
                .get_all(f.tags)
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            descr: text(f.descr),
            owner: text(f.owner),
        }
    }
}

impl ObjectStore for TantivyStore {
    fn host(&self) -> &str {
        &self.host
    }

    fn update_obj(&mut self, obj: &FsObject) -> Result<(), StoreError> {
        self.ensure_running()?;
        self.pending.updated += 1;
        if self.read_only {
            return Ok(());
        }

        let record = obj.clone().into_record(&self.host);
        let doc = self.object_document(&record);
        let id_term = Term::from_field_text(self.fields.id, &record.id);
        let writer = self.writer()?;
        writer.delete_term(id_term);
        writer.add_document(doc)?;
        self.staged_ops += 1;
        Ok(())
    }

    fn delete_obj(&mut self, obj: &FsObject) -> Result<(), StoreError> {
        self.ensure_running()?;
        let id = obj.id(&self.host);
        let existed = self.first_doc(self.fields.id, &id)?.is_some();
        self.pending.deleted += existed as usize;
        if self.read_only {
            return Ok(());
        }

        let owned_aii = match self.first_doc(self.fields.oid, &id)? {
            Some(doc) => self.aii_from_document(&doc).owner == obj.fpath,
            None => false,
        };
        let id_term = Term::from_field_text(self.fields.id, &id);
        let oid_term = Term::from_field_text(self.fields.oid, &id);
        let writer = self.writer()?;
        writer.delete_term(id_term);
        if owned_aii {
            writer.delete_term(oid_term);
        }
        self.staged_ops += 1;
        Ok(())
    }

    fn delete_fpath_prefix(&mut self, obj: &FsObject) -> Result<usize, StoreError> {
        self.ensure_running()?;
        let query = self.prefix_query(&obj.fpath)?;
        let matched = self.count(&query)?;
        self.pending.deleted += matched;
        if self.read_only {
            return Ok(matched);
        }

        self.writer()?.delete_query(Box::new(query))?;
        self.staged_ops += 1;
        Ok(matched)
    }

    fn commit(&mut self) -> Result<CommitStats, StoreError> {
        if self.read_only || self.staged_ops == 0 {
            let stats = std::mem::take(&mut self.pending);
            if self.read_only && !stats.is_empty() {
                debug!("[db] read-only commit: {:?}", stats);
            }
            return Ok(stats);
        }

        self.writer()?.commit()?;
        self.reader.reload()?;
        self.staged_ops = 0;
        Ok(std::mem::take(&mut self.pending))
    }

    fn load_host_paths(
        &self,
        matcher: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Vec<String>, StoreError> {
        self.ensure_running()?;
        let snapshot = self.cancel.snapshot();
        let searcher = self.reader.searcher();
        let query = self.term_query(self.fields.host, &self.host);
        let addresses = searcher.search(&query, &DocSetCollector)?;

        let mut matched = Vec::new();
        for address in addresses {
            if snapshot.is_terminated() {
                return Err(StoreError::Terminated);
            }
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(fpath) = doc.get_first(self.fields.fpath).and_then(|v| v.as_str()) {
                if matcher(fpath) {
                    matched.push(fpath.to_string());
                }
            }
        }
        Ok(matched)
    }

    fn get_obj(&self, id: &str) -> Result<Option<ObjectRecord>, StoreError> {
        self.ensure_running()?;
        Ok(self
            .first_doc(self.fields.id, id)?
            .and_then(|doc| self.record_from_document(&doc)))
    }

    fn set_aii(&mut self, id: &str, aii: &AiiRecord) -> Result<(), StoreError> {
        if self.read_only {
            return Ok(());
        }
        let f = self.fields;
        let mut doc = TantivyDocument::new();
        doc.add_text(f.oid, id);
        doc.add_text(f.owner, &aii.owner);
        doc.add_text(f.descr, &aii.descr);
        for tag in &aii.tags {
            doc.add_text(f.tags, tag);
        }

        let writer = self.writer()?;
        writer.delete_term(Term::from_field_text(f.oid, id));
        writer.add_document(doc)?;
        writer.commit()?;
        self.reader.reload()?;
        self.staged_ops = 0;
        Ok(())
    }

    fn get_aii(&self, id: &str) -> Result<Option<AiiRecord>, StoreError> {
        self.ensure_running()?;
        Ok(self
            .first_doc(self.fields.oid, id)?
            .map(|doc| self.aii_from_document(&doc)))
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn stop(&mut self) -> Result<(), StoreError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        if let Some(mut writer) = self.writer.take() {
            if self.staged_ops > 0 {
                debug!("[db] rolling back {} uncommitted operations", self.staged_ops);
                writer.rollback()?;
            }
            writer.wait_merging_threads()?;
        }
        info!("[db] tantivy store closed");
        Ok(())
    }
}

/// Escapes regex metacharacters so a literal path can prefix a pattern.
fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$#&-~".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
