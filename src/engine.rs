//! Append-only storage engine over a single file.
//!
//! Records are never rewritten in place except for their one-byte status,
//! which transitions created -> updated when a version is superseded and
//! created/updated -> deleted on destroy. Opening a database replays the
//! file in two passes to reconstruct every in-memory index.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::codec;
use crate::document;
use crate::errors::DocumentValidationError;
use crate::index::Index;
use crate::metadata::{Metadata, Status};
use crate::{Document, YarDbError};

const DB_COLLECTION: &str = "_db";

#[derive(Debug)]
pub struct Engine {
    path: PathBuf,
    lock_path: PathBuf,
    file: File,
    collection: String,
    indexes: HashMap<String, Index>,
}

impl Engine {
    /// Acquire the PID lock, open (or create) the storage file and replay it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Engine, YarDbError> {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);
        acquire_lock(&path, &lock_path)?;

        let file = match OpenOptions::new().read(true).write(true).create(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = std::fs::remove_file(&lock_path);
                return Err(e.into());
            }
        };

        let mut engine = Engine {
            path,
            lock_path,
            file,
            collection: DB_COLLECTION.to_string(),
            indexes: HashMap::new(),
        };
        engine.replay()?;
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the active collection for subsequent operations.
    pub fn collection(&mut self, name: &str) {
        self.collection = name.to_string();
    }

    pub fn active_collection(&self) -> &str {
        &self.collection
    }

    /// Names of all collections seen in the file, except the `_db` system
    /// collection, sorted. An index configured before the first document is
    /// stored does not make the collection visible.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indexes
            .iter()
            .filter(|(name, index)| name.as_str() != DB_COLLECTION && index.has_records())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Secondary key names configured for a collection.
    pub fn index_keys(&self, collection: &str) -> Vec<String> {
        self.indexes.get(collection).map(Index::keys).unwrap_or_default()
    }

    /// Append a `created` record for the document, assigning `_id` from the
    /// collection sequence when absent. Returns the id.
    pub fn create(&mut self, document: &mut Document) -> Result<i64, YarDbError> {
        if let Some(id) = document.get("_id") {
            if id.as_i64().is_none() {
                return Err(DocumentValidationError(format!("_id must be an integer, got {id}")).into());
            }
        }

        let index = self.indexes.entry(self.collection.clone()).or_default();
        let id = index.assign_id(document);
        if index.contains(id) {
            return Err(DocumentValidationError(format!("duplicate _id {id}")).into());
        }

        let position = (&self.file).seek(SeekFrom::End(0))?;
        let metadata = Metadata::new(&self.collection, position as i64, -1);
        let mut buf = Vec::new();
        metadata.encode(&mut buf);
        codec::encode_document(&mut buf, document);
        (&self.file).write_all(&buf)?;
        self.file.sync_data()?;

        self.indexes
            .get_mut(&self.collection)
            .expect("index created above")
            .insert(document, position);
        Ok(id)
    }

    /// All live documents matching the selector, in index order. Honors
    /// root-level `$skip` and `$top`.
    pub fn read(&self, selector: &Document) -> Result<Vec<Document>, YarDbError> {
        let mut top = selector
            .get("$top")
            .and_then(Value::as_i64)
            .unwrap_or(i64::MAX);
        let mut skip = selector.get("$skip").and_then(Value::as_i64).unwrap_or(0);

        let mut documents = Vec::new();
        if top <= 0 {
            return Ok(documents);
        }
        for position in self.positions(selector) {
            let (_, document) = self.record_at(position)?;
            if !document::matches(&document, selector) {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            documents.push(document);
            top -= 1;
            if top == 0 {
                break;
            }
        }
        Ok(documents)
    }

    /// Merge `updates` into every matching document, appending the new
    /// versions and marking the old ones superseded.
    pub fn update(&mut self, selector: &Document, updates: &Document) -> Result<Vec<Document>, YarDbError> {
        self.supersede(selector, updates, true)
    }

    /// Replace every matching document wholesale, keeping the version chain.
    pub fn replace(&mut self, selector: &Document, document: &Document) -> Result<Vec<Document>, YarDbError> {
        self.supersede(selector, document, false)
    }

    fn supersede(
        &mut self,
        selector: &Document,
        updates: &Document,
        merge: bool,
    ) -> Result<Vec<Document>, YarDbError> {
        let mut documents = Vec::new();
        for position in self.positions(selector) {
            let (old_metadata, old_document) = self.record_at(position)?;
            if !document::matches(&old_document, selector) {
                continue;
            }

            self.rewrite_status(position, Status::Updated)?;

            let mut new_document = if merge {
                document::merge(updates, &old_document)
            } else {
                let mut replacement = updates.clone();
                if !replacement.contains_key("_id") {
                    if let Some(id) = old_document.get("_id") {
                        replacement.insert("_id".to_string(), id.clone());
                    }
                }
                replacement
            };

            let end = (&self.file).seek(SeekFrom::End(0))?;
            let metadata = Metadata::new(&old_metadata.collection, end as i64, position as i64);

            let index = self.indexes.entry(self.collection.clone()).or_default();
            index.erase(&old_document);
            index.assign_id(&mut new_document);

            let mut buf = Vec::new();
            metadata.encode(&mut buf);
            codec::encode_document(&mut buf, &new_document);
            (&self.file).write_all(&buf)?;

            self.indexes
                .get_mut(&self.collection)
                .expect("index touched above")
                .insert(&new_document, end);
            documents.push(new_document);
        }

        if !documents.is_empty() {
            self.file.sync_data()?;
        }
        Ok(documents)
    }

    /// Mark matching records deleted and erase them from the index. Honors
    /// root-level `$top`.
    pub fn destroy(&mut self, selector: &Document) -> Result<Vec<Document>, YarDbError> {
        let mut top = selector
            .get("$top")
            .and_then(Value::as_i64)
            .unwrap_or(i64::MAX);

        let mut documents = Vec::new();
        if top <= 0 {
            return Ok(documents);
        }
        for position in self.positions(selector) {
            let (_, document) = self.record_at(position)?;
            if !document::matches(&document, selector) {
                continue;
            }
            self.rewrite_status(position, Status::Deleted)?;
            documents.push(document);
            top -= 1;
            if top == 0 {
                break;
            }
        }

        if !documents.is_empty() {
            self.file.sync_data()?;
            let index = self.indexes.entry(self.collection.clone()).or_default();
            for document in &documents {
                index.erase(document);
            }
        }
        Ok(documents)
    }

    /// Every stored version of each matching document, newest first, by
    /// walking the `previous` chain from the live record.
    pub fn history(&self, selector: &Document) -> Result<Vec<Document>, YarDbError> {
        let mut documents = Vec::new();
        for position in self.positions(selector) {
            let (metadata, document) = self.record_at(position)?;
            if !document::matches(&document, selector) {
                continue;
            }
            documents.push(document);
            let mut previous = metadata.previous;
            while previous >= 0 {
                let (metadata, document) = self.record_at(previous as u64)?;
                documents.push(document);
                previous = metadata.previous;
            }
        }
        Ok(documents)
    }

    /// Add secondary keys to the active collection (idempotent) and persist
    /// the configuration in `_db`. Existing documents are not indexed until
    /// `reindex` runs.
    pub fn index(&mut self, keys: Vec<String>) -> Result<Vec<String>, YarDbError> {
        self.configure_index(keys, false)
    }

    /// Replace the active collection's secondary key set.
    pub fn set_index_keys(&mut self, keys: Vec<String>) -> Result<Vec<String>, YarDbError> {
        self.configure_index(keys, true)
    }

    fn configure_index(&mut self, keys: Vec<String>, replace: bool) -> Result<Vec<String>, YarDbError> {
        let collection = self.collection.clone();

        let existing = self.stored_index_keys(&collection)?;
        let mut merged = if replace { Vec::new() } else { existing };
        for key in keys {
            if !merged.contains(&key) {
                merged.push(key);
            }
        }

        let index = self.indexes.entry(collection.clone()).or_default();
        index.add_keys(merged.iter().cloned());
        if replace {
            index.retain_keys(&merged);
        }

        let mut selector = Document::new();
        selector.insert("collection".to_string(), Value::from(collection.clone()));
        let mut config = Document::new();
        config.insert("collection".to_string(), Value::from(collection.clone()));
        config.insert(
            "keys".to_string(),
            Value::Array(merged.iter().cloned().map(Value::from).collect()),
        );

        self.collection = DB_COLLECTION.to_string();
        let result = self.upsert(&selector, &config);
        self.collection = collection;
        result?;

        Ok(merged)
    }

    fn upsert(&mut self, selector: &Document, updates: &Document) -> Result<(), YarDbError> {
        if self.update(selector, updates)?.is_empty() {
            let mut document = updates.clone();
            self.create(&mut document)?;
        }
        Ok(())
    }

    /// The persisted `keys` list for a collection, in stored order.
    pub fn stored_index_keys(&self, collection: &str) -> Result<Vec<String>, YarDbError> {
        let Some(db) = self.indexes.get(DB_COLLECTION) else {
            return Ok(Vec::new());
        };
        let mut selector = Document::new();
        selector.insert("collection".to_string(), Value::from(collection));
        for position in db.view(&selector) {
            let (_, document) = self.record_at(position)?;
            if !document::matches(&document, &selector) {
                continue;
            }
            let keys = document
                .get("keys")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            return Ok(keys);
        }
        Ok(Vec::new())
    }

    /// Rebuild index positions from the file, preserving sequence counters
    /// and the configured key-name sets.
    pub fn reindex(&mut self) -> Result<(), YarDbError> {
        for index in self.indexes.values_mut() {
            index.clear_positions();
        }
        let buf = self.read_file()?;
        self.populate(&buf);
        Ok(())
    }

    /// Timestamp (ms since epoch) of the first document matching the
    /// selector in the active collection.
    pub fn metadata_timestamp(&self, selector: &Document) -> Result<Option<i64>, YarDbError> {
        self.first_metadata(selector)
            .map(|found| found.map(|metadata| metadata.timestamp))
    }

    /// File offset of the first document matching the selector in the active
    /// collection.
    pub fn metadata_position(&self, selector: &Document) -> Result<Option<i64>, YarDbError> {
        self.first_metadata(selector)
            .map(|found| found.map(|metadata| metadata.position))
    }

    fn first_metadata(&self, selector: &Document) -> Result<Option<Metadata>, YarDbError> {
        for position in self.positions(selector) {
            let (metadata, document) = self.record_at(position)?;
            if document::matches(&document, selector) {
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    fn positions(&self, selector: &Document) -> Vec<u64> {
        self.indexes
            .get(&self.collection)
            .map(|index| index.view(selector))
            .unwrap_or_default()
    }

    fn record_at(&self, position: u64) -> Result<(Metadata, Document), YarDbError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(position))?;
        let mut reader = std::io::BufReader::new(file);
        let metadata = Metadata::decode(&mut reader)?;
        let document = codec::decode_document(&mut reader)?;
        Ok((metadata, document))
    }

    fn rewrite_status(&mut self, position: u64, status: Status) -> Result<(), YarDbError> {
        (&self.file).seek(SeekFrom::Start(position))?;
        (&self.file).write_all(&[status.as_byte()])?;
        Ok(())
    }

    fn read_file(&self) -> Result<Vec<u8>, YarDbError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Two replay passes. The first discovers sequence values and the
    /// secondary key names stored in `_db` records; the second populates the
    /// maps. A decode failure stops a pass at the last fully-written record.
    fn replay(&mut self) -> Result<(), YarDbError> {
        let buf = self.read_file()?;
        self.scan_structure(&buf);
        self.populate(&buf);
        Ok(())
    }

    fn scan_structure(&mut self, buf: &[u8]) {
        let mut cursor = Cursor::new(buf);
        while let Some((metadata, document)) = next_record(&mut cursor) {
            self.indexes
                .entry(metadata.collection.clone())
                .or_default()
                .observe(&document);

            if metadata.collection != DB_COLLECTION {
                continue;
            }
            let Some(collection) = document.get("collection").and_then(Value::as_str) else {
                continue;
            };
            let keys: Vec<String> = document
                .get("keys")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            self.indexes
                .entry(collection.to_string())
                .or_default()
                .add_keys(keys);
        }
    }

    fn populate(&mut self, buf: &[u8]) {
        let mut cursor = Cursor::new(buf);
        loop {
            let offset = cursor.position();
            let Some((metadata, document)) = next_record(&mut cursor) else {
                break;
            };
            // Only records whose status byte is still `created` are live.
            if metadata.status != Status::Created {
                continue;
            }
            self.indexes
                .entry(metadata.collection.clone())
                .or_default()
                .insert(&document, offset);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn next_record(cursor: &mut Cursor<&[u8]>) -> Option<(Metadata, Document)> {
    let metadata = Metadata::decode(cursor).ok()?;
    let document = codec::decode_document(cursor).ok()?;
    Some((metadata, document))
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".pid");
    PathBuf::from(name)
}

fn acquire_lock(path: &Path, lock_path: &Path) -> Result<(), YarDbError> {
    if let Ok(owner) = std::fs::read_to_string(lock_path) {
        return Err(YarDbError::AlreadyLocked {
            path: path.display().to_string(),
            pid: owner.trim().to_string(),
        });
    }
    let mut file = File::create(lock_path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}
