//! File-backed document backend.
//!
//! Layout: `<root>/<database>/<collection>.jsonl`. Every mutation runs under
//! the collection's `.lock` file and replaces the file atomically, so several
//! processes may share one data directory.

use crate::atomic_store::mutate_collection_jsonl;
use crate::backend::DocumentBackend;
use crate::collection::{self, UpsertOutcome};
use crate::document::{CollectionId, Document};
use crate::error::BackendError;
use crate::filter::Filter;
use crate::jsonl::read_documents_from_path;
use crate::update::{Projection, UpdateOp};
use std::fs;
use std::path::{Path, PathBuf};

const COLLECTION_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone)]
pub struct JsonlBackend {
    root: PathBuf,
}

impl JsonlBackend {
    /// Open (creating if needed) a data directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", root.display())))?;
        tracing::debug!(root = %root.display(), "opened jsonl backend");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database_dir(&self, database: &str) -> Result<PathBuf, BackendError> {
        validate_name(database)?;
        Ok(self.root.join(database))
    }

    fn collection_path(&self, collection: &CollectionId) -> Result<PathBuf, BackendError> {
        validate_name(&collection.name)?;
        Ok(self
            .database_dir(&collection.database)?
            .join(format!("{}.{COLLECTION_EXTENSION}", collection.name)))
    }

    fn mutate<T>(
        &self,
        collection: &CollectionId,
        f: impl FnOnce(&mut Vec<Document>, &str) -> Result<(T, bool), BackendError>,
    ) -> Result<T, BackendError> {
        let path = self.collection_path(collection)?;
        let name = collection.to_string();
        mutate_collection_jsonl(path, |docs| f(docs, &name))
    }

    fn load(&self, collection: &CollectionId) -> Result<Vec<Document>, BackendError> {
        read_documents_from_path(self.collection_path(collection)?)
    }
}

/// Names become path segments, so they are restricted to a portable charset.
fn validate_name(name: &str) -> Result<(), BackendError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BackendError::InvalidName(name.to_string()))
    }
}

impl DocumentBackend for JsonlBackend {
    fn insert(&self, collection: &CollectionId, document: Document) -> Result<(), BackendError> {
        self.mutate(collection, |docs, name| {
            collection::insert(docs, name, document).map(|()| ((), true))
        })
    }

    fn insert_many(
        &self,
        collection: &CollectionId,
        documents: Vec<Document>,
    ) -> Result<usize, BackendError> {
        self.mutate(collection, |docs, name| {
            let count = collection::insert_many(docs, name, documents)?;
            Ok((count, count > 0))
        })
    }

    fn upsert(
        &self,
        collection: &CollectionId,
        key: &Filter,
        document: Document,
    ) -> Result<UpsertOutcome, BackendError> {
        self.mutate(collection, |docs, name| {
            collection::upsert(docs, name, key, document).map(|outcome| (outcome, true))
        })
    }

    fn update_one(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        ops: &[UpdateOp],
        upsert: bool,
    ) -> Result<Option<Document>, BackendError> {
        self.mutate(collection, |docs, name| {
            let updated = collection::update_one(docs, name, filter, ops, upsert)?;
            let changed = updated.is_some();
            Ok((updated, changed))
        })
    }

    fn update_many(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        ops: &[UpdateOp],
    ) -> Result<usize, BackendError> {
        self.mutate(collection, |docs, _| {
            let count = collection::update_many(docs, filter, ops)?;
            Ok((count, count > 0))
        })
    }

    fn delete(&self, collection: &CollectionId, filter: &Filter) -> Result<usize, BackendError> {
        self.mutate(collection, |docs, _| {
            let count = collection::delete(docs, filter);
            Ok((count, count > 0))
        })
    }

    fn find(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Vec<Document>, BackendError> {
        let docs = self.load(collection)?;
        Ok(collection::find(&docs, filter, projection))
    }

    fn count(&self, collection: &CollectionId, filter: &Filter) -> Result<usize, BackendError> {
        let docs = self.load(collection)?;
        Ok(collection::count(&docs, filter))
    }

    fn list_collections(&self, database: &str) -> Result<Vec<String>, BackendError> {
        let dir = self.database_dir(database)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::Io(0, format!("{}: {e}", dir.display()))),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackendError::Io(0, format!("{}: {e}", dir.display())))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(COLLECTION_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !read_documents_from_path(&path)?.is_empty() {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename_collection(&self, from: &CollectionId, to: &str) -> Result<(), BackendError> {
        let target = CollectionId::new(from.database.clone(), to);
        let target_path = self.collection_path(&target)?;
        let source_path = self.collection_path(from)?;

        mutate_collection_jsonl(&source_path, |source_docs| {
            mutate_collection_jsonl(&target_path, |target_docs| {
                if !target_docs.is_empty() {
                    return Err(BackendError::CollectionExists(target.to_string()));
                }
                *target_docs = std::mem::take(source_docs);
                Ok(((), true))
            })?;
            Ok(((), false))
        })?;

        match fs::remove_file(&source_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(0, format!("{}: {e}", source_path.display()))),
        }
    }

    fn drop_collection(&self, collection: &CollectionId) -> Result<bool, BackendError> {
        let path = self.collection_path(collection)?;
        let existed = mutate_collection_jsonl(&path, |docs| Ok((!docs.is_empty(), false)))?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(existed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BackendError::Io(0, format!("{}: {e}", path.display()))),
        }
    }

    fn drop_database(&self, database: &str) -> Result<(), BackendError> {
        let dir = self.database_dir(database)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(0, format!("{}: {e}", dir.display()))),
        }
    }
}
