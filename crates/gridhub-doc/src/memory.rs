//! In-process document backend.
//!
//! Holds every collection in one mutex-guarded map. Used by tests and by
//! embedders that do not need persistence.

use crate::backend::DocumentBackend;
use crate::collection::{self, UpsertOutcome};
use crate::document::{CollectionId, Document};
use crate::error::BackendError;
use crate::filter::Filter;
use crate::update::{Projection, UpdateOp};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: Mutex<BTreeMap<CollectionId, Vec<Document>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BTreeMap<CollectionId, Vec<Document>>> {
        // Mutations stage their result before swapping it in, so a poisoned
        // map is still consistent.
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_collection<T>(
        &self,
        collection: &CollectionId,
        f: impl FnOnce(&mut Vec<Document>, &str) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut state = self.state();
        let docs = state.entry(collection.clone()).or_default();
        f(docs, &collection.to_string())
    }

    fn read_collection<T>(&self, collection: &CollectionId, f: impl FnOnce(&[Document]) -> T) -> T {
        let state = self.state();
        match state.get(collection) {
            Some(docs) => f(docs),
            None => f(&[]),
        }
    }
}

impl DocumentBackend for MemoryBackend {
    fn insert(&self, collection: &CollectionId, document: Document) -> Result<(), BackendError> {
        self.with_collection(collection, |docs, name| {
            collection::insert(docs, name, document)
        })
    }

    fn insert_many(
        &self,
        collection: &CollectionId,
        documents: Vec<Document>,
    ) -> Result<usize, BackendError> {
        self.with_collection(collection, |docs, name| {
            collection::insert_many(docs, name, documents)
        })
    }

    fn upsert(
        &self,
        collection: &CollectionId,
        key: &Filter,
        document: Document,
    ) -> Result<UpsertOutcome, BackendError> {
        self.with_collection(collection, |docs, name| {
            collection::upsert(docs, name, key, document)
        })
    }

    fn update_one(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        ops: &[UpdateOp],
        upsert: bool,
    ) -> Result<Option<Document>, BackendError> {
        self.with_collection(collection, |docs, name| {
            collection::update_one(docs, name, filter, ops, upsert)
        })
    }

    fn update_many(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        ops: &[UpdateOp],
    ) -> Result<usize, BackendError> {
        self.with_collection(collection, |docs, _| {
            collection::update_many(docs, filter, ops)
        })
    }

    fn delete(&self, collection: &CollectionId, filter: &Filter) -> Result<usize, BackendError> {
        self.with_collection(collection, |docs, _| Ok(collection::delete(docs, filter)))
    }

    fn find(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Vec<Document>, BackendError> {
        Ok(self.read_collection(collection, |docs| {
            collection::find(docs, filter, projection)
        }))
    }

    fn count(&self, collection: &CollectionId, filter: &Filter) -> Result<usize, BackendError> {
        Ok(self.read_collection(collection, |docs| collection::count(docs, filter)))
    }

    fn list_collections(&self, database: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .state()
            .iter()
            .filter(|(id, docs)| id.database == database && !docs.is_empty())
            .map(|(id, _)| id.name.clone())
            .collect())
    }

    fn rename_collection(&self, from: &CollectionId, to: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        let target = CollectionId::new(from.database.clone(), to);
        if state.get(&target).is_some_and(|docs| !docs.is_empty()) {
            return Err(BackendError::CollectionExists(target.to_string()));
        }
        let docs = state.remove(from).unwrap_or_default();
        state.insert(target, docs);
        Ok(())
    }

    fn drop_collection(&self, collection: &CollectionId) -> Result<bool, BackendError> {
        Ok(self
            .state()
            .remove(collection)
            .is_some_and(|docs| !docs.is_empty()))
    }

    fn drop_database(&self, database: &str) -> Result<(), BackendError> {
        self.state().retain(|id, _| id.database != database);
        Ok(())
    }
}
