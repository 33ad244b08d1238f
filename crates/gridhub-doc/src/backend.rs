//! The storage boundary consumed by the store layer.

use crate::collection::UpsertOutcome;
use crate::document::{CollectionId, Document};
use crate::error::BackendError;
use crate::filter::Filter;
use crate::update::{Projection, UpdateOp};

/// A document-collection store.
///
/// Implementations guarantee per-document atomicity for `insert`, `upsert`
/// and `update_one`; nothing is atomic across documents except
/// `insert_many`, which applies all documents or none. `find` returns
/// documents in insertion order.
pub trait DocumentBackend: Send + Sync {
    fn insert(&self, collection: &CollectionId, document: Document) -> Result<(), BackendError>;

    fn insert_many(
        &self,
        collection: &CollectionId,
        documents: Vec<Document>,
    ) -> Result<usize, BackendError>;

    /// Replace the first document matching `key`, or insert `document`.
    fn upsert(
        &self,
        collection: &CollectionId,
        key: &Filter,
        document: Document,
    ) -> Result<UpsertOutcome, BackendError>;

    /// Atomically modify the first matching document and return it as updated.
    ///
    /// With `upsert`, a missing document is created from the filter's
    /// equality constraints before the operators are applied.
    fn update_one(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        ops: &[UpdateOp],
        upsert: bool,
    ) -> Result<Option<Document>, BackendError>;

    fn update_many(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        ops: &[UpdateOp],
    ) -> Result<usize, BackendError>;

    fn delete(&self, collection: &CollectionId, filter: &Filter) -> Result<usize, BackendError>;

    fn find(
        &self,
        collection: &CollectionId,
        filter: &Filter,
        projection: &Projection,
    ) -> Result<Vec<Document>, BackendError>;

    fn find_one(
        &self,
        collection: &CollectionId,
        filter: &Filter,
    ) -> Result<Option<Document>, BackendError> {
        Ok(self
            .find(collection, filter, &Projection::All)?
            .into_iter()
            .next())
    }

    fn count(&self, collection: &CollectionId, filter: &Filter) -> Result<usize, BackendError> {
        Ok(self.find(collection, filter, &Projection::All)?.len())
    }

    /// Names of the non-empty collections of one database, sorted.
    fn list_collections(&self, database: &str) -> Result<Vec<String>, BackendError>;

    fn rename_collection(&self, from: &CollectionId, to: &str) -> Result<(), BackendError>;

    /// Returns whether the collection existed.
    fn drop_collection(&self, collection: &CollectionId) -> Result<bool, BackendError>;

    fn drop_database(&self, database: &str) -> Result<(), BackendError>;
}
