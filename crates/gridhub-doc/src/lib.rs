//! # gridhub-doc
//!
//! Document collection substrate for the gridhub store.
//!
//! This crate provides:
//! - `Document`, `CollectionId` and field helpers
//! - `Filter` predicates (equality, membership, existence, range, boolean)
//! - `Projection` and `UpdateOp` field operators
//! - the `DocumentBackend` trait with in-memory and JSONL implementations
//!
//! It knows nothing about networks, variants or projects; those live in
//! `gridhub-store`.
//!
//! ## Data model
//!
//! ```text
//! JSONL (on disk, one file per collection, one line per document)
//!     <->  lock-scoped load / atomic replace
//! Vec<Document> (insertion-ordered collection)
//! ```

pub mod atomic_store;
pub mod backend;
pub mod collection;
pub mod document;
pub mod error;
pub mod filter;
pub mod jsonl;
pub mod jsonl_backend;
pub mod memory;
pub mod update;

pub use atomic_store::{collection_lock_path, mutate_collection_jsonl};
pub use backend::DocumentBackend;
pub use collection::UpsertOutcome;
pub use document::{
    CollectionId, Document, ID_FIELD, SYSTEM_DATABASE, display_id, document_id, get_i64, lookup,
    values_equal,
};
pub use error::BackendError;
pub use filter::Filter;
pub use jsonl::{read_documents, read_documents_from_path, write_documents, write_documents_to_path};
pub use jsonl_backend::JsonlBackend;
pub use memory::MemoryBackend;
pub use update::{Projection, UpdateOp, apply_updates};
