//! Backend-independent collection semantics.
//!
//! Both backends hold a collection as an insertion-ordered `Vec<Document>`
//! and delegate every mutation to the functions here, so the in-memory and
//! on-disk stores cannot drift apart.

use crate::document::{Document, ID_FIELD, display_id, document_id, values_equal};
use crate::error::BackendError;
use crate::filter::Filter;
use crate::update::{Projection, UpdateOp, apply_updates};
use serde_json::Value;

/// Whether an upsert replaced an existing document or inserted a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

fn require_id<'a>(document: &'a Document, collection: &str) -> Result<&'a Value, BackendError> {
    document_id(document).ok_or_else(|| {
        BackendError::InvalidDocument(format!("document for {collection} has no _id"))
    })
}

fn position_of_id(docs: &[Document], id: &Value) -> Option<usize> {
    docs.iter()
        .position(|d| document_id(d).is_some_and(|existing| values_equal(existing, id)))
}

fn duplicate(collection: &str, id: &Value) -> BackendError {
    BackendError::DuplicateKey {
        collection: collection.to_string(),
        key: display_id(id),
    }
}

pub fn insert(
    docs: &mut Vec<Document>,
    collection: &str,
    document: Document,
) -> Result<(), BackendError> {
    let id = require_id(&document, collection)?;
    if position_of_id(docs, id).is_some() {
        return Err(duplicate(collection, id));
    }
    docs.push(document);
    Ok(())
}

/// Insert all documents or none.
pub fn insert_many(
    docs: &mut Vec<Document>,
    collection: &str,
    documents: Vec<Document>,
) -> Result<usize, BackendError> {
    let mut staged = docs.clone();
    let count = documents.len();
    for document in documents {
        insert(&mut staged, collection, document)?;
    }
    *docs = staged;
    Ok(count)
}

pub fn upsert(
    docs: &mut Vec<Document>,
    collection: &str,
    key: &Filter,
    mut document: Document,
) -> Result<UpsertOutcome, BackendError> {
    match docs.iter().position(|d| key.matches(d)) {
        Some(pos) => {
            let existing_id = require_id(&docs[pos], collection)?.clone();
            match document_id(&document) {
                None => {
                    document.insert(ID_FIELD.to_string(), existing_id);
                }
                Some(new_id) if !values_equal(new_id, &existing_id) => {
                    if position_of_id(docs, new_id).is_some() {
                        return Err(duplicate(collection, new_id));
                    }
                }
                Some(_) => {}
            }
            docs[pos] = document;
            Ok(UpsertOutcome::Replaced)
        }
        None => {
            if document_id(&document).is_none() {
                seed_from_filter(&mut document, key);
            }
            insert(docs, collection, document)?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

pub fn update_one(
    docs: &mut Vec<Document>,
    collection: &str,
    filter: &Filter,
    ops: &[UpdateOp],
    upsert: bool,
) -> Result<Option<Document>, BackendError> {
    if let Some(pos) = docs.iter().position(|d| filter.matches(d)) {
        apply_updates(&mut docs[pos], ops)?;
        return Ok(Some(docs[pos].clone()));
    }
    if !upsert {
        return Ok(None);
    }
    let mut document = Document::new();
    seed_from_filter(&mut document, filter);
    apply_updates(&mut document, ops)?;
    insert(docs, collection, document.clone())?;
    Ok(Some(document))
}

pub fn update_many(
    docs: &mut [Document],
    filter: &Filter,
    ops: &[UpdateOp],
) -> Result<usize, BackendError> {
    let mut staged: Vec<(usize, Document)> = Vec::new();
    for (pos, doc) in docs.iter().enumerate() {
        if filter.matches(doc) {
            let mut next = doc.clone();
            apply_updates(&mut next, ops)?;
            staged.push((pos, next));
        }
    }
    let count = staged.len();
    for (pos, doc) in staged {
        docs[pos] = doc;
    }
    Ok(count)
}

pub fn delete(docs: &mut Vec<Document>, filter: &Filter) -> usize {
    let before = docs.len();
    docs.retain(|d| !filter.matches(d));
    before - docs.len()
}

pub fn find(docs: &[Document], filter: &Filter, projection: &Projection) -> Vec<Document> {
    docs.iter()
        .filter(|d| filter.matches(d))
        .map(|d| projection.apply(d))
        .collect()
}

pub fn count(docs: &[Document], filter: &Filter) -> usize {
    docs.iter().filter(|d| filter.matches(d)).count()
}

fn seed_from_filter(document: &mut Document, filter: &Filter) {
    for (field, value) in filter.equality_fields() {
        if !field.contains('.') {
            document
                .entry(field.to_string())
                .or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut docs = Vec::new();
        insert(&mut docs, "c", doc(json!({"_id": "a"}))).expect("first insert");
        let err = insert(&mut docs, "c", doc(json!({"_id": "a"}))).expect_err("duplicate");
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn insert_many_is_all_or_nothing() {
        let mut docs = vec![doc(json!({"_id": 2}))];
        let err = insert_many(
            &mut docs,
            "c",
            vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))],
        )
        .expect_err("second document collides");
        assert!(err.is_duplicate_key());
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn upsert_replaces_matching_document_and_keeps_id() {
        let mut docs = vec![doc(json!({"_id": "x", "v": 1}))];
        let outcome = upsert(&mut docs, "c", &Filter::eq("_id", "x"), doc(json!({"v": 2})))
            .expect("upsert");
        assert_eq!(outcome, UpsertOutcome::Replaced);
        assert_eq!(Value::Object(docs[0].clone()), json!({"v": 2, "_id": "x"}));
    }

    #[test]
    fn update_one_upserts_from_equality_filter() {
        let mut docs = Vec::new();
        let updated = update_one(
            &mut docs,
            "c",
            &Filter::eq("_id", "seq:bus"),
            &[UpdateOp::Inc("next".to_string(), 1)],
            true,
        )
        .expect("upsert update")
        .expect("document returned");
        assert_eq!(updated["next"], json!(1));
        assert_eq!(updated["_id"], json!("seq:bus"));
    }

    #[test]
    fn delete_counts_removed_documents() {
        let mut docs = vec![
            doc(json!({"_id": 1, "k": "a"})),
            doc(json!({"_id": 2, "k": "b"})),
            doc(json!({"_id": 3, "k": "a"})),
        ];
        assert_eq!(delete(&mut docs, &Filter::eq("k", "a")), 2);
        assert_eq!(docs.len(), 1);
    }
}
