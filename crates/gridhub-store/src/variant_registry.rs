//! Declared variants of a network.
//!
//! Variant records live in the project collection `_variants`. Indices start
//! at 1 and are never reused within a network.

use crate::access::WriteAccess;
use crate::config::StoreConfig;
use crate::element::{NET_ID_FIELD, allocate_counter, element_collection, stored_kinds};
use crate::error::{Result, StoreError};
use crate::lock::LockManager;
use crate::network::NETWORKS_COLLECTION;
use crate::variant_filter::{NOT_IN_VAR_FIELD, VAR_TYPE_FIELD, VARIANT_FIELD, VarType, base_clause};
use chrono::{SecondsFormat, Utc};
use gridhub_doc::{
    BackendError, CollectionId, Document, DocumentBackend, Filter, ID_FIELD, Projection, UpdateOp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VARIANTS_COLLECTION: &str = "_variants";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub net_id: i64,
    pub index: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: String,
}

/// Fields of a variant that may be edited after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

pub struct VariantRegistry<'a> {
    backend: &'a dyn DocumentBackend,
    locks: LockManager<'a>,
}

fn record_id(net_id: i64, index: i64) -> String {
    format!("variant:{net_id}:{index}")
}

impl<'a> VariantRegistry<'a> {
    pub fn new(backend: &'a dyn DocumentBackend, config: &StoreConfig) -> Self {
        Self {
            backend,
            locks: LockManager::new(backend, config),
        }
    }

    fn collection(project: &str) -> CollectionId {
        CollectionId::new(project, VARIANTS_COLLECTION)
    }

    fn decode(document: Document) -> Result<VariantRecord> {
        serde_json::from_value(Value::Object(document))
            .map_err(|e| BackendError::InvalidDocument(format!("variant record: {e}")).into())
    }

    pub fn create_variant(
        &self,
        project: &str,
        net_id: i64,
        name: &str,
        description: &str,
        access: &WriteAccess,
    ) -> Result<VariantRecord> {
        access.authorize(&self.locks, project, false)?;
        let network = CollectionId::new(project, NETWORKS_COLLECTION);
        if self.backend.count(&network, &Filter::eq(ID_FIELD, net_id))? == 0 {
            return Err(StoreError::not_found(format!("network {net_id} in project {project}")));
        }
        let index = allocate_counter(self.backend, project, &format!("variant:{net_id}"), 1)?;
        let record = VariantRecord {
            id: record_id(net_id, index),
            net_id,
            index,
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let document = match serde_json::to_value(&record) {
            Ok(Value::Object(doc)) => doc,
            Ok(_) => return Err(StoreError::invalid("variant record is not an object")),
            Err(e) => return Err(BackendError::Serialize(e.to_string()).into()),
        };
        self.backend.insert(&Self::collection(project), document)?;
        tracing::info!(project, net_id, variant = index, name, "variant created");
        Ok(record)
    }

    pub fn list_variants(&self, project: &str, net_id: i64) -> Result<Vec<VariantRecord>> {
        let mut records = self
            .backend
            .find(
                &Self::collection(project),
                &Filter::eq(NET_ID_FIELD, net_id),
                &Projection::All,
            )?
            .into_iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|record| record.index);
        Ok(records)
    }

    pub fn get_variant(&self, project: &str, net_id: i64, index: i64) -> Result<VariantRecord> {
        self.backend
            .find_one(&Self::collection(project), &Filter::eq(ID_FIELD, record_id(net_id, index)))?
            .map(Self::decode)
            .transpose()?
            .ok_or_else(|| StoreError::not_found(format!("variant {index} of network {net_id}")))
    }

    pub fn variant_exists(&self, project: &str, net_id: i64, index: i64) -> Result<bool> {
        Ok(self.backend.count(
            &Self::collection(project),
            &Filter::eq(ID_FIELD, record_id(net_id, index)),
        )? > 0)
    }

    pub fn update_variant(
        &self,
        project: &str,
        net_id: i64,
        index: i64,
        update: &VariantUpdate,
        access: &WriteAccess,
    ) -> Result<VariantRecord> {
        access.authorize(&self.locks, project, false)?;
        let mut ops = Vec::new();
        if let Some(name) = &update.name {
            ops.push(UpdateOp::set("name", name.as_str()));
        }
        if let Some(description) = &update.description {
            ops.push(UpdateOp::set("description", description.as_str()));
        }
        if ops.is_empty() {
            return self.get_variant(project, net_id, index);
        }
        self.backend
            .update_one(
                &Self::collection(project),
                &Filter::eq(ID_FIELD, record_id(net_id, index)),
                &ops,
                false,
            )?
            .map(Self::decode)
            .transpose()?
            .ok_or_else(|| StoreError::not_found(format!("variant {index} of network {net_id}")))
    }

    /// Remove a variant with every change and addition recorded for it, and
    /// lift its suppression from the base rows.
    pub fn delete_variant(
        &self,
        project: &str,
        net_id: i64,
        index: i64,
        access: &WriteAccess,
    ) -> Result<()> {
        access.authorize(&self.locks, project, false)?;
        let removed = self
            .backend
            .delete(&Self::collection(project), &Filter::eq(ID_FIELD, record_id(net_id, index)))?;
        if removed == 0 {
            return Err(StoreError::not_found(format!("variant {index} of network {net_id}")));
        }
        delete_variant_elements(self.backend, project, net_id, index)?;
        tracing::info!(project, net_id, variant = index, "variant deleted");
        Ok(())
    }
}

pub(crate) fn delete_variant_elements(
    backend: &dyn DocumentBackend,
    project: &str,
    net_id: i64,
    variant: i64,
) -> Result<()> {
    let overlay = Filter::and([
        Filter::eq(NET_ID_FIELD, net_id),
        Filter::is_in(
            VAR_TYPE_FIELD,
            [VarType::Change.as_str(), VarType::Addition.as_str()],
        ),
        Filter::eq(VARIANT_FIELD, variant),
    ]);
    let suppressed = Filter::and([
        Filter::eq(NET_ID_FIELD, net_id),
        base_clause(),
        Filter::eq(NOT_IN_VAR_FIELD, variant),
    ]);
    for kind in stored_kinds(backend, project)? {
        let collection = element_collection(project, &kind)?;
        let deleted = backend.delete(&collection, &overlay)?;
        let restored = backend.update_many(
            &collection,
            &suppressed,
            &[UpdateOp::Pull(NOT_IN_VAR_FIELD.to_string(), Value::from(variant))],
        )?;
        tracing::debug!(project, kind = %kind, variant, deleted, restored, "cleared variant elements");
    }
    Ok(())
}
