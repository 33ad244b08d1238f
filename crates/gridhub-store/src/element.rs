//! Per-kind element collections with the variant overlay.
//!
//! Elements of kind `bus` live in the project collection `net_bus`. Each
//! document carries `net_id`, `index` and its overlay tag. Document ids make
//! the overlay invariants unique keys:
//!
//! ```text
//! base:<net_id>:<index>                one base row per index
//! change:<net_id>:<index>:<variant>    one change per (index, variant)
//! addition:<net_id>:<index>            addition indices unique across variants
//! ```
//!
//! Cross-kind references (a line's `from_bus`) are not checked.

use crate::access::WriteAccess;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::lock::LockManager;
use crate::variant_filter::{
    ElementVariant, NOT_IN_VAR_FIELD, VAR_TYPE_FIELD, VARIANT_FIELD, VarType, VariantContext,
    base_clause, build_filter, dedupe_by_index,
};
use gridhub_doc::{
    BackendError, CollectionId, Document, DocumentBackend, Filter, ID_FIELD, Projection, UpdateOp,
    get_i64,
};
use gridhub_table::{
    AttributeDef, AttributeSpec, CellValue, INDEX_FIELD, Row, SchemaCatalog, Table, TableSchema,
    coerce, decode_cell, decode_document, documents_to_table, encode_cell, encode_row, infer_cell,
    is_reserved, rows_to_documents,
};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

pub const ELEMENT_COLLECTION_PREFIX: &str = "net_";
pub const COUNTERS_COLLECTION: &str = "_counters";
/// Attribute types per (kind, net) as last written.
pub const LAYOUTS_COLLECTION: &str = "_layouts";
pub const NET_ID_FIELD: &str = "net_id";
const COUNTER_FIELD: &str = "next";
const LAYOUT_ATTRIBUTES_FIELD: &str = "attributes";

fn kind_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("kind regex must compile"))
}

pub fn validate_kind(kind: &str) -> Result<()> {
    if kind_re().is_match(kind) {
        Ok(())
    } else {
        Err(StoreError::invalid(format!(
            "element kind `{kind}` must be lowercase snake_case"
        )))
    }
}

pub fn element_collection(project: &str, kind: &str) -> Result<CollectionId> {
    validate_kind(kind)?;
    Ok(CollectionId::new(
        project,
        format!("{ELEMENT_COLLECTION_PREFIX}{kind}"),
    ))
}

/// Element kinds that have a collection in `project`.
pub fn stored_kinds(backend: &dyn DocumentBackend, project: &str) -> Result<Vec<String>> {
    Ok(backend
        .list_collections(project)?
        .into_iter()
        .filter_map(|name| name.strip_prefix(ELEMENT_COLLECTION_PREFIX).map(str::to_string))
        .collect())
}

/// Bump a named counter in the project's counter collection to at least
/// `floor + 1` and return the value it held before the increment.
pub(crate) fn allocate_counter(
    backend: &dyn DocumentBackend,
    project: &str,
    counter: &str,
    floor: i64,
) -> Result<i64> {
    let updated = backend
        .update_one(
            &CollectionId::new(project, COUNTERS_COLLECTION),
            &Filter::eq(ID_FIELD, counter),
            &[
                UpdateOp::Max(COUNTER_FIELD.to_string(), floor),
                UpdateOp::Inc(COUNTER_FIELD.to_string(), 1),
            ],
            true,
        )?
        .ok_or_else(|| StoreError::conflict(format!("counter {counter} could not be created")))?;
    let next = get_i64(&updated, COUNTER_FIELD)
        .ok_or_else(|| StoreError::conflict(format!("counter {counter} is not an integer")))?;
    Ok(next - 1)
}

/// One element collection of one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementScope {
    pub project: String,
    pub net_id: i64,
    pub kind: String,
}

impl ElementScope {
    pub fn new(project: impl Into<String>, net_id: i64, kind: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            net_id,
            kind: kind.into(),
        }
    }

    pub fn collection(&self) -> Result<CollectionId> {
        element_collection(&self.project, &self.kind)
    }

    fn network(&self) -> Filter {
        Filter::eq(NET_ID_FIELD, self.net_id)
    }

    fn layouts(&self) -> CollectionId {
        CollectionId::new(self.project.clone(), LAYOUTS_COLLECTION)
    }

    fn layout_key(&self) -> Filter {
        Filter::eq(ID_FIELD, format!("{}:{}", self.kind, self.net_id))
    }

    fn base_id(&self, index: i64) -> String {
        format!("base:{}:{index}", self.net_id)
    }

    fn change_id(&self, index: i64, variant: i64) -> String {
        format!("change:{}:{index}:{variant}", self.net_id)
    }

    fn addition_id(&self, index: i64) -> String {
        format!("addition:{}:{index}", self.net_id)
    }

    fn base_element(&self, index: i64) -> Filter {
        Filter::and([self.network(), base_clause(), Filter::eq(INDEX_FIELD, index)])
    }

    fn change_elements(&self, index: i64, variant: Option<i64>) -> Filter {
        Filter::and([
            self.network(),
            Filter::eq(VAR_TYPE_FIELD, VarType::Change.as_str()),
            Filter::eq(INDEX_FIELD, index),
            variant.map_or(Filter::All, |v| Filter::eq(VARIANT_FIELD, v)),
        ])
    }

    fn addition_element(&self, index: i64, variant: i64) -> Filter {
        Filter::and([
            self.network(),
            Filter::eq(VAR_TYPE_FIELD, VarType::Addition.as_str()),
            Filter::eq(VARIANT_FIELD, variant),
            Filter::eq(INDEX_FIELD, index),
        ])
    }
}

fn set_ops(fields: &Document) -> Vec<UpdateOp> {
    fields
        .iter()
        .map(|(name, value)| UpdateOp::Set(name.clone(), value.clone()))
        .collect()
}

fn tag(
    document: &mut Document,
    id: String,
    scope: &ElementScope,
    index: i64,
    overlay: &ElementVariant,
) {
    document.insert(ID_FIELD.to_string(), Value::String(id));
    document.insert(NET_ID_FIELD.to_string(), Value::from(scope.net_id));
    document.insert(INDEX_FIELD.to_string(), Value::from(index));
    overlay.apply_to(document);
}

pub struct ElementStore<'a> {
    backend: &'a dyn DocumentBackend,
    catalog: &'a SchemaCatalog,
    locks: LockManager<'a>,
    retry_budget: u32,
}

impl<'a> ElementStore<'a> {
    pub fn new(
        backend: &'a dyn DocumentBackend,
        catalog: &'a SchemaCatalog,
        config: &StoreConfig,
    ) -> Self {
        Self {
            backend,
            catalog,
            locks: LockManager::new(backend, config),
            retry_budget: config.addition_retry_budget,
        }
    }

    /// Schema every read and write of `scope` decodes and encodes with.
    ///
    /// The recorded layout carries the types of columns the catalog does not
    /// declare; catalog attributes missing from it keep their templates.
    pub fn schema(&self, scope: &ElementScope) -> Result<TableSchema> {
        let known = self.catalog.get(&scope.kind);
        let Some(layout) = self.backend.find_one(&scope.layouts(), &scope.layout_key())? else {
            return Ok(self.catalog.schema_or_empty(&scope.kind));
        };
        let specs: Vec<AttributeSpec> = match layout.get(LAYOUT_ATTRIBUTES_FIELD) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                BackendError::InvalidDocument(format!(
                    "layout of {} in net {}: {e}",
                    scope.kind, scope.net_id
                ))
            })?,
            None => Vec::new(),
        };
        let mut schema = TableSchema::from_specs(scope.kind.clone(), &specs, known);
        if let Some(known) = known {
            schema.extend_from(known);
        }
        Ok(schema)
    }

    fn record_layout(&self, scope: &ElementScope, schema: &TableSchema) -> Result<()> {
        let attributes = serde_json::to_value(schema.specs())
            .map_err(|e| BackendError::Serialize(e.to_string()))?;
        let mut layout = Document::new();
        layout.insert(
            ID_FIELD.to_string(),
            Value::String(format!("{}:{}", scope.kind, scope.net_id)),
        );
        layout.insert(NET_ID_FIELD.to_string(), Value::from(scope.net_id));
        layout.insert("kind".to_string(), Value::String(scope.kind.clone()));
        layout.insert(LAYOUT_ATTRIBUTES_FIELD.to_string(), attributes);
        self.backend
            .upsert(&scope.layouts(), &scope.layout_key(), layout)?;
        Ok(())
    }

    /// The scope's schema, extended by typed columns of `row` it lacks.
    fn schema_covering(&self, scope: &ElementScope, row: &Row) -> Result<TableSchema> {
        self.schema_covering_rows(scope, std::slice::from_ref(row))
    }

    fn schema_covering_rows(&self, scope: &ElementScope, rows: &[Row]) -> Result<TableSchema> {
        let mut schema = self.schema(scope)?;
        let mut extended = false;
        for (name, cell) in rows.iter().flatten() {
            if is_reserved(name) || schema.attribute(name).is_some() {
                continue;
            }
            if let Some(ty) = cell.attr_type() {
                schema.attributes.push(AttributeDef::missing(name.clone(), ty));
                extended = true;
            }
        }
        if extended {
            self.record_layout(scope, &schema)?;
        }
        Ok(schema)
    }

    /// Documents active in `context`, one per index, ordered by index.
    pub fn active_documents(
        &self,
        scope: &ElementScope,
        context: &VariantContext,
    ) -> Result<Vec<Document>> {
        let filter = Filter::and([scope.network(), build_filter(context)?]);
        let documents = self
            .backend
            .find(&scope.collection()?, &filter, &Projection::All)?;
        Ok(dedupe_by_index(documents))
    }

    pub fn read(&self, scope: &ElementScope, context: &VariantContext) -> Result<Table> {
        self.read_with_schema(scope, context, &self.schema(scope)?)
    }

    pub fn read_with_schema(
        &self,
        scope: &ElementScope,
        context: &VariantContext,
        schema: &TableSchema,
    ) -> Result<Table> {
        let documents = self.active_documents(scope, context)?;
        tracing::debug!(
            project = %scope.project,
            net_id = scope.net_id,
            kind = %scope.kind,
            rows = documents.len(),
            "read elements"
        );
        Ok(documents_to_table(&documents, schema)?)
    }

    /// Variant read narrowed by a predicate on stored attributes.
    ///
    /// The predicate is evaluated after overlay resolution, so a base row
    /// whose change no longer matches is not returned.
    pub fn read_filtered(
        &self,
        scope: &ElementScope,
        context: &VariantContext,
        predicate: &Filter,
    ) -> Result<Table> {
        let documents: Vec<Document> = self
            .active_documents(scope, context)?
            .into_iter()
            .filter(|doc| predicate.matches(doc))
            .collect();
        Ok(documents_to_table(&documents, &self.schema(scope)?)?)
    }

    fn active_element(
        &self,
        scope: &ElementScope,
        context: &VariantContext,
        index: i64,
    ) -> Result<Document> {
        self.active_documents(scope, context)?
            .into_iter()
            .find(|doc| get_i64(doc, INDEX_FIELD) == Some(index))
            .ok_or_else(|| {
                StoreError::not_found(format!(
                    "{} element {index} in net {}",
                    scope.kind, scope.net_id
                ))
            })
    }

    /// One attribute of one element as seen in `context`.
    pub fn get_value(
        &self,
        scope: &ElementScope,
        context: &VariantContext,
        index: i64,
        attribute: &str,
    ) -> Result<CellValue> {
        let document = self.active_element(scope, context, index)?;
        let schema = self.schema(scope)?;
        match (document.get(attribute), schema.attribute(attribute)) {
            (Some(value), Some(def)) => Ok(decode_cell(attribute, value, def.ty)?),
            (Some(value), None) if !is_reserved(attribute) => Ok(infer_cell(attribute, value)?),
            (None, Some(def)) => Ok(def.default.clone()),
            _ => Err(StoreError::not_found(format!(
                "attribute `{attribute}` of {} element {index}",
                scope.kind
            ))),
        }
    }

    fn max_index(&self, scope: &ElementScope) -> Result<Option<i64>> {
        let filter = Filter::and([
            scope.network(),
            Filter::ne(VAR_TYPE_FIELD, VarType::Change.as_str()),
        ]);
        Ok(self
            .backend
            .find(&scope.collection()?, &filter, &Projection::include([INDEX_FIELD]))?
            .iter()
            .filter_map(|doc| get_i64(doc, INDEX_FIELD))
            .max())
    }

    /// Replace every base row of the kind with the rows of `table`.
    ///
    /// Change and addition documents are untouched, and surviving indices
    /// keep their `not_in_var` suppressions. Returns the number of rows written.
    pub fn write_base(
        &self,
        scope: &ElementScope,
        table: &Table,
        access: &WriteAccess,
    ) -> Result<usize> {
        access.authorize(&self.locks, &scope.project, true)?;
        self.replace_base(scope, table)
    }

    pub(crate) fn replace_base(&self, scope: &ElementScope, table: &Table) -> Result<usize> {
        let collection = scope.collection()?;
        let schema = self.catalog.schema_for(table);
        let encoded = rows_to_documents(table, &schema)?;
        let mut layout = schema.clone();
        layout.extend_from(&self.schema(scope)?);

        let existing = self.backend.find(
            &collection,
            &Filter::and([scope.network(), Filter::ne(VAR_TYPE_FIELD, VarType::Change.as_str())]),
            &Projection::include([INDEX_FIELD, VAR_TYPE_FIELD, NOT_IN_VAR_FIELD, VARIANT_FIELD]),
        )?;
        let mut additions = BTreeSet::new();
        let mut suppressed: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for doc in &existing {
            let Some(index) = get_i64(doc, INDEX_FIELD) else {
                continue;
            };
            match ElementVariant::from_document(doc)? {
                ElementVariant::Base { not_in_var } => {
                    suppressed.insert(index, not_in_var);
                }
                ElementVariant::Addition { .. } => {
                    additions.insert(index);
                }
                ElementVariant::Change { .. } => {}
            }
        }
        if let Some(index) = table.indices().into_iter().find(|i| additions.contains(i)) {
            return Err(StoreError::conflict(format!(
                "{} index {index} is already used by a variant addition",
                scope.kind
            )));
        }

        let mut documents = Vec::with_capacity(encoded.len());
        for mut doc in encoded {
            let index = get_i64(&doc, INDEX_FIELD)
                .ok_or_else(|| StoreError::invalid("encoded row without index"))?;
            let overlay = ElementVariant::Base {
                not_in_var: suppressed.remove(&index).unwrap_or_default(),
            };
            tag(&mut doc, scope.base_id(index), scope, index, &overlay);
            documents.push(doc);
        }

        let removed = self
            .backend
            .delete(&collection, &Filter::and([scope.network(), base_clause()]))?;
        let written = self.backend.insert_many(&collection, documents)?;
        self.record_layout(scope, &layout)?;
        tracing::debug!(
            project = %scope.project,
            net_id = scope.net_id,
            kind = %scope.kind,
            removed,
            written,
            "replaced base rows"
        );
        Ok(written)
    }

    /// Record a variant-scoped change of one element.
    ///
    /// An existing change (or same-variant addition) is updated in place;
    /// otherwise a change document is created from the base row, filled
    /// from the default template, and the base row is suppressed in `variant`.
    pub fn write_change(
        &self,
        scope: &ElementScope,
        variant: i64,
        index: i64,
        partial: &Row,
        access: &WriteAccess,
    ) -> Result<()> {
        access.authorize(&self.locks, &scope.project, false)?;
        self.apply_change(scope, variant, index, partial)
    }

    fn apply_change(
        &self,
        scope: &ElementScope,
        variant: i64,
        index: i64,
        partial: &Row,
    ) -> Result<()> {
        let collection = scope.collection()?;
        let schema = self.schema_covering(scope, partial)?;
        let fields = encode_row(partial, &schema)?;
        let ops = set_ops(&fields);

        if self
            .backend
            .update_one(&collection, &scope.change_elements(index, Some(variant)), &ops, false)?
            .is_some()
        {
            self.suppress_base(scope, &collection, index, variant)?;
            tracing::debug!(kind = %scope.kind, index, variant, "updated change");
            return Ok(());
        }

        if self
            .backend
            .update_one(&collection, &scope.addition_element(index, variant), &ops, false)?
            .is_some()
        {
            tracing::debug!(kind = %scope.kind, index, variant, "updated addition");
            return Ok(());
        }

        let base = self
            .backend
            .find_one(&collection, &scope.base_element(index))?
            .ok_or_else(|| {
                StoreError::not_found(format!(
                    "{} element {index} has no base row and no addition in variant {variant}",
                    scope.kind
                ))
            })?;

        let mut document: Document = base
            .into_iter()
            .filter(|(name, _)| !is_reserved(name))
            .collect();
        for attr in &schema.attributes {
            document
                .entry(attr.name.clone())
                .or_insert_with(|| encode_cell(&attr.default));
        }
        document.extend(fields);
        tag(
            &mut document,
            scope.change_id(index, variant),
            scope,
            index,
            &ElementVariant::Change { variant },
        );

        match self.backend.insert(&collection, document) {
            Ok(()) => {}
            Err(err) if err.is_duplicate_key() => {
                self.backend.update_one(
                    &collection,
                    &scope.change_elements(index, Some(variant)),
                    &ops,
                    false,
                )?;
            }
            Err(err) => return Err(err.into()),
        }
        self.suppress_base(scope, &collection, index, variant)?;
        tracing::debug!(kind = %scope.kind, index, variant, "created change");
        Ok(())
    }

    fn suppress_base(
        &self,
        scope: &ElementScope,
        collection: &CollectionId,
        index: i64,
        variant: i64,
    ) -> Result<bool> {
        Ok(self
            .backend
            .update_one(
                collection,
                &scope.base_element(index),
                &[UpdateOp::AddToSet(NOT_IN_VAR_FIELD.to_string(), Value::from(variant))],
                false,
            )?
            .is_some())
    }

    /// Insert an element that exists only in `variant` and return its index.
    ///
    /// Indices come from a per-(kind, net) counter that never falls below
    /// the largest base or addition index, so additions of different
    /// variants never collide. A collision with a row written outside the
    /// counter is retried up to the configured budget.
    pub fn write_addition(
        &self,
        scope: &ElementScope,
        variant: i64,
        attributes: &Row,
        access: &WriteAccess,
    ) -> Result<i64> {
        access.authorize(&self.locks, &scope.project, false)?;
        let schema = self.schema_covering(scope, attributes)?;
        let fields = encode_row(&schema.complete_row(attributes), &schema)?;
        self.insert_addition(scope, variant, fields)
    }

    /// Insert several additions of `variant`, returning their indices in
    /// input order.
    ///
    /// Every row is encoded before the first insert, so an invalid row
    /// writes nothing. A failure part way keeps the additions already
    /// inserted.
    pub fn write_additions(
        &self,
        scope: &ElementScope,
        variant: i64,
        rows: &[Row],
        access: &WriteAccess,
    ) -> Result<Vec<i64>> {
        access.authorize(&self.locks, &scope.project, false)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.schema_covering_rows(scope, rows)?;
        let encoded = rows
            .iter()
            .map(|row| encode_row(&schema.complete_row(row), &schema))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut indices = Vec::with_capacity(encoded.len());
        for fields in encoded {
            indices.push(self.insert_addition(scope, variant, fields)?);
        }
        tracing::info!(
            project = %scope.project,
            net_id = scope.net_id,
            kind = %scope.kind,
            variant,
            count = indices.len(),
            "inserted additions"
        );
        Ok(indices)
    }

    fn insert_addition(&self, scope: &ElementScope, variant: i64, fields: Document) -> Result<i64> {
        let collection = scope.collection()?;
        let counter = format!("{}:{}", scope.kind, scope.net_id);

        for attempt in 1..=self.retry_budget {
            let floor = self.max_index(scope)?.map_or(0, |max| max + 1);
            let index = allocate_counter(self.backend, &scope.project, &counter, floor)?;
            let mut document = fields.clone();
            tag(
                &mut document,
                scope.addition_id(index),
                scope,
                index,
                &ElementVariant::Addition { variant },
            );
            if self.backend.count(&collection, &scope.base_element(index))? > 0 {
                tracing::warn!(kind = %scope.kind, index, attempt, "addition index taken by base row, retrying");
                continue;
            }
            match self.backend.insert(&collection, document) {
                Ok(()) => {
                    tracing::debug!(kind = %scope.kind, index, variant, "inserted addition");
                    return Ok(index);
                }
                Err(err) if err.is_duplicate_key() => {
                    tracing::warn!(kind = %scope.kind, index, attempt, "addition index collided, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::conflict(format!(
            "could not allocate a {} index after {} attempts",
            scope.kind, self.retry_budget
        )))
    }

    /// Delete an element as seen from `variant`.
    ///
    /// An addition of the variant is removed outright. A base row is kept and
    /// suppressed in the variant, dropping any change recorded for it there.
    pub fn delete(
        &self,
        scope: &ElementScope,
        variant: i64,
        index: i64,
        access: &WriteAccess,
    ) -> Result<()> {
        access.authorize(&self.locks, &scope.project, false)?;
        let collection = scope.collection()?;

        if self
            .backend
            .delete(&collection, &scope.addition_element(index, variant))?
            > 0
        {
            tracing::debug!(kind = %scope.kind, index, variant, "removed addition");
            return Ok(());
        }
        if self.suppress_base(scope, &collection, index, variant)? {
            self.backend
                .delete(&collection, &scope.change_elements(index, Some(variant)))?;
            tracing::debug!(kind = %scope.kind, index, variant, "suppressed base row");
            return Ok(());
        }
        Err(StoreError::not_found(format!(
            "{} element {index} does not exist in variant {variant}",
            scope.kind
        )))
    }

    /// Set attributes of a base row in place.
    pub fn update_base(
        &self,
        scope: &ElementScope,
        index: i64,
        partial: &Row,
        access: &WriteAccess,
    ) -> Result<()> {
        access.authorize(&self.locks, &scope.project, false)?;
        let fields = encode_row(partial, &self.schema_covering(scope, partial)?)?;
        self.backend
            .update_one(&scope.collection()?, &scope.base_element(index), &set_ops(&fields), false)?
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("{} base element {index}", scope.kind)))
    }

    /// Physically remove a base row together with its changes in every variant.
    pub fn delete_base(
        &self,
        scope: &ElementScope,
        index: i64,
        access: &WriteAccess,
    ) -> Result<()> {
        access.authorize(&self.locks, &scope.project, false)?;
        let collection = scope.collection()?;
        if self.backend.delete(&collection, &scope.base_element(index))? == 0 {
            return Err(StoreError::not_found(format!("{} base element {index}", scope.kind)));
        }
        let changes = self
            .backend
            .delete(&collection, &scope.change_elements(index, None))?;
        tracing::debug!(kind = %scope.kind, index, changes, "deleted base row");
        Ok(())
    }

    /// Compare-and-set update.
    ///
    /// Fails with `Conflict` unless every attribute in `expected` still has
    /// the given value in `context`. In a variant whose element is still the
    /// base row, the update is recorded as a change.
    pub fn update_checked(
        &self,
        scope: &ElementScope,
        context: &VariantContext,
        index: i64,
        expected: &Row,
        updates: &Row,
        access: &WriteAccess,
    ) -> Result<()> {
        let variant = context.single()?;
        access.authorize(&self.locks, &scope.project, false)?;
        let collection = scope.collection()?;
        let schema = self.schema(scope)?;
        let active = self.active_element(scope, context, index)?;
        let (_, current) = decode_document(&active, &schema, 0)?;

        let mut guards = Vec::with_capacity(expected.len() + 1);
        if let Some(id) = active.get(ID_FIELD) {
            guards.push(Filter::eq(ID_FIELD, id.clone()));
        }
        for (name, want) in expected {
            let want = match schema.attribute_type(name) {
                Some(ty) => coerce(name, want.clone(), ty)?,
                None => want.clone(),
            };
            let have = current.get(name).cloned().unwrap_or_default();
            if have != want {
                return Err(StoreError::conflict(format!(
                    "{} element {index}: `{name}` is {have:?}, expected {want:?}",
                    scope.kind
                )));
            }
            guards.push(if active.contains_key(name) {
                Filter::eq(name.clone(), encode_cell(&want))
            } else {
                Filter::exists(name.clone(), false)
            });
        }

        if let (Some(variant), ElementVariant::Base { .. }) =
            (variant, ElementVariant::from_document(&active)?)
        {
            return self.apply_change(scope, variant, index, updates);
        }

        let fields = encode_row(updates, &self.schema_covering(scope, updates)?)?;
        self.backend
            .update_one(&collection, &Filter::and(guards), &set_ops(&fields), false)?
            .map(|_| ())
            .ok_or_else(|| {
                StoreError::conflict(format!(
                    "{} element {index} changed during update",
                    scope.kind
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockRequest;
    use gridhub_doc::MemoryBackend;
    use gridhub_table::{Geometry, row};

    struct Fixture {
        backend: MemoryBackend,
        catalog: SchemaCatalog,
        config: StoreConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: MemoryBackend::new(),
                catalog: SchemaCatalog::power_grid(),
                config: StoreConfig::default(),
            }
        }

        fn store(&self) -> ElementStore<'_> {
            ElementStore::new(&self.backend, &self.catalog, &self.config)
        }

        fn lock(&self) -> WriteAccess {
            LockManager::new(&self.backend, &self.config)
                .acquire("p", &LockRequest::new("alice"))
                .expect("acquire");
            WriteAccess::holder("alice")
        }
    }

    fn buses(n: i64) -> Table {
        let mut table = Table::with_columns("bus", ["name", "vn_kv", "in_service"]);
        for index in 0..n {
            table.insert_row(
                index,
                row([
                    ("name", CellValue::Text(format!("Bus {index}"))),
                    ("vn_kv", CellValue::Float(20.0)),
                    ("in_service", CellValue::Bool(true)),
                ]),
            );
        }
        table
    }

    #[test]
    fn kinds_are_validated() {
        assert!(validate_kind("ext_grid").is_ok());
        assert!(validate_kind("Bus").is_err());
        assert!(validate_kind("../bus").is_err());
    }

    #[test]
    fn writes_require_the_project_lock() {
        let fx = Fixture::new();
        let store = fx.store();
        let scope = ElementScope::new("p", 1, "bus");
        let err = store
            .write_base(&scope, &buses(2), &WriteAccess::holder("alice"))
            .expect_err("no lock held");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);

        store
            .write_base(&scope, &buses(2), &WriteAccess::Administrative)
            .expect("administrative base replace");
        let err = store
            .write_change(&scope, 1, 0, &row([("vn_kv", 0.4)]), &WriteAccess::Administrative)
            .expect_err("administrative access does not cover changes");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
        let err = store
            .update_base(&scope, 0, &row([("vn_kv", 0.4)]), &WriteAccess::Administrative)
            .expect_err("administrative access does not cover base updates");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
        let err = store
            .delete_base(&scope, 1, &WriteAccess::Administrative)
            .expect_err("administrative access does not cover base deletes");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
        let err = store
            .update_checked(
                &scope,
                &VariantContext::BaseOnly,
                0,
                &row([("vn_kv", 20.0)]),
                &row([("vn_kv", 0.4)]),
                &WriteAccess::Administrative,
            )
            .expect_err("administrative access does not cover checked updates");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
        let base = store.read(&scope, &VariantContext::BaseOnly).expect("read");
        assert_eq!(base.get(0, "vn_kv"), Some(&CellValue::Float(20.0)));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn undeclared_columns_keep_their_written_types() {
        let fx = Fixture::new();
        let store = fx.store();
        let north = CellValue::Category("north".to_string());
        let scope = ElementScope::new("p", 1, "storage");
        let mut storage = Table::new("storage");
        storage.insert_row(
            0,
            row([("zone_tag", north.clone()), ("p_mw", CellValue::Float(1.5))]),
        );
        store
            .write_base(&scope, &storage, &WriteAccess::Administrative)
            .expect("base");

        let base = store.read(&scope, &VariantContext::BaseOnly).expect("read");
        assert_eq!(base.get(0, "zone_tag"), Some(&north));
        assert_eq!(
            store
                .get_value(&scope, &VariantContext::BaseOnly, 0, "zone_tag")
                .expect("value"),
            north
        );
        let filtered = store
            .read_filtered(&scope, &VariantContext::BaseOnly, &Filter::eq("zone_tag", "north"))
            .expect("filtered read");
        assert_eq!(filtered.get(0, "zone_tag"), Some(&north));

        let access = fx.lock();
        let dso = CellValue::Category("dso".to_string());
        store
            .write_change(&scope, 2, 0, &row([("owner", dso.clone())]), &access)
            .expect("change with a new column");
        let variant = store.read(&scope, &VariantContext::variant(2)).expect("read");
        assert_eq!(variant.get(0, "zone_tag"), Some(&north));
        assert_eq!(variant.get(0, "owner"), Some(&dso));

        let bus_scope = ElementScope::new("p", 1, "bus");
        let mut bus = buses(1);
        bus.set(0, "zone", CellValue::Category("a".to_string()));
        store.write_base(&bus_scope, &bus, &access).expect("bus base");
        let read = store.read(&bus_scope, &VariantContext::BaseOnly).expect("read");
        assert_eq!(read.get(0, "zone"), Some(&CellValue::Category("a".to_string())));
        assert_eq!(read.get(0, "name"), Some(&CellValue::Text("Bus 0".to_string())));
    }

    #[test]
    fn write_base_keeps_suppressions_of_surviving_rows() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(3), &access).expect("base");
        store
            .write_change(&scope, 4, 1, &row([("vn_kv", 0.4)]), &access)
            .expect("change");

        store.write_base(&scope, &buses(3), &access).expect("rewrite base");
        let view = store.read(&scope, &VariantContext::variant(4)).expect("read");
        assert_eq!(view.get(1, "vn_kv"), Some(&CellValue::Float(0.4)));
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn write_base_refuses_indices_taken_by_additions() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(2), &access).expect("base");
        let added = store
            .write_addition(&scope, 1, &row([("name", "X")]), &access)
            .expect("addition");
        assert_eq!(added, 2);
        let err = store.write_base(&scope, &buses(3), &access).expect_err("collides");
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[test]
    fn change_on_missing_element_is_not_found() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(2), &access).expect("base");
        let err = store
            .write_change(&scope, 1, 9, &row([("vn_kv", 0.4)]), &access)
            .expect_err("index 9 does not exist");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn second_change_overwrites_first() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(2), &access).expect("base");
        store
            .write_change(&scope, 1, 0, &row([("vn_kv", 0.4)]), &access)
            .expect("first change");
        store
            .write_change(&scope, 1, 0, &row([("name", "renamed")]), &access)
            .expect("second change");

        let changes = fx
            .backend
            .count(
                &scope.collection().expect("collection"),
                &Filter::eq(VAR_TYPE_FIELD, "change"),
            )
            .expect("count");
        assert_eq!(changes, 1);
        let view = store.read(&scope, &VariantContext::variant(1)).expect("read");
        assert_eq!(view.get(0, "vn_kv"), Some(&CellValue::Float(0.4)));
        assert_eq!(view.get(0, "name"), Some(&CellValue::Text("renamed".to_string())));
    }

    #[test]
    fn change_of_addition_updates_the_addition() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        let index = store
            .write_addition(&scope, 2, &row([("name", "new")]), &access)
            .expect("addition");
        store
            .write_change(&scope, 2, index, &row([("vn_kv", 110.0)]), &access)
            .expect("change addition");
        assert_eq!(
            store
                .get_value(&scope, &VariantContext::variant(2), index, "vn_kv")
                .expect("value"),
            CellValue::Float(110.0)
        );
        let err = store
            .write_change(&scope, 3, index, &row([("vn_kv", 1.0)]), &access)
            .expect_err("addition is invisible in variant 3");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn bulk_additions_share_one_encoding_pass() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(2), &access).expect("base");

        let indices = store
            .write_additions(
                &scope,
                4,
                &[row([("name", "a")]), row([("name", "b")]), row([("name", "c")])],
                &access,
            )
            .expect("additions");
        assert_eq!(indices, vec![2, 3, 4]);
        let variant = store.read(&scope, &VariantContext::variant(4)).expect("read");
        assert_eq!(variant.indices(), vec![0, 1, 2, 3, 4]);
        assert_eq!(variant.get(3, "name"), Some(&CellValue::Text("b".to_string())));
        assert_eq!(variant.get(3, "in_service"), Some(&CellValue::Bool(true)));

        let invalid = [
            row([("name", CellValue::Text("d".to_string()))]),
            row([("geo", CellValue::Geometry(Geometry::Point(vec![1.0])))]),
        ];
        assert!(store.write_additions(&scope, 4, &invalid, &access).is_err());
        let variant = store.read(&scope, &VariantContext::variant(4)).expect("read");
        assert_eq!(variant.len(), 5);

        assert!(store.write_additions(&scope, 4, &[], &access).expect("empty").is_empty());
        let err = store
            .write_additions(&scope, 4, &[row([("name", "e")])], &WriteAccess::Administrative)
            .expect_err("administrative access");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
    }

    #[test]
    fn delete_suppresses_base_and_removes_additions() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(3), &access).expect("base");
        let added = store
            .write_addition(&scope, 1, &row([("name", "X")]), &access)
            .expect("addition");

        store.delete(&scope, 1, 0, &access).expect("delete base row in variant");
        store.delete(&scope, 1, added, &access).expect("delete addition");

        let variant = store.read(&scope, &VariantContext::variant(1)).expect("read");
        assert_eq!(variant.indices(), vec![1, 2]);
        let base = store.read(&scope, &VariantContext::BaseOnly).expect("read");
        assert_eq!(base.indices(), vec![0, 1, 2]);

        let err = store.delete(&scope, 1, added, &access).expect_err("already gone");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn read_filtered_applies_after_overlay() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(3), &access).expect("base");
        store
            .write_change(&scope, 1, 2, &row([("vn_kv", 110.0)]), &access)
            .expect("change");

        let mv = store
            .read_filtered(&scope, &VariantContext::variant(1), &Filter::eq("vn_kv", 20.0))
            .expect("filtered read");
        assert_eq!(mv.indices(), vec![0, 1]);
        let base = store
            .read_filtered(&scope, &VariantContext::BaseOnly, &Filter::eq("vn_kv", 20.0))
            .expect("filtered read");
        assert_eq!(base.indices(), vec![0, 1, 2]);
    }

    #[test]
    fn update_checked_detects_stale_expectations() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(2), &access).expect("base");

        store
            .update_checked(
                &scope,
                &VariantContext::BaseOnly,
                0,
                &row([("vn_kv", 20.0)]),
                &row([("vn_kv", 10.0)]),
                &access,
            )
            .expect("expectation holds");
        let err = store
            .update_checked(
                &scope,
                &VariantContext::BaseOnly,
                0,
                &row([("vn_kv", 20.0)]),
                &row([("vn_kv", 5.0)]),
                &access,
            )
            .expect_err("value moved on");
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);

        store
            .update_checked(
                &scope,
                &VariantContext::variant(3),
                1,
                &row([("in_service", true)]),
                &row([("in_service", false)]),
                &access,
            )
            .expect("variant update becomes a change");
        let base = store.read(&scope, &VariantContext::BaseOnly).expect("read");
        assert_eq!(base.get(1, "in_service"), Some(&CellValue::Bool(true)));
        let variant = store.read(&scope, &VariantContext::variant(3)).expect("read");
        assert_eq!(variant.get(1, "in_service"), Some(&CellValue::Bool(false)));
    }

    #[test]
    fn update_and_delete_base_rows() {
        let fx = Fixture::new();
        let store = fx.store();
        let access = fx.lock();
        let scope = ElementScope::new("p", 1, "bus");
        store.write_base(&scope, &buses(2), &access).expect("base");
        store
            .write_change(&scope, 1, 1, &row([("vn_kv", 0.4)]), &access)
            .expect("change");

        store
            .update_base(&scope, 0, &row([("name", "Main")]), &access)
            .expect("update base");
        assert_eq!(
            store
                .get_value(&scope, &VariantContext::BaseOnly, 0, "name")
                .expect("value"),
            CellValue::Text("Main".to_string())
        );

        store.delete_base(&scope, 1, &access).expect("delete base");
        let variant = store.read(&scope, &VariantContext::variant(1)).expect("read");
        assert_eq!(variant.indices(), vec![0]);
        assert!(store.delete_base(&scope, 1, &access).is_err());
    }
}
