//! Whole-network load and store across element kinds.
//!
//! A stored network is a registry entry in the project collection
//! `_networks` plus the base rows of every kind in the element collections.
//! The entry is written last and removed first, so a listed network always
//! has its rows in place.

use crate::access::WriteAccess;
use crate::config::{StoreConfig, UnknownVariantPolicy};
use crate::element::{
    COUNTERS_COLLECTION, ElementScope, ElementStore, LAYOUTS_COLLECTION, NET_ID_FIELD,
    allocate_counter, element_collection, stored_kinds, validate_kind,
};
use crate::error::{Result, StoreError};
use crate::lock::LockManager;
use crate::migrations::{NETWORK_FORMAT_VERSION, migrate};
use crate::variant_registry::{VARIANTS_COLLECTION, VariantRegistry};
use crate::variant_filter::VariantContext;
use chrono::{SecondsFormat, Utc};
use gridhub_doc::{
    BackendError, CollectionId, Document, DocumentBackend, Filter, ID_FIELD, Projection, get_i64,
};
use gridhub_table::{
    AttributeSpec, CellValue, INDEX_FIELD, Row, SchemaCatalog, Table, TableSchema,
    documents_to_table, infer_cell,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const NETWORKS_COLLECTION: &str = "_networks";
const NETWORK_COUNTER: &str = "network";
/// Network parameter holding standard types as `{kind: {name: {attribute: value}}}`.
pub const STD_TYPES_PARAMETER: &str = "std_types";
const RESULT_PREFIX: &str = "res_";
const STD_TYPE_KINDS: &[&str] = &["line", "trafo", "trafo3w"];
const NODE_KINDS: &[&str] = &[
    "load", "sgen", "gen", "ext_grid", "shunt", "xward", "ward", "motor", "storage",
];
/// Branch kinds with the bus columns that connect them.
const BRANCH_KINDS: &[(&str, &[&str])] = &[
    ("line", &["from_bus", "to_bus"]),
    ("trafo", &["hv_bus", "lv_bus"]),
    ("trafo3w", &["hv_bus", "mv_bus", "lv_bus"]),
];
/// Switch element types that point at a branch kind.
const BRANCH_SWITCHES: &[(&str, &str)] = &[("l", "line"), ("t", "trafo"), ("t3", "trafo3w")];

/// A typed network snapshot: one table per element kind plus free-form
/// network-level parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Network {
    pub net_type: Option<String>,
    pub tables: BTreeMap<String, Table>,
    pub parameters: Map<String, Value>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table under its own kind, replacing any previous one.
    pub fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.kind.clone(), table);
    }

    pub fn table(&self, kind: &str) -> Option<&Table> {
        self.tables.get(kind)
    }
}

/// Registry entry describing one stored network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    #[serde(rename = "_id")]
    pub net_id: i64,
    pub name: String,
    #[serde(default)]
    pub net_type: Option<String>,
    pub kinds: Vec<String>,
    #[serde(default)]
    pub dtypes: BTreeMap<String, Vec<AttributeSpec>>,
    #[serde(default = "first_format")]
    pub format_version: u32,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub stored_at: String,
}

fn first_format() -> u32 {
    1
}

impl NetworkEntry {
    fn from_document(document: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(document))
            .map_err(|e| BackendError::InvalidDocument(format!("network entry: {e}")).into())
    }

    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(StoreError::invalid("network entry is not an object")),
            Err(e) => Err(BackendError::Serialize(e.to_string()).into()),
        }
    }
}

/// Which tables a network load materializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Load only these kinds. `None` loads every stored kind.
    pub only_tables: Option<BTreeSet<String>>,
    /// Load `res_*` result tables.
    pub include_results: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            only_tables: None,
            include_results: true,
        }
    }
}

impl LoadOptions {
    pub fn only<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_tables = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_results(mut self) -> Self {
        self.include_results = false;
        self
    }

    fn wants(&self, kind: &str) -> bool {
        if !self.include_results && kind.starts_with(RESULT_PREFIX) {
            return false;
        }
        self.only_tables
            .as_ref()
            .is_none_or(|only| only.contains(kind))
    }
}

/// A connected part of a network selected by its buses.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetRequest {
    /// Predicate on stored bus attributes.
    pub buses: Filter,
    /// Also take branches with only one end in the selection, together with
    /// the buses at their far end.
    pub add_edge_branches: bool,
    pub include_results: bool,
}

impl SubnetRequest {
    pub fn new(buses: Filter) -> Self {
        Self {
            buses,
            add_edge_branches: true,
            include_results: true,
        }
    }

    pub fn interior_only(mut self) -> Self {
        self.add_edge_branches = false;
        self
    }

    pub fn without_results(mut self) -> Self {
        self.include_results = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNetworkRequest {
    pub name: String,
    pub net_id: Option<i64>,
    /// Replace an existing network with the same name or id.
    pub overwrite: bool,
}

impl StoreNetworkRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            net_id: None,
            overwrite: false,
        }
    }

    pub fn with_net_id(mut self, net_id: i64) -> Self {
        self.net_id = Some(net_id);
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

pub struct NetworkStore<'a> {
    backend: &'a dyn DocumentBackend,
    catalog: &'a SchemaCatalog,
    elements: ElementStore<'a>,
    variants: VariantRegistry<'a>,
    locks: LockManager<'a>,
    unknown_variant: UnknownVariantPolicy,
}

impl<'a> NetworkStore<'a> {
    pub fn new(
        backend: &'a dyn DocumentBackend,
        catalog: &'a SchemaCatalog,
        config: &StoreConfig,
    ) -> Self {
        Self {
            backend,
            catalog,
            elements: ElementStore::new(backend, catalog, config),
            variants: VariantRegistry::new(backend, config),
            locks: LockManager::new(backend, config),
            unknown_variant: config.unknown_variant,
        }
    }

    fn collection(project: &str) -> CollectionId {
        CollectionId::new(project, NETWORKS_COLLECTION)
    }

    pub fn entry(&self, project: &str, net_id: i64) -> Result<Option<NetworkEntry>> {
        self.backend
            .find_one(&Self::collection(project), &Filter::eq(ID_FIELD, net_id))?
            .map(NetworkEntry::from_document)
            .transpose()
    }

    pub fn entry_by_name(&self, project: &str, name: &str) -> Result<Option<NetworkEntry>> {
        self.backend
            .find_one(&Self::collection(project), &Filter::eq("name", name))?
            .map(NetworkEntry::from_document)
            .transpose()
    }

    pub fn network_exists(&self, project: &str, net_id: i64) -> Result<bool> {
        Ok(self.backend.count(&Self::collection(project), &Filter::eq(ID_FIELD, net_id))? > 0)
    }

    /// Registry entries ordered by id.
    pub fn list_networks(&self, project: &str) -> Result<Vec<NetworkEntry>> {
        let mut entries = self
            .backend
            .find(&Self::collection(project), &Filter::All, &Projection::All)?
            .into_iter()
            .map(NetworkEntry::from_document)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.net_id);
        Ok(entries)
    }

    fn allocate_net_id(&self, project: &str) -> Result<i64> {
        let floor = self
            .backend
            .find(&Self::collection(project), &Filter::All, &Projection::include([ID_FIELD]))?
            .iter()
            .filter_map(|doc| get_i64(doc, ID_FIELD))
            .max()
            .map_or(0, |max| max + 1);
        allocate_counter(self.backend, project, NETWORK_COUNTER, floor)
    }

    /// Persist every table of `network` as base rows and register it.
    ///
    /// Requires the project lock. A failure after some kinds were written
    /// returns [`StoreError::PartialNetworkWrite`]; nothing is rolled back
    /// and the registry entry is not written.
    pub fn store_network(
        &self,
        project: &str,
        network: &Network,
        request: &StoreNetworkRequest,
        access: &WriteAccess,
    ) -> Result<i64> {
        access.authorize(&self.locks, project, false)?;
        if request.name.trim().is_empty() {
            return Err(StoreError::invalid("network name is required"));
        }
        for (kind, table) in &network.tables {
            validate_kind(kind)?;
            if &table.kind != kind {
                return Err(StoreError::invalid(format!(
                    "table of kind `{}` stored under `{kind}`",
                    table.kind
                )));
            }
        }

        let mut replaced = Vec::new();
        if let Some(existing) = self.entry_by_name(project, &request.name)? {
            replaced.push(existing.net_id);
        }
        if let Some(net_id) = request.net_id
            && self.network_exists(project, net_id)?
        {
            replaced.push(net_id);
        }
        if !replaced.is_empty() && !request.overwrite {
            return Err(StoreError::conflict(format!(
                "network {} already exists in project {project}",
                request.name
            )));
        }
        replaced.dedup();
        for net_id in replaced {
            self.remove_network(project, net_id)?;
        }

        let net_id = match request.net_id {
            Some(net_id) => net_id,
            None => self.allocate_net_id(project)?,
        };

        let mut written = Vec::new();
        let mut dtypes = BTreeMap::new();
        for (kind, table) in &network.tables {
            let scope = ElementScope::new(project, net_id, kind.clone());
            if let Err(source) = self.elements.replace_base(&scope, table) {
                tracing::warn!(project, net_id, kind = %kind, ?written, "network store failed part way");
                return Err(StoreError::PartialNetworkWrite {
                    net_id,
                    written,
                    failed: kind.clone(),
                    source: Box::new(source),
                });
            }
            dtypes.insert(kind.clone(), self.catalog.schema_for(table).specs());
            written.push(kind.clone());
        }

        let entry = NetworkEntry {
            net_id,
            name: request.name.clone(),
            net_type: network.net_type.clone(),
            kinds: written,
            dtypes,
            format_version: NETWORK_FORMAT_VERSION,
            data: network.parameters.clone(),
            stored_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        self.backend
            .insert(&Self::collection(project), entry.to_document()?)?;
        tracing::info!(project, net_id, name = %entry.name, kinds = entry.kinds.len(), "network stored");
        Ok(net_id)
    }

    /// Materialize a stored network as seen in `context`.
    ///
    /// A variant the network never declared reads as base-only unless the
    /// store is configured to reject it.
    pub fn load_network(
        &self,
        project: &str,
        net_id: i64,
        context: &VariantContext,
    ) -> Result<Network> {
        self.load_network_with(project, net_id, context, &LoadOptions::default())
    }

    pub fn load_network_with(
        &self,
        project: &str,
        net_id: i64,
        context: &VariantContext,
        options: &LoadOptions,
    ) -> Result<Network> {
        let entry = self.require_entry(project, net_id)?;
        self.load_entry(project, entry, context, options)
    }

    pub fn load_network_by_name(
        &self,
        project: &str,
        name: &str,
        context: &VariantContext,
    ) -> Result<Network> {
        let entry = self
            .entry_by_name(project, name)?
            .ok_or_else(|| StoreError::not_found(format!("network {name} in project {project}")))?;
        self.load_entry(project, entry, context, &LoadOptions::default())
    }

    fn require_entry(&self, project: &str, net_id: i64) -> Result<NetworkEntry> {
        self.entry(project, net_id)?
            .ok_or_else(|| StoreError::not_found(format!("network {net_id} in project {project}")))
    }

    fn resolve_context(
        &self,
        project: &str,
        net_id: i64,
        context: &VariantContext,
    ) -> Result<VariantContext> {
        let Some(variant) = context.single()? else {
            return Ok(VariantContext::BaseOnly);
        };
        if self.variants.variant_exists(project, net_id, variant)? {
            return Ok(VariantContext::variant(variant));
        }
        match self.unknown_variant {
            UnknownVariantPolicy::TreatAsBase => {
                tracing::warn!(project, net_id, variant, "unknown variant, reading base");
                Ok(VariantContext::BaseOnly)
            }
            UnknownVariantPolicy::Reject => Err(StoreError::not_found(format!(
                "variant {variant} of network {net_id}"
            ))),
        }
    }

    /// Stored `dtypes` first, then columns added by later element writes.
    fn entry_schema(&self, entry: &NetworkEntry, scope: &ElementScope) -> Result<TableSchema> {
        let kind = &scope.kind;
        let mut schema = match entry.dtypes.get(kind) {
            Some(specs) => TableSchema::from_specs(kind.clone(), specs, self.catalog.get(kind)),
            None => self.catalog.schema_or_empty(kind),
        };
        schema.extend_from(&self.elements.schema(scope)?);
        Ok(schema)
    }

    fn load_entry(
        &self,
        project: &str,
        entry: NetworkEntry,
        context: &VariantContext,
        options: &LoadOptions,
    ) -> Result<Network> {
        let context = self.resolve_context(project, entry.net_id, context)?;
        let mut network = Network {
            net_type: entry.net_type.clone(),
            tables: BTreeMap::new(),
            parameters: entry.data.clone(),
        };
        for kind in entry.kinds.iter().filter(|kind| options.wants(kind)) {
            let scope = ElementScope::new(project, entry.net_id, kind.clone());
            let schema = self.entry_schema(&entry, &scope)?;
            let table = self.elements.read_with_schema(&scope, &context, &schema)?;
            network.tables.insert(kind.clone(), table);
        }
        migrate_entry(project, &entry, &mut network);
        Ok(network)
    }

    /// Load the buses matching `request.buses` with everything attached to
    /// them.
    ///
    /// Branches are taken when all their buses are selected, or any of them
    /// with `add_edge_branches`. Switches follow the buses and branches they
    /// connect, single-bus elements follow their bus, and tables named after
    /// a loaded kind (`res_bus`, `line_geodata`) keep only the loaded
    /// indices. Other tables load whole. Kinds left empty are omitted.
    pub fn load_subnet(
        &self,
        project: &str,
        net_id: i64,
        context: &VariantContext,
        request: &SubnetRequest,
    ) -> Result<Network> {
        let entry = self.require_entry(project, net_id)?;
        let context = self.resolve_context(project, net_id, context)?;
        let stored: BTreeSet<&str> = entry.kinds.iter().map(String::as_str).collect();
        let read = |kind: &str, predicate: &Filter| -> Result<Table> {
            if !stored.contains(kind) {
                return Ok(Table::new(kind));
            }
            let scope = ElementScope::new(project, net_id, kind);
            let schema = self.entry_schema(&entry, &scope)?;
            let documents: Vec<Document> = self
                .elements
                .active_documents(&scope, &context)?
                .into_iter()
                .filter(|doc| predicate.matches(doc))
                .collect();
            Ok(documents_to_table(&documents, &schema)?)
        };

        let mut tables = BTreeMap::new();
        let mut bus = read("bus", &request.buses)?;
        let selected = bus.indices();
        let connect = |columns: &[&str]| {
            let clauses = columns
                .iter()
                .map(|column| Filter::is_in(*column, selected.iter().copied()));
            if request.add_edge_branches {
                Filter::or(clauses)
            } else {
                Filter::and(clauses)
            }
        };

        let mut far_buses = BTreeSet::new();
        for &(kind, columns) in BRANCH_KINDS {
            let table = read(kind, &connect(columns))?;
            for column in columns {
                far_buses.extend(table.column(column).into_iter().filter_map(CellValue::as_i64));
            }
            tables.insert(kind.to_string(), table);
        }
        let bus_switches = Filter::and([Filter::eq("et", "b"), connect(&["bus", "element"][..])]);
        let mut switch = read("switch", &bus_switches)?;
        far_buses.extend(switch.column("element").into_iter().filter_map(CellValue::as_i64));

        if request.add_edge_branches {
            let known: BTreeSet<i64> = selected.iter().copied().collect();
            let missing: Vec<i64> = far_buses.difference(&known).copied().collect();
            if !missing.is_empty() {
                let edge = read("bus", &Filter::is_in(INDEX_FIELD, missing))?;
                merge_rows(&mut bus, &edge);
            }
        }
        let buses = bus.indices();

        let branch_switches = BRANCH_SWITCHES.iter().map(|&(et, kind)| {
            let indices = tables.get(kind).map(Table::indices).unwrap_or_default();
            Filter::and([Filter::eq("et", et), Filter::is_in("element", indices)])
        });
        let attached = read("switch", &Filter::or(branch_switches))?;
        merge_rows(&mut switch, &attached);
        tables.insert("switch".to_string(), switch);
        tables.insert("bus".to_string(), bus);

        for &kind in NODE_KINDS {
            let table = read(kind, &Filter::is_in("bus", buses.iter().copied()))?;
            tables.insert(kind.to_string(), table);
        }

        for kind in &entry.kinds {
            if tables.contains_key(kind) {
                continue;
            }
            if !request.include_results && kind.starts_with(RESULT_PREFIX) {
                continue;
            }
            let table = match owning_kind(kind, &tables) {
                Some(owner) => {
                    let indices = tables.get(owner).map(Table::indices).unwrap_or_default();
                    read(kind.as_str(), &Filter::is_in(INDEX_FIELD, indices))?
                }
                None => read(kind.as_str(), &Filter::All)?,
            };
            tables.insert(kind.clone(), table);
        }
        tables.retain(|_, table| !table.is_empty());

        let mut network = Network {
            net_type: entry.net_type.clone(),
            tables,
            parameters: entry.data.clone(),
        };
        migrate_entry(project, &entry, &mut network);
        tracing::debug!(
            project,
            net_id,
            buses = buses.len(),
            kinds = network.tables.len(),
            "loaded subnet"
        );
        Ok(network)
    }

    /// Add elements of `kind` to `variant`, filling line and transformer
    /// parameters from the network's standard types.
    ///
    /// A row naming a `std_type` the network declares takes every parameter
    /// of that type, over the values the row carries.
    pub fn create_elements(
        &self,
        project: &str,
        net_id: i64,
        kind: &str,
        variant: i64,
        rows: &[Row],
        access: &WriteAccess,
    ) -> Result<Vec<i64>> {
        validate_kind(kind)?;
        let entry = self.require_entry(project, net_id)?;
        let mut filled = rows.to_vec();
        if STD_TYPE_KINDS.contains(&kind) {
            let std_types = entry
                .data
                .get(STD_TYPES_PARAMETER)
                .and_then(|types| types.get(kind))
                .and_then(Value::as_object);
            for row in &mut filled {
                apply_std_type(kind, row, std_types)?;
            }
        }
        let scope = ElementScope::new(project, net_id, kind);
        self.elements.write_additions(&scope, variant, &filled, access)
    }

    /// Delete a network with its elements, variants and counters.
    pub fn delete_network(&self, project: &str, net_id: i64, access: &WriteAccess) -> Result<()> {
        access.authorize(&self.locks, project, false)?;
        if !self.network_exists(project, net_id)? {
            return Err(StoreError::not_found(format!("network {net_id} in project {project}")));
        }
        self.remove_network(project, net_id)
    }

    fn remove_network(&self, project: &str, net_id: i64) -> Result<()> {
        self.backend
            .delete(&Self::collection(project), &Filter::eq(ID_FIELD, net_id))?;
        let mut counters = vec![Value::from(format!("variant:{net_id}"))];
        let mut elements = 0;
        for kind in stored_kinds(self.backend, project)? {
            elements += self.backend.delete(
                &element_collection(project, &kind)?,
                &Filter::eq(NET_ID_FIELD, net_id),
            )?;
            counters.push(Value::from(format!("{kind}:{net_id}")));
        }
        for collection in [VARIANTS_COLLECTION, LAYOUTS_COLLECTION] {
            self.backend.delete(
                &CollectionId::new(project, collection),
                &Filter::eq(NET_ID_FIELD, net_id),
            )?;
        }
        self.backend.delete(
            &CollectionId::new(project, COUNTERS_COLLECTION),
            &Filter::is_in(ID_FIELD, counters),
        )?;
        tracing::info!(project, net_id, elements, "network removed");
        Ok(())
    }
}

fn migrate_entry(project: &str, entry: &NetworkEntry, network: &mut Network) {
    if entry.format_version >= NETWORK_FORMAT_VERSION {
        return;
    }
    let steps = migrate(network, entry.format_version);
    tracing::info!(
        project,
        net_id = entry.net_id,
        from = entry.format_version,
        to = NETWORK_FORMAT_VERSION,
        steps,
        "migrated network on load"
    );
}

fn merge_rows(into: &mut Table, from: &Table) {
    for (index, row) in from.rows() {
        if into.row(index).is_none() {
            into.insert_row(index, row.clone());
        }
    }
}

/// The loaded kind whose indices `kind` is keyed by: `res_line` and
/// `line_geodata` belong to `line`.
fn owning_kind<'t>(kind: &str, tables: &'t BTreeMap<String, Table>) -> Option<&'t str> {
    let name = kind.strip_prefix(RESULT_PREFIX).unwrap_or(kind);
    tables.keys().map(String::as_str).find(|owner| {
        name == *owner
            || name
                .strip_prefix(*owner)
                .is_some_and(|rest| rest.starts_with('_'))
    })
}

fn apply_std_type(kind: &str, row: &mut Row, std_types: Option<&Map<String, Value>>) -> Result<()> {
    let name = match row.get("std_type") {
        Some(CellValue::Text(name)) => Some(name.clone()),
        _ => None,
    };
    if let Some(name) = name {
        match std_types.and_then(|types| types.get(&name)) {
            Some(Value::Object(parameters)) => {
                for (attribute, value) in parameters {
                    row.insert(attribute.clone(), infer_cell(attribute, value)?);
                }
            }
            Some(_) => {
                return Err(StoreError::invalid(format!(
                    "standard type {name} of {kind} is not an object"
                )));
            }
            None => {
                tracing::debug!(kind, std_type = %name, "standard type not declared by network");
            }
        }
    }
    if kind == "line" {
        row.entry("g_us_per_km".to_string())
            .or_insert(CellValue::Float(0.0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockRequest;
    use gridhub_doc::{MemoryBackend, UpdateOp};
    use gridhub_table::{CellValue, Geometry, row};

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

        fn store(&self) -> NetworkStore<'_> {
            NetworkStore::new(&self.backend, &self.catalog, &self.config)
        }

        fn lock(&self) -> WriteAccess {
            LockManager::new(&self.backend, &self.config)
                .acquire("p", &LockRequest::new("alice"))
                .expect("acquire");
            WriteAccess::holder("alice")
        }
    }

    fn sample_network() -> Network {
        let mut bus = Table::new("bus");
        for index in 0..3 {
            bus.insert_row(
                index,
                row([
                    ("name", CellValue::Text(format!("Bus {index}"))),
                    ("vn_kv", CellValue::Float(20.0)),
                ]),
            );
        }
        let mut line = Table::new("line");
        line.insert_row(
            0,
            row([
                ("from_bus", CellValue::Int(0)),
                ("to_bus", CellValue::Int(1)),
                ("length_km", CellValue::Float(1.2)),
            ]),
        );
        let mut network = Network::new();
        network.net_type = Some("power".to_string());
        network.insert_table(bus);
        network.insert_table(line);
        network
            .parameters
            .insert("f_hz".to_string(), Value::from(50.0));
        network
    }

    #[test]
    fn store_then_load_round_trips() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let net_id = store
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("store");
        assert_eq!(net_id, 0);

        let loaded = store
            .load_network("p", net_id, &VariantContext::BaseOnly)
            .expect("load");
        assert_eq!(loaded.net_type.as_deref(), Some("power"));
        assert_eq!(loaded.parameters["f_hz"], Value::from(50.0));
        let bus = loaded.table("bus").expect("bus table");
        assert_eq!(bus.indices(), vec![0, 1, 2]);
        assert_eq!(bus.get(1, "name"), Some(&CellValue::Text("Bus 1".to_string())));
        assert_eq!(bus.get(1, "in_service"), Some(&CellValue::Bool(true)));
        let line = loaded.table("line").expect("line table");
        assert_eq!(line.get(0, "g_us_per_km"), Some(&CellValue::Float(0.0)));

        let by_name = store
            .load_network_by_name("p", "grid", &VariantContext::BaseOnly)
            .expect("load by name");
        assert_eq!(by_name, loaded);
    }

    #[test]
    fn net_ids_are_allocated_sequentially() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let a = store
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("a"), &access)
            .expect("a");
        let b = store
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("b"), &access)
            .expect("b");
        assert_eq!((a, b), (0, 1));
        let names: Vec<String> = store
            .list_networks("p")
            .expect("list")
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn duplicate_name_requires_overwrite() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        store
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("first");
        let err = store
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect_err("duplicate");
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);

        let mut smaller = sample_network();
        smaller.tables.remove("line");
        let net_id = store
            .store_network("p", &smaller, &StoreNetworkRequest::new("grid").overwrite(), &access)
            .expect("overwrite");
        let entries = store.list_networks("p").expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].net_id, net_id);
        assert_eq!(entries[0].kinds, vec!["bus".to_string()]);
    }

    #[test]
    fn store_requires_the_lock() {
        let fx = Fixture::new();
        let err = fx
            .store()
            .store_network(
                "p",
                &sample_network(),
                &StoreNetworkRequest::new("grid"),
                &WriteAccess::holder("mallory"),
            )
            .expect_err("unlocked");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
    }

    #[test]
    fn missing_network_is_not_found() {
        let fx = Fixture::new();
        let err = fx
            .store()
            .load_network("p", 42, &VariantContext::BaseOnly)
            .expect_err("absent");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn unknown_variant_follows_policy() {
        let mut fx = Fixture::new();
        let access = fx.lock();
        let net_id = fx
            .store()
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("store");
        let lenient = fx
            .store()
            .load_network("p", net_id, &VariantContext::variant(9))
            .expect("treated as base");
        assert_eq!(lenient.table("bus").map(Table::len), Some(3));

        fx.config.unknown_variant = UnknownVariantPolicy::Reject;
        let err = fx
            .store()
            .load_network("p", net_id, &VariantContext::variant(9))
            .expect_err("rejected");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn partial_write_reports_written_kinds() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let mut network = sample_network();
        if let Some(line) = network.tables.get_mut("line") {
            line.set(0, "geo", CellValue::Geometry(Geometry::Point(vec![1.0])));
        }
        let err = store
            .store_network("p", &network, &StoreNetworkRequest::new("grid"), &access)
            .expect_err("invalid line geometry");
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        match err {
            StoreError::PartialNetworkWrite {
                written, failed, ..
            } => {
                assert_eq!(written, vec!["bus".to_string()]);
                assert_eq!(failed, "line");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(store.list_networks("p").expect("list").is_empty());
    }

    #[test]
    fn legacy_networks_migrate_on_load() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let mut network = Network::new();
        let mut gen_table = Table::new("gen");
        gen_table.insert_row(0, row([("p_mw", 10.0), ("qmax_mvar", 4.0)]));
        network.insert_table(gen_table);
        let net_id = store
            .store_network("p", &network, &StoreNetworkRequest::new("old"), &access)
            .expect("store");
        fx.backend
            .update_one(
                &CollectionId::new("p", NETWORKS_COLLECTION),
                &Filter::eq(ID_FIELD, net_id),
                &[UpdateOp::set("format_version", 1)],
                false,
            )
            .expect("mark legacy");

        let loaded = store
            .load_network("p", net_id, &VariantContext::BaseOnly)
            .expect("load");
        let gen_table = loaded.table("gen").expect("gen");
        assert!(!gen_table.has_column("qmax_mvar"));
        assert_eq!(gen_table.get(0, "max_q_mvar"), Some(&CellValue::Float(4.0)));
    }

    #[test]
    fn delete_network_removes_everything() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let net_id = store
            .store_network("p", &sample_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("store");
        store
            .variants
            .create_variant("p", net_id, "v", "", &access)
            .expect("variant");
        store.delete_network("p", net_id, &access).expect("delete");

        assert!(!store.network_exists("p", net_id).expect("exists"));
        assert!(stored_kinds(&fx.backend, "p").expect("kinds").is_empty());
        assert_eq!(
            fx.backend
                .count(&CollectionId::new("p", VARIANTS_COLLECTION), &Filter::All)
                .expect("count"),
            0
        );
        let err = store
            .delete_network("p", net_id, &access)
            .expect_err("second delete");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }
    fn int(value: i64) -> CellValue {
        CellValue::Int(value)
    }

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    fn indexed(kind: &str, rows: Vec<Row>) -> Table {
        let mut table = Table::new(kind);
        for (index, cells) in (0_i64..).zip(rows) {
            table.insert_row(index, cells);
        }
        table
    }

    /// Two zones of two buses each, joined by line 1.
    fn zoned_network() -> Network {
        let mut network = Network::new();
        network.insert_table(indexed(
            "bus",
            ["a", "a", "b", "b"]
                .into_iter()
                .map(|zone| row([("zone", text(zone)), ("vn_kv", CellValue::Float(20.0))]))
                .collect(),
        ));
        network.insert_table(indexed(
            "line",
            [(0, 1), (1, 2), (2, 3)]
                .into_iter()
                .map(|(from, to)| row([("from_bus", int(from)), ("to_bus", int(to))]))
                .collect(),
        ));
        network.insert_table(indexed(
            "load",
            vec![row([("bus", int(0))]), row([("bus", int(3))])],
        ));
        network.insert_table(indexed(
            "switch",
            vec![
                row([("bus", int(1)), ("element", int(1)), ("et", text("l"))]),
                row([("bus", int(3)), ("element", int(2)), ("et", text("l"))]),
                row([("bus", int(0)), ("element", int(1)), ("et", text("b"))]),
            ],
        ));
        network.insert_table(indexed(
            "res_bus",
            (0..4).map(|_| row([("vm_pu", CellValue::Float(1.0))])).collect(),
        ));
        network.insert_table(indexed(
            "res_line",
            (0..3).map(|_| row([("loading_percent", CellValue::Float(10.0))])).collect(),
        ));
        network.insert_table(indexed("cost", vec![row([("price", CellValue::Float(3.5))])]));
        network
    }

    #[test]
    fn load_options_select_tables() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let net_id = store
            .store_network("p", &zoned_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("store");

        let only = store
            .load_network_with(
                "p",
                net_id,
                &VariantContext::BaseOnly,
                &LoadOptions::default().only(["bus", "res_bus"]),
            )
            .expect("only bus");
        let kinds: Vec<&str> = only.tables.keys().map(String::as_str).collect();
        assert_eq!(kinds, vec!["bus", "res_bus"]);

        let no_results = store
            .load_network_with(
                "p",
                net_id,
                &VariantContext::BaseOnly,
                &LoadOptions::default().only(["bus", "res_bus"]).without_results(),
            )
            .expect("no results");
        let kinds: Vec<&str> = no_results.tables.keys().map(String::as_str).collect();
        assert_eq!(kinds, vec!["bus"]);
    }

    #[test]
    fn subnet_follows_edge_branches() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let net_id = store
            .store_network("p", &zoned_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("store");

        let subnet = store
            .load_subnet(
                "p",
                net_id,
                &VariantContext::BaseOnly,
                &SubnetRequest::new(Filter::eq("zone", "a")),
            )
            .expect("subnet");
        let indices = |kind: &str| subnet.table(kind).map(Table::indices).unwrap_or_default();
        assert_eq!(indices("bus"), vec![0, 1, 2]);
        assert_eq!(indices("line"), vec![0, 1]);
        assert_eq!(indices("switch"), vec![0, 2]);
        assert_eq!(indices("load"), vec![0]);
        assert_eq!(indices("res_bus"), vec![0, 1, 2]);
        assert_eq!(indices("res_line"), vec![0, 1]);
        assert_eq!(indices("cost"), vec![0]);
        assert!(subnet.table("trafo").is_none());
    }

    #[test]
    fn interior_subnet_keeps_only_enclosed_branches() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let net_id = store
            .store_network("p", &zoned_network(), &StoreNetworkRequest::new("grid"), &access)
            .expect("store");

        let subnet = store
            .load_subnet(
                "p",
                net_id,
                &VariantContext::BaseOnly,
                &SubnetRequest::new(Filter::eq("zone", "a"))
                    .interior_only()
                    .without_results(),
            )
            .expect("subnet");
        let indices = |kind: &str| subnet.table(kind).map(Table::indices).unwrap_or_default();
        assert_eq!(indices("bus"), vec![0, 1]);
        assert_eq!(indices("line"), vec![0]);
        assert_eq!(indices("switch"), vec![2]);
        assert!(subnet.table("res_bus").is_none());
        assert!(subnet.table("res_line").is_none());
    }

    #[test]
    fn created_lines_take_their_standard_type() {
        let fx = Fixture::new();
        let access = fx.lock();
        let store = fx.store();
        let mut network = sample_network();
        network.parameters.insert(
            STD_TYPES_PARAMETER.to_string(),
            serde_json::json!({
                "line": {"NA2XS2Y": {"r_ohm_per_km": 0.1, "x_ohm_per_km": 0.2, "max_i_ka": 0.4}}
            }),
        );
        let net_id = store
            .store_network("p", &network, &StoreNetworkRequest::new("grid"), &access)
            .expect("store");
        let variant = store
            .variants
            .create_variant("p", net_id, "v", "", &access)
            .expect("variant")
            .index;

        let created = store
            .create_elements(
                "p",
                net_id,
                "line",
                variant,
                &[
                    row([
                        ("std_type", text("NA2XS2Y")),
                        ("from_bus", int(1)),
                        ("to_bus", int(2)),
                        ("r_ohm_per_km", CellValue::Float(9.9)),
                    ]),
                    row([("std_type", text("custom")), ("r_ohm_per_km", CellValue::Float(0.7))]),
                ],
                &access,
            )
            .expect("create");
        assert_eq!(created, vec![1, 2]);

        let loaded = store
            .load_network("p", net_id, &VariantContext::variant(variant))
            .expect("load");
        let line = loaded.table("line").expect("line");
        assert_eq!(line.get(1, "r_ohm_per_km"), Some(&CellValue::Float(0.1)));
        assert_eq!(line.get(1, "max_i_ka"), Some(&CellValue::Float(0.4)));
        assert_eq!(line.get(1, "g_us_per_km"), Some(&CellValue::Float(0.0)));
        assert_eq!(line.get(2, "r_ohm_per_km"), Some(&CellValue::Float(0.7)));

        let err = store
            .create_elements("p", 99, "line", variant, &[Row::new()], &access)
            .expect_err("unknown network");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }
}
