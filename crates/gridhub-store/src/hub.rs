//! Caller-facing entry point.
//!
//! A [`Hub`] binds a backend, configuration and schema catalog to one
//! authenticated principal. [`Hub::project`] returns a [`ProjectHandle`] that
//! carries the project record as plain state: there is no process-wide
//! "active project", and every store call receives the project id explicitly.

use crate::access::WriteAccess;
use crate::config::StoreConfig;
use crate::element::{ElementScope, ElementStore};
use crate::error::{Result, StoreError};
use crate::lock::{LockManager, LockOutcome, LockRecord, LockRequest, ReleaseOutcome, RenewOutcome};
use crate::network::{
    LoadOptions, Network, NetworkEntry, NetworkStore, StoreNetworkRequest, SubnetRequest,
};
use crate::project::{
    PROJECT_FORMAT_VERSION, Permission, Principal, ProjectRecord, ProjectRegistry, ProjectRole,
};
use crate::timeseries::{
    BulkReadOptions, StoredTimeseries, Timeseries, TimeseriesQuery, TimeseriesStore,
    TimeseriesTarget, TimeseriesWrite,
};
use crate::variant_filter::VariantContext;
use crate::variant_registry::{VariantRecord, VariantRegistry, VariantUpdate};
use chrono::Utc;
use gridhub_doc::{Document, DocumentBackend, Filter, JsonlBackend};
use gridhub_table::{CellValue, Row, SchemaCatalog, Table};
use serde_json::{Map, Value};
use std::sync::Arc;

pub struct Hub {
    backend: Arc<dyn DocumentBackend>,
    config: StoreConfig,
    catalog: SchemaCatalog,
    principal: Principal,
}

impl Hub {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        config: StoreConfig,
        principal: Principal,
    ) -> Self {
        Self {
            backend,
            config,
            catalog: SchemaCatalog::power_grid(),
            principal,
        }
    }

    /// A hub over the JSONL backend rooted at `config.data_dir`.
    pub fn open_jsonl(config: StoreConfig, principal: Principal) -> Result<Self> {
        let backend = JsonlBackend::open(config.data_dir.clone())?;
        Ok(Self::new(Arc::new(backend), config, principal))
    }

    pub fn with_catalog(mut self, catalog: SchemaCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn DocumentBackend {
        self.backend.as_ref()
    }

    fn registry(&self) -> ProjectRegistry<'_> {
        ProjectRegistry::new(self.backend.as_ref())
    }

    pub fn create_project(&self, name: &str, realm: Option<&str>) -> Result<ProjectHandle<'_>> {
        let record = self.registry().create(name, realm, &self.principal)?;
        Ok(ProjectHandle { hub: self, record })
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        self.registry().list(&self.principal)
    }

    /// Open a project the principal can read, upgrading its layout if configured.
    pub fn project(&self, id: &str) -> Result<ProjectHandle<'_>> {
        let record = self.registry().get(id)?;
        self.open(record)
    }

    pub fn project_by_name(&self, name: &str, realm: Option<&str>) -> Result<ProjectHandle<'_>> {
        let record = self
            .registry()
            .find_by_name(name, realm)?
            .ok_or_else(|| StoreError::not_found(format!("project {name}")))?;
        self.open(record)
    }

    fn open(&self, record: ProjectRecord) -> Result<ProjectHandle<'_>> {
        record.check(&self.principal, Permission::Read)?;
        let record = if self.config.auto_upgrade_projects
            && self.may_upgrade(&record)?
            && self.registry().upgrade(&record.id)?.is_some()
        {
            self.registry().get(&record.id)?
        } else {
            record
        };
        Ok(ProjectHandle { hub: self, record })
    }

    /// An outdated layout is upgraded only by a writer, and only while no
    /// other user holds the project lock.
    fn may_upgrade(&self, record: &ProjectRecord) -> Result<bool> {
        if record.version >= PROJECT_FORMAT_VERSION {
            return Ok(false);
        }
        if !record.allows(&self.principal, Permission::Write) {
            tracing::debug!(
                project = %record.id,
                user = %self.principal.user,
                "upgrade skipped, read-only principal"
            );
            return Ok(false);
        }
        let lock = LockManager::new(self.backend.as_ref(), &self.config).status(&record.id)?;
        match lock {
            Some(lock) if lock.is_active(Utc::now()) && lock.holder != self.principal.user => {
                tracing::debug!(
                    project = %record.id,
                    holder = %lock.holder,
                    "upgrade skipped, project locked"
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Drop a project and all of its data. Requires user-management rights.
    pub fn delete_project(&self, id: &str, confirm: bool) -> Result<()> {
        let record = self.registry().get(id)?;
        record.check(&self.principal, Permission::UserManagement)?;
        self.registry().delete(id, confirm)
    }

    fn timeseries(&self) -> TimeseriesStore<'_> {
        TimeseriesStore::new(self.backend.as_ref(), &self.config)
    }

    /// Write a cross-project series. Superusers only.
    pub fn write_global_timeseries(
        &self,
        collection: Option<&str>,
        write: &TimeseriesWrite,
    ) -> Result<String> {
        if !self.principal.superuser {
            return Err(StoreError::denied("global timeseries are written by superusers"));
        }
        self.timeseries()
            .write(&TimeseriesTarget::Global, collection, write)
    }

    pub fn multi_read_global_timeseries(
        &self,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<Vec<StoredTimeseries>> {
        self.timeseries()
            .multi_read(&TimeseriesTarget::Global, collection, query)
    }
}

/// One opened project, acting as the hub's principal.
pub struct ProjectHandle<'h> {
    hub: &'h Hub,
    record: ProjectRecord,
}

impl<'h> ProjectHandle<'h> {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &ProjectRecord {
        &self.record
    }

    /// Reload the record, picking up changes made through other handles.
    pub fn refresh(&mut self) -> Result<()> {
        self.record = self.hub.registry().get(&self.record.id)?;
        Ok(())
    }

    fn require(&self, permission: Permission) -> Result<()> {
        self.record.check(&self.hub.principal, permission)
    }

    fn backend(&self) -> &'h dyn DocumentBackend {
        self.hub.backend.as_ref()
    }

    fn access(&self) -> WriteAccess {
        WriteAccess::holder(self.hub.principal.user.clone())
    }

    fn elements(&self) -> ElementStore<'h> {
        ElementStore::new(self.backend(), &self.hub.catalog, &self.hub.config)
    }

    fn networks(&self) -> NetworkStore<'h> {
        NetworkStore::new(self.backend(), &self.hub.catalog, &self.hub.config)
    }

    fn variants(&self) -> VariantRegistry<'h> {
        VariantRegistry::new(self.backend(), &self.hub.config)
    }

    fn locks(&self) -> LockManager<'h> {
        LockManager::new(self.backend(), &self.hub.config)
    }

    fn scope(&self, net_id: i64, kind: &str) -> ElementScope {
        ElementScope::new(self.record.id.clone(), net_id, kind)
    }

    // Lock

    pub fn acquire_lock(&self, ttl_seconds: Option<i64>) -> Result<LockOutcome> {
        self.require(Permission::Write)?;
        let mut request = LockRequest::new(self.hub.principal.user.clone());
        if let Some(ttl) = ttl_seconds {
            request = request.with_ttl(ttl);
        }
        self.locks().acquire(self.id(), &request)
    }

    pub fn release_lock(&self) -> Result<ReleaseOutcome> {
        self.locks().release(self.id(), &self.hub.principal.user)
    }

    pub fn renew_lock(&self, ttl_seconds: Option<i64>) -> Result<RenewOutcome> {
        let mut request = LockRequest::new(self.hub.principal.user.clone());
        if let Some(ttl) = ttl_seconds {
            request = request.with_ttl(ttl);
        }
        self.locks().renew(self.id(), &request)
    }

    pub fn lock_status(&self) -> Result<Option<LockRecord>> {
        self.require(Permission::Read)?;
        self.locks().status(self.id())
    }

    /// Break another holder's lock. Owners only.
    pub fn force_release_lock(&self) -> Result<bool> {
        self.require(Permission::UserManagement)?;
        self.locks().force_release(self.id())
    }

    // Elements

    pub fn read_elements(
        &self,
        net_id: i64,
        kind: &str,
        context: &VariantContext,
    ) -> Result<Table> {
        self.require(Permission::Read)?;
        self.elements().read(&self.scope(net_id, kind), context)
    }

    pub fn read_elements_where(
        &self,
        net_id: i64,
        kind: &str,
        context: &VariantContext,
        predicate: &Filter,
    ) -> Result<Table> {
        self.require(Permission::Read)?;
        self.elements()
            .read_filtered(&self.scope(net_id, kind), context, predicate)
    }

    pub fn get_value(
        &self,
        net_id: i64,
        kind: &str,
        context: &VariantContext,
        index: i64,
        attribute: &str,
    ) -> Result<CellValue> {
        self.require(Permission::Read)?;
        self.elements()
            .get_value(&self.scope(net_id, kind), context, index, attribute)
    }

    pub fn write_base(&self, net_id: i64, kind: &str, table: &Table) -> Result<usize> {
        self.require(Permission::Write)?;
        self.elements()
            .write_base(&self.scope(net_id, kind), table, &self.access())
    }

    /// Replace base rows without the project lock. Owners only.
    pub fn write_base_administrative(
        &self,
        net_id: i64,
        kind: &str,
        table: &Table,
    ) -> Result<usize> {
        self.require(Permission::UserManagement)?;
        self.elements()
            .write_base(&self.scope(net_id, kind), table, &WriteAccess::Administrative)
    }

    pub fn write_change(
        &self,
        net_id: i64,
        kind: &str,
        variant: i64,
        index: i64,
        partial: &Row,
    ) -> Result<()> {
        self.require(Permission::Write)?;
        self.elements()
            .write_change(&self.scope(net_id, kind), variant, index, partial, &self.access())
    }

    pub fn write_addition(
        &self,
        net_id: i64,
        kind: &str,
        variant: i64,
        attributes: &Row,
    ) -> Result<i64> {
        self.require(Permission::Write)?;
        self.elements()
            .write_addition(&self.scope(net_id, kind), variant, attributes, &self.access())
    }

    /// Bulk additions with standard-type parameters filled in.
    pub fn create_elements(
        &self,
        net_id: i64,
        kind: &str,
        variant: i64,
        rows: &[Row],
    ) -> Result<Vec<i64>> {
        self.require(Permission::Write)?;
        self.networks()
            .create_elements(self.id(), net_id, kind, variant, rows, &self.access())
    }

    pub fn delete_element(&self, net_id: i64, kind: &str, variant: i64, index: i64) -> Result<()> {
        self.require(Permission::Write)?;
        self.elements()
            .delete(&self.scope(net_id, kind), variant, index, &self.access())
    }

    pub fn update_base(&self, net_id: i64, kind: &str, index: i64, partial: &Row) -> Result<()> {
        self.require(Permission::Write)?;
        self.elements()
            .update_base(&self.scope(net_id, kind), index, partial, &self.access())
    }

    pub fn delete_base(&self, net_id: i64, kind: &str, index: i64) -> Result<()> {
        self.require(Permission::Write)?;
        self.elements()
            .delete_base(&self.scope(net_id, kind), index, &self.access())
    }

    pub fn update_checked(
        &self,
        net_id: i64,
        kind: &str,
        context: &VariantContext,
        index: i64,
        expected: &Row,
        updates: &Row,
    ) -> Result<()> {
        self.require(Permission::Write)?;
        self.elements().update_checked(
            &self.scope(net_id, kind),
            context,
            index,
            expected,
            updates,
            &self.access(),
        )
    }

    // Networks

    pub fn store_network(&self, network: &Network, request: &StoreNetworkRequest) -> Result<i64> {
        self.require(Permission::Write)?;
        self.networks()
            .store_network(self.id(), network, request, &self.access())
    }

    pub fn load_network(&self, net_id: i64, context: &VariantContext) -> Result<Network> {
        self.require(Permission::Read)?;
        self.networks().load_network(self.id(), net_id, context)
    }

    pub fn load_network_with(
        &self,
        net_id: i64,
        context: &VariantContext,
        options: &LoadOptions,
    ) -> Result<Network> {
        self.require(Permission::Read)?;
        self.networks()
            .load_network_with(self.id(), net_id, context, options)
    }

    pub fn load_subnet(
        &self,
        net_id: i64,
        context: &VariantContext,
        request: &SubnetRequest,
    ) -> Result<Network> {
        self.require(Permission::Read)?;
        self.networks().load_subnet(self.id(), net_id, context, request)
    }

    pub fn load_network_by_name(&self, name: &str, context: &VariantContext) -> Result<Network> {
        self.require(Permission::Read)?;
        self.networks().load_network_by_name(self.id(), name, context)
    }

    pub fn network_exists(&self, net_id: i64) -> Result<bool> {
        self.require(Permission::Read)?;
        self.networks().network_exists(self.id(), net_id)
    }

    pub fn list_networks(&self) -> Result<Vec<NetworkEntry>> {
        self.require(Permission::Read)?;
        self.networks().list_networks(self.id())
    }

    pub fn delete_network(&self, net_id: i64) -> Result<()> {
        self.require(Permission::Write)?;
        self.networks().delete_network(self.id(), net_id, &self.access())
    }

    // Variants

    pub fn create_variant(
        &self,
        net_id: i64,
        name: &str,
        description: &str,
    ) -> Result<VariantRecord> {
        self.require(Permission::Write)?;
        self.variants()
            .create_variant(self.id(), net_id, name, description, &self.access())
    }

    pub fn list_variants(&self, net_id: i64) -> Result<Vec<VariantRecord>> {
        self.require(Permission::Read)?;
        self.variants().list_variants(self.id(), net_id)
    }

    pub fn update_variant(
        &self,
        net_id: i64,
        index: i64,
        update: &VariantUpdate,
    ) -> Result<VariantRecord> {
        self.require(Permission::Write)?;
        self.variants()
            .update_variant(self.id(), net_id, index, update, &self.access())
    }

    pub fn delete_variant(&self, net_id: i64, index: i64) -> Result<()> {
        self.require(Permission::Write)?;
        self.variants()
            .delete_variant(self.id(), net_id, index, &self.access())
    }

    // Timeseries

    fn target(&self) -> TimeseriesTarget {
        TimeseriesTarget::Project(self.record.id.clone())
    }

    pub fn write_timeseries(
        &self,
        collection: Option<&str>,
        write: &TimeseriesWrite,
    ) -> Result<String> {
        self.require(Permission::Write)?;
        self.hub.timeseries().write(&self.target(), collection, write)
    }

    pub fn bulk_write_timeseries(
        &self,
        collection: Option<&str>,
        writes: &[TimeseriesWrite],
    ) -> Result<Vec<String>> {
        self.require(Permission::Write)?;
        self.hub
            .timeseries()
            .bulk_write(&self.target(), collection, writes)
    }

    pub fn read_timeseries(
        &self,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<StoredTimeseries> {
        self.require(Permission::Read)?;
        self.hub.timeseries().read(&self.target(), collection, query)
    }

    pub fn multi_read_timeseries(
        &self,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<Vec<StoredTimeseries>> {
        self.require(Permission::Read)?;
        self.hub
            .timeseries()
            .multi_read(&self.target(), collection, query)
    }

    pub fn bulk_read_timeseries(
        &self,
        collection: Option<&str>,
        query: &TimeseriesQuery,
        options: &BulkReadOptions,
    ) -> Result<Table> {
        self.require(Permission::Read)?;
        self.hub
            .timeseries()
            .bulk_read(&self.target(), collection, query, options)
    }

    pub fn update_timeseries(
        &self,
        collection: Option<&str>,
        id: &str,
        series: &Timeseries,
    ) -> Result<()> {
        self.require(Permission::Write)?;
        self.hub
            .timeseries()
            .update(&self.target(), collection, id, series)
    }

    pub fn bulk_update_timeseries(
        &self,
        collection: Option<&str>,
        updates: &[(String, Timeseries)],
    ) -> Result<usize> {
        self.require(Permission::Write)?;
        self.hub
            .timeseries()
            .bulk_update(&self.target(), collection, updates)
    }

    pub fn timeseries_metadata(
        &self,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<Vec<Document>> {
        self.require(Permission::Read)?;
        self.hub
            .timeseries()
            .metadata(&self.target(), collection, query)
    }

    pub fn delete_timeseries(
        &self,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<usize> {
        self.require(Permission::Write)?;
        self.hub
            .timeseries()
            .delete_many(&self.target(), collection, query)
    }

    // Project record

    pub fn rename(&mut self, name: &str) -> Result<()> {
        self.require(Permission::Write)?;
        self.record = self.hub.registry().rename(self.id(), name)?;
        Ok(())
    }

    pub fn set_setting(&mut self, key: &str, value: Value) -> Result<()> {
        self.require(Permission::Write)?;
        self.record = self.hub.registry().set_setting(self.id(), key, value)?;
        Ok(())
    }

    pub fn set_metadata(&mut self, values: Map<String, Value>, replace: bool) -> Result<()> {
        self.require(Permission::Write)?;
        self.record = self
            .hub
            .registry()
            .set_metadata(self.id(), values, replace)?;
        Ok(())
    }

    pub fn set_user_role(&mut self, user: &str, role: ProjectRole) -> Result<()> {
        self.require(Permission::UserManagement)?;
        self.record = self.hub.registry().set_user_role(self.id(), user, role)?;
        Ok(())
    }

    pub fn remove_user(&mut self, user: &str) -> Result<()> {
        self.require(Permission::UserManagement)?;
        self.record = self.hub.registry().remove_user(self.id(), user)?;
        Ok(())
    }
}
