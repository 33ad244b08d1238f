//! Project registry, membership and layout upgrades.
//!
//! Project records live in `_system/projects`; each project's data lives in
//! its own database named by the project id.

use crate::element::ELEMENT_COLLECTION_PREFIX;
use crate::error::{Result, StoreError};
use crate::lock::LOCKS_COLLECTION;
use chrono::{SecondsFormat, Utc};
use gridhub_doc::{
    CollectionId, Document, DocumentBackend, Filter, ID_FIELD, Projection, UpdateOp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const PROJECTS_COLLECTION: &str = "projects";
/// Version 1 stored element collections without the `net_` prefix.
pub const PROJECT_FORMAT_VERSION: u32 = 2;

/// The already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user: String,
    #[serde(default)]
    pub superuser: bool,
}

impl Principal {
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            superuser: false,
        }
    }

    pub fn superuser(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            superuser: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    UserManagement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRole {
    Owner,
    Developer,
    Guest,
}

impl ProjectRole {
    pub fn grants(self, permission: Permission) -> bool {
        match self {
            ProjectRole::Owner => true,
            ProjectRole::Developer => !matches!(permission, Permission::UserManagement),
            ProjectRole::Guest => matches!(permission, Permission::Read),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(default)]
    pub users: BTreeMap<String, ProjectRole>,
    pub created_at: String,
}

fn legacy_version() -> u32 {
    1
}

impl ProjectRecord {
    pub fn role_of(&self, user: &str) -> Option<ProjectRole> {
        self.users.get(user).copied()
    }

    pub fn allows(&self, principal: &Principal, permission: Permission) -> bool {
        principal.superuser
            || self
                .role_of(&principal.user)
                .is_some_and(|role| role.grants(permission))
    }

    pub fn check(&self, principal: &Principal, permission: Permission) -> Result<()> {
        if self.allows(principal, permission) {
            Ok(())
        } else {
            Err(StoreError::denied(format!(
                "{} lacks {permission:?} permission on project {}",
                principal.user, self.name
            )))
        }
    }

    fn from_document(document: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(document)).map_err(|e| {
            gridhub_doc::BackendError::InvalidDocument(format!("project record: {e}")).into()
        })
    }

    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(StoreError::invalid("project record did not serialize to an object")),
            Err(e) => Err(gridhub_doc::BackendError::Serialize(e.to_string()).into()),
        }
    }
}

pub struct ProjectRegistry<'a> {
    backend: &'a dyn DocumentBackend,
}

impl<'a> ProjectRegistry<'a> {
    pub fn new(backend: &'a dyn DocumentBackend) -> Self {
        Self { backend }
    }

    fn collection() -> CollectionId {
        CollectionId::system(PROJECTS_COLLECTION)
    }

    fn by_name(name: &str, realm: Option<&str>) -> Filter {
        Filter::and([
            Filter::eq("name", name),
            Filter::eq("realm", realm.map_or(Value::Null, Value::from)),
        ])
    }

    /// Create a project owned by `owner`. Names are unique within a realm.
    pub fn create(
        &self,
        name: &str,
        realm: Option<&str>,
        owner: &Principal,
    ) -> Result<ProjectRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::invalid("project name is required"));
        }
        if self.find_by_name(name, realm)?.is_some() {
            return Err(StoreError::conflict(format!(
                "project {name} already exists{}",
                realm.map(|r| format!(" in realm {r}")).unwrap_or_default()
            )));
        }
        let record = ProjectRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            realm: realm.map(str::to_string),
            settings: Map::new(),
            metadata: Map::new(),
            version: PROJECT_FORMAT_VERSION,
            users: BTreeMap::from([(owner.user.clone(), ProjectRole::Owner)]),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        self.backend.insert(&Self::collection(), record.to_document()?)?;
        tracing::info!(project = %record.id, name, "project created");
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<ProjectRecord> {
        self.backend
            .find_one(&Self::collection(), &Filter::eq(ID_FIELD, id))?
            .map(ProjectRecord::from_document)
            .transpose()?
            .ok_or_else(|| StoreError::not_found(format!("project {id}")))
    }

    pub fn find_by_name(&self, name: &str, realm: Option<&str>) -> Result<Option<ProjectRecord>> {
        self.backend
            .find_one(&Self::collection(), &Self::by_name(name, realm))?
            .map(ProjectRecord::from_document)
            .transpose()
    }

    /// Projects the principal may read.
    pub fn list(&self, principal: &Principal) -> Result<Vec<ProjectRecord>> {
        let records = self
            .backend
            .find(&Self::collection(), &Filter::All, &Projection::All)?
            .into_iter()
            .map(ProjectRecord::from_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(records
            .into_iter()
            .filter(|record| record.allows(principal, Permission::Read))
            .collect())
    }

    fn update(&self, id: &str, ops: &[UpdateOp]) -> Result<ProjectRecord> {
        self.backend
            .update_one(&Self::collection(), &Filter::eq(ID_FIELD, id), ops, false)?
            .map(ProjectRecord::from_document)
            .transpose()?
            .ok_or_else(|| StoreError::not_found(format!("project {id}")))
    }

    pub fn rename(&self, id: &str, new_name: &str) -> Result<ProjectRecord> {
        let current = self.get(id)?;
        if let Some(existing) = self.find_by_name(new_name, current.realm.as_deref())?
            && existing.id != id
        {
            return Err(StoreError::conflict(format!("project {new_name} already exists")));
        }
        self.update(id, &[UpdateOp::set("name", new_name)])
    }

    /// Drop the project database, its lock and its record.
    pub fn delete(&self, id: &str, confirm: bool) -> Result<()> {
        if !confirm {
            return Err(StoreError::invalid(
                "deleting a project drops all of its data; pass confirmation to proceed",
            ));
        }
        let record = self.get(id)?;
        self.backend.drop_database(&record.id)?;
        self.backend.delete(
            &CollectionId::system(LOCKS_COLLECTION),
            &Filter::eq(ID_FIELD, id),
        )?;
        self.backend
            .delete(&Self::collection(), &Filter::eq(ID_FIELD, id))?;
        tracing::info!(project = %id, name = %record.name, "project deleted");
        Ok(())
    }

    pub fn set_setting(&self, id: &str, key: &str, value: Value) -> Result<ProjectRecord> {
        let mut settings = self.get(id)?.settings;
        settings.insert(key.to_string(), value);
        self.update(id, &[UpdateOp::set("settings", settings)])
    }

    pub fn merge_settings(&self, id: &str, values: Map<String, Value>) -> Result<ProjectRecord> {
        let mut settings = self.get(id)?.settings;
        settings.extend(values);
        self.update(id, &[UpdateOp::set("settings", settings)])
    }

    /// Merge `values` into the metadata, or replace it wholesale.
    pub fn set_metadata(
        &self,
        id: &str,
        values: Map<String, Value>,
        replace: bool,
    ) -> Result<ProjectRecord> {
        let metadata = if replace {
            values
        } else {
            let mut metadata = self.get(id)?.metadata;
            metadata.extend(values);
            metadata
        };
        self.update(id, &[UpdateOp::set("metadata", metadata)])
    }

    pub fn set_user_role(&self, id: &str, user: &str, role: ProjectRole) -> Result<ProjectRecord> {
        let mut users = self.get(id)?.users;
        users.insert(user.to_string(), role);
        self.write_users(id, users)
    }

    /// Remove a member. The last owner cannot be removed.
    pub fn remove_user(&self, id: &str, user: &str) -> Result<ProjectRecord> {
        let mut users = self.get(id)?.users;
        if users.remove(user).is_none() {
            return Err(StoreError::not_found(format!("user {user} in project {id}")));
        }
        if !users.values().any(|role| *role == ProjectRole::Owner) {
            return Err(StoreError::conflict(format!(
                "removing {user} would leave project {id} without an owner"
            )));
        }
        self.write_users(id, users)
    }

    fn write_users(&self, id: &str, users: BTreeMap<String, ProjectRole>) -> Result<ProjectRecord> {
        let value = serde_json::to_value(users)
            .map_err(|e| gridhub_doc::BackendError::Serialize(e.to_string()))?;
        self.update(id, &[UpdateOp::set("users", value)])
    }

    /// Bring an old project layout up to [`PROJECT_FORMAT_VERSION`].
    ///
    /// Returns the version upgraded from, or `None` if already current.
    pub fn upgrade(&self, id: &str) -> Result<Option<u32>> {
        let record = self.get(id)?;
        if record.version >= PROJECT_FORMAT_VERSION {
            return Ok(None);
        }
        for name in self.backend.list_collections(&record.id)? {
            if name.starts_with(ELEMENT_COLLECTION_PREFIX) || name.starts_with('_') {
                continue;
            }
            let collection = CollectionId::new(record.id.clone(), name.clone());
            let Some(sample) = self.backend.find_one(&collection, &Filter::All)? else {
                continue;
            };
            if !(sample.contains_key("net_id") && sample.contains_key("index")) {
                continue;
            }
            let target = format!("{ELEMENT_COLLECTION_PREFIX}{name}");
            self.backend.rename_collection(&collection, &target)?;
            tracing::info!(project = %record.id, from = %name, to = %target, "renamed element collection");
        }
        self.update(id, &[UpdateOp::set("version", PROJECT_FORMAT_VERSION)])?;
        tracing::info!(
            project = %record.id,
            from = record.version,
            to = PROJECT_FORMAT_VERSION,
            "project upgraded"
        );
        Ok(Some(record.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridhub_doc::MemoryBackend;
    use serde_json::json;

    #[test]
    fn names_are_unique_per_realm() {
        let backend = MemoryBackend::new();
        let registry = ProjectRegistry::new(&backend);
        let alice = Principal::user("alice");
        registry.create("grid", None, &alice).expect("first");
        let err = registry.create("grid", None, &alice).expect_err("duplicate");
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        registry
            .create("grid", Some("utility-a"), &alice)
            .expect("same name, other realm");
    }

    #[test]
    fn list_only_returns_readable_projects() {
        let backend = MemoryBackend::new();
        let registry = ProjectRegistry::new(&backend);
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");
        let shared = registry.create("shared", None, &alice).expect("create");
        registry.create("private", None, &alice).expect("create");
        registry
            .set_user_role(&shared.id, "bob", ProjectRole::Guest)
            .expect("add guest");

        let visible: Vec<String> = registry
            .list(&bob)
            .expect("list")
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(visible, vec!["shared".to_string()]);
        assert_eq!(registry.list(&Principal::superuser("root")).expect("list").len(), 2);
    }

    #[test]
    fn roles_grant_expected_permissions() {
        assert!(ProjectRole::Owner.grants(Permission::UserManagement));
        assert!(ProjectRole::Developer.grants(Permission::Write));
        assert!(!ProjectRole::Developer.grants(Permission::UserManagement));
        assert!(!ProjectRole::Guest.grants(Permission::Write));
    }

    #[test]
    fn delete_requires_confirmation_and_drops_data() {
        let backend = MemoryBackend::new();
        let registry = ProjectRegistry::new(&backend);
        let record = registry
            .create("doomed", None, &Principal::user("alice"))
            .expect("create");
        let data = CollectionId::new(record.id.clone(), "net_bus");
        backend
            .insert(&data, json!({"_id": 1}).as_object().cloned().expect("object"))
            .expect("insert");

        let err = registry.delete(&record.id, false).expect_err("unconfirmed");
        assert_eq!(err.kind(), crate::ErrorKind::InvalidRequest);
        registry.delete(&record.id, true).expect("delete");
        assert_eq!(backend.count(&data, &Filter::All).expect("count"), 0);
        assert_eq!(registry.get(&record.id).expect_err("gone").kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn settings_and_metadata_merge() {
        let backend = MemoryBackend::new();
        let registry = ProjectRegistry::new(&backend);
        let record = registry
            .create("p", None, &Principal::user("alice"))
            .expect("create");
        registry
            .set_setting(&record.id, "theme", json!("dark"))
            .expect("setting");
        let updated = registry
            .merge_settings(&record.id, Map::from_iter([("units".to_string(), json!("si"))]))
            .expect("merge");
        assert_eq!(Value::Object(updated.settings), json!({"theme": "dark", "units": "si"}));

        registry
            .set_metadata(&record.id, Map::from_iter([("a".to_string(), json!(1))]), false)
            .expect("metadata");
        let replaced = registry
            .set_metadata(&record.id, Map::from_iter([("b".to_string(), json!(2))]), true)
            .expect("replace");
        assert_eq!(Value::Object(replaced.metadata), json!({"b": 2}));
    }

    #[test]
    fn last_owner_cannot_be_removed() {
        let backend = MemoryBackend::new();
        let registry = ProjectRegistry::new(&backend);
        let record = registry
            .create("p", None, &Principal::user("alice"))
            .expect("create");
        let err = registry.remove_user(&record.id, "alice").expect_err("sole owner");
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[test]
    fn upgrade_prefixes_legacy_element_collections() {
        let backend = MemoryBackend::new();
        let registry = ProjectRegistry::new(&backend);
        let record = registry
            .create("legacy", None, &Principal::user("alice"))
            .expect("create");
        backend
            .update_one(
                &CollectionId::system(PROJECTS_COLLECTION),
                &Filter::eq(ID_FIELD, record.id.clone()),
                &[UpdateOp::set("version", 1)],
                false,
            )
            .expect("downgrade");
        let legacy = CollectionId::new(record.id.clone(), "bus");
        backend
            .insert(
                &legacy,
                json!({"_id": "b0", "net_id": 1, "index": 0}).as_object().cloned().expect("object"),
            )
            .expect("insert");
        let other = CollectionId::new(record.id.clone(), "timeseries");
        backend
            .insert(
                &other,
                json!({"_id": "t0", "data_type": "p_mw"}).as_object().cloned().expect("object"),
            )
            .expect("insert");

        assert_eq!(registry.upgrade(&record.id).expect("upgrade"), Some(1));
        assert_eq!(
            backend.list_collections(&record.id).expect("list"),
            vec!["net_bus".to_string(), "timeseries".to_string()]
        );
        assert_eq!(registry.upgrade(&record.id).expect("second upgrade"), None);
    }
}
