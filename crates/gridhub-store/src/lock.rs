//! Advisory project locks.
//!
//! One lock record per project in `_system/locks`. A record past its expiry
//! is treated as absent: the next acquirer takes it over with a
//! compare-and-set on the stale record, so two acquirers racing for an
//! expired lock cannot both win.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use gridhub_doc::{CollectionId, Document, DocumentBackend, Filter, ID_FIELD, UpdateOp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOCKS_COLLECTION: &str = "locks";
pub const DEFAULT_LOCK_TTL_SECONDS: i64 = 3600;
pub const MIN_LOCK_TTL_SECONDS: i64 = 30;
pub const MAX_LOCK_TTL_SECONDS: i64 = 86_400;

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(rename = "_id")]
    pub project: String,
    pub holder: String,
    pub acquired_at: String,
    pub renewed_at: String,
    /// `None` when the lock never expires.
    pub expires_at: Option<String>,
}

impl LockRecord {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match &self.expires_at {
            None => true,
            Some(_) => self.expires_at().is_some_and(|expiry| expiry > now),
        }
    }

    fn from_document(document: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(document)).map_err(|e| {
            StoreError::from(gridhub_doc::BackendError::InvalidDocument(format!(
                "lock record: {e}"
            )))
        })
    }

    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(StoreError::invalid("lock record did not serialize to an object")),
            Err(e) => Err(gridhub_doc::BackendError::Serialize(e.to_string()).into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub holder: String,
    /// Overrides the configured TTL; `Some(0)` requests a non-expiring lock.
    pub ttl_seconds: Option<i64>,
    pub now: DateTime<Utc>,
}

impl LockRequest {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            ttl_seconds: None,
            now: Utc::now(),
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(LockRecord),
    /// The caller already held the lock; its expiry was refreshed.
    AlreadyHeld(LockRecord),
    Denied { holder: String },
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LockOutcome::Denied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The caller did not hold the lock; `holder` is the current one, if any.
    Denied { holder: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed(LockRecord),
    Denied { holder: Option<String> },
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct LockManager<'a> {
    backend: &'a dyn DocumentBackend,
    ttl_seconds: i64,
}

impl<'a> LockManager<'a> {
    pub fn new(backend: &'a dyn DocumentBackend, config: &StoreConfig) -> Self {
        Self {
            backend,
            ttl_seconds: config.lock_ttl_seconds,
        }
    }

    fn collection() -> CollectionId {
        CollectionId::system(LOCKS_COLLECTION)
    }

    fn expiry(&self, request: &LockRequest) -> Result<Option<String>> {
        let ttl = request.ttl_seconds.unwrap_or(self.ttl_seconds);
        if ttl == 0 {
            return Ok(None);
        }
        if !(MIN_LOCK_TTL_SECONDS..=MAX_LOCK_TTL_SECONDS).contains(&ttl) {
            return Err(StoreError::invalid(format!(
                "lock ttl must be 0 or in range [{MIN_LOCK_TTL_SECONDS}, {MAX_LOCK_TTL_SECONDS}] (got {ttl})"
            )));
        }
        let expires = request
            .now
            .checked_add_signed(Duration::seconds(ttl))
            .ok_or_else(|| StoreError::invalid("lock ttl overflowed timestamp range"))?;
        Ok(Some(timestamp(expires)))
    }

    fn validate_holder(holder: &str) -> Result<&str> {
        let holder = holder.trim();
        if holder.is_empty() {
            return Err(StoreError::invalid("lock holder is required"));
        }
        Ok(holder)
    }

    /// The current record, active or not.
    pub fn status(&self, project: &str) -> Result<Option<LockRecord>> {
        self.backend
            .find_one(&Self::collection(), &Filter::eq(ID_FIELD, project))?
            .map(LockRecord::from_document)
            .transpose()
    }

    /// Acquire the project lock for `request.holder`.
    pub fn acquire(&self, project: &str, request: &LockRequest) -> Result<LockOutcome> {
        let holder = Self::validate_holder(&request.holder)?;
        let expires_at = self.expiry(request)?;
        let now = timestamp(request.now);

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self.status(project)? {
                None => {
                    let record = LockRecord {
                        project: project.to_string(),
                        holder: holder.to_string(),
                        acquired_at: now.clone(),
                        renewed_at: now.clone(),
                        expires_at: expires_at.clone(),
                    };
                    match self.backend.insert(&Self::collection(), record.to_document()?) {
                        Ok(()) => {
                            tracing::info!(project, holder, "project lock acquired");
                            return Ok(LockOutcome::Acquired(record));
                        }
                        Err(err) if err.is_duplicate_key() => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(record) if record.holder == holder => {
                    let updated = self.backend.update_one(
                        &Self::collection(),
                        &Filter::and([Filter::eq(ID_FIELD, project), Filter::eq("holder", holder)]),
                        &[
                            UpdateOp::set("renewed_at", now.clone()),
                            UpdateOp::set("expires_at", expires_at.clone()),
                        ],
                        false,
                    )?;
                    match updated {
                        Some(doc) => {
                            tracing::debug!(project, holder, "project lock re-acquired");
                            return Ok(LockOutcome::AlreadyHeld(LockRecord::from_document(doc)?));
                        }
                        None => continue,
                    }
                }
                Some(record) if record.is_active(request.now) => {
                    return Ok(LockOutcome::Denied {
                        holder: record.holder,
                    });
                }
                Some(stale) => {
                    let taken = self.backend.update_one(
                        &Self::collection(),
                        &Filter::and([
                            Filter::eq(ID_FIELD, project),
                            Filter::eq("holder", stale.holder.clone()),
                            Filter::eq("acquired_at", stale.acquired_at.clone()),
                        ]),
                        &[
                            UpdateOp::set("holder", holder),
                            UpdateOp::set("acquired_at", now.clone()),
                            UpdateOp::set("renewed_at", now.clone()),
                            UpdateOp::set("expires_at", expires_at.clone()),
                        ],
                        false,
                    )?;
                    match taken {
                        Some(doc) => {
                            tracing::warn!(
                                project,
                                holder,
                                previous = %stale.holder,
                                "took over expired project lock"
                            );
                            return Ok(LockOutcome::Acquired(LockRecord::from_document(doc)?));
                        }
                        None => continue,
                    }
                }
            }
        }

        match self.status(project)? {
            Some(record) if record.holder != holder => Ok(LockOutcome::Denied {
                holder: record.holder,
            }),
            _ => Err(StoreError::conflict(format!(
                "lock for project {project} changed during every acquisition attempt"
            ))),
        }
    }

    /// Release the lock if `holder` holds it.
    pub fn release(&self, project: &str, holder: &str) -> Result<ReleaseOutcome> {
        let holder = Self::validate_holder(holder)?;
        let removed = self.backend.delete(
            &Self::collection(),
            &Filter::and([Filter::eq(ID_FIELD, project), Filter::eq("holder", holder)]),
        )?;
        if removed > 0 {
            tracing::info!(project, holder, "project lock released");
            return Ok(ReleaseOutcome::Released);
        }
        let current = self.status(project)?.map(|record| record.holder);
        tracing::debug!(project, holder, current = ?current, "release denied");
        Ok(ReleaseOutcome::Denied { holder: current })
    }

    /// Extend the expiry of a lock still recorded for `request.holder`.
    pub fn renew(&self, project: &str, request: &LockRequest) -> Result<RenewOutcome> {
        let holder = Self::validate_holder(&request.holder)?;
        let expires_at = self.expiry(request)?;
        let renewed = self.backend.update_one(
            &Self::collection(),
            &Filter::and([Filter::eq(ID_FIELD, project), Filter::eq("holder", holder)]),
            &[
                UpdateOp::set("renewed_at", timestamp(request.now)),
                UpdateOp::set("expires_at", expires_at),
            ],
            false,
        )?;
        match renewed {
            Some(doc) => Ok(RenewOutcome::Renewed(LockRecord::from_document(doc)?)),
            None => Ok(RenewOutcome::Denied {
                holder: self.status(project)?.map(|record| record.holder),
            }),
        }
    }

    /// Fail with `Denied` unless `holder` holds an active lock on `project`.
    pub fn require_held(&self, project: &str, holder: &str, now: DateTime<Utc>) -> Result<()> {
        match self.status(project)? {
            Some(record) if record.holder == holder && record.is_active(now) => Ok(()),
            Some(record) if record.holder == holder => Err(StoreError::denied(format!(
                "lock on project {project} held by {holder} has expired"
            ))),
            Some(record) if record.is_active(now) => Err(StoreError::denied(format!(
                "project {project} is locked by {}",
                record.holder
            ))),
            _ => Err(StoreError::denied(format!(
                "project {project} must be locked by {holder} before writing"
            ))),
        }
    }

    /// Remove the lock regardless of holder. Returns whether one existed.
    pub fn force_release(&self, project: &str) -> Result<bool> {
        let removed = self
            .backend
            .delete(&Self::collection(), &Filter::eq(ID_FIELD, project))?;
        if removed > 0 {
            tracing::warn!(project, "project lock force-released");
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridhub_doc::MemoryBackend;

    fn manager(backend: &MemoryBackend) -> LockManager<'_> {
        LockManager::new(backend, &StoreConfig::default())
    }

    #[test]
    fn reacquire_by_holder_is_idempotent() {
        let backend = MemoryBackend::new();
        let locks = manager(&backend);
        let first = locks.acquire("p", &LockRequest::new("alice")).expect("acquire");
        assert!(matches!(first, LockOutcome::Acquired(_)));
        let second = locks.acquire("p", &LockRequest::new("alice")).expect("re-acquire");
        assert!(matches!(second, LockOutcome::AlreadyHeld(_)));
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let backend = MemoryBackend::new();
        let locks = manager(&backend);
        let t0 = Utc::now();
        locks
            .acquire("p", &LockRequest::new("alice").with_ttl(60).at(t0))
            .expect("acquire");

        let early = locks
            .acquire("p", &LockRequest::new("bob").at(t0 + Duration::seconds(30)))
            .expect("attempt");
        assert_eq!(early, LockOutcome::Denied { holder: "alice".to_string() });

        let late = locks
            .acquire("p", &LockRequest::new("bob").at(t0 + Duration::seconds(61)))
            .expect("takeover");
        match late {
            LockOutcome::Acquired(record) => assert_eq!(record.holder, "bob"),
            other => panic!("expected takeover, got {other:?}"),
        }
    }

    #[test]
    fn release_by_other_holder_is_denied_not_fatal() {
        let backend = MemoryBackend::new();
        let locks = manager(&backend);
        locks.acquire("p", &LockRequest::new("alice")).expect("acquire");
        assert_eq!(
            locks.release("p", "bob").expect("release attempt"),
            ReleaseOutcome::Denied { holder: Some("alice".to_string()) }
        );
        assert_eq!(locks.release("p", "alice").expect("release"), ReleaseOutcome::Released);
        assert_eq!(
            locks.release("p", "alice").expect("second release"),
            ReleaseOutcome::Denied { holder: None }
        );
    }

    #[test]
    fn renew_extends_expiry_for_holder_only() {
        let backend = MemoryBackend::new();
        let locks = manager(&backend);
        let t0 = Utc::now();
        locks
            .acquire("p", &LockRequest::new("alice").with_ttl(60).at(t0))
            .expect("acquire");
        let renewed = locks
            .renew("p", &LockRequest::new("alice").with_ttl(600).at(t0 + Duration::seconds(50)))
            .expect("renew");
        let RenewOutcome::Renewed(record) = renewed else {
            panic!("holder should renew");
        };
        assert!(record.is_active(t0 + Duration::seconds(120)));

        let denied = locks.renew("p", &LockRequest::new("bob")).expect("renew attempt");
        assert_eq!(denied, RenewOutcome::Denied { holder: Some("alice".to_string()) });
    }

    #[test]
    fn zero_ttl_never_expires_and_bad_ttl_is_rejected() {
        let backend = MemoryBackend::new();
        let locks = manager(&backend);
        let t0 = Utc::now();
        let LockOutcome::Acquired(record) = locks
            .acquire("p", &LockRequest::new("alice").with_ttl(0).at(t0))
            .expect("acquire")
        else {
            panic!("fresh lock should be acquired");
        };
        assert!(record.is_active(t0 + Duration::days(365)));

        let err = locks
            .acquire("q", &LockRequest::new("alice").with_ttl(5))
            .expect_err("ttl below minimum");
        assert_eq!(err.kind(), crate::ErrorKind::InvalidRequest);
    }

    #[test]
    fn require_held_distinguishes_holders() {
        let backend = MemoryBackend::new();
        let locks = manager(&backend);
        let now = Utc::now();
        assert!(locks.require_held("p", "alice", now).is_err());
        locks.acquire("p", &LockRequest::new("alice").at(now)).expect("acquire");
        locks.require_held("p", "alice", now).expect("alice holds the lock");
        let err = locks.require_held("p", "bob", now).expect_err("bob does not");
        assert_eq!(err.kind(), crate::ErrorKind::Denied);
    }
}
