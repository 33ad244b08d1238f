//! Write authorization against the project lock.

use crate::error::{Result, StoreError};
use crate::lock::LockManager;
use chrono::Utc;

/// How a write is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAccess {
    /// The caller claims to hold the project lock; verified on every write.
    Locked { holder: String },
    /// Escape hatch for base-table maintenance without a lock.
    Administrative,
}

impl WriteAccess {
    pub fn holder(holder: impl Into<String>) -> Self {
        Self::Locked {
            holder: holder.into(),
        }
    }

    pub(crate) fn authorize(
        &self,
        locks: &LockManager<'_>,
        project: &str,
        administrative_allowed: bool,
    ) -> Result<()> {
        match self {
            WriteAccess::Locked { holder } => locks.require_held(project, holder, Utc::now()),
            WriteAccess::Administrative if administrative_allowed => {
                tracing::debug!(project, "administrative write without project lock");
                Ok(())
            }
            WriteAccess::Administrative => Err(StoreError::denied(
                "administrative access only covers base table replacement",
            )),
        }
    }
}
