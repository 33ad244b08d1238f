//! # gridhub-store
//!
//! Multi-project store for power-grid networks with a variant overlay.
//!
//! This crate provides:
//! - the variant filter builder and the per-kind `ElementStore`
//! - project locks (`LockManager`) gating every write
//! - whole-network load/store with format migrations (`NetworkStore`)
//! - declared variants (`VariantRegistry`) and projects (`ProjectRegistry`)
//! - compressed and inline timeseries (`TimeseriesStore`)
//! - `Hub` / `ProjectHandle`, the principal-bound entry point
//!
//! ## Layout
//!
//! ```text
//! _system/projects               project records
//! _system/locks                  one lock record per project
//! <project>/net_<kind>           element rows (base / change / addition)
//! <project>/_networks            network registry entries
//! <project>/_variants            declared variants
//! <project>/_counters            id and index counters
//! <project>/_layouts             attribute types per (kind, net)
//! <project>/<timeseries>         project timeseries
//! <global_database>/<timeseries> cross-project timeseries
//! ```

pub mod access;
pub mod config;
pub mod element;
pub mod error;
pub mod hub;
pub mod lock;
pub mod migrations;
pub mod network;
pub mod project;
pub mod timeseries;
pub mod variant_filter;
pub mod variant_registry;

pub use access::WriteAccess;
pub use config::{ConfigError, StoreConfig, UnknownVariantPolicy};
pub use element::{ElementScope, ElementStore, element_collection, stored_kinds, validate_kind};
pub use error::{ErrorKind, Result, StoreError};
pub use gridhub_doc::Filter;
pub use hub::{Hub, ProjectHandle};
pub use lock::{
    DEFAULT_LOCK_TTL_SECONDS, LockManager, LockOutcome, LockRecord, LockRequest,
    MAX_LOCK_TTL_SECONDS, MIN_LOCK_TTL_SECONDS, ReleaseOutcome, RenewOutcome,
};
pub use migrations::{NETWORK_FORMAT_VERSION, migrate};
pub use network::{
    LoadOptions, Network, NetworkEntry, NetworkStore, STD_TYPES_PARAMETER, StoreNetworkRequest,
    SubnetRequest,
};
pub use project::{
    PROJECT_FORMAT_VERSION, Permission, Principal, ProjectRecord, ProjectRegistry, ProjectRole,
};
pub use timeseries::{
    BulkReadOptions, SeriesValues, StoredTimeseries, TimeRange, Timeseries, TimeseriesQuery,
    TimeseriesStore, TimeseriesTarget, TimeseriesWrite, timeseries_id,
};
pub use variant_filter::{
    ElementVariant, VarType, VariantContext, base_clause, build_filter, dedupe_by_index,
};
pub use variant_registry::{VariantRecord, VariantRegistry, VariantUpdate};
