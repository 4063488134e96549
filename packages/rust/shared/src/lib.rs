//! Shared types, error model, and configuration for storysync.
//!
//! This crate is the foundation depended on by all other storysync crates.
//! It provides:
//! - [`StorySyncError`]: the unified error type
//! - Domain types ([`EntityId`], [`EntityDescriptor`], [`Unit`], [`EntityRecord`])
//! - The snapshot codec ([`Snapshot`])
//! - The source profile ([`SourceProfile`], [`FieldStrategy`])
//! - Configuration ([`AppConfig`], [`SyncConfig`], config loading)

pub mod config;
pub mod error;
pub mod profile;
pub mod snapshot;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiSinkConfig, AppConfig, FetchConfig, GitSinkConfig, ResolvedSink, RunPolicyConfig, Secret,
    SinkConfig, SinkKind, SourceConfig, StorageConfig, SyncConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, resolve_sink,
};
pub use error::{Result, StorySyncError};
pub use profile::{FieldStrategy, ListingOrder, SourceProfile};
pub use snapshot::Snapshot;
pub use types::{
    CatalogEntry, EntityDescriptor, EntityId, EntityRecord, EnumerationStrategy, UNKNOWN, Unit,
    UnitRef, normalize_name, slugify,
};
