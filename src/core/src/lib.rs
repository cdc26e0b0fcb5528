//! imirror Core - Foundational Types
//!
//! Catalog, version ordering, error taxonomy, configuration, retry policy
//! and the work model shared by the runtime and the CLI.

pub mod catalog;
pub mod config;
pub mod date;
pub mod error;
pub mod retry;
pub mod version;
pub mod work;

// Re-export commonly used types
pub use catalog::{
    default_catalog, Architecture, CatalogFilters, Component, FilterPolicy, TagFilter, TagRule,
};
pub use config::{ExportConfig, MirrorConfig, PathsConfig, RegistryConfig, RetryConfig};
pub use error::{MirrorError, PullFailure, Result};
pub use retry::RetryPolicy;
pub use version::Version;
pub use work::{
    ItemState, Outcome, Report, ReportEntry, ResolvedVersion, VersionRecord, WorkItem, WorkKey,
};

/// imirror version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
