//! imirror Runtime - Resolution and Export Pipeline
//!
//! Lists registry tags, resolves the latest qualifying version per
//! component and architecture, plans exports against recorded versions,
//! and pulls and archives the images under a bounded worker pool.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod coordinator;
pub mod export;
pub mod oci;
pub mod pipeline;
pub mod planner;
pub mod registry;
pub mod report;
pub mod retry;
pub mod store;

// Re-export common types
pub use archive::{archive_file_name, verify_archive, ArchivePathResolver};
pub use coordinator::ExportCoordinator;
pub use export::{ExportWorker, Exported};
pub use oci::{ImageReference, ImageSource, OciImageSource, PulledImage};
pub use pipeline::{Pipeline, ResolutionFailure, RunContext, RunSummary};
pub use planner::{Resolved, UpdatePlanner};
pub use registry::{HubTagSource, RegistryClient, RemoteTag, TagPage, TagSource};
pub use store::{
    FileProgressStore, FileVersionStore, LastKnown, MemoryProgressStore, MemoryVersionStore,
    ProgressStore, VersionStore,
};

/// imirror runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
