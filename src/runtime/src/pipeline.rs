//! Run facade: resolve → plan → export.
//!
//! Everything a run needs travels in a [`RunContext`]; there is no global
//! run state, so tests substitute in-memory stores and fake sources.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use imirror_core::catalog::CatalogFilters;
use imirror_core::config::MirrorConfig;
use imirror_core::error::{MirrorError, Result};
use imirror_core::retry::RetryPolicy;
use imirror_core::work::{Report, WorkItem};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchivePathResolver;
use crate::coordinator::ExportCoordinator;
use crate::export::ExportWorker;
use crate::oci::{ImageSource, OciImageSource};
use crate::planner::{Resolved, UpdatePlanner};
use crate::registry::{HubTagSource, RegistryClient, TagSource};
use crate::report;
use crate::store::{FileProgressStore, FileVersionStore, ProgressStore, VersionStore};

/// Handles and settings for one run.
pub struct RunContext {
    pub date: NaiveDate,
    pub config: MirrorConfig,
    pub versions: Arc<dyn VersionStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub tags: Arc<dyn TagSource>,
    pub images: Arc<dyn ImageSource>,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Production wiring: file stores under the data directory, Docker Hub
    /// tag listing and OCI pulls.
    ///
    /// Validates the configuration and prepares the output root; failures
    /// here are the fatal startup errors.
    pub fn from_config(config: MirrorConfig, date: NaiveDate) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.export.output_dir).map_err(|e| {
            MirrorError::ConfigError(format!(
                "output root {} is not usable: {}",
                config.export.output_dir.display(),
                e
            ))
        })?;

        let versions = Arc::new(FileVersionStore::new(config.paths.versions_dir()));
        let progress = Arc::new(FileProgressStore::new(config.paths.state_file()));
        let tags = Arc::new(HubTagSource::new(&config.registry)?);

        Ok(Self {
            date,
            config,
            versions,
            progress,
            tags,
            images: Arc::new(OciImageSource::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_tags(mut self, tags: Arc<dyn TagSource>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_images(mut self, images: Arc<dyn ImageSource>) -> Self {
        self.images = images;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.retry)
    }

    fn path_resolver(&self) -> ArchivePathResolver {
        ArchivePathResolver::new(
            self.config.export.output_dir.clone(),
            self.config.export.overwrite,
        )
    }
}

/// A component whose latest version could not be determined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionFailure {
    pub component: String,
    pub kind: String,
    pub message: String,
}

impl ResolutionFailure {
    fn new(component: &str, error: &MirrorError) -> Self {
        Self {
            component: component.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    /// Failures that make the run unsuccessful. A policy that matches no
    /// tag is not one of them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind.as_str(), "NoMatchingTag" | "Cancelled")
    }
}

/// Result of a run or a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub date: NaiveDate,
    /// Variants resolved across all components
    pub resolved: usize,
    pub resolution_failures: Vec<ResolutionFailure>,
    /// Work items in planning order
    pub planned: Vec<WorkItem>,
    /// Empty for a dry run
    pub report: Report,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.report.has_failures() || self.resolution_failures.iter().any(|f| f.is_fatal())
    }

    /// 1 when anything failed, 130 when interrupted, else 0.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else if self.interrupted {
            130
        } else {
            0
        }
    }
}

/// Drives a run over a [`RunContext`].
pub struct Pipeline {
    ctx: RunContext,
}

impl Pipeline {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Resolve every catalog component, at most `registry.concurrency` at a
    /// time. One component's failure never affects another.
    async fn resolve(&self) -> (Resolved, Vec<ResolutionFailure>) {
        let registry = RegistryClient::new(
            Arc::clone(&self.ctx.tags),
            self.ctx.retry_policy(),
            self.ctx.cancel.clone(),
        )
        .with_max_pages(self.ctx.config.registry.max_pages);
        let registry = &registry;

        let results: Vec<_> = stream::iter(&self.ctx.config.components)
            .map(|component| async move { (component, registry.resolve_latest(component).await) })
            .buffer_unordered(self.ctx.config.registry.concurrency.max(1))
            .collect()
            .await;

        let mut resolved = Resolved::new();
        let mut failures = Vec::new();
        for (component, result) in results {
            match result {
                Ok(versions) => {
                    for version in versions {
                        resolved.insert((version.track(), version.arch), version);
                    }
                }
                Err(e @ MirrorError::NoMatchingTag { .. }) => {
                    tracing::warn!(component = %component.name, error = %e, "No qualifying tag");
                    failures.push(ResolutionFailure::new(&component.name, &e));
                }
                Err(e) => {
                    tracing::error!(component = %component.name, error = %e, "Version resolution failed");
                    failures.push(ResolutionFailure::new(&component.name, &e));
                }
            }
        }

        // Catalog order keeps reports stable regardless of completion order
        let position = |name: &str| {
            self.ctx
                .config
                .components
                .iter()
                .position(|c| c.name == name)
        };
        failures.sort_by_key(|f| position(&f.component));

        (resolved, failures)
    }

    /// Resolve, write the latest list, plan and write the update list.
    async fn prepare(&self) -> Result<(Resolved, Vec<ResolutionFailure>, Vec<WorkItem>)> {
        let ctx = &self.ctx;
        let versions_dir = ctx.config.paths.versions_dir();
        let catalog = &ctx.config.components;

        let (resolved, failures) = self.resolve().await;
        report::write_latest(&versions_dir, ctx.date, catalog, &resolved)?;

        let last_known = ctx.versions.latest_known()?;
        let path_resolver = ctx.path_resolver();
        let planned = UpdatePlanner::new(catalog, &path_resolver, ctx.date).plan(&resolved, &last_known)?;
        report::write_update(&versions_dir, ctx.date, &planned)?;

        Ok((resolved, failures, planned))
    }

    /// Everything up to and including the update list, without exporting.
    pub async fn plan_only(&self) -> Result<RunSummary> {
        let (resolved, failures, planned) = self.prepare().await?;
        Ok(RunSummary {
            date: self.ctx.date,
            resolved: resolved.len(),
            resolution_failures: failures,
            planned,
            report: Report::default(),
            interrupted: self.ctx.cancel.is_cancelled(),
        })
    }

    /// Full run.
    pub async fn run(&self) -> Result<RunSummary> {
        let ctx = &self.ctx;
        tracing::info!(
            date = %ctx.date,
            components = ctx.config.components.len(),
            "Starting mirror run"
        );

        let (resolved, failures, planned) = self.prepare().await?;

        let filters = Arc::new(CatalogFilters::compile(&ctx.config.components)?);
        let worker = ExportWorker::new(
            ctx.date,
            Arc::clone(&ctx.images),
            ctx.path_resolver(),
            ctx.retry_policy(),
            Duration::from_secs(ctx.config.export.pull_timeout_secs.max(1)),
            ctx.cancel.clone(),
        )
        .with_filters(Arc::clone(&filters));
        let coordinator = ExportCoordinator::new(
            Arc::new(worker),
            Arc::clone(&ctx.versions),
            Arc::clone(&ctx.progress),
            ctx.config.export.concurrency,
            ctx.date,
            ctx.cancel.clone(),
        )
        .with_filters(filters);
        let report = coordinator.run(planned.clone()).await?;

        let summary = RunSummary {
            date: ctx.date,
            resolved: resolved.len(),
            resolution_failures: failures,
            planned,
            interrupted: ctx.cancel.is_cancelled() || !report.cancelled.is_empty(),
            report,
        };
        tracing::info!(
            resolved = summary.resolved,
            planned = summary.planned.len(),
            done = summary.report.done().len(),
            failed = summary.report.failed().len(),
            skipped = summary.report.skipped().len(),
            exit_code = summary.exit_code(),
            "Mirror run finished"
        );
        Ok(summary)
    }
}
