//! Export coordinator.
//!
//! Dispatches work items to a bounded pool of export tasks in planning
//! order and applies every result itself: version records and progress are
//! only ever written from here, never from a worker.
//!
//! Progress is written before the version record. An item whose record
//! write failed is therefore resumed by the next run of the same day, which
//! records its version again without exporting it.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::FutureExt;
use imirror_core::catalog::CatalogFilters;
use imirror_core::error::{MirrorError, Result};
use imirror_core::work::{track_name, Outcome, Report, VersionRecord, WorkItem, WorkKey};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::archive::sweep_stale;
use crate::export::{ExportWorker, Exported};
use crate::store::{ProgressStore, VersionStore};

/// Owns the worker pool and the persisted run state.
pub struct ExportCoordinator {
    worker: Arc<ExportWorker>,
    versions: Arc<dyn VersionStore>,
    progress: Arc<dyn ProgressStore>,
    concurrency: usize,
    date: NaiveDate,
    cancel: CancellationToken,
    filters: Arc<CatalogFilters>,
}

impl ExportCoordinator {
    pub fn new(
        worker: Arc<ExportWorker>,
        versions: Arc<dyn VersionStore>,
        progress: Arc<dyn ProgressStore>,
        concurrency: usize,
        date: NaiveDate,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            versions,
            progress,
            concurrency: concurrency.max(1),
            date,
            cancel,
            filters: Arc::new(CatalogFilters::default()),
        }
    }

    /// Catalog filters giving each component its version ordering and major
    /// lines.
    pub fn with_filters(mut self, filters: Arc<CatalogFilters>) -> Self {
        self.filters = filters;
        self
    }

    /// Completed items recorded earlier today. An unreadable progress file
    /// counts as no progress.
    fn load_progress(&self) -> Result<BTreeSet<WorkKey>> {
        match self.progress.load(self.date) {
            Ok(done) => Ok(done),
            Err(e @ MirrorError::StateCorrupt { .. }) => {
                tracing::warn!(error = %e, "Progress file unreadable, starting fresh");
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Run every item to a terminal outcome, or until cancelled.
    ///
    /// Items start in the order given. Completion order is whatever the
    /// pool produces. Items not yet started when the run is cancelled are
    /// listed in [`Report::cancelled`].
    pub async fn run(&self, items: Vec<WorkItem>) -> Result<Report> {
        let done = self.load_progress()?;
        let mut report = Report::default();

        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            if !done.contains(&item.key) {
                pending.push(item);
                continue;
            }
            let outcome = match self.record_version(&item) {
                Ok(()) => {
                    tracing::info!(item = %item.key, "Already exported today, skipping");
                    Outcome::Done {
                        path: item.destination,
                        reused: false,
                        resumed: true,
                    }
                }
                Err(e) => {
                    tracing::error!(item = %item.key, error = %e, "Failed to record export");
                    Outcome::from_error(&e)
                }
            };
            report.record(item.key, outcome);
        }

        if !self.cancel.is_cancelled() {
            self.sweep(&pending);
        }

        tracing::info!(
            pending = pending.len(),
            resumed = report.entries.len(),
            concurrency = self.concurrency,
            "Starting export"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<(WorkItem, Result<Exported>)>();
        let mut queue = pending.into_iter();
        let mut next = queue.next();
        let mut in_flight = 0usize;

        while next.is_some() || in_flight > 0 {
            tokio::select! {
                biased;

                Some((item, result)) = rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    self.apply(&mut report, item, result);
                }

                _ = self.cancel.cancelled(), if next.is_some() => {
                    let remaining: Vec<WorkKey> = next
                        .take()
                        .into_iter()
                        .chain(queue.by_ref())
                        .map(|item| item.key)
                        .collect();
                    tracing::warn!(
                        not_started = remaining.len(),
                        in_flight,
                        "Cancelled, no further exports will start"
                    );
                    report.cancelled.extend(remaining);
                }

                permit = semaphore.clone().acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else { break };
                    let Some(item) = next.take() else { continue };
                    next = queue.next();
                    in_flight += 1;

                    tracing::info!(item = %item.key, "Export running");
                    let worker = Arc::clone(&self.worker);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = AssertUnwindSafe(worker.export(&item))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(MirrorError::SaveFailed {
                                    reference: item.reference(),
                                    message: "export task panicked".to_string(),
                                })
                            });
                        drop(permit);
                        let _ = tx.send((item, result));
                    });
                }
            }
        }

        tracing::info!(
            done = report.done().len(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            cancelled = report.cancelled.len(),
            "Export finished"
        );
        Ok(report)
    }

    /// Turn one worker result into a terminal outcome and persist it.
    fn apply(&self, report: &mut Report, item: WorkItem, result: Result<Exported>) {
        let key = item.key.clone();
        match result {
            Ok(exported) => match self.persist(&item) {
                Ok(()) => {
                    tracing::info!(
                        item = %key,
                        path = %exported.path.display(),
                        bytes = exported.bytes,
                        reused = exported.reused,
                        "Export done"
                    );
                    report.record(
                        key,
                        Outcome::Done {
                            path: exported.path,
                            reused: exported.reused,
                            resumed: false,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(item = %key, error = %e, "Failed to record export");
                    report.record(key, Outcome::from_error(&e));
                }
            },
            Err(MirrorError::Cancelled) => {
                tracing::warn!(item = %key, "Export interrupted");
                report.cancelled.push(key);
            }
            Err(e) if e.is_skip() => {
                tracing::warn!(item = %key, reason = %e, "Export skipped");
                report.record(key, Outcome::from_error(&e));
            }
            Err(e) => {
                tracing::error!(item = %key, error = %e, "Export failed");
                report.record(key, Outcome::from_error(&e));
            }
        }
    }

    /// Progress first, then the version record.
    fn persist(&self, item: &WorkItem) -> Result<()> {
        self.progress.mark_done(self.date, &item.key)?;
        self.record_version(item)
    }

    fn record_version(&self, item: &WorkItem) -> Result<()> {
        let filter = self.filters.get(&item.key.component);
        let record = VersionRecord {
            component: track_name(&item.key.component, filter.line_of(&item.key.version)),
            arch: item.key.arch,
            version: item.key.version.clone(),
            date: self.date,
        };
        self.versions.record(&record, filter)
    }

    /// Clear leftovers of interrupted exports from every destination
    /// directory, before any export of this run starts.
    fn sweep(&self, items: &[WorkItem]) {
        let dirs: BTreeSet<&Path> = items
            .iter()
            .filter_map(|item| item.destination.parent())
            .collect();
        let removed: usize = dirs.into_iter().map(sweep_stale).sum();
        if removed > 0 {
            tracing::info!(removed, "Cleaned up after an interrupted run");
        }
    }
}
