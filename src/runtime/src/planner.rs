//! Update planning: which (component, architecture) variants need export.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use imirror_core::catalog::{Architecture, Component};
use imirror_core::error::Result;
use imirror_core::work::{ResolvedVersion, WorkItem, WorkKey};

use crate::archive::ArchivePathResolver;
use crate::store::{LastKnown, VariantKey};

/// Resolved versions keyed by (track, architecture).
pub type Resolved = BTreeMap<VariantKey, ResolvedVersion>;

/// Every resolved line of `component` on `arch`, ascending by major.
pub fn lines_of<'r>(
    resolved: &'r Resolved,
    component: &str,
    arch: Architecture,
) -> Vec<&'r ResolvedVersion> {
    let mut lines: Vec<&ResolvedVersion> = resolved
        .values()
        .filter(|v| v.component == component && v.arch == arch)
        .collect();
    lines.sort_by_key(|v| v.line);
    lines
}

/// Compares resolved versions against recorded ones.
pub struct UpdatePlanner<'a> {
    catalog: &'a [Component],
    resolver: &'a ArchivePathResolver,
    date: NaiveDate,
}

impl<'a> UpdatePlanner<'a> {
    pub fn new(catalog: &'a [Component], resolver: &'a ArchivePathResolver, date: NaiveDate) -> Self {
        Self {
            catalog,
            resolver,
            date,
        }
    }

    /// Work items in catalog order, then architecture order within a
    /// component, then ascending major line.
    ///
    /// A variant is planned when nothing was recorded for its track, or when
    /// the resolved version is strictly greater than the recorded one under
    /// the component's own version ordering. An architecture listed twice is
    /// planned once.
    pub fn plan(&self, resolved: &Resolved, last_known: &LastKnown) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();

        for component in self.catalog {
            let filter = component.policy.compile()?;
            for arch in component.unique_architectures() {
                for candidate in lines_of(resolved, &component.name, arch) {
                    let recorded = last_known.get(&(candidate.track(), arch));

                    if let Some(record) = recorded {
                        let new = filter.version_of(&candidate.version);
                        let old = filter.version_of(&record.version);
                        if new <= old {
                            tracing::debug!(
                                track = %candidate.track(),
                                arch = %arch,
                                version = %candidate.version,
                                recorded = %record.version,
                                "Up to date"
                            );
                            continue;
                        }
                    }

                    items.push(self.item(component, arch, &candidate.version, recorded.map(|r| r.version.clone())));
                }
            }
        }

        tracing::info!(items = items.len(), "Planned exports");
        Ok(items)
    }

    fn item(
        &self,
        component: &Component,
        arch: Architecture,
        version: &str,
        previous: Option<String>,
    ) -> WorkItem {
        WorkItem {
            key: WorkKey::new(component.name.clone(), arch, version),
            image: component.image.clone(),
            destination: self
                .resolver
                .resolve(self.date, arch, &component.name, version),
            previous,
        }
    }
}
