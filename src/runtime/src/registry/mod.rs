//! Registry tag resolution.
//!
//! A [`TagSource`] lists one page of a repository's tags. The
//! [`RegistryClient`] pages through the full list with retry, applies the
//! component's filter policy and picks the highest qualifying version for
//! every architecture the component targets.

mod hub;

pub use hub::HubTagSource;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imirror_core::catalog::{Architecture, Component, TagFilter};
use imirror_core::error::{MirrorError, Result};
use imirror_core::retry::RetryPolicy;
use imirror_core::version::Version;
use imirror_core::work::ResolvedVersion;
use tokio_util::sync::CancellationToken;

use crate::oci::ImageReference;
use crate::retry::retry;

/// A tag as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTag {
    pub name: String,
    /// Linux architectures published under the tag. Empty when the
    /// registry does not say, in which case every architecture is assumed.
    pub architectures: Vec<Architecture>,
    pub pushed_at: Option<DateTime<Utc>>,
}

impl RemoteTag {
    pub fn supports(&self, arch: Architecture) -> bool {
        self.architectures.is_empty() || self.architectures.contains(&arch)
    }
}

/// One page of a tag listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPage {
    pub tags: Vec<RemoteTag>,
    pub has_next: bool,
}

/// Capability to list a repository's tags, one page at a time.
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Fetch 1-based `page` of the tags of `repository` (`namespace/name`).
    async fn fetch_page(&self, repository: &str, page: u32) -> Result<TagPage>;
}

/// Resolves the latest qualifying version of catalog components.
pub struct RegistryClient {
    source: Arc<dyn TagSource>,
    retry: RetryPolicy,
    max_pages: u32,
    cancel: CancellationToken,
}

impl RegistryClient {
    pub fn new(source: Arc<dyn TagSource>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            source,
            retry,
            max_pages: 100,
            cancel,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Every tag of `repository`, deduplicated by name, in listing order.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<RemoteTag>> {
        let mut tags = Vec::new();
        let mut seen = HashSet::new();
        let mut page = 1;

        loop {
            let batch = retry(&self.retry, &self.cancel, "list tags", |_| {
                self.source.fetch_page(repository, page)
            })
            .await
            .map_err(exhausted)?;

            for tag in batch.tags {
                if seen.insert(tag.name.clone()) {
                    tags.push(tag);
                }
            }

            if !batch.has_next {
                break;
            }
            if page >= self.max_pages {
                tracing::warn!(repository, pages = page, "Tag listing truncated at page limit");
                break;
            }
            page += 1;
        }

        tracing::debug!(repository, tags = tags.len(), "Listed tags");
        Ok(tags)
    }

    /// Highest qualifying version of `component` per architecture (and per
    /// major line when the policy tracks them).
    ///
    /// Fails with [`MirrorError::NoMatchingTag`] when the filter policy
    /// leaves no candidate for any architecture.
    pub async fn resolve_latest(&self, component: &Component) -> Result<Vec<ResolvedVersion>> {
        let filter = component.policy.compile()?;
        let reference = ImageReference::parse(&component.image)?;
        let tags = self.list_tags(&reference.repository).await?;
        let resolved = select_latest(component, &filter, &tags)?;

        for version in &resolved {
            tracing::info!(
                component = %component.name,
                arch = %version.arch,
                version = %version.version,
                line = ?version.line,
                "Resolved latest version"
            );
        }
        Ok(resolved)
    }
}

/// Rate limiting that outlasts the retry budget is reported as unreachable.
fn exhausted(err: MirrorError) -> MirrorError {
    match err {
        MirrorError::RateLimited {
            repository,
            retry_after_secs,
        } => MirrorError::RegistryUnreachable {
            repository,
            message: format!(
                "still rate limited after retries (retry after {}s)",
                retry_after_secs
            ),
        },
        other => other,
    }
}

struct Candidate<'a> {
    tag: &'a RemoteTag,
    version: Version,
}

/// Greater version wins, then the most recent push, then the greater raw tag.
fn compare_candidates(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.tag.pushed_at.cmp(&b.tag.pushed_at))
        .then_with(|| a.tag.name.cmp(&b.tag.name))
}

/// Most recent push wins, then the greater raw tag.
fn compare_fallback(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.tag
        .pushed_at
        .cmp(&b.tag.pushed_at)
        .then_with(|| a.tag.name.cmp(&b.tag.name))
}

/// Best candidate among `candidates`: the highest semantic version, or
/// the most recently pushed non-semantic tag when the policy allows it.
fn pick<'a, 'b>(
    candidates: impl Iterator<Item = &'b Candidate<'a>> + Clone,
    filter: &TagFilter,
) -> Option<&'b Candidate<'a>> {
    candidates
        .clone()
        .filter(|c| c.version.is_semantic())
        .max_by(|a, b| compare_candidates(a, b))
        .or_else(|| {
            if filter.allow_non_semantic() {
                candidates
                    .filter(|c| !c.version.is_semantic())
                    .max_by(|a, b| compare_fallback(a, b))
            } else {
                None
            }
        })
}

/// Pick the latest qualifying tag for each of the component's
/// architectures, or for each major line of it when the policy tracks
/// every major.
///
/// Results come in architecture order, lines ascending within one
/// architecture.
pub fn select_latest(
    component: &Component,
    filter: &TagFilter,
    tags: &[RemoteTag],
) -> Result<Vec<ResolvedVersion>> {
    let candidates: Vec<Candidate<'_>> = tags
        .iter()
        .filter(|tag| filter.accepts(&tag.name))
        .map(|tag| Candidate {
            tag,
            version: filter.version_of(&tag.name),
        })
        .collect();

    tracing::debug!(
        component = %component.name,
        listed = tags.len(),
        accepted = candidates.len(),
        "Filtered tags"
    );

    let resolved_as = |arch: Architecture, line: Option<u64>, candidate: &Candidate<'_>| {
        ResolvedVersion {
            component: component.name.clone(),
            arch,
            version: candidate.tag.name.clone(),
            line,
            pushed_at: candidate.tag.pushed_at,
        }
    };

    let mut resolved = Vec::new();
    for arch in component.unique_architectures() {
        let available = candidates.iter().filter(move |c| c.tag.supports(arch));

        let lines: BTreeSet<u64> = if filter.tracks_majors() {
            available.clone().filter_map(|c| c.version.major()).collect()
        } else {
            BTreeSet::new()
        };

        let before = resolved.len();
        if lines.is_empty() {
            if let Some(best) = pick(available, filter) {
                resolved.push(resolved_as(arch, None, best));
            }
        } else {
            for line in lines {
                let in_line = available.clone().filter(move |c| c.version.major() == Some(line));
                if let Some(best) = pick(in_line, filter) {
                    resolved.push(resolved_as(arch, Some(line), best));
                }
            }
        }

        if resolved.len() == before {
            tracing::warn!(
                component = %component.name,
                arch = %arch,
                "No qualifying tag for architecture"
            );
        }
    }

    if resolved.is_empty() {
        return Err(MirrorError::NoMatchingTag {
            component: component.name.clone(),
        });
    }
    Ok(resolved)
}
