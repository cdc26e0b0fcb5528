//! Work model flowing through a run: resolved versions, version records,
//! work items and their outcomes.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::Architecture;
use crate::error::MirrorError;

/// Name versions of a component line are recorded under: the component
/// name, or `<name>@<major>` when the component tracks every major line.
pub fn track_name(component: &str, line: Option<u64>) -> String {
    match line {
        Some(major) => format!("{}@{}", component, major),
        None => component.to_string(),
    }
}

/// Component part of a [`track_name`].
pub fn track_component(track: &str) -> &str {
    track.split_once('@').map_or(track, |(component, _)| component)
}

/// Highest qualifying tag for a (component, architecture) pair, or for one
/// major line of it.
///
/// Produced by tag resolution, consumed by the planner, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    pub component: String,
    pub arch: Architecture,
    pub version: String,
    /// Major line, for components tracking each major separately
    #[serde(default)]
    pub line: Option<u64>,
    /// When the tag was last pushed, if the registry reports it
    pub pushed_at: Option<DateTime<Utc>>,
}

impl ResolvedVersion {
    pub fn track(&self) -> String {
        track_name(&self.component, self.line)
    }
}

/// "As of `date`, `component` on `arch` was last exported at `version`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Track name ([`track_name`]); the plain component name unless every
    /// major line is tracked
    pub component: String,
    pub arch: Architecture,
    pub version: String,
    pub date: NaiveDate,
}

/// Identity of a work item, used for resume bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub component: String,
    pub arch: Architecture,
    pub version: String,
}

impl WorkKey {
    pub fn new(component: impl Into<String>, arch: Architecture, version: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            arch,
            version: version.into(),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.component, self.version, self.arch)
    }
}

/// A planned export of one image variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: WorkKey,
    /// Image path without tag (e.g. `docker.io/library/redis`)
    pub image: String,
    /// Final archive path
    pub destination: PathBuf,
    /// Version recorded before this run, if any
    pub previous: Option<String>,
}

impl WorkItem {
    /// `image:version` reference to pull.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.key.version)
    }
}

/// Terminal state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Done,
    Failed,
    Skipped,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Done => "done",
            ItemState::Failed => "failed",
            ItemState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Terminal result of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Outcome {
    Done {
        path: PathBuf,
        /// An intact archive was already on disk
        reused: bool,
        /// Completed in an earlier run of the same day
        resumed: bool,
    },
    Failed {
        kind: String,
        message: String,
    },
    Skipped {
        reason: String,
    },
}

impl Outcome {
    /// Failed or skipped outcome for an error, keyed on its classification.
    pub fn from_error(error: &MirrorError) -> Self {
        if error.is_skip() {
            Outcome::Skipped {
                reason: error.to_string(),
            }
        } else {
            Outcome::Failed {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }
        }
    }

    pub fn state(&self) -> ItemState {
        match self {
            Outcome::Done { .. } => ItemState::Done,
            Outcome::Failed { .. } => ItemState::Failed,
            Outcome::Skipped { .. } => ItemState::Skipped,
        }
    }
}

/// One line of the export report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub key: WorkKey,
    pub outcome: Outcome,
}

/// Itemized result of an export run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Terminal outcomes in completion order
    pub entries: Vec<ReportEntry>,
    /// Items never started because the run was cancelled
    pub cancelled: Vec<WorkKey>,
}

impl Report {
    pub fn record(&mut self, key: WorkKey, outcome: Outcome) {
        self.entries.push(ReportEntry { key, outcome });
    }

    fn in_state(&self, state: ItemState) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.outcome.state() == state)
    }

    pub fn done(&self) -> Vec<&ReportEntry> {
        self.in_state(ItemState::Done).collect()
    }

    pub fn failed(&self) -> Vec<&ReportEntry> {
        self.in_state(ItemState::Failed).collect()
    }

    pub fn skipped(&self) -> Vec<&ReportEntry> {
        self.in_state(ItemState::Skipped).collect()
    }

    pub fn has_failures(&self) -> bool {
        self.in_state(ItemState::Failed).next().is_some()
    }

    pub fn outcome_of(&self, key: &WorkKey) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|entry| &entry.key == key)
            .map(|entry| &entry.outcome)
    }
}
