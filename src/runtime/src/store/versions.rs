//! Dated version records.
//!
//! One JSON file per calendar day, `versions-<YYYYMMDD>.json`, mapping
//! component → architecture → version. The latest-known version of a
//! variant is found by overlaying every dated file in ascending date order.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use imirror_core::catalog::{Architecture, TagFilter};
use imirror_core::date::{parse_stamp, stamp};
use imirror_core::error::{MirrorError, Result};
use imirror_core::work::VersionRecord;

use super::write_atomic;

/// (component, architecture)
pub type VariantKey = (String, Architecture);

/// Latest recorded export per variant.
pub type LastKnown = HashMap<VariantKey, VersionRecord>;

/// Contents of one day's file.
type DayRecords = BTreeMap<String, BTreeMap<Architecture, String>>;

const FILE_PREFIX: &str = "versions-";
const FILE_SUFFIX: &str = ".json";

/// Persisted "last exported version" facts.
pub trait VersionStore: Send + Sync {
    /// Latest record per (component, architecture) across all days.
    fn latest_known(&self) -> Result<LastKnown>;

    /// Record a successful export. A record is never lowered within a day;
    /// `ordering` is the component's filter, whose version ordering decides
    /// what "lower" means.
    fn record(&self, record: &VersionRecord, ordering: &TagFilter) -> Result<()>;
}

/// Whether `candidate` may replace `existing` in the same day's file.
fn may_replace(existing: Option<&String>, candidate: &str, ordering: &TagFilter) -> bool {
    match existing {
        None => true,
        Some(existing) => ordering.version_of(candidate) >= ordering.version_of(existing),
    }
}

/// File name of one day's records.
pub fn versions_file_name(date: NaiveDate) -> String {
    format!("{}{}{}", FILE_PREFIX, stamp(date), FILE_SUFFIX)
}

/// Version files under a directory.
#[derive(Debug)]
pub struct FileVersionStore {
    dir: PathBuf,
}

impl FileVersionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(versions_file_name(date))
    }

    /// Dated files present, ascending by date.
    fn dated_files(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|n| n.strip_prefix(FILE_PREFIX))
                .and_then(|n| n.strip_suffix(FILE_SUFFIX))
                .and_then(|s| parse_stamp(s).ok())
            else {
                continue;
            };
            files.push((date, entry.path()));
        }
        files.sort();
        Ok(files)
    }

    fn read_day(path: &Path) -> Result<DayRecords> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DayRecords::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map_err(|e| MirrorError::StateCorrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

fn flatten(date: NaiveDate, day: DayRecords) -> impl Iterator<Item = VersionRecord> {
    day.into_iter().flat_map(move |(component, arches)| {
        arches.into_iter().map(move |(arch, version)| VersionRecord {
            component: component.clone(),
            arch,
            version,
            date,
        })
    })
}

impl VersionStore for FileVersionStore {
    fn latest_known(&self) -> Result<LastKnown> {
        let mut known = LastKnown::new();
        for (date, path) in self.dated_files()? {
            match Self::read_day(&path) {
                Ok(day) => {
                    for record in flatten(date, day) {
                        known.insert((record.component.clone(), record.arch), record);
                    }
                }
                Err(e @ MirrorError::StateCorrupt { .. }) => {
                    tracing::warn!(error = %e, "Ignoring unreadable version file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(known)
    }

    fn record(&self, record: &VersionRecord, ordering: &TagFilter) -> Result<()> {
        let path = self.day_path(record.date);
        let mut day = match Self::read_day(&path) {
            Ok(day) => day,
            Err(e @ MirrorError::StateCorrupt { .. }) => {
                tracing::warn!(error = %e, "Replacing unreadable version file");
                DayRecords::new()
            }
            Err(e) => return Err(e),
        };

        let arches = day.entry(record.component.clone()).or_default();
        if !may_replace(arches.get(&record.arch), &record.version, ordering) {
            tracing::debug!(
                component = %record.component,
                arch = %record.arch,
                version = %record.version,
                "Keeping higher version already recorded today"
            );
            return Ok(());
        }
        arches.insert(record.arch, record.version.clone());

        write_atomic(&path, &serde_json::to_string_pretty(&day)?)
    }
}

/// In-memory version store.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    days: Mutex<BTreeMap<NaiveDate, DayRecords>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with records.
    pub fn with_records(records: impl IntoIterator<Item = VersionRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut days) = store.days.lock() {
            for r in records {
                days.entry(r.date)
                    .or_default()
                    .entry(r.component)
                    .or_default()
                    .insert(r.arch, r.version);
            }
        }
        store
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<NaiveDate, DayRecords>>> {
        self.days
            .lock()
            .map_err(|_| MirrorError::StateCorrupt {
                path: "<memory>".to_string(),
                message: "version store lock poisoned".to_string(),
            })
    }
}

impl VersionStore for MemoryVersionStore {
    fn latest_known(&self) -> Result<LastKnown> {
        let days = self.lock()?;
        let mut known = LastKnown::new();
        for (date, day) in days.iter() {
            for record in flatten(*date, day.clone()) {
                known.insert((record.component.clone(), record.arch), record);
            }
        }
        Ok(known)
    }

    fn record(&self, record: &VersionRecord, ordering: &TagFilter) -> Result<()> {
        let mut days = self.lock()?;
        let arches = days
            .entry(record.date)
            .or_default()
            .entry(record.component.clone())
            .or_default();
        if may_replace(arches.get(&record.arch), &record.version, ordering) {
            arches.insert(record.arch, record.version.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imirror_core::catalog::FilterPolicy;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, d).unwrap()
    }

    fn plain() -> TagFilter {
        TagFilter::default()
    }

    fn day_json(dir: &Path, date: NaiveDate) -> serde_json::Value {
        let json = std::fs::read_to_string(dir.join(versions_file_name(date))).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    fn rec(component: &str, arch: Architecture, version: &str, date: NaiveDate) -> VersionRecord {
        VersionRecord {
            component: component.to_string(),
            arch,
            version: version.to_string(),
            date,
        }
    }

    #[test]
    fn test_empty_dir_has_no_records() {
        let dir = TempDir::new().unwrap();
        let store = FileVersionStore::new(dir.path().join("versions"));
        assert!(store.latest_known().unwrap().is_empty());
    }

    #[test]
    fn test_record_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = FileVersionStore::new(dir.path());
        store.record(&rec("redis", Architecture::Amd64, "7.4.1", day(2)), &plain()).unwrap();
        store.record(&rec("redis", Architecture::Arm64, "7.4.1", day(2)), &plain()).unwrap();

        assert!(dir.path().join("versions-20241202.json").exists());
        let parsed = day_json(dir.path(), day(2));
        assert_eq!(parsed["redis"]["amd64"], "7.4.1");
        assert_eq!(parsed["redis"]["arm64"], "7.4.1");

        let known = store.latest_known().unwrap();
        assert_eq!(known[&("redis".to_string(), Architecture::Amd64)].version, "7.4.1");
    }

    #[test]
    fn test_newer_day_wins_in_overlay() {
        let dir = TempDir::new().unwrap();
        let store = FileVersionStore::new(dir.path());
        store.record(&rec("nginx", Architecture::Amd64, "1.27.2", day(1)), &plain()).unwrap();
        store.record(&rec("nginx", Architecture::Arm64, "1.27.2", day(1)), &plain()).unwrap();
        store.record(&rec("nginx", Architecture::Amd64, "1.27.3", day(5)), &plain()).unwrap();

        let known = store.latest_known().unwrap();
        let amd = &known[&("nginx".to_string(), Architecture::Amd64)];
        assert_eq!(amd.version, "1.27.3");
        assert_eq!(amd.date, day(5));
        let arm = &known[&("nginx".to_string(), Architecture::Arm64)];
        assert_eq!(arm.version, "1.27.2");
        assert_eq!(arm.date, day(1));
    }

    #[test]
    fn test_same_day_writes_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = FileVersionStore::new(dir.path());
        store.record(&rec("nginx", Architecture::Amd64, "1.27.3", day(2)), &plain()).unwrap();
        store.record(&rec("nginx", Architecture::Amd64, "1.27.2", day(2)), &plain()).unwrap();

        let known = store.latest_known().unwrap();
        assert_eq!(known[&("nginx".to_string(), Architecture::Amd64)].version, "1.27.3");
    }

    #[test]
    fn test_same_day_ordering_follows_component_filter() {
        let dir = TempDir::new().unwrap();
        let store = FileVersionStore::new(dir.path());
        let minio = FilterPolicy {
            strip_prefix: Some("RELEASE.".to_string()),
            ..Default::default()
        }
        .compile()
        .unwrap();

        store
            .record(&rec("minio", Architecture::Amd64, "RELEASE.2024-12-18T13-15-44Z", day(2)), &minio)
            .unwrap();
        store
            .record(&rec("minio", Architecture::Amd64, "RELEASE.2024-11-07T00-52-20Z", day(2)), &minio)
            .unwrap();

        let known = store.latest_known().unwrap();
        assert_eq!(
            known[&("minio".to_string(), Architecture::Amd64)].version,
            "RELEASE.2024-12-18T13-15-44Z"
        );
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = FileVersionStore::new(dir.path());
        store.record(&rec("redis", Architecture::Amd64, "7.4.0", day(1)), &plain()).unwrap();
        std::fs::write(dir.path().join("versions-20241203.json"), "{ not json").unwrap();

        let known = store.latest_known().unwrap();
        assert_eq!(known[&("redis".to_string(), Architecture::Amd64)].version, "7.4.0");

        // Writing to the corrupt day replaces it
        store.record(&rec("redis", Architecture::Amd64, "7.4.1", day(3)), &plain()).unwrap();
        assert_eq!(day_json(dir.path(), day(3))["redis"]["amd64"], "7.4.1");
        let known = store.latest_known().unwrap();
        assert_eq!(known[&("redis".to_string(), Architecture::Amd64)].version, "7.4.1");
    }

    #[test]
    fn test_unrelated_files_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("latest-20241202.txt"), "x").unwrap();
        std::fs::write(dir.path().join("versions-notadate.json"), "{}").unwrap();
        let store = FileVersionStore::new(dir.path());
        assert!(store.latest_known().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_matches_file_semantics() {
        let store = MemoryVersionStore::with_records(vec![rec(
            "elasticsearch",
            Architecture::Amd64,
            "8.15.0",
            day(1),
        )]);
        store.record(&rec("elasticsearch", Architecture::Amd64, "8.16.0", day(2)), &plain()).unwrap();
        store.record(&rec("elasticsearch", Architecture::Amd64, "8.15.5", day(2)), &plain()).unwrap();

        let known = store.latest_known().unwrap();
        let record = &known[&("elasticsearch".to_string(), Architecture::Amd64)];
        assert_eq!(record.version, "8.16.0");
        assert_eq!(record.date, day(2));
    }
}
