//! Archive output layout and integrity checks.
//!
//! Every exported image lands at
//! `<output_root>/<YYYYMMDD>/<ARCH>/<component>_<version>_<arch>_<YYYYMMDD>.tar.gz`.
//! The path is a pure function of its inputs so resumed runs find the
//! files an earlier run produced.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use imirror_core::catalog::Architecture;
use imirror_core::date::stamp;
use imirror_core::error::{MirrorError, Result};

const ARCHIVE_EXT: &str = ".tar.gz";
const PARTIAL_EXT: &str = ".partial";

/// Prefix of the per-export staging directories inside an arch directory.
pub const STAGING_PREFIX: &str = ".staging-";

/// Computes and guards archive destinations.
#[derive(Debug, Clone)]
pub struct ArchivePathResolver {
    output_root: PathBuf,
    overwrite: bool,
}

impl ArchivePathResolver {
    pub fn new(output_root: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            output_root: output_root.into(),
            overwrite,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Final archive path for one image variant.
    pub fn resolve(
        &self,
        date: NaiveDate,
        arch: Architecture,
        component: &str,
        version: &str,
    ) -> PathBuf {
        self.arch_dir(date, arch)
            .join(archive_file_name(date, arch, component, version))
    }

    /// Directory holding one day's archives for an architecture.
    pub fn arch_dir(&self, date: NaiveDate, arch: Architecture) -> PathBuf {
        self.output_root.join(stamp(date)).join(arch.dir_name())
    }

    /// Same-day archives of `component` for `arch` at a version other than
    /// `version`, limited to versions `same_line` accepts. Components
    /// tracking every major line keep one archive per line.
    ///
    /// Without the overwrite flag any such archive is a
    /// [`MirrorError::PathCollision`]. With it, the conflicting paths are
    /// returned so the caller can remove them once the new archive is in
    /// place.
    pub fn check_collision(
        &self,
        date: NaiveDate,
        arch: Architecture,
        component: &str,
        version: &str,
        same_line: impl Fn(&str) -> bool,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.arch_dir(date, arch);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut conflicts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(existing) = archived_version(name, date, arch, component) {
                if existing != version && same_line(existing) {
                    conflicts.push((existing.to_string(), entry.path()));
                }
            }
        }
        conflicts.sort();

        match conflicts.first() {
            Some((existing, _)) if !self.overwrite => Err(MirrorError::PathCollision {
                path: dir.display().to_string(),
                existing: existing.clone(),
                requested: version.to_string(),
            }),
            _ => Ok(conflicts.into_iter().map(|(_, path)| path).collect()),
        }
    }
}

/// `<component>_<version>_<arch>_<YYYYMMDD>.tar.gz`
pub fn archive_file_name(
    date: NaiveDate,
    arch: Architecture,
    component: &str,
    version: &str,
) -> String {
    format!(
        "{}_{}_{}_{}{}",
        component,
        version,
        arch.as_str(),
        stamp(date),
        ARCHIVE_EXT
    )
}

/// Version encoded in an archive file name, if it belongs to
/// (`component`, `arch`, `date`).
fn archived_version<'a>(
    file_name: &'a str,
    date: NaiveDate,
    arch: Architecture,
    component: &str,
) -> Option<&'a str> {
    let suffix = format!("_{}_{}{}", arch.as_str(), stamp(date), ARCHIVE_EXT);
    file_name
        .strip_prefix(component)?
        .strip_prefix('_')?
        .strip_suffix(suffix.as_str())
        .filter(|version| !version.is_empty())
}

/// Hidden sibling the archive is written to before the final rename.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}{}", name, PARTIAL_EXT))
}

/// Remove staging directories and partial archives an interrupted run left
/// in `dir`. Returns how many entries were removed. Must not run while
/// exports into `dir` are in flight.
pub fn sweep_stale(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot scan for stale export files");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let path = entry.path();
        let result = if name.starts_with(STAGING_PREFIX) && path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if name.starts_with('.') && name.ends_with(PARTIAL_EXT) && path.is_file() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        match result {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Removed leftover from an interrupted export");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove leftover export file");
            }
        }
    }
    removed
}

/// Fully decode a `.tar.gz`: every tar entry is read and the gzip trailer
/// (CRC32 and length) is checked.
pub fn verify_archive(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "archive is empty"));
    }

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut entries = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        io::copy(&mut entry, &mut io::sink())?;
        entries += 1;
    }
    if entries == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "archive has no entries"));
    }

    // tar stops at its end-of-archive marker; drain the rest so the gzip
    // trailer is read and checked
    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink())?;

    Ok(size)
}
