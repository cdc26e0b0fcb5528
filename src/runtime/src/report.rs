//! Operator-facing text files written during a run.
//!
//! `latest-<YYYYMMDD>.txt` lists every resolved version and
//! `update-<YYYYMMDD>.txt` lists the planned exports, both under the
//! versions directory.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use imirror_core::catalog::Component;
use imirror_core::date::stamp;
use imirror_core::error::{MirrorError, Result};
use imirror_core::work::WorkItem;

use crate::planner::{lines_of, Resolved};

pub fn latest_file_name(date: NaiveDate) -> String {
    format!("latest-{}.txt", stamp(date))
}

pub fn update_file_name(date: NaiveDate) -> String {
    format!("update-{}.txt", stamp(date))
}

/// One `image:version (arch)` line per resolved variant, in catalog order.
pub fn render_latest(catalog: &[Component], resolved: &Resolved) -> String {
    let mut out = String::new();
    for component in catalog {
        for arch in component.unique_architectures() {
            for version in lines_of(resolved, &component.name, arch) {
                out.push_str(&format!(
                    "{} ({})\n",
                    component.reference(&version.version),
                    arch
                ));
            }
        }
    }
    out
}

/// One `image:version (arch) -> path` line per work item.
pub fn render_update(items: &[WorkItem]) -> String {
    items
        .iter()
        .map(|item| {
            format!(
                "{} ({}) -> {}\n",
                item.reference(),
                item.key.arch,
                item.destination.display()
            )
        })
        .collect()
}

/// Write the latest list. Returns its path.
pub fn write_latest(
    dir: &Path,
    date: NaiveDate,
    catalog: &[Component],
    resolved: &Resolved,
) -> Result<PathBuf> {
    let path = dir.join(latest_file_name(date));
    write_text(&path, &render_latest(catalog, resolved))?;
    tracing::info!(path = %path.display(), versions = resolved.len(), "Wrote latest versions");
    Ok(path)
}

/// Write the update list. Nothing is written when no export is planned.
pub fn write_update(dir: &Path, date: NaiveDate, items: &[WorkItem]) -> Result<Option<PathBuf>> {
    let path = dir.join(update_file_name(date));
    if items.is_empty() {
        tracing::info!("Everything up to date, no update list written");
        return Ok(None);
    }
    write_text(&path, &render_update(items))?;
    tracing::info!(path = %path.display(), items = items.len(), "Wrote update list");
    Ok(Some(path))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    let write_failed = |target: &Path, e: std::io::Error| MirrorError::WriteFailed {
        path: target.display().to_string(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
    }
    std::fs::write(path, contents).map_err(|e| write_failed(path, e))
}
