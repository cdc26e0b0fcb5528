//! Persistent run state: dated version records and same-day progress.

pub mod progress;
pub mod versions;

pub use progress::{FileProgressStore, MemoryProgressStore, ProgressStore};
pub use versions::{
    versions_file_name, FileVersionStore, LastKnown, MemoryVersionStore, VariantKey, VersionStore,
};

use std::path::Path;

use imirror_core::error::{MirrorError, Result};

/// Write `contents` to `path` atomically: write a sibling tmp file, then rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let write_failed = |target: &Path, e: std::io::Error| MirrorError::WriteFailed {
        path: target.display().to_string(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
        }
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents).map_err(|e| write_failed(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        write_failed(path, e)
    })
}
