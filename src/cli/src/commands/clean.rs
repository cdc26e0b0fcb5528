//! `imirror clean` command: remove run state, logs and optionally images.
//!
//! Never runs implicitly; a run only ever adds to these files.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::Args;
use imirror_core::config::MirrorConfig;
use imirror_core::date::today;
use imirror_runtime::report::{latest_file_name, update_file_name};
use imirror_runtime::store::versions_file_name;

use crate::output;

#[derive(Args)]
pub struct CleanArgs {
    /// Also remove the image output tree and today's version files
    #[arg(short, long)]
    pub all: bool,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

/// Existing paths `clean` would remove.
pub fn clean_targets(config: &MirrorConfig, all: bool, date: NaiveDate) -> Vec<PathBuf> {
    let mut targets = vec![config.paths.state_file(), config.paths.logs_dir.clone()];
    if all {
        let versions = config.paths.versions_dir();
        targets.push(config.export.output_dir.clone());
        targets.push(versions.join(latest_file_name(date)));
        targets.push(versions.join(update_file_name(date)));
        targets.push(versions.join(versions_file_name(date)));
    }
    targets.retain(|path| path.exists());
    targets
}

/// Total size of a file or directory tree.
fn path_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| path_size(&e.path()))
                .sum()
        })
        .unwrap_or(0)
}

fn remove(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

pub async fn execute(
    args: CleanArgs,
    config: MirrorConfig,
) -> Result<i32, Box<dyn std::error::Error>> {
    let targets = clean_targets(&config, args.all, today());
    if targets.is_empty() {
        println!("Nothing to clean.");
        return Ok(0);
    }

    if !args.force {
        println!("WARNING: This will remove:");
        for target in &targets {
            println!("  - {}", target.display());
        }
        println!();
        println!("Use --force to skip this prompt.");
        return Ok(0);
    }

    let mut freed = 0u64;
    let mut failures = 0usize;
    for target in &targets {
        let size = path_size(target);
        match remove(target) {
            Ok(()) => {
                freed += size;
                tracing::info!(path = %target.display(), "Removed");
                println!("Removed {}", target.display());
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(path = %target.display(), error = %e, "Failed to remove");
                eprintln!("Failed to remove {}: {e}", target.display());
            }
        }
    }

    println!();
    println!("Freed {}", output::format_bytes(freed));
    Ok(if failures > 0 { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(root: &Path) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.paths.data_dir = root.join("data");
        config.paths.logs_dir = root.join("logs");
        config.export.output_dir = root.join("images");
        config
    }

    fn touch(path: &Path, bytes: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_targets_only_existing() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let date = NaiveDate::from_ymd_opt(2024, 12, 2).unwrap();
        assert!(clean_targets(&config, true, date).is_empty());

        touch(&config.paths.state_file(), 10);
        assert_eq!(clean_targets(&config, false, date), vec![config.paths.state_file()]);
    }

    #[test]
    fn test_all_includes_images_and_today_files() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let date = NaiveDate::from_ymd_opt(2024, 12, 2).unwrap();
        let versions = config.paths.versions_dir();

        touch(&config.paths.logs_dir.join("imirror_20241202.log"), 10);
        touch(&config.export.output_dir.join("20241202/AMD64/a.tar.gz"), 10);
        touch(&versions.join("latest-20241202.txt"), 1);
        touch(&versions.join("versions-20241202.json"), 1);
        touch(&versions.join("versions-20241201.json"), 1);

        let basic = clean_targets(&config, false, date);
        assert_eq!(basic, vec![config.paths.logs_dir.clone()]);

        let all = clean_targets(&config, true, date);
        assert_eq!(all.len(), 4);
        assert!(all.contains(&config.export.output_dir));
        assert!(all.contains(&versions.join("versions-20241202.json")));
        assert!(!all.contains(&versions.join("versions-20241201.json")));
    }

    #[test]
    fn test_path_size_and_remove() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        touch(&tree.join("a"), 100);
        touch(&tree.join("b/c"), 50);
        assert_eq!(path_size(&tree), 150);

        remove(&tree).unwrap();
        assert!(!tree.exists());
    }
}
