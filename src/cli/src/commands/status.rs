//! `imirror status` command.

use clap::Args;
use imirror_core::config::MirrorConfig;
use imirror_core::date::today;
use imirror_core::work::track_component;
use imirror_runtime::{FileProgressStore, FileVersionStore, ProgressStore, VersionStore};

use crate::output;

#[derive(Args)]
pub struct StatusArgs {
    /// Print records as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: StatusArgs,
    config: MirrorConfig,
) -> Result<i32, Box<dyn std::error::Error>> {
    let store = FileVersionStore::new(config.paths.versions_dir());
    let mut records: Vec<_> = store.latest_known()?.into_values().collect();

    // Catalog order first, then anything no longer in the catalog; major
    // lines of one component ascending
    let position = |track: &str| {
        let name = track_component(track);
        let index = config
            .components
            .iter()
            .position(|c| c.name == name)
            .unwrap_or(usize::MAX);
        let line = track
            .split_once('@')
            .and_then(|(_, major)| major.parse::<u64>().ok());
        (index, name.to_string(), line)
    };
    records.sort_by(|a, b| {
        position(&a.component)
            .cmp(&position(&b.component))
            .then_with(|| a.arch.cmp(&b.arch))
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(0);
    }

    let mut table = output::new_table(&["COMPONENT", "ARCH", "VERSION", "RECORDED"]);
    for record in &records {
        table.add_row(&[
            record.component.clone(),
            record.arch.to_string(),
            record.version.clone(),
            record.date.format("%Y-%m-%d").to_string(),
        ]);
    }
    println!("{table}");

    let progress = FileProgressStore::new(config.paths.state_file());
    match progress.load(today()) {
        Ok(done) if !done.is_empty() => {
            println!();
            println!("{} export(s) completed today", done.len());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Progress file unreadable"),
    }

    Ok(0)
}
