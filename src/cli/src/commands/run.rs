//! `imirror run` command.

use clap::Args;
use imirror_core::config::MirrorConfig;
use imirror_core::date::{parse_stamp, today};
use imirror_runtime::{Pipeline, RunContext, RunSummary};

use crate::output;

#[derive(Args)]
pub struct RunArgs {
    /// Export workers running at once
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Replace a same-day archive of a different version
    #[arg(long)]
    pub overwrite: bool,

    /// Run date (YYYYMMDD), defaults to today
    #[arg(long, value_name = "YYYYMMDD")]
    pub date: Option<String>,

    /// Resolve and plan only; write the update list but export nothing
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(
    args: RunArgs,
    mut config: MirrorConfig,
) -> Result<i32, Box<dyn std::error::Error>> {
    if let Some(concurrency) = args.concurrency {
        config.export.concurrency = concurrency;
    }
    if args.overwrite {
        config.export.overwrite = true;
    }
    let date = match args.date.as_deref() {
        Some(stamp) => parse_stamp(stamp)?,
        None => today(),
    };

    let ctx = RunContext::from_config(config, date)?;

    // Ctrl-C stops new exports; in-flight ones clean up and the run reports
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight exports");
            cancel.cancel();
        }
    });

    let pipeline = Pipeline::new(ctx);
    let summary = if args.dry_run {
        pipeline.plan_only().await?
    } else {
        pipeline.run().await?
    };

    if args.dry_run {
        print_plan(&summary);
    } else {
        print_report(&summary);
    }
    print_resolution_failures(&summary);

    Ok(summary.exit_code())
}

fn print_plan(summary: &RunSummary) {
    if summary.planned.is_empty() {
        println!("Everything is up to date.");
        return;
    }

    let mut table = output::new_table(&["COMPONENT", "ARCH", "VERSION", "PREVIOUS", "DESTINATION"]);
    for item in &summary.planned {
        table.add_row(&[
            item.key.component.clone(),
            item.key.arch.to_string(),
            item.key.version.clone(),
            item.previous.clone().unwrap_or_else(|| "-".to_string()),
            item.destination.display().to_string(),
        ]);
    }
    println!("{table}");
    println!();
    println!("{} export(s) planned", summary.planned.len());
}

fn print_report(summary: &RunSummary) {
    let rows = output::report_rows(&summary.report);
    if rows.is_empty() {
        println!("Everything is up to date.");
        return;
    }

    let mut table = output::new_table(&["COMPONENT", "ARCH", "VERSION", "STATE", "DETAIL"]);
    for row in &rows {
        table.add_row(row);
    }
    println!("{table}");
    println!();
    println!(
        "{} done, {} failed, {} skipped, {} cancelled",
        summary.report.done().len(),
        summary.report.failed().len(),
        summary.report.skipped().len(),
        summary.report.cancelled.len()
    );
}

fn print_resolution_failures(summary: &RunSummary) {
    if summary.resolution_failures.is_empty() {
        return;
    }

    let mut table = output::new_table(&["COMPONENT", "KIND", "MESSAGE"]);
    for failure in &summary.resolution_failures {
        table.add_row(&[&failure.component, &failure.kind, &failure.message]);
    }
    println!();
    println!("Version resolution problems:");
    println!("{table}");
}
