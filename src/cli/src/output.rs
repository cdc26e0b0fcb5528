//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};
use imirror_core::catalog::{FilterPolicy, TagRule};
use imirror_core::work::{Outcome, Report};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Short human description of a filter rule.
pub fn describe_rule(rule: &TagRule) -> String {
    match rule {
        TagRule::Match { pattern } => format!("match /{pattern}/"),
        TagRule::Exclude { pattern } => format!("exclude /{pattern}/"),
        TagRule::ExcludePrerelease => "no pre-releases".to_string(),
        TagRule::PinMajor { major } => format!("major {major}"),
        TagRule::AllowList { tags } => format!("only {}", tags.join(", ")),
        TagRule::RequireSuffix { suffix } => format!("suffix {suffix}"),
    }
}

/// All rules of a policy, `; ` separated, `-` when there are none.
pub fn describe_policy(policy: &FilterPolicy) -> String {
    let mut parts: Vec<String> = policy.rules.iter().map(describe_rule).collect();
    if let Some(prefix) = &policy.strip_prefix {
        parts.push(format!("strip '{prefix}'"));
    }
    if policy.allow_non_semantic {
        parts.push("non-semantic fallback".to_string());
    }
    if policy.track_majors {
        parts.push("each major line".to_string());
    }
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join("; ")
    }
}

/// COMPONENT, ARCH, VERSION, STATE, DETAIL rows for a report, cancelled
/// items last.
pub fn report_rows(report: &Report) -> Vec<[String; 5]> {
    let mut rows: Vec<[String; 5]> = report
        .entries
        .iter()
        .map(|entry| {
            let detail = match &entry.outcome {
                Outcome::Done { path, resumed: true, .. } => {
                    format!("{} (earlier run)", path.display())
                }
                Outcome::Done { path, reused: true, .. } => {
                    format!("{} (already present)", path.display())
                }
                Outcome::Done { path, .. } => path.display().to_string(),
                Outcome::Failed { kind, message } => format!("{kind}: {message}"),
                Outcome::Skipped { reason } => reason.clone(),
            };
            [
                entry.key.component.clone(),
                entry.key.arch.to_string(),
                entry.key.version.clone(),
                entry.outcome.state().to_string(),
                detail,
            ]
        })
        .collect();

    rows.extend(report.cancelled.iter().map(|key| {
        [
            key.component.clone(),
            key.arch.to_string(),
            key.version.clone(),
            "cancelled".to_string(),
            "not finished".to_string(),
        ]
    }));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use imirror_core::catalog::Architecture;
    use imirror_core::work::WorkKey;
    use std::path::PathBuf;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_describe_policy() {
        assert_eq!(describe_policy(&FilterPolicy::default()), "-");

        let policy = FilterPolicy {
            rules: vec![TagRule::ExcludePrerelease, TagRule::PinMajor { major: 8 }],
            strip_prefix: Some("v".to_string()),
            allow_non_semantic: true,
            track_majors: false,
        };
        assert_eq!(
            describe_policy(&policy),
            "no pre-releases; major 8; strip 'v'; non-semantic fallback"
        );

        let lines = FilterPolicy {
            track_majors: true,
            ..Default::default()
        };
        assert_eq!(describe_policy(&lines), "each major line");
    }

    #[test]
    fn test_report_rows() {
        let mut report = Report::default();
        report.record(
            WorkKey::new("redis", Architecture::Amd64, "7.4.1"),
            Outcome::Done {
                path: PathBuf::from("out/r.tar.gz"),
                reused: false,
                resumed: true,
            },
        );
        report.record(
            WorkKey::new("nginx", Architecture::Arm64, "1.27.3"),
            Outcome::Failed {
                kind: "PullFailed".to_string(),
                message: "timeout".to_string(),
            },
        );
        report
            .cancelled
            .push(WorkKey::new("mysql", Architecture::Amd64, "9.1.0"));

        let rows = report_rows(&report);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][3], "done");
        assert_eq!(rows[0][4], "out/r.tar.gz (earlier run)");
        assert_eq!(rows[1][4], "PullFailed: timeout");
        assert_eq!(rows[2][3], "cancelled");
    }
}
