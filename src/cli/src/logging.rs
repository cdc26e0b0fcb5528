//! Tracing setup: human or JSON events on stderr, mirrored to a dated file
//! under the logs directory.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use clap::ValueEnum;
use imirror_core::date::{stamp, today};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a tracing filter directive.
pub const LOG_ENV: &str = "IMIRROR_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `imirror_<YYYYMMDD>.log`
pub fn log_file_name(date: NaiveDate) -> String {
    format!("imirror_{}.log", stamp(date))
}

/// Default filter directive when `IMIRROR_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. Returns the log file path.
pub fn init(
    format: LogFormat,
    debug: bool,
    logs_dir: &Path,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    std::fs::create_dir_all(logs_dir)?;
    let path = logs_dir.join(log_file_name(today()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let file = Mutex::new(file);

    let json = format == LogFormat::Json;
    let (text_file, json_file) = if json { (None, Some(file)) } else { (Some(file), None) };

    tracing_subscriber::registry()
        .with(filter)
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with(text_file.map(|file| fmt::layer().with_ansi(false).with_writer(file)))
        .with(json_file.map(|file| fmt::layer().json().with_writer(file)))
        .try_init()?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 2).unwrap();
        assert_eq!(log_file_name(date), "imirror_20241202.log");
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
    }
}
