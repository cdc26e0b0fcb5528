use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::catalog::{default_catalog, Component};
use crate::error::{MirrorError, Result};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "imirror.yaml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    /// Registry endpoint and tag listing
    pub registry: RegistryConfig,

    /// Export pool and output layout
    pub export: ExportConfig,

    /// Backoff for registry calls and pulls
    pub retry: RetryConfig,

    /// Data, state and log locations
    pub paths: PathsConfig,

    /// The component catalog
    pub components: Vec<Component>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            export: ExportConfig::default(),
            retry: RetryConfig::default(),
            paths: PathsConfig::default(),
            components: default_catalog(),
        }
    }
}

impl MirrorConfig {
    /// Parse a YAML document. Missing sections fall back to defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&data).map_err(|e| {
            MirrorError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load `path` if given, else `imirror.yaml` when present, else defaults.
    /// Environment overrides are applied afterwards.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `IMIRROR_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value.trim().parse().map_err(|_| {
                MirrorError::ConfigError(format!("{} must be a number, got '{}'", key, value))
            })
        }

        if let Some(value) = lookup("IMIRROR_OUTPUT_DIR") {
            self.export.output_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("IMIRROR_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("IMIRROR_CONCURRENCY") {
            self.export.concurrency = number("IMIRROR_CONCURRENCY", value)?;
        }
        if let Some(value) = lookup("IMIRROR_HUB_URL") {
            self.registry.hub_api_url = value;
        }
        if let Some(value) = lookup("IMIRROR_TIMEOUT_SECS") {
            self.registry.timeout_secs = number("IMIRROR_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = lookup("IMIRROR_MAX_RETRIES") {
            self.retry.max_attempts = number("IMIRROR_MAX_RETRIES", value)?;
        }
        Ok(())
    }

    /// Startup checks. Failing here is the only fatal configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(MirrorError::ConfigError(
                "component catalog is empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() || component.image.trim().is_empty() {
                return Err(MirrorError::ConfigError(
                    "component name and image must not be empty".to_string(),
                ));
            }
            if component.name.contains(['/', '\\', '_', '@']) {
                return Err(MirrorError::ConfigError(format!(
                    "component name '{}' must not contain '/', '\\', '_' or '@'",
                    component.name
                )));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(MirrorError::ConfigError(format!(
                    "duplicate component '{}'",
                    component.name
                )));
            }
            if component.architectures.is_empty() {
                return Err(MirrorError::ConfigError(format!(
                    "component '{}' has no architectures",
                    component.name
                )));
            }
            let mut arches = HashSet::new();
            for arch in &component.architectures {
                if !arches.insert(arch) {
                    return Err(MirrorError::ConfigError(format!(
                        "component '{}' lists architecture '{}' more than once",
                        component.name, arch
                    )));
                }
            }
            component.policy.compile()?;
        }

        if self.registry.page_size == 0 || self.registry.max_pages == 0 {
            return Err(MirrorError::ConfigError(
                "registry page_size and max_pages must be at least 1".to_string(),
            ));
        }
        if self.export.concurrency == 0 || self.registry.concurrency == 0 {
            return Err(MirrorError::ConfigError(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.export.output_dir.as_os_str().is_empty() {
            return Err(MirrorError::ConfigError(
                "output directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Docker Hub API base URL
    pub hub_api_url: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Tags per listing page
    pub page_size: u32,

    /// Upper bound on listing pages fetched per repository
    pub max_pages: u32,

    /// Components resolved in parallel
    pub concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hub_api_url: "https://hub.docker.com/v2".to_string(),
            timeout_secs: 30,
            page_size: 100,
            max_pages: 100,
            concurrency: 4,
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// Export workers running at once
    pub concurrency: usize,

    /// Root of the dated archive tree
    pub output_dir: PathBuf,

    /// Timeout for a single image pull in seconds
    pub pull_timeout_secs: u64,

    /// Replace a same-day archive of a different version
    pub overwrite: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            output_dir: PathBuf::from("data/images"),
            pull_timeout_secs: 300,
            overwrite: false,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per call, including the first
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Data locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Holds `versions/` and the progress file
    pub data_dir: PathBuf,

    /// Dated log files
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    /// Directory of dated version, latest and update files.
    pub fn versions_dir(&self) -> PathBuf {
        self.data_dir.join("versions")
    }

    /// Progress record for resume.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}
