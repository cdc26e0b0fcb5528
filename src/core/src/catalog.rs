//! Component catalog and tag filter policies.
//!
//! A [`Component`] is one mirrored image: its registry path, the
//! architectures to export, and a [`FilterPolicy`] deciding which of the
//! registry's tags count as candidate versions. The catalog is fixed at
//! process start and never mutated during a run.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::version::Version;

/// Target CPU platform for an exported image variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
    Ppc64le,
    S390x,
    Riscv64,
}

impl Architecture {
    /// Name as used by registries and in archive file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Ppc64le => "ppc64le",
            Architecture::S390x => "s390x",
            Architecture::Riscv64 => "riscv64",
        }
    }

    /// Name of the per-architecture output directory (`AMD64`).
    pub fn dir_name(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "ppc64le" => Ok(Architecture::Ppc64le),
            "s390x" => Ok(Architecture::S390x),
            "riscv64" => Ok(Architecture::Riscv64),
            other => Err(MirrorError::ConfigError(format!(
                "unknown architecture '{}'",
                other
            ))),
        }
    }
}

/// A single tag filter rule. Every rule of a policy must accept a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagRule {
    /// Tag must match the regex
    Match { pattern: String },
    /// Tag must not match the regex
    Exclude { pattern: String },
    /// Reject alpha/beta/rc style tags
    ExcludePrerelease,
    /// Only versions with this major number
    PinMajor { major: u64 },
    /// Only these exact tags
    AllowList { tags: Vec<String> },
    /// Tag must end with this suffix
    RequireSuffix { suffix: String },
}

/// Per-component rules for picking candidate tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterPolicy {
    /// Rules applied to the raw tag (all must accept)
    #[serde(default)]
    pub rules: Vec<TagRule>,

    /// Literal prefix removed before version parsing (e.g. `RELEASE.`)
    #[serde(default)]
    pub strip_prefix: Option<String>,

    /// Allow non-semantic tags as a fallback when no semantic tag qualifies
    #[serde(default)]
    pub allow_non_semantic: bool,

    /// Track the latest version of every major line instead of one overall
    #[serde(default)]
    pub track_majors: bool,
}

impl FilterPolicy {
    /// Compile the regex rules once for repeated evaluation.
    pub fn compile(&self) -> Result<TagFilter> {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                Ok(match rule {
                    TagRule::Match { pattern } => CompiledRule::Match(compile_regex(pattern)?),
                    TagRule::Exclude { pattern } => CompiledRule::Exclude(compile_regex(pattern)?),
                    TagRule::ExcludePrerelease => CompiledRule::ExcludePrerelease,
                    TagRule::PinMajor { major } => CompiledRule::PinMajor(*major),
                    TagRule::AllowList { tags } => CompiledRule::AllowList(tags.clone()),
                    TagRule::RequireSuffix { suffix } => CompiledRule::RequireSuffix(suffix.clone()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TagFilter {
            rules,
            strip_prefix: self.strip_prefix.clone(),
            allow_non_semantic: self.allow_non_semantic,
            track_majors: self.track_majors,
        })
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| MirrorError::ConfigError(format!("invalid tag pattern '{}': {}", pattern, e)))
}

#[derive(Debug, Clone)]
enum CompiledRule {
    Match(Regex),
    Exclude(Regex),
    ExcludePrerelease,
    PinMajor(u64),
    AllowList(Vec<String>),
    RequireSuffix(String),
}

/// Compiled form of a [`FilterPolicy`]. The default accepts every tag and
/// orders versions as written.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    rules: Vec<CompiledRule>,
    strip_prefix: Option<String>,
    allow_non_semantic: bool,
    track_majors: bool,
}

impl TagFilter {
    /// Version of a tag as seen by this policy (prefix stripped).
    pub fn version_of(&self, tag: &str) -> Version {
        let body = self
            .strip_prefix
            .as_deref()
            .and_then(|prefix| tag.strip_prefix(prefix))
            .unwrap_or(tag);
        Version::parse(body)
    }

    /// Whether every rule accepts the tag.
    pub fn accepts(&self, tag: &str) -> bool {
        let version = self.version_of(tag);
        self.rules.iter().all(|rule| match rule {
            CompiledRule::Match(re) => re.is_match(tag),
            CompiledRule::Exclude(re) => !re.is_match(tag),
            CompiledRule::ExcludePrerelease => !version.is_prerelease(),
            CompiledRule::PinMajor(major) => version.major() == Some(*major),
            CompiledRule::AllowList(tags) => tags.iter().any(|t| t == tag),
            CompiledRule::RequireSuffix(suffix) => tag.ends_with(suffix.as_str()),
        })
    }

    pub fn allow_non_semantic(&self) -> bool {
        self.allow_non_semantic
    }

    pub fn tracks_majors(&self) -> bool {
        self.track_majors
    }

    /// Major line a tag belongs to when every major is tracked separately.
    /// `None` for components tracking a single latest version, and for
    /// tags without a numeric major.
    pub fn line_of(&self, tag: &str) -> Option<u64> {
        if self.track_majors {
            self.version_of(tag).major()
        } else {
            None
        }
    }
}

/// Compiled filters of a whole catalog, by component name.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilters {
    filters: HashMap<String, TagFilter>,
    plain: TagFilter,
}

impl CatalogFilters {
    pub fn compile(catalog: &[Component]) -> Result<Self> {
        let filters = catalog
            .iter()
            .map(|component| Ok((component.name.clone(), component.policy.compile()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self {
            filters,
            plain: TagFilter::default(),
        })
    }

    /// Filter of `component`; names outside the catalog get the default
    /// ordering.
    pub fn get(&self, component: &str) -> &TagFilter {
        self.filters.get(component).unwrap_or(&self.plain)
    }
}

fn default_architectures() -> Vec<Architecture> {
    vec![Architecture::Amd64, Architecture::Arm64]
}

/// A mirrored software item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Component {
    /// Short name used in archive file names (e.g. "elasticsearch")
    pub name: String,

    /// Full image path (e.g. "docker.io/library/elasticsearch")
    pub image: String,

    /// Architectures to export, in export order
    #[serde(default = "default_architectures")]
    pub architectures: Vec<Architecture>,

    /// Tag filter policy
    #[serde(default)]
    pub policy: FilterPolicy,
}

impl Component {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            architectures: default_architectures(),
            policy: FilterPolicy::default(),
        }
    }

    pub fn with_architectures(mut self, architectures: Vec<Architecture>) -> Self {
        self.architectures = architectures;
        self
    }

    pub fn with_rule(mut self, rule: TagRule) -> Self {
        self.policy.rules.push(rule);
        self
    }

    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.policy.strip_prefix = Some(prefix.into());
        self
    }

    pub fn allowing_non_semantic(mut self) -> Self {
        self.policy.allow_non_semantic = true;
        self
    }

    pub fn tracking_majors(mut self) -> Self {
        self.policy.track_majors = true;
        self
    }

    /// Target architectures in configured order, each once.
    pub fn unique_architectures(&self) -> Vec<Architecture> {
        let mut unique = Vec::with_capacity(self.architectures.len());
        for &arch in &self.architectures {
            if !unique.contains(&arch) {
                unique.push(arch);
            }
        }
        unique
    }

    /// `image:tag` reference for a version of this component.
    pub fn reference(&self, version: &str) -> String {
        format!("{}:{}", self.image, version)
    }
}

/// The middleware catalog shipped by default.
pub fn default_catalog() -> Vec<Component> {
    let numeric = || TagRule::Match {
        pattern: r"^\d+\.\d+\.\d+$".to_string(),
    };

    vec![
        Component::new("elasticsearch", "docker.io/library/elasticsearch").with_rule(numeric()),
        Component::new("minio", "docker.io/minio/minio")
            .with_rule(TagRule::Match {
                pattern: r"^RELEASE\.\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}Z$".to_string(),
            })
            .with_rule(TagRule::Exclude {
                pattern: r"(\.fips|-cpuv1)$".to_string(),
            })
            .with_strip_prefix("RELEASE."),
        Component::new("nacos", "docker.io/nacos/nacos-server")
            .with_rule(TagRule::Match {
                pattern: r"^v\d+\.\d+\.\d+$".to_string(),
            })
            .with_rule(TagRule::Exclude {
                pattern: r"-slim$".to_string(),
            }),
        Component::new("nginx", "docker.io/library/nginx").with_rule(numeric()),
        Component::new("rabbitmq", "docker.io/library/rabbitmq")
            .with_rule(TagRule::Match {
                pattern: r"^\d+\.\d+\.\d+-management-alpine$".to_string(),
            })
            .with_rule(TagRule::ExcludePrerelease),
        Component::new("redis", "docker.io/library/redis").with_rule(numeric()),
        Component::new("geoserver", "docker.io/kartoza/geoserver").with_rule(numeric()),
        Component::new("postgresql-postgis", "docker.io/freelabspace/postgresql-postgis")
            .with_rule(TagRule::Match {
                pattern: r"^\d+\.\d+$".to_string(),
            })
            .with_rule(TagRule::Exclude {
                pattern: r"^buildcache-".to_string(),
            })
            .tracking_majors(),
    ]
}
