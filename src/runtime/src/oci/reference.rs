//! OCI image reference parsing.
//!
//! Parses catalog image paths like `docker.io/minio/minio` or
//! `nginx:1.27.3` into registry, repository and tag.

use imirror_core::error::{MirrorError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "docker.io", "ghcr.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "minio/minio")
    pub repository: String,
    /// Tag (e.g., "latest", "8.16.0")
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.27` → docker.io/library/nginx:1.27
    /// - `minio/minio` → docker.io/minio/minio:latest
    /// - `registry.local:5000/team/app:v1` → registry.local:5000/team/app:v1
    ///
    /// Digests are not accepted; mirrored images are always addressed by tag.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MirrorError::ConfigError(
                "Empty image reference".to_string(),
            ));
        }
        if reference.contains('@') {
            return Err(MirrorError::ConfigError(format!(
                "Digest references are not supported: '{}'",
                reference
            )));
        }

        // The tag separator is the last colon after the last slash; a colon
        // before any slash is a registry port.
        let tail_start = reference.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (name, tag) = match reference[tail_start..].rfind(':') {
            Some(colon) => {
                let colon = tail_start + colon;
                (&reference[..colon], Some(&reference[colon + 1..]))
            }
            None => (reference, None),
        };

        if tag.is_some_and(|t| t.is_empty()) {
            return Err(MirrorError::ConfigError(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name)?;

        Ok(ImageReference {
            registry,
            repository,
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry when it looks like a hostname
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = &name[slash_pos + 1..];
                if repo.is_empty() {
                    return Err(MirrorError::ConfigError(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                let registry = normalize_registry(first);
                let repo = if registry == DEFAULT_REGISTRY && !repo.contains('/') {
                    format!("library/{}", repo)
                } else {
                    repo.to_string()
                };
                return Ok((registry, repo));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// `registry/repository` without tag.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

fn normalize_registry(host: &str) -> String {
    match host {
        "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("nginx:1.27.3").unwrap();
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "1.27.3");
    }

    #[test]
    fn test_parse_catalog_path() {
        let r = ImageReference::parse("docker.io/minio/minio:RELEASE.2024-12-18T13-15-44Z").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "minio/minio");
        assert_eq!(r.tag, "RELEASE.2024-12-18T13-15-44Z");
    }

    #[test]
    fn test_parse_explicit_hub_official_image() {
        let r = ImageReference::parse("docker.io/redis").unwrap();
        assert_eq!(r.repository, "library/redis");
    }

    #[test]
    fn test_parse_registry_alias() {
        let r = ImageReference::parse("registry-1.docker.io/library/redis:7").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.name(), "docker.io/library/redis");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("myregistry.io:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "myregistry.io:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_rejects_empty_and_digest() {
        assert!(ImageReference::parse("  ").is_err());
        assert!(ImageReference::parse("nginx@sha256:abc").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
    }

    #[test]
    fn test_default_tag_and_display() {
        let r = ImageReference::parse("docker.io/library/elasticsearch").unwrap();
        assert_eq!(r.tag, "latest");
        assert_eq!(r.to_string(), "docker.io/library/elasticsearch:latest");
        assert_eq!(r.name(), "docker.io/library/elasticsearch");
    }
}
