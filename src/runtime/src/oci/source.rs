//! Image sources: pull one architecture of a tagged image into a staging
//! OCI image layout.
//!
//! The layout written by [`OciImageSource`] is what the export worker
//! archives:
//!
//! ```text
//! staging/
//! ├── oci-layout
//! ├── index.json      (manifest descriptor, annotated with the image name)
//! ├── manifest.json   (docker-load index)
//! └── blobs/sha256/   (manifest, config, layers)
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use imirror_core::catalog::Architecture;
use imirror_core::error::{MirrorError, PullFailure, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;

/// Summary of a pulled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    /// Manifest digest of the selected platform
    pub digest: String,
    /// Number of filesystem layers
    pub layers: usize,
    /// Total bytes written to the staging layout
    pub bytes: u64,
}

/// Capability to materialize a tagged image for one architecture.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Pull `reference` for `linux/<arch>` into an OCI image layout at
    /// `target_dir` (which exists and is empty).
    ///
    /// Failures are reported as [`MirrorError::PullFailed`] with a
    /// [`PullFailure`] cause, or [`MirrorError::SaveFailed`] when the
    /// staging directory cannot be written.
    async fn pull(
        &self,
        reference: &ImageReference,
        arch: Architecture,
        target_dir: &Path,
    ) -> Result<PulledImage>;
}

/// Pulls images from OCI registries with `oci-distribution`.
pub struct OciImageSource {
    clients: HashMap<Architecture, Client>,
    auth: RegistryAuth,
}

impl OciImageSource {
    /// Anonymous puller with one client per architecture.
    pub fn new() -> Self {
        let arches = [
            Architecture::Amd64,
            Architecture::Arm64,
            Architecture::Ppc64le,
            Architecture::S390x,
            Architecture::Riscv64,
        ];
        let clients = arches
            .into_iter()
            .map(|arch| {
                let config = ClientConfig {
                    protocol: ClientProtocol::Https,
                    platform_resolver: Some(Box::new(move |manifests: &[ImageIndexEntry]| {
                        resolve_platform(manifests, arch)
                    })),
                    ..Default::default()
                };
                (arch, Client::new(config))
            })
            .collect();

        Self {
            clients,
            auth: RegistryAuth::Anonymous,
        }
    }

    fn client(&self, arch: Architecture) -> Result<&Client> {
        self.clients
            .get(&arch)
            .ok_or_else(|| MirrorError::ConfigError(format!("no client for {}", arch)))
    }

    async fn pull_blob_to(
        &self,
        client: &Client,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
        reference: &ImageReference,
        arch: Architecture,
    ) -> Result<u64> {
        let path = blobs_dir.join(digest_hex(&descriptor.digest));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| staging_failed(reference, &path, e))?;

        client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| pull_failed(reference, arch, &e))?;

        file.flush()
            .await
            .map_err(|e| staging_failed(reference, &path, e))?;

        Ok(descriptor.size.max(0) as u64)
    }
}

impl Default for OciImageSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageSource for OciImageSource {
    async fn pull(
        &self,
        reference: &ImageReference,
        arch: Architecture,
        target_dir: &Path,
    ) -> Result<PulledImage> {
        let oci_ref: Reference = reference.full_reference().parse().map_err(|e| {
            MirrorError::ConfigError(format!("Invalid OCI reference '{}': {}", reference, e))
        })?;
        let client = self.client(arch)?;

        tracing::info!(
            reference = %reference,
            arch = %arch,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| staging_failed(reference, &blobs_dir, e))?;

        // Multi-arch indexes resolve through the per-arch platform resolver
        let (manifest, manifest_digest) = client
            .pull_image_manifest(&oci_ref, &self.auth)
            .await
            .map_err(|e| pull_failed(reference, arch, &e))?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        let manifest_path = blobs_dir.join(digest_hex(&manifest_digest));
        std::fs::write(&manifest_path, &manifest_json)
            .map_err(|e| staging_failed(reference, &manifest_path, e))?;

        let mut bytes = manifest_json.len() as u64;
        bytes += self
            .pull_blob_to(client, &oci_ref, &manifest.config, &blobs_dir, reference, arch)
            .await?;

        // A single-platform manifest skips the resolver; check what we got
        let config_path = blobs_dir.join(digest_hex(&manifest.config.digest));
        check_config_architecture(&config_path, reference, arch)?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            bytes += self
                .pull_blob_to(client, &oci_ref, layer, &blobs_dir, reference, arch)
                .await?;
        }

        write_layout_metadata(
            target_dir,
            reference,
            &manifest,
            &manifest_digest,
            manifest_json.len(),
        )?;

        tracing::info!(
            reference = %reference,
            arch = %arch,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Image pulled"
        );

        Ok(PulledImage {
            digest: manifest_digest,
            layers: manifest.layers.len(),
            bytes,
        })
    }
}

/// Write `oci-layout`, `index.json` and `manifest.json` next to the blobs.
pub fn write_layout_metadata(
    target_dir: &Path,
    reference: &ImageReference,
    manifest: &OciImageManifest,
    manifest_digest: &str,
    manifest_size: usize,
) -> Result<()> {
    let write = |name: &str, contents: String| {
        let path = target_dir.join(name);
        std::fs::write(&path, contents).map_err(|e| staging_failed(reference, &path, e))
    };

    write("oci-layout", r#"{"imageLayoutVersion":"1.0.0"}"#.to_string())?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": manifest
                .media_type
                .clone()
                .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string()),
            "digest": manifest_digest,
            "size": manifest_size,
            "annotations": {
                "io.containerd.image.name": reference.full_reference(),
                "org.opencontainers.image.ref.name": reference.tag,
            }
        }]
    });
    write("index.json", serde_json::to_string_pretty(&index)?)?;

    let blob_path = |digest: &str| format!("blobs/sha256/{}", digest_hex(digest));
    let docker_manifest = serde_json::json!([{
        "Config": blob_path(&manifest.config.digest),
        "RepoTags": [reference.full_reference()],
        "Layers": manifest
            .layers
            .iter()
            .map(|layer| blob_path(&layer.digest))
            .collect::<Vec<_>>(),
    }]);
    write("manifest.json", serde_json::to_string(&docker_manifest)?)?;

    Ok(())
}

/// Pick the `linux/<arch>` entry of an image index.
fn resolve_platform(manifests: &[ImageIndexEntry], arch: Architecture) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch.as_str())
        })
        .map(|entry| entry.digest.clone())
}

fn check_config_architecture(
    config_path: &Path,
    reference: &ImageReference,
    arch: Architecture,
) -> Result<()> {
    let data = std::fs::read(config_path).map_err(|e| staging_failed(reference, config_path, e))?;
    let config: serde_json::Value = serde_json::from_slice(&data)?;
    match config.get("architecture").and_then(|a| a.as_str()) {
        Some(found) if found != arch.as_str() => Err(MirrorError::PullFailed {
            reference: reference.to_string(),
            arch: arch.to_string(),
            cause: PullFailure::TagMissing(format!(
                "image is {} only, no linux/{} variant",
                found, arch
            )),
        }),
        _ => Ok(()),
    }
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn staging_failed(reference: &ImageReference, path: &Path, err: std::io::Error) -> MirrorError {
    MirrorError::SaveFailed {
        reference: reference.to_string(),
        message: format!("failed to write {}: {}", path.display(), err),
    }
}

fn pull_failed(reference: &ImageReference, arch: Architecture, err: &OciDistributionError) -> MirrorError {
    MirrorError::PullFailed {
        reference: reference.to_string(),
        arch: arch.to_string(),
        cause: classify(err),
    }
}

/// Map a distribution error to retry semantics.
fn classify(err: &OciDistributionError) -> PullFailure {
    match err {
        OciDistributionError::ImageManifestNotFoundError(message) => {
            PullFailure::TagMissing(message.clone())
        }
        OciDistributionError::AuthenticationFailure(message) => {
            PullFailure::Denied(message.clone())
        }
        OciDistributionError::UnauthorizedError { url } => {
            PullFailure::Denied(format!("unauthorized: {}", url))
        }
        OciDistributionError::ServerError { code, message, .. } => match *code {
            404 => PullFailure::TagMissing(message.clone()),
            401 | 403 => PullFailure::Denied(message.clone()),
            _ => PullFailure::Transient(format!("{}: {}", code, message)),
        },
        OciDistributionError::RequestError(e) => PullFailure::Transient(e.to_string()),
        other => classify_message(other.to_string()),
    }
}

/// Registry envelopes carry distribution error codes in their message.
fn classify_message(message: String) -> PullFailure {
    let upper = message.to_ascii_uppercase();
    if upper.contains("MANIFEST_UNKNOWN") || upper.contains("NAME_UNKNOWN") {
        PullFailure::TagMissing(message)
    } else if upper.contains("DENIED") || upper.contains("UNAUTHORIZED") {
        PullFailure::Denied(message)
    } else {
        PullFailure::Transient(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(arch: &str, digest: &str) -> ImageIndexEntry {
        serde_json::from_value(serde_json::json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": digest,
            "size": 100,
            "platform": { "architecture": arch, "os": "linux" }
        }))
        .unwrap()
    }

    fn reference() -> ImageReference {
        ImageReference::parse("docker.io/library/redis:7.4.1").unwrap()
    }

    #[test]
    fn test_resolve_platform_by_arch() {
        let manifests = vec![entry("amd64", "sha256:aaa"), entry("arm64", "sha256:bbb")];
        assert_eq!(
            resolve_platform(&manifests, Architecture::Arm64),
            Some("sha256:bbb".to_string())
        );
        assert_eq!(
            resolve_platform(&manifests, Architecture::Amd64),
            Some("sha256:aaa".to_string())
        );
        assert_eq!(resolve_platform(&manifests, Architecture::S390x), None);
    }

    #[test]
    fn test_classify_messages() {
        assert!(matches!(
            classify_message("MANIFEST_UNKNOWN: manifest unknown".to_string()),
            PullFailure::TagMissing(_)
        ));
        assert!(matches!(
            classify_message("denied: requested access to the resource is denied".to_string()),
            PullFailure::Denied(_)
        ));
        assert!(matches!(
            classify_message("connection reset by peer".to_string()),
            PullFailure::Transient(_)
        ));
    }

    #[test]
    fn test_classify_not_found() {
        let err = OciDistributionError::ImageManifestNotFoundError("redis:0.0.0".to_string());
        assert!(matches!(classify(&err), PullFailure::TagMissing(_)));
    }

    #[test]
    fn test_config_architecture_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, r#"{"architecture":"amd64","os":"linux"}"#).unwrap();

        assert!(check_config_architecture(&path, &reference(), Architecture::Amd64).is_ok());
        let err = check_config_architecture(&path, &reference(), Architecture::Arm64).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_write_layout_metadata() {
        let dir = TempDir::new().unwrap();
        let manifest: OciImageManifest = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:cfg",
                "size": 10
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:l1",
                "size": 20
            }]
        }))
        .unwrap();

        write_layout_metadata(dir.path(), &reference(), &manifest, "sha256:man", 42).unwrap();

        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("index.json")).unwrap())
                .unwrap();
        assert_eq!(index["manifests"][0]["digest"], "sha256:man");
        assert_eq!(
            index["manifests"][0]["annotations"]["io.containerd.image.name"],
            "docker.io/library/redis:7.4.1"
        );

        let docker: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(docker[0]["Config"], "blobs/sha256/cfg");
        assert_eq!(docker[0]["Layers"][0], "blobs/sha256/l1");
        assert!(dir.path().join("oci-layout").exists());
    }
}
