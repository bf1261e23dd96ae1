//! Registry pulls for the local engine.
//!
//! Pulls a remote reference into the content store: the manifest is
//! resolved for the target platform (walking an image index when the
//! reference is multi-platform), then the config and layer blobs are
//! downloaded and stored content-addressed.

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, info};

use crate::constants::MEDIA_TYPE_MANIFEST;
use crate::engine::ImageRecord;
use crate::error::{Error, Result};
use crate::oci::{Descriptor, Manifest, digest_bytes};
use crate::platform::OciPlatform;
use crate::storage::BlobStore;

/// Pulls `reference` for `platform`, storing all blobs, and returns the
/// image record pointing at the stored manifest.
pub(crate) async fn pull(
    reference: &str,
    platform: &OciPlatform,
    store: &BlobStore,
) -> Result<ImageRecord> {
    validate_reference(reference)?;

    info!("pulling image {} for platform {}", reference, platform);

    let parsed: Reference = reference
        .parse()
        .map_err(|e| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: format!("{e}"),
        })?;

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let (manifest, _digest) = client
        .pull_manifest(&parsed, &auth)
        .await
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;

    let image = resolve_manifest(&client, &parsed, &auth, manifest, platform, reference).await?;

    // Config blob.
    let mut config_data = Vec::new();
    client
        .pull_blob(&parsed, &image.config, &mut config_data)
        .await
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: format!("failed to pull config: {e}"),
        })?;
    store.put_blob(&image.config.digest, &config_data)?;

    // Layer blobs, skipping anything already cached.
    for layer in &image.layers {
        if store.has_blob(&layer.digest) {
            debug!("layer {} already cached", layer.digest);
            continue;
        }
        let mut data = Vec::new();
        client
            .pull_blob(&parsed, layer, &mut data)
            .await
            .map_err(|e| Error::LayerExtractionFailed {
                digest: layer.digest.clone(),
                reason: e.to_string(),
            })?;
        store.put_blob(&layer.digest, &data)?;
    }

    // Store the platform-resolved manifest and point the record at it.
    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
        config: convert_descriptor(&image.config),
        layers: image.layers.iter().map(convert_descriptor).collect(),
        extra: Default::default(),
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let digest = digest_bytes(&manifest_bytes);
    store.put_blob(&digest, &manifest_bytes)?;

    Ok(ImageRecord {
        name: reference.to_string(),
        target: Descriptor {
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            digest,
            size: manifest_bytes.len() as i64,
            platform: Some(platform.clone()),
            annotations: None,
        },
    })
}

/// Resolves a pulled manifest to a single-platform image manifest, walking
/// an image index when necessary.
async fn resolve_manifest(
    client: &Client,
    parsed: &Reference,
    auth: &RegistryAuth,
    manifest: oci_distribution::manifest::OciManifest,
    platform: &OciPlatform,
    reference: &str,
) -> Result<oci_distribution::manifest::OciImageManifest> {
    match manifest {
        oci_distribution::manifest::OciManifest::Image(img) => Ok(img),

        oci_distribution::manifest::OciManifest::ImageIndex(index) => {
            let matching = index.manifests.iter().find(|m| {
                m.platform.as_ref().is_some_and(|p| {
                    p.os == platform.os
                        && p.architecture == platform.architecture
                        && p.variant == platform.variant
                })
            });

            let entry = matching.ok_or_else(|| {
                let available: Vec<String> = index
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: format!(
                        "no manifest for {platform}, available: {}",
                        available.join(", ")
                    ),
                }
            })?;

            let digest_ref: Reference = format!(
                "{}/{}@{}",
                parsed.registry(),
                parsed.repository(),
                entry.digest
            )
            .parse()
            .map_err(|e| Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: format!("failed to build digest reference: {e}"),
            })?;

            let (platform_manifest, _) = client
                .pull_manifest(&digest_ref, auth)
                .await
                .map_err(|e| Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: format!("failed to pull platform manifest: {e}"),
                })?;

            match platform_manifest {
                oci_distribution::manifest::OciManifest::Image(img) => Ok(img),
                _ => Err(Error::ImagePullFailed {
                    reference: reference.to_string(),
                    reason: "nested image index not supported".to_string(),
                }),
            }
        }
    }
}

fn convert_descriptor(desc: &oci_distribution::manifest::OciDescriptor) -> Descriptor {
    Descriptor {
        media_type: desc.media_type.clone(),
        digest: desc.digest.clone(),
        size: desc.size,
        platform: None,
        annotations: None,
    }
}

/// Validates an image reference before handing it to the registry client.
fn validate_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if !reference.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || c == '/'
            || c == ':'
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '@'
    }) {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reference_rejects_empty() {
        assert!(validate_reference("").is_err());
    }

    #[test]
    fn validate_reference_rejects_invalid_characters() {
        assert!(validate_reference("nginx latest").is_err());
        assert!(validate_reference("nginx;rm -rf").is_err());
    }

    #[test]
    fn validate_reference_accepts_common_forms() {
        assert!(validate_reference("nginx:1.25").is_ok());
        assert!(validate_reference("ghcr.io/foo/bar:latest").is_ok());
        assert!(validate_reference("registry.example.com:5000/image@sha256:abc123").is_ok());
    }
}
