//! OCI image data model.
//!
//! Serde models for the content-addressed objects the daemon reads and
//! writes: descriptors, manifests, indexes, and image configs. Unknown
//! fields are preserved through deserialize/serialize round trips so that
//! mutating one field of a config does not discard history or timestamps
//! written by other tools.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::constants::{
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_INDEX,
    MEDIA_TYPE_MANIFEST,
};
use crate::platform::OciPlatform;

/// A content descriptor: media type, digest, and size of a blob, with
/// optional platform metadata and annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<OciPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Creates a descriptor for a blob of the given media type.
    pub fn for_blob(media_type: &str, data: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest_bytes(data),
            size: data.len() as i64,
            platform: None,
            annotations: None,
        }
    }
}

/// An OCI image manifest: one config blob plus an ordered list of layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// An OCI image index: the multi-platform list of per-platform manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Index {
    /// Creates an index containing the given manifest descriptors.
    pub fn new(media_type: &str, manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_type.to_string()),
            manifests,
            extra: BTreeMap::new(),
        }
    }
}

/// An OCI image config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageConfig {
    /// Returns the platform declared by the config.
    ///
    /// Registries sometimes ship index entries without platform metadata;
    /// the config blob is the authoritative fallback.
    pub fn platform(&self) -> OciPlatform {
        OciPlatform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
    }
}

/// The runtime section of an image config.
///
/// OCI serializes these fields with capitalized keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The rootfs section of an image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

/// Computes the sha256 digest of a byte slice in OCI notation.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Returns true for media types that denote an image index.
pub fn is_index_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns true for media types that denote an image manifest.
pub fn is_manifest_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MEDIA_TYPE_CONFIG;

    #[test]
    fn descriptor_digest_matches_content() {
        let desc = Descriptor::for_blob(MEDIA_TYPE_CONFIG, b"{}");
        assert_eq!(desc.size, 2);
        assert!(desc.digest.starts_with("sha256:"));
        assert_eq!(desc.digest, digest_bytes(b"{}"));
    }

    #[test]
    fn config_round_trip_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2024-01-01T00:00:00Z",
            "config": {"Entrypoint": ["/init"], "Labels": {"a": "b"}},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:abc"]},
            "history": [{"created_by": "layer 0"}]
        });
        let mut config: ImageConfig = serde_json::from_value(raw).unwrap();
        config.rootfs.diff_ids.push("sha256:def".to_string());

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["created"], "2024-01-01T00:00:00Z");
        assert_eq!(out["history"][0]["created_by"], "layer 0");
        assert_eq!(out["config"]["Labels"]["a"], "b");
        assert_eq!(out["rootfs"]["diff_ids"][1], "sha256:def");
    }

    #[test]
    fn config_platform_fallback() {
        let config: ImageConfig = serde_json::from_value(serde_json::json!({
            "architecture": "arm64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []}
        }))
        .unwrap();
        assert_eq!(config.platform().to_string(), "linux/arm64");
    }

    #[test]
    fn media_type_classification() {
        assert!(is_index_type(MEDIA_TYPE_INDEX));
        assert!(is_index_type(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(is_manifest_type(MEDIA_TYPE_MANIFEST));
        assert!(!is_index_type(MEDIA_TYPE_MANIFEST));
        assert!(!is_manifest_type(MEDIA_TYPE_INDEX));
    }
}
