//! Commit and export of a container's filesystem changes.
//!
//! The export pipeline materialises a container's snapshot diff as a new
//! layer, grafts it onto the base image's manifest and config, and writes
//! the result as an OCI archive. The mutated manifest, config, and index
//! are ephemeral blobs: they are written under a content lease, carry
//! reachability labels for their children, and are never linked to a stored
//! image name. The persistent image record is left untouched.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use crate::constants::{
    EXPORT_FILENAME, GC_LABEL_CONFIG, GC_LABEL_LAYER_PREFIX, GC_LABEL_MANIFEST_PREFIX,
};
use crate::container::Container;
use crate::engine::ImageRecord;
use crate::error::{Error, Result};
use crate::oci::{self, Descriptor, ImageConfig, Index, Manifest, digest_bytes};

impl Container {
    /// Commits the container's filesystem changes and exports the result as
    /// an OCI archive at `<output>/image.tar`.
    ///
    /// The diff between the container's snapshot and its parent is stored
    /// as a new layer. A non-empty entrypoint overrides the image config's
    /// entrypoint and clears its cmd. The stored image record keeps its
    /// original target descriptor.
    pub async fn export(&self, output: &Path, entrypoint: &[String]) -> Result<()> {
        let record = self.engine().load_container(self.id()).await?;
        let image = self.engine().get_image(&record.image).await?;

        let (layer, diff_id) = self
            .engine()
            .snapshot_diff(&record.snapshot_key, &record.snapshotter)
            .await?;

        // The mutated blobs must survive the engine's GC scheduler between
        // write and archive read; the lease is the reachability root until
        // the archive is closed.
        let lease = self
            .engine()
            .create_lease(&format!("export-{}-{}", self.id(), uuid::Uuid::now_v7()))
            .await?;

        let result = self
            .export_under_lease(&image, layer, diff_id, entrypoint, output)
            .await;

        if let Err(err) = self.engine().release_lease(&lease).await {
            warn!("failed to release export lease {}: {}", lease.id, err);
        }

        result
    }

    async fn export_under_lease(
        &self,
        image: &ImageRecord,
        layer: Descriptor,
        diff_id: String,
        entrypoint: &[String],
        output: &Path,
    ) -> Result<()> {
        let (target, index) = self.resolve_manifest_descriptor(&image.target, &image.name).await?;

        let mut manifest: Manifest =
            serde_json::from_slice(&self.engine().read_blob(&target).await?)?;
        let mut config: ImageConfig =
            serde_json::from_slice(&self.engine().read_blob(&manifest.config).await?)?;

        manifest.layers.push(layer);
        config.rootfs.diff_ids.push(diff_id);
        if !entrypoint.is_empty() {
            let runtime_config = config.config.get_or_insert_with(Default::default);
            runtime_config.entrypoint = Some(entrypoint.to_vec());
            runtime_config.cmd = None;
        }

        let config_media_type = manifest.config.media_type.clone();
        manifest.config = self
            .write_ephemeral(
                &format!("{}-config", image.name),
                &config_media_type,
                serde_json::to_vec(&config)?,
                BTreeMap::new(),
            )
            .await?;

        let manifest_labels = manifest_gc_labels(&manifest);
        let mut manifest_desc = self
            .write_ephemeral(
                &format!("{}-manifest", image.name),
                &target.media_type,
                serde_json::to_vec(&manifest)?,
                manifest_labels,
            )
            .await?;

        // An index root is replaced by a fresh single-entry index: the other
        // platforms' layers are not in the content store, so their entries
        // are dropped rather than exported broken.
        let root = match index {
            None => manifest_desc,
            Some(_) => {
                manifest_desc.platform = Some(self.platform().clone());
                let new_index = Index::new(&image.target.media_type, vec![manifest_desc]);
                let labels = index_gc_labels(&new_index);
                self.write_ephemeral(
                    &format!("{}-index", image.name),
                    &image.target.media_type,
                    serde_json::to_vec(&new_index)?,
                    labels,
                )
                .await?
            }
        };

        let export_path = output.join(EXPORT_FILENAME);
        self.engine()
            .export_archive(&root, &image.name, self.platform(), &export_path)
            .await?;

        info!("image exported to {}", export_path.display());
        Ok(())
    }

    /// Resolves the image root descriptor to a platform-specific manifest.
    ///
    /// For an index root the entries are matched strictly against the
    /// container's platform. Some registries ship index entries with no
    /// platform metadata; in that case each entry's config blob is read and
    /// its declared platform used as the fallback matcher. An empty index
    /// is an error; otherwise the first entry is selected.
    async fn resolve_manifest_descriptor(
        &self,
        root: &Descriptor,
        image_name: &str,
    ) -> Result<(Descriptor, Option<Index>)> {
        if !oci::is_index_type(&root.media_type) {
            return Ok((root.clone(), None));
        }

        let index: Index = serde_json::from_slice(&self.engine().read_blob(root).await?)?;

        let strict = index
            .manifests
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|p| p.matches(self.platform()))
            })
            .cloned();
        if let Some(entry) = strict {
            return Ok((entry, Some(index)));
        }

        if !index.manifests.is_empty() && index.manifests.iter().all(|m| m.platform.is_none()) {
            let mut matched = None;
            for entry in &index.manifests {
                let manifest: Manifest =
                    serde_json::from_slice(&self.engine().read_blob(entry).await?)?;
                let config: ImageConfig =
                    serde_json::from_slice(&self.engine().read_blob(&manifest.config).await?)?;
                if config.platform().matches(self.platform()) {
                    matched = Some(entry.clone());
                    break;
                }
            }
            if let Some(entry) = matched {
                return Ok((entry, Some(index)));
            }
        }

        if index.manifests.is_empty() {
            return Err(Error::EmptyIndex(image_name.to_string()));
        }
        Ok((index.manifests[0].clone(), Some(index)))
    }

    /// Serializes a value into the content store, returning its descriptor.
    async fn write_ephemeral(
        &self,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
        labels: BTreeMap<String, String>,
    ) -> Result<Descriptor> {
        let desc = Descriptor {
            media_type: media_type.to_string(),
            digest: digest_bytes(&data),
            size: data.len() as i64,
            platform: None,
            annotations: None,
        };
        self.engine()
            .write_blob(reference, data, &desc, labels)
            .await?;
        Ok(desc)
    }
}

/// Reachability labels for a manifest's children.
///
/// The engine's garbage collector traces these from the manifest blob to
/// its config and layer blobs.
fn manifest_gc_labels(manifest: &Manifest) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(GC_LABEL_CONFIG.to_string(), manifest.config.digest.clone());
    for (i, layer) in manifest.layers.iter().enumerate() {
        labels.insert(format!("{GC_LABEL_LAYER_PREFIX}{i}"), layer.digest.clone());
    }
    labels
}

/// Reachability labels for an index's children.
fn index_gc_labels(index: &Index) -> BTreeMap<String, String> {
    index
        .manifests
        .iter()
        .enumerate()
        .map(|(i, m)| (format!("{GC_LABEL_MANIFEST_PREFIX}{i}"), m.digest.clone()))
        .collect()
}
