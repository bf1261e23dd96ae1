//! Image and container management over the engine.
//!
//! A [`Runtime`] imports or pulls base images, tags them deterministically,
//! unpacks them for the target platform, and starts build containers with a
//! long-running task so later exec calls have a process to attach to.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::{OCI_RUNTIME, SNAPSHOTTER};
use crate::container::Container;
use crate::engine::{ContainerEngine, ContainerFilter, ImageRecord, NewContainer};
use crate::error::{Error, Result};
use crate::platform::OciPlatform;
use crate::recipe::BaseImage;

/// Provides image and container operations against a container engine.
#[derive(Clone)]
pub struct Runtime {
    engine: Arc<dyn ContainerEngine>,
}

impl Runtime {
    /// Creates a runtime over the given engine.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Resolves a base image, unpacks it for the target platform, and starts
    /// a container.
    ///
    /// Local archives are imported into the content store and tagged with a
    /// deterministic name derived from the path; remote references are
    /// pulled through the engine's transfer service. The layers for the
    /// target platform are unpacked into the snapshotter, a container is
    /// created with a fresh snapshot, and a long-running task
    /// (`sleep infinity`) is started so that subsequent exec calls have a
    /// running process to attach to. Any existing container with the same id
    /// is removed before the new one is created. Building for a platform
    /// other than the host requires QEMU / binfmt_misc support in the
    /// kernel.
    pub async fn start_container(
        &self,
        source: &BaseImage,
        id: &str,
        platform: &OciPlatform,
    ) -> Result<Container> {
        let tag = match source {
            BaseImage::Archive(path) => {
                let tag = image_tag(path);
                let imported = self.import_single(path).await?;
                self.tag_image(imported, &tag).await?;
                tag
            }
            BaseImage::Reference(reference) => {
                let record = self.engine.pull_image(reference, platform).await?;
                record.name
            }
        };

        self.engine
            .unpack_image(&tag, platform, SNAPSHOTTER)
            .await?;

        self.launch(&tag, id, platform).await
    }

    /// Imports an OCI archive, tags it under the given name, and unpacks it
    /// for the host platform.
    pub async fn import_image(&self, path: &Path, tag: &str) -> Result<()> {
        let imported = self.import_single(path).await?;
        self.tag_image(imported, tag).await?;

        let platform = OciPlatform::host();
        self.engine.unpack_image(tag, &platform, SNAPSHOTTER).await?;

        debug!("image imported as {}", tag);
        Ok(())
    }

    /// Starts a container from a previously imported image tag.
    ///
    /// Any stale container with the same id is cleaned up first. The
    /// container runs detached with a long-running task.
    pub async fn start_from_tag(&self, tag: &str, id: &str) -> Result<Container> {
        let platform = OciPlatform::host();
        // Surface unknown tags before creating anything.
        self.engine.get_image(tag).await?;
        self.launch(tag, id, &platform).await
    }

    /// Removes an image and all containers created from it.
    ///
    /// Each container's task is killed before the container and its snapshot
    /// are deleted.
    pub async fn destroy_image(&self, tag: &str) -> Result<()> {
        let containers = self
            .engine
            .list_containers(&ContainerFilter::Image(tag.to_string()))
            .await?;

        for record in containers {
            let _ = self.engine.kill_task(&record.id, libc::SIGKILL).await;
            let _ = self.engine.delete_task(&record.id).await;
            match self.engine.delete_container(&record.id).await {
                Err(e) if e.is_not_found() => {}
                other => other?,
            }
        }

        match self.engine.delete_image(tag).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }

        debug!("image destroyed: {}", tag);
        Ok(())
    }

    /// Returns a handle for an existing container.
    ///
    /// The container is not loaded or verified; the handle resolves it
    /// lazily on each call.
    pub fn container(&self, id: &str) -> Container {
        Container::new(self.engine.clone(), id, OciPlatform::host())
    }

    /// Imports an archive that must contain exactly one root image.
    ///
    /// Import returns one record per entry in the archive's index. A
    /// multi-platform archive has a single entry (an OCI index that
    /// internally references per-platform manifests); platform selection
    /// happens later. Multiple records would mean multiple unrelated
    /// images, which are not supported.
    async fn import_single(&self, path: &Path) -> Result<ImageRecord> {
        let mut imported = self.engine.import_archive(path).await?;
        match imported.len() {
            0 => Err(Error::EmptyArchive),
            1 => Ok(imported.remove(0)),
            _ => Err(Error::MultipleImages),
        }
    }

    /// Tags an imported image under a deterministic name.
    ///
    /// Updates the tag if it already exists. Removes the source record when
    /// its name differs from the tag to avoid duplicates.
    async fn tag_image(&self, source: ImageRecord, tag: &str) -> Result<()> {
        let image = ImageRecord {
            name: tag.to_string(),
            target: source.target.clone(),
        };

        match self.engine.create_image(&image).await {
            Err(e) if e.is_already_exists() => self.engine.update_image(&image).await?,
            other => other?,
        }

        if source.name != tag {
            let _ = self.engine.delete_image(&source.name).await;
        }
        Ok(())
    }

    /// Creates the container and starts its long-running task.
    async fn launch(&self, tag: &str, id: &str, platform: &OciPlatform) -> Result<Container> {
        let container = Container::new(self.engine.clone(), id, platform.clone());

        // Remove any stale container from a previous build with the same id.
        container.remove_stale().await;

        // Resolve the image first so unknown tags fail before creation.
        self.engine.get_image(tag).await?;

        self.engine
            .create_container(NewContainer {
                id: id.to_string(),
                image: tag.to_string(),
                platform: platform.clone(),
                snapshotter: SNAPSHOTTER.to_string(),
                runtime: OCI_RUNTIME.to_string(),
                args: vec!["sleep".to_string(), "infinity".to_string()],
                host_network: true,
            })
            .await?;

        if let Err(err) = self.engine.start_task(id).await {
            let _ = self.engine.delete_container(id).await;
            return Err(err);
        }

        debug!("container started: id={} image={}", id, tag);
        Ok(container)
    }
}

/// Produces an image tag from an archive path.
///
/// The path is hashed so the tag is always valid OCI reference syntax
/// regardless of which characters the path contains. Callers must treat the
/// result as opaque.
pub(crate) fn image_tag(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("import/{}:latest", hex::encode(digest))
}
