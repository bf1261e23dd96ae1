//! Container engine interface.
//!
//! The daemon depends abstractly on a container engine exposing a content
//! store, a snapshotter, an image service, a transfer service, container and
//! task services, and a leases API. [`ContainerEngine`] is that seam; the
//! runtime adapter and export pipeline are written against it.
//!
//! # Lifecycle
//!
//! ```text
//! import_archive/pull_image → create_image → unpack_image
//!     → create_container → start_task → [exec ...] → kill/delete_task
//!     → delete_container
//! ```
//!
//! # Content reachability
//!
//! Blobs written with `containerd.io/gc.ref.content.*` labels form a
//! reachability graph the engine's garbage collector must honour. Ephemeral
//! blobs are additionally protected by [leases](ContainerEngine::create_lease)
//! for the duration of an export.

mod archive;
mod layers;
mod local;
mod pull;

pub use local::LocalEngine;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::oci::Descriptor;
use crate::platform::OciPlatform;

/// Byte stream fed into an exec process as stdin.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte stream receiving an exec process's stdout or stderr.
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// A named image record pointing at a root descriptor in the content store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub name: String,
    pub target: Descriptor,
}

/// Metadata for a created container.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Name of the image the container was created from.
    pub image: String,
    /// Key of the container's read-write snapshot.
    pub snapshot_key: String,
    /// Snapshotter holding the snapshot.
    pub snapshotter: String,
    pub platform: OciPlatform,
    pub created_at: DateTime<Utc>,
}

/// Request to create a container.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    /// Image name the container is created from; also used as the engine's
    /// container-to-image association for list filters.
    pub image: String,
    pub platform: OciPlatform,
    /// Snapshotter to create the read-write snapshot in.
    pub snapshotter: String,
    /// OCI runtime shim to execute the container with.
    pub runtime: String,
    /// Arguments of the container's primary process.
    pub args: Vec<String>,
    /// Share the host network namespace and resolver configuration.
    pub host_network: bool,
}

/// Filter for container listings.
#[derive(Debug, Clone)]
pub enum ContainerFilter {
    /// Containers created from the named image.
    Image(String),
}

/// State of a container's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Stopped,
}

/// An OCI process specification for an exec.
///
/// Cloned from the container's own spec, then overridden per execution.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Working directory; empty means the container default.
    pub cwd: String,
    pub terminal: bool,
}

/// Streams attached to an exec process.
///
/// Missing stdout/stderr streams are discarded by the engine. The engine
/// drops all streams before the exec call returns, so writers observe
/// end-of-stream as soon as the process exits.
#[derive(Default)]
pub struct ExecStreams {
    pub stdin: Option<InputStream>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

/// A content lease protecting blobs from garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
}

/// Operations the daemon requires from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    // =========================================================================
    // Image Service
    // =========================================================================

    /// Imports an OCI archive into the content store.
    ///
    /// Returns one image record per entry in the archive's `index.json`. A
    /// multi-platform archive has a single entry (an OCI index referencing
    /// per-platform manifests).
    async fn import_archive(&self, path: &Path) -> Result<Vec<ImageRecord>>;

    /// Pulls a remote reference for the target platform, storing its blobs
    /// in the content store, and creates an image record named after the
    /// reference.
    async fn pull_image(&self, reference: &str, platform: &OciPlatform) -> Result<ImageRecord>;

    /// Looks up an image record by name.
    async fn get_image(&self, name: &str) -> Result<ImageRecord>;

    /// Creates an image record. Fails with an already-exists error when the
    /// name is taken.
    async fn create_image(&self, image: &ImageRecord) -> Result<()>;

    /// Replaces the target of an existing image record.
    async fn update_image(&self, image: &ImageRecord) -> Result<()>;

    /// Deletes an image record.
    async fn delete_image(&self, name: &str) -> Result<()>;

    /// Unpacks the image's layers for the target platform into the
    /// snapshotter.
    async fn unpack_image(
        &self,
        name: &str,
        platform: &OciPlatform,
        snapshotter: &str,
    ) -> Result<()>;

    // =========================================================================
    // Content Store
    // =========================================================================

    /// Reads a blob by descriptor.
    async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>>;

    /// Writes a blob with reachability labels.
    ///
    /// `reference` names the in-flight write for the engine's bookkeeping;
    /// the stored blob is keyed by content digest alone.
    async fn write_blob(
        &self,
        reference: &str,
        data: Vec<u8>,
        desc: &Descriptor,
        labels: BTreeMap<String, String>,
    ) -> Result<()>;

    // =========================================================================
    // Leases
    // =========================================================================

    /// Creates a content lease. Blobs written while the lease is held are
    /// not collected until it is released.
    async fn create_lease(&self, id: &str) -> Result<Lease>;

    /// Releases a content lease.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    // =========================================================================
    // Container Service
    // =========================================================================

    /// Creates a container with a fresh snapshot of its image.
    async fn create_container(&self, spec: NewContainer) -> Result<()>;

    /// Loads a container record. Missing containers are a not-found error.
    async fn load_container(&self, id: &str) -> Result<ContainerRecord>;

    /// Lists containers matching a filter.
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>>;

    /// Deletes a container and cleans up its snapshot.
    async fn delete_container(&self, id: &str) -> Result<()>;

    // =========================================================================
    // Task Service
    // =========================================================================

    /// Starts the container's primary task.
    async fn start_task(&self, container_id: &str) -> Result<()>;

    /// Queries the task state. A container without a task is a not-found
    /// error.
    async fn task_status(&self, container_id: &str) -> Result<TaskStatus>;

    /// Sends a signal to the task.
    async fn kill_task(&self, container_id: &str, signal: i32) -> Result<()>;

    /// Deletes the task, reaping its process.
    async fn delete_task(&self, container_id: &str) -> Result<()>;

    /// Returns the process spec of the container's primary process, used as
    /// the base for exec specs.
    async fn container_process_spec(&self, container_id: &str) -> Result<ProcessSpec>;

    /// Runs a process inside the container's running task: the exec is
    /// created, started, waited for, and deleted. Returns the exit code; a
    /// non-zero code is not an error.
    ///
    /// All streams are dropped before the call returns.
    async fn exec(
        &self,
        container_id: &str,
        exec_id: &str,
        spec: ProcessSpec,
        streams: ExecStreams,
    ) -> Result<u32>;

    /// Tells the engine to close its write end of an exec's stdin FIFO.
    ///
    /// Without this the exec process never observes EOF on stdin, because
    /// the engine's shim holds the FIFO open.
    async fn close_stdin(&self, container_id: &str, exec_id: &str) -> Result<()>;

    // =========================================================================
    // Snapshotter
    // =========================================================================

    /// Computes the diff between a container's read-write snapshot and its
    /// parent, storing it as a new layer blob.
    ///
    /// Returns the layer descriptor and the uncompressed diff id.
    async fn snapshot_diff(
        &self,
        snapshot_key: &str,
        snapshotter: &str,
    ) -> Result<(Descriptor, String)>;

    // =========================================================================
    // Export
    // =========================================================================

    /// Streams the image rooted at `root` into an OCI archive at `path`.
    ///
    /// The archive's index entry is annotated with `reference` and entries
    /// not matching `platform` are filtered out.
    async fn export_archive(
        &self,
        root: &Descriptor,
        reference: &str,
        platform: &OciPlatform,
        path: &Path,
    ) -> Result<()>;
}
