//! Filesystem-backed container engine.
//!
//! `LocalEngine` keeps all engine state under one directory: the blob store,
//! image records, and one rootfs tree per container. Tasks and execs run as
//! chroot-jailed host processes, so starting them requires the daemon to run
//! with sufficient privileges; everything else (imports, unpacking, diffing,
//! exports) works unprivileged.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├── blobs/sha256/…           content-addressed blobs
//! ├── images.json              image name → target descriptor
//! └── containers/<id>/
//!     ├── record.json          container metadata
//!     ├── spec.json            primary process spec
//!     ├── baseline.json        rootfs signatures at creation time
//!     └── rootfs/              extracted snapshot
//! ```
//!
//! The local engine runs no garbage collector; leases and reachability
//! labels are tracked so callers observe the same contract as against a
//! collecting engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{
    ContainerEngine, ContainerFilter, ContainerRecord, ExecStreams, ImageRecord, Lease,
    NewContainer, ProcessSpec, TaskStatus, archive, layers, pull,
};
use crate::error::{Error, Result};
use crate::oci::{self, Descriptor, Index, Manifest};
use crate::platform::OciPlatform;
use crate::storage::BlobStore;

/// A running task or exec process.
struct TaskHandle {
    child: Arc<tokio::sync::Mutex<tokio::process::Child>>,
}

struct LocalContainer {
    record: ContainerRecord,
    dir: PathBuf,
    rootfs: PathBuf,
    spec: ProcessSpec,
    task: Option<TaskHandle>,
}

/// A poisoned registry lock degrades to an error instead of a panic.
fn poisoned(what: &str) -> Error {
    Error::Runtime(format!("{what} lock poisoned"))
}

/// Container engine backed by the local filesystem.
pub struct LocalEngine {
    root: PathBuf,
    store: BlobStore,
    images: RwLock<HashMap<String, Descriptor>>,
    containers: RwLock<HashMap<String, LocalContainer>>,
    /// Open exec stdin close-signals, keyed `container/exec`.
    execs: RwLock<HashMap<String, oneshot::Sender<()>>>,
    leases: RwLock<HashSet<String>>,
}

impl LocalEngine {
    /// Opens or initializes an engine rooted at the given directory.
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("containers"))
            .map_err(|e| Error::FileSystem(e.to_string()))?;
        let store = BlobStore::new(root.join("blobs"))?;

        let images = Self::load_images(&root)?;
        let containers = Self::load_containers(&root)?;

        debug!(
            "local engine at {} ({} images, {} containers)",
            root.display(),
            images.len(),
            containers.len()
        );

        Ok(Self {
            root,
            store,
            images: RwLock::new(images),
            containers: RwLock::new(containers),
            execs: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashSet::new()),
        })
    }

    /// Returns the engine's blob store.
    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    fn images_path(root: &Path) -> PathBuf {
        root.join("images.json")
    }

    fn load_images(root: &Path) -> Result<HashMap<String, Descriptor>> {
        let path = Self::images_path(root);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&path).map_err(Error::Io)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_images(&self, images: &HashMap<String, Descriptor>) -> Result<()> {
        let data = serde_json::to_vec_pretty(images)?;
        fs::write(Self::images_path(&self.root), data).map_err(|e| Error::FileSystem(e.to_string()))
    }

    /// Restores container records from disk. Tasks do not survive restarts.
    fn load_containers(root: &Path) -> Result<HashMap<String, LocalContainer>> {
        let mut containers = HashMap::new();
        let dir = root.join("containers");
        for entry in fs::read_dir(&dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let container_dir = entry.path();
            let record_path = container_dir.join("record.json");
            if !record_path.exists() {
                continue;
            }
            let record: ContainerRecord =
                serde_json::from_slice(&fs::read(&record_path).map_err(Error::Io)?)?;
            let spec: ProcessSpec =
                serde_json::from_slice(&fs::read(container_dir.join("spec.json")).map_err(Error::Io)?)?;
            containers.insert(
                record.id.clone(),
                LocalContainer {
                    rootfs: container_dir.join("rootfs"),
                    dir: container_dir,
                    spec,
                    task: None,
                    record,
                },
            );
        }
        Ok(containers)
    }

    /// Resolves an image target to a single-platform manifest.
    fn resolve_manifest(&self, target: &Descriptor, platform: &OciPlatform) -> Result<Manifest> {
        let data = self.store.get_blob(&target.digest)?;
        if !oci::is_index_type(&target.media_type) {
            return Ok(serde_json::from_slice(&data)?);
        }

        let index: Index = serde_json::from_slice(&data)?;
        if index.manifests.is_empty() {
            return Err(Error::EmptyIndex(target.digest.clone()));
        }

        let entry = index
            .manifests
            .iter()
            .find(|m| m.platform.as_ref().is_some_and(|p| p.matches(platform)))
            .or_else(|| index.manifests.iter().find(|m| m.platform.is_none()))
            .ok_or_else(|| Error::NotFound(format!("manifest for platform {platform}")))?;

        let manifest_data = self.store.get_blob(&entry.digest)?;
        Ok(serde_json::from_slice(&manifest_data)?)
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&LocalContainer) -> T,
    ) -> Result<T> {
        let containers = self.containers.read().map_err(|_| poisoned("container map"))?;
        let container = containers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
        Ok(f(container))
    }

    fn task_handle(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<tokio::process::Child>>> {
        self.with_container(id, |c| c.task.as_ref().map(|t| t.child.clone()))?
            .ok_or_else(|| Error::NotFound(format!("task for container {id}")))
    }
}

#[async_trait]
impl ContainerEngine for LocalEngine {
    // =========================================================================
    // Image Service
    // =========================================================================

    async fn import_archive(&self, path: &Path) -> Result<Vec<ImageRecord>> {
        archive::import_archive(path, &self.store)
    }

    async fn pull_image(&self, reference: &str, platform: &OciPlatform) -> Result<ImageRecord> {
        let record = pull::pull(reference, platform, &self.store).await?;
        let mut images = self.images.write().map_err(|_| poisoned("image map"))?;
        images.insert(record.name.clone(), record.target.clone());
        let snapshot = images.clone();
        drop(images);
        self.save_images(&snapshot)?;
        Ok(record)
    }

    async fn get_image(&self, name: &str) -> Result<ImageRecord> {
        let images = self.images.read().map_err(|_| poisoned("image map"))?;
        images
            .get(name)
            .map(|target| ImageRecord {
                name: name.to_string(),
                target: target.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("image {name}")))
    }

    async fn create_image(&self, image: &ImageRecord) -> Result<()> {
        let mut images = self.images.write().map_err(|_| poisoned("image map"))?;
        if images.contains_key(&image.name) {
            return Err(Error::AlreadyExists(format!("image {}", image.name)));
        }
        images.insert(image.name.clone(), image.target.clone());
        let snapshot = images.clone();
        drop(images);
        self.save_images(&snapshot)
    }

    async fn update_image(&self, image: &ImageRecord) -> Result<()> {
        let mut images = self.images.write().map_err(|_| poisoned("image map"))?;
        if !images.contains_key(&image.name) {
            return Err(Error::NotFound(format!("image {}", image.name)));
        }
        images.insert(image.name.clone(), image.target.clone());
        let snapshot = images.clone();
        drop(images);
        self.save_images(&snapshot)
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        let mut images = self.images.write().map_err(|_| poisoned("image map"))?;
        if images.remove(name).is_none() {
            return Err(Error::NotFound(format!("image {name}")));
        }
        let snapshot = images.clone();
        drop(images);
        self.save_images(&snapshot)
    }

    async fn unpack_image(
        &self,
        name: &str,
        platform: &OciPlatform,
        _snapshotter: &str,
    ) -> Result<()> {
        let record = self.get_image(name).await?;
        let manifest = self.resolve_manifest(&record.target, platform)?;
        for layer in &manifest.layers {
            if !self.store.has_blob(&layer.digest) {
                return Err(Error::BlobNotFound {
                    digest: layer.digest.clone(),
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Content Store
    // =========================================================================

    async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.store.get_blob(&desc.digest)
    }

    async fn write_blob(
        &self,
        reference: &str,
        data: Vec<u8>,
        desc: &Descriptor,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        if desc.size != data.len() as i64 {
            return Err(Error::StorageWrite(format!(
                "size mismatch for {reference}: descriptor says {}, got {}",
                desc.size,
                data.len()
            )));
        }
        self.store.put_blob_with_labels(&desc.digest, &data, labels)
    }

    // =========================================================================
    // Leases
    // =========================================================================

    async fn create_lease(&self, id: &str) -> Result<Lease> {
        let mut leases = self.leases.write().map_err(|_| poisoned("lease set"))?;
        if !leases.insert(id.to_string()) {
            return Err(Error::AlreadyExists(format!("lease {id}")));
        }
        Ok(Lease { id: id.to_string() })
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.write().map_err(|_| poisoned("lease set"))?;
        if !leases.remove(&lease.id) {
            return Err(Error::NotFound(format!("lease {}", lease.id)));
        }
        Ok(())
    }

    // =========================================================================
    // Container Service
    // =========================================================================

    async fn create_container(&self, spec: NewContainer) -> Result<()> {
        {
            let containers = self.containers.read().map_err(|_| poisoned("container map"))?;
            if containers.contains_key(&spec.id) {
                return Err(Error::AlreadyExists(format!("container {}", spec.id)));
            }
        }

        let image = self.get_image(&spec.image).await?;
        let manifest = self.resolve_manifest(&image.target, &spec.platform)?;
        let config_data = self.store.get_blob(&manifest.config.digest)?;
        let config: crate::oci::ImageConfig = serde_json::from_slice(&config_data)?;

        let dir = self.root.join("containers").join(&spec.id);
        if dir.exists() {
            // Leftover state from a crashed run; replace it.
            fs::remove_dir_all(&dir).map_err(|e| Error::FileSystem(e.to_string()))?;
        }
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs).map_err(|e| Error::FileSystem(e.to_string()))?;

        for layer in &manifest.layers {
            let data = self.store.get_blob(&layer.digest)?;
            layers::extract_layer(&data, &layer.media_type, &layer.digest, &rootfs)?;
        }

        let baseline = layers::capture_baseline(&rootfs)?;
        fs::write(dir.join("baseline.json"), serde_json::to_vec(&baseline)?)
            .map_err(|e| Error::FileSystem(e.to_string()))?;

        // Primary process spec: the requested args over the image's
        // environment and working directory.
        let runtime_config = config.config.unwrap_or_default();
        let process_spec = ProcessSpec {
            args: spec.args.clone(),
            env: runtime_config.env.unwrap_or_else(|| {
                vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()]
            }),
            cwd: runtime_config.working_dir.unwrap_or_default(),
            terminal: false,
        };
        fs::write(dir.join("spec.json"), serde_json::to_vec(&process_spec)?)
            .map_err(|e| Error::FileSystem(e.to_string()))?;

        let record = ContainerRecord {
            id: spec.id.clone(),
            image: spec.image.clone(),
            snapshot_key: spec.id.clone(),
            snapshotter: spec.snapshotter.clone(),
            platform: spec.platform.clone(),
            created_at: Utc::now(),
        };
        fs::write(dir.join("record.json"), serde_json::to_vec(&record)?)
            .map_err(|e| Error::FileSystem(e.to_string()))?;

        let mut containers = self.containers.write().map_err(|_| poisoned("container map"))?;
        containers.insert(
            spec.id.clone(),
            LocalContainer {
                record,
                dir,
                rootfs,
                spec: process_spec,
                task: None,
            },
        );
        Ok(())
    }

    async fn load_container(&self, id: &str) -> Result<ContainerRecord> {
        self.with_container(id, |c| c.record.clone())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>> {
        let containers = self.containers.read().map_err(|_| poisoned("container map"))?;
        let ContainerFilter::Image(image) = filter;
        Ok(containers
            .values()
            .filter(|c| &c.record.image == image)
            .map(|c| c.record.clone())
            .collect())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let container = {
            let mut containers = self.containers.write().map_err(|_| poisoned("container map"))?;
            containers
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("container {id}")))?
        };

        if let Some(task) = container.task {
            let child = task.child.clone();
            tokio::spawn(async move {
                let mut child = child.lock().await;
                let _ = child.start_kill();
                let _ = child.wait().await;
            });
        }

        fs::remove_dir_all(&container.dir).map_err(|e| Error::FileSystem(e.to_string()))?;
        Ok(())
    }

    // =========================================================================
    // Task Service
    // =========================================================================

    async fn start_task(&self, container_id: &str) -> Result<()> {
        let (rootfs, spec) = self.with_container(container_id, |c| {
            (c.rootfs.clone(), c.spec.clone())
        })?;
        if self
            .with_container(container_id, |c| c.task.is_some())
            .unwrap_or(false)
        {
            return Err(Error::AlreadyExists(format!(
                "task for container {container_id}"
            )));
        }

        let mut cmd = rootfs_command(&rootfs, &spec)?;
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let child = cmd
            .spawn()
            .map_err(|e| Error::Runtime(format!("failed to start task: {e}")))?;

        let mut containers = self.containers.write().map_err(|_| poisoned("container map"))?;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
        container.task = Some(TaskHandle {
            child: Arc::new(tokio::sync::Mutex::new(child)),
        });
        Ok(())
    }

    async fn task_status(&self, container_id: &str) -> Result<TaskStatus> {
        let child = self.task_handle(container_id)?;
        let mut child = child.lock().await;
        match child.try_wait() {
            Ok(None) => Ok(TaskStatus::Running),
            Ok(Some(_)) => Ok(TaskStatus::Stopped),
            Err(e) => Err(Error::runtime(e)),
        }
    }

    async fn kill_task(&self, container_id: &str, signal: i32) -> Result<()> {
        let child = self.task_handle(container_id)?;
        let child = child.lock().await;
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and still hold.
            let rc = unsafe { libc::kill(pid as i32, signal) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(Error::runtime(err));
                }
            }
        }
        Ok(())
    }

    async fn delete_task(&self, container_id: &str) -> Result<()> {
        let task = {
            let mut containers = self.containers.write().map_err(|_| poisoned("container map"))?;
            let container = containers
                .get_mut(container_id)
                .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
            container
                .task
                .take()
                .ok_or_else(|| Error::NotFound(format!("task for container {container_id}")))?
        };

        let mut child = task.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }

    async fn container_process_spec(&self, container_id: &str) -> Result<ProcessSpec> {
        self.with_container(container_id, |c| c.spec.clone())
    }

    async fn exec(
        &self,
        container_id: &str,
        exec_id: &str,
        spec: ProcessSpec,
        streams: ExecStreams,
    ) -> Result<u32> {
        if spec.args.is_empty() {
            return Err(Error::runtime("exec requires a command"));
        }
        let rootfs = {
            let containers = self.containers.read().map_err(|_| poisoned("container map"))?;
            let container = containers
                .get(container_id)
                .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
            if container.task.is_none() {
                return Err(Error::NotFound(format!("task for container {container_id}")));
            }
            container.rootfs.clone()
        };

        let mut cmd = rootfs_command(&rootfs, &spec)?;
        cmd.stdin(stdio_for(streams.stdin.is_some()));
        cmd.stdout(stdio_for(streams.stdout.is_some()));
        cmd.stderr(stdio_for(streams.stderr.is_some()));

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Runtime(format!("failed to spawn exec process: {e}")))?;

        let exec_key = format!("{container_id}/{exec_id}");
        let mut stdin_pump = None;
        if let Some(mut input) = streams.stdin {
            let mut child_stdin = child.stdin.take().expect("stdin was piped");
            let (close_tx, mut close_rx) = oneshot::channel::<()>();
            self.execs
                .write()
                .map_err(|_| poisoned("exec map"))?
                .insert(exec_key.clone(), close_tx);
            stdin_pump = Some(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::io::copy(&mut input, &mut child_stdin) => {}
                    _ = &mut close_rx => {}
                }
                // Dropping child_stdin closes the pipe so the process sees EOF.
            }));
        }

        let mut output_pumps = Vec::new();
        if let Some(mut out) = streams.stdout {
            let mut child_out = child.stdout.take().expect("stdout was piped");
            output_pumps.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut child_out, &mut out).await;
            }));
        }
        if let Some(mut err_stream) = streams.stderr {
            let mut child_err = child.stderr.take().expect("stderr was piped");
            output_pumps.push(tokio::spawn(async move {
                let _ = tokio::io::copy(&mut child_err, &mut err_stream).await;
            }));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Runtime(format!("failed to wait for exec process: {e}")))?;

        // Output pumps drain what the process wrote; the stdin pump may be
        // blocked on a reader that never ends, so it is aborted instead.
        for pump in output_pumps {
            let _ = pump.await;
        }
        if let Some(pump) = stdin_pump {
            pump.abort();
        }
        if let Ok(mut execs) = self.execs.write() {
            execs.remove(&exec_key);
        }

        Ok(exit_code(status))
    }

    async fn close_stdin(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let sender = self
            .execs
            .write()
            .map_err(|_| poisoned("exec map"))?
            .remove(&format!("{container_id}/{exec_id}"));
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        Ok(())
    }

    // =========================================================================
    // Snapshotter
    // =========================================================================

    async fn snapshot_diff(
        &self,
        snapshot_key: &str,
        _snapshotter: &str,
    ) -> Result<(Descriptor, String)> {
        let (rootfs, dir) = self.with_container(snapshot_key, |c| {
            (c.rootfs.clone(), c.dir.clone())
        })?;

        let baseline: layers::Baseline =
            serde_json::from_slice(&fs::read(dir.join("baseline.json")).map_err(Error::Io)?)?;
        let (compressed, diff_id) = layers::diff_layer(&rootfs, &baseline)?;

        let desc = Descriptor::for_blob(crate::constants::MEDIA_TYPE_LAYER_GZIP, &compressed);
        self.store.put_blob(&desc.digest, &compressed)?;
        Ok((desc, diff_id))
    }

    // =========================================================================
    // Export
    // =========================================================================

    async fn export_archive(
        &self,
        root: &Descriptor,
        reference: &str,
        platform: &OciPlatform,
        path: &Path,
    ) -> Result<()> {
        archive::export_archive(root, reference, platform, &self.store, path)
    }
}

fn stdio_for(attached: bool) -> Stdio {
    if attached { Stdio::piped() } else { Stdio::null() }
}

/// Maps an exit status to a code, rendering signal deaths as `128 + n`.
fn exit_code(status: std::process::ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    1
}

/// Builds a command that runs chroot-jailed inside a rootfs.
fn rootfs_command(rootfs: &Path, spec: &ProcessSpec) -> Result<tokio::process::Command> {
    use std::os::unix::ffi::OsStrExt;

    let mut cmd = tokio::process::Command::new(&spec.args[0]);
    cmd.args(&spec.args[1..]);
    cmd.env_clear();
    for entry in &spec.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    let root = CString::new(rootfs.as_os_str().as_bytes()).map_err(Error::runtime)?;
    let cwd = CString::new(if spec.cwd.is_empty() {
        "/".to_string()
    } else {
        spec.cwd.clone()
    })
    .map_err(Error::runtime)?;

    // SAFETY: chroot/chdir are async-signal-safe and the CStrings are moved
    // into the closure, staying alive for every exec attempt.
    unsafe {
        cmd.pre_exec(move || {
            if libc::chroot(root.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(cwd.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.kill_on_drop(true);
    Ok(cmd)
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        let Ok(containers) = self.containers.read() else {
            return;
        };
        for (id, container) in containers.iter() {
            if container.task.is_some() {
                warn!("engine dropped with running task for container {}", id);
            }
        }
    }
}
