//! Scripted in-memory engine for integration tests.
//!
//! Implements the full engine surface against in-memory state. Exec calls
//! are interpreted: `mkdir`, `tar cf`/`tar xf` (operating on a per-container
//! virtual filesystem), a `touch` builtin, and scripted shell commands with
//! configurable exit codes and output.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use cruxd::engine::{
    ContainerEngine, ContainerFilter, ContainerRecord, ExecStreams, ImageRecord, Lease,
    NewContainer, ProcessSpec, TaskStatus,
};
use cruxd::error::{Error, Result};
use cruxd::oci::{Descriptor, digest_bytes};
use cruxd::platform::OciPlatform;

/// One interpreted exec call.
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub container: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// One export invocation.
#[derive(Debug, Clone)]
pub struct ExportCall {
    pub root: Descriptor,
    pub reference: String,
    pub platform: OciPlatform,
    pub path: PathBuf,
}

#[derive(Default)]
pub struct FakeEngine {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub labels: Mutex<HashMap<String, BTreeMap<String, String>>>,
    pub images: Mutex<HashMap<String, Descriptor>>,
    pub containers: Mutex<HashMap<String, ContainerRecord>>,
    pub tasks: Mutex<HashSet<String>>,
    /// Virtual per-container filesystem: container id → path → content.
    pub files: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    pub exec_log: Mutex<Vec<ExecCall>>,
    /// Scripted results for `sh -c` commands: command → (exit, stdout, stderr).
    pub run_results: Mutex<HashMap<String, (u32, String, String)>>,
    /// Importable archives: path → records.
    pub archives: Mutex<HashMap<PathBuf, Vec<ImageRecord>>>,
    /// Pullable references: reference → record.
    pub pulls: Mutex<HashMap<String, ImageRecord>>,
    pub unpacked: Mutex<Vec<(String, String)>>,
    pub exports: Mutex<Vec<ExportCall>>,
    pub leases_created: Mutex<Vec<String>>,
    pub leases_released: Mutex<Vec<String>>,
    pub deleted_containers: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an importable archive whose single record points at a
    /// synthetic manifest descriptor.
    pub fn add_archive(&self, path: &str) -> ImageRecord {
        let config_desc = self.seed_json_blob(
            &serde_json::json!({"architecture": "amd64", "os": "linux", "rootfs": {"type": "layers", "diff_ids": []}}),
            "application/vnd.oci.image.config.v1+json",
        );
        let desc = self.seed_json_blob(
            &serde_json::json!({"schemaVersion": 2, "config": {"mediaType": config_desc.media_type, "digest": config_desc.digest, "size": config_desc.size}, "layers": []}),
            "application/vnd.oci.image.manifest.v1+json",
        );
        let record = ImageRecord {
            name: format!("import-{}", desc.digest),
            target: desc,
        };
        self.archives
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), vec![record.clone()]);
        record
    }

    /// Registers a pullable reference.
    pub fn add_pull(&self, reference: &str) -> ImageRecord {
        let config_desc = self.seed_json_blob(
            &serde_json::json!({"architecture": "amd64", "os": "linux", "rootfs": {"type": "layers", "diff_ids": []}}),
            "application/vnd.oci.image.config.v1+json",
        );
        let desc = self.seed_json_blob(
            &serde_json::json!({"schemaVersion": 2, "config": {"mediaType": config_desc.media_type, "digest": config_desc.digest, "size": config_desc.size}, "layers": []}),
            "application/vnd.oci.image.manifest.v1+json",
        );
        let record = ImageRecord {
            name: reference.to_string(),
            target: desc,
        };
        self.pulls
            .lock()
            .unwrap()
            .insert(reference.to_string(), record.clone());
        record
    }

    /// Scripts the result of a `sh -c` command.
    pub fn script_run(&self, command: &str, exit_code: u32, stdout: &str, stderr: &str) {
        self.run_results.lock().unwrap().insert(
            command.to_string(),
            (exit_code, stdout.to_string(), stderr.to_string()),
        );
    }

    /// Serializes a value into the blob map and returns its descriptor.
    pub fn seed_json_blob(&self, value: &impl Serialize, media_type: &str) -> Descriptor {
        let data = serde_json::to_vec(value).unwrap();
        let desc = Descriptor {
            media_type: media_type.to_string(),
            digest: digest_bytes(&data),
            size: data.len() as i64,
            platform: None,
            annotations: None,
        };
        self.blobs.lock().unwrap().insert(desc.digest.clone(), data);
        desc
    }

    /// Reads a stored blob back as JSON.
    pub fn blob_json(&self, digest: &str) -> serde_json::Value {
        let blobs = self.blobs.lock().unwrap();
        serde_json::from_slice(blobs.get(digest).expect("blob missing")).unwrap()
    }

    /// Contents of one container's virtual filesystem.
    pub fn container_files(&self, id: &str) -> BTreeMap<String, Vec<u8>> {
        self.files.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    pub fn exec_calls(&self, container: &str) -> Vec<ExecCall> {
        self.exec_log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.container == container)
            .cloned()
            .collect()
    }

    /// Shell commands (the `sh -c` argument) run in a container, in order.
    pub fn shell_commands(&self, container: &str) -> Vec<String> {
        self.exec_calls(container)
            .into_iter()
            .filter(|c| c.args.len() == 3 && c.args[1] == "-c")
            .map(|c| c.args[2].clone())
            .collect()
    }
}

fn join_container_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn import_archive(&self, path: &Path) -> Result<Vec<ImageRecord>> {
        self.archives
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Runtime(format!("no archive at {}", path.display())))
    }

    async fn pull_image(&self, reference: &str, _platform: &OciPlatform) -> Result<ImageRecord> {
        let record = self
            .pulls
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: "not scripted".to_string(),
            })?;
        self.images
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.target.clone());
        Ok(record)
    }

    async fn get_image(&self, name: &str) -> Result<ImageRecord> {
        self.images
            .lock()
            .unwrap()
            .get(name)
            .map(|target| ImageRecord {
                name: name.to_string(),
                target: target.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("image {name}")))
    }

    async fn create_image(&self, image: &ImageRecord) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        if images.contains_key(&image.name) {
            return Err(Error::AlreadyExists(format!("image {}", image.name)));
        }
        images.insert(image.name.clone(), image.target.clone());
        Ok(())
    }

    async fn update_image(&self, image: &ImageRecord) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        if !images.contains_key(&image.name) {
            return Err(Error::NotFound(format!("image {}", image.name)));
        }
        images.insert(image.name.clone(), image.target.clone());
        Ok(())
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        if self.images.lock().unwrap().remove(name).is_none() {
            return Err(Error::NotFound(format!("image {name}")));
        }
        Ok(())
    }

    async fn unpack_image(
        &self,
        name: &str,
        platform: &OciPlatform,
        _snapshotter: &str,
    ) -> Result<()> {
        self.get_image(name).await?;
        self.unpacked
            .lock()
            .unwrap()
            .push((name.to_string(), platform.to_string()));
        Ok(())
    }

    async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound {
                digest: desc.digest.clone(),
            })
    }

    async fn write_blob(
        &self,
        _reference: &str,
        data: Vec<u8>,
        desc: &Descriptor,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        if digest_bytes(&data) != desc.digest {
            return Err(Error::StorageWrite("digest mismatch".to_string()));
        }
        self.blobs.lock().unwrap().insert(desc.digest.clone(), data);
        if !labels.is_empty() {
            self.labels.lock().unwrap().insert(desc.digest.clone(), labels);
        }
        Ok(())
    }

    async fn create_lease(&self, id: &str) -> Result<Lease> {
        self.leases_created.lock().unwrap().push(id.to_string());
        Ok(Lease { id: id.to_string() })
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        self.leases_released.lock().unwrap().push(lease.id.clone());
        Ok(())
    }

    async fn create_container(&self, spec: NewContainer) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.id) {
            return Err(Error::AlreadyExists(format!("container {}", spec.id)));
        }
        containers.insert(
            spec.id.clone(),
            ContainerRecord {
                id: spec.id.clone(),
                image: spec.image.clone(),
                snapshot_key: spec.id.clone(),
                snapshotter: spec.snapshotter.clone(),
                platform: spec.platform.clone(),
                created_at: Utc::now(),
            },
        );
        self.files.lock().unwrap().entry(spec.id).or_default();
        Ok(())
    }

    async fn load_container(&self, id: &str) -> Result<ContainerRecord> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>> {
        let ContainerFilter::Image(image) = filter;
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| &c.image == image)
            .cloned()
            .collect())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let removed = self.containers.lock().unwrap().remove(id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("container {id}")));
        }
        self.tasks.lock().unwrap().remove(id);
        self.deleted_containers.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn start_task(&self, container_id: &str) -> Result<()> {
        if !self.containers.lock().unwrap().contains_key(container_id) {
            return Err(Error::NotFound(format!("container {container_id}")));
        }
        self.tasks.lock().unwrap().insert(container_id.to_string());
        Ok(())
    }

    async fn task_status(&self, container_id: &str) -> Result<TaskStatus> {
        if self.tasks.lock().unwrap().contains(container_id) {
            Ok(TaskStatus::Running)
        } else {
            Err(Error::NotFound(format!("task for container {container_id}")))
        }
    }

    async fn kill_task(&self, container_id: &str, _signal: i32) -> Result<()> {
        if self.tasks.lock().unwrap().contains(container_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("task for container {container_id}")))
        }
    }

    async fn delete_task(&self, container_id: &str) -> Result<()> {
        if self.tasks.lock().unwrap().remove(container_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("task for container {container_id}")))
        }
    }

    async fn container_process_spec(&self, container_id: &str) -> Result<ProcessSpec> {
        if !self.containers.lock().unwrap().contains_key(container_id) {
            return Err(Error::NotFound(format!("container {container_id}")));
        }
        Ok(ProcessSpec {
            args: vec!["sleep".to_string(), "infinity".to_string()],
            env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()],
            cwd: String::new(),
            terminal: false,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        _exec_id: &str,
        spec: ProcessSpec,
        mut streams: ExecStreams,
    ) -> Result<u32> {
        self.task_status(container_id).await?;

        self.exec_log.lock().unwrap().push(ExecCall {
            container: container_id.to_string(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
        });

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let mut exit_code = 0u32;
        let mut stdout_bytes: Vec<u8> = Vec::new();
        let mut stderr_bytes: Vec<u8> = Vec::new();

        match args.as_slice() {
            ["mkdir", "-p", _path] => {}

            ["tar", "xf", "-", "-C", dir] => {
                let mut data = Vec::new();
                if let Some(stdin) = streams.stdin.as_mut() {
                    stdin
                        .read_to_end(&mut data)
                        .await
                        .map_err(Error::Io)?;
                }
                let mut archive = tar::Archive::new(&data[..]);
                for entry in archive.entries().map_err(Error::Io)? {
                    let mut entry = entry.map_err(Error::Io)?;
                    if !entry.header().entry_type().is_file() {
                        continue;
                    }
                    let name = entry.path().map_err(Error::Io)?.to_string_lossy().into_owned();
                    let mut content = Vec::new();
                    std::io::Read::read_to_end(&mut entry, &mut content).map_err(Error::Io)?;
                    self.files
                        .lock()
                        .unwrap()
                        .entry(container_id.to_string())
                        .or_default()
                        .insert(join_container_path(dir, &name), content);
                }
            }

            ["tar", "cf", "-", "-C", dir, base] => {
                let target = join_container_path(dir, base);
                let files = self.container_files(container_id);
                let mut builder = tar::Builder::new(Vec::new());
                let mut found = false;
                for (path, content) in &files {
                    let name = if path == &target {
                        Some(base.to_string())
                    } else {
                        path.strip_prefix(&format!("{target}/"))
                            .map(|rest| format!("{base}/{rest}"))
                    };
                    if let Some(name) = name {
                        found = true;
                        let mut header = tar::Header::new_gnu();
                        header.set_entry_type(tar::EntryType::Regular);
                        header.set_size(content.len() as u64);
                        header.set_mode(0o644);
                        builder.append_data(&mut header, name, &content[..]).unwrap();
                    }
                }
                if found {
                    stdout_bytes = builder.into_inner().unwrap();
                } else {
                    exit_code = 2;
                    stderr_bytes = format!("tar: {target}: No such file or directory").into_bytes();
                }
            }

            [_, "-c", command] => {
                if let Some(path) = command.strip_prefix("touch ") {
                    self.files
                        .lock()
                        .unwrap()
                        .entry(container_id.to_string())
                        .or_default()
                        .insert(path.trim().to_string(), Vec::new());
                } else if let Some((code, out, err)) =
                    self.run_results.lock().unwrap().get(*command).cloned()
                {
                    exit_code = code;
                    stdout_bytes = out.into_bytes();
                    stderr_bytes = err.into_bytes();
                }
            }

            _ => {}
        }

        if let Some(mut out) = streams.stdout.take() {
            let _ = out.write_all(&stdout_bytes).await;
            let _ = out.shutdown().await;
        }
        if let Some(mut err) = streams.stderr.take() {
            let _ = err.write_all(&stderr_bytes).await;
            let _ = err.shutdown().await;
        }

        Ok(exit_code)
    }

    async fn close_stdin(&self, _container_id: &str, _exec_id: &str) -> Result<()> {
        Ok(())
    }

    async fn snapshot_diff(
        &self,
        snapshot_key: &str,
        _snapshotter: &str,
    ) -> Result<(Descriptor, String)> {
        let data = format!("layer-{snapshot_key}").into_bytes();
        let desc = Descriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            digest: digest_bytes(&data),
            size: data.len() as i64,
            platform: None,
            annotations: None,
        };
        self.blobs.lock().unwrap().insert(desc.digest.clone(), data);
        Ok((desc, format!("sha256:diff-{snapshot_key}")))
    }

    async fn export_archive(
        &self,
        root: &Descriptor,
        reference: &str,
        platform: &OciPlatform,
        path: &Path,
    ) -> Result<()> {
        self.exports.lock().unwrap().push(ExportCall {
            root: root.clone(),
            reference: reference.to_string(),
            platform: platform.clone(),
            path: path.to_path_buf(),
        });
        std::fs::write(path, b"oci-archive").map_err(Error::Io)?;
        Ok(())
    }
}
