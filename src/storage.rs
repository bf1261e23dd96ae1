//! Content-addressed blob store.
//!
//! Stores manifests, configs, and layers by their sha256 digest, sharded as
//! `sha256/<xx>/<hex>` to keep directories small. Writes verify content
//! against the digest and go through a unique temp file plus rename so a
//! crash never leaves a partial blob behind.
//!
//! Blobs can carry reachability labels (`containerd.io/gc.ref.content.*`).
//! The store keeps them as metadata for the engine's reachability analysis;
//! writers attach them so ephemeral manifests stay traceable to their config
//! and layer children.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Content-addressed blob store for OCI objects.
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
    /// Reachability labels per digest.
    labels: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

/// A poisoned label lock degrades to an error instead of a panic.
fn poisoned() -> Error {
    Error::StorageWrite("label map lock poisoned".to_string())
}

impl BlobStore {
    /// Creates a blob store rooted at the given directory.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInit {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        debug!("blob store initialized at {}", base_dir.display());

        Ok(Self {
            base_dir,
            labels: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks whether a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Reads a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Returns the on-disk path for a digest without reading it.
    ///
    /// The digest is sanitized before path construction: only the sha256
    /// algorithm is accepted and the hash is reduced to hex characters, so a
    /// malicious digest cannot traverse out of the store.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = if algo == "sha256" {
            algo
        } else {
            warn!("unsupported digest algorithm {:?}, defaulting to sha256", algo);
            "sha256"
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe_hash.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(prefix).join(&safe_hash)
    }

    /// Stores a blob after verifying its content matches the digest.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        self.put_blob_with_labels(digest, data, BTreeMap::new())
    }

    /// Stores a blob with reachability labels attached.
    ///
    /// Verification rejects any digest that does not match the content, so
    /// a corrupted archive or a tampering registry cannot pollute the store.
    pub fn put_blob_with_labels(
        &self,
        digest: &str,
        data: &[u8],
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let (algo, expected) = digest.split_once(':').unwrap_or(("sha256", digest));
        if algo != "sha256" {
            return Err(Error::StorageWrite(format!(
                "unsupported digest algorithm '{algo}': only sha256 is supported"
            )));
        }

        let computed = hex::encode(Sha256::digest(data));
        if computed != expected {
            return Err(Error::StorageWrite(format!(
                "digest mismatch: expected {expected}, computed {computed}"
            )));
        }

        if !labels.is_empty() {
            self.labels
                .write()
                .map_err(|_| poisoned())?
                .insert(digest.to_string(), labels);
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!("blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWrite(e.to_string()))?;
        }

        // Unique temp name: concurrent writers of the same blob race only on
        // the final rename, which is atomic and content-identical.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWrite(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWrite(e.to_string())
        })?;

        debug!("stored blob {} ({} bytes)", digest, data.len());
        Ok(())
    }

    /// Returns the labels recorded for a digest.
    pub fn blob_labels(&self, digest: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .labels
            .read()
            .map_err(|_| poisoned())?
            .get(digest)
            .cloned()
            .unwrap_or_default())
    }

    /// Removes a blob and its labels.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        self.labels.write().map_err(|_| poisoned())?.remove(digest);

        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWrite(e.to_string()))?;
        }
        Ok(())
    }

    /// Lists all blob digests.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();
        let sha256_dir = self.base_dir.join("sha256");
        if sha256_dir.exists() {
            Self::walk_dir(&sha256_dir, &mut |path| {
                if path.is_file()
                    && let Some(hash) = path.file_name().and_then(|n| n.to_str())
                {
                    digests.push(format!("sha256:{hash}"));
                }
            })?;
        }
        Ok(digests)
    }

    /// Walks a directory recursively.
    fn walk_dir(dir: &Path, callback: &mut impl FnMut(&Path)) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir).map_err(|e| Error::StorageWrite(e.to_string()))? {
            let entry = entry.map_err(|e| Error::StorageWrite(e.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk_dir(&path, callback)?;
            } else {
                callback(&path);
            }
        }
        Ok(())
    }
}
