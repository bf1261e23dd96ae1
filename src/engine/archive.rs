//! OCI image layout archives.
//!
//! Archives are tar files in the OCI image layout: an `oci-layout` marker,
//! an `index.json` naming the root descriptors, and the referenced blobs
//! under `blobs/sha256/`. Import feeds the blobs into the content store and
//! returns one image record per index entry; export walks the reachability
//! graph from a root descriptor and writes every needed blob.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

use crate::constants::{ANNOTATION_REF_NAME, MEDIA_TYPE_INDEX};
use crate::error::{Error, Result};
use crate::oci::{self, Descriptor, Index, Manifest};
use crate::platform::OciPlatform;
use crate::storage::BlobStore;

/// Version marker written to the `oci-layout` file.
const LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Reads an OCI archive into the content store.
///
/// Returns one record per entry in the archive's `index.json`, named after
/// the entry's ref-name annotation when present.
pub(crate) fn import_archive(path: &Path, store: &BlobStore) -> Result<Vec<crate::engine::ImageRecord>> {
    let file = File::open(path).map_err(Error::Io)?;
    let mut archive = Archive::new(file);

    let mut index_bytes: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let entry_path = entry.path().map_err(Error::Io)?.into_owned();
        let name = entry_path.to_string_lossy().into_owned();

        if name == "index.json" {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(Error::Io)?;
            index_bytes = Some(data);
        } else if let Some(hex) = name.strip_prefix("blobs/sha256/") {
            if hex.is_empty() || entry.header().entry_type() == EntryType::Directory {
                continue;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(Error::Io)?;
            store.put_blob(&format!("sha256:{hex}"), &data)?;
        }
    }

    let index_bytes = index_bytes
        .ok_or_else(|| Error::Runtime(format!("archive {} has no index.json", path.display())))?;
    let index: Index = serde_json::from_slice(&index_bytes)?;

    let records = index
        .manifests
        .into_iter()
        .map(|desc| {
            let name = desc
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REF_NAME))
                .cloned()
                .unwrap_or_else(|| format!("import-{}", desc.digest));
            crate::engine::ImageRecord { name, target: desc }
        })
        .collect();

    Ok(records)
}

/// Writes the image rooted at `root` as an OCI archive.
///
/// The index entry carries the original image reference as an annotation.
/// Index entries with platform metadata not matching `platform` are dropped
/// along with their blobs.
pub(crate) fn export_archive(
    root: &Descriptor,
    reference: &str,
    platform: &OciPlatform,
    store: &BlobStore,
    path: &Path,
) -> Result<()> {
    let mut blobs: Vec<String> = Vec::new();
    collect_blobs(root, platform, store, &mut blobs)?;

    let mut annotated_root = root.clone();
    let annotations = annotated_root.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(ANNOTATION_REF_NAME.to_string(), reference.to_string());

    let index = Index::new(MEDIA_TYPE_INDEX, vec![annotated_root]);
    let index_bytes = serde_json::to_vec(&index)?;

    let file = File::create(path).map_err(Error::Io)?;
    let mut builder = Builder::new(file);

    append_file(&mut builder, "oci-layout", LAYOUT_CONTENT.as_bytes())?;
    append_dir(&mut builder, "blobs/")?;
    append_dir(&mut builder, "blobs/sha256/")?;
    for digest in &blobs {
        let data = store.get_blob(digest)?;
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        append_file(&mut builder, &format!("blobs/sha256/{hex}"), &data)?;
    }
    append_file(&mut builder, "index.json", &index_bytes)?;

    builder.finish().map_err(Error::Io)?;
    debug!("exported {} blobs to {}", blobs.len(), path.display());
    Ok(())
}

/// Collects every blob digest reachable from a descriptor, in dependency
/// order, filtering index entries by platform.
fn collect_blobs(
    desc: &Descriptor,
    platform: &OciPlatform,
    store: &BlobStore,
    out: &mut Vec<String>,
) -> Result<()> {
    let data = store.get_blob(&desc.digest)?;

    if oci::is_index_type(&desc.media_type) {
        let index: Index = serde_json::from_slice(&data)?;
        for entry in &index.manifests {
            if let Some(p) = &entry.platform
                && !p.matches(platform)
            {
                continue;
            }
            collect_blobs(entry, platform, store, out)?;
        }
    } else if oci::is_manifest_type(&desc.media_type) {
        let manifest: Manifest = serde_json::from_slice(&data)?;
        push_unique(out, &manifest.config.digest);
        for layer in &manifest.layers {
            if !store.has_blob(&layer.digest) {
                return Err(Error::BlobNotFound {
                    digest: layer.digest.clone(),
                });
            }
            push_unique(out, &layer.digest);
        }
    }

    push_unique(out, &desc.digest);
    Ok(())
}

fn push_unique(out: &mut Vec<String>, digest: &str) {
    if !out.iter().any(|d| d == digest) {
        out.push(digest.to_string());
    }
}

fn append_file(builder: &mut Builder<File>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, name, data)
        .map_err(Error::Io)
}

fn append_dir(builder: &mut Builder<File>, name: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    builder
        .append_data(&mut header, name, std::io::empty())
        .map_err(Error::Io)
}
