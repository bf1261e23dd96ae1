//! Layer extraction and snapshot diffing for the local engine.
//!
//! Extraction applies OCI layer tars onto a rootfs directory, honouring
//! whiteout markers and refusing entries that would escape the rootfs.
//! Diffing is the inverse: the rootfs is compared against the baseline
//! captured at container creation and the changes are materialised as a new
//! gzip-compressed layer, with whiteout entries for deletions.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

use crate::error::{Error, Result};
use crate::oci::digest_bytes;

/// Prefix marking a deleted file in an overlay layer.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Signature of one filesystem entry, used for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub(crate) enum FileSig {
    Dir { mode: u32 },
    File { size: u64, mtime_ns: i64, mode: u32 },
    Symlink { target: String },
}

/// Snapshot of a rootfs tree: relative path to entry signature.
pub(crate) type Baseline = BTreeMap<String, FileSig>;

/// Applies a single layer blob onto a rootfs directory.
pub(crate) fn extract_layer(
    data: &[u8],
    media_type: &str,
    digest: &str,
    rootfs: &Path,
) -> Result<()> {
    debug!("extracting layer {}", digest);

    if media_type.ends_with("+gzip") {
        apply_tar(Archive::new(GzDecoder::new(data)), rootfs, digest)
    } else {
        apply_tar(Archive::new(data), rootfs, digest)
    }
    .map_err(|e| match e {
        Error::PathTraversal { .. } | Error::LayerExtractionFailed { .. } => e,
        other => Error::LayerExtractionFailed {
            digest: digest.to_string(),
            reason: other.to_string(),
        },
    })
}

fn apply_tar<R: Read>(mut archive: Archive<R>, rootfs: &Path, digest: &str) -> Result<()> {
    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let path = entry.path().map_err(Error::Io)?.into_owned();

        let path_str = path.to_string_lossy();
        if path_str.contains("..") || path_str.starts_with('/') {
            return Err(Error::PathTraversal {
                path: path_str.to_string(),
            });
        }

        // Whiteout: delete the marked path instead of unpacking the entry.
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
            let target_path = rootfs
                .join(path.parent().unwrap_or(Path::new("")))
                .join(target);
            if target_path.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&target_path);
                let _ = fs::remove_dir_all(&target_path);
            }
            continue;
        }

        // Symlink and hardlink targets must stay within the rootfs.
        let entry_type = entry.header().entry_type();
        if (entry_type.is_symlink() || entry_type.is_hard_link())
            && let Ok(Some(target)) = entry.link_name()
        {
            validate_link_target(&path, &target)?;
        }

        entry.unpack_in(rootfs).map_err(|e| Error::LayerExtractionFailed {
            digest: digest.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Rejects link targets that resolve outside the rootfs.
fn validate_link_target(entry_path: &Path, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy();
    if target_str.starts_with('/') {
        // Absolute targets are relative to the rootfs but must not climb.
        if target_str.contains("..") {
            return Err(Error::PathTraversal {
                path: format!("link target: {target_str}"),
            });
        }
        return Ok(());
    }

    let parent = entry_path.parent().unwrap_or(Path::new(""));
    let mut depth: i32 = parent.components().count() as i32;
    for component in target.components() {
        match component {
            std::path::Component::ParentDir => depth -= 1,
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(Error::PathTraversal {
                path: format!("link target escapes rootfs: {target_str}"),
            });
        }
    }
    Ok(())
}

/// Records the signature of every entry under a rootfs.
pub(crate) fn capture_baseline(rootfs: &Path) -> Result<Baseline> {
    let mut baseline = Baseline::new();
    walk(rootfs, rootfs, &mut baseline)?;
    Ok(baseline)
}

fn walk(root: &Path, dir: &Path, out: &mut Baseline) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(Error::runtime)?
            .to_string_lossy()
            .into_owned();

        let meta = fs::symlink_metadata(&path).map_err(Error::Io)?;
        let sig = if meta.file_type().is_symlink() {
            FileSig::Symlink {
                target: fs::read_link(&path)
                    .map_err(Error::Io)?
                    .to_string_lossy()
                    .into_owned(),
            }
        } else if meta.is_dir() {
            FileSig::Dir { mode: mode_of(&meta) }
        } else {
            FileSig::File {
                size: meta.len(),
                mtime_ns: mtime_ns(&meta),
                mode: mode_of(&meta),
            }
        };

        let is_dir = meta.is_dir() && !meta.file_type().is_symlink();
        out.insert(rel, sig);
        if is_dir {
            walk(root, &path, out)?;
        }
    }
    Ok(())
}

/// Computes the changes between a rootfs and its baseline as a gzip layer.
///
/// Returns the compressed layer bytes and the diff id (the digest of the
/// uncompressed tar stream).
pub(crate) fn diff_layer(rootfs: &Path, baseline: &Baseline) -> Result<(Vec<u8>, String)> {
    let current = capture_baseline(rootfs)?;

    let mut builder = Builder::new(Vec::new());
    for (path, sig) in &current {
        if baseline.get(path) == Some(sig) {
            continue;
        }
        append_entry(&mut builder, rootfs, path, sig)?;
    }

    // Deletions become whiteout entries. A deleted directory covers its
    // children, so paths under an already-deleted ancestor are skipped.
    let mut deleted: Vec<&str> = Vec::new();
    for path in baseline.keys() {
        if current.contains_key(path) {
            continue;
        }
        if deleted
            .iter()
            .any(|d| path.starts_with(&format!("{d}/")))
        {
            continue;
        }
        deleted.push(path);
        append_whiteout(&mut builder, path)?;
    }

    let tar_bytes = builder.into_inner().map_err(Error::Io)?;
    let diff_id = digest_bytes(&tar_bytes);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes).map_err(Error::Io)?;
    let compressed = encoder.finish().map_err(Error::Io)?;

    debug!(
        "snapshot diff: {} bytes compressed, diff id {}",
        compressed.len(),
        diff_id
    );
    Ok((compressed, diff_id))
}

fn append_entry(
    builder: &mut Builder<Vec<u8>>,
    rootfs: &Path,
    path: &str,
    sig: &FileSig,
) -> Result<()> {
    let mut header = Header::new_gnu();
    match sig {
        FileSig::Dir { mode } => {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(*mode);
            header.set_size(0);
            builder
                .append_data(&mut header, format!("{path}/"), std::io::empty())
                .map_err(Error::Io)?;
        }
        FileSig::File { size, mtime_ns, mode } => {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(*mode);
            header.set_size(*size);
            header.set_mtime((*mtime_ns / 1_000_000_000) as u64);
            let file = fs::File::open(rootfs.join(path)).map_err(Error::Io)?;
            builder
                .append_data(&mut header, path, file)
                .map_err(Error::Io)?;
        }
        FileSig::Symlink { target } => {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, path, target)
                .map_err(Error::Io)?;
        }
    }
    Ok(())
}

fn append_whiteout(builder: &mut Builder<Vec<u8>>, path: &str) -> Result<()> {
    let (dir, base) = match path.rsplit_once('/') {
        Some((dir, base)) => (format!("{dir}/"), base),
        None => (String::new(), path),
    };
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    builder
        .append_data(
            &mut header,
            format!("{dir}{WHITEOUT_PREFIX}{base}"),
            std::io::empty(),
        )
        .map_err(Error::Io)
}

fn mode_of(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o755
    }
}

fn mtime_ns(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_gz_tar(data: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = Archive::new(GzDecoder::new(data));
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((path, content));
        }
        out
    }

    #[test]
    fn diff_captures_added_and_changed_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("unchanged"), b"same").unwrap();
        fs::write(temp.path().join("changed"), b"before").unwrap();
        let baseline = capture_baseline(temp.path()).unwrap();

        fs::write(temp.path().join("changed"), b"after!").unwrap();
        fs::write(temp.path().join("added"), b"new").unwrap();

        let (layer, diff_id) = diff_layer(temp.path(), &baseline).unwrap();
        assert!(diff_id.starts_with("sha256:"));

        let entries = read_gz_tar(&layer);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"added"));
        assert!(names.contains(&"changed"));
        assert!(!names.contains(&"unchanged"));
    }

    #[test]
    fn diff_emits_whiteouts_for_deletions() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("dir")).unwrap();
        fs::write(temp.path().join("dir/inner"), b"x").unwrap();
        fs::write(temp.path().join("gone"), b"y").unwrap();
        let baseline = capture_baseline(temp.path()).unwrap();

        fs::remove_file(temp.path().join("gone")).unwrap();
        fs::remove_dir_all(temp.path().join("dir")).unwrap();

        let (layer, _) = diff_layer(temp.path(), &baseline).unwrap();
        let names: Vec<String> = read_gz_tar(&layer).into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&".wh.gone".to_string()));
        assert!(names.contains(&".wh.dir".to_string()));
        // Children of a deleted directory are covered by its whiteout.
        assert!(!names.iter().any(|n| n.contains("inner")));
    }

    #[test]
    fn extract_then_diff_round_trip() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("f"), b"hello\n").unwrap();
        let (layer, _) = diff_layer(src.path(), &Baseline::new()).unwrap();

        let dst = TempDir::new().unwrap();
        extract_layer(
            &layer,
            "application/vnd.oci.image.layer.v1.tar+gzip",
            "sha256:test",
            dst.path(),
        )
        .unwrap();
        assert_eq!(fs::read(dst.path().join("f")).unwrap(), b"hello\n");
    }

    #[test]
    fn extract_applies_whiteouts() {
        let rootfs = TempDir::new().unwrap();
        fs::write(rootfs.path().join("doomed"), b"x").unwrap();

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, ".wh.doomed", std::io::empty())
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        extract_layer(
            &tar_bytes,
            "application/vnd.oci.image.layer.v1.tar",
            "sha256:test",
            rootfs.path(),
        )
        .unwrap();
        assert!(!rootfs.path().join("doomed").exists());
    }

    #[test]
    fn extract_rejects_path_traversal() {
        let rootfs = TempDir::new().unwrap();

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(3);
        header.set_mode(0o644);
        // The `tar` crate's `set_path` rejects `..` components outright, so the
        // malicious name is written directly into the raw header bytes to
        // bypass that client-side validation and exercise `extract_layer`'s own
        // path-traversal check.
        let name = b"../escape";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"out"[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let err = extract_layer(
            &tar_bytes,
            "application/vnd.oci.image.layer.v1.tar",
            "sha256:test",
            rootfs.path(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
    }
}
