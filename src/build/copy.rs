//! Copy operations: host to container and container to container.
//!
//! A copy instruction is `"<src> <dest>"`. Host sources resolve against the
//! build context and are streamed in as a tar archive rooted at the
//! destination's base name. A source of the form `<stage>:<path>` reads
//! from a previously built stage's container instead, piping
//! `tar cf -` in the source container straight into `tar xf -` in the
//! destination container.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tar::Builder;
use tracing::debug;

use crate::constants::PIPE_BUFFER_SIZE;
use crate::container::{Container, base_name, parent_dir};
use crate::error::{Error, Result};

/// Executes a copy operation against the stage container.
pub(crate) async fn execute_copy(
    ctr: &Container,
    copy_str: &str,
    workdir: &str,
    build_ctx: &Path,
    stages: &HashMap<String, Container>,
) -> Result<()> {
    let (src, dest) = parse_copy(copy_str, workdir)?;

    // Ensure the destination parent directory exists.
    let dest_dir = parent_dir(&dest);
    ctr.mkdir_all(&dest_dir)
        .await
        .map_err(|e| Error::Copy(e.to_string()))?;

    if let Some((stage, path)) = parse_stage_copy(&src) {
        return execute_stage_copy(ctr, stages, stage, path, &dest).await;
    }

    execute_host_copy(ctr, &src, &dest, build_ctx).await
}

/// Copies a file or directory from the host into the container.
async fn execute_host_copy(
    ctr: &Container,
    src: &str,
    dest: &str,
    build_ctx: &Path,
) -> Result<()> {
    let src_path = if Path::new(src).is_absolute() {
        PathBuf::from(src)
    } else {
        build_ctx.join(src)
    };

    let metadata = fs::metadata(&src_path).map_err(|e| {
        Error::Copy(format!("cannot stat {}: {e}", src_path.display()))
    })?;

    debug!(
        "copy {} -> {} (dir: {})",
        src_path.display(),
        dest,
        metadata.is_dir()
    );

    let archive_name = base_name(dest);
    let archive = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        if metadata.is_dir() {
            builder
                .append_dir_all(&archive_name, &src_path)
                .map_err(Error::Io)?;
        } else {
            let mut file = fs::File::open(&src_path).map_err(Error::Io)?;
            builder
                .append_file(&archive_name, &mut file)
                .map_err(Error::Io)?;
        }
        builder.into_inner().map_err(Error::Io)
    })
    .await
    .map_err(|e| Error::Copy(e.to_string()))?
    .map_err(|e| Error::Copy(e.to_string()))?;

    ctr.copy_to(Box::new(std::io::Cursor::new(archive)), &parent_dir(dest))
        .await
        .map_err(|e| Error::Copy(e.to_string()))
}

/// Copies a path from a named stage container into the target container.
///
/// The tar stream is piped directly from the source container into the
/// target container. The consumer's error takes priority; the producer's
/// error is checked last.
async fn execute_stage_copy(
    ctr: &Container,
    stages: &HashMap<String, Container>,
    stage: &str,
    path: &str,
    dest: &str,
) -> Result<()> {
    let src_ctr = stages
        .get(stage)
        .ok_or_else(|| Error::UnknownStage(stage.to_string()))?;

    debug!("cross-stage copy {}:{} -> {}", stage, path, dest);

    let (reader, writer) = tokio::io::duplex(PIPE_BUFFER_SIZE);

    let producer = {
        let src = src_ctr.clone();
        let path = path.to_string();
        tokio::spawn(async move { src.copy_from(Box::new(writer), &path).await })
    };

    let consumed = ctr.copy_to(Box::new(reader), &parent_dir(dest)).await;
    let produced = producer
        .await
        .map_err(|e| Error::Copy(format!("tar producer failed: {e}")))?;

    consumed.map_err(|e| Error::Copy(e.to_string()))?;
    produced.map_err(|e| Error::Copy(e.to_string()))?;
    Ok(())
}

/// Parses a cross-stage copy source of the form `stage:path`.
///
/// Returns the stage name and the path within the stage when the source
/// matches the cross-stage format. A leading colon, or a colon after a path
/// separator, is a host path with a literal colon.
pub(crate) fn parse_stage_copy(src: &str) -> Option<(&str, &str)> {
    let idx = src.find(':')?;
    if idx < 1 {
        return None;
    }
    if src[..idx].contains('/') {
        return None;
    }
    Some((&src[..idx], &src[idx + 1..]))
}

/// Parses a copy string into source and destination paths.
///
/// The string must contain exactly two whitespace-separated tokens. A
/// relative destination is joined with the workdir; a relative destination
/// with an empty workdir is an error.
pub(crate) fn parse_copy(s: &str, workdir: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(Error::CopyParse(format!(
            "expected source and destination, got {s:?}"
        )));
    }

    let src = parts[0].to_string();
    let mut dest = parts[1].to_string();

    if !dest.starts_with('/') {
        if workdir.is_empty() {
            return Err(Error::CopyParse(format!(
                "relative dest {dest:?} requires workdir"
            )));
        }
        dest = format!(
            "{}/{}",
            workdir.trim_end_matches('/'),
            dest.trim_end_matches('/')
        );
    }

    Ok((src, dest))
}
