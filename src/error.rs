//! Error types for the build daemon.

use std::path::PathBuf;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by recipe execution, the container runtime adapter, and
/// the daemon itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Recipe Execution Errors
    // =========================================================================
    /// Malformed copy instruction.
    #[error("invalid copy: {0}")]
    CopyParse(String),

    /// A run step exited with a non-zero code.
    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: u32, stderr: String },

    /// File transfer into or out of a container failed.
    #[error("copy failed: {0}")]
    Copy(String),

    /// Cross-stage copy referenced a stage that is not in scope.
    #[error("unknown stage {0:?}")]
    UnknownStage(String),

    /// Failure while building one stage of a recipe.
    #[error("platform {platform}, stage {stage}: {source}")]
    Stage {
        platform: String,
        stage: String,
        #[source]
        source: Box<Error>,
    },

    /// Failure while executing one step of a stage.
    #[error("step {index}: {source}")]
    Step {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Container Engine Errors
    // =========================================================================
    /// Any failure from the container engine.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A requested engine object does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An engine object with the same name already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// An imported archive contained no images.
    #[error("no images found in archive")]
    EmptyArchive,

    /// An imported archive contained more than one root image.
    #[error("archive contains multiple images")]
    MultipleImages,

    /// An image index contained no manifests.
    #[error("image index has no manifests: {0}")]
    EmptyIndex(String),

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Failed to parse a platform string.
    #[error("invalid platform {0:?}")]
    InvalidPlatform(String),

    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInit { path: PathBuf, reason: String },

    /// Blob not found in the content store.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Content store write failed.
    #[error("failed to write to storage: {0}")]
    StorageWrite(String),

    // =========================================================================
    // Daemon Errors
    // =========================================================================
    /// Output directory or other filesystem operation failed.
    #[error("file system operation failed: {0}")]
    FileSystem(String),

    /// Server setup or socket failure.
    #[error("server error: {0}")]
    Server(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an arbitrary engine failure as a runtime error.
    pub fn runtime(err: impl std::fmt::Display) -> Self {
        Self::Runtime(err.to_string())
    }

    /// Returns true for not-found errors.
    ///
    /// Engine lookups use this the way containerd clients use errdefs:
    /// missing containers and tasks are ordinary states, not failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for already-exists errors.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_includes_platform_and_label() {
        let err = Error::Stage {
            platform: "linux/amd64".to_string(),
            stage: "\"build\"".to_string(),
            source: Box::new(Error::Step {
                index: 2,
                source: Box::new(Error::CommandFailed {
                    code: 1,
                    stderr: "boom".to_string(),
                }),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("platform linux/amd64"));
        assert!(text.contains("stage \"build\""));
    }

    #[test]
    fn classification_helpers() {
        assert!(Error::NotFound("container x".to_string()).is_not_found());
        assert!(!Error::EmptyArchive.is_not_found());
        assert!(Error::AlreadyExists("image y".to_string()).is_already_exists());
    }
}
