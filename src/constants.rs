//! Constants for the build daemon.
//!
//! Engine identifiers, OCI media types, label keys, and I/O sizes are
//! defined here to keep magic values out of the rest of the codebase.

/// Daemon version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name used for directory, socket, and group naming.
pub const DAEMON_NAME: &str = "cruxd";

// =============================================================================
// Engine Identifiers
// =============================================================================

/// Snapshotter used for container filesystems. fuse-overlayfs provides
/// overlay semantics without requiring root privileges (no mount(2)),
/// allowing the daemon to run as a regular user where the engine supports it.
pub const SNAPSHOTTER: &str = "fuse-overlayfs";

/// OCI runtime shim for running containers.
pub const OCI_RUNTIME: &str = "io.containerd.runc.v2";

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type.
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Config media type.
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (uncompressed tar).
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// OCI Layer media type (gzip compressed).
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker manifest list media type, accepted alongside the OCI index type.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image manifest media type, accepted alongside the OCI manifest type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

// =============================================================================
// Content Labels
// =============================================================================

/// Label carrying the config digest reachable from a manifest blob.
///
/// The engine's garbage collector traces these references; ephemeral blobs
/// without them are collected as soon as their lease expires.
pub const GC_LABEL_CONFIG: &str = "containerd.io/gc.ref.content.config";

/// Label prefix for layer digests reachable from a manifest blob.
pub const GC_LABEL_LAYER_PREFIX: &str = "containerd.io/gc.ref.content.l.";

/// Label prefix for manifest digests reachable from an index blob.
pub const GC_LABEL_MANIFEST_PREFIX: &str = "containerd.io/gc.ref.content.m.";

/// Annotation key recording an image's original reference in an exported
/// archive.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

// =============================================================================
// Export
// =============================================================================

/// Filename of the OCI archive produced by an export.
pub const EXPORT_FILENAME: &str = "image.tar";

// =============================================================================
// I/O Sizes
// =============================================================================

/// Buffer size for the in-memory pipes joining tar producers and consumers.
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;
