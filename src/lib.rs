//! # cruxd
//!
//! **Recipe-driven container build daemon**
//!
//! cruxd executes declarative *recipes* (multi-stage container build
//! plans) against a container engine, producing portable OCI image
//! archives. A companion CLI talks to the daemon over a local Unix-domain
//! socket using a newline-delimited JSON protocol; the daemon also exposes
//! image and container lifecycle operations for orchestrating service
//! containers outside the build flow.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           cruxd                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  server        one JSON exchange per socket connection          │
//! │    │                                                            │
//! │  build         stages → steps → modifiers/operations            │
//! │    │           cross-stage copies via paired tar streams        │
//! │    │                                                            │
//! │  runtime       image import/pull, tagging, build containers     │
//! │  container     exec, tar transfer, lifecycle                    │
//! │  export        snapshot diff → ephemeral manifest → archive     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  engine        ContainerEngine trait                            │
//! │                └── LocalEngine (filesystem state, chroot tasks) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Build flow
//!
//! For each target platform, each stage in declaration order: resolve the
//! base image (local OCI archive or registry reference), start a container
//! with a long-running task, execute the stage's steps, and export the
//! final non-transient stage as `<output>/image.tar`. Multi-platform
//! builds write `<output>/<os>-<arch>/image.tar` per target.
//!
//! Exports never mutate the stored image record: the new layer, mutated
//! config, and manifest are ephemeral content-store blobs protected by a
//! lease and written straight into the archive.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cruxd::{Runtime, build, engine::LocalEngine};
//!
//! let engine = Arc::new(LocalEngine::new("/var/lib/cruxd".into())?);
//! let runtime = Runtime::new(engine);
//!
//! let result = build::run(&runtime, build::Options {
//!     recipe,
//!     resource: "my-service".into(),
//!     output: "dist".into(),
//!     root: ".".into(),
//!     entrypoint: vec!["/entrypoint".into()],
//!     platforms: vec!["linux/amd64".into(), "linux/arm64".into()],
//! }, std::future::pending()).await?;
//! ```

pub mod build;
pub mod constants;
pub mod container;
pub mod engine;
pub mod error;
mod export;
pub mod oci;
pub mod paths;
pub mod platform;
pub mod protocol;
pub mod recipe;
pub mod runtime;
pub mod server;
pub mod storage;

pub use container::{Container, ExecResult};
pub use error::{Error, Result};
pub use platform::OciPlatform;
pub use recipe::{Recipe, Stage, Step};
pub use runtime::Runtime;
