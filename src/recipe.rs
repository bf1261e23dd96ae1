//! Typed recipe model.
//!
//! A recipe is an ordered sequence of stages; each stage starts a container
//! from a base image and executes a list of steps. The daemon receives
//! recipes fully parsed over the wire protocol; this module only classifies
//! the base image reference.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A multi-stage container build plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// One container in a recipe's build pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, used for cross-stage copies and container ids. Optional;
    /// unnamed stages are not addressable by later stages.
    #[serde(default)]
    pub name: String,
    /// Base image: a local OCI archive path or a registry reference.
    #[serde(default)]
    pub from: String,
    /// Transient stages are used only as copy sources and are never exported.
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Stage {
    /// Classifies the stage's `from` reference.
    ///
    /// Values that look like filesystem paths (`/...`, `./...`, `../...`)
    /// or end in `.tar` are local OCI archives; anything else is a registry
    /// reference.
    pub fn base_image(&self) -> Result<BaseImage> {
        let from = self.from.trim();
        if from.is_empty() {
            return Err(Error::InvalidImageReference {
                reference: self.from.clone(),
                reason: "stage has no base image".to_string(),
            });
        }

        let is_path = from.starts_with('/')
            || from.starts_with("./")
            || from.starts_with("../")
            || from.ends_with(".tar");
        if is_path {
            Ok(BaseImage::Archive(PathBuf::from(from)))
        } else {
            Ok(BaseImage::Reference(from.to_string()))
        }
    }
}

/// Where a stage's base image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    /// A local OCI archive to import.
    Archive(PathBuf),
    /// A remote reference to pull.
    Reference(String),
}

/// A single recipe instruction.
///
/// A step carries any subset of these fields. Steps with children are
/// groups; steps with a `run` or `copy` value are operations; steps with
/// only `shell`/`workdir`/`env` are standalone modifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    /// Shell command to execute inside the stage container.
    #[serde(default)]
    pub run: String,
    /// Copy instruction: `"<src> <dest>"`.
    #[serde(default)]
    pub copy: String,
    /// Shell override for subsequent run steps.
    #[serde(default)]
    pub shell: String,
    /// Working directory for subsequent operations.
    #[serde(default)]
    pub workdir: String,
    /// Environment variables, merged over previously set ones.
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    /// Nested steps; the group's own modifiers apply to all children.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Step {
    /// Returns true when the step carries an operation.
    pub fn has_operation(&self) -> bool {
        !self.run.is_empty() || !self.copy.is_empty()
    }
}
