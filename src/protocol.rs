//! Wire protocol between the CLI and the daemon.
//!
//! One newline-delimited JSON envelope per connection, one response, server
//! closes. The envelope is `{"command": ..., "payload": ...}`; responses
//! use the `ok` command with a typed payload, or `error` with a message.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::recipe::Recipe;

/// Protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    // Requests.
    Build,
    Status,
    Shutdown,
    ImageImport,
    ImageStart,
    ImageDestroy,
    ContainerStop,
    ContainerDestroy,
    ContainerStatus,
    ContainerExec,
    ContainerUpdate,
    // Responses.
    Ok,
    Error,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", name.as_str().unwrap_or("unknown"))
    }
}

/// One protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub command: Command,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Decodes a single envelope from a line of JSON.
pub fn decode(line: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(line)?)
}

/// Decodes a typed payload out of an envelope.
pub fn decode_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

/// Encodes an envelope with the given payload.
pub fn encode(command: Command, payload: impl Serialize) -> Result<Vec<u8>> {
    let envelope = Envelope {
        command,
        payload: serde_json::to_value(payload)?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

// =============================================================================
// Payloads
// =============================================================================

/// Error response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    pub message: String,
}

/// Build request: execute a recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub recipe: Recipe,
    #[serde(default)]
    pub resource: String,
    pub output: PathBuf,
    #[serde(default)]
    pub root: PathBuf,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// Build response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub output: PathBuf,
}

/// Daemon status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub running: bool,
    pub version: String,
    pub pid: u32,
    pub uptime: String,
    pub builds: u64,
}

/// Import an OCI archive under a tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageImportRequest {
    pub path: PathBuf,
    pub tag: String,
}

/// Start a service container from an imported tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageStartRequest {
    pub tag: String,
    pub id: String,
}

/// Remove an image and the containers created from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDestroyRequest {
    pub tag: String,
}

/// Target a single container by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub id: String,
}

/// Container status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusResult {
    pub state: ContainerState,
}

/// Run a command in a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerExecRequest {
    pub id: String,
    pub args: Vec<String>,
}

/// Exec response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerExecResult {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

/// Replace a container with a fresh one from its image tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUpdateRequest {
    pub id: String,
    pub tag: String,
}

/// Observable container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerState {
    NotCreated,
    Running,
    Stopped,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCreated => write!(f, "not-created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
