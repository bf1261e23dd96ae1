//! Command handlers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{error, info};

use crate::build;
use crate::constants::VERSION;
use crate::protocol::{
    BuildRequest, BuildResult, Command, ContainerExecRequest, ContainerExecResult,
    ContainerRequest, ContainerStatusResult, ContainerUpdateRequest, Envelope, ErrorResult,
    ImageDestroyRequest, ImageImportRequest, ImageStartRequest, StatusResult, decode_payload,
    encode,
};
use crate::server::{ServerState, connection_closed};

type Reader = tokio::io::BufReader<OwnedReadHalf>;

/// Routes a command to the appropriate handler.
pub(super) async fn dispatch(
    state: &Arc<ServerState>,
    envelope: Envelope,
    reader: Reader,
    conn: &mut OwnedWriteHalf,
) {
    match envelope.command {
        Command::Build => handle_build(state, envelope.payload, reader, conn).await,
        Command::Status => handle_status(state, conn).await,
        Command::Shutdown => handle_shutdown(state, conn).await,
        Command::ImageImport => handle_image_import(state, envelope.payload, conn).await,
        Command::ImageStart => handle_image_start(state, envelope.payload, conn).await,
        Command::ImageDestroy => handle_image_destroy(state, envelope.payload, conn).await,
        Command::ContainerStop => handle_container_stop(state, envelope.payload, conn).await,
        Command::ContainerDestroy => handle_container_destroy(state, envelope.payload, conn).await,
        Command::ContainerStatus => handle_container_status(state, envelope.payload, conn).await,
        Command::ContainerExec => handle_container_exec(state, envelope.payload, conn).await,
        Command::ContainerUpdate => handle_container_update(state, envelope.payload, conn).await,
        other => {
            respond_error(conn, format!("unknown command: {other}")).await;
        }
    }
}

/// Writes a JSON envelope response followed by a newline.
pub(super) async fn respond(conn: &mut OwnedWriteHalf, command: Command, payload: impl Serialize) {
    match encode(command, payload) {
        Ok(mut data) => {
            data.push(b'\n');
            let _ = conn.write_all(&data).await;
        }
        Err(err) => error!("encode response failed: {}", err),
    }
}

async fn respond_error(conn: &mut OwnedWriteHalf, message: String) {
    respond(conn, Command::Error, ErrorResult { message }).await;
}

/// Decodes a request payload, responding with an error on failure.
async fn decode_request<T: DeserializeOwned>(
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) -> Option<T> {
    match decode_payload(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            respond_error(conn, err.to_string()).await;
            None
        }
    }
}

/// Executes a recipe against the container runtime.
///
/// The build is cancelled if the client disconnects before it finishes;
/// stage containers are destroyed either way.
async fn handle_build(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    reader: Reader,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<BuildRequest>(payload, conn).await else {
        return;
    };

    let options = build::Options {
        recipe: req.recipe,
        resource: req.resource,
        output: req.output,
        root: req.root,
        entrypoint: req.entrypoint,
        platforms: req.platforms,
    };

    match build::run(&state.runtime, options, connection_closed(reader)).await {
        Ok(result) => {
            *state.builds.lock().expect("build counter lock poisoned") += 1;
            respond(conn, Command::Ok, BuildResult { output: result.output }).await;
        }
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

async fn handle_status(state: &Arc<ServerState>, conn: &mut OwnedWriteHalf) {
    let builds = *state.builds.lock().expect("build counter lock poisoned");
    respond(
        conn,
        Command::Ok,
        StatusResult {
            running: true,
            version: VERSION.to_string(),
            pid: std::process::id(),
            uptime: format_uptime(state.started_at.elapsed()),
            builds,
        },
    )
    .await;
}

async fn handle_shutdown(state: &Arc<ServerState>, conn: &mut OwnedWriteHalf) {
    respond(conn, Command::Ok, serde_json::Value::Null).await;
    info!("shutdown requested");
    state.stop();
}

async fn handle_image_import(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ImageImportRequest>(payload, conn).await else {
        return;
    };
    match state.runtime.import_image(&req.path, &req.tag).await {
        Ok(()) => respond(conn, Command::Ok, serde_json::Value::Null).await,
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

async fn handle_image_start(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ImageStartRequest>(payload, conn).await else {
        return;
    };
    match state.runtime.start_from_tag(&req.tag, &req.id).await {
        Ok(_) => respond(conn, Command::Ok, serde_json::Value::Null).await,
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

async fn handle_image_destroy(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ImageDestroyRequest>(payload, conn).await else {
        return;
    };
    match state.runtime.destroy_image(&req.tag).await {
        Ok(()) => respond(conn, Command::Ok, serde_json::Value::Null).await,
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

async fn handle_container_stop(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ContainerRequest>(payload, conn).await else {
        return;
    };
    match state.runtime.container(&req.id).stop().await {
        Ok(()) => respond(conn, Command::Ok, serde_json::Value::Null).await,
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

async fn handle_container_destroy(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ContainerRequest>(payload, conn).await else {
        return;
    };
    state.runtime.container(&req.id).destroy().await;
    respond(conn, Command::Ok, serde_json::Value::Null).await;
}

async fn handle_container_status(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ContainerRequest>(payload, conn).await else {
        return;
    };
    match state.runtime.container(&req.id).status().await {
        Ok(container_state) => {
            respond(conn, Command::Ok, ContainerStatusResult { state: container_state }).await;
        }
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

async fn handle_container_exec(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ContainerExecRequest>(payload, conn).await else {
        return;
    };
    match state.runtime.container(&req.id).exec_args(&req.args).await {
        Ok(result) => {
            respond(
                conn,
                Command::Ok,
                ContainerExecResult {
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                },
            )
            .await;
        }
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

/// Replaces a container with a fresh one from the current content of its
/// image tag. Used after re-importing a tag to roll a service container
/// onto the new image.
async fn handle_container_update(
    state: &Arc<ServerState>,
    payload: serde_json::Value,
    conn: &mut OwnedWriteHalf,
) {
    let Some(req) = decode_request::<ContainerUpdateRequest>(payload, conn).await else {
        return;
    };

    state.runtime.container(&req.id).destroy().await;
    match state.runtime.start_from_tag(&req.tag, &req.id).await {
        Ok(_) => respond(conn, Command::Ok, serde_json::Value::Null).await,
        Err(err) => respond_error(conn, err.to_string()).await,
    }
}

/// Formats an uptime duration as `1h2m3s`, truncated to seconds.
fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
