//! Daemon socket tests: one JSON exchange per connection.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::FakeEngine;
use cruxd::engine::ContainerEngine;
use cruxd::protocol::{
    self, BuildRequest, BuildResult, Command, ContainerExecRequest, ContainerExecResult,
    ContainerRequest, ContainerState, ContainerStatusResult, ContainerUpdateRequest, Envelope,
    ErrorResult, StatusResult,
};
use cruxd::recipe::{Recipe, Stage, Step};
use cruxd::server::{Config, Server};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

struct Harness {
    server: Server,
    engine: Arc<FakeEngine>,
    socket: PathBuf,
    _dir: TempDir,
}

impl Harness {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("cruxd-test.sock");
        let engine = Arc::new(FakeEngine::new());
        let server = Server::with_engine(
            Config {
                socket_path: Some(socket.clone()),
                state_dir: None,
            },
            engine.clone(),
        );
        server.start().unwrap();
        Self {
            server,
            engine,
            socket,
            _dir: dir,
        }
    }

    async fn send(&self, command: Command, payload: impl serde::Serialize) -> Envelope {
        let mut request = protocol::encode(command, payload).unwrap();
        request.push(b'\n');
        self.send_raw(&request).await
    }

    async fn send_raw(&self, request: &[u8]) -> Envelope {
        let mut stream = UnixStream::connect(&self.socket).await.unwrap();
        stream.write_all(request).await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        protocol::decode(line.as_bytes()).unwrap()
    }
}

#[tokio::test]
async fn status_reports_running_daemon() {
    let h = Harness::start();

    let response = h.send(Command::Status, serde_json::Value::Null).await;
    assert_eq!(response.command, Command::Ok);

    let status: StatusResult = protocol::decode_payload(response.payload).unwrap();
    assert!(status.running);
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.builds, 0);

    h.server.stop();
}

#[tokio::test]
async fn malformed_request_yields_error_envelope() {
    let h = Harness::start();

    let response = h.send_raw(b"{\"command\":\"bogus\"}\n").await;
    assert_eq!(response.command, Command::Error);
    let err: ErrorResult = protocol::decode_payload(response.payload).unwrap();
    assert!(!err.message.is_empty());

    h.server.stop();
}

#[tokio::test]
async fn container_status_for_missing_container() {
    let h = Harness::start();

    let response = h
        .send(
            Command::ContainerStatus,
            ContainerRequest { id: "nope".to_string() },
        )
        .await;
    assert_eq!(response.command, Command::Ok);
    let status: ContainerStatusResult = protocol::decode_payload(response.payload).unwrap();
    assert_eq!(status.state, ContainerState::NotCreated);

    h.server.stop();
}

#[tokio::test]
async fn shutdown_command_stops_server_and_removes_socket() {
    let h = Harness::start();

    let response = h.send(Command::Shutdown, serde_json::Value::Null).await;
    assert_eq!(response.command, Command::Ok);

    h.server.wait().await;
    assert!(!h.socket.exists());
}

#[tokio::test]
async fn build_over_socket_counts_builds() {
    let h = Harness::start();
    h.engine.add_archive("/base.tar");
    let output = TempDir::new().unwrap();

    let request = BuildRequest {
        recipe: Recipe {
            stages: vec![Stage {
                name: String::new(),
                from: "/base.tar".to_string(),
                transient: false,
                steps: vec![Step {
                    run: "true".to_string(),
                    ..Step::default()
                }],
            }],
        },
        resource: "svc".to_string(),
        output: output.path().to_path_buf(),
        root: PathBuf::from("."),
        entrypoint: Vec::new(),
        platforms: vec!["linux/amd64".to_string()],
    };

    let response = h.send(Command::Build, request).await;
    assert_eq!(response.command, Command::Ok);
    let result: BuildResult = protocol::decode_payload(response.payload).unwrap();
    assert_eq!(result.output, output.path());
    assert!(output.path().join("image.tar").exists());

    let response = h.send(Command::Status, serde_json::Value::Null).await;
    let status: StatusResult = protocol::decode_payload(response.payload).unwrap();
    assert_eq!(status.builds, 1);

    h.server.stop();
}

#[tokio::test]
async fn failed_build_returns_error_payload() {
    let h = Harness::start();
    h.engine.add_archive("/base.tar");
    h.engine.script_run("make", 2, "", "no rule to make target");
    let output = TempDir::new().unwrap();

    let request = BuildRequest {
        recipe: Recipe {
            stages: vec![Stage {
                name: "pkg".to_string(),
                from: "/base.tar".to_string(),
                transient: false,
                steps: vec![Step {
                    run: "make".to_string(),
                    ..Step::default()
                }],
            }],
        },
        resource: "svc".to_string(),
        output: output.path().to_path_buf(),
        root: PathBuf::from("."),
        entrypoint: Vec::new(),
        platforms: vec!["linux/amd64".to_string()],
    };

    let response = h.send(Command::Build, request).await;
    assert_eq!(response.command, Command::Error);
    let err: ErrorResult = protocol::decode_payload(response.payload).unwrap();
    assert!(err.message.contains("stage \"pkg\""));
    assert!(err.message.contains("exit code 2"));

    h.server.stop();
}

#[tokio::test]
async fn container_exec_over_socket() {
    let h = Harness::start();

    // A running service container.
    let record = h.engine.add_archive("/svc.tar");
    h.engine
        .images
        .lock()
        .unwrap()
        .insert("svc:latest".to_string(), record.target.clone());
    h.engine
        .create_container(cruxd::engine::NewContainer {
            id: "svc-1".to_string(),
            image: "svc:latest".to_string(),
            platform: cruxd::platform::OciPlatform::host(),
            snapshotter: "overlayfs".to_string(),
            runtime: "io.containerd.runc.v2".to_string(),
            args: vec!["sleep".to_string(), "infinity".to_string()],
            host_network: true,
        })
        .await
        .unwrap();
    h.engine.start_task("svc-1").await.unwrap();
    h.engine.script_run("status", 0, "healthy", "");

    let response = h
        .send(
            Command::ContainerExec,
            ContainerExecRequest {
                id: "svc-1".to_string(),
                args: vec!["/bin/sh".to_string(), "-c".to_string(), "status".to_string()],
            },
        )
        .await;
    assert_eq!(response.command, Command::Ok);
    let result: ContainerExecResult = protocol::decode_payload(response.payload).unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "healthy");

    h.server.stop();
}

#[tokio::test]
async fn container_update_replaces_container() {
    let h = Harness::start();

    let record = h.engine.add_archive("/svc.tar");
    h.engine
        .images
        .lock()
        .unwrap()
        .insert("svc:latest".to_string(), record.target.clone());
    h.engine
        .create_container(cruxd::engine::NewContainer {
            id: "svc-1".to_string(),
            image: "svc:latest".to_string(),
            platform: cruxd::platform::OciPlatform::host(),
            snapshotter: "overlayfs".to_string(),
            runtime: "io.containerd.runc.v2".to_string(),
            args: vec!["sleep".to_string(), "infinity".to_string()],
            host_network: true,
        })
        .await
        .unwrap();
    h.engine.start_task("svc-1").await.unwrap();

    let response = h
        .send(
            Command::ContainerUpdate,
            ContainerUpdateRequest {
                id: "svc-1".to_string(),
                tag: "svc:latest".to_string(),
            },
        )
        .await;
    assert_eq!(response.command, Command::Ok);

    // The old container was destroyed and a fresh one started.
    assert!(h
        .engine
        .deleted_containers
        .lock()
        .unwrap()
        .contains(&"svc-1".to_string()));
    assert!(h.engine.containers.lock().unwrap().contains_key("svc-1"));
    assert!(h.engine.tasks.lock().unwrap().contains("svc-1"));

    h.server.stop();
}

#[tokio::test]
async fn image_import_of_unknown_archive_fails() {
    let h = Harness::start();

    let response = h
        .send(
            Command::ImageImport,
            protocol::ImageImportRequest {
                path: PathBuf::from("/missing.tar"),
                tag: "x:latest".to_string(),
            },
        )
        .await;
    assert_eq!(response.command, Command::Error);

    h.server.stop();
}
