//! The build daemon.
//!
//! Listens on a Unix domain socket for commands from the companion CLI:
//! recipe builds, image import/start/destroy, and container lifecycle
//! operations.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cruxd::constants::VERSION;
use cruxd::server::{Config, Server};

/// The build daemon.
///
/// Listens on a Unix domain socket for commands from the CLI.
#[derive(Parser, Debug)]
#[command(name = "cruxd", version, about, long_about = None)]
struct Cli {
    /// Suppress informational output.
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug output.
    #[arg(short, long)]
    debug: bool,

    /// Override the default Unix socket path.
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Override the engine state directory.
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon.
    Start,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Version => {
            println!("{VERSION}");
            ExitCode::SUCCESS
        }
        Commands::Start => match run(cli).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{}", err);
                ExitCode::FAILURE
            }
        },
    }
}

/// Runs the daemon until a termination signal arrives or a shutdown
/// command is received over the socket.
async fn run(cli: Cli) -> cruxd::Result<()> {
    let server = Server::new(Config {
        socket_path: cli.socket,
        state_dir: cli.state_dir,
    })?;

    server.start()?;
    info!("cruxd is running (pid {})", std::process::id());

    wait_for_termination(&server).await;

    info!("shutting down");
    server.stop();
    Ok(())
}

async fn wait_for_termination(server: &Server) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            error!("failed to install SIGINT handler: {}", err);
            server.wait().await;
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!("failed to install SIGTERM handler: {}", err);
            server.wait().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        () = server.wait() => {}
    }
}

/// Configures the global logger from CLI flags; `RUST_LOG` wins when set.
fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
