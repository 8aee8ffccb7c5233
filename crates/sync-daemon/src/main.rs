//! bookmark-sync: keeps a JSON bookmarks file in sync with other replicas
//! through one shared document in a GitHub Gist.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bookmark_sync_daemon::mock_server::{self, MockGists};
use bookmark_sync_daemon::config::expand_tilde;
use bookmark_sync_daemon::{ConfigArgs, Daemon, Status};

#[derive(Parser, Debug)]
#[command(name = "bookmark-sync")]
#[command(about = "Whole-document bookmark sync over a GitHub Gist")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the bookmarks file and sync automatically
    Run(ConfigArgs),

    /// Run one sync cycle and exit
    Sync(ConfigArgs),

    /// Show replica state
    Status(ConfigArgs),

    /// Serve an in-memory Gist API for local testing
    MockServer {
        /// Port to listen on
        #[arg(long, default_value_t = 3000, env = "MOCK_GIST_PORT")]
        port: u16,

        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1", env = "MOCK_GIST_BIND")]
        bind: String,

        /// Require this token on every gist request
        #[arg(long, env = "MOCK_GIST_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Keep gists and the debug log in this directory across restarts
        #[arg(long, env = "MOCK_GIST_DATA_DIR")]
        data_dir: Option<String>,

        /// Serve files longer than this many bytes truncated, as GitHub does past 1 MB
        #[arg(long)]
        truncate_above: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,bookmark_sync_core=debug,bookmark_sync_daemon=debug"
    } else {
        "info,bookmark_sync_core=info,bookmark_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run(args) => {
            let daemon = Daemon::open(args.resolve()).await?;
            info!(
                "Starting bookmark-sync, replica {}",
                daemon.orchestrator().replica_id()
            );
            daemon.run(shutdown_signal()).await?;
            info!("Shutting down");
        }
        Command::Sync(args) => {
            let daemon = Daemon::open(args.resolve()).await?;
            let report = daemon.sync_now().await?;
            println!(
                "Synced: {} created, {} deleted, {} failed, {} folders merged, {} published",
                report.created,
                report.deleted,
                report.failed,
                report.merged_folders,
                report.published
            );
            if report.document_created {
                println!("Created the shared document");
            }
        }
        Command::Status(args) => {
            let status = Status::load(&args.resolve()).await?;
            println!("Replica:    {} ({})", status.replica_id, status.device_name);
            match status.last_sync {
                Some(at) => println!("Last sync:  {} ms since epoch", at),
                None => println!("Last sync:  never"),
            }
            println!("Bookmarks:  {}", status.bookmarks);
            println!("Tombstones: {}", status.tombstones);
            println!("Gist:       {}", status.gist_id.as_deref().unwrap_or("none"));
        }
        Command::MockServer {
            port,
            bind,
            token,
            data_dir,
            truncate_above,
        } => {
            let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
            let mut state = match (data_dir, token) {
                (Some(dir), token) => MockGists::open(expand_tilde(&dir), token)?,
                (None, Some(token)) => MockGists::with_token(token),
                (None, None) => MockGists::new(),
            };
            if let Some(limit) = truncate_above {
                state = state.with_truncation(limit);
            }
            let state = Arc::new(state);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Mock Gist server running on http://{}", addr);
            mock_server::serve(listener, state, shutdown_signal()).await?;
            info!("Mock Gist server shut down");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
