use anyhow::Result;
use clap::Parser;
use lsp_session_daemon::{ApiServer, SessionManager};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "LSP Session Daemon - persistent LSP broker for a single workspace"
)]
struct Args {
    /// TCP port for the client API
    #[clap(short, long, default_value_t = 9999)]
    port: u16,

    /// LSP server executable to spawn
    #[clap(short, long)]
    command: String,

    /// Workspace root directory handed to the LSP server
    #[clap(short, long, default_value = "/projects")]
    workspace: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, default_value = "info")]
    log_level: String,

    /// Arguments forwarded to the LSP server command
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    lsp_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting LSP session daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Workspace: {}", args.workspace.display());
    info!("LSP command: {} {:?}", args.command, args.lsp_args);

    let workspace = if args.workspace.is_absolute() {
        args.workspace.clone()
    } else {
        std::env::current_dir()?.join(&args.workspace)
    };
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    let session = SessionManager::start(&args.command, &args.lsp_args, &workspace).await?;
    let watcher = session.start_file_watcher();

    let api = ApiServer::bind(args.port).await?;

    tokio::select! {
        _ = api.run(session.clone()) => {}
        _ = session.transport_closed() => {
            error!("LSP transport closed; shutting down");
        }
        result = shutdown_signal() => {
            if let Err(e) = result {
                error!("signal handler error: {}", e);
            }
            info!("Shutting down...");
        }
    }

    watcher.abort();
    session.shutdown().await;

    info!("Daemon shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
