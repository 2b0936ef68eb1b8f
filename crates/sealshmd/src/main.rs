use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;
use sealshm_core::HandoffConfig;
use sealshm_core::listener::Listener;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sealshmd", version)]
struct Cli {
    /// Unix socket path to bind (default: ./sealshm.sock).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Size in bytes of every region handed out.
    #[arg(long)]
    region_size: Option<NonZeroUsize>,

    /// Text placed in front of each connection's tag.
    #[arg(long)]
    prefix: Option<String>,
}

impl Cli {
    fn into_config(self) -> HandoffConfig {
        let mut config = HandoffConfig::for_daemon();
        if let Some(socket) = self.socket {
            config = config.with_socket_path(socket);
        }
        if let Some(size) = self.region_size {
            config = config.with_region_size(size);
        }
        if let Some(prefix) = self.prefix {
            config = config.with_message_prefix(prefix);
        }
        config
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = Cli::parse().into_config();
    if let Err(e) = run(config).await {
        eprintln!("sealshmd: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: HandoffConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut listener = Listener::bind(&config)?;
    let _socket_guard = SocketGuard::new(listener.path().to_path_buf());

    // The accept loop is blocking and strictly sequential, so it gets its own
    // thread. It only returns, with an error, when accept fails.
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("sealshmd-accept".into())
        .spawn(move || {
            let _ = done_tx.send(listener.run());
        })?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested (ctrl-c)");
        }
        _ = sigterm.recv() => {
            info!("shutdown requested (sigterm)");
        }
        res = done_rx => {
            match res {
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err("accept loop exited unexpectedly".into()),
            }
        }
    }

    Ok(())
}

struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
