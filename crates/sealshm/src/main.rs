use std::num::NonZeroUsize;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::Parser;
use sealshm_core::{Consumer, HandoffConfig, HandoffError};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "sealshm", version)]
struct Cli {
    /// Override the Unix socket path (otherwise uses SEALSHM_SOCK / ./sealshm.sock).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Region size the producer is expected to hand out.
    #[arg(long)]
    region_size: Option<NonZeroUsize>,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let mut config = HandoffConfig::for_client();
    if let Some(socket) = cli.socket {
        config = config.with_socket_path(socket);
    }
    if let Some(size) = cli.region_size {
        config = config.with_region_size(size);
    }

    match fetch_message(&config) {
        Ok(message) => println!("Message: {message}"),
        Err(e) => {
            eprintln!("sealshm: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn fetch_message(config: &HandoffConfig) -> Result<String, HandoffError> {
    let conn = UnixStream::connect(&config.socket_path).map_err(|e| {
        HandoffError::resource(
            "connect",
            std::io::Error::new(
                e.kind(),
                format!(
                    "{e} (is sealshmd running? expected socket at {})",
                    config.socket_path.display()
                ),
            ),
        )
    })?;

    let region = Consumer::new(config).receive(&conn)?;
    debug!(seals = %region.seals(), "region verified");

    Ok(region.message()?.to_string_lossy().into_owned())
}
