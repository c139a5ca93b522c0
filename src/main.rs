use clap::Parser;
use futures_util::FutureExt;
use hookrelay::server::HookServerBuilder;
use std::{error::Error, path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

/// Captures HTTP requests per identifier and relays them to other endpoints on demand.
#[derive(Parser, Debug)]
#[command(version)]
struct ExecutionParameters {
    /// Port to listen on.
    #[arg(short, long, env = "HOOKRELAY_PORT", default_value = "5000")]
    pub port: u16,
    /// Listen on all interfaces instead of only on localhost.
    #[arg(short, long, env = "HOOKRELAY_EXPOSE")]
    pub expose: bool,
    /// Directory that receives records and uploaded files.
    #[arg(short, long, env = "HOOKRELAY_STORAGE_DIR", default_value = "storage")]
    pub storage_dir: PathBuf,
    /// Relay timeout in seconds.
    #[arg(long, env = "HOOKRELAY_RELAY_TIMEOUT", default_value = "15")]
    pub relay_timeout: u64,
    /// Uploaded files above this many bytes are recorded as failed uploads.
    #[arg(long, env = "HOOKRELAY_MAX_UPLOAD_SIZE")]
    pub max_upload_size: Option<usize>,
    /// Log one line per handled request.
    #[arg(long, env = "HOOKRELAY_ACCESS_LOG")]
    pub print_access_log: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hookrelay=info")),
        )
        .init();

    let params = ExecutionParameters::parse();

    tracing::info!(
        "Starting {} server V{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let server = HookServerBuilder::new()
        .port(params.port)
        .expose(params.expose)
        .storage_dir(params.storage_dir)
        .relay_timeout(Duration::from_secs(params.relay_timeout))
        .max_upload_size_option(params.max_upload_size)
        .print_access_log(params.print_access_log)
        .build()?;

    let shutdown = tokio::signal::ctrl_c().map(|_| ());
    server.start_with_signals(None, shutdown).await?;

    Ok(())
}
