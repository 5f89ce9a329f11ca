use std::{path::PathBuf, time::Duration};

use clap::Parser;
use naragaiden_feed::{AppState, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "naragaiden-feed")]
struct FeedArgs {
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind_address: String,

    /// Exported payload served at `/json`.
    #[arg(long)]
    payload: PathBuf,

    /// Seconds a read of the payload file is reused; 0 re-reads on every request.
    #[arg(long, default_value_t = 10)]
    cache_ttl_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = FeedArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(
        payload = %args.payload.display(),
        cache_ttl_secs = args.cache_ttl_secs,
        "feed starting on {}",
        args.bind_address
    );
    let state = AppState::new(args.payload, Duration::from_secs(args.cache_ttl_secs));
    if let Err(err) = serve(listener, state).await {
        warn!("feed server exited: {}", err);
    }
}
