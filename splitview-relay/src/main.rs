use clap::Parser;
use splitview_relay::{AppState, serve};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared key-value hub for the tabs of each browser profile.
#[derive(Parser, Debug)]
#[command(name = "splitview-relay")]
struct RelayArgs {
    /// Tabs connect to `ws://<bind-address>/ws`.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind_address: String,
    /// Used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn log_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() {
    let args = RelayArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&args.log_filter))
        .init();

    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_address = %args.bind_address, "bind failed: {}", err);
            std::process::exit(1);
        }
    };

    info!(
        "tabs connect to ws://{}/ws, profiles at http://{}/profiles/<id>",
        args.bind_address, args.bind_address
    );
    if let Err(err) = serve(listener, AppState::new()).await {
        error!("relay stopped: {}", err);
        std::process::exit(1);
    }
}
