use std::net::SocketAddr;

use clap::Parser;
use cmux_ws_relay::{spawn_relay, RelayConfig, DEFAULT_PORT};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "WebSocket to TCP relay")]
struct Args {
    /// Address the relay accepts upgrade requests on.
    #[arg(long, env = "CMUX_WS_RELAY_LISTEN", default_value = "0.0.0.0:39390")]
    listen: SocketAddr,
    /// Destination port used when a request omits `port`.
    #[arg(
        long,
        env = "CMUX_WS_RELAY_DEFAULT_PORT",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    default_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .compact()
        .init();

    let config = RelayConfig {
        listen: args.listen,
        default_port: args.default_port,
    };

    let (bound_addr, handle) = match spawn_relay(config, async {
        let _ = tokio::signal::ctrl_c().await;
    }) {
        Ok(res) => res,
        Err(err) => {
            error!(error = %err, "failed to start relay");
            std::process::exit(1);
        }
    };

    info!(listen = %bound_addr, default_port = args.default_port, "websocket relay ready");

    if let Err(err) = handle.await {
        error!(error = %err, "relay task exited unexpectedly");
        std::process::exit(1);
    }
}
