// CLI entry point for the lockstep relay.
//
// Starts a standalone relay server that peers connect to over WebSocket.
// See `server.rs` for the networking architecture and `network.rs` for the
// per-network state.
//
// Usage:
//   relay [OPTIONS]
//     --host <HOST>                Bind address (default: 0.0.0.0)
//     --port <PORT>                Listen port (default: 8080)
//     --grace-secs <N>             Empty-network grace period (default: 30)
//     --idle-timeout-secs <N>      Idle connection timeout (default: 1200)
//     -v, --verbose                Debug logging
// Every option can also be set through a `LOCKSTEP_*` environment variable.

use std::time::Duration;

use clap::Parser;
use lockstep_relay::{RelayConfig, start_relay};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Relay server for optimistic state replication", long_about = None)]
struct Args {
    #[arg(long, env = "LOCKSTEP_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "LOCKSTEP_PORT", default_value_t = 8080)]
    port: u16,

    /// Seconds an empty network survives before it is removed
    #[arg(long, env = "LOCKSTEP_GRACE_SECS", default_value_t = 30)]
    grace_secs: u64,

    /// Seconds of silence after which a connection is closed
    #[arg(long, env = "LOCKSTEP_IDLE_TIMEOUT_SECS", default_value_t = 20 * 60)]
    idle_timeout_secs: u64,

    /// Enable debug logging
    #[arg(long, short = 'v', env = "LOCKSTEP_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "lockstep_relay=debug,tower_http=debug"
    } else {
        "lockstep_relay=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        empty_network_grace: Duration::from_secs(args.grace_secs),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        ..RelayConfig::default()
    };

    let (handle, _addr) = start_relay(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.stop().await;
    Ok(())
}
