//! Signaling relay server binary entry point
//!
//! Accepts WebSocket connections, lets each claim a handle and forwards
//! negotiation and call-control messages between handles.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:8080
//! cargo run -p peerline-signaling-server
//!
//! # Custom port and bind address
//! WS_PORT=9000 cargo run -p peerline-signaling-server -- --bind 127.0.0.1
//!
//! # Verbose relay logging
//! RUST_LOG=peerline_signaling=debug cargo run -p peerline-signaling-server
//! ```

use clap::Parser;
use peerline_signaling::{RelayConfig, RelayEvent, RelayServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Peerline signaling relay
///
/// Handle registry, search and message forwarding for peer-to-peer sessions.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = 8080, env = "WS_PORT")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "SIGNALING_BIND_ADDRESS")]
    bind: String,

    /// Per-channel outbound queue capacity
    #[arg(long, default_value_t = 256, env = "SIGNALING_QUEUE_CAPACITY")]
    queue_capacity: usize,

    /// Maximum handle length in bytes
    #[arg(long, default_value_t = 64, env = "SIGNALING_MAX_HANDLE_LEN")]
    max_handle_len: usize,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_address: self.bind.clone(),
            port: self.port,
            outbound_queue_capacity: self.queue_capacity,
            max_handle_len: self.max_handle_len,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, shutting down relay...");
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = args.relay_config();
    info!(
        version = peerline_signaling::version(),
        bind = %config.bind_address,
        port = config.port,
        queue_capacity = config.outbound_queue_capacity,
        "Signaling relay starting"
    );

    let (event_tx, event_rx) = mpsc::channel(1024);
    let events_task = tokio::spawn(log_relay_events(event_rx));

    let server = RelayServer::new_with_events(config, Some(event_tx))?;
    let handle = server.start().await?;
    info!("Relay accepting connections on {}", handle.url());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, closing channels...");
    handle.shutdown().await;
    events_task.abort();
    info!("Relay shut down gracefully");

    Ok(())
}

async fn log_relay_events(mut rx: mpsc::Receiver<RelayEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RelayEvent::Registered { handle, online } => {
                info!(handle = %handle, online, "User online");
            }
            RelayEvent::Unregistered { handle, online } => {
                info!(handle = %handle, online, "User offline");
            }
            RelayEvent::Forwarded { kind, from, to } => {
                debug!(%kind, from = %from, to = %to, "Forwarded");
            }
            RelayEvent::ForwardFailed {
                kind,
                from,
                to,
                reason,
            } => {
                warn!(%kind, from = ?from, to = %to, reason = %reason, "Forward failed");
            }
        }
    }
}

fn init_tracing() {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["signaling-server"]);
        let config = args.relay_config();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "signaling-server",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--queue-capacity",
            "8",
        ]);
        let config = args.relay_config();
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.outbound_queue_capacity, 8);
    }
}
