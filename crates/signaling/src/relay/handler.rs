//! Per-channel WebSocket loop
//!
//! One task per accepted connection: a writer task drains the channel's
//! bounded outbound queue into the socket, while the reader feeds text frames
//! into the [`Relay`]. Per-channel errors end only that channel.

use super::registry::Relay;
use crate::Error;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

/// Serve a single relay connection until it closes or the server shuts down
pub async fn handle_connection(
    stream: TcpStream,
    relay: Arc<Relay>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    info!("New relay connection from: {}", addr);

    let ws_stream = accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    // Outbound queue for this channel; the relay only ever try_sends into it
    let (tx, mut rx) = mpsc::channel::<String>(relay.config().outbound_queue_capacity);
    let channel = relay.attach(tx);

    let ws_tx = Arc::new(Mutex::new(ws_tx));
    let ws_tx_clone = Arc::clone(&ws_tx);
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut ws_tx = ws_tx_clone.lock().await;
            if let Err(e) = ws_tx.send(Message::Text(msg)).await {
                error!("Failed to send relay frame: {}", e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(msg) = msg else {
                    break;
                };
                match msg {
                    Ok(Message::Text(text)) => match relay.dispatch(channel, &text) {
                        Ok(()) => {}
                        Err(Error::MalformedMessage(reason)) => {
                            warn!(channel = %channel, "Dropping malformed frame from {}: {}", addr, reason);
                        }
                        // The relay already replied with an `error` frame
                        Err(e) => debug!(channel = %channel, "Request from {} refused: {}", addr, e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay connection closed by client: {}", addr);
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        let mut ws_tx = ws_tx.lock().await;
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!(channel = %channel, "Ignoring binary frame from {}", addr);
                    }
                    Err(e) => {
                        error!("Relay connection error from {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Closing relay connection {} for shutdown", addr);
                let mut ws_tx = ws_tx.lock().await;
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // Cleanup on disconnect
    if let Some(handle) = relay.disconnect(channel) {
        info!("Cleaned up handle {} for {}", handle, addr);
    }

    forward_task.abort();

    Ok(())
}
