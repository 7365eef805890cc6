//! Client actor and its cloneable handle
//!
//! A single task owns the [`ClientCore`]. Commands from [`PeerClient`] handles
//! and events from the relay connection, the peer transports and the capture
//! devices are queued into it and processed one at a time.

use super::core::{ClientCore, ClientSnapshot};
use super::events::{ClientEvent, EventSink};
use super::signaling::{SignalingClient, SignalingEvent};
use crate::call::media::{MediaDevices, MediaEvent, MediaEventSender};
use crate::config::ClientConfig;
use crate::peer::transport::{PeerTransportFactory, TransportEnvelope};
use crate::protocol::Handle;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

enum Command {
    ConnectPeer {
        remote: Handle,
        reply: oneshot::Sender<Result<()>>,
    },
    DisconnectPeer {
        remote: Handle,
        reply: oneshot::Sender<bool>,
    },
    SendData {
        remote: Handle,
        message: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Initiate {
        remote: Handle,
        reply: oneshot::Sender<Result<()>>,
    },
    Accept {
        remote: Handle,
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        remote: Handle,
        reply: oneshot::Sender<Result<()>>,
    },
    End {
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleMicrophone {
        reply: oneshot::Sender<Result<bool>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running client
///
/// Cheap to clone; every clone drives the same actor. The actor stops on
/// [`PeerClient::shutdown`] or once every handle is dropped.
#[derive(Clone)]
pub struct PeerClient {
    signaling: SignalingClient,
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerClient {
    /// Connect to the relay and start the client actor
    ///
    /// Returns the handle and the receiver for [`ClientEvent`]s.
    pub async fn connect(
        config: ClientConfig,
        factory: Arc<dyn PeerTransportFactory>,
        media: Arc<dyn MediaDevices>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let ice_servers = config.ice_servers.clone();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let signaling = SignalingClient::connect(config, signal_tx).await?;

        let (events, event_rx) = EventSink::channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let core = ClientCore::new(
            Arc::new(signaling.clone()),
            factory,
            media,
            ice_servers,
            events,
            transport_tx,
            MediaEventSender::new(media_tx),
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(
            core,
            signaling.clone(),
            command_rx,
            signal_rx,
            transport_rx,
            media_rx,
        ));

        Ok((
            Self {
                signaling,
                commands,
            },
            event_rx,
        ))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::SignalingError("client has shut down".to_string()))?;
        rx.await
            .map_err(|_| Error::SignalingError("client has shut down".to_string()))
    }

    /// Claim `handle` on the relay
    pub async fn register(&self, handle: &str) -> Result<()> {
        self.signaling.register(handle).await
    }

    /// Online handles containing `query` (case-insensitive), excluding ours
    pub async fn search(&self, query: &str) -> Result<Vec<Handle>> {
        self.signaling.search(query).await
    }

    /// Handle we are registered under
    pub fn handle(&self) -> Option<Handle> {
        self.signaling.handle()
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Negotiate a Peer Link to `remote`; returns at once if one exists
    pub async fn connect_peer(&self, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| Command::ConnectPeer { remote, reply })
            .await?
    }

    /// Close the Peer Link to `remote`; false if there was none
    pub async fn disconnect_peer(&self, remote: &str) -> Result<bool> {
        let remote = remote.to_string();
        self.request(|reply| Command::DisconnectPeer { remote, reply })
            .await
    }

    /// Send a JSON message on the data sub-channel to `remote`
    pub async fn send_data(&self, remote: &str, message: Value) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| Command::SendData {
            remote,
            message,
            reply,
        })
        .await?
    }

    /// Call `remote`
    pub async fn initiate_call(&self, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| Command::Initiate { remote, reply })
            .await?
    }

    /// Accept the ringing call from `remote`
    pub async fn accept_call(&self, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| Command::Accept { remote, reply })
            .await?
    }

    /// Decline the ringing call from `remote`
    pub async fn reject_call(&self, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| Command::Reject { remote, reply })
            .await?
    }

    /// Hang up the current call; a no-op without one
    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Mute or unmute the microphone; returns the new enabled state
    pub async fn toggle_microphone(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleMicrophone { reply })
            .await?
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Hang up, close every link and disconnect from the relay
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run(
    mut core: ClientCore,
    signaling: SignalingClient,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
    mut transports: mpsc::UnboundedReceiver<TransportEnvelope>,
    mut media: mpsc::UnboundedReceiver<MediaEvent>,
) {
    debug!("Client actor started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    core.shutdown().await;
                    signaling.disconnect();
                    let _ = reply.send(());
                    break;
                }
                Some(command) => execute(&mut core, command).await,
                None => {
                    debug!("All client handles dropped");
                    core.shutdown().await;
                    signaling.disconnect();
                    break;
                }
            },
            Some(event) = signals.recv() => core.on_signaling_event(event).await,
            Some(envelope) = transports.recv() => core.on_transport_event(envelope).await,
            Some(event) = media.recv() => core.on_media_event(event).await,
        }
    }

    info!("Client actor stopped");
}

async fn execute(core: &mut ClientCore, command: Command) {
    match command {
        Command::ConnectPeer { remote, reply } => {
            let _ = reply.send(core.connect_peer(&remote).await);
        }
        Command::DisconnectPeer { remote, reply } => {
            let _ = reply.send(core.disconnect_peer(&remote).await);
        }
        Command::SendData {
            remote,
            message,
            reply,
        } => {
            let _ = reply.send(core.send_data(&remote, &message).await);
        }
        Command::Initiate { remote, reply } => {
            let _ = reply.send(core.initiate(&remote).await);
        }
        Command::Accept { remote, reply } => {
            let _ = reply.send(core.accept(&remote).await);
        }
        Command::Reject { remote, reply } => {
            let _ = reply.send(core.reject(&remote).await);
        }
        Command::End { reply } => {
            let _ = reply.send(core.end().await);
        }
        Command::ToggleMicrophone { reply } => {
            let _ = reply.send(core.toggle_microphone());
        }
        Command::StartScreenShare { reply } => {
            let _ = reply.send(core.start_screen_share().await);
        }
        Command::StopScreenShare { reply } => {
            let _ = reply.send(core.stop_screen_share().await);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(core.snapshot());
        }
        // handled by the actor loop
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
