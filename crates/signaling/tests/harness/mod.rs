//! Relay end-to-end test harness
//!
//! - [`TestRelay`]: a relay server on an ephemeral local port
//! - [`RawClient`]: a bare WebSocket client speaking the envelope protocol
//! - [`next_event`]: waits for a matching [`ClientEvent`]

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use peerline_signaling::relay::RelayEvent;
use peerline_signaling::{
    ClientConfig, ClientEvent, Envelope, MessageKind, RelayConfig, RelayServer, RelayServerHandle,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peerline_signaling=debug")
        .with_test_writer()
        .try_init();
}

/// Relay server bound to 127.0.0.1 on a random port
pub struct TestRelay {
    pub handle: RelayServerHandle,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    pub async fn start_on(port: u16) -> Self {
        let server = RelayServer::new(RelayConfig::ephemeral().with_port(port))
            .expect("valid relay config");
        let handle = server.start().await.expect("relay starts");
        Self { handle }
    }

    /// Start with relay events forwarded to the returned receiver
    pub async fn start_with_events() -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let server = RelayServer::new_with_events(RelayConfig::ephemeral(), Some(tx))
            .expect("valid relay config");
        let handle = server.start().await.expect("relay starts");
        (Self { handle }, rx)
    }

    pub fn url(&self) -> String {
        self.handle.url()
    }

    pub fn port(&self) -> u16 {
        self.handle.local_addr().port()
    }

    /// Client config with short timers for tests
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.url())
            .with_reconnect_delay_ms(100)
            .with_max_reconnect_attempts(50)
            .with_request_timeout_ms(2_000)
            .with_ice_servers(vec![])
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

/// Bare protocol client used to observe exactly what the relay sends
pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("connect to relay");
        Self { ws }
    }

    /// Connect and register, consuming the `registered` ack
    pub async fn registered(url: &str, handle: &str) -> Self {
        let mut client = Self::connect(url).await;
        client.send(&Envelope::register(handle)).await;
        let ack = client.recv().await;
        assert_eq!(ack.kind, MessageKind::Registered, "unexpected reply {:?}", ack);
        client
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        self.send_text(&envelope.to_json().unwrap()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send frame");
    }

    /// Next envelope, failing the test after [`WAIT`]
    pub async fn recv(&mut self) -> Envelope {
        loop {
            let msg = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for relay frame")
                .expect("relay connection ended")
                .expect("relay frame");
            if let Message::Text(text) = msg {
                return Envelope::parse(&text).expect("valid envelope");
            }
        }
    }

    /// Next envelope of `kind`, skipping others
    pub async fn recv_kind(&mut self, kind: MessageKind) -> Envelope {
        loop {
            let envelope = self.recv().await;
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    /// True if no text frame arrives within `window`
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        match tokio::time::timeout(window, self.ws.next()).await {
            Err(_) => true,
            Ok(Some(Ok(Message::Text(_)))) => false,
            Ok(_) => true,
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Wait for the first event matching `pred`, failing the test after [`WAIT`]
pub async fn next_event<F>(rx: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("client event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

/// Poll `check` until it holds, failing the test after [`WAIT`]
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
