//! WebSocket client for the signaling relay.
//!
//! [`RelayClient`] owns the socket and its writer/reader tasks; the
//! peer connection manager talks to the relay through the channel pair
//! in [`RelayLink`], so tests can drive a manager from plain channels
//! without a server.

use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use signal_proto::{ClientEvent, ServerEvent};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;

/// Bidirectional channel seam between a manager and the relay.
pub struct RelayLink {
    pub(crate) tx: mpsc::UnboundedSender<ClientEvent>,
    pub(crate) rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl RelayLink {
    pub fn new(
        tx: mpsc::UnboundedSender<ClientEvent>,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        Self { tx, rx }
    }
}

pub struct RelayClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: AsyncMutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RelayClient {
    /// Connect and authenticate against the relay. The signed token
    /// rides in the handshake query string; a rejected token surfaces
    /// here as a failed connect.
    pub async fn connect(relay_url: &str, token: &str) -> Result<Self, ClientError> {
        let url = derive_ws_url(relay_url, token)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Relay(format!("websocket connect failed: {err}")))?;
        debug!(target = "signaling", "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                if let Ok(json) = serde_json::to_string(&event) {
                    if ws_write.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(text.as_ref()) {
                            Ok(event) => {
                                if inbound_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(target = "signaling", error = %err, "unparseable relay event")
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(target = "signaling", "relay websocket closed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound,
            inbound: AsyncMutex::new(Some(inbound_rx)),
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Take the channel pair for a peer connection manager. Single use;
    /// the manager owns the inbound stream for its lifetime.
    pub async fn take_link(&self) -> Result<RelayLink, ClientError> {
        let rx = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or(ClientError::InvalidState("relay link already taken"))?;
        Ok(RelayLink::new(self.outbound.clone(), rx))
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn derive_ws_url(relay_url: &str, token: &str) -> Result<Url, ClientError> {
    let base = Url::parse(relay_url)
        .map_err(|err| ClientError::Relay(format!("invalid relay url {relay_url}: {err}")))?;
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    ws.set_scheme(scheme)
        .map_err(|_| ClientError::Relay("invalid websocket scheme".into()))?;
    ws.set_path("/ws");
    ws.set_fragment(None);
    ws.query_pairs_mut().clear().append_pair("token", token);
    Ok(ws)
}
