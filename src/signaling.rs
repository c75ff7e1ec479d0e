//! Signal relays carrying offers, answers, candidates and hangups between
//! endpoints. Each endpoint registers once and gets an inbox; messages are
//! routed by their `dst`.
use crate::peer::{SignalMessage, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub type Inbox = mpsc::UnboundedReceiver<SignalMessage>;

#[async_trait]
pub trait SignalBroker: Send + Sync {
    /// Claims `endpoint_id`. Fails with [`TransportError::UnavailableId`] when
    /// another live endpoint holds it.
    async fn register(&self, endpoint_id: &str) -> Result<Inbox, TransportError>;

    async fn send(&self, message: SignalMessage) -> Result<(), TransportError>;

    async fn unregister(&self, endpoint_id: &str);
}

/// Relay for endpoints living in the same process
#[derive(Default)]
pub struct InMemoryBroker {
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<SignalMessage>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, endpoint_id: &str) -> bool {
        self.inboxes
            .read()
            .get(endpoint_id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl SignalBroker for InMemoryBroker {
    async fn register(&self, endpoint_id: &str) -> Result<Inbox, TransportError> {
        let mut inboxes = self.inboxes.write();
        if inboxes.get(endpoint_id).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::UnavailableId {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(endpoint_id.to_string(), tx);
        Ok(rx)
    }

    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        let inbox = self.inboxes.read().get(message.dst()).cloned();
        let Some(inbox) = inbox else {
            return Err(TransportError::PeerUnavailable {
                endpoint_id: message.dst().to_string(),
            });
        };
        let dst = message.dst().to_string();
        inbox
            .send(message)
            .map_err(|_| TransportError::PeerUnavailable { endpoint_id: dst })
    }

    async fn unregister(&self, endpoint_id: &str) {
        self.inboxes.write().remove(endpoint_id);
    }
}

/// Relay through a websocket signalling server. Every registered endpoint
/// holds its own connection to `{url}?id={endpoint_id}`; frames are the JSON
/// form of [`SignalMessage`] and the server forwards them by `dst`.
pub struct WsBroker {
    url: String,
    outgoing: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    /// Ids whose socket is still being opened
    connecting: Mutex<HashSet<String>>,
}

impl WsBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outgoing: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
        }
    }

    fn endpoint_url(&self, endpoint_id: &str) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.url).map_err(|e| TransportError::Broker {
            message: format!("invalid signalling url {}: {e}", self.url),
        })?;
        url.query_pairs_mut().append_pair("id", endpoint_id);
        Ok(url.into())
    }

    /// Reserves `endpoint_id` for the duration of a connect
    fn reserve(&self, endpoint_id: &str) -> Result<Reservation<'_>, TransportError> {
        let mut connecting = self.connecting.lock();
        let taken = connecting.contains(endpoint_id)
            || self
                .outgoing
                .read()
                .get(endpoint_id)
                .is_some_and(|tx| !tx.is_closed());
        if taken {
            return Err(TransportError::UnavailableId {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        connecting.insert(endpoint_id.to_string());
        Ok(Reservation {
            broker: self,
            endpoint_id: endpoint_id.to_string(),
        })
    }
}

/// Releases a connect reservation, also when `register` is cancelled
struct Reservation<'a> {
    broker: &'a WsBroker,
    endpoint_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.broker.connecting.lock().remove(&self.endpoint_id);
    }
}

#[async_trait]
impl SignalBroker for WsBroker {
    async fn register(&self, endpoint_id: &str) -> Result<Inbox, TransportError> {
        let reservation = self.reserve(endpoint_id)?;
        let url = self.endpoint_url(endpoint_id)?;
        info!(url = %url, "connecting to signalling server");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                error!(error = %e, "could not open signalling websocket");
                TransportError::Broker {
                    message: e.to_string(),
                }
            })?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let writer_id = endpoint_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(frame).await {
                    warn!(endpoint = %writer_id, error = %e, "signalling send failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
            debug!(endpoint = %writer_id, "signalling writer finished");
        });

        let reader_id = endpoint_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(endpoint = %reader_id, error = %e, "unparseable signal"),
                    },
                    Ok(Message::Close(_)) => {
                        info!(endpoint = %reader_id, "signalling server closed the socket");
                        break;
                    }
                    Err(e) => {
                        error!(endpoint = %reader_id, error = %e, "signalling socket error");
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping in_tx closes the inbox; the endpoint reports it.
        });

        self.outgoing
            .write()
            .insert(endpoint_id.to_string(), out_tx);
        drop(reservation);
        Ok(in_rx)
    }

    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        let tx = self.outgoing.read().get(message.src()).cloned();
        let Some(tx) = tx else {
            return Err(TransportError::EndpointClosed {
                endpoint_id: message.src().to_string(),
            });
        };
        let json = serde_json::to_string(&message).map_err(|e| TransportError::Codec {
            message: e.to_string(),
        })?;
        tx.send(Message::Text(json.into()))
            .map_err(|_| TransportError::EndpointClosed {
                endpoint_id: message.src().to_string(),
            })
    }

    async fn unregister(&self, endpoint_id: &str) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing.write().remove(endpoint_id);
    }
}
