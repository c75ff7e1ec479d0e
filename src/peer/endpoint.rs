use crate::config::MeshConfig;
use crate::media::MediaStream;
use crate::peer::codec::dec;
use crate::peer::connection::{CallSettings, WebRtcCall};
use crate::peer::types::{IceCandidate, SignalMessage};
use crate::peer::{Endpoint, EventSink, MediaCall, Transport, TransportError, TransportEvent};
use crate::signaling::{Inbox, SignalBroker};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Candidates kept for calls whose offer has not arrived yet
const MAX_EARLY_CANDIDATES: usize = 64;

/// WebRTC transport: every endpoint registers with the signal broker and
/// every call owns a peer connection.
pub struct WebRtcTransport {
    broker: Arc<dyn SignalBroker>,
    settings: Arc<CallSettings>,
}

impl WebRtcTransport {
    pub fn new(broker: Arc<dyn SignalBroker>, config: &MeshConfig) -> Self {
        Self {
            broker,
            settings: Arc::new(CallSettings {
                ice_servers: config.ice_servers.clone(),
                grace_period: config.grace_period(),
                negotiation_timeout: config.negotiation_timeout(),
            }),
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn open_endpoint(
        &self,
        endpoint_id: &str,
        events: EventSink,
    ) -> Result<Arc<dyn Endpoint>, TransportError> {
        let inbox = self.broker.register(endpoint_id).await?;
        let endpoint = Arc::new(WebRtcEndpoint {
            id: endpoint_id.to_string(),
            broker: self.broker.clone(),
            settings: self.settings.clone(),
            events,
            calls: RwLock::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });
        tokio::spawn(run_inbox(Arc::downgrade(&endpoint), inbox));
        info!(endpoint = %endpoint_id, "endpoint open");
        Ok(endpoint)
    }
}

pub struct WebRtcEndpoint {
    id: String,
    broker: Arc<dyn SignalBroker>,
    settings: Arc<CallSettings>,
    events: EventSink,
    calls: RwLock<HashMap<String, Arc<WebRtcCall>>>,
    early_candidates: Mutex<HashMap<String, Vec<IceCandidate>>>,
    destroyed: AtomicBool,
}

impl WebRtcEndpoint {
    fn call_by_id(&self, call_id: &str) -> Option<Arc<WebRtcCall>> {
        self.calls.read().get(call_id).cloned()
    }

    fn sweep_closed(&self) {
        self.calls.write().retain(|_, call| !call.is_closed());
    }

    async fn route(&self, message: SignalMessage) {
        self.sweep_closed();
        match message {
            SignalMessage::Offer {
                src,
                call_id,
                payload,
                ..
            } => {
                let known = self.calls.read().contains_key(&call_id);
                if known {
                    debug!(call = %call_id, "duplicate offer ignored");
                    return;
                }
                let offer = match dec(&payload) {
                    Ok(p) => p.sdp,
                    Err(e) => {
                        warn!(call = %call_id, peer = %src, error = %e, "unreadable offer");
                        return;
                    }
                };
                let call = WebRtcCall::inbound(
                    call_id.clone(),
                    src.clone(),
                    self.id.clone(),
                    self.broker.clone(),
                    self.events.clone(),
                    self.settings.clone(),
                    offer,
                );
                self.calls.write().insert(call_id.clone(), call.clone());

                let early = self.early_candidates.lock().remove(&call_id);
                for candidate in early.unwrap_or_default() {
                    call.add_remote_candidate(candidate).await;
                }

                info!(call = %call_id, peer = %src, "incoming call");
                let _ = self
                    .events
                    .send(TransportEvent::IncomingCall(call as Arc<dyn MediaCall>));
            }
            SignalMessage::Answer {
                call_id, payload, ..
            } => {
                let Some(call) = self.call_by_id(&call_id) else {
                    debug!(call = %call_id, "answer for unknown call");
                    return;
                };
                let result = match dec(&payload) {
                    Ok(p) => call.accept_answer(p.sdp).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    call.fail(e);
                }
            }
            SignalMessage::Candidate { candidate, .. } => {
                match self.call_by_id(&candidate.connection_id) {
                    Some(call) => call.add_remote_candidate(candidate).await,
                    None => {
                        let mut early = self.early_candidates.lock();
                        let queue = early.entry(candidate.connection_id.clone()).or_default();
                        if queue.len() < MAX_EARLY_CANDIDATES {
                            queue.push(candidate);
                        }
                    }
                }
            }
            SignalMessage::Bye { call_id, .. } => {
                self.early_candidates.lock().remove(&call_id);
                let call = self.calls.write().remove(&call_id);
                if let Some(call) = call {
                    call.remote_hangup();
                }
            }
        }
    }
}

async fn run_inbox(endpoint: Weak<WebRtcEndpoint>, mut inbox: Inbox) {
    while let Some(message) = inbox.recv().await {
        let Some(endpoint) = endpoint.upgrade() else {
            return;
        };
        if endpoint.destroyed.load(Ordering::SeqCst) {
            return;
        }
        endpoint.route(message).await;
    }
    if let Some(endpoint) = endpoint.upgrade() {
        if !endpoint.destroyed.load(Ordering::SeqCst) {
            warn!(endpoint = %endpoint.id, "signalling inbox closed");
            let _ = endpoint
                .events
                .send(TransportEvent::EndpointError(TransportError::EndpointClosed {
                    endpoint_id: endpoint.id.clone(),
                }));
        }
    }
}

#[async_trait]
impl Endpoint for WebRtcEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn call(
        &self,
        remote_endpoint_id: &str,
        stream: &MediaStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::EndpointClosed {
                endpoint_id: self.id.clone(),
            });
        }
        let call = WebRtcCall::outbound(
            random_id(),
            remote_endpoint_id.to_string(),
            self.id.clone(),
            self.broker.clone(),
            self.events.clone(),
            self.settings.clone(),
        );
        self.calls.write().insert(call.id().to_string(), call.clone());
        info!(call = %call.id(), peer = %remote_endpoint_id, "placing call");
        call.start_outbound(stream);
        Ok(call)
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let calls: Vec<Arc<WebRtcCall>> = self.calls.write().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.close().await;
        }
        self.early_candidates.lock().clear();
        self.broker.unregister(&self.id).await;
        info!(endpoint = %self.id, "endpoint destroyed");
    }
}
