//! In-process transport. Calls between endpoints opened on the same
//! [`LoopbackNetwork`] behave like real ones: they must be answered before
//! either side sees a remote stream, closing one side notifies both, and a
//! remote stream mirrors whatever track the sender currently has in place,
//! including its enabled state.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::state::OutboundTracks;
use super::{
    CallDirection, Endpoint, EventSink, MediaCall, Transport, TransportError, TransportEvent,
};
use crate::media::{LocalTrack, MediaStream, RemoteMediaTrack, RemoteStream, TrackKind};
use crate::utils::random_id;

/// Cheap to clone; clones share the same set of endpoints.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<String, EventSink>>,
    links: RwLock<HashMap<String, Arc<CallLink>>>,
}

struct CallLink {
    id: String,
    caller: String,
    callee: String,
    caller_events: EventSink,
    callee_events: EventSink,
    caller_out: Arc<RwLock<OutboundTracks>>,
    callee_out: Arc<RwLock<OutboundTracks>>,
    caller_stream_id: String,
    callee_stream_id: RwLock<Option<String>>,
    answered: AtomicBool,
    closed: AtomicBool,
}

impl CallLink {
    fn involves(&self, endpoint_id: &str) -> bool {
        self.caller == endpoint_id || self.callee == endpoint_id
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.inner.endpoints.read().keys().cloned().collect()
    }

    /// Live calls (answered or not) touching `endpoint_id`
    pub fn call_count(&self, endpoint_id: &str) -> usize {
        self.inner
            .links
            .read()
            .values()
            .filter(|l| l.involves(endpoint_id))
            .count()
    }

    /// Simulates an abrupt network loss: the endpoint vanishes and every call
    /// touching it closes on both sides.
    pub fn drop_endpoint(&self, endpoint_id: &str) {
        self.inner.endpoints.write().remove(endpoint_id);
        self.close_links_of(endpoint_id);
    }

    fn close_links_of(&self, endpoint_id: &str) {
        let links: Vec<Arc<CallLink>> = self
            .inner
            .links
            .read()
            .values()
            .filter(|l| l.involves(endpoint_id))
            .cloned()
            .collect();
        for link in links {
            self.close_link(&link);
        }
    }

    fn close_link(&self, link: &CallLink) {
        if link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.links.write().remove(&link.id);
        let _ = link.caller_events.send(TransportEvent::CallClosed {
            peer: link.callee.clone(),
            call_id: link.id.clone(),
        });
        let _ = link.callee_events.send(TransportEvent::CallClosed {
            peer: link.caller.clone(),
            call_id: link.id.clone(),
        });
    }

    fn place_call(
        &self,
        caller: &str,
        caller_events: &EventSink,
        remote: &str,
        stream: &MediaStream,
    ) -> Arc<LoopbackCall> {
        let callee_events = self.inner.endpoints.read().get(remote).cloned();
        let caller_out = Arc::new(RwLock::new(OutboundTracks::from_stream(stream)));
        let link = Arc::new(CallLink {
            id: random_id(),
            caller: caller.to_string(),
            callee: remote.to_string(),
            caller_events: caller_events.clone(),
            // A call to nobody still needs a sink; it is never read.
            callee_events: callee_events
                .clone()
                .unwrap_or_else(|| tokio::sync::mpsc::unbounded_channel().0),
            caller_out,
            callee_out: Arc::new(RwLock::new(OutboundTracks::default())),
            caller_stream_id: stream.id().to_string(),
            callee_stream_id: RwLock::new(None),
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let outbound = Arc::new(LoopbackCall {
            network: self.clone(),
            link: link.clone(),
            direction: CallDirection::Outbound,
        });

        match callee_events {
            Some(events) => {
                self.inner.links.write().insert(link.id.clone(), link.clone());
                let inbound: Arc<dyn MediaCall> = Arc::new(LoopbackCall {
                    network: self.clone(),
                    link: link.clone(),
                    direction: CallDirection::Inbound,
                });
                if events.send(TransportEvent::IncomingCall(inbound)).is_err() {
                    self.fail_unreachable(&link);
                }
            }
            None => self.fail_unreachable(&link),
        }
        outbound
    }

    fn fail_unreachable(&self, link: &CallLink) {
        link.closed.store(true, Ordering::SeqCst);
        self.inner.links.write().remove(&link.id);
        let _ = link.caller_events.send(TransportEvent::CallError {
            peer: link.callee.clone(),
            call_id: link.id.clone(),
            error: TransportError::PeerUnavailable {
                endpoint_id: link.callee.clone(),
            },
        });
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn open_endpoint(
        &self,
        endpoint_id: &str,
        events: EventSink,
    ) -> Result<Arc<dyn Endpoint>, TransportError> {
        let mut endpoints = self.inner.endpoints.write();
        if endpoints.contains_key(endpoint_id) {
            return Err(TransportError::UnavailableId {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        endpoints.insert(endpoint_id.to_string(), events.clone());
        debug!(endpoint = %endpoint_id, "loopback endpoint open");
        Ok(Arc::new(LoopbackEndpoint {
            id: endpoint_id.to_string(),
            network: self.clone(),
            events,
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackEndpoint {
    id: String,
    network: LoopbackNetwork,
    events: EventSink,
    destroyed: AtomicBool,
}

#[async_trait]
impl Endpoint for LoopbackEndpoint {
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
        let call = self
            .network
            .place_call(&self.id, &self.events, remote_endpoint_id, stream);
        Ok(call)
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut endpoints = self.network.inner.endpoints.write();
            // Only release the id if it is still ours (it may have been dropped and reused).
            if endpoints
                .get(&self.id)
                .is_some_and(|sink| sink.same_channel(&self.events))
            {
                endpoints.remove(&self.id);
            }
        }
        self.network.close_links_of(&self.id);
    }
}

pub struct LoopbackCall {
    network: LoopbackNetwork,
    link: Arc<CallLink>,
    direction: CallDirection,
}

impl LoopbackCall {
    fn own_out(&self) -> &Arc<RwLock<OutboundTracks>> {
        match self.direction {
            CallDirection::Outbound => &self.link.caller_out,
            CallDirection::Inbound => &self.link.callee_out,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(TransportError::CallClosed {
                call_id: self.link.id.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackCall")
            .field("id", &self.link.id)
            .field("caller", &self.link.caller)
            .field("callee", &self.link.callee)
            .field("direction", &self.direction)
            .finish()
    }
}

fn mirrored_stream(stream_id: String, slots: &Arc<RwLock<OutboundTracks>>) -> RemoteStream {
    let snapshot = slots.read().clone();
    let mut tracks: Vec<Arc<dyn RemoteMediaTrack>> = Vec::new();
    if snapshot.audio.is_some() {
        tracks.push(Arc::new(MirroredTrack {
            kind: TrackKind::Audio,
            slots: slots.clone(),
        }));
    }
    if snapshot.video.is_some() {
        tracks.push(Arc::new(MirroredTrack {
            kind: TrackKind::Video,
            slots: slots.clone(),
        }));
    }
    RemoteStream::new(stream_id, tracks)
}

#[async_trait]
impl MediaCall for LoopbackCall {
    fn id(&self) -> &str {
        &self.link.id
    }

    fn peer(&self) -> &str {
        match self.direction {
            CallDirection::Outbound => &self.link.callee,
            CallDirection::Inbound => &self.link.caller,
        }
    }

    fn direction(&self) -> CallDirection {
        self.direction
    }

    fn answer(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.direction != CallDirection::Inbound {
            return Err(TransportError::InvalidCallState {
                call_id: self.link.id.clone(),
                message: "only inbound calls can be answered".into(),
            });
        }
        if self.link.answered.swap(true, Ordering::SeqCst) {
            return Err(TransportError::InvalidCallState {
                call_id: self.link.id.clone(),
                message: "already answered".into(),
            });
        }
        *self.link.callee_out.write() = OutboundTracks::from_stream(stream);
        *self.link.callee_stream_id.write() = Some(stream.id().to_string());

        let _ = self.link.caller_events.send(TransportEvent::RemoteStream {
            peer: self.link.callee.clone(),
            call_id: self.link.id.clone(),
            stream: mirrored_stream(stream.id().to_string(), &self.link.callee_out),
        });
        let _ = self.link.callee_events.send(TransportEvent::RemoteStream {
            peer: self.link.caller.clone(),
            call_id: self.link.id.clone(),
            stream: mirrored_stream(self.link.caller_stream_id.clone(), &self.link.caller_out),
        });
        Ok(())
    }

    fn outbound_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.own_out().read().get(kind)
    }

    async fn replace_outbound_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.own_out().write().set(track.clone());
        Ok(())
    }

    async fn close(&self) {
        self.network.close_link(&self.link);
    }
}

/// Remote view of a loopback sender's current track of one kind
#[derive(Debug)]
pub struct MirroredTrack {
    kind: TrackKind,
    slots: Arc<RwLock<OutboundTracks>>,
}

impl MirroredTrack {
    /// The sender-side track currently feeding this remote track
    pub fn current(&self) -> Option<LocalTrack> {
        self.slots.read().get(self.kind)
    }
}

impl RemoteMediaTrack for MirroredTrack {
    fn id(&self) -> String {
        self.current()
            .map(|t| t.id().to_string())
            .unwrap_or_default()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.current()
            .is_some_and(|t| t.is_enabled() && !t.is_ended())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use tokio::sync::mpsc;

    fn camera() -> MediaStream {
        MediaStream::new(vec![
            LocalTrack::new(TrackKind::Audio, "mic", "s"),
            LocalTrack::new(TrackKind::Video, "cam", "s"),
        ])
    }

    #[tokio::test]
    async fn answered_call_delivers_streams_both_ways() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.open_endpoint("s-a", a_tx).await.expect("a");
        let _b = network.open_endpoint("s-b", b_tx).await.expect("b");

        let a_stream = camera();
        let outbound = a.call("s-b", &a_stream).expect("call");
        let inbound = match b_rx.recv().await {
            Some(TransportEvent::IncomingCall(call)) => call,
            other => panic!("expected incoming call, got {other:?}"),
        };
        assert_eq!(inbound.peer(), "s-a");
        assert_eq!(inbound.id(), outbound.id());

        let b_stream = camera();
        inbound.answer(&b_stream).expect("answer");
        match a_rx.recv().await {
            Some(TransportEvent::RemoteStream { peer, stream, .. }) => {
                assert_eq!(peer, "s-b");
                assert_eq!(stream.id(), b_stream.id());
            }
            other => panic!("expected remote stream, got {other:?}"),
        }
        assert!(matches!(
            b_rx.recv().await,
            Some(TransportEvent::RemoteStream { .. })
        ));
        assert!(inbound.answer(&b_stream).is_err());
    }

    #[tokio::test]
    async fn call_to_unknown_endpoint_errors() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let a = network.open_endpoint("s-a", a_tx).await.expect("a");
        let call = a.call("s-nobody", &camera()).expect("attempt");
        match a_rx.recv().await {
            Some(TransportEvent::CallError { peer, call_id, .. }) => {
                assert_eq!(peer, "s-nobody");
                assert_eq!(call_id, call.id());
            }
            other => panic!("expected call error, got {other:?}"),
        }
        assert_eq!(network.call_count("s-a"), 0);
    }

    #[tokio::test]
    async fn duplicate_endpoint_id_is_rejected() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let _first = network.open_endpoint("s-a", tx.clone()).await.expect("first");
        assert!(matches!(
            network.open_endpoint("s-a", tx).await,
            Err(TransportError::UnavailableId { .. })
        ));
    }

    #[tokio::test]
    async fn replacement_is_visible_through_the_remote_track() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.open_endpoint("s-a", a_tx).await.expect("a");
        let _b = network.open_endpoint("s-b", b_tx).await.expect("b");

        let outbound = a.call("s-b", &camera()).expect("call");
        let Some(TransportEvent::IncomingCall(inbound)) = b_rx.recv().await else {
            panic!("expected incoming call");
        };
        inbound.answer(&camera()).expect("answer");
        let _ = a_rx.recv().await;
        let Some(TransportEvent::RemoteStream { stream, .. }) = b_rx.recv().await else {
            panic!("expected remote stream");
        };

        let screen = LocalTrack::new(TrackKind::Video, "screen", "x");
        outbound
            .replace_outbound_track(&screen)
            .await
            .expect("replace");
        let video = stream.video_track().expect("video");
        let mirrored = video
            .as_any()
            .downcast_ref::<MirroredTrack>()
            .expect("mirrored");
        assert!(mirrored.current().expect("current").ptr_eq(&screen));

        screen.set_enabled(false);
        assert!(!video.is_enabled());
    }

    #[tokio::test]
    async fn closing_notifies_both_sides_once() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.open_endpoint("s-a", a_tx).await.expect("a");
        let _b = network.open_endpoint("s-b", b_tx).await.expect("b");

        let outbound = a.call("s-b", &camera()).expect("call");
        let _ = b_rx.recv().await;
        outbound.close().await;
        outbound.close().await;

        assert!(matches!(a_rx.recv().await, Some(TransportEvent::CallClosed { .. })));
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::CallClosed { .. })));
        assert!(a_rx.try_recv().is_err());
        assert!(outbound
            .replace_outbound_track(&LocalTrack::new(TrackKind::Video, "v", "s"))
            .await
            .is_err());
    }
}
