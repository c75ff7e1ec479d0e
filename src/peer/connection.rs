use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, MediaStream, RemoteMediaTrack, RemoteStream, TrackKind};
use crate::peer::codec::enc;
use crate::peer::ice::{add_remote_candidate, analyze_candidates, apply_pending_candidates, ice_servers};
use crate::peer::state::{IceState, OutboundTracks, RemoteTracks, Senders};
use crate::peer::types::{IceCandidate, SdpPayload, ServerConfig, SignalMessage};
use crate::peer::{CallDirection, EventSink, MediaCall, TransportError, TransportEvent};
use crate::signaling::SignalBroker;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Per-transport knobs shared by every call
#[derive(Debug, Clone)]
pub(crate) struct CallSettings {
    pub ice_servers: Vec<ServerConfig>,
    pub grace_period: Duration,
    pub negotiation_timeout: Duration,
}

/// One media call backed by its own `RTCPeerConnection`.
///
/// Negotiation runs in a spawned task so placing and answering never block the
/// caller. Outcome (remote tracks, hangup, ICE failure) is reported through the
/// endpoint's event sink, exactly once for the terminal event.
pub struct WebRtcCall {
    me: Weak<WebRtcCall>,
    id: String,
    peer: String,
    local: String,
    direction: CallDirection,
    broker: Arc<dyn SignalBroker>,
    events: EventSink,
    settings: Arc<CallSettings>,
    pc: OnceCell<Arc<RTCPeerConnection>>,
    outbound: RwLock<OutboundTracks>,
    senders: Mutex<Senders>,
    ice: Mutex<IceState>,
    remote: Mutex<RemoteTracks>,
    remote_offer: Mutex<Option<RTCSessionDescription>>,
    disconnect_task: Mutex<Option<JoinHandle<()>>>,
    answered: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcCall {
    pub(crate) fn outbound(
        id: String,
        peer: String,
        local: String,
        broker: Arc<dyn SignalBroker>,
        events: EventSink,
        settings: Arc<CallSettings>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            Self::build(
                me.clone(),
                id,
                peer,
                local,
                CallDirection::Outbound,
                broker,
                events,
                settings,
                None,
            )
        })
    }

    pub(crate) fn inbound(
        id: String,
        peer: String,
        local: String,
        broker: Arc<dyn SignalBroker>,
        events: EventSink,
        settings: Arc<CallSettings>,
        offer: RTCSessionDescription,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            Self::build(
                me.clone(),
                id,
                peer,
                local,
                CallDirection::Inbound,
                broker,
                events,
                settings,
                Some(offer),
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        me: Weak<Self>,
        id: String,
        peer: String,
        local: String,
        direction: CallDirection,
        broker: Arc<dyn SignalBroker>,
        events: EventSink,
        settings: Arc<CallSettings>,
        offer: Option<RTCSessionDescription>,
    ) -> Self {
        Self {
            me,
            id,
            peer,
            local,
            direction,
            broker,
            events,
            settings,
            pc: OnceCell::new(),
            outbound: RwLock::new(OutboundTracks::default()),
            senders: Mutex::new(Senders::default()),
            ice: Mutex::new(IceState::default()),
            remote: Mutex::new(RemoteTracks::default()),
            remote_offer: Mutex::new(offer),
            disconnect_task: Mutex::new(None),
            answered: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.get().cloned()
    }

    /// Kicks off the offer side of negotiation
    pub(crate) fn start_outbound(self: &Arc<Self>, stream: &MediaStream) {
        *self.outbound.write() = OutboundTracks::from_stream(stream);
        self.arm_negotiation_timeout();
        let call = self.clone();
        tokio::spawn(async move {
            if let Err(e) = call.negotiate_offer().await {
                call.fail(e);
            }
        });
    }

    /// Fails the call if it never reaches `Connected`. Covers offers nobody
    /// answers, which otherwise produce no peer connection state change at all.
    fn arm_negotiation_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.settings.negotiation_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            let Some(call) = weak.upgrade() else { return };
            if call.connected.load(Ordering::SeqCst) || call.is_closed() {
                return;
            }
            call.fail(TransportError::NegotiationTimeout {
                call_id: call.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            });
        });
    }

    async fn negotiate_offer(self: &Arc<Self>) -> Result<(), TransportError> {
        let pc = self.connect().await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        let payload = enc(&SdpPayload {
            sdp: offer,
            id: self.id.clone(),
            ts: chrono::Utc::now().timestamp(),
        })?;
        debug!(call = %self.id, peer = %self.peer, "sending offer");
        self.broker
            .send(SignalMessage::Offer {
                src: self.local.clone(),
                dst: self.peer.clone(),
                call_id: self.id.clone(),
                payload,
            })
            .await
    }

    async fn negotiate_answer(self: &Arc<Self>) -> Result<(), TransportError> {
        let offer = self
            .remote_offer
            .lock()
            .take()
            .ok_or_else(|| TransportError::InvalidCallState {
                call_id: self.id.clone(),
                message: "no remote offer to answer".into(),
            })?;
        let pc = self.connect().await?;
        pc.set_remote_description(offer).await?;
        apply_pending_candidates(&pc, &self.ice).await;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        let payload = enc(&SdpPayload {
            sdp: answer,
            id: self.id.clone(),
            ts: chrono::Utc::now().timestamp(),
        })?;
        debug!(call = %self.id, peer = %self.peer, "sending answer");
        self.broker
            .send(SignalMessage::Answer {
                src: self.local.clone(),
                dst: self.peer.clone(),
                call_id: self.id.clone(),
                payload,
            })
            .await
    }

    /// Applies the remote answer to an outbound call
    pub(crate) async fn accept_answer(&self, answer: RTCSessionDescription) -> Result<(), TransportError> {
        let pc = self.pc.get().cloned().ok_or_else(|| TransportError::InvalidCallState {
            call_id: self.id.clone(),
            message: "answer arrived before the offer was made".into(),
        })?;
        pc.set_remote_description(answer).await?;
        apply_pending_candidates(&pc, &self.ice).await;
        Ok(())
    }

    pub(crate) async fn add_remote_candidate(&self, candidate: IceCandidate) {
        let pc = self.pc.get().cloned();
        add_remote_candidate(pc.as_deref(), &self.ice, candidate).await;
    }

    /// Creates the peer connection, wires handlers and attaches the outbound tracks
    async fn connect(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&self.settings.ice_servers))
                .await?,
        );
        if self.pc.set(pc.clone()).is_err() {
            let _ = pc.close().await;
            return Err(TransportError::InvalidCallState {
                call_id: self.id.clone(),
                message: "already negotiating".into(),
            });
        }
        self.install_handlers(&pc);

        let attached = self.outbound.read().tracks();
        for track in &attached {
            let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
            let sender = pc.add_track(rtp).await?;
            self.senders.lock().set(track.kind(), sender.clone());

            // Drain RTCP so interceptors (NACK, reports) keep working
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        // A replacement may have landed while the senders were being attached.
        let current = self.outbound.read().clone();
        for track in &attached {
            if let Some(now) = current.get(track.kind()) {
                if !now.ptr_eq(track) {
                    self.swap_sender_track(&now).await?;
                }
            }
        }

        if self.is_closed() {
            let _ = pc.close().await;
            return Err(TransportError::CallClosed {
                call_id: self.id.clone(),
            });
        }
        Ok(pc)
    }

    fn install_handlers(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(call) = weak.upgrade() else { return };
                call.on_local_candidate(cand).await;
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(call) = weak.upgrade() {
                    call.on_remote_track(track);
                }
                Box::pin(async {})
            },
        ));

        let weak = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            if let Some(call) = weak.upgrade() {
                call.on_state_change(st);
            }
            Box::pin(async {})
        }));
    }

    async fn on_local_candidate(&self, cand: Option<RTCIceCandidate>) {
        let Some(c) = cand else {
            let local = self.ice.lock().local.clone();
            analyze_candidates(&self.id, &local);
            return;
        };
        dump_candidate("LOCAL", &self.id, &c);
        let init = match c.to_json() {
            Ok(init) => init,
            Err(e) => {
                warn!(call = %self.id, error = %e, "could not serialize local candidate");
                return;
            }
        };
        let candidate = IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            connection_id: self.id.clone(),
        };
        self.ice.lock().local.push(candidate.clone());
        if self.is_closed() {
            return;
        }
        if let Err(e) = self
            .broker
            .send(SignalMessage::Candidate {
                src: self.local.clone(),
                dst: self.peer.clone(),
                candidate,
            })
            .await
        {
            debug!(call = %self.id, error = %e, "candidate not delivered");
        }
    }

    fn on_remote_track(&self, track: Arc<TrackRemote>) {
        let remote_track = WebRtcRemoteTrack::spawn(track);
        info!(
            call = %self.id,
            peer = %self.peer,
            track = %remote_track.id(),
            kind = ?remote_track.kind(),
            "remote track"
        );
        let stream = {
            let mut remote = self.remote.lock();
            let stream_id = remote
                .stream_id
                .get_or_insert_with(|| remote_track.stream_id.clone())
                .clone();
            remote.tracks.push(remote_track.clone());
            RemoteStream::new(stream_id, remote.tracks.clone())
        };
        if self.is_closed() {
            return;
        }
        let _ = self.events.send(TransportEvent::RemoteStream {
            peer: self.peer.clone(),
            call_id: self.id.clone(),
            stream,
        });
    }

    fn on_state_change(self: &Arc<Self>, st: RTCPeerConnectionState) {
        debug!(call = %self.id, state = ?st, "peer connection state");
        match st {
            RTCPeerConnectionState::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                if let Some(handle) = self.disconnect_task.lock().take() {
                    info!(call = %self.id, "connection recovered within grace period");
                    handle.abort();
                }
            }
            RTCPeerConnectionState::Disconnected => {
                let mut task = self.disconnect_task.lock();
                if task.is_some() {
                    return;
                }
                warn!(
                    call = %self.id,
                    grace_ms = self.settings.grace_period.as_millis() as u64,
                    "connection interrupted, waiting for recovery"
                );
                if let Some(pc) = self.pc.get().cloned() {
                    let call_id = self.id.clone();
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, &call_id, "BEFORE-FAIL").await;
                    });
                }
                let weak: Weak<Self> = Arc::downgrade(self);
                let grace = self.settings.grace_period;
                *task = Some(tokio::spawn(async move {
                    sleep(grace).await;
                    let Some(call) = weak.upgrade() else { return };
                    let state_now = call
                        .pc
                        .get()
                        .map(|pc| pc.connection_state())
                        .unwrap_or(RTCPeerConnectionState::Closed);
                    if state_now != RTCPeerConnectionState::Connected {
                        warn!(call = %call.id, state = ?state_now, "grace period over, dropping call");
                        call.disconnect_task.lock().take();
                        call.finish(None);
                    }
                }));
            }
            RTCPeerConnectionState::Failed => {
                self.fail(TransportError::IceFailed {
                    call_id: self.id.clone(),
                });
            }
            RTCPeerConnectionState::Closed => {
                self.finish(None);
            }
            _ => {}
        }
    }

    /// Terminal transition. Emits one `CallClosed` or `CallError` and tears
    /// the peer connection down; later calls are no-ops.
    fn finish(&self, error: Option<TransportError>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = self.disconnect_task.lock().take() {
            handle.abort();
        }
        let event = match error {
            Some(error) => {
                warn!(call = %self.id, peer = %self.peer, error = %error, "call failed");
                TransportEvent::CallError {
                    peer: self.peer.clone(),
                    call_id: self.id.clone(),
                    error,
                }
            }
            None => {
                info!(call = %self.id, peer = %self.peer, "call closed");
                TransportEvent::CallClosed {
                    peer: self.peer.clone(),
                    call_id: self.id.clone(),
                }
            }
        };
        let _ = self.events.send(event);

        if let Some(pc) = self.pc.get().cloned() {
            tokio::spawn(async move {
                if let Err(e) = pc.close().await {
                    debug!(error = %e, "peer connection close");
                }
            });
        }
        true
    }

    pub(crate) fn fail(&self, error: TransportError) {
        self.finish(Some(error));
    }

    /// The remote side hung up
    pub(crate) fn remote_hangup(&self) {
        self.finish(None);
    }

    async fn swap_sender_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let sender = self.senders.lock().get(track.kind());
        match sender {
            Some(sender) => {
                let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
                sender.replace_track(Some(rtp)).await?;
            }
            None => {
                debug!(call = %self.id, kind = ?track.kind(), "no sender for this kind yet");
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::CallClosed {
                call_id: self.id.clone(),
            });
        }
        Ok(())
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

impl fmt::Debug for WebRtcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcCall")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl MediaCall for WebRtcCall {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn direction(&self) -> CallDirection {
        self.direction
    }

    fn answer(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.direction != CallDirection::Inbound {
            return Err(TransportError::InvalidCallState {
                call_id: self.id.clone(),
                message: "only inbound calls can be answered".into(),
            });
        }
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(TransportError::InvalidCallState {
                call_id: self.id.clone(),
                message: "already answered".into(),
            });
        }
        *self.outbound.write() = OutboundTracks::from_stream(stream);

        let call = self.me.upgrade().ok_or_else(|| TransportError::CallClosed {
            call_id: self.id.clone(),
        })?;
        call.arm_negotiation_timeout();
        tokio::spawn(async move {
            if let Err(e) = call.negotiate_answer().await {
                call.fail(e);
            }
        });
        Ok(())
    }

    fn outbound_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.outbound.read().get(kind)
    }

    async fn replace_outbound_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        // View first, then sender: `connect` re-reads the view after attaching.
        self.outbound.write().set(track.clone());
        self.swap_sender_track(track).await
    }

    async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self
            .broker
            .send(SignalMessage::Bye {
                src: self.local.clone(),
                dst: self.peer.clone(),
                call_id: self.id.clone(),
            })
            .await
        {
            debug!(call = %self.id, error = %e, "bye not delivered");
        }
        self.finish(None);
    }
}

/// Tracks when RTP last arrived. A sender that disables its track stops
/// emitting samples, so a long silence reads as disabled, like a browser's
/// `muted` flag.
#[derive(Debug)]
pub(crate) struct RtpActivity {
    origin: Instant,
    /// Millis since `origin` of the latest packet
    last_packet_ms: AtomicU64,
    live: AtomicBool,
}

impl RtpActivity {
    /// Silence after which a remote track counts as disabled
    pub(crate) const MUTE_AFTER: Duration = Duration::from_millis(1500);

    pub(crate) fn new(now: Instant) -> Self {
        Self {
            origin: now,
            last_packet_ms: AtomicU64::new(0),
            live: AtomicBool::new(true),
        }
    }

    pub(crate) fn record(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.origin).as_millis() as u64;
        self.last_packet_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn is_flowing(&self, now: Instant) -> bool {
        if !self.is_live() {
            return false;
        }
        let last = self.origin + Duration::from_millis(self.last_packet_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last) < Self::MUTE_AFTER
    }
}

/// Received track plus an activity view fed by the RTP reader task
pub struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
    id: String,
    stream_id: String,
    kind: TrackKind,
    activity: RtpActivity,
    packets: AtomicU64,
}

impl WebRtcRemoteTrack {
    fn spawn(track: Arc<TrackRemote>) -> Arc<Self> {
        let remote = Arc::new(Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: TrackKind::from(track.kind()),
            track,
            activity: RtpActivity::new(Instant::now()),
            packets: AtomicU64::new(0),
        });
        let reader = remote.clone();
        tokio::spawn(async move {
            while reader.track.read_rtp().await.is_ok() {
                reader.packets.fetch_add(1, Ordering::Relaxed);
                reader.activity.record(Instant::now());
            }
            reader.activity.end();
        });
        remote
    }

    pub fn track(&self) -> &Arc<TrackRemote> {
        &self.track
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn packets_received(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// False once the RTP reader has stopped for good
    pub fn is_live(&self) -> bool {
        self.activity.is_live()
    }
}

impl fmt::Debug for WebRtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcRemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.activity.is_live())
            .finish()
    }
}

impl RemoteMediaTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.activity.is_flowing(Instant::now())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
