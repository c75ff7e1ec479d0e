//! The coordinator task. It owns every piece of mesh state and processes
//! user commands, transport events and completions of its own background
//! work one at a time.
use crate::config::MeshConfig;
use crate::media::{LocalTrack, MediaError, MediaSource, MediaStream};
use crate::mesh::connections::{CallRole, ConnectionSet, ParticipantSet, Removal};
use crate::mesh::local::LocalMedia;
use crate::mesh::state::{MeshSnapshot, Phase};
use crate::peer::{Endpoint, EventSink, MediaCall, Transport, TransportError, TransportEvent};
use crate::registry::{PresenceRecord, RegistryError, RoomRegistry};
use crate::session::LocalIdentity;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MARK_INACTIVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(crate) enum Command {
    ToggleAudio(oneshot::Sender<()>),
    ToggleVideo(oneshot::Sender<()>),
    ToggleScreenShare(oneshot::Sender<()>),
    Leave(oneshot::Sender<()>),
}

/// Results of work the coordinator spawned
enum Internal {
    EndpointOpened(Arc<dyn Endpoint>),
    EndpointFailed(TransportError),
    PresencePublished,
    Poll(Result<Vec<PresenceRecord>, RegistryError>),
    ScreenCaptured(Result<MediaStream, MediaError>),
    ScreenTrackEnded(String),
}

pub(crate) struct Coordinator {
    identity: LocalIdentity,
    endpoint_id: String,
    config: MeshConfig,
    media_source: Arc<dyn MediaSource>,
    registry: Arc<dyn RoomRegistry>,
    phase: Phase,
    local: LocalMedia,
    endpoint: Option<Arc<dyn Endpoint>>,
    connections: ConnectionSet,
    participants: ParticipantSet,
    last_error: Option<String>,
    capture_pending: bool,
    poll_task: Option<JoinHandle<()>>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    shutdown: Arc<watch::Sender<bool>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

pub(crate) struct Channels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub snapshot_tx: watch::Sender<MeshSnapshot>,
    pub shutdown: Arc<watch::Sender<bool>>,
}

/// Spawns the coordinator task for a session whose camera stream is already acquired
pub(crate) fn spawn(
    identity: LocalIdentity,
    config: MeshConfig,
    camera: MediaStream,
    media_source: Arc<dyn MediaSource>,
    registry: Arc<dyn RoomRegistry>,
    transport: Arc<dyn Transport>,
    channels: Channels,
) -> JoinHandle<()> {
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator {
        endpoint_id: identity.endpoint_id(),
        identity,
        config,
        media_source,
        registry,
        phase: Phase::Initializing,
        local: LocalMedia::new(camera),
        endpoint: None,
        connections: ConnectionSet::default(),
        participants: ParticipantSet::default(),
        last_error: None,
        capture_pending: false,
        poll_task: None,
        snapshot_tx: channels.snapshot_tx,
        shutdown: channels.shutdown,
        internal_tx,
    };
    tokio::spawn(coordinator.run(
        transport,
        events_tx,
        channels.commands,
        events_rx,
        internal_rx,
    ))
}

impl Coordinator {
    async fn run(
        mut self,
        transport: Arc<dyn Transport>,
        events_tx: EventSink,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(session = %self.identity.session, endpoint = %self.endpoint_id, "joining session");
        self.open_endpoint(transport, events_tx);
        self.publish();

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Leave(ack)) => {
                        self.terminate().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    // Handle dropped without leaving
                    None => {
                        self.terminate().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_transport(event).await,
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }

        // Late completions still own resources that nobody else will release.
        internal.close();
        while let Ok(event) = internal.try_recv() {
            match event {
                Internal::EndpointOpened(endpoint) => endpoint.destroy().await,
                Internal::ScreenCaptured(Ok(stream)) => stream.stop_all(),
                _ => {}
            }
        }
        events.close();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::IncomingCall(call) = event {
                call.close().await;
            }
        }
        debug!(endpoint = %self.endpoint_id, "coordinator stopped");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(MeshSnapshot {
            phase: self.phase,
            local_stream: Some(self.local.current().clone()),
            participants: self.participants.to_vec(),
            is_audio_enabled: self.local.audio_enabled(),
            is_video_enabled: self.local.video_enabled(),
            is_screen_sharing: self.local.is_sharing(),
            last_error: self.last_error.clone(),
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            info!(endpoint = %self.endpoint_id, from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
        }
    }

    fn open_endpoint(&self, transport: Arc<dyn Transport>, events_tx: EventSink) {
        let endpoint_id = self.endpoint_id.clone();
        let tx = self.internal_tx.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            match transport.open_endpoint(&endpoint_id, events_tx).await {
                Ok(endpoint) => {
                    let left = *shutdown.borrow();
                    if left {
                        endpoint.destroy().await;
                        return;
                    }
                    if let Err(mpsc::error::SendError(Internal::EndpointOpened(endpoint))) =
                        tx.send(Internal::EndpointOpened(endpoint))
                    {
                        endpoint.destroy().await;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Internal::EndpointFailed(e));
                }
            }
        });
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ToggleAudio(ack) => {
                if self.require_active("toggle audio") {
                    let enabled = self.local.toggle_audio();
                    info!(enabled, "audio toggled");
                    self.publish();
                }
                let _ = ack.send(());
            }
            Command::ToggleVideo(ack) => {
                if self.require_active("toggle video") {
                    let enabled = self.local.toggle_video();
                    info!(enabled, "video toggled");
                    self.publish();
                }
                let _ = ack.send(());
            }
            Command::ToggleScreenShare(ack) => {
                if self.require_active("toggle screen share") {
                    if self.local.is_sharing() {
                        self.stop_screen_share().await;
                    } else {
                        self.request_screen_capture();
                    }
                }
                let _ = ack.send(());
            }
            // Handled by the run loop
            Command::Leave(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn require_active(&self, action: &str) -> bool {
        if self.phase != Phase::Active {
            info!(phase = %self.phase, "{action} ignored outside the active phase");
            return false;
        }
        true
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::EndpointOpened(endpoint) => {
                if self.phase != Phase::Initializing {
                    endpoint.destroy().await;
                    return;
                }
                info!(endpoint = %endpoint.id(), "endpoint open");
                self.endpoint = Some(endpoint);
                self.set_phase(Phase::Discovering);
                self.publish();
                self.publish_presence();
            }
            Internal::EndpointFailed(e) => {
                if self.phase == Phase::Initializing {
                    self.enter_error(e.to_string()).await;
                }
            }
            Internal::PresencePublished => {
                if self.phase != Phase::Discovering {
                    return;
                }
                self.start_discovery();
                self.set_phase(Phase::Active);
                self.publish();
            }
            Internal::Poll(result) => {
                if self.phase != Phase::Active {
                    return;
                }
                match result {
                    Ok(records) => self.connect_discovered(records),
                    Err(e) => warn!(session = %self.identity.session, error = %e, "presence poll failed"),
                }
            }
            Internal::ScreenCaptured(result) => {
                self.capture_pending = false;
                self.on_screen_captured(result).await;
            }
            Internal::ScreenTrackEnded(track_id) => {
                if self.local.screen_video_id().as_deref() == Some(track_id.as_str()) {
                    info!("screen capture ended outside the app");
                    self.stop_screen_share().await;
                }
            }
        }
    }

    /// Publication finishes (either way) before polling starts, so this
    /// endpoint is never missing from its own first listing.
    fn publish_presence(&self) {
        let registry = self.registry.clone();
        let session = self.identity.session.to_string();
        let user = self.identity.user.to_string();
        let endpoint_id = self.endpoint_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = registry
                .publish_presence(&session, &endpoint_id, &user)
                .await
            {
                warn!(session = %session, error = %e, "failed to publish presence");
            }
            let _ = tx.send(Internal::PresencePublished);
        });
    }

    fn start_discovery(&mut self) {
        let registry = self.registry.clone();
        let session = self.identity.session.to_string();
        let period = self.config.discovery_interval();
        let window = self.config.discovery_window();
        let mut shutdown = self.shutdown.subscribe();
        let tx = self.internal_tx.clone();

        self.poll_task = Some(tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_signalled(&mut shutdown) => break,
                }
                if window.is_some_and(|w| started.elapsed() >= w) {
                    info!(session = %session, "discovery window elapsed, polling stopped");
                    break;
                }
                let result = registry.list_active_presence(&session).await;
                if tx.send(Internal::Poll(result)).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_discovery(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }

    /// The listing is a snapshot; the set to call is re-derived from it each tick.
    fn connect_discovered(&mut self, records: Vec<PresenceRecord>) {
        for record in records {
            if !record.active
                || record.endpoint_id == self.endpoint_id
                || self.connections.contains(&record.endpoint_id)
            {
                continue;
            }
            self.connect(&record.endpoint_id);
        }
    }

    fn connect(&mut self, peer: &str) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        match endpoint.call(peer, self.local.current()) {
            Ok(call) => {
                info!(peer = %peer, call = %call.id(), "calling discovered peer");
                self.connections.claim(peer, call);
            }
            Err(e) => warn!(peer = %peer, error = %e, "could not place call"),
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall(call) => self.on_incoming_call(call).await,
            TransportEvent::RemoteStream {
                peer,
                call_id,
                stream,
            } => {
                match self.connections.role(&peer, &call_id) {
                    Some(CallRole::Primary) => {
                        self.connections.mark_open(&peer, &call_id);
                        if self.participants.upsert(&peer, stream) {
                            info!(peer = %peer, "participant joined");
                        }
                    }
                    Some(CallRole::Secondary) => {
                        if !self.participants.insert_if_absent(&peer, stream) {
                            return;
                        }
                        self.connections.mark_open(&peer, &call_id);
                        info!(peer = %peer, "participant joined");
                    }
                    None => {
                        debug!(peer = %peer, call = %call_id, "stream for an unknown call ignored");
                        return;
                    }
                }
                self.publish();
            }
            TransportEvent::CallClosed { peer, call_id } => {
                self.on_call_ended(&peer, &call_id, None).await;
            }
            TransportEvent::CallError {
                peer,
                call_id,
                error,
            } => {
                self.on_call_ended(&peer, &call_id, Some(error)).await;
            }
            TransportEvent::EndpointError(e) => {
                if matches!(self.phase, Phase::Terminated | Phase::Error) {
                    return;
                }
                self.enter_error(e.to_string()).await;
            }
        }
    }

    async fn on_incoming_call(&mut self, call: Arc<dyn MediaCall>) {
        let peer = call.peer().to_string();
        if self.phase != Phase::Active || peer == self.endpoint_id {
            debug!(peer = %peer, phase = %self.phase, "incoming call refused");
            call.close().await;
            return;
        }
        if let Err(e) = call.answer(self.local.current()) {
            warn!(peer = %peer, error = %e, "failed to answer call");
            call.close().await;
            return;
        }
        if self.connections.contains(&peer) {
            debug!(peer = %peer, call = %call.id(), "crossed call kept as secondary");
            self.connections.attach_secondary(&peer, call);
        } else {
            info!(peer = %peer, call = %call.id(), "answered incoming call");
            self.connections.claim(&peer, call);
        }
    }

    async fn on_call_ended(&mut self, peer: &str, call_id: &str, error: Option<TransportError>) {
        if let Some(e) = &error {
            warn!(peer = %peer, call = %call_id, error = %e, "call failed");
        }
        match self.connections.remove_call(peer, call_id) {
            Removal::Primary(conn) => {
                let secondaries: Vec<Arc<dyn MediaCall>> =
                    conn.into_calls().into_iter().skip(1).collect();
                for call in secondaries {
                    call.close().await;
                }
                if self.participants.remove(peer).is_some() {
                    info!(peer = %peer, "participant left");
                }
                self.publish();
            }
            Removal::Secondary { supplied_media, .. } => {
                debug!(peer = %peer, call = %call_id, "secondary call ended");
                if supplied_media && self.participants.remove(peer).is_some() {
                    info!(peer = %peer, "participant left");
                    self.publish();
                }
            }
            Removal::NotFound => {}
        }
    }

    fn request_screen_capture(&mut self) {
        if self.capture_pending {
            debug!("screen capture already in progress");
            return;
        }
        self.capture_pending = true;
        let source = self.media_source.clone();
        let constraints = self.config.display.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = source.display_media(&constraints).await;
            if let Err(mpsc::error::SendError(Internal::ScreenCaptured(Ok(stream)))) =
                tx.send(Internal::ScreenCaptured(result))
            {
                stream.stop_all();
            }
        });
    }

    async fn on_screen_captured(&mut self, result: Result<MediaStream, MediaError>) {
        let display = match result {
            Ok(display) => display,
            Err(e) => {
                warn!(error = %e, "screen capture failed");
                self.last_error = Some(e.to_string());
                self.publish();
                return;
            }
        };
        // The world may have moved on while the picker was open.
        if self.phase != Phase::Active || self.local.is_sharing() {
            debug!(phase = %self.phase, "discarding late screen capture");
            display.stop_all();
            return;
        }
        let carry = self.config.carry_audio_into_screen_share;
        let Some(screen_video) = self.local.start_share(display.clone(), carry) else {
            warn!("screen capture has no video track");
            display.stop_all();
            return;
        };
        info!(track = %screen_video.id(), "screen sharing started");
        self.replace_on_all_calls(&screen_video).await;
        self.watch_screen_end(&screen_video);
        self.publish();
    }

    fn watch_screen_end(&self, track: &LocalTrack) {
        let track = track.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(Internal::ScreenTrackEnded(track.id().to_string()));
        });
    }

    /// Single OFF path for both the user action and an externally ended capture
    async fn stop_screen_share(&mut self) {
        let Some(camera_video) = self.local.stop_share() else {
            return;
        };
        info!("screen sharing stopped");
        self.replace_on_all_calls(&camera_video).await;
        self.publish();
    }

    async fn replace_on_all_calls(&self, track: &LocalTrack) {
        for call in self.connections.all_calls() {
            if let Err(e) = call.replace_outbound_track(track).await {
                warn!(peer = %call.peer(), call = %call.id(), error = %e, "track replacement failed");
            }
        }
    }

    async fn close_all_connections(&mut self) {
        for conn in self.connections.drain() {
            for call in conn.into_calls() {
                call.close().await;
            }
        }
        self.participants.clear();
    }

    async fn enter_error(&mut self, message: String) {
        warn!(endpoint = %self.endpoint_id, error = %message, "mesh failed");
        self.stop_discovery();
        self.set_phase(Phase::Error);
        self.last_error = Some(message);
        self.close_all_connections().await;
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy().await;
        }
        self.publish();
    }

    async fn terminate(&mut self) {
        if self.phase == Phase::Terminated {
            return;
        }
        self.shutdown.send_replace(true);
        self.stop_discovery();
        self.set_phase(Phase::Terminated);

        self.close_all_connections().await;
        self.local.stop_all();
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy().await;
        }

        // Awaited (bounded) so a quick rejoin never has its fresh row marked too.
        let session = self.identity.session.to_string();
        let user = self.identity.user.to_string();
        match tokio::time::timeout(
            MARK_INACTIVE_TIMEOUT,
            self.registry.mark_inactive(&session, &user),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %session, error = %e, "failed to mark presence inactive"),
            Err(_) => warn!(session = %session, "marking presence inactive timed out"),
        }

        info!(session = %self.identity.session, "left session");
        self.publish();
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}
