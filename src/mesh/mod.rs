//! Peer-mesh session coordinator.
//!
//! [`MeshCoordinator::join`] acquires the camera, then hands everything to a
//! background task that opens the local endpoint, publishes presence, polls
//! the registry for peers and keeps one connection per remote endpoint. The
//! handle only sends commands and reads [`MeshSnapshot`]s.
mod connections;
mod coordinator;
mod error;
mod local;
mod state;

pub use connections::{CallRole, Connection, ConnectionSet, ConnectionState, ParticipantSet, Removal};
pub use error::MeshError;
pub use local::LocalMedia;
pub use state::{MeshSnapshot, Participant, Phase};

use crate::config::MeshConfig;
use crate::media::MediaSource;
use crate::peer::Transport;
use crate::registry::RoomRegistry;
use crate::session::LocalIdentity;
use coordinator::{Channels, Command};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

pub struct MeshCoordinator {
    identity: LocalIdentity,
    commands: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<MeshSnapshot>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MeshCoordinator {
    /// Joins a session. Only a failure to acquire the camera/microphone is
    /// reported here; everything after that surfaces through snapshots.
    pub async fn join(
        identity: LocalIdentity,
        config: MeshConfig,
        media_source: Arc<dyn MediaSource>,
        registry: Arc<dyn RoomRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let camera = media_source.user_media(&config.camera).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MeshSnapshot::initializing(&camera));
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        coordinator::spawn(
            identity.clone(),
            config,
            camera,
            media_source,
            registry,
            transport,
            Channels {
                commands: commands_rx,
                snapshot_tx,
                shutdown: shutdown.clone(),
            },
        );

        Ok(Self {
            identity,
            commands: commands_tx,
            snapshot_rx,
            shutdown,
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn endpoint_id(&self) -> String {
        self.identity.endpoint_id()
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot_rx.clone()
    }

    pub async fn toggle_audio(&self) {
        self.request(Command::ToggleAudio).await;
    }

    pub async fn toggle_video(&self) {
        self.request(Command::ToggleVideo).await;
    }

    /// Starts or stops screen sharing. Starting returns once the capture was
    /// requested; the swap shows up in a later snapshot.
    pub async fn toggle_screen_share(&self) {
        self.request(Command::ToggleScreenShare).await;
    }

    /// Leaves the session. Discovery stops before this returns; calling it
    /// again is a no-op.
    pub async fn leave(&self) {
        self.shutdown.send_replace(true);
        self.request(Command::Leave).await;
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(make(ack_tx)).is_err() {
            debug!(endpoint = %self.identity.endpoint_id(), "coordinator already stopped");
            return;
        }
        let _ = ack_rx.await;
    }
}

impl Drop for MeshCoordinator {
    fn drop(&mut self) {
        // The coordinator tears down once it sees the command channel close.
        self.shutdown.send_replace(true);
    }
}
