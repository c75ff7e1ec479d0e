#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshroom::peer::MirroredTrack;
use meshroom::{
    LocalIdentity, LocalTrack, LoopbackNetwork, MemoryRegistry, MeshConfig, MeshCoordinator,
    MeshSnapshot, Phase, SyntheticMediaSource,
};

pub const SESSION: &str = "123456";

pub struct Room {
    pub registry: Arc<MemoryRegistry>,
    pub network: LoopbackNetwork,
}

pub struct Client {
    pub mesh: MeshCoordinator,
    pub media: Arc<SyntheticMediaSource>,
    pub endpoint: String,
}

impl Room {
    pub fn new() -> Self {
        meshroom::logger::init_logging();
        Self {
            registry: Arc::new(MemoryRegistry::new()),
            network: LoopbackNetwork::new(),
        }
    }

    pub fn config() -> MeshConfig {
        MeshConfig {
            discovery_interval_ms: 50,
            grace_period_ms: 200,
            ..Default::default()
        }
    }

    pub async fn join(&self, user: &str) -> Client {
        self.join_with(user, Arc::new(SyntheticMediaSource::new()))
            .await
    }

    pub async fn join_with(&self, user: &str, media: Arc<SyntheticMediaSource>) -> Client {
        self.join_configured(user, media, Self::config()).await
    }

    pub async fn join_configured(
        &self,
        user: &str,
        media: Arc<SyntheticMediaSource>,
        config: MeshConfig,
    ) -> Client {
        let identity = LocalIdentity::new(SESSION, user);
        let endpoint = identity.endpoint_id();
        let mesh = MeshCoordinator::join(
            identity,
            config,
            media.clone(),
            self.registry.clone(),
            Arc::new(self.network.clone()),
        )
        .await
        .expect("join");
        Client {
            mesh,
            media,
            endpoint,
        }
    }

    /// Joins and waits for the coordinator to reach the active phase
    pub async fn join_active(&self, user: &str) -> Client {
        let client = self.join(user).await;
        eventually("active phase", || client.mesh.snapshot().phase == Phase::Active).await;
        client
    }
}

impl Client {
    pub fn snapshot(&self) -> MeshSnapshot {
        self.mesh.snapshot()
    }

    pub fn sees(&self, other: &Client) -> bool {
        self.snapshot().participant(&other.endpoint).is_some()
    }

    pub fn camera_video(&self) -> LocalTrack {
        self.media.user_streams()[0].video_track().expect("camera video")
    }
}

/// Polls `check` until it holds, failing the test after a few seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("timed out waiting for {what}");
    }
}

pub async fn connected(a: &Client, b: &Client) {
    eventually("mutual participants", || a.sees(b) && b.sees(a)).await;
}

/// The local track `viewer` currently receives as `sender`'s video
pub fn received_video(viewer: &Client, sender: &Client) -> Option<LocalTrack> {
    let snapshot = viewer.snapshot();
    let participant = snapshot.participant(&sender.endpoint)?;
    let video = participant.stream.video_track()?;
    video.as_any().downcast_ref::<MirroredTrack>()?.current()
}

pub fn received_video_enabled(viewer: &Client, sender: &Client) -> Option<bool> {
    let snapshot = viewer.snapshot();
    let participant = snapshot.participant(&sender.endpoint)?;
    Some(participant.stream.video_track()?.is_enabled())
}

pub fn received_audio_enabled(viewer: &Client, sender: &Client) -> Option<bool> {
    let snapshot = viewer.snapshot();
    let participant = snapshot.participant(&sender.endpoint)?;
    Some(participant.stream.audio_track()?.is_enabled())
}

/// Lets a few discovery ticks pass
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}
