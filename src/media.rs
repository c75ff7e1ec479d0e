//! Local media: tracks, streams and the source that acquires them.
//!
//! A [`LocalTrack`] is a cheap handle; clones share the same enabled flag and
//! end-of-life signal, so a track carried from the camera stream into a screen
//! stream stays one track. [`MediaStream`] equality is by identity
//! ([`MediaStream::ptr_eq`]), which is what the coordinator relies on when it
//! restores the camera stream after screen sharing.

use crate::config::MediaConstraints;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied for {device}")]
    PermissionDenied { device: String },
    #[error("{device} is unavailable")]
    DeviceUnavailable { device: String },
    #[error("track {track_id} has ended")]
    TrackEnded { track_id: String },
    #[error("failed to write sample: {0}")]
    Write(#[from] webrtc::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtp: Arc<TrackLocalStaticSample>,
}

#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, stream_id: &str) -> Self {
        let id = random_id();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Ends the track for good. Observers waiting in [`LocalTrack::ended`] wake up.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, whoever stopped it
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        loop {
            let ended = *rx.borrow_and_update();
            if ended || rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn ptr_eq(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The RTP-facing track fed to peer connections
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtp.clone()
    }

    /// Feeds one encoded frame. Disabled tracks swallow samples so peers see a
    /// frozen or silent track rather than a missing one.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if self.is_ended() {
            return Err(MediaError::TrackEnded {
                track_id: self.inner.id.clone(),
            });
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.inner
            .rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<LocalTrack>>,
}

#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self::with_id(random_id(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn audio_track(&self) -> Option<LocalTrack> {
        self.first_of(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<LocalTrack> {
        self.first_of(TrackKind::Video)
    }

    fn first_of(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    /// Adds a track unless this stream already holds it
    pub fn add_track(&self, track: LocalTrack) {
        let mut tracks = self.inner.tracks.write();
        if !tracks.iter().any(|t| t.ptr_eq(&track)) {
            tracks.push(track);
        }
    }

    pub fn contains(&self, track: &LocalTrack) -> bool {
        self.inner.tracks.read().iter().any(|t| t.ptr_eq(track))
    }

    pub fn stop_all(&self) {
        for track in self.inner.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn ptr_eq(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}

/// A track received from a remote peer
pub trait RemoteMediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    /// Whether the sender currently has the track enabled, as far as the transport can tell
    fn is_enabled(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Debug)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<Arc<dyn RemoteMediaTrack>>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn RemoteMediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn RemoteMediaTrack>] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<Arc<dyn RemoteMediaTrack>> {
        self.tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .cloned()
    }

    pub fn video_track(&self) -> Option<Arc<dyn RemoteMediaTrack>> {
        self.tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned()
    }
}

/// Camera/microphone and display capture
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
    async fn display_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

/// Device-less source producing fresh tracks on demand. The encoder pipeline
/// writes samples into the returned tracks; failures and capture latency can be
/// injected for exercising the coordinator.
#[derive(Default)]
pub struct SyntheticMediaSource {
    deny_user_media: AtomicBool,
    deny_display_media: AtomicBool,
    display_delay: Mutex<Duration>,
    user_streams: Mutex<Vec<MediaStream>>,
    display_streams: Mutex<Vec<MediaStream>>,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user_media(&self, deny: bool) {
        self.deny_user_media.store(deny, Ordering::SeqCst);
    }

    pub fn deny_display_media(&self, deny: bool) {
        self.deny_display_media.store(deny, Ordering::SeqCst);
    }

    pub fn set_display_delay(&self, delay: Duration) {
        *self.display_delay.lock() = delay;
    }

    pub fn user_streams(&self) -> Vec<MediaStream> {
        self.user_streams.lock().clone()
    }

    pub fn display_streams(&self) -> Vec<MediaStream> {
        self.display_streams.lock().clone()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied {
                device: "camera/microphone".into(),
            });
        }
        let stream_id = random_id();
        let mut tracks = Vec::new();
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(TrackKind::Video, "camera", &stream_id));
        }
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, "microphone", &stream_id));
        }
        let stream = MediaStream::with_id(stream_id, tracks);
        self.user_streams.lock().push(stream.clone());
        Ok(stream)
    }

    async fn display_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        let delay = *self.display_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.deny_display_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied {
                device: "screen".into(),
            });
        }
        let stream_id = random_id();
        let mut tracks = vec![LocalTrack::new(TrackKind::Video, "screen", &stream_id)];
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, "system audio", &stream_id));
        }
        let stream = MediaStream::with_id(stream_id, tracks);
        self.display_streams.lock().push(stream.clone());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_enabled_and_ended_state() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", "s");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());

        let waiter = tokio::spawn({
            let track = track.clone();
            async move { track.ended().await }
        });
        clone.stop();
        waiter.await.expect("ended observer");
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn ended_resolves_for_already_stopped_track() {
        let track = LocalTrack::new(TrackKind::Video, "cam", "s");
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), track.ended())
            .await
            .expect("already ended");
    }

    #[test]
    fn add_track_ignores_duplicates() {
        let mic = LocalTrack::new(TrackKind::Audio, "mic", "s");
        let stream = MediaStream::new(vec![LocalTrack::new(TrackKind::Video, "screen", "s")]);
        stream.add_track(mic.clone());
        stream.add_track(mic.clone());
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.audio_track().expect("audio").ptr_eq(&mic));
    }

    #[tokio::test]
    async fn disabled_track_swallows_samples_and_ended_track_rejects() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", "s");
        track.set_enabled(false);
        track
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .expect("disabled write is a no-op");
        track.stop();
        assert!(matches!(
            track
                .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
                .await,
            Err(MediaError::TrackEnded { .. })
        ));
    }

    #[tokio::test]
    async fn synthetic_source_honours_constraints_and_denials() {
        let source = SyntheticMediaSource::new();
        let camera = source
            .user_media(&MediaConstraints::camera())
            .await
            .expect("camera");
        assert!(camera.audio_track().is_some());
        assert!(camera.video_track().is_some());

        let screen = source
            .display_media(&MediaConstraints::display())
            .await
            .expect("screen");
        assert!(screen.audio_track().is_none());
        assert_eq!(source.display_streams().len(), 1);

        source.deny_user_media(true);
        assert!(matches!(
            source.user_media(&MediaConstraints::camera()).await,
            Err(MediaError::PermissionDenied { .. })
        ));
    }
}
