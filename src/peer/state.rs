use crate::media::{LocalTrack, MediaStream, RemoteMediaTrack, TrackKind};
use crate::peer::types::IceCandidate;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// What a call is sending, per track kind. Updated before the RTP senders so a
/// replacement issued mid-negotiation is never lost.
#[derive(Debug, Default, Clone)]
pub struct OutboundTracks {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl OutboundTracks {
    pub fn from_stream(stream: &MediaStream) -> Self {
        Self {
            audio: stream.audio_track(),
            video: stream.video_track(),
        }
    }

    pub fn get(&self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.clone(),
            TrackKind::Video => self.video.clone(),
        }
    }

    pub fn set(&mut self, track: LocalTrack) {
        match track.kind() {
            TrackKind::Audio => self.audio = Some(track),
            TrackKind::Video => self.video = Some(track),
        }
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }
}

/// RTP senders created once the peer connection exists
#[derive(Default)]
pub struct Senders {
    pub audio: Option<Arc<RTCRtpSender>>,
    pub video: Option<Arc<RTCRtpSender>>,
}

impl Senders {
    pub fn get(&self, kind: TrackKind) -> Option<Arc<RTCRtpSender>> {
        match kind {
            TrackKind::Audio => self.audio.clone(),
            TrackKind::Video => self.video.clone(),
        }
    }

    pub fn set(&mut self, kind: TrackKind, sender: Arc<RTCRtpSender>) {
        match kind {
            TrackKind::Audio => self.audio = Some(sender),
            TrackKind::Video => self.video = Some(sender),
        }
    }
}

/// Trickle-ICE bookkeeping for one call
#[derive(Debug, Default)]
pub struct IceState {
    /// Remote candidates that arrived before the remote description was set
    pub pending_remote: Vec<IceCandidate>,
    pub remote_description_set: bool,
    pub local: Vec<IceCandidate>,
}

/// Tracks received so far on one call
#[derive(Debug, Default)]
pub struct RemoteTracks {
    pub stream_id: Option<String>,
    pub tracks: Vec<Arc<dyn RemoteMediaTrack>>,
}
