use crate::media::{MediaStream, RemoteStream};
use std::fmt;

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Local media acquired, endpoint opening
    Initializing,
    /// Endpoint open, own presence being published
    Discovering,
    Active,
    Terminated,
    /// Endpoint could not be opened or broke; only `leave` is meaningful now
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::Discovering => "discovering",
            Phase::Active => "active",
            Phase::Terminated => "terminated",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// A remote peer whose connection has produced a stream
#[derive(Debug, Clone)]
pub struct Participant {
    pub peer_id: String,
    pub stream: RemoteStream,
}

/// Read-only view of the mesh, republished after every change
#[derive(Debug, Clone)]
pub struct MeshSnapshot {
    pub phase: Phase,
    /// Stream currently sent to peers (the screen stream while sharing)
    pub local_stream: Option<MediaStream>,
    pub participants: Vec<Participant>,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub last_error: Option<String>,
}

impl MeshSnapshot {
    pub(crate) fn initializing(local_stream: &MediaStream) -> Self {
        Self {
            phase: Phase::Initializing,
            local_stream: Some(local_stream.clone()),
            participants: Vec::new(),
            is_audio_enabled: local_stream
                .audio_track()
                .is_some_and(|t| t.is_enabled()),
            is_video_enabled: local_stream
                .video_track()
                .is_some_and(|t| t.is_enabled()),
            is_screen_sharing: false,
            last_error: None,
        }
    }

    pub fn participant(&self, peer_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.peer_id == peer_id)
    }

    pub fn peer_ids(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.peer_id.as_str()).collect()
    }
}
