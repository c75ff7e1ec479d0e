//! Peer-mesh audio/video sessions: every participant holds a direct WebRTC
//! connection to every other participant, found through a shared room
//! registry.
pub mod config;
pub mod logger;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{ConfigError, MediaConstraints, MeshConfig};
pub use media::{LocalTrack, MediaError, MediaSource, MediaStream, RemoteStream, SyntheticMediaSource, TrackKind};
pub use mesh::{MeshCoordinator, MeshError, MeshSnapshot, Participant, Phase};
pub use peer::{LoopbackNetwork, Transport, TransportError, TransportEvent, WebRtcTransport};
pub use registry::{MemoryRegistry, PresenceRecord, RegistryError, RestRegistry, RoomRegistry};
pub use session::{LocalIdentity, SessionId, UserId};
pub use signaling::{InMemoryBroker, SignalBroker, WsBroker};
