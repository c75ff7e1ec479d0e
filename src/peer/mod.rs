//! Connection transport: named endpoints that place and accept media calls.
//!
//! Progress is reported asynchronously through an [`EventSink`] handed to
//! [`Transport::open_endpoint`]: incoming calls, remote streams, closes and
//! errors all arrive there, tagged with the remote endpoint and call id.
pub mod codec;
pub mod connection;
pub mod endpoint;
mod error;
pub mod ice;
pub mod loopback;
pub mod state;
pub mod types;

use crate::media::{LocalTrack, MediaStream, RemoteStream, TrackKind};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use connection::{WebRtcCall, WebRtcRemoteTrack};
pub use endpoint::{WebRtcEndpoint, WebRtcTransport};
pub use error::TransportError;
pub use loopback::{LoopbackCall, LoopbackNetwork, MirroredTrack};
pub use types::{IceCandidate, SdpPayload, ServerConfig, SignalMessage};

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug)]
pub enum TransportEvent {
    IncomingCall(Arc<dyn MediaCall>),
    RemoteStream {
        peer: String,
        call_id: String,
        stream: RemoteStream,
    },
    CallClosed {
        peer: String,
        call_id: String,
    },
    CallError {
        peer: String,
        call_id: String,
        error: TransportError,
    },
    /// The endpoint itself broke; no further calls can be placed or received
    EndpointError(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_endpoint(
        &self,
        endpoint_id: &str,
        events: EventSink,
    ) -> Result<Arc<dyn Endpoint>, TransportError>;
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    /// Starts an outbound call carrying `stream`. Returns as soon as the attempt
    /// exists; the remote stream, close or failure arrive as events.
    fn call(
        &self,
        remote_endpoint_id: &str,
        stream: &MediaStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError>;

    /// Closes every call and releases the endpoint id
    async fn destroy(&self);
}

#[async_trait]
pub trait MediaCall: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Remote endpoint id
    fn peer(&self) -> &str;

    fn direction(&self) -> CallDirection;

    /// Accepts an inbound call, sending `stream` back
    fn answer(&self, stream: &MediaStream) -> Result<(), TransportError>;

    /// Track currently sent for `kind`
    fn outbound_track(&self, kind: TrackKind) -> Option<LocalTrack>;

    /// Swaps the sent track of `track.kind()` without renegotiating
    async fn replace_outbound_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn close(&self);
}
