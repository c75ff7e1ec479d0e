use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint id {endpoint_id} is already taken")]
    UnavailableId { endpoint_id: String },
    #[error("peer {endpoint_id} is not reachable")]
    PeerUnavailable { endpoint_id: String },
    #[error("endpoint {endpoint_id} is closed")]
    EndpointClosed { endpoint_id: String },
    #[error("call {call_id} is closed")]
    CallClosed { call_id: String },
    #[error("call {call_id}: {message}")]
    InvalidCallState { call_id: String, message: String },
    #[error("ICE failed for call {call_id}")]
    IceFailed { call_id: String },
    #[error("call {call_id} did not connect within {timeout_ms} ms")]
    NegotiationTimeout { call_id: String, timeout_ms: u64 },
    #[error("signal broker error: {message}")]
    Broker { message: String },
    #[error("failed to encode or decode signal payload: {message}")]
    Codec { message: String },
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}
