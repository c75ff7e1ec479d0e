use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// SDP with metadata, as carried inside offer/answer signals
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
    pub id: String,
    pub ts: i64,
}

/// ICE candidate for one call
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub connection_id: String, // call id the candidate belongs to
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Endpoint-to-endpoint message relayed by a signal broker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    Offer {
        src: String,
        dst: String,
        call_id: String,
        /// gzip+base64 encoded [`SdpPayload`]
        payload: String,
    },
    Answer {
        src: String,
        dst: String,
        call_id: String,
        payload: String,
    },
    Candidate {
        src: String,
        dst: String,
        candidate: IceCandidate,
    },
    Bye {
        src: String,
        dst: String,
        call_id: String,
    },
}

impl SignalMessage {
    pub fn src(&self) -> &str {
        match self {
            SignalMessage::Offer { src, .. }
            | SignalMessage::Answer { src, .. }
            | SignalMessage::Candidate { src, .. }
            | SignalMessage::Bye { src, .. } => src,
        }
    }

    pub fn dst(&self) -> &str {
        match self {
            SignalMessage::Offer { dst, .. }
            | SignalMessage::Answer { dst, .. }
            | SignalMessage::Candidate { dst, .. }
            | SignalMessage::Bye { dst, .. } => dst,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::Bye { call_id, .. } => call_id,
            SignalMessage::Candidate { candidate, .. } => &candidate.connection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_messages_are_tagged_json() {
        let msg = SignalMessage::Bye {
            src: "123456-a".into(),
            dst: "123456-b".into(),
            call_id: "c1".into(),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "BYE");
        assert_eq!(json["dst"], "123456-b");
    }

    #[test]
    fn candidate_call_id_comes_from_connection_id() {
        let msg: SignalMessage = serde_json::from_str(
            r#"{"type":"CANDIDATE","src":"a","dst":"b","candidate":{
                "candidate":"candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host",
                "sdp_mid":"0","sdp_mline_index":0,"connection_id":"call-7"}}"#,
        )
        .expect("parse");
        assert_eq!(msg.call_id(), "call-7");
        assert_eq!(msg.src(), "a");
    }
}
