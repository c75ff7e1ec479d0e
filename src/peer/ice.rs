use crate::peer::state::IceState;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;

pub fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

/// Maps configured servers to webrtc ICE servers
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Applies a remote candidate now, or parks it until the remote description is set
pub async fn add_remote_candidate(
    pc: Option<&RTCPeerConnection>,
    ice: &Mutex<IceState>,
    candidate: IceCandidate,
) {
    {
        let mut state = ice.lock();
        if !state.remote_description_set || pc.is_none() {
            debug!(call = %candidate.connection_id, "remote description not set yet, queuing candidate");
            state.pending_remote.push(candidate);
            return;
        }
    }
    if let Some(pc) = pc {
        if let Err(e) = pc.add_ice_candidate(to_init(candidate)).await {
            warn!(error = %e, "failed to add ICE candidate");
        }
    }
}

/// Marks the remote description as set and applies everything queued before it
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, ice: &Mutex<IceState>) {
    let candidates = {
        let mut state = ice.lock();
        state.remote_description_set = true;
        state.pending_remote.drain(..).collect::<Vec<_>>()
    };

    for candidate in candidates {
        debug!(call = %candidate.connection_id, "applying pending candidate");
        if let Err(e) = pc.add_ice_candidate(to_init(candidate)).await {
            warn!(error = %e, "failed to apply pending candidate");
        }
    }
}

pub fn analyze_candidates(call_id: &str, candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    info!(
        call = %call_id,
        host = host_count,
        srflx = srflx_count,
        relay = relay_count,
        "local candidate gathering complete"
    );

    if srflx_count == 0 && relay_count == 0 {
        warn!(call = %call_id, "no server-reflexive or relay candidates, connection through NAT may fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            connection_id: id.into(),
        }
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description() {
        let ice = Mutex::new(IceState::default());
        add_remote_candidate(None, &ice, candidate("c1")).await;
        add_remote_candidate(None, &ice, candidate("c1")).await;
        assert_eq!(ice.lock().pending_remote.len(), 2);
    }

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = ice_servers(&[ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: Some("u".into()),
            credential: Some("p".into()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }

    #[test]
    fn to_init_keeps_mid_and_index() {
        let init = to_init(candidate("c1"));
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.username_fragment.is_none());
    }
}
