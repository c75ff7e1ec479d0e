use once_cell::sync::OnceCell;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global fmt subscriber once. `RUST_LOG` wins over the build-profile default.
pub fn init_logging() {
    INIT.get_or_init(|| {
        let default_level = if crate::config::LOGGING_ENABLED {
            "info"
        } else {
            "off"
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Logs a trickled ICE candidate
pub fn dump_candidate(label: &str, call_id: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            call = %call_id,
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            "trickle {label}"
        );
    }
}

/// Snapshot of the nominated candidate pair, for diagnosing a failing connection
pub async fn dump_selected_pair(pc: &RTCPeerConnection, call_id: &str, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    call = %call_id,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected pair {moment}"
                );
            }
        }
    }
}
