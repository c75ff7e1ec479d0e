use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshroom::{
    InMemoryBroker, LocalIdentity, MediaStream, MemoryRegistry, MeshConfig, MeshCoordinator,
    SyntheticMediaSource, WebRtcTransport,
};

/// Remote tracks only surface once RTP flows, so keep feeding frames.
fn pump(stream: MediaStream) {
    tokio::spawn(async move {
        loop {
            for track in stream.tracks() {
                if track
                    .write_sample(Bytes::from_static(&[0u8; 160]), Duration::from_millis(20))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });
}

/// Host candidates only, so the test never waits on a STUN server.
fn host_only() -> MeshConfig {
    MeshConfig {
        ice_servers: Vec::new(),
        discovery_interval_ms: 100,
        ..Default::default()
    }
}

async fn join(
    user: &str,
    registry: Arc<MemoryRegistry>,
    transport: Arc<WebRtcTransport>,
) -> (MeshCoordinator, Arc<SyntheticMediaSource>) {
    let media = Arc::new(SyntheticMediaSource::new());
    let mesh = MeshCoordinator::join(
        LocalIdentity::new("123456", user),
        host_only(),
        media.clone(),
        registry,
        transport,
    )
    .await
    .expect("join");
    pump(media.user_streams()[0].clone());
    (mesh, media)
}

#[tokio::test]
#[ignore = "needs a non-loopback interface for ICE host candidates"]
async fn two_peers_connect_over_webrtc() {
    meshroom::logger::init_logging();
    let registry = Arc::new(MemoryRegistry::new());
    let broker = Arc::new(InMemoryBroker::new());
    let transport = Arc::new(WebRtcTransport::new(broker, &host_only()));

    let (a, _a_media) = join("alice", registry.clone(), transport.clone()).await;
    let (b, _b_media) = join("bob", registry.clone(), transport.clone()).await;

    let connected = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let a_sees = a.snapshot().participant(&b.endpoint_id()).is_some();
            let b_sees = b.snapshot().participant(&a.endpoint_id()).is_some();
            if a_sees && b_sees {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(connected.is_ok(), "peers did not see each other");

    b.leave().await;
    let dropped = tokio::time::timeout(Duration::from_secs(10), async {
        while a.snapshot().participant(&b.endpoint_id()).is_some() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "bye did not remove the participant");
    a.leave().await;
}
