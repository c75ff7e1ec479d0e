mod common;

use std::sync::Arc;

use common::{connected, eventually, received_video_enabled, settle, Room, SESSION};
use meshroom::{
    LocalIdentity, MeshConfig, MeshCoordinator, MeshError, Phase, PresenceRecord,
    SyntheticMediaSource,
};

#[tokio::test]
async fn second_joiner_is_discovered_and_sees_video_toggle() {
    let room = Room::new();
    let a = room.join_active("alice").await;
    settle().await;
    assert!(a.snapshot().participants.is_empty());

    let b = room.join_active("bob").await;
    connected(&a, &b).await;

    b.mesh.toggle_video().await;
    assert!(!b.snapshot().is_video_enabled);
    eventually("alice sees bob's video disabled", || {
        received_video_enabled(&a, &b) == Some(false)
    })
    .await;
    // Disabled, not dropped: the connection and participant stay.
    assert!(a.sees(&b));
    assert_eq!(room.network.call_count(&a.endpoint), room.network.call_count(&b.endpoint));

    b.mesh.toggle_video().await;
    eventually("alice sees bob's video again", || {
        received_video_enabled(&a, &b) == Some(true)
    })
    .await;
}

#[tokio::test]
async fn never_calls_itself() {
    let room = Room::new();
    let a = room.join_active("alice").await;
    let polls = room.registry.list_calls();
    eventually("several polls", || room.registry.list_calls() >= polls + 3).await;

    assert_eq!(room.network.call_count(&a.endpoint), 0);
    assert!(a.snapshot().participants.is_empty());
}

#[tokio::test]
async fn at_most_one_connection_per_peer() {
    let room = Room::new();
    // Everyone joins at once so discovery races inbound calls.
    let (a, b, c) = tokio::join!(room.join("alice"), room.join("bob"), room.join("carol"));
    connected(&a, &b).await;
    connected(&a, &c).await;
    connected(&b, &c).await;
    settle().await;

    for client in [&a, &b, &c] {
        let snapshot = client.snapshot();
        assert_eq!(snapshot.participants.len(), 2, "{:?}", snapshot.peer_ids());
        // Crossed calls may add one extra call per pair, never more.
        assert!(room.network.call_count(&client.endpoint) <= 4);
    }
}

#[tokio::test]
async fn stale_and_inactive_records_are_skipped() {
    let room = Room::new();
    room.registry.insert(PresenceRecord {
        endpoint_id: format!("{SESSION}-ghost"),
        session_id: SESSION.into(),
        participant_id: "ghost".into(),
        active: true,
    });
    room.registry.insert(PresenceRecord {
        endpoint_id: format!("{SESSION}-gone"),
        session_id: SESSION.into(),
        participant_id: "gone".into(),
        active: false,
    });
    let a = room.join_active("alice").await;
    let b = room.join_active("bob").await;
    connected(&a, &b).await;
    settle().await;

    // The ghost endpoint never answers; its failed attempts leave no trace.
    let snapshot = a.snapshot();
    assert_eq!(snapshot.peer_ids(), vec![b.endpoint.as_str()]);
    assert_eq!(snapshot.phase, Phase::Active);
}

#[tokio::test]
async fn registry_outage_does_not_stop_discovery() {
    let room = Room::new();
    let b = room.join_active("bob").await;

    room.registry.set_offline(true);
    let a = room.join_active("alice").await;
    let polls = room.registry.list_calls();
    eventually("polling continues while offline", || {
        room.registry.list_calls() >= polls + 2
    })
    .await;
    assert!(a.snapshot().participants.is_empty());

    room.registry.set_offline(false);
    connected(&a, &b).await;
}

#[tokio::test]
async fn media_denial_fails_join() {
    let room = Room::new();
    let media = Arc::new(SyntheticMediaSource::new());
    media.deny_user_media(true);

    let result = MeshCoordinator::join(
        LocalIdentity::new(SESSION, "alice"),
        Room::config(),
        media,
        room.registry.clone(),
        Arc::new(room.network.clone()),
    )
    .await;
    assert!(matches!(result, Err(MeshError::MediaAcquisition(_))));
    assert!(room.network.endpoint_ids().is_empty());
    assert!(room.registry.records().is_empty());
}

#[tokio::test]
async fn taken_endpoint_id_moves_to_error_phase() {
    let room = Room::new();
    let _first = room.join_active("alice").await;
    let second = room.join("alice").await;

    eventually("error phase", || second.snapshot().phase == Phase::Error).await;
    let snapshot = second.snapshot();
    assert!(snapshot.last_error.is_some());

    // Toggles are ignored outside the active phase.
    let audio = snapshot.is_audio_enabled;
    second.mesh.toggle_audio().await;
    assert_eq!(second.snapshot().is_audio_enabled, audio);
}

#[tokio::test]
async fn discovery_window_bounds_polling() {
    let room = Room::new();
    let bounded = MeshConfig {
        discovery_window_ms: Some(150),
        ..Room::config()
    };
    let a = room
        .join_configured("alice", Arc::new(SyntheticMediaSource::new()), bounded)
        .await;
    eventually("active", || a.snapshot().phase == Phase::Active).await;
    settle().await;

    let polls = room.registry.list_calls();
    settle().await;
    assert_eq!(room.registry.list_calls(), polls, "polling continued past the window");

    // A late joiner with an open-ended window still finds alice.
    let b = room.join_active("bob").await;
    connected(&a, &b).await;
    let polls = room.registry.list_calls();
    eventually("unbounded discovery keeps polling", || {
        room.registry.list_calls() >= polls + 2
    })
    .await;
}
