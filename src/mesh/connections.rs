//! Coordinator-owned indexes of connections and participants, keyed by
//! remote endpoint id. Both enforce "at most one entry per peer"; the
//! coordinator keeps them consistent (no participant without a connection).
use crate::media::RemoteStream;
use crate::mesh::state::Participant;
use crate::peer::MediaCall;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Call placed or answered, no remote stream yet
    Pending,
    Open,
    Closed,
}

/// How a call relates to its peer's connection entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Primary,
    /// Extra call from a peer that already had an entry (crossed calls)
    Secondary,
}

#[derive(Debug)]
pub struct Connection {
    call: Arc<dyn MediaCall>,
    state: ConnectionState,
    secondary: Vec<Arc<dyn MediaCall>>,
    /// Call whose remote stream the participant currently shows
    media_call: Option<String>,
}

impl Connection {
    pub fn call(&self) -> &Arc<dyn MediaCall> {
        &self.call
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn media_call(&self) -> Option<&str> {
        self.media_call.as_deref()
    }

    /// Primary call first, then secondaries
    pub fn calls(&self) -> impl Iterator<Item = &Arc<dyn MediaCall>> {
        std::iter::once(&self.call).chain(self.secondary.iter())
    }

    pub(crate) fn into_calls(self) -> Vec<Arc<dyn MediaCall>> {
        let mut calls = vec![self.call];
        calls.extend(self.secondary);
        calls
    }
}

pub enum Removal {
    NotFound,
    /// `supplied_media` is set when the dropped call fed the participant; the
    /// entry is back to pending and the participant must go.
    Secondary {
        call: Arc<dyn MediaCall>,
        supplied_media: bool,
    },
    Primary(Connection),
}

#[derive(Debug, Default)]
pub struct ConnectionSet {
    entries: HashMap<String, Connection>,
}

impl ConnectionSet {
    pub fn contains(&self, peer: &str) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn get(&self, peer: &str) -> Option<&Connection> {
        self.entries.get(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peers(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Records `call` as the peer's connection. Returns false, leaving the set
    /// untouched, if the peer already has one.
    pub fn claim(&mut self, peer: &str, call: Arc<dyn MediaCall>) -> bool {
        if self.entries.contains_key(peer) {
            return false;
        }
        self.entries.insert(
            peer.to_string(),
            Connection {
                call,
                state: ConnectionState::Pending,
                secondary: Vec::new(),
                media_call: None,
            },
        );
        true
    }

    pub fn attach_secondary(&mut self, peer: &str, call: Arc<dyn MediaCall>) -> bool {
        match self.entries.get_mut(peer) {
            Some(conn) => {
                conn.secondary.push(call);
                true
            }
            None => false,
        }
    }

    pub fn role(&self, peer: &str, call_id: &str) -> Option<CallRole> {
        let conn = self.entries.get(peer)?;
        if conn.call.id() == call_id {
            Some(CallRole::Primary)
        } else if conn.secondary.iter().any(|c| c.id() == call_id) {
            Some(CallRole::Secondary)
        } else {
            None
        }
    }

    /// Marks the entry open with `call_id` as the call feeding the participant
    pub fn mark_open(&mut self, peer: &str, call_id: &str) {
        if let Some(conn) = self.entries.get_mut(peer) {
            conn.state = ConnectionState::Open;
            conn.media_call = Some(call_id.to_string());
        }
    }

    /// Drops the call `call_id` of `peer`. Losing the primary call drops the
    /// whole entry; losing a secondary only drops that call.
    pub fn remove_call(&mut self, peer: &str, call_id: &str) -> Removal {
        match self.role(peer, call_id) {
            Some(CallRole::Primary) => match self.entries.remove(peer) {
                Some(mut conn) => {
                    conn.state = ConnectionState::Closed;
                    Removal::Primary(conn)
                }
                None => Removal::NotFound,
            },
            Some(CallRole::Secondary) => {
                let Some(conn) = self.entries.get_mut(peer) else {
                    return Removal::NotFound;
                };
                let Some(idx) = conn.secondary.iter().position(|c| c.id() == call_id) else {
                    return Removal::NotFound;
                };
                let call = conn.secondary.remove(idx);
                let supplied_media = conn.media_call.as_deref() == Some(call_id);
                if supplied_media {
                    conn.media_call = None;
                    conn.state = ConnectionState::Pending;
                }
                Removal::Secondary {
                    call,
                    supplied_media,
                }
            }
            None => Removal::NotFound,
        }
    }

    /// Every live call, primaries and secondaries
    pub fn all_calls(&self) -> Vec<Arc<dyn MediaCall>> {
        self.entries
            .values()
            .flat_map(|conn| conn.calls().cloned())
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Connection> {
        self.entries
            .drain()
            .map(|(_, mut conn)| {
                conn.state = ConnectionState::Closed;
                conn
            })
            .collect()
    }
}

/// Participants in arrival order
#[derive(Debug, Default)]
pub struct ParticipantSet {
    entries: Vec<Participant>,
}

impl ParticipantSet {
    /// Inserts or replaces the peer's stream. Returns true if the peer is new.
    pub fn upsert(&mut self, peer: &str, stream: RemoteStream) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|p| p.peer_id == peer) {
            existing.stream = stream;
            return false;
        }
        self.entries.push(Participant {
            peer_id: peer.to_string(),
            stream,
        });
        true
    }

    pub fn insert_if_absent(&mut self, peer: &str, stream: RemoteStream) -> bool {
        if self.contains(peer) {
            return false;
        }
        self.upsert(peer, stream)
    }

    pub fn remove(&mut self, peer: &str) -> Option<Participant> {
        let idx = self.entries.iter().position(|p| p.peer_id == peer)?;
        Some(self.entries.remove(idx))
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.entries.iter().any(|p| p.peer_id == peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn to_vec(&self) -> Vec<Participant> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MediaStream, TrackKind};
    use crate::peer::{CallDirection, TransportError};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct StubCall {
        id: String,
        peer: String,
    }

    #[async_trait]
    impl MediaCall for StubCall {
        fn id(&self) -> &str {
            &self.id
        }
        fn peer(&self) -> &str {
            &self.peer
        }
        fn direction(&self) -> CallDirection {
            CallDirection::Outbound
        }
        fn answer(&self, _stream: &MediaStream) -> Result<(), TransportError> {
            Ok(())
        }
        fn outbound_track(&self, _kind: TrackKind) -> Option<LocalTrack> {
            None
        }
        async fn replace_outbound_track(&self, _track: &LocalTrack) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn call(id: &str, peer: &str) -> Arc<dyn MediaCall> {
        Arc::new(StubCall {
            id: id.into(),
            peer: peer.into(),
        })
    }

    #[test]
    fn claim_is_once_per_peer() {
        let mut set = ConnectionSet::default();
        assert!(set.claim("b", call("c1", "b")));
        assert!(!set.claim("b", call("c2", "b")));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("b").map(|c| c.call().id()), Some("c1"));
        assert_eq!(set.get("b").map(Connection::state), Some(ConnectionState::Pending));
    }

    #[test]
    fn secondary_close_keeps_the_entry() {
        let mut set = ConnectionSet::default();
        set.claim("b", call("c1", "b"));
        assert!(set.attach_secondary("b", call("c2", "b")));
        assert_eq!(set.role("b", "c2"), Some(CallRole::Secondary));
        assert_eq!(set.all_calls().len(), 2);

        assert!(matches!(
            set.remove_call("b", "c2"),
            Removal::Secondary {
                supplied_media: false,
                ..
            }
        ));
        assert!(set.contains("b"));
        assert!(matches!(set.remove_call("b", "c2"), Removal::NotFound));

        match set.remove_call("b", "c1") {
            Removal::Primary(conn) => assert_eq!(conn.state(), ConnectionState::Closed),
            _ => panic!("expected primary removal"),
        }
        assert!(set.is_empty());
    }

    #[test]
    fn losing_the_secondary_that_fed_media_reopens_the_entry() {
        let mut set = ConnectionSet::default();
        set.claim("b", call("c1", "b"));
        set.attach_secondary("b", call("c2", "b"));
        set.mark_open("b", "c2");
        assert_eq!(set.get("b").and_then(Connection::media_call), Some("c2"));

        assert!(matches!(
            set.remove_call("b", "c2"),
            Removal::Secondary {
                supplied_media: true,
                ..
            }
        ));
        let conn = set.get("b").expect("entry kept");
        assert_eq!(conn.state(), ConnectionState::Pending);
        assert_eq!(conn.media_call(), None);
        assert_eq!(conn.call().id(), "c1");
    }

    #[test]
    fn stale_call_ids_are_ignored() {
        let mut set = ConnectionSet::default();
        set.claim("b", call("c1", "b"));
        assert!(matches!(set.remove_call("b", "old"), Removal::NotFound));
        assert!(matches!(set.remove_call("zz", "c1"), Removal::NotFound));
        assert!(set.contains("b"));
    }

    #[test]
    fn participants_upsert_without_duplicates() {
        let mut set = ParticipantSet::default();
        assert!(set.upsert("b", RemoteStream::new("s1", Vec::new())));
        assert!(!set.upsert("b", RemoteStream::new("s2", Vec::new())));
        assert!(!set.insert_if_absent("b", RemoteStream::new("s3", Vec::new())));
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_vec()[0].stream.id(), "s2");

        set.upsert("c", RemoteStream::new("s4", Vec::new()));
        assert_eq!(set.remove("b").map(|p| p.peer_id), Some("b".to_string()));
        assert!(set.contains("c"));
        assert!(set.remove("b").is_none());
    }
}
