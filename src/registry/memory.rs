use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PresenceRecord, RegistryError, RoomRegistry};

/// Process-local registry. Share one instance (behind an `Arc`) between clients
/// to put them in the same rooms.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<Vec<PresenceRecord>>,
    offline: AtomicBool,
    list_calls: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`RegistryError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Inserts a raw record, bypassing the publish path
    pub fn insert(&self, record: PresenceRecord) {
        self.records.write().push(record);
    }

    pub fn records(&self) -> Vec<PresenceRecord> {
        self.records.read().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), RegistryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable {
                message: "registry is offline".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RoomRegistry for MemoryRegistry {
    async fn publish_presence(
        &self,
        session_id: &str,
        endpoint_id: &str,
        participant_id: &str,
    ) -> Result<(), RegistryError> {
        self.check_online()?;
        // A rejoin adds a fresh row; older rows stay as history.
        self.records.write().push(PresenceRecord {
            endpoint_id: endpoint_id.to_string(),
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            active: true,
        });
        Ok(())
    }

    async fn list_active_presence(
        &self,
        session_id: &str,
    ) -> Result<Vec<PresenceRecord>, RegistryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.active && r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn mark_inactive(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<(), RegistryError> {
        self.check_online()?;
        for record in self.records.write().iter_mut() {
            if record.session_id == session_id && record.participant_id == participant_id {
                record.active = false;
            }
        }
        Ok(())
    }
}
