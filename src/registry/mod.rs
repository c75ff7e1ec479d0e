//! Room registry client: who is present in which session.
//!
//! The registry is shared by every client and only eventually consistent, so
//! callers must treat each listing as a snapshot that may already be stale.
mod error;
mod memory;
mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::RegistryError;
pub use memory::MemoryRegistry;
pub use rest::{RestRegistry, RestRegistryConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub endpoint_id: String,
    pub session_id: String,
    pub participant_id: String,
    pub active: bool,
}

#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn publish_presence(
        &self,
        session_id: &str,
        endpoint_id: &str,
        participant_id: &str,
    ) -> Result<(), RegistryError>;

    /// Active records only
    async fn list_active_presence(
        &self,
        session_id: &str,
    ) -> Result<Vec<PresenceRecord>, RegistryError>;

    async fn mark_inactive(&self, session_id: &str, participant_id: &str)
        -> Result<(), RegistryError>;
}
