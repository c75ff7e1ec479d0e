use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PresenceRecord, RegistryError, RoomRegistry};
use crate::session::endpoint_id;

const TABLE: &str = "room_participants";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestRegistryConfig {
    /// Project base url, e.g. `https://xyz.supabase.co`
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    10
}

/// Presence stored in a PostgREST `room_participants` table
#[derive(Debug, Clone)]
pub struct RestRegistry {
    client: reqwest::Client,
    table_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct NewParticipantRow<'a> {
    room_id: &'a str,
    user_id: &'a str,
    endpoint_id: &'a str,
    is_active: bool,
}

#[derive(Debug, Serialize)]
struct LeaveUpdate {
    is_active: bool,
    left_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct ParticipantRow {
    room_id: String,
    user_id: String,
    #[serde(default)]
    endpoint_id: Option<String>,
    is_active: bool,
}

impl ParticipantRow {
    // Rows written by older clients carry no endpoint id; they used the derived name.
    fn into_record(self) -> PresenceRecord {
        let endpoint_id = self
            .endpoint_id
            .unwrap_or_else(|| endpoint_id(&self.room_id, &self.user_id));
        PresenceRecord {
            endpoint_id,
            session_id: self.room_id,
            participant_id: self.user_id,
            active: self.is_active,
        }
    }
}

impl RestRegistry {
    pub fn new(config: &RestRegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", config.base_url.trim_end_matches('/'), TABLE),
            api_key: config.api_key.clone(),
        })
    }

    pub fn table_url(&self) -> &str {
        &self.table_url
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, &self.table_url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RoomRegistry for RestRegistry {
    async fn publish_presence(
        &self,
        session_id: &str,
        endpoint_id: &str,
        participant_id: &str,
    ) -> Result<(), RegistryError> {
        let row = NewParticipantRow {
            room_id: session_id,
            user_id: participant_id,
            endpoint_id,
            is_active: true,
        };
        let response = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?;
        check_status(response).await?;
        debug!(session = %session_id, endpoint = %endpoint_id, "presence published");
        Ok(())
    }

    async fn list_active_presence(
        &self,
        session_id: &str,
    ) -> Result<Vec<PresenceRecord>, RegistryError> {
        let response = self
            .request(reqwest::Method::GET)
            .query(&[
                ("select", "room_id,user_id,endpoint_id,is_active".to_string()),
                ("room_id", format!("eq.{session_id}")),
                ("is_active", "eq.true".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<ParticipantRow> = check_status(response).await?.json().await?;
        Ok(rows
            .into_iter()
            .map(ParticipantRow::into_record)
            .filter(|r| r.active)
            .collect())
    }

    async fn mark_inactive(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<(), RegistryError> {
        let update = LeaveUpdate {
            is_active: false,
            left_at: chrono::Utc::now(),
        };
        let response = self
            .request(reqwest::Method::PATCH)
            .query(&[
                ("room_id", format!("eq.{session_id}")),
                ("user_id", format!("eq.{participant_id}")),
                ("is_active", "eq.true".to_string()),
            ])
            .header("Prefer", "return=minimal")
            .json(&update)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
