use chrono::{DateTime, Utc};

/// A user's link to the aggregation provider. Created on first successful
/// code exchange, mutated on token refresh, never hard-deleted.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub provider_connection_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Degraded(String),
    Disconnected,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        matches!(self.status, ConnectionStatus::Active)
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => false,
        }
    }
}
