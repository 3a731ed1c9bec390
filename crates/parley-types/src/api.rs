use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Presence, UserId};

// -- Presence --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<Presence> for PresenceResponse {
    fn from(p: Presence) -> Self {
        Self {
            user_id: p.user_id,
            is_online: p.online,
            last_seen: p.last_seen,
        }
    }
}

// -- Health --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}
