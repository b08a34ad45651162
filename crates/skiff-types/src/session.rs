use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Caller-scoped conversation context keyed by an opaque identifier.
/// Lives in memory only; reaped by an explicit age-based cleanup call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub directory: String,
    pub time: SessionTime,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Session {
    pub fn new(id: impl Into<String>, directory: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            directory: directory.into(),
            time: SessionTime {
                created: now,
                updated: now,
            },
            messages: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.time.updated = Utc::now();
    }
}
