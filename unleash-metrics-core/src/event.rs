//! Domain events emitted to the event store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ApplicationRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ApplicationCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ApplicationCreated => "application-created",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub created_by: String,
    pub data: ApplicationRecord,
}

impl CreateEvent {
    /// Announce a newly seen application, attributed to whoever registered it.
    pub fn application_created(app: ApplicationRecord) -> Self {
        Self {
            event_type: EventType::ApplicationCreated,
            created_by: app.created_by.clone().unwrap_or_else(|| "unknown".into()),
            data: app,
        }
    }
}

/// An event as held by the event store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CreateEvent,
}

impl StoredEvent {
    pub fn new(event: CreateEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            event,
        }
    }
}
