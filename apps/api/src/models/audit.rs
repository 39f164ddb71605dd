use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemLogRow {
    pub id: Uuid,
    pub action: String,
    pub user_id: Option<Uuid>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A structured entry waiting to be appended to the system log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub action: String,
    pub user_id: Option<Uuid>,
    pub metadata: Value,
}

impl LogEntry {
    pub fn new(action: impl Into<String>, user_id: Option<Uuid>, metadata: Value) -> Self {
        Self {
            action: action.into(),
            user_id,
            metadata,
        }
    }
}
