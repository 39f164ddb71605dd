use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::user::PlanTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Pending,
    Ready,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "PENDING",
            ExportStatus::Ready => "READY",
            ExportStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ExportStatus::Pending),
            "READY" => Some(ExportStatus::Ready),
            "FAILED" => Some(ExportStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExportJobRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resume_id: Uuid,
    pub snapshot_id: Uuid,
    pub status: String,
    pub storage_key: Option<String>,
    pub size_bytes: Option<i64>,
    pub error: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportJobRow {
    /// Unknown status strings are treated as pending; the column has a CHECK constraint.
    pub fn status(&self) -> ExportStatus {
        ExportStatus::parse(&self.status).unwrap_or(ExportStatus::Pending)
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ExportStatus::Ready
    }

    /// storage_key and size_bytes are present iff READY, error iff FAILED.
    pub fn is_consistent(&self) -> bool {
        let status = self.status();
        let ready = status == ExportStatus::Ready;
        let failed = status == ExportStatus::Failed;
        self.storage_key.is_some() == ready
            && self.size_bytes.is_some() == ready
            && self.error.is_some() == failed
    }
}

/// Immutable copy of a resume's content at export time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResumeSnapshotRow {
    pub id: Uuid,
    pub resume_id: Uuid,
    pub user_id: Uuid,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// How a finished export reaches the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Download,
    Email,
}

impl Delivery {
    pub fn for_tier(tier: PlanTier) -> Self {
        if tier.allows_direct_download() {
            Delivery::Download
        } else {
            Delivery::Email
        }
    }
}
