use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Free,
    Pro,
    Team,
}

impl PlanTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "FREE" => Some(PlanTier::Free),
            "PRO" => Some(PlanTier::Pro),
            "TEAM" => Some(PlanTier::Team),
            _ => None,
        }
    }

    /// Paid tiers get signed download links; free exports are mailed.
    pub fn allows_direct_download(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub tier: PlanTier,
}

/// A user as seen by the export and billing flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: Uuid,
    pub email: String,
    pub plan: Option<Plan>,
}

/// Per-plan ceilings. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PlanUsageLimits {
    pub max_resumes: Option<i64>,
    pub max_exports: Option<i64>,
    pub daily_upload_mb: Option<i64>,
    pub daily_exports: Option<i64>,
    pub daily_export_emails: Option<i64>,
    pub daily_bulk_applies: Option<i64>,
}
