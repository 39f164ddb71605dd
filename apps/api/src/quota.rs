//! Quota ledger. Holds no counters of its own: usage is always derived from
//! persisted rows by the caller and compared against the plan's ceilings here.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::user::PlanUsageLimits;
use crate::plans::PlanDirectory;

const BYTES_PER_MB: i64 = 1024 * 1024;

#[derive(Clone)]
pub struct QuotaLedger {
    plans: Arc<dyn PlanDirectory>,
}

impl QuotaLedger {
    pub fn new(plans: Arc<dyn PlanDirectory>) -> Self {
        Self { plans }
    }

    pub async fn limits_for_plan(&self, plan_id: Uuid) -> Result<PlanUsageLimits, AppError> {
        self.plans
            .limits_for_plan(plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Plan {plan_id} not found")))
    }
}

/// True once `used` has hit the ceiling. No ceiling means unlimited.
pub fn has_reached(used: i64, max: Option<i64>) -> bool {
    match max {
        Some(max) => used >= max,
        None => false,
    }
}

/// True if adding `additional` to `used` would go past the ceiling.
pub fn would_exceed(used: i64, additional: i64, max: Option<i64>) -> bool {
    match max {
        Some(max) => used.saturating_add(additional) > max,
        None => false,
    }
}

pub fn daily_upload_bytes(limits: &PlanUsageLimits) -> Option<i64> {
    limits
        .daily_upload_mb
        .map(|mb| mb.saturating_mul(BYTES_PER_MB))
}

/// `[start, end)` of the UTC day containing `now`.
pub fn day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}
