//! Accounts and plans, owned by plan administration. This service only reads
//! limits and applies plan changes requested by billing events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::user::{Account, Plan, PlanTier, PlanUsageLimits};

#[async_trait]
pub trait PlanDirectory: Send + Sync {
    async fn find_account(&self, user_id: Uuid) -> Result<Option<Account>, AppError>;

    async fn limits_for_plan(&self, plan_id: Uuid) -> Result<Option<PlanUsageLimits>, AppError>;

    async fn resolve_plan_code(&self, code: &str) -> Result<Option<Uuid>, AppError>;

    async fn change_plan_now(&self, user_id: Uuid, plan_id: Uuid) -> Result<(), AppError>;

    async fn schedule_plan_change(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        effective_at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

pub struct PgPlanDirectory {
    pool: PgPool,
}

impl PgPlanDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    plan_id: Option<Uuid>,
    plan_code: Option<String>,
    plan_tier: Option<String>,
}

#[async_trait]
impl PlanDirectory for PgPlanDirectory {
    async fn find_account(&self, user_id: Uuid) -> Result<Option<Account>, AppError> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT u.id, u.email, p.id AS plan_id, p.code AS plan_code, p.tier AS plan_tier
            FROM users u
            LEFT JOIN plans p ON p.id = u.plan_id
            WHERE u.id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let plan = match (row.plan_id, row.plan_code, row.plan_tier) {
            (Some(id), Some(code), Some(tier)) => {
                let tier = PlanTier::parse(&tier).ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!("plan {id} has unknown tier '{tier}'"))
                })?;
                Some(Plan { id, code, tier })
            }
            _ => None,
        };

        Ok(Some(Account {
            user_id: row.id,
            email: row.email,
            plan,
        }))
    }

    async fn limits_for_plan(&self, plan_id: Uuid) -> Result<Option<PlanUsageLimits>, AppError> {
        Ok(sqlx::query_as::<_, PlanUsageLimits>(
            r#"
            SELECT max_resumes, max_exports, daily_upload_mb, daily_exports,
                   daily_export_emails, daily_bulk_applies
            FROM plans WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn resolve_plan_code(&self, code: &str) -> Result<Option<Uuid>, AppError> {
        Ok(
            sqlx::query_scalar("SELECT id FROM plans WHERE UPPER(code) = UPPER($1)")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn change_plan_now(&self, user_id: Uuid, plan_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE users SET plan_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(plan_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {user_id} not found")));
        }
        info!(%user_id, %plan_id, "Plan changed");
        Ok(())
    }

    async fn schedule_plan_change(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        effective_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_plan_changes (id, user_id, plan_id, effective_at)
            SELECT $1, u.id, $3, $4 FROM users u WHERE u.id = $2
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan_id)
        .bind(effective_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {user_id} not found")));
        }
        info!(%user_id, %plan_id, %effective_at, "Plan change scheduled");
        Ok(())
    }
}
