//! Append-only system log. Every state change writes one row here; the
//! alerting evaluator and the email-retry flow read it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::audit::{LogEntry, SystemLogRow};

pub mod actions {
    pub const EXPORT_REQUESTED: &str = "export.requested";
    pub const EXPORT_READY: &str = "export.ready";
    pub const EXPORT_FAILED: &str = "export.failed";
    pub const EXPORT_EXHAUSTED: &str = "export.job.exhausted";
    pub const EXPORT_EXPIRED: &str = "export.expired";
    pub const PDF_RENDER_SUCCEEDED: &str = "pdf.render.succeeded";
    pub const PDF_RENDER_FAILED: &str = "pdf.render.failed";
    pub const EMAIL_SENT: &str = "export.email.sent";
    pub const EMAIL_FAILED: &str = "export.email.failed";
    /// Email never handed to the mailer (quota reached, enqueue failed).
    pub const EMAIL_DEFERRED: &str = "export.email.deferred";
    pub const EMAIL_RETRIED: &str = "export.email.retried";
    pub const BULK_APPLY_QUEUED: &str = "export.bulk_apply.queued";
    pub const WEBHOOK_PROCESSED: &str = "billing.webhook.processed";
    pub const WEBHOOK_FAILED: &str = "billing.webhook.failed";
    pub const WEBHOOK_REPLAYED: &str = "billing.webhook.replayed";
}

#[async_trait]
pub trait SystemLog: Send + Sync {
    async fn record(&self, entry: LogEntry) -> Result<SystemLogRow, AppError>;

    async fn find(&self, id: Uuid) -> Result<Option<SystemLogRow>, AppError>;

    /// Counts rows for `action` in `[start, end)`, optionally for one user.
    async fn count_between(
        &self,
        action: &str,
        user_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    async fn latest(&self, action: &str) -> Result<Option<SystemLogRow>, AppError>;
}

/// Records an entry without letting a log failure abort the caller.
pub async fn emit(log: &dyn SystemLog, entry: LogEntry) {
    let action = entry.action.clone();
    if let Err(e) = log.record(entry).await {
        warn!(action = %action, error = %e, "Failed to write system log entry");
    }
}

pub struct PgSystemLog {
    pool: PgPool,
}

impl PgSystemLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SystemLog for PgSystemLog {
    async fn record(&self, entry: LogEntry) -> Result<SystemLogRow, AppError> {
        Ok(sqlx::query_as::<_, SystemLogRow>(
            r#"
            INSERT INTO system_logs (id, action, user_id, metadata)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.action)
        .bind(entry.user_id)
        .bind(&entry.metadata)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn find(&self, id: Uuid) -> Result<Option<SystemLogRow>, AppError> {
        Ok(
            sqlx::query_as::<_, SystemLogRow>("SELECT * FROM system_logs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn count_between(
        &self,
        action: &str,
        user_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM system_logs
            WHERE action = $1
              AND ($2::uuid IS NULL OR user_id = $2)
              AND created_at >= $3 AND created_at < $4
            "#,
        )
        .bind(action)
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn latest(&self, action: &str) -> Result<Option<SystemLogRow>, AppError> {
        Ok(sqlx::query_as::<_, SystemLogRow>(
            "SELECT * FROM system_logs WHERE action = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(action)
        .fetch_optional(&self.pool)
        .await?)
    }
}
