//! Persistence for export jobs and resume snapshots.
//!
//! The transition methods are the only writers of `export_jobs.status`, so the
//! READY/FAILED column invariants hold by construction (and by the table's
//! CHECK constraint).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::export::{ExportJobRow, ResumeSnapshotRow};

#[async_trait]
pub trait ExportStore: Send + Sync {
    /// Copies the resume's current content into a new snapshot in one statement.
    /// NotFound if the resume does not exist or belongs to someone else.
    async fn create_snapshot(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
    ) -> Result<ResumeSnapshotRow, AppError>;

    async fn find_snapshot(&self, id: Uuid) -> Result<Option<ResumeSnapshotRow>, AppError>;

    async fn create_export(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<ExportJobRow, AppError>;

    async fn find_export(&self, id: Uuid) -> Result<Option<ExportJobRow>, AppError>;

    /// PENDING or FAILED → READY. Returns None if the export is already READY or gone.
    async fn mark_ready(
        &self,
        id: Uuid,
        storage_key: &str,
        size_bytes: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ExportJobRow>, AppError>;

    /// PENDING or FAILED → FAILED. READY exports are left untouched (returns None).
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<ExportJobRow>, AppError>;

    /// Exports counting against `max_exports`: everything not FAILED.
    async fn count_active_exports(&self, user_id: Uuid) -> Result<i64, AppError>;

    async fn count_created_between(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    /// Sum of `size_bytes` over exports that became READY in `[start, end)`.
    async fn ready_bytes_between(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJobRow>, AppError>;

    async fn delete_export(&self, id: Uuid) -> Result<bool, AppError>;
}

pub struct PgExportStore {
    pool: PgPool,
}

impl PgExportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExportStore for PgExportStore {
    async fn create_snapshot(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
    ) -> Result<ResumeSnapshotRow, AppError> {
        sqlx::query_as::<_, ResumeSnapshotRow>(
            r#"
            INSERT INTO resume_snapshots (id, resume_id, user_id, content)
            SELECT $1, r.id, r.user_id, r.content
            FROM resumes r
            WHERE r.id = $2 AND r.user_id = $3
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(resume_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resume {resume_id} not found")))
    }

    async fn find_snapshot(&self, id: Uuid) -> Result<Option<ResumeSnapshotRow>, AppError> {
        Ok(
            sqlx::query_as::<_, ResumeSnapshotRow>("SELECT * FROM resume_snapshots WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn create_export(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<ExportJobRow, AppError> {
        Ok(sqlx::query_as::<_, ExportJobRow>(
            r#"
            INSERT INTO export_jobs (id, user_id, resume_id, snapshot_id, status)
            VALUES ($1, $2, $3, $4, 'PENDING')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(resume_id)
        .bind(snapshot_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn find_export(&self, id: Uuid) -> Result<Option<ExportJobRow>, AppError> {
        Ok(
            sqlx::query_as::<_, ExportJobRow>("SELECT * FROM export_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn mark_ready(
        &self,
        id: Uuid,
        storage_key: &str,
        size_bytes: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ExportJobRow>, AppError> {
        Ok(sqlx::query_as::<_, ExportJobRow>(
            r#"
            UPDATE export_jobs
            SET status = 'READY', storage_key = $2, size_bytes = $3, expires_at = $4,
                error = NULL, updated_at = NOW()
            WHERE id = $1 AND status <> 'READY'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(storage_key)
        .bind(size_bytes)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<ExportJobRow>, AppError> {
        Ok(sqlx::query_as::<_, ExportJobRow>(
            r#"
            UPDATE export_jobs
            SET status = 'FAILED', error = $2, storage_key = NULL, size_bytes = NULL,
                expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status <> 'READY'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn count_active_exports(&self, user_id: Uuid) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM export_jobs WHERE user_id = $1 AND status <> 'FAILED'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn count_created_between(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM export_jobs
            WHERE user_id = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn ready_bytes_between(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        // READY rows are immutable, so updated_at is the moment they became READY.
        Ok(sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(size_bytes), 0)::BIGINT FROM export_jobs
            WHERE user_id = $1 AND status = 'READY'
              AND updated_at >= $2 AND updated_at < $3
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExportJobRow>, AppError> {
        Ok(sqlx::query_as::<_, ExportJobRow>(
            r#"
            SELECT * FROM export_jobs
            WHERE expires_at IS NOT NULL AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_export(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM export_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
