//! Idempotency ledger for billing webhooks.
//!
//! One row per (provider, external event id). Lifecycle:
//! ∅ → PROCESSING → PROCESSED | FAILED, and FAILED → PROCESSING on replay.
//! Every transition is a single conditional statement, so concurrent
//! deliveries and replays race on the database, never in memory.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::billing::{
    AppliedAction, BillingWebhookEventRow, Provider, WebhookEventType, WebhookStatus,
};

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider: Provider,
    pub external_event_id: String,
    pub event_type: WebhookEventType,
    pub signature: String,
    pub payload: Value,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct BeginOutcome {
    pub event: BillingWebhookEventRow,
    pub is_replay: bool,
    pub can_process: bool,
}

#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Inserts a PROCESSING row unless one exists for the same key.
    async fn insert_if_absent(
        &self,
        event: &NewWebhookEvent,
    ) -> Result<Option<BillingWebhookEventRow>, AppError>;

    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<Option<BillingWebhookEventRow>, AppError>;

    async fn find(&self, id: Uuid) -> Result<Option<BillingWebhookEventRow>, AppError>;

    /// FAILED → PROCESSING, bumping `replay_count`. None if the row was not FAILED.
    async fn reclaim_failed(&self, id: Uuid) -> Result<Option<BillingWebhookEventRow>, AppError>;

    /// PROCESSING → PROCESSED. None (no-op) from any other state.
    async fn mark_processed(
        &self,
        id: Uuid,
        applied: AppliedAction,
    ) -> Result<Option<BillingWebhookEventRow>, AppError>;

    /// PROCESSING → FAILED. None (no-op) from any other state.
    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<Option<BillingWebhookEventRow>, AppError>;

    /// Claims the event for processing, or returns the row that already holds it.
    async fn begin(&self, event: &NewWebhookEvent) -> Result<BeginOutcome, AppError> {
        if let Some(row) = self.insert_if_absent(event).await? {
            return Ok(BeginOutcome {
                event: row,
                is_replay: false,
                can_process: true,
            });
        }

        let existing = self
            .find_by_external_id(event.provider, &event.external_event_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "webhook event {}:{} vanished after conflict",
                    event.provider.as_str(),
                    event.external_event_id
                ))
            })?;
        Ok(BeginOutcome {
            event: existing,
            is_replay: true,
            can_process: false,
        })
    }
}

pub struct PgWebhookLedger {
    pool: PgPool,
}

impl PgWebhookLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLedger for PgWebhookLedger {
    async fn insert_if_absent(
        &self,
        event: &NewWebhookEvent,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(sqlx::query_as::<_, BillingWebhookEventRow>(
            r#"
            INSERT INTO billing_webhook_events
                (id, provider, external_event_id, event_type, signature, payload, user_id,
                 status, applied_action)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (provider, external_event_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.provider.as_str())
        .bind(&event.external_event_id)
        .bind(event.event_type.as_str())
        .bind(&event.signature)
        .bind(&event.payload)
        .bind(event.user_id)
        .bind(WebhookStatus::Processing.as_str())
        .bind(AppliedAction::None.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(sqlx::query_as::<_, BillingWebhookEventRow>(
            "SELECT * FROM billing_webhook_events WHERE provider = $1 AND external_event_id = $2",
        )
        .bind(provider.as_str())
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find(&self, id: Uuid) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(sqlx::query_as::<_, BillingWebhookEventRow>(
            "SELECT * FROM billing_webhook_events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn reclaim_failed(&self, id: Uuid) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(sqlx::query_as::<_, BillingWebhookEventRow>(
            r#"
            UPDATE billing_webhook_events
            SET status = 'PROCESSING', error = NULL, replay_count = replay_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'FAILED'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        applied: AppliedAction,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(sqlx::query_as::<_, BillingWebhookEventRow>(
            r#"
            UPDATE billing_webhook_events
            SET status = 'PROCESSED', applied_action = $2, error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(applied.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<Option<BillingWebhookEventRow>, AppError> {
        Ok(sqlx::query_as::<_, BillingWebhookEventRow>(
            r#"
            UPDATE billing_webhook_events
            SET status = 'FAILED', error = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?)
    }
}
