//! Export orchestrator: quota checks and snapshots on request, render and
//! upload on the queue, then either a signed link or an email.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::email::{build_export_email, failure_metadata, looks_like_email, parse_email_job};
use super::store::ExportStore;
use crate::audit::{actions, emit, SystemLog};
use crate::config::ExportConfig;
use crate::errors::{failure_message, AppError};
use crate::mailer::Mailer;
use crate::models::audit::LogEntry;
use crate::models::export::{Delivery, ExportJobRow, ExportStatus};
use crate::models::user::{Account, Plan, PlanUsageLimits};
use crate::plans::PlanDirectory;
use crate::queue::{EmailJob, EmailReason, JobHandler, JobPayload, JobQueue, RenderJob};
use crate::quota::{daily_upload_bytes, day_bounds, has_reached, would_exceed, QuotaLedger};
use crate::rate_limit::{RateLimiter, EMAIL_RETRY};
use crate::render::{render_resume_html, PdfRenderer};
use crate::storage::{ObjectStorage, StorageError, UploadOptions};

const SWEEP_BATCH: i64 = 100;

/// Collaborators of the export pipeline.
#[derive(Clone)]
pub struct ExportDeps {
    pub store: Arc<dyn ExportStore>,
    pub plans: Arc<dyn PlanDirectory>,
    pub queue: Arc<dyn JobQueue>,
    pub storage: Arc<dyn ObjectStorage>,
    pub renderer: Arc<dyn PdfRenderer>,
    pub mailer: Arc<dyn Mailer>,
    pub log: Arc<dyn SystemLog>,
    pub limiter: RateLimiter,
}

#[derive(Clone)]
pub struct ExportService {
    store: Arc<dyn ExportStore>,
    plans: Arc<dyn PlanDirectory>,
    quota: QuotaLedger,
    queue: Arc<dyn JobQueue>,
    storage: Arc<dyn ObjectStorage>,
    renderer: Arc<dyn PdfRenderer>,
    mailer: Arc<dyn Mailer>,
    log: Arc<dyn SystemLog>,
    limiter: RateLimiter,
    settings: ExportConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportTicket {
    pub export_id: Uuid,
    pub status: ExportStatus,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportStatusView {
    pub export_id: Uuid,
    pub status: ExportStatus,
    pub delivery: Delivery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub size_bytes: Option<i64>,
    pub error: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEmail {
    pub job_id: Uuid,
    pub export_id: Uuid,
}

/// `{user_id}/{YYYY-MM-DD}/exports/{export_id}.pdf`
pub fn export_storage_key(user_id: Uuid, export_id: Uuid, now: DateTime<Utc>) -> String {
    format!("{user_id}/{}/exports/{export_id}.pdf", now.format("%Y-%m-%d"))
}

impl ExportService {
    pub fn new(deps: ExportDeps, settings: ExportConfig) -> Self {
        Self {
            quota: QuotaLedger::new(deps.plans.clone()),
            store: deps.store,
            plans: deps.plans,
            queue: deps.queue,
            storage: deps.storage,
            renderer: deps.renderer,
            mailer: deps.mailer,
            log: deps.log,
            limiter: deps.limiter,
            settings,
        }
    }

    async fn account(&self, user_id: Uuid) -> Result<Account, AppError> {
        self.plans
            .find_account(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {user_id} not found")))
    }

    async fn plan_and_limits(&self, account: &Account) -> Result<(Plan, PlanUsageLimits), AppError> {
        let plan = account.plan.clone().ok_or_else(|| {
            AppError::Validation(format!("User {} has no plan assigned", account.user_id))
        })?;
        let limits = self.quota.limits_for_plan(plan.id).await?;
        Ok((plan, limits))
    }

    /// Other users' exports are reported as missing.
    async fn owned_export(&self, user_id: Uuid, export_id: Uuid) -> Result<ExportJobRow, AppError> {
        self.store
            .find_export(export_id)
            .await?
            .filter(|export| export.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("Export {export_id} not found")))
    }

    async fn record(&self, action: &str, user_id: Uuid, metadata: serde_json::Value) {
        emit(self.log.as_ref(), LogEntry::new(action, Some(user_id), metadata)).await;
    }

    // ────────────────────────────────────────────
    // Request path
    // ────────────────────────────────────────────

    pub async fn enqueue_export(
        &self,
        user_id: Uuid,
        resume_id: Uuid,
    ) -> Result<ExportTicket, AppError> {
        let account = self.account(user_id).await?;
        let (plan, limits) = self.plan_and_limits(&account).await?;

        let active = self.store.count_active_exports(user_id).await?;
        if has_reached(active, limits.max_exports) {
            return Err(AppError::Forbidden(
                "Export limit reached for your plan".to_string(),
            ));
        }
        let (start, end) = day_bounds(Utc::now());
        let today = self.store.count_created_between(user_id, start, end).await?;
        if has_reached(today, limits.daily_exports) {
            return Err(AppError::Forbidden("Daily export limit reached".to_string()));
        }

        let snapshot = self.store.create_snapshot(user_id, resume_id).await?;
        let export = self
            .store
            .create_export(user_id, resume_id, snapshot.id)
            .await?;
        let delivery = Delivery::for_tier(plan.tier);

        let job = JobPayload::Render(RenderJob {
            export_id: export.id,
            snapshot_id: snapshot.id,
            user_id,
        });
        if let Err(e) = self.queue.enqueue(job).await {
            let message = failure_message(&e);
            error!(export_id = %export.id, error = %message, "Failed to enqueue render job");
            if let Err(mark) = self.store.mark_failed(export.id, &message).await {
                warn!(export_id = %export.id, error = %mark, "Failed to mark export as failed");
            }
            self.record(
                actions::EXPORT_FAILED,
                user_id,
                json!({ "exportId": export.id, "error": message }),
            )
            .await;
            return Err(e);
        }

        info!(%user_id, export_id = %export.id, ?delivery, "Export requested");
        self.record(
            actions::EXPORT_REQUESTED,
            user_id,
            json!({
                "exportId": export.id,
                "resumeId": resume_id,
                "snapshotId": snapshot.id,
                "delivery": delivery,
            }),
        )
        .await;

        Ok(ExportTicket {
            export_id: export.id,
            status: export.status(),
            delivery,
        })
    }

    pub async fn get_status(
        &self,
        user_id: Uuid,
        export_id: Uuid,
    ) -> Result<ExportStatusView, AppError> {
        let export = self.owned_export(user_id, export_id).await?;
        let account = self.account(user_id).await?;
        let delivery = account
            .plan
            .as_ref()
            .map(|plan| Delivery::for_tier(plan.tier))
            .unwrap_or(Delivery::Email);

        let download_url = match (&export.storage_key, delivery) {
            (Some(key), Delivery::Download) if export.is_ready() => Some(
                self.storage
                    .signed_download_url(key, self.settings.download_url_ttl_secs)
                    .await?,
            ),
            _ => None,
        };

        Ok(ExportStatusView {
            export_id: export.id,
            status: export.status(),
            delivery,
            download_url,
            size_bytes: export.size_bytes,
            error: export.error,
            expires_at: export.expires_at,
            created_at: export.created_at,
        })
    }

    pub async fn retry_failed_email(
        &self,
        user_id: Uuid,
        failed_log_id: Uuid,
    ) -> Result<QueuedEmail, AppError> {
        self.limiter.enforce(EMAIL_RETRY, user_id).await?;

        let row = self
            .log
            .find(failed_log_id)
            .await?
            .filter(|row| {
                matches!(row.action.as_str(), actions::EMAIL_FAILED | actions::EMAIL_DEFERRED)
                    && row.user_id == Some(user_id)
            })
            .ok_or_else(|| {
                AppError::NotFound(format!("Failed email job {failed_log_id} not found"))
            })?;

        let job = parse_email_job(&row.metadata)
            .map_err(|e| AppError::Validation(format!("Cannot retry email: {e}")))?;
        if job.user_id != user_id {
            return Err(AppError::NotFound(format!(
                "Failed email job {failed_log_id} not found"
            )));
        }

        let export = self.owned_export(user_id, job.export_id).await?;
        if !export.is_ready() {
            return Err(AppError::Conflict(format!(
                "Export {} is not ready",
                export.id
            )));
        }

        let export_id = job.export_id;
        let job_id = self.queue.enqueue(JobPayload::Email(job)).await?;
        info!(%user_id, %export_id, %job_id, "Export email re-queued");
        self.record(
            actions::EMAIL_RETRIED,
            user_id,
            json!({ "logId": failed_log_id, "exportId": export_id, "jobId": job_id }),
        )
        .await;

        Ok(QueuedEmail { job_id, export_id })
    }

    /// Sends a READY export to a third-party recipient.
    pub async fn enqueue_bulk_apply(
        &self,
        user_id: Uuid,
        export_id: Uuid,
        recipient: &str,
    ) -> Result<QueuedEmail, AppError> {
        let recipient = recipient.trim();
        if !looks_like_email(recipient) {
            return Err(AppError::Validation(format!(
                "'{recipient}' is not a valid email address"
            )));
        }

        let account = self.account(user_id).await?;
        let (_, limits) = self.plan_and_limits(&account).await?;
        let export = self.owned_export(user_id, export_id).await?;
        if !export.is_ready() {
            return Err(AppError::Conflict(format!("Export {export_id} is not ready")));
        }

        let (start, end) = day_bounds(Utc::now());
        let used = self
            .log
            .count_between(actions::BULK_APPLY_QUEUED, Some(user_id), start, end)
            .await?;
        if has_reached(used, limits.daily_bulk_applies) {
            return Err(AppError::Forbidden(
                "Daily bulk apply limit reached".to_string(),
            ));
        }

        let job = EmailJob {
            export_id,
            user_id,
            to: account.email,
            reason: EmailReason::BulkApply,
            recipient: Some(recipient.to_string()),
        };
        let job_id = self.queue.enqueue(JobPayload::Email(job)).await?;
        self.record(
            actions::BULK_APPLY_QUEUED,
            user_id,
            json!({ "exportId": export_id, "jobId": job_id, "recipient": recipient }),
        )
        .await;

        Ok(QueuedEmail { job_id, export_id })
    }

    // ────────────────────────────────────────────
    // Queue consumers
    // ────────────────────────────────────────────

    pub async fn process_render(&self, job: &RenderJob) -> Result<(), AppError> {
        let export = self
            .store
            .find_export(job.export_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Export {} not found", job.export_id)))?;
        if export.is_ready() {
            info!(export_id = %export.id, "Export already READY, skipping duplicate render");
            return Ok(());
        }

        match self.render_and_store(job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = failure_message(&e);
                warn!(export_id = %job.export_id, error = %message, "Export render failed");
                if let Err(mark) = self.store.mark_failed(job.export_id, &message).await {
                    error!(export_id = %job.export_id, error = %mark, "Failed to mark export as failed");
                }
                self.record(
                    actions::EXPORT_FAILED,
                    job.user_id,
                    json!({ "exportId": job.export_id, "error": message }),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn render_and_store(&self, job: &RenderJob) -> Result<(), AppError> {
        let snapshot = self
            .store
            .find_snapshot(job.snapshot_id)
            .await?
            .filter(|snapshot| snapshot.user_id == job.user_id)
            .ok_or_else(|| AppError::NotFound(format!("Snapshot {} not found", job.snapshot_id)))?;
        let account = self.account(job.user_id).await?;
        let (plan, limits) = self.plan_and_limits(&account).await?;

        let html = render_resume_html(&snapshot.content);
        let pdf = match self.renderer.render_pdf(&html).await {
            Ok(pdf) => {
                self.record(
                    actions::PDF_RENDER_SUCCEEDED,
                    job.user_id,
                    json!({ "exportId": job.export_id, "sizeBytes": pdf.len() }),
                )
                .await;
                pdf
            }
            Err(e) => {
                self.record(
                    actions::PDF_RENDER_FAILED,
                    job.user_id,
                    json!({ "exportId": job.export_id, "error": failure_message(&e) }),
                )
                .await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let size_bytes = pdf.len() as i64;
        let (start, end) = day_bounds(now);
        let uploaded_today = self
            .store
            .ready_bytes_between(job.user_id, start, end)
            .await?;
        if would_exceed(uploaded_today, size_bytes, daily_upload_bytes(&limits)) {
            return Err(AppError::Forbidden("Daily upload quota exceeded".to_string()));
        }

        let key = export_storage_key(job.user_id, job.export_id, now);
        self.storage
            .upload_buffer(
                pdf,
                &key,
                UploadOptions {
                    content_type: "application/pdf".to_string(),
                    content_disposition: Some(format!(
                        "attachment; filename=\"resume-{}.pdf\"",
                        job.export_id
                    )),
                },
            )
            .await?;

        let ttl_hours = if plan.tier.allows_direct_download() {
            self.settings.paid_ttl_hours
        } else {
            self.settings.free_ttl_hours
        };
        let expires_at = now + Duration::hours(ttl_hours);
        let marked = match self
            .store
            .mark_ready(job.export_id, &key, size_bytes, expires_at)
            .await
        {
            Ok(marked) => marked,
            Err(e) => {
                // The row will not point at the object, so nothing would ever sweep it.
                if let Err(delete) = self.storage.delete_object(&key).await {
                    warn!(export_id = %job.export_id, key = %key, error = %delete, "Failed to remove orphaned export object");
                }
                return Err(e);
            }
        };
        let Some(ready) = marked else {
            info!(export_id = %job.export_id, "Export became READY concurrently");
            return Ok(());
        };

        debug_assert!(ready.is_consistent());
        info!(export_id = %ready.id, size_bytes, %expires_at, "Export READY");
        self.record(
            actions::EXPORT_READY,
            job.user_id,
            json!({ "exportId": ready.id, "storageKey": key, "sizeBytes": size_bytes }),
        )
        .await;

        if Delivery::for_tier(plan.tier) == Delivery::Email {
            let email = EmailJob {
                export_id: ready.id,
                user_id: job.user_id,
                to: account.email,
                reason: EmailReason::FreeTierExport,
                recipient: None,
            };
            if let Err(e) = self.queue_free_tier_email(&email, &limits).await {
                let message = failure_message(&e);
                warn!(export_id = %ready.id, error = %message, "Export email not queued");
                self.record_email_failure(actions::EMAIL_DEFERRED, &email, &message)
                    .await;
            }
        }
        Ok(())
    }

    async fn queue_free_tier_email(
        &self,
        job: &EmailJob,
        limits: &PlanUsageLimits,
    ) -> Result<(), AppError> {
        let (start, end) = day_bounds(Utc::now());
        let sent = self
            .log
            .count_between(actions::EMAIL_SENT, Some(job.user_id), start, end)
            .await?;
        if has_reached(sent, limits.daily_export_emails) {
            return Err(AppError::Forbidden("Daily email quota exceeded".to_string()));
        }
        self.queue.enqueue(JobPayload::Email(job.clone())).await?;
        Ok(())
    }

    async fn record_email_failure(&self, action: &str, job: &EmailJob, error: &str) {
        self.record(action, job.user_id, failure_metadata(job, error))
            .await;
    }

    pub async fn process_email(&self, job: &EmailJob) -> Result<(), AppError> {
        match self.deliver_email(job).await {
            Ok(()) => {
                info!(export_id = %job.export_id, reason = job.reason.as_str(), "Export email sent");
                self.record(
                    actions::EMAIL_SENT,
                    job.user_id,
                    json!({ "exportId": job.export_id, "reason": job.reason.as_str() }),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let message = failure_message(&e);
                warn!(export_id = %job.export_id, error = %message, "Export email failed");
                self.record_email_failure(actions::EMAIL_FAILED, job, &message)
                    .await;
                Err(e)
            }
        }
    }

    async fn deliver_email(&self, job: &EmailJob) -> Result<(), AppError> {
        let export = self.owned_export(job.user_id, job.export_id).await?;
        let key = match (&export.storage_key, export.is_ready()) {
            (Some(key), true) => key.clone(),
            _ => {
                return Err(AppError::Conflict(format!(
                    "Export {} is not ready",
                    export.id
                )))
            }
        };
        let pdf = self.storage.read_object(&key).await?;
        self.mailer.send(&build_export_email(job, pdf)).await
    }

    // ────────────────────────────────────────────
    // Maintenance
    // ────────────────────────────────────────────

    /// Deletes stored objects and rows of expired exports. Returns how many went.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let expired = self.store.list_expired(now, SWEEP_BATCH).await?;
        let mut removed = 0;
        for export in expired {
            if let Some(key) = &export.storage_key {
                match self.storage.delete_object(key).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(export_id = %export.id, error = %e, "Failed to delete expired object");
                        continue;
                    }
                }
            }
            if self.store.delete_export(export.id).await? {
                removed += 1;
                self.record(
                    actions::EXPORT_EXPIRED,
                    export.user_id,
                    json!({ "exportId": export.id, "storageKey": export.storage_key }),
                )
                .await;
            }
        }
        if removed > 0 {
            info!(removed, "Expired exports swept");
        }
        Ok(removed)
    }
}

#[async_trait]
impl JobHandler for ExportService {
    async fn handle(&self, payload: &JobPayload) -> Result<(), AppError> {
        match payload {
            JobPayload::Render(job) => self.process_render(job).await,
            JobPayload::Email(job) => self.process_email(job).await,
        }
    }

    async fn on_exhausted(&self, payload: &JobPayload, error: &str) {
        let (export_id, user_id) = match payload {
            JobPayload::Render(job) => {
                if let Err(e) = self.store.mark_failed(job.export_id, error).await {
                    error!(export_id = %job.export_id, error = %e, "Failed to mark exhausted export");
                }
                (job.export_id, job.user_id)
            }
            JobPayload::Email(job) => (job.export_id, job.user_id),
        };
        self.record(
            actions::EXPORT_EXHAUSTED,
            user_id,
            json!({
                "exportId": export_id,
                "queue": payload.queue().as_str(),
                "error": error,
            }),
        )
        .await;
    }
}

/// Periodically removes expired exports.
pub fn spawn_expiry_sweep(service: Arc<ExportService>, interval: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_expired(Utc::now()).await {
                warn!(error = %e, "Expired export sweep failed");
            }
        }
    })
}
