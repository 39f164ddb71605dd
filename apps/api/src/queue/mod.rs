//! Durable work queue for PDF rendering and export emails.
//!
//! Producers enqueue a `JobPayload`; workers reserve jobs per queue name, run
//! them through a `JobHandler`, and either complete, reschedule with
//! exponential backoff, or bury them once attempts are exhausted.

pub mod redis_queue;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

pub use redis_queue::RedisJobQueue;
pub use worker::spawn_workers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    PdfRender,
    EmailSend,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::PdfRender => "pdf-render",
            QueueName::EmailSend => "email-send",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub export_id: Uuid,
    pub snapshot_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailReason {
    #[serde(rename = "free-tier-export")]
    FreeTierExport,
    #[serde(rename = "bulk-apply")]
    BulkApply,
}

impl EmailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailReason::FreeTierExport => "free-tier-export",
            EmailReason::BulkApply => "bulk-apply",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free-tier-export" => Some(EmailReason::FreeTierExport),
            "bulk-apply" => Some(EmailReason::BulkApply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJob {
    pub export_id: Uuid,
    pub user_id: Uuid,
    pub to: String,
    pub reason: EmailReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Render(RenderJob),
    Email(EmailJob),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Render(_) => QueueName::PdfRender,
            JobPayload::Email(_) => QueueName::EmailSend,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff_ms: u64,
}

/// A job as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: JobPayload,
    /// Attempts already run before the current reservation.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Exact serialized form as reserved; used to remove it from the active list.
    #[serde(skip)]
    pub raw: Option<String>,
}

impl QueuedJob {
    pub fn new(payload: JobPayload, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff_ms: options.backoff_ms,
            enqueued_at: Utc::now(),
            last_error: None,
            raw: None,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid, AppError>;

    /// Moves the next ready job of `queue` to the active set.
    async fn reserve(&self, queue: QueueName) -> Result<Option<QueuedJob>, AppError>;

    async fn complete(&self, job: &QueuedJob) -> Result<(), AppError>;

    /// Reschedules `job` (already carrying its incremented attempt count).
    async fn retry_later(&self, job: &QueuedJob, delay: Duration) -> Result<(), AppError>;

    /// Moves `job` to the failed history.
    async fn bury(&self, job: &QueuedJob) -> Result<(), AppError>;
}

/// Consumer side of the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JobPayload) -> Result<(), AppError>;

    /// Called once when a job will not be attempted again.
    async fn on_exhausted(&self, payload: &JobPayload, error: &str);
}
