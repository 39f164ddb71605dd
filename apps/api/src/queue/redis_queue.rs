use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobOptions, JobPayload, JobQueue, QueueName, QueuedJob};
use crate::config::QueueConfig;
use crate::errors::AppError;

/// Redis-backed queue. Per queue name:
/// `wait` (list, LPUSH/RPOPLPUSH), `active` (list), `delayed` (sorted set
/// scored by ready time in ms), `completed` / `failed` (capped history lists).
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    prefix: String,
    options: JobOptions,
    keep_completed: usize,
    keep_failed: usize,
}

const PROMOTE_BATCH: isize = 50;

impl RedisJobQueue {
    pub async fn connect(client: &redis::Client, config: &QueueConfig) -> RedisResult<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: config.prefix.clone(),
            options: JobOptions {
                attempts: config.attempts,
                backoff_ms: config.backoff_ms,
            },
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
        })
    }

    fn key(&self, queue: QueueName, part: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue.as_str(), part)
    }

    /// Puts jobs left in `active` by a crashed process back on `wait`.
    /// Assumes no other worker process is running against the same prefix.
    pub async fn recover_stalled(&self, queue: QueueName) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let active = self.key(queue, "active");
        let wait = self.key(queue, "wait");
        let mut moved = 0;
        loop {
            let item: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&active)
                .arg(&wait)
                .query_async(&mut conn)
                .await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(queue = queue.as_str(), moved, "Recovered stalled jobs");
        }
        Ok(moved)
    }

    /// Moves delayed jobs whose time has come onto `wait`. ZREM decides the
    /// single winner when several workers race for the same entry.
    async fn promote_due(&self, queue: QueueName) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let delayed = self.key(queue, "delayed");
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&delayed)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                redis::cmd("LPUSH")
                    .arg(self.key(queue, "wait"))
                    .arg(&member)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    fn raw_of(job: &QueuedJob) -> Result<String, AppError> {
        match &job.raw {
            Some(raw) => Ok(raw.clone()),
            None => Ok(serde_json::to_string(job).map_err(anyhow::Error::from)?),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid, AppError> {
        let queue = payload.queue();
        let job = QueuedJob::new(payload, self.options);
        let body = serde_json::to_string(&job).map_err(anyhow::Error::from)?;

        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(self.key(queue, "wait"))
            .arg(body)
            .query_async::<_, ()>(&mut conn)
            .await?;

        info!(queue = queue.as_str(), job_id = %job.id, "Job enqueued");
        Ok(job.id)
    }

    async fn reserve(&self, queue: QueueName) -> Result<Option<QueuedJob>, AppError> {
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(self.key(queue, "wait"))
            .arg(self.key(queue, "active"))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedJob>(&raw) {
            Ok(mut job) => {
                job.raw = Some(raw);
                Ok(Some(job))
            }
            Err(e) => {
                warn!(queue = queue.as_str(), error = %e, "Discarding malformed job");
                redis::pipe()
                    .atomic()
                    .cmd("LREM")
                    .arg(self.key(queue, "active"))
                    .arg(1)
                    .arg(&raw)
                    .ignore()
                    .cmd("LPUSH")
                    .arg(self.key(queue, "failed"))
                    .arg(&raw)
                    .ignore()
                    .cmd("LTRIM")
                    .arg(self.key(queue, "failed"))
                    .arg(0)
                    .arg(self.keep_failed as isize - 1)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), AppError> {
        let queue = job.payload.queue();
        let record = json!({
            "id": job.id,
            "attempts": job.attempts_made + 1,
            "completed_at": Utc::now(),
        })
        .to_string();

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.key(queue, "active"))
            .arg(1)
            .arg(Self::raw_of(job)?)
            .ignore()
            .cmd("LPUSH")
            .arg(self.key(queue, "completed"))
            .arg(record)
            .ignore()
            .cmd("LTRIM")
            .arg(self.key(queue, "completed"))
            .arg(0)
            .arg(self.keep_completed as isize - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry_later(&self, job: &QueuedJob, delay: Duration) -> Result<(), AppError> {
        let queue = job.payload.queue();
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let body = serde_json::to_string(job).map_err(anyhow::Error::from)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.key(queue, "active"))
            .arg(1)
            .arg(Self::raw_of(job)?)
            .ignore()
            .cmd("ZADD")
            .arg(self.key(queue, "delayed"))
            .arg(ready_at)
            .arg(body)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn bury(&self, job: &QueuedJob) -> Result<(), AppError> {
        let queue = job.payload.queue();
        let body = serde_json::to_string(job).map_err(anyhow::Error::from)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.key(queue, "active"))
            .arg(1)
            .arg(Self::raw_of(job)?)
            .ignore()
            .cmd("LPUSH")
            .arg(self.key(queue, "failed"))
            .arg(body)
            .ignore()
            .cmd("LTRIM")
            .arg(self.key(queue, "failed"))
            .arg(0)
            .arg(self.keep_failed as isize - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
