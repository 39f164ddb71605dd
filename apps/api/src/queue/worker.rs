use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{JobHandler, JobPayload, JobQueue, QueueName, QueuedJob};
use crate::errors::{failure_message, AppError};

const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Retry(Duration),
    Exhausted,
}

/// Exponential backoff: `base * 2^(attempt - 1)` for the attempt that just failed.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

/// Decides what happens to `job` after its current attempt failed.
pub fn disposition(job: &QueuedJob, failure: &JobFailure) -> Disposition {
    let attempt = job.attempts_made + 1;
    if failure.retryable && attempt < job.max_attempts {
        Disposition::Retry(backoff_delay(job.backoff_ms, attempt))
    } else {
        Disposition::Exhausted
    }
}

/// Runs the handler on its own task so a panic surfaces as a failed attempt.
async fn execute(handler: Arc<dyn JobHandler>, payload: JobPayload) -> Result<(), JobFailure> {
    let task = tokio::spawn(async move {
        handler.handle(&payload).await.map_err(|e| JobFailure {
            message: failure_message(&e),
            retryable: e.is_retryable(),
        })
    });
    match task.await {
        Ok(result) => result,
        Err(join_error) => {
            error!(error = %join_error, "Job handler panicked");
            Err(JobFailure {
                message: "Unknown error".to_string(),
                retryable: true,
            })
        }
    }
}

/// Reserves and processes at most one job. Returns whether a job was found.
pub async fn run_once(
    queue: &dyn JobQueue,
    handler: Arc<dyn JobHandler>,
    name: QueueName,
) -> Result<bool, AppError> {
    let Some(job) = queue.reserve(name).await? else {
        return Ok(false);
    };

    match execute(handler.clone(), job.payload.clone()).await {
        Ok(()) => {
            queue.complete(&job).await?;
            info!(queue = name.as_str(), job_id = %job.id, attempt = job.attempts_made + 1, "Job completed");
        }
        Err(failure) => {
            let mut next = job.clone();
            next.attempts_made += 1;
            next.last_error = Some(failure.message.clone());

            match disposition(&job, &failure) {
                Disposition::Retry(delay) => {
                    warn!(
                        queue = name.as_str(),
                        job_id = %job.id,
                        attempt = next.attempts_made,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "Job failed, retrying"
                    );
                    queue.retry_later(&next, delay).await?;
                }
                Disposition::Exhausted => {
                    error!(
                        queue = name.as_str(),
                        job_id = %job.id,
                        attempts = next.attempts_made,
                        retryable = failure.retryable,
                        error = %failure.message,
                        "Job failed permanently"
                    );
                    handler.on_exhausted(&job.payload, &failure.message).await;
                    queue.bury(&next).await?;
                }
            }
        }
    }
    Ok(true)
}

/// Starts `concurrency` polling workers for one queue.
pub fn spawn_workers(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    name: QueueName,
    concurrency: usize,
    poll_interval: Duration,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker| {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                info!(queue = name.as_str(), worker, "Queue worker started");
                loop {
                    match run_once(queue.as_ref(), handler.clone(), name).await {
                        Ok(true) => continue,
                        Ok(false) => tokio::time::sleep(poll_interval).await,
                        Err(e) => {
                            warn!(queue = name.as_str(), worker, error = %e, "Queue poll failed");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            })
        })
        .collect()
}
