mod alerts;
mod audit;
mod billing;
mod config;
mod db;
mod errors;
mod exports;
mod mailer;
mod models;
mod plans;
mod queue;
mod quota;
mod rate_limit;
mod render;
mod routes;
mod state;
mod storage;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aws_sdk_s3::config::{Credentials, Region};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::alerts::{spawn_alert_timer, AlertEvaluator};
use crate::audit::{PgSystemLog, SystemLog};
use crate::billing::{BillingDeps, BillingService, PgWebhookLedger};
use crate::config::{Config, StorageConfig};
use crate::db::create_pool;
use crate::exports::{spawn_expiry_sweep, ExportDeps, ExportService, PgExportStore};
use crate::mailer::HttpMailer;
use crate::plans::{PgPlanDirectory, PlanDirectory};
use crate::queue::{spawn_workers, JobHandler, JobQueue, QueueName, RedisJobQueue};
use crate::rate_limit::{RateLimiter, RedisCounterStore, EMAIL_RETRY, WEBHOOK_REPLAY};
use crate::render::HttpPdfRenderer;
use crate::routes::build_router;
use crate::state::AppState;
use crate::storage::{LocalDiskStorage, ObjectStorage, S3Storage};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Vitae API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Initialize Redis: job queue and rate-limit counters
    let redis = redis::Client::open(config.redis_url.clone())?;
    let queue = Arc::new(RedisJobQueue::connect(&redis, &config.queue).await?);
    for name in [QueueName::PdfRender, QueueName::EmailSend] {
        queue.recover_stalled(name).await?;
    }
    info!("Redis job queue connected (prefix: {})", config.queue.prefix);

    let limiter = RateLimiter::new(Arc::new(RedisCounterStore::new(redis.clone())))
        .with_rule(
            EMAIL_RETRY,
            config.rate_limits.email_retry_limit,
            config.rate_limits.email_retry_window_secs,
        )
        .with_rule(
            WEBHOOK_REPLAY,
            config.rate_limits.webhook_replay_limit,
            config.rate_limits.webhook_replay_window_secs,
        );

    // Initialize object storage
    let (storage, local_files): (Arc<dyn ObjectStorage>, Option<Arc<LocalDiskStorage>>) =
        match &config.storage {
            StorageConfig::Local {
                root_dir,
                public_base_url,
                signing_secret,
            } => {
                let local = Arc::new(LocalDiskStorage::new(
                    root_dir.as_str(),
                    public_base_url,
                    signing_secret.as_str(),
                ));
                info!("Local storage initialized at {root_dir}");
                (local.clone() as Arc<dyn ObjectStorage>, Some(local))
            }
            StorageConfig::S3 {
                bucket,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
            } => {
                let client =
                    build_s3_client(endpoint, region, access_key_id, secret_access_key).await;
                let s3 = S3Storage::new(client, bucket, endpoint);
                info!("S3 storage initialized (bucket: {bucket}, endpoint: {endpoint})");
                (Arc::new(s3) as Arc<dyn ObjectStorage>, None)
            }
        };

    let renderer = HttpPdfRenderer::new(
        config.pdf_renderer_url.clone(),
        Duration::from_secs(config.pdf_renderer_timeout_secs),
    )?;
    let mailer = HttpMailer::new(
        config.mail.relay_url.clone(),
        config.mail.relay_token.clone(),
        config.mail.from.clone(),
    )?;

    let log: Arc<dyn SystemLog> = Arc::new(PgSystemLog::new(db.clone()));
    let plans: Arc<dyn PlanDirectory> = Arc::new(PgPlanDirectory::new(db.clone()));
    let job_queue: Arc<dyn JobQueue> = queue.clone();

    let exports = Arc::new(ExportService::new(
        ExportDeps {
            store: Arc::new(PgExportStore::new(db.clone())),
            plans: plans.clone(),
            queue: job_queue.clone(),
            storage,
            renderer: Arc::new(renderer),
            mailer: Arc::new(mailer),
            log: log.clone(),
            limiter: limiter.clone(),
        },
        config.exports.clone(),
    ));
    let billing = Arc::new(BillingService::new(
        BillingDeps {
            ledger: Arc::new(PgWebhookLedger::new(db.clone())),
            plans,
            log: log.clone(),
            limiter,
        },
        config.webhooks.clone(),
    ));

    // Background work: queue consumers, alerting, expiry sweep
    let handler: Arc<dyn JobHandler> = exports.clone();
    let poll = Duration::from_millis(config.queue.poll_interval_ms);
    for name in [QueueName::PdfRender, QueueName::EmailSend] {
        spawn_workers(
            job_queue.clone(),
            handler.clone(),
            name,
            config.queue.concurrency,
            poll,
        );
    }
    info!(
        "Queue workers started ({} per queue)",
        config.queue.concurrency
    );

    spawn_alert_timer(
        Arc::new(AlertEvaluator::new(log, &config.alerts)),
        Duration::from_secs(config.alerts.interval_secs),
    );
    spawn_expiry_sweep(
        exports.clone(),
        Duration::from_secs(config.cleanup_interval_secs),
    );

    // Build app state
    let state = AppState {
        exports,
        billing,
        local_files,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(
    endpoint: &str,
    region: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "vitae-static");

    let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(credentials)
        .endpoint_url(endpoint)
        .load()
        .await;

    // MinIO and most S3-compatible stores only serve path-style URLs.
    let s3_config = aws_sdk_s3::config::Builder::from(&shared)
        .force_path_style(true)
        .build();
    aws_sdk_s3::Client::from_conf(s3_config)
}
