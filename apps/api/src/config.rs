use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub rust_log: String,
    pub storage: StorageConfig,
    pub pdf_renderer_url: String,
    pub pdf_renderer_timeout_secs: u64,
    pub mail: MailConfig,
    pub queue: QueueConfig,
    pub exports: ExportConfig,
    pub alerts: AlertConfig,
    pub rate_limits: RateLimitConfig,
    pub webhooks: WebhookConfig,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local {
        root_dir: String,
        public_base_url: String,
        signing_secret: String,
    },
    S3 {
        bucket: String,
        endpoint: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub relay_url: String,
    pub relay_token: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub prefix: String,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub free_ttl_hours: i64,
    pub paid_ttl_hours: i64,
    pub download_url_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub window_minutes: i64,
    pub min_events: i64,
    pub threshold_ratio: f64,
    pub cooldown_minutes: i64,
    pub interval_secs: u64,
}

/// Fixed-window ceilings for the retry/replay endpoints.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub email_retry_limit: u64,
    pub email_retry_window_secs: u64,
    pub webhook_replay_limit: u64,
    pub webhook_replay_window_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub stripe_secret: Option<String>,
    pub lemonsqueezy_secret: Option<String>,
    pub stripe_tolerance_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let storage = match env.or("STORAGE_DRIVER", "local").as_str() {
            "local" => StorageConfig::Local {
                root_dir: env.or("LOCAL_STORAGE_DIR", "./data/exports"),
                public_base_url: env.or("PUBLIC_BASE_URL", "http://localhost:8080"),
                signing_secret: env.require("STORAGE_SIGNING_SECRET")?,
            },
            "s3" => StorageConfig::S3 {
                bucket: env.require("S3_BUCKET")?,
                endpoint: env.require("S3_ENDPOINT")?,
                region: env.or("S3_REGION", "us-east-1"),
                access_key_id: env.require("AWS_ACCESS_KEY_ID")?,
                secret_access_key: env.require("AWS_SECRET_ACCESS_KEY")?,
            },
            other => bail!("STORAGE_DRIVER must be 'local' or 's3', got '{other}'"),
        };

        let alerts = AlertConfig {
            window_minutes: env.parse_or("ALERT_WINDOW_MINUTES", 15)?,
            min_events: env.parse_or("ALERT_MIN_EVENTS", 20)?,
            threshold_ratio: env.parse_or("ALERT_THRESHOLD_RATIO", 0.25)?,
            cooldown_minutes: env.parse_or("ALERT_COOLDOWN_MINUTES", 60)?,
            interval_secs: env.positive_or("ALERT_INTERVAL_SECONDS", 60)?,
        };
        if !(0.0..=1.0).contains(&alerts.threshold_ratio) {
            bail!("ALERT_THRESHOLD_RATIO must be between 0 and 1");
        }

        let queue = QueueConfig {
            prefix: env.or("QUEUE_PREFIX", "vitae"),
            attempts: env.positive_or("QUEUE_ATTEMPTS", 3)?,
            backoff_ms: env.parse_or("QUEUE_BACKOFF_MS", 5_000)?,
            keep_completed: env.positive_or("QUEUE_KEEP_COMPLETED", 100)?,
            keep_failed: env.positive_or("QUEUE_KEEP_FAILED", 500)?,
            concurrency: env.positive_or("QUEUE_CONCURRENCY", 2)?,
            poll_interval_ms: env.parse_or("QUEUE_POLL_MS", 500)?,
        };

        Ok(Config {
            database_url: env.require("DATABASE_URL")?,
            redis_url: env.require("REDIS_URL")?,
            port: env.parse_or("PORT", 8080)?,
            rust_log: env.or("RUST_LOG", "info"),
            storage,
            pdf_renderer_url: env.require("PDF_RENDERER_URL")?,
            pdf_renderer_timeout_secs: env.parse_or("PDF_RENDERER_TIMEOUT_SECONDS", 60)?,
            mail: MailConfig {
                relay_url: env.require("MAIL_RELAY_URL")?,
                relay_token: env.optional("MAIL_RELAY_TOKEN"),
                from: env.or("MAIL_FROM", "Vitae <exports@vitae.local>"),
            },
            queue,
            exports: ExportConfig {
                free_ttl_hours: env.parse_or("EXPORT_FREE_TTL_HOURS", 24)?,
                paid_ttl_hours: env.parse_or("EXPORT_PAID_TTL_HOURS", 24 * 30)?,
                download_url_ttl_secs: env.parse_or("DOWNLOAD_URL_TTL_SECONDS", 900)?,
            },
            alerts,
            rate_limits: RateLimitConfig {
                email_retry_limit: env.parse_or("RATE_LIMIT_EMAIL_RETRY", 5)?,
                email_retry_window_secs: env.parse_or("RATE_LIMIT_EMAIL_RETRY_WINDOW", 3_600)?,
                webhook_replay_limit: env.parse_or("RATE_LIMIT_WEBHOOK_REPLAY", 5)?,
                webhook_replay_window_secs: env
                    .parse_or("RATE_LIMIT_WEBHOOK_REPLAY_WINDOW", 3_600)?,
            },
            webhooks: WebhookConfig {
                stripe_secret: env.optional("STRIPE_WEBHOOK_SECRET"),
                lemonsqueezy_secret: env.optional("LEMONSQUEEZY_WEBHOOK_SECRET"),
                stripe_tolerance_secs: env.parse_or("STRIPE_TOLERANCE_SECONDS", 300)?,
            },
            cleanup_interval_secs: env.positive_or("CLEANUP_INTERVAL_SECONDS", 3_600)?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("Required environment variable '{key}' is not set"))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key} is invalid ('{raw}'): {e}")),
        }
    }

    /// Counts and intervals where zero is meaningless.
    fn positive_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + Default + PartialEq,
        T::Err: std::fmt::Display,
    {
        let value = self.parse_or(key, default)?;
        if value == T::default() {
            bail!("{key} must be at least 1");
        }
        Ok(value)
    }
}
