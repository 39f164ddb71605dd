//! Fixed-window rate limiter keyed by `action:user_id`.
//!
//! The counter store being unreachable is reported as its own outcome and
//! treated as allowed: these guards protect retry/replay endpoints, where
//! availability wins over strict limiting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::RedisResult;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::AppError;

pub const EMAIL_RETRY: &str = "export_email_retry";
pub const WEBHOOK_REPLAY: &str = "billing_webhook_replay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed { count: u64 },
    Denied { retry_after_secs: u64 },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    pub count: u64,
    /// Seconds until the window resets; negative when the store reports no TTL.
    pub ttl_secs: i64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key`, starting a `window_secs` TTL on the first hit.
    async fn increment(&self, key: &str, window_secs: u64) -> RedisResult<WindowCount>;
}

pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window_secs: u64) -> RedisResult<WindowCount> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        let ttl_secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(WindowCount { count, ttl_secs })
    }
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    limit: u64,
    window_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    rules: HashMap<&'static str, Rule>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            rules: HashMap::new(),
        }
    }

    pub fn with_rule(mut self, action: &'static str, limit: u64, window_secs: u64) -> Self {
        self.rules.insert(action, Rule { limit, window_secs });
        self
    }

    pub async fn check(&self, action: &str, user_id: Uuid) -> RateLimitOutcome {
        let Some(rule) = self.rules.get(action).copied() else {
            return RateLimitOutcome::Allowed { count: 0 };
        };

        let key = format!("ratelimit:{action}:{user_id}");
        match self.store.increment(&key, rule.window_secs).await {
            Ok(window) if window.count > rule.limit => RateLimitOutcome::Denied {
                retry_after_secs: if window.ttl_secs > 0 {
                    window.ttl_secs as u64
                } else {
                    rule.window_secs
                },
            },
            Ok(window) => RateLimitOutcome::Allowed {
                count: window.count,
            },
            Err(e) => RateLimitOutcome::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    /// Maps the outcome onto the request path: denied requests fail, an
    /// unreachable store lets the request through.
    pub async fn enforce(&self, action: &str, user_id: Uuid) -> Result<(), AppError> {
        match self.check(action, user_id).await {
            RateLimitOutcome::Allowed { count } => {
                debug!(action, %user_id, count, "Rate limit check passed");
                Ok(())
            }
            RateLimitOutcome::Denied { retry_after_secs } => {
                warn!(action, %user_id, retry_after_secs, "Rate limit exceeded");
                Err(AppError::TooManyRequests { retry_after_secs })
            }
            RateLimitOutcome::Unavailable { reason } => {
                warn!(action, %user_id, reason = %reason, "Rate limiter unavailable, allowing request");
                Ok(())
            }
        }
    }
}
