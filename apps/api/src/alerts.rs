//! Failure-rate alerting over the system log.
//!
//! Each tick counts successes and failures per channel in a trailing window,
//! and raises an alert when enough events failed often enough, unless the
//! same channel alerted within the cooldown.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::{actions, SystemLog};
use crate::config::AlertConfig;
use crate::errors::AppError;
use crate::models::audit::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub name: &'static str,
    pub success_action: &'static str,
    pub failure_action: &'static str,
}

pub const CHANNELS: [Channel; 2] = [
    Channel {
        name: "pdf-render",
        success_action: actions::PDF_RENDER_SUCCEEDED,
        failure_action: actions::PDF_RENDER_FAILED,
    },
    Channel {
        name: "email-send",
        success_action: actions::EMAIL_SENT,
        failure_action: actions::EMAIL_FAILED,
    },
];

impl Channel {
    pub fn alert_action(&self) -> String {
        format!("alert.{}", self.name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub min_events: i64,
    pub threshold_ratio: f64,
    pub cooldown: Duration,
}

impl From<&AlertConfig> for AlertPolicy {
    fn from(config: &AlertConfig) -> Self {
        Self {
            min_events: config.min_events,
            threshold_ratio: config.threshold_ratio,
            cooldown: Duration::minutes(config.cooldown_minutes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub total: i64,
    pub failures: i64,
    pub ratio: f64,
    pub candidate: bool,
    pub suppressed: bool,
    pub triggered: bool,
}

/// Pure decision over window counters and the last alert time.
pub fn evaluate(
    successes: i64,
    failures: i64,
    last_alert_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &AlertPolicy,
) -> Evaluation {
    let total = successes + failures;
    let ratio = if total > 0 {
        failures as f64 / total as f64
    } else {
        0.0
    };
    let candidate = total >= policy.min_events && total > 0 && ratio >= policy.threshold_ratio;
    let suppressed = candidate
        && last_alert_at.is_some_and(|at| now.signed_duration_since(at) < policy.cooldown);
    Evaluation {
        total,
        failures,
        ratio,
        candidate,
        suppressed,
        triggered: candidate && !suppressed,
    }
}

pub struct AlertEvaluator {
    log: Arc<dyn SystemLog>,
    policy: AlertPolicy,
    window: Duration,
}

impl AlertEvaluator {
    pub fn new(log: Arc<dyn SystemLog>, config: &AlertConfig) -> Self {
        Self {
            log,
            policy: AlertPolicy::from(config),
            window: Duration::minutes(config.window_minutes),
        }
    }

    pub async fn evaluate_channel(
        &self,
        channel: &Channel,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, AppError> {
        let start = now - self.window;
        let successes = self
            .log
            .count_between(channel.success_action, None, start, now)
            .await?;
        let failures = self
            .log
            .count_between(channel.failure_action, None, start, now)
            .await?;
        let alert_action = channel.alert_action();
        let last_alert_at = self.log.latest(&alert_action).await?.map(|row| row.created_at);

        let evaluation = evaluate(successes, failures, last_alert_at, now, &self.policy);
        info!(
            channel = channel.name,
            total = evaluation.total,
            failures = evaluation.failures,
            ratio = evaluation.ratio,
            triggered = evaluation.triggered,
            suppressed = evaluation.suppressed,
            "Failure-rate evaluation"
        );

        if evaluation.triggered {
            error!(
                channel = channel.name,
                failures = evaluation.failures,
                total = evaluation.total,
                ratio = evaluation.ratio,
                "Failure rate above threshold"
            );
            self.log
                .record(LogEntry::new(
                    alert_action,
                    None,
                    json!({
                        "channel": channel.name,
                        "total": evaluation.total,
                        "failures": evaluation.failures,
                        "ratio": evaluation.ratio,
                        "windowMinutes": self.window.num_minutes(),
                    }),
                ))
                .await?;
        }
        Ok(evaluation)
    }

    pub async fn tick(&self, now: DateTime<Utc>) {
        for channel in CHANNELS.iter() {
            if let Err(e) = self.evaluate_channel(channel, now).await {
                warn!(channel = channel.name, error = %e, "Alert evaluation failed");
            }
        }
    }
}

pub fn spawn_alert_timer(evaluator: Arc<AlertEvaluator>, interval: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            evaluator.tick(Utc::now()).await;
        }
    })
}
