//! Applies verified billing events to user plans, at most once per event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::ledger::{NewWebhookEvent, WebhookLedger};
use super::signature;
use crate::audit::{actions, emit, SystemLog};
use crate::config::WebhookConfig;
use crate::errors::{failure_message, AppError};
use crate::models::audit::LogEntry;
use crate::models::billing::{
    AppliedAction, BillingWebhookEventRow, Provider, WebhookEventType, WebhookStatus,
};
use crate::plans::PlanDirectory;
use crate::rate_limit::{RateLimiter, WEBHOOK_REPLAY};

/// A webhook body after validation. The same shape is re-parsed from the
/// stored payload when a failed event is replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub event_id: String,
    pub provider: Provider,
    pub event_type: WebhookEventType,
    pub user_id: Uuid,
    pub subscription_id: Option<String>,
    pub plan_code: Option<String>,
    pub fallback_plan_code: Option<String>,
    pub effective_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookPayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("field '{0}' is missing")]
    Missing(&'static str),

    #[error("field '{0}' is invalid")]
    Invalid(&'static str),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
}

fn required_str<'a>(
    body: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, WebhookPayloadError> {
    match body.get(field) {
        None | Some(Value::Null) => Err(WebhookPayloadError::Missing(field)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(_) => Err(WebhookPayloadError::Invalid(field)),
    }
}

fn optional_str(
    body: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, WebhookPayloadError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(WebhookPayloadError::Invalid(field)),
    }
}

/// Total validation of a webhook body: either every field is well-typed or
/// the first offending field is reported.
pub fn parse_webhook_request(payload: &Value) -> Result<WebhookRequest, WebhookPayloadError> {
    let body = payload.as_object().ok_or(WebhookPayloadError::NotAnObject)?;

    let provider_raw = required_str(body, "provider")?;
    let provider = Provider::parse(provider_raw)
        .ok_or_else(|| WebhookPayloadError::UnknownProvider(provider_raw.to_string()))?;
    let type_raw = required_str(body, "type")?;
    let event_type = WebhookEventType::parse(type_raw)
        .ok_or_else(|| WebhookPayloadError::UnknownEventType(type_raw.to_string()))?;
    let user_id = Uuid::parse_str(required_str(body, "userId")?)
        .map_err(|_| WebhookPayloadError::Invalid("userId"))?;

    let effective_at = match optional_str(body, "effectiveAt")? {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|_| WebhookPayloadError::Invalid("effectiveAt"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let metadata = match body.get("metadata") {
        None | Some(Value::Null) => None,
        Some(value @ Value::Object(_)) => Some(value.clone()),
        Some(_) => return Err(WebhookPayloadError::Invalid("metadata")),
    };

    Ok(WebhookRequest {
        event_id: required_str(body, "eventId")?.to_string(),
        provider,
        event_type,
        user_id,
        subscription_id: optional_str(body, "subscriptionId")?,
        plan_code: optional_str(body, "planCode")?,
        fallback_plan_code: optional_str(body, "fallbackPlanCode")?,
        effective_at,
        metadata,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookOutcome {
    pub webhook_event_id: Uuid,
    pub status: WebhookStatus,
    pub applied: AppliedAction,
    pub replay: bool,
}

impl WebhookOutcome {
    fn recorded(row: &BillingWebhookEventRow, replay: bool) -> Self {
        Self {
            webhook_event_id: row.id,
            status: row.status(),
            applied: row.applied(),
            replay,
        }
    }
}

#[derive(Clone)]
pub struct BillingDeps {
    pub ledger: Arc<dyn WebhookLedger>,
    pub plans: Arc<dyn PlanDirectory>,
    pub log: Arc<dyn SystemLog>,
    pub limiter: RateLimiter,
}

#[derive(Clone)]
pub struct BillingService {
    ledger: Arc<dyn WebhookLedger>,
    plans: Arc<dyn PlanDirectory>,
    log: Arc<dyn SystemLog>,
    limiter: RateLimiter,
    config: WebhookConfig,
}

impl BillingService {
    pub fn new(deps: BillingDeps, config: WebhookConfig) -> Self {
        Self {
            ledger: deps.ledger,
            plans: deps.plans,
            log: deps.log,
            limiter: deps.limiter,
            config,
        }
    }

    /// Verifies, records and applies one delivery from `provider`.
    pub async fn handle(
        &self,
        provider: Provider,
        signature_header: Option<&str>,
        raw_body: &[u8],
    ) -> Result<WebhookOutcome, AppError> {
        signature::verify(
            provider,
            &self.config,
            signature_header,
            raw_body,
            Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(provider = provider.as_str(), error = %e, "Webhook signature rejected");
            AppError::Unauthorized(format!("Invalid webhook signature: {e}"))
        })?;

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| AppError::Validation(format!("Webhook body is not JSON: {e}")))?;
        let request = parse_webhook_request(&payload)
            .map_err(|e| AppError::Validation(format!("Invalid webhook payload: {e}")))?;
        if request.provider != provider {
            return Err(AppError::Validation(format!(
                "Payload provider '{}' does not match endpoint '{}'",
                request.provider.as_str(),
                provider.as_str()
            )));
        }

        let begun = self
            .ledger
            .begin(&NewWebhookEvent {
                provider,
                external_event_id: request.event_id.clone(),
                event_type: request.event_type,
                signature: signature_header.unwrap_or_default().to_string(),
                payload,
                user_id: Some(request.user_id),
            })
            .await?;

        if !begun.can_process {
            info!(
                provider = provider.as_str(),
                event_id = %request.event_id,
                status = begun.event.status().as_str(),
                "Duplicate webhook delivery"
            );
            return Ok(WebhookOutcome::recorded(&begun.event, begun.is_replay));
        }

        let applied = self.apply_and_record(&begun.event, &request).await?;
        Ok(WebhookOutcome {
            webhook_event_id: begun.event.id,
            status: WebhookStatus::Processed,
            applied,
            replay: false,
        })
    }

    /// Re-runs a FAILED event from its stored payload.
    pub async fn replay(
        &self,
        user_id: Uuid,
        webhook_event_id: Uuid,
    ) -> Result<WebhookOutcome, AppError> {
        self.limiter.enforce(WEBHOOK_REPLAY, user_id).await?;

        let row = self
            .ledger
            .find(webhook_event_id)
            .await?
            .filter(|row| row.user_id == Some(user_id))
            .ok_or_else(|| {
                AppError::NotFound(format!("Webhook event {webhook_event_id} not found"))
            })?;
        if row.status() != WebhookStatus::Failed {
            return Err(AppError::Conflict(format!(
                "Webhook event {webhook_event_id} is {} and cannot be replayed",
                row.status().as_str()
            )));
        }

        let request = parse_webhook_request(&row.payload)
            .map_err(|e| AppError::Validation(format!("Stored webhook payload is invalid: {e}")))?;
        if request.user_id != user_id || request.provider.as_str() != row.provider {
            return Err(AppError::Validation(
                "Stored webhook payload does not match its event record".to_string(),
            ));
        }

        let reclaimed = self
            .ledger
            .reclaim_failed(row.id)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!(
                    "Webhook event {webhook_event_id} is already being replayed"
                ))
            })?;

        info!(%user_id, webhook_event_id = %row.id, replay_count = reclaimed.replay_count, "Replaying webhook event");
        emit(
            self.log.as_ref(),
            LogEntry::new(
                actions::WEBHOOK_REPLAYED,
                Some(user_id),
                json!({
                    "webhookEventId": row.id,
                    "eventId": request.event_id,
                    "replayCount": reclaimed.replay_count,
                }),
            ),
        )
        .await;

        let applied = self.apply_and_record(&reclaimed, &request).await?;
        Ok(WebhookOutcome {
            webhook_event_id: reclaimed.id,
            status: WebhookStatus::Processed,
            applied,
            replay: true,
        })
    }

    async fn apply_and_record(
        &self,
        row: &BillingWebhookEventRow,
        request: &WebhookRequest,
    ) -> Result<AppliedAction, AppError> {
        match self.apply(request, Utc::now()).await {
            Ok(applied) => {
                if self.ledger.mark_processed(row.id, applied).await?.is_none() {
                    warn!(webhook_event_id = %row.id, "Webhook event left PROCESSING concurrently");
                }
                info!(
                    webhook_event_id = %row.id,
                    event_type = request.event_type.as_str(),
                    applied = applied.as_str(),
                    "Webhook event processed"
                );
                emit(
                    self.log.as_ref(),
                    LogEntry::new(
                        actions::WEBHOOK_PROCESSED,
                        Some(request.user_id),
                        json!({
                            "webhookEventId": row.id,
                            "eventId": request.event_id,
                            "type": request.event_type.as_str(),
                            "applied": applied.as_str(),
                        }),
                    ),
                )
                .await;
                Ok(applied)
            }
            Err(e) => {
                let reason = failure_message(&e);
                error!(webhook_event_id = %row.id, error = %reason, "Webhook event failed");
                if let Err(mark) = self.ledger.mark_failed(row.id, &reason).await {
                    error!(webhook_event_id = %row.id, error = %mark, "Failed to mark webhook event failed");
                }
                emit(
                    self.log.as_ref(),
                    LogEntry::new(
                        actions::WEBHOOK_FAILED,
                        Some(request.user_id),
                        json!({
                            "webhookEventId": row.id,
                            "eventId": request.event_id,
                            "error": reason,
                        }),
                    ),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn resolve_plan(&self, code: &str) -> Result<Uuid, AppError> {
        self.plans
            .resolve_plan_code(code)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Unknown plan code '{code}'")))
    }

    /// The business effect of an event. Called only by the ledger winner.
    async fn apply(
        &self,
        request: &WebhookRequest,
        now: DateTime<Utc>,
    ) -> Result<AppliedAction, AppError> {
        match request.event_type {
            WebhookEventType::SubscriptionCreated
            | WebhookEventType::SubscriptionUpdated
            | WebhookEventType::SubscriptionRenewed => {
                let Some(code) = &request.plan_code else {
                    return Ok(AppliedAction::None);
                };
                let plan_id = self.resolve_plan(code).await?;
                self.plans.change_plan_now(request.user_id, plan_id).await?;
                Ok(AppliedAction::PlanChanged)
            }
            WebhookEventType::SubscriptionCanceled => {
                let Some(code) = &request.fallback_plan_code else {
                    return Ok(AppliedAction::None);
                };
                let plan_id = self.resolve_plan(code).await?;
                match request.effective_at {
                    Some(effective_at) if effective_at > now => {
                        self.plans
                            .schedule_plan_change(request.user_id, plan_id, effective_at)
                            .await?;
                        Ok(AppliedAction::PlanScheduled)
                    }
                    _ => {
                        self.plans.change_plan_now(request.user_id, plan_id).await?;
                        Ok(AppliedAction::PlanChanged)
                    }
                }
            }
        }
    }
}
